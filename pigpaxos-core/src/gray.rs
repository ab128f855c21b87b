//! Gray-list: a time-bounded set of peers considered slow or unreachable
//! for routing purposes only (§3, §4.6).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use log::info;

use crate::clock::older_than;
use crate::id::Id;

/// Default gray timeout: `GrayTimeoutMultiplier (1000) * TickerDuration
/// (10ms)` in the original source.
pub const DEFAULT_GRAY_TIMEOUT: Duration = Duration::from_millis(10_000);

/// First-failure timestamp per gray-listed peer. Guarded by its own lock
/// in the replica (§5), separate from the Paxos state lock, so routing
/// decisions never contend with protocol mutation.
#[derive(Default)]
pub struct GrayList {
    entries: HashMap<Id, Instant>,
    timeout: Duration,
}

impl GrayList {
    pub fn new(timeout: Duration) -> Self {
        GrayList {
            entries: HashMap::new(),
            timeout,
        }
    }

    /// Marks `id` gray as of `now`. Idempotent: a peer already gray keeps
    /// its original failure time.
    pub fn mark(&mut self, id: Id, now: Instant) {
        self.entries.entry(id).or_insert(now);
    }

    pub fn is_gray(&self, id: Id) -> bool {
        self.entries.contains_key(&id)
    }

    /// Drops entries older than the configured timeout (ticker step, §4.8).
    pub fn expire(&mut self, now: Instant) {
        let timeout = self.timeout;
        self.entries.retain(|id, since| {
            let expired = older_than(*since, now, timeout);
            if expired {
                info!("removing node {} from gray list on timeout", id);
            }
            !expired
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_then_query() {
        let mut g = GrayList::new(DEFAULT_GRAY_TIMEOUT);
        let id = Id::new(1, 1);
        assert!(!g.is_gray(id));
        g.mark(id, Instant::now());
        assert!(g.is_gray(id));
    }

    #[test]
    fn expires_after_timeout() {
        let mut g = GrayList::new(Duration::from_millis(10));
        let id = Id::new(1, 1);
        let t0 = Instant::now();
        g.mark(id, t0);
        g.expire(t0 + Duration::from_millis(5));
        assert!(g.is_gray(id));
        g.expire(t0 + Duration::from_millis(11));
        assert!(!g.is_gray(id));
    }
}
