//! Commit dissemination & recovery (§4.7): turns a stuck `execute`
//! watermark into a [`P3RecoverRequest`], and answers one from the
//! leader's log or `old_ballots` history.

use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::id::Id;
use crate::messages::{P3RecoverReply, P3RecoverRequest};
use crate::paxos::PaxosCore;

/// How long `execute` may sit still before a follower asks the leader to
/// resend the slot it is stuck on (`--rto` in the original source).
pub const DEFAULT_RECOVERY_TIMEOUT: Duration = Duration::from_millis(1_000);

/// Tracks whether `execute` has moved since the last ticker round, so a
/// follower only emits one recovery request per stall rather than one
/// per tick.
pub struct RecoveryWatch {
    last_seen_execute: u64,
    stalled_since: Instant,
    timeout: Duration,
    requested: bool,
}

impl RecoveryWatch {
    pub fn new(timeout: Duration, now: Instant) -> Self {
        RecoveryWatch {
            last_seen_execute: 0,
            stalled_since: now,
            timeout,
            requested: false,
        }
    }

    /// Called every ticker round (§4.8 step 4). Returns a
    /// [`P3RecoverRequest`] the first time the watermark has been stuck
    /// past `timeout`, `None` otherwise.
    pub fn poll(&mut self, self_id: Id, paxos: &PaxosCore, now: Instant) -> Option<P3RecoverRequest> {
        let execute = paxos.log.execute;
        if execute != self.last_seen_execute {
            self.last_seen_execute = execute;
            self.stalled_since = now;
            self.requested = false;
            return None;
        }
        if self.requested {
            return None;
        }
        if now.saturating_duration_since(self.stalled_since) < self.timeout {
            return None;
        }
        self.requested = true;
        warn!("execute stuck at {} for {:?}, requesting recovery", execute, self.timeout);
        Some(P3RecoverRequest {
            ballot: paxos.ballot,
            slot: execute,
            from: self_id,
        })
    }
}

/// Leader side of recovery (§4.7): answers from the current log entry if
/// it covers `slot`, else from that entry's `old_ballots` history at or
/// below the requested ballot. Idempotent — answering twice is harmless.
pub fn handle_recover_request(paxos: &PaxosCore, req: P3RecoverRequest) -> Option<P3RecoverReply> {
    let entry = paxos.log.get(req.slot)?;
    if entry.ballot <= req.ballot {
        return Some(P3RecoverReply {
            ballot: entry.ballot,
            slot: req.slot,
            command: entry.command.clone(),
        });
    }
    entry
        .old_ballots
        .iter()
        .rev()
        .find(|(ballot, _)| *ballot <= req.ballot)
        .map(|(ballot, command)| P3RecoverReply {
            ballot: *ballot,
            slot: req.slot,
            command: command.clone(),
        })
}

/// Follower side: re-applies the recovered command directly at its slot,
/// bypassing the normal accept path, and advances `execute` if this was
/// the slot it was stuck on.
pub fn apply_recover_reply(paxos: &mut PaxosCore, reply: P3RecoverReply) {
    if let Some(entry) = paxos.log.get(reply.slot) {
        if entry.commit {
            debug!("recovery reply for already-committed slot {}", reply.slot);
            return;
        }
    }
    paxos.apply_recovered(reply.slot, reply.ballot, reply.command);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ballot::Ballot;
    use crate::command::{Command, CommandId, CommandKind};
    use crate::statemachine::KvStore;

    fn put(owner: Id, seq: u64, key: &str, value: &str) -> Command {
        Command {
            key: key.into(),
            value: value.into(),
            kind: CommandKind::Put,
            id: CommandId { client: owner, seq },
        }
    }

    #[test]
    fn recovery_watch_fires_once_after_timeout() {
        let id = Id::new(1, 1);
        let mut paxos = PaxosCore::new(id, 3, Box::new(KvStore::default()));
        let t0 = Instant::now();
        let mut watch = RecoveryWatch::new(Duration::from_millis(10), t0);

        assert!(watch.poll(id, &paxos, t0).is_none());
        assert!(watch.poll(id, &paxos, t0 + Duration::from_millis(5)).is_none());
        let req = watch.poll(id, &paxos, t0 + Duration::from_millis(11));
        assert!(req.is_some());
        assert!(watch.poll(id, &paxos, t0 + Duration::from_millis(20)).is_none());

        paxos.log.execute = 2;
        assert!(watch.poll(id, &paxos, t0 + Duration::from_millis(25)).is_none());
    }

    #[test]
    fn recover_request_answered_from_current_log_entry() {
        let id = Id::new(1, 1);
        let mut paxos = PaxosCore::new(id, 3, Box::new(KvStore::default()));
        paxos.active = true;
        paxos.ballot = Ballot::new(1, id);
        let p2a = paxos.propose(put(id, 1, "k", "v"), None);

        let req = P3RecoverRequest {
            ballot: p2a.ballot,
            slot: p2a.slot,
            from: Id::new(1, 2),
        };
        let reply = handle_recover_request(&paxos, req).unwrap();
        assert_eq!(reply.command.key, "k");
    }
}
