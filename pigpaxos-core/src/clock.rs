//! Clock collaborator interface.
//!
//! The hybrid logical clock used by the optional retro-log is an external
//! collaborator (§1); this crate only needs monotonic wall-clock time for
//! timeouts and gray-list expiry, abstracted so tests can drive it
//! deterministically (§8).

use std::time::{Duration, Instant};

/// A source of monotonic time. The real implementation ([`SystemClock`])
/// wraps [`Instant::now`]; tests use a virtual clock they advance by hand.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// The default, wall-clock-backed [`Clock`].
#[derive(Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Milliseconds elapsed since `since`, saturating at zero.
pub fn elapsed_ms(since: Instant, now: Instant) -> u64 {
    now.saturating_duration_since(since).as_millis() as u64
}

/// Convenience for comparing an age against a millisecond threshold.
pub fn older_than(since: Instant, now: Instant, threshold: Duration) -> bool {
    now.saturating_duration_since(since) >= threshold
}
