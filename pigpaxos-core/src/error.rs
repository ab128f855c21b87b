//! Error taxonomy (§7), grounded in `ddbb_libs::{Error, Result}`.

use crate::id::Id;

/// Crate-wide error type. Protocol-level anomalies named in §7 (stale
/// ballot, higher ballot observed, aggregation collision, timeouts,
/// missing slot) are *not* represented here: they are handled as in-line
/// state transitions, never as exceptions that leave a handler.
#[derive(Debug, thiserror::Error)]
pub enum PigpaxosError {
    #[error("failed to send to {to}: {source}")]
    Transport {
        to: Id,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("no address configured for node {0}")]
    UnknownPeer(Id),

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("failed to (de)serialize message: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PigpaxosError>;
