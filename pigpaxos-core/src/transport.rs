//! The transport collaborator interface (§1, §6).
//!
//! Physical transport (TCP framing, connection pooling) is out of scope for
//! this crate; only the interface the core needs is specified here. See
//! the `pigpaxos` binary crate for a reference implementation.

use async_trait::async_trait;

use crate::error::Result;
use crate::id::Id;
use crate::messages::WireMessage;

/// What a replica needs from its networking layer.
///
/// A `send` failure must not propagate to the protocol layer: callers
/// gray-list the destination and treat it as non-voting for the current
/// round (§6, §7). Implementations must not block the caller across the
/// replica's state lock; `send` is always invoked after mutation, with
/// the lock already released.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends `msg` to `to`. Never sent to `self`: self-sends are dispatched
    /// in-process by the replica without calling into the transport.
    async fn send(&self, to: Id, msg: WireMessage) -> Result<()>;
}
