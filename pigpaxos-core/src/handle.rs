//! The client handle a log entry remembers so a reply can be delivered
//! once its slot is executed (§3 `request` field).

use tokio::sync::oneshot;

use crate::command::Reply;

/// One-shot delivery path back to whichever task is holding a client's
/// connection, local to this process. Never serialized: a request that
/// arrived over the wire from another node's forward (§4.9) has no local
/// handle and `request` stays `None`.
#[derive(Debug)]
pub struct ReplyHandle(oneshot::Sender<Reply>);

impl ReplyHandle {
    pub fn new() -> (Self, oneshot::Receiver<Reply>) {
        let (tx, rx) = oneshot::channel();
        (ReplyHandle(tx), rx)
    }

    /// Delivers `reply`. A dropped receiver (the client gave up) is not an
    /// error worth reporting.
    pub fn reply(self, reply: Reply) {
        let _ = self.0.send(reply);
    }
}
