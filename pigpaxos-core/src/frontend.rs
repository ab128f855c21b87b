//! Request front-end (§4.9): decides whether an incoming client command
//! takes the read-path shortcut, enters the Paxos core directly (this
//! node is leader, or no leader yet), or must be forwarded.

use crate::command::{Command, ReadReply};
use crate::handle::ReplyHandle;
use crate::id::Id;
use crate::messages::{P2a, Request, WireMessage};
use crate::paxos::PaxosCore;

/// What the replica glue should do with an inbound client command, after
/// the front-end has made its routing decision.
pub enum Decision {
    /// Read satisfied locally, nothing to send.
    ReadReply(ReadReply),
    /// This node is (or is becoming) the Paxos leader: the `P2a` below
    /// must be broadcast through the relay tree.
    Proposed(P2a),
    /// Not the leader: forward the raw request to `leader` and deliver
    /// whatever comes back to `request` once it arrives.
    Forward { leader: Id, request: Request },
}

/// `true` when the configured read policy (§6 `policy` field) allows the
/// in-process read-path shortcut rather than going through Paxos.
pub fn read_policy_applies(policy: &str) -> bool {
    matches!(policy, "majority" | "leader" | "any")
}

/// Routes one client command (§4.9).
///
/// `request` is `Some` only for locally originated commands (§3); a
/// command arriving via a peer's [`Request`] forward has already been
/// dispatched once and is re-entered with `request = None`.
///
/// `stable_leader` mirrors the original source's `stableLeader`/
/// `ephemeralLeader` flags: when `false`, a node always drives consensus
/// itself rather than forwarding to a leader it already knows about.
pub fn route(
    paxos: &mut PaxosCore,
    policy: &str,
    stable_leader: bool,
    command: Command,
    request: Option<ReplyHandle>,
) -> Decision {
    if command.is_read() && read_policy_applies(policy) {
        return Decision::ReadReply(paxos.read(&command));
    }

    if !stable_leader || paxos.is_leader() || paxos.leader().is_nil() {
        return Decision::Proposed(paxos.propose(command, request));
    }

    Decision::Forward {
        leader: paxos.leader(),
        request: Request { command },
    }
}

/// Wraps a forwarded request as the wire message to actually send.
pub fn forward_message(request: Request) -> WireMessage {
    WireMessage::Request(request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ballot::Ballot;
    use crate::command::CommandId;
    use crate::statemachine::KvStore;

    fn core(id: Id, size: usize) -> PaxosCore {
        PaxosCore::new(id, size, Box::new(KvStore::default()))
    }

    #[test]
    fn write_enters_core_when_leader() {
        let id = Id::new(1, 1);
        let mut p = core(id, 3);
        p.active = true;
        p.ballot = Ballot::new(1, id);
        let cmd = Command::put(CommandId { client: id, seq: 1 }, "k", "v");
        match route(&mut p, "majority", true, cmd, None) {
            Decision::Proposed(p2a) => assert_eq!(p2a.slot, 1),
            _ => panic!("expected Proposed"),
        }
    }

    #[test]
    fn write_forwards_to_known_leader_when_not_leader_and_stable() {
        let id = Id::new(1, 1);
        let leader = Id::new(1, 2);
        let mut p = core(id, 3);
        p.ballot = Ballot::new(1, leader);
        let cmd = Command::put(CommandId { client: id, seq: 1 }, "k", "v");
        match route(&mut p, "majority", true, cmd, None) {
            Decision::Forward { leader: l, .. } => assert_eq!(l, leader),
            _ => panic!("expected Forward"),
        }
    }

    #[test]
    fn write_enters_core_when_not_leader_and_unstable() {
        let id = Id::new(1, 1);
        let leader = Id::new(1, 2);
        let mut p = core(id, 3);
        p.ballot = Ballot::new(1, leader);
        let cmd = Command::put(CommandId { client: id, seq: 1 }, "k", "v");
        match route(&mut p, "majority", false, cmd, None) {
            Decision::Proposed(_) => {}
            _ => panic!("expected Proposed when stable_leader is false"),
        }
    }

    #[test]
    fn read_with_majority_policy_is_answered_locally() {
        let id = Id::new(1, 1);
        let mut p = core(id, 3);
        let cmd = Command::get(CommandId { client: id, seq: 1 }, "k");
        match route(&mut p, "majority", true, cmd, None) {
            Decision::ReadReply(_) => {}
            _ => panic!("expected ReadReply"),
        }
    }

    #[test]
    fn write_enters_core_when_no_leader_known_yet() {
        let id = Id::new(1, 1);
        let mut p = core(id, 3);
        let cmd = Command::put(CommandId { client: id, seq: 1 }, "k", "v");
        match route(&mut p, "majority", true, cmd, None) {
            Decision::Proposed(_) => {}
            _ => panic!("expected Proposed when no leader known yet"),
        }
    }
}
