//! Wire message types (§3, §6).
//!
//! Mirrors the shape of `original_source/chainpaxos/msg.go`: a handful
//! of small structs plus a closed sum type dispatched by a single
//! handler, rather than any dynamic dispatch.

use serde::{Deserialize, Serialize};

use crate::ballot::Ballot;
use crate::command::{Command, Reply};
use crate::id::Id;

/// Prepare message: `{ballot}`, broadcast by a newly-candidate leader.
#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
pub struct P1a {
    pub ballot: Ballot,
}

/// Promise message. `log` maps slot to the highest-ballot accepted command
/// not yet committed, restricted to slots `>= execute` (§4.3).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct P1b {
    pub id: Id,
    pub ballot: Ballot,
    pub log: Vec<(u64, Ballot, Command)>,
}

/// Accept message for one slot, piggybacking the most recently committed
/// slots (`p3`) and the sender's cluster-wide execute watermark.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct P2a {
    pub ballot: Ballot,
    pub slot: u64,
    pub global_execute: u64,
    pub command: Command,
    pub p3: Option<P3>,
}

/// Accepted message. An empty `id` list on a stale-ballot reply carries the
/// replier's current (higher) ballot instead of a vote.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct P2b {
    pub ballot: Ballot,
    pub slot: u64,
    pub id: Vec<Id>,
}

/// Compact relay reply for P2b: complements the group's membership against
/// `missing_ids` rather than listing voters directly (§4.5).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct P2bAggregated {
    pub ballot: Ballot,
    pub slot: u64,
    pub relay_last_execute: u64,
    pub relay_id: Id,
    pub missing_ids: Vec<Id>,
}

/// Commit notification: the list of slots now known to be committed.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct P3 {
    pub ballot: Ballot,
    pub slots: Vec<u64>,
}

/// Sent by a follower whose `execute` watermark has been stuck too long.
#[derive(Copy, Clone, Debug, Serialize, Deserialize)]
pub struct P3RecoverRequest {
    pub ballot: Ballot,
    pub slot: u64,
    pub from: Id,
}

/// Leader's answer to a [`P3RecoverRequest`], sourced from its log or
/// `old_ballots` history.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct P3RecoverReply {
    pub ballot: Ballot,
    pub slot: u64,
    pub command: Command,
}

/// Client request, carried over the wire to whichever node receives it;
/// local delivery attaches a [`crate::frontend::ReplyHandle`] that never
/// gets serialized.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Request {
    pub command: Command,
}

/// The closed set of payloads a [`RoutedMsg`] can carry while traversing
/// the relay tree. `P1bBatch` is the flattened form sent back to the root
/// (§4.5: "send a flat vector of P1bs" when `progress == 0`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RoutedPayload {
    P1a(P1a),
    P1b(P1b),
    P1bBatch(Vec<P1b>),
    P2a(P2a),
    P2b(P2b),
    P3(P3),
}

/// A message routed through the two-level relay tree (§3, §4.5).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RoutedMsg {
    pub hops: Vec<Id>,
    pub is_forward: bool,
    pub progress: u8,
    pub payload: RoutedPayload,
}

impl RoutedMsg {
    /// `hops[progress]`, the current relay.
    pub fn last_progress_hop(&self) -> Id {
        self.hops[self.progress as usize]
    }

    /// `hops[progress - 1]`, the hop the message just came from.
    pub fn previous_progress_hop(&self) -> Id {
        self.hops[self.progress as usize - 1]
    }
}

/// Every message type a node can send or receive, used by the transport
/// layer to frame and by the replica to dispatch by type (§6).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum WireMessage {
    Request(Request),
    Reply(Reply),
    /// A bare P1a sent directly (not through the relay tree) to nack a
    /// prior ballot owner when a relay short-circuits (§4.5 step 2), or
    /// (in the flat replica variant, §4.10) an ordinary phase-1 prepare.
    P1a(P1a),
    /// A bare P2a, used only by the flat (non-relayed) replica variant
    /// (§4.10); the layered replica always wraps P2a in a [`RoutedMsg`].
    P2a(P2a),
    P1b(P1b),
    P1bBatch(Vec<P1b>),
    P2b(P2b),
    P2bAggregated(P2bAggregated),
    P3(P3),
    P3RecoverRequest(P3RecoverRequest),
    P3RecoverReply(P3RecoverReply),
    Routed(RoutedMsg),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandId, CommandKind};

    fn sample_command() -> Command {
        Command {
            key: "k".into(),
            value: "v".into(),
            kind: CommandKind::Put,
            id: CommandId {
                client: Id::new(1, 1),
                seq: 1,
            },
        }
    }

    #[test]
    fn wire_message_round_trips_through_json() {
        let msg = WireMessage::Routed(RoutedMsg {
            hops: vec![Id::new(1, 1), Id::new(1, 2)],
            is_forward: true,
            progress: 1,
            payload: RoutedPayload::P2a(P2a {
                ballot: Ballot::new(1, Id::new(1, 1)),
                slot: 4,
                global_execute: 0,
                command: sample_command(),
                p3: None,
            }),
        });
        let encoded = serde_json::to_string(&msg).unwrap();
        let decoded: WireMessage = serde_json::from_str(&encoded).unwrap();
        match decoded {
            WireMessage::Routed(r) => {
                assert_eq!(r.progress, 1);
                assert!(r.is_forward);
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn routed_msg_hop_accessors() {
        let m = RoutedMsg {
            hops: vec![Id::new(1, 1), Id::new(1, 2), Id::new(1, 3)],
            is_forward: true,
            progress: 2,
            payload: RoutedPayload::P3(P3::default()),
        };
        assert_eq!(m.last_progress_hop(), Id::new(1, 3));
        assert_eq!(m.previous_progress_hop(), Id::new(1, 2));
    }
}
