//! The routed-message router (§4.5): forward propagation, per-relay
//! response aggregation, and back-propagation through the two-level
//! relay tree. Pure state + decision logic; the replica performs the
//! actual sends `Outbound` describes, outside the state lock (§5).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use log::debug;

use crate::gray::GrayList;
use crate::id::Id;
use crate::messages::{
    P1a, P1b, P2a, P2b, P2bAggregated, RoutedMsg, RoutedPayload, WireMessage,
};
use crate::paxos::PaxosCore;
use crate::relay::RelayGroups;

/// A single message the replica must send once it has released its
/// state lock.
#[derive(Debug, Clone)]
pub struct Outbound {
    pub to: Id,
    pub msg: WireMessage,
}

impl Outbound {
    fn new(to: Id, msg: WireMessage) -> Self {
        Outbound { to, msg }
    }
}

struct P1bRelayState {
    ballot: crate::ballot::Ballot,
    hops: Vec<Id>,
    progress: u8,
    received: Vec<P1b>,
    started_at: Instant,
}

struct P2bRelayState {
    ballot: crate::ballot::Ballot,
    hops: Vec<Id>,
    progress: u8,
    voters: Vec<Id>,
    started_at: Instant,
}

/// Per-replica relay-aggregation state: at most one outstanding P1
/// aggregation, and one P2 aggregation per slot (§3 invariant 6).
pub struct Router {
    pub max_depth: u8,
    pub use_small_p2b: bool,
    p1b_relay: Option<P1bRelayState>,
    p2b_relays: HashMap<u64, P2bRelayState>,
}

impl Router {
    pub fn new(max_depth: u8, use_small_p2b: bool) -> Self {
        Router {
            max_depth,
            use_small_p2b,
            p1b_relay: None,
            p2b_relays: HashMap::new(),
        }
    }

    /// Leader-side entry point (§4.4 + §4.5 combined): picks one relay per
    /// group and sends each a depth-0 forward `RoutedMsg`.
    pub fn broadcast(
        &self,
        self_id: Id,
        relay_groups: &RelayGroups,
        gray: &GrayList,
        payload: RoutedPayload,
    ) -> Vec<Outbound> {
        let mut out = Vec::new();
        for i in 0..relay_groups.num_groups() {
            match relay_groups.pick_relay(i, self_id, gray) {
                Some(relay_id) => {
                    let msg = RoutedMsg {
                        hops: vec![self_id],
                        is_forward: true,
                        progress: 0,
                        payload: payload.clone(),
                    };
                    out.push(Outbound::new(relay_id, WireMessage::Routed(msg)));
                }
                None => {
                    debug!("relay group {} has no usable relay (all gray)", i);
                }
            }
        }
        out
    }

    /// Dispatches an inbound `RoutedMsg`, mutating relay-aggregation state
    /// and the Paxos core, and returning whatever must be sent next.
    pub fn handle_routed_msg(
        &mut self,
        msg: RoutedMsg,
        self_id: Id,
        relay_groups: &RelayGroups,
        gray: &GrayList,
        paxos: &mut PaxosCore,
        now: Instant,
    ) -> Vec<Outbound> {
        if msg.is_forward {
            self.handle_forward(msg, self_id, relay_groups, gray, paxos, now)
        } else {
            let mut out = Vec::new();
            match msg.payload {
                RoutedPayload::P1b(p1b) => self.accumulate_p1b(p1b, relay_groups, &mut out),
                RoutedPayload::P1bBatch(batch) => {
                    for p1b in batch {
                        self.accumulate_p1b(p1b, relay_groups, &mut out);
                    }
                }
                RoutedPayload::P2b(p2b) => {
                    self.accumulate_p2b(p2b, self_id, relay_groups, paxos, &mut out)
                }
                _ => {}
            }
            out
        }
    }

    fn handle_forward(
        &mut self,
        mut msg: RoutedMsg,
        self_id: Id,
        relay_groups: &RelayGroups,
        gray: &GrayList,
        paxos: &mut PaxosCore,
        now: Instant,
    ) -> Vec<Outbound> {
        let mut out = Vec::new();
        let need_to_propagate = match msg.payload.clone() {
            RoutedPayload::P1a(p1a) => {
                self.handle_p1a_relay(p1a, &msg, self_id, relay_groups, paxos, now, &mut out)
            }
            RoutedPayload::P2a(p2a) => {
                self.handle_p2a_relay(p2a, &msg, self_id, relay_groups, paxos, now, &mut out)
            }
            RoutedPayload::P3(p3) => {
                paxos.apply_p3(&p3);
                true
            }
            _ => false,
        };

        if (msg.progress as usize + 1 < self.max_depth as usize) && need_to_propagate {
            let direct_sender = msg.hops[msg.progress as usize];
            msg.progress += 1;
            msg.hops.push(self_id);
            let home_group = relay_groups.home_group();
            for &id in &home_group.nodes {
                if id == self_id || id == direct_sender || gray.is_gray(id) {
                    continue;
                }
                out.push(Outbound::new(id, WireMessage::Routed(msg.clone())));
            }
        }
        out
    }

    /// §4.5 "P1a at relay".
    fn handle_p1a_relay(
        &mut self,
        m: P1a,
        routed: &RoutedMsg,
        self_id: Id,
        relay_groups: &RelayGroups,
        paxos: &mut PaxosCore,
        now: Instant,
        out: &mut Vec<Outbound>,
    ) -> bool {
        let old_ballot = paxos.ballot;
        let mut need_to_propagate = false;

        if old_ballot < m.ballot && (routed.progress as usize + 1) < self.max_depth as usize {
            if self.p1b_relay.is_some() {
                debug!("short-circuiting p1a relay: old={} new={}", old_ballot, m.ballot);
                out.push(Outbound::new(old_ballot.id(), WireMessage::P1a(m)));
            }
            self.p1b_relay = Some(P1bRelayState {
                ballot: m.ballot,
                hops: routed.hops.clone(),
                progress: routed.progress,
                received: Vec::new(),
                started_at: now,
            });
            need_to_propagate = true;
        }

        let p1b = paxos.handle_p1a(m);
        if (routed.progress as usize + 1) == self.max_depth as usize {
            out.push(Outbound::new(
                routed.last_progress_hop(),
                WireMessage::Routed(RoutedMsg {
                    hops: routed.hops.clone(),
                    is_forward: false,
                    progress: routed.progress,
                    payload: RoutedPayload::P1b(p1b),
                }),
            ));
        } else {
            // Self-loop: cast our own vote into the aggregation we just
            // installed, exactly as if it had arrived from a leaf.
            self.accumulate_p1b(p1b, relay_groups, out);
        }

        need_to_propagate
    }

    fn accumulate_p1b(&mut self, p1b: P1b, relay_groups: &RelayGroups, out: &mut Vec<Outbound>) {
        let Some(state) = self.p1b_relay.as_mut() else {
            debug!("unknown p1b ballot to relay; may already have been replied");
            return;
        };
        state.received.push(p1b);
        if !self.ready_to_relay_p1b(relay_groups) {
            return;
        }
        let state = self.p1b_relay.take().unwrap();
        let upstream = state.hops[state.progress as usize];
        if state.progress == 0 {
            out.push(Outbound::new(upstream, WireMessage::P1bBatch(state.received)));
        } else {
            out.push(Outbound::new(
                upstream,
                WireMessage::Routed(RoutedMsg {
                    hops: state.hops,
                    is_forward: false,
                    progress: state.progress,
                    payload: RoutedPayload::P1bBatch(state.received),
                }),
            ));
        }
    }

    fn ready_to_relay_p1b(&self, relay_groups: &RelayGroups) -> bool {
        let state = self.p1b_relay.as_ref().expect("checked by caller");
        let group_len = relay_groups.home_group().nodes.len();
        if state.received.len() == group_len / 2 + 1 {
            return true;
        }
        if state.received.len() == group_len / 2 {
            return relay_groups.home_group().nodes.contains(&state.ballot.id());
        }
        false
    }

    /// §4.5 "P2a at relay".
    fn handle_p2a_relay(
        &mut self,
        m: P2a,
        routed: &RoutedMsg,
        self_id: Id,
        relay_groups: &RelayGroups,
        paxos: &mut PaxosCore,
        now: Instant,
        out: &mut Vec<Outbound>,
    ) -> bool {
        if (routed.progress as usize + 1) == self.max_depth as usize {
            let p2b = paxos.handle_p2a(m);
            out.push(Outbound::new(
                routed.last_progress_hop(),
                WireMessage::Routed(RoutedMsg {
                    hops: routed.hops.clone(),
                    is_forward: false,
                    progress: routed.progress,
                    payload: RoutedPayload::P2b(p2b),
                }),
            ));
            return true;
        }

        match self.p2b_relays.get(&m.slot) {
            None => self.install_p2b_relay(m.slot, m.ballot, routed, now),
            Some(existing) if existing.ballot < m.ballot => {
                out.push(Outbound::new(
                    existing.ballot.id(),
                    WireMessage::P2b(P2b {
                        ballot: m.ballot,
                        slot: m.slot,
                        id: Vec::new(),
                    }),
                ));
                self.install_p2b_relay(m.slot, m.ballot, routed, now);
            }
            Some(existing) if existing.ballot > m.ballot => {
                out.push(Outbound::new(
                    m.ballot.id(),
                    WireMessage::P2b(P2b {
                        ballot: existing.ballot,
                        slot: m.slot,
                        id: Vec::new(),
                    }),
                ));
            }
            Some(_) => {}
        }

        let p2b = paxos.handle_p2a(m);
        self.accumulate_p2b(p2b, self_id, relay_groups, paxos, out);
        true
    }

    fn install_p2b_relay(&mut self, slot: u64, ballot: crate::ballot::Ballot, routed: &RoutedMsg, now: Instant) {
        self.p2b_relays.insert(
            slot,
            P2bRelayState {
                ballot,
                hops: routed.hops.clone(),
                progress: routed.progress,
                voters: Vec::new(),
                started_at: now,
            },
        );
    }

    fn accumulate_p2b(
        &mut self,
        p2b: P2b,
        self_id: Id,
        relay_groups: &RelayGroups,
        paxos: &mut PaxosCore,
        out: &mut Vec<Outbound>,
    ) {
        let Some(state) = self.p2b_relays.get_mut(&p2b.slot) else {
            debug!("unknown p2b {:?} to relay; may already have been replied", p2b.slot);
            return;
        };
        if state.ballot != p2b.ballot {
            out.push(Outbound::new(
                p2b.ballot.id(),
                WireMessage::P2b(P2b {
                    ballot: state.ballot,
                    slot: p2b.slot,
                    id: Vec::new(),
                }),
            ));
            return;
        }
        for id in p2b.id {
            if !state.voters.contains(&id) {
                state.voters.push(id);
            }
        }
        if !self.ready_to_relay_p2b(p2b.slot, relay_groups) {
            return;
        }
        let state = self.p2b_relays.remove(&p2b.slot).unwrap();
        let missing = compute_missing_ids(relay_groups, &state.voters);
        let upstream = state.hops[state.progress as usize];
        if state.progress == 0 {
            if self.use_small_p2b {
                out.push(Outbound::new(
                    upstream,
                    WireMessage::P2bAggregated(P2bAggregated {
                        ballot: state.ballot,
                        slot: p2b.slot,
                        relay_last_execute: paxos.log.execute.saturating_sub(1),
                        relay_id: self_id,
                        missing_ids: missing,
                    }),
                ));
            } else {
                out.push(Outbound::new(
                    upstream,
                    WireMessage::P2b(P2b {
                        ballot: state.ballot,
                        slot: p2b.slot,
                        id: state.voters,
                    }),
                ));
            }
        } else {
            out.push(Outbound::new(
                upstream,
                WireMessage::Routed(RoutedMsg {
                    hops: state.hops,
                    is_forward: false,
                    progress: state.progress,
                    payload: RoutedPayload::P2b(P2b {
                        ballot: state.ballot,
                        slot: p2b.slot,
                        id: state.voters,
                    }),
                }),
            ));
        }
    }

    fn ready_to_relay_p2b(&self, slot: u64, relay_groups: &RelayGroups) -> bool {
        let state = self.p2b_relays.get(&slot).expect("checked by caller");
        let group_len = relay_groups.home_group().nodes.len();
        if state.voters.len() == group_len / 2 + 1 {
            return true;
        }
        if state.voters.len() == group_len / 2 {
            return relay_groups.group_of(state.ballot.id()) == Some(relay_groups.my_group);
        }
        false
    }

    /// §4.6, §4.8: back-propagate whatever a timed-out aggregation
    /// collected so far, never retrying.
    pub fn check_p1b_timeout(&mut self, now: Instant, ptt: Duration) -> Option<Outbound> {
        let expired = match &self.p1b_relay {
            Some(state) => {
                !state.received.is_empty() && now.saturating_duration_since(state.started_at) >= ptt
            }
            None => false,
        };
        if !expired {
            return None;
        }
        let state = self.p1b_relay.take().unwrap();
        let upstream = state.hops[state.progress as usize];
        Some(if state.progress == 0 {
            Outbound::new(upstream, WireMessage::P1bBatch(state.received))
        } else {
            Outbound::new(
                upstream,
                WireMessage::Routed(RoutedMsg {
                    hops: state.hops,
                    is_forward: false,
                    progress: state.progress,
                    payload: RoutedPayload::P1bBatch(state.received),
                }),
            )
        })
    }

    pub fn check_p2b_timeouts(
        &mut self,
        now: Instant,
        ptt: Duration,
        self_id: Id,
        relay_groups: &RelayGroups,
        paxos: &PaxosCore,
    ) -> Vec<Outbound> {
        let mut out = Vec::new();
        let expired: Vec<u64> = self
            .p2b_relays
            .iter()
            .filter(|(_, s)| now.saturating_duration_since(s.started_at) >= ptt)
            .map(|(&slot, _)| slot)
            .collect();

        for slot in expired {
            let state = self.p2b_relays.remove(&slot).unwrap();
            let missing = compute_missing_ids(relay_groups, &state.voters);
            let upstream = state.hops[state.progress as usize];
            if state.progress == 0 {
                if self.use_small_p2b {
                    out.push(Outbound::new(
                        upstream,
                        WireMessage::P2bAggregated(P2bAggregated {
                            ballot: state.ballot,
                            slot,
                            relay_last_execute: paxos.log.execute.saturating_sub(1),
                            relay_id: self_id,
                            missing_ids: missing,
                        }),
                    ));
                } else {
                    out.push(Outbound::new(
                        upstream,
                        WireMessage::P2b(P2b {
                            ballot: state.ballot,
                            slot,
                            id: state.voters,
                        }),
                    ));
                }
            } else {
                out.push(Outbound::new(
                    upstream,
                    WireMessage::Routed(RoutedMsg {
                        hops: state.hops,
                        is_forward: false,
                        progress: state.progress,
                        payload: RoutedPayload::P2b(P2b {
                            ballot: state.ballot,
                            slot,
                            id: state.voters,
                        }),
                    }),
                ));
            }
        }
        out
    }

    /// Reconstructs the full voter set from a `P2bAggregated`'s
    /// `missing_ids` (§4.5): `group.members \ missing_ids`.
    pub fn reconstruct_voters(relay_groups: &RelayGroups, relay_id: Id, missing_ids: &[Id]) -> Vec<Id> {
        let group_idx = relay_groups.group_of(relay_id);
        let Some(group_idx) = group_idx else {
            return Vec::new();
        };
        relay_groups.groups[group_idx]
            .nodes
            .iter()
            .copied()
            .filter(|id| !missing_ids.contains(id))
            .collect()
    }
}

fn compute_missing_ids(relay_groups: &RelayGroups, voters: &[Id]) -> Vec<Id> {
    relay_groups
        .home_group()
        .nodes
        .iter()
        .copied()
        .filter(|id| !voters.contains(id))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ballot::Ballot;
    use crate::statemachine::KvStore;

    fn ids(pairs: &[(u16, u16)]) -> Vec<Id> {
        pairs.iter().map(|&(z, n)| Id::new(z, n)).collect()
    }

    #[test]
    fn p1b_aggregation_releases_at_majority_plus_one() {
        let leader = Id::new(1, 1);
        let members = ids(&[(1, 1), (1, 2), (1, 3), (1, 4), (1, 5)]);
        let relay_groups = RelayGroups::build(
            members[1],
            &members,
            crate::relay::PartitionMode::Numeric(1),
            crate::relay::RelayPolicy::Random,
        );
        let mut router = Router::new(2, true);
        let gray = GrayList::new(Duration::from_secs(10));
        let mut paxos = PaxosCore::new(members[1], members.len(), Box::new(KvStore::default()));
        let ballot = Ballot::new(1, leader);

        let routed = RoutedMsg {
            hops: vec![leader],
            is_forward: true,
            progress: 0,
            payload: RoutedPayload::P1a(P1a { ballot }),
        };
        let now = Instant::now();
        let out = router.handle_routed_msg(routed, members[1], &relay_groups, &gray, &mut paxos, now);
        // self-vote didn't release yet (group has 5 members, need 3)
        assert!(out.is_empty());

        for leaf in [members[2], members[3]] {
            let reply = RoutedMsg {
                hops: vec![leader],
                is_forward: false,
                progress: 0,
                payload: RoutedPayload::P1b(P1b {
                    id: leaf,
                    ballot,
                    log: vec![],
                }),
            };
            let out = router.handle_routed_msg(reply, members[1], &relay_groups, &gray, &mut paxos, now);
            if leaf == members[3] {
                assert_eq!(out.len(), 1);
                match &out[0].msg {
                    WireMessage::P1bBatch(batch) => assert_eq!(batch.len(), 3),
                    other => panic!("expected flat P1bBatch, got {:?}", other),
                }
            } else {
                assert!(out.is_empty());
            }
        }
    }

    #[test]
    fn p2b_aggregated_reconstructs_full_group_from_empty_missing() {
        let members = ids(&[(1, 1), (1, 2), (1, 3)]);
        let relay_groups = RelayGroups::build(
            members[0],
            &members,
            crate::relay::PartitionMode::Numeric(1),
            crate::relay::RelayPolicy::Random,
        );
        let voters = Router::reconstruct_voters(&relay_groups, members[1], &[]);
        assert_eq!(voters.len(), 3);
    }
}
