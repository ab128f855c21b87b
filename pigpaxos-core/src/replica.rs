//! Replica glue (C12): wires `PaxosCore` (C3), `Router` (C5),
//! `RelayGroups` (C4), and `GrayList` (C6) together under the locking
//! discipline of §5, and drives the ticker (C8) as a long-lived task.
//!
//! Every method here is the only place an `await` crosses a lock: the
//! state lock is taken, `PaxosCore`/`Router` mutated synchronously, the
//! lock dropped, then whatever `Outbound`s resulted are sent.

use std::sync::Arc;
use std::time::Instant;

use log::{error, info};
use tokio::sync::{broadcast, oneshot, RwLock};

use crate::command::{Command, ReadReply, Reply};
use crate::error::Result;
use crate::frontend::{self, Decision};
use crate::gray::GrayList;
use crate::handle::ReplyHandle;
use crate::id::Id;
use crate::messages::{RoutedPayload, WireMessage};
use crate::paxos::PaxosCore;
use crate::relay::RelayGroups;
use crate::router::{Outbound, Router};
use crate::statemachine::StateMachine;
use crate::ticker::{Ticker, TickerConfig};
use crate::transport::Transport;

/// Paxos + router state guarded by one `RwLock` (§5): these two always
/// mutate together (a routed accept both advances `PaxosCore` and the
/// relay aggregation it arrived through).
struct State {
    paxos: PaxosCore,
    router: Router,
}

/// What a client-facing caller gets back for a submitted command.
pub enum Submission {
    Read(ReadReply),
    Pending(oneshot::Receiver<Reply>),
    Forwarded,
}

/// A layered-Paxos replica (§3-§4.9): the hierarchical variant named
/// throughout `spec.md`.
pub struct Replica<T: Transport> {
    pub self_id: Id,
    policy: String,
    stable_leader: bool,
    transport: Arc<T>,
    state: RwLock<State>,
    gray: RwLock<GrayList>,
    relay_groups: RelayGroups,
    ticker: RwLock<Ticker>,
}

impl<T: Transport> Replica<T> {
    pub fn new(
        self_id: Id,
        cluster_size: usize,
        policy: String,
        stable_leader: bool,
        transport: Arc<T>,
        relay_groups: RelayGroups,
        max_depth: u8,
        use_small_p2b: bool,
        gray: GrayList,
        ticker_config: TickerConfig,
        sm: Box<dyn StateMachine>,
    ) -> Self {
        let now = Instant::now();
        Replica {
            self_id,
            policy,
            stable_leader,
            transport,
            state: RwLock::new(State {
                paxos: PaxosCore::new(self_id, cluster_size, sm),
                router: Router::new(max_depth, use_small_p2b),
            }),
            gray: RwLock::new(gray),
            relay_groups,
            ticker: RwLock::new(Ticker::new(ticker_config, now)),
        }
    }

    /// Entry point for a locally originated client command (§4.9).
    pub async fn submit(&self, command: Command) -> Submission {
        let (handle, rx) = ReplyHandle::new();
        let mut state = self.state.write().await;
        match frontend::route(&mut state.paxos, &self.policy, self.stable_leader, command, Some(handle)) {
            Decision::ReadReply(reply) => Submission::Read(reply),
            Decision::Proposed(p2a) => {
                let gray = self.gray.read().await;
                let out = state
                    .router
                    .broadcast(self.self_id, &self.relay_groups, &gray, RoutedPayload::P2a(p2a));
                drop(gray);
                drop(state);
                self.dispatch(out).await;
                Submission::Pending(rx)
            }
            Decision::Forward { leader, request } => {
                drop(state);
                let _ = self
                    .transport
                    .send(leader, frontend::forward_message(request))
                    .await;
                Submission::Forwarded
            }
        }
    }

    /// Forces this node to start a phase-1 round immediately, for the
    /// `--ephemeral-leader` startup mode (a fixed, never-stepping-down
    /// leader used for latency benchmarking, §4.14).
    pub async fn force_leadership(&self) {
        let mut state = self.state.write().await;
        let gray = self.gray.read().await;
        let p1a = state.paxos.start_phase1();
        let out = state.router.broadcast(self.self_id, &self.relay_groups, &gray, RoutedPayload::P1a(p1a));
        drop(gray);
        drop(state);
        self.dispatch(out).await;
    }

    /// Dispatches one inbound wire message, mutating state under the lock
    /// and sending the resulting `Outbound`s after releasing it.
    pub async fn handle_message(&self, from: Id, msg: WireMessage) -> Result<()> {
        let out = {
            let mut state = self.state.write().await;
            let gray = self.gray.read().await;
            self.handle_locked(from, msg, &mut state, &gray)
        };
        self.dispatch(out).await;
        Ok(())
    }

    fn handle_locked(&self, _from: Id, msg: WireMessage, state: &mut State, gray: &GrayList) -> Vec<Outbound> {
        match msg {
            WireMessage::Request(req) => match frontend::route(&mut state.paxos, &self.policy, self.stable_leader, req.command, None) {
                Decision::ReadReply(_) => Vec::new(),
                Decision::Proposed(p2a) => state.router.broadcast(
                    self.self_id,
                    &self.relay_groups,
                    gray,
                    RoutedPayload::P2a(p2a),
                ),
                Decision::Forward { leader, request } => {
                    vec![Outbound {
                        to: leader,
                        msg: frontend::forward_message(request),
                    }]
                }
            },
            WireMessage::P1a(p1a) => {
                // A direct nack from a relay short-circuiting an older
                // aggregation (§4.5 step 2), not part of the relay tree:
                // just adopt/step down, no reply is expected back.
                state.paxos.step_down(p1a.ballot);
                Vec::new()
            }
            WireMessage::P1b(p1b) => {
                let from = p1b.id;
                if let Some(p2as) = state.paxos.collect_p1b(p1b) {
                    p2as.into_iter()
                        .flat_map(|p2a| {
                            state
                                .router
                                .broadcast(self.self_id, &self.relay_groups, gray, RoutedPayload::P2a(p2a))
                        })
                        .collect()
                } else {
                    info!("ignored p1b from {}", from);
                    Vec::new()
                }
            }
            WireMessage::P1bBatch(batch) => {
                if let Some(p2as) = state.paxos.collect_p1b_batch(batch) {
                    p2as.into_iter()
                        .flat_map(|p2a| {
                            state
                                .router
                                .broadcast(self.self_id, &self.relay_groups, gray, RoutedPayload::P2a(p2a))
                        })
                        .collect()
                } else {
                    Vec::new()
                }
            }
            WireMessage::P2b(p2b) => {
                state.paxos.handle_p2b(p2b.slot, p2b.ballot, &p2b.id);
                Vec::new()
            }
            WireMessage::P2bAggregated(agg) => {
                let voters = Router::reconstruct_voters(&self.relay_groups, agg.relay_id, &agg.missing_ids);
                state.paxos.log.update_last_execute(
                    agg.relay_id,
                    agg.relay_last_execute,
                    &known_ids(&self.relay_groups),
                );
                state.paxos.handle_p2b(agg.slot, agg.ballot, &voters);
                Vec::new()
            }
            WireMessage::P3(p3) => {
                state.paxos.apply_p3(&p3);
                Vec::new()
            }
            WireMessage::P3RecoverRequest(req) => {
                match crate::commit::handle_recover_request(&state.paxos, req) {
                    Some(reply) => vec![Outbound {
                        to: req.from,
                        msg: WireMessage::P3RecoverReply(reply),
                    }],
                    None => {
                        error!("no log entry to answer recovery request for slot {}", req.slot);
                        Vec::new()
                    }
                }
            }
            WireMessage::P3RecoverReply(reply) => {
                crate::commit::apply_recover_reply(&mut state.paxos, reply);
                Vec::new()
            }
            WireMessage::Routed(routed) => {
                let now = Instant::now();
                let State { paxos, router } = state;
                router.handle_routed_msg(routed, self.self_id, &self.relay_groups, gray, paxos, now)
            }
            WireMessage::Reply(_) => Vec::new(),
        }
    }

    /// Sends every `Outbound`, with self-addressed ones delivered
    /// in-process (§5 "self-loop") rather than through the transport; any
    /// further `Outbound`s that delivery produces are queued and drained
    /// the same way.
    async fn dispatch(&self, out: Vec<Outbound>) {
        let mut queue = out;
        while let Some(outbound) = queue.pop() {
            if outbound.to == self.self_id {
                let mut state = self.state.write().await;
                let gray = self.gray.read().await;
                let more = self.handle_locked(outbound.to, outbound.msg, &mut state, &gray);
                drop(gray);
                drop(state);
                queue.extend(more);
                continue;
            }
            if let Err(err) = self.transport.send(outbound.to, outbound.msg).await {
                error!("send to {} failed: {}", outbound.to, err);
                let mut gray = self.gray.write().await;
                gray.mark(outbound.to, Instant::now());
            }
        }
    }

    /// Runs the ticker task until `shutdown` fires (§5 "Coroutines").
    pub async fn run_ticker(&self, mut shutdown: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(crate::ticker::TICK_DURATION);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let out = {
                        let mut state = self.state.write().await;
                        let mut gray = self.gray.write().await;
                        let mut ticker = self.ticker.write().await;
                        let now = Instant::now();
                        let State { paxos, router } = &mut *state;
                        ticker.tick(self.self_id, now, paxos, router, &mut gray, &self.relay_groups)
                    };
                    self.dispatch(out).await;
                }
                _ = shutdown.recv() => {
                    info!("{} ticker shutting down", self.self_id);
                    break;
                }
            }
        }
    }
}

fn known_ids(relay_groups: &RelayGroups) -> Vec<Id> {
    relay_groups.groups.iter().flat_map(|g| g.nodes.clone()).collect()
}

/// The non-relayed baseline replica (§4.10, supplemented): same core,
/// broadcasting directly to every peer instead of through relay groups.
pub struct FlatReplica<T: Transport> {
    pub self_id: Id,
    policy: String,
    /// `--ephemeral_leader` in `original_source/paxos/replica.go`: if set,
    /// this node tries to become leader itself rather than forwarding to
    /// the one it already knows about (opposite polarity of the layered
    /// replica's `stable_leader`).
    ephemeral_leader: bool,
    transport: Arc<T>,
    paxos: RwLock<PaxosCore>,
    peers: Vec<Id>,
}

impl<T: Transport> FlatReplica<T> {
    pub fn new(
        self_id: Id,
        peers: Vec<Id>,
        policy: String,
        ephemeral_leader: bool,
        transport: Arc<T>,
        sm: Box<dyn StateMachine>,
    ) -> Self {
        let cluster_size = peers.len();
        FlatReplica {
            self_id,
            policy,
            ephemeral_leader,
            transport,
            paxos: RwLock::new(PaxosCore::new(self_id, cluster_size, sm)),
            peers,
        }
    }

    pub async fn submit(&self, command: Command) -> Submission {
        let (handle, rx) = ReplyHandle::new();
        let mut paxos = self.paxos.write().await;
        match frontend::route(&mut paxos, &self.policy, !self.ephemeral_leader, command, Some(handle)) {
            Decision::ReadReply(reply) => Submission::Read(reply),
            Decision::Proposed(p2a) => {
                drop(paxos);
                self.broadcast(WireMessage::P2a(p2a)).await;
                Submission::Pending(rx)
            }
            Decision::Forward { leader, request } => {
                drop(paxos);
                let _ = self.transport.send(leader, frontend::forward_message(request)).await;
                Submission::Forwarded
            }
        }
    }

    /// Dispatches one inbound message (§4.10): every phase-1/phase-2 vote
    /// is gathered directly by `PaxosCore`'s own majority collectors, with
    /// no relay aggregation in between.
    pub async fn handle_message(&self, msg: WireMessage) {
        let out = {
            let mut paxos = self.paxos.write().await;
            self.handle_locked(msg, &mut paxos)
        };
        for outbound in out {
            if outbound.to == self.self_id {
                continue;
            }
            let _ = self.transport.send(outbound.to, outbound.msg).await;
        }
    }

    fn handle_locked(&self, msg: WireMessage, paxos: &mut PaxosCore) -> Vec<Outbound> {
        match msg {
            WireMessage::Request(req) => match frontend::route(paxos, &self.policy, !self.ephemeral_leader, req.command, None) {
                Decision::Proposed(p2a) => self
                    .peers
                    .iter()
                    .filter(|&&p| p != self.self_id)
                    .map(|&p| Outbound { to: p, msg: WireMessage::P2a(p2a.clone()) })
                    .collect(),
                Decision::Forward { leader, request } => vec![Outbound {
                    to: leader,
                    msg: frontend::forward_message(request),
                }],
                Decision::ReadReply(_) => Vec::new(),
            },
            WireMessage::P1a(p1a) => {
                let p1b = paxos.handle_p1a(p1a);
                vec![Outbound {
                    to: p1a.ballot.id(),
                    msg: WireMessage::P1b(p1b),
                }]
            }
            WireMessage::P1b(p1b) => {
                if let Some(p2as) = paxos.collect_p1b(p1b) {
                    p2as.into_iter()
                        .flat_map(|p2a| {
                            self.peers.iter().filter(|&&p| p != self.self_id).map(move |&p| Outbound {
                                to: p,
                                msg: WireMessage::P2a(p2a.clone()),
                            })
                        })
                        .collect()
                } else {
                    Vec::new()
                }
            }
            WireMessage::P2a(p2a) => {
                let p2b = paxos.handle_p2a(p2a);
                vec![Outbound {
                    to: p2b.ballot.id(),
                    msg: WireMessage::P2b(p2b),
                }]
            }
            WireMessage::P2b(p2b) => {
                paxos.handle_p2b(p2b.slot, p2b.ballot, &p2b.id);
                Vec::new()
            }
            WireMessage::P3(p3) => {
                paxos.apply_p3(&p3);
                Vec::new()
            }
            WireMessage::P3RecoverRequest(req) => match crate::commit::handle_recover_request(paxos, req) {
                Some(reply) => vec![Outbound {
                    to: req.from,
                    msg: WireMessage::P3RecoverReply(reply),
                }],
                None => Vec::new(),
            },
            WireMessage::P3RecoverReply(reply) => {
                crate::commit::apply_recover_reply(paxos, reply);
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    async fn broadcast(&self, msg: WireMessage) {
        for &peer in &self.peers {
            if peer == self.self_id {
                continue;
            }
            let _ = self.transport.send(peer, msg.clone()).await;
        }
    }
}
