//! In-memory transport and cluster harness used by integration tests
//! (§8 end-to-end scenarios), grounded in the same "fault injection
//! knobs operating on a per-peer basis" described in `spec.md` §5.
//!
//! Mirrors the role of the teacher's `test/lin_test` driver: wire up a
//! small in-process cluster without touching real sockets.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use tokio::sync::{broadcast, mpsc};

use pigpaxos_core::command::Command;
use pigpaxos_core::error::{PigpaxosError, Result};
use pigpaxos_core::gray::GrayList;
use pigpaxos_core::id::Id;
use pigpaxos_core::messages::WireMessage;
use pigpaxos_core::relay::{PartitionMode, RelayGroups, RelayPolicy};
use pigpaxos_core::replica::Replica;
use pigpaxos_core::statemachine::{KvStore, StateMachine};
use pigpaxos_core::ticker::TickerConfig;
use pigpaxos_core::transport::Transport;

/// Per-destination fault knob (§5 "Fault injection"), reset automatically
/// by whichever test installed it (the ticker's clock timing is out of
/// scope for this in-memory transport; tests advance fault windows
/// explicitly instead).
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum FaultMode {
    #[default]
    Clear,
    /// Every send to this destination is dropped silently.
    Drop,
    /// Every send to this destination errors immediately.
    Crash,
    /// Every send is delayed before delivery.
    Slow(Duration),
}

/// An in-memory, `mpsc`-backed [`Transport`] for one node's outgoing
/// traffic, sharing a fault-injection table across the whole cluster.
pub struct ChannelTransport {
    self_id: Id,
    routes: HashMap<Id, mpsc::UnboundedSender<(Id, WireMessage)>>,
    faults: Arc<Mutex<HashMap<Id, FaultMode>>>,
}

impl ChannelTransport {
    fn new(
        self_id: Id,
        routes: HashMap<Id, mpsc::UnboundedSender<(Id, WireMessage)>>,
        faults: Arc<Mutex<HashMap<Id, FaultMode>>>,
    ) -> Self {
        ChannelTransport { self_id, routes, faults }
    }

    /// Sets (or clears, with [`FaultMode::Clear`]) the fault behavior for
    /// sends to `target`, cluster-wide (every node's transport shares the
    /// same fault table, matching "per-peer" scoping in §5).
    pub fn set_fault(&self, target: Id, mode: FaultMode) {
        self.faults.lock().unwrap().insert(target, mode);
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, to: Id, msg: WireMessage) -> Result<()> {
        let mode = self.faults.lock().unwrap().get(&to).copied().unwrap_or_default();
        match mode {
            FaultMode::Drop => {
                debug!("{} -> {} dropped by fault injection", self.self_id, to);
                return Ok(());
            }
            FaultMode::Crash => {
                return Err(PigpaxosError::Transport {
                    to,
                    source: "fault-injected crash".into(),
                })
            }
            FaultMode::Slow(delay) => tokio::time::sleep(delay).await,
            FaultMode::Clear => {}
        }
        let sender = self.routes.get(&to).ok_or(PigpaxosError::UnknownPeer(to))?;
        sender
            .send((self.self_id, msg))
            .map_err(|_| PigpaxosError::Transport {
                to,
                source: "peer channel closed".into(),
            })
    }
}

/// A fully wired in-process cluster of layered replicas (§8 scenarios):
/// one `ChannelTransport` + receive loop + ticker task per node.
pub struct Cluster {
    pub replicas: HashMap<Id, Arc<Replica<ChannelTransport>>>,
    pub transports: HashMap<Id, Arc<ChannelTransport>>,
    shutdown: broadcast::Sender<()>,
}

impl Cluster {
    /// Builds a cluster of `ids.len()` nodes partitioned into
    /// `num_groups` relay groups, all using the compact `P2bAggregated`
    /// reply and a 2-level relay tree.
    pub fn build(ids: Vec<Id>, num_groups: usize) -> Self {
        let mut routes = HashMap::new();
        let mut receivers = HashMap::new();
        for &id in &ids {
            let (tx, rx) = mpsc::unbounded_channel();
            routes.insert(id, tx);
            receivers.insert(id, rx);
        }
        let faults = Arc::new(Mutex::new(HashMap::new()));
        let (shutdown, _) = broadcast::channel(1);

        let mut replicas = HashMap::new();
        let mut transports = HashMap::new();
        for &id in &ids {
            let transport = Arc::new(ChannelTransport::new(id, routes.clone(), faults.clone()));
            let relay_groups = RelayGroups::build(id, &ids, PartitionMode::Numeric(num_groups), RelayPolicy::Random);
            let sm: Box<dyn StateMachine> = Box::new(KvStore::default());
            let replica = Arc::new(Replica::new(
                id,
                ids.len(),
                "majority".to_string(),
                // Keep routing deterministic for in-process scenarios:
                // non-leaders forward to the known leader instead of
                // each independently trying to drive consensus.
                true,
                transport.clone(),
                relay_groups,
                2,
                true,
                GrayList::new(pigpaxos_core::gray::DEFAULT_GRAY_TIMEOUT),
                TickerConfig::default(),
                sm,
            ));
            replicas.insert(id, replica);
            transports.insert(id, transport);
        }

        for (id, rx) in receivers {
            let replica = replicas[&id].clone();
            let mut shutdown_rx = shutdown.subscribe();
            tokio::spawn(async move { receive_loop(replica, rx, &mut shutdown_rx).await });
            let replica = replicas[&id].clone();
            let ticker_shutdown = shutdown.subscribe();
            tokio::spawn(async move { replica.run_ticker(ticker_shutdown).await });
        }

        Cluster { replicas, transports, shutdown }
    }

    pub async fn submit(&self, at: Id, command: Command) -> pigpaxos_core::replica::Submission {
        self.replicas[&at].submit(command).await
    }

    pub fn set_fault(&self, from: Id, target: Id, mode: FaultMode) {
        self.transports[&from].set_fault(target, mode);
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }
}

async fn receive_loop(
    replica: Arc<Replica<ChannelTransport>>,
    mut rx: mpsc::UnboundedReceiver<(Id, WireMessage)>,
    shutdown: &mut broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            msg = rx.recv() => {
                match msg {
                    Some((from, msg)) => {
                        let _ = replica.handle_message(from, msg).await;
                    }
                    None => break,
                }
            }
            _ = shutdown.recv() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pigpaxos_core::command::CommandId;

    fn ids(pairs: &[(u16, u16)]) -> Vec<Id> {
        pairs.iter().map(|&(z, n)| Id::new(z, n)).collect()
    }

    #[tokio::test]
    async fn happy_path_put_commits_and_replies() {
        let members = ids(&[(1, 1), (1, 2), (1, 3), (2, 1), (2, 2), (2, 3)]);
        let cluster = Cluster::build(members.clone(), 2);
        let leader = members[0];

        let submission = cluster
            .submit(leader, Command::put(CommandId { client: leader, seq: 1 }, "k", "v"))
            .await;
        match submission {
            pigpaxos_core::replica::Submission::Pending(rx) => {
                let reply = tokio::time::timeout(Duration::from_secs(2), rx).await;
                assert!(reply.is_ok());
            }
            _ => panic!("expected Pending submission for a write"),
        }
        cluster.shutdown();
    }

    #[test]
    fn fault_mode_defaults_to_clear() {
        let faults: Arc<Mutex<HashMap<Id, FaultMode>>> = Arc::new(Mutex::new(HashMap::new()));
        assert_eq!(
            faults.lock().unwrap().get(&Id::new(1, 1)).copied().unwrap_or_default(),
            FaultMode::Clear
        );
    }
}
