//! The periodic driver (§4.8): one 10ms tick runs cleanup, gray-list
//! expiry, leader re-drive/P3Sync, and follower aggregation-timeout
//! flush/recovery, in that order.

use std::time::{Duration, Instant};

use crate::commit::{self, RecoveryWatch};
use crate::gray::GrayList;
use crate::id::Id;
use crate::messages::{RoutedPayload, WireMessage};
use crate::paxos::PaxosCore;
use crate::relay::RelayGroups;
use crate::router::{Outbound, Router};

/// The 10ms base cadence every replica's ticker task sleeps on.
pub const TICK_DURATION: Duration = Duration::from_millis(10);

/// Default "every N ticks" multipliers from the original source.
pub const DEFAULT_CLEANUP_MULTIPLIER: u64 = 3;
pub const DEFAULT_GRAY_TIMEOUT_MULTIPLIER: u64 = 1000;

/// Per-phase timeout used both for leader P2 re-drive and follower
/// aggregation flush (`ptt` throughout §4 and §7).
pub const DEFAULT_PHASE_TIMEOUT: Duration = Duration::from_millis(50);

pub struct TickerConfig {
    pub cleanup_multiplier: u64,
    pub gray_timeout_multiplier: u64,
    pub phase_timeout: Duration,
}

impl Default for TickerConfig {
    fn default() -> Self {
        TickerConfig {
            cleanup_multiplier: DEFAULT_CLEANUP_MULTIPLIER,
            gray_timeout_multiplier: DEFAULT_GRAY_TIMEOUT_MULTIPLIER,
            phase_timeout: DEFAULT_PHASE_TIMEOUT,
        }
    }
}

/// Tick counter plus the stall watch for slot recovery; everything else
/// the ticker touches (`PaxosCore`, `Router`, `GrayList`) is borrowed
/// from the replica for the duration of one tick.
pub struct Ticker {
    config: TickerConfig,
    ticks: u64,
    recovery: RecoveryWatch,
}

impl Ticker {
    pub fn new(config: TickerConfig, now: Instant) -> Self {
        let recovery_timeout = commit::DEFAULT_RECOVERY_TIMEOUT;
        Ticker {
            config,
            ticks: 0,
            recovery: RecoveryWatch::new(recovery_timeout, now),
        }
    }

    /// Runs one tick (§4.8 steps 1-4), returning whatever must be sent.
    pub fn tick(
        &mut self,
        self_id: Id,
        now: Instant,
        paxos: &mut PaxosCore,
        router: &mut Router,
        gray: &mut GrayList,
        relay_groups: &RelayGroups,
    ) -> Vec<Outbound> {
        self.ticks += 1;
        let mut out = Vec::new();

        if self.ticks % self.config.cleanup_multiplier == 0 {
            paxos.log.recompute_global_execute(&relay_groups_known_ids(relay_groups));
            paxos.log.cleanup();
        }
        if self.ticks % self.config.gray_timeout_multiplier == 0 {
            gray.expire(now);
        }

        if paxos.is_leader() {
            let action = paxos.check_leader_timeouts(now, self.config.phase_timeout);
            for p2a in action.redrive {
                out.extend(router.broadcast(
                    self_id,
                    relay_groups,
                    gray,
                    RoutedPayload::P2a(p2a),
                ));
            }
            if action.restart_phase1 {
                let p1a = paxos.start_phase1();
                out.extend(router.broadcast(self_id, relay_groups, gray, RoutedPayload::P1a(p1a)));
            }
            if let Some(p3) = paxos.drain_p3_sync() {
                out.extend(router.broadcast(self_id, relay_groups, gray, RoutedPayload::P3(p3)));
            }
        } else {
            if let Some(out1) = router.check_p1b_timeout(now, self.config.phase_timeout) {
                out.push(out1);
            }
            out.extend(router.check_p2b_timeouts(
                now,
                self.config.phase_timeout,
                self_id,
                relay_groups,
                paxos,
            ));
            if let Some(req) = self.recovery.poll(self_id, paxos, now) {
                let leader = req.ballot.id();
                if !leader.is_nil() {
                    out.push(Outbound {
                        to: leader,
                        msg: WireMessage::P3RecoverRequest(req),
                    });
                }
            }
        }

        out
    }
}

fn relay_groups_known_ids(relay_groups: &RelayGroups) -> Vec<Id> {
    relay_groups.groups.iter().flat_map(|g| g.nodes.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ballot::Ballot;
    use crate::relay::{PartitionMode, RelayPolicy};
    use crate::statemachine::KvStore;

    fn ids(pairs: &[(u16, u16)]) -> Vec<Id> {
        pairs.iter().map(|&(z, n)| Id::new(z, n)).collect()
    }

    #[test]
    fn cleanup_runs_only_every_nth_tick() {
        let id = Id::new(1, 1);
        let members = ids(&[(1, 1), (1, 2), (1, 3)]);
        let relay_groups = RelayGroups::build(id, &members, PartitionMode::Numeric(1), RelayPolicy::Random);
        let mut paxos = PaxosCore::new(id, 3, Box::new(KvStore::default()));
        let mut router = Router::new(2, true);
        let mut gray = GrayList::new(Duration::from_secs(10));
        let config = TickerConfig {
            cleanup_multiplier: 3,
            gray_timeout_multiplier: 1000,
            phase_timeout: Duration::from_millis(100),
        };
        let t0 = Instant::now();
        let mut ticker = Ticker::new(config, t0);

        for _ in 0..2 {
            ticker.tick(id, t0, &mut paxos, &mut router, &mut gray, &relay_groups);
        }
        assert_eq!(ticker.ticks, 2);
    }

    #[test]
    fn leader_redrives_timed_out_slot() {
        let id = Id::new(1, 1);
        let members = ids(&[(1, 1), (1, 2), (1, 3)]);
        let relay_groups = RelayGroups::build(id, &members, PartitionMode::Numeric(1), RelayPolicy::Random);
        let mut paxos = PaxosCore::new(id, 3, Box::new(KvStore::default()));
        paxos.active = true;
        paxos.ballot = Ballot::new(1, id);
        let mut router = Router::new(2, true);
        let mut gray = GrayList::new(Duration::from_secs(10));
        let config = TickerConfig {
            cleanup_multiplier: 1000,
            gray_timeout_multiplier: 1000,
            phase_timeout: Duration::from_millis(10),
        };
        let t0 = Instant::now();
        let mut ticker = Ticker::new(config, t0);
        paxos.propose(
            crate::command::Command::put(
                crate::command::CommandId { client: id, seq: 1 },
                "k",
                "v",
            ),
            None,
        );

        let out = ticker.tick(
            id,
            t0 + Duration::from_millis(20),
            &mut paxos,
            &mut router,
            &mut gray,
            &relay_groups,
        );
        assert!(!out.is_empty());
    }
}
