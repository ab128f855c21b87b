//! Classic multi-decree Paxos over the command log (§4.3).
//!
//! `PaxosCore` only knows about ballots, slots, and the log; it has no idea
//! whether messages arrive directly or through the relay tree (C5) — that
//! routing lives in `router.rs` / `replica.rs`. Every method here mutates
//! state and returns the (if any) message the caller should send; no
//! method performs I/O itself, matching §5's "never hold the lock across
//! a send" discipline.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use log::debug;

use crate::ballot::Ballot;
use crate::command::{noop, Command, CommandId, ReadReply};
use crate::handle::ReplyHandle;
use crate::id::Id;
use crate::log::{CommandLog, LogEntry};
use crate::messages::{P1a, P1b, P2a, P2b, P3};
use crate::statemachine::StateMachine;

/// `⌈n/2⌉ + 1`, the majority size for `n` known members.
pub fn majority(n: usize) -> usize {
    n / 2 + 1
}

/// Leader-side phase-1 aggregation: one outstanding ballot at a time.
pub struct P1aCollector {
    pub ballot: Ballot,
    pub received: Vec<P1b>,
}

/// Leader-side phase-2 aggregation for a single slot.
pub struct P2bCollector {
    pub ballot: Ballot,
    pub voters: Vec<Id>,
    pub started_at: Instant,
    pub retries: u32,
}

/// What the leader's ticker (§4.8, §7 "Timeout at leader") should do after
/// checking outstanding phase-2 rounds.
#[derive(Default)]
pub struct LeaderTimeoutAction {
    /// Slots to re-broadcast a `P2a` for (re-drive).
    pub redrive: Vec<P2a>,
    /// Set once a slot has missed quorum for too many rounds in a row:
    /// the caller should bump the ballot and restart phase 1 (§4.3).
    pub restart_phase1: bool,
}

/// After this many consecutive timeouts on the same slot, give up
/// re-driving it at the current ballot and restart phase 1.
const MAX_REDRIVE_RETRIES: u32 = 3;

/// The Paxos state machine driving one replica's log (§3 "Replica state").
pub struct PaxosCore {
    pub self_id: Id,
    pub ballot: Ballot,
    pub active: bool,
    pub slot: u64,
    pub log: CommandLog,
    cluster_size: usize,
    p1_collector: Option<P1aCollector>,
    p2_collectors: HashMap<u64, P2bCollector>,
    /// Slots committed since the last P3 was sent (piggybacked or synced),
    /// drained by whichever call needs to attach/send a `P3` next (§4.7).
    pending_p3: Vec<u64>,
    sm: Box<dyn StateMachine>,
}

impl PaxosCore {
    pub fn new(self_id: Id, cluster_size: usize, sm: Box<dyn StateMachine>) -> Self {
        PaxosCore {
            self_id,
            ballot: Ballot::BOTTOM,
            active: false,
            slot: 0,
            log: CommandLog::new(),
            cluster_size,
            p1_collector: None,
            p2_collectors: HashMap::new(),
            pending_p3: Vec::new(),
            sm,
        }
    }

    fn majority(&self) -> usize {
        majority(self.cluster_size)
    }

    // ---- Phase 1: leader election -------------------------------------

    /// Becomes a phase-1 candidate: bumps the ballot, drops `active`, and
    /// starts a fresh aggregation. Returns the `P1a` to broadcast.
    pub fn start_phase1(&mut self) -> P1a {
        self.ballot = self.ballot.next(self.self_id);
        self.active = false;
        self.p1_collector = Some(P1aCollector {
            ballot: self.ballot,
            received: Vec::new(),
        });
        debug!("{} starting phase 1 at ballot {}", self.self_id, self.ballot);
        P1a { ballot: self.ballot }
    }

    /// Receiver side of P1a (§4.3): adopts the ballot if strictly greater
    /// and steps down; otherwise nacks with the current (higher) ballot.
    pub fn handle_p1a(&mut self, m: P1a) -> P1b {
        if m.ballot > self.ballot {
            self.ballot = m.ballot;
            self.active = false;
        }
        let log: Vec<(u64, Ballot, Command)> = self
            .log
            .log
            .iter()
            .filter(|(&slot, entry)| slot >= self.log.execute && !entry.commit)
            .map(|(&slot, entry)| (slot, entry.ballot, entry.command.clone()))
            .collect();
        P1b {
            id: self.self_id,
            ballot: self.ballot,
            log,
        }
    }

    /// Leader-side phase-1 collection. Returns `Some(Vec<P2a>)` the first
    /// time a majority is reached for the currently outstanding ballot,
    /// `None` otherwise (already released, nacked, or still short).
    pub fn collect_p1b(&mut self, reply: P1b) -> Option<Vec<P2a>> {
        let collector = self.p1_collector.as_mut()?;
        if reply.ballot != collector.ballot {
            // Nack or a reply for a round we already finished; ignore.
            if reply.ballot > self.ballot {
                self.step_down(reply.ballot);
            }
            return None;
        }
        collector.received.push(reply);
        if collector.received.len() < self.majority() {
            return None;
        }

        let collector = self.p1_collector.take().unwrap();
        self.active = true;
        Some(self.adopt_and_propose(collector))
    }

    /// Same as [`Self::collect_p1b`] but for a flattened batch (the relay
    /// sent `Vec<P1b>` instead of individual replies, §4.5).
    pub fn collect_p1b_batch(&mut self, replies: Vec<P1b>) -> Option<Vec<P2a>> {
        let mut result = None;
        for reply in replies {
            if let Some(p2as) = self.collect_p1b(reply) {
                result = Some(p2as);
            }
        }
        result
    }

    /// For every slot from `execute` to the highest slot any promise
    /// mentioned, adopt the highest-ballot command (tie broken by owner)
    /// or propose a no-op, all under the new ballot (§4.3).
    fn adopt_and_propose(&mut self, collector: P1aCollector) -> Vec<P2a> {
        let new_ballot = collector.ballot;
        let mut highest: HashMap<u64, (Ballot, Command)> = HashMap::new();
        let mut max_slot = self.slot;
        for p1b in &collector.received {
            for &(slot, ballot, ref command) in &p1b.log {
                max_slot = max_slot.max(slot);
                match highest.get(&slot) {
                    Some((existing, _)) if *existing >= ballot => {}
                    _ => {
                        highest.insert(slot, (ballot, command.clone()));
                    }
                }
            }
        }

        let mut out = Vec::new();
        for slot in self.log.execute..=max_slot {
            if let Some(entry) = self.log.get(slot) {
                if entry.commit {
                    continue;
                }
            }
            let command = match highest.get(&slot) {
                Some((_, command)) => command.clone(),
                None => noop(CommandLog::internal_command_id(self.self_id, slot)),
            };
            out.push(self.propose_at_slot(slot, new_ballot, command, None));
        }
        self.slot = self.slot.max(max_slot);
        out
    }

    /// Steps down if a strictly higher ballot has been observed anywhere
    /// (§4.3 "Failure", §7 "Higher ballot observed").
    pub fn step_down(&mut self, ballot: Ballot) {
        if ballot > self.ballot {
            self.ballot = ballot;
            self.active = false;
            self.p1_collector = None;
        }
    }

    // ---- Phase 2: replication -------------------------------------------

    /// Leader allocates the next slot for `command` and returns the `P2a`
    /// to broadcast, piggybacking any committed-since-last-send slots.
    pub fn propose(&mut self, command: Command, request: Option<ReplyHandle>) -> P2a {
        self.slot += 1;
        let slot = self.slot;
        self.propose_at_slot(slot, self.ballot, command, request)
    }

    fn propose_at_slot(
        &mut self,
        slot: u64,
        ballot: Ballot,
        command: Command,
        request: Option<ReplyHandle>,
    ) -> P2a {
        let mut entry = LogEntry::new(ballot, command.clone());
        entry.voters.push(self.self_id);
        entry.request = request;
        self.log.append(slot, entry);
        self.p2_collectors.insert(
            slot,
            P2bCollector {
                ballot,
                voters: vec![self.self_id],
                started_at: Instant::now(),
                retries: 0,
            },
        );
        P2a {
            ballot,
            slot,
            global_execute: self.log.global_execute,
            command,
            p3: self.drain_p3(ballot),
        }
    }

    /// Follower side of P2a (§4.3): accepts under a matching-or-newer
    /// ballot, otherwise nacks with the current (higher) ballot and an
    /// empty voter list.
    pub fn handle_p2a(&mut self, m: P2a) -> P2b {
        if m.ballot > self.ballot {
            self.ballot = m.ballot;
            self.active = false;
        }
        if m.ballot < self.ballot {
            return P2b {
                ballot: self.ballot,
                slot: m.slot,
                id: Vec::new(),
            };
        }

        if let Some(p3) = &m.p3 {
            self.apply_p3(p3);
        }

        let mut entry = self
            .log
            .log
            .remove(&m.slot)
            .unwrap_or_else(|| LogEntry::new(m.ballot, m.command.clone()));
        if entry.ballot != m.ballot || entry.command != m.command {
            entry.old_ballots.push((entry.ballot, entry.command.clone()));
            entry.ballot = m.ballot;
            entry.command = m.command.clone();
        }
        self.log.append(m.slot, entry);
        self.slot = self.slot.max(m.slot);
        self.log.global_execute = self.log.global_execute.max(m.global_execute);

        P2b {
            ballot: m.ballot,
            slot: m.slot,
            id: vec![self.self_id],
        }
    }

    /// Leader-side phase-2 collection for one slot: records `voters`,
    /// commits and executes on majority. Returns the slots newly executed
    /// (used to extend `pending_p3`), or `None` if still short of quorum
    /// or the reply is stale.
    pub fn handle_p2b(&mut self, slot: u64, ballot: Ballot, voters: &[Id]) -> Option<Vec<u64>> {
        if ballot > self.ballot {
            self.step_down(ballot);
            return None;
        }
        let collector = self.p2_collectors.get_mut(&slot)?;
        if ballot != collector.ballot {
            return None;
        }
        for &id in voters {
            if !collector.voters.contains(&id) {
                collector.voters.push(id);
            }
        }
        if collector.voters.len() < self.majority() {
            return None;
        }
        self.p2_collectors.remove(&slot);
        self.log.commit(slot);
        let applied = self.log.try_execute(self.sm.as_mut());
        self.pending_p3.extend(applied.iter().copied());
        Some(applied)
    }

    /// Leader-side timeout check (§4.8 step 3, §7 "Timeout at leader"):
    /// any slot whose phase-2 round has been open longer than `ptt`
    /// without quorum is re-driven; a slot that has timed out
    /// `MAX_REDRIVE_RETRIES` times in a row instead triggers a phase-1
    /// restart at a fresh ballot.
    pub fn check_leader_timeouts(&mut self, now: Instant, ptt: Duration) -> LeaderTimeoutAction {
        let mut action = LeaderTimeoutAction::default();
        if !self.active {
            return action;
        }
        let expired_slots: Vec<u64> = self
            .p2_collectors
            .iter()
            .filter(|(_, c)| now.saturating_duration_since(c.started_at) >= ptt)
            .map(|(&slot, _)| slot)
            .collect();

        for slot in expired_slots {
            let Some(collector) = self.p2_collectors.get_mut(&slot) else {
                continue;
            };
            collector.retries += 1;
            collector.started_at = now;
            if collector.retries > MAX_REDRIVE_RETRIES {
                action.restart_phase1 = true;
                continue;
            }
            let ballot = collector.ballot;
            if let Some(entry) = self.log.get(slot) {
                let command = entry.command.clone();
                action.redrive.push(P2a {
                    ballot,
                    slot,
                    global_execute: self.log.global_execute,
                    command,
                    p3: self.drain_p3(ballot),
                });
            }
        }
        action
    }

    /// Drains slots committed since the last P3 send into a piggyback
    /// payload for this P2a, or `None` when nothing is pending.
    fn drain_p3(&mut self, ballot: Ballot) -> Option<P3> {
        if self.pending_p3.is_empty() {
            return None;
        }
        let slots = std::mem::take(&mut self.pending_p3);
        Some(P3 { ballot, slots })
    }

    /// Builds a standalone P3Sync payload draining the same buffer (§4.7,
    /// invoked by the ticker rather than alongside a P2a).
    pub fn drain_p3_sync(&mut self) -> Option<P3> {
        self.drain_p3(self.ballot)
    }

    /// Applies an incoming P3: commits and executes every named slot that
    /// is not already committed (idempotent, §8).
    pub fn apply_p3(&mut self, p3: &P3) {
        for &slot in &p3.slots {
            if let Some(entry) = self.log.get(slot) {
                if entry.commit {
                    continue;
                }
            }
            self.log.commit(slot);
        }
        self.log.try_execute(self.sm.as_mut());
    }

    /// Installs a recovered `(ballot, command)` at `slot` and commits it
    /// directly, bypassing the normal accept collector (§4.7 recovery).
    pub fn apply_recovered(&mut self, slot: u64, ballot: Ballot, command: Command) {
        let mut entry = self
            .log
            .log
            .remove(&slot)
            .unwrap_or_else(|| LogEntry::new(ballot, command.clone()));
        if entry.ballot != ballot || entry.command != command {
            entry.old_ballots.push((entry.ballot, entry.command.clone()));
            entry.ballot = ballot;
            entry.command = command;
        }
        entry.commit = true;
        self.log.append(slot, entry);
        self.slot = self.slot.max(slot);
        let applied = self.log.try_execute(self.sm.as_mut());
        self.pending_p3.extend(applied.iter().copied());
    }

    // ---- Read path -------------------------------------------------------

    /// §4.3 read path: walks `log[execute..slot]` for `key`; if a pending
    /// (uncommitted) entry matches, replies with its value and
    /// `in_progress = true`; otherwise serves the read directly.
    pub fn read(&mut self, command: &Command) -> ReadReply {
        if let Some(entry) = self
            .log
            .find_in_progress(self.log.execute, self.slot, &command.key)
        {
            return ReadReply {
                value: entry.command.value.clone(),
                slot: self.slot,
                ballot: self.ballot,
                execute: self.log.execute.saturating_sub(1),
                in_progress: true,
            };
        }
        let value = self.sm.apply(command);
        ReadReply {
            value,
            slot: self.slot,
            ballot: self.ballot,
            execute: self.log.execute.saturating_sub(1),
            in_progress: false,
        }
    }

    pub fn is_leader(&self) -> bool {
        self.active
    }

    pub fn leader(&self) -> Id {
        self.ballot.id()
    }

    /// Builds a fresh `CommandId` scoped to slots proposed internally
    /// (no-ops), distinct from client-issued ids.
    pub fn internal_command_id(&self, slot: u64) -> CommandId {
        CommandLog::internal_command_id(self.self_id, slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{Command, CommandKind};
    use crate::statemachine::KvStore;

    fn core(id: Id, size: usize) -> PaxosCore {
        PaxosCore::new(id, size, Box::new(KvStore::default()))
    }

    fn put(owner: Id, seq: u64, key: &str, value: &str) -> Command {
        Command {
            key: key.into(),
            value: value.into(),
            kind: CommandKind::Put,
            id: CommandId { client: owner, seq },
        }
    }

    #[test]
    fn phase1_majority_activates_leader() {
        let id = Id::new(1, 1);
        let mut p = core(id, 3);
        let p1a = p.start_phase1();
        assert!(!p.is_leader());

        let r1 = P1b {
            id: Id::new(1, 2),
            ballot: p1a.ballot,
            log: vec![],
        };
        assert!(p.collect_p1b(r1).is_none());

        let r2 = P1b {
            id: Id::new(1, 3),
            ballot: p1a.ballot,
            log: vec![],
        };
        // self already counted? no: collector starts empty, needs majority(3)=2 replies
        let result = p.collect_p1b(r2);
        assert!(result.is_some());
        assert!(p.is_leader());
    }

    #[test]
    fn propose_then_majority_commits_and_executes() {
        let id = Id::new(1, 1);
        let mut p = core(id, 3);
        p.active = true;
        p.ballot = Ballot::new(1, id);
        let p2a = p.propose(put(id, 1, "k", "v"), None);
        assert_eq!(p2a.slot, 1);

        // `propose_at_slot` pre-counts the leader itself as a voter, so a
        // single external accept already reaches majority(3) == 2.
        let applied = p
            .handle_p2b(p2a.slot, p2a.ballot, &[Id::new(1, 2)])
            .unwrap();
        assert_eq!(applied, vec![1]);
        assert_eq!(p.log.execute, 2);

        // A further accept for the same slot finds no outstanding
        // collector left and is ignored.
        assert!(p
            .handle_p2b(p2a.slot, p2a.ballot, &[Id::new(1, 3)])
            .is_none());
    }

    #[test]
    fn higher_ballot_observed_steps_down_leader() {
        let id = Id::new(1, 1);
        let mut p = core(id, 3);
        p.active = true;
        p.ballot = Ballot::new(1, id);
        p.step_down(Ballot::new(2, Id::new(1, 2)));
        assert!(!p.is_leader());
        assert_eq!(p.ballot, Ballot::new(2, Id::new(1, 2)));
    }

    #[test]
    fn stale_p2a_is_nacked_with_current_ballot() {
        let id = Id::new(1, 1);
        let mut p = core(id, 3);
        p.ballot = Ballot::new(5, Id::new(1, 2));
        let stale = P2a {
            ballot: Ballot::new(1, Id::new(1, 3)),
            slot: 1,
            global_execute: 0,
            command: put(id, 1, "k", "v"),
            p3: None,
        };
        let reply = p.handle_p2a(stale);
        assert_eq!(reply.ballot, Ballot::new(5, Id::new(1, 2)));
        assert!(reply.id.is_empty());
    }

    #[test]
    fn apply_p3_is_idempotent_for_already_committed_slots() {
        let id = Id::new(1, 1);
        let mut p = core(id, 3);
        p.active = true;
        p.ballot = Ballot::new(1, id);
        let p2a = p.propose(put(id, 1, "k", "v"), None);
        p.handle_p2b(p2a.slot, p2a.ballot, &[Id::new(1, 2)]);
        p.handle_p2b(p2a.slot, p2a.ballot, &[Id::new(1, 3)]);
        let before = p.log.execute;
        p.apply_p3(&P3 {
            ballot: p2a.ballot,
            slots: vec![1],
        });
        assert_eq!(p.log.execute, before);
    }
}
