//! The command log: an ordered sparse map from slot to log entry with
//! commit/execute pointers (§3, §4.2).

use std::collections::{BTreeMap, HashMap};

use log::debug;

use crate::ballot::Ballot;
use crate::command::{Command, CommandId, Reply};
use crate::handle::ReplyHandle;
use crate::id::Id;
use crate::statemachine::StateMachine;

/// One slot's worth of Paxos state (§3 "Log entry").
pub struct LogEntry {
    pub ballot: Ballot,
    pub command: Command,
    /// Ids that have voted to accept `(ballot, command)` at this slot.
    pub voters: Vec<Id>,
    pub commit: bool,
    pub request: Option<ReplyHandle>,
    /// History of previously accepted `(ballot, command)` pairs at this
    /// slot, used to answer [`crate::messages::P3RecoverRequest`] when the
    /// current entry predates the requested ballot.
    pub old_ballots: Vec<(Ballot, Command)>,
}

impl LogEntry {
    pub fn new(ballot: Ballot, command: Command) -> Self {
        LogEntry {
            ballot,
            command,
            voters: Vec::new(),
            commit: false,
            request: None,
            old_ballots: Vec::new(),
        }
    }
}

/// Owns the replicated log plus its execute/global-execute watermarks.
/// `ballot`/`active`/`slot` live on [`crate::paxos::PaxosCore`] instead,
/// which holds a `CommandLog`.
pub struct CommandLog {
    pub log: BTreeMap<u64, LogEntry>,
    /// Next slot to apply to the state machine.
    pub execute: u64,
    /// Cluster-wide watermark: min of `last_execute_by_node` across known
    /// ids, an unknown id counting as `execute` (§4.2).
    pub global_execute: u64,
    pub last_execute_by_node: HashMap<Id, u64>,
}

impl Default for CommandLog {
    fn default() -> Self {
        CommandLog {
            log: BTreeMap::new(),
            // Slots are 1-indexed (`propose` allocates starting at 1), so
            // the first slot to execute is 1, not 0.
            execute: 1,
            global_execute: 1,
            last_execute_by_node: HashMap::new(),
        }
    }
}

impl CommandLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or overwrites the entry at `slot`. Invariant 3 (§3): callers
    /// must never overwrite a committed entry; this is enforced by the
    /// callers in `paxos.rs`, not re-checked here.
    pub fn append(&mut self, slot: u64, entry: LogEntry) {
        self.log.insert(slot, entry);
    }

    pub fn get(&self, slot: u64) -> Option<&LogEntry> {
        self.log.get(&slot)
    }

    pub fn get_mut(&mut self, slot: u64) -> Option<&mut LogEntry> {
        self.log.get_mut(&slot)
    }

    /// Marks `slot` committed. Monotonic: never un-commits (§3).
    pub fn commit(&mut self, slot: u64) {
        if let Some(entry) = self.log.get_mut(&slot) {
            entry.commit = true;
        }
    }

    /// Applies every contiguous committed entry starting at `execute`,
    /// producing a reply for the originating client and advancing
    /// `execute`. Returns the slots applied, for P3 dissemination
    /// bookkeeping.
    pub fn try_execute(&mut self, sm: &mut dyn StateMachine) -> Vec<u64> {
        let mut applied = Vec::new();
        loop {
            let slot = self.execute;
            let is_committed = matches!(self.log.get(&slot), Some(e) if e.commit);
            if !is_committed {
                break;
            }
            let mut entry = self.log.remove(&slot).expect("checked above");
            let value = sm.apply(&entry.command);
            if let Some(handle) = entry.request.take() {
                handle.reply(Reply {
                    command_id: entry.command.id,
                    value,
                });
            }
            // Put the entry back (minus the handle, which is one-shot) so
            // recovery/cleanup can still see it until global_execute
            // catches up.
            self.log.insert(slot, entry);
            applied.push(slot);
            self.execute += 1;
            debug!("executed slot {}", slot);
        }
        applied
    }

    /// Records the execute watermark `relay_id` reported (via
    /// `P2bAggregated`, §4.7) and recomputes `global_execute`.
    pub fn update_last_execute(&mut self, relay_id: Id, last_execute: u64, known_ids: &[Id]) {
        self.last_execute_by_node.insert(relay_id, last_execute);
        self.recompute_global_execute(known_ids);
    }

    /// `global_execute = min(last_execute_by_node ∪ {execute})` over known
    /// ids; an id absent from `last_execute_by_node` counts as `execute`.
    pub fn recompute_global_execute(&mut self, known_ids: &[Id]) {
        let mut min = self.execute;
        for id in known_ids {
            let reported = self
                .last_execute_by_node
                .get(id)
                .copied()
                .unwrap_or(self.execute);
            min = min.min(reported);
        }
        self.global_execute = min;
    }

    /// Removes entries that are both committed and `<= global_execute`
    /// (§3 invariant 2, §4.2).
    pub fn cleanup(&mut self) {
        let cutoff = self.global_execute;
        let to_remove: Vec<u64> = self
            .log
            .iter()
            .filter(|(&slot, entry)| slot <= cutoff && entry.commit)
            .map(|(&slot, _)| slot)
            .collect();
        for slot in to_remove {
            self.log.remove(&slot);
        }
    }

    /// Walks `[from, through]` looking for the highest slot that mentions
    /// `key`, used by the in-progress read path (§4.3).
    pub fn find_in_progress(&self, from: u64, through: u64, key: &str) -> Option<&LogEntry> {
        for slot in (from..=through).rev() {
            if let Some(entry) = self.log.get(&slot) {
                if entry.command.key == key {
                    return Some(entry);
                }
            }
        }
        None
    }

    /// A synthetic command id for internally generated no-ops, distinct
    /// from any real client request.
    pub fn internal_command_id(owner: Id, slot: u64) -> CommandId {
        CommandId {
            client: owner,
            seq: slot,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{noop, CommandKind};
    use crate::statemachine::KvStore;

    fn put(id: Id, slot: u64, key: &str, value: &str) -> LogEntry {
        LogEntry::new(
            Ballot::new(1, id),
            Command {
                key: key.into(),
                value: value.into(),
                kind: CommandKind::Put,
                id: CommandLog::internal_command_id(id, slot),
            },
        )
    }

    #[test]
    fn try_execute_applies_contiguous_committed_prefix() {
        let id = Id::new(1, 1);
        let mut cl = CommandLog::new();
        let mut sm = KvStore::default();
        cl.append(1, put(id, 1, "a", "1"));
        cl.append(2, put(id, 2, "a", "2"));
        cl.commit(1);
        cl.commit(2);
        let applied = cl.try_execute(&mut sm);
        assert_eq!(applied, vec![1, 2]);
        assert_eq!(cl.execute, 3);
    }

    #[test]
    fn try_execute_stops_at_gap() {
        let id = Id::new(1, 1);
        let mut cl = CommandLog::new();
        let mut sm = KvStore::default();
        cl.append(1, put(id, 1, "a", "1"));
        cl.append(2, put(id, 2, "a", "2"));
        cl.commit(2); // slot 1 not committed yet
        let applied = cl.try_execute(&mut sm);
        assert!(applied.is_empty());
        assert_eq!(cl.execute, 1);
    }

    #[test]
    fn cleanup_removes_committed_entries_below_global_execute() {
        let id = Id::new(1, 1);
        let mut cl = CommandLog::new();
        let mut sm = KvStore::default();
        cl.append(1, put(id, 1, "a", "1"));
        cl.commit(1);
        cl.try_execute(&mut sm);
        cl.recompute_global_execute(&[id]);
        cl.cleanup();
        assert!(cl.get(1).is_none());
    }

    #[test]
    fn global_execute_treats_unknown_ids_as_self_execute() {
        let a = Id::new(1, 1);
        let b = Id::new(1, 2);
        let mut cl = CommandLog::new();
        cl.execute = 5;
        cl.update_last_execute(a, 3, &[a, b]);
        // b unknown -> counts as execute (5); min(3, 5) = 3
        assert_eq!(cl.global_execute, 3);
    }

    #[test]
    fn noop_command_has_empty_key_and_value() {
        let n = noop(CommandLog::internal_command_id(Id::new(1, 1), 0));
        assert!(n.key.is_empty());
        assert!(n.value.is_empty());
    }
}
