//! The deterministic state machine commands are applied to.

use std::collections::HashMap;

use crate::command::Command;

/// What `try_execute()` (§4.2) applies committed commands to.
pub trait StateMachine: Send + Sync {
    /// Applies `command` and returns the value to reply with (the prior
    /// value for a `Put`, the stored value for a `Get`).
    fn apply(&mut self, command: &Command) -> String;
}

/// A trivial in-memory key/value store, used by tests and the reference
/// binary.
#[derive(Default)]
pub struct KvStore {
    data: HashMap<String, String>,
}

impl StateMachine for KvStore {
    fn apply(&mut self, command: &Command) -> String {
        match command.kind {
            crate::command::CommandKind::Get => {
                self.data.get(&command.key).cloned().unwrap_or_default()
            }
            crate::command::CommandKind::Put => self
                .data
                .insert(command.key.clone(), command.value.clone())
                .unwrap_or_default(),
        }
    }
}
