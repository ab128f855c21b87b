//! Client commands and replies (§3).

use serde::{Deserialize, Serialize};

use crate::id::Id;

/// Identifies a command for reply routing and dedup, carried end to end
/// from the client front-end through the log and back out as a reply.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
pub struct CommandId {
    pub client: Id,
    pub seq: u64,
}

/// Whether a [`Command`] reads or writes the state machine.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub enum CommandKind {
    Get,
    Put,
}

/// An opaque client operation.
#[derive(Clone, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct Command {
    pub key: String,
    pub value: String,
    pub kind: CommandKind,
    pub id: CommandId,
}

impl Command {
    pub fn is_read(&self) -> bool {
        self.kind == CommandKind::Get
    }

    pub fn get(id: CommandId, key: impl Into<String>) -> Self {
        Command {
            key: key.into(),
            value: String::new(),
            kind: CommandKind::Get,
            id,
        }
    }

    pub fn put(id: CommandId, key: impl Into<String>, value: impl Into<String>) -> Self {
        Command {
            key: key.into(),
            value: value.into(),
            kind: CommandKind::Put,
            id,
        }
    }
}

/// A no-op command proposed to fill an empty slot discovered during phase-1
/// collection (§4.3).
pub fn noop(id: CommandId) -> Command {
    Command {
        key: String::new(),
        value: String::new(),
        kind: CommandKind::Put,
        id,
    }
}

/// Reply delivered to a client for a request it made.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Reply {
    pub command_id: CommandId,
    pub value: String,
}

/// A read reply, carrying the admin headers named in §6 as struct fields
/// (HTTP is an external collaborator; the shape is preserved, the
/// transport is not).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReadReply {
    pub value: String,
    pub slot: u64,
    pub ballot: crate::ballot::Ballot,
    pub execute: u64,
    pub in_progress: bool,
}
