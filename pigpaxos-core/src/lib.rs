//! Core library for a hierarchical ("layered") Paxos replica (§1-§4):
//! classic multi-decree Paxos over a replicated command log, with
//! acceptor responses aggregated through a two-level tree of relay
//! nodes rather than flowing individually back to the leader.
//!
//! This crate is transport- and clock-agnostic: [`transport::Transport`]
//! and [`clock::Clock`] are the seams a binary crate fills in (see the
//! `pigpaxos` crate for a TCP-backed reference implementation, and
//! `pigpaxos-testkit` for an in-memory one used by tests).

pub mod ballot;
pub mod clock;
pub mod command;
pub mod commit;
pub mod config;
pub mod error;
pub mod frontend;
pub mod gray;
pub mod handle;
pub mod id;
pub mod log;
pub mod messages;
pub mod paxos;
pub mod relay;
pub mod replica;
pub mod router;
pub mod statemachine;
pub mod ticker;
pub mod transport;

pub use ballot::Ballot;
pub use command::{Command, CommandId, CommandKind, ReadReply, Reply};
pub use error::{PigpaxosError, Result};
pub use id::Id;
pub use replica::{FlatReplica, Replica, Submission};
pub use transport::Transport;
