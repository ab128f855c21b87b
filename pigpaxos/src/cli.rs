//! Command-line flags (§4.14, §6): cluster tuning knobs plus the
//! bookkeeping needed to select the local node and config file.

use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(name = "pigpaxos", about = "A layered-Paxos replica node")]
pub struct Cli {
    /// This node's id, in "zone.node" form, e.g. "1.1".
    #[structopt(long)]
    pub id: String,

    /// Path to the cluster configuration document (§6).
    #[structopt(long)]
    pub config: String,

    /// Number of relay groups to partition the cluster into (`--npg`).
    #[structopt(long = "npg", default_value = "2")]
    pub num_groups: usize,

    /// Partition by region (one group per zone) instead of numerically
    /// (`--wrpg`).
    #[structopt(long = "wrpg")]
    pub region_partition: bool,

    /// Use a fixed relay per group, sampled once at startup, instead of
    /// a fresh random pick every round (`--wfr`).
    #[structopt(long = "wfr")]
    pub fixed_relay: bool,

    /// Stable leader: if set, a non-leader forwards requests to the
    /// current leader instead of trying to drive consensus itself
    /// (`--sld`).
    #[structopt(long = "sld")]
    pub stable_leader: bool,

    /// Use the compact `P2bAggregated` relay reply (`--usp2b`).
    #[structopt(long = "usp2b")]
    pub use_small_p2b: bool,

    /// Per-phase timeout in milliseconds, after which non-collected
    /// responses are treated as failures (`--ptt`).
    #[structopt(long = "ptt", default_value = "50")]
    pub phase_timeout_ms: u64,

    /// Slack for relay-group waiting: ignore this many of the slowest
    /// nodes in a group (`--nrgslack`).
    #[structopt(long = "nrgslack", default_value = "0")]
    pub relay_group_slack: usize,

    /// Run this node as a Paxos leader from startup, never stepping down
    /// on its own initiative (`--ephemeral-leader`).
    #[structopt(long = "ephemeral-leader")]
    pub ephemeral_leader: bool,

    /// Read policy: "majority", "leader", or "any" (`--read`).
    #[structopt(long = "read", default_value = "majority")]
    pub read_policy: String,

    /// Log level passed straight to `env_logger` (`--log`).
    #[structopt(long = "log", default_value = "info")]
    pub log: String,
}
