//! Reference node binary (§6, §4.14): loads configuration and CLI flags,
//! wires a [`Replica`] to a [`TcpTransport`], and runs it until interrupted.

mod cli;
mod transport_tcp;

use std::collections::HashMap;
use std::fs;
use std::sync::Arc;

use log::{error, info};
use structopt::StructOpt;
use tokio::sync::{broadcast, mpsc};

use pigpaxos_core::config::Config;
use pigpaxos_core::gray::GrayList;
use pigpaxos_core::id::Id;
use pigpaxos_core::relay::{PartitionMode, RelayGroups, RelayPolicy};
use pigpaxos_core::replica::Replica;
use pigpaxos_core::statemachine::KvStore;
use pigpaxos_core::ticker::TickerConfig;

use cli::Cli;
use transport_tcp::TcpTransport;

/// Strips a `tcp://` scheme, leaving the bare `host:port` form
/// `TcpStream::connect`/`TcpListener::bind` expect.
fn strip_scheme(url: &str) -> &str {
    url.strip_prefix("tcp://").unwrap_or(url)
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let cli = Cli::from_args();
    env_logger::Builder::new().parse_filters(&cli.log).init();

    let self_id: Id = match cli.id.parse() {
        Ok(id) => id,
        Err(e) => {
            error!("invalid --id {:?}: {}", cli.id, e);
            return std::process::ExitCode::FAILURE;
        }
    };

    let text = match fs::read_to_string(&cli.config) {
        Ok(text) => text,
        Err(e) => {
            error!("failed to read config {:?}: {}", cli.config, e);
            return std::process::ExitCode::FAILURE;
        }
    };
    let config = match Config::from_json(&text) {
        Ok(config) => config,
        Err(e) => {
            error!("failed to parse config {:?}: {}", cli.config, e);
            return std::process::ExitCode::FAILURE;
        }
    };

    let known_ids = config.known_ids();
    if !known_ids.contains(&self_id) {
        error!("{} is not present in the configured address map", self_id);
        return std::process::ExitCode::FAILURE;
    }

    let addresses: HashMap<Id, String> = known_ids
        .iter()
        .filter_map(|&id| config.address_of(id).map(|addr| (id, strip_scheme(addr).to_string())))
        .collect();
    let bind_addr = addresses[&self_id].clone();

    let partition_mode = if cli.region_partition {
        PartitionMode::Region
    } else {
        PartitionMode::Numeric(cli.num_groups)
    };
    let relay_policy = if cli.fixed_relay { RelayPolicy::Fixed } else { RelayPolicy::Random };
    let relay_groups = RelayGroups::build(self_id, &known_ids, partition_mode, relay_policy);

    // GrayTimeoutMultiplier (1000) and the relay tree's depth (2) are fixed
    // constants in the original source, not CLI-configurable.
    let gray_timeout =
        pigpaxos_core::ticker::TICK_DURATION * pigpaxos_core::ticker::DEFAULT_GRAY_TIMEOUT_MULTIPLIER as u32;
    let gray = GrayList::new(gray_timeout);

    if cli.relay_group_slack != 0 {
        info!("--nrgslack={} accepted but not yet applied to aggregation release", cli.relay_group_slack);
    }

    let ticker_config = TickerConfig {
        cleanup_multiplier: pigpaxos_core::ticker::DEFAULT_CLEANUP_MULTIPLIER,
        gray_timeout_multiplier: pigpaxos_core::ticker::DEFAULT_GRAY_TIMEOUT_MULTIPLIER,
        phase_timeout: std::time::Duration::from_millis(cli.phase_timeout_ms),
    };

    const RELAY_TREE_DEPTH: u8 = 2;

    let transport = Arc::new(TcpTransport::new(self_id, addresses));
    let sm = Box::new(KvStore::default());

    let replica = Arc::new(Replica::new(
        self_id,
        known_ids.len(),
        cli.read_policy.clone(),
        cli.stable_leader,
        transport.clone(),
        relay_groups,
        RELAY_TREE_DEPTH,
        cli.use_small_p2b,
        gray,
        ticker_config,
        sm,
    ));

    let (shutdown_tx, _) = broadcast::channel(1);

    let (dispatch_tx, mut dispatch_rx) = mpsc::unbounded_channel();
    let listen_transport = transport.clone();
    let listen_addr = bind_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = listen_transport.listen(&listen_addr, dispatch_tx).await {
            error!("listener failed: {}", e);
        }
    });

    let recv_replica = replica.clone();
    let mut recv_shutdown = shutdown_tx.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                msg = dispatch_rx.recv() => {
                    match msg {
                        Some((from, msg)) => { let _ = recv_replica.handle_message(from, msg).await; }
                        None => break,
                    }
                }
                _ = recv_shutdown.recv() => break,
            }
        }
    });

    let ticker_replica = replica.clone();
    let ticker_shutdown = shutdown_tx.subscribe();
    tokio::spawn(async move { ticker_replica.run_ticker(ticker_shutdown).await });

    if cli.ephemeral_leader {
        info!("{} starting as ephemeral leader", self_id);
        replica.force_leadership().await;
    }

    info!("{} up, listening on {}", self_id, bind_addr);
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for ctrl-c: {}", e);
    }
    info!("{} shutting down", self_id);
    let _ = shutdown_tx.send(());
    std::process::ExitCode::SUCCESS
}
