// src/main.rs
//
// Node binary that wires up the chain library:
//
// - RocksDB-backed durable state
// - File-backed block, nonce, and event storage under --root
// - Prometheus metrics exporter on /metrics
// - The pump loop driving processing, validation, and block minting.

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use chain::{
    Block,
    Hlc,
    Node,
    NodeConfig,
    NullPublisher,
    PeerSet,
    RocksDbKvStore,
    SetterExecutor,
    Wallet,
    codec,
    run_prometheus_http_server,
};

/// BFT-style chain node ordered by hybrid logical clocks.
#[derive(Debug, Parser)]
#[command(name = "chain", version, about)]
struct Cli {
    /// Hex-encoded 32-byte signing key seed. A fresh key is generated
    /// when omitted.
    #[arg(long)]
    wallet: Option<String>,

    /// Bootstrap peers as `vk@ip` pairs.
    #[arg(long, value_delimiter = ',')]
    bootnodes: Vec<String>,

    /// Path to the canonical-JSON genesis block file.
    #[arg(long)]
    genesis: Option<PathBuf>,

    /// Roll the chain back to this HLC timestamp before starting.
    #[arg(long, value_name = "HLC")]
    rollback_to: Option<String>,

    /// Height at or below which signature verification is skipped.
    #[arg(long, value_name = "N")]
    safe_block_height: Option<u64>,

    /// Skip peer catch-up at startup.
    #[arg(long)]
    no_catchup: bool,

    /// Skip whole-chain validation at startup.
    #[arg(long)]
    no_validate_chain: bool,

    /// Storage root for blocks, nonces, events, and state.
    #[arg(long, default_value = "data/chain")]
    root: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    match run_node(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("fatal error: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn run_node(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let wallet = match &cli.wallet {
        Some(seed) => Wallet::from_seed_hex(seed)?,
        None => Wallet::new(),
    };
    info!(vk = %wallet.verifying_key(), "loaded wallet");

    let mut config = NodeConfig::rooted(&cli.root);
    config.run_catchup = !cli.no_catchup;
    config.run_validation = !cli.no_validate_chain;
    config.safe_block_num = cli.safe_block_height;
    config.rollback_point = cli.rollback_to.as_deref().map(Hlc::new);

    let genesis_block = match &cli.genesis {
        Some(path) => {
            let encoded = fs::read_to_string(path)?;
            let block: Block = codec::decode(&encoded)?;
            Some(block)
        }
        None => None,
    };

    if !cli.bootnodes.is_empty() {
        // Socket-level peer connections are provided by the deployment's
        // network layer; the bare binary starts without live peers.
        info!(bootnodes = ?cli.bootnodes, "bootnodes configured");
    }

    let durable = RocksDbKvStore::open(&config.state)?;

    let metrics_config = config.metrics.clone();
    let mut node = Node::new(
        config,
        wallet,
        Box::new(durable),
        Box::new(SetterExecutor),
        Arc::new(NullPublisher),
        PeerSet::default(),
    )?;

    if metrics_config.enabled {
        let metrics = node.metrics();
        let addr = metrics_config.listen_addr;
        tokio::spawn(async move {
            if let Err(e) = run_prometheus_http_server(metrics, addr).await {
                error!("metrics HTTP server error: {e}");
            }
        });
        info!("metrics exporter listening on http://{addr}/metrics");
    }

    node.start(genesis_block).await?;

    // Stop cleanly on ctrl-c.
    let running = node.running_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received ctrl-c, stopping");
            running.store(false, Ordering::SeqCst);
        }
    });

    node.run().await?;
    info!("node stopped");
    Ok(())
}
