// Use library exports instead of declaring local modules to avoid duplicate crate types
use anyhow::{Context, bail};
use clap::Parser;
use log::{info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use syncpoint_config::Config;
use syncpoint_core::blockchain::BlockIndex;
use syncpoint_core::checkpoint::{CheckpointDepth, Synchronizer};
use syncpoint_core::config::{ConsensusParams, MIN_RECOMMENDED_DEPTH, Network};
use syncpoint_core::crypto::Secp256k1Engine;
use syncpoint_core::db::{CheckpointStore, HeaderStore, MemoryCheckpointStore, RocksCheckpointStore};
use syncpoint_node::NodeHandles;
use syncpoint_node::p2p::service::P2PService;
use syncpoint_node::server::run_server;
use tokio::signal;

#[derive(Parser, Debug)]
#[command(name = "syncpoint-node", version, about = "Checkpoint-synchronized header node")]
struct Args {
    /// Auto checkpoint lag in blocks (negative: manual checkpoints only)
    #[arg(long = "checkpointdepth", allow_negative_numbers = true)]
    checkpoint_depth: Option<i64>,

    /// Checkpoint master private key (hex)
    #[arg(long = "checkpointkey")]
    checkpoint_key: Option<String>,

    #[arg(long = "datadir")]
    data_dir: Option<String>,

    /// Keep checkpoint state in memory only
    #[arg(long)]
    ephemeral: bool,

    /// Peer to connect to; may be repeated
    #[arg(long = "connect")]
    connect: Vec<String>,

    #[arg(long)]
    network: Option<Network>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut cfg = Config::load().context("failed to load configuration")?;

    if let Some(depth) = args.checkpoint_depth {
        cfg.checkpoint_depth = depth;
    }
    if args.checkpoint_key.is_some() {
        cfg.checkpoint_key = args.checkpoint_key.clone();
    }
    if let Some(dir) = &args.data_dir {
        cfg.data_dir = dir.clone();
    }
    cfg.peers.extend(args.connect.iter().cloned());

    let network = match args.network {
        Some(n) => n,
        None => cfg
            .network
            .parse::<Network>()
            .map_err(anyhow::Error::msg)
            .context("invalid network in configuration")?,
    };
    let params = ConsensusParams::for_network(network)?;
    info!("Syncpoint node starting on {}", network);

    let (store, headers): (Arc<dyn CheckpointStore>, Arc<dyn HeaderStore>) = if args.ephemeral {
        warn!("Ephemeral mode: checkpoint state will not survive restart");
        let mem = Arc::new(MemoryCheckpointStore::new());
        (mem.clone() as Arc<dyn CheckpointStore>, mem as Arc<dyn HeaderStore>)
    } else {
        let path = cfg.data_dir_resolved().join("checkpoints");
        std::fs::create_dir_all(&path)
            .with_context(|| format!("failed to create data dir {:?}", path))?;
        let db = Arc::new(
            RocksCheckpointStore::open(&path)
                .with_context(|| format!("failed to open checkpoint db at {:?}", path))?,
        );
        (db.clone() as Arc<dyn CheckpointStore>, db as Arc<dyn HeaderStore>)
    };

    let index = BlockIndex::restore(
        &params.genesis,
        headers.read_headers().context("failed to read stored headers")?,
        headers.read_tip().context("failed to read stored tip")?,
    )?;
    let sync = Synchronizer::open(params, store, Arc::new(Secp256k1Engine::new()))
        .context("failed to initialize checkpoint state")?;
    sync.ensure_active_indexed(&index)?;
    info!("Sync checkpoint: {}", sync.active());

    if let Some(key) = &cfg.checkpoint_key {
        sync.set_master_key(key)
            .context("invalid checkpoint master key")?;
    }

    let depth = CheckpointDepth::from(cfg.checkpoint_depth);
    match depth {
        CheckpointDepth::Lag(lag) if lag < MIN_RECOMMENDED_DEPTH => warn!(
            "checkpoint depth {} is below the recommended minimum of {}",
            lag, MIN_RECOMMENDED_DEPTH
        ),
        CheckpointDepth::Lag(_) if !sync.is_master() => {
            bail!("checkpointdepth requires a checkpoint master key")
        }
        _ => {}
    }

    let node = Arc::new(NodeHandles::new(index, sync, headers, depth));

    let p2p_service = P2PService::new(node.p2p.clone());
    p2p_service
        .start(cfg.p2p_bind.clone(), cfg.peers.clone(), node.clone())
        .await
        .context("p2p start failed")?;

    let rpc_addr: SocketAddr = cfg
        .rpc_bind
        .parse()
        .with_context(|| format!("invalid rpc_bind {}", cfg.rpc_bind))?;
    let server_node = node.clone();
    tokio::spawn(async move {
        run_server(server_node, rpc_addr).await;
    });

    signal::ctrl_c().await?;
    info!("Shutting down at height {}", node.height());
    Ok(())
}
