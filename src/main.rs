use std::net::SocketAddr;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use kadmesh::{Keypair, Node, NodeConfig, WhisperRouting};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Routing {
    Iterative,
    Recursive,
}

impl From<Routing> for WhisperRouting {
    fn from(routing: Routing) -> Self {
        match routing {
            Routing::Iterative => WhisperRouting::Iterative,
            Routing::Recursive => WhisperRouting::Recursive,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "kadmesh")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0:0")]
    bind: SocketAddr,

    /// Endpoint announced to peers (defaults to the bound address).
    #[arg(short, long)]
    advertise: Option<String>,

    /// Peers to dial at startup, as HOST:PORT.
    #[arg(short = 'B', long = "bootstrap", value_name = "ENDPOINT")]
    bootstrap: Vec<String>,

    /// Hex-encoded 32-byte Ed25519 secret key. A fresh key is generated if omitted.
    #[arg(long, value_name = "HEX")]
    secret_key: Option<String>,

    #[arg(long, default_value = "kadmesh")]
    network: String,

    #[arg(short, long, default_value_t = 20)]
    k: u32,

    #[arg(long, default_value_t = 3)]
    alpha: u32,

    #[arg(long, default_value_t = 256)]
    tau: u32,

    /// Outward connection limit.
    #[arg(long, default_value_t = 4)]
    ell: u32,

    #[arg(long, value_enum, default_value = "iterative")]
    whisper_routing: Routing,

    #[arg(short, long, default_value = "300")]
    telemetry_interval: u64,
}

fn load_keypair(secret_key: Option<&str>) -> Result<Keypair> {
    let Some(hex_key) = secret_key else {
        return Ok(Keypair::generate());
    };
    let bytes = hex::decode(hex_key).context("invalid hex secret key")?;
    let secret: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| anyhow::anyhow!("secret key must be 64 hex characters (32 bytes)"))?;
    Ok(Keypair::from_secret_key_bytes(&secret))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let mut config = NodeConfig {
        advertised_endpoint: args.advertise.clone(),
        whisper_routing: args.whisper_routing.into(),
        ..NodeConfig::default()
    };
    config.subnet.k = args.k;
    config.subnet.alpha = args.alpha;
    config.subnet.tau = args.tau;
    config.subnet.ell = args.ell;
    config.subnet.network = args.network.clone();

    let keypair = load_keypair(args.secret_key.as_deref())?;
    let node = Node::bind_with(&args.bind.to_string(), keypair, config).await?;
    info!("Node address: {}", node.address());
    info!("Node endpoint: {}", node.endpoint());

    for endpoint in &args.bootstrap {
        info!("Bootstrapping from {}", endpoint);
        match node.connect(endpoint).await {
            Ok(peer) => {
                info!(peer = %peer, "Bootstrap connection established");
                match node.lookup(&node.address()).await {
                    Ok(found) => info!(found = found.len(), "Self lookup complete"),
                    Err(e) => warn!(error = %e, "Self lookup failed"),
                }
            }
            Err(e) => {
                warn!(error = %e, "Bootstrap failed");
            }
        }
    }
    if !args.bootstrap.is_empty()
        && let Err(e) = node.announce().await
    {
        warn!(error = %e, "Announce failed");
    }

    let mut interval = time::interval(Duration::from_secs(args.telemetry_interval.max(1)));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            _ = interval.tick() => {
                let snapshot = node.routing_snapshot().await;
                info!(
                    peers = node.peers().len(),
                    routing_peers = snapshot.peers,
                    bucket_fill = ?snapshot.bucket_fill,
                    stored_keys = snapshot.stored_keys,
                    cached_nodes = snapshot.cached_nodes,
                    "telemetry snapshot"
                );
            }
        }
    }

    node.shutdown().await;
    Ok(())
}
