mod devnet;

use anyhow::{Context, Result};
use chain::NodeConfig;
use clap::Parser;
use devnet::Devnet;
use metrics::server::{run_metrics_server, MetricsServerConfig};
use metrics::Metrics;
use networking::sync::{ConsensusVerifier, SyncNode};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
struct Args {
    /// YAML node config; defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long, default_value = "127.0.0.1")]
    metrics_address: IpAddr,

    #[arg(long, default_value_t = 9090)]
    metrics_port: u16,

    /// Simulated peers serving the devnet chain.
    #[arg(long, default_value_t = 4)]
    devnet_peers: usize,

    /// Blocks produced before the node starts.
    #[arg(long, default_value_t = 64)]
    devnet_blocks: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => NodeConfig::load_from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => NodeConfig::default(),
    };
    info!(?config, "Loaded node config");

    let metrics = Arc::new(Metrics::new().context("failed to register metrics")?);
    let shutdown = CancellationToken::new();

    let metrics_server = tokio::spawn(run_metrics_server(
        MetricsServerConfig {
            metrics_address: args.metrics_address,
            metrics_port: args.metrics_port,
        },
        metrics.clone(),
        shutdown.clone(),
    ));

    let devnet = Devnet::new(&config.chain, args.devnet_peers, args.devnet_blocks);
    let node = SyncNode::new(
        config.sync.clone(),
        devnet.transport(),
        devnet.oracle(),
        devnet.bridge(),
        devnet.engine(),
        Arc::new(ConsensusVerifier),
        Some(metrics),
    );

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Received Ctrl-C, shutting down");
                    shutdown.cancel();
                }
                Err(err) => warn!(error = %err, "Failed to listen for Ctrl-C"),
            }
        }
    });

    let result = node.run(shutdown.clone()).await;
    shutdown.cancel();

    match metrics_server.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(error = %err, "Metrics server failed"),
        Err(err) => warn!(error = %err, "Metrics server task failed"),
    }

    result?;
    info!("Main async task exiting...");
    Ok(())
}
