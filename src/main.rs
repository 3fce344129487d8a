//! Peer Finder
//!
//! Watches the output of a running P2P node, pulls peer addresses out of
//! it, enriches them with geolocation data, tracks their liveness and
//! streams every change to live observers.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       PEER FINDER                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Log Scanners (stdout/stderr) ←── Node output lines         │
//! │  Enrichment Client            ←── Rate-limited geo lookups  │
//! │  Node Registry (RocksDB)      ←── Per-address node state    │
//! │  Liveness Probe               ←── TCP/ICMP every 2m         │
//! │  Update Broadcaster           ──→ Live observers            │
//! │  HTTP API (8080)              ←── /ws, /nodes, /metrics     │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

mod api;
mod broadcast;
mod config;
mod enrichment;
mod liveness;
mod registry;
mod scanner;
mod shutdown;
mod source;
mod types;

use api::{ApiState, Metrics};
use broadcast::UpdateBroadcaster;
use config::PeerFinderConfig;
use enrichment::{EnrichmentClient, RateLimiter};
use liveness::{LivenessProbe, TcpEchoProbe};
use registry::NodeRegistry;
use scanner::{DiscoveredPeers, Discovery, LogStreamScanner, ScannerSettings};
use shutdown::Shutdown;
use source::NodeProcess;

/// Peer Finder - passive peer discovery and liveness tracking
#[derive(Parser, Debug)]
#[command(name = "peer-finder")]
#[command(author = "Peer Finder Contributors")]
#[command(version)]
#[command(about = "Discovers peers from node output and tracks their liveness", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "peer-finder.toml")]
    config: PathBuf,

    /// Data directory for the node registry
    #[arg(short, long, default_value = "./data")]
    data_dir: PathBuf,

    /// HTTP API port
    #[arg(long)]
    api_port: Option<u16>,

    /// Node service port dialled by the liveness probe
    #[arg(long)]
    probe_port: Option<u16>,

    /// Base URL of the geolocation lookup service
    #[arg(long)]
    enrichment_url: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Node command to run and scan; stdin is scanned when omitted
    #[arg(last = true)]
    node_command: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .init();

    info!("🔭 Peer Finder v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = if args.config.exists() {
        PeerFinderConfig::load(&args.config)?
    } else {
        warn!("Config file not found, using defaults");
        PeerFinderConfig::default()
    };

    // Override config with CLI args
    let config = config
        .with_api_port(args.api_port)
        .with_probe_port(args.probe_port)
        .with_enrichment_url(args.enrichment_url)
        .with_node_command(args.node_command);

    config.validate()?;

    info!("⚙️  Configuration:");
    info!("   API port: {}", config.api_port);
    info!("   Probe port: {}", config.probe_port);
    info!("   Probe interval: {}s", config.probe_interval_secs);
    info!(
        "   Enrichment: {} ({}/s, burst {})",
        config.enrichment_url, config.enrichment_rate_per_sec, config.enrichment_burst
    );

    let config = Arc::new(config);

    // Open the registry; nothing works without it
    tokio::fs::create_dir_all(&args.data_dir).await?;
    let registry_path = args.data_dir.join("node_registry");
    let registry = Arc::new(NodeRegistry::open(&registry_path)?);
    info!(
        "📦 Node registry opened at {:?} ({} nodes)",
        registry_path,
        registry.len()
    );

    let discovered = Arc::new(DiscoveredPeers::seeded(registry.load_peer_set()?));
    info!("   {} known peers from previous runs", discovered.len());

    let metrics = Arc::new(Metrics::new());
    let (trigger, shutdown) = shutdown::channel();

    // Pipeline
    let broadcaster = Arc::new(UpdateBroadcaster::new(
        registry.clone(),
        metrics.clone(),
        config.subscriber_queue,
    ));

    let liveness = Arc::new(LivenessProbe::new(
        Arc::new(TcpEchoProbe::new(
            config.probe_port,
            Duration::from_secs(config.probe_timeout_secs),
        )),
        registry.clone(),
        broadcaster.clone(),
        metrics.clone(),
        config.probe_min_recheck(),
        config.probe_workers,
    ));

    let lookup = EnrichmentClient::new(
        &config.enrichment_url,
        Duration::from_secs(config.enrichment_timeout_secs),
        RateLimiter::new(config.enrichment_rate_per_sec, config.enrichment_burst),
    )?;

    let discovery = Arc::new(Discovery::new(
        registry.clone(),
        Arc::new(lookup),
        liveness.clone(),
        metrics.clone(),
        config.rediscovery_window(),
    ));

    let settings = ScannerSettings {
        dedup_window: config.dedup_window(),
        cooldown: Duration::from_secs(config.rate_limit_cooldown_secs),
        max_line_bytes: config.max_line_bytes,
        queue_size: config.discovery_queue,
    };
    let new_scanner = |name: &str| {
        Arc::new(LogStreamScanner::new(
            name,
            discovery.clone(),
            discovered.clone(),
            metrics.clone(),
            settings.clone(),
        ))
    };

    // Output sources
    let mut scanners = Vec::new();
    let mut scan_handles = Vec::new();
    let mut node_child = None;

    if config.node_command.is_empty() {
        info!("No node command configured, scanning stdin");
        let stdin = new_scanner("stdin");
        scan_handles.push(tokio::spawn(
            stdin.clone().run(tokio::io::stdin(), shutdown.clone()),
        ));
        scanners.push(stdin);
    } else {
        let (child, stdout, stderr) = NodeProcess::spawn(&config.node_command)?.into_parts();
        node_child = Some(child);

        let out = new_scanner("stdout");
        scan_handles.push(tokio::spawn(out.clone().run(stdout, shutdown.clone())));
        scanners.push(out);

        let err = new_scanner("stderr");
        scan_handles.push(tokio::spawn(err.clone().run(stderr, shutdown.clone())));
        scanners.push(err);
    }

    // Background services
    let sweep_handle = tokio::spawn(scanner::run_sweep(
        scanners,
        discovered.clone(),
        registry.clone(),
        Duration::from_secs(config.sweep_interval_secs),
        shutdown.clone(),
    ));

    let liveness_handle = tokio::spawn(
        liveness.clone().run(config.probe_interval(), shutdown.clone()),
    );

    let api_state = Arc::new(ApiState {
        config: config.clone(),
        registry: registry.clone(),
        broadcaster: broadcaster.clone(),
        liveness: liveness.clone(),
        discovered: discovered.clone(),
        metrics: metrics.clone(),
    });
    let mut api_handle = tokio::spawn(api::run_api_server(api_state, shutdown.clone()));

    let maintenance_handle = tokio::spawn(run_maintenance(
        config.clone(),
        registry.clone(),
        discovered.clone(),
        broadcaster.clone(),
        metrics.clone(),
        shutdown.clone(),
    ));

    info!("✅ All services started");
    info!("   Press Ctrl+C to shutdown gracefully");

    let scanners_done = futures_util::future::join_all(scan_handles);
    tokio::pin!(scanners_done);

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("🛑 Shutdown signal received");
        }
        status = async {
            match node_child.as_mut() {
                Some(child) => child.wait().await,
                None => std::future::pending().await,
            }
        } => {
            warn!("Node process exited: {:?}", status);
        }
        results = &mut scanners_done => {
            for result in results {
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => error!("Scanner stopped: {}", e),
                    Err(e) => error!("Scanner task panicked: {}", e),
                }
            }
            info!("All output streams closed");
        }
        result = &mut api_handle => {
            error!("HTTP API exited: {:?}", result);
        }
    }

    trigger.trigger();

    // Let the sweep write its final peer set snapshot
    let stopped = tokio::time::timeout(Duration::from_secs(10), async {
        let _ = sweep_handle.await;
        let _ = liveness_handle.await;
        let _ = maintenance_handle.await;
    })
    .await;
    if stopped.is_err() {
        warn!("Background tasks did not stop in time");
    }

    registry.save_peer_set(&discovered.snapshot())?;
    registry.flush()?;
    info!("📦 Node registry flushed to disk");

    info!("👋 Peer Finder shutting down");
    Ok(())
}

/// Periodic status report
async fn run_maintenance(
    config: Arc<PeerFinderConfig>,
    registry: Arc<NodeRegistry>,
    discovered: Arc<DiscoveredPeers>,
    broadcaster: Arc<UpdateBroadcaster>,
    metrics: Arc<Metrics>,
    mut shutdown: Shutdown,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(config.sweep_interval_secs));
    let stale_after = config.probe_interval() * 5;

    loop {
        tokio::select! {
            _ = shutdown.triggered() => break,
            _ = interval.tick() => {}
        }

        let stats = registry.stats();
        metrics.set_registry_stats(&stats);
        metrics.set_known_peers(discovered.len() as u64);

        info!(
            "📊 Status: {} nodes ({} online, {} staking, {} stale), {} known peers, {} observers",
            stats.total_nodes,
            stats.online_nodes,
            stats.staking_nodes,
            registry.get_stale(stale_after).len(),
            discovered.len(),
            broadcaster.subscriber_count()
        );
    }
}
