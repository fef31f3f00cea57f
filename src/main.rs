// RBD Usage Exporter
//
// A Rust-based Prometheus exporter that measures per-image disk usage on a
// Ceph RBD cluster. For every pool enabled for collection it enumerates the
// RBD images and computes, per image, provisioned and actually-used bytes —
// decoding the image's object map when the feature is enabled, falling back
// to the much slower `rbd du` query otherwise.
//
// Collection runs continuously on its own task; scrapes are served from the
// most recently published snapshot and always return instantly, even while
// a pass is in flight.
//
// # Usage
// rbd-usage-exporter [--conf <path>] [--cluster <name>] [--keyring <path>]
//                    [--host <addr>] [--port <port>]
//
// Each flag falls back to an environment variable (CEPH_CONF, CLUSTER_NAME,
// CEPH_KEYRING, RBD_EXPORTER_SERVER, RBD_EXPORTER_PORT) and then a default.
//
// NOTE: only pools opted in via
// `ceph config set mgr mgr/prometheus/rbd_stats_pools <pools>` are collected.

use anyhow::{Context, Result};
use std::env;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// Module declarations
mod ceph;
mod collector;
mod config;
mod server;
mod snapshot;
mod usage;

// Re-export for convenience
use ceph::CephCluster;
use collector::UsageCollector;
use config::ExporterConfig;
use snapshot::SnapshotPublisher;

/// Application entry point
///
/// This function:
/// 1. Initializes logging
/// 2. Parses command-line arguments and environment defaults
/// 3. Starts the collection loop on its own task
/// 4. Serves the metrics endpoint (runs forever)
#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging subsystem
    // Logs are written to stdout/stderr and can be captured by systemd
    init_logging();

    info!("=== RBD Usage Exporter Starting ===");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = parse_arguments()?;

    info!(
        "Cluster: {} (conf: {}, keyring: {})",
        config.cluster, config.conf, config.keyring
    );

    let addr = config
        .bind_addr()
        .context("Failed to resolve the bind address")?;

    // The publisher is the single point of contact between the collection
    // loop and the scrape endpoint
    let publisher = Arc::new(SnapshotPublisher::new());

    let cluster = CephCluster::new(&config);
    let usage_collector = UsageCollector::new(cluster, Arc::clone(&publisher));

    // Start the collection loop. It runs forever; the only error that can
    // escape it is the pool-list query failing, which is fatal.
    tokio::spawn(async move {
        if let Err(e) = usage_collector.run().await {
            error!("Collection loop aborted: {}", e);
            std::process::exit(1);
        }
    });

    info!("=== RBD Usage Exporter Started Successfully ===");
    info!("Press Ctrl+C to stop");

    // Serve scrapes forever
    server::serve(addr, publisher)
        .await
        .context("Metrics server failed")?;

    Ok(())
}

/// Parses command-line arguments into the exporter configuration
///
/// # Arguments
/// 1. --conf <path> - Path to the cluster configuration file (optional)
/// 2. --cluster <name> - Cluster name (optional)
/// 3. --keyring <path> - Path to the keyring (optional)
/// 4. --host <addr> - Bind host for the metrics endpoint (optional)
/// 5. --port <port> - Bind port for the metrics endpoint (optional)
///
/// Flags omitted on the command line fall back to environment variables
/// and then to fixed defaults (see the config module).
///
/// # Examples
/// ```bash
/// rbd-usage-exporter
/// rbd-usage-exporter --host 0.0.0.0 --port 9280
/// rbd-usage-exporter --cluster prod --conf /etc/ceph/prod.conf
/// ```
fn parse_arguments() -> Result<ExporterConfig> {
    let args: Vec<String> = env::args().collect();

    // Helper function to find argument value
    let find_arg = |flag: &str| -> Option<String> {
        args.iter()
            .position(|arg| arg == flag)
            .and_then(|pos| args.get(pos + 1))
            .map(|s| s.to_string())
    };

    let config = ExporterConfig::resolve(
        find_arg("--cluster"),
        find_arg("--conf"),
        find_arg("--keyring"),
        find_arg("--host"),
        find_arg("--port"),
    )
    .context("Invalid configuration")?;

    Ok(config)
}

/// Initializes the logging subsystem
///
/// Sets up structured logging with:
/// - Timestamp for each log entry
/// - Log level (INFO, WARN, ERROR, etc.)
/// - Target module name
/// - Colored output when running in terminal
/// - JSON output when running as systemd service
///
/// # Log Levels
/// Default: INFO
/// Can be overridden with RUST_LOG environment variable
///
/// # Examples
/// ```bash
/// RUST_LOG=debug rbd-usage-exporter ...  # Enable debug logging
/// RUST_LOG=warn rbd-usage-exporter ...   # Only warnings and errors
/// ```
fn init_logging() {
    // Determine if we're running under systemd
    // Systemd sets INVOCATION_ID environment variable
    let is_systemd = env::var("INVOCATION_ID").is_ok();

    // Create env filter
    // Default to INFO level, but allow override via RUST_LOG
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    if is_systemd {
        // When running under systemd, use JSON format for structured logging
        // This makes logs easier to parse and analyze
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .init();
    } else {
        // When running in terminal, use human-readable format with colors
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_level(true)
                    .with_ansi(true),
            )
            .init();
    }
}
