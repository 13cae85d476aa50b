//! csi-rclone node agent entry point

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use csi_rclone::cluster::MemoryClusterStore;
use csi_rclone::config::Config;
use csi_rclone::driver::Driver;

/// Print usage information
fn print_usage() {
    eprintln!("Usage: csi-rclone <config.yaml>");
    eprintln!();
    eprintln!("csi-rclone - rclone-backed volume driver");
    eprintln!();
    eprintln!("Arguments:");
    eprintln!("  config.yaml    Path to configuration file");
    eprintln!();
    eprintln!("Example:");
    eprintln!("  csi-rclone /etc/csi-rclone/config.yaml");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse arguments
    let args: Vec<String> = std::env::args().collect();
    if args.len() != 2 {
        print_usage();
        std::process::exit(1);
    }

    let config_path = PathBuf::from(&args[1]);

    // Load configuration
    let config = match Config::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = config.validate() {
        eprintln!("Configuration error: {}", e);
        std::process::exit(1);
    }

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("csi-rclone {} starting", env!("CARGO_PKG_VERSION"));
    info!("Loaded configuration from {:?}", config_path);

    // Without a platform client, secrets and volume records live in process
    let cluster = Arc::new(MemoryClusterStore::new());

    let driver = match Driver::start(config, cluster).await {
        Ok(d) => d,
        Err(e) => {
            error!("Failed to start driver: {}", e);
            std::process::exit(1);
        }
    };

    // Set up signal handling for graceful shutdown
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();

    ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        r.store(false, Ordering::SeqCst);
    })?;

    info!("Driver ready, press Ctrl+C to stop");

    while running.load(Ordering::SeqCst) {
        if !driver.identity().probe() {
            error!("Mounting daemon is no longer running");
            break;
        }
        tokio::time::sleep(tokio::time::Duration::from_secs(1)).await;
    }

    driver.shutdown().await?;
    info!("Driver stopped, exiting");

    Ok(())
}
