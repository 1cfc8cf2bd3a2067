//! SHV Broker - standalone TCP broker for SHV devices and clients.
//!
//! Loads an optional JSON broker configuration, applies command-line
//! overrides and serves until Ctrl-C.

use anyhow::{Context, Result};
use clap::Parser;
use shv_iot::{AccessLevel, Broker, BrokerConfig, RpcConfig};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "shv-broker")]
#[command(about = "SHV RPC broker with device mounts and tunneling")]
struct Args {
    /// JSON broker configuration
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on, overrides the configuration (0 = auto-assign)
    #[arg(short, long)]
    port: Option<u16>,

    /// Host to bind to, overrides the configuration
    #[arg(long)]
    host: Option<String>,

    /// Password of the built-in `admin` user when no users are configured
    #[arg(long, default_value = "admin!")]
    admin_password: String,

    /// Print the effective configuration as JSON, passwords redacted, and exit
    #[arg(long)]
    print_config: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

fn load_config(args: &Args) -> Result<BrokerConfig> {
    let mut config = match &args.config {
        Some(path) => BrokerConfig::from_json_file(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => BrokerConfig::new(RpcConfig::DEFAULT_HOST, RpcConfig::DEFAULT_PORT),
    };
    if let Some(host) = &args.host {
        config.host = host.clone();
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if config.users.is_empty() {
        warn!("No users configured, adding 'admin' with full access");
        config = config.with_user("admin", args.admin_password.as_str(), AccessLevel::Admin);
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging; RUST_LOG wins over --debug
    let default_level = if args.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    let config = load_config(&args)?;
    if args.print_config {
        println!("{}", serde_json::to_string_pretty(&config.redacted())?);
        return Ok(());
    }

    info!(
        "Starting SHV broker '{}' with {} user(s)",
        config.app_name,
        config.users.len()
    );

    let mut broker = Broker::start(config).await?;

    // Print port for supervisors that start the broker on port 0
    println!("SHV_BROKER_PORT={}", broker.port);

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting");
    broker.shutdown();

    Ok(())
}
