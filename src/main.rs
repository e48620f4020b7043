mod config;
mod console;
mod device;
mod error;
mod forwarder;
mod gateway;
mod lorawan;
mod mac;
mod payload;
mod persistence;
mod provisioning;
mod region;
mod simulator;

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use simulator::Simulator;

#[derive(Parser)]
#[command(name = "lwn-simulator")]
#[command(about = "LoRaWAN fleet simulator: drives end-devices through OTAA join and uplink cycles")]
#[command(version)]
struct Cli {
    /// Path to the c2.json configuration file
    #[arg(short, long, default_value = "c2.json")]
    config: PathBuf,

    /// Override the configured log level (defaults to c2.json's `logging.level`)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Address the operator console listens on
    #[arg(long, default_value = "127.0.0.1:8089")]
    console_addr: SocketAddr,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match config::Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("fatal: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            let level = cli.log_level.as_deref().unwrap_or(&config.logging.level);
            EnvFilter::new(level)
        }))
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "lwn-simulator starting");

    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
    let shutdown_signal = shutdown_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received, signaling shutdown");
            let _ = shutdown_signal.send(());
        }
    });

    let simulator = Simulator::new(config);
    simulator.run(cli.console_addr, shutdown_rx).await;

    info!("lwn-simulator exited normally");
}
