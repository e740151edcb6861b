//! hushdns CLI
//!
//! Loads the JSON configuration, starts the forwarder, and runs until
//! interrupted. Configuration and bind failures exit non-zero.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use hush_dns::{Config, Server};

/// hushdns - caching, ad-blocking DNS forwarder
#[derive(Parser)]
#[command(name = "hushdns")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "hushdns.json")]
    config: PathBuf,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the forwarder
    Run,

    /// Write a sample configuration file
    GenConfig {
        /// Output path for the configuration file
        #[arg(short, long, default_value = "hushdns.json")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level);

    match cli.command {
        Commands::Run => run(cli.config).await,
        Commands::GenConfig { output } => generate_config(output),
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn run(config_path: PathBuf) -> Result<()> {
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load configuration from {:?}", config_path))?;

    info!("configuration loaded from {:?}", config_path);

    let server = Server::new(config).context("failed to build the forwarder")?;
    let shutdown_tx = server.shutdown_handle();

    let mut server_handle = tokio::spawn(server.run());

    // A bind or serve failure ends the process; otherwise run until ctrl-c.
    tokio::select! {
        joined = &mut server_handle => {
            joined
                .context("forwarder task panicked")?
                .context("forwarder failed")?;
            return Ok(());
        }
        _ = wait_for_shutdown() => {}
    }
    info!("shutting down...");

    let _ = shutdown_tx.send(());
    match tokio::time::timeout(std::time::Duration::from_secs(5), server_handle).await {
        Ok(joined) => {
            joined
                .context("forwarder task panicked")?
                .context("forwarder exited with an error")?;
        }
        Err(_) => error!("forwarder did not stop within 5s, exiting anyway"),
    }

    Ok(())
}

async fn wait_for_shutdown() {
    if let Err(e) = signal::ctrl_c().await {
        error!("failed to listen for ctrl-c: {}", e);
    }
}

fn generate_config(output: PathBuf) -> Result<()> {
    std::fs::write(&output, Config::sample())
        .with_context(|| format!("failed to write {:?}", output))?;
    println!("Sample configuration written to {:?}", output);
    println!("Edit it and start the forwarder with: hushdns -c {:?} run", output);
    Ok(())
}
