//! Payout Engine - custodial USDT-TRC20/TRX disbursement daemon
//!
//! # WARNING
//! - This engine moves real funds out of a custodial wallet.
//! - Confirmed transactions are irreversible; check limits twice.
//! - Testnet behavior does NOT equal mainnet behavior.

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::error;

// Use the library crate
use payout_engine::cli::commands;
use payout_engine::config::Config;

/// Payout Engine - USDT-TRC20/TRX payout orchestration
#[derive(Parser)]
#[command(name = "payoutd")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the payout engine
    Start {
        /// Run against the simulated ledger (no real transfers)
        #[arg(long)]
        dry_run: bool,
    },

    /// Show stats from the persisted payout registry
    Status,

    /// Show current configuration
    Config,

    /// Check gateway reachability and limit guard state
    Health,

    /// Validate a TRON address
    Check {
        /// Address to validate
        address: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("payout_engine=info".parse().unwrap()),
        )
        .with_target(true)
        .init();

    // Parse CLI arguments
    let cli = Cli::parse();

    // Load configuration
    let config = match Config::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    // Execute command
    let result = match cli.command {
        Commands::Start { dry_run } => commands::start(&config, dry_run).await,
        Commands::Status => commands::status(&config).await,
        Commands::Config => commands::show_config(&config),
        Commands::Health => commands::health(&config).await,
        Commands::Check { address } => commands::check_address(&address),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        std::process::exit(1);
    }

    Ok(())
}
