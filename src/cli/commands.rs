//! CLI command implementations

use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::batch::BatchScheduler;
use crate::config::Config;
use crate::ledger::{LedgerGateway, SimulatedGateway};
use crate::limits::LimitGuard;
use crate::monitor::ConfirmationMonitor;
use crate::orchestrator::PayoutOrchestrator;
use crate::payout::{format_units, Asset, TerminalEvent};
use crate::store::MemoryStore;

/// Start the payout engine
pub async fn start(config: &Config, dry_run: bool) -> Result<()> {
    if dry_run {
        warn!("Running in DRY-RUN mode - payouts go to the simulated ledger");
    } else {
        // The production TRON gateway plugs in behind LedgerGateway;
        // this build ships the simulated one only
        warn!("No live ledger gateway configured, falling back to the simulated ledger");
    }

    info!("Starting payout engine...");
    info!(
        "Limits: {} daily / {} hourly, breaker threshold {}",
        format_units(config.limits.daily_limit, Asset::Usdt),
        format_units(config.limits.hourly_limit, Asset::Usdt),
        config.limits.failure_threshold
    );

    let store = Arc::new(MemoryStore::new(
        config.engine.persistence_path.as_ref().map(PathBuf::from),
    ));
    store.load().await?;

    let gateway: Arc<dyn LedgerGateway> = Arc::new(SimulatedGateway::default());
    let limits = Arc::new(LimitGuard::new(config.limits.clone()));
    let (terminal_tx, mut terminal_rx) = mpsc::unbounded_channel::<TerminalEvent>();

    let orchestrator = PayoutOrchestrator::new(
        store,
        gateway.clone(),
        limits,
        &config.engine,
        config.retry.clone(),
        terminal_tx,
    );

    let scheduler = BatchScheduler::new(orchestrator.clone(), config.batch.clone());
    scheduler.start();

    let monitor = ConfirmationMonitor::new(orchestrator.clone(), gateway, config.monitor.clone());
    monitor.start();

    // Terminal events feed the notification layer; here they just land
    // in the log
    tokio::spawn(async move {
        while let Some(event) = terminal_rx.recv().await {
            info!(
                payout_id = %event.payout_id,
                state = %event.state,
                reason = %event.reason,
                txid = ?event.txid,
                "Payout reached terminal state"
            );
        }
    });

    info!("Payout engine running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    info!("Shutting down...");
    scheduler.stop();
    monitor.stop();

    let stats = orchestrator.stats().await?;
    info!(
        "Final stats: {} total, {} confirmed, {} failed, {} in flight",
        stats.total, stats.confirmed, stats.failed, stats.in_flight
    );

    Ok(())
}

/// Show current configuration
pub fn show_config(config: &Config) -> Result<()> {
    println!("{:#?}", config);
    Ok(())
}

/// Show stats from the persisted payout registry
pub async fn status(config: &Config) -> Result<()> {
    let Some(path) = &config.engine.persistence_path else {
        println!("No persistence path configured, nothing to report");
        return Ok(());
    };

    let store = Arc::new(MemoryStore::new(Some(PathBuf::from(path))));
    store.load().await?;

    let gateway: Arc<dyn LedgerGateway> = Arc::new(SimulatedGateway::default());
    let limits = Arc::new(LimitGuard::new(config.limits.clone()));
    let (terminal_tx, _terminal_rx) = mpsc::unbounded_channel();
    let orchestrator = PayoutOrchestrator::new(
        store,
        gateway,
        limits,
        &config.engine,
        config.retry.clone(),
        terminal_tx,
    );

    let stats = orchestrator.stats().await?;
    println!("Payouts:    {}", stats.total);
    println!("  pending:   {}", stats.pending);
    println!("  in flight: {}", stats.in_flight);
    println!("  confirmed: {}", stats.confirmed);
    println!("  failed:    {}", stats.failed);
    println!("  cancelled: {}", stats.cancelled);
    for (asset, volume) in &stats.confirmed_volume {
        println!("Volume {}: {}", asset, volume);
    }

    Ok(())
}

/// Check engine health: gateway reachability and limit guard state
pub async fn health(config: &Config) -> Result<()> {
    let gateway = SimulatedGateway::default();

    if config.engine.custodial_address.is_empty() {
        println!("Custodial address: not configured");
    } else {
        let usdt = gateway
            .get_balance(&config.engine.custodial_address, Asset::Usdt)
            .await?;
        let trx = gateway
            .get_balance(&config.engine.custodial_address, Asset::Trx)
            .await?;
        println!("Custodial address: {}", config.engine.custodial_address);
        println!("  balance: {}", format_units(usdt, Asset::Usdt));
        println!("  balance: {}", format_units(trx, Asset::Trx));
    }

    let limits = LimitGuard::new(config.limits.clone());
    let snap = limits.snapshot();
    println!("Breaker: {}", snap.breaker);
    println!(
        "Daily:  {} / {}",
        format_units(snap.daily_used, Asset::Usdt),
        format_units(snap.daily_limit, Asset::Usdt)
    );
    println!(
        "Hourly: {} / {}",
        format_units(snap.hourly_used, Asset::Usdt),
        format_units(snap.hourly_limit, Asset::Usdt)
    );

    Ok(())
}

/// Validate a recipient address without creating anything
pub fn check_address(address: &str) -> Result<()> {
    match crate::address::validate(address) {
        Ok(_) => {
            println!("{} is a valid TRON address", address);
            Ok(())
        }
        Err(e) => {
            println!("{} is invalid: {}", address, e);
            std::process::exit(1);
        }
    }
}
