//! Transaction confirmation monitoring
//!
//! Polls the ledger for every confirming payout and drives it to a
//! terminal verdict: confirmed past the required depth, failed on an
//! on-chain revert, orphaned after a fruitless rebroadcast, or timed out
//! without a definitive result. The confirmation count is authoritative
//! for finality; elapsed time only bounds how long we keep waiting.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::ledger::{LedgerGateway, TxResult};
use crate::orchestrator::PayoutOrchestrator;
use crate::payout::{PayoutRecord, TerminalReason};

/// Confirmation monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Seconds between polling passes
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Confirmation depth required for finality
    #[serde(default = "default_required_confirmations")]
    pub required_confirmations: u32,

    /// How long a transaction may stay unseen before rebroadcast
    #[serde(default = "default_not_found_grace_secs")]
    pub not_found_grace_secs: u64,

    /// Overall deadline from payout creation to a terminal state
    #[serde(default = "default_confirmation_timeout_secs")]
    pub confirmation_timeout_secs: u64,
}

fn default_poll_interval_secs() -> u64 {
    10
}
fn default_required_confirmations() -> u32 {
    19
}
fn default_not_found_grace_secs() -> u64 {
    120
}
fn default_confirmation_timeout_secs() -> u64 {
    600
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            required_confirmations: default_required_confirmations(),
            not_found_grace_secs: default_not_found_grace_secs(),
            confirmation_timeout_secs: default_confirmation_timeout_secs(),
        }
    }
}

/// Per-payout polling state
#[derive(Debug, Clone, Copy)]
struct WatchState {
    /// First poll that could not find the transaction
    not_found_since: Option<DateTime<Utc>>,
    /// Whether the single rebroadcast has been spent
    rebroadcast: bool,
}

impl WatchState {
    fn new() -> Self {
        Self {
            not_found_since: None,
            rebroadcast: false,
        }
    }
}

/// Polls confirming payouts through to finality
#[derive(Clone)]
pub struct ConfirmationMonitor {
    orchestrator: PayoutOrchestrator,
    gateway: Arc<dyn LedgerGateway>,
    config: MonitorConfig,
    watches: Arc<DashMap<String, WatchState>>,
    shutdown: broadcast::Sender<()>,
}

impl ConfirmationMonitor {
    pub fn new(
        orchestrator: PayoutOrchestrator,
        gateway: Arc<dyn LedgerGateway>,
        config: MonitorConfig,
    ) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            orchestrator,
            gateway,
            config,
            watches: Arc::new(DashMap::new()),
            shutdown,
        }
    }

    /// Start the background polling loop
    pub fn start(&self) {
        let monitor = self.clone();
        let mut shutdown_rx = self.shutdown.subscribe();
        let poll_interval = std::time::Duration::from_secs(self.config.poll_interval_secs);

        info!(
            "Starting confirmation monitor, polling every {}s for {} confirmations",
            self.config.poll_interval_secs, self.config.required_confirmations
        );

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(poll_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = monitor.poll_once(Utc::now()).await {
                            warn!("Confirmation poll pass failed: {}", e);
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Confirmation monitor shutting down");
                        break;
                    }
                }
            }
        });
    }

    pub fn stop(&self) {
        let _ = self.shutdown.send(());
    }

    /// One polling pass. Payouts are polled concurrently; each payout is
    /// still advanced by exactly one task.
    pub async fn poll_once(&self, now: DateTime<Utc>) -> Result<()> {
        let confirming = self.orchestrator.confirming_payouts().await?;

        let polls = confirming.into_iter().map(|record| {
            let monitor = self.clone();
            async move { monitor.poll_payout(record, now).await }
        });
        futures::future::join_all(polls).await;

        Ok(())
    }

    async fn poll_payout(&self, record: PayoutRecord, now: DateTime<Utc>) {
        let payout_id = record.payout_id.clone();

        // Overall deadline runs from payout creation; past it the payout
        // is closed out even though the transaction might still settle
        let age = (now - record.created_at).num_seconds();
        if age > self.config.confirmation_timeout_secs as i64 {
            self.finish(
                &payout_id,
                TerminalReason::TimeoutUnconfirmed,
                format!("no definitive result after {}s", age),
            )
            .await;
            return;
        }

        let Some(txid) = record.txid.clone() else {
            warn!(payout_id = %payout_id, "Confirming payout has no txid, skipping");
            return;
        };

        let watch = self
            .watches
            .get(&payout_id)
            .map(|w| *w.value())
            .unwrap_or_else(WatchState::new);

        let status = match self.gateway.get_status(&txid).await {
            Ok(status) => status,
            Err(e) => {
                // Poll failures are not payout failures; try again on
                // the next pass
                debug!(payout_id = %payout_id, "Status poll failed: {}", e);
                return;
            }
        };

        match status.result {
            TxResult::Success => {
                self.watches.insert(payout_id.clone(), WatchState::new());
                let _ = self
                    .orchestrator
                    .record_confirmations(&payout_id, status.confirmations)
                    .await;
                if status.confirmations >= self.config.required_confirmations {
                    if let Err(e) = self
                        .orchestrator
                        .complete_confirmed(&payout_id, status.confirmations)
                        .await
                    {
                        warn!(payout_id = %payout_id, "Confirm transition failed: {}", e);
                    }
                    self.watches.remove(&payout_id);
                }
            }
            TxResult::Reverted => {
                self.finish(
                    &payout_id,
                    TerminalReason::OnChainRevert,
                    format!("transaction {} reverted on-chain", txid),
                )
                .await;
            }
            TxResult::Pending => {
                // Mempool-visible but not mined; clear any not-found streak
                self.watches.insert(payout_id.clone(), WatchState::new());
            }
            TxResult::NotFound => {
                self.handle_not_found(&payout_id, watch, now).await;
            }
        }
    }

    /// Unseen transaction: wait out the grace period, rebroadcast once,
    /// then give up as orphaned
    async fn handle_not_found(&self, payout_id: &str, mut watch: WatchState, now: DateTime<Utc>) {
        let since = match watch.not_found_since {
            Some(since) => since,
            None => {
                watch.not_found_since = Some(now);
                self.watches.insert(payout_id.to_string(), watch);
                return;
            }
        };

        let unseen_for = (now - since).num_seconds();
        if unseen_for <= self.config.not_found_grace_secs as i64 {
            return;
        }

        if !watch.rebroadcast {
            watch.rebroadcast = true;
            // Restart the grace clock for the replacement transaction
            watch.not_found_since = Some(now);
            self.watches.insert(payout_id.to_string(), watch);

            match self.orchestrator.rebroadcast(payout_id).await {
                Ok(txid) => {
                    info!(payout_id = %payout_id, txid = %txid, "Rebroadcast submitted");
                }
                Err(e) => {
                    warn!(payout_id = %payout_id, "Rebroadcast failed: {}", e);
                    self.finish(
                        payout_id,
                        TerminalReason::Orphaned,
                        format!("rebroadcast failed: {}", e),
                    )
                    .await;
                }
            }
        } else {
            self.finish(
                payout_id,
                TerminalReason::Orphaned,
                format!("transaction unseen for {}s after rebroadcast", unseen_for),
            )
            .await;
        }
    }

    async fn finish(&self, payout_id: &str, reason: TerminalReason, detail: String) {
        if let Err(e) = self
            .orchestrator
            .complete_failed(payout_id, reason, detail)
            .await
        {
            warn!(payout_id = %payout_id, "Failure transition failed: {}", e);
        }
        self.watches.remove(payout_id);
    }
}
