//! Payout orchestration
//!
//! Owns every payout record's walk through the state machine: intake and
//! validation, the limit-guard gate, retried ledger submission, and the
//! terminal bookkeeping that feeds the limit guard and the outward event
//! channel. The confirmation monitor drives the Confirming tail of the
//! machine through the completion methods here; nothing else mutates
//! records.

use backoff::{future::retry, ExponentialBackoff};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info, warn};

use crate::address;
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::ledger::LedgerGateway;
use crate::limits::LimitGuard;
use crate::payout::{
    format_units, PayoutRecord, PayoutRequest, PayoutState, TerminalEvent, TerminalReason,
};
use crate::router;
use crate::store::{ListFilter, PayoutStore, StateUpdate};

/// Retry policy for transient ledger failures, shared by every
/// submission path
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total submission attempts before giving up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// First backoff delay; doubles each retry with jitter
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Backoff delay cap
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    1_000
}
fn default_max_delay_ms() -> u64 {
    30_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// Aggregate engine statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct PayoutStats {
    pub total: usize,
    pub pending: usize,
    pub in_flight: usize,
    pub confirmed: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Confirmed volume in base units, per asset symbol
    pub confirmed_volume: std::collections::HashMap<String, u64>,
}

/// Payout orchestrator, one instance per engine. Clones share state and
/// are handed to background tasks.
#[derive(Clone)]
pub struct PayoutOrchestrator {
    store: Arc<dyn PayoutStore>,
    gateway: Arc<dyn LedgerGateway>,
    limits: Arc<LimitGuard>,
    retry: RetryConfig,
    min_payout: u64,
    max_payout: u64,
    /// Bounds payouts in flight (submitted/confirming); permits are held
    /// from dispatch until the terminal transition
    inflight_slots: Arc<Semaphore>,
    inflight: Arc<DashMap<String, tokio::sync::OwnedSemaphorePermit>>,
    terminal_tx: mpsc::UnboundedSender<TerminalEvent>,
}

impl PayoutOrchestrator {
    pub fn new(
        store: Arc<dyn PayoutStore>,
        gateway: Arc<dyn LedgerGateway>,
        limits: Arc<LimitGuard>,
        engine: &EngineConfig,
        retry: RetryConfig,
        terminal_tx: mpsc::UnboundedSender<TerminalEvent>,
    ) -> Self {
        Self {
            store,
            gateway,
            limits,
            retry,
            min_payout: engine.min_payout,
            max_payout: engine.max_payout,
            inflight_slots: Arc::new(Semaphore::new(engine.max_concurrent_payouts)),
            inflight: Arc::new(DashMap::new()),
            terminal_tx,
        }
    }

    /// Create an immediate payout: validation and the limit gate are
    /// surfaced synchronously, submission proceeds in the background.
    ///
    /// A request re-using a known reference id returns the existing
    /// payout id without creating anything.
    pub async fn create_payout(&self, request: PayoutRequest) -> Result<String> {
        let record = match self.intake(request).await? {
            IntakeOutcome::Existing(payout_id) => return Ok(payout_id),
            IntakeOutcome::Accepted(record) => record,
            IntakeOutcome::Rejected { error, .. } => return Err(error),
        };
        let payout_id = record.payout_id.clone();

        // Fast-fail on limits before handing off to the worker
        if let Err(e) = self.limits.check(record.request.amount) {
            self.fail_payout(&payout_id, PayoutState::Pending, TerminalReason::LimitExceeded, &e)
                .await;
            return Err(e);
        }

        let this = self.clone();
        let id = payout_id.clone();
        tokio::spawn(async move {
            if let Err(e) = this.dispatch(&id).await {
                warn!(payout_id = %id, "Payout dispatch failed: {}", e);
            }
        });

        Ok(payout_id)
    }

    /// Validate a request and persist it as a Pending record, without
    /// dispatching. The batch scheduler uses this for windowed payouts.
    pub async fn intake(&self, request: PayoutRequest) -> Result<IntakeOutcome> {
        if let Some(existing) = self.store.find_by_reference(&request.reference_id).await {
            debug!(
                reference_id = %request.reference_id,
                payout_id = %existing,
                "Duplicate reference id, returning existing payout"
            );
            return Ok(IntakeOutcome::Existing(existing));
        }

        let chosen = router::select(
            request.kyc_verified,
            request.kyc_hash.as_deref(),
            request.node_id.as_deref(),
        );

        let record = PayoutRecord::new(request, chosen);
        let payout_id = record.payout_id.clone();
        self.store.create(record).await?;

        self.store
            .update_state(&payout_id, PayoutState::Created, PayoutState::Validating, StateUpdate::none())
            .await?;

        if let Err(e) = self.validate_request(&payout_id).await {
            self.fail_payout(&payout_id, PayoutState::Validating, TerminalReason::InvalidRequest, &e)
                .await;
            return Ok(IntakeOutcome::Rejected {
                payout_id,
                error: e,
            });
        }

        let record = self
            .store
            .update_state(&payout_id, PayoutState::Validating, PayoutState::Pending, StateUpdate::none())
            .await?;

        info!(
            payout_id = %payout_id,
            router = %record.router,
            "Accepted payout of {} to {}",
            format_units(record.request.amount, record.request.asset),
            record.request.recipient
        );

        Ok(IntakeOutcome::Accepted(record))
    }

    async fn validate_request(&self, payout_id: &str) -> Result<()> {
        let record = self.store.get(payout_id).await?;
        let request = &record.request;

        address::validate(&request.recipient)?;

        if request.amount == 0 {
            return Err(Error::InvalidAmount("amount must be positive".to_string()));
        }
        if request.amount < self.min_payout {
            return Err(Error::InvalidAmount(format!(
                "{} below minimum {}",
                request.amount, self.min_payout
            )));
        }
        if request.amount > self.max_payout {
            return Err(Error::InvalidAmount(format!(
                "{} above maximum {}",
                request.amount, self.max_payout
            )));
        }
        if request.reference_id.trim().is_empty() {
            return Err(Error::InvalidRequest("reference_id must be set".to_string()));
        }

        Ok(())
    }

    /// Drive one Pending payout through submission. Safe to call again
    /// for a payout that already moved on; replays are no-ops.
    pub async fn dispatch(&self, payout_id: &str) -> Result<()> {
        let record = self.store.get(payout_id).await?;

        if record.state != PayoutState::Pending {
            debug!(
                payout_id = %payout_id,
                state = %record.state,
                "Skipping dispatch, payout is not pending"
            );
            return Ok(());
        }

        let permit = self
            .inflight_slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Internal("in-flight semaphore closed".to_string()))?;

        // Gate, then claim the record before touching the network so a
        // concurrent cancellation can no longer race the submission
        if let Err(e) = self.limits.check(record.request.amount) {
            self.fail_payout(payout_id, PayoutState::Pending, TerminalReason::LimitExceeded, &e)
                .await;
            return Err(e);
        }

        match self
            .store
            .update_state(payout_id, PayoutState::Pending, PayoutState::Submitted, StateUpdate::none())
            .await
        {
            Ok(_) => {}
            Err(Error::StateConflict { found, .. }) => {
                debug!(payout_id = %payout_id, found = %found, "Lost the pending claim, skipping dispatch");
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        match self.submit_with_retry(&record).await {
            Ok(txid) => {
                info!(payout_id = %payout_id, txid = %txid, "Payout submitted");
                self.store
                    .update_state(
                        payout_id,
                        PayoutState::Submitted,
                        PayoutState::Confirming,
                        StateUpdate::with_txid(txid),
                    )
                    .await?;
                // Slot stays occupied until the monitor reaches a verdict
                self.inflight.insert(payout_id.to_string(), permit);
                Ok(())
            }
            Err(e) => {
                error!(payout_id = %payout_id, "Submission failed: {}", e);
                self.limits.record_failure();
                self.fail_payout(payout_id, PayoutState::Submitted, TerminalReason::SubmissionFailed, &e)
                    .await;
                Err(e)
            }
        }
    }

    /// Submit to the ledger with exponential backoff on transient errors
    async fn submit_with_retry(&self, record: &PayoutRecord) -> Result<String> {
        let policy = ExponentialBackoff {
            initial_interval: Duration::from_millis(self.retry.base_delay_ms),
            max_interval: Duration::from_millis(self.retry.max_delay_ms),
            multiplier: 2.0,
            max_elapsed_time: None,
            ..Default::default()
        };

        let attempts = AtomicU32::new(0);
        let max_attempts = self.retry.max_attempts;
        let request = &record.request;

        retry(policy, || async {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            match self
                .gateway
                .submit(&request.recipient, request.amount, request.asset)
                .await
            {
                Ok(txid) => Ok(txid),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    warn!(
                        payout_id = %record.payout_id,
                        attempt,
                        "Transient submission error, retrying: {}",
                        e
                    );
                    Err(backoff::Error::transient(e))
                }
                Err(e) => Err(backoff::Error::permanent(e)),
            }
        })
        .await
    }

    /// Cancel a payout that has not been submitted yet
    pub async fn cancel_payout(&self, payout_id: &str) -> Result<()> {
        // The record can move under us; retry the conditional update
        // against whatever state we last observed
        loop {
            let record = self.store.get(payout_id).await?;

            match record.state {
                PayoutState::Created | PayoutState::Validating | PayoutState::Pending => {
                    match self
                        .store
                        .update_state(
                            payout_id,
                            record.state,
                            PayoutState::Cancelled,
                            StateUpdate::terminal(TerminalReason::Cancelled, None),
                        )
                        .await
                    {
                        Ok(updated) => {
                            info!(payout_id = %payout_id, "Payout cancelled");
                            self.emit_terminal(&updated);
                            return Ok(());
                        }
                        Err(Error::StateConflict { .. }) => continue,
                        Err(e) => return Err(e),
                    }
                }
                // The ledger action exists outside our control
                PayoutState::Submitted | PayoutState::Confirming => {
                    return Err(Error::CancellationRejected {
                        payout_id: payout_id.to_string(),
                    });
                }
                PayoutState::Confirmed | PayoutState::Failed | PayoutState::Cancelled => {
                    return Err(Error::InvalidTransition {
                        from: record.state.to_string(),
                        to: PayoutState::Cancelled.to_string(),
                    });
                }
            }
        }
    }

    pub async fn get_payout(&self, payout_id: &str) -> Result<PayoutRecord> {
        self.store.get(payout_id).await
    }

    /// Confirmation monitor verdict: confirmed past the threshold
    pub async fn complete_confirmed(&self, payout_id: &str, confirmations: u32) -> Result<()> {
        let updated = self
            .store
            .update_state(
                payout_id,
                PayoutState::Confirming,
                PayoutState::Confirmed,
                StateUpdate {
                    confirmations: Some(confirmations),
                    reason: Some(TerminalReason::Completed),
                    ..StateUpdate::default()
                },
            )
            .await?;

        self.limits.record_success(updated.request.amount);
        info!(
            payout_id = %payout_id,
            confirmations,
            "Payout confirmed: {}",
            format_units(updated.request.amount, updated.request.asset)
        );
        self.release_slot(payout_id);
        self.emit_terminal(&updated);
        Ok(())
    }

    /// Confirmation monitor verdict: definitively or ambiguously failed
    pub async fn complete_failed(
        &self,
        payout_id: &str,
        reason: TerminalReason,
        detail: String,
    ) -> Result<()> {
        let updated = self
            .store
            .update_state(
                payout_id,
                PayoutState::Confirming,
                PayoutState::Failed,
                StateUpdate::terminal(reason, Some(detail)),
            )
            .await?;

        // Ambiguous timeouts never count against the breaker
        if reason.counts_as_breaker_failure() {
            self.limits.record_failure();
        }
        warn!(payout_id = %payout_id, reason = %reason, "Payout failed");
        self.release_slot(payout_id);
        self.emit_terminal(&updated);
        Ok(())
    }

    /// One-shot rebroadcast for a transaction the ledger has never seen.
    /// Returns the replacement txid.
    pub async fn rebroadcast(&self, payout_id: &str) -> Result<String> {
        let record = self.store.get(payout_id).await?;
        if record.state != PayoutState::Confirming {
            return Err(Error::StateConflict {
                payout_id: payout_id.to_string(),
                expected: PayoutState::Confirming.to_string(),
                found: record.state.to_string(),
            });
        }

        let request = &record.request;
        let txid = self
            .gateway
            .submit(&request.recipient, request.amount, request.asset)
            .await?;

        warn!(
            payout_id = %payout_id,
            old_txid = ?record.txid,
            new_txid = %txid,
            "Rebroadcast orphaned transaction"
        );
        self.store.record_txid(payout_id, txid.clone()).await?;
        Ok(txid)
    }

    /// Record confirmation progress while a payout is confirming
    pub async fn record_confirmations(&self, payout_id: &str, confirmations: u32) -> Result<()> {
        self.store.record_confirmations(payout_id, confirmations).await
    }

    /// Every payout currently awaiting confirmation
    pub async fn confirming_payouts(&self) -> Result<Vec<PayoutRecord>> {
        self.store
            .list(ListFilter {
                state: Some(PayoutState::Confirming),
                ..ListFilter::default()
            })
            .await
    }

    /// Aggregate statistics over every known record
    pub async fn stats(&self) -> Result<PayoutStats> {
        let records = self.store.list(ListFilter::default()).await?;
        let mut stats = PayoutStats {
            total: records.len(),
            ..PayoutStats::default()
        };

        for record in records {
            match record.state {
                PayoutState::Created | PayoutState::Validating | PayoutState::Pending => {
                    stats.pending += 1;
                }
                PayoutState::Submitted | PayoutState::Confirming => stats.in_flight += 1,
                PayoutState::Confirmed => {
                    stats.confirmed += 1;
                    *stats
                        .confirmed_volume
                        .entry(record.request.asset.symbol().to_string())
                        .or_insert(0) += record.request.amount;
                }
                PayoutState::Failed => stats.failed += 1,
                PayoutState::Cancelled => stats.cancelled += 1,
            }
        }

        Ok(stats)
    }

    /// Move a working payout to Failed with a reason, emitting the event.
    /// Conflicts are swallowed: some other transition already won.
    async fn fail_payout(
        &self,
        payout_id: &str,
        expected: PayoutState,
        reason: TerminalReason,
        cause: &Error,
    ) {
        match self
            .store
            .update_state(
                payout_id,
                expected,
                PayoutState::Failed,
                StateUpdate::terminal(reason, Some(cause.to_string())),
            )
            .await
        {
            Ok(updated) => self.emit_terminal(&updated),
            Err(e) => {
                debug!(payout_id = %payout_id, "Failure transition not applied: {}", e);
            }
        }
        self.release_slot(payout_id);
    }

    fn release_slot(&self, payout_id: &str) {
        // Dropping the permit frees the in-flight slot
        self.inflight.remove(payout_id);
    }

    fn emit_terminal(&self, record: &PayoutRecord) {
        let event = TerminalEvent {
            payout_id: record.payout_id.clone(),
            state: record.state,
            reason: record.reason.unwrap_or(TerminalReason::Completed),
            txid: record.txid.clone(),
            at: record.updated_at,
        };
        if self.terminal_tx.send(event).is_err() {
            debug!("Terminal event channel closed");
        }
    }
}

/// What intake produced for a request
pub enum IntakeOutcome {
    /// A new record, validated and pending
    Accepted(PayoutRecord),
    /// The reference id was already known; the original payout id
    Existing(String),
    /// Validation failed; the record exists, terminally failed
    Rejected { payout_id: String, error: Error },
}
