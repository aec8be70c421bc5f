//! Windowed batch scheduling
//!
//! Non-immediate payouts accumulate in one open bucket per batch type
//! and are dispatched together when the wall-clock window closes (top of
//! hour, UTC midnight, Monday 00:00 UTC). Sealing swaps the bucket
//! atomically, so an arriving payout lands either in the sealed batch or
//! in the next window, never in limbo. Dispatch is deliberately not
//! atomic across the batch: each payout stands or falls on its own.

use chrono::{DateTime, Datelike, Duration, NaiveTime, Timelike, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::orchestrator::{IntakeOutcome, PayoutOrchestrator};
use crate::payout::{new_batch_id, BatchType, PayoutRequest, PayoutState, Priority};

/// Batch scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Cap on payouts per batch window; overflow defers to the next window
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// How often the background loop looks for due windows
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
}

fn default_max_batch_size() -> usize {
    100
}
fn default_tick_interval_secs() -> u64 {
    5
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            tick_interval_secs: default_tick_interval_secs(),
        }
    }
}

/// Wall-clock window containing `now` for a batch type.
/// Immediate has no window.
pub fn window_bounds(
    batch_type: BatchType,
    now: DateTime<Utc>,
) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let midnight = now
        .date_naive()
        .and_time(NaiveTime::MIN)
        .and_utc();

    match batch_type {
        BatchType::Immediate => None,
        BatchType::Hourly => {
            let start = midnight + Duration::hours(now.hour() as i64);
            Some((start, start + Duration::hours(1)))
        }
        BatchType::Daily => Some((midnight, midnight + Duration::days(1))),
        BatchType::Weekly => {
            let days_from_monday = now.weekday().num_days_from_monday() as i64;
            let start = midnight - Duration::days(days_from_monday);
            Some((start, start + Duration::days(7)))
        }
    }
}

/// Aggregate outcome of one dispatched batch
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct BatchResult {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
}

/// A sealed, immutable batch
#[derive(Debug, Clone, Serialize)]
pub struct Batch {
    pub batch_id: String,
    pub batch_type: BatchType,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    /// Contained payouts in dispatch order
    pub payout_ids: Vec<String>,
    pub dispatched: bool,
    pub result: BatchResult,
}

#[derive(Debug, Clone)]
struct QueuedItem {
    payout_id: String,
    priority: Priority,
}

/// The open accumulation bucket for one batch type
#[derive(Debug)]
struct Bucket {
    batch_id: String,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
    items: Vec<QueuedItem>,
    /// Items past the cap, carried into the next window
    overflow: Vec<QueuedItem>,
}

impl Bucket {
    fn open(batch_type: BatchType, now: DateTime<Utc>, carried: Vec<QueuedItem>) -> Self {
        let (window_start, window_end) =
            window_bounds(batch_type, now).expect("immediate payouts are never bucketed");
        Self {
            batch_id: new_batch_id(),
            window_start,
            window_end,
            items: carried,
            overflow: Vec::new(),
        }
    }
}

/// Accumulates windowed payouts and dispatches them at window close
#[derive(Clone)]
pub struct BatchScheduler {
    orchestrator: PayoutOrchestrator,
    config: BatchConfig,
    /// Open buckets, one per non-immediate batch type
    buckets: Arc<Mutex<HashMap<BatchType, Bucket>>>,
    /// Sealed batch registry
    batches: Arc<DashMap<String, Batch>>,
    shutdown: broadcast::Sender<()>,
}

impl BatchScheduler {
    pub fn new(orchestrator: PayoutOrchestrator, config: BatchConfig) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            orchestrator,
            config,
            buckets: Arc::new(Mutex::new(HashMap::new())),
            batches: Arc::new(DashMap::new()),
            shutdown,
        }
    }

    /// Queue one windowed payout. The record is created and validated
    /// now; submission waits for the window. Returns the payout id and
    /// the batch id it was queued under.
    pub async fn enqueue(&self, request: PayoutRequest) -> Result<(String, Option<String>)> {
        self.enqueue_at(request, Utc::now()).await
    }

    pub async fn enqueue_at(
        &self,
        request: PayoutRequest,
        now: DateTime<Utc>,
    ) -> Result<(String, Option<String>)> {
        let batch_type = request.batch_type;
        if batch_type == BatchType::Immediate {
            return Err(Error::InvalidRequest(
                "immediate payouts bypass the batch scheduler".to_string(),
            ));
        }

        let priority = request.priority;
        let (payout_id, failed_validation) = match self.orchestrator.intake(request).await? {
            IntakeOutcome::Accepted(record) => (record.payout_id, false),
            IntakeOutcome::Existing(payout_id) => return Ok((payout_id, None)),
            // Terminally failed records still ride along so the batch
            // result accounts for them
            IntakeOutcome::Rejected { payout_id, .. } => (payout_id, true),
        };

        // Seal anything already due before appending, so a late arrival
        // can never join a window that has closed
        let due = self.seal_due(now);
        let batch_id = {
            let mut buckets = self.buckets.lock().expect("bucket map poisoned");
            let bucket = buckets
                .entry(batch_type)
                .or_insert_with(|| Bucket::open(batch_type, now, Vec::new()));

            let item = QueuedItem {
                payout_id: payout_id.clone(),
                priority,
            };
            if bucket.items.len() >= self.config.max_batch_size {
                debug!(
                    batch_id = %bucket.batch_id,
                    "Batch window full, deferring payout to next window"
                );
                bucket.overflow.push(item);
            } else {
                bucket.items.push(item);
            }
            bucket.batch_id.clone()
        };
        self.dispatch_sealed(due).await;

        if failed_validation {
            debug!(payout_id = %payout_id, "Queued payout already failed validation");
        }

        Ok((payout_id, Some(batch_id)))
    }

    /// Queue a whole batch of requests under one batch type, returning
    /// the contained payout ids and the open batch id. Immediate
    /// requests degrade to independent immediate payouts with no batch.
    pub async fn submit_batch(
        &self,
        batch_type: BatchType,
        requests: Vec<PayoutRequest>,
    ) -> Result<(Vec<String>, Option<String>)> {
        let mut payout_ids = Vec::with_capacity(requests.len());
        let mut batch_id = None;
        for mut request in requests {
            request.batch_type = batch_type;
            if batch_type == BatchType::Immediate {
                payout_ids.push(self.orchestrator.create_payout(request).await?);
            } else {
                let (payout_id, bid) = self.enqueue(request).await?;
                payout_ids.push(payout_id);
                batch_id = bid.or(batch_id);
            }
        }
        Ok((payout_ids, batch_id))
    }

    /// Seal and dispatch every bucket whose window has closed
    pub async fn dispatch_due(&self, now: DateTime<Utc>) {
        let due = self.seal_due(now);
        self.dispatch_sealed(due).await;
    }

    /// Atomically swap out every due bucket for a fresh one seeded with
    /// its overflow, registering the sealed batches
    fn seal_due(&self, now: DateTime<Utc>) -> Vec<Batch> {
        let mut sealed = Vec::new();
        let mut buckets = self.buckets.lock().expect("bucket map poisoned");

        for batch_type in [BatchType::Hourly, BatchType::Daily, BatchType::Weekly] {
            let Some(bucket) = buckets.get(&batch_type) else {
                continue;
            };
            if now < bucket.window_end {
                continue;
            }

            let old = buckets
                .remove(&batch_type)
                .expect("bucket vanished under lock");
            let carried = old.overflow.clone();

            // Dispatch order: priority first, insertion order within
            let mut items = old.items;
            items.sort_by_key(|i| std::cmp::Reverse(i.priority));

            let batch = Batch {
                batch_id: old.batch_id,
                batch_type,
                window_start: old.window_start,
                window_end: old.window_end,
                payout_ids: items.into_iter().map(|i| i.payout_id).collect(),
                dispatched: false,
                result: BatchResult::default(),
            };
            self.batches.insert(batch.batch_id.clone(), batch.clone());
            sealed.push(batch);

            if !carried.is_empty() {
                buckets.insert(batch_type, Bucket::open(batch_type, now, carried));
            }
        }

        sealed
    }

    async fn dispatch_sealed(&self, sealed: Vec<Batch>) {
        for batch in sealed {
            if let Err(e) = self.dispatch_batch(&batch.batch_id).await {
                warn!(batch_id = %batch.batch_id, "Batch dispatch failed: {}", e);
            }
        }
    }

    /// Dispatch one sealed batch. Each contained payout is pushed
    /// through submission independently; a failing item never affects
    /// its siblings. Dispatching the same batch twice is rejected.
    pub async fn dispatch_batch(&self, batch_id: &str) -> Result<BatchResult> {
        let payout_ids = {
            let mut entry = self
                .batches
                .get_mut(batch_id)
                .ok_or_else(|| Error::BatchNotFound(batch_id.to_string()))?;
            if entry.dispatched {
                return Err(Error::BatchAlreadyDispatched(batch_id.to_string()));
            }
            entry.dispatched = true;
            entry.payout_ids.clone()
        };

        info!(
            batch_id = %batch_id,
            payouts = payout_ids.len(),
            "Dispatching batch"
        );

        for payout_id in &payout_ids {
            if let Err(e) = self.orchestrator.dispatch(payout_id).await {
                warn!(payout_id = %payout_id, "Batch payout failed: {}", e);
            }
        }

        let mut result = BatchResult {
            total: payout_ids.len(),
            ..BatchResult::default()
        };
        for payout_id in &payout_ids {
            match self.orchestrator.get_payout(payout_id).await {
                Ok(record) => match record.state {
                    PayoutState::Submitted | PayoutState::Confirming | PayoutState::Confirmed => {
                        result.successful += 1;
                    }
                    PayoutState::Failed | PayoutState::Cancelled => result.failed += 1,
                    _ => {}
                },
                Err(_) => result.failed += 1,
            }
        }

        if let Some(mut entry) = self.batches.get_mut(batch_id) {
            entry.result = result;
        }

        info!(
            batch_id = %batch_id,
            total = result.total,
            successful = result.successful,
            failed = result.failed,
            "Batch dispatched"
        );

        Ok(result)
    }

    pub fn get_batch(&self, batch_id: &str) -> Result<Batch> {
        self.batches
            .get(batch_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| Error::BatchNotFound(batch_id.to_string()))
    }

    /// Start the background window loop
    pub fn start(&self) {
        let scheduler = self.clone();
        let mut shutdown_rx = self.shutdown.subscribe();
        let tick = std::time::Duration::from_secs(self.config.tick_interval_secs);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        scheduler.dispatch_due(Utc::now()).await;
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Batch scheduler shutting down");
                        break;
                    }
                }
            }
        });
    }

    pub fn stop(&self) {
        let _ = self.shutdown.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::ledger::{SimFailure, SimulatedGateway};
    use crate::limits::{LimitGuard, LimitGuardConfig};
    use crate::orchestrator::RetryConfig;
    use crate::payout::{Asset, UNITS_PER_TOKEN};
    use crate::store::MemoryStore;
    use chrono::TimeZone;
    use tokio::sync::mpsc;

    const RECIPIENT: &str = "TR7NHqjeKQxGTCi8q8ZY4pL8otSzgjLj6t";

    fn scheduler_with(max_batch_size: usize) -> (BatchScheduler, Arc<SimulatedGateway>) {
        let store = Arc::new(MemoryStore::new(None));
        let gateway = Arc::new(SimulatedGateway::default());
        let limits = Arc::new(LimitGuard::new(LimitGuardConfig::default()));
        let (terminal_tx, _terminal_rx) = mpsc::unbounded_channel();

        let orchestrator = PayoutOrchestrator::new(
            store,
            gateway.clone(),
            limits,
            &EngineConfig::default(),
            RetryConfig {
                max_attempts: 1,
                base_delay_ms: 1,
                max_delay_ms: 5,
            },
            terminal_tx,
        );

        let scheduler = BatchScheduler::new(
            orchestrator,
            BatchConfig {
                max_batch_size,
                tick_interval_secs: 3600,
            },
        );
        (scheduler, gateway)
    }

    fn request(reference: &str, batch_type: BatchType) -> PayoutRequest {
        PayoutRequest {
            recipient: RECIPIENT.to_string(),
            amount: 5 * UNITS_PER_TOKEN,
            asset: Asset::Usdt,
            reference_id: reference.to_string(),
            memo: String::new(),
            kyc_verified: false,
            kyc_hash: None,
            node_id: None,
            batch_type,
            priority: Priority::Normal,
        }
    }

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 4, h, m, 0).unwrap()
    }

    #[test]
    fn test_hourly_window_bounds() {
        let (start, end) = window_bounds(BatchType::Hourly, at(10, 42)).unwrap();
        assert_eq!(start, at(10, 0));
        assert_eq!(end, at(11, 0));
    }

    #[test]
    fn test_daily_window_bounds() {
        let (start, end) = window_bounds(BatchType::Daily, at(10, 42)).unwrap();
        assert_eq!(start, Utc.with_ymd_and_hms(2025, 6, 4, 0, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2025, 6, 5, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_weekly_window_starts_monday() {
        // 2025-06-04 is a Wednesday; the window opened Monday 2025-06-02
        let (start, end) = window_bounds(BatchType::Weekly, at(10, 42)).unwrap();
        assert_eq!(start, Utc.with_ymd_and_hms(2025, 6, 2, 0, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2025, 6, 9, 0, 0, 0).unwrap());

        // A Monday belongs to its own week
        let monday = Utc.with_ymd_and_hms(2025, 6, 2, 0, 0, 1).unwrap();
        let (start, _) = window_bounds(BatchType::Weekly, monday).unwrap();
        assert_eq!(start, Utc.with_ymd_and_hms(2025, 6, 2, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_immediate_has_no_window() {
        assert!(window_bounds(BatchType::Immediate, at(10, 0)).is_none());
    }

    #[tokio::test]
    async fn test_enqueue_rejects_immediate() {
        let (scheduler, _) = scheduler_with(100);
        let err = scheduler
            .enqueue(request("r1", BatchType::Immediate))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_window_accumulates_then_dispatches() {
        let (scheduler, gateway) = scheduler_with(100);
        let now = at(10, 10);

        let mut batch_id = None;
        for i in 0..3 {
            let (_, bid) = scheduler
                .enqueue_at(request(&format!("r{}", i), BatchType::Hourly), now)
                .await
                .unwrap();
            batch_id = bid;
        }
        let batch_id = batch_id.unwrap();

        // Nothing dispatches while the window is open
        scheduler.dispatch_due(at(10, 59)).await;
        assert_eq!(gateway.submit_calls(), 0);

        // Window closes at 11:00
        scheduler.dispatch_due(at(11, 0)).await;
        assert_eq!(gateway.submit_calls(), 3);

        let batch = scheduler.get_batch(&batch_id).unwrap();
        assert!(batch.dispatched);
        assert_eq!(batch.result.total, 3);
        assert_eq!(batch.result.successful, 3);
        assert_eq!(batch.result.failed, 0);
    }

    #[tokio::test]
    async fn test_failing_item_does_not_affect_siblings() {
        let (scheduler, gateway) = scheduler_with(100);
        let now = at(10, 10);

        scheduler
            .enqueue_at(request("ok-1", BatchType::Hourly), now)
            .await
            .unwrap();

        // This one fails validation at intake but stays in the batch count
        let mut bad = request("bad", BatchType::Hourly);
        bad.amount = 10; // below minimum
        let (_, bid) = scheduler.enqueue_at(bad, now).await.unwrap();
        let batch_id = bid.unwrap();

        scheduler
            .enqueue_at(request("ok-2", BatchType::Hourly), now)
            .await
            .unwrap();

        scheduler.dispatch_due(at(11, 0)).await;

        let batch = scheduler.get_batch(&batch_id).unwrap();
        assert_eq!(batch.result.total, 3);
        assert_eq!(batch.result.successful, 2);
        assert_eq!(batch.result.failed, 1);
        // Only the two valid payouts reached the ledger
        assert_eq!(gateway.submit_calls(), 2);
    }

    #[tokio::test]
    async fn test_redispatch_is_rejected_and_creates_no_duplicates() {
        let (scheduler, gateway) = scheduler_with(100);
        let now = at(10, 10);

        let (_, bid) = scheduler
            .enqueue_at(request("r1", BatchType::Hourly), now)
            .await
            .unwrap();
        let batch_id = bid.unwrap();

        scheduler.dispatch_due(at(11, 0)).await;
        assert_eq!(gateway.submit_calls(), 1);

        let err = scheduler.dispatch_batch(&batch_id).await.unwrap_err();
        assert!(matches!(err, Error::BatchAlreadyDispatched(_)));
        assert_eq!(gateway.submit_calls(), 1);

        // Even replaying the contained payouts is a no-op
        let batch = scheduler.get_batch(&batch_id).unwrap();
        for payout_id in &batch.payout_ids {
            scheduler.orchestrator.dispatch(payout_id).await.unwrap();
        }
        assert_eq!(gateway.submit_calls(), 1);
    }

    #[tokio::test]
    async fn test_overflow_defers_to_next_window() {
        let (scheduler, gateway) = scheduler_with(2);
        let now = at(10, 10);

        for i in 0..3 {
            scheduler
                .enqueue_at(request(&format!("r{}", i), BatchType::Hourly), now)
                .await
                .unwrap();
        }

        scheduler.dispatch_due(at(11, 0)).await;
        // Capped batch carries the third payout into the next window
        assert_eq!(gateway.submit_calls(), 2);

        scheduler.dispatch_due(at(12, 0)).await;
        assert_eq!(gateway.submit_calls(), 3);
    }

    #[tokio::test]
    async fn test_late_arrival_joins_next_window() {
        let (scheduler, gateway) = scheduler_with(100);

        let (_, first_bid) = scheduler
            .enqueue_at(request("early", BatchType::Hourly), at(10, 10))
            .await
            .unwrap();

        // Arrives after the 10:00 window closed; sealing happens first,
        // so this lands in the 11:00 window
        let (_, second_bid) = scheduler
            .enqueue_at(request("late", BatchType::Hourly), at(11, 5))
            .await
            .unwrap();

        assert_ne!(first_bid, second_bid);
        // The first window dispatched during the late enqueue
        assert_eq!(gateway.submit_calls(), 1);
    }

    #[tokio::test]
    async fn test_urgent_dispatches_before_normal() {
        let (scheduler, _gateway) = scheduler_with(100);
        let now = at(10, 10);

        scheduler
            .enqueue_at(request("normal-1", BatchType::Hourly), now)
            .await
            .unwrap();
        let mut urgent = request("urgent-1", BatchType::Hourly);
        urgent.priority = Priority::Urgent;
        let (urgent_id, bid) = scheduler.enqueue_at(urgent, now).await.unwrap();
        let batch_id = bid.unwrap();

        scheduler.dispatch_due(at(11, 0)).await;

        let batch = scheduler.get_batch(&batch_id).unwrap();
        assert_eq!(batch.payout_ids.first(), Some(&urgent_id));
    }

    #[tokio::test]
    async fn test_independent_batch_types_seal_independently() {
        let (scheduler, gateway) = scheduler_with(100);
        let now = at(10, 10);

        scheduler
            .enqueue_at(request("hourly", BatchType::Hourly), now)
            .await
            .unwrap();
        scheduler
            .enqueue_at(request("daily", BatchType::Daily), now)
            .await
            .unwrap();

        // Hour boundary seals only the hourly bucket
        scheduler.dispatch_due(at(11, 0)).await;
        assert_eq!(gateway.submit_calls(), 1);

        // Midnight seals the daily bucket
        scheduler
            .dispatch_due(Utc.with_ymd_and_hms(2025, 6, 5, 0, 0, 0).unwrap())
            .await;
        assert_eq!(gateway.submit_calls(), 2);
    }

    #[tokio::test]
    async fn test_submission_failure_counted_in_result() {
        let (scheduler, gateway) = scheduler_with(100);
        let now = at(10, 10);

        gateway.script_submit_failures(vec![SimFailure::permanent("node down")]);

        let (_, bid) = scheduler
            .enqueue_at(request("r1", BatchType::Hourly), now)
            .await
            .unwrap();
        scheduler
            .enqueue_at(request("r2", BatchType::Hourly), now)
            .await
            .unwrap();

        scheduler.dispatch_due(at(11, 0)).await;

        let batch = scheduler.get_batch(&bid.unwrap()).unwrap();
        assert_eq!(batch.result.total, 2);
        assert_eq!(batch.result.successful, 1);
        assert_eq!(batch.result.failed, 1);
    }
}
