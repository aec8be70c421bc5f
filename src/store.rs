//! Payout record persistence
//!
//! Records are updated only through conditional state transitions: an
//! update names the state it expects to find and fails on mismatch, so
//! two workers can never both win the same transition.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use chrono::Utc;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::payout::{BatchType, PayoutRecord, PayoutState, TerminalReason};

/// Field changes applied together with a state transition
#[derive(Debug, Default, Clone)]
pub struct StateUpdate {
    pub txid: Option<String>,
    pub confirmations: Option<u32>,
    pub reason: Option<TerminalReason>,
    pub error: Option<String>,
}

impl StateUpdate {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_txid(txid: String) -> Self {
        Self {
            txid: Some(txid),
            ..Self::default()
        }
    }

    pub fn terminal(reason: TerminalReason, error: Option<String>) -> Self {
        Self {
            reason: Some(reason),
            error,
            ..Self::default()
        }
    }
}

/// Record filters for listing
#[derive(Debug, Default, Clone)]
pub struct ListFilter {
    pub state: Option<PayoutState>,
    pub batch_type: Option<BatchType>,
    pub limit: Option<usize>,
}

/// Storage contract for payout records
#[async_trait]
pub trait PayoutStore: Send + Sync {
    /// Persist a new record; the payout id must be unused
    async fn create(&self, record: PayoutRecord) -> Result<()>;

    /// Conditionally transition a record. Fails with [`Error::StateConflict`]
    /// if the stored state no longer matches `expected`, and with
    /// [`Error::InvalidTransition`] if the transition itself is illegal.
    async fn update_state(
        &self,
        payout_id: &str,
        expected: PayoutState,
        new_state: PayoutState,
        update: StateUpdate,
    ) -> Result<PayoutRecord>;

    /// Update observed confirmation progress. Legal only while the
    /// record is Confirming; anything else is a conflict.
    async fn record_confirmations(&self, payout_id: &str, confirmations: u32) -> Result<()>;

    /// Replace the transaction id after a rebroadcast. Legal only while
    /// the record is Confirming.
    async fn record_txid(&self, payout_id: &str, txid: String) -> Result<()>;

    async fn get(&self, payout_id: &str) -> Result<PayoutRecord>;

    async fn list(&self, filter: ListFilter) -> Result<Vec<PayoutRecord>>;

    /// Look up an existing payout by caller reference id (idempotency key)
    async fn find_by_reference(&self, reference_id: &str) -> Option<String>;
}

/// In-memory store with an optional JSON snapshot on disk
///
/// The snapshot is a full registry dump rewritten after every mutation,
/// loaded back on startup so in-flight payouts survive a restart.
pub struct MemoryStore {
    records: DashMap<String, PayoutRecord>,
    by_reference: DashMap<String, String>,
    persistence_path: Option<PathBuf>,
}

impl MemoryStore {
    pub fn new(persistence_path: Option<PathBuf>) -> Self {
        Self {
            records: DashMap::new(),
            by_reference: DashMap::new(),
            persistence_path,
        }
    }

    /// Load the registry snapshot from disk, if one exists
    pub async fn load(&self) -> Result<()> {
        let Some(path) = &self.persistence_path else {
            return Ok(());
        };
        if !Path::new(path).exists() {
            return Ok(());
        }

        let data = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| Error::StorePersistence(e.to_string()))?;
        let records: HashMap<String, PayoutRecord> =
            serde_json::from_str(&data).map_err(|e| Error::StorePersistence(e.to_string()))?;

        for (payout_id, record) in records {
            self.by_reference
                .insert(record.request.reference_id.clone(), payout_id.clone());
            self.records.insert(payout_id, record);
        }

        info!(
            "Loaded {} payout records from {}",
            self.records.len(),
            path.display()
        );
        Ok(())
    }

    /// Rewrite the registry snapshot
    async fn persist(&self) -> Result<()> {
        let Some(path) = &self.persistence_path else {
            return Ok(());
        };

        let registry: HashMap<String, PayoutRecord> = self
            .records
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        let data = serde_json::to_string_pretty(&registry)
            .map_err(|e| Error::StorePersistence(e.to_string()))?;
        tokio::fs::write(path, data)
            .await
            .map_err(|e| Error::StorePersistence(e.to_string()))?;

        debug!("Saved {} payout records to {}", registry.len(), path.display());
        Ok(())
    }
}

#[async_trait]
impl PayoutStore for MemoryStore {
    async fn create(&self, record: PayoutRecord) -> Result<()> {
        let payout_id = record.payout_id.clone();
        let reference_id = record.request.reference_id.clone();

        if self.records.contains_key(&payout_id) {
            return Err(Error::Internal(format!(
                "payout id collision: {}",
                payout_id
            )));
        }

        self.by_reference.insert(reference_id, payout_id.clone());
        self.records.insert(payout_id, record);
        self.persist().await
    }

    async fn update_state(
        &self,
        payout_id: &str,
        expected: PayoutState,
        new_state: PayoutState,
        update: StateUpdate,
    ) -> Result<PayoutRecord> {
        let updated = {
            let mut entry = self
                .records
                .get_mut(payout_id)
                .ok_or_else(|| Error::PayoutNotFound(payout_id.to_string()))?;

            if entry.state != expected {
                return Err(Error::StateConflict {
                    payout_id: payout_id.to_string(),
                    expected: expected.to_string(),
                    found: entry.state.to_string(),
                });
            }

            if !entry.state.can_transition(new_state) {
                return Err(Error::InvalidTransition {
                    from: entry.state.to_string(),
                    to: new_state.to_string(),
                });
            }

            entry.state = new_state;
            if let Some(txid) = update.txid {
                entry.txid = Some(txid);
            }
            if let Some(confirmations) = update.confirmations {
                entry.confirmations = confirmations;
            }
            if let Some(reason) = update.reason {
                entry.reason = Some(reason);
            }
            if let Some(error) = update.error {
                entry.error = Some(error);
            }
            entry.updated_at = Utc::now();
            entry.clone()
        };

        self.persist().await?;
        Ok(updated)
    }

    async fn record_confirmations(&self, payout_id: &str, confirmations: u32) -> Result<()> {
        {
            let mut entry = self
                .records
                .get_mut(payout_id)
                .ok_or_else(|| Error::PayoutNotFound(payout_id.to_string()))?;

            if entry.state != PayoutState::Confirming {
                return Err(Error::StateConflict {
                    payout_id: payout_id.to_string(),
                    expected: PayoutState::Confirming.to_string(),
                    found: entry.state.to_string(),
                });
            }

            entry.confirmations = confirmations;
            entry.updated_at = Utc::now();
        }
        self.persist().await
    }

    async fn record_txid(&self, payout_id: &str, txid: String) -> Result<()> {
        {
            let mut entry = self
                .records
                .get_mut(payout_id)
                .ok_or_else(|| Error::PayoutNotFound(payout_id.to_string()))?;

            if entry.state != PayoutState::Confirming {
                return Err(Error::StateConflict {
                    payout_id: payout_id.to_string(),
                    expected: PayoutState::Confirming.to_string(),
                    found: entry.state.to_string(),
                });
            }

            entry.txid = Some(txid);
            entry.updated_at = Utc::now();
        }
        self.persist().await
    }

    async fn get(&self, payout_id: &str) -> Result<PayoutRecord> {
        self.records
            .get(payout_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| Error::PayoutNotFound(payout_id.to_string()))
    }

    async fn list(&self, filter: ListFilter) -> Result<Vec<PayoutRecord>> {
        let mut records: Vec<PayoutRecord> = self
            .records
            .iter()
            .filter(|e| filter.state.map(|s| e.state == s).unwrap_or(true))
            .filter(|e| {
                filter
                    .batch_type
                    .map(|b| e.request.batch_type == b)
                    .unwrap_or(true)
            })
            .map(|e| e.value().clone())
            .collect();

        records.sort_by_key(|r| r.created_at);
        if let Some(limit) = filter.limit {
            records.truncate(limit);
        }
        Ok(records)
    }

    async fn find_by_reference(&self, reference_id: &str) -> Option<String> {
        self.by_reference.get(reference_id).map(|e| e.value().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payout::{Asset, PayoutRequest, Priority, UNITS_PER_TOKEN};
    use crate::router::RouterType;

    fn record(reference: &str) -> PayoutRecord {
        PayoutRecord::new(
            PayoutRequest {
                recipient: "TR7NHqjeKQxGTCi8q8ZY4pL8otSzgjLj6t".to_string(),
                amount: 5 * UNITS_PER_TOKEN,
                asset: Asset::Usdt,
                reference_id: reference.to_string(),
                memo: String::new(),
                kyc_verified: false,
                kyc_hash: None,
                node_id: None,
                batch_type: crate::payout::BatchType::Immediate,
                priority: Priority::Normal,
            },
            RouterType::V0,
        )
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let store = MemoryStore::new(None);
        let r = record("ref-a");
        let id = r.payout_id.clone();
        store.create(r).await.unwrap();

        let fetched = store.get(&id).await.unwrap();
        assert_eq!(fetched.payout_id, id);
        assert_eq!(fetched.state, PayoutState::Created);
    }

    #[tokio::test]
    async fn test_conditional_update_detects_conflict() {
        let store = MemoryStore::new(None);
        let r = record("ref-b");
        let id = r.payout_id.clone();
        store.create(r).await.unwrap();

        store
            .update_state(&id, PayoutState::Created, PayoutState::Validating, StateUpdate::none())
            .await
            .unwrap();

        // Second writer still expects Created and must lose
        let err = store
            .update_state(&id, PayoutState::Created, PayoutState::Validating, StateUpdate::none())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StateConflict { .. }));
    }

    #[tokio::test]
    async fn test_illegal_transition_rejected() {
        let store = MemoryStore::new(None);
        let r = record("ref-c");
        let id = r.payout_id.clone();
        store.create(r).await.unwrap();

        let err = store
            .update_state(&id, PayoutState::Created, PayoutState::Confirmed, StateUpdate::none())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_terminal_record_cannot_move() {
        let store = MemoryStore::new(None);
        let r = record("ref-d");
        let id = r.payout_id.clone();
        store.create(r).await.unwrap();

        store
            .update_state(
                &id,
                PayoutState::Created,
                PayoutState::Cancelled,
                StateUpdate::terminal(TerminalReason::Cancelled, None),
            )
            .await
            .unwrap();

        for target in [PayoutState::Validating, PayoutState::Failed, PayoutState::Confirmed] {
            let err = store
                .update_state(&id, PayoutState::Cancelled, target, StateUpdate::none())
                .await
                .unwrap_err();
            assert!(matches!(err, Error::InvalidTransition { .. }));
        }
    }

    #[tokio::test]
    async fn test_reference_lookup() {
        let store = MemoryStore::new(None);
        let r = record("ref-e");
        let id = r.payout_id.clone();
        store.create(r).await.unwrap();

        assert_eq!(store.find_by_reference("ref-e").await, Some(id));
        assert_eq!(store.find_by_reference("ref-missing").await, None);
    }

    #[tokio::test]
    async fn test_list_filters_by_state() {
        let store = MemoryStore::new(None);
        let a = record("ref-f");
        let b = record("ref-g");
        let id_a = a.payout_id.clone();
        store.create(a).await.unwrap();
        store.create(b).await.unwrap();

        store
            .update_state(&id_a, PayoutState::Created, PayoutState::Validating, StateUpdate::none())
            .await
            .unwrap();

        let validating = store
            .list(ListFilter {
                state: Some(PayoutState::Validating),
                ..ListFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(validating.len(), 1);
        assert_eq!(validating[0].payout_id, id_a);

        let all = store.list(ListFilter::default()).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn test_snapshot_roundtrip_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payouts_registry.json");

        let store = MemoryStore::new(Some(path.clone()));
        let r = record("ref-h");
        let id = r.payout_id.clone();
        store.create(r).await.unwrap();
        store
            .update_state(&id, PayoutState::Created, PayoutState::Validating, StateUpdate::none())
            .await
            .unwrap();

        let reloaded = MemoryStore::new(Some(path));
        reloaded.load().await.unwrap();
        let fetched = reloaded.get(&id).await.unwrap();
        assert_eq!(fetched.state, PayoutState::Validating);
        assert_eq!(reloaded.find_by_reference("ref-h").await, Some(id));
    }
}
