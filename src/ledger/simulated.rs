//! Simulated ledger gateway
//!
//! Deterministic in-process gateway used for dry-run mode and tests.
//! Submissions are accepted instantly and confirmations advance on every
//! status poll. Failure behavior is scriptable per recipient and per
//! submission attempt.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use super::{LedgerGateway, TxResult, TxStatus};
use crate::error::{Error, Result};
use crate::payout::Asset;

/// How a simulated transaction behaves after submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SimOutcome {
    /// Confirms normally
    Confirm,
    /// Mines, then reverts
    Revert,
    /// Never appears on the ledger
    Orphan,
}

/// A scripted submission failure, consumed in FIFO order
#[derive(Debug, Clone)]
pub struct SimFailure {
    /// Transient failures are retryable, permanent ones are not
    pub transient: bool,
    pub message: String,
}

impl SimFailure {
    pub fn transient(message: &str) -> Self {
        Self {
            transient: true,
            message: message.to_string(),
        }
    }

    pub fn permanent(message: &str) -> Self {
        Self {
            transient: false,
            message: message.to_string(),
        }
    }
}

#[derive(Debug)]
struct SimTx {
    outcome: SimOutcome,
    confirmations: u32,
}

/// Deterministic in-process ledger
pub struct SimulatedGateway {
    /// Confirmations gained per status poll
    confirms_per_poll: u32,
    txs: DashMap<String, SimTx>,
    balances: DashMap<(String, Asset), u64>,
    /// Scripted failures for upcoming submit calls
    submit_failures: Mutex<Vec<SimFailure>>,
    /// Recipients whose transactions revert on-chain
    reverting: DashMap<String, ()>,
    /// Recipients whose transactions never land
    orphaning: DashMap<String, ()>,
    submit_calls: AtomicU64,
    status_calls: AtomicU64,
}

impl SimulatedGateway {
    pub fn new(confirms_per_poll: u32) -> Self {
        Self {
            confirms_per_poll: confirms_per_poll.max(1),
            txs: DashMap::new(),
            balances: DashMap::new(),
            submit_failures: Mutex::new(Vec::new()),
            reverting: DashMap::new(),
            orphaning: DashMap::new(),
            submit_calls: AtomicU64::new(0),
            status_calls: AtomicU64::new(0),
        }
    }

    /// Queue failures for the next submit calls, consumed first-in first-out
    pub fn script_submit_failures(&self, failures: Vec<SimFailure>) {
        let mut queue = self.submit_failures.lock().expect("failure queue poisoned");
        queue.extend(failures);
    }

    /// Make every transaction to `recipient` revert on-chain
    pub fn revert_for(&self, recipient: &str) {
        self.reverting.insert(recipient.to_string(), ());
    }

    /// Make every transaction to `recipient` disappear after submission
    pub fn orphan_for(&self, recipient: &str) {
        self.orphaning.insert(recipient.to_string(), ());
    }

    /// Stop orphaning a recipient (rebroadcasts then land normally)
    pub fn clear_orphan(&self, recipient: &str) {
        self.orphaning.remove(recipient);
    }

    pub fn set_balance(&self, address: &str, asset: Asset, units: u64) {
        self.balances.insert((address.to_string(), asset), units);
    }

    /// Number of submit attempts the gateway has seen
    pub fn submit_calls(&self) -> u64 {
        self.submit_calls.load(Ordering::SeqCst)
    }

    pub fn status_calls(&self) -> u64 {
        self.status_calls.load(Ordering::SeqCst)
    }
}

impl Default for SimulatedGateway {
    fn default() -> Self {
        // One poll cycle per confirmation batch; 19 confirmations in 3 polls
        Self::new(7)
    }
}

#[async_trait]
impl LedgerGateway for SimulatedGateway {
    async fn submit(&self, to: &str, amount: u64, asset: Asset) -> Result<String> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);

        let scripted = {
            let mut queue = self.submit_failures.lock().expect("failure queue poisoned");
            if queue.is_empty() {
                None
            } else {
                Some(queue.remove(0))
            }
        };

        if let Some(failure) = scripted {
            return if failure.transient {
                Err(Error::GatewayConnection(failure.message))
            } else {
                Err(Error::GatewayRejected(failure.message))
            };
        }

        let outcome = if self.orphaning.contains_key(to) {
            SimOutcome::Orphan
        } else if self.reverting.contains_key(to) {
            SimOutcome::Revert
        } else {
            SimOutcome::Confirm
        };

        let txid = format!("simtx_{}", Uuid::new_v4().simple());
        self.txs.insert(
            txid.clone(),
            SimTx {
                outcome,
                confirmations: 0,
            },
        );

        debug!(txid = %txid, to = %to, amount, asset = %asset, "Simulated submission accepted");
        Ok(txid)
    }

    async fn get_status(&self, txid: &str) -> Result<TxStatus> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);

        let mut entry = match self.txs.get_mut(txid) {
            Some(entry) => entry,
            None => {
                return Ok(TxStatus {
                    confirmations: 0,
                    result: TxResult::NotFound,
                })
            }
        };

        if entry.outcome == SimOutcome::Orphan {
            return Ok(TxStatus {
                confirmations: 0,
                result: TxResult::NotFound,
            });
        }

        entry.confirmations = entry.confirmations.saturating_add(self.confirms_per_poll);

        let result = match entry.outcome {
            SimOutcome::Revert => TxResult::Reverted,
            SimOutcome::Confirm => TxResult::Success,
            SimOutcome::Orphan => unreachable!(),
        };

        Ok(TxStatus {
            confirmations: entry.confirmations,
            result,
        })
    }

    async fn get_balance(&self, address: &str, asset: Asset) -> Result<u64> {
        Ok(self
            .balances
            .get(&(address.to_string(), asset))
            .map(|b| *b)
            .unwrap_or(0))
    }
}
