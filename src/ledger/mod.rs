//! Ledger gateway abstraction
//!
//! The engine never talks to the TRON network directly. Everything goes
//! through [`LedgerGateway`], a thin submit/query capability; signing and
//! RPC encoding belong to the gateway implementation. All retry and
//! backoff policy lives on the engine side.

pub mod simulated;

pub use simulated::{SimFailure, SimulatedGateway};

use async_trait::async_trait;

use crate::error::Result;
use crate::payout::Asset;

/// Nominal block interval. Confirmation counts are authoritative for
/// finality; any time estimate derived from this is approximate only.
pub const BLOCK_TIME_SECS: u64 = 3;

/// On-chain outcome of a submitted transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxResult {
    /// Not yet mined
    Pending,
    /// Mined and executed successfully
    Success,
    /// Mined but reverted during execution
    Reverted,
    /// Unknown to the ledger
    NotFound,
}

/// Status snapshot for one transaction
#[derive(Debug, Clone, Copy)]
pub struct TxStatus {
    /// Blocks mined on top of the transaction's block
    pub confirmations: u32,
    pub result: TxResult,
}

/// Submit/query capability against the external ledger
///
/// Implementations are expected to be thin and possibly unreliable;
/// transient transport failures surface as retryable errors and the
/// caller owns the retry policy.
#[async_trait]
pub trait LedgerGateway: Send + Sync {
    /// Submit a transfer, returning the ledger transaction id
    async fn submit(&self, to: &str, amount: u64, asset: Asset) -> Result<String>;

    /// Query confirmation progress for a previously submitted transaction
    async fn get_status(&self, txid: &str) -> Result<TxStatus>;

    /// Current balance of an address in base units
    async fn get_balance(&self, address: &str, asset: Asset) -> Result<u64>;
}
