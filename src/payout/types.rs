//! Payout request and record types
//!
//! All amounts are fixed-point `u64` base units. Both supported assets
//! carry 6 decimals: 1 USDT = 1_000_000 units, 1 TRX = 1_000_000 sun.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::payout::state::{PayoutState, TerminalReason};
use crate::router::RouterType;

/// Base units per whole token (6 decimals for both assets)
pub const UNITS_PER_TOKEN: u64 = 1_000_000;

/// Supported payout assets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Asset {
    /// USDT TRC-20 token
    Usdt,
    /// Native TRX coin
    Trx,
}

impl Asset {
    pub fn decimals(&self) -> u32 {
        6
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Asset::Usdt => "USDT",
            Asset::Trx => "TRX",
        }
    }
}

impl std::fmt::Display for Asset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.symbol())
    }
}

/// Render base units as a whole-token decimal string, e.g. 1_500_000 -> "1.5"
pub fn format_units(units: u64, asset: Asset) -> String {
    let whole = units / UNITS_PER_TOKEN;
    let frac = units % UNITS_PER_TOKEN;
    if frac == 0 {
        format!("{} {}", whole, asset.symbol())
    } else {
        let s = format!("{:06}", frac);
        format!("{}.{} {}", whole, s.trim_end_matches('0'), asset.symbol())
    }
}

/// Payout priority levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
    Urgent,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// Batch processing types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchType {
    /// Process immediately, bypassing batch windows
    Immediate,
    /// Accumulate until the top of the hour
    Hourly,
    /// Accumulate until UTC midnight
    Daily,
    /// Accumulate until Monday 00:00 UTC
    Weekly,
}

impl std::fmt::Display for BatchType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BatchType::Immediate => "immediate",
            BatchType::Hourly => "hourly",
            BatchType::Daily => "daily",
            BatchType::Weekly => "weekly",
        };
        write!(f, "{}", s)
    }
}

/// A disbursement request as received from the caller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayoutRequest {
    /// Recipient TRON address
    pub recipient: String,
    /// Amount in base units, strictly positive
    pub amount: u64,
    /// Asset to disburse
    pub asset: Asset,
    /// Caller-supplied idempotency key
    pub reference_id: String,
    /// Free-form reason, carried through to the record and logs
    #[serde(default)]
    pub memo: String,
    /// Whether the recipient passed KYC verification
    #[serde(default)]
    pub kyc_verified: bool,
    /// KYC verification digest, when present
    #[serde(default)]
    pub kyc_hash: Option<String>,
    /// Node the payout is credited against, when present
    #[serde(default)]
    pub node_id: Option<String>,
    /// Batch processing type
    pub batch_type: BatchType,
    /// Dispatch priority within a batch
    #[serde(default)]
    pub priority: Priority,
}

/// Generate a unique payout id
pub fn new_payout_id() -> String {
    format!("payout_{}", Uuid::new_v4().simple())
}

/// Generate a unique batch id
pub fn new_batch_id() -> String {
    format!("batch_{}", Uuid::new_v4().simple())
}

/// The full lifecycle record of one payout
///
/// Owned by the orchestrator; every mutation goes through a state-machine
/// transition and records are never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayoutRecord {
    /// Unique id, assigned at intake and never reused
    pub payout_id: String,
    /// The originating request
    pub request: PayoutRequest,
    /// Current lifecycle state
    pub state: PayoutState,
    /// Router chosen at intake
    pub router: RouterType,
    /// Ledger transaction id, absent until submitted
    pub txid: Option<String>,
    /// On-chain confirmation count observed so far
    pub confirmations: u32,
    /// Terminal reason code, set exactly once
    pub reason: Option<TerminalReason>,
    /// Human-readable error detail for failed payouts
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PayoutRecord {
    pub fn new(request: PayoutRequest, router: RouterType) -> Self {
        let now = Utc::now();
        Self {
            payout_id: new_payout_id(),
            request,
            state: PayoutState::Created,
            router,
            txid: None,
            confirmations: 0,
            reason: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Outward event emitted on every terminal transition
#[derive(Debug, Clone)]
pub struct TerminalEvent {
    pub payout_id: String,
    pub state: PayoutState,
    pub reason: TerminalReason,
    pub txid: Option<String>,
    pub at: DateTime<Utc>,
}
