//! Error types for the payout engine

use thiserror::Error;

/// Result type alias using our custom Error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the payout engine
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    // Request validation errors
    #[error("Invalid recipient address: {0}")]
    InvalidAddress(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // Limit / circuit breaker errors
    #[error("Daily limit exceeded: {used} + {requested} > {limit} units")]
    DailyLimitExceeded { used: u64, requested: u64, limit: u64 },

    #[error("Hourly limit exceeded: {used} + {requested} > {limit} units")]
    HourlyLimitExceeded { used: u64, requested: u64, limit: u64 },

    #[error("Circuit breaker is open, retry after {retry_after_secs}s")]
    CircuitBreakerOpen { retry_after_secs: i64 },

    // Ledger gateway errors
    #[error("Gateway timeout after {0}ms")]
    GatewayTimeout(u64),

    #[error("Gateway connection failed: {0}")]
    GatewayConnection(String),

    #[error("Gateway rejected transaction: {0}")]
    GatewayRejected(String),

    #[error("Transaction reverted on-chain: {0}")]
    OnChainRevert(String),

    #[error("Transaction not found on ledger: {0}")]
    TransactionNotFound(String),

    #[error("Confirmation timeout for txid {0}")]
    ConfirmationTimeout(String),

    // Payout state machine errors
    #[error("Payout not found: {0}")]
    PayoutNotFound(String),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Payout {payout_id} already submitted, cancellation rejected")]
    CancellationRejected { payout_id: String },

    #[error("State conflict for payout {payout_id}: expected {expected}, found {found}")]
    StateConflict {
        payout_id: String,
        expected: String,
        found: String,
    },

    // Batch errors
    #[error("Batch not found: {0}")]
    BatchNotFound(String),

    #[error("Batch {0} already dispatched")]
    BatchAlreadyDispatched(String),

    // Persistence errors
    #[error("Store persistence failed: {0}")]
    StorePersistence(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error is retryable (transient)
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::GatewayTimeout(_) | Error::GatewayConnection(_))
    }

    /// Check if this error is a limit or breaker violation
    pub fn is_limit_violation(&self) -> bool {
        matches!(
            self,
            Error::DailyLimitExceeded { .. }
                | Error::HourlyLimitExceeded { .. }
                | Error::CircuitBreakerOpen { .. }
        )
    }

    /// Check if this error is a request validation failure
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::InvalidAddress(_) | Error::InvalidAmount(_) | Error::InvalidRequest(_)
        )
    }
}

// Conversion from serde_json errors
impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

// Conversion from I/O errors
impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}
