//! Payout data model and lifecycle state machine

pub mod state;
pub mod types;

pub use state::{PayoutState, TerminalReason};
pub use types::{
    format_units, new_batch_id, new_payout_id, Asset, BatchType, PayoutRecord, PayoutRequest,
    Priority, TerminalEvent, UNITS_PER_TOKEN,
};
