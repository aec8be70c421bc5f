//! Payout lifecycle state machine
//!
//! Created -> Validating -> Pending -> Submitted -> Confirming and then
//! one of Confirmed / Failed / Cancelled. The three terminal states are
//! absorbing: no transition ever leaves them. Cancellation is only legal
//! strictly before submission.

use serde::{Deserialize, Serialize};

/// Payout lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayoutState {
    Created,
    Validating,
    Pending,
    Submitted,
    Confirming,
    Confirmed,
    Failed,
    Cancelled,
}

impl PayoutState {
    /// Terminal states are absorbing
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PayoutState::Confirmed | PayoutState::Failed | PayoutState::Cancelled
        )
    }

    /// Whether a transition from `self` to `to` is legal
    pub fn can_transition(&self, to: PayoutState) -> bool {
        use PayoutState::*;
        match (self, to) {
            (Created, Validating) => true,
            (Validating, Pending) => true,
            (Pending, Submitted) => true,
            (Submitted, Confirming) => true,
            (Confirming, Confirmed) => true,
            // Failure is reachable from every non-terminal working state
            (Validating | Pending | Submitted | Confirming, Failed) => true,
            // Cancellation only before submission
            (Created | Validating | Pending, Cancelled) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for PayoutState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PayoutState::Created => "created",
            PayoutState::Validating => "validating",
            PayoutState::Pending => "pending",
            PayoutState::Submitted => "submitted",
            PayoutState::Confirming => "confirming",
            PayoutState::Confirmed => "confirmed",
            PayoutState::Failed => "failed",
            PayoutState::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Why a payout reached a terminal state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalReason {
    /// Confirmed on-chain past the required threshold
    Completed,
    /// Address or amount failed validation
    InvalidRequest,
    /// Denied by the limit guard (caps or open breaker)
    LimitExceeded,
    /// Submission failed after retries were exhausted
    SubmissionFailed,
    /// Mined but reverted on-chain
    OnChainRevert,
    /// Never observed on the ledger after rebroadcast
    Orphaned,
    /// Confirmation wait expired without a definitive result;
    /// the transaction may still settle, reconcile manually
    TimeoutUnconfirmed,
    /// Cancelled by the caller before submission
    Cancelled,
}

impl TerminalReason {
    /// Ambiguous outcomes are excluded from circuit-breaker accounting
    pub fn counts_as_breaker_failure(&self) -> bool {
        matches!(
            self,
            TerminalReason::SubmissionFailed | TerminalReason::OnChainRevert | TerminalReason::Orphaned
        )
    }
}

impl std::fmt::Display for TerminalReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TerminalReason::Completed => "completed",
            TerminalReason::InvalidRequest => "invalid_request",
            TerminalReason::LimitExceeded => "limit_exceeded",
            TerminalReason::SubmissionFailed => "submission_failed",
            TerminalReason::OnChainRevert => "on_chain_revert",
            TerminalReason::Orphaned => "orphaned",
            TerminalReason::TimeoutUnconfirmed => "timeout_unconfirmed",
            TerminalReason::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use PayoutState::*;

    const ALL: [PayoutState; 8] = [
        Created, Validating, Pending, Submitted, Confirming, Confirmed, Failed, Cancelled,
    ];

    #[test]
    fn test_happy_path_is_legal() {
        assert!(Created.can_transition(Validating));
        assert!(Validating.can_transition(Pending));
        assert!(Pending.can_transition(Submitted));
        assert!(Submitted.can_transition(Confirming));
        assert!(Confirming.can_transition(Confirmed));
    }

    #[test]
    fn test_terminal_states_are_absorbing() {
        for terminal in [Confirmed, Failed, Cancelled] {
            assert!(terminal.is_terminal());
            for to in ALL {
                assert!(
                    !terminal.can_transition(to),
                    "{} -> {} must be illegal",
                    terminal,
                    to
                );
            }
        }
    }

    #[test]
    fn test_no_skipping_forward() {
        assert!(!Created.can_transition(Pending));
        assert!(!Created.can_transition(Submitted));
        assert!(!Pending.can_transition(Confirming));
        assert!(!Validating.can_transition(Confirmed));
    }

    #[test]
    fn test_cancel_only_before_submission() {
        assert!(Created.can_transition(Cancelled));
        assert!(Validating.can_transition(Cancelled));
        assert!(Pending.can_transition(Cancelled));
        assert!(!Submitted.can_transition(Cancelled));
        assert!(!Confirming.can_transition(Cancelled));
    }

    #[test]
    fn test_no_backward_transitions() {
        assert!(!Pending.can_transition(Validating));
        assert!(!Confirming.can_transition(Submitted));
        assert!(!Submitted.can_transition(Pending));
    }

    #[test]
    fn test_breaker_accounting_excludes_ambiguous_outcomes() {
        assert!(TerminalReason::SubmissionFailed.counts_as_breaker_failure());
        assert!(TerminalReason::OnChainRevert.counts_as_breaker_failure());
        assert!(TerminalReason::Orphaned.counts_as_breaker_failure());
        assert!(!TerminalReason::TimeoutUnconfirmed.counts_as_breaker_failure());
        assert!(!TerminalReason::LimitExceeded.counts_as_breaker_failure());
        assert!(!TerminalReason::InvalidRequest.counts_as_breaker_failure());
    }
}
