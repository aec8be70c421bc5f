//! Disbursement router selection
//!
//! Two routers exist with different compliance characteristics: the V0
//! router for end-users (no KYC, lower limits) and the KYC-gated router
//! for verified node operators. Selection is a pure function of the
//! request's compliance inputs. Missing or malformed inputs always
//! resolve to V0, never to the KYC path.

use serde::{Deserialize, Serialize};

/// Disbursement router types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouterType {
    /// Non-KYC router for end-user payouts
    V0,
    /// KYC-gated router for node worker payouts
    Kyc,
}

impl std::fmt::Display for RouterType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RouterType::V0 => write!(f, "v0"),
            RouterType::Kyc => write!(f, "kyc"),
        }
    }
}

/// Select the disbursement router for a payout request.
///
/// The KYC router is chosen only when the caller is verified, carries a
/// well-formed KYC digest, and names a node id. Everything else routes
/// through V0.
pub fn select(kyc_verified: bool, kyc_hash: Option<&str>, node_id: Option<&str>) -> RouterType {
    let hash_ok = kyc_hash.map(is_valid_kyc_hash).unwrap_or(false);
    let node_ok = node_id.map(|n| !n.trim().is_empty()).unwrap_or(false);

    if kyc_verified && hash_ok && node_ok {
        RouterType::Kyc
    } else {
        RouterType::V0
    }
}

/// A KYC hash is a 64-char lowercase hex sha256 digest
fn is_valid_kyc_hash(hash: &str) -> bool {
    hash.len() == 64 && hash.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    const HASH: &str = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";

    #[test]
    fn test_kyc_route_requires_all_inputs() {
        assert_eq!(select(true, Some(HASH), Some("node-1")), RouterType::Kyc);
    }

    #[test]
    fn test_missing_verification_routes_v0() {
        assert_eq!(select(false, Some(HASH), Some("node-1")), RouterType::V0);
    }

    #[test]
    fn test_missing_hash_routes_v0() {
        assert_eq!(select(true, None, Some("node-1")), RouterType::V0);
        assert_eq!(select(true, Some(""), Some("node-1")), RouterType::V0);
    }

    #[test]
    fn test_malformed_hash_routes_v0() {
        // Too short
        assert_eq!(select(true, Some("abc123"), Some("node-1")), RouterType::V0);
        // Uppercase hex is not accepted
        let upper = HASH.to_uppercase();
        assert_eq!(select(true, Some(&upper), Some("node-1")), RouterType::V0);
        // Non-hex characters
        let bad = format!("{}zz", &HASH[..62]);
        assert_eq!(select(true, Some(&bad), Some("node-1")), RouterType::V0);
    }

    #[test]
    fn test_missing_node_id_routes_v0() {
        assert_eq!(select(true, Some(HASH), None), RouterType::V0);
        assert_eq!(select(true, Some(HASH), Some("")), RouterType::V0);
        assert_eq!(select(true, Some(HASH), Some("   ")), RouterType::V0);
    }

    #[test]
    fn test_selection_is_deterministic() {
        for _ in 0..3 {
            assert_eq!(select(true, Some(HASH), Some("node-1")), RouterType::Kyc);
            assert_eq!(select(false, None, None), RouterType::V0);
        }
    }
}
