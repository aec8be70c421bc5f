//! TRON address validation
//!
//! Base58check validation for mainnet TRON addresses. Addresses are the
//! base58 encoding of a 21-byte payload (0x41 prefix + 20-byte key hash)
//! followed by a 4-byte double-sha256 checksum.

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Mainnet address version byte
const ADDRESS_PREFIX: u8 = 0x41;

/// Decoded payload + checksum length
const DECODED_LEN: usize = 25;

/// Expected base58 string length for a mainnet address
pub const ADDRESS_LEN: usize = 34;

/// Validate a TRON base58check address, returning it unchanged on success
pub fn validate(address: &str) -> Result<&str> {
    if address.len() != ADDRESS_LEN || !address.starts_with('T') {
        return Err(Error::InvalidAddress(format!(
            "expected {}-char address starting with 'T', got '{}'",
            ADDRESS_LEN, address
        )));
    }

    let decoded = bs58::decode(address)
        .into_vec()
        .map_err(|e| Error::InvalidAddress(format!("base58 decode failed: {}", e)))?;

    if decoded.len() != DECODED_LEN {
        return Err(Error::InvalidAddress(format!(
            "decoded length {} != {}",
            decoded.len(),
            DECODED_LEN
        )));
    }

    let (payload, checksum) = decoded.split_at(DECODED_LEN - 4);

    if payload[0] != ADDRESS_PREFIX {
        return Err(Error::InvalidAddress(format!(
            "version byte {:#04x} != {:#04x}",
            payload[0], ADDRESS_PREFIX
        )));
    }

    let digest = Sha256::digest(Sha256::digest(payload));
    if digest[..4] != *checksum {
        return Err(Error::InvalidAddress("checksum mismatch".to_string()));
    }

    Ok(address)
}

/// Check validity without consuming the error
pub fn is_valid(address: &str) -> bool {
    validate(address).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    // Mainnet USDT-TRC20 contract address, a known-good base58check string
    const USDT_CONTRACT: &str = "TR7NHqjeKQxGTCi8q8ZY4pL8otSzgjLj6t";

    #[test]
    fn test_valid_address() {
        assert!(is_valid(USDT_CONTRACT));
        assert_eq!(validate(USDT_CONTRACT).unwrap(), USDT_CONTRACT);
    }

    #[test]
    fn test_rejects_wrong_prefix() {
        // Bitcoin-style address, right length but wrong prefix
        assert!(!is_valid("1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa"));
    }

    #[test]
    fn test_rejects_wrong_length() {
        assert!(!is_valid("T"));
        assert!(!is_valid(""));
        assert!(!is_valid("TR7NHqjeKQxGTCi8q8ZY4pL8otSzgjLj6tXX"));
    }

    #[test]
    fn test_rejects_corrupted_checksum() {
        // Flip the last character; base58 still decodes but checksum breaks
        let mut corrupted = USDT_CONTRACT.to_string();
        corrupted.pop();
        corrupted.push('u');
        assert!(!is_valid(&corrupted));
    }

    #[test]
    fn test_rejects_invalid_base58() {
        // '0' and 'l' are not in the base58 alphabet
        assert!(!is_valid("T0lllllllllllllllllllllllllllllll0"));
    }
}
