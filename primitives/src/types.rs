//! Core type aliases and constants for Halcyon nodes.
//!
//! These types are shared by the block format, the consensus engine, the
//! state machine, and the P2P layer. All multi-byte integers that cross a
//! wire or storage boundary are big-endian.

use crate::error::{ChainError, ChainResult};

pub use primitive_types::U256;

/// 32-byte digest used for block hashes, transaction hashes and seeds.
pub type Hash = [u8; 32];

/// 20-byte account identifier (low 20 bytes of the public key hash).
pub type Address = [u8; 20];

/// Block height (genesis is 0).
pub type BlockHeight = u64;

/// Chain identifier carried by every transaction.
pub type ChainId = u64;

/// A zero-valued hash (32 zero bytes).
pub const ZERO_HASH: Hash = [0u8; 32];

/// A zero-valued address. Used as the `to` field of contract creations.
pub const ZERO_ADDRESS: Address = [0u8; 20];

/// Render bytes as a `0x`-prefixed lowercase hex string.
pub fn to_hex(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

/// Decode a hex string with an optional `0x` prefix.
pub fn bytes_from_hex(s: &str) -> ChainResult<Vec<u8>> {
    let stripped = s.strip_prefix("0x").unwrap_or(s);
    hex::decode(stripped).map_err(|e| ChainError::MalformedInput(format!("bad hex: {}", e)))
}

/// Parse a 32-byte hash from hex.
pub fn hash_from_hex(s: &str) -> ChainResult<Hash> {
    fixed_from_hex::<32>(s)
}

/// Parse a 20-byte address from hex.
pub fn address_from_hex(s: &str) -> ChainResult<Address> {
    fixed_from_hex::<20>(s)
}

fn fixed_from_hex<const N: usize>(s: &str) -> ChainResult<[u8; N]> {
    let bytes = bytes_from_hex(s)?;
    bytes.as_slice().try_into().map_err(|_| {
        ChainError::MalformedInput(format!("expected {} bytes, got {}", N, bytes.len()))
    })
}

/// Encode a U256 as a 32-byte big-endian word.
pub fn u256_to_word(value: &U256) -> [u8; 32] {
    let mut word = [0u8; 32];
    value.to_big_endian(&mut word);
    word
}

/// Current wall-clock time in microseconds since the Unix epoch.
pub fn timestamp_micros() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_hex() {
        let hash = [0xab; 32];
        let hex = to_hex(&hash);
        assert_eq!(hex.len(), 66);
        assert!(hex.starts_with("0x"));
        assert!(hex[2..].chars().all(|c| c == 'a' || c == 'b'));
    }

    #[test]
    fn test_address_from_hex_with_and_without_prefix() {
        let a = address_from_hex("0xb23aa52dbeda59277ab8a962c69f5971f22904cf").unwrap();
        let b = address_from_hex("b23aa52dbeda59277ab8a962c69f5971f22904cf").unwrap();
        assert_eq!(a, b);
        assert_eq!(a[0], 0xb2);
        assert_eq!(a[19], 0xcf);
    }

    #[test]
    fn test_bad_hex_is_malformed_input() {
        let err = hash_from_hex("0xzz").unwrap_err();
        assert!(matches!(err, ChainError::MalformedInput(_)));
    }

    #[test]
    fn test_wrong_length_hex_rejected() {
        assert!(address_from_hex("0x0011").is_err());
        assert!(hash_from_hex(&to_hex(&[1u8; 20])).is_err());
    }

    #[test]
    fn test_u256_word_is_big_endian() {
        let word = u256_to_word(&U256::from(0x0102u64));
        assert_eq!(word[30], 0x01);
        assert_eq!(word[31], 0x02);
        assert!(word[..30].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_zero_constants() {
        assert_eq!(ZERO_HASH, [0u8; 32]);
        assert_eq!(ZERO_ADDRESS, [0u8; 20]);
    }
}
