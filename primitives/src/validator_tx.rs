//! Validator transactions carrying commit-reveal randomness.
//!
//! ## Wire Format (big-endian)
//!
//! ```text
//! [chain_id: 8]
//! [height: 8]
//! [data_len: 4][data]     selector (4) || payload (32)
//! [signature: 65]
//! ```
//!
//! A commit carries `keccak(seed)`; the matching reveal carries `seed`.
//! Validator transactions never touch the ledger.

use crate::codec::{write_framed, write_u64, Reader};
use crate::crypto::{self, keccak256, Signature, SigningKey};
use crate::error::{ChainError, ChainResult};
use crate::types::{Address, BlockHeight, ChainId, Hash, ZERO_HASH};

/// Selector of a commit payload.
pub const COMMIT_SELECTOR: [u8; 4] = [0xcf, 0xff, 0xe7, 0x46];
/// Selector of a reveal payload.
pub const REVEAL_SELECTOR: [u8; 4] = [0x6f, 0xc5, 0xa2, 0xd6];

/// Decoded meaning of a validator transaction payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidatorTxKind {
    /// Hash of a seed not yet disclosed.
    Commit(Hash),
    /// The seed itself.
    Reveal(Hash),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatorTx {
    chain_id: ChainId,
    height: BlockHeight,
    data: Vec<u8>,
    from: Address,
    signature: Signature,
    hash: Hash,
}

impl ValidatorTx {
    /// Build and sign a validator transaction with an arbitrary payload.
    pub fn new(
        data: Vec<u8>,
        height: BlockHeight,
        chain_id: ChainId,
        key: &SigningKey,
    ) -> ChainResult<Self> {
        let unsigned = encode_unsigned(chain_id, height, &data);
        let signature = crypto::sign(&keccak256(&unsigned), key)?;
        let mut full = unsigned;
        full.extend_from_slice(&signature.to_bytes());
        Ok(Self {
            chain_id,
            height,
            data,
            from: crypto::address_of(key),
            signature,
            hash: keccak256(&full),
        })
    }

    /// Commit to `seed` for `height`.
    pub fn commit(seed: &Hash, height: BlockHeight, chain_id: ChainId, key: &SigningKey) -> ChainResult<Self> {
        Self::new(payload(COMMIT_SELECTOR, &keccak256(seed)), height, chain_id, key)
    }

    /// Reveal `seed` for `height`.
    pub fn reveal(seed: &Hash, height: BlockHeight, chain_id: ChainId, key: &SigningKey) -> ChainResult<Self> {
        Self::new(payload(REVEAL_SELECTOR, seed), height, chain_id, key)
    }

    pub fn from_bytes(bytes: &[u8], required_chain_id: ChainId) -> ChainResult<Self> {
        let mut r = Reader::new(bytes);
        let chain_id = r.read_u64()?;
        let height = r.read_u64()?;
        let data = r.read_framed()?.to_vec();
        let unsigned_len = r.position();
        let signature = Signature::from_slice(r.read_bytes(Signature::LEN)?)?;
        if !r.is_empty() {
            return Err(ChainError::MalformedInput(format!(
                "{} trailing bytes after validator transaction",
                r.remaining()
            )));
        }
        if chain_id != required_chain_id {
            return Err(ChainError::InvalidTransaction(format!(
                "wrong chain id: expected {}, got {}",
                required_chain_id, chain_id
            )));
        }
        let from = crypto::recover_address(&signature, &keccak256(&bytes[..unsigned_len]))?;
        Ok(Self {
            chain_id,
            height,
            data,
            from,
            signature,
            hash: keccak256(bytes),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = encode_unsigned(self.chain_id, self.height, &self.data);
        buf.extend_from_slice(&self.signature.to_bytes());
        buf
    }

    /// Classify the payload as a commit or a reveal.
    pub fn kind(&self) -> ChainResult<ValidatorTxKind> {
        if self.data.len() != 4 + 32 {
            return Err(ChainError::InvalidTransaction(format!(
                "validator payload must be 36 bytes, got {}",
                self.data.len()
            )));
        }
        let mut value = [0u8; 32];
        value.copy_from_slice(&self.data[4..]);
        match &self.data[..4] {
            s if s == COMMIT_SELECTOR => Ok(ValidatorTxKind::Commit(value)),
            s if s == REVEAL_SELECTOR => Ok(ValidatorTxKind::Reveal(value)),
            other => Err(ChainError::InvalidTransaction(format!(
                "unknown validator selector {}",
                crate::types::to_hex(other)
            ))),
        }
    }

    pub fn hash(&self) -> &Hash {
        &self.hash
    }

    pub fn from(&self) -> &Address {
        &self.from
    }

    pub fn height(&self) -> BlockHeight {
        self.height
    }

    pub fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }
}

fn encode_unsigned(chain_id: ChainId, height: BlockHeight, data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(20 + data.len() + Signature::LEN);
    write_u64(&mut buf, chain_id);
    write_u64(&mut buf, height);
    write_framed(&mut buf, data);
    buf
}

fn payload(selector: [u8; 4], value: &Hash) -> Vec<u8> {
    let mut data = Vec::with_capacity(36);
    data.extend_from_slice(&selector);
    data.extend_from_slice(value);
    data
}

/// Combine revealed seeds into one: keccak of the seeds sorted ascending
/// and concatenated. The result does not depend on input order.
pub fn combine_seeds(seeds: &[Hash]) -> Hash {
    if seeds.is_empty() {
        return ZERO_HASH;
    }
    let mut sorted = seeds.to_vec();
    sorted.sort_unstable();
    keccak256(&sorted.concat())
}

/// Randomness of a block: the combination of every reveal it carries.
pub fn block_randomness(validator_txs: &[ValidatorTx]) -> ChainResult<Hash> {
    let mut seeds = Vec::new();
    for tx in validator_txs {
        if let ValidatorTxKind::Reveal(seed) = tx.kind()? {
            seeds.push(seed);
        }
    }
    Ok(combine_seeds(&seeds))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{address_of, key_from_bytes};

    #[test]
    fn test_commit_and_reveal_kinds() {
        let key = key_from_bytes(&[4; 32]).unwrap();
        let seed = [9u8; 32];
        let commit = ValidatorTx::commit(&seed, 1, 8080, &key).unwrap();
        let reveal = ValidatorTx::reveal(&seed, 1, 8080, &key).unwrap();
        assert_eq!(commit.kind().unwrap(), ValidatorTxKind::Commit(keccak256(&seed)));
        assert_eq!(reveal.kind().unwrap(), ValidatorTxKind::Reveal(seed));
        assert_eq!(&commit.data()[..4], &COMMIT_SELECTOR);
    }

    #[test]
    fn test_bytes_roundtrip_recovers_sender() {
        let key = key_from_bytes(&[4; 32]).unwrap();
        let tx = ValidatorTx::commit(&[1; 32], 12, 8080, &key).unwrap();
        let decoded = ValidatorTx::from_bytes(&tx.to_bytes(), 8080).unwrap();
        assert_eq!(decoded, tx);
        assert_eq!(decoded.from(), &address_of(&key));
        assert_eq!(decoded.height(), 12);
    }

    #[test]
    fn test_unknown_selector_rejected() {
        let key = key_from_bytes(&[4; 32]).unwrap();
        let tx = ValidatorTx::new(vec![0u8; 36], 1, 8080, &key).unwrap();
        assert!(tx.kind().is_err());
        let short = ValidatorTx::new(vec![0u8; 5], 1, 8080, &key).unwrap();
        assert!(short.kind().is_err());
    }

    #[test]
    fn test_combine_seeds_is_order_independent() {
        let a = [1u8; 32];
        let b = [2u8; 32];
        let c = [3u8; 32];
        assert_eq!(combine_seeds(&[a, b, c]), combine_seeds(&[c, a, b]));
        assert_ne!(combine_seeds(&[a, b]), combine_seeds(&[a, c]));
        assert_eq!(combine_seeds(&[]), ZERO_HASH);
    }

    #[test]
    fn test_block_randomness_ignores_commits() {
        let key = key_from_bytes(&[4; 32]).unwrap();
        let seed = [5u8; 32];
        let txs = vec![
            ValidatorTx::commit(&seed, 1, 8080, &key).unwrap(),
            ValidatorTx::reveal(&seed, 1, 8080, &key).unwrap(),
        ];
        assert_eq!(block_randomness(&txs).unwrap(), combine_seeds(&[seed]));
    }
}
