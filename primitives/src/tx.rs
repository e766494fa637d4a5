//! Ledger transactions.
//!
//! ## Wire Format (big-endian)
//!
//! ```text
//! [chain_id: 8]
//! [nonce: 8]
//! [to: 20]            zero address = contract creation
//! [value: 32]
//! [gas_limit: 8]
//! [gas_price: 32]
//! [data_len: 4][data]
//! [signature: 65]     r || s || v
//! ```
//!
//! The signature covers `keccak(unsigned prefix)`, i.e. everything before
//! the signature field. The sender is never transmitted; it is recovered.
//! The transaction hash is `keccak` of the full encoding.

use crate::arith::{checked_add, checked_mul};
use crate::codec::{write_framed, write_u256, write_u64, Reader};
use crate::crypto::{self, keccak256, Signature, SigningKey};
use crate::error::{ArithmeticFault, ChainError, ChainResult};
use crate::types::{Address, ChainId, Hash, U256, ZERO_ADDRESS};

/// Base cost charged to every transaction.
pub const G_TX_BASE: u64 = 21_000;
/// Cost per zero byte of call data.
pub const G_TX_DATA_ZERO: u64 = 4;
/// Cost per non-zero byte of call data.
pub const G_TX_DATA_NONZERO: u64 = 16;

/// Fields of a transaction before it is signed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedTransaction {
    pub chain_id: ChainId,
    pub nonce: u64,
    pub to: Address,
    pub value: U256,
    pub gas_limit: u64,
    pub gas_price: U256,
    pub data: Vec<u8>,
}

impl UnsignedTransaction {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(112 + self.data.len() + Signature::LEN);
        write_u64(&mut buf, self.chain_id);
        write_u64(&mut buf, self.nonce);
        buf.extend_from_slice(&self.to);
        write_u256(&mut buf, &self.value);
        write_u64(&mut buf, self.gas_limit);
        write_u256(&mut buf, &self.gas_price);
        write_framed(&mut buf, &self.data);
        buf
    }

    /// Sign with `key`, producing an immutable transaction.
    pub fn sign(self, key: &SigningKey) -> ChainResult<Transaction> {
        let unsigned = self.encode();
        let signature = crypto::sign(&keccak256(&unsigned), key)?;
        let from = crypto::address_of(key);
        Ok(Transaction::assemble(self, unsigned, signature, from))
    }
}

/// A signed ledger transaction. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    fields: UnsignedTransaction,
    from: Address,
    signature: Signature,
    hash: Hash,
}

impl Transaction {
    fn assemble(
        fields: UnsignedTransaction,
        mut encoded: Vec<u8>,
        signature: Signature,
        from: Address,
    ) -> Self {
        encoded.extend_from_slice(&signature.to_bytes());
        let hash = keccak256(&encoded);
        Self {
            fields,
            from,
            signature,
            hash,
        }
    }

    /// Decode and authenticate a transaction.
    ///
    /// Rejects malformed bytes, a chain id other than `required_chain_id`,
    /// and signatures that do not recover to a public key.
    pub fn from_bytes(bytes: &[u8], required_chain_id: ChainId) -> ChainResult<Self> {
        let mut r = Reader::new(bytes);
        let chain_id = r.read_u64()?;
        let nonce = r.read_u64()?;
        let to = r.read_address()?;
        let value = r.read_u256()?;
        let gas_limit = r.read_u64()?;
        let gas_price = r.read_u256()?;
        let data = r.read_framed()?.to_vec();
        let unsigned_len = r.position();
        let signature = Signature::from_slice(r.read_bytes(Signature::LEN)?)?;
        if !r.is_empty() {
            return Err(ChainError::MalformedInput(format!(
                "{} trailing bytes after transaction",
                r.remaining()
            )));
        }
        if chain_id != required_chain_id {
            return Err(ChainError::InvalidTransaction(format!(
                "wrong chain id: expected {}, got {}",
                required_chain_id, chain_id
            )));
        }

        let unsigned = &bytes[..unsigned_len];
        let from = crypto::recover_address(&signature, &keccak256(unsigned))?;
        Ok(Self {
            fields: UnsignedTransaction {
                chain_id,
                nonce,
                to,
                value,
                gas_limit,
                gas_price,
                data,
            },
            from,
            signature,
            hash: keccak256(bytes),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = self.fields.encode();
        buf.extend_from_slice(&self.signature.to_bytes());
        buf
    }

    pub fn hash(&self) -> &Hash {
        &self.hash
    }

    pub fn from(&self) -> &Address {
        &self.from
    }

    pub fn to(&self) -> &Address {
        &self.fields.to
    }

    pub fn value(&self) -> &U256 {
        &self.fields.value
    }

    pub fn nonce(&self) -> u64 {
        self.fields.nonce
    }

    pub fn chain_id(&self) -> ChainId {
        self.fields.chain_id
    }

    pub fn gas_limit(&self) -> u64 {
        self.fields.gas_limit
    }

    pub fn gas_price(&self) -> &U256 {
        &self.fields.gas_price
    }

    pub fn data(&self) -> &[u8] {
        &self.fields.data
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn is_contract_creation(&self) -> bool {
        self.fields.to == ZERO_ADDRESS
    }

    /// Maximum fee this transaction may pay: `gas_limit * gas_price`.
    pub fn gas_cost(&self) -> Result<U256, ArithmeticFault> {
        checked_mul(U256::from(self.fields.gas_limit), self.fields.gas_price)
    }

    /// Value plus maximum fee; what the sender must be able to cover.
    pub fn total_cost(&self) -> Result<U256, ArithmeticFault> {
        checked_add(self.fields.value, self.gas_cost()?)
    }

    /// Gas consumed before any execution happens.
    pub fn intrinsic_gas(&self) -> u64 {
        intrinsic_gas(&self.fields.data)
    }
}

/// Intrinsic gas for a payload: base cost plus per-byte data cost.
pub fn intrinsic_gas(data: &[u8]) -> u64 {
    data.iter().fold(G_TX_BASE, |acc, byte| {
        acc.saturating_add(if *byte == 0 {
            G_TX_DATA_ZERO
        } else {
            G_TX_DATA_NONZERO
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{address_of, key_from_bytes};

    fn transfer(nonce: u64, value: u64) -> UnsignedTransaction {
        UnsignedTransaction {
            chain_id: 8080,
            nonce,
            to: [0xbb; 20],
            value: U256::from(value),
            gas_limit: 21_000,
            gas_price: U256::from(1),
            data: Vec::new(),
        }
    }

    #[test]
    fn test_sign_then_decode_recovers_sender() {
        let key = key_from_bytes(&[1; 32]).unwrap();
        let tx = transfer(0, 400).sign(&key).unwrap();
        let decoded = Transaction::from_bytes(&tx.to_bytes(), 8080).unwrap();
        assert_eq!(decoded, tx);
        assert_eq!(decoded.from(), &address_of(&key));
        assert_eq!(decoded.hash(), &keccak256(&tx.to_bytes()));
    }

    #[test]
    fn test_wrong_chain_id_rejected() {
        let key = key_from_bytes(&[1; 32]).unwrap();
        let tx = transfer(0, 1).sign(&key).unwrap();
        let err = Transaction::from_bytes(&tx.to_bytes(), 1).unwrap_err();
        assert!(matches!(err, ChainError::InvalidTransaction(_)));
    }

    #[test]
    fn test_tampered_value_changes_sender() {
        let key = key_from_bytes(&[1; 32]).unwrap();
        let tx = transfer(0, 1).sign(&key).unwrap();
        let mut bytes = tx.to_bytes();
        bytes[8 + 8 + 20 + 31] ^= 0x01;
        match Transaction::from_bytes(&bytes, 8080) {
            Ok(decoded) => assert_ne!(decoded.from(), tx.from()),
            Err(e) => assert!(matches!(e, ChainError::Signature(_))),
        }
    }

    #[test]
    fn test_truncated_and_trailing_bytes_rejected() {
        let key = key_from_bytes(&[1; 32]).unwrap();
        let bytes = transfer(0, 1).sign(&key).unwrap().to_bytes();
        assert!(Transaction::from_bytes(&bytes[..bytes.len() - 1], 8080).is_err());
        let mut longer = bytes.clone();
        longer.push(0);
        assert!(Transaction::from_bytes(&longer, 8080).is_err());
    }

    #[test]
    fn test_costs() {
        let key = key_from_bytes(&[1; 32]).unwrap();
        let tx = transfer(0, 400).sign(&key).unwrap();
        assert_eq!(tx.gas_cost().unwrap(), U256::from(21_000));
        assert_eq!(tx.total_cost().unwrap(), U256::from(21_400));

        let mut overflowing = transfer(0, 0);
        overflowing.gas_price = U256::MAX;
        let tx = overflowing.sign(&key).unwrap();
        assert_eq!(tx.gas_cost(), Err(ArithmeticFault::Overflow));
    }

    #[test]
    fn test_intrinsic_gas() {
        assert_eq!(intrinsic_gas(&[]), 21_000);
        assert_eq!(intrinsic_gas(&[0, 1, 0, 2]), 21_000 + 4 + 16 + 4 + 16);
    }
}
