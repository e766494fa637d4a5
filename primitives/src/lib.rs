//! `halcyon-primitives` — foundational types for the Halcyon chain.
//!
//! This crate provides the canonical hashes and addresses, error types,
//! checked 256-bit arithmetic, secp256k1 signatures, the binary Merkle tree,
//! the ABI argument codec and the wire formats of transactions, validator
//! transactions and blocks. It is shared by the P2P layer and the engine.

pub mod types;
pub mod error;
pub mod arith;
pub mod crypto;
pub mod merkle;
pub mod sync;
pub mod codec;
pub mod abi;
pub mod tx;
pub mod validator_tx;
pub mod block;

// Re-export commonly used types at the crate root for convenience.
pub use types::{Address, BlockHeight, ChainId, Hash, U256, ZERO_ADDRESS, ZERO_HASH};
pub use error::{ArithmeticFault, ChainError, ChainResult};
pub use crypto::{keccak256, Signature, SigningKey};
pub use merkle::{merkle_root, MerkleProof, MerkleTree};
pub use sync::Synced;
pub use abi::{AbiType, AbiValue};
pub use tx::{Transaction, UnsignedTransaction};
pub use validator_tx::{ValidatorTx, ValidatorTxKind};
pub use block::{DecodeOptions, FinalizedBlock, MutableBlock};
