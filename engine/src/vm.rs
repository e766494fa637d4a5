//! Execution-engine seam for bytecode contracts.
//!
//! The state machine never interprets bytecode itself. It builds a
//! [`CallContext`], hands it to an [`ExecutionEngine`] together with a
//! read-only view of contract storage, and applies the returned
//! [`ExecutionOutcome`] only if it reports success.
//!
//! - In production: an adapter around a real bytecode VM
//! - In tests: [`MockEngine`], a tiny key-value "contract" driven by calldata

use halcyon_primitives::abi::{self, AbiType, AbiValue};
use halcyon_primitives::{keccak256, Address, BlockHeight, ChainResult, Hash, U256};

use crate::error::StateError;
use crate::gas::{GasMeter, G_CODE_BYTE, G_EVENT, G_SLOAD, G_SSTORE};

/// Everything the engine may know about a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallContext {
    pub caller: Address,
    /// Target contract; for creations, the address being created.
    pub to: Address,
    pub value: U256,
    /// Gas available to execution, after intrinsic costs.
    pub gas_limit: u64,
    /// Calldata, or init code for creations.
    pub data: Vec<u8>,
    /// Code of the target; empty for creations.
    pub code: Vec<u8>,
    pub block_height: BlockHeight,
    pub timestamp: u64,
    pub is_create: bool,
    /// Calls made by `eth_call` must not change state.
    pub is_static: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageDiff {
    pub key: Hash,
    pub value: Hash,
}

/// An event as emitted, before block coordinates are attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmittedEvent {
    pub name: String,
    pub address: Address,
    pub topics: Vec<Hash>,
    pub data: Vec<u8>,
    pub anonymous: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionOutcome {
    pub success: bool,
    /// Return data, revert reason on failure, runtime code on creation.
    pub return_data: Vec<u8>,
    pub gas_used: u64,
    pub storage_diffs: Vec<StorageDiff>,
    pub events: Vec<EmittedEvent>,
}

impl ExecutionOutcome {
    pub fn revert(reason: impl Into<String>, gas_used: u64) -> Self {
        Self {
            success: false,
            return_data: reason.into().into_bytes(),
            gas_used,
            ..Self::default()
        }
    }
}

/// Read access to contract storage as the engine sees it.
pub trait StorageView {
    /// Value of a slot; unset slots read as zero.
    fn storage_get(&self, contract: &Address, key: &Hash) -> Hash;
}

pub trait ExecutionEngine: Send + Sync {
    fn execute(&self, ctx: &CallContext, storage: &dyn StorageView) -> ExecutionOutcome;
}

// ── Mock engine ──

/// A deterministic stand-in for a bytecode VM.
///
/// Creation deploys the init code verbatim as runtime code. Calls
/// understand three functions, with slot keys and values passed as
/// `uint256` words:
///
/// - `store(uint256,uint256)` writes a slot and emits [`STORED_EVENT`]
/// - `load(uint256)` returns a slot
/// - `fail()` reverts
#[derive(Debug, Clone, Default)]
pub struct MockEngine;

const STORE: &str = "store(uint256,uint256)";
const LOAD: &str = "load(uint256)";
const FAIL: &str = "fail()";

/// Signature of the event emitted by a mock `store`.
pub const STORED_EVENT: &str = "Stored(uint256,uint256)";

impl MockEngine {
    pub fn new() -> Self {
        Self
    }

    fn run(
        &self,
        ctx: &CallContext,
        storage: &dyn StorageView,
        meter: &mut GasMeter,
    ) -> Result<ExecutionOutcome, StateError> {
        if ctx.is_create {
            meter.consume(G_CODE_BYTE.saturating_mul(ctx.data.len() as u64))?;
            return Ok(ExecutionOutcome {
                success: true,
                return_data: ctx.data.clone(),
                ..ExecutionOutcome::default()
            });
        }
        if ctx.code.is_empty() {
            return Err(StateError::Reverted("no code at target".into()));
        }
        if ctx.data.len() < 4 {
            return Err(StateError::Reverted("missing selector".into()));
        }
        let selector: [u8; 4] = [ctx.data[0], ctx.data[1], ctx.data[2], ctx.data[3]];

        if selector == abi::selector(STORE)? {
            if ctx.is_static {
                return Err(StateError::Reverted("state change in static call".into()));
            }
            let args = abi::decode(&[AbiType::Uint256, AbiType::Uint256], &ctx.data[4..])?;
            let (key, value) = (word(&args[0])?, word(&args[1])?);
            meter.consume(G_SSTORE)?;
            meter.consume(G_EVENT)?;
            return Ok(ExecutionOutcome {
                success: true,
                storage_diffs: vec![StorageDiff { key, value }],
                events: vec![EmittedEvent {
                    name: "Stored".into(),
                    address: ctx.to,
                    topics: vec![keccak256(STORED_EVENT.as_bytes()), key],
                    data: value.to_vec(),
                    anonymous: false,
                }],
                ..ExecutionOutcome::default()
            });
        }
        if selector == abi::selector(LOAD)? {
            let args = abi::decode(&[AbiType::Uint256], &ctx.data[4..])?;
            let key = word(&args[0])?;
            meter.consume(G_SLOAD)?;
            return Ok(ExecutionOutcome {
                success: true,
                return_data: storage.storage_get(&ctx.to, &key).to_vec(),
                ..ExecutionOutcome::default()
            });
        }
        if selector == abi::selector(FAIL)? {
            return Err(StateError::Reverted("fail() called".into()));
        }
        Err(StateError::Reverted(format!(
            "unknown selector {}",
            halcyon_primitives::types::to_hex(&selector)
        )))
    }
}

impl ExecutionEngine for MockEngine {
    fn execute(&self, ctx: &CallContext, storage: &dyn StorageView) -> ExecutionOutcome {
        let mut meter = GasMeter::new(ctx.gas_limit);
        match self.run(ctx, storage, &mut meter) {
            Ok(mut outcome) => {
                outcome.gas_used = meter.consumed();
                outcome
            }
            Err(e) => ExecutionOutcome::revert(e.to_string(), meter.consumed()),
        }
    }
}

fn word(value: &AbiValue) -> Result<Hash, StateError> {
    Ok(halcyon_primitives::types::u256_to_word(&value.as_u256()?))
}

fn slot(word: &Hash) -> AbiValue {
    AbiValue::Uint256(U256::from_big_endian(word))
}

/// Calldata for the mock `store`.
pub fn encode_store(key: &Hash, value: &Hash) -> ChainResult<Vec<u8>> {
    abi::encode_call(STORE, &[slot(key), slot(value)])
}

/// Calldata for the mock `load`.
pub fn encode_load(key: &Hash) -> ChainResult<Vec<u8>> {
    abi::encode_call(LOAD, &[slot(key)])
}

/// Calldata for the mock `fail`.
pub fn encode_fail() -> ChainResult<Vec<u8>> {
    abi::encode_call(FAIL, &[])
}

#[cfg(test)]
mod tests {
    use super::*;
    use halcyon_primitives::ZERO_HASH;
    use std::collections::HashMap;

    struct Slots(HashMap<(Address, Hash), Hash>);

    impl StorageView for Slots {
        fn storage_get(&self, contract: &Address, key: &Hash) -> Hash {
            self.0.get(&(*contract, *key)).copied().unwrap_or(ZERO_HASH)
        }
    }

    fn call(data: Vec<u8>) -> CallContext {
        CallContext {
            caller: [1; 20],
            to: [2; 20],
            value: U256::zero(),
            gas_limit: 100_000,
            data,
            code: vec![0x60],
            block_height: 1,
            timestamp: 0,
            is_create: false,
            is_static: false,
        }
    }

    #[test]
    fn test_store_emits_diff_and_event() {
        let outcome = MockEngine.execute(&call(encode_store(&[7; 32], &[9; 32]).unwrap()), &Slots(HashMap::new()));
        assert!(outcome.success);
        assert_eq!(outcome.storage_diffs, vec![StorageDiff { key: [7; 32], value: [9; 32] }]);
        assert_eq!(outcome.events[0].topics, vec![keccak256(STORED_EVENT.as_bytes()), [7; 32]]);
        assert_eq!(outcome.gas_used, G_SSTORE + G_EVENT);
    }

    #[test]
    fn test_load_reads_view() {
        let mut slots = HashMap::new();
        slots.insert(([2; 20], [7; 32]), [5; 32]);
        let outcome = MockEngine.execute(&call(encode_load(&[7; 32]).unwrap()), &Slots(slots));
        assert!(outcome.success);
        assert_eq!(outcome.return_data, vec![5; 32]);
    }

    #[test]
    fn test_static_store_and_out_of_gas_revert() {
        let mut ctx = call(encode_store(&[1; 32], &[1; 32]).unwrap());
        ctx.is_static = true;
        let outcome = MockEngine.execute(&ctx, &Slots(HashMap::new()));
        assert!(!outcome.success);
        assert!(outcome.storage_diffs.is_empty());
        assert!(String::from_utf8_lossy(&outcome.return_data).contains("state change in static call"));

        let mut ctx = call(encode_store(&[1; 32], &[1; 32]).unwrap());
        ctx.gas_limit = G_SSTORE - 1;
        let outcome = MockEngine.execute(&ctx, &Slots(HashMap::new()));
        assert!(!outcome.success);
        assert!(String::from_utf8_lossy(&outcome.return_data).contains("out of gas"));
    }

    #[test]
    fn test_store_calldata_layout() {
        let data = encode_store(&[7; 32], &[9; 32]).unwrap();
        assert_eq!(data.len(), 4 + 64);
        assert_eq!(&data[..4], &abi::selector(STORE).unwrap());
        assert_eq!(&data[4..36], &[7; 32]);
        assert_eq!(&data[36..], &[9; 32]);
    }

    #[test]
    fn test_fail_reverts_and_unknown_selector_reverts() {
        let outcome = MockEngine.execute(&call(encode_fail().unwrap()), &Slots(HashMap::new()));
        assert!(!outcome.success);
        assert!(String::from_utf8_lossy(&outcome.return_data).contains("fail() called"));

        let outcome = MockEngine.execute(&call(vec![0xde, 0xad, 0xbe, 0xef]), &Slots(HashMap::new()));
        assert!(!outcome.success);
        assert!(String::from_utf8_lossy(&outcome.return_data).contains("unknown selector"));
    }

    #[test]
    fn test_create_returns_code() {
        let mut ctx = call(vec![0xde, 0xad]);
        ctx.is_create = true;
        ctx.code.clear();
        let outcome = MockEngine.execute(&ctx, &Slots(HashMap::new()));
        assert!(outcome.success);
        assert_eq!(outcome.return_data, vec![0xde, 0xad]);
        assert_eq!(outcome.gas_used, 2 * G_CODE_BYTE);
    }
}
