//! Error type for the state machine.

use halcyon_primitives::{ArithmeticFault, ChainError};

use crate::contracts::ContractTag;
use crate::status::BlockValidationStatus;

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error(transparent)]
    Chain(#[from] ChainError),

    /// The key-value store failed to read or write.
    #[error("storage error: {0}")]
    Storage(String),

    /// Persisted data has the wrong size or shape. Startup must halt.
    #[error("fatal: {0}")]
    Fatal(String),

    /// Contract execution failed; the transaction's effects are unwound.
    #[error("execution reverted: {0}")]
    Reverted(String),

    #[error("wrong contract kind: expected {expected}, found {found}")]
    WrongContractKind {
        expected: ContractTag,
        found: ContractTag,
    },

    #[error("block rejected: {0:?}")]
    BlockRejected(BlockValidationStatus),
}

impl From<ArithmeticFault> for StateError {
    fn from(fault: ArithmeticFault) -> Self {
        Self::Chain(ChainError::Arithmetic(fault))
    }
}

pub type StateResult<T> = Result<T, StateError>;
