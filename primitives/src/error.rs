//! Error types shared across Halcyon crates.
//!
//! `ChainError` covers every recoverable failure that can arise while
//! decoding, validating or applying chain data. None of these conditions
//! are fatal to the process; callers reject the offending input and move on.

/// Fault raised by checked 256-bit ledger arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ArithmeticFault {
    #[error("overflow")]
    Overflow,
    #[error("underflow")]
    Underflow,
    #[error("division by zero")]
    DivisionByZero,
}

/// Primary error type for chain data handling.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChainError {
    /// Undersized buffer, bad hex, or otherwise unparsable input.
    #[error("malformed input: {0}")]
    MalformedInput(String),

    /// A read would end past the available data.
    #[error("data too short: need {needed} bytes at offset {offset}, have {available}")]
    DataTooShort {
        offset: usize,
        needed: usize,
        available: usize,
    },

    /// Argument codec type mismatch or malformed function header.
    #[error("codec error: {0}")]
    Codec(String),

    /// Signature could not be produced, parsed or recovered.
    #[error("signature error: {0}")]
    Signature(String),

    /// Bad nonce, insufficient balance, wrong chain id.
    #[error("invalid transaction: {0}")]
    InvalidTransaction(String),

    /// Wrong height, validator-transaction mismatch, bad Merkle root.
    #[error("invalid block: {0}")]
    InvalidBlock(String),

    #[error("arithmetic fault: {0}")]
    Arithmetic(#[from] ArithmeticFault),

    /// Unknown address, block hash or transaction hash.
    #[error("not found: {0}")]
    NotFound(String),
}

impl ChainError {
    /// True for errors that mean the input bytes themselves were unusable.
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            Self::MalformedInput(_) | Self::DataTooShort { .. } | Self::Codec(_)
        )
    }
}

/// Convenience result type for chain data handling.
pub type ChainResult<T> = Result<T, ChainError>;
