//! Status codes returned by validation APIs.
//!
//! These are answers, not errors: a peer sending an invalid transaction is
//! routine and callers branch on the status.

/// Outcome of validating or admitting a ledger or validator transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxStatus {
    /// Valid and not yet known.
    ValidNew,
    /// Valid and already queued.
    ValidExisting,
    InvalidNonce,
    InvalidBalance,
    InvalidChainId,
    /// Gas limit below the intrinsic cost.
    InvalidGas,
    /// Validator transaction from an address not expected this round.
    InvalidSigner,
    /// Validator transaction for a height other than the pending one.
    InvalidHeight,
    /// Validator payload is not a well-formed commit or reveal, or does not
    /// fit the signer's round so far.
    InvalidPayload,
}

impl TxStatus {
    pub fn is_valid(self) -> bool {
        matches!(self, Self::ValidNew | Self::ValidExisting)
    }
}

/// Outcome of validating the next block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockValidationStatus {
    Valid,
    /// Height is not the current height plus one.
    WrongHeight,
    /// Anything else: bad link, bad round, or an invalid transaction.
    Erroneous,
}
