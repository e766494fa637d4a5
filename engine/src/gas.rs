//! Gas accounting for contract execution.
//!
//! Transactions pay their intrinsic cost (see
//! [`intrinsic_gas`](halcyon_primitives::tx::intrinsic_gas)) before
//! dispatch. What remains of the gas limit is metered here while the call
//! runs.

use crate::error::{StateError, StateResult};

// ── Gas cost constants ──

/// Flat cost of a call into a native contract.
pub const G_NATIVE_CALL: u64 = 2_000;

/// Deploying a native contract through the contract manager.
pub const G_NATIVE_DEPLOY: u64 = 50_000;

/// Storage slot read.
pub const G_SLOAD: u64 = 800;

/// Storage slot write.
pub const G_SSTORE: u64 = 5_000;

/// Emitting one event.
pub const G_EVENT: u64 = 375;

/// Per byte of deployed code.
pub const G_CODE_BYTE: u64 = 200;

/// Tracks gas consumed by one call.
#[derive(Debug, Clone)]
pub struct GasMeter {
    limit: u64,
    consumed: u64,
}

impl GasMeter {
    pub fn new(limit: u64) -> Self {
        Self { limit, consumed: 0 }
    }

    /// Consume gas. On error the meter is left unchanged.
    pub fn consume(&mut self, amount: u64) -> StateResult<()> {
        match self.consumed.checked_add(amount) {
            Some(total) if total <= self.limit => {
                self.consumed = total;
                Ok(())
            }
            _ => Err(StateError::Reverted(format!(
                "out of gas: limit {}, needed {}",
                self.limit,
                self.consumed.saturating_add(amount)
            ))),
        }
    }

    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    pub fn remaining(&self) -> u64 {
        self.limit - self.consumed
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }
}
