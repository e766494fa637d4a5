//! `halcyon-engine` — state machine and consensus for Halcyon nodes.
//!
//! This crate turns accepted blocks into ledger state:
//! `f(state, block) → state'`, gated by rotation consensus.
//!
//! ## Architecture
//!
//! - [`storage::KvStore`] / [`vm::ExecutionEngine`]: collaborator seams,
//!   with [`storage::MemStore`] and [`vm::MockEngine`] for tests
//! - [`consensus::Rotation`]: validator ordering and commit-reveal rounds
//! - [`contracts`]: the closed set of contract kinds and native contracts
//! - [`state::State`]: mempool, ledger, transaction application, block
//!   acceptance and the event log
//! - [`chain_tip::ChainTip`]: candidate blocks awaiting a decision
//! - [`node::Node`]: everything above wired to the P2P layer

pub mod error;
pub mod status;
pub mod storage;
pub mod gas;
pub mod vm;
pub mod ledger;
pub mod overlay;
pub mod contracts;
pub mod events;
pub mod consensus;
pub mod chain_store;
pub mod config;
pub mod state;
pub mod chain_tip;
pub mod dump_worker;
pub mod node;

// Re-export key types for convenience
pub use chain_tip::{BlockStatus, ChainTip};
pub use config::{GenesisConfig, NodeConfig};
pub use consensus::{Rotation, ValidatorRound};
pub use contracts::{ContractKind, ContractTag};
pub use error::{StateError, StateResult};
pub use events::Event;
pub use node::Node;
pub use state::{CallRequest, State};
pub use status::{BlockValidationStatus, TxStatus};
pub use storage::{KvStore, MemStore, WriteBatch};
pub use vm::{ExecutionEngine, MockEngine};
