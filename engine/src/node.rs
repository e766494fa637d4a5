//! A full node: state machine, chain tip, persistence and P2P.
//!
//! [`Node`] implements [`NodeServices`] so the P2P [`Manager`] can answer
//! peers from the node's mempools and hand it gossip. Incoming blocks go
//! through the [`ChainTip`] into the state machine; only accepted items
//! are relayed.

use std::sync::Arc;

use halcyon_p2p::{Inbox, Manager, NodeInfo, NodeServices, Transport};
use halcyon_primitives::types::{timestamp_micros, to_hex};
use halcyon_primitives::{
    ChainError, ChainId, DecodeOptions, FinalizedBlock, SigningKey, Synced, Transaction,
    ValidatorTx,
};

use crate::chain_tip::ChainTip;
use crate::config::NodeConfig;
use crate::dump_worker::DumpWorker;
use crate::error::{StateError, StateResult};
use crate::state::State;
use crate::status::{BlockValidationStatus, TxStatus};
use crate::storage::KvStore;
use crate::vm::ExecutionEngine;

pub struct Node {
    config: NodeConfig,
    state: Arc<State>,
    chain_tip: ChainTip,
    dump_worker: DumpWorker,
    manager: Synced<Option<Arc<Manager>>>,
}

impl Node {
    /// Open state over `store` (loading or creating genesis).
    pub fn new(
        config: NodeConfig,
        store: Arc<dyn KvStore>,
        engine: Arc<dyn ExecutionEngine>,
    ) -> StateResult<Arc<Self>> {
        let state = Arc::new(State::open(&config, store, engine)?);
        let dump_worker = DumpWorker::new(Arc::clone(&state), config.dump_interval());
        Ok(Arc::new(Self {
            config,
            state,
            chain_tip: ChainTip::new(),
            dump_worker,
            manager: Synced::new(None),
        }))
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn state(&self) -> &Arc<State> {
        &self.state
    }

    pub fn chain_tip(&self) -> &ChainTip {
        &self.chain_tip
    }

    pub fn manager(&self) -> Option<Arc<Manager>> {
        self.manager.read().clone()
    }

    /// Attach to a transport and start the P2P manager. Must be called
    /// from within a tokio runtime.
    pub fn connect_p2p(self: &Arc<Self>, transport: Arc<dyn Transport>, inbox: Inbox) -> Arc<Manager> {
        let services: Arc<dyn NodeServices> = self.clone();
        let manager = Manager::new(self.config.p2p.clone(), transport, services);
        manager.start(inbox);
        *self.manager.write() = Some(Arc::clone(&manager));
        manager
    }

    pub fn start_dump_worker(&self) {
        self.dump_worker.start();
    }

    /// Admit a transaction submitted locally and gossip it if new.
    pub fn submit_tx(&self, tx: Transaction) -> TxStatus {
        let status = self.state.add_tx(tx.clone());
        if status == TxStatus::ValidNew {
            if let Some(manager) = self.manager() {
                manager.broadcast_tx(&tx);
            }
        }
        status
    }

    pub fn submit_validator_tx(&self, tx: ValidatorTx) -> TxStatus {
        let status = self.state.add_validator_tx(tx.clone());
        if status == TxStatus::ValidNew {
            if let Some(manager) = self.manager() {
                manager.broadcast_validator_tx(&tx);
            }
        }
        status
    }

    /// Consider a candidate block and accept it if valid.
    pub fn receive_block(&self, block: FinalizedBlock) -> BlockValidationStatus {
        let hash = *block.hash();
        if !self.chain_tip.process_block(Arc::new(block)) {
            tracing::debug!(hash = %to_hex(&hash), "Ignoring known block");
            return BlockValidationStatus::Erroneous;
        }
        match self.chain_tip.accept(&hash, &self.state) {
            Ok(status) => status,
            Err(e) => {
                tracing::warn!(hash = %to_hex(&hash), error = %e, "Could not accept block");
                BlockValidationStatus::Erroneous
            }
        }
    }

    /// Build, sign and accept the next block, then gossip it.
    ///
    /// `key` must belong to the current proposer.
    pub fn produce_block(&self, key: &SigningKey, timestamp: u64) -> StateResult<Arc<FinalizedBlock>> {
        let block = self.state.build_next_block(key, timestamp)?;
        let status = self.receive_block(block);
        if status != BlockValidationStatus::Valid {
            return Err(StateError::BlockRejected(status));
        }
        let accepted = self
            .state
            .latest_block()
            .ok_or_else(|| ChainError::NotFound("latest block".into()))?;
        if let Some(manager) = self.manager() {
            manager.broadcast_block(&accepted);
        }
        Ok(accepted)
    }

    /// Stop background work, detach from the network and save state.
    pub async fn stop(&self) {
        self.dump_worker.stop();
        let manager = self.manager.write().take();
        if let Some(manager) = manager {
            manager.stop().await;
        }
        if let Err(e) = self.state.save_to_store() {
            tracing::error!(error = %e, "Final state dump failed");
        }
    }
}

impl NodeServices for Node {
    fn chain_id(&self) -> ChainId {
        self.state.chain_id()
    }

    fn node_info(&self) -> NodeInfo {
        let latest = self.state.latest_block();
        NodeInfo {
            version: self.config.node_version,
            node_timestamp: timestamp_micros(),
            latest_height: latest.as_ref().map(|b| b.height()).unwrap_or_default(),
            latest_hash: latest.map(|b| *b.hash()).unwrap_or_default(),
            ..NodeInfo::default()
        }
    }

    fn validator_mempool(&self) -> Vec<ValidatorTx> {
        self.state.get_validator_mempool()
    }

    fn mempool(&self) -> Vec<Transaction> {
        self.state.get_mempool()
    }

    fn on_validator_tx(&self, tx: ValidatorTx) -> bool {
        self.state.add_validator_tx(tx) == TxStatus::ValidNew
    }

    fn on_tx(&self, tx: Transaction) -> bool {
        self.state.add_tx(tx) == TxStatus::ValidNew
    }

    fn on_block(&self, block: FinalizedBlock) -> bool {
        self.receive_block(block) == BlockValidationStatus::Valid
    }

    fn decode_options(&self) -> DecodeOptions {
        self.config.decode
    }
}
