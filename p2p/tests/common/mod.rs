//! Shared test helpers for P2P integration tests.
//!
//! Provides deterministic keys, a recording `NodeServices` implementation
//! and a helper that wires managers onto a loopback network.

#![allow(dead_code)]

use std::sync::Arc;

use halcyon_p2p::{
    LoopbackNetwork, Manager, NodeId, NodeInfo, NodeServices, NodeType, P2pConfig,
};
use halcyon_primitives::crypto::key_from_bytes;
use halcyon_primitives::types::timestamp_micros;
use halcyon_primitives::{
    ChainId, FinalizedBlock, SigningKey, Synced, Transaction, UnsignedTransaction, ValidatorTx,
    U256,
};

pub const CHAIN_ID: ChainId = 8080;

/// Send manager logs to the test harness.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Deterministic secp256k1 key from a single seed byte.
pub fn deterministic_key(seed: u8) -> SigningKey {
    key_from_bytes(&[seed; 32]).unwrap()
}

pub fn addr(port: u16) -> NodeId {
    NodeId::from(([127, 0, 0, 1], port))
}

pub fn transfer(seed: u8, nonce: u64) -> Transaction {
    UnsignedTransaction {
        chain_id: CHAIN_ID,
        nonce,
        to: [0xbb; 20],
        value: U256::from(1),
        gas_limit: 21_000,
        gas_price: U256::one(),
        data: vec![],
    }
    .sign(&deterministic_key(seed))
    .unwrap()
}

// ── Recording services ──

/// Records everything handed to it and accepts items it has not seen.
#[derive(Default)]
pub struct RecordingServices {
    pub height: u64,
    pub txs: Synced<Vec<Transaction>>,
    pub validator_txs: Synced<Vec<ValidatorTx>>,
    pub blocks: Synced<Vec<FinalizedBlock>>,
}

impl RecordingServices {
    pub fn at_height(height: u64) -> Arc<Self> {
        Arc::new(Self {
            height,
            ..Self::default()
        })
    }
}

impl NodeServices for RecordingServices {
    fn chain_id(&self) -> ChainId {
        CHAIN_ID
    }

    fn node_info(&self) -> NodeInfo {
        NodeInfo {
            version: 1,
            node_timestamp: timestamp_micros(),
            latest_height: self.height,
            ..NodeInfo::default()
        }
    }

    fn validator_mempool(&self) -> Vec<ValidatorTx> {
        self.validator_txs.read().clone()
    }

    fn mempool(&self) -> Vec<Transaction> {
        self.txs.read().clone()
    }

    fn on_validator_tx(&self, tx: ValidatorTx) -> bool {
        let mut txs = self.validator_txs.write();
        if txs.contains(&tx) {
            return false;
        }
        txs.push(tx);
        true
    }

    fn on_tx(&self, tx: Transaction) -> bool {
        let mut txs = self.txs.write();
        if txs.contains(&tx) {
            return false;
        }
        txs.push(tx);
        true
    }

    fn on_block(&self, block: FinalizedBlock) -> bool {
        self.blocks.write().push(block);
        true
    }
}

// ── Network wiring ──

pub struct TestNode {
    pub id: NodeId,
    pub manager: Arc<Manager>,
    pub services: Arc<RecordingServices>,
}

/// Join a started manager to `net`.
pub fn spawn_node(net: &Arc<LoopbackNetwork>, port: u16, height: u64, config: P2pConfig) -> TestNode {
    init_tracing();
    let id = addr(port);
    let (transport, inbox) = net.join(id, NodeType::Normal);
    let services = RecordingServices::at_height(height);
    let manager = Manager::new(config, transport, services.clone());
    manager.start(inbox);
    TestNode {
        id,
        manager,
        services,
    }
}

pub fn fast_config() -> P2pConfig {
    let mut config = P2pConfig::default();
    config.request_timeout_ms = 500;
    config.liveness.tick_ms = 20;
    config.liveness.timeout_ms = 200;
    config
}
