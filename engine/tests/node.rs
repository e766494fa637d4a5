//! End-to-end node tests over the loopback network.
//!
//! Two nodes share a genesis; everything submitted to one must reach the
//! other through gossip, and blocks produced by one must be accepted by
//! both.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use halcyon_engine::consensus::ValidatorRound;
use halcyon_engine::{BlockStatus, MemStore, MockEngine, Node, TxStatus};
use halcyon_p2p::{LoopbackNetwork, NodeId, NodeServices, NodeType};
use halcyon_primitives::U256;

struct TestNode {
    id: NodeId,
    node: Arc<Node>,
}

fn spawn_node(net: &Arc<LoopbackNetwork>, port: u16) -> TestNode {
    init_tracing();
    let id = NodeId::from(([127, 0, 0, 1], port));
    let node = Node::new(test_config(1_000), Arc::new(MemStore::new()), Arc::new(MockEngine::new())).unwrap();
    let (transport, inbox) = net.join(id, NodeType::Normal);
    node.connect_p2p(transport, inbox);
    TestNode { id, node }
}

async fn wait_until(what: &str, check: impl Fn() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

// ── Test: Gossip ──

#[tokio::test]
async fn test_tx_gossip_reaches_peer_mempool() {
    let net = LoopbackNetwork::new();
    let a = spawn_node(&net, 1);
    let b = spawn_node(&net, 2);
    net.connect(a.id, b.id);

    let (_, a_key) = alice();
    let (bob, _) = bob();
    let tx = transfer(&a_key, 0, bob, 100);
    assert_eq!(a.node.submit_tx(tx.clone()), TxStatus::ValidNew);
    wait_until("peer mempool", || b.node.state().is_tx_in_mempool(tx.hash())).await;

    // Invalid transactions are not gossiped.
    let bad = transfer(&a_key, 0, bob, 5_000);
    assert_eq!(a.node.submit_tx(bad.clone()), TxStatus::InvalidBalance);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!b.node.state().is_tx_in_mempool(bad.hash()));

    a.node.stop().await;
    b.node.stop().await;
}

// ── Test: Block Production ──

#[tokio::test]
async fn test_produced_block_is_accepted_by_peer() {
    let net = LoopbackNetwork::new();
    let a = spawn_node(&net, 1);
    let b = spawn_node(&net, 2);
    net.connect(a.id, b.id);

    let (alice, a_key) = alice();
    let (bob, _) = bob();
    let tx = transfer(&a_key, 0, bob, 400);
    assert_eq!(a.node.submit_tx(tx.clone()), TxStatus::ValidNew);

    let state = a.node.state();
    let rounds: Vec<ValidatorRound> = state
        .participants()
        .iter()
        .enumerate()
        .map(|(i, v)| ValidatorRound::with_seed(validator_key(v), [70 + i as u8; 32]))
        .collect();
    for round in &rounds {
        assert_eq!(a.node.submit_validator_tx(round.commit(1, CHAIN_ID).unwrap()), TxStatus::ValidNew);
    }
    for round in &rounds {
        assert_eq!(a.node.submit_validator_tx(round.reveal(1, CHAIN_ID).unwrap()), TxStatus::ValidNew);
    }
    wait_until("peer validator mempool", || {
        b.node.state().get_validator_mempool_size() == 2 * MIN_VALIDATORS
    })
    .await;

    let proposer = validator_key(&state.proposer());
    let block = a.node.produce_block(&proposer, state.latest_block().unwrap().timestamp() + 1).unwrap();
    assert_eq!(block.txs().len(), 1);
    assert_eq!(a.node.chain_tip().status(block.hash()), BlockStatus::Accepted);

    wait_until("peer block", || b.node.state().height() == 1).await;
    let peer = b.node.state();
    assert_eq!(peer.latest_block().unwrap().hash(), block.hash());
    assert_eq!(peer.get_native_balance(&alice), U256::from(600));
    assert_eq!(peer.get_native_balance(&bob), U256::from(400));
    assert_eq!(peer.get_mempool_size(), 0);
    assert_eq!(peer.get_validator_mempool_size(), 0);
    assert_eq!(peer.get_best_random_seed(), state.get_best_random_seed());
    assert_eq!(b.node.node_info().latest_height, 1);

    a.node.stop().await;
    b.node.stop().await;
}

#[tokio::test]
async fn test_non_proposer_cannot_produce() {
    let net = LoopbackNetwork::new();
    let a = spawn_node(&net, 1);
    run_round(a.node.state(), 3);
    let outsider = validator_key(&a.node.state().participants()[0]);
    assert!(a.node.produce_block(&outsider, 0).is_err());
    assert_eq!(a.node.state().height(), 0);
    a.node.stop().await;
}
