//! Shared test helpers for engine integration tests.
//!
//! Provides deterministic keys, named accounts, a four-validator genesis,
//! transaction builders and a helper that runs a full commit-reveal round
//! so tests can produce valid blocks.

#![allow(dead_code)]

use std::sync::Arc;

use halcyon_engine::consensus::ValidatorRound;
use halcyon_engine::{BlockValidationStatus, MemStore, MockEngine, NodeConfig, State, TxStatus};
use halcyon_primitives::crypto::{address_of, key_from_bytes};
use halcyon_primitives::types::to_hex;
use halcyon_primitives::{
    Address, ChainId, DecodeOptions, FinalizedBlock, SigningKey, Transaction,
    UnsignedTransaction, U256,
};

pub const CHAIN_ID: ChainId = 8080;
pub const MIN_VALIDATORS: usize = 3;

/// Route engine logs to the test harness. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

// ── Deterministic Keys ──

/// Secret key `[seed; 32]`.
pub fn deterministic_key(seed: u8) -> SigningKey {
    key_from_bytes(&[seed; 32]).unwrap()
}

pub fn alice() -> (Address, SigningKey) {
    let key = deterministic_key(1);
    (address_of(&key), key)
}

pub fn bob() -> (Address, SigningKey) {
    let key = deterministic_key(2);
    (address_of(&key), key)
}

pub fn charlie() -> (Address, SigningKey) {
    let key = deterministic_key(3);
    (address_of(&key), key)
}

/// The four genesis validators use seeds 10..=13.
pub fn validator_keys() -> Vec<SigningKey> {
    (10..14u8).map(deterministic_key).collect()
}

pub fn validator_key(address: &Address) -> SigningKey {
    validator_keys()
        .into_iter()
        .find(|k| &address_of(k) == address)
        .expect("address is not a genesis validator")
}

// ── Configuration ──

/// Four validators, rounds of three, and `balance` granted to alice.
pub fn test_config(balance: u64) -> NodeConfig {
    let mut config = NodeConfig::default();
    config.chain_id = CHAIN_ID;
    config.min_validators = MIN_VALIDATORS;
    config.validators = validator_keys().iter().map(|k| to_hex(&address_of(k))).collect();
    config
        .genesis
        .balances
        .insert(to_hex(&alice().0), U256::from(balance));
    config.decode = DecodeOptions::serial();
    config
}

pub fn new_state(balance: u64) -> (Arc<MemStore>, State) {
    let store = Arc::new(MemStore::new());
    let state = State::genesis(&test_config(balance), store.clone(), Arc::new(MockEngine::new())).unwrap();
    (store, state)
}

// ── Transactions ──

pub fn tx(
    key: &SigningKey,
    nonce: u64,
    to: Address,
    value: u64,
    data: Vec<u8>,
    gas_limit: u64,
    gas_price: u64,
) -> Transaction {
    UnsignedTransaction {
        chain_id: CHAIN_ID,
        nonce,
        to,
        value: U256::from(value),
        gas_limit,
        gas_price: U256::from(gas_price),
        data,
    }
    .sign(key)
    .unwrap()
}

/// A plain transfer with a zero gas price.
pub fn transfer(key: &SigningKey, nonce: u64, to: Address, value: u64) -> Transaction {
    tx(key, nonce, to, value, vec![], 21_000, 0)
}

// ── Blocks ──

/// Have every participant of the pending round commit and reveal
/// through `state`'s validator mempool.
pub fn run_round(state: &State, salt: u8) {
    let height = state.latest_block().unwrap().height() + 1;
    let rounds: Vec<ValidatorRound> = state
        .participants()
        .iter()
        .enumerate()
        .map(|(i, a)| ValidatorRound::with_seed(validator_key(a), [salt ^ (i as u8 + 1); 32]))
        .collect();
    for round in &rounds {
        assert_eq!(
            state.add_validator_tx(round.commit(height, CHAIN_ID).unwrap()),
            TxStatus::ValidNew
        );
    }
    for round in &rounds {
        assert_eq!(
            state.add_validator_tx(round.reveal(height, CHAIN_ID).unwrap()),
            TxStatus::ValidNew
        );
    }
}

/// A valid next block carrying exactly `txs`, signed by the proposer.
pub fn next_block(state: &State, txs: Vec<Transaction>, salt: u8) -> FinalizedBlock {
    run_round(state, salt);
    let latest = state.latest_block().unwrap();
    let validator_txs = state.get_round_transactions().expect("validator round is incomplete");
    FinalizedBlock::create_new_valid_block(
        txs,
        validator_txs,
        *latest.hash(),
        latest.timestamp() + 1_000_000,
        latest.height() + 1,
        &validator_key(&state.proposer()),
    )
    .unwrap()
}

/// Build and process a block carrying `txs`.
pub fn process(state: &State, txs: Vec<Transaction>, salt: u8) -> BlockValidationStatus {
    let block = next_block(state, txs, salt);
    state.try_process_next_block(block)
}
