mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::*;
use halcyon_engine::chain_tip::BlockStatus;
use halcyon_engine::contracts::derive_contract_address;
use halcyon_engine::dump_worker::DumpWorker;
use halcyon_engine::storage::{self, prefix};
use halcyon_engine::vm::encode_store;
use halcyon_engine::{
    BlockValidationStatus, ChainTip, KvStore, MemStore, MockEngine, State, StateError,
    StateResult, WriteBatch,
};
use halcyon_primitives::{U256, ZERO_ADDRESS};

/// A store whose batch commits can be made to fail.
#[derive(Default)]
struct FlakyStore {
    inner: MemStore,
    fail_commits: AtomicBool,
}

impl FlakyStore {
    fn set_failing(&self, failing: bool) {
        self.fail_commits.store(failing, Ordering::SeqCst);
    }
}

impl KvStore for FlakyStore {
    fn get(&self, key: &[u8]) -> StateResult<Option<Vec<u8>>> {
        self.inner.get(key)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> StateResult<()> {
        self.inner.put(key, value)
    }

    fn commit(&self, batch: WriteBatch) -> StateResult<()> {
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(StateError::Storage("disk full".into()));
        }
        self.inner.commit(batch)
    }

    fn scan_prefix(&self, prefix: &[u8]) -> StateResult<Vec<(Vec<u8>, Vec<u8>)>> {
        self.inner.scan_prefix(prefix)
    }
}

fn flaky_state(balance: u64) -> (Arc<FlakyStore>, State) {
    let store = Arc::new(FlakyStore::default());
    let state = State::genesis(&test_config(balance), store.clone(), Arc::new(MockEngine::new())).unwrap();
    (store, state)
}

fn reload(store: &Arc<MemStore>, balance: u64) -> Result<State, StateError> {
    State::load(&test_config(balance), store.clone(), Arc::new(MockEngine::new()))
}

// ── Test: Dump and Load ──

#[test]
fn test_dump_and_load_roundtrip() {
    let (store, state) = new_state(1_000);
    let (a, a_key) = alice();
    let (b, _) = bob();

    let create = tx(&a_key, 0, ZERO_ADDRESS, 0, vec![0x01, 0x02], 100_000, 0);
    let txs = vec![create, transfer(&a_key, 1, b, 250)];
    assert_eq!(process(&state, txs, 1), BlockValidationStatus::Valid);
    let contract = derive_contract_address(&a, 0);
    let store_tx = tx(&a_key, 2, contract, 0, encode_store(&[3; 32], &[4; 32]).unwrap(), 100_000, 0);
    assert_eq!(process(&state, vec![store_tx.clone()], 2), BlockValidationStatus::Valid);
    state.save_to_store().unwrap();

    let loaded = reload(&store, 1_000).unwrap();
    assert_eq!(loaded.height(), 2);
    assert_eq!(loaded.get_native_balance(&a), U256::from(750));
    assert_eq!(loaded.get_native_balance(&b), U256::from(250));
    assert_eq!(loaded.get_native_nonce(&a), 3);
    assert_eq!(loaded.get_best_random_seed(), state.get_best_random_seed());
    assert_eq!(loaded.get_random_list(), state.get_random_list());
    assert_eq!(loaded.get_contract_code(&contract), Some(vec![0x01, 0x02]));
    assert_eq!(loaded.get_native_contracts(), state.get_native_contracts());
    assert_eq!(
        loaded.get_events_for_tx(store_tx.hash()),
        state.get_events_for_tx(store_tx.hash())
    );
    assert_eq!(
        loaded.latest_block().unwrap().hash(),
        state.latest_block().unwrap().hash()
    );
}

#[test]
fn test_load_replays_blocks_after_last_dump() {
    let (store, state) = new_state(1_000);
    let (a, a_key) = alice();
    let (b, _) = bob();

    assert_eq!(process(&state, vec![transfer(&a_key, 0, b, 100)], 1), BlockValidationStatus::Valid);
    state.save_to_store().unwrap();
    // Accepted but never dumped.
    assert_eq!(process(&state, vec![transfer(&a_key, 1, b, 100)], 2), BlockValidationStatus::Valid);

    let loaded = reload(&store, 1_000).unwrap();
    assert_eq!(loaded.height(), 2);
    assert_eq!(loaded.get_native_balance(&a), U256::from(800));
    assert_eq!(loaded.get_native_balance(&b), U256::from(200));
    assert_eq!(loaded.get_best_random_seed(), state.get_best_random_seed());

    // The reloaded state keeps extending the chain.
    assert_eq!(process(&loaded, vec![transfer(&a_key, 2, b, 1)], 3), BlockValidationStatus::Valid);
    assert_eq!(loaded.height(), 3);
}

#[test]
fn test_open_resumes_existing_chain() {
    let (store, state) = new_state(1_000);
    assert_eq!(process(&state, vec![], 1), BlockValidationStatus::Valid);
    let opened = State::open(&test_config(1_000), store.clone(), Arc::new(MockEngine::new())).unwrap();
    assert_eq!(opened.height(), 1);

    let fresh = State::open(&test_config(1_000), Arc::new(MemStore::new()), Arc::new(MockEngine::new())).unwrap();
    assert_eq!(fresh.height(), 0);
    assert_eq!(fresh.latest_block().unwrap().hash(), state.chain().block_by_height(0).unwrap().unwrap().hash());
}

// ── Test: Failed Block Writes ──

#[test]
fn test_failed_block_write_leaves_state_untouched() {
    let (store, state) = flaky_state(1_000);
    let (a, a_key) = alice();
    let (b, _) = bob();
    let block = next_block(&state, vec![transfer(&a_key, 0, b, 400)], 1);

    store.set_failing(true);
    assert!(matches!(
        state.process_next_block(block.clone()),
        Err(StateError::Storage(_))
    ));
    assert_eq!(state.try_process_next_block(block.clone()), BlockValidationStatus::Erroneous);
    assert_eq!(state.height(), 0);
    assert_eq!(state.latest_block().unwrap().height(), 0);
    assert_eq!(state.get_native_balance(&a), U256::from(1_000));
    assert_eq!(state.get_native_balance(&b), U256::zero());
    assert_eq!(state.get_native_nonce(&a), 0);
    // The pending round is still open.
    assert_eq!(state.get_validator_mempool_size(), 2 * MIN_VALIDATORS);

    store.set_failing(false);
    assert_eq!(state.try_process_next_block(block), BlockValidationStatus::Valid);
    assert_eq!(state.height(), 1);
    assert_eq!(state.latest_block().unwrap().height(), 1);
    assert_eq!(state.get_native_balance(&a), U256::from(600));
    assert_eq!(state.get_native_balance(&b), U256::from(400));
}

#[test]
fn test_chain_tip_forgets_block_it_could_not_write() {
    let (store, state) = flaky_state(1_000);
    let tip = ChainTip::new();
    let block = Arc::new(next_block(&state, vec![], 1));
    let hash = *block.hash();

    store.set_failing(true);
    assert!(tip.process_block(Arc::clone(&block)));
    assert!(matches!(tip.accept(&hash, &state), Err(StateError::Storage(_))));
    assert_eq!(tip.status(&hash), BlockStatus::Unknown);
    assert_eq!(tip.preference(), None);

    store.set_failing(false);
    assert!(tip.process_block(block));
    assert_eq!(tip.accept(&hash, &state).unwrap(), BlockValidationStatus::Valid);
    assert_eq!(tip.status(&hash), BlockStatus::Accepted);
    assert_eq!(state.height(), 1);
}

// ── Test: Damaged Stores ──

#[test]
fn test_missing_seed_is_fatal() {
    let (store, _state) = new_state(1_000);
    store.remove(&storage::key(prefix::META, b"seed"));
    assert!(matches!(reload(&store, 1_000), Err(StateError::Fatal(_))));
}

#[test]
fn test_truncated_account_is_fatal() {
    let (store, _state) = new_state(1_000);
    let (a, _) = alice();
    store.put(&storage::key(prefix::ACCOUNTS, &a), &[1, 2, 3]).unwrap();
    assert!(matches!(reload(&store, 1_000), Err(StateError::Fatal(_))));
}

#[test]
fn test_dump_ahead_of_chain_is_fatal() {
    let (store, _state) = new_state(1_000);
    store
        .put(&storage::key(prefix::META, b"state_height"), &7u64.to_be_bytes())
        .unwrap();
    assert!(matches!(reload(&store, 1_000), Err(StateError::Fatal(_))));
}

// ── Test: Dump Worker ──

#[test]
fn test_dump_worker_persists_periodically() {
    let (store, state) = new_state(1_000);
    let state = Arc::new(state);
    let worker = DumpWorker::new(Arc::clone(&state), Duration::from_millis(10));
    worker.start();
    assert!(worker.is_running());

    assert_eq!(process(&state, vec![], 1), BlockValidationStatus::Valid);
    std::thread::sleep(Duration::from_millis(150));
    worker.stop();
    assert!(!worker.is_running());

    let dumped = store
        .get(&storage::key(prefix::META, b"state_height"))
        .unwrap()
        .unwrap();
    assert_eq!(dumped, 1u64.to_be_bytes().to_vec());
}

// ── Test: Chain Tip ──

#[test]
fn test_chain_tip_accepts_valid_block() {
    let (_, state) = new_state(1_000);
    let tip = ChainTip::new();
    let block = Arc::new(next_block(&state, vec![], 1));
    let hash = *block.hash();

    assert!(tip.process_block(Arc::clone(&block)));
    assert!(tip.is_processing(&hash));
    assert_eq!(tip.accept(&hash, &state).unwrap(), BlockValidationStatus::Valid);
    assert_eq!(tip.status(&hash), BlockStatus::Accepted);
    assert_eq!(tip.preference(), Some(hash));
    assert!(!tip.exists(&hash));
    assert_eq!(state.height(), 1);
    // Our handle is untouched.
    assert_eq!(block.height(), 1);
}

#[test]
fn test_chain_tip_records_rejection() {
    let (_, state) = new_state(1_000);
    let (_, a_key) = alice();
    let (b, _) = bob();
    let tip = ChainTip::new();
    let block = Arc::new(next_block(&state, vec![transfer(&a_key, 0, b, 5_000)], 1));
    let hash = *block.hash();

    tip.process_block(block);
    assert_eq!(tip.accept(&hash, &state).unwrap(), BlockValidationStatus::Erroneous);
    assert_eq!(tip.status(&hash), BlockStatus::Rejected);
    assert_eq!(tip.preference(), None);
    assert!(tip.accept(&hash, &state).is_err());
}
