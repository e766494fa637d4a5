//! The state machine.
//!
//! [`State`] owns the ledger, both mempools (ledger transactions here,
//! validator transactions in the [`Rotation`]), the event log and the
//! chain store. All mutable state sits behind one [`Synced`] lock:
//! queries take it shared, block processing and mempool changes take it
//! exclusively.
//!
//! ## Applying a transaction
//!
//! 1. The sender's nonce is bumped and `gas_limit * gas_price` is debited.
//!    These stand even if the call fails. Fees are burned.
//! 2. The value transfer and the call run in a [`LedgerOverlay`]. Calls
//!    reach a native contract, the execution engine, or (for plain
//!    accounts) nothing at all.
//! 3. On success the overlay's writes and events are committed; on any
//!    failure the overlay is dropped, unwinding that transaction alone.
//!
//! Unused gas is not refunded.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use halcyon_primitives::tx::intrinsic_gas;
use halcyon_primitives::types::to_hex;
use halcyon_primitives::{
    Address, BlockHeight, ChainError, ChainId, FinalizedBlock, Hash, SigningKey, Synced,
    Transaction, ValidatorTx, U256, ZERO_ADDRESS,
};

use crate::chain_store::{ChainStore, TxLocation};
use crate::config::NodeConfig;
use crate::consensus::{Rotation, RDPOS_ADDRESS};
use crate::contracts::{
    derive_contract_address, CallOutput, ContractKind, ContractManager, ContractTag, EvmContract,
    NativeCall, CONTRACT_MANAGER_ADDRESS,
};
use crate::error::{StateError, StateResult};
use crate::events::{Event, EventCoordinates, EventLog};
use crate::gas::{GasMeter, G_EVENT, G_NATIVE_CALL, G_NATIVE_DEPLOY};
use crate::ledger::{fixed, Account, Ledger};
use crate::overlay::LedgerOverlay;
use crate::status::{BlockValidationStatus, TxStatus};
use crate::storage::{self, prefix, KvStore, WriteBatch};
use crate::vm::{CallContext, EmittedEvent, ExecutionEngine};

const SEED_KEY: &[u8] = b"seed";
const STATE_HEIGHT_KEY: &[u8] = b"state_height";

/// Amount credited by [`State::add_balance`]: 1000 coins of 18 decimals.
pub fn faucet_amount() -> U256 {
    U256::from(1_000u64) * U256::exp10(18)
}

/// A simulated call for [`State::eth_call`] and [`State::estimate_gas`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRequest {
    pub from: Address,
    pub to: Address,
    pub value: U256,
    pub gas_limit: u64,
    pub data: Vec<u8>,
}

impl Default for CallRequest {
    fn default() -> Self {
        Self {
            from: ZERO_ADDRESS,
            to: ZERO_ADDRESS,
            value: U256::zero(),
            gas_limit: 10_000_000,
            data: Vec::new(),
        }
    }
}

/// One call as dispatched against an overlay.
struct Dispatch<'a> {
    caller: Address,
    to: Address,
    value: U256,
    data: &'a [u8],
    /// Gas left for the call itself.
    gas: u64,
    nonce: u64,
    tx_hash: Option<Hash>,
    height: BlockHeight,
    timestamp: u64,
    is_static: bool,
}

struct Inner {
    ledger: Ledger,
    mempool: BTreeMap<Hash, Transaction>,
    rotation: Rotation,
    events: EventLog,
    /// Height of the last block applied to the ledger.
    height: BlockHeight,
}

pub struct State {
    chain_id: ChainId,
    inner: Synced<Inner>,
    chain: ChainStore,
    engine: Arc<dyn ExecutionEngine>,
    store: Arc<dyn KvStore>,
}

impl State {
    /// Load from `store` if it holds a chain, else start from genesis.
    pub fn open(
        config: &NodeConfig,
        store: Arc<dyn KvStore>,
        engine: Arc<dyn ExecutionEngine>,
    ) -> StateResult<Self> {
        let chain = ChainStore::open(store.clone(), config.chain_id, config.decode)?;
        if chain.latest().is_some() {
            Self::load_from(config, chain, store, engine)
        } else {
            Self::genesis_into(config, chain, store, engine)
        }
    }

    /// Start a fresh chain from the configured genesis.
    pub fn genesis(
        config: &NodeConfig,
        store: Arc<dyn KvStore>,
        engine: Arc<dyn ExecutionEngine>,
    ) -> StateResult<Self> {
        let chain = ChainStore::open(store.clone(), config.chain_id, config.decode)?;
        Self::genesis_into(config, chain, store, engine)
    }

    /// Rebuild state from a store. Any size or shape mismatch in the
    /// persisted data is [`StateError::Fatal`].
    pub fn load(
        config: &NodeConfig,
        store: Arc<dyn KvStore>,
        engine: Arc<dyn ExecutionEngine>,
    ) -> StateResult<Self> {
        let chain = ChainStore::open(store.clone(), config.chain_id, config.decode)?;
        Self::load_from(config, chain, store, engine)
    }

    fn genesis_into(
        config: &NodeConfig,
        chain: ChainStore,
        store: Arc<dyn KvStore>,
        engine: Arc<dyn ExecutionEngine>,
    ) -> StateResult<Self> {
        let genesis = FinalizedBlock::create_new_valid_block(
            Vec::new(),
            Vec::new(),
            config.genesis.prev_hash()?,
            config.genesis.timestamp,
            0,
            &config.genesis.signer()?,
        )?;

        let mut ledger = Ledger::new();
        for (address, balance) in config.genesis.balances()? {
            ledger.set_account(address, Account::with_balance(balance));
        }
        ledger.insert_contract(
            CONTRACT_MANAGER_ADDRESS,
            ContractKind::ContractManager(ContractManager::default()),
        );
        let rotation = Rotation::new(
            config.chain_id,
            config.validator_addresses()?,
            config.min_validators,
            *genesis.block_randomness(),
            1,
        )?;

        tracing::info!(
            chain_id = config.chain_id,
            hash = %to_hex(genesis.hash()),
            "Created genesis block"
        );
        chain.put_block(Arc::new(genesis))?;
        let state = Self {
            chain_id: config.chain_id,
            inner: Synced::new(Inner {
                ledger,
                mempool: BTreeMap::new(),
                rotation,
                events: EventLog::new(),
                height: 0,
            }),
            chain,
            engine,
            store,
        };
        state.save_to_store()?;
        Ok(state)
    }

    fn load_from(
        config: &NodeConfig,
        chain: ChainStore,
        store: Arc<dyn KvStore>,
        engine: Arc<dyn ExecutionEngine>,
    ) -> StateResult<Self> {
        let latest = chain
            .latest()
            .ok_or_else(|| StateError::Fatal("store holds no chain".into()))?;
        let meta = |key: &[u8]| -> StateResult<Vec<u8>> {
            store
                .get(&storage::key(prefix::META, key))?
                .ok_or_else(|| {
                    StateError::Fatal(format!("missing {} record", String::from_utf8_lossy(key)))
                })
        };
        let seed = fixed::<32>(&meta(SEED_KEY)?, "random seed")?;
        let state_height = u64::from_be_bytes(fixed::<8>(&meta(STATE_HEIGHT_KEY)?, "state height")?);
        if state_height > latest.height() {
            return Err(StateError::Fatal(format!(
                "state dump at height {} is ahead of the chain at {}",
                state_height,
                latest.height()
            )));
        }

        let rotation = Rotation::new(
            config.chain_id,
            config.validator_addresses()?,
            config.min_validators,
            seed,
            state_height + 1,
        )?;
        let state = Self {
            chain_id: config.chain_id,
            inner: Synced::new(Inner {
                ledger: Ledger::load(&*store)?,
                mempool: BTreeMap::new(),
                rotation,
                events: EventLog::load(&*store)?,
                height: state_height,
            }),
            chain,
            engine,
            store,
        };

        // Blocks accepted after the last dump are replayed.
        for height in state_height + 1..=latest.height() {
            let block = state
                .chain
                .block_by_height(height)?
                .ok_or_else(|| StateError::Fatal(format!("block {} is missing", height)))?;
            let mut inner = state.inner.write();
            state.apply_block(&mut inner, &block);
        }
        tracing::info!(
            height = latest.height(),
            replayed = latest.height() - state_height,
            "Loaded state"
        );
        Ok(state)
    }

    pub fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    pub fn chain(&self) -> &ChainStore {
        &self.chain
    }

    pub fn latest_block(&self) -> Option<Arc<FinalizedBlock>> {
        self.chain.latest()
    }

    pub fn height(&self) -> BlockHeight {
        self.inner.read().height
    }

    // ── Transactions ──

    /// Check `tx` against current state without changing anything.
    pub fn validate_transaction(&self, tx: &Transaction) -> TxStatus {
        let inner = self.inner.read();
        let status = check_tx(self.chain_id, &LedgerOverlay::new(&inner.ledger), tx);
        if status.is_valid() && inner.mempool.contains_key(tx.hash()) {
            return TxStatus::ValidExisting;
        }
        status
    }

    /// Validate and queue `tx`.
    pub fn add_tx(&self, tx: Transaction) -> TxStatus {
        let mut inner = self.inner.write();
        let status = check_tx(self.chain_id, &LedgerOverlay::new(&inner.ledger), &tx);
        if !status.is_valid() {
            tracing::debug!(tx = %to_hex(tx.hash()), ?status, "Rejected transaction");
            return status;
        }
        if inner.mempool.contains_key(tx.hash()) {
            return TxStatus::ValidExisting;
        }
        tracing::debug!(tx = %to_hex(tx.hash()), from = %to_hex(tx.from()), "Queued transaction");
        inner.mempool.insert(*tx.hash(), tx);
        TxStatus::ValidNew
    }

    pub fn add_validator_tx(&self, tx: ValidatorTx) -> TxStatus {
        self.inner.write().rotation.add_validator_tx(tx)
    }

    pub fn get_mempool(&self) -> Vec<Transaction> {
        self.inner.read().mempool.values().cloned().collect()
    }

    pub fn get_mempool_size(&self) -> usize {
        self.inner.read().mempool.len()
    }

    pub fn is_tx_in_mempool(&self, tx_hash: &Hash) -> bool {
        self.inner.read().mempool.contains_key(tx_hash)
    }

    pub fn get_tx_from_mempool(&self, tx_hash: &Hash) -> Option<Transaction> {
        self.inner.read().mempool.get(tx_hash).cloned()
    }

    /// An accepted transaction and where it landed.
    pub fn get_tx(&self, tx_hash: &Hash) -> StateResult<Option<TxLocation>> {
        self.chain.tx_by_hash(tx_hash)
    }

    // ── Blocks ──

    /// Check that `block` can extend the chain. Nothing is changed.
    pub fn validate_next_block(&self, block: &FinalizedBlock) -> BlockValidationStatus {
        let inner = self.inner.read();
        self.validate_locked(&inner, block)
    }

    /// Validate and apply `block`, failing with
    /// [`StateError::BlockRejected`] if it is not valid.
    pub fn process_next_block(&self, block: FinalizedBlock) -> StateResult<()> {
        match self.accept_next_block(block)? {
            BlockValidationStatus::Valid => Ok(()),
            status => Err(StateError::BlockRejected(status)),
        }
    }

    /// Validate and apply `block`, returning the validation status. A
    /// block that could not be persisted reports [`BlockValidationStatus::Erroneous`]
    /// and leaves state untouched.
    pub fn try_process_next_block(&self, block: FinalizedBlock) -> BlockValidationStatus {
        let (height, hash) = (block.height(), to_hex(block.hash()));
        self.accept_next_block(block).unwrap_or_else(|e| {
            tracing::error!(height, %hash, error = %e, "Failed to persist valid block");
            BlockValidationStatus::Erroneous
        })
    }

    /// Validate `block`, persist it, then apply it.
    ///
    /// Invalid blocks come back as a status. A failure to write the block
    /// is an error, and the ledger is left as it was.
    pub fn accept_next_block(&self, block: FinalizedBlock) -> StateResult<BlockValidationStatus> {
        let mut inner = self.inner.write();
        let status = self.validate_locked(&inner, &block);
        if status != BlockValidationStatus::Valid {
            tracing::warn!(
                height = block.height(),
                hash = %to_hex(block.hash()),
                ?status,
                "Rejected block"
            );
            return Ok(status);
        }

        let block = Arc::new(block);
        self.chain.put_block(Arc::clone(&block))?;
        self.apply_block(&mut inner, &block);
        tracing::info!(
            height = block.height(),
            hash = %to_hex(block.hash()),
            txs = block.txs().len(),
            "Accepted block"
        );
        Ok(BlockValidationStatus::Valid)
    }

    fn validate_locked(&self, inner: &Inner, block: &FinalizedBlock) -> BlockValidationStatus {
        let Some(latest) = self.chain.latest() else {
            return BlockValidationStatus::Erroneous;
        };
        if block.height() != latest.height() + 1 {
            tracing::debug!(
                height = block.height(),
                expected = latest.height() + 1,
                "Block at wrong height"
            );
            return BlockValidationStatus::WrongHeight;
        }
        if block.prev_block_hash() != latest.hash() {
            tracing::warn!(height = block.height(), "Block does not extend the latest block");
            return BlockValidationStatus::Erroneous;
        }
        if block.timestamp() < latest.timestamp() {
            tracing::warn!(height = block.height(), "Block timestamp goes backwards");
            return BlockValidationStatus::Erroneous;
        }
        if !inner.rotation.validate_block(block) {
            return BlockValidationStatus::Erroneous;
        }

        // Transactions are checked in order, each against the effects of
        // the ones before it.
        let mut scratch = LedgerOverlay::new(&inner.ledger);
        for tx in block.txs() {
            let status = check_tx(self.chain_id, &scratch, tx);
            if !status.is_valid() || simulate(&mut scratch, tx).is_err() {
                tracing::warn!(
                    height = block.height(),
                    tx = %to_hex(tx.hash()),
                    ?status,
                    "Block carries an invalid transaction"
                );
                return BlockValidationStatus::Erroneous;
            }
        }
        BlockValidationStatus::Valid
    }

    fn apply_block(&self, inner: &mut Inner, block: &FinalizedBlock) {
        for (index, tx) in block.txs().iter().enumerate() {
            let at = EventCoordinates {
                tx_hash: *tx.hash(),
                tx_index: index as u64,
                block_hash: *block.hash(),
                block_height: block.height(),
            };
            match self.apply_tx(&mut inner.ledger, tx, block) {
                Ok(events) => inner.events.record(events, &at),
                Err(e) => tracing::debug!(
                    tx = %to_hex(tx.hash()),
                    error = %e,
                    "Transaction reverted"
                ),
            }
        }
        inner.rotation.process_block(block);
        inner.height = block.height();
        refresh_mempool_locked(self.chain_id, inner, block);
    }

    fn apply_tx(
        &self,
        ledger: &mut Ledger,
        tx: &Transaction,
        block: &FinalizedBlock,
    ) -> StateResult<Vec<EmittedEvent>> {
        let charged = {
            let mut overlay = LedgerOverlay::new(ledger);
            overlay.debit(tx.from(), tx.gas_cost()?)?;
            overlay.bump_nonce(tx.from())?;
            overlay.into_writes()
        };
        ledger.apply(charged);

        let mut writes = {
            let mut overlay = LedgerOverlay::new(ledger);
            let call = Dispatch {
                caller: *tx.from(),
                to: *tx.to(),
                value: *tx.value(),
                data: tx.data(),
                gas: tx.gas_limit().saturating_sub(tx.intrinsic_gas()),
                nonce: tx.nonce(),
                tx_hash: Some(*tx.hash()),
                height: block.height(),
                timestamp: block.timestamp(),
                is_static: false,
            };
            self.dispatch(&mut overlay, &call)?;
            overlay.into_writes()
        };
        let events = std::mem::take(&mut writes.events);
        ledger.apply(writes);
        Ok(events)
    }

    /// Route a call. Returns the return data and the gas it used.
    fn dispatch(&self, overlay: &mut LedgerOverlay<'_>, call: &Dispatch<'_>) -> StateResult<(Vec<u8>, u64)> {
        if call.to == RDPOS_ADDRESS {
            return Err(StateError::Reverted("the rotation contract is not callable".into()));
        }
        if call.to == ZERO_ADDRESS {
            return self.create(overlay, call);
        }
        match overlay.contract(&call.to).map(ContractKind::tag) {
            None => {
                if !call.is_static {
                    overlay.transfer(&call.caller, &call.to, call.value)?;
                }
                Ok((Vec::new(), 0))
            }
            Some(ContractTag::Evm) => self.call_evm(overlay, call),
            Some(_) => call_native(overlay, call),
        }
    }

    fn create(&self, overlay: &mut LedgerOverlay<'_>, call: &Dispatch<'_>) -> StateResult<(Vec<u8>, u64)> {
        if call.is_static {
            return Err(StateError::Reverted("contract creation in a static call".into()));
        }
        let address = derive_contract_address(&call.caller, call.nonce);
        if overlay.contract(&address).is_some() {
            return Err(StateError::Reverted(format!("address {} is in use", to_hex(&address))));
        }
        overlay.transfer(&call.caller, &address, call.value)?;
        let ctx = CallContext {
            caller: call.caller,
            to: address,
            value: call.value,
            gas_limit: call.gas,
            data: call.data.to_vec(),
            code: Vec::new(),
            block_height: call.height,
            timestamp: call.timestamp,
            is_create: true,
            is_static: false,
        };
        let outcome = self.engine.execute(&ctx, &*overlay);
        if !outcome.success {
            return Err(StateError::Reverted(
                String::from_utf8_lossy(&outcome.return_data).into_owned(),
            ));
        }
        for diff in outcome.storage_diffs {
            overlay.storage_set(address, diff.key, diff.value);
        }
        overlay.emit(outcome.events);
        overlay.insert_contract(
            address,
            ContractKind::Evm(EvmContract {
                code: outcome.return_data,
            }),
        );
        if let Some(tx_hash) = call.tx_hash {
            overlay.record_tx_address(tx_hash, address);
        }
        tracing::debug!(address = %to_hex(&address), "Deployed contract");
        Ok((address.to_vec(), outcome.gas_used))
    }

    fn call_evm(&self, overlay: &mut LedgerOverlay<'_>, call: &Dispatch<'_>) -> StateResult<(Vec<u8>, u64)> {
        let code = overlay
            .contract(&call.to)
            .ok_or_else(|| ChainError::NotFound(to_hex(&call.to)))?
            .as_evm()?
            .code
            .clone();
        if !call.is_static {
            overlay.transfer(&call.caller, &call.to, call.value)?;
        }
        let ctx = CallContext {
            caller: call.caller,
            to: call.to,
            value: call.value,
            gas_limit: call.gas,
            data: call.data.to_vec(),
            code,
            block_height: call.height,
            timestamp: call.timestamp,
            is_create: false,
            is_static: call.is_static,
        };
        let outcome = self.engine.execute(&ctx, &*overlay);
        if !outcome.success {
            return Err(StateError::Reverted(
                String::from_utf8_lossy(&outcome.return_data).into_owned(),
            ));
        }
        for diff in outcome.storage_diffs {
            overlay.storage_set(call.to, diff.key, diff.value);
        }
        overlay.emit(outcome.events);
        Ok((outcome.return_data, outcome.gas_used))
    }

    // ── Simulation ──

    /// Run a read-only call against current state.
    pub fn eth_call(&self, request: &CallRequest) -> StateResult<Vec<u8>> {
        let inner = self.inner.read();
        let mut overlay = LedgerOverlay::new(&inner.ledger);
        let call = self.simulated(&overlay, request, &inner, true);
        Ok(self.dispatch(&mut overlay, &call)?.0)
    }

    /// Gas a transaction carrying `request` would use, intrinsic cost
    /// included. Fails if the call would revert.
    pub fn estimate_gas(&self, request: &CallRequest) -> StateResult<u64> {
        let inner = self.inner.read();
        let mut overlay = LedgerOverlay::new(&inner.ledger);
        let call = self.simulated(&overlay, request, &inner, false);
        let (_, used) = self.dispatch(&mut overlay, &call)?;
        Ok(intrinsic_gas(&request.data).saturating_add(used))
    }

    fn simulated<'a>(
        &self,
        overlay: &LedgerOverlay<'_>,
        request: &'a CallRequest,
        inner: &Inner,
        is_static: bool,
    ) -> Dispatch<'a> {
        let timestamp = self.chain.latest().map(|b| b.timestamp()).unwrap_or_default();
        Dispatch {
            caller: request.from,
            to: request.to,
            value: request.value,
            data: &request.data,
            gas: request.gas_limit,
            nonce: overlay.account(&request.from).nonce,
            tx_hash: None,
            height: inner.height + 1,
            timestamp,
            is_static,
        }
    }

    // ── Accounts and contracts ──

    pub fn get_native_balance(&self, address: &Address) -> U256 {
        self.inner.read().ledger.account(address).balance
    }

    pub fn get_native_nonce(&self, address: &Address) -> u64 {
        self.inner.read().ledger.account(address).nonce
    }

    /// Test-network faucet.
    pub fn add_balance(&self, address: &Address) -> StateResult<()> {
        let mut inner = self.inner.write();
        let writes = {
            let mut overlay = LedgerOverlay::new(&inner.ledger);
            overlay.credit(address, faucet_amount())?;
            overlay.into_writes()
        };
        inner.ledger.apply(writes);
        tracing::debug!(address = %to_hex(address), "Faucet credited account");
        Ok(())
    }

    pub fn get_native_contracts(&self) -> Vec<(Address, ContractTag)> {
        self.inner
            .read()
            .ledger
            .contracts()
            .filter(|(_, c)| c.native().is_some())
            .map(|(address, c)| (*address, c.tag()))
            .collect()
    }

    pub fn get_evm_contracts(&self) -> Vec<(Address, Vec<u8>)> {
        self.inner
            .read()
            .ledger
            .contracts()
            .filter_map(|(address, c)| c.as_evm().ok().map(|evm| (*address, evm.code.clone())))
            .collect()
    }

    pub fn get_contract_code(&self, address: &Address) -> Option<Vec<u8>> {
        self.inner
            .read()
            .ledger
            .contract(address)
            .and_then(|c| c.as_evm().ok())
            .map(|evm| evm.code.clone())
    }

    /// Run `f` against a contract while holding the state lock.
    pub fn with_contract<R>(&self, address: &Address, f: impl FnOnce(&ContractKind) -> R) -> Option<R> {
        self.inner.read().ledger.contract(address).map(f)
    }

    /// Contract created by the transaction `tx_hash`, if any.
    pub fn get_address_for_tx(&self, tx_hash: &Hash) -> Option<Address> {
        self.inner.read().ledger.tx_address(tx_hash)
    }

    // ── Events ──

    pub fn get_events(
        &self,
        from: BlockHeight,
        to: BlockHeight,
        address: Option<&Address>,
        topics: &[Hash],
    ) -> StateResult<Vec<Event>> {
        self.inner.read().events.get_events(from, to, address, topics)
    }

    pub fn get_events_for_tx(&self, tx_hash: &Hash) -> Vec<Event> {
        self.inner.read().events.get_events_for_tx(tx_hash)
    }

    // ── Rotation ──

    pub fn get_validators(&self) -> Vec<Address> {
        self.inner.read().rotation.validators().to_vec()
    }

    pub fn get_random_list(&self) -> Vec<Address> {
        self.inner.read().rotation.random_list().to_vec()
    }

    pub fn get_best_random_seed(&self) -> Hash {
        *self.inner.read().rotation.best_random_seed()
    }

    pub fn get_min_validators(&self) -> usize {
        self.inner.read().rotation.min_validators()
    }

    pub fn get_validator_mempool(&self) -> Vec<ValidatorTx> {
        self.inner.read().rotation.mempool()
    }

    pub fn get_validator_mempool_size(&self) -> usize {
        self.inner.read().rotation.mempool_size()
    }

    /// The pending round's commits then reveals, once every participant
    /// has sent both.
    pub fn get_round_transactions(&self) -> Option<Vec<ValidatorTx>> {
        self.inner.read().rotation.round_transactions()
    }

    pub fn is_validator(&self, address: &Address) -> bool {
        self.inner.read().rotation.is_validator(address)
    }

    /// Signer of the next block.
    pub fn proposer(&self) -> Address {
        *self.inner.read().rotation.proposer()
    }

    /// Validators expected to commit and reveal in the next block.
    pub fn participants(&self) -> Vec<Address> {
        self.inner.read().rotation.participants().to_vec()
    }

    pub fn clear_validator_mempool(&self) {
        self.inner.write().rotation.clear_mempool();
    }

    // ── Mempool upkeep ──

    /// Drop `block`'s transactions from the mempool, then drop whatever no
    /// longer validates against current state.
    pub fn refresh_mempool(&self, block: &FinalizedBlock) {
        let mut inner = self.inner.write();
        refresh_mempool_locked(self.chain_id, &mut inner, block);
    }

    // ── Block production ──

    /// Assemble and sign the next block from the mempools.
    ///
    /// Fails unless the validator round for the pending height is
    /// complete. At most one transaction per sender is included, the one
    /// carrying that sender's next nonce.
    pub fn build_next_block(&self, key: &SigningKey, timestamp: u64) -> StateResult<FinalizedBlock> {
        let inner = self.inner.read();
        let latest = self
            .chain
            .latest()
            .ok_or_else(|| ChainError::NotFound("latest block".into()))?;
        let validator_txs = inner
            .rotation
            .round_transactions()
            .ok_or_else(|| ChainError::InvalidBlock("validator round is incomplete".into()))?;
        let mut senders = HashSet::new();
        let txs = inner
            .mempool
            .values()
            .filter(|tx| tx.nonce() == inner.ledger.account(tx.from()).nonce)
            .filter(|tx| senders.insert(*tx.from()))
            .cloned()
            .collect();
        Ok(FinalizedBlock::create_new_valid_block(
            txs,
            validator_txs,
            *latest.hash(),
            timestamp.max(latest.timestamp()),
            latest.height() + 1,
            key,
        )?)
    }

    // ── Persistence ──

    /// Everything needed to rebuild this state, as one batch.
    pub fn dump(&self) -> WriteBatch {
        let inner = self.inner.read();
        let mut batch = WriteBatch::new();
        inner.ledger.dump(&mut batch);
        inner.events.dump(&mut batch);
        batch.put(
            storage::key(prefix::META, SEED_KEY),
            inner.rotation.best_random_seed().to_vec(),
        );
        batch.put(
            storage::key(prefix::META, STATE_HEIGHT_KEY),
            inner.height.to_be_bytes().to_vec(),
        );
        batch
    }

    pub fn save_to_store(&self) -> StateResult<()> {
        let batch = self.dump();
        let entries = batch.len();
        self.store.commit(batch)?;
        tracing::debug!(entries, "Saved state");
        Ok(())
    }
}

/// Validity of `tx` against `view`, ignoring the mempool.
fn check_tx(chain_id: ChainId, view: &LedgerOverlay<'_>, tx: &Transaction) -> TxStatus {
    if tx.chain_id() != chain_id {
        return TxStatus::InvalidChainId;
    }
    if tx.gas_limit() < tx.intrinsic_gas() {
        return TxStatus::InvalidGas;
    }
    let account = view.account(tx.from());
    if tx.nonce() != account.nonce {
        return TxStatus::InvalidNonce;
    }
    match tx.total_cost() {
        Ok(cost) if cost <= account.balance => TxStatus::ValidNew,
        _ => TxStatus::InvalidBalance,
    }
}

/// The effects block validation assumes a transaction has.
fn simulate(scratch: &mut LedgerOverlay<'_>, tx: &Transaction) -> StateResult<()> {
    scratch.debit(tx.from(), tx.total_cost()?)?;
    scratch.bump_nonce(tx.from())?;
    if tx.to() != &ZERO_ADDRESS {
        scratch.credit(tx.to(), *tx.value())?;
    }
    Ok(())
}

fn refresh_mempool_locked(chain_id: ChainId, inner: &mut Inner, block: &FinalizedBlock) {
    for tx in block.txs() {
        inner.mempool.remove(tx.hash());
    }
    let Inner { ledger, mempool, .. } = inner;
    let view = LedgerOverlay::new(ledger);
    let before = mempool.len();
    mempool.retain(|_, tx| check_tx(chain_id, &view, tx).is_valid());
    let dropped = before - mempool.len();
    if dropped > 0 {
        tracing::debug!(dropped, "Dropped stale mempool transactions");
    }
}

fn call_native(overlay: &mut LedgerOverlay<'_>, call: &Dispatch<'_>) -> StateResult<(Vec<u8>, u64)> {
    if !call.value.is_zero() {
        return Err(StateError::Reverted("native contracts do not accept value".into()));
    }
    let mut meter = GasMeter::new(call.gas);
    meter.consume(G_NATIVE_CALL)?;
    let native_call = NativeCall {
        caller: call.caller,
        contract: call.to,
        data: call.data,
        nonce: call.nonce,
    };
    let not_native = || StateError::Reverted(format!("{} is not a native contract", to_hex(&call.to)));

    let output = if call.is_static {
        let contract = overlay
            .contract(&call.to)
            .and_then(|c| c.native())
            .ok_or_else(not_native)?;
        CallOutput {
            return_data: contract.view(&native_call)?,
            ..CallOutput::default()
        }
    } else {
        overlay
            .contract_mut(&call.to)
            .and_then(|c| c.native_mut())
            .ok_or_else(not_native)?
            .call(&native_call)?
    };

    if let Some((address, contract)) = output.deploy {
        meter.consume(G_NATIVE_DEPLOY)?;
        if overlay.contract(&address).is_some() {
            return Err(StateError::Reverted(format!("address {} is in use", to_hex(&address))));
        }
        overlay.insert_contract(address, contract);
        if let Some(tx_hash) = call.tx_hash {
            overlay.record_tx_address(tx_hash, address);
        }
    }
    meter.consume(G_EVENT.saturating_mul(output.events.len() as u64))?;
    overlay.emit(output.events);
    Ok((output.return_data, meter.consumed()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemStore;
    use crate::vm::MockEngine;
    use halcyon_primitives::crypto::{address_of, key_from_bytes};
    use halcyon_primitives::UnsignedTransaction;

    fn key(seed: u8) -> SigningKey {
        key_from_bytes(&[seed; 32]).unwrap()
    }

    fn config() -> NodeConfig {
        let mut config = NodeConfig::default();
        config.min_validators = 1;
        config.validators = (10..12u8).map(|s| to_hex(&address_of(&key(s)))).collect();
        config
            .genesis
            .balances
            .insert(to_hex(&address_of(&key(1))), U256::from(1_000_000));
        config
    }

    fn state() -> State {
        State::genesis(&config(), Arc::new(MemStore::new()), Arc::new(MockEngine::new())).unwrap()
    }

    fn transfer(nonce: u64, value: u64, gas_price: u64) -> Transaction {
        UnsignedTransaction {
            chain_id: 8080,
            nonce,
            to: [0xbb; 20],
            value: U256::from(value),
            gas_limit: 21_000,
            gas_price: U256::from(gas_price),
            data: vec![],
        }
        .sign(&key(1))
        .unwrap()
    }

    #[test]
    fn test_validate_transaction_statuses() {
        let state = state();
        assert_eq!(state.validate_transaction(&transfer(0, 10, 1)), TxStatus::ValidNew);
        assert_eq!(state.validate_transaction(&transfer(1, 10, 1)), TxStatus::InvalidNonce);
        assert_eq!(
            state.validate_transaction(&transfer(0, 1_000_000, 1)),
            TxStatus::InvalidBalance
        );
        let mut unsigned = UnsignedTransaction {
            chain_id: 1,
            nonce: 0,
            to: [0xbb; 20],
            value: U256::one(),
            gas_limit: 21_000,
            gas_price: U256::zero(),
            data: vec![],
        };
        assert_eq!(
            state.validate_transaction(&unsigned.clone().sign(&key(1)).unwrap()),
            TxStatus::InvalidChainId
        );
        unsigned.chain_id = 8080;
        unsigned.gas_limit = 20_999;
        assert_eq!(
            state.validate_transaction(&unsigned.sign(&key(1)).unwrap()),
            TxStatus::InvalidGas
        );
    }

    #[test]
    fn test_add_tx_dedups() {
        let state = state();
        let tx = transfer(0, 10, 0);
        assert_eq!(state.add_tx(tx.clone()), TxStatus::ValidNew);
        assert_eq!(state.add_tx(tx.clone()), TxStatus::ValidExisting);
        assert_eq!(state.validate_transaction(&tx), TxStatus::ValidExisting);
        assert_eq!(state.get_mempool_size(), 1);
        assert!(state.is_tx_in_mempool(tx.hash()));
    }

    #[test]
    fn test_faucet() {
        let state = state();
        state.add_balance(&[5; 20]).unwrap();
        assert_eq!(state.get_native_balance(&[5; 20]), faucet_amount());
    }

    #[test]
    fn test_genesis_shape() {
        let state = state();
        assert_eq!(state.height(), 0);
        assert_eq!(state.get_validators().len(), 2);
        assert_eq!(
            state.get_native_contracts(),
            vec![(CONTRACT_MANAGER_ADDRESS, ContractTag::ContractManager)]
        );
        assert!(state.get_evm_contracts().is_empty());
    }

    #[test]
    fn test_wrong_height_is_reported() {
        let state = state();
        let block = FinalizedBlock::create_new_valid_block(
            vec![],
            vec![],
            *state.latest_block().unwrap().hash(),
            u64::MAX / 2,
            5,
            &key(10),
        )
        .unwrap();
        assert_eq!(state.validate_next_block(&block), BlockValidationStatus::WrongHeight);
        assert!(matches!(
            state.process_next_block(block),
            Err(StateError::BlockRejected(BlockValidationStatus::WrongHeight))
        ));
    }
}
