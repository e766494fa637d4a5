//! Transactional write buffer over the committed ledger.
//!
//! A [`LedgerOverlay`] borrows the [`Ledger`] immutably and buffers every
//! write made while applying one transaction. Reads see the buffered
//! writes first and fall through to committed state otherwise. On success
//! the caller takes the writes with [`LedgerOverlay::into_writes`] and
//! folds them into the ledger; on failure the overlay is dropped and
//! nothing it saw is kept.
//!
//! Block validation uses the same type as a scratch view: each
//! transaction is checked and simulated against the overlay, which is then
//! discarded.

use std::collections::BTreeMap;

use halcyon_primitives::arith::{checked_add, checked_sub};
use halcyon_primitives::{Address, ArithmeticFault, Hash, U256};

use crate::contracts::ContractKind;
use crate::error::StateResult;
use crate::ledger::{Account, Ledger};
use crate::vm::{EmittedEvent, StorageView};

/// Writes collected by an overlay. `BTreeMap`s keep application order
/// deterministic.
#[derive(Debug, Clone, Default)]
pub struct LedgerWrites {
    pub accounts: BTreeMap<Address, Account>,
    pub contracts: BTreeMap<Address, ContractKind>,
    pub storage: BTreeMap<(Address, Hash), Hash>,
    pub tx_to_addr: BTreeMap<Hash, Address>,
    pub events: Vec<EmittedEvent>,
}

impl LedgerWrites {
    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
            && self.contracts.is_empty()
            && self.storage.is_empty()
            && self.tx_to_addr.is_empty()
            && self.events.is_empty()
    }
}

pub struct LedgerOverlay<'a> {
    base: &'a Ledger,
    writes: LedgerWrites,
}

impl<'a> LedgerOverlay<'a> {
    pub fn new(base: &'a Ledger) -> Self {
        Self {
            base,
            writes: LedgerWrites::default(),
        }
    }

    // ── Accounts ──

    pub fn account(&self, address: &Address) -> Account {
        self.writes
            .accounts
            .get(address)
            .copied()
            .unwrap_or_else(|| self.base.account(address))
    }

    pub fn set_account(&mut self, address: Address, account: Account) {
        self.writes.accounts.insert(address, account);
    }

    pub fn balance(&self, address: &Address) -> U256 {
        self.account(address).balance
    }

    pub fn credit(&mut self, address: &Address, amount: U256) -> StateResult<()> {
        let mut account = self.account(address);
        account.balance = checked_add(account.balance, amount)?;
        self.set_account(*address, account);
        Ok(())
    }

    /// Fails with an underflow fault when the balance is short.
    pub fn debit(&mut self, address: &Address, amount: U256) -> StateResult<()> {
        let mut account = self.account(address);
        account.balance = checked_sub(account.balance, amount)?;
        self.set_account(*address, account);
        Ok(())
    }

    pub fn transfer(&mut self, from: &Address, to: &Address, amount: U256) -> StateResult<()> {
        if amount.is_zero() {
            return Ok(());
        }
        self.debit(from, amount)?;
        self.credit(to, amount)
    }

    pub fn bump_nonce(&mut self, address: &Address) -> StateResult<()> {
        let mut account = self.account(address);
        account.nonce = account.nonce.checked_add(1).ok_or(ArithmeticFault::Overflow)?;
        self.set_account(*address, account);
        Ok(())
    }

    // ── Contracts ──

    pub fn contract(&self, address: &Address) -> Option<&ContractKind> {
        self.writes
            .contracts
            .get(address)
            .or_else(|| self.base.contract(address))
    }

    /// Mutable access; a committed contract is copied into the overlay on
    /// first touch.
    pub fn contract_mut(&mut self, address: &Address) -> Option<&mut ContractKind> {
        if !self.writes.contracts.contains_key(address) {
            let committed = self.base.contract(address)?.clone();
            self.writes.contracts.insert(*address, committed);
        }
        self.writes.contracts.get_mut(address)
    }

    pub fn insert_contract(&mut self, address: Address, contract: ContractKind) {
        self.writes.contracts.insert(address, contract);
    }

    pub fn storage_set(&mut self, contract: Address, key: Hash, value: Hash) {
        self.writes.storage.insert((contract, key), value);
    }

    pub fn record_tx_address(&mut self, tx_hash: Hash, address: Address) {
        self.writes.tx_to_addr.insert(tx_hash, address);
    }

    pub fn emit(&mut self, events: impl IntoIterator<Item = EmittedEvent>) {
        self.writes.events.extend(events);
    }

    pub fn events(&self) -> &[EmittedEvent] {
        &self.writes.events
    }

    pub fn into_writes(self) -> LedgerWrites {
        self.writes
    }
}

impl StorageView for LedgerOverlay<'_> {
    fn storage_get(&self, contract: &Address, key: &Hash) -> Hash {
        self.writes
            .storage
            .get(&(*contract, *key))
            .copied()
            .unwrap_or_else(|| self.base.storage_get(contract, key))
    }
}

impl StorageView for Ledger {
    fn storage_get(&self, contract: &Address, key: &Hash) -> Hash {
        Ledger::storage_get(self, contract, key)
    }
}
