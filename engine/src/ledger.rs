//! Committed ledger tables.
//!
//! [`Ledger`] owns every table a ledger transaction can touch: native
//! accounts, the contract table, contract storage and the index from a
//! creating transaction to the contract it created. It is only mutated by
//! applying the writes collected in a [`LedgerOverlay`](crate::overlay::LedgerOverlay).

use std::collections::{BTreeMap, HashMap};

use halcyon_primitives::codec::{write_u256, write_u64, Reader};
use halcyon_primitives::{Address, Hash, U256, ZERO_HASH};

use crate::contracts::ContractKind;
use crate::error::{StateError, StateResult};
use crate::overlay::LedgerWrites;
use crate::storage::{self, prefix, KvStore, WriteBatch};

/// A native account.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Account {
    pub balance: U256,
    pub nonce: u64,
}

impl Account {
    pub const ENCODED_LEN: usize = 40;

    pub fn with_balance(balance: U256) -> Self {
        Self { balance, nonce: 0 }
    }

    /// `balance (32) || nonce (8)`
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::ENCODED_LEN);
        write_u256(&mut buf, &self.balance);
        write_u64(&mut buf, self.nonce);
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> StateResult<Self> {
        if bytes.len() != Self::ENCODED_LEN {
            return Err(StateError::Fatal(format!(
                "account record has {} bytes, expected {}",
                bytes.len(),
                Self::ENCODED_LEN
            )));
        }
        let mut r = Reader::new(bytes);
        Ok(Self {
            balance: r.read_u256()?,
            nonce: r.read_u64()?,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct Ledger {
    accounts: HashMap<Address, Account>,
    contracts: BTreeMap<Address, ContractKind>,
    storage: HashMap<(Address, Hash), Hash>,
    tx_to_addr: HashMap<Hash, Address>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unknown addresses read as an empty account.
    pub fn account(&self, address: &Address) -> Account {
        self.accounts.get(address).copied().unwrap_or_default()
    }

    pub fn set_account(&mut self, address: Address, account: Account) {
        self.accounts.insert(address, account);
    }

    pub fn account_count(&self) -> usize {
        self.accounts.len()
    }

    pub fn contract(&self, address: &Address) -> Option<&ContractKind> {
        self.contracts.get(address)
    }

    pub fn contracts(&self) -> impl Iterator<Item = (&Address, &ContractKind)> {
        self.contracts.iter()
    }

    pub fn insert_contract(&mut self, address: Address, contract: ContractKind) {
        self.contracts.insert(address, contract);
    }

    pub fn storage_get(&self, contract: &Address, key: &Hash) -> Hash {
        self.storage
            .get(&(*contract, *key))
            .copied()
            .unwrap_or(ZERO_HASH)
    }

    pub fn tx_address(&self, tx_hash: &Hash) -> Option<Address> {
        self.tx_to_addr.get(tx_hash).copied()
    }

    /// Fold committed overlay writes into the tables.
    pub fn apply(&mut self, writes: LedgerWrites) {
        let LedgerWrites {
            accounts,
            contracts,
            storage,
            tx_to_addr,
            ..
        } = writes;
        self.accounts.extend(accounts);
        self.contracts.extend(contracts);
        // Zeroed slots are kept so a dump never has to delete keys.
        self.storage.extend(storage);
        self.tx_to_addr.extend(tx_to_addr);
    }

    // ── Persistence ──

    pub fn dump(&self, batch: &mut WriteBatch) {
        for (address, account) in &self.accounts {
            batch.put(storage::key(prefix::ACCOUNTS, address), account.to_bytes());
        }
        for (address, contract) in &self.contracts {
            batch.put(storage::key(prefix::CONTRACTS, address), contract.to_bytes());
        }
        for ((contract, slot), value) in &self.storage {
            let mut key = storage::key(prefix::VM_STORAGE, contract);
            key.extend_from_slice(slot);
            batch.put(key, value.to_vec());
        }
        for (tx_hash, address) in &self.tx_to_addr {
            batch.put(storage::key(prefix::TX_TO_ADDR, tx_hash), address.to_vec());
        }
    }

    /// Rebuild the tables from a dump. Any record of the wrong size or
    /// shape is [`StateError::Fatal`].
    pub fn load(store: &dyn KvStore) -> StateResult<Self> {
        let mut ledger = Self::new();

        for (key, value) in store.scan_prefix(prefix::ACCOUNTS)? {
            let address = fixed::<20>(&key[prefix::ACCOUNTS.len()..], "account key")?;
            ledger.accounts.insert(address, Account::from_bytes(&value)?);
        }
        for (key, value) in store.scan_prefix(prefix::CONTRACTS)? {
            let address = fixed::<20>(&key[prefix::CONTRACTS.len()..], "contract key")?;
            ledger.contracts.insert(address, ContractKind::from_bytes(&value)?);
        }
        for (key, value) in store.scan_prefix(prefix::VM_STORAGE)? {
            let rest = &key[prefix::VM_STORAGE.len()..];
            if rest.len() != 52 {
                return Err(StateError::Fatal(format!(
                    "storage slot key has {} bytes, expected 52",
                    rest.len()
                )));
            }
            let contract = fixed::<20>(&rest[..20], "storage slot contract")?;
            let slot = fixed::<32>(&rest[20..], "storage slot")?;
            ledger
                .storage
                .insert((contract, slot), fixed::<32>(&value, "storage value")?);
        }
        for (key, value) in store.scan_prefix(prefix::TX_TO_ADDR)? {
            let tx_hash = fixed::<32>(&key[prefix::TX_TO_ADDR.len()..], "tx index key")?;
            ledger
                .tx_to_addr
                .insert(tx_hash, fixed::<20>(&value, "tx index address")?);
        }
        Ok(ledger)
    }
}

/// Exactly `N` bytes, or a fatal shape mismatch.
pub(crate) fn fixed<const N: usize>(bytes: &[u8], what: &str) -> StateResult<[u8; N]> {
    bytes.try_into().map_err(|_| {
        StateError::Fatal(format!("{} has {} bytes, expected {}", what, bytes.len(), N))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::{ContractManager, CONTRACT_MANAGER_ADDRESS};
    use crate::storage::MemStore;

    #[test]
    fn test_unknown_account_is_empty() {
        let ledger = Ledger::new();
        assert_eq!(ledger.account(&[1; 20]), Account::default());
        assert_eq!(ledger.storage_get(&[1; 20], &[2; 32]), ZERO_HASH);
    }

    #[test]
    fn test_dump_and_load() {
        let mut ledger = Ledger::new();
        ledger.set_account(
            [1; 20],
            Account {
                balance: U256::from(500),
                nonce: 3,
            },
        );
        ledger.insert_contract(
            CONTRACT_MANAGER_ADDRESS,
            ContractKind::ContractManager(ContractManager::default()),
        );
        ledger.storage.insert(([2; 20], [3; 32]), [4; 32]);
        ledger.tx_to_addr.insert([5; 32], [2; 20]);

        let store = MemStore::new();
        let mut batch = WriteBatch::new();
        ledger.dump(&mut batch);
        store.commit(batch).unwrap();

        let loaded = Ledger::load(&store).unwrap();
        assert_eq!(loaded.account(&[1; 20]).nonce, 3);
        assert_eq!(loaded.storage_get(&[2; 20], &[3; 32]), [4; 32]);
        assert_eq!(loaded.tx_address(&[5; 32]), Some([2; 20]));
        assert!(loaded.contract(&CONTRACT_MANAGER_ADDRESS).is_some());
    }

    #[test]
    fn test_load_rejects_bad_account_record() {
        let store = MemStore::new();
        store
            .put(&storage::key(prefix::ACCOUNTS, &[1; 20]), &[0; 39])
            .unwrap();
        assert!(matches!(Ledger::load(&store), Err(StateError::Fatal(_))));

        let store = MemStore::new();
        store
            .put(&storage::key(prefix::ACCOUNTS, &[1; 19]), &[0; 40])
            .unwrap();
        assert!(matches!(Ledger::load(&store), Err(StateError::Fatal(_))));
    }
}
