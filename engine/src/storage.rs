//! Key-value storage seam.
//!
//! The node persists through a byte-keyed store offering point reads,
//! point writes, prefix scans and atomic batch commits. [`MemStore`] is an
//! in-memory implementation backed by a `BTreeMap` so scans come back in
//! key order.
//!
//! Keys are namespaced by a short prefix, listed in [`prefix`].

use std::collections::BTreeMap;

use halcyon_primitives::Synced;

use crate::error::StateResult;

/// Key namespaces.
pub mod prefix {
    pub const ACCOUNTS: &[u8] = b"acct/";
    pub const CONTRACTS: &[u8] = b"ctrt/";
    pub const VM_STORAGE: &[u8] = b"vmst/";
    pub const TX_TO_ADDR: &[u8] = b"txad/";
    pub const EVENTS: &[u8] = b"evnt/";
    pub const BLOCKS: &[u8] = b"blck/";
    pub const BLOCK_HEIGHTS: &[u8] = b"bhgt/";
    pub const TX_INDEX: &[u8] = b"txix/";
    pub const META: &[u8] = b"meta/";
}

/// Build `prefix || key`.
pub fn key(prefix: &[u8], key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(prefix.len() + key.len());
    out.extend_from_slice(prefix);
    out.extend_from_slice(key);
    out
}

/// Writes applied together or not at all.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<(Vec<u8>, Option<Vec<u8>>)>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push((key, Some(value)));
    }

    pub fn delete(&mut self, key: Vec<u8>) {
        self.ops.push((key, None));
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&[u8], Option<&[u8]>)> {
        self.ops
            .iter()
            .map(|(k, v)| (k.as_slice(), v.as_deref()))
    }

    pub fn extend(&mut self, other: WriteBatch) {
        self.ops.extend(other.ops);
    }
}

pub trait KvStore: Send + Sync {
    fn get(&self, key: &[u8]) -> StateResult<Option<Vec<u8>>>;

    fn put(&self, key: &[u8], value: &[u8]) -> StateResult<()>;

    /// Apply every operation in `batch` atomically, in order.
    fn commit(&self, batch: WriteBatch) -> StateResult<()>;

    /// All entries whose key starts with `prefix`, in key order.
    fn scan_prefix(&self, prefix: &[u8]) -> StateResult<Vec<(Vec<u8>, Vec<u8>)>>;

    fn contains(&self, key: &[u8]) -> StateResult<bool> {
        Ok(self.get(key)?.is_some())
    }
}

#[derive(Debug, Default)]
pub struct MemStore {
    data: Synced<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove a key directly. Used to simulate damaged stores.
    pub fn remove(&self, key: &[u8]) {
        self.data.write().remove(key);
    }
}

impl KvStore for MemStore {
    fn get(&self, key: &[u8]) -> StateResult<Option<Vec<u8>>> {
        Ok(self.data.read().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> StateResult<()> {
        self.data.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn commit(&self, batch: WriteBatch) -> StateResult<()> {
        let mut data = self.data.write();
        for (key, value) in batch.ops {
            match value {
                Some(value) => {
                    data.insert(key, value);
                }
                None => {
                    data.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> StateResult<Vec<(Vec<u8>, Vec<u8>)>> {
        Ok(self
            .data
            .read()
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}
