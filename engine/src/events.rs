//! Append-only contract event log.
//!
//! Events are keyed by `(block height, tx index, log index)` so range
//! queries by height come back in emission order. A second index maps a
//! transaction hash to its events.

use std::collections::{BTreeMap, HashMap};

use halcyon_primitives::codec::{write_framed, write_u32, write_u64, write_u8, Reader};
use halcyon_primitives::{Address, BlockHeight, Hash};

use crate::error::{StateError, StateResult};
use crate::storage::{self, prefix, KvStore, WriteBatch};
use crate::vm::EmittedEvent;

/// Widest height range a single query may span.
pub const MAX_EVENT_BLOCK_RANGE: u64 = 2_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub name: String,
    /// Position among the events of its transaction.
    pub log_index: u64,
    pub tx_hash: Hash,
    pub tx_index: u64,
    pub block_hash: Hash,
    pub block_height: BlockHeight,
    pub address: Address,
    pub data: Vec<u8>,
    pub topics: Vec<Hash>,
    pub anonymous: bool,
}

/// Where in the chain a batch of emitted events landed.
#[derive(Debug, Clone, Copy)]
pub struct EventCoordinates {
    pub tx_hash: Hash,
    pub tx_index: u64,
    pub block_hash: Hash,
    pub block_height: BlockHeight,
}

type EventKey = (BlockHeight, u64, u64);

impl Event {
    pub fn from_emitted(emitted: EmittedEvent, log_index: u64, at: &EventCoordinates) -> Self {
        Self {
            name: emitted.name,
            log_index,
            tx_hash: at.tx_hash,
            tx_index: at.tx_index,
            block_hash: at.block_hash,
            block_height: at.block_height,
            address: emitted.address,
            data: emitted.data,
            topics: emitted.topics,
            anonymous: emitted.anonymous,
        }
    }

    fn key(&self) -> EventKey {
        (self.block_height, self.tx_index, self.log_index)
    }

    fn storage_key(&self) -> Vec<u8> {
        let mut key = storage::key(prefix::EVENTS, &self.block_height.to_be_bytes());
        key.extend_from_slice(&self.tx_index.to_be_bytes());
        key.extend_from_slice(&self.log_index.to_be_bytes());
        key
    }

    /// Topics match by position; an event with fewer topics than the
    /// filter never matches.
    fn matches(&self, address: Option<&Address>, topics: &[Hash]) -> bool {
        if let Some(address) = address {
            if &self.address != address {
                return false;
            }
        }
        topics.len() <= self.topics.len() && topics.iter().zip(&self.topics).all(|(a, b)| a == b)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        write_framed(&mut buf, self.name.as_bytes());
        write_u64(&mut buf, self.log_index);
        buf.extend_from_slice(&self.tx_hash);
        write_u64(&mut buf, self.tx_index);
        buf.extend_from_slice(&self.block_hash);
        write_u64(&mut buf, self.block_height);
        buf.extend_from_slice(&self.address);
        write_framed(&mut buf, &self.data);
        write_u32(&mut buf, self.topics.len() as u32);
        for topic in &self.topics {
            buf.extend_from_slice(topic);
        }
        write_u8(&mut buf, self.anonymous as u8);
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> StateResult<Self> {
        let parse = || -> StateResult<Self> {
            let mut r = Reader::new(bytes);
            let name = String::from_utf8(r.read_framed()?.to_vec())
                .map_err(|_| StateError::Fatal("event name is not UTF-8".into()))?;
            let log_index = r.read_u64()?;
            let tx_hash = r.read_hash()?;
            let tx_index = r.read_u64()?;
            let block_hash = r.read_hash()?;
            let block_height = r.read_u64()?;
            let address = r.read_address()?;
            let data = r.read_framed()?.to_vec();
            let mut topics = Vec::new();
            for _ in 0..r.read_u32()? {
                topics.push(r.read_hash()?);
            }
            let anonymous = r.read_u8()? != 0;
            if !r.is_empty() {
                return Err(StateError::Fatal("trailing bytes after event".into()));
            }
            Ok(Self {
                name,
                log_index,
                tx_hash,
                tx_index,
                block_hash,
                block_height,
                address,
                data,
                topics,
                anonymous,
            })
        };
        parse().map_err(|e| match e {
            StateError::Fatal(_) => e,
            other => StateError::Fatal(format!("corrupt event record: {}", other)),
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct EventLog {
    events: BTreeMap<EventKey, Event>,
    by_tx: HashMap<Hash, Vec<EventKey>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn push(&mut self, event: Event) {
        let key = event.key();
        self.by_tx.entry(event.tx_hash).or_default().push(key);
        self.events.insert(key, event);
    }

    /// Record the events of one transaction in emission order.
    pub fn record(&mut self, emitted: Vec<EmittedEvent>, at: &EventCoordinates) {
        for (log_index, event) in emitted.into_iter().enumerate() {
            self.push(Event::from_emitted(event, log_index as u64, at));
        }
    }

    /// Events in `from..=to`, optionally filtered by emitter and leading
    /// topics.
    pub fn get_events(
        &self,
        from: BlockHeight,
        to: BlockHeight,
        address: Option<&Address>,
        topics: &[Hash],
    ) -> StateResult<Vec<Event>> {
        if from > to {
            return Err(StateError::Chain(halcyon_primitives::ChainError::MalformedInput(
                format!("event range {}..={} is reversed", from, to),
            )));
        }
        if to - from >= MAX_EVENT_BLOCK_RANGE {
            return Err(StateError::Chain(halcyon_primitives::ChainError::MalformedInput(
                format!("event range spans more than {} blocks", MAX_EVENT_BLOCK_RANGE),
            )));
        }
        Ok(self
            .events
            .range((from, 0, 0)..=(to, u64::MAX, u64::MAX))
            .map(|(_, event)| event)
            .filter(|event| event.matches(address, topics))
            .cloned()
            .collect())
    }

    pub fn get_events_for_tx(&self, tx_hash: &Hash) -> Vec<Event> {
        self.by_tx
            .get(tx_hash)
            .map(|keys| {
                keys.iter()
                    .filter_map(|key| self.events.get(key))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn dump(&self, batch: &mut WriteBatch) {
        for event in self.events.values() {
            batch.put(event.storage_key(), event.to_bytes());
        }
    }

    pub fn load(store: &dyn KvStore) -> StateResult<Self> {
        let mut log = Self::new();
        for (_, value) in store.scan_prefix(prefix::EVENTS)? {
            log.push(Event::from_bytes(&value)?);
        }
        Ok(log)
    }
}
