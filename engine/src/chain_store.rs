//! Accepted blocks and their indices.
//!
//! Each accepted block is written in one batch:
//!
//! ```text
//! blck/<hash>          -> serialized block
//! bhgt/<height BE>     -> hash
//! txix/<tx hash>       -> block hash (32) || tx index (u32 BE)
//! meta/latest          -> hash
//! ```
//!
//! The latest block is cached in memory.

use std::sync::Arc;

use halcyon_primitives::codec::{write_u32, Reader};
use halcyon_primitives::{
    BlockHeight, ChainId, DecodeOptions, FinalizedBlock, Hash, Synced, Transaction,
};

use crate::error::{StateError, StateResult};
use crate::ledger::fixed;
use crate::storage::{self, prefix, KvStore, WriteBatch};

const LATEST_KEY: &[u8] = b"latest";

/// A transaction located in an accepted block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxLocation {
    pub tx: Transaction,
    pub block_hash: Hash,
    pub block_height: BlockHeight,
    pub index: u32,
}

pub struct ChainStore {
    store: Arc<dyn KvStore>,
    chain_id: ChainId,
    decode: DecodeOptions,
    latest: Synced<Option<Arc<FinalizedBlock>>>,
}

impl ChainStore {
    /// Open over `store`, loading the latest block if one was persisted.
    pub fn open(store: Arc<dyn KvStore>, chain_id: ChainId, decode: DecodeOptions) -> StateResult<Self> {
        let chain = Self {
            store,
            chain_id,
            decode,
            latest: Synced::new(None),
        };
        if let Some(hash) = chain.store.get(&storage::key(prefix::META, LATEST_KEY))? {
            let hash = fixed::<32>(&hash, "latest block hash")?;
            let block = chain
                .block_by_hash(&hash)?
                .ok_or_else(|| StateError::Fatal("latest block is missing from the store".into()))?;
            *chain.latest.write() = Some(block);
        }
        Ok(chain)
    }

    pub fn latest(&self) -> Option<Arc<FinalizedBlock>> {
        self.latest.read().clone()
    }

    pub fn height(&self) -> Option<BlockHeight> {
        self.latest.read().as_ref().map(|b| b.height())
    }

    /// Persist `block` and make it the latest.
    pub fn put_block(&self, block: Arc<FinalizedBlock>) -> StateResult<()> {
        let mut batch = WriteBatch::new();
        batch.put(storage::key(prefix::BLOCKS, block.hash()), block.serialize());
        batch.put(
            storage::key(prefix::BLOCK_HEIGHTS, &block.height().to_be_bytes()),
            block.hash().to_vec(),
        );
        for (index, tx) in block.txs().iter().enumerate() {
            let mut location = block.hash().to_vec();
            write_u32(&mut location, index as u32);
            batch.put(storage::key(prefix::TX_INDEX, tx.hash()), location);
        }
        batch.put(storage::key(prefix::META, LATEST_KEY), block.hash().to_vec());
        self.store.commit(batch)?;
        *self.latest.write() = Some(block);
        Ok(())
    }

    pub fn block_by_hash(&self, hash: &Hash) -> StateResult<Option<Arc<FinalizedBlock>>> {
        if let Some(latest) = self.latest() {
            if latest.hash() == hash {
                return Ok(Some(latest));
            }
        }
        match self.store.get(&storage::key(prefix::BLOCKS, hash))? {
            Some(bytes) => {
                let block = FinalizedBlock::from_bytes(&bytes, self.chain_id, &self.decode)
                    .map_err(|e| StateError::Fatal(format!("stored block is corrupt: {}", e)))?;
                Ok(Some(Arc::new(block)))
            }
            None => Ok(None),
        }
    }

    pub fn block_by_height(&self, height: BlockHeight) -> StateResult<Option<Arc<FinalizedBlock>>> {
        match self
            .store
            .get(&storage::key(prefix::BLOCK_HEIGHTS, &height.to_be_bytes()))?
        {
            Some(hash) => self.block_by_hash(&fixed::<32>(&hash, "block height index")?),
            None => Ok(None),
        }
    }

    pub fn has_block(&self, hash: &Hash) -> StateResult<bool> {
        self.store.contains(&storage::key(prefix::BLOCKS, hash))
    }

    pub fn tx_by_hash(&self, tx_hash: &Hash) -> StateResult<Option<TxLocation>> {
        let Some(location) = self.store.get(&storage::key(prefix::TX_INDEX, tx_hash))? else {
            return Ok(None);
        };
        let mut r = Reader::new(&location);
        let block_hash = r.read_hash()?;
        let index = r.read_u32()?;
        let block = self
            .block_by_hash(&block_hash)?
            .ok_or_else(|| StateError::Fatal("indexed block is missing from the store".into()))?;
        let tx = block
            .txs()
            .get(index as usize)
            .cloned()
            .ok_or_else(|| StateError::Fatal("tx index points past the block".into()))?;
        Ok(Some(TxLocation {
            tx,
            block_hash,
            block_height: block.height(),
            index,
        }))
    }
}
