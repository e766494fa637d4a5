//! Cache of candidate blocks awaiting a decision.
//!
//! Blocks are held as `Arc`s so the P2P layer and the node can share them
//! while they are being considered. Accepting a block moves it out of the
//! cache and into the state machine: if the cache held the only reference
//! the block is moved as is, otherwise it is cloned first so no other
//! holder ever sees a block half-consumed.

use std::collections::HashMap;
use std::sync::Arc;

use halcyon_primitives::types::to_hex;
use halcyon_primitives::{ChainError, FinalizedBlock, Hash, Synced};

use crate::error::StateResult;
use crate::state::State;
use crate::status::BlockValidationStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockStatus {
    Unknown,
    Processing,
    Accepted,
    Rejected,
}

/// Move the block out of `block` if it is the last reference, else clone.
pub fn take_or_clone(block: Arc<FinalizedBlock>) -> FinalizedBlock {
    Arc::try_unwrap(block).unwrap_or_else(|shared| (*shared).clone())
}

#[derive(Default)]
struct TipInner {
    blocks: HashMap<Hash, Arc<FinalizedBlock>>,
    status: HashMap<Hash, BlockStatus>,
    preference: Option<Hash>,
}

#[derive(Default)]
pub struct ChainTip {
    inner: Synced<TipInner>,
}

impl ChainTip {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start considering `block`. Returns `false` if it is already known.
    pub fn process_block(&self, block: Arc<FinalizedBlock>) -> bool {
        let mut inner = self.inner.write();
        let hash = *block.hash();
        if inner.status.contains_key(&hash) {
            return false;
        }
        inner.status.insert(hash, BlockStatus::Processing);
        inner.blocks.insert(hash, block);
        true
    }

    pub fn get_block(&self, hash: &Hash) -> Option<Arc<FinalizedBlock>> {
        self.inner.read().blocks.get(hash).cloned()
    }

    pub fn exists(&self, hash: &Hash) -> bool {
        self.inner.read().blocks.contains_key(hash)
    }

    pub fn status(&self, hash: &Hash) -> BlockStatus {
        self.inner
            .read()
            .status
            .get(hash)
            .copied()
            .unwrap_or(BlockStatus::Unknown)
    }

    pub fn is_processing(&self, hash: &Hash) -> bool {
        self.status(hash) == BlockStatus::Processing
    }

    pub fn len(&self) -> usize {
        self.inner.read().blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop a candidate and remember it as rejected.
    pub fn reject(&self, hash: &Hash) {
        let mut inner = self.inner.write();
        inner.blocks.remove(hash);
        inner.status.insert(*hash, BlockStatus::Rejected);
        if inner.preference.as_ref() == Some(hash) {
            inner.preference = None;
        }
    }

    /// Hand a candidate to `state`. The block leaves the cache either way;
    /// its final status records the outcome. If the block could not be
    /// persisted the error is returned and the block is forgotten, so a
    /// later copy of it can be considered again.
    pub fn accept(&self, hash: &Hash, state: &State) -> StateResult<BlockValidationStatus> {
        let block = self
            .inner
            .write()
            .blocks
            .remove(hash)
            .ok_or_else(|| ChainError::NotFound(format!("candidate block {}", to_hex(hash))))?;
        let block = take_or_clone(block);
        let status = match state.accept_next_block(block) {
            Ok(status) => status,
            Err(e) => {
                self.inner.write().status.remove(hash);
                return Err(e);
            }
        };
        let mut inner = self.inner.write();
        let outcome = if status == BlockValidationStatus::Valid {
            BlockStatus::Accepted
        } else {
            BlockStatus::Rejected
        };
        inner.status.insert(*hash, outcome);
        if outcome == BlockStatus::Accepted {
            inner.preference = Some(*hash);
        }
        Ok(status)
    }

    pub fn preference(&self) -> Option<Hash> {
        self.inner.read().preference
    }

    pub fn set_preference(&self, hash: Hash) {
        self.inner.write().preference = Some(hash);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use halcyon_primitives::crypto::key_from_bytes;
    use halcyon_primitives::ZERO_HASH;

    fn block(height: u64) -> Arc<FinalizedBlock> {
        let key = key_from_bytes(&[2; 32]).unwrap();
        Arc::new(FinalizedBlock::create_new_valid_block(vec![], vec![], ZERO_HASH, 1, height, &key).unwrap())
    }

    #[test]
    fn test_take_or_clone() {
        let unique = block(1);
        let expected = (*unique).clone();
        assert_eq!(take_or_clone(unique), expected);

        let shared = block(2);
        let other = shared.clone();
        let taken = take_or_clone(shared);
        assert_eq!(&taken, other.as_ref());
        assert_eq!(Arc::strong_count(&other), 1);
    }

    #[test]
    fn test_status_lifecycle() {
        let tip = ChainTip::new();
        let b = block(1);
        let hash = *b.hash();
        assert_eq!(tip.status(&hash), BlockStatus::Unknown);
        assert!(tip.process_block(b.clone()));
        assert!(!tip.process_block(b));
        assert!(tip.is_processing(&hash));
        assert!(tip.exists(&hash));

        tip.set_preference(hash);
        tip.reject(&hash);
        assert_eq!(tip.status(&hash), BlockStatus::Rejected);
        assert!(!tip.exists(&hash));
        assert!(tip.preference().is_none());
    }
}
