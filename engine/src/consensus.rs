//! Rotation consensus with commit-reveal randomness.
//!
//! The validator set is fixed at genesis. For every height the set is
//! shuffled by a deterministic permutation of the best random seed:
//!
//! - index 0 signs the next block
//! - indices `1..=min_validators` each contribute one commit and one
//!   reveal to that block
//!
//! A block carries exactly `2 * min_validators` validator transactions:
//! the commits in participant order, then the reveals in the same order.
//! Each reveal must hash to its commit. On acceptance the block's
//! randomness (the combination of its reveals) becomes the next seed.

use std::collections::BTreeMap;

use halcyon_primitives::crypto::address_of;
use halcyon_primitives::types::to_hex;
use halcyon_primitives::{
    keccak256, Address, BlockHeight, ChainId, ChainResult, FinalizedBlock, Hash, SigningKey,
    ValidatorTx, ValidatorTxKind,
};
use rand::RngCore;

use crate::error::{StateError, StateResult};
use crate::status::TxStatus;

/// Reserved address of the rotation contract.
pub const RDPOS_ADDRESS: Address = [
    0xb2, 0x3a, 0xa5, 0x2d, 0xbe, 0xda, 0x59, 0x27, 0x7a, 0xb8, 0xa9, 0x62, 0xc6, 0x9f, 0x59,
    0x71, 0xf2, 0x29, 0x04, 0xcf,
];

/// Keccak hash chain used as a deterministic random stream.
struct HashChain {
    state: Hash,
    pos: usize,
}

impl HashChain {
    fn new(seed: &Hash) -> Self {
        Self {
            state: keccak256(seed),
            pos: 0,
        }
    }

    fn next_u64(&mut self) -> u64 {
        if self.pos + 8 > self.state.len() {
            self.state = keccak256(&self.state);
            self.pos = 0;
        }
        let mut chunk = [0u8; 8];
        chunk.copy_from_slice(&self.state[self.pos..self.pos + 8]);
        self.pos += 8;
        u64::from_be_bytes(chunk)
    }
}

/// Fisher-Yates over the sorted set, driven by the seed's hash chain.
pub fn shuffle(validators: &[Address], seed: &Hash) -> Vec<Address> {
    let mut list = validators.to_vec();
    list.sort_unstable();
    let mut rng = HashChain::new(seed);
    for i in (1..list.len()).rev() {
        let j = (rng.next_u64() % (i as u64 + 1)) as usize;
        list.swap(i, j);
    }
    list
}

#[derive(Debug, Clone)]
pub struct Rotation {
    chain_id: ChainId,
    validators: Vec<Address>,
    min_validators: usize,
    best_random_seed: Hash,
    random_list: Vec<Address>,
    mempool: BTreeMap<Hash, ValidatorTx>,
    pending_height: BlockHeight,
}

impl Rotation {
    /// The set must be strictly larger than `min_validators` so a proposer
    /// and a full round of participants always exist.
    pub fn new(
        chain_id: ChainId,
        mut validators: Vec<Address>,
        min_validators: usize,
        best_random_seed: Hash,
        pending_height: BlockHeight,
    ) -> StateResult<Self> {
        validators.sort_unstable();
        validators.dedup();
        if min_validators == 0 || validators.len() <= min_validators {
            return Err(StateError::Fatal(format!(
                "{} validators cannot staff rounds of {}",
                validators.len(),
                min_validators
            )));
        }
        let random_list = shuffle(&validators, &best_random_seed);
        Ok(Self {
            chain_id,
            validators,
            min_validators,
            best_random_seed,
            random_list,
            mempool: BTreeMap::new(),
            pending_height,
        })
    }

    pub fn validators(&self) -> &[Address] {
        &self.validators
    }

    pub fn random_list(&self) -> &[Address] {
        &self.random_list
    }

    pub fn min_validators(&self) -> usize {
        self.min_validators
    }

    pub fn best_random_seed(&self) -> &Hash {
        &self.best_random_seed
    }

    pub fn pending_height(&self) -> BlockHeight {
        self.pending_height
    }

    pub fn is_validator(&self, address: &Address) -> bool {
        self.validators.binary_search(address).is_ok()
    }

    /// Signer of the next block.
    pub fn proposer(&self) -> &Address {
        &self.random_list[0]
    }

    /// Validators whose commit and reveal the next block must carry.
    pub fn participants(&self) -> &[Address] {
        &self.random_list[1..=self.min_validators]
    }

    pub fn mempool(&self) -> Vec<ValidatorTx> {
        self.mempool.values().cloned().collect()
    }

    pub fn mempool_size(&self) -> usize {
        self.mempool.len()
    }

    pub fn clear_mempool(&mut self) {
        self.mempool.clear();
    }

    fn commit_of(&self, signer: &Address) -> Option<Hash> {
        self.mempool.values().find_map(|tx| match tx.kind() {
            Ok(ValidatorTxKind::Commit(hash)) if tx.from() == signer => Some(hash),
            _ => None,
        })
    }

    fn has_reveal(&self, signer: &Address) -> bool {
        self.mempool
            .values()
            .any(|tx| tx.from() == signer && matches!(tx.kind(), Ok(ValidatorTxKind::Reveal(_))))
    }

    /// Queue a validator transaction for the pending height.
    pub fn add_validator_tx(&mut self, tx: ValidatorTx) -> TxStatus {
        if tx.chain_id() != self.chain_id {
            return TxStatus::InvalidChainId;
        }
        if tx.height() != self.pending_height {
            return TxStatus::InvalidHeight;
        }
        if !self.participants().contains(tx.from()) {
            return TxStatus::InvalidSigner;
        }
        if self.mempool.contains_key(tx.hash()) {
            return TxStatus::ValidExisting;
        }
        let status = match tx.kind() {
            Ok(ValidatorTxKind::Commit(_)) if self.commit_of(tx.from()).is_some() => {
                TxStatus::InvalidPayload
            }
            Ok(ValidatorTxKind::Commit(_)) => TxStatus::ValidNew,
            Ok(ValidatorTxKind::Reveal(seed)) => match self.commit_of(tx.from()) {
                Some(commit) if commit == keccak256(&seed) && !self.has_reveal(tx.from()) => {
                    TxStatus::ValidNew
                }
                _ => TxStatus::InvalidPayload,
            },
            Err(_) => TxStatus::InvalidPayload,
        };
        if status == TxStatus::ValidNew {
            tracing::debug!(
                from = %to_hex(tx.from()),
                height = tx.height(),
                "Queued validator transaction"
            );
            self.mempool.insert(*tx.hash(), tx);
        }
        status
    }

    /// The full round for the pending height in block order, once every
    /// participant has both committed and revealed.
    pub fn round_transactions(&self) -> Option<Vec<ValidatorTx>> {
        let find = |signer: &Address, want_commit: bool| {
            self.mempool.values().find(|tx| {
                tx.from() == signer
                    && matches!(
                        (tx.kind(), want_commit),
                        (Ok(ValidatorTxKind::Commit(_)), true) | (Ok(ValidatorTxKind::Reveal(_)), false)
                    )
            })
        };
        let mut commits = Vec::with_capacity(self.min_validators);
        let mut reveals = Vec::with_capacity(self.min_validators);
        for signer in self.participants() {
            commits.push(find(signer, true)?.clone());
            reveals.push(find(signer, false)?.clone());
        }
        commits.extend(reveals);
        Some(commits)
    }

    /// Check the block's signer and validator round against the current
    /// seed. Logs the first reason for rejection.
    pub fn validate_block(&self, block: &FinalizedBlock) -> bool {
        let txs = block.validator_txs();
        let min = self.min_validators;
        if txs.len() != 2 * min {
            tracing::warn!(
                height = block.height(),
                found = txs.len(),
                expected = 2 * min,
                "Block has the wrong number of validator transactions"
            );
            return false;
        }
        if block.validator_address() != self.proposer() {
            tracing::warn!(
                height = block.height(),
                signer = %to_hex(block.validator_address()),
                proposer = %to_hex(self.proposer()),
                "Block signed by a validator other than the proposer"
            );
            return false;
        }
        for (i, participant) in self.participants().iter().enumerate() {
            let (commit, reveal) = (&txs[i], &txs[min + i]);
            if commit.from() != participant || reveal.from() != participant {
                tracing::warn!(
                    height = block.height(),
                    slot = i,
                    "Validator transaction out of rotation order"
                );
                return false;
            }
            if commit.height() != block.height() || reveal.height() != block.height() {
                tracing::warn!(
                    height = block.height(),
                    slot = i,
                    "Validator transaction for another height"
                );
                return false;
            }
            match (commit.kind(), reveal.kind()) {
                (Ok(ValidatorTxKind::Commit(hash)), Ok(ValidatorTxKind::Reveal(seed)))
                    if hash == keccak256(&seed) => {}
                _ => {
                    tracing::warn!(
                        height = block.height(),
                        slot = i,
                        "Reveal does not match its commit"
                    );
                    return false;
                }
            }
        }
        true
    }

    /// Advance to the seed of an accepted block. Returns the new seed.
    pub fn process_block(&mut self, block: &FinalizedBlock) -> Hash {
        self.best_random_seed = *block.block_randomness();
        self.random_list = shuffle(&self.validators, &self.best_random_seed);
        let height = block.height();
        self.mempool.retain(|_, tx| tx.height() > height);
        self.pending_height = height + 1;
        self.best_random_seed
    }
}

/// One validator's side of a commit-reveal round.
pub struct ValidatorRound {
    key: SigningKey,
    seed: Hash,
}

impl ValidatorRound {
    /// A round with a fresh random seed.
    pub fn new(key: SigningKey) -> Self {
        let mut seed = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut seed);
        Self::with_seed(key, seed)
    }

    pub fn with_seed(key: SigningKey, seed: Hash) -> Self {
        Self { key, seed }
    }

    pub fn address(&self) -> Address {
        address_of(&self.key)
    }

    pub fn seed(&self) -> &Hash {
        &self.seed
    }

    pub fn commit(&self, height: BlockHeight, chain_id: ChainId) -> ChainResult<ValidatorTx> {
        ValidatorTx::commit(&self.seed, height, chain_id, &self.key)
    }

    pub fn reveal(&self, height: BlockHeight, chain_id: ChainId) -> ChainResult<ValidatorTx> {
        ValidatorTx::reveal(&self.seed, height, chain_id, &self.key)
    }
}
