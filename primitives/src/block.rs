//! Block format: mutable assembly, finalization and the wire layout.
//!
//! ## Wire Format (big-endian)
//!
//! ```text
//! offset  size  field
//!      0    65  signer signature (r, s, v)
//!     65    32  previous block hash
//!     97    32  block randomness
//!    129    32  validator-transaction Merkle root
//!    161    32  ledger-transaction Merkle root
//!    193     8  timestamp (microseconds)
//!    201     8  height
//!    209     8  start offset of the validator-transaction region
//!    217     -  ledger transactions: repeated [u32 length][bytes]
//!      *     -  validator transactions: repeated [u32 length][bytes]
//! ```
//!
//! The block hash is `keccak` of bytes 65..209 (the header without the
//! signature and without the region offset). The proposer signs that hash.
//!
//! A [`MutableBlock`] is assembled locally or parsed from bytes; the only
//! way to obtain a [`FinalizedBlock`] is through [`MutableBlock::finalize`]
//! or the fully verifying [`FinalizedBlock::from_bytes`].

use std::ops::Range;

use rayon::prelude::*;
use serde::Deserialize;

use crate::codec::{split_frames, write_framed, write_u64, Reader};
use crate::crypto::{self, keccak256, PublicKey, Signature, SigningKey};
use crate::error::{ChainError, ChainResult};
use crate::merkle::merkle_root;
use crate::tx::Transaction;
use crate::types::{Address, BlockHeight, ChainId, Hash, ZERO_HASH};
use crate::validator_tx::{block_randomness, ValidatorTx};

/// Size of the fixed block header including the signature.
pub const BLOCK_HEADER_SIZE: usize = 217;

/// Bytes covered by the block hash (prev hash .. height).
const HASHED_HEADER_SIZE: usize = 32 * 4 + 8 + 8;

/// Ledger-transaction count above which decoding is split across workers.
pub const PARALLEL_DECODE_THRESHOLD: usize = 2000;

/// How block bodies are decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DecodeOptions {
    /// Number of decode partitions. `1` forces the serial path.
    pub workers: usize,
    /// Minimum ledger-transaction count for the parallel path.
    pub parallel_threshold: usize,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            parallel_threshold: PARALLEL_DECODE_THRESHOLD,
        }
    }
}

impl DecodeOptions {
    pub fn serial() -> Self {
        Self {
            workers: 1,
            ..Self::default()
        }
    }

    fn use_parallel(&self, tx_count: usize) -> bool {
        self.workers > 1 && tx_count > self.parallel_threshold
    }
}

/// Split `total` items into `workers` contiguous ranges of equal size,
/// the remainder going to the last range. Empty ranges are omitted.
pub fn partition(total: usize, workers: usize) -> Vec<Range<usize>> {
    let workers = workers.max(1);
    let per = total / workers;
    let mut ranges = Vec::with_capacity(workers);
    let mut start = 0;
    for i in 0..workers {
        let end = if i + 1 == workers { total } else { start + per };
        if end > start {
            ranges.push(start..end);
        }
        start = end;
    }
    ranges
}

/// Decode framed ledger transactions, in parallel when worthwhile.
///
/// Each partition owns a disjoint contiguous index range. Results are
/// gathered by partition index and concatenated in order once every
/// partition has finished.
pub fn decode_transactions(
    frames: &[&[u8]],
    chain_id: ChainId,
    options: &DecodeOptions,
) -> ChainResult<Vec<Transaction>> {
    if !options.use_parallel(frames.len()) {
        return frames
            .iter()
            .map(|raw| Transaction::from_bytes(raw, chain_id))
            .collect();
    }

    let ranges = partition(frames.len(), options.workers);
    tracing::debug!(
        txs = frames.len(),
        partitions = ranges.len(),
        "Decoding block transactions in parallel"
    );
    let parts: Vec<ChainResult<Vec<Transaction>>> = ranges
        .into_par_iter()
        .map(|range| {
            frames[range]
                .iter()
                .map(|raw| Transaction::from_bytes(raw, chain_id))
                .collect()
        })
        .collect();

    let mut txs = Vec::with_capacity(frames.len());
    for part in parts {
        txs.extend(part?);
    }
    Ok(txs)
}

/// A block under construction or freshly parsed; not yet finalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutableBlock {
    prev_block_hash: Hash,
    block_randomness: Hash,
    validator_merkle_root: Hash,
    tx_merkle_root: Hash,
    timestamp: u64,
    height: BlockHeight,
    txs: Vec<Transaction>,
    validator_txs: Vec<ValidatorTx>,
    /// Signature read from the wire, if this block was parsed.
    signature: Option<Signature>,
}

impl MutableBlock {
    /// Start assembling a block. `timestamp` is the minimum timestamp the
    /// finalized block may carry.
    pub fn new(prev_block_hash: Hash, timestamp: u64, height: BlockHeight) -> Self {
        Self {
            prev_block_hash,
            block_randomness: ZERO_HASH,
            validator_merkle_root: ZERO_HASH,
            tx_merkle_root: ZERO_HASH,
            timestamp,
            height,
            txs: Vec::new(),
            validator_txs: Vec::new(),
            signature: None,
        }
    }

    pub fn append_tx(&mut self, tx: Transaction) {
        self.txs.push(tx);
    }

    /// Append a validator transaction. Its height must be this block's.
    pub fn append_validator_tx(&mut self, tx: ValidatorTx) -> ChainResult<()> {
        if tx.height() != self.height {
            return Err(ChainError::InvalidBlock(format!(
                "validator tx height {} does not match block height {}",
                tx.height(),
                self.height
            )));
        }
        self.validator_txs.push(tx);
        Ok(())
    }

    /// Parse a block from its wire encoding.
    ///
    /// Structural checks only: sizes, framing, transaction signatures and
    /// validator-transaction heights. Header commitments are checked by
    /// [`FinalizedBlock::from_bytes`].
    pub fn from_bytes(bytes: &[u8], chain_id: ChainId, options: &DecodeOptions) -> ChainResult<Self> {
        if bytes.len() < BLOCK_HEADER_SIZE {
            return Err(ChainError::MalformedInput(format!(
                "block must be at least {} bytes, got {}",
                BLOCK_HEADER_SIZE,
                bytes.len()
            )));
        }
        let mut r = Reader::new(bytes);
        let signature = Signature::from_slice(r.read_bytes(Signature::LEN)?)?;
        let prev_block_hash = r.read_hash()?;
        let block_randomness = r.read_hash()?;
        let validator_merkle_root = r.read_hash()?;
        let tx_merkle_root = r.read_hash()?;
        let timestamp = r.read_u64()?;
        let height = r.read_u64()?;
        let validator_start = usize::try_from(r.read_u64()?)
            .ok()
            .filter(|start| (BLOCK_HEADER_SIZE..=bytes.len()).contains(start))
            .ok_or_else(|| ChainError::MalformedInput("validator region offset out of range".into()))?;

        let tx_frames = split_frames(&bytes[BLOCK_HEADER_SIZE..validator_start])?;
        let validator_frames = split_frames(&bytes[validator_start..])?;

        let txs = decode_transactions(&tx_frames, chain_id, options)?;

        let mut validator_txs = Vec::with_capacity(validator_frames.len());
        for raw in validator_frames {
            let tx = ValidatorTx::from_bytes(raw, chain_id)?;
            if tx.height() != height {
                return Err(ChainError::InvalidBlock(format!(
                    "validator tx height {} does not match block height {}",
                    tx.height(),
                    height
                )));
            }
            validator_txs.push(tx);
        }

        Ok(Self {
            prev_block_hash,
            block_randomness,
            validator_merkle_root,
            tx_merkle_root,
            timestamp,
            height,
            txs,
            validator_txs,
            signature: Some(signature),
        })
    }

    /// Sign and seal the block.
    ///
    /// `new_timestamp` must not be earlier than the timestamp the block was
    /// created with. Roots and randomness are recomputed from the lists.
    pub fn finalize(mut self, key: &SigningKey, new_timestamp: u64) -> ChainResult<FinalizedBlock> {
        if new_timestamp < self.timestamp {
            return Err(ChainError::InvalidBlock(format!(
                "timestamp {} is earlier than block minimum {}",
                new_timestamp, self.timestamp
            )));
        }
        self.timestamp = new_timestamp;
        self.tx_merkle_root = tx_root(&self.txs);
        self.validator_merkle_root = validator_root(&self.validator_txs);
        self.block_randomness = block_randomness(&self.validator_txs)?;

        let hash = keccak256(&self.serialize_header());
        let signature = crypto::sign(&hash, key)?;
        let validator_pubkey = crypto::recover(&signature, &hash)?;
        if validator_pubkey != crypto::public_key(key) {
            return Err(ChainError::Signature("recovered key differs from signer".into()));
        }

        Ok(FinalizedBlock {
            signature,
            validator_pubkey,
            validator_address: crypto::address_from_public_key(&validator_pubkey),
            prev_block_hash: self.prev_block_hash,
            block_randomness: self.block_randomness,
            validator_merkle_root: self.validator_merkle_root,
            tx_merkle_root: self.tx_merkle_root,
            timestamp: self.timestamp,
            height: self.height,
            txs: self.txs,
            validator_txs: self.validator_txs,
            hash,
        })
    }

    /// The hashed part of the header: everything but the signature.
    pub fn serialize_header(&self) -> Vec<u8> {
        header_bytes(
            &self.prev_block_hash,
            &self.block_randomness,
            &self.validator_merkle_root,
            &self.tx_merkle_root,
            self.timestamp,
            self.height,
        )
    }

    pub fn height(&self) -> BlockHeight {
        self.height
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn prev_block_hash(&self) -> &Hash {
        &self.prev_block_hash
    }

    pub fn txs(&self) -> &[Transaction] {
        &self.txs
    }

    pub fn validator_txs(&self) -> &[ValidatorTx] {
        &self.validator_txs
    }
}

/// A signed, immutable block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizedBlock {
    signature: Signature,
    validator_pubkey: PublicKey,
    validator_address: Address,
    prev_block_hash: Hash,
    block_randomness: Hash,
    validator_merkle_root: Hash,
    tx_merkle_root: Hash,
    timestamp: u64,
    height: BlockHeight,
    txs: Vec<Transaction>,
    validator_txs: Vec<ValidatorTx>,
    hash: Hash,
}

impl FinalizedBlock {
    /// Parse and fully verify a block.
    ///
    /// On top of [`MutableBlock::from_bytes`], checks that both Merkle roots
    /// and the randomness match the transaction lists and that the
    /// signature recovers to a public key.
    pub fn from_bytes(bytes: &[u8], chain_id: ChainId, options: &DecodeOptions) -> ChainResult<Self> {
        let block = MutableBlock::from_bytes(bytes, chain_id, options)?;

        let expected_tx_root = tx_root(&block.txs);
        if expected_tx_root != block.tx_merkle_root {
            return Err(ChainError::InvalidBlock("ledger transaction Merkle root mismatch".into()));
        }
        let expected_validator_root = validator_root(&block.validator_txs);
        if expected_validator_root != block.validator_merkle_root {
            return Err(ChainError::InvalidBlock("validator transaction Merkle root mismatch".into()));
        }
        if block_randomness(&block.validator_txs)? != block.block_randomness {
            return Err(ChainError::InvalidBlock("block randomness does not match reveals".into()));
        }

        let hash = keccak256(&block.serialize_header());
        let signature = block
            .signature
            .ok_or_else(|| ChainError::InvalidBlock("parsed block carries no signature".into()))?;
        let validator_pubkey = crypto::recover(&signature, &hash)?;

        Ok(Self {
            signature,
            validator_pubkey,
            validator_address: crypto::address_from_public_key(&validator_pubkey),
            prev_block_hash: block.prev_block_hash,
            block_randomness: block.block_randomness,
            validator_merkle_root: block.validator_merkle_root,
            tx_merkle_root: block.tx_merkle_root,
            timestamp: block.timestamp,
            height: block.height,
            txs: block.txs,
            validator_txs: block.validator_txs,
            hash,
        })
    }

    /// Assemble, finalize and return a block in one step.
    pub fn create_new_valid_block(
        txs: Vec<Transaction>,
        validator_txs: Vec<ValidatorTx>,
        prev_block_hash: Hash,
        timestamp: u64,
        height: BlockHeight,
        key: &SigningKey,
    ) -> ChainResult<Self> {
        let mut block = MutableBlock::new(prev_block_hash, timestamp, height);
        for tx in txs {
            block.append_tx(tx);
        }
        for tx in validator_txs {
            block.append_validator_tx(tx)?;
        }
        block.finalize(key, timestamp)
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut tx_region = Vec::new();
        for tx in &self.txs {
            write_framed(&mut tx_region, &tx.to_bytes());
        }
        let mut validator_region = Vec::new();
        for tx in &self.validator_txs {
            write_framed(&mut validator_region, &tx.to_bytes());
        }

        let mut out =
            Vec::with_capacity(BLOCK_HEADER_SIZE + tx_region.len() + validator_region.len());
        out.extend_from_slice(&self.signature.to_bytes());
        out.extend_from_slice(&self.serialize_header());
        write_u64(&mut out, (BLOCK_HEADER_SIZE + tx_region.len()) as u64);
        out.extend_from_slice(&tx_region);
        out.extend_from_slice(&validator_region);
        out
    }

    pub fn serialize_header(&self) -> Vec<u8> {
        header_bytes(
            &self.prev_block_hash,
            &self.block_randomness,
            &self.validator_merkle_root,
            &self.tx_merkle_root,
            self.timestamp,
            self.height,
        )
    }

    pub fn hash(&self) -> &Hash {
        &self.hash
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn validator_pubkey(&self) -> &PublicKey {
        &self.validator_pubkey
    }

    /// Address of the proposer that signed this block.
    pub fn validator_address(&self) -> &Address {
        &self.validator_address
    }

    pub fn prev_block_hash(&self) -> &Hash {
        &self.prev_block_hash
    }

    pub fn block_randomness(&self) -> &Hash {
        &self.block_randomness
    }

    pub fn validator_merkle_root(&self) -> &Hash {
        &self.validator_merkle_root
    }

    pub fn tx_merkle_root(&self) -> &Hash {
        &self.tx_merkle_root
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn height(&self) -> BlockHeight {
        self.height
    }

    pub fn txs(&self) -> &[Transaction] {
        &self.txs
    }

    pub fn validator_txs(&self) -> &[ValidatorTx] {
        &self.validator_txs
    }
}

fn header_bytes(
    prev_block_hash: &Hash,
    block_randomness: &Hash,
    validator_merkle_root: &Hash,
    tx_merkle_root: &Hash,
    timestamp: u64,
    height: BlockHeight,
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HASHED_HEADER_SIZE);
    buf.extend_from_slice(prev_block_hash);
    buf.extend_from_slice(block_randomness);
    buf.extend_from_slice(validator_merkle_root);
    buf.extend_from_slice(tx_merkle_root);
    write_u64(&mut buf, timestamp);
    write_u64(&mut buf, height);
    buf
}

fn tx_root(txs: &[Transaction]) -> Hash {
    let hashes: Vec<Hash> = txs.iter().map(|tx| *tx.hash()).collect();
    merkle_root(&hashes)
}

fn validator_root(txs: &[ValidatorTx]) -> Hash {
    let hashes: Vec<Hash> = txs.iter().map(|tx| *tx.hash()).collect();
    merkle_root(&hashes)
}
