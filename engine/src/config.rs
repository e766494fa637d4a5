//! Node configuration.
//!
//! Plain structs with defaults, deserializable from any serde format.
//! Addresses, hashes and keys are `0x`-prefixed hex strings; the accessor
//! methods parse them and report bad hex as malformed input.

use std::collections::BTreeMap;
use std::time::Duration;

use halcyon_p2p::P2pConfig;
use halcyon_primitives::crypto::key_from_bytes;
use halcyon_primitives::types::{address_from_hex, hash_from_hex};
use halcyon_primitives::{Address, ChainError, ChainId, DecodeOptions, Hash, SigningKey, U256};
use serde::Deserialize;

use crate::error::StateResult;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct GenesisConfig {
    /// Microseconds since the epoch.
    pub timestamp: u64,
    pub prev_hash: String,
    /// Key that signs the genesis block.
    pub signer_key: String,
    /// Initial native balances by address.
    pub balances: BTreeMap<String, U256>,
}

impl Default for GenesisConfig {
    fn default() -> Self {
        Self {
            timestamp: 1_656_356_646_000_000,
            prev_hash: format!("0x{}", "00".repeat(32)),
            signer_key: "0xe89ef6409c467285bcae9f80ab1cfeb3487cfe61ab28fb7d36443e1daa0c2867".into(),
            balances: BTreeMap::new(),
        }
    }
}

impl GenesisConfig {
    pub fn prev_hash(&self) -> StateResult<Hash> {
        Ok(hash_from_hex(&self.prev_hash)?)
    }

    pub fn signer(&self) -> StateResult<SigningKey> {
        parse_key(&self.signer_key)
    }

    pub fn balances(&self) -> StateResult<Vec<(Address, U256)>> {
        self.balances
            .iter()
            .map(|(address, amount)| Ok((address_from_hex(address)?, *amount)))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub chain_id: ChainId,
    /// Advertised to peers in info messages.
    pub node_version: u64,
    /// Participants per round; the validator set must be larger.
    pub min_validators: usize,
    pub validators: Vec<String>,
    pub genesis: GenesisConfig,
    pub decode: DecodeOptions,
    pub p2p: P2pConfig,
    /// Period of state dumps to the key-value store.
    pub dump_interval_ms: u64,
    /// This node's validator key, if it validates.
    pub validator_key: Option<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            chain_id: 8080,
            node_version: 1,
            min_validators: 4,
            validators: Vec::new(),
            genesis: GenesisConfig::default(),
            decode: DecodeOptions::default(),
            p2p: P2pConfig::default(),
            dump_interval_ms: 10_000,
            validator_key: None,
        }
    }
}

impl NodeConfig {
    pub fn validator_addresses(&self) -> StateResult<Vec<Address>> {
        self.validators
            .iter()
            .map(|v| Ok(address_from_hex(v)?))
            .collect()
    }

    pub fn validator_signing_key(&self) -> StateResult<Option<SigningKey>> {
        self.validator_key.as_deref().map(parse_key).transpose()
    }

    pub fn dump_interval(&self) -> Duration {
        Duration::from_millis(self.dump_interval_ms)
    }
}

fn parse_key(hex: &str) -> StateResult<SigningKey> {
    let secret = hash_from_hex(hex)
        .map_err(|_| ChainError::MalformedInput("private key must be 32 bytes of hex".into()))?;
    Ok(key_from_bytes(&secret)?)
}
