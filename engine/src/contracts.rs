//! The contract table.
//!
//! Contracts form a closed set of kinds. Looking a contract up "as" a
//! particular kind yields [`StateError::WrongContractKind`] on mismatch;
//! there is no runtime type inspection.
//!
//! - [`ContractManager`]: protocol contract at [`CONTRACT_MANAGER_ADDRESS`]
//!   that deploys native contracts
//! - [`Erc20`]: native fungible token
//! - [`EvmContract`]: bytecode run by the external execution engine
//!
//! Native contracts are called with ABI-encoded calldata and answer with
//! ABI-encoded return data.

use std::collections::BTreeMap;
use std::fmt;

use halcyon_primitives::abi::{self, AbiType, AbiValue};
use halcyon_primitives::arith::{checked_add, checked_sub, to_u64};
use halcyon_primitives::codec::{write_framed, write_u256, write_u32, write_u8, Reader};
use halcyon_primitives::crypto::keccak256_concat;
use halcyon_primitives::{keccak256, Address, Hash, U256};

use crate::error::{StateError, StateResult};
use crate::vm::EmittedEvent;

/// Address of the protocol contract manager.
pub const CONTRACT_MANAGER_ADDRESS: Address = [
    0x00, 0x01, 0xcb, 0x47, 0xea, 0x6d, 0x8b, 0x55, 0xfe, 0x44, 0xfd, 0xd6, 0xb1, 0xbd, 0xb5,
    0x79, 0xef, 0xb4, 0x3e, 0x61,
];

/// Address of a contract created by `sender` at `nonce`.
pub fn derive_contract_address(sender: &Address, nonce: u64) -> Address {
    let hash = keccak256_concat(&[sender, &nonce.to_be_bytes()]);
    let mut address = [0u8; 20];
    address.copy_from_slice(&hash[12..]);
    address
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContractTag {
    ContractManager,
    Erc20,
    Evm,
}

impl ContractTag {
    fn byte(self) -> u8 {
        match self {
            Self::ContractManager => 0,
            Self::Erc20 => 1,
            Self::Evm => 2,
        }
    }
}

impl fmt::Display for ContractTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ContractManager => write!(f, "ContractManager"),
            Self::Erc20 => write!(f, "ERC20"),
            Self::Evm => write!(f, "EVM"),
        }
    }
}

/// A native contract call.
#[derive(Debug, Clone)]
pub struct NativeCall<'a> {
    pub caller: Address,
    pub contract: Address,
    pub data: &'a [u8],
    /// The caller's nonce before this transaction; seeds created addresses.
    pub nonce: u64,
}

#[derive(Debug, Clone, Default)]
pub struct CallOutput {
    pub return_data: Vec<u8>,
    pub events: Vec<EmittedEvent>,
    /// A contract to add to the table at the given address.
    pub deploy: Option<(Address, ContractKind)>,
}

impl CallOutput {
    fn returning(return_data: Vec<u8>) -> Self {
        Self {
            return_data,
            ..Self::default()
        }
    }
}

/// Capability interface of contracts implemented in the node.
pub trait NativeContract {
    fn tag(&self) -> ContractTag;

    /// State-changing call.
    fn call(&mut self, call: &NativeCall<'_>) -> StateResult<CallOutput>;

    /// Read-only call.
    fn view(&self, call: &NativeCall<'_>) -> StateResult<Vec<u8>>;
}

fn split_selector(data: &[u8]) -> StateResult<([u8; 4], &[u8])> {
    if data.len() < 4 {
        return Err(StateError::Reverted("calldata shorter than a selector".into()));
    }
    Ok(([data[0], data[1], data[2], data[3]], &data[4..]))
}

fn is(selector: &[u8; 4], signature: &str) -> StateResult<bool> {
    Ok(*selector == abi::selector(signature)?)
}

fn unknown(selector: &[u8; 4], tag: ContractTag) -> StateError {
    StateError::Reverted(format!(
        "{} has no function with selector {}",
        tag,
        halcyon_primitives::types::to_hex(selector)
    ))
}

fn address_topic(address: &Address) -> Hash {
    let mut word = [0u8; 32];
    word[12..].copy_from_slice(address);
    word
}

// ── ERC-20 ──

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Erc20 {
    name: String,
    symbol: String,
    decimals: u8,
    total_supply: U256,
    balances: BTreeMap<Address, U256>,
    allowances: BTreeMap<(Address, Address), U256>,
}

impl Erc20 {
    /// A token with its whole supply minted to `owner`.
    pub fn new(name: String, symbol: String, decimals: u8, supply: U256, owner: Address) -> Self {
        let mut balances = BTreeMap::new();
        if !supply.is_zero() {
            balances.insert(owner, supply);
        }
        Self {
            name,
            symbol,
            decimals,
            total_supply: supply,
            balances,
            allowances: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn decimals(&self) -> u8 {
        self.decimals
    }

    pub fn total_supply(&self) -> U256 {
        self.total_supply
    }

    pub fn balance_of(&self, owner: &Address) -> U256 {
        self.balances.get(owner).copied().unwrap_or_default()
    }

    pub fn allowance(&self, owner: &Address, spender: &Address) -> U256 {
        self.allowances
            .get(&(*owner, *spender))
            .copied()
            .unwrap_or_default()
    }

    pub fn transfer_balance(&mut self, from: &Address, to: &Address, amount: U256) -> StateResult<()> {
        let debited = checked_sub(self.balance_of(from), amount)?;
        self.balances.insert(*from, debited);
        let credited = checked_add(self.balance_of(to), amount)?;
        self.balances.insert(*to, credited);
        Ok(())
    }

    fn transfer_event(&self, contract: Address, from: &Address, to: &Address, amount: U256) -> StateResult<EmittedEvent> {
        Ok(EmittedEvent {
            name: "Transfer".into(),
            address: contract,
            topics: vec![
                keccak256(b"Transfer(address,address,uint256)"),
                address_topic(from),
                address_topic(to),
            ],
            data: abi::encode(&[AbiValue::Uint256(amount)])?,
            anonymous: false,
        })
    }

    fn to_bytes(&self, buf: &mut Vec<u8>) {
        write_framed(buf, self.name.as_bytes());
        write_framed(buf, self.symbol.as_bytes());
        write_u8(buf, self.decimals);
        write_u256(buf, &self.total_supply);
        write_u32(buf, self.balances.len() as u32);
        for (owner, amount) in &self.balances {
            buf.extend_from_slice(owner);
            write_u256(buf, amount);
        }
        write_u32(buf, self.allowances.len() as u32);
        for ((owner, spender), amount) in &self.allowances {
            buf.extend_from_slice(owner);
            buf.extend_from_slice(spender);
            write_u256(buf, amount);
        }
    }

    fn from_reader(r: &mut Reader<'_>) -> StateResult<Self> {
        let name = utf8(r.read_framed()?)?;
        let symbol = utf8(r.read_framed()?)?;
        let decimals = r.read_u8()?;
        let total_supply = r.read_u256()?;
        let mut balances = BTreeMap::new();
        for _ in 0..r.read_u32()? {
            let owner = r.read_address()?;
            balances.insert(owner, r.read_u256()?);
        }
        let mut allowances = BTreeMap::new();
        for _ in 0..r.read_u32()? {
            let owner = r.read_address()?;
            let spender = r.read_address()?;
            allowances.insert((owner, spender), r.read_u256()?);
        }
        Ok(Self {
            name,
            symbol,
            decimals,
            total_supply,
            balances,
            allowances,
        })
    }
}

impl NativeContract for Erc20 {
    fn tag(&self) -> ContractTag {
        ContractTag::Erc20
    }

    fn call(&mut self, call: &NativeCall<'_>) -> StateResult<CallOutput> {
        let (selector, args) = split_selector(call.data)?;

        if is(&selector, "transfer(address,uint256)")? {
            let values = abi::decode(&[AbiType::Address, AbiType::Uint256], args)?;
            let (to, amount) = (values[0].as_address()?, values[1].as_u256()?);
            self.transfer_balance(&call.caller, &to, amount)?;
            return Ok(CallOutput {
                return_data: abi::encode(&[AbiValue::Bool(true)])?,
                events: vec![self.transfer_event(call.contract, &call.caller, &to, amount)?],
                deploy: None,
            });
        }
        if is(&selector, "approve(address,uint256)")? {
            let values = abi::decode(&[AbiType::Address, AbiType::Uint256], args)?;
            let (spender, amount) = (values[0].as_address()?, values[1].as_u256()?);
            self.allowances.insert((call.caller, spender), amount);
            let event = EmittedEvent {
                name: "Approval".into(),
                address: call.contract,
                topics: vec![
                    keccak256(b"Approval(address,address,uint256)"),
                    address_topic(&call.caller),
                    address_topic(&spender),
                ],
                data: abi::encode(&[AbiValue::Uint256(amount)])?,
                anonymous: false,
            };
            return Ok(CallOutput {
                return_data: abi::encode(&[AbiValue::Bool(true)])?,
                events: vec![event],
                deploy: None,
            });
        }
        if is(&selector, "transferFrom(address,address,uint256)")? {
            let values = abi::decode(&[AbiType::Address, AbiType::Address, AbiType::Uint256], args)?;
            let (from, to, amount) = (
                values[0].as_address()?,
                values[1].as_address()?,
                values[2].as_u256()?,
            );
            let allowed = checked_sub(self.allowance(&from, &call.caller), amount)?;
            self.transfer_balance(&from, &to, amount)?;
            self.allowances.insert((from, call.caller), allowed);
            return Ok(CallOutput {
                return_data: abi::encode(&[AbiValue::Bool(true)])?,
                events: vec![self.transfer_event(call.contract, &from, &to, amount)?],
                deploy: None,
            });
        }
        self.view(call).map(CallOutput::returning)
    }

    fn view(&self, call: &NativeCall<'_>) -> StateResult<Vec<u8>> {
        let (selector, args) = split_selector(call.data)?;
        let value = if is(&selector, "name()")? {
            AbiValue::String(self.name.clone())
        } else if is(&selector, "symbol()")? {
            AbiValue::String(self.symbol.clone())
        } else if is(&selector, "decimals()")? {
            AbiValue::Uint256(U256::from(self.decimals))
        } else if is(&selector, "totalSupply()")? {
            AbiValue::Uint256(self.total_supply)
        } else if is(&selector, "balanceOf(address)")? {
            let values = abi::decode(&[AbiType::Address], args)?;
            AbiValue::Uint256(self.balance_of(&values[0].as_address()?))
        } else if is(&selector, "allowance(address,address)")? {
            let values = abi::decode(&[AbiType::Address, AbiType::Address], args)?;
            AbiValue::Uint256(self.allowance(&values[0].as_address()?, &values[1].as_address()?))
        } else {
            return Err(unknown(&selector, self.tag()));
        };
        Ok(abi::encode(&[value])?)
    }
}

// ── Contract manager ──

/// Deploys native contracts and remembers what it deployed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContractManager {
    deployed: Vec<(ContractTag, Address)>,
}

impl ContractManager {
    pub fn deployed(&self) -> &[(ContractTag, Address)] {
        &self.deployed
    }

    fn to_bytes(&self, buf: &mut Vec<u8>) {
        write_u32(buf, self.deployed.len() as u32);
        for (tag, address) in &self.deployed {
            write_u8(buf, tag.byte());
            buf.extend_from_slice(address);
        }
    }

    fn from_reader(r: &mut Reader<'_>) -> StateResult<Self> {
        let mut deployed = Vec::new();
        for _ in 0..r.read_u32()? {
            let tag = tag_from_byte(r.read_u8()?)?;
            deployed.push((tag, r.read_address()?));
        }
        Ok(Self { deployed })
    }
}

impl NativeContract for ContractManager {
    fn tag(&self) -> ContractTag {
        ContractTag::ContractManager
    }

    fn call(&mut self, call: &NativeCall<'_>) -> StateResult<CallOutput> {
        let (selector, args) = split_selector(call.data)?;
        if !is(&selector, "createNewERC20Contract(string,string,uint256,uint256)")? {
            return self.view(call).map(CallOutput::returning);
        }
        let values = abi::decode(
            &[AbiType::String, AbiType::String, AbiType::Uint256, AbiType::Uint256],
            args,
        )?;
        let decimals = u8::try_from(to_u64(values[2].as_u256()?)?)
            .map_err(|_| StateError::Reverted("decimals must fit in 8 bits".into()))?;
        let token = Erc20::new(
            values[0].as_str()?.to_string(),
            values[1].as_str()?.to_string(),
            decimals,
            values[3].as_u256()?,
            call.caller,
        );
        let address = derive_contract_address(&call.caller, call.nonce);
        self.deployed.push((ContractTag::Erc20, address));
        tracing::debug!(
            address = %halcyon_primitives::types::to_hex(&address),
            symbol = token.symbol(),
            "Deployed native ERC20"
        );
        Ok(CallOutput {
            return_data: abi::encode(&[AbiValue::Address(address)])?,
            events: Vec::new(),
            deploy: Some((address, ContractKind::Erc20(token))),
        })
    }

    fn view(&self, call: &NativeCall<'_>) -> StateResult<Vec<u8>> {
        let (selector, _) = split_selector(call.data)?;
        if !is(&selector, "getDeployedContracts()")? {
            return Err(unknown(&selector, self.tag()));
        }
        let names = self
            .deployed
            .iter()
            .map(|(tag, _)| AbiValue::String(tag.to_string()))
            .collect();
        let addresses = self
            .deployed
            .iter()
            .map(|(_, address)| AbiValue::Address(*address))
            .collect();
        Ok(abi::encode(&[
            AbiValue::Array(AbiType::String, names),
            AbiValue::Array(AbiType::Address, addresses),
        ])?)
    }
}

// ── Bytecode contracts ──

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvmContract {
    pub code: Vec<u8>,
}

// ── The closed set ──

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContractKind {
    ContractManager(ContractManager),
    Erc20(Erc20),
    Evm(EvmContract),
}

impl ContractKind {
    pub fn tag(&self) -> ContractTag {
        match self {
            Self::ContractManager(_) => ContractTag::ContractManager,
            Self::Erc20(_) => ContractTag::Erc20,
            Self::Evm(_) => ContractTag::Evm,
        }
    }

    fn mismatch(&self, expected: ContractTag) -> StateError {
        StateError::WrongContractKind {
            expected,
            found: self.tag(),
        }
    }

    pub fn as_erc20(&self) -> StateResult<&Erc20> {
        match self {
            Self::Erc20(token) => Ok(token),
            other => Err(other.mismatch(ContractTag::Erc20)),
        }
    }

    pub fn as_erc20_mut(&mut self) -> StateResult<&mut Erc20> {
        match self {
            Self::Erc20(token) => Ok(token),
            other => Err(other.mismatch(ContractTag::Erc20)),
        }
    }

    pub fn as_manager(&self) -> StateResult<&ContractManager> {
        match self {
            Self::ContractManager(manager) => Ok(manager),
            other => Err(other.mismatch(ContractTag::ContractManager)),
        }
    }

    pub fn as_evm(&self) -> StateResult<&EvmContract> {
        match self {
            Self::Evm(contract) => Ok(contract),
            other => Err(other.mismatch(ContractTag::Evm)),
        }
    }

    /// The native capability, if this contract runs in the node.
    pub fn native(&self) -> Option<&dyn NativeContract> {
        match self {
            Self::ContractManager(manager) => Some(manager),
            Self::Erc20(token) => Some(token),
            Self::Evm(_) => None,
        }
    }

    pub fn native_mut(&mut self) -> Option<&mut dyn NativeContract> {
        match self {
            Self::ContractManager(manager) => Some(manager),
            Self::Erc20(token) => Some(token),
            Self::Evm(_) => None,
        }
    }

    /// `tag (1) || body`
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        write_u8(&mut buf, self.tag().byte());
        match self {
            Self::ContractManager(manager) => manager.to_bytes(&mut buf),
            Self::Erc20(token) => token.to_bytes(&mut buf),
            Self::Evm(contract) => write_framed(&mut buf, &contract.code),
        }
        buf
    }

    /// Malformed records are [`StateError::Fatal`].
    pub fn from_bytes(bytes: &[u8]) -> StateResult<Self> {
        let parse = || -> StateResult<Self> {
            let mut r = Reader::new(bytes);
            let contract = match tag_from_byte(r.read_u8()?)? {
                ContractTag::ContractManager => Self::ContractManager(ContractManager::from_reader(&mut r)?),
                ContractTag::Erc20 => Self::Erc20(Erc20::from_reader(&mut r)?),
                ContractTag::Evm => Self::Evm(EvmContract {
                    code: r.read_framed()?.to_vec(),
                }),
            };
            if !r.is_empty() {
                return Err(StateError::Fatal(format!(
                    "{} trailing bytes after contract record",
                    r.remaining()
                )));
            }
            Ok(contract)
        };
        parse().map_err(|e| match e {
            StateError::Fatal(_) => e,
            other => StateError::Fatal(format!("corrupt contract record: {}", other)),
        })
    }
}

fn tag_from_byte(byte: u8) -> StateResult<ContractTag> {
    match byte {
        0 => Ok(ContractTag::ContractManager),
        1 => Ok(ContractTag::Erc20),
        2 => Ok(ContractTag::Evm),
        other => Err(StateError::Fatal(format!("unknown contract tag {}", other))),
    }
}

fn utf8(bytes: &[u8]) -> StateResult<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|_| StateError::Fatal("contract string is not UTF-8".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use halcyon_primitives::types::address_from_hex;

    const OWNER: Address = [1; 20];
    const TOKEN: Address = [7; 20];

    fn token() -> Erc20 {
        Erc20::new("Token".into(), "TKN".into(), 18, U256::from(1_000), OWNER)
    }

    fn call_data(signature: &str, values: &[AbiValue]) -> Vec<u8> {
        abi::encode_call(signature, values).unwrap()
    }

    fn native_call(caller: Address, data: &[u8]) -> NativeCall<'_> {
        NativeCall {
            caller,
            contract: TOKEN,
            data,
            nonce: 0,
        }
    }

    #[test]
    fn test_manager_address_matches_hex() {
        assert_eq!(
            address_from_hex("0x0001cb47ea6d8b55fe44fdd6b1bdb579efb43e61").unwrap(),
            CONTRACT_MANAGER_ADDRESS
        );
    }

    #[test]
    fn test_erc20_views() {
        let token = token();
        let data = call_data("balanceOf(address)", &[AbiValue::Address(OWNER)]);
        let out = token.view(&native_call([9; 20], &data)).unwrap();
        assert_eq!(
            abi::decode(&[AbiType::Uint256], &out).unwrap(),
            vec![AbiValue::Uint256(U256::from(1_000))]
        );

        let data = call_data("symbol()", &[]);
        let out = token.view(&native_call([9; 20], &data)).unwrap();
        assert_eq!(
            abi::decode(&[AbiType::String], &out).unwrap(),
            vec![AbiValue::String("TKN".into())]
        );
    }

    #[test]
    fn test_erc20_transfer_emits_event() {
        let mut token = token();
        let data = call_data(
            "transfer(address,uint256)",
            &[AbiValue::Address([2; 20]), AbiValue::Uint256(U256::from(250))],
        );
        let out = token.call(&native_call(OWNER, &data)).unwrap();
        assert_eq!(token.balance_of(&OWNER), U256::from(750));
        assert_eq!(token.balance_of(&[2; 20]), U256::from(250));
        assert_eq!(out.events.len(), 1);
        assert_eq!(out.events[0].topics[2], address_topic(&[2; 20]));
    }

    #[test]
    fn test_erc20_overdraw_fails() {
        let mut token = token();
        let data = call_data(
            "transfer(address,uint256)",
            &[AbiValue::Address([2; 20]), AbiValue::Uint256(U256::from(1_001))],
        );
        assert!(token.call(&native_call(OWNER, &data)).is_err());
    }

    #[test]
    fn test_transfer_from_spends_allowance() {
        let mut token = token();
        let approve = call_data(
            "approve(address,uint256)",
            &[AbiValue::Address([3; 20]), AbiValue::Uint256(U256::from(100))],
        );
        token.call(&native_call(OWNER, &approve)).unwrap();
        let pull = call_data(
            "transferFrom(address,address,uint256)",
            &[
                AbiValue::Address(OWNER),
                AbiValue::Address([4; 20]),
                AbiValue::Uint256(U256::from(60)),
            ],
        );
        token.call(&native_call([3; 20], &pull)).unwrap();
        assert_eq!(token.allowance(&OWNER, &[3; 20]), U256::from(40));
        assert_eq!(token.balance_of(&[4; 20]), U256::from(60));
        assert!(token.call(&native_call([3; 20], &pull)).is_err());
    }

    #[test]
    fn test_manager_deploys_erc20() {
        let mut manager = ContractManager::default();
        let data = call_data(
            "createNewERC20Contract(string,string,uint256,uint256)",
            &[
                AbiValue::String("Token".into()),
                AbiValue::String("TKN".into()),
                AbiValue::Uint256(U256::from(18)),
                AbiValue::Uint256(U256::from(5_000)),
            ],
        );
        let call = NativeCall {
            caller: OWNER,
            contract: CONTRACT_MANAGER_ADDRESS,
            data: &data,
            nonce: 4,
        };
        let out = manager.call(&call).unwrap();
        let (address, contract) = out.deploy.unwrap();
        assert_eq!(address, derive_contract_address(&OWNER, 4));
        assert_eq!(contract.as_erc20().unwrap().balance_of(&OWNER), U256::from(5_000));
        assert_eq!(manager.deployed(), &[(ContractTag::Erc20, address)]);
    }

    #[test]
    fn test_manager_rejects_wide_decimals() {
        let mut manager = ContractManager::default();
        let data = call_data(
            "createNewERC20Contract(string,string,uint256,uint256)",
            &[
                AbiValue::String("Token".into()),
                AbiValue::String("TKN".into()),
                AbiValue::Uint256(U256::from(256)),
                AbiValue::Uint256(U256::from(1)),
            ],
        );
        let call = NativeCall {
            caller: OWNER,
            contract: CONTRACT_MANAGER_ADDRESS,
            data: &data,
            nonce: 0,
        };
        assert!(matches!(manager.call(&call), Err(StateError::Reverted(_))));
    }

    #[test]
    fn test_wrong_kind_is_typed_error() {
        let contract = ContractKind::Evm(EvmContract { code: vec![1] });
        match contract.as_erc20() {
            Err(StateError::WrongContractKind { expected, found }) => {
                assert_eq!(expected, ContractTag::Erc20);
                assert_eq!(found, ContractTag::Evm);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(contract.native().is_none());
    }

    #[test]
    fn test_contract_record_roundtrip_and_corruption() {
        let mut token = token();
        token.transfer_balance(&OWNER, &[2; 20], U256::from(1)).unwrap();
        let kind = ContractKind::Erc20(token);
        let bytes = kind.to_bytes();
        assert_eq!(ContractKind::from_bytes(&bytes).unwrap(), kind);
        assert!(matches!(
            ContractKind::from_bytes(&bytes[..bytes.len() - 1]),
            Err(StateError::Fatal(_))
        ));
        assert!(matches!(ContractKind::from_bytes(&[9]), Err(StateError::Fatal(_))));
    }
}
