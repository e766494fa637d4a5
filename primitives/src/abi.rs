//! Argument codec for contract calls (32-byte word ABI).
//!
//! A call is encoded as an optional 4-byte selector followed by a head and
//! a tail region:
//!
//! - static values take one word in the head (`uint256` as is, `address`
//!   right-aligned in the low 20 bytes, `bool` in the last byte)
//! - dynamic values (`bytes`, `string`, `T[]`, `T[N]` of dynamic `T`) put a
//!   word-sized offset in the head and their body in the tail; the offset
//!   is relative to the start of the enclosing argument region
//! - a dynamic array body is a length word followed by its elements encoded
//!   as a nested region, so element offsets are relative to the first word
//!   after the length
//!
//! Decoding re-reads every offset and length and bounds each read against
//! the region it belongs to. Any read past the end is
//! [`ChainError::DataTooShort`].

use std::fmt;
use std::str::FromStr;

use crate::arith::to_usize;
use crate::crypto::keccak256;
use crate::error::{ChainError, ChainResult};
use crate::types::{u256_to_word, Address, U256};

const WORD: usize = 32;

/// Supported argument types.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AbiType {
    Uint256,
    Address,
    Bool,
    Bytes,
    String,
    /// `T[]`
    Array(Box<AbiType>),
    /// `T[N]`
    FixedArray(Box<AbiType>, usize),
}

impl AbiType {
    /// Dynamic types are referenced through an offset in the head.
    pub fn is_dynamic(&self) -> bool {
        match self {
            Self::Bytes | Self::String | Self::Array(_) => true,
            Self::FixedArray(inner, _) => inner.is_dynamic(),
            Self::Uint256 | Self::Address | Self::Bool => false,
        }
    }

    /// Bytes this type occupies in the head of its region. A static fixed
    /// array whose inline size overflows `usize` is a codec error.
    fn head_size(&self) -> ChainResult<usize> {
        match self {
            Self::FixedArray(inner, n) if !inner.is_dynamic() => inner
                .head_size()?
                .checked_mul(*n)
                .ok_or_else(|| ChainError::Codec(format!("{} is too large to encode", self))),
            _ => Ok(WORD),
        }
    }
}

impl fmt::Display for AbiType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uint256 => write!(f, "uint256"),
            Self::Address => write!(f, "address"),
            Self::Bool => write!(f, "bool"),
            Self::Bytes => write!(f, "bytes"),
            Self::String => write!(f, "string"),
            Self::Array(inner) => write!(f, "{}[]", inner),
            Self::FixedArray(inner, n) => write!(f, "{}[{}]", inner, n),
        }
    }
}

impl FromStr for AbiType {
    type Err = ChainError;

    fn from_str(s: &str) -> ChainResult<Self> {
        let s = s.trim();
        if let Some(prefix) = s.strip_suffix(']') {
            let open = prefix
                .rfind('[')
                .ok_or_else(|| ChainError::Codec(format!("unbalanced brackets in '{}'", s)))?;
            let inner: AbiType = prefix[..open].parse()?;
            let size = &prefix[open + 1..];
            if size.is_empty() {
                return Ok(Self::Array(Box::new(inner)));
            }
            let n = size
                .parse::<usize>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| ChainError::Codec(format!("bad array size in '{}'", s)))?;
            let ty = Self::FixedArray(Box::new(inner), n);
            ty.head_size()?;
            return Ok(ty);
        }
        match s {
            "uint256" => Ok(Self::Uint256),
            "address" => Ok(Self::Address),
            "bool" => Ok(Self::Bool),
            "bytes" => Ok(Self::Bytes),
            "string" => Ok(Self::String),
            other => Err(ChainError::Codec(format!("unsupported type '{}'", other))),
        }
    }
}

/// A typed argument value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbiValue {
    Uint256(U256),
    Address(Address),
    Bool(bool),
    Bytes(Vec<u8>),
    String(String),
    /// Dynamic array with its element type (needed to type empty arrays).
    Array(AbiType, Vec<AbiValue>),
    /// Fixed-size array with its element type.
    FixedArray(AbiType, Vec<AbiValue>),
}

impl AbiValue {
    pub fn abi_type(&self) -> AbiType {
        match self {
            Self::Uint256(_) => AbiType::Uint256,
            Self::Address(_) => AbiType::Address,
            Self::Bool(_) => AbiType::Bool,
            Self::Bytes(_) => AbiType::Bytes,
            Self::String(_) => AbiType::String,
            Self::Array(elem, _) => AbiType::Array(Box::new(elem.clone())),
            Self::FixedArray(elem, items) => AbiType::FixedArray(Box::new(elem.clone()), items.len()),
        }
    }

    pub fn as_u256(&self) -> ChainResult<U256> {
        match self {
            Self::Uint256(v) => Ok(*v),
            other => Err(mismatch("uint256", other)),
        }
    }

    pub fn as_address(&self) -> ChainResult<Address> {
        match self {
            Self::Address(a) => Ok(*a),
            other => Err(mismatch("address", other)),
        }
    }

    pub fn as_bool(&self) -> ChainResult<bool> {
        match self {
            Self::Bool(b) => Ok(*b),
            other => Err(mismatch("bool", other)),
        }
    }

    pub fn as_bytes(&self) -> ChainResult<&[u8]> {
        match self {
            Self::Bytes(b) => Ok(b),
            other => Err(mismatch("bytes", other)),
        }
    }

    pub fn as_str(&self) -> ChainResult<&str> {
        match self {
            Self::String(s) => Ok(s),
            other => Err(mismatch("string", other)),
        }
    }
}

fn mismatch(expected: &str, found: &AbiValue) -> ChainError {
    ChainError::Codec(format!("expected {}, found {}", expected, found.abi_type()))
}

/// Parse `"name(t1,t2,...)"` into the function name and argument types.
pub fn parse_signature(signature: &str) -> ChainResult<(String, Vec<AbiType>)> {
    let open = signature
        .find('(')
        .ok_or_else(|| ChainError::Codec(format!("missing '(' in header '{}'", signature)))?;
    let args = signature[open + 1..]
        .strip_suffix(')')
        .ok_or_else(|| ChainError::Codec(format!("missing ')' in header '{}'", signature)))?;
    let name = signature[..open].trim();
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(ChainError::Codec(format!("bad function name in header '{}'", signature)));
    }
    let types = if args.trim().is_empty() {
        Vec::new()
    } else {
        args.split(',').map(str::parse).collect::<ChainResult<Vec<AbiType>>>()?
    };
    Ok((name.to_string(), types))
}

/// Canonical form of a signature, e.g. `transfer(address,uint256)`.
pub fn canonical_signature(name: &str, types: &[AbiType]) -> String {
    let args: Vec<String> = types.iter().map(ToString::to_string).collect();
    format!("{}({})", name, args.join(","))
}

/// First four bytes of the hash of the canonical signature.
pub fn selector(signature: &str) -> ChainResult<[u8; 4]> {
    let (name, types) = parse_signature(signature)?;
    let digest = keccak256(canonical_signature(&name, &types).as_bytes());
    let mut out = [0u8; 4];
    out.copy_from_slice(&digest[..4]);
    Ok(out)
}

// ── Encoding ──

/// Encode arguments without a selector.
pub fn encode(values: &[AbiValue]) -> ChainResult<Vec<u8>> {
    for value in values {
        check_well_typed(value)?;
    }
    encode_region(values)
}

/// Encode a call: selector of `signature` followed by the arguments.
///
/// The header's type list must match `values` one-to-one by position and
/// type; any mismatch is an error.
pub fn encode_call(signature: &str, values: &[AbiValue]) -> ChainResult<Vec<u8>> {
    let (_, types) = parse_signature(signature)?;
    check_types(&types, values)?;
    let mut out = selector(signature)?.to_vec();
    out.extend_from_slice(&encode(values)?);
    Ok(out)
}

fn check_types(types: &[AbiType], values: &[AbiValue]) -> ChainResult<()> {
    if types.len() != values.len() {
        return Err(ChainError::Codec(format!(
            "header declares {} arguments, got {}",
            types.len(),
            values.len()
        )));
    }
    for (i, (ty, value)) in types.iter().zip(values).enumerate() {
        let actual = value.abi_type();
        if *ty != actual {
            return Err(ChainError::Codec(format!(
                "argument {}: header says {}, value is {}",
                i, ty, actual
            )));
        }
    }
    Ok(())
}

/// Arrays must hold elements of their declared element type, and fixed
/// arrays at least one element.
fn check_well_typed(value: &AbiValue) -> ChainResult<()> {
    match value {
        AbiValue::FixedArray(elem, items) if items.is_empty() => Err(ChainError::Codec(format!(
            "fixed array of {} has no elements",
            elem
        ))),
        AbiValue::Array(elem, items) | AbiValue::FixedArray(elem, items) => {
            for item in items {
                if item.abi_type() != *elem {
                    return Err(ChainError::Codec(format!(
                        "array of {} holds a {}",
                        elem,
                        item.abi_type()
                    )));
                }
                check_well_typed(item)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn encode_region(values: &[AbiValue]) -> ChainResult<Vec<u8>> {
    let head_len = values.iter().try_fold(0usize, |total, value| {
        total
            .checked_add(value.abi_type().head_size()?)
            .ok_or_else(|| ChainError::Codec("argument head is too large".into()))
    })?;
    let mut head = Vec::with_capacity(head_len);
    let mut tail = Vec::new();
    for value in values {
        if value.abi_type().is_dynamic() {
            head.extend_from_slice(&usize_word(head_len + tail.len()));
            tail.extend_from_slice(&encode_body(value)?);
        } else {
            head.extend_from_slice(&encode_body(value)?);
        }
    }
    head.extend_from_slice(&tail);
    Ok(head)
}

fn encode_body(value: &AbiValue) -> ChainResult<Vec<u8>> {
    Ok(match value {
        AbiValue::Uint256(v) => u256_to_word(v).to_vec(),
        AbiValue::Address(a) => {
            let mut word = [0u8; WORD];
            word[12..].copy_from_slice(a);
            word.to_vec()
        }
        AbiValue::Bool(b) => {
            let mut word = [0u8; WORD];
            word[31] = u8::from(*b);
            word.to_vec()
        }
        AbiValue::Bytes(data) => encode_dynamic_bytes(data),
        AbiValue::String(s) => encode_dynamic_bytes(s.as_bytes()),
        AbiValue::Array(_, items) => {
            let mut out = usize_word(items.len()).to_vec();
            out.extend_from_slice(&encode_region(items)?);
            out
        }
        AbiValue::FixedArray(_, items) => encode_region(items)?,
    })
}

fn encode_dynamic_bytes(data: &[u8]) -> Vec<u8> {
    let padded = data.len().div_ceil(WORD) * WORD;
    let mut out = Vec::with_capacity(WORD + padded);
    out.extend_from_slice(&usize_word(data.len()));
    out.extend_from_slice(data);
    out.resize(WORD + padded, 0);
    out
}

fn usize_word(n: usize) -> [u8; WORD] {
    u256_to_word(&U256::from(n as u64))
}

// ── Decoding ──

/// Decode arguments of the given types (no selector).
pub fn decode(types: &[AbiType], data: &[u8]) -> ChainResult<Vec<AbiValue>> {
    decode_region(types, data)
}

/// Decode a call produced by [`encode_call`], checking its selector.
pub fn decode_call(signature: &str, data: &[u8]) -> ChainResult<Vec<AbiValue>> {
    let (_, types) = parse_signature(signature)?;
    let expected = selector(signature)?;
    let got = read(data, 0, 4)?;
    if got != expected {
        return Err(ChainError::Codec(format!(
            "selector mismatch: expected {}, got {}",
            hex::encode(expected),
            hex::encode(got)
        )));
    }
    decode_region(&types, &data[4..])
}

/// Bounded slice read.
fn read(region: &[u8], offset: usize, len: usize) -> ChainResult<&[u8]> {
    offset
        .checked_add(len)
        .filter(|end| *end <= region.len())
        .map(|end| &region[offset..end])
        .ok_or(ChainError::DataTooShort {
            offset,
            needed: len,
            available: region.len(),
        })
}

fn read_word(region: &[u8], offset: usize) -> ChainResult<&[u8]> {
    read(region, offset, WORD)
}

fn read_usize(region: &[u8], offset: usize) -> ChainResult<usize> {
    let word = read_word(region, offset)?;
    to_usize(U256::from_big_endian(word))
        .map_err(|_| ChainError::Codec(format!("offset or length at {} does not fit", offset)))
}

fn decode_region(types: &[AbiType], region: &[u8]) -> ChainResult<Vec<AbiValue>> {
    let mut values = Vec::with_capacity(types.len());
    let mut pos = 0usize;
    for ty in types {
        let size = ty.head_size()?;
        if ty.is_dynamic() {
            let offset = read_usize(region, pos)?;
            if offset > region.len() {
                return Err(ChainError::DataTooShort {
                    offset,
                    needed: WORD,
                    available: region.len(),
                });
            }
            values.push(decode_body(ty, &region[offset..])?);
        } else {
            values.push(decode_body(ty, read(region, pos, size)?)?);
        }
        pos = pos.checked_add(size).ok_or(ChainError::DataTooShort {
            offset: pos,
            needed: size,
            available: region.len(),
        })?;
    }
    Ok(values)
}

fn decode_body(ty: &AbiType, region: &[u8]) -> ChainResult<AbiValue> {
    match ty {
        AbiType::Uint256 => Ok(AbiValue::Uint256(U256::from_big_endian(read_word(region, 0)?))),
        AbiType::Address => {
            let word = read_word(region, 0)?;
            let mut addr = [0u8; 20];
            addr.copy_from_slice(&word[12..]);
            Ok(AbiValue::Address(addr))
        }
        AbiType::Bool => Ok(AbiValue::Bool(read_word(region, 0)?[31] != 0)),
        AbiType::Bytes => Ok(AbiValue::Bytes(decode_dynamic_bytes(region)?.to_vec())),
        AbiType::String => {
            let raw = decode_dynamic_bytes(region)?;
            String::from_utf8(raw.to_vec())
                .map(AbiValue::String)
                .map_err(|_| ChainError::Codec("string is not valid UTF-8".into()))
        }
        AbiType::Array(elem) => {
            let len = read_usize(region, 0)?;
            let sub = &region[WORD..];
            // every element needs at least one head word
            if len > sub.len() / WORD {
                return Err(ChainError::DataTooShort {
                    offset: WORD,
                    needed: len.saturating_mul(WORD),
                    available: sub.len(),
                });
            }
            let types = vec![(**elem).clone(); len];
            Ok(AbiValue::Array((**elem).clone(), decode_region(&types, sub)?))
        }
        AbiType::FixedArray(elem, n) => {
            let elem_head = elem.head_size()?;
            if *n == 0 || elem_head == 0 {
                return Err(ChainError::Codec(format!("{} has no elements", ty)));
            }
            // every element's head must lie inside this region
            if n.checked_mul(elem_head).map_or(true, |needed| needed > region.len()) {
                return Err(ChainError::DataTooShort {
                    offset: 0,
                    needed: n.saturating_mul(elem_head),
                    available: region.len(),
                });
            }
            let types = vec![(**elem).clone(); *n];
            Ok(AbiValue::FixedArray((**elem).clone(), decode_region(&types, region)?))
        }
    }
}

fn decode_dynamic_bytes(region: &[u8]) -> ChainResult<&[u8]> {
    let len = read_usize(region, 0)?;
    read(region, WORD, len)
}
