//! Cryptographic operations for Halcyon nodes.
//!
//! - Keccak-256 for block hashes, transaction hashes, selectors and seeds
//! - secp256k1 recoverable ECDSA for transaction and block signatures
//!
//! Signatures are always emitted with `s` in the lower half of the curve
//! order. When signing produces a high `s`, it is negated and the recovery
//! id flipped, so a signature and its malleated twin never both circulate.

use k256::ecdsa::{RecoveryId, Signature as EcdsaSignature, VerifyingKey};
use sha3::{Digest, Keccak256};

use crate::error::{ChainError, ChainResult};
use crate::types::{Address, Hash};

pub use k256::ecdsa::SigningKey;

/// Uncompressed secp256k1 public key without the leading `0x04` tag.
pub type PublicKey = [u8; 64];

/// Compute the Keccak-256 digest of `data`.
pub fn keccak256(data: &[u8]) -> Hash {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Keccak256::digest(data));
    out
}

/// Keccak-256 over the concatenation of several slices.
pub fn keccak256_concat(parts: &[&[u8]]) -> Hash {
    let mut hasher = Keccak256::new();
    for part in parts {
        hasher.update(part);
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    out
}

/// Recoverable ECDSA signature `(r, s, v)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Signature {
    pub r: [u8; 32],
    pub s: [u8; 32],
    /// Recovery id (0 or 1).
    pub v: u8,
}

impl Signature {
    /// Encoded length: r (32) + s (32) + v (1).
    pub const LEN: usize = 65;

    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut out = [0u8; Self::LEN];
        out[..32].copy_from_slice(&self.r);
        out[32..64].copy_from_slice(&self.s);
        out[64] = self.v;
        out
    }

    pub fn from_slice(bytes: &[u8]) -> ChainResult<Self> {
        if bytes.len() != Self::LEN {
            return Err(ChainError::MalformedInput(format!(
                "signature must be {} bytes, got {}",
                Self::LEN,
                bytes.len()
            )));
        }
        let mut r = [0u8; 32];
        let mut s = [0u8; 32];
        r.copy_from_slice(&bytes[..32]);
        s.copy_from_slice(&bytes[32..64]);
        Ok(Self { r, s, v: bytes[64] })
    }
}

/// Sign a 32-byte digest, normalizing `s` to the low half of the order.
pub fn sign(hash: &Hash, key: &SigningKey) -> ChainResult<Signature> {
    let (sig, recid) = key
        .sign_prehash_recoverable(hash)
        .map_err(|e| ChainError::Signature(e.to_string()))?;

    let (sig, recid) = match sig.normalize_s() {
        Some(low) => (low, RecoveryId::new(!recid.is_y_odd(), recid.is_x_reduced())),
        None => (sig, recid),
    };

    let bytes = sig.to_bytes();
    let mut r = [0u8; 32];
    let mut s = [0u8; 32];
    r.copy_from_slice(&bytes[..32]);
    s.copy_from_slice(&bytes[32..64]);
    Ok(Signature {
        r,
        s,
        v: recid.to_byte(),
    })
}

/// Recover the signer's public key from a signature over `hash`.
pub fn recover(signature: &Signature, hash: &Hash) -> ChainResult<PublicKey> {
    let recid = RecoveryId::from_byte(signature.v)
        .ok_or_else(|| ChainError::Signature(format!("bad recovery id {}", signature.v)))?;
    let bytes = signature.to_bytes();
    let sig = EcdsaSignature::from_slice(&bytes[..64])
        .map_err(|e| ChainError::Signature(e.to_string()))?;
    if sig.normalize_s().is_some() {
        return Err(ChainError::Signature("non-canonical s value".into()));
    }
    let key = VerifyingKey::recover_from_prehash(hash, &sig, recid)
        .map_err(|e| ChainError::Signature(e.to_string()))?;
    Ok(encode_public_key(&key))
}

/// Recover the signer's address from a signature over `hash`.
pub fn recover_address(signature: &Signature, hash: &Hash) -> ChainResult<Address> {
    recover(signature, hash).map(|pk| address_from_public_key(&pk))
}

/// True if `signature` over `hash` was produced by `address`.
pub fn verify(signature: &Signature, hash: &Hash, address: &Address) -> bool {
    matches!(recover_address(signature, hash), Ok(recovered) if recovered == *address)
}

/// Derive an address: the low 20 bytes of keccak(public key).
pub fn address_from_public_key(public_key: &PublicKey) -> Address {
    let digest = keccak256(public_key);
    let mut address = [0u8; 20];
    address.copy_from_slice(&digest[12..]);
    address
}

pub fn public_key(key: &SigningKey) -> PublicKey {
    encode_public_key(key.verifying_key())
}

pub fn address_of(key: &SigningKey) -> Address {
    address_from_public_key(&public_key(key))
}

/// Build a signing key from 32 raw secret bytes.
pub fn key_from_bytes(secret: &[u8; 32]) -> ChainResult<SigningKey> {
    SigningKey::from_slice(secret).map_err(|e| ChainError::Signature(e.to_string()))
}

/// Generate a fresh signing key from OS randomness.
pub fn generate_key() -> SigningKey {
    SigningKey::random(&mut rand::rngs::OsRng)
}

fn encode_public_key(key: &VerifyingKey) -> PublicKey {
    let point = key.to_encoded_point(false);
    let mut out = [0u8; 64];
    out.copy_from_slice(&point.as_bytes()[1..65]);
    out
}
