//! The P2P message envelope.
//!
//! ## Wire Format
//!
//! ```text
//! offset  size  field
//!      0     1  request type (0 request, 1 answer, 2 broadcast, 3 notification)
//!      1     8  random request id
//!      9     2  command id (big-endian)
//!     11     -  payload
//! ```
//!
//! Type tags and command ids form a closed set. Adding one is a protocol
//! version bump.

use std::fmt;
use std::net::SocketAddr;

use bytes::{BufMut, Bytes, BytesMut};
use halcyon_primitives::crypto::keccak256_concat;
use halcyon_primitives::types::to_hex;
use halcyon_primitives::{BlockHeight, Hash, ZERO_HASH};

use crate::error::{P2pError, P2pResult};

/// Size of the envelope header preceding the payload.
pub const HEADER_LEN: usize = 11;

/// Peers are identified by the socket address they listen on.
pub type NodeId = SocketAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RequestType {
    Request = 0,
    Answer = 1,
    Broadcast = 2,
    Notification = 3,
}

impl TryFrom<u8> for RequestType {
    type Error = P2pError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            0 => Ok(Self::Request),
            1 => Ok(Self::Answer),
            2 => Ok(Self::Broadcast),
            3 => Ok(Self::Notification),
            other => Err(P2pError::UnknownRequestType(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CommandType {
    Ping = 0,
    Info = 1,
    RequestNodes = 2,
    RequestValidatorTxs = 3,
    BroadcastValidatorTx = 4,
    BroadcastTx = 5,
    BroadcastBlock = 6,
    BroadcastInfo = 7,
    RequestTxs = 8,
    NotifyInfo = 9,
}

impl TryFrom<u16> for CommandType {
    type Error = P2pError;

    fn try_from(id: u16) -> Result<Self, Self::Error> {
        Ok(match id {
            0 => Self::Ping,
            1 => Self::Info,
            2 => Self::RequestNodes,
            3 => Self::RequestValidatorTxs,
            4 => Self::BroadcastValidatorTx,
            5 => Self::BroadcastTx,
            6 => Self::BroadcastBlock,
            7 => Self::BroadcastInfo,
            8 => Self::RequestTxs,
            9 => Self::NotifyInfo,
            other => return Err(P2pError::UnknownCommand(other)),
        })
    }
}

/// Random 8-byte identifier correlating a request with its answer.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub [u8; 8]);

impl RequestId {
    pub fn random() -> Self {
        Self(rand::random())
    }

    pub fn from_u64(value: u64) -> Self {
        Self(value.to_be_bytes())
    }

    pub fn to_u64(&self) -> u64 {
        u64::from_be_bytes(self.0)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&to_hex(&self.0))
    }
}

impl fmt::Debug for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequestId({})", self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum NodeType {
    Normal = 0,
    Discovery = 1,
}

impl TryFrom<u8> for NodeType {
    type Error = P2pError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            0 => Ok(Self::Normal),
            1 => Ok(Self::Discovery),
            other => Err(P2pError::Payload(format!("unknown node type {}", other))),
        }
    }
}

/// What a peer reports about itself.
///
/// `receipt_timestamp` and `time_skew` are filled in by the receiver when
/// the payload is decoded. Skew is the peer clock minus ours, in
/// microseconds; it says nothing about latency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeInfo {
    pub version: u64,
    /// Peer clock when the payload was built (µs since epoch).
    pub node_timestamp: u64,
    /// Our clock when the payload was decoded (µs since epoch).
    pub receipt_timestamp: u64,
    pub time_skew: i64,
    pub latest_height: BlockHeight,
    pub latest_hash: Hash,
}

impl Default for NodeInfo {
    fn default() -> Self {
        Self {
            version: 0,
            node_timestamp: 0,
            receipt_timestamp: 0,
            time_skew: 0,
            latest_height: 0,
            latest_hash: ZERO_HASH,
        }
    }
}

/// A raw P2P message. Cloning shares the underlying buffer.
#[derive(Clone, PartialEq, Eq)]
pub struct Message {
    raw: Bytes,
    request_type: RequestType,
    command: CommandType,
}

impl Message {
    /// Wrap raw bytes received from the network.
    ///
    /// The header is parsed once here; accessors never fail.
    pub fn from_bytes(raw: impl Into<Bytes>) -> P2pResult<Self> {
        let raw = raw.into();
        if raw.len() < HEADER_LEN {
            return Err(P2pError::MessageTooShort(raw.len()));
        }
        let request_type = RequestType::try_from(raw[0])?;
        let command = CommandType::try_from(u16::from_be_bytes([raw[9], raw[10]]))?;
        Ok(Self {
            raw,
            request_type,
            command,
        })
    }

    pub(crate) fn build(
        request_type: RequestType,
        id: RequestId,
        command: CommandType,
        payload: &[u8],
    ) -> Self {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
        buf.put_u8(request_type as u8);
        buf.put_slice(&id.0);
        buf.put_u16(command as u16);
        buf.put_slice(payload);
        Self {
            raw: buf.freeze(),
            request_type,
            command,
        }
    }

    pub fn request_type(&self) -> RequestType {
        self.request_type
    }

    pub fn id(&self) -> RequestId {
        let mut id = [0u8; 8];
        id.copy_from_slice(&self.raw[1..9]);
        RequestId(id)
    }

    pub fn command(&self) -> CommandType {
        self.command
    }

    pub fn payload(&self) -> &[u8] {
        &self.raw[HEADER_LEN..]
    }

    pub fn raw(&self) -> &Bytes {
        &self.raw
    }

    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// Identity of the content, independent of the random request id.
    /// Used to deduplicate broadcasts.
    pub fn content_hash(&self) -> Hash {
        keccak256_concat(&[&self.raw[9..11], self.payload()])
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("type", &self.request_type())
            .field("id", &self.id())
            .field("command", &self.command())
            .field("payload_len", &self.payload().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let msg = Message::build(
            RequestType::Broadcast,
            RequestId::from_u64(0x0102030405060708),
            CommandType::BroadcastBlock,
            b"xyz",
        );
        assert_eq!(
            &msg.raw()[..],
            &[2, 1, 2, 3, 4, 5, 6, 7, 8, 0, 6, b'x', b'y', b'z']
        );
        assert_eq!(msg.request_type(), RequestType::Broadcast);
        assert_eq!(msg.id().to_u64(), 0x0102030405060708);
        assert_eq!(msg.command(), CommandType::BroadcastBlock);
        assert_eq!(msg.payload(), b"xyz");
    }

    #[test]
    fn test_short_buffer_rejected() {
        let err = Message::from_bytes(vec![0u8; 10]).unwrap_err();
        assert!(matches!(err, P2pError::MessageTooShort(10)));
        assert!(Message::from_bytes(vec![0u8; 11]).is_ok());
    }

    #[test]
    fn test_unknown_tags_rejected() {
        let mut raw = vec![0u8; 11];
        raw[0] = 4;
        assert!(matches!(
            Message::from_bytes(raw.clone()).unwrap_err(),
            P2pError::UnknownRequestType(4)
        ));
        raw[0] = 0;
        raw[10] = 10;
        assert!(matches!(
            Message::from_bytes(raw).unwrap_err(),
            P2pError::UnknownCommand(10)
        ));
    }

    #[test]
    fn test_content_hash_ignores_request_id() {
        let a = Message::build(RequestType::Broadcast, RequestId::random(), CommandType::BroadcastTx, b"tx");
        let b = Message::build(RequestType::Broadcast, RequestId::random(), CommandType::BroadcastTx, b"tx");
        let c = Message::build(RequestType::Broadcast, RequestId::random(), CommandType::BroadcastBlock, b"tx");
        assert_eq!(a.content_hash(), b.content_hash());
        assert_ne!(a.content_hash(), c.content_hash());
    }

    #[test]
    fn test_request_id_display() {
        assert_eq!(RequestId::from_u64(255).to_string(), "0x00000000000000ff");
    }
}
