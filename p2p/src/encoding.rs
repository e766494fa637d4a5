//! Payload encoders and decoders, grouped by message role.
//!
//! ## Payload Layouts (big-endian)
//!
//! ```text
//! Info           [version: 8][node timestamp µs: 8][height: 8][hash: 32]
//! RequestNodes   repeated [node type: 1][ip version: 1 (4|6)][ip: 4|16][port: 2]
//! tx lists       repeated [len: 4][tx bytes]
//! BroadcastBlock the block's wire encoding
//! ```
//!
//! Tx list answers decode into maps keyed by transaction hash. The key is
//! recomputed from each decoded transaction, so it is never sent and a
//! repeated transaction collapses into one entry.
//!
//! Ping and identifier-only requests carry an empty payload. Decoders check
//! the command (and, for answers, the request type) before touching the
//! payload.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use halcyon_primitives::codec::{split_frames, write_framed, write_u16, write_u64, write_u8, Reader};
use halcyon_primitives::types::timestamp_micros;
use halcyon_primitives::{ChainId, DecodeOptions, FinalizedBlock, Hash, Transaction, ValidatorTx};

use crate::error::{P2pError, P2pResult};
use crate::message::{CommandType, Message, NodeId, NodeInfo, NodeType, RequestId, RequestType};

const INFO_PAYLOAD_LEN: usize = 8 + 8 + 8 + 32;

fn expect(message: &Message, request_type: RequestType, command: CommandType) -> P2pResult<()> {
    if message.command() != command {
        return Err(P2pError::WrongCommand {
            expected: command,
            found: message.command(),
        });
    }
    if message.request_type() != request_type {
        return Err(P2pError::Payload(format!(
            "expected {:?} message, got {:?}",
            request_type,
            message.request_type()
        )));
    }
    Ok(())
}

fn encode_info(info: &NodeInfo) -> Vec<u8> {
    let mut buf = Vec::with_capacity(INFO_PAYLOAD_LEN);
    write_u64(&mut buf, info.version);
    write_u64(&mut buf, info.node_timestamp);
    write_u64(&mut buf, info.latest_height);
    buf.extend_from_slice(&info.latest_hash);
    buf
}

fn decode_info_payload(payload: &[u8]) -> P2pResult<NodeInfo> {
    if payload.len() != INFO_PAYLOAD_LEN {
        return Err(P2pError::Payload(format!(
            "info payload must be {} bytes, got {}",
            INFO_PAYLOAD_LEN,
            payload.len()
        )));
    }
    let mut r = Reader::new(payload);
    let version = r.read_u64()?;
    let node_timestamp = r.read_u64()?;
    let latest_height = r.read_u64()?;
    let latest_hash = r.read_hash()?;
    let receipt_timestamp = timestamp_micros();
    let skew = i128::from(node_timestamp) - i128::from(receipt_timestamp);
    let time_skew = i64::try_from(skew).unwrap_or(if skew < 0 { i64::MIN } else { i64::MAX });
    Ok(NodeInfo {
        version,
        node_timestamp,
        receipt_timestamp,
        time_skew,
        latest_height,
        latest_hash,
    })
}

fn encode_nodes(nodes: &HashMap<NodeId, NodeType>) -> Vec<u8> {
    let mut buf = Vec::new();
    for (node, node_type) in nodes {
        write_u8(&mut buf, *node_type as u8);
        match node.ip() {
            IpAddr::V4(ip) => {
                write_u8(&mut buf, 4);
                buf.extend_from_slice(&ip.octets());
            }
            IpAddr::V6(ip) => {
                write_u8(&mut buf, 6);
                buf.extend_from_slice(&ip.octets());
            }
        }
        write_u16(&mut buf, node.port());
    }
    buf
}

fn decode_nodes_payload(payload: &[u8]) -> P2pResult<HashMap<NodeId, NodeType>> {
    let mut r = Reader::new(payload);
    let mut nodes = HashMap::new();
    while !r.is_empty() {
        let node_type = NodeType::try_from(r.read_u8()?)?;
        let ip = match r.read_u8()? {
            4 => IpAddr::V4(Ipv4Addr::from(r.read_array::<4>()?)),
            6 => IpAddr::V6(Ipv6Addr::from(r.read_array::<16>()?)),
            other => return Err(P2pError::Payload(format!("unknown ip version {}", other))),
        };
        let port = r.read_u16()?;
        nodes.insert(SocketAddr::new(ip, port), node_type);
    }
    Ok(nodes)
}

fn encode_tx_list(txs: impl Iterator<Item = Vec<u8>>) -> Vec<u8> {
    let mut buf = Vec::new();
    for tx in txs {
        write_framed(&mut buf, &tx);
    }
    buf
}

/// Requests: point-to-point messages that expect an answer.
pub mod request {
    use super::*;

    pub fn ping() -> Message {
        Message::build(RequestType::Request, RequestId::random(), CommandType::Ping, &[])
    }

    /// Ask for a peer's info, telling it ours along the way.
    pub fn info(local: &NodeInfo) -> Message {
        Message::build(
            RequestType::Request,
            RequestId::random(),
            CommandType::Info,
            &encode_info(local),
        )
    }

    pub fn nodes() -> Message {
        Message::build(RequestType::Request, RequestId::random(), CommandType::RequestNodes, &[])
    }

    pub fn validator_txs() -> Message {
        Message::build(
            RequestType::Request,
            RequestId::random(),
            CommandType::RequestValidatorTxs,
            &[],
        )
    }

    pub fn txs() -> Message {
        Message::build(RequestType::Request, RequestId::random(), CommandType::RequestTxs, &[])
    }

    /// The requester's info carried by an Info request.
    pub fn decode_info(message: &Message) -> P2pResult<NodeInfo> {
        expect(message, RequestType::Request, CommandType::Info)?;
        decode_info_payload(message.payload())
    }
}

/// Answers: replies reusing the id of the request they fulfil.
pub mod answer {
    use super::*;

    pub fn ping(request: &Message) -> Message {
        Message::build(RequestType::Answer, request.id(), CommandType::Ping, &[])
    }

    pub fn info(request: &Message, local: &NodeInfo) -> Message {
        Message::build(RequestType::Answer, request.id(), CommandType::Info, &encode_info(local))
    }

    pub fn nodes(request: &Message, nodes: &HashMap<NodeId, NodeType>) -> Message {
        Message::build(
            RequestType::Answer,
            request.id(),
            CommandType::RequestNodes,
            &encode_nodes(nodes),
        )
    }

    pub fn validator_txs(request: &Message, txs: &[ValidatorTx]) -> Message {
        Message::build(
            RequestType::Answer,
            request.id(),
            CommandType::RequestValidatorTxs,
            &encode_tx_list(txs.iter().map(ValidatorTx::to_bytes)),
        )
    }

    pub fn txs(request: &Message, txs: &[Transaction]) -> Message {
        Message::build(
            RequestType::Answer,
            request.id(),
            CommandType::RequestTxs,
            &encode_tx_list(txs.iter().map(Transaction::to_bytes)),
        )
    }

    pub fn decode_ping(message: &Message) -> P2pResult<()> {
        expect(message, RequestType::Answer, CommandType::Ping)
    }

    pub fn decode_info(message: &Message) -> P2pResult<NodeInfo> {
        expect(message, RequestType::Answer, CommandType::Info)?;
        decode_info_payload(message.payload())
    }

    pub fn decode_nodes(message: &Message) -> P2pResult<HashMap<NodeId, NodeType>> {
        expect(message, RequestType::Answer, CommandType::RequestNodes)?;
        decode_nodes_payload(message.payload())
    }

    pub fn decode_validator_txs(
        message: &Message,
        chain_id: ChainId,
    ) -> P2pResult<HashMap<Hash, ValidatorTx>> {
        expect(message, RequestType::Answer, CommandType::RequestValidatorTxs)?;
        split_frames(message.payload())?
            .into_iter()
            .map(|raw| -> P2pResult<(Hash, ValidatorTx)> {
                let tx = ValidatorTx::from_bytes(raw, chain_id)?;
                Ok((*tx.hash(), tx))
            })
            .collect()
    }

    pub fn decode_txs(message: &Message, chain_id: ChainId) -> P2pResult<HashMap<Hash, Transaction>> {
        expect(message, RequestType::Answer, CommandType::RequestTxs)?;
        split_frames(message.payload())?
            .into_iter()
            .map(|raw| -> P2pResult<(Hash, Transaction)> {
                let tx = Transaction::from_bytes(raw, chain_id)?;
                Ok((*tx.hash(), tx))
            })
            .collect()
    }
}

/// Broadcasts: routed to every reachable peer, never correlated.
pub mod broadcast {
    use super::*;

    pub fn validator_tx(tx: &ValidatorTx) -> Message {
        Message::build(
            RequestType::Broadcast,
            RequestId::random(),
            CommandType::BroadcastValidatorTx,
            &tx.to_bytes(),
        )
    }

    pub fn tx(tx: &Transaction) -> Message {
        Message::build(
            RequestType::Broadcast,
            RequestId::random(),
            CommandType::BroadcastTx,
            &tx.to_bytes(),
        )
    }

    pub fn block(block: &FinalizedBlock) -> Message {
        Message::build(
            RequestType::Broadcast,
            RequestId::random(),
            CommandType::BroadcastBlock,
            &block.serialize(),
        )
    }

    pub fn info(local: &NodeInfo) -> Message {
        Message::build(
            RequestType::Broadcast,
            RequestId::random(),
            CommandType::BroadcastInfo,
            &encode_info(local),
        )
    }

    pub fn decode_validator_tx(message: &Message, chain_id: ChainId) -> P2pResult<ValidatorTx> {
        expect(message, RequestType::Broadcast, CommandType::BroadcastValidatorTx)?;
        Ok(ValidatorTx::from_bytes(message.payload(), chain_id)?)
    }

    pub fn decode_tx(message: &Message, chain_id: ChainId) -> P2pResult<Transaction> {
        expect(message, RequestType::Broadcast, CommandType::BroadcastTx)?;
        Ok(Transaction::from_bytes(message.payload(), chain_id)?)
    }

    pub fn decode_block(
        message: &Message,
        chain_id: ChainId,
        options: &DecodeOptions,
    ) -> P2pResult<FinalizedBlock> {
        expect(message, RequestType::Broadcast, CommandType::BroadcastBlock)?;
        Ok(FinalizedBlock::from_bytes(message.payload(), chain_id, options)?)
    }

    pub fn decode_info(message: &Message) -> P2pResult<NodeInfo> {
        expect(message, RequestType::Broadcast, CommandType::BroadcastInfo)?;
        decode_info_payload(message.payload())
    }
}

/// Notifications: one-way, point-to-point, no reply.
pub mod notification {
    use super::*;

    pub fn info(local: &NodeInfo) -> Message {
        Message::build(
            RequestType::Notification,
            RequestId::random(),
            CommandType::NotifyInfo,
            &encode_info(local),
        )
    }

    pub fn decode_info(message: &Message) -> P2pResult<NodeInfo> {
        expect(message, RequestType::Notification, CommandType::NotifyInfo)?;
        decode_info_payload(message.payload())
    }
}
