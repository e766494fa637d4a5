//! Error type for the P2P layer.

use halcyon_primitives::ChainError;

use crate::message::{CommandType, RequestId};

#[derive(Debug, thiserror::Error)]
pub enum P2pError {
    /// Raw message shorter than the 11-byte envelope header.
    #[error("message too short: {0} bytes, need at least 11")]
    MessageTooShort(usize),

    #[error("unknown request type {0}")]
    UnknownRequestType(u8),

    #[error("unknown command {0}")]
    UnknownCommand(u16),

    #[error("wrong command: expected {expected:?}, found {found:?}")]
    WrongCommand {
        expected: CommandType,
        found: CommandType,
    },

    /// Payload bytes do not match the command's layout.
    #[error("bad payload: {0}")]
    Payload(String),

    #[error("request {0} was already answered")]
    AlreadyAnswered(RequestId),

    #[error("no pending request with id {0}")]
    UnknownRequest(RequestId),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("request timed out")]
    Timeout,

    #[error(transparent)]
    Chain(#[from] ChainError),
}

pub type P2pResult<T> = Result<T, P2pError>;
