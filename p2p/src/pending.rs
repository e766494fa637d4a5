//! Request/answer correlation.
//!
//! Every outgoing request registers a one-shot answer slot keyed by its
//! random id. The matching answer fills the slot exactly once; later
//! answers with the same id are errors. There is no cancellation message:
//! a requester that stops waiting calls [`PendingRequests::forget`] and a
//! late answer then reports [`P2pError::UnknownRequest`].

use std::collections::HashMap;

use halcyon_primitives::Synced;
use tokio::sync::oneshot;

use crate::error::{P2pError, P2pResult};
use crate::message::{CommandType, Message, NodeId, RequestId};

#[derive(Debug)]
struct PendingRequest {
    command: CommandType,
    node: NodeId,
    /// `None` once answered.
    slot: Option<oneshot::Sender<Message>>,
}

#[derive(Debug, Default)]
pub struct PendingRequests {
    requests: Synced<HashMap<RequestId, PendingRequest>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request sent to `node`. The returned receiver yields the
    /// answer.
    pub fn register(
        &self,
        id: RequestId,
        node: NodeId,
        command: CommandType,
    ) -> oneshot::Receiver<Message> {
        let (tx, rx) = oneshot::channel();
        self.requests.write().insert(
            id,
            PendingRequest {
                command,
                node,
                slot: Some(tx),
            },
        );
        rx
    }

    /// Deliver an answer received from `from`.
    pub fn resolve(&self, from: NodeId, answer: Message) -> P2pResult<()> {
        let id = answer.id();
        let mut requests = self.requests.write();
        let pending = match requests.get_mut(&id) {
            Some(pending) if pending.node == from => pending,
            _ => return Err(P2pError::UnknownRequest(id)),
        };
        if pending.command != answer.command() {
            return Err(P2pError::WrongCommand {
                expected: pending.command,
                found: answer.command(),
            });
        }
        let slot = pending.slot.take().ok_or(P2pError::AlreadyAnswered(id))?;
        if slot.send(answer).is_err() {
            tracing::debug!(request = %id, "Answer arrived after requester stopped waiting");
        }
        Ok(())
    }

    /// Drop the entry for `id`, answered or not.
    pub fn forget(&self, id: &RequestId) {
        self.requests.write().remove(id);
    }

    pub fn len(&self) -> usize {
        self.requests.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
