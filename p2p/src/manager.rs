//! Message routing and the outbound request API.
//!
//! Inbound messages are routed by request type:
//!
//! - **Request**: answered from [`NodeServices`] and sent straight back
//! - **Answer**: resolves the matching pending request
//! - **Broadcast**: deduplicated by content, decoded, handed to the node,
//!   and relayed to every other peer only if the node accepted it
//! - **Notification**: info notifications refresh [`NodeConns`]

use std::sync::Arc;

use halcyon_primitives::{
    ChainId, DecodeOptions, FinalizedBlock, Hash, Synced, Transaction, ValidatorTx,
};

use crate::config::P2pConfig;
use crate::encoding::{answer, broadcast, notification, request};
use crate::error::{P2pError, P2pResult};
use crate::message::{CommandType, Message, NodeId, NodeInfo, NodeType, RequestType};
use crate::node_conns::NodeConns;
use crate::pending::PendingRequests;
use crate::seen::SeenSet;
use crate::transport::{Inbox, Transport};

/// What the P2P layer needs from the node it serves.
///
/// The `on_*` hooks return `true` when the item was new and valid, which
/// is what triggers a relay.
pub trait NodeServices: Send + Sync {
    fn chain_id(&self) -> ChainId;

    /// Our own info as advertised to peers.
    fn node_info(&self) -> NodeInfo;

    fn validator_mempool(&self) -> Vec<ValidatorTx>;

    fn mempool(&self) -> Vec<Transaction>;

    fn on_validator_tx(&self, tx: ValidatorTx) -> bool;

    fn on_tx(&self, tx: Transaction) -> bool;

    fn on_block(&self, block: FinalizedBlock) -> bool;

    fn decode_options(&self) -> DecodeOptions {
        DecodeOptions::default()
    }
}

pub struct Manager {
    config: P2pConfig,
    transport: Arc<dyn Transport>,
    services: Arc<dyn NodeServices>,
    pending: PendingRequests,
    seen_broadcasts: Synced<SeenSet>,
    node_conns: NodeConns,
}

impl Manager {
    pub fn new(
        config: P2pConfig,
        transport: Arc<dyn Transport>,
        services: Arc<dyn NodeServices>,
    ) -> Arc<Self> {
        let node_conns = NodeConns::new(config.liveness.clone());
        let seen_broadcasts = Synced::new(SeenSet::new(config.seen_broadcasts_capacity));
        Arc::new(Self {
            config,
            transport,
            services,
            pending: PendingRequests::new(),
            seen_broadcasts,
            node_conns,
        })
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn node_conns(&self) -> &NodeConns {
        &self.node_conns
    }

    pub fn pending(&self) -> &PendingRequests {
        &self.pending
    }

    pub fn local_id(&self) -> NodeId {
        self.transport.local_id()
    }

    /// Start the liveness loop and a task draining `inbox`.
    pub fn start(self: &Arc<Self>, inbox: Inbox) {
        self.node_conns.start(Arc::downgrade(self));
        let manager = Arc::downgrade(self);
        let mut inbox = inbox;
        tokio::spawn(async move {
            while let Some((from, message)) = inbox.recv().await {
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                if let Err(e) = manager.handle_message(from, message) {
                    tracing::debug!(peer = %from, error = %e, "Dropped inbound message");
                }
            }
        });
        tracing::info!(node = %self.local_id(), "P2P manager started");
    }

    pub async fn stop(&self) {
        self.node_conns.stop().await;
        tracing::info!(node = %self.local_id(), "P2P manager stopped");
    }

    /// Route one inbound message.
    pub fn handle_message(&self, from: NodeId, message: Message) -> P2pResult<()> {
        match message.request_type() {
            RequestType::Request => self.handle_request(from, &message),
            RequestType::Answer => self.pending.resolve(from, message),
            RequestType::Broadcast => self.handle_broadcast(from, &message),
            RequestType::Notification => self.handle_notification(from, &message),
        }
    }

    fn handle_request(&self, from: NodeId, message: &Message) -> P2pResult<()> {
        let reply = match message.command() {
            CommandType::Ping => answer::ping(message),
            CommandType::Info => {
                let theirs = request::decode_info(message)?;
                self.node_conns.incoming_info(from, theirs);
                answer::info(message, &self.services.node_info())
            }
            CommandType::RequestNodes => answer::nodes(message, &self.transport.connected()),
            CommandType::RequestValidatorTxs => {
                answer::validator_txs(message, &self.services.validator_mempool())
            }
            CommandType::RequestTxs => answer::txs(message, &self.services.mempool()),
            other => {
                return Err(P2pError::Payload(format!(
                    "{:?} is not a request command",
                    other
                )))
            }
        };
        self.transport.send(&from, reply)
    }

    fn handle_broadcast(&self, from: NodeId, message: &Message) -> P2pResult<()> {
        if !self.seen_broadcasts.write().insert(message.content_hash()) {
            return Ok(());
        }
        let chain_id = self.services.chain_id();
        let accepted = match message.command() {
            CommandType::BroadcastValidatorTx => self
                .services
                .on_validator_tx(broadcast::decode_validator_tx(message, chain_id)?),
            CommandType::BroadcastTx => self.services.on_tx(broadcast::decode_tx(message, chain_id)?),
            CommandType::BroadcastBlock => self.services.on_block(broadcast::decode_block(
                message,
                chain_id,
                &self.services.decode_options(),
            )?),
            CommandType::BroadcastInfo => {
                self.node_conns.incoming_info(from, broadcast::decode_info(message)?);
                false
            }
            other => {
                return Err(P2pError::Payload(format!(
                    "{:?} is not a broadcast command",
                    other
                )))
            }
        };
        if accepted {
            tracing::debug!(command = ?message.command(), "Relaying accepted broadcast");
            self.relay(message, Some(from));
        }
        Ok(())
    }

    fn handle_notification(&self, from: NodeId, message: &Message) -> P2pResult<()> {
        let info = notification::decode_info(message)?;
        self.node_conns.incoming_info(from, info);
        Ok(())
    }

    /// Send to every connected peer except `skip`. Returns the number of
    /// successful sends.
    fn relay(&self, message: &Message, skip: Option<NodeId>) -> usize {
        let mut sent = 0;
        for peer in self.transport.connected().into_keys() {
            if Some(peer) == skip {
                continue;
            }
            match self.transport.send(&peer, message.clone()) {
                Ok(()) => sent += 1,
                Err(e) => tracing::debug!(peer = %peer, error = %e, "Relay failed"),
            }
        }
        sent
    }

    async fn request(&self, to: NodeId, message: Message) -> P2pResult<Message> {
        let id = message.id();
        let rx = self.pending.register(id, to, message.command());
        if let Err(e) = self.transport.send(&to, message) {
            self.pending.forget(&id);
            return Err(e);
        }
        let outcome = tokio::time::timeout(self.config.request_timeout(), rx).await;
        self.pending.forget(&id);
        match outcome {
            Ok(Ok(answer)) => Ok(answer),
            Ok(Err(_)) => Err(P2pError::Transport("answer slot closed".into())),
            Err(_) => Err(P2pError::Timeout),
        }
    }

    pub async fn ping(&self, to: NodeId) -> P2pResult<()> {
        let answer = self.request(to, request::ping()).await?;
        answer::decode_ping(&answer)
    }

    pub async fn request_node_info(&self, to: NodeId) -> P2pResult<NodeInfo> {
        let answer = self.request(to, request::info(&self.services.node_info())).await?;
        answer::decode_info(&answer)
    }

    pub async fn request_nodes(
        &self,
        to: NodeId,
    ) -> P2pResult<std::collections::HashMap<NodeId, NodeType>> {
        let answer = self.request(to, request::nodes()).await?;
        answer::decode_nodes(&answer)
    }

    pub async fn request_validator_txs(
        &self,
        to: NodeId,
    ) -> P2pResult<std::collections::HashMap<Hash, ValidatorTx>> {
        let answer = self.request(to, request::validator_txs()).await?;
        answer::decode_validator_txs(&answer, self.services.chain_id())
    }

    pub async fn request_txs(
        &self,
        to: NodeId,
    ) -> P2pResult<std::collections::HashMap<Hash, Transaction>> {
        let answer = self.request(to, request::txs()).await?;
        answer::decode_txs(&answer, self.services.chain_id())
    }

    fn broadcast(&self, message: Message) -> usize {
        self.seen_broadcasts.write().insert(message.content_hash());
        self.relay(&message, None)
    }

    pub fn broadcast_validator_tx(&self, tx: &ValidatorTx) -> usize {
        self.broadcast(broadcast::validator_tx(tx))
    }

    pub fn broadcast_tx(&self, tx: &Transaction) -> usize {
        self.broadcast(broadcast::tx(tx))
    }

    pub fn broadcast_block(&self, block: &FinalizedBlock) -> usize {
        self.broadcast(broadcast::block(block))
    }

    pub fn broadcast_info(&self) -> usize {
        self.broadcast(broadcast::info(&self.services.node_info()))
    }

    /// Push our info to every connected peer as a notification.
    pub fn notify_all_info(&self) -> usize {
        self.relay(&notification::info(&self.services.node_info()), None)
    }

    /// See [`NodeConns::force_refresh`].
    pub async fn force_refresh(&self) {
        self.node_conns.force_refresh(self).await;
    }

    /// Number of broadcast hashes currently remembered for dedup.
    pub fn seen_broadcasts_len(&self) -> usize {
        self.seen_broadcasts.read().len()
    }
}
