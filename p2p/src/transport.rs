//! Transport seam and an in-memory network for tests and simulations.
//!
//! The manager never touches sockets. It hands whole messages to a
//! [`Transport`] and receives inbound traffic as `(sender, message)` pairs
//! from an inbox channel owned by whoever drives the transport.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use halcyon_primitives::Synced;
use tokio::sync::mpsc;

use crate::error::{P2pError, P2pResult};
use crate::message::{Message, NodeId, NodeType};

/// Inbound traffic: who sent it, and what.
pub type Inbox = mpsc::UnboundedReceiver<(NodeId, Message)>;

pub trait Transport: Send + Sync {
    /// Our own identity on the network.
    fn local_id(&self) -> NodeId;

    /// Queue `message` for delivery to `to`.
    fn send(&self, to: &NodeId, message: Message) -> P2pResult<()>;

    /// Peers we currently hold a session with.
    fn connected(&self) -> HashMap<NodeId, NodeType>;
}

struct Endpoint {
    node_type: NodeType,
    inbox: mpsc::UnboundedSender<(NodeId, Message)>,
}

/// A switchboard of in-process endpoints joined by explicit links.
#[derive(Default)]
pub struct LoopbackNetwork {
    endpoints: Synced<HashMap<NodeId, Endpoint>>,
    links: Synced<HashSet<(NodeId, NodeId)>>,
}

impl LoopbackNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach a node and return its transport and inbox.
    pub fn join(self: &Arc<Self>, id: NodeId, node_type: NodeType) -> (Arc<LoopbackTransport>, Inbox) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.endpoints.write().insert(id, Endpoint { node_type, inbox: tx });
        let transport = Arc::new(LoopbackTransport {
            network: Arc::clone(self),
            id,
        });
        (transport, rx)
    }

    /// Open a session between `a` and `b`.
    pub fn connect(&self, a: NodeId, b: NodeId) {
        self.links.write().insert(link(a, b));
    }

    pub fn disconnect(&self, a: NodeId, b: NodeId) {
        self.links.write().remove(&link(a, b));
    }

    fn is_linked(&self, a: NodeId, b: NodeId) -> bool {
        self.links.read().contains(&link(a, b))
    }

    fn deliver(&self, from: NodeId, to: &NodeId, message: Message) -> P2pResult<()> {
        if !self.is_linked(from, *to) {
            return Err(P2pError::Transport(format!("no session with {}", to)));
        }
        let endpoints = self.endpoints.read();
        let endpoint = endpoints
            .get(to)
            .ok_or_else(|| P2pError::Transport(format!("unknown node {}", to)))?;
        endpoint
            .inbox
            .send((from, message))
            .map_err(|_| P2pError::Transport(format!("node {} is not reading", to)))
    }

    fn peers_of(&self, id: NodeId) -> HashMap<NodeId, NodeType> {
        let endpoints = self.endpoints.read();
        self.links
            .read()
            .iter()
            .filter_map(|(a, b)| match (*a == id, *b == id) {
                (true, _) => Some(*b),
                (_, true) => Some(*a),
                _ => None,
            })
            .filter_map(|peer| endpoints.get(&peer).map(|e| (peer, e.node_type)))
            .collect()
    }
}

fn link(a: NodeId, b: NodeId) -> (NodeId, NodeId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

pub struct LoopbackTransport {
    network: Arc<LoopbackNetwork>,
    id: NodeId,
}

impl Transport for LoopbackTransport {
    fn local_id(&self) -> NodeId {
        self.id
    }

    fn send(&self, to: &NodeId, message: Message) -> P2pResult<()> {
        self.network.deliver(self.id, to, message)
    }

    fn connected(&self) -> HashMap<NodeId, NodeType> {
        self.network.peers_of(self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::request;

    fn addr(port: u16) -> NodeId {
        NodeId::from(([127, 0, 0, 1], port))
    }

    #[tokio::test]
    async fn test_delivery_requires_link() {
        let net = LoopbackNetwork::new();
        let (a, _inbox_a) = net.join(addr(1), NodeType::Normal);
        let (_b, mut inbox_b) = net.join(addr(2), NodeType::Discovery);

        assert!(a.send(&addr(2), request::ping()).is_err());
        net.connect(addr(1), addr(2));
        assert_eq!(a.connected().get(&addr(2)), Some(&NodeType::Discovery));

        let ping = request::ping();
        a.send(&addr(2), ping.clone()).unwrap();
        let (from, received) = inbox_b.recv().await.unwrap();
        assert_eq!(from, addr(1));
        assert_eq!(received, ping);

        net.disconnect(addr(2), addr(1));
        assert!(a.connected().is_empty());
    }

    #[test]
    fn test_closed_inbox_is_a_transport_error() {
        let net = LoopbackNetwork::new();
        let (a, _inbox_a) = net.join(addr(1), NodeType::Normal);
        let (_b, inbox_b) = net.join(addr(2), NodeType::Normal);
        net.connect(addr(1), addr(2));
        drop(inbox_b);
        assert!(matches!(
            a.send(&addr(2), request::ping()).unwrap_err(),
            P2pError::Transport(_)
        ));
    }
}
