//! `halcyon-p2p` — peer-to-peer messaging for Halcyon nodes.
//!
//! Provides the binary message envelope, the closed command catalog and its
//! payload codecs, one-shot request/answer correlation, a transport seam
//! with an in-memory implementation, the routing [`Manager`], and peer
//! liveness tracking in [`NodeConns`].

pub mod config;
pub mod encoding;
pub mod error;
pub mod manager;
pub mod message;
pub mod node_conns;
pub mod pending;
pub mod seen;
pub mod transport;

pub use config::{LivenessConfig, P2pConfig};
pub use error::{P2pError, P2pResult};
pub use manager::{Manager, NodeServices};
pub use message::{CommandType, Message, NodeId, NodeInfo, NodeType, RequestId, RequestType};
pub use node_conns::NodeConns;
pub use pending::PendingRequests;
pub use seen::SeenSet;
pub use transport::{Inbox, LoopbackNetwork, LoopbackTransport, Transport};
