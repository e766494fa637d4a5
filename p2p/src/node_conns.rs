//! Peer liveness tracking.
//!
//! A background task wakes every tick, pushes our own info to every peer
//! as a notification, then drops peers whose last info is older than the
//! timeout. Peers refresh their entry by notifying us in turn.
//! [`NodeConns::force_refresh`] skips the wait and asks every connected
//! peer directly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use halcyon_primitives::Synced;
use tokio::task::JoinHandle;

use crate::config::LivenessConfig;
use crate::manager::Manager;
use crate::message::{NodeId, NodeInfo};

#[derive(Debug, Clone, Copy)]
struct TrackedPeer {
    info: NodeInfo,
    updated: Instant,
}

pub struct NodeConns {
    config: LivenessConfig,
    peers: Synced<HashMap<NodeId, TrackedPeer>>,
    stop: Arc<AtomicBool>,
    task: Synced<Option<JoinHandle<()>>>,
}

impl NodeConns {
    pub fn new(config: LivenessConfig) -> Self {
        Self {
            config,
            peers: Synced::default(),
            stop: Arc::new(AtomicBool::new(false)),
            task: Synced::new(None),
        }
    }

    /// Record info received from `sender`.
    pub fn incoming_info(&self, sender: NodeId, info: NodeInfo) {
        self.peers.write().insert(
            sender,
            TrackedPeer {
                info,
                updated: Instant::now(),
            },
        );
    }

    /// Snapshot of tracked peers and their latest info.
    pub fn connected(&self) -> HashMap<NodeId, NodeInfo> {
        self.peers
            .read()
            .iter()
            .map(|(id, peer)| (*id, peer.info))
            .collect()
    }

    pub fn get(&self, node: &NodeId) -> Option<NodeInfo> {
        self.peers.read().get(node).map(|peer| peer.info)
    }

    /// Drop peers not heard from within the timeout. Returns how many.
    pub fn purge_stale(&self) -> usize {
        let timeout = self.config.timeout();
        let mut peers = self.peers.write();
        let before = peers.len();
        peers.retain(|id, peer| {
            let alive = peer.updated.elapsed() < timeout;
            if !alive {
                tracing::warn!(peer = %id, "Dropping unresponsive peer");
            }
            alive
        });
        before - peers.len()
    }

    /// Ask every connected peer for its info right now and reconcile.
    ///
    /// Newly connected peers that answer are added; tracked peers that are
    /// disconnected or fail to answer are dropped.
    pub async fn force_refresh(&self, manager: &Manager) {
        let connected = manager.transport().connected();
        let ids: Vec<NodeId> = connected.keys().copied().collect();
        let answers =
            futures::future::join_all(ids.iter().map(|id| manager.request_node_info(*id))).await;

        let now = Instant::now();
        let mut peers = self.peers.write();
        peers.retain(|id, _| connected.contains_key(id));
        for (id, answer) in ids.into_iter().zip(answers) {
            match answer {
                Ok(info) => {
                    peers.insert(id, TrackedPeer { info, updated: now });
                }
                Err(e) => {
                    tracing::warn!(peer = %id, error = %e, "Peer did not answer info request");
                    peers.remove(&id);
                }
            }
        }
    }

    /// Spawn the liveness loop. A second call while running is a no-op.
    ///
    /// The task holds only a weak handle to the manager and exits on its
    /// own if the manager is dropped.
    pub fn start(&self, manager: Weak<Manager>) {
        let mut task = self.task.write();
        if task.is_some() {
            return;
        }
        self.stop.store(false, Ordering::SeqCst);
        let stop = Arc::clone(&self.stop);
        let tick = self.config.tick();
        *task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if stop.load(Ordering::SeqCst) {
                    break;
                }
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.notify_all_info();
                manager.node_conns().purge_stale();
            }
        }));
        tracing::info!(tick_ms = self.config.tick_ms, "NodeConns loop started");
    }

    /// Signal the loop to stop and wait for it to exit.
    pub async fn stop(&self) {
        let task = self.task.write().take();
        let Some(task) = task else {
            return;
        };
        self.stop.store(true, Ordering::SeqCst);
        if let Err(e) = task.await {
            tracing::error!(error = %e, "NodeConns loop panicked");
        }
        tracing::info!("NodeConns loop stopped");
    }

    pub fn is_running(&self) -> bool {
        self.task.read().is_some()
    }
}
