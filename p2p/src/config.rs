//! P2P tunables.

use std::time::Duration;

use serde::Deserialize;

/// Peer liveness timing for [`NodeConns`](crate::NodeConns).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    /// Interval between own-info pushes and stale-peer sweeps.
    pub tick_ms: u64,
    /// A peer silent for this long is dropped.
    pub timeout_ms: u64,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            tick_ms: 100,
            timeout_ms: 10_000,
        }
    }
}

impl LivenessConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct P2pConfig {
    /// How long a request waits for its answer.
    pub request_timeout_ms: u64,
    /// Broadcast hashes remembered per dedup generation.
    pub seen_broadcasts_capacity: usize,
    pub liveness: LivenessConfig,
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 2_000,
            seen_broadcasts_capacity: 10_000,
            liveness: LivenessConfig::default(),
        }
    }
}

impl P2pConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = P2pConfig::default();
        assert_eq!(config.liveness.tick(), Duration::from_millis(100));
        assert_eq!(config.liveness.timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: P2pConfig =
            serde_json::from_str(r#"{"liveness": {"timeout_ms": 500}}"#).unwrap();
        assert_eq!(config.request_timeout_ms, 2_000);
        assert_eq!(config.seen_broadcasts_capacity, 10_000);
        assert_eq!(config.liveness.tick_ms, 100);
        assert_eq!(config.liveness.timeout_ms, 500);
    }
}
