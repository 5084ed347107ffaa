//! Node configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables of an interaction node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// How long a command stand-in waits for a reply, in milliseconds.
    pub invocation_timeout_ms: u64,
    /// How long the handshake waits for the answer to its offer, in milliseconds.
    pub handshake_timeout_ms: u64,
    /// Capacity of the broadcast channels behind hub events, handshake
    /// outcomes and notification fan-in.
    pub event_capacity: usize,
}

impl NodeConfig {
    pub const DEFAULT_INVOCATION_TIMEOUT_MS: u64 = 30_000;
    pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 15_000;
    pub const DEFAULT_EVENT_CAPACITY: usize = 64;

    pub fn invocation_timeout(&self) -> Duration {
        Duration::from_millis(self.invocation_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Broadcast channels panic on zero capacity.
    pub(crate) fn channel_capacity(&self) -> usize {
        self.event_capacity.max(1)
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            invocation_timeout_ms: Self::DEFAULT_INVOCATION_TIMEOUT_MS,
            handshake_timeout_ms: Self::DEFAULT_HANDSHAKE_TIMEOUT_MS,
            event_capacity: Self::DEFAULT_EVENT_CAPACITY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_uses_defaults() {
        let config: NodeConfig = serde_json::from_str(r#"{"invocation_timeout_ms": 500}"#).unwrap();
        assert_eq!(config.invocation_timeout(), Duration::from_millis(500));
        assert_eq!(config.handshake_timeout_ms, NodeConfig::DEFAULT_HANDSHAKE_TIMEOUT_MS);
        assert_eq!(config.event_capacity, NodeConfig::DEFAULT_EVENT_CAPACITY);
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let config = NodeConfig {
            event_capacity: 0,
            ..NodeConfig::default()
        };
        assert_eq!(config.channel_capacity(), 1);
    }
}
