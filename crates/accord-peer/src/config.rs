//! Peer configuration file.

use accord_core::EndpointId;
use accord_interaction::NodeConfig;
use anyhow::Context;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Which half of the telemetry subject this peer plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Provides readings and raises alarms.
    Sensor,
    /// Requires readings and listens for alarms.
    Monitor,
    #[default]
    Both,
}

impl Role {
    pub fn provides(self) -> bool {
        matches!(self, Role::Sensor | Role::Both)
    }

    pub fn requires(self) -> bool {
        matches!(self, Role::Monitor | Role::Both)
    }
}

/// Contents of `accord.toml`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    pub name: String,
    /// Address to accept WebSocket connections on.
    pub listen: Option<SocketAddr>,
    /// `ws://` URLs to dial at start-up.
    pub peers: Vec<String>,
    pub role: Role,
    /// Seconds between alarms raised by a sensor; 0 disables them.
    pub alarm_interval_secs: u64,
    /// Seconds between dial attempts to an unreachable peer.
    pub redial_secs: u64,
    pub node: NodeConfig,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            name: "accord".to_string(),
            listen: None,
            peers: Vec::new(),
            role: Role::default(),
            alarm_interval_secs: 10,
            redial_secs: 2,
            node: NodeConfig::default(),
        }
    }
}

impl PeerConfig {
    /// Read `path`, falling back to defaults when it does not exist.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn parse(text: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Identifier announced to peers: the listen address when there is
    /// one, the name otherwise.
    pub fn endpoint_id(&self) -> EndpointId {
        match self.listen {
            Some(addr) => EndpointId::ws(addr),
            None => EndpointId::local(self.name.clone()),
        }
    }

    pub fn alarm_interval(&self) -> Option<Duration> {
        (self.alarm_interval_secs > 0).then(|| Duration::from_secs(self.alarm_interval_secs))
    }

    pub fn redial_delay(&self) -> Duration {
        Duration::from_secs(self.redial_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_file() {
        let config = PeerConfig::parse(
            r#"
            name = "boiler-room"
            listen = "127.0.0.1:9001"
            peers = ["ws://127.0.0.1:9002"]
            role = "sensor"

            [node]
            handshake_timeout_ms = 2000
            "#,
        )
        .unwrap();
        assert_eq!(config.name, "boiler-room");
        assert_eq!(config.role, Role::Sensor);
        assert_eq!(config.peers, vec!["ws://127.0.0.1:9002".to_string()]);
        assert_eq!(config.node.handshake_timeout_ms, 2000);
        assert_eq!(config.node.invocation_timeout_ms, NodeConfig::DEFAULT_INVOCATION_TIMEOUT_MS);
        assert_eq!(config.endpoint_id().to_string(), "ws:127.0.0.1:9001");
    }

    #[test]
    fn empty_file_is_default() {
        let config = PeerConfig::parse("").unwrap();
        assert_eq!(config, PeerConfig::default());
        assert_eq!(config.endpoint_id(), EndpointId::local("accord"));
    }

    #[test]
    fn missing_file_is_default() {
        let config = PeerConfig::load(Path::new("/nonexistent/accord.toml")).unwrap();
        assert_eq!(config.role, Role::Both);
    }

    #[test]
    fn zero_interval_disables_alarms() {
        let config = PeerConfig {
            alarm_interval_secs: 0,
            ..PeerConfig::default()
        };
        assert_eq!(config.alarm_interval(), None);
    }
}
