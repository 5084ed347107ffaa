//! Endpoint identifiers.
//!
//! An endpoint is either another interaction node in the same process,
//! written `local:<name>`, or a peer reached over a WebSocket connection,
//! written `ws:<ip>:<port>`. The textual form is what travels on the wire
//! and what shows up in logs.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

/// How an endpoint is reached. `Local` sorts before `WebSocket`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EndpointKind {
    Local,
    WebSocket,
}

impl EndpointKind {
    pub fn scheme(self) -> &'static str {
        match self {
            EndpointKind::Local => "local",
            EndpointKind::WebSocket => "ws",
        }
    }
}

/// Identifier of a local or remote endpoint process.
///
/// Identifiers are totally ordered (kind first, then address). Per-endpoint
/// maps iterate in that order, and two WebSocket peers that dial each
/// other use it to agree on which connection survives.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EndpointId {
    kind: EndpointKind,
    address: String,
}

impl EndpointId {
    /// An endpoint in this process, known by name.
    pub fn local(name: impl Into<String>) -> Self {
        Self {
            kind: EndpointKind::Local,
            address: name.into(),
        }
    }

    /// A peer listening for WebSocket connections on `addr`.
    pub fn ws(addr: SocketAddr) -> Self {
        Self {
            kind: EndpointKind::WebSocket,
            address: addr.to_string(),
        }
    }

    pub fn kind(&self) -> EndpointKind {
        self.kind
    }

    pub fn scheme(&self) -> &'static str {
        self.kind.scheme()
    }

    /// The name of a local endpoint, or `ip:port` of a WebSocket peer.
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_local(&self) -> bool {
        self.kind == EndpointKind::Local
    }

    /// Where a WebSocket peer listens. `None` for local endpoints.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self.kind {
            EndpointKind::WebSocket => self.address.parse().ok(),
            EndpointKind::Local => None,
        }
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scheme(), self.address)
    }
}

impl FromStr for EndpointId {
    type Err = EndpointIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, address) = s
            .split_once(':')
            .ok_or_else(|| EndpointIdParseError::MissingColon(s.to_string()))?;

        match scheme {
            "local" if address.is_empty() => Err(EndpointIdParseError::EmptyName),
            "local" => Ok(Self::local(address)),
            "ws" => address
                .parse()
                .map(Self::ws)
                .map_err(|_| EndpointIdParseError::InvalidSocketAddr(address.to_string())),
            other => Err(EndpointIdParseError::UnknownScheme(other.to_string())),
        }
    }
}

impl TryFrom<String> for EndpointId {
    type Error = EndpointIdParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<EndpointId> for String {
    fn from(id: EndpointId) -> Self {
        id.to_string()
    }
}

/// Error parsing an endpoint identifier string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EndpointIdParseError {
    #[error("endpoint id must contain ':' separator, got: {0}")]
    MissingColon(String),
    #[error("unknown endpoint scheme {0:?}, expected \"local\" or \"ws\"")]
    UnknownScheme(String),
    #[error("local endpoint name cannot be empty")]
    EmptyName,
    #[error("websocket endpoint needs ip:port, got: {0}")]
    InvalidSocketAddr(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn parse_local() {
        let id: EndpointId = "local:alpha".parse().unwrap();
        assert_eq!(id, EndpointId::local("alpha"));
        assert_eq!(id.address(), "alpha");
        assert!(id.is_local());
        assert_eq!(id.socket_addr(), None);
    }

    #[test]
    fn parse_ws_keeps_port_in_address() {
        let id: EndpointId = "ws:127.0.0.1:9000".parse().unwrap();
        assert_eq!(id.kind(), EndpointKind::WebSocket);
        assert_eq!(id.address(), "127.0.0.1:9000");
        assert_eq!(id.socket_addr(), Some(addr("127.0.0.1:9000")));
        assert!(!id.is_local());
    }

    #[test]
    fn rejects_malformed() {
        assert_eq!(
            "alpha".parse::<EndpointId>(),
            Err(EndpointIdParseError::MissingColon("alpha".into()))
        );
        assert_eq!(
            "url:alice@example.com".parse::<EndpointId>(),
            Err(EndpointIdParseError::UnknownScheme("url".into()))
        );
        assert_eq!("local:".parse::<EndpointId>(), Err(EndpointIdParseError::EmptyName));
        assert_eq!(
            "ws:example.com".parse::<EndpointId>(),
            Err(EndpointIdParseError::InvalidSocketAddr("example.com".into()))
        );
    }

    #[test]
    fn local_endpoints_sort_first() {
        let a = EndpointId::local("a");
        let z = EndpointId::local("z");
        let w = EndpointId::ws(addr("10.0.0.1:1"));
        assert!(a < z);
        assert!(z < w);
    }

    #[test]
    fn serde_as_string() {
        let id = EndpointId::ws(addr("[::1]:7000"));
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"ws:[::1]:7000\"");
        let back: EndpointId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
