//! WebSocket frames.

use accord_core::{EndpointId, Envelope};
use serde::{Deserialize, Serialize};

/// One text frame on a peer connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// First frame in both directions.
    Hello { endpoint: EndpointId },
    Envelope(Envelope),
}

impl Frame {
    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn decode(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use accord_core::{Decision, InteractionMessage, MessageId};

    #[test]
    fn hello_names_the_endpoint() {
        let text = Frame::Hello {
            endpoint: EndpointId::ws("127.0.0.1:9001".parse().unwrap()),
        }
        .encode()
        .unwrap();
        assert_eq!(text, r#"{"type":"hello","endpoint":"ws:127.0.0.1:9001"}"#);
    }

    #[test]
    fn envelope_keeps_its_own_tag() {
        let envelope = Envelope::new(
            EndpointId::local("a"),
            InteractionMessage::CapabilityOfferResponse {
                in_response_to: MessageId::new(),
                decision: Decision::Desired,
            },
        );
        let frame = Frame::Envelope(envelope.clone());
        let json: serde_json::Value = serde_json::from_str(&frame.encode().unwrap()).unwrap();
        assert_eq!(json["type"], "envelope");
        assert_eq!(json["body"]["type"], "capability_offer_response");
        assert_eq!(Frame::decode(&json.to_string()).unwrap(), frame);
    }
}
