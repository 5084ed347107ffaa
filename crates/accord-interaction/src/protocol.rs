//! Boundary to the transport layer.
//!
//! The interaction core never opens connections or frames bytes. It talks
//! to a [`ProtocolLayer`] for outbound traffic and consumes a stream of
//! [`InboundEvent`]s for everything coming in.

use accord_core::{EndpointId, Envelope, InteractionMessage};
use async_trait::async_trait;
use std::time::Duration;

/// Outbound half of a transport.
#[async_trait]
pub trait ProtocolLayer: Send + Sync {
    /// Identifier of this process on the transport.
    fn local_endpoint(&self) -> &EndpointId;

    /// Fire-and-forget delivery.
    async fn send_message_to(
        &self,
        endpoint: &EndpointId,
        envelope: Envelope,
    ) -> Result<(), TransportError>;

    /// Deliver and wait for the message whose `in_response_to` is
    /// `envelope.id`.
    async fn send_message_and_await(
        &self,
        endpoint: &EndpointId,
        envelope: Envelope,
    ) -> Result<Envelope, TransportError>;

    /// Wrap `body` in an envelope sent by this endpoint.
    fn envelope(&self, body: InteractionMessage) -> Envelope {
        Envelope::new(self.local_endpoint().clone(), body)
    }
}

/// Things a transport reports to the interaction core.
#[derive(Debug, Clone)]
pub enum InboundEvent {
    /// A remote endpoint is reachable.
    Connected(EndpointId),
    /// A remote endpoint went away.
    Disconnected(EndpointId),
    /// A message that is not a reply to a pending send-and-await.
    Message(Envelope),
}

/// Transport-level failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("endpoint {0} is not connected")]
    EndpointUnreachable(EndpointId),
    #[error("connection to {0} closed before a response arrived")]
    Disconnected(EndpointId),
    #[error("no response from {endpoint} within {timeout:?}")]
    Timeout {
        endpoint: EndpointId,
        timeout: Duration,
    },
    #[error("failed to encode message: {0}")]
    Encoding(String),
    #[error("transport closed")]
    Closed,
}
