//! Command stand-ins.
//!
//! A [`RemoteCommand`] is the local face of one command capability of one
//! remote endpoint. Each call becomes an `InvokeCapability` request and the
//! reply is mapped back to a value, a void completion or an error.

use crate::hub::{HubError, ProxyFactory};
use crate::protocol::{ProtocolLayer, TransportError};
use accord_core::{CapabilityDescriptor, EndpointId, InteractionMessage, WireParameter};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// What a caller of a stand-in can observe going wrong.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvocationError {
    #[error("{member} on {endpoint} failed: {reason}")]
    Fault {
        endpoint: EndpointId,
        member: String,
        reason: String,
    },
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("unexpected {0} reply")]
    UnexpectedResponse(&'static str),
    #[error("result does not match the expected type: {0}")]
    InvalidResult(String),
}

/// Callable stand-in for a command of a remote endpoint.
pub struct RemoteCommand {
    endpoint: EndpointId,
    capability: CapabilityDescriptor,
    protocol: Arc<dyn ProtocolLayer>,
    timeout: Duration,
}

impl RemoteCommand {
    pub fn new(
        endpoint: EndpointId,
        capability: CapabilityDescriptor,
        protocol: Arc<dyn ProtocolLayer>,
        timeout: Duration,
    ) -> Self {
        Self {
            endpoint,
            capability,
            protocol,
            timeout,
        }
    }

    pub fn endpoint(&self) -> &EndpointId {
        &self.endpoint
    }

    pub fn capability(&self) -> &CapabilityDescriptor {
        &self.capability
    }

    /// Invoke `member` with named arguments.
    ///
    /// `Ok(None)` is a completion without a value.
    pub async fn invoke(
        &self,
        member: &str,
        parameters: Vec<WireParameter>,
    ) -> Result<Option<Value>, InvocationError> {
        let request = self.protocol.envelope(InteractionMessage::InvokeCapability {
            capability: self.capability.clone(),
            member: member.to_string(),
            parameters,
        });
        let request_id = request.id;
        debug!(
            endpoint = %self.endpoint,
            capability = %self.capability,
            member,
            %request_id,
            "invoking remote command"
        );

        let reply = tokio::time::timeout(
            self.timeout,
            self.protocol.send_message_and_await(&self.endpoint, request),
        )
        .await
        .map_err(|_| TransportError::Timeout {
            endpoint: self.endpoint.clone(),
            timeout: self.timeout,
        })??;

        match reply.body {
            InteractionMessage::InvocationResult { value, .. } => Ok(Some(value)),
            InteractionMessage::InvocationSuccess { .. } => Ok(None),
            InteractionMessage::InvocationFailure { reason, .. } => Err(InvocationError::Fault {
                endpoint: self.endpoint.clone(),
                member: member.to_string(),
                reason,
            }),
            other => Err(InvocationError::UnexpectedResponse(other.kind())),
        }
    }

    /// Invoke and decode the result. A void completion decodes from `null`.
    pub async fn call<T: DeserializeOwned>(
        &self,
        member: &str,
        parameters: Vec<WireParameter>,
    ) -> Result<T, InvocationError> {
        let value = self.invoke(member, parameters).await?.unwrap_or(Value::Null);
        serde_json::from_value(value).map_err(|e| InvocationError::InvalidResult(e.to_string()))
    }
}

impl std::fmt::Debug for RemoteCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteCommand")
            .field("endpoint", &self.endpoint)
            .field("capability", &self.capability)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Builds [`RemoteCommand`]s over a shared protocol layer.
pub struct CommandProxyFactory {
    protocol: Arc<dyn ProtocolLayer>,
    timeout: Duration,
}

impl CommandProxyFactory {
    pub fn new(protocol: Arc<dyn ProtocolLayer>, timeout: Duration) -> Self {
        Self { protocol, timeout }
    }
}

impl ProxyFactory<RemoteCommand> for CommandProxyFactory {
    fn build(
        &self,
        endpoint: &EndpointId,
        capability: &CapabilityDescriptor,
    ) -> Result<RemoteCommand, HubError> {
        Ok(RemoteCommand::new(
            endpoint.clone(),
            capability.clone(),
            Arc::clone(&self.protocol),
            self.timeout,
        ))
    }
}
