//! Protocol messages.
//!
//! Every message travels in an [`Envelope`] that carries the sender and a
//! fresh message id. Replies reference the id of the message they answer
//! through `in_response_to`; transports use that to complete pending
//! send-and-await calls.

use crate::{CapabilityDescriptor, EndpointId, SubjectGroup};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique id of one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A side's willingness to keep the interaction with a remote endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// At least one required subject is fully satisfied by the remote.
    Desired,
    /// Nothing needed from the remote, but no objection either.
    Neutral,
    /// The remote must not be interacted with.
    Denied,
}

/// A named argument of a command invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireParameter {
    pub name: String,
    /// Type name as declared by the caller, informational only.
    #[serde(default)]
    pub type_name: String,
    pub value: serde_json::Value,
}

impl WireParameter {
    pub fn new(name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        Self {
            name: name.into(),
            type_name: String::new(),
            value: value.into(),
        }
    }

    pub fn typed(
        name: impl Into<String>,
        type_name: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            value: value.into(),
        }
    }
}

/// Envelope around every interaction message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: MessageId,
    pub sender: EndpointId,
    pub body: InteractionMessage,
}

impl Envelope {
    /// Wrap a message from `sender` under a fresh id.
    pub fn new(sender: EndpointId, body: InteractionMessage) -> Self {
        Self {
            id: MessageId::new(),
            sender,
            body,
        }
    }

    pub fn in_response_to(&self) -> Option<MessageId> {
        self.body.in_response_to()
    }
}

/// Messages exchanged by the interaction layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InteractionMessage {
    /// Advertise provided commands and notifications, once per connection.
    CapabilityOffer { subjects: Vec<SubjectGroup> },
    /// Answer to an offer with this side's decision.
    CapabilityOfferResponse {
        in_response_to: MessageId,
        decision: Decision,
    },
    /// Execute a remote command.
    InvokeCapability {
        capability: CapabilityDescriptor,
        member: String,
        #[serde(default)]
        parameters: Vec<WireParameter>,
    },
    /// Command completed with a value.
    InvocationResult {
        in_response_to: MessageId,
        value: serde_json::Value,
    },
    /// Command completed without a value.
    InvocationSuccess { in_response_to: MessageId },
    /// Command could not be executed or faulted.
    InvocationFailure {
        in_response_to: MessageId,
        #[serde(default)]
        reason: String,
    },
    /// Register interest in a notification.
    SubscribeNotification { notification: CapabilityDescriptor },
    /// Drop interest in a notification.
    UnsubscribeNotification { notification: CapabilityDescriptor },
    /// A notification fired on the sender.
    NotificationRaised {
        notification: CapabilityDescriptor,
        payload: serde_json::Value,
    },
}

impl InteractionMessage {
    pub fn in_response_to(&self) -> Option<MessageId> {
        match self {
            InteractionMessage::CapabilityOfferResponse { in_response_to, .. }
            | InteractionMessage::InvocationResult { in_response_to, .. }
            | InteractionMessage::InvocationSuccess { in_response_to }
            | InteractionMessage::InvocationFailure { in_response_to, .. } => Some(*in_response_to),
            _ => None,
        }
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            InteractionMessage::CapabilityOffer { .. } => "capability_offer",
            InteractionMessage::CapabilityOfferResponse { .. } => "capability_offer_response",
            InteractionMessage::InvokeCapability { .. } => "invoke_capability",
            InteractionMessage::InvocationResult { .. } => "invocation_result",
            InteractionMessage::InvocationSuccess { .. } => "invocation_success",
            InteractionMessage::InvocationFailure { .. } => "invocation_failure",
            InteractionMessage::SubscribeNotification { .. } => "subscribe_notification",
            InteractionMessage::UnsubscribeNotification { .. } => "unsubscribe_notification",
            InteractionMessage::NotificationRaised { .. } => "notification_raised",
        }
    }
}
