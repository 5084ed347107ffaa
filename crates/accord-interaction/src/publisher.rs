//! Serving side of notifications.
//!
//! Keeps an explicit subscriber set per provided notification and fans a
//! raised payload out to every subscriber. Sends happen outside the lock on
//! a snapshot of the set.

use crate::protocol::ProtocolLayer;
use accord_core::{
    CapabilityCatalog, CapabilityDescriptor, CapabilityKind, EndpointId, InteractionMessage,
};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PublishError {
    #[error("{0} is not a provided notification")]
    UnknownNotification(CapabilityDescriptor),
}

/// Subscriber bookkeeping and broadcast for local notifications.
pub struct NotificationPublisher {
    catalog: Arc<CapabilityCatalog>,
    protocol: Arc<dyn ProtocolLayer>,
    subscribers: Mutex<HashMap<CapabilityDescriptor, BTreeSet<EndpointId>>>,
}

impl NotificationPublisher {
    pub fn new(catalog: Arc<CapabilityCatalog>, protocol: Arc<dyn ProtocolLayer>) -> Self {
        Self {
            catalog,
            protocol,
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    /// Returns false if the endpoint was already subscribed.
    pub fn subscribe(
        &self,
        endpoint: &EndpointId,
        notification: &CapabilityDescriptor,
    ) -> Result<bool, PublishError> {
        if !self.catalog.provides(CapabilityKind::Notification, notification) {
            return Err(PublishError::UnknownNotification(notification.clone()));
        }
        let added = self
            .subscribers
            .lock()
            .entry(notification.clone())
            .or_default()
            .insert(endpoint.clone());
        debug!(%endpoint, %notification, added, "notification subscription");
        Ok(added)
    }

    pub fn unsubscribe(&self, endpoint: &EndpointId, notification: &CapabilityDescriptor) -> bool {
        let mut subscribers = self.subscribers.lock();
        let Some(set) = subscribers.get_mut(notification) else {
            return false;
        };
        let removed = set.remove(endpoint);
        if set.is_empty() {
            subscribers.remove(notification);
        }
        removed
    }

    /// Forget every subscription of a disconnected endpoint.
    pub fn remove_endpoint(&self, endpoint: &EndpointId) -> usize {
        let mut subscribers = self.subscribers.lock();
        let mut removed = 0;
        subscribers.retain(|_, set| {
            if set.remove(endpoint) {
                removed += 1;
            }
            !set.is_empty()
        });
        removed
    }

    pub fn subscribers(&self, notification: &CapabilityDescriptor) -> Vec<EndpointId> {
        self.subscribers
            .lock()
            .get(notification)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Send `payload` to every current subscriber. Returns how many sends
    /// succeeded; failures are logged and skipped.
    pub async fn raise(&self, notification: &CapabilityDescriptor, payload: Value) -> usize {
        let targets = self.subscribers(notification);
        let mut delivered = 0;
        for endpoint in targets {
            let message = self.protocol.envelope(InteractionMessage::NotificationRaised {
                notification: notification.clone(),
                payload: payload.clone(),
            });
            match self.protocol.send_message_to(&endpoint, message).await {
                Ok(()) => delivered += 1,
                Err(err) => {
                    warn!(%endpoint, %notification, "failed to deliver notification: {err}")
                }
            }
        }
        delivered
    }
}
