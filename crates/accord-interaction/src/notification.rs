//! Notification stand-ins.
//!
//! A [`RemoteNotification`] represents one push notification of one remote
//! endpoint. Local listeners subscribe to a broadcast channel; the remote
//! is asked to start sending only once, on the first subscription.

use crate::command::InvocationError;
use crate::hub::{HubError, ProxyFactory};
use crate::protocol::ProtocolLayer;
use accord_core::{CapabilityDescriptor, EndpointId, InteractionMessage};
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, broadcast};
use tracing::debug;

/// Stand-in for a notification raised by a remote endpoint.
pub struct RemoteNotification {
    endpoint: EndpointId,
    capability: CapabilityDescriptor,
    protocol: Arc<dyn ProtocolLayer>,
    payloads: broadcast::Sender<Value>,
    /// Held across the subscribe and unsubscribe sends.
    registration: Mutex<()>,
    subscribed: AtomicBool,
}

impl RemoteNotification {
    pub fn new(
        endpoint: EndpointId,
        capability: CapabilityDescriptor,
        protocol: Arc<dyn ProtocolLayer>,
        capacity: usize,
    ) -> Self {
        let (payloads, _) = broadcast::channel(capacity.max(1));
        Self {
            endpoint,
            capability,
            protocol,
            payloads,
            registration: Mutex::new(()),
            subscribed: AtomicBool::new(false),
        }
    }

    pub fn endpoint(&self) -> &EndpointId {
        &self.endpoint
    }

    pub fn capability(&self) -> &CapabilityDescriptor {
        &self.capability
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscribed.load(Ordering::Acquire)
    }

    /// Receive future payloads. Registers interest with the remote on
    /// first use; callers arriving meanwhile wait for that registration
    /// and retry it if it failed.
    pub async fn subscribe(&self) -> Result<broadcast::Receiver<Value>, InvocationError> {
        let _registration = self.registration.lock().await;
        if !self.subscribed.load(Ordering::Acquire) {
            let message = self.protocol.envelope(InteractionMessage::SubscribeNotification {
                notification: self.capability.clone(),
            });
            self.protocol.send_message_to(&self.endpoint, message).await?;
            self.subscribed.store(true, Ordering::Release);
            debug!(
                endpoint = %self.endpoint,
                capability = %self.capability,
                "subscribed to remote notification"
            );
        }
        Ok(self.payloads.subscribe())
    }

    /// Ask the remote to stop sending. Existing receivers see no more payloads.
    pub async fn unsubscribe(&self) -> Result<(), InvocationError> {
        let _registration = self.registration.lock().await;
        if self.subscribed.swap(false, Ordering::AcqRel) {
            let message = self.protocol.envelope(InteractionMessage::UnsubscribeNotification {
                notification: self.capability.clone(),
            });
            self.protocol.send_message_to(&self.endpoint, message).await?;
        }
        Ok(())
    }

    /// Hand a raised payload to local receivers. Returns how many got it.
    pub fn deliver(&self, payload: Value) -> usize {
        if !self.is_subscribed() {
            return 0;
        }
        self.payloads.send(payload).unwrap_or(0)
    }
}

impl std::fmt::Debug for RemoteNotification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteNotification")
            .field("endpoint", &self.endpoint)
            .field("capability", &self.capability)
            .field("subscribed", &self.is_subscribed())
            .finish_non_exhaustive()
    }
}

/// Builds [`RemoteNotification`]s over a shared protocol layer.
pub struct NotificationProxyFactory {
    protocol: Arc<dyn ProtocolLayer>,
    capacity: usize,
}

impl NotificationProxyFactory {
    pub fn new(protocol: Arc<dyn ProtocolLayer>, capacity: usize) -> Self {
        Self { protocol, capacity }
    }
}

impl ProxyFactory<RemoteNotification> for NotificationProxyFactory {
    fn build(
        &self,
        endpoint: &EndpointId,
        capability: &CapabilityDescriptor,
    ) -> Result<RemoteNotification, HubError> {
        Ok(RemoteNotification::new(
            endpoint.clone(),
            capability.clone(),
            Arc::clone(&self.protocol),
            self.capacity,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::TransportError;
    use accord_core::Envelope;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    struct Outbox {
        local: EndpointId,
        sent: Mutex<Vec<InteractionMessage>>,
    }

    #[async_trait]
    impl ProtocolLayer for Outbox {
        fn local_endpoint(&self) -> &EndpointId {
            &self.local
        }

        async fn send_message_to(
            &self,
            _endpoint: &EndpointId,
            envelope: Envelope,
        ) -> Result<(), TransportError> {
            self.sent.lock().push(envelope.body);
            Ok(())
        }

        async fn send_message_and_await(
            &self,
            endpoint: &EndpointId,
            _envelope: Envelope,
        ) -> Result<Envelope, TransportError> {
            Err(TransportError::EndpointUnreachable(endpoint.clone()))
        }
    }

    /// Fails the first send once released, accepts the rest.
    struct FlakyOnce {
        local: EndpointId,
        release: Arc<Notify>,
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl ProtocolLayer for FlakyOnce {
        fn local_endpoint(&self) -> &EndpointId {
            &self.local
        }

        async fn send_message_to(
            &self,
            endpoint: &EndpointId,
            _envelope: Envelope,
        ) -> Result<(), TransportError> {
            if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                self.release.notified().await;
                return Err(TransportError::Disconnected(endpoint.clone()));
            }
            Ok(())
        }

        async fn send_message_and_await(
            &self,
            endpoint: &EndpointId,
            _envelope: Envelope,
        ) -> Result<Envelope, TransportError> {
            Err(TransportError::EndpointUnreachable(endpoint.clone()))
        }
    }

    fn alarm() -> CapabilityDescriptor {
        CapabilityDescriptor::new("telemetry::Alarm", "telemetry-contracts")
    }

    fn stand_in() -> (Arc<Outbox>, RemoteNotification) {
        let outbox = Arc::new(Outbox {
            local: EndpointId::local("listener"),
            sent: Mutex::new(Vec::new()),
        });
        let proxy = NotificationProxyFactory::new(outbox.clone(), 4)
            .build(&EndpointId::local("sensor"), &alarm())
            .unwrap();
        (outbox, proxy)
    }

    #[tokio::test]
    async fn first_subscription_registers_once() {
        let (outbox, proxy) = stand_in();
        let _a = proxy.subscribe().await.unwrap();
        let _b = proxy.subscribe().await.unwrap();

        let sent = outbox.sent.lock();
        assert_eq!(
            *sent,
            vec![InteractionMessage::SubscribeNotification { notification: alarm() }]
        );
    }

    #[tokio::test]
    async fn payloads_reach_every_receiver() {
        let (_outbox, proxy) = stand_in();
        let mut a = proxy.subscribe().await.unwrap();
        let mut b = proxy.subscribe().await.unwrap();

        assert_eq!(proxy.deliver(json!({"level": 3})), 2);
        assert_eq!(a.recv().await.unwrap(), json!({"level": 3}));
        assert_eq!(b.recv().await.unwrap(), json!({"level": 3}));
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let (outbox, proxy) = stand_in();
        let _rx = proxy.subscribe().await.unwrap();
        proxy.unsubscribe().await.unwrap();
        proxy.unsubscribe().await.unwrap();

        assert!(!proxy.is_subscribed());
        assert_eq!(proxy.deliver(json!(1)), 0);
        assert_eq!(outbox.sent.lock().len(), 2);
    }

    #[tokio::test]
    async fn concurrent_subscriber_waits_for_a_failed_registration() {
        let release = Arc::new(Notify::new());
        let protocol = Arc::new(FlakyOnce {
            local: EndpointId::local("listener"),
            release: release.clone(),
            attempts: AtomicUsize::new(0),
        });
        let proxy = Arc::new(RemoteNotification::new(
            EndpointId::local("sensor"),
            alarm(),
            protocol.clone(),
            4,
        ));
        let subscribe = |proxy: Arc<RemoteNotification>| {
            tokio::spawn(async move { proxy.subscribe().await.map(drop) })
        };

        let first = subscribe(proxy.clone());
        while protocol.attempts.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        let second = subscribe(proxy.clone());
        release.notify_one();

        assert!(first.await.unwrap().is_err());
        assert!(second.await.unwrap().is_ok());
        assert_eq!(protocol.attempts.load(Ordering::SeqCst), 2);
        assert!(proxy.is_subscribed());
    }

    #[test]
    fn deliver_without_subscription_is_dropped() {
        let (_outbox, proxy) = stand_in();
        assert_eq!(proxy.deliver(json!(1)), 0);
    }
}
