//! The interaction node.
//!
//! [`InteractionNode`] wires the catalog, handshake conductor, proxy hubs,
//! dispatcher and publisher together behind one cheap-to-clone handle and
//! routes transport events to them.

use crate::command::{CommandProxyFactory, RemoteCommand};
use crate::config::NodeConfig;
use crate::dispatcher::InvocationDispatcher;
use crate::handshake::{AdmitAll, HandshakeConductor, HandshakeOutcome, HandshakePolicy};
use crate::hub::{HubEvent, ProxyFactory, ProxyHub};
use crate::notification::{NotificationProxyFactory, RemoteNotification};
use crate::protocol::{InboundEvent, ProtocolLayer};
use crate::publisher::{NotificationPublisher, PublishError};
use crate::registry::{CapabilityId, CapabilityRegistry};
use accord_core::{
    CapabilityCatalog, CapabilityDescriptor, CapabilityKind, Contract, EndpointId, Envelope,
    HandshakeStatus, InteractionMessage,
};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

struct NodeInner {
    protocol: Arc<dyn ProtocolLayer>,
    catalog: Arc<CapabilityCatalog>,
    config: NodeConfig,
    conductor: HandshakeConductor,
    commands: Arc<ProxyHub<RemoteCommand>>,
    notifications: Arc<ProxyHub<RemoteNotification>>,
    dispatcher: InvocationDispatcher,
    publisher: NotificationPublisher,
}

/// One endpoint's interaction layer.
#[derive(Clone)]
pub struct InteractionNode {
    inner: Arc<NodeInner>,
}

/// Builder for [`InteractionNode`].
pub struct InteractionNodeBuilder {
    protocol: Arc<dyn ProtocolLayer>,
    catalog: CapabilityCatalog,
    registry: CapabilityRegistry,
    policy: Arc<dyn HandshakePolicy>,
    config: NodeConfig,
    command_factory: Option<Arc<dyn ProxyFactory<RemoteCommand>>>,
    notification_factory: Option<Arc<dyn ProxyFactory<RemoteNotification>>>,
}

impl InteractionNodeBuilder {
    pub fn catalog(mut self, catalog: CapabilityCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn registry(mut self, registry: CapabilityRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn policy(mut self, policy: impl HandshakePolicy + 'static) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    pub fn config(mut self, config: NodeConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the built-in [`CommandProxyFactory`].
    pub fn command_factory(mut self, factory: impl ProxyFactory<RemoteCommand> + 'static) -> Self {
        self.command_factory = Some(Arc::new(factory));
        self
    }

    /// Replace the built-in [`NotificationProxyFactory`].
    pub fn notification_factory(
        mut self,
        factory: impl ProxyFactory<RemoteNotification> + 'static,
    ) -> Self {
        self.notification_factory = Some(Arc::new(factory));
        self
    }

    pub fn build(self) -> InteractionNode {
        let Self {
            protocol,
            catalog,
            registry,
            policy,
            config,
            command_factory,
            notification_factory,
        } = self;

        let local = protocol.local_endpoint().clone();
        let missing = registry.unimplemented(&catalog);
        if !missing.is_empty() {
            warn!(
                endpoint = %local,
                ?missing,
                "provided commands without a registered implementation"
            );
        }

        let capacity = config.channel_capacity();
        let command_factory = command_factory.unwrap_or_else(|| {
            Arc::new(CommandProxyFactory::new(
                protocol.clone(),
                config.invocation_timeout(),
            ))
        });
        let notification_factory = notification_factory
            .unwrap_or_else(|| Arc::new(NotificationProxyFactory::new(protocol.clone(), capacity)));

        let catalog = Arc::new(catalog);
        let commands = Arc::new(ProxyHub::new(CapabilityKind::Command, command_factory, capacity));
        let notifications = Arc::new(ProxyHub::new(
            CapabilityKind::Notification,
            notification_factory,
            capacity,
        ));
        let conductor = HandshakeConductor::new(
            protocol.clone(),
            catalog.clone(),
            policy,
            commands.clone(),
            notifications.clone(),
            &config,
        );
        let dispatcher = InvocationDispatcher::new(Arc::new(registry), protocol.clone());
        let publisher = NotificationPublisher::new(catalog.clone(), protocol.clone());

        info!(
            endpoint = %local,
            subjects = catalog.subjects().count(),
            commands = dispatcher.registry().len(),
            "interaction node ready"
        );

        InteractionNode {
            inner: Arc::new(NodeInner {
                protocol,
                catalog,
                config,
                conductor,
                commands,
                notifications,
                dispatcher,
                publisher,
            }),
        }
    }
}

impl InteractionNode {
    pub fn builder(protocol: Arc<dyn ProtocolLayer>) -> InteractionNodeBuilder {
        InteractionNodeBuilder {
            protocol,
            catalog: CapabilityCatalog::new(),
            registry: CapabilityRegistry::new(),
            policy: Arc::new(AdmitAll),
            config: NodeConfig::default(),
            command_factory: None,
            notification_factory: None,
        }
    }

    pub fn local_endpoint(&self) -> &EndpointId {
        self.inner.protocol.local_endpoint()
    }

    pub fn catalog(&self) -> &CapabilityCatalog {
        &self.inner.catalog
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    pub fn conductor(&self) -> &HandshakeConductor {
        &self.inner.conductor
    }

    pub fn commands(&self) -> &ProxyHub<RemoteCommand> {
        &self.inner.commands
    }

    pub fn notifications(&self) -> &ProxyHub<RemoteNotification> {
        &self.inner.notifications
    }

    pub fn handshake_status(&self, endpoint: &EndpointId) -> HandshakeStatus {
        self.inner.conductor.status(endpoint)
    }

    /// Command stand-in for contract `C` on `endpoint`.
    pub fn command_for<C: Contract>(&self, endpoint: &EndpointId) -> Option<Arc<RemoteCommand>> {
        self.inner.commands.capability_of::<C>(endpoint)
    }

    /// Notification stand-in for contract `C` on `endpoint`.
    pub fn notification_for<C: Contract>(
        &self,
        endpoint: &EndpointId,
    ) -> Option<Arc<RemoteNotification>> {
        self.inner.notifications.capability_of::<C>(endpoint)
    }

    pub fn command_events(&self) -> broadcast::Receiver<HubEvent> {
        self.inner.commands.subscribe()
    }

    pub fn notification_events(&self) -> broadcast::Receiver<HubEvent> {
        self.inner.notifications.subscribe()
    }

    pub fn handshake_outcomes(&self) -> broadcast::Receiver<HandshakeOutcome> {
        self.inner.conductor.subscribe()
    }

    /// Endpoints currently subscribed to a local notification.
    pub fn subscribers(&self, notification: &CapabilityDescriptor) -> Vec<EndpointId> {
        self.inner.publisher.subscribers(notification)
    }

    /// Fire a provided notification. Returns the number of subscribers reached.
    pub async fn raise(&self, notification: &CapabilityDescriptor, payload: Value) -> usize {
        self.inner.publisher.raise(notification, payload).await
    }

    /// [`raise`](Self::raise) for contract `C`.
    pub async fn raise_contract<C: Contract>(&self, payload: Value) -> usize {
        self.raise(&C::descriptor(), payload).await
    }

    /// Pump transport events until the sender side closes.
    pub async fn run(self, mut events: mpsc::UnboundedReceiver<InboundEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_event(event).await;
        }
        info!(endpoint = %self.local_endpoint(), "transport closed, interaction node stopped");
    }

    /// Spawn [`run`](Self::run) on the current runtime.
    pub fn spawn(
        &self,
        events: mpsc::UnboundedReceiver<InboundEvent>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.clone().run(events))
    }

    /// Apply one transport event.
    ///
    /// State changes happen before this returns, in event order. Anything
    /// that waits on the remote side runs on its own task.
    pub async fn handle_event(&self, event: InboundEvent) {
        match event {
            InboundEvent::Connected(endpoint) => {
                debug!(%endpoint, "endpoint connected");
                if self.inner.conductor.begin(&endpoint) {
                    self.spawn_initiate(endpoint);
                }
            }
            InboundEvent::Disconnected(endpoint) => self.endpoint_disconnected(&endpoint),
            InboundEvent::Message(envelope) => self.message_received(envelope).await,
        }
    }

    fn endpoint_disconnected(&self, endpoint: &EndpointId) {
        let inner = &self.inner;
        let interrupted = inner.conductor.endpoint_disconnected(endpoint);
        let had_commands = inner.commands.on_endpoint_signed_off(endpoint);
        let had_notifications = inner.notifications.on_endpoint_signed_off(endpoint);
        let subscriptions = inner.publisher.remove_endpoint(endpoint);
        info!(
            %endpoint,
            interrupted,
            had_commands,
            had_notifications,
            subscriptions,
            "endpoint disconnected"
        );
    }

    async fn message_received(&self, envelope: Envelope) {
        let Envelope { id, sender, body } = envelope;
        match body {
            InteractionMessage::CapabilityOffer { subjects } => {
                let inner = &self.inner;
                if inner.conductor.answer_offer(&sender, id, subjects).await {
                    self.spawn_initiate(sender);
                }
            }
            InteractionMessage::InvokeCapability {
                capability,
                member,
                parameters,
            } => {
                let inner = self.inner.clone();
                tokio::spawn(async move {
                    let capability = CapabilityId::new(capability, member);
                    inner
                        .dispatcher
                        .invoke(&sender, id, capability, parameters)
                        .await;
                });
            }
            InteractionMessage::SubscribeNotification { notification } => {
                if let Err(PublishError::UnknownNotification(n)) =
                    self.inner.publisher.subscribe(&sender, &notification)
                {
                    warn!(
                        endpoint = %sender,
                        notification = %n,
                        "subscription to unknown notification ignored"
                    );
                }
            }
            InteractionMessage::UnsubscribeNotification { notification } => {
                self.inner.publisher.unsubscribe(&sender, &notification);
            }
            InteractionMessage::NotificationRaised {
                notification,
                payload,
            } => match self.inner.notifications.capability_for(&sender, &notification) {
                Some(stand_in) => {
                    let receivers = stand_in.deliver(payload);
                    debug!(endpoint = %sender, %notification, receivers, "notification delivered");
                }
                None => {
                    debug!(
                        endpoint = %sender,
                        %notification,
                        "notification without a stand-in dropped"
                    );
                }
            },
            other => {
                debug!(endpoint = %sender, kind = other.kind(), "unsolicited response dropped");
            }
        }
    }

    fn spawn_initiate(&self, endpoint: EndpointId) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner.conductor.initiate_handshake_with(&endpoint).await;
        });
    }
}

impl std::fmt::Debug for InteractionNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InteractionNode")
            .field("endpoint", self.local_endpoint())
            .finish_non_exhaustive()
    }
}
