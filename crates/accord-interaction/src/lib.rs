//! Runtime of the Accord interaction layer.
//!
//! An [`InteractionNode`] sits on top of any [`ProtocolLayer`]. For every
//! connected endpoint it negotiates which commands and notifications both
//! sides understand ([`HandshakeConductor`]), keeps local stand-ins for the
//! remote side's capabilities ([`ProxyHub`]), serves inbound invocations
//! from the [`CapabilityRegistry`] ([`InvocationDispatcher`]) and fans local
//! notifications out to subscribers ([`NotificationPublisher`]).
//!
//! [`LoopbackNetwork`] provides an in-process transport.

mod command;
mod config;
mod dispatcher;
mod handshake;
mod hub;
mod loopback;
mod node;
mod notification;
mod protocol;
mod publisher;
mod registry;

pub use command::{CommandProxyFactory, InvocationError, RemoteCommand};
pub use config::NodeConfig;
pub use dispatcher::{DispatchError, InvocationDispatcher, resolve_arguments};
pub use handshake::{AdmitAll, HandshakeConductor, HandshakeOutcome, HandshakePolicy};
pub use hub::{HubError, HubEvent, ProxyFactory, ProxyHub, SignInTarget};
pub use loopback::{Delivery, LoopbackNetwork, LoopbackTransport};
pub use node::{InteractionNode, InteractionNodeBuilder};
pub use notification::{NotificationProxyFactory, RemoteNotification};
pub use protocol::{InboundEvent, ProtocolLayer, TransportError};
pub use publisher::{NotificationPublisher, PublishError};
pub use registry::{
    CapabilityDefinition, CapabilityHandler, CapabilityId, CapabilityRegistry, HandlerResult,
    InvocationContext, InvocationFault, ParameterOrigin, ParameterSpec, RegistryError,
};

pub use accord_core;
