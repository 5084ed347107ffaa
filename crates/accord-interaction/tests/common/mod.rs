#![allow(dead_code)]

use accord_interaction::accord_core::{
    CapabilityCatalog, CapabilityDescriptor, CapabilityKind, CapabilityVersion, Contract,
    EndpointId, SubjectGroup, VersionedCapability, VersionedFallbackSet,
};
use accord_interaction::{
    CapabilityDefinition, CapabilityRegistry, HandshakeOutcome, InteractionNode,
    InteractionNodeBuilder, InvocationFault, LoopbackNetwork, ParameterOrigin,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

const WAIT: Duration = Duration::from_secs(5);

pub struct ReadingV1;
pub struct ReadingV2;
pub struct Alarm;

impl Contract for ReadingV1 {
    const KIND: CapabilityKind = CapabilityKind::Command;

    fn descriptor() -> CapabilityDescriptor {
        CapabilityDescriptor::new("telemetry.Reading", "telemetry-v1")
    }
}

impl Contract for ReadingV2 {
    const KIND: CapabilityKind = CapabilityKind::Command;

    fn descriptor() -> CapabilityDescriptor {
        CapabilityDescriptor::new("telemetry.Reading", "telemetry-v2")
    }
}

impl Contract for Alarm {
    const KIND: CapabilityKind = CapabilityKind::Notification;

    fn descriptor() -> CapabilityDescriptor {
        CapabilityDescriptor::new("telemetry.Alarm", "telemetry-v1")
    }
}

fn alarm_set() -> VersionedFallbackSet {
    VersionedFallbackSet::single(Alarm::descriptor(), CapabilityVersion::of(1, 0))
}

/// Offers `Telemetry` with both reading versions and the alarm.
pub fn sensor_catalog() -> CapabilityCatalog {
    let readings = VersionedFallbackSet::new(vec![
        VersionedCapability::new(ReadingV1::descriptor(), CapabilityVersion::of(1, 0)),
        VersionedCapability::new(ReadingV2::descriptor(), CapabilityVersion::of(2, 0)),
    ])
    .unwrap();
    let mut catalog = CapabilityCatalog::new();
    catalog
        .provide(
            SubjectGroup::new("Telemetry")
                .with_command(readings)
                .with_notification(alarm_set()),
        )
        .unwrap();
    catalog
}

/// Requires `Telemetry` at reading v1.0 plus the alarm.
pub fn monitor_catalog() -> CapabilityCatalog {
    let mut catalog = CapabilityCatalog::new();
    catalog
        .require(
            SubjectGroup::new("Telemetry")
                .with_command(VersionedFallbackSet::single(
                    ReadingV1::descriptor(),
                    CapabilityVersion::of(1, 0),
                ))
                .with_notification(alarm_set()),
        )
        .unwrap();
    catalog
}

/// `read(sensor, caller)` returns both, `reset()` returns nothing and
/// `explode()` faults.
pub fn sensor_registry() -> CapabilityRegistry {
    let mut registry = CapabilityRegistry::new();
    registry
        .register(
            CapabilityDefinition::new(ReadingV1::descriptor(), "read", |_ctx, args| async move {
                Ok(Some(json!({ "sensor": args[0], "caller": args[1] })))
            })
            .param("sensor")
            .param_from("caller", ParameterOrigin::InvokingEndpointId)
            .returning(),
        )
        .unwrap();
    registry
        .register(CapabilityDefinition::new(
            ReadingV1::descriptor(),
            "reset",
            |_ctx, _args| async { Ok(None) },
        ))
        .unwrap();
    registry
        .register(CapabilityDefinition::new(
            ReadingV1::descriptor(),
            "explode",
            |_ctx, _args| async { Err(InvocationFault::failed("sensor on fire")) },
        ))
        .unwrap();
    registry
        .register(CapabilityDefinition::new(
            ReadingV2::descriptor(),
            "read",
            |_ctx, _args| async { Ok(None) },
        ))
        .unwrap();
    registry
}

pub struct Peer {
    pub id: EndpointId,
    pub node: InteractionNode,
    pub outcomes: broadcast::Receiver<HandshakeOutcome>,
}

impl Peer {
    /// Next handshake outcome concerning `endpoint`.
    pub async fn outcome_for(&mut self, endpoint: &EndpointId) -> HandshakeOutcome {
        let wait = async {
            loop {
                let outcome = self.outcomes.recv().await.expect("outcome channel closed");
                if &outcome.endpoint == endpoint {
                    return outcome;
                }
            }
        };
        tokio::time::timeout(WAIT, wait)
            .await
            .expect("no handshake outcome in time")
    }
}

/// Join `network` as `local:<name>` and start pumping events.
pub fn spawn_peer(
    network: &Arc<LoopbackNetwork>,
    name: &str,
    configure: impl FnOnce(InteractionNodeBuilder) -> InteractionNodeBuilder,
) -> Peer {
    let id = EndpointId::local(name);
    let (transport, events) = network.join(id.clone());
    let node = configure(InteractionNode::builder(transport)).build();
    let outcomes = node.handshake_outcomes();
    node.spawn(events);
    Peer { id, node, outcomes }
}

pub fn sensor(network: &Arc<LoopbackNetwork>, name: &str) -> Peer {
    spawn_peer(network, name, |b| b.catalog(sensor_catalog()).registry(sensor_registry()))
}

pub fn monitor(network: &Arc<LoopbackNetwork>, name: &str) -> Peer {
    spawn_peer(network, name, |b| b.catalog(monitor_catalog()))
}

/// Poll `condition` until it holds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    let wait = async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(WAIT, wait)
        .await
        .expect("condition not reached in time");
}
