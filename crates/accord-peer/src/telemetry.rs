//! Built-in `Telemetry` subject.
//!
//! Sensors provide two generations of the reading command and an alarm
//! notification. Monitors require the first reading generation and the
//! alarm; once a sensor is approved they take a reading and follow its
//! alarms.

use crate::config::Role;
use accord_core::{
    CapabilityCatalog, CapabilityDescriptor, CapabilityKind, CapabilityVersion, CatalogError,
    Contract, EndpointId, HandshakeStatus, SubjectGroup, VersionedCapability,
    VersionedFallbackSet, WireParameter,
};
use accord_interaction::{
    CapabilityDefinition, CapabilityRegistry, InteractionNode, InvocationFault, ParameterOrigin,
    RegistryError,
};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

pub const SUBJECT: &str = "Telemetry";

/// `read(sensor) -> { sensor, value, caller }`, first generation.
pub struct ReadingV1;

/// Second generation of the reading command.
pub struct ReadingV2;

/// Raised by sensors when a reading crosses the threshold.
pub struct Alarm;

impl Contract for ReadingV1 {
    const KIND: CapabilityKind = CapabilityKind::Command;

    fn descriptor() -> CapabilityDescriptor {
        CapabilityDescriptor::new("telemetry.Reading", "accord-telemetry/1")
    }
}

impl Contract for ReadingV2 {
    const KIND: CapabilityKind = CapabilityKind::Command;

    fn descriptor() -> CapabilityDescriptor {
        CapabilityDescriptor::new("telemetry.Reading", "accord-telemetry/2")
    }
}

impl Contract for Alarm {
    const KIND: CapabilityKind = CapabilityKind::Notification;

    fn descriptor() -> CapabilityDescriptor {
        CapabilityDescriptor::new("telemetry.Alarm", "accord-telemetry/1")
    }
}

fn alarm() -> VersionedFallbackSet {
    VersionedFallbackSet::single(Alarm::descriptor(), CapabilityVersion::of(1, 0))
}

/// Catalog for `role`.
pub fn catalog(role: Role) -> Result<CapabilityCatalog, CatalogError> {
    let mut catalog = CapabilityCatalog::new();
    if role.provides() {
        let readings = VersionedFallbackSet::new(vec![
            VersionedCapability::new(ReadingV1::descriptor(), CapabilityVersion::of(1, 0)),
            VersionedCapability::new(ReadingV2::descriptor(), CapabilityVersion::of(2, 0)),
        ])?;
        catalog.provide(
            SubjectGroup::new(SUBJECT)
                .with_command(readings)
                .with_notification(alarm()),
        )?;
    }
    if role.requires() {
        catalog.require(
            SubjectGroup::new(SUBJECT)
                .with_command(VersionedFallbackSet::single(
                    ReadingV1::descriptor(),
                    CapabilityVersion::of(1, 0),
                ))
                .with_notification(alarm()),
        )?;
    }
    Ok(catalog)
}

/// Readings drift upwards with every call so alarms eventually fire.
#[derive(Default)]
pub struct Gauge {
    ticks: AtomicU64,
}

impl Gauge {
    pub const THRESHOLD: f64 = 80.0;

    pub fn sample(&self, sensor: &str) -> f64 {
        let tick = self.ticks.fetch_add(1, Ordering::Relaxed);
        let base = sensor.bytes().map(u64::from).sum::<u64>() % 40;
        (base + tick * 7 % 60) as f64
    }
}

/// Implementations of the provided commands.
pub fn registry(role: Role, gauge: Arc<Gauge>) -> Result<CapabilityRegistry, RegistryError> {
    let mut registry = CapabilityRegistry::new();
    if !role.provides() {
        return Ok(registry);
    }

    let v1 = gauge.clone();
    registry.register(
        CapabilityDefinition::new(ReadingV1::descriptor(), "read", move |_ctx, args| {
            let gauge = v1.clone();
            async move {
                let Some(sensor) = args.first().and_then(Value::as_str) else {
                    return Err(InvocationFault::failed("sensor must be a string"));
                };
                let caller = args.get(1).cloned().unwrap_or(Value::Null);
                Ok(Some(json!({
                    "sensor": sensor,
                    "value": gauge.sample(sensor),
                    "caller": caller,
                })))
            }
        })
        .param("sensor")
        .param_from("caller", ParameterOrigin::InvokingEndpointId)
        .returning(),
    )?;

    registry.register(
        CapabilityDefinition::new(ReadingV2::descriptor(), "read", move |ctx, args| {
            let gauge = gauge.clone();
            async move {
                let sensor = args.first().and_then(Value::as_str).unwrap_or("default");
                Ok(Some(json!({
                    "sensor": sensor,
                    "value": gauge.sample(sensor),
                    "unit": "celsius",
                    "request": ctx.request_id.to_string(),
                })))
            }
        })
        .param("sensor")
        .returning(),
    )?;

    Ok(registry)
}

/// Raise an alarm every `interval` while readings exceed the threshold.
pub async fn raise_alarms(node: InteractionNode, gauge: Arc<Gauge>, interval: Duration) {
    let sensor = node.local_endpoint().address().to_string();
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let value = gauge.sample(&sensor);
        if value < Gauge::THRESHOLD {
            continue;
        }
        let delivered = node
            .raise_contract::<Alarm>(json!({ "sensor": sensor, "value": value }))
            .await;
        tracing::info!(value, delivered, "alarm raised");
    }
}

/// Take a reading from every approved sensor and follow its alarms.
pub async fn monitor(node: InteractionNode) {
    let mut outcomes = node.handshake_outcomes();
    loop {
        let outcome = match outcomes.recv().await {
            Ok(outcome) => outcome,
            Err(RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "missed handshake outcomes");
                continue;
            }
            Err(RecvError::Closed) => return,
        };
        if outcome.status != HandshakeStatus::Approved || outcome.commands.is_empty() {
            continue;
        }
        tokio::spawn(follow(node.clone(), outcome.endpoint));
    }
}

async fn follow(node: InteractionNode, sensor: EndpointId) {
    if let Some(reading) = node.command_for::<ReadingV1>(&sensor) {
        let name = sensor.address().to_string();
        match reading.invoke("read", vec![WireParameter::new("sensor", name)]).await {
            Ok(value) => tracing::info!(%sensor, ?value, "reading"),
            Err(e) => tracing::warn!(%sensor, "reading failed: {e}"),
        }
    }

    let Some(alarm) = node.notification_for::<Alarm>(&sensor) else {
        return;
    };
    let mut alarms = match alarm.subscribe().await {
        Ok(alarms) => alarms,
        Err(e) => {
            tracing::warn!(%sensor, "alarm subscription failed: {e}");
            return;
        }
    };
    // The hub holds the last reference; the stream closes on disconnect.
    drop(alarm);
    loop {
        match alarms.recv().await {
            Ok(payload) => tracing::warn!(%sensor, %payload, "ALARM"),
            Err(RecvError::Lagged(missed)) => tracing::debug!(%sensor, missed, "alarms dropped"),
            Err(RecvError::Closed) => break,
        }
    }
    tracing::debug!(%sensor, "stopped following alarms");
}
