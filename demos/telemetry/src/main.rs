//! Telemetry over the loopback transport.
//!
//! A sensor offers two generations of the reading command; a monitor only
//! knows the first. After the handshake the monitor holds a stand-in for
//! reading v1.0, calls it, and follows the sensor's alarms.
//!
//!   cargo run -p accord-demo-telemetry

use accord_core::{Contract, EndpointId, WireParameter};
use accord_interaction::{InteractionNode, LoopbackNetwork};
use accord_peer::Role;
use accord_peer::telemetry::{self, Alarm, Gauge, ReadingV1, ReadingV2};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

fn node(network: &Arc<LoopbackNetwork>, name: &str, role: Role) -> anyhow::Result<InteractionNode> {
    let (transport, events) = network.join(EndpointId::local(name));
    let node = InteractionNode::builder(transport)
        .catalog(telemetry::catalog(role)?)
        .registry(telemetry::registry(role, Arc::new(Gauge::default()))?)
        .build();
    node.spawn(events);
    Ok(node)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("accord=info".parse()?))
        .init();

    let network = LoopbackNetwork::new();
    let sensor = node(&network, "sensor", Role::Sensor)?;
    let monitor = node(&network, "monitor", Role::Monitor)?;
    let mut outcomes = monitor.handshake_outcomes();

    network.connect(sensor.local_endpoint(), monitor.local_endpoint());
    let outcome = tokio::time::timeout(Duration::from_secs(5), outcomes.recv()).await??;
    tracing::info!(
        status = ?outcome.status,
        commands = ?outcome.commands,
        "monitor finished handshake"
    );

    let sensor_id = sensor.local_endpoint().clone();
    anyhow::ensure!(
        monitor.command_for::<ReadingV2>(&sensor_id).is_none(),
        "v2 should not be selected"
    );
    let reading = monitor
        .command_for::<ReadingV1>(&sensor_id)
        .ok_or_else(|| anyhow::anyhow!("no reading stand-in"))?;
    let value = reading
        .invoke("read", vec![WireParameter::new("sensor", "boiler")])
        .await?;
    tracing::info!(?value, "reading");

    let mut alarms = monitor
        .notification_for::<Alarm>(&sensor_id)
        .ok_or_else(|| anyhow::anyhow!("no alarm stand-in"))?
        .subscribe()
        .await?;
    while sensor.subscribers(&Alarm::descriptor()).is_empty() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    sensor
        .raise_contract::<Alarm>(json!({ "sensor": "boiler", "value": 97.0 }))
        .await;
    let alarm = tokio::time::timeout(Duration::from_secs(5), alarms.recv()).await??;
    tracing::warn!(%alarm, "alarm received");

    network.disconnect(&sensor_id, monitor.local_endpoint());
    while monitor.command_for::<ReadingV1>(&sensor_id).is_some() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tracing::info!("sensor gone, stand-ins dropped");
    Ok(())
}
