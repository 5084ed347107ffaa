mod common;

use accord_interaction::LoopbackNetwork;
use accord_interaction::accord_core::Contract;
use common::{Alarm, monitor, sensor};
use serde_json::json;

#[tokio::test]
async fn alarm_fans_out_to_every_subscriber() {
    let network = LoopbackNetwork::new();
    let a = sensor(&network, "a");
    let mut b = monitor(&network, "b");
    let mut c = monitor(&network, "c");
    network.connect(&a.id, &b.id);
    network.connect(&a.id, &c.id);
    b.outcome_for(&a.id).await;
    c.outcome_for(&a.id).await;

    let mut at_b = b.node.notification_for::<Alarm>(&a.id).unwrap().subscribe().await.unwrap();
    let mut at_c = c.node.notification_for::<Alarm>(&a.id).unwrap().subscribe().await.unwrap();
    common::eventually(|| a.node.subscribers(&Alarm::descriptor()).len() == 2).await;

    assert_eq!(a.node.raise_contract::<Alarm>(json!({ "level": "high" })).await, 2);
    assert_eq!(at_b.recv().await.unwrap(), json!({ "level": "high" }));
    assert_eq!(at_c.recv().await.unwrap(), json!({ "level": "high" }));
}

#[tokio::test]
async fn unsubscribe_stops_delivery() {
    let network = LoopbackNetwork::new();
    let a = sensor(&network, "a");
    let mut b = monitor(&network, "b");
    network.connect(&a.id, &b.id);
    b.outcome_for(&a.id).await;

    let alarm = b.node.notification_for::<Alarm>(&a.id).unwrap();
    let _payloads = alarm.subscribe().await.unwrap();
    common::eventually(|| a.node.subscribers(&Alarm::descriptor()) == vec![b.id.clone()]).await;

    alarm.unsubscribe().await.unwrap();
    common::eventually(|| a.node.subscribers(&Alarm::descriptor()).is_empty()).await;
    assert_eq!(a.node.raise_contract::<Alarm>(json!(1)).await, 0);
}

#[tokio::test]
async fn disconnect_drops_subscription_and_stand_ins() {
    let network = LoopbackNetwork::new();
    let a = sensor(&network, "a");
    let mut b = monitor(&network, "b");
    let mut c = monitor(&network, "c");
    network.connect(&a.id, &b.id);
    network.connect(&a.id, &c.id);
    b.outcome_for(&a.id).await;
    c.outcome_for(&a.id).await;

    let mut events = b.node.notification_events();
    let _at_b = b.node.notification_for::<Alarm>(&a.id).unwrap().subscribe().await.unwrap();
    let _at_c = c.node.notification_for::<Alarm>(&a.id).unwrap().subscribe().await.unwrap();
    common::eventually(|| a.node.subscribers(&Alarm::descriptor()).len() == 2).await;

    network.disconnect(&a.id, &b.id);
    common::eventually(|| a.node.subscribers(&Alarm::descriptor()) == vec![c.id.clone()]).await;
    common::eventually(|| b.node.notification_for::<Alarm>(&a.id).is_none()).await;
    assert!(!b.node.notifications().has_capability_for(&a.id, &Alarm::descriptor()));

    let removed = events.recv().await.unwrap();
    assert_eq!(removed.endpoint(), &a.id);
    assert_eq!(a.node.raise(&Alarm::descriptor(), json!("late")).await, 1);
}
