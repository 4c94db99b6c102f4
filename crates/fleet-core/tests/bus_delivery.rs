//! Message bus delivery guarantees.

use std::time::Duration;

use fleet_core::metrics::METRICS;
use fleet_core::{handler, LocalBus, MessageClient};
use serde_json::{json, Value};
use tokio::sync::mpsc;

fn recorder(bus: &LocalBus, subject: &str) -> mpsc::UnboundedReceiver<Value> {
    let (tx, rx) = mpsc::unbounded_channel();
    bus.subscribe(
        subject,
        handler(move |msg| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(msg.payload.clone());
                Ok(())
            }
        }),
    );
    rx
}

async fn recv(rx: &mut mpsc::UnboundedReceiver<Value>) -> Value {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("message not delivered")
        .expect("recorder closed")
}

#[tokio::test]
async fn publish_with_no_subscribers_returns_immediately() {
    let bus = LocalBus::new();
    tokio::time::timeout(Duration::from_millis(100), async {
        for n in 0..1_000 {
            bus.publish("evaluation.results", json!({ "n": n }));
        }
    })
    .await
    .expect("publish blocked");
}

#[tokio::test]
async fn every_subscriber_receives_each_message() {
    let bus = LocalBus::new();
    let mut first = recorder(&bus, "agents.desired");
    let mut second = recorder(&bus, "agents.desired");

    bus.publish("agents.desired", json!(["a"]));
    assert_eq!(recv(&mut first).await, json!(["a"]));
    assert_eq!(recv(&mut second).await, json!(["a"]));
}

#[tokio::test]
async fn erroring_subscriber_does_not_starve_another() {
    let bus = LocalBus::new();
    let before = METRICS.bus_handler_faults();
    bus.subscribe(
        "s",
        handler(|_msg| async { Err(anyhow::anyhow!("handler rejected message")) }),
    );
    let mut healthy = recorder(&bus, "s");

    bus.publish("s", json!(1));
    bus.publish("s", json!(2));
    assert_eq!(recv(&mut healthy).await, json!(1));
    assert_eq!(recv(&mut healthy).await, json!(2));

    tokio::time::timeout(Duration::from_secs(2), async {
        while METRICS.bus_handler_faults() < before + 2 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("faults not counted");
}

#[tokio::test]
async fn panicking_subscriber_does_not_starve_another() {
    let bus = LocalBus::new();
    bus.subscribe(
        "s",
        handler(|msg| async move {
            if msg.payload == json!("boom") {
                panic!("subscriber bug");
            }
            Ok(())
        }),
    );
    let mut healthy = recorder(&bus, "s");

    bus.publish("s", json!("boom"));
    bus.publish("s", json!("after"));
    assert_eq!(recv(&mut healthy).await, json!("boom"));
    assert_eq!(recv(&mut healthy).await, json!("after"));
}

#[tokio::test]
async fn panicking_subscriber_keeps_receiving() {
    let bus = LocalBus::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    bus.subscribe(
        "s",
        handler(move |msg| {
            let tx = tx.clone();
            async move {
                if msg.payload == json!("boom") {
                    panic!("subscriber bug");
                }
                let _ = tx.send(msg.payload.clone());
                Ok(())
            }
        }),
    );

    bus.publish("s", json!("boom"));
    bus.publish("s", json!("next"));
    assert_eq!(recv(&mut rx).await, json!("next"));
}

#[tokio::test]
async fn handler_panicking_before_its_future_keeps_receiving() {
    let bus = LocalBus::new();
    let before = METRICS.bus_handler_faults();
    let (tx, mut rx) = mpsc::unbounded_channel();
    bus.subscribe(
        "s",
        handler(move |msg| {
            // Panics while building the future, not inside it.
            if msg.payload == json!("boom") {
                panic!("subscriber bug");
            }
            let tx = tx.clone();
            async move {
                let _ = tx.send(msg.payload.clone());
                Ok(())
            }
        }),
    );

    bus.publish("s", json!("boom"));
    bus.publish("s", json!("next"));
    assert_eq!(recv(&mut rx).await, json!("next"));
    assert!(METRICS.bus_handler_faults() > before);
    assert_eq!(bus.subscriber_count("s"), 1);
}

#[tokio::test]
async fn messages_from_one_publisher_arrive_in_order() {
    let bus = LocalBus::new();
    let mut rx = recorder(&bus, "evaluation.requests");
    for n in 0..100 {
        bus.publish("evaluation.requests", json!(n));
    }
    for n in 0..100 {
        assert_eq!(recv(&mut rx).await, json!(n));
    }
}

#[tokio::test]
async fn subjects_are_isolated() {
    let bus = LocalBus::new();
    let mut a = recorder(&bus, "a");
    let mut b = recorder(&bus, "b");
    bus.publish("a", json!("for a"));
    assert_eq!(recv(&mut a).await, json!("for a"));
    assert!(tokio::time::timeout(Duration::from_millis(50), b.recv())
        .await
        .is_err());
}
