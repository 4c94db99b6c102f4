//! In-process publish/subscribe bus keyed by subject.
//!
//! Each subscriber owns an unbounded queue drained by its own task, so:
//! - `publish` never blocks and never fails, even with zero subscribers;
//! - every subscriber sees messages from one publisher on one subject in
//!   publish order;
//! - a handler that returns an error or panics only affects its own delivery.
//!
//! Handlers run one message at a time per subscription. A handler that wants
//! concurrency (e.g. evaluation fan-out) spawns its own work and returns.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::domain::BusError;
use crate::metrics::METRICS;
use crate::obs::emit_bus_handler_fault;

/// Well-known subjects used by the node.
pub mod subjects {
    /// Full desired agent set (registry/config collaborator → coordinator)
    pub const AGENTS_DESIRED: &str = "agents.desired";
    /// Agents now running and ready
    pub const AGENTS_STATUS_RUNNING: &str = "agents.status.running";
    /// Agents stopped in the last cycle
    pub const AGENTS_STATUS_STOPPED: &str = "agents.status.stopped";
    /// Per-cycle reconcile report
    pub const RECONCILE_REPORT: &str = "agents.reconcile.report";
    /// Block/tx evaluation requests (ingestion → coordinator)
    pub const EVALUATION_REQUESTS: &str = "evaluation.requests";
    /// Aggregated per-request results (coordinator → alert consumer)
    pub const EVALUATION_RESULTS: &str = "evaluation.results";
}

/// One delivered message.
#[derive(Debug, Clone)]
pub struct Message {
    pub id: Uuid,
    pub subject: String,
    pub payload: serde_json::Value,
    pub published_at: DateTime<Utc>,
}

impl Message {
    /// Decode the payload into `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, BusError> {
        serde_json::from_value(self.payload.clone()).map_err(|source| BusError::Decode {
            subject: self.subject.clone(),
            source,
        })
    }
}

/// Subscriber callback. The bus is agnostic to payload shape.
pub type Handler = Arc<dyn Fn(Arc<Message>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Identifies a subscription for [`MessageClient::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

/// Publish/subscribe capability.
pub trait MessageClient: Send + Sync {
    /// Register `handler` for every future message on `subject`.
    fn subscribe(&self, subject: &str, handler: Handler) -> SubscriptionId;

    /// Drop a subscription. Messages already queued for it are still delivered.
    fn unsubscribe(&self, id: SubscriptionId);

    /// Deliver `payload` to every current subscriber of `subject`.
    fn publish(&self, subject: &str, payload: serde_json::Value);
}

/// Box an async closure into a [`Handler`].
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Arc<Message>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |msg: Arc<Message>| -> BoxFuture<'static, anyhow::Result<()>> {
        Box::pin(f(msg))
    })
}

/// Subscribe with a handler that receives the decoded payload.
///
/// Decode failures are reported as handler faults.
pub fn subscribe_typed<T, F, Fut>(bus: &dyn MessageClient, subject: &str, f: F) -> SubscriptionId
where
    T: DeserializeOwned + Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let f = Arc::new(f);
    bus.subscribe(
        subject,
        handler(move |msg| {
            let f = Arc::clone(&f);
            async move {
                let value: T = msg.decode()?;
                f(value).await
            }
        }),
    )
}

/// Serialize `payload` and publish it.
pub fn publish_json<T: Serialize>(
    bus: &dyn MessageClient,
    subject: &str,
    payload: &T,
) -> Result<(), BusError> {
    let value = serde_json::to_value(payload).map_err(|source| BusError::Encode {
        subject: subject.to_string(),
        source,
    })?;
    bus.publish(subject, value);
    Ok(())
}

struct Subscriber {
    id: SubscriptionId,
    tx: mpsc::UnboundedSender<Arc<Message>>,
}

/// Tokio-backed in-process bus.
///
/// `subscribe` spawns a delivery task and must be called inside a runtime.
#[derive(Default)]
pub struct LocalBus {
    subscribers: RwLock<HashMap<String, Vec<Subscriber>>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscriptions on `subject`.
    pub fn subscriber_count(&self, subject: &str) -> usize {
        self.subscribers
            .read()
            .map(|subs| subs.get(subject).map_or(0, Vec::len))
            .unwrap_or(0)
    }
}

/// Drain one subscription's queue, containing handler faults.
async fn deliver(subject: String, handler: Handler, mut rx: mpsc::UnboundedReceiver<Arc<Message>>) {
    while let Some(msg) = rx.recv().await {
        // Build and run the future on a separate task so a panic, whether in
        // the closure or in its future, surfaces as a JoinError here.
        let handler = Arc::clone(&handler);
        let outcome = tokio::spawn(async move { handler(msg).await }).await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                METRICS.inc_bus_handler_faults();
                emit_bus_handler_fault(&subject, &e);
            }
            Err(join_err) => {
                METRICS.inc_bus_handler_faults();
                emit_bus_handler_fault(&subject, &join_err);
            }
        }
    }
    debug!(subject = %subject, "subscription drained");
}

impl MessageClient for LocalBus {
    fn subscribe(&self, subject: &str, handler: Handler) -> SubscriptionId {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = SubscriptionId(Uuid::new_v4());
        tokio::spawn(deliver(subject.to_string(), handler, rx));

        let mut subs = match self.subscribers.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        subs.entry(subject.to_string())
            .or_default()
            .push(Subscriber { id, tx });
        debug!(subject = %subject, "subscribed");
        id
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        let mut subs = match self.subscribers.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        for list in subs.values_mut() {
            list.retain(|s| s.id != id);
        }
        subs.retain(|_, list| !list.is_empty());
    }

    fn publish(&self, subject: &str, payload: serde_json::Value) {
        let subs = match self.subscribers.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let Some(list) = subs.get(subject) else {
            return;
        };

        let msg = Arc::new(Message {
            id: Uuid::new_v4(),
            subject: subject.to_string(),
            payload,
            published_at: Utc::now(),
        });
        for sub in list {
            // A closed queue means the delivery task is gone; nothing to do.
            let _ = sub.tx.send(Arc::clone(&msg));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn publish_without_subscribers_is_noop() {
        let bus = LocalBus::new();
        bus.publish("nobody.listens", json!({"x": 1}));
        assert_eq!(bus.subscriber_count("nobody.listens"), 0);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = LocalBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = bus.subscribe(
            "s",
            handler(move |msg| {
                let tx = tx.clone();
                async move {
                    tx.send(msg.payload.clone())?;
                    Ok(())
                }
            }),
        );
        bus.publish("s", json!(1));
        assert_eq!(rx.recv().await.unwrap(), json!(1));

        bus.unsubscribe(id);
        assert_eq!(bus.subscriber_count("s"), 0);
        bus.publish("s", json!(2));
        let late = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
        assert!(matches!(late, Ok(None) | Err(_)));
    }

    #[tokio::test]
    async fn typed_subscription_decodes_payload() {
        let bus = LocalBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u32>>();
        subscribe_typed(&bus, "numbers", move |v: Vec<u32>| {
            let tx = tx.clone();
            async move {
                tx.send(v)?;
                Ok(())
            }
        });
        publish_json(&bus, "numbers", &vec![1u32, 2, 3]).unwrap();
        assert_eq!(rx.recv().await.unwrap(), vec![1, 2, 3]);
    }
}
