use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use taskmesh_core::{TaskmeshError, TaskmeshResult};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

/// One message as delivered to a subscriber.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub id: Uuid,
    pub topic: String,
    pub payload: serde_json::Value,
    pub published_at: DateTime<Utc>,
}

impl Envelope {
    pub fn new(topic: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic: topic.into(),
            payload,
            published_at: Utc::now(),
        }
    }

    /// Decode the payload into a typed message.
    pub fn decode<T: DeserializeOwned>(&self) -> TaskmeshResult<T> {
        serde_json::from_value(self.payload.clone()).map_err(TaskmeshError::from)
    }
}

/// Receiving end of a topic subscription. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    topic: String,
    rx: mpsc::UnboundedReceiver<Envelope>,
}

impl Subscription {
    pub fn new(topic: impl Into<String>, rx: mpsc::UnboundedReceiver<Envelope>) -> Self {
        Self {
            topic: topic.into(),
            rx,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next envelope, or `None` once the bus side is gone.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }

    /// Next envelope whose payload decodes as `T`. Malformed payloads are
    /// logged and skipped.
    pub async fn recv_as<T: DeserializeOwned>(&mut self) -> Option<T> {
        loop {
            let envelope = self.rx.recv().await?;
            match envelope.decode::<T>() {
                Ok(msg) => return Some(msg),
                Err(e) => {
                    tracing::warn!(
                        topic = %self.topic,
                        message_id = %envelope.id,
                        error = %e,
                        "Dropping malformed message"
                    );
                }
            }
        }
    }

    /// Convert into a [`tokio_stream::Stream`] of envelopes.
    pub fn into_stream(self) -> UnboundedReceiverStream<Envelope> {
        UnboundedReceiverStream::new(self.rx)
    }
}

/// Topic-based publish/subscribe transport between the orchestrator and
/// agents.
///
/// Delivery is at-least-once to every subscription open at publish time.
/// Consumers must tolerate duplicates.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Name reported by health checks.
    fn name(&self) -> &str;

    async fn publish(&self, topic: &str, payload: serde_json::Value) -> TaskmeshResult<()>;

    async fn subscribe(&self, topic: &str) -> TaskmeshResult<Subscription>;

    /// Cheap reachability check.
    async fn ping(&self) -> TaskmeshResult<()>;
}

/// Serialize `message` and publish it on `topic`.
pub async fn publish_json<T: Serialize + Sync>(
    bus: &dyn MessageBus,
    topic: &str,
    message: &T,
) -> TaskmeshResult<()> {
    let payload = serde_json::to_value(message)?;
    bus.publish(topic, payload).await
}
