use crate::bus::{Envelope, MessageBus, Subscription};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use taskmesh_core::{TaskmeshError, TaskmeshResult};
use tokio::sync::mpsc;

/// In-process [`MessageBus`] that fans each message out to every open
/// subscription on its topic.
///
/// Closed subscriptions are pruned on the next publish. The bus can be
/// switched offline to exercise degraded-mode handling.
pub struct InMemoryBus {
    topics: RwLock<HashMap<String, Vec<mpsc::UnboundedSender<Envelope>>>>,
    online: AtomicBool,
    published: AtomicU64,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            online: AtomicBool::new(true),
            published: AtomicU64::new(0),
        }
    }

    /// Toggle availability. While offline every operation fails with
    /// [`TaskmeshError::Channel`].
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
        tracing::info!(online, "In-memory bus availability changed");
    }

    /// Total messages accepted since creation.
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Open subscriptions on `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .get(topic)
            .map_or(0, |subs| subs.iter().filter(|tx| !tx.is_closed()).count())
    }

    fn check_online(&self) -> TaskmeshResult<()> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TaskmeshError::Channel("message bus is offline".into()))
        }
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    fn name(&self) -> &str {
        "message_bus"
    }

    async fn publish(&self, topic: &str, payload: serde_json::Value) -> TaskmeshResult<()> {
        self.check_online()?;
        let envelope = Envelope::new(topic, payload);
        let mut topics = self.topics.write();
        let delivered = match topics.get_mut(topic) {
            Some(subs) => {
                subs.retain(|tx| tx.send(envelope.clone()).is_ok());
                subs.len()
            }
            None => 0,
        };
        drop(topics);
        self.published.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(topic, message_id = %envelope.id, delivered, "Published");
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> TaskmeshResult<Subscription> {
        self.check_online()?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.topics
            .write()
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        tracing::debug!(topic, "Subscribed");
        Ok(Subscription::new(topic, rx))
    }

    async fn ping(&self) -> TaskmeshResult<()> {
        self.check_online()
    }
}
