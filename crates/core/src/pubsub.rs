//! Topic-based publish/subscribe seam.
//!
//! The heartbeat publisher and the asynchronous target driver both talk to a
//! transport through this trait. Wrapping the transport in a trait keeps the
//! broker client itself an external collaborator: in-process wiring and tests
//! use [`MemoryBus`], production deployments plug a broker-backed
//! implementation in behind the same contract.

use std::collections::BTreeMap;
use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex, mpsc};
use tracing::warn;

use crate::error::Result;

/// Per-subscriber channel capacity. A subscriber that falls this far behind
/// starts losing events; both event kinds carried on the bus (heartbeats,
/// driver responses) tolerate loss.
const SUBSCRIBER_CAPACITY: usize = 64;

/// An event on the bus: a JSON body plus string metadata.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Event {
    pub body: Value,
    pub metadata: BTreeMap<String, String>,
}

impl Event {
    pub fn new(body: Value) -> Self {
        Self {
            body,
            metadata: BTreeMap::new(),
        }
    }
}

/// Publish/subscribe contract.
#[async_trait]
pub trait PubSub: Send + Sync {
    /// Publishes an event to every current subscriber of the topic.
    /// Publishing to a topic nobody subscribes to is not an error.
    async fn publish(&self, topic: &str, event: Event) -> Result<()>;

    /// Subscribes to a topic, returning the receiving end of a bounded channel.
    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<Event>>;
}

/// In-memory, in-process bus.
#[derive(Debug, Default)]
pub struct MemoryBus {
    topics: Mutex<HashMap<String, Vec<mpsc::Sender<Event>>>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PubSub for MemoryBus {
    async fn publish(&self, topic: &str, event: Event) -> Result<()> {
        let mut topics = self.topics.lock().await;
        let Some(senders) = topics.get_mut(topic) else {
            return Ok(());
        };

        senders.retain(|sender| match sender.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(topic, "dropping event for lagging subscriber");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<Event>> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        let mut topics = self.topics.lock().await;
        topics.entry(topic.to_string()).or_default().push(tx);
        Ok(rx)
    }
}
