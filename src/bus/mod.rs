//! Topic-keyed in-process message bus backed by bounded MPMC channels.
//! Consumers share one receiver per topic, which gives a natural fixed-size
//! worker pool; publish failures surface so callers can record the
//! queue-error status.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::error::{AppError, AppResult};

pub const BULK_DEPLOY_TOPIC: &str = "bulk-appstore-deploy";

const TOPIC_CAPACITY: usize = 1024;

struct Topic {
    tx: flume::Sender<String>,
    rx: flume::Receiver<String>,
}

#[derive(Clone, Default)]
pub struct Bus {
    topics: Arc<Mutex<HashMap<String, Arc<Topic>>>>,
}

impl Bus {
    pub fn new() -> Self {
        Self::default()
    }

    fn topic(&self, name: &str) -> Arc<Topic> {
        let mut topics = self.topics.lock().expect("bus lock poisoned");
        topics
            .entry(name.to_string())
            .or_insert_with(|| {
                let (tx, rx) = flume::bounded(TOPIC_CAPACITY);
                Arc::new(Topic { tx, rx })
            })
            .clone()
    }

    /// Serialize and publish one message. Fails when the topic buffer is
    /// full or the bus is shut down.
    pub fn publish<T: Serialize>(&self, topic: &str, payload: &T) -> AppResult<()> {
        let data = serde_json::to_string(payload)?;
        self.topic(topic)
            .tx
            .try_send(data)
            .map_err(|e| AppError::Queue(format!("publish to {topic} failed: {e}")))
    }

    /// A receiver on the topic. Clones share the queue; each message is
    /// delivered to exactly one consumer.
    pub fn subscribe(&self, topic: &str) -> flume::Receiver<String> {
        self.topic(topic).rx.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DeployPayload;

    #[tokio::test]
    async fn test_publish_and_consume() {
        let bus = Bus::new();
        let rx = bus.subscribe(BULK_DEPLOY_TOPIC);
        let payload = DeployPayload {
            installed_app_version_id: 7,
            installed_app_version_history_id: 9,
        };
        bus.publish(BULK_DEPLOY_TOPIC, &payload).unwrap();
        let raw = rx.recv_async().await.unwrap();
        let decoded: DeployPayload = serde_json::from_str(&raw).unwrap();
        assert_eq!(decoded, payload);
    }

    #[tokio::test]
    async fn test_each_message_goes_to_one_worker() {
        let bus = Bus::new();
        let rx1 = bus.subscribe("t");
        let rx2 = bus.subscribe("t");
        bus.publish("t", &1).unwrap();
        let got = tokio::select! {
            m = rx1.recv_async() => m.unwrap(),
            m = rx2.recv_async() => m.unwrap(),
        };
        assert_eq!(got, "1");
        assert!(rx1.try_recv().is_err());
        assert!(rx2.try_recv().is_err());
    }
}
