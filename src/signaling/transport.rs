use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};

use crate::error::SessionError;

/// Incoming raw payloads for one topic subscription. Dropping the receiver
/// is the subscriber-side half of unsubscribing; `unsubscribe` prunes the
/// dead entry on the transport side.
pub type TopicReceiver = mpsc::Receiver<Bytes>;

/// A realtime publish/subscribe fabric for the signaling channel to ride on.
///
/// `subscribe` resolves only once the subscription is confirmed registered
/// by the transport, so a publish issued after that point cannot race the
/// subscription. Publishing is best-effort: delivery is at-most-once and
/// loss is tolerated by the layers above.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    async fn subscribe(&self, topic: &str) -> Result<TopicReceiver, SessionError>;
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), SessionError>;
    async fn unsubscribe(&self, topic: &str);
}

/// In-process topic router used by tests and the loopback demo.
///
/// Messages are delivered to every subscriber of the topic, the sender
/// included; the signaling channel filters its own envelopes out by sender
/// id, same as with the gossip fabric.
#[derive(Clone, Default)]
pub struct MemoryHub {
    topics: Arc<Mutex<HashMap<String, Vec<mpsc::Sender<Bytes>>>>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SignalingTransport for MemoryHub {
    async fn subscribe(&self, topic: &str) -> Result<TopicReceiver, SessionError> {
        let (tx, rx) = mpsc::channel(64);
        self.topics
            .lock()
            .await
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), SessionError> {
        let mut topics = self.topics.lock().await;
        if let Some(subs) = topics.get_mut(topic) {
            subs.retain(|tx| {
                // A full queue drops the message: at-most-once, no backpressure.
                let _ = tx.try_send(payload.clone());
                !tx.is_closed()
            });
        }
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) {
        let mut topics = self.topics.lock().await;
        if let Some(subs) = topics.get_mut(topic) {
            subs.retain(|tx| !tx.is_closed());
            if subs.is_empty() {
                topics.remove(topic);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn routes_to_all_topic_subscribers() {
        let hub = MemoryHub::new();
        let mut a = hub.subscribe("t").await.unwrap();
        let mut b = hub.subscribe("t").await.unwrap();
        let mut other = hub.subscribe("elsewhere").await.unwrap();

        hub.publish("t", Bytes::from_static(b"hello")).await.unwrap();

        assert_eq!(a.recv().await.unwrap(), Bytes::from_static(b"hello"));
        assert_eq!(b.recv().await.unwrap(), Bytes::from_static(b"hello"));
        assert!(other.try_recv().is_err());
    }

    #[tokio::test]
    async fn dropped_receivers_are_pruned() {
        let hub = MemoryHub::new();
        let rx = hub.subscribe("t").await.unwrap();
        drop(rx);
        hub.unsubscribe("t").await;

        // Publishing to a topic with no live subscribers is a no-op.
        hub.publish("t", Bytes::from_static(b"x")).await.unwrap();
        assert!(hub.topics.lock().await.get("t").is_none());
    }
}
