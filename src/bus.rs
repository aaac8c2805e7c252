//! In-process publish/subscribe bus.
//!
//! Every subscriber owns an unbounded queue, so a slow consumer delays
//! delivery instead of losing messages.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// One message on a topic; `data` is the JSON payload text.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BusMessage {
    pub channel: String,
    pub data: String,
}

impl BusMessage {
    pub fn new(channel: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            data: data.into(),
        }
    }
}

/// Anything the merger can emit its output through.
pub trait Publisher: Send + Sync {
    /// Returns the number of subscribers that received the message.
    fn publish(&self, topic: &str, payload: &str) -> usize;
}

struct Slot {
    id: u64,
    topics: Vec<String>,
    sender: UnboundedSender<BusMessage>,
}

#[derive(Default)]
struct BusInner {
    slots: Mutex<Vec<Slot>>,
    next_id: AtomicU64,
}

#[derive(Clone, Default)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, Vec<Slot>> {
        self.inner.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// One subscription multiplexing all of `topics`.
    pub fn subscribe<I, S>(&self, topics: I) -> Subscription
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let topics: Vec<String> = topics.into_iter().map(Into::into).collect();
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.slots().push(Slot {
            id,
            topics: topics.clone(),
            sender,
        });
        Subscription {
            id,
            topics,
            receiver,
            bus: self.clone(),
        }
    }

    /// Drop every subscriber queue. Subscriptions still yield what was queued,
    /// then `recv` returns `None`.
    pub fn close(&self) {
        self.slots().clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.slots().len()
    }

    fn unsubscribe(&self, id: u64) {
        self.slots().retain(|slot| slot.id != id);
    }
}

impl Publisher for MessageBus {
    fn publish(&self, topic: &str, payload: &str) -> usize {
        let mut slots = self.slots();
        let mut delivered = 0;
        slots.retain(|slot| {
            if !slot.topics.iter().any(|t| t == topic) {
                return true;
            }
            match slot.sender.send(BusMessage::new(topic, payload)) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                // receiver gone
                Err(_) => false,
            }
        });
        delivered
    }
}

/// Receiving end of [`MessageBus::subscribe`]; unsubscribes on drop.
pub struct Subscription {
    id: u64,
    topics: Vec<String>,
    receiver: UnboundedReceiver<BusMessage>,
    bus: MessageBus,
}

impl Subscription {
    /// Wait for the next message, in arrival order across all topics.
    pub async fn recv(&mut self) -> Option<BusMessage> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<BusMessage> {
        self.receiver.try_recv().ok()
    }

    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_routes_by_topic_in_arrival_order() {
        let bus = MessageBus::new();
        let mut sensors = bus.subscribe(["gps", "imu"]);
        let mut output = bus.subscribe(["transfer_data"]);

        assert_eq!(bus.publish("imu", "{\"i_utc\":1}"), 1);
        assert_eq!(bus.publish("gps", "{\"utc\":2}"), 1);
        assert_eq!(bus.publish("barometer", "{}"), 0);
        assert_eq!(bus.publish("transfer_data", "{}"), 1);

        assert_eq!(sensors.recv().await.unwrap().channel, "imu");
        assert_eq!(sensors.recv().await.unwrap().channel, "gps");
        assert!(sensors.try_recv().is_none());
        assert_eq!(output.recv().await.unwrap().channel, "transfer_data");
    }

    #[tokio::test]
    async fn test_close_delivers_queued_messages_then_ends() {
        let bus = MessageBus::new();
        let mut subscription = bus.subscribe(["gps"]);
        bus.publish("gps", "{\"utc\":1}");
        bus.close();

        assert_eq!(bus.publish("gps", "{\"utc\":2}"), 0);
        assert_eq!(subscription.recv().await.unwrap().data, "{\"utc\":1}");
        assert!(subscription.recv().await.is_none());
    }

    #[test]
    fn test_drop_unsubscribes() {
        let bus = MessageBus::new();
        let subscription = bus.subscribe(["gps"]);
        assert_eq!(bus.subscriber_count(), 1);
        subscription.unsubscribe();
        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(bus.publish("gps", "{}"), 0);
    }
}
