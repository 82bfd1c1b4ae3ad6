use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use async_trait::async_trait;
use tokio::{
    sync::{Mutex, mpsc},
    time::Instant,
};

use super::{Bus, BusEvent, Subscription};
use crate::error::BusError;

/// Something that went through [`MemoryBus::publish`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub event: BusEvent,
    pub at: Instant,
}

struct Subscriber {
    id: u64,
    channels: Vec<String>,
    sender: mpsc::UnboundedSender<BusEvent>,
}

#[derive(Default)]
struct Inner {
    next_id: AtomicU64,
    unavailable: AtomicBool,
    subscribers: Mutex<Vec<Subscriber>>,
    published: Mutex<Vec<Published>>,
}

/// An in-process bus with the same ordering guarantees as Redis pub/sub:
/// per-channel order is kept, and nothing is stored for channels nobody is
/// subscribed to.
///
/// Everything published is also recorded, with the time it was published.
#[derive(Clone, Default)]
pub struct MemoryBus {
    inner: Arc<Inner>,
}

impl MemoryBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything published so far, oldest first.
    pub async fn published(&self) -> Vec<Published> {
        self.inner.published.lock().await.clone()
    }

    /// Published events on `channel`.
    pub async fn published_on(&self, channel: &str) -> Vec<Published> {
        self.inner
            .published
            .lock()
            .await
            .iter()
            .filter(|published| published.event.channel == channel)
            .cloned()
            .collect()
    }

    pub async fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().await.len()
    }

    /// While set, every publish fails with [`BusError::Unavailable`] and
    /// nothing is recorded.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn subscribe(&self, channels: &[String]) -> Result<Box<dyn Subscription>, BusError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        self.inner.subscribers.lock().await.push(Subscriber {
            id,
            channels: channels.to_vec(),
            sender,
        });

        Ok(Box::new(MemorySubscription {
            id,
            receiver,
            bus: Arc::clone(&self.inner),
        }))
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), BusError> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(BusError::Unavailable);
        }

        let event = BusEvent::new(channel, payload);

        self.inner.published.lock().await.push(Published {
            event: event.clone(),
            at: Instant::now(),
        });

        self.inner.subscribers.lock().await.retain(|subscriber| {
            if subscriber.channels.iter().any(|c| c == channel) {
                subscriber.sender.send(event.clone()).is_ok()
            } else {
                !subscriber.sender.is_closed()
            }
        });

        Ok(())
    }
}

struct MemorySubscription {
    id: u64,
    receiver: mpsc::UnboundedReceiver<BusEvent>,
    bus: Arc<Inner>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next_event(&mut self) -> Option<BusEvent> {
        self.receiver.recv().await
    }

    async fn close(self: Box<Self>) {
        self.bus
            .subscribers
            .lock()
            .await
            .retain(|subscriber| subscriber.id != self.id);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[tokio::test]
    async fn delivers_in_order_to_matching_subscribers() {
        let bus = MemoryBus::new();
        let mut welcome = bus
            .subscribe(&["email.notify.welcome".to_string()])
            .await
            .unwrap();

        bus.publish("email.notify.welcome", b"1").await.unwrap();
        bus.publish("email.notify.other", b"x").await.unwrap();
        bus.publish("email.notify.welcome", b"2").await.unwrap();

        assert_eq!(
            welcome.next_event().await.unwrap(),
            BusEvent::new("email.notify.welcome", b"1".as_slice())
        );
        assert_eq!(welcome.next_event().await.unwrap().payload, b"2");
        assert_eq!(bus.published().await.len(), 3);
        assert_eq!(bus.published_on("email.notify.other").await.len(), 1);
    }

    #[tokio::test]
    async fn closing_removes_the_subscriber() {
        let bus = MemoryBus::new();
        let subscription = bus.subscribe(&["a".to_string()]).await.unwrap();
        assert_eq!(bus.subscriber_count().await, 1);

        subscription.close().await;

        assert_eq!(bus.subscriber_count().await, 0);
        bus.publish("a", b"dropped").await.unwrap();
    }
}
