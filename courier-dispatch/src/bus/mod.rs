//! Publish/subscribe transport.
//!
//! Payloads are opaque bytes. Retries go back onto the bus through the same
//! [`Bus::publish`] contract as any other producer.

mod memory;
mod redis_bus;

use async_trait::async_trait;

pub use self::{
    memory::{MemoryBus, Published},
    redis_bus::RedisBus,
};
use crate::error::BusError;

/// One message received on a subscribed channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BusEvent {
    pub channel: String,
    pub payload: Vec<u8>,
}

impl BusEvent {
    #[must_use]
    pub fn new(channel: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            channel: channel.into(),
            payload: payload.into(),
        }
    }
}

#[async_trait]
pub trait Bus: Send + Sync {
    /// Subscribe to every channel in `channels`.
    async fn subscribe(&self, channels: &[String]) -> Result<Box<dyn Subscription>, BusError>;

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), BusError>;
}

#[async_trait]
pub trait Subscription: Send {
    /// The next event, in the order the bus delivered them.
    ///
    /// `None` once the bus has closed the subscription.
    async fn next_event(&mut self) -> Option<BusEvent>;

    /// Unsubscribe and release the connection.
    async fn close(self: Box<Self>);
}
