use async_trait::async_trait;
use courier_common::internal;
use futures_util::StreamExt;
use redis::{
    AsyncCommands, Client,
    aio::{ConnectionManager, PubSub},
};

use super::{Bus, BusEvent, Subscription};
use crate::error::BusError;

/// Redis pub/sub.
///
/// Publishing goes through a shared [`ConnectionManager`], which reconnects on
/// its own. Every subscription opens its own pub/sub connection.
#[derive(Clone)]
pub struct RedisBus {
    client: Client,
    publisher: ConnectionManager,
}

impl RedisBus {
    /// Connect to the server at `url` (`redis://host[:port][/db]`).
    pub async fn connect(url: &str) -> Result<Self, BusError> {
        let client = Client::open(url)?;
        let publisher = client.get_connection_manager().await?;

        Ok(Self { client, publisher })
    }
}

#[async_trait]
impl Bus for RedisBus {
    async fn subscribe(&self, channels: &[String]) -> Result<Box<dyn Subscription>, BusError> {
        let mut pubsub = self.client.get_async_pubsub().await?;

        for channel in channels {
            pubsub.subscribe(channel.as_str()).await?;
            internal!(level = DEBUG, %channel, "Subscribed");
        }

        Ok(Box::new(RedisSubscription {
            pubsub,
            channels: channels.to_vec(),
        }))
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), BusError> {
        let mut publisher = self.publisher.clone();
        publisher.publish::<_, _, ()>(channel, payload).await?;
        Ok(())
    }
}

struct RedisSubscription {
    pubsub: PubSub,
    channels: Vec<String>,
}

#[async_trait]
impl Subscription for RedisSubscription {
    async fn next_event(&mut self) -> Option<BusEvent> {
        let message = self.pubsub.on_message().next().await?;
        Some(BusEvent::new(
            message.get_channel_name(),
            message.get_payload_bytes(),
        ))
    }

    /// Unsubscribe from every channel, then drop the pub/sub connection.
    async fn close(mut self: Box<Self>) {
        internal!(level = DEBUG, "Closing subscription");

        let channels = std::mem::take(&mut self.channels);
        if let Err(err) = self.pubsub.unsubscribe(channels).await {
            internal!(level = WARN, "Unable to unsubscribe cleanly: {err}");
        }
    }
}
