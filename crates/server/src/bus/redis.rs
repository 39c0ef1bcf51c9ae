use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::{
    aio::{MultiplexedConnection, PubSub},
    AsyncCommands, Client,
};
use tokio::sync::Mutex;

use super::{BusError, BusMessage, MessageBus};

/// Redis pub/sub. Publishes go over a multiplexed connection; subscriptions
/// live on a dedicated pub/sub connection.
///
/// The pub/sub connection is shared between the listener and
/// (un)subscribe calls, so a subscribe waits for the current poll to time
/// out. Keep the stall timeout short.
pub struct RedisBus {
    client: Client,
    publisher: Mutex<Option<MultiplexedConnection>>,
    subscriber: Mutex<Option<PubSub>>,
}

impl RedisBus {
    pub fn open(url: &str) -> Result<Self, BusError> {
        Ok(Self {
            client: Client::open(url)?,
            publisher: Mutex::new(None),
            subscriber: Mutex::new(None),
        })
    }
}

#[async_trait]
impl MessageBus for RedisBus {
    async fn connect(&self) -> Result<(), BusError> {
        let publisher = self.client.get_multiplexed_async_connection().await?;
        let subscriber = self.client.get_async_pubsub().await?;
        *self.publisher.lock().await = Some(publisher);
        *self.subscriber.lock().await = Some(subscriber);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<(), BusError> {
        let mut guard = self.subscriber.lock().await;
        let pubsub = guard.as_mut().ok_or(BusError::NotConnected)?;
        pubsub.subscribe(channel).await?;
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), BusError> {
        let mut guard = self.subscriber.lock().await;
        let pubsub = guard.as_mut().ok_or(BusError::NotConnected)?;
        pubsub.unsubscribe(channel).await?;
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BusError> {
        let mut conn = self
            .publisher
            .lock()
            .await
            .clone()
            .ok_or(BusError::NotConnected)?;
        let _receivers: i64 = conn.publish(channel, payload).await?;
        Ok(())
    }

    async fn next_message(&self, timeout: Duration) -> Result<Option<BusMessage>, BusError> {
        let mut guard = self.subscriber.lock().await;
        let pubsub = guard.as_mut().ok_or(BusError::NotConnected)?;
        let mut messages = pubsub.on_message();
        match tokio::time::timeout(timeout, messages.next()).await {
            Err(_) => Ok(None),
            Ok(None) => Err(BusError::Closed),
            Ok(Some(msg)) => {
                let payload: String = msg.get_payload()?;
                Ok(Some(BusMessage {
                    channel: msg.get_channel_name().to_string(),
                    payload,
                }))
            }
        }
    }

    async fn close(&self) -> Result<(), BusError> {
        self.subscriber.lock().await.take();
        self.publisher.lock().await.take();
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}
