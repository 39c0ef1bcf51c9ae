use std::{
    collections::HashSet,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use harmony_core::{channel_for, chat_from_channel, ChatId, FanoutEnvelope, KEEPALIVE_CHANNEL};
use harmony_storage::RetryPolicy;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{ChatLocks, FanoutError, LocalConnectionManager};
use crate::bus::{BusMessage, MessageBus};

#[derive(Debug, Clone, Copy)]
pub struct PubSubSettings {
    pub stall_timeout: Duration,
    pub connect_retry: RetryPolicy,
}

impl Default for PubSubSettings {
    fn default() -> Self {
        Self {
            stall_timeout: Duration::from_millis(250),
            connect_retry: RetryPolicy {
                base: Duration::from_secs(1),
                cap: Duration::from_secs(10),
                max_retries: Some(3),
            },
        }
    }
}

/// Layer 1: one upstream subscription per chat that has local viewers.
///
/// Subscribe and unsubscribe for the same chat are serialized by a
/// per-chat lock; the upstream set only changes while that lock is held.
pub struct PubSubManager {
    bus: Arc<dyn MessageBus>,
    local: Arc<LocalConnectionManager>,
    locks: ChatLocks,
    upstream: Mutex<HashSet<ChatId>>,
    settings: PubSubSettings,
    cancel: CancellationToken,
}

impl PubSubManager {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        local: Arc<LocalConnectionManager>,
        settings: PubSubSettings,
    ) -> Self {
        Self {
            bus,
            local,
            locks: ChatLocks::new(),
            upstream: Mutex::new(HashSet::new()),
            settings,
            cancel: CancellationToken::new(),
        }
    }

    pub fn local(&self) -> &Arc<LocalConnectionManager> {
        &self.local
    }

    pub fn backend_name(&self) -> &'static str {
        self.bus.backend_name()
    }

    fn upstream(&self) -> MutexGuard<'_, HashSet<ChatId>> {
        self.upstream.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Connects with backoff, then subscribes the keepalive channel.
    pub async fn connect(&self) -> Result<(), FanoutError> {
        let policy = self.settings.connect_retry;
        let mut retries = 0;
        loop {
            match self.try_connect().await {
                Ok(()) => {
                    info!(backend = self.bus.backend_name(), "message bus connected");
                    return Ok(());
                }
                Err(err) if policy.allows(retries) => {
                    let delay = policy.delay_for(retries);
                    warn!(?err, retries, ?delay, "message bus connect failed; backing off");
                    tokio::time::sleep(delay).await;
                    retries += 1;
                }
                Err(source) => {
                    error!(?source, attempts = retries + 1, "giving up on message bus");
                    return Err(FanoutError::Connect {
                        attempts: retries + 1,
                        source,
                    });
                }
            }
        }
    }

    async fn try_connect(&self) -> Result<(), crate::bus::BusError> {
        self.bus.connect().await?;
        self.bus.subscribe(KEEPALIVE_CHANNEL).await
    }

    /// Spawns the listener loop. The task ends with `Ok` on shutdown and with
    /// `Err` when the bus fails underneath it.
    pub fn start_listen(self: &Arc<Self>) -> JoinHandle<Result<(), FanoutError>> {
        let manager = Arc::clone(self);
        tokio::spawn(async move { manager.listen().await })
    }

    async fn listen(&self) -> Result<(), FanoutError> {
        info!(stall_timeout = ?self.settings.stall_timeout, "bus listener started");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("bus listener stopped");
                    return Ok(());
                }
                polled = self.bus.next_message(self.settings.stall_timeout) => match polled {
                    Ok(Some(message)) => self.forward(message).await,
                    Ok(None) => {}
                    Err(err) => {
                        error!(?err, "bus listener failed");
                        return Err(FanoutError::Listener(err));
                    }
                },
            }
        }
    }

    async fn forward(&self, message: BusMessage) {
        if message.channel == KEEPALIVE_CHANNEL {
            return;
        }
        let Some(chat_id) = chat_from_channel(&message.channel) else {
            warn!(channel = %message.channel, "message on unexpected channel");
            return;
        };
        let delivered = self.local.broadcast_local(chat_id, &message.payload).await;
        debug!(%chat_id, delivered, "relayed bus message");
    }

    /// Ensures this process is subscribed to the chat's channel.
    pub async fn subscribe_to_chat(&self, chat_id: ChatId) -> Result<(), FanoutError> {
        let _guard = self.locks.lock(chat_id).await;
        if self.is_subscribed(&chat_id) {
            return Ok(());
        }
        self.bus.subscribe(&channel_for(&chat_id)).await?;
        self.upstream().insert(chat_id);
        info!(%chat_id, "subscribed upstream channel");
        Ok(())
    }

    /// Drops the chat's subscription unless local viewers remain.
    pub async fn unsubscribe_from_chat(&self, chat_id: ChatId) -> Result<(), FanoutError> {
        let _guard = self.locks.lock(chat_id).await;
        if !self.is_subscribed(&chat_id) || self.local.is_chat_active_locally(&chat_id) {
            return Ok(());
        }
        self.bus.unsubscribe(&channel_for(&chat_id)).await?;
        self.upstream().remove(&chat_id);
        info!(%chat_id, "unsubscribed upstream channel");
        Ok(())
    }

    pub async fn publish(&self, envelope: &FanoutEnvelope) -> Result<(), FanoutError> {
        let payload = envelope.to_payload()?;
        self.bus
            .publish(&channel_for(&envelope.chat_id()), &payload)
            .await?;
        Ok(())
    }

    pub fn is_subscribed(&self, chat_id: &ChatId) -> bool {
        self.upstream().contains(chat_id)
    }

    pub fn upstream_channel_count(&self) -> usize {
        self.upstream().len()
    }

    /// Stops the listener and closes the bus.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        if let Err(err) = self.bus.close().await {
            warn!(?err, "failed to close message bus");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bus::{InMemoryBroker, InMemoryBus},
        fanout::local::tests::RecordingConnection,
    };
    use harmony_core::{ChatMessage, IdGenerator};
    use tokio::time::{sleep, timeout, Instant};

    fn fast_settings() -> PubSubSettings {
        PubSubSettings {
            stall_timeout: Duration::from_millis(20),
            connect_retry: RetryPolicy {
                base: Duration::from_millis(1),
                cap: Duration::from_millis(4),
                max_retries: Some(2),
            },
        }
    }

    async fn process(broker: &InMemoryBroker) -> (Arc<InMemoryBus>, Arc<PubSubManager>) {
        let bus = Arc::new(broker.replica());
        let manager = Arc::new(PubSubManager::new(
            bus.clone(),
            Arc::new(LocalConnectionManager::new()),
            fast_settings(),
        ));
        manager.connect().await.unwrap();
        (bus, manager)
    }

    async fn wait_for(connection: &RecordingConnection, count: usize) -> Vec<String> {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            let received = connection.received();
            if received.len() >= count || Instant::now() > deadline {
                return received;
            }
            sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn connect_subscribes_keepalive() {
        let (bus, _) = process(&InMemoryBroker::new()).await;
        assert!(bus.is_subscribed(KEEPALIVE_CHANNEL));
    }

    #[tokio::test]
    async fn connect_gives_up_after_retry_budget() {
        let bus = Arc::new(InMemoryBus::standalone());
        bus.fail_next_connects(10);
        let manager = PubSubManager::new(
            bus.clone(),
            Arc::new(LocalConnectionManager::new()),
            fast_settings(),
        );
        let err = manager.connect().await.unwrap_err();
        assert!(matches!(err, FanoutError::Connect { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn connect_recovers_within_retry_budget() {
        let bus = Arc::new(InMemoryBus::standalone());
        bus.fail_next_connects(2);
        let manager = PubSubManager::new(
            bus.clone(),
            Arc::new(LocalConnectionManager::new()),
            fast_settings(),
        );
        manager.connect().await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_subscribes_issue_one_upstream_subscribe() {
        let (bus, manager) = process(&InMemoryBroker::new()).await;
        let chat_id = IdGenerator::new().chat_id();
        let baseline = bus.subscribe_calls();

        let attempts = (0..16).map(|_| manager.subscribe_to_chat(chat_id));
        for outcome in futures::future::join_all(attempts).await {
            outcome.unwrap();
        }

        assert_eq!(bus.subscribe_calls() - baseline, 1);
        assert_eq!(manager.upstream_channel_count(), 1);
    }

    #[tokio::test]
    async fn aborted_subscribe_releases_the_chat_lock() {
        let (bus, manager) = process(&InMemoryBroker::new()).await;
        let chat_id = IdGenerator::new().chat_id();
        let baseline = bus.subscribe_calls();
        bus.hold_subscriptions(true);

        let stuck = tokio::spawn({
            let manager = manager.clone();
            async move { manager.subscribe_to_chat(chat_id).await }
        });
        sleep(Duration::from_millis(20)).await;
        assert!(!stuck.is_finished(), "subscribe should be parked on the bus");
        stuck.abort();
        assert!(stuck.await.unwrap_err().is_cancelled());
        bus.hold_subscriptions(false);

        timeout(Duration::from_secs(1), manager.subscribe_to_chat(chat_id))
            .await
            .expect("chat lock was released")
            .unwrap();
        assert_eq!(bus.subscribe_calls() - baseline, 1);
        assert!(manager.is_subscribed(&chat_id));
    }

    #[tokio::test]
    async fn aborted_unsubscribe_releases_the_chat_lock() {
        let (bus, manager) = process(&InMemoryBroker::new()).await;
        let chat_id = IdGenerator::new().chat_id();
        manager.subscribe_to_chat(chat_id).await.unwrap();
        bus.hold_subscriptions(true);

        let stuck = tokio::spawn({
            let manager = manager.clone();
            async move { manager.unsubscribe_from_chat(chat_id).await }
        });
        sleep(Duration::from_millis(20)).await;
        stuck.abort();
        assert!(stuck.await.unwrap_err().is_cancelled());
        assert!(manager.is_subscribed(&chat_id), "upstream set untouched");
        bus.hold_subscriptions(false);

        timeout(Duration::from_secs(1), manager.unsubscribe_from_chat(chat_id))
            .await
            .expect("chat lock was released")
            .unwrap();
        assert!(!manager.is_subscribed(&chat_id));
        assert!(!bus.is_subscribed(&channel_for(&chat_id)));
    }

    #[tokio::test]
    async fn unsubscribe_waits_for_the_last_local_viewer() {
        let (bus, manager) = process(&InMemoryBroker::new()).await;
        let chat_id = IdGenerator::new().chat_id();
        let viewer = RecordingConnection::new(1);
        manager.local().connect(chat_id, viewer.clone());
        manager.subscribe_to_chat(chat_id).await.unwrap();

        manager.unsubscribe_from_chat(chat_id).await.unwrap();
        assert!(manager.is_subscribed(&chat_id), "viewer still attached");

        manager.local().disconnect(chat_id, 1);
        manager.unsubscribe_from_chat(chat_id).await.unwrap();
        assert!(!manager.is_subscribed(&chat_id));
        assert!(!bus.is_subscribed(&channel_for(&chat_id)));
    }

    #[tokio::test]
    async fn publish_reaches_viewers_in_every_subscribed_process() {
        let broker = InMemoryBroker::new();
        let (_, sender) = process(&broker).await;
        let (_, first) = process(&broker).await;
        let (_, second) = process(&broker).await;
        let listeners = [first.start_listen(), second.start_listen()];

        let ids = IdGenerator::new();
        let chat_id = ids.chat_id();
        let (a, b) = (RecordingConnection::new(1), RecordingConnection::new(2));
        first.local().connect(chat_id, a.clone());
        second.local().connect(chat_id, b.clone());
        first.subscribe_to_chat(chat_id).await.unwrap();
        second.subscribe_to_chat(chat_id).await.unwrap();

        let message = ChatMessage::new(chat_id, ids.message_id(), "alice", "Hi", None);
        let envelope = FanoutEnvelope::Message(message);
        sender.publish(&envelope).await.unwrap();

        let expected = envelope.to_payload().unwrap();
        assert_eq!(wait_for(&a, 1).await, vec![expected.clone()]);
        assert_eq!(wait_for(&b, 1).await, vec![expected]);

        first.shutdown().await;
        second.shutdown().await;
        for listener in listeners {
            let outcome = timeout(Duration::from_secs(1), listener).await.unwrap();
            outcome.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn unsubscribed_process_receives_nothing() {
        let broker = InMemoryBroker::new();
        let (_, sender) = process(&broker).await;
        let (_, idle) = process(&broker).await;
        let listener = idle.start_listen();

        let ids = IdGenerator::new();
        let chat_id = ids.chat_id();
        let viewer = RecordingConnection::new(1);
        idle.local().connect(chat_id, viewer.clone());

        let message = ChatMessage::new(chat_id, ids.message_id(), "alice", "Hi", None);
        sender.publish(&FanoutEnvelope::Message(message)).await.unwrap();
        sleep(Duration::from_millis(100)).await;
        assert!(viewer.received().is_empty());

        idle.shutdown().await;
        listener.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn listener_failure_ends_the_task_with_an_error() {
        let (bus, manager) = process(&InMemoryBroker::new()).await;
        let listener = manager.start_listen();
        bus.fail_next_poll();

        let outcome = timeout(Duration::from_secs(1), listener)
            .await
            .expect("listener stops")
            .expect("task joins");
        assert!(matches!(outcome, Err(FanoutError::Listener(_))));
    }
}
