use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex as StdMutex, PoisonError,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    sync::{broadcast, watch, Mutex},
    time::{timeout_at, Instant},
};
use tracing::warn;

use super::{BusError, BusMessage, MessageBus};

const BROKER_CAPACITY: usize = 1024;

/// In-process stand-in for the bus server. Every replica attached to the
/// same broker sees every publish, like processes sharing one Redis.
#[derive(Clone)]
pub struct InMemoryBroker {
    sender: broadcast::Sender<BusMessage>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BROKER_CAPACITY);
        Self { sender }
    }

    /// A new connection to this broker.
    pub fn replica(&self) -> InMemoryBus {
        InMemoryBus {
            broker: self.clone(),
            receiver: Mutex::new(None),
            connected: AtomicBool::new(false),
            channels: StdMutex::new(HashSet::new()),
            subscribe_calls: AtomicUsize::new(0),
            publish_calls: AtomicUsize::new(0),
            failing_connects: AtomicUsize::new(0),
            failing_poll: AtomicBool::new(false),
            held: watch::Sender::new(false),
        }
    }
}

pub struct InMemoryBus {
    broker: InMemoryBroker,
    receiver: Mutex<Option<broadcast::Receiver<BusMessage>>>,
    connected: AtomicBool,
    channels: StdMutex<HashSet<String>>,
    subscribe_calls: AtomicUsize,
    publish_calls: AtomicUsize,
    failing_connects: AtomicUsize,
    failing_poll: AtomicBool,
    held: watch::Sender<bool>,
}

impl InMemoryBus {
    /// A bus with a private broker, for single-process runs.
    pub fn standalone() -> Self {
        InMemoryBroker::new().replica()
    }

    /// Number of upstream subscribe commands issued so far.
    pub fn subscribe_calls(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    /// Number of publishes accepted so far.
    pub fn publish_calls(&self) -> usize {
        self.publish_calls.load(Ordering::SeqCst)
    }

    /// While held, subscribe and unsubscribe park before touching the
    /// channel set, like a command stuck on a slow connection.
    pub fn hold_subscriptions(&self, held: bool) {
        self.held.send_replace(held);
    }

    async fn wait_until_released(&self) {
        let mut held = self.held.subscribe();
        // The sender lives in `self`, so this only returns once released.
        let _ = held.wait_for(|held| !*held).await;
    }

    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.channels().contains(channel)
    }

    /// Makes the next `count` connect attempts fail.
    pub fn fail_next_connects(&self, count: usize) {
        self.failing_connects.store(count, Ordering::SeqCst);
    }

    /// Makes the next poll fail as if the connection dropped.
    pub fn fail_next_poll(&self) {
        self.failing_poll.store(true, Ordering::SeqCst);
    }

    fn channels(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_connected(&self) -> Result<(), BusError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BusError::NotConnected)
        }
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn connect(&self) -> Result<(), BusError> {
        let pending = self.failing_connects.load(Ordering::SeqCst);
        if pending > 0 {
            self.failing_connects.store(pending - 1, Ordering::SeqCst);
            return Err(BusError::Unavailable("connection refused".into()));
        }
        *self.receiver.lock().await = Some(self.broker.sender.subscribe());
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<(), BusError> {
        self.ensure_connected()?;
        self.wait_until_released().await;
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        self.channels().insert(channel.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), BusError> {
        self.ensure_connected()?;
        self.wait_until_released().await;
        self.channels().remove(channel);
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BusError> {
        self.ensure_connected()?;
        self.publish_calls.fetch_add(1, Ordering::SeqCst);
        // No live receivers is not an error: nobody is listening anywhere.
        let _ = self.broker.sender.send(BusMessage {
            channel: channel.to_string(),
            payload: payload.to_string(),
        });
        Ok(())
    }

    async fn next_message(&self, timeout: Duration) -> Result<Option<BusMessage>, BusError> {
        if self.failing_poll.swap(false, Ordering::SeqCst) {
            return Err(BusError::Unavailable("connection reset".into()));
        }
        let mut guard = self.receiver.lock().await;
        let receiver = guard.as_mut().ok_or(BusError::NotConnected)?;
        let deadline = Instant::now() + timeout;
        loop {
            match timeout_at(deadline, receiver.recv()).await {
                Err(_) => return Ok(None),
                Ok(Ok(msg)) => {
                    let wanted = self.channels().contains(&msg.channel);
                    if wanted {
                        return Ok(Some(msg));
                    }
                }
                Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                    warn!(skipped, "in-memory bus receiver lagged; messages dropped");
                }
                Ok(Err(broadcast::error::RecvError::Closed)) => return Err(BusError::Closed),
            }
        }
    }

    async fn close(&self) -> Result<(), BusError> {
        self.connected.store(false, Ordering::SeqCst);
        self.receiver.lock().await.take();
        self.channels().clear();
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
