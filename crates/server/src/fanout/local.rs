use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use async_trait::async_trait;
use harmony_core::ChatId;
use thiserror::Error;
use tracing::{debug, warn};

pub type ConnectionId = u64;

#[derive(Debug, Error)]
#[error("connection {0} is closed")]
pub struct ConnectionClosed(pub ConnectionId);

/// A live viewer attached to this process.
#[async_trait]
pub trait LocalConnection: Send + Sync {
    fn id(&self) -> ConnectionId;

    async fn send_text(&self, payload: Arc<str>) -> Result<(), ConnectionClosed>;
}

/// Layer 2: the viewers of each chat held by this process.
#[derive(Default)]
pub struct LocalConnectionManager {
    chats: Mutex<HashMap<ChatId, HashMap<ConnectionId, Arc<dyn LocalConnection>>>>,
    next_id: AtomicU64,
}

impl LocalConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_connection_id(&self) -> ConnectionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn chats(&self) -> MutexGuard<'_, HashMap<ChatId, HashMap<ConnectionId, Arc<dyn LocalConnection>>>> {
        self.chats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn connect(&self, chat_id: ChatId, connection: Arc<dyn LocalConnection>) {
        let id = connection.id();
        let mut chats = self.chats();
        let viewers = chats.entry(chat_id).or_default();
        viewers.insert(id, connection);
        debug!(%chat_id, connection_id = id, viewers = viewers.len(), "viewer attached");
    }

    /// Removes one viewer; the chat entry goes with its last viewer.
    /// Returns whether the viewer was registered.
    pub fn disconnect(&self, chat_id: ChatId, connection_id: ConnectionId) -> bool {
        let mut chats = self.chats();
        let Some(viewers) = chats.get_mut(&chat_id) else {
            return false;
        };
        let removed = viewers.remove(&connection_id).is_some();
        if viewers.is_empty() {
            chats.remove(&chat_id);
        }
        if removed {
            debug!(%chat_id, connection_id, "viewer detached");
        }
        removed
    }

    /// Sends `payload` to every viewer of the chat, dropping viewers whose
    /// send fails. Returns the number of successful deliveries.
    pub async fn broadcast_local(&self, chat_id: ChatId, payload: &str) -> usize {
        let viewers: Vec<Arc<dyn LocalConnection>> = match self.chats().get(&chat_id) {
            Some(viewers) => viewers.values().cloned().collect(),
            None => return 0,
        };
        let payload: Arc<str> = Arc::from(payload);
        let mut delivered = 0;
        for viewer in viewers {
            match viewer.send_text(payload.clone()).await {
                Ok(()) => delivered += 1,
                Err(err) => {
                    warn!(%chat_id, connection_id = viewer.id(), %err, "dropping unreachable viewer");
                    self.disconnect(chat_id, viewer.id());
                }
            }
        }
        delivered
    }

    pub fn is_chat_active_locally(&self, chat_id: &ChatId) -> bool {
        self.chats()
            .get(chat_id)
            .is_some_and(|viewers| !viewers.is_empty())
    }

    pub fn connection_count(&self, chat_id: &ChatId) -> usize {
        self.chats().get(chat_id).map_or(0, HashMap::len)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use harmony_core::IdGenerator;
    use std::sync::atomic::AtomicBool;

    /// Records what it was sent; can be switched to fail.
    pub(crate) struct RecordingConnection {
        id: ConnectionId,
        received: Mutex<Vec<String>>,
        broken: AtomicBool,
    }

    impl RecordingConnection {
        pub(crate) fn new(id: ConnectionId) -> Arc<Self> {
            Arc::new(Self {
                id,
                received: Mutex::new(Vec::new()),
                broken: AtomicBool::new(false),
            })
        }

        pub(crate) fn break_pipe(&self) {
            self.broken.store(true, Ordering::SeqCst);
        }

        pub(crate) fn received(&self) -> Vec<String> {
            self.received.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl LocalConnection for RecordingConnection {
        fn id(&self) -> ConnectionId {
            self.id
        }

        async fn send_text(&self, payload: Arc<str>) -> Result<(), ConnectionClosed> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(ConnectionClosed(self.id));
            }
            self.received.lock().unwrap().push(payload.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn broadcast_reaches_only_the_target_chat() {
        let manager = LocalConnectionManager::new();
        let ids = IdGenerator::new();
        let (a, b) = (ids.chat_id(), ids.chat_id());
        let first = RecordingConnection::new(manager.next_connection_id());
        let second = RecordingConnection::new(manager.next_connection_id());
        let elsewhere = RecordingConnection::new(manager.next_connection_id());
        manager.connect(a, first.clone());
        manager.connect(a, second.clone());
        manager.connect(b, elsewhere.clone());

        assert_eq!(manager.broadcast_local(a, "hello").await, 2);
        assert_eq!(first.received(), vec!["hello"]);
        assert_eq!(second.received(), vec!["hello"]);
        assert!(elsewhere.received().is_empty());
    }

    #[tokio::test]
    async fn failed_send_disconnects_only_that_viewer() {
        let manager = LocalConnectionManager::new();
        let chat_id = IdGenerator::new().chat_id();
        let healthy = RecordingConnection::new(1);
        let broken = RecordingConnection::new(2);
        manager.connect(chat_id, healthy.clone());
        manager.connect(chat_id, broken.clone());
        broken.break_pipe();

        assert_eq!(manager.broadcast_local(chat_id, "m1").await, 1);
        assert_eq!(manager.connection_count(&chat_id), 1);
        assert_eq!(manager.broadcast_local(chat_id, "m2").await, 1);
        assert_eq!(healthy.received(), vec!["m1", "m2"]);
    }

    #[tokio::test]
    async fn last_disconnect_removes_the_chat_entry() {
        let manager = LocalConnectionManager::new();
        let chat_id = IdGenerator::new().chat_id();
        manager.connect(chat_id, RecordingConnection::new(7));
        assert!(manager.is_chat_active_locally(&chat_id));

        assert!(manager.disconnect(chat_id, 7));
        assert!(!manager.disconnect(chat_id, 7));
        assert!(!manager.is_chat_active_locally(&chat_id));
        assert!(manager.chats().is_empty());
        assert_eq!(manager.broadcast_local(chat_id, "nobody").await, 0);
    }
}
