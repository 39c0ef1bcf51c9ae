use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex, PoisonError, Weak},
};

use harmony_core::ChatId;
use tokio::sync::{Mutex, OwnedMutexGuard};

const MIN_PRUNE_THRESHOLD: usize = 64;

/// Lazily created per-chat async mutexes.
///
/// The table keeps only weak references, so a lock lives exactly as long as
/// some task holds or awaits it. Dead entries are swept whenever the table
/// doubles in size since the last sweep.
pub struct ChatLocks {
    inner: StdMutex<LockTable>,
}

struct LockTable {
    locks: HashMap<ChatId, Weak<Mutex<()>>>,
    prune_at: usize,
}

impl Default for ChatLocks {
    fn default() -> Self {
        Self::new()
    }
}

impl ChatLocks {
    pub fn new() -> Self {
        Self {
            inner: StdMutex::new(LockTable {
                locks: HashMap::new(),
                prune_at: MIN_PRUNE_THRESHOLD,
            }),
        }
    }

    pub async fn lock(&self, chat_id: ChatId) -> OwnedMutexGuard<()> {
        let lock = self.lock_for(chat_id);
        lock.lock_owned().await
    }

    fn lock_for(&self, chat_id: ChatId) -> Arc<Mutex<()>> {
        let mut table = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = table.locks.get(&chat_id).and_then(Weak::upgrade) {
            return existing;
        }
        if table.locks.len() >= table.prune_at {
            table.locks.retain(|_, weak| weak.strong_count() > 0);
            table.prune_at = (table.locks.len() * 2).max(MIN_PRUNE_THRESHOLD);
        }
        let lock = Arc::new(Mutex::new(()));
        table.locks.insert(chat_id, Arc::downgrade(&lock));
        lock
    }

    /// Locks currently held or awaited.
    #[cfg(test)]
    fn live_count(&self) -> usize {
        let table = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        table
            .locks
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    /// Entries in the table, live or not yet swept.
    #[cfg(test)]
    fn tracked_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .locks
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harmony_core::IdGenerator;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn same_chat_serializes_and_other_chats_do_not() {
        let locks = ChatLocks::new();
        let ids = IdGenerator::new();
        let (a, b) = (ids.chat_id(), ids.chat_id());

        let held = locks.lock(a).await;
        assert!(timeout(Duration::from_millis(50), locks.lock(a)).await.is_err());
        let other = timeout(Duration::from_millis(50), locks.lock(b)).await;
        assert!(other.is_ok(), "different chat must not block");

        drop(held);
        assert!(timeout(Duration::from_millis(50), locks.lock(a)).await.is_ok());
    }

    #[tokio::test]
    async fn released_locks_are_reclaimed() {
        let locks = ChatLocks::new();
        let ids = IdGenerator::new();
        for _ in 0..(MIN_PRUNE_THRESHOLD * 4) {
            let guard = locks.lock(ids.chat_id()).await;
            drop(guard);
        }
        assert_eq!(locks.live_count(), 0);
        assert!(locks.tracked_count() <= MIN_PRUNE_THRESHOLD);
    }
}
