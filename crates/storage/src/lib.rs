//! Sorted-key storage for chats, memberships, message history and users.
//!
//! Repositories are written against [`KeyValueStore`]; [`MemoryStore`] backs
//! tests and single-node runs, [`PgStore`] persists to Postgres.

use std::sync::Arc;

use anyhow::Result;
use sqlx::postgres::PgPoolOptions;

pub mod chat_data;
pub mod chat_history;
pub mod cursor;
pub mod memory;
pub mod postgres;
pub mod repository;
pub mod retry;
pub mod store;
pub mod unit_of_work;
pub mod user;
pub mod user_chat;

pub use sqlx::PgPool;

pub use chat_data::{ChatDataRepository, CHAT_DATA};
pub use chat_history::{ChatHistoryRepository, HistoryPage, CHAT_HISTORY};
pub use cursor::Cursor;
pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use repository::{Requirement, RepositoryError};
pub use retry::{retry_transient, write_batch, RetryPolicy};
pub use store::{
    BatchRequest, Condition, IndexSchema, Item, ItemKey, KeyValueStore, QueryPage, QueryRequest,
    StoreError, TableSchema, WriteOp,
};
pub use unit_of_work::{UnitOfWork, UnitOfWorkFactory};
pub use user::{RegisterUserError, StoreUserDirectory, UserDirectory, USER_DATA};
pub use user_chat::{UserChatRepository, CHAT_ID_INDEX, USER_CHAT};

/// Thin wrapper around a shared `PgPool`.
#[derive(Clone)]
pub struct StoragePool {
    pool: Arc<PgPool>,
}

impl StoragePool {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

pub async fn connect(database_url: &str) -> Result<StoragePool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;

    Ok(StoragePool::new(pool))
}

/// Applies the bundled migrations (creates `kv_items`).
pub async fn migrate(pool: &StoragePool) -> Result<()> {
    sqlx::migrate!("../../migrations").run(pool.pool()).await?;
    Ok(())
}

/// Tuning shared by the repositories.
#[derive(Debug, Clone, Copy)]
pub struct StorageSettings {
    pub retry: RetryPolicy,
    pub batch_chunk_size: usize,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            batch_chunk_size: 25,
        }
    }
}

/// Every repository bound to one store.
#[derive(Clone)]
pub struct Repositories {
    pub chat_data: ChatDataRepository,
    pub user_chat: UserChatRepository,
    pub chat_history: ChatHistoryRepository,
    pub users: StoreUserDirectory,
    pub units: UnitOfWorkFactory,
    backend: &'static str,
}

impl Repositories {
    pub fn new(store: Arc<dyn KeyValueStore>, settings: StorageSettings) -> Self {
        let StorageSettings {
            retry,
            batch_chunk_size,
        } = settings;
        Self {
            chat_data: ChatDataRepository::new(store.clone(), retry),
            user_chat: UserChatRepository::new(store.clone(), retry, batch_chunk_size),
            chat_history: ChatHistoryRepository::new(store.clone(), retry, batch_chunk_size),
            users: StoreUserDirectory::new(store.clone(), retry),
            units: UnitOfWorkFactory::new(store.clone(), retry),
            backend: store.backend_name(),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend
    }
}
