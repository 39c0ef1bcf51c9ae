use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::{
    repository::RepositoryError,
    retry::{retry_transient, RetryPolicy},
    store::{Condition, ItemKey, KeyValueStore, StoreError, TableSchema},
};

pub const USER_DATA: TableSchema = TableSchema {
    name: "UserData",
    partition_attr: "user_id",
    sort_attr: None,
    indexes: &[],
};

/// Answers whether a user id is known to the system.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn check_user_exists(&self, user_id: &str) -> Result<bool, RepositoryError>;
}

#[derive(Debug, Error)]
pub enum RegisterUserError {
    #[error("user already exists")]
    AlreadyExists,
    #[error("failed to register user: {0}")]
    Other(#[from] RepositoryError),
}

/// [`UserDirectory`] backed by the `UserData` table.
#[derive(Clone)]
pub struct StoreUserDirectory {
    store: Arc<dyn KeyValueStore>,
    policy: RetryPolicy,
}

impl StoreUserDirectory {
    pub fn new(store: Arc<dyn KeyValueStore>, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    pub async fn register_user(&self, user_id: &str) -> Result<(), RegisterUserError> {
        let mut item = Map::new();
        item.insert("user_id".into(), Value::String(user_id.to_string()));
        let store = self.store.as_ref();
        let result = retry_transient(&self.policy, "register_user", || {
            store.put(&USER_DATA, item.clone(), Some(Condition::NotExists))
        })
        .await;
        match result {
            Ok(()) => Ok(()),
            Err(StoreError::ConditionFailed { .. }) => Err(RegisterUserError::AlreadyExists),
            Err(err) => Err(RepositoryError::from(err).into()),
        }
    }
}

#[async_trait]
impl UserDirectory for StoreUserDirectory {
    async fn check_user_exists(&self, user_id: &str) -> Result<bool, RepositoryError> {
        let key = ItemKey::new(user_id);
        let store = self.store.as_ref();
        let item = retry_transient(&self.policy, "get_user", || store.get(&USER_DATA, &key)).await?;
        Ok(item.is_some())
    }
}
