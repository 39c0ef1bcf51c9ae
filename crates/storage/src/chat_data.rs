use std::sync::Arc;

use harmony_core::{ChatId, ChatRecord, ChatState};
use serde_json::Value;
use tracing::warn;

use crate::{
    repository::{from_item, to_item, Requirement, RepositoryError},
    retry::{retry_transient, RetryPolicy},
    store::{Condition, ItemKey, KeyValueStore, StoreError, TableSchema, WriteOp},
    unit_of_work::UnitOfWork,
};

pub const CHAT_DATA: TableSchema = TableSchema {
    name: "ChatData",
    partition_attr: "chat_id",
    sort_attr: None,
    indexes: &[],
};

fn state_is(state: ChatState) -> Condition {
    Condition::AttributeEquals {
        attribute: "state",
        value: Value::String(state.as_str().to_string()),
    }
}

/// Chat rows: existence and lifecycle state.
#[derive(Clone)]
pub struct ChatDataRepository {
    store: Arc<dyn KeyValueStore>,
    policy: RetryPolicy,
}

impl ChatDataRepository {
    pub fn new(store: Arc<dyn KeyValueStore>, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    fn key(chat_id: &ChatId) -> ItemKey {
        ItemKey::new(chat_id.to_string())
    }

    /// Stages the row of a new chat; fails the unit if the id is taken.
    pub fn stage_create(
        &self,
        uow: &mut UnitOfWork,
        record: &ChatRecord,
    ) -> Result<(), RepositoryError> {
        let item = to_item(&CHAT_DATA, record)?;
        uow.stage(
            WriteOp::Put {
                table: CHAT_DATA,
                item,
                condition: Some(Condition::NotExists),
            },
            Some(Requirement::ChatIdAvailable),
        );
        Ok(())
    }

    /// Stages an assertion that the chat exists and is not tombstoned.
    pub fn stage_require_exists(&self, uow: &mut UnitOfWork, chat_id: &ChatId) {
        uow.stage(
            WriteOp::Check {
                table: CHAT_DATA,
                key: Self::key(chat_id),
                condition: state_is(ChatState::Valid),
            },
            Some(Requirement::ChatExists),
        );
    }

    /// Stages the flip of a valid chat to the tombstoned state.
    pub fn stage_tombstone(
        &self,
        uow: &mut UnitOfWork,
        chat_id: &ChatId,
    ) -> Result<(), RepositoryError> {
        let record = ChatRecord {
            state: ChatState::Tombstoned,
            ..ChatRecord::new(*chat_id)
        };
        let item = to_item(&CHAT_DATA, &record)?;
        uow.stage(
            WriteOp::Put {
                table: CHAT_DATA,
                item,
                condition: Some(state_is(ChatState::Valid)),
            },
            Some(Requirement::ChatExists),
        );
        Ok(())
    }

    pub async fn get(&self, chat_id: &ChatId) -> Result<Option<ChatRecord>, RepositoryError> {
        let key = Self::key(chat_id);
        let store = self.store.as_ref();
        let item = retry_transient(&self.policy, "get_chat", || store.get(&CHAT_DATA, &key)).await?;
        item.map(|item| from_item(&CHAT_DATA, item)).transpose()
    }

    /// True only for chats that exist and are not tombstoned.
    pub async fn chat_exists(&self, chat_id: &ChatId) -> Result<bool, RepositoryError> {
        Ok(self
            .get(chat_id)
            .await?
            .is_some_and(|record| record.is_valid()))
    }

    /// Removes a tombstoned row. Valid chats are left alone.
    pub async fn purge(&self, chat_id: &ChatId) -> Result<bool, RepositoryError> {
        let key = Self::key(chat_id);
        let store = self.store.as_ref();
        let result = retry_transient(&self.policy, "purge_chat", || {
            store.delete(&CHAT_DATA, &key, Some(state_is(ChatState::Tombstoned)))
        })
        .await;
        match result {
            Ok(()) => Ok(true),
            Err(StoreError::ConditionFailed { .. }) => {
                warn!(%chat_id, "chat row not tombstoned; skipping purge");
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }
}
