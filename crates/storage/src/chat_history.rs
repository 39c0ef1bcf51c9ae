use std::sync::Arc;

use harmony_core::{ChatId, ChatMessage};
use tracing::debug;

use crate::{
    cursor::Cursor,
    repository::{from_item, to_item, Requirement, RepositoryError},
    retry::{retry_transient, write_batch, RetryPolicy},
    store::{BatchRequest, Condition, KeyValueStore, QueryRequest, StoreError, TableSchema},
};

pub const CHAT_HISTORY: TableSchema = TableSchema {
    name: "ChatHistory",
    partition_attr: "chat_id",
    sort_attr: Some("ulid"),
    indexes: &[],
};

/// One page of history, newest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryPage {
    pub messages: Vec<ChatMessage>,
    pub next_cursor: Option<String>,
}

#[derive(Clone)]
pub struct ChatHistoryRepository {
    store: Arc<dyn KeyValueStore>,
    policy: RetryPolicy,
    chunk_size: usize,
}

impl ChatHistoryRepository {
    pub fn new(store: Arc<dyn KeyValueStore>, policy: RetryPolicy, chunk_size: usize) -> Self {
        Self {
            store,
            policy,
            chunk_size,
        }
    }

    /// Appends a message; its id must not already be in the chat.
    pub async fn create_message(&self, message: &ChatMessage) -> Result<(), RepositoryError> {
        let item = to_item(&CHAT_HISTORY, message)?;
        let store = self.store.as_ref();
        let result = retry_transient(&self.policy, "put_message", || {
            store.put(&CHAT_HISTORY, item.clone(), Some(Condition::NotExists))
        })
        .await;
        match result {
            Ok(()) => Ok(()),
            Err(StoreError::ConditionFailed { .. }) => {
                Err(RepositoryError::Requirement(Requirement::MessageIdAvailable))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Reads up to `limit` messages older than `cursor`, newest first.
    pub async fn page(
        &self,
        chat_id: &ChatId,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<HistoryPage, RepositoryError> {
        let partition = chat_id.to_string();
        let start = cursor
            .map(|token| Cursor::decode_for(token, &partition).map(Cursor::into_key))
            .transpose()?;
        let request = QueryRequest::new(CHAT_HISTORY, partition)
            .descending()
            .limit(limit.max(1))
            .start_after(start);

        let store = self.store.as_ref();
        let page = retry_transient(&self.policy, "query_history", || store.query(&request)).await?;
        let messages = page
            .items
            .into_iter()
            .map(|item| from_item(&CHAT_HISTORY, item))
            .collect::<Result<Vec<ChatMessage>, _>>()?;

        Ok(HistoryPage {
            messages,
            next_cursor: page.last_key.map(|key| Cursor::from_key(key).encode()),
        })
    }

    /// Deletes every message of the chat, one page at a time.
    pub async fn purge_chat(&self, chat_id: &ChatId) -> Result<usize, RepositoryError> {
        let mut request =
            QueryRequest::new(CHAT_HISTORY, chat_id.to_string()).limit(self.chunk_size.max(1));
        let store = self.store.as_ref();
        let mut removed = 0;
        loop {
            let page =
                retry_transient(&self.policy, "query_history", || store.query(&request)).await?;
            let deletes = page
                .items
                .iter()
                .map(|item| CHAT_HISTORY.key_of(item).map(BatchRequest::Delete))
                .collect::<Result<Vec<_>, _>>()?;
            removed += deletes.len();
            write_batch(store, &CHAT_HISTORY, deletes, self.chunk_size, &self.policy).await?;

            match page.last_key {
                Some(last) => request = request.start_after(Some(last)),
                None => break,
            }
        }
        debug!(%chat_id, removed, "purged chat history");
        Ok(removed)
    }
}
