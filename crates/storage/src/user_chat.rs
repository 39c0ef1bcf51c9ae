use std::sync::Arc;

use harmony_core::{ChatId, Membership};
use tracing::debug;

use crate::{
    repository::{from_item, to_item, Requirement, RepositoryError},
    retry::{retry_transient, write_batch, RetryPolicy},
    store::{
        BatchRequest, Condition, IndexSchema, ItemKey, KeyValueStore, QueryPage, QueryRequest,
        TableSchema, WriteOp,
    },
    unit_of_work::UnitOfWork,
};

pub const CHAT_ID_INDEX: &str = "ChatIdIndex";

/// Membership rows keyed by user, with a secondary index keyed by chat.
pub const USER_CHAT: TableSchema = TableSchema {
    name: "UserChat",
    partition_attr: "user_id",
    sort_attr: Some("chat_id"),
    indexes: &[IndexSchema {
        name: CHAT_ID_INDEX,
        partition_attr: "chat_id",
        sort_attr: Some("user_id"),
    }],
};

#[derive(Clone)]
pub struct UserChatRepository {
    store: Arc<dyn KeyValueStore>,
    policy: RetryPolicy,
    chunk_size: usize,
}

impl UserChatRepository {
    pub fn new(store: Arc<dyn KeyValueStore>, policy: RetryPolicy, chunk_size: usize) -> Self {
        Self {
            store,
            policy,
            chunk_size,
        }
    }

    fn key(chat_id: &ChatId, user_id: &str) -> ItemKey {
        ItemKey::with_sort(user_id, chat_id.to_string())
    }

    /// Stages one membership row per user. Re-adding a member overwrites.
    pub fn stage_add_users(
        &self,
        uow: &mut UnitOfWork,
        chat_id: &ChatId,
        user_ids: &[String],
    ) -> Result<(), RepositoryError> {
        for user_id in user_ids {
            let membership = Membership {
                user_id: user_id.clone(),
                chat_id: *chat_id,
            };
            uow.stage(
                WriteOp::Put {
                    table: USER_CHAT,
                    item: to_item(&USER_CHAT, &membership)?,
                    condition: None,
                },
                None,
            );
        }
        Ok(())
    }

    pub fn stage_require_member(&self, uow: &mut UnitOfWork, chat_id: &ChatId, user_id: &str) {
        uow.stage(
            WriteOp::Check {
                table: USER_CHAT,
                key: Self::key(chat_id, user_id),
                condition: Condition::Exists,
            },
            Some(Requirement::MemberOfChat),
        );
    }

    pub fn stage_remove_member(&self, uow: &mut UnitOfWork, chat_id: &ChatId, user_id: &str) {
        uow.stage(
            WriteOp::Delete {
                table: USER_CHAT,
                key: Self::key(chat_id, user_id),
                condition: Some(Condition::Exists),
            },
            Some(Requirement::MemberOfChat),
        );
    }

    pub async fn is_member(&self, chat_id: &ChatId, user_id: &str) -> Result<bool, RepositoryError> {
        let key = Self::key(chat_id, user_id);
        let store = self.store.as_ref();
        let item = retry_transient(&self.policy, "get_membership", || store.get(&USER_CHAT, &key))
            .await?;
        Ok(item.is_some())
    }

    /// Every chat the user belongs to, oldest first.
    pub async fn chats_for_user(&self, user_id: &str) -> Result<Vec<ChatId>, RepositoryError> {
        let request = QueryRequest::new(USER_CHAT, user_id).limit(self.chunk_size.max(1));
        let memberships = self.collect(request).await?;
        Ok(memberships.into_iter().map(|m| m.chat_id).collect())
    }

    /// Every user in the chat, ordered by user id.
    pub async fn members_of_chat(&self, chat_id: &ChatId) -> Result<Vec<String>, RepositoryError> {
        let request = QueryRequest::new(USER_CHAT, chat_id.to_string())
            .on_index(CHAT_ID_INDEX)
            .limit(self.chunk_size.max(1));
        let memberships = self.collect(request).await?;
        Ok(memberships.into_iter().map(|m| m.user_id).collect())
    }

    /// Deletes every membership of the chat, one page at a time.
    pub async fn purge_chat(&self, chat_id: &ChatId) -> Result<usize, RepositoryError> {
        let mut request = QueryRequest::new(USER_CHAT, chat_id.to_string())
            .on_index(CHAT_ID_INDEX)
            .limit(self.chunk_size.max(1));
        let mut removed = 0;
        loop {
            let page = self.page(&request).await?;
            let deletes: Vec<BatchRequest> = page
                .items
                .into_iter()
                .map(|item| USER_CHAT.key_of(&item).map(BatchRequest::Delete))
                .collect::<Result<_, _>>()?;
            removed += deletes.len();
            write_batch(
                self.store.as_ref(),
                &USER_CHAT,
                deletes,
                self.chunk_size,
                &self.policy,
            )
            .await?;

            match page.last_key {
                Some(last) => request = request.start_after(Some(last)),
                None => break,
            }
        }
        debug!(%chat_id, removed, "purged chat memberships");
        Ok(removed)
    }

    async fn page(&self, request: &QueryRequest) -> Result<QueryPage, RepositoryError> {
        let store = self.store.as_ref();
        Ok(retry_transient(&self.policy, "query_memberships", || store.query(request)).await?)
    }

    async fn collect(&self, mut request: QueryRequest) -> Result<Vec<Membership>, RepositoryError> {
        let mut memberships = Vec::new();
        loop {
            let page = self.page(&request).await?;
            for item in page.items {
                memberships.push(from_item(&USER_CHAT, item)?);
            }
            match page.last_key {
                Some(last) => request = request.start_after(Some(last)),
                None => return Ok(memberships),
            }
        }
    }
}
