//! Chat operations: validation, authorization and the transactional writes
//! behind them, plus live publication of sent messages.

use std::{collections::HashSet, sync::Arc};

use anyhow::anyhow;
use futures::future::try_join_all;
use harmony_core::{ChatId, ChatMessage, ChatRecord, FanoutEnvelope, IdGenerator};
use harmony_storage::{
    HistoryPage, Repositories, Requirement, RepositoryError, UnitOfWork, UserDirectory,
};
use thiserror::Error;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::fanout::{FanoutError, PubSubManager};

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    Conflict(String),
    #[error("internal error: {0:#}")]
    Internal(anyhow::Error),
    #[error("fatal startup error: {0:#}")]
    FatalStartup(anyhow::Error),
}

impl ChatError {
    fn internal(err: impl Into<anyhow::Error>) -> Self {
        ChatError::Internal(err.into())
    }
}

impl From<RepositoryError> for ChatError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::Requirement(Requirement::ChatExists) => {
                ChatError::NotFound("chat not found".into())
            }
            RepositoryError::Requirement(Requirement::MemberOfChat) => {
                ChatError::Forbidden("user is not a member of this chat".into())
            }
            RepositoryError::Requirement(Requirement::MessageIdAvailable) => {
                ChatError::Conflict("message already exists".into())
            }
            RepositoryError::InvalidCursor => ChatError::Validation("invalid cursor".into()),
            other => ChatError::internal(other),
        }
    }
}

impl From<FanoutError> for ChatError {
    fn from(err: FanoutError) -> Self {
        if err.is_fatal() {
            ChatError::FatalStartup(err.into())
        } else {
            ChatError::internal(err)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChatSettings {
    pub max_users_per_operation: usize,
    pub default_history_limit: usize,
    pub max_history_limit: usize,
    pub max_content_chars: usize,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            max_users_per_operation: 10,
            default_history_limit: 50,
            max_history_limit: 100,
            max_content_chars: 4_000,
        }
    }
}

pub struct ChatService {
    repos: Repositories,
    users: Arc<dyn UserDirectory>,
    ids: IdGenerator,
    fanout: Arc<PubSubManager>,
    settings: ChatSettings,
    purges: TaskTracker,
}

/// Trims, rejects blanks and drops repeats, keeping first-seen order.
fn normalize_user_ids<'a>(
    user_ids: impl IntoIterator<Item = &'a str>,
) -> Result<Vec<String>, ChatError> {
    let mut seen = HashSet::new();
    let mut merged = Vec::new();
    for raw in user_ids {
        let user_id = raw.trim();
        if user_id.is_empty() {
            return Err(ChatError::Validation("user ids must not be blank".into()));
        }
        if seen.insert(user_id) {
            merged.push(user_id.to_string());
        }
    }
    Ok(merged)
}

impl ChatService {
    pub fn new(
        repos: Repositories,
        users: Arc<dyn UserDirectory>,
        fanout: Arc<PubSubManager>,
        settings: ChatSettings,
    ) -> Self {
        Self {
            repos,
            users,
            ids: IdGenerator::new(),
            fanout,
            settings,
            purges: TaskTracker::new(),
        }
    }

    pub fn settings(&self) -> &ChatSettings {
        &self.settings
    }

    pub fn backend_name(&self) -> &'static str {
        self.repos.backend_name()
    }

    fn check_batch_size(&self, count: usize) -> Result<(), ChatError> {
        let max = self.settings.max_users_per_operation;
        if count > max {
            return Err(ChatError::Validation(format!(
                "at most {max} users may be given per operation"
            )));
        }
        Ok(())
    }

    /// Fails with the first unknown user, in the given order.
    async fn check_users_exist(&self, user_ids: &[String]) -> Result<(), ChatError> {
        let lookups = user_ids
            .iter()
            .map(|user_id| self.users.check_user_exists(user_id));
        let found = try_join_all(lookups).await?;
        match user_ids.iter().zip(found).find(|(_, exists)| !exists) {
            Some((missing, _)) => Err(ChatError::Validation(format!(
                "user {missing} does not exist"
            ))),
            None => Ok(()),
        }
    }

    fn begin(&self) -> UnitOfWork {
        self.repos.units.begin()
    }

    pub async fn create_chat(
        &self,
        creator_id: &str,
        requested: &[String],
    ) -> Result<ChatId, ChatError> {
        let members = normalize_user_ids(
            std::iter::once(creator_id).chain(requested.iter().map(String::as_str)),
        )?;
        self.check_batch_size(members.len())?;
        if members.len() < 2 {
            return Err(ChatError::Validation(
                "a chat needs at least two distinct users".into(),
            ));
        }
        self.check_users_exist(&members).await?;

        let chat_id = self.ids.chat_id();
        let mut uow = self.begin();
        self.repos
            .chat_data
            .stage_create(&mut uow, &ChatRecord::new(chat_id))
            .map_err(ChatError::internal)?;
        self.repos
            .user_chat
            .stage_add_users(&mut uow, &chat_id, &members)
            .map_err(ChatError::internal)?;
        // A taken chat id is an internal fault, not a caller error.
        uow.commit().await.map_err(ChatError::internal)?;

        info!(%chat_id, creator = creator_id, members = members.len(), "chat created");
        Ok(chat_id)
    }

    pub async fn add_users_to_chat(
        &self,
        requesting_user_id: &str,
        chat_id: &ChatId,
        user_ids: &[String],
    ) -> Result<(), ChatError> {
        let additions = normalize_user_ids(user_ids.iter().map(String::as_str))?;
        if additions.is_empty() {
            return Err(ChatError::Validation("no users to add".into()));
        }
        self.check_batch_size(additions.len())?;
        self.check_users_exist(&additions).await?;

        let mut uow = self.begin();
        self.repos.chat_data.stage_require_exists(&mut uow, chat_id);
        self.repos
            .user_chat
            .stage_require_member(&mut uow, chat_id, requesting_user_id);
        self.repos
            .user_chat
            .stage_add_users(&mut uow, chat_id, &additions)
            .map_err(ChatError::internal)?;
        uow.commit().await?;

        info!(%chat_id, by = requesting_user_id, added = additions.len(), "users added to chat");
        Ok(())
    }

    /// Existence and membership, read concurrently.
    pub async fn ensure_member(&self, user_id: &str, chat_id: &ChatId) -> Result<(), ChatError> {
        let (exists, member) = tokio::try_join!(
            self.repos.chat_data.chat_exists(chat_id),
            self.repos.user_chat.is_member(chat_id, user_id),
        )?;
        if !exists {
            return Err(ChatError::NotFound("chat not found".into()));
        }
        if !member {
            return Err(ChatError::Forbidden(
                "user is not a member of this chat".into(),
            ));
        }
        Ok(())
    }

    pub async fn send_message(
        &self,
        chat_id: &ChatId,
        user_id: &str,
        content: &str,
        dedup_token: Option<String>,
    ) -> Result<ChatMessage, ChatError> {
        if content.trim().is_empty() {
            return Err(ChatError::Validation("content must not be blank".into()));
        }
        let max = self.settings.max_content_chars;
        if content.chars().count() > max {
            return Err(ChatError::Validation(format!(
                "content exceeds {max} characters"
            )));
        }
        self.ensure_member(user_id, chat_id).await?;

        let message = ChatMessage::new(
            *chat_id,
            self.ids.message_id(),
            user_id,
            content,
            dedup_token,
        );
        self.persist_message(&message).await?;
        self.fanout
            .publish(&FanoutEnvelope::Message(message.clone()))
            .await
            .map_err(|err| {
                warn!(%chat_id, message_id = %message.message_id, ?err, "stored message not published");
                ChatError::internal(err)
            })?;

        info!(%chat_id, message_id = %message.message_id, "message sent");
        Ok(message)
    }

    async fn persist_message(&self, message: &ChatMessage) -> Result<(), ChatError> {
        Ok(self.repos.chat_history.create_message(message).await?)
    }

    pub async fn get_chat_history(
        &self,
        user_id: &str,
        chat_id: &ChatId,
        limit: Option<usize>,
        cursor: Option<&str>,
    ) -> Result<HistoryPage, ChatError> {
        self.ensure_member(user_id, chat_id).await?;
        let limit = limit
            .unwrap_or(self.settings.default_history_limit)
            .clamp(1, self.settings.max_history_limit.max(1));
        Ok(self.repos.chat_history.page(chat_id, limit, cursor).await?)
    }

    pub async fn leave_chat(&self, user_id: &str, chat_id: &ChatId) -> Result<(), ChatError> {
        let mut uow = self.begin();
        self.repos.chat_data.stage_require_exists(&mut uow, chat_id);
        self.repos
            .user_chat
            .stage_remove_member(&mut uow, chat_id, user_id);
        uow.commit().await?;
        info!(%chat_id, user_id, "user left chat");
        Ok(())
    }

    /// Tombstones the chat, then purges its rows in the background.
    pub async fn delete_chat(&self, user_id: &str, chat_id: &ChatId) -> Result<(), ChatError> {
        let mut uow = self.begin();
        self.repos
            .chat_data
            .stage_tombstone(&mut uow, chat_id)
            .map_err(ChatError::internal)?;
        self.repos
            .user_chat
            .stage_require_member(&mut uow, chat_id, user_id);
        uow.commit().await?;
        info!(%chat_id, by = user_id, "chat tombstoned");

        let repos = self.repos.clone();
        let chat_id = *chat_id;
        self.purges.spawn(async move { purge_chat(repos, chat_id).await });
        Ok(())
    }

    /// Chats the user belongs to, tombstoned ones excluded.
    pub async fn list_chats(&self, user_id: &str) -> Result<Vec<ChatId>, ChatError> {
        let chat_ids = self.repos.user_chat.chats_for_user(user_id).await?;
        let live = try_join_all(
            chat_ids
                .iter()
                .map(|chat_id| self.repos.chat_data.chat_exists(chat_id)),
        )
        .await?;
        Ok(chat_ids
            .into_iter()
            .zip(live)
            .filter_map(|(chat_id, live)| live.then_some(chat_id))
            .collect())
    }

    pub async fn list_members(
        &self,
        user_id: &str,
        chat_id: &ChatId,
    ) -> Result<Vec<String>, ChatError> {
        self.ensure_member(user_id, chat_id).await?;
        Ok(self.repos.user_chat.members_of_chat(chat_id).await?)
    }

    /// Waits for scheduled purges to finish.
    pub async fn drain_purges(&self) {
        self.purges.close();
        self.purges.wait().await;
        self.purges.reopen();
    }
}

async fn purge_chat(repos: Repositories, chat_id: ChatId) {
    let (history, members) = tokio::join!(
        repos.chat_history.purge_chat(&chat_id),
        repos.user_chat.purge_chat(&chat_id),
    );
    match (history, members) {
        (Ok(messages), Ok(memberships)) => match repos.chat_data.purge(&chat_id).await {
            Ok(_) => info!(%chat_id, messages, memberships, "chat purged"),
            Err(err) => warn!(%chat_id, ?err, "failed to remove tombstoned chat row"),
        },
        (history, members) => {
            let err = history
                .err()
                .or(members.err())
                .map(anyhow::Error::from)
                .unwrap_or_else(|| anyhow!("unknown purge failure"));
            warn!(%chat_id, ?err, "chat purge incomplete; tombstone kept");
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{bus::InMemoryBus, fanout::LocalConnectionManager, fanout::PubSubSettings};
    use harmony_storage::{
        KeyValueStore, MemoryStore, StorageSettings, CHAT_DATA, CHAT_HISTORY, USER_CHAT,
    };

    pub(crate) struct ChatHarness {
        pub store: Arc<MemoryStore>,
        pub bus: Arc<InMemoryBus>,
        pub fanout: Arc<PubSubManager>,
        pub service: Arc<ChatService>,
    }

    impl ChatHarness {
        pub(crate) async fn new(users: &[&str]) -> Self {
            let store = Arc::new(MemoryStore::new());
            let dyn_store: Arc<dyn KeyValueStore> = store.clone();
            let repos = Repositories::new(dyn_store, StorageSettings::default());
            for user in users {
                repos.users.register_user(user).await.unwrap();
            }
            let bus = Arc::new(InMemoryBus::standalone());
            let fanout = Arc::new(PubSubManager::new(
                bus.clone(),
                Arc::new(LocalConnectionManager::new()),
                PubSubSettings::default(),
            ));
            fanout.connect().await.unwrap();
            let users = Arc::new(repos.users.clone());
            let service = Arc::new(ChatService::new(
                repos,
                users,
                fanout.clone(),
                ChatSettings::default(),
            ));
            Self {
                store,
                bus,
                fanout,
                service,
            }
        }
    }

    fn names(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|name| name.to_string()).collect()
    }

    const EVERYONE: &[&str] = &["alice", "bob", "carol", "dave"];

    #[tokio::test]
    async fn create_chat_dedups_and_includes_creator() {
        let h = ChatHarness::new(EVERYONE).await;
        let chat_id = h
            .service
            .create_chat("alice", &names(&["bob", " bob ", "alice"]))
            .await
            .unwrap();

        let members = h.service.list_members("bob", &chat_id).await.unwrap();
        assert_eq!(members, names(&["alice", "bob"]));
        assert_eq!(h.service.list_chats("alice").await.unwrap(), vec![chat_id]);
    }

    #[tokio::test]
    async fn create_chat_rejects_bad_member_sets_without_writing() {
        let h = ChatHarness::new(EVERYONE).await;
        let writes_before = h.store.write_count();

        let solo = h.service.create_chat("alice", &names(&["alice"])).await;
        assert!(matches!(solo, Err(ChatError::Validation(_))));

        let crowd: Vec<String> = (0..10).map(|n| format!("user-{n}")).collect();
        let crowded = h.service.create_chat("alice", &crowd).await;
        assert!(matches!(crowded, Err(ChatError::Validation(_))));

        let unknown = h
            .service
            .create_chat("alice", &names(&["bob", "zed", "yan"]))
            .await;
        match unknown {
            Err(ChatError::Validation(message)) => assert!(message.contains("zed")),
            other => panic!("unexpected outcome {other:?}"),
        }

        let blank = h.service.create_chat("alice", &names(&["  "])).await;
        assert!(matches!(blank, Err(ChatError::Validation(_))));

        assert_eq!(h.store.write_count(), writes_before);
    }

    #[tokio::test]
    async fn create_chat_accepts_the_maximum_member_count() {
        let users: Vec<String> = (0..10).map(|n| format!("user-{n}")).collect();
        let refs: Vec<&str> = users.iter().map(String::as_str).collect();
        let h = ChatHarness::new(&refs).await;

        let chat_id = h.service.create_chat("user-0", &users[1..]).await.unwrap();
        let members = h.service.list_members("user-0", &chat_id).await.unwrap();
        assert_eq!(members.len(), 10);
    }

    #[tokio::test]
    async fn failed_create_commit_is_internal_and_leaves_nothing() {
        let h = ChatHarness::new(EVERYONE).await;
        h.store.fail_next_transactions(1);

        let outcome = h.service.create_chat("alice", &names(&["bob"])).await;
        assert!(matches!(outcome, Err(ChatError::Internal(_))));
        assert_eq!(h.store.item_count(&CHAT_DATA).await, 0);
        assert_eq!(h.store.item_count(&USER_CHAT).await, 0);
    }

    #[tokio::test]
    async fn add_users_requires_existing_chat_and_membership() {
        let h = ChatHarness::new(EVERYONE).await;
        let chat_id = h.service.create_chat("alice", &names(&["bob"])).await.unwrap();

        let outsider = h
            .service
            .add_users_to_chat("carol", &chat_id, &names(&["dave"]))
            .await;
        assert!(matches!(outsider, Err(ChatError::Forbidden(_))));
        let members = h.service.list_members("alice", &chat_id).await.unwrap();
        assert!(!members.contains(&"dave".to_string()));

        let missing_chat = IdGenerator::new().chat_id();
        let ghost = h
            .service
            .add_users_to_chat("alice", &missing_chat, &names(&["dave"]))
            .await;
        assert!(matches!(ghost, Err(ChatError::NotFound(_))));

        let empty = h.service.add_users_to_chat("alice", &chat_id, &[]).await;
        assert!(matches!(empty, Err(ChatError::Validation(_))));

        h.service
            .add_users_to_chat("bob", &chat_id, &names(&["carol", "dave", "carol"]))
            .await
            .unwrap();
        assert_eq!(
            h.service.list_members("dave", &chat_id).await.unwrap(),
            names(&["alice", "bob", "carol", "dave"])
        );
    }

    #[tokio::test]
    async fn send_message_validates_and_authorizes() {
        let h = ChatHarness::new(EVERYONE).await;
        let chat_id = h.service.create_chat("alice", &names(&["bob"])).await.unwrap();
        let publishes_before = h.bus.publish_calls();

        for content in ["", "   \n"] {
            let blank = h.service.send_message(&chat_id, "alice", content, None).await;
            assert!(matches!(blank, Err(ChatError::Validation(_))));
        }
        let long = "x".repeat(4_001);
        let too_long = h.service.send_message(&chat_id, "alice", &long, None).await;
        assert!(matches!(too_long, Err(ChatError::Validation(_))));
        assert_eq!(h.store.item_count(&CHAT_HISTORY).await, 0);
        assert_eq!(h.bus.publish_calls(), publishes_before);

        let exact = "é".repeat(4_000);
        h.service.send_message(&chat_id, "alice", &exact, None).await.unwrap();
        assert_eq!(h.store.item_count(&CHAT_HISTORY).await, 1);
        assert_eq!(h.bus.publish_calls(), publishes_before + 1);

        let outsider = h.service.send_message(&chat_id, "carol", "hi", None).await;
        assert!(matches!(outsider, Err(ChatError::Forbidden(_))));

        let unknown = IdGenerator::new().chat_id();
        let missing = h.service.send_message(&unknown, "alice", "hi", None).await;
        assert!(matches!(missing, Err(ChatError::NotFound(_))));

        assert_eq!(h.store.item_count(&CHAT_HISTORY).await, 1);
        assert_eq!(h.bus.publish_calls(), publishes_before + 1);
    }

    #[tokio::test]
    async fn two_person_conversation_reads_back_newest_first() {
        let h = ChatHarness::new(EVERYONE).await;
        let chat_id = h.service.create_chat("alice", &names(&["bob"])).await.unwrap();
        h.service
            .send_message(&chat_id, "alice", "Hi", None)
            .await
            .unwrap();
        h.service
            .send_message(&chat_id, "bob", "Hello back", None)
            .await
            .unwrap();

        let page = h
            .service
            .get_chat_history("alice", &chat_id, Some(50), None)
            .await
            .unwrap();
        let lines: Vec<(&str, &str)> = page
            .messages
            .iter()
            .map(|message| (message.user_id.as_str(), message.content.as_str()))
            .collect();
        assert_eq!(lines, vec![("bob", "Hello back"), ("alice", "Hi")]);
        assert!(page.next_cursor.is_none());
    }

    #[tokio::test]
    async fn sent_messages_are_paged_newest_first() {
        let h = ChatHarness::new(EVERYONE).await;
        let chat_id = h.service.create_chat("alice", &names(&["bob"])).await.unwrap();
        let mut sent = Vec::new();
        for n in 0..5 {
            let message = h
                .service
                .send_message(&chat_id, "alice", &format!("m{n}"), Some(format!("c{n}")))
                .await
                .unwrap();
            sent.push(message);
        }

        let first = h
            .service
            .get_chat_history("bob", &chat_id, Some(2), None)
            .await
            .unwrap();
        assert_eq!(first.messages, vec![sent[4].clone(), sent[3].clone()]);
        let rest = h
            .service
            .get_chat_history("bob", &chat_id, Some(10), first.next_cursor.as_deref())
            .await
            .unwrap();
        assert_eq!(rest.messages.len(), 3);
        assert!(rest.next_cursor.is_none());

        let clamped = h
            .service
            .get_chat_history("bob", &chat_id, Some(0), None)
            .await
            .unwrap();
        assert_eq!(clamped.messages.len(), 1);

        let garbage = h
            .service
            .get_chat_history("bob", &chat_id, None, Some("not-a-cursor"))
            .await;
        assert!(matches!(garbage, Err(ChatError::Validation(_))));
    }

    #[tokio::test]
    async fn replaying_a_stored_message_conflicts() {
        let h = ChatHarness::new(EVERYONE).await;
        let chat_id = h.service.create_chat("alice", &names(&["bob"])).await.unwrap();
        let message = h
            .service
            .send_message(&chat_id, "alice", "once", None)
            .await
            .unwrap();

        let replay = h.service.persist_message(&message).await;
        assert!(matches!(replay, Err(ChatError::Conflict(_))));
        assert_eq!(h.store.item_count(&CHAT_HISTORY).await, 1);
    }

    #[tokio::test]
    async fn send_fails_when_publication_fails() {
        let h = ChatHarness::new(EVERYONE).await;
        let chat_id = h.service.create_chat("alice", &names(&["bob"])).await.unwrap();
        h.fanout.shutdown().await;

        let outcome = h.service.send_message(&chat_id, "alice", "hi", None).await;
        assert!(matches!(outcome, Err(ChatError::Internal(_))));
    }

    #[tokio::test]
    async fn leave_chat_removes_only_the_leaver() {
        let h = ChatHarness::new(EVERYONE).await;
        let chat_id = h
            .service
            .create_chat("alice", &names(&["bob", "carol"]))
            .await
            .unwrap();

        h.service.leave_chat("bob", &chat_id).await.unwrap();
        assert_eq!(
            h.service.list_members("alice", &chat_id).await.unwrap(),
            names(&["alice", "carol"])
        );
        let again = h.service.leave_chat("bob", &chat_id).await;
        assert!(matches!(again, Err(ChatError::Forbidden(_))));

        let unknown = IdGenerator::new().chat_id();
        let missing = h.service.leave_chat("alice", &unknown).await;
        assert!(matches!(missing, Err(ChatError::NotFound(_))));
    }

    #[tokio::test]
    async fn delete_chat_hides_it_immediately_and_purges_later() {
        let h = ChatHarness::new(EVERYONE).await;
        let chat_id = h.service.create_chat("alice", &names(&["bob"])).await.unwrap();
        h.service
            .send_message(&chat_id, "bob", "bye", None)
            .await
            .unwrap();

        let outsider = h.service.delete_chat("carol", &chat_id).await;
        assert!(matches!(outsider, Err(ChatError::Forbidden(_))));

        h.service.delete_chat("bob", &chat_id).await.unwrap();
        let history = h.service.get_chat_history("alice", &chat_id, None, None).await;
        assert!(matches!(history, Err(ChatError::NotFound(_))));
        let twice = h.service.delete_chat("alice", &chat_id).await;
        assert!(matches!(twice, Err(ChatError::NotFound(_))));
        assert!(h.service.list_chats("alice").await.unwrap().is_empty());

        h.service.drain_purges().await;
        assert_eq!(h.store.item_count(&CHAT_DATA).await, 0);
        assert_eq!(h.store.item_count(&USER_CHAT).await, 0);
        assert_eq!(h.store.item_count(&CHAT_HISTORY).await, 0);
    }

    #[test]
    fn repository_failures_map_to_the_taxonomy() {
        let cases = [
            (Requirement::ChatExists, "NotFound"),
            (Requirement::MemberOfChat, "Forbidden"),
            (Requirement::MessageIdAvailable, "Conflict"),
            (Requirement::ChatIdAvailable, "Internal"),
        ];
        for (requirement, expected) in cases {
            let mapped = ChatError::from(RepositoryError::Requirement(requirement));
            let label = match mapped {
                ChatError::NotFound(_) => "NotFound",
                ChatError::Forbidden(_) => "Forbidden",
                ChatError::Conflict(_) => "Conflict",
                ChatError::Internal(_) => "Internal",
                _ => "other",
            };
            assert_eq!(label, expected, "{requirement}");
        }
    }
}
