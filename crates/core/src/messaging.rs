use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ChatId, MessageId};

/// Channel subscribed at connect time to force the bus connection open.
pub const KEEPALIVE_CHANNEL: &str = "system:dummy_keepalive";

const CHAT_CHANNEL_PREFIX: &str = "chat:";

/// Bus channel carrying the live messages of one chat.
pub fn channel_for(chat_id: &ChatId) -> String {
    format!("{CHAT_CHANNEL_PREFIX}{chat_id}")
}

pub fn chat_from_channel(channel: &str) -> Option<ChatId> {
    channel
        .strip_prefix(CHAT_CHANNEL_PREFIX)
        .and_then(|raw| raw.parse().ok())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChatState {
    #[serde(rename = "valid")]
    Valid,
    #[serde(rename = "deleted")]
    Tombstoned,
}

impl ChatState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatState::Valid => "valid",
            ChatState::Tombstoned => "deleted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRecord {
    pub chat_id: ChatId,
    pub created_at: DateTime<Utc>,
    pub state: ChatState,
}

impl ChatRecord {
    pub fn new(chat_id: ChatId) -> Self {
        Self {
            chat_id,
            created_at: chat_id.created_at(),
            state: ChatState::Valid,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.state == ChatState::Valid
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub user_id: String,
    pub chat_id: ChatId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub chat_id: ChatId,
    #[serde(rename = "ulid")]
    pub message_id: MessageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_uuid: Option<String>,
    #[serde(rename = "timestamp")]
    pub created_at: DateTime<Utc>,
    pub user_id: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(
        chat_id: ChatId,
        message_id: MessageId,
        user_id: impl Into<String>,
        content: impl Into<String>,
        client_uuid: Option<String>,
    ) -> Self {
        Self {
            chat_id,
            message_id,
            client_uuid,
            created_at: message_id.created_at(),
            user_id: user_id.into(),
            content: content.into(),
        }
    }
}

/// Payload published on a chat channel and relayed verbatim to viewers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FanoutEnvelope {
    Message(ChatMessage),
}

impl FanoutEnvelope {
    pub fn chat_id(&self) -> ChatId {
        match self {
            FanoutEnvelope::Message(message) => message.chat_id,
        }
    }

    pub fn to_payload(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::IdGenerator;
    use serde_json::Value;

    #[test]
    fn channel_names_round_trip_to_chat_ids() {
        let chat_id = IdGenerator::new().chat_id();
        let channel = channel_for(&chat_id);
        assert!(channel.starts_with("chat:"));
        assert_eq!(chat_from_channel(&channel), Some(chat_id));
        assert_eq!(chat_from_channel(KEEPALIVE_CHANNEL), None);
    }

    #[test]
    fn message_serializes_with_history_field_names() {
        let ids = IdGenerator::new();
        let message = ChatMessage::new(ids.chat_id(), ids.message_id(), "alice", "Hi", None);
        let value = serde_json::to_value(&message).unwrap();

        assert_eq!(value["ulid"], Value::String(message.message_id.to_string()));
        assert_eq!(value["user_id"], "alice");
        assert!(value.get("client_uuid").is_none());
        assert!(value["timestamp"].as_str().is_some());
    }

    #[test]
    fn envelope_is_tagged_and_parses_back() {
        let ids = IdGenerator::new();
        let message = ChatMessage::new(
            ids.chat_id(),
            ids.message_id(),
            "bob",
            "Hello back",
            Some("c-1".into()),
        );
        let envelope = FanoutEnvelope::Message(message.clone());
        let payload = envelope.to_payload().unwrap();

        let raw: Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(raw["type"], "message");
        assert_eq!(raw["content"], "Hello back");

        let parsed: FanoutEnvelope = serde_json::from_str(&payload).unwrap();
        assert_eq!(parsed.chat_id(), message.chat_id);
    }

    #[test]
    fn new_chat_record_is_valid_and_dated_by_its_id() {
        let chat_id = IdGenerator::new().chat_id();
        let record = ChatRecord::new(chat_id);
        assert!(record.is_valid());
        assert_eq!(record.created_at, chat_id.created_at());
        assert_eq!(
            serde_json::to_value(ChatState::Tombstoned).unwrap(),
            Value::String("deleted".into())
        );
    }
}
