//! Core domain types for the Harmony chat backend: sortable identifiers,
//! chat/membership/message records and the fan-out wire envelope.

pub mod ids;
pub mod messaging;

pub use ids::{ChatId, IdError, IdGenerator, MessageId};
pub use messaging::{
    channel_for, chat_from_channel, ChatMessage, ChatRecord, ChatState, FanoutEnvelope,
    Membership, KEEPALIVE_CHANNEL,
};
