use std::fmt;

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::store::{Item, StoreError, TableSchema};

/// Precondition attached to a staged write; reported when that write is the
/// one that cancels a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Requirement {
    ChatExists,
    ChatIdAvailable,
    MemberOfChat,
    MessageIdAvailable,
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Requirement::ChatExists => "chat exists",
            Requirement::ChatIdAvailable => "chat id available",
            Requirement::MemberOfChat => "member of chat",
            Requirement::MessageIdAvailable => "message id available",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("requirement not met: {0}")]
    Requirement(Requirement),
    #[error("invalid pagination cursor")]
    InvalidCursor,
    #[error("batch write to {table} left {remaining} items unprocessed after {retries} retries")]
    BatchExhausted {
        table: &'static str,
        remaining: usize,
        retries: u32,
    },
    #[error("failed to decode {table} item: {source}")]
    Decode {
        table: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RepositoryError {
    pub fn requirement(&self) -> Option<Requirement> {
        match self {
            RepositoryError::Requirement(requirement) => Some(*requirement),
            _ => None,
        }
    }
}

pub(crate) fn to_item<T: Serialize>(table: &TableSchema, value: &T) -> Result<Item, RepositoryError> {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(StoreError::MalformedItem {
            table: table.name,
            reason: "record did not serialize to an object".into(),
        }
        .into()),
        Err(source) => Err(RepositoryError::Decode {
            table: table.name,
            source,
        }),
    }
}

pub(crate) fn from_item<T: DeserializeOwned>(
    table: &TableSchema,
    item: Item,
) -> Result<T, RepositoryError> {
    serde_json::from_value(Value::Object(item)).map_err(|source| RepositoryError::Decode {
        table: table.name,
        source,
    })
}
