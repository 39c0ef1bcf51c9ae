//! Contract of the sorted-key store the repositories are written against.
//!
//! Tables are described statically by [`TableSchema`]; items are JSON
//! objects whose key attributes are strings. A backend only has to honour the
//! operations below: conditional single-item writes, point reads, paginated
//! range queries (optionally against a secondary index), batched writes that
//! may leave items unprocessed, and all-or-nothing transactional writes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub type Item = serde_json::Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexSchema {
    pub name: &'static str,
    pub partition_attr: &'static str,
    pub sort_attr: Option<&'static str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableSchema {
    pub name: &'static str,
    pub partition_attr: &'static str,
    pub sort_attr: Option<&'static str>,
    pub indexes: &'static [IndexSchema],
}

impl TableSchema {
    pub fn index(&self, name: &str) -> Result<&'static IndexSchema, StoreError> {
        self.indexes
            .iter()
            .find(|index| index.name == name)
            .ok_or_else(|| StoreError::UnknownIndex {
                table: self.name,
                index: name.to_string(),
            })
    }

    /// Primary key of an item, read from its key attributes.
    pub fn key_of(&self, item: &Item) -> Result<ItemKey, StoreError> {
        let partition = string_attr(item, self.partition_attr).ok_or_else(|| {
            StoreError::MalformedItem {
                table: self.name,
                reason: format!("missing string attribute '{}'", self.partition_attr),
            }
        })?;
        let sort = match self.sort_attr {
            Some(attr) => Some(string_attr(item, attr).ok_or_else(|| {
                StoreError::MalformedItem {
                    table: self.name,
                    reason: format!("missing string attribute '{attr}'"),
                }
            })?),
            None => None,
        };
        Ok(ItemKey {
            partition: partition.to_string(),
            sort: sort.map(str::to_string),
        })
    }
}

pub fn string_attr<'a>(item: &'a Item, attr: &str) -> Option<&'a str> {
    item.get(attr).and_then(Value::as_str)
}

/// Full key of an item: partition value plus sort value for composite tables.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ItemKey {
    #[serde(rename = "p")]
    pub partition: String,
    #[serde(rename = "s", default, skip_serializing_if = "Option::is_none")]
    pub sort: Option<String>,
}

impl ItemKey {
    pub fn new(partition: impl Into<String>) -> Self {
        Self {
            partition: partition.into(),
            sort: None,
        }
    }

    pub fn with_sort(partition: impl Into<String>, sort: impl Into<String>) -> Self {
        Self {
            partition: partition.into(),
            sort: Some(sort.into()),
        }
    }

    pub fn sort_or_empty(&self) -> &str {
        self.sort.as_deref().unwrap_or("")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    NotExists,
    Exists,
    /// Item exists and `attribute` equals `value`.
    AttributeEquals {
        attribute: &'static str,
        value: Value,
    },
}

impl Condition {
    pub fn evaluate(&self, current: Option<&Item>) -> bool {
        match (self, current) {
            (Condition::NotExists, current) => current.is_none(),
            (Condition::Exists, current) => current.is_some(),
            (Condition::AttributeEquals { attribute, value }, Some(item)) => {
                item.get(*attribute) == Some(value)
            }
            (Condition::AttributeEquals { .. }, None) => false,
        }
    }
}

#[derive(Debug, Clone)]
pub enum WriteOp {
    Put {
        table: TableSchema,
        item: Item,
        condition: Option<Condition>,
    },
    Delete {
        table: TableSchema,
        key: ItemKey,
        condition: Option<Condition>,
    },
    /// Asserts a condition without writing.
    Check {
        table: TableSchema,
        key: ItemKey,
        condition: Condition,
    },
}

impl WriteOp {
    pub fn table(&self) -> &TableSchema {
        match self {
            WriteOp::Put { table, .. }
            | WriteOp::Delete { table, .. }
            | WriteOp::Check { table, .. } => table,
        }
    }

    pub fn key(&self) -> Result<ItemKey, StoreError> {
        match self {
            WriteOp::Put { table, item, .. } => table.key_of(item),
            WriteOp::Delete { key, .. } | WriteOp::Check { key, .. } => Ok(key.clone()),
        }
    }

    pub fn condition(&self) -> Option<&Condition> {
        match self {
            WriteOp::Put { condition, .. } | WriteOp::Delete { condition, .. } => {
                condition.as_ref()
            }
            WriteOp::Check { condition, .. } => Some(condition),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BatchRequest {
    Put(Item),
    Delete(ItemKey),
}

#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub table: TableSchema,
    pub partition: String,
    pub index: Option<&'static str>,
    pub limit: Option<usize>,
    pub exclusive_start: Option<ItemKey>,
    pub descending: bool,
}

impl QueryRequest {
    pub fn new(table: TableSchema, partition: impl Into<String>) -> Self {
        Self {
            table,
            partition: partition.into(),
            index: None,
            limit: None,
            exclusive_start: None,
            descending: false,
        }
    }

    pub fn on_index(mut self, index: &'static str) -> Self {
        self.index = Some(index);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn start_after(mut self, key: Option<ItemKey>) -> Self {
        self.exclusive_start = key;
        self
    }

    pub fn descending(mut self) -> Self {
        self.descending = true;
        self
    }

    /// Key of `item` in the key space being queried (primary or index).
    pub fn key_of(&self, item: &Item) -> Result<ItemKey, StoreError> {
        let Some(name) = self.index else {
            return self.table.key_of(item);
        };
        let index = self.table.index(name)?;
        Ok(match index.sort_attr {
            Some(attr) => ItemKey::with_sort(
                self.partition.clone(),
                string_attr(item, attr).unwrap_or_default(),
            ),
            None => ItemKey::new(self.partition.clone()),
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct QueryPage {
    pub items: Vec<Item>,
    /// Key of the last returned item, present only when more items follow.
    pub last_key: Option<ItemKey>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("request throttled by the store")]
    Throttled,
    #[error("condition check failed on table {table}")]
    ConditionFailed { table: &'static str },
    #[error("transaction canceled: operation {index} failed its condition")]
    TransactionCanceled { index: usize },
    #[error("unknown index {index} on table {table}")]
    UnknownIndex { table: &'static str, index: String },
    #[error("malformed item in table {table}: {reason}")]
    MalformedItem { table: &'static str, reason: String },
    #[error("store backend failure: {0}")]
    Backend(#[from] anyhow::Error),
}

impl StoreError {
    /// Whether the request was rejected without being applied and may be retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Throttled)
    }
}

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn put(
        &self,
        table: &TableSchema,
        item: Item,
        condition: Option<Condition>,
    ) -> Result<(), StoreError>;

    async fn delete(
        &self,
        table: &TableSchema,
        key: &ItemKey,
        condition: Option<Condition>,
    ) -> Result<(), StoreError>;

    async fn get(&self, table: &TableSchema, key: &ItemKey) -> Result<Option<Item>, StoreError>;

    async fn query(&self, request: &QueryRequest) -> Result<QueryPage, StoreError>;

    /// Applies what it can and hands back the requests left unprocessed.
    async fn batch_write(
        &self,
        table: &TableSchema,
        requests: Vec<BatchRequest>,
    ) -> Result<Vec<BatchRequest>, StoreError>;

    async fn transact_write(&self, ops: Vec<WriteOp>) -> Result<(), StoreError>;

    fn backend_name(&self) -> &'static str;
}
