//! In-process [`KeyValueStore`] used by tests and single-node development.

use std::{
    collections::{BTreeMap, HashMap},
    sync::atomic::{AtomicUsize, Ordering},
};

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::store::{
    string_attr, BatchRequest, Condition, Item, ItemKey, KeyValueStore, QueryPage, QueryRequest,
    StoreError, TableSchema, WriteOp,
};

type Rows = BTreeMap<(String, String), Item>;

/// Sorted in-memory tables with optional fault injection.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<HashMap<&'static str, Rows>>,
    throttles: AtomicUsize,
    unprocessed: AtomicUsize,
    failing_transactions: AtomicUsize,
    writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `count` requests fail with [`StoreError::Throttled`].
    pub fn inject_throttles(&self, count: usize) {
        self.throttles.store(count, Ordering::SeqCst);
    }

    /// Hand back up to `count` batch requests as unprocessed, across calls.
    pub fn inject_unprocessed(&self, count: usize) {
        self.unprocessed.store(count, Ordering::SeqCst);
    }

    /// The next `count` transactions fail with a backend error.
    pub fn fail_next_transactions(&self, count: usize) {
        self.failing_transactions.store(count, Ordering::SeqCst);
    }

    /// Number of item writes applied so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub async fn item_count(&self, table: &TableSchema) -> usize {
        self.tables
            .read()
            .await
            .get(table.name)
            .map(BTreeMap::len)
            .unwrap_or_default()
    }

    fn check_throttle(&self) -> Result<(), StoreError> {
        if take_one(&self.throttles) {
            Err(StoreError::Throttled)
        } else {
            Ok(())
        }
    }

    fn row_key(key: &ItemKey) -> (String, String) {
        (key.partition.clone(), key.sort_or_empty().to_string())
    }

    fn apply(&self, rows: &mut Rows, key: &ItemKey, item: Option<Item>) {
        let row_key = Self::row_key(key);
        let changed = match item {
            Some(item) => {
                rows.insert(row_key, item);
                true
            }
            None => rows.remove(&row_key).is_some(),
        };
        if changed {
            self.writes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
        .is_ok()
}

fn check(
    table: &TableSchema,
    rows: &Rows,
    key: &ItemKey,
    condition: Option<&Condition>,
) -> Result<(), StoreError> {
    match condition {
        Some(condition) if !condition.evaluate(rows.get(&MemoryStore::row_key(key))) => {
            Err(StoreError::ConditionFailed { table: table.name })
        }
        _ => Ok(()),
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn put(
        &self,
        table: &TableSchema,
        item: Item,
        condition: Option<Condition>,
    ) -> Result<(), StoreError> {
        self.check_throttle()?;
        let key = table.key_of(&item)?;
        let mut tables = self.tables.write().await;
        let rows = tables.entry(table.name).or_default();
        check(table, rows, &key, condition.as_ref())?;
        self.apply(rows, &key, Some(item));
        Ok(())
    }

    async fn delete(
        &self,
        table: &TableSchema,
        key: &ItemKey,
        condition: Option<Condition>,
    ) -> Result<(), StoreError> {
        self.check_throttle()?;
        let mut tables = self.tables.write().await;
        let rows = tables.entry(table.name).or_default();
        check(table, rows, key, condition.as_ref())?;
        self.apply(rows, key, None);
        Ok(())
    }

    async fn get(&self, table: &TableSchema, key: &ItemKey) -> Result<Option<Item>, StoreError> {
        self.check_throttle()?;
        let tables = self.tables.read().await;
        Ok(tables
            .get(table.name)
            .and_then(|rows| rows.get(&Self::row_key(key)))
            .cloned())
    }

    async fn query(&self, request: &QueryRequest) -> Result<QueryPage, StoreError> {
        self.check_throttle()?;
        let table = &request.table;
        let tables = self.tables.read().await;
        let Some(rows) = tables.get(table.name) else {
            return Ok(QueryPage::default());
        };

        // (key in the queried key space, item)
        let mut matched: Vec<(ItemKey, &Item)> = match request.index {
            None => rows
                .range((request.partition.clone(), String::new())..)
                .take_while(|((partition, _), _)| *partition == request.partition)
                .map(|((partition, sort), item)| {
                    let key = match table.sort_attr {
                        Some(_) => ItemKey::with_sort(partition.clone(), sort.clone()),
                        None => ItemKey::new(partition.clone()),
                    };
                    (key, item)
                })
                .collect(),
            Some(name) => {
                let index = table.index(name)?;
                let mut hits: Vec<(ItemKey, &Item)> = rows
                    .values()
                    .filter(|item| {
                        string_attr(item, index.partition_attr) == Some(request.partition.as_str())
                    })
                    .map(|item| {
                        let key = match index.sort_attr {
                            Some(attr) => ItemKey::with_sort(
                                request.partition.clone(),
                                string_attr(item, attr).unwrap_or_default(),
                            ),
                            None => ItemKey::new(request.partition.clone()),
                        };
                        (key, item)
                    })
                    .collect();
                hits.sort_by(|(left, _), (right, _)| left.sort_or_empty().cmp(right.sort_or_empty()));
                hits
            }
        };

        if request.descending {
            matched.reverse();
        }
        if let Some(start) = &request.exclusive_start {
            let start = start.sort_or_empty();
            matched.retain(|(key, _)| {
                if request.descending {
                    key.sort_or_empty() < start
                } else {
                    key.sort_or_empty() > start
                }
            });
        }

        let mut last_key = None;
        if let Some(limit) = request.limit {
            if matched.len() > limit {
                matched.truncate(limit);
                last_key = matched.last().map(|(key, _)| key.clone());
            }
        }

        Ok(QueryPage {
            items: matched.into_iter().map(|(_, item)| item.clone()).collect(),
            last_key,
        })
    }

    async fn batch_write(
        &self,
        table: &TableSchema,
        mut requests: Vec<BatchRequest>,
    ) -> Result<Vec<BatchRequest>, StoreError> {
        self.check_throttle()?;
        let mut held_back = 0;
        while held_back < requests.len() && take_one(&self.unprocessed) {
            held_back += 1;
        }
        let unprocessed = requests.split_off(requests.len() - held_back);

        let mut tables = self.tables.write().await;
        let rows = tables.entry(table.name).or_default();
        for request in requests {
            match request {
                BatchRequest::Put(item) => {
                    let key = table.key_of(&item)?;
                    self.apply(rows, &key, Some(item));
                }
                BatchRequest::Delete(key) => self.apply(rows, &key, None),
            }
        }
        Ok(unprocessed)
    }

    async fn transact_write(&self, ops: Vec<WriteOp>) -> Result<(), StoreError> {
        self.check_throttle()?;
        if take_one(&self.failing_transactions) {
            return Err(StoreError::Backend(anyhow!("injected transaction failure")));
        }

        let mut tables = self.tables.write().await;
        let mut keys = Vec::with_capacity(ops.len());
        for (index, op) in ops.iter().enumerate() {
            let key = op.key()?;
            let rows = tables.entry(op.table().name).or_default();
            if check(op.table(), rows, &key, op.condition()).is_err() {
                return Err(StoreError::TransactionCanceled { index });
            }
            keys.push(key);
        }

        for (op, key) in ops.into_iter().zip(keys) {
            let rows = tables.entry(op.table().name).or_default();
            match op {
                WriteOp::Put { item, .. } => self.apply(rows, &key, Some(item)),
                WriteOp::Delete { .. } => self.apply(rows, &key, None),
                WriteOp::Check { .. } => {}
            }
        }
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
