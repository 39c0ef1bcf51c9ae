//! [`KeyValueStore`] on a single Postgres table (`kv_items`).
//!
//! Every logical table shares `kv_items`, keyed by
//! `(table_name, partition_key, sort_key)`; tables without a sort attribute
//! store an empty sort key. Conditional writes lock the target row with
//! `SELECT ... FOR UPDATE` inside a transaction.

use anyhow::anyhow;
use async_trait::async_trait;
use serde_json::Value;
use sqlx::{PgConnection, Postgres, QueryBuilder};

use crate::{
    store::{
        BatchRequest, Condition, Item, ItemKey, KeyValueStore, QueryPage, QueryRequest,
        StoreError, TableSchema, WriteOp,
    },
    StoragePool,
};

#[derive(Clone)]
pub struct PgStore {
    pool: StoragePool,
}

enum Mutation<'a> {
    Put(&'a Item),
    Delete,
    Check,
}

impl PgStore {
    pub fn new(pool: StoragePool) -> Self {
        Self { pool }
    }
}

fn backend(err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::PoolTimedOut => StoreError::Throttled,
        // serialization_failure and deadlock_detected roll the transaction back
        sqlx::Error::Database(db_err)
            if matches!(db_err.code(), Some(code) if code.as_ref() == "40001" || code.as_ref() == "40P01") =>
        {
            StoreError::Throttled
        }
        other => StoreError::Backend(anyhow!(other)),
    }
}

fn into_item(table: &TableSchema, value: Value) -> Result<Item, StoreError> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(StoreError::MalformedItem {
            table: table.name,
            reason: format!("stored item is not an object: {other}"),
        }),
    }
}

async fn lock_current(
    conn: &mut PgConnection,
    table: &TableSchema,
    key: &ItemKey,
) -> Result<Option<Item>, StoreError> {
    let value = sqlx::query_scalar::<_, Value>(
        r#"
        SELECT item
        FROM kv_items
        WHERE table_name = $1 AND partition_key = $2 AND sort_key = $3
        FOR UPDATE
        "#,
    )
    .bind(table.name)
    .bind(&key.partition)
    .bind(key.sort_or_empty())
    .fetch_optional(&mut *conn)
    .await
    .map_err(backend)?;
    value.map(|value| into_item(table, value)).transpose()
}

async fn insert_new(
    conn: &mut PgConnection,
    table: &TableSchema,
    key: &ItemKey,
    item: &Item,
) -> Result<bool, StoreError> {
    let result = sqlx::query(
        r#"
        INSERT INTO kv_items (table_name, partition_key, sort_key, item)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (table_name, partition_key, sort_key) DO NOTHING
        "#,
    )
    .bind(table.name)
    .bind(&key.partition)
    .bind(key.sort_or_empty())
    .bind(Value::Object(item.clone()))
    .execute(&mut *conn)
    .await
    .map_err(backend)?;
    Ok(result.rows_affected() == 1)
}

async fn upsert(
    conn: &mut PgConnection,
    table: &TableSchema,
    key: &ItemKey,
    item: &Item,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO kv_items (table_name, partition_key, sort_key, item)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (table_name, partition_key, sort_key)
        DO UPDATE SET item = EXCLUDED.item
        "#,
    )
    .bind(table.name)
    .bind(&key.partition)
    .bind(key.sort_or_empty())
    .bind(Value::Object(item.clone()))
    .execute(&mut *conn)
    .await
    .map_err(backend)?;
    Ok(())
}

async fn remove(conn: &mut PgConnection, table: &TableSchema, key: &ItemKey) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        DELETE FROM kv_items
        WHERE table_name = $1 AND partition_key = $2 AND sort_key = $3
        "#,
    )
    .bind(table.name)
    .bind(&key.partition)
    .bind(key.sort_or_empty())
    .execute(&mut *conn)
    .await
    .map_err(backend)?;
    Ok(())
}

/// Applies one mutation if its condition holds. Returns whether it held.
async fn apply_conditional(
    conn: &mut PgConnection,
    table: &TableSchema,
    key: &ItemKey,
    mutation: Mutation<'_>,
    condition: Option<&Condition>,
) -> Result<bool, StoreError> {
    if let (Mutation::Put(item), Some(Condition::NotExists)) = (&mutation, condition) {
        return insert_new(conn, table, key, item).await;
    }
    if let Some(condition) = condition {
        let current = lock_current(conn, table, key).await?;
        if !condition.evaluate(current.as_ref()) {
            return Ok(false);
        }
    }
    match mutation {
        Mutation::Put(item) => upsert(conn, table, key, item).await?,
        Mutation::Delete => remove(conn, table, key).await?,
        Mutation::Check => {}
    }
    Ok(true)
}

#[async_trait]
impl KeyValueStore for PgStore {
    async fn put(
        &self,
        table: &TableSchema,
        item: Item,
        condition: Option<Condition>,
    ) -> Result<(), StoreError> {
        let key = table.key_of(&item)?;
        let mut tx = self.pool.pool().begin().await.map_err(backend)?;
        let held =
            apply_conditional(&mut tx, table, &key, Mutation::Put(&item), condition.as_ref())
                .await?;
        if !held {
            return Err(StoreError::ConditionFailed { table: table.name });
        }
        tx.commit().await.map_err(backend)
    }

    async fn delete(
        &self,
        table: &TableSchema,
        key: &ItemKey,
        condition: Option<Condition>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.pool().begin().await.map_err(backend)?;
        let held = apply_conditional(&mut tx, table, key, Mutation::Delete, condition.as_ref())
            .await?;
        if !held {
            return Err(StoreError::ConditionFailed { table: table.name });
        }
        tx.commit().await.map_err(backend)
    }

    async fn get(&self, table: &TableSchema, key: &ItemKey) -> Result<Option<Item>, StoreError> {
        let value = sqlx::query_scalar::<_, Value>(
            r#"
            SELECT item
            FROM kv_items
            WHERE table_name = $1 AND partition_key = $2 AND sort_key = $3
            "#,
        )
        .bind(table.name)
        .bind(&key.partition)
        .bind(key.sort_or_empty())
        .fetch_optional(self.pool.pool())
        .await
        .map_err(backend)?;
        value.map(|value| into_item(table, value)).transpose()
    }

    async fn query(&self, request: &QueryRequest) -> Result<QueryPage, StoreError> {
        let table = &request.table;
        let mut builder: QueryBuilder<'_, Postgres> =
            QueryBuilder::new("SELECT item FROM kv_items WHERE table_name = ");
        builder.push_bind(table.name);

        let order_expr = match request.index {
            None => {
                builder
                    .push(" AND partition_key = ")
                    .push_bind(request.partition.clone());
                "sort_key COLLATE \"C\"".to_string()
            }
            Some(name) => {
                let index = table.index(name)?;
                builder
                    .push(" AND item->>")
                    .push_bind(index.partition_attr)
                    .push(" = ")
                    .push_bind(request.partition.clone());
                match index.sort_attr {
                    Some(attr) => format!("COALESCE(item->>'{attr}', '') COLLATE \"C\""),
                    None => "''".to_string(),
                }
            }
        };

        if let Some(start) = &request.exclusive_start {
            let op = if request.descending { " < " } else { " > " };
            builder
                .push(" AND ")
                .push(&order_expr)
                .push(op)
                .push_bind(start.sort_or_empty().to_string());
        }

        builder
            .push(" ORDER BY ")
            .push(&order_expr)
            .push(if request.descending { " DESC" } else { " ASC" });
        if let Some(limit) = request.limit {
            // One extra row tells whether another page exists.
            builder
                .push(" LIMIT ")
                .push_bind(i64::try_from(limit.saturating_add(1)).unwrap_or(i64::MAX));
        }

        let values = builder
            .build_query_scalar::<Value>()
            .fetch_all(self.pool.pool())
            .await
            .map_err(backend)?;
        let mut items = values
            .into_iter()
            .map(|value| into_item(table, value))
            .collect::<Result<Vec<_>, _>>()?;

        let mut last_key = None;
        if let Some(limit) = request.limit {
            if items.len() > limit {
                items.truncate(limit);
                if let Some(last) = items.last() {
                    last_key = Some(request.key_of(last)?);
                }
            }
        }
        Ok(QueryPage { items, last_key })
    }

    async fn batch_write(
        &self,
        table: &TableSchema,
        requests: Vec<BatchRequest>,
    ) -> Result<Vec<BatchRequest>, StoreError> {
        let mut tx = self.pool.pool().begin().await.map_err(backend)?;
        for request in &requests {
            match request {
                BatchRequest::Put(item) => {
                    let key = table.key_of(item)?;
                    upsert(&mut tx, table, &key, item).await?;
                }
                BatchRequest::Delete(key) => remove(&mut tx, table, key).await?,
            }
        }
        tx.commit().await.map_err(backend)?;
        Ok(Vec::new())
    }

    async fn transact_write(&self, ops: Vec<WriteOp>) -> Result<(), StoreError> {
        let mut tx = self.pool.pool().begin().await.map_err(backend)?;
        for (index, op) in ops.iter().enumerate() {
            let key = op.key()?;
            let mutation = match op {
                WriteOp::Put { item, .. } => Mutation::Put(item),
                WriteOp::Delete { .. } => Mutation::Delete,
                WriteOp::Check { .. } => Mutation::Check,
            };
            let held = apply_conditional(&mut tx, op.table(), &key, mutation, op.condition())
                .await?;
            if !held {
                // dropping `tx` rolls everything back
                return Err(StoreError::TransactionCanceled { index });
            }
        }
        tx.commit().await.map_err(backend)
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        chat_history::{ChatHistoryRepository, CHAT_HISTORY},
        retry::RetryPolicy,
    };
    use harmony_core::{ChatMessage, IdGenerator};
    use sqlx::{migrate::Migrator, postgres::PgPoolOptions};
    use std::{env, sync::Arc};

    static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

    async fn test_store() -> Option<PgStore> {
        let Ok(url) = env::var("HARMONY_TEST_DATABASE_URL") else {
            eprintln!("skipping postgres store test: set HARMONY_TEST_DATABASE_URL");
            return None;
        };
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect(&url)
            .await
            .expect("connect to test database");
        MIGRATOR.run(&pool).await.expect("apply migrations");
        Some(PgStore::new(StoragePool::new(pool)))
    }

    #[tokio::test]
    async fn conditional_put_and_paged_history_round_trip() {
        let Some(store) = test_store().await else {
            return;
        };
        let store = Arc::new(store);
        let history = ChatHistoryRepository::new(store.clone(), RetryPolicy::default(), 25);
        let ids = IdGenerator::new();
        let chat_id = ids.chat_id();

        let mut sent = Vec::new();
        for n in 0..3 {
            let message = ChatMessage::new(chat_id, ids.message_id(), "alice", format!("m{n}"), None);
            history.create_message(&message).await.unwrap();
            sent.push(message);
        }
        let err = store
            .put(
                &CHAT_HISTORY,
                crate::repository::to_item(&CHAT_HISTORY, &sent[0]).unwrap(),
                Some(Condition::NotExists),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ConditionFailed { .. }));

        let first = history.page(&chat_id, 2, None).await.unwrap();
        assert_eq!(first.messages, vec![sent[2].clone(), sent[1].clone()]);
        let second = history
            .page(&chat_id, 2, first.next_cursor.as_deref())
            .await
            .unwrap();
        assert_eq!(second.messages, vec![sent[0].clone()]);
        assert!(second.next_cursor.is_none());

        assert_eq!(history.purge_chat(&chat_id).await.unwrap(), 3);
    }
}
