use std::{future::Future, time::Duration};

use futures::future::try_join_all;
use tracing::warn;

use crate::{
    repository::RepositoryError,
    store::{BatchRequest, KeyValueStore, StoreError, TableSchema},
};

/// Doubling backoff between `base` and `cap`.
///
/// `max_retries` of `None` retries until the store accepts the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_retries: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            cap: Duration::from_secs(8),
            max_retries: Some(5),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (zero based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }

    pub fn allows(&self, retries_done: u32) -> bool {
        self.max_retries.map_or(true, |max| retries_done < max)
    }
}

/// Runs `op`, retrying throttled attempts according to `policy`.
pub async fn retry_transient<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &'static str,
    mut op: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut retries = 0;
    loop {
        match op().await {
            Err(err) if err.is_transient() && policy.allows(retries) => {
                let delay = policy.delay_for(retries);
                warn!(operation, retries, ?delay, "store throttled request; backing off");
                tokio::time::sleep(delay).await;
                retries += 1;
            }
            other => return other,
        }
    }
}

/// Writes `requests` in chunks of at most `chunk_size`, chunks in parallel,
/// re-submitting whatever the store leaves unprocessed.
pub async fn write_batch(
    store: &dyn KeyValueStore,
    table: &TableSchema,
    requests: Vec<BatchRequest>,
    chunk_size: usize,
    policy: &RetryPolicy,
) -> Result<(), RepositoryError> {
    if requests.is_empty() {
        return Ok(());
    }
    let chunks = requests
        .chunks(chunk_size.max(1))
        .map(|chunk| write_chunk(store, table, chunk.to_vec(), policy));
    try_join_all(chunks).await?;
    Ok(())
}

async fn write_chunk(
    store: &dyn KeyValueStore,
    table: &TableSchema,
    chunk: Vec<BatchRequest>,
    policy: &RetryPolicy,
) -> Result<(), RepositoryError> {
    let mut pending = chunk;
    let mut retries = 0;
    loop {
        let submitted = pending.clone();
        pending = retry_transient(policy, "batch_write", || {
            store.batch_write(table, submitted.clone())
        })
        .await?;

        if pending.is_empty() {
            return Ok(());
        }
        if !policy.allows(retries) {
            return Err(RepositoryError::BatchExhausted {
                table: table.name,
                remaining: pending.len(),
                retries,
            });
        }
        let delay = policy.delay_for(retries);
        warn!(
            table = table.name,
            remaining = pending.len(),
            retries,
            ?delay,
            "batch write left items unprocessed; retrying"
        );
        tokio::time::sleep(delay).await;
        retries += 1;
    }
}
