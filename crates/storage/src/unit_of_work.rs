use std::sync::Arc;

use tracing::debug;

use crate::{
    repository::{Requirement, RepositoryError},
    retry::{retry_transient, RetryPolicy},
    store::{KeyValueStore, StoreError, WriteOp},
};

/// Hands out [`UnitOfWork`]s bound to one store.
#[derive(Clone)]
pub struct UnitOfWorkFactory {
    store: Arc<dyn KeyValueStore>,
    policy: RetryPolicy,
}

impl UnitOfWorkFactory {
    pub fn new(store: Arc<dyn KeyValueStore>, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    pub fn begin(&self) -> UnitOfWork {
        UnitOfWork {
            store: self.store.clone(),
            policy: self.policy,
            staged: Vec::new(),
        }
    }
}

/// Writes staged across repositories and committed as one transaction.
///
/// Nothing reaches the store before [`UnitOfWork::commit`]; dropping an
/// uncommitted unit discards it.
pub struct UnitOfWork {
    store: Arc<dyn KeyValueStore>,
    policy: RetryPolicy,
    staged: Vec<(WriteOp, Option<Requirement>)>,
}

impl UnitOfWork {
    pub fn stage(&mut self, op: WriteOp, requirement: Option<Requirement>) {
        self.staged.push((op, requirement));
    }

    pub async fn commit(self) -> Result<(), RepositoryError> {
        if self.staged.is_empty() {
            return Ok(());
        }
        let (ops, requirements): (Vec<_>, Vec<_>) = self.staged.into_iter().unzip();
        debug!(ops = ops.len(), "committing unit of work");

        let store = self.store.as_ref();
        let result = retry_transient(&self.policy, "transact_write", || {
            store.transact_write(ops.clone())
        })
        .await;

        match result {
            Ok(()) => Ok(()),
            Err(StoreError::TransactionCanceled { index }) => {
                match requirements.get(index).copied().flatten() {
                    Some(requirement) => Err(RepositoryError::Requirement(requirement)),
                    None => Err(StoreError::TransactionCanceled { index }.into()),
                }
            }
            Err(err) => Err(err.into()),
        }
    }
}
