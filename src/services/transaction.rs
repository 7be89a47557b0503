use std::future::Future;

use crate::error::{KernelError, Result};
use crate::models::StatementKind;

/// Local transaction control of the session connections
#[async_trait::async_trait]
pub trait TransactionCollaborator: Send + Sync {
    async fn begin(&self) -> anyhow::Result<()>;

    async fn commit(&self) -> anyhow::Result<()>;

    async fn rollback(&self) -> anyhow::Result<()>;

    /// Whether the caller already manages a transaction
    fn is_in_transaction(&self) -> bool;
}

/// Wraps multi-target writes in an implicit begin / commit
pub struct TransactionCoordinator {
    implicit_commit: bool,
}

impl TransactionCoordinator {
    pub fn new(implicit_commit: bool) -> Self {
        Self { implicit_commit }
    }

    /// A write that fans out to more than one physical data source outside a
    /// caller-managed transaction. Several units on one data source do not
    /// count twice.
    pub fn needs_implicit_transaction(
        &self,
        kind: StatementKind,
        data_sources: &[&str],
        collaborator: &dyn TransactionCollaborator,
    ) -> bool {
        if !self.implicit_commit || !kind.is_write() || collaborator.is_in_transaction() {
            return false;
        }
        let mut distinct: Vec<&str> = Vec::with_capacity(data_sources.len());
        for data_source in data_sources {
            if !distinct.contains(data_source) {
                distinct.push(data_source);
            }
        }
        distinct.len() > 1
    }

    /// Run `work` inside begin / commit. Any error rolls back before it is
    /// returned; a failing rollback is logged and the original error wins.
    pub async fn run_in_transaction<T, F>(&self, collaborator: &dyn TransactionCollaborator, work: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        collaborator
            .begin()
            .await
            .map_err(|e| KernelError::Transaction(format!("begin failed: {}", e)))?;
        tracing::debug!("Implicit transaction started");

        let result = match work.await {
            Ok(value) => collaborator
                .commit()
                .await
                .map(|_| value)
                .map_err(|e| KernelError::Transaction(format!("commit failed: {}", e))),
            Err(err) => Err(err),
        };

        match result {
            Ok(value) => {
                tracing::debug!("Implicit transaction committed");
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = collaborator.rollback().await {
                    tracing::warn!(
                        "Rollback after failed statement also failed: {} (original error: {})",
                        rollback_err,
                        err
                    );
                } else {
                    tracing::debug!("Implicit transaction rolled back: {}", err);
                }
                Err(err)
            }
        }
    }
}
