use futures::future::{join_all, BoxFuture};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;

use super::connection::{ConnectionManager, StorageExecutor};
use crate::config::FailurePolicy;
use crate::error::{KernelError, Result};
use crate::models::{
    ConnectionMode, ExecuteResult, ExecutionGroup, ExecutionGroupContext, ExecutionUnit, QueryResult,
    ReportContext, UpdateResult,
};

type CallbackFn<C, T> = dyn for<'a> Fn(&'a mut C, &'a ExecutionUnit, ConnectionMode) -> BoxFuture<'a, anyhow::Result<T>>
    + Send
    + Sync;

/// Per-unit execution closure; the engine itself does not know statement kinds
pub struct ExecutorCallback<C, T> {
    inner: Arc<CallbackFn<C, T>>,
}

impl<C, T> Clone for ExecutorCallback<C, T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: Send + 'static, T: Send + 'static> ExecutorCallback<C, T> {
    pub fn new<F>(f: F) -> Self
    where
        F: for<'a> Fn(&'a mut C, &'a ExecutionUnit, ConnectionMode) -> BoxFuture<'a, anyhow::Result<T>>
            + Send
            + Sync
            + 'static,
    {
        Self { inner: Arc::new(f) }
    }

    pub fn call<'a>(
        &self,
        connection: &'a mut C,
        unit: &'a ExecutionUnit,
        mode: ConnectionMode,
    ) -> BoxFuture<'a, anyhow::Result<T>> {
        (self.inner)(connection, unit, mode)
    }
}

impl<C: Send + 'static> ExecutorCallback<C, Box<dyn QueryResult>> {
    pub fn query<E: StorageExecutor<C>>(executor: Arc<E>) -> Self {
        Self::new(move |connection, unit, mode| {
            let executor = executor.clone();
            Box::pin(async move { executor.query(connection, unit, mode).await })
        })
    }
}

impl<C: Send + 'static> ExecutorCallback<C, UpdateResult> {
    pub fn update<E: StorageExecutor<C>>(executor: Arc<E>) -> Self {
        Self::new(move |connection, unit, mode| {
            let executor = executor.clone();
            Box::pin(async move { executor.update(connection, unit, mode).await })
        })
    }
}

impl<C: Send + 'static> ExecutorCallback<C, ExecuteResult> {
    /// Query or update depending on the statement
    pub fn execute<E: StorageExecutor<C>>(executor: Arc<E>, is_query: bool) -> Self {
        Self::new(move |connection, unit, mode| {
            let executor = executor.clone();
            Box::pin(async move {
                let result = if is_query {
                    ExecuteResult::Query(executor.query(connection, unit, mode).await?)
                } else {
                    ExecuteResult::Update(executor.update(connection, unit, mode).await?)
                };
                Ok::<_, anyhow::Error>(result)
            })
        })
    }
}

struct GroupOutcome<T> {
    results: Vec<(usize, T)>,
    errors: Vec<KernelError>,
    skipped: bool,
}

impl<T> GroupOutcome<T> {
    fn skipped() -> Self {
        Self {
            results: Vec::new(),
            errors: Vec::new(),
            skipped: true,
        }
    }
}

/// Runs execution groups on a bounded worker pool
pub struct ExecutionEngine {
    workers: Arc<Semaphore>,
    worker_pool_size: usize,
    failure_policy: FailurePolicy,
}

impl ExecutionEngine {
    pub fn new(worker_pool_size: usize, failure_policy: FailurePolicy) -> Self {
        let worker_pool_size = worker_pool_size.max(1);
        Self {
            workers: Arc::new(Semaphore::new(worker_pool_size)),
            worker_pool_size,
            failure_policy,
        }
    }

    pub fn worker_pool_size(&self) -> usize {
        self.worker_pool_size
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy
    }

    pub async fn execute_query<M: ConnectionManager>(
        &self,
        context: ExecutionGroupContext<M::Connection>,
        manager: Arc<M>,
        callback: ExecutorCallback<M::Connection, Box<dyn QueryResult>>,
    ) -> Result<Vec<Box<dyn QueryResult>>> {
        self.execute(context, manager, callback).await
    }

    pub async fn execute_update<M: ConnectionManager>(
        &self,
        context: ExecutionGroupContext<M::Connection>,
        manager: Arc<M>,
        callback: ExecutorCallback<M::Connection, UpdateResult>,
    ) -> Result<Vec<UpdateResult>> {
        self.execute(context, manager, callback).await
    }

    /// Run every group and return per-unit results in submission order.
    /// Every connection of the context is released before this returns.
    pub async fn execute<M: ConnectionManager, T: Send + 'static>(
        &self,
        context: ExecutionGroupContext<M::Connection>,
        manager: Arc<M>,
        callback: ExecutorCallback<M::Connection, T>,
    ) -> Result<Vec<T>> {
        let ExecutionGroupContext { groups, report } = context;
        let unit_count: usize = groups.iter().map(|g| g.len()).sum();
        let group_count = groups.len();
        let fail_fast = self.failure_policy == FailurePolicy::FailFast;

        let cancelled = Arc::new(AtomicBool::new(false));
        let first_failure = Arc::new(AtomicUsize::new(usize::MAX));

        tracing::debug!(
            "Executing {} units in {} groups (execution {})",
            unit_count,
            group_count,
            report.execution_id
        );

        let mut handles = Vec::with_capacity(group_count);
        for (group_index, group) in groups.into_iter().enumerate() {
            // Excess groups queue here until a worker is free
            let permit = match self.workers.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    manager.release(group.connection).await;
                    cancelled.store(true, Ordering::SeqCst);
                    handles.push(None);
                    continue;
                }
            };
            if fail_fast && cancelled.load(Ordering::SeqCst) {
                drop(permit);
                manager.release(group.connection).await;
                handles.push(None);
                continue;
            }

            let manager = manager.clone();
            let callback = callback.clone();
            let report = report.clone();
            let cancelled = cancelled.clone();
            let first_failure = first_failure.clone();
            handles.push(Some(tokio::spawn(async move {
                let outcome = run_group(
                    group_index,
                    group,
                    manager,
                    callback,
                    report,
                    cancelled,
                    first_failure,
                    fail_fast,
                )
                .await;
                drop(permit);
                outcome
            })));
        }

        let outcomes = join_all(handles.into_iter().map(|handle| async move {
            match handle {
                Some(handle) => handle
                    .await
                    .map_err(|e| KernelError::Internal(format!("execution task failed: {}", e))),
                None => Ok(GroupOutcome::skipped()),
            }
        }))
        .await;

        let mut slots: Vec<Option<T>> = (0..unit_count).map(|_| None).collect();
        let mut errors: Vec<(usize, KernelError)> = Vec::new();
        for (group_index, outcome) in outcomes.into_iter().enumerate() {
            match outcome {
                Ok(outcome) => {
                    if outcome.skipped {
                        continue;
                    }
                    for (index, result) in outcome.results {
                        if let Some(slot) = slots.get_mut(index) {
                            *slot = Some(result);
                        }
                    }
                    errors.extend(outcome.errors.into_iter().map(|e| (group_index, e)));
                }
                Err(e) => errors.push((group_index, e)),
            }
        }

        if !errors.is_empty() {
            if fail_fast {
                let first = first_failure.load(Ordering::SeqCst);
                let position = errors.iter().position(|(group, _)| *group == first).unwrap_or(0);
                let (_, error) = errors.swap_remove(position);
                tracing::debug!("Execution {} failed fast: {}", report.execution_id, error);
                return Err(error);
            }
            let errors: Vec<KernelError> = errors.into_iter().map(|(_, e)| e).collect();
            tracing::debug!("Execution {} collected {} failures", report.execution_id, errors.len());
            return Err(KernelError::AggregateExecution(errors));
        }

        slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.ok_or_else(|| KernelError::Internal(format!("execution unit {} produced no result", index)))
            })
            .collect()
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_group<M: ConnectionManager, T: Send + 'static>(
    group_index: usize,
    group: ExecutionGroup<M::Connection>,
    manager: Arc<M>,
    callback: ExecutorCallback<M::Connection, T>,
    report: ReportContext,
    cancelled: Arc<AtomicBool>,
    first_failure: Arc<AtomicUsize>,
    fail_fast: bool,
) -> GroupOutcome<T> {
    let ExecutionGroup {
        data_source,
        mut connection,
        connection_mode,
        units,
        unit_indices,
    } = group;

    let mut outcome = GroupOutcome {
        results: Vec::with_capacity(units.len()),
        errors: Vec::new(),
        skipped: false,
    };

    for (unit, index) in units.iter().zip(unit_indices) {
        if fail_fast && cancelled.load(Ordering::SeqCst) {
            break;
        }
        if report.is_expired() {
            let timeout_ms = report.timeout().map(|t| t.as_millis() as u64).unwrap_or_default();
            outcome.errors.push(KernelError::ExecutionTimeout {
                target: data_source.clone(),
                timeout_ms,
            });
            record_failure(group_index, &cancelled, &first_failure);
            if fail_fast {
                break;
            }
            continue;
        }

        match callback.call(&mut connection, unit, connection_mode).await {
            Ok(result) => outcome.results.push((index, result)),
            Err(source) => {
                tracing::debug!("Unit on {} failed: {}", data_source, source);
                outcome.errors.push(KernelError::UnitExecution {
                    target: data_source.clone(),
                    source,
                });
                record_failure(group_index, &cancelled, &first_failure);
                if fail_fast {
                    break;
                }
            }
        }
    }

    manager.release(connection).await;
    outcome
}

fn record_failure(group_index: usize, cancelled: &AtomicBool, first_failure: &AtomicUsize) {
    let _ = first_failure.compare_exchange(usize::MAX, group_index, Ordering::SeqCst, Ordering::SeqCst);
    cancelled.store(true, Ordering::SeqCst);
}
