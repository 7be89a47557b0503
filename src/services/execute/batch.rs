use std::sync::Arc;

use super::connection::{ConnectionManager, StorageExecutor};
use super::engine::{ExecutionEngine, ExecutorCallback};
use super::prepare::ExecutionPreparer;
use crate::error::Result;
use crate::models::{ExecutionUnit, ReportContext, SqlUnit, UpdateResult, Value};

/// One distinct `(data source, SQL)` pair and the parameter sets of every
/// batch entry that routed to it
#[derive(Debug, Clone, PartialEq)]
pub struct BatchExecutionUnit {
    pub data_source: String,
    pub sql: String,
    /// `(batch index, parameters)` in add order
    pub parameter_sets: Vec<(usize, Vec<Value>)>,
}

/// Accumulates execution units across `add_batch` calls
#[derive(Debug, Default)]
pub struct BatchExecutor {
    units: Vec<BatchExecutionUnit>,
    batch_count: usize,
}

impl BatchExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the units of one batch entry; returns its batch index
    pub fn add(&mut self, units: Vec<ExecutionUnit>) -> usize {
        let batch_index = self.batch_count;
        for unit in units {
            let ExecutionUnit { data_source, sql_unit } = unit;
            match self
                .units
                .iter_mut()
                .find(|u| u.data_source == data_source && u.sql == sql_unit.sql)
            {
                Some(existing) => existing.parameter_sets.push((batch_index, sql_unit.parameters)),
                None => self.units.push(BatchExecutionUnit {
                    data_source,
                    sql: sql_unit.sql,
                    parameter_sets: vec![(batch_index, sql_unit.parameters)],
                }),
            }
        }
        self.batch_count += 1;
        batch_index
    }

    pub fn batch_count(&self) -> usize {
        self.batch_count
    }

    pub fn units(&self) -> &[BatchExecutionUnit] {
        &self.units
    }

    pub fn is_empty(&self) -> bool {
        self.batch_count == 0
    }

    pub fn clear(&mut self) {
        self.units.clear();
        self.batch_count = 0;
    }

    /// Run every accumulated parameter set and return one update count per
    /// batch entry. Counts of all units are summed when `accumulate` is set,
    /// otherwise the first unit's count is reported. The batch is cleared
    /// whether or not execution succeeds.
    pub async fn execute<M, E>(
        &mut self,
        preparer: &ExecutionPreparer,
        engine: &ExecutionEngine,
        manager: Arc<M>,
        executor: Arc<E>,
        report: ReportContext,
        accumulate: bool,
    ) -> Result<Vec<u64>>
    where
        M: ConnectionManager,
        E: StorageExecutor<M::Connection>,
    {
        let units = std::mem::take(&mut self.units);
        let batch_count = std::mem::replace(&mut self.batch_count, 0);
        if batch_count == 0 {
            return Ok(Vec::new());
        }

        tracing::debug!(
            "Executing batch of {} entries over {} distinct units",
            batch_count,
            units.len()
        );

        let parameter_sets: Arc<Vec<Vec<(usize, Vec<Value>)>>> =
            Arc::new(units.iter().map(|u| u.parameter_sets.clone()).collect());
        // Prepared units are distinct, so each is matched back to its
        // parameter sets by value
        let execution_units: Vec<ExecutionUnit> = units
            .into_iter()
            .map(|u| ExecutionUnit::new(u.data_source, SqlUnit::new(u.sql, Vec::new())))
            .collect();
        let positions: Arc<Vec<ExecutionUnit>> = Arc::new(execution_units.clone());

        let context = preparer.prepare(execution_units, manager.as_ref(), report).await?;

        let callback: ExecutorCallback<M::Connection, Vec<(usize, u64)>> =
            ExecutorCallback::new(move |connection, unit, mode| {
                let executor = executor.clone();
                let parameter_sets = parameter_sets.clone();
                let positions = positions.clone();
                Box::pin(async move {
                    let position = positions
                        .iter()
                        .position(|u| u == unit)
                        .ok_or_else(|| anyhow::anyhow!("batch unit on {} is not registered", unit.data_source))?;
                    let mut counts = Vec::with_capacity(parameter_sets[position].len());
                    for (batch_index, parameters) in &parameter_sets[position] {
                        let bound = ExecutionUnit::new(
                            unit.data_source.clone(),
                            SqlUnit::new(unit.sql_unit.sql.clone(), parameters.clone()),
                        );
                        let result: UpdateResult = executor.update(connection, &bound, mode).await?;
                        counts.push((*batch_index, result.update_count));
                    }
                    Ok::<_, anyhow::Error>(counts)
                })
            });

        let per_unit = engine.execute(context, manager, callback).await?;

        let mut counts: Vec<Option<u64>> = vec![None; batch_count];
        for unit_counts in per_unit {
            for (batch_index, count) in unit_counts {
                if let Some(slot) = counts.get_mut(batch_index) {
                    *slot = match (*slot, accumulate) {
                        (Some(total), true) => Some(total + count),
                        (Some(first), false) => Some(first),
                        (None, _) => Some(count),
                    };
                }
            }
        }
        Ok(counts.into_iter().map(|c| c.unwrap_or(0)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FailurePolicy;
    use crate::services::execute::fixtures::{MockConnectionManager, ScriptedStorageExecutor};
    use std::time::Duration;

    fn unit(ds: &str, sql: &str, id: i64) -> ExecutionUnit {
        ExecutionUnit::new(ds, SqlUnit::new(sql, vec![Value::Int(id)]))
    }

    #[test]
    fn test_add_merges_equal_units() {
        let mut batch = BatchExecutor::new();
        batch.add(vec![unit("ds_0", "INSERT INTO t_order_0 VALUES ($1)", 1)]);
        batch.add(vec![unit("ds_1", "INSERT INTO t_order_1 VALUES ($1)", 2)]);
        batch.add(vec![unit("ds_0", "INSERT INTO t_order_0 VALUES ($1)", 3)]);

        assert_eq!(batch.batch_count(), 3);
        assert_eq!(batch.units().len(), 2);
        assert_eq!(
            batch.units()[0].parameter_sets,
            vec![(0, vec![Value::Int(1)]), (2, vec![Value::Int(3)])]
        );
    }

    #[tokio::test]
    async fn test_execute_returns_count_per_entry() {
        let manager = Arc::new(MockConnectionManager::new());
        let executor = Arc::new(
            ScriptedStorageExecutor::new()
                .with_update_count("ds_0", 1)
                .with_update_count("ds_1", 2),
        );
        let preparer = ExecutionPreparer::new(1, Duration::from_secs(1));
        let engine = ExecutionEngine::new(2, FailurePolicy::FailFast);

        let mut batch = BatchExecutor::new();
        batch.add(vec![unit("ds_0", "INSERT INTO t VALUES ($1)", 1)]);
        // broadcast-style entry hitting both data sources
        batch.add(vec![
            unit("ds_0", "INSERT INTO t VALUES ($1)", 2),
            unit("ds_1", "INSERT INTO t VALUES ($1)", 2),
        ]);

        let counts = batch
            .execute(
                &preparer,
                &engine,
                manager.clone(),
                executor.clone(),
                ReportContext::new("logic_db"),
                true,
            )
            .await
            .unwrap();
        assert_eq!(counts, vec![1, 3]);
        assert_eq!(executor.executed_units().len(), 3);
        assert!(batch.is_empty());
        assert_eq!(manager.released(), manager.acquired());
    }

    #[tokio::test]
    async fn test_failed_batch_is_cleared() {
        let manager = Arc::new(MockConnectionManager::new());
        let executor = Arc::new(ScriptedStorageExecutor::new().failing_on("ds_0"));
        let preparer = ExecutionPreparer::new(1, Duration::from_secs(1));
        let engine = ExecutionEngine::new(1, FailurePolicy::FailFast);

        let mut batch = BatchExecutor::new();
        batch.add(vec![unit("ds_0", "DELETE FROM t WHERE id = $1", 1)]);
        let result = batch
            .execute(&preparer, &engine, manager, executor, ReportContext::new("logic_db"), false)
            .await;
        assert!(result.is_err());
        assert!(batch.is_empty());
        assert!(batch.units().is_empty());
    }

    #[tokio::test]
    async fn test_empty_batch_returns_no_counts() {
        let mut batch = BatchExecutor::new();
        let counts = batch
            .execute(
                &ExecutionPreparer::new(1, Duration::from_secs(1)),
                &ExecutionEngine::new(1, FailurePolicy::FailFast),
                Arc::new(MockConnectionManager::new()),
                Arc::new(ScriptedStorageExecutor::new()),
                ReportContext::new("logic_db"),
                true,
            )
            .await
            .unwrap();
        assert!(counts.is_empty());
    }
}
