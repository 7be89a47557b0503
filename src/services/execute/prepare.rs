use std::time::Duration;

use super::connection::ConnectionManager;
use crate::error::{KernelError, Result};
use crate::models::{ConnectionMode, ExecutionGroup, ExecutionGroupContext, ExecutionUnit, ReportContext};

/// Groups execution units by the connection that will run them
pub struct ExecutionPreparer {
    max_connections_per_query: usize,
    acquire_timeout: Duration,
}

impl ExecutionPreparer {
    pub fn new(max_connections_per_query: usize, acquire_timeout: Duration) -> Self {
        Self {
            max_connections_per_query: max_connections_per_query.max(1),
            acquire_timeout,
        }
    }

    /// Connection budget and mode for `unit_count` units on one data source
    pub fn plan(&self, unit_count: usize) -> (usize, ConnectionMode) {
        if self.max_connections_per_query >= unit_count {
            (unit_count, ConnectionMode::MemoryStrictly)
        } else {
            (self.max_connections_per_query, ConnectionMode::ConnectionStrictly)
        }
    }

    /// Acquire connections and distribute the units of each data source
    /// round-robin over them. On failure every connection already acquired
    /// is released again.
    pub async fn prepare<M: ConnectionManager>(
        &self,
        units: Vec<ExecutionUnit>,
        manager: &M,
        report: ReportContext,
    ) -> Result<ExecutionGroupContext<M::Connection>> {
        // Units per data source, data sources in order of first appearance
        let mut by_data_source: Vec<(String, Vec<(usize, ExecutionUnit)>)> = Vec::new();
        for (index, unit) in units.into_iter().enumerate() {
            match by_data_source.iter_mut().find(|(ds, _)| *ds == unit.data_source) {
                Some((_, entries)) => entries.push((index, unit)),
                None => by_data_source.push((unit.data_source.clone(), vec![(index, unit)])),
            }
        }

        let mut groups: Vec<ExecutionGroup<M::Connection>> = Vec::new();
        for (data_source, entries) in by_data_source {
            let (connection_count, connection_mode) = self.plan(entries.len());

            let mut connections = Vec::with_capacity(connection_count);
            for _ in 0..connection_count {
                match self.acquire(manager, &data_source).await {
                    Ok(connection) => connections.push(connection),
                    Err(err) => {
                        for connection in connections {
                            manager.release(connection).await;
                        }
                        for group in groups {
                            manager.release(group.connection).await;
                        }
                        return Err(err);
                    }
                }
            }

            let mut buckets: Vec<(Vec<ExecutionUnit>, Vec<usize>)> =
                (0..connection_count).map(|_| (Vec::new(), Vec::new())).collect();
            for (position, (index, unit)) in entries.into_iter().enumerate() {
                let bucket = &mut buckets[position % connection_count];
                bucket.0.push(unit);
                bucket.1.push(index);
            }

            tracing::debug!(
                "Prepared {} connections on {} in {:?} mode",
                connection_count,
                data_source,
                connection_mode
            );

            for (connection, (units, unit_indices)) in connections.into_iter().zip(buckets) {
                groups.push(ExecutionGroup {
                    data_source: data_source.clone(),
                    connection,
                    connection_mode,
                    units,
                    unit_indices,
                });
            }
        }

        Ok(ExecutionGroupContext { groups, report })
    }

    async fn acquire<M: ConnectionManager>(&self, manager: &M, data_source: &str) -> Result<M::Connection> {
        match tokio::time::timeout(self.acquire_timeout, manager.acquire_connection(data_source)).await {
            Ok(Ok(connection)) => Ok(connection),
            Ok(Err(e)) => Err(KernelError::ConnectionAcquisition {
                data_source: data_source.to_string(),
                message: e.to_string(),
            }),
            Err(_) => Err(KernelError::ConnectionAcquisition {
                data_source: data_source.to_string(),
                message: format!(
                    "no connection available within {} ms",
                    self.acquire_timeout.as_millis()
                ),
            }),
        }
    }
}
