// Collaborator seams of the execution layer
use crate::models::{ConnectionMode, ExecutionUnit, QueryResult, UpdateResult};

/// Supplies physical connections per data source
#[async_trait::async_trait]
pub trait ConnectionManager: Send + Sync + 'static {
    type Connection: Send + 'static;

    /// Borrow one connection to the data source
    async fn acquire_connection(&self, data_source: &str) -> anyhow::Result<Self::Connection>;

    /// Return a connection; called exactly once per acquired connection
    async fn release(&self, connection: Self::Connection);
}

/// Runs one execution unit on a physical connection
#[async_trait::async_trait]
pub trait StorageExecutor<C: Send>: Send + Sync + 'static {
    /// Execute a query. In `ConnectionStrictly` mode the returned result must
    /// not depend on the connection once this call returns.
    async fn query(
        &self,
        connection: &mut C,
        unit: &ExecutionUnit,
        mode: ConnectionMode,
    ) -> anyhow::Result<Box<dyn QueryResult>>;

    async fn update(
        &self,
        connection: &mut C,
        unit: &ExecutionUnit,
        mode: ConnectionMode,
    ) -> anyhow::Result<UpdateResult>;
}
