pub mod batch;
pub mod connection;
pub mod engine;
pub mod prepare;

#[cfg(test)]
pub mod fixtures;

pub use batch::{BatchExecutionUnit, BatchExecutor};
pub use connection::{ConnectionManager, StorageExecutor};
pub use engine::{ExecutionEngine, ExecutorCallback};
pub use prepare::ExecutionPreparer;
