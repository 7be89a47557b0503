pub mod connection_pool;
pub mod execute;
pub mod kernel;
pub mod merge;
pub mod rewrite;
pub mod route;
pub mod traffic;
pub mod transaction;

pub use connection_pool::{PostgresConnectionManager, PostgresStorageExecutor};
pub use kernel::{DatabaseKernel, ExecutionState, SessionContext, StatementOutcome, StatementPipeline};
pub use merge::{MergeEngine, MergedQueryResult, MergedResult};
pub use rewrite::{ExecutionUnitBuilder, IdentifierRewriter, StatementRewriter};
pub use route::{RouteEngine, RuleSet};
pub use traffic::TrafficRule;
pub use transaction::{TransactionCollaborator, TransactionCoordinator};
