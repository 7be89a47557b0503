use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::config::KernelConfig;
use crate::error::{KernelError, Result};
use crate::models::{
    BoundStatement, ExecutionGroupContext, ExecutionUnit, ReportContext, RuleConfig, StatementKind, UpdateResult,
    Value,
};
use crate::services::execute::{
    BatchExecutor, ConnectionManager, ExecutionEngine, ExecutionPreparer, ExecutorCallback, StorageExecutor,
};
use crate::services::merge::{MaskRule, MergeEngine, MergedQueryResult};
use crate::services::rewrite::{ExecutionUnitBuilder, IdentifierRewriter, StatementRewriter};
use crate::services::route::{RouteEngine, RuleSet};
use crate::services::traffic::{prepare_traffic, TrafficRule};
use crate::services::transaction::{TransactionCollaborator, TransactionCoordinator};

/// Lifecycle of one statement execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    Idle,
    Routed,
    Prepared,
    Executing,
    Merging,
    Done,
    Error,
}

impl ExecutionState {
    pub fn can_transition_to(self, next: ExecutionState) -> bool {
        use ExecutionState::*;
        match next {
            Error => !matches!(self, Idle | Done | Error),
            _ => matches!(
                (self, next),
                (Idle, Routed)
                    | (Routed, Prepared)
                    | (Prepared, Executing)
                    | (Executing, Merging)
                    | (Executing, Done)
                    | (Merging, Done)
            ),
        }
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// State of the statement currently going through the pipeline
#[derive(Debug)]
pub struct ExecutionTracker {
    state: ExecutionState,
    execution_id: Uuid,
}

impl ExecutionTracker {
    pub fn new() -> Self {
        Self {
            state: ExecutionState::Idle,
            execution_id: Uuid::new_v4(),
        }
    }

    pub fn state(&self) -> ExecutionState {
        self.state
    }

    pub fn transition(&mut self, next: ExecutionState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(KernelError::IllegalState(format!(
                "cannot move from {} to {}",
                self.state, next
            )));
        }
        tracing::debug!("Execution {}: {} -> {}", self.execution_id, self.state, next);
        self.state = next;
        Ok(())
    }

    /// Move to `Error` unless nothing has started yet
    fn fail(&mut self, err: &KernelError) {
        if self.state.can_transition_to(ExecutionState::Error) {
            tracing::debug!("Execution {}: {} -> Error ({})", self.execution_id, self.state, err);
            self.state = ExecutionState::Error;
        }
    }
}

impl Default for ExecutionTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-session state carried across statements
#[derive(Debug, Clone, Default)]
pub struct SessionContext {
    /// Compute instance traffic sticks to while a transaction is held
    pub traffic_instance_id: Option<String>,
}

/// Result of [`StatementPipeline::execute`]
#[derive(Debug)]
pub enum StatementOutcome {
    Query(MergedQueryResult),
    Update(UpdateResult),
}

/// Compiled rules and shared engines of one logical database
pub struct DatabaseKernel {
    database_name: String,
    unit_timeout: Option<Duration>,
    route_engine: RouteEngine,
    unit_builder: ExecutionUnitBuilder,
    preparer: ExecutionPreparer,
    engine: ExecutionEngine,
    merge_engine: MergeEngine,
    transaction: TransactionCoordinator,
    traffic: TrafficRule,
}

impl DatabaseKernel {
    pub fn new(config: &KernelConfig, rules: &RuleConfig) -> Result<Self> {
        let rule_set = RuleSet::from_config(rules, config.routing.default_data_source.clone())?;

        let mut merge_engine = MergeEngine::new(config.merge.collation);
        if let Some(mask) = &rules.mask {
            let mask_rule = MaskRule::from_config(mask)?;
            if !mask_rule.is_empty() {
                merge_engine = merge_engine.with_mask_rule(Arc::new(mask_rule));
            }
        }
        let traffic = match &rules.traffic {
            Some(traffic) => TrafficRule::from_config(traffic)?,
            None => TrafficRule::default(),
        };

        let execution = &config.execution;
        tracing::info!(
            "Kernel for database '{}' ready: {} workers, {} connections per query, {:?}",
            config.database_name,
            execution.worker_pool_size,
            execution.max_connections_per_query,
            execution.failure_policy
        );

        Ok(Self {
            database_name: config.database_name.clone(),
            unit_timeout: execution.unit_timeout(),
            route_engine: RouteEngine::new(Arc::new(rule_set)),
            unit_builder: ExecutionUnitBuilder::new(Arc::new(IdentifierRewriter::new())),
            preparer: ExecutionPreparer::new(
                execution.max_connections_per_query,
                execution.connection_acquire_timeout(),
            ),
            engine: ExecutionEngine::new(execution.worker_pool_size, execution.failure_policy),
            merge_engine,
            transaction: TransactionCoordinator::new(config.transaction.implicit_commit),
            traffic,
        })
    }

    pub fn with_rewriter(mut self, rewriter: Arc<dyn StatementRewriter>) -> Self {
        self.unit_builder = ExecutionUnitBuilder::new(rewriter);
        self
    }

    pub fn database_name(&self) -> &str {
        &self.database_name
    }

    pub fn route_engine(&self) -> &RouteEngine {
        &self.route_engine
    }

    fn report(&self) -> ReportContext {
        ReportContext::new(&self.database_name).with_timeout(self.unit_timeout)
    }
}

enum RoutedStatement {
    Traffic { instance_id: String },
    Units(Vec<ExecutionUnit>),
}

impl RoutedStatement {
    fn data_sources(&self) -> Vec<&str> {
        match self {
            RoutedStatement::Traffic { instance_id } => vec![instance_id.as_str()],
            RoutedStatement::Units(units) => units.iter().map(|u| u.data_source.as_str()).collect(),
        }
    }
}

/// Summed across units when accumulating, else the first unit's count.
/// Keys the kernel generated itself stand in when no target reports any.
fn aggregate_updates(results: Vec<UpdateResult>, accumulate: bool, statement: &BoundStatement) -> UpdateResult {
    let update_count = if accumulate {
        results.iter().map(|r| r.update_count).sum()
    } else {
        results.first().map(|r| r.update_count).unwrap_or(0)
    };
    let mut keys: Vec<Value> = results.into_iter().flat_map(|r| r.generated_keys).collect();
    if keys.is_empty() {
        if let Some(generated) = &statement.generated_key {
            keys = generated.generated_values.clone();
        }
    }
    UpdateResult::new(update_count).with_generated_keys(keys)
}

/// Route, rewrite, prepare, execute and merge statements of one session
pub struct StatementPipeline<M, E>
where
    M: ConnectionManager,
    E: StorageExecutor<M::Connection>,
{
    kernel: Arc<DatabaseKernel>,
    manager: Arc<M>,
    executor: Arc<E>,
    transaction: Arc<dyn TransactionCollaborator>,
    session: SessionContext,
    batch: BatchExecutor,
    batch_statement: Option<(StatementKind, bool)>,
    last_state: ExecutionState,
}

impl<M, E> StatementPipeline<M, E>
where
    M: ConnectionManager,
    E: StorageExecutor<M::Connection>,
{
    pub fn new(
        kernel: Arc<DatabaseKernel>,
        manager: Arc<M>,
        executor: Arc<E>,
        transaction: Arc<dyn TransactionCollaborator>,
    ) -> Self {
        Self {
            kernel,
            manager,
            executor,
            transaction,
            session: SessionContext::default(),
            batch: BatchExecutor::new(),
            batch_statement: None,
            last_state: ExecutionState::Idle,
        }
    }

    pub fn session(&self) -> &SessionContext {
        &self.session
    }

    /// Final state of the most recent statement
    pub fn last_state(&self) -> ExecutionState {
        self.last_state
    }

    pub async fn execute_query(&mut self, statement: &BoundStatement) -> Result<MergedQueryResult> {
        let mut tracker = ExecutionTracker::new();
        let result = self.run_query(statement, &mut tracker).await;
        self.finish(&mut tracker, result)
    }

    pub async fn execute_update(&mut self, statement: &BoundStatement) -> Result<UpdateResult> {
        let mut tracker = ExecutionTracker::new();
        let result = self.run_update(statement, &mut tracker).await;
        self.finish(&mut tracker, result)
    }

    pub async fn execute(&mut self, statement: &BoundStatement) -> Result<StatementOutcome> {
        if statement.kind.is_select() {
            self.execute_query(statement).await.map(StatementOutcome::Query)
        } else {
            self.execute_update(statement).await.map(StatementOutcome::Update)
        }
    }

    /// Route and rewrite one parameter set of a batched statement
    pub fn add_batch(&mut self, statement: &BoundStatement) -> Result<()> {
        let route_engine = &self.kernel.route_engine;
        let route_context = route_engine.route(statement, self.transaction.is_in_transaction())?;
        let units = self.kernel.unit_builder.build(statement, &route_context)?;
        let accumulate = route_engine.rule_set().is_accumulate(statement);
        self.batch_statement = Some((statement.kind, accumulate));
        let index = self.batch.add(units);
        tracing::debug!("Added batch entry {} over {} route units", index, route_context.len());
        Ok(())
    }

    /// One update count per `add_batch` call; the batch is cleared either way
    pub async fn execute_batch(&mut self) -> Result<Vec<u64>> {
        let Some((kind, accumulate)) = self.batch_statement.take() else {
            self.batch.clear();
            return Ok(Vec::new());
        };
        let kernel = self.kernel.clone();
        let transaction = self.transaction.clone();
        let data_sources: Vec<String> = self.batch.units().iter().map(|u| u.data_source.clone()).collect();
        let data_sources: Vec<&str> = data_sources.iter().map(String::as_str).collect();
        let work = self.batch.execute(
            &kernel.preparer,
            &kernel.engine,
            self.manager.clone(),
            self.executor.clone(),
            kernel.report(),
            accumulate,
        );
        if kernel
            .transaction
            .needs_implicit_transaction(kind, &data_sources, transaction.as_ref())
        {
            kernel.transaction.run_in_transaction(transaction.as_ref(), work).await
        } else {
            work.await
        }
    }

    fn finish<T>(&mut self, tracker: &mut ExecutionTracker, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            tracker.fail(err);
        }
        self.last_state = tracker.state();
        result
    }

    fn route(&mut self, statement: &BoundStatement, tracker: &mut ExecutionTracker) -> Result<RoutedStatement> {
        let in_transaction = self.transaction.is_in_transaction();
        if !in_transaction {
            self.session.traffic_instance_id = None;
        }

        if !self.kernel.traffic.is_empty() {
            let sticky = self.session.traffic_instance_id.clone();
            if let Some(instance_id) = self.kernel.traffic.route(statement, sticky.as_deref())? {
                if in_transaction {
                    self.session.traffic_instance_id = Some(instance_id.clone());
                }
                tracker.transition(ExecutionState::Routed)?;
                return Ok(RoutedStatement::Traffic { instance_id });
            }
        }

        let route_context = self.kernel.route_engine.route(statement, in_transaction)?;
        let units = self.kernel.unit_builder.build(statement, &route_context)?;
        tracker.transition(ExecutionState::Routed)?;
        Ok(RoutedStatement::Units(units))
    }

    async fn prepare(
        &self,
        statement: &BoundStatement,
        routed: RoutedStatement,
        tracker: &mut ExecutionTracker,
    ) -> Result<ExecutionGroupContext<M::Connection>> {
        let report = self.kernel.report();
        let context = match routed {
            RoutedStatement::Traffic { instance_id } => {
                prepare_traffic(&self.kernel.preparer, self.manager.as_ref(), statement, &instance_id, report).await?
            }
            RoutedStatement::Units(units) => self.kernel.preparer.prepare(units, self.manager.as_ref(), report).await?,
        };
        if let Err(err) = tracker.transition(ExecutionState::Prepared) {
            for group in context.groups {
                self.manager.release(group.connection).await;
            }
            return Err(err);
        }
        Ok(context)
    }

    async fn run_query(&mut self, statement: &BoundStatement, tracker: &mut ExecutionTracker) -> Result<MergedQueryResult> {
        let routed = self.route(statement, tracker)?;
        let context = self.prepare(statement, routed, tracker).await?;
        tracker.transition(ExecutionState::Executing)?;
        let results = self
            .kernel
            .engine
            .execute_query(context, self.manager.clone(), ExecutorCallback::query(self.executor.clone()))
            .await?;
        tracker.transition(ExecutionState::Merging)?;
        let merged = self.kernel.merge_engine.merge(results, statement)?;
        tracker.transition(ExecutionState::Done)?;
        Ok(merged)
    }

    async fn run_update(&mut self, statement: &BoundStatement, tracker: &mut ExecutionTracker) -> Result<UpdateResult> {
        let routed = self.route(statement, tracker)?;
        let kernel = self.kernel.clone();
        let transaction = self.transaction.clone();
        let implicit = kernel
            .transaction
            .needs_implicit_transaction(statement.kind, &routed.data_sources(), transaction.as_ref());
        if implicit {
            kernel
                .transaction
                .run_in_transaction(transaction.as_ref(), self.run_routed_update(statement, routed, tracker))
                .await
        } else {
            self.run_routed_update(statement, routed, tracker).await
        }
    }

    async fn run_routed_update(
        &self,
        statement: &BoundStatement,
        routed: RoutedStatement,
        tracker: &mut ExecutionTracker,
    ) -> Result<UpdateResult> {
        let context = self.prepare(statement, routed, tracker).await?;
        tracker.transition(ExecutionState::Executing)?;
        let results = self
            .kernel
            .engine
            .execute_update(context, self.manager.clone(), ExecutorCallback::update(self.executor.clone()))
            .await?;
        let accumulate = self.kernel.route_engine.rule_set().is_accumulate(statement);
        let result = aggregate_updates(results, accumulate, statement);
        tracker.transition(ExecutionState::Done)?;
        Ok(result)
    }
}
