// In-memory collaborators for execution tests
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::connection::{ConnectionManager, StorageExecutor};
use crate::models::{ConnectionMode, ExecutionUnit, MemoryQueryResult, QueryResult, QueryResultMetadata, UpdateResult, Value};
use crate::services::transaction::TransactionCollaborator;

#[derive(Debug)]
pub struct MockConnection {
    pub id: usize,
    pub data_source: String,
}

#[derive(Default)]
pub struct MockConnectionManager {
    next_id: AtomicUsize,
    acquired: AtomicUsize,
    released: AtomicUsize,
    failing: HashSet<String>,
    acquire_delay: Option<Duration>,
}

impl MockConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_on(mut self, data_source: &str) -> Self {
        self.failing.insert(data_source.to_string());
        self
    }

    pub fn with_acquire_delay(mut self, delay: Duration) -> Self {
        self.acquire_delay = Some(delay);
        self
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ConnectionManager for MockConnectionManager {
    type Connection = MockConnection;

    async fn acquire_connection(&self, data_source: &str) -> anyhow::Result<MockConnection> {
        if let Some(delay) = self.acquire_delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.contains(data_source) {
            anyhow::bail!("pool for {} is exhausted", data_source);
        }
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(MockConnection {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            data_source: data_source.to_string(),
        })
    }

    async fn release(&self, _connection: MockConnection) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// Storage executor answering from per-data-source scripts
#[derive(Default)]
pub struct ScriptedStorageExecutor {
    rows: HashMap<String, MemoryQueryResult>,
    update_counts: HashMap<String, u64>,
    generated_keys: HashMap<String, Vec<Value>>,
    failing: HashSet<String>,
    delays: HashMap<String, Duration>,
    executed: Mutex<Vec<ExecutionUnit>>,
}

impl ScriptedStorageExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(mut self, data_source: &str, result: MemoryQueryResult) -> Self {
        self.rows.insert(data_source.to_string(), result);
        self
    }

    pub fn with_update_count(mut self, data_source: &str, count: u64) -> Self {
        self.update_counts.insert(data_source.to_string(), count);
        self
    }

    pub fn with_generated_keys(mut self, data_source: &str, keys: Vec<Value>) -> Self {
        self.generated_keys.insert(data_source.to_string(), keys);
        self
    }

    pub fn failing_on(mut self, data_source: &str) -> Self {
        self.failing.insert(data_source.to_string());
        self
    }

    pub fn with_delay(mut self, data_source: &str, delay: Duration) -> Self {
        self.delays.insert(data_source.to_string(), delay);
        self
    }

    pub fn executed_units(&self) -> Vec<ExecutionUnit> {
        self.executed.lock().map(|units| units.clone()).unwrap_or_default()
    }

    pub fn executed_data_sources(&self) -> Vec<String> {
        self.executed_units().into_iter().map(|u| u.data_source).collect()
    }

    async fn run(&self, unit: &ExecutionUnit) -> anyhow::Result<()> {
        if let Ok(mut executed) = self.executed.lock() {
            executed.push(unit.clone());
        }
        if let Some(delay) = self.delays.get(&unit.data_source) {
            tokio::time::sleep(*delay).await;
        }
        if self.failing.contains(&unit.data_source) {
            anyhow::bail!("scripted failure on {}", unit.data_source);
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl StorageExecutor<MockConnection> for ScriptedStorageExecutor {
    async fn query(
        &self,
        connection: &mut MockConnection,
        unit: &ExecutionUnit,
        _mode: ConnectionMode,
    ) -> anyhow::Result<Box<dyn QueryResult>> {
        assert_eq!(connection.data_source, unit.data_source);
        self.run(unit).await?;
        let result = self
            .rows
            .get(&unit.data_source)
            .cloned()
            .unwrap_or_else(|| MemoryQueryResult::new(QueryResultMetadata::default(), Vec::new()));
        Ok(Box::new(result))
    }

    async fn update(
        &self,
        connection: &mut MockConnection,
        unit: &ExecutionUnit,
        _mode: ConnectionMode,
    ) -> anyhow::Result<UpdateResult> {
        assert_eq!(connection.data_source, unit.data_source);
        self.run(unit).await?;
        let count = self.update_counts.get(&unit.data_source).copied().unwrap_or(1);
        let keys = self.generated_keys.get(&unit.data_source).cloned().unwrap_or_default();
        Ok(UpdateResult::new(count).with_generated_keys(keys))
    }
}

/// Transaction collaborator recording every call
#[derive(Default)]
pub struct MockTransactionCollaborator {
    active: AtomicBool,
    fail_commit: bool,
    fail_rollback: bool,
    events: Mutex<Vec<&'static str>>,
}

impl MockTransactionCollaborator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_transaction() -> Self {
        let collaborator = Self::default();
        collaborator.active.store(true, Ordering::SeqCst);
        collaborator
    }

    pub fn failing_commit(mut self) -> Self {
        self.fail_commit = true;
        self
    }

    pub fn failing_rollback(mut self) -> Self {
        self.fail_rollback = true;
        self
    }

    pub fn events(&self) -> Vec<&'static str> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    fn record(&self, event: &'static str) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

#[async_trait::async_trait]
impl TransactionCollaborator for MockTransactionCollaborator {
    async fn begin(&self) -> anyhow::Result<()> {
        self.record("begin");
        self.active.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn commit(&self) -> anyhow::Result<()> {
        self.record("commit");
        self.active.store(false, Ordering::SeqCst);
        if self.fail_commit {
            anyhow::bail!("commit rejected");
        }
        Ok(())
    }

    async fn rollback(&self) -> anyhow::Result<()> {
        self.record("rollback");
        self.active.store(false, Ordering::SeqCst);
        if self.fail_rollback {
            anyhow::bail!("rollback rejected");
        }
        Ok(())
    }

    fn is_in_transaction(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}
