use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use uuid::Uuid;

use super::value::Value;

/// Rewritten SQL and positional parameters for one physical target
#[derive(Debug, Clone, PartialEq)]
pub struct SqlUnit {
    pub sql: String,
    pub parameters: Vec<Value>,
}

impl SqlUnit {
    pub fn new(sql: impl Into<String>, parameters: Vec<Value>) -> Self {
        Self {
            sql: sql.into(),
            parameters,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionUnit {
    pub data_source: String,
    pub sql_unit: SqlUnit,
}

impl ExecutionUnit {
    pub fn new(data_source: impl Into<String>, sql_unit: SqlUnit) -> Self {
        Self {
            data_source: data_source.into(),
            sql_unit,
        }
    }
}

/// Whether a connection may be shared by several units of one statement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionMode {
    /// One connection per unit; results may stay as open streams
    MemoryStrictly,
    /// Units share connections; each result must be materialised before the
    /// next unit runs on the same connection
    ConnectionStrictly,
}

/// Units that share one physical connection and run sequentially on it
#[derive(Debug)]
pub struct ExecutionGroup<C> {
    pub data_source: String,
    pub connection: C,
    pub connection_mode: ConnectionMode,
    pub units: Vec<ExecutionUnit>,
    /// Position of each unit in the statement's execution unit list
    pub unit_indices: Vec<usize>,
}

impl<C> ExecutionGroup<C> {
    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

/// Diagnostics attached to one statement execution
#[derive(Debug, Clone)]
pub struct ReportContext {
    pub database_name: String,
    pub execution_id: Uuid,
    pub started_at: DateTime<Utc>,
    started: Instant,
    timeout: Option<Duration>,
}

impl ReportContext {
    pub fn new(database_name: &str) -> Self {
        Self {
            database_name: database_name.to_string(),
            execution_id: Uuid::new_v4(),
            started_at: Utc::now(),
            started: Instant::now(),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn is_expired(&self) -> bool {
        self.timeout.map(|t| self.elapsed() > t).unwrap_or(false)
    }
}

/// All groups of one statement execution, in submission order
#[derive(Debug)]
pub struct ExecutionGroupContext<C> {
    pub groups: Vec<ExecutionGroup<C>>,
    pub report: ReportContext,
}

impl<C> ExecutionGroupContext<C> {
    pub fn unit_count(&self) -> usize {
        self.groups.iter().map(|g| g.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.iter().all(|g| g.is_empty())
    }
}
