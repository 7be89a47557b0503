use std::fmt;

use super::value::Value;
use crate::error::{KernelError, Result};

/// Column metadata of a query result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMetadata {
    pub name: String,
    pub label: String,
}

impl ColumnMetadata {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            label: name.to_string(),
        }
    }

    pub fn with_label(mut self, label: &str) -> Self {
        self.label = label.to_string();
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryResultMetadata {
    pub columns: Vec<ColumnMetadata>,
}

impl QueryResultMetadata {
    pub fn new(columns: Vec<ColumnMetadata>) -> Self {
        Self { columns }
    }

    pub fn from_names(names: &[&str]) -> Self {
        Self::new(names.iter().map(|n| ColumnMetadata::new(n)).collect())
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Index of a column by label, case-insensitive
    pub fn find_column_index(&self, label: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.label.eq_ignore_ascii_case(label))
    }
}

/// Pull-based row cursor over one physical target's result
pub trait QueryResult: Send + fmt::Debug {
    /// Advance to the next row; `false` once exhausted
    fn next(&mut self) -> Result<bool>;

    /// Value of the current row. Fails with a position error when the
    /// cursor is not on a row.
    fn value(&self, column: usize) -> Result<&Value>;

    fn metadata(&self) -> &QueryResultMetadata;

    fn column_count(&self) -> usize {
        self.metadata().column_count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CursorPosition {
    BeforeFirst,
    OnRow(usize),
    AfterLast,
}

/// Query result fully loaded into memory
#[derive(Debug, Clone)]
pub struct MemoryQueryResult {
    metadata: QueryResultMetadata,
    rows: Vec<Vec<Value>>,
    position: CursorPosition,
}

impl MemoryQueryResult {
    pub fn new(metadata: QueryResultMetadata, rows: Vec<Vec<Value>>) -> Self {
        Self {
            metadata,
            rows,
            position: CursorPosition::BeforeFirst,
        }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Load the remaining rows of another query result
    pub fn load(mut source: Box<dyn QueryResult>) -> Result<Self> {
        let metadata = source.metadata().clone();
        let column_count = metadata.column_count();
        let mut rows = Vec::new();
        while source.next()? {
            let mut row = Vec::with_capacity(column_count);
            for column in 0..column_count {
                row.push(source.value(column)?.clone());
            }
            rows.push(row);
        }
        Ok(Self::new(metadata, rows))
    }
}

impl QueryResult for MemoryQueryResult {
    fn next(&mut self) -> Result<bool> {
        let next = match self.position {
            CursorPosition::BeforeFirst => 0,
            CursorPosition::OnRow(index) => index + 1,
            CursorPosition::AfterLast => return Ok(false),
        };
        if next < self.rows.len() {
            self.position = CursorPosition::OnRow(next);
            Ok(true)
        } else {
            self.position = CursorPosition::AfterLast;
            Ok(false)
        }
    }

    fn value(&self, column: usize) -> Result<&Value> {
        let row = match self.position {
            CursorPosition::OnRow(index) => &self.rows[index],
            CursorPosition::BeforeFirst => {
                return Err(KernelError::Position("next() has not been called".to_string()))
            }
            CursorPosition::AfterLast => {
                return Err(KernelError::Position("result set is exhausted".to_string()))
            }
        };
        row.get(column).ok_or(KernelError::ColumnIndexOutOfRange {
            index: column,
            count: row.len(),
        })
    }

    fn metadata(&self) -> &QueryResultMetadata {
        &self.metadata
    }
}

/// Outcome of an update on one physical target
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateResult {
    pub update_count: u64,
    pub generated_keys: Vec<Value>,
}

impl UpdateResult {
    pub fn new(update_count: u64) -> Self {
        Self {
            update_count,
            generated_keys: Vec::new(),
        }
    }

    pub fn with_generated_keys(mut self, keys: Vec<Value>) -> Self {
        self.generated_keys = keys;
        self
    }
}

/// Outcome of a generic execute call
#[derive(Debug)]
pub enum ExecuteResult {
    Query(Box<dyn QueryResult>),
    Update(UpdateResult),
}

impl ExecuteResult {
    pub fn is_query(&self) -> bool {
        matches!(self, ExecuteResult::Query(_))
    }
}
