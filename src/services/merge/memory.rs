use super::MergedResult;
use crate::error::{KernelError, Result};
use crate::models::Value;

/// Merged rows held locally in memory
#[derive(Debug, Clone)]
pub struct MemoryMergedResult {
    rows: Vec<Vec<Value>>,
    /// Index of the current row plus one; 0 means before the first row
    cursor: usize,
}

impl MemoryMergedResult {
    pub fn new(rows: Vec<Vec<Value>>) -> Self {
        Self { rows, cursor: 0 }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

impl MergedResult for MemoryMergedResult {
    fn next(&mut self) -> Result<bool> {
        if self.cursor <= self.rows.len() {
            self.cursor += 1;
        }
        Ok(self.cursor <= self.rows.len())
    }

    fn value(&self, column: usize) -> Result<Value> {
        if self.cursor == 0 {
            return Err(KernelError::Position("next() has not been called".to_string()));
        }
        let row = self
            .rows
            .get(self.cursor - 1)
            .ok_or_else(|| KernelError::Position("result set is exhausted".to_string()))?;
        row.get(column).cloned().ok_or(KernelError::ColumnIndexOutOfRange {
            index: column,
            count: row.len(),
        })
    }
}
