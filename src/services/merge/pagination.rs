use super::MergedResult;
use crate::error::{KernelError, Result};
use crate::models::{Pagination, Value};

/// Applies the logical OFFSET / LIMIT once, on top of the merged rows
pub struct PaginationMergedResult {
    inner: Box<dyn MergedResult>,
    pagination: Pagination,
    skipped: bool,
    returned: u64,
    exhausted: bool,
}

impl PaginationMergedResult {
    pub fn new(inner: Box<dyn MergedResult>, pagination: Pagination) -> Self {
        Self {
            inner,
            pagination,
            skipped: false,
            returned: 0,
            exhausted: false,
        }
    }

    fn finish(&mut self) -> Result<bool> {
        self.exhausted = true;
        Ok(false)
    }
}

impl MergedResult for PaginationMergedResult {
    fn next(&mut self) -> Result<bool> {
        if self.exhausted {
            return Ok(false);
        }
        if !self.skipped {
            self.skipped = true;
            for _ in 0..self.pagination.offset {
                if !self.inner.next()? {
                    return self.finish();
                }
            }
        }
        if let Some(row_count) = self.pagination.row_count {
            if self.returned >= row_count {
                return self.finish();
            }
        }
        if self.inner.next()? {
            self.returned += 1;
            Ok(true)
        } else {
            self.finish()
        }
    }

    fn value(&self, column: usize) -> Result<Value> {
        if self.exhausted {
            return Err(KernelError::Position("result set is exhausted".to_string()));
        }
        self.inner.value(column)
    }
}
