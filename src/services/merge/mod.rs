pub mod decorator;
pub mod group_by;
pub mod memory;
pub mod order_by;
pub mod pagination;
pub mod stream;

use std::sync::Arc;

use crate::error::{KernelError, Result};
use crate::models::{BoundStatement, Collation, QueryResult, QueryResultMetadata, Value};

pub use decorator::{ColumnDecorator, DecoratedMergedResult, MaskAlgorithm, MaskDecorator, MaskRule};
pub use memory::MemoryMergedResult;
pub use order_by::OrderByStreamMergedResult;
pub use pagination::PaginationMergedResult;
pub use stream::{IteratorStreamMergedResult, TransparentMergedResult};

/// Single logical cursor over the results of every execution unit
pub trait MergedResult: Send {
    /// Advance to the next logical row; `false` once exhausted
    fn next(&mut self) -> Result<bool>;

    /// Value of the current row. Calling it twice without `next` returns the
    /// same value.
    fn value(&self, column: usize) -> Result<Value>;
}

/// Merged result as handed back to the caller. Only the visible columns are
/// readable; derived helper columns are hidden.
pub struct MergedQueryResult {
    inner: Box<dyn MergedResult>,
    metadata: QueryResultMetadata,
}

impl MergedQueryResult {
    pub fn new(inner: Box<dyn MergedResult>, metadata: QueryResultMetadata) -> Self {
        Self { inner, metadata }
    }

    pub fn metadata(&self) -> &QueryResultMetadata {
        &self.metadata
    }

    pub fn column_count(&self) -> usize {
        self.metadata.column_count()
    }

    /// Drain the remaining rows
    pub fn rows(&mut self) -> Result<Vec<Vec<Value>>> {
        let mut rows = Vec::new();
        while self.next()? {
            rows.push((0..self.column_count()).map(|c| self.value(c)).collect::<Result<Vec<_>>>()?);
        }
        Ok(rows)
    }
}

impl std::fmt::Debug for MergedQueryResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergedQueryResult")
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

impl MergedResult for MergedQueryResult {
    fn next(&mut self) -> Result<bool> {
        self.inner.next()
    }

    fn value(&self, column: usize) -> Result<Value> {
        if column >= self.metadata.column_count() {
            return Err(KernelError::ColumnIndexOutOfRange {
                index: column,
                count: self.metadata.column_count(),
            });
        }
        self.inner.value(column)
    }
}

/// Picks the merge strategy from the statement shape
pub struct MergeEngine {
    collation: Collation,
    mask_rule: Option<Arc<MaskRule>>,
}

impl MergeEngine {
    pub fn new(collation: Collation) -> Self {
        Self {
            collation,
            mask_rule: None,
        }
    }

    pub fn with_mask_rule(mut self, rule: Arc<MaskRule>) -> Self {
        self.mask_rule = Some(rule);
        self
    }

    pub fn collation(&self) -> Collation {
        self.collation
    }

    pub fn merge(&self, results: Vec<Box<dyn QueryResult>>, statement: &BoundStatement) -> Result<MergedQueryResult> {
        let shape = &statement.shape;
        let metadata = results.first().map(|r| r.metadata().clone()).unwrap_or_default();
        let column_count = metadata.column_count();
        if let Some(mismatch) = results.iter().find(|r| r.column_count() != column_count) {
            return Err(KernelError::Merge(format!(
                "results disagree on column count: {} vs {}",
                column_count,
                mismatch.column_count()
            )));
        }

        let merged: Box<dyn MergedResult> = match results.len() {
            0 => Box::new(MemoryMergedResult::empty()),
            1 => Box::new(TransparentMergedResult::new(results.into_iter().next().ok_or_else(|| {
                KernelError::Internal("single result vanished".to_string())
            })?)),
            count => {
                let merged: Box<dyn MergedResult> =
                    if shape.has_group_by() || shape.has_aggregation() || shape.distinct {
                        tracing::debug!("Group-by merge over {} results", count);
                        Box::new(group_by::merge_group_by(results, shape, column_count, self.collation)?)
                    } else if shape.has_order_by() {
                        tracing::debug!("Order-by merge over {} results", count);
                        Box::new(OrderByStreamMergedResult::new(
                            results,
                            shape.order_by.clone(),
                            self.collation,
                        )?)
                    } else {
                        tracing::debug!("Stream merge over {} results", count);
                        Box::new(IteratorStreamMergedResult::new(results))
                    };
                match shape.pagination {
                    Some(pagination) => Box::new(PaginationMergedResult::new(merged, pagination)),
                    None => merged,
                }
            }
        };

        let merged = self.decorate(merged, statement);
        let visible = shape.visible_columns.unwrap_or(column_count).min(column_count);
        let mut columns = metadata.columns;
        columns.truncate(visible);
        Ok(MergedQueryResult::new(merged, QueryResultMetadata::new(columns)))
    }

    fn decorate(&self, merged: Box<dyn MergedResult>, statement: &BoundStatement) -> Box<dyn MergedResult> {
        let mut decorators: Vec<Arc<dyn ColumnDecorator>> = Vec::new();
        if let Some(rule) = &self.mask_rule {
            if let Some(decorator) = MaskDecorator::from_statement(rule, statement) {
                decorators.push(Arc::new(decorator));
            }
        }
        if decorators.is_empty() {
            merged
        } else {
            Box::new(DecoratedMergedResult::new(merged, decorators))
        }
    }
}

impl Default for MergeEngine {
    fn default() -> Self {
        Self::new(Collation::default())
    }
}
