use super::MergedResult;
use crate::error::{KernelError, Result};
use crate::models::{QueryResult, Value};

/// A single physical result already carries the final ordering, grouping
/// and pagination
#[derive(Debug)]
pub struct TransparentMergedResult {
    result: Box<dyn QueryResult>,
}

impl TransparentMergedResult {
    pub fn new(result: Box<dyn QueryResult>) -> Self {
        Self { result }
    }
}

impl MergedResult for TransparentMergedResult {
    fn next(&mut self) -> Result<bool> {
        self.result.next()
    }

    fn value(&self, column: usize) -> Result<Value> {
        self.result.value(column).cloned()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    BeforeFirst,
    OnRow,
    Exhausted,
}

/// Concatenates results in route unit order
#[derive(Debug)]
pub struct IteratorStreamMergedResult {
    results: Vec<Box<dyn QueryResult>>,
    current: usize,
    state: StreamState,
}

impl IteratorStreamMergedResult {
    pub fn new(results: Vec<Box<dyn QueryResult>>) -> Self {
        Self {
            results,
            current: 0,
            state: StreamState::BeforeFirst,
        }
    }
}

impl MergedResult for IteratorStreamMergedResult {
    fn next(&mut self) -> Result<bool> {
        if self.state == StreamState::Exhausted {
            return Ok(false);
        }
        while self.current < self.results.len() {
            if self.results[self.current].next()? {
                self.state = StreamState::OnRow;
                return Ok(true);
            }
            self.current += 1;
        }
        self.state = StreamState::Exhausted;
        Ok(false)
    }

    fn value(&self, column: usize) -> Result<Value> {
        match self.state {
            StreamState::OnRow => self.results[self.current].value(column).cloned(),
            StreamState::BeforeFirst => Err(KernelError::Position("next() has not been called".to_string())),
            StreamState::Exhausted => Err(KernelError::Position("result set is exhausted".to_string())),
        }
    }
}
