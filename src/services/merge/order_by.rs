use std::cmp::Ordering;

use super::MergedResult;
use crate::error::{KernelError, Result};
use crate::models::{Collation, NullsOrder, OrderByItem, OrderDirection, QueryResult, Value};

/// Compare two rows over the ORDER BY items. NULLS ordering is independent
/// of the sort direction.
pub(crate) fn compare_rows<F, G>(left: F, right: G, order_by: &[OrderByItem], collation: Collation) -> Result<Ordering>
where
    F: Fn(usize) -> Result<Value>,
    G: Fn(usize) -> Result<Value>,
{
    for item in order_by {
        let a = left(item.column_index)?;
        let b = right(item.column_index)?;
        let ordering = match (a.is_null(), b.is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) => nulls_ordering(item.nulls),
            (false, true) => nulls_ordering(item.nulls).reverse(),
            (false, false) => {
                let ordering = a.compare(&b, collation)?;
                match item.direction {
                    OrderDirection::Asc => ordering,
                    OrderDirection::Desc => ordering.reverse(),
                }
            }
        };
        if ordering != Ordering::Equal {
            return Ok(ordering);
        }
    }
    Ok(Ordering::Equal)
}

fn nulls_ordering(nulls: NullsOrder) -> Ordering {
    match nulls {
        NullsOrder::First => Ordering::Less,
        NullsOrder::Last => Ordering::Greater,
    }
}

/// K-way merge over results each sorted by the same ORDER BY. Holds one
/// current row per input and picks the smallest by linear scan; ties go to
/// the input with the lower index.
#[derive(Debug)]
pub struct OrderByStreamMergedResult {
    results: Vec<Box<dyn QueryResult>>,
    order_by: Vec<OrderByItem>,
    collation: Collation,
    /// Whether input `i` is positioned on a row
    active: Vec<bool>,
    current: Option<usize>,
    started: bool,
}

impl OrderByStreamMergedResult {
    pub fn new(mut results: Vec<Box<dyn QueryResult>>, order_by: Vec<OrderByItem>, collation: Collation) -> Result<Self> {
        let mut active = Vec::with_capacity(results.len());
        for result in results.iter_mut() {
            active.push(result.next()?);
        }
        Ok(Self {
            results,
            order_by,
            collation,
            active,
            current: None,
            started: false,
        })
    }

    fn select_smallest(&self) -> Result<Option<usize>> {
        let mut smallest: Option<usize> = None;
        for (index, active) in self.active.iter().enumerate() {
            if !active {
                continue;
            }
            smallest = match smallest {
                None => Some(index),
                Some(best) => {
                    let candidate = &self.results[index];
                    let winner = &self.results[best];
                    let ordering = compare_rows(
                        |c| candidate.value(c).cloned(),
                        |c| winner.value(c).cloned(),
                        &self.order_by,
                        self.collation,
                    )?;
                    if ordering == Ordering::Less {
                        Some(index)
                    } else {
                        Some(best)
                    }
                }
            };
        }
        Ok(smallest)
    }
}

impl MergedResult for OrderByStreamMergedResult {
    fn next(&mut self) -> Result<bool> {
        if self.started {
            match self.current {
                Some(index) => self.active[index] = self.results[index].next()?,
                None => return Ok(false),
            }
        }
        self.started = true;
        self.current = self.select_smallest()?;
        Ok(self.current.is_some())
    }

    fn value(&self, column: usize) -> Result<Value> {
        match self.current {
            Some(index) => self.results[index].value(column).cloned(),
            None if !self.started => Err(KernelError::Position("next() has not been called".to_string())),
            None => Err(KernelError::Position("result set is exhausted".to_string())),
        }
    }
}
