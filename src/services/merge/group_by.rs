use std::cmp::Ordering;
use std::collections::HashMap;

use super::memory::MemoryMergedResult;
use super::order_by::compare_rows;
use crate::error::{KernelError, Result};
use crate::models::{AggregationKind, Collation, QueryResult, StatementShape, Value};

/// Combine two partial SUM / COUNT values. Nulls are ignored; integer
/// overflow is a merge error.
fn add_values(total: &Value, partial: &Value) -> Result<Value> {
    match (total, partial) {
        (Value::Null, v) | (v, Value::Null) => Ok(v.clone()),
        (Value::Int(a), Value::Int(b)) => a
            .checked_add(*b)
            .map(Value::Int)
            .ok_or_else(|| KernelError::Merge(format!("integer overflow adding {} to {}", b, a))),
        (a, b) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => Ok(Value::Float(a + b)),
            _ => Err(KernelError::Merge(format!(
                "cannot add {} to {}",
                b.type_name(),
                a.type_name()
            ))),
        },
    }
}

fn pick(current: &Value, partial: &Value, want: Ordering, collation: Collation) -> Result<Value> {
    if current.is_null() {
        return Ok(partial.clone());
    }
    if partial.is_null() {
        return Ok(current.clone());
    }
    if partial.compare(current, collation)? == want {
        Ok(partial.clone())
    } else {
        Ok(current.clone())
    }
}

fn average(sum: &Value, count: &Value) -> Result<Value> {
    let count = match count {
        Value::Null => return Ok(Value::Null),
        v => v
            .as_f64()
            .ok_or_else(|| KernelError::Merge(format!("AVG count is {}", v.type_name())))?,
    };
    if count == 0.0 {
        return Ok(Value::Null);
    }
    match sum {
        Value::Null => Ok(Value::Null),
        v => v
            .as_f64()
            .map(|s| Value::Float(s / count))
            .ok_or_else(|| KernelError::Merge(format!("AVG sum is {}", v.type_name()))),
    }
}

struct Group {
    row: Vec<Value>,
}

impl Group {
    fn accumulate(&mut self, row: &[Value], shape: &StatementShape, collation: Collation) -> Result<()> {
        for aggregation in &shape.aggregations {
            match &aggregation.kind {
                AggregationKind::Count | AggregationKind::Sum => {
                    let i = aggregation.column_index;
                    self.row[i] = add_values(&self.row[i], &row[i])?;
                }
                AggregationKind::Min => {
                    let i = aggregation.column_index;
                    self.row[i] = pick(&self.row[i], &row[i], Ordering::Less, collation)?;
                }
                AggregationKind::Max => {
                    let i = aggregation.column_index;
                    self.row[i] = pick(&self.row[i], &row[i], Ordering::Greater, collation)?;
                }
                AggregationKind::Avg { sum_index, count_index } => {
                    self.row[*sum_index] = add_values(&self.row[*sum_index], &row[*sum_index])?;
                    self.row[*count_index] = add_values(&self.row[*count_index], &row[*count_index])?;
                }
            }
        }
        Ok(())
    }

    fn finish(mut self, shape: &StatementShape) -> Result<Vec<Value>> {
        for aggregation in &shape.aggregations {
            if let AggregationKind::Avg { sum_index, count_index } = &aggregation.kind {
                self.row[aggregation.column_index] = average(&self.row[*sum_index], &self.row[*count_index])?;
            }
        }
        Ok(self.row)
    }
}

fn read_row(result: &dyn QueryResult, column_count: usize) -> Result<Vec<Value>> {
    (0..column_count).map(|c| result.value(c).cloned()).collect()
}

fn check_indices(shape: &StatementShape, group_columns: &[usize], column_count: usize) -> Result<()> {
    let mut indices: Vec<usize> = group_columns.to_vec();
    indices.extend(shape.order_by.iter().map(|o| o.column_index));
    for aggregation in &shape.aggregations {
        indices.push(aggregation.column_index);
        if let AggregationKind::Avg { sum_index, count_index } = &aggregation.kind {
            indices.push(*sum_index);
            indices.push(*count_index);
        }
    }
    match indices.into_iter().find(|i| *i >= column_count) {
        Some(index) => Err(KernelError::ColumnIndexOutOfRange {
            index,
            count: column_count,
        }),
        None => Ok(()),
    }
}

/// Drain every result and combine rows sharing a group key.
///
/// DISTINCT without GROUP BY groups over the visible columns. Groups come
/// out in ORDER BY order when the statement has one, else in order of first
/// appearance across the results.
pub fn merge_group_by(
    mut results: Vec<Box<dyn QueryResult>>,
    shape: &StatementShape,
    column_count: usize,
    collation: Collation,
) -> Result<MemoryMergedResult> {
    let group_columns: Vec<usize> = if shape.has_group_by() {
        shape.group_by.clone()
    } else if shape.distinct {
        (0..shape.visible_columns.unwrap_or(column_count).min(column_count)).collect()
    } else {
        Vec::new()
    };
    check_indices(shape, &group_columns, column_count)?;

    let mut positions: HashMap<Vec<u8>, usize> = HashMap::new();
    let mut groups: Vec<Group> = Vec::new();
    for result in results.iter_mut() {
        while result.next()? {
            let row = read_row(&**result, column_count)?;
            let mut key = Vec::new();
            for column in &group_columns {
                row[*column].encode_key(collation, &mut key);
            }
            match positions.get(&key) {
                Some(position) => groups[*position].accumulate(&row, shape, collation)?,
                None => {
                    positions.insert(key, groups.len());
                    groups.push(Group { row });
                }
            }
        }
    }
    tracing::debug!("Group-by merge produced {} groups", groups.len());

    let mut rows = groups
        .into_iter()
        .map(|group| group.finish(shape))
        .collect::<Result<Vec<_>>>()?;

    if shape.has_order_by() {
        let mut failure = None;
        rows.sort_by(|a, b| {
            compare_rows(
                |c| Ok(a[c].clone()),
                |c| Ok(b[c].clone()),
                &shape.order_by,
                collation,
            )
            .unwrap_or_else(|e| {
                failure.get_or_insert(e);
                Ordering::Equal
            })
        });
        if let Some(err) = failure {
            return Err(err);
        }
    }

    Ok(MemoryMergedResult::new(rows))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AggregationProjection, MemoryQueryResult, OrderByItem, QueryResultMetadata};
    use crate::services::merge::MergedResult;

    fn result(names: &[&str], rows: Vec<Vec<Value>>) -> Box<dyn QueryResult> {
        Box::new(MemoryQueryResult::new(QueryResultMetadata::from_names(names), rows))
    }

    fn drain(merged: &mut MemoryMergedResult, width: usize) -> Vec<Vec<Value>> {
        let mut rows = Vec::new();
        while merged.next().unwrap() {
            rows.push((0..width).map(|c| merged.value(c).unwrap()).collect());
        }
        rows
    }

    #[test]
    fn test_count_partials_are_summed() {
        let shape = StatementShape {
            aggregations: vec![AggregationProjection::new(0, AggregationKind::Count)],
            ..Default::default()
        };
        let mut merged = merge_group_by(
            vec![
                result(&["count"], vec![vec![Value::Int(5)]]),
                result(&["count"], vec![vec![Value::Int(7)]]),
            ],
            &shape,
            1,
            Collation::Binary,
        )
        .unwrap();
        assert_eq!(drain(&mut merged, 1), vec![vec![Value::Int(12)]]);
    }

    #[test]
    fn test_group_by_keeps_first_appearance_order() {
        let shape = StatementShape {
            group_by: vec![0],
            aggregations: vec![
                AggregationProjection::new(1, AggregationKind::Sum),
                AggregationProjection::new(2, AggregationKind::Min),
                AggregationProjection::new(3, AggregationKind::Max),
            ],
            ..Default::default()
        };
        let names = ["status", "sum", "min", "max"];
        let row = |s: &str, sum: i64, min: i64, max: i64| {
            vec![Value::from(s), Value::Int(sum), Value::Int(min), Value::Int(max)]
        };
        let mut merged = merge_group_by(
            vec![
                result(&names, vec![row("paid", 10, 3, 8), row("new", 1, 1, 1)]),
                result(&names, vec![row("new", 2, 0, 4), row("paid", 5, 4, 9)]),
            ],
            &shape,
            4,
            Collation::Binary,
        )
        .unwrap();
        assert_eq!(drain(&mut merged, 4), vec![row("paid", 15, 3, 9), row("new", 3, 0, 4)]);
    }

    #[test]
    fn test_avg_from_sum_and_count_helpers() {
        let shape = StatementShape {
            aggregations: vec![AggregationProjection::new(
                0,
                AggregationKind::Avg {
                    sum_index: 1,
                    count_index: 2,
                },
            )],
            visible_columns: Some(1),
            ..Default::default()
        };
        let names = ["avg", "avg_sum", "avg_count"];
        let mut merged = merge_group_by(
            vec![
                result(&names, vec![vec![Value::Float(2.0), Value::Int(6), Value::Int(3)]]),
                result(&names, vec![vec![Value::Float(4.0), Value::Int(4), Value::Int(1)]]),
            ],
            &shape,
            3,
            Collation::Binary,
        )
        .unwrap();
        assert!(merged.next().unwrap());
        assert_eq!(merged.value(0).unwrap(), Value::Float(2.5));
    }

    #[test]
    fn test_distinct_with_case_insensitive_collation() {
        let shape = StatementShape {
            distinct: true,
            order_by: vec![OrderByItem::asc(0)],
            ..Default::default()
        };
        let mut merged = merge_group_by(
            vec![
                result(&["name"], vec![vec![Value::from("bob")], vec![Value::from("Alice")]]),
                result(&["name"], vec![vec![Value::from("BOB")]]),
            ],
            &shape,
            1,
            Collation::CaseInsensitive,
        )
        .unwrap();
        assert_eq!(
            drain(&mut merged, 1),
            vec![vec![Value::from("Alice")], vec![Value::from("bob")]]
        );
    }

    #[test]
    fn test_sum_of_text_is_merge_error() {
        let shape = StatementShape {
            aggregations: vec![AggregationProjection::new(0, AggregationKind::Sum)],
            ..Default::default()
        };
        let result = merge_group_by(
            vec![
                result(&["sum"], vec![vec![Value::Int(1)]]),
                result(&["sum"], vec![vec![Value::from("x")]]),
            ],
            &shape,
            1,
            Collation::Binary,
        );
        assert!(matches!(result, Err(KernelError::Merge(_))));
    }

    #[test]
    fn test_sum_overflow_is_merge_error() {
        let shape = StatementShape {
            aggregations: vec![AggregationProjection::new(0, AggregationKind::Sum)],
            ..Default::default()
        };
        let result = merge_group_by(
            vec![
                result(&["sum"], vec![vec![Value::Int(i64::MAX)]]),
                result(&["sum"], vec![vec![Value::Int(1)]]),
            ],
            &shape,
            1,
            Collation::Binary,
        );
        assert!(matches!(result, Err(KernelError::Merge(_))));
    }

    #[test]
    fn test_group_column_out_of_range() {
        let shape = StatementShape {
            group_by: vec![3],
            ..Default::default()
        };
        let result = merge_group_by(vec![result(&["a"], vec![])], &shape, 1, Collation::Binary);
        assert!(matches!(
            result,
            Err(KernelError::ColumnIndexOutOfRange { index: 3, count: 1 })
        ));
    }
}
