use serde::{Deserialize, Serialize};

use super::value::Value;

/// Kind of bound statement, as classified by the binder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatementKind {
    Select,
    Insert,
    Update,
    Delete,
    /// DAL / DDL / SHOW style statements
    Other,
}

impl StatementKind {
    pub fn is_select(&self) -> bool {
        matches!(self, StatementKind::Select)
    }

    pub fn is_dml(&self) -> bool {
        matches!(
            self,
            StatementKind::Select | StatementKind::Insert | StatementKind::Update | StatementKind::Delete
        )
    }

    /// DML that modifies rows
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            StatementKind::Insert | StatementKind::Update | StatementKind::Delete
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NullsOrder {
    First,
    Last,
}

/// One ORDER BY item, resolved by the binder to a result column index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderByItem {
    pub column_index: usize,
    pub direction: OrderDirection,
    pub nulls: NullsOrder,
}

impl OrderByItem {
    pub fn asc(column_index: usize) -> Self {
        Self {
            column_index,
            direction: OrderDirection::Asc,
            nulls: NullsOrder::First,
        }
    }

    pub fn desc(column_index: usize) -> Self {
        Self {
            column_index,
            direction: OrderDirection::Desc,
            nulls: NullsOrder::Last,
        }
    }

    pub fn with_nulls(mut self, nulls: NullsOrder) -> Self {
        self.nulls = nulls;
        self
    }
}

/// Aggregate function and the result columns its partial state occupies
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AggregationKind {
    Count,
    Sum,
    Min,
    Max,
    /// AVG is pushed down as SUM and COUNT helper columns
    Avg { sum_index: usize, count_index: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregationProjection {
    pub column_index: usize,
    pub kind: AggregationKind,
}

impl AggregationProjection {
    pub fn new(column_index: usize, kind: AggregationKind) -> Self {
        Self { column_index, kind }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Pagination {
    pub offset: u64,
    pub row_count: Option<u64>,
}

impl Pagination {
    pub fn new(offset: u64, row_count: Option<u64>) -> Self {
        Self { offset, row_count }
    }

    /// Row count each physical target must return for a global OFFSET/LIMIT
    pub fn pushed_down_row_count(&self) -> Option<u64> {
        self.row_count.map(|count| count.saturating_add(self.offset))
    }
}

/// Statement shape driving merge selection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatementShape {
    pub order_by: Vec<OrderByItem>,
    pub group_by: Vec<usize>,
    pub aggregations: Vec<AggregationProjection>,
    pub distinct: bool,
    pub pagination: Option<Pagination>,
    /// Visible result columns; derived helper columns follow them.
    /// `None` means every returned column is visible.
    pub visible_columns: Option<usize>,
}

impl StatementShape {
    pub fn has_order_by(&self) -> bool {
        !self.order_by.is_empty()
    }

    pub fn has_group_by(&self) -> bool {
        !self.group_by.is_empty()
    }

    pub fn has_aggregation(&self) -> bool {
        !self.aggregations.is_empty()
    }

    pub fn has_pagination(&self) -> bool {
        self.pagination.is_some()
    }
}

/// Projection source of a result column, used by column decorators
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Projection {
    pub table: Option<String>,
    pub column: String,
}

impl Projection {
    pub fn new(table: Option<&str>, column: &str) -> Self {
        Self {
            table: table.map(str::to_string),
            column: column.to_string(),
        }
    }
}

/// `table.column = value` (or `IN (...)`) condition extracted by the binder
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnCondition {
    pub table: String,
    pub column: String,
    pub values: Vec<Value>,
}

impl ColumnCondition {
    pub fn new(table: &str, column: &str, values: Vec<Value>) -> Self {
        Self {
            table: table.to_string(),
            column: column.to_string(),
            values,
        }
    }
}

/// Hint values extracted from the statement or the session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HintContext {
    pub use_traffic: bool,
    pub write_route_only: bool,
}

/// Key column the kernel generated values for (e.g. insert without id)
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedKeyContext {
    pub column: String,
    pub generated_values: Vec<Value>,
}

/// Statement as handed over by the parser/binder
#[derive(Debug, Clone)]
pub struct BoundStatement {
    pub sql: String,
    pub parameters: Vec<Value>,
    pub kind: StatementKind,
    /// Referenced logical tables, in statement order
    pub tables: Vec<String>,
    pub projections: Vec<Projection>,
    pub conditions: Vec<ColumnCondition>,
    pub shape: StatementShape,
    /// Raw comment blocks, in source order
    pub comments: Vec<String>,
    pub hint: HintContext,
    pub generated_key: Option<GeneratedKeyContext>,
}

impl BoundStatement {
    pub fn new(sql: &str, kind: StatementKind) -> Self {
        Self {
            sql: sql.to_string(),
            parameters: Vec::new(),
            kind,
            tables: Vec::new(),
            projections: Vec::new(),
            conditions: Vec::new(),
            shape: StatementShape::default(),
            comments: Vec::new(),
            hint: HintContext::default(),
            generated_key: None,
        }
    }

    pub fn with_tables(mut self, tables: &[&str]) -> Self {
        self.tables = tables.iter().map(|t| t.to_lowercase()).collect();
        self
    }

    pub fn with_parameters(mut self, parameters: Vec<Value>) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_condition(mut self, condition: ColumnCondition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn with_shape(mut self, shape: StatementShape) -> Self {
        self.shape = shape;
        self
    }

    pub fn with_projections(mut self, projections: Vec<Projection>) -> Self {
        self.projections = projections;
        self
    }

    pub fn with_comment(mut self, comment: &str) -> Self {
        self.comments.push(comment.to_string());
        self
    }

    pub fn with_hint(mut self, hint: HintContext) -> Self {
        self.hint = hint;
        self
    }

    pub fn with_generated_key(mut self, generated_key: GeneratedKeyContext) -> Self {
        self.generated_key = Some(generated_key);
        self
    }

    /// Condition values for `table.column`, matched case-insensitively
    pub fn condition_values(&self, table: &str, column: &str) -> Option<&[Value]> {
        self.conditions
            .iter()
            .find(|c| c.table.eq_ignore_ascii_case(table) && c.column.eq_ignore_ascii_case(column))
            .map(|c| c.values.as_slice())
    }

    pub fn references_table(&self, table: &str) -> bool {
        self.tables.iter().any(|t| t.eq_ignore_ascii_case(table))
    }
}
