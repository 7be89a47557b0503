use sqlparser::ast::{
    visit_expressions_mut, visit_relations_mut, Expr, LimitClause, ObjectName, ObjectNamePart, Statement,
    Value as SqlValue,
};
use sqlparser::dialect::{Dialect, PostgreSqlDialect};
use sqlparser::parser::Parser;
use std::ops::ControlFlow;
use std::sync::Arc;

use crate::error::{KernelError, Result};
use crate::models::{BoundStatement, ExecutionUnit, Pagination, RouteContext, RouteUnit, SqlUnit, Value};

/// Produces the SQL one route unit executes. `push_down_pagination` is set
/// when the statement ends up on more than one execution unit.
pub trait StatementRewriter: Send + Sync {
    fn rewrite(&self, statement: &BoundStatement, route_unit: &RouteUnit, push_down_pagination: bool)
        -> Result<SqlUnit>;
}

/// Rewrites logical table names to actual ones and, when several targets
/// take part, pushes pagination down as `LIMIT offset + row_count`
pub struct IdentifierRewriter {
    dialect: Box<dyn Dialect + Send + Sync>,
}

impl IdentifierRewriter {
    pub fn new() -> Self {
        Self {
            dialect: Box::new(PostgreSqlDialect {}),
        }
    }

    pub fn with_dialect(dialect: Box<dyn Dialect + Send + Sync>) -> Self {
        Self { dialect }
    }

    fn parse(&self, sql: &str) -> Result<Vec<Statement>> {
        Parser::parse_sql(self.dialect.as_ref(), sql)
            .map_err(|e| KernelError::Rewrite(format!("Failed to parse SQL: {}", e)))
    }
}

impl Default for IdentifierRewriter {
    fn default() -> Self {
        Self::new()
    }
}

impl StatementRewriter for IdentifierRewriter {
    fn rewrite(
        &self,
        statement: &BoundStatement,
        route_unit: &RouteUnit,
        push_down_pagination: bool,
    ) -> Result<SqlUnit> {
        let rename_tables = route_unit.table_mappers.iter().any(|m| !m.is_identity());
        let pagination = statement.shape.pagination.filter(|_| push_down_pagination);
        if !rename_tables && pagination.is_none() {
            return Ok(SqlUnit::new(statement.sql.clone(), statement.parameters.clone()));
        }

        let mut statements = self.parse(&statement.sql)?;
        let mut parameters = statement.parameters.clone();

        if rename_tables {
            let _ = visit_relations_mut(&mut statements, |name: &mut ObjectName| {
                if let Some(ObjectNamePart::Identifier(ident)) = name.0.last_mut() {
                    if let Some(mapper) = route_unit.find_table_mapper(&ident.value) {
                        ident.value = mapper.actual_name.clone();
                    }
                }
                ControlFlow::<()>::Continue(())
            });
            // Columns qualified by a table name (`t_order.user_id`)
            let _ = visit_expressions_mut(&mut statements, |expr: &mut Expr| {
                if let Expr::CompoundIdentifier(idents) = expr {
                    if idents.len() >= 2 {
                        let owner = idents.len() - 2;
                        if let Some(mapper) = route_unit.find_table_mapper(&idents[owner].value) {
                            idents[owner].value = mapper.actual_name.clone();
                        }
                    }
                }
                ControlFlow::<()>::Continue(())
            });
        }

        if let Some(pagination) = pagination {
            for parsed in statements.iter_mut() {
                rewrite_pagination(parsed, &pagination, &mut parameters)?;
            }
        }

        let sql = statements
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        Ok(SqlUnit::new(sql, parameters))
    }
}

/// `LIMIT row_count OFFSET offset` becomes `LIMIT offset + row_count`; the
/// global offset is applied again after the merge
fn rewrite_pagination(statement: &mut Statement, pagination: &Pagination, parameters: &mut [Value]) -> Result<()> {
    let query = match statement {
        Statement::Query(query) => query,
        _ => return Ok(()),
    };
    let pushed_down = pagination.pushed_down_row_count();

    let replace_clause = match query.limit_clause.as_mut() {
        None => return Ok(()),
        Some(LimitClause::LimitOffset { limit, offset, .. }) => {
            let limit_placeholder = limit.as_ref().map(placeholder_index).transpose()?.flatten();
            let offset_placeholder = offset
                .as_ref()
                .map(|o| placeholder_index(&o.value))
                .transpose()?
                .flatten();

            if limit_placeholder.is_none() && offset_placeholder.is_none() {
                true
            } else {
                if let (Some(index), Some(count)) = (limit_placeholder, pushed_down) {
                    set_parameter(parameters, index, Value::Int(count as i64))?;
                } else if limit.is_some() {
                    *limit = pushed_down.map(number);
                }
                match offset_placeholder {
                    Some(index) => set_parameter(parameters, index, Value::Int(0))?,
                    None => *offset = None,
                }
                false
            }
        }
        Some(LimitClause::OffsetCommaLimit { .. }) => true,
    };

    if replace_clause {
        query.limit_clause = pushed_down.map(|count| LimitClause::LimitOffset {
            limit: Some(number(count)),
            offset: None,
            limit_by: vec![],
        });
    }
    Ok(())
}

fn number(value: u64) -> Expr {
    Expr::value(SqlValue::Number(value.to_string(), false))
}

/// Zero-based parameter index of a `$n` placeholder
fn placeholder_index(expr: &Expr) -> Result<Option<usize>> {
    let placeholder = match expr {
        Expr::Value(value) => match &value.value {
            SqlValue::Placeholder(placeholder) => placeholder,
            _ => return Ok(None),
        },
        _ => return Ok(None),
    };
    placeholder
        .strip_prefix('$')
        .and_then(|n| n.parse::<usize>().ok())
        .filter(|n| *n > 0)
        .map(|n| Some(n - 1))
        .ok_or_else(|| {
            KernelError::Rewrite(format!(
                "pagination placeholder '{}' cannot be rewritten, use numbered parameters",
                placeholder
            ))
        })
}

fn set_parameter(parameters: &mut [Value], index: usize, value: Value) -> Result<()> {
    let count = parameters.len();
    let slot = parameters.get_mut(index).ok_or_else(|| {
        KernelError::Rewrite(format!(
            "pagination parameter ${} is missing, {} parameters bound",
            index + 1,
            count
        ))
    })?;
    *slot = value;
    Ok(())
}

/// Builds one execution unit per route unit
pub struct ExecutionUnitBuilder {
    rewriter: Arc<dyn StatementRewriter>,
}

impl ExecutionUnitBuilder {
    pub fn new(rewriter: Arc<dyn StatementRewriter>) -> Self {
        Self { rewriter }
    }

    pub fn build(&self, statement: &BoundStatement, route_context: &RouteContext) -> Result<Vec<ExecutionUnit>> {
        if route_context.is_empty() {
            return Err(KernelError::EmptyExecutionUnit(
                "route context has no route units".to_string(),
            ));
        }
        let units = self.build_units(statement, route_context, false)?;
        // Route units may collapse into one execution unit; only several
        // remaining units need pagination pushed down
        if units.len() > 1 && statement.shape.pagination.is_some() {
            return self.build_units(statement, route_context, true);
        }
        Ok(units)
    }

    fn build_units(
        &self,
        statement: &BoundStatement,
        route_context: &RouteContext,
        push_down_pagination: bool,
    ) -> Result<Vec<ExecutionUnit>> {
        let mut units = Vec::with_capacity(route_context.len());
        for route_unit in route_context.route_units() {
            let sql_unit = self.rewriter.rewrite(statement, route_unit, push_down_pagination)?;
            let unit = ExecutionUnit::new(route_unit.actual_data_source(), sql_unit);
            if !units.contains(&unit) {
                tracing::debug!("Execution unit on {}: {}", unit.data_source, unit.sql_unit.sql);
                units.push(unit);
            }
        }
        Ok(units)
    }
}
