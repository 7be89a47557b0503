use std::collections::HashMap;
use std::sync::Arc;

use super::hint::SqlHints;
use super::registry::{AlgorithmRegistry, ShadowAlgorithm};
use crate::error::{KernelError, Result};
use crate::models::{BoundStatement, RouteContext, RouteMapper, RouteUnit, ShadowDataSourceConfig, ShadowRuleConfig};

pub const DEFAULT_SHADOW_PRIORITY: i32 = 20;

#[derive(Debug, Clone)]
struct ShadowTable {
    data_source_names: Vec<String>,
    algorithms: Vec<Arc<ShadowAlgorithm>>,
}

/// Redirects accesses of shadow tables from a production data source to its
/// shadow pair
#[derive(Debug, Clone)]
pub struct ShadowRule {
    pub priority: i32,
    data_sources: Vec<ShadowDataSourceConfig>,
    tables: HashMap<String, ShadowTable>,
}

impl ShadowRule {
    pub fn from_config(config: &ShadowRuleConfig, registry: &AlgorithmRegistry) -> Result<Self> {
        let mut tables = HashMap::new();
        for (name, table) in &config.tables {
            for ds in &table.data_source_names {
                if !config.data_sources.iter().any(|d| &d.name == ds) {
                    return Err(KernelError::Config(format!(
                        "shadow table '{}' references unknown shadow data source '{}'",
                        name, ds
                    )));
                }
            }
            let algorithms = table
                .algorithm_names
                .iter()
                .map(|algorithm| registry.shadow(algorithm))
                .collect::<Result<Vec<_>>>()?;
            tables.insert(
                name.to_lowercase(),
                ShadowTable {
                    data_source_names: table.data_source_names.clone(),
                    algorithms,
                },
            );
        }

        Ok(Self {
            priority: config.priority.unwrap_or(DEFAULT_SHADOW_PRIORITY),
            data_sources: config.data_sources.clone(),
            tables,
        })
    }

    pub fn is_shadow_table(&self, logic_table: &str) -> bool {
        self.tables.contains_key(&logic_table.to_lowercase())
    }

    fn find_data_source(&self, name: &str) -> Option<&ShadowDataSourceConfig> {
        self.data_sources
            .iter()
            .find(|d| d.name == name || d.production_data_source == name)
    }

    /// Shadow decision for every referenced shadow table bound to one shadow
    /// data source; all of them must agree
    fn resolve(
        &self,
        data_source: &ShadowDataSourceConfig,
        statement: &BoundStatement,
        hints: &SqlHints,
    ) -> Result<bool> {
        let mut decision: Option<(String, bool)> = None;
        for logic_table in &statement.tables {
            let table = match self.tables.get(&logic_table.to_lowercase()) {
                Some(table) if table.data_source_names.contains(&data_source.name) => table,
                _ => continue,
            };
            let is_shadow = table
                .algorithms
                .iter()
                .any(|algorithm| algorithm.is_shadow(statement, logic_table, hints));
            match &decision {
                Some((first, previous)) if *previous != is_shadow => {
                    return Err(KernelError::AmbiguousRoute(format!(
                        "tables '{}' and '{}' resolve to different targets behind shadow data source '{}'",
                        first, logic_table, data_source.name
                    )));
                }
                Some(_) => {}
                None => decision = Some((logic_table.clone(), is_shadow)),
            }
        }
        Ok(decision.map(|(_, shadow)| shadow).unwrap_or(false))
    }

    /// One candidate per existing unit: units on a shadow data source are
    /// mapped to the production or shadow target, others pass unchanged
    pub fn route(&self, statement: &BoundStatement, context: &RouteContext) -> Result<Option<Vec<RouteUnit>>> {
        if context.is_empty() || !statement.tables.iter().any(|t| self.is_shadow_table(t)) {
            return Ok(None);
        }
        let hints = SqlHints::parse(&statement.comments);
        if !hints.is_empty() {
            tracing::debug!("Shadow routing with SQL comments: {:?}", hints.entries());
        }

        let mut decisions: HashMap<&str, bool> = HashMap::new();
        let mut candidates = Vec::with_capacity(context.len());
        for unit in context.route_units() {
            let actual = unit.actual_data_source();
            let candidate = match self.find_data_source(actual) {
                Some(data_source) => {
                    let is_shadow = match decisions.get(data_source.name.as_str()) {
                        Some(decision) => *decision,
                        None => {
                            let decision = self.resolve(data_source, statement, &hints)?;
                            decisions.insert(data_source.name.as_str(), decision);
                            decision
                        }
                    };
                    let target = if is_shadow {
                        &data_source.shadow_data_source
                    } else {
                        &data_source.production_data_source
                    };
                    RouteMapper::new(actual, target)
                }
                None => RouteMapper::identity(actual),
            };
            candidates.push(RouteUnit::new(candidate, Vec::new()));
        }

        Ok(Some(candidates))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AlgorithmConfig, ColumnCondition, RuleConfig, ShadowTableConfig, StatementKind, Value};

    fn rule() -> ShadowRule {
        let mut config = ShadowRuleConfig::default();
        config.data_sources.push(ShadowDataSourceConfig::new(
            "shadow_group",
            "ds_0",
            "ds_0_shadow",
        ));
        config.tables.insert(
            "t_user".to_string(),
            ShadowTableConfig {
                data_source_names: vec!["shadow_group".to_string()],
                algorithm_names: vec!["user_id_match".to_string(), "sql_hint".to_string()],
            },
        );
        config.tables.insert(
            "t_order".to_string(),
            ShadowTableConfig {
                data_source_names: vec!["shadow_group".to_string()],
                algorithm_names: vec!["user_id_match".to_string()],
            },
        );
        config.algorithms.insert(
            "user_id_match".to_string(),
            AlgorithmConfig::new(
                "VALUE_MATCH",
                &[("column", "user_id"), ("operation", "select"), ("value", "1")],
            ),
        );
        config
            .algorithms
            .insert("sql_hint".to_string(), AlgorithmConfig::new("SQL_HINT", &[]));
        let rules = RuleConfig {
            shadow: Some(config.clone()),
            ..Default::default()
        };
        ShadowRule::from_config(&config, &AlgorithmRegistry::from_config(&rules).unwrap()).unwrap()
    }

    fn context() -> RouteContext {
        RouteContext::from_units(vec![RouteUnit::new(
            RouteMapper::identity("shadow_group"),
            vec![RouteMapper::identity("t_user")],
        )])
    }

    #[test]
    fn test_value_match_routes_to_shadow() {
        let statement = BoundStatement::new("SELECT * FROM t_user WHERE user_id = 1", StatementKind::Select)
            .with_tables(&["t_user"])
            .with_condition(ColumnCondition::new("t_user", "user_id", vec![Value::Int(1)]));
        let candidates = rule().route(&statement, &context()).unwrap().unwrap();
        assert_eq!(candidates[0].actual_data_source(), "ds_0_shadow");
    }

    #[test]
    fn test_hint_comment_routes_to_shadow() {
        let statement = BoundStatement::new("SELECT * FROM t_user WHERE user_id = 2", StatementKind::Select)
            .with_tables(&["t_user"])
            .with_comment("/*shadow:true,foo:bar*/")
            .with_condition(ColumnCondition::new("t_user", "user_id", vec![Value::Int(2)]));
        let candidates = rule().route(&statement, &context()).unwrap().unwrap();
        assert_eq!(candidates[0].actual_data_source(), "ds_0_shadow");

        let statement = BoundStatement::new("SELECT * FROM t_user WHERE user_id = 2", StatementKind::Select)
            .with_tables(&["t_user"])
            .with_condition(ColumnCondition::new("t_user", "user_id", vec![Value::Int(2)]));
        let candidates = rule().route(&statement, &context()).unwrap().unwrap();
        assert_eq!(candidates[0].actual_data_source(), "ds_0");
    }

    #[test]
    fn test_bound_table_case_is_ignored() {
        let mut statement = BoundStatement::new("SELECT * FROM T_USER", StatementKind::Select)
            .with_comment("/*shadow:true*/");
        statement.tables = vec!["T_USER".to_string()];
        let candidates = rule().route(&statement, &context()).unwrap().unwrap();
        assert_eq!(candidates[0].actual_data_source(), "ds_0_shadow");
    }

    #[test]
    fn test_conflicting_tables_are_ambiguous() {
        // t_user follows the hint, t_order has no hint algorithm
        let statement = BoundStatement::new("SELECT * FROM t_user, t_order", StatementKind::Select)
            .with_tables(&["t_user", "t_order"])
            .with_comment("/*shadow:true*/");
        let result = rule().route(&statement, &context());
        assert!(matches!(result, Err(KernelError::AmbiguousRoute(_))));
    }

    #[test]
    fn test_non_shadow_statement_passes_through() {
        let statement = BoundStatement::new("SELECT * FROM t_config", StatementKind::Select).with_tables(&["t_config"]);
        assert!(rule().route(&statement, &context()).unwrap().is_none());
    }

    #[test]
    fn test_unknown_shadow_data_source_rejected() {
        let mut config = ShadowRuleConfig::default();
        config.tables.insert(
            "t_user".to_string(),
            ShadowTableConfig {
                data_source_names: vec!["missing".to_string()],
                algorithm_names: vec![],
            },
        );
        assert!(ShadowRule::from_config(&config, &AlgorithmRegistry::default()).is_err());
    }
}
