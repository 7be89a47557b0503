pub mod broadcast;
pub mod hint;
pub mod readwrite_splitting;
pub mod registry;
pub mod rule;
pub mod shadow;
pub mod sharding;

pub use hint::SqlHints;
pub use registry::{AlgorithmRegistry, LoadBalancer, ShadowAlgorithm, ShardingAlgorithm};
pub use rule::{RouteRule, RuleCategory, RuleSet};

use std::sync::Arc;

use crate::error::{KernelError, Result};
use crate::models::{BoundStatement, RouteContext, RouteMapper, RouteUnit};

/// Applies the rule set to a bound statement
///
/// Mandatory rules run first and resolve tables to data nodes. Tables left
/// uncovered are then routed as single tables. Optimizing rules finally
/// decorate the resolved data sources. The first rule producing candidates
/// seeds the route context; every later one narrows it.
pub struct RouteEngine {
    rule_set: Arc<RuleSet>,
}

impl RouteEngine {
    pub fn new(rule_set: Arc<RuleSet>) -> Self {
        Self { rule_set }
    }

    pub fn rule_set(&self) -> &RuleSet {
        &self.rule_set
    }

    pub fn route(&self, statement: &BoundStatement, in_transaction: bool) -> Result<RouteContext> {
        let mut context = RouteContext::new();
        let mut seeded = false;

        let (mandatory, optimizing): (Vec<&RouteRule>, Vec<&RouteRule>) = self
            .rule_set
            .rules()
            .iter()
            .partition(|rule| rule.category() == RuleCategory::Mandatory);

        for rule in mandatory {
            self.apply(rule, statement, in_transaction, &mut context, &mut seeded)?;
        }
        self.route_single_tables(statement, &mut context)?;
        for rule in optimizing {
            self.apply(rule, statement, in_transaction, &mut context, &mut seeded)?;
        }

        tracing::debug!(
            "Routed statement to {} units on {:?}",
            context.len(),
            context.actual_data_source_names()
        );
        Ok(context)
    }

    fn apply(
        &self,
        rule: &RouteRule,
        statement: &BoundStatement,
        in_transaction: bool,
        context: &mut RouteContext,
        seeded: &mut bool,
    ) -> Result<()> {
        let candidates = match rule.route(statement, context, in_transaction)? {
            Some(candidates) => candidates,
            None => return Ok(()),
        };
        if candidates.is_empty() {
            return Err(KernelError::RoutingFailure(format!(
                "{} rule produced no route units",
                rule.name()
            )));
        }

        if !*seeded && context.is_empty() {
            *context = RouteContext::from_units(candidates);
        } else {
            let existing = std::mem::take(context);
            *context = narrow(existing, candidates, rule.name())?;
        }
        *seeded = true;
        Ok(())
    }

    /// Route tables no rule covered to their single-table data source (or
    /// the default one). With an existing context only units on that data
    /// source survive.
    fn route_single_tables(&self, statement: &BoundStatement, context: &mut RouteContext) -> Result<()> {
        let mut uncovered: Vec<&str> = Vec::new();
        for table in &statement.tables {
            if !context.covers_table(table) && !uncovered.contains(&table.as_str()) {
                uncovered.push(table);
            }
        }

        if uncovered.is_empty() {
            if context.is_empty() {
                let data_source = self.fallback_data_source().ok_or_else(|| {
                    KernelError::RoutingFailure(
                        "statement references no table and no default data source is configured".to_string(),
                    )
                })?;
                context.add(RouteUnit::new(RouteMapper::identity(data_source), Vec::new()));
            }
            return Ok(());
        }

        for table in uncovered {
            let data_source = self
                .rule_set
                .single_table_data_source(table)
                .or_else(|| self.rule_set.default_data_source())
                .ok_or_else(|| {
                    KernelError::RoutingFailure(format!("no data source found for table '{}'", table))
                })?;

            if context.is_empty() {
                context.add(RouteUnit::new(
                    RouteMapper::identity(data_source),
                    vec![RouteMapper::identity(table)],
                ));
                continue;
            }

            let attached: Vec<RouteUnit> = context
                .route_units()
                .iter()
                .filter(|u| u.logic_data_source() == data_source || u.actual_data_source() == data_source)
                .cloned()
                .map(|mut unit| {
                    unit.table_mappers.push(RouteMapper::identity(table));
                    unit
                })
                .collect();
            if attached.is_empty() {
                return Err(KernelError::RoutingFailure(format!(
                    "table '{}' on data source '{}' cannot be combined with route targets {:?}",
                    table,
                    data_source,
                    context.actual_data_source_names()
                )));
            }
            *context = RouteContext::from_units(attached);
        }
        Ok(())
    }

    fn fallback_data_source(&self) -> Option<&str> {
        self.rule_set.default_data_source().or_else(|| {
            self.rule_set
                .broadcast_rule()
                .and_then(|rule| rule.data_sources().first())
                .map(String::as_str)
        })
    }
}

/// Intersect an existing context with a rule's candidates
///
/// A candidate pairs with an existing unit when its logical data source is
/// the unit's logical or actual data source. Units on either side without a
/// partner are dropped.
pub(crate) fn narrow(existing: RouteContext, candidates: Vec<RouteUnit>, rule: &str) -> Result<RouteContext> {
    let was_empty = existing.is_empty();
    let mut narrowed = RouteContext::new();

    for unit in existing.route_units() {
        for candidate in &candidates {
            let logic = candidate.logic_data_source();
            if logic != unit.logic_data_source() && logic != unit.actual_data_source() {
                continue;
            }
            let data_source = merge_data_source(&unit.data_source_mapper, &candidate.data_source_mapper)?;
            if let Some(tables) = merge_table_mappers(&unit.table_mappers, &candidate.table_mappers) {
                narrowed.add(RouteUnit::new(data_source, tables));
            }
        }
    }

    if narrowed.is_empty() && !was_empty {
        return Err(KernelError::RoutingFailure(format!(
            "{} rule shares no route target with {:?}",
            rule,
            existing.actual_data_source_names()
        )));
    }
    Ok(narrowed)
}

fn merge_data_source(existing: &RouteMapper, candidate: &RouteMapper) -> Result<RouteMapper> {
    // Chained or undecorated on either side
    if candidate.logic_name == existing.actual_name {
        return Ok(RouteMapper::new(&existing.logic_name, &candidate.actual_name));
    }
    // Same logical name, existing side already decorated
    if candidate.is_identity() || candidate.actual_name == existing.actual_name {
        return Ok(existing.clone());
    }
    Err(KernelError::AmbiguousRoute(format!(
        "data source '{}' resolves to both '{}' and '{}'",
        existing.logic_name, existing.actual_name, candidate.actual_name
    )))
}

fn merge_table_mappers(existing: &[RouteMapper], candidate: &[RouteMapper]) -> Option<Vec<RouteMapper>> {
    let mut merged = existing.to_vec();
    for mapper in candidate {
        match merged
            .iter_mut()
            .find(|m| m.logic_name.eq_ignore_ascii_case(&mapper.logic_name))
        {
            None => merged.push(mapper.clone()),
            Some(current) if current == mapper || mapper.is_identity() => {}
            Some(current) if current.is_identity() => *current = mapper.clone(),
            Some(_) => return None,
        }
    }
    Some(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        AlgorithmConfig, BroadcastRuleConfig, ColumnCondition, ReadwriteSplittingGroupConfig,
        ReadwriteSplittingRuleConfig, RuleConfig, ShadowDataSourceConfig, ShadowRuleConfig, ShadowTableConfig,
        ShardingRuleConfig, ShardingTableConfig, StatementKind, Value,
    };

    fn unit(logic: &str, actual: &str, tables: &[(&str, &str)]) -> RouteUnit {
        RouteUnit::new(
            RouteMapper::new(logic, actual),
            tables.iter().map(|(l, a)| RouteMapper::new(l, a)).collect(),
        )
    }

    fn engine(config: RuleConfig, default_data_source: Option<&str>) -> RouteEngine {
        let rule_set = RuleSet::from_config(&config, default_data_source.map(str::to_string)).unwrap();
        RouteEngine::new(Arc::new(rule_set))
    }

    fn sharding_config(nodes: &[&str]) -> ShardingRuleConfig {
        let mut config = ShardingRuleConfig::default();
        config.tables.insert(
            "t_order".to_string(),
            ShardingTableConfig {
                actual_data_nodes: nodes.iter().map(|n| n.to_string()).collect(),
                sharding_column: Some("user_id".to_string()),
                algorithm: Some("order_mod".to_string()),
            },
        );
        config
            .algorithms
            .insert("order_mod".to_string(), AlgorithmConfig::new("MOD", &[("sharding-count", "2")]));
        config
    }

    #[test]
    fn test_unsharded_statement_routes_to_default() {
        let engine = engine(RuleConfig::default(), Some("ds_default"));
        let statement = BoundStatement::new("SELECT * FROM t_user", StatementKind::Select).with_tables(&["t_user"]);
        let context = engine.route(&statement, false).unwrap();
        assert_eq!(context.len(), 1);
        assert_eq!(context.route_units()[0].actual_data_source(), "ds_default");
        assert_eq!(context.route_units()[0].actual_table("t_user"), "t_user");
    }

    #[test]
    fn test_statement_without_tables_uses_fallback() {
        let statement = BoundStatement::new("SELECT 1", StatementKind::Select);

        let context = engine(RuleConfig::default(), Some("ds_default")).route(&statement, false).unwrap();
        assert_eq!(context.actual_data_source_names(), vec!["ds_default"]);

        let config = RuleConfig {
            broadcast: Some(BroadcastRuleConfig {
                priority: None,
                tables: vec!["t_dict".to_string()],
                data_sources: vec!["ds_1".to_string(), "ds_2".to_string()],
            }),
            ..Default::default()
        };
        let context = engine(config, None).route(&statement, false).unwrap();
        assert_eq!(context.actual_data_source_names(), vec!["ds_1"]);

        let result = engine(RuleConfig::default(), None).route(&statement, false);
        assert!(matches!(result, Err(KernelError::RoutingFailure(_))));
    }

    #[test]
    fn test_unknown_table_without_default_fails() {
        let statement = BoundStatement::new("SELECT * FROM t_user", StatementKind::Select).with_tables(&["t_user"]);
        let result = engine(RuleConfig::default(), None).route(&statement, false);
        assert!(matches!(result, Err(KernelError::RoutingFailure(_))));
    }

    #[test]
    fn test_sharded_units_decorated_by_readwrite_splitting() {
        let config = RuleConfig {
            sharding: Some(sharding_config(&["rw_0.t_order_0", "ds_1.t_order_1"])),
            readwrite_splitting: Some(ReadwriteSplittingRuleConfig {
                priority: None,
                groups: vec![ReadwriteSplittingGroupConfig {
                    name: "rw_0".to_string(),
                    write_data_source: "write_0".to_string(),
                    read_data_sources: vec!["read_0".to_string()],
                    load_balancer: None,
                }],
                load_balancers: Default::default(),
            }),
            ..Default::default()
        };
        let engine = engine(config, None);

        let select = BoundStatement::new("SELECT * FROM t_order", StatementKind::Select).with_tables(&["t_order"]);
        let context = engine.route(&select, false).unwrap();
        assert_eq!(context.actual_data_source_names(), vec!["read_0", "ds_1"]);
        assert_eq!(context.route_units()[0].logic_data_source(), "rw_0");
        assert_eq!(context.route_units()[0].actual_table("t_order"), "t_order_0");

        let select = BoundStatement::new("SELECT * FROM t_order", StatementKind::Select).with_tables(&["t_order"]);
        let context = engine.route(&select, true).unwrap();
        assert_eq!(context.actual_data_source_names(), vec!["write_0", "ds_1"]);
    }

    #[test]
    fn test_shadow_comment_selects_shadow_target() {
        let mut shadow = ShadowRuleConfig::default();
        shadow
            .data_sources
            .push(ShadowDataSourceConfig::new("shadow_group", "ds_prod", "ds_shadow"));
        shadow.tables.insert(
            "t_user".to_string(),
            ShadowTableConfig {
                data_source_names: vec!["shadow_group".to_string()],
                algorithm_names: vec!["user_id_insert".to_string(), "hint".to_string()],
            },
        );
        shadow.algorithms.insert(
            "user_id_insert".to_string(),
            AlgorithmConfig::new(
                "VALUE_MATCH",
                &[("column", "user_id"), ("operation", "select"), ("value", "0")],
            ),
        );
        shadow
            .algorithms
            .insert("hint".to_string(), AlgorithmConfig::new("SQL_HINT", &[]));
        let mut config = RuleConfig {
            shadow: Some(shadow),
            ..Default::default()
        };
        config
            .single_tables
            .insert("t_user".to_string(), "shadow_group".to_string());
        let engine = engine(config, None);

        let statement = |comment: Option<&str>| {
            let statement = BoundStatement::new("SELECT * FROM t_user WHERE user_id = 1", StatementKind::Select)
                .with_tables(&["t_user"])
                .with_condition(ColumnCondition::new("t_user", "user_id", vec![Value::Int(1)]));
            match comment {
                Some(comment) => statement.with_comment(comment),
                None => statement,
            }
        };

        let context = engine.route(&statement(Some("/*shadow:true,foo:bar*/")), false).unwrap();
        assert_eq!(context.actual_data_source_names(), vec!["ds_shadow"]);
        assert_eq!(context.route_units()[0].logic_data_source(), "shadow_group");

        let context = engine.route(&statement(None), false).unwrap();
        assert_eq!(context.actual_data_source_names(), vec!["ds_prod"]);
    }

    #[test]
    fn test_broadcast_and_sharding_meet_per_data_source() {
        let config = RuleConfig {
            sharding: Some(sharding_config(&["ds_0.t_order_0", "ds_1.t_order_1"])),
            broadcast: Some(BroadcastRuleConfig {
                priority: None,
                tables: vec!["t_dict".to_string()],
                data_sources: vec!["ds_1".to_string(), "ds_2".to_string()],
            }),
            ..Default::default()
        };
        let statement = BoundStatement::new("SELECT * FROM t_order JOIN t_dict", StatementKind::Select)
            .with_tables(&["t_order", "t_dict"]);
        let context = engine(config, None).route(&statement, false).unwrap();
        assert_eq!(context.len(), 1);
        let unit = &context.route_units()[0];
        assert_eq!(unit.actual_data_source(), "ds_1");
        assert_eq!(unit.actual_table("t_order"), "t_order_1");
        assert!(unit.covers_table("t_dict"));
    }

    #[test]
    fn test_single_table_on_foreign_data_source_fails() {
        let mut config = RuleConfig {
            sharding: Some(sharding_config(&["ds_0.t_order_0", "ds_1.t_order_1"])),
            ..Default::default()
        };
        config.single_tables.insert("t_config".to_string(), "ds_9".to_string());
        let statement = BoundStatement::new("SELECT * FROM t_order JOIN t_config", StatementKind::Select)
            .with_tables(&["t_order", "t_config"]);
        let result = engine(config, None).route(&statement, false);
        assert!(matches!(result, Err(KernelError::RoutingFailure(_))));
    }

    #[test]
    fn test_single_table_keeps_matching_units() {
        let mut config = RuleConfig {
            sharding: Some(sharding_config(&["ds_0.t_order_0", "ds_1.t_order_1"])),
            ..Default::default()
        };
        config.single_tables.insert("t_config".to_string(), "ds_0".to_string());
        let statement = BoundStatement::new("SELECT * FROM t_order JOIN t_config", StatementKind::Select)
            .with_tables(&["t_order", "t_config"]);
        let context = engine(config, None).route(&statement, false).unwrap();
        assert_eq!(context.actual_data_source_names(), vec!["ds_0"]);
        assert!(context.covers_table("t_config"));
    }

    #[test]
    fn test_narrow_follows_chain_and_adopts_decoration() {
        let existing = RouteContext::from_units(vec![unit("group", "ds_a", &[("t", "t_0")])]);
        let narrowed = narrow(existing, vec![unit("ds_a", "ds_a_shadow", &[])], "shadow").unwrap();
        assert_eq!(narrowed.route_units()[0].data_source_mapper, RouteMapper::new("group", "ds_a_shadow"));
        assert_eq!(narrowed.route_units()[0].actual_table("t"), "t_0");

        let existing = RouteContext::from_units(vec![unit("group", "ds_a", &[("t", "t")])]);
        let narrowed = narrow(existing, vec![unit("group", "group", &[("t", "t_1")])], "sharding").unwrap();
        assert_eq!(narrowed.route_units()[0].data_source_mapper, RouteMapper::new("group", "ds_a"));
        assert_eq!(narrowed.route_units()[0].actual_table("t"), "t_1");
    }

    #[test]
    fn test_narrow_conflicting_decorations_are_ambiguous() {
        let existing = RouteContext::from_units(vec![unit("group", "ds_a", &[])]);
        let result = narrow(existing, vec![unit("group", "ds_b", &[])], "shadow");
        assert!(matches!(result, Err(KernelError::AmbiguousRoute(_))));
    }

    #[test]
    fn test_narrow_drops_conflicting_tables_and_fails_when_empty() {
        let existing = RouteContext::from_units(vec![
            unit("ds_0", "ds_0", &[("t", "t_0")]),
            unit("ds_0", "ds_0", &[("t", "t_1")]),
        ]);
        let narrowed = narrow(existing, vec![unit("ds_0", "ds_0", &[("t", "t_1")])], "sharding").unwrap();
        assert_eq!(narrowed.len(), 1);
        assert_eq!(narrowed.route_units()[0].actual_table("t"), "t_1");

        let existing = RouteContext::from_units(vec![unit("ds_0", "ds_0", &[])]);
        let result = narrow(existing, vec![unit("ds_1", "ds_1", &[])], "broadcast");
        assert!(matches!(result, Err(KernelError::RoutingFailure(_))));
    }
}
