use std::sync::Arc;

use super::registry::{AlgorithmRegistry, ShardingAlgorithm};
use crate::error::{KernelError, Result};
use crate::models::{BoundStatement, DataNode, RouteMapper, RouteUnit, ShardingRuleConfig};

pub const DEFAULT_SHARDING_PRIORITY: i32 = 0;

/// Logical table spread over several data nodes
#[derive(Debug, Clone)]
pub struct ShardingTable {
    pub logic_table: String,
    pub data_nodes: Vec<DataNode>,
    pub sharding_column: Option<String>,
    algorithm: Option<Arc<ShardingAlgorithm>>,
}

impl ShardingTable {
    /// Nodes selected by equality conditions on the sharding column, or all
    /// nodes when the statement has none
    fn route_nodes(&self, statement: &BoundStatement) -> Result<Vec<&DataNode>> {
        let (column, algorithm) = match (&self.sharding_column, &self.algorithm) {
            (Some(column), Some(algorithm)) => (column, algorithm),
            _ => return Ok(self.data_nodes.iter().collect()),
        };
        let values = match statement.condition_values(&self.logic_table, column) {
            Some(values) => values,
            None => return Ok(self.data_nodes.iter().collect()),
        };

        let mut nodes: Vec<&DataNode> = Vec::new();
        for value in values {
            let node = algorithm.do_sharding(&self.data_nodes, value)?;
            if !nodes.contains(&node) {
                nodes.push(node);
            }
        }
        Ok(nodes)
    }
}

#[derive(Debug, Clone)]
pub struct ShardingRule {
    pub priority: i32,
    tables: Vec<ShardingTable>,
}

impl ShardingRule {
    pub fn from_config(config: &ShardingRuleConfig, registry: &AlgorithmRegistry) -> Result<Self> {
        let mut tables = Vec::with_capacity(config.tables.len());
        for (logic_table, table) in &config.tables {
            if table.actual_data_nodes.is_empty() {
                return Err(KernelError::Config(format!(
                    "sharding table '{}' has no actual data nodes",
                    logic_table
                )));
            }
            let data_nodes = table
                .actual_data_nodes
                .iter()
                .map(|node| DataNode::parse(node))
                .collect::<Result<Vec<_>>>()?;
            let algorithm = match (&table.sharding_column, &table.algorithm) {
                (Some(_), Some(name)) => Some(registry.sharding(name)?),
                (None, None) => None,
                _ => {
                    return Err(KernelError::Config(format!(
                        "sharding table '{}' needs both a sharding column and an algorithm",
                        logic_table
                    )))
                }
            };
            tables.push(ShardingTable {
                logic_table: logic_table.to_lowercase(),
                data_nodes,
                sharding_column: table.sharding_column.clone(),
                algorithm,
            });
        }
        tables.sort_by(|a, b| a.logic_table.cmp(&b.logic_table));

        Ok(Self {
            priority: config.priority.unwrap_or(DEFAULT_SHARDING_PRIORITY),
            tables,
        })
    }

    pub fn find_table(&self, logic_table: &str) -> Option<&ShardingTable> {
        self.tables
            .iter()
            .find(|t| t.logic_table.eq_ignore_ascii_case(logic_table))
    }

    pub fn is_sharding_table(&self, logic_table: &str) -> bool {
        self.find_table(logic_table).is_some()
    }

    pub fn route(&self, statement: &BoundStatement) -> Result<Option<Vec<RouteUnit>>> {
        let mut routed: Vec<(&ShardingTable, Vec<&DataNode>)> = Vec::new();
        for logic_table in &statement.tables {
            let table = match self.find_table(logic_table) {
                Some(table) => table,
                None => continue,
            };
            if routed.iter().any(|(t, _)| t.logic_table == table.logic_table) {
                continue;
            }
            let nodes = table.route_nodes(statement)?;
            if nodes.is_empty() {
                return Err(KernelError::RoutingFailure(format!(
                    "no data node selected for sharding table '{}'",
                    table.logic_table
                )));
            }
            routed.push((table, nodes));
        }
        if routed.is_empty() {
            return Ok(None);
        }

        // Data sources in the order of the first table's nodes, restricted to
        // those hosting every sharded table of the statement
        let mut data_sources: Vec<&str> = Vec::new();
        for node in &routed[0].1 {
            let ds = node.data_source.as_str();
            if !data_sources.contains(&ds)
                && routed
                    .iter()
                    .all(|(_, nodes)| nodes.iter().any(|n| n.data_source == ds))
            {
                data_sources.push(ds);
            }
        }

        let mut units = Vec::new();
        for ds in data_sources {
            let mut combinations: Vec<Vec<RouteMapper>> = vec![Vec::new()];
            for (table, nodes) in &routed {
                let mut next = Vec::new();
                for combination in &combinations {
                    for node in nodes.iter().filter(|n| n.data_source == ds) {
                        let mut mappers = combination.clone();
                        mappers.push(RouteMapper::new(&table.logic_table, &node.table));
                        next.push(mappers);
                    }
                }
                combinations = next;
            }
            for mappers in combinations {
                units.push(RouteUnit::new(RouteMapper::identity(ds), mappers));
            }
        }

        if units.is_empty() {
            let names: Vec<&str> = routed.iter().map(|(t, _)| t.logic_table.as_str()).collect();
            return Err(KernelError::RoutingFailure(format!(
                "sharding tables {:?} share no data source",
                names
            )));
        }

        tracing::debug!("Sharding rule produced {} route units", units.len());
        Ok(Some(units))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AlgorithmConfig, ColumnCondition, RuleConfig, ShardingTableConfig, StatementKind, Value};

    fn rule() -> ShardingRule {
        let mut config = ShardingRuleConfig::default();
        config.tables.insert(
            "t_order".to_string(),
            ShardingTableConfig {
                actual_data_nodes: vec![
                    "ds_0.t_order_0".to_string(),
                    "ds_1.t_order_1".to_string(),
                ],
                sharding_column: Some("user_id".to_string()),
                algorithm: Some("order_mod".to_string()),
            },
        );
        config.tables.insert(
            "t_order_item".to_string(),
            ShardingTableConfig {
                actual_data_nodes: vec![
                    "ds_0.t_order_item_0".to_string(),
                    "ds_0.t_order_item_2".to_string(),
                    "ds_1.t_order_item_1".to_string(),
                ],
                sharding_column: None,
                algorithm: None,
            },
        );
        config
            .algorithms
            .insert("order_mod".to_string(), AlgorithmConfig::new("MOD", &[("sharding-count", "2")]));
        let rules = RuleConfig {
            sharding: Some(config.clone()),
            ..Default::default()
        };
        let registry = AlgorithmRegistry::from_config(&rules).unwrap();
        ShardingRule::from_config(&config, &registry).unwrap()
    }

    #[test]
    fn test_condition_selects_single_node() {
        let statement = BoundStatement::new("SELECT * FROM t_order WHERE user_id = 1", StatementKind::Select)
            .with_tables(&["t_order"])
            .with_condition(ColumnCondition::new("t_order", "user_id", vec![Value::Int(1)]));
        let units = rule().route(&statement).unwrap().unwrap();
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].actual_data_source(), "ds_1");
        assert_eq!(units[0].actual_table("t_order"), "t_order_1");
    }

    #[test]
    fn test_no_condition_routes_to_every_node() {
        let statement = BoundStatement::new("SELECT * FROM t_order", StatementKind::Select).with_tables(&["t_order"]);
        let units = rule().route(&statement).unwrap().unwrap();
        let sources: Vec<&str> = units.iter().map(|u| u.actual_data_source()).collect();
        assert_eq!(sources, vec!["ds_0", "ds_1"]);
    }

    #[test]
    fn test_multiple_tables_combine_per_data_source() {
        let statement = BoundStatement::new(
            "SELECT * FROM t_order o JOIN t_order_item i ON o.order_id = i.order_id",
            StatementKind::Select,
        )
        .with_tables(&["t_order", "t_order_item"]);
        let units = rule().route(&statement).unwrap().unwrap();
        // ds_0: 1 x 2 combinations, ds_1: 1 x 1
        assert_eq!(units.len(), 3);
        assert_eq!(units[0].actual_table("t_order_item"), "t_order_item_0");
        assert_eq!(units[1].actual_table("t_order_item"), "t_order_item_2");
        assert_eq!(units[2].actual_data_source(), "ds_1");
    }

    #[test]
    fn test_statement_without_sharding_tables_passes_through() {
        let statement = BoundStatement::new("SELECT * FROM t_config", StatementKind::Select).with_tables(&["t_config"]);
        assert!(rule().route(&statement).unwrap().is_none());
    }

    #[test]
    fn test_invalid_data_node_rejected() {
        let mut config = ShardingRuleConfig::default();
        config.tables.insert(
            "t_order".to_string(),
            ShardingTableConfig {
                actual_data_nodes: vec!["ds_0t_order_0".to_string()],
                sharding_column: None,
                algorithm: None,
            },
        );
        let result = ShardingRule::from_config(&config, &AlgorithmRegistry::default());
        assert!(matches!(result, Err(KernelError::InvalidDataNode(_))));
    }
}
