use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{KernelError, Result};
use crate::models::{
    AlgorithmConfig, BoundStatement, ComputeInstanceConfig, ExecutionGroupContext, ExecutionUnit, ReportContext,
    SqlUnit, TrafficRuleConfig,
};
use crate::services::execute::{ConnectionManager, ExecutionPreparer};
use crate::services::route::{LoadBalancer, SqlHints};

/// Decides whether a statement is redirected to a compute instance
#[derive(Debug, Clone)]
pub enum TrafficAlgorithm {
    /// `use_traffic` hint on the statement or in a leading comment
    SqlHint,
    /// Normalised SQL text equal to one of the configured statements
    SqlMatch { statements: Vec<String> },
}

/// Lowercase, single-spaced, without a trailing semicolon
fn normalize_sql(sql: &str) -> String {
    sql.trim()
        .trim_end_matches(';')
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

impl TrafficAlgorithm {
    pub fn from_config(name: &str, config: &AlgorithmConfig) -> Result<Self> {
        match config.type_name.to_uppercase().as_str() {
            "SQL_HINT" => Ok(TrafficAlgorithm::SqlHint),
            "SQL_MATCH" => {
                let statements: Vec<String> = config
                    .prop("sql")
                    .unwrap_or_default()
                    .split(';')
                    .map(normalize_sql)
                    .filter(|s| !s.is_empty())
                    .collect();
                if statements.is_empty() {
                    return Err(KernelError::AlgorithmInitialization(format!(
                        "{}: SQL_MATCH requires the 'sql' property",
                        name
                    )));
                }
                Ok(TrafficAlgorithm::SqlMatch { statements })
            }
            other => Err(KernelError::AlgorithmInitialization(format!(
                "{}: unknown traffic algorithm type '{}'",
                name, other
            ))),
        }
    }

    pub fn matches(&self, statement: &BoundStatement) -> bool {
        match self {
            TrafficAlgorithm::SqlHint => {
                statement.hint.use_traffic || SqlHints::parse(&statement.comments).is_true("use_traffic")
            }
            TrafficAlgorithm::SqlMatch { statements } => {
                let sql = normalize_sql(&statement.sql);
                statements.iter().any(|s| *s == sql)
            }
        }
    }
}

#[derive(Debug)]
pub struct TrafficStrategy {
    pub name: String,
    pub labels: Vec<String>,
    algorithm: TrafficAlgorithm,
    load_balancer: Arc<LoadBalancer>,
}

#[derive(Debug, Default)]
pub struct TrafficRule {
    strategies: Vec<TrafficStrategy>,
    instances: Vec<ComputeInstanceConfig>,
}

impl TrafficRule {
    pub fn from_config(config: &TrafficRuleConfig) -> Result<Self> {
        let mut algorithms = HashMap::new();
        for (name, algorithm) in &config.algorithms {
            algorithms.insert(name.as_str(), TrafficAlgorithm::from_config(name, algorithm)?);
        }
        let mut load_balancers = HashMap::new();
        for (name, balancer) in &config.load_balancers {
            load_balancers.insert(name.as_str(), Arc::new(LoadBalancer::from_config(name, balancer)?));
        }

        let mut strategies = Vec::with_capacity(config.strategies.len());
        for strategy in &config.strategies {
            let algorithm = algorithms.get(strategy.algorithm.as_str()).cloned().ok_or_else(|| {
                KernelError::AlgorithmInitialization(format!(
                    "traffic strategy '{}' references unknown algorithm '{}'",
                    strategy.name, strategy.algorithm
                ))
            })?;
            let load_balancer = match &strategy.load_balancer {
                Some(name) => load_balancers.get(name.as_str()).cloned().ok_or_else(|| {
                    KernelError::AlgorithmInitialization(format!(
                        "traffic strategy '{}' references unknown load balancer '{}'",
                        strategy.name, name
                    ))
                })?,
                None => Arc::new(LoadBalancer::round_robin()),
            };
            strategies.push(TrafficStrategy {
                name: strategy.name.clone(),
                labels: strategy.labels.clone(),
                algorithm,
                load_balancer,
            });
        }

        Ok(Self {
            strategies,
            instances: config.instances.clone(),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    /// First strategy whose algorithm matches the statement
    pub fn find_strategy(&self, statement: &BoundStatement) -> Option<&TrafficStrategy> {
        self.strategies.iter().find(|s| s.algorithm.matches(statement))
    }

    /// Ids of instances carrying at least one label of the strategy
    pub fn instance_ids(&self, strategy: &TrafficStrategy) -> Vec<String> {
        self.instances
            .iter()
            .filter(|instance| instance.labels.iter().any(|label| strategy.labels.contains(label)))
            .map(|instance| instance.id.clone())
            .collect()
    }

    /// Compute instance the statement is redirected to, if any strategy
    /// matches. A `sticky` instance still eligible for the strategy is kept.
    pub fn route(&self, statement: &BoundStatement, sticky: Option<&str>) -> Result<Option<String>> {
        let Some(strategy) = self.find_strategy(statement) else {
            return Ok(None);
        };
        let candidates = self.instance_ids(strategy);
        if let Some(sticky) = sticky {
            if candidates.iter().any(|c| c == sticky) {
                return Ok(Some(sticky.to_string()));
            }
        }
        let instance = strategy.load_balancer.pick(&candidates).map_err(|_| {
            KernelError::RoutingFailure(format!(
                "no compute instance carries the labels {:?} of traffic strategy '{}'",
                strategy.labels, strategy.name
            ))
        })?;
        tracing::debug!("Traffic strategy '{}' redirects to instance {}", strategy.name, instance);
        Ok(Some(instance.to_string()))
    }
}

/// The unmodified statement as the only execution unit on `instance_id`
pub fn traffic_execution_unit(statement: &BoundStatement, instance_id: &str) -> ExecutionUnit {
    ExecutionUnit::new(
        instance_id,
        SqlUnit::new(statement.sql.clone(), statement.parameters.clone()),
    )
}

/// Prepare the redirected statement as a single input. A blank instance id
/// or statement yields no input at all.
pub async fn prepare_traffic<M: ConnectionManager>(
    preparer: &ExecutionPreparer,
    manager: &M,
    statement: &BoundStatement,
    instance_id: &str,
    report: ReportContext,
) -> Result<ExecutionGroupContext<M::Connection>> {
    if instance_id.trim().is_empty() || statement.sql.trim().is_empty() {
        return Err(KernelError::EmptyExecutionUnit(format!(
            "traffic to instance '{}' has no statement to run",
            instance_id
        )));
    }
    let unit = traffic_execution_unit(statement, instance_id);
    preparer.prepare(vec![unit], manager, report).await
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::models::{HintContext, StatementKind, TrafficStrategyConfig};
    use crate::services::execute::fixtures::MockConnectionManager;

    fn config() -> TrafficRuleConfig {
        TrafficRuleConfig {
            strategies: vec![
                TrafficStrategyConfig {
                    name: "hint_traffic".to_string(),
                    labels: vec!["OLAP".to_string()],
                    algorithm: "hint".to_string(),
                    load_balancer: None,
                },
                TrafficStrategyConfig {
                    name: "report_traffic".to_string(),
                    labels: vec!["REPORT".to_string()],
                    algorithm: "report_sql".to_string(),
                    load_balancer: Some("fixed".to_string()),
                },
            ],
            instances: vec![
                ComputeInstanceConfig {
                    id: "proxy_a".to_string(),
                    labels: vec!["OLAP".to_string()],
                },
                ComputeInstanceConfig {
                    id: "proxy_b".to_string(),
                    labels: vec!["OLAP".to_string(), "REPORT".to_string()],
                },
            ],
            algorithms: HashMap::from([
                ("hint".to_string(), AlgorithmConfig::new("SQL_HINT", &[])),
                (
                    "report_sql".to_string(),
                    AlgorithmConfig::new("SQL_MATCH", &[("sql", "SELECT * FROM t_report;SELECT 1")]),
                ),
            ]),
            load_balancers: HashMap::from([(
                "fixed".to_string(),
                AlgorithmConfig::new("FIXED", &[("value", "proxy_b")]),
            )]),
        }
    }

    #[test]
    fn test_sql_hint_traffic() {
        let rule = TrafficRule::from_config(&config()).unwrap();
        let hinted = BoundStatement::new("SELECT * FROM t_order", StatementKind::Select).with_hint(HintContext {
            use_traffic: true,
            write_route_only: false,
        });
        let plain = BoundStatement::new("SELECT * FROM t_order", StatementKind::Select);
        let commented = plain.clone().with_comment("/* use_traffic:true */");

        assert!(rule.route(&hinted, None).unwrap().is_some());
        assert!(rule.route(&commented, None).unwrap().is_some());
        assert!(rule.route(&plain, None).unwrap().is_none());
    }

    #[test]
    fn test_round_robin_over_labelled_instances() {
        let rule = TrafficRule::from_config(&config()).unwrap();
        let statement = BoundStatement::new("SELECT 2", StatementKind::Select).with_comment("/*use_traffic:true*/");
        let first = rule.route(&statement, None).unwrap().unwrap();
        let second = rule.route(&statement, None).unwrap().unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_sticky_instance_is_kept() {
        let rule = TrafficRule::from_config(&config()).unwrap();
        let statement = BoundStatement::new("SELECT 2", StatementKind::Select).with_comment("/*use_traffic:true*/");
        for _ in 0..3 {
            assert_eq!(rule.route(&statement, Some("proxy_a")).unwrap().as_deref(), Some("proxy_a"));
        }
    }

    #[test]
    fn test_sql_match_ignores_case_and_spacing() {
        let rule = TrafficRule::from_config(&config()).unwrap();
        let statement = BoundStatement::new("select *   from T_REPORT ;", StatementKind::Select);
        assert_eq!(rule.route(&statement, None).unwrap().as_deref(), Some("proxy_b"));
    }

    #[test]
    fn test_sql_match_requires_statements() {
        let result = TrafficAlgorithm::from_config("m", &AlgorithmConfig::new("SQL_MATCH", &[]));
        assert!(matches!(result, Err(KernelError::AlgorithmInitialization(_))));
    }

    #[tokio::test]
    async fn test_prepare_traffic_yields_single_input() {
        let manager = MockConnectionManager::new();
        let preparer = ExecutionPreparer::new(1, Duration::from_secs(1));
        let statement = BoundStatement::new("SELECT * FROM t_order WHERE id = $1", StatementKind::Select)
            .with_parameters(vec![crate::models::Value::Int(5)]);

        let context = prepare_traffic(&preparer, &manager, &statement, "proxy_a", ReportContext::new("logic_db"))
            .await
            .unwrap();
        assert_eq!(context.unit_count(), 1);
        let unit = &context.groups[0].units[0];
        assert_eq!(unit.data_source, "proxy_a");
        assert_eq!(unit.sql_unit.sql, statement.sql);
        assert_eq!(unit.sql_unit.parameters, statement.parameters);
    }

    #[tokio::test]
    async fn test_prepare_traffic_without_input() {
        let manager = MockConnectionManager::new();
        let preparer = ExecutionPreparer::new(1, Duration::from_secs(1));
        let statement = BoundStatement::new("SELECT 1", StatementKind::Select);

        let result = prepare_traffic(&preparer, &manager, &statement, " ", ReportContext::new("logic_db")).await;
        assert!(matches!(result, Err(KernelError::EmptyExecutionUnit(_))));

        let blank = BoundStatement::new("  ", StatementKind::Select);
        let result = prepare_traffic(&preparer, &manager, &blank, "proxy_a", ReportContext::new("logic_db")).await;
        assert!(matches!(result, Err(KernelError::EmptyExecutionUnit(_))));
    }

    #[test]
    fn test_rule_without_strategies_is_empty() {
        assert!(TrafficRule::default().is_empty());
        assert!(!TrafficRule::from_config(&config()).unwrap().is_empty());
    }
}
