use std::collections::HashMap;
use std::sync::Arc;

use super::registry::{AlgorithmRegistry, LoadBalancer};
use crate::error::{KernelError, Result};
use crate::models::{BoundStatement, ReadwriteSplittingRuleConfig, RouteContext, RouteMapper, RouteUnit};

pub const DEFAULT_READWRITE_SPLITTING_PRIORITY: i32 = 30;

#[derive(Debug, Clone)]
pub struct ReadwriteSplittingGroup {
    pub name: String,
    pub write_data_source: String,
    pub read_data_sources: Vec<String>,
    load_balancer: Arc<LoadBalancer>,
}

impl ReadwriteSplittingGroup {
    fn route_target(&self, statement: &BoundStatement, in_transaction: bool) -> Result<&str> {
        if !statement.kind.is_select()
            || statement.hint.write_route_only
            || in_transaction
            || self.read_data_sources.is_empty()
        {
            return Ok(&self.write_data_source);
        }
        self.load_balancer.pick(&self.read_data_sources)
    }
}

#[derive(Debug, Clone)]
pub struct ReadwriteSplittingRule {
    pub priority: i32,
    groups: Vec<ReadwriteSplittingGroup>,
}

impl ReadwriteSplittingRule {
    pub fn from_config(config: &ReadwriteSplittingRuleConfig, registry: &AlgorithmRegistry) -> Result<Self> {
        let mut groups = Vec::with_capacity(config.groups.len());
        for group in &config.groups {
            if group.write_data_source.trim().is_empty() {
                return Err(KernelError::Config(format!(
                    "readwrite-splitting group '{}' has no write data source",
                    group.name
                )));
            }
            let load_balancer = match &group.load_balancer {
                Some(name) => registry.load_balancer(name)?,
                None => Arc::new(LoadBalancer::round_robin()),
            };
            groups.push(ReadwriteSplittingGroup {
                name: group.name.clone(),
                write_data_source: group.write_data_source.clone(),
                read_data_sources: group.read_data_sources.clone(),
                load_balancer,
            });
        }

        Ok(Self {
            priority: config.priority.unwrap_or(DEFAULT_READWRITE_SPLITTING_PRIORITY),
            groups,
        })
    }

    fn find_group(&self, name: &str) -> Option<&ReadwriteSplittingGroup> {
        self.groups.iter().find(|g| g.name == name)
    }

    /// Decorates units on a readwrite-splitting group with the write or a read
    /// data source. One target is chosen per group for the whole statement.
    pub fn route(
        &self,
        statement: &BoundStatement,
        context: &RouteContext,
        in_transaction: bool,
    ) -> Result<Option<Vec<RouteUnit>>> {
        if context.is_empty()
            || !context
                .route_units()
                .iter()
                .any(|u| self.find_group(u.actual_data_source()).is_some())
        {
            return Ok(None);
        }

        let mut targets: HashMap<&str, &str> = HashMap::new();
        let mut candidates = Vec::with_capacity(context.len());
        for unit in context.route_units() {
            let actual = unit.actual_data_source();
            let mapper = match self.find_group(actual) {
                Some(group) => {
                    let target = match targets.get(group.name.as_str()) {
                        Some(target) => *target,
                        None => {
                            let target = group.route_target(statement, in_transaction)?;
                            targets.insert(group.name.as_str(), target);
                            target
                        }
                    };
                    RouteMapper::new(actual, target)
                }
                None => RouteMapper::identity(actual),
            };
            candidates.push(RouteUnit::new(mapper, Vec::new()));
        }

        Ok(Some(candidates))
    }
}
