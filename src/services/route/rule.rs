use std::collections::HashMap;

use super::broadcast::BroadcastRule;
use super::readwrite_splitting::ReadwriteSplittingRule;
use super::registry::AlgorithmRegistry;
use super::shadow::ShadowRule;
use super::sharding::ShardingRule;
use crate::error::Result;
use crate::models::{BoundStatement, RouteContext, RouteUnit, RuleConfig};

/// Mandatory rules resolve tables to data nodes; optimizing rules decorate
/// data sources that are already resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RuleCategory {
    Mandatory,
    Optimizing,
}

#[derive(Debug, Clone)]
pub enum RouteRule {
    Sharding(ShardingRule),
    Shadow(ShadowRule),
    ReadwriteSplitting(ReadwriteSplittingRule),
    Broadcast(BroadcastRule),
}

impl RouteRule {
    pub fn name(&self) -> &'static str {
        match self {
            RouteRule::Sharding(_) => "sharding",
            RouteRule::Shadow(_) => "shadow",
            RouteRule::ReadwriteSplitting(_) => "readwrite_splitting",
            RouteRule::Broadcast(_) => "broadcast",
        }
    }

    /// Table-resolving rules come first; shadow and read/write splitting
    /// only rewrite data sources those rules already picked
    pub fn category(&self) -> RuleCategory {
        match self {
            RouteRule::Sharding(_) | RouteRule::Broadcast(_) => RuleCategory::Mandatory,
            RouteRule::Shadow(_) | RouteRule::ReadwriteSplitting(_) => RuleCategory::Optimizing,
        }
    }

    pub fn priority(&self) -> i32 {
        match self {
            RouteRule::Sharding(rule) => rule.priority,
            RouteRule::Shadow(rule) => rule.priority,
            RouteRule::ReadwriteSplitting(rule) => rule.priority,
            RouteRule::Broadcast(rule) => rule.priority,
        }
    }

    /// Candidate units for the statement, or `None` when the rule does not
    /// apply
    pub fn route(
        &self,
        statement: &BoundStatement,
        context: &RouteContext,
        in_transaction: bool,
    ) -> Result<Option<Vec<RouteUnit>>> {
        match self {
            RouteRule::Sharding(rule) => rule.route(statement),
            RouteRule::Shadow(rule) => rule.route(statement, context),
            RouteRule::ReadwriteSplitting(rule) => rule.route(statement, context, in_transaction),
            RouteRule::Broadcast(rule) => rule.route(statement, context),
        }
    }
}

/// Route rules of one logical database, sorted by `(category, priority)`
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<RouteRule>,
    single_tables: HashMap<String, String>,
    default_data_source: Option<String>,
}

impl RuleSet {
    pub fn new(
        mut rules: Vec<RouteRule>,
        single_tables: HashMap<String, String>,
        default_data_source: Option<String>,
    ) -> Self {
        rules.sort_by_key(|rule| (rule.category(), rule.priority()));
        Self {
            rules,
            single_tables: single_tables
                .into_iter()
                .map(|(table, ds)| (table.to_lowercase(), ds))
                .collect(),
            default_data_source,
        }
    }

    pub fn from_config(config: &RuleConfig, default_data_source: Option<String>) -> Result<Self> {
        let registry = AlgorithmRegistry::from_config(config)?;
        let mut rules = Vec::new();

        if let Some(sharding) = &config.sharding {
            rules.push(RouteRule::Sharding(ShardingRule::from_config(sharding, &registry)?));
        }
        if let Some(broadcast) = &config.broadcast {
            rules.push(RouteRule::Broadcast(BroadcastRule::from_config(broadcast)?));
        }
        if let Some(shadow) = &config.shadow {
            rules.push(RouteRule::Shadow(ShadowRule::from_config(shadow, &registry)?));
        }
        if let Some(readwrite) = &config.readwrite_splitting {
            rules.push(RouteRule::ReadwriteSplitting(ReadwriteSplittingRule::from_config(
                readwrite, &registry,
            )?));
        }

        let rule_set = Self::new(rules, config.single_tables.clone(), default_data_source);
        tracing::info!(
            "Loaded rule set: [{}], {} single tables, default data source {:?}",
            rule_set
                .rules
                .iter()
                .map(|r| r.name())
                .collect::<Vec<_>>()
                .join(", "),
            rule_set.single_tables.len(),
            rule_set.default_data_source
        );
        Ok(rule_set)
    }

    pub fn rules(&self) -> &[RouteRule] {
        &self.rules
    }

    pub fn single_table_data_source(&self, logic_table: &str) -> Option<&str> {
        self.single_tables
            .get(&logic_table.to_lowercase())
            .map(String::as_str)
    }

    pub fn default_data_source(&self) -> Option<&str> {
        self.default_data_source.as_deref()
    }

    pub fn broadcast_rule(&self) -> Option<&BroadcastRule> {
        self.rules.iter().find_map(|rule| match rule {
            RouteRule::Broadcast(rule) => Some(rule),
            _ => None,
        })
    }

    pub fn sharding_rule(&self) -> Option<&ShardingRule> {
        self.rules.iter().find_map(|rule| match rule {
            RouteRule::Sharding(rule) => Some(rule),
            _ => None,
        })
    }

    /// Whether update counts of all units must be summed. Statements on
    /// broadcast or single tables report the count of one unit.
    pub fn is_accumulate(&self, statement: &BoundStatement) -> bool {
        match self.sharding_rule() {
            Some(rule) => statement.tables.iter().any(|t| rule.is_sharding_table(t)),
            None => false,
        }
    }
}
