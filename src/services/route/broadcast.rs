use crate::error::{KernelError, Result};
use crate::models::{BoundStatement, BroadcastRuleConfig, RouteContext, RouteMapper, RouteUnit};

pub const DEFAULT_BROADCAST_PRIORITY: i32 = 10;

/// Tables replicated on every configured data source
#[derive(Debug, Clone)]
pub struct BroadcastRule {
    pub priority: i32,
    tables: Vec<String>,
    data_sources: Vec<String>,
}

impl BroadcastRule {
    pub fn from_config(config: &BroadcastRuleConfig) -> Result<Self> {
        if !config.tables.is_empty() && config.data_sources.is_empty() {
            return Err(KernelError::Config(
                "broadcast rule declares tables but no data sources".to_string(),
            ));
        }
        Ok(Self {
            priority: config.priority.unwrap_or(DEFAULT_BROADCAST_PRIORITY),
            tables: config.tables.iter().map(|t| t.to_lowercase()).collect(),
            data_sources: config.data_sources.clone(),
        })
    }

    pub fn is_broadcast_table(&self, logic_table: &str) -> bool {
        self.tables.iter().any(|t| t.eq_ignore_ascii_case(logic_table))
    }

    pub fn data_sources(&self) -> &[String] {
        &self.data_sources
    }

    /// Every referenced table is a broadcast table
    pub fn is_all_broadcast(&self, statement: &BoundStatement) -> bool {
        !statement.tables.is_empty() && statement.tables.iter().all(|t| self.is_broadcast_table(t))
    }

    pub fn route(&self, statement: &BoundStatement, context: &RouteContext) -> Result<Option<Vec<RouteUnit>>> {
        let mut tables: Vec<RouteMapper> = Vec::new();
        for table in statement.tables.iter().filter(|t| self.is_broadcast_table(t)) {
            let mapper = RouteMapper::identity(table);
            if !tables.contains(&mapper) {
                tables.push(mapper);
            }
        }
        if tables.is_empty() {
            return Ok(None);
        }

        // A read of broadcast tables alone needs one replica; anything else
        // must meet the other tables wherever they live
        let data_sources: &[String] = if context.is_empty()
            && !statement.kind.is_write()
            && self.is_all_broadcast(statement)
        {
            &self.data_sources[..self.data_sources.len().min(1)]
        } else {
            &self.data_sources
        };

        Ok(Some(
            data_sources
                .iter()
                .map(|ds| RouteUnit::new(RouteMapper::identity(ds), tables.clone()))
                .collect(),
        ))
    }
}
