use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{KernelError, Result};

/// Logical name mapped to the actual name it resolved to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RouteMapper {
    pub logic_name: String,
    pub actual_name: String,
}

impl RouteMapper {
    pub fn new(logic_name: &str, actual_name: &str) -> Self {
        Self {
            logic_name: logic_name.to_string(),
            actual_name: actual_name.to_string(),
        }
    }

    pub fn identity(name: &str) -> Self {
        Self::new(name, name)
    }

    pub fn is_identity(&self) -> bool {
        self.logic_name == self.actual_name
    }
}

/// One resolved data source plus the tables it covers
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RouteUnit {
    pub data_source_mapper: RouteMapper,
    pub table_mappers: Vec<RouteMapper>,
}

impl RouteUnit {
    pub fn new(data_source_mapper: RouteMapper, table_mappers: Vec<RouteMapper>) -> Self {
        Self {
            data_source_mapper,
            table_mappers,
        }
    }

    pub fn logic_data_source(&self) -> &str {
        &self.data_source_mapper.logic_name
    }

    pub fn actual_data_source(&self) -> &str {
        &self.data_source_mapper.actual_name
    }

    pub fn find_table_mapper(&self, logic_table: &str) -> Option<&RouteMapper> {
        self.table_mappers
            .iter()
            .find(|m| m.logic_name.eq_ignore_ascii_case(logic_table))
    }

    pub fn covers_table(&self, logic_table: &str) -> bool {
        self.find_table_mapper(logic_table).is_some()
    }

    /// Actual table name for a logical table, falling back to the logical name
    pub fn actual_table<'a>(&'a self, logic_table: &'a str) -> &'a str {
        self.find_table_mapper(logic_table)
            .map(|m| m.actual_name.as_str())
            .unwrap_or(logic_table)
    }
}

/// Ordered, deduplicated route units for one statement execution
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteContext {
    route_units: Vec<RouteUnit>,
}

impl RouteContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_units(units: Vec<RouteUnit>) -> Self {
        let mut context = Self::new();
        for unit in units {
            context.add(unit);
        }
        context
    }

    /// Add a unit unless an equal one is already present
    pub fn add(&mut self, unit: RouteUnit) -> bool {
        if self.route_units.contains(&unit) {
            return false;
        }
        self.route_units.push(unit);
        true
    }

    pub fn route_units(&self) -> &[RouteUnit] {
        &self.route_units
    }

    pub fn route_units_mut(&mut self) -> &mut Vec<RouteUnit> {
        &mut self.route_units
    }

    pub fn into_units(self) -> Vec<RouteUnit> {
        self.route_units
    }

    pub fn is_empty(&self) -> bool {
        self.route_units.is_empty()
    }

    pub fn len(&self) -> usize {
        self.route_units.len()
    }

    /// Distinct actual data source names in route order
    pub fn actual_data_source_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for unit in &self.route_units {
            let name = unit.actual_data_source();
            if !names.iter().any(|n| n == name) {
                names.push(name.to_string());
            }
        }
        names
    }

    pub fn covers_table(&self, logic_table: &str) -> bool {
        self.route_units.iter().any(|u| u.covers_table(logic_table))
    }
}

/// Physical location of a table: `data_source.table`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DataNode {
    pub data_source: String,
    pub table: String,
}

impl DataNode {
    pub fn new(data_source: &str, table: &str) -> Self {
        Self {
            data_source: data_source.to_string(),
            table: table.to_string(),
        }
    }

    /// Parse `ds.table` or `ds.schema.table` (the data source keeps the
    /// schema segment)
    pub fn parse(text: &str) -> Result<Self> {
        let invalid = || KernelError::InvalidDataNode(text.to_string());
        if text.contains(',') {
            return Err(invalid());
        }
        let segments: Vec<&str> = text.split('.').collect();
        let (data_source, table) = match segments.as_slice() {
            [ds, table] => (ds.to_string(), table.to_string()),
            [ds, schema, table] => (format!("{}.{}", ds, schema), table.to_string()),
            _ => return Err(invalid()),
        };
        if segments.iter().any(|s| s.trim().is_empty()) {
            return Err(invalid());
        }
        Ok(Self { data_source, table })
    }

    pub fn format(&self) -> String {
        format!("{}.{}", self.data_source, self.table)
    }
}

impl fmt::Display for DataNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.data_source, self.table)
    }
}
