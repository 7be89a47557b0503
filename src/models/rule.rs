use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Named algorithm: `type` plus string properties
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlgorithmConfig {
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub props: HashMap<String, String>,
}

impl AlgorithmConfig {
    pub fn new(type_name: &str, props: &[(&str, &str)]) -> Self {
        Self {
            type_name: type_name.to_string(),
            props: props
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    pub fn prop(&self, key: &str) -> Option<&str> {
        self.props.get(key).map(String::as_str)
    }
}

/// Full rule configuration of one logical database
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Unsharded table -> data source
    #[serde(default)]
    pub single_tables: HashMap<String, String>,
    #[serde(default)]
    pub sharding: Option<ShardingRuleConfig>,
    #[serde(default)]
    pub shadow: Option<ShadowRuleConfig>,
    #[serde(default)]
    pub readwrite_splitting: Option<ReadwriteSplittingRuleConfig>,
    #[serde(default)]
    pub broadcast: Option<BroadcastRuleConfig>,
    #[serde(default)]
    pub mask: Option<MaskRuleConfig>,
    #[serde(default)]
    pub traffic: Option<TrafficRuleConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShardingRuleConfig {
    #[serde(default)]
    pub priority: Option<i32>,
    pub tables: HashMap<String, ShardingTableConfig>,
    #[serde(default)]
    pub algorithms: HashMap<String, AlgorithmConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardingTableConfig {
    /// `ds.table` entries
    pub actual_data_nodes: Vec<String>,
    #[serde(default)]
    pub sharding_column: Option<String>,
    #[serde(default)]
    pub algorithm: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShadowRuleConfig {
    #[serde(default)]
    pub priority: Option<i32>,
    pub data_sources: Vec<ShadowDataSourceConfig>,
    pub tables: HashMap<String, ShadowTableConfig>,
    #[serde(default)]
    pub algorithms: HashMap<String, AlgorithmConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShadowDataSourceConfig {
    pub name: String,
    pub production_data_source: String,
    pub shadow_data_source: String,
}

impl ShadowDataSourceConfig {
    pub fn new(name: &str, production: &str, shadow: &str) -> Self {
        Self {
            name: name.to_string(),
            production_data_source: production.to_string(),
            shadow_data_source: shadow.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShadowTableConfig {
    /// Names of `ShadowDataSourceConfig` entries
    pub data_source_names: Vec<String>,
    pub algorithm_names: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReadwriteSplittingRuleConfig {
    #[serde(default)]
    pub priority: Option<i32>,
    pub groups: Vec<ReadwriteSplittingGroupConfig>,
    #[serde(default)]
    pub load_balancers: HashMap<String, AlgorithmConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadwriteSplittingGroupConfig {
    pub name: String,
    pub write_data_source: String,
    pub read_data_sources: Vec<String>,
    #[serde(default)]
    pub load_balancer: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BroadcastRuleConfig {
    #[serde(default)]
    pub priority: Option<i32>,
    pub tables: Vec<String>,
    pub data_sources: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MaskRuleConfig {
    /// table -> column -> algorithm name
    pub tables: HashMap<String, HashMap<String, String>>,
    #[serde(default)]
    pub algorithms: HashMap<String, AlgorithmConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrafficRuleConfig {
    pub strategies: Vec<TrafficStrategyConfig>,
    #[serde(default)]
    pub instances: Vec<ComputeInstanceConfig>,
    #[serde(default)]
    pub algorithms: HashMap<String, AlgorithmConfig>,
    #[serde(default)]
    pub load_balancers: HashMap<String, AlgorithmConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficStrategyConfig {
    pub name: String,
    pub labels: Vec<String>,
    pub algorithm: String,
    #[serde(default)]
    pub load_balancer: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputeInstanceConfig {
    pub id: String,
    #[serde(default)]
    pub labels: Vec<String>,
}
