use regex::Regex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::hint::SqlHints;
use crate::error::{KernelError, Result};
use crate::models::{AlgorithmConfig, BoundStatement, DataNode, RuleConfig, StatementKind, Value};

/// Sharding algorithm mapping a sharding value to one data node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardingAlgorithm {
    /// `value mod sharding-count`
    Mod { sharding_count: u64 },
    /// `hash(value) mod sharding-count`
    HashMod { sharding_count: u64 },
}

impl ShardingAlgorithm {
    pub fn from_config(name: &str, config: &AlgorithmConfig) -> Result<Self> {
        let sharding_count = required_prop(name, config, "sharding-count")?
            .parse::<u64>()
            .ok()
            .filter(|count| *count > 0)
            .ok_or_else(|| {
                KernelError::AlgorithmInitialization(format!(
                    "{}: sharding-count must be a positive integer",
                    name
                ))
            })?;
        match config.type_name.to_uppercase().as_str() {
            "MOD" => Ok(ShardingAlgorithm::Mod { sharding_count }),
            "HASH_MOD" => Ok(ShardingAlgorithm::HashMod { sharding_count }),
            other => Err(KernelError::AlgorithmInitialization(format!(
                "{}: unknown sharding algorithm type '{}'",
                name, other
            ))),
        }
    }

    pub fn shard_index(&self, value: &Value) -> Result<u64> {
        match self {
            ShardingAlgorithm::Mod { sharding_count } => {
                let number = match value {
                    Value::Int(v) => *v,
                    Value::Text(s) => s.trim().parse::<i64>().map_err(|_| {
                        KernelError::RoutingFailure(format!("MOD sharding value '{}' is not an integer", s))
                    })?,
                    other => {
                        return Err(KernelError::RoutingFailure(format!(
                            "MOD sharding value of type {} is not supported",
                            other.type_name()
                        )))
                    }
                };
                Ok(number.rem_euclid(*sharding_count as i64) as u64)
            }
            ShardingAlgorithm::HashMod { sharding_count } => {
                if value.is_null() {
                    return Err(KernelError::RoutingFailure(
                        "HASH_MOD sharding value is NULL".to_string(),
                    ));
                }
                Ok(stable_hash(value.to_string().as_bytes()) % sharding_count)
            }
        }
    }

    /// Pick the node whose table (or data source) carries the `_<index>`
    /// suffix, falling back to the node at that position
    pub fn do_sharding<'a>(&self, nodes: &'a [DataNode], value: &Value) -> Result<&'a DataNode> {
        let index = self.shard_index(value)?;
        let suffix = format!("_{}", index);
        nodes
            .iter()
            .find(|node| node.table.ends_with(&suffix))
            .or_else(|| nodes.iter().find(|node| node.data_source.ends_with(&suffix)))
            .or_else(|| nodes.get(index as usize))
            .ok_or_else(|| {
                KernelError::RoutingFailure(format!(
                    "no data node for sharding value '{}' (shard {})",
                    value, index
                ))
            })
    }
}

// FNV-1a, stable across processes
fn stable_hash(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in bytes {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// Statement kind a column shadow algorithm applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShadowOperation {
    Insert,
    Update,
    Delete,
    Select,
}

impl ShadowOperation {
    fn parse(name: &str, text: &str) -> Result<Self> {
        match text.to_lowercase().as_str() {
            "insert" => Ok(ShadowOperation::Insert),
            "update" => Ok(ShadowOperation::Update),
            "delete" => Ok(ShadowOperation::Delete),
            "select" => Ok(ShadowOperation::Select),
            other => Err(KernelError::AlgorithmInitialization(format!(
                "{}: unknown shadow operation '{}'",
                name, other
            ))),
        }
    }

    fn matches(&self, kind: StatementKind) -> bool {
        matches!(
            (self, kind),
            (ShadowOperation::Insert, StatementKind::Insert)
                | (ShadowOperation::Update, StatementKind::Update)
                | (ShadowOperation::Delete, StatementKind::Delete)
                | (ShadowOperation::Select, StatementKind::Select)
        )
    }
}

/// Decides whether one shadow table access goes to the shadow data source
#[derive(Debug, Clone)]
pub enum ShadowAlgorithm {
    RegexMatch {
        column: String,
        operation: ShadowOperation,
        regex: Regex,
    },
    ValueMatch {
        column: String,
        operation: ShadowOperation,
        value: String,
    },
    /// Comment hint `shadow:true`
    SqlHint,
}

impl ShadowAlgorithm {
    pub fn from_config(name: &str, config: &AlgorithmConfig) -> Result<Self> {
        match config.type_name.to_uppercase().as_str() {
            "REGEX_MATCH" => {
                let pattern = required_prop(name, config, "regex")?;
                let regex = Regex::new(&format!("^(?:{})$", pattern)).map_err(|e| {
                    KernelError::AlgorithmInitialization(format!("{}: invalid regex: {}", name, e))
                })?;
                Ok(ShadowAlgorithm::RegexMatch {
                    column: required_prop(name, config, "column")?.to_string(),
                    operation: ShadowOperation::parse(name, required_prop(name, config, "operation")?)?,
                    regex,
                })
            }
            "VALUE_MATCH" => Ok(ShadowAlgorithm::ValueMatch {
                column: required_prop(name, config, "column")?.to_string(),
                operation: ShadowOperation::parse(name, required_prop(name, config, "operation")?)?,
                value: required_prop(name, config, "value")?.to_string(),
            }),
            "SQL_HINT" => Ok(ShadowAlgorithm::SqlHint),
            other => Err(KernelError::AlgorithmInitialization(format!(
                "{}: unknown shadow algorithm type '{}'",
                name, other
            ))),
        }
    }

    pub fn is_shadow(&self, statement: &BoundStatement, table: &str, hints: &SqlHints) -> bool {
        match self {
            ShadowAlgorithm::RegexMatch {
                column,
                operation,
                regex,
            } => {
                operation.matches(statement.kind)
                    && statement
                        .condition_values(table, column)
                        .map(|values| values.iter().any(|v| !v.is_null() && regex.is_match(&v.to_string())))
                        .unwrap_or(false)
            }
            ShadowAlgorithm::ValueMatch {
                column,
                operation,
                value,
            } => {
                operation.matches(statement.kind)
                    && statement
                        .condition_values(table, column)
                        .map(|values| values.iter().any(|v| !v.is_null() && v.to_string() == *value))
                        .unwrap_or(false)
            }
            ShadowAlgorithm::SqlHint => hints.is_true("shadow"),
        }
    }
}

/// Picks one data source (or instance) among candidates
#[derive(Debug)]
pub enum LoadBalancer {
    RoundRobin { counter: AtomicUsize },
    Fixed { value: String },
}

impl LoadBalancer {
    pub fn from_config(name: &str, config: &AlgorithmConfig) -> Result<Self> {
        match config.type_name.to_uppercase().as_str() {
            "ROUND_ROBIN" => Ok(LoadBalancer::RoundRobin {
                counter: AtomicUsize::new(0),
            }),
            "FIXED" => Ok(LoadBalancer::Fixed {
                value: required_prop(name, config, "value")?.to_string(),
            }),
            other => Err(KernelError::AlgorithmInitialization(format!(
                "{}: unknown load balancer type '{}'",
                name, other
            ))),
        }
    }

    pub fn round_robin() -> Self {
        LoadBalancer::RoundRobin {
            counter: AtomicUsize::new(0),
        }
    }

    pub fn pick<'a>(&self, candidates: &'a [String]) -> Result<&'a str> {
        if candidates.is_empty() {
            return Err(KernelError::RoutingFailure(
                "load balancer has no candidates".to_string(),
            ));
        }
        match self {
            LoadBalancer::RoundRobin { counter } => {
                let index = counter.fetch_add(1, Ordering::Relaxed) % candidates.len();
                Ok(&candidates[index])
            }
            LoadBalancer::Fixed { value } => candidates
                .iter()
                .find(|c| *c == value)
                .map(String::as_str)
                .ok_or_else(|| {
                    KernelError::RoutingFailure(format!(
                        "fixed load balancer target '{}' is not among {:?}",
                        value, candidates
                    ))
                }),
        }
    }
}

fn required_prop<'a>(name: &str, config: &'a AlgorithmConfig, key: &str) -> Result<&'a str> {
    config
        .prop(key)
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| {
            KernelError::AlgorithmInitialization(format!("{}: property '{}' is required", name, key))
        })
}

/// Algorithms of every route rule, instantiated once from configuration
#[derive(Debug, Default)]
pub struct AlgorithmRegistry {
    sharding: HashMap<String, Arc<ShardingAlgorithm>>,
    shadow: HashMap<String, Arc<ShadowAlgorithm>>,
    load_balancers: HashMap<String, Arc<LoadBalancer>>,
}

impl AlgorithmRegistry {
    pub fn from_config(config: &RuleConfig) -> Result<Self> {
        let mut registry = Self::default();

        if let Some(sharding) = &config.sharding {
            for (name, algorithm) in &sharding.algorithms {
                registry
                    .sharding
                    .insert(name.clone(), Arc::new(ShardingAlgorithm::from_config(name, algorithm)?));
            }
        }

        if let Some(shadow) = &config.shadow {
            for (name, algorithm) in &shadow.algorithms {
                registry
                    .shadow
                    .insert(name.clone(), Arc::new(ShadowAlgorithm::from_config(name, algorithm)?));
            }
        }

        if let Some(readwrite) = &config.readwrite_splitting {
            for (name, algorithm) in &readwrite.load_balancers {
                registry
                    .load_balancers
                    .insert(name.clone(), Arc::new(LoadBalancer::from_config(name, algorithm)?));
            }
        }

        tracing::debug!(
            "Algorithm registry loaded: {} sharding, {} shadow, {} load balancers",
            registry.sharding.len(),
            registry.shadow.len(),
            registry.load_balancers.len()
        );

        Ok(registry)
    }

    pub fn sharding(&self, name: &str) -> Result<Arc<ShardingAlgorithm>> {
        self.sharding.get(name).cloned().ok_or_else(|| missing("sharding", name))
    }

    pub fn shadow(&self, name: &str) -> Result<Arc<ShadowAlgorithm>> {
        self.shadow.get(name).cloned().ok_or_else(|| missing("shadow", name))
    }

    pub fn load_balancer(&self, name: &str) -> Result<Arc<LoadBalancer>> {
        self.load_balancers
            .get(name)
            .cloned()
            .ok_or_else(|| missing("load balancer", name))
    }
}

fn missing(kind: &str, name: &str) -> KernelError {
    KernelError::AlgorithmInitialization(format!("{} algorithm '{}' is not registered", kind, name))
}
