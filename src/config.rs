use serde::Deserialize;
use std::env;
use std::path::Path;
use std::time::Duration;

use crate::models::{Collation, RuleConfig};

#[derive(Debug, Clone, Deserialize)]
pub struct KernelConfig {
    pub database_name: String,
    pub execution: ExecutionConfig,
    pub routing: RoutingConfig,
    pub merge: MergeConfig,
    pub transaction: TransactionConfig,
    pub logging: LoggingConfig,
    #[serde(default)]
    pub data_sources: Vec<DataSourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionConfig {
    pub max_connections_per_query: usize,
    pub worker_pool_size: usize,
    pub failure_policy: FailurePolicy,
    pub connection_acquire_timeout_ms: u64,
    #[serde(default)]
    pub unit_timeout_ms: Option<u64>,
}

/// How unit failures are surfaced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Abort on the first failure and discard in-flight results
    #[default]
    FailFast,
    /// Run every unit and report all failures together
    CollectAll,
}

impl FailurePolicy {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "fail_fast" => Some(FailurePolicy::FailFast),
            "collect_all" => Some(FailurePolicy::CollectAll),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoutingConfig {
    #[serde(default)]
    pub default_data_source: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MergeConfig {
    pub collation: Collation,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransactionConfig {
    pub implicit_commit: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub style: String,
}

/// Physical data source reachable through the PostgreSQL pool manager
#[derive(Debug, Clone, Deserialize)]
pub struct DataSourceConfig {
    pub name: String,
    pub url: String,
}

impl ExecutionConfig {
    pub fn connection_acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_acquire_timeout_ms)
    }

    pub fn unit_timeout(&self) -> Option<Duration> {
        self.unit_timeout_ms.map(Duration::from_millis)
    }
}

impl KernelConfig {
    fn builder() -> Result<config::ConfigBuilder<config::builder::DefaultState>, config::ConfigError> {
        config::Config::builder()
            .set_default("database_name", "logic_db")?
            .set_default("execution.max_connections_per_query", 1)?
            .set_default("execution.worker_pool_size", num_cpus::get() as i64)?
            .set_default("execution.failure_policy", "fail_fast")?
            .set_default("execution.connection_acquire_timeout_ms", 30_000)?
            .set_default("merge.collation", "binary")?
            .set_default("transaction.implicit_commit", true)?
            .set_default("logging.level", "info")?
            .set_default("logging.style", "auto")?
            .set_default("routing.default_data_source", None::<String>)
    }

    fn apply_env(
        mut builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<config::ConfigBuilder<config::builder::DefaultState>, config::ConfigError> {
        // Try to load from .env file
        let _ = dotenv::dotenv();

        if let Ok(max) = env::var("PROXY_MAX_CONNECTIONS_PER_QUERY") {
            let max = max.parse::<u64>().map_err(|e| {
                config::ConfigError::Message(format!("PROXY_MAX_CONNECTIONS_PER_QUERY: {}", e))
            })?;
            builder = builder.set_override("execution.max_connections_per_query", max)?;
        }

        if let Ok(size) = env::var("PROXY_WORKER_POOL_SIZE") {
            let size = size.parse::<u64>().map_err(|e| {
                config::ConfigError::Message(format!("PROXY_WORKER_POOL_SIZE: {}", e))
            })?;
            builder = builder.set_override("execution.worker_pool_size", size)?;
        }

        if let Ok(policy) = env::var("PROXY_FAILURE_POLICY") {
            builder = builder.set_override("execution.failure_policy", policy)?;
        }

        if let Ok(data_source) = env::var("PROXY_DEFAULT_DATA_SOURCE") {
            builder = builder.set_override("routing.default_data_source", Some(data_source))?;
        }

        if let Ok(log_level) = env::var("RUST_LOG") {
            builder = builder.set_override("logging.level", log_level)?;
        }

        if let Ok(log_style) = env::var("RUST_LOG_STYLE") {
            builder = builder.set_override("logging.style", log_style)?;
        }

        Ok(builder)
    }

    pub fn from_env() -> Result<Self, config::ConfigError> {
        let builder = Self::apply_env(Self::builder()?)?;
        builder.build()?.try_deserialize::<Self>()?.validated()
    }

    /// Load a configuration file (format by extension) on top of the
    /// defaults; environment variables still win
    pub fn from_file(path: &Path) -> Result<Self, config::ConfigError> {
        let builder = Self::builder()?.add_source(config::File::from(path));
        let builder = Self::apply_env(builder)?;
        builder.build()?.try_deserialize::<Self>()?.validated()
    }

    fn validated(self) -> Result<Self, config::ConfigError> {
        if self.execution.max_connections_per_query == 0 {
            return Err(config::ConfigError::Message(
                "execution.max_connections_per_query must be at least 1".to_string(),
            ));
        }
        if self.execution.worker_pool_size == 0 {
            return Err(config::ConfigError::Message(
                "execution.worker_pool_size must be at least 1".to_string(),
            ));
        }
        Ok(self)
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            database_name: "logic_db".to_string(),
            execution: ExecutionConfig {
                max_connections_per_query: 1,
                worker_pool_size: num_cpus::get(),
                failure_policy: FailurePolicy::FailFast,
                connection_acquire_timeout_ms: 30_000,
                unit_timeout_ms: None,
            },
            routing: RoutingConfig {
                default_data_source: None,
            },
            merge: MergeConfig {
                collation: Collation::Binary,
            },
            transaction: TransactionConfig {
                implicit_commit: true,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                style: "auto".to_string(),
            },
            data_sources: Vec::new(),
        }
    }
}

/// Load a rule configuration document (YAML, TOML or JSON by extension)
pub fn load_rule_config(path: &Path) -> Result<RuleConfig, config::ConfigError> {
    config::Config::builder()
        .add_source(config::File::from(path))
        .build()?
        .try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_config_defaults() {
        // Clear environment variables for this test
        env::remove_var("PROXY_MAX_CONNECTIONS_PER_QUERY");
        env::remove_var("PROXY_FAILURE_POLICY");
        env::remove_var("PROXY_DEFAULT_DATA_SOURCE");

        let config = KernelConfig::from_env();
        assert!(config.is_ok());

        let config = config.unwrap();
        assert_eq!(config.database_name, "logic_db");
        assert_eq!(config.execution.max_connections_per_query, 1);
        assert_eq!(config.execution.failure_policy, FailurePolicy::FailFast);
        assert_eq!(config.merge.collation, Collation::Binary);
        assert!(config.transaction.implicit_commit);
        assert!(config.routing.default_data_source.is_none());
    }

    #[test]
    fn test_config_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
database_name = "sharding_db"

[execution]
max_connections_per_query = 4
failure_policy = "collect_all"
unit_timeout_ms = 500

[routing]
default_data_source = "ds_0"

[merge]
collation = "case_insensitive"

[[data_sources]]
name = "ds_0"
url = "postgresql://app@localhost:5432/ds_0"
"#
        )
        .unwrap();

        let config = KernelConfig::from_file(file.path()).unwrap();
        assert_eq!(config.database_name, "sharding_db");
        assert_eq!(config.execution.max_connections_per_query, 4);
        assert_eq!(config.execution.failure_policy, FailurePolicy::CollectAll);
        assert_eq!(config.execution.unit_timeout(), Some(Duration::from_millis(500)));
        assert_eq!(config.routing.default_data_source.as_deref(), Some("ds_0"));
        assert_eq!(config.merge.collation, Collation::CaseInsensitive);
        assert_eq!(config.data_sources.len(), 1);
    }

    #[test]
    fn test_zero_connection_budget_rejected() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[execution]\nmax_connections_per_query = 0").unwrap();
        assert!(KernelConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn test_failure_policy_parsing() {
        assert_eq!(FailurePolicy::from_str("collect-all"), Some(FailurePolicy::CollectAll));
        assert_eq!(FailurePolicy::from_str("FAIL_FAST"), Some(FailurePolicy::FailFast));
        assert_eq!(FailurePolicy::from_str("retry"), None);
    }

    #[test]
    fn test_load_rule_config() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            r#"
single_tables:
  t_config: ds_0
sharding:
  tables:
    t_order:
      actual_data_nodes: ["ds_0.t_order_0", "ds_1.t_order_1"]
      sharding_column: user_id
      algorithm: order_mod
  algorithms:
    order_mod:
      type: MOD
broadcast:
  tables: [t_dict]
  data_sources: [ds_0, ds_1]
"#
        )
        .unwrap();

        let rules = load_rule_config(file.path()).unwrap();
        assert_eq!(rules.single_tables.get("t_config").map(String::as_str), Some("ds_0"));
        let sharding = rules.sharding.unwrap();
        assert_eq!(sharding.tables["t_order"].actual_data_nodes.len(), 2);
        assert_eq!(sharding.algorithms["order_mod"].type_name, "MOD");
        assert_eq!(rules.broadcast.unwrap().data_sources, vec!["ds_0", "ds_1"]);
        assert!(rules.shadow.is_none());
    }
}
