use thiserror::Error;

/// Kernel error types
#[derive(Debug, Error)]
pub enum KernelError {
    #[error("Routing failure: {0}")]
    RoutingFailure(String),

    #[error("Ambiguous route: {0}")]
    AmbiguousRoute(String),

    #[error("Connection acquisition failed for data source '{data_source}': {message}")]
    ConnectionAcquisition { data_source: String, message: String },

    #[error("Execution failed on data source '{target}': {source}")]
    UnitExecution {
        target: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("{} execution units failed: {}", .0.len(), describe_failures(.0))]
    AggregateExecution(Vec<KernelError>),

    #[error("Execution on data source '{target}' exceeded {timeout_ms} ms")]
    ExecutionTimeout { target: String, timeout_ms: u64 },

    #[error("Cursor position error: {0}")]
    Position(String),

    #[error("Column index {index} out of range, result has {count} columns")]
    ColumnIndexOutOfRange { index: usize, count: usize },

    #[error("Empty execution unit: {0}")]
    EmptyExecutionUnit(String),

    #[error("Merge error: {0}")]
    Merge(String),

    #[error("Rewrite error: {0}")]
    Rewrite(String),

    #[error("Invalid data node '{0}', expected format is data_source.table")]
    InvalidDataNode(String),

    #[error("Algorithm initialization error: {0}")]
    AlgorithmInitialization(String),

    #[error("No column rule for '{table}.{column}'")]
    ColumnRuleNotFound { table: String, column: String },

    #[error("Illegal execution state: {0}")]
    IllegalState(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, KernelError>;

impl KernelError {
    /// Physical data source the error is attributed to, if any
    pub fn target(&self) -> Option<&str> {
        match self {
            KernelError::UnitExecution { target, .. }
            | KernelError::ExecutionTimeout { target, .. } => Some(target),
            KernelError::ConnectionAcquisition { data_source, .. } => Some(data_source),
            _ => None,
        }
    }
}

fn describe_failures(errors: &[KernelError]) -> String {
    errors
        .iter()
        .map(|e| match e.target() {
            Some(target) => format!("[{}] {}", target, e),
            None => e.to_string(),
        })
        .collect::<Vec<_>>()
        .join("; ")
}

/// Convert anyhow::Error to KernelError
impl From<anyhow::Error> for KernelError {
    fn from(err: anyhow::Error) -> Self {
        KernelError::Internal(err.to_string())
    }
}

/// Convert config::ConfigError to KernelError
impl From<config::ConfigError> for KernelError {
    fn from(err: config::ConfigError) -> Self {
        KernelError::Config(err.to_string())
    }
}
