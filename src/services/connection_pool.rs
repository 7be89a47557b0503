use bytes::BytesMut;
use deadpool_postgres::{Config as PoolConfig, ManagerConfig, Object, Pool, RecyclingMethod};
use std::collections::HashMap;
use std::error::Error as StdError;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};
use tokio_postgres::{NoTls, Row};

use crate::config::DataSourceConfig;
use crate::error::{KernelError, Result};
use crate::models::{
    ColumnMetadata, ConnectionMode, ExecutionUnit, MemoryQueryResult, QueryResult, QueryResultMetadata, UpdateResult,
    Value,
};
use crate::services::execute::{ConnectionManager, StorageExecutor};

/// Maintains one PostgreSQL pool per physical data source.
/// Pools are created lazily on first acquisition.
pub struct PostgresConnectionManager {
    urls: HashMap<String, String>,
    pools: Arc<RwLock<HashMap<String, Pool>>>,
    max_pool_size: usize,
}

impl PostgresConnectionManager {
    pub fn new(data_sources: &[DataSourceConfig]) -> Self {
        Self {
            urls: data_sources
                .iter()
                .map(|ds| (ds.name.clone(), ds.url.clone()))
                .collect(),
            pools: Arc::new(RwLock::new(HashMap::new())),
            max_pool_size: 16,
        }
    }

    pub fn with_max_pool_size(mut self, max_pool_size: usize) -> Self {
        self.max_pool_size = max_pool_size.max(1);
        self
    }

    /// Get or create the pool of a data source. Safe to call concurrently.
    pub async fn get_or_create_pool(&self, data_source: &str) -> Result<Pool> {
        {
            let pools = self.pools.read().await;
            if let Some(pool) = pools.get(data_source) {
                return Ok(pool.clone());
            }
        }

        let url = self.urls.get(data_source).ok_or_else(|| KernelError::ConnectionAcquisition {
            data_source: data_source.to_string(),
            message: "data source is not configured".to_string(),
        })?;

        let mut pools = self.pools.write().await;
        // Another task may have created it while we waited for the lock
        if let Some(pool) = pools.get(data_source) {
            return Ok(pool.clone());
        }

        tracing::info!(
            "Creating connection pool for data source {} at {} (max_size: {})",
            data_source,
            Self::redact_url(url),
            self.max_pool_size
        );

        let mut cfg = PoolConfig::new();
        cfg.url = Some(url.clone());
        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        let pool = cfg
            .create_pool(Some(deadpool_postgres::Runtime::Tokio1), NoTls)
            .map_err(|e| {
                tracing::error!("Failed to create connection pool for {}: {}", data_source, e);
                KernelError::ConnectionAcquisition {
                    data_source: data_source.to_string(),
                    message: format!("failed to create connection pool: {}", e),
                }
            })?;
        pool.resize(self.max_pool_size);

        pools.insert(data_source.to_string(), pool.clone());
        Ok(pool)
    }

    /// Scheme, host, port and database of a data source URL, without user
    /// info
    fn redact_url(url: &str) -> String {
        match url::Url::parse(url) {
            Ok(parsed) => {
                let host = parsed.host_str().unwrap_or_default();
                match parsed.port() {
                    Some(port) => format!("{}://{}:{}{}", parsed.scheme(), host, port, parsed.path()),
                    None => format!("{}://{}{}", parsed.scheme(), host, parsed.path()),
                }
            }
            Err(_) => "[unparseable url]".to_string(),
        }
    }
}

#[async_trait::async_trait]
impl ConnectionManager for PostgresConnectionManager {
    type Connection = Object;

    async fn acquire_connection(&self, data_source: &str) -> anyhow::Result<Object> {
        let pool = self.get_or_create_pool(data_source).await?;
        let connection = pool
            .get()
            .await
            .map_err(|e| anyhow::anyhow!("failed to get connection from pool: {}", e))?;
        Ok(connection)
    }

    async fn release(&self, connection: Object) {
        // Dropping the object hands it back to its pool
        drop(connection);
    }
}

impl ToSql for Value {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> std::result::Result<IsNull, Box<dyn StdError + Sync + Send>> {
        match self {
            Value::Null => Ok(IsNull::Yes),
            Value::Bool(v) => v.to_sql(ty, out),
            Value::Int(v) => match *ty {
                Type::INT2 => i16::try_from(*v)?.to_sql(ty, out),
                Type::INT4 => i32::try_from(*v)?.to_sql(ty, out),
                Type::FLOAT4 => (*v as f32).to_sql(ty, out),
                Type::FLOAT8 => (*v as f64).to_sql(ty, out),
                _ => v.to_sql(ty, out),
            },
            Value::Float(v) => match *ty {
                Type::FLOAT4 => (*v as f32).to_sql(ty, out),
                _ => v.to_sql(ty, out),
            },
            Value::Text(v) => v.to_sql(ty, out),
            Value::Bytes(v) => v.to_sql(ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

fn describe_error(e: tokio_postgres::Error) -> anyhow::Error {
    match e.as_db_error() {
        Some(db_error) => anyhow::anyhow!(
            "Code: {}, Message: {}",
            db_error.code().code(),
            db_error.message()
        ),
        None => anyhow::Error::new(e),
    }
}

fn row_value(row: &Row, idx: usize) -> Value {
    let ty = row.columns()[idx].type_();
    let value = match *ty {
        Type::INT2 => row.try_get::<_, Option<i16>>(idx).map(|v| v.map(|v| Value::Int(v.into()))),
        Type::INT4 => row.try_get::<_, Option<i32>>(idx).map(|v| v.map(|v| Value::Int(v.into()))),
        Type::INT8 => row.try_get::<_, Option<i64>>(idx).map(|v| v.map(Value::Int)),
        Type::FLOAT4 => row.try_get::<_, Option<f32>>(idx).map(|v| v.map(|v| Value::Float(v.into()))),
        Type::FLOAT8 => row.try_get::<_, Option<f64>>(idx).map(|v| v.map(Value::Float)),
        Type::BOOL => row.try_get::<_, Option<bool>>(idx).map(|v| v.map(Value::Bool)),
        Type::BYTEA => row.try_get::<_, Option<Vec<u8>>>(idx).map(|v| v.map(Value::Bytes)),
        Type::TIMESTAMP => row
            .try_get::<_, Option<chrono::NaiveDateTime>>(idx)
            .map(|v| v.map(|v| Value::Text(v.to_string()))),
        Type::TIMESTAMPTZ => row
            .try_get::<_, Option<chrono::DateTime<chrono::Utc>>>(idx)
            .map(|v| v.map(|v| Value::Text(v.to_rfc3339()))),
        Type::DATE => row
            .try_get::<_, Option<chrono::NaiveDate>>(idx)
            .map(|v| v.map(|v| Value::Text(v.to_string()))),
        _ => row.try_get::<_, Option<String>>(idx).map(|v| v.map(Value::Text)),
    };
    match value {
        Ok(Some(value)) => value,
        Ok(None) => Value::Null,
        // Types without a text form show their type name
        Err(_) => Value::Text(format!("<{}>", ty.name())),
    }
}

fn parameters(unit: &ExecutionUnit) -> Vec<&(dyn ToSql + Sync)> {
    unit.sql_unit
        .parameters
        .iter()
        .map(|p| p as &(dyn ToSql + Sync))
        .collect()
}

/// Runs execution units on pooled PostgreSQL connections
#[derive(Debug, Default)]
pub struct PostgresStorageExecutor;

#[async_trait::async_trait]
impl StorageExecutor<Object> for PostgresStorageExecutor {
    async fn query(
        &self,
        connection: &mut Object,
        unit: &ExecutionUnit,
        mode: ConnectionMode,
    ) -> anyhow::Result<Box<dyn QueryResult>> {
        let statement = connection
            .prepare(&unit.sql_unit.sql)
            .await
            .map_err(describe_error)?;
        let metadata = QueryResultMetadata::new(
            statement
                .columns()
                .iter()
                .map(|c| ColumnMetadata::new(c.name()))
                .collect(),
        );
        let params = parameters(unit);
        let rows = connection
            .query(&statement, &params)
            .await
            .map_err(describe_error)?;
        tracing::debug!(
            "Query on {} returned {} rows ({:?})",
            unit.data_source,
            rows.len(),
            mode
        );

        let rows = rows
            .iter()
            .map(|row| (0..row.len()).map(|idx| row_value(row, idx)).collect())
            .collect();
        Ok(Box::new(MemoryQueryResult::new(metadata, rows)))
    }

    async fn update(
        &self,
        connection: &mut Object,
        unit: &ExecutionUnit,
        _mode: ConnectionMode,
    ) -> anyhow::Result<UpdateResult> {
        let params = parameters(unit);
        let count = connection
            .execute(unit.sql_unit.sql.as_str(), &params)
            .await
            .map_err(describe_error)?;
        Ok(UpdateResult::new(count))
    }
}
