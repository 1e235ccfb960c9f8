//! Pooled access to the named stores.
//!
//! One engine per named store, built once at startup and reused for the
//! process lifetime. The pool is the natural rate limiter: acquisition
//! beyond the high-water mark waits up to the configured deadline and then
//! surfaces as `StoreUnavailable`, which callers treat as backpressure.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use flowline_application::{NamedStoreHealth, PoolStats, StoreHealth, StoreHealthSource};
use flowline_core::config::{CoreConfig, StoreConfig};
use flowline_core::{CoreError, CoreResult};
use serde_json::{Map, Value};
use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{Column, PgPool, Postgres, Row, TypeInfo};

/// Minimum Postgres version (as `server_version_num`) with
/// `FOR UPDATE SKIP LOCKED`.
const SKIP_LOCKED_MIN_VERSION: i64 = 90500;

/// Logical name of one backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreName {
    /// Read-write queue and result store.
    Queue,
    /// Read-only source store.
    Source,
}

impl StoreName {
    /// Returns the stable configuration-facing name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queue => "queue_store",
            Self::Source => "source_store",
        }
    }
}

impl std::fmt::Display for StoreName {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

struct StoreHandle {
    pool: PgPool,
    read_only: bool,
    steady_size: u32,
    wait_timeouts: AtomicU64,
}

/// Shared pooled access to every configured store.
pub struct StoreAccess {
    query_timeout: Duration,
    queue: StoreHandle,
    source: Option<StoreHandle>,
}

impl StoreAccess {
    /// Connects a pool per configured store. Connections are verified
    /// before checkout and recycled after the configured max lifetime.
    pub async fn connect(config: &CoreConfig) -> CoreResult<Self> {
        let queue = Self::connect_store(StoreName::Queue, &config.queue_store, false).await?;
        let source = match &config.source_store {
            Some(store_config) => {
                Some(Self::connect_store(StoreName::Source, store_config, true).await?)
            }
            None => None,
        };

        Ok(Self {
            query_timeout: config.query_timeout,
            queue,
            source,
        })
    }

    async fn connect_store(
        store: StoreName,
        config: &StoreConfig,
        read_only: bool,
    ) -> CoreResult<StoreHandle> {
        let pool = PgPoolOptions::new()
            .min_connections(config.pool.size)
            .max_connections(config.pool.max_connections())
            .acquire_timeout(config.pool.acquire_timeout)
            .max_lifetime(config.pool.max_lifetime)
            .test_before_acquire(true)
            .connect(config.dsn.as_str())
            .await
            .map_err(|error| {
                CoreError::StoreUnavailable(format!("failed to connect to {store}: {error}"))
            })?;

        Ok(StoreHandle {
            pool,
            read_only,
            steady_size: config.pool.size,
            wait_timeouts: AtomicU64::new(0),
        })
    }

    fn handle(&self, store: StoreName) -> CoreResult<&StoreHandle> {
        match store {
            StoreName::Queue => Ok(&self.queue),
            StoreName::Source => self.source.as_ref().ok_or_else(|| {
                CoreError::StoreUnavailable("source_store is not configured".to_owned())
            }),
        }
    }

    /// The queue store pool, for adapters that run typed queries.
    #[must_use]
    pub fn queue_pool(&self) -> &PgPool {
        &self.queue.pool
    }

    /// Whether the named store is configured.
    #[must_use]
    pub fn is_configured(&self, store: StoreName) -> bool {
        match store {
            StoreName::Queue => true,
            StoreName::Source => self.source.is_some(),
        }
    }

    /// Whether the named store is declared read-only.
    pub fn is_read_only(&self, store: StoreName) -> CoreResult<bool> {
        Ok(self.handle(store)?.read_only)
    }

    /// Runs one store operation under the per-query deadline, mapping
    /// driver errors onto the core taxonomy.
    pub(crate) async fn run<T, F>(
        &self,
        store: StoreName,
        context: &str,
        operation: F,
    ) -> CoreResult<T>
    where
        F: Future<Output = Result<T, sqlx::Error>>,
    {
        let handle = self.handle(store)?;

        match tokio::time::timeout(self.query_timeout, operation).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => Err(map_store_error(handle, context, error)),
            Err(_) => Err(CoreError::QueryTimeout(format!(
                "{context}: deadline of {:?} elapsed",
                self.query_timeout
            ))),
        }
    }

    /// Runs one parameterized statement and returns its rows as JSON
    /// objects. Commits on success. Mutating statements against a
    /// read-only store fail with `ReadOnlyStore`.
    pub async fn execute(
        &self,
        store: StoreName,
        query: &str,
        params: &[Value],
    ) -> CoreResult<Vec<Value>> {
        let handle = self.handle(store)?;
        guard_read_only(store, handle.read_only, query)?;

        let statement = bind_params(sqlx::query(query), params)?;
        let rows = self
            .run(store, "execute statement", statement.fetch_all(&handle.pool))
            .await?;

        rows_to_json(&rows)
    }

    /// Runs multiple statements inside one transaction, rolling back on
    /// the first failure. Returns per-statement rows on success.
    pub async fn execute_tx(
        &self,
        store: StoreName,
        statements: &[(String, Vec<Value>)],
    ) -> CoreResult<Vec<Vec<Value>>> {
        let handle = self.handle(store)?;
        for (query, _) in statements {
            guard_read_only(store, handle.read_only, query)?;
        }

        let mut transaction = self
            .run(store, "begin transaction", handle.pool.begin())
            .await?;

        let mut results = Vec::with_capacity(statements.len());
        for (query, params) in statements {
            let statement = bind_params(sqlx::query(query.as_str()), params)?;
            // Rollback happens implicitly when the transaction guard drops
            // without a commit.
            let rows = self
                .run(
                    store,
                    "execute transactional statement",
                    statement.fetch_all(&mut *transaction),
                )
                .await?;
            results.push(rows_to_json(&rows)?);
        }

        self.run(store, "commit transaction", transaction.commit())
            .await?;

        Ok(results)
    }

    /// Times a trivial probe query against the store and reports the
    /// outcome together with pool counters.
    pub async fn health(&self, store: StoreName) -> StoreHealth {
        let pool = self.pool_stats(store).ok();
        let started = Instant::now();

        let probe = match self.handle(store) {
            Ok(handle) => {
                self.run(
                    store,
                    "health probe",
                    sqlx::query_scalar::<_, i64>("SELECT 1").fetch_one(&handle.pool),
                )
                .await
            }
            Err(error) => Err(error),
        };

        let response_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        match probe {
            Ok(_) => StoreHealth {
                connected: true,
                query_ok: true,
                response_ms,
                pool,
                detail: None,
            },
            Err(error) => {
                let connected = matches!(error, CoreError::QueryFailed(_));
                StoreHealth {
                    connected,
                    query_ok: false,
                    response_ms,
                    pool,
                    detail: Some(error.to_string()),
                }
            }
        }
    }

    /// Point-in-time pool counters for the named store.
    pub fn pool_stats(&self, store: StoreName) -> CoreResult<PoolStats> {
        let handle = self.handle(store)?;
        let size = handle.pool.size();
        let idle = u32::try_from(handle.pool.num_idle()).unwrap_or(u32::MAX);

        Ok(PoolStats {
            size,
            in_use: size.saturating_sub(idle),
            idle,
            overflow: size.saturating_sub(handle.steady_size),
            wait_count: handle.wait_timeouts.load(Ordering::Relaxed),
        })
    }

    /// Verifies the queue store supports skip-locked claiming. Must run at
    /// startup; an older server fails with `UnsupportedStore` rather than
    /// letting claims degrade to racy two-step selects.
    pub async fn verify_claim_support(&self) -> CoreResult<()> {
        let version: String = self
            .run(
                StoreName::Queue,
                "read server version",
                sqlx::query_scalar("SHOW server_version_num").fetch_one(self.queue_pool()),
            )
            .await?;

        let version_num: i64 = version.trim().parse().map_err(|error| {
            CoreError::UnsupportedStore(format!(
                "queue_store reported unreadable server version '{version}': {error}"
            ))
        })?;

        if version_num < SKIP_LOCKED_MIN_VERSION {
            return Err(CoreError::UnsupportedStore(format!(
                "queue_store server version {version_num} lacks FOR UPDATE SKIP LOCKED \
                 (requires at least {SKIP_LOCKED_MIN_VERSION})"
            )));
        }

        Ok(())
    }
}

#[async_trait]
impl StoreHealthSource for StoreAccess {
    async fn store_health(&self) -> Vec<NamedStoreHealth> {
        let mut stores = vec![NamedStoreHealth {
            name: StoreName::Queue.as_str().to_owned(),
            required: true,
            health: self.health(StoreName::Queue).await,
        }];

        if self.source.is_some() {
            stores.push(NamedStoreHealth {
                name: StoreName::Source.as_str().to_owned(),
                required: false,
                health: self.health(StoreName::Source).await,
            });
        }

        stores
    }
}

fn map_store_error(handle: &StoreHandle, context: &str, error: sqlx::Error) -> CoreError {
    if matches!(error, sqlx::Error::PoolTimedOut) {
        handle.wait_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    if is_transport_error(&error) {
        CoreError::StoreUnavailable(format!("{context}: {error}"))
    } else {
        CoreError::QueryFailed(format!("{context}: {error}"))
    }
}

/// Transport-level failures map to `StoreUnavailable`; everything else is
/// a semantic `QueryFailed`.
fn is_transport_error(error: &sqlx::Error) -> bool {
    matches!(
        error,
        sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
    )
}

fn guard_read_only(store: StoreName, read_only: bool, query: &str) -> CoreResult<()> {
    if read_only && statement_mutates(query) {
        return Err(CoreError::ReadOnlyStore(format!(
            "refusing to run a mutating statement against read-only store {store}"
        )));
    }

    Ok(())
}

/// Conservative keyword check used to guard read-only stores. A `WITH`
/// statement counts as mutating when any data-modifying keyword appears in
/// its body; the store role's grants remain the authoritative guard.
fn statement_mutates(query: &str) -> bool {
    let first = query
        .trim_start()
        .trim_start_matches('(')
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_ascii_uppercase();

    match first.as_str() {
        "SELECT" | "SHOW" | "EXPLAIN" | "TABLE" | "VALUES" => false,
        "WITH" => {
            let upper = query.to_ascii_uppercase();
            ["INSERT", "UPDATE", "DELETE", "TRUNCATE", "MERGE"]
                .iter()
                .any(|keyword| upper.contains(keyword))
        }
        _ => true,
    }
}

fn bind_params<'q>(
    mut statement: Query<'q, Postgres, PgArguments>,
    params: &'q [Value],
) -> CoreResult<Query<'q, Postgres, PgArguments>> {
    for param in params {
        statement = match param {
            Value::Null => statement.bind(None::<String>),
            Value::Bool(value) => statement.bind(*value),
            Value::Number(value) => {
                if let Some(value) = value.as_i64() {
                    statement.bind(value)
                } else if let Some(value) = value.as_f64() {
                    statement.bind(value)
                } else {
                    return Err(CoreError::QueryFailed(format!(
                        "numeric parameter {value} does not fit a supported store type"
                    )));
                }
            }
            Value::String(value) => statement.bind(value.as_str()),
            Value::Array(_) | Value::Object(_) => statement.bind(param.clone()),
        };
    }

    Ok(statement)
}

fn rows_to_json(rows: &[PgRow]) -> CoreResult<Vec<Value>> {
    rows.iter().map(row_to_json).collect()
}

fn row_to_json(row: &PgRow) -> CoreResult<Value> {
    let mut object = Map::with_capacity(row.columns().len());

    for column in row.columns() {
        let index = column.ordinal();
        let value = match column.type_info().name() {
            "BOOL" => row
                .try_get::<Option<bool>, _>(index)
                .map(|value| value.map_or(Value::Null, Value::Bool)),
            "INT2" => row
                .try_get::<Option<i16>, _>(index)
                .map(|value| value.map_or(Value::Null, |value| Value::from(i64::from(value)))),
            "INT4" => row
                .try_get::<Option<i32>, _>(index)
                .map(|value| value.map_or(Value::Null, |value| Value::from(i64::from(value)))),
            "INT8" => row
                .try_get::<Option<i64>, _>(index)
                .map(|value| value.map_or(Value::Null, Value::from)),
            "FLOAT4" => row
                .try_get::<Option<f32>, _>(index)
                .map(|value| value.map_or(Value::Null, |value| Value::from(f64::from(value)))),
            "FLOAT8" => row
                .try_get::<Option<f64>, _>(index)
                .map(|value| value.map_or(Value::Null, Value::from)),
            "JSON" | "JSONB" => row
                .try_get::<Option<Value>, _>(index)
                .map(|value| value.unwrap_or(Value::Null)),
            "UUID" => row
                .try_get::<Option<uuid::Uuid>, _>(index)
                .map(|value| value.map_or(Value::Null, |value| Value::from(value.to_string()))),
            "TIMESTAMPTZ" => row
                .try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(index)
                .map(|value| value.map_or(Value::Null, |value| Value::from(value.to_rfc3339()))),
            "TIMESTAMP" => row
                .try_get::<Option<chrono::NaiveDateTime>, _>(index)
                .map(|value| value.map_or(Value::Null, |value| Value::from(value.to_string()))),
            "DATE" => row
                .try_get::<Option<chrono::NaiveDate>, _>(index)
                .map(|value| value.map_or(Value::Null, |value| Value::from(value.to_string()))),
            _ => row
                .try_get::<Option<String>, _>(index)
                .map(|value| value.map_or(Value::Null, Value::from)),
        };

        let value = value.map_err(|error| {
            CoreError::QueryFailed(format!(
                "failed to decode column '{}': {error}",
                column.name()
            ))
        })?;

        object.insert(column.name().to_owned(), value);
    }

    Ok(Value::Object(object))
}
