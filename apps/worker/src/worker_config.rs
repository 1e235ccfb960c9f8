//! Environment-to-configuration assembly.
//!
//! The core consumes only the resolved [`CoreConfig`] record; this adapter
//! owns the lookup hierarchy. Each option is read first from a
//! flow-scoped name (`FLOW_<FLOW>_<OPTION>`), then from the plain global
//! name; environment-specific and base globals are layered by the
//! deployment through the process environment and `.env` files before the
//! process starts.

use std::env;
use std::fmt::Display;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use flowline_core::config::{
    CoreConfig, HealthThresholds, PoolConfig, StoreConfig, WorkerSettings,
};
use flowline_core::{CoreError, CoreResult, FlowName};
use tracing_subscriber::EnvFilter;

/// Resolved configuration for the worker binary: the core record plus the
/// HTTP adapter's listen address.
#[derive(Debug, Clone)]
pub struct WorkerAppConfig {
    /// The resolved core configuration record.
    pub core: CoreConfig,
    /// Health/metrics HTTP listen host.
    pub http_host: String,
    /// Health/metrics HTTP listen port.
    pub http_port: u16,
}

impl WorkerAppConfig {
    /// Assembles and validates the configuration from the environment.
    pub fn load() -> CoreResult<Self> {
        let flow_name = FlowName::new(required_env("FLOW_NAME")?)?;
        let scope = flow_env_scope(&flow_name);

        let queue_store = StoreConfig {
            dsn: required_env("QUEUE_STORE_DSN").or_else(|_| required_env("DATABASE_URL"))?,
            pool: pool_config(&scope, "QUEUE_STORE_POOL")?,
        };

        let source_store = match optional_env("SOURCE_STORE_DSN") {
            Some(dsn) => Some(StoreConfig {
                dsn,
                pool: pool_config(&scope, "SOURCE_STORE_POOL")?,
            }),
            None => None,
        };

        let worker = WorkerSettings {
            flow_name,
            batch_size: scoped_env(&scope, "BATCH_SIZE", 10)?,
            max_inflight: scoped_env(&scope, "MAX_INFLIGHT", 4)?,
            idle_backoff: Duration::from_millis(scoped_env(&scope, "IDLE_BACKOFF_MS", 1500)?),
            reap_interval: Duration::from_secs(scoped_env(&scope, "REAP_INTERVAL_S", 60)?),
            orphan_timeout: Duration::from_secs(scoped_env(&scope, "ORPHAN_TIMEOUT_S", 600)?),
            max_retries: scoped_env(&scope, "MAX_RETRIES", 3)?,
            shutdown_grace: Duration::from_secs(scoped_env(&scope, "SHUTDOWN_GRACE_S", 30)?),
        };

        let defaults = HealthThresholds::default();
        let health = HealthThresholds {
            failed_critical: scoped_env(&scope, "HEALTH_FAILED_CRITICAL", defaults.failed_critical)?,
            pending_warning: scoped_env(&scope, "HEALTH_PENDING_WARNING", defaults.pending_warning)?,
            success_warning_pct: scoped_env(
                &scope,
                "HEALTH_SUCCESS_WARNING_PCT",
                defaults.success_warning_pct,
            )?,
        };

        let config = Self {
            core: CoreConfig {
                queue_store,
                source_store,
                query_timeout: Duration::from_millis(scoped_env(&scope, "QUERY_TIMEOUT_MS", 30_000)?),
                worker,
                health,
            },
            http_host: optional_env("HTTP_HOST").unwrap_or_else(|| "127.0.0.1".to_owned()),
            http_port: scoped_env(&scope, "HTTP_PORT", 8080)?,
        };

        config.core.validate()?;
        Ok(config)
    }

    /// The HTTP adapter's socket address.
    pub fn socket_address(&self) -> CoreResult<SocketAddr> {
        let host = IpAddr::from_str(self.http_host.as_str()).map_err(|error| {
            CoreError::ConfigInvalid(format!("invalid HTTP_HOST '{}': {error}", self.http_host))
        })?;

        Ok(SocketAddr::new(host, self.http_port))
    }
}

/// Initializes the tracing subscriber once for the process.
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

fn pool_config(scope: &str, prefix: &str) -> CoreResult<PoolConfig> {
    let defaults = PoolConfig::default();

    Ok(PoolConfig {
        size: scoped_env(scope, &format!("{prefix}_SIZE"), defaults.size)?,
        max_overflow: scoped_env(scope, &format!("{prefix}_MAX_OVERFLOW"), defaults.max_overflow)?,
        acquire_timeout: Duration::from_millis(scoped_env(
            scope,
            &format!("{prefix}_ACQUIRE_TIMEOUT_MS"),
            u64::try_from(defaults.acquire_timeout.as_millis()).unwrap_or(10_000),
        )?),
        max_lifetime: Duration::from_secs(scoped_env(
            scope,
            &format!("{prefix}_MAX_LIFETIME_S"),
            defaults.max_lifetime.as_secs(),
        )?),
    })
}

/// Environment-name prefix for flow-scoped overrides, e.g. flow
/// `survey_scoring` reads `FLOW_SURVEY_SCORING_BATCH_SIZE` before
/// `BATCH_SIZE`.
fn flow_env_scope(flow_name: &FlowName) -> String {
    let normalized: String = flow_name
        .as_str()
        .chars()
        .map(|value| {
            if value.is_ascii_alphanumeric() {
                value.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();

    format!("FLOW_{normalized}")
}

fn required_env(name: &str) -> CoreResult<String> {
    optional_env(name).ok_or_else(|| CoreError::ConfigInvalid(format!("{name} is required")))
}

fn optional_env(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn scoped_env<T>(scope: &str, name: &str, default: T) -> CoreResult<T>
where
    T: FromStr,
    T::Err: Display,
{
    let value = optional_env(&format!("{scope}_{name}")).or_else(|| optional_env(name));

    match value {
        Some(value) => value.parse::<T>().map_err(|error| {
            CoreError::ConfigInvalid(format!("invalid {name} value '{value}': {error}"))
        }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use flowline_core::FlowName;

    use super::flow_env_scope;

    #[test]
    fn flow_scope_normalizes_to_env_name_characters() {
        let flow_name = match FlowName::new("survey-scoring.v2") {
            Ok(value) => value,
            Err(error) => panic!("flow name rejected: {error}"),
        };

        assert_eq!(flow_env_scope(&flow_name), "FLOW_SURVEY_SCORING_V2");
    }
}
