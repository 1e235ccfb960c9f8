//! Resolved typed configuration record handed to the core at startup.
//!
//! The core never reads files or the process environment; a thin adapter in
//! the embedding binary assembles this record (flow-specific override over
//! environment-specific global over base global) and passes the final
//! values here. [`CoreConfig::validate`] rejects out-of-range values with
//! [`CoreError::ConfigInvalid`] before anything connects to a store.

use std::time::Duration;

use crate::{CoreError, CoreResult, FlowName};

/// Connection pool sizing and lifecycle policy for one named store.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Steady-state pool size.
    pub size: u32,
    /// Burst capacity above the steady-state size.
    pub max_overflow: u32,
    /// Maximum wait to acquire a connection before the call fails with
    /// `StoreUnavailable`.
    pub acquire_timeout: Duration,
    /// Connection recycle age.
    pub max_lifetime: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 5,
            max_overflow: 5,
            acquire_timeout: Duration::from_secs(10),
            max_lifetime: Duration::from_secs(1800),
        }
    }
}

impl PoolConfig {
    /// Total connection ceiling: steady-state size plus burst overflow.
    #[must_use]
    pub fn max_connections(&self) -> u32 {
        self.size.saturating_add(self.max_overflow)
    }

    fn validate(&self, store: &str) -> CoreResult<()> {
        if self.size == 0 {
            return Err(CoreError::ConfigInvalid(format!(
                "{store}.pool.size must be greater than zero"
            )));
        }

        if self.acquire_timeout.is_zero() {
            return Err(CoreError::ConfigInvalid(format!(
                "{store}.pool.acquire_timeout must be greater than zero"
            )));
        }

        if self.max_lifetime.is_zero() {
            return Err(CoreError::ConfigInvalid(format!(
                "{store}.pool.max_lifetime must be greater than zero"
            )));
        }

        Ok(())
    }
}

/// Connection settings for one named store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Connection string understood by the store driver.
    pub dsn: String,
    /// Pool policy for this store.
    pub pool: PoolConfig,
}

impl StoreConfig {
    fn validate(&self, store: &str) -> CoreResult<()> {
        if self.dsn.trim().is_empty() {
            return Err(CoreError::ConfigInvalid(format!(
                "{store}.dsn must not be empty"
            )));
        }

        self.pool.validate(store)
    }
}

/// Pacing and sizing knobs for one worker loop.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Flow the loop claims from.
    pub flow_name: FlowName,
    /// Records claimed per tick.
    pub batch_size: usize,
    /// Concurrent handler invocations per batch.
    pub max_inflight: usize,
    /// Sleep applied when a claim returns no records.
    pub idle_backoff: Duration,
    /// Minimum time between orphan reaps.
    pub reap_interval: Duration,
    /// Age at which a `processing` row counts as an orphan.
    pub orphan_timeout: Duration,
    /// Retry ceiling consulted by `reset_failed`.
    pub max_retries: u32,
    /// Maximum wait for in-flight records on shutdown.
    pub shutdown_grace: Duration,
}

impl WorkerSettings {
    fn validate(&self) -> CoreResult<()> {
        if self.batch_size == 0 {
            return Err(CoreError::ConfigInvalid(
                "batch_size must be greater than zero".to_owned(),
            ));
        }

        if self.max_inflight == 0 {
            return Err(CoreError::ConfigInvalid(
                "max_inflight must be greater than zero".to_owned(),
            ));
        }

        if self.idle_backoff.is_zero() {
            return Err(CoreError::ConfigInvalid(
                "idle_backoff must be greater than zero".to_owned(),
            ));
        }

        if self.reap_interval.is_zero() {
            return Err(CoreError::ConfigInvalid(
                "reap_interval must be greater than zero".to_owned(),
            ));
        }

        if self.orphan_timeout.is_zero() {
            return Err(CoreError::ConfigInvalid(
                "orphan_timeout must be greater than zero".to_owned(),
            ));
        }

        if self.max_retries == 0 {
            return Err(CoreError::ConfigInvalid(
                "max_retries must be greater than zero".to_owned(),
            ));
        }

        Ok(())
    }
}

/// Tunable thresholds for the queue health assessment.
#[derive(Debug, Clone)]
pub struct HealthThresholds {
    /// Failed-row count above which the queue is reported unhealthy.
    pub failed_critical: u64,
    /// Pending-row count above which the queue is reported degraded.
    pub pending_warning: u64,
    /// One-hour success rate below which the queue is reported degraded.
    pub success_warning_pct: f64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            failed_critical: 100,
            pending_warning: 1000,
            success_warning_pct: 90.0,
        }
    }
}

impl HealthThresholds {
    fn validate(&self) -> CoreResult<()> {
        if !(0.0..=100.0).contains(&self.success_warning_pct) {
            return Err(CoreError::ConfigInvalid(format!(
                "health.success_warning_pct must be between 0 and 100, got {}",
                self.success_warning_pct
            )));
        }

        Ok(())
    }
}

/// The complete resolved configuration record.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Read-write queue and result store.
    pub queue_store: StoreConfig,
    /// Optional read-only source store available to handlers.
    pub source_store: Option<StoreConfig>,
    /// Default per-query deadline, independent of pool acquisition waits.
    pub query_timeout: Duration,
    /// Worker loop settings.
    pub worker: WorkerSettings,
    /// Queue health assessment thresholds.
    pub health: HealthThresholds,
}

impl CoreConfig {
    /// Validates every option, failing with `ConfigInvalid` on the first
    /// violation.
    pub fn validate(&self) -> CoreResult<()> {
        self.queue_store.validate("queue_store")?;

        if let Some(source_store) = &self.source_store {
            source_store.validate("source_store")?;
        }

        if self.query_timeout.is_zero() {
            return Err(CoreError::ConfigInvalid(
                "query_timeout must be greater than zero".to_owned(),
            ));
        }

        self.worker.validate()?;
        self.health.validate()
    }
}
