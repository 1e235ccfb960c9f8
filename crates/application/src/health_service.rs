//! Health and metrics composition.
//!
//! Assembles store probes, queue counters, and the in-process worker
//! metrics into serializable documents. The assessments are deliberately
//! infallible: a store that cannot even answer a status query surfaces as
//! `unhealthy`, not as an error the caller has to special-case.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flowline_core::CoreResult;
use flowline_core::config::HealthThresholds;
use serde::Serialize;

use crate::metrics::WorkerMetrics;
use crate::queue_ports::{QueueRepository, QueueStatus, TopError};

/// Counters of one store connection pool.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PoolStats {
    /// Connections currently open.
    pub size: u32,
    /// Connections checked out right now.
    pub in_use: u32,
    /// Open connections sitting idle.
    pub idle: u32,
    /// Open connections above the steady-state pool size.
    pub overflow: u32,
    /// Acquisition attempts that timed out waiting for a connection.
    pub wait_count: u64,
}

/// Probe result for one named store.
#[derive(Debug, Clone, Serialize)]
pub struct StoreHealth {
    /// Whether a connection could be acquired.
    pub connected: bool,
    /// Whether the trivial probe query succeeded.
    pub query_ok: bool,
    /// Probe round-trip time in milliseconds.
    pub response_ms: u64,
    /// Pool counters, when the adapter exposes them.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool: Option<PoolStats>,
    /// Failure description when the probe did not succeed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl StoreHealth {
    /// Whether the store answered its probe.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.connected && self.query_ok
    }
}

/// A store probe result labelled with the store's name and whether the
/// system can function without it.
#[derive(Debug, Clone, Serialize)]
pub struct NamedStoreHealth {
    /// Logical store name, e.g. `queue_store`.
    pub name: String,
    /// Whether overall health turns unhealthy when this store is down.
    pub required: bool,
    /// Probe result.
    pub health: StoreHealth,
}

/// Source of store probe results, implemented by the store access layer.
#[async_trait]
pub trait StoreHealthSource: Send + Sync {
    /// Probes every configured store.
    async fn store_health(&self) -> Vec<NamedStoreHealth>;
}

/// Three-level health assessment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    /// Everything within thresholds.
    Healthy,
    /// Operational but worth attention.
    Degraded,
    /// Not serving its purpose.
    Unhealthy,
}

impl HealthState {
    /// Returns the stable wire representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }

    fn worst(self, other: Self) -> Self {
        match (self, other) {
            (Self::Unhealthy, _) | (_, Self::Unhealthy) => Self::Unhealthy,
            (Self::Degraded, _) | (_, Self::Degraded) => Self::Degraded,
            _ => Self::Healthy,
        }
    }
}

/// Composed health document for the whole system.
#[derive(Debug, Clone, Serialize)]
pub struct SystemHealth {
    /// Worst assessment across stores and queue.
    pub overall: HealthState,
    /// Per-store probe results.
    pub stores: BTreeMap<String, StoreHealth>,
    /// Queue counters across all flows.
    pub queue: QueueStatus,
    /// Assembly timestamp, UTC.
    pub timestamp: DateTime<Utc>,
}

/// Queue counters plus their health assessment.
#[derive(Debug, Clone, Serialize)]
pub struct QueueHealth {
    /// Derived assessment.
    pub assessment: HealthState,
    /// Queue counters in scope.
    pub status: QueueStatus,
    /// Human-readable reasons behind a non-healthy assessment.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub reasons: Vec<String>,
}

/// Throughput report over a trailing window.
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceReport {
    /// Completed share of terminal transitions inside the window, 0–100.
    pub success_rate_pct: f64,
    /// Mean handler duration measured in-process, in milliseconds.
    pub avg_processing_time_ms: f64,
    /// Completions inside the window scaled to one hour.
    pub processing_rate_per_hour: f64,
    /// Most frequent failure messages inside the window.
    pub top_errors: Vec<TopError>,
}

/// One identified operational issue.
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticIssue {
    /// How bad the issue is.
    pub severity: HealthState,
    /// Stable machine-readable issue code.
    pub code: String,
    /// Human-readable description.
    pub detail: String,
}

/// Window used for the success-rate portion of the queue assessment.
const ASSESSMENT_WINDOW: Duration = Duration::from_secs(3600);

/// Composes store, queue, and worker signals into health documents.
pub struct HealthService {
    repository: Arc<dyn QueueRepository>,
    stores: Arc<dyn StoreHealthSource>,
    metrics: Arc<WorkerMetrics>,
    thresholds: HealthThresholds,
    orphan_timeout: Duration,
}

impl HealthService {
    /// Creates a health service over the given signal sources.
    #[must_use]
    pub fn new(
        repository: Arc<dyn QueueRepository>,
        stores: Arc<dyn StoreHealthSource>,
        metrics: Arc<WorkerMetrics>,
        thresholds: HealthThresholds,
        orphan_timeout: Duration,
    ) -> Self {
        Self {
            repository,
            stores,
            metrics,
            thresholds,
            orphan_timeout,
        }
    }

    /// Full system health: store probes, queue counters, and the worst
    /// assessment across all of them.
    pub async fn system_health(&self) -> SystemHealth {
        let store_health = self.stores.store_health().await;
        let queue_health = self.queue_health_with_stores(&store_health).await;

        let mut overall = queue_health.assessment;
        for store in &store_health {
            if !store.health.is_ok() {
                overall = overall.worst(if store.required {
                    HealthState::Unhealthy
                } else {
                    HealthState::Degraded
                });
            }
        }

        SystemHealth {
            overall,
            stores: store_health
                .into_iter()
                .map(|store| (store.name, store.health))
                .collect(),
            queue: queue_health.status,
            timestamp: Utc::now(),
        }
    }

    /// Queue counters plus the threshold-driven assessment: store
    /// availability, failure backlog, pending backlog, trailing success
    /// rate, and orphan presence.
    pub async fn queue_health(&self) -> QueueHealth {
        let store_health = self.stores.store_health().await;
        self.queue_health_with_stores(&store_health).await
    }

    async fn queue_health_with_stores(&self, store_health: &[NamedStoreHealth]) -> QueueHealth {
        let mut assessment = HealthState::Healthy;
        let mut reasons = Vec::new();

        for store in store_health {
            if store.required && !store.health.is_ok() {
                assessment = assessment.worst(HealthState::Unhealthy);
                reasons.push(format!("required store '{}' is unavailable", store.name));
            }
        }

        let status = match self.repository.status(None).await {
            Ok(status) => status,
            Err(error) => {
                assessment = assessment.worst(HealthState::Unhealthy);
                reasons.push(format!("queue status query failed: {error}"));
                return QueueHealth {
                    assessment,
                    status: QueueStatus::default(),
                    reasons,
                };
            }
        };

        if status.failed > self.thresholds.failed_critical {
            assessment = assessment.worst(HealthState::Unhealthy);
            reasons.push(format!(
                "failed records ({}) exceed the critical threshold ({})",
                status.failed, self.thresholds.failed_critical
            ));
        }

        if status.pending > self.thresholds.pending_warning {
            assessment = assessment.worst(HealthState::Degraded);
            reasons.push(format!(
                "pending records ({}) exceed the warning threshold ({})",
                status.pending, self.thresholds.pending_warning
            ));
        }

        if let Ok(window) = self.repository.performance_window(ASSESSMENT_WINDOW).await {
            let terminal = window.completed + window.failed;
            if terminal > 0 {
                let success_rate = window.completed as f64 * 100.0 / terminal as f64;
                if success_rate < self.thresholds.success_warning_pct {
                    assessment = assessment.worst(HealthState::Degraded);
                    reasons.push(format!(
                        "trailing success rate ({success_rate:.1}%) is below the warning threshold ({}%)",
                        self.thresholds.success_warning_pct
                    ));
                }
            }
        }

        if let Ok(orphans) = self.repository.count_orphans(self.orphan_timeout).await
            && orphans > 0
        {
            assessment = assessment.worst(HealthState::Degraded);
            reasons.push(format!("{orphans} orphaned records awaiting reap"));
        }

        QueueHealth {
            assessment,
            status,
            reasons,
        }
    }

    /// Throughput report over the given trailing window.
    pub async fn performance(&self, window: Duration) -> CoreResult<PerformanceReport> {
        let stats = self.repository.performance_window(window).await?;
        let terminal = stats.completed + stats.failed;

        let success_rate_pct = if terminal == 0 {
            100.0
        } else {
            stats.completed as f64 * 100.0 / terminal as f64
        };

        let window_secs = window.as_secs_f64();
        let processing_rate_per_hour = if window_secs > 0.0 {
            stats.completed as f64 * 3600.0 / window_secs
        } else {
            0.0
        };

        Ok(PerformanceReport {
            success_rate_pct,
            avg_processing_time_ms: self.metrics.snapshot().avg_processing_ms,
            processing_rate_per_hour,
            top_errors: stats.top_errors,
        })
    }

    /// Structured list of identified operational issues; empty when the
    /// system looks clean.
    pub async fn diagnostics(&self) -> Vec<DiagnosticIssue> {
        let mut issues = Vec::new();

        for store in self.stores.store_health().await {
            if !store.health.is_ok() {
                issues.push(DiagnosticIssue {
                    severity: if store.required {
                        HealthState::Unhealthy
                    } else {
                        HealthState::Degraded
                    },
                    code: "store_unavailable".to_owned(),
                    detail: format!(
                        "store '{}' failed its probe: {}",
                        store.name,
                        store.health.detail.as_deref().unwrap_or("no detail")
                    ),
                });
            }
        }

        match self.repository.status(None).await {
            Ok(status) => {
                if status.failed > self.thresholds.failed_critical {
                    issues.push(DiagnosticIssue {
                        severity: HealthState::Unhealthy,
                        code: "failed_backlog".to_owned(),
                        detail: format!("{} records in failed status", status.failed),
                    });
                }
                if status.pending > self.thresholds.pending_warning {
                    issues.push(DiagnosticIssue {
                        severity: HealthState::Degraded,
                        code: "pending_backlog".to_owned(),
                        detail: format!("{} records waiting to be claimed", status.pending),
                    });
                }
            }
            Err(error) => issues.push(DiagnosticIssue {
                severity: HealthState::Unhealthy,
                code: "status_query_failed".to_owned(),
                detail: format!("queue status query failed: {error}"),
            }),
        }

        if let Ok(orphans) = self.repository.count_orphans(self.orphan_timeout).await
            && orphans > 0
        {
            issues.push(DiagnosticIssue {
                severity: HealthState::Degraded,
                code: "orphans_present".to_owned(),
                detail: format!("{orphans} records stuck in processing beyond the orphan timeout"),
            });
        }

        let snapshot = self.metrics.snapshot();
        if snapshot.claim_errors > 0 || snapshot.report_errors > 0 {
            issues.push(DiagnosticIssue {
                severity: HealthState::Degraded,
                code: "worker_store_errors".to_owned(),
                detail: format!(
                    "worker observed {} claim errors and {} report errors since startup",
                    snapshot.claim_errors, snapshot.report_errors
                ),
            });
        }

        issues
    }
}
