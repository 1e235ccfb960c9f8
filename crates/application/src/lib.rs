//! Application services and ports for the Flowline work-queue coordinator.

#![forbid(unsafe_code)]

mod events;
mod health_service;
mod metrics;
mod queue_engine;
mod queue_ports;
mod worker_loop;

pub use events::{Event, EventComponent, EventLevel, EventSink};
pub use health_service::{
    DiagnosticIssue, HealthService, HealthState, NamedStoreHealth, PerformanceReport, PoolStats,
    QueueHealth, StoreHealth, StoreHealthSource, SystemHealth,
};
pub use metrics::{MetricsSnapshot, WorkerMetrics};
pub use queue_engine::QueueEngine;
pub use queue_ports::{
    FlowStatus, QueueRepository, QueueStatus, QueueWindowStats, RecordHandler, TopError,
};
pub use worker_loop::{ShutdownHandle, WorkerLoop};
