//! Ports between the queue engine, the worker loop, and their adapters.

use std::time::Duration;

use async_trait::async_trait;
use flowline_core::{CoreResult, FlowName, InstanceId};
use flowline_domain::{ClaimedRecord, RecordId};
use serde::Serialize;
use serde_json::Value;

/// Aggregated record counts, optionally broken down per flow.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStatus {
    /// Records waiting to be claimed.
    pub pending: u64,
    /// Records currently claimed by an instance.
    pub processing: u64,
    /// Records finished successfully.
    pub completed: u64,
    /// Records whose handler reported a failure.
    pub failed: u64,
    /// All records in scope.
    pub total: u64,
    /// Per-flow breakdown; populated only for unscoped status queries.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub flows: Vec<FlowStatus>,
}

/// Record counts for one flow.
#[derive(Debug, Clone, Serialize)]
pub struct FlowStatus {
    /// Flow the counts belong to.
    pub flow_name: String,
    /// Records waiting to be claimed.
    pub pending: u64,
    /// Records currently claimed by an instance.
    pub processing: u64,
    /// Records finished successfully.
    pub completed: u64,
    /// Records whose handler reported a failure.
    pub failed: u64,
    /// All records of the flow.
    pub total: u64,
}

/// One aggregated failure message with its occurrence count.
#[derive(Debug, Clone, Serialize)]
pub struct TopError {
    /// Persisted error message.
    pub message: String,
    /// Failed records carrying that message inside the window.
    pub count: u64,
}

/// Store-derived slice of a performance window.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueWindowStats {
    /// Records that completed inside the window.
    pub completed: u64,
    /// Records that failed inside the window.
    pub failed: u64,
    /// Most frequent failure messages inside the window.
    pub top_errors: Vec<TopError>,
}

/// Persistence port for the queue engine.
///
/// Adapters must implement every transition atomically and honor the
/// lifecycle rules of [`flowline_domain::RecordStatus`]: `complete` and
/// `fail` are no-ops on a record already in that same terminal state, fail
/// with `IllegalTransition` on any other disallowed edge, and fail with
/// `QueryFailed` when the record does not exist.
#[async_trait]
pub trait QueueRepository: Send + Sync {
    /// Inserts pending records; returns the number inserted.
    async fn enqueue(&self, flow_name: &FlowName, payloads: &[Value]) -> CoreResult<u64>;

    /// Atomically claims up to `batch_size` pending records of the flow,
    /// oldest first, stamping them with the instance and claim time. Two
    /// concurrent claimers must receive disjoint records.
    async fn claim_batch(
        &self,
        flow_name: &FlowName,
        instance_id: &InstanceId,
        batch_size: usize,
    ) -> CoreResult<Vec<ClaimedRecord>>;

    /// Transitions `processing → completed`, optionally replacing the
    /// payload with a result document.
    async fn complete(&self, record_id: RecordId, result_payload: Option<Value>) -> CoreResult<()>;

    /// Transitions `processing → failed`, recording the error message and
    /// incrementing the retry count.
    async fn fail(&self, record_id: RecordId, error_message: &str) -> CoreResult<()>;

    /// Returns records stuck in `processing` longer than `orphan_timeout`
    /// back to `pending`, incrementing their retry count. Returns the
    /// number reaped.
    async fn reap_orphans(&self, orphan_timeout: Duration) -> CoreResult<u64>;

    /// Transitions `failed → pending` for records below the retry ceiling,
    /// clearing their error message. Returns the number reset.
    async fn reset_failed(&self, flow_name: Option<&FlowName>, max_retries: u32)
    -> CoreResult<u64>;

    /// Aggregated counts, scoped to one flow or across all flows with a
    /// per-flow breakdown.
    async fn status(&self, flow_name: Option<&FlowName>) -> CoreResult<QueueStatus>;

    /// Number of `processing` records older than `orphan_timeout`, without
    /// touching them.
    async fn count_orphans(&self, orphan_timeout: Duration) -> CoreResult<u64>;

    /// Terminal-transition counts and top failure messages inside the
    /// trailing window, keyed on each record's last mutation time.
    async fn performance_window(&self, window: Duration) -> CoreResult<QueueWindowStats>;
}

/// The plug point a worker family implements: one call per claimed record.
///
/// The returned document replaces the record's payload on completion;
/// `None` keeps the input payload. Any error becomes the record's
/// persisted failure message. Delivery is at-least-once: orphan recovery
/// can hand the same payload to a handler again, so implementations must
/// be idempotent, and they must not mutate shared state across records
/// without their own synchronization.
#[async_trait]
pub trait RecordHandler: Send + Sync {
    /// Processes one record payload.
    async fn handle(&self, payload: Value) -> CoreResult<Option<Value>>;
}
