//! PostgreSQL-backed queue repository.
//!
//! The claim is a single `UPDATE` driven by a skip-locked subquery, so two
//! concurrent claimers always receive disjoint rows; splitting the select
//! from the update would permit double-claims under contention.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use flowline_application::{
    FlowStatus, QueueRepository, QueueStatus, QueueWindowStats, TopError,
};
use flowline_core::{CoreError, CoreResult, FlowName, InstanceId};
use flowline_domain::{ClaimedRecord, RecordId, RecordStatus};
use serde_json::Value;
use sqlx::FromRow;

use crate::store_access::{StoreAccess, StoreName};

const CLAIM_SQL: &str = r#"
    UPDATE processing_queue
    SET status = 'processing', instance_id = $1, claimed_at = now(), updated_at = now()
    WHERE id IN (
        SELECT id FROM processing_queue
        WHERE flow_name = $2 AND status = 'pending'
        ORDER BY created_at ASC, id ASC
        LIMIT $3
        FOR UPDATE SKIP LOCKED
    )
    RETURNING id, payload, retry_count
"#;

/// Queue repository over the `queue_store` pool.
#[derive(Clone)]
pub struct PostgresQueueRepository {
    stores: Arc<StoreAccess>,
}

impl PostgresQueueRepository {
    /// Creates a queue repository over the given store access layer.
    #[must_use]
    pub fn new(stores: Arc<StoreAccess>) -> Self {
        Self { stores }
    }

    /// Resolves a zero-row terminal update: a repeat of the same terminal
    /// transition is a no-op, anything else is an illegal edge or a
    /// missing record.
    async fn resolve_transition_conflict(
        &self,
        record_id: RecordId,
        target: RecordStatus,
        attempted: &str,
    ) -> CoreResult<()> {
        let current: Option<String> = self
            .stores
            .run(
                StoreName::Queue,
                "read queue record status",
                sqlx::query_scalar("SELECT status FROM processing_queue WHERE id = $1")
                    .bind(record_id.as_i64())
                    .fetch_optional(self.stores.queue_pool()),
            )
            .await?;

        match current {
            None => Err(CoreError::QueryFailed(format!(
                "queue record {record_id} does not exist"
            ))),
            Some(current) if current == target.as_str() => Ok(()),
            Some(current) => Err(CoreError::IllegalTransition(format!(
                "cannot {attempted} record {record_id} in status '{current}'"
            ))),
        }
    }
}

#[derive(Debug, FromRow)]
struct ClaimedRecordRow {
    id: i64,
    payload: Value,
    retry_count: i32,
}

#[derive(Debug, FromRow)]
struct FlowStatusRow {
    flow_name: String,
    pending: i64,
    processing: i64,
    completed: i64,
    failed: i64,
}

#[derive(Debug, FromRow)]
struct WindowStatsRow {
    completed: i64,
    failed: i64,
}

#[derive(Debug, FromRow)]
struct TopErrorRow {
    message: String,
    count: i64,
}

fn non_negative(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

#[async_trait]
impl QueueRepository for PostgresQueueRepository {
    async fn enqueue(&self, flow_name: &FlowName, payloads: &[Value]) -> CoreResult<u64> {
        if payloads.is_empty() {
            return Ok(0);
        }

        let inserted = self
            .stores
            .run(
                StoreName::Queue,
                "enqueue queue records",
                sqlx::query(
                    r#"
                    INSERT INTO processing_queue (flow_name, payload)
                    SELECT $1, payload FROM UNNEST($2::jsonb[]) AS payload
                    "#,
                )
                .bind(flow_name.as_str())
                .bind(payloads)
                .execute(self.stores.queue_pool()),
            )
            .await?;

        Ok(inserted.rows_affected())
    }

    async fn claim_batch(
        &self,
        flow_name: &FlowName,
        instance_id: &InstanceId,
        batch_size: usize,
    ) -> CoreResult<Vec<ClaimedRecord>> {
        if batch_size == 0 {
            return Ok(Vec::new());
        }

        let limit = i64::try_from(batch_size).map_err(|error| {
            CoreError::ConfigInvalid(format!("invalid claim batch size {batch_size}: {error}"))
        })?;

        let mut rows = self
            .stores
            .run(
                StoreName::Queue,
                "claim queue records",
                sqlx::query_as::<_, ClaimedRecordRow>(CLAIM_SQL)
                    .bind(instance_id.as_str())
                    .bind(flow_name.as_str())
                    .bind(limit)
                    .fetch_all(self.stores.queue_pool()),
            )
            .await?;

        // UPDATE .. RETURNING does not preserve the subquery order.
        rows.sort_by_key(|row| row.id);

        Ok(rows
            .into_iter()
            .map(|row| ClaimedRecord {
                id: RecordId::new(row.id),
                payload: row.payload,
                retry_count: u32::try_from(row.retry_count).unwrap_or_default(),
            })
            .collect())
    }

    async fn complete(&self, record_id: RecordId, result_payload: Option<Value>) -> CoreResult<()> {
        let updated = self
            .stores
            .run(
                StoreName::Queue,
                "complete queue record",
                sqlx::query(
                    r#"
                    UPDATE processing_queue
                    SET status = 'completed',
                        completed_at = now(),
                        payload = COALESCE($2, payload),
                        instance_id = NULL,
                        claimed_at = NULL,
                        updated_at = now()
                    WHERE id = $1 AND status = 'processing'
                    "#,
                )
                .bind(record_id.as_i64())
                .bind(result_payload)
                .execute(self.stores.queue_pool()),
            )
            .await?;

        if updated.rows_affected() == 0 {
            return self
                .resolve_transition_conflict(record_id, RecordStatus::Completed, "complete")
                .await;
        }

        Ok(())
    }

    async fn fail(&self, record_id: RecordId, error_message: &str) -> CoreResult<()> {
        let updated = self
            .stores
            .run(
                StoreName::Queue,
                "fail queue record",
                sqlx::query(
                    r#"
                    UPDATE processing_queue
                    SET status = 'failed',
                        error_message = $2,
                        retry_count = retry_count + 1,
                        instance_id = NULL,
                        claimed_at = NULL,
                        updated_at = now()
                    WHERE id = $1 AND status = 'processing'
                    "#,
                )
                .bind(record_id.as_i64())
                .bind(error_message)
                .execute(self.stores.queue_pool()),
            )
            .await?;

        if updated.rows_affected() == 0 {
            return self
                .resolve_transition_conflict(record_id, RecordStatus::Failed, "fail")
                .await;
        }

        Ok(())
    }

    async fn reap_orphans(&self, orphan_timeout: Duration) -> CoreResult<u64> {
        let reaped = self
            .stores
            .run(
                StoreName::Queue,
                "reap orphaned queue records",
                sqlx::query(
                    r#"
                    UPDATE processing_queue
                    SET status = 'pending',
                        instance_id = NULL,
                        claimed_at = NULL,
                        retry_count = retry_count + 1,
                        updated_at = now()
                    WHERE status = 'processing'
                      AND claimed_at < now() - make_interval(secs => $1)
                    "#,
                )
                .bind(orphan_timeout.as_secs_f64())
                .execute(self.stores.queue_pool()),
            )
            .await?;

        Ok(reaped.rows_affected())
    }

    async fn reset_failed(
        &self,
        flow_name: Option<&FlowName>,
        max_retries: u32,
    ) -> CoreResult<u64> {
        let reset = self
            .stores
            .run(
                StoreName::Queue,
                "reset failed queue records",
                sqlx::query(
                    r#"
                    UPDATE processing_queue
                    SET status = 'pending', error_message = NULL, updated_at = now()
                    WHERE status = 'failed'
                      AND retry_count < $1
                      AND ($2::text IS NULL OR flow_name = $2)
                    "#,
                )
                .bind(i64::from(max_retries))
                .bind(flow_name.map(FlowName::as_str))
                .execute(self.stores.queue_pool()),
            )
            .await?;

        Ok(reset.rows_affected())
    }

    async fn status(&self, flow_name: Option<&FlowName>) -> CoreResult<QueueStatus> {
        let rows = self
            .stores
            .run(
                StoreName::Queue,
                "load queue status",
                sqlx::query_as::<_, FlowStatusRow>(
                    r#"
                    SELECT
                        flow_name,
                        COALESCE(SUM(CASE WHEN status = 'pending' THEN 1 ELSE 0 END), 0) AS pending,
                        COALESCE(SUM(CASE WHEN status = 'processing' THEN 1 ELSE 0 END), 0) AS processing,
                        COALESCE(SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END), 0) AS completed,
                        COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0) AS failed
                    FROM processing_queue
                    WHERE $1::text IS NULL OR flow_name = $1
                    GROUP BY flow_name
                    ORDER BY flow_name
                    "#,
                )
                .bind(flow_name.map(FlowName::as_str))
                .fetch_all(self.stores.queue_pool()),
            )
            .await?;

        let mut status = QueueStatus::default();
        for row in &rows {
            status.pending += non_negative(row.pending);
            status.processing += non_negative(row.processing);
            status.completed += non_negative(row.completed);
            status.failed += non_negative(row.failed);
        }
        status.total = status.pending + status.processing + status.completed + status.failed;

        if flow_name.is_none() {
            status.flows = rows
                .into_iter()
                .map(|row| {
                    let pending = non_negative(row.pending);
                    let processing = non_negative(row.processing);
                    let completed = non_negative(row.completed);
                    let failed = non_negative(row.failed);
                    FlowStatus {
                        flow_name: row.flow_name,
                        pending,
                        processing,
                        completed,
                        failed,
                        total: pending + processing + completed + failed,
                    }
                })
                .collect();
        }

        Ok(status)
    }

    async fn count_orphans(&self, orphan_timeout: Duration) -> CoreResult<u64> {
        let count: i64 = self
            .stores
            .run(
                StoreName::Queue,
                "count orphaned queue records",
                sqlx::query_scalar(
                    r#"
                    SELECT COUNT(*)
                    FROM processing_queue
                    WHERE status = 'processing'
                      AND claimed_at < now() - make_interval(secs => $1)
                    "#,
                )
                .bind(orphan_timeout.as_secs_f64())
                .fetch_one(self.stores.queue_pool()),
            )
            .await?;

        Ok(non_negative(count))
    }

    async fn performance_window(&self, window: Duration) -> CoreResult<QueueWindowStats> {
        let window_secs = window.as_secs_f64();

        let stats = self
            .stores
            .run(
                StoreName::Queue,
                "load queue window stats",
                sqlx::query_as::<_, WindowStatsRow>(
                    r#"
                    SELECT
                        COALESCE(SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END), 0) AS completed,
                        COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0) AS failed
                    FROM processing_queue
                    WHERE updated_at >= now() - make_interval(secs => $1)
                    "#,
                )
                .bind(window_secs)
                .fetch_one(self.stores.queue_pool()),
            )
            .await?;

        let top_errors = self
            .stores
            .run(
                StoreName::Queue,
                "load top queue errors",
                sqlx::query_as::<_, TopErrorRow>(
                    r#"
                    SELECT error_message AS message, COUNT(*) AS count
                    FROM processing_queue
                    WHERE status = 'failed'
                      AND error_message IS NOT NULL
                      AND updated_at >= now() - make_interval(secs => $1)
                    GROUP BY error_message
                    ORDER BY count DESC, message ASC
                    LIMIT 5
                    "#,
                )
                .bind(window_secs)
                .fetch_all(self.stores.queue_pool()),
            )
            .await?;

        Ok(QueueWindowStats {
            completed: non_negative(stats.completed),
            failed: non_negative(stats.failed),
            top_errors: top_errors
                .into_iter()
                .map(|row| TopError {
                    message: row.message,
                    count: non_negative(row.count),
                })
                .collect(),
        })
    }
}
