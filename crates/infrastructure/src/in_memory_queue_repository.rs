//! In-memory queue repository.
//!
//! Implements the full repository contract against process memory, with a
//! controllable clock offset so orphan behavior can be exercised without
//! waiting. Backs the application test suite and lets handler authors
//! develop against the real worker loop with no database.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flowline_application::{
    FlowStatus, QueueRepository, QueueStatus, QueueWindowStats, TopError,
};
use flowline_core::{CoreError, CoreResult, FlowName, InstanceId};
use flowline_domain::{ClaimedRecord, QueueRecord, RecordId, RecordStatus};
use serde_json::Value;
use tokio::sync::Mutex;

struct State {
    next_id: i64,
    clock_offset: Duration,
    records: Vec<QueueRecord>,
}

impl State {
    fn now(&self) -> DateTime<Utc> {
        Utc::now() + chrono::Duration::from_std(self.clock_offset).unwrap_or_else(|_| chrono::Duration::zero())
    }

    fn find_mut(&mut self, record_id: RecordId) -> Option<&mut QueueRecord> {
        self.records
            .iter_mut()
            .find(|record| record.id == record_id)
    }
}

/// Memory-backed queue repository with the same transition semantics as
/// the Postgres adapter.
pub struct InMemoryQueueRepository {
    state: Mutex<State>,
}

impl Default for InMemoryQueueRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryQueueRepository {
    /// Creates an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                next_id: 0,
                clock_offset: Duration::ZERO,
                records: Vec::new(),
            }),
        }
    }

    /// Moves the repository's clock forward. Claim ages are measured
    /// against this shifted clock, so orphan timeouts can be crossed
    /// without real waiting.
    pub async fn advance_clock(&self, by: Duration) {
        let mut state = self.state.lock().await;
        state.clock_offset = state.clock_offset.saturating_add(by);
    }

    /// Snapshot of one record, for assertions and tooling.
    pub async fn record(&self, record_id: RecordId) -> Option<QueueRecord> {
        self.state
            .lock()
            .await
            .records
            .iter()
            .find(|record| record.id == record_id)
            .cloned()
    }
}

#[async_trait]
impl QueueRepository for InMemoryQueueRepository {
    async fn enqueue(&self, flow_name: &FlowName, payloads: &[Value]) -> CoreResult<u64> {
        let mut state = self.state.lock().await;
        let now = state.now();

        for payload in payloads {
            state.next_id += 1;
            let id = state.next_id;
            state.records.push(QueueRecord {
                id: RecordId::new(id),
                flow_name: flow_name.clone(),
                payload: payload.clone(),
                status: RecordStatus::Pending,
                instance_id: None,
                claimed_at: None,
                completed_at: None,
                error_message: None,
                retry_count: 0,
                created_at: now,
                updated_at: now,
            });
        }

        Ok(payloads.len() as u64)
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

        let mut state = self.state.lock().await;
        let now = state.now();

        let mut candidate_ids: Vec<RecordId> = state
            .records
            .iter()
            .filter(|record| {
                record.status == RecordStatus::Pending && record.flow_name == *flow_name
            })
            .map(|record| record.id)
            .collect();
        // FIFO by created_at with id as the tiebreak; ids ascend with
        // creation order here, so the id sort realizes both.
        candidate_ids.sort();
        candidate_ids.truncate(batch_size);

        let mut claimed = Vec::with_capacity(candidate_ids.len());
        for record_id in candidate_ids {
            if let Some(record) = state.find_mut(record_id) {
                record.status = RecordStatus::Processing;
                record.instance_id = Some(instance_id.as_str().to_owned());
                record.claimed_at = Some(now);
                record.updated_at = now;
                claimed.push(ClaimedRecord {
                    id: record.id,
                    payload: record.payload.clone(),
                    retry_count: record.retry_count,
                });
            }
        }

        Ok(claimed)
    }

    async fn complete(&self, record_id: RecordId, result_payload: Option<Value>) -> CoreResult<()> {
        let mut state = self.state.lock().await;
        let now = state.now();

        let Some(record) = state.find_mut(record_id) else {
            return Err(CoreError::QueryFailed(format!(
                "queue record {record_id} does not exist"
            )));
        };

        match record.status {
            RecordStatus::Processing => {
                record.status = RecordStatus::Completed;
                record.completed_at = Some(now);
                if let Some(result_payload) = result_payload {
                    record.payload = result_payload;
                }
                record.instance_id = None;
                record.claimed_at = None;
                record.updated_at = now;
                Ok(())
            }
            RecordStatus::Completed => Ok(()),
            other => Err(CoreError::IllegalTransition(format!(
                "cannot complete record {record_id} in status '{other}'"
            ))),
        }
    }

    async fn fail(&self, record_id: RecordId, error_message: &str) -> CoreResult<()> {
        let mut state = self.state.lock().await;
        let now = state.now();

        let Some(record) = state.find_mut(record_id) else {
            return Err(CoreError::QueryFailed(format!(
                "queue record {record_id} does not exist"
            )));
        };

        match record.status {
            RecordStatus::Processing => {
                record.status = RecordStatus::Failed;
                record.error_message = Some(error_message.to_owned());
                record.retry_count += 1;
                record.instance_id = None;
                record.claimed_at = None;
                record.updated_at = now;
                Ok(())
            }
            RecordStatus::Failed => Ok(()),
            other => Err(CoreError::IllegalTransition(format!(
                "cannot fail record {record_id} in status '{other}'"
            ))),
        }
    }

    async fn reap_orphans(&self, orphan_timeout: Duration) -> CoreResult<u64> {
        let mut state = self.state.lock().await;
        let now = state.now();
        let cutoff = now - chrono::Duration::from_std(orphan_timeout).unwrap_or_else(|_| chrono::Duration::zero());

        let mut reaped = 0;
        for record in state.records.iter_mut() {
            if record.status == RecordStatus::Processing
                && record.claimed_at.is_some_and(|claimed_at| claimed_at < cutoff)
            {
                record.status = RecordStatus::Pending;
                record.instance_id = None;
                record.claimed_at = None;
                record.retry_count += 1;
                record.updated_at = now;
                reaped += 1;
            }
        }

        Ok(reaped)
    }

    async fn reset_failed(
        &self,
        flow_name: Option<&FlowName>,
        max_retries: u32,
    ) -> CoreResult<u64> {
        let mut state = self.state.lock().await;
        let now = state.now();

        let mut reset = 0;
        for record in state.records.iter_mut() {
            let flow_matches = flow_name.is_none_or(|flow_name| record.flow_name == *flow_name);
            if record.status == RecordStatus::Failed
                && flow_matches
                && record.retry_count < max_retries
            {
                record.status = RecordStatus::Pending;
                record.error_message = None;
                record.updated_at = now;
                reset += 1;
            }
        }

        Ok(reset)
    }

    async fn status(&self, flow_name: Option<&FlowName>) -> CoreResult<QueueStatus> {
        let state = self.state.lock().await;
        let mut status = QueueStatus::default();
        let mut per_flow: BTreeMap<String, FlowStatus> = BTreeMap::new();

        for record in &state.records {
            if flow_name.is_some_and(|flow_name| record.flow_name != *flow_name) {
                continue;
            }

            let flow_entry = per_flow
                .entry(record.flow_name.as_str().to_owned())
                .or_insert_with(|| FlowStatus {
                    flow_name: record.flow_name.as_str().to_owned(),
                    pending: 0,
                    processing: 0,
                    completed: 0,
                    failed: 0,
                    total: 0,
                });

            match record.status {
                RecordStatus::Pending => {
                    status.pending += 1;
                    flow_entry.pending += 1;
                }
                RecordStatus::Processing => {
                    status.processing += 1;
                    flow_entry.processing += 1;
                }
                RecordStatus::Completed => {
                    status.completed += 1;
                    flow_entry.completed += 1;
                }
                RecordStatus::Failed => {
                    status.failed += 1;
                    flow_entry.failed += 1;
                }
            }
            status.total += 1;
            flow_entry.total += 1;
        }

        if flow_name.is_none() {
            status.flows = per_flow.into_values().collect();
        }

        Ok(status)
    }

    async fn count_orphans(&self, orphan_timeout: Duration) -> CoreResult<u64> {
        let state = self.state.lock().await;
        let cutoff = state.now() - chrono::Duration::from_std(orphan_timeout).unwrap_or_else(|_| chrono::Duration::zero());

        Ok(state
            .records
            .iter()
            .filter(|record| {
                record.status == RecordStatus::Processing
                    && record.claimed_at.is_some_and(|claimed_at| claimed_at < cutoff)
            })
            .count() as u64)
    }

    async fn performance_window(&self, window: Duration) -> CoreResult<QueueWindowStats> {
        let state = self.state.lock().await;
        let cutoff = state.now() - chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::zero());

        let mut stats = QueueWindowStats::default();
        let mut error_counts: BTreeMap<String, u64> = BTreeMap::new();

        for record in &state.records {
            if record.updated_at < cutoff {
                continue;
            }
            match record.status {
                RecordStatus::Completed => stats.completed += 1,
                RecordStatus::Failed => {
                    stats.failed += 1;
                    if let Some(message) = &record.error_message {
                        *error_counts.entry(message.clone()).or_insert(0) += 1;
                    }
                }
                _ => {}
            }
        }

        let mut top_errors: Vec<TopError> = error_counts
            .into_iter()
            .map(|(message, count)| TopError { message, count })
            .collect();
        top_errors.sort_by(|a, b| b.count.cmp(&a.count).then(a.message.cmp(&b.message)));
        top_errors.truncate(5);
        stats.top_errors = top_errors;

        Ok(stats)
    }
}

#[cfg(test)]
mod tests;
