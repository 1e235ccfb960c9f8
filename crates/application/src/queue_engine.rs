//! The queue engine: atomic work-distribution semantics over a
//! [`QueueRepository`], with a structured event emitted for every state
//! transition.

use std::sync::Arc;
use std::time::Duration;

use flowline_core::{CoreError, CoreResult, FlowName, InstanceId};
use flowline_domain::{ClaimedRecord, RecordId};
use serde_json::Value;

use crate::events::{Event, EventComponent, EventLevel, EventSink};
use crate::queue_ports::{QueueRepository, QueueStatus};

/// Ceiling applied to persisted failure messages.
pub(crate) const MAX_ERROR_MESSAGE_BYTES: usize = 1024;

/// Truncates a failure message to at most `max_bytes`, respecting char
/// boundaries.
pub(crate) fn truncate_message(message: &str, max_bytes: usize) -> String {
    if message.len() <= max_bytes {
        return message.to_owned();
    }

    let mut cut = max_bytes;
    while cut > 0 && !message.is_char_boundary(cut) {
        cut -= 1;
    }

    message[..cut].to_owned()
}

/// Work-distribution API shared by producers, worker loops, and operators.
#[derive(Clone)]
pub struct QueueEngine {
    repository: Arc<dyn QueueRepository>,
    events: Arc<dyn EventSink>,
}

impl QueueEngine {
    /// Creates a queue engine over the given repository and event sink.
    #[must_use]
    pub fn new(repository: Arc<dyn QueueRepository>, events: Arc<dyn EventSink>) -> Self {
        Self { repository, events }
    }

    /// Inserts the payloads as pending records of the flow. An empty batch
    /// is a no-op returning zero.
    pub async fn enqueue(&self, flow_name: &FlowName, payloads: &[Value]) -> CoreResult<u64> {
        if payloads.is_empty() {
            return Ok(0);
        }

        let count = self.repository.enqueue(flow_name, payloads).await?;

        self.events.emit(
            Event::new(EventComponent::Queue, "records_enqueued")
                .flow(flow_name)
                .field("count", count),
        );

        Ok(count)
    }

    /// Atomically claims up to `batch_size` pending records, oldest first.
    /// A zero batch size returns an empty list without touching the store.
    pub async fn claim_batch(
        &self,
        flow_name: &FlowName,
        instance_id: &InstanceId,
        batch_size: usize,
    ) -> CoreResult<Vec<ClaimedRecord>> {
        if batch_size == 0 {
            return Ok(Vec::new());
        }

        let records = self
            .repository
            .claim_batch(flow_name, instance_id, batch_size)
            .await?;

        if !records.is_empty() {
            self.events.emit(
                Event::new(EventComponent::Queue, "batch_claimed")
                    .flow(flow_name)
                    .instance(instance_id)
                    .field("count", records.len()),
            );
        }

        Ok(records)
    }

    /// Transitions `processing → completed`, optionally replacing the
    /// record's payload with the result document.
    pub async fn complete(
        &self,
        record_id: RecordId,
        result_payload: Option<Value>,
    ) -> CoreResult<()> {
        match self.repository.complete(record_id, result_payload).await {
            Ok(()) => {
                self.events.emit(
                    Event::new(EventComponent::Queue, "record_completed").record(record_id),
                );
                Ok(())
            }
            Err(error) => Err(self.surface_transition_error(record_id, "complete", error)),
        }
    }

    /// Transitions `processing → failed`, persisting the truncated error
    /// message and incrementing the retry count.
    pub async fn fail(&self, record_id: RecordId, error_message: &str) -> CoreResult<()> {
        let message = truncate_message(error_message, MAX_ERROR_MESSAGE_BYTES);

        match self.repository.fail(record_id, message.as_str()).await {
            Ok(()) => {
                self.events.emit(
                    Event::new(EventComponent::Queue, "record_failed")
                        .level(EventLevel::Warn)
                        .record(record_id)
                        .field("error_message", message),
                );
                Ok(())
            }
            Err(error) => Err(self.surface_transition_error(record_id, "fail", error)),
        }
    }

    /// Returns long-stuck `processing` records to `pending`. Returns the
    /// number reaped.
    pub async fn reap_orphans(&self, orphan_timeout: Duration) -> CoreResult<u64> {
        let count = self.repository.reap_orphans(orphan_timeout).await?;

        if count > 0 {
            self.events.emit(
                Event::new(EventComponent::Queue, "orphans_reaped")
                    .level(EventLevel::Warn)
                    .field("count", count)
                    .field("orphan_timeout_s", orphan_timeout.as_secs()),
            );
        }

        Ok(count)
    }

    /// Returns `failed` records below the retry ceiling to `pending`.
    /// Returns the number reset.
    pub async fn reset_failed(
        &self,
        flow_name: Option<&FlowName>,
        max_retries: u32,
    ) -> CoreResult<u64> {
        let count = self.repository.reset_failed(flow_name, max_retries).await?;

        if count > 0 {
            let mut event = Event::new(EventComponent::Queue, "failed_reset")
                .field("count", count)
                .field("max_retries", max_retries);
            if let Some(flow_name) = flow_name {
                event = event.flow(flow_name);
            }
            self.events.emit(event);
        }

        Ok(count)
    }

    /// Aggregated record counts, scoped to one flow or across all flows.
    pub async fn status(&self, flow_name: Option<&FlowName>) -> CoreResult<QueueStatus> {
        self.repository.status(flow_name).await
    }

    fn surface_transition_error(
        &self,
        record_id: RecordId,
        attempted: &str,
        error: CoreError,
    ) -> CoreError {
        if let CoreError::IllegalTransition(detail) = &error {
            self.events.emit(
                Event::new(EventComponent::Queue, "illegal_transition")
                    .level(EventLevel::Error)
                    .record(record_id)
                    .field("attempted", attempted)
                    .field("detail", detail.as_str()),
            );
        }

        error
    }
}
