//! The worker loop: drives records from claim through handler dispatch to
//! completion/failure reporting at a bounded rate.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use flowline_core::config::WorkerSettings;
use flowline_core::{CoreError, CoreResult, InstanceId};
use flowline_domain::{ClaimedRecord, RecordId};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::{self, JoinError, JoinSet};
use tracing::{info, warn};

use crate::events::{Event, EventComponent, EventLevel, EventSink};
use crate::metrics::WorkerMetrics;
use crate::queue_engine::QueueEngine;
use crate::queue_ports::RecordHandler;

type HandlerOutcome = (RecordId, Duration, CoreResult<Option<Value>>);

/// Signals a running [`WorkerLoop`] to begin its graceful drain.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    sender: watch::Sender<bool>,
}

impl ShutdownHandle {
    /// Begins graceful shutdown: the loop stops claiming new batches,
    /// waits for in-flight records up to the configured grace, then
    /// returns. Safe to call more than once.
    pub fn shutdown(&self) {
        let _ = self.sender.send(true);
    }
}

/// One claim→process→report loop bound to a single flow.
///
/// The instance identity is generated once at construction and stamped on
/// every record the loop claims for its whole lifetime.
pub struct WorkerLoop {
    engine: QueueEngine,
    events: Arc<dyn EventSink>,
    metrics: Arc<WorkerMetrics>,
    settings: WorkerSettings,
    instance_id: InstanceId,
    shutdown: watch::Receiver<bool>,
}

impl WorkerLoop {
    /// Creates a worker loop and the handle that stops it.
    #[must_use]
    pub fn new(
        engine: QueueEngine,
        events: Arc<dyn EventSink>,
        metrics: Arc<WorkerMetrics>,
        settings: WorkerSettings,
        instance_id: InstanceId,
    ) -> (Self, ShutdownHandle) {
        let (sender, receiver) = watch::channel(false);

        (
            Self {
                engine,
                events,
                metrics,
                settings,
                instance_id,
                shutdown: receiver,
            },
            ShutdownHandle { sender },
        )
    }

    /// Identity stamped on the records this loop claims.
    #[must_use]
    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    /// Runs until the shutdown handle is signalled.
    ///
    /// Store errors never escape: a failed claim counts as an empty batch
    /// for the tick, and a failed completion/failure report leaves the
    /// record in `processing` for the next reaper pass.
    pub async fn run(&self, handler: Arc<dyn RecordHandler>) -> CoreResult<()> {
        let mut shutdown = self.shutdown.clone();
        let mut last_reap: Option<Instant> = None;

        info!(
            flow = %self.settings.flow_name,
            instance_id = %self.instance_id,
            batch_size = self.settings.batch_size,
            max_inflight = self.settings.max_inflight,
            "worker loop started"
        );
        self.events.emit(
            Event::new(EventComponent::Worker, "worker_started")
                .flow(&self.settings.flow_name)
                .instance(&self.instance_id)
                .field("batch_size", self.settings.batch_size)
                .field("max_inflight", self.settings.max_inflight),
        );

        while !stop_requested(&shutdown) {
            let records = match self
                .engine
                .claim_batch(
                    &self.settings.flow_name,
                    &self.instance_id,
                    self.settings.batch_size,
                )
                .await
            {
                Ok(records) => records,
                Err(error) => {
                    self.metrics.claim_error();
                    warn!(
                        flow = %self.settings.flow_name,
                        instance_id = %self.instance_id,
                        error = %error,
                        "claim failed; treating as empty batch"
                    );
                    self.events.emit(
                        Event::new(EventComponent::Worker, "claim_error")
                            .level(EventLevel::Warn)
                            .flow(&self.settings.flow_name)
                            .instance(&self.instance_id)
                            .field("error", error.to_string()),
                    );
                    Vec::new()
                }
            };

            if records.is_empty() {
                self.idle_pause(&mut shutdown).await;
            } else {
                self.metrics.add_claimed(records.len() as u64);
                self.dispatch_batch(records, &handler, &mut shutdown).await;
            }

            if self.reap_due(last_reap) {
                self.reap_tick().await;
                last_reap = Some(Instant::now());
            }
        }

        info!(
            flow = %self.settings.flow_name,
            instance_id = %self.instance_id,
            "worker loop stopped"
        );
        self.events.emit(
            Event::new(EventComponent::Worker, "worker_stopped")
                .flow(&self.settings.flow_name)
                .instance(&self.instance_id),
        );

        Ok(())
    }

    /// Runs the handlers of one claimed batch with at most `max_inflight`
    /// in flight, reporting each outcome as it lands. On shutdown the
    /// remaining unstarted records are abandoned in `processing` for the
    /// reaper, and in-flight handlers get `shutdown_grace` to finish.
    async fn dispatch_batch(
        &self,
        records: Vec<ClaimedRecord>,
        handler: &Arc<dyn RecordHandler>,
        shutdown: &mut watch::Receiver<bool>,
    ) {
        let max_inflight = self.settings.max_inflight.max(1);
        let mut in_flight: JoinSet<HandlerOutcome> = JoinSet::new();
        let mut task_records: HashMap<task::Id, RecordId> = HashMap::new();
        let mut remaining = records.into_iter();
        let mut interrupted = stop_requested(shutdown);

        loop {
            while !interrupted && in_flight.len() < max_inflight {
                let Some(record) = remaining.next() else {
                    break;
                };

                let handler = Arc::clone(handler);
                let record_id = record.id;
                let abort_handle = in_flight.spawn(async move {
                    let started = Instant::now();
                    let result = handler.handle(record.payload).await;
                    (record_id, started.elapsed(), result)
                });
                task_records.insert(abort_handle.id(), record_id);
            }

            if in_flight.is_empty() {
                break;
            }

            if interrupted {
                self.drain_with_grace(&mut in_flight, &mut task_records).await;
                break;
            }

            tokio::select! {
                joined = in_flight.join_next_with_id() => {
                    if let Some(joined) = joined {
                        self.report_outcome(joined, &mut task_records).await;
                    }
                }
                changed = shutdown.changed() => {
                    let _ = changed;
                    interrupted = true;
                }
            }
        }
    }

    /// Awaits in-flight handlers up to `shutdown_grace`, then abandons the
    /// rest in place; their records are recovered by a later reaper pass.
    async fn drain_with_grace(
        &self,
        in_flight: &mut JoinSet<HandlerOutcome>,
        task_records: &mut HashMap<task::Id, RecordId>,
    ) {
        let drained = tokio::time::timeout(self.settings.shutdown_grace, async {
            while let Some(joined) = in_flight.join_next_with_id().await {
                self.report_outcome(joined, task_records).await;
            }
        })
        .await;

        if drained.is_err() {
            let abandoned = in_flight.len();
            in_flight.abort_all();
            while in_flight.join_next().await.is_some() {}

            warn!(
                flow = %self.settings.flow_name,
                instance_id = %self.instance_id,
                abandoned,
                "shutdown grace elapsed; abandoning in-flight records to the reaper"
            );
            self.events.emit(
                Event::new(EventComponent::Worker, "shutdown_grace_exceeded")
                    .level(EventLevel::Warn)
                    .flow(&self.settings.flow_name)
                    .instance(&self.instance_id)
                    .field("abandoned", abandoned),
            );
        }
    }

    async fn report_outcome(
        &self,
        joined: Result<(task::Id, HandlerOutcome), JoinError>,
        task_records: &mut HashMap<task::Id, RecordId>,
    ) {
        match joined {
            Ok((task_id, (record_id, elapsed, result))) => {
                task_records.remove(&task_id);
                self.metrics.observe_processing(elapsed);

                match result {
                    Ok(result_payload) => {
                        match self.engine.complete(record_id, result_payload).await {
                            Ok(()) => self.metrics.record_completed(),
                            Err(error) => self.report_error(record_id, error),
                        }
                    }
                    Err(error) => {
                        let message = handler_failure_message(error);
                        match self.engine.fail(record_id, message.as_str()).await {
                            Ok(()) => self.metrics.record_failed(),
                            Err(error) => self.report_error(record_id, error),
                        }
                    }
                }
            }
            Err(join_error) => {
                let record_id = task_records.remove(&join_error.id());
                if join_error.is_cancelled() {
                    return;
                }

                let Some(record_id) = record_id else {
                    return;
                };

                let message = format!("handler panicked: {join_error}");
                match self.engine.fail(record_id, message.as_str()).await {
                    Ok(()) => self.metrics.record_failed(),
                    Err(error) => self.report_error(record_id, error),
                }
            }
        }
    }

    /// Failure to report a terminal transition leaves the record in
    /// `processing` for the reaper; the loop never retries the report
    /// in-line.
    fn report_error(&self, record_id: RecordId, error: CoreError) {
        self.metrics.report_error();
        warn!(
            flow = %self.settings.flow_name,
            instance_id = %self.instance_id,
            record_id = %record_id,
            error = %error,
            "failed to report record outcome; leaving it to the reaper"
        );
        self.events.emit(
            Event::new(EventComponent::Worker, "report_error")
                .level(EventLevel::Warn)
                .flow(&self.settings.flow_name)
                .instance(&self.instance_id)
                .record(record_id)
                .field("error", error.to_string()),
        );
    }

    async fn reap_tick(&self) {
        match self
            .engine
            .reap_orphans(self.settings.orphan_timeout)
            .await
        {
            Ok(count) => self.metrics.add_reaped(count),
            Err(error) => {
                warn!(
                    flow = %self.settings.flow_name,
                    instance_id = %self.instance_id,
                    error = %error,
                    "orphan reap failed"
                );
                self.events.emit(
                    Event::new(EventComponent::Worker, "reap_error")
                        .level(EventLevel::Warn)
                        .flow(&self.settings.flow_name)
                        .instance(&self.instance_id)
                        .field("error", error.to_string()),
                );
            }
        }
    }

    fn reap_due(&self, last_reap: Option<Instant>) -> bool {
        last_reap.is_none_or(|at| at.elapsed() >= self.settings.reap_interval)
    }

    async fn idle_pause(&self, shutdown: &mut watch::Receiver<bool>) {
        tokio::select! {
            _ = tokio::time::sleep(self.settings.idle_backoff) => {}
            _ = shutdown.changed() => {}
        }
    }
}

/// A dropped shutdown handle counts as a stop request; the alternative is
/// a loop nobody can stop.
fn stop_requested(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow() || shutdown.has_changed().is_err()
}

/// The persisted failure message for a handler error: the bare message for
/// a domain-level `HandlerError`, the rendered error otherwise.
fn handler_failure_message(error: CoreError) -> String {
    match error {
        CoreError::HandlerError(message) => message,
        other => other.to_string(),
    }
}
