use std::fmt::{Display, Formatter};

use chrono::{DateTime, Utc};
use flowline_core::{CoreError, CoreResult, FlowName};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Opaque monotonic identifier of one queue record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordId(i64);

impl RecordId {
    /// Wraps a raw store identifier.
    #[must_use]
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// Returns the raw store identifier.
    #[must_use]
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl Display for RecordId {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

/// Lifecycle status of a queue record.
///
/// `pending` is the initial state, `completed` is terminal, and `failed`
/// may return to `pending` through a reset. The only permitted edges are
/// claim (`pending → processing`), complete (`processing → completed`),
/// fail (`processing → failed`), reap (`processing → pending`), and reset
/// (`failed → pending`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    /// Waiting to be claimed.
    Pending,
    /// Claimed by exactly one instance.
    Processing,
    /// Finished successfully; terminal.
    Completed,
    /// Handler reported a failure; may be reset back to pending.
    Failed,
}

impl RecordStatus {
    /// Returns the stable store representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Parses the stable store representation.
    pub fn parse(value: &str) -> CoreResult<Self> {
        match value {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(CoreError::QueryFailed(format!(
                "unknown record status '{other}' read from store"
            ))),
        }
    }

    /// Whether the lifecycle permits moving from this status to `next`.
    #[must_use]
    pub fn can_transition_to(&self, next: RecordStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Processing)
                | (Self::Processing, Self::Completed)
                | (Self::Processing, Self::Failed)
                | (Self::Processing, Self::Pending)
                | (Self::Failed, Self::Pending)
        )
    }

    /// Whether no further transitions leave this status.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

impl Display for RecordStatus {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Full snapshot of one persisted queue record.
#[derive(Debug, Clone, Serialize)]
pub struct QueueRecord {
    /// Opaque unique identifier.
    pub id: RecordId,
    /// Flow the record belongs to.
    pub flow_name: FlowName,
    /// Opaque structured document; replaced by the result on completion.
    pub payload: Value,
    /// Lifecycle status.
    pub status: RecordStatus,
    /// Claiming instance; set exactly while `status` is `processing`.
    pub instance_id: Option<String>,
    /// Claim timestamp; set exactly while `status` is `processing`.
    pub claimed_at: Option<DateTime<Utc>>,
    /// Completion timestamp; set on the transition into `completed`.
    pub completed_at: Option<DateTime<Utc>>,
    /// Failure description; set on the transition into `failed`.
    pub error_message: Option<String>,
    /// Failure-equivalent count: advances on `fail` and on orphan reap.
    pub retry_count: u32,
    /// Creation timestamp; immutable.
    pub created_at: DateTime<Utc>,
    /// Timestamp of the last mutation.
    pub updated_at: DateTime<Utc>,
}

impl QueueRecord {
    /// Verifies the per-status field invariants of the record lifecycle.
    #[must_use]
    pub fn invariants_hold(&self) -> bool {
        match self.status {
            RecordStatus::Pending => self.instance_id.is_none() && self.claimed_at.is_none(),
            RecordStatus::Processing => self.instance_id.is_some() && self.claimed_at.is_some(),
            RecordStatus::Completed => self.completed_at.is_some(),
            RecordStatus::Failed => self.error_message.is_some(),
        }
    }
}

/// The slice of a record handed to a worker by `claim_batch`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimedRecord {
    /// Record identifier used to report completion or failure.
    pub id: RecordId,
    /// Input payload for the handler.
    pub payload: Value,
    /// Failure-equivalent count observed at claim time.
    pub retry_count: u32,
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use flowline_core::FlowName;
    use proptest::prelude::*;
    use serde_json::json;

    use super::{QueueRecord, RecordId, RecordStatus};

    #[test]
    fn status_round_trips_through_store_representation() {
        for status in [
            RecordStatus::Pending,
            RecordStatus::Processing,
            RecordStatus::Completed,
            RecordStatus::Failed,
        ] {
            assert_eq!(RecordStatus::parse(status.as_str()).ok(), Some(status));
        }
    }

    #[test]
    fn unknown_status_text_is_rejected() {
        assert!(RecordStatus::parse("leased").is_err());
    }

    #[test]
    fn completed_is_the_only_terminal_status() {
        assert!(RecordStatus::Completed.is_terminal());
        assert!(!RecordStatus::Failed.is_terminal());
        assert!(!RecordStatus::Pending.is_terminal());
        assert!(!RecordStatus::Processing.is_terminal());
    }

    #[test]
    fn permitted_edges_match_the_lifecycle() {
        assert!(RecordStatus::Pending.can_transition_to(RecordStatus::Processing));
        assert!(RecordStatus::Processing.can_transition_to(RecordStatus::Completed));
        assert!(RecordStatus::Processing.can_transition_to(RecordStatus::Failed));
        assert!(RecordStatus::Processing.can_transition_to(RecordStatus::Pending));
        assert!(RecordStatus::Failed.can_transition_to(RecordStatus::Pending));

        assert!(!RecordStatus::Pending.can_transition_to(RecordStatus::Completed));
        assert!(!RecordStatus::Pending.can_transition_to(RecordStatus::Failed));
        assert!(!RecordStatus::Completed.can_transition_to(RecordStatus::Pending));
        assert!(!RecordStatus::Completed.can_transition_to(RecordStatus::Processing));
        assert!(!RecordStatus::Completed.can_transition_to(RecordStatus::Failed));
        assert!(!RecordStatus::Failed.can_transition_to(RecordStatus::Processing));
        assert!(!RecordStatus::Failed.can_transition_to(RecordStatus::Completed));
    }

    /// Lifecycle operations a caller may attempt against one record.
    #[derive(Debug, Clone, Copy)]
    enum LifecycleOp {
        Claim,
        Complete,
        Fail,
        Reap,
        Reset,
    }

    impl LifecycleOp {
        fn target(self) -> RecordStatus {
            match self {
                Self::Claim => RecordStatus::Processing,
                Self::Complete => RecordStatus::Completed,
                Self::Fail => RecordStatus::Failed,
                Self::Reap | Self::Reset => RecordStatus::Pending,
            }
        }
    }

    fn fresh_record() -> QueueRecord {
        let now = Utc::now();
        let flow_name = match FlowName::new("prop_flow") {
            Ok(value) => value,
            Err(error) => panic!("flow name rejected: {error}"),
        };

        QueueRecord {
            id: RecordId::new(1),
            flow_name,
            payload: json!({"value": 1}),
            status: RecordStatus::Pending,
            instance_id: None,
            claimed_at: None,
            completed_at: None,
            error_message: None,
            retry_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn apply(record: &mut QueueRecord, op: LifecycleOp) -> bool {
        if !record.status.can_transition_to(op.target()) {
            return false;
        }

        // Reap only applies to claimed rows, reset only to failed ones; the
        // shared target state keeps can_transition_to from separating them.
        match (op, record.status) {
            (LifecycleOp::Reap, RecordStatus::Processing)
            | (LifecycleOp::Reset, RecordStatus::Failed) => {}
            (LifecycleOp::Reap | LifecycleOp::Reset, _) => return false,
            _ => {}
        }

        let now = Utc::now();
        match op {
            LifecycleOp::Claim => {
                record.status = RecordStatus::Processing;
                record.instance_id = Some("host-00000000".to_owned());
                record.claimed_at = Some(now);
            }
            LifecycleOp::Complete => {
                record.status = RecordStatus::Completed;
                record.instance_id = None;
                record.claimed_at = None;
                record.completed_at = Some(now);
            }
            LifecycleOp::Fail => {
                record.status = RecordStatus::Failed;
                record.instance_id = None;
                record.claimed_at = None;
                record.error_message = Some("handler failed".to_owned());
                record.retry_count += 1;
            }
            LifecycleOp::Reap => {
                record.status = RecordStatus::Pending;
                record.instance_id = None;
                record.claimed_at = None;
                record.retry_count += 1;
            }
            LifecycleOp::Reset => {
                record.status = RecordStatus::Pending;
                record.error_message = None;
            }
        }
        record.updated_at = now;
        true
    }

    fn lifecycle_op_strategy() -> impl Strategy<Value = LifecycleOp> {
        prop_oneof![
            Just(LifecycleOp::Claim),
            Just(LifecycleOp::Complete),
            Just(LifecycleOp::Fail),
            Just(LifecycleOp::Reap),
            Just(LifecycleOp::Reset),
        ]
    }

    proptest! {
        /// Any sequence of attempted operations keeps the record on a valid
        /// path: field invariants hold after every applied edge, retry_count
        /// never decreases, and nothing leaves the completed state.
        #[test]
        fn lifecycle_paths_preserve_invariants(ops in prop::collection::vec(lifecycle_op_strategy(), 0..40)) {
            let mut record = fresh_record();
            prop_assert!(record.invariants_hold());

            for op in ops {
                let retries_before = record.retry_count;
                let was_completed = record.status == RecordStatus::Completed;

                let applied = apply(&mut record, op);

                prop_assert!(record.invariants_hold());
                prop_assert!(record.retry_count >= retries_before);
                if was_completed {
                    prop_assert!(!applied);
                    prop_assert_eq!(record.status, RecordStatus::Completed);
                }
            }
        }
    }
}
