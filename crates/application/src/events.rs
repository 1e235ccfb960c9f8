//! Structured event contract.
//!
//! Every state transition emits one event through a pluggable sink. Events
//! are advisory: a dropped event never affects queue correctness, so the
//! sink interface is infallible and adapters swallow their own I/O errors.

use chrono::{DateTime, Utc};
use flowline_core::{FlowName, InstanceId};
use flowline_domain::RecordId;
use serde::Serialize;
use serde_json::{Map, Value};

/// Severity of an emitted event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    /// Routine transition.
    Info,
    /// Recoverable anomaly worth operator attention.
    Warn,
    /// Failure that surfaced to a caller.
    Error,
}

/// Component that emitted an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventComponent {
    /// Store access layer.
    Store,
    /// Migration runner.
    Migration,
    /// Queue engine.
    Queue,
    /// Worker loop.
    Worker,
    /// Health and metrics composition.
    Health,
}

/// One structured event. Serializes to a single flat JSON object;
/// event-specific fields are flattened next to the required ones, and
/// consumers must tolerate unknown fields.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    /// Emission timestamp, UTC.
    pub ts: DateTime<Utc>,
    /// Severity.
    pub level: EventLevel,
    /// Emitting component.
    pub component: EventComponent,
    /// Stable snake_case event name.
    pub event: String,
    /// Flow the event concerns, when scoped to one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flow: Option<String>,
    /// Worker instance the event concerns, when scoped to one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    /// Queue record the event concerns, when scoped to one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_id: Option<i64>,
    /// Event-specific fields.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Event {
    /// Creates an info-level event for the given component and name.
    #[must_use]
    pub fn new(component: EventComponent, event: impl Into<String>) -> Self {
        Self {
            ts: Utc::now(),
            level: EventLevel::Info,
            component,
            event: event.into(),
            flow: None,
            instance_id: None,
            record_id: None,
            fields: Map::new(),
        }
    }

    /// Sets the severity.
    #[must_use]
    pub fn level(mut self, level: EventLevel) -> Self {
        self.level = level;
        self
    }

    /// Scopes the event to a flow.
    #[must_use]
    pub fn flow(mut self, flow_name: &FlowName) -> Self {
        self.flow = Some(flow_name.as_str().to_owned());
        self
    }

    /// Scopes the event to a worker instance.
    #[must_use]
    pub fn instance(mut self, instance_id: &InstanceId) -> Self {
        self.instance_id = Some(instance_id.as_str().to_owned());
        self
    }

    /// Scopes the event to a queue record.
    #[must_use]
    pub fn record(mut self, record_id: RecordId) -> Self {
        self.record_id = Some(record_id.as_i64());
        self
    }

    /// Attaches one event-specific field.
    #[must_use]
    pub fn field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }
}

/// Pluggable destination for structured events. Must be safe under
/// concurrent writes; the default adapter writes JSON lines to stderr.
pub trait EventSink: Send + Sync {
    /// Delivers one event. Never fails; adapters drop events they cannot
    /// write.
    fn emit(&self, event: Event);
}
