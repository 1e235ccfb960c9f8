//! Default event sink: one JSON object per line on stderr.

use std::io::Write;

use flowline_application::{Event, EventSink};

/// Writes events as JSON lines to stderr. Safe under concurrent writes
/// (each line is written under the stderr lock) and silent on I/O errors,
/// because event loss must never affect queue correctness.
#[derive(Debug, Clone, Copy, Default)]
pub struct StderrEventSink;

impl StderrEventSink {
    /// Creates the sink.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

fn encode(event: &Event) -> Option<String> {
    serde_json::to_string(event).ok()
}

impl EventSink for StderrEventSink {
    fn emit(&self, event: Event) {
        if let Some(line) = encode(&event) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{line}");
        }
    }
}
