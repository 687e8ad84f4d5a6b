//! Request event tracing.
//!
//! Recorders are purely observational: the scheduler behaves the same with
//! or without one.

use std::time::Instant;

/// Sink for `(request id, event name)` pairs.
pub trait EventTraceRecorder {
    fn add_event(&mut self, request_id: &str, event: &str);
}

/// A recorded event.
#[derive(Debug, Clone)]
pub struct TraceEvent {
    pub request_id: String,
    pub event: String,
    pub at: Instant,
}

/// In-memory recorder that also forwards every event to `tracing`.
#[derive(Debug, Default)]
pub struct EventTraceLog {
    events: Vec<TraceEvent>,
}

impl EventTraceLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    /// Events recorded for one request, oldest first.
    pub fn events_for<'a>(&'a self, request_id: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.events
            .iter()
            .filter(move |e| e.request_id == request_id)
            .map(|e| e.event.as_str())
    }
}

impl EventTraceRecorder for EventTraceLog {
    fn add_event(&mut self, request_id: &str, event: &str) {
        tracing::trace!(request_id, event, "trace event");
        self.events.push(TraceEvent {
            request_id: request_id.to_string(),
            event: event.to_string(),
            at: Instant::now(),
        });
    }
}

/// Record `event` if a recorder is present.
pub fn record_event(recorder: Option<&mut dyn EventTraceRecorder>, request_id: &str, event: &str) {
    if let Some(recorder) = recorder {
        recorder.add_event(request_id, event);
    }
}
