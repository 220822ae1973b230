//! Lifecycle events emitted while a pipeline runs.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info, Level};

/// Emitted when a run starts.
pub const PIPELINE_STARTED: &str = "pipeline.started";
/// Emitted once parameters and metadata are resolved.
pub const PIPELINE_PARAMETERS_RESOLVED: &str = "pipeline.parameters_resolved";
/// Emitted when every step has run.
pub const PIPELINE_COMPLETED: &str = "pipeline.completed";
/// Emitted when a run stops on a strict failure.
pub const PIPELINE_FAILED: &str = "pipeline.failed";
/// Emitted before a step's operation is invoked.
pub const STEP_STARTED: &str = "step.started";
/// Emitted when a step succeeds.
pub const STEP_COMPLETED: &str = "step.completed";
/// Emitted when a step fails under a strict policy.
pub const STEP_FAILED: &str = "step.failed";
/// Emitted when a step fails under `warn` or `ignore`.
pub const STEP_SKIPPED_FAILURE: &str = "step.skipped_failure";

/// Receives lifecycle events.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Emits an event.
    async fn emit(&self, event_type: &str, data: Option<Value>);

    /// Emits an event without waiting. Must never panic.
    fn try_emit(&self, event_type: &str, data: Option<Value>);
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn emit(&self, _event_type: &str, _data: Option<Value>) {}

    fn try_emit(&self, _event_type: &str, _data: Option<Value>) {}
}

/// Writes events to `tracing`.
#[derive(Debug, Clone)]
pub struct LoggingEventSink {
    level: Level,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingEventSink {
    /// Creates a sink logging at `level` (`DEBUG` or `INFO`).
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    fn log(&self, event_type: &str, data: Option<&Value>) {
        if self.level == Level::DEBUG {
            debug!(event_type = %event_type, event_data = ?data, "Event: {}", event_type);
        } else {
            info!(event_type = %event_type, event_data = ?data, "Event: {}", event_type);
        }
    }
}

#[async_trait]
impl EventSink for LoggingEventSink {
    async fn emit(&self, event_type: &str, data: Option<Value>) {
        self.log(event_type, data.as_ref());
    }

    fn try_emit(&self, event_type: &str, data: Option<Value>) {
        self.log(event_type, data.as_ref());
    }
}

/// An event captured by [`CollectingEventSink`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedEvent {
    /// Event type.
    pub event_type: String,
    /// Event payload.
    pub data: Option<Value>,
}

/// Keeps every event in memory, for tests.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: RwLock<Vec<RecordedEvent>>,
}

impl CollectingEventSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All events in emission order.
    #[must_use]
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.read().clone()
    }

    /// Event types in emission order.
    #[must_use]
    pub fn types(&self) -> Vec<String> {
        self.events.read().iter().map(|e| e.event_type.clone()).collect()
    }

    /// Events whose type starts with `prefix`.
    #[must_use]
    pub fn events_of_type(&self, prefix: &str) -> Vec<RecordedEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.event_type.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Number of events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if nothing was emitted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    fn record(&self, event_type: &str, data: Option<Value>) {
        self.events.write().push(RecordedEvent {
            event_type: event_type.to_string(),
            data,
        });
    }
}

#[async_trait]
impl EventSink for CollectingEventSink {
    async fn emit(&self, event_type: &str, data: Option<Value>) {
        self.record(event_type, data);
    }

    fn try_emit(&self, event_type: &str, data: Option<Value>) {
        self.record(event_type, data);
    }
}

/// Adds `run_id` and `pipeline` to every event of one run.
#[derive(Clone)]
pub struct RunEvents {
    sink: Arc<dyn EventSink>,
    run_id: String,
    pipeline: String,
}

impl RunEvents {
    /// Creates an emitter for one run.
    #[must_use]
    pub fn new(sink: Arc<dyn EventSink>, run_id: impl Into<String>, pipeline: impl Into<String>) -> Self {
        Self {
            sink,
            run_id: run_id.into(),
            pipeline: pipeline.into(),
        }
    }

    /// Emits `event_type` with `fields` plus the run enrichment.
    pub async fn emit(&self, event_type: &str, fields: Value) {
        let mut data = match fields {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        data.insert("run_id".to_string(), Value::String(self.run_id.clone()));
        data.insert("pipeline".to_string(), Value::String(self.pipeline.clone()));
        self.sink.emit(event_type, Some(Value::Object(data))).await;
    }
}

impl std::fmt::Debug for RunEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunEvents")
            .field("run_id", &self.run_id)
            .field("pipeline", &self.pipeline)
            .finish_non_exhaustive()
    }
}
