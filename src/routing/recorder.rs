//! Event sink for reconciler outcomes
//!
//! Mirrors the control-plane convention of attaching human-readable events to
//! the object that caused them. The reconciler only emits `Synced` and
//! `ErrResourceExists`; the sink decides where they go.

use std::sync::Mutex;

use crate::models::ResourceKey;

/// Severity of a recorded event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

/// Reason: object processed successfully
pub const REASON_SYNCED: &str = "Synced";
/// Reason: a conflicting resource already exists
pub const REASON_ERR_RESOURCE_EXISTS: &str = "ErrResourceExists";
/// Reason: retries exhausted, event dropped
pub const REASON_RETRIES_EXHAUSTED: &str = "RetriesExhausted";

/// A recorded event attached to an object
#[derive(Debug, Clone)]
pub struct RecordedEvent {
    pub object: ResourceKey,
    pub event_type: EventType,
    pub reason: String,
    pub message: String,
}

/// Destination for reconciler events
pub trait EventSink: Send + Sync {
    fn record(&self, object: &ResourceKey, event_type: EventType, reason: &str, message: &str);
}

/// Sink that forwards events to the tracing subscriber
#[derive(Default)]
pub struct LogEventSink;

impl EventSink for LogEventSink {
    fn record(&self, object: &ResourceKey, event_type: EventType, reason: &str, message: &str) {
        match event_type {
            EventType::Normal => {
                tracing::info!(object = %object, reason = %reason, "{message}")
            }
            EventType::Warning => {
                tracing::warn!(object = %object, reason = %reason, "{message}")
            }
        }
    }
}

/// Sink that stores events for inspection in tests
#[derive(Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().expect("lock poisoned").clone()
    }

    pub fn reasons_for(&self, object: &ResourceKey) -> Vec<String> {
        self.events
            .lock()
            .expect("lock poisoned")
            .iter()
            .filter(|e| &e.object == object)
            .map(|e| e.reason.clone())
            .collect()
    }
}

impl EventSink for RecordingEventSink {
    fn record(&self, object: &ResourceKey, event_type: EventType, reason: &str, message: &str) {
        self.events.lock().expect("lock poisoned").push(RecordedEvent {
            object: object.clone(),
            event_type,
            reason: reason.to_string(),
            message: message.to_string(),
        });
    }
}
