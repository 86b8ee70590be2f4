//! Status event stream for hosts
//!
//! The engine reports milestones as ordered, opaque events; the host decides
//! how to present them. No event is required for correctness.

use std::collections::VecDeque;
use std::sync::Mutex;

/// Importance of a status event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// One status message from the engine
#[derive(Debug, Clone)]
pub struct StatusEvent {
    pub severity: Severity,
    pub message: String,
}

impl StatusEvent {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Info,
            message: message.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            message: message.into(),
        }
    }
}

/// Consumer of the engine's event stream, supplied at construction
pub trait EventSink: Send + Sync {
    fn emit(&self, event: StatusEvent);
}

/// Closures work directly as sinks
impl<F: Fn(StatusEvent) + Send + Sync> EventSink for F {
    fn emit(&self, event: StatusEvent) {
        self(event)
    }
}

/// Default sink: a queue the host drains via [`QueueSink::next_status`]
#[derive(Debug, Default)]
pub struct QueueSink {
    queue: Mutex<VecDeque<StatusEvent>>,
}

impl QueueSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pop the oldest pending event, if any
    pub fn next_status(&self) -> Option<StatusEvent> {
        self.queue.lock().expect("event queue poisoned").pop_front()
    }
}

impl EventSink for QueueSink {
    fn emit(&self, event: StatusEvent) {
        self.queue.lock().expect("event queue poisoned").push_back(event);
    }
}
