//! Operator lifecycle event delivery.
//!
//! The engine reports `OperatorEvent`s to an optional [`OperatorEventSink`].
//! [`EventBus`] is a sink that fans events out to any number of
//! `tokio::sync::broadcast` subscribers.

pub mod bus;

pub use bus::EventBus;

use technique_types::event::OperatorEvent;

/// Receiver of operator lifecycle events. Must not block.
pub trait OperatorEventSink: Send + Sync {
    fn emit(&self, event: &OperatorEvent);
}

/// Sink that records events in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: std::sync::Mutex<Vec<OperatorEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the events seen so far.
    pub fn events(&self) -> Vec<OperatorEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl OperatorEventSink for RecordingSink {
    fn emit(&self, event: &OperatorEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}
