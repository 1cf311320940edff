//! Domain event bus: trait for emitting sequence events from any module.
//!
//! Modules accept an `Arc<dyn EventSink>` to push enrollment and dispatch
//! events towards audit logging, webhooks or analytics.

use crate::types::{DomainEvent, EventType};
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use uuid::Uuid;

/// Trait for emitting domain events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: DomainEvent);
}

/// No-op sink for modules that don't need event emission.
pub struct NoOpSink;

impl EventSink for NoOpSink {
    fn emit(&self, _event: DomainEvent) {}
}

/// Sink that forwards every event to the tracing subscriber.
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: DomainEvent) {
        tracing::info!(
            event_type = ?event.event_type,
            enrollment_id = ?event.enrollment_id,
            sequence_id = ?event.sequence_id,
            step_order = ?event.step_order,
            "Domain event"
        );
    }
}

/// In-memory sink that captures events for testing.
#[derive(Default)]
pub struct CaptureSink {
    events: Mutex<Vec<DomainEvent>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<DomainEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.events.lock().len()
    }

    pub fn count_type(&self, event_type: EventType) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for CaptureSink {
    fn emit(&self, event: DomainEvent) {
        self.events.lock().push(event);
    }
}

/// Convenience builder for creating a `DomainEvent` with minimal boilerplate.
pub fn make_event(
    event_type: EventType,
    enrollment_id: Option<Uuid>,
    sequence_id: Option<Uuid>,
    customer_id: Option<Uuid>,
    step_order: Option<u32>,
) -> DomainEvent {
    DomainEvent {
        event_id: Uuid::new_v4(),
        event_type,
        enrollment_id,
        sequence_id,
        customer_id,
        step_order,
        node_id: "local".into(),
        timestamp: Utc::now(),
    }
}

/// Convenience: create a no-op event bus for modules that don't need it.
pub fn noop_sink() -> Arc<dyn EventSink> {
    Arc::new(NoOpSink)
}

/// Convenience: create a capture sink for tests.
pub fn capture_sink() -> Arc<CaptureSink> {
    Arc::new(CaptureSink::new())
}
