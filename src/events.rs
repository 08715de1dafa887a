// =============================================================================
// Event Bus — structured engine events with bounded backpressure
// =============================================================================
//
// Two lanes:
//
//   ACTION  — exit/stop/order/plan state changes. Unbounded; these are never
//             dropped.
//   CONTEXT — feature readings, classifications, advisory chatter. Bounded;
//             dropped first under backpressure with a counter.
//
// A single writer task (persist.rs) drains both lanes, batches them into the
// append-only event log, and forwards action events to the webhook sink.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::warn;

/// Event severity, ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Critical,
}

/// Which backpressure lane an event travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EventClass {
    Context,
    Action,
}

/// A structured engine event. Payload stays low-cardinality JSON.
#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    pub ts_ms: i64,
    pub component: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ticket: Option<u64>,
    pub kind: String,
    pub payload: serde_json::Value,
    pub severity: Severity,
    pub class: EventClass,
}

impl EventRecord {
    /// An action-lane event (state changes, orders, exits). Never dropped.
    pub fn action(component: &'static str, kind: impl Into<String>) -> Self {
        Self {
            ts_ms: Utc::now().timestamp_millis(),
            component,
            symbol: None,
            ticket: None,
            kind: kind.into(),
            payload: serde_json::Value::Null,
            severity: Severity::Info,
            class: EventClass::Action,
        }
    }

    /// A context-lane event (readings, advisories). Droppable.
    pub fn context(component: &'static str, kind: impl Into<String>) -> Self {
        Self {
            class: EventClass::Context,
            ..Self::action(component, kind)
        }
    }

    pub fn with_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.symbol = Some(symbol.into());
        self
    }

    pub fn with_ticket(mut self, ticket: u64) -> Self {
        self.ticket = Some(ticket);
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }
}

/// Sender half of the event bus. Cheap to clone.
#[derive(Clone)]
pub struct EventBus {
    action_tx: mpsc::UnboundedSender<EventRecord>,
    context_tx: mpsc::Sender<EventRecord>,
    dropped: Arc<AtomicU64>,
}

/// Receiver half, owned by the writer task.
pub struct EventReceivers {
    pub action_rx: mpsc::UnboundedReceiver<EventRecord>,
    pub context_rx: mpsc::Receiver<EventRecord>,
}

/// Build the bus with a bounded context lane.
pub fn channel(context_capacity: usize) -> (EventBus, EventReceivers) {
    let (action_tx, action_rx) = mpsc::unbounded_channel();
    let (context_tx, context_rx) = mpsc::channel(context_capacity);
    (
        EventBus {
            action_tx,
            context_tx,
            dropped: Arc::new(AtomicU64::new(0)),
        },
        EventReceivers {
            action_rx,
            context_rx,
        },
    )
}

impl EventBus {
    /// Publish without blocking. Context events are dropped (and counted)
    /// when the lane is full; action events always enqueue.
    pub fn publish(&self, record: EventRecord) {
        match record.class {
            EventClass::Action => {
                if self.action_tx.send(record).is_err() {
                    warn!("event writer gone — action event lost");
                }
            }
            EventClass::Context => {
                if self.context_tx.try_send(record).is_err() {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    pub fn dropped_context_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn action_events_never_dropped() {
        let (bus, mut rx) = channel(1);
        for i in 0..100 {
            bus.publish(
                EventRecord::action("exit", "sl_moved")
                    .with_ticket(i)
                    .with_severity(Severity::Info),
            );
        }
        let mut count = 0;
        while rx.action_rx.try_recv().is_ok() {
            count += 1;
        }
        assert_eq!(count, 100);
        assert_eq!(bus.dropped_context_events(), 0);
    }

    #[tokio::test]
    async fn context_events_dropped_when_full() {
        let (bus, mut rx) = channel(2);
        for _ in 0..10 {
            bus.publish(EventRecord::context("regime", "classified"));
        }
        let mut received = 0;
        while rx.context_rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, 2);
        assert_eq!(bus.dropped_context_events(), 8);
    }

    #[test]
    fn severity_ordering() {
        assert!(Severity::Critical > Severity::Warning);
        assert!(Severity::Warning > Severity::Info);
        assert!(Severity::Info > Severity::Debug);
    }

    #[test]
    fn builder_fields() {
        let record = EventRecord::action("oco", "pair_triggered")
            .with_symbol("XAUUSD")
            .with_ticket(42)
            .with_payload(serde_json::json!({"group_id": "g1"}))
            .with_severity(Severity::Warning);
        assert_eq!(record.symbol.as_deref(), Some("XAUUSD"));
        assert_eq!(record.ticket, Some(42));
        assert_eq!(record.severity, Severity::Warning);
        assert_eq!(record.class, EventClass::Action);
    }
}
