//! The Event sink: typed lifecycle events fanned out over a bounded,
//! non-blocking bus.
//!
//! Every component that observes session/plan/step/worker lifecycle state
//! emits through an [`EventSink`] rather than calling into observers
//! directly — this keeps publishers decoupled from whatever is listening
//! (structured logs, metrics, a UI). Per the concurrency model, publishing
//! must never block: [`EventBus`] is backed by a bounded channel and drops
//! the oldest-pending event with a running counter when saturated, rather
//! than applying backpressure to the publisher.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The payload carried by an [`Event`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    /// A new session was created.
    SessionCreated {
        /// Session id.
        session_id: String,
    },
    /// A conversation turn began.
    TurnStart {
        /// Session the turn belongs to.
        session_id: String,
    },
    /// A conversation turn completed.
    TurnEnd {
        /// Session the turn belongs to.
        session_id: String,
    },
    /// An execution plan was created.
    PlanCreated {
        /// Plan id.
        plan_id: String,
    },
    /// An execution plan began running.
    PlanStarted {
        /// Plan id.
        plan_id: String,
    },
    /// An execution plan completed successfully.
    PlanCompleted {
        /// Plan id.
        plan_id: String,
    },
    /// An execution plan failed.
    PlanFailed {
        /// Plan id.
        plan_id: String,
        /// Human-readable reason.
        reason: String,
    },
    /// A step started running.
    StepStarted {
        /// Plan the step belongs to.
        plan_id: String,
        /// Step id.
        step_id: String,
    },
    /// A step completed successfully.
    StepCompleted {
        /// Plan the step belongs to.
        plan_id: String,
        /// Step id.
        step_id: String,
    },
    /// A step failed.
    StepFailed {
        /// Plan the step belongs to.
        plan_id: String,
        /// Step id.
        step_id: String,
        /// Human-readable reason.
        reason: String,
    },
    /// A permission decision was requested.
    PermissionRequested {
        /// Session the request belongs to.
        session_id: String,
        /// Tool being requested.
        tool: String,
    },
    /// A permission decision was granted (immediately or after a prompt).
    PermissionGranted {
        /// Session the decision belongs to.
        session_id: String,
        /// Tool the decision covers.
        tool: String,
    },
    /// A worker was registered with the pool.
    WorkerRegistered {
        /// Worker id.
        worker_id: String,
    },
    /// A worker was deregistered from the pool.
    WorkerUnregistered {
        /// Worker id.
        worker_id: String,
    },
    /// Control handed off from one worker to another.
    Handoff {
        /// Session the handoff occurred in.
        session_id: String,
        /// Worker handing off.
        from_worker: String,
        /// Worker receiving control.
        to_worker: String,
    },
    /// A worker's circuit breaker opened.
    CircuitOpened {
        /// Worker whose breaker opened.
        worker_id: String,
    },
    /// A worker's circuit breaker closed.
    CircuitClosed {
        /// Worker whose breaker closed.
        worker_id: String,
    },
    /// Rollback of a plan's completed steps began.
    RollbackStarted {
        /// Plan being rolled back.
        plan_id: String,
    },
    /// Rollback of a plan's completed steps finished.
    RollbackCompleted {
        /// Plan that was rolled back.
        plan_id: String,
    },
}

/// A single emitted event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unix-epoch milliseconds the event was emitted at.
    pub timestamp: u64,
    /// Correlates events belonging to the same session/plan/turn.
    pub correlation_id: String,
    /// The event's typed payload.
    pub payload: EventPayload,
    /// Free-form structured fields not captured by `payload`'s variant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<Value>,
}

impl Event {
    /// Construct a new event with no extra fields.
    #[must_use]
    pub const fn new(timestamp: u64, correlation_id: String, payload: EventPayload) -> Self {
        Self {
            timestamp,
            correlation_id,
            payload,
            extra: None,
        }
    }
}

/// Receives emitted events.
///
/// Implementations must not block meaningfully in `on_event` — the bus
/// already guarantees non-blocking delivery to each subscriber's own queue,
/// but a slow synchronous handler still stalls the dispatch loop for every
/// other subscriber.
pub trait EventSink: Send + Sync {
    /// Handle one event.
    fn on_event(&self, event: &Event);
}

/// An [`EventSink`] that discards every event. Used where observability is
/// wired up optionally.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn on_event(&self, _event: &Event) {}
}

/// An [`EventSink`] that emits each event as a `tracing` record.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn on_event(&self, event: &Event) {
        tracing::info!(
            correlation_id = %event.correlation_id,
            payload = ?event.payload,
            "engine event",
        );
    }
}

/// A bounded, non-blocking event bus.
///
/// Publishing is fire-and-forget: a full channel drops the event and
/// increments [`EventBus::dropped`] rather than ever blocking the caller,
/// matching the concurrency model's requirement that event emission never
/// applies backpressure to a publisher.
pub struct EventBus {
    sender: tokio::sync::broadcast::Sender<Event>,
    dropped: Arc<AtomicU64>,
    sinks: std::sync::Mutex<Vec<Arc<dyn EventSink>>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("dropped", &self.dropped.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl EventBus {
    /// Create a bus whose internal channel holds at most `capacity` pending
    /// events per subscriber before the oldest is dropped.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _receiver) = tokio::sync::broadcast::channel(capacity.max(1));
        Self {
            sender,
            dropped: Arc::new(AtomicU64::new(0)),
            sinks: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Register a sink that will receive every event published from now on.
    ///
    /// Sinks are driven by a background task spawned on first registration;
    /// call [`EventBus::spawn_dispatch`] once a runtime is available.
    pub fn add_sink(&self, sink: Arc<dyn EventSink>) {
        self.sinks.lock().unwrap_or_else(std::sync::PoisonError::into_inner).push(sink);
    }

    /// Publish an event. Never blocks; silently drops (counted) if no
    /// subscriber has room, or if there are currently no subscribers.
    pub fn publish(&self, event: Event) {
        if self.sender.send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Total events dropped because no subscriber had room.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Subscribe a fresh receiver to this bus's events.
    #[must_use]
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Drive every registered sink from a freshly-subscribed receiver until
    /// the bus (and every sender clone) is dropped. Intended to be spawned
    /// once onto the async runtime.
    pub async fn run_dispatch_loop(&self) {
        let mut receiver = self.subscribe();
        loop {
            match receiver.recv().await {
                Ok(event) => {
                    let sinks = self
                        .sinks
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner)
                        .clone();
                    for sink in &sinks {
                        sink.on_event(&event);
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    self.dropped.fetch_add(n, Ordering::Relaxed);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_without_subscribers_counts_as_dropped() {
        let bus = EventBus::new(8);
        bus.publish(Event::new(
            0,
            "corr-1".into(),
            EventPayload::SessionCreated {
                session_id: "s1".into(),
            },
        ));
        assert_eq!(bus.dropped(), 1);
    }

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::new(8);
        let mut receiver = bus.subscribe();
        bus.publish(Event::new(
            0,
            "corr-1".into(),
            EventPayload::WorkerRegistered {
                worker_id: "w1".into(),
            },
        ));
        let event = receiver.recv().await.unwrap();
        assert!(matches!(event.payload, EventPayload::WorkerRegistered { .. }));
    }

    #[test]
    fn null_sink_does_nothing_observable() {
        let sink = NullSink;
        sink.on_event(&Event::new(
            0,
            "c".into(),
            EventPayload::TurnStart {
                session_id: "s".into(),
            },
        ));
    }
}
