//! Sessions: the durable unit the facade creates, runs turns against, and
//! eventually tears down.
//!
//! History is append-only — `Session::append` is the only way a message
//! enters it — while context-variables and the active worker are mutable,
//! matching the data model's split between immutable and mutable session
//! state. [`SessionSnapshot`] is a lossless serialization of everything
//! except circuit-breaker and health state, which live with the Worker Pool
//! instead.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::ContextVariables;
use crate::message::Message;
use crate::permission::Decision;

/// A conversational session: history, context, and the worker currently
/// driving it.
#[derive(Debug, Clone)]
pub struct Session {
    /// Unique session identifier.
    pub id: String,
    history: Vec<Message>,
    /// The write-wins-last context overlay for this session.
    pub context_variables: ContextVariables,
    /// Id of the worker currently driving the conversation.
    pub active_worker_id: String,
    /// Ids of every plan created within this session, in creation order.
    pub plans: Vec<String>,
    /// Cached permission decisions, keyed by tool id.
    pub permission_decisions: HashMap<String, Decision>,
    /// Unix-epoch milliseconds the session was created.
    pub created_at: u64,
    /// Unix-epoch milliseconds of the session's last mutation.
    pub updated_at: u64,
}

impl Session {
    /// Create a new session owned by `default_worker_id`, timestamped `now`.
    #[must_use]
    pub fn new(id: impl Into<String>, default_worker_id: impl Into<String>, now: u64) -> Self {
        let id = id.into();
        Self {
            context_variables: ContextVariables::with_session(id.clone(), std::env::temp_dir().display().to_string()),
            id,
            history: Vec::new(),
            active_worker_id: default_worker_id.into(),
            plans: Vec::new(),
            permission_decisions: HashMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Append a message to the immutable history, bumping `updated_at`.
    pub fn append(&mut self, message: Message, now: u64) {
        self.history.push(message);
        self.updated_at = now;
    }

    /// The full history in append order.
    #[must_use]
    pub fn history(&self) -> &[Message] {
        &self.history
    }

    /// Record that `plan_id` was created within this session.
    pub fn record_plan(&mut self, plan_id: impl Into<String>) {
        self.plans.push(plan_id.into());
    }

    /// Switch the active worker, e.g. on a successful handoff.
    pub fn set_active_worker(&mut self, worker_id: impl Into<String>, now: u64) {
        self.active_worker_id = worker_id.into();
        self.updated_at = now;
    }

    /// Serialize this session's persisted fields into a [`SessionSnapshot`].
    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id.clone(),
            history: self.history.clone(),
            context_variables: self.context_variables.snapshot(),
            active_worker_id: self.active_worker_id.clone(),
            plans: self.plans.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    /// Reconstruct a session from a snapshot. Permission decisions are not
    /// part of the snapshot and start empty, per the snapshot's documented
    /// exclusion of circuit-breaker/health-adjacent state.
    #[must_use]
    pub fn restore(snapshot: SessionSnapshot) -> Self {
        let mut context_variables = ContextVariables::new();
        context_variables.merge(snapshot.context_variables);
        Self {
            id: snapshot.id,
            history: snapshot.history,
            context_variables,
            active_worker_id: snapshot.active_worker_id,
            plans: snapshot.plans,
            permission_decisions: HashMap::new(),
            created_at: snapshot.created_at,
            updated_at: snapshot.updated_at,
        }
    }
}

/// A structured, lossless (excluding circuit-breaker/health state)
/// serialization of a [`Session`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Session id.
    pub id: String,
    /// History in order.
    pub history: Vec<Message>,
    /// Context variables as a plain mapping.
    pub context_variables: HashMap<String, Value>,
    /// Active worker id, as a string.
    pub active_worker_id: String,
    /// Plan ids, as strings, in creation order.
    pub plans: Vec<String>,
    /// Creation timestamp.
    pub created_at: u64,
    /// Last-update timestamp.
    pub updated_at: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_only_grows_history_and_bumps_updated_at() {
        let mut session = Session::new("s1", "leader", 0);
        session.append(Message::user("m1", "hi", 1), 1);
        assert_eq!(session.history().len(), 1);
        assert_eq!(session.updated_at, 1);
    }

    #[test]
    fn snapshot_round_trips_history_and_context() {
        let mut session = Session::new("s1", "leader", 0);
        session.append(Message::user("m1", "hi", 1), 1);
        session.context_variables.set("custom", Value::String("x".into()));

        let snapshot = session.snapshot();
        let json = serde_json::to_string(&snapshot).unwrap();
        let restored_snapshot: SessionSnapshot = serde_json::from_str(&json).unwrap();
        let restored = Session::restore(restored_snapshot);

        assert_eq!(restored.history().len(), 1);
        assert_eq!(restored.context_variables.get_str("custom"), Some("x"));
        assert_eq!(restored.active_worker_id, "leader");
    }
}
