//! Rollback: undoing a plan's completed steps in reverse order after an
//! unrecoverable failure, when the plan was created with
//! `rollback_on_failure`.
//!
//! Rollback is best-effort: a failing rollback action is logged and the
//! stack continues unwinding rather than aborting, since stopping halfway
//! would leave side effects in a worse, partially-undone state than either
//! fully rolled back or not rolled back at all.

use crate::tool::SideEffect;

/// A record of one completed step's side effects, pushed when the step
/// completes and popped (LIFO) during rollback.
#[derive(Debug, Clone)]
pub struct RollbackRecord {
    /// The step this record undoes.
    pub step_id: String,
    /// Side effects the step's tool reported, to be undone in reverse order.
    pub side_effects: Vec<SideEffect>,
}

/// The outcome of attempting to undo a single [`RollbackRecord`].
#[derive(Debug, Clone)]
pub struct RollbackOutcome {
    /// The step that was rolled back.
    pub step_id: String,
    /// Side effects that could not be undone, with a reason each.
    pub failures: Vec<(SideEffect, String)>,
}

/// A LIFO stack of completed steps' side effects, unwound on plan failure.
#[derive(Debug, Clone, Default)]
pub struct RollbackStack {
    records: Vec<RollbackRecord>,
}

impl RollbackStack {
    /// An empty stack.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a completed step's side effects.
    pub fn push(&mut self, step_id: impl Into<String>, side_effects: Vec<SideEffect>) {
        self.records.push(RollbackRecord { step_id: step_id.into(), side_effects });
    }

    /// Number of steps currently recorded.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no steps are recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Unwind every recorded step in reverse (LIFO) order, invoking `undo`
    /// for each side effect. `undo` returns `Err(reason)` for a side effect
    /// it could not reverse; such failures are collected but do not stop
    /// the unwind.
    pub fn unwind<F>(&mut self, mut undo: F) -> Vec<RollbackOutcome>
    where
        F: FnMut(&str, &SideEffect) -> Result<(), String>,
    {
        let mut outcomes = Vec::with_capacity(self.records.len());
        while let Some(record) = self.records.pop() {
            let mut failures = Vec::new();
            for effect in record.side_effects.iter().rev() {
                if let Err(reason) = undo(&record.step_id, effect) {
                    failures.push((effect.clone(), reason));
                }
            }
            outcomes.push(RollbackOutcome { step_id: record.step_id, failures });
        }
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unwinds_in_reverse_order() {
        let mut stack = RollbackStack::new();
        stack.push("s1", vec![SideEffect::new("fs", "wrote a.txt")]);
        stack.push("s2", vec![SideEffect::new("fs", "wrote b.txt")]);

        let mut order = Vec::new();
        let outcomes = stack.unwind(|step_id, _effect| {
            order.push(step_id.to_string());
            Ok(())
        });

        assert_eq!(order, vec!["s2".to_string(), "s1".to_string()]);
        assert!(outcomes.iter().all(|o| o.failures.is_empty()));
        assert!(stack.is_empty());
    }

    #[test]
    fn a_failing_undo_does_not_stop_the_unwind() {
        let mut stack = RollbackStack::new();
        stack.push("s1", vec![SideEffect::new("fs", "wrote a.txt")]);
        stack.push("s2", vec![SideEffect::new("fs", "wrote b.txt")]);

        let outcomes = stack.unwind(|step_id, _effect| {
            if step_id == "s2" {
                Err("file already deleted".to_string())
            } else {
                Ok(())
            }
        });

        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].step_id, "s2");
        assert_eq!(outcomes[0].failures.len(), 1);
        assert!(outcomes[1].failures.is_empty());
    }
}
