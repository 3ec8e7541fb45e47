//! Scheduling strategies: pure functions that turn a ready set plus a
//! concurrency budget into the next batch of step ids to dispatch.
//!
//! Kept separate from [`super::engine`] so each mode's selection rule can be
//! tested without spinning up tool invocation or timers. The engine owns
//! *when* to call these (on plan start, on each step completion, on a
//! bounded poll tick for `Priority`); these functions only own *which* ids
//! come next.

use std::collections::HashSet;

use super::step::{ExecutionStep, Priority};

/// Which of the four scheduling modes a plan runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingMode {
    /// One step at a time, in supplied order; a failure aborts the plan
    /// unless retries are configured and remain.
    Sequential,
    /// Whole rounds: the current ready set dispatches together (bounded by
    /// `max_parallel`), the round waits for every dispatched step, then the
    /// ready set is recomputed.
    Parallel,
    /// A continuously topped-up in-flight set: as soon as a slot frees and
    /// a step is ready, it starts, without waiting for the rest of a round.
    Adaptive,
    /// Ready steps ordered by priority (ties by insertion order), subject
    /// to the same concurrency bound.
    Priority,
}

/// Select the next step to run under `Sequential`: the first step in
/// `order` that is present and ready in `ready`, or `None` if none is ready
/// yet or all have been dispatched.
#[must_use]
pub fn select_sequential<'a>(order: &'a [String], ready: &HashSet<String>) -> Option<&'a str> {
    order.iter().find(|id| ready.contains(*id)).map(String::as_str)
}

/// Select a batch for `Parallel`: up to `max_parallel` ids from `ready`, in
/// `order`'s insertion order. Intended to be called once per round against
/// the round's full ready set.
#[must_use]
pub fn select_parallel_batch(order: &[String], ready: &HashSet<String>, max_parallel: usize) -> Vec<String> {
    order.iter().filter(|id| ready.contains(*id)).take(max_parallel).cloned().collect()
}

/// Select the next steps to top up an `Adaptive` in-flight set: up to
/// however many slots remain under `max_parallel`, drawn from `ready` in
/// `order`'s insertion order.
#[must_use]
pub fn select_adaptive_fill(
    order: &[String],
    ready: &HashSet<String>,
    in_flight: usize,
    max_parallel: usize,
) -> Vec<String> {
    let slots = max_parallel.saturating_sub(in_flight);
    order.iter().filter(|id| ready.contains(*id)).take(slots).cloned().collect()
}

/// Select the next steps for `Priority`: `ready` steps sorted by descending
/// priority (insertion-order tie-break via `order`), bounded by the
/// remaining concurrency slots.
#[must_use]
pub fn select_priority_fill(
    order: &[String],
    steps_by_id: &std::collections::HashMap<String, ExecutionStep>,
    ready: &HashSet<String>,
    in_flight: usize,
    max_parallel: usize,
) -> Vec<String> {
    let slots = max_parallel.saturating_sub(in_flight);
    let mut candidates: Vec<&String> = order.iter().filter(|id| ready.contains(*id)).collect();
    candidates.sort_by(|a, b| {
        let pa = steps_by_id.get(*a).map_or(Priority::Normal, |s| s.priority);
        let pb = steps_by_id.get(*b).map_or(Priority::Normal, |s| s.priority);
        pb.cmp(&pa)
    });
    candidates.into_iter().take(slots).cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn ready_set(ids: &[&str]) -> HashSet<String> {
        ids.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn sequential_picks_first_ready_in_order() {
        let order = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let ready = ready_set(&["b", "c"]);
        assert_eq!(select_sequential(&order, &ready), Some("b"));
    }

    #[test]
    fn parallel_batch_is_capped_and_ordered() {
        let order = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let ready = ready_set(&["a", "b", "c"]);
        assert_eq!(select_parallel_batch(&order, &ready, 2), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn adaptive_fill_respects_remaining_slots() {
        let order = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let ready = ready_set(&["a", "b", "c"]);
        assert_eq!(select_adaptive_fill(&order, &ready, 2, 3), vec!["a".to_string()]);
    }

    #[test]
    fn priority_fill_sorts_descending_with_insertion_tiebreak() {
        let order = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let mut steps = HashMap::new();
        steps.insert("a".to_string(), ExecutionStep::new("a", "p1", "t", serde_json::Value::Null).with_priority(Priority::Low));
        steps.insert("b".to_string(), ExecutionStep::new("b", "p1", "t", serde_json::Value::Null).with_priority(Priority::Critical));
        steps.insert("c".to_string(), ExecutionStep::new("c", "p1", "t", serde_json::Value::Null).with_priority(Priority::Critical));
        let ready = ready_set(&["a", "b", "c"]);

        let selected = select_priority_fill(&order, &steps, &ready, 0, 10);
        assert_eq!(selected, vec!["b".to_string(), "c".to_string(), "a".to_string()]);
    }
}
