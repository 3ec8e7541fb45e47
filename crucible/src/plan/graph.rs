//! Dependency Graph: the topological structure over a plan's steps.
//!
//! Built once at plan creation from each step's `dependencies`. Stores both
//! forward edges (step → what it depends on) and reverse edges (step → what
//! depends on it) so `ready()` and `dependents_of()` are both O(1) per node
//! rather than one of them requiring a full scan.

use std::collections::{HashMap, HashSet};

use super::step::{ExecutionStep, StepStatus};

/// The acyclic dependency structure over one plan's steps.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    forward: HashMap<String, Vec<String>>,
    reverse: HashMap<String, Vec<String>>,
    order: Vec<String>,
}

impl DependencyGraph {
    /// Build a graph from `steps`.
    ///
    /// # Errors
    ///
    /// Returns a descriptive error if a duplicate step id appears, a
    /// dependency references a step not present in `steps`, or the
    /// dependency relation contains a cycle.
    pub fn build(steps: &[ExecutionStep]) -> Result<Self, String> {
        let mut forward = HashMap::new();
        let mut reverse: HashMap<String, Vec<String>> = HashMap::new();
        let mut order = Vec::new();
        let mut seen = HashSet::new();

        for step in steps {
            if !seen.insert(step.id.clone()) {
                return Err(format!("duplicate step id '{}'", step.id));
            }
            order.push(step.id.clone());
            reverse.entry(step.id.clone()).or_default();
        }

        for step in steps {
            for dep in &step.dependencies {
                if !seen.contains(dep) {
                    return Err(format!(
                        "step '{}' depends on missing step '{dep}'",
                        step.id
                    ));
                }
                reverse.entry(dep.clone()).or_default().push(step.id.clone());
            }
            forward.insert(step.id.clone(), step.dependencies.clone());
        }

        let graph = Self { forward, reverse, order };

        if graph.has_cycle() {
            return Err("dependency graph contains a cycle".to_string());
        }

        Ok(graph)
    }

    /// Step ids this step directly depends on.
    #[must_use]
    pub fn dependencies_of(&self, step_id: &str) -> &[String] {
        self.forward.get(step_id).map_or(&[], Vec::as_slice)
    }

    /// Step ids that directly depend on this step.
    #[must_use]
    pub fn dependents_of(&self, step_id: &str) -> &[String] {
        self.reverse.get(step_id).map_or(&[], Vec::as_slice)
    }

    /// Ids of every `Pending` step whose dependencies are all `Completed`,
    /// in the graph's insertion order.
    #[must_use]
    pub fn ready(&self, steps_by_id: &HashMap<String, ExecutionStep>) -> Vec<String> {
        self.order
            .iter()
            .filter(|id| {
                steps_by_id.get(*id).is_some_and(|step| {
                    step.status == StepStatus::Pending
                        && self
                            .dependencies_of(id)
                            .iter()
                            .all(|dep| steps_by_id.get(dep).is_some_and(|d| d.status == StepStatus::Completed))
                })
            })
            .cloned()
            .collect()
    }

    /// Detect a cycle in the dependency relation via DFS with a recursion
    /// stack.
    #[must_use]
    pub fn has_cycle(&self) -> bool {
        #[derive(Clone, Copy, PartialEq, Eq)]
        enum Mark {
            InStack,
            Done,
        }

        let mut marks: HashMap<&str, Mark> = HashMap::new();

        fn visit<'a>(
            node: &'a str,
            forward: &'a HashMap<String, Vec<String>>,
            marks: &mut HashMap<&'a str, Mark>,
        ) -> bool {
            match marks.get(node) {
                Some(Mark::InStack) => return true,
                Some(Mark::Done) => return false,
                None => {}
            }
            marks.insert(node, Mark::InStack);
            if let Some(deps) = forward.get(node) {
                for dep in deps {
                    if visit(dep, forward, marks) {
                        return true;
                    }
                }
            }
            marks.insert(node, Mark::Done);
            false
        }

        self.order.iter().any(|id| visit(id, &self.forward, &mut marks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(id: &str, deps: &[&str]) -> ExecutionStep {
        ExecutionStep::new(id, "p1", "echo", serde_json::Value::Null)
            .with_dependencies(deps.iter().map(ToString::to_string).collect())
    }

    #[test]
    fn builds_forward_and_reverse_edges() {
        let steps = vec![step("a", &[]), step("b", &["a"])];
        let graph = DependencyGraph::build(&steps).unwrap();
        assert_eq!(graph.dependencies_of("b"), &["a".to_string()]);
        assert_eq!(graph.dependents_of("a"), &["b".to_string()]);
    }

    #[test]
    fn rejects_duplicate_ids() {
        let steps = vec![step("a", &[]), step("a", &[])];
        assert!(DependencyGraph::build(&steps).is_err());
    }

    #[test]
    fn rejects_dangling_dependency() {
        let steps = vec![step("a", &["missing"])];
        assert!(DependencyGraph::build(&steps).is_err());
    }

    #[test]
    fn rejects_cycles() {
        let steps = vec![step("a", &["b"]), step("b", &["a"])];
        assert!(DependencyGraph::build(&steps).is_err());
    }

    #[test]
    fn ready_reflects_completed_dependencies() {
        let steps = vec![step("a", &[]), step("b", &["a"])];
        let graph = DependencyGraph::build(&steps).unwrap();
        let mut by_id: HashMap<String, ExecutionStep> =
            steps.into_iter().map(|s| (s.id.clone(), s)).collect();

        assert_eq!(graph.ready(&by_id), vec!["a".to_string()]);

        by_id.get_mut("a").unwrap().status = StepStatus::Completed;
        assert_eq!(graph.ready(&by_id), vec!["b".to_string()]);
    }
}
