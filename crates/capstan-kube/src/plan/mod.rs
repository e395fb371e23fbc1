//! Plan graph
//!
//! A plan is a directed acyclic graph of operations keyed by `op.id()`,
//! with edges meaning "must complete before". Insertion prevents cycles;
//! [`Plan::optimize`] transitively reduces the graph while preserving
//! reachability. Adjacency is kept in BTree maps so iteration order, and
//! with it planning and reporting, is deterministic.

pub mod executor;
pub mod planner;

pub use executor::{ExecutorOptions, PlanExecutor};
pub use planner::{BuiltPlan, PlanBuilder, PlanBuilderOptions};

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use crate::error::{KubeError, Result};
use crate::operation::{OpStatus, Operation, StageOperation};

/// Directed acyclic graph of operations with stage barriers
#[derive(Default)]
pub struct Plan {
    ops: BTreeMap<String, Arc<Operation>>,
    successors: BTreeMap<String, BTreeSet<String>>,
    predecessors: BTreeMap<String, BTreeSet<String>>,
}

impl Plan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up an operation by its vertex key
    pub fn operation(&self, id: &str) -> Option<Arc<Operation>> {
        self.ops.get(id).cloned()
    }

    /// Insert an operation; inserting the same id twice keeps the first
    pub fn add_operation(&mut self, op: Operation) -> Arc<Operation> {
        let id = op.id();
        if let Some(existing) = self.ops.get(&id) {
            return existing.clone();
        }

        let arc = Arc::new(op);
        self.ops.insert(id.clone(), arc.clone());
        self.successors.entry(id.clone()).or_default();
        self.predecessors.entry(id).or_default();
        arc
    }

    /// Insert an operation between two stage markers, creating the markers
    /// when missing. The spanning edge `in -> out` keeps even an empty stage
    /// enforcing order.
    pub fn add_staged_operation(
        &mut self,
        op: Operation,
        stage_in_id: &str,
        stage_out_id: &str,
    ) -> Result<Arc<Operation>> {
        let arc = self.add_operation(op);
        self.ensure_stage(stage_in_id);
        self.ensure_stage(stage_out_id);

        self.add_dependency(stage_in_id, stage_out_id)?;
        self.add_dependency(stage_in_id, &arc.id())?;
        self.add_dependency(&arc.id(), stage_out_id)?;
        Ok(arc)
    }

    /// Insert an operation ordered after a stage-in marker only
    pub fn add_in_staged_operation(
        &mut self,
        op: Operation,
        stage_in_id: &str,
    ) -> Result<Arc<Operation>> {
        let arc = self.add_operation(op);
        self.ensure_stage(stage_in_id);
        self.add_dependency(stage_in_id, &arc.id())?;
        Ok(arc)
    }

    /// Insert an operation ordered before a stage-out marker only
    pub fn add_out_staged_operation(
        &mut self,
        op: Operation,
        stage_out_id: &str,
    ) -> Result<Arc<Operation>> {
        let arc = self.add_operation(op);
        self.ensure_stage(stage_out_id);
        self.add_dependency(&arc.id(), stage_out_id)?;
        Ok(arc)
    }

    /// Add a "must complete before" edge; duplicates are idempotent, a back
    /// edge fails with `Cycle`
    pub fn add_dependency(&mut self, from: &str, to: &str) -> Result<()> {
        if !self.ops.contains_key(from) {
            return Err(KubeError::UnknownOperation {
                id: from.to_string(),
            });
        }
        if !self.ops.contains_key(to) {
            return Err(KubeError::UnknownOperation { id: to.to_string() });
        }

        if from == to || self.reaches(to, from) {
            return Err(KubeError::Cycle {
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        self.successors.get_mut(from).unwrap().insert(to.to_string());
        self.predecessors.get_mut(to).unwrap().insert(from.to_string());
        Ok(())
    }

    /// Transitive reduction: drop every edge whose ordering is already
    /// implied by a longer path. Reachability is preserved.
    pub fn optimize(&mut self) {
        let nodes: Vec<String> = self.ops.keys().cloned().collect();

        for u in &nodes {
            let direct: Vec<String> = self.successors[u].iter().cloned().collect();
            for v in &direct {
                let implied = direct
                    .iter()
                    .filter(|w| *w != v)
                    .any(|w| self.reaches(w, v));
                if implied {
                    self.successors.get_mut(u).unwrap().remove(v);
                    self.predecessors.get_mut(v).unwrap().remove(u);
                }
            }
        }
    }

    /// Whether a path `from -> ... -> to` exists (true when equal)
    pub fn reaches(&self, from: &str, to: &str) -> bool {
        if from == to {
            return true;
        }

        let mut stack = vec![from];
        let mut seen = BTreeSet::new();
        while let Some(node) = stack.pop() {
            if let Some(succs) = self.successors.get(node) {
                for succ in succs {
                    if succ == to {
                        return true;
                    }
                    if seen.insert(succ.clone()) {
                        stack.push(succ);
                    }
                }
            }
        }
        false
    }

    /// All operations in key order
    pub fn operations(&self) -> Vec<Arc<Operation>> {
        self.ops.values().cloned().collect()
    }

    pub fn completed_operations(&self) -> Vec<Arc<Operation>> {
        self.with_status(OpStatus::Completed)
    }

    pub fn failed_operations(&self) -> Vec<Arc<Operation>> {
        self.with_status(OpStatus::Failed)
    }

    /// Operations still `unknown` at the end of a run were canceled by an
    /// earlier failure
    pub fn canceled_operations(&self) -> Vec<Arc<Operation>> {
        self.with_status(OpStatus::Unknown)
    }

    /// Completed resource mutations, for human-facing reporting
    pub fn worthy_completed_operations(&self) -> Vec<Arc<Operation>> {
        self.completed_operations()
            .into_iter()
            .filter(|op| op.op_type().is_resource_mutation())
            .collect()
    }

    pub fn worthy_failed_operations(&self) -> Vec<Arc<Operation>> {
        self.failed_operations()
    }

    pub fn worthy_canceled_operations(&self) -> Vec<Arc<Operation>> {
        self.canceled_operations()
            .into_iter()
            .filter(|op| op.op_type().is_resource_mutation() && !op.op_type().is_extra_post())
            .collect()
    }

    /// True iff no cluster-affecting operation would change anything
    pub fn useless(&self) -> bool {
        !self
            .ops
            .values()
            .any(|op| op.op_type().affects_cluster() && !op.empty())
    }

    /// Direct predecessors of a vertex
    pub fn predecessors(&self, id: &str) -> Vec<String> {
        self.predecessors
            .get(id)
            .map(|preds| preds.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Direct successors of a vertex
    pub fn successors(&self, id: &str) -> Vec<String> {
        self.successors
            .get(id)
            .map(|succs| succs.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Graphviz rendering for debugging
    pub fn dot(&self) -> String {
        let mut out = String::from("digraph plan {\n  rankdir=\"LR\";\n");

        for (id, op) in &self.ops {
            let shape = if matches!(op.op_type(), crate::operation::OperationType::Stage) {
                "cds"
            } else {
                "box"
            };
            out.push_str(&format!("  \"{}\" [shape={}];\n", id, shape));
        }
        for (from, succs) in &self.successors {
            for to in succs {
                out.push_str(&format!("  \"{}\" -> \"{}\";\n", from, to));
            }
        }

        out.push_str("}\n");
        out
    }

    pub fn save_dot(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, self.dot())?;
        Ok(())
    }

    fn ensure_stage(&mut self, stage_id: &str) {
        if !self.ops.contains_key(stage_id) {
            self.add_operation(Operation::Stage(StageOperation::new(stage_id)));
        }
    }

    fn with_status(&self, status: OpStatus) -> Vec<Arc<Operation>> {
        self.ops
            .values()
            .filter(|op| op.status() == status)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::StageOperation;

    fn vertex(id: &str) -> Operation {
        Operation::Stage(StageOperation::new(id))
    }

    fn plan_with(ids: &[&str]) -> Plan {
        let mut plan = Plan::new();
        for id in ids {
            plan.add_operation(vertex(id));
        }
        plan
    }

    #[test]
    fn test_add_operation_idempotent() {
        let mut plan = Plan::new();
        let first = plan.add_operation(vertex("a"));
        let second = plan.add_operation(vertex("a"));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(plan.len(), 1);
    }

    #[test]
    fn test_dependency_rejects_unknown_vertex() {
        let mut plan = plan_with(&["a"]);
        assert!(matches!(
            plan.add_dependency("a", "ghost"),
            Err(KubeError::UnknownOperation { .. })
        ));
    }

    #[test]
    fn test_duplicate_edges_idempotent() {
        let mut plan = plan_with(&["a", "b"]);
        plan.add_dependency("a", "b").unwrap();
        plan.add_dependency("a", "b").unwrap();
        assert_eq!(plan.successors("a"), vec!["b".to_string()]);
    }

    #[test]
    fn test_cycle_rejected() {
        let mut plan = plan_with(&["a", "b", "c"]);
        plan.add_dependency("a", "b").unwrap();
        plan.add_dependency("b", "c").unwrap();

        assert!(matches!(
            plan.add_dependency("c", "a"),
            Err(KubeError::Cycle { .. })
        ));
        assert!(matches!(
            plan.add_dependency("a", "a"),
            Err(KubeError::Cycle { .. })
        ));

        // The failed insert must not leave half an edge behind
        assert!(plan.successors("c").is_empty());
    }

    #[test]
    fn test_every_successful_insert_sequence_stays_acyclic() {
        // Dense random-ish insertion; whatever succeeds must keep the graph acyclic
        let ids: Vec<String> = (0..8).map(|i| format!("op{}", i)).collect();
        let mut plan = Plan::new();
        for id in &ids {
            plan.add_operation(vertex(id));
        }

        for (i, from) in ids.iter().enumerate() {
            for (j, to) in ids.iter().enumerate() {
                if (i * 7 + j * 3) % 4 == 0 {
                    let _ = plan.add_dependency(from, to);
                }
            }
        }

        for id in &ids {
            for succ in plan.successors(id) {
                assert!(
                    !plan.reaches(&succ, id),
                    "edge {} -> {} closed a cycle",
                    id,
                    succ
                );
            }
        }
    }

    #[test]
    fn test_staged_operation_wiring() {
        let mut plan = Plan::new();
        plan.add_staged_operation(vertex("work"), "stage/s:in", "stage/s:out")
            .unwrap();

        assert_eq!(plan.len(), 3);
        assert!(plan.reaches("stage/s:in", "work"));
        assert!(plan.reaches("work", "stage/s:out"));
        // Spanning edge keeps an empty stage ordered
        assert!(plan.successors("stage/s:in").contains(&"stage/s:out".to_string()));
    }

    #[test]
    fn test_one_sided_staging() {
        let mut plan = Plan::new();
        plan.add_in_staged_operation(vertex("a"), "stage/s:in").unwrap();
        plan.add_out_staged_operation(vertex("b"), "stage/s:out").unwrap();

        assert!(plan.reaches("stage/s:in", "a"));
        assert!(plan.reaches("b", "stage/s:out"));
        assert!(!plan.reaches("a", "b"));
    }

    #[test]
    fn test_optimize_removes_implied_edges_only() {
        let mut plan = plan_with(&["a", "b", "c"]);
        plan.add_dependency("a", "b").unwrap();
        plan.add_dependency("b", "c").unwrap();
        plan.add_dependency("a", "c").unwrap(); // implied by a -> b -> c

        plan.optimize();

        assert_eq!(plan.successors("a"), vec!["b".to_string()]);
        assert!(plan.reaches("a", "c"), "reachability must be preserved");
    }

    #[test]
    fn test_optimize_preserves_reachability_on_diamond() {
        let mut plan = plan_with(&["root", "l", "r", "sink"]);
        plan.add_dependency("root", "l").unwrap();
        plan.add_dependency("root", "r").unwrap();
        plan.add_dependency("l", "sink").unwrap();
        plan.add_dependency("r", "sink").unwrap();
        plan.add_dependency("root", "sink").unwrap(); // redundant

        let reachable_before: Vec<(String, String)> = pairs_reaching(&plan);
        plan.optimize();
        let reachable_after: Vec<(String, String)> = pairs_reaching(&plan);

        assert_eq!(reachable_before, reachable_after);
        assert!(!plan.successors("root").contains(&"sink".to_string()));
    }

    fn pairs_reaching(plan: &Plan) -> Vec<(String, String)> {
        let ids: Vec<String> = plan.operations().iter().map(|op| op.id()).collect();
        let mut pairs = Vec::new();
        for a in &ids {
            for b in &ids {
                if a != b && plan.reaches(a, b) {
                    pairs.push((a.clone(), b.clone()));
                }
            }
        }
        pairs
    }

    #[test]
    fn test_useless_with_only_stage_markers() {
        let plan = plan_with(&["stage/a:in", "stage/a:out"]);
        assert!(plan.useless());
    }

    #[test]
    fn test_dot_output() {
        let mut plan = plan_with(&["a", "b"]);
        plan.add_dependency("a", "b").unwrap();

        let dot = plan.dot();
        assert!(dot.starts_with("digraph plan {"));
        assert!(dot.contains("\"a\" -> \"b\";"));
    }

    #[tokio::test]
    async fn test_status_queries() {
        let mut plan = plan_with(&["a", "b", "c"]);
        plan.operation("a").unwrap().execute().await.unwrap();

        assert_eq!(plan.completed_operations().len(), 1);
        assert_eq!(plan.canceled_operations().len(), 2);
        assert!(plan.failed_operations().is_empty());
    }
}
