//! Plan model and DAG scheduler.
//!
//! A [`Plan`] is an ordered list of [`PlanItem`] records: tagged data, not a
//! class hierarchy. The [`PlanGraph`] wraps a plan with a reverse-dependency
//! index and per-item unmet-dependency counts so actionable queries run in
//! O(V+E). Status transitions are validated by the pure function
//! [`transition_allowed`]; anything else is rejected.
//!
//! ```text
//! Plan (ordered items)            PlanGraph (scheduling view)
//!   t1 ──┐                          index_of:   id → position
//!   t2 ──┼─ deps ─▶ t1              dependants: t1 → [t2, t3]
//!   t3 ──┘                          unmet:      t2 → 1, t3 → 1
//! ```
//!
//! Plans serialise to JSON (`plan.json`) after every status transition;
//! reloading reconstructs identical state, and re-serialising a round-tripped
//! plan yields byte-identical output.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::Path;

use crate::taskmesh::error::{EngineError, EngineResult};

/// Lifecycle state of a [`PlanItem`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl Default for ItemStatus {
    fn default() -> Self {
        ItemStatus::Pending
    }
}

/// What the orchestrator does with the task when this item can never
/// complete (the item failed, or a dependency failed or was skipped).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnFailure {
    /// Skip the item and keep driving the rest of the plan.
    Proceed,
    /// Fail the whole task.
    Halt,
    /// Pause the task and wait for user input.
    Escalate,
}

impl Default for OnFailure {
    fn default() -> Self {
        OnFailure::Halt
    }
}

/// One unit of work in a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanItem {
    /// Stable identifier, unique within the plan.
    pub id: String,

    /// Natural-language instruction for the agent, including the explicit
    /// artifact filenames the agent must write.
    pub action: String,

    /// Name of the agent that executes this item; must resolve in the team.
    pub agent: String,

    /// IDs of items that must be `completed` before this one is actionable.
    #[serde(default)]
    pub dependencies: Vec<String>,

    /// Current lifecycle state.
    #[serde(default)]
    pub status: ItemStatus,

    /// Failure policy applied when the item can never complete.
    #[serde(default)]
    pub on_failure: OnFailure,

    /// Name of the primary artifact this item produced, once completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_ref: Option<String>,
}

impl PlanItem {
    /// Build a pending item with no dependencies.
    pub fn new(id: impl Into<String>, agent: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            action: action.into(),
            agent: agent.into(),
            dependencies: Vec::new(),
            status: ItemStatus::Pending,
            on_failure: OnFailure::default(),
            result_ref: None,
        }
    }

    /// Add dependency IDs (builder pattern).
    pub fn with_dependencies(mut self, deps: Vec<String>) -> Self {
        self.dependencies = deps;
        self
    }

    /// Set the failure policy (builder pattern).
    pub fn with_on_failure(mut self, policy: OnFailure) -> Self {
        self.on_failure = policy;
        self
    }
}

/// An ordered sequence of plan items. The serialised form of the plan is
/// exactly this struct, so field and item order are stable across round
/// trips.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Plan {
    pub items: Vec<PlanItem>,
}

impl Plan {
    /// Build a plan from items.
    pub fn new(items: Vec<PlanItem>) -> Self {
        Self { items }
    }
}

/// Validate a single status transition.
///
/// Legal forward moves are `pending → in_progress`,
/// `in_progress → completed | failed`, and `pending | in_progress → skipped`
/// (via failure policy). Everything else, including any move out of a
/// terminal state, is rejected; plan revision uses [`PlanGraph::reset`]
/// instead.
pub fn transition_allowed(from: ItemStatus, to: ItemStatus) -> bool {
    use ItemStatus::*;
    match (from, to) {
        (Pending, InProgress) => true,
        (InProgress, Completed) => true,
        (InProgress, Failed) => true,
        (Pending, Skipped) | (InProgress, Skipped) => true,
        _ => false,
    }
}

/// Per-status item counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressSummary {
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl ProgressSummary {
    /// Total number of items.
    pub fn total(&self) -> usize {
        self.pending + self.in_progress + self.completed + self.failed + self.skipped
    }
}

impl fmt::Display for ProgressSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} completed ({} pending, {} in progress, {} failed, {} skipped)",
            self.completed,
            self.total(),
            self.pending,
            self.in_progress,
            self.failed,
            self.skipped
        )
    }
}

/// Scheduling view over a [`Plan`]: dependency resolution, actionable-item
/// selection, and validated status transitions.
///
/// Construction validates the plan (unique IDs, known dependencies, acyclic
/// graph, non-empty actions) and precomputes the reverse-dependency index so
/// every actionable query is O(V+E).
pub struct PlanGraph {
    plan: Plan,
    index_of: HashMap<String, usize>,
    dependants: Vec<Vec<usize>>,
    unmet: Vec<usize>,
}

impl PlanGraph {
    /// Build the scheduling view, rejecting invalid plans.
    ///
    /// # Errors
    ///
    /// [`EngineError::PlanInvalid`] on duplicate IDs, a dependency that
    /// references a missing item, a dependency cycle, or an empty `action`.
    pub fn new(plan: Plan) -> EngineResult<Self> {
        let mut index_of = HashMap::with_capacity(plan.items.len());
        for (idx, item) in plan.items.iter().enumerate() {
            if item.id.trim().is_empty() {
                return Err(EngineError::PlanInvalid("empty item id".to_string()));
            }
            if item.action.trim().is_empty() {
                return Err(EngineError::PlanInvalid(format!(
                    "item '{}' has an empty action",
                    item.id
                )));
            }
            if index_of.insert(item.id.clone(), idx).is_some() {
                return Err(EngineError::PlanInvalid(format!(
                    "duplicate item id '{}'",
                    item.id
                )));
            }
        }

        let mut dependants = vec![Vec::new(); plan.items.len()];
        for (idx, item) in plan.items.iter().enumerate() {
            for dep in &item.dependencies {
                match index_of.get(dep) {
                    Some(&dep_idx) => {
                        if dep_idx == idx {
                            return Err(EngineError::PlanInvalid(format!(
                                "item '{}' depends on itself",
                                item.id
                            )));
                        }
                        dependants[dep_idx].push(idx);
                    }
                    None => {
                        return Err(EngineError::PlanInvalid(format!(
                            "item '{}' depends on unknown item '{}'",
                            item.id, dep
                        )));
                    }
                }
            }
        }

        let mut graph = Self {
            plan,
            index_of,
            dependants,
            unmet: Vec::new(),
        };
        graph.check_acyclic()?;
        graph.recompute_unmet();
        Ok(graph)
    }

    /// Kahn's algorithm over the dependency edges; any leftover node means a
    /// cycle.
    fn check_acyclic(&self) -> EngineResult<()> {
        let n = self.plan.items.len();
        let mut in_degree: Vec<usize> = self
            .plan
            .items
            .iter()
            .map(|item| item.dependencies.len())
            .collect();
        let mut queue: Vec<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
        let mut visited = 0;

        while let Some(idx) = queue.pop() {
            visited += 1;
            for &dep in &self.dependants[idx] {
                in_degree[dep] -= 1;
                if in_degree[dep] == 0 {
                    queue.push(dep);
                }
            }
        }

        if visited != n {
            let stuck: Vec<&str> = (0..n)
                .filter(|&i| in_degree[i] > 0)
                .map(|i| self.plan.items[i].id.as_str())
                .collect();
            return Err(EngineError::PlanInvalid(format!(
                "dependency cycle involving: {}",
                stuck.join(", ")
            )));
        }
        Ok(())
    }

    /// Recount unmet dependencies (dependencies not yet `completed`) for
    /// every item.
    fn recompute_unmet(&mut self) {
        self.unmet = self
            .plan
            .items
            .iter()
            .map(|item| {
                item.dependencies
                    .iter()
                    .filter(|dep| {
                        let dep_idx = self.index_of[dep.as_str()];
                        self.plan.items[dep_idx].status != ItemStatus::Completed
                    })
                    .count()
            })
            .collect();
    }

    /// Verify that every `agent` name resolves in the given roster.
    pub fn validate_agents(&self, roster: &[&str]) -> EngineResult<()> {
        for item in &self.plan.items {
            if !roster.contains(&item.agent.as_str()) {
                return Err(EngineError::AgentUnknown(item.agent.clone()));
            }
        }
        Ok(())
    }

    /// The underlying plan.
    pub fn plan(&self) -> &Plan {
        &self.plan
    }

    /// All items in plan order.
    pub fn items(&self) -> &[PlanItem] {
        &self.plan.items
    }

    /// Borrow an item by ID.
    pub fn item(&self, id: &str) -> Option<&PlanItem> {
        self.index_of.get(id).map(|&idx| &self.plan.items[idx])
    }

    /// The first pending item whose dependencies are all completed,
    /// tie-broken by plan order.
    pub fn next_actionable(&self) -> Option<&PlanItem> {
        self.plan
            .items
            .iter()
            .enumerate()
            .find(|(idx, item)| item.status == ItemStatus::Pending && self.unmet[*idx] == 0)
            .map(|(_, item)| item)
    }

    /// All actionable items in plan order, optionally capped at `max`.
    pub fn all_actionable(&self, max: Option<usize>) -> Vec<&PlanItem> {
        let iter = self
            .plan
            .items
            .iter()
            .enumerate()
            .filter(|(idx, item)| item.status == ItemStatus::Pending && self.unmet[*idx] == 0)
            .map(|(_, item)| item);
        match max {
            Some(cap) => iter.take(cap).collect(),
            None => iter.collect(),
        }
    }

    /// Apply a status transition, returning `false` if the item is unknown
    /// or the move is illegal.
    pub fn update_status(&mut self, id: &str, new_status: ItemStatus) -> bool {
        let idx = match self.index_of.get(id) {
            Some(&idx) => idx,
            None => return false,
        };
        let current = self.plan.items[idx].status;
        if !transition_allowed(current, new_status) {
            return false;
        }
        self.plan.items[idx].status = new_status;
        if new_status == ItemStatus::Completed {
            for &dep_idx in &self.dependants[idx].clone() {
                self.unmet[dep_idx] = self.unmet[dep_idx].saturating_sub(1);
            }
        }
        true
    }

    /// Record the primary artifact an item produced.
    pub fn set_result_ref(&mut self, id: &str, result_ref: impl Into<String>) {
        if let Some(&idx) = self.index_of.get(id) {
            self.plan.items[idx].result_ref = Some(result_ref.into());
        }
    }

    /// Administrative reset used by plan revision: the item returns to
    /// `pending` (clearing `result_ref`) and every transitive dependant that
    /// is not already pending is reset with it.
    pub fn reset(&mut self, id: &str) {
        let start = match self.index_of.get(id) {
            Some(&idx) => idx,
            None => return,
        };
        let mut stack = vec![start];
        let mut seen = vec![false; self.plan.items.len()];
        while let Some(idx) = stack.pop() {
            if seen[idx] {
                continue;
            }
            seen[idx] = true;
            self.plan.items[idx].status = ItemStatus::Pending;
            self.plan.items[idx].result_ref = None;
            for &dep_idx in &self.dependants[idx] {
                if !seen[dep_idx] {
                    stack.push(dep_idx);
                }
            }
        }
        self.recompute_unmet();
    }

    /// `true` iff every item is `completed` or `skipped`.
    pub fn is_complete(&self) -> bool {
        self.plan
            .items
            .iter()
            .all(|item| matches!(item.status, ItemStatus::Completed | ItemStatus::Skipped))
    }

    /// `true` iff any item is `failed`.
    pub fn has_failed(&self) -> bool {
        self.plan
            .items
            .iter()
            .any(|item| item.status == ItemStatus::Failed)
    }

    /// Item counts per status.
    pub fn progress_summary(&self) -> ProgressSummary {
        let mut summary = ProgressSummary::default();
        for item in &self.plan.items {
            match item.status {
                ItemStatus::Pending => summary.pending += 1,
                ItemStatus::InProgress => summary.in_progress += 1,
                ItemStatus::Completed => summary.completed += 1,
                ItemStatus::Failed => summary.failed += 1,
                ItemStatus::Skipped => summary.skipped += 1,
            }
        }
        summary
    }

    /// IDs of completed items, in plan order.
    pub fn completed_ids(&self) -> Vec<String> {
        self.plan
            .items
            .iter()
            .filter(|item| item.status == ItemStatus::Completed)
            .map(|item| item.id.clone())
            .collect()
    }

    /// Pending items that can never become actionable because a dependency
    /// is `failed` or `skipped`. These are the items whose `on_failure`
    /// policy the orchestrator applies on deadlock.
    pub fn blocked_ids(&self) -> Vec<String> {
        self.plan
            .items
            .iter()
            .filter(|item| {
                item.status == ItemStatus::Pending
                    && item.dependencies.iter().any(|dep| {
                        let dep_idx = self.index_of[dep.as_str()];
                        matches!(
                            self.plan.items[dep_idx].status,
                            ItemStatus::Failed | ItemStatus::Skipped
                        )
                    })
            })
            .map(|item| item.id.clone())
            .collect()
    }

    /// Serialise the plan to `path` and fsync it.
    pub fn save(&self, path: &Path) -> EngineResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.plan)?;
        let mut file = fs::File::create(path)?;
        file.write_all(json.as_bytes())?;
        file.write_all(b"\n")?;
        file.sync_all()?;
        Ok(())
    }

    /// Reload a plan previously written by [`save`](PlanGraph::save).
    pub fn load(path: &Path) -> EngineResult<Self> {
        let json = fs::read_to_string(path)?;
        let plan: Plan = serde_json::from_str(&json)
            .map_err(|e| EngineError::PlanInvalid(format!("unparseable plan file: {}", e)))?;
        Self::new(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_item_plan() -> Plan {
        Plan::new(vec![
            PlanItem::new("t1", "researcher", "produce research.md"),
            PlanItem::new("t2", "writer", "produce report.md")
                .with_dependencies(vec!["t1".to_string()]),
        ])
    }

    #[test]
    fn rejects_cycles() {
        let plan = Plan::new(vec![
            PlanItem::new("a", "x", "first").with_dependencies(vec!["b".to_string()]),
            PlanItem::new("b", "x", "second").with_dependencies(vec!["a".to_string()]),
        ]);
        match PlanGraph::new(plan) {
            Err(EngineError::PlanInvalid(msg)) => assert!(msg.contains("cycle")),
            other => panic!("expected PlanInvalid, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn rejects_unknown_dependency() {
        let plan = Plan::new(vec![
            PlanItem::new("a", "x", "do a").with_dependencies(vec!["ghost".to_string()])
        ]);
        assert!(matches!(
            PlanGraph::new(plan),
            Err(EngineError::PlanInvalid(_))
        ));
    }

    #[test]
    fn actionable_respects_dependencies_and_order() {
        let mut graph = PlanGraph::new(two_item_plan()).unwrap();
        assert_eq!(graph.next_actionable().unwrap().id, "t1");
        assert_eq!(graph.all_actionable(None).len(), 1);

        assert!(graph.update_status("t1", ItemStatus::InProgress));
        assert!(graph.next_actionable().is_none());
        assert!(graph.update_status("t1", ItemStatus::Completed));
        assert_eq!(graph.next_actionable().unwrap().id, "t2");
    }

    #[test]
    fn illegal_transitions_rejected() {
        let mut graph = PlanGraph::new(two_item_plan()).unwrap();
        assert!(!graph.update_status("t1", ItemStatus::Completed)); // pending → completed
        assert!(graph.update_status("t1", ItemStatus::InProgress));
        assert!(graph.update_status("t1", ItemStatus::Completed));
        assert!(!graph.update_status("t1", ItemStatus::Pending)); // completed is terminal
        assert!(!graph.update_status("t1", ItemStatus::Skipped));
    }

    #[test]
    fn empty_plan_is_complete() {
        let graph = PlanGraph::new(Plan::default()).unwrap();
        assert!(graph.is_complete());
        assert!(graph.next_actionable().is_none());
    }

    #[test]
    fn reset_cascades_to_dependants() {
        let mut graph = PlanGraph::new(two_item_plan()).unwrap();
        graph.update_status("t1", ItemStatus::InProgress);
        graph.update_status("t1", ItemStatus::Completed);
        graph.update_status("t2", ItemStatus::InProgress);
        graph.update_status("t2", ItemStatus::Completed);

        graph.reset("t1");
        assert_eq!(graph.item("t1").unwrap().status, ItemStatus::Pending);
        assert_eq!(graph.item("t2").unwrap().status, ItemStatus::Pending);
        assert_eq!(graph.next_actionable().unwrap().id, "t1");
    }

    #[test]
    fn serialisation_round_trips_byte_identical() {
        let mut graph = PlanGraph::new(two_item_plan()).unwrap();
        graph.update_status("t1", ItemStatus::InProgress);

        let first = serde_json::to_string_pretty(graph.plan()).unwrap();
        let reparsed: Plan = serde_json::from_str(&first).unwrap();
        let second = serde_json::to_string_pretty(&reparsed).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn blocked_ids_reports_items_behind_failures() {
        let mut graph = PlanGraph::new(two_item_plan()).unwrap();
        graph.update_status("t1", ItemStatus::InProgress);
        graph.update_status("t1", ItemStatus::Failed);

        assert!(graph.next_actionable().is_none());
        assert!(!graph.is_complete());
        assert_eq!(graph.blocked_ids(), vec!["t2".to_string()]);
    }
}
