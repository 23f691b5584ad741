//! Execution planning.
//!
//! Turns a change set into an ordered list of provider steps. A replace
//! becomes two steps whose order depends on the kind's strategy:
//!
//! - destroy-before-create: destroy the old instance, create the new one,
//!   then update dependents;
//! - create-before-destroy: create the new instance, update dependents,
//!   then clean up the old instance.
//!
//! Ordering constraints:
//!
//! - a node's create/update runs after the create/update of every node it
//!   references;
//! - a recorded node is deleted before any node it referenced is deleted;
//! - an old instance kept for create-before-destroy is deleted only after
//!   every declared dependent has been applied.
//!
//! Steps are emitted with Kahn's algorithm; among ready steps the one with
//! the lowest (action rank, logical id) goes first. Constraints that form
//! a cycle are reported as [`PlanError::Cycle`] before anything runs.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use tracing::{debug, info};

use crate::error::PlanError;
use crate::graph::{ReplaceStrategy, ResourceGraph, SchemaRegistry};
use crate::state::StateSnapshot;

use super::diff::{ChangeOperation, ChangeSet};

/// What a step does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepAction {
    /// Delete the current instance ahead of recreating it.
    DestroyForReplace,
    /// Delete a node that is no longer declared.
    Delete,
    /// Create a new instance.
    Create,
    /// Update an instance in place.
    Update,
    /// Delete instances superseded by an earlier create.
    CleanupDeposed,
}

impl StepAction {
    const fn rank(self) -> u8 {
        match self {
            Self::DestroyForReplace => 0,
            Self::Delete => 1,
            Self::Create => 2,
            Self::Update => 3,
            Self::CleanupDeposed => 4,
        }
    }

    /// Returns true for steps that remove cloud resources.
    #[must_use]
    pub const fn is_destructive(self) -> bool {
        matches!(
            self,
            Self::DestroyForReplace | Self::Delete | Self::CleanupDeposed
        )
    }
}

impl fmt::Display for StepAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::DestroyForReplace => "destroy-for-replace",
            Self::Delete => "delete",
            Self::Create => "create",
            Self::Update => "update",
            Self::CleanupDeposed => "cleanup-deposed",
        };
        write!(f, "{s}")
    }
}

/// A single step of the plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedStep {
    /// Position in the plan.
    pub index: usize,
    /// What to do.
    pub action: StepAction,
    /// Logical id.
    pub node_id: String,
    /// Kind of the instance the step operates on.
    pub kind: String,
    /// Human-readable reason.
    pub reason: String,
    /// Indices of steps that must finish first.
    pub dependencies: Vec<usize>,
}

impl PlannedStep {
    /// One-line description.
    #[must_use]
    pub fn description(&self) -> String {
        format!("{} {} ({})", self.action, self.node_id, self.kind)
    }
}

impl fmt::Display for PlannedStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.index, self.description(), self.reason)
    }
}

/// An ordered, validated plan.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionPlan {
    /// When the plan was computed.
    pub created_at: DateTime<Utc>,
    /// Hash of the desired state the plan converges to.
    pub desired_hash: String,
    /// Change set the plan was derived from.
    pub changes: ChangeSet,
    /// Steps in execution order.
    pub steps: Vec<PlannedStep>,
}

impl ExecutionPlan {
    /// Creates a plan with no steps.
    #[must_use]
    pub fn empty(desired_hash: &str) -> Self {
        Self {
            created_at: Utc::now(),
            desired_hash: desired_hash.to_string(),
            changes: ChangeSet::default(),
            steps: Vec::new(),
        }
    }

    /// Returns true if there is nothing to do.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Number of steps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Number of steps with `action`.
    #[must_use]
    pub fn count(&self, action: StepAction) -> usize {
        self.steps.iter().filter(|s| s.action == action).count()
    }

    /// Returns true if any step removes a cloud resource.
    #[must_use]
    pub fn has_destructive_steps(&self) -> bool {
        self.steps.iter().any(|s| s.action.is_destructive())
    }

    /// Logical ids touched by the plan, sorted.
    #[must_use]
    pub fn node_ids(&self) -> Vec<String> {
        self.steps
            .iter()
            .map(|s| s.node_id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

impl fmt::Display for ExecutionPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Execution plan ({} steps)", self.steps.len())?;
        for step in &self.steps {
            writeln!(f, "  {step}")?;
        }
        Ok(())
    }
}

#[derive(Debug)]
struct Draft {
    action: StepAction,
    node_id: String,
    kind: String,
    reason: String,
}

/// Builds execution plans.
#[derive(Debug)]
pub struct Planner<'a> {
    schemas: &'a SchemaRegistry,
}

/// Steps and constraints collected before ordering.
#[derive(Debug, Default)]
struct Builder<'g> {
    drafts: Vec<Draft>,
    /// (before, after) pairs.
    edges: BTreeSet<(usize, usize)>,
    /// Step that makes the new version of a node available.
    apply_step: HashMap<&'g str, usize>,
    /// Steps that remove old instances of a node.
    delete_steps: HashMap<&'g str, Vec<usize>>,
    /// Cleanup step of a node, if any.
    cleanup_step: HashMap<&'g str, usize>,
}

impl<'g> Builder<'g> {
    fn push(&mut self, action: StepAction, node_id: &str, kind: &str, reason: String) -> usize {
        self.drafts.push(Draft {
            action,
            node_id: node_id.to_string(),
            kind: kind.to_string(),
            reason,
        });
        self.drafts.len() - 1
    }

    fn before(&mut self, first: usize, then: usize) {
        if first != then {
            self.edges.insert((first, then));
        }
    }

    fn add_delete(&mut self, id: &'g str, step: usize) {
        self.delete_steps.entry(id).or_default().push(step);
    }
}

impl<'a> Planner<'a> {
    /// Creates a planner using `schemas` for replacement strategies.
    #[must_use]
    pub const fn new(schemas: &'a SchemaRegistry) -> Self {
        Self { schemas }
    }

    /// Orders the change set into a plan.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::Cycle`] if the ordering constraints cannot all
    /// be satisfied, or an error if an operation names a resource missing
    /// from its input.
    pub fn plan(
        &self,
        changes: &ChangeSet,
        desired: &ResourceGraph,
        snapshot: &StateSnapshot,
        desired_hash: &str,
    ) -> Result<ExecutionPlan, PlanError> {
        let mut b = Builder::default();

        for op in &changes.operations {
            self.add_operation(&mut b, op, desired, snapshot)?;
        }

        for (id, record) in &snapshot.resources {
            let id = id.as_str();
            // Delete and destroy-for-replace steps remove deposed instances too.
            if record.deposed.is_empty() || b.delete_steps.contains_key(id) {
                continue;
            }
            let k = b.push(
                StepAction::CleanupDeposed,
                id,
                &record.kind,
                format!("{} instance(s) left from an earlier run", record.deposed.len()),
            );
            b.add_delete(id, k);
            b.cleanup_step.insert(id, k);
            if let Some(&a) = b.apply_step.get(id) {
                b.before(a, k);
            }
        }

        for edge in desired.edges() {
            let dependent = b.apply_step.get(edge.from.as_str()).copied();
            if let (Some(a), Some(&dep)) = (dependent, b.apply_step.get(edge.to.as_str())) {
                b.before(dep, a);
            }
            if let (Some(a), Some(&k)) = (dependent, b.cleanup_step.get(edge.to.as_str())) {
                b.before(a, k);
            }
        }

        for (id, record) in &snapshot.resources {
            let Some(own) = b.delete_steps.get(id.as_str()).cloned() else {
                continue;
            };
            for dependency in record.dependencies() {
                let Some(theirs) = b.delete_steps.get(dependency.as_str()).cloned() else {
                    continue;
                };
                for &first in &own {
                    for &then in &theirs {
                        b.before(first, then);
                    }
                }
            }
        }

        // A surviving node that referenced a deleted one moves off it first.
        for (id, record) in &snapshot.resources {
            let Some(&a) = b.apply_step.get(id.as_str()) else {
                continue;
            };
            for dependency in record.dependencies() {
                let Some(theirs) = b.delete_steps.get(dependency.as_str()).cloned() else {
                    continue;
                };
                for then in theirs {
                    if b.drafts[then].action != StepAction::DestroyForReplace {
                        b.before(a, then);
                    }
                }
            }
        }

        let steps = order(b.drafts, &b.edges)?;
        info!(
            "Planned {} steps for {} operations",
            steps.len(),
            changes.operations.len()
        );

        Ok(ExecutionPlan {
            created_at: Utc::now(),
            desired_hash: desired_hash.to_string(),
            changes: changes.clone(),
            steps,
        })
    }

    fn add_operation<'g>(
        &self,
        b: &mut Builder<'g>,
        op: &'g ChangeOperation,
        desired: &ResourceGraph,
        snapshot: &StateSnapshot,
    ) -> Result<(), PlanError> {
        let id = op.id();
        let unknown = || PlanError::UnknownResource { id: id.to_string() };

        match op {
            ChangeOperation::Create { .. } => {
                let node = desired.get(id).ok_or_else(unknown)?;
                let c = b.push(
                    StepAction::Create,
                    id,
                    &node.kind,
                    String::from("not yet created"),
                );
                b.apply_step.insert(id, c);
            }
            ChangeOperation::Update { changed, .. } => {
                let node = desired.get(id).ok_or_else(unknown)?;
                let u = b.push(
                    StepAction::Update,
                    id,
                    &node.kind,
                    format!("changed: {}", changed.join(", ")),
                );
                b.apply_step.insert(id, u);
            }
            ChangeOperation::Delete { .. } => {
                let record = snapshot.get(id).ok_or_else(unknown)?;
                let d = b.push(
                    StepAction::Delete,
                    id,
                    &record.kind,
                    String::from("no longer declared"),
                );
                b.add_delete(id, d);
            }
            ChangeOperation::Replace { reason, .. } => {
                let node = desired.get(id).ok_or_else(unknown)?;
                let record = snapshot.get(id).ok_or_else(unknown)?;
                let strategy = self
                    .schemas
                    .get(&node.kind)
                    .map(|s| s.replace_strategy)
                    .ok_or_else(|| PlanError::MissingSchema {
                        id: id.to_string(),
                        kind: node.kind.clone(),
                    })?;
                debug!("{id}: replace with {strategy}");

                match strategy {
                    ReplaceStrategy::DestroyBeforeCreate => {
                        let r =
                            b.push(StepAction::DestroyForReplace, id, &record.kind, reason.clone());
                        let c = b.push(StepAction::Create, id, &node.kind, reason.clone());
                        b.before(r, c);
                        b.apply_step.insert(id, c);
                        b.add_delete(id, r);
                    }
                    ReplaceStrategy::CreateBeforeDestroy => {
                        let c = b.push(StepAction::Create, id, &node.kind, reason.clone());
                        let k = b.push(StepAction::CleanupDeposed, id, &record.kind, reason.clone());
                        b.before(c, k);
                        b.apply_step.insert(id, c);
                        b.add_delete(id, k);
                        b.cleanup_step.insert(id, k);
                    }
                }
            }
        }
        Ok(())
    }
}

/// Topologically sorts drafts and renumbers dependencies.
fn order(drafts: Vec<Draft>, edges: &BTreeSet<(usize, usize)>) -> Result<Vec<PlannedStep>, PlanError> {
    let n = drafts.len();
    let mut successors = vec![Vec::new(); n];
    let mut predecessors = vec![Vec::new(); n];
    let mut indegree = vec![0usize; n];
    for &(first, then) in edges {
        successors[first].push(then);
        predecessors[then].push(first);
        indegree[then] += 1;
    }

    let key = |i: usize| (drafts[i].action.rank(), drafts[i].node_id.as_str(), i);
    let mut ready: BTreeSet<(u8, &str, usize)> =
        (0..n).filter(|&i| indegree[i] == 0).map(key).collect();
    let mut position = vec![None; n];
    let mut sequence = Vec::with_capacity(n);

    while let Some((_, _, i)) = ready.pop_first() {
        position[i] = Some(sequence.len());
        sequence.push(i);
        for &next in &successors[i] {
            indegree[next] -= 1;
            if indegree[next] == 0 {
                ready.insert(key(next));
            }
        }
    }

    if sequence.len() < n {
        let mut stuck: Vec<String> = (0..n)
            .filter(|&i| position[i].is_none())
            .map(|i| format!("{} {}", drafts[i].action, drafts[i].node_id))
            .collect();
        stuck.sort();
        return Err(PlanError::Cycle { steps: stuck });
    }

    let mut slots: Vec<Option<Draft>> = drafts.into_iter().map(Some).collect();
    let mut steps = Vec::with_capacity(n);
    for (index, &i) in sequence.iter().enumerate() {
        let Some(draft) = slots[i].take() else {
            continue;
        };
        let mut dependencies: Vec<usize> = predecessors[i]
            .iter()
            .filter_map(|&p| position[p])
            .collect();
        dependencies.sort_unstable();
        dependencies.dedup();
        steps.push(PlannedStep {
            index,
            action: draft.action,
            node_id: draft.node_id,
            kind: draft.kind,
            reason: draft.reason,
            dependencies,
        });
    }
    Ok(steps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;
    use crate::graph::{GraphBuilder, KindSchema, Outputs};
    use crate::planner::DiffEngine;
    use crate::state::{DeposedInstance, NodeRecord};

    fn graph(yaml: &str, schemas: &SchemaRegistry) -> ResourceGraph {
        let config = ConfigParser::new()
            .parse_yaml(yaml, None)
            .expect("test stack parses");
        GraphBuilder::new(schemas)
            .build(&config)
            .expect("valid graph")
    }

    fn snapshot_of(graph: &ResourceGraph) -> StateSnapshot {
        let mut snapshot = StateSnapshot::new("demo", "dev");
        for node in graph.nodes() {
            snapshot.upsert(
                &node.id,
                NodeRecord::new(
                    &node.kind,
                    node.properties.clone(),
                    format!("phys-{}", node.id),
                    Outputs::new(),
                ),
            );
        }
        snapshot
    }

    fn plan(
        schemas: &SchemaRegistry,
        desired: &ResourceGraph,
        snapshot: &StateSnapshot,
    ) -> Result<ExecutionPlan, PlanError> {
        let changes = DiffEngine::new(schemas).compute(desired, snapshot);
        Planner::new(schemas).plan(&changes, desired, snapshot, "hash")
    }

    fn position(plan: &ExecutionPlan, action: StepAction, id: &str) -> usize {
        plan.steps
            .iter()
            .position(|s| s.action == action && s.node_id == id)
            .unwrap_or_else(|| panic!("missing step {action} {id}"))
    }

    const TABLE_AND_BUCKET: &str = r"
project:
  name: demo
resources:
  - id: table
    kind: DynamoTable
    properties:
      table_name: items
      archive_bucket: { ref: bucket }
  - id: bucket
    kind: S3Bucket
    properties:
      bucket_name: uploads
";

    #[test]
    fn test_creates_follow_dependencies() {
        let schemas = SchemaRegistry::builtin();
        let desired = graph(TABLE_AND_BUCKET, &schemas);
        let plan = plan(&schemas, &desired, &StateSnapshot::default()).expect("plan");

        let descriptions: Vec<String> = plan.steps.iter().map(PlannedStep::description).collect();
        assert_eq!(
            descriptions,
            vec!["create bucket (S3Bucket)", "create table (DynamoTable)"]
        );
        assert_eq!(plan.steps[1].dependencies, vec![0]);
    }

    #[test]
    fn test_deletes_run_in_reverse_dependency_order() {
        let schemas = SchemaRegistry::builtin();
        let existing = graph(TABLE_AND_BUCKET, &schemas);
        let snapshot = snapshot_of(&existing);

        let plan = plan(&schemas, &ResourceGraph::empty(), &snapshot).expect("plan");
        assert_eq!(plan.len(), 2);
        assert!(
            position(&plan, StepAction::Delete, "table")
                < position(&plan, StepAction::Delete, "bucket")
        );
    }

    #[test]
    fn test_removing_leaf_deletes_only_it() {
        let schemas = SchemaRegistry::builtin();
        let existing = graph(TABLE_AND_BUCKET, &schemas);
        let snapshot = snapshot_of(&existing);
        let desired = graph(
            r"
project:
  name: demo
resources:
  - id: bucket
    kind: S3Bucket
    properties:
      bucket_name: uploads
",
            &schemas,
        );

        let plan = plan(&schemas, &desired, &snapshot).expect("plan");
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.steps[0].description(), "delete table (DynamoTable)");
    }

    #[test]
    fn test_dropped_reference_is_updated_before_delete() {
        let schemas = SchemaRegistry::builtin();
        let snapshot = snapshot_of(&graph(
            r"
project:
  name: demo
resources:
  - id: bucket
    kind: S3Bucket
    properties:
      bucket_name: uploads
  - id: cdn
    kind: CloudFrontDistribution
    properties:
      origin: { ref: bucket.arn }
",
            &schemas,
        ));
        let desired = graph(
            r"
project:
  name: demo
resources:
  - id: cdn
    kind: CloudFrontDistribution
    properties:
      origin: example.com
",
            &schemas,
        );

        let plan = plan(&schemas, &desired, &snapshot).expect("plan");
        let update = position(&plan, StepAction::Update, "cdn");
        let delete = position(&plan, StepAction::Delete, "bucket");
        assert!(update < delete);
        assert_eq!(plan.steps[delete].dependencies, vec![update]);
    }

    #[test]
    fn test_destroy_before_create_replacement() {
        let schemas = SchemaRegistry::builtin();
        let snapshot = snapshot_of(&graph(TABLE_AND_BUCKET, &schemas));
        let desired = graph(&TABLE_AND_BUCKET.replace("uploads", "uploads-v2"), &schemas);

        let plan = plan(&schemas, &desired, &snapshot).expect("plan");
        let destroy = position(&plan, StepAction::DestroyForReplace, "bucket");
        let create = position(&plan, StepAction::Create, "bucket");
        let update = position(&plan, StepAction::Update, "table");
        assert!(destroy < create);
        assert!(create < update);
        assert!(plan.has_destructive_steps());
    }

    #[test]
    fn test_create_before_destroy_replacement() {
        let mut schemas = SchemaRegistry::builtin();
        schemas.register(
            "S3Bucket",
            KindSchema {
                replace_on: vec![String::from("bucket_name")],
                replace_strategy: ReplaceStrategy::CreateBeforeDestroy,
            },
        );
        let snapshot = snapshot_of(&graph(TABLE_AND_BUCKET, &schemas));
        let desired = graph(&TABLE_AND_BUCKET.replace("uploads", "uploads-v2"), &schemas);

        let plan = plan(&schemas, &desired, &snapshot).expect("plan");
        let create = position(&plan, StepAction::Create, "bucket");
        let update = position(&plan, StepAction::Update, "table");
        let cleanup = position(&plan, StepAction::CleanupDeposed, "bucket");
        assert!(create < update);
        assert!(update < cleanup);
    }

    #[test]
    fn test_conflicting_strategies_are_a_plan_cycle() {
        // The table is replaced create-before-destroy and references the
        // bucket, which is replaced destroy-before-create.
        let mut schemas = SchemaRegistry::builtin();
        schemas.register(
            "DynamoTable",
            KindSchema {
                replace_on: vec![String::from("table_name"), String::from("archive_bucket")],
                replace_strategy: ReplaceStrategy::CreateBeforeDestroy,
            },
        );
        let snapshot = snapshot_of(&graph(TABLE_AND_BUCKET, &schemas));
        let desired = graph(&TABLE_AND_BUCKET.replace("uploads", "uploads-v2"), &schemas);

        let err = plan(&schemas, &desired, &snapshot).expect_err("unsatisfiable");
        match err {
            PlanError::Cycle { steps } => {
                assert!(steps.contains(&String::from("destroy-for-replace bucket")));
                assert!(steps.contains(&String::from("cleanup-deposed table")));
            }
            other => panic!("expected cycle, got {other}"),
        }
    }

    #[test]
    fn test_leftover_deposed_instances_are_cleaned_up() {
        let schemas = SchemaRegistry::builtin();
        let desired = graph(TABLE_AND_BUCKET, &schemas);
        let mut snapshot = snapshot_of(&desired);
        if let Some(record) = snapshot.resources.get_mut("bucket") {
            record.deposed.push(DeposedInstance {
                physical_id: String::from("old-bucket"),
                kind: String::from("S3Bucket"),
            });
        }

        let plan = plan(&schemas, &desired, &snapshot).expect("plan");
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.steps[0].action, StepAction::CleanupDeposed);
    }

    #[test]
    fn test_unchanged_stack_has_empty_plan() {
        let schemas = SchemaRegistry::builtin();
        let desired = graph(TABLE_AND_BUCKET, &schemas);
        let plan = plan(&schemas, &desired, &snapshot_of(&desired)).expect("plan");
        assert!(plan.is_empty());
    }
}
