//! Diff engine for comparing desired state with the recorded snapshot.
//!
//! Comparison is structural on the declared properties (references stay
//! symbolic), so re-running against an unchanged document yields no
//! operations. Nodes are visited dependencies-first so a replacement can
//! cascade into the nodes that reference it.

use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use tracing::debug;

use crate::graph::{Properties, ResourceGraph, SchemaRegistry};
use crate::state::StateSnapshot;

/// What must happen to one logical id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ChangeOperation {
    /// Declared but not recorded.
    Create {
        /// Logical id.
        id: String,
    },
    /// Recorded and declared with in-place changes.
    Update {
        /// Logical id.
        id: String,
        /// Top-level properties that changed.
        changed: Vec<String>,
    },
    /// Must be recreated under a new physical id.
    Replace {
        /// Logical id.
        id: String,
        /// Why an in-place update is not possible.
        reason: String,
        /// Top-level properties that changed.
        changed: Vec<String>,
    },
    /// Recorded but no longer declared.
    Delete {
        /// Logical id.
        id: String,
    },
}

impl ChangeOperation {
    /// Logical id the operation applies to.
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Create { id }
            | Self::Update { id, .. }
            | Self::Replace { id, .. }
            | Self::Delete { id } => id,
        }
    }

    /// Short lowercase name.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Create { .. } => "create",
            Self::Update { .. } => "update",
            Self::Replace { .. } => "replace",
            Self::Delete { .. } => "delete",
        }
    }

    /// Sort key giving a stable order: by id, then operation.
    #[must_use]
    pub fn ordering_key(&self) -> (&str, u8) {
        let rank = match self {
            Self::Delete { .. } => 0,
            Self::Replace { .. } => 1,
            Self::Create { .. } => 2,
            Self::Update { .. } => 3,
        };
        (self.id(), rank)
    }
}

impl fmt::Display for ChangeOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Update { id, changed } => write!(f, "update {id} ({})", changed.join(", ")),
            Self::Replace { id, reason, .. } => write!(f, "replace {id} ({reason})"),
            other => write!(f, "{} {}", other.label(), other.id()),
        }
    }
}

/// The full set of operations for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChangeSet {
    /// Operations in ordering-key order.
    pub operations: Vec<ChangeOperation>,
    /// Declared ids that need nothing.
    pub unchanged: Vec<String>,
}

impl ChangeSet {
    /// Returns true if nothing needs to happen.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Looks up the operation for an id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&ChangeOperation> {
        self.operations.iter().find(|op| op.id() == id)
    }

    fn count(&self, label: &str) -> usize {
        self.operations.iter().filter(|op| op.label() == label).count()
    }

    /// Number of creates.
    #[must_use]
    pub fn creates(&self) -> usize {
        self.count("create")
    }

    /// Number of updates.
    #[must_use]
    pub fn updates(&self) -> usize {
        self.count("update")
    }

    /// Number of replacements.
    #[must_use]
    pub fn replaces(&self) -> usize {
        self.count("replace")
    }

    /// Number of deletes.
    #[must_use]
    pub fn deletes(&self) -> usize {
        self.count("delete")
    }
}

/// Engine for computing change sets.
#[derive(Debug)]
pub struct DiffEngine<'a> {
    schemas: &'a SchemaRegistry,
}

impl<'a> DiffEngine<'a> {
    /// Creates a diff engine using `schemas` for replacement rules.
    #[must_use]
    pub const fn new(schemas: &'a SchemaRegistry) -> Self {
        Self { schemas }
    }

    /// Computes the operations that take `snapshot` to `desired`.
    #[must_use]
    pub fn compute(&self, desired: &ResourceGraph, snapshot: &StateSnapshot) -> ChangeSet {
        let mut operations = Vec::new();
        let mut unchanged = Vec::new();
        let mut replaced: HashSet<&str> = HashSet::new();

        for id in desired.topological_order() {
            let Some(node) = desired.get(id) else {
                continue;
            };
            let Some(record) = snapshot.get(id) else {
                operations.push(ChangeOperation::Create { id: id.to_string() });
                continue;
            };

            let mut changed = changed_properties(&record.properties, &node.properties);
            if record.kind != node.kind {
                replaced.insert(id);
                operations.push(ChangeOperation::Replace {
                    id: id.to_string(),
                    reason: format!("kind changed from {} to {}", record.kind, node.kind),
                    changed: changed.into_iter().collect(),
                });
                continue;
            }

            let schema = self.schemas.get(&node.kind);
            let forces = |prop: &str| schema.is_some_and(|s| s.requires_replacement(prop));

            let mut reason = changed
                .iter()
                .find(|p| forces(p.as_str()))
                .map(|p| format!("property '{p}' requires replacement"));

            for dependency in desired.dependencies_of(id) {
                if !replaced.contains(dependency) {
                    continue;
                }
                for prop in desired.referencing_properties(id, dependency) {
                    if reason.is_none() && forces(prop) {
                        reason = Some(format!(
                            "property '{prop}' references '{dependency}', which is being replaced"
                        ));
                    }
                    changed.insert(prop.to_string());
                }
            }

            let changed: Vec<String> = changed.into_iter().collect();
            match reason {
                Some(reason) => {
                    debug!("{id}: replace ({reason})");
                    replaced.insert(id);
                    operations.push(ChangeOperation::Replace {
                        id: id.to_string(),
                        reason,
                        changed,
                    });
                }
                None if changed.is_empty() => unchanged.push(id.to_string()),
                None => {
                    debug!("{id}: update {changed:?}");
                    operations.push(ChangeOperation::Update {
                        id: id.to_string(),
                        changed,
                    });
                }
            }
        }

        for id in snapshot.ids() {
            if !desired.contains(id) {
                operations.push(ChangeOperation::Delete { id: id.to_string() });
            }
        }

        operations.sort_by(|a, b| a.ordering_key().cmp(&b.ordering_key()));
        unchanged.sort();

        ChangeSet {
            operations,
            unchanged,
        }
    }
}

/// Top-level keys whose values differ, including added and removed keys.
fn changed_properties(old: &Properties, new: &Properties) -> BTreeSet<String> {
    old.keys()
        .chain(new.keys())
        .filter(|key| old.get(*key) != new.get(*key))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;
    use crate::graph::GraphBuilder;
    use crate::state::NodeRecord;
    use serde_json::json;

    fn graph(yaml: &str, schemas: &SchemaRegistry) -> ResourceGraph {
        let config = ConfigParser::new()
            .parse_yaml(yaml, None)
            .expect("test stack parses");
        GraphBuilder::new(schemas)
            .build(&config)
            .expect("valid graph")
    }

    /// Records every node of `graph` as applied.
    fn snapshot_of(graph: &ResourceGraph) -> StateSnapshot {
        let mut snapshot = StateSnapshot::new("demo", "dev");
        for node in graph.nodes() {
            snapshot.upsert(
                &node.id,
                NodeRecord::new(
                    &node.kind,
                    node.properties.clone(),
                    format!("phys-{}", node.id),
                    crate::graph::Outputs::new(),
                ),
            );
        }
        snapshot
    }

    const STACK: &str = r"
project:
  name: demo
resources:
  - id: bucket
    kind: S3Bucket
    properties:
      bucket_name: uploads
      versioned: false
  - id: cdn
    kind: CloudFrontDistribution
    properties:
      origin: { ref: bucket.domain_name }
      price_class: PriceClass_100
";

    #[test]
    fn test_empty_snapshot_creates_everything() {
        let schemas = SchemaRegistry::builtin();
        let desired = graph(STACK, &schemas);
        let changes = DiffEngine::new(&schemas).compute(&desired, &StateSnapshot::default());

        assert_eq!(changes.creates(), 2);
        assert_eq!(
            changes.operations,
            vec![
                ChangeOperation::Create { id: "bucket".into() },
                ChangeOperation::Create { id: "cdn".into() },
            ]
        );
    }

    #[test]
    fn test_unchanged_is_idempotent() {
        let schemas = SchemaRegistry::builtin();
        let desired = graph(STACK, &schemas);
        let snapshot = snapshot_of(&desired);

        let changes = DiffEngine::new(&schemas).compute(&desired, &snapshot);
        assert!(changes.is_empty());
        assert_eq!(changes.unchanged, vec!["bucket", "cdn"]);
    }

    #[test]
    fn test_in_place_update() {
        let schemas = SchemaRegistry::builtin();
        let old = graph(STACK, &schemas);
        let new = graph(&STACK.replace("versioned: false", "versioned: true"), &schemas);

        let changes = DiffEngine::new(&schemas).compute(&new, &snapshot_of(&old));
        assert_eq!(
            changes.operations,
            vec![ChangeOperation::Update {
                id: "bucket".into(),
                changed: vec!["versioned".into()],
            }]
        );
    }

    #[test]
    fn test_replacement_cascades_to_dependents() {
        let schemas = SchemaRegistry::builtin();
        let old = graph(STACK, &schemas);
        let new = graph(&STACK.replace("uploads", "uploads-v2"), &schemas);

        let changes = DiffEngine::new(&schemas).compute(&new, &snapshot_of(&old));
        assert_eq!(changes.replaces(), 1);
        assert!(matches!(
            changes.get("bucket"),
            Some(ChangeOperation::Replace { .. })
        ));
        assert_eq!(
            changes.get("cdn"),
            Some(&ChangeOperation::Update {
                id: "cdn".into(),
                changed: vec!["origin".into()],
            })
        );
    }

    #[test]
    fn test_kind_change_is_replace() {
        let schemas = SchemaRegistry::builtin();
        let old = graph(STACK, &schemas);
        let mut snapshot = snapshot_of(&old);
        if let Some(record) = snapshot.resources.get_mut("cdn") {
            record.kind = String::from("RestApi");
        }

        let changes = DiffEngine::new(&schemas).compute(&old, &snapshot);
        match changes.get("cdn") {
            Some(ChangeOperation::Replace { reason, .. }) => {
                assert!(reason.contains("kind changed"));
            }
            other => panic!("expected replace, got {other:?}"),
        }
    }

    #[test]
    fn test_removed_resource_is_deleted() {
        let schemas = SchemaRegistry::builtin();
        let old = graph(STACK, &schemas);
        let mut snapshot = snapshot_of(&old);
        snapshot.upsert(
            "orphan",
            NodeRecord::new("SnsTopic", Properties::new(), "t-1", crate::graph::Outputs::new()),
        );

        let changes = DiffEngine::new(&schemas).compute(&old, &snapshot);
        assert_eq!(
            changes.operations,
            vec![ChangeOperation::Delete { id: "orphan".into() }]
        );
    }

    #[test]
    fn test_nested_key_order_does_not_matter() {
        let mut old = Properties::new();
        old.insert("cors".into(), json!({ "origins": ["*"], "max_age": 300 }));
        old.insert("list".into(), json!([1, 2]));

        let mut new = Properties::new();
        new.insert(
            "cors".into(),
            serde_json::from_str(r#"{ "max_age": 300, "origins": ["*"] }"#).expect("json"),
        );
        new.insert("list".into(), json!([2, 1]));

        let changed: Vec<String> = changed_properties(&old, &new).into_iter().collect();
        assert_eq!(changed, vec!["list"]);
    }
}
