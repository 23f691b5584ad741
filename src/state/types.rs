//! Persisted state types.
//!
//! The snapshot is the record of what exists in the cloud: one entry per
//! logical id with the declared properties that were last applied, the
//! provider-assigned physical id, and outputs. Fields added by newer
//! versions are kept in `extra` and written back unchanged.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::config::DeletionPolicy;
use crate::graph::{Outputs, Properties, Reference, reference};

/// Current version of the state format.
pub const STATE_VERSION: &str = "1";

/// Number of run history entries kept.
const MAX_HISTORY: usize = 100;

/// Output name that always resolves to the physical id.
pub const ID_OUTPUT: &str = "id";

/// The persisted state of one stack.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateSnapshot {
    /// State format version.
    pub version: String,
    /// Project name.
    #[serde(default)]
    pub project: String,
    /// Environment name.
    #[serde(default)]
    pub environment: String,
    /// Hash of the desired state of the last fully successful apply.
    #[serde(default)]
    pub desired_hash: String,
    /// Records keyed by logical id.
    #[serde(default)]
    pub resources: BTreeMap<String, NodeRecord>,
    /// When the state was last modified.
    pub last_updated: DateTime<Utc>,
    /// Recent runs, oldest first.
    #[serde(default)]
    pub history: Vec<RunHistoryEntry>,
    /// Fields this version does not know about.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// The recorded state of one resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeRecord {
    /// Kind tag.
    pub kind: String,
    /// Declared properties as last applied, references unresolved.
    #[serde(default)]
    pub properties: Properties,
    /// Provider-assigned identifier.
    pub physical_id: String,
    /// Provider-reported outputs.
    #[serde(default)]
    pub outputs: Outputs,
    /// Behavior when the resource is removed.
    #[serde(default)]
    pub deletion_policy: DeletionPolicy,
    /// Replaced instances not yet deleted.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deposed: Vec<DeposedInstance>,
    /// When the current instance was created.
    pub created_at: DateTime<Utc>,
    /// When the record last changed.
    pub updated_at: DateTime<Utc>,
    /// Fields this version does not know about.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// An instance superseded by a create-before-destroy replacement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeposedInstance {
    /// Provider-assigned identifier of the old instance.
    pub physical_id: String,
    /// Kind of the old instance.
    pub kind: String,
}

/// One entry in the run history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunHistoryEntry {
    /// Run identifier.
    pub run_id: Uuid,
    /// When the run finished.
    pub timestamp: DateTime<Utc>,
    /// Type of run.
    pub operation: RunOperation,
    /// Logical ids the run operated on.
    pub resources: Vec<String>,
    /// Whether every step succeeded.
    pub success: bool,
    /// First error, if any.
    #[serde(default)]
    pub error: Option<String>,
}

/// Types of runs that change state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunOperation {
    /// Converge to the declared state.
    Apply,
    /// Tear everything down.
    Destroy,
}

/// Stack-level facts recorded at the end of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    /// Project name.
    pub project: String,
    /// Environment name.
    pub environment: String,
    /// Desired-state hash, set only when the run fully converged.
    pub desired_hash: Option<String>,
    /// History entry to append.
    pub entry: RunHistoryEntry,
}

impl Default for StateSnapshot {
    fn default() -> Self {
        Self::new("", "")
    }
}

impl StateSnapshot {
    /// Creates an empty snapshot.
    #[must_use]
    pub fn new(project: &str, environment: &str) -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            project: project.to_string(),
            environment: environment.to_string(),
            desired_hash: String::new(),
            resources: BTreeMap::new(),
            last_updated: Utc::now(),
            history: Vec::new(),
            extra: BTreeMap::new(),
        }
    }

    /// Returns true if no resource is recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Gets a record by logical id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&NodeRecord> {
        self.resources.get(id)
    }

    /// Adds or replaces a record.
    pub fn upsert(&mut self, id: &str, record: NodeRecord) {
        self.resources.insert(id.to_string(), record);
        self.last_updated = Utc::now();
    }

    /// Removes a record.
    pub fn remove(&mut self, id: &str) -> Option<NodeRecord> {
        let removed = self.resources.remove(id);
        if removed.is_some() {
            self.last_updated = Utc::now();
        }
        removed
    }

    /// Applies the stack-level facts of a finished run.
    pub fn apply_summary(&mut self, summary: RunSummary) {
        self.project = summary.project;
        self.environment = summary.environment;
        if let Some(hash) = summary.desired_hash {
            self.desired_hash = hash;
        }
        if self.history.len() >= MAX_HISTORY {
            self.history.remove(0);
        }
        self.history.push(summary.entry);
        self.last_updated = Utc::now();
    }

    /// Resolves a reference against recorded resources.
    #[must_use]
    pub fn lookup(&self, reference: &Reference) -> Option<Value> {
        self.resources
            .get(&reference.target)
            .and_then(|record| record.output(reference.output.as_deref()))
    }

    /// Logical ids in order.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.resources.keys().map(String::as_str)
    }
}

impl NodeRecord {
    /// Creates a record for a freshly created instance.
    #[must_use]
    pub fn new(
        kind: impl Into<String>,
        properties: Properties,
        physical_id: impl Into<String>,
        outputs: Outputs,
    ) -> Self {
        let now = Utc::now();
        Self {
            kind: kind.into(),
            properties,
            physical_id: physical_id.into(),
            outputs,
            deletion_policy: DeletionPolicy::default(),
            deposed: Vec::new(),
            created_at: now,
            updated_at: now,
            extra: BTreeMap::new(),
        }
    }

    /// Returns an output, or the physical id for `None` and `"id"`.
    #[must_use]
    pub fn output(&self, name: Option<&str>) -> Option<Value> {
        match name {
            None => Some(Value::String(self.physical_id.clone())),
            Some(name) => self.outputs.get(name).cloned().or_else(|| {
                (name == ID_OUTPUT).then(|| Value::String(self.physical_id.clone()))
            }),
        }
    }

    /// Logical ids referenced by the recorded properties, sorted and
    /// deduplicated. Malformed references are ignored.
    #[must_use]
    pub fn dependencies(&self) -> Vec<String> {
        let mut targets: Vec<String> = self
            .properties
            .values()
            .filter_map(|value| reference::collect(value).ok())
            .flatten()
            .map(|r| r.target)
            .collect();
        targets.sort();
        targets.dedup();
        targets
    }

    /// Records an update of the current instance.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

impl RunHistoryEntry {
    /// Creates a history entry.
    #[must_use]
    pub fn new(run_id: Uuid, operation: RunOperation, resources: Vec<String>) -> Self {
        Self {
            run_id,
            timestamp: Utc::now(),
            operation,
            resources,
            success: true,
            error: None,
        }
    }

    /// Marks the entry failed with the given error.
    #[must_use]
    pub fn failed(mut self, error: impl Into<String>) -> Self {
        self.success = false;
        self.error = Some(error.into());
        self
    }
}

impl std::fmt::Display for RunOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Apply => write!(f, "apply"),
            Self::Destroy => write!(f, "destroy"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record() -> NodeRecord {
        let mut props = Properties::new();
        props.insert("bucket".into(), json!({ "ref": "uploads.arn" }));
        props.insert("note".into(), json!("logs go to ${logs} and ${uploads}"));
        let mut outputs = Outputs::new();
        outputs.insert("arn".into(), json!("arn:aws:dynamodb:table/items"));
        NodeRecord::new("DynamoTable", props, "tbl-1", outputs)
    }

    #[test]
    fn test_record_outputs() {
        let record = record();
        assert_eq!(record.output(None), Some(json!("tbl-1")));
        assert_eq!(record.output(Some("id")), Some(json!("tbl-1")));
        assert_eq!(
            record.output(Some("arn")),
            Some(json!("arn:aws:dynamodb:table/items"))
        );
        assert_eq!(record.output(Some("stream_arn")), None);
    }

    #[test]
    fn test_record_dependencies() {
        assert_eq!(record().dependencies(), vec!["logs", "uploads"]);
    }

    #[test]
    fn test_snapshot_keeps_unknown_fields() {
        let raw = json!({
            "version": "1",
            "project": "demo",
            "environment": "dev",
            "last_updated": "2026-01-01T00:00:00Z",
            "resources": {
                "table": {
                    "kind": "DynamoTable",
                    "physical_id": "tbl-1",
                    "created_at": "2026-01-01T00:00:00Z",
                    "updated_at": "2026-01-01T00:00:00Z",
                    "drift_checked_at": "2026-01-02T00:00:00Z"
                }
            },
            "backend_serial": 42
        });

        let snapshot: StateSnapshot = serde_json::from_value(raw).expect("snapshot parses");
        assert_eq!(snapshot.extra.get("backend_serial"), Some(&json!(42)));
        let table = snapshot.get("table").expect("table record");
        assert!(table.extra.contains_key("drift_checked_at"));

        let written = serde_json::to_value(&snapshot).expect("snapshot serializes");
        assert_eq!(written["backend_serial"], json!(42));
        assert_eq!(
            written["resources"]["table"]["drift_checked_at"],
            json!("2026-01-02T00:00:00Z")
        );
    }

    #[test]
    fn test_history_is_bounded() {
        let mut snapshot = StateSnapshot::new("demo", "dev");
        for _ in 0..(MAX_HISTORY + 5) {
            snapshot.apply_summary(RunSummary {
                project: "demo".into(),
                environment: "dev".into(),
                desired_hash: None,
                entry: RunHistoryEntry::new(Uuid::new_v4(), RunOperation::Apply, vec![]),
            });
        }
        assert_eq!(snapshot.history.len(), MAX_HISTORY);
    }
}
