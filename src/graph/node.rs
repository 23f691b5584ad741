//! Resource nodes and dependency edges.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use crate::config::DeletionPolicy;

/// Declared properties of a resource, possibly containing references.
pub type Properties = BTreeMap<String, Value>;

/// Provider-reported attributes of a created resource.
pub type Outputs = BTreeMap<String, Value>;

/// Lifecycle of a node within one run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Built from the document, not yet planned.
    #[default]
    Pending,
    /// Part of the execution plan.
    Planned,
    /// A provider call is in flight.
    Applying,
    /// Matches the desired state.
    Applied,
    /// The last operation failed.
    Failed,
}

impl NodeStatus {
    /// Returns true if no further transition happens in this run.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Applied | Self::Failed)
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Planned => "planned",
            Self::Applying => "applying",
            Self::Applied => "applied",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// A declared resource in the desired-state graph.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceNode {
    /// Logical id, unique within the graph.
    pub id: String,
    /// Kind tag.
    pub kind: String,
    /// Declared properties with tags folded in.
    pub properties: Properties,
    /// Outputs known for this run.
    pub outputs: Outputs,
    /// Behavior when the resource is removed.
    pub deletion_policy: DeletionPolicy,
    /// Current status.
    pub status: NodeStatus,
}

impl ResourceNode {
    /// Creates a pending node.
    #[must_use]
    pub fn new(id: impl Into<String>, kind: impl Into<String>, properties: Properties) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            properties,
            outputs: Outputs::new(),
            deletion_policy: DeletionPolicy::default(),
            status: NodeStatus::Pending,
        }
    }
}

/// `from` references `to` through `property`; `to` must exist first.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DependencyEdge {
    /// Dependent node.
    pub from: String,
    /// Dependency node.
    pub to: String,
    /// Top-level property of `from` that holds the reference.
    pub property: String,
}
