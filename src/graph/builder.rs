//! Builds the desired-state graph from a stack document.
//!
//! Everything that can be wrong with the desired state is detected here,
//! before any provider call: duplicate ids, unknown kinds, malformed or
//! dangling references, and dependency cycles.

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::{debug, info};

use crate::config::StackConfig;
use crate::error::ValidationError;

use super::node::{DependencyEdge, Properties, ResourceNode};
use super::reference;
use super::resource_graph::ResourceGraph;
use super::schema::SchemaRegistry;

/// Property under which merged tags are passed to the provider.
pub const TAGS_PROPERTY: &str = "tags";

/// Builds and validates [`ResourceGraph`]s.
#[derive(Debug)]
pub struct GraphBuilder<'a> {
    schemas: &'a SchemaRegistry,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

impl<'a> GraphBuilder<'a> {
    /// Creates a builder that checks kinds against `schemas`.
    #[must_use]
    pub const fn new(schemas: &'a SchemaRegistry) -> Self {
        Self { schemas }
    }

    /// Builds the graph.
    ///
    /// # Errors
    ///
    /// Returns the first validation error found.
    pub fn build(&self, config: &StackConfig) -> Result<ResourceGraph, ValidationError> {
        let mut seen = HashSet::new();
        for decl in &config.resources {
            if !seen.insert(decl.id.as_str()) {
                return Err(ValidationError::DuplicateId {
                    id: decl.id.clone(),
                });
            }
            if !self.schemas.contains(&decl.kind) {
                return Err(ValidationError::UnknownKind {
                    id: decl.id.clone(),
                    kind: decl.kind.clone(),
                });
            }
        }

        let mut nodes = Vec::with_capacity(config.resources.len());
        let mut edges = BTreeSet::new();

        for decl in &config.resources {
            let mut properties = decl.properties.clone();
            let tags: BTreeMap<&String, &String> =
                config.project.tags.iter().chain(decl.tags.iter()).collect();
            if !tags.is_empty() && !properties.contains_key(TAGS_PROPERTY) {
                let tags = tags
                    .into_iter()
                    .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                    .collect();
                properties.insert(TAGS_PROPERTY.to_string(), Value::Object(tags));
            }

            for edge in extract_edges(&decl.id, &properties)? {
                if !seen.contains(edge.to.as_str()) {
                    return Err(ValidationError::DanglingReference {
                        from: edge.from,
                        property: edge.property,
                        target: edge.to,
                    });
                }
                edges.insert(edge);
            }

            let mut node = ResourceNode::new(&decl.id, &decl.kind, properties);
            node.deletion_policy = decl.deletion_policy;
            nodes.push(node);
        }

        let graph = ResourceGraph::from_parts(nodes, edges.into_iter().collect());
        if let Some(cycle) = find_cycle(&graph) {
            return Err(ValidationError::Cycle { cycle });
        }

        info!(
            "Built resource graph: {} nodes, {} edges",
            graph.len(),
            graph.edges().len()
        );
        Ok(graph)
    }
}

/// Extracts the dependency edges implied by a node's properties.
///
/// # Errors
///
/// Returns [`ValidationError::MalformedReference`] for unparsable references.
pub fn extract_edges(
    id: &str,
    properties: &Properties,
) -> Result<Vec<DependencyEdge>, ValidationError> {
    let mut edges = Vec::new();
    for (property, value) in properties {
        let refs = reference::collect(value).map_err(|expression| {
            ValidationError::MalformedReference {
                from: id.to_string(),
                property: property.clone(),
                expression,
            }
        })?;
        for reference in refs {
            debug!("{id}.{property} references {reference}");
            edges.push(DependencyEdge {
                from: id.to_string(),
                to: reference.target,
                property: property.clone(),
            });
        }
    }
    Ok(edges)
}

/// Three-color depth-first search. Returns the ids along the first cycle
/// found, with the first id repeated at the end.
fn find_cycle(graph: &ResourceGraph) -> Option<Vec<String>> {
    let ids: Vec<&str> = graph.nodes().map(|n| n.id.as_str()).collect();
    let position: HashMap<&str, usize> = ids.iter().enumerate().map(|(i, id)| (*id, i)).collect();

    let mut adjacency = vec![Vec::new(); ids.len()];
    for edge in graph.edges() {
        if let (Some(&from), Some(&to)) = (
            position.get(edge.from.as_str()),
            position.get(edge.to.as_str()),
        ) {
            adjacency[from].push(to);
        }
    }
    for targets in &mut adjacency {
        targets.sort_unstable();
        targets.dedup();
    }

    let mut color = vec![Color::White; ids.len()];
    let mut stack = Vec::new();
    for start in 0..ids.len() {
        if color[start] == Color::White {
            if let Some(cycle) = visit(start, &adjacency, &mut color, &mut stack) {
                return Some(cycle.into_iter().map(|i| ids[i].to_string()).collect());
            }
        }
    }
    None
}

fn visit(
    node: usize,
    adjacency: &[Vec<usize>],
    color: &mut [Color],
    stack: &mut Vec<usize>,
) -> Option<Vec<usize>> {
    color[node] = Color::Gray;
    stack.push(node);

    for &next in &adjacency[node] {
        match color[next] {
            Color::Gray => {
                let start = stack.iter().position(|&n| n == next)?;
                let mut cycle = stack[start..].to_vec();
                cycle.push(next);
                return Some(cycle);
            }
            Color::White => {
                if let Some(cycle) = visit(next, adjacency, color, stack) {
                    return Some(cycle);
                }
            }
            Color::Black => {}
        }
    }

    stack.pop();
    color[node] = Color::Black;
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;
    use crate::graph::NodeStatus;
    use serde_json::json;

    fn build(yaml: &str) -> Result<ResourceGraph, ValidationError> {
        let config = ConfigParser::new()
            .parse_yaml(yaml, None)
            .expect("test stack parses");
        let schemas = SchemaRegistry::with_overrides(&config.kinds);
        GraphBuilder::new(&schemas).build(&config)
    }

    #[test]
    fn test_builds_edges_from_references() {
        let graph = build(
            r#"
project:
  name: demo
resources:
  - id: bucket
    kind: S3Bucket
    properties:
      bucket_name: uploads
  - id: table
    kind: DynamoTable
    properties:
      table_name: items
      archive: { ref: bucket.arn }
      note: "stored in ${bucket}"
"#,
        )
        .expect("valid graph");

        assert_eq!(graph.len(), 2);
        assert_eq!(graph.dependencies_of("table"), vec!["bucket"]);
        assert_eq!(
            graph.referencing_properties("table", "bucket"),
            vec!["archive", "note"]
        );
        assert!(graph.nodes().all(|n| n.status == NodeStatus::Pending));
    }

    #[test]
    fn test_detects_cycle() {
        let err = build(
            r"
project:
  name: demo
resources:
  - id: a
    kind: S3Bucket
    properties:
      peer: { ref: b }
  - id: b
    kind: S3Bucket
    properties:
      peer: { ref: a }
",
        )
        .expect_err("cycle rejected");

        match err {
            ValidationError::Cycle { cycle } => assert_eq!(cycle, vec!["a", "b", "a"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_detects_self_reference() {
        let err = build(
            r"
project:
  name: demo
resources:
  - id: a
    kind: S3Bucket
    properties:
      me: { ref: a.arn }
",
        )
        .expect_err("self reference rejected");
        assert_eq!(err.to_string(), "Dependency cycle detected: a -> a");
    }

    #[test]
    fn test_detects_dangling_reference() {
        let err = build(
            r"
project:
  name: demo
resources:
  - id: fn
    kind: LambdaFunction
    properties:
      table: { ref: table.name }
",
        )
        .expect_err("dangling rejected");
        assert!(matches!(
            err,
            ValidationError::DanglingReference { ref target, .. } if target == "table"
        ));
    }

    #[test]
    fn test_detects_duplicate_and_unknown_kind() {
        let dup = build(
            r"
project:
  name: demo
resources:
  - id: a
    kind: S3Bucket
  - id: a
    kind: S3Bucket
",
        )
        .expect_err("duplicate rejected");
        assert!(matches!(dup, ValidationError::DuplicateId { .. }));

        let unknown = build(
            r"
project:
  name: demo
resources:
  - id: a
    kind: Mainframe
",
        )
        .expect_err("unknown kind rejected");
        assert!(matches!(unknown, ValidationError::UnknownKind { .. }));
    }

    #[test]
    fn test_detects_malformed_reference() {
        let err = build(
            r#"
project:
  name: demo
resources:
  - id: a
    kind: S3Bucket
    properties:
      name: "${unterminated"
"#,
        )
        .expect_err("malformed rejected");
        assert!(matches!(err, ValidationError::MalformedReference { .. }));
    }

    #[test]
    fn test_merges_project_and_resource_tags() {
        let graph = build(
            r"
project:
  name: demo
  tags:
    Project: demo
    Team: core
resources:
  - id: a
    kind: S3Bucket
    tags:
      Team: storage
",
        )
        .expect("valid graph");

        let node = graph.get("a").expect("node a");
        assert_eq!(
            node.properties.get(TAGS_PROPERTY),
            Some(&json!({ "Project": "demo", "Team": "storage" }))
        );
    }
}
