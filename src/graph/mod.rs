//! Resource graph module.
//!
//! This module turns a stack document into a validated dependency graph:
//! - Node and edge types
//! - Reference parsing and resolution
//! - Per-kind replacement schemas
//! - The graph builder with cycle detection

mod builder;
mod node;
pub mod reference;
mod resource_graph;
mod schema;

pub use builder::{GraphBuilder, TAGS_PROPERTY, extract_edges};
pub use node::{DependencyEdge, NodeStatus, Outputs, Properties, ResourceNode};
pub use reference::Reference;
pub use resource_graph::ResourceGraph;
pub use schema::{KindSchema, ReplaceStrategy, SchemaRegistry};
