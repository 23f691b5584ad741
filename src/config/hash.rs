//! Desired-state hashing.
//!
//! Hashes are computed over canonical JSON. `serde_json` maps are ordered,
//! so two documents that differ only in key order hash the same.

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use super::spec::StackConfig;

/// Hasher for desired-state documents.
#[derive(Debug, Default)]
pub struct ConfigHasher;

impl ConfigHasher {
    /// Creates a new hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes a hash over everything that influences the resource graph.
    ///
    /// Resource declaration order does not matter.
    #[must_use]
    pub fn hash_stack(&self, config: &StackConfig) -> String {
        let mut hasher = Sha256::new();

        hasher.update(config.project.name.as_bytes());
        hasher.update(config.project.environment.as_bytes());
        for (key, value) in &config.project.tags {
            hasher.update(key.as_bytes());
            hasher.update(value.as_bytes());
        }

        let mut resources: Vec<_> = config.resources.iter().collect();
        resources.sort_by(|a, b| a.id.cmp(&b.id));
        for decl in resources {
            hasher.update(decl.id.as_bytes());
            hasher.update(self.hash_properties(&decl.kind, &decl.properties).as_bytes());
            for (key, value) in &decl.tags {
                hasher.update(key.as_bytes());
                hasher.update(value.as_bytes());
            }
            hasher.update(decl.deletion_policy.to_string().as_bytes());
        }

        for (kind, schema) in &config.kinds {
            hasher.update(kind.as_bytes());
            for prop in &schema.replace_on {
                hasher.update(prop.as_bytes());
            }
            hasher.update(schema.replace_strategy.to_string().as_bytes());
        }

        hex::encode(hasher.finalize())
    }

    /// Computes a hash of one resource's kind and properties.
    #[must_use]
    pub fn hash_properties(&self, kind: &str, properties: &BTreeMap<String, Value>) -> String {
        let mut hasher = Sha256::new();
        hasher.update(kind.as_bytes());
        hasher.update([0u8]);
        // A map of JSON values always serializes.
        let canonical = serde_json::to_vec(properties).unwrap_or_default();
        hasher.update(&canonical);
        hex::encode(hasher.finalize())
    }

    /// Returns the first 12 characters of a hash, for display.
    #[must_use]
    pub fn short_hash(hash: &str) -> &str {
        hash.get(..12).unwrap_or(hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;

    const STACK: &str = r"
project:
  name: demo
resources:
  - id: bucket
    kind: S3Bucket
    properties:
      bucket_name: uploads
      versioned: true
  - id: table
    kind: DynamoTable
    properties:
      table_name: items
";

    const REORDERED: &str = r"
project:
  name: demo
resources:
  - id: table
    kind: DynamoTable
    properties:
      table_name: items
  - id: bucket
    kind: S3Bucket
    properties:
      versioned: true
      bucket_name: uploads
";

    #[test]
    fn test_hash_is_order_insensitive() {
        let parser = ConfigParser::new();
        let a = parser.parse_yaml(STACK, None).expect("parse a");
        let b = parser.parse_yaml(REORDERED, None).expect("parse b");

        let hasher = ConfigHasher::new();
        assert_eq!(hasher.hash_stack(&a), hasher.hash_stack(&b));
    }

    #[test]
    fn test_hash_changes_with_properties() {
        let parser = ConfigParser::new();
        let a = parser.parse_yaml(STACK, None).expect("parse a");
        let b = parser
            .parse_yaml(&STACK.replace("uploads", "uploads-v2"), None)
            .expect("parse b");

        let hasher = ConfigHasher::new();
        assert_ne!(hasher.hash_stack(&a), hasher.hash_stack(&b));
    }

    #[test]
    fn test_short_hash() {
        let hash = "0123456789abcdef";
        assert_eq!(ConfigHasher::short_hash(hash), "0123456789ab");
        assert_eq!(ConfigHasher::short_hash("abc"), "abc");
    }
}
