//! Per-kind replacement rules.
//!
//! Each kind names the properties that cannot be changed in place and the
//! order in which a replacement runs. There is no default strategy: every
//! kind, built-in or declared, states one.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Order of the create and delete halves of a replacement.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ReplaceStrategy {
    /// Create the new instance first; delete the old one after every
    /// dependent has moved over.
    CreateBeforeDestroy,
    /// Delete the old instance first, for kinds whose identity (such as a
    /// globally unique name) cannot exist twice.
    DestroyBeforeCreate,
}

impl fmt::Display for ReplaceStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CreateBeforeDestroy => write!(f, "create_before_destroy"),
            Self::DestroyBeforeCreate => write!(f, "destroy_before_create"),
        }
    }
}

/// Replacement rules for one resource kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KindSchema {
    /// Properties whose change forces a replacement.
    #[serde(default)]
    pub replace_on: Vec<String>,
    /// How a replacement is ordered.
    pub replace_strategy: ReplaceStrategy,
}

impl KindSchema {
    fn new(replace_on: &[&str], replace_strategy: ReplaceStrategy) -> Self {
        Self {
            replace_on: replace_on.iter().map(|p| (*p).to_string()).collect(),
            replace_strategy,
        }
    }

    /// Returns true if changing `property` requires a new instance.
    #[must_use]
    pub fn requires_replacement(&self, property: &str) -> bool {
        self.replace_on.iter().any(|p| p == property)
    }
}

/// Registry of known kinds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaRegistry {
    kinds: BTreeMap<String, KindSchema>,
}

impl SchemaRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Creates a registry holding the built-in kinds.
    #[must_use]
    pub fn builtin() -> Self {
        use ReplaceStrategy::{CreateBeforeDestroy as Cbd, DestroyBeforeCreate as Dbc};

        let mut registry = Self::empty();
        registry.register("S3Bucket", KindSchema::new(&["bucket_name"], Dbc));
        registry.register("CloudFrontDistribution", KindSchema::new(&[], Cbd));
        registry.register(
            "DynamoTable",
            KindSchema::new(&["table_name", "partition_key", "sort_key"], Dbc),
        );
        registry.register(
            "CognitoUserPool",
            KindSchema::new(&["pool_name", "username_attributes", "alias_attributes"], Cbd),
        );
        registry.register(
            "CognitoUserPoolClient",
            KindSchema::new(&["user_pool", "generate_secret"], Cbd),
        );
        registry.register("LambdaFunction", KindSchema::new(&["function_name"], Dbc));
        registry.register("RestApi", KindSchema::new(&[], Cbd));
        registry.register("SnsTopic", KindSchema::new(&["topic_name"], Dbc));
        registry.register("CloudWatchAlarm", KindSchema::new(&["alarm_name"], Dbc));
        registry.register("CloudWatchDashboard", KindSchema::new(&["dashboard_name"], Dbc));
        registry.register("LogGroup", KindSchema::new(&["log_group_name"], Dbc));
        registry.register("IamRole", KindSchema::new(&["role_name"], Dbc));
        registry
    }

    /// Returns the built-in kinds extended by declared ones. Declared kinds
    /// replace built-ins of the same name.
    #[must_use]
    pub fn with_overrides(overrides: &BTreeMap<String, KindSchema>) -> Self {
        let mut registry = Self::builtin();
        for (kind, schema) in overrides {
            registry.register(kind.clone(), schema.clone());
        }
        registry
    }

    /// Adds or replaces a kind.
    pub fn register(&mut self, kind: impl Into<String>, schema: KindSchema) {
        self.kinds.insert(kind.into(), schema);
    }

    /// Looks up a kind.
    #[must_use]
    pub fn get(&self, kind: &str) -> Option<&KindSchema> {
        self.kinds.get(kind)
    }

    /// Returns true if the kind is known.
    #[must_use]
    pub fn contains(&self, kind: &str) -> bool {
        self.kinds.contains_key(kind)
    }

    /// Iterates over kind names in order.
    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.kinds.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_kinds() {
        let registry = SchemaRegistry::builtin();
        let bucket = registry.get("S3Bucket").expect("bucket kind");
        assert!(bucket.requires_replacement("bucket_name"));
        assert!(!bucket.requires_replacement("versioned"));
        assert_eq!(bucket.replace_strategy, ReplaceStrategy::DestroyBeforeCreate);

        let cdn = registry.get("CloudFrontDistribution").expect("cdn kind");
        assert_eq!(cdn.replace_strategy, ReplaceStrategy::CreateBeforeDestroy);
        assert!(!registry.contains("Mainframe"));
    }

    #[test]
    fn test_overrides_replace_builtins() {
        let mut overrides = BTreeMap::new();
        overrides.insert(
            String::from("S3Bucket"),
            KindSchema::new(&[], ReplaceStrategy::CreateBeforeDestroy),
        );
        overrides.insert(
            String::from("Queue"),
            KindSchema::new(&["queue_name"], ReplaceStrategy::DestroyBeforeCreate),
        );

        let registry = SchemaRegistry::with_overrides(&overrides);
        let bucket = registry.get("S3Bucket").expect("bucket kind");
        assert!(bucket.replace_on.is_empty());
        assert!(registry.contains("Queue"));
        assert!(registry.contains("DynamoTable"));
    }

    #[test]
    fn test_strategy_serde_names() {
        let parsed: ReplaceStrategy =
            serde_yaml::from_str("destroy_before_create").expect("strategy parses");
        assert_eq!(parsed, ReplaceStrategy::DestroyBeforeCreate);
        assert_eq!(parsed.to_string(), "destroy_before_create");
    }
}
