//! Stack document types for the provisioning engine.
//!
//! This module defines the structs that map to `skyforge.stack.yaml`.
//! A document fully describes the desired state: the resources, how they
//! reference each other, where state lives and how the run executes.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use validator::Validate;

use crate::graph::KindSchema;

/// The root structure of a stack document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StackConfig {
    /// Project-level configuration.
    pub project: ProjectConfig,
    /// State backend configuration.
    #[serde(default)]
    pub state: StateConfig,
    /// Provider endpoint configuration.
    #[serde(default)]
    pub provider: ProviderConfig,
    /// Execution tuning.
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// User-declared kind schemas, merged over the built-in ones.
    #[serde(default)]
    pub kinds: BTreeMap<String, KindSchema>,
    /// Declared resources.
    #[serde(default)]
    pub resources: Vec<ResourceDecl>,
    /// Stack outputs rendered from resource outputs after apply.
    #[serde(default)]
    pub outputs: BTreeMap<String, Value>,
}

/// Project-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectConfig {
    /// Unique name for the stack.
    pub name: String,
    /// Environment (e.g., "dev", "staging", "prod").
    #[serde(default = "default_environment")]
    pub environment: String,
    /// Tags applied to every resource.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// State backend configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateConfig {
    /// Backend type (local or s3).
    #[serde(default)]
    pub backend: StateBackend,
    /// S3 bucket name (required for s3 backend).
    #[serde(default)]
    pub bucket: Option<String>,
    /// S3 key prefix (optional).
    #[serde(default)]
    pub prefix: Option<String>,
    /// S3 region (optional, uses AWS default if not specified).
    #[serde(default)]
    pub region: Option<String>,
    /// Local state directory (for local backend).
    #[serde(default)]
    pub path: Option<String>,
}

/// State backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Local file-based state storage.
    #[default]
    Local,
    /// AWS S3-based state storage.
    S3,
}

/// Provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderConfig {
    /// Provider transport.
    #[serde(rename = "type", default)]
    pub provider_type: ProviderType,
    /// Base URL of the provider API.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Environment variable holding the bearer token.
    #[serde(default = "default_token_env")]
    pub token_env: String,
    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

/// Supported provider transports.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    /// JSON over HTTP.
    #[default]
    Http,
}

/// Execution tuning for apply runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct ExecutionConfig {
    /// Maximum number of independent operations in flight.
    #[serde(default = "default_parallelism")]
    #[validate(range(min = 1, max = 10))]
    pub parallelism: usize,
    /// Keep applying independent branches after a failure.
    #[serde(default)]
    pub continue_on_error: bool,
    /// Retry policy for transient provider errors.
    #[serde(default)]
    #[validate(nested)]
    pub retry: RetryConfig,
}

/// Bounded exponential backoff settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct RetryConfig {
    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    #[validate(range(min = 1))]
    pub base_delay_ms: u64,
    /// Upper bound for any single delay, in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    #[validate(range(min = 1))]
    pub max_delay_ms: u64,
    /// Total attempts including the first call.
    #[serde(default = "default_max_attempts")]
    #[validate(range(min = 1, max = 20))]
    pub max_attempts: u32,
}

/// A single declared resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceDecl {
    /// Logical id, stable across runs.
    pub id: String,
    /// Resource kind tag.
    pub kind: String,
    /// Declared properties; may contain references.
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
    /// Resource tags, merged over project tags.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// What happens to the cloud resource when it leaves the stack.
    #[serde(default)]
    pub deletion_policy: DeletionPolicy,
}

/// Deletion behavior for a resource.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeletionPolicy {
    /// Delete the cloud resource.
    #[default]
    Delete,
    /// Keep the cloud resource and only forget it.
    Retain,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            provider_type: ProviderType::Http,
            endpoint: None,
            token_env: default_token_env(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            continue_on_error: false,
            retry: RetryConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl StackConfig {
    /// Looks up a resource declaration by logical id.
    #[must_use]
    pub fn resource(&self, id: &str) -> Option<&ResourceDecl> {
        self.resources.iter().find(|r| r.id == id)
    }
}

impl std::fmt::Display for DeletionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Delete => write!(f, "delete"),
            Self::Retain => write!(f, "retain"),
        }
    }
}

fn default_environment() -> String {
    String::from("dev")
}

fn default_token_env() -> String {
    String::from("SKYFORGE_PROVIDER_TOKEN")
}

const fn default_timeout_secs() -> u64 {
    30
}

const fn default_parallelism() -> usize {
    1
}

const fn default_base_delay_ms() -> u64 {
    1_000
}

const fn default_max_delay_ms() -> u64 {
    30_000
}

const fn default_max_attempts() -> u32 {
    5
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let exec = ExecutionConfig::default();
        assert_eq!(exec.parallelism, 1);
        assert_eq!(exec.retry.base_delay_ms, 1_000);
        assert_eq!(exec.retry.max_delay_ms, 30_000);
        assert_eq!(exec.retry.max_attempts, 5);
        assert!(exec.validate().is_ok());
    }

    #[test]
    fn test_parallelism_range() {
        let exec = ExecutionConfig {
            parallelism: 11,
            ..ExecutionConfig::default()
        };
        assert!(exec.validate().is_err());

        let exec = ExecutionConfig {
            parallelism: 0,
            ..ExecutionConfig::default()
        };
        assert!(exec.validate().is_err());
    }

    #[test]
    fn test_resource_decl_defaults() {
        let yaml = "id: bucket\nkind: S3Bucket\n";
        let decl: ResourceDecl = serde_yaml::from_str(yaml).expect("valid resource");
        assert!(decl.properties.is_empty());
        assert_eq!(decl.deletion_policy, DeletionPolicy::Delete);
    }
}
