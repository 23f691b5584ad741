//! Stack document parser.
//!
//! This module loads the stack document from YAML, applies environment
//! variable overrides, and loads a sibling `.env` file when present.

use crate::error::{ConfigError, Result, SkyforgeError};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::spec::StackConfig;

/// Parser for stack documents.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Base path for resolving `.env`.
    base_path: Option<PathBuf>,
}

impl ConfigParser {
    /// Creates a new parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the base path used to locate `.env`.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads a stack document from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<StackConfig> {
        let path = path.as_ref();
        info!("Loading stack document from: {}", path.display());

        if !path.exists() {
            return Err(SkyforgeError::Config(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            SkyforgeError::Config(ConfigError::ParseError {
                message: format!("Failed to read file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        self.parse_yaml(&content, Some(path))
    }

    /// Parses a stack document from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<StackConfig> {
        debug!("Parsing YAML stack document");

        let config: StackConfig = serde_yaml::from_str(content).map_err(|e| {
            SkyforgeError::Config(ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location: source.map(|p| p.display().to_string()),
            })
        })?;

        debug!(
            "Parsed stack {} with {} resources",
            config.project.name,
            config.resources.len()
        );
        Ok(config)
    }

    /// Loads a stack document and applies environment overrides.
    ///
    /// Recognized variables: `SKYFORGE_PROJECT_NAME`,
    /// `SKYFORGE_PROJECT_ENVIRONMENT`, `SKYFORGE_STATE_BUCKET`,
    /// `SKYFORGE_STATE_PREFIX`, `SKYFORGE_PROVIDER_ENDPOINT`,
    /// `SKYFORGE_PARALLELISM`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or an override
    /// has an invalid value.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<StackConfig> {
        let mut config = self.load_file(path)?;
        Self::apply_env_overrides(&mut config)?;
        Ok(config)
    }

    /// Applies environment variable overrides to the document.
    fn apply_env_overrides(config: &mut StackConfig) -> Result<()> {
        if let Ok(name) = std::env::var("SKYFORGE_PROJECT_NAME") {
            debug!("Overriding project.name from environment");
            config.project.name = name;
        }

        if let Ok(env) = std::env::var("SKYFORGE_PROJECT_ENVIRONMENT") {
            debug!("Overriding project.environment from environment");
            config.project.environment = env;
        }

        if let Ok(bucket) = std::env::var("SKYFORGE_STATE_BUCKET") {
            debug!("Overriding state.bucket from environment");
            config.state.bucket = Some(bucket);
        }

        if let Ok(prefix) = std::env::var("SKYFORGE_STATE_PREFIX") {
            debug!("Overriding state.prefix from environment");
            config.state.prefix = Some(prefix);
        }

        if let Ok(endpoint) = std::env::var("SKYFORGE_PROVIDER_ENDPOINT") {
            debug!("Overriding provider.endpoint from environment");
            config.provider.endpoint = Some(endpoint);
        }

        if let Ok(raw) = std::env::var("SKYFORGE_PARALLELISM") {
            debug!("Overriding execution.parallelism from environment");
            config.execution.parallelism = raw.trim().parse().map_err(|_| {
                ConfigError::invalid(
                    "execution.parallelism",
                    format!("SKYFORGE_PARALLELISM must be a number, got '{raw}'"),
                )
            })?;
        }

        Ok(())
    }

    /// Loads the `.env` file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the `.env` file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                SkyforgeError::Config(ConfigError::ParseError {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }

    /// Reads the provider token from the named environment variable.
    #[must_use]
    pub fn provider_token(env_name: &str) -> Option<String> {
        std::env::var(env_name).ok().filter(|t| !t.is_empty())
    }
}

/// Default stack document names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &[
    "skyforge.stack.yaml",
    "skyforge.stack.yml",
    "stack.yaml",
    "stack.yml",
];

/// Finds the stack document in the given directory or its parents.
///
/// # Errors
///
/// Returns an error if no stack document is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                info!("Found stack document: {}", config_path.display());
                return Ok(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(SkyforgeError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::spec::{DeletionPolicy, StateBackend};
    use crate::graph::ReplaceStrategy;

    #[test]
    fn test_parse_minimal_stack() {
        let yaml = r"
project:
  name: test-stack
";
        let config = ConfigParser::new()
            .parse_yaml(yaml, None)
            .expect("minimal stack parses");

        assert_eq!(config.project.name, "test-stack");
        assert_eq!(config.project.environment, "dev");
        assert_eq!(config.state.backend, StateBackend::Local);
        assert!(config.resources.is_empty());
    }

    #[test]
    fn test_parse_full_stack() {
        let yaml = r#"
project:
  name: serverless
  environment: prod
  tags:
    Owner: platform
state:
  backend: s3
  bucket: skyforge-state
  prefix: serverless/prod
provider:
  endpoint: http://localhost:8080
execution:
  parallelism: 4
  retry:
    base_delay_ms: 100
kinds:
  QueueTopic:
    replace_on: [name]
    replace_strategy: create_before_destroy
resources:
  - id: assets
    kind: S3Bucket
    properties:
      bucket_name: assets-prod
      versioned: true
    deletion_policy: retain
  - id: cdn
    kind: CloudFrontDistribution
    properties:
      origin: { ref: assets.domain_name }
      comment: "CDN for ${assets}"
outputs:
  CdnUrl: "https://${cdn.domain_name}"
"#;
        let config = ConfigParser::new()
            .parse_yaml(yaml, None)
            .expect("full stack parses");

        assert_eq!(config.state.backend, StateBackend::S3);
        assert_eq!(config.execution.parallelism, 4);
        assert_eq!(config.execution.retry.base_delay_ms, 100);
        assert_eq!(config.execution.retry.max_attempts, 5);
        assert_eq!(config.resources.len(), 2);
        assert_eq!(config.resources[0].deletion_policy, DeletionPolicy::Retain);
        assert_eq!(
            config.kinds["QueueTopic"].replace_strategy,
            ReplaceStrategy::CreateBeforeDestroy
        );
        assert!(config.outputs.contains_key("CdnUrl"));
    }

    #[test]
    fn test_user_kind_requires_strategy() {
        let yaml = r"
project:
  name: test-stack
kinds:
  Widget:
    replace_on: [name]
";
        let result = ConfigParser::new().parse_yaml(yaml, None);
        assert!(matches!(
            result,
            Err(SkyforgeError::Config(ConfigError::ParseError { .. }))
        ));
    }

    #[test]
    fn test_find_config_file_in_parent() {
        let temp = tempfile::TempDir::new().expect("temp dir");
        let nested = temp.path().join("a").join("b");
        std::fs::create_dir_all(&nested).expect("nested dirs");
        std::fs::write(temp.path().join("skyforge.stack.yaml"), "project:\n  name: x\n")
            .expect("write stack");

        let found = find_config_file(&nested).expect("found in parent");
        assert_eq!(found, temp.path().join("skyforge.stack.yaml"));
    }
}
