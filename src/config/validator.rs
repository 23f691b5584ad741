//! Stack document validation.
//!
//! Checks the document-level values before a graph is built. Graph-level
//! rules (duplicate ids, references, cycles) live in the graph builder.

use crate::error::{ConfigError, Result, SkyforgeError, ValidationError};
use tracing::debug;
use validator::Validate;

use super::spec::{DeletionPolicy, ProviderConfig, StackConfig, StateBackend, StateConfig};

/// Maximum length of a logical id.
const MAX_ID_LEN: usize = 128;

/// Validator for stack documents.
#[derive(Debug, Default)]
pub struct ConfigValidator;

/// Validation result containing everything found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// Errors, in document order.
    pub errors: Vec<ConfigIssue>,
    /// Non-fatal issues.
    pub warnings: Vec<String>,
}

/// A single document issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigIssue {
    /// Field path that failed validation.
    pub field: String,
    /// Description of the problem.
    pub message: String,
}

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates a stack document.
    ///
    /// Malformed logical ids are reported as [`ValidationError::InvalidId`];
    /// anything else as [`ConfigError::InvalidValue`] for the first issue.
    ///
    /// # Errors
    ///
    /// Returns an error if validation fails.
    pub fn validate(&self, config: &StackConfig) -> Result<ValidationResult> {
        for decl in &config.resources {
            if let Err(reason) = check_logical_id(&decl.id) {
                return Err(SkyforgeError::Validation(ValidationError::InvalidId {
                    id: decl.id.clone(),
                    reason,
                }));
            }
        }

        let mut result = ValidationResult::default();

        Self::validate_project(config, &mut result);
        Self::validate_state(&config.state, &mut result);
        Self::validate_provider(&config.provider, &mut result);
        Self::validate_execution(config, &mut result);
        Self::validate_resources(config, &mut result);

        if let Some(first) = result.errors.first() {
            return Err(SkyforgeError::Config(ConfigError::invalid(
                first.field.clone(),
                first.message.clone(),
            )));
        }

        debug!(
            "Stack document validation passed with {} warnings",
            result.warnings.len()
        );
        Ok(result)
    }

    fn validate_project(config: &StackConfig, result: &mut ValidationResult) {
        let project = &config.project;
        if project.name.is_empty() {
            result.push_error("project.name", "Project name cannot be empty");
        } else if !is_valid_name(&project.name) {
            result.push_error(
                "project.name",
                format!(
                    "Project name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    project.name
                ),
            );
        }

        if project.environment.is_empty() {
            result.push_error("project.environment", "Environment cannot be empty");
        }

        for key in project.tags.keys() {
            if key.trim().is_empty() {
                result.push_error("project.tags", "Tag keys cannot be empty");
            }
        }
    }

    fn validate_state(state: &StateConfig, result: &mut ValidationResult) {
        if state.backend == StateBackend::S3
            && state.bucket.as_ref().is_none_or(String::is_empty)
        {
            result.push_error(
                "state.bucket",
                "S3 bucket name is required when using S3 backend",
            );
        }
    }

    fn validate_provider(provider: &ProviderConfig, result: &mut ValidationResult) {
        if let Some(endpoint) = &provider.endpoint {
            if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
                result.push_error(
                    "provider.endpoint",
                    format!("Endpoint '{endpoint}' must start with http:// or https://"),
                );
            }
        }

        if provider.token_env.is_empty() {
            result.push_error("provider.token_env", "Token variable name cannot be empty");
        }

        if provider.timeout_secs == 0 {
            result.push_error("provider.timeout_secs", "Timeout must be at least 1 second");
        }
    }

    fn validate_execution(config: &StackConfig, result: &mut ValidationResult) {
        if let Err(errors) = config.execution.validate() {
            result.push_error("execution", errors.to_string());
        }

        let retry = &config.execution.retry;
        if retry.max_delay_ms < retry.base_delay_ms {
            result.warnings.push(format!(
                "execution.retry.max_delay_ms ({}) is below base_delay_ms ({}); every delay will be capped",
                retry.max_delay_ms, retry.base_delay_ms
            ));
        }
    }

    fn validate_resources(config: &StackConfig, result: &mut ValidationResult) {
        if config.resources.is_empty() {
            result
                .warnings
                .push(String::from("No resources defined in stack document"));
            return;
        }

        for (i, decl) in config.resources.iter().enumerate() {
            if decl.kind.trim().is_empty() {
                result.push_error(format!("resources[{i}].kind"), "Kind cannot be empty");
            }
            if decl.properties.contains_key("tags") && !decl.tags.is_empty() {
                result.push_error(
                    format!("resources[{i}].properties.tags"),
                    "Declare tags either as a property or in the tags section, not both",
                );
            }
            if decl.deletion_policy == DeletionPolicy::Retain {
                result.warnings.push(format!(
                    "Resource '{}' is retained: it will be forgotten, not deleted, when removed",
                    decl.id
                ));
            }
        }
    }
}

impl ValidationResult {
    fn push_error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ConfigIssue {
            field: field.into(),
            message: message.into(),
        });
    }
}

/// Checks a logical id: a leading ASCII letter, then letters, digits,
/// hyphens or underscores. Dots are reserved for reference paths.
///
/// # Errors
///
/// Returns the reason the id was rejected.
pub fn check_logical_id(id: &str) -> std::result::Result<(), String> {
    if id.is_empty() {
        return Err(String::from("id cannot be empty"));
    }
    if id.len() > MAX_ID_LEN {
        return Err(format!("id is longer than {MAX_ID_LEN} characters"));
    }
    if !id.starts_with(|c: char| c.is_ascii_alphabetic()) {
        return Err(String::from("id must start with a letter"));
    }
    if let Some(bad) = id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
    {
        return Err(format!("character '{bad}' is not allowed"));
    }
    Ok(())
}

/// Checks if a project name is valid (lowercase alphanumeric with hyphens).
fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.starts_with('-')
        && !name.ends_with('-')
}
