//! Configuration module for the Skyforge engine.
//!
//! This module handles everything about the stack document:
//! - Parsing and deserializing `skyforge.stack.yaml`
//! - Validation of document values
//! - Computing desired-state hashes

mod hash;
mod parser;
mod spec;
mod validator;

pub use hash::ConfigHasher;
pub use parser::{ConfigParser, DEFAULT_CONFIG_FILES, find_config_file};
pub use spec::{
    DeletionPolicy, ExecutionConfig, ProjectConfig, ProviderConfig, ProviderType, ResourceDecl,
    RetryConfig, StackConfig, StateBackend, StateConfig,
};
pub use validator::{ConfigIssue, ConfigValidator, ValidationResult, check_logical_id};
