//! Cloud provider abstraction.
//!
//! The engine never talks to a cloud API directly. Every create, update
//! and delete goes through a [`Provider`], which classifies its failures
//! as retryable, fatal or not-found. Retrying is the executor's job.

mod http;
mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;
use crate::graph::{Outputs, Properties};

pub use http::HttpProvider;
pub use memory::{CallKind, MemoryProvider, MemoryResource, RecordedCall};

/// Result of a successful create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedResource {
    /// Provider-assigned identifier.
    pub physical_id: String,
    /// Provider-reported attributes.
    #[serde(default)]
    pub outputs: Outputs,
}

/// Operations a cloud provider must support.
///
/// Properties passed in are fully resolved: they never contain references.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Provider: Send + Sync {
    /// Creates a resource.
    async fn create_resource(
        &self,
        kind: &str,
        properties: &Properties,
    ) -> Result<CreatedResource, ProviderError>;

    /// Updates a resource in place and returns its new outputs.
    async fn update_resource(
        &self,
        kind: &str,
        physical_id: &str,
        properties: &Properties,
    ) -> Result<Outputs, ProviderError>;

    /// Deletes a resource.
    async fn delete_resource(&self, kind: &str, physical_id: &str) -> Result<(), ProviderError>;

    /// Short name for logs.
    fn name(&self) -> &'static str;
}
