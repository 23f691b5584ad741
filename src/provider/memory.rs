//! In-memory provider.
//!
//! Keeps resources in a map and hands out sequential physical ids. Used to
//! embed the engine without a cloud and to script failures in tests.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

use crate::error::ProviderError;
use crate::graph::{Outputs, Properties};

use super::{CreatedResource, Provider};

/// Operation recorded by the memory provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallKind {
    /// `create_resource`
    Create,
    /// `update_resource`
    Update,
    /// `delete_resource`
    Delete,
}

/// One observed call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    /// Operation.
    pub op: CallKind,
    /// Kind tag.
    pub kind: String,
    /// Physical id, for update and delete.
    pub physical_id: Option<String>,
}

/// A resource held by the memory provider.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryResource {
    /// Kind tag.
    pub kind: String,
    /// Properties as last written.
    pub properties: Properties,
    /// Outputs reported for the resource.
    pub outputs: Outputs,
}

#[derive(Debug)]
struct InjectedFailure {
    op: CallKind,
    kind: String,
    error: ProviderError,
    remaining: u32,
}

#[derive(Debug, Default)]
struct MemoryState {
    resources: BTreeMap<String, MemoryResource>,
    next_id: u64,
    failures: Vec<InjectedFailure>,
    calls: Vec<RecordedCall>,
}

/// Provider backed by an in-process map.
#[derive(Debug, Default)]
pub struct MemoryProvider {
    state: Mutex<MemoryState>,
    latency: Option<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MemoryProvider {
    /// Creates an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every call by `latency`.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Makes the next `times` calls of `op` on `kind` fail with `error`.
    pub fn fail_next(&self, op: CallKind, kind: &str, error: ProviderError, times: u32) {
        if let Ok(mut state) = self.state.lock() {
            state.failures.push(InjectedFailure {
                op,
                kind: kind.to_string(),
                error,
                remaining: times,
            });
        }
    }

    /// Every call made so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state
            .lock()
            .map(|s| s.calls.clone())
            .unwrap_or_default()
    }

    /// Number of calls of `op` made so far.
    #[must_use]
    pub fn call_count(&self, op: CallKind) -> usize {
        self.calls().iter().filter(|c| c.op == op).count()
    }

    /// Resources currently held, keyed by physical id.
    #[must_use]
    pub fn resources(&self) -> BTreeMap<String, MemoryResource> {
        self.state
            .lock()
            .map(|s| s.resources.clone())
            .unwrap_or_default()
    }

    /// Highest number of calls observed in flight at once.
    #[must_use]
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, ProviderError> {
        self.state
            .lock()
            .map_err(|_| ProviderError::fatal("memory provider state poisoned"))
    }

    /// Simulates network time and tracks concurrency.
    async fn enter(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn leave(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    /// Records the call and returns an injected failure, if one is armed.
    fn record(
        state: &mut MemoryState,
        op: CallKind,
        kind: &str,
        physical_id: Option<&str>,
    ) -> Result<(), ProviderError> {
        state.calls.push(RecordedCall {
            op,
            kind: kind.to_string(),
            physical_id: physical_id.map(str::to_string),
        });

        if let Some(failure) = state
            .failures
            .iter_mut()
            .find(|f| f.op == op && f.kind == kind && f.remaining > 0)
        {
            failure.remaining -= 1;
            return Err(failure.error.clone());
        }
        Ok(())
    }

    fn outputs_for(kind: &str, physical_id: &str, properties: &Properties) -> Outputs {
        let mut outputs = Outputs::new();
        outputs.insert(
            String::from("arn"),
            Value::String(format!("arn:skyforge:{}:{physical_id}", kind.to_lowercase())),
        );
        if let Some(name) = properties
            .iter()
            .find(|(key, value)| key.ends_with("_name") && value.is_string())
            .map(|(_, value)| value.clone())
        {
            outputs.insert(String::from("name"), name);
        }
        outputs
    }

    fn create(&self, kind: &str, properties: &Properties) -> Result<CreatedResource, ProviderError> {
        let mut state = self.lock()?;
        Self::record(&mut state, CallKind::Create, kind, None)?;

        state.next_id += 1;
        let physical_id = format!("{}-{:04}", kind.to_lowercase(), state.next_id);
        let outputs = Self::outputs_for(kind, &physical_id, properties);
        state.resources.insert(
            physical_id.clone(),
            MemoryResource {
                kind: kind.to_string(),
                properties: properties.clone(),
                outputs: outputs.clone(),
            },
        );
        debug!("memory provider created {physical_id}");

        Ok(CreatedResource {
            physical_id,
            outputs,
        })
    }

    fn update(
        &self,
        kind: &str,
        physical_id: &str,
        properties: &Properties,
    ) -> Result<Outputs, ProviderError> {
        let mut state = self.lock()?;
        Self::record(&mut state, CallKind::Update, kind, Some(physical_id))?;

        let outputs = Self::outputs_for(kind, physical_id, properties);
        let resource =
            state
                .resources
                .get_mut(physical_id)
                .ok_or_else(|| ProviderError::NotFound {
                    physical_id: physical_id.to_string(),
                })?;
        resource.properties = properties.clone();
        resource.outputs = outputs.clone();
        Ok(outputs)
    }

    fn delete(&self, kind: &str, physical_id: &str) -> Result<(), ProviderError> {
        let mut state = self.lock()?;
        Self::record(&mut state, CallKind::Delete, kind, Some(physical_id))?;

        state
            .resources
            .remove(physical_id)
            .map(drop)
            .ok_or_else(|| ProviderError::NotFound {
                physical_id: physical_id.to_string(),
            })
    }
}

#[async_trait]
impl Provider for MemoryProvider {
    async fn create_resource(
        &self,
        kind: &str,
        properties: &Properties,
    ) -> Result<CreatedResource, ProviderError> {
        self.enter().await;
        let result = self.create(kind, properties);
        self.leave();
        result
    }

    async fn update_resource(
        &self,
        kind: &str,
        physical_id: &str,
        properties: &Properties,
    ) -> Result<Outputs, ProviderError> {
        self.enter().await;
        let result = self.update(kind, physical_id, properties);
        self.leave();
        result
    }

    async fn delete_resource(&self, kind: &str, physical_id: &str) -> Result<(), ProviderError> {
        self.enter().await;
        let result = self.delete(kind, physical_id);
        self.leave();
        result
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn props() -> Properties {
        let mut props = Properties::new();
        props.insert("table_name".into(), json!("items"));
        props
    }

    #[tokio::test]
    async fn test_create_update_delete() {
        let provider = MemoryProvider::new();
        let created = provider
            .create_resource("DynamoTable", &props())
            .await
            .expect("create");
        assert_eq!(created.physical_id, "dynamotable-0001");
        assert_eq!(created.outputs["name"], json!("items"));

        provider
            .update_resource("DynamoTable", &created.physical_id, &props())
            .await
            .expect("update");
        provider
            .delete_resource("DynamoTable", &created.physical_id)
            .await
            .expect("delete");
        assert!(provider.resources().is_empty());
        assert_eq!(provider.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_missing_resource_is_not_found() {
        let provider = MemoryProvider::new();
        let err = provider
            .delete_resource("S3Bucket", "nope")
            .await
            .expect_err("missing");
        assert!(matches!(err, ProviderError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_injected_failures_run_out() {
        let provider = MemoryProvider::new();
        provider.fail_next(
            CallKind::Create,
            "S3Bucket",
            ProviderError::retryable("throttled"),
            2,
        );

        for _ in 0..2 {
            let err = provider
                .create_resource("S3Bucket", &Properties::new())
                .await
                .expect_err("injected");
            assert!(err.is_retryable());
        }
        provider
            .create_resource("S3Bucket", &Properties::new())
            .await
            .expect("third call succeeds");
        assert_eq!(provider.call_count(CallKind::Create), 3);
    }
}
