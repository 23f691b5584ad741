//! Reconciler for converging the cloud to the declared stack.
//!
//! A run takes the state lock, loads the snapshot, builds the desired
//! graph, diffs, plans and executes, then records the run and releases the
//! lock. The lock is released on every path once it was acquired.

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{ConfigHasher, StackConfig};
use crate::error::{ConfigError, Result};
use crate::graph::{GraphBuilder, Reference, ResourceGraph, SchemaRegistry, reference};
use crate::planner::{
    DiffEngine, ExecutionPlan, ExecutionReport, PlanExecutor, Planner, RunContext, RunOutcome,
    StepStatus,
};
use crate::provider::Provider;
use crate::state::{
    LOCK_RENEW_SECS, RunHistoryEntry, RunOperation, RunSummary, StateSnapshot, StateStore,
};

/// Run coordinator for one stack.
pub struct Reconciler<'a> {
    /// Stack document.
    config: &'a StackConfig,
    /// State store.
    store: &'a dyn StateStore,
    /// Cloud provider, required for apply and destroy.
    provider: Option<&'a dyn Provider>,
    /// Built-in kinds plus the ones the document declares.
    schemas: SchemaRegistry,
    /// Desired-state hasher.
    hasher: ConfigHasher,
}

/// Result of an apply or destroy run.
#[derive(Debug, Serialize)]
pub struct RunResult {
    /// Type of run.
    pub operation: RunOperation,
    /// Plan that was executed.
    pub plan: ExecutionPlan,
    /// What happened to each step.
    pub report: ExecutionReport,
    /// Stack outputs rendered from the final state.
    pub outputs: BTreeMap<String, Value>,
}

impl RunResult {
    /// Overall outcome.
    #[must_use]
    pub fn outcome(&self) -> RunOutcome {
        self.report.outcome()
    }

    /// Returns true if every step succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.report.is_success()
    }
}

impl<'a> Reconciler<'a> {
    /// Creates a reconciler that can plan and read outputs.
    #[must_use]
    pub fn new(config: &'a StackConfig, store: &'a dyn StateStore) -> Self {
        Self {
            config,
            store,
            provider: None,
            schemas: SchemaRegistry::with_overrides(&config.kinds),
            hasher: ConfigHasher::new(),
        }
    }

    /// Sets the provider used by apply and destroy.
    #[must_use]
    pub fn with_provider(mut self, provider: &'a dyn Provider) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Kind schemas in effect for this stack.
    #[must_use]
    pub const fn schemas(&self) -> &SchemaRegistry {
        &self.schemas
    }

    /// Builds and validates the desired graph.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the graph is invalid.
    pub fn build_graph(&self) -> Result<ResourceGraph> {
        Ok(GraphBuilder::new(&self.schemas).build(self.config)?)
    }

    /// Computes the apply plan without taking the lock or calling the
    /// provider.
    ///
    /// # Errors
    ///
    /// Returns an error if the graph is invalid, the plan cannot be
    /// ordered, or state cannot be read.
    pub async fn plan(&self) -> Result<ExecutionPlan> {
        let desired = self.build_graph()?;
        let snapshot = self.store.load().await?;
        self.plan_against(RunOperation::Apply, &desired, &snapshot)
    }

    /// Computes the destroy plan without taking the lock.
    ///
    /// # Errors
    ///
    /// Returns an error if state cannot be read or the plan cannot be
    /// ordered.
    pub async fn plan_destroy(&self) -> Result<ExecutionPlan> {
        let snapshot = self.store.load().await?;
        self.plan_against(RunOperation::Destroy, &ResourceGraph::empty(), &snapshot)
    }

    /// Converges the cloud to the declared stack.
    ///
    /// # Errors
    ///
    /// Returns an error if the graph is invalid, another run holds the
    /// lock, the plan cannot be ordered, or a state write fails. Provider
    /// failures are reported in the result.
    pub async fn apply(&self, ctx: &RunContext) -> Result<RunResult> {
        let desired = self.build_graph()?;
        self.run(RunOperation::Apply, desired, ctx).await
    }

    /// Deletes every recorded resource.
    ///
    /// # Errors
    ///
    /// Same as [`Reconciler::apply`].
    pub async fn destroy(&self, ctx: &RunContext) -> Result<RunResult> {
        self.run(RunOperation::Destroy, ResourceGraph::empty(), ctx)
            .await
    }

    /// Renders the stack outputs from the persisted state.
    ///
    /// # Errors
    ///
    /// Returns an error if state cannot be read.
    pub async fn outputs(&self) -> Result<BTreeMap<String, Value>> {
        let snapshot = self.store.load().await?;
        Ok(self.render_outputs(&snapshot))
    }

    /// Resolves the declared stack outputs against `snapshot`. Outputs
    /// whose references cannot be resolved are left out.
    #[must_use]
    pub fn render_outputs(&self, snapshot: &StateSnapshot) -> BTreeMap<String, Value> {
        let lookup = |r: &Reference| snapshot.lookup(r);
        let mut rendered = BTreeMap::new();
        for (name, expression) in &self.config.outputs {
            match reference::resolve(expression, &lookup) {
                Ok(value) => {
                    rendered.insert(name.clone(), value);
                }
                Err(missing) => debug!("Output {name} unavailable: '{missing}' not in state"),
            }
        }
        rendered
    }

    fn desired_hash(&self, operation: RunOperation) -> String {
        match operation {
            RunOperation::Apply => self.hasher.hash_stack(self.config),
            RunOperation::Destroy => String::new(),
        }
    }

    fn plan_against(
        &self,
        operation: RunOperation,
        desired: &ResourceGraph,
        snapshot: &StateSnapshot,
    ) -> Result<ExecutionPlan> {
        let changes = DiffEngine::new(&self.schemas).compute(desired, snapshot);
        info!(
            "Diff: {} creates, {} updates, {} replaces, {} deletes, {} unchanged",
            changes.creates(),
            changes.updates(),
            changes.replaces(),
            changes.deletes(),
            changes.unchanged.len()
        );
        Ok(Planner::new(&self.schemas).plan(
            &changes,
            desired,
            snapshot,
            &self.desired_hash(operation),
        )?)
    }

    async fn run(
        &self,
        operation: RunOperation,
        mut desired: ResourceGraph,
        ctx: &RunContext,
    ) -> Result<RunResult> {
        info!(
            "Starting {operation} of {}/{} (run {})",
            self.config.project.name, self.config.project.environment, ctx.run_id
        );

        let provider = self.provider.ok_or_else(|| {
            ConfigError::invalid("provider", "a provider is required to change resources")
        })?;
        let lock = self.store.acquire_lock(&ctx.holder).await?;
        let result = tokio::select! {
            result = self.run_locked(operation, provider, &mut desired, ctx) => result,
            never = self.keep_lock(&lock.lock_id) => match never {},
        };
        if let Err(e) = self.store.release_lock(&lock.lock_id).await {
            warn!("Failed to release state lock {}: {e}", lock.lock_id);
        }
        result
    }

    /// Renews the run lock until dropped.
    async fn keep_lock(&self, lock_id: &str) -> Infallible {
        let mut ticker = tokio::time::interval(Duration::from_secs(LOCK_RENEW_SECS));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = self.store.renew_lock(lock_id).await {
                warn!("Failed to renew state lock {lock_id}: {e}");
            }
        }
    }

    /// Writes declared deletion policies into existing records. A policy
    /// change alone needs no provider call, so the diff never sees it.
    async fn record_deletion_policies(
        &self,
        desired: &ResourceGraph,
        snapshot: &mut StateSnapshot,
    ) -> Result<()> {
        let mut changed = false;
        for node in desired.nodes() {
            let Some(record) = snapshot.resources.get_mut(&node.id) else {
                continue;
            };
            if record.deletion_policy == node.deletion_policy {
                continue;
            }
            info!(
                "{}: deletion policy {} -> {}",
                node.id, record.deletion_policy, node.deletion_policy
            );
            record.deletion_policy = node.deletion_policy;
            record.touch();
            self.store.save_node(&node.id, record).await?;
            changed = true;
        }
        if changed {
            self.store.commit().await?;
        }
        Ok(())
    }

    async fn run_locked(
        &self,
        operation: RunOperation,
        provider: &dyn Provider,
        desired: &mut ResourceGraph,
        ctx: &RunContext,
    ) -> Result<RunResult> {
        let mut snapshot = self.store.load().await?;
        self.record_deletion_policies(desired, &mut snapshot).await?;
        let plan = self.plan_against(operation, desired, &snapshot)?;
        let desired_hash = plan.desired_hash.clone();

        if plan.is_empty() {
            info!("No changes required - state is converged");
        }

        let report = PlanExecutor::new(provider, self.store)
            .execute(&plan, desired, &snapshot, ctx)
            .await?;

        if !plan.is_empty() || snapshot.desired_hash != desired_hash {
            let mut entry = RunHistoryEntry::new(ctx.run_id, operation, report.node_ids());
            if !report.is_success() {
                let message = report
                    .first_error()
                    .unwrap_or_else(|| String::from("run cancelled"));
                entry = entry.failed(message);
            }
            self.store
                .record_run(RunSummary {
                    project: self.config.project.name.clone(),
                    environment: self.config.project.environment.clone(),
                    desired_hash: report.is_success().then_some(desired_hash),
                    entry,
                })
                .await?;
            self.store.commit().await?;
        }

        let outputs = match operation {
            RunOperation::Apply => self.render_outputs(&self.store.load().await?),
            RunOperation::Destroy => BTreeMap::new(),
        };

        Ok(RunResult {
            operation,
            plan,
            report,
            outputs,
        })
    }
}

impl fmt::Debug for Reconciler<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reconciler")
            .field("project", &self.config.project.name)
            .field("environment", &self.config.project.environment)
            .field("store", &self.store.backend_type())
            .field("provider", &self.provider.map(|p| p.name()))
            .finish_non_exhaustive()
    }
}

impl fmt::Display for RunResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match self.outcome() {
            RunOutcome::Success => "succeeded",
            RunOutcome::PartialFailure => "partially failed",
            RunOutcome::Cancelled => "was cancelled",
        };
        writeln!(f, "{} {status}:", self.operation)?;
        writeln!(f, "  Succeeded: {}", self.report.succeeded())?;
        writeln!(f, "  Failed: {}", self.report.failed())?;
        writeln!(f, "  Skipped: {}", self.report.skipped())?;

        let errors: Vec<_> = self
            .report
            .results
            .iter()
            .filter(|r| r.status == StepStatus::Failed)
            .collect();
        if !errors.is_empty() {
            writeln!(f, "  Errors:")?;
            for result in errors {
                writeln!(
                    f,
                    "    - {} {}: {}",
                    result.action,
                    result.node_id,
                    result.error.as_deref().unwrap_or("unknown error")
                )?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;
    use crate::error::SkyforgeError;
    use crate::planner::ExecutionOptions;
    use crate::provider::MemoryProvider;
    use crate::state::LocalStateStore;
    use serde_json::json;
    use tempfile::TempDir;

    const STACK: &str = r#"
project:
  name: demo
resources:
  - id: bucket
    kind: S3Bucket
    properties:
      bucket_name: uploads
  - id: cdn
    kind: CloudFrontDistribution
    properties:
      origin: { ref: bucket.arn }
outputs:
  BucketId: { ref: bucket }
  Origin: "origin=${bucket.arn}"
  Missing: { ref: cdn.domain_name }
"#;

    fn config() -> StackConfig {
        ConfigParser::new()
            .parse_yaml(STACK, None)
            .expect("test stack parses")
    }

    #[tokio::test]
    async fn test_apply_records_run_and_renders_outputs() {
        let dir = TempDir::new().expect("temp dir");
        let store = LocalStateStore::with_base_dir(dir.path());
        let provider = MemoryProvider::new();
        let config = config();
        let reconciler = Reconciler::new(&config, &store).with_provider(&provider);

        let result = reconciler
            .apply(&RunContext::new(ExecutionOptions::default()))
            .await
            .expect("apply");
        assert!(result.is_success());
        assert_eq!(result.outputs["BucketId"], json!("s3bucket-0001"));
        assert_eq!(
            result.outputs["Origin"],
            json!("origin=arn:skyforge:s3bucket:s3bucket-0001")
        );
        assert!(!result.outputs.contains_key("Missing"));

        let snapshot = store.load().await.expect("reload");
        assert_eq!(snapshot.history.len(), 1);
        assert_eq!(snapshot.desired_hash, result.plan.desired_hash);
        assert!(!store.is_locked().await.expect("lock state"));

        let replan = reconciler.plan().await.expect("plan");
        assert!(replan.is_empty());
    }

    #[tokio::test]
    async fn test_second_run_fails_while_locked() {
        let dir = TempDir::new().expect("temp dir");
        let store = LocalStateStore::with_base_dir(dir.path());
        let provider = MemoryProvider::new();
        let config = config();
        store.acquire_lock("other-host").await.expect("lock");

        let err = Reconciler::new(&config, &store)
            .with_provider(&provider)
            .apply(&RunContext::default())
            .await
            .expect_err("locked");
        assert!(matches!(err, SkyforgeError::RunInProgress { .. }));
        assert!(provider.calls().is_empty());
        assert!(!store.exists().await.expect("exists"));
    }

    #[tokio::test]
    async fn test_destroy_removes_everything() {
        let dir = TempDir::new().expect("temp dir");
        let store = LocalStateStore::with_base_dir(dir.path());
        let provider = MemoryProvider::new();
        let config = config();
        let reconciler = Reconciler::new(&config, &store).with_provider(&provider);

        reconciler
            .apply(&RunContext::default())
            .await
            .expect("apply");
        let preview = reconciler.plan_destroy().await.expect("destroy plan");
        assert_eq!(preview.len(), 2);

        let result = reconciler
            .destroy(&RunContext::default())
            .await
            .expect("destroy");
        assert!(result.is_success());
        assert!(provider.resources().is_empty());
        assert!(store.load().await.expect("reload").is_empty());
    }
}
