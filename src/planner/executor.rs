//! Plan executor for applying execution plans.
//!
//! A single coordinator owns the state store and the in-memory records.
//! Provider calls run on a bounded set of futures; a step is dispatched
//! only once every step it depends on has succeeded. References are
//! resolved right before dispatch so a step always sees the outputs of
//! the steps it waited for.
//!
//! Every completed step is written to the store and committed before the
//! next completion is handled. A failed state write stops the run at once.

use futures::future::{BoxFuture, FutureExt};
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::DeletionPolicy;
use crate::error::{ProviderError, Result, SkyforgeError};
use crate::graph::{NodeStatus, Outputs, Properties, Reference, ResourceGraph, reference};
use crate::provider::{CreatedResource, Provider};
use crate::state::{DeposedInstance, NodeRecord, StateSnapshot, StateStore};

use super::context::{RetryPolicy, RunContext};
use super::plan::{ExecutionPlan, PlannedStep, StepAction};

/// Executor for execution plans.
pub struct PlanExecutor<'a> {
    provider: &'a dyn Provider,
    store: &'a dyn StateStore,
}

/// Final status of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// The provider call succeeded and the result was committed.
    Succeeded,
    /// The step failed.
    Failed,
    /// The step never ran.
    Skipped,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        write!(f, "{s}")
    }
}

/// Result of executing a single step.
#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    /// Step index in the plan.
    pub index: usize,
    /// Step action.
    pub action: StepAction,
    /// Logical id.
    pub node_id: String,
    /// Final status.
    pub status: StepStatus,
    /// Physical id the step created, updated or removed.
    pub physical_id: Option<String>,
    /// Provider calls made, including retries.
    pub attempts: u32,
    /// Failure detail or skip reason.
    pub error: Option<String>,
}

/// Overall outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every step succeeded.
    Success,
    /// At least one step failed or was skipped.
    PartialFailure,
    /// The run was interrupted before every step ran.
    Cancelled,
}

/// Result of executing a whole plan.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    /// Run identifier.
    pub run_id: Uuid,
    /// One result per step, in plan order.
    pub results: Vec<StepResult>,
    /// Whether cancellation was requested during the run.
    pub cancelled: bool,
    /// Final status of every desired node.
    pub node_status: BTreeMap<String, NodeStatus>,
}

impl ExecutionReport {
    fn count(&self, status: StepStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }

    /// Number of successful steps.
    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.count(StepStatus::Succeeded)
    }

    /// Number of failed steps.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.count(StepStatus::Failed)
    }

    /// Number of steps that never ran.
    #[must_use]
    pub fn skipped(&self) -> usize {
        self.count(StepStatus::Skipped)
    }

    /// Overall outcome.
    #[must_use]
    pub fn outcome(&self) -> RunOutcome {
        if self.failed() > 0 {
            RunOutcome::PartialFailure
        } else if self.skipped() > 0 && self.cancelled {
            RunOutcome::Cancelled
        } else if self.skipped() > 0 {
            RunOutcome::PartialFailure
        } else {
            RunOutcome::Success
        }
    }

    /// Returns true if every step succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.outcome() == RunOutcome::Success
    }

    /// First failure message, prefixed with the node id.
    #[must_use]
    pub fn first_error(&self) -> Option<String> {
        self.results
            .iter()
            .find(|r| r.status == StepStatus::Failed)
            .map(|r| {
                format!(
                    "{} {}: {}",
                    r.action,
                    r.node_id,
                    r.error.as_deref().unwrap_or("unknown error")
                )
            })
    }

    /// Logical ids touched by the run, sorted.
    #[must_use]
    pub fn node_ids(&self) -> Vec<String> {
        self.results
            .iter()
            .map(|r| r.node_id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

/// A physical instance to delete.
#[derive(Debug, Clone)]
struct Target {
    kind: String,
    physical_id: String,
}

impl From<&DeposedInstance> for Target {
    fn from(instance: &DeposedInstance) -> Self {
        Self {
            kind: instance.kind.clone(),
            physical_id: instance.physical_id.clone(),
        }
    }
}

/// A fully resolved provider request.
#[derive(Debug)]
enum Request {
    Create {
        kind: String,
        properties: Properties,
    },
    Update {
        kind: String,
        physical_id: String,
        properties: Properties,
    },
    Delete {
        targets: Vec<Target>,
    },
    /// Drop the record without calling the provider.
    Forget,
}

#[derive(Debug)]
enum Outcome {
    Created(CreatedResource),
    Updated(Outputs),
    Removed,
}

#[derive(Debug)]
struct Completion {
    index: usize,
    attempts: u32,
    result: std::result::Result<Outcome, ProviderError>,
}

impl<'a> PlanExecutor<'a> {
    /// Creates a new plan executor.
    #[must_use]
    pub const fn new(provider: &'a dyn Provider, store: &'a dyn StateStore) -> Self {
        Self { provider, store }
    }

    /// Executes `plan`, updating node status and outputs in `desired`.
    ///
    /// `snapshot` must be the snapshot the plan was computed from, loaded
    /// through the same store.
    ///
    /// # Errors
    ///
    /// Returns an error only if a state write fails. Provider failures are
    /// reported in the [`ExecutionReport`].
    pub async fn execute(
        &self,
        plan: &ExecutionPlan,
        desired: &mut ResourceGraph,
        snapshot: &StateSnapshot,
        ctx: &RunContext,
    ) -> Result<ExecutionReport> {
        let options = ctx.options;
        let parallelism = options.parallelism.max(1);
        info!(
            "Executing plan with {} steps (parallelism {parallelism})",
            plan.len()
        );

        let mut records = snapshot.resources.clone();
        mark_initial_status(plan, desired, &records);

        let steps = &plan.steps;
        let mut waiting: Vec<usize> = steps.iter().map(|s| s.dependencies.len()).collect();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); steps.len()];
        for (index, step) in steps.iter().enumerate() {
            for &dependency in &step.dependencies {
                dependents[dependency].push(index);
            }
        }
        let mut ready: BTreeSet<usize> = (0..steps.len()).filter(|&i| waiting[i] == 0).collect();
        let mut results: Vec<Option<StepResult>> = vec![None; steps.len()];
        let mut in_flight: FuturesUnordered<BoxFuture<'a, Completion>> = FuturesUnordered::new();
        let mut halted = false;
        let mut cancelled = false;

        loop {
            if !cancelled && ctx.is_cancelled() {
                warn!(
                    "Run cancelled, waiting for {} in-flight step(s)",
                    in_flight.len()
                );
                cancelled = true;
            }

            while !halted && !cancelled && in_flight.len() < parallelism {
                let Some(index) = ready.pop_first() else {
                    break;
                };
                let step = &steps[index];
                let request = prepare(step, desired, &records);
                if step_owns_node(step.action) {
                    desired.set_status(&step.node_id, NodeStatus::Applying);
                }
                info!("[{index}] {}", step.description());
                in_flight.push(self.dispatch(index, request, options.retry));
            }

            let Some(done) = in_flight.next().await else {
                break;
            };
            let step = &steps[done.index];

            match done.result {
                Ok(outcome) => {
                    let physical_id = match self.record(step, outcome, desired, &mut records).await
                    {
                        Ok(physical_id) => physical_id,
                        Err(e) => {
                            error!("Failed to record {}: {e}", step.description());
                            drain(in_flight, steps).await;
                            return Err(e);
                        }
                    };
                    results[done.index] = Some(StepResult {
                        index: done.index,
                        action: step.action,
                        node_id: step.node_id.clone(),
                        status: StepStatus::Succeeded,
                        physical_id,
                        attempts: done.attempts,
                        error: None,
                    });
                    for &next in &dependents[done.index] {
                        waiting[next] -= 1;
                        if waiting[next] == 0 {
                            ready.insert(next);
                        }
                    }
                }
                Err(err) => {
                    error!(
                        "[{}] {} failed after {} attempt(s): {err}",
                        done.index,
                        step.description(),
                        done.attempts
                    );
                    if step_owns_node(step.action) {
                        desired.set_status(&step.node_id, NodeStatus::Failed);
                    }
                    results[done.index] = Some(StepResult {
                        index: done.index,
                        action: step.action,
                        node_id: step.node_id.clone(),
                        status: StepStatus::Failed,
                        physical_id: None,
                        attempts: done.attempts,
                        error: Some(err.to_string()),
                    });
                    if !options.continue_on_error {
                        halted = true;
                    }
                }
            }
        }

        // Destroyed for replacement but never recreated: no instance exists.
        for step in steps
            .iter()
            .filter(|s| s.action == StepAction::DestroyForReplace)
        {
            if desired
                .get(&step.node_id)
                .is_some_and(|n| n.status == NodeStatus::Applying)
            {
                desired.set_status(&step.node_id, NodeStatus::Failed);
            }
        }

        let results = finish_results(steps, results, cancelled);
        let report = ExecutionReport {
            run_id: ctx.run_id,
            results,
            cancelled,
            node_status: desired
                .nodes()
                .map(|n| (n.id.clone(), n.status))
                .collect(),
        };

        info!(
            "Execution finished: {} succeeded, {} failed, {} skipped",
            report.succeeded(),
            report.failed(),
            report.skipped()
        );
        Ok(report)
    }

    fn dispatch(
        &self,
        index: usize,
        request: std::result::Result<Request, String>,
        retry: RetryPolicy,
    ) -> BoxFuture<'a, Completion> {
        let provider = self.provider;
        async move {
            let (attempts, result) = match request {
                Ok(request) => perform(provider, request, retry).await,
                Err(message) => (0, Err(ProviderError::fatal(message))),
            };
            Completion {
                index,
                attempts,
                result,
            }
        }
        .boxed()
    }

    /// Applies a successful outcome to the records and commits it.
    async fn record(
        &self,
        step: &PlannedStep,
        outcome: Outcome,
        desired: &mut ResourceGraph,
        records: &mut BTreeMap<String, NodeRecord>,
    ) -> Result<Option<String>> {
        let id = step.node_id.as_str();
        let undeclared = || SkyforgeError::internal(format!("'{id}' is not declared"));

        match (step.action, outcome) {
            (StepAction::Create, Outcome::Created(created)) => {
                let node = desired.get_mut(id).ok_or_else(undeclared)?;
                let mut record = NodeRecord::new(
                    &node.kind,
                    node.properties.clone(),
                    &created.physical_id,
                    created.outputs.clone(),
                );
                record.deletion_policy = node.deletion_policy;
                if let Some(previous) = records.get(id) {
                    record.deposed.clone_from(&previous.deposed);
                    record.deposed.push(DeposedInstance {
                        physical_id: previous.physical_id.clone(),
                        kind: previous.kind.clone(),
                    });
                }
                self.persist(id, &record).await?;
                info!("Created {id} ({})", created.physical_id);

                node.outputs = created.outputs;
                node.status = NodeStatus::Applied;
                records.insert(id.to_string(), record);
                Ok(Some(created.physical_id))
            }
            (StepAction::Update, Outcome::Updated(outputs)) => {
                let node = desired.get_mut(id).ok_or_else(undeclared)?;
                let mut record = records.get(id).cloned().ok_or_else(|| {
                    SkyforgeError::internal(format!("no recorded instance of '{id}'"))
                })?;
                record.properties = node.properties.clone();
                record.outputs = outputs.clone();
                record.deletion_policy = node.deletion_policy;
                record.touch();
                self.persist(id, &record).await?;
                info!("Updated {id} ({})", record.physical_id);

                node.outputs = outputs;
                node.status = NodeStatus::Applied;
                let physical_id = record.physical_id.clone();
                records.insert(id.to_string(), record);
                Ok(Some(physical_id))
            }
            (StepAction::Delete | StepAction::DestroyForReplace, Outcome::Removed) => {
                self.store.remove_node(id).await?;
                self.store.commit().await?;
                let removed = records.remove(id).map(|r| r.physical_id);
                info!("Removed {id}");
                Ok(removed)
            }
            (StepAction::CleanupDeposed, Outcome::Removed) => {
                let Some(record) = records.get_mut(id) else {
                    return Ok(None);
                };
                record.deposed.clear();
                record.touch();
                let record = record.clone();
                self.persist(id, &record).await?;
                debug!("Cleared replaced instances of {id}");
                Ok(None)
            }
            (action, _) => Err(SkyforgeError::internal(format!(
                "unexpected provider result for {action} {id}"
            ))),
        }
    }

    async fn persist(&self, id: &str, record: &NodeRecord) -> Result<()> {
        self.store.save_node(id, record).await?;
        self.store.commit().await
    }
}

impl fmt::Debug for PlanExecutor<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlanExecutor")
            .field("provider", &self.provider.name())
            .field("store", &self.store.backend_type())
            .finish()
    }
}

/// Steps whose outcome decides the status of a declared node.
const fn step_owns_node(action: StepAction) -> bool {
    matches!(
        action,
        StepAction::Create | StepAction::Update | StepAction::DestroyForReplace
    )
}

/// Nodes with work to do become Planned; the rest are already Applied.
fn mark_initial_status(
    plan: &ExecutionPlan,
    desired: &mut ResourceGraph,
    records: &BTreeMap<String, NodeRecord>,
) {
    let planned: HashSet<&str> = plan
        .steps
        .iter()
        .filter(|s| step_owns_node(s.action))
        .map(|s| s.node_id.as_str())
        .collect();
    let ids: Vec<String> = desired.nodes().map(|n| n.id.clone()).collect();

    for id in ids {
        let Some(node) = desired.get_mut(&id) else {
            continue;
        };
        if planned.contains(id.as_str()) {
            node.status = NodeStatus::Planned;
        } else {
            node.status = NodeStatus::Applied;
            if let Some(record) = records.get(&id) {
                node.outputs.clone_from(&record.outputs);
            }
        }
    }
}

/// Builds the provider request for a step against the current records.
fn prepare(
    step: &PlannedStep,
    desired: &ResourceGraph,
    records: &BTreeMap<String, NodeRecord>,
) -> std::result::Result<Request, String> {
    let id = step.node_id.as_str();
    let lookup = |r: &Reference| {
        records
            .get(&r.target)
            .and_then(|record| record.output(r.output.as_deref()))
    };
    let unresolved = |r: Reference| format!("unresolved reference '{r}'");

    match step.action {
        StepAction::Create => {
            let node = desired
                .get(id)
                .ok_or_else(|| format!("'{id}' is not declared"))?;
            let properties =
                reference::resolve_properties(&node.properties, &lookup).map_err(unresolved)?;
            Ok(Request::Create {
                kind: node.kind.clone(),
                properties,
            })
        }
        StepAction::Update => {
            let node = desired
                .get(id)
                .ok_or_else(|| format!("'{id}' is not declared"))?;
            let record = records
                .get(id)
                .ok_or_else(|| format!("no recorded instance of '{id}'"))?;
            let properties =
                reference::resolve_properties(&node.properties, &lookup).map_err(unresolved)?;
            Ok(Request::Update {
                kind: node.kind.clone(),
                physical_id: record.physical_id.clone(),
                properties,
            })
        }
        StepAction::Delete | StepAction::DestroyForReplace | StepAction::CleanupDeposed => {
            let Some(record) = records.get(id) else {
                return Ok(Request::Forget);
            };
            if record.deletion_policy == DeletionPolicy::Retain {
                warn!(
                    "{id} has deletion policy retain, forgetting {} without deleting it",
                    record.physical_id
                );
                return Ok(Request::Forget);
            }
            let mut targets = Vec::with_capacity(record.deposed.len() + 1);
            if step.action != StepAction::CleanupDeposed {
                targets.push(Target {
                    kind: record.kind.clone(),
                    physical_id: record.physical_id.clone(),
                });
            }
            targets.extend(record.deposed.iter().map(Target::from));
            Ok(Request::Delete { targets })
        }
    }
}

/// Runs a request against the provider, retrying transient failures.
async fn perform(
    provider: &dyn Provider,
    request: Request,
    retry: RetryPolicy,
) -> (u32, std::result::Result<Outcome, ProviderError>) {
    match request {
        Request::Create { kind, properties } => {
            let (attempts, result) =
                with_retry(retry, || provider.create_resource(&kind, &properties)).await;
            (attempts, result.map(Outcome::Created))
        }
        Request::Update {
            kind,
            physical_id,
            properties,
        } => {
            let (attempts, result) = with_retry(retry, || {
                provider.update_resource(&kind, &physical_id, &properties)
            })
            .await;
            (attempts, result.map(Outcome::Updated))
        }
        Request::Delete { targets } => {
            let mut attempts = 0;
            for target in &targets {
                let (made, result) = with_retry(retry, || {
                    provider.delete_resource(&target.kind, &target.physical_id)
                })
                .await;
                attempts += made;
                match result {
                    Ok(()) => {}
                    Err(ProviderError::NotFound { .. }) => {
                        debug!("{} was already deleted", target.physical_id);
                    }
                    Err(e) => return (attempts, Err(e)),
                }
            }
            (attempts, Ok(Outcome::Removed))
        }
        Request::Forget => (0, Ok(Outcome::Removed)),
    }
}

async fn with_retry<T, F, Fut>(
    policy: RetryPolicy,
    mut call: F,
) -> (u32, std::result::Result<T, ProviderError>)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, ProviderError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match call().await {
            Err(err) if err.is_retryable() && attempt < policy.max_attempts => {
                let hint = match &err {
                    ProviderError::Retryable {
                        retry_after_secs: Some(secs),
                        ..
                    } => Some(Duration::from_secs(*secs)),
                    _ => None,
                };
                let delay = policy.delay_for(attempt, hint);
                warn!(
                    "{err} (attempt {attempt}/{}), retrying in {delay:?}",
                    policy.max_attempts
                );
                tokio::time::sleep(delay).await;
            }
            result => return (attempt, result),
        }
    }
}

/// Waits for in-flight steps after a state failure and reports what they
/// changed, since none of it can be recorded.
async fn drain(mut in_flight: FuturesUnordered<BoxFuture<'_, Completion>>, steps: &[PlannedStep]) {
    while let Some(done) = in_flight.next().await {
        let step = &steps[done.index];
        match done.result {
            Ok(Outcome::Created(created)) => error!(
                "{} created {} but it is not recorded in state",
                step.node_id, created.physical_id
            ),
            Ok(_) => error!("{} finished but is not recorded in state", step.description()),
            Err(_) => {}
        }
    }
}

/// Fills in results for steps that never ran.
fn finish_results(
    steps: &[PlannedStep],
    mut results: Vec<Option<StepResult>>,
    cancelled: bool,
) -> Vec<StepResult> {
    for (index, step) in steps.iter().enumerate() {
        if results[index].is_some() {
            continue;
        }
        let blocked = step.dependencies.iter().any(|&d| {
            results[d]
                .as_ref()
                .is_none_or(|r| r.status != StepStatus::Succeeded)
        });
        let reason = if blocked {
            "a dependency did not complete"
        } else if cancelled {
            "run cancelled"
        } else {
            "run halted after a failure"
        };
        results[index] = Some(StepResult {
            index,
            action: step.action,
            node_id: step.node_id.clone(),
            status: StepStatus::Skipped,
            physical_id: None,
            attempts: 0,
            error: Some(String::from(reason)),
        });
    }
    results.into_iter().flatten().collect()
}
