//! Plan executor.
//!
//! Every action runs in its own task. A task waits for the actions it depends
//! on, takes a permit from the shared semaphore, calls the provider and writes
//! the result to the state session before signalling its own completion.
//! Failures propagate as skips to dependents; independent branches carry on.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::ExecutionConfig;
use crate::error::{ExecutionError, ProviderError, Result, TerraceError};
use crate::model::{Resource, ResourceId, ResourceSet};
use crate::provider::{ProviderAdapter, ResolvedResource};
use crate::state::{EntryStatus, RunOperation, RunRecord, StateEntry, StateSession};

use super::plan::{ActionKind, Plan, PlannedAction, ReplacePhase};

/// Final status of one action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    /// The action completed and its state entry was written.
    Succeeded,
    /// The provider call failed.
    Failed,
    /// Not attempted because a dependency did not succeed.
    Skipped,
    /// Abandoned because the run was cancelled.
    Cancelled,
}

impl fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Result of one action.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionOutcome {
    /// Position of the action in the plan.
    pub index: usize,
    /// Resource the action applied to.
    pub resource: ResourceId,
    /// What was attempted.
    pub kind: ActionKind,
    /// Final status.
    pub status: ActionStatus,
    /// Error or reason for a non-successful status.
    pub error: Option<String>,
    /// Time spent executing, excluding the wait for dependencies.
    pub duration_ms: u64,
    /// Provider identifier after the action.
    pub provider_id: Option<String>,
    /// Provider calls made, including retries.
    pub attempts: u32,
}

/// Aggregate result of executing a plan.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    /// One outcome per planned action, in plan order.
    pub outcomes: Vec<ActionOutcome>,
    /// When execution started.
    pub started_at: DateTime<Utc>,
    /// When execution finished.
    pub finished_at: DateTime<Utc>,
    /// Why the run was cancelled, if it was.
    pub cancelled_reason: Option<String>,
    /// Set when a state write failed and the run stopped.
    pub aborted: Option<String>,
}

impl ExecutionReport {
    fn count(&self, status: ActionStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }

    /// Number of succeeded actions.
    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.count(ActionStatus::Succeeded)
    }

    /// Number of failed actions.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.count(ActionStatus::Failed)
    }

    /// Number of skipped actions.
    #[must_use]
    pub fn skipped(&self) -> usize {
        self.count(ActionStatus::Skipped)
    }

    /// Number of cancelled actions.
    #[must_use]
    pub fn cancelled(&self) -> usize {
        self.count(ActionStatus::Cancelled)
    }

    /// Returns true if every action succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.aborted.is_none()
            && self
                .outcomes
                .iter()
                .all(|o| o.status == ActionStatus::Succeeded)
    }

    /// Resources whose last action did not succeed, with the reason.
    #[must_use]
    pub fn unavailable_resources(&self) -> Vec<(ResourceId, String)> {
        self.outcomes
            .iter()
            .filter(|o| o.status != ActionStatus::Succeeded)
            .map(|o| {
                let reason = match &o.error {
                    Some(error) => format!("{}: {error}", o.status),
                    None => o.status.to_string(),
                };
                (o.resource.clone(), reason)
            })
            .collect()
    }

    /// Outcome of the first action on `resource` with `kind`.
    #[must_use]
    pub fn outcome(&self, resource: &ResourceId, kind: ActionKind) -> Option<&ActionOutcome> {
        self.outcomes
            .iter()
            .find(|o| o.resource == *resource && o.kind == kind)
    }

    /// Builds the history record for this run.
    #[must_use]
    pub fn to_run_record(
        &self,
        run_id: impl Into<String>,
        operation: RunOperation,
        config_hash: &str,
    ) -> RunRecord {
        RunRecord {
            run_id: run_id.into(),
            operation,
            started_at: self.started_at,
            finished_at: self.finished_at,
            config_hash: config_hash.to_string(),
            succeeded: self.succeeded(),
            failed: self.failed(),
            skipped: self.skipped(),
            cancelled: self.cancelled(),
            success: self.is_success(),
        }
    }

    /// Converts a non-successful report into an error.
    ///
    /// # Errors
    ///
    /// Returns `Incomplete` if any action did not succeed, or `Cancelled`
    /// if the run was cancelled before anything failed.
    pub fn check(&self) -> Result<()> {
        if self.is_success() {
            return Ok(());
        }
        if self.failed() == 0 && self.skipped() == 0 {
            if let Some(reason) = self.aborted.as_ref().or(self.cancelled_reason.as_ref()) {
                return Err(TerraceError::Execution(ExecutionError::Cancelled {
                    reason: reason.clone(),
                }));
            }
        }
        Err(TerraceError::Execution(ExecutionError::Incomplete {
            failed: self.failed(),
            skipped: self.skipped(),
            cancelled: self.cancelled(),
        }))
    }
}

/// Cooperative cancellation shared by every task of a run.
///
/// The first reason wins; later calls to [`CancellationSignal::cancel`] are
/// ignored.
#[derive(Debug, Clone)]
pub struct CancellationSignal {
    sender: Arc<watch::Sender<Option<String>>>,
}

impl Default for CancellationSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationSignal {
    /// Creates a signal that is not cancelled.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = watch::channel(None);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Cancels the run. Returns false if it was already cancelled.
    pub fn cancel(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        self.sender.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            warn!("Cancelling run: {reason}");
            *current = Some(reason);
            true
        })
    }

    /// Returns true once cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.sender.borrow().is_some()
    }

    /// Why the run was cancelled.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.sender.borrow().clone()
    }

    /// Completes when the run is cancelled.
    pub async fn cancelled(&self) {
        let mut receiver = self.sender.subscribe();
        // The sender lives as long as `self`, so this only returns once set.
        let _ = receiver.wait_for(Option::is_some).await;
    }

    /// Cancels the run after `timeout`.
    pub fn cancel_after(&self, timeout: Duration) -> tokio::task::JoinHandle<()> {
        let signal = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(timeout) => {
                    signal.cancel(format!("timed out after {}s", timeout.as_secs()));
                }
                () = signal.cancelled() => {}
            }
        })
    }

    /// Cancels the run on Ctrl-C.
    pub fn cancel_on_ctrl_c(&self) -> tokio::task::JoinHandle<()> {
        let signal = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    if result.is_ok() {
                        signal.cancel("interrupted");
                    }
                }
                () = signal.cancelled() => {}
            }
        })
    }
}

/// Executor settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorOptions {
    /// Maximum number of actions executing at once.
    pub parallelism: usize,
    /// Retries for retryable provider errors.
    pub max_retries: u32,
    /// Upper bound for a single retry delay.
    pub retry_delay_cap: Duration,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            parallelism: 10,
            max_retries: 3,
            retry_delay_cap: Duration::from_secs(30),
        }
    }
}

impl From<&ExecutionConfig> for ExecutorOptions {
    fn from(config: &ExecutionConfig) -> Self {
        Self {
            parallelism: config.parallelism,
            max_retries: config.max_retries,
            ..Self::default()
        }
    }
}

/// Executor for plans.
#[derive(Clone)]
pub struct PlanExecutor {
    provider: Arc<dyn ProviderAdapter>,
    options: ExecutorOptions,
}

impl fmt::Debug for PlanExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlanExecutor")
            .field("provider", &self.provider.name())
            .field("options", &self.options)
            .finish()
    }
}

impl PlanExecutor {
    /// Creates a new executor.
    #[must_use]
    pub const fn new(provider: Arc<dyn ProviderAdapter>, options: ExecutorOptions) -> Self {
        Self { provider, options }
    }

    /// Executes `plan`, writing every result to `session` as it happens.
    ///
    /// Per-action failures are reported in the returned report, never as an
    /// error.
    pub async fn execute(
        &self,
        plan: &Plan,
        resources: &ResourceSet,
        session: Arc<StateSession>,
        cancel: &CancellationSignal,
    ) -> ExecutionReport {
        let started_at = Utc::now();
        info!(
            "Executing {} actions with parallelism {}",
            plan.action_count(),
            self.options.parallelism.max(1)
        );

        let semaphore = Arc::new(Semaphore::new(self.options.parallelism.max(1)));
        let abort = Arc::new(OnceLock::new());
        let (senders, receivers): (Vec<_>, Vec<_>) = plan
            .actions
            .iter()
            .map(|_| watch::channel(None))
            .unzip();

        let mut tasks = JoinSet::new();
        let mut task_positions = HashMap::new();
        for (position, (action, done)) in plan.actions.iter().zip(senders).enumerate() {
            let task = ActionTask {
                position,
                action: action.clone(),
                resource: resources.get(&action.resource).cloned(),
                predecessors: action
                    .dependencies
                    .iter()
                    .map(|&d| (plan.actions[d].resource.clone(), receivers[d].clone()))
                    .collect(),
                done,
                provider: Arc::clone(&self.provider),
                session: Arc::clone(&session),
                semaphore: Arc::clone(&semaphore),
                cancel: cancel.clone(),
                abort: Arc::clone(&abort),
                options: self.options,
            };
            let handle = tasks.spawn(task.run());
            task_positions.insert(handle.id(), position);
        }
        drop(receivers);

        let mut outcomes: Vec<Option<ActionOutcome>> = vec![None; plan.action_count()];
        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((_, outcome)) => {
                    let position = outcome.index;
                    outcomes[position] = Some(outcome);
                }
                Err(e) => {
                    error!("Action task ended abnormally: {e}");
                    if let Some(&position) = task_positions.get(&e.id()) {
                        let action = &plan.actions[position];
                        outcomes[position] = Some(ActionOutcome {
                            index: position,
                            resource: action.resource.clone(),
                            kind: action.kind,
                            status: ActionStatus::Failed,
                            error: Some(e.to_string()),
                            duration_ms: 0,
                            provider_id: action.provider_id.clone(),
                            attempts: 0,
                        });
                    }
                }
            }
        }

        let report = ExecutionReport {
            outcomes: outcomes.into_iter().flatten().collect(),
            started_at,
            finished_at: Utc::now(),
            cancelled_reason: cancel.reason(),
            aborted: abort.get().cloned(),
        };

        info!(
            "Execution finished: {} succeeded, {} failed, {} skipped, {} cancelled",
            report.succeeded(),
            report.failed(),
            report.skipped(),
            report.cancelled()
        );
        report
    }
}

/// What a successful provider call produced.
enum Applied {
    Unchanged,
    Created {
        provider_id: String,
        attributes: BTreeMap<String, JsonValue>,
        computed: BTreeMap<String, JsonValue>,
    },
    Updated {
        attributes: BTreeMap<String, JsonValue>,
        computed: BTreeMap<String, JsonValue>,
    },
    Destroyed,
    DestroyedOld,
}

/// Everything one action needs, owned by its task.
struct ActionTask {
    position: usize,
    action: PlannedAction,
    resource: Option<Resource>,
    predecessors: Vec<(ResourceId, watch::Receiver<Option<ActionStatus>>)>,
    done: watch::Sender<Option<ActionStatus>>,
    provider: Arc<dyn ProviderAdapter>,
    session: Arc<StateSession>,
    semaphore: Arc<Semaphore>,
    cancel: CancellationSignal,
    abort: Arc<OnceLock<String>>,
    options: ExecutorOptions,
}

impl ActionTask {
    async fn run(mut self) -> ActionOutcome {
        let outcome = match self.wait_for_predecessors().await {
            Some((status, reason)) => self.abandon(status, reason).await,
            None => self.perform().await,
        };
        self.done.send_replace(Some(outcome.status));
        outcome
    }

    /// Returns the status to record instead of running, if any.
    async fn wait_for_predecessors(&mut self) -> Option<(ActionStatus, String)> {
        for (resource, receiver) in &mut self.predecessors {
            let status = tokio::select! {
                biased;
                result = receiver.wait_for(Option::is_some) => {
                    result.ok().and_then(|status| *status).unwrap_or(ActionStatus::Failed)
                }
                () = self.cancel.cancelled() => {
                    return Some((ActionStatus::Cancelled, self.cancel.reason().unwrap_or_default()));
                }
            };
            match status {
                ActionStatus::Succeeded => {}
                ActionStatus::Failed | ActionStatus::Skipped => {
                    return Some((ActionStatus::Skipped, format!("dependency {resource} {status}")));
                }
                ActionStatus::Cancelled => {
                    return Some((ActionStatus::Cancelled, format!("dependency {resource} was cancelled")));
                }
            }
        }
        None
    }

    async fn abandon(&self, status: ActionStatus, reason: String) -> ActionOutcome {
        debug!("{} {}: {reason}", self.action, status);
        if status == ActionStatus::Cancelled && self.action.kind.is_change() {
            let marked = self
                .session
                .mark(
                    &self.action.resource,
                    EntryStatus::Cancelled,
                    self.action.index,
                    Some(reason.clone()),
                )
                .await;
            if let Err(e) = marked {
                self.abort_run(&e);
            }
        }
        self.outcome(status, Some(reason), Duration::ZERO, self.action.provider_id.clone(), 0)
    }

    async fn perform(&self) -> ActionOutcome {
        let _permit = if self.action.kind.is_change() {
            let acquired = tokio::select! {
                biased;
                () = self.cancel.cancelled() => None,
                permit = Arc::clone(&self.semaphore).acquire_owned() => permit.ok(),
            };
            match acquired {
                Some(permit) => Some(permit),
                None => {
                    let reason = self.cancel.reason().unwrap_or_default();
                    return self.abandon(ActionStatus::Cancelled, reason).await;
                }
            }
        } else {
            None
        };

        let started = Instant::now();
        let mut attempts = 0;
        let applied = loop {
            attempts += 1;
            match self.call_provider().await {
                Ok(applied) => break applied,
                Err(e)
                    if e.is_retryable()
                        && attempts <= self.options.max_retries
                        && !(self.action.kind.is_create() && e.outcome_unknown()) =>
                {
                    let delay = Duration::from_secs(e.retry_delay_secs().unwrap_or(1))
                        .min(self.options.retry_delay_cap);
                    warn!(
                        "{} failed (attempt {attempts}), retrying in {}ms: {e}",
                        self.action,
                        delay.as_millis()
                    );
                    tokio::select! {
                        biased;
                        () = self.cancel.cancelled() => {
                            let reason = self.cancel.reason().unwrap_or_default();
                            let mut outcome = self.abandon(ActionStatus::Cancelled, reason).await;
                            outcome.attempts = attempts;
                            return outcome;
                        }
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    warn!("{} failed: {e}", self.action);
                    if self.action.kind.is_create() && e.outcome_unknown() {
                        warn!(
                            "{} may exist remotely although no provider id was recorded",
                            self.action.resource
                        );
                    }
                    let message = e.to_string();
                    let marked = self
                        .session
                        .mark(
                            &self.action.resource,
                            EntryStatus::Failed,
                            self.action.index,
                            Some(message.clone()),
                        )
                        .await;
                    if let Err(state_error) = marked {
                        self.abort_run(&state_error);
                    }
                    return self.outcome(
                        ActionStatus::Failed,
                        Some(message),
                        started.elapsed(),
                        self.action.provider_id.clone(),
                        attempts,
                    );
                }
            }
        };

        let provider_id = match &applied {
            Applied::Created { provider_id, .. } => Some(provider_id.clone()),
            Applied::Destroyed | Applied::DestroyedOld => None,
            Applied::Unchanged | Applied::Updated { .. } => self.action.provider_id.clone(),
        };

        match self.commit(applied).await {
            Ok(()) => {
                if self.action.kind.is_change() {
                    info!("{} succeeded", self.action.resource);
                }
                self.outcome(ActionStatus::Succeeded, None, started.elapsed(), provider_id, attempts)
            }
            Err(e) => {
                self.abort_run(&e);
                self.outcome(
                    ActionStatus::Failed,
                    Some(format!("state write failed: {e}")),
                    started.elapsed(),
                    provider_id,
                    attempts,
                )
            }
        }
    }

    async fn call_provider(&self) -> Result<Applied> {
        let id = &self.action.resource;
        match self.action.kind {
            ActionKind::Noop => Ok(Applied::Unchanged),
            ActionKind::Create | ActionKind::Replace(ReplacePhase::CreateNew) => {
                let attributes = self.resolve()?;
                let response = self
                    .provider
                    .create(&ResolvedResource::new(id.clone(), attributes.clone()))
                    .await?;
                Ok(Applied::Created {
                    provider_id: response.provider_id,
                    attributes,
                    computed: response.computed,
                })
            }
            ActionKind::Update => {
                let provider_id = self.action.provider_id.as_deref().ok_or_else(|| {
                    TerraceError::internal(format!("{id} has no provider id to update"))
                })?;
                let attributes = self.resolve()?;
                let computed = self
                    .provider
                    .update(
                        provider_id,
                        &ResolvedResource::new(id.clone(), attributes.clone()),
                        &self.action.changed,
                    )
                    .await?;
                Ok(Applied::Updated {
                    attributes,
                    computed,
                })
            }
            ActionKind::Destroy | ActionKind::Replace(ReplacePhase::DestroyOld) => {
                if let Some(provider_id) = &self.action.provider_id {
                    match self.provider.destroy(id, provider_id).await {
                        Ok(()) => {}
                        Err(TerraceError::Provider(ProviderError::NotFound { .. })) => {
                            warn!("{id} ({provider_id}) was already gone");
                        }
                        Err(e) => return Err(e),
                    }
                }
                Ok(if self.action.kind == ActionKind::Destroy {
                    Applied::Destroyed
                } else {
                    Applied::DestroyedOld
                })
            }
        }
    }

    async fn commit(&self, applied: Applied) -> Result<()> {
        let id = &self.action.resource;
        let index = self.action.index;
        let dependencies = self
            .resource
            .as_ref()
            .map(Resource::managed_dependencies)
            .unwrap_or_default();

        match applied {
            Applied::Unchanged => {
                let stale = self
                    .session
                    .entry(id)
                    .is_some_and(|e| e.dependencies != dependencies || e.index != index);
                if stale {
                    debug!("Refreshing recorded dependencies of {id}");
                    self.session
                        .modify(id, move |current| {
                            current.map(|mut entry| {
                                entry.dependencies = dependencies;
                                entry.index = index;
                                entry
                            })
                        })
                        .await?;
                }
                Ok(())
            }
            Applied::Created {
                provider_id,
                attributes,
                computed,
            } => {
                self.session
                    .upsert(StateEntry::created(
                        id.clone(),
                        provider_id,
                        attributes,
                        computed,
                        dependencies,
                        index,
                    ))
                    .await
            }
            Applied::Updated {
                attributes,
                computed,
            } => {
                self.session
                    .modify(id, move |current| {
                        current.map(|mut entry| {
                            entry.applied(attributes, computed, dependencies, index);
                            entry
                        })
                    })
                    .await
            }
            Applied::Destroyed => self.session.remove(id).await,
            Applied::DestroyedOld => {
                self.session
                    .modify(id, |current| {
                        current.map(|mut entry| {
                            entry.provider_id = None;
                            entry.mark(EntryStatus::Destroyed, None);
                            entry
                        })
                    })
                    .await
            }
        }
    }

    fn resolve(&self) -> Result<BTreeMap<String, JsonValue>> {
        let resource = self.resource.as_ref().ok_or_else(|| {
            TerraceError::internal(format!("{} is not in the configuration", self.action.resource))
        })?;
        resource.resolve_attributes(&*self.session)
    }

    fn abort_run(&self, error: &TerraceError) {
        error!("State write for {} failed, stopping the run: {error}", self.action.resource);
        let reason = format!("state write failed: {error}");
        let _ = self.abort.set(reason.clone());
        self.cancel.cancel(reason);
    }

    fn outcome(
        &self,
        status: ActionStatus,
        error: Option<String>,
        elapsed: Duration,
        provider_id: Option<String>,
        attempts: u32,
    ) -> ActionOutcome {
        ActionOutcome {
            index: self.position,
            resource: self.action.resource.clone(),
            kind: self.action.kind,
            status,
            error,
            duration_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            provider_id,
            attempts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::DependencyGraph;
    use crate::model::{SchemaRegistry, Value};
    use crate::planner::{DiffEngine, PlanMode};
    use crate::provider::{ProviderOperation, SimulatedProvider};
    use crate::state::{LocalStateStore, StateDocument, StateStore};
    use tempfile::TempDir;

    fn id(t: &str, n: &str) -> ResourceId {
        ResourceId::managed(t, n)
    }

    fn fast() -> ExecutorOptions {
        ExecutorOptions {
            parallelism: 10,
            max_retries: 3,
            retry_delay_cap: Duration::from_millis(5),
        }
    }

    fn scenario() -> ResourceSet {
        let vpc = id("aws_vpc", "main");
        let subnet = id("aws_subnet", "public");
        let sg = id("aws_security_group", "web");
        let mut set = ResourceSet::new();
        set.insert(Resource::new(vpc.clone()).with_attribute("cidr_block", Value::string("10.0.0.0/16")))
            .unwrap();
        set.insert(
            Resource::new(subnet.clone())
                .with_attribute("vpc_id", Value::reference(vpc.clone(), "id"))
                .with_attribute("cidr_block", Value::string("10.0.1.0/24")),
        )
        .unwrap();
        set.insert(Resource::new(sg.clone()).with_attribute("vpc_id", Value::reference(vpc, "id")))
            .unwrap();
        set.insert(
            Resource::new(id("aws_instance", "web"))
                .with_attribute("ami", Value::string("ami-0a1b2c3d4e5f60002"))
                .with_attribute("instance_type", Value::string("t3.micro"))
                .with_attribute("subnet_id", Value::reference(subnet, "id"))
                .with_attribute(
                    "vpc_security_group_ids",
                    Value::List(vec![Value::reference(sg, "id")]),
                ),
        )
        .unwrap();
        set
    }

    struct Harness {
        _dir: TempDir,
        store: Arc<dyn StateStore>,
        provider: Arc<SimulatedProvider>,
    }

    impl Harness {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let store: Arc<dyn StateStore> = Arc::new(LocalStateStore::with_base_dir(dir.path()));
            Self {
                _dir: dir,
                store,
                provider: Arc::new(SimulatedProvider::new()),
            }
        }

        async fn plan(&self, resources: &ResourceSet, mode: PlanMode) -> Plan {
            let state = self.store.load().await.unwrap().unwrap_or_else(|| StateDocument::new("demo", "dev"));
            plan_for(resources, &state, mode)
        }

        async fn run(
            &self,
            resources: &ResourceSet,
            mode: PlanMode,
            options: ExecutorOptions,
            cancel: &CancellationSignal,
        ) -> (Plan, ExecutionReport, StateDocument) {
            let session = Arc::new(
                StateSession::open(Arc::clone(&self.store), "demo", "dev", "apply")
                    .await
                    .unwrap(),
            );
            let plan = plan_for(resources, &session.snapshot(), mode);
            let provider: Arc<dyn ProviderAdapter> = Arc::clone(&self.provider) as Arc<dyn ProviderAdapter>;
            let report = PlanExecutor::new(provider, options)
                .execute(&plan, resources, Arc::clone(&session), cancel)
                .await;
            let session = Arc::try_unwrap(session).unwrap();
            let state = session
                .close(report.to_run_record("run", RunOperation::Apply, "hash"))
                .await
                .unwrap();
            (plan, report, state)
        }
    }

    fn plan_for(resources: &ResourceSet, state: &StateDocument, mode: PlanMode) -> Plan {
        let graph = DependencyGraph::build(resources).unwrap();
        let schemas = SchemaRegistry::builtin();
        let diff = DiffEngine::new(&graph, resources, state, &schemas).compute_diff(mode);
        Plan::from_diff(&diff, &graph, resources, state, mode, "hash").unwrap()
    }

    #[tokio::test]
    async fn test_apply_then_replan_is_idempotent() {
        let harness = Harness::new();
        let resources = scenario();
        let (_, report, state) = harness
            .run(&resources, PlanMode::Apply, fast(), &CancellationSignal::new())
            .await;

        assert!(report.is_success());
        assert_eq!(report.succeeded(), 4);
        assert_eq!(state.live_entries().count(), 4);
        assert_eq!(state.history.len(), 1);

        let subnet = state.entry(&id("aws_subnet", "public")).unwrap();
        let vpc = state.entry(&id("aws_vpc", "main")).unwrap();
        assert_eq!(subnet.attributes["vpc_id"], JsonValue::from(vpc.provider_id.clone().unwrap()));

        let replan = harness.plan(&resources, PlanMode::Apply).await;
        assert!(!replan.has_changes(), "{replan}");
    }

    #[tokio::test]
    async fn test_partial_failure_skips_dependents_only() {
        let harness = Harness::new();
        let resources = scenario();
        harness
            .provider
            .fail_on(&id("aws_subnet", "public"), ProviderOperation::Create);

        let (_, report, state) = harness
            .run(&resources, PlanMode::Apply, fast(), &CancellationSignal::new())
            .await;

        let status = |r: &ResourceId| report.outcome(r, ActionKind::Create).unwrap().status;
        assert_eq!(status(&id("aws_subnet", "public")), ActionStatus::Failed);
        assert_eq!(status(&id("aws_instance", "web")), ActionStatus::Skipped);
        assert_eq!(status(&id("aws_security_group", "web")), ActionStatus::Succeeded);
        assert_eq!(status(&id("aws_vpc", "main")), ActionStatus::Succeeded);

        assert!(harness.provider.calls_for(&id("aws_instance", "web")).is_empty());
        let failed = state.entry(&id("aws_subnet", "public")).unwrap();
        assert_eq!(failed.status, EntryStatus::Failed);
        assert!(failed.last_error.is_some());
        assert!(state.entry(&id("aws_instance", "web")).is_none());
        assert!(!state.history[0].success);

        let unavailable = report.unavailable_resources();
        assert!(unavailable.iter().any(|(r, reason)| {
            *r == id("aws_instance", "web") && reason.starts_with("skipped")
        }));
    }

    #[tokio::test]
    async fn test_replacement_destroys_before_creating() {
        let harness = Harness::new();
        let resources = scenario();
        harness
            .run(&resources, PlanMode::Apply, fast(), &CancellationSignal::new())
            .await;

        let mut changed = ResourceSet::new();
        for resource in resources.iter() {
            let mut resource = resource.clone();
            if resource.id == id("aws_instance", "web") {
                resource
                    .attributes
                    .insert(String::from("ami"), Value::string("ami-0a1b2c3d4e5f60001"));
            }
            changed.insert(resource).unwrap();
        }

        let instance = id("aws_instance", "web");
        let before = harness.provider.calls_for(&instance).len();
        let (_, report, state) = harness
            .run(&changed, PlanMode::Apply, fast(), &CancellationSignal::new())
            .await;

        assert!(report.is_success());
        assert_eq!(
            harness.provider.calls_for(&instance)[before..],
            [ProviderOperation::Destroy, ProviderOperation::Create]
        );
        let entry = state.entry(&instance).unwrap();
        assert_eq!(entry.status, EntryStatus::Created);
        assert_eq!(entry.attributes["ami"], JsonValue::from("ami-0a1b2c3d4e5f60001"));
    }

    #[tokio::test]
    async fn test_destroy_runs_in_reverse_order() {
        let harness = Harness::new();
        let resources = scenario();
        let serial = ExecutorOptions { parallelism: 1, ..fast() };
        let (create_plan, _, _) = harness
            .run(&resources, PlanMode::Apply, serial, &CancellationSignal::new())
            .await;

        let (plan, report, state) = harness
            .run(&resources, PlanMode::Destroy, serial, &CancellationSignal::new())
            .await;

        assert!(report.is_success());
        assert!(plan.actions.iter().all(|a| a.kind == ActionKind::Destroy));
        let mut expected: Vec<&ResourceId> = create_plan.actions.iter().map(|a| &a.resource).collect();
        expected.reverse();
        let planned: Vec<&ResourceId> = plan.actions.iter().map(|a| &a.resource).collect();
        assert_eq!(planned, expected);

        let destroyed: Vec<String> = harness
            .provider
            .calls()
            .into_iter()
            .filter(|c| c.operation == ProviderOperation::Destroy)
            .map(|c| c.resource)
            .collect();
        assert_eq!(destroyed.first().map(String::as_str), Some("aws_instance.web"));
        assert_eq!(destroyed.last().map(String::as_str), Some("aws_vpc.main"));
        assert!(state.entries.is_empty());
        assert!(harness.provider.objects().await.is_empty());
    }

    #[tokio::test]
    async fn test_parallelism_bounds_concurrent_calls() {
        let harness = Harness {
            provider: Arc::new(SimulatedProvider::new().with_latency(Duration::from_millis(20))),
            ..Harness::new()
        };
        let mut resources = ResourceSet::new();
        for i in 0..6 {
            resources
                .insert(
                    Resource::new(id("tls_private_key", &format!("k{i}")))
                        .with_attribute("algorithm", Value::string("RSA")),
                )
                .unwrap();
        }

        let (_, report, _) = harness
            .run(&resources, PlanMode::Apply, ExecutorOptions { parallelism: 2, ..fast() }, &CancellationSignal::new())
            .await;

        assert_eq!(report.succeeded(), 6);
        assert_eq!(harness.provider.peak_concurrency(), 2);
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let harness = Harness::new();
        let resources = scenario();
        let vpc = id("aws_vpc", "main");
        harness.provider.fail_transiently(&vpc, ProviderOperation::Create, 2);

        let (_, report, _) = harness
            .run(&resources, PlanMode::Apply, fast(), &CancellationSignal::new())
            .await;

        assert!(report.is_success());
        assert_eq!(report.outcome(&vpc, ActionKind::Create).unwrap().attempts, 3);
    }

    #[tokio::test]
    async fn test_interrupted_create_is_not_repeated() {
        let harness = Harness::new();
        let resources = scenario();
        let vpc = id("aws_vpc", "main");
        harness.provider.fail_interrupted(&vpc, ProviderOperation::Create, 1);

        let (_, report, state) = harness
            .run(&resources, PlanMode::Apply, fast(), &CancellationSignal::new())
            .await;

        let outcome = report.outcome(&vpc, ActionKind::Create).unwrap();
        assert_eq!(outcome.status, ActionStatus::Failed);
        assert_eq!(outcome.attempts, 1);
        assert_eq!(harness.provider.calls_for(&vpc), vec![ProviderOperation::Create]);
        assert_eq!(state.entry(&vpc).unwrap().status, EntryStatus::Failed);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let harness = Harness::new();
        let resources = scenario();
        let vpc = id("aws_vpc", "main");
        harness.provider.fail_transiently(&vpc, ProviderOperation::Create, 10);

        let (_, report, _) = harness
            .run(&resources, PlanMode::Apply, ExecutorOptions { max_retries: 1, ..fast() }, &CancellationSignal::new())
            .await;

        let outcome = report.outcome(&vpc, ActionKind::Create).unwrap();
        assert_eq!(outcome.status, ActionStatus::Failed);
        assert_eq!(outcome.attempts, 2);
        assert_eq!(report.skipped(), 3);
    }

    #[tokio::test]
    async fn test_cancelled_run_records_markers() {
        let harness = Harness::new();
        let resources = scenario();
        let cancel = CancellationSignal::new();
        cancel.cancel("interrupted");

        let (_, report, state) = harness.run(&resources, PlanMode::Apply, fast(), &cancel).await;

        assert_eq!(report.cancelled(), 4);
        assert_eq!(report.cancelled_reason.as_deref(), Some("interrupted"));
        assert!(harness.provider.calls().is_empty());
        for entry in state.entries.values() {
            assert_eq!(entry.status, EntryStatus::Cancelled);
            assert!(entry.provider_id.is_none());
        }
        assert_eq!(state.entries.len(), 4);
        assert!(matches!(
            report.check(),
            Err(TerraceError::Execution(ExecutionError::Cancelled { .. }))
        ));

        let replan = harness.plan(&resources, PlanMode::Apply).await;
        assert_eq!(replan.summary().create, 4);
    }

    #[tokio::test]
    async fn test_timeout_lets_in_flight_calls_finish() {
        let harness = Harness {
            provider: Arc::new(SimulatedProvider::new().with_latency(Duration::from_millis(50))),
            ..Harness::new()
        };
        let resources = scenario();
        let cancel = CancellationSignal::new();
        let _timer = cancel.cancel_after(Duration::from_millis(10));

        let (_, report, state) = harness.run(&resources, PlanMode::Apply, fast(), &cancel).await;

        let vpc = report.outcome(&id("aws_vpc", "main"), ActionKind::Create).unwrap();
        assert_eq!(vpc.status, ActionStatus::Succeeded);
        assert!(state.live_entry(&id("aws_vpc", "main")).is_some());
        assert_eq!(report.cancelled(), 3);
        assert!(report.cancelled_reason.unwrap().starts_with("timed out"));
    }

    #[test]
    fn test_first_cancel_reason_wins() {
        let cancel = CancellationSignal::new();
        assert!(!cancel.is_cancelled());
        assert!(cancel.cancel("first"));
        assert!(!cancel.cancel("second"));
        assert_eq!(cancel.reason().as_deref(), Some("first"));
    }
}
