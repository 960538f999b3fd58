//! Reconciler driving a configuration to its desired state.
//!
//! A run loads the configuration, resolves data sources, plans against the
//! recorded state and executes the plan under the state lock. Planning alone
//! never writes to the state store.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{ConfigParser, ConfigValidator, ProjectConfig, TerraceConfig};
use crate::error::{Result, TerraceError};
use crate::graph::DependencyGraph;
use crate::model::{ResourceModel, VariableOverrides};
use crate::outputs::{OutputExtractor, OutputSet};
use crate::planner::{
    CancellationSignal, DiffEngine, ExecutionReport, ExecutorOptions, Plan, PlanExecutor, PlanMode,
};
use crate::provider::{ProviderAdapter, ResolvedResource};
use crate::state::{DataEntry, RunOperation, StateDocument, StateSession, StateStore};

/// Result of an apply or destroy run.
#[derive(Debug)]
pub struct RunResult {
    /// Plan that was executed.
    pub plan: Plan,
    /// Per-action outcomes.
    pub report: ExecutionReport,
    /// Outputs evaluated against the final state.
    pub outputs: OutputSet,
    /// State after the run.
    pub state: StateDocument,
}

/// Plans and applies one project.
pub struct Reconciler {
    model: ResourceModel,
    graph: DependencyGraph,
    project: ProjectConfig,
    store: Arc<dyn StateStore>,
    provider: Arc<dyn ProviderAdapter>,
    options: ExecutorOptions,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("project", &self.project)
            .field("resources", &self.model.resources.len())
            .field("store", &self.store.location())
            .field("provider", &self.provider.name())
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    /// Loads a configuration file.
    ///
    /// `.env` next to the file is loaded first, then `TERRACE_*` overrides
    /// are applied and the result is validated.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the file cannot be read, parsed or
    /// validated.
    pub fn load_config(config_file: &Path) -> Result<TerraceConfig> {
        let parser = ConfigParser::new().with_base_path(
            config_file
                .parent()
                .unwrap_or_else(|| Path::new(".")),
        );
        parser.load_dotenv()?;

        let config = parser.load_with_env(config_file)?;
        ConfigValidator::new().validate(&config)?;
        Ok(config)
    }

    /// Creates a reconciler for `config`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the model cannot be built or the
    /// dependency graph has a cycle.
    pub fn new(
        config: &TerraceConfig,
        overrides: &VariableOverrides,
        store: Arc<dyn StateStore>,
        provider: Arc<dyn ProviderAdapter>,
    ) -> Result<Self> {
        let model = ResourceModel::build(config, overrides)?;
        let graph = DependencyGraph::build(&model.resources)?;
        debug!(
            "Reconciler ready for {}/{} ({} resources)",
            config.project.name,
            config.project.environment,
            model.resources.len()
        );

        Ok(Self {
            model,
            graph,
            project: config.project.clone(),
            store,
            provider,
            options: ExecutorOptions::from(&config.execution),
        })
    }

    /// Overrides the executor settings.
    #[must_use]
    pub const fn with_options(mut self, options: ExecutorOptions) -> Self {
        self.options = options;
        self
    }

    /// The desired model.
    #[must_use]
    pub const fn model(&self) -> &ResourceModel {
        &self.model
    }

    /// The dependency graph of the desired model.
    #[must_use]
    pub const fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// Computes a plan without changing anything.
    ///
    /// Data sources are read in apply mode so the plan sees current lookups;
    /// their results are not stored.
    ///
    /// # Errors
    ///
    /// Returns an error if state cannot be loaded or a data source cannot be
    /// read.
    pub async fn plan(&self, mode: PlanMode) -> Result<Plan> {
        let mut state = self.load_state().await?;
        if mode == PlanMode::Apply {
            state.data = self.resolve_data(&state).await?;
        }
        self.build_plan(&state, mode)
    }

    /// Plans and executes under the state lock.
    ///
    /// Per-action failures are part of the returned report. Errors are
    /// returned only when the run could not start or the final state could
    /// not be written.
    ///
    /// # Errors
    ///
    /// Returns `LockedByOther` if another run holds the lock, or any error
    /// raised before execution starts.
    pub async fn apply(&self, mode: PlanMode, cancel: &CancellationSignal) -> Result<RunResult> {
        let operation = match mode {
            PlanMode::Apply => RunOperation::Apply,
            PlanMode::Destroy => RunOperation::Destroy,
        };
        let operation_name = operation.to_string();
        info!(
            "Starting {operation_name} of {}/{}",
            self.project.name, self.project.environment
        );

        let session = StateSession::open(
            Arc::clone(&self.store),
            &self.project.name,
            &self.project.environment,
            &operation_name,
        )
        .await?;

        let plan = match self.prepare(&session, mode).await {
            Ok(plan) => plan,
            Err(e) => {
                if let Err(release) = session.abandon().await {
                    warn!("Failed to release state lock: {release}");
                }
                return Err(e);
            }
        };
        info!("{}", plan.to_string().trim_end());

        let session = Arc::new(session);
        let executor = PlanExecutor::new(Arc::clone(&self.provider), self.options);
        let report = executor
            .execute(&plan, &self.model.resources, Arc::clone(&session), cancel)
            .await;
        let session = Arc::try_unwrap(session)
            .map_err(|_| TerraceError::internal("state session is still shared after execution"))?;

        self.prune(&session, mode).await;

        let record = report.to_run_record(Uuid::new_v4().to_string(), operation, &self.model.config_hash);
        let state = session.close(record).await?;

        let outputs = match mode {
            PlanMode::Apply => OutputExtractor::new(&state)
                .with_unavailable(report.unavailable_resources())
                .extract(&self.model.outputs),
            PlanMode::Destroy => OutputSet::default(),
        };

        Ok(RunResult {
            plan,
            report,
            outputs,
            state,
        })
    }

    /// Evaluates outputs against stored state.
    ///
    /// # Errors
    ///
    /// Returns an error if state cannot be loaded.
    pub async fn outputs(&self) -> Result<OutputSet> {
        let state = self.load_state().await?;
        Ok(OutputExtractor::new(&state).extract(&self.model.outputs))
    }

    async fn prepare(&self, session: &StateSession, mode: PlanMode) -> Result<Plan> {
        if mode == PlanMode::Apply {
            let data = self.resolve_data(&session.snapshot()).await?;
            session.set_data(data).await?;
        }
        self.build_plan(&session.snapshot(), mode)
    }

    fn build_plan(&self, state: &StateDocument, mode: PlanMode) -> Result<Plan> {
        let diff = DiffEngine::new(&self.graph, &self.model.resources, state, &self.model.schemas)
            .compute_diff(mode);
        Plan::from_diff(
            &diff,
            &self.graph,
            &self.model.resources,
            state,
            mode,
            &self.model.config_hash,
        )
    }

    async fn load_state(&self) -> Result<StateDocument> {
        Ok(self.store.load().await?.unwrap_or_else(|| {
            StateDocument::new(&self.project.name, &self.project.environment)
        }))
    }

    /// Reads every data source in dependency order.
    async fn resolve_data(&self, base: &StateDocument) -> Result<BTreeMap<String, DataEntry>> {
        let mut working = base.clone();
        working.data.clear();

        for id in self.graph.topological_order().filter(|id| id.is_data()) {
            let Some(resource) = self.model.resources.get(id) else {
                continue;
            };
            let attributes = resource.resolve_attributes(&working)?;
            let result = self
                .provider
                .read_data(&ResolvedResource::new(id.clone(), attributes))
                .await?;
            debug!("Read {id}");
            working.data.insert(
                id.to_string(),
                DataEntry {
                    attributes: result,
                    read_at: Utc::now(),
                },
            );
        }

        Ok(working.data)
    }

    /// Drops entries without a remote object that nothing needs any more.
    async fn prune(&self, session: &StateSession, mode: PlanMode) {
        let stale: Vec<_> = session
            .snapshot()
            .entries
            .into_values()
            .filter(|entry| !entry.is_live())
            .filter(|entry| mode == PlanMode::Destroy || !self.model.resources.contains(&entry.id))
            .map(|entry| entry.id)
            .collect();

        for id in stale {
            debug!("Pruning {id} from state");
            if let Err(e) = session.remove(&id).await {
                warn!("Failed to prune {id}: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ConfigError, StateError};
    use crate::model::ResourceId;
    use crate::outputs::OutputValue;
    use crate::planner::{ActionKind, ActionStatus};
    use crate::provider::{ProviderOperation, SimulatedProvider};
    use crate::state::{EntryStatus, LocalStateStore};
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;

    const TEMPLATE: &str = include_str!("../templates/terrace.yaml");

    struct Fixture {
        _dir: TempDir,
        store: Arc<dyn StateStore>,
        provider: Arc<SimulatedProvider>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            Self {
                store: Arc::new(LocalStateStore::with_base_dir(dir.path().join(".terrace"))),
                provider: Arc::new(SimulatedProvider::new()),
                _dir: dir,
            }
        }

        fn reconciler(&self, yaml: &str, vars: &[(&str, &str)]) -> Result<Reconciler> {
            let config = ConfigParser::new().parse_yaml(yaml, None)?;
            let overrides = VariableOverrides {
                cli: vars
                    .iter()
                    .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                    .collect(),
                env: BTreeMap::new(),
            };
            let provider: Arc<dyn ProviderAdapter> = Arc::clone(&self.provider) as Arc<dyn ProviderAdapter>;
            Ok(Reconciler::new(&config, &overrides, Arc::clone(&self.store), provider)?
                .with_options(ExecutorOptions {
                    retry_delay_cap: Duration::from_millis(5),
                    ..ExecutorOptions::default()
                }))
        }
    }

    fn instance() -> ResourceId {
        ResourceId::managed("aws_instance", "web")
    }

    #[tokio::test]
    async fn test_template_applies_and_converges() {
        let fixture = Fixture::new();
        let reconciler = fixture.reconciler(TEMPLATE, &[]).unwrap();

        let plan = reconciler.plan(PlanMode::Apply).await.unwrap();
        assert_eq!(plan.summary().create, 9);
        assert!(fixture.store.load().await.unwrap().is_none(), "plan must not write state");

        let result = reconciler.apply(PlanMode::Apply, &CancellationSignal::new()).await.unwrap();
        assert!(result.report.is_success());
        assert_eq!(result.state.live_entries().count(), 9);
        assert_eq!(
            result.state.entry(&instance()).unwrap().attributes["ami"],
            json!("ami-0a1b2c3d4e5f60002")
        );
        assert!(result.state.data.contains_key("data.aws_ami.ubuntu"));

        let ip = result.outputs.get("instance_public_ip").unwrap();
        assert!(ip.value().and_then(|v| v.as_str()).is_some_and(|v| v.starts_with("54.")));
        assert!(result.outputs.is_sensitive("private_key_pem"));

        let replan = reconciler.plan(PlanMode::Apply).await.unwrap();
        assert!(!replan.has_changes());

        let stored = reconciler.outputs().await.unwrap();
        assert_eq!(stored.get("instance_public_ip"), Some(ip));
    }

    #[tokio::test]
    async fn test_variable_change_updates_in_place() {
        let fixture = Fixture::new();
        fixture
            .reconciler(TEMPLATE, &[])
            .unwrap()
            .apply(PlanMode::Apply, &CancellationSignal::new())
            .await
            .unwrap();

        let reconciler = fixture.reconciler(TEMPLATE, &[("instance_type", "t3.large")]).unwrap();
        let plan = reconciler.plan(PlanMode::Apply).await.unwrap();
        let summary = plan.summary();
        assert_eq!((summary.update, summary.replace, summary.create), (1, 0, 0));
        let update = plan.position(&instance(), ActionKind::Update).unwrap();
        assert_eq!(plan.actions[update].changed, vec!["instance_type", "tags"]);

        let result = reconciler.apply(PlanMode::Apply, &CancellationSignal::new()).await.unwrap();
        assert!(result.report.is_success());
        assert_eq!(
            fixture.provider.calls_for(&instance()),
            vec![ProviderOperation::Create, ProviderOperation::Update]
        );
    }

    #[tokio::test]
    async fn test_instance_failure_leaves_output_unavailable() {
        let fixture = Fixture::new();
        fixture.provider.fail_on(&instance(), ProviderOperation::Create);
        let reconciler = fixture.reconciler(TEMPLATE, &[]).unwrap();

        let result = reconciler.apply(PlanMode::Apply, &CancellationSignal::new()).await.unwrap();
        assert_eq!(result.report.failed(), 1);
        assert_eq!(result.report.succeeded(), 8);
        assert_eq!(result.state.entry(&instance()).unwrap().status, EntryStatus::Failed);
        assert!(!result.state.history[0].success);

        match result.outputs.get("instance_public_ip").unwrap() {
            OutputValue::Unavailable { reason } => assert!(reason.contains("failed")),
            other => panic!("expected unavailable, got {other:?}"),
        }
        assert!(result.outputs.get("private_key_pem").unwrap().is_available());

        fixture.provider.clear_failures();
        let retry = reconciler.plan(PlanMode::Apply).await.unwrap();
        assert_eq!(retry.summary().create, 1);
    }

    #[tokio::test]
    async fn test_failed_update_hides_stored_output() {
        let fixture = Fixture::new();
        fixture
            .reconciler(TEMPLATE, &[])
            .unwrap()
            .apply(PlanMode::Apply, &CancellationSignal::new())
            .await
            .unwrap();

        fixture.provider.fail_on(&instance(), ProviderOperation::Update);
        let reconciler = fixture.reconciler(TEMPLATE, &[("instance_type", "t3.large")]).unwrap();
        let result = reconciler.apply(PlanMode::Apply, &CancellationSignal::new()).await.unwrap();
        assert_eq!(result.report.failed(), 1);

        let entry = result.state.entry(&instance()).unwrap();
        assert_eq!(entry.status, EntryStatus::Failed);
        assert!(entry.provider_id.is_some());

        let stored = reconciler.outputs().await.unwrap();
        match stored.get("instance_public_ip").unwrap() {
            OutputValue::Unavailable { reason } => {
                assert!(reason.starts_with("aws_instance.web failed"), "{reason}");
            }
            other => panic!("expected unavailable, got {other:?}"),
        }
        assert!(stored.get("private_key_pem").unwrap().is_available());
    }

    #[tokio::test]
    async fn test_destroy_empties_state() {
        let fixture = Fixture::new();
        let reconciler = fixture.reconciler(TEMPLATE, &[]).unwrap();
        reconciler.apply(PlanMode::Apply, &CancellationSignal::new()).await.unwrap();

        let result = reconciler.apply(PlanMode::Destroy, &CancellationSignal::new()).await.unwrap();
        assert!(result.report.is_success());
        assert_eq!(result.report.outcomes[0].resource, instance());
        assert!(result.state.entries.is_empty());
        assert!(fixture.provider.objects().await.is_empty());
        assert_eq!(result.state.history.len(), 2);
        assert_eq!(result.state.history[1].operation, RunOperation::Destroy);
    }

    #[tokio::test]
    async fn test_removed_resource_is_destroyed() {
        let fixture = Fixture::new();
        let yaml = r"
project:
  name: demo
resources:
  aws_vpc:
    main:
      cidr_block: 10.0.0.0/16
  aws_security_group:
    old:
      vpc_id: ${aws_vpc.main.id}
";
        fixture
            .reconciler(yaml, &[])
            .unwrap()
            .apply(PlanMode::Apply, &CancellationSignal::new())
            .await
            .unwrap();

        let trimmed = yaml.split("  aws_security_group:").next().unwrap();
        let result = fixture
            .reconciler(trimmed, &[])
            .unwrap()
            .apply(PlanMode::Apply, &CancellationSignal::new())
            .await
            .unwrap();

        let sg = ResourceId::managed("aws_security_group", "old");
        let outcome = result.report.outcome(&sg, ActionKind::Destroy).unwrap();
        assert_eq!(outcome.status, ActionStatus::Succeeded);
        assert!(result.state.entry(&sg).is_none());
        assert_eq!(result.state.entries.len(), 1);
    }

    #[tokio::test]
    async fn test_cycle_is_rejected_before_any_call() {
        let fixture = Fixture::new();
        let yaml = r"
project:
  name: demo
resources:
  aws_security_group:
    x:
      description: ${aws_security_group.y.id}
    y:
      description: ${aws_security_group.x.id}
";
        let err = fixture.reconciler(yaml, &[]).unwrap_err();
        match err {
            TerraceError::Config(ConfigError::CyclicDependency { resources }) => {
                assert!(resources.contains(&String::from("aws_security_group.x")));
                assert!(resources.contains(&String::from("aws_security_group.y")));
            }
            other => panic!("expected cycle error, got {other}"),
        }
        assert!(fixture.provider.calls().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_run_is_refused() {
        let fixture = Fixture::new();
        let reconciler = fixture.reconciler(TEMPLATE, &[]).unwrap();
        let held = StateSession::open(Arc::clone(&fixture.store), "web-stack", "dev", "apply")
            .await
            .unwrap();

        let err = reconciler
            .apply(PlanMode::Apply, &CancellationSignal::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TerraceError::State(StateError::LockedByOther { .. })));
        assert!(fixture.provider.calls().is_empty());
        held.abandon().await.unwrap();
    }
}
