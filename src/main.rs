//! Terrace CLI entrypoint.
//!
//! This is the main entrypoint for the terrace command-line tool.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use terrace::cli::{Cli, Commands, OutputFormat, OutputFormatter, StateCommands};
use terrace::config::{find_config_file, ConfigParser, ConfigValidator, TerraceConfig};
use terrace::error::{Result, TerraceError};
use terrace::graph::DependencyGraph;
use terrace::model::{ResourceModel, VariableOverrides};
use terrace::planner::{CancellationSignal, PlanMode};
use terrace::provider;
use terrace::reconciler::Reconciler;
use terrace::state::{generate_holder_id, local_state_dir, open_store, StateDocument, StateStore};

use clap::Parser;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initializes the logging system.
///
/// `RUST_LOG` wins when set; otherwise `--verbose` selects debug.
fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Main async entry point. Returns false when a run did not fully succeed.
async fn run(cli: Cli) -> Result<bool> {
    let formatter = OutputFormatter::new(cli.output);

    match &cli.command {
        Commands::Init { path, force } => cmd_init(path, *force).map(|()| true),
        Commands::Validate { warnings } => cmd_validate(&cli, *warnings, &formatter),
        Commands::Plan { destroy, detailed } => {
            let mode = if *destroy { PlanMode::Destroy } else { PlanMode::Apply };
            cmd_plan(&cli, mode, *detailed, &formatter).await.map(|()| true)
        }
        Commands::Apply => cmd_run(&cli, PlanMode::Apply, &formatter).await,
        Commands::Destroy => cmd_run(&cli, PlanMode::Destroy, &formatter).await,
        Commands::Output {
            name,
            show_sensitive,
        } => cmd_output(&cli, name.as_deref(), *show_sensitive, &formatter)
            .await
            .map(|()| true),
        Commands::State { command } => cmd_state(&cli, command, &formatter).await.map(|()| true),
        Commands::Graph => cmd_graph(&cli, &formatter).await.map(|()| true),
    }
}

/// Initialize a new project.
fn cmd_init(path: &Path, force: bool) -> Result<()> {
    info!("Initializing new Terrace project in: {}", path.display());

    let config_path = path.join("terrace.yaml");
    let env_path = path.join(".env.example");
    let gitignore_path = path.join(".gitignore");

    if !force && config_path.exists() {
        eprintln!("Configuration file already exists: {}", config_path.display());
        eprintln!("Use --force to overwrite.");
        return Ok(());
    }

    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }

    std::fs::write(&config_path, include_str!("../templates/terrace.yaml"))?;
    eprintln!("Created: {}", config_path.display());

    std::fs::write(&env_path, include_str!("../.env.example"))?;
    eprintln!("Created: {}", env_path.display());

    if gitignore_path.exists() {
        let existing = std::fs::read_to_string(&gitignore_path)?;
        let missing: Vec<&str> = [".env", ".terrace/"]
            .into_iter()
            .filter(|entry| !existing.lines().any(|line| line.trim() == *entry))
            .collect();
        if !missing.is_empty() {
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(&gitignore_path)?;
            writeln!(file, "\n# Terrace")?;
            for entry in missing {
                writeln!(file, "{entry}")?;
            }
            eprintln!("Updated: {}", gitignore_path.display());
        }
    } else {
        std::fs::write(&gitignore_path, ".env\n.terrace/\n")?;
        eprintln!("Created: {}", gitignore_path.display());
    }

    eprintln!("\nProject initialized successfully!");
    eprintln!("Next steps:");
    eprintln!("  1. Edit terrace.yaml with your resources");
    eprintln!("  2. Run 'terrace validate' to check your configuration");
    eprintln!("  3. Run 'terrace plan' to see what will change");
    eprintln!("  4. Run 'terrace apply' to converge");

    Ok(())
}

/// Validate configuration without touching state or the provider.
fn cmd_validate(cli: &Cli, show_warnings: bool, formatter: &OutputFormatter) -> Result<bool> {
    let config_file = resolve_config_path(cli.config.as_ref())?;
    info!("Validating configuration: {}", config_file.display());

    let parser = ConfigParser::new().with_base_path(base_dir(&config_file));
    parser.load_dotenv()?;
    let config = parser.load_with_env(&config_file)?;

    let result = ConfigValidator::new().check(&config);
    emit(&formatter.format_validation(&result, show_warnings))?;

    if result.is_valid() {
        // Resolves references and rejects dependency cycles.
        let model = ResourceModel::build(&config, &variable_overrides(cli)?)?;
        DependencyGraph::build(&model.resources)?;
        if !formatter.is_json() {
            eprintln!(
                "\n{}: {} resources, {} outputs",
                config.qualified_name(),
                model.resources.len(),
                model.outputs.len()
            );
        }
    }

    Ok(result.is_valid())
}

/// Show what a run would change.
async fn cmd_plan(
    cli: &Cli,
    mode: PlanMode,
    detailed: bool,
    formatter: &OutputFormatter,
) -> Result<()> {
    let (reconciler, _) = build_reconciler(cli).await?;
    let plan = reconciler.plan(mode).await?;
    emit(&formatter.format_plan(&plan, detailed))
}

/// Apply or destroy.
async fn cmd_run(cli: &Cli, mode: PlanMode, formatter: &OutputFormatter) -> Result<bool> {
    let (reconciler, config) = build_reconciler(cli).await?;

    if !cli.yes {
        let plan = reconciler.plan(mode).await?;
        if !plan.has_changes() {
            emit(&formatter.format_plan(&plan, false))?;
            return Ok(true);
        }
        eprintln!("{}", OutputFormatter::new(OutputFormat::Text).format_plan(&plan, false));

        let prompt = match mode {
            PlanMode::Apply => "Do you want to apply this plan? [y/N]: ",
            PlanMode::Destroy => "This will destroy every recorded resource. Continue? [y/N]: ",
        };
        if !confirm(prompt)? {
            eprintln!("Cancelled.");
            return Ok(true);
        }
    }

    let cancel = CancellationSignal::new();
    let interrupt = cancel.cancel_on_ctrl_c();
    let deadline = config
        .execution
        .timeout_secs
        .map(|secs| cancel.cancel_after(Duration::from_secs(secs)));

    let result = reconciler.apply(mode, &cancel).await;

    interrupt.abort();
    if let Some(deadline) = deadline {
        deadline.abort();
    }

    let result = result?;
    emit(&formatter.format_report(&result.report, &result.outputs, false))?;

    if let Err(e) = result.report.check() {
        warn!("{e}");
        return Ok(false);
    }
    Ok(true)
}

/// Show outputs from stored state.
async fn cmd_output(
    cli: &Cli,
    name: Option<&str>,
    show_sensitive: bool,
    formatter: &OutputFormatter,
) -> Result<()> {
    let (reconciler, _) = build_reconciler(cli).await?;
    let outputs = reconciler.outputs().await?;

    if let Some(name) = name {
        if outputs.get(name).is_none() {
            return Err(TerraceError::internal(format!("No output named '{name}'")));
        }
    }
    emit(&formatter.format_outputs(&outputs, name, show_sensitive))
}

/// State management commands.
async fn cmd_state(cli: &Cli, command: &StateCommands, formatter: &OutputFormatter) -> Result<()> {
    let (config, root) = load_config(cli)?;
    let store = open_store(&config.state, &root).await?;

    match command {
        StateCommands::Show => match store.load().await? {
            Some(state) => emit(&formatter.format_state(&state))?,
            None => eprintln!("No state found."),
        },
        StateCommands::List => {
            let state = store.load().await?.unwrap_or_else(|| {
                StateDocument::new(&config.project.name, &config.project.environment)
            });
            emit(&formatter.format_state_list(&state))?;
        }
        StateCommands::Lock { holder } => {
            let holder = holder.clone().unwrap_or_else(generate_holder_id);
            let lock = store.acquire_lock(&holder, "manual").await?;
            emit(&formatter.format_lock(&lock))?;
        }
        StateCommands::Unlock { lock_id, force } => {
            unlock(store.as_ref(), lock_id.as_deref(), *force).await?;
        }
    }

    Ok(())
}

/// Print the dependency graph.
async fn cmd_graph(cli: &Cli, formatter: &OutputFormatter) -> Result<()> {
    let (reconciler, _) = build_reconciler(cli).await?;
    emit(&formatter.format_graph(reconciler.graph()))
}

// ============================================================================
// Helper Functions
// ============================================================================

async fn unlock(store: &dyn StateStore, lock_id: Option<&str>, force: bool) -> Result<()> {
    if force {
        store.force_unlock().await?;
        eprintln!("State forcefully unlocked.");
    } else if let Some(id) = lock_id {
        store.release_lock(id).await?;
        eprintln!("State unlocked.");
    } else {
        eprintln!("Please provide --lock-id or use --force");
    }
    Ok(())
}

/// Resolves the configuration file path.
fn resolve_config_path(config_path: Option<&PathBuf>) -> Result<PathBuf> {
    config_path.map_or_else(|| find_config_file("."), |path| Ok(path.clone()))
}

fn base_dir(config_file: &Path) -> &Path {
    config_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

/// Loads and validates the configuration, applying command-line overrides.
fn load_config(cli: &Cli) -> Result<(TerraceConfig, PathBuf)> {
    let config_file = resolve_config_path(cli.config.as_ref())?;
    debug!("Loading configuration from: {}", config_file.display());

    let mut config = Reconciler::load_config(&config_file)?;
    if let Some(parallelism) = cli.parallelism {
        config.execution.parallelism = parallelism;
    }
    if let Some(timeout) = cli.timeout {
        config.execution.timeout_secs = Some(timeout);
    }
    Ok((config, base_dir(&config_file).to_path_buf()))
}

fn variable_overrides(cli: &Cli) -> Result<VariableOverrides> {
    Ok(VariableOverrides {
        cli: VariableOverrides::parse_assignments(&cli.vars)?,
        env: ConfigParser::env_variable_overrides(),
    })
}

/// Loads configuration, opens the state backend and creates the provider.
async fn build_reconciler(cli: &Cli) -> Result<(Reconciler, TerraceConfig)> {
    let (config, root) = load_config(cli)?;
    let store = open_store(&config.state, &root).await?;
    let provider = provider::from_config(
        &config.provider,
        config.project.region.as_deref(),
        &local_state_dir(&config.state, &root),
    )?;
    let reconciler = Reconciler::new(&config, &variable_overrides(cli)?, store, provider)?;
    Ok((reconciler, config))
}

/// Writes command output to stdout.
fn emit(text: &str) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(text.as_bytes())?;
    if !text.ends_with('\n') {
        stdout.write_all(b"\n")?;
    }
    stdout.flush()?;
    Ok(())
}

fn confirm(prompt: &str) -> Result<bool> {
    eprint!("{prompt}");
    std::io::stderr().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case("y"))
}
