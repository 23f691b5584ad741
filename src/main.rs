//! Skyforge CLI entrypoint.
//!
//! This is the main entrypoint for the skyforge command-line tool.
//! Command output goes to stdout; logs and prompts go to stderr.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use skyforge::cli::{Cli, Commands, LogFormat, MessageStatus, OutputFormatter, StateCommands};
use skyforge::config::{
    ConfigParser, ConfigValidator, StackConfig, StateBackend, find_config_file,
};
use skyforge::error::{ConfigError, Result, SkyforgeError};
use skyforge::graph::{GraphBuilder, SchemaRegistry};
use skyforge::planner::{ExecutionOptions, RunContext};
use skyforge::provider::HttpProvider;
use skyforge::reconciler::{Reconciler, RunResult};
use skyforge::state::{LocalStateStore, S3StateStore, STATE_DIR, StateStore};

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Exit code for invalid documents and unsatisfiable plans.
const EXIT_VALIDATION: u8 = 2;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    init_logging(cli.verbose, cli.log_format);

    // Run async runtime
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(code) => code,
        Err(e) => {
            error!("{e}");
            eprintln!("Error: {e}");
            if e.is_validation() {
                ExitCode::from(EXIT_VALIDATION)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

/// Initializes the logging system.
fn init_logging(verbose: bool, format: LogFormat) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Main async entry point.
async fn run(cli: Cli) -> Result<ExitCode> {
    let formatter = OutputFormatter::new(cli.output);
    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Init { path, force } => cmd_init(&path, force, &formatter),
        Commands::Validate { warnings } => cmd_validate(config_path, warnings, &formatter),
        Commands::Plan { detailed } => cmd_plan(config_path, detailed, &formatter).await,
        Commands::Apply {
            yes,
            parallelism,
            continue_on_error,
        } => {
            cmd_apply(
                config_path,
                yes,
                parallelism,
                continue_on_error,
                &formatter,
            )
            .await
        }
        Commands::Destroy { yes } => cmd_destroy(config_path, yes, &formatter).await,
        Commands::Outputs => cmd_outputs(config_path, &formatter).await,
        Commands::State { command } => cmd_state(config_path, command, &formatter).await,
    }
}

/// Initialize a new stack.
fn cmd_init(path: &Path, force: bool, formatter: &OutputFormatter) -> Result<ExitCode> {
    info!("Initializing new Skyforge stack in: {}", path.display());

    let config_path = path.join("skyforge.stack.yaml");
    let env_path = path.join(".env.example");
    let gitignore_path = path.join(".gitignore");

    // Check if files exist
    if !force && config_path.exists() {
        emit(&formatter.format_message(
            MessageStatus::Warning,
            &format!(
                "Stack document already exists: {} (use --force to overwrite)",
                config_path.display()
            ),
        ))?;
        return Ok(ExitCode::SUCCESS);
    }

    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }

    std::fs::write(&config_path, include_str!("../templates/skyforge.stack.yaml"))?;
    eprintln!("Created: {}", config_path.display());

    std::fs::write(&env_path, include_str!("../templates/.env.example"))?;
    eprintln!("Created: {}", env_path.display());

    let state_entry = format!("{STATE_DIR}/");
    if gitignore_path.exists() {
        let existing = std::fs::read_to_string(&gitignore_path)?;
        let has_env = existing.lines().any(|l| l.trim() == ".env");
        let has_state = existing.lines().any(|l| l.trim() == state_entry);
        if !has_env || !has_state {
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(&gitignore_path)?;
            writeln!(file, "\n# Skyforge")?;
            if !has_env {
                writeln!(file, ".env")?;
            }
            if !has_state {
                writeln!(file, "{state_entry}")?;
            }
            eprintln!("Updated: {}", gitignore_path.display());
        }
    } else {
        std::fs::write(&gitignore_path, format!(".env\n{state_entry}\n"))?;
        eprintln!("Created: {}", gitignore_path.display());
    }

    eprintln!("\nNext steps:");
    eprintln!("  1. Copy .env.example to .env and set the provider endpoint and token");
    eprintln!("  2. Declare your resources in skyforge.stack.yaml");
    eprintln!("  3. Run 'skyforge validate' to check the document");
    eprintln!("  4. Run 'skyforge plan' to see what will change");
    eprintln!("  5. Run 'skyforge apply' to provision");

    emit(&formatter.format_message(MessageStatus::Success, "Stack initialized"))?;
    Ok(ExitCode::SUCCESS)
}

/// Validate the stack document and build its graph.
fn cmd_validate(
    config_path: Option<&Path>,
    show_warnings: bool,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let (config, _) = load_config(config_path)?;
    let result = ConfigValidator::new().validate(&config)?;

    let schemas = SchemaRegistry::with_overrides(&config.kinds);
    let graph = GraphBuilder::new(&schemas).build(&config)?;

    if show_warnings {
        for warning in &result.warnings {
            warn!("{warning}");
            eprintln!("  - {warning}");
        }
    }

    emit(&formatter.format_message(
        MessageStatus::Success,
        &format!(
            "Stack {}/{} is valid: {} resources, {} dependencies, {} warnings",
            config.project.name,
            config.project.environment,
            graph.len(),
            graph.edges().len(),
            result.warnings.len()
        ),
    ))?;
    Ok(ExitCode::SUCCESS)
}

/// Show the execution plan.
async fn cmd_plan(
    config_path: Option<&Path>,
    detailed: bool,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let (config, store) = load_config_and_state(config_path).await?;
    let reconciler = Reconciler::new(&config, store.as_ref());

    let plan = reconciler.plan().await?;
    emit(&formatter.format_plan(&plan, detailed))?;
    Ok(ExitCode::SUCCESS)
}

/// Apply the execution plan.
async fn cmd_apply(
    config_path: Option<&Path>,
    auto_approve: bool,
    parallelism: Option<u8>,
    continue_on_error: bool,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let (config, store) = load_config_and_state(config_path).await?;
    let provider = HttpProvider::from_config(&config.provider)?;
    let reconciler = Reconciler::new(&config, store.as_ref()).with_provider(&provider);

    let plan = reconciler.plan().await?;
    emit(&formatter.format_plan(&plan, false))?;
    if plan.is_empty() {
        return Ok(ExitCode::SUCCESS);
    }

    if !auto_approve && !confirm("Do you want to apply this plan? [y/N]: ", "y")? {
        eprintln!("Apply cancelled.");
        return Ok(ExitCode::SUCCESS);
    }

    let mut options = ExecutionOptions::from(&config.execution);
    if let Some(parallelism) = parallelism {
        options.parallelism = usize::from(parallelism);
    }
    options.continue_on_error |= continue_on_error;

    let ctx = run_context(options);
    let result = reconciler.apply(&ctx).await?;
    finish_run(&result, formatter)
}

/// Destroy every recorded resource.
async fn cmd_destroy(
    config_path: Option<&Path>,
    auto_approve: bool,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let (config, store) = load_config_and_state(config_path).await?;
    let provider = HttpProvider::from_config(&config.provider)?;
    let reconciler = Reconciler::new(&config, store.as_ref()).with_provider(&provider);

    let plan = reconciler.plan_destroy().await?;
    if plan.is_empty() {
        emit(&formatter.format_message(MessageStatus::Success, "No resources to destroy."))?;
        return Ok(ExitCode::SUCCESS);
    }
    emit(&formatter.format_plan(&plan, false))?;

    if !auto_approve
        && !confirm(
            "\nThis action is IRREVERSIBLE. Type 'destroy' to confirm: ",
            "destroy",
        )?
    {
        eprintln!("Destruction cancelled.");
        return Ok(ExitCode::SUCCESS);
    }

    let ctx = run_context(ExecutionOptions::from(&config.execution));
    let result = reconciler.destroy(&ctx).await?;
    finish_run(&result, formatter)
}

/// Show the stack outputs.
async fn cmd_outputs(config_path: Option<&Path>, formatter: &OutputFormatter) -> Result<ExitCode> {
    let (config, store) = load_config_and_state(config_path).await?;
    let outputs = Reconciler::new(&config, store.as_ref()).outputs().await?;
    emit(&formatter.format_outputs(&outputs))?;
    Ok(ExitCode::SUCCESS)
}

/// State management commands.
async fn cmd_state(
    config_path: Option<&Path>,
    command: StateCommands,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let (_config, store) = load_config_and_state(config_path).await?;

    match command {
        StateCommands::Show => {
            if store.exists().await? {
                let state = store.load().await?;
                emit(&formatter.format_state(&state))?;
            } else {
                emit(&formatter.format_message(MessageStatus::Warning, "No state found."))?;
            }
        }
        StateCommands::Lock { holder } => {
            let lock = store.acquire_lock(holder.as_deref().unwrap_or("")).await?;
            emit(&formatter.format_lock(&lock))?;
        }
        StateCommands::Unlock { lock_id, force } => {
            if force {
                store.force_unlock().await?;
                emit(&formatter.format_message(MessageStatus::Success, "State forcefully unlocked."))?;
            } else if let Some(id) = lock_id {
                store.release_lock(&id).await?;
                emit(&formatter.format_message(MessageStatus::Success, "State unlocked."))?;
            } else {
                emit(&formatter.format_message(
                    MessageStatus::Error,
                    "Please provide --lock-id or use --force",
                ))?;
                return Ok(ExitCode::FAILURE);
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Writes command output to stdout.
fn emit(text: &str) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(text.as_bytes())?;
    stdout.flush()?;
    Ok(())
}

/// Prompts on stderr and compares the answer with `expected`.
fn confirm(prompt: &str, expected: &str) -> Result<bool> {
    eprint!("{prompt}");
    std::io::stderr().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case(expected))
}

/// Creates the run context and cancels it on Ctrl-C.
fn run_context(options: ExecutionOptions) -> RunContext {
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing in-flight operations");
            on_signal.cancel();
        }
    });
    RunContext::new(options).with_cancel(cancel)
}

/// Prints a run result and maps its outcome to an exit code.
fn finish_run(result: &RunResult, formatter: &OutputFormatter) -> Result<ExitCode> {
    emit(&formatter.format_run(result))?;
    Ok(if result.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Resolves the stack document path.
fn resolve_config_path(config_path: Option<&Path>) -> Result<PathBuf> {
    match config_path {
        Some(path) => Ok(path.to_path_buf()),
        None => {
            let cwd = std::env::current_dir().map_err(|e| {
                SkyforgeError::internal(format!("Cannot determine current directory: {e}"))
            })?;
            find_config_file(cwd)
        }
    }
}

/// Loads `.env`, the stack document and environment overrides.
fn load_config(config_path: Option<&Path>) -> Result<(StackConfig, PathBuf)> {
    let config_file = resolve_config_path(config_path)?;
    debug!("Loading stack document from: {}", config_file.display());

    let base_dir = config_file
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();
    let parser = ConfigParser::new().with_base_path(&base_dir);
    parser.load_dotenv()?;

    let config = parser.load_with_env(&config_file)?;
    Ok((config, base_dir))
}

/// Loads and validates the stack document and opens its state store.
async fn load_config_and_state(
    config_path: Option<&Path>,
) -> Result<(StackConfig, Box<dyn StateStore>)> {
    let (config, base_dir) = load_config(config_path)?;
    ConfigValidator::new().validate(&config)?;

    let store: Box<dyn StateStore> = match config.state.backend {
        StateBackend::Local => {
            let dir = config
                .state
                .path
                .as_ref()
                .map_or_else(|| base_dir.join(STATE_DIR), |p| base_dir.join(p));
            Box::new(LocalStateStore::with_base_dir(dir))
        }
        StateBackend::S3 => {
            let bucket = config.state.bucket.as_deref().ok_or_else(|| {
                ConfigError::invalid("state.bucket", "required for the s3 backend")
            })?;
            let prefix = config.state.prefix.as_deref();
            let region = config.state.region.as_deref();
            Box::new(S3StateStore::new(bucket, prefix, region).await)
        }
    };
    debug!("Using {} state backend", store.backend_type());

    Ok((config, store))
}
