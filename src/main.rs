//! ecs-deploy CLI entrypoint.
//!
//! This is the main entrypoint for the ecs-deploy command-line tool.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use ecs_deploy::aws::{AwsCloud, CloudApi, StateObserver};
use ecs_deploy::cli::{Cli, Commands, LogFormat, OutputFormatter, RunArgs, StateCommands};
use ecs_deploy::config::{
    ConvergenceSpec, DEFAULT_SPEC_FILES, DeploymentSpec, SpecLoader, SpecValidator, find_spec_file,
};
use ecs_deploy::error::{CloudError, Result};
use ecs_deploy::planner::PlanMode;
use ecs_deploy::progress::{JsonProgress, ProgressReporter, TextProgress};
use ecs_deploy::reconciler::{RunKind, RunOutcome, Reconciler};
use ecs_deploy::state::{self, StateStore};
use ecs_deploy::status::{ConvergenceOutcome, HttpProbe, StatusReporter};

use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Exit code of a run that timed out waiting for convergence.
const EXIT_TIMED_OUT: u8 = 3;

/// Exit code after Ctrl-C.
const EXIT_INTERRUPTED: u8 = 130;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse_args();

    init_logging(cli.verbose, cli.log_format);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    runtime.block_on(async {
        tokio::select! {
            code = run(cli) => code,
            _ = tokio::signal::ctrl_c() => {
                eprintln!("\nInterrupted. A held run lock expires on its own or can be removed with `ecs-deploy state unlock`.");
                ExitCode::from(EXIT_INTERRUPTED)
            }
        }
    })
}

/// Initializes the logging system.
///
/// `RUST_LOG` wins over the default level unless `--verbose` is given.
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
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

/// Main async entry point.
async fn run(cli: Cli) -> ExitCode {
    let formatter = OutputFormatter::new(cli.output);

    match dispatch(&cli, formatter).await {
        Ok(code) => code,
        Err(e) => {
            debug!("Command failed: {e:?}");
            emit(formatter, &formatter.format_error(&e));
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(cli: &Cli, formatter: OutputFormatter) -> Result<ExitCode> {
    match &cli.command {
        Commands::Init { path, force } => cmd_init(path, *force),
        Commands::Validate { spec } => cmd_validate(cli, spec.as_deref(), formatter),
        Commands::Plan { spec } => cmd_plan(cli, spec.as_deref(), formatter).await,
        Commands::Deploy { spec, run } => {
            cmd_run(cli, spec.as_deref(), *run, RunKind::Deploy, formatter).await
        }
        Commands::Update { spec, run } => {
            cmd_run(cli, spec.as_deref(), *run, RunKind::Update, formatter).await
        }
        Commands::Status {
            cluster,
            service,
            wait,
            probe,
            timeout,
            ..
        } => {
            let settings = cli.command.convergence();
            let timeout = Duration::from_secs(*timeout);
            let reporter = status_reporter(cli, cluster, service, *probe, &settings).await?;
            if *wait {
                cmd_status_wait(reporter, cluster, service, timeout, formatter).await
            } else {
                cmd_status(&reporter, cluster, service, formatter).await
            }
        }
        Commands::Teardown {
            cluster,
            service,
            yes,
        } => cmd_teardown(cli, cluster, service, *yes, formatter).await,
        Commands::State { command } => cmd_state(cli, command, formatter).await,
    }
}

/// Write a starter descriptor and `.env` example.
fn cmd_init(path: &Path, force: bool) -> Result<ExitCode> {
    info!("Initializing deployment descriptor in: {}", path.display());

    let spec_path = path.join(DEFAULT_SPEC_FILES[0]);
    let env_path = path.join(".env.example");
    let gitignore_path = path.join(".gitignore");

    if !force && spec_path.exists() {
        eprintln!("Descriptor already exists: {}", spec_path.display());
        eprintln!("Use --force to overwrite.");
        return Ok(ExitCode::FAILURE);
    }

    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }

    std::fs::write(&spec_path, include_str!("../templates/ecs-deploy.yaml"))?;
    eprintln!("Created: {}", spec_path.display());

    std::fs::write(&env_path, include_str!("../templates/.env.example"))?;
    eprintln!("Created: {}", env_path.display());

    let ignored = [".env", ".ecs-deploy/"];
    if gitignore_path.exists() {
        let existing = std::fs::read_to_string(&gitignore_path)?;
        let missing: Vec<&str> = ignored
            .iter()
            .copied()
            .filter(|entry| !existing.lines().any(|line| line.trim() == *entry))
            .collect();
        if !missing.is_empty() {
            let mut file = std::fs::OpenOptions::new().append(true).open(&gitignore_path)?;
            writeln!(file, "\n# ecs-deploy")?;
            for entry in missing {
                writeln!(file, "{entry}")?;
            }
            eprintln!("Updated: {}", gitignore_path.display());
        }
    } else {
        std::fs::write(&gitignore_path, format!("{}\n", ignored.join("\n")))?;
        eprintln!("Created: {}", gitignore_path.display());
    }

    eprintln!("\nNext steps:");
    eprintln!("  1. Copy .env.example to .env and set your values");
    eprintln!("  2. Edit {} for your service", DEFAULT_SPEC_FILES[0]);
    eprintln!("  3. Run 'ecs-deploy validate' to check it");
    eprintln!("  4. Run 'ecs-deploy plan' to see what will change");
    eprintln!("  5. Run 'ecs-deploy deploy' to roll it out");

    Ok(ExitCode::SUCCESS)
}

/// Validate a descriptor without touching AWS.
fn cmd_validate(cli: &Cli, spec_path: Option<&Path>, formatter: OutputFormatter) -> Result<ExitCode> {
    let (path, spec) = load_spec(cli, spec_path)?;
    let result = SpecValidator::new().check(&spec);

    emit(formatter, &formatter.format_validation(&path.display().to_string(), &result));
    Ok(if result.is_valid() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Show what a deploy would change.
async fn cmd_plan(cli: &Cli, spec_path: Option<&Path>, formatter: OutputFormatter) -> Result<ExitCode> {
    let (_, spec) = load_spec(cli, spec_path)?;
    let reconciler = reconciler(cli, &spec).await?;

    let (plan, _) = reconciler.plan(&spec, PlanMode::Deploy).await?;
    emit(formatter, &formatter.format_plan(&spec.qualified_name(), &plan));
    Ok(ExitCode::SUCCESS)
}

/// Deploy or update.
async fn cmd_run(
    cli: &Cli,
    spec_path: Option<&Path>,
    args: RunArgs,
    kind: RunKind,
    formatter: OutputFormatter,
) -> Result<ExitCode> {
    let (_, mut spec) = load_spec(cli, spec_path)?;
    if args.continue_on_error {
        spec.rollout.continue_on_error = true;
    }

    let mut reconciler = reconciler(cli, &spec)
        .await?
        .with_progress(progress(formatter))
        .wait_for_convergence(!args.no_wait);
    if args.probe {
        reconciler = reconciler.with_probe(HttpProbe::new()?);
    }

    let outcome = match kind {
        RunKind::Update => reconciler.update(&spec).await,
        RunKind::Deploy | RunKind::Teardown => reconciler.deploy(&spec).await,
    };
    Ok(report(formatter, &spec.qualified_name(), &outcome))
}

/// One-shot service status.
async fn cmd_status(
    reporter: &StatusReporter,
    cluster: &str,
    service: &str,
    formatter: OutputFormatter,
) -> Result<ExitCode> {
    match reporter.snapshot(cluster, service).await? {
        Some(snapshot) => {
            emit(formatter, &formatter.format_snapshot(&snapshot));
            Ok(ExitCode::SUCCESS)
        }
        None => Err(CloudError::not_found(
            "DescribeServices",
            format!("service {service} not found in cluster {cluster}"),
        )
        .into()),
    }
}

/// Poll until the service converges.
async fn cmd_status_wait(
    reporter: StatusReporter,
    cluster: &str,
    service: &str,
    timeout: Duration,
    formatter: OutputFormatter,
) -> Result<ExitCode> {
    let outcome = reporter
        .with_progress(progress(formatter))
        .wait(cluster, service, timeout)
        .await?;

    emit(formatter, &formatter.format_convergence(&outcome));
    Ok(match outcome {
        ConvergenceOutcome::Succeeded(_) => ExitCode::SUCCESS,
        ConvergenceOutcome::TimedOut { .. } => ExitCode::from(EXIT_TIMED_OUT),
        ConvergenceOutcome::Degraded { .. } => ExitCode::FAILURE,
    })
}

/// Delete a service and the resources created for it.
async fn cmd_teardown(
    cli: &Cli,
    cluster: &str,
    service: &str,
    auto_approve: bool,
    formatter: OutputFormatter,
) -> Result<ExitCode> {
    let target = format!("{cluster}/{service}");
    let api = cloud(cli.region.as_deref()).await;
    let store = state::open(&cli.state_settings(None)).await?;
    let reconciler = Reconciler::new(api, store).with_progress(progress(formatter));

    let plan = reconciler.teardown_plan(cluster, service).await?;
    if plan.is_empty() {
        emit(formatter, &formatter.format_message("success", &format!("Nothing to tear down for {target}")));
        return Ok(ExitCode::SUCCESS);
    }
    emit(formatter, &formatter.format_plan(&target, &plan));

    if !auto_approve {
        eprint!("\nThis deletes the resources above. Type '{service}' to confirm: ");
        std::io::stderr().flush()?;

        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;

        if input.trim() != service {
            eprintln!("Teardown cancelled.");
            return Ok(ExitCode::FAILURE);
        }
    }

    let outcome = reconciler.teardown(cluster, service).await;
    Ok(report(formatter, &target, &outcome))
}

/// State management.
async fn cmd_state(cli: &Cli, command: &StateCommands, formatter: OutputFormatter) -> Result<ExitCode> {
    let store = state::open(&cli.state_settings(None)).await?;
    debug!("Using {} state backend", store.backend_type());

    match command {
        StateCommands::Show { cluster, service } => {
            let lock = store.lock_info(cluster).await?;
            match store.load(cluster, service).await? {
                Some(record) => emit(formatter, &formatter.format_record(&record, lock.as_ref())),
                None => emit(
                    formatter,
                    &formatter.format_message("warning", &format!("No state recorded for {cluster}/{service}")),
                ),
            }
        }
        StateCommands::Unlock { cluster } => {
            let message = match store.force_unlock(cluster).await? {
                Some(lock) => {
                    warn!("Removed run lock of {cluster} held by {}", lock.holder);
                    format!("Removed lock held by {} since {}", lock.holder, lock.acquired_at)
                }
                None => format!("No lock held on {cluster}"),
            };
            emit(formatter, &formatter.format_message("success", &message));
        }
    }

    Ok(ExitCode::SUCCESS)
}

// ============================================================================
// Helpers
// ============================================================================

/// Resolves and loads the descriptor; `--region` overrides its region.
fn load_spec(cli: &Cli, spec_path: Option<&Path>) -> Result<(PathBuf, DeploymentSpec)> {
    let path = match spec_path {
        Some(path) => path.to_path_buf(),
        None => find_spec_file(".")?,
    };
    info!("Loading descriptor: {}", path.display());

    let mut spec = SpecLoader::for_file(&path).load(&path)?;
    if cli.region.is_some() {
        spec.region.clone_from(&cli.region);
    }
    Ok((path, spec))
}

async fn cloud(region: Option<&str>) -> Arc<dyn CloudApi> {
    Arc::new(AwsCloud::new(region).await)
}

async fn reconciler(cli: &Cli, spec: &DeploymentSpec) -> Result<Reconciler> {
    let api = cloud(spec.region.as_deref()).await;
    let store: Arc<dyn StateStore> = state::open(&cli.state_settings(Some(&spec.state))).await?;
    Ok(Reconciler::new(api, store))
}

async fn status_reporter(
    cli: &Cli,
    cluster: &str,
    service: &str,
    probe: bool,
    settings: &ConvergenceSpec,
) -> Result<StatusReporter> {
    let api = cloud(cli.region.as_deref()).await;
    let reporter = StatusReporter::new(api.clone(), settings);
    if !probe {
        return Ok(reporter);
    }

    let observed = StateObserver::new(api).discover(cluster, service).await?;
    match HttpProbe::url_for_observed(&observed) {
        Some(url) => Ok(reporter.with_probe(HttpProbe::new()?, url)),
        None => {
            warn!("No load balancer listener found for {cluster}/{service}, skipping probe");
            Ok(reporter)
        }
    }
}

fn progress(formatter: OutputFormatter) -> Arc<dyn ProgressReporter> {
    if formatter.is_json() {
        Arc::new(JsonProgress::stdout())
    } else {
        Arc::new(TextProgress)
    }
}

fn report(formatter: OutputFormatter, target: &str, outcome: &RunOutcome) -> ExitCode {
    emit(formatter, &formatter.format_outcome(target, outcome));
    u8::try_from(outcome.exit_code()).map_or(ExitCode::FAILURE, ExitCode::from)
}

/// JSON goes to stdout for piping; text goes to stderr next to the logs.
fn emit(formatter: OutputFormatter, text: &str) {
    if formatter.is_json() {
        let mut out = std::io::stdout().lock();
        let _ = out.write_all(text.as_bytes());
        let _ = out.flush();
    } else {
        eprint!("{text}");
    }
}
