//! Converge CLI entrypoint.
//!
//! The process exit code is the run's: 0 all PASS, 1 any WARN and no FAIL,
//! 2 any FAIL or an error that prevented a report.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use agent_converge::cli::{Cli, Commands, OutputFormatter, ReportCommands};
use agent_converge::config::{ConfigParser, ConfigValidator, ValidationError, find_config_file};
use agent_converge::control::{AgentControlPlane, CommandControlPlane};
use agent_converge::desired::DesiredStateStore;
use agent_converge::error::{ConvergeError, ReconcileError, Result};
use agent_converge::orchestrator::Orchestrator;
use agent_converge::report::{REPORT_DIR, open_store};

use clap::Parser;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Exit code for runs that could not produce a passing or warning report.
const EXIT_FAIL: u8 = 2;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::from(EXIT_FAIL);
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::from(EXIT_FAIL)
        }
    }
}

/// Initializes the logging system.
///
/// `--verbose` forces debug output; otherwise `RUST_LOG` is honoured.
fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Main async entry point.
async fn run(cli: Cli) -> Result<u8> {
    let formatter = OutputFormatter::new(cli.output);
    let config = cli.config.as_ref();

    match cli.command {
        Commands::Init { path, force } => cmd_init(&path, force),
        Commands::Validate { warnings } => cmd_validate(config, warnings, &formatter),
        Commands::Plan { teardown } => cmd_plan(config, teardown, &formatter).await,
        Commands::Apply => cmd_apply(config, &formatter).await,
        Commands::Verify => cmd_verify(config, &formatter).await,
        Commands::Teardown { yes } => cmd_teardown(config, yes, &formatter).await,
        Commands::Report { command } => cmd_report(config, command, &formatter).await,
    }
}

/// Writes a starter declaration.
fn cmd_init(path: &Path, force: bool) -> Result<u8> {
    info!("Initializing declaration in: {}", path.display());

    let config_path = path.join("converge.yaml");
    let gitignore_path = path.join(".gitignore");

    if !force && config_path.exists() {
        eprintln!("Declaration already exists: {}", config_path.display());
        eprintln!("Use --force to overwrite.");
        return Ok(0);
    }

    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }

    std::fs::write(&config_path, include_str!("../templates/converge.yaml"))?;
    eprintln!("Created: {}", config_path.display());

    let report_dir = format!("{REPORT_DIR}/");
    if gitignore_path.exists() {
        let existing = std::fs::read_to_string(&gitignore_path)?;
        let missing: Vec<&str> = [".env", report_dir.as_str()]
            .into_iter()
            .filter(|entry| !existing.lines().any(|line| line.trim() == *entry))
            .collect();
        if !missing.is_empty() {
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(&gitignore_path)?;
            writeln!(file, "\n# converge")?;
            for entry in missing {
                writeln!(file, "{entry}")?;
            }
            eprintln!("Updated: {}", gitignore_path.display());
        }
    } else {
        std::fs::write(&gitignore_path, format!(".env\n{report_dir}\n"))?;
        eprintln!("Created: {}", gitignore_path.display());
    }

    eprintln!("\nNext steps:");
    eprintln!("  1. Edit converge.yaml with your target and resources");
    eprintln!("  2. Run 'converge validate' to check the declaration");
    eprintln!("  3. Run 'converge plan' to see what would change");
    eprintln!("  4. Run 'converge apply' to converge the target");

    Ok(0)
}

/// Validates the declaration without touching the target.
fn cmd_validate(
    config_path: Option<&PathBuf>,
    show_warnings: bool,
    formatter: &OutputFormatter,
) -> Result<u8> {
    let config_file = resolve_config_path(config_path)?;
    info!("Validating declaration: {}", config_file.display());

    let base_dir = base_dir(&config_file);
    let parser = ConfigParser::new().with_base_path(&base_dir);
    parser.load_dotenv()?;
    let declaration = parser.load_with_env(&config_file)?;

    let mut result = ConfigValidator::new().check(&declaration);
    if result.is_valid() {
        let store = DesiredStateStore::from_declaration(declaration, &base_dir)?;
        if let Err(e) = store.apply_order() {
            result.errors.push(ValidationError {
                field: String::from("resources.depends_on"),
                message: e.to_string(),
            });
        }
    }

    println!("{}", formatter.format_validation(&result, show_warnings));
    Ok(if result.is_valid() { 0 } else { EXIT_FAIL })
}

/// Shows the actions an apply or teardown would take.
async fn cmd_plan(
    config_path: Option<&PathBuf>,
    teardown: bool,
    formatter: &OutputFormatter,
) -> Result<u8> {
    let (_, store) = load_store(config_path)?;
    let plane = control_plane(&store);

    let plan = Orchestrator::new(store, plane)?.plan(teardown).await?;
    println!("{}", formatter.format_plan(&plan));

    Ok(0)
}

/// Converges the target to the declared state.
async fn cmd_apply(config_path: Option<&PathBuf>, formatter: &OutputFormatter) -> Result<u8> {
    let orchestrator = orchestrator(config_path).await?;
    let report = orchestrator.apply().await?;

    println!("{}", formatter.format_report(&report));
    Ok(report.exit_code())
}

/// Probes the target and reports.
async fn cmd_verify(config_path: Option<&PathBuf>, formatter: &OutputFormatter) -> Result<u8> {
    let orchestrator = orchestrator(config_path).await?;
    let report = orchestrator.verify().await?;

    println!("{}", formatter.format_report(&report));
    Ok(report.exit_code())
}

/// Converges every declared resource to absent.
async fn cmd_teardown(
    config_path: Option<&PathBuf>,
    confirmed: bool,
    formatter: &OutputFormatter,
) -> Result<u8> {
    let orchestrator = orchestrator(config_path).await?;

    match orchestrator.teardown(confirmed).await {
        Ok(report) => {
            println!("{}", formatter.format_report(&report));
            Ok(report.exit_code())
        }
        Err(ConvergeError::Reconcile(ReconcileError::TeardownNotConfirmed { target })) => {
            eprintln!("Teardown removes every declared resource from '{target}'.");
            eprintln!("Re-run with --yes to confirm.");
            Ok(EXIT_FAIL)
        }
        Err(e) => Err(e),
    }
}

/// Report and lock commands.
async fn cmd_report(
    config_path: Option<&PathBuf>,
    command: ReportCommands,
    formatter: &OutputFormatter,
) -> Result<u8> {
    let (config_file, store) = load_store(config_path)?;
    let reports = open_store(store.report_config(), &config_file).await?;

    match command {
        ReportCommands::Show => {
            if let Some(report) = reports.load_last().await? {
                println!("{}", formatter.format_report(&report));
            } else {
                eprintln!("No report found.");
            }
            println!("{}", formatter.format_lock(reports.lock_info().await?.as_ref()));
        }
        ReportCommands::Unlock { lock_id, force } => {
            if force {
                reports.force_unlock().await?;
                eprintln!("Run lock forcefully removed.");
            } else if let Some(id) = lock_id {
                reports.release_lock(&id).await?;
                eprintln!("Run lock released.");
            } else {
                eprintln!("Please provide --lock-id or use --force");
                return Ok(EXIT_FAIL);
            }
        }
    }

    Ok(0)
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Resolves the declaration path.
fn resolve_config_path(config_path: Option<&PathBuf>) -> Result<PathBuf> {
    config_path.map_or_else(|| find_config_file("."), |path| Ok(path.clone()))
}

/// Directory of the declaration, for `.env` and payload sources.
fn base_dir(config_file: &Path) -> PathBuf {
    config_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
}

/// Loads and validates the declaration.
fn load_store(config_path: Option<&PathBuf>) -> Result<(PathBuf, DesiredStateStore)> {
    let config_file = resolve_config_path(config_path)?;
    debug!("Loading declaration from: {}", config_file.display());

    let store = DesiredStateStore::load(&config_file)?;
    Ok((config_file, store))
}

/// Builds the command-driven control plane for the declared target.
fn control_plane(store: &DesiredStateStore) -> Arc<dyn AgentControlPlane> {
    let timeout = Duration::from_secs(store.probe_settings().timeout_secs);
    Arc::new(CommandControlPlane::new(store.target()).with_timeout(timeout))
}

/// Builds an orchestrator with report persistence.
async fn orchestrator(config_path: Option<&PathBuf>) -> Result<Orchestrator> {
    let (config_file, store) = load_store(config_path)?;
    let reports = open_store(store.report_config(), &config_file).await?;
    let plane = control_plane(&store);

    Ok(Orchestrator::new(store, plane)?.with_report_store(reports))
}
