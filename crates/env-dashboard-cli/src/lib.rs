//! Command surface for recording build lifecycle events into the environment
//! dashboard from any CI runner.
//!
//! Hosts embed the recorder through [`run_cli`] for a parsed command line or
//! through [`ProcessBuildContext`] and [`FileConfigProvider`] when driving
//! [`DashboardRecorder`] directly.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use env_dashboard_core::{
    format_rfc3339, now_utc, ConfigProvider, DashboardConfig, DashboardRow, DashboardSettings,
    RetentionWindow,
};
use env_dashboard_orchestrator::{
    expand_placeholders, BuildContext, ColumnTemplate, DashboardRecorder, DashboardStep,
    EventOutcome, PhaseToken,
};
use env_dashboard_store_sqlite::SqliteDashboardStore;
use serde::Serialize;
use tracing::{debug, warn};

const ROWS_CONTRACT_VERSION: &str = "dashboard_rows.v1";

#[derive(Debug, Parser)]
#[command(name = "envdash")]
#[command(about = "Environment dashboard recorder")]
pub struct Cli {
    #[arg(long, default_value = "./env_dashboard.sqlite3")]
    db: PathBuf,

    #[arg(long, default_value = "./env_dashboard.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Record the start of a build.
    Pre(PreArgs),
    /// Record the end of a build, or clear its slot when the deploy flag is `false`.
    Post(PostArgs),
    /// Record a build around a child command and exit with its status.
    Run(RunArgs),
    /// Print the dashboard.
    Show(ShowArgs),
    /// Remove rows older than the retention window.
    Prune(PruneArgs),
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Debug, Args)]
pub struct StepArgs {
    #[arg(long = "env")]
    env_name: String,
    #[arg(long)]
    component: String,
    #[arg(long, default_value = "${BUILD_NUMBER}")]
    build_number: String,
    #[arg(long, default_value = "")]
    build_job: String,
    #[arg(long)]
    package: Option<String>,
    /// Extra dashboard column as `NAME=TEMPLATE`; repeatable, kept in order.
    #[arg(long = "column", value_parser = parse_column_template)]
    columns: Vec<ColumnTemplate>,
    /// Defaults to `$BUILD_URL` from the environment.
    #[arg(long)]
    run_url: Option<String>,
    /// Defaults to `$BUILD_ID` from the environment.
    #[arg(long)]
    run_id: Option<String>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct PreArgs {
    #[command(flatten)]
    step: StepArgs,
}

#[derive(Debug, Args)]
pub struct PostArgs {
    #[command(flatten)]
    step: StepArgs,
    /// Terminal result of the build, e.g. SUCCESS or FAILURE.
    #[arg(long)]
    result: Option<String>,
}

#[derive(Debug, Args)]
pub struct RunArgs {
    #[command(flatten)]
    step: StepArgs,
    #[arg(last = true, required = true)]
    command: Vec<String>,
}

#[derive(Debug, Args)]
pub struct ShowArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct PruneArgs {
    /// Overrides the configured retention window.
    #[arg(long, allow_negative_numbers = true)]
    days: Option<i64>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    Show(ConfigShowArgs),
    Set(ConfigSetArgs),
}

#[derive(Debug, Args)]
pub struct ConfigShowArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct ConfigSetArgs {
    #[arg(long, allow_hyphen_values = true)]
    retention_days: Option<String>,
    #[arg(long)]
    deploy_flag_variable: Option<String>,
}

/// [`BuildContext`] over the current process: placeholders and defaults come
/// from environment variables.
#[derive(Debug, Clone, Default)]
pub struct ProcessBuildContext {
    run_id: Option<String>,
    run_url: Option<String>,
    result: Option<String>,
}

impl ProcessBuildContext {
    #[must_use]
    pub fn new(run_id: Option<String>, run_url: Option<String>) -> Self {
        Self {
            run_id,
            run_url,
            result: None,
        }
    }

    #[must_use]
    pub fn with_result(mut self, result: Option<String>) -> Self {
        self.result = result;
        self
    }

    fn template_or_env(&self, template: Option<&str>, fallback: &str) -> String {
        match template {
            Some(template) => self.expand(template),
            None => std::env::var(fallback).unwrap_or_default(),
        }
    }
}

impl BuildContext for ProcessBuildContext {
    fn expand(&self, template: &str) -> String {
        expand_placeholders(template, |name| std::env::var(name).ok())
    }

    fn current_result(&self) -> Option<String> {
        self.result.clone()
    }

    fn run_id(&self) -> String {
        self.template_or_env(self.run_id.as_deref(), "BUILD_ID")
    }

    fn run_url(&self) -> String {
        self.template_or_env(self.run_url.as_deref(), "BUILD_URL")
    }
}

/// Reads dashboard settings from a TOML file on every event so edits apply
/// to the next build without a restart.
#[derive(Debug, Clone)]
pub struct FileConfigProvider {
    path: PathBuf,
}

impl FileConfigProvider {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ConfigProvider for FileConfigProvider {
    fn config(&self) -> DashboardConfig {
        match DashboardSettings::load(&self.path) {
            Ok(settings) => {
                if let Err(err) = settings.normalized_for_save().validate() {
                    warn!(path = %self.path.display(), error = %err, "invalid dashboard settings; using defaults for bad values");
                }
                settings.resolve()
            }
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "dashboard settings unreadable; using defaults");
                DashboardConfig::default()
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct RowsPayload<'a> {
    contract_version: &'static str,
    rows: &'a [DashboardRow],
}

#[derive(Debug, Serialize)]
struct PrunePayload {
    days: u32,
    removed: usize,
}

#[derive(Debug, Serialize)]
struct ConfigPayload<'a> {
    settings: &'a DashboardSettings,
    resolved: DashboardConfig,
}

/// Executes the parsed command line and returns the process exit code.
///
/// Recorder outcomes, including `WARN:` results, never fail the command;
/// only argument, settings, and read-side storage errors do.
///
/// # Errors
/// Returns an error when the step fails validation, settings cannot be saved,
/// the dashboard cannot be read, or a child command cannot be started.
pub fn run_cli(cli: Cli) -> Result<u8> {
    let recorder = DashboardRecorder::new(&cli.db, FileConfigProvider::new(&cli.config));
    match cli.command {
        Command::Pre(args) => {
            let (step, ctx, json) = step_and_context(args.step, None)?;
            let (_, outcome) = recorder.begin(step, &ctx);
            print_outcome(&outcome, json)?;
            Ok(0)
        }
        Command::Post(args) => {
            let (step, ctx, json) = step_and_context(args.step, args.result)?;
            let outcome = recorder.end(PhaseToken::new(step), &ctx);
            print_outcome(&outcome, json)?;
            Ok(0)
        }
        Command::Run(args) => run_wrapped(&recorder, args),
        Command::Show(args) => {
            let rows = read_rows(&cli.db)?;
            if args.json {
                let payload = RowsPayload {
                    contract_version: ROWS_CONTRACT_VERSION,
                    rows: &rows,
                };
                println!("{}", serde_json::to_string_pretty(&payload)?);
            } else {
                print_rows_table(&rows)?;
            }
            Ok(0)
        }
        Command::Prune(args) => {
            let window = match args.days {
                Some(days) => RetentionWindow::from_days(days),
                None => FileConfigProvider::new(&cli.config).config().retention,
            };
            let store = SqliteDashboardStore::open(&cli.db)?;
            store.ensure_table()?;
            let removed = store.prune_older_than(window, now_utc(), None)?;
            if args.json {
                let payload = PrunePayload {
                    days: window.days(),
                    removed,
                };
                println!("{}", serde_json::to_string_pretty(&payload)?);
            } else {
                println!("pruned {removed} rows older than {} days", window.days());
            }
            Ok(0)
        }
        Command::Config { command } => {
            run_config(command, &cli.config)?;
            Ok(0)
        }
    }
}

/// Builds the step from its arguments and rejects it the way the job form
/// would, before any event runs.
fn step_and_context(
    args: StepArgs,
    result: Option<String>,
) -> Result<(DashboardStep, ProcessBuildContext, bool)> {
    let mut step = DashboardStep::new(args.env_name, args.component, args.build_number)
        .with_build_job(args.build_job);
    if let Some(package) = args.package {
        step = step.with_package_name(package);
    }
    for column in args.columns {
        step = step.with_column(column);
    }
    step.validate().context("invalid dashboard step")?;
    let ctx = ProcessBuildContext::new(args.run_id, args.run_url).with_result(result);
    Ok((step, ctx, args.json))
}

fn run_wrapped(recorder: &DashboardRecorder<FileConfigProvider>, args: RunArgs) -> Result<u8> {
    let (step, ctx, json) = step_and_context(args.step, None)?;
    let (program, rest) = args
        .command
        .split_first()
        .ok_or_else(|| anyhow!("run requires a command after `--`"))?;

    let (token, outcome) = recorder.begin(step, &ctx);
    print_outcome(&outcome, json)?;

    let status = std::process::Command::new(program).args(rest).status();
    let (result, exit_code, spawn_error) = match status {
        Ok(status) => match status.code() {
            Some(0) => ("SUCCESS", 0, None),
            Some(code) => ("FAILURE", u8::try_from(code).unwrap_or(1), None),
            // Terminated by a signal.
            None => ("ABORTED", 1, None),
        },
        Err(err) => ("FAILURE", 1, Some(err)),
    };
    debug!(program = %program, result, exit_code, "wrapped command finished");

    let outcome = recorder.end(token, &ctx.with_result(Some(result.to_string())));
    print_outcome(&outcome, json)?;

    match spawn_error {
        Some(err) => Err(err).with_context(|| format!("failed to run command {program}")),
        None => Ok(exit_code),
    }
}

fn run_config(command: ConfigCommand, path: &Path) -> Result<()> {
    match command {
        ConfigCommand::Show(args) => {
            let settings = DashboardSettings::load(path)?;
            if args.json {
                let payload = ConfigPayload {
                    resolved: settings.resolve(),
                    settings: &settings,
                };
                println!("{}", serde_json::to_string_pretty(&payload)?);
            } else {
                print!("{}", settings.to_toml_string()?);
            }
            Ok(())
        }
        ConfigCommand::Set(args) => {
            let mut settings = DashboardSettings::load(path)?;
            if let Some(days) = args.retention_days {
                settings.number_of_days = Some(days);
            }
            if let Some(variable) = args.deploy_flag_variable {
                settings.deploy_flag_variable = Some(variable);
            }
            let saved = settings
                .save(path)
                .with_context(|| format!("settings not saved to {}", path.display()))?;
            print!("{}", saved.to_toml_string()?);
            Ok(())
        }
    }
}

fn read_rows(db_path: &Path) -> Result<Vec<DashboardRow>> {
    let store = SqliteDashboardStore::open(db_path)?;
    store.ensure_table()?;
    store.list_records()
}

fn parse_column_template(raw: &str) -> Result<ColumnTemplate, String> {
    match raw.split_once('=') {
        Some((name, contents)) => Ok(ColumnTemplate::new(name.trim(), contents)),
        None => Err(format!("expected NAME=TEMPLATE, got {raw:?}")),
    }
}

fn print_outcome(outcome: &EventOutcome, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(outcome)?);
    } else {
        println!("{}", outcome.log_line());
    }
    Ok(())
}

fn print_rows_table(rows: &[DashboardRow]) -> Result<()> {
    println!(
        "{:<16} {:<16} {:<10} {:<10} {:<24} {:<20} extra",
        "env", "component", "build", "status", "package", "recorded_at"
    );
    println!("{}", "-".repeat(110));

    for row in rows {
        let extra = row
            .columns
            .iter()
            .map(|(name, value)| format!("{name}={}", value.as_deref().unwrap_or("")))
            .collect::<Vec<_>>()
            .join(",");
        println!(
            "{:<16} {:<16} {:<10} {:<10} {:<24} {:<20} {}",
            row.env_name,
            row.comp_name,
            row.build_number,
            row.status.as_str(),
            row.package_name.as_deref().unwrap_or(""),
            format_rfc3339(row.recorded_at).map_err(|err| anyhow!(err.to_string()))?,
            extra
        );
    }
    Ok(())
}
