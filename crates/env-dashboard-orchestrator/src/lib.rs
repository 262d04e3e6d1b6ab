#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt::{self, Display};
use std::path::PathBuf;

use anyhow::{anyhow, Result};
use env_dashboard_core::{
    build_job_url, is_blank, now_utc, BuildRecord, ColumnName, ColumnType, ConfigProvider,
    DashboardConfig, DashboardError, DynamicColumn, Phase, SlotKey,
};
use env_dashboard_store_sqlite::{SqliteDashboardStore, WriteOutcome};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use ulid::Ulid;

pub const BLANK_FIELDS_MESSAGE: &str =
    "Environment dashboard not updated: one or more required values were blank";

/// What the recorder needs from the build host during one lifecycle event.
pub trait BuildContext {
    /// Expands `$VAR` / `${VAR}` placeholders against the build's variables.
    fn expand(&self, template: &str) -> String;

    /// Terminal result reported by the host, if the build has one yet.
    fn current_result(&self) -> Option<String>;

    fn run_id(&self) -> String;

    fn run_url(&self) -> String;
}

/// A dynamic column definition; both halves are templates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ColumnTemplate {
    pub column_name: String,
    pub contents: String,
}

impl ColumnTemplate {
    #[must_use]
    pub fn new(column_name: impl Into<String>, contents: impl Into<String>) -> Self {
        Self {
            column_name: column_name.into(),
            contents: contents.into(),
        }
    }
}

/// Per-job recorder configuration. Every string field is a template expanded
/// at event time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DashboardStep {
    pub env_name: String,
    pub component_name: String,
    pub build_number: String,
    #[serde(default)]
    pub build_job: String,
    #[serde(default)]
    pub package_name: Option<String>,
    #[serde(default)]
    pub columns: Vec<ColumnTemplate>,
}

impl DashboardStep {
    #[must_use]
    pub fn new(
        env_name: impl Into<String>,
        component_name: impl Into<String>,
        build_number: impl Into<String>,
    ) -> Self {
        Self {
            env_name: env_name.into(),
            component_name: component_name.into(),
            build_number: build_number.into(),
            build_job: String::new(),
            package_name: None,
            columns: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_build_job(mut self, build_job: impl Into<String>) -> Self {
        self.build_job = build_job.into();
        self
    }

    #[must_use]
    pub fn with_package_name(mut self, package_name: impl Into<String>) -> Self {
        self.package_name = Some(package_name.into());
        self
    }

    #[must_use]
    pub fn with_column(mut self, column: ColumnTemplate) -> Self {
        self.columns.push(column);
        self
    }

    /// Configuration-time checks, run before a step is saved.
    ///
    /// Column names containing a placeholder can only be checked once they
    /// are expanded, so only literal names are validated here.
    ///
    /// # Errors
    /// Returns [`DashboardError::Configuration`] for the first failed check.
    pub fn validate(&self) -> Result<(), DashboardError> {
        if is_blank(&self.env_name) {
            return Err(DashboardError::Configuration(
                "Please set an Environment name.".to_string(),
            ));
        }
        if is_blank(&self.component_name) {
            return Err(DashboardError::Configuration(
                "Please set a Component name.".to_string(),
            ));
        }
        if is_blank(&self.build_number) {
            return Err(DashboardError::Configuration(
                "Please set the Build variable e.g: ${BUILD_NUMBER}.".to_string(),
            ));
        }
        for column in &self.columns {
            let name = column.column_name.trim();
            if name.is_empty() || name.contains('$') {
                continue;
            }
            ColumnName::parse(name)?;
        }
        Ok(())
    }
}

/// Handle returned by [`DashboardRecorder::begin`] and consumed by
/// [`DashboardRecorder::end`]. Holds only what the completion event needs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PhaseToken {
    event_id: Ulid,
    step: DashboardStep,
}

impl PhaseToken {
    /// Builds a token for a step whose pre-build event ran in another
    /// process.
    #[must_use]
    pub fn new(step: DashboardStep) -> Self {
        Self {
            event_id: Ulid::new(),
            step,
        }
    }

    #[must_use]
    pub fn event_id(&self) -> Ulid {
        self.event_id
    }

    #[must_use]
    pub fn step(&self) -> &DashboardStep {
        &self.step
    }
}

/// Result of one lifecycle event. Never an error: storage failures become
/// [`EventOutcome::Warning`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EventOutcome {
    Recorded {
        phase: Phase,
        slot_key: SlotKey,
        write: WriteOutcome,
        pruned: usize,
    },
    Skipped {
        phase: Phase,
    },
    Warning {
        phase: Phase,
        message: String,
    },
}

impl EventOutcome {
    #[must_use]
    pub fn phase(&self) -> Phase {
        match self {
            Self::Recorded { phase, .. } | Self::Skipped { phase } | Self::Warning { phase, .. } => {
                *phase
            }
        }
    }

    #[must_use]
    pub fn is_warning(&self) -> bool {
        matches!(self, Self::Warning { .. })
    }

    /// The line written to the build log for this event.
    #[must_use]
    pub fn log_line(&self) -> String {
        match self {
            Self::Skipped { .. } => self.to_string(),
            Self::Recorded { phase, .. } | Self::Warning { phase, .. } => {
                let label = match phase {
                    Phase::Pre => "Pre-Build",
                    Phase::Post | Phase::NoDeploy => "Post-Build",
                };
                format!("{label} Update: {self}")
            }
        }
    }
}

impl Display for EventOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Recorded {
                write: WriteOutcome::MissingRow,
                slot_key,
                ..
            } => write!(f, "Dashboard DB unchanged: no row for {slot_key}"),
            Self::Recorded { .. } => f.write_str("Updated Dashboard DB"),
            Self::Skipped { .. } => f.write_str(BLANK_FIELDS_MESSAGE),
            Self::Warning { message, .. } => write!(f, "WARN: {message}"),
        }
    }
}

/// Drives the dashboard through the pre/post lifecycle of one job.
///
/// Each event opens its own store connection, ensures the schema, mutates
/// the slot, prunes expired rows, then drops the connection. Nothing is held
/// between [`begin`](Self::begin) and [`end`](Self::end).
pub struct DashboardRecorder<P: ConfigProvider> {
    db_path: PathBuf,
    provider: P,
}

impl<P: ConfigProvider> DashboardRecorder<P> {
    #[must_use]
    pub fn new(db_path: impl Into<PathBuf>, provider: P) -> Self {
        Self {
            db_path: db_path.into(),
            provider,
        }
    }

    /// Pre-build event: marks the slot as occupied by this run.
    #[must_use]
    pub fn begin(&self, step: DashboardStep, ctx: &dyn BuildContext) -> (PhaseToken, EventOutcome) {
        let token = PhaseToken::new(step);
        let config = self.provider.config();
        let outcome = self.handle(&token, Phase::Pre, &config, ctx);
        (token, outcome)
    }

    /// Completion event: records the final status, or clears the slot when
    /// the deploy flag expands to exactly `false`.
    #[must_use]
    #[allow(clippy::needless_pass_by_value)]
    pub fn end(&self, token: PhaseToken, ctx: &dyn BuildContext) -> EventOutcome {
        let config = self.provider.config();
        let deploy_flag = ctx.expand(&format!("${}", config.deploy_flag_variable));
        let phase = Phase::for_completion(Some(deploy_flag.as_str()));
        self.handle(&token, phase, &config, ctx)
    }

    fn handle(
        &self,
        token: &PhaseToken,
        phase: Phase,
        config: &DashboardConfig,
        ctx: &dyn BuildContext,
    ) -> EventOutcome {
        let event_id = token.event_id();
        let record = match assemble_record(token.step(), phase, ctx) {
            Ok(Some(record)) => record,
            Ok(None) => {
                info!(%event_id, ?phase, "required dashboard values blank; event skipped");
                return EventOutcome::Skipped { phase };
            }
            Err(err) => return warning(event_id, phase, &err),
        };

        match self.write(&record, phase, config) {
            Ok((write, pruned)) => {
                info!(
                    %event_id,
                    run_id = %ctx.run_id(),
                    ?phase,
                    slot = %record.slot_key,
                    status = %record.status,
                    ?write,
                    pruned,
                    "dashboard event recorded"
                );
                EventOutcome::Recorded {
                    phase,
                    slot_key: record.slot_key,
                    write,
                    pruned,
                }
            }
            Err(err) => warning(event_id, phase, &err),
        }
    }

    fn write(
        &self,
        record: &BuildRecord,
        phase: Phase,
        config: &DashboardConfig,
    ) -> Result<(WriteOutcome, usize)> {
        let mut store = SqliteDashboardStore::open(&self.db_path)?;
        store.ensure_table()?;
        for column in &record.columns {
            store.ensure_column(&column.name, ColumnType::Text)?;
        }

        let write = match phase {
            Phase::Pre => store.insert_on_pre(record)?,
            Phase::Post => store.update_on_post(record)?,
            Phase::NoDeploy => store.delete_on_no_deploy(&record.slot_key)?,
        };
        let pruned =
            store.prune_older_than(config.retention, record.recorded_at, Some(&record.slot_key))?;
        Ok((write, pruned))
    }
}

fn warning(event_id: Ulid, phase: Phase, err: &anyhow::Error) -> EventOutcome {
    let message = format!("{err:#}");
    warn!(%event_id, ?phase, error = %message, "dashboard event not recorded");
    EventOutcome::Warning { phase, message }
}

/// Expands the step against the build. `Ok(None)` means a required value was
/// blank after expansion.
fn assemble_record(
    step: &DashboardStep,
    phase: Phase,
    ctx: &dyn BuildContext,
) -> Result<Option<BuildRecord>> {
    let env_name = ctx.expand(&step.env_name);
    let comp_name = ctx.expand(&step.component_name);
    let build_number = ctx.expand(&step.build_number);
    if is_blank(&env_name) || is_blank(&comp_name) || is_blank(&build_number) {
        return Ok(None);
    }

    let mut columns = Vec::with_capacity(step.columns.len());
    for template in &step.columns {
        let expanded = ctx.expand(&template.column_name);
        let raw_name = expanded.trim();
        if raw_name.is_empty() {
            continue;
        }
        let name = ColumnName::parse(raw_name)
            .map_err(|err| anyhow!("invalid dynamic column name {raw_name:?}: {err}"))?;
        columns.push(DynamicColumn {
            name,
            value: ctx.expand(&template.contents),
        });
    }

    let build_job = ctx.expand(&step.build_job);
    let current_result = ctx.current_result();
    Ok(Some(BuildRecord {
        slot_key: SlotKey::new(&env_name, &comp_name),
        build_job_url: build_job_url(build_job.trim(), &build_number),
        status: phase.resolve_status(current_result.as_deref()),
        build_url: ctx.run_url(),
        package_name: step
            .package_name
            .as_deref()
            .map(|template| ctx.expand(template))
            .unwrap_or_default(),
        env_name,
        comp_name,
        build_number,
        columns,
        recorded_at: now_utc(),
    }))
}

/// Replaces `$NAME` and `${NAME}` with values from `lookup`.
///
/// Unknown names are left verbatim and `$$` yields a literal `$`. Names
/// follow shell rules: a letter or underscore, then letters, digits or
/// underscores.
#[must_use]
pub fn expand_placeholders<F>(template: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(dollar) = rest.find('$') {
        out.push_str(&rest[..dollar]);
        let after = &rest[dollar + 1..];

        if let Some(tail) = after.strip_prefix('$') {
            out.push('$');
            rest = tail;
            continue;
        }

        if let Some(braced) = after.strip_prefix('{') {
            if let Some(close) = braced.find('}') {
                let name = &braced[..close];
                if variable_name_len(name) == name.len() && !name.is_empty() {
                    match lookup(name) {
                        Some(value) => out.push_str(&value),
                        None => {
                            out.push_str("${");
                            out.push_str(name);
                            out.push('}');
                        }
                    }
                    rest = &braced[close + 1..];
                    continue;
                }
            }
            out.push('$');
            rest = after;
            continue;
        }

        let len = variable_name_len(after);
        if len == 0 {
            out.push('$');
            rest = after;
            continue;
        }
        let name = &after[..len];
        match lookup(name) {
            Some(value) => out.push_str(&value),
            None => {
                out.push('$');
                out.push_str(name);
            }
        }
        rest = &after[len..];
    }
    out.push_str(rest);
    out
}

fn variable_name_len(raw: &str) -> usize {
    match raw.chars().next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return 0,
    }
    raw.char_indices()
        .find(|(_, ch)| !(ch.is_ascii_alphanumeric() || *ch == '_'))
        .map_or(raw.len(), |(index, _)| index)
}

/// A [`BuildContext`] backed by an in-memory variable map.
#[derive(Debug, Clone, Default)]
pub struct MapBuildContext {
    variables: BTreeMap<String, String>,
    result: Option<String>,
    run_id: String,
    run_url: String,
}

impl MapBuildContext {
    #[must_use]
    pub fn new(run_id: impl Into<String>, run_url: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            run_url: run_url.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_variable(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_result(mut self, result: impl Into<String>) -> Self {
        self.result = Some(result.into());
        self
    }

    pub fn set_variable(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.variables.insert(name.into(), value.into());
    }

    pub fn set_result(&mut self, result: Option<String>) {
        self.result = result;
    }
}

impl BuildContext for MapBuildContext {
    fn expand(&self, template: &str) -> String {
        expand_placeholders(template, |name| self.variables.get(name).cloned())
    }

    fn current_result(&self) -> Option<String> {
        self.result.clone()
    }

    fn run_id(&self) -> String {
        self.run_id.clone()
    }

    fn run_url(&self) -> String {
        self.run_url.clone()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::too_many_lines)]

    use super::*;
    use env_dashboard_core::{BuildStatus, DashboardRow, RetentionWindow, StaticConfig};
    use std::cell::Cell;
    use std::path::Path;
    use time::Duration;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err:#}"),
        }
    }

    fn temp_db_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("env-dashboard-recorder-{name}-{}.sqlite", Ulid::new()))
    }

    fn cleanup(path: &Path) {
        for suffix in ["", "-wal", "-shm"] {
            let mut file = path.as_os_str().to_owned();
            file.push(suffix);
            let _ = std::fs::remove_file(PathBuf::from(file));
        }
    }

    fn recorder(path: &Path) -> DashboardRecorder<StaticConfig> {
        DashboardRecorder::new(path, StaticConfig::default())
    }

    fn staging_api_step() -> DashboardStep {
        DashboardStep::new("staging", "api", "$BUILD_NUMBER").with_build_job("deploy-api")
    }

    fn build_ctx() -> MapBuildContext {
        MapBuildContext::new("42", "https://ci.example.test/job/deploy-api/42/")
            .with_variable("BUILD_NUMBER", "42")
    }

    fn read_row(path: &Path, slot: &str) -> Option<DashboardRow> {
        let store = must(SqliteDashboardStore::open(path));
        must(store.get_record(&SlotKey::from_stored(slot.to_string())))
    }

    fn must_row(path: &Path, slot: &str) -> DashboardRow {
        match read_row(path, slot) {
            Some(row) => row,
            None => panic!("expected a row for {slot}"),
        }
    }

    #[test]
    fn pre_post_and_no_deploy_walk_one_slot_through_its_lifecycle() {
        let path = temp_db_path("lifecycle");
        let recorder = recorder(&path);
        let mut ctx = build_ctx();

        let (token, outcome) = recorder.begin(staging_api_step(), &ctx);
        assert_eq!(outcome.to_string(), "Updated Dashboard DB");
        assert_eq!(outcome.log_line(), "Pre-Build Update: Updated Dashboard DB");
        let row = must_row(&path, "staging=api");
        assert_eq!(row.build_number, "42");
        assert_eq!(row.status, BuildStatus::Running);
        assert_eq!(row.build_job_url, "job/deploy-api/42");
        assert_eq!(row.build_url, "https://ci.example.test/job/deploy-api/42/");
        assert_eq!(row.package_name.as_deref(), Some(""));

        ctx.set_result(Some("SUCCESS".to_string()));
        let outcome = recorder.end(token.clone(), &ctx);
        assert_eq!(
            outcome,
            EventOutcome::Recorded {
                phase: Phase::Post,
                slot_key: SlotKey::new("staging", "api"),
                write: WriteOutcome::Updated,
                pruned: 0,
            }
        );
        assert_eq!(outcome.log_line(), "Post-Build Update: Updated Dashboard DB");
        assert_eq!(must_row(&path, "staging=api").status, BuildStatus::Success);

        ctx.set_variable("UPDATE_ENV_DASH", "false");
        let outcome = recorder.end(token, &ctx);
        assert_eq!(outcome.phase(), Phase::NoDeploy);
        assert!(read_row(&path, "staging=api").is_none());
        cleanup(&path);
    }

    #[test]
    fn blank_component_skips_without_touching_storage() {
        let path = temp_db_path("blank");
        let recorder = recorder(&path);
        let ctx = build_ctx();

        let step = DashboardStep::new("staging", "  ", "$BUILD_NUMBER");
        let (token, outcome) = recorder.begin(step, &ctx);
        assert_eq!(outcome, EventOutcome::Skipped { phase: Phase::Pre });
        assert_eq!(outcome.log_line(), BLANK_FIELDS_MESSAGE);
        assert!(!path.exists());

        let outcome = recorder.end(token, &ctx);
        assert_eq!(outcome, EventOutcome::Skipped { phase: Phase::Post });
        assert!(!path.exists());
    }

    #[test]
    fn build_number_that_expands_to_nothing_is_blank() {
        let path = temp_db_path("blank-build");
        let ctx = build_ctx().with_variable("EMPTY", "");
        let (_, outcome) = recorder(&path).begin(
            DashboardStep::new("staging", "api", "${EMPTY}"),
            &ctx,
        );
        assert!(matches!(outcome, EventOutcome::Skipped { .. }));
        assert!(!path.exists());
    }

    #[test]
    fn post_without_result_records_success_and_failure_is_kept() {
        let path = temp_db_path("post-status");
        let recorder = recorder(&path);

        let (token, _) = recorder.begin(staging_api_step(), &build_ctx());
        let outcome = recorder.end(token.clone(), &build_ctx());
        assert!(matches!(outcome, EventOutcome::Recorded { .. }));
        assert_eq!(must_row(&path, "staging=api").status, BuildStatus::Success);

        let failing = build_ctx().with_result("failure");
        let _ = recorder.end(token.clone(), &failing);
        assert_eq!(must_row(&path, "staging=api").status, BuildStatus::Failure);

        let canceled = build_ctx().with_result("Canceled");
        let _ = recorder.end(token.clone(), &canceled);
        let row = must_row(&path, "staging=api");
        assert_eq!(row.status, BuildStatus::Other("CANCELED".to_string()));
        assert_eq!(row.status.to_string(), "CANCELED");

        let empty = build_ctx().with_result("  ");
        let _ = recorder.end(token, &empty);
        assert_eq!(must_row(&path, "staging=api").status, BuildStatus::Unknown);
        cleanup(&path);
    }

    #[test]
    fn deploy_flag_other_than_false_means_post() {
        let path = temp_db_path("deploy-flag");
        let recorder = recorder(&path);
        let (token, _) = recorder.begin(staging_api_step(), &build_ctx());

        for flag in [None, Some("true"), Some("FALSE"), Some("no"), Some(" false")] {
            let mut ctx = build_ctx();
            if let Some(value) = flag {
                ctx.set_variable("UPDATE_ENV_DASH", value);
            }
            let outcome = recorder.end(token.clone(), &ctx);
            assert_eq!(outcome.phase(), Phase::Post, "flag {flag:?}");
            assert!(read_row(&path, "staging=api").is_some());
        }
        cleanup(&path);
    }

    #[test]
    fn configured_deploy_flag_variable_is_honoured() {
        let path = temp_db_path("custom-flag");
        let config = DashboardConfig {
            deploy_flag_variable: "SHIP_IT".to_string(),
            ..DashboardConfig::default()
        };
        let recorder = DashboardRecorder::new(&path, StaticConfig(config));
        let (token, _) = recorder.begin(staging_api_step(), &build_ctx());

        let ignored = build_ctx().with_variable("UPDATE_ENV_DASH", "false");
        assert_eq!(recorder.end(token.clone(), &ignored).phase(), Phase::Post);

        let ctx = build_ctx().with_variable("SHIP_IT", "false");
        assert_eq!(recorder.end(token, &ctx).phase(), Phase::NoDeploy);
        assert!(read_row(&path, "staging=api").is_none());
        cleanup(&path);
    }

    #[test]
    fn post_and_no_deploy_without_a_row_are_reported_not_failed() {
        let path = temp_db_path("missing");
        let recorder = recorder(&path);
        let token = PhaseToken::new(staging_api_step());

        let outcome = recorder.end(token.clone(), &build_ctx());
        assert!(matches!(
            outcome,
            EventOutcome::Recorded {
                write: WriteOutcome::MissingRow,
                ..
            }
        ));
        assert_eq!(
            outcome.to_string(),
            "Dashboard DB unchanged: no row for staging=api"
        );
        assert!(read_row(&path, "staging=api").is_none());

        let ctx = build_ctx().with_variable("UPDATE_ENV_DASH", "false");
        let outcome = recorder.end(token, &ctx);
        assert!(matches!(
            outcome,
            EventOutcome::Recorded {
                phase: Phase::NoDeploy,
                write: WriteOutcome::MissingRow,
                ..
            }
        ));
        cleanup(&path);
    }

    #[test]
    fn storage_failure_becomes_a_warning() {
        let dir = std::env::temp_dir().join(format!("env-dashboard-missing-{}", Ulid::new()));
        let path = dir.join("nested").join("dashboard.sqlite");
        let (token, outcome) = recorder(&path).begin(staging_api_step(), &build_ctx());

        assert!(outcome.is_warning());
        let line = outcome.log_line();
        assert!(line.starts_with("Pre-Build Update: WARN: "), "{line}");
        assert!(line.contains("failed to open sqlite database"), "{line}");
        assert!(recorder(&path).end(token, &build_ctx()).is_warning());
    }

    #[test]
    fn dynamic_columns_are_expanded_and_written() {
        let path = temp_db_path("columns");
        let recorder = recorder(&path);
        let ctx = build_ctx()
            .with_variable("GIT_COMMIT", "abc123")
            .with_variable("COL", "branch");
        let step = staging_api_step()
            .with_package_name("api-$BUILD_NUMBER.tar.gz")
            .with_column(ColumnTemplate::new("commit_sha", "$GIT_COMMIT"))
            .with_column(ColumnTemplate::new("${COL}", "main"))
            .with_column(ColumnTemplate::new("   ", "dropped"));

        let (_, outcome) = recorder.begin(step, &ctx);
        assert!(matches!(outcome, EventOutcome::Recorded { .. }));

        let row = must_row(&path, "staging=api");
        assert_eq!(row.package_name.as_deref(), Some("api-42.tar.gz"));
        assert_eq!(
            row.columns.get("commit_sha").cloned().flatten().as_deref(),
            Some("abc123")
        );
        assert_eq!(
            row.columns.get("branch").cloned().flatten().as_deref(),
            Some("main")
        );
        assert_eq!(row.columns.len(), 2);
        cleanup(&path);
    }

    #[test]
    fn later_column_leaves_existing_rows_untouched() {
        let path = temp_db_path("later-column");
        let recorder = recorder(&path);

        let (_, _) = recorder.begin(
            DashboardStep::new("prod", "web", "7")
                .with_column(ColumnTemplate::new("region", "eu-west")),
            &build_ctx(),
        );
        let (_, outcome) = recorder.begin(
            staging_api_step().with_column(ColumnTemplate::new("owner", "team-a")),
            &build_ctx(),
        );
        assert!(matches!(outcome, EventOutcome::Recorded { .. }));

        let earlier = must_row(&path, "prod=web");
        assert_eq!(
            earlier.columns.get("region").cloned().flatten().as_deref(),
            Some("eu-west")
        );
        assert_eq!(earlier.columns.get("owner"), Some(&None));
        cleanup(&path);
    }

    #[test]
    fn invalid_expanded_column_name_rejects_the_event() {
        let path = temp_db_path("bad-column");
        let ctx = build_ctx().with_variable("COL", "drop table; --");
        let step = staging_api_step().with_column(ColumnTemplate::new("$COL", "x"));

        let (_, outcome) = recorder(&path).begin(step, &ctx);
        assert!(outcome.is_warning());
        assert!(outcome.to_string().starts_with("WARN: invalid dynamic column name"));
        assert!(!path.exists());

        let reserved = staging_api_step().with_column(ColumnTemplate::new("build_status", "x"));
        let (_, outcome) = recorder(&path).begin(reserved, &build_ctx());
        assert!(outcome.is_warning());
        assert!(!path.exists());
    }

    #[test]
    fn retention_sweep_runs_after_each_write_and_spares_the_current_slot() {
        let path = temp_db_path("retention");
        let recorder = DashboardRecorder::new(
            &path,
            StaticConfig(DashboardConfig {
                retention: RetentionWindow::from_days(5),
                ..DashboardConfig::default()
            }),
        );
        let (_, _) = recorder.begin(DashboardStep::new("qa", "old", "1"), &build_ctx());
        let (_, _) = recorder.begin(staging_api_step(), &build_ctx());

        let stale = (now_utc() - Duration::days(10)).unix_timestamp();
        must(age_all_rows(&path, stale));

        let (_, outcome) = recorder.begin(staging_api_step(), &build_ctx());
        assert!(matches!(outcome, EventOutcome::Recorded { pruned: 1, .. }));
        assert!(read_row(&path, "qa=old").is_none());
        assert!(read_row(&path, "staging=api").is_some());
        cleanup(&path);
    }

    fn age_all_rows(path: &Path, recorded_at: i64) -> Result<()> {
        let conn = rusqlite::Connection::open(path)?;
        conn.execute("UPDATE env_dashboard SET recorded_at = ?1", [recorded_at])?;
        Ok(())
    }

    struct CountingConfig {
        calls: Cell<usize>,
    }

    impl ConfigProvider for CountingConfig {
        fn config(&self) -> DashboardConfig {
            self.calls.set(self.calls.get() + 1);
            DashboardConfig::default()
        }
    }

    #[test]
    fn config_is_resolved_once_per_event() {
        let path = temp_db_path("config-calls");
        let recorder = DashboardRecorder::new(
            &path,
            CountingConfig {
                calls: Cell::new(0),
            },
        );
        let (token, _) = recorder.begin(staging_api_step(), &build_ctx());
        assert_eq!(recorder.provider.calls.get(), 1);
        let _ = recorder.end(token, &build_ctx());
        assert_eq!(recorder.provider.calls.get(), 2);
        cleanup(&path);
    }

    #[test]
    fn token_keeps_the_step_it_was_issued_for() {
        let step = staging_api_step().with_package_name("pkg");
        let token = PhaseToken::new(step.clone());
        assert_eq!(token.step(), &step);

        let encoded = serde_json::to_string(&token);
        let encoded = match encoded {
            Ok(value) => value,
            Err(err) => panic!("token encode failed: {err}"),
        };
        let decoded: PhaseToken = match serde_json::from_str(&encoded) {
            Ok(value) => value,
            Err(err) => panic!("token decode failed: {err}"),
        };
        assert_eq!(decoded, token);
    }

    #[test]
    fn step_validation_mirrors_the_job_form() {
        let checks = [
            (DashboardStep::new("", "api", "1"), "Please set an Environment name."),
            (DashboardStep::new("qa", " ", "1"), "Please set a Component name."),
            (
                DashboardStep::new("qa", "api", ""),
                "Please set the Build variable e.g: ${BUILD_NUMBER}.",
            ),
        ];
        for (step, expected) in checks {
            match step.validate() {
                Err(DashboardError::Configuration(message)) => assert_eq!(message, expected),
                other => panic!("expected configuration error, got {other:?}"),
            }
        }

        let literal = staging_api_step().with_column(ColumnTemplate::new("bad name", "x"));
        assert!(literal.validate().is_err());
        let templated = staging_api_step().with_column(ColumnTemplate::new("${COL}", "x"));
        assert!(templated.validate().is_ok());
        assert!(staging_api_step().validate().is_ok());
    }

    #[test]
    fn placeholders_expand_from_lookup_and_unknowns_stay_verbatim() {
        let lookup = |name: &str| match name {
            "BUILD_NUMBER" => Some("42".to_string()),
            "ENV" => Some("staging".to_string()),
            "EMPTY" => Some(String::new()),
            _ => None,
        };
        let cases = [
            ("$BUILD_NUMBER", "42"),
            ("${BUILD_NUMBER}", "42"),
            ("build-${BUILD_NUMBER}-$ENV", "build-42-staging"),
            ("$ENV.tar", "staging.tar"),
            ("$MISSING", "$MISSING"),
            ("${MISSING}", "${MISSING}"),
            ("[$EMPTY]", "[]"),
            ("cost $$5", "cost $5"),
            ("trailing $", "trailing $"),
            ("$1abc", "$1abc"),
            ("${not closed", "${not closed"),
            ("${bad-name}", "${bad-name}"),
            ("plain", "plain"),
        ];
        for (template, expected) in cases {
            assert_eq!(expand_placeholders(template, lookup), expected, "{template}");
        }
    }
}
