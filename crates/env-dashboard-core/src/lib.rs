use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::path::Path;

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime, UtcOffset};

pub const DEFAULT_RETENTION_DAYS: u32 = 30;
pub const MIN_RETENTION_DAYS: u32 = 1;
pub const DEFAULT_DEPLOY_FLAG_VARIABLE: &str = "UPDATE_ENV_DASH";
pub const MAX_COLUMN_NAME_LEN: usize = 63;

/// Dynamic columns may never shadow one of these, compared case-insensitively.
pub const CORE_COLUMNS: &[&str] = &[
    "slot_key",
    "env_name",
    "comp_name",
    "build_number",
    "build_url",
    "build_status",
    "build_job_url",
    "package_name",
    "created_at",
    "recorded_at",
];

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum DashboardError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

/// Status stored for a slot. Results outside the known vocabulary are kept
/// verbatim in [`BuildStatus::Other`].
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(from = "String", into = "String")]
pub enum BuildStatus {
    Running,
    Success,
    Unstable,
    Failure,
    NotBuilt,
    Aborted,
    NoDeploy,
    Unknown,
    Other(String),
}

impl BuildStatus {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Running => "RUNNING",
            Self::Success => "SUCCESS",
            Self::Unstable => "UNSTABLE",
            Self::Failure => "FAILURE",
            Self::NotBuilt => "NOT_BUILT",
            Self::Aborted => "ABORTED",
            Self::NoDeploy => "NODEPLOY",
            Self::Unknown => "UNKNOWN",
            Self::Other(raw) => raw,
        }
    }

    /// Normalizes a result reported by the host: trimmed and upper-cased.
    /// Only an empty result becomes [`BuildStatus::Unknown`].
    #[must_use]
    pub fn from_host_result(value: &str) -> Self {
        Self::from(value.trim().to_ascii_uppercase())
    }
}

impl From<String> for BuildStatus {
    fn from(value: String) -> Self {
        match value.as_str() {
            "RUNNING" => Self::Running,
            "SUCCESS" => Self::Success,
            "UNSTABLE" => Self::Unstable,
            "FAILURE" => Self::Failure,
            "NOT_BUILT" => Self::NotBuilt,
            "ABORTED" => Self::Aborted,
            "NODEPLOY" => Self::NoDeploy,
            "" | "UNKNOWN" => Self::Unknown,
            _ => Self::Other(value),
        }
    }
}

impl From<BuildStatus> for String {
    fn from(value: BuildStatus) -> Self {
        match value {
            BuildStatus::Other(raw) => raw,
            known => known.as_str().to_string(),
        }
    }
}

impl Display for BuildStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Pre,
    Post,
    #[serde(rename = "NODEPLOY")]
    NoDeploy,
}

impl Phase {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pre => "PRE",
            Self::Post => "POST",
            Self::NoDeploy => "NODEPLOY",
        }
    }

    /// Only the literal `"false"` opts out of deployment.
    #[must_use]
    pub fn for_completion(deploy_flag: Option<&str>) -> Self {
        match deploy_flag {
            Some("false") => Self::NoDeploy,
            _ => Self::Post,
        }
    }

    #[must_use]
    pub fn resolve_status(self, host_result: Option<&str>) -> BuildStatus {
        match (self, host_result) {
            (Self::NoDeploy, _) => BuildStatus::NoDeploy,
            (Self::Pre, None) => BuildStatus::Running,
            // A job completing itself has no terminal result yet.
            (Self::Post, None) => BuildStatus::Success,
            (Self::Pre | Self::Post, Some(result)) => BuildStatus::from_host_result(result),
        }
    }
}

impl Display for Phase {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a dashboard slot: `<env>=<component>`.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct SlotKey(String);

impl SlotKey {
    #[must_use]
    pub fn new(env_name: &str, comp_name: &str) -> Self {
        Self(format!("{env_name}={comp_name}"))
    }

    #[must_use]
    pub fn from_stored(raw: String) -> Self {
        Self(raw)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for SlotKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// `[A-Za-z_][A-Za-z0-9_]*`, so it can be quoted without escaping.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct ColumnName(String);

impl ColumnName {
    /// # Errors
    /// Returns [`DashboardError::Configuration`] for unsafe identifiers and
    /// names that shadow a core dashboard column.
    pub fn parse(raw: &str) -> Result<Self, DashboardError> {
        let name = Self::builtin(raw)?;
        if is_core_column(&name.0) {
            return Err(DashboardError::Configuration(format!(
                "column name `{raw}` is reserved by the dashboard table"
            )));
        }
        Ok(name)
    }

    /// Like [`ColumnName::parse`] but allows core column names.
    ///
    /// # Errors
    /// Returns [`DashboardError::Configuration`] for unsafe identifiers.
    pub fn builtin(raw: &str) -> Result<Self, DashboardError> {
        if !is_identifier(raw) {
            return Err(DashboardError::Configuration(format!(
                "column name `{raw}` MUST match [A-Za-z_][A-Za-z0-9_]* and be at most {MAX_COLUMN_NAME_LEN} characters"
            )));
        }
        if raw.to_ascii_lowercase().starts_with("sqlite_") {
            return Err(DashboardError::Configuration(format!(
                "column name `{raw}` uses the reserved sqlite_ prefix"
            )));
        }
        Ok(Self(raw.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn quoted(&self) -> String {
        format!("\"{}\"", self.0)
    }
}

impl TryFrom<String> for ColumnName {
    type Error = DashboardError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ColumnName> for String {
    fn from(value: ColumnName) -> Self {
        value.0
    }
}

impl Display for ColumnName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[must_use]
pub fn is_identifier(raw: &str) -> bool {
    let mut chars = raw.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    raw.len() <= MAX_COLUMN_NAME_LEN
        && (first.is_ascii_alphabetic() || first == '_')
        && chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}

#[must_use]
pub fn is_core_column(name: &str) -> bool {
    CORE_COLUMNS
        .iter()
        .any(|core| core.eq_ignore_ascii_case(name))
}

#[must_use]
pub fn is_blank(value: &str) -> bool {
    value.trim().is_empty()
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ColumnType {
    Text,
    Varchar(u16),
}

impl ColumnType {
    #[must_use]
    pub fn sql_type(self) -> String {
        match self {
            Self::Text => "TEXT".to_string(),
            Self::Varchar(len) => format!("VARCHAR({len})"),
        }
    }

    #[must_use]
    pub fn matches_declared(self, declared: &str) -> bool {
        let normalized: String = declared
            .chars()
            .filter(|ch| !ch.is_whitespace())
            .collect::<String>()
            .to_ascii_uppercase();
        match self {
            // A bare VARCHAR has text affinity in SQLite, same as TEXT.
            Self::Text => normalized == "TEXT" || normalized == "VARCHAR",
            Self::Varchar(_) => normalized == self.sql_type(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct DynamicColumn {
    pub name: ColumnName,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct BuildRecord {
    pub slot_key: SlotKey,
    pub env_name: String,
    pub comp_name: String,
    pub build_number: String,
    pub build_url: String,
    pub status: BuildStatus,
    pub build_job_url: String,
    pub package_name: String,
    pub columns: Vec<DynamicColumn>,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
}

impl BuildRecord {
    /// # Errors
    /// Returns [`DashboardError::Validation`] when a required field is blank,
    /// the slot key does not match the env/component pair, or a column repeats.
    pub fn validate(&self) -> Result<(), DashboardError> {
        for (name, value) in [
            ("env_name", &self.env_name),
            ("comp_name", &self.comp_name),
            ("build_number", &self.build_number),
        ] {
            if is_blank(value) {
                return Err(DashboardError::Validation(format!(
                    "{name} MUST NOT be blank"
                )));
            }
        }

        if self.slot_key != SlotKey::new(&self.env_name, &self.comp_name) {
            return Err(DashboardError::Validation(format!(
                "slot_key {} does not match {}={}",
                self.slot_key, self.env_name, self.comp_name
            )));
        }

        let mut seen = Vec::with_capacity(self.columns.len());
        for column in &self.columns {
            let lowered = column.name.as_str().to_ascii_lowercase();
            if seen.contains(&lowered) {
                return Err(DashboardError::Validation(format!(
                    "dynamic column {} supplied more than once",
                    column.name
                )));
            }
            seen.push(lowered);
        }

        Ok(())
    }
}

#[must_use]
pub fn build_job_url(build_job: &str, build_number: &str) -> String {
    if build_job.is_empty() {
        String::new()
    } else {
        format!("job/{build_job}/{build_number}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct DashboardRow {
    pub slot_key: SlotKey,
    pub env_name: String,
    pub comp_name: String,
    pub build_number: String,
    pub build_url: String,
    pub status: BuildStatus,
    pub build_job_url: String,
    pub package_name: Option<String>,
    pub columns: BTreeMap<String, Option<String>>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct RetentionWindow {
    days: u32,
}

impl RetentionWindow {
    // Zero and negative values clamp to the minimum.
    #[must_use]
    pub fn from_days(days: i64) -> Self {
        let clamped = days.clamp(i64::from(MIN_RETENTION_DAYS), i64::from(u32::MAX));
        Self {
            days: u32::try_from(clamped).unwrap_or(MIN_RETENTION_DAYS),
        }
    }

    #[must_use]
    pub fn days(self) -> u32 {
        self.days
    }

    #[must_use]
    pub fn cutoff(self, now: OffsetDateTime) -> OffsetDateTime {
        now.saturating_sub(Duration::days(i64::from(self.days)))
    }
}

impl Default for RetentionWindow {
    fn default() -> Self {
        Self {
            days: DEFAULT_RETENTION_DAYS,
        }
    }
}

/// Raw administrator settings; invalid values fall back to defaults at runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct DashboardSettings {
    pub number_of_days: Option<String>,
    pub deploy_flag_variable: Option<String>,
}

impl DashboardSettings {
    /// # Errors
    /// Returns [`DashboardError::Configuration`] when the retention value or
    /// the deploy flag variable is invalid.
    pub fn validate(&self) -> Result<(), DashboardError> {
        parse_retention_days(self.number_of_days.as_deref().unwrap_or_default())?;

        if let Some(variable) = &self.deploy_flag_variable {
            if !is_identifier(variable) {
                return Err(DashboardError::Configuration(format!(
                    "deploy flag variable `{variable}` MUST be a plain identifier"
                )));
            }
        }

        Ok(())
    }

    #[must_use]
    pub fn normalized_for_save(&self) -> Self {
        let number_of_days = match self.number_of_days.as_deref().map(str::trim) {
            None | Some("") => DEFAULT_RETENTION_DAYS.to_string(),
            Some(value) => value.to_string(),
        };
        Self {
            number_of_days: Some(number_of_days),
            deploy_flag_variable: self.deploy_flag_variable.clone(),
        }
    }

    #[must_use]
    pub fn resolve(&self) -> DashboardConfig {
        let retention = self
            .number_of_days
            .as_deref()
            .and_then(|raw| parse_retention_days(raw).ok())
            .map_or_else(RetentionWindow::default, |days| {
                RetentionWindow::from_days(i64::from(days))
            });

        let deploy_flag_variable = self
            .deploy_flag_variable
            .as_deref()
            .filter(|value| is_identifier(value))
            .unwrap_or(DEFAULT_DEPLOY_FLAG_VARIABLE)
            .to_string();

        DashboardConfig {
            retention,
            deploy_flag_variable,
        }
    }

    /// # Errors
    /// Returns [`DashboardError::Configuration`] when the TOML is malformed.
    pub fn from_toml_str(raw: &str) -> Result<Self, DashboardError> {
        toml::from_str(raw)
            .map_err(|err| DashboardError::Configuration(format!("invalid settings TOML: {err}")))
    }

    /// # Errors
    /// Returns [`DashboardError::Configuration`] when serialization fails.
    pub fn to_toml_string(&self) -> Result<String, DashboardError> {
        toml::to_string_pretty(self).map_err(|err| {
            DashboardError::Configuration(format!("failed to encode settings: {err}"))
        })
    }

    /// A missing file yields empty settings.
    ///
    /// # Errors
    /// Returns [`DashboardError::Configuration`] when the file cannot be decoded.
    pub fn load(path: &Path) -> Result<Self, DashboardError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let body = std::fs::read_to_string(path).map_err(|err| {
            DashboardError::Configuration(format!(
                "failed to read settings {}: {err}",
                path.display()
            ))
        })?;
        Self::from_toml_str(&body)
    }

    /// # Errors
    /// Returns [`DashboardError::Configuration`] when validation or the write fails.
    pub fn save(&self, path: &Path) -> Result<Self, DashboardError> {
        let normalized = self.normalized_for_save();
        normalized.validate()?;
        let body = normalized.to_toml_string()?;
        std::fs::write(path, body).map_err(|err| {
            DashboardError::Configuration(format!(
                "failed to write settings {}: {err}",
                path.display()
            ))
        })?;
        Ok(normalized)
    }
}

/// # Errors
/// Returns [`DashboardError::Configuration`] when the value is not an integer
/// of at least [`MIN_RETENTION_DAYS`].
pub fn parse_retention_days(raw: &str) -> Result<u32, DashboardError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(DashboardError::Configuration(
            "Please set the number of days to retain the DB data.".to_string(),
        ));
    }
    let days: i64 = trimmed.parse().map_err(|_| {
        DashboardError::Configuration("Please provide an integer value.".to_string())
    })?;
    if days < i64::from(MIN_RETENTION_DAYS) {
        return Err(DashboardError::Configuration(format!(
            "number of days MUST be >= {MIN_RETENTION_DAYS}"
        )));
    }
    u32::try_from(days).map_err(|_| {
        DashboardError::Configuration(format!("number of days MUST be <= {}", u32::MAX))
    })
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct DashboardConfig {
    pub retention: RetentionWindow,
    pub deploy_flag_variable: String,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            retention: RetentionWindow::default(),
            deploy_flag_variable: DEFAULT_DEPLOY_FLAG_VARIABLE.to_string(),
        }
    }
}

pub trait ConfigProvider {
    fn config(&self) -> DashboardConfig;
}

#[derive(Debug, Clone, Default)]
pub struct StaticConfig(pub DashboardConfig);

impl ConfigProvider for StaticConfig {
    fn config(&self) -> DashboardConfig {
        self.0.clone()
    }
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

/// # Errors
/// Returns [`DashboardError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, DashboardError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            DashboardError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

/// # Errors
/// Returns [`DashboardError::Validation`] when the value is out of range.
pub fn from_unix_seconds(value: i64) -> Result<OffsetDateTime, DashboardError> {
    OffsetDateTime::from_unix_timestamp(value)
        .map_err(|err| DashboardError::Validation(format!("invalid unix timestamp {value}: {err}")))
}
