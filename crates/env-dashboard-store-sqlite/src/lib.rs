#![allow(clippy::missing_errors_doc)]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use env_dashboard_core::{
    from_unix_seconds, is_core_column, BuildRecord, BuildStatus, ColumnName, ColumnType,
    DashboardRow, RetentionWindow, SlotKey,
};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, TransactionBehavior};
use time::OffsetDateTime;
use tracing::debug;

const SCHEMA_DASHBOARD_V1: &str = r"
CREATE TABLE IF NOT EXISTS env_dashboard (
  slot_key TEXT PRIMARY KEY,
  env_name TEXT NOT NULL,
  comp_name TEXT NOT NULL,
  build_number TEXT NOT NULL,
  build_url TEXT NOT NULL DEFAULT '',
  build_status TEXT NOT NULL CHECK (length(build_status) > 0),
  build_job_url TEXT NOT NULL DEFAULT '',
  created_at INTEGER NOT NULL,
  recorded_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_env_dashboard_recorded_at
  ON env_dashboard(recorded_at);
CREATE INDEX IF NOT EXISTS idx_env_dashboard_env_comp
  ON env_dashboard(env_name, comp_name);
";

const CORE_SELECT: &str = "slot_key, env_name, comp_name, build_number, build_url, build_status,
    build_job_url, package_name, created_at, recorded_at";

const PACKAGE_NAME_COLUMN: &str = "package_name";
const PACKAGE_NAME_TYPE: ColumnType = ColumnType::Varchar(255);

/// Dashboard table access: schema management plus the slot mutations.
///
/// A store wraps one connection and is meant to live for a single logical
/// operation; callers reopen it per event.
pub struct SqliteDashboardStore {
    conn: Connection,
}

#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ColumnOutcome {
    Added,
    AlreadyPresent,
}

#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WriteOutcome {
    Created,
    Restarted,
    Updated,
    Deleted,
    MissingRow,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub declared_type: String,
}

impl SqliteDashboardStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA busy_timeout = 5000;
             PRAGMA journal_mode = WAL;",
        )
        .context("failed to configure sqlite pragmas")?;

        debug!(path = %path.display(), "dashboard store opened");
        Ok(Self { conn })
    }

    /// Creates the dashboard table when absent and brings older tables up to
    /// the current column set. Safe to call on every event.
    pub fn ensure_table(&self) -> Result<()> {
        self.conn
            .execute_batch(SCHEMA_DASHBOARD_V1)
            .context("failed to create table env_dashboard")?;

        let package_name = ColumnName::builtin(PACKAGE_NAME_COLUMN)
            .map_err(|err| anyhow!("invalid builtin column: {err}"))?;
        self.add_column_if_missing(&package_name, PACKAGE_NAME_TYPE)
            .context("failed to alter table env_dashboard")?;
        Ok(())
    }

    /// Adds a dynamic column unless it already exists with a compatible type.
    ///
    /// Fails on a declared-type conflict or when `SQLite` rejects the
    /// alteration; an existing column is reported as
    /// [`ColumnOutcome::AlreadyPresent`].
    pub fn ensure_column(&self, name: &ColumnName, column_type: ColumnType) -> Result<ColumnOutcome> {
        if is_core_column(name.as_str()) {
            return Err(anyhow!(
                "column {name} is reserved by the dashboard table"
            ));
        }
        self.add_column_if_missing(name, column_type)
            .with_context(|| format!("failed to alter table env_dashboard to add column {name}"))
    }

    fn add_column_if_missing(
        &self,
        name: &ColumnName,
        column_type: ColumnType,
    ) -> Result<ColumnOutcome> {
        let existing = self
            .list_columns()?
            .into_iter()
            .find(|column| column.name.eq_ignore_ascii_case(name.as_str()));

        if let Some(column) = existing {
            return check_declared_type(name, column_type, &column.declared_type);
        }

        let alter = format!(
            "ALTER TABLE env_dashboard ADD COLUMN {} {}",
            name.quoted(),
            column_type.sql_type()
        );
        match self.conn.execute(&alter, []) {
            Ok(_) => {
                debug!(column = %name, "dashboard column added");
                Ok(ColumnOutcome::Added)
            }
            // Another writer added it between our check and the ALTER.
            Err(err) if is_duplicate_column(&err) => Ok(ColumnOutcome::AlreadyPresent),
            Err(err) => Err(err.into()),
        }
    }

    pub fn list_columns(&self) -> Result<Vec<ColumnInfo>> {
        table_columns(&self.conn)
    }

    /// Names of columns added at runtime, in table order.
    pub fn dynamic_columns(&self) -> Result<Vec<String>> {
        dynamic_column_names(&self.conn)
    }

    /// Upserts the row for the record's slot as an in-flight build.
    ///
    /// A row left behind by an earlier run is overwritten in place, and any
    /// dynamic column the record does not supply is reset to NULL.
    pub fn insert_on_pre(&mut self, record: &BuildRecord) -> Result<WriteOutcome> {
        record
            .validate()
            .map_err(|err| anyhow!("build record validation failed: {err}"))?;

        let recorded_at = record.recorded_at.unix_timestamp();
        let mut columns = vec![
            "slot_key".to_string(),
            "env_name".to_string(),
            "comp_name".to_string(),
            "build_number".to_string(),
            "build_url".to_string(),
            "build_status".to_string(),
            "build_job_url".to_string(),
            PACKAGE_NAME_COLUMN.to_string(),
            "created_at".to_string(),
            "recorded_at".to_string(),
        ];
        let mut values = vec![
            Value::Text(record.slot_key.as_str().to_string()),
            Value::Text(record.env_name.clone()),
            Value::Text(record.comp_name.clone()),
            Value::Text(record.build_number.clone()),
            Value::Text(record.build_url.clone()),
            Value::Text(record.status.as_str().to_string()),
            Value::Text(record.build_job_url.clone()),
            Value::Text(record.package_name.clone()),
            Value::Integer(recorded_at),
            Value::Integer(recorded_at),
        ];
        for column in &record.columns {
            columns.push(column.name.quoted());
            values.push(Value::Text(column.value.clone()));
        }

        let placeholders = (1..=values.len())
            .map(|index| format!("?{index}"))
            .collect::<Vec<_>>()
            .join(", ");
        let mut assignments = columns
            .iter()
            .skip(1)
            .map(|column| format!("{column} = excluded.{column}"))
            .collect::<Vec<_>>();

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start pre-build transaction")?;
        for name in dynamic_column_names(&tx)? {
            let supplied = record
                .columns
                .iter()
                .any(|column| column.name.as_str().eq_ignore_ascii_case(&name));
            if !supplied {
                assignments.push(format!("{} = NULL", quote_identifier(&name)));
            }
        }
        let sql = format!(
            "INSERT INTO env_dashboard ({}) VALUES ({placeholders})
             ON CONFLICT(slot_key) DO UPDATE SET {}",
            columns.join(", "),
            assignments.join(", ")
        );
        let existed = row_exists(&tx, &record.slot_key)?;
        tx.execute(&sql, params_from_iter(values.iter()))
            .with_context(|| format!("failed to insert build for {}", record.slot_key))?;
        tx.commit().context("failed to commit pre-build transaction")?;

        let outcome = if existed {
            WriteOutcome::Restarted
        } else {
            WriteOutcome::Created
        };
        debug!(slot = %record.slot_key, ?outcome, "pre-build row written");
        Ok(outcome)
    }

    /// Records the final state of the build occupying the record's slot.
    /// Returns [`WriteOutcome::MissingRow`] without writing when the slot is
    /// empty.
    pub fn update_on_post(&self, record: &BuildRecord) -> Result<WriteOutcome> {
        record
            .validate()
            .map_err(|err| anyhow!("build record validation failed: {err}"))?;

        let mut assignments = vec![
            "build_number = ?1".to_string(),
            "build_url = ?2".to_string(),
            "build_status = ?3".to_string(),
            "build_job_url = ?4".to_string(),
            "package_name = ?5".to_string(),
            "recorded_at = ?6".to_string(),
        ];
        let mut values = vec![
            Value::Text(record.build_number.clone()),
            Value::Text(record.build_url.clone()),
            Value::Text(record.status.as_str().to_string()),
            Value::Text(record.build_job_url.clone()),
            Value::Text(record.package_name.clone()),
            Value::Integer(record.recorded_at.unix_timestamp()),
        ];
        for column in &record.columns {
            values.push(Value::Text(column.value.clone()));
            assignments.push(format!("{} = ?{}", column.name.quoted(), values.len()));
        }
        values.push(Value::Text(record.slot_key.as_str().to_string()));
        let sql = format!(
            "UPDATE env_dashboard SET {} WHERE slot_key = ?{}",
            assignments.join(", "),
            values.len()
        );

        let changed = self
            .conn
            .execute(&sql, params_from_iter(values.iter()))
            .with_context(|| format!("failed to update build for {}", record.slot_key))?;

        let outcome = if changed == 0 {
            WriteOutcome::MissingRow
        } else {
            WriteOutcome::Updated
        };
        debug!(slot = %record.slot_key, ?outcome, "post-build row written");
        Ok(outcome)
    }

    pub fn delete_on_no_deploy(&self, slot_key: &SlotKey) -> Result<WriteOutcome> {
        let removed = self
            .conn
            .execute(
                "DELETE FROM env_dashboard WHERE slot_key = ?1",
                params![slot_key.as_str()],
            )
            .with_context(|| format!("failed to delete build for {slot_key}"))?;

        let outcome = if removed == 0 {
            WriteOutcome::MissingRow
        } else {
            WriteOutcome::Deleted
        };
        debug!(slot = %slot_key, ?outcome, "no-deploy row removed");
        Ok(outcome)
    }

    /// Deletes rows whose last write is strictly older than the window.
    ///
    /// `protect` names the slot written by the current event; it is never
    /// removed by the same sweep.
    pub fn prune_older_than(
        &self,
        window: RetentionWindow,
        now: OffsetDateTime,
        protect: Option<&SlotKey>,
    ) -> Result<usize> {
        let cutoff = window.cutoff(now).unix_timestamp();
        let removed = match protect {
            Some(slot_key) => self.conn.execute(
                "DELETE FROM env_dashboard WHERE recorded_at < ?1 AND slot_key <> ?2",
                params![cutoff, slot_key.as_str()],
            ),
            None => self.conn.execute(
                "DELETE FROM env_dashboard WHERE recorded_at < ?1",
                params![cutoff],
            ),
        }
        .context("failed to prune env_dashboard")?;

        debug!(days = window.days(), cutoff, removed, "retention sweep finished");
        Ok(removed)
    }

    pub fn get_record(&self, slot_key: &SlotKey) -> Result<Option<DashboardRow>> {
        let dynamic = self.dynamic_columns()?;
        let sql = format!(
            "SELECT {} FROM env_dashboard WHERE slot_key = ?1",
            select_list(&dynamic)
        );
        self.conn
            .query_row(&sql, params![slot_key.as_str()], |row| {
                parse_dashboard_row(row, &dynamic)
            })
            .optional()
            .with_context(|| format!("failed to read build for {slot_key}"))
    }

    /// All live rows, ordered by environment then component.
    pub fn list_records(&self) -> Result<Vec<DashboardRow>> {
        let dynamic = self.dynamic_columns()?;
        let sql = format!(
            "SELECT {} FROM env_dashboard ORDER BY env_name ASC, comp_name ASC",
            select_list(&dynamic)
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| parse_dashboard_row(row, &dynamic))?;
        collect_rows(rows)
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

fn check_declared_type(
    name: &ColumnName,
    column_type: ColumnType,
    declared: &str,
) -> Result<ColumnOutcome> {
    if column_type.matches_declared(declared) {
        Ok(ColumnOutcome::AlreadyPresent)
    } else {
        Err(anyhow!(
            "column {name} already exists as {declared}, requested {}",
            column_type.sql_type()
        ))
    }
}

fn is_duplicate_column(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(_, Some(message)) if message.contains("duplicate column name")
    )
}

fn table_columns(conn: &Connection) -> Result<Vec<ColumnInfo>> {
    let mut stmt = conn
        .prepare("PRAGMA table_info(env_dashboard)")
        .context("failed to inspect table_info for env_dashboard")?;
    let rows = stmt.query_map([], |row| {
        Ok(ColumnInfo {
            name: row.get(1)?,
            declared_type: row.get(2)?,
        })
    })?;
    collect_rows(rows)
}

fn dynamic_column_names(conn: &Connection) -> Result<Vec<String>> {
    Ok(table_columns(conn)?
        .into_iter()
        .map(|column| column.name)
        .filter(|name| !is_core_column(name))
        .collect())
}

fn row_exists(conn: &Connection, slot_key: &SlotKey) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT 1 FROM env_dashboard WHERE slot_key = ?1 LIMIT 1",
            params![slot_key.as_str()],
            |_| Ok(()),
        )
        .optional()
        .context("failed to query env_dashboard")?
        .is_some();
    Ok(exists)
}

fn select_list(dynamic: &[String]) -> String {
    let mut select = CORE_SELECT.to_string();
    for name in dynamic {
        select.push_str(", ");
        select.push_str(&quote_identifier(name));
    }
    select
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn parse_dashboard_row(row: &rusqlite::Row<'_>, dynamic: &[String]) -> rusqlite::Result<DashboardRow> {
    let status = BuildStatus::from(row.get::<_, String>(5)?);
    let created_at = from_unix_seconds(row.get(8)?).map_err(|err| to_sql_error(err.to_string()))?;
    let recorded_at =
        from_unix_seconds(row.get(9)?).map_err(|err| to_sql_error(err.to_string()))?;

    let mut columns = std::collections::BTreeMap::new();
    for (offset, name) in dynamic.iter().enumerate() {
        columns.insert(name.clone(), row.get::<_, Option<String>>(10 + offset)?);
    }

    Ok(DashboardRow {
        slot_key: SlotKey::from_stored(row.get(0)?),
        env_name: row.get(1)?,
        comp_name: row.get(2)?,
        build_number: row.get(3)?,
        build_url: row.get(4)?,
        status,
        build_job_url: row.get(6)?,
        package_name: row.get(7)?,
        columns,
        created_at,
        recorded_at,
    })
}

fn to_sql_error(message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}
