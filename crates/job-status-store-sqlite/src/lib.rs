#![allow(clippy::missing_errors_doc)]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use job_status_core::{
    format_rfc3339, now_utc, DuplicateKind, RecordOutcome, Status, StatusEvent, StatusLedger,
    StatusRow,
};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

const STATUS_MIGRATION_VERSION: i64 = 1;

const DEDUP_KEY_COLUMNS: [&str; 4] = ["job_plan_id", "analysis_no", "step", "status"];

const LEDGER_COLUMNS: [&str; 9] = [
    "job_plan_id",
    "analysis_no",
    "step",
    "step_detail",
    "status",
    "description",
    "start_date",
    "end_date",
    "recorded_at",
];

const ROW_COLUMNS: &str = "row_seq, recorded_at, job_plan_id, analysis_no, step, step_detail, \
                           status, description, start_date, end_date";

const SCHEMA_STATUS_V1: &str = r"
CREATE TABLE IF NOT EXISTS job_plan_status (
  row_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  job_plan_id TEXT NOT NULL,
  analysis_no TEXT NOT NULL,
  step INTEGER NOT NULL CHECK (step BETWEEN 0 AND 10),
  step_detail TEXT NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('WAIT', 'IN_PROGRESS', 'COMPLETE', 'ERROR')),
  description TEXT NOT NULL,
  start_date TEXT NOT NULL,
  end_date TEXT,
  recorded_at TEXT NOT NULL,
  UNIQUE (job_plan_id, analysis_no, step, status)
);

CREATE TRIGGER IF NOT EXISTS trg_job_plan_status_no_update
BEFORE UPDATE ON job_plan_status
BEGIN
  SELECT RAISE(FAIL, 'job_plan_status is append/delete only');
END;

CREATE INDEX IF NOT EXISTS idx_job_plan_status_job_step_status
  ON job_plan_status(job_plan_id, step, status);
";

/// The job step ledger backed by a single `SQLite` connection.
pub struct SqliteStatusLedger {
    conn: Connection,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct StoredStatusRow {
    pub row_seq: i64,
    pub recorded_at: String,
    #[serde(flatten)]
    pub row: StatusRow,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct JobSummary {
    pub contract_version: String,
    pub job_plan_id: String,
    pub current_step: Option<u8>,
    pub steps: Vec<StoredStatusRow>,
}

impl SqliteStatusLedger {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_STATUS_V1)
            .context("failed to apply job_plan_status schema")?;

        ensure_ledger_compatibility(&self.conn)?;

        let now = format_rfc3339(now_utc())?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![STATUS_MIGRATION_VERSION, now],
            )
            .context("failed to register job_plan_status schema migration")?;

        Ok(())
    }

    pub fn list_job_rows(&self, job_plan_id: &str) -> Result<Vec<StoredStatusRow>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ROW_COLUMNS}
             FROM job_plan_status
             WHERE job_plan_id = ?1
             ORDER BY step ASC, row_seq ASC"
        ))?;

        let rows = stmt.query_map(params![job_plan_id], parse_status_row)?;
        collect_rows(rows)
    }

    pub fn list_rows_for_step(&self, job_plan_id: &str, step: u8) -> Result<Vec<StoredStatusRow>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ROW_COLUMNS}
             FROM job_plan_status
             WHERE job_plan_id = ?1 AND step = ?2
             ORDER BY row_seq ASC"
        ))?;

        let rows = stmt.query_map(params![job_plan_id, i64::from(step)], parse_status_row)?;
        collect_rows(rows)
    }

    pub fn count_rows_for_key(
        &self,
        job_plan_id: &str,
        analysis_no: &str,
        step: u8,
        status: Status,
    ) -> Result<usize> {
        count_key(&self.conn, job_plan_id, analysis_no, step, status)
    }

    pub fn count_rows(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM job_plan_status", [], |row| row.get(0))
            .context("failed to count job_plan_status rows")?;
        usize::try_from(count).context("row count out of range")
    }

    /// Latest surviving row of every step the job has reached.
    pub fn job_summary(&self, job_plan_id: &str) -> Result<JobSummary> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ROW_COLUMNS}
             FROM job_plan_status AS head
             WHERE job_plan_id = ?1
               AND row_seq = (
                 SELECT MAX(row_seq)
                 FROM job_plan_status AS newer
                 WHERE newer.job_plan_id = head.job_plan_id
                   AND newer.step = head.step
               )
             ORDER BY step ASC"
        ))?;

        let rows = stmt.query_map(params![job_plan_id], parse_status_row)?;
        let steps = collect_rows(rows)?;
        let current_step = steps.iter().map(|item| item.row.step).max();

        Ok(JobSummary {
            contract_version: "job_summary.v1".to_string(),
            job_plan_id: job_plan_id.to_string(),
            current_step,
            steps,
        })
    }

    fn try_record(&mut self, event: StatusEvent) -> Result<RecordOutcome> {
        let row = event.into_row()?;
        let recorded_at = format_rfc3339(now_utc())?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start status transaction")?;

        if count_key(&tx, &row.job_plan_id, &row.analysis_no, row.step, row.status)? > 0 {
            tracing::debug!(
                job_plan_id = %row.job_plan_id,
                step = row.step,
                status = %row.status,
                "dedup key already recorded"
            );
            return Ok(RecordOutcome::Duplicate {
                kind: DuplicateKind::AlreadyRecorded,
            });
        }

        let mut superseded_rows = 0_usize;
        let row = match row.status {
            Status::InProgress => {
                if step_has_status(&tx, &row.job_plan_id, row.step, Status::Complete)? {
                    tracing::debug!(
                        job_plan_id = %row.job_plan_id,
                        step = row.step,
                        "start arrived after completion"
                    );
                    return Ok(RecordOutcome::Duplicate {
                        kind: DuplicateKind::CompletedBeforeStart,
                    });
                }
                superseded_rows += delete_step_rows(&tx, &row.job_plan_id, row.step, Status::Wait)?;
                row
            }
            Status::Complete => {
                let started = earliest_start_date(&tx, &row.job_plan_id, row.step, Status::InProgress)?;
                superseded_rows +=
                    delete_step_rows(&tx, &row.job_plan_id, row.step, Status::InProgress)?;
                match started {
                    Some(start_date) => {
                        tracing::debug!(
                            job_plan_id = %row.job_plan_id,
                            step = row.step,
                            start_date = %start_date,
                            "splicing in-progress start into completion"
                        );
                        row.spliced_with(start_date)
                    }
                    None => row,
                }
            }
            Status::Wait | Status::Error => row,
        };
        let row = row.with_derived_description();

        match insert_row(&tx, &row, &recorded_at) {
            Ok(()) => {}
            Err(err) if is_unique_violation(&err) => {
                return Ok(RecordOutcome::Duplicate {
                    kind: DuplicateKind::ConcurrentInsert,
                });
            }
            Err(err) => return Err(err).context("failed to insert job_plan_status row"),
        }

        let placeholder = row.wait_placeholder();
        if let Some(wait) = &placeholder {
            superseded_rows += delete_step_rows(&tx, &wait.job_plan_id, wait.step, Status::Wait)?;
            insert_row(&tx, wait, &recorded_at).context("failed to seed WAIT placeholder row")?;
            tracing::debug!(
                job_plan_id = %wait.job_plan_id,
                step = wait.step,
                "seeded WAIT placeholder"
            );
        }

        tx.commit().context("failed to commit status transaction")?;

        Ok(RecordOutcome::Inserted {
            row,
            placeholder,
            superseded_rows,
        })
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl StatusLedger for SqliteStatusLedger {
    fn record(&mut self, event: StatusEvent) -> RecordOutcome {
        match self.try_record(event) {
            Ok(outcome) => outcome,
            Err(err) => RecordOutcome::Rejected {
                reason: format!("{err:#}"),
            },
        }
    }
}

fn count_key(
    conn: &Connection,
    job_plan_id: &str,
    analysis_no: &str,
    step: u8,
    status: Status,
) -> Result<usize> {
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM job_plan_status
             WHERE job_plan_id = ?1 AND analysis_no = ?2 AND step = ?3 AND status = ?4",
            params![job_plan_id, analysis_no, i64::from(step), status.as_str()],
            |row| row.get(0),
        )
        .context("failed to count rows for dedup key")?;
    usize::try_from(count).context("dedup count out of range")
}

fn step_has_status(conn: &Connection, job_plan_id: &str, step: u8, status: Status) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT 1 FROM job_plan_status
             WHERE job_plan_id = ?1 AND step = ?2 AND status = ?3
             LIMIT 1",
            params![job_plan_id, i64::from(step), status.as_str()],
            |_| Ok(()),
        )
        .optional()
        .with_context(|| format!("failed to look up {status} row for step {step}"))?
        .is_some();

    Ok(exists)
}

fn earliest_start_date(
    conn: &Connection,
    job_plan_id: &str,
    step: u8,
    status: Status,
) -> Result<Option<String>> {
    conn.query_row(
        "SELECT start_date FROM job_plan_status
         WHERE job_plan_id = ?1 AND step = ?2 AND status = ?3
         ORDER BY row_seq ASC
         LIMIT 1",
        params![job_plan_id, i64::from(step), status.as_str()],
        |row| row.get(0),
    )
    .optional()
    .with_context(|| format!("failed to read {status} start_date for step {step}"))
}

fn delete_step_rows(conn: &Connection, job_plan_id: &str, step: u8, status: Status) -> Result<usize> {
    conn.execute(
        "DELETE FROM job_plan_status
         WHERE job_plan_id = ?1 AND step = ?2 AND status = ?3",
        params![job_plan_id, i64::from(step), status.as_str()],
    )
    .with_context(|| format!("failed to delete superseded {status} rows for step {step}"))
}

fn insert_row(conn: &Connection, row: &StatusRow, recorded_at: &str) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO job_plan_status(
            job_plan_id, analysis_no, step, step_detail, status,
            description, start_date, end_date, recorded_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            row.job_plan_id,
            row.analysis_no,
            i64::from(row.step),
            row.step_detail,
            row.status.as_str(),
            row.description,
            row.start_date,
            row.end_date,
            recorded_at,
        ],
    )?;
    Ok(())
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

fn parse_status_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredStatusRow> {
    let step_i64: i64 = row.get(4)?;
    let status_raw: String = row.get(6)?;

    let step = u8::try_from(step_i64)
        .map_err(|_| invalid_column(4, Type::Integer, format!("invalid step: {step_i64}")))?;
    let status = Status::parse(&status_raw)
        .ok_or_else(|| invalid_column(6, Type::Text, format!("invalid status: {status_raw}")))?;

    Ok(StoredStatusRow {
        row_seq: row.get(0)?,
        recorded_at: row.get(1)?,
        row: StatusRow {
            job_plan_id: row.get(2)?,
            analysis_no: row.get(3)?,
            step,
            step_detail: row.get(5)?,
            status,
            description: row.get(7)?,
            start_date: row.get(8)?,
            end_date: row.get(9)?,
        },
    })
}

fn invalid_column(index: usize, column_type: Type, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        column_type,
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

/// A pre-existing `job_plan_status` table is not altered by the schema
/// script, so its columns and its dedup key index are checked explicitly.
fn ensure_ledger_compatibility(conn: &Connection) -> Result<()> {
    let present = pragma_names(conn, "SELECT name FROM pragma_table_info('job_plan_status')", [])?;
    if let Some(missing) = LEDGER_COLUMNS
        .iter()
        .find(|column| !present.iter().any(|name| name.as_str() == **column))
    {
        return Err(anyhow!(
            "ledger compatibility check failed: job_plan_status has no {missing} column"
        ));
    }

    let unique_indexes = pragma_names(
        conn,
        "SELECT name FROM pragma_index_list('job_plan_status') WHERE \"unique\" = 1",
        [],
    )?;
    for index_name in unique_indexes {
        let key = pragma_names(
            conn,
            "SELECT name FROM pragma_index_info(?1) ORDER BY seqno",
            params![index_name],
        )?;
        if key == DEDUP_KEY_COLUMNS {
            return Ok(());
        }
    }

    Err(anyhow!(
        "ledger compatibility check failed: expected UNIQUE({}) on job_plan_status",
        DEDUP_KEY_COLUMNS.join(", ")
    ))
}

fn pragma_names(conn: &Connection, sql: &str, args: impl rusqlite::Params) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare(sql)
        .with_context(|| format!("failed to inspect ledger schema with {sql}"))?;
    let rows = stmt.query_map(args, |row| row.get::<_, String>(0))?;
    collect_rows(rows)
}
