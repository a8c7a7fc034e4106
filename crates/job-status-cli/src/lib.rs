//! Command surface and ingestion runtime for the job status ledger.
//!
//! Host processes embed the ledger through [`run_cli`] for full parsed CLI
//! execution, or drive [`ingest::Ingestor`] directly with their own
//! [`queue::MessageSource`].

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use job_status_core::{normalize_value, unwrap_envelope, RecordOutcome, StatusLedger};
use job_status_store_sqlite::{JobSummary, SqliteStatusLedger, StoredStatusRow};
use serde_json::Value;

pub mod ingest;
pub mod observability;
pub mod queue;
pub mod retry;

use ingest::{AckPolicy, IngestOptions, Ingestor};
use observability::LogFormat;
use queue::SpoolDirQueue;
use retry::{DeadLetterSpool, RetryPolicy};

#[derive(Debug, Parser)]
#[command(name = "jsl")]
#[command(about = "Job status ledger: ingest step notifications into an idempotent ledger")]
pub struct Cli {
    #[arg(long, env = "JOB_STATUS_DB", default_value = "./job_status.sqlite3")]
    db: PathBuf,

    #[arg(long, value_enum, env = "JOB_STATUS_LOG_FORMAT", default_value_t = LogFormatArg::Pretty)]
    log_format: LogFormatArg,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    #[must_use]
    pub fn log_format(&self) -> LogFormat {
        match self.log_format {
            LogFormatArg::Pretty => LogFormat::Pretty,
            LogFormatArg::Json => LogFormat::Json,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Ingest(IngestArgs),
    Enqueue(EnqueueArgs),
    Normalize(PayloadArgs),
    Record(PayloadArgs),
    History(JobArgs),
    Summary(JobArgs),
}

#[derive(Debug, Args)]
pub struct IngestArgs {
    #[arg(long, env = "JOB_STATUS_QUEUE_DIR")]
    queue_dir: PathBuf,
    #[arg(long, default_value_t = ingest::DEFAULT_BATCH_SIZE)]
    batch_size: usize,
    #[arg(long, value_enum, default_value_t = AckArg::BeforeRecord)]
    ack: AckArg,
    #[arg(long, default_value_t = 1)]
    max_attempts: u32,
    #[arg(long, env = "JOB_STATUS_DEAD_LETTER_DIR")]
    dead_letter_dir: Option<PathBuf>,
    #[arg(long)]
    drain: bool,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct EnqueueArgs {
    #[arg(long, env = "JOB_STATUS_QUEUE_DIR")]
    queue_dir: PathBuf,
    #[arg(long)]
    payload: String,
    #[arg(long)]
    wrap: bool,
}

#[derive(Debug, Args)]
pub struct PayloadArgs {
    #[arg(long)]
    payload: String,
}

#[derive(Debug, Args)]
pub struct JobArgs {
    #[arg(long)]
    job_plan_id: String,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LogFormatArg {
    Pretty,
    Json,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum AckArg {
    BeforeRecord,
    AfterCommit,
}

/// Executes the parsed top-level CLI command.
///
/// # Errors
/// Returns an error when the ledger cannot be opened or migrated, the queue
/// or payload arguments are invalid, or the command itself fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Enqueue(args) => run_enqueue(&args),
        Command::Normalize(args) => run_normalize(&args),
        command => {
            let mut ledger = SqliteStatusLedger::open(&cli.db)?;
            ledger.migrate()?;
            run_with_ledger(command, &mut ledger)
        }
    }
}

/// Executes a ledger-backed command against an existing ledger handle.
///
/// # Errors
/// Returns an error when the command's queue, payload, or query fails.
pub fn run_with_ledger(command: Command, ledger: &mut SqliteStatusLedger) -> Result<()> {
    match command {
        Command::Ingest(args) => run_ingest(&args, ledger),
        Command::Record(args) => {
            let event = parse_event(&args.payload)?;
            let outcome = ledger.record(event);
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            if let RecordOutcome::Rejected { reason } = outcome {
                return Err(anyhow!("ledger rejected event: {reason}"));
            }
            Ok(())
        }
        Command::History(args) => {
            let rows = ledger.list_job_rows(&args.job_plan_id)?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else {
                print_rows(&rows);
            }
            Ok(())
        }
        Command::Summary(args) => {
            let summary = ledger.job_summary(&args.job_plan_id)?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print_summary(&summary);
            }
            Ok(())
        }
        Command::Enqueue(args) => run_enqueue(&args),
        Command::Normalize(args) => run_normalize(&args),
    }
}

fn run_ingest(args: &IngestArgs, ledger: &mut SqliteStatusLedger) -> Result<()> {
    if args.max_attempts == 0 {
        return Err(anyhow!("--max-attempts must be at least 1"));
    }

    let options = IngestOptions {
        batch_size: args.batch_size,
        ack: match args.ack {
            AckArg::BeforeRecord => AckPolicy::BeforeRecord,
            AckArg::AfterCommit => AckPolicy::AfterCommit,
        },
        retry: RetryPolicy {
            max_attempts: args.max_attempts,
        },
    };

    let mut queue = SpoolDirQueue::open(&args.queue_dir)?;
    let mut ingestor = Ingestor::new(&mut queue, ledger, options);
    if let Some(dir) = &args.dead_letter_dir {
        ingestor = ingestor.with_dead_letters(DeadLetterSpool::open(dir)?);
    }

    let report = if args.drain {
        ingestor.drain()?
    } else {
        ingestor.run_batch()?
    };

    tracing::info!(
        received = report.received,
        inserted = report.inserted,
        duplicates = report.duplicates,
        malformed = report.malformed,
        rejected = report.rejected,
        "ingest finished"
    );

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "contract={} received={} inserted={} duplicates={} malformed={} rejected={} dead_lettered={} acknowledged={} ack_failures={}",
            report.contract_version,
            report.received,
            report.inserted,
            report.duplicates,
            report.malformed,
            report.rejected,
            report.dead_lettered,
            report.acknowledged,
            report.ack_failures
        );
    }
    Ok(())
}

fn run_enqueue(args: &EnqueueArgs) -> Result<()> {
    let payload = parse_payload_json(&args.payload)?;
    let queue = SpoolDirQueue::open(&args.queue_dir)?;
    let path = queue.enqueue(&payload, args.wrap)?;
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "queued": path_text(&path),
        }))?
    );
    Ok(())
}

fn run_normalize(args: &PayloadArgs) -> Result<()> {
    let event = parse_event(&args.payload)?;
    println!("{}", serde_json::to_string_pretty(&event)?);
    Ok(())
}

fn parse_payload_json(raw: &str) -> Result<Value> {
    let value: Value = serde_json::from_str(raw).context("--payload must be valid JSON")?;
    if !value.is_object() {
        return Err(anyhow!("--payload must be a JSON object"));
    }
    Ok(value)
}

fn parse_event(raw: &str) -> Result<job_status_core::StatusEvent> {
    let value = unwrap_envelope(raw)?;
    Ok(normalize_value(value)?)
}

fn path_text(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn print_rows(rows: &[StoredStatusRow]) {
    if rows.is_empty() {
        println!("no rows");
        return;
    }
    for item in rows {
        print_row(item);
    }
}

fn print_summary(summary: &JobSummary) {
    println!(
        "contract={} job_plan_id={} current_step={}",
        summary.contract_version,
        summary.job_plan_id,
        summary
            .current_step
            .map_or_else(|| "n/a".to_string(), |step| step.to_string())
    );
    for item in &summary.steps {
        print_row(item);
    }
}

fn print_row(item: &StoredStatusRow) {
    let row = &item.row;
    println!(
        "seq={} step={} status={} analysis_no={} detail={} description={} start={} end={}",
        item.row_seq,
        row.step,
        row.status,
        row.analysis_no,
        if row.step_detail.is_empty() {
            "-"
        } else {
            row.step_detail.as_str()
        },
        row.description,
        row.start_date,
        row.end_date.as_deref().unwrap_or("n/a")
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use job_status_core::Status;
    use serde_json::json;
    use ulid::Ulid;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn execute_cli(args: &[&str]) -> Result<()> {
        let cli = Cli::try_parse_from(args)?;
        run_cli(cli)
    }

    #[test]
    fn parse_payload_rejects_non_objects() {
        assert!(parse_payload_json("[1, 2]").is_err());
        assert!(parse_payload_json("{").is_err());
        let value = must(parse_payload_json(r#"{"job_plan_id":"36"}"#));
        assert_eq!(value["job_plan_id"], json!("36"));
    }

    #[test]
    fn parse_event_accepts_envelope_and_bare_payload() {
        let payload = json!({
            "job_plan_id": "36",
            "analysis_no": "dev_test",
            "step": 9,
            "step_detail": "",
            "description": "Finish searched process",
            "start_date": "2024-09-30 06:46:18,328"
        });
        let envelope = json!({"Type": "Notification", "Message": payload.to_string()});

        let bare = must(parse_event(&payload.to_string()));
        let wrapped = must(parse_event(&envelope.to_string()));
        assert_eq!(bare, wrapped);
        assert_eq!(bare.status, Some(Status::Complete));
        assert_eq!(bare.step_detail, "STATISTICS PROCESS");
    }

    #[test]
    fn ingest_rejects_zero_attempts() {
        let root = std::env::temp_dir().join(format!("job-status-cli-attempts-{}", Ulid::new()));
        let db = path_text(&root.join("ledger.sqlite3"));
        let queue = path_text(&root.join("queue"));
        must(std::fs::create_dir_all(&root).map_err(Into::into));

        let result = execute_cli(&[
            "jsl",
            "--db",
            &db,
            "ingest",
            "--queue-dir",
            &queue,
            "--max-attempts",
            "0",
        ]);
        assert!(result.is_err());

        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn enqueue_then_ingest_records_rows() {
        let root = std::env::temp_dir().join(format!("job-status-cli-flow-{}", Ulid::new()));
        let db_path = root.join("ledger.sqlite3");
        let db = path_text(&db_path);
        let queue = path_text(&root.join("queue"));
        must(std::fs::create_dir_all(&root).map_err(Into::into));

        let payload = json!({
            "job_plan_id": "36",
            "analysis_no": "dev_test",
            "step": 5,
            "step_detail": "",
            "description": "Finish preprocessing",
            "start_date": "2024-09-30 06:00:00,000"
        })
        .to_string();
        must(execute_cli(&[
            "jsl", "enqueue", "--queue-dir", &queue, "--payload", &payload, "--wrap",
        ]));
        must(execute_cli(&[
            "jsl", "--db", &db, "ingest", "--queue-dir", &queue, "--drain", "--json",
        ]));

        let ledger = must(SqliteStatusLedger::open(&db_path));
        let rows = must(ledger.list_job_rows("36"));
        let statuses: Vec<(u8, Status)> =
            rows.iter().map(|item| (item.row.step, item.row.status)).collect();
        assert_eq!(statuses, vec![(5, Status::Complete), (6, Status::Wait)]);
        assert_eq!(rows[0].row.description, "Completed preprocessing analysis");

        let _ = std::fs::remove_dir_all(&root);
    }
}
