//! The ingestion loop: queue message to ledger row, one message at a time.
//!
//! Every message is handled in isolation. A malformed body (including one
//! that parses but can never become a row), a rejected
//! record, or a failed acknowledgment is logged and counted in the
//! [`BatchReport`]; it never aborts the rest of the batch.

use anyhow::Result;
use job_status_core::{
    format_rfc3339, normalize_value, now_utc, unwrap_envelope, RecordOutcome, StatusEvent,
    StatusLedger,
};
use serde::{Deserialize, Serialize};

use crate::queue::{MessageSource, QueueMessage};
use crate::retry::{DeadLetterSpool, RetryPolicy};

pub const INGEST_REPORT_CONTRACT_VERSION: &str = "ingest_report.v1";

/// Upper bound the queue accepts for one receive call.
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// When a message is removed from the queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AckPolicy {
    /// Acknowledge as soon as the payload parses, before the ledger write.
    /// A ledger failure after that point loses the event.
    #[default]
    BeforeRecord,
    /// Acknowledge only once the outcome is durable (`Inserted` or
    /// `Duplicate`) or the body can never succeed (malformed, or an event
    /// with no derivable `analysis_no` or no known status).
    AfterCommit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestOptions {
    pub batch_size: usize,
    pub ack: AckPolicy,
    pub retry: RetryPolicy,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            ack: AckPolicy::default(),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchReport {
    pub contract_version: String,
    pub received: usize,
    pub inserted: usize,
    pub duplicates: usize,
    pub malformed: usize,
    pub rejected: usize,
    pub dead_lettered: usize,
    pub acknowledged: usize,
    pub ack_failures: usize,
    pub started_at: String,
    pub finished_at: String,
}

impl BatchReport {
    fn start() -> Result<Self> {
        let now = format_rfc3339(now_utc())?;
        Ok(Self {
            contract_version: INGEST_REPORT_CONTRACT_VERSION.to_string(),
            received: 0,
            inserted: 0,
            duplicates: 0,
            malformed: 0,
            rejected: 0,
            dead_lettered: 0,
            acknowledged: 0,
            ack_failures: 0,
            started_at: now.clone(),
            finished_at: now,
        })
    }

    fn finish(&mut self) -> Result<()> {
        self.finished_at = format_rfc3339(now_utc())?;
        Ok(())
    }

    /// Folds a later batch into this report, keeping the earliest start.
    pub fn absorb(&mut self, other: &BatchReport) {
        self.received += other.received;
        self.inserted += other.inserted;
        self.duplicates += other.duplicates;
        self.malformed += other.malformed;
        self.rejected += other.rejected;
        self.dead_lettered += other.dead_lettered;
        self.acknowledged += other.acknowledged;
        self.ack_failures += other.ack_failures;
        self.finished_at.clone_from(&other.finished_at);
    }
}

/// Drives messages from a source into a ledger.
pub struct Ingestor<'a, S: MessageSource, L: StatusLedger> {
    source: &'a mut S,
    ledger: &'a mut L,
    options: IngestOptions,
    dead_letters: Option<DeadLetterSpool>,
}

impl<'a, S: MessageSource, L: StatusLedger> Ingestor<'a, S, L> {
    pub fn new(source: &'a mut S, ledger: &'a mut L, options: IngestOptions) -> Self {
        Self {
            source,
            ledger,
            options,
            dead_letters: None,
        }
    }

    #[must_use]
    pub fn with_dead_letters(mut self, spool: DeadLetterSpool) -> Self {
        self.dead_letters = Some(spool);
        self
    }

    /// Receives one batch and processes every message in it.
    ///
    /// # Errors
    /// Returns an error only when the receive call itself fails; per-message
    /// failures are reported in the [`BatchReport`].
    pub fn run_batch(&mut self) -> Result<BatchReport> {
        let mut report = BatchReport::start()?;
        let messages = self.source.receive(self.options.batch_size.max(1))?;
        report.received = messages.len();

        for message in &messages {
            self.process_message(message, &mut report);
        }

        report.finish()?;
        Ok(report)
    }

    /// Runs batches until a receive returns nothing.
    ///
    /// # Errors
    /// Returns an error when a receive call fails.
    pub fn drain(&mut self) -> Result<BatchReport> {
        let mut total = BatchReport::start()?;
        loop {
            let batch = self.run_batch()?;
            let done = batch.received == 0;
            total.absorb(&batch);
            if done {
                return Ok(total);
            }
        }
    }

    fn process_message(&mut self, message: &QueueMessage, report: &mut BatchReport) {
        let parsed = unwrap_envelope(&message.body)
            .and_then(normalize_value)
            .and_then(|event| event.check_recordable().map(|()| event));
        let event = match parsed {
            Ok(event) => event,
            Err(err) => {
                report.malformed += 1;
                tracing::warn!(
                    message_id = %message.message_id,
                    error = %err,
                    "dropping malformed message"
                );
                self.acknowledge(message, report);
                return;
            }
        };

        let acked_early = self.options.ack == AckPolicy::BeforeRecord;
        if acked_early {
            self.acknowledge(message, report);
        }

        let (outcome, attempts) = self.options.retry.record(&mut *self.ledger, &event);
        let mut may_ack = true;
        match &outcome {
            RecordOutcome::Inserted {
                superseded_rows, ..
            } => {
                report.inserted += 1;
                tracing::info!(
                    message_id = %message.message_id,
                    job_plan_id = %event.job_plan_id,
                    step = event.step,
                    status = status_label(&event),
                    superseded_rows = *superseded_rows,
                    "event recorded"
                );
            }
            RecordOutcome::Duplicate { kind } => {
                report.duplicates += 1;
                tracing::info!(
                    message_id = %message.message_id,
                    job_plan_id = %event.job_plan_id,
                    step = event.step,
                    status = status_label(&event),
                    kind = ?kind,
                    "duplicate event ignored"
                );
            }
            RecordOutcome::Rejected { reason } => {
                report.rejected += 1;
                tracing::error!(
                    message_id = %message.message_id,
                    job_plan_id = %event.job_plan_id,
                    step = event.step,
                    status = status_label(&event),
                    attempts,
                    reason = %reason,
                    "ledger rejected event"
                );
                may_ack = self.dead_letter(message, reason, attempts, report);
            }
        }

        if !acked_early && may_ack {
            self.acknowledge(message, report);
        }
    }

    /// Returns whether the message may now be acknowledged.
    fn dead_letter(
        &self,
        message: &QueueMessage,
        reason: &str,
        attempts: u32,
        report: &mut BatchReport,
    ) -> bool {
        let Some(spool) = &self.dead_letters else {
            return false;
        };

        match spool.write(message, reason, attempts) {
            Ok(path) => {
                report.dead_lettered += 1;
                tracing::warn!(
                    message_id = %message.message_id,
                    path = %path.display(),
                    "message dead-lettered"
                );
                true
            }
            Err(err) => {
                tracing::error!(
                    message_id = %message.message_id,
                    error = %format!("{err:#}"),
                    "failed to dead-letter message"
                );
                false
            }
        }
    }

    fn acknowledge(&mut self, message: &QueueMessage, report: &mut BatchReport) {
        match self.source.delete(&message.handle) {
            Ok(()) => {
                report.acknowledged += 1;
            }
            Err(err) => {
                report.ack_failures += 1;
                tracing::error!(
                    message_id = %message.message_id,
                    error = %format!("{err:#}"),
                    "failed to acknowledge message"
                );
            }
        }
    }
}

fn status_label(event: &StatusEvent) -> &'static str {
    event.status.map_or("UNKNOWN", |status| status.as_str())
}
