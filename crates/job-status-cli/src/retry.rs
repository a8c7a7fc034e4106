//! Opt-in bounded retry and dead-letter spooling for rejected events.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use job_status_core::{format_rfc3339, now_utc, RecordOutcome, StatusEvent, StatusLedger};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::queue::QueueMessage;

/// How many times a `Rejected` record call is attempted in total.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 1 }
    }
}

impl RetryPolicy {
    /// Records `event`, retrying while the ledger rejects it. Returns the
    /// last outcome and the number of attempts made.
    pub fn record<L: StatusLedger + ?Sized>(
        &self,
        ledger: &mut L,
        event: &StatusEvent,
    ) -> (RecordOutcome, u32) {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let outcome = ledger.record(event.clone());
            if !outcome.is_rejected() || attempt >= max_attempts {
                return (outcome, attempt);
            }

            if let RecordOutcome::Rejected { reason } = &outcome {
                tracing::warn!(attempt, max_attempts, reason = %reason, "retrying rejected event");
            }
            attempt += 1;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeadLetter {
    pub message_id: String,
    pub body: String,
    pub reason: String,
    pub attempts: u32,
    pub dead_lettered_at: String,
}

/// Directory of `<ulid>.json` files holding messages the ledger kept
/// rejecting.
#[derive(Debug, Clone)]
pub struct DeadLetterSpool {
    dir: PathBuf,
}

impl DeadLetterSpool {
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create dead-letter directory {}", dir.display()))?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn write(&self, message: &QueueMessage, reason: &str, attempts: u32) -> Result<PathBuf> {
        let letter = DeadLetter {
            message_id: message.message_id.clone(),
            body: message.body.clone(),
            reason: reason.to_string(),
            attempts,
            dead_lettered_at: format_rfc3339(now_utc())?,
        };

        let path = self.dir.join(format!("{}.json", Ulid::new()));
        fs::write(&path, serde_json::to_vec_pretty(&letter)?)
            .with_context(|| format!("failed to write dead letter {}", path.display()))?;
        Ok(path)
    }

    pub fn list(&self) -> Result<Vec<DeadLetter>> {
        let mut paths = Vec::new();
        let entries = fs::read_dir(&self.dir)
            .with_context(|| format!("failed to list dead letters in {}", self.dir.display()))?;
        for entry in entries {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut letters = Vec::with_capacity(paths.len());
        for path in paths {
            let body = fs::read_to_string(&path)
                .with_context(|| format!("failed to read dead letter {}", path.display()))?;
            letters.push(
                serde_json::from_str(&body)
                    .with_context(|| format!("failed to parse dead letter {}", path.display()))?,
            );
        }
        Ok(letters)
    }
}
