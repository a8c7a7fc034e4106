//! Queue adapters the ingestion loop receives from.

use std::collections::{BTreeSet, HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde_json::{json, Value};
use ulid::Ulid;

/// Opaque token used to acknowledge one delivery.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeliveryHandle(pub String);

impl DeliveryHandle {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// One delivered message. `body` is the raw string exactly as queued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub message_id: String,
    pub body: String,
    pub handle: DeliveryHandle,
}

pub trait MessageSource {
    /// Returns up to `max` messages that are not currently in flight.
    fn receive(&mut self, max: usize) -> Result<Vec<QueueMessage>>;

    /// Removes an in-flight message from the queue.
    fn delete(&mut self, handle: &DeliveryHandle) -> Result<()>;
}

/// A directory of `*.json` files, one message per file.
///
/// Files are delivered in name order. A received file stays in flight (not
/// redelivered by this handle) until it is deleted or the queue is dropped.
#[derive(Debug)]
pub struct SpoolDirQueue {
    dir: PathBuf,
    in_flight: HashSet<PathBuf>,
}

impl SpoolDirQueue {
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create spool directory {}", dir.display()))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            in_flight: HashSet::new(),
        })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Writes one message file. With `wrap`, the payload is embedded as a
    /// JSON string in a notification envelope.
    pub fn enqueue(&self, payload: &Value, wrap: bool) -> Result<PathBuf> {
        let message_id = Ulid::new().to_string();
        let body = if wrap {
            json!({
                "Type": "Notification",
                "MessageId": message_id,
                "Message": serde_json::to_string(payload)?,
            })
        } else {
            payload.clone()
        };

        let final_path = self.dir.join(format!("{message_id}.json"));
        let staging_path = self.dir.join(format!("{message_id}.json.tmp"));
        fs::write(&staging_path, serde_json::to_vec(&body)?)
            .with_context(|| format!("failed to write {}", staging_path.display()))?;
        fs::rename(&staging_path, &final_path)
            .with_context(|| format!("failed to publish {}", final_path.display()))?;

        Ok(final_path)
    }

    fn pending_files(&self) -> Result<BTreeSet<PathBuf>> {
        let entries = fs::read_dir(&self.dir)
            .with_context(|| format!("failed to list spool directory {}", self.dir.display()))?;

        let mut files = BTreeSet::new();
        for entry in entries {
            let path = entry?.path();
            let is_message = path.extension().is_some_and(|ext| ext == "json") && path.is_file();
            if is_message && !self.in_flight.contains(&path) {
                files.insert(path);
            }
        }
        Ok(files)
    }
}

impl MessageSource for SpoolDirQueue {
    fn receive(&mut self, max: usize) -> Result<Vec<QueueMessage>> {
        let mut messages = Vec::new();
        for path in self.pending_files()?.into_iter().take(max) {
            // A file that vanished or cannot be read is left for a later pass;
            // undecodable bytes are delivered lossily so the body fails parsing
            // and is acknowledged like any other malformed message.
            let bytes = match fs::read(&path) {
                Ok(bytes) => bytes,
                Err(err) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %err,
                        "skipping unreadable message file"
                    );
                    continue;
                }
            };
            let body = String::from_utf8_lossy(&bytes).into_owned();
            let message_id = path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_default();

            self.in_flight.insert(path.clone());
            messages.push(QueueMessage {
                message_id,
                body,
                handle: DeliveryHandle(path.to_string_lossy().into_owned()),
            });
        }
        Ok(messages)
    }

    fn delete(&mut self, handle: &DeliveryHandle) -> Result<()> {
        let path = PathBuf::from(handle.as_str());
        if !self.in_flight.contains(&path) {
            return Err(anyhow!("unknown delivery handle {}", handle.as_str()));
        }

        fs::remove_file(&path)
            .with_context(|| format!("failed to delete message file {}", path.display()))?;
        self.in_flight.remove(&path);
        Ok(())
    }
}

/// In-process queue with explicit redelivery, used by tests and embedders.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    pending: VecDeque<QueueMessage>,
    in_flight: Vec<QueueMessage>,
    fail_deletes: bool,
}

impl MemoryQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a raw body and returns its message id.
    pub fn push(&mut self, body: impl Into<String>) -> String {
        let message_id = Ulid::new().to_string();
        self.pending.push_back(QueueMessage {
            message_id: message_id.clone(),
            body: body.into(),
            handle: DeliveryHandle(format!("receipt-{message_id}")),
        });
        message_id
    }

    /// Makes every subsequent `delete` fail, as a lost queue connection would.
    pub fn fail_deletes(&mut self, fail: bool) {
        self.fail_deletes = fail;
    }

    /// Returns unacknowledged in-flight messages to the queue, as a
    /// visibility timeout would.
    pub fn redeliver(&mut self) {
        for message in self.in_flight.drain(..).rev() {
            self.pending.push_front(message);
        }
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }
}

impl MessageSource for MemoryQueue {
    fn receive(&mut self, max: usize) -> Result<Vec<QueueMessage>> {
        let count = max.min(self.pending.len());
        let batch: Vec<QueueMessage> = self.pending.drain(..count).collect();
        self.in_flight.extend(batch.iter().cloned());
        Ok(batch)
    }

    fn delete(&mut self, handle: &DeliveryHandle) -> Result<()> {
        if self.fail_deletes {
            return Err(anyhow!("queue unavailable while deleting {}", handle.as_str()));
        }

        let position = self
            .in_flight
            .iter()
            .position(|message| &message.handle == handle)
            .ok_or_else(|| anyhow!("unknown delivery handle {}", handle.as_str()))?;
        self.in_flight.remove(position);
        Ok(())
    }
}
