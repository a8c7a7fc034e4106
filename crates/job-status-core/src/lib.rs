//! Canonical model for pipeline step notifications.
//!
//! Inbound notifications arrive in one of two payload shapes. They are
//! resolved once into a [`RawPayload`], turned into a canonical
//! [`StatusEvent`] by [`normalize`], and finally resolved into the
//! [`StatusRow`] a [`StatusLedger`] persists. Every transformation here is a
//! pure function that consumes a value and returns a new one.

use std::fmt::{Display, Formatter};

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{OffsetDateTime, UtcOffset};

/// Last position in the linear pipeline. Completing it seeds no placeholder.
pub const FINAL_STEP: u8 = 10;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum StatusError {
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
    #[error("timestamp error: {0}")]
    Timestamp(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Wait,
    InProgress,
    Complete,
    Error,
}

impl Status {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Wait => "WAIT",
            Self::InProgress => "IN_PROGRESS",
            Self::Complete => "COMPLETE",
            Self::Error => "ERROR",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        [Self::Wait, Self::InProgress, Self::Complete, Self::Error]
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(value))
    }

    /// Derives a status from the free-text prefix of a description.
    ///
    /// Matching is case-insensitive: `start…` is in progress, `finish…` is
    /// complete and `error…` is an error. Anything else has no status.
    #[must_use]
    pub fn from_description(description: &str) -> Option<Self> {
        let lowered = description.to_ascii_lowercase();
        if lowered.starts_with("start") {
            Some(Self::InProgress)
        } else if lowered.starts_with("finish") {
            Some(Self::Complete)
        } else if lowered.starts_with("error") {
            Some(Self::Error)
        } else {
            None
        }
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Early-step payload (steps 0-4). Recognised by the absence of `start_date`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct LegacyPayload {
    #[serde(deserialize_with = "identifier")]
    pub job_plan_id: String,
    #[serde(default, deserialize_with = "optional_identifier")]
    pub analysis_no: Option<String>,
    #[serde(deserialize_with = "step_value")]
    pub step_number: u8,
    pub timestamp: String,
    /// Carries the step detail label in this shape.
    #[serde(default)]
    pub description: Option<String>,
    /// Carries the human-readable status line in this shape.
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub status: Option<String>,
}

/// Payload that already uses the canonical field names.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct DirectPayload {
    #[serde(deserialize_with = "identifier")]
    pub job_plan_id: String,
    #[serde(default, deserialize_with = "optional_identifier")]
    pub analysis_no: Option<String>,
    #[serde(deserialize_with = "step_value")]
    pub step: u8,
    #[serde(default)]
    pub step_detail: Option<String>,
    pub description: String,
    #[serde(default)]
    pub status: Option<String>,
    pub start_date: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawPayload {
    Legacy(LegacyPayload),
    Direct(DirectPayload),
}

impl RawPayload {
    /// Resolves a decoded JSON payload into one of the two accepted shapes.
    ///
    /// # Errors
    /// Returns [`StatusError::MalformedPayload`] when the value is not an
    /// object, a required key is missing or mistyped, or `job_plan_id` is
    /// blank.
    pub fn from_value(value: Value) -> Result<Self, StatusError> {
        let Value::Object(object) = value else {
            return Err(StatusError::MalformedPayload(
                "payload MUST be a JSON object".to_string(),
            ));
        };

        let is_direct = object.contains_key("start_date");
        let value = Value::Object(object);
        let payload = if is_direct {
            Self::Direct(serde_json::from_value(value).map_err(|err| {
                StatusError::MalformedPayload(format!("direct payload: {err}"))
            })?)
        } else {
            Self::Legacy(serde_json::from_value(value).map_err(|err| {
                StatusError::MalformedPayload(format!("legacy payload: {err}"))
            })?)
        };

        if payload.job_plan_id().trim().is_empty() {
            return Err(StatusError::MalformedPayload(
                "job_plan_id MUST be non-empty".to_string(),
            ));
        }

        Ok(payload)
    }

    #[must_use]
    pub fn job_plan_id(&self) -> &str {
        match self {
            Self::Legacy(payload) => &payload.job_plan_id,
            Self::Direct(payload) => &payload.job_plan_id,
        }
    }
}

/// Canonical, transient form of one inbound notification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusEvent {
    pub job_plan_id: String,
    pub analysis_no: Option<String>,
    pub step: u8,
    pub step_detail: String,
    pub status: Option<Status>,
    pub description: String,
    pub start_date: String,
    pub end_date: Option<String>,
}

impl StatusEvent {
    /// Checks that the event can become a row, without consuming it. An event
    /// that fails here fails on every redelivery too.
    ///
    /// # Errors
    /// Same as [`StatusEvent::into_row`].
    pub fn check_recordable(&self) -> Result<(), StatusError> {
        self.resolved_key().map(|_| ())
    }

    /// Resolves the event into a persistable row.
    ///
    /// # Errors
    /// Returns [`StatusError::MalformedPayload`] when `analysis_no` could not
    /// be derived or the status is unknown.
    pub fn into_row(self) -> Result<StatusRow, StatusError> {
        let (analysis_no, status) = self
            .resolved_key()
            .map(|(analysis_no, status)| (analysis_no.to_string(), status))?;

        Ok(StatusRow {
            job_plan_id: self.job_plan_id,
            analysis_no,
            step: self.step,
            step_detail: self.step_detail,
            status,
            description: self.description,
            start_date: self.start_date,
            end_date: self.end_date,
        })
    }

    fn resolved_key(&self) -> Result<(&str, Status), StatusError> {
        let Some(analysis_no) = self.analysis_no.as_deref() else {
            return Err(StatusError::MalformedPayload(format!(
                "analysis_no is missing and cannot be derived from job_plan_id {}",
                self.job_plan_id
            )));
        };
        let Some(status) = self.status else {
            return Err(StatusError::MalformedPayload(format!(
                "status is unknown for description {:?}",
                self.description
            )));
        };
        Ok((analysis_no, status))
    }
}

/// One row of the `job_plan_status` ledger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusRow {
    pub job_plan_id: String,
    pub analysis_no: String,
    pub step: u8,
    pub step_detail: String,
    pub status: Status,
    pub description: String,
    pub start_date: String,
    pub end_date: Option<String>,
}

impl StatusRow {
    /// Splices the start time of the superseded in-progress row into a
    /// completion. The completion's own timestamp becomes `end_date`.
    #[must_use]
    pub fn spliced_with(self, in_progress_start_date: String) -> Self {
        Self {
            end_date: Some(self.start_date),
            start_date: in_progress_start_date,
            ..self
        }
    }

    /// Applies the fixed `(status, step)` description table, keeping the
    /// current description when the table has no entry.
    #[must_use]
    pub fn with_derived_description(self) -> Self {
        match step_description(self.status, self.step) {
            Some(description) => Self {
                description: description.to_string(),
                ..self
            },
            None => self,
        }
    }

    /// Builds the WAIT row that a completion of a non-final step seeds for
    /// the next step.
    #[must_use]
    pub fn wait_placeholder(&self) -> Option<Self> {
        if self.status != Status::Complete || self.step >= FINAL_STEP {
            return None;
        }

        let next_step = self.step + 1;
        Some(Self {
            job_plan_id: self.job_plan_id.clone(),
            analysis_no: self.analysis_no.clone(),
            step: next_step,
            step_detail: self.step_detail.clone(),
            status: Status::Wait,
            description: wait_description(next_step),
            start_date: self.start_date.clone(),
            end_date: self.end_date.clone(),
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateKind {
    /// A row with the same dedup key already exists.
    AlreadyRecorded,
    /// A start notification arrived after the step completed.
    CompletedBeforeStart,
    /// A concurrent writer committed the same dedup key first.
    ConcurrentInsert,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RecordOutcome {
    Inserted {
        row: StatusRow,
        placeholder: Option<StatusRow>,
        superseded_rows: usize,
    },
    Duplicate {
        kind: DuplicateKind,
    },
    Rejected {
        reason: String,
    },
}

impl RecordOutcome {
    #[must_use]
    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected { .. })
    }
}

/// Transactional sink for canonical events.
///
/// Implementations run every read and write for one event inside a single
/// transaction and never panic or return an error: failures surface as
/// [`RecordOutcome::Rejected`].
pub trait StatusLedger {
    fn record(&mut self, event: StatusEvent) -> RecordOutcome;
}

/// Converts one raw payload into its canonical event.
#[must_use]
pub fn normalize(raw: RawPayload) -> StatusEvent {
    let fields = match raw {
        RawPayload::Legacy(payload) => Remapped::from(payload),
        RawPayload::Direct(payload) => Remapped::from(payload),
    };

    let analysis_no = fields
        .analysis_no
        .or_else(|| analysis_no_from_job_plan_id(&fields.job_plan_id));

    let status = match fields.status.as_deref() {
        Some(raw) => Status::parse(raw),
        None => Status::from_description(&fields.description),
    };

    let (step_detail, description) = if fields.step_detail.is_empty() {
        (
            default_step_detail(fields.step)
                .unwrap_or_default()
                .to_string(),
            fields.description,
        )
    } else {
        (fields.step_detail.clone(), fields.step_detail)
    };

    StatusEvent {
        job_plan_id: fields.job_plan_id,
        analysis_no,
        step: fields.step,
        step_detail,
        status,
        description,
        start_date: normalize_timestamp(&fields.start_date),
        end_date: None,
    }
}

/// Decodes and normalizes a JSON payload in one call.
///
/// # Errors
/// Returns [`StatusError::MalformedPayload`] when the payload matches
/// neither accepted shape.
pub fn normalize_value(value: Value) -> Result<StatusEvent, StatusError> {
    RawPayload::from_value(value).map(normalize)
}

/// Extracts the raw payload from a queue message body.
///
/// Bodies are usually a notification envelope whose `Message` field holds the
/// payload as a JSON string. A body that is already a payload object is
/// accepted as-is.
///
/// # Errors
/// Returns [`StatusError::MalformedEnvelope`] when the body or the embedded
/// message is not valid JSON, or the envelope has no `Message`.
pub fn unwrap_envelope(body: &str) -> Result<Value, StatusError> {
    let outer: Value = serde_json::from_str(body)
        .map_err(|err| StatusError::MalformedEnvelope(format!("body is not JSON: {err}")))?;

    match outer.get("Message") {
        Some(Value::String(inner)) => serde_json::from_str(inner).map_err(|err| {
            StatusError::MalformedEnvelope(format!("Message is not JSON: {err}"))
        }),
        Some(inner @ Value::Object(_)) => Ok(inner.clone()),
        Some(_) => Err(StatusError::MalformedEnvelope(
            "Message MUST be a JSON string or object".to_string(),
        )),
        None if outer.get("job_plan_id").is_some() => Ok(outer),
        None => Err(StatusError::MalformedEnvelope(
            "envelope has no Message field".to_string(),
        )),
    }
}

/// Replaces a decimal-comma millisecond separator with a decimal point.
#[must_use]
pub fn normalize_timestamp(raw: &str) -> String {
    raw.replace(',', ".")
}

/// `<prefix>_<analysis_no>_<suffix>` encodes the analysis number in the
/// middle component. Any other shape yields nothing.
#[must_use]
pub fn analysis_no_from_job_plan_id(job_plan_id: &str) -> Option<String> {
    let parts: Vec<&str> = job_plan_id.split('_').collect();
    match parts.as_slice() {
        [_, analysis_no, _] => Some((*analysis_no).to_string()),
        _ => None,
    }
}

#[must_use]
pub fn default_step_detail(step: u8) -> Option<&'static str> {
    match step {
        8 => Some("SEARCHED PROCESS"),
        9 => Some("STATISTICS PROCESS"),
        10 => Some("NETWORK PROCESS"),
        _ => None,
    }
}

struct StepDescriptions {
    in_progress: &'static str,
    complete: Option<&'static str>,
    error: Option<&'static str>,
}

const FIRST_DESCRIBED_STEP: u8 = 4;

const STEP_DESCRIPTIONS: [StepDescriptions; 7] = [
    StepDescriptions {
        in_progress: "Uploading converted files to cloud",
        complete: None,
        error: None,
    },
    StepDescriptions {
        in_progress: "Executing preprocessing analysis",
        complete: Some("Completed preprocessing analysis"),
        error: Some("Error preprocessing analysis"),
    },
    StepDescriptions {
        in_progress: "Executing search analysis",
        complete: Some("Completed search analysis"),
        error: Some("Error search analysis"),
    },
    StepDescriptions {
        in_progress: "Executing quantification analysis",
        complete: Some("Completed quantification analysis"),
        error: Some("Error quantification analysis"),
    },
    StepDescriptions {
        in_progress: "Executing searched result analysis",
        complete: Some("Completed searched result analysis"),
        error: Some("Error searched result analysis"),
    },
    StepDescriptions {
        in_progress: "Executing statistics analysis",
        complete: Some("Completed statistics analysis"),
        error: Some("Error statistics analysis"),
    },
    StepDescriptions {
        in_progress: "Executing network analysis",
        complete: Some("Completed network analysis"),
        error: Some("Error network analysis"),
    },
];

/// Fixed human-readable description for a `(status, step)` pair.
#[must_use]
pub fn step_description(status: Status, step: u8) -> Option<&'static str> {
    let index = usize::from(step.checked_sub(FIRST_DESCRIBED_STEP)?);
    let entry = STEP_DESCRIPTIONS.get(index)?;
    match status {
        Status::Wait => None,
        Status::InProgress => Some(entry.in_progress),
        Status::Complete => entry.complete,
        Status::Error => entry.error,
    }
}

#[must_use]
pub fn wait_description(step: u8) -> String {
    format!("Preparing for Step.{step}")
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`StatusError::Timestamp`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, StatusError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| StatusError::Timestamp(format!("failed to format RFC3339 timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

struct Remapped {
    job_plan_id: String,
    analysis_no: Option<String>,
    step: u8,
    step_detail: String,
    description: String,
    status: Option<String>,
    start_date: String,
}

impl From<LegacyPayload> for Remapped {
    fn from(payload: LegacyPayload) -> Self {
        Self {
            job_plan_id: payload.job_plan_id,
            analysis_no: payload.analysis_no,
            step: payload.step_number,
            step_detail: payload.description.unwrap_or_default(),
            description: payload.kind,
            status: payload.status,
            start_date: payload.timestamp,
        }
    }
}

impl From<DirectPayload> for Remapped {
    fn from(payload: DirectPayload) -> Self {
        Self {
            job_plan_id: payload.job_plan_id,
            analysis_no: payload.analysis_no,
            step: payload.step,
            step_detail: payload.step_detail.unwrap_or_default(),
            description: payload.description,
            status: payload.status,
            start_date: payload.start_date,
        }
    }
}

fn identifier<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(text) => Ok(text),
        Value::Number(number) => Ok(number.to_string()),
        other => Err(de::Error::custom(format!(
            "expected a string or number identifier, got {other}"
        ))),
    }
}

fn optional_identifier<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(None),
        Value::String(text) => Ok(Some(text)),
        Value::Number(number) => Ok(Some(number.to_string())),
        other => Err(de::Error::custom(format!(
            "expected a string or number identifier, got {other}"
        ))),
    }
}

fn step_value<'de, D>(deserializer: D) -> Result<u8, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    let parsed = match &value {
        Value::Number(number) => number.as_u64(),
        Value::String(text) => text.trim().parse::<u64>().ok(),
        _ => None,
    };

    match parsed.and_then(|raw| u8::try_from(raw).ok()) {
        Some(step) if step <= FINAL_STEP => Ok(step),
        _ => Err(de::Error::custom(format!(
            "step MUST be an integer in 0..={FINAL_STEP}, got {value}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn must_some<T>(value: Option<T>) -> T {
        match value {
            Some(inner) => inner,
            None => panic!("expected Some(..), got None"),
        }
    }

    fn must_err<T: std::fmt::Debug>(result: Result<T, StatusError>) -> StatusError {
        match result {
            Ok(value) => panic!("expected Err(..), got {value:?}"),
            Err(err) => err,
        }
    }

    fn fixture_row(status: Status, step: u8) -> StatusRow {
        StatusRow {
            job_plan_id: "36".to_string(),
            analysis_no: "dev_test".to_string(),
            step,
            step_detail: "STATISTICS PROCESS".to_string(),
            status,
            description: "Finish searched process".to_string(),
            start_date: "2024-09-30 06:46:18.328".to_string(),
            end_date: None,
        }
    }

    #[test]
    fn legacy_and_direct_shapes_normalize_identically() {
        let legacy = must_ok(normalize_value(json!({
            "job_plan_id": "plan_7_a",
            "timestamp": "2024-01-01 00:00:00,500",
            "step_number": 3,
            "description": "old-detail",
            "type": "Start something"
        })));
        let direct = must_ok(normalize_value(json!({
            "job_plan_id": "plan_7_a",
            "start_date": "2024-01-01 00:00:00.500",
            "step": 3,
            "step_detail": "old-detail",
            "description": "Start something"
        })));

        assert_eq!(legacy, direct);
        assert_eq!(legacy.status, Some(Status::InProgress));
        assert_eq!(legacy.start_date, "2024-01-01 00:00:00.500");
        assert_eq!(legacy.step_detail, "old-detail");
        assert_eq!(legacy.description, "old-detail");
        assert_eq!(legacy.analysis_no.as_deref(), Some("7"));
        assert_eq!(legacy.end_date, None);
    }

    #[test]
    fn payload_shape_is_chosen_by_start_date_presence() {
        let direct = must_ok(RawPayload::from_value(json!({
            "job_plan_id": "1",
            "start_date": "2024-01-01 00:00:00",
            "step": 5,
            "description": "Start"
        })));
        assert!(matches!(direct, RawPayload::Direct(_)));

        let legacy = must_ok(RawPayload::from_value(json!({
            "job_plan_id": "1",
            "timestamp": "2024-01-01 00:00:00",
            "step_number": 2,
            "type": "Start"
        })));
        assert!(matches!(legacy, RawPayload::Legacy(_)));
    }

    #[test]
    fn searched_process_finish_normalizes_to_statistics_completion() {
        let event = must_ok(normalize_value(json!({
            "job_plan_id": 36,
            "analysis_no": "dev_test",
            "step": 9,
            "step_detail": "",
            "description": "Finish searched process",
            "start_date": "2024-09-30 06:46:18,328",
            "end_date": "2024-09-30 06:46:18,328"
        })));

        assert_eq!(event.job_plan_id, "36");
        assert_eq!(event.analysis_no.as_deref(), Some("dev_test"));
        assert_eq!(event.status, Some(Status::Complete));
        assert_eq!(event.step_detail, "STATISTICS PROCESS");
        assert_eq!(event.description, "Finish searched process");
        assert_eq!(event.start_date, "2024-09-30 06:46:18.328");
        assert_eq!(event.end_date, None);
    }

    #[test]
    fn status_prefix_matching_is_case_insensitive() {
        assert_eq!(Status::from_description("START upload"), Some(Status::InProgress));
        assert_eq!(Status::from_description("finished"), Some(Status::Complete));
        assert_eq!(Status::from_description("Error: disk"), Some(Status::Error));
        assert_eq!(Status::from_description("Queued"), None);
        assert_eq!(Status::from_description(""), None);
    }

    #[test]
    fn explicit_status_wins_over_description_prefix() {
        let event = must_ok(normalize_value(json!({
            "job_plan_id": "1",
            "analysis_no": "a",
            "start_date": "2024-01-01 00:00:00",
            "step": 5,
            "description": "Start something",
            "status": "error"
        })));
        assert_eq!(event.status, Some(Status::Error));

        let unknown = must_ok(normalize_value(json!({
            "job_plan_id": "1",
            "analysis_no": "a",
            "start_date": "2024-01-01 00:00:00",
            "step": 5,
            "description": "Start something",
            "status": "PAUSED"
        })));
        assert_eq!(unknown.status, None);
    }

    #[test]
    fn analysis_no_requires_exactly_three_components() {
        assert_eq!(analysis_no_from_job_plan_id("p_42_x").as_deref(), Some("42"));
        assert_eq!(analysis_no_from_job_plan_id("p_42"), None);
        assert_eq!(analysis_no_from_job_plan_id("p_4_2_x"), None);
        assert_eq!(analysis_no_from_job_plan_id("36"), None);
    }

    #[test]
    fn explicit_analysis_no_is_kept() {
        let event = must_ok(normalize_value(json!({
            "job_plan_id": "p_42_x",
            "analysis_no": 7,
            "start_date": "2024-01-01 00:00:00",
            "step": 1,
            "description": "Start"
        })));
        assert_eq!(event.analysis_no.as_deref(), Some("7"));
    }

    #[test]
    fn empty_step_detail_uses_fixed_labels() {
        for (step, expected) in [
            (8, "SEARCHED PROCESS"),
            (9, "STATISTICS PROCESS"),
            (10, "NETWORK PROCESS"),
            (7, ""),
        ] {
            let event = must_ok(normalize_value(json!({
                "job_plan_id": "1",
                "start_date": "2024-01-01 00:00:00",
                "step": step,
                "step_detail": "",
                "description": "Start"
            })));
            assert_eq!(event.step_detail, expected);
            assert_eq!(event.description, "Start");
        }
    }

    #[test]
    fn missing_required_keys_are_malformed() {
        let missing_step = must_err(normalize_value(json!({
            "job_plan_id": "1",
            "start_date": "2024-01-01 00:00:00",
            "description": "Start"
        })));
        assert!(matches!(missing_step, StatusError::MalformedPayload(_)));

        let missing_type = must_err(normalize_value(json!({
            "job_plan_id": "1",
            "timestamp": "2024-01-01 00:00:00",
            "step_number": 1
        })));
        assert!(matches!(missing_type, StatusError::MalformedPayload(_)));

        let not_object = must_err(normalize_value(json!([1, 2])));
        assert!(matches!(not_object, StatusError::MalformedPayload(_)));
    }

    #[test]
    fn step_outside_pipeline_is_malformed() {
        let err = must_err(normalize_value(json!({
            "job_plan_id": "1",
            "start_date": "2024-01-01 00:00:00",
            "step": 11,
            "description": "Start"
        })));
        assert!(err.to_string().contains("step MUST be an integer"));

        let numeric_text = must_ok(normalize_value(json!({
            "job_plan_id": "1",
            "start_date": "2024-01-01 00:00:00",
            "step": "4",
            "description": "Start"
        })));
        assert_eq!(numeric_text.step, 4);
    }

    #[test]
    fn blank_job_plan_id_is_malformed() {
        let err = must_err(normalize_value(json!({
            "job_plan_id": "  ",
            "start_date": "2024-01-01 00:00:00",
            "step": 1,
            "description": "Start"
        })));
        assert!(matches!(err, StatusError::MalformedPayload(_)));
    }

    #[test]
    fn envelope_message_is_parsed_twice() {
        let payload = json!({"job_plan_id": "1", "step": 1}).to_string();
        let body = json!({"Type": "Notification", "Message": payload}).to_string();
        let inner = must_ok(unwrap_envelope(&body));
        assert_eq!(inner["step"], json!(1));

        let object_body = json!({"Message": {"job_plan_id": "2"}}).to_string();
        assert_eq!(must_ok(unwrap_envelope(&object_body))["job_plan_id"], json!("2"));

        let bare = json!({"job_plan_id": "3"}).to_string();
        assert_eq!(must_ok(unwrap_envelope(&bare))["job_plan_id"], json!("3"));
    }

    #[test]
    fn broken_envelopes_are_reported() {
        assert!(matches!(
            must_err(unwrap_envelope("not json")),
            StatusError::MalformedEnvelope(_)
        ));
        assert!(matches!(
            must_err(unwrap_envelope(r#"{"Message":"{oops"}"#)),
            StatusError::MalformedEnvelope(_)
        ));
        assert!(matches!(
            must_err(unwrap_envelope(r#"{"Message":5}"#)),
            StatusError::MalformedEnvelope(_)
        ));
        assert!(matches!(
            must_err(unwrap_envelope(r#"{"Subject":"x"}"#)),
            StatusError::MalformedEnvelope(_)
        ));
    }

    #[test]
    fn description_table_covers_steps_four_through_ten() {
        assert_eq!(
            step_description(Status::InProgress, 6),
            Some("Executing search analysis")
        );
        assert_eq!(
            step_description(Status::Complete, 6),
            Some("Completed search analysis")
        );
        assert_eq!(step_description(Status::Error, 6), Some("Error search analysis"));
        assert_eq!(
            step_description(Status::InProgress, 4),
            Some("Uploading converted files to cloud")
        );
        assert_eq!(step_description(Status::Complete, 4), None);
        assert_eq!(step_description(Status::Error, 4), None);
        assert_eq!(step_description(Status::InProgress, 3), None);
        assert_eq!(step_description(Status::Wait, 6), None);
        assert_eq!(step_description(Status::Complete, 11), None);
        for step in 5..=FINAL_STEP {
            assert!(step_description(Status::Complete, step).is_some());
        }
    }

    #[test]
    fn unresolvable_events_do_not_become_rows() {
        let event = must_ok(normalize_value(json!({
            "job_plan_id": "36",
            "start_date": "2024-01-01 00:00:00",
            "step": 1,
            "description": "Start"
        })));
        assert!(event.check_recordable().is_err());
        let err = must_err(event.into_row());
        assert!(err.to_string().contains("analysis_no"));

        let event = must_ok(normalize_value(json!({
            "job_plan_id": "36",
            "analysis_no": "a",
            "start_date": "2024-01-01 00:00:00",
            "step": 1,
            "description": "Queued"
        })));
        let err = must_err(event.check_recordable());
        assert!(err.to_string().contains("status is unknown"));
        let err = must_err(event.into_row());
        assert!(err.to_string().contains("status"));

        let event = must_ok(normalize_value(json!({
            "job_plan_id": "36",
            "analysis_no": "a",
            "start_date": "2024-01-01 00:00:00",
            "step": 1,
            "description": "Start"
        })));
        must_ok(event.check_recordable());
    }

    #[test]
    fn splice_moves_completion_time_to_end_date() {
        let row = fixture_row(Status::Complete, 9).spliced_with("2024-09-30 06:00:00.000".to_string());
        assert_eq!(row.start_date, "2024-09-30 06:00:00.000");
        assert_eq!(row.end_date.as_deref(), Some("2024-09-30 06:46:18.328"));
    }

    #[test]
    fn derived_description_replaces_only_known_pairs() {
        let row = fixture_row(Status::Complete, 9).with_derived_description();
        assert_eq!(row.description, "Completed statistics analysis");

        let untouched = fixture_row(Status::Complete, 2).with_derived_description();
        assert_eq!(untouched.description, "Finish searched process");
    }

    #[test]
    fn completion_seeds_wait_for_next_step_only() {
        let placeholder = must_some(fixture_row(Status::Complete, 9).wait_placeholder());
        assert_eq!(placeholder.step, 10);
        assert_eq!(placeholder.status, Status::Wait);
        assert_eq!(placeholder.description, "Preparing for Step.10");
        assert_eq!(placeholder.step_detail, "STATISTICS PROCESS");

        assert!(fixture_row(Status::Complete, FINAL_STEP).wait_placeholder().is_none());
        assert!(fixture_row(Status::InProgress, 3).wait_placeholder().is_none());
    }

    #[test]
    fn record_outcome_serializes_with_outcome_tag() {
        let value = must_ok(serde_json::to_value(RecordOutcome::Duplicate {
            kind: DuplicateKind::CompletedBeforeStart,
        }));
        assert_eq!(
            value,
            json!({"outcome": "duplicate", "kind": "completed_before_start"})
        );
    }
}
