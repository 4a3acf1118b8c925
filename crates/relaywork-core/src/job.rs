//! [`JobState`]: the persistent per-job record that survives across
//! re-entries.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::{ErrorEntry, JobStateError};
use crate::step::StepState;

/// Optional whole-record compression for the job-data blob. Applied by
/// [`crate::client::Client::create_job`] to the initial enqueue payload
/// only; mid-run persists always write uncompressed JSON, since every
/// queue adapter already stores the blob as a structured value rather
/// than a wire byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompressionMode {
    #[default]
    None,
    GzipHex,
}

/// Gzip-compress and hex-encode a serialized job-data blob.
pub fn compress_hex(value: &serde_json::Value) -> Result<String, JobStateError> {
    use std::io::Write;
    let json = serde_json::to_vec(value).map_err(JobStateError::SchemaMismatch)?;
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder
        .write_all(&json)
        .map_err(|e| JobStateError::SchemaMismatch(e.into()))?;
    let bytes = encoder
        .finish()
        .map_err(|e| JobStateError::SchemaMismatch(e.into()))?;
    Ok(hex::encode(bytes))
}

/// Decode and gunzip a blob produced by [`compress_hex`].
pub fn decompress_hex(encoded: &str) -> Result<serde_json::Value, JobStateError> {
    use std::io::Read;
    let bytes = hex::decode(encoded)
        .map_err(|_| JobStateError::InvalidSource)?;
    let mut decoder = flate2::read::GzDecoder::new(bytes.as_slice());
    let mut json = Vec::new();
    decoder
        .read_to_end(&mut json)
        .map_err(|e| JobStateError::SchemaMismatch(e.into()))?;
    serde_json::from_slice(&json).map_err(JobStateError::SchemaMismatch)
}

/// One job that is waiting for this job's completion, recorded so that the
/// invoked job's [`crate::job_executor::JobExecutor`] can promote it out of
/// the delayed set on completion instead of relying solely on its poll.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invocation {
    pub caller_workflow_id: String,
    pub caller_step_id: String,
}

/// Severity of a buffered [`LogEntry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp_ms: i64,
    pub level: LogLevel,
    pub message: String,
    pub metadata: Option<serde_json::Value>,
}

/// Job-level timing and attempt counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobMetrics {
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub attempts: u32,
}

/// The persisted envelope wrapping a workflow's validated input.
///
/// `prepared` distinguishes an engine-managed record from a raw, not-yet
/// wrapped payload on the wire; `source` is the user's input, immutable for
/// the life of the job and never mutated after preparation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobState<T> {
    pub prepared: bool,
    pub source: T,
    pub steps: HashMap<String, StepState>,
    pub invocations: Vec<Invocation>,
    pub metrics: JobMetrics,
    pub errors: Vec<ErrorEntry>,
    pub logs: Vec<LogEntry>,
}

/// Whether [`JobState::prepare`] found an already-wrapped record (`true`)
/// or had to wrap a raw payload itself (`false`).
pub type WasPrepared = bool;

impl<T> JobState<T>
where
    T: Serialize + DeserializeOwned,
{
    /// Wrap (or recognise an existing wrap of) a job's raw data blob.
    ///
    /// If `raw` already parses as a `JobState<serde_json::Value>` with
    /// `prepared == true`, its `source` field is re-validated against `T`
    /// and returned as-is with `wasPrepared = true`. Otherwise `raw` itself
    /// is treated as the unvalidated user payload: it is deserialized into
    /// `T` (rejecting on `SchemaMismatch`) and wrapped in a fresh envelope.
    pub fn prepare(raw: &serde_json::Value) -> Result<(WasPrepared, Self), JobStateError> {
        let already_prepared = raw
            .get("prepared")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);

        if already_prepared {
            let source_value = raw.get("source").cloned().unwrap_or(serde_json::Value::Null);
            reject_nested_source(&source_value)?;
            let source: T =
                serde_json::from_value(source_value).map_err(JobStateError::SchemaMismatch)?;
            let steps = raw
                .get("steps")
                .cloned()
                .map(serde_json::from_value)
                .transpose()
                .map_err(JobStateError::SchemaMismatch)?
                .unwrap_or_default();
            let invocations = raw
                .get("invocations")
                .cloned()
                .map(serde_json::from_value)
                .transpose()
                .map_err(JobStateError::SchemaMismatch)?
                .unwrap_or_default();
            let metrics = raw
                .get("metrics")
                .cloned()
                .map(serde_json::from_value)
                .transpose()
                .map_err(JobStateError::SchemaMismatch)?
                .unwrap_or_default();
            let errors = raw
                .get("errors")
                .cloned()
                .map(serde_json::from_value)
                .transpose()
                .map_err(JobStateError::SchemaMismatch)?
                .unwrap_or_default();
            let logs = raw
                .get("logs")
                .cloned()
                .map(serde_json::from_value)
                .transpose()
                .map_err(JobStateError::SchemaMismatch)?
                .unwrap_or_default();

            return Ok((
                true,
                JobState {
                    prepared: true,
                    source,
                    steps,
                    invocations,
                    metrics,
                    errors,
                    logs,
                },
            ));
        }

        reject_nested_source(raw)?;
        let source: T = serde_json::from_value(raw.clone()).map_err(JobStateError::SchemaMismatch)?;
        Ok((
            false,
            JobState {
                prepared: true,
                source,
                steps: HashMap::new(),
                invocations: Vec::new(),
                metrics: JobMetrics::default(),
                errors: Vec::new(),
                logs: Vec::new(),
            },
        ))
    }

    /// Serialize this record back into the job-data blob shape. Fails with
    /// [`JobStateError::InvalidSource`] if `source` itself looks like a
    /// prepared envelope (nesting guard).
    pub fn to_job_data(&self) -> Result<serde_json::Value, JobStateError> {
        let source_value =
            serde_json::to_value(&self.source).map_err(JobStateError::SchemaMismatch)?;
        reject_nested_source(&source_value)?;
        Ok(serde_json::json!({
            "prepared": true,
            "source": source_value,
            "steps": self.steps,
            "invocations": self.invocations,
            "metrics": self.metrics,
            "errors": self.errors,
            "logs": self.logs,
        }))
    }
}

fn reject_nested_source(value: &serde_json::Value) -> Result<(), JobStateError> {
    let nested = value
        .get("prepared")
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false);
    if nested {
        Err(JobStateError::InvalidSource)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Payload {
        number: i64,
    }

    #[test]
    fn prepare_wraps_raw_payload() {
        let raw = serde_json::json!({ "number": 21 });
        let (was_prepared, state) = JobState::<Payload>::prepare(&raw).unwrap();
        assert!(!was_prepared);
        assert!(state.prepared);
        assert_eq!(state.source, Payload { number: 21 });
        assert!(state.steps.is_empty());
    }

    #[test]
    fn prepare_round_trip_is_idempotent() {
        let raw = serde_json::json!({ "number": 21 });
        let (_, state) = JobState::<Payload>::prepare(&raw).unwrap();
        let blob = state.to_job_data().unwrap();
        let (was_prepared_again, state_again) = JobState::<Payload>::prepare(&blob).unwrap();
        assert!(was_prepared_again);
        assert_eq!(state_again.source, state.source);
        assert_eq!(state_again.to_job_data().unwrap(), blob);
    }

    #[test]
    fn prepare_rejects_nested_prepared_source() {
        let raw = serde_json::json!({ "prepared": true, "source": { "prepared": true } });
        let err = JobState::<serde_json::Value>::prepare(&raw).unwrap_err();
        assert!(matches!(err, JobStateError::SchemaMismatch(_)) || matches!(err, JobStateError::InvalidSource));
    }

    #[test]
    fn source_is_preserved_verbatim_through_persist() {
        let raw = serde_json::json!({ "number": 7 });
        let (_, state) = JobState::<Payload>::prepare(&raw).unwrap();
        let blob = state.to_job_data().unwrap();
        assert_eq!(blob["source"]["number"], 7);
    }
}
