//! Extraction of cache results from a job's execution log.
//!
//! The batch driver prints one JSON event per line on stdout, prefixed with
//! `stdout: `. Successful `CACHE_RESULT` events carry the whole-execution
//! result; `CACHE_AFTER_STEP_RESULT` events carry per-step results. Any other
//! line is ignored. A cache event that cannot be parsed fails the extraction
//! rather than dropping a result.

use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use db::models::ExecutionLogEntry;

use crate::PipelineError;

/// Log entry key under which the batch driver's output is recorded.
pub const DRIVER_LOG_KEY: &str = "step.src.batch-exec";

const STDOUT_PREFIX: &str = "stdout: ";
const OP_CACHE_RESULT: &str = "CACHE_RESULT";
const OP_CACHE_AFTER_STEP_RESULT: &str = "CACHE_AFTER_STEP_RESULT";
const STATUS_SUCCESS: &str = "SUCCESS";
const CACHE_OPERATION_MARKER: &str = "\"CACHE_";

#[derive(Debug, Deserialize)]
struct LogEvent {
    operation: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    metadata: Value,
}

#[derive(Debug, Deserialize)]
struct CacheMetadata {
    key: String,
    value: Value,
}

/// One cache result as written by the driver. `value` is kept serialized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheResult {
    pub key: String,
    pub value: String,
}

/// Everything the driver reported for one job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheResults {
    pub execution: Option<CacheResult>,
    pub steps: Vec<CacheResult>,
}

impl CacheResults {
    /// Step results first, then the whole-execution result.
    pub fn iter(&self) -> impl Iterator<Item = &CacheResult> {
        self.steps.iter().chain(self.execution.iter())
    }

    pub fn len(&self) -> usize {
        self.steps.len() + usize::from(self.execution.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Parse the driver's log entry of job `job_id`.
///
/// Fails with [`PipelineError::NoDriverLog`] when the driver entry is missing
/// and with [`PipelineError::MultipleExecutionResults`] when the driver
/// reported more than one whole-execution result. A line that names a cache
/// operation but is not valid JSON, e.g. a truncated one, is a
/// [`PipelineError::MalformedCacheValue`].
pub fn extract_cache_results(job_id: i64, logs: &[ExecutionLogEntry]) -> Result<CacheResults, PipelineError> {
    let driver = logs
        .iter()
        .find(|entry| entry.key == DRIVER_LOG_KEY)
        .ok_or(PipelineError::NoDriverLog(job_id))?;

    let mut execution = Vec::new();
    let mut steps = Vec::new();

    for line in driver.out.lines() {
        let Some(payload) = line.strip_prefix(STDOUT_PREFIX) else {
            continue;
        };
        let event = match serde_json::from_str::<LogEvent>(payload) {
            Ok(event) => event,
            Err(err) if payload.contains(CACHE_OPERATION_MARKER) => {
                return Err(PipelineError::MalformedCacheValue(format!("unparseable cache event: {err}")));
            }
            Err(err) => {
                if payload.trim_start().starts_with('{') {
                    warn!(job_id, error = %err, "skipping unparseable driver event");
                }
                continue;
            }
        };
        if event.status != STATUS_SUCCESS {
            continue;
        }

        let target = match event.operation.as_str() {
            OP_CACHE_RESULT => &mut execution,
            OP_CACHE_AFTER_STEP_RESULT => &mut steps,
            _ => continue,
        };

        let metadata: CacheMetadata = serde_json::from_value(event.metadata).map_err(|err| {
            PipelineError::MalformedCacheValue(format!("{} event: {err}", event.operation))
        })?;
        let value = serde_json::to_string(&metadata.value)
            .map_err(|err| PipelineError::MalformedCacheValue(err.to_string()))?;
        target.push(CacheResult { key: metadata.key, value });
    }

    if execution.len() > 1 {
        return Err(PipelineError::MultipleExecutionResults(execution.len()));
    }

    Ok(CacheResults { execution: execution.pop(), steps })
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn entry(key: &str, out: &str) -> ExecutionLogEntry {
        ExecutionLogEntry {
            key: key.to_string(),
            command: vec![],
            start_time: Utc::now(),
            exit_code: Some(0),
            out: out.to_string(),
            duration_ms: None,
        }
    }

    #[test]
    fn missing_driver_entry_is_an_error() {
        let logs = vec![entry("setup.git.init", "stdout: hello")];
        let err = extract_cache_results(3, &logs).unwrap_err();
        assert!(matches!(err, PipelineError::NoDriverLog(3)));
    }

    #[test]
    fn collects_step_and_execution_results() {
        let out = [
            "",
            "stdout: not json",
            r#"stderr: {"operation":"CACHE_RESULT","status":"SUCCESS","metadata":{"key":"ignored","value":{}}}"#,
            r#"stdout: {"operation":"PREPARING_DOCKER_IMAGES","timestamp":"2021-01-01T00:00:00Z","status":"SUCCESS"}"#,
            r#"stdout: {"operation":"CACHE_AFTER_STEP_RESULT","status":"STARTED","metadata":{"key":"s0","value":{}}}"#,
            r#"stdout: {"operation":"CACHE_AFTER_STEP_RESULT","status":"SUCCESS","metadata":{"key":"s0","value":{"stepIndex":0}}}"#,
            r#"stdout: {"operation":"CACHE_AFTER_STEP_RESULT","status":"SUCCESS","metadata":{"key":"s1","value":{"stepIndex":1}}}"#,
            r#"stdout: {"operation":"CACHE_RESULT","status":"SUCCESS","metadata":{"key":"exec","value":{"diff":""}}}"#,
        ]
        .join("\n");

        let results = extract_cache_results(1, &[entry(DRIVER_LOG_KEY, &out)]).unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results.steps[0].key, "s0");
        assert_eq!(results.steps[1].value, r#"{"stepIndex":1}"#);
        assert_eq!(results.execution.as_ref().map(|r| r.key.as_str()), Some("exec"));
    }

    #[test]
    fn two_execution_results_are_rejected() {
        let line = r#"stdout: {"operation":"CACHE_RESULT","status":"SUCCESS","metadata":{"key":"a","value":{}}}"#;
        let out = format!("{line}\n{line}");
        let err = extract_cache_results(1, &[entry(DRIVER_LOG_KEY, &out)]).unwrap_err();
        assert!(matches!(err, PipelineError::MultipleExecutionResults(2)));
    }

    #[test]
    fn cache_event_without_key_is_malformed() {
        let out = r#"stdout: {"operation":"CACHE_RESULT","status":"SUCCESS","metadata":{"value":{}}}"#;
        let err = extract_cache_results(1, &[entry(DRIVER_LOG_KEY, out)]).unwrap_err();
        assert!(matches!(err, PipelineError::MalformedCacheValue(_)));
    }

    #[test]
    fn truncated_cache_event_is_malformed() {
        let out = [
            r#"stdout: {"operation":"CACHE_AFTER_STEP_RESULT","status":"SUCCESS","metadata":{"key":"s0","value":{}}}"#,
            r#"stdout: {"operation":"CACHE_RESULT","status":"SUCCESS","metadata":{"key":"exec","val"#,
        ]
        .join("\n");
        let err = extract_cache_results(1, &[entry(DRIVER_LOG_KEY, &out)]).unwrap_err();
        assert!(matches!(err, PipelineError::MalformedCacheValue(msg) if msg.contains("unparseable")));
    }

    #[test]
    fn truncated_non_cache_event_is_skipped() {
        let out = [
            r#"stdout: {"operation":"PREPARING_DOCKER_IMAGES","status":"STAR"#,
            r#"stdout: {"operation":"CACHE_RESULT","status":"SUCCESS","metadata":{"key":"exec","value":{}}}"#,
        ]
        .join("\n");
        let results = extract_cache_results(1, &[entry(DRIVER_LOG_KEY, &out)]).unwrap();
        assert_eq!(results.execution.map(|r| r.key), Some("exec".to_string()));
    }

    #[test]
    fn driver_without_events_yields_nothing() {
        let results = extract_cache_results(1, &[entry(DRIVER_LOG_KEY, "stdout: done")]).unwrap();
        assert!(results.is_empty());
    }
}
