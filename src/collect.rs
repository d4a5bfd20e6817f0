//! Output collection: raw job results become structured records.
//!
//! The [`Collector`] applies the batch's output contract (an
//! [`OutputParser`]) to each `Succeeded` result's stdout. A contract
//! violation degrades that one result to `Failed` with a
//! `MalformedOutput` reason; it never unwinds into scheduling and is not
//! retried. Truncated stdout usually fails its contract the same way.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use tracing::{debug, warn};

use crate::result::{FailureReason, JobResult};
use crate::state::JobState;

/// Structured data parsed from a job's stdout.
pub type Record = Map<String, Value>;

/// A job result paired with the data parsed from it. The result may have
/// been degraded by the contract check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectedResult {
    pub result: JobResult,
    /// Parsed stdout fields; `None` for failed and skipped jobs.
    pub data: Option<Record>,
}

/// Why stdout failed the output contract.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("expected a JSON object, got {0}")]
    NotAnObject(&'static str),

    #[error("line {line} is not key=value: {text:?}")]
    BadLine { line: usize, text: String },
}

/// Parses a succeeded job's stdout into a [`Record`].
pub trait OutputParser: Send + Sync {
    fn parse(&self, stdout: &str) -> Result<Record, ParseError>;
}

/// Stdout is one JSON object.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonOutput;

impl OutputParser for JsonOutput {
    fn parse(&self, stdout: &str) -> Result<Record, ParseError> {
        let value: Value = serde_json::from_str(stdout.trim())?;
        match value {
            Value::Object(map) => Ok(map),
            other => Err(ParseError::NotAnObject(json_type_name(&other))),
        }
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

static KEY_VALUE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*([A-Za-z_][A-Za-z0-9_.\-]*)\s*=\s*(.*?)\s*$").expect("key=value line regex")
});

/// Stdout is `key=value` lines, one field per line. Blank lines are
/// ignored; anything else violates the contract. Values that read as
/// numbers or booleans are typed accordingly.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyValueOutput;

impl OutputParser for KeyValueOutput {
    fn parse(&self, stdout: &str) -> Result<Record, ParseError> {
        let mut record = Record::new();
        for (i, line) in stdout.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let Some(caps) = KEY_VALUE_LINE.captures(line) else {
                return Err(ParseError::BadLine {
                    line: i + 1,
                    text: line.to_string(),
                });
            };
            record.insert(caps[1].to_string(), parse_scalar(&caps[2]));
        }
        Ok(record)
    }
}

fn parse_scalar(s: &str) -> Value {
    if let Ok(i) = s.parse::<i64>() {
        return Value::Number(i.into());
    }
    if let Ok(f) = s.parse::<f64>() {
        if let Some(n) = Number::from_f64(f) {
            return Value::Number(n);
        }
    }
    match s {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => Value::String(s.to_string()),
    }
}

/// Stdout passes through unparsed under a single key.
#[derive(Debug, Clone)]
pub struct RawOutput {
    key: String,
}

impl RawOutput {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

impl Default for RawOutput {
    fn default() -> Self {
        Self::new("stdout")
    }
}

impl OutputParser for RawOutput {
    fn parse(&self, stdout: &str) -> Result<Record, ParseError> {
        let mut record = Record::new();
        record.insert(self.key.clone(), Value::String(stdout.to_string()));
        Ok(record)
    }
}

/// No output contract: every succeeded result yields an empty record.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullOutput;

impl OutputParser for NullOutput {
    fn parse(&self, _stdout: &str) -> Result<Record, ParseError> {
        Ok(Record::new())
    }
}

/// Applies the output contract to each result as it arrives.
pub struct Collector {
    parser: Box<dyn OutputParser>,
}

impl Collector {
    pub fn new(parser: impl OutputParser + 'static) -> Self {
        Self {
            parser: Box::new(parser),
        }
    }

    /// Collector that records stdout verbatim.
    pub fn raw() -> Self {
        Self::new(RawOutput::default())
    }

    /// Collector with no output contract at all.
    pub fn null() -> Self {
        Self::new(NullOutput)
    }

    /// Convert one raw result. Only `Succeeded` stdout is parsed; a
    /// contract violation degrades the result to `Failed`.
    pub fn collect(&self, result: JobResult) -> CollectedResult {
        if result.state != JobState::Succeeded {
            return CollectedResult { result, data: None };
        }

        match self.parser.parse(&result.stdout.text) {
            Ok(record) => {
                debug!(job = %result.id, fields = record.len(), "output parsed");
                CollectedResult {
                    result,
                    data: Some(record),
                }
            }
            Err(error) => {
                warn!(job = %result.id, %error, "output violates the contract, degrading result");
                let mut degraded = result;
                degraded.state = JobState::Failed;
                degraded.reason = Some(FailureReason::MalformedOutput {
                    message: error.to_string(),
                });
                CollectedResult {
                    result: degraded,
                    data: None,
                }
            }
        }
    }
}

impl Default for Collector {
    fn default() -> Self {
        Self::raw()
    }
}
