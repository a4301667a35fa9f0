//! Structured JSONL logging for harness runs.
//!
//! Provides:
//! - [`LogEntry`]: one JSONL record with required + optional fields.
//! - [`LogEmitter`]: writes entries to a file or an in-memory buffer.
//! - [`RunLogger`]: turns runner progress into log entries.
//! - [`validate_log_line`] / [`validate_log_file`]: schema validation.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::report::RunSummary;
use crate::runner::{Outcome, RunEvent};

// ---------------------------------------------------------------------------
// Log entry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

const LEVELS: [&str; 4] = ["debug", "info", "warn", "error"];
const OUTCOMES: [&str; 3] = ["passed", "failed", "errored"];

/// Canonical structured log entry.
///
/// Required fields: `timestamp`, `trace_id`, `level`, `event`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: String,
    pub trace_id: String,
    pub level: LogLevel,
    pub event: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub suite: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub case: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl LogEntry {
    /// Create a new log entry with required fields only.
    #[must_use]
    pub fn new(trace_id: impl Into<String>, level: LogLevel, event: impl Into<String>) -> Self {
        Self {
            timestamp: now_utc(),
            trace_id: trace_id.into(),
            level,
            event: event.into(),
            suite: None,
            case: None,
            outcome: None,
            duration_ms: None,
            exit_code: None,
            details: None,
        }
    }

    #[must_use]
    pub fn with_suite(mut self, suite: impl Into<String>) -> Self {
        self.suite = Some(suite.into());
        self
    }

    #[must_use]
    pub fn with_case(mut self, case: impl Into<String>) -> Self {
        self.case = Some(case.into());
        self
    }

    #[must_use]
    pub fn with_outcome(mut self, outcome: Outcome) -> Self {
        self.outcome = Some(outcome);
        self
    }

    #[must_use]
    pub fn with_duration_ms(mut self, ms: u64) -> Self {
        self.duration_ms = Some(ms);
        self
    }

    #[must_use]
    pub fn with_exit_code(mut self, exit_code: i32) -> Self {
        self.exit_code = Some(exit_code);
        self
    }

    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Serialize to a single JSONL line (no trailing newline).
    pub fn to_jsonl(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// ---------------------------------------------------------------------------
// Log emitter
// ---------------------------------------------------------------------------

enum Sink {
    File(BufWriter<File>),
    Buffer(Vec<u8>),
}

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Self::File(w) => w.write(buf),
            Self::Buffer(b) => b.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Self::File(w) => w.flush(),
            Self::Buffer(_) => Ok(()),
        }
    }
}

/// Writes JSONL entries with `<suite>::<run_id>::<seq>` trace ids.
pub struct LogEmitter {
    sink: Sink,
    seq: u64,
    suite: String,
    run_id: String,
}

impl LogEmitter {
    /// Create an emitter that writes to a file.
    pub fn to_file(path: &Path, suite: &str, run_id: &str) -> std::io::Result<Self> {
        let file = File::create(path)?;
        Ok(Self::with_sink(Sink::File(BufWriter::new(file)), suite, run_id))
    }

    /// Create an emitter that writes to memory; read it back with
    /// [`buffer_contents`](Self::buffer_contents).
    #[must_use]
    pub fn to_buffer(suite: &str, run_id: &str) -> Self {
        Self::with_sink(Sink::Buffer(Vec::new()), suite, run_id)
    }

    fn with_sink(sink: Sink, suite: &str, run_id: &str) -> Self {
        Self {
            sink,
            seq: 0,
            suite: suite.to_string(),
            run_id: run_id.to_string(),
        }
    }

    fn next_trace_id(&mut self) -> String {
        self.seq += 1;
        format!("{}::{}::{:03}", self.suite, self.run_id, self.seq)
    }

    /// Emit a bare event with an auto-generated trace id.
    pub fn emit(&mut self, level: LogLevel, event: &str) -> std::io::Result<LogEntry> {
        let entry = LogEntry::new(self.next_trace_id(), level, event).with_suite(&self.suite);
        self.write_entry(&entry)?;
        Ok(entry)
    }

    /// Emit a populated entry, filling in trace id and suite when missing.
    pub fn emit_entry(&mut self, mut entry: LogEntry) -> std::io::Result<()> {
        if entry.trace_id.is_empty() {
            entry.trace_id = self.next_trace_id();
        }
        if entry.suite.is_none() {
            entry.suite = Some(self.suite.clone());
        }
        self.write_entry(&entry)
    }

    fn write_entry(&mut self, entry: &LogEntry) -> std::io::Result<()> {
        let line = entry.to_jsonl().map_err(std::io::Error::other)?;
        writeln!(self.sink, "{line}")
    }

    pub fn flush(&mut self) -> std::io::Result<()> {
        self.sink.flush()
    }

    /// Everything written so far, for buffer-backed emitters.
    #[must_use]
    pub fn buffer_contents(&self) -> Option<String> {
        match &self.sink {
            Sink::Buffer(b) => Some(String::from_utf8_lossy(b).into_owned()),
            Sink::File(_) => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Run logger
// ---------------------------------------------------------------------------

/// Adapts runner progress to log entries.
///
/// A failed write does not interrupt the run: the first error is kept and
/// returned from [`finish`](Self::finish), and later writes are skipped.
pub struct RunLogger {
    emitter: LogEmitter,
    error: Option<std::io::Error>,
}

impl RunLogger {
    #[must_use]
    pub fn new(emitter: LogEmitter) -> Self {
        Self {
            emitter,
            error: None,
        }
    }

    fn emit(&mut self, entry: LogEntry) {
        if self.error.is_some() {
            return;
        }
        if let Err(err) = self.emitter.emit_entry(entry) {
            self.error = Some(err);
        }
    }

    pub fn run_started(&mut self, case_count: usize) {
        let entry = LogEntry::new("", LogLevel::Info, "run_start")
            .with_details(serde_json::json!({ "cases": case_count }));
        self.emit(entry);
    }

    pub fn observe(&mut self, event: RunEvent<'_>) {
        match event {
            RunEvent::CaseStarted { index, name } => {
                let entry = LogEntry::new("", LogLevel::Debug, "case_start")
                    .with_case(name)
                    .with_details(serde_json::json!({ "index": index }));
                self.emit(entry);
            }
            RunEvent::CaseFinished { index, result } => {
                for note in &result.notes {
                    let entry = LogEntry::new("", LogLevel::Warn, "case_note")
                        .with_case(&result.case_name)
                        .with_details(serde_json::json!({ "note": note }));
                    self.emit(entry);
                }
                let level = match result.outcome {
                    Outcome::Passed => LogLevel::Info,
                    Outcome::Failed => LogLevel::Warn,
                    Outcome::Errored => LogLevel::Error,
                };
                let failures: Vec<_> = result
                    .recorder
                    .failures()
                    .map(|f| match &f.detail_message {
                        Some(d) => format!("{}: {d}", f.description),
                        None => f.description.clone(),
                    })
                    .collect();
                let entry = LogEntry::new("", level, "case_end")
                    .with_case(&result.case_name)
                    .with_outcome(result.outcome)
                    .with_duration_ms(result.duration_ms)
                    .with_details(serde_json::json!({
                        "index": index,
                        "checks": result.recorder.total_count(),
                        "failed_checks": failures,
                        "error": result.error,
                    }));
                self.emit(entry);
            }
        }
    }

    pub fn run_finished(&mut self, summary: &RunSummary, exit_code: i32) {
        let entry = LogEntry::new("", LogLevel::Info, "run_end")
            .with_exit_code(exit_code)
            .with_details(serde_json::json!(summary));
        self.emit(entry);
    }

    /// Flush and surface the first write error, if any.
    pub fn finish(mut self) -> std::io::Result<LogEmitter> {
        if let Some(err) = self.error.take() {
            return Err(err);
        }
        self.emitter.flush()?;
        Ok(self.emitter)
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validation error for a log line.
#[derive(Debug)]
pub struct LogValidationError {
    pub line_number: usize,
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for LogValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "line {}: field '{}': {}",
            self.line_number, self.field, self.message
        )
    }
}

/// Validate a single JSONL line against the schema.
pub fn validate_log_line(
    line: &str,
    line_number: usize,
) -> Result<LogEntry, Vec<LogValidationError>> {
    let mut errors = Vec::new();
    let mut fail = |field: &str, message: String| {
        errors.push(LogValidationError {
            line_number,
            field: field.to_string(),
            message,
        });
    };

    let value: serde_json::Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            fail("<json>", format!("invalid JSON: {e}"));
            return Err(errors);
        }
    };
    let Some(obj) = value.as_object() else {
        fail("<root>", "expected JSON object".to_string());
        return Err(errors);
    };

    for field in ["timestamp", "trace_id", "level", "event"] {
        if !obj.contains_key(field) {
            fail(field, "required field missing".to_string());
        }
    }

    if let Some(level) = obj.get("level").and_then(|v| v.as_str())
        && !LEVELS.contains(&level)
    {
        fail("level", format!("invalid level: '{level}'"));
    }

    if let Some(outcome) = obj.get("outcome").and_then(|v| v.as_str())
        && !OUTCOMES.contains(&outcome)
    {
        fail("outcome", format!("invalid outcome: '{outcome}'"));
    }

    if let Some(trace_id) = obj.get("trace_id").and_then(|v| v.as_str())
        && !is_trace_id(trace_id)
    {
        fail(
            "trace_id",
            format!("trace_id should follow <suite>::<run_id>::<seq> format, got: '{trace_id}'"),
        );
    }

    // Case lifecycle events must name their case; case_end also its outcome.
    let event = obj.get("event").and_then(|v| v.as_str()).unwrap_or_default();
    if event.starts_with("case_") && !obj.get("case").is_some_and(serde_json::Value::is_string) {
        fail("case", format!("{event} events must include case"));
    }
    if event == "case_end" && !obj.contains_key("outcome") {
        fail("outcome", "case_end events must include outcome".to_string());
    }

    if !errors.is_empty() {
        return Err(errors);
    }

    serde_json::from_value::<LogEntry>(value).map_err(|e| {
        vec![LogValidationError {
            line_number,
            field: "<deserialization>".to_string(),
            message: format!("failed to deserialize: {e}"),
        }]
    })
}

/// `<suite>::<run_id>::<seq>`, where suite and run id may themselves contain
/// `::` and seq is the trailing decimal counter.
fn is_trace_id(trace_id: &str) -> bool {
    let Some((prefix, seq)) = trace_id.rsplit_once("::") else {
        return false;
    };
    !seq.is_empty()
        && seq.bytes().all(|b| b.is_ascii_digit())
        && prefix
            .split_once("::")
            .is_some_and(|(suite, run_id)| !suite.is_empty() && !run_id.is_empty())
}

/// Validate an entire JSONL file.
///
/// Returns the non-empty line count and any validation errors found.
pub fn validate_log_file(path: &Path) -> Result<(usize, Vec<LogValidationError>), std::io::Error> {
    let content = std::fs::read_to_string(path)?;
    let mut all_errors = Vec::new();
    let mut line_count = 0;

    for (i, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        line_count += 1;
        if let Err(errs) = validate_log_line(line, i + 1) {
            all_errors.extend(errs);
        }
    }

    Ok((line_count, all_errors))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Current UTC time as `YYYY-MM-DDTHH:MM:SS.mmmZ`.
#[must_use]
pub fn now_utc() -> String {
    let since_epoch = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    format_utc(since_epoch.as_secs(), since_epoch.subsec_millis())
}

fn format_utc(secs: u64, millis: u32) -> String {
    let days = secs / 86_400;
    let rem = secs % 86_400;
    let (year, month, day) = civil_from_days(days);
    format!(
        "{year:04}-{month:02}-{day:02}T{:02}:{:02}:{:02}.{millis:03}Z",
        rem / 3600,
        (rem % 3600) / 60,
        rem % 60,
    )
}

// Days since 1970-01-01 to a proleptic Gregorian date.
fn civil_from_days(days: u64) -> (u64, u64, u64) {
    let z = days + 719_468;
    let era = z / 146_097;
    let doe = z % 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = yoe + era * 400 + u64::from(month <= 2);
    (year, month, day)
}
