//! Structured JSONL logging for scheduler and harness events.
//!
//! Provides:
//! - [`LogEntry`]: one JSONL record with required and optional fields.
//! - [`LogEmitter`]: writes JSONL lines to stderr, a file, or a [`LogBuffer`],
//!   dropping entries below the configured [`LogFilter`].
//! - [`validate_log_line`]: checks a single line against the schema.

use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;

use frankenffi_membrane::{ErrorKind, LogFilter};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Severity level for log entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Whether an entry at this level passes `filter`.
    #[must_use]
    pub fn passes(self, filter: LogFilter) -> bool {
        let needed = match self {
            Self::Error => LogFilter::Error,
            Self::Warn => LogFilter::Warn,
            Self::Info => LogFilter::Info,
            Self::Debug => LogFilter::Debug,
        };
        filter != LogFilter::Off && filter >= needed
    }
}

/// Scenario step outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Pass,
    Fail,
    Cancelled,
}

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
    pub task: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arena: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_us: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl LogEntry {
    /// Create a new entry with required fields; timestamp is now.
    #[must_use]
    pub fn new(trace_id: impl Into<String>, level: LogLevel, event: impl Into<String>) -> Self {
        Self {
            timestamp: now_utc(),
            trace_id: trace_id.into(),
            level,
            event: event.into(),
            task: None,
            arena: None,
            symbol: None,
            error_kind: None,
            outcome: None,
            duration_us: None,
            message: None,
            details: None,
        }
    }

    #[must_use]
    pub fn with_task(mut self, task: u64) -> Self {
        self.task = Some(task);
        self
    }

    #[must_use]
    pub fn with_arena(mut self, arena: u64) -> Self {
        self.arena = Some(arena);
        self
    }

    #[must_use]
    pub fn with_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.symbol = Some(symbol.into());
        self
    }

    #[must_use]
    pub fn with_error_kind(mut self, kind: ErrorKind) -> Self {
        self.error_kind = Some(kind.as_str().to_string());
        self
    }

    #[must_use]
    pub fn with_outcome(mut self, outcome: Outcome) -> Self {
        self.outcome = Some(outcome);
        self
    }

    #[must_use]
    pub fn with_duration_us(mut self, us: u64) -> Self {
        self.duration_us = Some(us);
        self
    }

    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
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

/// Clonable in-memory sink, mostly for tests and reports.
#[derive(Debug, Clone, Default)]
pub struct LogBuffer {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl LogBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.bytes.lock()).into_owned()
    }

    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        self.contents().lines().map(str::to_string).collect()
    }
}

impl Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.bytes.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// JSONL writer with per-run trace ids.
pub struct LogEmitter {
    writer: Box<dyn Write + Send>,
    run_id: String,
    filter: LogFilter,
    seq: u64,
}

impl LogEmitter {
    /// Emitter writing to stderr.
    #[must_use]
    pub fn to_stderr(run_id: impl Into<String>, filter: LogFilter) -> Self {
        Self::to_writer(Box::new(io::stderr()), run_id, filter)
    }

    /// Emitter appending to `path`.
    pub fn to_file(path: &Path, run_id: impl Into<String>, filter: LogFilter) -> io::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self::to_writer(Box::new(io::BufWriter::new(file)), run_id, filter))
    }

    /// Emitter writing into a shared buffer.
    #[must_use]
    pub fn to_buffer(buffer: &LogBuffer, run_id: impl Into<String>, filter: LogFilter) -> Self {
        Self::to_writer(Box::new(buffer.clone()), run_id, filter)
    }

    #[must_use]
    pub fn to_writer(writer: Box<dyn Write + Send>, run_id: impl Into<String>, filter: LogFilter) -> Self {
        Self {
            writer,
            run_id: run_id.into(),
            filter,
            seq: 0,
        }
    }

    #[must_use]
    pub fn filter(&self) -> LogFilter {
        self.filter
    }

    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Whether an entry at `level` would be written.
    #[must_use]
    pub fn enabled(&self, level: LogLevel) -> bool {
        level.passes(self.filter)
    }

    /// Next trace id: `<run_id>::<seq>`.
    pub fn next_trace_id(&mut self) -> String {
        self.seq += 1;
        format!("{}::{:03}", self.run_id, self.seq)
    }

    /// Start an entry with a fresh trace id.
    pub fn entry(&mut self, level: LogLevel, event: impl Into<String>) -> LogEntry {
        let trace_id = self.next_trace_id();
        LogEntry::new(trace_id, level, event)
    }

    /// Write `entry` if its level passes the filter. Returns whether it was written.
    pub fn emit(&mut self, entry: &LogEntry) -> io::Result<bool> {
        if !self.enabled(entry.level) {
            return Ok(false);
        }
        let line = entry.to_jsonl().map_err(io::Error::other)?;
        writeln!(self.writer, "{line}")?;
        Ok(true)
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

impl std::fmt::Debug for LogEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogEmitter")
            .field("run_id", &self.run_id)
            .field("filter", &self.filter)
            .field("seq", &self.seq)
            .finish()
    }
}

/// Problems found in a JSONL line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogViolation {
    pub field: String,
    pub message: String,
}

/// Validate one JSONL line: parseable, required fields present, known level.
pub fn validate_log_line(line: &str) -> Result<LogEntry, Vec<LogViolation>> {
    let value: serde_json::Value = serde_json::from_str(line).map_err(|err| {
        vec![LogViolation {
            field: "<line>".to_string(),
            message: format!("invalid JSON: {err}"),
        }]
    })?;

    let mut violations = Vec::new();
    for field in ["timestamp", "trace_id", "level", "event"] {
        match value.get(field).and_then(serde_json::Value::as_str) {
            Some(s) if !s.is_empty() => {}
            _ => violations.push(LogViolation {
                field: field.to_string(),
                message: "required string field missing or empty".to_string(),
            }),
        }
    }
    if let Some(trace) = value.get("trace_id").and_then(serde_json::Value::as_str) {
        if !trace.contains("::") {
            violations.push(LogViolation {
                field: "trace_id".to_string(),
                message: format!("expected `<run>::<seq>`, got `{trace}`"),
            });
        }
    }
    if !violations.is_empty() {
        return Err(violations);
    }

    serde_json::from_value(value).map_err(|err| {
        vec![LogViolation {
            field: "<entry>".to_string(),
            message: err.to_string(),
        }]
    })
}

/// Current UTC time as `YYYY-MM-DDTHH:MM:SS.mmmZ`.
#[must_use]
pub fn now_utc() -> String {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    let secs = now.as_secs();
    let (year, month, day) = civil_from_days((secs / 86_400) as i64);
    let rem = secs % 86_400;
    format!(
        "{year:04}-{month:02}-{day:02}T{:02}:{:02}:{:02}.{:03}Z",
        rem / 3600,
        (rem % 3600) / 60,
        rem % 60,
        now.subsec_millis()
    )
}

/// Days since 1970-01-01 to (year, month, day), proleptic Gregorian.
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    let year = yoe + era * 400 + i64::from(month <= 2);
    (year, month, day)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn optional_fields_are_omitted() {
        let entry = LogEntry::new("run::001", LogLevel::Info, "task.spawned").with_task(7);
        let line = entry.to_jsonl().unwrap();
        assert!(line.contains("\"task\":7"));
        assert!(line.contains("\"level\":\"info\""));
        assert!(!line.contains("symbol"));
        assert!(!line.contains("details"));
    }

    #[test]
    fn filter_gates_levels() {
        assert!(LogLevel::Error.passes(LogFilter::Warn));
        assert!(LogLevel::Warn.passes(LogFilter::Warn));
        assert!(!LogLevel::Info.passes(LogFilter::Warn));
        assert!(LogLevel::Debug.passes(LogFilter::Debug));
        assert!(!LogLevel::Error.passes(LogFilter::Off));
    }

    #[test]
    fn emitter_writes_valid_lines_to_buffer() {
        let buffer = LogBuffer::new();
        let mut emitter = LogEmitter::to_buffer(&buffer, "scenario", LogFilter::Info);
        let entry = emitter
            .entry(LogLevel::Info, "native.invoke")
            .with_symbol("getpid")
            .with_outcome(Outcome::Pass);
        assert!(emitter.emit(&entry).unwrap());
        let skipped = emitter.entry(LogLevel::Debug, "noise");
        assert!(!emitter.emit(&skipped).unwrap());

        let lines = buffer.lines();
        assert_eq!(lines.len(), 1);
        let parsed = validate_log_line(&lines[0]).unwrap();
        assert_eq!(parsed.trace_id, "scenario::001");
        assert_eq!(parsed.symbol.as_deref(), Some("getpid"));
        assert_eq!(parsed.outcome, Some(Outcome::Pass));
    }

    #[test]
    fn validation_reports_missing_fields() {
        let violations = validate_log_line(r#"{"timestamp":"t","level":"info"}"#).unwrap_err();
        let fields: Vec<_> = violations.iter().map(|v| v.field.as_str()).collect();
        assert_eq!(fields, vec!["trace_id", "event"]);

        let bad_level =
            validate_log_line(r#"{"timestamp":"t","trace_id":"a::1","level":"loud","event":"e"}"#);
        assert!(bad_level.is_err());
        assert!(validate_log_line("not json").is_err());
    }

    #[test]
    fn civil_dates() {
        assert_eq!(civil_from_days(0), (1970, 1, 1));
        assert_eq!(civil_from_days(11_016), (2000, 2, 29));
        assert_eq!(civil_from_days(19_723), (2024, 1, 1));
        let stamp = now_utc();
        assert_eq!(stamp.len(), 24);
        assert!(stamp.ends_with('Z'));
    }
}
