//! Structured JSONL logging.
//!
//! Every diagnostic the runtime emits (option warnings, kernel calls and
//! failures, copy traces, rollbacks, lifecycle transitions) is one
//! [`LogEvent`] serialized as a single JSON line. The sink is stderr by
//! default; tests attach an in-memory sink and read the events back.

use std::io::Write;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Severity level for log events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

/// Direction of a traced copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CopyDirection {
    HostToDevice,
    DeviceToHost,
    DeviceToDevice,
}

impl CopyDirection {
    /// Arrow form used in human-readable messages.
    #[must_use]
    pub const fn arrow(self) -> &'static str {
        match self {
            Self::HostToDevice => "CPU ---> GPU",
            Self::DeviceToHost => "GPU ---> CPU",
            Self::DeviceToDevice => "GPU ---> GPU",
        }
    }
}

/// One structured log record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    pub timestamp_ns: u64,
    pub level: LogLevel,
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<CopyDirection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl LogEvent {
    #[must_use]
    pub fn new(level: LogLevel, event: impl Into<String>) -> Self {
        Self {
            timestamp_ns: now_ns(),
            level,
            event: event.into(),
            symbol: None,
            bytes: None,
            direction: None,
            status: None,
            message: None,
            details: None,
        }
    }

    #[must_use]
    pub fn with_symbol(mut self, symbol: impl Into<String>) -> Self {
        self.symbol = Some(symbol.into());
        self
    }

    #[must_use]
    pub fn with_bytes(mut self, bytes: usize) -> Self {
        self.bytes = Some(bytes as u64);
        self
    }

    #[must_use]
    pub fn with_direction(mut self, direction: CopyDirection) -> Self {
        self.direction = Some(direction);
        self
    }

    #[must_use]
    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
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

fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos() as u64)
}

/// Where log lines go.
#[derive(Debug, Clone)]
pub enum LogSink {
    Stderr,
    Stdout,
    Memory(MemoryLog),
}

/// Shared in-memory log buffer.
#[derive(Debug, Clone, Default)]
pub struct MemoryLog {
    lines: Arc<Mutex<Vec<String>>>,
}

impl MemoryLog {
    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }

    /// Parsed events; lines that fail to parse are skipped.
    #[must_use]
    pub fn events(&self) -> Vec<LogEvent> {
        self.lines
            .lock()
            .iter()
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect()
    }

    /// Events whose `event` field equals `name`.
    #[must_use]
    pub fn named(&self, name: &str) -> Vec<LogEvent> {
        self.events().into_iter().filter(|e| e.event == name).collect()
    }
}

/// JSONL event writer.
#[derive(Debug)]
pub struct Logger {
    sink: LogSink,
    min_level: LogLevel,
}

impl Logger {
    #[must_use]
    pub fn new(sink: LogSink, min_level: LogLevel) -> Self {
        Self { sink, min_level }
    }

    #[must_use]
    pub fn stderr() -> Self {
        Self::new(LogSink::Stderr, LogLevel::Trace)
    }

    /// Logger writing to a fresh in-memory buffer, plus a handle to read it.
    #[must_use]
    pub fn memory() -> (Self, MemoryLog) {
        let log = MemoryLog::default();
        (Self::new(LogSink::Memory(log.clone()), LogLevel::Trace), log)
    }

    #[must_use]
    pub fn enabled(&self, level: LogLevel) -> bool {
        level >= self.min_level
    }

    pub fn emit(&self, event: &LogEvent) {
        if !self.enabled(event.level) {
            return;
        }
        let Ok(line) = event.to_jsonl() else {
            return;
        };
        match &self.sink {
            LogSink::Stderr => {
                let _ = writeln!(std::io::stderr().lock(), "{line}");
            }
            LogSink::Stdout => {
                let _ = writeln!(std::io::stdout().lock(), "{line}");
            }
            LogSink::Memory(log) => log.lines.lock().push(line),
        }
    }

    /// Emit plain text (usage output) without JSON framing.
    pub fn raw(&self, text: &str) {
        match &self.sink {
            LogSink::Stderr => {
                let _ = std::io::stderr().lock().write_all(text.as_bytes());
            }
            LogSink::Stdout => {
                let _ = std::io::stdout().lock().write_all(text.as_bytes());
            }
            LogSink::Memory(log) => log.lines.lock().push(text.to_string()),
        }
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::stderr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serializes_only_present_fields() {
        let line = LogEvent::new(LogLevel::Debug, "copy")
            .with_bytes(16)
            .with_direction(CopyDirection::HostToDevice)
            .to_jsonl()
            .unwrap();
        let v: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(v["event"], "copy");
        assert_eq!(v["level"], "debug");
        assert_eq!(v["bytes"], 16);
        assert_eq!(v["direction"], "host_to_device");
        assert!(v.get("symbol").is_none());
    }

    #[test]
    fn memory_sink_collects_events() {
        let (logger, log) = Logger::memory();
        logger.emit(&LogEvent::new(LogLevel::Info, "init"));
        logger.emit(&LogEvent::new(LogLevel::Warn, "option_warning").with_message("x"));
        assert_eq!(log.lines().len(), 2);
        assert_eq!(log.named("option_warning")[0].message.as_deref(), Some("x"));
    }

    #[test]
    fn level_filter_drops_lower_levels() {
        let log = MemoryLog::default();
        let logger = Logger::new(LogSink::Memory(log.clone()), LogLevel::Warn);
        logger.emit(&LogEvent::new(LogLevel::Debug, "kernel_call"));
        logger.emit(&LogEvent::new(LogLevel::Error, "kernel_failure"));
        assert_eq!(log.events().len(), 1);
        assert!(!logger.enabled(LogLevel::Info));
    }

    #[test]
    fn arrows_match_direction() {
        assert_eq!(CopyDirection::HostToDevice.arrow(), "CPU ---> GPU");
        assert_eq!(CopyDirection::DeviceToHost.arrow(), "GPU ---> CPU");
    }
}
