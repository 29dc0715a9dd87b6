//! Structured event reporting
//!
//! Every failure and every terminal outcome of a run is reported as an
//! `{severity, code, message}` record. Operators filter on the numeric code,
//! so codes are stable and never reused.
//!
//! Sinks:
//! - `TracingSink`: forwards to the tracing subscriber
//! - `JsonlEventLog`: append-only JSONL file
//! - `FanoutSink`: delivers to several sinks
//! - `RecordingSink`: in-memory, for tests

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Event severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Information,
    Warning,
    Error,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Information => "information",
            Severity::Warning => "warning",
            Severity::Error => "error",
        }
    }
}

/// Stable numeric event codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u16", try_from = "u16")]
pub enum EventCode {
    GeneralError = 0,
    RequestFailed = 1,
    FetchFailed = 2,
    ServiceNotStarted = 3,
    WriteFailed = 4,
    StagingDirMissing = 5,
    ChecksumFailed = 6,
    Updated = 7,
    RunFinished = 8,
    CopyError = 9,
    ConfigError = 10,
    NoUpdates = 11,
}

impl EventCode {
    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

impl From<EventCode> for u16 {
    fn from(code: EventCode) -> Self {
        code.as_u16()
    }
}

impl TryFrom<u16> for EventCode {
    type Error = String;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        let code = match value {
            0 => EventCode::GeneralError,
            1 => EventCode::RequestFailed,
            2 => EventCode::FetchFailed,
            3 => EventCode::ServiceNotStarted,
            4 => EventCode::WriteFailed,
            5 => EventCode::StagingDirMissing,
            6 => EventCode::ChecksumFailed,
            7 => EventCode::Updated,
            8 => EventCode::RunFinished,
            9 => EventCode::CopyError,
            10 => EventCode::ConfigError,
            11 => EventCode::NoUpdates,
            other => return Err(format!("unknown event code {}", other)),
        };
        Ok(code)
    }
}

/// A single reportable event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub severity: Severity,
    pub code: EventCode,
    pub message: String,
}

impl Event {
    pub fn new(severity: Severity, code: EventCode, message: impl Into<String>) -> Self {
        Self {
            severity,
            code,
            message: message.into(),
        }
    }

    pub fn info(code: EventCode, message: impl Into<String>) -> Self {
        Self::new(Severity::Information, code, message)
    }

    pub fn warning(code: EventCode, message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, code, message)
    }

    pub fn error(code: EventCode, message: impl Into<String>) -> Self {
        Self::new(Severity::Error, code, message)
    }
}

/// Destination for structured events
pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

impl<S: EventSink + ?Sized> EventSink for Arc<S> {
    fn emit(&self, event: Event) {
        (**self).emit(event)
    }
}

/// Forwards events to the tracing subscriber
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: Event) {
        let code = event.code.as_u16();
        match event.severity {
            Severity::Information => info!(code, "{}", event.message),
            Severity::Warning => warn!(code, "{}", event.message),
            Severity::Error => error!(code, "{}", event.message),
        }
    }
}

/// One line of the JSONL event log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub timestamp: DateTime<Utc>,
    pub run_id: Uuid,
    pub severity: Severity,
    pub code: EventCode,
    pub message: String,
}

/// Append-only JSONL event log
pub struct JsonlEventLog {
    path: PathBuf,
    run_id: Uuid,
}

impl JsonlEventLog {
    pub fn new(path: impl AsRef<Path>, run_id: Uuid) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            run_id,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record
    pub fn append(&self, event: &Event) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        let record = EventRecord {
            timestamp: Utc::now(),
            run_id: self.run_id,
            severity: event.severity,
            code: event.code,
            message: event.message.clone(),
        };
        let line = serde_json::to_string(&record)?;
        writeln!(file, "{}", line)?;

        Ok(())
    }

    /// Read all records, skipping lines that do not parse
    pub fn read_all(&self) -> std::io::Result<Vec<EventRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let reader = BufReader::new(File::open(&self.path)?);
        let mut records = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            if let Ok(record) = serde_json::from_str::<EventRecord>(&line) {
                records.push(record);
            }
        }

        Ok(records)
    }
}

impl EventSink for JsonlEventLog {
    fn emit(&self, event: Event) {
        if let Err(e) = self.append(&event) {
            warn!("Failed to append to event log {}: {}", self.path.display(), e);
        }
    }
}

/// Delivers every event to each inner sink in order
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Box<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: impl EventSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: Event) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.emit(event.clone());
            }
            last.emit(event);
        }
    }
}

/// In-memory sink for tests
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<Event>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn codes(&self) -> Vec<EventCode> {
        self.events().into_iter().map(|e| e.code).collect()
    }

    pub fn count(&self, code: EventCode) -> usize {
        self.events().iter().filter(|e| e.code == code).count()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: Event) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
