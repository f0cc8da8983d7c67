// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Append-only NDJSON event log for one run attempt or one environment build.
//!
//! Each line is one JSON object:
//!
//! ```json
//! {"timestamp":"2025-01-01T00:00:00Z","level":"info","event":"run.started","message":"...","data":{},"context":{"run_id":"..."}}
//! ```
//!
//! Structured events emitted by the engine are appended verbatim.
//!
//! Lifecycle entries are flushed as they are written. Subprocess output
//! ([`append_raw`](EventLog::append_raw), [`console`](EventLog::console)) is
//! buffered and reaches disk on the next lifecycle entry, an explicit
//! [`flush`](EventLog::flush), or drop.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value, json};

/// Severity of an event log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    /// Verbose diagnostics.
    Debug,
    /// Normal progress.
    Info,
    /// Something unexpected but recoverable.
    Warning,
    /// A failure.
    Error,
}

/// Thread-safe, durable, append-only event sink.
#[derive(Debug)]
pub struct EventLog {
    path: PathBuf,
    context: Value,
    file: Mutex<BufWriter<File>>,
}

impl EventLog {
    /// Open (creating parent directories) a log at `path`; every entry carries `context`.
    pub fn create(path: impl Into<PathBuf>, context: Value) -> std::io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            context,
            file: Mutex::new(BufWriter::new(file)),
        })
    }

    /// Location of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry and flush.
    pub fn emit(&self, level: Level, event: &str, message: impl Into<String>, data: Value) {
        let entry = self.entry(level, event, message.into(), data);
        self.write_line(&entry, true);
    }

    /// Append a plain output line from a subprocess, buffered.
    pub fn console(&self, stream: &str, line: &str) {
        let entry = self.entry(
            Level::Info,
            "console.line",
            line.to_string(),
            json!({ "stream": stream }),
        );
        self.write_line(&entry, false);
    }

    /// Append an informational entry.
    pub fn info(&self, event: &str, message: impl Into<String>, data: Value) {
        self.emit(Level::Info, event, message, data);
    }

    /// Append a warning entry.
    pub fn warning(&self, event: &str, message: impl Into<String>, data: Value) {
        self.emit(Level::Warning, event, message, data);
    }

    /// Append an error entry.
    pub fn error(&self, event: &str, message: impl Into<String>, data: Value) {
        self.emit(Level::Error, event, message, data);
    }

    /// Append an externally produced structured event as-is, buffered.
    pub fn append_raw(&self, event: &Map<String, Value>) {
        self.write_line(&Value::Object(event.clone()), false);
    }

    /// Write buffered entries to disk.
    pub fn flush(&self) {
        if let Err(e) = self.lock_file().flush() {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to flush event log");
        }
    }

    fn entry(&self, level: Level, event: &str, message: String, data: Value) -> Value {
        json!({
            "timestamp": Utc::now().to_rfc3339(),
            "level": level,
            "event": event,
            "message": message,
            "data": data,
            "context": self.context,
        })
    }

    fn lock_file(&self) -> MutexGuard<'_, BufWriter<File>> {
        match self.file.lock() {
            Ok(file) => file,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_line(&self, value: &Value, flush: bool) {
        let mut line = match serde_json::to_string(value) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to serialize event");
                return;
            }
        };
        line.push('\n');

        let mut file = self.lock_file();
        let mut written = file.write_all(line.as_bytes());
        if flush && written.is_ok() {
            written = file.flush();
        }
        if let Err(e) = written {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to append event");
        }
    }
}

/// Parse every entry of an NDJSON log, skipping blank lines.
pub fn read_entries(path: &Path) -> std::io::Result<Vec<Value>> {
    let content = std::fs::read_to_string(path)?;
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).map_err(std::io::Error::other))
        .collect()
}
