//! Append-only watchdog log: one line per entry, text or JSONL.
//!
//! Text lines are `<ISO-8601 timestamp> - <message>` so existing tooling that
//! greps the HomePi log keeps working. JSONL lines carry every structured field.
//! Each line is assembled in memory and written with a single `write_all` to
//! avoid interleaved partial lines when the file is being tailed.
//!
//! Fallback chain:
//! 1. Primary file path
//! 2. Fallback path (e.g. `/tmp/homepi-watchdog.log`)
//! 3. stderr with `[HPW-LOG]` prefix
//! 4. Silent discard (the watchdog must never die because logging broke)

#![allow(missing_docs)]

use std::fmt;
use std::fs::{self, File, OpenOptions, rename};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::core::config::LoggingConfig;
use crate::core::errors::{HpwError, Result};

/// On-disk rendering of log entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Jsonl,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "jsonl" | "json" => Ok(Self::Jsonl),
            other => Err(format!("unknown log format {other:?} (expected text or jsonl)")),
        }
    }
}

/// Severity level for log events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

/// Watchdog event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    WatchdogStart,
    WatchdogStop,
    ServiceInactive,
    HealthCheckFailed,
    ServiceRecovered,
    RestartAttempt,
    RestartSucceeded,
    RestartFailed,
    RestartSkipped,
    Escalation,
    CooldownComplete,
    ConfigReload,
    /// Host CPU, memory or disk usage above its threshold.
    ResourceWarning,
    Error,
}

/// A single log entry. Only `ts`, `severity`, `event` and `message` are mandatory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// ISO 8601 UTC timestamp.
    pub ts: String,
    pub severity: Severity,
    pub event: EventKind,
    /// Human-readable line, the only part rendered in text mode.
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    /// HPW error code when the entry reports a failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl LogEntry {
    /// Create a new entry stamped with the current UTC time.
    pub fn new(event: EventKind, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            ts: format_utc_now(),
            severity,
            event,
            message: message.into(),
            unit: None,
            url: None,
            retry_count: None,
            max_retries: None,
            error_code: None,
            duration_ms: None,
        }
    }

    #[must_use]
    pub fn with_unit(mut self, unit: &str) -> Self {
        self.unit = Some(unit.to_string());
        self
    }

    #[must_use]
    pub fn with_url(mut self, url: &str) -> Self {
        self.url = Some(url.to_string());
        self
    }

    #[must_use]
    pub const fn with_retries(mut self, retry_count: u32, max_retries: u32) -> Self {
        self.retry_count = Some(retry_count);
        self.max_retries = Some(max_retries);
        self
    }

    #[must_use]
    pub fn with_error(mut self, error: &HpwError) -> Self {
        self.error_code = Some(error.code().to_string());
        self
    }

    #[must_use]
    pub const fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    /// Render as a single line (newline included) in the given format.
    pub fn render(&self, format: LogFormat) -> Result<String> {
        match format {
            LogFormat::Text => Ok(format!("{self}\n")),
            LogFormat::Jsonl => Ok(format!("{}\n", serde_json::to_string(self)?)),
        }
    }
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {}", self.ts, self.message)
    }
}

/// Destination for watchdog log entries.
pub trait LogSink {
    fn record(&mut self, entry: LogEntry);

    fn flush(&mut self) {}
}

/// In-memory sink that keeps every entry, used by one-shot checks.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub entries: Vec<LogEntry>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages of all recorded entries, oldest first.
    pub fn messages(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.message.as_str()).collect()
    }
}

impl LogSink for MemorySink {
    fn record(&mut self, entry: LogEntry) {
        self.entries.push(entry);
    }
}

/// Degradation state of the writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterState {
    Normal,
    Fallback,
    Stderr,
    Discard,
}

/// Append-only file writer with size-based rotation and multi-level fallback.
pub struct LogWriter {
    config: LoggingConfig,
    file: Option<File>,
    state: WriterState,
    bytes_written: u64,
}

impl LogWriter {
    /// Open the log file. Falls through the degradation chain on failure.
    pub fn open(config: LoggingConfig) -> Self {
        let mut w = Self {
            config,
            file: None,
            state: WriterState::Discard,
            bytes_written: 0,
        };
        w.try_open_primary();
        w
    }

    /// Current degradation state.
    pub fn state(&self) -> &str {
        match self.state {
            WriterState::Normal => "normal",
            WriterState::Fallback => "fallback",
            WriterState::Stderr => "stderr",
            WriterState::Discard => "discard",
        }
    }

    /// Number of bytes written to the current file.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Try reopening the primary path after a degradation.
    pub fn try_recover(&mut self) {
        if self.state == WriterState::Normal {
            return;
        }
        if let Ok((file, size)) = open_append(&self.config.log_file) {
            self.file = Some(file);
            self.state = WriterState::Normal;
            self.bytes_written = size;
            let _ = writeln!(
                io::stderr(),
                "[HPW-LOG] recovered to primary path: {}",
                self.config.log_file.display()
            );
        }
    }

    // ──────────────────────── internals ────────────────────────

    fn write_line(&mut self, line: &str) {
        if self.bytes_written + line.len() as u64 > self.config.max_size_bytes
            && matches!(self.state, WriterState::Normal | WriterState::Fallback)
        {
            self.rotate();
        }

        match self.state {
            WriterState::Normal | WriterState::Fallback => {
                if let Some(f) = self.file.as_mut() {
                    if f.write_all(line.as_bytes()).is_err() {
                        self.degrade();
                        self.write_line(line);
                        return;
                    }
                    self.bytes_written += line.len() as u64;
                } else {
                    self.degrade();
                    self.write_line(line);
                }
            }
            WriterState::Stderr => {
                let _ = write!(io::stderr(), "[HPW-LOG] {line}");
            }
            WriterState::Discard => {}
        }
    }

    fn try_open_primary(&mut self) {
        match open_append(&self.config.log_file) {
            Ok((file, size)) => {
                self.file = Some(file);
                self.state = WriterState::Normal;
                self.bytes_written = size;
            }
            Err(_) => self.try_open_fallback(),
        }
    }

    fn try_open_fallback(&mut self) {
        let Some(fb) = self.config.fallback_file.clone() else {
            self.state = WriterState::Stderr;
            let _ = writeln!(
                io::stderr(),
                "[HPW-LOG] primary path failed and no fallback configured, using stderr"
            );
            return;
        };
        match open_append(&fb) {
            Ok((file, size)) => {
                let _ = writeln!(
                    io::stderr(),
                    "[HPW-LOG] primary path failed, using fallback: {}",
                    fb.display()
                );
                self.file = Some(file);
                self.state = WriterState::Fallback;
                self.bytes_written = size;
            }
            Err(_) => {
                self.state = WriterState::Stderr;
                let _ = writeln!(
                    io::stderr(),
                    "[HPW-LOG] both primary and fallback paths failed, using stderr"
                );
            }
        }
    }

    fn degrade(&mut self) {
        self.file = None;
        match self.state {
            WriterState::Normal => self.try_open_fallback(),
            WriterState::Fallback => {
                self.state = WriterState::Stderr;
                let _ = writeln!(io::stderr(), "[HPW-LOG] fallback write failed, using stderr");
            }
            WriterState::Stderr => self.state = WriterState::Discard,
            WriterState::Discard => {}
        }
    }

    fn rotate(&mut self) {
        self.file = None;

        let base = match self.state {
            WriterState::Normal => self.config.log_file.clone(),
            WriterState::Fallback => match &self.config.fallback_file {
                Some(p) => p.clone(),
                None => return,
            },
            _ => return,
        };

        // .N-1 → .N, ..., .1 → .2, then current → .1
        let keep = self.config.max_rotated_files;
        let _ = fs::remove_file(rotated_name(&base, keep));
        for i in (1..keep).rev() {
            let _ = rename(rotated_name(&base, i), rotated_name(&base, i + 1));
        }
        let _ = rename(&base, rotated_name(&base, 1));

        match open_append(&base) {
            Ok((file, _)) => {
                self.file = Some(file);
                self.bytes_written = 0;
            }
            Err(_) => self.degrade(),
        }
    }
}

impl LogSink for LogWriter {
    fn record(&mut self, entry: LogEntry) {
        let line = match entry.render(self.config.format) {
            Ok(line) => line,
            Err(e) => {
                let _ = writeln!(io::stderr(), "[HPW-LOG] serialize error: {e}");
                return;
            }
        };

        self.write_line(&line);

        // stderr ends up in the journal under systemd; skip when it is already the sink.
        if self.config.mirror_stderr && self.state != WriterState::Stderr {
            let _ = writeln!(io::stderr(), "{entry}");
        }
    }

    fn flush(&mut self) {
        if let Some(f) = self.file.as_mut() {
            let _ = f.flush();
            let _ = f.sync_data();
        }
    }
}

// ──────────────────────── helpers ────────────────────────

/// Open or create a file for appending. Returns `(File, current_size)`.
fn open_append(path: &Path) -> Result<(File, u64)> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(|source| HpwError::io(parent, source))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| HpwError::io(path, source))?;
    let size = file.metadata().map(|m| m.len()).unwrap_or(0);
    Ok((file, size))
}

/// Build a rotated filename: `watchdog.log` → `watchdog.log.3`.
fn rotated_name(base: &Path, index: u32) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(format!(".{index}"));
    PathBuf::from(name)
}

fn format_utc_now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

// ──────────────────────── tests ────────────────────────
