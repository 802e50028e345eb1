//! Daemon self-monitoring: state file for the CLI, RSS tracking, and the
//! sd_notify STATUS line.
//!
//! The state file (`state.json`) is how `hpw status` learns what the daemon
//! is doing. It is written atomically (write to `.tmp`, then `rename()`) after
//! every poll cycle so readers always see a consistent snapshot.

#![allow(missing_docs)]

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::core::config::WatchdogConfig;
use crate::core::errors::{HpwError, Result};
use crate::daemon::watchdog::{CycleReport, HealthStatus, ServiceStatus, WatchdogStats};

// ──────────────────── constants ────────────────────

/// Floor for treating `state.json` as stale (seconds).
pub const STATE_STALE_FLOOR_SECS: u64 = 90;

/// RSS above which a warning is printed (bytes).
const RSS_WARN_BYTES: u64 = 64 * 1024 * 1024;

// ──────────────────── state file schema ────────────────────

/// Snapshot written to `state.json` for CLI consumption.
///
/// All fields default so that a newer or older daemon's file still parses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonState {
    pub version: String,
    pub pid: u32,
    pub started_at: String,
    pub uptime_seconds: u64,
    pub last_updated: String,
    /// Age after which readers should consider the daemon stalled. Covers a
    /// full poll interval plus a possible restart grace and escalation cooldown.
    pub stale_after_seconds: u64,
    pub unit: String,
    pub health_url: String,
    pub restart_enabled: bool,
    pub service: Option<ServiceStatus>,
    pub health: Option<HealthStatus>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_action: Option<String>,
    pub last_action_at: Option<String>,
    pub counters: WatchdogStats,
    pub memory_rss_bytes: u64,
}

// ──────────────────── self-monitor ────────────────────

/// Tracks the latest cycle and persists it to the state file.
pub struct SelfMonitor {
    state_file_path: PathBuf,
    start_time: Instant,
    started_at_iso: String,
    last_report: Option<CycleReport>,
    last_report_at: Option<String>,
    write_failed: bool,
}

impl SelfMonitor {
    pub fn new(state_file_path: PathBuf) -> Self {
        Self {
            state_file_path,
            start_time: Instant::now(),
            started_at_iso: now_iso(),
            last_report: None,
            last_report_at: None,
            write_failed: false,
        }
    }

    pub fn state_file_path(&self) -> &Path {
        &self.state_file_path
    }

    /// Point future writes at a different file (config reload).
    pub fn set_state_file_path(&mut self, path: PathBuf) {
        self.state_file_path = path;
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn record_cycle(&mut self, report: &CycleReport) {
        self.last_report = Some(*report);
        self.last_report_at = Some(now_iso());
    }

    /// Build the snapshot for the current moment.
    pub fn snapshot(&self, config: &WatchdogConfig, stats: WatchdogStats) -> DaemonState {
        let stale_after_seconds = config
            .check_interval_seconds
            .saturating_mul(2)
            .saturating_add(config.restart_grace_seconds)
            .saturating_add(config.escalation_cooldown_seconds)
            .saturating_add(config.health_timeout_seconds.saturating_mul(2))
            .saturating_add(config.command_timeout_seconds.saturating_mul(3))
            .max(STATE_STALE_FLOOR_SECS);

        DaemonState {
            version: env!("CARGO_PKG_VERSION").to_string(),
            pid: std::process::id(),
            started_at: self.started_at_iso.clone(),
            uptime_seconds: self.uptime_seconds(),
            last_updated: now_iso(),
            stale_after_seconds,
            unit: config.unit_name.clone(),
            health_url: config.health_check_url.clone(),
            restart_enabled: config.restart_enabled,
            service: self.last_report.map(|r| r.service),
            health: self.last_report.and_then(|r| r.health),
            retry_count: self.last_report.map_or(0, |r| r.state.count()),
            max_retries: config.max_retries,
            last_action: self.last_report.map(|r| r.action.label().to_string()),
            last_action_at: self.last_report_at.clone(),
            counters: stats,
            memory_rss_bytes: read_rss_bytes(),
        }
    }

    /// Write `state.json`. Failures are reported on stderr once per streak
    /// and never interrupt the loop.
    pub fn write_state(&mut self, config: &WatchdogConfig, stats: WatchdogStats) -> bool {
        let state = self.snapshot(config, stats);

        if state.memory_rss_bytes > RSS_WARN_BYTES {
            eprintln!(
                "[HPW-SELFMON] WARNING: RSS {} MB exceeds {} MB",
                state.memory_rss_bytes / (1024 * 1024),
                RSS_WARN_BYTES / (1024 * 1024),
            );
        }

        match write_state_atomic(&self.state_file_path, &state) {
            Ok(()) => {
                self.write_failed = false;
                true
            }
            Err(e) => {
                if !self.write_failed {
                    eprintln!(
                        "[HPW-SELFMON] failed to write state file {}: {e}",
                        self.state_file_path.display()
                    );
                }
                self.write_failed = true;
                false
            }
        }
    }

    /// Build a status string suitable for sd_notify STATUS.
    #[must_use]
    pub fn status_line(&self, config: &WatchdogConfig) -> String {
        match self.last_report {
            None => format!("watching {} (no cycle yet)", config.unit_name),
            Some(r) => format!(
                "{} {} / {} | retries {}/{} | last: {}",
                config.unit_name,
                r.service,
                r.health.map_or_else(|| "unprobed".to_string(), |h| h.to_string()),
                r.state.count(),
                config.max_retries,
                r.action.label()
            ),
        }
    }

    /// Read the state file (for `hpw status`).
    pub fn read_state(path: &Path) -> Result<DaemonState> {
        let raw = fs::read_to_string(path).map_err(|e| HpwError::io(path, e))?;
        let state: DaemonState = serde_json::from_str(&raw)?;
        Ok(state)
    }
}

/// Seconds since `state.last_updated`, when it parses.
pub fn state_age_seconds(state: &DaemonState) -> Option<i64> {
    let updated = chrono::DateTime::parse_from_rfc3339(&state.last_updated).ok()?;
    Some(
        chrono::Utc::now()
            .signed_duration_since(updated)
            .num_seconds(),
    )
}

/// Whether the snapshot is older than its own staleness horizon.
pub fn is_stale(state: &DaemonState) -> bool {
    let limit = state.stale_after_seconds.max(STATE_STALE_FLOOR_SECS);
    state_age_seconds(state).is_some_and(|age| u64::try_from(age).is_ok_and(|age| age > limit))
}

fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

// ──────────────────── atomic state file write ────────────────────

/// Write state.json atomically: write to .tmp, then rename.
///
/// Mode 0o644 so `hpw status` works for non-root users while the daemon
/// runs as root. The file holds only operational status.
fn write_state_atomic(path: &Path, state: &DaemonState) -> std::io::Result<()> {
    let tmp_path = path.with_extension("json.tmp");

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(state).map_err(std::io::Error::other)?;

    let result = (|| {
        {
            use std::io::Write;
            let mut opts = OpenOptions::new();
            opts.write(true).create(true).truncate(true);
            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt as _;
                opts.mode(0o644);
            }
            let mut file = opts.open(&tmp_path)?;
            file.write_all(json.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, path)?;
        Ok(())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result
}

// ──────────────────── RSS reading ────────────────────

/// Current process RSS in bytes from /proc/self/status; 0 when unavailable.
fn read_rss_bytes() -> u64 {
    #[cfg(target_os = "linux")]
    {
        read_rss_linux()
    }
    #[cfg(not(target_os = "linux"))]
    {
        0
    }
}

#[cfg(target_os = "linux")]
fn read_rss_linux() -> u64 {
    let Ok(status) = fs::read_to_string("/proc/self/status") else {
        return 0;
    };

    status
        .lines()
        .find(|line| line.starts_with("VmRSS:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|kb| kb.parse::<u64>().ok())
        .map_or(0, |kb| kb * 1024)
}

// ──────────────────── tests ────────────────────
