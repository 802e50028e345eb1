//! Host resource pressure: CPU, memory and disk usage against thresholds.
//!
//! Informational only. A crossed threshold becomes a warning log entry; the
//! restart logic never sees it. CPU usage is the busy share of `/proc/stat`
//! jiffies between two consecutive samples, so the first check after startup
//! (or after a failed read) has no CPU figure.

#![allow(missing_docs)]
#![allow(clippy::cast_precision_loss)]

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::core::config::ResourcesConfig;
use crate::core::errors::{HpwError, Result};
use crate::logger::sink::{EventKind, LogEntry, Severity};

/// Cumulative jiffies from the aggregate `cpu` line of `/proc/stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuTimes {
    pub busy: u64,
    pub total: u64,
}

impl CpuTimes {
    /// Busy share since `earlier`, in percent. `None` when the counters did
    /// not advance (or went backwards).
    pub fn percent_since(&self, earlier: &Self) -> Option<f64> {
        let total = self.total.checked_sub(earlier.total).filter(|t| *t > 0)?;
        let busy = self.busy.saturating_sub(earlier.busy).min(total);
        Some(busy as f64 * 100.0 / total as f64)
    }
}

/// One reading of host usage, in percent. `None` means not measured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ResourceUsage {
    pub cpu_percent: Option<f64>,
    pub memory_percent: Option<f64>,
    pub disk_percent: Option<f64>,
}

impl ResourceUsage {
    /// Warning lines for every figure strictly above its threshold.
    pub fn over_threshold(&self, config: &ResourcesConfig) -> Vec<String> {
        [
            ("CPU", self.cpu_percent, config.cpu_percent),
            ("memory", self.memory_percent, config.memory_percent),
            ("disk", self.disk_percent, config.disk_percent),
        ]
        .into_iter()
        .filter_map(|(label, value, limit)| {
            let value = value?;
            (value > f64::from(limit)).then(|| format!("High {label} usage: {value:.1}%"))
        })
        .collect()
    }
}

/// Samples host usage and turns threshold crossings into log entries.
pub struct ResourceMonitor {
    config: ResourcesConfig,
    proc_root: PathBuf,
    last_cpu: Option<CpuTimes>,
    /// Set after a failed sample so repeated failures log only once.
    failing: bool,
}

impl ResourceMonitor {
    pub fn new(config: ResourcesConfig) -> Self {
        Self::with_proc_root(config, "/proc")
    }

    /// Read `stat` and `meminfo` from `proc_root` instead of `/proc`.
    pub fn with_proc_root(config: ResourcesConfig, proc_root: impl Into<PathBuf>) -> Self {
        Self {
            config,
            proc_root: proc_root.into(),
            last_cpu: None,
            failing: false,
        }
    }

    pub fn config(&self) -> &ResourcesConfig {
        &self.config
    }

    /// Swap thresholds (config reload). The CPU baseline is kept.
    pub fn set_config(&mut self, config: ResourcesConfig) {
        self.config = config;
    }

    /// Take one reading. CPU is only known from the second call onwards.
    pub fn sample(&mut self) -> Result<ResourceUsage> {
        let cpu = read_cpu_times(&self.proc_root.join("stat"))?;
        let cpu_percent = self.last_cpu.and_then(|earlier| cpu.percent_since(&earlier));
        self.last_cpu = Some(cpu);

        let memory_percent = read_memory_percent(&self.proc_root.join("meminfo"))?;
        let disk_percent = disk_usage_percent(&self.config.disk_path)?;

        Ok(ResourceUsage {
            cpu_percent,
            memory_percent: Some(memory_percent),
            disk_percent,
        })
    }

    /// Sample and report. Empty when disabled or nothing is over threshold.
    ///
    /// A sampling failure yields one `Error` entry; further failures stay
    /// quiet until a sample succeeds again.
    pub fn check(&mut self) -> Vec<LogEntry> {
        if !self.config.enabled {
            return Vec::new();
        }

        match self.sample() {
            Ok(usage) => {
                self.failing = false;
                usage
                    .over_threshold(&self.config)
                    .into_iter()
                    .map(|message| {
                        LogEntry::new(EventKind::ResourceWarning, Severity::Warning, message)
                    })
                    .collect()
            }
            Err(e) => {
                self.last_cpu = None;
                if std::mem::replace(&mut self.failing, true) {
                    return Vec::new();
                }
                vec![
                    LogEntry::new(
                        EventKind::Error,
                        Severity::Error,
                        format!("Error checking system resources: {e}"),
                    )
                    .with_error(&e),
                ]
            }
        }
    }
}

// ──────────────────── /proc parsing ────────────────────

fn read_proc(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|source| HpwError::io(path, source))
}

fn read_cpu_times(path: &Path) -> Result<CpuTimes> {
    parse_cpu_times(&read_proc(path)?)
}

/// Parse the aggregate `cpu` line. Idle time includes iowait; guest time is
/// already counted inside user/nice and is left out of the total.
pub fn parse_cpu_times(raw: &str) -> Result<CpuTimes> {
    let malformed = |details: String| HpwError::ResourceSample {
        resource: "CPU",
        details,
    };

    let line = raw
        .lines()
        .find(|line| line.split_whitespace().next() == Some("cpu"))
        .ok_or_else(|| malformed("no aggregate cpu line in /proc/stat".to_string()))?;

    let fields = line
        .split_whitespace()
        .skip(1)
        .take(8)
        .map(|field| {
            field
                .parse::<u64>()
                .map_err(|err| malformed(format!("invalid cpu field {field:?}: {err}")))
        })
        .collect::<Result<Vec<u64>>>()?;
    if fields.len() < 4 {
        return Err(malformed(format!("too few cpu fields in {line:?}")));
    }

    let total = fields.iter().fold(0u64, |acc, v| acc.saturating_add(*v));
    let idle = fields[3].saturating_add(fields.get(4).copied().unwrap_or(0));
    Ok(CpuTimes {
        busy: total.saturating_sub(idle),
        total,
    })
}

fn read_memory_percent(path: &Path) -> Result<f64> {
    let values = parse_meminfo(&read_proc(path)?)?;
    let required = |key: &str| {
        values.get(key).copied().ok_or_else(|| HpwError::ResourceSample {
            resource: "memory",
            details: format!("missing meminfo field {key}"),
        })
    };
    let total = required("MemTotal")?;
    let available = required("MemAvailable")?;
    if total == 0 {
        return Err(HpwError::ResourceSample {
            resource: "memory",
            details: "MemTotal is zero".to_string(),
        });
    }
    Ok(total.saturating_sub(available) as f64 * 100.0 / total as f64)
}

/// `Key: value [kB]` lines into bytes. Lines that do not parse are skipped.
pub fn parse_meminfo(raw: &str) -> Result<HashMap<String, u64>> {
    let values: HashMap<String, u64> = raw
        .lines()
        .filter_map(|line| {
            let (key, rest) = line.split_once(':')?;
            let mut parts = rest.split_whitespace();
            let value = parts.next()?.parse::<u64>().ok()?;
            let bytes = match parts.next() {
                None => value,
                Some("kB") => value.saturating_mul(1024),
                Some(_) => return None,
            };
            Some((key.trim().to_string(), bytes))
        })
        .collect();

    if values.is_empty() {
        return Err(HpwError::ResourceSample {
            resource: "memory",
            details: "no readable fields in /proc/meminfo".to_string(),
        });
    }
    Ok(values)
}

// ──────────────────── disk ────────────────────

/// Used share of the filesystem holding `path`, as `df` reports it:
/// blocks reserved for root count as neither used nor available.
#[cfg(unix)]
#[allow(clippy::useless_conversion)]
fn disk_usage_percent(path: &Path) -> Result<Option<f64>> {
    let stat = nix::sys::statvfs::statvfs(path).map_err(|error| HpwError::ResourceSample {
        resource: "disk",
        details: format!("statvfs {}: {error}", path.display()),
    })?;
    let used = u64::from(stat.blocks()).saturating_sub(u64::from(stat.blocks_free()));
    let available = u64::from(stat.blocks_available());
    Ok(percent_used(used, available))
}

#[cfg(not(unix))]
fn disk_usage_percent(_path: &Path) -> Result<Option<f64>> {
    Ok(None)
}

fn percent_used(used: u64, available: u64) -> Option<f64> {
    let denominator = used.saturating_add(available);
    (denominator > 0).then(|| used as f64 * 100.0 / denominator as f64)
}
