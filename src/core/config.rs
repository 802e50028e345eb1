//! Configuration system: TOML file + env var overrides + smart defaults.

#![allow(missing_docs)]

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::errors::{HpwError, Result};
use crate::logger::sink::LogFormat;

/// Default location of the config file for the system service.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/hpw/config.toml";

/// Upper bound for every configured interval and timeout.
pub const MAX_INTERVAL_SECONDS: u64 = 86_400;

/// Full watchdog configuration model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct Config {
    pub watchdog: WatchdogConfig,
    pub logging: LoggingConfig,
    pub paths: PathsConfig,
    pub resources: ResourcesConfig,
}

/// What is monitored, and how patiently.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WatchdogConfig {
    /// Unit queried and restarted through the process supervisor.
    pub unit_name: String,
    /// Health endpoint of the monitored application.
    pub health_check_url: String,
    pub check_interval_seconds: u64,
    /// Restart attempts allowed for a failing health check before escalating.
    pub max_retries: u32,
    /// Wait after a restart before re-checking.
    pub restart_grace_seconds: u64,
    /// Back-off after escalation before polling resumes.
    pub escalation_cooldown_seconds: u64,
    pub health_timeout_seconds: u64,
    /// When false the watchdog only observes and logs.
    pub restart_enabled: bool,
    /// Upper bound on any single `systemctl` invocation.
    pub command_timeout_seconds: u64,
    /// Talk to the user service manager (`systemctl --user`).
    pub user_scope: bool,
    pub systemctl_path: PathBuf,
}

/// Log sink settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    pub log_file: PathBuf,
    pub fallback_file: Option<PathBuf>,
    pub format: LogFormat,
    pub max_size_bytes: u64,
    pub max_rotated_files: u32,
    /// Copy every line to stderr (picked up by journald under systemd).
    pub mirror_stderr: bool,
}

/// Host pressure warnings. Purely informational: they never trigger restarts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ResourcesConfig {
    pub enabled: bool,
    /// Warn when usage is strictly above these percentages (1-100).
    pub cpu_percent: u8,
    pub memory_percent: u8,
    pub disk_percent: u8,
    /// Any path on the filesystem whose usage is watched.
    pub disk_path: PathBuf,
}

/// Filesystem paths used by hpw.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    pub config_file: PathBuf,
    pub state_file: PathBuf,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            unit_name: "homepi.service".to_string(),
            health_check_url: "http://localhost:5000/api/health".to_string(),
            check_interval_seconds: 60,
            max_retries: 3,
            restart_grace_seconds: 10,
            escalation_cooldown_seconds: 300,
            health_timeout_seconds: 5,
            restart_enabled: true,
            command_timeout_seconds: 30,
            user_scope: false,
            systemctl_path: PathBuf::from("systemctl"),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_file: PathBuf::from("/var/log/homepi-watchdog.log"),
            fallback_file: Some(PathBuf::from("/tmp/homepi-watchdog.log")),
            format: LogFormat::Text,
            max_size_bytes: 10 * 1024 * 1024, // 10 MiB
            max_rotated_files: 5,
            mirror_stderr: true,
        }
    }
}

impl Default for ResourcesConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cpu_percent: 90,
            memory_percent: 90,
            disk_percent: 90,
            disk_path: PathBuf::from("/"),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            config_file: PathBuf::from(DEFAULT_CONFIG_PATH),
            state_file: PathBuf::from("/var/lib/hpw/state.json"),
        }
    }
}

impl WatchdogConfig {
    #[must_use]
    pub const fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_seconds)
    }

    #[must_use]
    pub const fn restart_grace(&self) -> Duration {
        Duration::from_secs(self.restart_grace_seconds)
    }

    #[must_use]
    pub const fn escalation_cooldown(&self) -> Duration {
        Duration::from_secs(self.escalation_cooldown_seconds)
    }

    #[must_use]
    pub const fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_seconds)
    }

    #[must_use]
    pub const fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_seconds)
    }
}

impl Config {
    /// Default configuration path.
    #[must_use]
    pub fn default_path() -> PathBuf {
        PathBuf::from(DEFAULT_CONFIG_PATH)
    }

    /// Load config from default or explicit path, then apply env overrides.
    ///
    /// Missing config file is not an error when loading from default path; defaults are used.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path_buf = path.map_or_else(Self::default_path, Path::to_path_buf);
        let is_explicit_path = path.is_some();

        let mut cfg = if path_buf.exists() {
            let raw = fs::read_to_string(&path_buf).map_err(|source| HpwError::Io {
                path: path_buf.clone(),
                source,
            })?;
            let parsed: Self = toml::from_str(&raw)?;
            parsed
        } else if is_explicit_path {
            return Err(HpwError::MissingConfig { path: path_buf });
        } else {
            Self::default()
        };

        cfg.paths.config_file = path_buf;
        cfg.apply_env_overrides_from(env_var)?;
        cfg.normalize();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Deterministic hash of the effective config for logging.
    ///
    /// FNV-1a over the canonical JSON form, stable across processes and
    /// Rust releases.
    pub fn stable_hash(&self) -> Result<String> {
        let canonical = serde_json::to_string(self)?;
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in canonical.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        Ok(format!("{hash:016x}"))
    }

    fn apply_env_overrides_from<F>(&mut self, mut lookup: F) -> Result<()>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let mut get = |name: &str| lookup(name).filter(|raw| !raw.trim().is_empty());

        // watchdog
        if let Some(raw) = get("HPW_UNIT_NAME") {
            self.watchdog.unit_name = raw;
        }
        if let Some(raw) = get("HPW_HEALTH_CHECK_URL") {
            self.watchdog.health_check_url = raw;
        }
        if let Some(raw) = get("HPW_CHECK_INTERVAL_SECONDS") {
            self.watchdog.check_interval_seconds =
                parse_env_u64("HPW_CHECK_INTERVAL_SECONDS", &raw)?;
        }
        if let Some(raw) = get("HPW_MAX_RETRIES") {
            self.watchdog.max_retries = parse_env_u32("HPW_MAX_RETRIES", &raw)?;
        }
        if let Some(raw) = get("HPW_RESTART_GRACE_SECONDS") {
            self.watchdog.restart_grace_seconds =
                parse_env_u64("HPW_RESTART_GRACE_SECONDS", &raw)?;
        }
        if let Some(raw) = get("HPW_ESCALATION_COOLDOWN_SECONDS") {
            self.watchdog.escalation_cooldown_seconds =
                parse_env_u64("HPW_ESCALATION_COOLDOWN_SECONDS", &raw)?;
        }
        if let Some(raw) = get("HPW_HEALTH_TIMEOUT_SECONDS") {
            self.watchdog.health_timeout_seconds =
                parse_env_u64("HPW_HEALTH_TIMEOUT_SECONDS", &raw)?;
        }
        if let Some(raw) = get("HPW_RESTART_ENABLED") {
            self.watchdog.restart_enabled = parse_env_bool("HPW_RESTART_ENABLED", &raw)?;
        }
        if let Some(raw) = get("HPW_COMMAND_TIMEOUT_SECONDS") {
            self.watchdog.command_timeout_seconds =
                parse_env_u64("HPW_COMMAND_TIMEOUT_SECONDS", &raw)?;
        }
        if let Some(raw) = get("HPW_USER_SCOPE") {
            self.watchdog.user_scope = parse_env_bool("HPW_USER_SCOPE", &raw)?;
        }
        if let Some(raw) = get("HPW_SYSTEMCTL_PATH") {
            self.watchdog.systemctl_path = PathBuf::from(raw);
        }

        // logging
        if let Some(raw) = get("HPW_LOG_FILE") {
            self.logging.log_file = PathBuf::from(raw);
        }
        if let Some(raw) = get("HPW_LOG_FORMAT") {
            self.logging.format = raw.parse().map_err(|details| HpwError::ConfigParse {
                context: "env",
                details: format!("HPW_LOG_FORMAT={raw:?}: {details}"),
            })?;
        }
        if let Some(raw) = get("HPW_LOG_MAX_SIZE_BYTES") {
            self.logging.max_size_bytes = parse_env_u64("HPW_LOG_MAX_SIZE_BYTES", &raw)?;
        }
        if let Some(raw) = get("HPW_LOG_MAX_ROTATED_FILES") {
            self.logging.max_rotated_files = parse_env_u32("HPW_LOG_MAX_ROTATED_FILES", &raw)?;
        }
        if let Some(raw) = get("HPW_LOG_MIRROR_STDERR") {
            self.logging.mirror_stderr = parse_env_bool("HPW_LOG_MIRROR_STDERR", &raw)?;
        }

        // paths
        if let Some(raw) = get("HPW_STATE_FILE") {
            self.paths.state_file = PathBuf::from(raw);
        }

        // resources
        if let Some(raw) = get("HPW_RESOURCES_ENABLED") {
            self.resources.enabled = parse_env_bool("HPW_RESOURCES_ENABLED", &raw)?;
        }
        if let Some(raw) = get("HPW_CPU_THRESHOLD_PERCENT") {
            self.resources.cpu_percent = parse_env_u8("HPW_CPU_THRESHOLD_PERCENT", &raw)?;
        }
        if let Some(raw) = get("HPW_MEMORY_THRESHOLD_PERCENT") {
            self.resources.memory_percent = parse_env_u8("HPW_MEMORY_THRESHOLD_PERCENT", &raw)?;
        }
        if let Some(raw) = get("HPW_DISK_THRESHOLD_PERCENT") {
            self.resources.disk_percent = parse_env_u8("HPW_DISK_THRESHOLD_PERCENT", &raw)?;
        }
        if let Some(raw) = get("HPW_DISK_PATH") {
            self.resources.disk_path = PathBuf::from(raw);
        }

        Ok(())
    }

    fn normalize(&mut self) {
        self.watchdog.unit_name = self.watchdog.unit_name.trim().to_string();
        self.watchdog.health_check_url = self.watchdog.health_check_url.trim().to_string();
    }

    fn validate(&self) -> Result<()> {
        let wd = &self.watchdog;

        if wd.unit_name.is_empty() || wd.unit_name.chars().any(char::is_whitespace) {
            return Err(HpwError::InvalidConfig {
                details: format!(
                    "watchdog.unit_name must be a non-empty unit name without whitespace, got {:?}",
                    wd.unit_name
                ),
            });
        }

        match reqwest::Url::parse(&wd.health_check_url) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {}
            Ok(url) => {
                return Err(HpwError::InvalidConfig {
                    details: format!(
                        "watchdog.health_check_url must use http or https, got scheme {:?}",
                        url.scheme()
                    ),
                });
            }
            Err(error) => {
                return Err(HpwError::InvalidConfig {
                    details: format!(
                        "watchdog.health_check_url {:?} is not a valid URL: {error}",
                        wd.health_check_url
                    ),
                });
            }
        }

        for (name, val) in [
            ("check_interval_seconds", wd.check_interval_seconds),
            ("health_timeout_seconds", wd.health_timeout_seconds),
            ("command_timeout_seconds", wd.command_timeout_seconds),
        ] {
            if val == 0 {
                return Err(HpwError::InvalidConfig {
                    details: format!("watchdog.{name} must be > 0"),
                });
            }
        }

        for (name, val) in [
            ("check_interval_seconds", wd.check_interval_seconds),
            ("restart_grace_seconds", wd.restart_grace_seconds),
            ("escalation_cooldown_seconds", wd.escalation_cooldown_seconds),
            ("health_timeout_seconds", wd.health_timeout_seconds),
            ("command_timeout_seconds", wd.command_timeout_seconds),
        ] {
            if val > MAX_INTERVAL_SECONDS {
                return Err(HpwError::InvalidConfig {
                    details: format!(
                        "watchdog.{name} ({val}) must be <= {MAX_INTERVAL_SECONDS} (one day)"
                    ),
                });
            }
        }

        if wd.systemctl_path.as_os_str().is_empty() {
            return Err(HpwError::InvalidConfig {
                details: "watchdog.systemctl_path must not be empty".to_string(),
            });
        }

        if self.logging.max_size_bytes < 1024 {
            return Err(HpwError::InvalidConfig {
                details: format!(
                    "logging.max_size_bytes ({}) must be >= 1024",
                    self.logging.max_size_bytes
                ),
            });
        }
        if self.logging.max_rotated_files == 0 {
            return Err(HpwError::InvalidConfig {
                details: "logging.max_rotated_files must be >= 1".to_string(),
            });
        }

        let res = &self.resources;
        for (name, val) in [
            ("cpu_percent", res.cpu_percent),
            ("memory_percent", res.memory_percent),
            ("disk_percent", res.disk_percent),
        ] {
            if !(1..=100).contains(&val) {
                return Err(HpwError::InvalidConfig {
                    details: format!("resources.{name} ({val}) must be within 1..=100"),
                });
            }
        }
        if res.disk_path.as_os_str().is_empty() {
            return Err(HpwError::InvalidConfig {
                details: "resources.disk_path must not be empty".to_string(),
            });
        }

        Ok(())
    }
}

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok()
}

fn parse_env_u64(name: &str, raw: &str) -> Result<u64> {
    raw.trim().parse::<u64>().map_err(|error| HpwError::ConfigParse {
        context: "env",
        details: format!("{name}={raw:?}: {error}"),
    })
}

fn parse_env_u8(name: &str, raw: &str) -> Result<u8> {
    raw.trim().parse::<u8>().map_err(|error| HpwError::ConfigParse {
        context: "env",
        details: format!("{name}={raw:?}: {error}"),
    })
}

fn parse_env_u32(name: &str, raw: &str) -> Result<u32> {
    raw.trim().parse::<u32>().map_err(|error| HpwError::ConfigParse {
        context: "env",
        details: format!("{name}={raw:?}: {error}"),
    })
}

fn parse_env_bool(name: &str, raw: &str) -> Result<bool> {
    raw.trim().parse::<bool>().map_err(|error| HpwError::ConfigParse {
        context: "env",
        details: format!("{name}={raw:?}: {error}"),
    })
}
