//! Service integration for hpw itself: generates the `hpw.service` unit
//! (Type=notify, watchdog), installs it in the system or user directory, and
//! drives `systemctl` for enable/disable.

use std::env;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use serde::Serialize;

use crate::core::errors::{HpwError, Result};
use crate::daemon::supervisor::run_with_timeout;

/// Unit name for the watchdog's own systemd service.
pub const SYSTEMD_UNIT_NAME: &str = "hpw.service";

/// Default `WatchdogSec` baked into the unit; the daemon pings at half of it.
pub const DEFAULT_WATCHDOG_SEC: u64 = 120;

/// Ceiling for one `systemctl` call; `daemon-reload` can be slow on busy hosts.
const SYSTEMCTL_TIMEOUT: Duration = Duration::from_secs(30);

/// Lifecycle operations for an installed service definition.
pub trait ServiceManager {
    fn install(&self) -> Result<()>;
    fn uninstall(&self) -> Result<()>;
    /// Active state of the installed unit as reported by the init system
    /// (`active`, `inactive`, `failed`, ...), or `unknown` when it cannot tell.
    fn status(&self) -> Result<String>;
}

// ---------------------------------------------------------------------------
// Systemd configuration
// ---------------------------------------------------------------------------

/// Parameters controlling unit file generation and lifecycle commands.
#[derive(Debug, Clone)]
pub struct SystemdConfig {
    /// Whether to operate in user scope (`--user`).
    pub user_scope: bool,
    /// Absolute path to the hpw binary baked into the unit file.
    pub binary_path: PathBuf,
    /// Config file passed to the daemon; `None` uses the built-in default path.
    pub config_path: Option<PathBuf>,
    pub watchdog_sec: u64,
    /// Unit being watched, ordered before hpw and named in the description.
    pub monitored_unit: String,
    /// `systemctl` executable used for lifecycle commands.
    pub systemctl_path: PathBuf,
}

impl SystemdConfig {
    /// Build a config from the current environment.
    pub fn from_env(
        user_scope: bool,
        config_path: Option<PathBuf>,
        monitored_unit: &str,
    ) -> Result<Self> {
        Ok(Self {
            user_scope,
            binary_path: resolve_hpw_binary()?,
            config_path,
            watchdog_sec: DEFAULT_WATCHDOG_SEC,
            monitored_unit: monitored_unit.to_string(),
            systemctl_path: PathBuf::from("systemctl"),
        })
    }

    /// Directory where the unit file is written.
    #[must_use]
    pub fn unit_dir(&self) -> PathBuf {
        if self.user_scope {
            let home = env::var_os("HOME").map_or_else(|| PathBuf::from("/tmp"), PathBuf::from);
            home.join(".config/systemd/user")
        } else {
            PathBuf::from("/etc/systemd/system")
        }
    }

    /// Full path to the generated unit file.
    #[must_use]
    pub fn unit_path(&self) -> PathBuf {
        self.unit_dir().join(SYSTEMD_UNIT_NAME)
    }
}

// ---------------------------------------------------------------------------
// Systemd service manager
// ---------------------------------------------------------------------------

/// [`ServiceManager`] that writes `hpw.service` and drives `systemctl`.
#[derive(Debug, Clone)]
pub struct SystemdServiceManager {
    config: SystemdConfig,
}

impl SystemdServiceManager {
    #[must_use]
    pub fn new(config: SystemdConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &SystemdConfig {
        &self.config
    }

    /// Generate the full systemd unit file content.
    #[must_use]
    pub fn generate_unit_file(&self) -> String {
        let binary = quote_arg(&self.config.binary_path);
        let mut exec = format!(
            "{binary} daemon --watchdog-sec {}",
            self.config.watchdog_sec
        );
        if let Some(cfg) = &self.config.config_path {
            write!(exec, " --config {}", quote_arg(cfg)).ok();
        }

        let mut unit = String::with_capacity(1024);

        // -- [Unit] section ------------------------------------------------
        writeln!(unit, "[Unit]").ok();
        writeln!(
            unit,
            "Description=HomePi Watchdog - keeps {} running and healthy",
            self.config.monitored_unit
        )
        .ok();
        writeln!(unit, "Wants=network-online.target").ok();
        writeln!(
            unit,
            "After=network-online.target {}",
            self.config.monitored_unit
        )
        .ok();
        writeln!(unit).ok();

        // -- [Service] section ---------------------------------------------
        writeln!(unit, "[Service]").ok();
        writeln!(unit, "Type=notify").ok();
        writeln!(unit, "NotifyAccess=main").ok();
        if self.config.watchdog_sec > 0 {
            writeln!(unit, "WatchdogSec={}", self.config.watchdog_sec).ok();
        }
        writeln!(unit, "ExecStart={exec}").ok();
        writeln!(unit, "ExecReload=/bin/kill -HUP $MAINPID").ok();
        writeln!(unit, "Restart=always").ok();
        writeln!(unit, "RestartSec=10").ok();
        writeln!(unit, "TimeoutStopSec=30").ok();
        writeln!(unit).ok();

        if !self.config.user_scope {
            // Must stay able to call systemctl, so no NoNewPrivileges/PrivateUsers.
            writeln!(unit, "# Hardening").ok();
            writeln!(unit, "ProtectSystem=full").ok();
            writeln!(unit, "ProtectKernelTunables=true").ok();
            writeln!(unit, "ProtectControlGroups=true").ok();
            writeln!(unit).ok();

            writeln!(unit, "# Logging").ok();
            writeln!(unit, "StandardOutput=journal").ok();
            writeln!(unit, "StandardError=journal").ok();
            writeln!(unit, "SyslogIdentifier=hpw").ok();
            writeln!(unit).ok();
        }

        // -- [Install] section ---------------------------------------------
        writeln!(unit, "[Install]").ok();
        if self.config.user_scope {
            writeln!(unit, "WantedBy=default.target").ok();
        } else {
            writeln!(unit, "WantedBy=multi-user.target").ok();
        }

        unit
    }

    // -- systemctl helpers -------------------------------------------------

    fn systemctl_args(&self, args: &[&str]) -> Vec<String> {
        let mut cmd_args: Vec<String> = Vec::with_capacity(args.len() + 1);
        if self.config.user_scope {
            cmd_args.push("--user".to_string());
        }
        cmd_args.extend(args.iter().map(|s| (*s).to_string()));
        cmd_args
    }

    fn run_systemctl(&self, args: &[&str]) -> Result<String> {
        let full_args = self.systemctl_args(args);
        let output = run_with_timeout(
            Command::new(&self.config.systemctl_path).args(&full_args),
            SYSTEMCTL_TIMEOUT,
        )
        .map_err(|details| HpwError::Runtime {
            details: format!("systemctl {}: {details}", full_args.join(" ")),
        })?;
        if output.status.success() {
            Ok(output.stdout.trim().to_string())
        } else {
            Err(HpwError::Runtime {
                details: format!(
                    "systemctl {} failed (exit {}): {}",
                    full_args.join(" "),
                    output.status.code().unwrap_or(-1),
                    output.stderr.trim()
                ),
            })
        }
    }

    /// Run systemctl but don't error on non-zero exit (stop/disable of a
    /// service that may already be stopped/disabled).
    fn run_systemctl_lenient(&self, args: &[&str]) -> String {
        let full_args = self.systemctl_args(args);
        run_with_timeout(
            Command::new(&self.config.systemctl_path).args(&full_args),
            SYSTEMCTL_TIMEOUT,
        )
        .map(|o| o.stdout.trim().to_string())
        .unwrap_or_default()
    }
}

impl ServiceManager for SystemdServiceManager {
    fn install(&self) -> Result<()> {
        if !self.config.user_scope && !is_running_as_root() {
            return Err(HpwError::Runtime {
                details: "installing the system service requires root; rerun with sudo or use --user"
                    .to_string(),
            });
        }

        let unit_dir = self.config.unit_dir();
        let unit_path = self.config.unit_path();

        fs::create_dir_all(&unit_dir).map_err(|source| HpwError::io(&unit_dir, source))?;
        fs::write(&unit_path, self.generate_unit_file())
            .map_err(|source| HpwError::io(&unit_path, source))?;

        self.run_systemctl(&["daemon-reload"])?;
        self.run_systemctl(&["enable", SYSTEMD_UNIT_NAME])?;
        Ok(())
    }

    fn uninstall(&self) -> Result<()> {
        let unit_path = self.config.unit_path();

        self.run_systemctl_lenient(&["stop", SYSTEMD_UNIT_NAME]);
        self.run_systemctl_lenient(&["disable", SYSTEMD_UNIT_NAME]);

        if unit_path.exists() {
            fs::remove_file(&unit_path).map_err(|source| HpwError::io(&unit_path, source))?;
        }

        self.run_systemctl(&["daemon-reload"])?;
        Ok(())
    }

    fn status(&self) -> Result<String> {
        // is-active exits non-zero for inactive/failed, so use lenient.
        let state = self.run_systemctl_lenient(&["is-active", SYSTEMD_UNIT_NAME]);
        if state.is_empty() {
            return Ok("unknown".to_string());
        }
        Ok(state)
    }
}

// ---------------------------------------------------------------------------
// Service installation result (for structured CLI output)
// ---------------------------------------------------------------------------

/// Structured result from an install or uninstall operation.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceActionResult {
    /// `"install"` or `"uninstall"`.
    pub action: &'static str,
    /// `"system"` or `"user"`.
    pub scope: &'static str,
    pub unit_path: PathBuf,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Resolve the hpw binary path (prefers the running binary, falls back to well-known locations).
fn resolve_hpw_binary() -> Result<PathBuf> {
    if let Ok(exe) = env::current_exe()
        && exe.exists()
    {
        return Ok(exe);
    }
    for candidate in &["/usr/local/bin/hpw", "/usr/bin/hpw"] {
        let p = Path::new(candidate);
        if p.exists() {
            return Ok(p.to_path_buf());
        }
    }
    Err(HpwError::Runtime {
        details: "could not locate hpw binary; install it to a PATH directory first".to_string(),
    })
}

/// Systemd quote escaping for paths with spaces or quotes.
fn quote_arg(path: &Path) -> String {
    let s = path.display().to_string();
    if s.contains(' ') || s.contains('"') {
        format!("\"{}\"", s.replace('"', "\\\""))
    } else {
        s
    }
}

/// Check whether the current process is running as root.
pub fn is_running_as_root() -> bool {
    #[cfg(unix)]
    {
        nix::unistd::geteuid().is_root()
    }
    #[cfg(not(unix))]
    {
        false
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(user_scope: bool) -> SystemdConfig {
        SystemdConfig {
            user_scope,
            binary_path: PathBuf::from("/usr/local/bin/hpw"),
            config_path: None,
            watchdog_sec: DEFAULT_WATCHDOG_SEC,
            monitored_unit: "homepi.service".to_string(),
            systemctl_path: PathBuf::from("systemctl"),
        }
    }

    #[cfg(unix)]
    fn manager_with_fake_systemctl(
        dir: &Path,
        user_scope: bool,
        script: &str,
    ) -> SystemdServiceManager {
        use std::os::unix::fs::PermissionsExt;

        let program = dir.join("systemctl");
        fs::write(&program, format!("#!/bin/sh\n{script}\n")).unwrap();
        fs::set_permissions(&program, fs::Permissions::from_mode(0o755)).unwrap();
        SystemdServiceManager::new(SystemdConfig {
            systemctl_path: program,
            ..test_config(user_scope)
        })
    }

    #[cfg(unix)]
    #[test]
    fn status_reports_is_active_output() {
        let dir = tempfile::tempdir().unwrap();
        let args_file = dir.path().join("args.txt");
        let mgr = manager_with_fake_systemctl(
            dir.path(),
            false,
            &format!("echo \"$@\" > {}\necho failed; exit 3", args_file.display()),
        );
        assert_eq!(mgr.status().unwrap(), "failed");
        let args = fs::read_to_string(&args_file).unwrap();
        assert_eq!(args.trim(), "is-active hpw.service");
    }

    #[cfg(unix)]
    #[test]
    fn status_in_user_scope_asks_user_manager() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager_with_fake_systemctl(
            dir.path(),
            true,
            "[ \"$1\" = --user ] && echo active || echo inactive",
        );
        assert_eq!(mgr.status().unwrap(), "active");
    }

    #[test]
    fn status_without_systemctl_is_unknown() {
        let mgr = SystemdServiceManager::new(SystemdConfig {
            systemctl_path: PathBuf::from("/nonexistent/hpw/systemctl"),
            ..test_config(false)
        });
        assert_eq!(mgr.status().unwrap(), "unknown");
    }

    #[test]
    fn unit_file_contains_required_sections() {
        let unit = SystemdServiceManager::new(test_config(false)).generate_unit_file();
        assert!(unit.contains("[Unit]"));
        assert!(unit.contains("[Service]"));
        assert!(unit.contains("[Install]"));
    }

    #[test]
    fn unit_file_uses_notify_with_watchdog() {
        let unit = SystemdServiceManager::new(test_config(false)).generate_unit_file();
        assert!(unit.contains("Type=notify"));
        assert!(unit.contains("WatchdogSec=120"));
        assert!(unit.contains("ExecStart=/usr/local/bin/hpw daemon --watchdog-sec 120\n"));
    }

    #[test]
    fn zero_watchdog_sec_omits_directive() {
        let mut config = test_config(false);
        config.watchdog_sec = 0;
        let unit = SystemdServiceManager::new(config).generate_unit_file();
        assert!(!unit.contains("WatchdogSec="));
        assert!(unit.contains("--watchdog-sec 0"));
    }

    #[test]
    fn exec_start_passes_config_path() {
        let mut config = test_config(false);
        config.config_path = Some(PathBuf::from("/etc/hpw/my config.toml"));
        let unit = SystemdServiceManager::new(config).generate_unit_file();
        assert!(unit.contains("--config \"/etc/hpw/my config.toml\""));
    }

    #[test]
    fn unit_orders_after_monitored_service() {
        let unit = SystemdServiceManager::new(test_config(false)).generate_unit_file();
        assert!(unit.contains("After=network-online.target homepi.service"));
        assert!(unit.contains("Description=HomePi Watchdog - keeps homepi.service"));
    }

    #[test]
    fn unit_file_has_restart_policy() {
        let unit = SystemdServiceManager::new(test_config(false)).generate_unit_file();
        assert!(unit.contains("Restart=always"));
        assert!(unit.contains("RestartSec=10"));
        assert!(unit.contains("ExecReload=/bin/kill -HUP $MAINPID"));
    }

    #[test]
    fn system_unit_file_has_hardening_and_journal() {
        let unit = SystemdServiceManager::new(test_config(false)).generate_unit_file();
        assert!(unit.contains("ProtectSystem=full"));
        assert!(unit.contains("SyslogIdentifier=hpw"));
        assert!(unit.contains("WantedBy=multi-user.target"));
        assert!(!unit.contains("NoNewPrivileges"));
    }

    #[test]
    fn user_unit_file_omits_system_only_directives() {
        let unit = SystemdServiceManager::new(test_config(true)).generate_unit_file();
        assert!(!unit.contains("ProtectSystem="));
        assert!(!unit.contains("SyslogIdentifier="));
        assert!(unit.contains("WantedBy=default.target"));
    }

    #[test]
    fn unit_path_system_scope() {
        assert_eq!(
            test_config(false).unit_path(),
            PathBuf::from("/etc/systemd/system/hpw.service")
        );
    }

    #[test]
    fn unit_path_user_scope() {
        let path = test_config(true).unit_path();
        assert!(path.to_string_lossy().ends_with("systemd/user/hpw.service"));
    }

    #[test]
    fn user_scope_prefixes_user_flag() {
        let mgr = SystemdServiceManager::new(test_config(true));
        assert_eq!(
            mgr.systemctl_args(&["enable", SYSTEMD_UNIT_NAME]),
            vec!["--user", "enable", "hpw.service"]
        );
    }
}
