//! Daemon orchestration: startup, the poll loop, SIGHUP reload, and shutdown.
//!
//! Single-threaded by design: one check at a time with named sleeps in
//! between. Shutdown is only observed at sleep boundaries, so a restart in
//! progress always finishes its grace period and re-check first. If the loop
//! itself wedges, systemd's WatchdogSec restarts the process.

#![allow(missing_docs)]

use std::path::PathBuf;

use crate::core::config::Config;
use crate::core::errors::Result;
use crate::daemon::clock::{SignalAwareSleeper, Wake};
#[cfg(unix)]
use crate::daemon::pidfile::PidFile;
use crate::daemon::probe::HttpHealthProbe;
use crate::daemon::resources::ResourceMonitor;
use crate::daemon::self_monitor::SelfMonitor;
use crate::daemon::signals::{self, SignalHandler, WatchdogHeartbeat};
use crate::daemon::supervisor::SystemctlSupervisor;
use crate::daemon::watchdog::{RetryState, Watchdog};
use crate::logger::sink::{EventKind, LogEntry, LogWriter, Severity};

// ──────────────────── daemon configuration ────────────────────

/// Arguments for `hpw daemon` subcommand.
#[derive(Debug, Clone, Default)]
pub struct DaemonArgs {
    /// Optional PID file path for non-systemd setups.
    pub pidfile: Option<PathBuf>,
    /// Systemd watchdog timeout in seconds (0 = take `WATCHDOG_USEC` from systemd, if set).
    pub watchdog_sec: u64,
    /// Explicit config path, re-read on SIGHUP. `None` means the default location.
    pub config_path: Option<PathBuf>,
}

type ProductionWatchdog = Watchdog<SystemctlSupervisor, HttpHealthProbe, SignalAwareSleeper, LogWriter>;

/// The running watchdog service.
pub struct WatchdogDaemon {
    config: Config,
    config_path: Option<PathBuf>,
    watchdog: ProductionWatchdog,
    signal_handler: SignalHandler,
    self_monitor: SelfMonitor,
    resources: ResourceMonitor,
    retry_state: RetryState,
    #[cfg(unix)]
    _pidfile: Option<PidFile>,
}

impl WatchdogDaemon {
    /// Build and initialize the daemon from configuration.
    pub fn init(config: Config, args: &DaemonArgs) -> Result<Self> {
        // 1. Single-instance guard (before anything writes).
        #[cfg(unix)]
        let pidfile = args.pidfile.as_deref().map(PidFile::acquire).transpose()?;

        // 2. Signal handler + systemd heartbeat.
        let signal_handler = SignalHandler::new();
        let watchdog_sec = if args.watchdog_sec > 0 {
            args.watchdog_sec
        } else {
            watchdog_sec_from_env()
        };
        let heartbeat = if watchdog_sec > 0 {
            WatchdogHeartbeat::new(watchdog_sec)
        } else {
            WatchdogHeartbeat::disabled()
        };
        let sleeper = SignalAwareSleeper::new(signal_handler.clone(), heartbeat);

        // 3. Log sink, probe, supervisor.
        let sink = LogWriter::open(config.logging.clone());
        let probe = HttpHealthProbe::new()?;
        let supervisor = SystemctlSupervisor::from_config(&config.watchdog);

        let watchdog = Watchdog::new(config.watchdog.clone(), supervisor, probe, sleeper, sink);

        // 4. Self-monitor (writes state.json for `hpw status`).
        let self_monitor = SelfMonitor::new(config.paths.state_file.clone());
        let resources = ResourceMonitor::new(config.resources.clone());

        Ok(Self {
            config_path: args.config_path.clone(),
            config,
            watchdog,
            signal_handler,
            self_monitor,
            resources,
            retry_state: RetryState::new(),
            #[cfg(unix)]
            _pidfile: pidfile,
        })
    }

    /// Handle for requesting shutdown or reload from outside the loop.
    pub fn signal_handler(&self) -> SignalHandler {
        self.signal_handler.clone()
    }

    /// Run the watchdog loop until shutdown is requested.
    ///
    /// This is the main entry point for `hpw daemon`.
    pub fn run(&mut self) -> Result<()> {
        let config_hash = self.config.stable_hash().unwrap_or_default();
        let wd = &self.config.watchdog;
        let entry = LogEntry::new(
            EventKind::WatchdogStart,
            Severity::Info,
            format!(
                "HomePi Watchdog Service Started (hpw {}, config {config_hash}): watching {} via {} every {}s, max {} retries{}",
                env!("CARGO_PKG_VERSION"),
                wd.unit_name,
                wd.health_check_url,
                wd.check_interval_seconds,
                wd.max_retries,
                if wd.restart_enabled { "" } else { ", restarts disabled" },
            ),
        )
        .with_unit(&wd.unit_name)
        .with_url(&wd.health_check_url);
        self.watchdog.record(entry);
        self.watchdog.flush_log();

        self.self_monitor
            .write_state(&self.config.watchdog, self.watchdog.stats());
        signals::notify_ready(&self.self_monitor.status_line(&self.config.watchdog));

        // ──────── main loop ────────
        loop {
            // 1. Shutdown signal.
            if self.signal_handler.should_shutdown() {
                eprintln!("[HPW-DAEMON] shutdown requested");
                break;
            }

            // 2. Config reload signal.
            if self.signal_handler.should_reload() {
                self.handle_config_reload();
            }

            // 3. Poll interval.
            if self.watchdog.wait_for_next_cycle() == Wake::Shutdown {
                eprintln!("[HPW-DAEMON] shutdown requested");
                break;
            }

            // 4. One cycle.
            let report = self.watchdog.step(self.retry_state);
            self.retry_state = report.state;

            // 5. Host pressure warnings; independent of the retry state.
            self.check_resources();

            // 6. Publish state.
            self.self_monitor.record_cycle(&report);
            self.self_monitor
                .write_state(&self.config.watchdog, self.watchdog.stats());
            self.watchdog.sink_mut().try_recover();
            self.watchdog.flush_log();
        }

        self.shutdown();
        Ok(())
    }

    fn check_resources(&mut self) {
        for entry in self.resources.check() {
            self.watchdog.record(entry);
        }
    }

    fn handle_config_reload(&mut self) {
        eprintln!("[HPW-DAEMON] config reload requested (SIGHUP)");

        match Config::load(self.config_path.as_deref()) {
            Ok(new_config) => {
                let old_hash = self.config.stable_hash().unwrap_or_default();
                let new_hash = new_config.stable_hash().unwrap_or_default();

                if old_hash == new_hash {
                    eprintln!("[HPW-DAEMON] config unchanged, skipping reload");
                    return;
                }

                *self.watchdog.supervisor_mut() =
                    SystemctlSupervisor::from_config(&new_config.watchdog);
                self.retry_state = self
                    .watchdog
                    .reconfigure(new_config.watchdog.clone(), self.retry_state);
                if new_config.logging != self.config.logging {
                    self.watchdog.flush_log();
                    *self.watchdog.sink_mut() = LogWriter::open(new_config.logging.clone());
                }
                self.self_monitor
                    .set_state_file_path(new_config.paths.state_file.clone());
                self.resources.set_config(new_config.resources.clone());

                let entry = LogEntry::new(
                    EventKind::ConfigReload,
                    Severity::Info,
                    format!("Configuration reloaded (config hash: {old_hash} -> {new_hash})"),
                )
                .with_unit(&new_config.watchdog.unit_name)
                .with_retries(self.retry_state.count(), new_config.watchdog.max_retries);
                self.watchdog.record(entry);
                self.config = new_config;
                eprintln!("[HPW-DAEMON] config reloaded successfully");
            }
            Err(e) => {
                eprintln!("[HPW-DAEMON] config reload failed: {e}");
                let entry = LogEntry::new(
                    EventKind::Error,
                    Severity::Error,
                    format!("Config reload failed, keeping previous settings: {e}"),
                )
                .with_error(&e);
                self.watchdog.record(entry);
            }
        }
    }

    fn shutdown(&mut self) {
        signals::notify_stopping();
        let uptime_secs = self.self_monitor.uptime_seconds();

        let entry = LogEntry::new(
            EventKind::WatchdogStop,
            Severity::Info,
            format!("HomePi Watchdog Service Stopped (uptime {uptime_secs}s)"),
        )
        .with_unit(&self.config.watchdog.unit_name)
        .with_duration_ms(uptime_secs.saturating_mul(1000));
        self.watchdog.record(entry);
        self.self_monitor
            .write_state(&self.config.watchdog, self.watchdog.stats());
        self.watchdog.flush_log();

        eprintln!("[HPW-DAEMON] shutdown complete (uptime={uptime_secs}s)");
    }
}

/// `WatchdogSec` as announced by systemd through `WATCHDOG_USEC`, in whole seconds.
fn watchdog_sec_from_env() -> u64 {
    std::env::var("WATCHDOG_USEC")
        .ok()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .map_or(0, |usec| usec / 1_000_000)
}
