//! Top-level CLI definition and dispatch.

use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;

use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::{Shell as CompletionShell, generate};
use colored::{Colorize, control};
use serde_json::{Value, json};
use thiserror::Error;

use homepi_watchdog::core::config::{Config, WatchdogConfig};
use homepi_watchdog::core::errors::HpwError;
use homepi_watchdog::daemon::clock::SignalAwareSleeper;
use homepi_watchdog::daemon::loop_main::{DaemonArgs as LoopDaemonArgs, WatchdogDaemon};
use homepi_watchdog::daemon::probe::HttpHealthProbe;
use homepi_watchdog::daemon::resources::ResourceMonitor;
use homepi_watchdog::daemon::self_monitor::{SelfMonitor, is_stale, state_age_seconds};
use homepi_watchdog::daemon::service::{
    DEFAULT_WATCHDOG_SEC, SYSTEMD_UNIT_NAME, ServiceActionResult, ServiceManager, SystemdConfig,
    SystemdServiceManager,
};
use homepi_watchdog::daemon::signals::{SignalHandler, WatchdogHeartbeat};
use homepi_watchdog::daemon::supervisor::SystemctlSupervisor;
use homepi_watchdog::daemon::watchdog::{HealthStatus, ServiceStatus, Watchdog};
use homepi_watchdog::logger::sink::MemorySink;

/// HomePi Watchdog: keeps the HomePi service alive and healthy.
#[derive(Debug, Parser)]
#[command(
    name = "hpw",
    author,
    version,
    about = "HomePi Watchdog - service liveness and health supervisor",
    long_about = None,
    arg_required_else_help = true
)]
pub struct Cli {
    /// Override config file path.
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Force JSON output mode.
    #[arg(long, global = true)]
    json: bool,
    /// Disable colored output.
    #[arg(long, global = true)]
    no_color: bool,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Run the watchdog loop.
    Daemon(DaemonArgs),
    /// One-shot liveness and health check (no restart).
    Check,
    /// Show the state published by the running daemon.
    Status(StatusArgs),
    /// Inspect configuration.
    Config(ConfigArgs),
    /// Install hpw as a systemd service.
    Install(InstallArgs),
    /// Remove the hpw systemd service.
    Uninstall(UninstallArgs),
    /// Generate shell completions.
    Completions(CompletionsArgs),
    /// Show version and optional build metadata.
    Version(VersionArgs),
}

#[derive(Debug, Clone, Args, Default)]
struct DaemonArgs {
    /// Optional pidfile path for non-service usage.
    #[arg(long, value_name = "PATH")]
    pidfile: Option<PathBuf>,
    /// Systemd watchdog timeout in seconds (0 takes WATCHDOG_USEC from systemd).
    #[arg(long, default_value_t = 0, value_name = "SECONDS")]
    watchdog_sec: u64,
}

#[derive(Debug, Clone, Args)]
struct InstallArgs {
    /// Install in user service scope.
    #[arg(long)]
    user: bool,
    /// WatchdogSec written into the unit file.
    #[arg(long, default_value_t = DEFAULT_WATCHDOG_SEC, value_name = "SECONDS")]
    watchdog_sec: u64,
}

#[derive(Debug, Clone, Args, Default)]
struct StatusArgs {
    /// Ask the user service manager about the hpw unit.
    #[arg(long)]
    user: bool,
}

#[derive(Debug, Clone, Args, Default)]
struct UninstallArgs {
    /// Remove the user-scope unit.
    #[arg(long)]
    user: bool,
}

#[derive(Debug, Clone, Args, Default)]
struct ConfigArgs {
    #[command(subcommand)]
    command: Option<ConfigCommand>,
}

#[derive(Debug, Clone, Subcommand)]
enum ConfigCommand {
    /// Print the config file path in use.
    Path,
    /// Print the effective configuration (file + env overrides).
    Show,
    /// Validate the configuration and print its hash.
    Validate,
}

#[derive(Debug, Clone, Args, Default)]
struct VersionArgs {
    /// Include build metadata.
    #[arg(long)]
    verbose: bool,
}

#[derive(Debug, Clone, Args)]
struct CompletionsArgs {
    /// Shell to generate completion script for.
    #[arg(value_enum)]
    shell: CompletionShell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputMode {
    Human,
    Json,
}

/// CLI error type with explicit exit-code mapping.
#[derive(Debug, Error)]
pub enum CliError {
    /// Invalid user input or configuration.
    #[error("{0}")]
    User(String),
    /// Environment/runtime failure.
    #[error("{0}")]
    Runtime(String),
    /// Internal bug or invariant violation.
    #[error("{0}")]
    Internal(String),
    /// The checked service is down or unhealthy.
    #[error("{0}")]
    Unhealthy(String),
    /// JSON serialization failed.
    #[error("failed to serialize output: {0}")]
    Json(#[from] serde_json::Error),
    /// Output write failed.
    #[error("failed to write output: {0}")]
    Io(#[from] io::Error),
}

impl CliError {
    /// Process exit code contract for the CLI.
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::User(_) => 1,
            Self::Runtime(_) | Self::Io(_) => 2,
            Self::Internal(_) | Self::Json(_) => 3,
            Self::Unhealthy(_) => 4,
        }
    }
}

impl From<HpwError> for CliError {
    fn from(e: HpwError) -> Self {
        match e {
            HpwError::InvalidConfig { .. }
            | HpwError::MissingConfig { .. }
            | HpwError::ConfigParse { .. } => Self::User(e.to_string()),
            HpwError::Serialization { .. } => Self::Internal(e.to_string()),
            _ => Self::Runtime(e.to_string()),
        }
    }
}

/// Dispatch CLI commands.
pub fn run(cli: &Cli) -> Result<(), CliError> {
    if cli.no_color {
        control::set_override(false);
    }

    match &cli.command {
        Command::Daemon(args) => run_daemon(cli, args),
        Command::Check => run_check(cli),
        Command::Status(args) => run_status(cli, args),
        Command::Config(args) => run_config(cli, args),
        Command::Install(args) => run_install(cli, args),
        Command::Uninstall(args) => run_uninstall(cli, args),
        Command::Completions(args) => {
            let mut command = Cli::command();
            let binary_name = command.get_name().to_string();
            generate(args.shell, &mut command, binary_name, &mut io::stdout());
            Ok(())
        }
        Command::Version(args) => emit_version(cli, args),
    }
}

// ---------------------------------------------------------------------------
// daemon
// ---------------------------------------------------------------------------

fn run_daemon(cli: &Cli, args: &DaemonArgs) -> Result<(), CliError> {
    let config = Config::load(cli.config.as_deref())?;
    let loop_args = LoopDaemonArgs {
        pidfile: args.pidfile.clone(),
        watchdog_sec: args.watchdog_sec,
        config_path: cli.config.clone(),
    };
    let mut daemon = WatchdogDaemon::init(config, &loop_args)?;
    daemon.run()?;
    Ok(())
}

// ---------------------------------------------------------------------------
// check
// ---------------------------------------------------------------------------

fn run_check(cli: &Cli) -> Result<(), CliError> {
    let config = Config::load(cli.config.as_deref())?;
    let wd_config = config.watchdog;

    let probe = HttpHealthProbe::new()?;
    let supervisor = SystemctlSupervisor::from_config(&wd_config);
    let sleeper = SignalAwareSleeper::new(SignalHandler::detached(), WatchdogHeartbeat::disabled());
    let mut watchdog = Watchdog::new(
        wd_config.clone(),
        supervisor,
        probe,
        sleeper,
        MemorySink::new(),
    );

    let service = watchdog.check_service_active();
    let health = watchdog.check_health_endpoint();
    let problems: Vec<String> = watchdog
        .sink()
        .messages()
        .into_iter()
        .map(str::to_string)
        .collect();
    let healthy = service == ServiceStatus::Active && health == HealthStatus::Healthy;

    // Host pressure is reported but never changes the exit code.
    let (usage, warnings) = if config.resources.enabled {
        let mut monitor = ResourceMonitor::new(config.resources.clone());
        match monitor.sample() {
            Ok(usage) => (Some(usage), usage.over_threshold(monitor.config())),
            Err(e) => (None, vec![format!("Error checking system resources: {e}")]),
        }
    } else {
        (None, Vec::new())
    };

    match output_mode(cli) {
        OutputMode::Human => {
            println!("Unit:   {} ({})", wd_config.unit_name, paint_service(service));
            println!(
                "Health: {} ({})",
                wd_config.health_check_url,
                paint_health(health)
            );
            for problem in &problems {
                println!("  - {problem}");
            }
            if let Some(usage) = usage {
                println!(
                    "Host:   memory {}, disk {}",
                    format_percent(usage.memory_percent),
                    format_percent(usage.disk_percent)
                );
            }
            for warning in &warnings {
                println!("  ! {}", warning.yellow());
            }
        }
        OutputMode::Json => {
            let payload = json!({
                "command": "check",
                "unit": wd_config.unit_name,
                "health_check_url": wd_config.health_check_url,
                "service": service,
                "health": health,
                "healthy": healthy,
                "problems": problems,
                "resources": usage,
                "resource_warnings": warnings,
            });
            write_json_line(&payload)?;
        }
    }

    if healthy {
        Ok(())
    } else {
        Err(CliError::Unhealthy(format!(
            "{} is {service} and {health}",
            wd_config.unit_name
        )))
    }
}

fn format_percent(value: Option<f64>) -> String {
    value.map_or_else(|| "-".to_string(), |v| format!("{v:.1}%"))
}

fn paint_service(status: ServiceStatus) -> colored::ColoredString {
    match status {
        ServiceStatus::Active => status.to_string().green(),
        ServiceStatus::Inactive => status.to_string().red().bold(),
    }
}

fn paint_health(status: HealthStatus) -> colored::ColoredString {
    match status {
        HealthStatus::Healthy => status.to_string().green(),
        HealthStatus::Unhealthy => status.to_string().red().bold(),
    }
}

// ---------------------------------------------------------------------------
// status
// ---------------------------------------------------------------------------

fn run_status(cli: &Cli, args: &StatusArgs) -> Result<(), CliError> {
    let config = Config::load(cli.config.as_deref())?;
    let state_path = config.paths.state_file.clone();
    let version = env!("CARGO_PKG_VERSION");
    let unit_state = own_unit_state(&config, args.user);

    if !state_path.exists() {
        match output_mode(cli) {
            OutputMode::Human => {
                println!("HomePi Watchdog v{version}");
                println!("  Config: {}", config.paths.config_file.display());
                println!("  Unit:   {SYSTEMD_UNIT_NAME} {}", paint_unit_state(&unit_state));
                println!(
                    "  Daemon: {} (no state file at {})",
                    "not running".yellow(),
                    state_path.display()
                );
            }
            OutputMode::Json => {
                let payload = json!({
                    "command": "status",
                    "state_file": state_path.to_string_lossy(),
                    "unit": SYSTEMD_UNIT_NAME,
                    "unit_state": unit_state,
                    "daemon_running": false,
                    "state": Value::Null,
                });
                write_json_line(&payload)?;
            }
        }
        return Ok(());
    }

    let state = SelfMonitor::read_state(&state_path)?;
    let stale = is_stale(&state);
    let age = state_age_seconds(&state);

    match output_mode(cli) {
        OutputMode::Human => {
            println!("HomePi Watchdog v{version}");
            println!("  Config: {}", config.paths.config_file.display());
            println!("  Unit:   {SYSTEMD_UNIT_NAME} {}", paint_unit_state(&unit_state));
            if stale {
                println!(
                    "  Daemon: {} (pid {}, last update {}s ago)",
                    "stale".yellow().bold(),
                    state.pid,
                    age.unwrap_or_default()
                );
            } else {
                println!(
                    "  Daemon: {} (pid {}, up {})",
                    "running".green(),
                    state.pid,
                    format_duration(state.uptime_seconds)
                );
            }
            println!("\nMonitored service:");
            println!("  Unit:     {}", state.unit);
            println!("  Health:   {}", state.health_url);
            println!(
                "  Service:  {}",
                state.service.map_or_else(|| "-".to_string(), |s| s.to_string())
            );
            println!(
                "  Endpoint: {}",
                state.health.map_or_else(|| "-".to_string(), |h| h.to_string())
            );
            println!("  Retries:  {}/{}", state.retry_count, state.max_retries);
            if !state.restart_enabled {
                println!("  Restarts: {}", "disabled (monitor only)".yellow());
            }
            if let Some(action) = &state.last_action {
                println!(
                    "  Last:     {action} at {}",
                    state.last_action_at.as_deref().unwrap_or("-")
                );
            }

            let c = &state.counters;
            println!("\nCounters:");
            println!("  cycles {} (healthy {})", c.cycles, c.healthy_cycles);
            println!(
                "  restarts {} attempted, {} succeeded, {} failed, {} skipped",
                c.restarts_attempted, c.restarts_succeeded, c.restarts_failed, c.restarts_skipped
            );
            println!("  escalations {}", c.escalations);
        }
        OutputMode::Json => {
            let payload = json!({
                "command": "status",
                "state_file": state_path.to_string_lossy(),
                "unit": SYSTEMD_UNIT_NAME,
                "unit_state": unit_state,
                "daemon_running": !stale,
                "stale": stale,
                "age_seconds": age,
                "state": serde_json::to_value(&state)?,
            });
            write_json_line(&payload)?;
        }
    }
    Ok(())
}

/// Active state of hpw's own unit; `unknown` when systemd cannot be asked.
fn own_unit_state(config: &Config, user_scope: bool) -> String {
    SystemdConfig::from_env(user_scope, None, &config.watchdog.unit_name)
        .and_then(|mut systemd| {
            systemd.systemctl_path.clone_from(&config.watchdog.systemctl_path);
            SystemdServiceManager::new(systemd).status()
        })
        .unwrap_or_else(|_| "unknown".to_string())
}

fn paint_unit_state(state: &str) -> colored::ColoredString {
    match state {
        "active" => state.green(),
        "failed" => state.red().bold(),
        _ => state.yellow(),
    }
}

// ---------------------------------------------------------------------------
// config
// ---------------------------------------------------------------------------

fn run_config(cli: &Cli, args: &ConfigArgs) -> Result<(), CliError> {
    match &args.command {
        None | Some(ConfigCommand::Path) => {
            let path = cli.config.clone().unwrap_or_else(Config::default_path);
            let exists = path.exists();

            match output_mode(cli) {
                OutputMode::Human => {
                    println!("{}", path.display());
                    if !exists {
                        println!("  (file does not exist; defaults will be used)");
                    }
                }
                OutputMode::Json => {
                    let payload = json!({
                        "command": "config path",
                        "path": path.to_string_lossy(),
                        "exists": exists,
                    });
                    write_json_line(&payload)?;
                }
            }
            Ok(())
        }
        Some(ConfigCommand::Show) => {
            let config = Config::load(cli.config.as_deref())?;

            match output_mode(cli) {
                OutputMode::Human => {
                    let toml_str = toml::to_string_pretty(&config)
                        .map_err(|e| CliError::Internal(format!("serialize config: {e}")))?;
                    println!("{toml_str}");
                }
                OutputMode::Json => {
                    let payload = json!({
                        "command": "config show",
                        "config": serde_json::to_value(&config)?,
                    });
                    write_json_line(&payload)?;
                }
            }
            Ok(())
        }
        Some(ConfigCommand::Validate) => match Config::load(cli.config.as_deref()) {
            Ok(config) => {
                let hash = config.stable_hash()?;

                match output_mode(cli) {
                    OutputMode::Human => {
                        println!("Configuration is valid.");
                        println!("  Source: {}", config.paths.config_file.display());
                        println!("  Hash: {hash}");
                    }
                    OutputMode::Json => {
                        let payload = json!({
                            "command": "config validate",
                            "valid": true,
                            "path": config.paths.config_file.to_string_lossy(),
                            "hash": hash,
                        });
                        write_json_line(&payload)?;
                    }
                }
                Ok(())
            }
            Err(e) => {
                match output_mode(cli) {
                    OutputMode::Human => {
                        eprintln!("Configuration is INVALID: {e}");
                    }
                    OutputMode::Json => {
                        let payload = json!({
                            "command": "config validate",
                            "valid": false,
                            "code": e.code(),
                            "error": e.to_string(),
                        });
                        write_json_line(&payload)?;
                    }
                }
                Err(CliError::User(format!("invalid config: {e}")))
            }
        },
    }
}

// ---------------------------------------------------------------------------
// install / uninstall
// ---------------------------------------------------------------------------

fn run_install(cli: &Cli, args: &InstallArgs) -> Result<(), CliError> {
    // The unit bakes in the monitored unit name, so the config must be valid.
    let config = Config::load(cli.config.as_deref())?;
    let config_path = cli.config.as_deref().map(absolute_path);
    let mut systemd = SystemdConfig::from_env(args.user, config_path, &config.watchdog.unit_name)?;
    systemd.watchdog_sec = args.watchdog_sec;
    systemd.systemctl_path.clone_from(&config.watchdog.systemctl_path);
    let mgr = SystemdServiceManager::new(systemd);

    let unit_path = mgr.config().unit_path();
    let scope = scope_label(args.user);
    let outcome = mgr.install();
    let result = ServiceActionResult {
        action: "install",
        scope,
        unit_path: unit_path.clone(),
        success: outcome.is_ok(),
        error: outcome.as_ref().err().map(ToString::to_string),
    };

    match output_mode(cli) {
        OutputMode::Human => match &outcome {
            Ok(()) => {
                println!("Installed systemd service ({scope} scope).");
                println!("  Unit file: {}", unit_path.display());
                println!("  Watching:  {}", config.watchdog.unit_name);
                println!("  Service enabled. Start with:");
                if args.user {
                    println!("    systemctl --user start {SYSTEMD_UNIT_NAME}");
                } else {
                    println!("    sudo systemctl start {SYSTEMD_UNIT_NAME}");
                }
            }
            Err(e) => eprintln!("Failed to install systemd service: {e}"),
        },
        OutputMode::Json => write_json_line(&serde_json::to_value(&result)?)?,
    }

    outcome.map_err(|e| CliError::Runtime(format!("install failed: {e}")))
}

fn run_uninstall(cli: &Cli, args: &UninstallArgs) -> Result<(), CliError> {
    // Removal must work even when the config has since been broken.
    let watchdog = Config::load(cli.config.as_deref())
        .map_or_else(|_| WatchdogConfig::default(), |c| c.watchdog);
    let mut systemd = SystemdConfig::from_env(args.user, None, &watchdog.unit_name)?;
    systemd.systemctl_path = watchdog.systemctl_path;
    let mgr = SystemdServiceManager::new(systemd);

    let unit_path = mgr.config().unit_path();
    let scope = scope_label(args.user);
    let outcome = mgr.uninstall();
    let result = ServiceActionResult {
        action: "uninstall",
        scope,
        unit_path: unit_path.clone(),
        success: outcome.is_ok(),
        error: outcome.as_ref().err().map(ToString::to_string),
    };

    match output_mode(cli) {
        OutputMode::Human => match &outcome {
            Ok(()) => {
                println!("Removed systemd service ({scope} scope).");
                println!("  Unit file: {}", unit_path.display());
            }
            Err(e) => eprintln!("Failed to uninstall systemd service: {e}"),
        },
        OutputMode::Json => write_json_line(&serde_json::to_value(&result)?)?,
    }

    outcome.map_err(|e| CliError::Runtime(format!("uninstall failed: {e}")))
}

const fn scope_label(user: bool) -> &'static str {
    if user { "user" } else { "system" }
}

fn absolute_path(path: &std::path::Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

// ---------------------------------------------------------------------------
// version + output helpers
// ---------------------------------------------------------------------------

fn emit_version(cli: &Cli, args: &VersionArgs) -> Result<(), CliError> {
    let version = env!("CARGO_PKG_VERSION");
    let package = env!("CARGO_PKG_NAME");
    let target = option_env!("TARGET").unwrap_or("unknown");
    let profile = option_env!("PROFILE").unwrap_or("unknown");
    let git_sha = option_env!("GIT_SHA").unwrap_or("unknown");

    match output_mode(cli) {
        OutputMode::Human => {
            println!("hpw {version}");
            if args.verbose {
                println!("package: {package}");
                println!("target: {target}");
                println!("profile: {profile}");
                println!("git_sha: {git_sha}");
            }
        }
        OutputMode::Json => {
            let payload = json!({
                "binary": "hpw",
                "version": version,
                "package": package,
                "build": {
                    "target": target,
                    "profile": profile,
                    "git_sha": git_sha,
                }
            });
            write_json_line(&payload)?;
        }
    }
    Ok(())
}

fn format_duration(total_secs: u64) -> String {
    let days = total_secs / 86_400;
    let hours = (total_secs % 86_400) / 3_600;
    let minutes = (total_secs % 3_600) / 60;
    let secs = total_secs % 60;
    if days > 0 {
        format!("{days}d {hours}h")
    } else if hours > 0 {
        format!("{hours}h {minutes}m")
    } else if minutes > 0 {
        format!("{minutes}m {secs}s")
    } else {
        format!("{secs}s")
    }
}

fn write_json_line(payload: &Value) -> Result<(), CliError> {
    let mut stdout = io::stdout().lock();
    serde_json::to_writer(&mut stdout, payload)?;
    writeln!(stdout)?;
    Ok(())
}

fn output_mode(cli: &Cli) -> OutputMode {
    let env_mode = std::env::var("HPW_OUTPUT_FORMAT").ok();
    resolve_output_mode(cli.json, env_mode.as_deref(), io::stdout().is_terminal())
}

fn resolve_output_mode(json_flag: bool, env_mode: Option<&str>, stdout_is_tty: bool) -> OutputMode {
    if json_flag {
        return OutputMode::Json;
    }

    let fallback = if stdout_is_tty {
        OutputMode::Human
    } else {
        OutputMode::Json
    };

    match env_mode
        .map(str::trim)
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("json") => OutputMode::Json,
        Some("human") => OutputMode::Human,
        _ => fallback,
    }
}
