//! Process supervisor access: liveness query and restart for the monitored unit.
//!
//! The watchdog only needs two verbs from the init system, so they sit behind
//! [`ProcessSupervisor`]. Production drives `systemctl`; tests substitute fakes.

use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crate::core::config::WatchdogConfig;
use crate::core::errors::{HpwError, Result};

/// How often a running child is polled for exit.
const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Init-system operations used by the watchdog.
pub trait ProcessSupervisor {
    /// Whether `unit` is currently active. `Err` when the supervisor could not be asked.
    fn is_active(&self, unit: &str) -> Result<bool>;

    /// Ask the supervisor to restart `unit`. Success only means the request was accepted.
    fn restart(&self, unit: &str) -> Result<()>;
}

/// [`ProcessSupervisor`] backed by the `systemctl` command line.
#[derive(Debug, Clone)]
pub struct SystemctlSupervisor {
    program: PathBuf,
    user_scope: bool,
    command_timeout: Duration,
}

impl SystemctlSupervisor {
    #[must_use]
    pub fn new(program: impl Into<PathBuf>, user_scope: bool, command_timeout: Duration) -> Self {
        Self {
            program: program.into(),
            user_scope,
            command_timeout,
        }
    }

    #[must_use]
    pub fn from_config(cfg: &WatchdogConfig) -> Self {
        Self::new(
            cfg.systemctl_path.clone(),
            cfg.user_scope,
            cfg.command_timeout(),
        )
    }

    fn systemctl_args<'a>(&self, args: &[&'a str]) -> Vec<&'a str> {
        let mut cmd_args = Vec::with_capacity(args.len() + 1);
        if self.user_scope {
            cmd_args.push("--user");
        }
        cmd_args.extend_from_slice(args);
        cmd_args
    }

    fn run(&self, args: &[&str]) -> std::result::Result<CommandOutput, String> {
        let full_args = self.systemctl_args(args);
        let mut cmd = Command::new(&self.program);
        cmd.args(&full_args);
        run_with_timeout(&mut cmd, self.command_timeout).map_err(|details| {
            format!(
                "{} {}: {details}",
                self.program.display(),
                full_args.join(" ")
            )
        })
    }
}

impl ProcessSupervisor for SystemctlSupervisor {
    fn is_active(&self, unit: &str) -> Result<bool> {
        let output = self
            .run(&["is-active", unit])
            .map_err(|details| HpwError::SupervisorQuery {
                unit: unit.to_string(),
                details,
            })?;

        // is-active exits non-zero for every state but "active", so the
        // printed state is authoritative and the exit code is not.
        match output.stdout.trim() {
            "active" => Ok(true),
            "" => Err(HpwError::SupervisorQuery {
                unit: unit.to_string(),
                details: format!(
                    "no state reported (exit {}): {}",
                    exit_code(output.status),
                    output.stderr.trim()
                ),
            }),
            _ => Ok(false),
        }
    }

    fn restart(&self, unit: &str) -> Result<()> {
        let output = self
            .run(&["restart", unit])
            .map_err(|details| HpwError::RestartInvocation {
                unit: unit.to_string(),
                details,
            })?;
        if output.status.success() {
            Ok(())
        } else {
            Err(HpwError::RestartInvocation {
                unit: unit.to_string(),
                details: format!(
                    "exit {}: {}",
                    exit_code(output.status),
                    output.stderr.trim()
                ),
            })
        }
    }
}

/// Captured result of a finished child process.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

/// Run `cmd` to completion, killing it once `timeout` has elapsed.
///
/// Both pipes are drained on helper threads while the child runs, so a chatty
/// command cannot stall on a full pipe. The child is reaped on every path.
pub fn run_with_timeout(
    cmd: &mut Command,
    timeout: Duration,
) -> std::result::Result<CommandOutput, String> {
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| format!("spawn failed: {e}"))?;

    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    // An unrepresentable deadline means the command is never timed out.
    let deadline = Instant::now().checked_add(timeout);
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Ok(status),
            Ok(None) if deadline.is_some_and(|d| Instant::now() >= d) => {
                reap(&mut child);
                break Err(format!("timed out after {}s", timeout.as_secs_f32()));
            }
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(e) => {
                reap(&mut child);
                break Err(format!("wait failed: {e}"));
            }
        }
    };

    // On failure the reader threads are left to finish on their own: a
    // grandchild may still hold the pipes open.
    let status = status?;
    Ok(CommandOutput {
        status,
        stdout: join_drain(stdout),
        stderr: join_drain(stderr),
    })
}

fn reap(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<thread::JoinHandle<String>> {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            String::from_utf8_lossy(&buf).into_owned()
        })
    })
}

fn join_drain(handle: Option<thread::JoinHandle<String>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default()
}

fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    /// Write an executable `systemctl` stand-in whose body is `script`.
    fn fake_systemctl(dir: &Path, script: &str) -> PathBuf {
        let path = dir.join("systemctl");
        fs::write(&path, format!("#!/bin/sh\n{script}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn supervisor(program: PathBuf) -> SystemctlSupervisor {
        SystemctlSupervisor::new(program, false, Duration::from_secs(5))
    }

    #[test]
    fn active_state_reports_true() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(fake_systemctl(dir.path(), "echo active"));
        assert!(sup.is_active("homepi.service").unwrap());
    }

    #[test]
    fn inactive_and_failed_states_report_false() {
        let dir = tempfile::tempdir().unwrap();
        for state in ["inactive", "failed", "activating"] {
            let sup = supervisor(fake_systemctl(dir.path(), &format!("echo {state}; exit 3")));
            assert!(!sup.is_active("homepi.service").unwrap(), "state {state}");
        }
    }

    #[test]
    fn empty_output_is_query_error() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(fake_systemctl(
            dir.path(),
            "echo 'Failed to connect to bus' >&2; exit 1",
        ));
        let err = sup.is_active("homepi.service").unwrap_err();
        assert_eq!(err.code(), "HPW-2001");
        assert!(err.to_string().contains("Failed to connect to bus"));
    }

    #[test]
    fn missing_program_is_query_error() {
        let sup = supervisor(PathBuf::from("/nonexistent/hpw/systemctl"));
        let err = sup.is_active("homepi.service").unwrap_err();
        assert!(matches!(err, HpwError::SupervisorQuery { .. }));
    }

    #[test]
    fn slow_command_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let program = fake_systemctl(dir.path(), "exec sleep 10");
        let sup = SystemctlSupervisor::new(program, false, Duration::from_millis(200));

        let started = Instant::now();
        let err = sup.is_active("homepi.service").unwrap_err();
        assert!(err.to_string().contains("timed out"), "{err}");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn large_output_does_not_stall_the_child() {
        let dir = tempfile::tempdir().unwrap();
        // ~200 KiB on each pipe, well past the kernel pipe buffer.
        let program = fake_systemctl(
            dir.path(),
            "i=0; while [ $i -lt 4000 ]; do \
             echo 'xxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxxx'; \
             echo 'yyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyyy' >&2; \
             i=$((i+1)); done; exit 0",
        );

        let out = run_with_timeout(Command::new(&program).arg("status"), Duration::from_secs(20))
            .expect("chatty command must finish");
        assert!(out.status.success());
        assert_eq!(out.stdout.lines().count(), 4000);
        assert_eq!(out.stderr.lines().count(), 4000);
    }

    #[test]
    fn timed_out_child_is_reaped() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("pid");
        let program = fake_systemctl(
            dir.path(),
            &format!("echo $$ > {}\nexec sleep 10", pid_file.display()),
        );

        let err = run_with_timeout(&mut Command::new(&program), Duration::from_millis(200))
            .unwrap_err();
        assert!(err.contains("timed out"), "{err}");

        // A reaped child no longer has a /proc entry (a zombie would).
        let pid = fs::read_to_string(&pid_file).unwrap();
        assert!(!Path::new(&format!("/proc/{}", pid.trim())).exists());
    }

    #[test]
    fn unrepresentable_timeout_waits_for_exit() {
        let dir = tempfile::tempdir().unwrap();
        let program = fake_systemctl(dir.path(), "echo active");
        let out = run_with_timeout(&mut Command::new(&program), Duration::MAX).unwrap();
        assert_eq!(out.stdout.trim(), "active");
    }

    #[test]
    fn restart_success_and_failure() {
        let dir = tempfile::tempdir().unwrap();
        let ok = supervisor(fake_systemctl(dir.path(), "exit 0"));
        assert!(ok.restart("homepi.service").is_ok());

        let bad = supervisor(fake_systemctl(
            dir.path(),
            "echo 'Unit homepi.service not found.' >&2; exit 5",
        ));
        let err = bad.restart("homepi.service").unwrap_err();
        assert_eq!(err.code(), "HPW-2004");
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn user_scope_passes_user_flag_first() {
        let dir = tempfile::tempdir().unwrap();
        let args_file = dir.path().join("args.txt");
        let program = fake_systemctl(
            dir.path(),
            &format!("echo \"$@\" > {}\necho active", args_file.display()),
        );
        let sup = SystemctlSupervisor::new(program, true, Duration::from_secs(5));

        assert!(sup.is_active("homepi.service").unwrap());
        let args = fs::read_to_string(&args_file).unwrap();
        assert_eq!(args.trim(), "--user is-active homepi.service");
    }

    #[test]
    fn from_config_uses_configured_program() {
        let cfg = WatchdogConfig {
            systemctl_path: PathBuf::from("/opt/bin/systemctl"),
            user_scope: true,
            command_timeout_seconds: 7,
            ..WatchdogConfig::default()
        };
        let sup = SystemctlSupervisor::from_config(&cfg);
        assert_eq!(sup.program, PathBuf::from("/opt/bin/systemctl"));
        assert!(sup.user_scope);
        assert_eq!(sup.command_timeout, Duration::from_secs(7));
    }
}
