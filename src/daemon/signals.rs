//! Process signals and systemd notifications for the daemon.
//!
//! `signal-hook` flips atomic flags from the handler; nothing blocks on a
//! signal. [`SignalAwareSleeper`](crate::daemon::clock::SignalAwareSleeper)
//! reads the shutdown flag between its short sleep ticks and feeds
//! [`WatchdogHeartbeat`] on the same ticks, so both stay live during long
//! poll intervals. The reload flag is consumed once per cycle by the daemon.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use signal_hook::consts::{SIGINT, SIGTERM};

// ──────────────────── signal flags ────────────────────

/// Stop/reload requests, shareable across clones.
///
/// The flags carry no data of their own, so `Relaxed` loads are enough.
#[derive(Clone)]
pub struct SignalHandler {
    stop: Arc<AtomicBool>,
    reload: Arc<AtomicBool>,
}

impl SignalHandler {
    /// Flags wired to SIGTERM and SIGINT (stop) and SIGHUP (reload).
    ///
    /// A hook that fails to install leaves that signal at its default
    /// disposition; the failure goes to stderr.
    pub fn new() -> Self {
        let handler = Self::detached();
        handler.install_hooks();
        handler
    }

    /// Flags with no OS hooks. Only `request_*` changes them.
    pub fn detached() -> Self {
        Self {
            stop: Arc::new(AtomicBool::new(false)),
            reload: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Sticky: stays set once requested.
    pub fn should_shutdown(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    /// One-shot: reading it clears the request.
    pub fn should_reload(&self) -> bool {
        self.reload.swap(false, Ordering::Relaxed)
    }

    pub fn request_shutdown(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    pub fn request_reload(&self) {
        self.reload.store(true, Ordering::Relaxed);
    }

    fn install_hooks(&self) {
        let mut hooks = vec![("SIGTERM", SIGTERM, &self.stop), ("SIGINT", SIGINT, &self.stop)];
        #[cfg(unix)]
        hooks.push(("SIGHUP", signal_hook::consts::SIGHUP, &self.reload));

        for (name, signal, flag) in hooks {
            if let Err(e) = signal_hook::flag::register(signal, Arc::clone(flag)) {
                eprintln!("[HPW-SIGNAL] cannot hook {name}: {e}");
            }
        }
    }
}

impl Default for SignalHandler {
    fn default() -> Self {
        Self::new()
    }
}

// ──────────────────── systemd watchdog ────────────────────

/// Paces `WATCHDOG=1` pings at half the unit's `WatchdogSec`.
///
/// Called from every sleeper tick; most calls are no-ops.
pub struct WatchdogHeartbeat {
    /// `None` when the unit has no watchdog.
    period: Option<Duration>,
    last_beat: Instant,
}

impl WatchdogHeartbeat {
    /// `watchdog_sec` is the unit's full `WatchdogSec`; zero disables pings.
    pub fn new(watchdog_sec: u64) -> Self {
        Self {
            period: (watchdog_sec > 0).then(|| Duration::from_secs(watchdog_sec) / 2),
            last_beat: Instant::now(),
        }
    }

    pub fn disabled() -> Self {
        Self::new(0)
    }

    /// Ping systemd if a period has passed since the last ping.
    ///
    /// Returns whether a ping was due (and sent).
    pub fn maybe_notify(&mut self, status: &str) -> bool {
        let Some(period) = self.period else {
            return false;
        };
        if self.last_beat.elapsed() < period {
            return false;
        }
        self.last_beat = Instant::now();
        sd_notify(&format!("WATCHDOG=1\nSTATUS={status}\n"));
        true
    }

    pub fn is_enabled(&self) -> bool {
        self.period.is_some()
    }
}

// ──────────────────── sd_notify ────────────────────

/// `READY=1` for `Type=notify` units.
pub fn notify_ready(status: &str) {
    sd_notify(&format!("READY=1\nSTATUS={status}\n"));
}

pub fn notify_stopping() {
    sd_notify("STOPPING=1\n");
}

/// Send to `$NOTIFY_SOCKET`; silently skipped outside systemd.
fn sd_notify(msg: &str) {
    let Some(socket) = std::env::var_os("NOTIFY_SOCKET") else {
        return;
    };
    if let Some(socket) = socket.to_str() {
        let _ = send_notification(socket, msg);
    }
}

/// Deliver one datagram to `socket`. A leading `@` names a Linux abstract
/// socket.
#[cfg(target_os = "linux")]
fn send_notification(socket: &str, msg: &str) -> std::io::Result<()> {
    use std::os::linux::net::SocketAddrExt;
    use std::os::unix::net::{SocketAddr, UnixDatagram};

    if socket.is_empty() {
        return Ok(());
    }
    let addr = match socket.strip_prefix('@') {
        Some(name) => SocketAddr::from_abstract_name(name)?,
        None => SocketAddr::from_pathname(socket)?,
    };
    UnixDatagram::unbound()?.send_to_addr(msg.as_bytes(), &addr)?;
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn send_notification(_socket: &str, _msg: &str) -> std::io::Result<()> {
    Ok(())
}

// ──────────────────── tests ────────────────────
