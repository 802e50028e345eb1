//! Sleep abstraction for the watchdog loop.
//!
//! Every wait in the loop goes through [`Sleeper`], so tests can run whole
//! restart/escalation sequences without real time passing.

use std::time::Duration;
#[cfg(feature = "daemon")]
use std::{thread, time::Instant};

#[cfg(feature = "daemon")]
use crate::daemon::signals::{SignalHandler, WatchdogHeartbeat};

/// Why a sleep returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    /// The full duration elapsed.
    Elapsed,
    /// A shutdown was requested while waiting.
    Shutdown,
}

pub trait Sleeper {
    /// Wait up to `duration`, returning early if shutdown is requested.
    fn sleep(&mut self, duration: Duration) -> Wake;

    /// Wait the full `duration` regardless of shutdown requests.
    ///
    /// Used for the post-restart grace period: the watchdog never exits
    /// between a restart and its re-check.
    fn settle(&mut self, duration: Duration);
}

#[cfg(feature = "daemon")]
/// Production sleeper: sleeps in short ticks, polling the shutdown flag and
/// keeping the systemd watchdog fed.
pub struct SignalAwareSleeper {
    signals: SignalHandler,
    heartbeat: WatchdogHeartbeat,
    tick: Duration,
}

#[cfg(feature = "daemon")]
impl SignalAwareSleeper {
    pub fn new(signals: SignalHandler, heartbeat: WatchdogHeartbeat) -> Self {
        Self {
            signals,
            heartbeat,
            tick: Duration::from_millis(250),
        }
    }

    /// Override the polling granularity.
    #[must_use]
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick.max(Duration::from_millis(1));
        self
    }

    fn wait(&mut self, duration: Duration, interruptible: bool) -> Wake {
        // `None` means the duration is past what `Instant` can represent; the
        // wait then only ends on shutdown.
        let deadline = Instant::now().checked_add(duration);
        loop {
            if interruptible && self.signals.should_shutdown() {
                return Wake::Shutdown;
            }
            self.heartbeat.maybe_notify("watching");

            let remaining = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Wake::Elapsed;
                    }
                    deadline - now
                }
                None => self.tick,
            };
            thread::sleep(self.tick.min(remaining));
        }
    }
}

#[cfg(feature = "daemon")]
impl Sleeper for SignalAwareSleeper {
    fn sleep(&mut self, duration: Duration) -> Wake {
        self.wait(duration, true)
    }

    fn settle(&mut self, duration: Duration) {
        self.wait(duration, false);
    }
}
