//! The watchdog step: liveness + health checks, bounded restarts, escalation.
//!
//! One call to [`Watchdog::step`] is one poll cycle. The retry counter is
//! passed in and handed back in the [`CycleReport`], so callers (and tests)
//! always see the exact state transition a cycle produced.
//!
//! Inactive and unhealthy are handled on separate paths: a dead process is
//! always restarted, while a live-but-unhealthy one is restarted only while
//! retries remain, then escalated and left alone for a cooldown.

#![allow(missing_docs)]

use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::core::config::WatchdogConfig;
use crate::daemon::clock::{Sleeper, Wake};
use crate::daemon::probe::HealthProbe;
use crate::daemon::supervisor::ProcessSupervisor;
use crate::logger::sink::{EventKind, LogEntry, LogSink, Severity};

// ──────────────────── observations ────────────────────

/// Process-level liveness as reported by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Active,
    Inactive,
}

/// Application-level health as reported by the HTTP endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
        })
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
        })
    }
}

// ──────────────────── retry state ────────────────────

/// Consecutive failed restarts of an unhealthy service.
///
/// Every constructor and transition takes the ceiling, so the count can
/// never exceed `max_retries`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RetryState {
    retry_count: u32,
}

impl RetryState {
    #[must_use]
    pub const fn new() -> Self {
        Self { retry_count: 0 }
    }

    /// Start from an existing count, clamped to `max_retries`.
    #[must_use]
    pub fn with_count(retry_count: u32, max_retries: u32) -> Self {
        Self {
            retry_count: retry_count.min(max_retries),
        }
    }

    #[must_use]
    pub const fn count(self) -> u32 {
        self.retry_count
    }

    /// Whether another restart may be attempted before escalating.
    #[must_use]
    pub const fn can_retry(self, max_retries: u32) -> bool {
        self.retry_count < max_retries
    }

    #[must_use]
    pub fn record_failure(self, max_retries: u32) -> Self {
        Self::with_count(self.retry_count.saturating_add(1), max_retries)
    }

    #[must_use]
    pub fn clamp(self, max_retries: u32) -> Self {
        Self::with_count(self.retry_count, max_retries)
    }
}

// ──────────────────── cycle outcome ────────────────────

/// What a poll cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum CycleAction {
    /// Service active and healthy; nothing to do.
    Healthy,
    /// Service was not running and a restart was attempted.
    RestartedInactive { succeeded: bool },
    /// Service was running but failing its health check; a restart was attempted.
    RestartedUnhealthy { succeeded: bool },
    /// A restart was due but restarts are disabled.
    RestartSkipped,
    /// Retries exhausted; logged for manual intervention and cooled down.
    Escalated,
}

impl CycleAction {
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::RestartedInactive { succeeded: true } => "restarted_inactive",
            Self::RestartedInactive { succeeded: false } => "restart_inactive_failed",
            Self::RestartedUnhealthy { succeeded: true } => "restarted_unhealthy",
            Self::RestartedUnhealthy { succeeded: false } => "restart_unhealthy_failed",
            Self::RestartSkipped => "restart_skipped",
            Self::Escalated => "escalated",
        }
    }
}

/// Result of one [`Watchdog::step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    /// Retry state to feed into the next cycle.
    pub state: RetryState,
    pub action: CycleAction,
    pub service: ServiceStatus,
    /// `None` when the service was inactive and the endpoint was not probed.
    pub health: Option<HealthStatus>,
}

/// Post-restart observation that did not pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartFailure {
    pub service: ServiceStatus,
    pub health: HealthStatus,
}

impl fmt::Display for RestartFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "service {} and {} after restart", self.service, self.health)
    }
}

/// Cumulative counters since the watchdog started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchdogStats {
    pub cycles: u64,
    pub healthy_cycles: u64,
    pub restarts_attempted: u64,
    pub restarts_succeeded: u64,
    pub restarts_failed: u64,
    pub restarts_skipped: u64,
    pub escalations: u64,
    pub supervisor_query_errors: u64,
    pub health_check_failures: u64,
}

// ──────────────────── watchdog ────────────────────

/// Health-check-and-restart engine over injectable supervisor, probe,
/// sleeper and log sink.
pub struct Watchdog<S, P, Z, L> {
    config: WatchdogConfig,
    supervisor: S,
    probe: P,
    sleeper: Z,
    sink: L,
    /// Set once a cycle observed a failure; cleared on recovery.
    degraded: bool,
    stats: WatchdogStats,
}

impl<S, P, Z, L> Watchdog<S, P, Z, L>
where
    S: ProcessSupervisor,
    P: HealthProbe,
    Z: Sleeper,
    L: LogSink,
{
    pub fn new(config: WatchdogConfig, supervisor: S, probe: P, sleeper: Z, sink: L) -> Self {
        Self {
            config,
            supervisor,
            probe,
            sleeper,
            sink,
            degraded: false,
            stats: WatchdogStats::default(),
        }
    }

    pub fn config(&self) -> &WatchdogConfig {
        &self.config
    }

    pub fn stats(&self) -> WatchdogStats {
        self.stats
    }

    pub fn supervisor(&self) -> &S {
        &self.supervisor
    }

    pub fn supervisor_mut(&mut self) -> &mut S {
        &mut self.supervisor
    }

    pub fn probe(&self) -> &P {
        &self.probe
    }

    pub fn sleeper(&self) -> &Z {
        &self.sleeper
    }

    pub fn sleeper_mut(&mut self) -> &mut Z {
        &mut self.sleeper
    }

    pub fn sink(&self) -> &L {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut L {
        &mut self.sink
    }

    /// Append an entry to the watchdog log.
    pub fn record(&mut self, entry: LogEntry) {
        self.sink.record(entry);
    }

    pub fn flush_log(&mut self) {
        self.sink.flush();
    }

    /// Swap in new settings (SIGHUP). Returns `state` clamped to the new ceiling.
    pub fn reconfigure(&mut self, config: WatchdogConfig, state: RetryState) -> RetryState {
        self.config = config;
        state.clamp(self.config.max_retries)
    }

    /// Query the supervisor. A failed query is logged and counts as inactive.
    pub fn check_service_active(&mut self) -> ServiceStatus {
        match self.supervisor.is_active(&self.config.unit_name) {
            Ok(true) => ServiceStatus::Active,
            Ok(false) => ServiceStatus::Inactive,
            Err(e) => {
                self.stats.supervisor_query_errors += 1;
                let entry = LogEntry::new(
                    EventKind::Error,
                    Severity::Error,
                    format!("Error checking service status: {e}"),
                )
                .with_unit(&self.config.unit_name)
                .with_error(&e);
                self.sink.record(entry);
                ServiceStatus::Inactive
            }
        }
    }

    /// Probe the health endpoint. Any failure is logged and counts as unhealthy.
    pub fn check_health_endpoint(&mut self) -> HealthStatus {
        match self
            .probe
            .probe(&self.config.health_check_url, self.config.health_timeout())
        {
            Ok(()) => HealthStatus::Healthy,
            Err(e) => {
                self.stats.health_check_failures += 1;
                let entry = LogEntry::new(
                    EventKind::HealthCheckFailed,
                    Severity::Warning,
                    format!("App health check failed: {e}"),
                )
                .with_url(&self.config.health_check_url)
                .with_error(&e);
                self.sink.record(entry);
                HealthStatus::Unhealthy
            }
        }
    }

    /// Restart the unit, wait out the grace period, then re-check both
    /// liveness and health. Succeeds only if both pass.
    pub fn restart(&mut self) -> Result<(), RestartFailure> {
        self.restart_attempt(None)
    }

    /// Sleep until the next poll.
    pub fn wait_for_next_cycle(&mut self) -> Wake {
        self.sleeper.sleep(self.config.check_interval())
    }

    /// Run one poll cycle against `state`.
    pub fn step(&mut self, state: RetryState) -> CycleReport {
        self.stats.cycles += 1;

        match self.check_service_active() {
            ServiceStatus::Inactive => self.handle_inactive(),
            ServiceStatus::Active => match self.check_health_endpoint() {
                HealthStatus::Healthy => self.handle_healthy(),
                HealthStatus::Unhealthy => self.handle_unhealthy(state),
            },
        }
    }

    // ──────────────────── branches ────────────────────

    fn handle_healthy(&mut self) -> CycleReport {
        self.stats.healthy_cycles += 1;
        if self.degraded {
            self.degraded = false;
            let entry = LogEntry::new(
                EventKind::ServiceRecovered,
                Severity::Info,
                format!("Service {} is active and healthy again", self.config.unit_name),
            )
            .with_unit(&self.config.unit_name);
            self.sink.record(entry);
        }
        CycleReport {
            state: RetryState::new(),
            action: CycleAction::Healthy,
            service: ServiceStatus::Active,
            health: Some(HealthStatus::Healthy),
        }
    }

    /// Dead process: restart regardless of the retry counter, then reset it.
    fn handle_inactive(&mut self) -> CycleReport {
        self.degraded = true;
        let entry = LogEntry::new(
            EventKind::ServiceInactive,
            Severity::Error,
            format!("Service {} is not active", self.config.unit_name),
        )
        .with_unit(&self.config.unit_name);
        self.sink.record(entry);

        let action = if self.config.restart_enabled {
            let succeeded = self.restart_attempt(None).is_ok();
            CycleAction::RestartedInactive { succeeded }
        } else {
            self.skip_restart(None);
            CycleAction::RestartSkipped
        };

        CycleReport {
            state: RetryState::new(),
            action,
            service: ServiceStatus::Inactive,
            health: None,
        }
    }

    /// Live but unhealthy: bounded restarts, then escalation.
    fn handle_unhealthy(&mut self, state: RetryState) -> CycleReport {
        self.degraded = true;
        let max = self.config.max_retries;

        let (state, action) = if !state.can_retry(max) {
            self.escalate(state);
            (RetryState::new(), CycleAction::Escalated)
        } else if !self.config.restart_enabled {
            self.skip_restart(Some(state));
            (state.record_failure(max), CycleAction::RestartSkipped)
        } else {
            match self.restart_attempt(Some(state)) {
                Ok(()) => (
                    RetryState::new(),
                    CycleAction::RestartedUnhealthy { succeeded: true },
                ),
                Err(_) => (
                    state.record_failure(max),
                    CycleAction::RestartedUnhealthy { succeeded: false },
                ),
            }
        };

        CycleReport {
            state,
            action,
            service: ServiceStatus::Active,
            health: Some(HealthStatus::Unhealthy),
        }
    }

    // ──────────────────── actions ────────────────────

    fn restart_attempt(&mut self, state: Option<RetryState>) -> Result<(), RestartFailure> {
        let unit = self.config.unit_name.clone();
        let max = self.config.max_retries;
        let started = Instant::now();
        self.stats.restarts_attempted += 1;

        let message = match state {
            Some(s) => format!("Restarting {unit} (attempt {}/{max})", s.count() + 1),
            None => format!("Restarting {unit}..."),
        };
        let mut entry =
            LogEntry::new(EventKind::RestartAttempt, Severity::Info, message).with_unit(&unit);
        if let Some(s) = state {
            entry = entry.with_retries(s.count(), max);
        }
        self.sink.record(entry);

        // The outcome is judged by the re-check below, not by the exit status.
        if let Err(e) = self.supervisor.restart(&unit) {
            let entry = LogEntry::new(
                EventKind::Error,
                Severity::Error,
                format!("Error restarting service: {e}"),
            )
            .with_unit(&unit)
            .with_error(&e);
            self.sink.record(entry);
        }

        self.sleeper.settle(self.config.restart_grace());

        let service = self.check_service_active();
        let health = self.check_health_endpoint();
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        if service == ServiceStatus::Active && health == HealthStatus::Healthy {
            self.stats.restarts_succeeded += 1;
            self.degraded = false;
            let entry = LogEntry::new(
                EventKind::RestartSucceeded,
                Severity::Info,
                format!("Service {unit} restarted successfully"),
            )
            .with_unit(&unit)
            .with_duration_ms(duration_ms);
            self.sink.record(entry);
            Ok(())
        } else {
            self.stats.restarts_failed += 1;
            let failure = RestartFailure { service, health };
            let entry = LogEntry::new(
                EventKind::RestartFailed,
                Severity::Error,
                format!("Failed to restart {unit}: {failure}"),
            )
            .with_unit(&unit)
            .with_duration_ms(duration_ms);
            self.sink.record(entry);
            Err(failure)
        }
    }

    fn skip_restart(&mut self, state: Option<RetryState>) {
        self.stats.restarts_skipped += 1;
        let mut entry = LogEntry::new(
            EventKind::RestartSkipped,
            Severity::Warning,
            format!(
                "Restarts are disabled; not restarting {}",
                self.config.unit_name
            ),
        )
        .with_unit(&self.config.unit_name);
        if let Some(s) = state {
            entry = entry.with_retries(s.count(), self.config.max_retries);
        }
        self.sink.record(entry);
    }

    /// Log the escalation, then back off for the cooldown.
    ///
    /// The counter handed back by the caller is already zero while the
    /// cooldown runs, so polling resumes with a fresh retry budget.
    fn escalate(&mut self, state: RetryState) {
        self.stats.escalations += 1;
        let cooldown = self.config.escalation_cooldown();
        let entry = LogEntry::new(
            EventKind::Escalation,
            Severity::Critical,
            format!(
                "Service {} still unhealthy after {} restart attempts, manual intervention needed; pausing restarts for {}s",
                self.config.unit_name,
                state.count(),
                cooldown.as_secs()
            ),
        )
        .with_unit(&self.config.unit_name)
        .with_url(&self.config.health_check_url)
        .with_retries(state.count(), self.config.max_retries);
        self.sink.record(entry);

        if self.sleeper.sleep(cooldown) == Wake::Elapsed {
            let entry = LogEntry::new(
                EventKind::CooldownComplete,
                Severity::Info,
                "Escalation cooldown complete, resuming monitoring",
            )
            .with_unit(&self.config.unit_name);
            self.sink.record(entry);
        }
    }
}
