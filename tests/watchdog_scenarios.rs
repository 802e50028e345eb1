//! Scenario and property tests for the watchdog state machine.
//!
//! Every collaborator is scripted: the supervisor and probe answer from
//! queues, the sleeper records durations instead of sleeping, and log entries
//! land in a [`MemorySink`].

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::time::Duration;

use proptest::prelude::*;

use homepi_watchdog::core::config::WatchdogConfig;
use homepi_watchdog::core::errors::{HpwError, Result};
use homepi_watchdog::daemon::clock::{Sleeper, Wake};
use homepi_watchdog::daemon::probe::HealthProbe;
use homepi_watchdog::daemon::supervisor::ProcessSupervisor;
use homepi_watchdog::daemon::watchdog::{
    CycleAction, HealthStatus, RetryState, ServiceStatus, Watchdog,
};
use homepi_watchdog::logger::sink::{EventKind, MemorySink, Severity};

// ──────────────────── fakes ────────────────────

/// `Some(state)` answers `is-active`; `None` makes the query itself fail.
type Answer = Option<bool>;

struct ScriptedSupervisor {
    answers: RefCell<VecDeque<Answer>>,
    fallback: Answer,
    restart_errors: RefCell<VecDeque<bool>>,
    restarts: Cell<u32>,
}

impl ScriptedSupervisor {
    fn new(answers: &[Answer], fallback: Answer) -> Self {
        Self {
            answers: RefCell::new(answers.iter().copied().collect()),
            fallback,
            restart_errors: RefCell::new(VecDeque::new()),
            restarts: Cell::new(0),
        }
    }

    fn always(active: bool) -> Self {
        Self::new(&[], Some(active))
    }

    fn failing_restarts(self, errors: &[bool]) -> Self {
        *self.restart_errors.borrow_mut() = errors.iter().copied().collect();
        self
    }

    fn peek(&self) -> Answer {
        self.answers.borrow().front().copied().unwrap_or(self.fallback)
    }
}

impl ProcessSupervisor for ScriptedSupervisor {
    fn is_active(&self, unit: &str) -> Result<bool> {
        let answer = self.answers.borrow_mut().pop_front().unwrap_or(self.fallback);
        answer.ok_or_else(|| HpwError::SupervisorQuery {
            unit: unit.to_string(),
            details: "Failed to connect to bus".to_string(),
        })
    }

    fn restart(&self, unit: &str) -> Result<()> {
        self.restarts.set(self.restarts.get() + 1);
        if self.restart_errors.borrow_mut().pop_front().unwrap_or(false) {
            return Err(HpwError::RestartInvocation {
                unit: unit.to_string(),
                details: "Job for homepi.service failed".to_string(),
            });
        }
        Ok(())
    }
}

struct ScriptedProbe {
    answers: RefCell<VecDeque<bool>>,
    fallback: bool,
    probes: Cell<u32>,
}

impl ScriptedProbe {
    fn new(answers: &[bool], fallback: bool) -> Self {
        Self {
            answers: RefCell::new(answers.iter().copied().collect()),
            fallback,
            probes: Cell::new(0),
        }
    }

    fn always(healthy: bool) -> Self {
        Self::new(&[], healthy)
    }
}

impl HealthProbe for ScriptedProbe {
    fn probe(&self, url: &str, timeout: Duration) -> Result<()> {
        self.probes.set(self.probes.get() + 1);
        if self.answers.borrow_mut().pop_front().unwrap_or(self.fallback) {
            Ok(())
        } else {
            Err(HpwError::HealthCheckTimeout {
                url: url.to_string(),
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            })
        }
    }
}

#[derive(Default)]
struct RecordingSleeper {
    sleeps: Vec<Duration>,
    settles: Vec<Duration>,
    /// Report a shutdown for any interruptible sleep of this length.
    interrupt_on: Option<Duration>,
}

impl Sleeper for RecordingSleeper {
    fn sleep(&mut self, duration: Duration) -> Wake {
        self.sleeps.push(duration);
        if self.interrupt_on == Some(duration) {
            Wake::Shutdown
        } else {
            Wake::Elapsed
        }
    }

    fn settle(&mut self, duration: Duration) {
        self.settles.push(duration);
    }
}

type TestWatchdog = Watchdog<ScriptedSupervisor, ScriptedProbe, RecordingSleeper, MemorySink>;

fn config(max_retries: u32) -> WatchdogConfig {
    WatchdogConfig {
        check_interval_seconds: 1,
        max_retries,
        restart_grace_seconds: 10,
        escalation_cooldown_seconds: 300,
        ..WatchdogConfig::default()
    }
}

fn watchdog(cfg: WatchdogConfig, sup: ScriptedSupervisor, probe: ScriptedProbe) -> TestWatchdog {
    Watchdog::new(cfg, sup, probe, RecordingSleeper::default(), MemorySink::new())
}

fn events(wd: &TestWatchdog) -> Vec<EventKind> {
    wd.sink().entries.iter().map(|e| e.event).collect()
}

fn count_events(wd: &TestWatchdog, kind: EventKind) -> usize {
    wd.sink().entries.iter().filter(|e| e.event == kind).count()
}

// ──────────────────── unhealthy path ────────────────────

#[test]
fn two_failed_restarts_then_escalation_and_cooldown() {
    let mut wd = watchdog(
        config(2),
        ScriptedSupervisor::always(true),
        ScriptedProbe::always(false),
    );
    let mut state = RetryState::new();

    assert_eq!(wd.wait_for_next_cycle(), Wake::Elapsed);
    let first = wd.step(state);
    assert_eq!(first.action, CycleAction::RestartedUnhealthy { succeeded: false });
    assert_eq!(first.state.count(), 1);
    state = first.state;

    assert_eq!(wd.wait_for_next_cycle(), Wake::Elapsed);
    let second = wd.step(state);
    assert_eq!(second.action, CycleAction::RestartedUnhealthy { succeeded: false });
    assert_eq!(second.state.count(), 2);
    state = second.state;

    assert_eq!(wd.wait_for_next_cycle(), Wake::Elapsed);
    let third = wd.step(state);
    assert_eq!(third.action, CycleAction::Escalated);
    assert_eq!(third.state.count(), 0);
    assert_eq!(third.health, Some(HealthStatus::Unhealthy));

    assert_eq!(wd.supervisor().restarts.get(), 2);
    assert_eq!(
        wd.sleeper().sleeps,
        vec![
            Duration::from_secs(1),
            Duration::from_secs(1),
            Duration::from_secs(1),
            Duration::from_secs(300),
        ]
    );
    assert_eq!(wd.sleeper().settles, vec![Duration::from_secs(10); 2]);

    let escalation = wd
        .sink()
        .entries
        .iter()
        .find(|e| e.event == EventKind::Escalation)
        .expect("escalation logged");
    assert_eq!(escalation.severity, Severity::Critical);
    assert!(escalation.message.contains("manual intervention needed"));
    assert_eq!(escalation.retry_count, Some(2));
    assert_eq!(count_events(&wd, EventKind::CooldownComplete), 1);
    assert_eq!(wd.stats().escalations, 1);
}

#[test]
fn retry_budget_is_fresh_after_escalation() {
    let mut wd = watchdog(
        config(1),
        ScriptedSupervisor::always(true),
        ScriptedProbe::always(false),
    );
    let actions: Vec<CycleAction> = (0..4)
        .scan(RetryState::new(), |state, _| {
            let report = wd.step(*state);
            *state = report.state;
            Some(report.action)
        })
        .collect();

    assert_eq!(
        actions,
        vec![
            CycleAction::RestartedUnhealthy { succeeded: false },
            CycleAction::Escalated,
            CycleAction::RestartedUnhealthy { succeeded: false },
            CycleAction::Escalated,
        ]
    );
}

#[test]
fn successful_restart_resets_counter_without_recovery_duplicate() {
    // Restart fixes it; the following healthy cycle must not log another recovery.
    let mut wd = watchdog(
        config(3),
        ScriptedSupervisor::always(true),
        ScriptedProbe::new(&[false, true, true], true),
    );

    let report = wd.step(RetryState::with_count(2, 3));
    assert_eq!(report.action, CycleAction::RestartedUnhealthy { succeeded: true });
    assert_eq!(report.state.count(), 0);

    let report = wd.step(report.state);
    assert_eq!(report.action, CycleAction::Healthy);
    assert_eq!(count_events(&wd, EventKind::RestartSucceeded), 1);
    assert_eq!(count_events(&wd, EventKind::ServiceRecovered), 0);
}

#[test]
fn zero_retries_escalates_every_unhealthy_check() {
    let mut wd = watchdog(
        config(0),
        ScriptedSupervisor::always(true),
        ScriptedProbe::always(false),
    );

    for _ in 0..3 {
        let report = wd.step(RetryState::new());
        assert_eq!(report.action, CycleAction::Escalated);
        assert_eq!(report.state.count(), 0);
    }
    assert_eq!(wd.supervisor().restarts.get(), 0);
    assert_eq!(wd.stats().escalations, 3);
}

#[test]
fn shutdown_during_cooldown_skips_completion_log() {
    let mut wd = watchdog(
        config(0),
        ScriptedSupervisor::always(true),
        ScriptedProbe::always(false),
    );
    wd.sleeper_mut().interrupt_on = Some(Duration::from_secs(300));

    let report = wd.step(RetryState::new());
    assert_eq!(report.action, CycleAction::Escalated);
    assert_eq!(count_events(&wd, EventKind::Escalation), 1);
    assert_eq!(count_events(&wd, EventKind::CooldownComplete), 0);
}

// ──────────────────── inactive path ────────────────────

#[test]
fn inactive_at_ceiling_restarts_immediately_and_resets() {
    // is-active: inactive, then active after the restart; probe healthy.
    let mut wd = watchdog(
        config(2),
        ScriptedSupervisor::new(&[Some(false), Some(true)], Some(true)),
        ScriptedProbe::always(true),
    );

    let report = wd.step(RetryState::with_count(2, 2));
    assert_eq!(report.action, CycleAction::RestartedInactive { succeeded: true });
    assert_eq!(report.state.count(), 0);
    assert_eq!(report.service, ServiceStatus::Inactive);
    assert_eq!(report.health, None);
    assert_eq!(wd.supervisor().restarts.get(), 1);
    // Only the post-restart probe ran; the inactive branch skips the health check.
    assert_eq!(wd.probe().probes.get(), 1);
    assert_eq!(
        events(&wd),
        vec![
            EventKind::ServiceInactive,
            EventKind::RestartAttempt,
            EventKind::RestartSucceeded,
        ]
    );
}

#[test]
fn inactive_failed_restart_still_resets_counter() {
    let mut wd = watchdog(
        config(3),
        ScriptedSupervisor::always(false),
        ScriptedProbe::always(false),
    );

    let report = wd.step(RetryState::with_count(1, 3));
    assert_eq!(report.action, CycleAction::RestartedInactive { succeeded: false });
    assert_eq!(report.state.count(), 0);
    assert_eq!(count_events(&wd, EventKind::RestartFailed), 1);
}

#[test]
fn supervisor_query_error_counts_as_inactive() {
    let mut wd = watchdog(
        config(3),
        ScriptedSupervisor::new(&[None], Some(true)),
        ScriptedProbe::always(true),
    );

    let report = wd.step(RetryState::new());
    assert_eq!(report.action, CycleAction::RestartedInactive { succeeded: true });
    assert_eq!(wd.stats().supervisor_query_errors, 1);

    let error = &wd.sink().entries[0];
    assert_eq!(error.event, EventKind::Error);
    assert_eq!(error.error_code.as_deref(), Some("HPW-2001"));
}

#[test]
fn restart_invocation_error_is_judged_by_recheck() {
    // systemctl restart exits non-zero, yet the unit comes back healthy.
    let mut wd = watchdog(
        config(3),
        ScriptedSupervisor::new(&[Some(false)], Some(true)).failing_restarts(&[true]),
        ScriptedProbe::always(true),
    );

    let report = wd.step(RetryState::new());
    assert_eq!(report.action, CycleAction::RestartedInactive { succeeded: true });
    assert!(
        wd.sink()
            .entries
            .iter()
            .any(|e| e.error_code.as_deref() == Some("HPW-2004"))
    );
    assert_eq!(wd.sleeper().settles, vec![Duration::from_secs(10)]);
}

// ──────────────────── recovery + monitor-only ────────────────────

#[test]
fn recovery_is_logged_once_after_degraded_cycles() {
    // Cycle 1: inactive, restart does not help. Cycles 2-3: healthy.
    let mut wd = watchdog(
        config(3),
        ScriptedSupervisor::new(&[Some(false), Some(false)], Some(true)),
        ScriptedProbe::new(&[false], true),
    );

    let mut state = RetryState::new();
    for _ in 0..3 {
        state = wd.step(state).state;
    }
    assert_eq!(count_events(&wd, EventKind::ServiceRecovered), 1);
    assert_eq!(wd.stats().healthy_cycles, 2);
}

#[test]
fn monitor_only_never_restarts_but_still_escalates() {
    let mut cfg = config(2);
    cfg.restart_enabled = false;
    let mut wd = watchdog(cfg, ScriptedSupervisor::always(true), ScriptedProbe::always(false));

    let mut state = RetryState::new();
    let mut actions = Vec::new();
    for _ in 0..3 {
        let report = wd.step(state);
        state = report.state;
        actions.push((report.action, report.state.count()));
    }

    assert_eq!(
        actions,
        vec![
            (CycleAction::RestartSkipped, 1),
            (CycleAction::RestartSkipped, 2),
            (CycleAction::Escalated, 0),
        ]
    );
    assert_eq!(wd.supervisor().restarts.get(), 0);
    assert!(wd.sleeper().settles.is_empty());
}

#[test]
fn monitor_only_inactive_is_skipped_and_reset() {
    let mut cfg = config(2);
    cfg.restart_enabled = false;
    let mut wd = watchdog(cfg, ScriptedSupervisor::always(false), ScriptedProbe::always(true));

    let report = wd.step(RetryState::with_count(1, 2));
    assert_eq!(report.action, CycleAction::RestartSkipped);
    assert_eq!(report.state.count(), 0);
    assert_eq!(wd.supervisor().restarts.get(), 0);
    assert_eq!(wd.stats().restarts_skipped, 1);
}

#[test]
fn reconfigure_clamps_counter_to_new_ceiling() {
    let mut wd = watchdog(
        config(5),
        ScriptedSupervisor::always(true),
        ScriptedProbe::always(false),
    );
    let state = wd.reconfigure(config(1), RetryState::with_count(4, 5));
    assert_eq!(state.count(), 1);

    let report = wd.step(state);
    assert_eq!(report.action, CycleAction::Escalated);
}

// ──────────────────── properties ────────────────────

fn answer_strategy() -> impl Strategy<Value = Answer> {
    prop_oneof![
        6 => Just(Some(true)),
        3 => Just(Some(false)),
        1 => Just(None),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn retry_count_stays_within_ceiling(
        max_retries in 0u32..5,
        restart_enabled in any::<bool>(),
        start in 0u32..8,
        supervisor_answers in prop::collection::vec(answer_strategy(), 0..80),
        probe_answers in prop::collection::vec(any::<bool>(), 0..80),
        cycles in 1usize..30,
    ) {
        let mut cfg = config(max_retries);
        cfg.restart_enabled = restart_enabled;
        let mut wd = watchdog(
            cfg,
            ScriptedSupervisor::new(&supervisor_answers, Some(true)),
            ScriptedProbe::new(&probe_answers, true),
        );

        let mut state = RetryState::with_count(start, max_retries);
        for _ in 0..cycles {
            let first_answer = wd.supervisor().peek();
            let before = state.count();
            let restarts_before = wd.supervisor().restarts.get();

            let report = wd.step(state);
            prop_assert!(report.state.count() <= max_retries);

            match first_answer {
                Some(true) => prop_assert_eq!(report.service, ServiceStatus::Active),
                Some(false) | None => {
                    // Dead unit: restart regardless of the counter, then reset.
                    prop_assert_eq!(report.service, ServiceStatus::Inactive);
                    prop_assert_eq!(report.state.count(), 0);
                    if restart_enabled {
                        prop_assert_eq!(wd.supervisor().restarts.get(), restarts_before + 1);
                    } else {
                        prop_assert_eq!(report.action, CycleAction::RestartSkipped);
                    }
                }
            }

            match report.action {
                CycleAction::Escalated => {
                    prop_assert_eq!(before, max_retries);
                    prop_assert_eq!(report.state.count(), 0);
                }
                CycleAction::RestartedUnhealthy { succeeded: true } | CycleAction::Healthy => {
                    prop_assert_eq!(report.state.count(), 0);
                }
                CycleAction::RestartedUnhealthy { succeeded: false } => {
                    prop_assert_eq!(report.state.count(), before + 1);
                }
                _ => {}
            }
            state = report.state;
        }
    }
}
