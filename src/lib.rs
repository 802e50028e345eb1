#![forbid(unsafe_code)]

//! HomePi Watchdog (hpw): keeps the HomePi service running and responsive.
//!
//! Every poll cycle checks two things:
//! 1. **Liveness**: is the unit active according to systemd?
//! 2. **Health**: does its HTTP health endpoint answer 2xx in time?
//!
//! A dead unit is restarted immediately. A live but unhealthy one is restarted
//! a bounded number of times, then escalated (logged for manual intervention)
//! and left alone for a cooldown.
//!
//! # Library usage
//!
//! Use the [`prelude`] for convenient access to the most common types:
//!
//! ```rust,no_run
//! use homepi_watchdog::prelude::*;
//! ```
//!
//! Individual modules can also be imported directly:
//!
//! ```rust,no_run
//! use homepi_watchdog::core::config::Config;
//! use homepi_watchdog::daemon::watchdog::{RetryState, Watchdog};
//! ```

pub mod prelude;

pub mod core;
pub mod daemon;
pub mod logger;
