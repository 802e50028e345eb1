//! Daemon subsystem: the watchdog engine, its process/HTTP/sleep seams,
//! daemon orchestration, service integration, self-monitoring and host
//! resource warnings.

pub mod clock;
#[cfg(feature = "daemon")]
pub mod loop_main;
#[cfg(unix)]
pub mod pidfile;
pub mod probe;
pub mod resources;
pub mod self_monitor;
pub mod service;
#[cfg(feature = "daemon")]
pub mod signals;
pub mod supervisor;
pub mod watchdog;
