//! Convenience re-exports for library consumers.
//!
//! ```rust,no_run
//! use homepi_watchdog::prelude::*;
//! ```

// Core
pub use crate::core::config::{
    Config, LoggingConfig, PathsConfig, ResourcesConfig, WatchdogConfig,
};
pub use crate::core::errors::{HpwError, Result};

// Logging
pub use crate::logger::sink::{
    EventKind, LogEntry, LogFormat, LogSink, LogWriter, MemorySink, Severity,
};

// Watchdog engine
pub use crate::daemon::clock::{Sleeper, Wake};
pub use crate::daemon::probe::{HealthProbe, HttpHealthProbe};
pub use crate::daemon::resources::{ResourceMonitor, ResourceUsage};
pub use crate::daemon::supervisor::{ProcessSupervisor, SystemctlSupervisor};
pub use crate::daemon::watchdog::{
    CycleAction, CycleReport, HealthStatus, RestartFailure, RetryState, ServiceStatus, Watchdog,
    WatchdogStats,
};
