//! HPW-prefixed error types with structured error codes.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Shared `Result` alias for the project.
pub type Result<T> = std::result::Result<T, HpwError>;

/// Top-level error type for the HomePi watchdog.
#[derive(Debug, Error)]
pub enum HpwError {
    #[error("[HPW-1001] invalid configuration: {details}")]
    InvalidConfig { details: String },

    #[error("[HPW-1002] missing configuration file: {path}")]
    MissingConfig { path: PathBuf },

    #[error("[HPW-1003] configuration parse failure in {context}: {details}")]
    ConfigParse {
        context: &'static str,
        details: String,
    },

    #[error("[HPW-2001] supervisor query failed for {unit}: {details}")]
    SupervisorQuery { unit: String, details: String },

    #[error("[HPW-2002] health check timed out after {timeout_ms}ms: {url}")]
    HealthCheckTimeout { url: String, timeout_ms: u64 },

    #[error("[HPW-2003] health check failed for {url}: {details}")]
    HealthCheck { url: String, details: String },

    #[error("[HPW-2004] restart invocation failed for {unit}: {details}")]
    RestartInvocation { unit: String, details: String },

    #[error("[HPW-2101] serialization failure in {context}: {details}")]
    Serialization {
        context: &'static str,
        details: String,
    },

    #[error("[HPW-2201] could not sample {resource} usage: {details}")]
    ResourceSample {
        resource: &'static str,
        details: String,
    },

    #[error("[HPW-3001] another watchdog instance holds {path}")]
    InstanceLocked { path: PathBuf },

    #[error("[HPW-3002] IO failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[HPW-3900] runtime failure: {details}")]
    Runtime { details: String },
}

impl HpwError {
    /// Stable machine-parseable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "HPW-1001",
            Self::MissingConfig { .. } => "HPW-1002",
            Self::ConfigParse { .. } => "HPW-1003",
            Self::SupervisorQuery { .. } => "HPW-2001",
            Self::HealthCheckTimeout { .. } => "HPW-2002",
            Self::HealthCheck { .. } => "HPW-2003",
            Self::RestartInvocation { .. } => "HPW-2004",
            Self::Serialization { .. } => "HPW-2101",
            Self::ResourceSample { .. } => "HPW-2201",
            Self::InstanceLocked { .. } => "HPW-3001",
            Self::Io { .. } => "HPW-3002",
            Self::Runtime { .. } => "HPW-3900",
        }
    }

    /// Convenience constructor for IO errors with a known path.
    #[must_use]
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}

impl From<serde_json::Error> for HpwError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization {
            context: "serde_json",
            details: value.to_string(),
        }
    }
}

impl From<toml::de::Error> for HpwError {
    fn from(value: toml::de::Error) -> Self {
        Self::ConfigParse {
            context: "toml",
            details: value.to_string(),
        }
    }
}
