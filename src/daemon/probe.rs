//! HTTP health-endpoint probe with a bounded timeout.

use std::time::Duration;

use crate::core::errors::{HpwError, Result};

/// Application-level liveness check.
pub trait HealthProbe {
    /// `Ok(())` when `url` answered 2xx within `timeout`.
    fn probe(&self, url: &str, timeout: Duration) -> Result<()>;
}

/// [`HealthProbe`] issuing a blocking `GET` per check.
#[derive(Debug, Clone)]
pub struct HttpHealthProbe {
    http: reqwest::blocking::Client,
}

impl HttpHealthProbe {
    /// Build the HTTP client. Fails only if the TLS backend cannot initialize.
    pub fn new() -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .user_agent(concat!("hpw/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| HpwError::Runtime {
                details: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self { http })
    }
}

impl HealthProbe for HttpHealthProbe {
    fn probe(&self, url: &str, timeout: Duration) -> Result<()> {
        let resp = self
            .http
            .get(url)
            .timeout(timeout)
            .send()
            .map_err(|e| classify_transport_error(url, timeout, &e))?;

        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(HpwError::HealthCheck {
                url: url.to_string(),
                details: format!("HTTP {}", status.as_u16()),
            })
        }
    }
}

fn classify_transport_error(url: &str, timeout: Duration, e: &reqwest::Error) -> HpwError {
    if e.is_timeout() {
        HpwError::HealthCheckTimeout {
            url: url.to_string(),
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }
    } else {
        HpwError::HealthCheck {
            url: url.to_string(),
            details: e.to_string(),
        }
    }
}
