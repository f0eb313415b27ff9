//! HTTP probe of the load balancer endpoint.

use reqwest::Client;
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::aws::ObservedState;
use crate::error::{DeployError, Result};

/// Default probe timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Default connection timeout in seconds.
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 5;

/// Result of one probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeResult {
    /// URL that was requested.
    pub url: String,
    /// Whether the response was a success.
    pub healthy: bool,
    /// HTTP status code, if a response arrived.
    pub status_code: Option<u16>,
    /// Response time in milliseconds.
    pub response_time_ms: Option<u64>,
    /// Error message, if any.
    pub error: Option<String>,
}

/// HTTP prober.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    /// HTTP client.
    client: Client,
}

impl HttpProbe {
    /// Creates a prober with default timeouts.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new() -> Result<Self> {
        Self::with_timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    /// Creates a prober with a request timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS))
            .build()
            .map_err(|e| DeployError::internal(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self { client })
    }

    /// Builds the probe URL for a load balancer.
    #[must_use]
    pub fn url_for(dns_name: &str, port: u16, path: &str) -> String {
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{path}")
        };
        if port == 80 {
            format!("http://{dns_name}{path}")
        } else {
            format!("http://{dns_name}:{port}{path}")
        }
    }

    /// Builds the probe URL from discovered resources.
    ///
    /// Needs the load balancer, a listener and the target group's health
    /// check path.
    #[must_use]
    pub fn url_for_observed(observed: &ObservedState) -> Option<String> {
        let lb = observed.load_balancer.as_ref()?;
        let listener = observed.listener.as_ref()?;
        let tg = observed.target_group.as_ref()?;
        Some(Self::url_for(&lb.dns_name, listener.port, &tg.health_check.path))
    }

    /// Requests `url` once.
    pub async fn check(&self, url: &str) -> ProbeResult {
        let start = Instant::now();

        match self.client.get(url).send().await {
            Ok(response) => {
                let status = response.status();
                let elapsed = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
                let healthy = status.is_success();

                if !healthy {
                    debug!("Probe {url} returned status {status}");
                }

                ProbeResult {
                    url: url.to_string(),
                    healthy,
                    status_code: Some(status.as_u16()),
                    response_time_ms: Some(elapsed),
                    error: (!healthy).then(|| format!("HTTP {status}")),
                }
            }
            Err(e) => {
                warn!("Probe failed for {url}: {e}");

                ProbeResult {
                    url: url.to_string(),
                    healthy: false,
                    status_code: None,
                    response_time_ms: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }
}
