//! Health validation for deployed environments.
//!
//! The [`HealthValidator`] polls an endpoint with a bounded number of
//! attempts, waiting a fixed interval between failures. Network errors,
//! timeouts and non-2xx responses are all retryable and indistinguishable in
//! the loop; only the last failure is reported. Cancellation is checked
//! before each attempt and raced against every wait.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::environment::{Endpoint, EnvironmentDescriptor};
use crate::error::{Error, Result};

/// A single health probe attempt.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Probes `url` once, returning the HTTP status on success or a
    /// description of the failure.
    async fn probe(&self, url: &str) -> std::result::Result<u16, String>;
}

/// HTTP GET probe backed by `reqwest`.
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    /// Creates a probe whose requests time out after `request_timeout`.
    pub fn new(request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| Error::Http(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn probe(&self, url: &str) -> std::result::Result<u16, String> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| format!("request to {} failed: {}", url, e))?;

        let status = response.status();
        if status.is_success() {
            Ok(status.as_u16())
        } else {
            Err(format!("{} returned {}", url, status))
        }
    }
}

/// Outcome of validating one environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    /// Whether a probe succeeded.
    pub success: bool,
    /// Number of probes performed.
    pub attempts: u32,
    /// Last failure observed, if any.
    pub last_error: Option<String>,
    /// Whether polling stopped because cancellation was requested.
    #[serde(default)]
    pub cancelled: bool,
    /// Time spent validating.
    #[serde(default)]
    pub elapsed: Duration,
}

impl ValidationResult {
    fn succeeded(attempts: u32, elapsed: Duration) -> Self {
        Self {
            success: true,
            attempts,
            last_error: None,
            cancelled: false,
            elapsed,
        }
    }

    fn exhausted(attempts: u32, last_error: Option<String>, elapsed: Duration) -> Self {
        Self {
            success: false,
            attempts,
            last_error: Some(last_error.unwrap_or_else(|| "no probe succeeded".to_string())),
            cancelled: false,
            elapsed,
        }
    }

    fn interrupted(attempts: u32, last_error: Option<String>, elapsed: Duration) -> Self {
        Self {
            success: false,
            attempts,
            last_error,
            cancelled: true,
            elapsed,
        }
    }

    /// Result for an environment that never reached validation.
    pub fn not_attempted(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            attempts: 0,
            last_error: Some(reason.into()),
            cancelled: false,
            elapsed: Duration::ZERO,
        }
    }
}

/// Validates a provisioned environment.
///
/// This is the seam the wave orchestrator calls after provisioning.
#[async_trait]
pub trait EnvironmentValidator: Send + Sync {
    /// Validates `environment`, reachable at `endpoint`.
    async fn validate_environment(
        &self,
        environment: &EnvironmentDescriptor,
        endpoint: &Endpoint,
        cancel: &CancellationToken,
    ) -> ValidationResult;
}

/// Retry-until-timeout health validator.
#[derive(Clone)]
pub struct HealthValidator {
    probe: Arc<dyn HealthProbe>,
    max_attempts: u32,
    interval: Duration,
}

impl HealthValidator {
    /// Creates a validator performing up to `max_attempts` probes, `interval` apart.
    pub fn new(probe: Arc<dyn HealthProbe>, max_attempts: u32, interval: Duration) -> Result<Self> {
        if max_attempts == 0 {
            return Err(Error::Config("max_attempts must be at least 1".to_string()));
        }
        if interval.is_zero() {
            return Err(Error::Config("probe interval must be positive".to_string()));
        }
        Ok(Self {
            probe,
            max_attempts,
            interval,
        })
    }

    /// Returns the attempt bound.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Returns the wait between failed attempts.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Upper bound on the time spent waiting between attempts.
    pub fn budget(&self) -> Duration {
        self.interval * self.max_attempts
    }

    /// Polls `url` until a probe succeeds, attempts run out, or `cancel` fires.
    pub async fn validate(&self, url: &str, cancel: &CancellationToken) -> ValidationResult {
        let start = Instant::now();
        let mut last_error: Option<String> = None;

        for attempt in 1..=self.max_attempts {
            if cancel.is_cancelled() {
                tracing::info!(url = %url, attempts = attempt - 1, "validation cancelled");
                return ValidationResult::interrupted(attempt - 1, last_error, start.elapsed());
            }

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!(url = %url, attempt, "validation cancelled during probe");
                    return ValidationResult::interrupted(attempt - 1, last_error, start.elapsed());
                }
                outcome = self.probe.probe(url) => outcome,
            };

            match outcome {
                Ok(status) => {
                    tracing::info!(url = %url, attempt, status, "health check passed");
                    return ValidationResult::succeeded(attempt, start.elapsed());
                }
                Err(reason) => {
                    tracing::debug!(url = %url, attempt, error = %reason, "health check failed");
                    last_error = Some(if reason.is_empty() {
                        "probe failed".to_string()
                    } else {
                        reason
                    });
                }
            }

            if attempt < self.max_attempts {
                tracing::info!(
                    url = %url,
                    attempt,
                    max_attempts = self.max_attempts,
                    wait = ?self.interval,
                    "retrying health check"
                );
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        tracing::info!(url = %url, attempts = attempt, "validation cancelled while waiting");
                        return ValidationResult::interrupted(attempt, last_error, start.elapsed());
                    }
                    _ = tokio::time::sleep(self.interval) => {}
                }
            }
        }

        tracing::warn!(
            url = %url,
            attempts = self.max_attempts,
            error = ?last_error,
            "health checks exhausted"
        );
        ValidationResult::exhausted(self.max_attempts, last_error, start.elapsed())
    }
}

#[async_trait]
impl EnvironmentValidator for HealthValidator {
    async fn validate_environment(
        &self,
        environment: &EnvironmentDescriptor,
        endpoint: &Endpoint,
        cancel: &CancellationToken,
    ) -> ValidationResult {
        tracing::info!(
            environment = %environment.name(),
            url = %endpoint.url,
            max_attempts = self.max_attempts,
            "validating environment"
        );
        self.validate(&endpoint.url, cancel).await
    }
}
