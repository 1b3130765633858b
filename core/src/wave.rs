//! Wave orchestration.
//!
//! Each environment in a wave is provisioned and then validated. Under the
//! parallel policy every environment runs as its own task; results are
//! collected into a shared, write-once map keyed by environment name. The
//! wave only completes once every environment has a result, and a failing
//! environment never aborts its siblings.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::environment::{EnvironmentDescriptor, RolloutWave, WavePolicy};
use crate::error::{Error, Result};
use crate::health::{EnvironmentValidator, ValidationResult};
use crate::provision::Provisioner;

/// Final state of one environment within a wave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentStatus {
    /// Provisioned and passed its health check.
    Healthy,
    /// Provisioned but health checks were exhausted.
    ValidationTimeout,
    /// The provisioning collaborator failed.
    ProvisioningFailed,
    /// Cancellation was observed before the environment finished.
    CancellationRequested,
    /// The wave was never run because an earlier wave did not succeed.
    NotStarted,
}

impl EnvironmentStatus {
    /// Returns a short label for reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvironmentStatus::Healthy => "healthy",
            EnvironmentStatus::ValidationTimeout => "validation timeout",
            EnvironmentStatus::ProvisioningFailed => "provisioning failed",
            EnvironmentStatus::CancellationRequested => "cancelled",
            EnvironmentStatus::NotStarted => "not started",
        }
    }
}

/// Result recorded for one environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentResult {
    /// Environment name.
    pub environment: String,
    /// Environment version tag.
    pub version: String,
    /// Final status.
    pub status: EnvironmentStatus,
    /// Endpoint returned by provisioning, if it got that far.
    pub endpoint: Option<String>,
    /// Health validation outcome.
    pub validation: ValidationResult,
    /// Error message for failed environments.
    pub error: Option<String>,
}

impl EnvironmentResult {
    /// Result for an environment whose wave never ran.
    pub fn not_started(environment: &EnvironmentDescriptor, reason: &str) -> Self {
        Self {
            environment: environment.name().to_string(),
            version: environment.version().to_string(),
            status: EnvironmentStatus::NotStarted,
            endpoint: None,
            validation: ValidationResult::not_attempted(reason),
            error: None,
        }
    }

    fn cancelled(environment: &EnvironmentDescriptor, mut validation: ValidationResult) -> Self {
        validation.cancelled = true;
        Self {
            environment: environment.name().to_string(),
            version: environment.version().to_string(),
            status: EnvironmentStatus::CancellationRequested,
            endpoint: None,
            validation,
            error: Some(Error::CancellationRequested.to_string()),
        }
    }

    fn provisioning_failed(environment: &EnvironmentDescriptor, error: &Error) -> Self {
        Self {
            environment: environment.name().to_string(),
            version: environment.version().to_string(),
            status: EnvironmentStatus::ProvisioningFailed,
            endpoint: None,
            validation: ValidationResult::not_attempted("environment was not provisioned"),
            error: Some(error.to_string()),
        }
    }

    /// Whether the environment is healthy.
    pub fn is_healthy(&self) -> bool {
        self.status == EnvironmentStatus::Healthy
    }
}

/// Overall state of a wave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaveStatus {
    /// Every environment is healthy.
    Succeeded,
    /// At least one environment failed.
    Failed,
    /// The rollout was cancelled before every environment finished.
    Cancelled,
    /// The wave was skipped.
    NotStarted,
}

/// Results of running one wave.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaveReport {
    /// Wave name.
    pub wave: String,
    /// Overall status.
    pub status: WaveStatus,
    /// Environment names in declaration order.
    pub order: Vec<String>,
    /// Per-environment results keyed by name.
    pub results: BTreeMap<String, EnvironmentResult>,
    /// Time spent on the wave.
    pub duration: Duration,
}

impl WaveReport {
    /// Report for a wave that was never run.
    pub fn not_started(wave: &RolloutWave, reason: &str) -> Self {
        let results = wave
            .environments()
            .iter()
            .map(|e| (e.name().to_string(), EnvironmentResult::not_started(e, reason)))
            .collect();
        Self {
            wave: wave.name().to_string(),
            status: WaveStatus::NotStarted,
            order: wave.environments().iter().map(|e| e.name().to_string()).collect(),
            results,
            duration: Duration::ZERO,
        }
    }

    /// Whether every environment in the wave is healthy.
    pub fn succeeded(&self) -> bool {
        self.status == WaveStatus::Succeeded
    }

    /// Looks up the result for an environment.
    pub fn get(&self, environment: &str) -> Option<&EnvironmentResult> {
        self.results.get(environment)
    }

    /// Iterates results in declaration order.
    pub fn ordered(&self) -> impl Iterator<Item = &EnvironmentResult> {
        self.order.iter().filter_map(|name| self.results.get(name))
    }

    /// Names of environments that did not end healthy.
    pub fn unhealthy(&self) -> Vec<&str> {
        self.ordered()
            .filter(|r| !r.is_healthy())
            .map(|r| r.environment.as_str())
            .collect()
    }
}

/// Concurrent, write-once collection of environment results.
#[derive(Default)]
struct ResultSink {
    results: DashMap<String, EnvironmentResult>,
}

impl ResultSink {
    fn record(&self, result: EnvironmentResult) -> Result<()> {
        match self.results.entry(result.environment.clone()) {
            Entry::Occupied(entry) => Err(Error::DuplicateResult(entry.key().clone())),
            Entry::Vacant(entry) => {
                entry.insert(result);
                Ok(())
            }
        }
    }

    fn contains(&self, environment: &str) -> bool {
        self.results.contains_key(environment)
    }

    fn snapshot(&self) -> BTreeMap<String, EnvironmentResult> {
        self.results
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}

/// Provisions and validates the environments of a wave.
#[derive(Clone)]
pub struct WaveOrchestrator {
    provisioner: Arc<dyn Provisioner>,
    validator: Arc<dyn EnvironmentValidator>,
}

impl WaveOrchestrator {
    /// Creates an orchestrator from its two collaborators.
    pub fn new(provisioner: Arc<dyn Provisioner>, validator: Arc<dyn EnvironmentValidator>) -> Self {
        Self {
            provisioner,
            validator,
        }
    }

    /// Builds a wave from raw descriptors and runs it.
    ///
    /// Duplicate names are rejected before anything is provisioned.
    pub async fn run(
        &self,
        name: &str,
        policy: WavePolicy,
        environments: Vec<EnvironmentDescriptor>,
        cancel: &CancellationToken,
    ) -> Result<WaveReport> {
        let wave = RolloutWave::new(name, policy, environments)?;
        Ok(self.run_wave(&wave, cancel).await)
    }

    /// Runs every environment in `wave` and reports all of their results.
    pub async fn run_wave(&self, wave: &RolloutWave, cancel: &CancellationToken) -> WaveReport {
        let start = Instant::now();
        let sink = Arc::new(ResultSink::default());

        tracing::info!(
            wave = %wave.name(),
            policy = ?wave.policy(),
            environments = wave.environments().len(),
            "starting wave"
        );

        match wave.policy() {
            WavePolicy::Parallel => self.run_parallel(wave, &sink, cancel).await,
            WavePolicy::Sequential => self.run_sequential(wave, &sink, cancel).await,
        }

        // Every descriptor gets a result, even if its task died.
        for environment in wave.environments() {
            if sink.contains(environment.name()) {
                continue;
            }
            let result = if cancel.is_cancelled() {
                EnvironmentResult::cancelled(
                    environment,
                    ValidationResult::not_attempted("cancelled before completion"),
                )
            } else {
                EnvironmentResult::provisioning_failed(
                    environment,
                    &Error::Provisioning {
                        environment: environment.name().to_string(),
                        reason: "task ended without reporting a result".to_string(),
                    },
                )
            };
            if let Err(e) = sink.record(result) {
                tracing::warn!(error = %e, "failed to record fallback result");
            }
        }

        let results = sink.snapshot();
        let status = summarize(&results, cancel);
        let duration = start.elapsed();

        tracing::info!(
            wave = %wave.name(),
            status = ?status,
            duration = ?duration,
            "wave finished"
        );

        WaveReport {
            wave: wave.name().to_string(),
            status,
            order: wave.environments().iter().map(|e| e.name().to_string()).collect(),
            results,
            duration,
        }
    }

    async fn run_parallel(
        &self,
        wave: &RolloutWave,
        sink: &Arc<ResultSink>,
        cancel: &CancellationToken,
    ) {
        let mut join_set = JoinSet::new();
        for environment in wave.environments().iter().cloned() {
            let orchestrator = self.clone();
            let sink = Arc::clone(sink);
            let cancel = cancel.clone();
            join_set.spawn(async move {
                let result = orchestrator.run_environment(&environment, &cancel).await;
                if let Err(e) = sink.record(result) {
                    tracing::warn!(error = %e, "discarding duplicate result");
                }
            });
        }

        while let Some(joined) = join_set.join_next().await {
            if let Err(e) = joined {
                tracing::warn!(wave = %wave.name(), error = %e, "environment task failed");
            }
        }
    }

    async fn run_sequential(
        &self,
        wave: &RolloutWave,
        sink: &Arc<ResultSink>,
        cancel: &CancellationToken,
    ) {
        for environment in wave.environments() {
            let result = self.run_environment(environment, cancel).await;
            if let Err(e) = sink.record(result) {
                tracing::warn!(error = %e, "discarding duplicate result");
            }
        }
    }

    async fn run_environment(
        &self,
        environment: &EnvironmentDescriptor,
        cancel: &CancellationToken,
    ) -> EnvironmentResult {
        if cancel.is_cancelled() {
            return EnvironmentResult::cancelled(
                environment,
                ValidationResult::not_attempted("cancelled before provisioning"),
            );
        }

        let provisioned = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::info!(environment = %environment.name(), "cancelled during provisioning");
                return EnvironmentResult::cancelled(
                    environment,
                    ValidationResult::not_attempted("cancelled during provisioning"),
                );
            }
            provisioned = self.provisioner.provision(environment) => provisioned,
        };

        let endpoint = match provisioned {
            Ok(endpoint) => endpoint,
            Err(e) => {
                tracing::warn!(environment = %environment.name(), error = %e, "provisioning failed");
                return EnvironmentResult::provisioning_failed(environment, &e);
            }
        };

        let validation = self
            .validator
            .validate_environment(environment, &endpoint, cancel)
            .await;

        let (status, error) = if validation.success {
            (EnvironmentStatus::Healthy, None)
        } else if validation.cancelled {
            (
                EnvironmentStatus::CancellationRequested,
                Some(Error::CancellationRequested.to_string()),
            )
        } else {
            let error = Error::ValidationTimeout {
                environment: environment.name().to_string(),
                attempts: validation.attempts,
            };
            tracing::warn!(environment = %environment.name(), error = %error, "environment unhealthy");
            (EnvironmentStatus::ValidationTimeout, Some(error.to_string()))
        };

        EnvironmentResult {
            environment: environment.name().to_string(),
            version: environment.version().to_string(),
            status,
            endpoint: Some(endpoint.url),
            validation,
            error,
        }
    }
}

fn summarize(
    results: &BTreeMap<String, EnvironmentResult>,
    cancel: &CancellationToken,
) -> WaveStatus {
    if results.values().all(EnvironmentResult::is_healthy) {
        WaveStatus::Succeeded
    } else if cancel.is_cancelled()
        && results
            .values()
            .any(|r| r.status == EnvironmentStatus::CancellationRequested)
    {
        WaveStatus::Cancelled
    } else {
        WaveStatus::Failed
    }
}
