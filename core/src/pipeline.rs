//! RolloutPipeline: runs waves in order, then the promotion stage.
//!
//! A wave that does not succeed halts the pipeline; later waves are reported
//! as not started. Once every wave succeeds, a promotion request is opened
//! for the configured target, an operator decision is awaited (unless
//! approval is disabled) and the cut-over is applied on approval. The
//! environments that were not promoted are left running.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::approval::{ApprovalPoller, ApprovalSource, Decision};
use crate::config::RolloutPlan;
use crate::environment::EnvironmentDescriptor;
use crate::error::{Error, Result};
use crate::promotion::{PromotionGate, PromotionRequest};
use crate::wave::{WaveOrchestrator, WaveReport, WaveStatus};

/// Overall outcome of a rollout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutStatus {
    /// Every wave succeeded and the promotion (if any) was applied.
    Succeeded,
    /// A wave had at least one unhealthy environment.
    WaveFailed,
    /// The rollout was cancelled.
    Cancelled,
    /// The operator rejected the promotion.
    PromotionRejected,
    /// No decision arrived before the approval timeout.
    ApprovalTimedOut,
    /// The promotion was approved but the cut-over could not be applied.
    CutoverFailed,
    /// The promotion stage could not run to a decision, e.g. the request
    /// could not be published.
    PromotionFailed,
}

impl RolloutStatus {
    /// Whether the rollout should be treated as successful.
    pub fn is_success(&self) -> bool {
        *self == RolloutStatus::Succeeded
    }
}

/// Final state of the promotion stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromotionOutcome {
    /// The promotion request.
    pub request: PromotionRequest,
    /// Error that stopped the promotion, if any.
    pub error: Option<String>,
}

/// Everything that happened during a rollout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolloutReport {
    /// Unique identifier for this rollout.
    pub rollout_id: Uuid,
    /// Pipeline name.
    pub pipeline: String,
    /// Overall status.
    pub status: RolloutStatus,
    /// Wave reports in execution order, including skipped waves.
    pub waves: Vec<WaveReport>,
    /// Promotion stage, if it was reached.
    pub promotion: Option<PromotionOutcome>,
    /// Healthy environments that were not promoted and remain running.
    pub left_running: Vec<String>,
    /// Why the rollout stopped short, when that is not a promotion error.
    #[serde(default)]
    pub error: Option<String>,
    /// When the rollout started.
    pub started_at: DateTime<Utc>,
    /// When the rollout finished.
    pub finished_at: DateTime<Utc>,
}

impl RolloutReport {
    /// Total number of environment results across all waves.
    pub fn environment_count(&self) -> usize {
        self.waves.iter().map(|w| w.results.len()).sum()
    }

    /// Wall-clock duration of the rollout.
    pub fn duration(&self) -> Duration {
        (self.finished_at - self.started_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

/// Runs a resolved rollout plan.
pub struct RolloutPipeline {
    plan: RolloutPlan,
    orchestrator: WaveOrchestrator,
    gate: PromotionGate,
    approvals: Arc<dyn ApprovalSource>,
    poller: ApprovalPoller,
    cutover_retry_delay: Duration,
}

impl RolloutPipeline {
    /// Creates a pipeline from a plan and its collaborators.
    pub fn new(
        plan: RolloutPlan,
        orchestrator: WaveOrchestrator,
        gate: PromotionGate,
        approvals: Arc<dyn ApprovalSource>,
    ) -> Self {
        let poller = ApprovalPoller::new(plan.approval.clone());
        let cutover_retry_delay = plan.approval.poll_initial();
        Self {
            plan,
            orchestrator,
            gate,
            approvals,
            poller,
            cutover_retry_delay,
        }
    }

    /// Sets the delay between cut-over attempts.
    pub fn with_cutover_retry_delay(mut self, delay: Duration) -> Self {
        self.cutover_retry_delay = delay;
        self
    }

    /// Returns the plan being run.
    pub fn plan(&self) -> &RolloutPlan {
        &self.plan
    }

    /// Runs every wave and then the promotion stage.
    ///
    /// Always returns a report listing every environment, whatever happened
    /// during promotion.
    pub async fn run(&self, cancel: &CancellationToken) -> RolloutReport {
        let rollout_id = Uuid::new_v4();
        let started_at = Utc::now();
        let mut waves = Vec::with_capacity(self.plan.waves.len());
        let mut halted: Option<(RolloutStatus, String)> = None;

        tracing::info!(
            rollout_id = %rollout_id,
            pipeline = %self.plan.pipeline_name,
            waves = self.plan.waves.len(),
            "starting rollout"
        );

        for wave in &self.plan.waves {
            if let Some((_, reason)) = &halted {
                waves.push(WaveReport::not_started(wave, reason));
                continue;
            }

            let report = self.orchestrator.run_wave(wave, cancel).await;
            match report.status {
                WaveStatus::Succeeded => {}
                WaveStatus::Cancelled => {
                    halted = Some((
                        RolloutStatus::Cancelled,
                        format!("rollout cancelled during wave '{}'", wave.name()),
                    ));
                }
                WaveStatus::Failed | WaveStatus::NotStarted => {
                    tracing::warn!(
                        wave = %wave.name(),
                        unhealthy = ?report.unhealthy(),
                        "wave failed, halting pipeline"
                    );
                    halted = Some((
                        RolloutStatus::WaveFailed,
                        format!("wave '{}' failed", wave.name()),
                    ));
                }
            }
            waves.push(report);
        }

        let (status, promotion, error) = match halted {
            Some((status, reason)) => (status, None, Some(reason)),
            None => match &self.plan.promotion_target {
                Some(target) if !target_is_healthy(&waves, target) => {
                    let reason = format!("promotion target '{}' has no healthy result", target.name());
                    tracing::warn!(target = %target.name(), "{}", reason);
                    (RolloutStatus::PromotionFailed, None, Some(reason))
                }
                Some(target) => {
                    let (status, outcome) = self.promote(target, cancel).await;
                    (status, Some(outcome), None)
                }
                None => (RolloutStatus::Succeeded, None, None),
            },
        };

        let promoted = promotion
            .as_ref()
            .filter(|p| p.request.applied())
            .map(|p| p.request.target().name().to_string());
        let left_running = waves
            .iter()
            .flat_map(|w| w.ordered())
            .filter(|r| r.is_healthy() && Some(&r.environment) != promoted.as_ref())
            .map(|r| r.environment.clone())
            .collect();

        let report = RolloutReport {
            rollout_id,
            pipeline: self.plan.pipeline_name.clone(),
            status,
            waves,
            promotion,
            left_running,
            error,
            started_at,
            finished_at: Utc::now(),
        };

        tracing::info!(
            rollout_id = %rollout_id,
            status = ?report.status,
            environments = report.environment_count(),
            duration = ?report.duration(),
            "rollout finished"
        );
        report
    }

    async fn promote(
        &self,
        target: &EnvironmentDescriptor,
        cancel: &CancellationToken,
    ) -> (RolloutStatus, PromotionOutcome) {
        let mut request = self.gate.request_promotion(target);

        if let Err(e) = self.approvals.publish(&request).await {
            tracing::warn!(request_id = %request.id(), error = %e, "could not publish promotion request");
            return (
                RolloutStatus::PromotionFailed,
                PromotionOutcome {
                    request,
                    error: Some(e.to_string()),
                },
            );
        }

        let decision = if self.plan.require_approval {
            self.poller
                .wait_for_decision(self.approvals.as_ref(), &request, cancel)
                .await
        } else {
            Ok(Decision::Approve)
        };

        let (status, error) = match decision {
            Ok(Decision::Approve) => match self.apply(&mut request, cancel).await {
                Ok(()) => (RolloutStatus::Succeeded, None),
                Err(e @ Error::CancellationRequested) => (RolloutStatus::Cancelled, Some(e)),
                Err(e) => (RolloutStatus::CutoverFailed, Some(e)),
            },
            Ok(Decision::Reject) => match self.gate.reject(&mut request) {
                Ok(()) => (RolloutStatus::PromotionRejected, None),
                Err(e) => (RolloutStatus::PromotionFailed, Some(e)),
            },
            Err(e @ Error::CancellationRequested) => (RolloutStatus::Cancelled, Some(e)),
            Err(e @ Error::ApprovalTimeout(_)) => (RolloutStatus::ApprovalTimedOut, Some(e)),
            Err(e) => (RolloutStatus::PromotionFailed, Some(e)),
        };
        if let Some(e) = &error {
            tracing::warn!(
                request_id = %request.id(),
                state = %request.state(),
                error = %e,
                "promotion did not complete"
            );
        }
        let mut error = error.map(|e| e.to_string());

        // The gate outcome stands even if operators cannot see the final state.
        if let Err(e) = self.approvals.publish(&request).await {
            tracing::warn!(request_id = %request.id(), error = %e, "could not publish final promotion state");
            error.get_or_insert_with(|| format!("failed to publish final promotion state: {}", e));
        }

        (status, PromotionOutcome { request, error })
    }

    async fn apply(&self, request: &mut PromotionRequest, cancel: &CancellationToken) -> Result<()> {
        let mut attempt = 1;
        loop {
            if cancel.is_cancelled() {
                return Err(Error::CancellationRequested);
            }
            match self.gate.approve(request).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= self.plan.cutover_attempts => return Err(e),
                Err(e) => {
                    tracing::info!(
                        request_id = %request.id(),
                        attempt,
                        error = %e,
                        "cut-over failed, retrying"
                    );
                }
            }
            attempt += 1;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::CancellationRequested),
                _ = tokio::time::sleep(self.cutover_retry_delay) => {}
            }
        }
    }
}

fn target_is_healthy(waves: &[WaveReport], target: &EnvironmentDescriptor) -> bool {
    waves
        .iter()
        .find_map(|w| w.get(target.name()))
        .map(|r| r.is_healthy())
        .unwrap_or(false)
}
