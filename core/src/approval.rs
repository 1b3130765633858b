//! Operator approval for promotion requests.
//!
//! Decisions come from an [`ApprovalSource`]. The [`ApprovalPoller`] asks the
//! source with exponential backoff until a decision arrives, the timeout
//! elapses, or the rollout is cancelled.
//!
//! [`FileApprovalSource`] keeps requests and decisions in a state directory:
//! `<dir>/<id>.json` holds the published request and `<dir>/<id>.decision`
//! holds `approve` or `reject`, written by the `approve`/`reject` CLI
//! subcommands.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::backoff::ExponentialBackoff;
use crate::config::ApprovalConfig;
use crate::error::{Error, Result};
use crate::promotion::{PromotionRequest, PromotionState};

/// An operator's decision on a promotion request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Cut traffic over to the target.
    Approve,
    /// Abandon the promotion.
    Reject,
}

impl Decision {
    /// Returns the decision keyword.
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Approve => "approve",
            Decision::Reject => "reject",
        }
    }
}

impl FromStr for Decision {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "approve" | "approved" => Ok(Decision::Approve),
            "reject" | "rejected" => Ok(Decision::Reject),
            other => Err(Error::Config(format!("unknown decision '{}'", other))),
        }
    }
}

/// Source of operator decisions.
#[async_trait]
pub trait ApprovalSource: Send + Sync {
    /// Returns the decision for `request`, or `None` while undecided.
    async fn decision(&self, request: &PromotionRequest) -> Result<Option<Decision>>;

    /// Makes the current state of `request` visible to operators.
    async fn publish(&self, _request: &PromotionRequest) -> Result<()> {
        Ok(())
    }
}

/// Approves every request immediately.
pub struct AutoApprove;

#[async_trait]
impl ApprovalSource for AutoApprove {
    async fn decision(&self, request: &PromotionRequest) -> Result<Option<Decision>> {
        tracing::info!(request_id = %request.id(), "auto-approving promotion");
        Ok(Some(Decision::Approve))
    }
}

/// File-backed approval state.
#[derive(Debug, Clone)]
pub struct FileApprovalSource {
    dir: PathBuf,
}

impl FileApprovalSource {
    /// Creates a source rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Returns the state directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn request_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    fn decision_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.decision", id))
    }

    /// Writes the current state of `request` so operators can inspect it.
    pub fn store_request(&self, request: &PromotionRequest) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let json = serde_json::to_string_pretty(request)
            .map_err(|e| Error::Serialization(format!("failed to serialize request: {}", e)))?;
        std::fs::write(self.request_path(&request.id().to_string()), json)?;
        Ok(())
    }

    /// Loads a published request.
    pub fn load_request(&self, id: &str) -> Result<PromotionRequest> {
        let path = self.request_path(id);
        let contents = std::fs::read_to_string(&path).map_err(|e| {
            Error::Config(format!("no promotion request at {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&contents)
            .map_err(|e| Error::Serialization(format!("failed to parse {}: {}", path.display(), e)))
    }

    /// Reads the recorded decision for a request id.
    pub fn read_decision(&self, id: &str) -> Result<Option<Decision>> {
        match std::fs::read_to_string(self.decision_path(id)) {
            Ok(contents) => contents.parse().map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Records an operator decision for a pending request.
    ///
    /// Repeating the same decision is a no-op; contradicting an earlier
    /// decision, or deciding a request that is no longer pending, is an
    /// invalid state transition.
    pub fn record_decision(&self, id: &str, decision: Decision) -> Result<()> {
        let request = self.load_request(id)?;

        if let Some(existing) = self.read_decision(id)? {
            if existing == decision {
                return Ok(());
            }
            return Err(Error::InvalidStateTransition {
                from: match existing {
                    Decision::Approve => PromotionState::Approved.to_string(),
                    Decision::Reject => PromotionState::Rejected.to_string(),
                },
                action: decision.as_str().to_string(),
            });
        }

        let repeat = matches!(
            (request.state(), decision),
            (PromotionState::Applied, Decision::Approve)
                | (PromotionState::Approved, Decision::Approve)
                | (PromotionState::Rejected, Decision::Reject)
        );
        if request.state() != PromotionState::Pending && !repeat {
            return Err(Error::InvalidStateTransition {
                from: request.state().to_string(),
                action: decision.as_str().to_string(),
            });
        }

        std::fs::write(self.decision_path(id), decision.as_str())?;
        tracing::info!(request_id = %id, decision = decision.as_str(), "recorded decision");
        Ok(())
    }
}

#[async_trait]
impl ApprovalSource for FileApprovalSource {
    async fn decision(&self, request: &PromotionRequest) -> Result<Option<Decision>> {
        self.read_decision(&request.id().to_string())
    }

    async fn publish(&self, request: &PromotionRequest) -> Result<()> {
        self.store_request(request)
    }
}

/// Polls an approval source with exponential backoff.
pub struct ApprovalPoller {
    config: ApprovalConfig,
}

impl ApprovalPoller {
    /// Creates a poller with the given configuration.
    pub fn new(config: ApprovalConfig) -> Self {
        Self { config }
    }

    /// Creates a poller with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(ApprovalConfig::default())
    }

    /// Waits for a decision on `request`.
    pub async fn wait_for_decision(
        &self,
        source: &dyn ApprovalSource,
        request: &PromotionRequest,
        cancel: &CancellationToken,
    ) -> Result<Decision> {
        self.wait_with_intervals(
            source,
            request,
            cancel,
            self.config.poll_initial(),
            self.config.poll_max(),
            self.config.timeout(),
        )
        .await
    }

    async fn wait_with_intervals(
        &self,
        source: &dyn ApprovalSource,
        request: &PromotionRequest,
        cancel: &CancellationToken,
        initial: Duration,
        max: Duration,
        timeout: Duration,
    ) -> Result<Decision> {
        let start = Instant::now();
        let mut backoff = ExponentialBackoff::new(initial, max, self.config.poll_backoff);

        tracing::info!(
            request_id = %request.id(),
            target = %request.target().name(),
            "waiting for promotion decision"
        );

        loop {
            if cancel.is_cancelled() {
                return Err(Error::CancellationRequested);
            }

            // A source that cannot be read right now is asked again later.
            match source.decision(request).await {
                Ok(Some(decision)) => {
                    tracing::info!(
                        request_id = %request.id(),
                        decision = decision.as_str(),
                        waited = ?start.elapsed(),
                        "promotion decision received"
                    );
                    return Ok(decision);
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(
                        request_id = %request.id(),
                        error = %e,
                        "could not read promotion decision, will retry"
                    );
                }
            }

            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return Err(Error::ApprovalTimeout(timeout.as_secs()));
            }

            let wait = backoff.advance().min(timeout - elapsed);
            tracing::debug!(request_id = %request.id(), wait = ?wait, "no decision yet");
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::CancellationRequested),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::{EnvironmentDescriptor, Location};
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    /// Source that decides after a number of polls.
    struct DelayedSource {
        polls: AtomicU32,
        decide_after: u32,
        decision: Decision,
    }

    #[async_trait]
    impl ApprovalSource for DelayedSource {
        async fn decision(&self, _request: &PromotionRequest) -> Result<Option<Decision>> {
            let poll = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok((poll >= self.decide_after).then_some(self.decision))
        }
    }

    fn request() -> PromotionRequest {
        PromotionRequest::new(
            EnvironmentDescriptor::new("green", "1.21", Location::new("a", "r")).unwrap(),
        )
    }

    fn fast_poller() -> ApprovalPoller {
        ApprovalPoller::with_defaults()
    }

    #[test]
    fn decision_parses_keywords() {
        assert_eq!("approve\n".parse::<Decision>().unwrap(), Decision::Approve);
        assert_eq!("REJECTED".parse::<Decision>().unwrap(), Decision::Reject);
        assert!("maybe".parse::<Decision>().is_err());
    }

    #[tokio::test]
    async fn poller_returns_decision_after_several_polls() {
        let source = DelayedSource {
            polls: AtomicU32::new(0),
            decide_after: 3,
            decision: Decision::Reject,
        };
        let decision = fast_poller()
            .wait_with_intervals(
                &source,
                &request(),
                &CancellationToken::new(),
                Duration::from_millis(1),
                Duration::from_millis(4),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(decision, Decision::Reject);
        assert_eq!(source.polls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn poller_times_out() {
        let source = DelayedSource {
            polls: AtomicU32::new(0),
            decide_after: u32::MAX,
            decision: Decision::Approve,
        };
        let err = fast_poller()
            .wait_with_intervals(
                &source,
                &request(),
                &CancellationToken::new(),
                Duration::from_millis(5),
                Duration::from_millis(10),
                Duration::from_millis(30),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ApprovalTimeout(_)));
    }

    #[tokio::test]
    async fn poller_observes_cancellation() {
        let source = DelayedSource {
            polls: AtomicU32::new(0),
            decide_after: u32::MAX,
            decision: Decision::Approve,
        };
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = fast_poller()
            .wait_with_intervals(
                &source,
                &request(),
                &cancel,
                Duration::from_secs(10),
                Duration::from_secs(10),
                Duration::from_secs(60),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CancellationRequested));
    }

    #[tokio::test]
    async fn unreadable_decision_is_retried() {
        let dir = TempDir::new().unwrap();
        let source = FileApprovalSource::new(dir.path());
        let request = request();
        let id = request.id().to_string();
        source.store_request(&request).unwrap();
        std::fs::write(dir.path().join(format!("{}.decision", id)), "yes").unwrap();
        assert!(source.decision(&request).await.is_err());

        let fixer = {
            let path = dir.path().join(format!("{}.decision", id));
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                std::fs::write(path, "approve").unwrap();
            })
        };

        let decision = fast_poller()
            .wait_with_intervals(
                &source,
                &request,
                &CancellationToken::new(),
                Duration::from_millis(5),
                Duration::from_millis(5),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        fixer.await.unwrap();
        assert_eq!(decision, Decision::Approve);
    }

    #[tokio::test]
    async fn unreadable_decision_ends_in_timeout() {
        let dir = TempDir::new().unwrap();
        let source = FileApprovalSource::new(dir.path());
        let request = request();
        std::fs::write(dir.path().join(format!("{}.decision", request.id())), "yes").unwrap();

        let err = fast_poller()
            .wait_with_intervals(
                &source,
                &request,
                &CancellationToken::new(),
                Duration::from_millis(5),
                Duration::from_millis(5),
                Duration::from_millis(30),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ApprovalTimeout(_)));
    }

    #[tokio::test]
    async fn auto_approve_decides_immediately() {
        let decision = fast_poller()
            .wait_for_decision(&AutoApprove, &request(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(decision, Decision::Approve);
    }

    #[tokio::test]
    async fn file_source_round_trip() {
        let dir = TempDir::new().unwrap();
        let source = FileApprovalSource::new(dir.path());
        let request = request();
        let id = request.id().to_string();
        source.store_request(&request).unwrap();

        assert_eq!(source.decision(&request).await.unwrap(), None);

        source.record_decision(&id, Decision::Approve).unwrap();
        assert_eq!(
            source.decision(&request).await.unwrap(),
            Some(Decision::Approve)
        );

        // Same decision again is fine; the opposite one is not.
        source.record_decision(&id, Decision::Approve).unwrap();
        let err = source.record_decision(&id, Decision::Reject).unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition { .. }));
    }

    #[test]
    fn file_source_rejects_unknown_request() {
        let dir = TempDir::new().unwrap();
        let source = FileApprovalSource::new(dir.path());
        assert!(source.record_decision("missing", Decision::Approve).is_err());
    }
}
