//! Promotion gate.
//!
//! A [`PromotionRequest`] moves through `pending → approved → applied` or
//! `pending → rejected`. Approving applies the traffic cut-over; if the
//! cut-over fails the request stays `approved` so approval can be retried.
//! Repeating the action that produced a terminal state is a no-op; any other
//! action on a non-pending request is an [`Error::InvalidStateTransition`].

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::environment::EnvironmentDescriptor;
use crate::error::{Error, Result};

/// Lifecycle state of a promotion request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromotionState {
    /// Waiting for an operator decision.
    Pending,
    /// Approved, cut-over not yet applied.
    Approved,
    /// Cut-over applied.
    Applied,
    /// Rejected by an operator.
    Rejected,
}

impl PromotionState {
    /// Returns whether no further transition is allowed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, PromotionState::Applied | PromotionState::Rejected)
    }

    /// Returns the lowercase state name.
    pub fn as_str(&self) -> &'static str {
        match self {
            PromotionState::Pending => "pending",
            PromotionState::Approved => "approved",
            PromotionState::Applied => "applied",
            PromotionState::Rejected => "rejected",
        }
    }
}

impl fmt::Display for PromotionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request to move production traffic to an environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromotionRequest {
    id: Uuid,
    target: EnvironmentDescriptor,
    state: PromotionState,
    created_at: DateTime<Utc>,
    decided_at: Option<DateTime<Utc>>,
    applied_at: Option<DateTime<Utc>>,
    cutover_attempts: u32,
    last_error: Option<String>,
}

impl PromotionRequest {
    /// Creates a pending request for `target`.
    pub fn new(target: EnvironmentDescriptor) -> Self {
        Self {
            id: Uuid::new_v4(),
            target,
            state: PromotionState::Pending,
            created_at: Utc::now(),
            decided_at: None,
            applied_at: None,
            cutover_attempts: 0,
            last_error: None,
        }
    }

    /// Returns the request identifier.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Returns the environment to promote.
    pub fn target(&self) -> &EnvironmentDescriptor {
        &self.target
    }

    /// Returns the current state.
    pub fn state(&self) -> PromotionState {
        self.state
    }

    /// Whether an operator approved the request.
    pub fn approved(&self) -> bool {
        matches!(self.state, PromotionState::Approved | PromotionState::Applied)
    }

    /// Whether the cut-over has been applied.
    pub fn applied(&self) -> bool {
        self.state == PromotionState::Applied
    }

    /// Number of cut-over attempts made.
    pub fn cutover_attempts(&self) -> u32 {
        self.cutover_attempts
    }

    /// Last cut-over failure, if any.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// When the request was created.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// When the operator decided.
    pub fn decided_at(&self) -> Option<DateTime<Utc>> {
        self.decided_at
    }

    /// When the cut-over was applied.
    pub fn applied_at(&self) -> Option<DateTime<Utc>> {
        self.applied_at
    }

    fn invalid(&self, action: &str) -> Error {
        Error::InvalidStateTransition {
            from: self.state.to_string(),
            action: action.to_string(),
        }
    }
}

/// Redirects production traffic to an environment.
#[async_trait]
pub trait TrafficSwitch: Send + Sync {
    /// Points production traffic at `target`.
    async fn cut_over(&self, target: &EnvironmentDescriptor) -> Result<()>;
}

/// Applies operator decisions to promotion requests.
#[derive(Clone)]
pub struct PromotionGate {
    switch: Arc<dyn TrafficSwitch>,
}

impl PromotionGate {
    /// Creates a gate that cuts over through `switch`.
    pub fn new(switch: Arc<dyn TrafficSwitch>) -> Self {
        Self { switch }
    }

    /// Opens a pending promotion request for `target`.
    pub fn request_promotion(&self, target: &EnvironmentDescriptor) -> PromotionRequest {
        let request = PromotionRequest::new(target.clone());
        tracing::info!(
            request_id = %request.id,
            target = %target.name(),
            "promotion requested"
        );
        request
    }

    /// Approves the request and applies the cut-over.
    ///
    /// Approving an already applied request does nothing. Approving a request
    /// whose earlier cut-over failed retries the cut-over.
    pub async fn approve(&self, request: &mut PromotionRequest) -> Result<()> {
        match request.state {
            PromotionState::Pending => {
                request.state = PromotionState::Approved;
                request.decided_at = Some(Utc::now());
                tracing::info!(request_id = %request.id, target = %request.target.name(), "promotion approved");
            }
            PromotionState::Approved => {
                tracing::info!(
                    request_id = %request.id,
                    attempts = request.cutover_attempts,
                    "retrying cut-over"
                );
            }
            PromotionState::Applied => {
                tracing::debug!(request_id = %request.id, "promotion already applied");
                return Ok(());
            }
            PromotionState::Rejected => return Err(request.invalid("approve")),
        }

        request.cutover_attempts += 1;
        match self.switch.cut_over(&request.target).await {
            Ok(()) => {
                request.state = PromotionState::Applied;
                request.applied_at = Some(Utc::now());
                request.last_error = None;
                tracing::info!(
                    request_id = %request.id,
                    target = %request.target.name(),
                    "cut-over applied"
                );
                Ok(())
            }
            Err(e) => {
                tracing::warn!(request_id = %request.id, error = %e, "cut-over failed");
                request.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// Rejects a pending request.
    pub fn reject(&self, request: &mut PromotionRequest) -> Result<()> {
        match request.state {
            PromotionState::Pending => {
                request.state = PromotionState::Rejected;
                request.decided_at = Some(Utc::now());
                tracing::info!(request_id = %request.id, target = %request.target.name(), "promotion rejected");
                Ok(())
            }
            PromotionState::Rejected => Ok(()),
            PromotionState::Approved | PromotionState::Applied => Err(request.invalid("reject")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::Location;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Switch that fails the first `failures` calls.
    struct CountingSwitch {
        calls: AtomicU32,
        failures: u32,
    }

    impl CountingSwitch {
        fn new(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                failures,
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TrafficSwitch for CountingSwitch {
        async fn cut_over(&self, _target: &EnvironmentDescriptor) -> Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(Error::Cutover("dns update throttled".to_string()))
            } else {
                Ok(())
            }
        }
    }

    fn green() -> EnvironmentDescriptor {
        EnvironmentDescriptor::new("green", "1.21", Location::new("acct", "us-west-2")).unwrap()
    }

    #[tokio::test]
    async fn approve_applies_cutover() {
        let switch = CountingSwitch::new(0);
        let gate = PromotionGate::new(switch.clone());
        let mut request = gate.request_promotion(&green());
        assert_eq!(request.state(), PromotionState::Pending);
        assert!(!request.approved());

        gate.approve(&mut request).await.unwrap();

        assert_eq!(request.state(), PromotionState::Applied);
        assert!(request.approved());
        assert!(request.applied_at().is_some());
        assert_eq!(switch.calls(), 1);
    }

    #[tokio::test]
    async fn second_approve_is_a_no_op() {
        let switch = CountingSwitch::new(0);
        let gate = PromotionGate::new(switch.clone());
        let mut request = gate.request_promotion(&green());

        gate.approve(&mut request).await.unwrap();
        gate.approve(&mut request).await.unwrap();

        assert_eq!(request.state(), PromotionState::Applied);
        assert_eq!(switch.calls(), 1);
    }

    #[tokio::test]
    async fn failed_cutover_stays_approved_and_can_retry() {
        let switch = CountingSwitch::new(1);
        let gate = PromotionGate::new(switch.clone());
        let mut request = gate.request_promotion(&green());

        let err = gate.approve(&mut request).await.unwrap_err();
        assert!(matches!(err, Error::Cutover(_)));
        assert_eq!(request.state(), PromotionState::Approved);
        assert!(!request.applied());
        assert_eq!(request.last_error(), Some("traffic cut-over failed: dns update throttled"));

        gate.approve(&mut request).await.unwrap();
        assert_eq!(request.state(), PromotionState::Applied);
        assert_eq!(request.cutover_attempts(), 2);
        assert!(request.last_error().is_none());
    }

    #[tokio::test]
    async fn approve_after_reject_is_invalid() {
        let switch = CountingSwitch::new(0);
        let gate = PromotionGate::new(switch.clone());
        let mut request = gate.request_promotion(&green());

        gate.reject(&mut request).unwrap();
        assert_eq!(request.state(), PromotionState::Rejected);

        let err = gate.approve(&mut request).await.unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidStateTransition { ref from, ref action } if from == "rejected" && action == "approve"
        ));
        assert_eq!(switch.calls(), 0);
    }

    #[tokio::test]
    async fn reject_after_approve_is_invalid() {
        let gate = PromotionGate::new(CountingSwitch::new(0));
        let mut request = gate.request_promotion(&green());
        gate.approve(&mut request).await.unwrap();

        let err = gate.reject(&mut request).unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition { .. }));
        assert_eq!(request.state(), PromotionState::Applied);
    }

    #[tokio::test]
    async fn reject_while_cutover_pending_is_invalid() {
        let gate = PromotionGate::new(CountingSwitch::new(5));
        let mut request = gate.request_promotion(&green());
        assert!(gate.approve(&mut request).await.is_err());

        assert!(matches!(
            gate.reject(&mut request),
            Err(Error::InvalidStateTransition { .. })
        ));
    }

    #[test]
    fn second_reject_is_a_no_op() {
        let gate = PromotionGate::new(CountingSwitch::new(0));
        let mut request = gate.request_promotion(&green());
        gate.reject(&mut request).unwrap();
        let decided = request.decided_at();
        gate.reject(&mut request).unwrap();
        assert_eq!(request.decided_at(), decided);
    }

    #[test]
    fn terminal_states() {
        assert!(!PromotionState::Pending.is_terminal());
        assert!(!PromotionState::Approved.is_terminal());
        assert!(PromotionState::Applied.is_terminal());
        assert!(PromotionState::Rejected.is_terminal());
    }

    #[test]
    fn request_round_trips_through_json() {
        let request = PromotionRequest::new(green());
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("\"pending\""));
        let parsed: PromotionRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id(), request.id());
        assert_eq!(parsed.target().name(), "green");
    }
}
