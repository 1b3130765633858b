//! Error types for the blue/green rollout pipeline.

use thiserror::Error;

/// Top-level error type for rollout operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The provisioning collaborator failed to create or update an environment.
    #[error("provisioning failed for {environment}: {reason}")]
    Provisioning { environment: String, reason: String },

    /// Health checks were exhausted without a successful probe.
    #[error("validation of {environment} timed out after {attempts} attempt(s)")]
    ValidationTimeout { environment: String, attempts: u32 },

    /// A promotion request was driven through a transition it does not allow.
    #[error("cannot {action} a promotion request in state '{from}'")]
    InvalidStateTransition { from: String, action: String },

    /// Cooperative cancellation was observed.
    #[error("cancellation requested")]
    CancellationRequested,

    /// Rollout configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Two descriptors in the same rollout share a name.
    #[error("duplicate environment name: {0}")]
    DuplicateEnvironment(String),

    /// A result was recorded twice for the same environment.
    #[error("result already recorded for environment: {0}")]
    DuplicateResult(String),

    /// Applying the traffic cut-over failed.
    #[error("traffic cut-over failed: {0}")]
    Cutover(String),

    /// Waiting for an operator decision timed out.
    #[error("promotion approval timed out after {0} seconds")]
    ApprovalTimeout(u64),

    /// HTTP client setup or request error.
    #[error("HTTP error: {0}")]
    Http(String),

    /// IO error while reading config or persisting state.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to serialize or deserialize state.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Result type alias for rollout operations.
pub type Result<T> = std::result::Result<T, Error>;
