//! Blue/green rollout pipeline
//!
//! This library rolls new environments out in waves, gates each environment on
//! repeated health probes and promotes a healthy environment to production
//! traffic only after an operator approves it.

pub mod approval;
pub mod backoff;
pub mod config;
pub mod cutover;
pub mod environment;
pub mod error;
pub mod health;
pub mod pipeline;
pub mod promotion;
pub mod provision;
pub mod report;
pub mod wave;

pub use error::{Error, Result};

pub use approval::{ApprovalPoller, ApprovalSource, AutoApprove, Decision, FileApprovalSource};
pub use config::{ConfigCheck, ConfigIssue, RolloutConfig, RolloutPlan, Validate};
pub use cutover::{ActiveEnvironment, FileTrafficSwitch};
pub use environment::{Endpoint, EnvironmentDescriptor, Location, RolloutWave, WavePolicy};
pub use health::{EnvironmentValidator, HealthProbe, HealthValidator, HttpProbe, ValidationResult};
pub use pipeline::{PromotionOutcome, RolloutPipeline, RolloutReport, RolloutStatus};
pub use promotion::{PromotionGate, PromotionRequest, PromotionState, TrafficSwitch};
pub use provision::{CommandProvisioner, EndpointTemplate, Provisioner, StaticProvisioner};
pub use report::render_markdown;
pub use wave::{EnvironmentResult, EnvironmentStatus, WaveOrchestrator, WaveReport, WaveStatus};
