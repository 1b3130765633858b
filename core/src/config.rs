//! Rollout configuration.
//!
//! Configuration is static: waves, validation parameters and the promotion
//! target are read from a TOML or YAML file and resolved eagerly into a
//! [`RolloutPlan`] before anything is provisioned. Missing accounts and
//! regions fall back to the `[location]` section and then to the
//! `ROLLOUT_ACCOUNT` / `ROLLOUT_REGION` environment variables.

use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::environment::{EnvironmentDescriptor, Location, RolloutWave, WavePolicy};
use crate::error::{Error, Result};
use crate::provision::EndpointTemplate;

/// Environment variable supplying the default account.
pub const ACCOUNT_ENV: &str = "ROLLOUT_ACCOUNT";

/// Environment variable supplying the default region.
pub const REGION_ENV: &str = "ROLLOUT_REGION";

/// Default account and region for environments that do not set their own.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocationConfig {
    /// Default account.
    #[serde(default)]
    pub account: Option<String>,
    /// Default region.
    #[serde(default)]
    pub region: Option<String>,
}

/// Health validation parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Maximum probes per environment.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Seconds to wait between failed probes.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Per-request timeout in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_max_attempts() -> u32 {
    12
}

fn default_interval_secs() -> u64 {
    10
}

fn default_request_timeout_secs() -> u64 {
    5
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            interval_secs: default_interval_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl ValidationConfig {
    /// Returns the wait between failed probes.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Returns the per-request timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Upper bound on the time one environment spends being validated.
    pub fn budget(&self) -> Duration {
        self.interval().saturating_mul(self.max_attempts)
    }
}

/// One environment as written in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    /// Environment name, e.g. `blue`.
    pub name: String,
    /// Version tag, e.g. a Kubernetes version.
    pub version: String,
    /// Account override.
    #[serde(default)]
    pub account: Option<String>,
    /// Region override.
    #[serde(default)]
    pub region: Option<String>,
    /// Explicit probe URL.
    #[serde(default)]
    pub endpoint: Option<String>,
}

/// One wave as written in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaveConfig {
    /// Wave name.
    pub name: String,
    /// Scheduling policy.
    #[serde(default)]
    pub policy: WavePolicy,
    /// Environments in the wave.
    #[serde(default)]
    pub environments: Vec<EnvironmentConfig>,
}

/// Promotion stage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromotionConfig {
    /// Environment to promote once every wave succeeds.
    #[serde(default)]
    pub target: Option<String>,
    /// Whether an operator must approve the cut-over.
    #[serde(default = "default_require_approval")]
    pub require_approval: bool,
    /// Cut-over attempts before the promotion is left approved but unapplied.
    #[serde(default = "default_cutover_attempts")]
    pub cutover_attempts: u32,
    /// Approval polling configuration.
    #[serde(default)]
    pub approval: ApprovalConfig,
}

fn default_require_approval() -> bool {
    true
}

fn default_cutover_attempts() -> u32 {
    3
}

impl Default for PromotionConfig {
    fn default() -> Self {
        Self {
            target: None,
            require_approval: default_require_approval(),
            cutover_attempts: default_cutover_attempts(),
            approval: ApprovalConfig::default(),
        }
    }
}

/// Configuration for approval polling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalConfig {
    /// Initial poll interval in seconds.
    #[serde(default = "default_poll_initial_secs")]
    pub poll_initial_secs: u64,
    /// Maximum poll interval in seconds.
    #[serde(default = "default_poll_max_secs")]
    pub poll_max_secs: u64,
    /// Exponential backoff multiplier.
    #[serde(default = "default_poll_backoff")]
    pub poll_backoff: f64,
    /// How long to wait for a decision, in seconds.
    #[serde(default = "default_approval_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_poll_initial_secs() -> u64 {
    5
}

fn default_poll_max_secs() -> u64 {
    60
}

fn default_poll_backoff() -> f64 {
    2.0
}

fn default_approval_timeout_secs() -> u64 {
    86_400 // 24 hours
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            poll_initial_secs: default_poll_initial_secs(),
            poll_max_secs: default_poll_max_secs(),
            poll_backoff: default_poll_backoff(),
            timeout_secs: default_approval_timeout_secs(),
        }
    }
}

impl ApprovalConfig {
    /// Returns the initial poll interval.
    pub fn poll_initial(&self) -> Duration {
        Duration::from_secs(self.poll_initial_secs)
    }

    /// Returns the maximum poll interval.
    pub fn poll_max(&self) -> Duration {
        Duration::from_secs(self.poll_max_secs)
    }

    /// Returns the decision timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Provisioning collaborator configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvisionerConfig {
    /// Shell command run once per environment. Without one, environments
    /// are assumed to exist already.
    #[serde(default)]
    pub command: Option<String>,
}

/// Top-level rollout configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolloutConfig {
    /// Pipeline name used in reports.
    #[serde(default = "default_pipeline_name")]
    pub pipeline_name: String,
    /// DNS zone the environments are published under.
    pub domain: String,
    /// Prefix for cluster names.
    #[serde(default = "default_cluster_prefix")]
    pub cluster_prefix: String,
    /// Host label of the workload probed in each environment.
    #[serde(default = "default_probe_host")]
    pub probe_host: String,
    /// Scheme used for probe URLs.
    #[serde(default = "default_probe_scheme")]
    pub probe_scheme: String,
    /// Default location.
    #[serde(default)]
    pub location: LocationConfig,
    /// Health validation parameters.
    #[serde(default)]
    pub validation: ValidationConfig,
    /// Ordered waves.
    #[serde(default)]
    pub waves: Vec<WaveConfig>,
    /// Promotion stage.
    #[serde(default)]
    pub promotion: PromotionConfig,
    /// Provisioning collaborator.
    #[serde(default)]
    pub provisioner: ProvisionerConfig,
}

fn default_pipeline_name() -> String {
    "EKSClusterBlueGreen".to_string()
}

fn default_cluster_prefix() -> String {
    "acme".to_string()
}

fn default_probe_host() -> String {
    "echoserver".to_string()
}

fn default_probe_scheme() -> String {
    "http".to_string()
}

/// Fully resolved rollout, ready to run.
#[derive(Debug, Clone)]
pub struct RolloutPlan {
    /// Pipeline name.
    pub pipeline_name: String,
    /// Prefix for cluster names.
    pub cluster_prefix: String,
    /// How probe URLs are built.
    pub endpoints: EndpointTemplate,
    /// Waves in execution order.
    pub waves: Vec<RolloutWave>,
    /// Validation parameters.
    pub validation: ValidationConfig,
    /// Promotion target, if any.
    pub promotion_target: Option<EnvironmentDescriptor>,
    /// Whether promotion needs operator approval.
    pub require_approval: bool,
    /// Cut-over attempts per approval.
    pub cutover_attempts: u32,
    /// Approval polling configuration.
    pub approval: ApprovalConfig,
    /// Provisioning command, if any.
    pub provision_command: Option<String>,
}

impl RolloutPlan {
    /// Iterates every environment across all waves.
    pub fn environments(&self) -> impl Iterator<Item = &EnvironmentDescriptor> {
        self.waves.iter().flat_map(|w| w.environments())
    }
}

impl RolloutConfig {
    /// Loads a config file, choosing the format by extension.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml(&contents),
            _ => Self::from_toml(&contents),
        }
    }

    /// Parses TOML configuration.
    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| Error::Config(format!("invalid TOML: {}", e)))
    }

    /// Parses YAML configuration.
    pub fn from_yaml(contents: &str) -> Result<Self> {
        serde_yaml::from_str(contents).map_err(|e| Error::Config(format!("invalid YAML: {}", e)))
    }

    /// Resolves the config using the process environment for location defaults.
    pub fn resolve(&self) -> Result<RolloutPlan> {
        self.resolve_with(|key| std::env::var(key).ok())
    }

    /// Resolves the config, looking up fallback variables through `lookup`.
    pub fn resolve_with<F>(&self, lookup: F) -> Result<RolloutPlan>
    where
        F: Fn(&str) -> Option<String>,
    {
        self.validate().into_result()?;

        let default_account = self.location.account.clone().or_else(|| lookup(ACCOUNT_ENV));
        let default_region = self.location.region.clone().or_else(|| lookup(REGION_ENV));

        let mut seen = HashSet::new();
        let mut waves = Vec::with_capacity(self.waves.len());
        for wave in &self.waves {
            let mut environments = Vec::with_capacity(wave.environments.len());
            for env in &wave.environments {
                if !seen.insert(env.name.clone()) {
                    return Err(Error::DuplicateEnvironment(env.name.clone()));
                }
                let account = env
                    .account
                    .clone()
                    .or_else(|| default_account.clone())
                    .ok_or_else(|| {
                        Error::Config(format!(
                            "no account for environment '{}' (set location.account or {})",
                            env.name, ACCOUNT_ENV
                        ))
                    })?;
                let region = env
                    .region
                    .clone()
                    .or_else(|| default_region.clone())
                    .ok_or_else(|| {
                        Error::Config(format!(
                            "no region for environment '{}' (set location.region or {})",
                            env.name, REGION_ENV
                        ))
                    })?;

                let mut descriptor =
                    EnvironmentDescriptor::new(&env.name, &env.version, Location::new(account, region))?;
                if let Some(endpoint) = &env.endpoint {
                    descriptor = descriptor.with_endpoint(endpoint);
                }
                environments.push(descriptor);
            }
            waves.push(RolloutWave::new(&wave.name, wave.policy, environments)?);
        }

        let promotion_target = match &self.promotion.target {
            Some(target) => Some(
                waves
                    .iter()
                    .find_map(|w| w.get(target))
                    .cloned()
                    .ok_or_else(|| {
                        Error::Config(format!(
                            "promotion target '{}' is not a declared environment",
                            target
                        ))
                    })?,
            ),
            None => None,
        };

        Ok(RolloutPlan {
            pipeline_name: self.pipeline_name.clone(),
            cluster_prefix: self.cluster_prefix.clone(),
            endpoints: EndpointTemplate::new(&self.probe_scheme, &self.probe_host, &self.domain),
            waves,
            validation: self.validation.clone(),
            promotion_target,
            require_approval: self.promotion.require_approval,
            cutover_attempts: self.promotion.cutover_attempts,
            approval: self.promotion.approval.clone(),
            provision_command: self.provisioner.command.clone(),
        })
    }
}

/// Largest accepted approval poll backoff multiplier.
pub const MAX_POLL_BACKOFF: f64 = 10.0;

/// A single problem found in a config file, keyed by the offending field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigIssue {
    /// Dotted path of the field, e.g. `promotion.approval.poll_backoff`.
    pub field: String,
    /// What is wrong with it.
    pub message: String,
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Issues found while checking a rollout config.
///
/// Errors stop the rollout before anything is provisioned; warnings are
/// logged and the rollout proceeds.
#[derive(Debug, Clone, Default)]
pub struct ConfigCheck {
    /// Problems that make the config unusable.
    pub errors: Vec<ConfigIssue>,
    /// Suspicious but usable settings.
    pub warnings: Vec<ConfigIssue>,
}

impl ConfigCheck {
    /// Whether the config can be resolved into a plan.
    pub fn passed(&self) -> bool {
        self.errors.is_empty()
    }

    /// Records an error against `field`.
    pub fn error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ConfigIssue {
            field: field.into(),
            message: message.into(),
        });
    }

    /// Records a warning against `field`.
    pub fn warn(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.warnings.push(ConfigIssue {
            field: field.into(),
            message: message.into(),
        });
    }

    /// Whether any error mentions `field`.
    pub fn rejects(&self, field: &str) -> bool {
        self.errors.iter().any(|issue| issue.field == field)
    }

    /// Folds the issues of a nested section into this check.
    pub fn absorb(&mut self, section: ConfigCheck) {
        self.errors.extend(section.errors);
        self.warnings.extend(section.warnings);
    }

    /// Fails with every error joined, or returns the warnings.
    pub fn into_result(self) -> Result<Vec<ConfigIssue>> {
        if self.passed() {
            return Ok(self.warnings);
        }
        let errors: Vec<String> = self.errors.iter().map(ToString::to_string).collect();
        Err(Error::Config(errors.join("; ")))
    }
}

/// Configuration sections that can check themselves.
pub trait Validate {
    /// Checks the section and returns any issues found.
    fn validate(&self) -> ConfigCheck;
}

impl Validate for ValidationConfig {
    fn validate(&self) -> ConfigCheck {
        let mut check = ConfigCheck::default();

        if self.max_attempts == 0 {
            check.error("validation.max_attempts", "must be at least 1");
        }
        if self.interval_secs == 0 {
            check.error("validation.interval_secs", "must be positive");
        }
        if self.request_timeout_secs == 0 {
            check.error("validation.request_timeout_secs", "must be positive");
        }

        let budget = self.budget();
        if budget > Duration::from_secs(3600) {
            check.warn(
                "validation",
                format!("budget of {}s per environment exceeds one hour", budget.as_secs()),
            );
        }

        check
    }
}

impl Validate for ApprovalConfig {
    fn validate(&self) -> ConfigCheck {
        let mut check = ConfigCheck::default();

        if self.poll_initial_secs == 0 {
            check.error("promotion.approval.poll_initial_secs", "must be positive");
        }
        if self.poll_max_secs < self.poll_initial_secs {
            check.error(
                "promotion.approval.poll_max_secs",
                "must be at least poll_initial_secs",
            );
        }
        if !self.poll_backoff.is_finite() || self.poll_backoff > MAX_POLL_BACKOFF {
            check.error(
                "promotion.approval.poll_backoff",
                format!("must be a finite multiplier no larger than {}", MAX_POLL_BACKOFF),
            );
        } else if self.poll_backoff < 1.0 {
            check.warn("promotion.approval.poll_backoff", "below 1.0 is treated as 1.0");
        }

        check
    }
}

impl Validate for RolloutConfig {
    fn validate(&self) -> ConfigCheck {
        let mut check = ConfigCheck::default();

        if self.domain.trim().is_empty() {
            check.error("domain", "cannot be empty");
        }
        if self.waves.is_empty() {
            check.error("waves", "at least one wave is required");
        }
        for wave in &self.waves {
            if wave.environments.is_empty() {
                check.error(
                    format!("waves.{}", wave.name),
                    "wave has no environments",
                );
            }
        }

        if self.promotion.cutover_attempts == 0 {
            check.error("promotion.cutover_attempts", "must be at least 1");
        }

        check.absorb(self.validation.validate());
        check.absorb(self.promotion.approval.validate());

        match &self.promotion.target {
            None => check.warn(
                "promotion.target",
                "no promotion target; waves will run without a cut-over",
            ),
            Some(_) if !self.promotion.require_approval => {
                check.warn("promotion.require_approval", "false; cut-over is automatic")
            }
            Some(_) => {}
        }

        if self.provisioner.command.is_none() {
            check.warn(
                "provisioner.command",
                "not set; environments are assumed to exist",
            );
        }

        check
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLUE_GREEN: &str = r#"
        domain = "example.com"

        [location]
        account = "123456789012"
        region = "us-west-2"

        [[waves]]
        name = "DeployEKSClusters"

        [[waves.environments]]
        name = "blue"
        version = "1.20"

        [[waves.environments]]
        name = "green"
        version = "1.21"

        [promotion]
        target = "green"
    "#;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn rollout_config_has_sensible_defaults() {
        let config = RolloutConfig::from_toml(BLUE_GREEN).unwrap();

        assert_eq!(config.pipeline_name, "EKSClusterBlueGreen");
        assert_eq!(config.cluster_prefix, "acme");
        assert_eq!(config.probe_host, "echoserver");
        assert_eq!(config.validation.max_attempts, 12);
        assert_eq!(config.validation.interval_secs, 10);
        assert!(config.promotion.require_approval);
        assert_eq!(config.promotion.cutover_attempts, 3);
        assert_eq!(config.promotion.approval.poll_backoff, 2.0);
        assert_eq!(config.waves[0].policy, WavePolicy::Parallel);
    }

    #[test]
    fn resolves_blue_green_plan() {
        let plan = RolloutConfig::from_toml(BLUE_GREEN)
            .unwrap()
            .resolve_with(no_env)
            .unwrap();

        assert_eq!(plan.waves.len(), 1);
        let names: Vec<_> = plan.environments().map(|e| e.name()).collect();
        assert_eq!(names, vec!["blue", "green"]);
        assert_eq!(plan.promotion_target.as_ref().map(|e| e.version()), Some("1.21"));
        assert_eq!(
            plan.endpoints
                .endpoint_for(plan.waves[0].get("blue").unwrap())
                .url,
            "http://echoserver.blue.example.com"
        );
    }

    #[test]
    fn location_falls_back_to_environment_variables() {
        let toml = r#"
            domain = "example.com"

            [[waves]]
            name = "w"

            [[waves.environments]]
            name = "blue"
            version = "1.20"
            region = "eu-west-1"
        "#;
        let plan = RolloutConfig::from_toml(toml)
            .unwrap()
            .resolve_with(|key| match key {
                ACCOUNT_ENV => Some("999".to_string()),
                REGION_ENV => Some("us-east-1".to_string()),
                _ => None,
            })
            .unwrap();

        let blue = plan.waves[0].get("blue").unwrap();
        assert_eq!(blue.location().account, "999");
        assert_eq!(blue.location().region, "eu-west-1");
    }

    #[test]
    fn unresolved_location_is_rejected() {
        let toml = r#"
            domain = "example.com"

            [[waves]]
            name = "w"

            [[waves.environments]]
            name = "blue"
            version = "1.20"
        "#;
        let err = RolloutConfig::from_toml(toml)
            .unwrap()
            .resolve_with(no_env)
            .unwrap_err();
        assert!(err.to_string().contains("no account"));
    }

    #[test]
    fn duplicate_names_across_waves_are_rejected() {
        let toml = r#"
            domain = "example.com"

            [location]
            account = "1"
            region = "r"

            [[waves]]
            name = "first"
            [[waves.environments]]
            name = "blue"
            version = "1"

            [[waves]]
            name = "second"
            [[waves.environments]]
            name = "blue"
            version = "2"
        "#;
        let err = RolloutConfig::from_toml(toml)
            .unwrap()
            .resolve_with(no_env)
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateEnvironment(name) if name == "blue"));
    }

    #[test]
    fn unknown_promotion_target_is_rejected() {
        let toml = BLUE_GREEN.replace("target = \"green\"", "target = \"red\"");
        let err = RolloutConfig::from_toml(&toml)
            .unwrap()
            .resolve_with(no_env)
            .unwrap_err();
        assert!(err.to_string().contains("red"));
    }

    #[test]
    fn zero_attempts_is_an_error() {
        let toml = format!("{}\n[validation]\nmax_attempts = 0\n", BLUE_GREEN);
        let config = RolloutConfig::from_toml(&toml).unwrap();
        let check = config.validate();
        assert!(!check.passed());
        assert!(check.rejects("validation.max_attempts"));
        assert!(config.resolve_with(no_env).is_err());
    }

    #[test]
    fn long_validation_budget_warns() {
        let config = ValidationConfig {
            max_attempts: 100,
            interval_secs: 60,
            request_timeout_secs: 5,
        };
        let check = config.validate();
        assert!(check.passed());
        assert_eq!(check.warnings.len(), 1);
        assert_eq!(check.warnings[0].field, "validation");
    }

    #[test]
    fn unbounded_poll_backoff_is_rejected() {
        for backoff in ["1e30", "inf", "nan"] {
            let toml = format!(
                "{}\n[promotion.approval]\npoll_backoff = {}\n",
                BLUE_GREEN, backoff
            );
            let config = RolloutConfig::from_toml(&toml).unwrap();
            let check = config.validate();
            assert!(
                check.rejects("promotion.approval.poll_backoff"),
                "poll_backoff = {} should be rejected",
                backoff
            );
            let err = config.resolve_with(no_env).unwrap_err();
            assert!(err.to_string().contains("promotion.approval.poll_backoff"));
        }
    }

    #[test]
    fn gentle_poll_backoff_only_warns() {
        let config = ApprovalConfig {
            poll_backoff: 0.5,
            ..ApprovalConfig::default()
        };
        let check = config.validate();
        assert!(check.passed());
        assert_eq!(check.warnings[0].field, "promotion.approval.poll_backoff");
    }

    #[test]
    fn parses_yaml() {
        let yaml = r#"
domain: example.com
location:
  account: "123"
  region: us-west-2
waves:
  - name: clusters
    policy: sequential
    environments:
      - name: blue
        version: "1.20"
promotion:
  target: blue
  require_approval: false
"#;
        let config = RolloutConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.waves[0].policy, WavePolicy::Sequential);
        assert!(!config.promotion.require_approval);
        let plan = config.resolve_with(no_env).unwrap();
        assert!(!plan.require_approval);
    }
}
