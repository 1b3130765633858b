//! Environment descriptors and rollout waves.
//!
//! An [`EnvironmentDescriptor`] identifies one deployment target (for example
//! the `blue` or `green` cluster). A [`RolloutWave`] is an ordered set of
//! descriptors that are provisioned together before the pipeline advances.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Maximum length of a DNS label.
const MAX_NAME_LEN: usize = 63;

/// Account and region an environment is deployed into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    /// Cloud account identifier.
    pub account: String,
    /// Cloud region.
    pub region: String,
}

impl Location {
    /// Creates a new location.
    pub fn new(account: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            region: region.into(),
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.account, self.region)
    }
}

/// Immutable description of a single rollout target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentDescriptor {
    name: String,
    version: String,
    location: Location,
    endpoint: Option<String>,
}

impl EnvironmentDescriptor {
    /// Creates a descriptor, rejecting names that are not DNS-label safe.
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        location: Location,
    ) -> Result<Self> {
        let name = name.into();
        validate_name(&name)?;
        Ok(Self {
            name,
            version: version.into(),
            location,
            endpoint: None,
        })
    }

    /// Overrides the computed probe URL with an explicit endpoint.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Returns the environment name (unique within a rollout).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the opaque version tag.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Returns where the environment lives.
    pub fn location(&self) -> &Location {
        &self.location
    }

    /// Returns the explicit endpoint override, if any.
    pub fn endpoint_override(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    /// Cluster name derived from a naming prefix, e.g. `acme-blue`.
    pub fn cluster_name(&self, prefix: &str) -> String {
        format!("{}-{}", prefix, self.name)
    }

    /// URL the health validator polls for this environment.
    ///
    /// Built as `{scheme}://{host}.{name}.{domain}` unless an endpoint
    /// override was supplied.
    pub fn probe_url(&self, scheme: &str, host: &str, domain: &str) -> String {
        match &self.endpoint {
            Some(endpoint) => endpoint.clone(),
            None => format!("{}://{}.{}.{}", scheme, host, self.name, domain),
        }
    }
}

impl fmt::Display for EnvironmentDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{} ({})", self.name, self.version, self.location)
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(Error::Config(format!(
            "environment name '{}' must be 1-{} characters",
            name, MAX_NAME_LEN
        )));
    }
    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if !valid_chars || name.starts_with('-') || name.ends_with('-') {
        return Err(Error::Config(format!(
            "environment name '{}' is not a valid DNS label",
            name
        )));
    }
    Ok(())
}

/// Where a provisioned environment can be reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// URL probed by the health validator.
    pub url: String,
}

impl Endpoint {
    /// Creates an endpoint from a URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

/// How descriptors within a wave are scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WavePolicy {
    /// Every environment runs as an independent task.
    #[default]
    Parallel,
    /// Environments run one after another in declaration order.
    Sequential,
}

/// Ordered set of environments provisioned together.
///
/// Descriptor names are unique within a wave; this is checked on construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolloutWave {
    name: String,
    policy: WavePolicy,
    environments: Vec<EnvironmentDescriptor>,
}

impl RolloutWave {
    /// Creates a wave, rejecting empty waves and duplicate descriptor names.
    pub fn new(
        name: impl Into<String>,
        policy: WavePolicy,
        environments: Vec<EnvironmentDescriptor>,
    ) -> Result<Self> {
        let name = name.into();
        if environments.is_empty() {
            return Err(Error::Config(format!("wave '{}' has no environments", name)));
        }

        let mut seen = HashSet::new();
        for env in &environments {
            if !seen.insert(env.name()) {
                return Err(Error::DuplicateEnvironment(env.name().to_string()));
            }
        }

        Ok(Self {
            name,
            policy,
            environments,
        })
    }

    /// Returns the wave name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the scheduling policy.
    pub fn policy(&self) -> WavePolicy {
        self.policy
    }

    /// Returns the descriptors in declaration order.
    pub fn environments(&self) -> &[EnvironmentDescriptor] {
        &self.environments
    }

    /// Looks up a descriptor by name.
    pub fn get(&self, name: &str) -> Option<&EnvironmentDescriptor> {
        self.environments.iter().find(|e| e.name() == name)
    }
}
