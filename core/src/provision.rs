//! Provisioning collaborators.
//!
//! Actual cluster creation is delegated to an external engine. The
//! [`Provisioner`] trait is the seam; two implementations are provided:
//! [`StaticProvisioner`] for environments that already exist and
//! [`CommandProvisioner`] which shells out to an operator-supplied command.

use async_trait::async_trait;
use tokio::process::Command;

use crate::environment::{Endpoint, EnvironmentDescriptor};
use crate::error::{Error, Result};

/// How probe URLs are derived for an environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointTemplate {
    /// URL scheme, e.g. `http`.
    pub scheme: String,
    /// Host label of the workload, e.g. `echoserver`.
    pub host: String,
    /// DNS zone the environments live under.
    pub domain: String,
}

impl EndpointTemplate {
    /// Creates a template.
    pub fn new(
        scheme: impl Into<String>,
        host: impl Into<String>,
        domain: impl Into<String>,
    ) -> Self {
        Self {
            scheme: scheme.into(),
            host: host.into(),
            domain: domain.into(),
        }
    }

    /// Returns the endpoint for `environment`.
    pub fn endpoint_for(&self, environment: &EnvironmentDescriptor) -> Endpoint {
        Endpoint::new(environment.probe_url(&self.scheme, &self.host, &self.domain))
    }
}

/// Creates or updates the infrastructure behind an environment.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Provisions `environment` and returns where it can be reached.
    async fn provision(&self, environment: &EnvironmentDescriptor) -> Result<Endpoint>;
}

/// Provisioner for environments that already exist.
pub struct StaticProvisioner {
    template: EndpointTemplate,
}

impl StaticProvisioner {
    /// Creates a provisioner that only resolves endpoints.
    pub fn new(template: EndpointTemplate) -> Self {
        Self { template }
    }
}

#[async_trait]
impl Provisioner for StaticProvisioner {
    async fn provision(&self, environment: &EnvironmentDescriptor) -> Result<Endpoint> {
        let endpoint = self.template.endpoint_for(environment);
        tracing::debug!(
            environment = %environment.name(),
            url = %endpoint.url,
            "using existing environment"
        );
        Ok(endpoint)
    }
}

/// Provisioner that runs a shell command per environment.
///
/// The command sees `ENV_NAME`, `ENV_VERSION`, `ENV_ACCOUNT`, `ENV_REGION`
/// and `CLUSTER_NAME` in its environment. A non-zero exit is a provisioning
/// failure carrying the command's stderr.
pub struct CommandProvisioner {
    command: String,
    cluster_prefix: String,
    template: EndpointTemplate,
}

impl CommandProvisioner {
    /// Creates a provisioner running `command` through `sh -c`.
    pub fn new(
        command: impl Into<String>,
        cluster_prefix: impl Into<String>,
        template: EndpointTemplate,
    ) -> Self {
        Self {
            command: command.into(),
            cluster_prefix: cluster_prefix.into(),
            template,
        }
    }
}

#[async_trait]
impl Provisioner for CommandProvisioner {
    async fn provision(&self, environment: &EnvironmentDescriptor) -> Result<Endpoint> {
        let cluster_name = environment.cluster_name(&self.cluster_prefix);
        tracing::info!(
            environment = %environment.name(),
            cluster = %cluster_name,
            version = %environment.version(),
            location = %environment.location(),
            "provisioning environment"
        );

        let output = Command::new("sh")
            .args(["-c", &self.command])
            .env("ENV_NAME", environment.name())
            .env("ENV_VERSION", environment.version())
            .env("ENV_ACCOUNT", &environment.location().account)
            .env("ENV_REGION", &environment.location().region)
            .env("CLUSTER_NAME", &cluster_name)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::Provisioning {
                environment: environment.name().to_string(),
                reason: format!("failed to run provisioner: {}", e),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Provisioning {
                environment: environment.name().to_string(),
                reason: format!("provisioner exited with {}: {}", output.status, stderr.trim()),
            });
        }

        Ok(self.template.endpoint_for(environment))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::Location;

    fn blue() -> EnvironmentDescriptor {
        EnvironmentDescriptor::new("blue", "1.20", Location::new("123456789012", "us-west-2"))
            .unwrap()
    }

    fn template() -> EndpointTemplate {
        EndpointTemplate::new("http", "echoserver", "example.com")
    }

    #[tokio::test]
    async fn static_provisioner_resolves_endpoint() {
        let endpoint = StaticProvisioner::new(template())
            .provision(&blue())
            .await
            .unwrap();
        assert_eq!(endpoint.url, "http://echoserver.blue.example.com");
    }

    #[tokio::test]
    async fn command_provisioner_exports_environment() {
        let provisioner = CommandProvisioner::new(
            r#"test "$ENV_NAME" = blue && test "$CLUSTER_NAME" = acme-blue && test "$ENV_REGION" = us-west-2"#,
            "acme",
            template(),
        );
        let endpoint = provisioner.provision(&blue()).await.unwrap();
        assert_eq!(endpoint.url, "http://echoserver.blue.example.com");
    }

    #[tokio::test]
    async fn command_provisioner_surfaces_failure() {
        let provisioner = CommandProvisioner::new("echo quota exceeded >&2; exit 3", "acme", template());
        let err = provisioner.provision(&blue()).await.unwrap_err();
        match err {
            Error::Provisioning { environment, reason } => {
                assert_eq!(environment, "blue");
                assert!(reason.contains("quota exceeded"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
