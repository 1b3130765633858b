//! Traffic cut-over persisted to the state directory.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::environment::EnvironmentDescriptor;
use crate::error::{Error, Result};
use crate::promotion::TrafficSwitch;
use crate::provision::EndpointTemplate;

/// The environment currently serving production traffic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveEnvironment {
    /// Environment name.
    pub environment: String,
    /// Environment version.
    pub version: String,
    /// Cluster backing the environment.
    pub cluster_name: String,
    /// Endpoint production traffic is pointed at.
    pub endpoint: String,
    /// When the switch happened.
    pub switched_at: DateTime<Utc>,
}

/// Traffic switch that records the active environment in `active.json`.
pub struct FileTrafficSwitch {
    path: PathBuf,
    cluster_prefix: String,
    template: EndpointTemplate,
}

impl FileTrafficSwitch {
    /// Creates a switch writing into `state_dir`.
    pub fn new(
        state_dir: impl AsRef<Path>,
        cluster_prefix: impl Into<String>,
        template: EndpointTemplate,
    ) -> Self {
        Self {
            path: state_dir.as_ref().join("active.json"),
            cluster_prefix: cluster_prefix.into(),
            template,
        }
    }

    /// Returns the active environment, if a cut-over has happened.
    pub fn active(&self) -> Result<Option<ActiveEnvironment>> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => serde_json::from_str(&contents).map(Some).map_err(|e| {
                Error::Serialization(format!("failed to parse {}: {}", self.path.display(), e))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }
}

#[async_trait]
impl TrafficSwitch for FileTrafficSwitch {
    async fn cut_over(&self, target: &EnvironmentDescriptor) -> Result<()> {
        let active = ActiveEnvironment {
            environment: target.name().to_string(),
            version: target.version().to_string(),
            cluster_name: target.cluster_name(&self.cluster_prefix),
            endpoint: self.template.endpoint_for(target).url,
            switched_at: Utc::now(),
        };

        let previous = self.active()?;
        let json = serde_json::to_string_pretty(&active)
            .map_err(|e| Error::Cutover(format!("failed to serialize active environment: {}", e)))?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Write then rename so readers never see a partial pointer.
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| Error::Cutover(format!("failed to write {}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| Error::Cutover(format!("failed to replace {}: {}", self.path.display(), e)))?;

        tracing::info!(
            from = ?previous.map(|p| p.environment),
            to = %active.environment,
            endpoint = %active.endpoint,
            "production traffic switched"
        );
        Ok(())
    }
}
