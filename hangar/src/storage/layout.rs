//! Storage layout configuration

use std::path::PathBuf;

use crate::filesys::dir::Dir;
use crate::filesys::file::File;

/// Storage layout for the control plane
#[derive(Debug, Clone)]
pub struct StorageLayout {
    /// Base directory for all storage
    pub base_dir: PathBuf,
}

impl StorageLayout {
    /// Create a new storage layout
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Get the settings file path
    pub fn settings_file(&self) -> File {
        File::new(self.base_dir.join("settings.json"))
    }

    /// Get the deployment store snapshot
    pub fn store_file(&self) -> File {
        File::new(self.base_dir.join("deployments.json"))
    }

    /// Get the directory holding every deployment's data
    pub fn deployments_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("deployments"))
    }

    /// Get the data layout of a single deployment
    pub fn deployment(&self, deployment_id: &str) -> DeploymentLayout {
        DeploymentLayout {
            root: self.deployments_dir().subdir(deployment_id),
        }
    }

    /// Get the logs directory
    pub fn logs_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("logs"))
    }

    /// Setup the storage layout (create directories)
    pub async fn setup(&self) -> Result<(), crate::errors::HangarError> {
        self.deployments_dir().create_private().await?;
        self.logs_dir().create().await?;
        Ok(())
    }
}

impl Default for StorageLayout {
    fn default() -> Self {
        Self::new(PathBuf::from("/var/lib/hangar"))
    }
}

/// Deployment-scoped directory tree, bind-mounted into the container
#[derive(Debug, Clone)]
pub struct DeploymentLayout {
    root: Dir,
}

impl DeploymentLayout {
    /// Root of the tree, deleted on removal
    pub fn root(&self) -> &Dir {
        &self.root
    }

    /// Agent configuration directory
    pub fn config_dir(&self) -> Dir {
        self.root.subdir("config")
    }

    /// Per-provider credential files
    pub fn credentials_dir(&self) -> Dir {
        self.config_dir().subdir("credentials")
    }

    /// Persistent agent workspace
    pub fn workspace_dir(&self) -> Dir {
        self.root.subdir("workspace")
    }

    /// Application config file read by the agent at boot
    pub fn agent_config_file(&self) -> File {
        self.config_dir().file("agent.json")
    }

    /// Credential file of one provider
    pub fn credential_file(&self, provider: &str) -> File {
        self.credentials_dir().file(&format!("{}.json", provider))
    }
}
