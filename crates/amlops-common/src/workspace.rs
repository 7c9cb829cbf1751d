use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

const CONFIG_FILE: &str = "config.json";
const CONFIG_DIR: &str = ".azureml";

/// Run-context variables the platform sets inside jobs.
const RUN_SUBSCRIPTION_ENV: &str = "AZUREML_ARM_SUBSCRIPTION";
const RUN_RESOURCE_GROUP_ENV: &str = "AZUREML_ARM_RESOURCEGROUP";
const RUN_WORKSPACE_ENV: &str = "AZUREML_ARM_WORKSPACE_NAME";

#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("no config.json found in {0} or any parent directory")]
    NotFound(PathBuf),
    #[error("not running inside a job: {0} is not set")]
    NoRunContext(&'static str),
    #[error("failed to read workspace config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("workspace config {path} is invalid: {source}")]
    Invalid {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Identifies the workspace every control-plane call is scoped to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkspaceConfig {
    pub subscription_id: String,
    pub resource_group: String,
    pub workspace_name: String,
}

impl WorkspaceConfig {
    pub fn load(path: &Path) -> Result<Self, WorkspaceError> {
        let raw = std::fs::read_to_string(path).map_err(|source| WorkspaceError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| WorkspaceError::Invalid {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Looks for `config.json` or `.azureml/config.json` in `start` and its ancestors.
    pub fn discover(start: &Path) -> Result<Self, WorkspaceError> {
        for dir in start.ancestors() {
            for candidate in [dir.join(CONFIG_FILE), dir.join(CONFIG_DIR).join(CONFIG_FILE)] {
                if candidate.is_file() {
                    tracing::debug!(path=%candidate.display(), "found workspace config");
                    return Self::load(&candidate);
                }
            }
        }
        Err(WorkspaceError::NotFound(start.to_path_buf()))
    }

    /// Workspace of the job this process runs in.
    pub fn from_run_env() -> Result<Self, WorkspaceError> {
        let var = |name: &'static str| {
            std::env::var(name)
                .ok()
                .filter(|v| !v.is_empty())
                .ok_or(WorkspaceError::NoRunContext(name))
        };
        Ok(Self {
            subscription_id: var(RUN_SUBSCRIPTION_ENV)?,
            resource_group: var(RUN_RESOURCE_GROUP_ENV)?,
            workspace_name: var(RUN_WORKSPACE_ENV)?,
        })
    }

    /// Writes `<dir>/.azureml/config.json` and returns its path.
    pub fn write_config(&self, dir: &Path) -> Result<PathBuf, WorkspaceError> {
        let config_dir = dir.join(CONFIG_DIR);
        let path = config_dir.join(CONFIG_FILE);
        let io_err = |source: std::io::Error| WorkspaceError::Io {
            path: path.clone(),
            source,
        };
        std::fs::create_dir_all(&config_dir).map_err(io_err)?;
        let body = serde_json::to_string_pretty(self).unwrap_or_default();
        std::fs::write(&path, body).map_err(io_err)?;
        Ok(path)
    }

    /// ARM resource id of the workspace.
    pub fn resource_id(&self) -> String {
        format!(
            "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.MachineLearningServices/workspaces/{}",
            self.subscription_id, self.resource_group, self.workspace_name
        )
    }
}
