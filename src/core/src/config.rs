use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, StageError};

/// Default data directory root.
pub const DEFAULT_DATA_DIR: &str = "/var/lib/nodeboot";

/// Default location of the private registry configuration.
pub const DEFAULT_PRIVATE_REGISTRY: &str = "/etc/nodeboot/registries.yaml";

/// Image used by the helm controller to run install jobs.
pub const DEFAULT_HELM_JOB_IMAGE: &str = "rancher/klipper-helm:v0.6.4-build20210813";

/// Chart value carrying the data directory.
pub const DEFAULT_DATA_DIR_VALUE_KEY: &str = "global.rke2DataDir";

/// Chart value carrying the system default registry.
pub const DEFAULT_REGISTRY_VALUE_KEY: &str = "global.systemDefaultRegistry";

/// Stage configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    /// Data directory root
    pub data_dir: PathBuf,

    /// Runtime image reference (e.g. "rancher/rke2-runtime:v1.21.4-rke2r2")
    pub runtime_image: String,

    /// Registry all system images are pulled from, if not the default
    pub system_default_registry: Option<String>,

    /// Private registry configuration file
    pub private_registry: PathBuf,

    /// Default helm job image, without registry prefix
    pub helm_job_image: String,

    /// Chart `set` key for the data directory
    pub data_dir_value_key: String,

    /// Chart `set` key for the system default registry
    pub registry_value_key: String,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            runtime_image: String::new(),
            system_default_registry: None,
            private_registry: PathBuf::from(DEFAULT_PRIVATE_REGISTRY),
            helm_job_image: DEFAULT_HELM_JOB_IMAGE.to_string(),
            data_dir_value_key: DEFAULT_DATA_DIR_VALUE_KEY.to_string(),
            registry_value_key: DEFAULT_REGISTRY_VALUE_KEY.to_string(),
        }
    }
}

impl StageConfig {
    /// Load configuration from a YAML file. Unset fields keep their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            StageError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        serde_yaml::from_str(&content).map_err(|e| {
            StageError::Config(format!(
                "Failed to parse config file {}: {}",
                path.display(),
                e
            ))
        })
    }

    /// Check the fields every stage invocation depends on.
    pub fn validate(&self) -> Result<()> {
        if self.runtime_image.trim().is_empty() {
            return Err(StageError::Config(
                "runtime_image must be set".to_string(),
            ));
        }
        if !self.data_dir.is_absolute() {
            return Err(StageError::Config(format!(
                "data_dir must be an absolute path, got {}",
                self.data_dir.display()
            )));
        }
        Ok(())
    }

    /// The configured system default registry, or "" when unset.
    pub fn registry_prefix(&self) -> &str {
        self.system_default_registry
            .as_deref()
            .map(str::trim)
            .unwrap_or("")
    }

    /// Paths under the data directory.
    pub fn layout(&self) -> DataLayout {
        DataLayout::new(&self.data_dir)
    }
}

/// On-disk layout of a data directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataLayout {
    root: PathBuf,
}

impl DataLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/data/<identity>/bin`
    pub fn bin_dir_for(&self, identity: &str) -> PathBuf {
        self.root.join("data").join(identity).join("bin")
    }

    /// `<root>/server/manifests`
    pub fn manifests_dir(&self) -> PathBuf {
        self.root.join("server").join("manifests")
    }

    /// `<root>/agent/images`, scanned for airgap archives.
    pub fn images_dir(&self) -> PathBuf {
        self.root.join("agent").join("images")
    }

    /// `<root>/bin`, symlinked to the current runtime bin dir.
    pub fn symlink_bin_dir(&self) -> PathBuf {
        self.root.join("bin")
    }

    /// `<root>/agent/cache/runtime`
    pub fn runtime_cache_dir(&self) -> PathBuf {
        self.root.join("agent").join("cache").join("runtime")
    }
}
