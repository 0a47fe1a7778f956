//! HelmChart manifest rewriting.
//!
//! Charts shipped in the runtime image are patched so the Helm job and the
//! chart values see the node's data directory and system default registry.
//! Files that are not a single HelmChart document are left alone; the
//! manifests directory may hold unrelated user content.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use nodeboot_core::config::StageConfig;
use nodeboot_core::error::{MultiError, Result, StageError};
use serde::{Deserialize, Serialize};

const HELM_API_VERSION: &str = "helm.cattle.io/v1";
const HELM_CHART_KIND: &str = "HelmChart";

/// A `set` override value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IntOrString {
    Int(i64),
    String(String),
}

impl IntOrString {
    /// String form; empty for integers.
    pub fn str_val(&self) -> &str {
        match self {
            Self::Int(_) => "",
            Self::String(s) => s,
        }
    }
}

/// `helm.cattle.io/v1` HelmChart document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelmChart {
    pub api_version: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_yaml::Value>,
    #[serde(default)]
    pub spec: HelmChartSpec,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelmChartSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set: Option<BTreeMap<String, IntOrString>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub job_image: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

/// Applies node settings to HelmChart manifests.
#[derive(Debug, Clone)]
pub struct ManifestRewriter {
    data_dir_key: String,
    registry_key: String,
    data_dir: String,
    registry: String,
    job_image: String,
}

impl ManifestRewriter {
    /// `registry` may be empty, meaning the default registry.
    pub fn new(data_dir: impl Into<String>, registry: impl Into<String>, base_job_image: &str) -> Self {
        let registry = registry.into();
        let job_image = if registry.is_empty() {
            base_job_image.to_string()
        } else {
            format!("{}/{}", registry, base_job_image)
        };
        Self {
            data_dir_key: nodeboot_core::config::DEFAULT_DATA_DIR_VALUE_KEY.to_string(),
            registry_key: nodeboot_core::config::DEFAULT_REGISTRY_VALUE_KEY.to_string(),
            data_dir: data_dir.into(),
            registry,
            job_image,
        }
    }

    pub fn from_config(config: &StageConfig) -> Self {
        Self::new(
            config.data_dir.to_string_lossy(),
            config.registry_prefix(),
            &config.helm_job_image,
        )
        .with_keys(&config.data_dir_value_key, &config.registry_value_key)
    }

    /// Override the `set` keys receiving the data directory and registry.
    pub fn with_keys(mut self, data_dir_key: &str, registry_key: &str) -> Self {
        self.data_dir_key = data_dir_key.to_string();
        self.registry_key = registry_key.to_string();
        self
    }

    /// Job image charts are pointed at.
    pub fn job_image(&self) -> &str {
        &self.job_image
    }

    /// Rewrite every `.yaml`/`.yml` file below `dir`.
    ///
    /// Returns the number of files written. Read and write failures are
    /// collected and reported together after every file was tried.
    pub fn rewrite_dir(&self, dir: &Path) -> Result<usize> {
        if !dir.is_dir() {
            tracing::debug!(dir = %dir.display(), "Manifests directory does not exist");
            return Ok(0);
        }

        let mut errs = MultiError::new();
        let mut rewritten = 0;
        for path in manifest_files(dir)? {
            if let Some(true) = errs.check(self.rewrite_file(&path)) {
                rewritten += 1;
            }
        }
        errs.into_result()?;
        Ok(rewritten)
    }

    /// Rewrite a single file. Returns whether it was written.
    pub fn rewrite_file(&self, path: &Path) -> Result<bool> {
        let data = std::fs::read(path).map_err(|e| {
            StageError::Manifest(format!("Failed to read manifest {}: {}", path.display(), e))
        })?;

        // Undecodable content, invalid UTF-8 included, is not ours to touch.
        let mut chart: HelmChart = match serde_yaml::from_slice(&data) {
            Ok(chart) => chart,
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "Failed to decode manifest");
                return Ok(false);
            }
        };
        if chart.api_version != HELM_API_VERSION || chart.kind != HELM_CHART_KIND {
            tracing::debug!(
                path = %path.display(),
                kind = %chart.kind,
                api_version = %chart.api_version,
                "Manifest is not a HelmChart"
            );
            return Ok(false);
        }

        if !self.apply(&mut chart) {
            return Ok(false);
        }

        let encoded = serde_yaml::to_string(&chart).map_err(|e| {
            StageError::Manifest(format!(
                "Failed to serialize modified HelmChart {}: {}",
                path.display(),
                e
            ))
        })?;

        // Truncating in place keeps the file's mode and ownership.
        let mut file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(path)
            .map_err(|e| {
                StageError::Manifest(format!("Unable to open HelmChart {}: {}", path.display(), e))
            })?;
        file.write_all(encoded.as_bytes()).map_err(|e| {
            StageError::Manifest(format!(
                "Failed to write modified HelmChart {}: {}",
                path.display(),
                e
            ))
        })?;

        tracing::info!(
            path = %path.display(),
            "Updated HelmChart to apply data directory and system default registry"
        );
        Ok(true)
    }

    /// Patch `chart` in memory. Returns whether anything changed.
    fn apply(&self, chart: &mut HelmChart) -> bool {
        let set = chart.spec.set.get_or_insert_with(BTreeMap::new);
        let mut changed = false;

        for (key, value) in [
            (&self.data_dir_key, &self.data_dir),
            (&self.registry_key, &self.registry),
        ] {
            let current = set.get(key).map(IntOrString::str_val).unwrap_or("");
            if current != value.as_str() {
                set.insert(key.clone(), IntOrString::String(value.clone()));
                changed = true;
            }
        }

        if chart.spec.job_image != self.job_image {
            chart.spec.job_image = self.job_image.clone();
            changed = true;
        }
        changed
    }
}

/// YAML files below `dir`, recursively, in a stable order.
fn manifest_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];

    while let Some(current) = pending.pop() {
        let read_dir = std::fs::read_dir(&current).map_err(|e| {
            StageError::Manifest(format!(
                "Failed to read manifests directory {}: {}",
                current.display(),
                e
            ))
        })?;
        for entry in read_dir {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
            } else if matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("yaml") | Some("yml")
            ) {
                files.push(path);
            }
        }
    }

    files.sort();
    Ok(files)
}
