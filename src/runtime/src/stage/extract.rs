//! Selective extraction into a staging directory.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use nodeboot_core::error::{Result, StageError};
use tar::EntryType;
use tempfile::TempDir;

use crate::oci::{flatten, Image};

/// Permission bits kept on extracted files (rwxr-xr-x).
const EXTRACT_MODE_MASK: u32 = 0o755;

/// Top-level image directories to keep, and where each one goes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractionPlan {
    dirs: BTreeMap<String, PathBuf>,
}

impl ExtractionPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep the image directory `name`, to be placed at `dest`.
    pub fn insert(&mut self, name: impl Into<String>, dest: impl Into<PathBuf>) {
        self.dirs.insert(name.into(), dest.into());
    }

    pub fn with(mut self, name: impl Into<String>, dest: impl Into<PathBuf>) -> Self {
        self.insert(name, dest);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.dirs.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.dirs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Path)> {
        self.dirs.iter().map(|(k, v)| (k.as_str(), v.as_path()))
    }
}

/// Temporary directory inside the data directory that extracted content is
/// assembled in. Removed on drop.
#[derive(Debug)]
pub struct StagingArea {
    dir: TempDir,
}

impl StagingArea {
    /// Create `runtime-*` under `data_dir`, so the final moves stay on one
    /// filesystem.
    pub fn create(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir).map_err(|e| {
            StageError::Placement(format!(
                "Failed to create data directory {}: {}",
                data_dir.display(),
                e
            ))
        })?;
        let dir = tempfile::Builder::new()
            .prefix("runtime-")
            .tempdir_in(data_dir)
            .map_err(|e| {
                StageError::Placement(format!(
                    "Failed to create staging directory in {}: {}",
                    data_dir.display(),
                    e
                ))
            })?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Staged location of a planned directory.
    pub fn subtree(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Remove the staging directory now.
    pub fn close(self) -> io::Result<()> {
        self.dir.close()
    }
}

/// Extract the planned directories of `image` into `staging`.
///
/// Only directories named in the plan and the regular files directly inside
/// them are written; everything else in the image is skipped. The first I/O
/// failure aborts extraction.
pub async fn extract<I: Image + ?Sized>(
    image: &I,
    plan: &ExtractionPlan,
    staging: &StagingArea,
) -> Result<()> {
    let root = staging.path();
    let mut files = 0usize;

    flatten(image, |name, entry| {
        let entry_type = entry.header().entry_type();
        let key = match entry_type {
            EntryType::Directory => name,
            _ => name.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("."),
        };
        if !plan.contains(key) {
            return Ok(());
        }

        let target = root.join(name);
        match entry_type {
            EntryType::Directory => {
                if !target.exists() {
                    std::fs::create_dir_all(&target).map_err(|e| write_error(&target, e))?;
                }
            }
            EntryType::Regular | EntryType::Continuous => {
                tracing::debug!(path = %name, "Extracting file");
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent).map_err(|e| write_error(parent, e))?;
                }
                let mode = entry.header().mode().map_err(|e| write_error(&target, e))? & EXTRACT_MODE_MASK;
                let mut file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .mode(mode)
                    .open(&target)
                    .map_err(|e| write_error(&target, e))?;
                io::copy(entry, &mut file).map_err(|e| write_error(&target, e))?;
                files += 1;
            }
            other => {
                tracing::debug!(path = %name, entry_type = ?other, "Skipping non-regular entry");
            }
        }
        Ok(())
    })
    .await?;

    tracing::debug!(
        reference = %image.reference(),
        staging = %root.display(),
        files,
        "Extracted runtime image content"
    );
    Ok(())
}

fn write_error(path: &Path, err: io::Error) -> StageError {
    StageError::Placement(format!("Failed to extract {}: {}", path.display(), err))
}
