//! Images stored in `docker save` style archives.
//!
//! The archive holds a `manifest.json` listing, per image, its config blob,
//! repository tags and layer paths:
//!
//! ```text
//! [{"Config": "<hex>.json", "RepoTags": ["rancher/rke2-runtime:v1.2.3"],
//!   "Layers": ["<id>/layer.tar", ...]}]
//! ```
//!
//! Tar archives can only be read front to back, so locating an image takes
//! one pass that keeps every small JSON entry, and each layer read re-opens
//! the archive and streams up to the requested entry.

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use nodeboot_core::error::{Result, StageError};
use serde::Deserialize;

use super::archive::{ArchiveFormat, ArchiveReader};
use super::image::{spool, Image, Layer};
use super::reference::ImageReference;

/// Name of the archive index entry.
const MANIFEST_ENTRY: &str = "manifest.json";

/// JSON entries larger than this are never metadata.
const MAX_METADATA_SIZE: u64 = 16 * 1024 * 1024;

/// One image in `manifest.json`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ArchiveManifestEntry {
    config: String,
    #[serde(default)]
    repo_tags: Vec<String>,
    layers: Vec<String>,
}

/// The subset of the image config needed to name layers.
#[derive(Debug, Deserialize)]
struct ImageConfigFile {
    rootfs: RootFs,
}

#[derive(Debug, Deserialize)]
struct RootFs {
    #[serde(default)]
    diff_ids: Vec<String>,
}

/// An image found inside a local archive.
#[derive(Debug)]
pub struct ArchiveImage {
    path: PathBuf,
    format: ArchiveFormat,
    reference: ImageReference,
    layers: Vec<Layer>,
    /// Entry path of each layer inside the archive, aligned with `layers`
    layer_entries: Vec<String>,
}

impl ArchiveImage {
    /// Look for `reference` in the archive at `path`.
    ///
    /// Returns `Ok(None)` when the archive is readable but does not list
    /// the tag.
    pub fn open(
        path: &Path,
        format: ArchiveFormat,
        reference: &ImageReference,
    ) -> Result<Option<Self>> {
        let metadata = read_metadata_entries(path, format)?;

        let manifest_data = metadata.get(MANIFEST_ENTRY).ok_or_else(|| {
            StageError::Archive(format!(
                "{} has no {} entry",
                path.display(),
                MANIFEST_ENTRY
            ))
        })?;
        let manifest: Vec<ArchiveManifestEntry> = serde_json::from_slice(manifest_data)
            .map_err(|e| {
                StageError::Archive(format!(
                    "Invalid {} in {}: {}",
                    MANIFEST_ENTRY,
                    path.display(),
                    e
                ))
            })?;

        let Some(entry) = manifest
            .into_iter()
            .find(|entry| entry.repo_tags.iter().any(|t| tag_matches(t, reference)))
        else {
            return Ok(None);
        };

        let config_name = normalize_entry_name(&entry.config);
        let config: ImageConfigFile = match metadata.get(&config_name) {
            Some(data) => serde_json::from_slice(data)?,
            // OCI-style archives keep the config under blobs/ without a suffix.
            None => serde_json::from_reader(read_entry(path, format, &config_name)?)?,
        };

        let layers = layer_digests(&entry.layers, &config.rootfs.diff_ids).map_err(|msg| {
            StageError::Archive(format!("{} ({}): {}", path.display(), reference, msg))
        })?;

        Ok(Some(Self {
            path: path.to_path_buf(),
            format,
            reference: reference.clone(),
            layers,
            layer_entries: entry.layers.iter().map(|l| normalize_entry_name(l)).collect(),
        }))
    }

    /// Path of the archive holding this image.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Image for ArchiveImage {
    fn reference(&self) -> &ImageReference {
        &self.reference
    }

    fn layers(&self) -> &[Layer] {
        &self.layers
    }

    async fn open_layer(&self, layer: &Layer) -> Result<File> {
        let index = self
            .layers
            .iter()
            .position(|l| l == layer)
            .ok_or_else(|| {
                StageError::Archive(format!(
                    "Layer {} is not part of {}",
                    layer.digest, self.reference
                ))
            })?;
        read_entry(&self.path, self.format, &self.layer_entries[index])
    }
}

/// Stream through the archive and copy one entry out to a temporary file.
fn read_entry(path: &Path, format: ArchiveFormat, wanted: &str) -> Result<File> {
    let reader = format.open(path)?;
    let mut archive = tar::Archive::new(reader);
    let read_error =
        |e: std::io::Error| StageError::Archive(format!("Failed to read {}: {}", path.display(), e));

    let mut found = None;
    for entry in archive.entries().map_err(read_error)? {
        let mut entry = entry.map_err(read_error)?;
        if entry_name(&entry).map_err(read_error)? == wanted {
            found = Some(spool(&mut entry).map_err(read_error)?);
            break;
        }
    }

    close_archive(archive.into_inner(), path);

    found.ok_or_else(|| {
        StageError::Archive(format!("Entry {} not found in {}", wanted, path.display()))
    })
}

/// Close an archive we are done with. Failures only matter for diagnostics
/// once the content has been read.
fn close_archive(reader: ArchiveReader, path: &Path) {
    if let Err(e) = reader.close() {
        tracing::debug!(path = %path.display(), error = %e, "Failed to close archive");
    }
}

/// Read every small `.json` entry of an archive in a single pass.
fn read_metadata_entries(path: &Path, format: ArchiveFormat) -> Result<HashMap<String, Vec<u8>>> {
    let reader = format.open(path)?;
    let mut archive = tar::Archive::new(reader);
    let read_error =
        |e: std::io::Error| StageError::Archive(format!("Failed to read {}: {}", path.display(), e));

    let mut metadata = HashMap::new();
    for entry in archive.entries().map_err(read_error)? {
        let mut entry = entry.map_err(read_error)?;
        let name = entry_name(&entry).map_err(read_error)?;
        if !name.ends_with(".json") || entry.header().size().map_err(read_error)? > MAX_METADATA_SIZE {
            continue;
        }
        let mut data = Vec::new();
        entry.read_to_end(&mut data).map_err(read_error)?;
        metadata.insert(name, data);
    }

    archive.into_inner().close()?;
    Ok(metadata)
}

fn entry_name<R: Read>(entry: &tar::Entry<'_, R>) -> std::io::Result<String> {
    Ok(normalize_entry_name(&entry.path()?.to_string_lossy()))
}

/// Strip `./` and `/` prefixes so entry names compare equal to manifest paths.
fn normalize_entry_name(name: &str) -> String {
    let mut name = name;
    loop {
        if let Some(rest) = name.strip_prefix("./") {
            name = rest;
        } else if let Some(rest) = name.strip_prefix('/') {
            name = rest;
        } else {
            return name.to_string();
        }
    }
}

/// Whether a `RepoTags` entry names the same image as `reference`.
fn tag_matches(repo_tag: &str, reference: &ImageReference) -> bool {
    match ImageReference::parse(repo_tag) {
        Ok(candidate) => {
            candidate.registry == reference.registry
                && candidate.repository == reference.repository
                && candidate.tag == reference.tag
        }
        Err(_) => false,
    }
}

/// Name each layer by its blob digest.
///
/// OCI-style archives store layers as `blobs/<alg>/<hex>`, which is the digest.
/// Classic `docker save` layers are uncompressed tars, so their blob digest is
/// the config's diff ID.
fn layer_digests(
    entries: &[String],
    diff_ids: &[String],
) -> std::result::Result<Vec<Layer>, String> {
    entries
        .iter()
        .enumerate()
        .map(|(i, entry)| {
            if let Some(digest) = blob_path_digest(entry) {
                return Ok(Layer::new(digest));
            }
            diff_ids
                .get(i)
                .map(|d| Layer::new(d.clone()))
                .ok_or_else(|| format!("no diff ID for layer {}", entry))
        })
        .collect()
}

fn blob_path_digest(entry: &str) -> Option<String> {
    let name = normalize_entry_name(entry);
    let mut parts = name.split('/');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some("blobs"), Some(alg), Some(hex), None) if !alg.is_empty() && !hex.is_empty() => {
            Some(format!("{}:{}", alg, hex))
        }
        _ => None,
    }
}
