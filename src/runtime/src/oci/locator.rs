//! Local image locator.
//!
//! Scans a directory of airgap archives for an image tag so nodes without
//! registry access can still boot. A miss is not an error: the caller falls
//! back to pulling.

use std::path::{Path, PathBuf};

use nodeboot_core::error::{Result, StageError};

use super::archive::ArchiveFormat;
use super::reference::{ImageReference, DEFAULT_REGISTRY};
use super::tarball::ArchiveImage;

/// Finds images in archives under a directory.
#[derive(Debug, Clone)]
pub struct LocalImageLocator {
    images_dir: PathBuf,
}

impl LocalImageLocator {
    pub fn new(images_dir: impl Into<PathBuf>) -> Self {
        Self {
            images_dir: images_dir.into(),
        }
    }

    /// Resolve `reference` from local archives.
    ///
    /// The reference is tried as configured and, when its registry is not the
    /// default one, again under the default registry, since airgap bundles
    /// commonly keep the upstream names even when a private registry is set.
    /// Lookup failures are logged and treated as misses.
    pub fn resolve(&self, reference: &ImageReference) -> Option<ArchiveImage> {
        let mut candidates = vec![reference.clone()];
        if reference.registry != DEFAULT_REGISTRY {
            candidates.push(reference.with_registry(DEFAULT_REGISTRY));
        }

        for candidate in &candidates {
            match self.find(candidate) {
                Ok(Some(image)) => return Some(image),
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(
                        reference = %candidate,
                        error = %e,
                        "Failed to load bootstrap image from local archives"
                    );
                }
            }
        }
        None
    }

    /// Return the first archive holding `reference`.
    ///
    /// Only tag references can be looked up; digests are left to the registry.
    pub fn find(&self, reference: &ImageReference) -> Result<Option<ArchiveImage>> {
        if reference.is_digest() || reference.tag.is_none() {
            tracing::debug!(reference = %reference, "No local image available: reference is not a tag");
            return Ok(None);
        }

        if !self.images_dir.exists() {
            tracing::debug!(
                reference = %reference,
                dir = %self.images_dir.display(),
                "No local image available: directory does not exist"
            );
            return Ok(None);
        }

        let files = list_files(&self.images_dir)?;

        // Lazily probe each file; the first hit wins and failures are only logged.
        let found = files.iter().find_map(|path| match probe(path, reference) {
            Ok(image) => image,
            Err(e) => {
                tracing::info!(path = %path.display(), error = %e, "Failed to check archive");
                None
            }
        });

        match found {
            Some(ref image) => {
                tracing::debug!(
                    reference = %reference,
                    path = %image.path().display(),
                    "Found image in local archive"
                );
            }
            None => {
                tracing::debug!(
                    reference = %reference,
                    dir = %self.images_dir.display(),
                    "No local image available: not found in any file"
                );
            }
        }
        Ok(found)
    }
}

/// Check a single file for `reference`.
fn probe(path: &Path, reference: &ImageReference) -> Result<Option<ArchiveImage>> {
    let Some(format) = ArchiveFormat::from_path(path)? else {
        return Ok(None);
    };

    match ArchiveImage::open(path, format, reference)? {
        Some(image) => Ok(Some(image)),
        None => {
            tracing::debug!(reference = %reference, path = %path.display(), "Tag not found in archive");
            Ok(None)
        }
    }
}

/// All regular files below `dir`, recursively, in a stable order.
fn list_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];

    while let Some(current) = pending.pop() {
        let read_dir = std::fs::read_dir(&current).map_err(|e| {
            StageError::Archive(format!(
                "Failed to read images directory {}: {}",
                current.display(),
                e
            ))
        })?;
        for entry in read_dir {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
            } else {
                files.push(path);
            }
        }
    }

    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oci::tarball::tests::write_image_archive;
    use crate::oci::Image;
    use tempfile::TempDir;

    fn reference(s: &str) -> ImageReference {
        ImageReference::parse(s).unwrap()
    }

    #[test]
    fn test_missing_directory_is_miss() {
        let locator = LocalImageLocator::new("/nonexistent/agent/images");
        let found = locator.find(&reference("rancher/rke2-runtime:v1.2.3")).unwrap();
        assert!(found.is_none());
    }

    #[test]
    fn test_finds_tag_and_skips_sidecars() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("images.txt"), "rancher/rke2-runtime:v1.2.3\n").unwrap();
        write_image_archive(
            &dir.path().join("bundle.tar.gz"),
            &["rancher/rke2-runtime:v1.2.3"],
            &[vec![("bin/kubelet", b"kubelet")]],
        );

        let locator = LocalImageLocator::new(dir.path());
        let image = locator
            .find(&reference("rancher/rke2-runtime:v1.2.3"))
            .unwrap()
            .unwrap();
        assert!(image.path().ends_with("bundle.tar.gz"));
        assert_eq!(image.layers().len(), 1);
    }

    #[test]
    fn test_corrupt_and_unknown_files_do_not_abort_scan() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a-broken.tar.gz"), b"not gzip at all").unwrap();
        std::fs::write(dir.path().join("b-notes.md"), b"# notes").unwrap();
        let nested = dir.path().join("nested");
        std::fs::create_dir_all(&nested).unwrap();
        write_image_archive(
            &nested.join("c-bundle.tar"),
            &["rancher/rke2-runtime:v1.2.3"],
            &[vec![("bin/kubelet", b"kubelet")]],
        );

        let locator = LocalImageLocator::new(dir.path());
        let image = locator
            .find(&reference("rancher/rke2-runtime:v1.2.3"))
            .unwrap();
        assert!(image.is_some());
    }

    #[test]
    fn test_tag_absent_is_miss() {
        let dir = TempDir::new().unwrap();
        write_image_archive(
            &dir.path().join("bundle.tar"),
            &["rancher/rke2-runtime:v1.2.3"],
            &[vec![("bin/kubelet", b"kubelet")]],
        );

        let locator = LocalImageLocator::new(dir.path());
        let found = locator.find(&reference("rancher/rke2-runtime:v2.0.0")).unwrap();
        assert!(found.is_none());
    }

    #[test]
    fn test_digest_reference_is_miss() {
        let dir = TempDir::new().unwrap();
        let locator = LocalImageLocator::new(dir.path());
        let found = locator
            .find(&reference("rancher/rke2-runtime@sha256:deadbeef"))
            .unwrap();
        assert!(found.is_none());
    }

    #[test]
    fn test_resolve_retries_default_registry() {
        let dir = TempDir::new().unwrap();
        write_image_archive(
            &dir.path().join("bundle.tar"),
            &["rancher/rke2-runtime:v1.2.3"],
            &[vec![("bin/kubelet", b"kubelet")]],
        );

        let locator = LocalImageLocator::new(dir.path());
        let image = locator
            .resolve(&reference("registry.example.com/rancher/rke2-runtime:v1.2.3"))
            .unwrap();
        assert_eq!(image.reference().registry, "docker.io");
    }

    #[test]
    fn test_resolve_prefers_configured_registry() {
        let dir = TempDir::new().unwrap();
        write_image_archive(
            &dir.path().join("bundle.tar"),
            &[
                "registry.example.com/rancher/rke2-runtime:v1.2.3",
                "rancher/rke2-runtime:v1.2.3",
            ],
            &[vec![("bin/kubelet", b"kubelet")]],
        );

        let locator = LocalImageLocator::new(dir.path());
        let image = locator
            .resolve(&reference("registry.example.com/rancher/rke2-runtime:v1.2.3"))
            .unwrap();
        assert_eq!(image.reference().registry, "registry.example.com");
    }
}
