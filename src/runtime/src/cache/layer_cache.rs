//! Content-addressed cache for layer blobs.
//!
//! Each blob is stored by its digest under `cache_dir/<algorithm>/<hex>`, so
//! an image that was fetched or unpacked once is served from disk afterwards.
//! Entries are only ever added: a blob lands under its final name through a
//! rename after its digest was verified.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use nodeboot_core::error::{Result, StageError};
use sha2::{Digest, Sha256};

use crate::oci::{Image, ImageReference, Layer};

/// Content-addressed cache for layer blobs.
#[derive(Debug, Clone)]
pub struct LayerCache {
    /// Root directory for the cache (e.g., <dataDir>/agent/cache/runtime)
    cache_dir: PathBuf,
}

impl LayerCache {
    /// Create a new layer cache at the given directory.
    pub fn new(cache_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(cache_dir).map_err(|e| {
            StageError::Cache(format!(
                "Failed to create layer cache directory {}: {}",
                cache_dir.display(),
                e
            ))
        })?;

        Ok(Self {
            cache_dir: cache_dir.to_path_buf(),
        })
    }

    /// Path a blob is stored at.
    pub fn blob_path(&self, digest: &str) -> Result<PathBuf> {
        let (algorithm, hex) = split_digest(digest)?;
        Ok(self.cache_dir.join(algorithm).join(hex))
    }

    /// Open a cached blob, if present.
    pub fn get(&self, digest: &str) -> Result<Option<File>> {
        let path = self.blob_path(digest)?;
        match File::open(&path) {
            Ok(file) => Ok(Some(file)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StageError::Cache(format!(
                "Failed to open cached layer {}: {}",
                path.display(),
                e
            ))),
        }
    }

    /// Store a blob read from `reader` and return it opened from the cache.
    ///
    /// `sha256` blobs are verified while being written; a mismatch leaves the
    /// cache untouched.
    pub fn put(&self, digest: &str, reader: &mut impl Read) -> Result<File> {
        let path = self.blob_path(digest)?;
        let (algorithm, expected) = split_digest(digest)?;
        let dir = self.cache_dir.join(algorithm);
        std::fs::create_dir_all(&dir).map_err(|e| {
            StageError::Cache(format!(
                "Failed to create cache directory {}: {}",
                dir.display(),
                e
            ))
        })?;

        let mut tmp = tempfile::Builder::new()
            .prefix(".tmp-")
            .tempfile_in(&dir)
            .map_err(|e| {
                StageError::Cache(format!(
                    "Failed to create temporary file in {}: {}",
                    dir.display(),
                    e
                ))
            })?;

        let mut hasher = Sha256::new();
        let mut size = 0u64;
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            tmp.write_all(&buf[..n])?;
            size += n as u64;
        }
        tmp.as_file().sync_all()?;

        if algorithm == "sha256" {
            let actual = hex::encode(hasher.finalize());
            if actual != expected {
                return Err(StageError::Cache(format!(
                    "Layer digest mismatch: expected {}, got sha256:{}",
                    digest, actual
                )));
            }
        }

        let mut file = tmp.persist(&path).map_err(|e| {
            StageError::Cache(format!(
                "Failed to store cached layer {}: {}",
                path.display(),
                e
            ))
        })?;
        file.seek(SeekFrom::Start(0))?;

        tracing::debug!(digest = %digest, size, path = %path.display(), "Cached layer");
        Ok(file)
    }
}

/// Split `alg:hex`, rejecting anything that is not a plain file name.
fn split_digest(digest: &str) -> Result<(&str, &str)> {
    let invalid = || StageError::Cache(format!("Invalid layer digest: {}", digest));
    let (algorithm, hex) = digest.split_once(':').ok_or_else(invalid)?;
    let valid_alg = !algorithm.is_empty()
        && algorithm
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '+' || c == '.' || c == '_' || c == '-');
    let valid_hex = !hex.is_empty() && hex.chars().all(|c| c.is_ascii_hexdigit());
    if valid_alg && valid_hex {
        Ok((algorithm, hex))
    } else {
        Err(invalid())
    }
}

/// An image whose layer blobs are read through a [`LayerCache`].
pub struct CachedImage<I> {
    inner: I,
    cache: LayerCache,
}

impl<I: Image> CachedImage<I> {
    pub fn new(inner: I, cache: LayerCache) -> Self {
        Self { inner, cache }
    }

    pub fn into_inner(self) -> I {
        self.inner
    }
}

#[async_trait]
impl<I: Image> Image for CachedImage<I> {
    fn reference(&self) -> &ImageReference {
        self.inner.reference()
    }

    fn layers(&self) -> &[Layer] {
        self.inner.layers()
    }

    async fn open_layer(&self, layer: &Layer) -> Result<File> {
        if let Some(file) = self.cache.get(&layer.digest)? {
            tracing::trace!(digest = %layer.digest, "Layer cache hit");
            return Ok(file);
        }

        let mut blob = self.inner.open_layer(layer).await?;
        self.cache.put(&layer.digest, &mut blob)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oci::layers::tests::{tar_layer, MemoryImage, TestEntry};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn sha256_digest(data: &[u8]) -> String {
        format!("sha256:{}", hex::encode(Sha256::digest(data)))
    }

    #[test]
    fn test_put_then_get() {
        let dir = TempDir::new().unwrap();
        let cache = LayerCache::new(dir.path()).unwrap();
        let data = b"layer blob";
        let digest = sha256_digest(data);

        assert!(cache.get(&digest).unwrap().is_none());

        let mut stored = cache.put(&digest, &mut &data[..]).unwrap();
        let mut content = Vec::new();
        stored.read_to_end(&mut content).unwrap();
        assert_eq!(content, data);

        let hex = digest.strip_prefix("sha256:").unwrap();
        assert!(dir.path().join("sha256").join(hex).is_file());

        let mut cached = cache.get(&digest).unwrap().unwrap();
        let mut content = Vec::new();
        cached.read_to_end(&mut content).unwrap();
        assert_eq!(content, data);
    }

    #[test]
    fn test_put_digest_mismatch() {
        let dir = TempDir::new().unwrap();
        let cache = LayerCache::new(dir.path()).unwrap();
        let digest = sha256_digest(b"expected");

        let result = cache.put(&digest, &mut &b"tampered"[..]);
        assert!(matches!(result, Err(StageError::Cache(_))));
        assert!(cache.get(&digest).unwrap().is_none());

        // No temporary files are left behind.
        let leftovers = std::fs::read_dir(dir.path().join("sha256")).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn test_invalid_digest() {
        let dir = TempDir::new().unwrap();
        let cache = LayerCache::new(dir.path()).unwrap();
        assert!(cache.blob_path("nocolon").is_err());
        assert!(cache.blob_path("sha256:../../etc").is_err());
        assert!(cache.blob_path("../x:abcd").is_err());
        assert!(cache.blob_path("sha256:abcd").is_ok());
    }

    struct CountingImage {
        inner: MemoryImage,
        opens: AtomicUsize,
    }

    #[async_trait]
    impl Image for CountingImage {
        fn reference(&self) -> &ImageReference {
            self.inner.reference()
        }

        fn layers(&self) -> &[Layer] {
            self.inner.layers()
        }

        async fn open_layer(&self, layer: &Layer) -> Result<File> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            self.inner.open_layer(layer).await
        }
    }

    #[tokio::test]
    async fn test_cached_image_reads_inner_once() {
        let dir = TempDir::new().unwrap();
        let cache = LayerCache::new(dir.path()).unwrap();
        let blob = tar_layer(&[TestEntry::File("bin/kubelet", b"kubelet", 0o755)]);
        let image = CachedImage::new(
            CountingImage {
                inner: MemoryImage::new("rancher/rke2-runtime:v1.2.3", vec![blob.clone()]),
                opens: AtomicUsize::new(0),
            },
            cache.clone(),
        );

        let layer = image.layers()[0].clone();
        for _ in 0..2 {
            let mut file = image.open_layer(&layer).await.unwrap();
            let mut content = Vec::new();
            file.read_to_end(&mut content).unwrap();
            assert_eq!(content, blob);
        }

        assert_eq!(image.into_inner().opens.load(Ordering::SeqCst), 1);
    }
}
