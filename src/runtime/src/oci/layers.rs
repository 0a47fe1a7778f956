//! Layer flattening.
//!
//! Presents the layers of an image as one tar stream, the way a container
//! runtime would see the filesystem: upper layers shadow lower ones and
//! whiteout markers hide lower-layer paths.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Component, Path};

use nodeboot_core::error::{Result, StageError};
use tar::{Archive, Entry, EntryType};

use super::archive::{ArchiveFormat, ArchiveReader};
use super::image::{Image, Layer};

const WHITEOUT_PREFIX: &str = ".wh.";
const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

/// Tar entry handed to a flatten visitor.
pub type LayerEntry<'a> = Entry<'a, ArchiveReader>;

/// Walk the flattened filesystem of `image`.
///
/// Layers are read top-down; `visit` is called once per surviving path with
/// the path relative to the image root. Whiteout entries are never visited.
pub async fn flatten<I, F>(image: &I, mut visit: F) -> Result<()>
where
    I: Image + ?Sized,
    F: FnMut(&str, &mut LayerEntry<'_>) -> Result<()>,
{
    // Path -> hides descendants. Directories record false so lower layers can
    // still contribute their children.
    let mut seen: HashMap<String, bool> = HashMap::new();

    for layer in image.layers().iter().rev() {
        let reader = open_layer(image, layer).await?;
        let mut archive = Archive::new(reader);
        let mut opaque_dirs = Vec::new();

        let entries = archive.entries().map_err(|e| layer_error(layer, e))?;
        for entry in entries {
            let mut entry = entry.map_err(|e| layer_error(layer, e))?;
            let raw = entry.path().map_err(|e| layer_error(layer, e))?.into_owned();
            let Some(path) = clean_path(&raw) else {
                tracing::debug!(path = %raw.display(), "Skipping layer entry outside the image root");
                continue;
            };

            let (dir, base) = match path.rsplit_once('/') {
                Some((dir, base)) => (Some(dir), base),
                None => (None, path.as_str()),
            };

            if base == OPAQUE_WHITEOUT {
                if let Some(dir) = dir {
                    opaque_dirs.push(dir.to_string());
                }
                continue;
            }

            let is_dir = entry.header().entry_type() == EntryType::Directory;
            let tombstone = base.starts_with(WHITEOUT_PREFIX);
            let name = if tombstone && !is_dir {
                let target = &base[WHITEOUT_PREFIX.len()..];
                match dir {
                    Some(dir) => format!("{}/{}", dir, target),
                    None => target.to_string(),
                }
            } else {
                path.clone()
            };

            if seen.contains_key(&name) || in_whiteout_dir(&seen, &name) {
                continue;
            }
            seen.insert(name.clone(), tombstone || !is_dir);

            if !tombstone {
                visit(&name, &mut entry)?;
            }
        }

        // An opaque directory hides everything below it in lower layers only.
        for dir in opaque_dirs {
            seen.insert(dir, true);
        }

        archive.into_inner().close().map_err(|e| layer_error(layer, e))?;
    }

    Ok(())
}

/// Open a layer blob and wrap it in the decompressor its magic bytes call for.
async fn open_layer<I: Image + ?Sized>(image: &I, layer: &Layer) -> Result<ArchiveReader> {
    let mut file = image.open_layer(layer).await?;
    let format = detect_compression(&mut file).map_err(|e| layer_error(layer, e))?;
    tracing::trace!(digest = %layer.digest, format = ?format, "Opened layer");
    format.wrap(file).map_err(|e| layer_error(layer, e))
}

/// Sniff the compression of a layer blob, leaving the file at its start.
pub fn detect_compression(file: &mut File) -> io::Result<ArchiveFormat> {
    let mut magic = [0u8; 4];
    let mut filled = 0;
    while filled < magic.len() {
        let n = file.read(&mut magic[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    file.seek(SeekFrom::Start(0))?;

    let magic = &magic[..filled];
    Ok(if magic.starts_with(&GZIP_MAGIC) {
        ArchiveFormat::Gzip
    } else if magic.starts_with(&ZSTD_MAGIC) {
        ArchiveFormat::Zstd
    } else {
        ArchiveFormat::Tar
    })
}

/// True when some ancestor of `name` was deleted by an upper layer.
fn in_whiteout_dir(seen: &HashMap<String, bool>, name: &str) -> bool {
    let mut current = name;
    while let Some((parent, _)) = current.rsplit_once('/') {
        if seen.get(parent).copied().unwrap_or(false) {
            return true;
        }
        current = parent;
    }
    false
}

/// Normalize a tar path to `a/b/c`. Returns `None` for the root and for
/// paths escaping it.
fn clean_path(path: &Path) -> Option<String> {
    let mut parts: Vec<&str> = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?),
            Component::CurDir | Component::RootDir => {}
            Component::ParentDir => {
                parts.pop()?;
            }
            Component::Prefix(_) => return None,
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

fn layer_error(layer: &Layer, err: impl std::fmt::Display) -> StageError {
    StageError::Archive(format!("Failed to read layer {}: {}", layer.digest, err))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::oci::reference::ImageReference;
    use async_trait::async_trait;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use tar::{Builder, Header};

    pub(crate) enum TestEntry<'a> {
        File(&'a str, &'a [u8], u32),
        Dir(&'a str),
        Symlink(&'a str, &'a str),
    }

    /// Build an uncompressed tar layer.
    pub(crate) fn tar_layer(entries: &[TestEntry]) -> Vec<u8> {
        let mut builder = Builder::new(Vec::new());
        for entry in entries {
            let mut header = Header::new_gnu();
            match entry {
                TestEntry::File(name, content, mode) => {
                    header.set_size(content.len() as u64);
                    header.set_mode(*mode);
                    header.set_cksum();
                    builder.append_data(&mut header, name, *content).unwrap();
                }
                TestEntry::Dir(name) => {
                    header.set_entry_type(EntryType::Directory);
                    header.set_size(0);
                    header.set_mode(0o755);
                    header.set_cksum();
                    builder.append_data(&mut header, name, io::empty()).unwrap();
                }
                TestEntry::Symlink(name, target) => {
                    header.set_entry_type(EntryType::Symlink);
                    header.set_size(0);
                    header.set_mode(0o777);
                    builder.append_link(&mut header, name, target).unwrap();
                }
            }
        }
        builder.into_inner().unwrap()
    }

    pub(crate) fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    /// Image whose layer blobs live in memory.
    pub(crate) struct MemoryImage {
        pub reference: ImageReference,
        pub layers: Vec<Layer>,
        pub blobs: Vec<Vec<u8>>,
    }

    impl MemoryImage {
        pub(crate) fn new(reference: &str, blobs: Vec<Vec<u8>>) -> Self {
            use sha2::{Digest, Sha256};
            let layers = blobs
                .iter()
                .map(|b| Layer {
                    digest: format!("sha256:{}", hex::encode(Sha256::digest(b))),
                    size: Some(b.len() as u64),
                })
                .collect();
            Self {
                reference: ImageReference::parse(reference).unwrap(),
                layers,
                blobs,
            }
        }
    }

    #[async_trait]
    impl Image for MemoryImage {
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
                .ok_or_else(|| StageError::Other(format!("unknown layer {}", layer.digest)))?;
            Ok(crate::oci::image::spool(&mut self.blobs[index].as_slice())?)
        }
    }

    async fn collect(image: &MemoryImage) -> Vec<(String, String)> {
        let mut out = Vec::new();
        flatten(image, |name, entry| {
            let mut content = String::new();
            if entry.header().entry_type().is_file() {
                entry.read_to_string(&mut content)?;
            }
            out.push((name.to_string(), content));
            Ok(())
        })
        .await
        .unwrap();
        out.sort();
        out
    }

    #[tokio::test]
    async fn test_upper_layer_shadows_lower() {
        let lower = tar_layer(&[
            TestEntry::Dir("bin/"),
            TestEntry::File("bin/kubelet", b"old", 0o755),
            TestEntry::File("bin/crictl", b"crictl", 0o755),
        ]);
        let upper = tar_layer(&[TestEntry::File("bin/kubelet", b"new", 0o755)]);
        let image = MemoryImage::new("rancher/rke2-runtime:v1.2.3", vec![lower, gzip(&upper)]);

        let entries = collect(&image).await;
        assert_eq!(
            entries,
            vec![
                ("bin".to_string(), String::new()),
                ("bin/crictl".to_string(), "crictl".to_string()),
                ("bin/kubelet".to_string(), "new".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_whiteout_hides_lower_file_and_dir() {
        let lower = tar_layer(&[
            TestEntry::File("bin/removed", b"x", 0o755),
            TestEntry::Dir("charts/old/"),
            TestEntry::File("charts/old/chart.yaml", b"old", 0o644),
            TestEntry::File("charts/kept.yaml", b"kept", 0o644),
        ]);
        let upper = tar_layer(&[
            TestEntry::File("bin/.wh.removed", b"", 0o644),
            TestEntry::File("charts/.wh.old", b"", 0o644),
        ]);
        let image = MemoryImage::new("rancher/rke2-runtime:v1.2.3", vec![lower, upper]);

        let names: Vec<String> = collect(&image).await.into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["charts/kept.yaml".to_string()]);
    }

    #[tokio::test]
    async fn test_opaque_whiteout_applies_to_lower_layers_only() {
        let lower = tar_layer(&[TestEntry::File("charts/lower.yaml", b"lower", 0o644)]);
        let upper = tar_layer(&[
            TestEntry::File("charts/.wh..wh..opq", b"", 0o644),
            TestEntry::File("charts/upper.yaml", b"upper", 0o644),
        ]);
        let image = MemoryImage::new("rancher/rke2-runtime:v1.2.3", vec![lower, upper]);

        let names: Vec<String> = collect(&image).await.into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["charts/upper.yaml".to_string()]);
    }

    #[tokio::test]
    async fn test_symlinks_and_dot_prefix() {
        let layer = tar_layer(&[
            TestEntry::File("./bin/containerd", b"c", 0o755),
            TestEntry::Symlink("bin/ctr", "containerd"),
        ]);
        let image = MemoryImage::new("rancher/rke2-runtime:v1.2.3", vec![layer]);

        let names: Vec<String> = collect(&image).await.into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["bin/containerd".to_string(), "bin/ctr".to_string()]);
    }

    #[tokio::test]
    async fn test_corrupt_layer_is_error() {
        let image = MemoryImage::new("rancher/rke2-runtime:v1.2.3", vec![gzip(b"not a tar")[..10].to_vec()]);
        let result = flatten(&image, |_, _| Ok(())).await;
        assert!(result.is_err());
    }

    #[test]
    fn test_detect_compression() {
        let mut plain = crate::oci::image::spool(&mut tar_layer(&[]).as_slice()).unwrap();
        assert_eq!(detect_compression(&mut plain).unwrap(), ArchiveFormat::Tar);

        let mut gz = crate::oci::image::spool(&mut gzip(b"data").as_slice()).unwrap();
        assert_eq!(detect_compression(&mut gz).unwrap(), ArchiveFormat::Gzip);

        let zst = zstd::encode_all(&b"data"[..], 0).unwrap();
        let mut zst = crate::oci::image::spool(&mut zst.as_slice()).unwrap();
        assert_eq!(detect_compression(&mut zst).unwrap(), ArchiveFormat::Zstd);
        assert_eq!(zst.stream_position().unwrap(), 0);

        let mut empty = tempfile::tempfile().unwrap();
        assert_eq!(detect_compression(&mut empty).unwrap(), ArchiveFormat::Tar);
    }

    #[test]
    fn test_clean_path() {
        assert_eq!(clean_path(Path::new("./bin/kubelet")), Some("bin/kubelet".to_string()));
        assert_eq!(clean_path(Path::new("/charts/")), Some("charts".to_string()));
        assert_eq!(clean_path(Path::new("./")), None);
        assert_eq!(clean_path(Path::new("../etc/passwd")), None);
    }

    #[test]
    fn test_in_whiteout_dir() {
        let mut seen = HashMap::new();
        seen.insert("charts".to_string(), false);
        seen.insert("charts/old".to_string(), true);
        assert!(in_whiteout_dir(&seen, "charts/old/a.yaml"));
        assert!(!in_whiteout_dir(&seen, "charts/new.yaml"));
    }
}
