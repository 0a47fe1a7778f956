//! Resolved image abstraction.
//!
//! An [`Image`] is anything that can list its layers and hand out a readable
//! copy of each layer blob: a local archive, a remote registry image, or
//! either of those wrapped in the layer cache.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};

use async_trait::async_trait;
use nodeboot_core::error::Result;

use super::reference::ImageReference;

/// A filesystem layer of an image, bottom to top.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layer {
    /// Content digest of the blob (e.g., "sha256:abc123...")
    pub digest: String,
    /// Blob size in bytes, when the source advertises it
    pub size: Option<u64>,
}

impl Layer {
    pub fn new(digest: impl Into<String>) -> Self {
        Self {
            digest: digest.into(),
            size: None,
        }
    }
}

/// A resolved image whose layer blobs can be read.
#[async_trait]
pub trait Image: Send + Sync {
    /// Reference the image was resolved for.
    fn reference(&self) -> &ImageReference;

    /// Layers in application order (bottom first).
    fn layers(&self) -> &[Layer];

    /// Open a layer blob, positioned at its start.
    ///
    /// The blob is returned as stored by the source: plain tar, gzip or zstd.
    async fn open_layer(&self, layer: &Layer) -> Result<File>;
}

#[async_trait]
impl<I: Image + ?Sized> Image for Box<I> {
    fn reference(&self) -> &ImageReference {
        (**self).reference()
    }

    fn layers(&self) -> &[Layer] {
        (**self).layers()
    }

    async fn open_layer(&self, layer: &Layer) -> Result<File> {
        (**self).open_layer(layer).await
    }
}

/// Copy `reader` into an anonymous temporary file and rewind it.
///
/// The file is unlinked on creation and vanishes when the handle is dropped.
pub(crate) fn spool(reader: &mut impl Read) -> io::Result<File> {
    let mut file = tempfile::tempfile()?;
    io::copy(reader, &mut file)?;
    file.seek(SeekFrom::Start(0))?;
    Ok(file)
}
