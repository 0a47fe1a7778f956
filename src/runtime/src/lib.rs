//! Nodeboot Runtime - runtime image staging.
//!
//! Resolves the runtime image from local airgap archives or a registry,
//! extracts its binaries and chart manifests into the data directory, and
//! patches the charts for the node's configuration.

#![allow(clippy::result_large_err)]

pub mod cache;
pub mod charts;
pub mod oci;
pub mod stage;

// Re-export common types
pub use cache::{CachedImage, LayerCache};
pub use charts::{HelmChart, ManifestRewriter};
pub use oci::{
    ArchiveFormat, ArchiveImage, ArchiveReader, Image, ImageReference, Layer, LocalImageLocator,
    MultiKeychain, PrivateRegistries, RegistryAuth, RemoteFetcher, RemoteImage,
};
pub use stage::{extract_to_dirs, stage, ExtractionPlan, StagingArea};

/// Nodeboot Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
