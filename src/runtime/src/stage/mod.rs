//! Runtime image staging.
//!
//! [`stage`] takes the configured runtime image and lays its binaries and
//! chart manifests out under the data directory:
//!
//! ```text
//! <dataDir>/
//! ├── bin -> data/<identity>/bin
//! ├── data/<identity>/bin/        (binaries, extracted once per identity)
//! ├── server/manifests/           (charts, refreshed on every run)
//! └── agent/
//!     ├── images/                 (airgap archives, read only)
//!     └── cache/runtime/          (layer cache)
//! ```
//!
//! Callers must not run two stages against the same data directory at once.

mod extract;
mod placement;

pub use extract::{extract, ExtractionPlan, StagingArea};
pub use placement::place;

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use nodeboot_core::config::StageConfig;
use nodeboot_core::error::{Result, StageError};

use crate::cache::{CachedImage, LayerCache};
use crate::charts::ManifestRewriter;
use crate::oci::{
    Image, ImageReference, LocalImageLocator, MultiKeychain, PrivateRegistries, RemoteFetcher,
    DEFAULT_REGISTRY,
};

/// Image directory holding binaries.
pub const BIN_SUBTREE: &str = "bin";

/// Image directory holding chart manifests.
pub const CHARTS_SUBTREE: &str = "charts";

/// Resolve the runtime image reference, re-homed under the system default
/// registry when one is configured.
pub fn runtime_reference(config: &StageConfig) -> Result<ImageReference> {
    let reference = ImageReference::parse(&config.runtime_image).map_err(|e| {
        StageError::InvalidReference {
            reference: config.runtime_image.clone(),
            message: e.to_string(),
        }
    })?;
    Ok(match config.system_default_registry.as_deref() {
        Some(registry) if !registry.is_empty() && reference.registry == DEFAULT_REGISTRY => {
            reference.with_registry(registry)
        }
        _ => reference,
    })
}

/// Stage the runtime image into the data directory.
///
/// Binaries are extracted only when the bin directory for the image's
/// identity does not exist yet; charts are extracted and rewritten on every
/// call. Returns the bin directory.
pub async fn stage(config: &StageConfig) -> Result<PathBuf> {
    config.validate()?;
    let reference = runtime_reference(config)?;
    let identity = reference.runtime_identity()?;

    let layout = config.layout();
    let bin_dir = layout.bin_dir_for(&identity);
    let manifests_dir = layout.manifests_dir();

    let image = resolve_image(config, &reference).await?;
    let cache = LayerCache::new(&layout.runtime_cache_dir())?;
    let image = CachedImage::new(image, cache);

    // Charts are extracted every time; bin only the first time.
    let mut plan = ExtractionPlan::new().with(CHARTS_SUBTREE, &manifests_dir);
    if bin_dir.is_dir() {
        tracing::info!(
            reference = %reference,
            bin_dir = %bin_dir.display(),
            "Runtime image bin dir already exists; skipping extract"
        );
    } else {
        plan.insert(BIN_SUBTREE, &bin_dir);
    }

    extract_to_dirs(&image, layout.root(), &plan)
        .await
        .map_err(|e| StageError::Extract {
            reference: reference.to_string(),
            source: Box::new(e),
        })?;

    std::fs::set_permissions(&bin_dir, std::fs::Permissions::from_mode(0o755)).map_err(|e| {
        StageError::Placement(format!(
            "Failed to set permissions on {}: {}",
            bin_dir.display(),
            e
        ))
    })?;

    // Run on every call so values follow the current configuration.
    ManifestRewriter::from_config(config).rewrite_dir(&manifests_dir)?;

    replace_symlink(&bin_dir, &layout.symlink_bin_dir());

    tracing::info!(
        reference = %reference,
        bin_dir = %bin_dir.display(),
        "Runtime image staged"
    );
    Ok(bin_dir)
}

/// Find the image in local archives, pulling it from the registry on a miss.
async fn resolve_image(
    config: &StageConfig,
    reference: &ImageReference,
) -> Result<Box<dyn Image>> {
    let locator = LocalImageLocator::new(config.layout().images_dir());
    if let Some(image) = locator.resolve(reference) {
        tracing::info!(
            reference = %reference,
            path = %image.path().display(),
            "Using runtime image from local archive"
        );
        return Ok(Box::new(image));
    }

    let registries = PrivateRegistries::load(&config.private_registry)?;
    let keychain = MultiKeychain::with_defaults(registries.clone());
    let fetcher = RemoteFetcher::new(registries, keychain);
    let image = fetcher.fetch(reference).await?;
    Ok(Box::new(image))
}

/// Extract the planned directories of `image` through a staging area under
/// `data_dir` and move them into place.
pub async fn extract_to_dirs<I: Image + ?Sized>(
    image: &I,
    data_dir: &Path,
    plan: &ExtractionPlan,
) -> Result<()> {
    let staging = StagingArea::create(data_dir)?;
    extract(image, plan, &staging).await?;
    place(staging, plan)
}

/// Point `link` at `target`. Failures are logged and otherwise ignored.
fn replace_symlink(target: &Path, link: &Path) {
    match std::fs::symlink_metadata(link) {
        Ok(meta) if meta.is_dir() => {
            let _ = std::fs::remove_dir_all(link);
        }
        Ok(_) => {
            let _ = std::fs::remove_file(link);
        }
        Err(_) => {}
    }
    if let Err(e) = std::os::unix::fs::symlink(target, link) {
        tracing::warn!(
            link = %link.display(),
            target = %target.display(),
            error = %e,
            "Failed to update bin symlink"
        );
    }
}
