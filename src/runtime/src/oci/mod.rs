//! Image resolution for the bootstrap runtime image.
//!
//! An image is resolved from local airgap archives when possible and from a
//! registry otherwise. Either way the result is an [`Image`] whose layers can
//! be flattened into one filesystem view.
//!
//! ```text
//! ImageReference ──► LocalImageLocator ──► ArchiveImage ─┐
//!        │                 (miss)                        ├──► CachedImage ──► flatten
//!        └────────────► RemoteFetcher ──► RemoteImage ───┘
//! ```

pub mod archive;
pub mod credentials;
mod image;
pub mod layers;
pub mod locator;
pub mod reference;
pub mod registry;
pub mod tarball;

pub use archive::{ArchiveFormat, ArchiveReader, Closer};
pub use credentials::{DockerConfigKeychain, EnvKeychain, Keychain, MultiKeychain, PrivateRegistries};
pub use image::{Image, Layer};
pub use layers::{flatten, LayerEntry};
pub use locator::LocalImageLocator;
pub use reference::{ImageReference, DEFAULT_REGISTRY};
pub use registry::{RegistryAuth, RemoteFetcher, RemoteImage};
pub use tarball::ArchiveImage;
