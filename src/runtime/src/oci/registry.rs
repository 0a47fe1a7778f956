//! Remote image fetcher.
//!
//! Uses the `oci-distribution` crate to resolve an image manifest for the
//! current platform and stream layer blobs from the registry on demand.

use std::fs::File;
use std::io::{Seek, SeekFrom};

use async_trait::async_trait;
use nodeboot_core::error::{Result, StageError};
use oci_distribution::client::{
    Certificate, CertificateEncoding, ClientConfig, ClientProtocol,
};
use oci_distribution::manifest::{ImageIndexEntry, OciDescriptor, OciImageManifest};
use oci_distribution::secrets::RegistryAuth as OciRegistryAuth;
use oci_distribution::{Client, Reference};
use tokio::io::AsyncWriteExt;

use super::credentials::{MultiKeychain, PrivateRegistries, TlsConfig};
use super::image::{Image, Layer};
use super::reference::ImageReference;

/// Authentication credentials for a container registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryAuth {
    username: Option<String>,
    password: Option<String>,
}

impl RegistryAuth {
    /// Create anonymous authentication (no credentials).
    pub fn anonymous() -> Self {
        Self {
            username: None,
            password: None,
        }
    }

    /// Create basic authentication with username and password.
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.username.is_none()
    }

    /// Convert to oci-distribution auth type.
    fn to_oci_auth(&self) -> OciRegistryAuth {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => OciRegistryAuth::Basic(u.clone(), p.clone()),
            _ => OciRegistryAuth::Anonymous,
        }
    }
}

/// Fetches images from container registries.
pub struct RemoteFetcher {
    keychain: MultiKeychain,
    registries: PrivateRegistries,
}

impl RemoteFetcher {
    /// Create a fetcher using `registries` for per-registry TLS settings and
    /// `keychain` for credentials.
    pub fn new(registries: PrivateRegistries, keychain: MultiKeychain) -> Self {
        Self {
            keychain,
            registries,
        }
    }

    /// Resolve `reference` to a remote image.
    ///
    /// Only the manifest is fetched here; layer blobs are pulled when opened.
    pub async fn fetch(&self, reference: &ImageReference) -> Result<RemoteImage> {
        let oci_ref = to_oci_reference(reference)?;
        let auth = self.keychain.resolve(&reference.registry)?;
        let client = self.client_for(reference)?;

        tracing::info!(
            reference = %reference,
            anonymous = auth.is_anonymous(),
            "Pulling bootstrap image from registry"
        );

        let oci_auth = auth.to_oci_auth();
        let (manifest, digest) = client
            .pull_image_manifest(&oci_ref, &oci_auth)
            .await
            .map_err(|e| StageError::Registry {
                registry: reference.registry.clone(),
                message: format!("Failed to pull manifest for {}: {}", reference, e),
            })?;

        tracing::debug!(
            reference = %reference,
            digest = %digest,
            layers = manifest.layers.len(),
            "Resolved image manifest"
        );

        Ok(RemoteImage::new(client, oci_ref, reference.clone(), manifest))
    }

    fn client_for(&self, reference: &ImageReference) -> Result<Client> {
        let mut config = ClientConfig {
            protocol: ClientProtocol::Https,
            platform_resolver: Some(Box::new(linux_platform_resolver)),
            ..Default::default()
        };
        if let Some(tls) = self.registries.tls(&reference.registry) {
            apply_tls(&mut config, tls)?;
        }
        Ok(Client::new(config))
    }
}

fn apply_tls(config: &mut ClientConfig, tls: &TlsConfig) -> Result<()> {
    config.accept_invalid_certificates = tls.insecure_skip_verify;
    if let Some(ref ca_file) = tls.ca_file {
        let data = std::fs::read(ca_file).map_err(|e| {
            StageError::Config(format!(
                "Failed to read registry CA file {}: {}",
                ca_file.display(),
                e
            ))
        })?;
        config.extra_root_certificates.push(Certificate {
            encoding: CertificateEncoding::Pem,
            data,
        });
    }
    Ok(())
}

/// An image whose manifest came from a registry.
pub struct RemoteImage {
    client: Client,
    oci_ref: Reference,
    reference: ImageReference,
    descriptors: Vec<OciDescriptor>,
    layers: Vec<Layer>,
}

impl RemoteImage {
    fn new(
        client: Client,
        oci_ref: Reference,
        reference: ImageReference,
        manifest: OciImageManifest,
    ) -> Self {
        let layers = manifest
            .layers
            .iter()
            .map(|d| Layer {
                digest: d.digest.clone(),
                size: u64::try_from(d.size).ok(),
            })
            .collect();
        Self {
            client,
            oci_ref,
            reference,
            descriptors: manifest.layers,
            layers,
        }
    }
}

#[async_trait]
impl Image for RemoteImage {
    fn reference(&self) -> &ImageReference {
        &self.reference
    }

    fn layers(&self) -> &[Layer] {
        &self.layers
    }

    async fn open_layer(&self, layer: &Layer) -> Result<File> {
        let descriptor = self
            .descriptors
            .iter()
            .find(|d| d.digest == layer.digest)
            .ok_or_else(|| StageError::Registry {
                registry: self.reference.registry.clone(),
                message: format!("Layer {} is not part of {}", layer.digest, self.reference),
            })?;

        tracing::debug!(digest = %layer.digest, size = descriptor.size, "Pulling layer");

        let registry_error = |message: String| StageError::Registry {
            registry: self.reference.registry.clone(),
            message,
        };

        let mut file = tempfile::tempfile()?;
        let mut out = tokio::fs::File::from_std(file.try_clone()?);
        self.client
            .pull_blob(&self.oci_ref, descriptor, &mut out)
            .await
            .map_err(|e| registry_error(format!("Failed to pull layer {}: {}", layer.digest, e)))?;
        out.flush().await?;
        drop(out);

        file.seek(SeekFrom::Start(0))?;
        Ok(file)
    }
}

/// Convert an ImageReference to an oci-distribution Reference.
fn to_oci_reference(reference: &ImageReference) -> Result<Reference> {
    let ref_str = if let Some(ref digest) = reference.digest {
        format!("{}/{}@{}", reference.registry, reference.repository, digest)
    } else if let Some(ref tag) = reference.tag {
        format!("{}/{}:{}", reference.registry, reference.repository, tag)
    } else {
        format!("{}/{}:latest", reference.registry, reference.repository)
    };

    ref_str.parse::<Reference>().map_err(|e| StageError::InvalidReference {
        reference: ref_str.clone(),
        message: e.to_string(),
    })
}

/// Platform resolver that selects the linux manifest matching the host architecture.
fn linux_platform_resolver(manifests: &[ImageIndexEntry]) -> Option<String> {
    let arch = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    };

    manifests
        .iter()
        .find(|entry| {
            entry
                .platform
                .as_ref()
                .map_or(false, |p| p.os == "linux" && p.architecture == arch)
        })
        .map(|entry| entry.digest.clone())
}
