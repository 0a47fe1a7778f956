//! OCI image reference parsing.
//!
//! Parses image references like `docker.io/rancher/rke2-runtime:v1.21.4-rke2r2`
//! into structured components, and derives the runtime identity used to name
//! per-image directories on disk.

use nodeboot_core::error::{Result, StageError};
use sha2::{Digest, Sha256};

/// Default registry when none is specified.
pub const DEFAULT_REGISTRY: &str = "docker.io";

/// Docker Hub's registry host as spelled in canonical reference names.
const DOCKER_HUB_INDEX: &str = "index.docker.io";

/// Number of hex characters of the reference hash kept in a runtime identity.
const IDENTITY_HASH_LEN: usize = 12;

/// Default tag when none is specified.
const DEFAULT_TAG: &str = "latest";

/// Parsed OCI image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry hostname (e.g., "ghcr.io", "docker.io")
    pub registry: String,
    /// Repository path (e.g., "rancher/rke2-runtime")
    pub repository: String,
    /// Tag (e.g., "latest", "v0.1.0")
    pub tag: Option<String>,
    /// Digest (e.g., "sha256:abc123...")
    pub digest: Option<String>,
}

impl ImageReference {
    /// Parse an image reference string.
    ///
    /// Supports formats:
    /// - `rancher/rke2-runtime:v1.2.3` → docker.io/rancher/rke2-runtime:v1.2.3
    /// - `registry.example.com:5000/rancher/rke2-runtime:v1.2.3`
    /// - `rancher/rke2-runtime@sha256:abc...`
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(StageError::Config("Empty image reference".to_string()));
        }

        // Split off digest first (@ separator)
        let (name_tag, digest) = if let Some(at_pos) = reference.rfind('@') {
            let digest_part = &reference[at_pos + 1..];
            if !digest_part.contains(':') {
                return Err(StageError::Config(format!(
                    "Invalid digest format in reference '{}': expected algorithm:hex",
                    reference
                )));
            }
            (&reference[..at_pos], Some(digest_part.to_string()))
        } else {
            (reference, None)
        };

        // Split tag (: separator, but only after the last /)
        let (name, tag) = if digest.is_some() {
            // If we have a digest, tag is in name_tag only if explicitly present
            if let Some(slash_pos) = name_tag.rfind('/') {
                let after_slash = &name_tag[slash_pos + 1..];
                if let Some(colon_pos) = after_slash.rfind(':') {
                    let tag = &after_slash[colon_pos + 1..];
                    let name = &name_tag[..slash_pos + 1 + colon_pos];
                    (name.to_string(), Some(tag.to_string()))
                } else {
                    (name_tag.to_string(), None)
                }
            } else if let Some(colon_pos) = name_tag.rfind(':') {
                let tag = &name_tag[colon_pos + 1..];
                let name = &name_tag[..colon_pos];
                (name.to_string(), Some(tag.to_string()))
            } else {
                (name_tag.to_string(), None)
            }
        } else {
            // No digest; split on last colon after last slash
            if let Some(slash_pos) = name_tag.rfind('/') {
                let after_slash = &name_tag[slash_pos + 1..];
                if let Some(colon_pos) = after_slash.rfind(':') {
                    let tag = &after_slash[colon_pos + 1..];
                    let name = &name_tag[..slash_pos + 1 + colon_pos];
                    (name.to_string(), Some(tag.to_string()))
                } else {
                    (name_tag.to_string(), None)
                }
            } else if let Some(colon_pos) = name_tag.rfind(':') {
                // Could be registry:port or name:tag; check if after colon is numeric (port)
                let after_colon = &name_tag[colon_pos + 1..];
                if after_colon.chars().all(|c| c.is_ascii_digit()) {
                    // Looks like a port, treat whole thing as name
                    (name_tag.to_string(), None)
                } else {
                    let tag = after_colon;
                    let name = &name_tag[..colon_pos];
                    (name.to_string(), Some(tag.to_string()))
                }
            } else {
                (name_tag.to_string(), None)
            }
        };

        // Determine registry and repository
        let (registry, repository) = Self::split_registry_repository(&name)?;

        // Apply default tag if no tag and no digest
        let tag = if tag.is_none() && digest.is_none() {
            Some(DEFAULT_TAG.to_string())
        } else {
            tag
        };

        Ok(ImageReference {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Split a name into registry and repository components.
    fn split_registry_repository(name: &str) -> Result<(String, String)> {
        // Check if the first component looks like a registry hostname
        // (contains a dot or colon, or is "localhost")
        if let Some(slash_pos) = name.find('/') {
            let first = &name[..slash_pos];
            if first.contains('.') || first.contains(':') || first == "localhost" {
                let registry = normalize_registry(first);
                let repo = name[slash_pos + 1..].to_string();
                if repo.is_empty() {
                    return Err(StageError::Config(format!(
                        "Empty repository in reference '{}'",
                        name
                    )));
                }
                return Ok((registry, repo));
            }
        }

        // No registry detected, use default
        let repository = if name.contains('/') {
            name.to_string()
        } else {
            // Official Docker Hub images live under "library/"
            format!("library/{}", name)
        };

        Ok((DEFAULT_REGISTRY.to_string(), repository))
    }

    /// Whether this reference pins a digest (a digest wins over a tag).
    pub fn is_digest(&self) -> bool {
        self.digest.is_some()
    }

    /// The same repository and tag/digest under another registry.
    pub fn with_registry(&self, registry: &str) -> Self {
        Self {
            registry: normalize_registry(registry),
            ..self.clone()
        }
    }

    /// Derive a stable, filesystem-safe identity for this reference.
    ///
    /// - digest references yield the digest hex with the algorithm stripped
    /// - release tags (`v` followed by a digit) yield
    ///   `<tag>-<first 12 hex of sha256(canonical name)>`
    ///
    /// Anything else may be a mutable tag and is rejected.
    pub fn runtime_identity(&self) -> Result<String> {
        if let Some(ref digest) = self.digest {
            let hex = match digest.split_once(':') {
                Some((_, hex)) => hex,
                None => digest.as_str(),
            };
            return Ok(hex.to_string());
        }

        match self.tag {
            Some(ref tag) if is_release_tag(tag) => {
                let hash = hex::encode(Sha256::digest(self.canonical_name().as_bytes()));
                Ok(format!("{}-{}", tag, &hash[..IDENTITY_HASH_LEN]))
            }
            _ => Err(StageError::InvalidReference {
                reference: self.full_reference(),
                message: "not a reference to a digest or version tag (^v[0-9])".to_string(),
            }),
        }
    }

    /// The reference as canonically named by registry clients, with Docker
    /// Hub spelled `index.docker.io`. Identities hash this string so that
    /// directory names match other tooling on the node.
    pub fn canonical_name(&self) -> String {
        if self.registry == DEFAULT_REGISTRY {
            format!("{}{}", DOCKER_HUB_INDEX, &self.full_reference()[DEFAULT_REGISTRY.len()..])
        } else {
            self.full_reference()
        }
    }

    /// Get the full reference string.
    pub fn full_reference(&self) -> String {
        let mut s = format!("{}/{}", self.registry, self.repository);
        if let Some(ref tag) = self.tag {
            s.push(':');
            s.push_str(tag);
        }
        if let Some(ref digest) = self.digest {
            s.push('@');
            s.push_str(digest);
        }
        s
    }
}

/// Whether a tag looks like a release version (`^v[0-9]`).
fn is_release_tag(tag: &str) -> bool {
    tag.strip_prefix('v')
        .and_then(|rest| rest.chars().next())
        .is_some_and(|c| c.is_ascii_digit())
}

/// Fold Docker Hub aliases into `docker.io` so references compare equal.
pub fn normalize_registry(registry: &str) -> String {
    let r = registry.trim().to_lowercase();
    if r == DOCKER_HUB_INDEX || r == "registry-1.docker.io" {
        DEFAULT_REGISTRY.to_string()
    } else {
        r
    }
}

impl std::str::FromStr for ImageReference {
    type Err = StageError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full_reference())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str = "sha256:abcdef1234567890abcdef1234567890abcdef1234567890abcdef1234567890";

    #[test]
    fn test_parse_default_registry() {
        let r = ImageReference::parse("rancher/rke2-runtime:v1.21.4-rke2r2").unwrap();
        assert_eq!(r.registry, "docker.io");
        assert_eq!(r.repository, "rancher/rke2-runtime");
        assert_eq!(r.tag, Some("v1.21.4-rke2r2".to_string()));
        assert_eq!(r.digest, None);
    }

    #[test]
    fn test_parse_private_registry_with_port() {
        let r = ImageReference::parse("registry.example.com:5000/rancher/rke2-runtime:v1.2.3").unwrap();
        assert_eq!(r.registry, "registry.example.com:5000");
        assert_eq!(r.repository, "rancher/rke2-runtime");
        assert_eq!(r.tag, Some("v1.2.3".to_string()));
    }

    #[test]
    fn test_parse_without_tag_defaults_to_latest() {
        let r = ImageReference::parse("registry.example.com/rancher/rke2-runtime").unwrap();
        assert_eq!(r.tag, Some("latest".to_string()));
    }

    #[test]
    fn test_parse_digest() {
        let r = ImageReference::parse(&format!("rancher/rke2-runtime@{}", DIGEST)).unwrap();
        assert_eq!(r.repository, "rancher/rke2-runtime");
        assert_eq!(r.tag, None);
        assert_eq!(r.digest, Some(DIGEST.to_string()));
        assert!(r.is_digest());
    }

    #[test]
    fn test_parse_tag_and_digest() {
        let r = ImageReference::parse("localhost/rancher/rke2-runtime:v1.2.3@sha256:abcdef").unwrap();
        assert_eq!(r.registry, "localhost");
        assert_eq!(r.tag, Some("v1.2.3".to_string()));
        assert_eq!(r.digest, Some("sha256:abcdef".to_string()));
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(ImageReference::parse("").is_err());
        assert!(ImageReference::parse("   ").is_err());
        assert!(ImageReference::parse("rancher/rke2-runtime@deadbeef").is_err());
        assert!(ImageReference::parse("registry.example.com/").is_err());
    }

    #[test]
    fn test_parse_trims_whitespace() {
        let r = ImageReference::parse("  rancher/rke2-runtime:v1.2.3\n").unwrap();
        assert_eq!(r.full_reference(), "docker.io/rancher/rke2-runtime:v1.2.3");
    }

    #[test]
    fn test_display_with_digest() {
        let r = ImageReference::parse("ghcr.io/rancher/rke2-runtime:v1.2.3@sha256:abc123").unwrap();
        assert_eq!(r.to_string(), "ghcr.io/rancher/rke2-runtime:v1.2.3@sha256:abc123");
    }

    #[test]
    fn test_parse_docker_hub_alias_normalized() {
        let r = ImageReference::parse("index.docker.io/rancher/rke2-runtime:v1.2.3").unwrap();
        assert_eq!(r.registry, "docker.io");
        assert_eq!(r, ImageReference::parse("rancher/rke2-runtime:v1.2.3").unwrap());
        assert_eq!(normalize_registry("Registry-1.Docker.io"), "docker.io");
    }

    #[test]
    fn test_with_registry() {
        let r = ImageReference::parse("registry.example.com/rancher/rke2-runtime:v1.2.3").unwrap();
        let d = r.with_registry("index.docker.io");
        assert_eq!(d.full_reference(), "docker.io/rancher/rke2-runtime:v1.2.3");
    }

    #[test]
    fn test_canonical_name() {
        let hub = ImageReference::parse("rancher/rke2-runtime:v1.2.3").unwrap();
        assert_eq!(hub.canonical_name(), "index.docker.io/rancher/rke2-runtime:v1.2.3");
        let private = hub.with_registry("registry.example.com");
        assert_eq!(private.canonical_name(), "registry.example.com/rancher/rke2-runtime:v1.2.3");
    }

    #[test]
    fn test_identity_for_version_tag() {
        let r = ImageReference::parse("rancher/rke2-runtime:v1.2.3").unwrap();
        let hash = hex::encode(Sha256::digest(
            "index.docker.io/rancher/rke2-runtime:v1.2.3".as_bytes(),
        ));
        let id = r.runtime_identity().unwrap();
        assert_eq!(id, format!("v1.2.3-{}", &hash[..12]));
        assert_eq!(id, "v1.2.3-31c931901200");
        // Every Docker Hub spelling names the same directory.
        let alias = ImageReference::parse("docker.io/rancher/rke2-runtime:v1.2.3").unwrap();
        assert_eq!(alias.runtime_identity().unwrap(), id);
    }

    #[test]
    fn test_identity_differs_per_registry() {
        let a = ImageReference::parse("rancher/rke2-runtime:v1.2.3").unwrap();
        let b = a.with_registry("registry.example.com");
        assert_ne!(a.runtime_identity().unwrap(), b.runtime_identity().unwrap());
    }

    #[test]
    fn test_identity_for_digest() {
        let r = ImageReference::parse("rancher/rke2-runtime@sha256:deadbeef0123").unwrap();
        assert_eq!(r.runtime_identity().unwrap(), "deadbeef0123");
    }

    #[test]
    fn test_identity_digest_wins_over_tag() {
        let r = ImageReference::parse("rancher/rke2-runtime:latest@sha256:deadbeef").unwrap();
        assert_eq!(r.runtime_identity().unwrap(), "deadbeef");
    }

    #[test]
    fn test_identity_rejects_mutable_tag() {
        let r = ImageReference::parse("rancher/rke2-runtime:latest").unwrap();
        assert!(matches!(
            r.runtime_identity(),
            Err(StageError::InvalidReference { .. })
        ));
        let r = ImageReference::parse("rancher/rke2-runtime:version1").unwrap();
        assert!(r.runtime_identity().is_err());
        let r = ImageReference::parse("rancher/rke2-runtime:v").unwrap();
        assert!(r.runtime_identity().is_err());
    }
}
