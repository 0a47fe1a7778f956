//! Registry credential sources.
//!
//! Credentials are looked up through a [`MultiKeychain`]: the private
//! registry configuration (`registries.yaml`) first, then the Docker client
//! config, then `REGISTRY_USERNAME` / `REGISTRY_PASSWORD`. The first source
//! with an entry for the registry wins; anonymous access is the last resort.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use base64::Engine;
use nodeboot_core::error::{Result, StageError};
use serde::Deserialize;

use super::reference::normalize_registry;
use super::registry::RegistryAuth;

/// Authentication section of a registry entry.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// base64("username:password")
    #[serde(default)]
    pub auth: Option<String>,
}

/// TLS section of a registry entry.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TlsConfig {
    #[serde(default)]
    pub ca_file: Option<PathBuf>,
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

/// Per-registry settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegistryConfig {
    #[serde(default)]
    pub auth: Option<AuthConfig>,
    #[serde(default)]
    pub tls: Option<TlsConfig>,
}

/// Private registry configuration, as read from `registries.yaml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PrivateRegistries {
    #[serde(default)]
    configs: HashMap<String, RegistryConfig>,
}

impl PrivateRegistries {
    /// Load the configuration file. A missing file means no private registries.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(path).map_err(|e| {
            StageError::Config(format!(
                "Failed to read private registry configuration {}: {}",
                path.display(),
                e
            ))
        })?;
        let mut registries: Self = serde_yaml::from_str(&data).map_err(|e| {
            StageError::Config(format!(
                "Failed to parse private registry configuration {}: {}",
                path.display(),
                e
            ))
        })?;
        registries.configs = registries
            .configs
            .into_iter()
            .map(|(name, config)| (normalize_registry(&name), config))
            .collect();
        Ok(registries)
    }

    /// Settings for a registry, if configured.
    pub fn get(&self, registry: &str) -> Option<&RegistryConfig> {
        self.configs.get(&normalize_registry(registry))
    }

    /// TLS settings for a registry, if configured.
    pub fn tls(&self, registry: &str) -> Option<&TlsConfig> {
        self.get(registry).and_then(|c| c.tls.as_ref())
    }
}

/// A source of registry credentials.
pub trait Keychain: Send + Sync {
    /// Credentials for `registry`, or `None` when this source has no entry.
    fn resolve(&self, registry: &str) -> Result<Option<RegistryAuth>>;
}

impl Keychain for PrivateRegistries {
    fn resolve(&self, registry: &str) -> Result<Option<RegistryAuth>> {
        let Some(auth) = self.get(registry).and_then(|c| c.auth.as_ref()) else {
            return Ok(None);
        };

        if let (Some(username), Some(password)) = (&auth.username, &auth.password) {
            return Ok(Some(RegistryAuth::basic(username, password)));
        }
        if let Some(ref encoded) = auth.auth {
            let (username, password) = decode_auth(encoded)?;
            return Ok(Some(RegistryAuth::basic(username, password)));
        }
        Ok(None)
    }
}

/// Entry of the Docker client config `auths` map.
#[derive(Debug, Deserialize)]
struct DockerAuthEntry {
    #[serde(default)]
    auth: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct DockerConfigFile {
    #[serde(default)]
    auths: HashMap<String, DockerAuthEntry>,
}

/// Credentials saved by `docker login`.
#[derive(Debug, Clone)]
pub struct DockerConfigKeychain {
    path: Option<PathBuf>,
}

impl DockerConfigKeychain {
    /// Use `$DOCKER_CONFIG/config.json`, or `~/.docker/config.json`.
    pub fn from_env() -> Self {
        let path = std::env::var_os("DOCKER_CONFIG")
            .map(PathBuf::from)
            .or_else(|| dirs::home_dir().map(|home| home.join(".docker")))
            .map(|dir| dir.join("config.json"));
        Self { path }
    }

    /// Use a specific config file.
    pub fn new(path: PathBuf) -> Self {
        Self { path: Some(path) }
    }

    fn load(&self) -> Result<DockerConfigFile> {
        let Some(ref path) = self.path else {
            return Ok(DockerConfigFile::default());
        };
        if !path.exists() {
            return Ok(DockerConfigFile::default());
        }
        let data = std::fs::read_to_string(path).map_err(|e| {
            StageError::Config(format!(
                "Failed to read docker config {}: {}",
                path.display(),
                e
            ))
        })?;
        serde_json::from_str(&data).map_err(|e| {
            StageError::Config(format!(
                "Failed to parse docker config {}: {}",
                path.display(),
                e
            ))
        })
    }
}

impl Keychain for DockerConfigKeychain {
    fn resolve(&self, registry: &str) -> Result<Option<RegistryAuth>> {
        let file = self.load()?;
        let wanted = normalize_registry(registry);

        let entry = file
            .auths
            .iter()
            .find(|(key, _)| normalize_registry(strip_scheme(key)) == wanted)
            .map(|(_, entry)| entry);

        match entry.and_then(|e| e.auth.as_deref()) {
            Some(encoded) => {
                let (username, password) = decode_auth(encoded)?;
                Ok(Some(RegistryAuth::basic(username, password)))
            }
            None => Ok(None),
        }
    }
}

/// Credentials from `REGISTRY_USERNAME` and `REGISTRY_PASSWORD`, for any registry.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvKeychain;

impl Keychain for EnvKeychain {
    fn resolve(&self, _registry: &str) -> Result<Option<RegistryAuth>> {
        let username = std::env::var("REGISTRY_USERNAME").ok();
        let password = std::env::var("REGISTRY_PASSWORD").ok();
        Ok(match (username, password) {
            (Some(u), Some(p)) => Some(RegistryAuth::basic(u, p)),
            _ => None,
        })
    }
}

/// Ordered chain of keychains.
#[derive(Default)]
pub struct MultiKeychain {
    keychains: Vec<Box<dyn Keychain>>,
}

impl MultiKeychain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Private registries, then the Docker client config, then the environment.
    pub fn with_defaults(private: PrivateRegistries) -> Self {
        Self::new()
            .with(private)
            .with(DockerConfigKeychain::from_env())
            .with(EnvKeychain)
    }

    /// Append a keychain at the lowest priority.
    pub fn with(mut self, keychain: impl Keychain + 'static) -> Self {
        self.keychains.push(Box::new(keychain));
        self
    }

    /// Credentials for `registry` from the first keychain that has them,
    /// or anonymous.
    pub fn resolve(&self, registry: &str) -> Result<RegistryAuth> {
        for keychain in &self.keychains {
            if let Some(auth) = keychain.resolve(registry)? {
                return Ok(auth);
            }
        }
        Ok(RegistryAuth::anonymous())
    }
}

/// Decode a base64 `username:password` pair.
fn decode_auth(encoded: &str) -> Result<(String, String)> {
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|e| StageError::Config(format!("Invalid base64 registry auth: {}", e)))?;
    let decoded = String::from_utf8(decoded)
        .map_err(|e| StageError::Config(format!("Invalid registry auth encoding: {}", e)))?;
    let (username, password) = decoded
        .split_once(':')
        .ok_or_else(|| StageError::Config("Registry auth must be username:password".to_string()))?;
    Ok((username.to_string(), password.to_string()))
}

/// Docker keys entries like `https://index.docker.io/v1/`.
fn strip_scheme(key: &str) -> &str {
    let key = key
        .strip_prefix("https://")
        .or_else(|| key.strip_prefix("http://"))
        .unwrap_or(key);
    key.split('/').next().unwrap_or(key)
}
