//! CLI command definitions and dispatch.

mod identity;
mod rewrite;
mod stage;
mod version;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use nodeboot_core::StageConfig;

/// Nodeboot: stages the runtime image into a node's data directory.
#[derive(Parser)]
#[command(name = "nodeboot", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Command {
    /// Extract binaries and charts from the runtime image
    Stage(stage::StageArgs),
    /// Print the identity a runtime image reference is staged under
    Identity(identity::IdentityArgs),
    /// Re-apply data directory and registry settings to chart manifests
    RewriteManifests(rewrite::RewriteArgs),
    /// Show version information
    Version(version::VersionArgs),
}

/// Configuration file plus per-field overrides.
#[derive(Args, Debug, Default)]
pub struct ConfigArgs {
    /// YAML configuration file
    #[arg(short, long, env = "NODEBOOT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Data directory root
    #[arg(long, env = "NODEBOOT_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Runtime image reference (e.g., "rancher/rke2-runtime:v1.21.4-rke2r2")
    #[arg(long, env = "NODEBOOT_RUNTIME_IMAGE")]
    pub runtime_image: Option<String>,

    /// Registry to pull the runtime image and chart images from
    #[arg(long, env = "NODEBOOT_SYSTEM_DEFAULT_REGISTRY")]
    pub system_default_registry: Option<String>,

    /// Private registry configuration file
    #[arg(long)]
    pub private_registry: Option<PathBuf>,

    /// Helm job image written into chart manifests
    #[arg(long)]
    pub helm_job_image: Option<String>,
}

impl ConfigArgs {
    /// Load the configuration file, if any, and apply flag overrides.
    pub fn load(self) -> Result<StageConfig, Box<dyn std::error::Error>> {
        let mut config = match self.config {
            Some(ref path) => {
                tracing::debug!(path = %path.display(), "Loading configuration file");
                StageConfig::load(path)?
            }
            None => StageConfig::default(),
        };
        if let Some(data_dir) = self.data_dir {
            config.data_dir = data_dir;
        }
        if let Some(image) = self.runtime_image {
            config.runtime_image = image;
        }
        if let Some(registry) = self.system_default_registry {
            config.system_default_registry = Some(registry);
        }
        if let Some(path) = self.private_registry {
            config.private_registry = path;
        }
        if let Some(image) = self.helm_job_image {
            config.helm_job_image = image;
        }
        Ok(config)
    }
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Command::Stage(args) => stage::execute(args).await,
        Command::Identity(args) => identity::execute(args).await,
        Command::RewriteManifests(args) => rewrite::execute(args).await,
        Command::Version(args) => version::execute(args).await,
    }
}
