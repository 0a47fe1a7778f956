//! `nodeboot version` command.

use clap::Args;

#[derive(Args)]
pub struct VersionArgs;

pub async fn execute(_args: VersionArgs) -> Result<(), Box<dyn std::error::Error>> {
    println!("nodeboot version {}", nodeboot_core::VERSION);
    Ok(())
}
