//! `nodeboot identity` command.

use clap::Args;

use nodeboot_runtime::ImageReference;

#[derive(Args)]
pub struct IdentityArgs {
    /// Image reference (e.g., "rancher/rke2-runtime:v1.2.3")
    pub image: String,
}

pub async fn execute(args: IdentityArgs) -> Result<(), Box<dyn std::error::Error>> {
    let reference = ImageReference::parse(&args.image)?;
    println!("{}", reference.runtime_identity()?);
    Ok(())
}
