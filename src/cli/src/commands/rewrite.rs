//! `nodeboot rewrite-manifests` command.

use clap::Args;

use nodeboot_runtime::ManifestRewriter;

use super::ConfigArgs;

#[derive(Args)]
pub struct RewriteArgs {
    #[command(flatten)]
    pub config: ConfigArgs,
}

pub async fn execute(args: RewriteArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = args.config.load()?;
    let manifests_dir = config.layout().manifests_dir();
    let rewritten = ManifestRewriter::from_config(&config).rewrite_dir(&manifests_dir)?;
    println!("Updated {} manifest(s) in {}", rewritten, manifests_dir.display());
    Ok(())
}
