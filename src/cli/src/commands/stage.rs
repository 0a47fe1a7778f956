//! `nodeboot stage` command.

use clap::Args;

use super::ConfigArgs;

#[derive(Args)]
pub struct StageArgs {
    #[command(flatten)]
    pub config: ConfigArgs,
}

pub async fn execute(args: StageArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = args.config.load()?;
    let bin_dir = nodeboot_runtime::stage(&config).await?;
    println!("{}", bin_dir.display());
    Ok(())
}
