// ABOUTME: CLI config command printing the effective configuration as TOML

use anyhow::{Context, Result};

use super::ClusterArgs;

pub fn execute(args: &ClusterArgs) -> Result<()> {
    let config = args.resolve()?;
    let rendered = config.to_toml().context("Failed to render configuration")?;
    print!("{rendered}");
    Ok(())
}
