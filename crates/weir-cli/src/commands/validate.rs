//! Check that a configuration builds.

use clap::Args;
use std::path::PathBuf;

use super::common::load_config;

/// Validate a configuration file.
#[derive(Args)]
pub struct ValidateArgs {
    /// Configuration file (TOML)
    pub config: PathBuf,

    /// Reject unconnected ports that are not marked external
    #[arg(long)]
    pub strict: bool,
}

/// Run the validate command.
pub fn run(args: ValidateArgs) -> anyhow::Result<()> {
    let mut config = load_config(&args.config)?;
    config.validation |= args.strict;
    let graph = config.build()?;

    println!(
        "{}: OK ({} modules, {} connections, {} external inputs, {} external outputs)",
        config.name,
        graph.topology.num_modules(),
        config.topology.connections.len(),
        graph.inputs.len(),
        graph.outputs.len()
    );
    Ok(())
}
