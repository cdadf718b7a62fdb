//! Weir CLI - drive engine configurations from the command line.

mod commands;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "weir")]
#[command(author, version, about = "Weir data-flow engine CLI", long_about = None)]
struct Cli {
    /// Log engine decisions (debug level); RUST_LOG overrides
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run process cycles over a configuration
    Run(commands::run::RunArgs),

    /// Check that a configuration builds
    Validate(commands::validate::ValidateArgs),

    /// Show processing order, in-place chains and pool settings
    Info(commands::info::InfoArgs),

    /// List built-in module kinds
    Kinds,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| default_level.into()),
        )
        .with_writer(std::io::stderr)
        .init();
    tracing_log::LogTracer::init().ok();

    match cli.command {
        Commands::Run(args) => commands::run::run(args),
        Commands::Validate(args) => commands::validate::run(args),
        Commands::Info(args) => commands::info::run(args),
        Commands::Kinds => commands::kinds::run(),
    }
}
