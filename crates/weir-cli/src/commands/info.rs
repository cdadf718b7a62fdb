//! Display the structure of a configuration.

use clap::Args;
use std::path::PathBuf;
use weir_config::PoolModeConfig;

use super::common::{describe_format, format_bytes, load_config};

/// Show processing order, in-place chains and pool settings.
#[derive(Args)]
pub struct InfoArgs {
    /// Configuration file (TOML)
    pub config: PathBuf,
}

/// Run the info command.
pub fn run(args: InfoArgs) -> anyhow::Result<()> {
    let config = load_config(&args.config)?;
    let graph = config.build()?;
    let topo = &graph.topology;

    println!("Config:      {}", config.name);
    if let Some(desc) = &config.description {
        println!("             {desc}");
    }
    println!("Trigger:     {:?}", topo.trigger_mode());

    let pool = &config.pool;
    let mode = match pool.mode {
        PoolModeConfig::Normal => "normal",
        PoolModeConfig::LowLatency => "low latency",
    };
    println!(
        "Pool:        {mode}, reclaim every {} us after {} idle passes",
        pool.reclaim_interval_us, pool.max_unused_count
    );
    if let Some(limit) = pool.max_total_bytes {
        println!("             limit {}", format_bytes(limit as u64));
    }

    println!("\nProcessing order:");
    for (pos, &id) in topo.order().iter().enumerate() {
        let name = topo.module_name(id).unwrap_or("?");
        let kind = config.topology.module(name).map_or("?", |m| m.kind.as_str());
        let mut flags = Vec::new();
        if let Some(caps) = topo.module_caps(id) {
            if caps.in_place {
                flags.push("in-place");
            }
            if caps.requires_data_buffering {
                flags.push("buffering");
            }
        }
        if topo.is_bypassed(id) {
            flags.push("bypassed");
        }
        println!(
            "  {pos:>2}. {name:<16} {kind:<12} in {} out {}  {}",
            topo.module_inputs(id).len(),
            topo.module_outputs(id).len(),
            flags.join(", ")
        );
    }

    let runs = topo.nblc_runs();
    println!("\nIn-place chains: {}", runs.len());
    for run in runs {
        let names: Vec<&str> = run
            .iter()
            .map(|&m| topo.module_name(m).unwrap_or("?"))
            .collect();
        println!("  {}", names.join(" -> "));
    }

    println!("\nExternal inputs:");
    for port in &graph.inputs {
        println!(
            "  {:<16} {} (max {} B)",
            port.label,
            describe_format(&port.format),
            port.max_len
        );
    }
    println!("External outputs:");
    for port in &graph.outputs {
        println!(
            "  {:<16} {} (max {} B)",
            port.label,
            describe_format(&port.format),
            port.max_len
        );
    }
    Ok(())
}
