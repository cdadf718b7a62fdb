//! Drive process cycles over a configuration.

use clap::Args;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use weir_core::{CycleReport, Metadata};

use super::common::{format_bytes, load_config};

#[derive(Args)]
pub struct RunArgs {
    /// Configuration file (TOML)
    #[arg(value_name = "CONFIG")]
    config: PathBuf,

    /// Number of process cycles
    #[arg(short = 'n', long, default_value = "100")]
    cycles: u64,

    /// Bytes pushed into each external input per cycle (default: port size)
    #[arg(long)]
    frame_bytes: Option<u32>,

    /// Send a flushing end-of-stream after the last cycle and drain it
    #[arg(long)]
    eos: bool,

    /// Print a line per cycle instead of a progress bar
    #[arg(long)]
    per_cycle: bool,

    /// Write a JSON summary to this file
    #[arg(long)]
    json: Option<PathBuf>,
}

#[derive(Default)]
struct Totals {
    cycles: u64,
    process_calls: u64,
    events: u64,
    pushed: u64,
    rejected: u64,
    drained: Vec<u64>,
    dropped: u64,
}

impl Totals {
    fn add(&mut self, report: &CycleReport) {
        self.cycles += 1;
        self.process_calls += report.process_calls as u64;
        self.dropped += report.dropped_bytes;
    }
}

pub fn run(args: RunArgs) -> anyhow::Result<()> {
    let config = load_config(&args.config)?;
    let mut graph = config.build()?;
    tracing::debug!(
        "run: {} external inputs, {} external outputs",
        graph.inputs.len(),
        graph.outputs.len()
    );
    println!(
        "Running '{}': {} modules, {} cycles",
        config.name,
        graph.topology.num_modules(),
        args.cycles
    );

    let frames: Vec<usize> = graph
        .inputs
        .iter()
        .map(|p| {
            let unit = p.format.bytes_per_frame().max(1);
            let want = args.frame_bytes.unwrap_or(p.max_len).min(p.max_len);
            (want / unit * unit) as usize
        })
        .collect();
    let mut clocks_us = vec![0u64; graph.inputs.len()];
    let mut totals = Totals {
        drained: vec![0; graph.outputs.len()],
        ..Totals::default()
    };
    let mut scratch = Vec::new();

    let pb = if args.per_cycle {
        ProgressBar::hidden()
    } else {
        ProgressBar::new(args.cycles)
    };
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} cycles ({eta})")?
            .progress_chars("##-"),
    );

    for cycle in 0..args.cycles {
        for (k, port) in graph.inputs.iter().enumerate() {
            let len = frames[k];
            if len == 0 {
                continue;
            }
            let data: Vec<u8> = (0..len)
                .map(|i| (i as u64).wrapping_add(cycle) as u8)
                .collect();

            let empty = graph
                .topology
                .input(port.id)
                .is_some_and(|p| p.common.is_empty());
            if empty {
                let sd = graph.topology.input_stream_mut(port.id)?;
                sd.timestamp = clocks_us[k] as i64;
                sd.flags.ts_valid = true;
            }

            let accepted = graph.topology.push_input(port.id, &data)?;
            clocks_us[k] += port.format.bytes_to_us(accepted as u64, None);
            totals.pushed += accepted as u64;
            totals.rejected += (len - accepted) as u64;
        }

        let mut report = graph.topology.process_cycle()?;
        if report.events_pending {
            tracing::debug!("run: cycle {cycle} stopped on a framework event");
            totals.events += 1;
            graph.topology.handle_pending_events();
            totals.add(&report);
            report = graph.topology.process_cycle()?;
        }
        totals.add(&report);

        let mut drained_now = 0;
        for (k, port) in graph.outputs.iter().enumerate() {
            scratch.clear();
            let d = graph.topology.drain_output(port.id, &mut scratch)?;
            totals.drained[k] += d.len as u64;
            drained_now += d.len;
        }

        if args.per_cycle {
            println!(
                "cycle {cycle:>5}: {} calls, {drained_now} B out, {} B dropped{}",
                report.process_calls,
                report.dropped_bytes,
                if report.events_pending { ", events" } else { "" }
            );
        }
        pb.inc(1);
    }
    pb.finish_and_clear();

    if args.eos {
        for port in &graph.inputs {
            graph.topology.push_metadata(port.id, Metadata::eos(0, true))?;
        }
        let report = graph.topology.process_until_settled(16)?;
        totals.process_calls += report.process_calls as u64;
        totals.dropped += report.dropped_bytes;
        for (k, port) in graph.outputs.iter().enumerate() {
            scratch.clear();
            let d = graph.topology.drain_output(port.id, &mut scratch)?;
            totals.drained[k] += d.len as u64;
            if d.metadata.has_flushing_eos() {
                println!("  {}: end of stream", port.label);
            }
        }
    }

    let stats = graph.topology.pool().stats();
    println!("\nCycles:        {}", totals.cycles);
    println!("Process calls: {}", totals.process_calls);
    println!("Events:        {}", totals.events);
    println!("Pushed:        {}", format_bytes(totals.pushed));
    if totals.rejected > 0 {
        println!("Rejected:      {}", format_bytes(totals.rejected));
    }
    for (port, bytes) in graph.outputs.iter().zip(&totals.drained) {
        println!("Drained:       {} from {}", format_bytes(*bytes), port.label);
    }
    println!("Dropped:       {}", format_bytes(totals.dropped));
    println!(
        "Pool:          {} blocks ({}), peak {} leased",
        stats.allocated_blocks,
        format_bytes(stats.allocated_bytes as u64),
        stats.peak_leased_blocks
    );

    if let Some(path) = args.json {
        let outputs: Vec<_> = graph
            .outputs
            .iter()
            .zip(&totals.drained)
            .map(|(p, b)| serde_json::json!({ "port": p.label, "bytes": b }))
            .collect();
        let summary = serde_json::json!({
            "config": config.name,
            "cycles": totals.cycles,
            "process_calls": totals.process_calls,
            "events": totals.events,
            "pushed_bytes": totals.pushed,
            "rejected_bytes": totals.rejected,
            "dropped_bytes": totals.dropped,
            "outputs": outputs,
            "pool": {
                "allocated_blocks": stats.allocated_blocks,
                "allocated_bytes": stats.allocated_bytes,
                "peak_leased_blocks": stats.peak_leased_blocks,
            },
        });
        std::fs::write(&path, serde_json::to_string_pretty(&summary)?)?;
        println!("Summary written to {}", path.display());
    }
    Ok(())
}
