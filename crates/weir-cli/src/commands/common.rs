//! Shared helpers for commands.

use anyhow::Context;
use std::path::Path;
use weir_config::EngineConfig;
use weir_core::MediaFormat;

/// Loads a configuration file with the path in the error context.
pub fn load_config(path: &Path) -> anyhow::Result<EngineConfig> {
    EngineConfig::load(path).with_context(|| format!("loading {}", path.display()))
}

/// One-line description of a media format.
pub fn describe_format(fmt: &MediaFormat) -> String {
    format!(
        "{:?} {:?}, {} ch, {} Hz, {}-byte",
        fmt.data_format, fmt.interleaving, fmt.num_channels, fmt.sample_rate, fmt.bytes_per_sample
    )
}

/// Human-readable byte count.
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}
