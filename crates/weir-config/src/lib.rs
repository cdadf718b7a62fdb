//! Configuration files for the weir data-flow engine.
//!
//! This crate describes an engine and its module graph in TOML and turns
//! that description into a runnable [`weir_core::Topology`].
//!
//! # Features
//!
//! - **Engine settings**: trigger mode, pool retention and limits
//! - **Module graph**: `[[module]]` and `[[connection]]` tables with
//!   per-port formats and buffer sizes
//! - **Built-in modules**: gain, accumulate, splitter, sink and tone kinds
//!   for graphs that need no custom code
//!
//! # Example
//!
//! ```rust
//! use weir_config::EngineConfig;
//!
//! let config = EngineConfig::from_toml(r#"
//!     name = "half gain"
//!
//!     [[module]]
//!     name = "gain"
//!     kind = "gain"
//!     max_len = 192
//!     [module.params]
//!     gain = "50%"
//! "#).unwrap();
//!
//! let mut graph = config.build().unwrap();
//! let (input, output) = (graph.inputs[0].id, graph.outputs[0].id);
//! graph.topology.push_input(input, &[0u8; 192]).unwrap();
//! graph.topology.process_cycle().unwrap();
//!
//! let mut out = Vec::new();
//! assert_eq!(graph.topology.drain_output(output, &mut out).unwrap().len, 192);
//! ```

mod engine;
mod error;
mod format;
mod topology;

/// Built-in module kinds.
pub mod modules;

pub use engine::{EngineConfig, ExternalPort, Graph, PoolModeConfig, PoolSettings, TriggerConfig};
pub use error::ConfigError;
pub use format::{DataFormatConfig, FormatConfig, InterleavingConfig};
pub use modules::{MODULE_KINDS, ModuleKindInfo, create_module, module_kind, parse_param_value};
pub use topology::{ConnectionConfig, DEFAULT_MAX_LEN, ModuleConfig, PortConfig, TopologyConfig};
