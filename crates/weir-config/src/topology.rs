//! Module graph description.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::format::FormatConfig;

/// Per-port buffer size used when neither port nor module sets one.
pub const DEFAULT_MAX_LEN: u32 = 1920;

/// Graph of modules and the connections between their ports.
///
/// # TOML Format
///
/// ```toml
/// [[module]]
/// name = "src"
/// kind = "passthrough"
///
/// [[module]]
/// name = "gain"
/// kind = "gain"
/// max_len = 960
/// [module.params]
/// gain = "-6dB"
///
/// [[connection]]
/// from = "src"
/// to = "gain"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TopologyConfig {
    /// Modules in declaration order.
    #[serde(rename = "module", default, skip_serializing_if = "Vec::is_empty")]
    pub modules: Vec<ModuleConfig>,

    /// Output-to-input connections.
    #[serde(rename = "connection", default, skip_serializing_if = "Vec::is_empty")]
    pub connections: Vec<ConnectionConfig>,
}

impl TopologyConfig {
    /// Add a module.
    pub fn with_module(mut self, module: ModuleConfig) -> Self {
        self.modules.push(module);
        self
    }

    /// Connect output 0 of `from` to input 0 of `to`.
    pub fn with_connection(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.connections.push(ConnectionConfig::new(from, to));
        self
    }

    /// Find a module by name.
    pub fn module(&self, name: &str) -> Option<&ModuleConfig> {
        self.modules.iter().find(|m| m.name == name)
    }
}

/// One module of the graph.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModuleConfig {
    /// Unique module name.
    pub name: String,

    /// Built-in kind (see [`MODULE_KINDS`](crate::MODULE_KINDS)).
    pub kind: String,

    /// Default per-buffer capacity for the module's ports.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_len: Option<u32>,

    /// Override: the output may share the input buffer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_place: Option<bool>,

    /// Override: process calls per cycle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loops: Option<u32>,

    /// Override: algorithmic delay in microseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub algo_delay_us: Option<u32>,

    /// Start bypassed.
    #[serde(default)]
    pub bypass: bool,

    /// Start active.
    #[serde(default = "default_true")]
    pub active: bool,

    /// Processing path index.
    #[serde(default)]
    pub path: u32,

    /// Default format for the module's ports.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<FormatConfig>,

    /// Input ports. Empty means the kind's default count.
    #[serde(rename = "input", default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<PortConfig>,

    /// Output ports. Empty means the kind's default count.
    #[serde(rename = "output", default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<PortConfig>,

    /// Kind-specific parameters.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub params: HashMap<String, String>,
}

fn default_true() -> bool {
    true
}

impl ModuleConfig {
    /// Create a module of `kind` with default ports.
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            format: None,
            max_len: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
            in_place: None,
            loops: None,
            algo_delay_us: None,
            bypass: false,
            active: true,
            path: 0,
            params: HashMap::new(),
        }
    }

    /// Set the default port format.
    pub fn with_format(mut self, format: FormatConfig) -> Self {
        self.format = Some(format);
        self
    }

    /// Set the default port capacity.
    pub fn with_max_len(mut self, max_len: u32) -> Self {
        self.max_len = Some(max_len);
        self
    }

    /// Add a parameter.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Add an explicit input port.
    pub fn with_input(mut self, port: PortConfig) -> Self {
        self.inputs.push(port);
        self
    }

    /// Add an explicit output port.
    pub fn with_output(mut self, port: PortConfig) -> Self {
        self.outputs.push(port);
        self
    }

    /// Set whether the module starts bypassed.
    pub fn with_bypass(mut self, bypass: bool) -> Self {
        self.bypass = bypass;
        self
    }
}

/// One port of a module.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PortConfig {
    /// Per-buffer capacity; falls back to the module's.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_len: Option<u32>,

    /// The port faces the container.
    #[serde(default)]
    pub external: bool,

    /// Fed or drained by a real-time endpoint.
    #[serde(default)]
    pub realtime: bool,

    /// The module needs a full buffer here before it runs.
    #[serde(default)]
    pub threshold: bool,

    /// Format; falls back to the module's.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<FormatConfig>,
}

impl PortConfig {
    /// External port with inherited format and size.
    pub fn external() -> Self {
        Self {
            external: true,
            ..Self::default()
        }
    }

    /// Mark the port real-time.
    pub fn realtime(mut self) -> Self {
        self.realtime = true;
        self
    }
}

/// Connection from an output to an input.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Upstream module name.
    pub from: String,

    /// Upstream output index.
    #[serde(default)]
    pub from_port: usize,

    /// Downstream module name.
    pub to: String,

    /// Downstream input index.
    #[serde(default)]
    pub to_port: usize,
}

impl ConnectionConfig {
    /// Connect output 0 of `from` to input 0 of `to`.
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            from_port: 0,
            to: to.into(),
            to_port: 0,
        }
    }

    /// Select the ports.
    pub fn ports(mut self, from_port: usize, to_port: usize) -> Self {
        self.from_port = from_port;
        self.to_port = to_port;
        self
    }
}
