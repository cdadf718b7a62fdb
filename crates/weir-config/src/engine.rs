//! Engine configuration file and topology construction.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use weir_core::pool::{DEFAULT_MAX_UNUSED_COUNT, DEFAULT_RECLAIM_INTERVAL_US};
use weir_core::{
    InPortId, MediaFormat, ModuleCaps, ModuleId, OutPortId, PoolConfig, PoolMode, StdHost, Topology,
    TopologyBuilder, TriggerMode,
};

use crate::error::ConfigError;
use crate::modules::{WithCaps, create_module, module_kind};
use crate::topology::{DEFAULT_MAX_LEN, ModuleConfig, PortConfig, TopologyConfig};

/// Scheduling mode as written in TOML.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TriggerConfig {
    /// Modules run when their data trigger holds.
    #[default]
    Data,
    /// Modules run once per periodic signal.
    Signal,
}

impl From<TriggerConfig> for TriggerMode {
    fn from(t: TriggerConfig) -> Self {
        match t {
            TriggerConfig::Data => TriggerMode::Data,
            TriggerConfig::Signal => TriggerMode::Signal,
        }
    }
}

/// Buffer retention as written in TOML.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PoolModeConfig {
    /// Emptied buffers go back to the pool.
    #[default]
    Normal,
    /// Real-time ports keep emptied buffers across cycles.
    LowLatency,
}

/// `[pool]` section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PoolSettings {
    /// Retention policy.
    #[serde(default)]
    pub mode: PoolModeConfig,

    /// Minimum time between two reclamation passes.
    #[serde(default = "default_reclaim_interval_us")]
    pub reclaim_interval_us: u64,

    /// Staleness at which a free block is destroyed.
    #[serde(default = "default_max_unused_count")]
    pub max_unused_count: u32,

    /// Upper bound on pool memory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_total_bytes: Option<usize>,
}

fn default_reclaim_interval_us() -> u64 {
    DEFAULT_RECLAIM_INTERVAL_US
}

fn default_max_unused_count() -> u32 {
    DEFAULT_MAX_UNUSED_COUNT
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            mode: PoolModeConfig::Normal,
            reclaim_interval_us: default_reclaim_interval_us(),
            max_unused_count: default_max_unused_count(),
            max_total_bytes: None,
        }
    }
}

impl From<&PoolSettings> for PoolConfig {
    fn from(s: &PoolSettings) -> Self {
        PoolConfig {
            mode: match s.mode {
                PoolModeConfig::Normal => PoolMode::Normal,
                PoolModeConfig::LowLatency => PoolMode::LowLatency,
            },
            reclaim_interval_us: s.reclaim_interval_us,
            max_unused_count: s.max_unused_count,
            max_total_bytes: s.max_total_bytes,
        }
    }
}

/// Complete engine configuration.
///
/// # TOML Format
///
/// ```toml
/// name = "gain chain"
/// trigger = "data"
/// validation = true
///
/// [pool]
/// mode = "low_latency"
/// max_total_bytes = 65536
///
/// [[module]]
/// name = "gain"
/// kind = "gain"
/// [[module.input]]
/// external = true
/// [[module.output]]
/// external = true
/// [module.params]
/// gain = "0.5"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// Name of the configuration.
    pub name: String,

    /// Optional description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Scheduling mode.
    #[serde(default)]
    pub trigger: TriggerConfig,

    /// Reject unconnected ports that are not marked external.
    #[serde(default)]
    pub validation: bool,

    /// Buffer pool tuning.
    #[serde(default)]
    pub pool: PoolSettings,

    /// Modules and connections.
    #[serde(flatten)]
    pub topology: TopologyConfig,
}

/// An external port of a built graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalPort<Id> {
    /// `module:inN` or `module:outN`.
    pub label: String,
    /// Engine port id.
    pub id: Id,
    /// Port format.
    pub format: MediaFormat,
    /// Per-buffer capacity.
    pub max_len: u32,
}

/// A built topology together with its container-facing ports.
pub struct Graph {
    /// The engine.
    pub topology: Topology,
    /// Ports the container feeds.
    pub inputs: Vec<ExternalPort<InPortId>>,
    /// Ports the container drains.
    pub outputs: Vec<ExternalPort<OutPortId>>,
}

struct BuiltModule {
    id: ModuleId,
    inputs: Vec<InPortId>,
    outputs: Vec<OutPortId>,
}

impl EngineConfig {
    /// Create an empty configuration.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            trigger: TriggerConfig::Data,
            validation: false,
            pool: PoolSettings::default(),
            topology: TopologyConfig::default(),
        }
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Set the scheduling mode.
    pub fn with_trigger(mut self, trigger: TriggerConfig) -> Self {
        self.trigger = trigger;
        self
    }

    /// Set the graph.
    pub fn with_topology(mut self, topology: TopologyConfig) -> Self {
        self.topology = topology;
        self
    }

    /// Load a configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::read_file(path, e))?;
        let config: EngineConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load a configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(toml_str)?)
    }

    /// Save the configuration to a TOML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|e| ConfigError::write_file(path, e))?;
        Ok(())
    }

    /// Convert the configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Builds the engine topology.
    pub fn build(&self) -> Result<Graph, ConfigError> {
        let mut b = TopologyBuilder::new();
        b.pool_config(PoolConfig::from(&self.pool))
            .host(Box::new(StdHost::default()))
            .trigger_mode(self.trigger.into());

        let mut by_name: HashMap<&str, usize> = HashMap::new();
        let mut built = Vec::with_capacity(self.topology.modules.len());
        for (idx, mc) in self.topology.modules.iter().enumerate() {
            if by_name.insert(mc.name.as_str(), idx).is_some() {
                return Err(ConfigError::DuplicateModule(mc.name.clone()));
            }
            built.push(add_module(&mut b, mc)?);
        }

        let mut in_used: Vec<Vec<bool>> = built.iter().map(|bm| vec![false; bm.inputs.len()]).collect();
        let mut out_used: Vec<Vec<bool>> = built.iter().map(|bm| vec![false; bm.outputs.len()]).collect();

        for conn in &self.topology.connections {
            let from_label = format!("{}:out{}", conn.from, conn.from_port);
            let to_label = format!("{}:in{}", conn.to, conn.to_port);
            let from_idx = *by_name
                .get(conn.from.as_str())
                .ok_or_else(|| ConfigError::UnknownPort(from_label.clone()))?;
            let to_idx = *by_name
                .get(conn.to.as_str())
                .ok_or_else(|| ConfigError::UnknownPort(to_label.clone()))?;
            let from = *built[from_idx]
                .outputs
                .get(conn.from_port)
                .ok_or(ConfigError::UnknownPort(from_label))?;
            let to = *built[to_idx]
                .inputs
                .get(conn.to_port)
                .ok_or(ConfigError::UnknownPort(to_label))?;
            b.connect(from, to)?;
            out_used[from_idx][conn.from_port] = true;
            in_used[to_idx][conn.to_port] = true;
        }

        let mut inputs = Vec::new();
        let mut outputs = Vec::new();
        for (idx, (bm, mc)) in built.iter().zip(&self.topology.modules).enumerate() {
            for (local, &id) in bm.inputs.iter().enumerate() {
                if in_used[idx][local] {
                    continue;
                }
                let label = format!("{}:in{local}", mc.name);
                let pc = port_config(&mc.inputs, local);
                self.check_dangling(&label, &pc)?;
                let (format, max_len) = port_shape(mc, &pc, &label)?;
                if pc.realtime {
                    b.realtime_input(id)?;
                }
                inputs.push(ExternalPort {
                    label,
                    id,
                    format,
                    max_len,
                });
            }
            for (local, &id) in bm.outputs.iter().enumerate() {
                if out_used[idx][local] {
                    continue;
                }
                let label = format!("{}:out{local}", mc.name);
                let pc = port_config(&mc.outputs, local);
                self.check_dangling(&label, &pc)?;
                let (format, max_len) = port_shape(mc, &pc, &label)?;
                if pc.realtime {
                    b.realtime_output(id)?;
                }
                outputs.push(ExternalPort {
                    label,
                    id,
                    format,
                    max_len,
                });
            }
        }

        let mut topology = b.build()?;
        for (bm, mc) in built.iter().zip(&self.topology.modules) {
            if mc.bypass {
                topology.set_bypass(bm.id, true)?;
            }
            if !mc.active {
                topology.set_active(bm.id, false)?;
            }
        }

        tracing::info!(
            "config '{}': {} modules, {} external inputs, {} external outputs",
            self.name,
            topology.num_modules(),
            inputs.len(),
            outputs.len()
        );
        Ok(Graph {
            topology,
            inputs,
            outputs,
        })
    }

    fn check_dangling(&self, label: &str, pc: &PortConfig) -> Result<(), ConfigError> {
        if pc.external {
            return Ok(());
        }
        if self.validation {
            return Err(ConfigError::Dangling(label.to_string()));
        }
        tracing::warn!("port '{label}' is unconnected, treating it as external");
        Ok(())
    }
}

fn port_config(ports: &[PortConfig], local: usize) -> PortConfig {
    ports.get(local).cloned().unwrap_or_default()
}

fn port_shape(
    mc: &ModuleConfig,
    pc: &PortConfig,
    label: &str,
) -> Result<(MediaFormat, u32), ConfigError> {
    let format = pc
        .format
        .or(mc.format)
        .unwrap_or_default()
        .to_media_format(label)?;
    let max_len = pc.max_len.or(mc.max_len).unwrap_or(DEFAULT_MAX_LEN);
    if max_len == 0 {
        return Err(ConfigError::invalid_format(label, "max_len must be non-zero"));
    }
    Ok((format, max_len))
}

fn add_module(b: &mut TopologyBuilder, mc: &ModuleConfig) -> Result<BuiltModule, ConfigError> {
    let kind = module_kind(&mc.kind).ok_or_else(|| ConfigError::UnknownModuleKind {
        module: mc.name.clone(),
        kind: mc.kind.clone(),
    })?;

    let id = match create_module(&mc.name, &mc.kind, &mc.params)? {
        None => {
            if mc.in_place == Some(false) || mc.loops.is_some() || mc.algo_delay_us.is_some() {
                tracing::warn!("module '{}': passthrough ignores capability overrides", mc.name);
            }
            b.add_passthrough(mc.name.clone())
        }
        Some(module) => {
            let base = module.caps();
            let caps = ModuleCaps {
                in_place: mc.in_place.unwrap_or(base.in_place),
                num_proc_loops: mc.loops.unwrap_or(base.num_proc_loops),
                algo_delay_us: mc.algo_delay_us.unwrap_or(base.algo_delay_us),
                ..base.clone()
            };
            if caps == base {
                b.add_module(mc.name.clone(), module)
            } else {
                b.add_module(mc.name.clone(), Box::new(WithCaps::new(module, caps)))
            }
        }
    };
    if mc.path != 0 {
        b.path_index(id, mc.path)?;
    }

    let n_in = if mc.inputs.is_empty() {
        kind.default_inputs
    } else {
        mc.inputs.len()
    };
    let n_out = if mc.outputs.is_empty() {
        kind.default_outputs
    } else {
        mc.outputs.len()
    };

    let mut inputs = Vec::with_capacity(n_in);
    for local in 0..n_in {
        let pc = port_config(&mc.inputs, local);
        let (format, max_len) = port_shape(mc, &pc, &format!("{}:in{local}", mc.name))?;
        let id_in = b.add_input(id, format, max_len)?;
        if pc.threshold {
            b.threshold(id_in)?;
        }
        inputs.push(id_in);
    }
    let mut outputs = Vec::with_capacity(n_out);
    for local in 0..n_out {
        let pc = port_config(&mc.outputs, local);
        let (format, max_len) = port_shape(mc, &pc, &format!("{}:out{local}", mc.name))?;
        outputs.push(b.add_output(id, format, max_len)?);
    }

    tracing::debug!(
        "config: module '{}' ({}) with {n_in} inputs, {n_out} outputs",
        mc.name,
        mc.kind
    );
    Ok(BuiltModule {
        id,
        inputs,
        outputs,
    })
}
