//! Topology state, builder and container-facing API.
//!
//! A [`Topology`] owns the module graph, every port, the buffer pool and the
//! per-cycle scratch state. It is built once with [`TopologyBuilder`] and
//! then driven by repeated calls to [`Topology::process_cycle`]. The
//! process engine itself lives in the `acquire`, `copy`, `timestamp`,
//! `driver`, `process` and `signal` modules as further `impl Topology`
//! blocks.
//!
//! # Usage
//!
//! 1. Create a builder with [`TopologyBuilder::new()`]
//! 2. Add modules and their ports, connect outputs to inputs
//! 3. [`build()`](TopologyBuilder::build) sorts modules and derives port properties
//! 4. Feed external inputs ([`Topology::push_input`]), run
//!    [`process_cycle()`](Topology::process_cycle), drain external outputs

#[cfg(not(feature = "std"))]
use alloc::{boxed::Box, format, string::String, vec, vec::Vec};

use crate::error::{EngineError, Result};
use crate::format::MediaFormat;
use crate::metadata::{Metadata, MetadataList};
use crate::module::{Module, ModuleCaps, ModuleId};
use crate::pool::{BlockId, BufferPool, NoopHost, PoolConfig, PoolHost};
use crate::port::{
    BufOrigin, BufView, CommonPort, DataFlowState, InPortId, InputPort, OutPortId, OutputPort,
    PortState, StreamData, StreamFlags, TsToSync,
};
use crate::trigger::TriggerMode;

/// Callbacks from the engine to its container.
pub trait ContainerHooks {
    /// A timestamp discontinuity was seen while copying into `module`.
    ///
    /// `delta_us` is expected minus incoming timestamp.
    fn notify_ts_discontinuity(&mut self, module: ModuleId, both_valid: bool, delta_us: i64) {
        let _ = (module, both_valid, delta_us);
    }

    /// A sink module consumed a frame.
    fn frame_done(&mut self, module: ModuleId) {
        let _ = module;
    }
}

/// Hooks that ignore every callback.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl ContainerHooks for NoHooks {}

/// Framework events raised while processing.
///
/// A pending event stops the process loop after the current module; the
/// container handles it with [`Topology::handle_pending_events`] and the
/// next cycle resumes at the same module.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingEvents {
    /// A media format reached an input or was raised by a module.
    pub media_format: bool,
    /// Inputs whose media format changed.
    pub inputs_with_new_format: Vec<InPortId>,
    /// Requested per-buffer sizes for outputs.
    pub thresholds: Vec<(OutPortId, u32)>,
}

impl PendingEvents {
    /// Whether any event is waiting.
    pub fn any(&self) -> bool {
        self.media_format || !self.thresholds.is_empty()
    }
}

/// Summary of one [`Topology::process_cycle`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Process calls made.
    pub process_calls: usize,
    /// Something moved; another pass may make progress.
    pub anything_changed: bool,
    /// The loop stopped early on a framework event.
    pub events_pending: bool,
    /// Bytes dropped on real-time paths or by non-buffering modules.
    pub dropped_bytes: u64,
}

/// Data handed back by [`Topology::drain_output`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Drained {
    /// Bytes appended to the caller's vector.
    pub len: usize,
    /// Timestamp of the first byte, when valid.
    pub timestamp: Option<i64>,
    /// End of frame was set on the port.
    pub end_of_frame: bool,
    /// The data represents an erasure.
    pub erasure: bool,
    /// Metadata that travelled with the data.
    pub metadata: MetadataList,
    /// New media format announced on the port since the last drain.
    pub media_format: Option<MediaFormat>,
}

pub(crate) struct AttachedModule {
    pub(crate) output: usize,
    pub(crate) module: Box<dyn Module + Send>,
    pub(crate) enabled: bool,
}

pub(crate) struct ModuleNode {
    pub(crate) name: String,
    pub(crate) module: Option<Box<dyn Module + Send>>,
    pub(crate) caps: ModuleCaps,
    pub(crate) inputs: Vec<InPortId>,
    pub(crate) outputs: Vec<OutPortId>,
    pub(crate) bypass: bool,
    pub(crate) active: bool,
    pub(crate) path_index: u32,
    /// Bytes per channel of zeros still to push after a flushing EOS.
    pub(crate) pending_zeros_at_eos: u32,
    pub(crate) eos_armed: bool,
    pub(crate) attached: Vec<AttachedModule>,
}

impl ModuleNode {
    fn new(name: String, module: Option<Box<dyn Module + Send>>, caps: ModuleCaps) -> Self {
        Self {
            name,
            module,
            caps,
            inputs: Vec::new(),
            outputs: Vec::new(),
            bypass: false,
            active: true,
            path_index: 0,
            pending_zeros_at_eos: 0,
            eos_armed: false,
            attached: Vec::new(),
        }
    }

    pub(crate) fn is_siso(&self) -> bool {
        self.inputs.len() == 1 && self.outputs.len() == 1
    }

    pub(crate) fn is_sink(&self) -> bool {
        self.caps.is_sink || (self.outputs.is_empty() && !self.inputs.is_empty())
    }

    pub(crate) fn is_source(&self) -> bool {
        self.caps.is_source || (self.inputs.is_empty() && !self.outputs.is_empty())
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct InScratch {
    pub(crate) prev_len: Vec<u32>,
    pub(crate) prev_eos_dfg: bool,
    pub(crate) prev_eof: bool,
    pub(crate) data_pending_in_prev: bool,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct OutScratch {
    pub(crate) prev_len: Vec<u32>,
    pub(crate) flags: StreamFlags,
    pub(crate) timestamp: i64,
    pub(crate) md: MetadataList,
}

/// Module graph with its ports, buffers and process state.
pub struct Topology {
    pub(crate) pool: BufferPool,
    pub(crate) modules: Vec<ModuleNode>,
    pub(crate) inputs: Vec<InputPort>,
    pub(crate) outputs: Vec<OutputPort>,
    pub(crate) order: Vec<ModuleId>,
    pub(crate) trigger_mode: TriggerMode,
    pub(crate) hooks: Box<dyn ContainerHooks + Send>,
    pub(crate) pending: PendingEvents,
    pub(crate) resume_at: Option<usize>,
    pub(crate) in_scratch: Vec<InScratch>,
    pub(crate) out_scratch: Vec<OutScratch>,
    pub(crate) report: CycleReport,
}

impl core::fmt::Debug for Topology {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Topology")
            .field("modules", &self.modules.len())
            .field("inputs", &self.inputs.len())
            .field("outputs", &self.outputs.len())
            .field("order", &self.order)
            .field("trigger_mode", &self.trigger_mode)
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

/// Builds a [`Topology`].
pub struct TopologyBuilder {
    pool_config: PoolConfig,
    host: Option<Box<dyn PoolHost + Send>>,
    hooks: Option<Box<dyn ContainerHooks + Send>>,
    trigger_mode: TriggerMode,
    modules: Vec<ModuleNode>,
    inputs: Vec<InputPort>,
    outputs: Vec<OutputPort>,
}

impl Default for TopologyBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TopologyBuilder {
    /// Empty builder with the default pool configuration.
    pub fn new() -> Self {
        Self {
            pool_config: PoolConfig::default(),
            host: None,
            hooks: None,
            trigger_mode: TriggerMode::Data,
            modules: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    /// Sets the pool configuration.
    pub fn pool_config(&mut self, config: PoolConfig) -> &mut Self {
        self.pool_config = config;
        self
    }

    /// Sets the pool host. Defaults to [`NoopHost`].
    pub fn host(&mut self, host: Box<dyn PoolHost + Send>) -> &mut Self {
        self.host = Some(host);
        self
    }

    /// Sets the container hooks. Defaults to [`NoHooks`].
    pub fn hooks(&mut self, hooks: Box<dyn ContainerHooks + Send>) -> &mut Self {
        self.hooks = Some(hooks);
        self
    }

    /// Selects data- or signal-triggered processing.
    pub fn trigger_mode(&mut self, mode: TriggerMode) -> &mut Self {
        self.trigger_mode = mode;
        self
    }

    /// Adds a module; its caps are read once here.
    pub fn add_module(
        &mut self,
        name: impl Into<String>,
        module: Box<dyn Module + Send>,
    ) -> ModuleId {
        let caps = module.caps();
        self.push_node(ModuleNode::new(name.into(), Some(module), caps))
    }

    /// Adds a module-less node that copies its input to its output.
    pub fn add_passthrough(&mut self, name: impl Into<String>) -> ModuleId {
        let caps = ModuleCaps {
            in_place: true,
            ..ModuleCaps::default()
        };
        self.push_node(ModuleNode::new(name.into(), None, caps))
    }

    fn push_node(&mut self, node: ModuleNode) -> ModuleId {
        let id = ModuleId(self.modules.len() as u32);
        #[cfg(feature = "tracing")]
        tracing::debug!("topology_add_module: {id} '{}'", node.name);
        self.modules.push(node);
        id
    }

    /// Adds an input port to `module`.
    pub fn add_input(
        &mut self,
        module: ModuleId,
        format: MediaFormat,
        max_len_per_buf: u32,
    ) -> Result<InPortId> {
        let node = self
            .modules
            .get_mut(module.idx())
            .ok_or(EngineError::UnknownModule(module))?;
        let id = InPortId(self.inputs.len() as u32);
        node.inputs.push(id);
        self.inputs
            .push(InputPort::new(module, format, max_len_per_buf));
        Ok(id)
    }

    /// Adds an output port to `module`.
    pub fn add_output(
        &mut self,
        module: ModuleId,
        format: MediaFormat,
        max_len_per_buf: u32,
    ) -> Result<OutPortId> {
        let node = self
            .modules
            .get_mut(module.idx())
            .ok_or(EngineError::UnknownModule(module))?;
        let id = OutPortId(self.outputs.len() as u32);
        node.outputs.push(id);
        self.outputs
            .push(OutputPort::new(module, format, max_len_per_buf));
        Ok(id)
    }

    /// Connects an output to an input.
    pub fn connect(&mut self, from: OutPortId, to: InPortId) -> Result<()> {
        if self.outputs.get(from.idx()).is_none() {
            return Err(EngineError::UnknownOutput(from));
        }
        if self.inputs.get(to.idx()).is_none() {
            return Err(EngineError::UnknownInput(to));
        }
        if self.outputs[from.idx()].conn.is_some() {
            return Err(EngineError::AlreadyConnected(format!("{from}")));
        }
        if self.inputs[to.idx()].conn.is_some() {
            return Err(EngineError::AlreadyConnected(format!("{to}")));
        }
        self.outputs[from.idx()].conn = Some(to);
        self.inputs[to.idx()].conn = Some(from);
        #[cfg(feature = "tracing")]
        tracing::debug!("topology_connect: {from} -> {to}");
        Ok(())
    }

    /// Attaches an elementary module that runs on `output`'s buffer after its owner.
    pub fn attach(&mut self, output: OutPortId, module: Box<dyn Module + Send>) -> Result<()> {
        let owner = self
            .outputs
            .get(output.idx())
            .ok_or(EngineError::UnknownOutput(output))?
            .common
            .module;
        let node = &mut self.modules[owner.idx()];
        let local = node
            .outputs
            .iter()
            .position(|&o| o == output)
            .ok_or(EngineError::UnknownOutput(output))?;
        node.attached.push(AttachedModule {
            output: local,
            module,
            enabled: true,
        });
        Ok(())
    }

    /// The module needs a full buffer on `input` before it runs.
    pub fn threshold(&mut self, input: InPortId) -> Result<()> {
        let port = self
            .inputs
            .get_mut(input.idx())
            .ok_or(EngineError::UnknownInput(input))?;
        port.common.flags.has_threshold = true;
        Ok(())
    }

    /// Marks an external input as fed by a real-time source.
    pub fn realtime_input(&mut self, input: InPortId) -> Result<()> {
        let port = self
            .inputs
            .get_mut(input.idx())
            .ok_or(EngineError::UnknownInput(input))?;
        port.common.flags.upstream_realtime = true;
        Ok(())
    }

    /// Marks an external output as drained by a real-time sink.
    pub fn realtime_output(&mut self, output: OutPortId) -> Result<()> {
        let port = self
            .outputs
            .get_mut(output.idx())
            .ok_or(EngineError::UnknownOutput(output))?;
        port.common.flags.downstream_realtime = true;
        Ok(())
    }

    /// Assigns `module` to a processing path.
    pub fn path_index(&mut self, module: ModuleId, path: u32) -> Result<()> {
        self.modules
            .get_mut(module.idx())
            .ok_or(EngineError::UnknownModule(module))?
            .path_index = path;
        Ok(())
    }

    /// Sorts the modules and derives port properties.
    pub fn build(self) -> Result<Topology> {
        let order = self.kahn_sort()?;
        let n_in = self.inputs.len();
        let n_out = self.outputs.len();

        let mut topo = Topology {
            pool: BufferPool::with_host(
                self.pool_config,
                self.host.unwrap_or_else(|| Box::new(NoopHost)),
            ),
            modules: self.modules,
            inputs: self.inputs,
            outputs: self.outputs,
            order,
            trigger_mode: self.trigger_mode,
            hooks: self.hooks.unwrap_or_else(|| Box::new(NoHooks)),
            pending: PendingEvents::default(),
            resume_at: None,
            in_scratch: vec![InScratch::default(); n_in],
            out_scratch: vec![OutScratch::default(); n_out],
            report: CycleReport::default(),
        };
        topo.propagate_realtime();
        topo.derive_buffering_flags();

        #[cfg(feature = "tracing")]
        tracing::info!(
            "topology_build: {} modules, {n_in} inputs, {n_out} outputs",
            topo.modules.len()
        );
        Ok(topo)
    }

    fn kahn_sort(&self) -> Result<Vec<ModuleId>> {
        let n = self.modules.len();
        let mut in_degree = vec![0u32; n];
        for port in &self.inputs {
            if port.conn.is_some() {
                in_degree[port.common.module.idx()] += 1;
            }
        }

        let mut queue: Vec<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
        let mut head = 0;
        while head < queue.len() {
            let idx = queue[head];
            head += 1;
            for out in &self.modules[idx].outputs {
                if let Some(next_in) = self.outputs[out.idx()].conn {
                    let to = self.inputs[next_in.idx()].common.module.idx();
                    in_degree[to] -= 1;
                    if in_degree[to] == 0 {
                        queue.push(to);
                    }
                }
            }
        }

        if queue.len() != n {
            return Err(EngineError::CycleDetected);
        }
        Ok(queue.into_iter().map(|i| ModuleId(i as u32)).collect())
    }
}

impl Topology {
    /// Modules in processing order.
    pub fn order(&self) -> &[ModuleId] {
        &self.order
    }

    /// Number of modules.
    pub fn num_modules(&self) -> usize {
        self.modules.len()
    }

    /// Name a module was added with.
    pub fn module_name(&self, id: ModuleId) -> Option<&str> {
        self.modules.get(id.idx()).map(|m| m.name.as_str())
    }

    /// Capabilities of a module.
    pub fn module_caps(&self, id: ModuleId) -> Option<&ModuleCaps> {
        self.modules.get(id.idx()).map(|m| &m.caps)
    }

    /// Input ports of a module.
    pub fn module_inputs(&self, id: ModuleId) -> &[InPortId] {
        self.modules.get(id.idx()).map_or(&[], |m| &m.inputs)
    }

    /// Output ports of a module.
    pub fn module_outputs(&self, id: ModuleId) -> &[OutPortId] {
        self.modules.get(id.idx()).map_or(&[], |m| &m.outputs)
    }

    /// Input port state.
    pub fn input(&self, id: InPortId) -> Option<&InputPort> {
        self.inputs.get(id.idx())
    }

    /// Output port state.
    pub fn output(&self, id: OutPortId) -> Option<&OutputPort> {
        self.outputs.get(id.idx())
    }

    /// External input ports in index order.
    pub fn external_inputs(&self) -> impl Iterator<Item = InPortId> + '_ {
        self.inputs
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_external())
            .map(|(i, _)| InPortId(i as u32))
    }

    /// External output ports in index order.
    pub fn external_outputs(&self) -> impl Iterator<Item = OutPortId> + '_ {
        self.outputs
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_external())
            .map(|(i, _)| OutPortId(i as u32))
    }

    /// The buffer pool.
    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Mutable buffer pool (mode switches, reclamation).
    pub fn pool_mut(&mut self) -> &mut BufferPool {
        &mut self.pool
    }

    /// Current trigger mode.
    pub fn trigger_mode(&self) -> TriggerMode {
        self.trigger_mode
    }

    /// Switches between data- and signal-triggered processing.
    pub fn set_trigger_mode(&mut self, mode: TriggerMode) {
        self.trigger_mode = mode;
    }

    /// Events raised and not yet handled.
    pub fn pending_events(&self) -> &PendingEvents {
        &self.pending
    }

    /// Routes a module's data around its process call.
    pub fn set_bypass(&mut self, id: ModuleId, bypass: bool) -> Result<()> {
        self.module_mut(id)?.bypass = bypass;
        Ok(())
    }

    /// Whether a module is bypassed.
    pub fn is_bypassed(&self, id: ModuleId) -> bool {
        self.modules.get(id.idx()).is_some_and(|m| m.bypass)
    }

    /// Includes or skips a module in the process loop.
    pub fn set_active(&mut self, id: ModuleId, active: bool) -> Result<()> {
        self.module_mut(id)?.active = active;
        Ok(())
    }

    /// Enables or disables the attached modules on `output`.
    pub fn set_attached_enabled(&mut self, output: OutPortId, enabled: bool) -> Result<()> {
        let owner = self.output_ref(output)?.common.module;
        let node = &mut self.modules[owner.idx()];
        let local = node.outputs.iter().position(|&o| o == output);
        for am in node.attached.iter_mut().filter(|a| Some(a.output) == local) {
            am.enabled = enabled;
        }
        Ok(())
    }

    fn module_mut(&mut self, id: ModuleId) -> Result<&mut ModuleNode> {
        self.modules
            .get_mut(id.idx())
            .ok_or(EngineError::UnknownModule(id))
    }

    pub(crate) fn input_ref(&self, id: InPortId) -> Result<&InputPort> {
        self.inputs.get(id.idx()).ok_or(EngineError::UnknownInput(id))
    }

    pub(crate) fn output_ref(&self, id: OutPortId) -> Result<&OutputPort> {
        self.outputs
            .get(id.idx())
            .ok_or(EngineError::UnknownOutput(id))
    }

    fn external_input(&self, id: InPortId) -> Result<()> {
        if self.input_ref(id)?.is_external() {
            Ok(())
        } else {
            Err(EngineError::NotExternal(format!("{id}")))
        }
    }

    fn external_output(&self, id: OutPortId) -> Result<()> {
        if self.output_ref(id)?.is_external() {
            Ok(())
        } else {
            Err(EngineError::NotExternal(format!("{id}")))
        }
    }

    // --- External data ---

    /// Copies `data` into an external input, in the port's layout.
    ///
    /// Unpacked layouts take `data` as channel 0, then channel 1 and so on.
    /// Returns the number of bytes accepted.
    pub fn push_input(&mut self, id: InPortId, data: &[u8]) -> Result<usize> {
        self.external_input(id)?;
        if data.is_empty() {
            return Ok(0);
        }
        if !self.inputs[id.idx()].common.has_buffer() && !self.acquire_input_buffer(id)? {
            return Ok(0);
        }

        let common = &self.inputs[id.idx()].common;
        let format = common.media_format;
        let staged = self.pool.attach_external(data.to_vec());
        let mut src = CommonPort::new(common.module, format, data.len() as u32);
        let bufs = format.bufs_num();
        let per_buf = (data.len() / bufs) as u32;
        let usable = per_buf as usize * bufs;
        src.bufs = (0..bufs as u32)
            .map(|c| BufView {
                block: Some(staged),
                offset: c * per_buf,
                actual_len: per_buf,
                max_len: per_buf,
            })
            .collect();
        src.origin = BufOrigin::ExtBuf;

        let port = &mut self.inputs[id.idx()];
        crate::copy::copy_port_data(&mut self.pool, &mut src, &mut port.common);
        let accepted = usable - src.total_len() as usize;
        if accepted > 0 {
            port.common.flow_state = DataFlowState::Flowing;
        }
        self.pool.detach_external(staged)?;

        #[cfg(feature = "tracing")]
        tracing::trace!("push_input: {id} accepted {accepted} of {} bytes", data.len());
        Ok(accepted)
    }

    /// Stream state of an external input: set the timestamp and flags of
    /// the data about to be pushed.
    pub fn input_stream_mut(&mut self, id: InPortId) -> Result<&mut StreamData> {
        self.external_input(id)?;
        Ok(&mut self.inputs[id.idx()].common.sdata)
    }

    /// Attaches metadata to an external input at the current end of its data
    /// plus `md.offset`.
    pub fn push_metadata(&mut self, id: InPortId, mut md: Metadata) -> Result<()> {
        self.external_input(id)?;
        let common = &mut self.inputs[id.idx()].common;
        md.offset = md.offset.saturating_add(common.total_len());
        if md.is_eos_or_dfg() {
            common.sdata.flags.marker_eos |=
                matches!(md.kind, crate::metadata::MetadataKind::EndOfStream { flushing: true });
        }
        common.sdata.metadata.push(md);
        common.flow_state = DataFlowState::Flowing;
        Ok(())
    }

    /// Changes the media format of an empty external input.
    pub fn set_input_format(&mut self, id: InPortId, format: MediaFormat) -> Result<()> {
        self.external_input(id)?;
        let port = &mut self.inputs[id.idx()];
        if !port.common.is_empty() {
            return Err(EngineError::PortBusy(format!("{id}")));
        }
        if port.common.media_format == format {
            return Ok(());
        }
        if port.common.origin != BufOrigin::ExtBuf {
            self.force_return_input(id);
        }
        let port = &mut self.inputs[id.idx()];
        port.common.media_format = format;
        port.common.flags.is_mf_valid = format.is_valid();
        self.pending.media_format = true;
        self.pending.inputs_with_new_format.push(id);
        Ok(())
    }

    /// Moves everything buffered at an external output into `dst`.
    pub fn drain_output(&mut self, id: OutPortId, dst: &mut Vec<u8>) -> Result<Drained> {
        self.external_output(id)?;
        let port = &mut self.outputs[id.idx()];
        let common = &mut port.common;
        let len = common.total_len() as usize;

        if common.has_buffer() && len > 0 {
            let unpacked = common.media_format.is_pcm_unpacked();
            let len0 = common.len_per_buf();
            for view in &common.bufs {
                let Some(bytes) = view.block.and_then(|b| self.pool.bytes(b)) else {
                    continue;
                };
                let n = if unpacked { len0 } else { view.actual_len };
                let start = view.offset as usize;
                let end = (start + n as usize).min(bytes.len());
                dst.extend_from_slice(&bytes[start.min(end)..end]);
            }
        }

        let drained = Drained {
            len,
            timestamp: common
                .sdata
                .flags
                .ts_valid
                .then_some(common.sdata.timestamp),
            end_of_frame: common.sdata.flags.end_of_frame,
            erasure: common.sdata.flags.erasure,
            metadata: core::mem::take(&mut common.sdata.metadata),
            media_format: common
                .flags
                .media_fmt_event
                .then_some(common.media_format),
        };
        common.clear_lens();
        common.sdata.flags.end_of_frame = false;
        common.sdata.flags.erasure = false;
        common.sdata.flags.marker_eos = false;
        common.flags.media_fmt_event = false;
        common.advance_ts(len as u32 / common.bufs.len().max(1) as u32);

        if let Some(block) = common.block() {
            self.detach_borrowed_views(block, None);
        }
        self.return_output_buffer(id);
        Ok(drained)
    }

    // --- Client buffers ---

    /// Gives an external input a container-owned buffer holding `len` valid bytes.
    pub fn attach_input_buffer(&mut self, id: InPortId, buf: Vec<u8>, len: usize) -> Result<()> {
        self.external_input(id)?;
        let port = &self.inputs[id.idx()];
        if port.common.bufs_num() != 1 {
            return Err(EngineError::UnsupportedLayout(format!("{id}")));
        }
        if !port.common.is_empty() {
            return Err(EngineError::PortBusy(format!("{id}")));
        }
        self.force_return_input(id);

        let cap = buf.len() as u32;
        let len = (len as u32).min(cap);
        let block = self.pool.attach_external(buf);
        let common = &mut self.inputs[id.idx()].common;
        common.bufs = vec![BufView {
            block: Some(block),
            offset: 0,
            actual_len: len,
            max_len: cap,
        }];
        common.origin = BufOrigin::ExtBuf;
        if len > 0 {
            common.flow_state = DataFlowState::Flowing;
        }
        Ok(())
    }

    /// Takes back an input's client buffer.
    ///
    /// Bytes the graph has not consumed yet move to a pool buffer first.
    pub fn detach_input_buffer(&mut self, id: InPortId) -> Result<Vec<u8>> {
        self.external_input(id)?;
        let common = &self.inputs[id.idx()].common;
        let (Some(block), BufOrigin::ExtBuf) = (common.block(), common.origin) else {
            return Err(EngineError::NoClientBuffer(format!("{id}")));
        };
        let view = common.bufs[0];
        let max_len_per_buf = common.max_len_per_buf;
        self.detach_borrowed_views(block, Some(id));

        if view.actual_len > 0 {
            let size = view.actual_len.max(max_len_per_buf);
            let Some(new_block) = self.pool.acquire(size as usize)? else {
                return Err(EngineError::PortBusy(format!("{id}")));
            };
            self.pool.copy_bytes(
                block,
                view.offset as usize,
                new_block,
                0,
                view.actual_len as usize,
            );
            let common = &mut self.inputs[id.idx()].common;
            common.bufs = vec![BufView {
                block: Some(new_block),
                offset: 0,
                actual_len: view.actual_len,
                max_len: size,
            }];
            common.origin = BufOrigin::BufMgr;
        } else {
            self.inputs[id.idx()].common.detach_views();
        }
        Ok(self.pool.detach_external(block)?)
    }

    /// Gives an external output a container-owned buffer to fill.
    pub fn attach_output_buffer(&mut self, id: OutPortId, buf: Vec<u8>) -> Result<()> {
        self.external_output(id)?;
        let port = &self.outputs[id.idx()];
        if port.common.bufs_num() != 1 {
            return Err(EngineError::UnsupportedLayout(format!("{id}")));
        }
        if !port.common.is_empty() {
            return Err(EngineError::PortBusy(format!("{id}")));
        }
        self.force_return_output(id);

        let cap = buf.len() as u32;
        let block = self.pool.attach_external(buf);
        let common = &mut self.outputs[id.idx()].common;
        common.bufs = vec![BufView {
            block: Some(block),
            offset: 0,
            actual_len: 0,
            max_len: cap,
        }];
        common.origin = BufOrigin::ExtBuf;
        Ok(())
    }

    /// Takes back an output's client buffer with the stream state of the
    /// bytes written into it.
    pub fn detach_output_buffer(&mut self, id: OutPortId) -> Result<(Vec<u8>, Drained)> {
        self.external_output(id)?;
        let common = &mut self.outputs[id.idx()].common;
        let (Some(block), BufOrigin::ExtBuf) = (common.block(), common.origin) else {
            return Err(EngineError::NoClientBuffer(format!("{id}")));
        };
        let len = common.len_per_buf();
        let drained = Drained {
            len: len as usize,
            timestamp: common
                .sdata
                .flags
                .ts_valid
                .then_some(common.sdata.timestamp),
            end_of_frame: common.sdata.flags.end_of_frame,
            erasure: common.sdata.flags.erasure,
            metadata: core::mem::take(&mut common.sdata.metadata),
            media_format: common
                .flags
                .media_fmt_event
                .then_some(common.media_format),
        };
        common.sdata.flags.end_of_frame = false;
        common.sdata.flags.erasure = false;
        common.flags.media_fmt_event = false;
        common.advance_ts(len);
        common.detach_views();

        self.detach_borrowed_views(block, None);
        let buf = self.pool.detach_external(block)?;
        Ok((buf, drained))
    }

    /// Clears empty views that borrow `block` without owning it.
    fn detach_borrowed_views(&mut self, block: BlockId, keep: Option<InPortId>) {
        let borrowed = |c: &CommonPort| {
            c.block() == Some(block)
                && matches!(c.origin, BufOrigin::ExtBufBorrowed | BufOrigin::BufMgrBorrowed)
        };
        for (i, port) in self.inputs.iter_mut().enumerate() {
            if Some(InPortId(i as u32)) != keep && borrowed(&port.common) {
                #[cfg(feature = "tracing")]
                if !port.common.is_empty() {
                    tracing::warn!("client buffer detached under {} bytes at in#{i}", port.common.total_len());
                }
                port.common.detach_views();
            }
        }
        for port in &mut self.outputs {
            if borrowed(&port.common) {
                port.common.detach_views();
            }
        }
    }

    // --- Port control ---

    /// Starts or stops an input. Stopping resets the port.
    pub fn set_input_state(&mut self, id: InPortId, state: PortState) -> Result<()> {
        self.input_ref(id)?;
        if state == PortState::Stopped {
            self.reset_input_port(id)?;
        }
        self.inputs[id.idx()].common.state = state;
        Ok(())
    }

    /// Starts or stops an output. Stopping resets the port.
    pub fn set_output_state(&mut self, id: OutPortId, state: PortState) -> Result<()> {
        self.output_ref(id)?;
        if state == PortState::Stopped {
            self.reset_output_port(id)?;
        }
        self.outputs[id.idx()].common.state = state;
        Ok(())
    }

    /// Drops buffered data, metadata and stream state of an input.
    pub fn reset_input_port(&mut self, id: InPortId) -> Result<()> {
        self.input_ref(id)?;
        let port = &mut self.inputs[id.idx()];
        port.common.clear_lens();
        reset_stream(&mut port.common);
        port.need_more_input = false;
        port.processing_began = false;
        port.disable_ts_disc_check = false;
        port.was_eof_set = false;
        port.bytes_from_prev_buf = 0;
        port.ts_to_sync = TsToSync::default();
        if port.common.origin != BufOrigin::ExtBuf {
            self.force_return_input(id);
        }
        let module = self.inputs[id.idx()].common.module;
        if let Some(m) = self.modules[module.idx()].module.as_mut() {
            m.reset();
        }
        Ok(())
    }

    /// Drops buffered data, metadata and stream state of an output.
    pub fn reset_output_port(&mut self, id: OutPortId) -> Result<()> {
        self.output_ref(id)?;
        let port = &mut self.outputs[id.idx()];
        port.common.clear_lens();
        reset_stream(&mut port.common);
        port.any_data_produced = false;
        if port.common.origin != BufOrigin::ExtBuf {
            self.force_return_output(id);
        }
        Ok(())
    }

    /// Resets timestamp and gap state after a flushing EOS or DFG leaves
    /// an input. Buffered bytes stay.
    /// Clears an input's end of frame once the frame has been consumed.
    pub(crate) fn clear_input_eof(&mut self, id: InPortId) {
        let port = &mut self.inputs[id.idx()];
        port.common.sdata.flags.end_of_frame = false;
        port.was_eof_set = false;
    }

    pub(crate) fn basic_reset_input(&mut self, id: InPortId) {
        let port = &mut self.inputs[id.idx()];
        port.common.ts_frac_ns = 0;
        port.common.sdata.flags.marker_eos = false;
        port.disable_ts_disc_check = false;
        port.was_eof_set = false;
        port.processing_began = false;
        port.bytes_from_prev_buf = 0;
        port.ts_to_sync = TsToSync::default();
        if port.common.is_empty() {
            port.common.flow_state = DataFlowState::AtGap;
        }
    }

    /// Flags every started port to give its buffer back at the next return.
    pub fn mark_buffers_to_force_return(&mut self) {
        for port in &mut self.inputs {
            if port.common.state == PortState::Started {
                port.common.flags.force_return_buf = true;
            }
        }
        for port in &mut self.outputs {
            if port.common.state == PortState::Started {
                port.common.flags.force_return_buf = true;
            }
        }
    }

    // --- Events ---

    /// Applies pending media-format and threshold events.
    ///
    /// New input formats flow through each affected module to its outputs,
    /// which then announce the format downstream. Returns whether anything
    /// was pending.
    pub fn handle_pending_events(&mut self) -> bool {
        let events = core::mem::take(&mut self.pending);
        if !events.any() && events.inputs_with_new_format.is_empty() {
            return false;
        }

        for (out, len) in events.thresholds {
            #[cfg(feature = "tracing")]
            tracing::debug!("threshold_event: {out} max_len_per_buf {len}");
            let Some(port) = self.outputs.get_mut(out.idx()) else {
                continue;
            };
            port.common.max_len_per_buf = len;
            let conn = port.conn;
            if port.common.is_empty() {
                self.force_return_output(out);
            }
            if let Some(next) = conn {
                self.inputs[next.idx()].common.max_len_per_buf = len;
                if self.inputs[next.idx()].common.is_empty() {
                    self.force_return_input(next);
                }
            }
        }

        for input in events.inputs_with_new_format {
            let format = self.inputs[input.idx()].common.media_format;
            let module = self.inputs[input.idx()].common.module;
            let outputs = self.modules[module.idx()].outputs.clone();
            for (local, out) in outputs.into_iter().enumerate() {
                let node = &mut self.modules[module.idx()];
                let new_format = match node.module.as_mut() {
                    Some(m) => m.output_format(local, format),
                    None => format,
                };
                let common = &mut self.outputs[out.idx()].common;
                if common.media_format == new_format {
                    continue;
                }
                #[cfg(feature = "tracing")]
                tracing::debug!("media_format_event: {out} of {module} -> {new_format:?}");
                common.media_format = new_format;
                common.flags.is_mf_valid = new_format.is_valid();
                common.flags.media_fmt_event = true;
                if common.is_empty() {
                    self.force_return_output(out);
                }
            }
        }

        self.pool.destroy_all_unused();
        true
    }

    // --- Graph properties ---

    /// Recomputes real-time port flags along the graph.
    ///
    /// Upstream real-time flows forward from real-time inputs, downstream
    /// real-time flows backward from real-time outputs, both only through
    /// modules that propagate the property.
    pub fn propagate_realtime(&mut self) {
        let order = self.order.clone();
        for &m in &order {
            let node = &self.modules[m.idx()];
            let upstream_rt = node.caps.propagates_realtime
                && node
                    .inputs
                    .iter()
                    .any(|i| self.inputs[i.idx()].common.flags.upstream_realtime);
            if !upstream_rt {
                continue;
            }
            for out in node.outputs.clone() {
                self.outputs[out.idx()].common.flags.upstream_realtime = true;
                if let Some(next) = self.outputs[out.idx()].conn {
                    self.inputs[next.idx()].common.flags.upstream_realtime = true;
                }
            }
        }
        for &m in order.iter().rev() {
            let node = &self.modules[m.idx()];
            let downstream_rt = node.caps.propagates_realtime
                && node
                    .outputs
                    .iter()
                    .any(|o| self.outputs[o.idx()].common.flags.downstream_realtime);
            if !downstream_rt {
                continue;
            }
            for input in node.inputs.clone() {
                self.inputs[input.idx()].common.flags.downstream_realtime = true;
                if let Some(prev) = self.inputs[input.idx()].conn {
                    self.outputs[prev.idx()].common.flags.downstream_realtime = true;
                }
            }
        }
    }

    fn derive_buffering_flags(&mut self) {
        for port in &mut self.inputs {
            port.common.flags.downstream_requires_data_buffering =
                self.modules[port.common.module.idx()].caps.requires_data_buffering;
        }
        for port in &mut self.outputs {
            if let Some(next) = port.conn {
                let m = self.inputs[next.idx()].common.module;
                port.common.flags.downstream_requires_data_buffering =
                    self.modules[m.idx()].caps.requires_data_buffering;
            }
        }
    }
}

fn reset_stream(common: &mut CommonPort) {
    common.sdata = StreamData::default();
    common.ts_frac_ns = 0;
    common.flow_state = DataFlowState::AtGap;
    common.flags.force_return_buf = true;
    common.flags.media_fmt_event = false;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{ProcessIo, ProcessStatus};

    struct Nop;

    impl Module for Nop {
        fn caps(&self) -> ModuleCaps {
            ModuleCaps::default()
        }

        fn process(&mut self, _io: &mut ProcessIo<'_>) -> ProcessStatus {
            ProcessStatus::Ok
        }
    }

    fn fmt() -> MediaFormat {
        MediaFormat::pcm(1, 48_000, 2)
    }

    #[test]
    fn sort_follows_connections() {
        let mut b = TopologyBuilder::new();
        let sink = b.add_module("sink", Box::new(Nop));
        let src = b.add_module("src", Box::new(Nop));
        let mid = b.add_passthrough("mid");
        let s_out = b.add_output(src, fmt(), 96).unwrap();
        let m_in = b.add_input(mid, fmt(), 96).unwrap();
        let m_out = b.add_output(mid, fmt(), 96).unwrap();
        let k_in = b.add_input(sink, fmt(), 96).unwrap();
        b.connect(s_out, m_in).unwrap();
        b.connect(m_out, k_in).unwrap();
        let topo = b.build().unwrap();
        assert_eq!(topo.order(), &[src, mid, sink]);
        assert_eq!(topo.module_name(mid), Some("mid"));
    }

    #[test]
    fn cycle_is_rejected() {
        let mut b = TopologyBuilder::new();
        let a = b.add_passthrough("a");
        let c = b.add_passthrough("c");
        let a_in = b.add_input(a, fmt(), 96).unwrap();
        let a_out = b.add_output(a, fmt(), 96).unwrap();
        let c_in = b.add_input(c, fmt(), 96).unwrap();
        let c_out = b.add_output(c, fmt(), 96).unwrap();
        b.connect(a_out, c_in).unwrap();
        b.connect(c_out, a_in).unwrap();
        assert_eq!(b.build().unwrap_err(), EngineError::CycleDetected);
    }

    #[test]
    fn double_connect_is_rejected() {
        let mut b = TopologyBuilder::new();
        let a = b.add_passthrough("a");
        let c = b.add_passthrough("c");
        let a_out = b.add_output(a, fmt(), 96).unwrap();
        let c_in = b.add_input(c, fmt(), 96).unwrap();
        let c_in2 = b.add_input(c, fmt(), 96).unwrap();
        b.connect(a_out, c_in).unwrap();
        assert!(matches!(
            b.connect(a_out, c_in2),
            Err(EngineError::AlreadyConnected(_))
        ));
    }

    #[test]
    fn realtime_flags_flow_both_ways() {
        let mut b = TopologyBuilder::new();
        let a = b.add_passthrough("a");
        let c = b.add_passthrough("c");
        let a_in = b.add_input(a, fmt(), 96).unwrap();
        let a_out = b.add_output(a, fmt(), 96).unwrap();
        let c_in = b.add_input(c, fmt(), 96).unwrap();
        let c_out = b.add_output(c, fmt(), 96).unwrap();
        b.connect(a_out, c_in).unwrap();
        b.realtime_input(a_in).unwrap();
        b.realtime_output(c_out).unwrap();
        let topo = b.build().unwrap();
        assert!(topo.output(c_out).unwrap().common.flags.upstream_realtime);
        assert!(topo.input(a_in).unwrap().common.flags.downstream_realtime);
        assert!(topo.input(c_in).unwrap().common.is_realtime());
    }

    #[test]
    fn push_requires_external_port() {
        let mut b = TopologyBuilder::new();
        let a = b.add_passthrough("a");
        let c = b.add_passthrough("c");
        let a_out = b.add_output(a, fmt(), 96).unwrap();
        let c_in = b.add_input(c, fmt(), 96).unwrap();
        b.connect(a_out, c_in).unwrap();
        let mut topo = b.build().unwrap();
        assert!(matches!(
            topo.push_input(c_in, &[0; 4]),
            Err(EngineError::NotExternal(_))
        ));
    }

    #[test]
    fn push_then_drain_round_trip_through_ports() {
        let mut b = TopologyBuilder::new();
        let a = b.add_passthrough("a");
        let a_in = b.add_input(a, fmt(), 8).unwrap();
        let a_out = b.add_output(a, fmt(), 8).unwrap();
        let mut topo = b.build().unwrap();

        assert_eq!(topo.push_input(a_in, &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]).unwrap(), 8);
        assert_eq!(topo.input(a_in).unwrap().common.total_len(), 8);

        let mut out = Vec::new();
        let drained = topo.drain_output(a_out, &mut out).unwrap();
        assert_eq!(drained.len, 0);
        assert!(out.is_empty());
    }
}
