//! Module plug-in contract.
//!
//! A [`Module`] is an opaque processing component. The engine reads its
//! [`ModuleCaps`] once when the module is added to a topology and calls
//! [`Module::process`] whenever the module's trigger condition holds.
//! All access to port bytes goes through [`ProcessIo`].
//!
//! # Contract
//!
//! On entry every input view holds `len` valid bytes per buffer and every
//! output view offers `capacity` bytes per buffer starting at its write
//! window. On return the module reports how much it consumed from each input
//! ([`ProcessIo::set_consumed`]) and produced into each output
//! ([`ProcessIo::set_produced`]). Unreported inputs count as fully consumed
//! and unreported outputs as empty.

#[cfg(not(feature = "std"))]
use alloc::vec::Vec;

use crate::format::MediaFormat;
use crate::pool::BufferPool;
use crate::port::{InPortId, InputPort, OutPortId, OutputPort, StreamData};
use crate::topology::PendingEvents;
use crate::trigger::TriggerPolicy;

/// Index of a module in its topology.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId(pub u32);

impl ModuleId {
    pub(crate) fn idx(self) -> usize {
        self.0 as usize
    }
}

impl core::fmt::Display for ModuleId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "module#{}", self.0)
    }
}

/// Result of one process call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    /// Processing succeeded.
    Ok,
    /// The module cannot make progress without more input.
    NeedMore,
    /// Processing failed.
    Failed,
}

/// Framing role of a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModuleKind {
    /// Ordinary processing module.
    #[default]
    Generic,
    /// Wraps data into packetized framing.
    Packetizer,
    /// Unwraps packetized framing.
    Depacketizer,
}

/// Capabilities a module declares up front.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleCaps {
    /// Output may share the input buffer (SISO only).
    pub in_place: bool,
    /// The module keeps unconsumed input across cycles.
    pub requires_data_buffering: bool,
    /// Framing role.
    pub kind: ModuleKind,
    /// Process calls per cycle.
    pub num_proc_loops: u32,
    /// Algorithmic delay in microseconds.
    pub algo_delay_us: u32,
    /// The module propagates metadata itself.
    pub owns_md_propagation: bool,
    /// Custom trigger policy.
    pub trigger_policy: Option<TriggerPolicy>,
    /// Real-time port properties flow through the module.
    pub propagates_realtime: bool,
    /// The module produces data without input.
    pub is_source: bool,
    /// The module consumes data without producing output.
    pub is_sink: bool,
}

impl Default for ModuleCaps {
    fn default() -> Self {
        Self {
            in_place: false,
            requires_data_buffering: false,
            kind: ModuleKind::Generic,
            num_proc_loops: 1,
            algo_delay_us: 0,
            owns_md_propagation: false,
            trigger_policy: None,
            propagates_realtime: true,
            is_source: false,
            is_sink: false,
        }
    }
}

impl ModuleCaps {
    /// Whether the module is a packetizer or depacketizer.
    pub fn is_framing_boundary(&self) -> bool {
        self.kind != ModuleKind::Generic
    }
}

/// A processing component driven by the engine.
pub trait Module {
    /// Capabilities, read once at construction.
    fn caps(&self) -> ModuleCaps;

    /// Processes one step.
    fn process(&mut self, io: &mut ProcessIo<'_>) -> ProcessStatus;

    /// Drops internal state after a port reset.
    fn reset(&mut self) {}

    /// Format of `output` once an input changes to `input`.
    fn output_format(&mut self, output: usize, input: MediaFormat) -> MediaFormat {
        let _ = output;
        input
    }
}

/// Input and output bytes of an in-place call.
pub enum InOut<'a> {
    /// Input and output share the same bytes.
    Aliased(&'a mut [u8]),
    /// Distinct input and output regions.
    Split(&'a [u8], &'a mut [u8]),
}

/// Port access handed to [`Module::process`].
///
/// Port indices are local to the module: input `0` is the module's first
/// input regardless of its topology-wide id.
pub struct ProcessIo<'a> {
    pub(crate) pool: &'a mut BufferPool,
    pub(crate) inputs: &'a mut [InputPort],
    pub(crate) outputs: &'a mut [OutputPort],
    pub(crate) in_ids: &'a [InPortId],
    pub(crate) out_ids: &'a [OutPortId],
    pub(crate) events: &'a mut PendingEvents,
}

impl<'a> ProcessIo<'a> {
    /// Number of inputs.
    pub fn num_inputs(&self) -> usize {
        self.in_ids.len()
    }

    /// Number of outputs.
    pub fn num_outputs(&self) -> usize {
        self.out_ids.len()
    }

    fn in_port(&self, i: usize) -> Option<&InputPort> {
        self.in_ids.get(i).map(|id| &self.inputs[id.idx()])
    }

    fn in_port_mut(&mut self, i: usize) -> Option<&mut InputPort> {
        self.in_ids.get(i).map(|id| &mut self.inputs[id.idx()])
    }

    fn out_port(&self, o: usize) -> Option<&OutputPort> {
        self.out_ids.get(o).map(|id| &self.outputs[id.idx()])
    }

    fn out_port_mut(&mut self, o: usize) -> Option<&mut OutputPort> {
        self.out_ids.get(o).map(|id| &mut self.outputs[id.idx()])
    }

    /// Stream state of input `i`.
    pub fn input(&self, i: usize) -> Option<&StreamData> {
        self.in_port(i).map(|p| &p.common.sdata)
    }

    /// Mutable stream state of input `i` (clear EOF, take metadata).
    pub fn input_mut(&mut self, i: usize) -> Option<&mut StreamData> {
        self.in_port_mut(i).map(|p| &mut p.common.sdata)
    }

    /// Stream state of output `o`.
    pub fn output(&self, o: usize) -> Option<&StreamData> {
        self.out_port(o).map(|p| &p.common.sdata)
    }

    /// Mutable stream state of output `o`.
    pub fn output_mut(&mut self, o: usize) -> Option<&mut StreamData> {
        self.out_port_mut(o).map(|p| &mut p.common.sdata)
    }

    /// Media format of input `i`.
    pub fn input_format(&self, i: usize) -> MediaFormat {
        self.in_port(i).map(|p| p.common.media_format).unwrap_or_default()
    }

    /// Media format of output `o`.
    pub fn output_format(&self, o: usize) -> MediaFormat {
        self.out_port(o).map(|p| p.common.media_format).unwrap_or_default()
    }

    /// Valid bytes per buffer at input `i`.
    pub fn input_len(&self, i: usize) -> u32 {
        self.in_port(i).map_or(0, |p| p.common.len_per_buf())
    }

    /// Write capacity per buffer at output `o`.
    pub fn output_capacity(&self, o: usize) -> u32 {
        self.out_port(o).map_or(0, |p| p.common.max_per_buf())
    }

    /// Whether output `o` has a buffer this call.
    pub fn has_output_buffer(&self, o: usize) -> bool {
        self.out_port(o).is_some_and(|p| p.common.has_buffer())
    }

    /// Valid input bytes of buffer `ch` at input `i`.
    pub fn input_bytes(&self, i: usize, ch: usize) -> &[u8] {
        let Some(view) = self.in_port(i).and_then(|p| p.common.bufs.get(ch)) else {
            return &[];
        };
        let Some(block) = view.block.and_then(|b| self.pool.bytes(b)) else {
            return &[];
        };
        clamp(block, view.offset, view.actual_len)
    }

    /// Writable window of buffer `ch` at output `o`.
    pub fn output_window(&mut self, o: usize, ch: usize) -> &mut [u8] {
        let Some(view) = self
            .out_ids
            .get(o)
            .and_then(|id| self.outputs[id.idx()].common.bufs.get(ch))
            .copied()
        else {
            return &mut [];
        };
        let Some(block) = view.block.and_then(|b| self.pool.bytes_mut(b)) else {
            return &mut [];
        };
        clamp_mut(block, view.offset, view.max_len)
    }

    /// Data already written to buffer `ch` at output `o`.
    pub fn output_data_mut(&mut self, o: usize, ch: usize) -> &mut [u8] {
        let Some(view) = self
            .out_ids
            .get(o)
            .and_then(|id| self.outputs[id.idx()].common.bufs.get(ch))
            .copied()
        else {
            return &mut [];
        };
        let Some(block) = view.block.and_then(|b| self.pool.bytes_mut(b)) else {
            return &mut [];
        };
        clamp_mut(block, view.offset, view.actual_len)
    }

    /// Input `i` buffer `ch` together with output `o` buffer `ch`.
    ///
    /// When both views start at the same byte of the same block the call
    /// is in-place and a single slice is returned.
    pub fn in_out(&mut self, i: usize, o: usize, ch: usize) -> Option<InOut<'_>> {
        let iv = *self.in_port(i)?.common.bufs.get(ch)?;
        let ov = *self.out_port(o)?.common.bufs.get(ch)?;
        let (ib, ob) = (iv.block?, ov.block?);

        if ib != ob {
            let (src, dst) = self.pool.pair_mut(ib, ob)?;
            return Some(InOut::Split(
                clamp(src, iv.offset, iv.actual_len),
                clamp_mut(dst, ov.offset, ov.max_len),
            ));
        }

        let data = self.pool.bytes_mut(ib)?;
        if iv.offset == ov.offset {
            let span = iv.max_len.max(ov.max_len);
            return Some(InOut::Aliased(clamp_mut(data, iv.offset, span)));
        }

        let in_end = iv.offset + iv.actual_len;
        let out_end = ov.offset + ov.max_len;
        if iv.offset < ov.offset && in_end <= ov.offset {
            let (head, tail) = data.split_at_mut(ov.offset as usize);
            Some(InOut::Split(
                clamp(head, iv.offset, iv.actual_len),
                clamp_mut(tail, 0, ov.max_len),
            ))
        } else if ov.offset < iv.offset && out_end <= iv.offset {
            let (head, tail) = data.split_at_mut(iv.offset as usize);
            Some(InOut::Split(
                clamp(tail, 0, iv.actual_len),
                clamp_mut(head, ov.offset, ov.max_len),
            ))
        } else {
            None
        }
    }

    /// Reports bytes consumed per buffer at input `i`.
    pub fn set_consumed(&mut self, i: usize, bytes_per_buf: u32) {
        if let Some(p) = self.in_port_mut(i) {
            for b in &mut p.common.bufs {
                b.actual_len = bytes_per_buf;
            }
        }
    }

    /// Reports bytes produced per buffer at output `o`.
    pub fn set_produced(&mut self, o: usize, bytes_per_buf: u32) {
        if let Some(p) = self.out_port_mut(o) {
            for b in &mut p.common.bufs {
                b.actual_len = bytes_per_buf;
            }
        }
    }

    /// Announces a new media format at output `o`.
    pub fn raise_media_format(&mut self, o: usize, format: MediaFormat) {
        if let Some(p) = self.out_port_mut(o) {
            p.common.media_format = format;
            p.common.flags.media_fmt_event = true;
            p.common.flags.is_mf_valid = format.is_valid();
            self.events.media_format = true;
        }
    }

    /// Requests a new buffer size per channel at output `o`.
    pub fn raise_threshold(&mut self, o: usize, max_len_per_buf: u32) {
        if let Some(&id) = self.out_ids.get(o) {
            self.events.thresholds.push((id, max_len_per_buf));
        }
    }
}

fn clamp(data: &[u8], offset: u32, len: u32) -> &[u8] {
    let start = (offset as usize).min(data.len());
    let end = (start + len as usize).min(data.len());
    &data[start..end]
}

fn clamp_mut(data: &mut [u8], offset: u32, len: u32) -> &mut [u8] {
    let start = (offset as usize).min(data.len());
    let end = (start + len as usize).min(data.len());
    &mut data[start..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolConfig;
    use crate::port::BufView;

    fn ports(pool: &mut BufferPool) -> (Vec<InputPort>, Vec<OutputPort>) {
        let fmt = MediaFormat::pcm(1, 48_000, 2);
        let mut input = InputPort::new(ModuleId(0), fmt, 16);
        let mut output = OutputPort::new(ModuleId(0), fmt, 16);
        let block = pool.attach_external((0u8..16).collect());
        input.common.bufs = vec![BufView {
            block: Some(block),
            offset: 0,
            actual_len: 4,
            max_len: 8,
        }];
        output.common.bufs = vec![BufView {
            block: Some(block),
            offset: 8,
            actual_len: 0,
            max_len: 8,
        }];
        (vec![input], vec![output])
    }

    #[test]
    fn split_regions_inside_one_block() {
        let mut pool = BufferPool::new(PoolConfig::default());
        let (mut inputs, mut outputs) = ports(&mut pool);
        let mut events = PendingEvents::default();
        let mut io = ProcessIo {
            pool: &mut pool,
            inputs: &mut inputs,
            outputs: &mut outputs,
            in_ids: &[InPortId(0)],
            out_ids: &[OutPortId(0)],
            events: &mut events,
        };
        match io.in_out(0, 0, 0) {
            Some(InOut::Split(src, dst)) => {
                assert_eq!(src, &[0, 1, 2, 3]);
                assert_eq!(dst.len(), 8);
                dst[..4].copy_from_slice(src);
            }
            _ => panic!("expected split regions"),
        }
        assert_eq!(&io.output_window(0, 0)[..4], &[0, 1, 2, 3]);
    }

    #[test]
    fn same_offset_is_aliased() {
        let mut pool = BufferPool::new(PoolConfig::default());
        let (mut inputs, mut outputs) = ports(&mut pool);
        outputs[0].common.bufs[0].offset = 0;
        let mut events = PendingEvents::default();
        let mut io = ProcessIo {
            pool: &mut pool,
            inputs: &mut inputs,
            outputs: &mut outputs,
            in_ids: &[InPortId(0)],
            out_ids: &[OutPortId(0)],
            events: &mut events,
        };
        assert!(matches!(io.in_out(0, 0, 0), Some(InOut::Aliased(buf)) if buf.len() == 8));
    }

    #[test]
    fn media_format_event_is_recorded() {
        let mut pool = BufferPool::new(PoolConfig::default());
        let (mut inputs, mut outputs) = ports(&mut pool);
        let mut events = PendingEvents::default();
        {
            let mut io = ProcessIo {
                pool: &mut pool,
                inputs: &mut inputs,
                outputs: &mut outputs,
                in_ids: &[InPortId(0)],
                out_ids: &[OutPortId(0)],
                events: &mut events,
            };
            io.raise_media_format(0, MediaFormat::pcm(2, 48_000, 2));
        }
        assert!(events.media_format);
        assert!(outputs[0].common.flags.media_fmt_event);
        assert_eq!(outputs[0].common.media_format.num_channels, 2);
    }
}
