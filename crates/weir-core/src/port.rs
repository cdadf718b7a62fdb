//! Port state shared by inputs and outputs.
//!
//! A port never holds a slice. Its buffer views name a [`BlockId`] plus an
//! offset and lengths; bytes are reached through the
//! [`BufferPool`](crate::pool::BufferPool) that owns the block.

#[cfg(not(feature = "std"))]
use alloc::vec::Vec;

use crate::format::MediaFormat;
use crate::metadata::MetadataList;
use crate::module::ModuleId;
use crate::pool::BlockId;

/// Index of an input port in its topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InPortId(pub u32);

/// Index of an output port in its topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutPortId(pub u32);

impl core::fmt::Display for InPortId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "in#{}", self.0)
    }
}

impl core::fmt::Display for OutPortId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "out#{}", self.0)
    }
}

impl InPortId {
    pub(crate) fn idx(self) -> usize {
        self.0 as usize
    }
}

impl OutPortId {
    pub(crate) fn idx(self) -> usize {
        self.0 as usize
    }
}

/// Window onto a block: `actual_len` bytes of data at `offset`, room for `max_len`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufView {
    /// Block the view points into, `None` when unassigned.
    pub block: Option<BlockId>,
    /// Byte offset of the view inside the block.
    pub offset: u32,
    /// Bytes of valid data.
    pub actual_len: u32,
    /// Capacity of the view.
    pub max_len: u32,
}

impl BufView {
    /// Free space after the valid data.
    pub fn free(&self) -> u32 {
        self.max_len.saturating_sub(self.actual_len)
    }
}

/// Where a port's buffer came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BufOrigin {
    /// No buffer.
    #[default]
    None,
    /// Leased from the pool; this port holds a reference.
    BufMgr,
    /// Points into another port's pool block without a reference.
    BufMgrBorrowed,
    /// Container-owned client buffer held by this port.
    ExtBuf,
    /// Points into a container-owned buffer held by another port.
    ExtBufBorrowed,
}

/// Whether data is flowing through a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataFlowState {
    /// No data since start or since the last gap.
    #[default]
    AtGap,
    /// Data has begun to flow.
    Flowing,
}

/// Run state of a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PortState {
    /// Ports are visited by the process loop.
    #[default]
    Started,
    /// Ports are skipped.
    Stopped,
}

/// Per-port stream control flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamFlags {
    /// End of frame: discontinuity or end of a logical frame.
    pub end_of_frame: bool,
    /// A flushing end-of-stream marker is pending on this port.
    pub marker_eos: bool,
    /// `timestamp` is meaningful.
    pub ts_valid: bool,
    /// The timestamp continues the previous one without a sync point.
    pub ts_continue: bool,
    /// The buffer represents lost data.
    pub erasure: bool,
}

/// Timestamp, flags and metadata that travel with a port's data.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamData {
    /// Timestamp of the first buffered byte in microseconds.
    pub timestamp: i64,
    /// Control flags.
    pub flags: StreamFlags,
    /// Attached metadata.
    pub metadata: MetadataList,
}

/// Framework-level port properties.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortFlags {
    /// Return the buffer at the next opportunity even in low-latency mode.
    pub force_return_buf: bool,
    /// The port's downstream is real-time.
    pub downstream_realtime: bool,
    /// The port's upstream is real-time.
    pub upstream_realtime: bool,
    /// The downstream module buffers data across cycles.
    pub downstream_requires_data_buffering: bool,
    /// A media format change is waiting to be propagated from this port.
    pub media_fmt_event: bool,
    /// The port's media format has been negotiated.
    pub is_mf_valid: bool,
    /// The module needs a full buffer on this port before it can run.
    pub has_threshold: bool,
}

/// State common to input and output ports.
#[derive(Debug, Clone, Default)]
pub struct CommonPort {
    /// Owning module.
    pub module: ModuleId,
    /// Buffer views: one per channel for unpacked layouts, one otherwise.
    pub bufs: Vec<BufView>,
    /// Capacity per buffer view when a fresh buffer is acquired.
    pub max_len_per_buf: u32,
    /// Where the current buffer came from.
    pub origin: BufOrigin,
    /// Data-flow state.
    pub flow_state: DataFlowState,
    /// Run state.
    pub state: PortState,
    /// Current media format.
    pub media_format: MediaFormat,
    /// Framework flags.
    pub flags: PortFlags,
    /// Timestamp, flags, metadata.
    pub sdata: StreamData,
    /// Sub-microsecond timestamp carry.
    pub ts_frac_ns: u64,
}

impl CommonPort {
    pub(crate) fn new(module: ModuleId, media_format: MediaFormat, max_len_per_buf: u32) -> Self {
        Self {
            module,
            media_format,
            max_len_per_buf,
            flags: PortFlags {
                is_mf_valid: media_format.is_valid(),
                ..PortFlags::default()
            },
            ..Self::default()
        }
    }

    /// Number of buffer views the current format needs.
    pub fn bufs_num(&self) -> usize {
        self.media_format.bufs_num()
    }

    /// Whether a buffer is assigned.
    pub fn has_buffer(&self) -> bool {
        self.bufs.first().is_some_and(|b| b.block.is_some())
    }

    /// The block backing view 0.
    pub fn block(&self) -> Option<BlockId> {
        self.bufs.first().and_then(|b| b.block)
    }

    /// Valid bytes in view 0.
    pub fn len_per_buf(&self) -> u32 {
        self.bufs.first().map_or(0, |b| b.actual_len)
    }

    /// Capacity of view 0.
    pub fn max_per_buf(&self) -> u32 {
        self.bufs.first().map_or(0, |b| b.max_len)
    }

    /// Valid bytes across all views.
    pub fn total_len(&self) -> u32 {
        if self.media_format.is_pcm_unpacked() {
            self.len_per_buf() * self.bufs.len() as u32
        } else {
            self.bufs.iter().map(|b| b.actual_len).sum()
        }
    }

    /// Capacity across all views.
    pub fn total_max(&self) -> u32 {
        self.max_len_per_buf * self.bufs_num() as u32
    }

    /// Whether view 0 holds data.
    pub fn has_data(&self) -> bool {
        self.len_per_buf() > 0
    }

    /// Whether the port holds nothing the framework must preserve.
    pub fn is_empty(&self) -> bool {
        self.total_len() == 0
    }

    /// Sets every view length to the same value.
    pub fn set_all_lens(&mut self, len: u32) {
        for b in &mut self.bufs {
            b.actual_len = len;
        }
    }

    /// Sets every view length to zero.
    pub fn clear_lens(&mut self) {
        self.set_all_lens(0);
    }

    /// Duration of the buffered data.
    pub fn buffered_us(&self) -> u64 {
        self.media_format.len_per_buf_to_us(self.len_per_buf(), None)
    }

    /// Advances the timestamp by the duration of `len_per_buf` bytes.
    pub fn advance_ts(&mut self, len_per_buf: u32) {
        if self.sdata.flags.ts_valid {
            let us = self
                .media_format
                .len_per_buf_to_us(len_per_buf, Some(&mut self.ts_frac_ns));
            self.sdata.timestamp += us as i64;
        }
    }

    /// Whether the port is on a real-time path.
    pub fn is_realtime(&self) -> bool {
        self.flags.downstream_realtime || self.flags.upstream_realtime
    }

    pub(crate) fn detach_views(&mut self) {
        self.bufs.clear();
        self.origin = BufOrigin::None;
    }
}

/// Target of the sync performed once bytes carried from an earlier buffer drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TsToSync {
    /// Timestamp of the newest incoming buffer.
    pub ivalue: i64,
    /// Sub-microsecond carry.
    pub fvalue: u64,
    /// Whether `ivalue` is valid.
    pub valid: bool,
    /// Whether the incoming timestamp continues the previous one.
    pub continue_ts: bool,
}

/// Input port state.
#[derive(Debug, Clone, Default)]
pub struct InputPort {
    /// Shared port state.
    pub common: CommonPort,
    /// Upstream output, `None` for external inputs.
    pub conn: Option<OutPortId>,
    /// The module asked for more input.
    pub need_more_input: bool,
    /// Processing has begun since the last reset.
    pub processing_began: bool,
    /// Timestamp discontinuity checks are suspended.
    pub disable_ts_disc_check: bool,
    /// An end-of-frame has been propagated since the last reset.
    pub was_eof_set: bool,
    /// Bytes per buffer still owed to the previous incoming buffer.
    pub bytes_from_prev_buf: u32,
    /// Timestamp to adopt once `bytes_from_prev_buf` drains.
    pub ts_to_sync: TsToSync,
}

impl InputPort {
    pub(crate) fn new(module: ModuleId, media_format: MediaFormat, max_len_per_buf: u32) -> Self {
        Self {
            common: CommonPort::new(module, media_format, max_len_per_buf),
            ..Self::default()
        }
    }

    /// Whether the port is fed by the container.
    pub fn is_external(&self) -> bool {
        self.conn.is_none()
    }
}

/// Output port state.
#[derive(Debug, Clone, Default)]
pub struct OutputPort {
    /// Shared port state.
    pub common: CommonPort,
    /// Downstream input, `None` for external outputs.
    pub conn: Option<InPortId>,
    /// The last process call produced bytes, metadata or erasure.
    pub any_data_produced: bool,
}

impl OutputPort {
    pub(crate) fn new(module: ModuleId, media_format: MediaFormat, max_len_per_buf: u32) -> Self {
        Self {
            common: CommonPort::new(module, media_format, max_len_per_buf),
            ..Self::default()
        }
    }

    /// Whether the port is drained by the container.
    pub fn is_external(&self) -> bool {
        self.conn.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::Interleaving;

    fn port(fmt: MediaFormat) -> CommonPort {
        CommonPort::new(ModuleId(0), fmt, 64)
    }

    #[test]
    fn unpacked_total_len_uses_channel_zero() {
        let fmt = MediaFormat::pcm(2, 48_000, 2).with_interleaving(Interleaving::DeinterleavedUnpackedV2);
        let mut p = port(fmt);
        p.bufs = vec![
            BufView {
                actual_len: 8,
                max_len: 64,
                ..BufView::default()
            },
            BufView {
                actual_len: 0,
                max_len: 64,
                ..BufView::default()
            },
        ];
        assert_eq!(p.total_len(), 16);
    }

    #[test]
    fn advance_ts_only_when_valid() {
        let mut p = port(MediaFormat::pcm(1, 48_000, 2));
        p.sdata.timestamp = 100;
        p.advance_ts(96);
        assert_eq!(p.sdata.timestamp, 100);
        p.sdata.flags.ts_valid = true;
        p.advance_ts(96);
        assert_eq!(p.sdata.timestamp, 1_100);
    }

    #[test]
    fn empty_port_has_no_buffer() {
        let p = port(MediaFormat::pcm(1, 48_000, 2));
        assert!(!p.has_buffer());
        assert_eq!(p.len_per_buf(), 0);
        assert!(p.is_empty());
        assert!(p.flags.is_mf_valid);
    }
}
