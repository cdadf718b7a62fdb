//! Integration tests for the weir-core engine.
//!
//! Drives small topologies through the public API: buffers handed between
//! modules and back to the pool, deinterleaved appends, signal-triggered
//! scheduling, timestamp resync and discontinuities, metadata
//! travelling with the data, attached modules and container hooks.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use weir_core::{
    ContainerHooks, InOut, InPortId, Interleaving, MediaFormat, Metadata, Module, ModuleCaps,
    ModuleId, OutPortId, ProcessIo, ProcessStatus, Topology, TopologyBuilder, TriggerMode,
};

/// 1 ch, 16-bit, 48 kHz: 96 bytes per millisecond.
fn mono() -> MediaFormat {
    MediaFormat::pcm(1, 48_000, 2)
}

/// Multiplies every byte by a constant.
struct Gain(u8);

impl Module for Gain {
    fn caps(&self) -> ModuleCaps {
        ModuleCaps::default()
    }

    fn process(&mut self, io: &mut ProcessIo<'_>) -> ProcessStatus {
        let n = io.input_len(0).min(io.output_capacity(0));
        let k = self.0;
        match io.in_out(0, 0, 0) {
            Some(InOut::Split(src, dst)) => {
                for (d, s) in dst.iter_mut().zip(&src[..n as usize]) {
                    *d = s.wrapping_mul(k);
                }
            }
            Some(InOut::Aliased(buf)) => {
                for b in &mut buf[..n as usize] {
                    *b = b.wrapping_mul(k);
                }
            }
            None => return ProcessStatus::Failed,
        }
        io.set_consumed(0, n);
        io.set_produced(0, n);
        ProcessStatus::Ok
    }
}

/// Copies fixed frames and keeps the remainder for the next cycle.
struct FrameTaker {
    frame: u32,
}

impl Module for FrameTaker {
    fn caps(&self) -> ModuleCaps {
        ModuleCaps {
            requires_data_buffering: true,
            ..ModuleCaps::default()
        }
    }

    fn process(&mut self, io: &mut ProcessIo<'_>) -> ProcessStatus {
        if io.input_len(0) < self.frame {
            io.set_consumed(0, 0);
            return ProcessStatus::NeedMore;
        }
        let n = self.frame as usize;
        match io.in_out(0, 0, 0) {
            Some(InOut::Split(src, dst)) => dst[..n].copy_from_slice(&src[..n]),
            _ => return ProcessStatus::Failed,
        }
        io.set_consumed(0, self.frame);
        io.set_produced(0, self.frame);
        ProcessStatus::Ok
    }
}

/// Consumes its whole input but only produces half of it.
struct HalfTaker;

impl Module for HalfTaker {
    fn caps(&self) -> ModuleCaps {
        ModuleCaps::default()
    }

    fn process(&mut self, io: &mut ProcessIo<'_>) -> ProcessStatus {
        let half = io.input_len(0) / 2;
        if let Some(InOut::Split(src, dst)) = io.in_out(0, 0, 0) {
            dst[..half as usize].copy_from_slice(&src[..half as usize]);
        }
        io.set_consumed(0, half);
        io.set_produced(0, half);
        ProcessStatus::Ok
    }
}

/// Writes its input to every output.
struct Splitter;

impl Module for Splitter {
    fn caps(&self) -> ModuleCaps {
        ModuleCaps::default()
    }

    fn process(&mut self, io: &mut ProcessIo<'_>) -> ProcessStatus {
        let data = io.input_bytes(0, 0).to_vec();
        for o in 0..io.num_outputs() {
            let window = io.output_window(o, 0);
            let n = data.len().min(window.len());
            window[..n].copy_from_slice(&data[..n]);
            io.set_produced(o, n as u32);
        }
        ProcessStatus::Ok
    }
}

/// `source (passthrough) -> second`, external input on the source and
/// external output on `second`.
fn chain(
    mode: TriggerMode,
    second: Box<dyn Module + Send>,
    fmt: MediaFormat,
    max: u32,
) -> (Topology, InPortId, OutPortId, ModuleId) {
    let mut b = TopologyBuilder::new();
    b.trigger_mode(mode);
    let src = b.add_passthrough("source");
    let m = b.add_module("second", second);
    let src_in = b.add_input(src, fmt, max).unwrap();
    let src_out = b.add_output(src, fmt, max).unwrap();
    let m_in = b.add_input(m, fmt, max).unwrap();
    let m_out = b.add_output(m, fmt, max).unwrap();
    b.connect(src_out, m_in).unwrap();
    (b.build().unwrap(), src_in, m_out, m)
}

// ============================================================================
// 1. Buffer hand-over
// ============================================================================

#[test]
fn aliased_buffers_return_to_pool() {
    let (mut topo, input, output, _) = chain(TriggerMode::Data, Box::new(Gain(2)), mono(), 96);
    topo.push_input(input, &[3u8; 96]).unwrap();

    let report = topo.process_cycle().unwrap();
    assert_eq!(report.process_calls, 2);
    assert!(report.anything_changed);
    // Only the output of the gain still holds data.
    assert_eq!(topo.pool().stats().leased_blocks, 1);

    let mut out = Vec::new();
    let drained = topo.drain_output(output, &mut out).unwrap();
    assert_eq!(drained.len, 96);
    assert!(out.iter().all(|&b| b == 6));

    let stats = topo.pool().stats();
    assert_eq!(stats.leased_blocks, 0);
    assert_eq!(stats.allocated_blocks, 2);
    assert_eq!(stats.free_blocks, 2);
}

#[test]
fn blocks_are_reused_across_cycles() {
    let (mut topo, input, output, _) = chain(TriggerMode::Data, Box::new(Gain(1)), mono(), 96);
    let mut out = Vec::new();
    for cycle in 0..8u8 {
        topo.push_input(input, &[cycle; 96]).unwrap();
        topo.process_cycle().unwrap();
        out.clear();
        topo.drain_output(output, &mut out).unwrap();
        assert!(out.iter().all(|&b| b == cycle), "cycle {cycle}");
    }
    assert_eq!(topo.pool().stats().allocated_blocks, 2);
}

#[test]
fn bypass_passes_data_unchanged() {
    let (mut topo, input, output, gain) = chain(TriggerMode::Data, Box::new(Gain(5)), mono(), 96);
    topo.set_bypass(gain, true).unwrap();
    topo.push_input(input, &[9u8; 96]).unwrap();
    topo.process_cycle().unwrap();

    let mut out = Vec::new();
    topo.drain_output(output, &mut out).unwrap();
    assert_eq!(out, vec![9u8; 96]);
}

// ============================================================================
// 2. Deinterleaved packed append
// ============================================================================

#[test]
fn deinterleaved_append_respaces_channels() {
    // 2 ch, 1-byte samples, 64-byte buffer
    let fmt = MediaFormat::pcm(2, 48_000, 1).with_interleaving(Interleaving::DeinterleavedPacked);
    let mut b = TopologyBuilder::new();
    let m = b.add_passthrough("pass");
    let input = b.add_input(m, fmt, 64).unwrap();
    let output = b.add_output(m, fmt, 64).unwrap();
    let mut topo = b.build().unwrap();

    // 40 bytes: L = 0..20, R = 100..120
    let first: Vec<u8> = (0..20).chain(100..120).collect();
    assert_eq!(topo.push_input(input, &first).unwrap(), 40);
    // 10 bytes: L = 20..25, R = 120..125
    let second: Vec<u8> = (20..25).chain(120..125).collect();
    assert_eq!(topo.push_input(input, &second).unwrap(), 10);

    topo.process_cycle().unwrap();
    let mut out = Vec::new();
    assert_eq!(topo.drain_output(output, &mut out).unwrap().len, 50);
    let expected: Vec<u8> = (0..25).chain(100..125).collect();
    assert_eq!(out, expected);
}

#[test]
fn deinterleaved_push_stops_at_capacity() {
    let fmt = MediaFormat::pcm(2, 48_000, 1).with_interleaving(Interleaving::DeinterleavedPacked);
    let mut b = TopologyBuilder::new();
    let m = b.add_passthrough("pass");
    let input = b.add_input(m, fmt, 64).unwrap();
    b.add_output(m, fmt, 64).unwrap();
    let mut topo = b.build().unwrap();

    topo.push_input(input, &[1u8; 50]).unwrap();
    // 14 bytes free: 7 per channel
    assert_eq!(topo.push_input(input, &[2u8; 30]).unwrap(), 14);
    assert_eq!(topo.input(input).unwrap().common.len_per_buf(), 64);
}

// ============================================================================
// 3. Signal-triggered scheduling
// ============================================================================

#[test]
fn signal_waits_for_every_output() {
    let fmt = mono();
    let mut b = TopologyBuilder::new();
    b.trigger_mode(TriggerMode::Signal);
    let m = b.add_module("split", Box::new(Splitter));
    let input = b.add_input(m, fmt, 96).unwrap();
    let out0 = b.add_output(m, fmt, 96).unwrap();
    let out1 = b.add_output(m, fmt, 96).unwrap();
    let mut topo = b.build().unwrap();

    topo.push_input(input, &[4u8; 96]).unwrap();
    assert_eq!(topo.process_cycle().unwrap().process_calls, 1);

    // Only out0 is drained; out1 keeps stale data.
    let mut data = Vec::new();
    topo.drain_output(out0, &mut data).unwrap();
    topo.push_input(input, &[5u8; 96]).unwrap();

    let report = topo.process_cycle().unwrap();
    assert_eq!(report.process_calls, 0);
    assert_eq!(report.dropped_bytes, 0);
    assert!(!topo.output(out0).unwrap().common.has_buffer());
    assert_eq!(topo.output(out1).unwrap().common.len_per_buf(), 96);
    assert_eq!(topo.input(input).unwrap().common.len_per_buf(), 96);

    // Once out1 drains, the held input goes through.
    data.clear();
    topo.drain_output(out1, &mut data).unwrap();
    assert!(data.iter().all(|&b| b == 4));
    assert_eq!(topo.process_cycle().unwrap().process_calls, 1);
    data.clear();
    topo.drain_output(out0, &mut data).unwrap();
    assert_eq!(data, vec![5u8; 96]);
}

// ============================================================================
// 4. Partial consumption and timestamps
// ============================================================================

#[test]
fn owed_bytes_delay_timestamp_resync() {
    let (mut topo, input, output, taker) =
        chain(TriggerMode::Data, Box::new(FrameTaker { frame: 96 }), mono(), 192);
    let taker_in = topo.module_inputs(taker)[0];

    let stream = topo.input_stream_mut(input).unwrap();
    stream.timestamp = 0;
    stream.flags.ts_valid = true;
    topo.push_input(input, &[1u8; 64]).unwrap();
    let report = topo.process_cycle().unwrap();
    assert_eq!(report.dropped_bytes, 0);

    let port = topo.input(taker_in).unwrap();
    assert_eq!(port.common.len_per_buf(), 64);
    assert!(port.need_more_input);
    assert_eq!(port.bytes_from_prev_buf, 64);

    // Second buffer stamped 834 us after the first one ends, within tolerance.
    let stream = topo.input_stream_mut(input).unwrap();
    stream.timestamp = 1_500;
    stream.flags.ts_valid = true;
    topo.push_input(input, &[2u8; 64]).unwrap();
    topo.process_cycle().unwrap();

    // 96 consumed: 64 owed to the first buffer, 32 (333 us) of the second.
    let port = topo.input(taker_in).unwrap();
    assert_eq!(port.common.len_per_buf(), 32);
    assert_eq!(port.common.sdata.timestamp, 1_833);
    assert_eq!(port.bytes_from_prev_buf, 32);

    let mut out = Vec::new();
    let drained = topo.drain_output(output, &mut out).unwrap();
    assert_eq!(drained.len, 96);
    assert_eq!(drained.timestamp, Some(0));
    assert_eq!(&out[..64], &[1u8; 64]);
    assert_eq!(&out[64..], &[2u8; 32]);
}

#[test]
fn non_buffering_module_drops_leftover() {
    let (mut topo, input, output, m) = chain(TriggerMode::Data, Box::new(HalfTaker), mono(), 96);
    topo.push_input(input, &[7u8; 96]).unwrap();
    let report = topo.process_cycle().unwrap();
    assert_eq!(report.dropped_bytes, 48);

    let m_in = topo.module_inputs(m)[0];
    assert!(topo.input(m_in).unwrap().common.is_empty());
    let mut out = Vec::new();
    assert_eq!(topo.drain_output(output, &mut out).unwrap().len, 48);
}

/// Works in place on the first half of its input and leaves the rest.
struct HalfInPlace;

impl Module for HalfInPlace {
    fn caps(&self) -> ModuleCaps {
        ModuleCaps {
            in_place: true,
            ..ModuleCaps::default()
        }
    }

    fn process(&mut self, io: &mut ProcessIo<'_>) -> ProcessStatus {
        let half = io.input_len(0) / 2;
        io.set_consumed(0, half);
        io.set_produced(0, half);
        ProcessStatus::Ok
    }
}

#[test]
fn in_place_leftover_is_dropped() {
    let mut b = TopologyBuilder::new();
    let m = b.add_module("half", Box::new(HalfInPlace));
    let input = b.add_input(m, mono(), 96).unwrap();
    let output = b.add_output(m, mono(), 96).unwrap();
    let mut topo = b.build().unwrap();

    topo.push_input(input, &[5u8; 96]).unwrap();
    let report = topo.process_cycle().unwrap();
    assert_eq!(report.dropped_bytes, 48);
    assert!(topo.input(input).unwrap().common.is_empty());

    let mut out = Vec::new();
    assert_eq!(topo.drain_output(output, &mut out).unwrap().len, 48);
    assert_eq!(out, [5u8; 48]);
}

#[test]
fn discontinuity_holds_data_until_frame_is_consumed() {
    let fmt = mono();
    let mut b = TopologyBuilder::new();
    let src = b.add_passthrough("source");
    let m = b.add_module("gain", Box::new(Gain(1)));
    let src_in = b.add_input(src, fmt, 96).unwrap();
    let src_out = b.add_output(src, fmt, 96).unwrap();
    let m_in = b.add_input(m, fmt, 192).unwrap();
    let m_out = b.add_output(m, fmt, 96).unwrap();
    b.connect(src_out, m_in).unwrap();
    let mut topo = b.build().unwrap();

    let push = |topo: &mut Topology, fill: u8, ts: i64| {
        let stream = topo.input_stream_mut(src_in).unwrap();
        stream.timestamp = ts;
        stream.flags.ts_valid = true;
        assert_eq!(topo.push_input(src_in, &[fill; 96]).unwrap(), 96);
        topo.process_cycle().unwrap();
    };

    // The undrained output keeps `gain` from running after the first frame.
    push(&mut topo, 1, 0);
    push(&mut topo, 2, 1_000);
    // 49 ms ahead of where the buffered frame ends.
    push(&mut topo, 3, 50_000);

    for _ in 0..2 {
        let held = topo.input(m_in).unwrap();
        assert_eq!(held.common.total_len(), 96);
        assert!(held.common.sdata.flags.end_of_frame);
        assert_eq!(held.common.sdata.timestamp, 1_000);
        assert_eq!(topo.output(src_out).unwrap().common.total_len(), 96);
        topo.process_cycle().unwrap();
    }

    let mut out = Vec::new();
    let first = topo.drain_output(m_out, &mut out).unwrap();
    assert_eq!(first.timestamp, Some(0));
    assert_eq!(out, [1u8; 96]);

    topo.process_cycle().unwrap();
    out.clear();
    let ended = topo.drain_output(m_out, &mut out).unwrap();
    assert_eq!(out, [2u8; 96]);
    assert_eq!(ended.timestamp, Some(1_000));
    assert!(ended.end_of_frame);

    topo.process_cycle().unwrap();
    out.clear();
    let resumed = topo.drain_output(m_out, &mut out).unwrap();
    assert_eq!(out, [3u8; 96]);
    assert_eq!(resumed.timestamp, Some(50_000));
    assert!(topo.output(src_out).unwrap().common.is_empty());
}

// ============================================================================
// 5. Metadata
// ============================================================================

#[test]
fn metadata_follows_data_through_chain() {
    let (mut topo, input, output, _) = chain(TriggerMode::Data, Box::new(Gain(1)), mono(), 96);
    topo.push_metadata(input, Metadata::new(7, 0)).unwrap();
    topo.push_input(input, &[1u8; 96]).unwrap();
    topo.process_cycle().unwrap();

    let mut out = Vec::new();
    let drained = topo.drain_output(output, &mut out).unwrap();
    let ids: Vec<(u32, u32)> = drained.metadata.iter().map(|m| (m.id, m.offset)).collect();
    assert_eq!(ids, vec![(7, 0)]);
}

#[test]
fn flushing_eos_reaches_output() {
    let (mut topo, input, output, _) = chain(TriggerMode::Data, Box::new(Gain(1)), mono(), 96);
    topo.push_input(input, &[1u8; 96]).unwrap();
    topo.push_metadata(input, Metadata::eos(0, true)).unwrap();
    topo.process_cycle().unwrap();

    let mut out = Vec::new();
    let drained = topo.drain_output(output, &mut out).unwrap();
    assert_eq!(drained.len, 96);
    assert!(drained.metadata.has_flushing_eos());
    assert_eq!(drained.metadata.iter().next().map(|m| m.offset), Some(96));
}

// ============================================================================
// 6. Attached modules, paths and container hooks
// ============================================================================

/// Adds one to every byte already written to its output.
struct AddOne;

impl Module for AddOne {
    fn caps(&self) -> ModuleCaps {
        ModuleCaps::default()
    }

    fn process(&mut self, io: &mut ProcessIo<'_>) -> ProcessStatus {
        for b in io.output_data_mut(0, 0) {
            *b = b.wrapping_add(1);
        }
        ProcessStatus::Ok
    }
}

/// Consumes its whole input.
struct Sink;

impl Module for Sink {
    fn caps(&self) -> ModuleCaps {
        ModuleCaps {
            is_sink: true,
            ..ModuleCaps::default()
        }
    }

    fn process(&mut self, io: &mut ProcessIo<'_>) -> ProcessStatus {
        let n = io.input_len(0);
        io.set_consumed(0, n);
        ProcessStatus::Ok
    }
}

struct CountFrames(Arc<AtomicUsize>);

impl ContainerHooks for CountFrames {
    fn frame_done(&mut self, _module: ModuleId) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }
}

#[test]
fn attached_module_sees_produced_data() {
    let mut b = TopologyBuilder::new();
    let src = b.add_passthrough("source");
    let m = b.add_module("gain", Box::new(Gain(2)));
    let src_in = b.add_input(src, mono(), 96).unwrap();
    let src_out = b.add_output(src, mono(), 96).unwrap();
    let m_in = b.add_input(m, mono(), 96).unwrap();
    let m_out = b.add_output(m, mono(), 96).unwrap();
    b.connect(src_out, m_in).unwrap();
    b.attach(m_out, Box::new(AddOne)).unwrap();
    let mut topo = b.build().unwrap();

    topo.push_input(src_in, &[1u8; 32]).unwrap();
    topo.process_cycle().unwrap();
    let mut out = Vec::new();
    topo.drain_output(m_out, &mut out).unwrap();
    assert_eq!(out, vec![3u8; 32]);

    topo.set_attached_enabled(m_out, false).unwrap();
    topo.push_input(src_in, &[1u8; 32]).unwrap();
    topo.process_cycle().unwrap();
    out.clear();
    topo.drain_output(m_out, &mut out).unwrap();
    assert_eq!(out, vec![2u8; 32]);
}

#[test]
fn path_restricts_processing() {
    let mut b = TopologyBuilder::new();
    let src = b.add_passthrough("source");
    let m = b.add_module("gain", Box::new(Gain(1)));
    let src_in = b.add_input(src, mono(), 96).unwrap();
    let src_out = b.add_output(src, mono(), 96).unwrap();
    let m_in = b.add_input(m, mono(), 96).unwrap();
    let m_out = b.add_output(m, mono(), 96).unwrap();
    b.connect(src_out, m_in).unwrap();
    b.path_index(m, 1).unwrap();
    let mut topo = b.build().unwrap();

    topo.push_input(src_in, &[4u8; 96]).unwrap();
    assert_eq!(topo.process_path(0).unwrap().process_calls, 1);
    let mut out = Vec::new();
    assert_eq!(topo.drain_output(m_out, &mut out).unwrap().len, 0);

    assert_eq!(topo.process_path(1).unwrap().process_calls, 1);
    assert_eq!(topo.drain_output(m_out, &mut out).unwrap().len, 96);
    assert_eq!(out, vec![4u8; 96]);
}

#[test]
fn sink_reports_frame_done() {
    let frames = Arc::new(AtomicUsize::new(0));
    let mut b = TopologyBuilder::new();
    b.hooks(Box::new(CountFrames(Arc::clone(&frames))));
    let src = b.add_passthrough("source");
    let sink = b.add_module("sink", Box::new(Sink));
    let src_in = b.add_input(src, mono(), 96).unwrap();
    let src_out = b.add_output(src, mono(), 96).unwrap();
    let sink_in = b.add_input(sink, mono(), 96).unwrap();
    b.connect(src_out, sink_in).unwrap();
    let mut topo = b.build().unwrap();

    for _ in 0..3 {
        topo.push_input(src_in, &[0u8; 96]).unwrap();
        topo.process_cycle().unwrap();
    }
    assert_eq!(frames.load(Ordering::Relaxed), 3);
    assert_eq!(topo.pool().stats().leased_blocks, 0);
}
