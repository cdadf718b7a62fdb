//! Module process driver.
//!
//! [`Topology::process_module`] wraps one call of [`Module::process`] with
//! the framework work around it:
//!
//! 1. **Pre-process**: flush zeros for algorithmic delay at EOS, snapshot
//!    input lengths and flags, carry the SISO timestamp to an empty output,
//!    present outputs that still hold data as windows past that data.
//! 2. **Invoke** the module, or the bypass copy for bypassed and
//!    module-less nodes.
//! 3. **Outputs**: run attached modules on the new data, restore windows,
//!    check overflow, mark data flow.
//! 4. **Inputs**: need-more detection, unconsumed-data drops, EOF
//!    hand-over, timestamp advance, metadata propagation, compaction and
//!    timestamp resync.
//!
//! [`Module::process`]: crate::module::Module::process

#[cfg(not(feature = "std"))]
use alloc::vec::Vec;

use crate::copy::copy_unit;
use crate::error::{EngineError, Invariant, Result};
use crate::format::{DataFormat, Interleaving, MediaFormat};
use crate::module::{ModuleId, ModuleKind, ProcessIo, ProcessStatus};
use crate::pool::BufferPool;
use crate::port::{CommonPort, DataFlowState, InPortId, OutPortId};
use crate::topology::Topology;
use crate::trigger::TriggerMode;

/// Reports a structural invariant violation.
///
/// Fatal under the `validation` feature; otherwise logged and the caller
/// clamps.
pub(crate) fn violation(v: Invariant) -> Result<()> {
    #[cfg(feature = "tracing")]
    tracing::error!("invariant violated: {v}");
    #[cfg(feature = "validation")]
    return Err(v.into());
    #[cfg(not(feature = "validation"))]
    {
        let _ = v;
        Ok(())
    }
}

/// Bytes across all buffers for per-buffer lengths `lens`.
fn total_of(fmt: MediaFormat, lens: &[u32]) -> u32 {
    if fmt.is_pcm_unpacked() {
        lens.first().copied().unwrap_or(0) * lens.len() as u32
    } else {
        lens.iter().sum()
    }
}

struct InputOutcome {
    id: InPortId,
    given: Vec<u32>,
    consumed: Vec<u32>,
    dropped: u32,
}

impl Topology {
    /// Runs one sub-loop of module `m`. Returns whether the module asked to
    /// stop looping this cycle.
    pub(crate) fn process_module(&mut self, m: ModuleId, final_loop: bool) -> Result<bool> {
        let in_ids = self.modules[m.idx()].inputs.clone();
        let out_ids = self.modules[m.idx()].outputs.clone();
        let node = &self.modules[m.idx()];
        let fwk_md = !node.caps.owns_md_propagation;
        let siso = node.is_siso();
        let is_sink = node.is_sink();
        let requires_buffering = node.caps.requires_data_buffering;
        let kind = node.caps.kind;
        let algo_delay_us = node.caps.algo_delay_us;
        let signal = self.trigger_mode == TriggerMode::Signal;

        // --- Pre-process ---

        if fwk_md && siso && algo_delay_us > 0 {
            self.push_zeros_at_eos(m, in_ids[0], algo_delay_us)?;
        }
        for &i in &in_ids {
            let c = &mut self.inputs[i.idx()].common;
            if c.media_format.interleaving == Interleaving::DeinterleavedUnpacked {
                let len0 = c.len_per_buf();
                c.set_all_lens(len0);
            }
            let s = &mut self.in_scratch[i.idx()];
            s.prev_len.clear();
            s.prev_len.extend(c.bufs.iter().map(|v| v.actual_len));
            s.prev_eos_dfg = c.sdata.flags.marker_eos || c.sdata.metadata.has_dfg();
            s.prev_eof = c.sdata.flags.end_of_frame;
        }
        if siso {
            self.carry_siso_timestamp(in_ids[0], out_ids[0], algo_delay_us);
        }
        for &o in &out_ids {
            let c = &mut self.outputs[o.idx()].common;
            let s = &mut self.out_scratch[o.idx()];
            s.prev_len.clear();
            s.prev_len.extend(c.bufs.iter().map(|v| v.actual_len));
            s.flags = c.sdata.flags;
            s.timestamp = c.sdata.timestamp;
            s.md = core::mem::take(&mut c.sdata.metadata);
            open_window(c, &s.prev_len);
        }

        // --- Invoke ---

        let bypass = self.modules[m.idx()].bypass;
        let status = if bypass || self.modules[m.idx()].module.is_none() {
            if siso {
                self.bypass_copy(in_ids[0], out_ids[0]);
            }
            ProcessStatus::Ok
        } else if let Some(module) = self.modules[m.idx()].module.as_mut() {
            let mut io = ProcessIo {
                pool: &mut self.pool,
                inputs: &mut self.inputs,
                outputs: &mut self.outputs,
                in_ids: &in_ids,
                out_ids: &out_ids,
                events: &mut self.pending,
            };
            module.process(&mut io)
        } else {
            ProcessStatus::Ok
        };
        self.report.process_calls += 1;

        // --- Outputs ---

        let revert_changes = fwk_md && kind != ModuleKind::Depacketizer;
        let mut produced_first = None;
        let mut produced_totals = Vec::with_capacity(out_ids.len());
        for (local, &o) in out_ids.iter().enumerate() {
            if revert_changes {
                let s = &self.out_scratch[o.idx()];
                let c = &mut self.outputs[o.idx()].common;
                if !c.sdata.metadata.is_empty() {
                    #[cfg(feature = "tracing")]
                    tracing::debug!("{m}: dropping metadata written to {o} without ownership");
                    c.sdata.metadata.clear();
                }
                c.sdata.flags.end_of_frame = s.flags.end_of_frame;
                c.sdata.flags.marker_eos = s.flags.marker_eos;
            }
            if let Some(c) = self.outputs.get_mut(o.idx())
                && c.common.media_format.is_pcm_unpacked()
            {
                let len0 = c.common.len_per_buf();
                c.common.set_all_lens(len0);
            }
            let produced: Vec<u32> = self.outputs[o.idx()]
                .common
                .bufs
                .iter()
                .map(|v| v.actual_len)
                .collect();
            let produced0 = produced.first().copied().unwrap_or(0);
            if produced0 > 0 {
                self.run_attached(m, local, o);
            }

            let s = &self.out_scratch[o.idx()];
            let c = &mut self.outputs[o.idx()].common;
            close_window(&mut self.pool, c, &s.prev_len);
            for v in c.bufs.iter_mut() {
                if v.actual_len > v.max_len {
                    violation(Invariant::Overflow {
                        module: m,
                        len: v.actual_len,
                        max: v.max_len,
                    })?;
                    v.actual_len = v.max_len;
                }
            }

            let prev0 = s.prev_len.first().copied().unwrap_or(0);
            if prev0 > 0 && c.sdata.timestamp != s.timestamp {
                let stale_us = c.media_format.len_per_buf_to_us(prev0, None);
                c.sdata.timestamp -= stale_us as i64;
            }
            let fmt = c.media_format;
            if produced_first.is_none() && c.has_buffer() {
                produced_first = Some(produced0);
            }
            if produced0 > 0 || !c.sdata.metadata.is_empty() || c.sdata.flags.erasure {
                c.flow_state = DataFlowState::Flowing;
                self.outputs[o.idx()].any_data_produced = true;
            }
            produced_totals.push(total_of(fmt, &produced));
        }
        let produced_first = produced_first.unwrap_or(0);

        // --- Inputs ---

        let at_least_one_eof = in_ids
            .iter()
            .any(|i| self.in_scratch[i.idx()].prev_eof);
        let events_pending = self.pending.any();
        let mut terminate = false;
        let mut mimo_eof = false;
        let mut outcomes = Vec::with_capacity(in_ids.len());

        for &i in &in_ids {
            let given = self.in_scratch[i.idx()].prev_len.clone();
            let port = &self.inputs[i.idx()];
            let fmt = port.common.media_format;
            let mut consumed: Vec<u32> = port.common.bufs.iter().map(|v| v.actual_len).collect();

            if fmt.interleaving == Interleaving::DeinterleavedUnpacked
                && fmt.is_pcm_unpacked()
                && let Some(channel) = consumed.iter().position(|&c| c != consumed[0])
            {
                violation(Invariant::UnequalChannelLengths { module: m, channel })?;
            }
            for (c, g) in consumed.iter_mut().zip(&given) {
                if *c > *g {
                    violation(Invariant::OverConsumed { module: m, port: i })?;
                    *c = *g;
                }
            }
            if fmt.is_pcm_unpacked() {
                let c0 = consumed.first().copied().unwrap_or(0);
                consumed.iter_mut().for_each(|c| *c = c0);
            }

            let given0 = given.first().copied().unwrap_or(0);
            let consumed0 = consumed.first().copied().unwrap_or(0);
            let remaining0 = given0 - consumed0;
            let need_more = status == ProcessStatus::NeedMore
                || remaining0 == 0
                || (consumed0 == 0 && produced_first == 0);
            if need_more {
                terminate = true;
                let full = remaining0 == port.common.max_per_buf();
                self.inputs[i.idx()].need_more_input = !full;
            }

            let mut dropped = 0;
            if (final_loop || terminate) && remaining0 > 0 && !events_pending {
                let c = &self.inputs[i.idx()].common;
                let drop = if signal && c.is_realtime() && fmt.data_format == DataFormat::Pcm {
                    #[cfg(feature = "tracing")]
                    tracing::error!("{m}: dropping {remaining0} late bytes at {i}");
                    true
                } else {
                    let this_eof = self.in_scratch[i.idx()].prev_eof;
                    !requires_buffering && !(at_least_one_eof && !this_eof)
                };
                if drop {
                    dropped = total_of(fmt, &given) - total_of(fmt, &consumed);
                    consumed.clone_from(&given);
                }
            }

            if fwk_md && self.inputs[i.idx()].common.sdata.flags.end_of_frame {
                let held = self.modules[m.idx()].pending_zeros_at_eos > 0;
                if siso && !held {
                    let o = out_ids[0];
                    let out_len = self.outputs[o.idx()].common.len_per_buf();
                    let c = &self.inputs[i.idx()].common;
                    let out_fmt = self.outputs[o.idx()].common.media_format;
                    let decoder_like = c.flags.has_threshold
                        && requires_buffering
                        && !(fmt.data_format == DataFormat::Pcm && out_fmt.data_format == DataFormat::Pcm);
                    if !decoder_like || !c.sdata.flags.marker_eos || (out_len == 0 && need_more) {
                        let mut pending = given0 - consumed.first().copied().unwrap_or(0);
                        if pending > 0 && out_len == 0 {
                            dropped += total_of(fmt, &given) - total_of(fmt, &consumed);
                            consumed.clone_from(&given);
                            pending = 0;
                        }
                        if pending == 0 {
                            self.clear_input_eof(i);
                            self.outputs[o.idx()].common.sdata.flags.end_of_frame = true;
                        }
                    }
                } else if is_sink || out_ids.is_empty() {
                    self.clear_input_eof(i);
                } else if !held && given0 == consumed.first().copied().unwrap_or(0) {
                    self.clear_input_eof(i);
                    mimo_eof = true;
                }
            }

            let consumed0 = consumed.first().copied().unwrap_or(0);
            if consumed0 > 0 {
                let port = &mut self.inputs[i.idx()];
                let before = port.common.sdata.timestamp;
                port.common.advance_ts(consumed0);
                if port.common.sdata.timestamp != before || !port.common.sdata.flags.ts_valid {
                    port.disable_ts_disc_check = false;
                }
                port.processing_began = true;
            }
            if dropped > 0 {
                self.report.dropped_bytes += u64::from(dropped);
            }
            outcomes.push(InputOutcome {
                id: i,
                given,
                consumed,
                dropped,
            });
        }
        if mimo_eof {
            for &o in &out_ids {
                self.outputs[o.idx()].common.sdata.flags.end_of_frame = true;
            }
        }

        if fwk_md {
            self.propagate_metadata(m, &outcomes, &out_ids, &produced_totals);
        }

        // --- Second input pass ---

        let inplace = self.is_inplace_siso(m);
        for oc in &outcomes {
            let i = oc.id;
            let consumed0 = oc.consumed.first().copied().unwrap_or(0);
            if consumed0 > 0 {
                self.report.anything_changed = true;
            }

            let mut remaining: Vec<u32> = oc.given.iter().zip(&oc.consumed).map(|(g, c)| g - c).collect();
            let shares_output = inplace
                && self.inputs[i.idx()].common.block().is_some()
                && self.inputs[i.idx()].common.block() == self.outputs[out_ids[0].idx()].common.block();
            if shares_output && remaining.iter().any(|&r| r > 0) {
                #[cfg(feature = "tracing")]
                tracing::error!(
                    "{m}: in-place module left {} bytes unconsumed",
                    oc.given.first().copied().unwrap_or(0) - consumed0
                );
                let c = &mut self.inputs[i.idx()].common;
                let left = total_of(c.media_format, &remaining);
                c.sdata.metadata.drop_within(left, true);
                self.report.dropped_bytes += u64::from(left);
                remaining.iter_mut().for_each(|r| *r = 0);
            }

            let block = self.inputs[i.idx()].common.block();
            let borrowed = block.is_some_and(|b| self.block_has_borrowers(b, Some(i)));
            let c = &mut self.inputs[i.idx()].common;
            if consumed0 > 0 && remaining.iter().any(|&r| r > 0) {
                if borrowed {
                    advance_views(c, &oc.consumed);
                } else {
                    compact_input(&mut self.pool, c, &oc.given, &oc.consumed);
                }
            }
            for (v, r) in c.bufs.iter_mut().zip(&remaining) {
                v.actual_len = *r;
            }

            let has_eos_dfg = c.sdata.flags.marker_eos || c.sdata.metadata.has_dfg();
            let eof_now = c.sdata.flags.end_of_frame;
            self.sync_to_input_timestamp(i, consumed0);
            let s = &self.in_scratch[i.idx()];
            let (prev_eos_dfg, prev_eof) = (s.prev_eos_dfg, s.prev_eof);
            if prev_eos_dfg && !has_eos_dfg {
                self.basic_reset_input(i);
            }
            if prev_eof && !eof_now {
                self.report.anything_changed = true;
            }
            if is_sink && consumed0 > 0 {
                self.hooks.frame_done(m);
            }
        }

        // --- Output pass ---

        for &o in &out_ids {
            let s = &mut self.out_scratch[o.idx()];
            let c = &mut self.outputs[o.idx()].common;
            let prev_total = total_of(c.media_format, &s.prev_len);
            let fresh = core::mem::take(&mut c.sdata.metadata);
            let mut merged = core::mem::take(&mut s.md);
            if !fresh.is_empty() {
                merged.append_shifted(fresh, prev_total);
                self.report.anything_changed = true;
            }
            c.sdata.metadata = merged;
            if c.sdata.flags.end_of_frame || c.total_len() > prev_total {
                self.report.anything_changed = true;
            }
        }

        if status == ProcessStatus::Failed {
            #[cfg(feature = "tracing")]
            tracing::error!("{m} '{}' failed to process", self.modules[m.idx()].name);
            return Err(EngineError::ModuleFailed(m));
        }
        Ok(terminate)
    }

    /// Copies input to output for bypassed and module-less SISO nodes.
    fn bypass_copy(&mut self, i: InPortId, o: OutPortId) {
        let (inputs, outputs) = (&mut self.inputs, &mut self.outputs);
        let ic = &mut inputs[i.idx()].common;
        let oc = &mut outputs[o.idx()].common;
        let unpacked = ic.media_format.is_pcm_unpacked();
        let unit = copy_unit(ic);
        let len0 = ic.len_per_buf().min(oc.bufs.first().map_or(0, |v| v.max_len)) / unit * unit;
        if ic.media_format.is_deinterleaved_packed() && len0 != ic.len_per_buf() {
            #[cfg(feature = "tracing")]
            tracing::warn!("bypass: {o} too small for deinterleaved {i}");
            ic.clear_lens();
            return;
        }
        for (iv, ov) in ic.bufs.iter_mut().zip(oc.bufs.iter_mut()) {
            let n = if unpacked {
                len0
            } else {
                iv.actual_len.min(ov.max_len) / unit * unit
            };
            let aliased = iv.block == ov.block && iv.offset == ov.offset;
            if !aliased
                && let (Some(src), Some(dst)) = (iv.block, ov.block)
            {
                self.pool
                    .copy_bytes(src, iv.offset as usize, dst, ov.offset as usize, n as usize);
            }
            ov.actual_len = n;
            iv.actual_len = n;
        }
    }

    fn carry_siso_timestamp(&mut self, i: InPortId, o: OutPortId, algo_delay_us: u32) {
        let ic = &self.inputs[i.idx()].common;
        let oc = &mut self.outputs[o.idx()].common;
        if !ic.has_data() || oc.has_data() {
            return;
        }
        let f = ic.sdata.flags;
        oc.sdata.timestamp = ic.sdata.timestamp - i64::from(algo_delay_us);
        oc.ts_frac_ns = 0;
        oc.sdata.flags.ts_valid = f.ts_valid;
        oc.sdata.flags.ts_continue = f.ts_continue;
        oc.sdata.flags.erasure = f.erasure;
        if !ic.media_format.data_format.is_pcm_or_packetized()
            && oc.media_format.data_format.is_pcm_or_packetized()
            && f.ts_continue
        {
            oc.sdata.flags.ts_continue = false;
            oc.sdata.flags.ts_valid = true;
        }
    }

    /// Appends zeros worth the algorithmic delay once a flushing EOS reaches
    /// the input, so the module can drain its internal state.
    fn push_zeros_at_eos(&mut self, m: ModuleId, i: InPortId, algo_delay_us: u32) -> Result<()> {
        let fmt = self.inputs[i.idx()].common.media_format;
        if fmt.data_format != DataFormat::Pcm {
            return Ok(());
        }
        let flags = self.inputs[i.idx()].common.sdata.flags;
        let node = &mut self.modules[m.idx()];
        if !flags.marker_eos {
            node.eos_armed = false;
        } else if !node.eos_armed {
            node.eos_armed = true;
            node.pending_zeros_at_eos = fmt.us_to_bytes_per_ch(u64::from(algo_delay_us)) as u32;
        }
        if node.pending_zeros_at_eos == 0 || !(flags.marker_eos || flags.end_of_frame) {
            return Ok(());
        }
        if !self.inputs[i.idx()].common.has_buffer() && !self.acquire_input_buffer(i)? {
            return Ok(());
        }

        let pending = self.modules[m.idx()].pending_zeros_at_eos;
        let c = &mut self.inputs[i.idx()].common;
        let old_total = c.total_len();
        let per_ch = fill_zeros(&mut self.pool, c, pending);
        let added = c.total_len() - old_total;
        c.sdata.metadata.shift_markers_from(old_total, added);
        if added > 0 {
            c.flow_state = DataFlowState::Flowing;
        }
        self.modules[m.idx()].pending_zeros_at_eos = pending - per_ch.min(pending);

        #[cfg(feature = "tracing")]
        tracing::debug!(
            "{m}: pushed {per_ch} zero bytes per channel at EOS, {} pending",
            self.modules[m.idx()].pending_zeros_at_eos
        );
        Ok(())
    }

    /// Runs the attached modules of output `local` on its freshly produced data.
    fn run_attached(&mut self, m: ModuleId, local: usize, o: OutPortId) {
        if !self.outputs[o.idx()].common.flags.is_mf_valid {
            return;
        }
        let out_ids = [o];
        for k in 0..self.modules[m.idx()].attached.len() {
            let am = &mut self.modules[m.idx()].attached[k];
            if !am.enabled || am.output != local {
                continue;
            }
            let lens: Vec<u32> = self.outputs[o.idx()]
                .common
                .bufs
                .iter()
                .map(|v| v.actual_len)
                .collect();
            let mut io = ProcessIo {
                pool: &mut self.pool,
                inputs: &mut self.inputs,
                outputs: &mut self.outputs,
                in_ids: &[],
                out_ids: &out_ids,
                events: &mut self.pending,
            };
            if am.module.process(&mut io) == ProcessStatus::Failed {
                #[cfg(feature = "tracing")]
                tracing::error!("{m}: attached module on {o} failed");
            }
            for (v, len) in self.outputs[o.idx()].common.bufs.iter_mut().zip(lens) {
                v.actual_len = len;
            }
        }
    }

    /// Framework-owned metadata propagation.
    ///
    /// SISO modules move consumed metadata to the output, rescaled to the
    /// produced span. Multi-port modules forward only EOS and DFG records to
    /// every output. Sinks drop consumed metadata.
    fn propagate_metadata(
        &mut self,
        m: ModuleId,
        outcomes: &[InputOutcome],
        out_ids: &[OutPortId],
        produced_totals: &[u32],
    ) {
        let held = self.modules[m.idx()].pending_zeros_at_eos > 0;
        let siso = outcomes.len() == 1 && out_ids.len() == 1;
        for oc in outcomes {
            let c = &mut self.inputs[oc.id.idx()].common;
            let fmt = c.media_format;
            let consumed_total = total_of(fmt, &oc.consumed);
            let real_total = consumed_total - oc.dropped.min(consumed_total);
            let emptied = oc.given.iter().zip(&oc.consumed).all(|(g, c)| g == c);

            let mut moving = c.sdata.metadata.split_front(real_total, false);
            if oc.dropped > 0 {
                c.sdata.metadata.drop_within(oc.dropped, true);
            }
            if emptied && !held {
                let tail = c.sdata.metadata.split_front(0, true);
                moving.append_shifted(tail, real_total);
            }
            c.sdata.flags.marker_eos = c.sdata.metadata.has_flushing_eos();
            if moving.is_empty() {
                continue;
            }

            if siso {
                let produced = produced_totals.first().copied().unwrap_or(0);
                moving.rescale(real_total, produced);
                let out = &mut self.outputs[out_ids[0].idx()].common;
                out.sdata.flags.marker_eos |= moving.has_flushing_eos();
                out.sdata.metadata.append_shifted(moving, 0);
            } else if !out_ids.is_empty() {
                let markers = moving.take_eos_and_dfg();
                if markers.is_empty() {
                    continue;
                }
                for (&o, &produced) in out_ids.iter().zip(produced_totals) {
                    let out = &mut self.outputs[o.idx()].common;
                    for md in markers.iter() {
                        let mut md = md.clone();
                        md.offset = produced;
                        out.sdata.metadata.push(md);
                    }
                    out.sdata.flags.marker_eos |= markers.has_flushing_eos();
                }
            }
        }
    }
}

/// Presents each view as the free space after its data.
fn open_window(c: &mut CommonPort, prev_len: &[u32]) {
    let unpacked = c.media_format.is_pcm_unpacked();
    let len0 = prev_len.first().copied().unwrap_or(0);
    for (v, &len) in c.bufs.iter_mut().zip(prev_len) {
        let shift = if unpacked { len0 } else { len };
        v.offset += shift;
        v.max_len = v.max_len.saturating_sub(shift);
        v.actual_len = 0;
    }
}

/// Undoes [`open_window`], appending the produced bytes to the old data.
fn close_window(pool: &mut BufferPool, c: &mut CommonPort, prev_len: &[u32]) {
    let unpacked = c.media_format.is_pcm_unpacked();
    let len0 = prev_len.first().copied().unwrap_or(0);
    for (v, &len) in c.bufs.iter_mut().zip(prev_len) {
        let shift = if unpacked { len0 } else { len };
        v.offset -= shift;
        v.max_len += shift;
        v.actual_len += shift;
    }
    if c.media_format.is_deinterleaved_packed() && len0 > 0 && c.len_per_buf() > len0 {
        respace_deinterleaved(pool, c, len0);
    }
}

/// Interleaves the per-channel blocks of data appended after `old_len`
/// bytes into the channel blocks of the existing data.
fn respace_deinterleaved(pool: &mut BufferPool, c: &mut CommonPort, old_len: u32) {
    let nch = u32::from(c.media_format.num_channels.max(1));
    let v = c.bufs[0];
    let Some(block) = v.block else {
        return;
    };
    let old = old_len / nch;
    let new = (v.actual_len - old_len) / nch;
    let spacing = old + new;
    let off = v.offset as usize;

    let fresh: Vec<u8> = pool
        .bytes(block)
        .map(|b| b[off + old_len as usize..off + (old_len + new * nch) as usize].to_vec())
        .unwrap_or_default();
    for ch in (1..nch as usize).rev() {
        pool.move_within(block, off + ch * old as usize, off + ch * spacing as usize, old as usize);
    }
    if let Some(bytes) = pool.bytes_mut(block) {
        for ch in 0..nch as usize {
            let dst = off + ch * spacing as usize + old as usize;
            let src = ch * new as usize;
            bytes[dst..dst + new as usize].copy_from_slice(&fresh[src..src + new as usize]);
        }
    }
    c.bufs[0].actual_len = spacing * nch;
}

/// Zero fill of up to `pending` bytes per channel. Returns bytes per channel added.
fn fill_zeros(pool: &mut BufferPool, c: &mut CommonPort, pending: u32) -> u32 {
    let fmt = c.media_format;
    let nch = u32::from(fmt.num_channels.max(1));
    let bps = u32::from(fmt.bytes_per_sample.max(1));
    let Some(block) = c.block() else {
        return 0;
    };

    if fmt.is_deinterleaved_packed() {
        let v = c.bufs[0];
        let existing = v.actual_len / nch;
        let per_ch = pending.min((v.max_len / nch).saturating_sub(existing)) / bps * bps;
        if per_ch == 0 {
            return 0;
        }
        let spacing = existing + per_ch;
        let off = v.offset as usize;
        for ch in (1..nch as usize).rev() {
            pool.move_within(block, off + ch * existing as usize, off + ch * spacing as usize, existing as usize);
        }
        for ch in 0..nch as usize {
            pool.zero(block, off + ch * spacing as usize + existing as usize, per_ch as usize);
        }
        c.bufs[0].actual_len = spacing * nch;
        per_ch
    } else if fmt.is_pcm_unpacked() {
        let v0 = c.bufs[0];
        let per_ch = pending.min(v0.free()) / bps * bps;
        for v in &c.bufs {
            if let Some(b) = v.block {
                pool.zero(b, (v.offset + v0.actual_len) as usize, per_ch as usize);
            }
        }
        c.set_all_lens(v0.actual_len + per_ch);
        per_ch
    } else {
        let v = c.bufs[0];
        let frame = nch * bps;
        let bytes = (pending * nch).min(v.free()) / frame * frame;
        pool.zero(block, (v.offset + v.actual_len) as usize, bytes as usize);
        c.bufs[0].actual_len += bytes;
        bytes / nch
    }
}

/// Moves unconsumed bytes to the head of each buffer.
fn compact_input(pool: &mut BufferPool, c: &mut CommonPort, given: &[u32], consumed: &[u32]) {
    if c.media_format.is_deinterleaved_packed() {
        let nch = u32::from(c.media_format.num_channels);
        let v = c.bufs[0];
        let (Some(block), Some(&g), Some(&k)) = (v.block, given.first(), consumed.first()) else {
            return;
        };
        let (g, k) = (g / nch, k / nch);
        let r = g - k;
        for ch in 0..nch as usize {
            pool.move_within(
                block,
                v.offset as usize + ch * g as usize + k as usize,
                v.offset as usize + ch * r as usize,
                r as usize,
            );
        }
        return;
    }
    for ((v, &g), &k) in c.bufs.iter().zip(given).zip(consumed) {
        if let Some(block) = v.block {
            pool.move_within(block, (v.offset + k) as usize, v.offset as usize, (g - k) as usize);
        }
    }
}

/// Advances views past consumed bytes instead of moving data under borrowers.
fn advance_views(c: &mut CommonPort, consumed: &[u32]) {
    for (v, &k) in c.bufs.iter_mut().zip(consumed) {
        v.offset += k;
        v.max_len = v.max_len.saturating_sub(k);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolConfig;
    use crate::port::BufView;

    fn packed(pool: &mut BufferPool, bytes: Vec<u8>, len: u32) -> CommonPort {
        let fmt = MediaFormat::pcm(2, 48_000, 1).with_interleaving(Interleaving::DeinterleavedPacked);
        let max = bytes.len() as u32;
        let block = pool.attach_external(bytes);
        let mut c = CommonPort::new(ModuleId(0), fmt, max);
        c.bufs = vec![BufView {
            block: Some(block),
            offset: 0,
            actual_len: len,
            max_len: max,
        }];
        c
    }

    #[test]
    fn window_appends_deinterleaved_channels() {
        let mut pool = BufferPool::new(PoolConfig::default());
        // old: L=[1,2] R=[3,4]; new: L=[5] R=[6]
        let mut c = packed(&mut pool, vec![1, 2, 3, 4, 5, 6, 0, 0], 4);
        let prev = vec![4];
        open_window(&mut c, &prev);
        assert_eq!(c.bufs[0].offset, 4);
        c.bufs[0].actual_len = 2;
        close_window(&mut pool, &mut c, &prev);
        assert_eq!(c.len_per_buf(), 6);
        assert_eq!(&pool.bytes(c.block().unwrap()).unwrap()[..6], &[1, 2, 5, 3, 4, 6]);
    }

    #[test]
    fn zeros_respace_packed_channels() {
        let mut pool = BufferPool::new(PoolConfig::default());
        let mut c = packed(&mut pool, vec![1, 2, 3, 4, 9, 9, 9, 9], 4);
        assert_eq!(fill_zeros(&mut pool, &mut c, 1), 1);
        assert_eq!(c.len_per_buf(), 6);
        assert_eq!(&pool.bytes(c.block().unwrap()).unwrap()[..6], &[1, 2, 0, 3, 4, 0]);
    }

    #[test]
    fn compaction_keeps_channel_blocks() {
        let mut pool = BufferPool::new(PoolConfig::default());
        // L=[1,2,3] R=[4,5,6], one sample per channel consumed
        let mut c = packed(&mut pool, vec![1, 2, 3, 4, 5, 6], 6);
        compact_input(&mut pool, &mut c, &[6], &[2]);
        assert_eq!(&pool.bytes(c.block().unwrap()).unwrap()[..4], &[2, 3, 5, 6]);
    }

    #[test]
    fn unpacked_total_counts_every_channel() {
        let fmt = MediaFormat::pcm(3, 48_000, 2).with_interleaving(Interleaving::DeinterleavedUnpackedV2);
        assert_eq!(total_of(fmt, &[8, 0, 0]), 24);
        assert_eq!(total_of(MediaFormat::pcm(2, 48_000, 2), &[8]), 8);
    }

    #[test]
    fn violation_is_reported() {
        let res = violation(Invariant::Overflow {
            module: ModuleId(1),
            len: 10,
            max: 8,
        });
        if cfg!(feature = "validation") {
            assert!(res.is_err());
        } else {
            assert!(res.is_ok());
        }
    }
}
