//! Inter-module copy engine.
//!
//! [`copy_port_data`] moves bytes, metadata and timestamp progress from an
//! upstream output to a downstream input. When the input's view sits right
//! before the output's in the same block (aliasing, chain borrowing) only
//! lengths change. Otherwise bytes are copied in the destination layout:
//!
//! - **deinterleaved packed**: channels are re-spaced so that each one
//!   stays contiguous after the append
//! - **unpacked**: each channel view appends at channel 0's length
//! - **interleaved / raw**: each buffer appends independently
//!
//! The data-triggered decision of *whether* to copy lives in
//! [`Topology::check_copy_between_modules`].

use crate::pool::BufferPool;
use crate::port::{CommonPort, DataFlowState, InPortId, PortState};
use crate::topology::Topology;
use crate::trigger::{PortRef, PortRole};

/// Moves as much of `prev` into `next` as fits. Returns total bytes moved.
///
/// Metadata inside the moved span follows the bytes, rebased behind
/// `next`'s existing data. An empty `prev` hands over all its metadata.
pub fn copy_port_data(pool: &mut BufferPool, prev: &mut CommonPort, next: &mut CommonPort) -> u32 {
    let next_before = next.total_len();
    let prev_before = prev.total_len();

    if prev_before == 0 {
        if !prev.sdata.metadata.is_empty() {
            let md = prev.sdata.metadata.split_front(0, true);
            next.sdata.metadata.append_shifted(md, next_before);
        }
        return 0;
    }
    if !prev.has_buffer() || !next.has_buffer() {
        return 0;
    }

    let prev_len0 = prev.len_per_buf();
    if is_contiguous(prev, next) {
        for (p, n) in prev.bufs.iter_mut().zip(next.bufs.iter_mut()) {
            n.actual_len += p.actual_len;
            p.actual_len = 0;
        }
    } else if next.media_format.is_deinterleaved_packed() {
        copy_deinterleaved_packed(pool, prev, next);
    } else if next.media_format.is_pcm_unpacked() {
        copy_unpacked(pool, prev, next);
    } else {
        copy_per_buffer(pool, prev, next);
    }

    let moved_per_buf = prev_len0 - prev.len_per_buf();
    prev.advance_ts(moved_per_buf);

    let moved = prev_before - prev.total_len();
    let md = prev
        .sdata
        .metadata
        .split_front(moved, prev.total_len() == 0);
    next.sdata.metadata.append_shifted(md, next_before);

    #[cfg(feature = "tracing")]
    tracing::trace!("copy: {moved} of {prev_before} bytes, next had {next_before}");
    moved
}

/// `next` ends exactly where `prev` starts, in the same block, for every view.
fn is_contiguous(prev: &CommonPort, next: &CommonPort) -> bool {
    prev.bufs.len() == next.bufs.len()
        && prev.bufs.iter().zip(&next.bufs).all(|(p, n)| {
            p.block.is_some()
                && p.block == n.block
                && p.offset == n.offset + n.actual_len
                && n.actual_len + p.actual_len <= n.max_len
        })
}

/// Smallest copy unit that keeps samples whole.
pub(crate) fn copy_unit(port: &CommonPort) -> u32 {
    let fmt = port.media_format;
    if !fmt.data_format.is_pcm_or_packetized() {
        return 1;
    }
    let unit = if fmt.is_pcm_unpacked() {
        u32::from(fmt.bytes_per_sample)
    } else {
        fmt.bytes_per_frame()
    };
    unit.max(1)
}

fn copy_deinterleaved_packed(pool: &mut BufferPool, prev: &mut CommonPort, next: &mut CommonPort) {
    let nch = u32::from(next.media_format.num_channels);
    let (pv, nv) = (prev.bufs[0], next.bufs[0]);
    let (Some(pb), Some(nb)) = (pv.block, nv.block) else {
        return;
    };
    let unit = copy_unit(next);
    let copied = nv.free().min(pv.actual_len) / unit * unit;
    if copied == 0 {
        return;
    }

    if nv.actual_len == 0 && copied == pv.actual_len {
        pool.copy_bytes(pb, pv.offset as usize, nb, nv.offset as usize, copied as usize);
    } else {
        let existing = nv.actual_len / nch;
        let added = copied / nch;
        let spacing = existing + added;
        let prev_spacing = pv.actual_len / nch;
        let remain = prev_spacing - added;
        let (n_off, p_off) = (nv.offset as usize, pv.offset as usize);

        for ch in (1..nch as usize).rev() {
            pool.move_within(
                nb,
                n_off + ch * existing as usize,
                n_off + ch * spacing as usize,
                existing as usize,
            );
        }
        for ch in 0..nch as usize {
            pool.copy_bytes(
                pb,
                p_off + ch * prev_spacing as usize,
                nb,
                n_off + ch * spacing as usize + existing as usize,
                added as usize,
            );
        }
        for ch in 0..nch as usize {
            pool.move_within(
                pb,
                p_off + ch * prev_spacing as usize + added as usize,
                p_off + ch * remain as usize,
                remain as usize,
            );
        }
    }
    next.bufs[0].actual_len += copied;
    prev.bufs[0].actual_len -= copied;
}

fn copy_unpacked(pool: &mut BufferPool, prev: &mut CommonPort, next: &mut CommonPort) {
    let (p0, n0) = (prev.bufs[0], next.bufs[0]);
    let unit = copy_unit(next);
    let per_ch = n0.free().min(p0.actual_len) / unit * unit;
    if per_ch == 0 {
        return;
    }
    let remain = p0.actual_len - per_ch;
    for (pv, nv) in prev.bufs.iter().zip(&next.bufs) {
        let (Some(pb), Some(nb)) = (pv.block, nv.block) else {
            continue;
        };
        pool.copy_bytes(
            pb,
            pv.offset as usize,
            nb,
            (nv.offset + n0.actual_len) as usize,
            per_ch as usize,
        );
        pool.move_within(
            pb,
            (pv.offset + per_ch) as usize,
            pv.offset as usize,
            remain as usize,
        );
    }
    next.set_all_lens(n0.actual_len + per_ch);
    prev.set_all_lens(remain);
}

fn copy_per_buffer(pool: &mut BufferPool, prev: &mut CommonPort, next: &mut CommonPort) {
    let unit = copy_unit(next);
    for (pv, nv) in prev.bufs.iter_mut().zip(next.bufs.iter_mut()) {
        let (Some(pb), Some(nb)) = (pv.block, nv.block) else {
            continue;
        };
        let n = nv.free().min(pv.actual_len) / unit * unit;
        if n == 0 {
            continue;
        }
        pool.copy_bytes(
            pb,
            pv.offset as usize,
            nb,
            (nv.offset + nv.actual_len) as usize,
            n as usize,
        );
        pool.move_within(
            pb,
            (pv.offset + n) as usize,
            pv.offset as usize,
            (pv.actual_len - n) as usize,
        );
        nv.actual_len += n;
        pv.actual_len -= n;
    }
}

impl Topology {
    /// Moves data from the upstream output into `next_id` for a
    /// data-triggered cycle.
    ///
    /// A pending media format is propagated first and stops the copy. A
    /// timestamp discontinuity ends the frame buffered at `next_id` and
    /// holds the incoming data back until that frame is processed.
    pub(crate) fn check_copy_between_modules(&mut self, next_id: InPortId) {
        let Some(prev_id) = self.inputs[next_id.idx()].conn else {
            return;
        };
        if self.inputs[next_id.idx()].common.state != PortState::Started {
            return;
        }

        if self.outputs[prev_id.idx()].common.flags.media_fmt_event {
            if !self.propagate_media_format(next_id) {
                let next = &mut self.inputs[next_id.idx()];
                if !next.was_eof_set {
                    next.common.sdata.flags.end_of_frame = true;
                    next.was_eof_set = true;
                }
                return;
            }
            if self.pending.any() {
                return;
            }
        }

        let disc = self.check_copy_incoming_ts(prev_id, next_id);
        let module = self.inputs[next_id.idx()].common.module;
        let local = self.modules[module.idx()]
            .inputs
            .iter()
            .position(|&i| i == next_id)
            .unwrap_or(0);
        let blocked = self.port_role(module, PortRef::Input(local)) == PortRole::Blocked;

        let prev = &self.outputs[prev_id.idx()].common;
        let next = &mut self.inputs[next_id.idx()];
        let prev_has_data = prev.has_data();
        let prev_flags = prev.sdata.flags;
        let force_process = !prev.sdata.metadata.is_empty()
            || disc
            || prev_flags.end_of_frame
            || prev_flags.marker_eos
            || prev_flags.erasure;

        if prev_flags.erasure && next.common.is_empty() {
            next.common.sdata.flags.erasure = true;
        }
        if disc && !next.was_eof_set {
            next.common.sdata.flags.end_of_frame = true;
            next.was_eof_set = true;
        }
        if prev_has_data {
            next.need_more_input = false;
        }

        if blocked {
            if prev_has_data || force_process {
                self.force_return_input(next_id);
            }
            return;
        }

        let next = &self.inputs[next_id.idx()];
        let next_has_end_flags = next.common.sdata.flags.end_of_frame || next.was_eof_set;
        let copy_data = prev_has_data
            && !disc
            && (!next_has_end_flags || next.common.sdata.flags.marker_eos);
        let has_buf = copy_data
            && match self.acquire_input_buffer(next_id) {
                Ok(has) => has,
                Err(_e) => {
                    #[cfg(feature = "tracing")]
                    tracing::error!("copy: no buffer for {next_id}: {_e}");
                    false
                }
            };

        let (outputs, inputs) = (&mut self.outputs, &mut self.inputs);
        let prev = &mut outputs[prev_id.idx()].common;
        let next = &mut inputs[next_id.idx()];

        if has_buf {
            copy_port_data(&mut self.pool, prev, &mut next.common);
        } else if !prev_has_data && !prev.sdata.metadata.is_empty() {
            copy_port_data(&mut self.pool, prev, &mut next.common);
        }

        let prev_empty = prev.is_empty();
        if prev_empty && (prev.sdata.flags.end_of_frame || prev.sdata.flags.marker_eos) {
            next.common.sdata.flags.end_of_frame |= prev.sdata.flags.end_of_frame;
            next.common.sdata.flags.marker_eos |= prev.sdata.flags.marker_eos;
            next.was_eof_set |= prev.sdata.flags.end_of_frame;
            prev.sdata.flags.end_of_frame = false;
            prev.sdata.flags.marker_eos = false;
        }

        let next_c = &mut next.common;
        if next_c.has_data() || !next_c.sdata.metadata.is_empty() || next_c.sdata.flags.marker_eos {
            next_c.flow_state = DataFlowState::Flowing;
        } else if next_c.flow_state == DataFlowState::AtGap {
            next_c.sdata.flags.end_of_frame = false;
            next.was_eof_set = false;
        }
        self.in_scratch[next_id.idx()].data_pending_in_prev = !prev_empty;

        if !has_buf {
            self.return_input_buffer(next_id);
        }
        self.return_output_buffer(prev_id);
    }

    /// Carries an upstream media format onto an empty input.
    ///
    /// Returns `false` while the input still holds data in the old format.
    pub(crate) fn propagate_media_format(&mut self, next_id: InPortId) -> bool {
        let Some(prev_id) = self.inputs[next_id.idx()].conn else {
            return false;
        };
        if !self.inputs[next_id.idx()].common.is_empty() {
            return false;
        }
        let prev = &mut self.outputs[prev_id.idx()].common;
        let format = prev.media_format;
        prev.flags.media_fmt_event = false;

        let next = &mut self.inputs[next_id.idx()].common;
        let changed = next.media_format != format;
        next.media_format = format;
        next.flags.is_mf_valid = format.is_valid();
        #[cfg(feature = "tracing")]
        tracing::debug!("media_format: {prev_id} -> {next_id} {format:?}");
        if changed {
            self.force_return_input(next_id);
            self.pending.media_format = true;
            self.pending.inputs_with_new_format.push(next_id);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{Interleaving, MediaFormat};
    use crate::metadata::Metadata;
    use crate::module::ModuleId;
    use crate::pool::{BlockId, PoolConfig};
    use crate::port::{BufOrigin, BufView};

    fn port(pool: &mut BufferPool, fmt: MediaFormat, bytes: Vec<u8>, len: u32) -> CommonPort {
        let max = bytes.len() as u32;
        let block = pool.attach_external(bytes);
        let mut p = CommonPort::new(ModuleId(0), fmt, max);
        p.bufs = vec![BufView {
            block: Some(block),
            offset: 0,
            actual_len: len,
            max_len: max,
        }];
        p.origin = BufOrigin::ExtBuf;
        p
    }

    fn bytes(pool: &BufferPool, block: Option<BlockId>, len: u32) -> Vec<u8> {
        pool.bytes(block.unwrap()).unwrap()[..len as usize].to_vec()
    }

    #[test]
    fn interleaved_copy_is_frame_aligned() {
        let mut pool = BufferPool::new(PoolConfig::default());
        let fmt = MediaFormat::pcm(2, 48_000, 2);
        let mut prev = port(&mut pool, fmt, (1..=12).collect(), 12);
        let mut next = port(&mut pool, fmt, vec![0; 10], 0);

        assert_eq!(copy_port_data(&mut pool, &mut prev, &mut next), 8);
        assert_eq!(bytes(&pool, next.block(), 8), vec![1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(bytes(&pool, prev.block(), 4), vec![9, 10, 11, 12]);
        assert_eq!(prev.len_per_buf(), 4);
    }

    #[test]
    fn unpacked_appends_per_channel() {
        let mut pool = BufferPool::new(PoolConfig::default());
        let fmt = MediaFormat::pcm(2, 48_000, 1).with_interleaving(Interleaving::DeinterleavedUnpackedV2);
        let src = pool.attach_external(vec![1, 2, 3, 10, 20, 30]);
        let dst = pool.attach_external(vec![9, 0, 0, 8, 0, 0]);
        let mut prev = CommonPort::new(ModuleId(0), fmt, 3);
        let mut next = CommonPort::new(ModuleId(1), fmt, 3);
        prev.bufs = (0..2)
            .map(|c| BufView {
                block: Some(src),
                offset: c * 3,
                actual_len: 3,
                max_len: 3,
            })
            .collect();
        next.bufs = (0..2)
            .map(|c| BufView {
                block: Some(dst),
                offset: c * 3,
                actual_len: 1,
                max_len: 3,
            })
            .collect();

        assert_eq!(copy_port_data(&mut pool, &mut prev, &mut next), 4);
        assert_eq!(pool.bytes(dst).unwrap(), &[9, 1, 2, 8, 10, 20]);
        assert_eq!(prev.len_per_buf(), 1);
        assert_eq!(&pool.bytes(src).unwrap()[3..4], &[30]);
        assert_eq!(next.total_len(), 6);
    }

    #[test]
    fn metadata_follows_bytes() {
        let mut pool = BufferPool::new(PoolConfig::default());
        let fmt = MediaFormat::pcm(1, 48_000, 1);
        let mut prev = port(&mut pool, fmt, vec![0; 8], 8);
        let mut next = port(&mut pool, fmt, vec![0; 8], 2);
        prev.sdata.metadata.push(Metadata::new(1, 3));
        prev.sdata.metadata.push(Metadata::new(2, 7));

        assert_eq!(copy_port_data(&mut pool, &mut prev, &mut next), 6);
        let moved: Vec<(u32, u32)> = next.sdata.metadata.iter().map(|m| (m.id, m.offset)).collect();
        assert_eq!(moved, vec![(1, 5)]);
        let left: Vec<(u32, u32)> = prev.sdata.metadata.iter().map(|m| (m.id, m.offset)).collect();
        assert_eq!(left, vec![(2, 1)]);
    }

    #[test]
    fn contiguous_views_only_move_lengths() {
        let mut pool = BufferPool::new(PoolConfig::default());
        let fmt = MediaFormat::pcm(1, 48_000, 2);
        let mut next = port(&mut pool, fmt, vec![0; 16], 4);
        next.bufs[0].max_len = 16;
        let mut prev = next.clone();
        prev.bufs[0] = BufView {
            offset: 4,
            actual_len: 6,
            max_len: 12,
            ..next.bufs[0]
        };
        prev.sdata.timestamp = 100;
        prev.sdata.flags.ts_valid = true;

        assert_eq!(copy_port_data(&mut pool, &mut prev, &mut next), 6);
        assert_eq!(next.len_per_buf(), 10);
        assert_eq!(prev.len_per_buf(), 0);
        // 3 samples at 48 kHz
        assert_eq!(prev.sdata.timestamp, 162);
    }
}
