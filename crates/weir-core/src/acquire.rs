//! Buffer acquisition and return.
//!
//! Ports get buffers lazily, right before they are needed, and give them
//! back as soon as they are empty. Acquisition tries, in order:
//!
//! 1. **In-place alias**: an in-place SISO output shares its input's buffer.
//! 2. **Chain borrow**: a non-in-place output writes straight into the
//!    buffer at the far end of its non-buffering linear chain (NBLC), either
//!    a client output buffer or, in low-latency mode, the buffering input
//!    that will receive the data.
//! 3. **Pool**: a fresh block sized `max_len_per_buf` times the number of
//!    buffer views.
//!
//! Inputs mirror this: share the upstream output's buffer, else (inside a
//! chain) borrow the client buffer at the chain's external input, else the
//! pool.
//!
//! An NBLC is a run of in-place SISO modules without external ports. Data
//! written at one end travels through it without being copied.

#[cfg(not(feature = "std"))]
use alloc::vec::Vec;

use crate::error::PoolError;
use crate::module::ModuleId;
use crate::pool::{BufferPool, PoolMode};
use crate::port::{BufOrigin, BufView, CommonPort, DataFlowState, InPortId, OutPortId};
use crate::topology::Topology;

/// Guard against walking a malformed chain forever.
pub const NBLC_STEP_LIMIT: usize = 256;

/// Far end of a non-buffering linear chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NblcEnd {
    /// The chain ends at an external output.
    External(OutPortId),
    /// The chain ends at the input of a module that is not in-place SISO.
    Input(InPortId),
}

impl Topology {
    /// In-place SISO: output may share the input buffer.
    pub(crate) fn is_inplace_siso(&self, m: ModuleId) -> bool {
        let node = &self.modules[m.idx()];
        node.is_siso()
            && !node.caps.is_framing_boundary()
            && (node.caps.in_place || node.bypass || node.module.is_none())
    }

    /// Whether a chain stops at this module.
    pub(crate) fn is_nblc_boundary(&self, m: ModuleId) -> bool {
        if !self.is_inplace_siso(m) {
            return true;
        }
        let node = &self.modules[m.idx()];
        node.inputs.iter().any(|i| self.inputs[i.idx()].is_external())
            || node.outputs.iter().any(|o| self.outputs[o.idx()].is_external())
    }

    /// Follows `out` downstream through in-place SISO modules.
    pub fn nblc_end_from_output(&self, out: OutPortId) -> Option<NblcEnd> {
        let mut cur = out;
        for _ in 0..NBLC_STEP_LIMIT {
            let Some(next_in) = self.outputs[cur.idx()].conn else {
                return Some(NblcEnd::External(cur));
            };
            let next_m = self.inputs[next_in.idx()].common.module;
            if !self.is_inplace_siso(next_m) {
                return Some(NblcEnd::Input(next_in));
            }
            cur = self.modules[next_m.idx()].outputs[0];
        }
        #[cfg(feature = "tracing")]
        tracing::warn!("nblc_end_from_output: {out} chain exceeds {NBLC_STEP_LIMIT} steps");
        None
    }

    /// Follows `input` upstream through in-place SISO modules to the
    /// external input that starts its chain, if any.
    pub fn nblc_start_from_input(&self, input: InPortId) -> Option<InPortId> {
        let mut cur = input;
        for _ in 0..NBLC_STEP_LIMIT {
            let Some(prev_out) = self.inputs[cur.idx()].conn else {
                return Some(cur);
            };
            let prev_m = self.outputs[prev_out.idx()].common.module;
            if !self.is_inplace_siso(prev_m) {
                return None;
            }
            cur = self.modules[prev_m.idx()].inputs[0];
        }
        #[cfg(feature = "tracing")]
        tracing::warn!("nblc_start_from_input: {input} chain exceeds {NBLC_STEP_LIMIT} steps");
        None
    }

    /// Maximal runs of chained in-place SISO modules, in processing order.
    pub fn nblc_runs(&self) -> Vec<Vec<ModuleId>> {
        let mut runs = Vec::new();
        for &m in &self.order {
            if self.is_nblc_boundary(m) {
                continue;
            }
            let upstream = self.inputs[self.modules[m.idx()].inputs[0].idx()]
                .conn
                .map(|o| self.outputs[o.idx()].common.module);
            if upstream.is_some_and(|u| !self.is_nblc_boundary(u)) {
                continue;
            }

            let mut run = vec![m];
            let mut cur = m;
            while run.len() < NBLC_STEP_LIMIT {
                let out = self.modules[cur.idx()].outputs[0];
                let Some(next_in) = self.outputs[out.idx()].conn else {
                    break;
                };
                let next = self.inputs[next_in.idx()].common.module;
                if self.is_nblc_boundary(next) {
                    break;
                }
                run.push(next);
                cur = next;
            }
            runs.push(run);
        }
        runs
    }

    /// Gives an output a buffer. Returns whether it has one afterwards.
    pub(crate) fn acquire_output_buffer(&mut self, id: OutPortId) -> Result<bool, PoolError> {
        if self.outputs[id.idx()].common.has_buffer() {
            return Ok(true);
        }
        let owner = self.outputs[id.idx()].common.module;

        if self.is_inplace_siso(owner) {
            let in_id = self.modules[owner.idx()].inputs[0];
            if self.alias_output_to_input(id, in_id)? {
                return Ok(true);
            }
        } else if self.borrow_from_chain_end(id) {
            return Ok(true);
        }

        let pool = &mut self.pool;
        acquire_from_pool(pool, &mut self.outputs[id.idx()].common)
    }

    fn alias_output_to_input(&mut self, out: OutPortId, input: InPortId) -> Result<bool, PoolError> {
        let src = &self.inputs[input.idx()].common;
        if !src.has_buffer() || src.bufs.len() != self.outputs[out.idx()].common.bufs_num() {
            return Ok(false);
        }
        let origin = match src.origin {
            BufOrigin::BufMgr => BufOrigin::BufMgr,
            BufOrigin::ExtBuf | BufOrigin::ExtBufBorrowed => BufOrigin::ExtBufBorrowed,
            BufOrigin::BufMgrBorrowed => BufOrigin::BufMgrBorrowed,
            BufOrigin::None => return Ok(false),
        };
        if origin == BufOrigin::BufMgr
            && let Some(block) = src.block()
        {
            self.pool.add_ref(block)?;
        }
        let views: Vec<BufView> = src
            .bufs
            .iter()
            .map(|v| BufView {
                actual_len: 0,
                ..*v
            })
            .collect();
        let dst = &mut self.outputs[out.idx()].common;
        dst.bufs = views;
        dst.origin = origin;

        #[cfg(feature = "tracing")]
        tracing::trace!("acquire: {out} aliases {input} ({origin:?})");
        Ok(true)
    }

    fn borrow_from_chain_end(&mut self, out: OutPortId) -> bool {
        let owner = self.outputs[out.idx()].common.module;
        let mine = &self.outputs[out.idx()].common;
        if self.modules[owner.idx()].caps.is_framing_boundary()
            || mine.media_format.is_deinterleaved_multichannel_pcm()
            || mine.bufs_num() != 1
        {
            return false;
        }
        let need = mine.max_len_per_buf;

        let (lender, origin) = match self.nblc_end_from_output(out) {
            Some(NblcEnd::External(o2)) if o2 != out => {
                let c = &self.outputs[o2.idx()].common;
                if c.origin != BufOrigin::ExtBuf {
                    return false;
                }
                (c, BufOrigin::ExtBufBorrowed)
            }
            Some(NblcEnd::Input(i2)) if self.pool.mode() == PoolMode::LowLatency => {
                let c = &self.inputs[i2.idx()].common;
                if c.origin != BufOrigin::BufMgr {
                    return false;
                }
                (c, BufOrigin::BufMgrBorrowed)
            }
            _ => return false,
        };
        if self.modules[lender.module.idx()].caps.is_framing_boundary()
            || lender.media_format.is_deinterleaved_multichannel_pcm()
            || lender.bufs.len() != 1
        {
            return false;
        }
        let view = lender.bufs[0];
        if view.free() < need {
            return false;
        }

        let dst = &mut self.outputs[out.idx()].common;
        dst.bufs = vec![BufView {
            block: view.block,
            offset: view.offset + view.actual_len,
            actual_len: 0,
            max_len: view.free(),
        }];
        dst.origin = origin;
        #[cfg(feature = "tracing")]
        tracing::trace!("acquire: {out} borrows {} bytes at chain end", view.free());
        true
    }

    /// Gives an input a buffer. Returns whether it has one afterwards.
    ///
    /// A connected input shares its upstream output's buffer when sizes and
    /// layouts agree. Borrowed buffers are shared only inside a chain.
    pub(crate) fn acquire_input_buffer(&mut self, id: InPortId) -> Result<bool, PoolError> {
        if self.inputs[id.idx()].common.has_buffer() {
            return Ok(true);
        }
        if let Some(prev) = self.inputs[id.idx()].conn {
            let owner = self.inputs[id.idx()].common.module;
            let src = &self.outputs[prev.idx()].common;
            let dst = &self.inputs[id.idx()].common;
            let shareable = match src.origin {
                BufOrigin::BufMgr => true,
                BufOrigin::BufMgrBorrowed | BufOrigin::ExtBufBorrowed | BufOrigin::ExtBuf => {
                    self.is_inplace_siso(owner)
                }
                BufOrigin::None => false,
            };
            if shareable
                && src.has_buffer()
                && src.max_per_buf() == dst.max_len_per_buf
                && src.bufs.len() == dst.bufs_num()
            {
                let origin = match src.origin {
                    BufOrigin::BufMgr => BufOrigin::BufMgr,
                    BufOrigin::ExtBuf => BufOrigin::ExtBufBorrowed,
                    other => other,
                };
                if origin == BufOrigin::BufMgr
                    && let Some(block) = src.block()
                {
                    self.pool.add_ref(block)?;
                }
                let views: Vec<BufView> = src
                    .bufs
                    .iter()
                    .map(|v| BufView {
                        actual_len: 0,
                        ..*v
                    })
                    .collect();
                let dst = &mut self.inputs[id.idx()].common;
                dst.bufs = views;
                dst.origin = origin;
                #[cfg(feature = "tracing")]
                tracing::trace!("acquire: {id} aliases {prev} ({origin:?})");
                return Ok(true);
            }
        }
        if self.borrow_from_chain_start(id) {
            return Ok(true);
        }
        acquire_from_pool(&mut self.pool, &mut self.inputs[id.idx()].common)
    }

    /// Lets an input inside a chain use the free space of the client buffer
    /// at the chain's external input.
    fn borrow_from_chain_start(&mut self, id: InPortId) -> bool {
        let owner = self.inputs[id.idx()].common.module;
        if !self.is_inplace_siso(owner) {
            return false;
        }
        let Some(start) = self.nblc_start_from_input(id).filter(|&s| s != id) else {
            return false;
        };
        let need = self.inputs[id.idx()].common.max_len_per_buf;
        let lender = &self.inputs[start.idx()].common;
        if lender.origin != BufOrigin::ExtBuf
            || lender.bufs.len() != 1
            || lender.media_format.is_deinterleaved_multichannel_pcm()
        {
            return false;
        }
        let view = lender.bufs[0];
        if view.free() < need {
            return false;
        }
        let dst = &mut self.inputs[id.idx()].common;
        dst.bufs = vec![BufView {
            block: view.block,
            offset: view.offset + view.actual_len,
            actual_len: 0,
            max_len: view.free(),
        }];
        dst.origin = BufOrigin::ExtBufBorrowed;
        #[cfg(feature = "tracing")]
        tracing::trace!("acquire: {id} borrows client buffer of {start}");
        true
    }

    /// Returns an input's buffer if it is empty.
    pub(crate) fn return_input_buffer(&mut self, id: InPortId) -> bool {
        let ll = self.pool.mode() == PoolMode::LowLatency;
        if return_buffer(&mut self.pool, &mut self.inputs[id.idx()].common, ll) {
            return true;
        }
        if self.held_views_restorable(&self.inputs[id.idx()].common, Some(id)) {
            restore_views(&mut self.inputs[id.idx()].common);
        }
        false
    }

    /// Returns an output's buffer if it is empty.
    pub(crate) fn return_output_buffer(&mut self, id: OutPortId) -> bool {
        let ll = self.pool.mode() == PoolMode::LowLatency;
        if return_buffer(&mut self.pool, &mut self.outputs[id.idx()].common, ll) {
            return true;
        }
        if self.held_views_restorable(&self.outputs[id.idx()].common, None) {
            restore_views(&mut self.outputs[id.idx()].common);
        }
        false
    }

    /// Whether an empty pool buffer kept by its port can be rewound.
    ///
    /// The port must own the block alone and the block must still span
    /// every view at full size. A borrowing port blocks the rewind.
    fn held_views_restorable(&self, common: &CommonPort, except_in: Option<InPortId>) -> bool {
        if common.origin != BufOrigin::BufMgr || common.total_len() != 0 {
            return false;
        }
        let Some(block) = common.block() else {
            return false;
        };
        let span = common.max_len_per_buf as usize * common.bufs.len();
        self.pool.ref_count(block) == Some(1)
            && self.pool.block_size(block).is_some_and(|size| size >= span)
            && !self.block_has_borrowers(block, except_in)
    }

    /// Flags an input to give its buffer back, returning it now if empty.
    pub(crate) fn force_return_input(&mut self, id: InPortId) {
        self.inputs[id.idx()].common.flags.force_return_buf = true;
        self.return_input_buffer(id);
    }

    /// Flags an output to give its buffer back, returning it now if empty.
    pub(crate) fn force_return_output(&mut self, id: OutPortId) {
        self.outputs[id.idx()].common.flags.force_return_buf = true;
        self.return_output_buffer(id);
    }

    /// Whether a port other than the given ones points into `block`.
    pub(crate) fn block_has_borrowers(
        &self,
        block: crate::pool::BlockId,
        except_in: Option<InPortId>,
    ) -> bool {
        let borrows = |c: &CommonPort| {
            c.block() == Some(block)
                && matches!(c.origin, BufOrigin::BufMgrBorrowed | BufOrigin::ExtBufBorrowed)
        };
        self.inputs
            .iter()
            .enumerate()
            .any(|(i, p)| Some(InPortId(i as u32)) != except_in && borrows(&p.common))
            || self.outputs.iter().any(|p| borrows(&p.common))
    }
}

fn acquire_from_pool(pool: &mut BufferPool, common: &mut CommonPort) -> Result<bool, PoolError> {
    let per_buf = common.max_len_per_buf;
    let bufs = common.bufs_num() as u32;
    let Some(block) = pool.acquire(per_buf as usize * bufs as usize)? else {
        return Ok(false);
    };
    common.bufs = (0..bufs)
        .map(|c| BufView {
            block: Some(block),
            offset: c * per_buf,
            actual_len: 0,
            max_len: per_buf,
        })
        .collect();
    common.origin = BufOrigin::BufMgr;
    Ok(true)
}

/// Puts every view of a kept buffer back at its full per-buffer window.
fn restore_views(common: &mut CommonPort) {
    let per_buf = common.max_len_per_buf;
    for (c, v) in common.bufs.iter_mut().enumerate() {
        v.offset = c as u32 * per_buf;
        v.max_len = per_buf;
    }
}

/// Detaches an empty buffer from a port.
///
/// Client buffers held by the port itself stay. In low-latency mode an
/// emptied pool buffer stays at a flowing real-time port that owns it
/// alone, unless the port was flagged to force its return.
pub(crate) fn return_buffer(pool: &mut BufferPool, common: &mut CommonPort, low_latency: bool) -> bool {
    if !matches!(
        common.origin,
        BufOrigin::BufMgr | BufOrigin::BufMgrBorrowed | BufOrigin::ExtBufBorrowed
    ) || common.total_len() != 0
    {
        return false;
    }

    if common.origin == BufOrigin::BufMgr
        && low_latency
        && !common.flags.force_return_buf
        && common.flow_state != DataFlowState::AtGap
        && !common.flags.downstream_requires_data_buffering
        && common.is_realtime()
        && common.block().and_then(|b| pool.ref_count(b)) == Some(1)
    {
        return false;
    }

    common.flags.force_return_buf = false;
    if common.origin == BufOrigin::BufMgr
        && let Some(block) = common.block()
        && let Err(_e) = pool.release(block)
    {
        #[cfg(feature = "tracing")]
        tracing::error!("return_buffer: {block}: {_e}");
    }
    common.detach_views();
    true
}
