//! Timestamp discontinuity checks and resynchronization.
//!
//! An input that still holds bytes of an earlier buffer keeps that buffer's
//! timestamp. The incoming buffer's timestamp is parked in
//! [`TsToSync`](crate::port::TsToSync) and adopted once the module has
//! consumed the `bytes_from_prev_buf` bytes owed to the earlier buffer.

use crate::port::{InPortId, OutPortId, TsToSync};
use crate::topology::Topology;

/// Largest gap between expected and incoming timestamps treated as continuous.
pub const TIMESTAMP_TOLERANCE_US: i64 = 1_000;

impl Topology {
    /// Parks the incoming timestamp of `prev` on `next` and checks it against
    /// the end of `next`'s buffered data.
    ///
    /// An empty `next` adopts the incoming timestamp directly. Returns
    /// whether a discontinuity was found; the container hook is notified.
    pub(crate) fn check_copy_incoming_ts(&mut self, prev: OutPortId, next: InPortId) -> bool {
        let p = &self.outputs[prev.idx()].common;
        if !p.has_data() {
            return false;
        }
        let in_flags = p.sdata.flags;
        let incoming = TsToSync {
            ivalue: p.sdata.timestamp,
            fvalue: p.ts_frac_ns,
            valid: in_flags.ts_valid,
            continue_ts: in_flags.ts_continue,
        };

        let port = &mut self.inputs[next.idx()];
        port.ts_to_sync = incoming;
        let c = &mut port.common;
        if c.is_empty() {
            c.sdata.timestamp = incoming.ivalue;
            c.ts_frac_ns = incoming.fvalue;
            c.sdata.flags.ts_valid = incoming.valid;
            c.sdata.flags.ts_continue = incoming.continue_ts;
            return false;
        }

        if port.disable_ts_disc_check
            || incoming.continue_ts
            || !c.media_format.data_format.is_pcm_or_packetized()
        {
            return false;
        }
        let cur_valid = c.sdata.flags.ts_valid;
        if !cur_valid && !incoming.valid {
            return false;
        }

        let both_valid = cur_valid && incoming.valid;
        let delta_us = if both_valid {
            let expected = c.sdata.timestamp + c.buffered_us() as i64;
            expected - incoming.ivalue
        } else {
            0
        };
        if both_valid && delta_us.abs() <= TIMESTAMP_TOLERANCE_US {
            return false;
        }

        port.disable_ts_disc_check = true;
        let module = port.common.module;
        #[cfg(feature = "tracing")]
        tracing::warn!(
            "ts_discontinuity: {next} of {module}, both_valid={both_valid}, delta={delta_us}us"
        );
        self.hooks.notify_ts_discontinuity(module, both_valid, delta_us);
        true
    }

    /// Adopts the parked timestamp once the bytes owed to the earlier buffer
    /// have been consumed.
    ///
    /// `consumed` is per buffer. PCM timestamps are advanced past the bytes
    /// of the new buffer that were consumed in the same call; raw data takes
    /// the parked value unless it continues the previous timestamp.
    pub(crate) fn sync_to_input_timestamp(&mut self, id: InPortId, consumed: u32) {
        let port = &mut self.inputs[id.idx()];
        let owed = port.bytes_from_prev_buf;
        if owed == 0 {
            return;
        }
        if consumed < owed {
            port.bytes_from_prev_buf = owed - consumed;
            return;
        }
        let new_bytes = consumed - owed;
        port.bytes_from_prev_buf = 0;

        let sync = port.ts_to_sync;
        let c = &mut port.common;
        if !c.media_format.data_format.is_pcm_or_packetized() {
            if !sync.continue_ts {
                c.sdata.timestamp = sync.ivalue;
                c.sdata.flags.ts_valid = sync.valid;
            }
            return;
        }
        let mut frac = sync.fvalue;
        let us = c.media_format.len_per_buf_to_us(new_bytes, Some(&mut frac));
        c.sdata.timestamp = sync.ivalue + us as i64;
        c.ts_frac_ns = frac;
        c.sdata.flags.ts_valid = sync.valid;
    }
}
