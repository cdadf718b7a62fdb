//! Signal-triggered processing.
//!
//! Under a periodic signal the clock decides when modules run. Timestamp
//! discontinuities do not end frames, modules consume their whole input in
//! one call, and real-time data that misses its cycle is dropped instead of
//! carried.

use crate::copy::copy_port_data;
use crate::error::Result;
use crate::module::ModuleId;
use crate::port::{DataFlowState, InPortId, OutPortId, PortState};
use crate::topology::Topology;
use crate::trigger::{PortRef, PortRole};

impl Topology {
    /// Moves data from the upstream output into `next_id` for a
    /// signal-triggered cycle.
    ///
    /// Returns whether the input holds data, metadata, an EOS or an erasure
    /// afterwards.
    pub(crate) fn check_copy_between_modules_signal(&mut self, next_id: InPortId) -> bool {
        let Some(prev_id) = self.inputs[next_id.idx()].conn else {
            return self.input_has_signal_trigger(next_id);
        };
        if self.inputs[next_id.idx()].common.state != PortState::Started {
            return false;
        }

        if self.outputs[prev_id.idx()].common.flags.media_fmt_event {
            if !self.propagate_media_format(next_id) {
                return false;
            }
            if self.pending.any() {
                return false;
            }
        }

        if self.check_copy_incoming_ts(prev_id, next_id) {
            #[cfg(feature = "tracing")]
            tracing::debug!("signal: discontinuity at {next_id} ignored");
        }

        let prev = &self.outputs[prev_id.idx()].common;
        let prev_has_data = prev.has_data();
        let f = prev.sdata.flags;
        let steady = prev.sdata.metadata.is_empty() && !f.end_of_frame && !f.marker_eos && !f.erasure;

        if prev_has_data || !steady {
            let has_buf = if prev_has_data {
                match self.acquire_input_buffer(next_id) {
                    Ok(has) => has,
                    Err(_e) => {
                        #[cfg(feature = "tracing")]
                        tracing::error!("signal: no buffer for {next_id}: {_e}");
                        false
                    }
                }
            } else {
                self.inputs[next_id.idx()].common.has_buffer()
            };

            let (outputs, inputs) = (&mut self.outputs, &mut self.inputs);
            let prev = &mut outputs[prev_id.idx()].common;
            let next = &mut inputs[next_id.idx()];
            if has_buf {
                next.need_more_input = false;
            }
            if f.erasure && next.common.is_empty() {
                next.common.sdata.flags.erasure = true;
            }
            if has_buf || (!prev_has_data && !prev.sdata.metadata.is_empty()) {
                copy_port_data(&mut self.pool, prev, &mut next.common);
            }
            if prev.is_empty() {
                let pf = &mut prev.sdata.flags;
                next.common.sdata.flags.end_of_frame |= pf.end_of_frame;
                next.common.sdata.flags.marker_eos |= pf.marker_eos;
                next.was_eof_set |= pf.end_of_frame;
                pf.end_of_frame = false;
                pf.marker_eos = false;
            }
        }

        let prev_empty = self.outputs[prev_id.idx()].common.is_empty();
        let next = &mut self.inputs[next_id.idx()].common;
        if next.has_data() || !next.sdata.metadata.is_empty() || next.sdata.flags.marker_eos {
            next.flow_state = DataFlowState::Flowing;
        }
        self.in_scratch[next_id.idx()].data_pending_in_prev = !prev_empty;
        self.return_output_buffer(prev_id);
        self.input_has_signal_trigger(next_id)
    }

    fn input_has_signal_trigger(&self, id: InPortId) -> bool {
        let c = &self.inputs[id.idx()].common;
        c.state == PortState::Started
            && (c.has_data()
                || !c.sdata.metadata.is_empty()
                || c.sdata.flags.marker_eos
                || c.sdata.flags.erasure)
    }

    /// Output trigger under a signal: an empty buffer can be taken, and
    /// stale real-time data is dropped to make room.
    fn output_signal_trigger(&mut self, id: OutPortId, local: usize) -> bool {
        let module = self.outputs[id.idx()].common.module;
        if self.outputs[id.idx()].common.state != PortState::Started
            || self.port_role(module, PortRef::Output(local)) == PortRole::Blocked
        {
            return false;
        }
        let c = &mut self.outputs[id.idx()].common;
        if !c.has_data() {
            return true;
        }
        if !c.is_realtime() {
            return false;
        }
        let stale = c.total_len();
        #[cfg(feature = "tracing")]
        tracing::error!("signal: {module} dropping {stale} stale bytes at {id}");
        self.report.dropped_bytes += u64::from(stale);
        c.clear_lens();
        c.sdata.metadata.clear();
        true
    }

    /// Whether `m` runs on this signal.
    ///
    /// At least one started input carries something (or the module is a
    /// source), and every started output offers an empty buffer.
    fn signal_trigger_satisfied(&self, m: ModuleId) -> bool {
        let node = &self.modules[m.idx()];
        let any_in = node.is_source()
            || node.inputs.is_empty()
            || node.inputs.iter().any(|&i| self.input_has_signal_trigger(i));
        if !any_in {
            return false;
        }

        let mut any_out = node.is_sink() || node.outputs.is_empty();
        for &o in &node.outputs {
            if self.outputs[o.idx()].common.state != PortState::Started {
                continue;
            }
            any_out = true;
            if !self.output_has_empty_buffer(o) {
                return false;
            }
        }
        any_out
    }

    pub(crate) fn process_signal_triggered(&mut self, m: ModuleId) -> Result<()> {
        let in_ids = self.modules[m.idx()].inputs.clone();
        let out_ids = self.modules[m.idx()].outputs.clone();

        if !self.copy_into_module(&in_ids, true) {
            return Ok(());
        }
        let mut all_out_triggered = true;
        self.prepare_outputs(m, &out_ids, |topo, o, local| {
            let t = topo.output_signal_trigger(o, local);
            if !t && topo.outputs[o.idx()].common.state == PortState::Started {
                all_out_triggered = false;
            }
            t
        });

        if all_out_triggered && self.signal_trigger_satisfied(m) {
            let outcome = self.process_module(m, true).map(|_| ());
            for &i in &in_ids {
                let p = &mut self.inputs[i.idx()];
                p.need_more_input = false;
                p.bytes_from_prev_buf = 0;
                if let Some(prev) = p.conn {
                    self.outputs[prev.idx()].common.sdata.flags.erasure = false;
                }
            }
            self.return_module_buffers(&in_ids, &out_ids);
            return outcome;
        }

        #[cfg(feature = "tracing")]
        tracing::trace!("signal: {m} not triggered");
        for &i in &in_ids {
            self.drop_late_realtime_input(m, i);
        }
        for &o in &out_ids {
            if self.outputs[o.idx()].common.state == PortState::Started {
                self.force_return_output(o);
            }
        }
        self.return_module_buffers(&in_ids, &out_ids);
        Ok(())
    }

    /// Drops real-time PCM data left at an input whose module missed the
    /// signal, together with its metadata.
    fn drop_late_realtime_input(&mut self, m: ModuleId, id: InPortId) {
        let port = &mut self.inputs[id.idx()];
        let c = &mut port.common;
        if !c.has_data() || !c.is_realtime() || !c.media_format.data_format.is_pcm_or_packetized() {
            return;
        }
        let dropped = c.len_per_buf();
        let total = c.total_len();
        #[cfg(feature = "tracing")]
        tracing::error!("signal: {m} not triggered, dropping {total} bytes at {id}");
        #[cfg(not(feature = "tracing"))]
        let _ = m;
        self.report.dropped_bytes += u64::from(total);
        c.sdata.metadata.drop_within(total, false);
        c.clear_lens();
        port.bytes_from_prev_buf = port.bytes_from_prev_buf.saturating_sub(dropped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::MediaFormat;
    use crate::topology::TopologyBuilder;
    use crate::trigger::TriggerMode;

    fn fmt() -> MediaFormat {
        MediaFormat::pcm(1, 48_000, 2)
    }

    /// src -> gain -> sink, signal triggered.
    fn chain() -> (Topology, InPortId, OutPortId) {
        let mut b = TopologyBuilder::new();
        b.trigger_mode(TriggerMode::Signal);
        let a = b.add_passthrough("a");
        let c = b.add_passthrough("c");
        let a_in = b.add_input(a, fmt(), 96).unwrap();
        let a_out = b.add_output(a, fmt(), 96).unwrap();
        let c_in = b.add_input(c, fmt(), 96).unwrap();
        let c_out = b.add_output(c, fmt(), 96).unwrap();
        b.connect(a_out, c_in).unwrap();
        (b.build().unwrap(), a_in, c_out)
    }

    #[test]
    fn signal_cycle_moves_data_end_to_end() {
        let (mut topo, a_in, c_out) = chain();
        assert_eq!(topo.push_input(a_in, &[7u8; 96]).unwrap(), 96);
        let report = topo.process_cycle().unwrap();
        assert_eq!(report.process_calls, 2);

        let mut out = Vec::new();
        let drained = topo.drain_output(c_out, &mut out).unwrap();
        assert_eq!(drained.len, 96);
        assert!(out.iter().all(|&b| b == 7));
    }

    #[test]
    fn stale_realtime_output_is_dropped() {
        let (mut topo, a_in, c_out) = chain();
        topo.outputs[c_out.idx()].common.flags.downstream_realtime = true;
        topo.push_input(a_in, &[1u8; 96]).unwrap();
        topo.process_cycle().unwrap();

        // nobody drained c_out
        topo.push_input(a_in, &[2u8; 96]).unwrap();
        let report = topo.process_cycle().unwrap();
        assert_eq!(report.dropped_bytes, 96);

        let mut out = Vec::new();
        topo.drain_output(c_out, &mut out).unwrap();
        assert!(out.iter().all(|&b| b == 2));
    }
}
