//! Topology process loop.
//!
//! One cycle walks the active modules in sorted order. For each module the
//! loop pulls data across its connected inputs, gives triggered outputs a
//! buffer, runs the driver when the trigger holds and then hands buffers
//! back. A framework event stops the walk; the next cycle resumes at the
//! same module once the container has handled it.

use crate::error::Result;
use crate::module::ModuleId;
use crate::port::{InPortId, OutPortId, PortState};
use crate::topology::{CycleReport, Topology};
use crate::trigger::TriggerMode;

impl Topology {
    /// Runs one process cycle over every active module.
    ///
    /// Returns early with [`CycleReport::events_pending`] set when a media
    /// format or threshold event needs [`handle_pending_events`] first.
    ///
    /// [`handle_pending_events`]: Topology::handle_pending_events
    pub fn process_cycle(&mut self) -> Result<CycleReport> {
        self.run_loop(None)
    }

    /// Runs one process cycle restricted to modules on `path`.
    pub fn process_path(&mut self, path: u32) -> Result<CycleReport> {
        self.run_loop(Some(path))
    }

    /// Repeats cycles until nothing changes, an event is pending, or
    /// `max_passes` cycles ran. Returns the accumulated report.
    pub fn process_until_settled(&mut self, max_passes: usize) -> Result<CycleReport> {
        let mut total = CycleReport::default();
        for _ in 0..max_passes {
            let r = self.process_cycle()?;
            total.process_calls += r.process_calls;
            total.dropped_bytes += r.dropped_bytes;
            total.events_pending = r.events_pending;
            total.anything_changed |= r.anything_changed;
            if r.events_pending || !r.anything_changed {
                break;
            }
        }
        Ok(total)
    }

    fn run_loop(&mut self, path: Option<u32>) -> Result<CycleReport> {
        self.report = CycleReport::default();
        let start = self.resume_at.take().unwrap_or(0);
        if self.pending.any() {
            #[cfg(feature = "tracing")]
            tracing::debug!("process: events pending, not running");
            self.resume_at = Some(start);
            self.report.events_pending = true;
            return Ok(self.report);
        }

        for idx in start..self.order.len() {
            let m = self.order[idx];
            let node = &self.modules[m.idx()];
            if !node.active || path.is_some_and(|p| node.path_index != p) {
                continue;
            }

            let res = match self.trigger_mode {
                TriggerMode::Data => self.process_data_triggered(m),
                TriggerMode::Signal => self.process_signal_triggered(m),
            };
            if let Err(e) = res {
                self.resume_at = None;
                return Err(e);
            }

            if self.pending.any() {
                #[cfg(feature = "tracing")]
                tracing::debug!("process: event raised at {m}, breaking at position {idx}");
                self.resume_at = Some(idx);
                self.report.events_pending = true;
                self.report.anything_changed = true;
                break;
            }
        }
        Ok(self.report)
    }

    /// Copies into every connected input. Returns `false` when an event
    /// stopped the copy.
    pub(crate) fn copy_into_module(&mut self, in_ids: &[InPortId], signal: bool) -> bool {
        for &i in in_ids {
            self.in_scratch[i.idx()].data_pending_in_prev = false;
            if self.inputs[i.idx()].conn.is_none() {
                continue;
            }
            if signal {
                self.check_copy_between_modules_signal(i);
            } else {
                self.check_copy_between_modules(i);
            }
            if self.pending.any() {
                return false;
            }
        }
        true
    }

    fn process_data_triggered(&mut self, m: ModuleId) -> Result<()> {
        let in_ids = self.modules[m.idx()].inputs.clone();
        let out_ids = self.modules[m.idx()].outputs.clone();

        if !self.copy_into_module(&in_ids, false) {
            return Ok(());
        }
        for &i in &in_ids {
            let p = &mut self.inputs[i.idx()];
            if p.common.sdata.flags.end_of_frame || p.bytes_from_prev_buf == p.common.len_per_buf() {
                p.bytes_from_prev_buf = 0;
            }
        }
        self.prepare_outputs(m, &out_ids, |topo, o, local| topo.output_wants_buffer(o, local));

        let triggered = self.nblc_fast_trigger(m, &in_ids, &out_ids) || self.data_trigger_satisfied(m);
        let outcome = if triggered {
            self.run_sub_loops(m)
        } else {
            Ok(())
        };

        let inplace = self.is_inplace_siso(m);
        for &i in &in_ids {
            let forward = self.inputs[i.idx()].need_more_input
                && self.in_scratch[i.idx()].data_pending_in_prev
                && !inplace
                && !self.pending.any();
            let p = &mut self.inputs[i.idx()];
            let held = p.common.len_per_buf();
            if forward {
                if held > 0 && p.bytes_from_prev_buf == 0 {
                    p.bytes_from_prev_buf = held;
                }
                #[cfg(feature = "tracing")]
                tracing::trace!("process: copying ahead into {i}");
                self.check_copy_between_modules(i);
            } else {
                p.bytes_from_prev_buf = held;
            }
            if let Some(prev) = self.inputs[i.idx()].conn {
                self.outputs[prev.idx()].common.sdata.flags.erasure = false;
            }
        }

        self.return_module_buffers(&in_ids, &out_ids);
        outcome
    }

    /// Acquires buffers for outputs that have a trigger and force-returns
    /// the rest.
    pub(crate) fn prepare_outputs(
        &mut self,
        m: ModuleId,
        out_ids: &[OutPortId],
        mut has_trigger: impl FnMut(&mut Self, OutPortId, usize) -> bool,
    ) {
        for (local, &o) in out_ids.iter().enumerate() {
            self.outputs[o.idx()].any_data_produced = false;
            if !has_trigger(self, o, local) {
                self.force_return_output(o);
                continue;
            }
            match self.acquire_output_buffer(o) {
                Ok(true) => {}
                Ok(false) => {
                    #[cfg(feature = "tracing")]
                    tracing::trace!("process: {o} of {m} has no buffer this cycle");
                }
                Err(_e) => {
                    #[cfg(feature = "tracing")]
                    tracing::error!("process: buffer for {o} of {m}: {_e}");
                }
            }
        }
        #[cfg(not(feature = "tracing"))]
        let _ = m;
    }

    /// Trigger shortcut inside a chain: the upstream module just produced
    /// and every port already has its buffer.
    fn nblc_fast_trigger(&self, m: ModuleId, in_ids: &[InPortId], out_ids: &[OutPortId]) -> bool {
        if self.is_nblc_boundary(m) {
            return false;
        }
        let upstream_produced = in_ids.iter().all(|i| {
            self.inputs[i.idx()]
                .conn
                .is_some_and(|p| self.outputs[p.idx()].any_data_produced)
        });
        upstream_produced
            && in_ids.iter().all(|i| self.inputs[i.idx()].common.has_buffer())
            && out_ids.iter().all(|o| self.outputs[o.idx()].common.has_buffer())
    }

    fn run_sub_loops(&mut self, m: ModuleId) -> Result<()> {
        let loops = self.modules[m.idx()].caps.num_proc_loops.max(1);
        for n in 0..loops {
            let terminate = self.process_module(m, n + 1 == loops)?;
            if terminate || self.pending.any() {
                break;
            }
        }
        Ok(())
    }

    /// Hands back upstream outputs, inputs and then outputs of `m`.
    pub(crate) fn return_module_buffers(&mut self, in_ids: &[InPortId], out_ids: &[OutPortId]) {
        for &i in in_ids {
            if let Some(prev) = self.inputs[i.idx()].conn {
                self.return_output_buffer(prev);
            }
            self.return_input_buffer(i);
        }
        for &o in out_ids {
            let port = &mut self.outputs[o.idx()];
            let next_stopped = port
                .conn
                .is_some_and(|n| self.inputs[n.idx()].common.state == PortState::Stopped);
            if next_stopped && port.common.flags.upstream_realtime && port.common.has_data() {
                #[cfg(feature = "tracing")]
                tracing::debug!("process: dropping {} bytes at {o}, downstream stopped", port.common.total_len());
                self.report.dropped_bytes += u64::from(port.common.total_len());
                port.common.clear_lens();
                port.common.sdata.metadata.clear();
            }
            self.return_output_buffer(o);
        }
    }
}
