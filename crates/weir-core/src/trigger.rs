//! Trigger policies and data-trigger evaluation.
//!
//! A module runs when its trigger condition holds. Without a
//! [`TriggerPolicy`] the default rule applies: every started, flowing input
//! has a trigger, every started output has an empty buffer, and at least one
//! port exists on each side (sources and sinks excepted).
//!
//! A policy groups ports. Inside a group every mandatory port must have a
//! trigger and, if the group lists optional ports, at least one of them.
//! Groups combine with [`Combine::Any`] or [`Combine::All`].

#[cfg(not(feature = "std"))]
use alloc::vec::Vec;

use crate::module::ModuleId;
use crate::port::{InPortId, OutPortId, PortState};
use crate::topology::Topology;

/// A module-local port reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortRef {
    /// Input by local index.
    Input(usize),
    /// Output by local index.
    Output(usize),
}

/// Role of a port under a policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortRole {
    /// Must have a trigger.
    Mandatory,
    /// One optional port of the group must have a trigger.
    Optional,
    /// Ignored for triggering; still gets buffers.
    NonTriggerable,
    /// Ignored for triggering and never given a buffer.
    Blocked,
}

/// How group results combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Combine {
    /// Any satisfied group triggers the module.
    #[default]
    Any,
    /// Every group must be satisfied.
    All,
}

/// One trigger group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TriggerGroup {
    /// Ports that must all have a trigger.
    pub mandatory: Vec<PortRef>,
    /// Ports of which at least one must have a trigger.
    pub optional: Vec<PortRef>,
}

impl TriggerGroup {
    /// Group with mandatory ports only.
    pub fn all_of(ports: impl IntoIterator<Item = PortRef>) -> Self {
        Self {
            mandatory: ports.into_iter().collect(),
            optional: Vec::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.mandatory.is_empty() && self.optional.is_empty()
    }

    fn satisfied(&self, mut has_trigger: impl FnMut(PortRef) -> bool) -> bool {
        if self.is_empty() {
            return false;
        }
        let mandatory = self.mandatory.iter().all(|&p| has_trigger(p));
        let optional = self.optional.is_empty() || self.optional.iter().any(|&p| has_trigger(p));
        mandatory && optional
    }
}

/// Custom trigger policy a module declares in its caps.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TriggerPolicy {
    /// Trigger groups.
    pub groups: Vec<TriggerGroup>,
    /// Group combination.
    pub combine: Combine,
    /// Ports excluded from triggering.
    pub non_triggerable: Vec<PortRef>,
    /// Ports that are blocked.
    pub blocked: Vec<PortRef>,
}

impl TriggerPolicy {
    /// Role of a port.
    pub fn role_of(&self, port: PortRef) -> PortRole {
        if self.blocked.contains(&port) {
            PortRole::Blocked
        } else if self.non_triggerable.contains(&port) {
            PortRole::NonTriggerable
        } else if self.groups.iter().any(|g| g.optional.contains(&port)) {
            PortRole::Optional
        } else {
            PortRole::Mandatory
        }
    }

    /// Evaluates the policy against a per-port trigger predicate.
    pub fn evaluate(&self, mut has_trigger: impl FnMut(PortRef) -> bool) -> bool {
        let mut groups = self.groups.iter().filter(|g| !g.is_empty()).peekable();
        if groups.peek().is_none() {
            return false;
        }
        match self.combine {
            Combine::Any => groups.any(|g| g.satisfied(&mut has_trigger)),
            Combine::All => groups.all(|g| g.satisfied(&mut has_trigger)),
        }
    }
}

/// Which trigger drives the current cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TriggerMode {
    /// Modules run when data is available.
    #[default]
    Data,
    /// Modules run on a periodic signal; late data is dropped.
    Signal,
}

impl Topology {
    pub(crate) fn port_role(&self, module: ModuleId, port: PortRef) -> PortRole {
        self.modules[module.idx()]
            .caps
            .trigger_policy
            .as_ref()
            .map_or(PortRole::Mandatory, |tp| tp.role_of(port))
    }

    /// Output trigger used before acquiring a buffer.
    ///
    /// A started, unblocked output without stale data can take a buffer.
    pub(crate) fn output_wants_buffer(&self, id: OutPortId, local: usize) -> bool {
        let port = &self.outputs[id.idx()];
        port.common.state == PortState::Started
            && self.port_role(port.common.module, PortRef::Output(local)) != PortRole::Blocked
            && !port.common.has_data()
    }

    /// Whether an output offers an empty buffer.
    pub(crate) fn output_has_empty_buffer(&self, id: OutPortId) -> bool {
        let c = &self.outputs[id.idx()].common;
        c.has_buffer() && c.len_per_buf() == 0
    }

    /// Whether an input holds enough data to run its module.
    ///
    /// Threshold ports of modules that do not buffer need a full buffer
    /// unless an end-of-frame, erasure or EOS marker forces processing. A
    /// port left short records its length as owed to the previous buffer.
    pub(crate) fn input_trigger_present(&mut self, id: InPortId) -> bool {
        let module = self.inputs[id.idx()].common.module;
        let fixed_frame = !self.modules[module.idx()].caps.requires_data_buffering;
        let port = &mut self.inputs[id.idx()];
        if !port.common.has_buffer() {
            return false;
        }
        if fixed_frame && port.common.flags.has_threshold {
            let view = port.common.bufs[0];
            let f = port.common.sdata.flags;
            if view.actual_len != view.max_len && !f.end_of_frame && !f.erasure && !f.marker_eos {
                port.bytes_from_prev_buf = view.actual_len;
                port.need_more_input = true;
                return false;
            }
        }
        true
    }

    /// Data-trigger condition for a module.
    pub(crate) fn data_trigger_satisfied(&mut self, module: ModuleId) -> bool {
        if self.modules[module.idx()].caps.trigger_policy.is_some() {
            return self.policy_trigger_satisfied(module);
        }

        let node = &self.modules[module.idx()];
        let (in_ids, out_ids) = (node.inputs.clone(), node.outputs.clone());
        let mut any_in = node.caps.is_source || in_ids.is_empty();
        let mut any_out = node.caps.is_sink || out_ids.is_empty();

        for id in in_ids {
            let c = &self.inputs[id.idx()].common;
            if c.state != PortState::Started || c.flow_state != crate::port::DataFlowState::Flowing {
                continue;
            }
            any_in = true;
            let mf_valid = c.flags.is_mf_valid;
            if !(self.input_trigger_present(id) && mf_valid) {
                return false;
            }
        }
        if !any_in {
            return false;
        }

        for id in out_ids {
            let c = &self.outputs[id.idx()].common;
            if c.state != PortState::Started || c.max_len_per_buf == 0 {
                continue;
            }
            any_out = true;
            if !self.output_has_empty_buffer(id) {
                return false;
            }
        }
        any_out
    }

    fn policy_trigger_satisfied(&mut self, module: ModuleId) -> bool {
        let node = &self.modules[module.idx()];
        let (in_ids, out_ids) = (node.inputs.clone(), node.outputs.clone());
        let Some(policy) = node.caps.trigger_policy.clone() else {
            return false;
        };
        let in_present: Vec<bool> = in_ids
            .iter()
            .map(|&id| {
                self.inputs[id.idx()].common.state == PortState::Started
                    && self.input_trigger_present(id)
            })
            .collect();
        let out_present: Vec<bool> = out_ids
            .iter()
            .map(|&id| {
                self.outputs[id.idx()].common.state == PortState::Started
                    && self.output_has_empty_buffer(id)
            })
            .collect();

        policy.evaluate(|p| match policy.role_of(p) {
            PortRole::Blocked | PortRole::NonTriggerable => false,
            PortRole::Mandatory | PortRole::Optional => match p {
                PortRef::Input(i) => in_present.get(i).copied().unwrap_or(false),
                PortRef::Output(o) => out_present.get(o).copied().unwrap_or(false),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_role_is_mandatory() {
        let tp = TriggerPolicy {
            groups: vec![TriggerGroup {
                mandatory: vec![PortRef::Input(0)],
                optional: vec![PortRef::Output(0), PortRef::Output(1)],
            }],
            blocked: vec![PortRef::Input(1)],
            ..TriggerPolicy::default()
        };
        assert_eq!(tp.role_of(PortRef::Input(0)), PortRole::Mandatory);
        assert_eq!(tp.role_of(PortRef::Output(1)), PortRole::Optional);
        assert_eq!(tp.role_of(PortRef::Input(1)), PortRole::Blocked);
    }

    #[test]
    fn one_optional_port_is_enough() {
        let tp = TriggerPolicy {
            groups: vec![TriggerGroup {
                mandatory: vec![PortRef::Input(0)],
                optional: vec![PortRef::Output(0), PortRef::Output(1)],
            }],
            ..TriggerPolicy::default()
        };
        assert!(tp.evaluate(|p| p != PortRef::Output(0)));
        assert!(!tp.evaluate(|p| matches!(p, PortRef::Input(_))));
        assert!(!tp.evaluate(|p| p != PortRef::Input(0)));
    }

    #[test]
    fn all_combination_needs_every_group() {
        let tp = TriggerPolicy {
            groups: vec![
                TriggerGroup::all_of([PortRef::Input(0)]),
                TriggerGroup::all_of([PortRef::Input(1)]),
            ],
            combine: Combine::All,
            ..TriggerPolicy::default()
        };
        assert!(!tp.evaluate(|p| p == PortRef::Input(0)));
        assert!(tp.evaluate(|_| true));

        let any = TriggerPolicy {
            combine: Combine::Any,
            ..tp
        };
        assert!(any.evaluate(|p| p == PortRef::Input(1)));
    }

    #[test]
    fn empty_policy_never_triggers() {
        assert!(!TriggerPolicy::default().evaluate(|_| true));
    }
}
