//! Debug triggers: address/data match, instruction count, and opcode match, with chaining.
//!
//! The trigger unit owns the state behind the `tselect`/`tdata1..3`/`tinfo` CSRs; the hart
//! routes accesses to those numbers here instead of the CSR file, which keeps the two
//! subsystems free of back-references.

use crate::{ExecMode, PrivilegeLevel};
use bitvec::{field::BitField, order::Lsb0, view::BitView};
use log::trace;

/// tdata1.type for an address/data match trigger (mcontrol6).
const TYPE_MCONTROL6: u64 = 6;
/// tdata1.type for an instruction-count trigger.
const TYPE_ICOUNT: u64 = 3;

/// What a tripped trigger asks the hart to do. Entering debug mode outranks a breakpoint
/// when several triggers trip on the same access.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub enum TriggerAction {
    /// Raise a breakpoint exception.
    Breakpoint,
    /// Enter debug mode.
    EnterDebug,
}

mod mc6 {
    //! Field positions of an mcontrol6 tdata1 value (RV64 layout).
    pub const LOAD: usize = 0;
    pub const STORE: usize = 1;
    pub const EXECUTE: usize = 2;
    pub const U: usize = 3;
    pub const S: usize = 4;
    pub const M: usize = 6;
    pub const MATCH: usize = 7; // 4 bits
    pub const CHAIN: usize = 11;
    pub const ACTION: usize = 12; // 4 bits
    pub const SELECT: usize = 21;
    pub const VU: usize = 23;
    pub const VS: usize = 24;
    pub const HIT0: usize = 22;
}

mod icount {
    pub const ACTION: usize = 0; // 6 bits
    pub const U: usize = 6;
    pub const S: usize = 7;
    pub const M: usize = 9;
    pub const COUNT: usize = 10; // 14 bits
    pub const HIT: usize = 24;
    pub const VU: usize = 25;
    pub const VS: usize = 26;
}

/// The kind of access a trigger can watch.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TriggerWatch {
    Load,
    Store,
    Execute,
}

#[derive(Debug, Clone, Default)]
struct Trigger {
    tdata1: u64,
    tdata2: u64,
    tdata3: u64,
}

impl Trigger {
    fn kind(&self) -> u64 {
        self.tdata1 >> 60
    }

    fn is_mcontrol(&self) -> bool {
        self.kind() == TYPE_MCONTROL6
    }

    fn is_icount(&self) -> bool {
        self.kind() == TYPE_ICOUNT
    }

    fn bit(&self, ix: usize) -> bool {
        self.tdata1.view_bits::<Lsb0>()[ix]
    }

    fn mode_matches(&self, mode: ExecMode) -> bool {
        let (u, s, m, vu, vs) = if self.is_icount() {
            (icount::U, icount::S, icount::M, icount::VU, icount::VS)
        } else {
            (mc6::U, mc6::S, mc6::M, mc6::VU, mc6::VS)
        };
        match (mode.level, mode.virt) {
            (PrivilegeLevel::Machine, _) => self.bit(m),
            (PrivilegeLevel::Supervisor, false) => self.bit(s),
            (PrivilegeLevel::User, false) => self.bit(u),
            (PrivilegeLevel::Supervisor, true) => self.bit(vs),
            (PrivilegeLevel::User, true) => self.bit(vu),
        }
    }

    fn watches(&self, watch: TriggerWatch) -> bool {
        match watch {
            TriggerWatch::Load => self.bit(mc6::LOAD),
            TriggerWatch::Store => self.bit(mc6::STORE),
            TriggerWatch::Execute => self.bit(mc6::EXECUTE),
        }
    }

    // select=0 matches the access address, select=1 the data/opcode value.
    fn watches_value(&self) -> bool {
        self.bit(mc6::SELECT)
    }

    fn chains(&self) -> bool {
        self.bit(mc6::CHAIN)
    }

    fn action(&self) -> TriggerAction {
        let raw: u64 = if self.is_icount() {
            self.tdata1.view_bits::<Lsb0>()[icount::ACTION..icount::ACTION + 6].load_le()
        } else {
            self.tdata1.view_bits::<Lsb0>()[mc6::ACTION..mc6::ACTION + 4].load_le()
        };
        match raw {
            1 => TriggerAction::EnterDebug,
            _ => TriggerAction::Breakpoint,
        }
    }

    // Only equality match is implemented; the match field is WARL-legalised to 0.
    fn compare(&self, value: u64) -> bool {
        value == self.tdata2
    }

    fn count(&self) -> u64 {
        self.tdata1.view_bits::<Lsb0>()[icount::COUNT..icount::COUNT + 14].load_le()
    }

    fn set_count(&mut self, count: u64) {
        self.tdata1.view_bits_mut::<Lsb0>()[icount::COUNT..icount::COUNT + 14]
            .store_le(count & 0x3FFF);
    }

    fn set_hit(&mut self) {
        let ix = if self.is_icount() { icount::HIT } else { mc6::HIT0 };
        self.tdata1.view_bits_mut::<Lsb0>().set(ix, true);
    }
}

/// The per-hart trigger unit.
#[derive(Debug, Clone)]
pub struct Triggers {
    triggers: Vec<Trigger>,
    tselect: usize,
}

impl Triggers {
    pub fn new(count: usize) -> Self {
        Self {
            triggers: vec![Trigger::default(); count],
            tselect: 0,
        }
    }

    pub fn count(&self) -> usize {
        self.triggers.len()
    }

    //
    // CSR surface (routed here by the hart).
    //

    pub fn tselect(&self) -> u64 {
        self.tselect as u64
    }

    /// WARL: selecting a non-existent trigger leaves tselect unchanged.
    pub fn set_tselect(&mut self, value: u64) {
        if (value as usize) < self.triggers.len() {
            self.tselect = value as usize;
        }
    }

    pub fn tdata(&self, ix: u32) -> u64 {
        let trigger = &self.triggers[self.tselect];
        match ix {
            1 => trigger.tdata1,
            2 => trigger.tdata2,
            _ => trigger.tdata3,
        }
    }

    pub fn set_tdata(&mut self, ix: u32, value: u64) {
        let trigger = &mut self.triggers[self.tselect];
        match ix {
            1 => {
                let kind = value >> 60;
                if kind == TYPE_MCONTROL6 || kind == TYPE_ICOUNT || kind == 0 {
                    // Unsupported match modes legalise to equality.
                    let mut value = value;
                    if kind == TYPE_MCONTROL6 {
                        value.view_bits_mut::<Lsb0>()[mc6::MATCH..mc6::MATCH + 4].store_le(0u8);
                    }
                    trigger.tdata1 = value;
                } else {
                    // Unsupported trigger type: WARL to disabled.
                    trigger.tdata1 = 0;
                }
            }
            2 => trigger.tdata2 = value,
            _ => trigger.tdata3 = value,
        }
    }

    /// tinfo for the selected trigger: a bit per supported type.
    pub fn tinfo(&self) -> u64 {
        (1 << TYPE_MCONTROL6) | (1 << TYPE_ICOUNT)
    }

    //
    // Match surface.
    //

    /// Check the address triggers for a data access before it is performed.
    pub fn match_ldst_addr(
        &mut self,
        addr: u64,
        watch: TriggerWatch,
        mode: ExecMode,
    ) -> Option<TriggerAction> {
        self.match_mcontrol(addr, watch, mode, false)
    }

    /// Check the data-value triggers for a data access once the value is known.
    pub fn match_ldst_data(
        &mut self,
        value: u64,
        watch: TriggerWatch,
        mode: ExecMode,
    ) -> Option<TriggerAction> {
        self.match_mcontrol(value, watch, mode, true)
    }

    /// Check the execute-address triggers against the PC of the next instruction.
    pub fn match_inst_addr(&mut self, pc: u64, mode: ExecMode) -> Option<TriggerAction> {
        self.match_mcontrol(pc, TriggerWatch::Execute, mode, false)
    }

    /// Check the opcode triggers against a fetched encoding.
    pub fn match_inst_opcode(&mut self, encoding: u64, mode: ExecMode) -> Option<TriggerAction> {
        self.match_mcontrol(encoding, TriggerWatch::Execute, mode, true)
    }

    // Evaluate all mcontrol triggers, resolving chains: a chained trigger only fires
    // when the next trigger matches as well, and the action is taken from the chain's
    // last element.
    fn match_mcontrol(
        &mut self,
        value: u64,
        watch: TriggerWatch,
        mode: ExecMode,
        select_value: bool,
    ) -> Option<TriggerAction> {
        let matched: Vec<bool> = self
            .triggers
            .iter()
            .map(|t| {
                t.is_mcontrol()
                    && t.mode_matches(mode)
                    && t.watches(watch)
                    && t.watches_value() == select_value
                    && t.compare(value)
            })
            .collect();
        let mut action = None;
        for ix in 0..self.triggers.len() {
            if !matched[ix] {
                continue;
            }
            if self.triggers[ix].chains() {
                // This element only contributes if its successor also matched; the
                // successor produces the action.
                if !matched.get(ix + 1).copied().unwrap_or(false) {
                    continue;
                }
                self.triggers[ix].set_hit();
                continue;
            }
            // Unchained (or chain tail): fires unless it is the unmatched tail of a chain.
            if ix > 0 && self.triggers[ix - 1].chains() && !matched[ix - 1] {
                continue;
            }
            self.triggers[ix].set_hit();
            trace!(ix, value; "trigger tripped");
            action = action.max(Some(self.triggers[ix].action()));
        }
        action
    }

    /// Count down the icount triggers for one retired instruction; fires at zero.
    pub fn tick_icount(&mut self, mode: ExecMode) -> Option<TriggerAction> {
        let mut action = None;
        for trigger in &mut self.triggers {
            if !trigger.is_icount() || !trigger.mode_matches(mode) {
                continue;
            }
            let count = trigger.count();
            if count == 0 {
                continue;
            }
            trigger.set_count(count - 1);
            if count == 1 {
                trigger.set_hit();
                action = action.max(Some(trigger.action()));
            }
        }
        action
    }

    /// Raw state for snapshots.
    pub fn snapshot(&self) -> Vec<(u64, u64, u64)> {
        self.triggers
            .iter()
            .map(|t| (t.tdata1, t.tdata2, t.tdata3))
            .collect()
    }

    pub fn restore(&mut self, state: &[(u64, u64, u64)]) {
        for (trigger, &(d1, d2, d3)) in self.triggers.iter_mut().zip(state) {
            trigger.tdata1 = d1;
            trigger.tdata2 = d2;
            trigger.tdata3 = d3;
        }
    }
}
