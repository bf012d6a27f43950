//! Memory consistency model checker.
//!
//! Correlates the architectural model's retire stream with the RTL's device-visible memory
//! operations (reads, merge-buffer traffic, bypass writes) and verifies that the observed
//! interleaving is legal under RVWMO: per-hart in-flight instructions, a global time-ordered
//! operation log, byte-wise store-to-load forwarding from the undrained store set, and the
//! preserved-program-order rules 1 through 13.
//!
//! Violations are reported through the log and collected; they never stop the run, so a
//! single pass surfaces every problem.

use crate::instruction::Instruction;
use crate::memory::Memory;
use log::error;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

pub type McmInstrIx = u64;
pub type MemoryOpIx = usize;

/// Number of PPO rules (1-based indexing; slot 0 unused).
pub const PPO_RULE_COUNT: usize = 14;

/// A device-visible memory operation reported by the RTL side.
#[derive(Debug, Clone)]
pub struct MemoryOp {
    pub time: u64,
    pub phys_addr: u64,
    /// Model data for the operation (forwarded + memory bytes for reads).
    pub data: u64,
    /// Data observed by the RTL.
    pub rtl_data: u64,
    pub instr_tag: McmInstrIx,
    pub hart_ix: usize,
    pub size: u32,
    /// Retire time of the store that forwarded to this read (0 if none).
    pub forward_time: u64,
    /// Bit per byte: which bytes were forwarded from the store buffer.
    pub forward_mask: u8,
    pub is_read: bool,
    pub fail_read: bool,
    pub canceled: bool,
}

impl MemoryOp {
    fn overlaps_addr(&self, addr: u64) -> bool {
        addr >= self.phys_addr && addr < self.phys_addr + self.size as u64
    }

    /// The time at which the byte at `addr` became visible to this operation: the forward
    /// time for forwarded bytes, the operation time otherwise.
    fn byte_time(&self, addr: u64) -> u64 {
        let ix = (addr - self.phys_addr) as u8;
        if self.forward_mask >> ix & 1 == 1 {
            self.forward_time
        } else {
            self.time
        }
    }

    fn byte(&self, addr: u64) -> u8 {
        (self.data >> ((addr - self.phys_addr) * 8)) as u8
    }
}

/// An in-flight (or retired) instruction as seen by the checker.
#[derive(Debug, Clone, Default)]
pub struct McmInstr {
    pub tag: McmInstrIx,
    pub hart_ix: usize,
    pub instruction: Option<Instruction>,
    pub virt_addr: u64,
    pub phys_addr: u64,
    /// Second physical page for page-crossing accesses (0 if none).
    pub phys_addr2: u64,
    pub size: u32,
    pub store_data: u64,
    pub mem_ops: Vec<MemoryOpIx>,
    pub addr_producer: McmInstrIx,
    pub addr_time: u64,
    pub data_producer: McmInstrIx,
    pub data_time: u64,
    pub retire_time: u64,
    /// Drain time of a store's merge-buffer write (or bypass write).
    pub drain_time: u64,
    pub retired: bool,
    pub canceled: bool,
    pub is_load: bool,
    pub is_store: bool,
    pub complete: bool,
}

impl McmInstr {
    /// Whether the data ranges of two memory instructions overlap. Failed SCs (size 0)
    /// overlap nothing.
    fn overlaps(&self, other: &McmInstr) -> bool {
        if self.size == 0 || other.size == 0 {
            return false;
        }
        self.phys_addr < other.phys_addr + other.size as u64
            && other.phys_addr < self.phys_addr + self.size as u64
    }

    fn covers(&self, addr: u64) -> bool {
        self.size != 0 && addr >= self.phys_addr && addr < self.phys_addr + self.size as u64
    }

    fn is_memory(&self) -> bool {
        self.is_load || self.is_store
    }
}

/// A reported PPO violation or protocol error.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Violation {
    pub rule: usize,
    pub hart_ix: usize,
    pub tag_a: McmInstrIx,
    pub tag_b: McmInstrIx,
    pub time_a: u64,
    pub time_b: u64,
    pub phys_addr: u64,
    pub what: String,
}

// Per-register producer bookkeeping (tag and retire time of the producing instruction).
#[derive(Debug, Clone, Copy, Default)]
struct Producer {
    tag: McmInstrIx,
    time: u64,
}

#[derive(Debug, Clone, Default)]
struct HartState {
    instrs: BTreeMap<McmInstrIx, McmInstr>,
    undrained_stores: BTreeSet<McmInstrIx>,
    /// Producer of each x register (by global register index).
    reg_producers: [Producer; 32],
    /// Newest load feeding a branch condition, for the control-dependency rule.
    branch_producer: Producer,
    last_retired_tag: McmInstrIx,
}

/// Per-instruction information handed over by the hart at retire time.
#[derive(Debug, Clone, Default)]
pub struct RetireInfo {
    pub virt_addr: u64,
    pub phys_addr: u64,
    pub phys_addr2: u64,
    pub size: u32,
    pub store_data: u64,
}

/// The checker.
#[derive(Debug)]
pub struct Mcm {
    memory: Arc<Memory>,
    harts: Vec<HartState>,
    sys_mem_ops: Vec<MemoryOp>,
    /// Merge-buffer (cache) line size in bytes; a power of two.
    line_size: u64,
    check_whole_line: bool,
    tso: bool,
    ppo_enabled: [bool; PPO_RULE_COUNT],
    last_time: u64,
    violations: Vec<Violation>,
}

impl Mcm {
    pub fn new(memory: Arc<Memory>, hart_count: usize, line_size: u64) -> Self {
        assert!(line_size.is_power_of_two());
        Self {
            memory,
            harts: vec![HartState::default(); hart_count],
            sys_mem_ops: Vec::new(),
            line_size,
            check_whole_line: false,
            tso: false,
            ppo_enabled: [true; PPO_RULE_COUNT],
            last_time: 0,
            violations: Vec::new(),
        }
    }

    pub fn line_size(&self) -> u64 {
        self.line_size
    }

    pub fn enable_tso(&mut self, on: bool) {
        self.tso = on;
    }

    pub fn enable_whole_line_check(&mut self, on: bool) {
        self.check_whole_line = on;
    }

    /// Enable or disable a single PPO rule.
    pub fn enable_ppo(&mut self, rule: usize, on: bool) {
        if rule < PPO_RULE_COUNT {
            self.ppo_enabled[rule] = on;
        }
    }

    /// Enable or disable all PPO rules.
    pub fn enable_all_ppo(&mut self, on: bool) {
        self.ppo_enabled = [on; PPO_RULE_COUNT];
    }

    pub fn violations(&self) -> &[Violation] {
        &self.violations
    }

    pub fn op(&self, ix: MemoryOpIx) -> &MemoryOp {
        &self.sys_mem_ops[ix]
    }

    fn report(&mut self, violation: Violation) {
        error!(
            rule = violation.rule,
            hart = violation.hart_ix,
            tag_a = violation.tag_a,
            tag_b = violation.tag_b,
            time_a = violation.time_a,
            time_b = violation.time_b,
            addr = violation.phys_addr;
            "MCM violation: {}",
            violation.what
        );
        self.violations.push(violation);
    }

    fn protocol_error(&mut self, hart_ix: usize, tag: McmInstrIx, what: String) {
        error!(hart = hart_ix, tag; "MCM protocol error: {what}");
        self.violations.push(Violation {
            rule: 0,
            hart_ix,
            tag_a: tag,
            tag_b: tag,
            time_a: 0,
            time_b: 0,
            phys_addr: 0,
            what,
        });
    }

    // Times are globally monotone non-decreasing across all producers.
    fn check_time(&mut self, hart_ix: usize, tag: McmInstrIx, time: u64) {
        if time < self.last_time {
            self.protocol_error(
                hart_ix,
                tag,
                format!("non-monotone time {time} after {}", self.last_time),
            );
        }
        self.last_time = self.last_time.max(time);
    }

    fn instr_mut(&mut self, hart_ix: usize, tag: McmInstrIx) -> &mut McmInstr {
        self.harts[hart_ix].instrs.entry(tag).or_insert_with(|| McmInstr {
            tag,
            hart_ix,
            ..McmInstr::default()
        })
    }

    //
    // RTL-side operations.
    //

    /// Register an out-of-order read for a load instruction. Bytes covered by undrained
    /// stores of the same hart are forwarded (newest store wins per byte); the rest come
    /// from memory. Returns `false` if memory was unreadable for a non-forwarded byte.
    pub fn read_op(
        &mut self,
        hart_ix: usize,
        time: u64,
        tag: McmInstrIx,
        phys_addr: u64,
        size: u32,
        rtl_data: u64,
    ) -> bool {
        self.check_time(hart_ix, tag, time);
        let mut op = MemoryOp {
            time,
            phys_addr,
            data: 0,
            rtl_data,
            instr_tag: tag,
            hart_ix,
            size,
            forward_time: 0,
            forward_mask: 0,
            is_read: true,
            fail_read: false,
            canceled: false,
        };

        // Forward from the undrained store set, oldest to newest so the newest wins.
        let undrained: Vec<McmInstrIx> = self.harts[hart_ix]
            .undrained_stores
            .iter()
            .copied()
            .filter(|&t| t < tag)
            .collect();
        for store_tag in undrained {
            let store = &self.harts[hart_ix].instrs[&store_tag];
            if store.size == 0 {
                continue;
            }
            for byte_ix in 0..size as u64 {
                let addr = phys_addr + byte_ix;
                if store.covers(addr) {
                    let byte = (store.store_data >> ((addr - store.phys_addr) * 8)) as u8;
                    op.data &= !(0xFFu64 << (byte_ix * 8));
                    op.data |= (byte as u64) << (byte_ix * 8);
                    op.forward_mask |= 1 << byte_ix;
                    op.forward_time = store.retire_time;
                }
            }
        }

        // Remaining bytes from memory.
        let mut ok = true;
        for byte_ix in 0..size as u64 {
            if op.forward_mask >> byte_ix & 1 == 1 {
                continue;
            }
            let mut buf = [0u8; 1];
            if self.memory.peek(phys_addr + byte_ix, &mut buf).is_err() {
                op.fail_read = true;
                ok = false;
                continue;
            }
            op.data |= (buf[0] as u64) << (byte_ix * 8);
        }

        let op_ix = self.sys_mem_ops.len();
        self.sys_mem_ops.push(op);
        let instr = self.instr_mut(hart_ix, tag);
        instr.is_load = true;
        instr.mem_ops.push(op_ix);
        ok
    }

    /// A write that bypasses the merge buffer: the instruction's writes complete
    /// immediately.
    pub fn bypass_op(
        &mut self,
        hart_ix: usize,
        time: u64,
        tag: McmInstrIx,
        phys_addr: u64,
        size: u32,
        rtl_data: u64,
    ) -> bool {
        self.check_time(hart_ix, tag, time);
        let op_ix = self.sys_mem_ops.len();
        self.sys_mem_ops.push(MemoryOp {
            time,
            phys_addr,
            data: 0,
            rtl_data,
            instr_tag: tag,
            hart_ix,
            size,
            forward_time: 0,
            forward_mask: 0,
            is_read: false,
            fail_read: false,
            canceled: false,
        });
        let instr = self.instr_mut(hart_ix, tag);
        instr.is_store = true;
        instr.mem_ops.push(op_ix);
        instr.complete = true;
        instr.drain_time = time;
        let retired = instr.retired;
        self.harts[hart_ix].undrained_stores.remove(&tag);
        if retired {
            self.check_store_data(hart_ix, tag);
            self.recheck_after_drain(hart_ix, tag);
        }
        true
    }

    /// The RTL inserted a store into the merge buffer line; the store stays undrained until
    /// the line is written.
    pub fn merge_buffer_insert(
        &mut self,
        hart_ix: usize,
        time: u64,
        tag: McmInstrIx,
        phys_addr: u64,
        size: u32,
        rtl_data: u64,
    ) -> bool {
        self.check_time(hart_ix, tag, time);
        let op_ix = self.sys_mem_ops.len();
        self.sys_mem_ops.push(MemoryOp {
            time,
            phys_addr,
            data: 0,
            rtl_data,
            instr_tag: tag,
            hart_ix,
            size,
            forward_time: 0,
            forward_mask: 0,
            is_read: false,
            fail_read: false,
            canceled: false,
        });
        let instr = self.instr_mut(hart_ix, tag);
        instr.is_store = true;
        instr.mem_ops.push(op_ix);
        true
    }

    /// The RTL committed the merge-buffer line at `line_addr` with a per-byte mask.
    /// Verifies the RTL bytes against model data (the undrained stores, falling back to
    /// memory) and marks covered stores complete.
    pub fn merge_buffer_write(
        &mut self,
        hart_ix: usize,
        time: u64,
        line_addr: u64,
        rtl_data: &[u8],
        mask: &[bool],
    ) -> bool {
        self.check_time(hart_ix, 0, time);
        if line_addr % self.line_size != 0 {
            self.protocol_error(
                hart_ix,
                0,
                format!("merge-buffer write at non-line-aligned address {line_addr:#x}"),
            );
            return false;
        }
        let line_len = (self.line_size as usize).min(rtl_data.len());
        let mut ok = true;
        for ix in 0..line_len {
            let addr = line_addr + ix as u64;
            let checked = mask.get(ix).copied().unwrap_or(false) || self.check_whole_line;
            if !checked {
                continue;
            }
            let model = self.model_byte(hart_ix, addr);
            if model != rtl_data[ix] {
                ok = false;
                self.report(Violation {
                    rule: 0,
                    hart_ix,
                    tag_a: 0,
                    tag_b: 0,
                    time_a: time,
                    time_b: time,
                    phys_addr: addr,
                    what: format!(
                        "merge-buffer write data mismatch at {addr:#x}: rtl {:#04x} model {model:#04x}",
                        rtl_data[ix]
                    ),
                });
            }
        }

        // Drain every undrained store of this hart fully covered by the line.
        let drained: Vec<McmInstrIx> = self.harts[hart_ix]
            .undrained_stores
            .iter()
            .copied()
            .filter(|t| {
                let instr = &self.harts[hart_ix].instrs[t];
                instr.size != 0
                    && instr.phys_addr >= line_addr
                    && instr.phys_addr + instr.size as u64 <= line_addr + self.line_size
            })
            .collect();
        for tag in drained {
            self.harts[hart_ix].undrained_stores.remove(&tag);
            let instr = self.harts[hart_ix].instrs.get_mut(&tag).unwrap();
            instr.complete = true;
            instr.drain_time = time;
            if instr.retired {
                self.check_store_data(hart_ix, tag);
                self.recheck_after_drain(hart_ix, tag);
            }
        }
        ok
    }

    // A store's memory time is only known once it drains; re-run the order-sensitive rules
    // with the drained store on both sides of the relation.
    fn recheck_after_drain(&mut self, hart_ix: usize, tag: McmInstrIx) {
        let a = self.harts[hart_ix].instrs[&tag].clone();
        let all: Vec<McmInstr> = self.harts[hart_ix]
            .instrs
            .values()
            .filter(|i| i.retired && !i.canceled)
            .cloned()
            .collect();
        let fences: Vec<&McmInstr> = all
            .iter()
            .filter(|i| matches!(i.instruction, Some(Instruction::Fence { .. })))
            .collect();
        for b in all.iter().filter(|b| b.tag > tag) {
            if self.tso && a.is_memory() && b.is_memory() {
                let a_store_b_load = a.is_store && !a.is_load && b.is_load && !b.is_store;
                if !a_store_b_load && !self.is_before_in_memory_time(&a, b) {
                    self.violation(2, &a, b, b.phys_addr, "TSO ordering violated");
                }
            }
            if self.ppo_enabled[1] {
                self.ppo_rule_1(&a, b);
            }
            if self.ppo_enabled[6] {
                self.ppo_rule_6(&a, b);
            }
            if self.ppo_enabled[3] {
                self.ppo_rule_3(&a, b);
            }
            if self.ppo_enabled[4] {
                self.ppo_rule_4(&a, b);
            }
            if self.ppo_enabled[2] && b.is_memory() {
                for fence in &fences {
                    let Some(Instruction::Fence {
                        predecessor,
                        successor,
                    }) = fence.instruction
                    else {
                        continue;
                    };
                    if fence.tag <= a.tag || fence.tag >= b.tag {
                        continue;
                    }
                    let a_matches = (a.is_load && predecessor.any_read())
                        || (a.is_store && predecessor.any_write());
                    let b_matches = (b.is_load && successor.any_read())
                        || (b.is_store && successor.any_write());
                    if a_matches && b_matches && !self.is_before_in_memory_time(&a, b) {
                        self.violation(2, &a, b, b.phys_addr, "operation crossed a fence");
                    }
                }
            }
        }
    }

    // The model's view of a byte: newest undrained store covering it, else memory.
    fn model_byte(&self, hart_ix: usize, addr: u64) -> u8 {
        for tag in self.harts[hart_ix].undrained_stores.iter().rev() {
            let store = &self.harts[hart_ix].instrs[tag];
            if store.covers(addr) {
                return (store.store_data >> ((addr - store.phys_addr) * 8)) as u8;
            }
        }
        let mut buf = [0u8; 1];
        let _ = self.memory.peek(addr, &mut buf);
        buf[0]
    }

    // After a store drained: every byte it wrote must be observable in memory.
    fn check_store_data(&mut self, hart_ix: usize, tag: McmInstrIx) {
        let instr = &self.harts[hart_ix].instrs[&tag];
        let (addr, size, data, drain_time) =
            (instr.phys_addr, instr.size, instr.store_data, instr.drain_time);
        for byte_ix in 0..size as u64 {
            // A newer undrained store may have overwritten this byte in the model.
            let newer_covers = self.harts[hart_ix]
                .undrained_stores
                .iter()
                .any(|t| *t > tag && self.harts[hart_ix].instrs[t].covers(addr + byte_ix));
            if newer_covers {
                continue;
            }
            let mut buf = [0u8; 1];
            let _ = self.memory.peek(addr + byte_ix, &mut buf);
            let expected = (data >> (byte_ix * 8)) as u8;
            if buf[0] != expected {
                self.report(Violation {
                    rule: 0,
                    hart_ix,
                    tag_a: tag,
                    tag_b: tag,
                    time_a: drain_time,
                    time_b: drain_time,
                    phys_addr: addr + byte_ix,
                    what: format!(
                        "drained store byte mismatch at {:#x}: memory {:#04x} model {expected:#04x}",
                        addr + byte_ix,
                        buf[0]
                    ),
                });
            }
        }
    }

    //
    // Model-side operations.
    //

    /// Record the retirement of an instruction, capture its register producers, and run the
    /// incremental PPO checks.
    pub fn retire(
        &mut self,
        hart_ix: usize,
        time: u64,
        tag: McmInstrIx,
        instruction: Instruction,
        info: RetireInfo,
        trapped: bool,
    ) -> bool {
        self.check_time(hart_ix, tag, time);
        if tag <= self.harts[hart_ix].last_retired_tag {
            self.protocol_error(
                hart_ix,
                tag,
                format!(
                    "retire tag {tag} out of order after {}",
                    self.harts[hart_ix].last_retired_tag
                ),
            );
            return false;
        }
        self.harts[hart_ix].last_retired_tag = tag;

        // Producer capture happens against the state before this instruction's own
        // destination is recorded.
        let addr_producer = instruction
            .address_register()
            .map(|r| self.harts[hart_ix].reg_producers[usize::from(r)])
            .unwrap_or_default();
        let data_producer = instruction
            .data_register()
            .map(|r| self.harts[hart_ix].reg_producers[usize::from(r)])
            .unwrap_or_default();

        if instruction.is_branch() {
            // The newest load feeding this branch becomes the control-dependency producer.
            let newest = instruction
                .sources()
                .into_iter()
                .flatten()
                .map(|r| self.harts[hart_ix].reg_producers[usize::from(r)])
                .max_by_key(|p| p.tag)
                .unwrap_or_default();
            let state = &mut self.harts[hart_ix];
            if newest.tag > state.branch_producer.tag {
                state.branch_producer = newest;
            }
        }

        let already_complete;
        {
            let instr = self.instr_mut(hart_ix, tag);
            already_complete = instr.complete;
            instr.instruction = Some(instruction);
            instr.retired = true;
            instr.retire_time = time;
            instr.virt_addr = info.virt_addr;
            instr.phys_addr = info.phys_addr;
            instr.phys_addr2 = info.phys_addr2;
            instr.size = info.size;
            instr.store_data = info.store_data;
            instr.addr_producer = addr_producer.tag;
            instr.addr_time = addr_producer.time;
            instr.data_producer = data_producer.tag;
            instr.data_time = data_producer.time;
            if instruction.is_store() && info.size != 0 {
                instr.is_store = true;
            }
            if instruction.is_load() {
                instr.is_load = true;
            }
            if trapped {
                instr.canceled = true;
            }
        }

        if trapped {
            self.cancel_instruction(hart_ix, tag);
            return true;
        }

        // A store whose writes already completed (bypass) never enters the undrained set.
        if instruction.is_store() && info.size != 0 && !already_complete {
            self.harts[hart_ix].undrained_stores.insert(tag);
        }

        if let Some(dest) = instruction.destination() {
            self.harts[hart_ix].reg_producers[usize::from(dest)] = Producer { tag, time };
        }

        // Verify the RTL read data against model data for loads.
        if instruction.is_load() {
            self.check_load_data(hart_ix, tag);
        }

        self.run_ppo_checks(hart_ix, tag);
        true
    }

    fn check_load_data(&mut self, hart_ix: usize, tag: McmInstrIx) {
        let instr = &self.harts[hart_ix].instrs[&tag];
        let mut mismatches = Vec::new();
        for &op_ix in &instr.mem_ops {
            let op = &self.sys_mem_ops[op_ix];
            if op.is_read && !op.canceled && op.rtl_data != op.data {
                mismatches.push((op.time, op.phys_addr, op.rtl_data, op.data));
            }
        }
        for (time, addr, rtl, model) in mismatches {
            self.report(Violation {
                rule: 0,
                hart_ix,
                tag_a: tag,
                tag_b: tag,
                time_a: time,
                time_b: time,
                phys_addr: addr,
                what: format!("load data mismatch: rtl {rtl:#x} model {model:#x}"),
            });
        }
    }

    /// Cancel all memory operations of a (speculatively flushed or trapped) instruction.
    pub fn cancel_instruction(&mut self, hart_ix: usize, tag: McmInstrIx) {
        if let Some(instr) = self.harts[hart_ix].instrs.get_mut(&tag) {
            instr.canceled = true;
            let ops = instr.mem_ops.clone();
            for op_ix in ops {
                self.sys_mem_ops[op_ix].canceled = true;
            }
        }
        self.harts[hart_ix].undrained_stores.remove(&tag);
    }

    /// Speculative rollback: drop every non-retired instruction of the hart.
    pub fn flush(&mut self, hart_ix: usize) {
        let tags: Vec<McmInstrIx> = self.harts[hart_ix]
            .instrs
            .iter()
            .filter(|(_, i)| !i.retired)
            .map(|(&t, _)| t)
            .collect();
        for tag in tags {
            self.cancel_instruction(hart_ix, tag);
            self.harts[hart_ix].instrs.remove(&tag);
        }
    }

    /// End-of-run checks: undrained stores and incomplete instructions are protocol errors.
    pub fn final_checks(&mut self) -> bool {
        let mut ok = true;
        for hart_ix in 0..self.harts.len() {
            let undrained: Vec<McmInstrIx> =
                self.harts[hart_ix].undrained_stores.iter().copied().collect();
            for tag in undrained {
                ok = false;
                self.protocol_error(hart_ix, tag, "store never drained".into());
            }
        }
        ok
    }

    //
    // Byte-time helpers (defined for instructions with operations only).
    //

    /// The earliest memory time of the byte at `addr` within `instr`'s operations;
    /// 0 if the instruction does not cover the address.
    pub fn earliest_byte_time(&self, instr: &McmInstr, addr: u64) -> u64 {
        instr
            .mem_ops
            .iter()
            .map(|&ix| &self.sys_mem_ops[ix])
            .filter(|op| !op.canceled && op.overlaps_addr(addr))
            .map(|op| op.byte_time(addr))
            .min()
            .unwrap_or(if instr.is_store { instr.drain_time } else { 0 })
    }

    /// The latest memory time of the byte at `addr` within `instr`'s operations.
    pub fn latest_byte_time(&self, instr: &McmInstr, addr: u64) -> u64 {
        instr
            .mem_ops
            .iter()
            .map(|&ix| &self.sys_mem_ops[ix])
            .filter(|op| !op.canceled && op.overlaps_addr(addr))
            .map(|op| op.byte_time(addr))
            .max()
            .unwrap_or(if instr.is_store { instr.drain_time } else { 0 })
    }

    fn earliest_op_time(&self, instr: &McmInstr) -> u64 {
        instr
            .mem_ops
            .iter()
            .map(|&ix| &self.sys_mem_ops[ix])
            .filter(|op| !op.canceled)
            .map(|op| op.time)
            .min()
            .unwrap_or(if instr.is_store && instr.complete {
                instr.drain_time
            } else {
                instr.retire_time
            })
    }

    fn latest_op_time(&self, instr: &McmInstr) -> u64 {
        let op_max = instr
            .mem_ops
            .iter()
            .map(|&ix| &self.sys_mem_ops[ix])
            .filter(|op| !op.canceled)
            .map(|op| op.time)
            .max();
        match op_max {
            Some(t) if instr.is_store => t.max(instr.drain_time),
            Some(t) => t,
            None if instr.is_store => instr.drain_time.max(instr.retire_time),
            None => instr.retire_time,
        }
    }

    /// The partial order used by the rules: A is before B when all of A's operation times
    /// precede all of B's.
    fn is_before_in_memory_time(&self, a: &McmInstr, b: &McmInstr) -> bool {
        self.latest_op_time(a) <= self.earliest_op_time(b)
    }

    //
    // PPO rules, checked with the retiring instruction as B against all prior A in
    // program order.
    //

    fn run_ppo_checks(&mut self, hart_ix: usize, tag: McmInstrIx) {
        let b = self.harts[hart_ix].instrs[&tag].clone();
        let priors: Vec<McmInstr> = self.harts[hart_ix]
            .instrs
            .range(..tag)
            .map(|(_, i)| i.clone())
            .filter(|i| !i.canceled && i.retired)
            .collect();

        for a in &priors {
            if self.ppo_enabled[1] {
                self.ppo_rule_1(a, &b);
            }
            if self.ppo_enabled[3] {
                self.ppo_rule_3(a, &b);
            }
            if self.ppo_enabled[4] {
                self.ppo_rule_4(a, &b);
            }
            if self.ppo_enabled[5] {
                self.ppo_rule_5(a, &b);
            }
            if self.ppo_enabled[6] {
                self.ppo_rule_6(a, &b);
            }
            if self.ppo_enabled[7] {
                self.ppo_rule_7(a, &b);
            }
            if self.tso && a.is_memory() && b.is_memory() {
                // TSO: everything except store-to-load is ordered.
                let a_store_b_load = a.is_store && !a.is_load && b.is_load && !b.is_store;
                if !a_store_b_load && !self.is_before_in_memory_time(a, &b) {
                    self.violation(2, a, &b, b.phys_addr, "TSO ordering violated");
                }
            }
        }
        if self.ppo_enabled[2] {
            self.ppo_rule_2(&b, &priors);
        }
        for rule in 8..=13 {
            if self.ppo_enabled[rule] {
                self.dependency_rules(rule, hart_ix, &b);
            }
        }
    }

    fn violation(&mut self, rule: usize, a: &McmInstr, b: &McmInstr, addr: u64, what: &str) {
        self.report(Violation {
            rule,
            hart_ix: b.hart_ix,
            tag_a: a.tag,
            tag_b: b.tag,
            time_a: self.latest_op_time(a),
            time_b: self.earliest_op_time(b),
            phys_addr: addr,
            what: what.into(),
        });
    }

    // Rule 1: B is a load reading a byte also written by an earlier store A. Unless the
    // byte was forwarded, B must observe it no earlier than A's drain.
    fn ppo_rule_1(&mut self, a: &McmInstr, b: &McmInstr) {
        if !a.is_store || !b.is_load || !a.overlaps(b) {
            return;
        }
        for byte_ix in 0..b.size as u64 {
            let addr = b.phys_addr + byte_ix;
            if !a.covers(addr) {
                continue;
            }
            let forwarded = b
                .mem_ops
                .iter()
                .map(|&ix| &self.sys_mem_ops[ix])
                .any(|op| {
                    op.is_read
                        && !op.canceled
                        && op.overlaps_addr(addr)
                        && op.forward_mask >> (addr - op.phys_addr) & 1 == 1
                });
            if forwarded {
                continue;
            }
            let a_latest = self.latest_byte_time(a, addr);
            let b_earliest = self.earliest_byte_time(b, addr);
            if b_earliest < a_latest {
                self.violation(1, a, b, addr, "load observed stale data past an earlier store");
                return;
            }
        }
    }

    // Rule 2: a fence between A and B with matching predecessor/successor classes orders
    // their operations.
    fn ppo_rule_2(&mut self, b: &McmInstr, priors: &[McmInstr]) {
        if !b.is_memory() {
            return;
        }
        let fences: Vec<&McmInstr> = priors
            .iter()
            .filter(|i| matches!(i.instruction, Some(Instruction::Fence { .. })))
            .collect();
        for fence in fences {
            let Some(Instruction::Fence {
                predecessor,
                successor,
            }) = fence.instruction
            else {
                continue;
            };
            let b_matches = (b.is_load && successor.any_read()) || (b.is_store && successor.any_write());
            if !b_matches {
                continue;
            }
            for a in priors.iter().filter(|a| a.tag < fence.tag && a.is_memory()) {
                let a_matches =
                    (a.is_load && predecessor.any_read()) || (a.is_store && predecessor.any_write());
                if !a_matches {
                    continue;
                }
                if !self.is_before_in_memory_time(a, b) {
                    let addr = b.phys_addr;
                    self.violation(2, a, b, addr, "operation crossed a fence");
                }
            }
        }
    }

    // Rule 3: A is an acquire; no later operation may be observed before A.
    fn ppo_rule_3(&mut self, a: &McmInstr, b: &McmInstr) {
        let acquire = a
            .instruction
            .map(|i| i.is_acquire())
            .unwrap_or(false);
        if !acquire || !b.is_memory() {
            return;
        }
        if !self.is_before_in_memory_time(a, b) {
            self.violation(3, a, b, b.phys_addr, "operation observed before an acquire");
        }
    }

    // Rule 4: B is a release; every earlier operation must be observed before it.
    fn ppo_rule_4(&mut self, a: &McmInstr, b: &McmInstr) {
        let release = b
            .instruction
            .map(|i| i.is_release())
            .unwrap_or(false);
        if !release || !a.is_memory() {
            return;
        }
        if !self.is_before_in_memory_time(a, b) {
            self.violation(4, a, b, b.phys_addr, "operation observed after a release");
        }
    }

    // Rule 5: RCsc pairs order bidirectionally.
    fn ppo_rule_5(&mut self, a: &McmInstr, b: &McmInstr) {
        let rcsc = |i: &McmInstr| {
            i.instruction
                .map(|d| d.is_acquire() || d.is_release())
                .unwrap_or(false)
        };
        if !rcsc(a) || !rcsc(b) {
            return;
        }
        if !self.is_before_in_memory_time(a, b) {
            self.violation(5, a, b, b.phys_addr, "RCsc pair out of order");
        }
    }

    // Rule 6: A is an AMO or successful SC, B a load on the same address: the load must
    // observe the atomic.
    fn ppo_rule_6(&mut self, a: &McmInstr, b: &McmInstr) {
        let atomic = a
            .instruction
            .map(|i| i.is_amo_rmw() || i.is_sc())
            .unwrap_or(false);
        if !atomic || a.size == 0 || !b.is_load || !a.overlaps(b) {
            return;
        }
        if !self.is_before_in_memory_time(a, b) {
            self.violation(6, a, b, b.phys_addr, "load overtook an atomic on the same address");
        }
    }

    // Rule 7: B carries an address dependency on a load A (via its address register).
    fn ppo_rule_7(&mut self, a: &McmInstr, b: &McmInstr) {
        if !b.is_memory() || b.addr_producer == 0 || b.addr_producer != a.tag || !a.is_load {
            return;
        }
        if self.earliest_op_time(b) < self.latest_op_time(a) {
            self.violation(7, a, b, b.phys_addr, "address dependency hazard");
        }
    }

    // Rules 8-13: syntactic data/address/control dependencies on earlier loads. 8/9 cover
    // data and address producers of stores, 10/11 the branch control dependency, 12/13 the
    // corresponding checks against a later-in-time producing load.
    fn dependency_rules(&mut self, rule: usize, hart_ix: usize, b: &McmInstr) {
        let producer = match rule {
            8 | 12 => b.data_producer,
            9 | 13 => b.addr_producer,
            10 | 11 => self.harts[hart_ix].branch_producer.tag,
            _ => 0,
        };
        if producer == 0 || producer >= b.tag {
            return;
        }
        match rule {
            8 | 9 if !b.is_memory() => return,
            10 if !b.is_store => return,
            11 if !b.is_memory() => return,
            _ => {}
        }
        let Some(a) = self.harts[hart_ix].instrs.get(&producer).cloned() else {
            return;
        };
        if !a.is_load || a.canceled {
            return;
        }
        match rule {
            8 | 9 | 10 | 11 => {
                if self.earliest_op_time(b) < self.latest_op_time(&a) {
                    self.violation(rule, &a, b, b.phys_addr, "dependency ordering violated");
                }
            }
            12 | 13 => {
                // The producing load's data must exist no later than B's first operation.
                let produced_at = self.min_read_time(&a);
                if self.earliest_op_time(b) < produced_at {
                    self.violation(rule, &a, b, b.phys_addr, "operation preceded its producer's data");
                }
            }
            _ => {}
        }
    }

    // The earliest time at which a load's data existed: the minimum over its read
    // operations of forwarded-or-read byte times.
    fn min_read_time(&self, a: &McmInstr) -> u64 {
        a.mem_ops
            .iter()
            .map(|&ix| &self.sys_mem_ops[ix])
            .filter(|op| op.is_read && !op.canceled)
            .map(|op| {
                if op.forward_mask != 0 {
                    op.forward_time.min(op.time)
                } else {
                    op.time
                }
            })
            .min()
            .unwrap_or(a.retire_time)
    }

    /// The model value a load should return, merging forwarded bytes over memory at the
    /// earliest read time. Used by the performance-model adapter.
    pub fn load_value(&self, hart_ix: usize, tag: McmInstrIx) -> Option<u64> {
        let instr = self.harts[hart_ix].instrs.get(&tag)?;
        if !instr.is_load {
            return None;
        }
        let mut value = 0u64;
        for byte_ix in 0..instr.size as u64 {
            let addr = instr.phys_addr + byte_ix;
            let op = instr
                .mem_ops
                .iter()
                .map(|&ix| &self.sys_mem_ops[ix])
                .filter(|op| op.is_read && !op.canceled && op.overlaps_addr(addr))
                .min_by_key(|op| op.byte_time(addr))?;
            value |= (op.byte(addr) as u64) << (byte_ix * 8);
        }
        Some(value)
    }
}

#[cfg(test)]
mod tests;
