//! Performance-model adapter: a tag-driven fetch/decode/execute/retire/flush surface that
//! lets an external out-of-order model drive the architectural hart speculatively.
//!
//! Tags are monotone per hart (fetch rejects reordering; flush is the only operation that
//! removes tags from the middle). Register renaming maps each architectural register to the
//! tag of its in-flight producer. Stores are buffered until [`PerfApi::drain_store`] and
//! loads forward byte-wise from the buffered stores, so memory committed by retire is never
//! modified speculatively.

use crate::csr::CsrNumber;
use crate::hart::Hart;
use crate::instruction::Instruction;
use crate::registers::Specifier;
use crate::virt_mem::AccessType;
use crate::Xlen;
use log::trace;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum PerfError {
    /// Tags must be strictly increasing per hart.
    #[error("out-of-order tag")]
    OutOfOrderTag,
    #[error("unknown tag")]
    UnknownTag,
    #[error("operation requires a decoded instruction")]
    NotDecoded,
    #[error("operation requires an executed instruction")]
    NotExecuted,
    /// Only the oldest in-flight instruction can retire.
    #[error("retire out of order")]
    RetireOutOfOrder,
    /// The oldest buffered store must drain first.
    #[error("store drain out of order")]
    DrainOutOfOrder,
}

pub type PerfResult<T = ()> = Result<T, PerfError>;

// Hart state saved before a speculative execute, restored on flush.
#[derive(Debug, Clone)]
struct SavedState {
    x: [u64; 32],
    pc: u64,
    f: [u64; 32],
    csrs: Vec<(CsrNumber, u64)>,
}

/// One in-flight instruction.
#[derive(Debug, Clone)]
pub struct PerfInstr {
    pub tag: u64,
    pub pc: u64,
    pub raw: u32,
    pub instruction: Option<Instruction>,
    /// Producer tags of the source registers at decode time (renaming).
    pub src_producers: [Option<u64>; 2],
    pub executed: bool,
    pub retired: bool,
    pub trapped: bool,
    pub next_pc: u64,
    saved: Option<SavedState>,
}

#[derive(Debug, Clone, Copy)]
struct BufferedStore {
    tag: u64,
    pa: u64,
    size: u32,
    data: u64,
}

/// The adapter, owning the hart it drives.
#[derive(Debug)]
pub struct PerfApi<X: Xlen> {
    hart: Hart<X>,
    in_flight: BTreeMap<u64, PerfInstr>,
    reg_producer: [Option<u64>; 32],
    last_fetched_tag: u64,
    store_buffer: Vec<BufferedStore>,
}

impl<X: Xlen> PerfApi<X> {
    pub fn new(hart: Hart<X>) -> Self {
        Self {
            hart,
            in_flight: BTreeMap::new(),
            reg_producer: [None; 32],
            last_fetched_tag: 0,
            store_buffer: Vec::new(),
        }
    }

    pub fn hart(&self) -> &Hart<X> {
        &self.hart
    }

    pub fn hart_mut(&mut self) -> &mut Hart<X> {
        &mut self.hart
    }

    pub fn instr(&self, tag: u64) -> Option<&PerfInstr> {
        self.in_flight.get(&tag)
    }

    /// Fetch the instruction at `vpc` under a new tag. Tags must be strictly monotone.
    pub fn fetch(&mut self, tag: u64, vpc: u64) -> PerfResult {
        if tag <= self.last_fetched_tag {
            return Err(PerfError::OutOfOrderTag);
        }
        self.last_fetched_tag = tag;
        let mut instr = PerfInstr {
            tag,
            pc: vpc,
            raw: 0,
            instruction: None,
            src_producers: [None; 2],
            executed: false,
            retired: false,
            trapped: false,
            next_pc: vpc,
            saved: None,
        };
        match self.hart.translate(vpc, AccessType::Execute, true) {
            Ok(pa) => {
                let mut buf = [0u8; 4];
                if self.hart.memory().read(pa, &mut buf).is_ok() {
                    instr.raw = u32::from_le_bytes(buf);
                } else {
                    instr.trapped = true;
                }
            }
            Err(_) => instr.trapped = true,
        }
        trace!(tag, vpc, raw = instr.raw; "perf fetch");
        self.in_flight.insert(tag, instr);
        Ok(())
    }

    /// Decode a fetched instruction and rename its sources to producer tags.
    pub fn decode(&mut self, tag: u64) -> PerfResult {
        let producers = self.reg_producer;
        let instr = self.in_flight.get_mut(&tag).ok_or(PerfError::UnknownTag)?;
        if instr.trapped {
            return Ok(());
        }
        let decoded = Instruction::decode(instr.raw).map_err(|_| {
            instr.trapped = true;
            PerfError::NotDecoded
        })?;
        instr.instruction = Some(decoded);
        let sources = decoded.sources();
        for (slot, source) in instr.src_producers.iter_mut().zip(sources) {
            *slot = source.and_then(|r| producers[usize::from(r)]);
        }
        if let Some(dest) = decoded.destination() {
            self.reg_producer[usize::from(dest)] = Some(tag);
        }
        Ok(())
    }

    /// Producer tag of an architectural register, if an in-flight instruction writes it.
    pub fn producing_tag(&self, register: Specifier) -> Option<u64> {
        self.reg_producer[usize::from(register)]
    }

    /// Speculatively execute. Stores are buffered, not written to memory; loads forward
    /// from buffered stores to non-device memory.
    pub fn execute(&mut self, tag: u64) -> PerfResult {
        let instr = self.in_flight.get(&tag).ok_or(PerfError::UnknownTag)?;
        if instr.trapped {
            return Ok(());
        }
        let decoded = instr.instruction.ok_or(PerfError::NotDecoded)?;
        let pc = instr.pc;
        let saved = self.save_state();

        if decoded.is_store() && !decoded.is_amo_rmw() && !decoded.is_sc() {
            // Plain stores never touch hart or memory state speculatively.
            let (pa, size, data, trapped) = self.compute_store(&decoded, pc);
            let instr = self.in_flight.get_mut(&tag).unwrap();
            instr.saved = Some(saved);
            instr.executed = true;
            instr.trapped = trapped;
            instr.next_pc = X::truncate(pc.wrapping_add(4));
            if !trapped {
                self.store_buffer.push(BufferedStore { tag, pa, size, data });
            }
            return Ok(());
        }

        // Everything else executes on the hart. Pure loads that overlap buffered stores get
        // the buffered bytes patched into memory for the duration of the execute. AMOs are
        // exempt: their write must land in memory, so they cannot run under an overlay.
        let overlay = if decoded.is_load() && !decoded.is_amo_rmw() {
            self.apply_store_overlay(tag)
        } else {
            Vec::new()
        };
        let result = self.hart.execute_decoded(decoded, pc);
        self.remove_store_overlay(overlay);
        let _ = self.hart.take_mem_accesses();
        let next_pc = self.hart.registers().pc();

        let instr = self.in_flight.get_mut(&tag).unwrap();
        instr.saved = Some(saved);
        instr.executed = true;
        instr.trapped = result.is_err();
        instr.next_pc = next_pc;
        Ok(())
    }

    /// Retire the oldest in-flight instruction, committing its effects.
    pub fn retire(&mut self, tag: u64) -> PerfResult {
        let oldest = *self.in_flight.keys().next().ok_or(PerfError::UnknownTag)?;
        if oldest != tag {
            return Err(PerfError::RetireOutOfOrder);
        }
        let instr = self.in_flight.get_mut(&tag).ok_or(PerfError::UnknownTag)?;
        if !instr.executed && !instr.trapped {
            return Err(PerfError::NotExecuted);
        }
        instr.retired = true;
        instr.saved = None;
        let is_buffered_store = self.store_buffer.iter().any(|s| s.tag == tag);
        let produced = self
            .in_flight
            .get(&tag)
            .and_then(|i| i.instruction)
            .and_then(|i| i.destination());
        // The retired instruction is no longer a renaming source.
        if let Some(dest) = produced {
            if self.reg_producer[usize::from(dest)] == Some(tag) {
                self.reg_producer[usize::from(dest)] = None;
            }
        }
        if !is_buffered_store {
            self.in_flight.remove(&tag);
        }
        trace!(tag; "perf retire");
        Ok(())
    }

    /// Commit the oldest buffered store to memory. Retired stores stay in the buffer (and
    /// keep forwarding) until the model drains them.
    pub fn drain_store(&mut self, tag: u64) -> PerfResult {
        let Some(first) = self.store_buffer.first().copied() else {
            return Err(PerfError::UnknownTag);
        };
        if first.tag != tag {
            return Err(PerfError::DrainOutOfOrder);
        }
        let retired = self
            .in_flight
            .get(&tag)
            .map(|i| i.retired)
            .unwrap_or(false);
        if !retired {
            return Err(PerfError::NotExecuted);
        }
        self.store_buffer.remove(0);
        let bytes = first.data.to_le_bytes();
        let _ = self.hart.memory().write(first.pa, &bytes[..first.size as usize]);
        self.in_flight.remove(&tag);
        Ok(())
    }

    /// Flush `from_tag` and everything younger: restore the hart to the state before the
    /// oldest flushed instruction executed and rebuild the renaming table.
    pub fn flush(&mut self, from_tag: u64) {
        // The oldest executed instruction being flushed carries the restore point.
        let restore = self
            .in_flight
            .range(from_tag..)
            .find_map(|(_, i)| i.saved.clone());
        if let Some(saved) = restore {
            self.restore_state(&saved);
        }
        self.in_flight.retain(|&t, _| t < from_tag);
        self.store_buffer.retain(|s| s.tag < from_tag);
        // Flushed tags are never reused: the tag sequence stays monotone across flushes.
        // Rebuild renaming from the surviving in-flight instructions, oldest first.
        self.reg_producer = [None; 32];
        for (&tag, instr) in &self.in_flight {
            if instr.retired {
                continue;
            }
            if let Some(dest) = instr.instruction.and_then(|i| i.destination()) {
                self.reg_producer[usize::from(dest)] = Some(tag);
            }
        }
    }

    //
    // Internals.
    //

    fn save_state(&self) -> SavedState {
        SavedState {
            x: *self.hart.registers().raw(),
            pc: self.hart.registers().pc(),
            f: *self.hart.fp_registers().raw(),
            csrs: self.hart.csrs().snapshot(),
        }
    }

    fn restore_state(&mut self, saved: &SavedState) {
        self.hart.registers_mut().restore(&saved.x, saved.pc);
        self.hart.fp_registers_mut().restore(&saved.f);
        self.hart.csrs_mut().restore(&saved.csrs);
    }

    // Compute a plain store's physical address and data without executing it.
    fn compute_store(&mut self, decoded: &Instruction, _pc: u64) -> (u64, u32, u64, bool) {
        let (base, offset, data, size) = match *decoded {
            Instruction::Store {
                width,
                src,
                base,
                offset,
            } => (
                base,
                offset,
                self.hart.registers().x(src),
                width.bytes(),
            ),
            Instruction::StoreFp {
                width,
                src,
                base,
                offset,
            } => (
                base,
                offset,
                self.hart.fp_registers().f(src),
                width.bytes(),
            ),
            _ => unreachable!("caller filtered to plain stores"),
        };
        let va = X::truncate(
            self.hart
                .registers()
                .x(base)
                .wrapping_add(offset as i64 as u64),
        );
        match self.hart.translate(va, AccessType::Write, false) {
            Ok(pa) => {
                let data = if size == 8 {
                    data
                } else {
                    data & ((1u64 << (size * 8)) - 1)
                };
                (pa, size, data, false)
            }
            Err(_) => (0, 0, 0, true),
        }
    }

    // Patch buffered-store bytes (from stores older than `tag`) into memory, returning the
    // original bytes for restoration. Device memory is never patched.
    fn apply_store_overlay(&mut self, tag: u64) -> Vec<(u64, u8)> {
        let mut overlay = Vec::new();
        for store in self.store_buffer.clone() {
            if store.tag >= tag {
                continue;
            }
            if self.hart.memory().pma(store.pa).io {
                continue;
            }
            for byte_ix in 0..store.size as u64 {
                let addr = store.pa + byte_ix;
                let mut old = [0u8];
                if self.hart.memory().peek(addr, &mut old).is_err() {
                    continue;
                }
                overlay.push((addr, old[0]));
                let byte = (store.data >> (byte_ix * 8)) as u8;
                let _ = self.hart.memory().poke(addr, &[byte]);
            }
        }
        overlay
    }

    fn remove_store_overlay(&mut self, overlay: Vec<(u64, u8)>) {
        // Restore in reverse so overlapping patches unwind correctly.
        for (addr, byte) in overlay.into_iter().rev() {
            let _ = self.hart.memory().poke(addr, &[byte]);
        }
    }
}
