//! Architectural-state snapshots.
//!
//! Captures are plain data: register banks, raw CSR values, memory used blocks, IMSIC file
//! contents, and the platform time. Serializing a capture to a snapshot directory is a
//! front-end concern; the core only guarantees that capture followed by restore is the
//! identity on architectural state.

use crate::hart::Hart;
use crate::imsic::{HartFiles, Imsic};
use crate::memory::{Memory, Reservation};
use crate::registers::LEN;
use crate::{csr::CsrNumber, PrivilegeLevel, Xlen};

/// The architectural state of one hart.
#[derive(Debug, Clone, PartialEq)]
pub struct HartSnapshot {
    pub x: [u64; LEN as usize],
    pub pc: u64,
    pub f: [u64; LEN as usize],
    pub v: Vec<u8>,
    pub privilege: PrivilegeLevel,
    pub virt: bool,
    pub csrs: Vec<(CsrNumber, u64)>,
    pub triggers: Vec<(u64, u64, u64)>,
    pub reservation: Option<Reservation>,
}

impl HartSnapshot {
    pub fn capture<X: Xlen>(hart: &Hart<X>) -> Self {
        Self {
            x: *hart.registers().raw(),
            pc: hart.registers().pc(),
            f: *hart.fp_registers().raw(),
            v: hart.vec_registers().raw().to_vec(),
            privilege: hart.privilege(),
            virt: hart.virt(),
            csrs: hart.csrs().snapshot(),
            triggers: hart.triggers_snapshot(),
            reservation: hart.memory().reservation(hart.hart_ix() as usize),
        }
    }

    pub fn restore<X: Xlen>(&self, hart: &mut Hart<X>) {
        hart.registers_mut().restore(&self.x, self.pc);
        hart.fp_registers_mut().restore(&self.f);
        hart.vec_registers_mut().restore(&self.v);
        hart.set_mode(self.privilege, self.virt);
        hart.csrs_mut().restore(&self.csrs);
        hart.triggers_mut().restore(&self.triggers);
        hart.memory()
            .set_reservation(hart.hart_ix() as usize, self.reservation);
    }
}

/// Memory contents as `(address, bytes)` used blocks.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MemorySnapshot {
    pub blocks: Vec<(u64, Vec<u8>)>,
}

impl MemorySnapshot {
    pub fn capture(memory: &Memory) -> Self {
        let blocks = memory
            .used_blocks()
            .into_iter()
            .map(|(addr, len)| {
                let mut bytes = vec![0u8; len as usize];
                memory
                    .peek(addr, &mut bytes)
                    .expect("used blocks are in range");
                (addr, bytes)
            })
            .collect();
        Self { blocks }
    }

    pub fn restore(&self, memory: &Memory) {
        for (addr, bytes) in &self.blocks {
            memory.poke(*addr, bytes).expect("snapshot blocks fit");
        }
    }
}

/// The whole simulator's architectural state.
#[derive(Debug, Clone, PartialEq)]
pub struct SystemSnapshot {
    pub harts: Vec<HartSnapshot>,
    pub memory: MemorySnapshot,
    pub imsic: Vec<HartFiles>,
    pub time: u64,
}

impl SystemSnapshot {
    pub fn capture<X: Xlen>(
        harts: &[Hart<X>],
        memory: &Memory,
        imsic: Option<&Imsic>,
        time: u64,
    ) -> Self {
        Self {
            harts: harts.iter().map(HartSnapshot::capture).collect(),
            memory: MemorySnapshot::capture(memory),
            imsic: imsic.map(|i| i.snapshot()).unwrap_or_default(),
            time,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hart::Config;
    use crate::registers::Specifier;
    use crate::Rv64;
    use std::sync::Arc;

    #[test]
    fn test_hart_snapshot_roundtrip() {
        let mem = Arc::new(Memory::new(1 << 20, 1, 64));
        let mut hart: Hart<Rv64> = Hart::new(mem.clone(), Config::default());
        hart.registers_mut().set_x(Specifier::from_u5(5), 0x1234);
        hart.registers_mut().set_pc(0x8000_0040);
        hart.csrs_mut().store(crate::csr::numbers::MSCRATCH, 0xABCD);
        hart.set_mode(PrivilegeLevel::Supervisor, true);
        mem.make_reservation(0, 0x2000).unwrap();

        let snapshot = HartSnapshot::capture(&hart);

        // Disturb everything, then restore.
        hart.registers_mut().set_x(Specifier::from_u5(5), 0);
        hart.registers_mut().set_pc(0);
        hart.csrs_mut().store(crate::csr::numbers::MSCRATCH, 0);
        hart.set_mode(PrivilegeLevel::Machine, false);
        mem.set_reservation(0, None);

        snapshot.restore(&mut hart);
        assert_eq!(hart.registers().x(Specifier::from_u5(5)), 0x1234);
        assert_eq!(hart.registers().pc(), 0x8000_0040);
        assert_eq!(hart.csrs().raw(crate::csr::numbers::MSCRATCH), 0xABCD);
        assert_eq!(hart.privilege(), PrivilegeLevel::Supervisor);
        assert!(hart.virt());
        assert!(mem.reservation(0).is_some());

        // Round trip is the identity.
        assert_eq!(HartSnapshot::capture(&hart), snapshot);
    }

    #[test]
    fn test_memory_snapshot_roundtrip() {
        let mem = Memory::new(1 << 20, 1, 64);
        mem.write(0x1000, &[1, 2, 3, 4]).unwrap();
        mem.write(0x8000, &[9; 64]).unwrap();
        let snapshot = MemorySnapshot::capture(&mem);
        mem.write(0x1000, &[0xFF; 4]).unwrap();
        snapshot.restore(&mem);
        let mut buf = [0u8; 4];
        mem.read(0x1000, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
        assert_eq!(MemorySnapshot::capture(&mem), snapshot);
    }
}
