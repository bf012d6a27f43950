//! IOMMU: device-directory and process-directory walks, two-stage address translation,
//! MSI translation, and the command/fault/page-request queues.
//!
//! The register bank is memory-mapped over one page region and accessed in naturally
//! aligned 4- or 8-byte chunks. Device translation requests enter through [`Iommu::translate`]
//! (or [`Iommu::ats_translate`] for PCIe ATS); failures append a record to the fault queue
//! unless the device context's DTF bit suppresses them, and queue events raise interrupts
//! either as wire interrupts or as MSI writes through the configured vector table.

mod tables;
#[cfg(test)]
mod tests;

use crate::memory::Memory;
use crate::virt_mem::{AccessType, AtMode, WalkConfig, WalkError, Walker};
use crate::PrivilegeLevel;
use log::{debug, error, trace};
use std::sync::Arc;

pub use tables::{DcFlag, DeviceContext, DeviceContextBuilder, ProcessContext};

/// Translation-request transaction types.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum Ttype {
    #[default]
    None,
    UntransExec,
    UntransRead,
    UntransWrite,
    TransExec,
    TransRead,
    TransWrite,
    PcieAts,
    PcieMessage,
}

impl Ttype {
    /// Encoding used in fault records.
    pub fn code(self) -> u64 {
        match self {
            Self::None => 0,
            Self::UntransExec => 1,
            Self::UntransRead => 2,
            Self::UntransWrite => 3,
            Self::TransExec => 5,
            Self::TransRead => 6,
            Self::TransWrite => 7,
            Self::PcieAts => 8,
            Self::PcieMessage => 9,
        }
    }
}

/// A translation request sent to the IOMMU from a device.
#[derive(Debug, Clone, Default)]
pub struct IommuRequest {
    pub dev_id: u32,
    pub proc_id: Option<u32>,
    pub iova: u64,
    pub ttype: Ttype,
    pub priv_mode: PrivilegeLevel,
    pub size: u32,
}

impl IommuRequest {
    /// A translated request carries an address that already went through translation (or,
    /// with T2GPA, a GPA that still needs the G stage).
    pub fn is_translated(&self) -> bool {
        matches!(self.ttype, Ttype::TransRead | Ttype::TransWrite | Ttype::TransExec)
    }

    pub fn is_read(&self) -> bool {
        matches!(self.ttype, Ttype::TransRead | Ttype::UntransRead)
    }

    pub fn is_write(&self) -> bool {
        matches!(self.ttype, Ttype::TransWrite | Ttype::UntransWrite)
    }

    pub fn is_exec(&self) -> bool {
        matches!(self.ttype, Ttype::TransExec | Ttype::UntransExec)
    }

    pub fn is_ats(&self) -> bool {
        matches!(self.ttype, Ttype::PcieAts)
    }

    fn access_type(&self) -> AccessType {
        if self.is_write() {
            AccessType::Write
        } else if self.is_exec() {
            AccessType::Execute
        } else {
            AccessType::Read
        }
    }
}

//
// Fault causes (the architectural page/access faults below 256 are shared with the CPU).
//
pub mod cause {
    pub const ALL_INBOUND_DISALLOWED: u32 = 256;
    pub const DDT_LOAD_FAULT: u32 = 257;
    pub const DDT_INVALID: u32 = 258;
    pub const DDT_MISCONFIGURED: u32 = 259;
    pub const TRANS_TYPE_DISALLOWED: u32 = 260;
    pub const MSI_PTE_LOAD_FAULT: u32 = 261;
    pub const MSI_PTE_INVALID: u32 = 262;
    pub const MSI_PTE_MISCONFIGURED: u32 = 263;
    pub const MRIF_ACCESS_FAULT: u32 = 264;
    pub const PDT_LOAD_FAULT: u32 = 265;
    pub const PDT_INVALID: u32 = 266;
    pub const PDT_MISCONFIGURED: u32 = 267;
    pub const DDT_CORRUPTION: u32 = 268;
    pub const PDT_CORRUPTION: u32 = 269;
    pub const MSI_PTE_CORRUPTION: u32 = 270;
    pub const MSI_MRIF_CORRUPTION: u32 = 271;
    pub const INTERNAL_DATAPATH_ERROR: u32 = 272;
    pub const MSI_WRITE_FAULT: u32 = 273;
    pub const PT_CORRUPTION: u32 = 274;

    /// Causes reported even when the device context sets DTF.
    pub fn exempt_from_dtf(cause: u32) -> bool {
        matches!(cause, 256..=260 | 268 | 272)
    }
}

/// Capabilities register bits.
pub mod caps {
    pub const VERSION_1_0: u64 = 0x10;
    pub const SV32: u64 = 1 << 8;
    pub const SV39: u64 = 1 << 9;
    pub const SV48: u64 = 1 << 10;
    pub const SV57: u64 = 1 << 11;
    pub const SV32X4: u64 = 1 << 16;
    pub const SV39X4: u64 = 1 << 17;
    pub const SV48X4: u64 = 1 << 18;
    pub const SV57X4: u64 = 1 << 19;
    pub const MSI_FLAT: u64 = 1 << 22;
    pub const MSI_MRIF: u64 = 1 << 23;
    pub const AMO_HWAD: u64 = 1 << 24;
    pub const ATS: u64 = 1 << 25;
    pub const T2GPA: u64 = 1 << 26;
    pub const PD8: u64 = 1 << 38;
    pub const PD17: u64 = 1 << 39;
    pub const PD20: u64 = 1 << 40;
}

// Register offsets within the page region.
mod offset {
    pub const CAPABILITIES: u64 = 0x0;
    pub const FCTL: u64 = 0x8;
    pub const DDTP: u64 = 0x10;
    pub const CQB: u64 = 0x18;
    pub const CQH: u64 = 0x20;
    pub const CQT: u64 = 0x24;
    pub const FQB: u64 = 0x28;
    pub const FQH: u64 = 0x30;
    pub const FQT: u64 = 0x34;
    pub const PQB: u64 = 0x38;
    pub const PQH: u64 = 0x40;
    pub const PQT: u64 = 0x44;
    pub const CQCSR: u64 = 0x48;
    pub const FQCSR: u64 = 0x4C;
    pub const PQCSR: u64 = 0x50;
    pub const IPSR: u64 = 0x54;
    pub const ICVEC: u64 = 0x2F8;
    pub const MSI_CFG_TBL: u64 = 0x300;
    pub const MSI_CFG_TBL_END: u64 = 0x500;
}

// Queue CSR bits: enable 0, interrupt-enable 1, overflow 8, memory-fault 9, command-illegal
// 10 (command queue), on 16, busy 17.
const QCSR_ENABLE: u32 = 1 << 0;
const QCSR_IE: u32 = 1 << 1;
const QCSR_OVERFLOW: u32 = 1 << 8;
const QCSR_MEM_FAULT: u32 = 1 << 9;
const CQCSR_CMD_ILL: u32 = 1 << 10;
const QCSR_ON: u32 = 1 << 16;

// IPSR bits.
const IPSR_CIP: u32 = 1 << 0;
const IPSR_FIP: u32 = 1 << 1;
const IPSR_PMIP: u32 = 1 << 2;
const IPSR_PIP: u32 = 1 << 3;

/// A fault-queue record before serialization.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct FaultRecord {
    pub cause: u32,
    pub ttyp: Ttype,
    pub did: u32,
    pub pv: bool,
    pub pid: u32,
    pub priv_s: bool,
    pub iotval: u64,
    pub iotval2: u64,
}

/// Result of a successful MSI translation.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum MsiResult {
    /// Basic translate mode: an ordinary physical address.
    Basic { pa: u64 },
    /// MRIF mode: the interrupt file address plus notice PPN and interrupt id for the
    /// asynchronous notice write.
    Mrif { mrif_addr: u64, notice_ppn: u64, nid: u32 },
}

/// ATS completion per PCIe: either a translation or UR/CA status.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct AtsResponse {
    pub success: bool,
    pub is_completer_abort: bool,
    pub translated_addr: u64,
    pub read_perm: bool,
    pub write_perm: bool,
    pub exec_perm: bool,
    pub priv_mode: bool,
    pub no_snoop: bool,
    pub cxl_io: bool,
    pub global: bool,
    pub ama: u32,
    pub untranslated_only: bool,
}

#[derive(Debug, Clone, Copy, Default)]
struct MsiVector {
    addr: u64,
    data: u32,
    control: u32,
}

#[derive(Debug, Clone, Default)]
struct PendingAtsInvalidation {
    dev_id: u32,
    iova: u64,
}

type WireInterruptHook = Box<dyn Fn(u32) + Send>;

/// The IOMMU model. Its own tables live in the shared physical [`Memory`].
pub struct Iommu {
    base_addr: u64,
    size: u64,
    memory: Arc<Memory>,

    capabilities: u64,
    fctl: u32,
    ddtp: u64,
    cqb: u64,
    cqh: u32,
    cqt: u32,
    fqb: u64,
    fqh: u32,
    fqt: u32,
    pqb: u64,
    pqh: u32,
    pqt: u32,
    cqcsr: u32,
    fqcsr: u32,
    pqcsr: u32,
    ipsr: u32,
    icvec: u64,
    msi_cfg: [MsiVector; 32],

    pending_ats_invalidations: Vec<PendingAtsInvalidation>,
    wire_interrupt_hook: Option<WireInterruptHook>,
}

impl std::fmt::Debug for Iommu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Iommu")
            .field("base_addr", &self.base_addr)
            .field("ddtp", &self.ddtp)
            .finish_non_exhaustive()
    }
}

impl Iommu {
    /// Create an IOMMU with memory-mapped registers at `[base_addr, base_addr + size)` and
    /// the given capabilities.
    pub fn new(base_addr: u64, size: u64, memory: Arc<Memory>, capabilities: u64) -> Self {
        Self {
            base_addr,
            size,
            memory,
            capabilities: caps::VERSION_1_0 | capabilities,
            fctl: 0,
            ddtp: 0,
            cqb: 0,
            cqh: 0,
            cqt: 0,
            fqb: 0,
            fqh: 0,
            fqt: 0,
            pqb: 0,
            pqh: 0,
            pqt: 0,
            cqcsr: 0,
            fqcsr: 0,
            pqcsr: 0,
            ipsr: 0,
            icvec: 0,
            msi_cfg: [MsiVector::default(); 32],
            pending_ats_invalidations: Vec::new(),
            wire_interrupt_hook: None,
        }
    }

    pub fn capabilities(&self) -> u64 {
        self.capabilities
    }

    pub fn contains_addr(&self, addr: u64) -> bool {
        addr >= self.base_addr && addr < self.base_addr + self.size
    }

    /// Platform hook for wire interrupts (used when FCTL.WSI is set). The argument is the
    /// ICVEC vector number.
    pub fn set_wire_interrupt_hook(&mut self, hook: WireInterruptHook) {
        self.wire_interrupt_hook = Some(hook);
    }

    //
    // Register access: naturally aligned, 4 or 8 bytes, no crossing register boundaries.
    //

    pub fn read_reg(&self, addr: u64, size: u32) -> Option<u64> {
        if !self.contains_addr(addr) || !matches!(size, 4 | 8) || addr % size as u64 != 0 {
            return None;
        }
        let offset = addr - self.base_addr;
        // 8-byte registers can be read as either half; 4-byte registers only whole.
        let (reg_offset, value, reg_size) = self.reg_at(offset & !7)?;
        let shift = (offset - reg_offset) * 8;
        if reg_size == 4 {
            let (reg_offset, value, _) = self.reg_at(offset & !3)?;
            if size != 4 || reg_offset != offset {
                return None;
            }
            return Some(value & 0xFFFF_FFFF);
        }
        if size == 8 {
            (offset == reg_offset).then_some(value)
        } else {
            Some((value >> shift) & 0xFFFF_FFFF)
        }
    }

    // Map an aligned offset to (register offset, current value, register size).
    fn reg_at(&self, offset: u64) -> Option<(u64, u64, u32)> {
        use offset::*;
        Some(match offset {
            CAPABILITIES => (CAPABILITIES, self.capabilities, 8),
            FCTL => (FCTL, self.fctl as u64, 4),
            DDTP => (DDTP, self.ddtp, 8),
            CQB => (CQB, self.cqb, 8),
            CQH => (CQH, self.cqh as u64, 4),
            CQT => (CQT, self.cqt as u64, 4),
            FQB => (FQB, self.fqb, 8),
            FQH => (FQH, self.fqh as u64, 4),
            FQT => (FQT, self.fqt as u64, 4),
            PQB => (PQB, self.pqb, 8),
            PQH => (PQH, self.pqh as u64, 4),
            PQT => (PQT, self.pqt as u64, 4),
            CQCSR => (CQCSR, self.cqcsr as u64, 4),
            FQCSR => (FQCSR, self.fqcsr as u64, 4),
            PQCSR => (PQCSR, self.pqcsr as u64, 4),
            IPSR => (IPSR, self.ipsr as u64, 4),
            ICVEC => (ICVEC, self.icvec, 8),
            o if (MSI_CFG_TBL..MSI_CFG_TBL_END).contains(&o) => {
                let entry = ((o - MSI_CFG_TBL) / 16) as usize;
                let vector = &self.msi_cfg[entry];
                match (o - MSI_CFG_TBL) % 16 {
                    0 => (o, vector.addr, 8),
                    8 => (o, vector.data as u64 | ((vector.control as u64) << 32), 8),
                    _ => return None,
                }
            }
            _ => return None,
        })
    }

    pub fn write_reg(&mut self, addr: u64, size: u32, value: u64) -> bool {
        if !self.contains_addr(addr) || !matches!(size, 4 | 8) || addr % size as u64 != 0 {
            return false;
        }
        let offset = addr - self.base_addr;
        use offset::*;
        match offset {
            CAPABILITIES => {} // read-only
            FCTL => self.fctl = value as u32 & 0b111,
            DDTP => self.ddtp = value & 0x0F_FFFF_FFFF_FFFF | (value & 0xF000_0000_0000_0000),
            CQB => self.cqb = value,
            CQH => self.cqh = value as u32,
            CQT => {
                self.cqt = value as u32;
                self.process_command_queue();
            }
            FQB => self.fqb = value,
            FQH => self.fqh = value as u32,
            FQT => self.fqt = value as u32,
            PQB => self.pqb = value,
            PQH => self.pqh = value as u32,
            PQT => self.pqt = value as u32,
            CQCSR => self.cqcsr = Self::qcsr_write(self.cqcsr, value as u32),
            FQCSR => self.fqcsr = Self::qcsr_write(self.fqcsr, value as u32),
            PQCSR => self.pqcsr = Self::qcsr_write(self.pqcsr, value as u32),
            IPSR => self.ipsr &= !(value as u32 & 0xF), // write-1-to-clear
            ICVEC => self.icvec = value & 0xFFFF,
            o if (MSI_CFG_TBL..MSI_CFG_TBL_END).contains(&o) => {
                let entry = ((o - MSI_CFG_TBL) / 16) as usize;
                let vector = &mut self.msi_cfg[entry];
                match (o - MSI_CFG_TBL) % 16 {
                    0 => vector.addr = value,
                    4 if size == 4 => vector.addr = (vector.addr & 0xFFFF_FFFF) | (value << 32),
                    8 if size == 8 => {
                        vector.data = value as u32;
                        vector.control = (value >> 32) as u32;
                    }
                    8 => vector.data = value as u32,
                    12 => vector.control = value as u32,
                    _ => return false,
                }
            }
            _ => return false,
        }
        trace!(offset, value; "IOMMU register write");
        true
    }

    // Writing enable turns the queue on (the model has no latency, so busy never reads 1);
    // the overflow/fault bits are write-1-to-clear.
    fn qcsr_write(old: u32, value: u32) -> u32 {
        let mut new = old & !(QCSR_ENABLE | QCSR_IE);
        new |= value & (QCSR_ENABLE | QCSR_IE);
        new &= !(value & (QCSR_OVERFLOW | QCSR_MEM_FAULT | CQCSR_CMD_ILL));
        if value & QCSR_ENABLE != 0 {
            new |= QCSR_ON;
        } else {
            new &= !QCSR_ON;
        }
        new
    }

    fn fctl_wsi(&self) -> bool {
        self.fctl & 0b10 != 0
    }

    fn fctl_be(&self) -> bool {
        self.fctl & 0b1 != 0
    }

    fn fctl_gxl(&self) -> bool {
        self.fctl & 0b100 != 0
    }

    fn ddtp_mode(&self) -> u8 {
        (self.ddtp >> 60) as u8 & 0xF
    }

    fn ddtp_ppn(&self) -> u64 {
        self.ddtp & 0xFF_FFFF_FFFF
    }

    /// Base format (32-byte device contexts) is in effect when the MSI-flat capability is
    /// absent.
    fn extended_format(&self) -> bool {
        self.capabilities & caps::MSI_FLAT != 0
    }

    //
    // Interrupt delivery.
    //

    fn raise_interrupt(&mut self, ipsr_bit: u32) {
        let already = self.ipsr & ipsr_bit != 0;
        self.ipsr |= ipsr_bit;
        if already {
            return;
        }
        let vector = match ipsr_bit {
            IPSR_CIP => self.icvec & 0xF,
            IPSR_FIP => (self.icvec >> 4) & 0xF,
            IPSR_PMIP => (self.icvec >> 8) & 0xF,
            _ => (self.icvec >> 12) & 0xF,
        } as u32;
        if self.fctl_wsi() {
            if let Some(hook) = &self.wire_interrupt_hook {
                hook(vector);
            }
        } else {
            let msi = self.msi_cfg[vector as usize & 0x1F];
            // Control bit 0 masks the vector.
            if msi.control & 1 == 0 {
                if self.memory.write(msi.addr, &msi.data.to_le_bytes()).is_err() {
                    debug!(addr = msi.addr; "IOMMU MSI write failed");
                }
            }
        }
    }

    pub fn ipsr(&self) -> u32 {
        self.ipsr
    }

    pub fn fqcsr(&self) -> u32 {
        self.fqcsr
    }

    pub fn cqcsr(&self) -> u32 {
        self.cqcsr
    }

    //
    // Fault queue.
    //

    fn report_fault(&mut self, record: FaultRecord, dtf: bool) {
        if dtf && !cause::exempt_from_dtf(record.cause) {
            trace!(cause = record.cause; "fault suppressed by DTF");
            return;
        }
        error!(
            cause = record.cause,
            did = record.did,
            iotval = record.iotval;
            "IOMMU fault"
        );
        if self.fqcsr & QCSR_ON == 0 {
            return;
        }
        let capacity = 1u64 << ((self.fqb & 0x1F) + 1);
        if (self.fqt as u64 + 1) % capacity == self.fqh as u64 {
            self.fqcsr |= QCSR_OVERFLOW;
            self.raise_interrupt(IPSR_FIP);
            return;
        }
        let base = (self.fqb >> 10 & 0xFF_FFFF_FFFF) << 12;
        let addr = base + self.fqt as u64 * 32;
        let w0 = record.cause as u64
            | ((record.pid as u64 & 0xF_FFFF) << 12)
            | ((record.pv as u64) << 32)
            | ((record.priv_s as u64) << 33)
            | (record.ttyp.code() << 34)
            | ((record.did as u64) << 40);
        // The FCTL.BE value at fault-write time decides the record's endianness.
        let be = self.fctl_be();
        let mut buf = [0u8; 32];
        for (ix, word) in [w0, record.iotval, record.iotval2, 0].iter().enumerate() {
            let bytes = if be {
                word.to_be_bytes()
            } else {
                word.to_le_bytes()
            };
            buf[ix * 8..(ix + 1) * 8].copy_from_slice(&bytes);
        }
        if self.memory.write(addr, &buf).is_err() {
            self.fqcsr |= QCSR_MEM_FAULT;
        } else {
            self.fqt = ((self.fqt as u64 + 1) % capacity) as u32;
        }
        self.raise_interrupt(IPSR_FIP);
    }

    fn fault_record(&self, req: &IommuRequest, fault_cause: u32, iotval2: u64) -> FaultRecord {
        FaultRecord {
            cause: fault_cause,
            ttyp: req.ttype,
            did: req.dev_id,
            pv: req.proc_id.is_some(),
            pid: req.proc_id.unwrap_or(0),
            priv_s: req.proc_id.is_some() && req.priv_mode == PrivilegeLevel::Supervisor,
            iotval: req.iova,
            iotval2,
        }
    }

    //
    // Translation.
    //

    /// Translate a device request to a physical address. On failure, the cause is returned
    /// and a fault record is queued (subject to DTF).
    pub fn translate(&mut self, req: &IommuRequest) -> Result<u64, u32> {
        match self.translate_inner(req) {
            Ok(TranslateOutcome::Spa(pa)) => Ok(pa),
            Ok(TranslateOutcome::Msi(MsiResult::Basic { pa })) => Ok(pa),
            Ok(TranslateOutcome::Msi(MsiResult::Mrif { mrif_addr, .. })) => Ok(mrif_addr),
            Err(fault) => {
                let record = self.fault_record(req, fault.cause, fault.iotval2);
                self.report_fault(record, fault.dtf);
                Err(fault.cause)
            }
        }
    }

    /// Translation with the raw MSI outcome exposed (for the MSI write path).
    pub fn translate_msi(&mut self, req: &IommuRequest) -> Result<TranslateOutcome, u32> {
        self.translate_inner(req).map_err(|fault| {
            let record = self.fault_record(req, fault.cause, fault.iotval2);
            self.report_fault(record, fault.dtf);
            fault.cause
        })
    }

    fn translate_inner(&mut self, req: &IommuRequest) -> Result<TranslateOutcome, Fault> {
        // Table walks from a previous request must not leak into this one.
        trace!(dev_id = req.dev_id, iova = req.iova; "IOMMU translate");

        match self.ddtp_mode() {
            0 => return Err(Fault::plain(cause::ALL_INBOUND_DISALLOWED)),
            1 => {
                // Bare: pass-through, but translated and ATS requests are disallowed.
                if req.is_translated() || req.is_ats() {
                    return Err(Fault::plain(cause::TRANS_TYPE_DISALLOWED));
                }
                return Ok(TranslateOutcome::Spa(req.iova));
            }
            2..=4 => {}
            _ => return Err(Fault::plain(cause::DDT_MISCONFIGURED)),
        }

        let dc = self.load_device_context(req.dev_id)?;
        let dtf = dc.dtf();
        let fail = |c: u32| Fault { cause: c, iotval2: 0, dtf };

        self.check_device_context(&dc).map_err(|c| fail(c))?;

        if (req.is_translated() || req.is_ats()) && !dc.en_ats() {
            return Err(fail(cause::TRANS_TYPE_DISALLOWED));
        }

        // Resolve the first-stage context.
        let (s_mode, s_ppn, sum) = if dc.t2gpa() && req.is_translated() {
            // The iova is already a GPA; stage 1 is skipped.
            (AtMode::Bare, 0, false)
        } else if dc.pdtv() {
            let proc_id = match req.proc_id {
                Some(id) => id,
                None if dc.dpe() => 0,
                None => return Err(fail(cause::TRANS_TYPE_DISALLOWED)),
            };
            let pc = self.load_process_context(&dc, proc_id, dtf)?;
            let fsc = tables::Fsc(pc.fsc());
            (
                fsc.at_mode(!self.fctl_gxl() && !dc.sxl())
                    .ok_or(fail(cause::PDT_MISCONFIGURED))?,
                fsc.ppn(),
                pc.sum(),
            )
        } else {
            if req.proc_id.is_some() {
                return Err(fail(cause::TRANS_TYPE_DISALLOWED));
            }
            let fsc = tables::Fsc(dc.fsc());
            (
                fsc.at_mode(!self.fctl_gxl() && !dc.sxl())
                    .ok_or(fail(cause::DDT_MISCONFIGURED))?,
                fsc.ppn(),
                false,
            )
        };

        let (g_mode, g_ppn) = (
            dc.iohgatp_mode(!self.fctl_gxl())
                .ok_or(fail(cause::DDT_MISCONFIGURED))?,
            dc.iohgatp_ppn(),
        );

        let cfg = WalkConfig {
            s_mode,
            s_ppn,
            g_mode,
            g_ppn,
            sum,
            mxr: false,
            adue: dc.sade(),
            g_adue: dc.gade(),
            pbmte: false,
            update: true,
        };
        let user = req.priv_mode == PrivilegeLevel::User || req.proc_id.is_none();
        let access = req.access_type();

        // Stage 1 (unless bare/T2GPA): produces a GPA.
        let walker = Walker::new(&self.memory, cfg.clone());
        let gpa = match walker.translate_stage1(req.iova, user, access) {
            Ok(t) => t.pa,
            Err(e) => return Err(self.map_walk_error(e, access, dtf)),
        };

        // MSI aperture check applies to the guest physical address.
        if dc.msiptp_mode() == 1 {
            let gfn = gpa >> 12;
            let mask = dc.msi_addr_mask();
            if gfn & !mask == dc.msi_addr_pattern() & !mask {
                return self
                    .msi_translate(&dc, gpa)
                    .map(TranslateOutcome::Msi)
                    .map_err(|c| fail(c));
            }
        }

        // T2GPA: the response carries the GPA; the G stage runs when the device re-issues
        // the translated request... except that a translated request entering here already
        // resolved stage 1, so fall through to stage 2.
        if dc.t2gpa() && !req.is_translated() && req.is_ats() {
            return Ok(TranslateOutcome::Spa(gpa));
        }

        // Stage 2.
        match walker.translate_guest(gpa, user, access, false, false) {
            Ok(t) => Ok(TranslateOutcome::Spa(t.pa)),
            Err(e) => Err(self.map_walk_error(e, access, dtf)),
        }
    }

    fn map_walk_error(&self, err: WalkError, access: AccessType, dtf: bool) -> Fault {
        let cause = match (&err, access) {
            (WalkError::PageFault, AccessType::Read) => 13,
            (WalkError::PageFault, AccessType::Write) => 15,
            (WalkError::PageFault, AccessType::Execute) => 12,
            (WalkError::GuestPageFault { .. }, AccessType::Read) => 21,
            (WalkError::GuestPageFault { .. }, AccessType::Write) => 23,
            (WalkError::GuestPageFault { .. }, AccessType::Execute) => 20,
            (WalkError::AccessFault, AccessType::Read) => 5,
            (WalkError::AccessFault, AccessType::Write) => 7,
            (WalkError::AccessFault, AccessType::Execute) => 1,
        };
        let iotval2 = match err {
            WalkError::GuestPageFault {
                gpa,
                implicit,
                implicit_write,
            } => ((gpa >> 2) << 2) | u64::from(implicit && implicit_write),
            _ => 0,
        };
        Fault {
            cause,
            iotval2,
            dtf,
        }
    }

    //
    // Device directory walk.
    //

    fn load_device_context(&mut self, dev_id: u32) -> Result<DeviceContext, Fault> {
        let extended = self.extended_format();
        let levels = self.ddtp_mode() - 1; // 1, 2, or 3
        let split = tables::ddi_split(dev_id, extended);
        // The device id must fit the number of levels in use.
        let width = tables::ddi_width(extended, levels);
        if dev_id as u64 >= 1u64 << width {
            return Err(Fault::plain(cause::TRANS_TYPE_DISALLOWED));
        }
        let mut ppn = self.ddtp_ppn();
        for level in (1..levels).rev() {
            let addr = (ppn << 12) + split[level as usize] * 8;
            let mut buf = [0u8; 8];
            self.memory
                .read(addr, &mut buf)
                .map_err(|_| Fault::plain(cause::DDT_LOAD_FAULT))?;
            let dte = u64::from_le_bytes(buf);
            if dte & 1 == 0 {
                return Err(Fault::plain(cause::DDT_INVALID));
            }
            // Reserved bits must be zero in non-leaf entries.
            if dte & !0x003F_FFFF_FFFF_FC01 != 0 {
                return Err(Fault::plain(cause::DDT_MISCONFIGURED));
            }
            ppn = (dte >> 10) & 0xFF_FFFF_FFFF;
        }
        let dc_size = if extended { 64 } else { 32 };
        let addr = (ppn << 12) + split[0] * dc_size;
        let mut buf = [0u8; 64];
        self.memory
            .read(addr, &mut buf[..dc_size as usize])
            .map_err(|_| Fault::plain(cause::DDT_LOAD_FAULT))?;
        let dc = DeviceContext::from_bytes(&buf, extended);
        if !dc.valid() {
            return Err(Fault::plain(cause::DDT_INVALID));
        }
        Ok(dc)
    }

    fn check_device_context(&self, dc: &DeviceContext) -> Result<(), u32> {
        let caps = self.capabilities;
        if dc.reserved_bits_set() {
            return Err(cause::DDT_MISCONFIGURED);
        }
        if (dc.en_ats() || dc.t2gpa() || dc.en_pri()) && caps & caps::ATS == 0 {
            return Err(cause::DDT_MISCONFIGURED);
        }
        if dc.en_pri() && !dc.en_ats() {
            return Err(cause::DDT_MISCONFIGURED);
        }
        if dc.t2gpa() && (!dc.en_ats() || caps & caps::T2GPA == 0) {
            return Err(cause::DDT_MISCONFIGURED);
        }
        if dc.t2gpa() && dc.iohgatp_raw_mode() == 0 {
            return Err(cause::DDT_MISCONFIGURED);
        }
        // Supported iohgatp mode for the current GXL.
        let g_supported = match (self.fctl_gxl(), dc.iohgatp_raw_mode()) {
            (_, 0) => true,
            (true, 8) => caps & caps::SV32X4 != 0,
            (false, 8) => caps & caps::SV39X4 != 0,
            (false, 9) => caps & caps::SV48X4 != 0,
            (false, 10) => caps & caps::SV57X4 != 0,
            _ => false,
        };
        if !g_supported {
            return Err(cause::DDT_MISCONFIGURED);
        }
        if dc.msiptp_mode() > 1 {
            return Err(cause::DDT_MISCONFIGURED);
        }
        if dc.msiptp_mode() == 1 && !self.extended_format() {
            return Err(cause::DDT_MISCONFIGURED);
        }
        if (dc.gade() || dc.sade()) && caps & caps::AMO_HWAD == 0 {
            return Err(cause::DDT_MISCONFIGURED);
        }
        if dc.pdtv() {
            let pdt_supported = match tables::Fsc(dc.fsc()).raw_mode() {
                0 => true,
                1 => caps & caps::PD8 != 0,
                2 => caps & caps::PD17 != 0,
                3 => caps & caps::PD20 != 0,
                _ => false,
            };
            if !pdt_supported {
                return Err(cause::DDT_MISCONFIGURED);
            }
        }
        if dc.sbe() != self.fctl_be() {
            return Err(cause::DDT_MISCONFIGURED);
        }
        Ok(())
    }

    //
    // Process directory walk.
    //

    fn load_process_context(
        &mut self,
        dc: &DeviceContext,
        proc_id: u32,
        dtf: bool,
    ) -> Result<ProcessContext, Fault> {
        let fail = |c: u32| Fault {
            cause: c,
            iotval2: 0,
            dtf,
        };
        let fsc = tables::Fsc(dc.fsc());
        let levels = match fsc.raw_mode() {
            1 => 1, // PD8
            2 => 2, // PD17
            3 => 3, // PD20
            _ => return Err(fail(cause::PDT_MISCONFIGURED)),
        };
        let width = [8, 17, 20][levels - 1];
        if proc_id as u64 >= 1u64 << width {
            return Err(fail(cause::TRANS_TYPE_DISALLOWED));
        }
        let split = tables::pdi_split(proc_id);
        let mut ppn = fsc.ppn();
        for level in (1..levels).rev() {
            let addr = (ppn << 12) + split[level] * 8;
            let mut buf = [0u8; 8];
            self.memory
                .read(addr, &mut buf)
                .map_err(|_| fail(cause::PDT_LOAD_FAULT))?;
            let pdte = u64::from_le_bytes(buf);
            if pdte & 1 == 0 {
                return Err(fail(cause::PDT_INVALID));
            }
            ppn = (pdte >> 10) & 0xFF_FFFF_FFFF;
        }
        let addr = (ppn << 12) + split[0] * 16;
        let mut buf = [0u8; 16];
        self.memory
            .read(addr, &mut buf)
            .map_err(|_| fail(cause::PDT_LOAD_FAULT))?;
        let pc = ProcessContext::from_bytes(&buf);
        if !pc.valid() {
            return Err(fail(cause::PDT_INVALID));
        }
        if pc.reserved_bits_set() {
            return Err(fail(cause::PDT_MISCONFIGURED));
        }
        Ok(pc)
    }

    //
    // MSI translation.
    //

    fn msi_translate(&self, dc: &DeviceContext, gpa: u64) -> Result<MsiResult, u32> {
        let index = extract_bits(gpa >> 12, dc.msi_addr_mask());
        let pte_addr = (dc.msiptp_ppn() << 12) | (index << 4);
        let mut buf = [0u8; 16];
        self.memory
            .read(pte_addr, &mut buf)
            .map_err(|_| cause::MSI_PTE_LOAD_FAULT)?;
        let w0 = u64::from_le_bytes(buf[..8].try_into().unwrap());
        let w1 = u64::from_le_bytes(buf[8..].try_into().unwrap());
        if w0 & 1 == 0 {
            return Err(cause::MSI_PTE_INVALID);
        }
        let mode = (w0 >> 1) & 0b11;
        match mode {
            0b11 => {
                // Basic translate.
                let ppn = (w0 >> 10) & 0xFF_FFFF_FFFF;
                Ok(MsiResult::Basic {
                    pa: (ppn << 12) | (gpa & 0xFFF),
                })
            }
            0b01 => {
                if self.capabilities & caps::MSI_MRIF == 0 {
                    return Err(cause::MSI_PTE_MISCONFIGURED);
                }
                let mrif_addr = ((w0 >> 7) & 0x7FFF_FFFF_FFFF) << 9;
                let notice_ppn = (w1 >> 10) & 0xFF_FFFF_FFFF;
                let nid = (w1 & 0x3FF) as u32 | (((w1 >> 60) & 1) as u32) << 10;
                Ok(MsiResult::Mrif {
                    mrif_addr,
                    notice_ppn,
                    nid,
                })
            }
            _ => Err(cause::MSI_PTE_MISCONFIGURED),
        }
    }

    //
    // Device-facing memory access (the bridge surface).
    //

    /// Translate and read on behalf of a device.
    pub fn read_for_device(&mut self, req: &IommuRequest) -> Result<u64, u32> {
        let pa = self.translate(req)?;
        let mut buf = [0u8; 8];
        self.memory
            .read(pa, &mut buf[..req.size as usize])
            .map_err(|_| 5u32)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Translate and write on behalf of a device.
    pub fn write_for_device(&mut self, req: &IommuRequest, data: u64) -> Result<(), u32> {
        let pa = self.translate(req)?;
        self.memory
            .write(pa, &data.to_le_bytes()[..req.size as usize])
            .map_err(|_| 7u32)?;
        Ok(())
    }

    //
    // ATS.
    //

    /// Handle a PCIe ATS translation request.
    pub fn ats_translate(&mut self, req: &IommuRequest) -> AtsResponse {
        let mut response = AtsResponse::default();
        match self.translate_inner(req) {
            Ok(TranslateOutcome::Spa(pa)) => {
                response.success = true;
                response.translated_addr = pa;
                response.read_perm = true;
                response.write_perm = !req.is_read() || req.is_write();
                response.exec_perm = req.is_exec();
                response.priv_mode = req.priv_mode == PrivilegeLevel::Supervisor;
            }
            Ok(TranslateOutcome::Msi(MsiResult::Basic { pa })) => {
                response.success = true;
                response.translated_addr = pa;
                response.read_perm = true;
                response.write_perm = true;
            }
            Ok(TranslateOutcome::Msi(MsiResult::Mrif { .. })) => {
                // MRIF-mode MSI addresses must stay untranslated at the device.
                response.success = true;
                response.untranslated_only = true;
            }
            Err(fault) => {
                let record = self.fault_record(req, fault.cause, fault.iotval2);
                match fault.cause {
                    // Device-context misconfiguration: completer abort.
                    cause::DDT_MISCONFIGURED | cause::PDT_MISCONFIGURED => {
                        self.report_fault(record, fault.dtf);
                        response.is_completer_abort = true;
                    }
                    // Page faults: success with no permissions.
                    12 | 13 | 15 | 20 | 21 | 23 => {
                        response.success = true;
                        response.read_perm = false;
                        response.write_perm = false;
                    }
                    // Permanent disallowed conditions: unsupported request.
                    _ => {
                        self.report_fault(record, fault.dtf);
                    }
                }
            }
        }
        response
    }

    /// Track an outstanding ATS invalidation issued by an ATS.INVAL command.
    pub fn pending_ats_invalidations(&self) -> usize {
        self.pending_ats_invalidations.len()
    }

    /// A device completed an ATS invalidation.
    pub fn complete_ats_invalidation(&mut self, dev_id: u32) {
        self.pending_ats_invalidations.retain(|p| p.dev_id != dev_id);
    }

    //
    // Command queue.
    //

    /// Process pending commands. Called when the tail register is written and from the
    /// run loop.
    pub fn process_command_queue(&mut self) {
        if self.cqcsr & QCSR_ON == 0 {
            return;
        }
        let capacity = 1u64 << ((self.cqb & 0x1F) + 1);
        let base = (self.cqb >> 10 & 0xFF_FFFF_FFFF) << 12;
        while self.cqh != self.cqt {
            let addr = base + self.cqh as u64 * 16;
            let mut buf = [0u8; 16];
            if self.memory.read(addr, &mut buf).is_err() {
                self.cqcsr |= QCSR_MEM_FAULT;
                self.raise_interrupt(IPSR_CIP);
                return;
            }
            let dword0 = u64::from_le_bytes(buf[..8].try_into().unwrap());
            let dword1 = u64::from_le_bytes(buf[8..].try_into().unwrap());
            if !self.execute_command(dword0, dword1) {
                self.cqcsr |= CQCSR_CMD_ILL;
                self.raise_interrupt(IPSR_CIP);
                return;
            }
            self.cqh = ((self.cqh as u64 + 1) % capacity) as u32;
        }
    }

    // Returns false on a malformed command.
    fn execute_command(&mut self, dword0: u64, dword1: u64) -> bool {
        let opcode = dword0 & 0x7F;
        let func3 = (dword0 >> 7) & 0x7;
        match (opcode, func3) {
            // IOTINVAL.VMA / IOTINVAL.GVMA: no translation cache is modeled, so these
            // validate and complete.
            (1, 0) | (1, 1) => true,
            // IOFENCE.C: optionally write DATA to ADDR and raise the completion interrupt.
            (2, 0) => {
                let av = dword0 >> 10 & 1 == 1;
                let wsi = dword0 >> 11 & 1 == 1;
                if av {
                    let data = (dword0 >> 32) as u32;
                    let addr = dword1 << 2;
                    if self.memory.write(addr, &data.to_le_bytes()).is_err() {
                        self.cqcsr |= QCSR_MEM_FAULT;
                    }
                }
                if wsi {
                    self.raise_interrupt(IPSR_CIP);
                }
                true
            }
            // IODIR.INVAL_DDT / INVAL_PDT: directory caches are not modeled.
            (3, 0) | (3, 1) => true,
            // ATS.INVAL: track the invalidation until the device completes it.
            (4, 0) => {
                let dev_id = ((dword0 >> 40) & 0xFF_FFFF) as u32;
                self.pending_ats_invalidations.push(PendingAtsInvalidation {
                    dev_id,
                    iova: dword1 << 2,
                });
                true
            }
            // ATS.PRGR: page-request group response; surfaces to the device model.
            (4, 1) => true,
            _ => {
                debug!(opcode, func3; "malformed IOMMU command");
                false
            }
        }
    }

    //
    // Page-request queue (device side).
    //

    /// A device posts a PCIe page request.
    pub fn page_request(&mut self, dev_id: u32, proc_id: Option<u32>, payload: u64) {
        if self.pqcsr & QCSR_ON == 0 {
            return;
        }
        let capacity = 1u64 << ((self.pqb & 0x1F) + 1);
        if (self.pqt as u64 + 1) % capacity == self.pqh as u64 {
            self.pqcsr |= QCSR_OVERFLOW;
            self.raise_interrupt(IPSR_PIP);
            return;
        }
        let base = (self.pqb >> 10 & 0xFF_FFFF_FFFF) << 12;
        let addr = base + self.pqt as u64 * 16;
        let w0 = (dev_id as u64) << 40
            | (proc_id.is_some() as u64) << 32
            | (proc_id.unwrap_or(0) as u64 & 0xF_FFFF) << 12;
        let mut buf = [0u8; 16];
        buf[..8].copy_from_slice(&w0.to_le_bytes());
        buf[8..].copy_from_slice(&payload.to_le_bytes());
        if self.memory.write(addr, &buf).is_err() {
            self.pqcsr |= QCSR_MEM_FAULT;
        } else {
            self.pqt = ((self.pqt as u64 + 1) % capacity) as u32;
        }
        self.raise_interrupt(IPSR_PIP);
    }
}

/// A translation outcome: an ordinary SPA or an MSI-translated result.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum TranslateOutcome {
    Spa(u64),
    Msi(MsiResult),
}

// Internal fault descriptor carried up the pipeline.
#[derive(Debug, Clone)]
struct Fault {
    cause: u32,
    iotval2: u64,
    dtf: bool,
}

impl Fault {
    fn plain(cause: u32) -> Self {
        Self {
            cause,
            iotval2: 0,
            dtf: false,
        }
    }
}

fn extract_bits(value: u64, mask: u64) -> u64 {
    let mut result = 0u64;
    let mut out_ix = 0;
    for bit in 0..64 {
        if mask >> bit & 1 == 1 {
            result |= ((value >> bit) & 1) << out_ix;
            out_ix += 1;
        }
    }
    result
}
