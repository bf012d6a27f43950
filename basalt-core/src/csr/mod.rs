//! The typed CSR bank.
//!
//! Every CSR is described by (number, reset value, write mask, poke mask, read mask, flags)
//! plus ordered callback chains. CSR-instruction writes apply the write mask; `poke` applies
//! the poke mask, which lets hardware-only bits (e.g. MIP.MEIP) be modifiable while remaining
//! unreachable by CSR writes. Aliased registers (SSTATUS over MSTATUS, HIE over MIE) share a
//! backing slot in a value arena and differ only in their masks. Under V=1, supervisor
//! registers transparently redirect to their VS counterparts.

pub mod numbers;
pub mod status;

pub use numbers::CsrNumber;

use crate::{PrivilegeLevel, Xlen};
use log::trace;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use thiserror::Error;

/// Ways a CSR access can fail. The hart turns each of these into an illegal-instruction trap
/// without mutating state.
#[derive(Error, Debug, Clone, Copy, Eq, PartialEq)]
pub enum CsrError {
    /// The number does not name a defined CSR.
    #[error("no such CSR")]
    NoSuchCsr,
    /// The CSR is defined but not implemented in this configuration.
    #[error("CSR not implemented")]
    NotImplemented,
    /// Privilege, virtualization state, read-only-ness, or debug mode forbids the access.
    #[error("CSR not accessible")]
    NotAccessible,
}

pub type CsrResult<T> = Result<T, CsrError>;

#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct CsrFlags {
    /// Required by the privileged spec for this configuration.
    pub mandatory: bool,
    /// Defined and backed; an unimplemented CSR reports [`CsrError::NotImplemented`].
    pub implemented: bool,
    /// Part of the hypervisor extension (H or VS bank).
    pub hypervisor: bool,
    /// Supervisor register that redirects to a VS counterpart while V=1.
    pub maps_to_virtual: bool,
    /// RV32 upper half of a 64-bit semantic register.
    pub high_half: bool,
    /// Accessible in debug mode only.
    pub debug: bool,
    /// One backing value shared by all harts.
    pub shared: bool,
}

impl CsrFlags {
    fn standard() -> Self {
        Self {
            mandatory: true,
            implemented: true,
            ..Self::default()
        }
    }

    fn hyp() -> Self {
        Self {
            hypervisor: true,
            implemented: true,
            ..Self::default()
        }
    }
}

/// A single CSR definition. The value lives in the file's arena so aliases can share it.
#[derive(Debug, Clone)]
pub struct Csr {
    number: CsrNumber,
    name: &'static str,
    reset: u64,
    write_mask: u64,
    poke_mask: u64,
    read_mask: u64,
    flags: CsrFlags,
    value_ix: usize,
    /// `false` for aliases; only primary definitions reset their slot.
    primary: bool,
}

impl Csr {
    pub fn number(&self) -> CsrNumber {
        self.number
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn flags(&self) -> CsrFlags {
        self.flags
    }

    pub fn write_mask(&self) -> u64 {
        self.write_mask
    }
}

type LegalizeFn<X> = Box<dyn FnMut(&CsrFile<X>, u64) -> u64 + Send>;
type NotifyFn<X> = Box<dyn FnMut(&mut CsrFile<X>, u64) + Send>;

struct Callbacks<X: Xlen> {
    pre_write: Vec<LegalizeFn<X>>,
    post_write: Vec<NotifyFn<X>>,
    pre_poke: Vec<LegalizeFn<X>>,
    post_poke: Vec<NotifyFn<X>>,
    post_reset: Vec<NotifyFn<X>>,
}

impl<X: Xlen> Default for Callbacks<X> {
    fn default() -> Self {
        Self {
            pre_write: Vec::new(),
            post_write: Vec::new(),
            pre_poke: Vec::new(),
            post_poke: Vec::new(),
            post_reset: Vec::new(),
        }
    }
}

#[derive(Copy, Clone)]
enum Chain {
    PostWrite,
    PostPoke,
    PostReset,
}

/// Configuration switches for a CSR file.
#[derive(Debug, Clone)]
pub struct CsrConfig {
    pub enable_hypervisor: bool,
    pub enable_aia: bool,
    pub enable_fp: bool,
    /// MHPMEVENT values above this clamp to 0 (count nothing).
    pub max_event_id: u64,
}

impl Default for CsrConfig {
    fn default() -> Self {
        Self {
            enable_hypervisor: true,
            enable_aia: true,
            enable_fp: true,
            max_event_id: 1 << 14,
        }
    }
}

/// The CSR bank of one hart.
pub struct CsrFile<X: Xlen> {
    csrs: Vec<Option<Csr>>,
    values: Vec<u64>,
    callbacks: HashMap<CsrNumber, Callbacks<X>>,
    config: CsrConfig,
    hart_id: u64,
    /// In debug mode, debug-flagged CSRs become accessible.
    debug_mode: bool,
    /// SIE bits writable independently of MIE where MVIEN is set and MIDELEG clear (AIA).
    shadow_sie: u64,
    _xlen: PhantomData<X>,
}

impl<X: Xlen> fmt::Debug for CsrFile<X> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CsrFile")
            .field("hart_id", &self.hart_id)
            .field("debug_mode", &self.debug_mode)
            .finish_non_exhaustive()
    }
}

// MISA extension bits.
const MISA_A: u64 = 1 << 0;
const MISA_D: u64 = 1 << 3;
const MISA_F: u64 = 1 << 5;
const MISA_H: u64 = 1 << 7;
const MISA_I: u64 = 1 << 8;
const MISA_M: u64 = 1 << 12;
const MISA_S: u64 = 1 << 18;
const MISA_U: u64 = 1 << 20;

/// mstatus bits reachable by CSR writes.
const MSTATUS_WRITE_MASK: u64 = 0x0000_00F0_007E_7FEA;
/// The sstatus projection of mstatus.
const SSTATUS_MASK: u64 = 0x0000_0003_000C_6762;
/// Interrupt bits 0..=13 (through LCOF).
const IP_ALL: u64 = 0x3FFF;
/// mie bits writable by CSR writes.
const MIE_WRITE_MASK: u64 = 0x3AAA;
/// mip bits writable by CSR writes (SSIP, VSSIP, STIP, SEIP).
const MIP_WRITE_MASK: u64 = 0x0226;
/// The VS interrupt bits as they appear in hie/hip/hideleg.
const HS_IP_MASK: u64 = 0x1444;
/// The VS interrupt bits writable through hvip.
const HVIP_WRITE_MASK: u64 = 0x0444;

impl<X: Xlen> CsrFile<X> {
    pub fn new(hart_id: u64, config: CsrConfig) -> Self {
        let mut file = Self {
            csrs: vec![None; 1 << 12],
            values: Vec::new(),
            callbacks: HashMap::new(),
            config,
            hart_id,
            debug_mode: false,
            shadow_sie: 0,
            _xlen: PhantomData,
        };
        file.define_all();
        file.reset();
        file
    }

    pub fn config(&self) -> &CsrConfig {
        &self.config
    }

    fn misa_value(&self) -> u64 {
        let mxl: u64 = if X::is_rv64() { 2 } else { 1 };
        let mut value = (mxl << (X::BITS - 2)) | MISA_A | MISA_I | MISA_M | MISA_S | MISA_U;
        if self.config.enable_hypervisor {
            value |= MISA_H;
        }
        if self.config.enable_fp {
            value |= MISA_F | MISA_D;
        }
        value
    }

    //
    // Definition helpers.
    //

    fn define(&mut self, number: CsrNumber, name: &'static str, reset: u64, write_mask: u64) {
        self.define_full(
            number,
            name,
            reset,
            write_mask,
            write_mask,
            u64::MAX,
            CsrFlags::standard(),
        );
    }

    fn define_full(
        &mut self,
        number: CsrNumber,
        name: &'static str,
        reset: u64,
        write_mask: u64,
        poke_mask: u64,
        read_mask: u64,
        flags: CsrFlags,
    ) {
        let value_ix = self.values.len();
        self.values.push(reset);
        self.csrs[number as usize] = Some(Csr {
            number,
            name,
            reset,
            write_mask,
            poke_mask,
            read_mask,
            flags,
            value_ix,
            primary: true,
        });
    }

    // On RV32, CSR writes only ever touch the low half of the 64-bit semantic value; the
    // upper half is reached through the *H partner register.
    fn narrow(mask: u64, high_half: bool) -> u64 {
        if X::is_rv64() || high_half {
            mask
        } else {
            mask & 0xFFFF_FFFF
        }
    }

    /// Define `number` as an alias of `target` with its own masks.
    fn alias(
        &mut self,
        number: CsrNumber,
        name: &'static str,
        target: CsrNumber,
        write_mask: u64,
        read_mask: u64,
        flags: CsrFlags,
    ) {
        let target = self.csrs[target as usize]
            .as_ref()
            .expect("alias target must be defined first");
        let value_ix = target.value_ix;
        let reset = target.reset;
        self.csrs[number as usize] = Some(Csr {
            number,
            name,
            reset,
            write_mask,
            poke_mask: write_mask,
            read_mask,
            flags,
            value_ix,
            primary: false,
        });
    }

    /// Define the RV32-only upper half of `partner`.
    fn define_high_half(&mut self, number: CsrNumber, name: &'static str, partner: CsrNumber) {
        if X::is_rv64() {
            return;
        }
        let target = self.csrs[partner as usize]
            .as_ref()
            .expect("high-half partner must be defined first");
        let value_ix = target.value_ix;
        let reset = target.reset;
        let partner_flags = target.flags;
        // The partner carries the full 64-bit semantic masks; this register projects their
        // upper words.
        let write_mask = target.write_mask >> 32;
        let poke_mask = target.poke_mask >> 32;
        self.csrs[number as usize] = Some(Csr {
            number,
            name,
            reset,
            write_mask,
            poke_mask,
            read_mask: 0xFFFF_FFFF,
            flags: CsrFlags {
                high_half: true,
                ..partner_flags
            },
            value_ix,
            primary: false,
        });
    }

    fn define_all(&mut self) {
        use numbers::*;

        let mstatus_reset = if X::is_rv64() { 0xA_0000_0000 } else { 0 };

        //
        // Machine info registers (read-only).
        //
        self.define(MVENDORID, "mvendorid", 0, 0);
        self.define(MARCHID, "marchid", 0, 0);
        self.define(MIMPID, "mimpid", 0, 0);
        self.define(MHARTID, "mhartid", self.hart_id, 0);
        self.define(MCONFIGPTR, "mconfigptr", 0, 0);

        //
        // Machine trap setup.
        //
        self.define_full(
            MSTATUS,
            "mstatus",
            mstatus_reset,
            MSTATUS_WRITE_MASK,
            u64::MAX,
            u64::MAX,
            CsrFlags::standard(),
        );
        self.define_high_half(MSTATUSH, "mstatush", MSTATUS);
        self.define(MISA, "misa", self.misa_value(), 0);
        self.define(MEDELEG, "medeleg", 0, 0xF0B7FF);
        self.define(MIDELEG, "mideleg", 0, IP_ALL);
        self.define_full(
            MIE,
            "mie",
            0,
            MIE_WRITE_MASK,
            IP_ALL,
            u64::MAX,
            CsrFlags::standard(),
        );
        self.define(MTVEC, "mtvec", 0, !0b10);
        self.define(MCOUNTEREN, "mcounteren", 0, 0xFFFF_FFFF);
        self.define(MENVCFG, "menvcfg", 0, 0xF000_0000_0000_00F1);
        self.define_high_half(MENVCFGH, "menvcfgh", MENVCFG);
        self.define(MCOUNTINHIBIT, "mcountinhibit", 0, 0xFFFF_FFFD);
        for ix in 0..29u16 {
            self.define(MHPMEVENT3 + ix, "mhpmevent", 0, u64::MAX);
        }

        //
        // Machine trap handling.
        //
        self.define(MSCRATCH, "mscratch", 0, u64::MAX);
        self.define(MEPC, "mepc", 0, !0b1);
        self.define(MCAUSE, "mcause", 0, u64::MAX);
        self.define(MTVAL, "mtval", 0, u64::MAX);
        self.define_full(
            MIP,
            "mip",
            0,
            MIP_WRITE_MASK,
            IP_ALL,
            u64::MAX,
            CsrFlags::standard(),
        );
        self.define(MTINST, "mtinst", 0, u64::MAX);
        self.define(MTVAL2, "mtval2", 0, u64::MAX);

        //
        // Resumable NMI.
        //
        self.define(MNSCRATCH, "mnscratch", 0, u64::MAX);
        self.define(MNEPC, "mnepc", 0, !0b1);
        self.define(MNCAUSE, "mncause", 0, 0);
        self.define_full(
            MNSTATUS,
            "mnstatus",
            0,
            0x1888,
            0x1888,
            u64::MAX,
            CsrFlags::standard(),
        );

        //
        // Machine memory protection.
        //
        for ix in 0..16u16 {
            // Odd pmpcfg registers exist on RV32 only.
            if X::is_rv64() && ix % 2 == 1 {
                continue;
            }
            self.define(PMPCFG0 + ix, "pmpcfg", 0, u64::MAX);
        }
        for ix in 0..64u16 {
            self.define(PMPADDR0 + ix, "pmpaddr", 0, u64::MAX);
        }

        //
        // Machine counters.
        //
        self.define_full(
            MCYCLE,
            "mcycle",
            0,
            u64::MAX,
            u64::MAX,
            u64::MAX,
            CsrFlags::standard(),
        );
        self.define(MINSTRET, "minstret", 0, u64::MAX);
        for ix in 0..29u16 {
            self.define(MHPMCOUNTER3 + ix, "mhpmcounter", 0, u64::MAX);
        }
        self.define_high_half(MCYCLEH, "mcycleh", MCYCLE);
        self.define_high_half(MINSTRETH, "minstreth", MINSTRET);
        for ix in 0..29u16 {
            self.define_high_half(MHPMCOUNTER3H + ix, "mhpmcounterh", MHPMCOUNTER3 + ix);
        }

        //
        // Unprivileged counter shadows (read-only projections of the machine counters) and
        // the memory-mapped time sample.
        //
        self.alias(CYCLE, "cycle", MCYCLE, 0, u64::MAX, CsrFlags::standard());
        self.alias(INSTRET, "instret", MINSTRET, 0, u64::MAX, CsrFlags::standard());
        self.define_full(TIME, "time", 0, 0, u64::MAX, u64::MAX, CsrFlags::standard());
        for ix in 0..29u16 {
            self.alias(
                HPMCOUNTER3 + ix,
                "hpmcounter",
                MHPMCOUNTER3 + ix,
                0,
                u64::MAX,
                CsrFlags::standard(),
            );
        }
        if !X::is_rv64() {
            self.alias(CYCLEH, "cycleh", MCYCLE, 0, u64::MAX, CsrFlags::standard());
            self.alias(INSTRETH, "instreth", MINSTRET, 0, u64::MAX, CsrFlags::standard());
            self.alias(TIMEH, "timeh", TIME, 0, u64::MAX, CsrFlags::standard());
            for csr in [CYCLEH, INSTRETH, TIMEH] {
                if let Some(csr) = self.csrs[csr as usize].as_mut() {
                    csr.flags.high_half = true;
                }
            }
            for ix in 0..29u16 {
                self.alias(
                    HPMCOUNTER3H + ix,
                    "hpmcounterh",
                    MHPMCOUNTER3 + ix,
                    0,
                    u64::MAX,
                    CsrFlags {
                        high_half: true,
                        ..CsrFlags::standard()
                    },
                );
            }
        }

        //
        // Floating point.
        //
        if self.config.enable_fp {
            self.define(FCSR, "fcsr", 0, 0xFF);
            self.alias(FFLAGS, "fflags", FCSR, 0x1F, 0x1F, CsrFlags::standard());
            // frm sits at bits 7:5 of fcsr; reads/writes are shifted in the access path.
            self.alias(FRM, "frm", FCSR, 0xE0, 0xE0, CsrFlags::standard());
        }

        //
        // Supervisor bank. sstatus/sie/sip are projections of their machine counterparts.
        //
        self.alias(
            SSTATUS,
            "sstatus",
            MSTATUS,
            SSTATUS_MASK,
            SSTATUS_MASK,
            CsrFlags {
                maps_to_virtual: true,
                ..CsrFlags::standard()
            },
        );
        self.alias(
            SIE,
            "sie",
            MIE,
            IP_ALL,
            IP_ALL,
            CsrFlags {
                maps_to_virtual: true,
                ..CsrFlags::standard()
            },
        );
        self.alias(
            SIP,
            "sip",
            MIP,
            0x2,
            IP_ALL,
            CsrFlags {
                maps_to_virtual: true,
                ..CsrFlags::standard()
            },
        );
        let s_flags = CsrFlags {
            maps_to_virtual: true,
            ..CsrFlags::standard()
        };
        self.define_full(STVEC, "stvec", 0, !0b10, !0b10, u64::MAX, s_flags);
        self.define(SCOUNTEREN, "scounteren", 0, 0xFFFF_FFFF);
        self.define(SENVCFG, "senvcfg", 0, 0xF1);
        self.define_full(SSCRATCH, "sscratch", 0, u64::MAX, u64::MAX, u64::MAX, s_flags);
        self.define_full(SEPC, "sepc", 0, !0b1, !0b1, u64::MAX, s_flags);
        self.define_full(SCAUSE, "scause", 0, u64::MAX, u64::MAX, u64::MAX, s_flags);
        self.define_full(STVAL, "stval", 0, u64::MAX, u64::MAX, u64::MAX, s_flags);
        self.define_full(SATP, "satp", 0, u64::MAX, u64::MAX, u64::MAX, s_flags);
        self.define_full(
            STIMECMP,
            "stimecmp",
            u64::MAX,
            u64::MAX,
            u64::MAX,
            u64::MAX,
            s_flags,
        );
        self.define_high_half(STIMECMPH, "stimecmph", STIMECMP);

        //
        // Hypervisor and VS banks.
        //
        if self.config.enable_hypervisor {
            self.define_full(
                HSTATUS,
                "hstatus",
                if X::is_rv64() { 2 << 32 } else { 0 },
                0x30_03E0,
                u64::MAX,
                u64::MAX,
                CsrFlags::hyp(),
            );
            self.define_full(HEDELEG, "hedeleg", 0, 0xB1FF, 0xB1FF, u64::MAX, CsrFlags::hyp());
            self.define_full(
                HIDELEG,
                "hideleg",
                0,
                HS_IP_MASK,
                HS_IP_MASK,
                u64::MAX,
                CsrFlags::hyp(),
            );
            self.alias(HIE, "hie", MIE, HS_IP_MASK, HS_IP_MASK, CsrFlags::hyp());
            self.define_full(
                HCOUNTEREN,
                "hcounteren",
                0,
                0xFFFF_FFFF,
                0xFFFF_FFFF,
                u64::MAX,
                CsrFlags::hyp(),
            );
            self.define_full(HGEIE, "hgeie", 0, !0b1, !0b1, u64::MAX, CsrFlags::hyp());
            self.define_full(HTVAL, "htval", 0, u64::MAX, u64::MAX, u64::MAX, CsrFlags::hyp());
            self.alias(HIP, "hip", MIP, 0x4, HS_IP_MASK, CsrFlags::hyp());
            // vsie/vsip have no storage of their own: reads and writes are remapped onto the
            // hie/hip bits through hideleg in the access path.
            self.define_full(VSIE, "vsie", 0, IP_ALL, 0, u64::MAX, CsrFlags::hyp());
            self.define_full(VSIP, "vsip", 0, IP_ALL, 0, u64::MAX, CsrFlags::hyp());
            self.define_full(
                HVIP,
                "hvip",
                0,
                HVIP_WRITE_MASK,
                HVIP_WRITE_MASK,
                u64::MAX,
                CsrFlags::hyp(),
            );
            self.define_full(HTINST, "htinst", 0, u64::MAX, u64::MAX, u64::MAX, CsrFlags::hyp());
            self.define_full(
                HGEIP,
                "hgeip",
                0,
                0,
                !0b1,
                u64::MAX,
                CsrFlags::hyp(),
            );
            self.define_full(HENVCFG, "henvcfg", 0, 0xF000_0000_0000_00F1, u64::MAX, u64::MAX, CsrFlags::hyp());
            self.define_high_half(HENVCFGH, "henvcfgh", HENVCFG);
            self.define_full(HGATP, "hgatp", 0, u64::MAX, u64::MAX, u64::MAX, CsrFlags::hyp());
            self.define_full(
                HTIMEDELTA,
                "htimedelta",
                0,
                u64::MAX,
                u64::MAX,
                u64::MAX,
                CsrFlags::hyp(),
            );
            self.define_high_half(HTIMEDELTAH, "htimedeltah", HTIMEDELTA);

            self.define_full(
                VSSTATUS,
                "vsstatus",
                if X::is_rv64() { 2 << 32 } else { 0 },
                SSTATUS_MASK,
                u64::MAX,
                u64::MAX,
                CsrFlags::hyp(),
            );
            self.define_full(VSTVEC, "vstvec", 0, !0b10, !0b10, u64::MAX, CsrFlags::hyp());
            self.define_full(
                VSSCRATCH,
                "vsscratch",
                0,
                u64::MAX,
                u64::MAX,
                u64::MAX,
                CsrFlags::hyp(),
            );
            self.define_full(VSEPC, "vsepc", 0, !0b1, !0b1, u64::MAX, CsrFlags::hyp());
            self.define_full(VSCAUSE, "vscause", 0, u64::MAX, u64::MAX, u64::MAX, CsrFlags::hyp());
            self.define_full(VSTVAL, "vstval", 0, u64::MAX, u64::MAX, u64::MAX, CsrFlags::hyp());
            self.define_full(VSATP, "vsatp", 0, u64::MAX, u64::MAX, u64::MAX, CsrFlags::hyp());
            self.define_full(
                VSTIMECMP,
                "vstimecmp",
                u64::MAX,
                u64::MAX,
                u64::MAX,
                u64::MAX,
                CsrFlags::hyp(),
            );
            self.define_high_half(VSTIMECMPH, "vstimecmph", VSTIMECMP);
        }

        //
        // AIA: indirect-access windows, top-interrupt registers, and virtual-interrupt
        // controls. The *topei registers are backed by the IMSIC through the poke path.
        //
        if self.config.enable_aia {
            self.define(MISELECT, "miselect", 0, 0x1FF);
            self.define(MIREG, "mireg", 0, u64::MAX);
            self.define_full(MTOPEI, "mtopei", 0, u64::MAX, u64::MAX, u64::MAX, CsrFlags::standard());
            self.define_full(MTOPI, "mtopi", 0, 0, u64::MAX, u64::MAX, CsrFlags::standard());
            self.define(MVIEN, "mvien", 0, 0x2AAA);
            self.define(MVIP, "mvip", 0, 0x2AAA);
            self.define_full(SISELECT, "siselect", 0, 0x1FF, 0x1FF, u64::MAX, s_flags);
            self.define_full(SIREG, "sireg", 0, u64::MAX, u64::MAX, u64::MAX, s_flags);
            self.define_full(STOPEI, "stopei", 0, u64::MAX, u64::MAX, u64::MAX, s_flags);
            self.define_full(STOPI, "stopi", 0, 0, u64::MAX, u64::MAX, s_flags);
            if self.config.enable_hypervisor {
                self.define_full(HVIEN, "hvien", 0, !0x1FFF, !0x1FFF, u64::MAX, CsrFlags::hyp());
                self.define_full(VSISELECT, "vsiselect", 0, 0x1FF, 0x1FF, u64::MAX, CsrFlags::hyp());
                self.define_full(VSIREG, "vsireg", 0, u64::MAX, u64::MAX, u64::MAX, CsrFlags::hyp());
                self.define_full(VSTOPEI, "vstopei", 0, u64::MAX, u64::MAX, u64::MAX, CsrFlags::hyp());
                self.define_full(VSTOPI, "vstopi", 0, 0, u64::MAX, u64::MAX, CsrFlags::hyp());
            }
        }

        //
        // Debug-mode registers. tselect/tdata* are served by the trigger unit through the
        // hart's dispatch, not defined here.
        //
        let debug_flags = CsrFlags {
            debug: true,
            implemented: true,
            ..CsrFlags::default()
        };
        self.define_full(numbers::DCSR, "dcsr", 0x4000_0003, 0x8E04, u64::MAX, u64::MAX, debug_flags);
        self.define_full(numbers::DPC, "dpc", 0, !0b1, !0b1, u64::MAX, debug_flags);
        self.define_full(numbers::DSCRATCH0, "dscratch0", 0, u64::MAX, u64::MAX, u64::MAX, debug_flags);
        self.define_full(numbers::DSCRATCH1, "dscratch1", 0, u64::MAX, u64::MAX, u64::MAX, debug_flags);
    }

    //
    // Access paths.
    //

    /// Look up a definition.
    pub fn csr(&self, number: CsrNumber) -> Option<&Csr> {
        self.csrs.get(number as usize)?.as_ref()
    }

    /// The number actually accessed given the virtualization state: while V=1, supervisor
    /// registers redirect to their VS counterparts, and direct accesses to the hypervisor or
    /// VS banks are illegal.
    fn effective_number(&self, number: CsrNumber, virt: bool) -> CsrResult<CsrNumber> {
        if !virt {
            return Ok(number);
        }
        if let Some(vs) = numbers::virtual_counterpart(number) {
            if self.config.enable_hypervisor {
                return Ok(vs);
            }
        }
        if numbers::is_hypervisor(number) {
            return Err(CsrError::NotAccessible);
        }
        Ok(number)
    }

    // Resolve redirection and run all access checks. Returns the effective number to access.
    // The privilege requirement comes from the *nominal* number: a VS-mode guest reaching
    // sscratch lands on vsscratch without needing the hypervisor's level.
    fn checked(
        &self,
        number: CsrNumber,
        mode: PrivilegeLevel,
        virt: bool,
        write: bool,
    ) -> CsrResult<CsrNumber> {
        if !numbers::is_valid(number) {
            return Err(CsrError::NoSuchCsr);
        }
        let effective = self.effective_number(number, virt)?;
        let csr = self.csr(effective).ok_or(CsrError::NoSuchCsr)?;
        if !csr.flags.implemented {
            return Err(CsrError::NotImplemented);
        }
        if csr.flags.debug && !self.debug_mode {
            return Err(CsrError::NotAccessible);
        }
        // Debug mode executes with M privileges regardless of the saved mode.
        let mode = if self.debug_mode {
            PrivilegeLevel::Machine
        } else {
            mode
        };
        let required = numbers::required_privilege_level(number);
        if mode < required {
            return Err(CsrError::NotAccessible);
        }
        if write && numbers::is_read_only(number) {
            return Err(CsrError::NotAccessible);
        }
        Ok(effective)
    }

    /// Whether a CSR-read instruction would succeed from `(mode, virt)`.
    pub fn is_readable(&self, number: CsrNumber, mode: PrivilegeLevel, virt: bool) -> bool {
        self.checked(number, mode, virt, false).is_ok()
    }

    /// Whether a CSR-write instruction would succeed from `(mode, virt)`.
    pub fn is_writeable(&self, number: CsrNumber, mode: PrivilegeLevel, virt: bool) -> bool {
        self.checked(number, mode, virt, true).is_ok()
    }

    /// Read a CSR with full access checking.
    pub fn read(&self, number: CsrNumber, mode: PrivilegeLevel, virt: bool) -> CsrResult<u64> {
        let number = self.checked(number, mode, virt, false)?;
        Ok(self.read_effective(number, virt))
    }

    /// Write a CSR with full access checking. Fires the pre-write legalizers and post-write
    /// callbacks.
    pub fn write(
        &mut self,
        number: CsrNumber,
        mode: PrivilegeLevel,
        virt: bool,
        value: u64,
    ) -> CsrResult<()> {
        let number = self.checked(number, mode, virt, true)?;
        self.write_effective(number, value);
        Ok(())
    }

    // Read after redirection; handles the dynamic projections.
    fn read_effective(&self, number: CsrNumber, virt: bool) -> u64 {
        use numbers::*;
        match number {
            SIE => {
                (self.raw(MIE) & self.raw(MIDELEG))
                    | (self.shadow_sie & self.mvien_only_bits())
            }
            SIP => self.raw(MIP) & self.raw(MIDELEG),
            VSIE if self.config.enable_hypervisor => {
                vs_to_s(self.raw(MIE) & self.raw(HIDELEG))
            }
            VSIP if self.config.enable_hypervisor => {
                vs_to_s(self.raw(MIP) & self.raw(HIDELEG))
            }
            FFLAGS => self.raw(FCSR) & 0x1F,
            FRM => (self.raw(FCSR) >> 5) & 0x7,
            TIME if virt && self.config.enable_hypervisor => {
                X::truncate(self.raw(TIME).wrapping_add(self.raw(HTIMEDELTA)))
            }
            _ => {
                let csr = self.csr(number).expect("checked by caller");
                let value = self.values[csr.value_ix];
                if csr.flags.high_half {
                    (value >> 32) & csr.read_mask
                } else {
                    X::truncate(value & csr.read_mask)
                }
            }
        }
    }

    // Write after redirection; handles the dynamic projections.
    fn write_effective(&mut self, number: CsrNumber, value: u64) {
        use numbers::*;
        match number {
            SIE => {
                let mideleg = self.raw(MIDELEG);
                let mie = self.raw(MIE);
                self.store(MIE, (mie & !mideleg) | (value & mideleg));
                let shadow_mask = self.mvien_only_bits();
                self.shadow_sie = (self.shadow_sie & !shadow_mask) | (value & shadow_mask);
                self.fire_post_write(SIE, value);
            }
            SIP => {
                // Writes propagate to mip under mideleg, restricted to the software bit.
                let mask = self.raw(MIDELEG) & 0x2;
                let mip = self.raw(MIP);
                self.store(MIP, (mip & !mask) | (value & mask));
                self.fire_post_write(SIP, value);
            }
            VSIE => {
                let mask = self.raw(HIDELEG);
                let mie = self.raw(MIE);
                let mapped = s_to_vs(value) & mask;
                self.store(MIE, (mie & !mask) | mapped);
                self.fire_post_write(VSIE, value);
            }
            VSIP => {
                let mask = self.raw(HIDELEG) & 0x4;
                let mip = self.raw(MIP);
                self.store(MIP, (mip & !mask) | (s_to_vs(value) & mask));
                self.fire_post_write(VSIP, value);
            }
            FFLAGS => {
                let fcsr = self.raw(FCSR);
                self.store(FCSR, (fcsr & !0x1F) | (value & 0x1F));
                self.fire_post_write(FFLAGS, value);
            }
            FRM => {
                let fcsr = self.raw(FCSR);
                self.store(FCSR, (fcsr & !0xE0) | ((value & 0x7) << 5));
                self.fire_post_write(FRM, value);
            }
            _ => {
                let value = self.legalize(number, value, false);
                let csr = self.csr(number).expect("checked by caller");
                let high = csr.flags.high_half;
                let (value_ix, write_mask) = (csr.value_ix, Self::narrow(csr.write_mask, high));
                let old = self.values[value_ix];
                let new = if high {
                    let half = ((old >> 32) & !write_mask) | (value & write_mask);
                    (old & 0xFFFF_FFFF) | (half << 32)
                } else {
                    (old & !write_mask) | (value & write_mask)
                };
                self.values[value_ix] = new;
                trace!(number, new; "CSR write");
                self.fire_post_write(number, new);
            }
        }
    }

    /// Read the stored value through the read mask without access checks.
    pub fn peek(&self, number: CsrNumber) -> CsrResult<u64> {
        let csr = self.csr(number).ok_or(CsrError::NoSuchCsr)?;
        if !csr.flags.implemented {
            return Err(CsrError::NotImplemented);
        }
        Ok(self.read_effective(number, false))
    }

    /// Write the stored value through the poke mask, bypassing CSR access semantics. Fires
    /// the pre-poke legalizers and post-poke callbacks.
    pub fn poke(&mut self, number: CsrNumber, value: u64) -> CsrResult<()> {
        let csr = self.csr(number).ok_or(CsrError::NoSuchCsr)?;
        if !csr.flags.implemented {
            return Err(CsrError::NotImplemented);
        }
        let value = self.legalize(number, value, true);
        let csr = self.csr(number).expect("just checked");
        let high = csr.flags.high_half;
        let (value_ix, poke_mask) = (csr.value_ix, csr.poke_mask);
        let old = self.values[value_ix];
        let new = if high {
            let half = ((old >> 32) & !poke_mask) | (value & poke_mask);
            (old & 0xFFFF_FFFF) | (half << 32)
        } else {
            (old & !poke_mask) | (value & poke_mask)
        };
        self.values[value_ix] = new;
        self.fire(number, new, Chain::PostPoke);
        Ok(())
    }

    /// Raw stored value, unmasked. Internal surface for the hart and snapshots.
    pub fn raw(&self, number: CsrNumber) -> u64 {
        self.csr(number)
            .map(|csr| self.values[csr.value_ix])
            .unwrap_or(0)
    }

    /// Store a raw value without masks or callbacks. Internal surface for the hart (trap
    /// delivery) and snapshot restore.
    pub fn store(&mut self, number: CsrNumber, value: u64) {
        if let Some(csr) = self.csr(number) {
            let ix = csr.value_ix;
            self.values[ix] = value;
        }
    }

    /// Reset every primary CSR to its reset value, then fire the post-reset callbacks.
    pub fn reset(&mut self) {
        for ix in 0..self.csrs.len() {
            if let Some(csr) = &self.csrs[ix] {
                if csr.primary {
                    self.values[csr.value_ix] = csr.reset;
                }
            }
        }
        self.shadow_sie = 0;
        let mut numbers: Vec<CsrNumber> = self.callbacks.keys().copied().collect();
        numbers.sort_unstable();
        for number in numbers {
            let value = self.raw(number);
            self.fire(number, value, Chain::PostReset);
        }
    }

    //
    // Callback registration. Chains run in registration order.
    //

    pub fn on_write(&mut self, number: CsrNumber, f: impl FnMut(&mut Self, u64) + Send + 'static) {
        self.callbacks
            .entry(number)
            .or_default()
            .post_write
            .push(Box::new(f));
    }

    pub fn on_poke(&mut self, number: CsrNumber, f: impl FnMut(&mut Self, u64) + Send + 'static) {
        self.callbacks
            .entry(number)
            .or_default()
            .post_poke
            .push(Box::new(f));
    }

    pub fn on_reset(&mut self, number: CsrNumber, f: impl FnMut(&mut Self, u64) + Send + 'static) {
        self.callbacks
            .entry(number)
            .or_default()
            .post_reset
            .push(Box::new(f));
    }

    /// Register a pre-write legalizer: it sees the proposed value and returns the legal one.
    pub fn legalize_write(
        &mut self,
        number: CsrNumber,
        f: impl FnMut(&Self, u64) -> u64 + Send + 'static,
    ) {
        self.callbacks
            .entry(number)
            .or_default()
            .pre_write
            .push(Box::new(f));
    }

    /// Register a pre-poke legalizer.
    pub fn legalize_poke(
        &mut self,
        number: CsrNumber,
        f: impl FnMut(&Self, u64) -> u64 + Send + 'static,
    ) {
        self.callbacks
            .entry(number)
            .or_default()
            .pre_poke
            .push(Box::new(f));
    }

    fn legalize(&mut self, number: CsrNumber, value: u64, poke: bool) -> u64 {
        let Some(mut callbacks) = self.callbacks.remove(&number) else {
            return self.builtin_legalize(number, value);
        };
        let chain = if poke {
            &mut callbacks.pre_poke
        } else {
            &mut callbacks.pre_write
        };
        let mut value = value;
        for f in chain.iter_mut() {
            value = f(self, value);
        }
        self.callbacks.insert(number, callbacks);
        self.builtin_legalize(number, value)
    }

    fn builtin_legalize(&self, number: CsrNumber, value: u64) -> u64 {
        use numbers::*;
        match number {
            // Vectored is the highest defined tvec mode.
            MTVEC | STVEC | VSTVEC if value & 0b11 > 1 => value & !0b11,
            // Event ids outside the configured set count nothing.
            MHPMEVENT3..=MHPMEVENT31 if value & 0x00FF_FFFF_FFFF_FFFF > self.config.max_event_id => {
                value & !0x00FF_FFFF_FFFF_FFFF
            }
            _ => value,
        }
    }

    fn fire_post_write(&mut self, number: CsrNumber, value: u64) {
        self.fire(number, value, Chain::PostWrite);
    }

    fn fire(&mut self, number: CsrNumber, value: u64, chain: Chain) {
        let Some(mut callbacks) = self.callbacks.remove(&number) else {
            return;
        };
        let selected = match chain {
            Chain::PostWrite => &mut callbacks.post_write,
            Chain::PostPoke => &mut callbacks.post_poke,
            Chain::PostReset => &mut callbacks.post_reset,
        };
        for f in selected.iter_mut() {
            f(self, value);
        }
        // Callbacks may themselves have registered callbacks for this number; keep both.
        match self.callbacks.remove(&number) {
            None => {
                self.callbacks.insert(number, callbacks);
            }
            Some(mut added) => {
                callbacks.pre_write.append(&mut added.pre_write);
                callbacks.post_write.append(&mut added.post_write);
                callbacks.pre_poke.append(&mut added.pre_poke);
                callbacks.post_poke.append(&mut added.post_poke);
                callbacks.post_reset.append(&mut added.post_reset);
                self.callbacks.insert(number, callbacks);
            }
        }
    }

    //
    // Interrupt helpers.
    //

    fn mvien_only_bits(&self) -> u64 {
        if !self.config.enable_aia {
            return 0;
        }
        self.raw(numbers::MVIEN) & !self.raw(numbers::MIDELEG)
    }

    /// The effective interrupt-enable set: MIE, extended by the shadow SIE bits that MVIEN
    /// makes independently writable.
    pub fn effective_interrupt_enable(&self) -> u64 {
        self.raw(numbers::MIE) | (self.shadow_sie & self.mvien_only_bits())
    }

    /// Set or clear a bit of MIP through the poke path (hardware interrupt lines).
    pub fn set_mip_bit(&mut self, bit: u32, pending: bool) {
        let mip = self.raw(numbers::MIP);
        let new = if pending {
            mip | (1 << bit)
        } else {
            mip & !(1 << bit)
        };
        let _ = self.poke(numbers::MIP, new);
    }

    /// Enter or leave debug mode; debug-flagged CSRs are only accessible inside.
    pub fn set_debug_mode(&mut self, enabled: bool) {
        self.debug_mode = enabled;
    }

    pub fn debug_mode(&self) -> bool {
        self.debug_mode
    }

    /// Update the time sample visible through the TIME CSR.
    pub fn set_time(&mut self, time: u64) {
        self.store(numbers::TIME, time);
    }

    //
    // Snapshot surface.
    //

    /// Raw values of all primary CSRs, for snapshots.
    pub fn snapshot(&self) -> Vec<(CsrNumber, u64)> {
        self.csrs
            .iter()
            .flatten()
            .filter(|csr| csr.primary)
            .map(|csr| (csr.number, self.values[csr.value_ix]))
            .collect()
    }

    /// Restore raw values captured by [`snapshot`](Self::snapshot).
    pub fn restore(&mut self, values: &[(CsrNumber, u64)]) {
        for &(number, value) in values {
            self.store(number, value);
        }
    }
}

/// Map the VS interrupt bits (2, 6, 10) down to their S positions (1, 5, 9).
fn vs_to_s(bits: u64) -> u64 {
    (bits & HS_IP_MASK) >> 1
}

/// Map S interrupt positions (1, 5, 9) up to the VS bits (2, 6, 10).
fn s_to_vs(bits: u64) -> u64 {
    (bits << 1) & HS_IP_MASK
}
