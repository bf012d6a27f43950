//! Page-table walker for Sv32/Sv39/Sv48/Sv57 and their x4 G-stage variants.
//!
//! The walker is stateless: the hart (or the IOMMU's translation callbacks) constructs a
//! [`WalkConfig`] from its CSRs for every access. Under V=1 each load of a stage-1 page-table
//! entry is itself translated through the G-stage table; a guest-page fault on such an
//! implicit access is surfaced separately so the trap path can compose `htval`/`mtval2`.

use crate::memory::Memory;
use bitvec::{field::BitField, order::Lsb0, slice::BitSlice, view::BitView};
use log::{debug, trace};
use thiserror::Error;

/// log2 of the page size.
const PAGE_SHIFT: u32 = 12;

/// The kind of memory access being translated.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AccessType {
    Read,
    Write,
    Execute,
}

impl std::fmt::Display for AccessType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            AccessType::Read => "read",
            AccessType::Write => "write",
            AccessType::Execute => "execute",
        })
    }
}

/// An address-translation scheme. The `..x4` variants are the G-stage schemes with a 4-times
/// larger root table.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub enum AtMode {
    #[default]
    Bare,
    Sv32,
    Sv39,
    Sv48,
    Sv57,
    Sv32x4,
    Sv39x4,
    Sv48x4,
    Sv57x4,
}

impl AtMode {
    /// Decode a `satp`/`vsatp` MODE field value.
    pub fn from_satp(mode: u8, rv64: bool) -> Option<Self> {
        Some(match (mode, rv64) {
            (0, _) => Self::Bare,
            (1, false) => Self::Sv32,
            (8, true) => Self::Sv39,
            (9, true) => Self::Sv48,
            (10, true) => Self::Sv57,
            _ => return None,
        })
    }

    /// Decode an `hgatp` MODE field value.
    pub fn from_hgatp(mode: u8, rv64: bool) -> Option<Self> {
        Some(match (mode, rv64) {
            (0, _) => Self::Bare,
            (1, false) => Self::Sv32x4,
            (8, true) => Self::Sv39x4,
            (9, true) => Self::Sv48x4,
            (10, true) => Self::Sv57x4,
            _ => return None,
        })
    }

    fn levels(self) -> u32 {
        match self {
            Self::Bare => 0,
            Self::Sv32 | Self::Sv32x4 => 2,
            Self::Sv39 | Self::Sv39x4 => 3,
            Self::Sv48 | Self::Sv48x4 => 4,
            Self::Sv57 | Self::Sv57x4 => 5,
        }
    }

    fn vpn_bits(self) -> u32 {
        match self {
            Self::Sv32 | Self::Sv32x4 => 10,
            _ => 9,
        }
    }

    fn pte_size(self) -> u32 {
        match self {
            Self::Sv32 | Self::Sv32x4 => 4,
            _ => 8,
        }
    }

    /// Extra root-index bits of the x4 G-stage variants (the guest physical address is 2 bits
    /// wider than the virtual address of the matching VS scheme).
    fn root_extra_bits(self) -> u32 {
        match self {
            Self::Sv32x4 | Self::Sv39x4 | Self::Sv48x4 | Self::Sv57x4 => 2,
            _ => 0,
        }
    }

    fn is_gstage(self) -> bool {
        self.root_extra_bits() != 0
    }

    /// Number of meaningful address bits; higher bits must be a sign extension of the top
    /// one (or zero for G-stage schemes).
    fn va_bits(self) -> u32 {
        match self {
            Self::Bare => 64,
            _ => PAGE_SHIFT + self.levels() * self.vpn_bits() + self.root_extra_bits(),
        }
    }
}

/// Everything the walker needs from the CSR file, sampled at access time.
#[derive(Debug, Clone, Default)]
pub struct WalkConfig {
    /// Stage-1 scheme (satp, or vsatp while V=1).
    pub s_mode: AtMode,
    /// Stage-1 root PPN.
    pub s_ppn: u64,
    /// G-stage scheme (hgatp); [`AtMode::Bare`] when V=0.
    pub g_mode: AtMode,
    /// G-stage root PPN.
    pub g_ppn: u64,
    /// MSTATUS.SUM (or VSSTATUS.SUM while V=1).
    pub sum: bool,
    /// MSTATUS.MXR (or the OR with VSSTATUS.MXR while V=1).
    pub mxr: bool,
    /// Hardware A/D updates permitted for stage 1 (MENVCFG/HENVCFG ADUE).
    pub adue: bool,
    /// Hardware A/D updates permitted for the G stage (HENVCFG.HADUE).
    pub g_adue: bool,
    /// Svpbmt enabled (ENVCFG.PBMTE).
    pub pbmte: bool,
    /// When `false` the walk neither sets A/D bits nor faults on their absence being
    /// un-updatable; used by the performance model's speculative walks.
    pub update: bool,
}

/// A successful translation.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Translation {
    pub pa: u64,
    /// Page-based memory type override from the leaf PTE (0 = PMA, 1 = NC, 2 = IO).
    pub pbmt: u8,
}

/// Translation failures, carrying enough context for trap composition.
#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum WalkError {
    /// Stage-1 (or single-stage) page fault.
    #[error("page fault")]
    PageFault,
    /// G-stage fault. `gpa` is the faulting guest physical address; `implicit` is set when
    /// the faulting access was the walker's own PTE fetch, and `implicit_write` when that
    /// fetch was performed with write intent (A/D update).
    #[error("guest page fault at GPA {gpa:#x}")]
    GuestPageFault {
        gpa: u64,
        implicit: bool,
        implicit_write: bool,
    },
    /// The walk touched inaccessible physical memory.
    #[error("access fault during walk")]
    AccessFault,
}

pub type WalkResult = Result<Translation, WalkError>;

mod pte {
    use super::*;

    pub const V: usize = 0;
    pub const R: usize = 1;
    pub const W: usize = 2;
    pub const X: usize = 3;
    pub const U: usize = 4;
    pub const A: usize = 6;
    pub const D: usize = 7;

    pub fn ppn(entry: &BitSlice<u64, Lsb0>) -> u64 {
        entry[10..54].load_le()
    }

    pub fn pbmt(entry: &BitSlice<u64, Lsb0>) -> u8 {
        entry[61..63].load_le()
    }
}

/// A borrowed view combining the physical memory with a sampled [`WalkConfig`].
#[derive(Debug)]
pub struct Walker<'m> {
    mem: &'m Memory,
    cfg: WalkConfig,
}

impl<'m> Walker<'m> {
    pub fn new(mem: &'m Memory, cfg: WalkConfig) -> Self {
        Self { mem, cfg }
    }

    /// Translate `va` for a `user`-or-supervisor access of type `access`.
    ///
    /// The caller has already resolved the effective privilege level; M-mode accesses bypass
    /// translation entirely and never reach this function. `user` selects the U/S permission
    /// check.
    pub fn translate(&self, va: u64, user: bool, access: AccessType) -> WalkResult {
        trace!(va, user, access:%; "translating");
        match self.cfg.s_mode {
            AtMode::Bare => {
                // With stage 1 bare, the VA is already a GPA; it may still need the G stage.
                self.translate_guest(va, user, access, false, false)
            }
            mode => {
                let translation = self.walk_stage1(mode, va, user, access)?;
                Ok(translation)
            }
        }
    }

    /// Run only the stage-1 walk, returning the guest physical address. PTE fetches are
    /// still translated through the G stage. With stage 1 bare this is the identity.
    pub fn translate_stage1(&self, va: u64, user: bool, access: AccessType) -> WalkResult {
        match self.cfg.s_mode {
            AtMode::Bare => Ok(Translation { pa: va, pbmt: 0 }),
            mode => self.walk(mode, self.cfg.s_ppn, va, user, access, self.cfg.adue, false),
        }
    }

    /// Translate a guest physical address through the G stage only.
    ///
    /// `implicit` marks the walker's own stage-1 PTE fetches; `implicit_write` marks those
    /// done with write intent (A/D updates). G-stage permission checks are made as user-level
    /// accesses, per the hypervisor spec.
    pub fn translate_guest(
        &self,
        gpa: u64,
        _user: bool,
        access: AccessType,
        implicit: bool,
        implicit_write: bool,
    ) -> WalkResult {
        match self.cfg.g_mode {
            AtMode::Bare => Ok(Translation { pa: gpa, pbmt: 0 }),
            mode => self
                .walk(
                    mode,
                    self.cfg.g_ppn,
                    gpa,
                    true,
                    access,
                    self.cfg.g_adue,
                    true,
                )
                .map_err(|err| match err {
                    WalkError::PageFault => WalkError::GuestPageFault {
                        gpa,
                        implicit,
                        implicit_write,
                    },
                    other => other,
                }),
        }
    }

    // Stage-1 walk; every PTE fetch goes through the G stage.
    fn walk_stage1(&self, mode: AtMode, va: u64, user: bool, access: AccessType) -> WalkResult {
        let gpa_translation = self.walk(mode, self.cfg.s_ppn, va, user, access, self.cfg.adue, false)?;
        let guest = self.translate_guest(gpa_translation.pa, user, access, false, false)?;
        Ok(Translation {
            pa: guest.pa,
            // The innermost non-PMA override wins.
            pbmt: if gpa_translation.pbmt != 0 {
                gpa_translation.pbmt
            } else {
                guest.pbmt
            },
        })
    }

    // The standard multi-level walk. For a stage-1 walk under V=1, PTE fetches are routed
    // through the G stage (gstage = false selects that routing).
    #[allow(clippy::too_many_arguments)]
    fn walk(
        &self,
        mode: AtMode,
        root_ppn: u64,
        va: u64,
        user: bool,
        access: AccessType,
        adue: bool,
        gstage: bool,
    ) -> WalkResult {
        let levels = mode.levels();
        let vpn_bits = mode.vpn_bits();
        let pte_size = mode.pte_size();

        // Address-width check: Sv39 and wider require the excess bits to sign-extend bit
        // va_bits-1; the G-stage schemes (and Sv32) require them to be zero.
        let va_bits = mode.va_bits();
        if va_bits < 64 {
            let upper = va >> va_bits;
            let canonical = if gstage || matches!(mode, AtMode::Sv32) {
                upper == 0
            } else if (va >> (va_bits - 1)) & 1 == 0 {
                upper == 0
            } else {
                upper == u64::MAX >> va_bits
            };
            if !canonical {
                return Err(WalkError::PageFault);
            }
        }

        let mut table = root_ppn << PAGE_SHIFT;
        for level in (0..levels).rev() {
            let index_bits = if level == levels - 1 {
                vpn_bits + mode.root_extra_bits()
            } else {
                vpn_bits
            };
            let index =
                (va >> (PAGE_SHIFT + level * vpn_bits)) & ((1u64 << index_bits) - 1);
            let entry_gpa = table + index * pte_size as u64;
            // Stage-1 entries live in guest physical memory while V=1.
            let entry_pa = if gstage {
                entry_gpa
            } else {
                self.translate_guest(entry_gpa, user, AccessType::Read, true, false)?
                    .pa
            };
            let mut entry = self.read_pte(entry_pa, pte_size)?;
            let bits = entry.view_bits_mut::<Lsb0>();

            if !bits[pte::V] || (!bits[pte::R] && bits[pte::W]) {
                return Err(WalkError::PageFault);
            }
            if !bits[pte::R] && !bits[pte::X] {
                // Pointer to the next level; at the last level this is a fault.
                if level == 0 {
                    return Err(WalkError::PageFault);
                }
                if self.cfg.pbmte && pte::pbmt(bits) != 0 {
                    return Err(WalkError::PageFault);
                }
                table = pte::ppn(bits) << PAGE_SHIFT;
                continue;
            }

            // Leaf: permission checks.
            let pbmt = if self.cfg.pbmte { pte::pbmt(bits) } else { 0 };
            if !self.cfg.pbmte && pte::pbmt(bits) != 0 {
                return Err(WalkError::PageFault);
            }
            let perm = match access {
                AccessType::Read => bits[pte::R] || (self.cfg.mxr && bits[pte::X]),
                AccessType::Write => bits[pte::W],
                AccessType::Execute => bits[pte::X],
            };
            // G-stage PTEs must be user PTEs; the access itself is treated as user-level.
            let priv_ok = if gstage {
                bits[pte::U]
            } else if user {
                bits[pte::U]
            } else {
                !bits[pte::U] || (self.cfg.sum && access != AccessType::Execute)
            };
            if !perm || !priv_ok {
                return Err(WalkError::PageFault);
            }

            // Superpage alignment.
            let ppn = pte::ppn(bits);
            let low_mask = (1u64 << (level * vpn_bits)) - 1;
            if level != 0 && ppn & low_mask != 0 {
                return Err(WalkError::PageFault);
            }

            // A/D update by compare-and-swap; CAS failure falls back to page fault.
            if self.cfg.update && (!bits[pte::A] || (access == AccessType::Write && !bits[pte::D]))
            {
                if !adue {
                    return Err(WalkError::PageFault);
                }
                let old = {
                    let raw: u64 = bits.load_le();
                    raw
                };
                bits.set(pte::A, true);
                if access == AccessType::Write {
                    bits.set(pte::D, true);
                }
                let new: u64 = bits.load_le();
                let entry_pa = if gstage {
                    entry_gpa
                } else {
                    // The A/D update is an implicit write to the guest page table.
                    self.translate_guest(entry_gpa, user, AccessType::Write, true, true)?
                        .pa
                };
                let swapped = self
                    .mem
                    .compare_and_swap(entry_pa, pte_size, old, new)
                    .map_err(|_| WalkError::AccessFault)?;
                if !swapped {
                    debug!(entry_pa; "A/D update lost the CAS race");
                    return Err(WalkError::PageFault);
                }
            }

            let vpn_low = (va >> PAGE_SHIFT) & low_mask;
            let page_offset = va & ((1 << PAGE_SHIFT) - 1);
            return Ok(Translation {
                pa: ((ppn | vpn_low) << PAGE_SHIFT) + page_offset,
                pbmt,
            });
        }
        // Bare was dispatched by the callers; levels is always > 0 here.
        unreachable!()
    }

    fn read_pte(&self, pa: u64, size: u32) -> Result<u64, WalkError> {
        let mut buf = [0u8; 8];
        self.mem
            .read(pa, &mut buf[..size as usize])
            .map_err(|_| WalkError::AccessFault)?;
        Ok(u64::from_le_bytes(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PTE_V: u64 = 1 << 0;
    const PTE_R: u64 = 1 << 1;
    const PTE_W: u64 = 1 << 2;
    const PTE_X: u64 = 1 << 3;
    const PTE_U: u64 = 1 << 4;
    const PTE_A: u64 = 1 << 6;
    const PTE_D: u64 = 1 << 7;

    fn memory() -> Memory {
        Memory::new(1 << 32, 1, 64)
    }

    fn write_pte(mem: &Memory, addr: u64, ppn: u64, flags: u64) {
        mem.write(addr, &((ppn << 10) | flags).to_le_bytes()).unwrap();
    }

    fn sv39_config(root_ppn: u64) -> WalkConfig {
        WalkConfig {
            s_mode: AtMode::Sv39,
            s_ppn: root_ppn,
            adue: true,
            update: true,
            ..WalkConfig::default()
        }
    }

    /// Map VA 0x10_0000_0000? No: build a two-level Sv39 mapping of VA 0x0000_1000_0000 to
    /// PA 0x1000 and check the walk plus hardware A/D updates.
    #[test]
    fn test_sv39_walk_with_ad_update() {
        let mem = memory();
        let va: u64 = 0x0000_1000_0000;
        // vpn2 = 0, vpn1 = 0x80, vpn0 = 0.
        let root = 0x10_000u64; // page address of root table (ppn 0x10)
        let l1 = 0x11_000u64;
        let l0 = 0x12_000u64;
        write_pte(&mem, root + 0 * 8, l1 >> 12, PTE_V);
        write_pte(&mem, l1 + 0x80 * 8, l0 >> 12, PTE_V);
        // Leaf with A=D=0.
        write_pte(&mem, l0 + 0 * 8, 0x1, PTE_V | PTE_R | PTE_W);

        let walker = Walker::new(&mem, sv39_config(root >> 12));
        let translation = walker.translate(va, false, AccessType::Write).unwrap();
        assert_eq!(translation.pa, 0x1000);

        // The PTE was atomically updated to A=1, D=1, no trap.
        let mut buf = [0u8; 8];
        mem.read(l0, &mut buf).unwrap();
        let entry = u64::from_le_bytes(buf);
        assert_eq!(entry & (PTE_A | PTE_D), PTE_A | PTE_D);
    }

    #[test]
    fn test_sv39_ad_update_suppressed_without_adue() {
        let mem = memory();
        let root = 0x10_000u64;
        let l1 = 0x11_000u64;
        let l0 = 0x12_000u64;
        write_pte(&mem, root, l1 >> 12, PTE_V);
        write_pte(&mem, l1 + 0x80 * 8, l0 >> 12, PTE_V);
        write_pte(&mem, l0, 0x1, PTE_V | PTE_R | PTE_W);
        let mut cfg = sv39_config(root >> 12);
        cfg.adue = false;
        let walker = Walker::new(&mem, cfg);
        assert_eq!(
            walker.translate(0x0000_1000_0000, false, AccessType::Write),
            Err(WalkError::PageFault)
        );
    }

    #[test]
    fn test_no_update_walk_leaves_pte_alone() {
        let mem = memory();
        let root = 0x10_000u64;
        let l1 = 0x11_000u64;
        let l0 = 0x12_000u64;
        write_pte(&mem, root, l1 >> 12, PTE_V);
        write_pte(&mem, l1 + 0x80 * 8, l0 >> 12, PTE_V);
        write_pte(&mem, l0, 0x1, PTE_V | PTE_R | PTE_W);
        let mut cfg = sv39_config(root >> 12);
        cfg.update = false;
        let walker = Walker::new(&mem, cfg);
        let translation = walker
            .translate(0x0000_1000_0000, false, AccessType::Write)
            .unwrap();
        assert_eq!(translation.pa, 0x1000);
        let mut buf = [0u8; 8];
        mem.read(l0, &mut buf).unwrap();
        assert_eq!(u64::from_le_bytes(buf) & (PTE_A | PTE_D), 0);
    }

    #[test]
    fn test_sv39_superpage() {
        let mem = memory();
        let root = 0x10_000u64;
        // 1 GiB gigapage at VPN2 index 1: VA 0x4000_0000 -> PA 0x4000_0000.
        write_pte(&mem, root + 8, 0x4000_0000 >> 12, PTE_V | PTE_R | PTE_X | PTE_A);
        let walker = Walker::new(&mem, sv39_config(root >> 12));
        let translation = walker
            .translate(0x4000_1234, false, AccessType::Execute)
            .unwrap();
        assert_eq!(translation.pa, 0x4000_1234);
        // Misaligned superpage: low PPN bits set.
        write_pte(&mem, root + 16, (0x4000_0000 >> 12) | 1, PTE_V | PTE_R | PTE_A);
        assert_eq!(
            walker.translate(0x8000_0000, false, AccessType::Read),
            Err(WalkError::PageFault)
        );
    }

    #[test]
    fn test_user_page_protection() {
        let mem = memory();
        let root = 0x10_000u64;
        let l1 = 0x11_000u64;
        let l0 = 0x12_000u64;
        write_pte(&mem, root, l1 >> 12, PTE_V);
        write_pte(&mem, l1, l0 >> 12, PTE_V);
        write_pte(&mem, l0, 0x1, PTE_V | PTE_R | PTE_A);
        let mut cfg = sv39_config(root >> 12);
        let walker = Walker::new(&mem, cfg.clone());
        // Supervisor access to a non-U page: fine.
        assert!(walker.translate(0, false, AccessType::Read).is_ok());
        // User access to a non-U page: fault.
        assert_eq!(
            walker.translate(0, true, AccessType::Read),
            Err(WalkError::PageFault)
        );
        // Flip to a user page: supervisor needs SUM.
        write_pte(&mem, l0, 0x1, PTE_V | PTE_R | PTE_A | PTE_U);
        assert_eq!(
            walker.translate(0, false, AccessType::Read),
            Err(WalkError::PageFault)
        );
        cfg.sum = true;
        let walker = Walker::new(&mem, cfg);
        assert!(walker.translate(0, false, AccessType::Read).is_ok());
    }

    #[test]
    fn test_mxr_makes_exec_pages_readable() {
        let mem = memory();
        let root = 0x10_000u64;
        let l1 = 0x11_000u64;
        let l0 = 0x12_000u64;
        write_pte(&mem, root, l1 >> 12, PTE_V);
        write_pte(&mem, l1, l0 >> 12, PTE_V);
        write_pte(&mem, l0, 0x1, PTE_V | PTE_X | PTE_A);
        let mut cfg = sv39_config(root >> 12);
        let walker = Walker::new(&mem, cfg.clone());
        assert_eq!(
            walker.translate(0, false, AccessType::Read),
            Err(WalkError::PageFault)
        );
        cfg.mxr = true;
        let walker = Walker::new(&mem, cfg);
        assert!(walker.translate(0, false, AccessType::Read).is_ok());
    }

    #[test]
    fn test_sv39_va_canonicality() {
        let mem = memory();
        let root = 0x10_000u64;
        let walker = Walker::new(&mem, sv39_config(root >> 12));
        // Bit 38 clear but bit 39 set: non-canonical.
        assert_eq!(
            walker.translate(1 << 39, false, AccessType::Read),
            Err(WalkError::PageFault)
        );
    }

    /// Two-stage: stage-1 bare, G-stage Sv39x4 mapping GPA 0x8000_0000 -> PA 0x4000.
    #[test]
    fn test_gstage_only_translation() {
        let mem = memory();
        let root = 0x20_000u64; // 16 KiB aligned root for Sv39x4
        let l1 = 0x30_000u64;
        let l0 = 0x31_000u64;
        // GPA 0x8000_0000: vpn2 (11 bits) = 2, vpn1 = 0, vpn0 = 0.
        write_pte(&mem, root + 2 * 8, l1 >> 12, PTE_V | PTE_U);
        write_pte(&mem, l1, l0 >> 12, PTE_V | PTE_U);
        write_pte(&mem, l0, 0x4, PTE_V | PTE_R | PTE_W | PTE_U | PTE_A | PTE_D);
        let cfg = WalkConfig {
            g_mode: AtMode::Sv39x4,
            g_ppn: root >> 12,
            g_adue: true,
            update: true,
            ..WalkConfig::default()
        };
        let walker = Walker::new(&mem, cfg);
        let translation = walker.translate(0x8000_0123, false, AccessType::Read).unwrap();
        assert_eq!(translation.pa, 0x4123);
        // A G-stage miss surfaces as a guest page fault carrying the GPA.
        assert_eq!(
            walker.translate(0x9000_0000, false, AccessType::Read),
            Err(WalkError::GuestPageFault {
                gpa: 0x9000_0000,
                implicit: false,
                implicit_write: false,
            })
        );
    }

    /// Full two-stage: the stage-1 table itself lives in guest physical memory.
    #[test]
    fn test_two_stage_pte_fetch_through_gstage() {
        let mem = memory();
        // G stage: identity-map GPAs 0..1 GiB with one gigapage PTE.
        let g_root = 0x20_000u64;
        write_pte(&mem, g_root, 0, PTE_V | PTE_R | PTE_W | PTE_X | PTE_U | PTE_A | PTE_D);
        // Stage 1 (as guest physical): map VA 0 -> GPA 0x5000.
        let s_root = 0x40_000u64;
        let l1 = 0x41_000u64;
        let l0 = 0x42_000u64;
        write_pte(&mem, s_root, l1 >> 12, PTE_V);
        write_pte(&mem, l1, l0 >> 12, PTE_V);
        write_pte(&mem, l0, 0x5, PTE_V | PTE_R | PTE_A);
        let cfg = WalkConfig {
            s_mode: AtMode::Sv39,
            s_ppn: s_root >> 12,
            g_mode: AtMode::Sv39x4,
            g_ppn: g_root >> 12,
            adue: true,
            g_adue: true,
            update: true,
            ..WalkConfig::default()
        };
        let walker = Walker::new(&mem, cfg);
        let translation = walker.translate(0x321, false, AccessType::Read).unwrap();
        assert_eq!(translation.pa, 0x5321);
    }

    /// A stage-1 PTE fetch that misses the G stage is an implicit guest page fault.
    #[test]
    fn test_implicit_guest_fault_on_pte_fetch() {
        let mem = memory();
        let g_root = 0x20_000u64;
        // G stage maps nothing.
        let cfg = WalkConfig {
            s_mode: AtMode::Sv39,
            s_ppn: 0x40,
            g_mode: AtMode::Sv39x4,
            g_ppn: g_root >> 12,
            update: true,
            ..WalkConfig::default()
        };
        let walker = Walker::new(&mem, cfg);
        match walker.translate(0x1000, false, AccessType::Read) {
            Err(WalkError::GuestPageFault { implicit: true, implicit_write: false, .. }) => {}
            other => panic!("expected implicit guest page fault, got {other:?}"),
        }
    }

    #[test]
    fn test_pbmt_requires_pbmte() {
        let mem = memory();
        let root = 0x10_000u64;
        let l1 = 0x11_000u64;
        let l0 = 0x12_000u64;
        write_pte(&mem, root, l1 >> 12, PTE_V);
        write_pte(&mem, l1, l0 >> 12, PTE_V);
        // Leaf with PBMT = IO (2).
        mem.write(l0, &((0x1u64 << 10) | (2 << 61) | PTE_V | PTE_R | PTE_A).to_le_bytes())
            .unwrap();
        let mut cfg = sv39_config(root >> 12);
        let walker = Walker::new(&mem, cfg.clone());
        // Svpbmt off: a non-zero PBMT field is reserved, hence a page fault.
        assert_eq!(
            walker.translate(0, false, AccessType::Read),
            Err(WalkError::PageFault)
        );
        cfg.pbmte = true;
        let walker = Walker::new(&mem, cfg);
        let translation = walker.translate(0, false, AccessType::Read).unwrap();
        assert_eq!(translation.pbmt, 2);
    }
}
