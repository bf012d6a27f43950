//! Typed views over the status-class CSRs.
//!
//! The CSR file stores plain 64-bit values; these wrappers give the hart named access to the
//! individual fields. A view is constructed from the raw value, mutated, and written back
//! through the file's poke path so the masks still apply.

use crate::{PrivilegeLevel, RawPrivilegeLevel};
use bitvec::{field::BitField, order::Lsb0, view::BitView};

/// Field view of the `mstatus` register (64-bit semantic value; on RV32 the upper half is
/// exposed through `mstatush`).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Mstatus(pub u64);

mod idx {
    pub const SIE: usize = 1;
    pub const MIE: usize = 3;
    pub const SPIE: usize = 5;
    pub const UBE: usize = 6;
    pub const MPIE: usize = 7;
    pub const SPP: usize = 8;
    pub const MPP: usize = 11; // 2 bits
    pub const FS: usize = 13; // 2 bits
    pub const MPRV: usize = 17;
    pub const SUM: usize = 18;
    pub const MXR: usize = 19;
    pub const TVM: usize = 20;
    pub const TW: usize = 21;
    pub const TSR: usize = 22;
    pub const SBE: usize = 36;
    pub const MBE: usize = 37;
    pub const GVA: usize = 38;
    pub const MPV: usize = 39;
}

macro_rules! flag {
    ($get:ident, $set:ident, $idx:expr) => {
        pub fn $get(&self) -> bool {
            self.0.view_bits::<Lsb0>()[$idx]
        }

        pub fn $set(&mut self, value: bool) {
            self.0.view_bits_mut::<Lsb0>().set($idx, value);
        }
    };
}

impl Mstatus {
    flag!(sie, set_sie, idx::SIE);
    flag!(mie, set_mie, idx::MIE);
    flag!(spie, set_spie, idx::SPIE);
    flag!(ube, set_ube, idx::UBE);
    flag!(mpie, set_mpie, idx::MPIE);
    flag!(mprv, set_mprv, idx::MPRV);
    flag!(sum, set_sum, idx::SUM);
    flag!(mxr, set_mxr, idx::MXR);
    flag!(tvm, set_tvm, idx::TVM);
    flag!(tw, set_tw, idx::TW);
    flag!(tsr, set_tsr, idx::TSR);
    flag!(sbe, set_sbe, idx::SBE);
    flag!(mbe, set_mbe, idx::MBE);
    flag!(gva, set_gva, idx::GVA);
    flag!(mpv, set_mpv, idx::MPV);

    /// The privilege level encoded by the MPP (M-mode Previous Privilege) field.
    ///
    /// The MPP field is **WARL**; a reserved encoding reads as U.
    pub fn mpp(&self) -> PrivilegeLevel {
        let raw: u8 = self.0.view_bits::<Lsb0>()[idx::MPP..idx::MPP + 2].load_le();
        RawPrivilegeLevel::from_u2(raw)
            .try_into()
            .unwrap_or(PrivilegeLevel::User)
    }

    pub fn set_mpp(&mut self, value: PrivilegeLevel) {
        self.0.view_bits_mut::<Lsb0>()[idx::MPP..idx::MPP + 2].store_le(value as u8);
    }

    /// The privilege level encoded by the SPP (S-mode Previous Privilege) bit.
    pub fn spp(&self) -> PrivilegeLevel {
        match self.0.view_bits::<Lsb0>()[idx::SPP] {
            false => PrivilegeLevel::User,
            true => PrivilegeLevel::Supervisor,
        }
    }

    pub fn set_spp(&mut self, value: PrivilegeLevel) {
        self.0
            .view_bits_mut::<Lsb0>()
            .set(idx::SPP, value == PrivilegeLevel::Supervisor);
    }

    /// The FS (floating-point state) field.
    pub fn fs(&self) -> u8 {
        self.0.view_bits::<Lsb0>()[idx::FS..idx::FS + 2].load_le()
    }

    pub fn set_fs(&mut self, value: u8) {
        self.0.view_bits_mut::<Lsb0>()[idx::FS..idx::FS + 2].store_le(value & 3);
    }
}

/// Field view of the `hstatus` register.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Hstatus(pub u64);

mod hidx {
    pub const VSBE: usize = 5;
    pub const GVA: usize = 6;
    pub const SPV: usize = 7;
    pub const SPVP: usize = 8;
    pub const HU: usize = 9;
    pub const VGEIN: usize = 12; // 6 bits
    pub const VTVM: usize = 20;
    pub const VTW: usize = 21;
    pub const VTSR: usize = 22;
}

impl Hstatus {
    flag!(vsbe, set_vsbe, hidx::VSBE);
    flag!(gva, set_gva, hidx::GVA);
    flag!(spv, set_spv, hidx::SPV);
    flag!(hu, set_hu, hidx::HU);
    flag!(vtvm, set_vtvm, hidx::VTVM);
    flag!(vtw, set_vtw, hidx::VTW);
    flag!(vtsr, set_vtsr, hidx::VTSR);

    /// SPVP: the privilege level VS-level traps came from.
    pub fn spvp(&self) -> PrivilegeLevel {
        match self.0.view_bits::<Lsb0>()[hidx::SPVP] {
            false => PrivilegeLevel::User,
            true => PrivilegeLevel::Supervisor,
        }
    }

    pub fn set_spvp(&mut self, value: PrivilegeLevel) {
        self.0
            .view_bits_mut::<Lsb0>()
            .set(hidx::SPVP, value == PrivilegeLevel::Supervisor);
    }

    /// VGEIN: the guest external interrupt source routed to VS-level.
    pub fn vgein(&self) -> u8 {
        self.0.view_bits::<Lsb0>()[hidx::VGEIN..hidx::VGEIN + 6].load_le()
    }

    pub fn set_vgein(&mut self, value: u8) {
        self.0.view_bits_mut::<Lsb0>()[hidx::VGEIN..hidx::VGEIN + 6].store_le(value);
    }
}

/// Field view of `satp`/`vsatp`/`hgatp`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Atp(pub u64);

impl Atp {
    /// The MODE field (4 bits on RV64, 1 bit on RV32; callers pass the right width).
    pub fn mode_rv64(&self) -> u8 {
        (self.0 >> 60) as u8
    }

    pub fn mode_rv32(&self) -> u8 {
        (self.0 >> 31) as u8 & 1
    }

    pub fn asid_rv64(&self) -> u16 {
        ((self.0 >> 44) & 0xFFFF) as u16
    }

    pub fn asid_rv32(&self) -> u16 {
        ((self.0 >> 22) & 0x1FF) as u16
    }

    pub fn ppn_rv64(&self) -> u64 {
        self.0 & 0xFFF_FFFF_FFFF
    }

    pub fn ppn_rv32(&self) -> u64 {
        self.0 & 0x3F_FFFF
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mstatus_fields() {
        let mut status = Mstatus(0);
        status.set_mie(true);
        status.set_mpp(PrivilegeLevel::Supervisor);
        status.set_mpv(true);
        assert_eq!(status.0, (1 << 3) | (1 << 11) | (1 << 39));
        assert!(status.mie());
        assert_eq!(status.mpp(), PrivilegeLevel::Supervisor);
        status.set_mpp(PrivilegeLevel::Machine);
        assert_eq!(status.mpp(), PrivilegeLevel::Machine);
    }

    #[test]
    fn test_mpp_reserved_reads_as_user() {
        let status = Mstatus(0b10 << 11);
        assert_eq!(status.mpp(), PrivilegeLevel::User);
    }

    #[test]
    fn test_hstatus_fields() {
        let mut hstatus = Hstatus(0);
        hstatus.set_spv(true);
        hstatus.set_spvp(PrivilegeLevel::Supervisor);
        hstatus.set_vgein(3);
        assert!(hstatus.spv());
        assert_eq!(hstatus.spvp(), PrivilegeLevel::Supervisor);
        assert_eq!(hstatus.vgein(), 3);
    }

    #[test]
    fn test_atp_decode() {
        let atp = Atp((8 << 60) | (0x42 << 44) | 0x1234);
        assert_eq!(atp.mode_rv64(), 8);
        assert_eq!(atp.asid_rv64(), 0x42);
        assert_eq!(atp.ppn_rv64(), 0x1234);
    }
}
