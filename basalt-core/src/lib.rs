#[macro_use]
extern crate static_assertions;

use std::cmp::Ordering;
use std::fmt;
use thiserror::Error;

pub mod aplic;
pub mod bus;
pub mod csr;
pub mod hart;
pub mod imsic;
pub mod instruction;
pub mod iommu;
pub mod mcm;
pub mod memory;
pub mod perf;
pub mod registers;
pub mod session;
pub mod snapshot;
pub mod system;
pub mod triggers;
pub mod virt_mem;

/// Base integer register width of a hart.
///
/// The hart, its CSR file, and its page-table walker are generic over this trait so that the
/// RV32 and RV64 variants share one implementation. All register-sized state is carried as
/// `u64` internally; an `Xlen` implementation supplies the width, the truncation mask, and the
/// sign-extension rule for values of the native width.
pub trait Xlen: 'static + Copy + Clone + fmt::Debug + Eq + Send + Sync {
    /// Number of bits in an `x` register (32 or 64).
    const BITS: u32;

    /// All-ones mask of the register width.
    const MASK: u64;

    /// Discard bits above the register width.
    #[inline]
    fn truncate(value: u64) -> u64 {
        value & Self::MASK
    }

    /// Sign-extend a value of the register width to 64 bits.
    fn sign_extend(value: u64) -> u64;

    /// Returns `true` for the 64-bit variant.
    #[inline]
    fn is_rv64() -> bool {
        Self::BITS == 64
    }
}

/// Marker type selecting the 32-bit base ISA.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Rv32;

/// Marker type selecting the 64-bit base ISA.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Rv64;

impl Xlen for Rv32 {
    const BITS: u32 = 32;
    const MASK: u64 = 0xFFFF_FFFF;

    #[inline]
    fn sign_extend(value: u64) -> u64 {
        value as u32 as i32 as i64 as u64
    }
}

impl Xlen for Rv64 {
    const BITS: u32 = 64;
    const MASK: u64 = u64::MAX;

    #[inline]
    fn sign_extend(value: u64) -> u64 {
        value
    }
}

/// The defined privilege levels: U, S, and M. Level `2` is reserved in the base ISA and is
/// representable only through [`RawPrivilegeLevel`].
///
/// With the hypervisor extension, U and S additionally exist in a *virtual* variant (VU/VS);
/// the virtualization state is carried separately as a boolean, see [`ExecMode`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub enum PrivilegeLevel {
    /// User/application, the lowest level.
    User = 0,
    /// Supervisor, the operating-system level.
    Supervisor = 1,
    // Level 2 is reserved
    /// Machine, the highest level and the only mandatory one.
    Machine = 3,
}

impl Default for PrivilegeLevel {
    fn default() -> Self {
        Self::User
    }
}

/// A privilege level as a raw 2-bit field, reserved encoding included.
///
/// CSR numbers encode their minimum required level in bits 9:8, and that field may hold the
/// reserved value `2` — which is exactly where the hypervisor bank lives (accessible from
/// HS-mode and above). Comparisons against [`PrivilegeLevel`] treat the levels numerically,
/// so an access check is just `mode < required`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub enum RawPrivilegeLevel {
    User = 0,
    Supervisor = 1,
    Reserved = 2,
    Machine = 3,
}

impl RawPrivilegeLevel {
    /// Decode a 2-bit field. Panics if the value doesn't fit in 2 bits (`0..=3`).
    pub fn from_u2(value_u2: u8) -> Self {
        match value_u2 {
            0 => Self::User,
            1 => Self::Supervisor,
            2 => Self::Reserved,
            3 => Self::Machine,
            _ => panic!("out of range u2 used"),
        }
    }
}

impl PartialEq<RawPrivilegeLevel> for PrivilegeLevel {
    fn eq(&self, other: &RawPrivilegeLevel) -> bool {
        *self as u8 == *other as u8
    }
}

impl PartialOrd<RawPrivilegeLevel> for PrivilegeLevel {
    fn partial_cmp(&self, other: &RawPrivilegeLevel) -> Option<Ordering> {
        (*self as u8).partial_cmp(&(*other as u8))
    }
}

impl TryFrom<RawPrivilegeLevel> for PrivilegeLevel {
    type Error = ReservedPrivilegeLevelError;
    fn try_from(value: RawPrivilegeLevel) -> Result<Self, Self::Error> {
        match value {
            RawPrivilegeLevel::User => Ok(Self::User),
            RawPrivilegeLevel::Supervisor => Ok(Self::Supervisor),
            RawPrivilegeLevel::Reserved => Err(ReservedPrivilegeLevelError(value)),
            RawPrivilegeLevel::Machine => Ok(Self::Machine),
        }
    }
}

impl fmt::Display for PrivilegeLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match *self {
            PrivilegeLevel::User => "U",
            PrivilegeLevel::Supervisor => "S",
            PrivilegeLevel::Machine => "M",
        })
    }
}

impl fmt::Display for RawPrivilegeLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match *self {
            RawPrivilegeLevel::User => "U",
            RawPrivilegeLevel::Supervisor => "S",
            RawPrivilegeLevel::Reserved => "2",
            RawPrivilegeLevel::Machine => "M",
        })
    }
}

#[derive(Error, Debug, Eq, PartialEq)]
#[error("privilege level {0} is reserved")]
pub struct ReservedPrivilegeLevelError(RawPrivilegeLevel);

/// The effective operating mode of a hart: a privilege level plus the hypervisor
/// virtualization state.
///
/// `virt` may only be set for the U and S levels (giving VU and VS); M-mode is never
/// virtualized.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ExecMode {
    pub level: PrivilegeLevel,
    pub virt: bool,
}

impl ExecMode {
    pub const M: Self = Self {
        level: PrivilegeLevel::Machine,
        virt: false,
    };

    pub fn new(level: PrivilegeLevel, virt: bool) -> Self {
        debug_assert!(!(virt && level == PrivilegeLevel::Machine));
        Self { level, virt }
    }
}

impl fmt::Display for ExecMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.virt {
            write!(f, "V{}", self.level)
        } else {
            write!(f, "{}", self.level)
        }
    }
}
