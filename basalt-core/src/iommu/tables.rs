//! In-memory table formats of the IOMMU: device contexts, process contexts, and the
//! directory-index arithmetic for the DDT and PDT walks.

use crate::virt_mem::AtMode;

/// A device context: 32 bytes in base format, 64 in extended (MSI) format.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct DeviceContext {
    tc: u64,
    iohgatp: u64,
    ta: u64,
    fsc: u64,
    msiptp: u64,
    msi_addr_mask: u64,
    msi_addr_pattern: u64,
    extended: bool,
}

// Translation-control bits.
mod tc {
    pub const V: u64 = 1 << 0;
    pub const EN_ATS: u64 = 1 << 1;
    pub const EN_PRI: u64 = 1 << 2;
    pub const T2GPA: u64 = 1 << 3;
    pub const DTF: u64 = 1 << 4;
    pub const PDTV: u64 = 1 << 5;
    pub const PRPR: u64 = 1 << 6;
    pub const GADE: u64 = 1 << 7;
    pub const SADE: u64 = 1 << 8;
    pub const DPE: u64 = 1 << 9;
    pub const SBE: u64 = 1 << 10;
    pub const SXL: u64 = 1 << 11;
}

impl DeviceContext {
    pub fn from_bytes(bytes: &[u8; 64], extended: bool) -> Self {
        let word = |ix: usize| u64::from_le_bytes(bytes[ix * 8..(ix + 1) * 8].try_into().unwrap());
        Self {
            tc: word(0),
            iohgatp: word(1),
            ta: word(2),
            fsc: word(3),
            msiptp: if extended { word(4) } else { 0 },
            msi_addr_mask: if extended { word(5) } else { 0 },
            msi_addr_pattern: if extended { word(6) } else { 0 },
            extended,
        }
    }

    /// Serialize for table builders (tests and tooling).
    pub fn to_bytes(&self) -> [u8; 64] {
        let mut bytes = [0u8; 64];
        for (ix, word) in [
            self.tc,
            self.iohgatp,
            self.ta,
            self.fsc,
            self.msiptp,
            self.msi_addr_mask,
            self.msi_addr_pattern,
            0,
        ]
        .iter()
        .enumerate()
        {
            bytes[ix * 8..(ix + 1) * 8].copy_from_slice(&word.to_le_bytes());
        }
        bytes
    }

    pub fn builder() -> DeviceContextBuilder {
        DeviceContextBuilder::default()
    }

    pub fn valid(&self) -> bool {
        self.tc & tc::V != 0
    }

    pub fn en_ats(&self) -> bool {
        self.tc & tc::EN_ATS != 0
    }

    pub fn en_pri(&self) -> bool {
        self.tc & tc::EN_PRI != 0
    }

    pub fn t2gpa(&self) -> bool {
        self.tc & tc::T2GPA != 0
    }

    pub fn dtf(&self) -> bool {
        self.tc & tc::DTF != 0
    }

    pub fn pdtv(&self) -> bool {
        self.tc & tc::PDTV != 0
    }

    pub fn prpr(&self) -> bool {
        self.tc & tc::PRPR != 0
    }

    pub fn gade(&self) -> bool {
        self.tc & tc::GADE != 0
    }

    pub fn sade(&self) -> bool {
        self.tc & tc::SADE != 0
    }

    pub fn dpe(&self) -> bool {
        self.tc & tc::DPE != 0
    }

    pub fn sbe(&self) -> bool {
        self.tc & tc::SBE != 0
    }

    pub fn sxl(&self) -> bool {
        self.tc & tc::SXL != 0
    }

    pub fn reserved_bits_set(&self) -> bool {
        self.tc & !0xFFF != 0
    }

    pub fn iohgatp_raw_mode(&self) -> u8 {
        (self.iohgatp >> 60) as u8
    }

    pub fn iohgatp_mode(&self, rv64: bool) -> Option<AtMode> {
        AtMode::from_hgatp(self.iohgatp_raw_mode(), rv64)
    }

    pub fn iohgatp_ppn(&self) -> u64 {
        self.iohgatp & 0xFFF_FFFF_FFFF
    }

    pub fn gscid(&self) -> u16 {
        ((self.iohgatp >> 44) & 0xFFFF) as u16
    }

    pub fn fsc(&self) -> u64 {
        self.fsc
    }

    pub fn msiptp_mode(&self) -> u8 {
        (self.msiptp >> 60) as u8
    }

    pub fn msiptp_ppn(&self) -> u64 {
        self.msiptp & 0xFFF_FFFF_FFFF
    }

    pub fn msi_addr_mask(&self) -> u64 {
        self.msi_addr_mask & 0x3FF_FFFF_FFFF_FFFF
    }

    pub fn msi_addr_pattern(&self) -> u64 {
        self.msi_addr_pattern & 0x3FF_FFFF_FFFF_FFFF
    }

    pub fn is_extended(&self) -> bool {
        self.extended
    }
}

/// Builder used by tests and platform bring-up code to compose device contexts.
#[derive(Debug, Clone, Default)]
pub struct DeviceContextBuilder {
    dc: DeviceContext,
}

impl DeviceContextBuilder {
    pub fn valid(mut self) -> Self {
        self.dc.tc |= tc::V;
        self
    }

    pub fn flag(mut self, bit: DcFlag) -> Self {
        self.dc.tc |= match bit {
            DcFlag::EnAts => tc::EN_ATS,
            DcFlag::EnPri => tc::EN_PRI,
            DcFlag::T2Gpa => tc::T2GPA,
            DcFlag::Dtf => tc::DTF,
            DcFlag::Pdtv => tc::PDTV,
            DcFlag::Prpr => tc::PRPR,
            DcFlag::Gade => tc::GADE,
            DcFlag::Sade => tc::SADE,
            DcFlag::Dpe => tc::DPE,
            DcFlag::Sbe => tc::SBE,
            DcFlag::Sxl => tc::SXL,
        };
        self
    }

    pub fn iohgatp(mut self, mode: u8, gscid: u16, ppn: u64) -> Self {
        self.dc.iohgatp = ((mode as u64) << 60) | ((gscid as u64) << 44) | (ppn & 0xFFF_FFFF_FFFF);
        self
    }

    pub fn fsc(mut self, mode: u8, ppn: u64) -> Self {
        self.dc.fsc = ((mode as u64) << 60) | (ppn & 0xFFF_FFFF_FFFF);
        self
    }

    pub fn msiptp(mut self, mode: u8, ppn: u64) -> Self {
        self.dc.msiptp = ((mode as u64) << 60) | (ppn & 0xFFF_FFFF_FFFF);
        self
    }

    pub fn msi_mask_pattern(mut self, mask: u64, pattern: u64) -> Self {
        self.dc.msi_addr_mask = mask;
        self.dc.msi_addr_pattern = pattern;
        self
    }

    pub fn build(mut self, extended: bool) -> DeviceContext {
        self.dc.extended = extended;
        self.dc
    }
}

/// Named device-context flags for the builder.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DcFlag {
    EnAts,
    EnPri,
    T2Gpa,
    Dtf,
    Pdtv,
    Prpr,
    Gade,
    Sade,
    Dpe,
    Sbe,
    Sxl,
}

/// A process context: 16 bytes (translation attributes + first-stage context).
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct ProcessContext {
    ta: u64,
    fsc: u64,
}

impl ProcessContext {
    pub fn from_bytes(bytes: &[u8; 16]) -> Self {
        Self {
            ta: u64::from_le_bytes(bytes[..8].try_into().unwrap()),
            fsc: u64::from_le_bytes(bytes[8..].try_into().unwrap()),
        }
    }

    pub fn new(pscid: u32, ens: bool, sum: bool, fsc_mode: u8, fsc_ppn: u64) -> Self {
        Self {
            ta: 1 | (u64::from(ens) << 1) | (u64::from(sum) << 2) | ((pscid as u64 & 0xF_FFFF) << 12),
            fsc: ((fsc_mode as u64) << 60) | (fsc_ppn & 0xFFF_FFFF_FFFF),
        }
    }

    pub fn to_bytes(&self) -> [u8; 16] {
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&self.ta.to_le_bytes());
        bytes[8..].copy_from_slice(&self.fsc.to_le_bytes());
        bytes
    }

    pub fn valid(&self) -> bool {
        self.ta & 1 != 0
    }

    pub fn ens(&self) -> bool {
        self.ta >> 1 & 1 != 0
    }

    pub fn sum(&self) -> bool {
        self.ta >> 2 & 1 != 0
    }

    pub fn pscid(&self) -> u32 {
        ((self.ta >> 12) & 0xF_FFFF) as u32
    }

    pub fn fsc(&self) -> u64 {
        self.fsc
    }

    pub fn reserved_bits_set(&self) -> bool {
        self.ta & 0xFFFF_FFFF_0000_0FF8 != 0
    }
}

/// A first-stage-context word: iosatp (address-translation modes) or pdtp (process-directory
/// modes), depending on PDTV.
#[derive(Debug, Copy, Clone)]
pub struct Fsc(pub u64);

impl Fsc {
    pub fn raw_mode(&self) -> u8 {
        (self.0 >> 60) as u8
    }

    pub fn ppn(&self) -> u64 {
        self.0 & 0xFFF_FFFF_FFFF
    }

    /// Interpret the mode field as an iosatp translation scheme.
    pub fn at_mode(&self, rv64: bool) -> Option<AtMode> {
        match (self.raw_mode(), rv64) {
            (0, _) => Some(AtMode::Bare),
            (8, true) => Some(AtMode::Sv39),
            (9, true) => Some(AtMode::Sv48),
            (10, true) => Some(AtMode::Sv57),
            (8, false) => Some(AtMode::Sv32),
            _ => None,
        }
    }
}

/// Split a device id into per-level directory indices. Base format uses a 7-bit leaf index
/// (128 32-byte contexts per page), extended format a 6-bit one (64 64-byte contexts).
pub fn ddi_split(dev_id: u32, extended: bool) -> [u64; 3] {
    let dev_id = dev_id as u64;
    if extended {
        [dev_id & 0x3F, (dev_id >> 6) & 0x1FF, (dev_id >> 15) & 0x1FF]
    } else {
        [dev_id & 0x7F, (dev_id >> 7) & 0x1FF, (dev_id >> 16) & 0xFF]
    }
}

/// Number of device-id bits usable with the given level count.
pub fn ddi_width(extended: bool, levels: u8) -> u32 {
    let widths = if extended { [6, 15, 24] } else { [7, 16, 24] };
    widths[(levels - 1) as usize]
}

/// Split a process id into per-level directory indices (PD8/PD17/PD20).
pub fn pdi_split(proc_id: u32) -> [u64; 3] {
    let proc_id = proc_id as u64;
    [proc_id & 0xFF, (proc_id >> 8) & 0x1FF, (proc_id >> 17) & 0x7]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dc_roundtrip() {
        let dc = DeviceContext::builder()
            .valid()
            .flag(DcFlag::EnAts)
            .iohgatp(8, 0x42, 0x1234)
            .fsc(8, 0x5678)
            .msiptp(1, 0x9ABC)
            .msi_mask_pattern(0xFF, 0xF0)
            .build(true);
        let parsed = DeviceContext::from_bytes(&dc.to_bytes(), true);
        assert_eq!(parsed, dc);
        assert!(parsed.valid());
        assert!(parsed.en_ats());
        assert_eq!(parsed.iohgatp_raw_mode(), 8);
        assert_eq!(parsed.gscid(), 0x42);
        assert_eq!(parsed.iohgatp_ppn(), 0x1234);
        assert_eq!(parsed.msiptp_mode(), 1);
        assert_eq!(parsed.msi_addr_mask(), 0xFF);
    }

    #[test]
    fn test_base_format_ignores_msi_words() {
        let dc = DeviceContext::builder()
            .valid()
            .msiptp(1, 0x9ABC)
            .build(true);
        let parsed = DeviceContext::from_bytes(&dc.to_bytes(), false);
        assert_eq!(parsed.msiptp_mode(), 0);
    }

    #[test]
    fn test_ddi_split() {
        // Base format: 7/9/8 split.
        assert_eq!(ddi_split(0x1FFF, false), [0x7F, 0x3F, 0]);
        // Extended format: 6/9/9 split.
        assert_eq!(ddi_split(0x1FFF, true), [0x3F, 0xFF, 0]);
        assert_eq!(ddi_width(false, 2), 16);
        assert_eq!(ddi_width(true, 2), 15);
    }

    #[test]
    fn test_pc_fields() {
        let pc = ProcessContext::new(0x123, true, false, 8, 0x77);
        let parsed = ProcessContext::from_bytes(&pc.to_bytes());
        assert!(parsed.valid());
        assert!(parsed.ens());
        assert!(!parsed.sum());
        assert_eq!(parsed.pscid(), 0x123);
        assert_eq!(Fsc(parsed.fsc()).raw_mode(), 8);
        assert_eq!(Fsc(parsed.fsc()).ppn(), 0x77);
        assert!(!parsed.reserved_bits_set());
    }
}
