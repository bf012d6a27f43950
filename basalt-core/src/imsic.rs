//! Incoming MSI controller (IMSIC): per-hart machine, supervisor, and guest interrupt files.
//!
//! Each file tracks external-interrupt identities as pending/enabled bitmaps with the AIA
//! `eidelivery`/`eithreshold` controls. `topei` selects the highest-priority deliverable
//! identity, which in AIA is the *lowest-numbered* one. MSI writes arrive either through the
//! memory-mapped `seteipnum` word of the file's page or directly from the IOMMU/APLIC.

use crate::bus::IoDevice;
use crate::memory::PAGE_SIZE;
use log::trace;
use std::sync::{Arc, Mutex};

/// Which interrupt file of a hart an MSI targets.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FileKind {
    Machine,
    Supervisor,
    /// Guest file with 1-based index (hstatus.VGEIN numbering).
    Guest(usize),
}

/// One interrupt file: pending and enabled identity bitmaps plus delivery controls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterruptFile {
    /// Identity delivery enable (0 = off, 1 = on).
    eidelivery: u32,
    /// Identities with number >= threshold are masked; 0 disables the threshold.
    eithreshold: u32,
    eip: Vec<u64>,
    eie: Vec<u64>,
    num_ids: u32,
}

impl InterruptFile {
    pub fn new(num_ids: u32) -> Self {
        let words = (num_ids as usize + 64) / 64;
        Self {
            eidelivery: 0,
            eithreshold: 0,
            eip: vec![0; words],
            eie: vec![0; words],
            num_ids,
        }
    }

    pub fn eidelivery(&self) -> u32 {
        self.eidelivery
    }

    pub fn set_eidelivery(&mut self, value: u32) {
        self.eidelivery = value & 1;
    }

    pub fn eithreshold(&self) -> u32 {
        self.eithreshold
    }

    pub fn set_eithreshold(&mut self, value: u32) {
        self.eithreshold = value;
    }

    fn id_ok(&self, id: u32) -> bool {
        id >= 1 && id <= self.num_ids
    }

    pub fn set_pending(&mut self, id: u32, pending: bool) {
        if !self.id_ok(id) {
            return;
        }
        let (word, bit) = (id as usize / 64, id % 64);
        if pending {
            self.eip[word] |= 1 << bit;
        } else {
            self.eip[word] &= !(1 << bit);
        }
    }

    pub fn pending(&self, id: u32) -> bool {
        self.id_ok(id) && self.eip[id as usize / 64] >> (id % 64) & 1 == 1
    }

    pub fn set_enabled(&mut self, id: u32, enabled: bool) {
        if !self.id_ok(id) {
            return;
        }
        let (word, bit) = (id as usize / 64, id % 64);
        if enabled {
            self.eie[word] |= 1 << bit;
        } else {
            self.eie[word] &= !(1 << bit);
        }
    }

    pub fn enabled(&self, id: u32) -> bool {
        self.id_ok(id) && self.eie[id as usize / 64] >> (id % 64) & 1 == 1
    }

    /// Raw eip/eie words for the indirect-CSR window and snapshots.
    pub fn eip_word(&self, ix: usize) -> u64 {
        self.eip.get(ix).copied().unwrap_or(0)
    }

    pub fn eie_word(&self, ix: usize) -> u64 {
        self.eie.get(ix).copied().unwrap_or(0)
    }

    pub fn set_eip_word(&mut self, ix: usize, value: u64) {
        if let Some(word) = self.eip.get_mut(ix) {
            *word = if ix == 0 { value & !1 } else { value };
        }
    }

    pub fn set_eie_word(&mut self, ix: usize, value: u64) {
        if let Some(word) = self.eie.get_mut(ix) {
            *word = if ix == 0 { value & !1 } else { value };
        }
    }

    /// The highest-priority (lowest-numbered) pending-and-enabled identity that passes the
    /// threshold, or `None`. Does not claim it.
    pub fn topei(&self) -> Option<u32> {
        if self.eidelivery == 0 {
            return None;
        }
        for (word_ix, (&p, &e)) in self.eip.iter().zip(&self.eie).enumerate() {
            let ready = p & e;
            if ready != 0 {
                let id = (word_ix * 64) as u32 + ready.trailing_zeros();
                if self.eithreshold == 0 || id < self.eithreshold {
                    return Some(id);
                }
                // Identities above the threshold in this word may still hide lower ones in
                // later words? No: identities only grow; nothing further can pass.
                return None;
            }
        }
        None
    }

    /// Claim the current top identity: clear its pending bit and return it.
    pub fn claim_topei(&mut self) -> Option<u32> {
        let id = self.topei()?;
        self.set_pending(id, false);
        Some(id)
    }
}

/// The IMSIC state of one hart: an M file, an S file, and optional guest files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HartFiles {
    pub machine: InterruptFile,
    pub supervisor: InterruptFile,
    pub guests: Vec<InterruptFile>,
}

/// The platform's incoming-MSI controller.
///
/// Memory layout: the machine files of all harts sit at `m_base + hart * stride`, the
/// supervisor and guest files at `s_base + hart * (1 + guests) * stride`, one page per file,
/// with the 4-byte little-endian `seteipnum` register at offset 0 of each page.
#[derive(Debug)]
pub struct Imsic {
    files: Vec<HartFiles>,
    m_base: u64,
    s_base: u64,
    stride: u64,
}

impl Imsic {
    pub fn new(hart_count: usize, guests_per_hart: usize, num_ids: u32, m_base: u64, s_base: u64) -> Self {
        let files = (0..hart_count)
            .map(|_| HartFiles {
                machine: InterruptFile::new(num_ids),
                supervisor: InterruptFile::new(num_ids),
                guests: vec![InterruptFile::new(num_ids); guests_per_hart],
            })
            .collect();
        Self {
            files,
            m_base,
            s_base,
            stride: PAGE_SIZE,
        }
    }

    pub fn hart_count(&self) -> usize {
        self.files.len()
    }

    pub fn file(&self, hart: usize, kind: FileKind) -> &InterruptFile {
        let files = &self.files[hart];
        match kind {
            FileKind::Machine => &files.machine,
            FileKind::Supervisor => &files.supervisor,
            FileKind::Guest(ix) => &files.guests[ix - 1],
        }
    }

    pub fn file_mut(&mut self, hart: usize, kind: FileKind) -> &mut InterruptFile {
        let files = &mut self.files[hart];
        match kind {
            FileKind::Machine => &mut files.machine,
            FileKind::Supervisor => &mut files.supervisor,
            FileKind::Guest(ix) => &mut files.guests[ix - 1],
        }
    }

    /// Deliver identity `id` to a file, as an MSI writer (APLIC, IOMMU, another hart) would.
    pub fn deliver(&mut self, hart: usize, kind: FileKind, id: u32) {
        trace!(hart, id; "IMSIC delivery");
        self.file_mut(hart, kind).set_pending(id, true);
    }

    /// Map a physical MSI target address to `(hart, file)`, per the configured base/stride.
    pub fn decode_address(&self, addr: u64) -> Option<(usize, FileKind)> {
        let guests = self.files.first().map(|f| f.guests.len()).unwrap_or(0);
        let m_size = self.stride * self.files.len() as u64;
        if addr >= self.m_base && addr < self.m_base + m_size {
            let hart = ((addr - self.m_base) / self.stride) as usize;
            return Some((hart, FileKind::Machine));
        }
        let s_stride = self.stride * (1 + guests as u64);
        let s_size = s_stride * self.files.len() as u64;
        if addr >= self.s_base && addr < self.s_base + s_size {
            let offset = addr - self.s_base;
            let hart = (offset / s_stride) as usize;
            let file_ix = (offset % s_stride / self.stride) as usize;
            let kind = if file_ix == 0 {
                FileKind::Supervisor
            } else {
                FileKind::Guest(file_ix)
            };
            return Some((hart, kind));
        }
        None
    }

    /// Guest-external-interrupt pending bits of a hart, as presented by HGEIP.
    pub fn hgeip(&self, hart: usize) -> u64 {
        let mut bits = 0;
        for (ix, guest) in self.files[hart].guests.iter().enumerate() {
            if guest.topei().is_some() {
                bits |= 1 << (ix + 1);
            }
        }
        bits
    }

    /// Snapshot of all file contents.
    pub fn snapshot(&self) -> Vec<HartFiles> {
        self.files.clone()
    }

    pub fn restore(&mut self, files: Vec<HartFiles>) {
        self.files = files;
    }
}

/// Memory-mapped front of a shared [`Imsic`]: word writes to a file's page deliver the
/// written identity (`seteipnum`).
#[derive(Debug)]
pub struct ImsicMmio {
    imsic: Arc<Mutex<Imsic>>,
    /// Physical base of the region this device is registered at.
    base: u64,
    size: u64,
}

impl ImsicMmio {
    pub fn new(imsic: Arc<Mutex<Imsic>>, base: u64, size: u64) -> Self {
        Self { imsic, base, size }
    }
}

impl IoDevice for ImsicMmio {
    fn size(&self) -> u64 {
        self.size
    }

    fn read_word(&mut self, _offset: u64) -> u32 {
        // seteipnum is write-only; reads return zero.
        0
    }

    fn write_word(&mut self, offset: u64, value: u32) {
        let mut imsic = self.imsic.lock().unwrap();
        if offset % PAGE_SIZE != 0 {
            return;
        }
        if let Some((hart, kind)) = imsic.decode_address(self.base + offset) {
            imsic.deliver(hart, kind, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file() -> InterruptFile {
        let mut f = InterruptFile::new(255);
        f.set_eidelivery(1);
        f
    }

    #[test]
    fn test_topei_lowest_id_wins() {
        let mut f = file();
        f.set_pending(9, true);
        f.set_pending(4, true);
        f.set_enabled(9, true);
        f.set_enabled(4, true);
        assert_eq!(f.topei(), Some(4));
        assert_eq!(f.claim_topei(), Some(4));
        assert_eq!(f.topei(), Some(9));
    }

    #[test]
    fn test_topei_requires_enable_and_delivery() {
        let mut f = file();
        f.set_pending(5, true);
        assert_eq!(f.topei(), None);
        f.set_enabled(5, true);
        assert_eq!(f.topei(), Some(5));
        f.set_eidelivery(0);
        assert_eq!(f.topei(), None);
    }

    #[test]
    fn test_threshold_masks_high_ids() {
        let mut f = file();
        f.set_pending(10, true);
        f.set_enabled(10, true);
        f.set_eithreshold(10);
        assert_eq!(f.topei(), None);
        f.set_eithreshold(11);
        assert_eq!(f.topei(), Some(10));
    }

    #[test]
    fn test_id_zero_is_invalid() {
        let mut f = file();
        f.set_pending(0, true);
        f.set_enabled(0, true);
        assert_eq!(f.topei(), None);
        f.set_eip_word(0, 0x3);
        assert_eq!(f.eip_word(0), 0x2);
    }

    #[test]
    fn test_address_decode() {
        let imsic = Imsic::new(2, 2, 255, 0x2400_0000, 0x2800_0000);
        assert_eq!(
            imsic.decode_address(0x2400_0000),
            Some((0, FileKind::Machine))
        );
        assert_eq!(
            imsic.decode_address(0x2400_1000),
            Some((1, FileKind::Machine))
        );
        assert_eq!(
            imsic.decode_address(0x2800_0000),
            Some((0, FileKind::Supervisor))
        );
        assert_eq!(
            imsic.decode_address(0x2800_2000),
            Some((0, FileKind::Guest(2)))
        );
        assert_eq!(
            imsic.decode_address(0x2800_3000),
            Some((1, FileKind::Supervisor))
        );
        assert_eq!(imsic.decode_address(0x1000_0000), None);
    }

    #[test]
    fn test_mmio_delivery() {
        let imsic = Arc::new(Mutex::new(Imsic::new(
            1,
            0,
            255,
            0x2400_0000,
            0x2800_0000,
        )));
        let mut mmio = ImsicMmio::new(imsic.clone(), 0x2400_0000, PAGE_SIZE);
        mmio.write_word(0, 17);
        let mut guard = imsic.lock().unwrap();
        let f = guard.file_mut(0, FileKind::Machine);
        f.set_eidelivery(1);
        f.set_enabled(17, true);
        assert_eq!(f.topei(), Some(17));
    }

    #[test]
    fn test_hgeip() {
        let mut imsic = Imsic::new(1, 2, 63, 0, 0x1000_0000);
        let guest = imsic.file_mut(0, FileKind::Guest(2));
        guest.set_eidelivery(1);
        guest.set_pending(3, true);
        guest.set_enabled(3, true);
        assert_eq!(imsic.hgeip(0), 1 << 2);
    }
}
