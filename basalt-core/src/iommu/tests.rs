use super::tables::{DcFlag, DeviceContext, ProcessContext};
use super::*;
use crate::memory::Memory;

const IOMMU_BASE: u64 = 0x1000_0000;

fn memory() -> Arc<Memory> {
    Arc::new(Memory::new(1 << 32, 1, 64))
}

fn iommu_with(memory: &Arc<Memory>, capabilities: u64) -> Iommu {
    Iommu::new(IOMMU_BASE, 0x1000, memory.clone(), capabilities)
}

fn read_req(dev_id: u32, iova: u64) -> IommuRequest {
    IommuRequest {
        dev_id,
        proc_id: None,
        iova,
        ttype: Ttype::UntransRead,
        priv_mode: PrivilegeLevel::User,
        size: 4,
    }
}

/// Install a base-format two-level DDT for `dev_id` with the given device context.
fn install_base_ddt(memory: &Memory, root_ppn: u64, dev_id: u32, dc: &DeviceContext) {
    let split = tables::ddi_split(dev_id, false);
    let leaf_ppn = root_ppn + 1;
    // Non-leaf entry: V + PPN.
    let dte = 1u64 | (leaf_ppn << 10);
    memory
        .write((root_ppn << 12) + split[1] * 8, &dte.to_le_bytes())
        .unwrap();
    memory
        .write((leaf_ppn << 12) + split[0] * 32, &dc.to_bytes()[..32])
        .unwrap();
}

/// Install an extended-format one-level DDT.
fn install_ext_ddt(memory: &Memory, root_ppn: u64, dev_id: u32, dc: &DeviceContext) {
    let split = tables::ddi_split(dev_id, true);
    memory
        .write((root_ppn << 12) + split[0] * 64, &dc.to_bytes())
        .unwrap();
}

fn enable_fault_queue(iommu: &mut Iommu, ppn: u64, log2_entries: u64) {
    iommu.write_reg(IOMMU_BASE + 0x28, 8, (ppn << 10) | (log2_entries - 1));
    iommu.write_reg(IOMMU_BASE + 0x4C, 4, 1);
}

/// Base-format two-level walk with everything bare passes the IOVA through unchanged.
#[test]
fn test_base_format_two_level_ddt_bare() {
    let memory = memory();
    let mut iommu = iommu_with(&memory, caps::SV39 | caps::SV39X4);
    let dc = DeviceContext::builder().valid().build(false);
    install_base_ddt(&memory, 0x100, 0x1FFF, &dc);
    // DDTP: mode 3 = two-level, root PPN 0x100.
    iommu.write_reg(IOMMU_BASE + 0x10, 8, (3u64 << 60) | 0x100);
    assert_eq!(iommu.translate(&read_req(0x1FFF, 0x5000)), Ok(0x5000));
}

/// With DDTP off, everything faults with cause 256, the fault queue advances, and IPSR.FIP
/// is raised; the record in memory carries the cause and device id.
#[test]
fn test_ddtp_off_faults_into_queue() {
    let memory = memory();
    let mut iommu = iommu_with(&memory, caps::SV39);
    enable_fault_queue(&mut iommu, 0x200, 2);
    assert_eq!(iommu.read_reg(IOMMU_BASE + 0x34, 4), Some(0)); // fqt
    assert_eq!(
        iommu.translate(&read_req(0x1FFF, 0x5000)),
        Err(cause::ALL_INBOUND_DISALLOWED)
    );
    // Tail advanced by one record.
    assert_eq!(iommu.read_reg(IOMMU_BASE + 0x34, 4), Some(1));
    assert_ne!(iommu.ipsr() & 0b10, 0, "FIP raised");
    let mut buf = [0u8; 32];
    memory.peek(0x200 << 12, &mut buf).unwrap();
    let w0 = u64::from_le_bytes(buf[..8].try_into().unwrap());
    assert_eq!(w0 & 0xFFF, 256);
    assert_eq!(w0 >> 40, 0x1FFF);
    let iotval = u64::from_le_bytes(buf[8..16].try_into().unwrap());
    assert_eq!(iotval, 0x5000);
}

/// Bare DDTP passes untranslated requests through but rejects translated/ATS ones.
#[test]
fn test_ddtp_bare() {
    let memory = memory();
    let mut iommu = iommu_with(&memory, 0);
    iommu.write_reg(IOMMU_BASE + 0x10, 8, 1u64 << 60);
    assert_eq!(iommu.translate(&read_req(7, 0x1234)), Ok(0x1234));
    let mut req = read_req(7, 0x1234);
    req.ttype = Ttype::TransRead;
    assert_eq!(iommu.translate(&req), Err(cause::TRANS_TYPE_DISALLOWED));
}

/// An invalid leaf context reports cause 258; a context with reserved bits set reports 259.
#[test]
fn test_ddt_invalid_and_misconfigured() {
    let memory = memory();
    let mut iommu = iommu_with(&memory, caps::SV39 | caps::SV39X4);
    iommu.write_reg(IOMMU_BASE + 0x10, 8, (2u64 << 60) | 0x100);
    // Nothing installed: the context at index 0 reads as zero (invalid).
    assert_eq!(iommu.translate(&read_req(1, 0)), Err(cause::DDT_INVALID));
    // Reserved tc bits set.
    let mut bytes = DeviceContext::builder().valid().build(false).to_bytes();
    bytes[2] |= 0xF0; // tc bits 20..24
    memory.write((0x100 << 12) + 2 * 32, &bytes[..32]).unwrap();
    assert_eq!(iommu.translate(&read_req(2, 0)), Err(cause::DDT_MISCONFIGURED));
}

/// A device id wider than the configured directory depth is disallowed.
#[test]
fn test_dev_id_too_wide() {
    let memory = memory();
    let mut iommu = iommu_with(&memory, 0);
    // One-level base format supports 7 bits of device id.
    iommu.write_reg(IOMMU_BASE + 0x10, 8, (2u64 << 60) | 0x100);
    assert_eq!(
        iommu.translate(&read_req(0x80, 0)),
        Err(cause::TRANS_TYPE_DISALLOWED)
    );
}

/// First-stage Sv39 walk through the IOMMU, with A/D updates enabled via SADE.
#[test]
fn test_first_stage_sv39() {
    let memory = memory();
    let mut iommu = iommu_with(&memory, caps::SV39 | caps::SV39X4 | caps::AMO_HWAD);
    // Page tables: map IOVA 0x1000 -> PA 0x9000.
    let (root, l1, l0) = (0x300u64, 0x301u64, 0x302u64);
    memory
        .write(root << 12, &((l1 << 10) | 1).to_le_bytes())
        .unwrap();
    memory
        .write(l1 << 12, &((l0 << 10) | 1).to_le_bytes())
        .unwrap();
    // Leaf: V|R|W|U, A=D=0 (hardware sets them via SADE).
    memory
        .write((l0 << 12) + 8, &((0x9u64 << 10) | 0x17).to_le_bytes())
        .unwrap();
    let dc = DeviceContext::builder()
        .valid()
        .flag(DcFlag::Sade)
        .fsc(8, root)
        .build(false);
    install_base_ddt(&memory, 0x100, 5, &dc);
    iommu.write_reg(IOMMU_BASE + 0x10, 8, (3u64 << 60) | 0x100);
    assert_eq!(iommu.translate(&read_req(5, 0x1234)), Ok(0x9234));
    // A bit set by hardware.
    let mut buf = [0u8; 8];
    memory.peek((l0 << 12) + 8, &mut buf).unwrap();
    assert_ne!(u64::from_le_bytes(buf) & (1 << 6), 0);
}

/// Process-directory walk: PDTV selects the PDT, DPE supplies process id 0.
#[test]
fn test_pdt_walk_with_dpe() {
    let memory = memory();
    let mut iommu = iommu_with(&memory, caps::PD8 | caps::SV39 | caps::SV39X4);
    let pdt_ppn = 0x400u64;
    let pc = ProcessContext::new(1, false, false, 0, 0);
    memory.write(pdt_ppn << 12, &pc.to_bytes()).unwrap();
    let dc = DeviceContext::builder()
        .valid()
        .flag(DcFlag::Pdtv)
        .flag(DcFlag::Dpe)
        .fsc(1, pdt_ppn) // PD8
        .build(false);
    install_base_ddt(&memory, 0x100, 5, &dc);
    iommu.write_reg(IOMMU_BASE + 0x10, 8, (3u64 << 60) | 0x100);
    // No process id in the request: DPE substitutes 0.
    assert_eq!(iommu.translate(&read_req(5, 0x7000)), Ok(0x7000));
    // Without DPE the same request is disallowed.
    let dc = DeviceContext::builder()
        .valid()
        .flag(DcFlag::Pdtv)
        .fsc(1, pdt_ppn)
        .build(false);
    install_base_ddt(&memory, 0x100, 5, &dc);
    assert_eq!(
        iommu.translate(&read_req(5, 0x7000)),
        Err(cause::TRANS_TYPE_DISALLOWED)
    );
}

/// MSI translation in basic (flat) mode: the aperture match redirects the GPA through the
/// MSI page table.
#[test]
fn test_msi_basic_translate() {
    let memory = memory();
    let mut iommu = iommu_with(&memory, caps::MSI_FLAT | caps::SV39 | caps::SV39X4);
    let msi_ppn = 0x500u64;
    // Interrupt-file index for gfn 0x12345 under mask 0xFF is 0x45.
    let pte_addr = (msi_ppn << 12) | (0x45 << 4);
    let w0 = 1u64 | (0b11 << 1) | (0x777u64 << 10);
    memory.write(pte_addr, &w0.to_le_bytes()).unwrap();
    let dc = DeviceContext::builder()
        .valid()
        .msiptp(1, msi_ppn)
        .msi_mask_pattern(0xFF, 0x12300)
        .build(true);
    install_ext_ddt(&memory, 0x100, 3, &dc);
    iommu.write_reg(IOMMU_BASE + 0x10, 8, (2u64 << 60) | 0x100);
    let req = IommuRequest {
        dev_id: 3,
        iova: 0x1234_5678,
        ttype: Ttype::UntransWrite,
        priv_mode: PrivilegeLevel::User,
        size: 4,
        proc_id: None,
    };
    assert_eq!(iommu.translate(&req), Ok((0x777 << 12) | 0x678));
    // An invalid MSI PTE faults with cause 262.
    let req_invalid = IommuRequest {
        iova: 0x1230_0678,
        ..req.clone()
    };
    assert_eq!(iommu.translate(&req_invalid), Err(cause::MSI_PTE_INVALID));
    // Addresses outside the aperture skip MSI translation entirely.
    let req_outside = IommuRequest {
        iova: 0x4444_0000,
        ..req
    };
    assert_eq!(iommu.translate(&req_outside), Ok(0x4444_0000));
}

/// MRIF mode returns the interrupt-file address and notice identity.
#[test]
fn test_msi_mrif_translate() {
    let memory = memory();
    let mut iommu = iommu_with(
        &memory,
        caps::MSI_FLAT | caps::MSI_MRIF | caps::SV39 | caps::SV39X4,
    );
    let msi_ppn = 0x500u64;
    let mrif_addr = 0x6000u64;
    let w0 = 1u64 | (0b01 << 1) | ((mrif_addr >> 9) << 7);
    let w1 = (0x888u64 << 10) | 0x42;
    let mut pte = [0u8; 16];
    pte[..8].copy_from_slice(&w0.to_le_bytes());
    pte[8..].copy_from_slice(&w1.to_le_bytes());
    memory.write(msi_ppn << 12, &pte).unwrap();
    let dc = DeviceContext::builder()
        .valid()
        .msiptp(1, msi_ppn)
        .msi_mask_pattern(0, 0x10000)
        .build(true);
    install_ext_ddt(&memory, 0x100, 3, &dc);
    iommu.write_reg(IOMMU_BASE + 0x10, 8, (2u64 << 60) | 0x100);
    let mut req = read_req(3, 0x1000_0000);
    req.ttype = Ttype::UntransWrite;
    match iommu.translate_msi(&req) {
        Ok(TranslateOutcome::Msi(MsiResult::Mrif {
            mrif_addr: addr,
            notice_ppn,
            nid,
        })) => {
            assert_eq!(addr, mrif_addr);
            assert_eq!(notice_ppn, 0x888);
            assert_eq!(nid, 0x42);
        }
        other => panic!("expected MRIF result, got {other:?}"),
    }
}

/// IOFENCE.C writes its completion word and raises CIP.
#[test]
fn test_command_queue_iofence() {
    let memory = memory();
    let mut iommu = iommu_with(&memory, 0);
    // Command queue at PPN 0x600 with 4 entries.
    iommu.write_reg(IOMMU_BASE + 0x18, 8, (0x600u64 << 10) | 1);
    iommu.write_reg(IOMMU_BASE + 0x48, 4, 1); // cqcsr.enable
    assert_ne!(iommu.cqcsr() & (1 << 16), 0, "cqon");
    // IOFENCE.C AV|WSI, DATA=0xABCD, ADDR=0x7000.
    let dword0 = 2u64 | (1 << 10) | (1 << 11) | (0xABCDu64 << 32);
    let dword1 = 0x7000u64 >> 2;
    let mut command = [0u8; 16];
    command[..8].copy_from_slice(&dword0.to_le_bytes());
    command[8..].copy_from_slice(&dword1.to_le_bytes());
    memory.write(0x600 << 12, &command).unwrap();
    iommu.write_reg(IOMMU_BASE + 0x24, 4, 1); // cqt = 1 kicks processing
    assert_eq!(iommu.read_reg(IOMMU_BASE + 0x20, 4), Some(1), "head advanced");
    let mut buf = [0u8; 4];
    memory.peek(0x7000, &mut buf).unwrap();
    assert_eq!(u32::from_le_bytes(buf), 0xABCD);
    assert_ne!(iommu.ipsr() & 0b1, 0, "CIP raised");
}

/// A malformed command sets cmd_ill and stalls the queue.
#[test]
fn test_command_queue_illegal_command() {
    let memory = memory();
    let mut iommu = iommu_with(&memory, 0);
    iommu.write_reg(IOMMU_BASE + 0x18, 8, (0x600u64 << 10) | 1);
    iommu.write_reg(IOMMU_BASE + 0x48, 4, 1);
    memory.write(0x600 << 12, &[0x7F; 16]).unwrap();
    iommu.write_reg(IOMMU_BASE + 0x24, 4, 1);
    assert_ne!(iommu.cqcsr() & (1 << 10), 0, "cmd_ill");
    assert_eq!(iommu.read_reg(IOMMU_BASE + 0x20, 4), Some(0), "head stalled");
}

/// ATS.INVAL tracks a pending invalidation until the device completes it.
#[test]
fn test_ats_inval_pending_list() {
    let memory = memory();
    let mut iommu = iommu_with(&memory, caps::ATS);
    iommu.write_reg(IOMMU_BASE + 0x18, 8, (0x600u64 << 10) | 1);
    iommu.write_reg(IOMMU_BASE + 0x48, 4, 1);
    let dword0 = 4u64 | (9u64 << 40); // ATS.INVAL for device 9
    let mut command = [0u8; 16];
    command[..8].copy_from_slice(&dword0.to_le_bytes());
    memory.write(0x600 << 12, &command).unwrap();
    iommu.write_reg(IOMMU_BASE + 0x24, 4, 1);
    assert_eq!(iommu.pending_ats_invalidations(), 1);
    iommu.complete_ats_invalidation(9);
    assert_eq!(iommu.pending_ats_invalidations(), 0);
}

/// ATS responses: UR for permanently-disallowed, CA for misconfiguration, Success with no
/// permissions for page faults.
#[test]
fn test_ats_response_mapping() {
    let memory = memory();
    // DDTP off: UR.
    let mut iommu = iommu_with(&memory, caps::ATS);
    let mut req = read_req(1, 0x1000);
    req.ttype = Ttype::PcieAts;
    let response = iommu.ats_translate(&req);
    assert!(!response.success && !response.is_completer_abort);

    // Misconfigured DC: CA.
    let mut iommu = iommu_with(&memory, caps::ATS | caps::SV39 | caps::SV39X4);
    let dc = DeviceContext::builder()
        .valid()
        .flag(DcFlag::EnAts)
        .flag(DcFlag::Gade) // AMO_HWAD capability missing
        .build(false);
    install_base_ddt(&memory, 0x100, 1, &dc);
    iommu.write_reg(IOMMU_BASE + 0x10, 8, (3u64 << 60) | 0x100);
    let response = iommu.ats_translate(&req);
    assert!(response.is_completer_abort);

    // Page fault in stage 1: Success with R=W=0.
    let dc = DeviceContext::builder()
        .valid()
        .flag(DcFlag::EnAts)
        .fsc(8, 0x7F0) // empty page table
        .build(false);
    install_base_ddt(&memory, 0x100, 1, &dc);
    let response = iommu.ats_translate(&req);
    assert!(response.success);
    assert!(!response.read_perm && !response.write_perm);

    // Clean translation: Success with permissions.
    let dc = DeviceContext::builder()
        .valid()
        .flag(DcFlag::EnAts)
        .build(false);
    install_base_ddt(&memory, 0x100, 1, &dc);
    let response = iommu.ats_translate(&req);
    assert!(response.success);
    assert!(response.read_perm);
    assert_eq!(response.translated_addr, 0x1000);
    assert!(!response.no_snoop);
}

/// Fault-queue overflow sets FQOF instead of overwriting records.
#[test]
fn test_fault_queue_overflow() {
    let memory = memory();
    let mut iommu = iommu_with(&memory, 0);
    // Capacity 2: one usable slot.
    enable_fault_queue(&mut iommu, 0x200, 1);
    assert_eq!(iommu.translate(&read_req(1, 0)), Err(256));
    assert_eq!(iommu.translate(&read_req(2, 0)), Err(256));
    assert_ne!(iommu.fqcsr() & (1 << 8), 0, "FQOF set");
    assert_eq!(iommu.read_reg(IOMMU_BASE + 0x34, 4), Some(1), "tail unchanged");
}

/// DTF suppresses reportable faults but not the exempt causes.
#[test]
fn test_dtf_suppression() {
    let memory = memory();
    let mut iommu = iommu_with(&memory, caps::SV39 | caps::SV39X4);
    enable_fault_queue(&mut iommu, 0x200, 2);
    let dc = DeviceContext::builder()
        .valid()
        .flag(DcFlag::Dtf)
        .fsc(8, 0x7F0) // empty table: page fault
        .build(false);
    install_base_ddt(&memory, 0x100, 1, &dc);
    iommu.write_reg(IOMMU_BASE + 0x10, 8, (3u64 << 60) | 0x100);
    assert_eq!(iommu.translate(&read_req(1, 0x1000)), Err(13));
    // Suppressed: no record queued.
    assert_eq!(iommu.read_reg(IOMMU_BASE + 0x34, 4), Some(0));
}

/// `read_for_device`/`write_for_device` touch the translated physical address.
#[test]
fn test_device_memory_access() {
    let memory = memory();
    let mut iommu = iommu_with(&memory, 0);
    iommu.write_reg(IOMMU_BASE + 0x10, 8, 1u64 << 60); // bare
    let mut req = read_req(1, 0x8000);
    req.ttype = Ttype::UntransWrite;
    iommu.write_for_device(&req, 0xDEAD_BEEF).unwrap();
    let mut buf = [0u8; 4];
    memory.peek(0x8000, &mut buf).unwrap();
    assert_eq!(u32::from_le_bytes(buf), 0xDEAD_BEEF);
    req.ttype = Ttype::UntransRead;
    assert_eq!(iommu.read_for_device(&req), Ok(0xDEAD_BEEF));
}

/// Register access obeys size and alignment rules.
#[test]
fn test_register_access_rules() {
    let memory = memory();
    let mut iommu = iommu_with(&memory, caps::SV39);
    // 8-byte read of capabilities.
    assert_eq!(
        iommu.read_reg(IOMMU_BASE, 8),
        Some(caps::VERSION_1_0 | caps::SV39)
    );
    // 4-byte halves of an 8-byte register.
    iommu.write_reg(IOMMU_BASE + 0x10, 8, (1u64 << 60) | 0x123);
    assert_eq!(iommu.read_reg(IOMMU_BASE + 0x10, 4), Some(0x123));
    assert_eq!(iommu.read_reg(IOMMU_BASE + 0x14, 4), Some(1 << 28));
    // Misaligned and out-of-range accesses fail.
    assert_eq!(iommu.read_reg(IOMMU_BASE + 0x12, 4), None);
    assert_eq!(iommu.read_reg(IOMMU_BASE + 0x2000, 4), None);
    assert!(!iommu.write_reg(IOMMU_BASE + 0x13, 4, 0));
}
