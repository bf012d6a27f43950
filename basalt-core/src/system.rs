//! System composition: harts over shared memory, the interrupt fabric, the optional MCM
//! checker and IOMMU, and the run loop.
//!
//! Two scheduling modes are supported and fixed at the start of a run: a single thread
//! stepping all harts round-robin in random-length windows, or one native thread per hart.
//! Within a hart execution is strictly sequential; all run loops observe the session stop
//! flag at step boundaries only.

use crate::aplic::Aplic;
use crate::bus::IoDevice;
use crate::hart::{Config as HartConfig, Hart, StepOutcome};
use crate::imsic::{FileKind, Imsic};
use crate::iommu::Iommu;
use crate::mcm::{Mcm, RetireInfo};
use crate::memory::Memory;
use crate::session::{Session, StopReason};
use crate::snapshot::SystemSnapshot;
use crate::Xlen;
use log::{info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// How hart stepping is scheduled.
#[derive(Debug, Clone)]
pub enum RunMode {
    /// One thread, all harts, random step windows from a seeded generator.
    RoundRobin { seed: u64, max_window: u32 },
    /// One native thread per hart. The MCM checker requires the serialised round-robin
    /// mode; a threaded run with MCM enabled falls back with a warning.
    Threaded,
}

impl Default for RunMode {
    fn default() -> Self {
        Self::RoundRobin {
            seed: 1,
            max_window: 16,
        }
    }
}

/// MCM configuration of a run.
#[derive(Debug, Clone)]
pub struct McmConfig {
    pub line_size: u64,
    pub check_whole_line: bool,
    pub tso: bool,
    /// When present, only the listed PPO rules are enabled.
    pub rules: Option<Vec<usize>>,
}

impl Default for McmConfig {
    fn default() -> Self {
        Self {
            line_size: 64,
            check_whole_line: false,
            tso: false,
            rules: None,
        }
    }
}

/// IMSIC placement.
#[derive(Debug, Clone)]
pub struct ImsicConfig {
    pub m_base: u64,
    pub s_base: u64,
    pub guests_per_hart: usize,
    pub num_ids: u32,
}

#[derive(Debug, Clone)]
pub struct SystemConfig {
    pub hart_count: usize,
    pub memory_size: u64,
    /// Template for every hart; `hart_ix` is filled in per hart.
    pub hart: HartConfig,
    /// Physical address whose doubleword writes halt the run (the to-host convention).
    pub tohost: Option<u64>,
    pub mcm: Option<McmConfig>,
    pub imsic: Option<ImsicConfig>,
    pub run_mode: RunMode,
    pub step_limit: Option<u64>,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            hart_count: 1,
            memory_size: 1 << 32,
            hart: HartConfig::default(),
            tohost: None,
            mcm: None,
            imsic: None,
            run_mode: RunMode::default(),
            step_limit: None,
        }
    }
}

/// The whole simulated platform.
#[derive(Debug)]
pub struct System<X: Xlen> {
    config: SystemConfig,
    session: Session,
    mem: Arc<Memory>,
    harts: Vec<Hart<X>>,
    mcm: Option<Mcm>,
    iommu: Option<Iommu>,
    imsic: Option<Arc<Mutex<Imsic>>>,
    aplic: Option<Arc<Mutex<Aplic>>>,
    time: Arc<AtomicU64>,
    /// Next MCM retire tag per hart (tags are 1-based and monotone).
    retire_tags: Vec<u64>,
}

impl<X: Xlen> System<X> {
    /// Build a system. `devices` are memory-mapped at their given base addresses.
    pub fn new(config: SystemConfig, devices: Vec<(u64, Box<dyn IoDevice>)>) -> Self {
        let session = Session::new();
        let mut mem = Memory::new(
            config.memory_size,
            config.hart_count,
            config.hart.lr_res_size,
        );
        for (base, device) in devices {
            mem.add_device(base, device);
        }
        if let Some(tohost) = config.tohost {
            let watch_session = session.clone();
            mem.add_write_watch(
                tohost,
                Box::new(move |_, value| watch_session.record_tohost(value)),
            );
        }
        let mem = Arc::new(mem);

        let harts = (0..config.hart_count)
            .map(|ix| {
                let hart_config = HartConfig {
                    hart_ix: ix as u64,
                    ..config.hart.clone()
                };
                Hart::new(mem.clone(), hart_config)
            })
            .collect();

        let mcm = config.mcm.as_ref().map(|mcm_config| {
            let mut mcm = Mcm::new(mem.clone(), config.hart_count, mcm_config.line_size);
            mcm.enable_tso(mcm_config.tso);
            mcm.enable_whole_line_check(mcm_config.check_whole_line);
            if let Some(rules) = &mcm_config.rules {
                mcm.enable_all_ppo(false);
                for &rule in rules {
                    mcm.enable_ppo(rule, true);
                }
            }
            mcm
        });

        let imsic = config.imsic.as_ref().map(|imsic_config| {
            Arc::new(Mutex::new(Imsic::new(
                config.hart_count,
                imsic_config.guests_per_hart,
                imsic_config.num_ids,
                imsic_config.m_base,
                imsic_config.s_base,
            )))
        });

        Self {
            retire_tags: vec![0; config.hart_count],
            session,
            mem,
            harts,
            mcm,
            iommu: None,
            imsic,
            aplic: None,
            time: Arc::new(AtomicU64::new(0)),
            config,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn memory(&self) -> &Arc<Memory> {
        &self.mem
    }

    pub fn hart(&self, ix: usize) -> &Hart<X> {
        &self.harts[ix]
    }

    pub fn hart_mut(&mut self, ix: usize) -> &mut Hart<X> {
        &mut self.harts[ix]
    }

    pub fn hart_count(&self) -> usize {
        self.harts.len()
    }

    pub fn mcm(&self) -> Option<&Mcm> {
        self.mcm.as_ref()
    }

    pub fn mcm_mut(&mut self) -> Option<&mut Mcm> {
        self.mcm.as_mut()
    }

    /// Attach an IOMMU (translation tables live in this system's memory).
    pub fn attach_iommu(&mut self, iommu: Iommu) {
        self.iommu = Some(iommu);
    }

    pub fn iommu_mut(&mut self) -> Option<&mut Iommu> {
        self.iommu.as_mut()
    }

    /// Attach the APLIC and wire it to the IMSIC when MSI delivery is used.
    pub fn attach_aplic(&mut self, mut aplic: Aplic) {
        if let Some(imsic) = &self.imsic {
            aplic.connect_imsic(imsic.clone());
        }
        self.aplic = Some(Arc::new(Mutex::new(aplic)));
    }

    pub fn aplic(&self) -> Option<&Arc<Mutex<Aplic>>> {
        self.aplic.as_ref()
    }

    pub fn imsic(&self) -> Option<&Arc<Mutex<Imsic>>> {
        self.imsic.as_ref()
    }

    pub fn time(&self) -> u64 {
        self.time.load(Ordering::Relaxed)
    }

    /// Load a flat blob at a physical address (program images, table contents).
    pub fn load(&self, addr: u64, bytes: &[u8]) {
        self.mem.poke(addr, bytes).expect("image fits in memory");
    }

    //
    // Stepping.
    //

    fn poll_interrupts(hart: &mut Hart<X>, imsic: &Option<Arc<Mutex<Imsic>>>, aplic: &Option<Arc<Mutex<Aplic>>>) {
        let hart_ix = hart.hart_ix() as usize;
        let mut meip = false;
        let mut seip = false;
        if let Some(imsic) = imsic {
            let imsic = imsic.lock().unwrap();
            meip |= imsic.file(hart_ix, FileKind::Machine).topei().is_some();
            seip |= imsic.file(hart_ix, FileKind::Supervisor).topei().is_some();
            let hgeip = imsic.hgeip(hart_ix);
            let _ = hart.csrs_mut().poke(crate::csr::numbers::HGEIP, hgeip);
            let hgeie = hart.csrs().raw(crate::csr::numbers::HGEIE);
            hart.csrs_mut().set_mip_bit(12, hgeip & hgeie != 0);
        }
        if let Some(aplic) = aplic {
            meip |= aplic.lock().unwrap().external_pending(hart_ix);
        }
        hart.csrs_mut().set_mip_bit(11, meip);
        if seip {
            hart.csrs_mut().set_mip_bit(9, true);
        }
    }

    // One hart step plus the bookkeeping around it: time, timers, interrupt fabric, and
    // the MCM feed.
    fn step_hart(&mut self, ix: usize) {
        let time = self.time.fetch_add(1, Ordering::Relaxed) + 1;
        let hart = &mut self.harts[ix];
        hart.sync_time(time);
        Self::poll_interrupts(hart, &self.imsic, &self.aplic);
        let outcome = hart.step();
        if let Some(mcm) = &mut self.mcm {
            Self::feed_mcm(mcm, ix, time, &mut self.retire_tags[ix], &outcome);
        }
    }

    // In the self-driven (non-RTL) configuration, the hart's own accesses stand in for the
    // RTL events: stores bypass the merge buffer, reads carry the model data.
    fn feed_mcm(
        mcm: &mut Mcm,
        hart_ix: usize,
        time: u64,
        retire_tag: &mut u64,
        outcome: &StepOutcome,
    ) {
        let Some(instruction) = outcome.instruction else {
            return;
        };
        *retire_tag += 1;
        let tag = *retire_tag;
        let mut info = RetireInfo::default();
        for access in &outcome.mem_accesses {
            info = RetireInfo {
                virt_addr: access.va,
                phys_addr: access.pa,
                phys_addr2: access.pa2.unwrap_or(0),
                size: access.size,
                store_data: access.data,
            };
            if access.is_store {
                mcm.bypass_op(hart_ix, time, tag, access.pa, access.size, access.data);
            } else {
                mcm.read_op(hart_ix, time, tag, access.pa, access.size, access.data);
            }
        }
        if !instruction.is_store() {
            info.store_data = 0;
        }
        mcm.retire(hart_ix, time, tag, instruction, info, outcome.trapped);
    }

    //
    // Run loops.
    //

    /// Run until a stop condition. The scheduling mode comes from the configuration.
    pub fn run(&mut self) -> StopReason {
        let threaded = matches!(self.config.run_mode, RunMode::Threaded);
        if threaded && self.mcm.is_some() {
            warn!("MCM checking requires the round-robin scheduler; falling back");
        }
        let reason = if threaded && self.mcm.is_none() {
            self.run_threaded()
        } else {
            self.run_round_robin()
        };
        if let Some(mcm) = &mut self.mcm {
            mcm.final_checks();
        }
        info!(reason:? = reason; "run finished");
        reason
    }

    fn stop_reason(&self, steps_exhausted: bool) -> StopReason {
        if let Some(value) = self.session.tohost() {
            StopReason::ToHost(value)
        } else if steps_exhausted {
            StopReason::StepLimit
        } else {
            StopReason::Interrupted
        }
    }

    fn run_round_robin(&mut self) -> StopReason {
        let (seed, max_window) = match self.config.run_mode {
            RunMode::RoundRobin { seed, max_window } => (seed, max_window.max(1)),
            RunMode::Threaded => (0, 1),
        };
        let mut rng = StdRng::seed_from_u64(seed);
        let mut remaining = self.config.step_limit.unwrap_or(u64::MAX);
        while remaining > 0 {
            for ix in 0..self.harts.len() {
                let window = rng.gen_range(1..=max_window) as u64;
                for _ in 0..window.min(remaining) {
                    if self.session.stopped() {
                        return self.stop_reason(false);
                    }
                    self.step_hart(ix);
                    remaining -= 1;
                }
                if remaining == 0 {
                    break;
                }
            }
        }
        self.stop_reason(true)
    }

    fn run_threaded(&mut self) -> StopReason {
        let step_limit = self.config.step_limit.unwrap_or(u64::MAX);
        let session = &self.session;
        let time = &self.time;
        let imsic = &self.imsic;
        let aplic = &self.aplic;
        std::thread::scope(|scope| {
            for hart in &mut self.harts {
                scope.spawn(move || {
                    let mut steps = 0u64;
                    while !session.stopped() && steps < step_limit {
                        let now = time.fetch_add(1, Ordering::Relaxed) + 1;
                        hart.sync_time(now);
                        Self::poll_interrupts(hart, imsic, aplic);
                        hart.step();
                        steps += 1;
                    }
                });
            }
        });
        self.stop_reason(!self.session.stopped())
    }

    //
    // Snapshot surface.
    //

    pub fn snapshot(&self) -> SystemSnapshot {
        let imsic = self.imsic.as_ref().map(|i| i.lock().unwrap());
        SystemSnapshot::capture(
            &self.harts,
            &self.mem,
            imsic.as_deref(),
            self.time(),
        )
    }

    pub fn restore(&mut self, snapshot: &SystemSnapshot) {
        for (hart, hart_snapshot) in self.harts.iter_mut().zip(&snapshot.harts) {
            hart_snapshot.restore(hart);
        }
        snapshot.memory.restore(&self.mem);
        if let Some(imsic) = &self.imsic {
            imsic.lock().unwrap().restore(snapshot.imsic.clone());
        }
        self.time.store(snapshot.time, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::Specifier;
    use crate::Rv64;

    const TOHOST: u64 = 0x7000_1000;

    fn config() -> SystemConfig {
        SystemConfig {
            tohost: Some(TOHOST),
            step_limit: Some(10_000),
            ..SystemConfig::default()
        }
    }

    fn load_words<XL: Xlen>(system: &System<XL>, addr: u64, words: &[u32]) {
        for (ix, word) in words.iter().enumerate() {
            system.load(addr + 4 * ix as u64, &word.to_le_bytes());
        }
    }

    // lui x1, 0x70001 ; addi x2, x0, 1 ; sd x2, 0(x1) ; loop: j loop
    const HELLO_TOHOST: [u32; 4] = [0x7000_10B7, 0x0010_0113, 0x0020_B023, 0x0000_006F];

    #[test]
    fn test_hello_tohost() {
        let mut system: System<Rv64> = System::new(config(), vec![]);
        load_words(&system, 0x8000_0000, &HELLO_TOHOST);
        let reason = system.run();
        assert_eq!(reason, StopReason::ToHost(1));
        assert_eq!(reason.exit_code(), 0);
        assert!(system.time() >= 1);
    }

    #[test]
    fn test_step_limit() {
        let mut system: System<Rv64> = System::new(
            SystemConfig {
                step_limit: Some(100),
                ..SystemConfig::default()
            },
            vec![],
        );
        // An infinite loop.
        load_words(&system, 0x8000_0000, &[0x0000_006F]);
        assert_eq!(system.run(), StopReason::StepLimit);
    }

    #[test]
    fn test_round_robin_runs_all_harts() {
        let mut system: System<Rv64> = System::new(
            SystemConfig {
                hart_count: 2,
                step_limit: Some(1000),
                ..SystemConfig::default()
            },
            vec![],
        );
        // Both harts: addi x5, x0, 7 ; loop.
        load_words(&system, 0x8000_0000, &[0x0070_0293, 0x0000_006F]);
        system.run();
        for ix in 0..2 {
            assert_eq!(system.hart(ix).registers().x(Specifier::from_u5(5)), 7);
        }
    }

    #[test]
    fn test_threaded_mode_stops_on_tohost() {
        let mut system: System<Rv64> = System::new(
            SystemConfig {
                hart_count: 2,
                run_mode: RunMode::Threaded,
                ..config()
            },
            vec![],
        );
        load_words(&system, 0x8000_0000, &HELLO_TOHOST);
        let reason = system.run();
        assert_eq!(reason, StopReason::ToHost(1));
    }

    #[test]
    fn test_mcm_self_run_is_clean() {
        let mut system: System<Rv64> = System::new(
            SystemConfig {
                mcm: Some(McmConfig::default()),
                ..config()
            },
            vec![],
        );
        // Store then load back, then halt.
        // lui x1, 0x70001 ; addi x2, x0, 5 ; sw x2, 16(x1) ; lw x3, 16(x1) ;
        // addi x2, x0, 1 ; sd x2, 0(x1)
        load_words(
            &system,
            0x8000_0000,
            &[
                0x7000_10B7,
                0x0050_0113,
                0x0020_A823,
                0x0100_A183,
                0x0010_0113,
                0x0020_B023,
            ],
        );
        let reason = system.run();
        assert_eq!(reason, StopReason::ToHost(1));
        assert_eq!(system.hart(0).registers().x(Specifier::from_u5(3)), 5);
        assert!(
            system.mcm().unwrap().violations().is_empty(),
            "{:?}",
            system.mcm().unwrap().violations()
        );
    }

    #[test]
    fn test_system_snapshot_roundtrip() {
        let mut system: System<Rv64> = System::new(
            SystemConfig {
                step_limit: Some(50),
                imsic: Some(ImsicConfig {
                    m_base: 0x2400_0000,
                    s_base: 0x2800_0000,
                    guests_per_hart: 1,
                    num_ids: 63,
                }),
                ..SystemConfig::default()
            },
            vec![],
        );
        load_words(&system, 0x8000_0000, &[0x0070_0293, 0x0000_006F]);
        system.run();
        let snapshot = system.snapshot();
        // Disturb state, restore, recapture.
        system.hart_mut(0).registers_mut().set_x(Specifier::from_u5(5), 0);
        system.memory().poke(0x8000_0000, &[0; 8]).unwrap();
        system.restore(&snapshot);
        assert_eq!(system.snapshot(), snapshot);
    }

    #[test]
    fn test_imsic_delivery_raises_meip() {
        let mut system: System<Rv64> = System::new(
            SystemConfig {
                step_limit: Some(1),
                imsic: Some(ImsicConfig {
                    m_base: 0x2400_0000,
                    s_base: 0x2800_0000,
                    guests_per_hart: 0,
                    num_ids: 63,
                }),
                ..SystemConfig::default()
            },
            vec![],
        );
        load_words(&system, 0x8000_0000, &[0x0000_0013]);
        {
            let imsic = system.imsic().unwrap().clone();
            let mut imsic = imsic.lock().unwrap();
            let file = imsic.file_mut(0, FileKind::Machine);
            file.set_eidelivery(1);
            file.set_enabled(7, true);
            file.set_pending(7, true);
        }
        system.run();
        assert_ne!(
            system.hart(0).csrs().raw(crate::csr::numbers::MIP) & (1 << 11),
            0
        );
    }
}
