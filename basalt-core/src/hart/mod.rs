//! The architectural hart: fetch, decode, execute, trap delivery, and privilege transitions.

mod execute;

use crate::csr::numbers as csr;
use crate::csr::status::{Atp, Hstatus, Mstatus};
use crate::csr::{CsrConfig, CsrFile};
use crate::instruction::{DecodeCache, Instruction};
use crate::memory::{Memory, PAGE_SIZE};
use crate::registers::{FpRegisters, Registers, VecRegisters};
use crate::triggers::{TriggerAction, Triggers, TriggerWatch};
use crate::virt_mem::{AccessType, AtMode, WalkConfig, WalkError, Walker};
use crate::{ExecMode, PrivilegeLevel, Xlen};
use execute::Executor;
use log::{debug, trace};
use std::sync::Arc;

/// Configuration options of a single hart, fixed at construction.
#[derive(Debug, Clone)]
pub struct Config {
    /// > The mhartid CSR is an MXLEN-bit read-only register containing the integer ID of the
    /// > hardware thread running the code. Hart IDs must be unique within the execution
    /// > environment, and at least one hart must have a hart ID of zero.
    pub hart_ix: u64,
    /// Address to which the hart's PC is reset.
    pub reset_vector: u64,
    /// Address of the handler for non-maskable interrupts.
    pub nmi_vector: u64,
    /// If `true`, non-naturally-aligned loads and stores are supported; otherwise they
    /// raise address-misaligned exceptions.
    pub support_misaligned_memory_access: bool,
    /// LR reservation granule in bytes. Configurable because the bound may come from the
    /// hart or from the platform's cache line.
    pub lr_res_size: u64,
    /// Number of debug triggers.
    pub trigger_count: usize,
    /// Vector register width in bits.
    pub vlen: u32,
    pub csr: CsrConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hart_ix: 0,
            reset_vector: 0x8000_0000,
            nmi_vector: 0,
            support_misaligned_memory_access: true,
            lr_res_size: 64,
            trigger_count: 4,
            vlen: 128,
            csr: CsrConfig::default(),
        }
    }
}

/// Result of executing a single instruction. [`Ok`] if execution went normally, [`Err`] if an
/// exception occurred.
pub type ExecutionResult<T = ()> = Result<T, Exception>;

/// Architectural exceptions. Payloads carry what ends up in `*tval` (and `*tval2`/`htval`
/// for the guest faults).
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Exception {
    InstructionAddressMisaligned(u64),
    InstructionAccessFault(u64),
    IllegalInstruction(Option<u32>),
    Breakpoint(u64),
    LoadAddressMisaligned(u64),
    LoadAccessFault(u64),
    StoreOrAmoAddressMisaligned(u64),
    StoreOrAmoAccessFault(u64),
    EnvironmentCallFromUMode,
    EnvironmentCallFromSMode,
    EnvironmentCallFromVsMode,
    EnvironmentCallFromMMode,
    InstructionPageFault(u64),
    LoadPageFault(u64),
    StoreOrAmoPageFault(u64),
    /// Hypervisor: the faulting VA plus the guest physical address.
    InstructionGuestPageFault { va: u64, gpa: u64 },
    LoadGuestPageFault { va: u64, gpa: u64 },
    StoreOrAmoGuestPageFault { va: u64, gpa: u64 },
    VirtualInstruction(Option<u32>),
}

impl Exception {
    pub const INSTRUCTION_ADDRESS_MISALIGNED: u64 = 0;
    pub const INSTRUCTION_ACCESS_FAULT: u64 = 1;
    pub const ILLEGAL_INSTRUCTION: u64 = 2;
    pub const BREAKPOINT: u64 = 3;
    pub const LOAD_ADDRESS_MISALIGNED: u64 = 4;
    pub const LOAD_ACCESS_FAULT: u64 = 5;
    pub const STORE_OR_AMO_ADDRESS_MISALIGNED: u64 = 6;
    pub const STORE_OR_AMO_ACCESS_FAULT: u64 = 7;
    pub const ENVIRONMENT_CALL_FROM_U_MODE: u64 = 8;
    pub const ENVIRONMENT_CALL_FROM_S_MODE: u64 = 9;
    pub const ENVIRONMENT_CALL_FROM_VS_MODE: u64 = 10;
    pub const ENVIRONMENT_CALL_FROM_M_MODE: u64 = 11;
    pub const INSTRUCTION_PAGE_FAULT: u64 = 12;
    pub const LOAD_PAGE_FAULT: u64 = 13;
    pub const STORE_OR_AMO_PAGE_FAULT: u64 = 15;
    pub const INSTRUCTION_GUEST_PAGE_FAULT: u64 = 20;
    pub const LOAD_GUEST_PAGE_FAULT: u64 = 21;
    pub const VIRTUAL_INSTRUCTION: u64 = 22;
    pub const STORE_OR_AMO_GUEST_PAGE_FAULT: u64 = 23;

    /// Returns the exception code (cause) for this exception.
    pub const fn code(&self) -> u64 {
        match self {
            Self::InstructionAddressMisaligned(_) => Self::INSTRUCTION_ADDRESS_MISALIGNED,
            Self::InstructionAccessFault(_) => Self::INSTRUCTION_ACCESS_FAULT,
            Self::IllegalInstruction(_) => Self::ILLEGAL_INSTRUCTION,
            Self::Breakpoint(_) => Self::BREAKPOINT,
            Self::LoadAddressMisaligned(_) => Self::LOAD_ADDRESS_MISALIGNED,
            Self::LoadAccessFault(_) => Self::LOAD_ACCESS_FAULT,
            Self::StoreOrAmoAddressMisaligned(_) => Self::STORE_OR_AMO_ADDRESS_MISALIGNED,
            Self::StoreOrAmoAccessFault(_) => Self::STORE_OR_AMO_ACCESS_FAULT,
            Self::EnvironmentCallFromUMode => Self::ENVIRONMENT_CALL_FROM_U_MODE,
            Self::EnvironmentCallFromSMode => Self::ENVIRONMENT_CALL_FROM_S_MODE,
            Self::EnvironmentCallFromVsMode => Self::ENVIRONMENT_CALL_FROM_VS_MODE,
            Self::EnvironmentCallFromMMode => Self::ENVIRONMENT_CALL_FROM_M_MODE,
            Self::InstructionPageFault(_) => Self::INSTRUCTION_PAGE_FAULT,
            Self::LoadPageFault(_) => Self::LOAD_PAGE_FAULT,
            Self::StoreOrAmoPageFault(_) => Self::STORE_OR_AMO_PAGE_FAULT,
            Self::InstructionGuestPageFault { .. } => Self::INSTRUCTION_GUEST_PAGE_FAULT,
            Self::LoadGuestPageFault { .. } => Self::LOAD_GUEST_PAGE_FAULT,
            Self::StoreOrAmoGuestPageFault { .. } => Self::STORE_OR_AMO_GUEST_PAGE_FAULT,
            Self::VirtualInstruction(_) => Self::VIRTUAL_INSTRUCTION,
        }
    }

    fn tval(&self) -> u64 {
        match *self {
            Self::IllegalInstruction(raw) | Self::VirtualInstruction(raw) => {
                raw.map(u64::from).unwrap_or(0)
            }
            Self::Breakpoint(addr) => addr,
            Self::InstructionAddressMisaligned(a)
            | Self::InstructionAccessFault(a)
            | Self::LoadAddressMisaligned(a)
            | Self::StoreOrAmoAddressMisaligned(a)
            | Self::LoadAccessFault(a)
            | Self::StoreOrAmoAccessFault(a)
            | Self::InstructionPageFault(a)
            | Self::LoadPageFault(a)
            | Self::StoreOrAmoPageFault(a) => a,
            Self::InstructionGuestPageFault { va, .. }
            | Self::LoadGuestPageFault { va, .. }
            | Self::StoreOrAmoGuestPageFault { va, .. } => va,
            Self::EnvironmentCallFromUMode
            | Self::EnvironmentCallFromSMode
            | Self::EnvironmentCallFromVsMode
            | Self::EnvironmentCallFromMMode => 0,
        }
    }

    /// The guest physical address for the guest-page-fault variants.
    fn gpa(&self) -> Option<u64> {
        match *self {
            Self::InstructionGuestPageFault { gpa, .. }
            | Self::LoadGuestPageFault { gpa, .. }
            | Self::StoreOrAmoGuestPageFault { gpa, .. } => Some(gpa),
            _ => None,
        }
    }
}

/// Interrupt causes, in no particular order; see [`Hart::pending_interrupt`] for priority.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Interrupt {
    SupervisorSoftware,
    VirtualSupervisorSoftware,
    MachineSoftware,
    SupervisorTimer,
    VirtualSupervisorTimer,
    MachineTimer,
    SupervisorExternal,
    VirtualSupervisorExternal,
    MachineExternal,
    SupervisorGuestExternal,
    LocalCounterOverflow,
}

impl Interrupt {
    pub fn code(&self) -> u64 {
        match self {
            Self::SupervisorSoftware => 1,
            Self::VirtualSupervisorSoftware => 2,
            Self::MachineSoftware => 3,
            Self::SupervisorTimer => 5,
            Self::VirtualSupervisorTimer => 6,
            Self::MachineTimer => 7,
            Self::SupervisorExternal => 9,
            Self::VirtualSupervisorExternal => 10,
            Self::MachineExternal => 11,
            Self::SupervisorGuestExternal => 12,
            Self::LocalCounterOverflow => 13,
        }
    }

    /// The RISC-V delivery priority order: external before software before timer, machine
    /// before supervisor before virtual-supervisor.
    pub const PRIORITY: [Interrupt; 11] = [
        Interrupt::MachineExternal,
        Interrupt::MachineSoftware,
        Interrupt::MachineTimer,
        Interrupt::SupervisorGuestExternal,
        Interrupt::SupervisorExternal,
        Interrupt::SupervisorSoftware,
        Interrupt::SupervisorTimer,
        Interrupt::VirtualSupervisorExternal,
        Interrupt::VirtualSupervisorSoftware,
        Interrupt::VirtualSupervisorTimer,
        Interrupt::LocalCounterOverflow,
    ];
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TrapCause {
    Exception(Exception),
    Interrupt(Interrupt),
}

/// One data-memory access performed by an instruction, reported in the step outcome so the
/// MCM and the performance adapter can observe it.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct MemAccess {
    pub va: u64,
    pub pa: u64,
    /// Physical address of the second page for page-crossing accesses, if any.
    pub pa2: Option<u64>,
    pub size: u32,
    pub data: u64,
    pub is_store: bool,
}

/// What happened during one [`Hart::step`].
#[derive(Debug, Clone, Default)]
pub struct StepOutcome {
    /// The decoded instruction, if fetch+decode succeeded.
    pub instruction: Option<Instruction>,
    /// `true` if the instruction (or its fetch) trapped.
    pub trapped: bool,
    /// `true` if the instruction retired (committed its results).
    pub retired: bool,
    /// Data-memory accesses performed by the instruction.
    pub mem_accesses: Vec<MemAccess>,
    /// `true` while the hart is parked in WFI.
    pub waiting: bool,
}

/// An architectural hart, generic over the register width.
#[derive(Debug)]
pub struct Hart<X: Xlen> {
    config: Config,
    mem: Arc<Memory>,
    registers: Registers<X>,
    fp_registers: FpRegisters,
    vec_registers: VecRegisters,
    csrs: CsrFile<X>,
    triggers: Triggers,
    privilege: PrivilegeLevel,
    virt: bool,
    debug_mode: bool,
    waiting_for_interrupt: bool,
    decode_cache: DecodeCache,
    /// Accesses recorded by the currently-executing instruction.
    mem_accesses: Vec<MemAccess>,
    /// Set when a trigger entered debug mode mid-instruction; suppresses the trap that
    /// would otherwise be delivered for the aborted instruction.
    entered_debug: bool,
}

impl<X: Xlen> Hart<X> {
    pub fn new(mem: Arc<Memory>, config: Config) -> Self {
        let csrs = CsrFile::new(config.hart_ix, config.csr.clone());
        Self {
            registers: Registers::new(config.reset_vector),
            fp_registers: FpRegisters::new(),
            vec_registers: VecRegisters::new(config.vlen),
            csrs,
            triggers: Triggers::new(config.trigger_count),
            privilege: PrivilegeLevel::Machine,
            virt: false,
            debug_mode: false,
            waiting_for_interrupt: false,
            decode_cache: DecodeCache::new(),
            mem_accesses: Vec::new(),
            entered_debug: false,
            config,
            mem,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn hart_ix(&self) -> u64 {
        self.config.hart_ix
    }

    pub fn registers(&self) -> &Registers<X> {
        &self.registers
    }

    pub fn registers_mut(&mut self) -> &mut Registers<X> {
        &mut self.registers
    }

    pub fn fp_registers(&self) -> &FpRegisters {
        &self.fp_registers
    }

    pub fn fp_registers_mut(&mut self) -> &mut FpRegisters {
        &mut self.fp_registers
    }

    pub fn vec_registers(&self) -> &VecRegisters {
        &self.vec_registers
    }

    pub fn vec_registers_mut(&mut self) -> &mut VecRegisters {
        &mut self.vec_registers
    }

    /// Raw trigger state for snapshots.
    pub fn triggers_snapshot(&self) -> Vec<(u64, u64, u64)> {
        self.triggers.snapshot()
    }

    pub fn csrs(&self) -> &CsrFile<X> {
        &self.csrs
    }

    pub fn csrs_mut(&mut self) -> &mut CsrFile<X> {
        &mut self.csrs
    }

    pub fn triggers_mut(&mut self) -> &mut Triggers {
        &mut self.triggers
    }

    pub fn memory(&self) -> &Arc<Memory> {
        &self.mem
    }

    /// The current operating mode (privilege level plus virtualization state).
    pub fn mode(&self) -> ExecMode {
        ExecMode::new(self.privilege, self.virt)
    }

    pub fn privilege(&self) -> PrivilegeLevel {
        self.privilege
    }

    pub fn virt(&self) -> bool {
        self.virt
    }

    pub fn debug_mode(&self) -> bool {
        self.debug_mode
    }

    pub(crate) fn set_mode(&mut self, privilege: PrivilegeLevel, virt: bool) {
        self.privilege = privilege;
        self.virt = virt && privilege != PrivilegeLevel::Machine;
    }

    /// Reset to the architectural power-on state.
    pub fn reset(&mut self) {
        self.registers = Registers::new(self.config.reset_vector);
        self.fp_registers = FpRegisters::new();
        self.vec_registers = VecRegisters::new(self.config.vlen);
        self.privilege = PrivilegeLevel::Machine;
        self.virt = false;
        self.debug_mode = false;
        self.waiting_for_interrupt = false;
        self.decode_cache.clear();
        self.csrs.reset();
    }

    fn mstatus(&self) -> Mstatus {
        Mstatus(self.csrs.raw(csr::MSTATUS))
    }

    fn set_mstatus(&mut self, status: Mstatus) {
        self.csrs.store(csr::MSTATUS, status.0);
    }

    fn hstatus(&self) -> Hstatus {
        Hstatus(self.csrs.raw(csr::HSTATUS))
    }

    fn set_hstatus(&mut self, status: Hstatus) {
        self.csrs.store(csr::HSTATUS, status.0);
    }

    fn vsstatus(&self) -> Mstatus {
        Mstatus(self.csrs.raw(csr::VSSTATUS))
    }

    fn set_vsstatus(&mut self, status: Mstatus) {
        self.csrs.store(csr::VSSTATUS, status.0);
    }

    /// The privilege level at which loads and stores execute (MPRV redirection).
    fn effective_data_mode(&self) -> ExecMode {
        let status = self.mstatus();
        if self.privilege == PrivilegeLevel::Machine && status.mprv() {
            ExecMode::new(status.mpp(), status.mpv() && status.mpp() != PrivilegeLevel::Machine)
        } else {
            self.mode()
        }
    }

    //
    // Address translation.
    //

    fn walk_config(&self, mode: ExecMode, fetch: bool) -> WalkConfig {
        let rv64 = X::is_rv64();
        let menvcfg = self.csrs.raw(csr::MENVCFG);
        let henvcfg = self.csrs.raw(csr::HENVCFG);
        // ADUE is bit 61, PBMTE bit 62 of menvcfg/henvcfg.
        let (s_atp, adue, pbmte) = if mode.virt {
            let vsatp = Atp(self.csrs.raw(csr::VSATP));
            (vsatp, henvcfg >> 61 & 1 == 1, henvcfg >> 62 & 1 == 1)
        } else {
            let satp = Atp(self.csrs.raw(csr::SATP));
            (satp, menvcfg >> 61 & 1 == 1, menvcfg >> 62 & 1 == 1)
        };
        let (s_mode, s_ppn) = if mode.level == PrivilegeLevel::Machine {
            (AtMode::Bare, 0)
        } else if rv64 {
            (
                AtMode::from_satp(s_atp.mode_rv64(), true).unwrap_or(AtMode::Bare),
                s_atp.ppn_rv64(),
            )
        } else {
            (
                AtMode::from_satp(s_atp.mode_rv32(), false).unwrap_or(AtMode::Bare),
                s_atp.ppn_rv32(),
            )
        };
        let (g_mode, g_ppn) = if mode.virt {
            let hgatp = Atp(self.csrs.raw(csr::HGATP));
            if rv64 {
                (
                    AtMode::from_hgatp(hgatp.mode_rv64(), true).unwrap_or(AtMode::Bare),
                    hgatp.ppn_rv64(),
                )
            } else {
                (
                    AtMode::from_hgatp(hgatp.mode_rv32(), false).unwrap_or(AtMode::Bare),
                    hgatp.ppn_rv32(),
                )
            }
        } else {
            (AtMode::Bare, 0)
        };
        let status = if mode.virt {
            self.vsstatus()
        } else {
            self.mstatus()
        };
        WalkConfig {
            s_mode,
            s_ppn,
            g_mode,
            g_ppn,
            sum: !fetch && status.sum(),
            mxr: !fetch && (status.mxr() || (mode.virt && self.mstatus().mxr())),
            adue,
            g_adue: henvcfg >> 61 & 1 == 1,
            pbmte,
            update: true,
        }
    }

    /// Translate a data or fetch address, mapping walker errors onto architectural
    /// exceptions.
    pub fn translate(
        &self,
        va: u64,
        access: AccessType,
        fetch: bool,
    ) -> Result<u64, Exception> {
        let mode = if fetch {
            self.mode()
        } else {
            self.effective_data_mode()
        };
        if mode.level == PrivilegeLevel::Machine && !mode.virt {
            return Ok(X::truncate(va));
        }
        let cfg = self.walk_config(mode, fetch);
        let walker = Walker::new(&self.mem, cfg);
        let user = mode.level == PrivilegeLevel::User;
        walker
            .translate(X::truncate(va), user, access)
            .map(|t| t.pa)
            .map_err(|err| match (err, access) {
                (WalkError::PageFault, AccessType::Read) => Exception::LoadPageFault(va),
                (WalkError::PageFault, AccessType::Write) => Exception::StoreOrAmoPageFault(va),
                (WalkError::PageFault, AccessType::Execute) => Exception::InstructionPageFault(va),
                (WalkError::GuestPageFault { gpa, .. }, AccessType::Read) => {
                    Exception::LoadGuestPageFault { va, gpa }
                }
                (WalkError::GuestPageFault { gpa, .. }, AccessType::Write) => {
                    Exception::StoreOrAmoGuestPageFault { va, gpa }
                }
                (WalkError::GuestPageFault { gpa, .. }, AccessType::Execute) => {
                    Exception::InstructionGuestPageFault { va, gpa }
                }
                (WalkError::AccessFault, AccessType::Read) => Exception::LoadAccessFault(va),
                (WalkError::AccessFault, AccessType::Write) => Exception::StoreOrAmoAccessFault(va),
                (WalkError::AccessFault, AccessType::Execute) => {
                    Exception::InstructionAccessFault(va)
                }
            })
    }

    //
    // Stepping.
    //

    /// Execute one instruction: fetch (with translation), decode (cached), execute, commit,
    /// and either retire or deliver a trap.
    pub fn step(&mut self) -> StepOutcome {
        self.mem_accesses.clear();
        let mut outcome = StepOutcome::default();

        // Interrupts are taken between instructions.
        if let Some(interrupt) = self.pending_interrupt() {
            self.waiting_for_interrupt = false;
            self.trap(TrapCause::Interrupt(interrupt), 0);
            outcome.trapped = true;
            return outcome;
        }

        if self.waiting_for_interrupt {
            outcome.waiting = true;
            return outcome;
        }

        let pc = self.registers.pc();

        // Execute-address triggers fire before the fetch.
        if let Some(action) = self.triggers.match_inst_addr(pc, self.mode()) {
            if self.apply_trigger_action(action, pc) {
                outcome.trapped = true;
                return outcome;
            }
        }

        self.entered_debug = false;
        let fetched = self.fetch_instruction(pc);

        // Opcode triggers fire on the fetched encoding, before decode.
        if let Ok((_, raw)) = fetched {
            if let Some(action) = self.triggers.match_inst_opcode(raw as u64, self.mode()) {
                if self.apply_trigger_action(action, pc) {
                    outcome.trapped = true;
                }
                return outcome;
            }
        }

        let decoded = fetched.and_then(|(phys_pc, raw)| {
            if let Some(cached) = self.decode_cache.lookup(phys_pc, raw) {
                return Ok(cached);
            }
            let instruction = Instruction::decode(raw)
                .map_err(|_| Exception::IllegalInstruction(Some(raw)))?;
            self.decode_cache.insert(phys_pc, raw, instruction);
            Ok(instruction)
        });

        let result = decoded.and_then(|instruction| {
            outcome.instruction = Some(instruction);
            let mut executor = Executor { hart: self };
            executor.execute(instruction, pc)
        });

        self.bump_counters(result.is_ok());

        match result {
            Ok(()) => {
                outcome.retired = true;
                if let Some(action) = self.triggers.tick_icount(self.mode()) {
                    self.apply_trigger_action(action, self.registers.pc());
                }
            }
            // A trigger already moved the hart into debug mode; the aborted instruction
            // does not additionally trap.
            Err(_) if self.entered_debug => {}
            Err(exception) => {
                self.trap(TrapCause::Exception(exception), pc);
                outcome.trapped = true;
            }
        }
        outcome.mem_accesses = std::mem::take(&mut self.mem_accesses);
        outcome.waiting = self.waiting_for_interrupt;
        outcome
    }

    /// Execute a single decoded instruction at `pc` without fetching, counting, or trap
    /// delivery. The caller owns the surrounding state machine; this is the entry point for
    /// the performance-model adapter.
    pub fn execute_decoded(&mut self, instruction: Instruction, pc: u64) -> ExecutionResult {
        let mut executor = Executor { hart: self };
        executor.execute(instruction, pc)
    }

    /// Data-memory accesses recorded by the last [`execute_decoded`](Self::execute_decoded)
    /// call (cleared on [`step`](Self::step)).
    pub fn take_mem_accesses(&mut self) -> Vec<MemAccess> {
        std::mem::take(&mut self.mem_accesses)
    }

    // Returns true if the trigger action preempts the instruction.
    fn apply_trigger_action(&mut self, action: TriggerAction, pc: u64) -> bool {
        match action {
            TriggerAction::Breakpoint => {
                self.trap(TrapCause::Exception(Exception::Breakpoint(pc)), pc);
                true
            }
            TriggerAction::EnterDebug => {
                self.enter_debug_mode(pc, 2);
                true
            }
        }
    }

    /// Enter debug mode; `cause` goes to DCSR.CAUSE.
    pub fn enter_debug_mode(&mut self, pc: u64, cause: u64) {
        self.entered_debug = true;
        self.debug_mode = true;
        self.csrs.set_debug_mode(true);
        self.csrs.store(csr::DPC, pc);
        let dcsr = self.csrs.raw(csr::DCSR);
        let dcsr = (dcsr & !(0x7 << 6)) | ((cause & 0x7) << 6);
        // PRV field (bits 1:0) and V (bit 5) record the mode we came from.
        let dcsr = (dcsr & !0x23)
            | (self.privilege as u64 & 0x3)
            | ((self.virt as u64) << 5);
        self.csrs.store(csr::DCSR, dcsr);
        // Debug mode executes with M privileges.
        self.set_mode(PrivilegeLevel::Machine, false);
    }

    fn bump_counters(&mut self, retired: bool) {
        let inhibit = self.csrs.raw(csr::MCOUNTINHIBIT);
        if inhibit & 1 == 0 {
            let cycle = self.csrs.raw(csr::MCYCLE);
            self.csrs.store(csr::MCYCLE, cycle.wrapping_add(1));
        }
        if retired && inhibit & 4 == 0 {
            let instret = self.csrs.raw(csr::MINSTRET);
            self.csrs.store(csr::MINSTRET, instret.wrapping_add(1));
        }
    }

    /// Fetch the 4-byte encoding at `pc`, translating per page so page-crossing fetches
    /// fault on the right address.
    fn fetch_instruction(&mut self, pc: u64) -> Result<(u64, u32), Exception> {
        if pc % 4 != 0 {
            return Err(Exception::InstructionAddressMisaligned(pc));
        }
        let phys_pc = self.translate(pc, AccessType::Execute, true)?;
        if !self.mem.pma(phys_pc).exec {
            return Err(Exception::InstructionAccessFault(pc));
        }
        let mut buf = [0u8; 4];
        // A 4-byte-aligned fetch never crosses a page, but keep the check for the general
        // shape (and for future compressed support).
        debug_assert!(pc % PAGE_SIZE <= PAGE_SIZE - 4);
        self.mem
            .read(phys_pc, &mut buf)
            .map_err(|_| Exception::InstructionAccessFault(pc))?;
        Ok((phys_pc, u32::from_le_bytes(buf)))
    }

    //
    // Data memory, used by the executor.
    //

    fn check_ldst_trigger(&mut self, va: u64, watch: TriggerWatch) -> ExecutionResult {
        if let Some(action) = self.triggers.match_ldst_addr(va, watch, self.mode()) {
            return Err(self.data_trigger_abort(action, va));
        }
        Ok(())
    }

    // Abort the current instruction for a tripped load/store trigger. The returned
    // breakpoint exception is delivered by the step loop, except when the action entered
    // debug mode (then `entered_debug` suppresses it).
    fn data_trigger_abort(&mut self, action: TriggerAction, va: u64) -> Exception {
        if action == TriggerAction::EnterDebug {
            self.enter_debug_mode(self.registers.pc(), 2);
        }
        Exception::Breakpoint(va)
    }

    /// Read `size` bytes at virtual address `va` for a load.
    pub(crate) fn read_memory(&mut self, va: u64, size: u32) -> ExecutionResult<u64> {
        let va = X::truncate(va);
        if !self.config.support_misaligned_memory_access && va % size as u64 != 0 {
            return Err(Exception::LoadAddressMisaligned(va));
        }
        self.check_ldst_trigger(va, TriggerWatch::Load)?;
        let mut buf = [0u8; 8];
        let (pa, pa2) = self.access_data(va, size, AccessType::Read, |hart, pa, chunk, off| {
            hart.mem
                .read(pa, &mut buf[off..off + chunk])
                .map_err(|_| Exception::LoadAccessFault(va))
        })?;
        let value = u64::from_le_bytes(buf);
        if let Some(action) = self.triggers.match_ldst_data(value, TriggerWatch::Load, self.mode())
        {
            return Err(self.data_trigger_abort(action, va));
        }
        self.mem_accesses.push(MemAccess {
            va,
            pa,
            pa2,
            size,
            data: value,
            is_store: false,
        });
        trace!(va, pa, size, value; "load");
        Ok(value)
    }

    /// Write the low `size` bytes of `value` at virtual address `va` for a store.
    pub(crate) fn write_memory(&mut self, va: u64, size: u32, value: u64) -> ExecutionResult {
        let va = X::truncate(va);
        if !self.config.support_misaligned_memory_access && va % size as u64 != 0 {
            return Err(Exception::StoreOrAmoAddressMisaligned(va));
        }
        self.check_ldst_trigger(va, TriggerWatch::Store)?;
        if let Some(action) = self.triggers.match_ldst_data(value, TriggerWatch::Store, self.mode())
        {
            return Err(self.data_trigger_abort(action, va));
        }
        let bytes = value.to_le_bytes();
        let (pa, pa2) = self.access_data(va, size, AccessType::Write, |hart, pa, chunk, off| {
            hart.mem
                .write(pa, &bytes[off..off + chunk])
                .map_err(|_| Exception::StoreOrAmoAccessFault(va))
        })?;
        self.mem_accesses.push(MemAccess {
            va,
            pa,
            pa2,
            size,
            data: value,
            is_store: true,
        });
        trace!(va, pa, size, value; "store");
        Ok(())
    }

    // Translate (splitting page-crossing accesses), run PMA checks, and call `op` per
    // contiguous physical chunk. Returns the physical address (and second-page address).
    fn access_data(
        &mut self,
        va: u64,
        size: u32,
        access: AccessType,
        mut op: impl FnMut(&mut Self, u64, usize, usize) -> ExecutionResult,
    ) -> ExecutionResult<(u64, Option<u64>)> {
        let first_len = ((PAGE_SIZE - va % PAGE_SIZE) as usize).min(size as usize);
        let pa = self.translate(va, access, false)?;
        self.check_pma(va, pa, access)?;
        op(self, pa, first_len, 0)?;
        let mut pa2 = None;
        if first_len < size as usize {
            let va2 = X::truncate(va + first_len as u64);
            let second = self.translate(va2, access, false)?;
            self.check_pma(va2, second, access)?;
            op(self, second, size as usize - first_len, first_len)?;
            pa2 = Some(second);
        }
        Ok((pa, pa2))
    }

    fn check_pma(&self, va: u64, pa: u64, access: AccessType) -> ExecutionResult {
        let pma = self.mem.pma(pa);
        let allowed = match access {
            AccessType::Read => pma.read,
            AccessType::Write => pma.write,
            AccessType::Execute => pma.exec,
        };
        if allowed {
            Ok(())
        } else {
            debug!(va, pa, access:%; "PMA forbids access");
            Err(match access {
                AccessType::Read => Exception::LoadAccessFault(va),
                AccessType::Write => Exception::StoreOrAmoAccessFault(va),
                AccessType::Execute => Exception::InstructionAccessFault(va),
            })
        }
    }

    pub(crate) fn record_amo_access(&mut self, va: u64, pa: u64, size: u32, data: u64) {
        self.mem_accesses.push(MemAccess {
            va,
            pa,
            pa2: None,
            size,
            data,
            is_store: true,
        });
    }

    //
    // Interrupts.
    //

    /// The highest-priority deliverable interrupt, if any.
    pub fn pending_interrupt(&self) -> Option<Interrupt> {
        let pending = self.csrs.raw(csr::MIP) & self.csrs.effective_interrupt_enable();
        if pending == 0 {
            return None;
        }
        let mideleg = self.csrs.raw(csr::MIDELEG);
        let hideleg = self.csrs.raw(csr::HIDELEG);
        let mstatus = self.mstatus();
        let sie = mstatus.sie();
        let mie = mstatus.mie();
        let vsie = self.vsstatus().sie();
        for interrupt in Interrupt::PRIORITY {
            let bit = 1u64 << interrupt.code();
            if pending & bit == 0 {
                continue;
            }
            let deliverable = if mideleg & bit == 0 {
                // Machine level.
                self.privilege < PrivilegeLevel::Machine
                    || (self.privilege == PrivilegeLevel::Machine && mie)
            } else if hideleg & bit == 0 {
                // HS level. VS/VU modes always rank below HS.
                self.virt
                    || self.privilege < PrivilegeLevel::Supervisor
                    || (self.privilege == PrivilegeLevel::Supervisor && sie)
            } else {
                // VS level: only deliverable inside the guest.
                self.virt
                    && (self.privilege < PrivilegeLevel::Supervisor
                        || (self.privilege == PrivilegeLevel::Supervisor && vsie))
            };
            if deliverable {
                return Some(interrupt);
            }
        }
        None
    }

    //
    // Trap delivery.
    //

    /// Compose `*cause`/`*tval`/`*epc`, update the status stack, and redirect the PC.
    pub fn trap(&mut self, cause: TrapCause, pc: u64) {
        let code = match cause {
            TrapCause::Exception(e) => e.code(),
            TrapCause::Interrupt(i) => i.code(),
        };
        let is_interrupt = matches!(cause, TrapCause::Interrupt(_));
        let interrupt_bit = 1u64 << (X::BITS - 1);

        let medeleg = self.csrs.raw(csr::MEDELEG);
        let mideleg = self.csrs.raw(csr::MIDELEG);
        let hedeleg = self.csrs.raw(csr::HEDELEG);
        let hideleg = self.csrs.raw(csr::HIDELEG);

        // Traps from M-mode always land in M-mode.
        let delegated = self.privilege != PrivilegeLevel::Machine
            && if is_interrupt {
                mideleg >> code & 1 == 1
            } else {
                medeleg >> code & 1 == 1
            };
        let to_vs = delegated
            && self.virt
            && if is_interrupt {
                hideleg >> code & 1 == 1
            } else {
                hedeleg >> code & 1 == 1
            };

        let tval = match cause {
            TrapCause::Exception(e) => e.tval(),
            TrapCause::Interrupt(_) => 0,
        };
        let gpa = match cause {
            TrapCause::Exception(e) => e.gpa(),
            TrapCause::Interrupt(_) => None,
        };

        debug!(code, is_interrupt, delegated, to_vs, pc; "trap");

        let prev_privilege = self.privilege;
        let prev_virt = self.virt;

        if !delegated {
            // Trap to M.
            let mut status = self.mstatus();
            status.set_mpie(status.mie());
            status.set_mie(false);
            status.set_mpp(prev_privilege);
            status.set_mpv(prev_virt);
            status.set_gva(gpa.is_some());
            self.set_mstatus(status);
            self.csrs.store(csr::MEPC, pc);
            self.csrs
                .store(csr::MCAUSE, if is_interrupt { interrupt_bit | code } else { code });
            self.csrs.store(csr::MTVAL, tval);
            self.csrs.store(csr::MTVAL2, gpa.map(|g| g >> 2).unwrap_or(0));
            self.csrs.store(csr::MTINST, 0);
            self.set_mode(PrivilegeLevel::Machine, false);
            let pc = Self::trap_vector(self.csrs.raw(csr::MTVEC), is_interrupt, code);
            self.registers.set_pc(pc);
        } else if !to_vs {
            // Trap to HS. Interrupt codes for the VS bits stay as-is (they were delegated
            // by mideleg only when hideleg is clear here).
            let mut status = self.mstatus();
            status.set_spie(status.sie());
            status.set_sie(false);
            status.set_spp(prev_privilege);
            self.set_mstatus(status);
            if self.csrs.config().enable_hypervisor {
                let mut hstatus = self.hstatus();
                hstatus.set_spv(prev_virt);
                hstatus.set_gva(gpa.is_some());
                if prev_virt {
                    hstatus.set_spvp(prev_privilege);
                }
                self.set_hstatus(hstatus);
                self.csrs.store(csr::HTVAL, gpa.map(|g| g >> 2).unwrap_or(0));
                self.csrs.store(csr::HTINST, 0);
            }
            self.csrs.store(csr::SEPC, pc);
            self.csrs
                .store(csr::SCAUSE, if is_interrupt { interrupt_bit | code } else { code });
            self.csrs.store(csr::STVAL, tval);
            self.set_mode(PrivilegeLevel::Supervisor, false);
            let pc = Self::trap_vector(self.csrs.raw(csr::STVEC), is_interrupt, code);
            self.registers.set_pc(pc);
        } else {
            // Trap to VS. VS interrupt codes are presented with their S numbering inside
            // the guest (VSEI 10 -> SEI 9, etc.).
            let code = if is_interrupt && matches!(code, 2 | 6 | 10) {
                code - 1
            } else {
                code
            };
            let mut status = self.vsstatus();
            status.set_spie(status.sie());
            status.set_sie(false);
            status.set_spp(prev_privilege);
            self.set_vsstatus(status);
            self.csrs.store(csr::VSEPC, pc);
            self.csrs
                .store(csr::VSCAUSE, if is_interrupt { interrupt_bit | code } else { code });
            self.csrs.store(csr::VSTVAL, tval);
            self.set_mode(PrivilegeLevel::Supervisor, true);
            let pc = Self::trap_vector(self.csrs.raw(csr::VSTVEC), is_interrupt, code);
            self.registers.set_pc(pc);
        }
    }

    fn trap_vector(tvec: u64, is_interrupt: bool, code: u64) -> u64 {
        let base = tvec & !0b11;
        match (tvec & 0b11, is_interrupt) {
            (1, true) => base + 4 * code,
            _ => base,
        }
    }

    /// Deliver a non-maskable interrupt through the Smrnmi registers.
    pub fn nmi(&mut self, cause: u64) {
        let pc = self.registers.pc();
        self.csrs.store(csr::MNEPC, pc);
        self.csrs.store(csr::MNCAUSE, (1u64 << (X::BITS - 1)) | cause);
        // mnstatus: NMIE (bit 3) clears, MNPP (12:11), MNPV (7) record the old mode.
        let mnstatus = (self.privilege as u64) << 11 | (self.virt as u64) << 7;
        self.csrs.store(csr::MNSTATUS, mnstatus);
        self.set_mode(PrivilegeLevel::Machine, false);
        self.registers.set_pc(self.config.nmi_vector);
    }

    //
    // xRET.
    //

    pub(crate) fn mret(&mut self) -> ExecutionResult {
        if self.privilege != PrivilegeLevel::Machine {
            return Err(Exception::IllegalInstruction(None));
        }
        let mut status = self.mstatus();
        let new_privilege = status.mpp();
        let new_virt = status.mpv() && new_privilege != PrivilegeLevel::Machine;
        status.set_mie(status.mpie());
        status.set_mpie(true);
        status.set_mpp(PrivilegeLevel::User);
        status.set_mpv(false);
        if new_privilege != PrivilegeLevel::Machine {
            status.set_mprv(false);
        }
        self.set_mstatus(status);
        self.set_mode(new_privilege, new_virt);
        self.registers.set_pc(self.csrs.raw(csr::MEPC));
        Ok(())
    }

    pub(crate) fn sret(&mut self) -> ExecutionResult {
        if self.virt {
            // SRET in VS-mode: illegal if hstatus.VTSR, otherwise uses the VS state.
            if self.privilege < PrivilegeLevel::Supervisor || self.hstatus().vtsr() {
                return Err(Exception::VirtualInstruction(None));
            }
            let mut status = self.vsstatus();
            let new_privilege = status.spp();
            status.set_sie(status.spie());
            status.set_spie(true);
            status.set_spp(PrivilegeLevel::User);
            self.set_vsstatus(status);
            self.set_mode(new_privilege, true);
            self.registers.set_pc(self.csrs.raw(csr::VSEPC));
            return Ok(());
        }
        if self.privilege < PrivilegeLevel::Supervisor
            || (self.privilege == PrivilegeLevel::Supervisor && self.mstatus().tsr())
        {
            return Err(Exception::IllegalInstruction(None));
        }
        let mut status = self.mstatus();
        let new_privilege = status.spp();
        let new_virt = self.csrs.config().enable_hypervisor && self.hstatus().spv();
        status.set_sie(status.spie());
        status.set_spie(true);
        status.set_spp(PrivilegeLevel::User);
        if new_privilege != PrivilegeLevel::Machine {
            status.set_mprv(false);
        }
        self.set_mstatus(status);
        if self.csrs.config().enable_hypervisor {
            let mut hstatus = self.hstatus();
            hstatus.set_spv(false);
            self.set_hstatus(hstatus);
        }
        self.set_mode(new_privilege, new_virt);
        self.registers.set_pc(self.csrs.raw(csr::SEPC));
        Ok(())
    }

    pub(crate) fn dret(&mut self) -> ExecutionResult {
        if !self.debug_mode {
            return Err(Exception::IllegalInstruction(None));
        }
        self.debug_mode = false;
        self.csrs.set_debug_mode(false);
        let dcsr = self.csrs.raw(csr::DCSR);
        let privilege = match dcsr & 0x3 {
            0 => PrivilegeLevel::User,
            1 => PrivilegeLevel::Supervisor,
            _ => PrivilegeLevel::Machine,
        };
        let virt = dcsr >> 5 & 1 == 1;
        self.set_mode(privilege, virt);
        self.registers.set_pc(self.csrs.raw(csr::DPC));
        Ok(())
    }

    pub(crate) fn wfi(&mut self) -> ExecutionResult {
        // TW makes WFI illegal below M (with a zero timeout); VTW does the same under V=1.
        if self.privilege < PrivilegeLevel::Machine && self.mstatus().tw() {
            return Err(if self.virt {
                Exception::VirtualInstruction(None)
            } else {
                Exception::IllegalInstruction(None)
            });
        }
        if self.virt && self.hstatus().vtw() {
            return Err(Exception::VirtualInstruction(None));
        }
        if self.pending_interrupt().is_none() {
            self.waiting_for_interrupt = true;
        }
        Ok(())
    }

    /// Sample the platform timer: updates the TIME CSR and the Sstc timer-interrupt bits.
    pub fn sync_time(&mut self, time: u64) {
        self.csrs.set_time(time);
        let menvcfg = self.csrs.raw(csr::MENVCFG);
        // STCE is menvcfg bit 63.
        if menvcfg >> 63 & 1 == 1 {
            let stip = time >= self.csrs.raw(csr::STIMECMP);
            self.csrs.set_mip_bit(5, stip);
            if self.csrs.config().enable_hypervisor {
                let henvcfg = self.csrs.raw(csr::HENVCFG);
                if henvcfg >> 63 & 1 == 1 {
                    let vtime = time.wrapping_add(self.csrs.raw(csr::HTIMEDELTA));
                    let vstip = vtime >= self.csrs.raw(csr::VSTIMECMP);
                    self.csrs.set_mip_bit(6, vstip);
                }
            }
        }
    }

    /// Whether the hart is parked in WFI.
    pub fn waiting_for_interrupt(&self) -> bool {
        self.waiting_for_interrupt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::Specifier;
    use crate::Rv64;

    fn hart() -> Hart<Rv64> {
        let mem = Arc::new(Memory::new(1 << 32, 1, 64));
        Hart::new(mem, Config::default())
    }

    fn load_program(hart: &Hart<Rv64>, words: &[u32]) {
        let mut addr = hart.config.reset_vector;
        for word in words {
            hart.mem.poke(addr, &word.to_le_bytes()).unwrap();
            addr += 4;
        }
    }

    #[test]
    fn test_simple_program() {
        let mut hart = hart();
        // addi x1, x0, 5 ; addi x2, x1, 7
        load_program(&hart, &[0x0050_0093, 0x0070_8113]);
        hart.step();
        hart.step();
        assert_eq!(hart.registers().x(Specifier::from_u5(1)), 5);
        assert_eq!(hart.registers().x(Specifier::from_u5(2)), 12);
        assert_eq!(hart.registers().pc(), 0x8000_0008);
        assert_eq!(hart.csrs().raw(csr::MINSTRET), 2);
    }

    #[test]
    fn test_illegal_instruction_traps_to_mtvec() {
        let mut hart = hart();
        hart.csrs_mut().store(csr::MTVEC, 0x8000_1000);
        load_program(&hart, &[0xFFFF_FFFF]);
        let outcome = hart.step();
        assert!(outcome.trapped);
        assert_eq!(hart.registers().pc(), 0x8000_1000);
        assert_eq!(hart.csrs().raw(csr::MCAUSE), Exception::ILLEGAL_INSTRUCTION);
        assert_eq!(hart.csrs().raw(csr::MEPC), 0x8000_0000);
        assert_eq!(hart.csrs().raw(csr::MTVAL), 0xFFFF_FFFF);
    }

    #[test]
    fn test_ecall_from_m() {
        let mut hart = hart();
        hart.csrs_mut().store(csr::MTVEC, 0x8000_2000);
        load_program(&hart, &[0x0000_0073]);
        hart.step();
        assert_eq!(
            hart.csrs().raw(csr::MCAUSE),
            Exception::ENVIRONMENT_CALL_FROM_M_MODE
        );
    }

    #[test]
    fn test_delegated_exception_goes_to_s() {
        let mut hart = hart();
        hart.csrs_mut().store(csr::MTVEC, 0x8000_1000);
        hart.csrs_mut().store(csr::STVEC, 0x8000_3000);
        hart.csrs_mut()
            .store(csr::MEDELEG, 1 << Exception::ENVIRONMENT_CALL_FROM_U_MODE);
        // Drop to U-mode via mret.
        hart.csrs_mut().store(csr::MEPC, 0x8000_0000);
        load_program(&hart, &[0x0000_0073]); // ecall at the reset vector
        hart.mret().unwrap();
        assert_eq!(hart.privilege(), PrivilegeLevel::User);
        hart.step();
        assert_eq!(hart.privilege(), PrivilegeLevel::Supervisor);
        assert_eq!(hart.registers().pc(), 0x8000_3000);
        assert_eq!(
            hart.csrs().raw(csr::SCAUSE),
            Exception::ENVIRONMENT_CALL_FROM_U_MODE
        );
        // mstatus.SPP records U.
        assert_eq!(Mstatus(hart.csrs().raw(csr::MSTATUS)).spp(), PrivilegeLevel::User);
    }

    #[test]
    fn test_mret_restores_mode_and_virt() {
        let mut hart = hart();
        let mut status = hart.mstatus();
        status.set_mpp(PrivilegeLevel::Supervisor);
        status.set_mpv(true);
        status.set_mpie(true);
        hart.set_mstatus(status);
        hart.csrs_mut().store(csr::MEPC, 0x8000_4000);
        hart.mret().unwrap();
        assert_eq!(hart.privilege(), PrivilegeLevel::Supervisor);
        assert!(hart.virt());
        assert_eq!(hart.registers().pc(), 0x8000_4000);
        let status = hart.mstatus();
        assert!(status.mie());
        assert_eq!(status.mpp(), PrivilegeLevel::User);
    }

    #[test]
    fn test_interrupt_priority_and_vectored_dispatch() {
        let mut hart = hart();
        // Vectored mtvec.
        hart.csrs_mut().store(csr::MTVEC, 0x8000_1001);
        // Enable both MSI and MTI; MSI outranks MTI.
        hart.csrs_mut().store(csr::MIE, (1 << 3) | (1 << 7));
        let mut status = hart.mstatus();
        status.set_mie(true);
        hart.set_mstatus(status);
        hart.csrs_mut().poke(csr::MIP, (1 << 3) | (1 << 7)).unwrap();
        let outcome = hart.step();
        assert!(outcome.trapped);
        assert_eq!(hart.csrs().raw(csr::MCAUSE), (1 << 63) | 3);
        assert_eq!(hart.registers().pc(), 0x8000_1000 + 4 * 3);
    }

    #[test]
    fn test_interrupts_masked_by_mie_in_m_mode() {
        let mut hart = hart();
        hart.csrs_mut().store(csr::MIE, 1 << 3);
        hart.csrs_mut().poke(csr::MIP, 1 << 3).unwrap();
        assert_eq!(hart.pending_interrupt(), None);
        let mut status = hart.mstatus();
        status.set_mie(true);
        hart.set_mstatus(status);
        assert_eq!(hart.pending_interrupt(), Some(Interrupt::MachineSoftware));
    }

    #[test]
    fn test_vs_interrupt_only_in_guest() {
        let mut hart = hart();
        hart.csrs_mut().store(csr::MIDELEG, 1 << 2);
        hart.csrs_mut().store(csr::HIDELEG, 1 << 2);
        hart.csrs_mut().store(csr::MIE, 1 << 2);
        hart.csrs_mut().poke(csr::MIP, 1 << 2).unwrap();
        // In M-mode: not deliverable.
        assert_eq!(hart.pending_interrupt(), None);
        // In VU-mode: deliverable.
        hart.set_mode(PrivilegeLevel::User, true);
        assert_eq!(
            hart.pending_interrupt(),
            Some(Interrupt::VirtualSupervisorSoftware)
        );
        // Delivered with the S numbering into vscause.
        hart.csrs_mut().store(csr::VSTVEC, 0x9000_0000);
        hart.step();
        assert_eq!(hart.csrs().raw(csr::VSCAUSE), (1 << 63) | 1);
        assert_eq!(hart.privilege(), PrivilegeLevel::Supervisor);
        assert!(hart.virt());
    }

    #[test]
    fn test_guest_page_fault_writes_mtval2() {
        let mut hart = hart();
        hart.csrs_mut().store(csr::MTVEC, 0x8000_1000);
        hart.trap(
            TrapCause::Exception(Exception::LoadGuestPageFault {
                va: 0x1000,
                gpa: 0x8000_4000,
            }),
            0x8000_0000,
        );
        assert_eq!(
            hart.csrs().raw(csr::MCAUSE),
            Exception::LOAD_GUEST_PAGE_FAULT
        );
        assert_eq!(hart.csrs().raw(csr::MTVAL), 0x1000);
        assert_eq!(hart.csrs().raw(csr::MTVAL2), 0x8000_4000 >> 2);
    }

    #[test]
    fn test_wfi_parks_until_interrupt() {
        let mut hart = hart();
        load_program(&hart, &[0x1050_0073]); // wfi
        let outcome = hart.step();
        assert!(outcome.waiting);
        assert!(hart.waiting_for_interrupt());
        let outcome = hart.step();
        assert!(outcome.waiting);
        // An enabled pending interrupt wakes it.
        hart.csrs_mut().store(csr::MIE, 1 << 7);
        let mut status = hart.mstatus();
        status.set_mie(true);
        hart.set_mstatus(status);
        hart.csrs_mut().poke(csr::MIP, 1 << 7).unwrap();
        let outcome = hart.step();
        assert!(outcome.trapped);
        assert!(!hart.waiting_for_interrupt());
    }

    #[test]
    fn test_nmi() {
        let config = Config {
            nmi_vector: 0x100,
            ..Config::default()
        };
        let mem = Arc::new(Memory::new(1 << 20, 1, 64));
        let mut hart: Hart<Rv64> = Hart::new(mem, config);
        hart.set_mode(PrivilegeLevel::Supervisor, false);
        hart.nmi(0);
        assert_eq!(hart.privilege(), PrivilegeLevel::Machine);
        assert_eq!(hart.registers().pc(), 0x100);
        assert_eq!(hart.csrs().raw(csr::MNSTATUS) >> 11 & 3, 1);
    }

    #[test]
    fn test_sstc_timer_interrupt() {
        let mut hart = hart();
        hart.csrs_mut().store(csr::MENVCFG, 1 << 63);
        hart.csrs_mut().store(csr::STIMECMP, 1000);
        hart.sync_time(999);
        assert_eq!(hart.csrs().raw(csr::MIP) >> 5 & 1, 0);
        hart.sync_time(1000);
        assert_eq!(hart.csrs().raw(csr::MIP) >> 5 & 1, 1);
    }

    #[test]
    fn test_dret_restores_saved_mode() {
        let mut hart = hart();
        hart.set_mode(PrivilegeLevel::User, false);
        hart.enter_debug_mode(0x8000_0004, 1);
        assert!(hart.debug_mode());
        assert_eq!(hart.privilege(), PrivilegeLevel::Machine);
        hart.dret().unwrap();
        assert!(!hart.debug_mode());
        assert_eq!(hart.privilege(), PrivilegeLevel::User);
        assert_eq!(hart.registers().pc(), 0x8000_0004);
    }
}
