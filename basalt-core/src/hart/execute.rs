//! Instruction execution. The executor borrows the hart for the duration of one
//! instruction and owns the semantics of every operation; memory and CSR plumbing stay in
//! the hart itself.

use super::{Exception, ExecutionResult, Hart};
use crate::csr::numbers as csr;
use crate::instruction::{
    AmoOp, AmoSize, BranchCondition, CsrOp, FpMoveOp, FpWidth, Instruction, LoadWidth, RegImmOp,
    RegImmWordOp, RegRegOp, RegRegWordOp, RegShiftImmOp, StoreWidth,
};
use crate::memory::MemoryError;
use crate::registers::Specifier;
use crate::virt_mem::AccessType;
use crate::{PrivilegeLevel, Xlen};

pub(super) struct Executor<'h, X: Xlen> {
    pub hart: &'h mut Hart<X>,
}

impl<X: Xlen> Executor<'_, X> {
    /// Dispatch one decoded instruction. The PC has not been advanced yet; the default
    /// successor is `pc + 4` and jumps overwrite it.
    pub fn execute(&mut self, instruction: Instruction, pc: u64) -> ExecutionResult {
        self.hart.registers_mut().set_pc(pc.wrapping_add(4));
        match instruction {
            Instruction::OpImm {
                op,
                dest,
                src,
                immediate,
            } => self.op_imm(op, dest, src, immediate),
            Instruction::OpShiftImm {
                op,
                dest,
                src,
                shift_amount,
            } => self.op_shift_imm(op, dest, src, shift_amount),
            Instruction::OpImmWord {
                op,
                dest,
                src,
                immediate,
            } => self.op_imm_word(op, dest, src, immediate),
            Instruction::OpShiftImmWord {
                op,
                dest,
                src,
                shift_amount,
            } => self.op_shift_imm_word(op, dest, src, shift_amount),
            Instruction::Auipc { dest, immediate } => {
                self.set_x(dest, pc.wrapping_add(immediate as i64 as u64));
                Ok(())
            }
            Instruction::Lui { dest, immediate } => {
                self.set_x(dest, immediate as i64 as u64);
                Ok(())
            }
            Instruction::Op {
                op,
                dest,
                src1,
                src2,
            } => self.op(op, dest, src1, src2),
            Instruction::OpWord {
                op,
                dest,
                src1,
                src2,
            } => self.op_word(op, dest, src1, src2),
            Instruction::Jal { dest, offset } => self.jal(dest, offset, pc),
            Instruction::Jalr { dest, base, offset } => self.jalr(dest, base, offset, pc),
            Instruction::Branch {
                condition,
                src1,
                src2,
                offset,
            } => self.branch(condition, src1, src2, offset, pc),
            Instruction::Load {
                width,
                dest,
                base,
                offset,
            } => self.load(width, dest, base, offset),
            Instruction::Store {
                width,
                src,
                base,
                offset,
            } => self.store(width, src, base, offset),
            Instruction::LoadFp {
                width,
                dest,
                base,
                offset,
            } => self.load_fp(width, dest, base, offset),
            Instruction::StoreFp {
                width,
                src,
                base,
                offset,
            } => self.store_fp(width, src, base, offset),
            Instruction::FpMove { op, dest, src } => self.fp_move(op, dest, src),
            Instruction::Amo {
                op,
                size,
                aq: _,
                rl: _,
                src,
                addr,
                dest,
            } => self.amo(op, size, src, addr, dest),
            Instruction::Fence { .. } => Ok(()),
            Instruction::FenceI => {
                self.hart.decode_cache.clear();
                Ok(())
            }
            Instruction::SfenceVma { .. }
            | Instruction::SinvalVma { .. }
            | Instruction::SfenceWInval
            | Instruction::SfenceInvalIr => self.sfence(),
            Instruction::HfenceVvma { .. } | Instruction::HfenceGvma { .. } => self.hfence(),
            Instruction::Ecall => self.ecall(),
            Instruction::Ebreak => Err(Exception::Breakpoint(pc)),
            Instruction::Sret => self.hart.sret(),
            Instruction::Mret => self.hart.mret(),
            Instruction::Dret => self.hart.dret(),
            Instruction::Wfi => self.hart.wfi(),
            Instruction::Csr { op, dest, csr, src } => {
                let write_value = self.x(src);
                let writes = !matches!(op, CsrOp::ReadSet | CsrOp::ReadClear)
                    || u8::from(src) != 0;
                self.csr_op(op, dest, csr, write_value, writes)
            }
            Instruction::Csri {
                op,
                dest,
                csr,
                immediate,
            } => {
                let writes = !matches!(op, CsrOp::ReadSet | CsrOp::ReadClear) || immediate != 0;
                self.csr_op(op, dest, csr, immediate as u64, writes)
            }
        }
    }

    fn x(&self, specifier: Specifier) -> u64 {
        self.hart.registers().x(specifier)
    }

    fn set_x(&mut self, specifier: Specifier, value: u64) {
        self.hart.registers_mut().set_x(specifier, value);
    }

    fn signed(&self, specifier: Specifier) -> i64 {
        X::sign_extend(self.x(specifier)) as i64
    }

    //
    // Integer computation.
    //

    fn op_imm(
        &mut self,
        op: RegImmOp,
        dest: Specifier,
        src: Specifier,
        immediate: i32,
    ) -> ExecutionResult {
        let lhs = self.x(src);
        let imm = immediate as i64 as u64;
        let value = match op {
            RegImmOp::Addi => lhs.wrapping_add(imm),
            RegImmOp::Slti => ((self.signed(src)) < immediate as i64) as u64,
            RegImmOp::Sltiu => (lhs < X::truncate(imm)) as u64,
            RegImmOp::Xori => lhs ^ imm,
            RegImmOp::Ori => lhs | imm,
            RegImmOp::Andi => lhs & imm,
        };
        self.set_x(dest, value);
        Ok(())
    }

    fn op_shift_imm(
        &mut self,
        op: RegShiftImmOp,
        dest: Specifier,
        src: Specifier,
        shift_amount: u32,
    ) -> ExecutionResult {
        if shift_amount >= X::BITS {
            return Err(Exception::IllegalInstruction(None));
        }
        let lhs = self.x(src);
        let value = match op {
            RegShiftImmOp::Slli => lhs << shift_amount,
            RegShiftImmOp::Srli => lhs >> shift_amount,
            RegShiftImmOp::Srai => (X::sign_extend(lhs) as i64 >> shift_amount) as u64,
        };
        self.set_x(dest, value);
        Ok(())
    }

    fn op_imm_word(
        &mut self,
        op: RegImmWordOp,
        dest: Specifier,
        src: Specifier,
        immediate: i32,
    ) -> ExecutionResult {
        if !X::is_rv64() {
            return Err(Exception::IllegalInstruction(None));
        }
        let RegImmWordOp::Addiw = op;
        let value = (self.x(src) as u32).wrapping_add(immediate as u32);
        self.set_x(dest, value as i32 as i64 as u64);
        Ok(())
    }

    fn op_shift_imm_word(
        &mut self,
        op: RegShiftImmOp,
        dest: Specifier,
        src: Specifier,
        shift_amount: u32,
    ) -> ExecutionResult {
        if !X::is_rv64() {
            return Err(Exception::IllegalInstruction(None));
        }
        let lhs = self.x(src) as u32;
        let value = match op {
            RegShiftImmOp::Slli => lhs << shift_amount,
            RegShiftImmOp::Srli => lhs >> shift_amount,
            RegShiftImmOp::Srai => (lhs as i32 >> shift_amount) as u32,
        };
        self.set_x(dest, value as i32 as i64 as u64);
        Ok(())
    }

    fn op(
        &mut self,
        op: RegRegOp,
        dest: Specifier,
        src1: Specifier,
        src2: Specifier,
    ) -> ExecutionResult {
        let (lhs, rhs) = (self.x(src1), self.x(src2));
        let (slhs, srhs) = (self.signed(src1), self.signed(src2));
        let shamt = (rhs & (X::BITS as u64 - 1)) as u32;
        let value = match op {
            RegRegOp::Add => lhs.wrapping_add(rhs),
            RegRegOp::Sub => lhs.wrapping_sub(rhs),
            RegRegOp::Slt => (slhs < srhs) as u64,
            RegRegOp::Sltu => (lhs < rhs) as u64,
            RegRegOp::And => lhs & rhs,
            RegRegOp::Or => lhs | rhs,
            RegRegOp::Xor => lhs ^ rhs,
            RegRegOp::Sll => lhs << shamt,
            RegRegOp::Srl => lhs >> shamt,
            RegRegOp::Sra => (X::sign_extend(lhs) as i64 >> shamt) as u64,
            RegRegOp::Mul => lhs.wrapping_mul(rhs),
            RegRegOp::Mulh => {
                if X::is_rv64() {
                    ((slhs as i128).wrapping_mul(srhs as i128) >> 64) as u64
                } else {
                    ((slhs).wrapping_mul(srhs) >> 32) as u64
                }
            }
            RegRegOp::Mulhsu => {
                if X::is_rv64() {
                    ((slhs as i128).wrapping_mul(rhs as i128) >> 64) as u64
                } else {
                    (slhs.wrapping_mul(rhs as i64) >> 32) as u64
                }
            }
            RegRegOp::Mulhu => {
                if X::is_rv64() {
                    ((lhs as u128).wrapping_mul(rhs as u128) >> 64) as u64
                } else {
                    (lhs.wrapping_mul(rhs)) >> 32
                }
            }
            RegRegOp::Div => {
                if srhs == 0 {
                    u64::MAX
                } else if slhs == i64::MIN >> (64 - X::BITS) && srhs == -1 {
                    slhs as u64
                } else {
                    (slhs.wrapping_div(srhs)) as u64
                }
            }
            RegRegOp::Divu => {
                if rhs == 0 {
                    u64::MAX
                } else {
                    lhs / rhs
                }
            }
            RegRegOp::Rem => {
                if srhs == 0 {
                    slhs as u64
                } else if slhs == i64::MIN >> (64 - X::BITS) && srhs == -1 {
                    0
                } else {
                    (slhs.wrapping_rem(srhs)) as u64
                }
            }
            RegRegOp::Remu => {
                if rhs == 0 {
                    lhs
                } else {
                    lhs % rhs
                }
            }
        };
        self.set_x(dest, value);
        Ok(())
    }

    fn op_word(
        &mut self,
        op: RegRegWordOp,
        dest: Specifier,
        src1: Specifier,
        src2: Specifier,
    ) -> ExecutionResult {
        if !X::is_rv64() {
            return Err(Exception::IllegalInstruction(None));
        }
        let (lhs, rhs) = (self.x(src1) as u32, self.x(src2) as u32);
        let shamt = rhs & 0x1F;
        let value = match op {
            RegRegWordOp::Addw => lhs.wrapping_add(rhs),
            RegRegWordOp::Subw => lhs.wrapping_sub(rhs),
            RegRegWordOp::Sllw => lhs << shamt,
            RegRegWordOp::Srlw => lhs >> shamt,
            RegRegWordOp::Sraw => (lhs as i32 >> shamt) as u32,
            RegRegWordOp::Mulw => lhs.wrapping_mul(rhs),
            RegRegWordOp::Divw => {
                if rhs == 0 {
                    u32::MAX
                } else if lhs as i32 == i32::MIN && rhs as i32 == -1 {
                    lhs
                } else {
                    ((lhs as i32).wrapping_div(rhs as i32)) as u32
                }
            }
            RegRegWordOp::Divuw => {
                if rhs == 0 {
                    u32::MAX
                } else {
                    lhs / rhs
                }
            }
            RegRegWordOp::Remw => {
                if rhs == 0 {
                    lhs
                } else if lhs as i32 == i32::MIN && rhs as i32 == -1 {
                    0
                } else {
                    ((lhs as i32).wrapping_rem(rhs as i32)) as u32
                }
            }
            RegRegWordOp::Remuw => {
                if rhs == 0 {
                    lhs
                } else {
                    lhs % rhs
                }
            }
        };
        self.set_x(dest, value as i32 as i64 as u64);
        Ok(())
    }

    //
    // Control transfer.
    //

    fn jal(&mut self, dest: Specifier, offset: i32, pc: u64) -> ExecutionResult {
        let target = X::truncate(pc.wrapping_add(offset as i64 as u64));
        if target % 4 != 0 {
            return Err(Exception::InstructionAddressMisaligned(target));
        }
        self.set_x(dest, pc.wrapping_add(4));
        self.hart.registers_mut().set_pc(target);
        Ok(())
    }

    fn jalr(&mut self, dest: Specifier, base: Specifier, offset: i32, pc: u64) -> ExecutionResult {
        let target = X::truncate(self.x(base).wrapping_add(offset as i64 as u64)) & !1;
        if target % 4 != 0 {
            return Err(Exception::InstructionAddressMisaligned(target));
        }
        self.set_x(dest, pc.wrapping_add(4));
        self.hart.registers_mut().set_pc(target);
        Ok(())
    }

    fn branch(
        &mut self,
        condition: BranchCondition,
        src1: Specifier,
        src2: Specifier,
        offset: i32,
        pc: u64,
    ) -> ExecutionResult {
        let taken = match condition {
            BranchCondition::Beq => self.x(src1) == self.x(src2),
            BranchCondition::Bne => self.x(src1) != self.x(src2),
            BranchCondition::Blt => self.signed(src1) < self.signed(src2),
            BranchCondition::Bge => self.signed(src1) >= self.signed(src2),
            BranchCondition::Bltu => self.x(src1) < self.x(src2),
            BranchCondition::Bgeu => self.x(src1) >= self.x(src2),
        };
        if taken {
            let target = X::truncate(pc.wrapping_add(offset as i64 as u64));
            if target % 4 != 0 {
                return Err(Exception::InstructionAddressMisaligned(target));
            }
            self.hart.registers_mut().set_pc(target);
        }
        Ok(())
    }

    //
    // Loads and stores.
    //

    fn load(
        &mut self,
        width: LoadWidth,
        dest: Specifier,
        base: Specifier,
        offset: i32,
    ) -> ExecutionResult {
        if matches!(width, LoadWidth::Lwu | LoadWidth::Ld) && !X::is_rv64() {
            return Err(Exception::IllegalInstruction(None));
        }
        let va = self.x(base).wrapping_add(offset as i64 as u64);
        let raw = self.hart.read_memory(va, width.bytes())?;
        let value = match width {
            LoadWidth::Lb => raw as u8 as i8 as i64 as u64,
            LoadWidth::Lh => raw as u16 as i16 as i64 as u64,
            LoadWidth::Lw => raw as u32 as i32 as i64 as u64,
            LoadWidth::Lbu => raw as u8 as u64,
            LoadWidth::Lhu => raw as u16 as u64,
            LoadWidth::Lwu => raw as u32 as u64,
            LoadWidth::Ld => raw,
        };
        self.set_x(dest, value);
        Ok(())
    }

    fn store(
        &mut self,
        width: StoreWidth,
        src: Specifier,
        base: Specifier,
        offset: i32,
    ) -> ExecutionResult {
        if matches!(width, StoreWidth::Sd) && !X::is_rv64() {
            return Err(Exception::IllegalInstruction(None));
        }
        let va = self.x(base).wrapping_add(offset as i64 as u64);
        let bytes = width.bytes();
        let value = if bytes == 8 {
            self.x(src)
        } else {
            self.x(src) & ((1u64 << (bytes * 8)) - 1)
        };
        self.hart.write_memory(va, bytes, value)
    }

    //
    // Floating-point transfer.
    //

    fn require_fp(&self) -> ExecutionResult {
        if !self.hart.csrs().config().enable_fp || self.hart.mstatus().fs() == 0 {
            return Err(Exception::IllegalInstruction(None));
        }
        Ok(())
    }

    fn mark_fp_dirty(&mut self) {
        let mut status = self.hart.mstatus();
        status.set_fs(3);
        self.hart.set_mstatus(status);
    }

    fn load_fp(
        &mut self,
        width: FpWidth,
        dest: Specifier,
        base: Specifier,
        offset: i32,
    ) -> ExecutionResult {
        self.require_fp()?;
        let va = self.x(base).wrapping_add(offset as i64 as u64);
        let raw = self.hart.read_memory(va, width.bytes())?;
        match width {
            FpWidth::Single => self.hart.fp_registers.set_f_single(dest, raw as u32),
            FpWidth::Double => self.hart.fp_registers.set_f(dest, raw),
        }
        self.mark_fp_dirty();
        Ok(())
    }

    fn store_fp(
        &mut self,
        width: FpWidth,
        src: Specifier,
        base: Specifier,
        offset: i32,
    ) -> ExecutionResult {
        self.require_fp()?;
        let va = self.x(base).wrapping_add(offset as i64 as u64);
        let value = match width {
            FpWidth::Single => self.hart.fp_registers.f(src) as u32 as u64,
            FpWidth::Double => self.hart.fp_registers.f(src),
        };
        self.hart.write_memory(va, width.bytes(), value)
    }

    fn fp_move(&mut self, op: FpMoveOp, dest: Specifier, src: Specifier) -> ExecutionResult {
        self.require_fp()?;
        if matches!(op, FpMoveOp::FmvXD | FpMoveOp::FmvDX) && !X::is_rv64() {
            return Err(Exception::IllegalInstruction(None));
        }
        match op {
            FpMoveOp::FmvXW => {
                let value = self.hart.fp_registers.f(src) as u32;
                self.set_x(dest, value as i32 as i64 as u64);
            }
            FpMoveOp::FmvWX => {
                let value = self.x(src) as u32;
                self.hart.fp_registers.set_f_single(dest, value);
                self.mark_fp_dirty();
            }
            FpMoveOp::FmvXD => {
                let value = self.hart.fp_registers.f(src);
                self.set_x(dest, value);
            }
            FpMoveOp::FmvDX => {
                let value = self.x(src);
                self.hart.fp_registers.set_f(dest, value);
                self.mark_fp_dirty();
            }
        }
        Ok(())
    }

    //
    // Atomics.
    //

    fn amo(
        &mut self,
        op: AmoOp,
        size: AmoSize,
        src: Specifier,
        addr: Specifier,
        dest: Specifier,
    ) -> ExecutionResult {
        if size == AmoSize::Doubleword && !X::is_rv64() {
            return Err(Exception::IllegalInstruction(None));
        }
        let bytes = size.bytes();
        let va = X::truncate(self.x(addr));
        if va % bytes as u64 != 0 {
            return Err(Exception::StoreOrAmoAddressMisaligned(va));
        }
        let hart_ix = self.hart.config().hart_ix as usize;
        match op {
            AmoOp::Lr => {
                let value = self.hart.read_memory(va, bytes)?;
                let pa = self.hart.translate(va, AccessType::Read, false)?;
                self.hart
                    .mem
                    .make_reservation(hart_ix, pa)
                    .map_err(|_| Exception::StoreOrAmoAccessFault(va))?;
                self.set_x(dest, sign_extend_to(value, bytes));
                Ok(())
            }
            AmoOp::Sc => {
                let pa = self.hart.translate(va, AccessType::Write, false)?;
                let value = self.x(src);
                let data = &value.to_le_bytes()[..bytes as usize];
                let success = self
                    .hart
                    .mem
                    .store_conditional(hart_ix, pa, data)
                    .map_err(|err| match err {
                        MemoryError::Forbidden => Exception::StoreOrAmoAccessFault(va),
                        MemoryError::OutOfBounds => Exception::StoreOrAmoAccessFault(va),
                    })?;
                if success {
                    self.hart.record_amo_access(va, pa, bytes, value);
                }
                self.set_x(dest, if success { 0 } else { 1 });
                Ok(())
            }
            _ => {
                // AMOs need both read and write permission on the page.
                let pa = self.hart.translate(va, AccessType::Write, false)?;
                let rhs = self.x(src);
                let old = self
                    .hart
                    .mem
                    .amo(pa, bytes, |old| {
                        amo_apply::<X>(op, size, old, rhs)
                    })
                    .map_err(|_| Exception::StoreOrAmoAccessFault(va))?;
                let new = amo_apply::<X>(op, size, old, rhs);
                self.hart.record_amo_access(va, pa, bytes, new);
                self.set_x(dest, sign_extend_to(old, bytes));
                Ok(())
            }
        }
    }

    //
    // Fences and environment.
    //

    fn sfence(&mut self) -> ExecutionResult {
        if self.hart.virt() {
            if self.hart.privilege() < PrivilegeLevel::Supervisor || self.hart.hstatus().vtvm() {
                return Err(Exception::VirtualInstruction(None));
            }
        } else {
            if self.hart.privilege() < PrivilegeLevel::Supervisor {
                return Err(Exception::IllegalInstruction(None));
            }
            if self.hart.privilege() == PrivilegeLevel::Supervisor && self.hart.mstatus().tvm() {
                return Err(Exception::IllegalInstruction(None));
            }
        }
        // There is no translation cache to flush beyond the decode cache.
        self.hart.decode_cache.clear();
        Ok(())
    }

    fn hfence(&mut self) -> ExecutionResult {
        if self.hart.virt() {
            return Err(Exception::VirtualInstruction(None));
        }
        if self.hart.privilege() < PrivilegeLevel::Supervisor {
            return Err(Exception::IllegalInstruction(None));
        }
        self.hart.decode_cache.clear();
        Ok(())
    }

    fn ecall(&mut self) -> ExecutionResult {
        Err(match (self.hart.privilege(), self.hart.virt()) {
            (PrivilegeLevel::User, _) => Exception::EnvironmentCallFromUMode,
            (PrivilegeLevel::Supervisor, false) => Exception::EnvironmentCallFromSMode,
            (PrivilegeLevel::Supervisor, true) => Exception::EnvironmentCallFromVsMode,
            (PrivilegeLevel::Machine, _) => Exception::EnvironmentCallFromMMode,
        })
    }

    //
    // CSR instructions.
    //

    fn csr_op(
        &mut self,
        op: CsrOp,
        dest: Specifier,
        number: u16,
        operand: u64,
        writes: bool,
    ) -> ExecutionResult {
        // The trigger registers are served by the trigger unit.
        if (csr::TSELECT..=csr::TINFO).contains(&number) {
            return self.trigger_csr_op(op, dest, number, operand, writes);
        }
        let mode = self.hart.privilege();
        let virt = self.hart.virt();
        let illegal = || {
            if virt {
                Exception::VirtualInstruction(None)
            } else {
                Exception::IllegalInstruction(None)
            }
        };
        self.check_counter_enable(number)?;
        if writes && !self.hart.csrs().is_writeable(number, mode, virt) {
            return Err(illegal());
        }
        let old = self
            .hart
            .csrs()
            .read(number, mode, virt)
            .map_err(|_| illegal())?;
        if writes {
            let new = match op {
                CsrOp::ReadWrite => operand,
                CsrOp::ReadSet => old | operand,
                CsrOp::ReadClear => old & !operand,
            };
            self.hart
                .csrs_mut()
                .write(number, mode, virt, new)
                .map_err(|_| illegal())?;
            // Remapping registers invalidate cached decodes keyed by physical PC.
            if matches!(number, csr::SATP | csr::VSATP | csr::HGATP) {
                self.hart.decode_cache.clear();
            }
        }
        self.set_x(dest, old);
        Ok(())
    }

    // Counter CSRs are additionally gated by mcounteren/hcounteren/scounteren below M.
    fn check_counter_enable(&self, number: u16) -> ExecutionResult {
        let counter_bit = match number {
            csr::CYCLE | csr::CYCLEH => 0,
            csr::TIME | csr::TIMEH => 1,
            csr::INSTRET | csr::INSTRETH => 2,
            n if (csr::HPMCOUNTER3..=csr::HPMCOUNTER31).contains(&n) => {
                (n - csr::HPMCOUNTER3 + 3) as u32
            }
            _ => return Ok(()),
        };
        let privilege = self.hart.privilege();
        if privilege == PrivilegeLevel::Machine {
            return Ok(());
        }
        let mcounteren = self.hart.csrs().raw(csr::MCOUNTEREN);
        if mcounteren >> counter_bit & 1 == 0 {
            return Err(Exception::IllegalInstruction(None));
        }
        if self.hart.virt() {
            let hcounteren = self.hart.csrs().raw(csr::HCOUNTEREN);
            if hcounteren >> counter_bit & 1 == 0 {
                return Err(Exception::VirtualInstruction(None));
            }
        }
        if privilege == PrivilegeLevel::User {
            let scounteren = self.hart.csrs().raw(csr::SCOUNTEREN);
            if scounteren >> counter_bit & 1 == 0 {
                return Err(Exception::IllegalInstruction(None));
            }
        }
        Ok(())
    }

    fn trigger_csr_op(
        &mut self,
        op: CsrOp,
        dest: Specifier,
        number: u16,
        operand: u64,
        writes: bool,
    ) -> ExecutionResult {
        if self.hart.privilege() != PrivilegeLevel::Machine && !self.hart.debug_mode() {
            return Err(Exception::IllegalInstruction(None));
        }
        let old = match number {
            csr::TSELECT => self.hart.triggers.tselect(),
            csr::TDATA1 => self.hart.triggers.tdata(1),
            csr::TDATA2 => self.hart.triggers.tdata(2),
            csr::TDATA3 => self.hart.triggers.tdata(3),
            _ => self.hart.triggers.tinfo(),
        };
        if writes {
            let new = match op {
                CsrOp::ReadWrite => operand,
                CsrOp::ReadSet => old | operand,
                CsrOp::ReadClear => old & !operand,
            };
            match number {
                csr::TSELECT => self.hart.triggers.set_tselect(new),
                csr::TDATA1 => self.hart.triggers.set_tdata(1, new),
                csr::TDATA2 => self.hart.triggers.set_tdata(2, new),
                csr::TDATA3 => self.hart.triggers.set_tdata(3, new),
                _ => return Err(Exception::IllegalInstruction(None)),
            }
        }
        self.set_x(dest, old);
        Ok(())
    }
}

// Sign-extend a `bytes`-wide AMO result to register width.
fn sign_extend_to(value: u64, bytes: u32) -> u64 {
    match bytes {
        4 => value as u32 as i32 as i64 as u64,
        _ => value,
    }
}

fn amo_apply<X: Xlen>(op: AmoOp, size: AmoSize, old: u64, rhs: u64) -> u64 {
    let (old_v, rhs_v) = match size {
        AmoSize::Word => (old as u32 as u64, rhs as u32 as u64),
        AmoSize::Doubleword => (old, rhs),
    };
    let signed = |v: u64| match size {
        AmoSize::Word => v as u32 as i32 as i64,
        AmoSize::Doubleword => v as i64,
    };
    let result = match op {
        AmoOp::Swap => rhs_v,
        AmoOp::Add => old_v.wrapping_add(rhs_v),
        AmoOp::Xor => old_v ^ rhs_v,
        AmoOp::And => old_v & rhs_v,
        AmoOp::Or => old_v | rhs_v,
        AmoOp::Min => {
            if signed(old_v) <= signed(rhs_v) {
                old_v
            } else {
                rhs_v
            }
        }
        AmoOp::Max => {
            if signed(old_v) >= signed(rhs_v) {
                old_v
            } else {
                rhs_v
            }
        }
        AmoOp::Minu => old_v.min(rhs_v),
        AmoOp::Maxu => old_v.max(rhs_v),
        AmoOp::Lr | AmoOp::Sc => unreachable!("handled by the caller"),
    };
    match size {
        AmoSize::Word => result as u32 as u64,
        AmoSize::Doubleword => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hart::Config;
    use crate::memory::Memory;
    use crate::Rv64;
    use std::sync::Arc;

    fn hart() -> Hart<Rv64> {
        let mem = Arc::new(Memory::new(1 << 32, 2, 64));
        Hart::new(mem, Config::default())
    }

    fn exec(hart: &mut Hart<Rv64>, raw: u32) -> ExecutionResult {
        let pc = hart.registers().pc();
        let instruction = Instruction::decode(raw).unwrap();
        let mut executor = Executor { hart };
        executor.execute(instruction, pc)
    }

    fn x(n: u8) -> Specifier {
        Specifier::from_u5(n)
    }

    #[test]
    fn test_arithmetic() {
        let mut hart = hart();
        hart.registers_mut().set_x(x(1), 7);
        hart.registers_mut().set_x(x(2), u64::MAX); // -1
        exec(&mut hart, 0x0020_81B3).unwrap(); // add x3, x1, x2
        assert_eq!(hart.registers().x(x(3)), 6);
        exec(&mut hart, 0x4020_81B3).unwrap(); // sub x3, x1, x2
        assert_eq!(hart.registers().x(x(3)), 8);
        exec(&mut hart, 0x0020_A1B3).unwrap(); // slt x3, x1, x2
        assert_eq!(hart.registers().x(x(3)), 0);
        exec(&mut hart, 0x0020_B1B3).unwrap(); // sltu x3, x1, x2
        assert_eq!(hart.registers().x(x(3)), 1);
    }

    #[test]
    fn test_division_edge_cases() {
        let mut hart = hart();
        hart.registers_mut().set_x(x(1), 5);
        hart.registers_mut().set_x(x(2), 0);
        exec(&mut hart, 0x0220_C1B3).unwrap(); // div x3, x1, x2
        assert_eq!(hart.registers().x(x(3)), u64::MAX);
        exec(&mut hart, 0x0220_E1B3).unwrap(); // rem x3, x1, x2
        assert_eq!(hart.registers().x(x(3)), 5);
        // Overflow: i64::MIN / -1.
        hart.registers_mut().set_x(x(1), i64::MIN as u64);
        hart.registers_mut().set_x(x(2), u64::MAX);
        exec(&mut hart, 0x0220_C1B3).unwrap();
        assert_eq!(hart.registers().x(x(3)), i64::MIN as u64);
        exec(&mut hart, 0x0220_E1B3).unwrap();
        assert_eq!(hart.registers().x(x(3)), 0);
    }

    #[test]
    fn test_word_ops_sign_extend() {
        let mut hart = hart();
        hart.registers_mut().set_x(x(1), 0x7FFF_FFFF);
        exec(&mut hart, 0x0010_809B).unwrap(); // addiw x1, x1, 1
        assert_eq!(hart.registers().x(x(1)), 0xFFFF_FFFF_8000_0000);
    }

    #[test]
    fn test_load_store_roundtrip() {
        let mut hart = hart();
        hart.registers_mut().set_x(x(10), 0x2000);
        hart.registers_mut().set_x(x(7), 0xDEAD_BEEF_CAFE_F00D);
        // sd x7, 0(x10) ; ld x6, 0(x10)
        exec(&mut hart, 0x0075_3023).unwrap();
        exec(&mut hart, 0x0005_3303).unwrap();
        assert_eq!(hart.registers().x(x(6)), 0xDEAD_BEEF_CAFE_F00D);
        // lw sign-extends.
        exec(&mut hart, 0x0005_2303).unwrap();
        assert_eq!(hart.registers().x(x(6)), 0xFFFF_FFFF_CAFE_F00D);
        // lwu zero-extends.
        exec(&mut hart, 0x0005_6303).unwrap();
        assert_eq!(hart.registers().x(x(6)), 0xCAFE_F00D);
    }

    #[test]
    fn test_amoadd() {
        let mut hart = hart();
        hart.memory().write(0x3000, &10u64.to_le_bytes()).unwrap();
        hart.registers_mut().set_x(x(10), 0x3000);
        hart.registers_mut().set_x(x(6), 32);
        // amoadd.d x7, x6, (x10)
        exec(&mut hart, 0x0065_33AF).unwrap();
        assert_eq!(hart.registers().x(x(7)), 10);
        let mut buf = [0u8; 8];
        hart.memory().read(0x3000, &mut buf).unwrap();
        assert_eq!(u64::from_le_bytes(buf), 42);
    }

    #[test]
    fn test_lr_sc_pair() {
        let mut hart = hart();
        hart.registers_mut().set_x(x(10), 0x4000);
        hart.registers_mut().set_x(x(6), 0x1234);
        // lr.w x5, (x10)
        exec(&mut hart, 0x1005_22AF).unwrap();
        assert_eq!(hart.registers().x(x(5)), 0);
        // sc.w x7, x6, (x10)
        exec(&mut hart, 0x1865_23AF).unwrap();
        assert_eq!(hart.registers().x(x(7)), 0, "sc succeeds with reservation");
        let mut buf = [0u8; 4];
        hart.memory().read(0x4000, &mut buf).unwrap();
        assert_eq!(u32::from_le_bytes(buf), 0x1234);
        // A second sc without a reservation fails.
        exec(&mut hart, 0x1865_23AF).unwrap();
        assert_eq!(hart.registers().x(x(7)), 1);
    }

    #[test]
    fn test_amo_misaligned() {
        let mut hart = hart();
        hart.registers_mut().set_x(x(10), 0x3002);
        assert_eq!(
            exec(&mut hart, 0x0065_33AF),
            Err(Exception::StoreOrAmoAddressMisaligned(0x3002))
        );
    }

    #[test]
    fn test_csr_instruction_reads_old_value() {
        let mut hart = hart();
        hart.registers_mut().set_x(x(6), 0xABC);
        // csrrw x5, mscratch, x6
        exec(&mut hart, 0x3403_12F3).unwrap();
        assert_eq!(hart.registers().x(x(5)), 0);
        assert_eq!(hart.csrs().raw(csr::MSCRATCH), 0xABC);
        // csrrs x5, mscratch, x0 reads without writing.
        exec(&mut hart, 0x3400_22F3).unwrap();
        assert_eq!(hart.registers().x(x(5)), 0xABC);
    }

    #[test]
    fn test_csr_illegal_from_user_mode() {
        let mut hart = hart();
        hart.set_mode(PrivilegeLevel::User, false);
        assert_eq!(
            exec(&mut hart, 0x3403_12F3),
            Err(Exception::IllegalInstruction(None))
        );
    }

    #[test]
    fn test_trigger_csrs_route_to_trigger_unit() {
        let mut hart = hart();
        hart.registers_mut().set_x(x(6), 1);
        // csrrw x0, tselect, x6
        exec(&mut hart, 0x7A03_1073).unwrap();
        assert_eq!(hart.triggers_mut().tselect(), 1);
    }

    #[test]
    fn test_fp_requires_fs() {
        let mut hart = hart();
        hart.registers_mut().set_x(x(10), 0x2000);
        // FS is Off out of reset: fld faults.
        assert_eq!(
            exec(&mut hart, 0x0005_3007),
            Err(Exception::IllegalInstruction(None))
        );
        let mut status = hart.mstatus();
        status.set_fs(1);
        hart.set_mstatus(status);
        exec(&mut hart, 0x0005_3007).unwrap(); // fld f0, 0(x10)
        assert_eq!(hart.mstatus().fs(), 3, "FP writes mark FS dirty");
    }

    #[test]
    fn test_fence_i_clears_decode_cache() {
        let mut hart = hart();
        hart.decode_cache.insert(
            0x8000_0000,
            0x13,
            Instruction::decode(0x13).unwrap(),
        );
        exec(&mut hart, 0x0000_100F).unwrap();
        assert_eq!(hart.decode_cache.lookup(0x8000_0000, 0x13), None);
    }

    #[test]
    fn test_sfence_vma_privilege() {
        let mut hart = hart();
        // From M-mode: fine.
        exec(&mut hart, 0x1220_8073).unwrap();
        hart.set_mode(PrivilegeLevel::User, false);
        assert_eq!(
            exec(&mut hart, 0x1220_8073),
            Err(Exception::IllegalInstruction(None))
        );
        // From S with TVM: illegal.
        hart.set_mode(PrivilegeLevel::Supervisor, false);
        let mut status = hart.mstatus();
        status.set_tvm(true);
        hart.set_mstatus(status);
        assert_eq!(
            exec(&mut hart, 0x1220_8073),
            Err(Exception::IllegalInstruction(None))
        );
    }
}
