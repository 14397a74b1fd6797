//! Instruction handlers: the decode-and-dispatch step of the interpreter
//! loop. One entry point, [`Machine::execute_entry`], consumes a decoded
//! entry, updates registers and memory, and advances the PC.

use crate::cpu::decoder::{Inst, Opcode};
use crate::cpu::exec_segment::DecodedEntry;
use crate::cpu::Cpu;
use crate::error::MachineError;
use crate::machine::Machine;
use crate::memory::Memory;

/// Masks a jump target to the machine width and validates instruction
/// alignment.
#[inline(always)]
fn check_jump<const W: usize>(target: u64) -> Result<u64, MachineError> {
    let target = target & Memory::<W>::ADDR_MASK;
    if target & Cpu::<W>::pc_alignment_mask() != 0 {
        return Err(MachineError::MisalignedInstruction(target));
    }
    Ok(target)
}

/// Shift amount mask for the machine width.
#[inline(always)]
const fn shamt_mask<const W: usize>() -> u32 {
    if W == 4 {
        31
    } else {
        63
    }
}

// Floating point helpers with RISC-V semantics where the host operators
// differ (NaN propagation in min/max, NaN conversion results).

fn fmin32(a: f32, b: f32) -> f32 {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => f32::NAN,
        (true, false) => b,
        (false, true) => a,
        _ if a == b => {
            if a.is_sign_negative() {
                a
            } else {
                b
            }
        }
        _ => a.min(b),
    }
}

fn fmax32(a: f32, b: f32) -> f32 {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => f32::NAN,
        (true, false) => b,
        (false, true) => a,
        _ if a == b => {
            if a.is_sign_positive() {
                a
            } else {
                b
            }
        }
        _ => a.max(b),
    }
}

fn fmin64(a: f64, b: f64) -> f64 {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => f64::NAN,
        (true, false) => b,
        (false, true) => a,
        _ if a == b => {
            if a.is_sign_negative() {
                a
            } else {
                b
            }
        }
        _ => a.min(b),
    }
}

fn fmax64(a: f64, b: f64) -> f64 {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => f64::NAN,
        (true, false) => b,
        (false, true) => a,
        _ if a == b => {
            if a.is_sign_positive() {
                a
            } else {
                b
            }
        }
        _ => a.max(b),
    }
}

// `as` casts saturate but send NaN to zero; RISC-V sends NaN to the
// maximum value of the destination type.

macro_rules! fcvt_int {
    ($name:ident, $f:ty, $i:ty) => {
        fn $name(v: $f) -> $i {
            if v.is_nan() {
                <$i>::MAX
            } else {
                v as $i
            }
        }
    };
}

fcvt_int!(f32_to_i32, f32, i32);
fcvt_int!(f32_to_u32, f32, u32);
fcvt_int!(f32_to_i64, f32, i64);
fcvt_int!(f32_to_u64, f32, u64);
fcvt_int!(f64_to_i32, f64, i32);
fcvt_int!(f64_to_u32, f64, u32);
fcvt_int!(f64_to_i64, f64, i64);
fcvt_int!(f64_to_u64, f64, u64);

/// FCLASS result bit for a single-precision value.
fn fclass32(v: f32) -> u64 {
    let bits = v.to_bits();
    let sign = bits >> 31 == 1;
    1u64 << match v.classify() {
        std::num::FpCategory::Infinite => {
            if sign {
                0
            } else {
                7
            }
        }
        std::num::FpCategory::Normal => {
            if sign {
                1
            } else {
                6
            }
        }
        std::num::FpCategory::Subnormal => {
            if sign {
                2
            } else {
                5
            }
        }
        std::num::FpCategory::Zero => {
            if sign {
                3
            } else {
                4
            }
        }
        std::num::FpCategory::Nan => {
            // Quiet bit is the top mantissa bit.
            if bits & 0x0040_0000 != 0 {
                9
            } else {
                8
            }
        }
    }
}

/// FCLASS result bit for a double-precision value.
fn fclass64(v: f64) -> u64 {
    let bits = v.to_bits();
    let sign = bits >> 63 == 1;
    1u64 << match v.classify() {
        std::num::FpCategory::Infinite => {
            if sign {
                0
            } else {
                7
            }
        }
        std::num::FpCategory::Normal => {
            if sign {
                1
            } else {
                6
            }
        }
        std::num::FpCategory::Subnormal => {
            if sign {
                2
            } else {
                5
            }
        }
        std::num::FpCategory::Zero => {
            if sign {
                3
            } else {
                4
            }
        }
        std::num::FpCategory::Nan => {
            if bits & 0x0008_0000_0000_0000 != 0 {
                9
            } else {
                8
            }
        }
    }
}

impl<const W: usize> Machine<W> {
    /// Executes one decoded instruction and advances the PC.
    #[allow(clippy::too_many_lines)]
    pub(crate) fn execute_entry(&mut self, entry: DecodedEntry) -> Result<(), MachineError> {
        use Opcode::*;
        let inst = Inst(entry.word);
        let pc = self.cpu.regs.pc;
        let mut next_pc = (pc.wrapping_add(entry.len as u64)) & Memory::<W>::ADDR_MASK;

        macro_rules! rs1 {
            () => {
                self.cpu.regs.get(inst.rs1())
            };
        }
        macro_rules! rs2 {
            () => {
                self.cpu.regs.get(inst.rs2())
            };
        }
        macro_rules! wr {
            ($v:expr) => {
                self.cpu.regs.set(inst.rd(), $v)
            };
        }

        match entry.opcode {
            INVALID => return Err(MachineError::IllegalOperation(entry.word)),

            // ---------------- upper immediates and jumps ----------------
            LUI => wr!(inst.imm_u() as u64),
            AUIPC => wr!(pc.wrapping_add(inst.imm_u() as u64)),
            JAL => {
                let target = check_jump::<W>(pc.wrapping_add(inst.imm_j() as u64))?;
                wr!(next_pc);
                next_pc = target;
            }
            JALR => {
                let base = rs1!();
                let target = check_jump::<W>(base.wrapping_add(inst.imm_i() as u64) & !1)?;
                wr!(next_pc);
                next_pc = target;
            }

            // ---------------- branches ----------------
            BEQ => {
                if rs1!() == rs2!() {
                    next_pc = check_jump::<W>(pc.wrapping_add(inst.imm_b() as u64))?;
                }
            }
            BNE => {
                if rs1!() != rs2!() {
                    next_pc = check_jump::<W>(pc.wrapping_add(inst.imm_b() as u64))?;
                }
            }
            BLT => {
                if (rs1!() as i64) < (rs2!() as i64) {
                    next_pc = check_jump::<W>(pc.wrapping_add(inst.imm_b() as u64))?;
                }
            }
            BGE => {
                if (rs1!() as i64) >= (rs2!() as i64) {
                    next_pc = check_jump::<W>(pc.wrapping_add(inst.imm_b() as u64))?;
                }
            }
            BLTU => {
                if rs1!() < rs2!() {
                    next_pc = check_jump::<W>(pc.wrapping_add(inst.imm_b() as u64))?;
                }
            }
            BGEU => {
                if rs1!() >= rs2!() {
                    next_pc = check_jump::<W>(pc.wrapping_add(inst.imm_b() as u64))?;
                }
            }

            // ---------------- loads ----------------
            LB => {
                let addr = rs1!().wrapping_add(inst.imm_i() as u64);
                wr!(self.memory.read::<u8>(addr)? as i8 as i64 as u64);
            }
            LBU => {
                let addr = rs1!().wrapping_add(inst.imm_i() as u64);
                wr!(self.memory.read::<u8>(addr)? as u64);
            }
            LH => {
                let addr = rs1!().wrapping_add(inst.imm_i() as u64);
                wr!(self.memory.read::<u16>(addr)? as i16 as i64 as u64);
            }
            LHU => {
                let addr = rs1!().wrapping_add(inst.imm_i() as u64);
                wr!(self.memory.read::<u16>(addr)? as u64);
            }
            LW => {
                let addr = rs1!().wrapping_add(inst.imm_i() as u64);
                wr!(self.memory.read::<u32>(addr)? as i32 as i64 as u64);
            }
            LWU => {
                let addr = rs1!().wrapping_add(inst.imm_i() as u64);
                wr!(self.memory.read::<u32>(addr)? as u64);
            }
            LD => {
                let addr = rs1!().wrapping_add(inst.imm_i() as u64);
                wr!(self.memory.read::<u64>(addr)?);
            }

            // ---------------- stores ----------------
            SB => {
                let addr = rs1!().wrapping_add(inst.imm_s() as u64);
                self.memory.write::<u8>(addr, rs2!() as u8)?;
            }
            SH => {
                let addr = rs1!().wrapping_add(inst.imm_s() as u64);
                self.memory.write::<u16>(addr, rs2!() as u16)?;
            }
            SW => {
                let addr = rs1!().wrapping_add(inst.imm_s() as u64);
                self.memory.write::<u32>(addr, rs2!() as u32)?;
            }
            SD => {
                let addr = rs1!().wrapping_add(inst.imm_s() as u64);
                self.memory.write::<u64>(addr, rs2!())?;
            }

            // ---------------- register-immediate ALU ----------------
            ADDI => wr!(rs1!().wrapping_add(inst.imm_i() as u64)),
            SLTI => wr!(u64::from((rs1!() as i64) < inst.imm_i())),
            SLTIU => wr!(u64::from(rs1!() < inst.imm_i() as u64)),
            XORI => wr!(rs1!() ^ inst.imm_i() as u64),
            ORI => wr!(rs1!() | inst.imm_i() as u64),
            ANDI => wr!(rs1!() & inst.imm_i() as u64),
            SLLI => {
                let sh = inst.shamt() & shamt_mask::<W>();
                if W == 4 {
                    wr!(((rs1!() as u32) << sh) as u64);
                } else {
                    wr!(rs1!() << sh);
                }
            }
            SRLI => {
                let sh = inst.shamt() & shamt_mask::<W>();
                if W == 4 {
                    wr!(((rs1!() as u32) >> sh) as u64);
                } else {
                    wr!(rs1!() >> sh);
                }
            }
            SRAI => {
                let sh = inst.shamt() & shamt_mask::<W>();
                if W == 4 {
                    wr!(((rs1!() as u32 as i32) >> sh) as u64);
                } else {
                    wr!(((rs1!() as i64) >> sh) as u64);
                }
            }

            // ---------------- register-register ALU ----------------
            ADD => wr!(rs1!().wrapping_add(rs2!())),
            SUB => wr!(rs1!().wrapping_sub(rs2!())),
            SLL => {
                let sh = (rs2!() as u32) & shamt_mask::<W>();
                if W == 4 {
                    wr!(((rs1!() as u32) << sh) as u64);
                } else {
                    wr!(rs1!() << sh);
                }
            }
            SRL => {
                let sh = (rs2!() as u32) & shamt_mask::<W>();
                if W == 4 {
                    wr!(((rs1!() as u32) >> sh) as u64);
                } else {
                    wr!(rs1!() >> sh);
                }
            }
            SRA => {
                let sh = (rs2!() as u32) & shamt_mask::<W>();
                if W == 4 {
                    wr!(((rs1!() as u32 as i32) >> sh) as u64);
                } else {
                    wr!(((rs1!() as i64) >> sh) as u64);
                }
            }
            SLT => wr!(u64::from((rs1!() as i64) < (rs2!() as i64))),
            SLTU => wr!(u64::from(rs1!() < rs2!())),
            XOR => wr!(rs1!() ^ rs2!()),
            OR => wr!(rs1!() | rs2!()),
            AND => wr!(rs1!() & rs2!()),

            // ---------------- RV64 W-suffix ALU ----------------
            ADDIW => wr!((rs1!() as u32).wrapping_add(inst.imm_i() as u32) as i32 as i64 as u64),
            SLLIW => {
                let sh = inst.shamt() & 31;
                wr!(((rs1!() as u32) << sh) as i32 as i64 as u64);
            }
            SRLIW => {
                let sh = inst.shamt() & 31;
                wr!(((rs1!() as u32) >> sh) as i32 as i64 as u64);
            }
            SRAIW => {
                let sh = inst.shamt() & 31;
                wr!(((rs1!() as u32 as i32) >> sh) as i64 as u64);
            }
            ADDW => wr!((rs1!() as u32).wrapping_add(rs2!() as u32) as i32 as i64 as u64),
            SUBW => wr!((rs1!() as u32).wrapping_sub(rs2!() as u32) as i32 as i64 as u64),
            SLLW => {
                let sh = (rs2!() as u32) & 31;
                wr!(((rs1!() as u32) << sh) as i32 as i64 as u64);
            }
            SRLW => {
                let sh = (rs2!() as u32) & 31;
                wr!(((rs1!() as u32) >> sh) as i32 as i64 as u64);
            }
            SRAW => {
                let sh = (rs2!() as u32) & 31;
                wr!(((rs1!() as u32 as i32) >> sh) as i64 as u64);
            }

            // ---------------- system ----------------
            FENCE => {}
            ECALL => {
                let number = self.cpu.regs.get(17);
                // The handler observes the PC past the ECALL and may
                // redirect it (or stop the machine).
                self.cpu.regs.pc = next_pc;
                self.dispatch_syscall(number)?;
                next_pc = self.cpu.regs.pc;
            }
            EBREAK => return Err(MachineError::IllegalOperation(entry.word)),
            CSRRW => {
                let value = rs1!();
                if inst.rd() != 0 {
                    let old = self.csr_read(inst.csr(), entry.word)?;
                    wr!(old);
                }
                self.csr_write(inst.csr(), value, entry.word)?;
            }
            CSRRS => {
                let old = self.csr_read(inst.csr(), entry.word)?;
                if inst.rs1() != 0 {
                    self.csr_write(inst.csr(), old | rs1!(), entry.word)?;
                }
                wr!(old);
            }
            CSRRC => {
                let old = self.csr_read(inst.csr(), entry.word)?;
                if inst.rs1() != 0 {
                    self.csr_write(inst.csr(), old & !rs1!(), entry.word)?;
                }
                wr!(old);
            }
            CSRRWI => {
                if inst.rd() != 0 {
                    let old = self.csr_read(inst.csr(), entry.word)?;
                    wr!(old);
                }
                self.csr_write(inst.csr(), inst.rs1() as u64, entry.word)?;
            }
            CSRRSI => {
                let old = self.csr_read(inst.csr(), entry.word)?;
                if inst.rs1() != 0 {
                    self.csr_write(inst.csr(), old | inst.rs1() as u64, entry.word)?;
                }
                wr!(old);
            }
            CSRRCI => {
                let old = self.csr_read(inst.csr(), entry.word)?;
                if inst.rs1() != 0 {
                    self.csr_write(inst.csr(), old & !(inst.rs1() as u64), entry.word)?;
                }
                wr!(old);
            }

            // ---------------- M extension ----------------
            MUL => wr!(rs1!().wrapping_mul(rs2!())),
            MULH => {
                if W == 4 {
                    let v = (rs1!() as u32 as i32 as i64).wrapping_mul(rs2!() as u32 as i32 as i64);
                    wr!((v >> 32) as u64);
                } else {
                    let v = (rs1!() as i64 as i128).wrapping_mul(rs2!() as i64 as i128);
                    wr!((v >> 64) as u64);
                }
            }
            MULHU => {
                if W == 4 {
                    let v = (rs1!() as u32 as u64).wrapping_mul(rs2!() as u32 as u64);
                    wr!(v >> 32);
                } else {
                    let v = (rs1!() as u128).wrapping_mul(rs2!() as u128);
                    wr!((v >> 64) as u64);
                }
            }
            MULHSU => {
                if W == 4 {
                    let v = (rs1!() as u32 as i32 as i64).wrapping_mul(rs2!() as u32 as u64 as i64);
                    wr!((v >> 32) as u64);
                } else {
                    let v = (rs1!() as i64 as i128).wrapping_mul(rs2!() as u128 as i128);
                    wr!((v >> 64) as u64);
                }
            }
            DIV => {
                if W == 4 {
                    let (a, b) = (rs1!() as u32 as i32, rs2!() as u32 as i32);
                    wr!(if b == 0 { u64::MAX } else { a.wrapping_div(b) as i64 as u64 });
                } else {
                    let (a, b) = (rs1!() as i64, rs2!() as i64);
                    wr!(if b == 0 { u64::MAX } else { a.wrapping_div(b) as u64 });
                }
            }
            DIVU => {
                if W == 4 {
                    let (a, b) = (rs1!() as u32, rs2!() as u32);
                    wr!(if b == 0 { u64::MAX } else { (a / b) as u64 });
                } else {
                    let (a, b) = (rs1!(), rs2!());
                    wr!(if b == 0 { u64::MAX } else { a / b });
                }
            }
            REM => {
                if W == 4 {
                    let (a, b) = (rs1!() as u32 as i32, rs2!() as u32 as i32);
                    wr!(if b == 0 { a as i64 as u64 } else { a.wrapping_rem(b) as i64 as u64 });
                } else {
                    let (a, b) = (rs1!() as i64, rs2!() as i64);
                    wr!(if b == 0 { a as u64 } else { a.wrapping_rem(b) as u64 });
                }
            }
            REMU => {
                if W == 4 {
                    let (a, b) = (rs1!() as u32, rs2!() as u32);
                    wr!(if b == 0 { a as u64 } else { (a % b) as u64 });
                } else {
                    let (a, b) = (rs1!(), rs2!());
                    wr!(if b == 0 { a } else { a % b });
                }
            }
            MULW => wr!((rs1!() as u32).wrapping_mul(rs2!() as u32) as i32 as i64 as u64),
            DIVW => {
                let (a, b) = (rs1!() as u32 as i32, rs2!() as u32 as i32);
                wr!(if b == 0 { u64::MAX } else { a.wrapping_div(b) as i64 as u64 });
            }
            DIVUW => {
                let (a, b) = (rs1!() as u32, rs2!() as u32);
                wr!(if b == 0 { u64::MAX } else { (a / b) as i32 as i64 as u64 });
            }
            REMW => {
                let (a, b) = (rs1!() as u32 as i32, rs2!() as u32 as i32);
                wr!(if b == 0 { a as i64 as u64 } else { a.wrapping_rem(b) as i64 as u64 });
            }
            REMUW => {
                let (a, b) = (rs1!() as u32, rs2!() as u32);
                wr!(if b == 0 { a as i32 as i64 as u64 } else { (a % b) as i32 as i64 as u64 });
            }

            // ---------------- A extension ----------------
            LR_W => {
                let addr = rs1!();
                if addr & 3 != 0 {
                    return Err(MachineError::MisalignedMemory(addr));
                }
                let v = self.memory.read::<u32>(addr)?;
                self.cpu.reservation = Some(addr);
                wr!(v as i32 as i64 as u64);
            }
            SC_W => {
                let addr = rs1!();
                if addr & 3 != 0 {
                    return Err(MachineError::MisalignedMemory(addr));
                }
                if self.cpu.reservation.take() == Some(addr) {
                    self.memory.write::<u32>(addr, rs2!() as u32)?;
                    wr!(0);
                } else {
                    wr!(1);
                }
            }
            AMOSWAP_W | AMOADD_W | AMOXOR_W | AMOAND_W | AMOOR_W | AMOMIN_W | AMOMAX_W
            | AMOMINU_W | AMOMAXU_W => {
                let addr = rs1!();
                if addr & 3 != 0 {
                    return Err(MachineError::MisalignedMemory(addr));
                }
                let old = self.memory.read::<u32>(addr)?;
                let src = rs2!() as u32;
                let new = match entry.opcode {
                    AMOSWAP_W => src,
                    AMOADD_W => old.wrapping_add(src),
                    AMOXOR_W => old ^ src,
                    AMOAND_W => old & src,
                    AMOOR_W => old | src,
                    AMOMIN_W => (old as i32).min(src as i32) as u32,
                    AMOMAX_W => (old as i32).max(src as i32) as u32,
                    AMOMINU_W => old.min(src),
                    _ => old.max(src),
                };
                self.memory.write::<u32>(addr, new)?;
                wr!(old as i32 as i64 as u64);
            }
            LR_D => {
                let addr = rs1!();
                if addr & 7 != 0 {
                    return Err(MachineError::MisalignedMemory(addr));
                }
                let v = self.memory.read::<u64>(addr)?;
                self.cpu.reservation = Some(addr);
                wr!(v);
            }
            SC_D => {
                let addr = rs1!();
                if addr & 7 != 0 {
                    return Err(MachineError::MisalignedMemory(addr));
                }
                if self.cpu.reservation.take() == Some(addr) {
                    self.memory.write::<u64>(addr, rs2!())?;
                    wr!(0);
                } else {
                    wr!(1);
                }
            }
            AMOSWAP_D | AMOADD_D | AMOXOR_D | AMOAND_D | AMOOR_D | AMOMIN_D | AMOMAX_D
            | AMOMINU_D | AMOMAXU_D => {
                let addr = rs1!();
                if addr & 7 != 0 {
                    return Err(MachineError::MisalignedMemory(addr));
                }
                let old = self.memory.read::<u64>(addr)?;
                let src = rs2!();
                let new = match entry.opcode {
                    AMOSWAP_D => src,
                    AMOADD_D => old.wrapping_add(src),
                    AMOXOR_D => old ^ src,
                    AMOAND_D => old & src,
                    AMOOR_D => old | src,
                    AMOMIN_D => (old as i64).min(src as i64) as u64,
                    AMOMAX_D => (old as i64).max(src as i64) as u64,
                    AMOMINU_D => old.min(src),
                    _ => old.max(src),
                };
                self.memory.write::<u64>(addr, new)?;
                wr!(old);
            }

            // ---------------- F/D loads and stores ----------------
            FLW => {
                let addr = rs1!().wrapping_add(inst.imm_i() as u64);
                let bits = self.memory.read::<u32>(addr)?;
                self.cpu.regs.set_f32(inst.rd(), f32::from_bits(bits));
            }
            FSW => {
                let addr = rs1!().wrapping_add(inst.imm_s() as u64);
                let bits = self.cpu.regs.get_f32(inst.rs2()).to_bits();
                self.memory.write::<u32>(addr, bits)?;
            }
            FLD => {
                let addr = rs1!().wrapping_add(inst.imm_i() as u64);
                let bits = self.memory.read::<u64>(addr)?;
                self.cpu.regs.set_f64(inst.rd(), f64::from_bits(bits));
            }
            FSD => {
                let addr = rs1!().wrapping_add(inst.imm_s() as u64);
                let bits = self.cpu.regs.get_f64(inst.rs2()).to_bits();
                self.memory.write::<u64>(addr, bits)?;
            }

            // ---------------- F arithmetic ----------------
            FMADD_S | FMSUB_S | FNMSUB_S | FNMADD_S => {
                let a = self.cpu.regs.get_f32(inst.rs1());
                let b = self.cpu.regs.get_f32(inst.rs2());
                let c = self.cpu.regs.get_f32(inst.rs3());
                let v = match entry.opcode {
                    FMADD_S => a.mul_add(b, c),
                    FMSUB_S => a.mul_add(b, -c),
                    FNMSUB_S => (-a).mul_add(b, c),
                    _ => (-a).mul_add(b, -c),
                };
                self.cpu.regs.set_f32(inst.rd(), v);
            }
            FADD_S | FSUB_S | FMUL_S | FDIV_S | FMIN_S | FMAX_S => {
                let a = self.cpu.regs.get_f32(inst.rs1());
                let b = self.cpu.regs.get_f32(inst.rs2());
                let v = match entry.opcode {
                    FADD_S => a + b,
                    FSUB_S => a - b,
                    FMUL_S => a * b,
                    FDIV_S => a / b,
                    FMIN_S => fmin32(a, b),
                    _ => fmax32(a, b),
                };
                self.cpu.regs.set_f32(inst.rd(), v);
            }
            FSQRT_S => {
                let v = self.cpu.regs.get_f32(inst.rs1()).sqrt();
                self.cpu.regs.set_f32(inst.rd(), v);
            }
            FSGNJ_S | FSGNJN_S | FSGNJX_S => {
                let a = self.cpu.regs.get_f32(inst.rs1()).to_bits();
                let b = self.cpu.regs.get_f32(inst.rs2()).to_bits();
                let sign = match entry.opcode {
                    FSGNJ_S => b & 0x8000_0000,
                    FSGNJN_S => !b & 0x8000_0000,
                    _ => (a ^ b) & 0x8000_0000,
                };
                self.cpu
                    .regs
                    .set_f32(inst.rd(), f32::from_bits((a & 0x7fff_ffff) | sign));
            }
            FEQ_S | FLT_S | FLE_S => {
                let a = self.cpu.regs.get_f32(inst.rs1());
                let b = self.cpu.regs.get_f32(inst.rs2());
                let v = match entry.opcode {
                    FEQ_S => a == b,
                    FLT_S => a < b,
                    _ => a <= b,
                };
                wr!(u64::from(v));
            }
            FCLASS_S => wr!(fclass32(self.cpu.regs.get_f32(inst.rs1()))),
            FCVT_W_S => wr!(f32_to_i32(self.cpu.regs.get_f32(inst.rs1())) as i64 as u64),
            FCVT_WU_S => wr!(f32_to_u32(self.cpu.regs.get_f32(inst.rs1())) as i32 as i64 as u64),
            FCVT_L_S => wr!(f32_to_i64(self.cpu.regs.get_f32(inst.rs1())) as u64),
            FCVT_LU_S => wr!(f32_to_u64(self.cpu.regs.get_f32(inst.rs1()))),
            FCVT_S_W => {
                let v = self.cpu.regs.get(inst.rs1()) as u32 as i32 as f32;
                self.cpu.regs.set_f32(inst.rd(), v);
            }
            FCVT_S_WU => {
                let v = self.cpu.regs.get(inst.rs1()) as u32 as f32;
                self.cpu.regs.set_f32(inst.rd(), v);
            }
            FCVT_S_L => {
                let v = self.cpu.regs.get(inst.rs1()) as i64 as f32;
                self.cpu.regs.set_f32(inst.rd(), v);
            }
            FCVT_S_LU => {
                let v = self.cpu.regs.get(inst.rs1()) as f32;
                self.cpu.regs.set_f32(inst.rd(), v);
            }
            FMV_X_W => {
                let bits = self.cpu.regs.get_f32(inst.rs1()).to_bits();
                wr!(bits as i32 as i64 as u64);
            }
            FMV_W_X => {
                let bits = self.cpu.regs.get(inst.rs1()) as u32;
                self.cpu.regs.set_f32(inst.rd(), f32::from_bits(bits));
            }

            // ---------------- D arithmetic ----------------
            FMADD_D | FMSUB_D | FNMSUB_D | FNMADD_D => {
                let a = self.cpu.regs.get_f64(inst.rs1());
                let b = self.cpu.regs.get_f64(inst.rs2());
                let c = self.cpu.regs.get_f64(inst.rs3());
                let v = match entry.opcode {
                    FMADD_D => a.mul_add(b, c),
                    FMSUB_D => a.mul_add(b, -c),
                    FNMSUB_D => (-a).mul_add(b, c),
                    _ => (-a).mul_add(b, -c),
                };
                self.cpu.regs.set_f64(inst.rd(), v);
            }
            FADD_D | FSUB_D | FMUL_D | FDIV_D | FMIN_D | FMAX_D => {
                let a = self.cpu.regs.get_f64(inst.rs1());
                let b = self.cpu.regs.get_f64(inst.rs2());
                let v = match entry.opcode {
                    FADD_D => a + b,
                    FSUB_D => a - b,
                    FMUL_D => a * b,
                    FDIV_D => a / b,
                    FMIN_D => fmin64(a, b),
                    _ => fmax64(a, b),
                };
                self.cpu.regs.set_f64(inst.rd(), v);
            }
            FSQRT_D => {
                let v = self.cpu.regs.get_f64(inst.rs1()).sqrt();
                self.cpu.regs.set_f64(inst.rd(), v);
            }
            FSGNJ_D | FSGNJN_D | FSGNJX_D => {
                let a = self.cpu.regs.get_f64(inst.rs1()).to_bits();
                let b = self.cpu.regs.get_f64(inst.rs2()).to_bits();
                let sign = match entry.opcode {
                    FSGNJ_D => b & (1 << 63),
                    FSGNJN_D => !b & (1 << 63),
                    _ => (a ^ b) & (1 << 63),
                };
                self.cpu
                    .regs
                    .set_f64(inst.rd(), f64::from_bits((a & !(1 << 63)) | sign));
            }
            FEQ_D | FLT_D | FLE_D => {
                let a = self.cpu.regs.get_f64(inst.rs1());
                let b = self.cpu.regs.get_f64(inst.rs2());
                let v = match entry.opcode {
                    FEQ_D => a == b,
                    FLT_D => a < b,
                    _ => a <= b,
                };
                wr!(u64::from(v));
            }
            FCLASS_D => wr!(fclass64(self.cpu.regs.get_f64(inst.rs1()))),
            FCVT_S_D => {
                let v = self.cpu.regs.get_f64(inst.rs1()) as f32;
                self.cpu.regs.set_f32(inst.rd(), v);
            }
            FCVT_D_S => {
                let v = self.cpu.regs.get_f32(inst.rs1()) as f64;
                self.cpu.regs.set_f64(inst.rd(), v);
            }
            FCVT_W_D => wr!(f64_to_i32(self.cpu.regs.get_f64(inst.rs1())) as i64 as u64),
            FCVT_WU_D => wr!(f64_to_u32(self.cpu.regs.get_f64(inst.rs1())) as i32 as i64 as u64),
            FCVT_L_D => wr!(f64_to_i64(self.cpu.regs.get_f64(inst.rs1())) as u64),
            FCVT_LU_D => wr!(f64_to_u64(self.cpu.regs.get_f64(inst.rs1()))),
            FCVT_D_W => {
                let v = self.cpu.regs.get(inst.rs1()) as u32 as i32 as f64;
                self.cpu.regs.set_f64(inst.rd(), v);
            }
            FCVT_D_WU => {
                let v = self.cpu.regs.get(inst.rs1()) as u32 as f64;
                self.cpu.regs.set_f64(inst.rd(), v);
            }
            FCVT_D_L => {
                let v = self.cpu.regs.get(inst.rs1()) as i64 as f64;
                self.cpu.regs.set_f64(inst.rd(), v);
            }
            FCVT_D_LU => {
                let v = self.cpu.regs.get(inst.rs1()) as f64;
                self.cpu.regs.set_f64(inst.rd(), v);
            }
            FMV_X_D => wr!(self.cpu.regs.get_f64(inst.rs1()).to_bits()),
            FMV_D_X => {
                let bits = self.cpu.regs.get(inst.rs1());
                self.cpu.regs.set_f64(inst.rd(), f64::from_bits(bits));
            }
        }

        self.cpu.regs.pc = next_pc;
        Ok(())
    }

    /// User-mode CSR read. Counters map to the instruction counter.
    fn csr_read(&self, csr: u32, word: u32) -> Result<u64, MachineError> {
        let fcsr = self.cpu.regs.fcsr as u64;
        Ok(match csr {
            // fflags, frm, fcsr
            0x001 => fcsr & 0x1f,
            0x002 => (fcsr >> 5) & 0x7,
            0x003 => fcsr & 0xff,
            // cycle, time, instret
            0xc00 | 0xc01 | 0xc02 => self.cpu.counter,
            // RV32 high halves
            0xc80 | 0xc81 | 0xc82 if W == 4 => self.cpu.counter >> 32,
            _ => return Err(MachineError::IllegalOperation(word)),
        })
    }

    /// User-mode CSR write; the counters are read-only.
    fn csr_write(&mut self, csr: u32, value: u64, word: u32) -> Result<(), MachineError> {
        let fcsr = self.cpu.regs.fcsr;
        self.cpu.regs.fcsr = match csr {
            0x001 => (fcsr & !0x1f) | (value as u32 & 0x1f),
            0x002 => (fcsr & !0xe0) | ((value as u32 & 0x7) << 5),
            0x003 => value as u32 & 0xff,
            _ => return Err(MachineError::IllegalOperation(word)),
        };
        Ok(())
    }
}
