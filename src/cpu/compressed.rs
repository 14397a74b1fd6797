//! Expansion of 16-bit compressed (RVC) encodings into their 32-bit
//! equivalents at decode time, so the interpreter dispatches on a single
//! instruction format.

/// 32-bit encode helpers used to synthesize the expanded form.
mod enc {
    pub fn r(op: u32, f3: u32, f7: u32, rd: usize, rs1: usize, rs2: usize) -> u32 {
        (f7 << 25)
            | ((rs2 as u32) << 20)
            | ((rs1 as u32) << 15)
            | (f3 << 12)
            | ((rd as u32) << 7)
            | op
    }

    pub fn i(op: u32, f3: u32, rd: usize, rs1: usize, imm: i32) -> u32 {
        (((imm as u32) & 0xfff) << 20) | ((rs1 as u32) << 15) | (f3 << 12) | ((rd as u32) << 7) | op
    }

    pub fn s(op: u32, f3: u32, rs1: usize, rs2: usize, imm: i32) -> u32 {
        let imm = imm as u32;
        (((imm >> 5) & 0x7f) << 25)
            | ((rs2 as u32) << 20)
            | ((rs1 as u32) << 15)
            | (f3 << 12)
            | ((imm & 0x1f) << 7)
            | op
    }

    pub fn b(op: u32, f3: u32, rs1: usize, rs2: usize, imm: i32) -> u32 {
        let imm = imm as u32;
        (((imm >> 12) & 0x1) << 31)
            | (((imm >> 5) & 0x3f) << 25)
            | ((rs2 as u32) << 20)
            | ((rs1 as u32) << 15)
            | (f3 << 12)
            | (((imm >> 1) & 0xf) << 8)
            | (((imm >> 11) & 0x1) << 7)
            | op
    }

    pub fn u(op: u32, rd: usize, imm: i32) -> u32 {
        ((imm as u32) & 0xffff_f000) | ((rd as u32) << 7) | op
    }

    pub fn j(op: u32, rd: usize, imm: i32) -> u32 {
        let imm = imm as u32;
        (((imm >> 20) & 0x1) << 31)
            | (((imm >> 1) & 0x3ff) << 21)
            | (((imm >> 11) & 0x1) << 20)
            | (((imm >> 12) & 0xff) << 12)
            | ((rd as u32) << 7)
            | op
    }
}

const OP_LOAD: u32 = 0x03;
const OP_LOAD_FP: u32 = 0x07;
const OP_IMM: u32 = 0x13;
const OP_IMM32: u32 = 0x1b;
const OP_STORE: u32 = 0x23;
const OP_STORE_FP: u32 = 0x27;
const OP: u32 = 0x33;
const OP_32: u32 = 0x3b;
const OP_LUI: u32 = 0x37;
const OP_BRANCH: u32 = 0x63;
const OP_JALR: u32 = 0x67;
const OP_JAL: u32 = 0x6f;
const EBREAK_WORD: u32 = 0x0010_0073;

/// The x8..x15 register encoded in a 3-bit RVC field.
#[inline]
fn creg(bits: u16) -> usize {
    8 + (bits & 0x7) as usize
}

#[inline]
fn bit(half: u16, pos: u32) -> u32 {
    ((half >> pos) & 1) as u32
}

#[inline]
fn bits(half: u16, pos: u32, count: u32) -> u32 {
    ((half >> pos) as u32) & ((1 << count) - 1)
}

/// Sign-extends the low `width` bits of `v`.
#[inline]
fn sext(v: u32, width: u32) -> i32 {
    let shift = 32 - width;
    ((v << shift) as i32) >> shift
}

/// CI-format 6-bit immediate: imm[5] at bit 12, imm[4:0] at bits 6:2.
#[inline]
fn imm_ci(half: u16) -> i32 {
    sext((bit(half, 12) << 5) | bits(half, 2, 5), 6)
}

/// CJ-format jump offset (C.J / C.JAL).
#[inline]
fn imm_cj(half: u16) -> i32 {
    let imm = (bit(half, 12) << 11)
        | (bit(half, 11) << 4)
        | (bits(half, 9, 2) << 8)
        | (bit(half, 8) << 10)
        | (bit(half, 7) << 6)
        | (bit(half, 6) << 7)
        | (bits(half, 3, 3) << 1)
        | (bit(half, 2) << 5);
    sext(imm, 12)
}

/// CB-format branch offset (C.BEQZ / C.BNEZ).
#[inline]
fn imm_cb(half: u16) -> i32 {
    let imm = (bit(half, 12) << 8)
        | (bits(half, 10, 2) << 3)
        | (bits(half, 5, 2) << 6)
        | (bits(half, 3, 2) << 1)
        | (bit(half, 2) << 5);
    sext(imm, 9)
}

/// Expands a compressed instruction into its 32-bit equivalent, or
/// `None` for reserved and disabled encodings.
#[allow(clippy::too_many_lines)]
pub fn expand<const W: usize>(half: u16) -> Option<u32> {
    let funct3 = (half >> 13) & 0x7;
    match half & 0x3 {
        0b00 => expand_q0::<W>(half, funct3),
        0b01 => expand_q1::<W>(half, funct3),
        0b10 => expand_q2::<W>(half, funct3),
        _ => None,
    }
}

fn expand_q0<const W: usize>(half: u16, funct3: u16) -> Option<u32> {
    let rd = creg(half >> 2);
    let rs1 = creg(half >> 7);
    // Scaled load/store offsets for 4- and 8-byte element forms.
    let uimm_w = ((bits(half, 10, 3) << 3) | (bit(half, 6) << 2) | (bit(half, 5) << 6)) as i32;
    let uimm_d = ((bits(half, 10, 3) << 3) | (bits(half, 5, 2) << 6)) as i32;
    match funct3 {
        0b000 => {
            // C.ADDI4SPN; the all-zero halfword is the canonical illegal
            // instruction.
            let uimm = (bits(half, 11, 2) << 4)
                | (bits(half, 7, 4) << 6)
                | (bit(half, 6) << 2)
                | (bit(half, 5) << 3);
            if uimm == 0 {
                return None;
            }
            Some(enc::i(OP_IMM, 0, rd, 2, uimm as i32))
        }
        0b001 if cfg!(feature = "float") => Some(enc::i(OP_LOAD_FP, 3, rd, rs1, uimm_d)),
        0b010 => Some(enc::i(OP_LOAD, 2, rd, rs1, uimm_w)),
        0b011 if W == 4 && cfg!(feature = "float") => Some(enc::i(OP_LOAD_FP, 2, rd, rs1, uimm_w)),
        0b011 if W == 8 => Some(enc::i(OP_LOAD, 3, rd, rs1, uimm_d)),
        0b101 if cfg!(feature = "float") => Some(enc::s(OP_STORE_FP, 3, rs1, rd, uimm_d)),
        0b110 => Some(enc::s(OP_STORE, 2, rs1, rd, uimm_w)),
        0b111 if W == 4 && cfg!(feature = "float") => Some(enc::s(OP_STORE_FP, 2, rs1, rd, uimm_w)),
        0b111 if W == 8 => Some(enc::s(OP_STORE, 3, rs1, rd, uimm_d)),
        _ => None,
    }
}

fn expand_q1<const W: usize>(half: u16, funct3: u16) -> Option<u32> {
    let rd = bits(half, 7, 5) as usize;
    match funct3 {
        // C.ADDI (C.NOP when rd is x0)
        0b000 => Some(enc::i(OP_IMM, 0, rd, rd, imm_ci(half))),
        0b001 if W == 4 => Some(enc::j(OP_JAL, 1, imm_cj(half))),
        0b001 if W == 8 => {
            if rd == 0 {
                return None;
            }
            Some(enc::i(OP_IMM32, 0, rd, rd, imm_ci(half)))
        }
        // C.LI
        0b010 => Some(enc::i(OP_IMM, 0, rd, 0, imm_ci(half))),
        0b011 => {
            if rd == 2 {
                // C.ADDI16SP
                let imm = (bit(half, 12) << 9)
                    | (bit(half, 6) << 4)
                    | (bit(half, 5) << 6)
                    | (bits(half, 3, 2) << 7)
                    | (bit(half, 2) << 5);
                let imm = sext(imm, 10);
                if imm == 0 {
                    return None;
                }
                Some(enc::i(OP_IMM, 0, 2, 2, imm))
            } else {
                // C.LUI
                let imm = imm_ci(half).checked_shl(12)?;
                if imm == 0 {
                    return None;
                }
                Some(enc::u(OP_LUI, rd, imm))
            }
        }
        0b100 => {
            let rs1 = creg(half >> 7);
            match bits(half, 10, 2) {
                0b00 | 0b01 => {
                    // C.SRLI / C.SRAI
                    let shamt = (bit(half, 12) << 5) | bits(half, 2, 5);
                    if W == 4 && shamt >= 32 {
                        return None;
                    }
                    let f7 = if bits(half, 10, 2) == 0b01 { 0x20 } else { 0 };
                    Some(enc::r(OP_IMM, 5, f7, rs1, rs1, (shamt & 0x1f) as usize)
                        | ((shamt >> 5) << 25))
                }
                0b10 => Some(enc::i(OP_IMM, 7, rs1, rs1, imm_ci(half))),
                _ => {
                    let rs2 = creg(half >> 2);
                    match (bit(half, 12), bits(half, 5, 2)) {
                        (0, 0b00) => Some(enc::r(OP, 0, 0x20, rs1, rs1, rs2)),
                        (0, 0b01) => Some(enc::r(OP, 4, 0, rs1, rs1, rs2)),
                        (0, 0b10) => Some(enc::r(OP, 6, 0, rs1, rs1, rs2)),
                        (0, 0b11) => Some(enc::r(OP, 7, 0, rs1, rs1, rs2)),
                        (1, 0b00) if W == 8 => Some(enc::r(OP_32, 0, 0x20, rs1, rs1, rs2)),
                        (1, 0b01) if W == 8 => Some(enc::r(OP_32, 0, 0, rs1, rs1, rs2)),
                        _ => None,
                    }
                }
            }
        }
        0b101 => Some(enc::j(OP_JAL, 0, imm_cj(half))),
        0b110 => Some(enc::b(OP_BRANCH, 0, creg(half >> 7), 0, imm_cb(half))),
        0b111 => Some(enc::b(OP_BRANCH, 1, creg(half >> 7), 0, imm_cb(half))),
        _ => None,
    }
}

fn expand_q2<const W: usize>(half: u16, funct3: u16) -> Option<u32> {
    let rd = bits(half, 7, 5) as usize;
    let rs2 = bits(half, 2, 5) as usize;
    // Stack-pointer-relative offsets.
    let uimm_lwsp = ((bit(half, 12) << 5) | (bits(half, 4, 3) << 2) | (bits(half, 2, 2) << 6)) as i32;
    let uimm_ldsp = ((bit(half, 12) << 5) | (bits(half, 5, 2) << 3) | (bits(half, 2, 3) << 6)) as i32;
    let uimm_swsp = ((bits(half, 9, 4) << 2) | (bits(half, 7, 2) << 6)) as i32;
    let uimm_sdsp = ((bits(half, 10, 3) << 3) | (bits(half, 7, 3) << 6)) as i32;
    match funct3 {
        0b000 => {
            // C.SLLI
            let shamt = (bit(half, 12) << 5) | bits(half, 2, 5);
            if W == 4 && shamt >= 32 {
                return None;
            }
            Some(enc::i(OP_IMM, 1, rd, rd, shamt as i32))
        }
        0b001 if cfg!(feature = "float") => Some(enc::i(OP_LOAD_FP, 3, rd, 2, uimm_ldsp)),
        0b010 => {
            if rd == 0 {
                return None;
            }
            Some(enc::i(OP_LOAD, 2, rd, 2, uimm_lwsp))
        }
        0b011 if W == 4 && cfg!(feature = "float") => Some(enc::i(OP_LOAD_FP, 2, rd, 2, uimm_lwsp)),
        0b011 if W == 8 => {
            if rd == 0 {
                return None;
            }
            Some(enc::i(OP_LOAD, 3, rd, 2, uimm_ldsp))
        }
        0b100 => match (bit(half, 12), rd, rs2) {
            (0, 0, _) => None,
            // C.JR
            (0, rs1, 0) => Some(enc::i(OP_JALR, 0, 0, rs1, 0)),
            // C.MV
            (0, rd, rs2) => Some(enc::r(OP, 0, 0, rd, 0, rs2)),
            (1, 0, 0) => Some(EBREAK_WORD),
            // C.JALR
            (1, rs1, 0) => Some(enc::i(OP_JALR, 0, 1, rs1, 0)),
            // C.ADD
            (1, rd, rs2) => Some(enc::r(OP, 0, 0, rd, rd, rs2)),
            _ => None,
        },
        0b101 if cfg!(feature = "float") => Some(enc::s(OP_STORE_FP, 3, 2, rs2, uimm_sdsp)),
        0b110 => Some(enc::s(OP_STORE, 2, 2, rs2, uimm_swsp)),
        0b111 if W == 4 && cfg!(feature = "float") => Some(enc::s(OP_STORE_FP, 2, 2, rs2, uimm_swsp)),
        0b111 if W == 8 => Some(enc::s(OP_STORE, 3, 2, rs2, uimm_sdsp)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::decoder::{decode32, Inst, Opcode};

    fn expand64(half: u16) -> u32 {
        expand::<8>(half).expect("encoding should expand")
    }

    #[test]
    fn all_zero_halfword_is_illegal() {
        assert_eq!(expand::<4>(0), None);
        assert_eq!(expand::<8>(0), None);
    }

    #[test]
    fn c_addi_expands_to_addi() {
        // c.addi a0, -3  => rd=10, imm=-3 (0b111101)
        let half: u16 = 0b000_1_01010_11101_01;
        let word = expand64(half);
        assert_eq!(decode32::<8>(word), Opcode::ADDI);
        let inst = Inst(word);
        assert_eq!(inst.rd(), 10);
        assert_eq!(inst.rs1(), 10);
        assert_eq!(inst.imm_i(), -3);
    }

    #[test]
    fn c_li_loads_immediate_into_register() {
        // c.li a0, 1
        let half: u16 = 0b010_0_01010_00001_01;
        let word = expand64(half);
        assert_eq!(decode32::<8>(word), Opcode::ADDI);
        let inst = Inst(word);
        assert_eq!((inst.rd(), inst.rs1(), inst.imm_i()), (10, 0, 1));
    }

    #[test]
    fn c_lw_scales_the_offset() {
        // c.lw a0(x10'), 4(a1): rd'=x10 => 010, rs1'=x11 => 011,
        // offset 4 => imm[2]=1 at bit 6
        let half: u16 = 0b010_000_011_1_0_010_00;
        let word = expand::<4>(half).unwrap();
        assert_eq!(decode32::<4>(word), Opcode::LW);
        let inst = Inst(word);
        assert_eq!((inst.rd(), inst.rs1(), inst.imm_i()), (10, 11, 4));
    }

    #[test]
    fn c_jr_and_c_mv_share_an_encoding_row() {
        // c.jr ra
        let jr: u16 = 0b100_0_00001_00000_10;
        let word = expand64(jr);
        assert_eq!(decode32::<8>(word), Opcode::JALR);
        assert_eq!(Inst(word).rd(), 0);
        assert_eq!(Inst(word).rs1(), 1);
        // c.mv a0, a1
        let mv: u16 = 0b100_0_01010_01011_10;
        let word = expand64(mv);
        assert_eq!(decode32::<8>(word), Opcode::ADD);
        let inst = Inst(word);
        assert_eq!((inst.rd(), inst.rs1(), inst.rs2()), (10, 0, 11));
    }

    #[test]
    fn c_ebreak_expands_exactly() {
        let half: u16 = 0b100_1_00000_00000_10;
        assert_eq!(expand64(half), 0x0010_0073);
    }

    #[test]
    fn c_j_offset_round_trips() {
        for offset in [-2048i32, -256, -2, 0, 2, 64, 2046] {
            // Reassemble the CJ field bits from the offset.
            let o = offset as u32;
            let half: u16 = 0b101_00000000000_01
                | ((((o >> 11) & 1) << 12)
                    | (((o >> 4) & 1) << 11)
                    | (((o >> 8) & 3) << 9)
                    | (((o >> 10) & 1) << 8)
                    | (((o >> 6) & 1) << 7)
                    | (((o >> 7) & 1) << 6)
                    | (((o >> 1) & 7) << 3)
                    | (((o >> 5) & 1) << 2)) as u16;
            let word = expand64(half);
            assert_eq!(decode32::<8>(word), Opcode::JAL);
            assert_eq!(Inst(word).rd(), 0, "offset {offset}");
            assert_eq!(Inst(word).imm_j(), offset as i64, "offset {offset}");
        }
    }

    #[test]
    fn c_beqz_maps_to_beq_with_x0() {
        // c.beqz x8, 16: rs1'=000, offset 16 => bit 4 -> encoded at bit 11
        let o = 16u32;
        let half: u16 = 0b110_000_000_00000_01
            | ((((o >> 8) & 1) << 12)
                | (((o >> 3) & 3) << 10)
                | (((o >> 6) & 3) << 5)
                | (((o >> 1) & 3) << 3)
                | (((o >> 5) & 1) << 2)) as u16;
        let word = expand64(half);
        assert_eq!(decode32::<8>(word), Opcode::BEQ);
        let inst = Inst(word);
        assert_eq!((inst.rs1(), inst.rs2()), (8, 0));
        assert_eq!(inst.imm_b(), 16);
    }

    #[test]
    fn c_sdsp_is_rv64_only() {
        // c.sdsp ra, 0(sp)
        let half: u16 = 0b111_000_000_00001_10;
        let word = expand::<8>(half).unwrap();
        assert_eq!(decode32::<8>(word), Opcode::SD);
        let inst = Inst(word);
        assert_eq!((inst.rs1(), inst.rs2(), inst.imm_s()), (2, 1, 0));
        // On RV32 the same row is C.FSWSP.
        if cfg!(feature = "float") {
            assert_eq!(decode32::<4>(expand::<4>(half).unwrap()), Opcode::FSW);
        }
    }

    #[test]
    fn c_addi16sp_and_c_lui_split_on_rd() {
        // c.addi16sp sp, 32: imm=32 => bit5 at position 2
        let half: u16 = 0b011_0_00010_00001_01;
        let word = expand64(half);
        assert_eq!(decode32::<8>(word), Opcode::ADDI);
        let inst = Inst(word);
        assert_eq!((inst.rd(), inst.rs1(), inst.imm_i()), (2, 2, 32));
        // c.lui a1, 1
        let half: u16 = 0b011_0_01011_00001_01;
        let word = expand64(half);
        assert_eq!(decode32::<8>(word), Opcode::LUI);
        assert_eq!(Inst(word).imm_u(), 0x1000);
    }

    #[test]
    fn c_sub_family_uses_the_arith_row() {
        // c.sub x8, x9
        let half: u16 = 0b100_0_11_000_00_001_01;
        let word = expand64(half);
        assert_eq!(decode32::<8>(word), Opcode::SUB);
        let inst = Inst(word);
        assert_eq!((inst.rd(), inst.rs1(), inst.rs2()), (8, 8, 9));
        // c.addw x8, x9 is RV64-only
        let half: u16 = 0b100_1_11_000_01_001_01;
        assert_eq!(decode32::<8>(expand64(half)), Opcode::ADDW);
        assert_eq!(expand::<4>(half), None);
    }
}
