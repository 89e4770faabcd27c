use crate::float::RoundingMode;
use crate::superscalar::{high_mul, signed_high_mul};

use super::bytecode::{scale, ByteCode, FloatReg, Machine};

/// Runs `code` once from the first instruction.
pub(crate) fn execute(code: &[ByteCode], m: &mut Machine<'_>) {
    let mut pc = 0;
    while let Some(instr) = code.get(pc) {
        pc = step(instr, m).unwrap_or(pc + 1);
    }
}

/// Executes one instruction, returns the jump target if a branch was taken.
fn step(instr: &ByteCode, m: &mut Machine<'_>) -> Option<usize> {
    match *instr {
        ByteCode::IADD_RS {
            dst,
            src,
            shift,
            imm,
        } => m.reg.r.apply_to_dst_with_src(dst, src, |dst, src| {
            dst.wrapping_add(src << shift).wrapping_add(imm)
        }),
        ByteCode::IADD_M { dst, mem } => {
            let value = m.load_int(mem);
            m.reg.r.apply_to_dst(dst, |dst| dst.wrapping_add(value));
        }
        ByteCode::ISUB_R { dst, src } => {
            let value = m.int(src);
            m.reg.r.apply_to_dst(dst, |dst| dst.wrapping_sub(value));
        }
        ByteCode::ISUB_M { dst, mem } => {
            let value = m.load_int(mem);
            m.reg.r.apply_to_dst(dst, |dst| dst.wrapping_sub(value));
        }
        ByteCode::IMUL_R { dst, src } => {
            let value = m.int(src);
            m.reg.r.apply_to_dst(dst, |dst| dst.wrapping_mul(value));
        }
        ByteCode::IMUL_M { dst, mem } => {
            let value = m.load_int(mem);
            m.reg.r.apply_to_dst(dst, |dst| dst.wrapping_mul(value));
        }
        ByteCode::IMULH_R { dst, src } => m.reg.r.apply_to_dst_with_src(dst, src, high_mul),
        ByteCode::IMULH_M { dst, mem } => {
            let value = m.load_int(mem);
            m.reg.r.apply_to_dst(dst, |dst| high_mul(dst, value));
        }
        ByteCode::ISMULH_R { dst, src } => {
            m.reg.r.apply_to_dst_with_src(dst, src, signed_high_mul);
        }
        ByteCode::ISMULH_M { dst, mem } => {
            let value = m.load_int(mem);
            m.reg.r.apply_to_dst(dst, |dst| signed_high_mul(dst, value));
        }
        ByteCode::INEG_R { dst } => m.reg.r.apply_to_dst(dst, u64::wrapping_neg),
        ByteCode::IXOR_R { dst, src } => {
            let value = m.int(src);
            m.reg.r.apply_to_dst(dst, |dst| dst ^ value);
        }
        ByteCode::IXOR_M { dst, mem } => {
            let value = m.load_int(mem);
            m.reg.r.apply_to_dst(dst, |dst| dst ^ value);
        }
        ByteCode::IROR_R { dst, src } => {
            let value = m.int(src);
            m.reg.r.apply_to_dst(dst, |dst| rotate_right(dst, value));
        }
        ByteCode::IROL_R { dst, src } => {
            let value = m.int(src);
            m.reg.r.apply_to_dst(dst, |dst| rotate_left(dst, value));
        }
        ByteCode::ISWAP_R { dst, src } => m.reg.r.swap(dst, src),
        ByteCode::FSWAP_R { dst } => m.float_reg(dst).swap(0, 1),
        ByteCode::FADD_R { dst, src } => {
            let src = m.reg.a[src];
            m.float_op(FloatReg::F(dst), src, RoundingMode::add);
        }
        ByteCode::FADD_M { dst, mem } => {
            let src = m.load_float(mem);
            m.float_op(FloatReg::F(dst), src, RoundingMode::add);
        }
        ByteCode::FSUB_R { dst, src } => {
            let src = m.reg.a[src];
            m.float_op(FloatReg::F(dst), src, RoundingMode::sub);
        }
        ByteCode::FSUB_M { dst, mem } => {
            let src = m.load_float(mem);
            m.float_op(FloatReg::F(dst), src, RoundingMode::sub);
        }
        ByteCode::FSCAL_R { dst } => m.reg.f[dst] = scale(m.reg.f[dst]),
        ByteCode::FMUL_R { dst, src } => {
            let src = m.reg.a[src];
            m.float_op(FloatReg::E(dst), src, RoundingMode::mul);
        }
        ByteCode::FDIV_M { dst, mem } => {
            let src = m.fdiv_operand(mem);
            m.float_op(FloatReg::E(dst), src, RoundingMode::div);
        }
        ByteCode::FSQRT_R { dst } => {
            let rounding = *m.rounding;
            let e = &mut m.reg.e[dst];
            *e = [rounding.sqrt(e[0]), rounding.sqrt(e[1])];
        }
        ByteCode::CBRANCH {
            dst,
            imm,
            mask,
            target,
        } => {
            m.reg.r.apply_to_dst(dst, |dst| dst.wrapping_add(imm));
            if m.reg.r.get(dst) & mask == 0 {
                return Some(target);
            }
        }
        ByteCode::CFROUND { src, rotate } => m.set_rounding(src, rotate),
        ByteCode::ISTORE { src, mem } => {
            let value = m.reg.r.get(src);
            m.store_int(mem, value);
        }
        ByteCode::NOP => (),
    }

    None
}

#[expect(clippy::cast_possible_truncation, reason = "the amount is masked to 6 bits")]
pub(crate) const fn rotate_right(value: u64, amount: u64) -> u64 {
    value.rotate_right((amount & 63) as u32)
}

#[expect(clippy::cast_possible_truncation, reason = "the amount is masked to 6 bits")]
pub(crate) const fn rotate_left(value: u64, amount: u64) -> u64 {
    value.rotate_left((amount & 63) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::RGroupRegisterID::{R0, R1, R2};
    use crate::vm::bytecode::{IntSource, MemOperand};
    use crate::vm::register_file::RegisterFile;
    use crate::vm::scratchpad::Scratchpad;

    fn run(code: &[ByteCode], reg: &mut RegisterFile, scratchpad: &mut Scratchpad) -> RoundingMode {
        let mut rounding = RoundingMode::Nearest;
        execute(
            code,
            &mut Machine {
                reg,
                scratchpad,
                rounding: &mut rounding,
                e_mask: [0; 2],
            },
        );
        rounding
    }

    #[test]
    fn integer_ops() {
        let mut reg = RegisterFile::default();
        let mut scratchpad = Scratchpad::alloc(64).unwrap();
        scratchpad.store64(16, 5);
        reg.r.set(R0, 3);
        reg.r.set(R1, 16);

        let code = [
            ByteCode::IADD_RS {
                dst: R0,
                src: R1,
                shift: 2,
                imm: 0,
            },
            ByteCode::IMUL_M {
                dst: R0,
                mem: MemOperand {
                    base: Some(R1),
                    imm: 0,
                    mask: 63 & !7,
                },
            },
            ByteCode::ISUB_R {
                dst: R0,
                src: IntSource::Imm(1),
            },
            ByteCode::IROR_R {
                dst: R2,
                src: IntSource::Register(R1),
            },
            ByteCode::ISTORE {
                src: R0,
                mem: MemOperand {
                    base: None,
                    imm: 8,
                    mask: 63 & !7,
                },
            },
        ];
        run(&code, &mut reg, &mut scratchpad);

        assert_eq!(reg.r.get(R0), (3 + (16 << 2)) * 5 - 1);
        assert_eq!(reg.r.get(R2), 0);
        assert_eq!(scratchpad.load64(8), reg.r.get(R0));
    }

    #[test]
    fn branch_taken_when_the_condition_bits_are_zero() {
        let mut reg = RegisterFile::default();
        let mut scratchpad = Scratchpad::alloc(64).unwrap();
        reg.r.set(R0, 3);

        let code = [
            ByteCode::IADD_RS {
                dst: R1,
                src: R1,
                shift: 0,
                imm: 0,
            },
            ByteCode::IXOR_R {
                dst: R1,
                src: IntSource::Imm(1),
            },
            ByteCode::CBRANCH {
                dst: R0,
                imm: 1,
                mask: 0b11,
                target: 1,
            },
        ];
        run(&code, &mut reg, &mut scratchpad);

        // taken at r0 = 4, not taken at r0 = 5
        assert_eq!(reg.r.get(R0), 5);
        assert_eq!(reg.r.get(R1), 0);
    }

    #[test]
    fn float_ops_use_the_rounding_mode() {
        let mut reg = RegisterFile::default();
        let mut scratchpad = Scratchpad::alloc(64).unwrap();
        reg.r.set(R0, 2);
        reg.f[0] = [1.0, 1.0];
        reg.a[0] = [f64::EPSILON / 4.0, -f64::EPSILON / 4.0];

        let code = [
            ByteCode::CFROUND { src: R0, rotate: 0 },
            ByteCode::FADD_R { dst: 0, src: 0 },
            ByteCode::FSWAP_R {
                dst: FloatReg::F(0),
            },
            ByteCode::FSCAL_R { dst: 1 },
        ];
        let rounding = run(&code, &mut reg, &mut scratchpad);

        assert_eq!(rounding, RoundingMode::Up);
        assert_eq!(reg.f[0][1].to_bits(), (1.0 + f64::EPSILON).to_bits());
        assert_eq!(reg.f[0][0].to_bits(), 1.0_f64.to_bits());
        assert_eq!(reg.f[1][0].to_bits(), 0x80F0_0000_0000_0000);
    }

    #[test]
    fn rotates_use_6_bits() {
        assert_eq!(rotate_right(1, 65), 1 << 63);
        assert_eq!(rotate_left(1 << 63, 65), 1);
    }
}
