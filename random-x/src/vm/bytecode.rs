//! Programs decoded into a form that can be executed without looking at the config again.
//!
//! Everything that only depends on the instruction is resolved here: register operands, memory
//! masks, branch targets and the reciprocals of `IMUL_RCP`.

use crate::config::{RandomXConfig, REGISTER_NEEDS_DISPLACEMENT, STORE_L3_CONDITION};
use crate::float::RoundingMode;
use crate::program::{mask_e_register, Instruction, Opcode, Program};
use crate::registers::RGroupRegisterID;
use crate::superscalar::{randomx_reciprocal, sign_extend_2s_compl};
use crate::is_0_or_power_of_2;

use super::register_file::RegisterFile;
use super::scratchpad::Scratchpad;

/// Sign bit and 4 exponent bits flipped by `FSCAL_R`.
const SCALE_MASK: u64 = 0x80F0_0000_0000_0000;

/// A scratchpad operand, the address is `(base + imm) & mask`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) struct MemOperand {
    pub(crate) base: Option<RGroupRegisterID>,
    pub(crate) imm: u64,
    pub(crate) mask: u64,
}

/// The second operand of an integer instruction.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum IntSource {
    Register(RGroupRegisterID),
    Imm(u64),
}

/// A float register from group `f` or `e`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum FloatReg {
    F(usize),
    E(usize),
}

#[derive(Debug, Copy, Clone, PartialEq)]
#[expect(non_camel_case_types)]
pub(crate) enum ByteCode {
    IADD_RS {
        dst: RGroupRegisterID,
        src: RGroupRegisterID,
        shift: u32,
        imm: u64,
    },
    IADD_M {
        dst: RGroupRegisterID,
        mem: MemOperand,
    },
    ISUB_R {
        dst: RGroupRegisterID,
        src: IntSource,
    },
    ISUB_M {
        dst: RGroupRegisterID,
        mem: MemOperand,
    },
    IMUL_R {
        dst: RGroupRegisterID,
        src: IntSource,
    },
    IMUL_M {
        dst: RGroupRegisterID,
        mem: MemOperand,
    },
    IMULH_R {
        dst: RGroupRegisterID,
        src: RGroupRegisterID,
    },
    IMULH_M {
        dst: RGroupRegisterID,
        mem: MemOperand,
    },
    ISMULH_R {
        dst: RGroupRegisterID,
        src: RGroupRegisterID,
    },
    ISMULH_M {
        dst: RGroupRegisterID,
        mem: MemOperand,
    },
    INEG_R {
        dst: RGroupRegisterID,
    },
    IXOR_R {
        dst: RGroupRegisterID,
        src: IntSource,
    },
    IXOR_M {
        dst: RGroupRegisterID,
        mem: MemOperand,
    },
    IROR_R {
        dst: RGroupRegisterID,
        src: IntSource,
    },
    IROL_R {
        dst: RGroupRegisterID,
        src: IntSource,
    },
    ISWAP_R {
        dst: RGroupRegisterID,
        src: RGroupRegisterID,
    },
    FSWAP_R {
        dst: FloatReg,
    },
    FADD_R {
        dst: usize,
        src: usize,
    },
    FADD_M {
        dst: usize,
        mem: MemOperand,
    },
    FSUB_R {
        dst: usize,
        src: usize,
    },
    FSUB_M {
        dst: usize,
        mem: MemOperand,
    },
    FSCAL_R {
        dst: usize,
    },
    FMUL_R {
        dst: usize,
        src: usize,
    },
    FDIV_M {
        dst: usize,
        mem: MemOperand,
    },
    FSQRT_R {
        dst: usize,
    },
    /// Adds `imm` to `dst` and jumps to `target` if the bits under `mask` are then all zero.
    CBRANCH {
        dst: RGroupRegisterID,
        imm: u64,
        mask: u64,
        target: usize,
    },
    CFROUND {
        src: RGroupRegisterID,
        rotate: u32,
    },
    ISTORE {
        src: RGroupRegisterID,
        mem: MemOperand,
    },
    NOP,
}

/// Decodes a whole program.
pub(crate) fn compile(program: &Program, config: &RandomXConfig) -> Vec<ByteCode> {
    // the last instruction to modify each register, branches jump to just after it
    let mut register_usage: [Option<usize>; 8] = [None; 8];

    program
        .instructions
        .iter()
        .enumerate()
        .map(|(i, instr)| compile_instruction(i, instr, config, &mut register_usage))
        .collect()
}

fn compile_instruction(
    i: usize,
    instr: &Instruction,
    config: &RandomXConfig,
    register_usage: &mut [Option<usize>; 8],
) -> ByteCode {
    let dst = instr.dst_reg();
    let src = instr.src_reg();
    let imm = sign_extend_2s_compl(instr.imm32);

    // L1 or L2 operand at `r[src] + imm`.
    let mem = MemOperand {
        base: Some(src),
        imm,
        mask: if instr.mod_mem() {
            config.scratchpad_l1_mask()
        } else {
            config.scratchpad_l2_mask()
        },
    };
    // Integer loads with `src == dst` read the L3 at `imm`.
    let int_mem = if src == dst {
        MemOperand {
            base: None,
            imm,
            mask: config.scratchpad_l3_mask(),
        }
    } else {
        mem
    };
    let int_src = |imm| {
        if src == dst {
            IntSource::Imm(imm)
        } else {
            IntSource::Register(src)
        }
    };

    let f_dst = usize::from(instr.dst % 4);
    let a_src = usize::from(instr.src % 4);

    let code = match instr.opcode {
        Opcode::IADD_RS => ByteCode::IADD_RS {
            dst,
            src,
            shift: instr.mod_shift(),
            imm: if dst == REGISTER_NEEDS_DISPLACEMENT {
                imm
            } else {
                0
            },
        },
        Opcode::IADD_M => ByteCode::IADD_M { dst, mem: int_mem },
        Opcode::ISUB_R => ByteCode::ISUB_R {
            dst,
            src: int_src(imm),
        },
        Opcode::ISUB_M => ByteCode::ISUB_M { dst, mem: int_mem },
        Opcode::IMUL_R => ByteCode::IMUL_R {
            dst,
            src: int_src(imm),
        },
        Opcode::IMUL_M => ByteCode::IMUL_M { dst, mem: int_mem },
        Opcode::IMULH_R => ByteCode::IMULH_R { dst, src },
        Opcode::IMULH_M => ByteCode::IMULH_M { dst, mem: int_mem },
        Opcode::ISMULH_R => ByteCode::ISMULH_R { dst, src },
        Opcode::ISMULH_M => ByteCode::ISMULH_M { dst, mem: int_mem },
        Opcode::IMUL_RCP => {
            if is_0_or_power_of_2(u64::from(instr.imm32)) {
                return ByteCode::NOP;
            }
            ByteCode::IMUL_R {
                dst,
                src: IntSource::Imm(randomx_reciprocal(instr.imm32)),
            }
        }
        Opcode::INEG_R => ByteCode::INEG_R { dst },
        Opcode::IXOR_R => ByteCode::IXOR_R {
            dst,
            src: int_src(imm),
        },
        Opcode::IXOR_M => ByteCode::IXOR_M { dst, mem: int_mem },
        Opcode::IROR_R => ByteCode::IROR_R {
            dst,
            src: int_src(u64::from(instr.imm32)),
        },
        Opcode::IROL_R => ByteCode::IROL_R {
            dst,
            src: int_src(u64::from(instr.imm32)),
        },
        Opcode::ISWAP_R => {
            if src == dst {
                return ByteCode::NOP;
            }
            register_usage[src.index()] = Some(i);
            ByteCode::ISWAP_R { dst, src }
        }
        Opcode::FSWAP_R => ByteCode::FSWAP_R {
            dst: if instr.dst % 8 < 4 {
                FloatReg::F(f_dst)
            } else {
                FloatReg::E(f_dst)
            },
        },
        Opcode::FADD_R => ByteCode::FADD_R {
            dst: f_dst,
            src: a_src,
        },
        Opcode::FADD_M => ByteCode::FADD_M { dst: f_dst, mem },
        Opcode::FSUB_R => ByteCode::FSUB_R {
            dst: f_dst,
            src: a_src,
        },
        Opcode::FSUB_M => ByteCode::FSUB_M { dst: f_dst, mem },
        Opcode::FSCAL_R => ByteCode::FSCAL_R { dst: f_dst },
        Opcode::FMUL_R => ByteCode::FMUL_R {
            dst: f_dst,
            src: a_src,
        },
        Opcode::FDIV_M => ByteCode::FDIV_M { dst: f_dst, mem },
        Opcode::FSQRT_R => ByteCode::FSQRT_R { dst: f_dst },
        Opcode::CBRANCH => {
            let shift = u32::from(instr.mod_cond()) + config.jump_offset;
            let mut branch_imm = imm | (1 << shift);
            if shift > 0 {
                branch_imm &= !(1 << (shift - 1));
            }
            let target = register_usage[dst.index()].map_or(0, |last| last + 1);

            // everything is modified by the jump
            register_usage.fill(Some(i));

            return ByteCode::CBRANCH {
                dst,
                imm: branch_imm,
                mask: config.condition_mask() << shift,
                target,
            };
        }
        Opcode::CFROUND => ByteCode::CFROUND {
            src,
            rotate: instr.imm32 & 63,
        },
        Opcode::ISTORE => ByteCode::ISTORE {
            src,
            mem: MemOperand {
                base: Some(dst),
                imm,
                mask: if instr.mod_cond() >= STORE_L3_CONDITION {
                    config.scratchpad_l3_mask()
                } else {
                    mem.mask
                },
            },
        },
        Opcode::NOP => ByteCode::NOP,
    };

    if code.writes_integer_dst() {
        register_usage[dst.index()] = Some(i);
    }

    code
}

impl ByteCode {
    /// Whether this instruction modifies its integer destination register.
    const fn writes_integer_dst(&self) -> bool {
        matches!(
            self,
            Self::IADD_RS { .. }
                | Self::IADD_M { .. }
                | Self::ISUB_R { .. }
                | Self::ISUB_M { .. }
                | Self::IMUL_R { .. }
                | Self::IMUL_M { .. }
                | Self::IMULH_R { .. }
                | Self::IMULH_M { .. }
                | Self::ISMULH_R { .. }
                | Self::ISMULH_M { .. }
                | Self::INEG_R { .. }
                | Self::IXOR_R { .. }
                | Self::IXOR_M { .. }
                | Self::IROR_R { .. }
                | Self::IROL_R { .. }
                | Self::ISWAP_R { .. }
        )
    }
}

/// The state a program runs against.
pub(crate) struct Machine<'a> {
    pub(crate) reg: &'a mut RegisterFile,
    pub(crate) scratchpad: &'a mut Scratchpad,
    pub(crate) rounding: &'a mut RoundingMode,
    pub(crate) e_mask: [u64; 2],
}

impl Machine<'_> {
    pub(crate) fn int(&self, src: IntSource) -> u64 {
        match src {
            IntSource::Register(reg) => self.reg.r.get(reg),
            IntSource::Imm(imm) => imm,
        }
    }

    pub(crate) fn address(&self, mem: MemOperand) -> usize {
        let base = mem.base.map_or(0, |reg| self.reg.r.get(reg));
        #[expect(clippy::cast_possible_truncation, reason = "masked to the scratchpad size")]
        let addr = (base.wrapping_add(mem.imm) & mem.mask) as usize;
        addr
    }

    pub(crate) fn load_int(&self, mem: MemOperand) -> u64 {
        self.scratchpad.load64(self.address(mem))
    }

    pub(crate) fn load_float(&self, mem: MemOperand) -> [f64; 2] {
        self.scratchpad.load_f64x2(self.address(mem))
    }

    pub(crate) fn store_int(&mut self, mem: MemOperand, value: u64) {
        let addr = self.address(mem);
        self.scratchpad.store64(addr, value);
    }

    pub(crate) fn float_reg(&mut self, reg: FloatReg) -> &mut [f64; 2] {
        match reg {
            FloatReg::F(i) => &mut self.reg.f[i],
            FloatReg::E(i) => &mut self.reg.e[i],
        }
    }

    /// Applies `op` lane wise to a float register in the current rounding mode.
    pub(crate) fn float_op(
        &mut self,
        dst: FloatReg,
        src: [f64; 2],
        op: fn(RoundingMode, f64, f64) -> f64,
    ) {
        let rounding = *self.rounding;
        let dst = self.float_reg(dst);
        dst[0] = op(rounding, dst[0], src[0]);
        dst[1] = op(rounding, dst[1], src[1]);
    }

    /// `FDIV_M` divides by the memory operand masked like an E group register.
    pub(crate) fn fdiv_operand(&self, mem: MemOperand) -> [f64; 2] {
        mask_e_register(self.load_float(mem), self.e_mask)
    }

    pub(crate) fn set_rounding(&mut self, src: RGroupRegisterID, rotate: u32) {
        *self.rounding = RoundingMode::from_u64(self.reg.r.get(src).rotate_right(rotate));
    }
}

pub(crate) fn scale(x: [f64; 2]) -> [f64; 2] {
    [
        f64::from_bits(x[0].to_bits() ^ SCALE_MASK),
        f64::from_bits(x[1].to_bits() ^ SCALE_MASK),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::OpcodeTable;
    use crate::registers::RGroupRegisterID::{R0, R1, R5};

    fn instr(opcode: Opcode, dst: u8, src: u8, mod_: u8, imm32: u32) -> Instruction {
        Instruction {
            opcode,
            dst,
            src,
            mod_,
            imm32,
        }
    }

    fn compile_one(instr: Instruction) -> ByteCode {
        compile_instruction(0, &instr, &RandomXConfig::MONERO, &mut [None; 8])
    }

    #[test]
    fn displacement_only_for_r5() {
        assert_eq!(
            compile_one(instr(Opcode::IADD_RS, 5, 0, 0b1100, 0xFFFF_FFFF)),
            ByteCode::IADD_RS {
                dst: R5,
                src: R0,
                shift: 3,
                imm: u64::MAX,
            }
        );
        assert_eq!(
            compile_one(instr(Opcode::IADD_RS, 1, 0, 0, 0xFFFF_FFFF)),
            ByteCode::IADD_RS {
                dst: R1,
                src: R0,
                shift: 0,
                imm: 0,
            }
        );
    }

    #[test]
    fn same_register_operands() {
        let config = RandomXConfig::MONERO;

        assert_eq!(
            compile_one(instr(Opcode::IADD_M, 1, 1, 0, 8)),
            ByteCode::IADD_M {
                dst: R1,
                mem: MemOperand {
                    base: None,
                    imm: 8,
                    mask: config.scratchpad_l3_mask(),
                },
            }
        );
        assert_eq!(
            compile_one(instr(Opcode::IADD_M, 1, 0, 1, 8)),
            ByteCode::IADD_M {
                dst: R1,
                mem: MemOperand {
                    base: Some(R0),
                    imm: 8,
                    mask: config.scratchpad_l1_mask(),
                },
            }
        );
        assert_eq!(
            compile_one(instr(Opcode::ISUB_R, 0, 8, 0, 0x8000_0000)),
            ByteCode::ISUB_R {
                dst: R0,
                src: IntSource::Imm(0xFFFF_FFFF_8000_0000),
            }
        );
        assert_eq!(
            compile_one(instr(Opcode::IROR_R, 0, 8, 0, 0x8000_0000)),
            ByteCode::IROR_R {
                dst: R0,
                src: IntSource::Imm(0x8000_0000),
            }
        );
        assert_eq!(compile_one(instr(Opcode::ISWAP_R, 3, 3, 0, 0)), ByteCode::NOP);
    }

    #[test]
    fn imul_rcp() {
        assert_eq!(compile_one(instr(Opcode::IMUL_RCP, 0, 0, 0, 0)), ByteCode::NOP);
        assert_eq!(compile_one(instr(Opcode::IMUL_RCP, 0, 0, 0, 1 << 20)), ByteCode::NOP);
        assert_eq!(
            compile_one(instr(Opcode::IMUL_RCP, 0, 0, 0, 3)),
            ByteCode::IMUL_R {
                dst: R0,
                src: IntSource::Imm(randomx_reciprocal(3)),
            }
        );
    }

    #[test]
    fn branch_targets() {
        let config = RandomXConfig::MONERO;
        let mut usage = [None; 8];

        // r1 is modified by instruction 0, so a branch on r1 restarts at 1.
        compile_instruction(0, &instr(Opcode::INEG_R, 1, 0, 0, 0), &config, &mut usage);
        compile_instruction(1, &instr(Opcode::FSQRT_R, 1, 0, 0, 0), &config, &mut usage);
        let branch = compile_instruction(2, &instr(Opcode::CBRANCH, 1, 0, 0, 0), &config, &mut usage);
        assert_eq!(
            branch,
            ByteCode::CBRANCH {
                dst: R1,
                imm: 1 << 8,
                mask: 0xFF << 8,
                target: 1,
            }
        );

        // every register was modified by the first branch
        let branch =
            compile_instruction(3, &instr(Opcode::CBRANCH, 0, 0, 0x20, 0), &config, &mut usage);
        assert!(matches!(branch, ByteCode::CBRANCH { target: 3, .. }));

        // an unmodified register restarts the program
        let branch = compile_instruction(
            0,
            &instr(Opcode::CBRANCH, 4, 0, 0, 0),
            &config,
            &mut [None; 8],
        );
        assert!(matches!(branch, ByteCode::CBRANCH { target: 0, .. }));
    }

    #[test]
    fn branch_immediate_clears_the_bit_below_the_condition() {
        // shift = 2 + 8
        let branch = compile_one(instr(Opcode::CBRANCH, 0, 0, 0x20, 0xFFFF_FFFF));
        let ByteCode::CBRANCH { imm, mask, .. } = branch else {
            panic!("not a branch: {branch:?}");
        };

        assert_eq!(imm, u64::MAX & !(1 << 9));
        assert_eq!(mask, 0xFF << 10);
    }

    #[test]
    fn store_levels() {
        let config = RandomXConfig::MONERO;

        let l3 = compile_one(instr(Opcode::ISTORE, 0, 1, 14 << 4, 0));
        let l2 = compile_one(instr(Opcode::ISTORE, 0, 1, 13 << 4, 0));
        let l1 = compile_one(instr(Opcode::ISTORE, 0, 1, (13 << 4) | 1, 0));

        for (code, mask) in [
            (l3, config.scratchpad_l3_mask()),
            (l2, config.scratchpad_l2_mask()),
            (l1, config.scratchpad_l1_mask()),
        ] {
            assert_eq!(
                code,
                ByteCode::ISTORE {
                    src: R1,
                    mem: MemOperand {
                        base: Some(R0),
                        imm: 0,
                        mask,
                    },
                }
            );
        }
    }

    #[test]
    fn whole_programs() {
        let config = RandomXConfig::MONERO;
        let table = OpcodeTable::new(&config);
        let program = Program::generate(&[3; 64], &config, &table);
        let code = compile(&program, &config);

        assert_eq!(code.len(), config.program_size);
        for (i, code) in code.iter().enumerate() {
            if let ByteCode::CBRANCH { target, .. } = code {
                assert!(*target <= i);
            }
        }
    }
}
