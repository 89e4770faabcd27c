//! Compiled dispatch.
//!
//! Bytecode is lowered once per program into a list of closures, each specialized on its
//! operands, so running a program never matches on an instruction again. `NOP`s are dropped and
//! branch targets remapped to the shortened list.

use crate::float::RoundingMode;
use crate::registers::RGroupRegisterID;
use crate::superscalar::{high_mul, signed_high_mul};

use super::bytecode::{scale, ByteCode, FloatReg, IntSource, Machine, MemOperand};
use super::interpreter::{rotate_left, rotate_right};

/// One lowered instruction, returns the jump target if a branch was taken.
type Op = Box<dyn Fn(&mut Machine<'_>) -> Option<usize> + Send + Sync>;

/// A program lowered to closures.
pub(crate) struct CompiledProgram {
    ops: Vec<Op>,
}

impl std::fmt::Debug for CompiledProgram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledProgram")
            .field("ops", &self.ops.len())
            .finish()
    }
}

impl CompiledProgram {
    /// Runs the program once from the first instruction.
    pub(crate) fn execute(&self, m: &mut Machine<'_>) {
        let mut pc = 0;
        while let Some(op) = self.ops.get(pc) {
            pc = op(m).unwrap_or(pc + 1);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.ops.len()
    }
}

pub(crate) fn compile(code: &[ByteCode]) -> CompiledProgram {
    // `new_index[i]` is the position of the first kept instruction at or after `i`
    let mut new_index = Vec::with_capacity(code.len() + 1);
    let mut kept = 0;
    for instr in code {
        new_index.push(kept);
        if *instr != ByteCode::NOP {
            kept += 1;
        }
    }
    new_index.push(kept);

    let ops = code
        .iter()
        .filter(|instr| **instr != ByteCode::NOP)
        .map(|instr| lower(instr, &new_index))
        .collect();

    CompiledProgram { ops }
}

fn op<F>(f: F) -> Op
where
    F: Fn(&mut Machine<'_>) -> Option<usize> + Send + Sync + 'static,
{
    Box::new(f)
}

/// Lowers an integer instruction `dst = f(dst, src)`.
fn int_op(dst: RGroupRegisterID, src: IntSource, f: fn(u64, u64) -> u64) -> Op {
    match src {
        IntSource::Register(src) => op(move |m| {
            m.reg.r.apply_to_dst_with_src(dst, src, f);
            None
        }),
        IntSource::Imm(imm) => op(move |m| {
            m.reg.r.apply_to_dst(dst, |dst| f(dst, imm));
            None
        }),
    }
}

/// Lowers an integer instruction with a memory operand.
#[expect(
    clippy::cast_possible_truncation,
    reason = "addresses are masked to the scratchpad size"
)]
fn int_mem_op(dst: RGroupRegisterID, mem: MemOperand, f: fn(u64, u64) -> u64) -> Op {
    match mem.base {
        Some(base) => op(move |m| {
            let addr = (m.reg.r.get(base).wrapping_add(mem.imm) & mem.mask) as usize;
            let value = m.scratchpad.load64(addr);
            m.reg.r.apply_to_dst(dst, |dst| f(dst, value));
            None
        }),
        // a fixed address
        None => {
            let addr = (mem.imm & mem.mask) as usize;
            op(move |m| {
                let value = m.scratchpad.load64(addr);
                m.reg.r.apply_to_dst(dst, |dst| f(dst, value));
                None
            })
        }
    }
}

fn float_op(dst: FloatReg, src: usize, f: fn(RoundingMode, f64, f64) -> f64) -> Op {
    op(move |m| {
        let src = m.reg.a[src];
        m.float_op(dst, src, f);
        None
    })
}

fn float_mem_op(dst: FloatReg, mem: MemOperand, f: fn(RoundingMode, f64, f64) -> f64) -> Op {
    op(move |m| {
        let src = m.load_float(mem);
        m.float_op(dst, src, f);
        None
    })
}

fn lower(instr: &ByteCode, new_index: &[usize]) -> Op {
    match *instr {
        ByteCode::IADD_RS {
            dst,
            src,
            shift,
            imm,
        } => op(move |m| {
            m.reg.r.apply_to_dst_with_src(dst, src, |dst, src| {
                dst.wrapping_add(src << shift).wrapping_add(imm)
            });
            None
        }),
        ByteCode::IADD_M { dst, mem } => int_mem_op(dst, mem, u64::wrapping_add),
        ByteCode::ISUB_R { dst, src } => int_op(dst, src, u64::wrapping_sub),
        ByteCode::ISUB_M { dst, mem } => int_mem_op(dst, mem, u64::wrapping_sub),
        ByteCode::IMUL_R { dst, src } => int_op(dst, src, u64::wrapping_mul),
        ByteCode::IMUL_M { dst, mem } => int_mem_op(dst, mem, u64::wrapping_mul),
        ByteCode::IMULH_R { dst, src } => int_op(dst, IntSource::Register(src), high_mul),
        ByteCode::IMULH_M { dst, mem } => int_mem_op(dst, mem, high_mul),
        ByteCode::ISMULH_R { dst, src } => {
            int_op(dst, IntSource::Register(src), signed_high_mul)
        }
        ByteCode::ISMULH_M { dst, mem } => int_mem_op(dst, mem, signed_high_mul),
        ByteCode::INEG_R { dst } => op(move |m| {
            m.reg.r.apply_to_dst(dst, u64::wrapping_neg);
            None
        }),
        ByteCode::IXOR_R { dst, src } => int_op(dst, src, |a, b| a ^ b),
        ByteCode::IXOR_M { dst, mem } => int_mem_op(dst, mem, |a, b| a ^ b),
        ByteCode::IROR_R { dst, src } => int_op(dst, src, rotate_right),
        ByteCode::IROL_R { dst, src } => int_op(dst, src, rotate_left),
        ByteCode::ISWAP_R { dst, src } => op(move |m| {
            m.reg.r.swap(dst, src);
            None
        }),
        ByteCode::FSWAP_R { dst } => op(move |m| {
            m.float_reg(dst).swap(0, 1);
            None
        }),
        ByteCode::FADD_R { dst, src } => float_op(FloatReg::F(dst), src, RoundingMode::add),
        ByteCode::FADD_M { dst, mem } => float_mem_op(FloatReg::F(dst), mem, RoundingMode::add),
        ByteCode::FSUB_R { dst, src } => float_op(FloatReg::F(dst), src, RoundingMode::sub),
        ByteCode::FSUB_M { dst, mem } => float_mem_op(FloatReg::F(dst), mem, RoundingMode::sub),
        ByteCode::FSCAL_R { dst } => op(move |m| {
            m.reg.f[dst] = scale(m.reg.f[dst]);
            None
        }),
        ByteCode::FMUL_R { dst, src } => float_op(FloatReg::E(dst), src, RoundingMode::mul),
        ByteCode::FDIV_M { dst, mem } => op(move |m| {
            let src = m.fdiv_operand(mem);
            m.float_op(FloatReg::E(dst), src, RoundingMode::div);
            None
        }),
        ByteCode::FSQRT_R { dst } => op(move |m| {
            let rounding = *m.rounding;
            let e = &mut m.reg.e[dst];
            *e = [rounding.sqrt(e[0]), rounding.sqrt(e[1])];
            None
        }),
        ByteCode::CBRANCH {
            dst,
            imm,
            mask,
            target,
        } => {
            let target = new_index[target];
            op(move |m| {
                m.reg.r.apply_to_dst(dst, |dst| dst.wrapping_add(imm));
                (m.reg.r.get(dst) & mask == 0).then_some(target)
            })
        }
        ByteCode::CFROUND { src, rotate } => op(move |m| {
            m.set_rounding(src, rotate);
            None
        }),
        ByteCode::ISTORE { src, mem } => op(move |m| {
            let value = m.reg.r.get(src);
            m.store_int(mem, value);
            None
        }),
        ByteCode::NOP => op(|_| None),
    }
}
