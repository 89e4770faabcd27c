use crate::registers::RGroupRegisters;
use crate::superscalar::instructions::ScalarInstruction;

const P2EXP63: u64 = 1 << 63;

pub(crate) fn execute(program: &[ScalarInstruction], registers: &mut RGroupRegisters) {
    for instruction in program {
        match *instruction {
            ScalarInstruction::ISUB_R { dst, src } => {
                registers.apply_to_dst_with_src(dst, src, u64::wrapping_sub);
            }
            ScalarInstruction::IXOR_R { dst, src } => {
                registers.apply_to_dst_with_src(dst, src, |dst_val, src_val| dst_val ^ src_val);
            }
            ScalarInstruction::IADD_RS { dst, src, shift } => {
                let op = |dst_val: u64, src_val: u64| dst_val.wrapping_add(src_val << shift);
                registers.apply_to_dst_with_src(dst, src, op);
            }
            ScalarInstruction::IMUL_R { dst, src } => {
                registers.apply_to_dst_with_src(dst, src, u64::wrapping_mul);
            }
            ScalarInstruction::IROR_C { dst, imm } => {
                registers.apply_to_dst(dst, |dst_val| dst_val.rotate_right(imm));
            }
            ScalarInstruction::IADD_C { dst, imm } => {
                registers.apply_to_dst(dst, |dst_val| dst_val.wrapping_add(imm));
            }
            ScalarInstruction::IXOR_C { dst, imm } => {
                registers.apply_to_dst(dst, |dst_val| dst_val ^ imm);
            }
            ScalarInstruction::IMULH_R { dst, src } => {
                registers.apply_to_dst_with_src(dst, src, high_mul);
            }
            ScalarInstruction::ISMULH_R { dst, src } => {
                registers.apply_to_dst_with_src(dst, src, signed_high_mul);
            }
            ScalarInstruction::IMUL_RCP { dst, reciprocal } => {
                registers.apply_to_dst(dst, |dst_val| dst_val.wrapping_mul(reciprocal));
            }
        }
    }
}

/// Returns `2^x / divisor` for the highest `x` that keeps the result in 64 bits.
///
/// `divisor` must not be 0 or a power of 2.
pub(crate) fn randomx_reciprocal(divisor: u32) -> u64 {
    debug_assert!(!crate::is_0_or_power_of_2(u64::from(divisor)));

    let divisor = u64::from(divisor);
    let mut quotient = P2EXP63 / divisor;
    let mut remainder = P2EXP63 % divisor;
    let bsr = u64::BITS - divisor.leading_zeros();

    for _ in 0..bsr {
        if remainder >= divisor - remainder {
            quotient = quotient.wrapping_mul(2).wrapping_add(1);
            remainder = remainder.wrapping_mul(2).wrapping_sub(divisor);
        } else {
            quotient = quotient.wrapping_mul(2);
            remainder = remainder.wrapping_mul(2);
        }
    }
    quotient
}

#[expect(
    clippy::cast_possible_truncation,
    clippy::cast_lossless,
    reason = "the high 64 bits of a 128 bit product"
)]
pub(crate) const fn high_mul(a: u64, b: u64) -> u64 {
    ((a as u128 * b as u128) >> 64) as u64
}

#[expect(
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss,
    clippy::cast_lossless,
    reason = "registers are reinterpreted as signed"
)]
pub(crate) const fn signed_high_mul(a: u64, b: u64) -> u64 {
    ((a as i64 as i128 * b as i64 as i128) >> 64) as u64
}

#[expect(
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss,
    reason = "sign extension"
)]
pub(crate) const fn sign_extend_2s_compl(imm: u32) -> u64 {
    imm as i32 as i64 as u64
}
