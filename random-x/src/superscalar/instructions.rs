use crate::registers::RGroupRegisterID;
use crate::superscalar::cpu::MacroOp;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[expect(non_camel_case_types)]
pub(crate) enum ScalarInstructionID {
    /// dst = dst - src
    ISUB_R,
    /// dst = dst ^ src
    IXOR_R,
    /// dst = dst + (src << mod_shift)
    IADD_RS,
    /// dst = dst * src
    IMUL_R,
    /// dst = dst >>> imm32
    IROR_C,
    /// dst = dst + imm32
    IADD_C,
    /// dst = dst ^ imm32
    IXOR_C,
    /// dst = (dst * src) >> 64
    IMULH_R,
    /// dst = (dst * src) >> 64 (signed)
    ISMULH_R,
    /// dst = 2x / imm32 * dst
    IMUL_RCP,
}

impl ScalarInstructionID {
    /// The macro op during which the source register is picked.
    pub(crate) const fn macro_op_to_select_src(self) -> Option<usize> {
        match self {
            Self::ISUB_R | Self::IXOR_R | Self::IADD_RS | Self::IMUL_R => Some(0),
            Self::IMULH_R | Self::ISMULH_R => Some(1),
            Self::IROR_C | Self::IADD_C | Self::IXOR_C | Self::IMUL_RCP => None,
        }
    }

    /// The macro op during which the destination register is picked.
    pub(crate) const fn macro_op_to_select_dst(self) -> usize {
        match self {
            Self::IMUL_RCP => 1,
            _ => 0,
        }
    }

    /// The macro op that writes the result to the destination.
    pub(crate) const fn macro_op_to_store_res(self) -> usize {
        match self {
            Self::IMULH_R | Self::ISMULH_R | Self::IMUL_RCP => 1,
            _ => 0,
        }
    }

    pub(crate) const fn is_multiplication(self) -> bool {
        matches!(
            self,
            Self::IMUL_R | Self::IMULH_R | Self::ISMULH_R | Self::IMUL_RCP
        )
    }

    /// is the destination allowed to be the same as the source
    pub(crate) const fn can_dst_be_src(self) -> bool {
        matches!(self, Self::IMULH_R | Self::ISMULH_R)
    }

    /// Returns the group of this operation.
    ///
    /// A group is related instructions that effect register choice during program construction.
    pub(crate) const fn instruction_group(self) -> Self {
        match self {
            // The only 2 instructions in the same group are ISUB_R & IADD_RS.
            Self::ISUB_R => Self::IADD_RS,
            id => id,
        }
    }

    pub(crate) const fn macro_ops(self) -> &'static [MacroOp] {
        match self {
            Self::ISUB_R => &[MacroOp::SUB_RR],
            Self::IXOR_R => &[MacroOp::XOR_RR],
            Self::IADD_RS => &[MacroOp::LEA_SIB],
            Self::IMUL_R => &[MacroOp::IMUL_RR { dependant: false }],
            Self::IROR_C => &[MacroOp::ROR_RI],
            Self::IADD_C => &[MacroOp::ADD_RI],
            Self::IXOR_C => &[MacroOp::XOR_RI],
            Self::IMULH_R => &[MacroOp::MOV_RR, MacroOp::MUL_R, MacroOp::MOV_RR],
            Self::ISMULH_R => &[MacroOp::MOV_RR, MacroOp::IMUL_R, MacroOp::MOV_RR],
            Self::IMUL_RCP => &[MacroOp::MOV_RI, MacroOp::IMUL_RR { dependant: true }],
        }
    }

    pub(crate) const fn number_of_macro_ops(self) -> usize {
        self.macro_ops().len()
    }
}

/// A generated superscalar instruction, with its immediates already in the form the executor
/// needs.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[expect(non_camel_case_types)]
pub(crate) enum ScalarInstruction {
    /// dst = dst - src
    ISUB_R {
        dst: RGroupRegisterID,
        src: RGroupRegisterID,
    },
    /// dst = dst ^ src
    IXOR_R {
        dst: RGroupRegisterID,
        src: RGroupRegisterID,
    },
    /// dst = dst + (src << shift)
    IADD_RS {
        dst: RGroupRegisterID,
        src: RGroupRegisterID,
        shift: u32,
    },
    /// dst = dst * src
    IMUL_R {
        dst: RGroupRegisterID,
        src: RGroupRegisterID,
    },
    /// dst = dst >>> imm
    IROR_C { dst: RGroupRegisterID, imm: u32 },
    /// dst = dst + imm
    IADD_C { dst: RGroupRegisterID, imm: u64 },
    /// dst = dst ^ imm
    IXOR_C { dst: RGroupRegisterID, imm: u64 },
    /// dst = (dst * src) >> 64
    IMULH_R {
        dst: RGroupRegisterID,
        src: RGroupRegisterID,
    },
    /// dst = (dst * src) >> 64 (signed)
    ISMULH_R {
        dst: RGroupRegisterID,
        src: RGroupRegisterID,
    },
    /// dst = dst * reciprocal
    IMUL_RCP {
        dst: RGroupRegisterID,
        reciprocal: u64,
    },
}

impl ScalarInstruction {
    pub(crate) const fn dst(&self) -> RGroupRegisterID {
        match self {
            Self::ISUB_R { dst, .. }
            | Self::IXOR_R { dst, .. }
            | Self::IADD_RS { dst, .. }
            | Self::IMUL_R { dst, .. }
            | Self::IROR_C { dst, .. }
            | Self::IADD_C { dst, .. }
            | Self::IXOR_C { dst, .. }
            | Self::IMULH_R { dst, .. }
            | Self::ISMULH_R { dst, .. }
            | Self::IMUL_RCP { dst, .. } => *dst,
        }
    }

    pub(crate) const fn src(&self) -> Option<RGroupRegisterID> {
        match self {
            Self::ISUB_R { src, .. }
            | Self::IXOR_R { src, .. }
            | Self::IADD_RS { src, .. }
            | Self::IMUL_R { src, .. }
            | Self::IMULH_R { src, .. }
            | Self::ISMULH_R { src, .. } => Some(*src),
            Self::IROR_C { .. } | Self::IADD_C { .. } | Self::IXOR_C { .. } | Self::IMUL_RCP { .. } => {
                None
            }
        }
    }

    #[cfg(test)]
    pub(crate) const fn id(&self) -> ScalarInstructionID {
        match self {
            Self::ISUB_R { .. } => ScalarInstructionID::ISUB_R,
            Self::IXOR_R { .. } => ScalarInstructionID::IXOR_R,
            Self::IADD_RS { .. } => ScalarInstructionID::IADD_RS,
            Self::IMUL_R { .. } => ScalarInstructionID::IMUL_R,
            Self::IROR_C { .. } => ScalarInstructionID::IROR_C,
            Self::IADD_C { .. } => ScalarInstructionID::IADD_C,
            Self::IXOR_C { .. } => ScalarInstructionID::IXOR_C,
            Self::IMULH_R { .. } => ScalarInstructionID::IMULH_R,
            Self::ISMULH_R { .. } => ScalarInstructionID::ISMULH_R,
            Self::IMUL_RCP { .. } => ScalarInstructionID::IMUL_RCP,
        }
    }
}

/// The parameter of the last operation applied to a register.
///
/// Two operations of the same group with the same parameter in a row on one register are
/// avoided.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum OpSource {
    Constant,
    Register(RGroupRegisterID),
    /// Not actually a source, the high multiplications use a random value here so that they
    /// never match.
    Randi32(i32),
}

impl OpSource {
    pub(crate) const fn from_rand_i32(x: i32) -> Self {
        match x {
            -1 => Self::Constant,
            #[expect(
                clippy::cast_sign_loss,
                clippy::cast_possible_truncation,
                reason = "in 0..=7"
            )]
            0..=7 => Self::Register(RGroupRegisterID::from_u8(x as u8)),
            rand => Self::Randi32(rand),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rand_i32_sources() {
        assert_eq!(OpSource::from_rand_i32(-1), OpSource::Constant);
        assert_eq!(
            OpSource::from_rand_i32(6),
            OpSource::Register(RGroupRegisterID::R6)
        );
        assert_eq!(OpSource::from_rand_i32(8), OpSource::Randi32(8));
    }

    #[test]
    fn operand_macro_ops_exist() {
        use ScalarInstructionID::{
            IADD_C, IADD_RS, IMULH_R, IMUL_R, IMUL_RCP, IROR_C, ISMULH_R, ISUB_R, IXOR_C, IXOR_R,
        };

        for id in [
            ISUB_R, IXOR_R, IADD_RS, IMUL_R, IROR_C, IADD_C, IXOR_C, IMULH_R, ISMULH_R, IMUL_RCP,
        ] {
            let len = id.number_of_macro_ops();
            assert!(id.macro_op_to_select_src().map_or(true, |op| op < len));
            assert!(id.macro_op_to_select_dst() < len);
            assert!(id.macro_op_to_store_res() < len);
            assert!(id.macro_op_to_select_dst() <= id.macro_op_to_store_res());
        }
    }
}
