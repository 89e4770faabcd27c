//! VM programs.
//!
//! A program is generated from a 64 byte seed with AesGenerator4R: 128 bytes of entropy used to
//! configure the VM followed by the instructions.
//!
//! https://github.com/tevador/RandomX/blob/master/doc/specs.md#44-program-buffer-generation

use crate::aes_hash::aes_fill_4r;
use crate::config::{RandomXConfig, CACHE_LINE_SIZE, INSTRUCTION_SIZE, PROGRAM_ENTROPY_SIZE};
use crate::registers::RGroupRegisterID;

/// Mantissa bits of an f64.
const MANTISSA_SIZE: u32 = 52;
const MANTISSA_MASK: u64 = (1 << MANTISSA_SIZE) - 1;
const EXPONENT_BIAS: u64 = 1023;
const EXPONENT_MASK: u64 = 2047;

/// Fixed exponent bits of the E group registers.
const CONST_EXPONENT_BITS: u64 = 0x300;
const DYNAMIC_EXPONENT_BITS: u32 = 4;
const STATIC_EXPONENT_BITS: u32 = 4;
/// The low bits of the E registers kept from the scratchpad value.
const DYNAMIC_MANTISSA_MASK: u64 = (1 << (MANTISSA_SIZE + DYNAMIC_EXPONENT_BITS)) - 1;
const E_MASK_MANTISSA: u64 = (1 << 22) - 1;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[expect(non_camel_case_types)]
pub(crate) enum Opcode {
    IADD_RS,
    IADD_M,
    ISUB_R,
    ISUB_M,
    IMUL_R,
    IMUL_M,
    IMULH_R,
    IMULH_M,
    ISMULH_R,
    ISMULH_M,
    IMUL_RCP,
    INEG_R,
    IXOR_R,
    IXOR_M,
    IROR_R,
    IROL_R,
    ISWAP_R,
    FSWAP_R,
    FADD_R,
    FADD_M,
    FSUB_R,
    FSUB_M,
    FSCAL_R,
    FMUL_R,
    FDIV_M,
    FSQRT_R,
    CBRANCH,
    CFROUND,
    ISTORE,
    NOP,
}

impl Opcode {
    /// Every opcode, in the order their frequencies fill the decode table.
    const ALL: [Self; 30] = [
        Self::IADD_RS,
        Self::IADD_M,
        Self::ISUB_R,
        Self::ISUB_M,
        Self::IMUL_R,
        Self::IMUL_M,
        Self::IMULH_R,
        Self::IMULH_M,
        Self::ISMULH_R,
        Self::ISMULH_M,
        Self::IMUL_RCP,
        Self::INEG_R,
        Self::IXOR_R,
        Self::IXOR_M,
        Self::IROR_R,
        Self::IROL_R,
        Self::ISWAP_R,
        Self::FSWAP_R,
        Self::FADD_R,
        Self::FADD_M,
        Self::FSUB_R,
        Self::FSUB_M,
        Self::FSCAL_R,
        Self::FMUL_R,
        Self::FDIV_M,
        Self::FSQRT_R,
        Self::CBRANCH,
        Self::CFROUND,
        Self::ISTORE,
        Self::NOP,
    ];
}

/// Maps an opcode byte to an [`Opcode`].
#[derive(Debug, Clone)]
pub(crate) struct OpcodeTable([Opcode; 256]);

impl OpcodeTable {
    /// Builds the table, the config's frequencies must sum to 256.
    pub(crate) fn new(config: &RandomXConfig) -> Self {
        let mut table = [Opcode::NOP; 256];

        let mut next = 0;
        for (opcode, frequency) in Opcode::ALL
            .into_iter()
            .zip(config.frequencies.in_opcode_order())
        {
            let end = (next + usize::from(frequency)).min(table.len());
            table[next..end].fill(opcode);
            next = end;
        }

        Self(table)
    }

    pub(crate) const fn get(&self, byte: u8) -> Opcode {
        self.0[byte as usize]
    }
}

/// An encoded VM instruction.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) struct Instruction {
    pub(crate) opcode: Opcode,
    pub(crate) dst: u8,
    pub(crate) src: u8,
    pub(crate) mod_: u8,
    pub(crate) imm32: u32,
}

impl Instruction {
    fn decode(bytes: &[u8], table: &OpcodeTable) -> Self {
        Self {
            opcode: table.get(bytes[0]),
            dst: bytes[1],
            src: bytes[2],
            mod_: bytes[3],
            imm32: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }
    }

    /// Integer destination register.
    pub(crate) const fn dst_reg(&self) -> RGroupRegisterID {
        RGroupRegisterID::from_u8(self.dst)
    }

    /// Integer source register.
    pub(crate) const fn src_reg(&self) -> RGroupRegisterID {
        RGroupRegisterID::from_u8(self.src)
    }

    /// Whether a memory operand is read from L1 (`true`) or L2.
    pub(crate) const fn mod_mem(&self) -> bool {
        self.mod_ % 4 != 0
    }

    pub(crate) const fn mod_shift(&self) -> u32 {
        ((self.mod_ >> 2) % 4) as u32
    }

    pub(crate) const fn mod_cond(&self) -> u8 {
        self.mod_ >> 4
    }
}

/// A generated program.
#[derive(Debug, Clone)]
pub(crate) struct Program {
    pub(crate) entropy: [u64; 16],
    pub(crate) instructions: Vec<Instruction>,
}

impl Program {
    /// Generates a program from `seed`, which is left unchanged.
    pub(crate) fn generate(seed: &[u8; 64], config: &RandomXConfig, table: &OpcodeTable) -> Self {
        let mut bytes = vec![0; config.program_bytes()];
        aes_fill_4r(seed, &mut bytes);

        let (entropy_bytes, instruction_bytes) = bytes.split_at(PROGRAM_ENTROPY_SIZE);

        let mut entropy = [0; 16];
        for (word, chunk) in entropy.iter_mut().zip(entropy_bytes.chunks_exact(8)) {
            *word = u64::from_le_bytes([
                chunk[0], chunk[1], chunk[2], chunk[3], chunk[4], chunk[5], chunk[6], chunk[7],
            ]);
        }

        let instructions = instruction_bytes
            .chunks_exact(INSTRUCTION_SIZE)
            .map(|bytes| Instruction::decode(bytes, table))
            .collect();

        Self {
            entropy,
            instructions,
        }
    }
}

/// The VM configuration derived from a program's entropy.
#[derive(Debug, Copy, Clone, PartialEq)]
pub(crate) struct ProgramConfiguration {
    /// The initial A group registers.
    pub(crate) a: [[f64; 2]; 4],
    pub(crate) ma: u32,
    pub(crate) mx: u32,
    /// The registers used to pick scratchpad addresses and the next dataset item.
    pub(crate) read_regs: [RGroupRegisterID; 4],
    /// Byte offset of this program's window into the dataset.
    pub(crate) dataset_offset: u64,
    /// Exponent and mantissa bits forced onto E group values.
    pub(crate) e_mask: [u64; 2],
}

impl ProgramConfiguration {
    pub(crate) fn new(entropy: &[u64; 16], config: &RandomXConfig) -> Self {
        let mut a = [[0.0; 2]; 4];
        for (i, reg) in a.iter_mut().enumerate() {
            reg[0] = f64::from_bits(small_positive_float_bits(entropy[2 * i]));
            reg[1] = f64::from_bits(small_positive_float_bits(entropy[2 * i + 1]));
        }

        #[expect(clippy::cast_possible_truncation, reason = "only the low 32 bits are used")]
        let (ma, mx) = (
            (entropy[8] as u32) & config.cache_line_align_mask(),
            entropy[10] as u32,
        );

        let address_registers = entropy[12];
        let read_reg =
            |i: u8| RGroupRegisterID::from_u8(2 * i + u8::from((address_registers >> i) & 1 == 1));
        let dataset_offset =
            (entropy[13] % (config.dataset_extra_items() + 1)) * CACHE_LINE_SIZE as u64;

        Self {
            a,
            ma,
            mx,
            read_regs: [read_reg(0), read_reg(1), read_reg(2), read_reg(3)],
            dataset_offset,
            e_mask: [float_mask(entropy[14]), float_mask(entropy[15])],
        }
    }
}

/// A float in `[1, 2^32)` from 64 random bits.
const fn small_positive_float_bits(entropy: u64) -> u64 {
    let mantissa = entropy & MANTISSA_MASK;
    let exponent = ((entropy >> 59) + EXPONENT_BIAS) & EXPONENT_MASK;
    (exponent << MANTISSA_SIZE) | mantissa
}

const fn float_mask(entropy: u64) -> u64 {
    let exponent = CONST_EXPONENT_BITS
        | (entropy >> (u64::BITS - STATIC_EXPONENT_BITS)) << DYNAMIC_EXPONENT_BITS;
    (entropy & E_MASK_MANTISSA) | (exponent << MANTISSA_SIZE)
}

/// Forces the E group exponent and mantissa bits onto a value.
pub(crate) fn mask_e_register(value: [f64; 2], e_mask: [u64; 2]) -> [f64; 2] {
    [
        f64::from_bits((value[0].to_bits() & DYNAMIC_MANTISSA_MASK) | e_mask[0]),
        f64::from_bits((value[1].to_bits() & DYNAMIC_MANTISSA_MASK) | e_mask[1]),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monero_opcode_table() {
        let table = OpcodeTable::new(&RandomXConfig::MONERO);

        assert_eq!(table.get(0), Opcode::IADD_RS);
        assert_eq!(table.get(15), Opcode::IADD_RS);
        assert_eq!(table.get(16), Opcode::IADD_M);
        assert_eq!(table.get(255), Opcode::ISTORE);
        assert_eq!(table.0.iter().filter(|op| **op == Opcode::FMUL_R).count(), 32);
        assert!(!table.0.contains(&Opcode::NOP));
    }

    #[test]
    fn program_generation_is_deterministic() {
        let config = RandomXConfig::MONERO;
        let table = OpcodeTable::new(&config);

        let a = Program::generate(&[1; 64], &config, &table);
        let b = Program::generate(&[1; 64], &config, &table);
        let c = Program::generate(&[2; 64], &config, &table);

        assert_eq!(a.instructions.len(), config.program_size);
        assert_eq!(a.entropy, b.entropy);
        assert_eq!(a.instructions, b.instructions);
        assert_ne!(a.entropy, c.entropy);
    }

    #[test]
    fn configuration_ranges() {
        let config = RandomXConfig::MONERO;
        let table = OpcodeTable::new(&config);
        let program = Program::generate(&[7; 64], &config, &table);
        let conf = ProgramConfiguration::new(&program.entropy, &config);

        for reg in conf.a.iter().flatten() {
            assert!((1.0..4_294_967_296.0).contains(reg));
        }
        assert_eq!(conf.ma % 64, 0);
        assert!(conf.dataset_offset <= config.dataset_extra_size);
        assert_eq!(conf.dataset_offset % 64, 0);

        for (i, reg) in conf.read_regs.iter().enumerate() {
            assert!(reg.index() == 2 * i || reg.index() == 2 * i + 1);
        }
    }

    #[test]
    fn e_masks() {
        // exponent 0x300 | 0xF << 4, mantissa bits from the low 22 bits
        assert_eq!(float_mask(u64::MAX), (0x3F0 << 52) | ((1 << 22) - 1));
        assert_eq!(float_mask(0), 0x300 << 52);

        let masked = mask_e_register(
            [f64::from_bits(u64::MAX), 1.0],
            [float_mask(0), float_mask(0)],
        );
        assert_eq!(masked[0].to_bits(), 0x30FF_FFFF_FFFF_FFFF);
        assert_eq!(masked[1].to_bits(), 0x30F0_0000_0000_0000);
    }

    #[test]
    fn small_positive_floats() {
        assert_eq!(small_positive_float_bits(0), 1.0_f64.to_bits());
        assert_eq!(
            small_positive_float_bits(31 << 59),
            2_147_483_648.0_f64.to_bits()
        );
    }
}
