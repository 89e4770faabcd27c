//! RandomX parameters.
//!
//! Every tunable of the algorithm lives in [`RandomXConfig`], the defaults are the parameters used
//! by Monero. Changing any value changes every hash, so a config is fixed for the lifetime of a
//! [`Cache`](crate::Cache), [`Dataset`](crate::Dataset) and [`RandomXVm`](crate::RandomXVm).

use crate::{is_0_or_power_of_2, registers::RGroupRegisterID, RandomXError};

/// Size of one Argon2 block in bytes.
pub(crate) const ARGON_BLOCK_SIZE: usize = 1024;

/// Size of a cache line, which is also the size of a dataset item.
pub(crate) const CACHE_LINE_SIZE: usize = 64;

/// The register that needs a displacement when used as an `IADD_RS` destination.
pub(crate) const REGISTER_NEEDS_DISPLACEMENT: RGroupRegisterID = RGroupRegisterID::R5;

/// Instructions with a `mod.cond` at least this big store to L3.
pub(crate) const STORE_L3_CONDITION: u8 = 14;

/// Size of the entropy block at the start of each program.
pub(crate) const PROGRAM_ENTROPY_SIZE: usize = 128;

/// Size of a single encoded VM instruction.
pub(crate) const INSTRUCTION_SIZE: usize = 8;

/// The weight of every VM instruction.
///
/// The opcode of an instruction is a random byte, an instruction with a frequency of `n` is picked
/// for `n` of the 256 possible values, so the frequencies must sum to 256.
/// Field names are the instruction names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstructionFrequencies {
    pub iadd_rs: u8,
    pub iadd_m: u8,
    pub isub_r: u8,
    pub isub_m: u8,
    pub imul_r: u8,
    pub imul_m: u8,
    pub imulh_r: u8,
    pub imulh_m: u8,
    pub ismulh_r: u8,
    pub ismulh_m: u8,
    pub imul_rcp: u8,
    pub ineg_r: u8,
    pub ixor_r: u8,
    pub ixor_m: u8,
    pub iror_r: u8,
    pub irol_r: u8,
    pub iswap_r: u8,
    pub fswap_r: u8,
    pub fadd_r: u8,
    pub fadd_m: u8,
    pub fsub_r: u8,
    pub fsub_m: u8,
    pub fscal_r: u8,
    pub fmul_r: u8,
    pub fdiv_m: u8,
    pub fsqrt_r: u8,
    pub cbranch: u8,
    pub cfround: u8,
    pub istore: u8,
    pub nop: u8,
}

impl InstructionFrequencies {
    /// The frequencies used in Monero's RandomX.
    pub const MONERO: Self = Self {
        iadd_rs: 16,
        iadd_m: 7,
        isub_r: 16,
        isub_m: 7,
        imul_r: 16,
        imul_m: 4,
        imulh_r: 4,
        imulh_m: 1,
        ismulh_r: 4,
        ismulh_m: 1,
        imul_rcp: 8,
        ineg_r: 2,
        ixor_r: 15,
        ixor_m: 5,
        iror_r: 8,
        irol_r: 2,
        iswap_r: 4,
        fswap_r: 4,
        fadd_r: 16,
        fadd_m: 5,
        fsub_r: 16,
        fsub_m: 5,
        fscal_r: 6,
        fmul_r: 32,
        fdiv_m: 4,
        fsqrt_r: 6,
        cbranch: 25,
        cfround: 1,
        istore: 16,
        nop: 0,
    };

    /// The frequencies in opcode order.
    pub(crate) const fn in_opcode_order(&self) -> [u8; 30] {
        [
            self.iadd_rs,
            self.iadd_m,
            self.isub_r,
            self.isub_m,
            self.imul_r,
            self.imul_m,
            self.imulh_r,
            self.imulh_m,
            self.ismulh_r,
            self.ismulh_m,
            self.imul_rcp,
            self.ineg_r,
            self.ixor_r,
            self.ixor_m,
            self.iror_r,
            self.irol_r,
            self.iswap_r,
            self.fswap_r,
            self.fadd_r,
            self.fadd_m,
            self.fsub_r,
            self.fsub_m,
            self.fscal_r,
            self.fmul_r,
            self.fdiv_m,
            self.fsqrt_r,
            self.cbranch,
            self.cfround,
            self.istore,
            self.nop,
        ]
    }

    /// The sum of all the frequencies.
    pub fn total(&self) -> u32 {
        self.in_opcode_order().iter().map(|f| u32::from(*f)).sum()
    }
}

impl Default for InstructionFrequencies {
    fn default() -> Self {
        Self::MONERO
    }
}

/// The RandomX parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RandomXConfig {
    /// Argon2 memory in KiB, the cache size.
    pub argon_memory: u32,
    /// Number of Argon2 passes.
    pub argon_iterations: u32,
    /// Number of Argon2 lanes.
    pub argon_lanes: u32,
    /// Argon2 salt, at least 8 bytes.
    pub argon_salt: &'static [u8],
    /// Number of superscalar programs, one per cache access when building a dataset item.
    pub cache_accesses: usize,
    /// Target latency for SuperscalarHash (in cycles of the reference CPU).
    pub superscalar_latency: usize,
    /// Dataset base size in bytes. Must be a power of 2.
    pub dataset_base_size: u64,
    /// Dataset extra size in bytes. Must be a multiple of 64.
    pub dataset_extra_size: u64,
    /// Number of instructions in a program.
    pub program_size: usize,
    /// Number of iterations of a program during a single chain.
    pub program_iterations: usize,
    /// Number of chained programs per hash.
    pub program_count: usize,
    /// Scratchpad L1 size in bytes.
    pub scratchpad_l1: usize,
    /// Scratchpad L2 size in bytes.
    pub scratchpad_l2: usize,
    /// Scratchpad L3 size in bytes, this is the whole scratchpad.
    pub scratchpad_l3: usize,
    /// How many bits of the register a `CBRANCH` tests.
    pub jump_bits: u32,
    /// The lowest bit tested by a `CBRANCH`.
    pub jump_offset: u32,
    /// VM instruction weights.
    pub frequencies: InstructionFrequencies,
}

impl RandomXConfig {
    /// The parameters used by Monero.
    pub const MONERO: Self = Self {
        argon_memory: 262_144,
        argon_iterations: 3,
        argon_lanes: 1,
        argon_salt: b"RandomX\x03",
        cache_accesses: 8,
        superscalar_latency: 170,
        dataset_base_size: 2_147_483_648,
        dataset_extra_size: 33_554_368,
        program_size: 256,
        program_iterations: 2048,
        program_count: 8,
        scratchpad_l1: 16384,
        scratchpad_l2: 262_144,
        scratchpad_l3: 2_097_152,
        jump_bits: 8,
        jump_offset: 8,
        frequencies: InstructionFrequencies::MONERO,
    };

    /// The RandomXL parameters used by Loki.
    ///
    /// The cache takes 4 Argon2 passes over 2 lanes, and each hash chains 7 programs of 320
    /// instructions.
    pub const RANDOMXL: Self = Self {
        argon_iterations: 4,
        argon_lanes: 2,
        argon_salt: b"RandomXL\x12",
        program_size: 320,
        program_count: 7,
        ..Self::MONERO
    };

    /// Checks the invariants the rest of the crate relies on.
    pub fn validate(&self) -> Result<(), RandomXError> {
        let invalid = |reason| Err(RandomXError::InvalidConfig(reason));

        if self.argon_salt.len() < 8 {
            return invalid("the Argon2 salt must be at least 8 bytes");
        }
        if self.argon_lanes == 0 || self.argon_iterations == 0 {
            return invalid("Argon2 lanes and iterations must be non-zero");
        }
        if u64::from(self.argon_memory) < 8 * u64::from(self.argon_lanes)
            || !is_0_or_power_of_2(u64::from(self.argon_memory))
        {
            return invalid("Argon2 memory must be a power of 2 of at least 8 KiB per lane");
        }
        if self.cache_accesses < 2 {
            return invalid("at least 2 cache accesses are needed");
        }
        if self.superscalar_latency == 0 {
            return invalid("the superscalar latency must be non-zero");
        }
        if self.dataset_base_size < CACHE_LINE_SIZE as u64
            || !is_0_or_power_of_2(self.dataset_base_size)
            || self.dataset_base_size > 1 << 32
        {
            return invalid("the dataset base size must be a power of 2 between 64 B and 4 GiB");
        }
        if self.dataset_extra_size % CACHE_LINE_SIZE as u64 != 0 {
            return invalid("the dataset extra size must be a multiple of 64");
        }
        if self.program_size == 0 || self.program_size % 8 != 0 {
            return invalid("the program size must be a non-zero multiple of 8");
        }
        if self.program_iterations == 0 || self.program_count == 0 {
            return invalid("program iterations and count must be non-zero");
        }
        if !self.scratchpad_l3.is_power_of_two()
            || !self.scratchpad_l2.is_power_of_two()
            || !self.scratchpad_l1.is_power_of_two()
        {
            return invalid("scratchpad levels must be powers of 2");
        }
        if self.scratchpad_l1 < 64
            || self.scratchpad_l2 < self.scratchpad_l1
            || self.scratchpad_l3 < self.scratchpad_l2
            || self.scratchpad_l3 > 1 << 31
        {
            return invalid("scratchpad levels must satisfy 64 <= L1 <= L2 <= L3 <= 2 GiB");
        }
        if self.jump_bits == 0
            || u64::from(self.jump_bits) + u64::from(self.jump_offset) + 15 > 63
        {
            return invalid("jump bits and offset must fit in a register");
        }
        if self.frequencies.total() != 256 {
            return invalid("instruction frequencies must sum to 256");
        }

        Ok(())
    }

    /// The cache size in bytes.
    pub const fn cache_size(&self) -> usize {
        self.argon_memory as usize * ARGON_BLOCK_SIZE
    }

    /// The amount of 64 byte lines in the cache.
    pub(crate) const fn cache_lines(&self) -> usize {
        self.cache_size() / CACHE_LINE_SIZE
    }

    /// The dataset size in bytes.
    pub const fn dataset_size(&self) -> u64 {
        self.dataset_base_size + self.dataset_extra_size
    }

    /// The amount of items in the dataset.
    pub const fn dataset_item_count(&self) -> u64 {
        self.dataset_size() / CACHE_LINE_SIZE as u64
    }

    /// The amount of extra items a program can be offset by.
    pub(crate) const fn dataset_extra_items(&self) -> u64 {
        self.dataset_extra_size / CACHE_LINE_SIZE as u64
    }

    /// Mask used on `mx`/`ma` to get a 64 byte aligned dataset offset.
    pub(crate) const fn cache_line_align_mask(&self) -> u32 {
        ((self.dataset_base_size - 1) & !(CACHE_LINE_SIZE as u64 - 1)) as u32
    }

    /// Maximum size of a superscalar program.
    pub(crate) const fn superscalar_max_size(&self) -> usize {
        3 * self.superscalar_latency + 2
    }

    /// The amount of bytes needed to generate a program.
    pub(crate) const fn program_bytes(&self) -> usize {
        PROGRAM_ENTROPY_SIZE + INSTRUCTION_SIZE * self.program_size
    }

    pub(crate) const fn scratchpad_l1_mask(&self) -> u64 {
        (self.scratchpad_l1 as u64 - 1) & !7
    }

    pub(crate) const fn scratchpad_l2_mask(&self) -> u64 {
        (self.scratchpad_l2 as u64 - 1) & !7
    }

    pub(crate) const fn scratchpad_l3_mask(&self) -> u64 {
        (self.scratchpad_l3 as u64 - 1) & !7
    }

    /// Mask for 64 byte aligned scratchpad lines.
    pub(crate) const fn scratchpad_l3_mask64(&self) -> u32 {
        ((self.scratchpad_l3 as u64 - 1) & !63) as u32
    }

    pub(crate) const fn condition_mask(&self) -> u64 {
        (1 << self.jump_bits) - 1
    }
}

impl Default for RandomXConfig {
    fn default() -> Self {
        Self::MONERO
    }
}
