//! Superscalar programs, used to mix cache lines into dataset items.
//!
//! https://github.com/tevador/RandomX/blob/master/doc/specs.md#6-superscalarhash
mod cpu;
mod executor;
mod generator;
mod instructions;

use crate::blake2_generator::Blake2Generator;
use crate::config::RandomXConfig;
use crate::registers::{RGroupRegisterID, RGroupRegisters};
use executor::execute;
pub(crate) use executor::{high_mul, randomx_reciprocal, sign_extend_2s_compl, signed_high_mul};
use generator::generate;
use instructions::ScalarInstruction;

/// A superscalar program.
#[derive(Debug, Clone)]
pub(crate) struct SSProgram {
    program: Vec<ScalarInstruction>,
    reg_with_max_latency: RGroupRegisterID,
}

impl SSProgram {
    pub(crate) fn generate(blake_gen: &mut Blake2Generator, config: &RandomXConfig) -> Self {
        generate(blake_gen, config)
    }

    pub(crate) fn execute(&self, registers: &mut RGroupRegisters) {
        execute(&self.program, registers);
    }

    /// The register whose value picks the next cache line.
    pub(crate) const fn reg_with_max_latency(&self) -> RGroupRegisterID {
        self.reg_with_max_latency
    }

    pub(crate) fn len(&self) -> usize {
        self.program.len()
    }
}
