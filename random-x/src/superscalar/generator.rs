use crate::blake2_generator::Blake2Generator;
use crate::config::{RandomXConfig, REGISTER_NEEDS_DISPLACEMENT};
use crate::is_0_or_power_of_2;
use crate::registers::RGroupRegisterID;
use crate::superscalar::cpu::{DecoderBuffer, ProgramSchedule, SlotLen};
use crate::superscalar::executor::{randomx_reciprocal, sign_extend_2s_compl};
use crate::superscalar::instructions::{OpSource, ScalarInstruction, ScalarInstructionID};
use crate::superscalar::SSProgram;

/// How many cycles to wait for an operand before throwing the instruction away.
const LOOK_FORWARD_CYCLES: usize = 4;

/// How many instructions in a row can be thrown away before a decode buffer is abandoned.
const MAX_THROWAWAY_COUNT: usize = 256;

/// What the generator knows about a register.
#[derive(Debug, Copy, Clone)]
struct RegisterInfo {
    /// The cycle the register's value is ready.
    latency: usize,
    last_op_group: Option<ScalarInstructionID>,
    last_op_par: OpSource,
}

impl Default for RegisterInfo {
    fn default() -> Self {
        Self {
            latency: 0,
            last_op_group: None,
            last_op_par: OpSource::Constant,
        }
    }
}

/// An instruction whose macro ops are being scheduled.
#[derive(Debug)]
struct SelectedInstruction {
    id: ScalarInstructionID,
    dst: RGroupRegisterID,
    src: Option<RGroupRegisterID>,
    mod_: u8,
    imm32: u32,
    group: ScalarInstructionID,
    group_par: OpSource,
    can_reuse: bool,
    group_par_is_source: bool,
}

impl SelectedInstruction {
    /// Picks an instruction whose first macro op fits the slot.
    fn for_slot(
        blake_gen: &mut Blake2Generator,
        slot: SlotLen,
        buffer: DecoderBuffer,
        is_last: bool,
    ) -> Self {
        type Id = ScalarInstructionID;

        let id = match slot {
            // the last slot can also hold a high multiplication
            SlotLen::L3 if is_last => {
                let ids = [Id::ISUB_R, Id::IXOR_R, Id::IMULH_R, Id::ISMULH_R];
                ids[usize::from(blake_gen.next_u8() & 3)]
            }
            SlotLen::L3 => [Id::ISUB_R, Id::IXOR_R][usize::from(blake_gen.next_u8() & 1)],
            // the 4-4-4-4 buffer issues multiplications in its first 3 slots
            SlotLen::L4 if buffer == DecoderBuffer::B4444 && !is_last => Id::IMUL_R,
            SlotLen::L4 => [Id::IROR_C, Id::IADD_RS][usize::from(blake_gen.next_u8() & 1)],
            SlotLen::L7 | SlotLen::L8 | SlotLen::L9 => {
                [Id::IXOR_C, Id::IADD_C][usize::from(blake_gen.next_u8() & 1)]
            }
            SlotLen::L10 => Id::IMUL_RCP,
        };

        Self::create(id, blake_gen)
    }

    fn create(id: ScalarInstructionID, blake_gen: &mut Blake2Generator) -> Self {
        let mut instr = Self {
            id,
            dst: RGroupRegisterID::R0,
            src: None,
            mod_: 0,
            imm32: 0,
            group: id.instruction_group(),
            group_par: OpSource::Constant,
            can_reuse: id.can_dst_be_src(),
            group_par_is_source: false,
        };

        match id {
            ScalarInstructionID::ISUB_R
            | ScalarInstructionID::IXOR_R
            | ScalarInstructionID::IMUL_R => instr.group_par_is_source = true,
            ScalarInstructionID::IADD_RS => {
                instr.mod_ = blake_gen.next_u8();
                instr.group_par_is_source = true;
            }
            ScalarInstructionID::IROR_C => {
                while instr.imm32 == 0 {
                    instr.imm32 = u32::from(blake_gen.next_u8() & 63);
                }
            }
            ScalarInstructionID::IADD_C | ScalarInstructionID::IXOR_C => {
                instr.imm32 = blake_gen.next_u32();
            }
            ScalarInstructionID::IMULH_R | ScalarInstructionID::ISMULH_R => {
                #[expect(clippy::cast_possible_wrap, reason = "any 32 bits")]
                let par = blake_gen.next_u32() as i32;
                instr.group_par = OpSource::from_rand_i32(par);
            }
            ScalarInstructionID::IMUL_RCP => {
                while is_0_or_power_of_2(u64::from(instr.imm32)) {
                    instr.imm32 = blake_gen.next_u32();
                }
            }
        }

        instr
    }

    fn macro_op_count(&self) -> usize {
        self.id.number_of_macro_ops()
    }

    fn select_source(
        &mut self,
        cycle: usize,
        registers: &[RegisterInfo; 8],
        blake_gen: &mut Blake2Generator,
    ) -> bool {
        let available = RGroupRegisterID::iter()
            .filter(|reg| registers[reg.index()].latency <= cycle)
            .collect::<Vec<_>>();

        // r5 can't be the destination of IADD_RS, so if it's 1 of only 2 options use it as the source.
        if available.len() == 2
            && self.id == ScalarInstructionID::IADD_RS
            && available.contains(&REGISTER_NEEDS_DISPLACEMENT)
        {
            self.src = Some(REGISTER_NEEDS_DISPLACEMENT);
            self.group_par = OpSource::Register(REGISTER_NEEDS_DISPLACEMENT);
            return true;
        }

        let Some(src) = select_register(&available, blake_gen) else {
            return false;
        };

        self.src = Some(src);
        if self.group_par_is_source {
            self.group_par = OpSource::Register(src);
        }
        true
    }

    fn select_destination(
        &mut self,
        cycle: usize,
        allow_chained_mul: bool,
        registers: &[RegisterInfo; 8],
        blake_gen: &mut Blake2Generator,
    ) -> bool {
        let available = RGroupRegisterID::iter()
            .filter(|&reg| {
                let info = &registers[reg.index()];

                info.latency <= cycle
                    && (self.can_reuse || Some(reg) != self.src)
                    && (allow_chained_mul
                        || self.group != ScalarInstructionID::IMUL_R
                        || info.last_op_group != Some(ScalarInstructionID::IMUL_R))
                    && (info.last_op_group != Some(self.group) || info.last_op_par != self.group_par)
                    && (self.id != ScalarInstructionID::IADD_RS
                        || reg != REGISTER_NEEDS_DISPLACEMENT)
            })
            .collect::<Vec<_>>();

        let Some(dst) = select_register(&available, blake_gen) else {
            return false;
        };
        self.dst = dst;
        true
    }

    fn to_instruction(&self) -> ScalarInstruction {
        let dst = self.dst;
        let src = self.src.unwrap_or(dst);

        match self.id {
            ScalarInstructionID::ISUB_R => ScalarInstruction::ISUB_R { dst, src },
            ScalarInstructionID::IXOR_R => ScalarInstruction::IXOR_R { dst, src },
            ScalarInstructionID::IADD_RS => ScalarInstruction::IADD_RS {
                dst,
                src,
                shift: u32::from((self.mod_ >> 2) % 4),
            },
            ScalarInstructionID::IMUL_R => ScalarInstruction::IMUL_R { dst, src },
            ScalarInstructionID::IROR_C => ScalarInstruction::IROR_C {
                dst,
                imm: self.imm32,
            },
            ScalarInstructionID::IADD_C => ScalarInstruction::IADD_C {
                dst,
                imm: sign_extend_2s_compl(self.imm32),
            },
            ScalarInstructionID::IXOR_C => ScalarInstruction::IXOR_C {
                dst,
                imm: sign_extend_2s_compl(self.imm32),
            },
            ScalarInstructionID::IMULH_R => ScalarInstruction::IMULH_R { dst, src },
            ScalarInstructionID::ISMULH_R => ScalarInstruction::ISMULH_R { dst, src },
            ScalarInstructionID::IMUL_RCP => ScalarInstruction::IMUL_RCP {
                dst,
                reciprocal: randomx_reciprocal(self.imm32),
            },
        }
    }
}

fn select_register(
    available: &[RGroupRegisterID],
    blake_gen: &mut Blake2Generator,
) -> Option<RGroupRegisterID> {
    match available.len() {
        0 => None,
        1 => Some(available[0]),
        len => Some(available[blake_gen.next_u32() as usize % len]),
    }
}

fn fetch_next_buffer(
    current: Option<ScalarInstructionID>,
    decode_cycle: usize,
    mul_count: usize,
    blake_gen: &mut Blake2Generator,
) -> DecoderBuffer {
    // a high multiplication is 3 bytes and 2 micro ops, the 3-3-10 buffer fits what's left of it.
    if matches!(
        current,
        Some(ScalarInstructionID::IMULH_R | ScalarInstructionID::ISMULH_R)
    ) {
        return DecoderBuffer::B3310;
    }

    // keep the multiplication port saturated
    if mul_count < decode_cycle + 1 {
        return DecoderBuffer::B4444;
    }

    // IMUL_RCP continues with a 4 byte multiplication
    if current == Some(ScalarInstructionID::IMUL_RCP) {
        return if blake_gen.next_u8() & 1 == 1 {
            DecoderBuffer::B484
        } else {
            DecoderBuffer::B493
        };
    }

    DecoderBuffer::RANDOM[usize::from(blake_gen.next_u8() & 3)]
}

/// Generates a superscalar program.
///
/// Instructions are picked to fill decode windows of the reference CPU and scheduled on its
/// ports until `superscalar_latency` cycles are reached or the ports are saturated.
pub(crate) fn generate(blake_gen: &mut Blake2Generator, config: &RandomXConfig) -> SSProgram {
    let latency = config.superscalar_latency;
    let max_size = config.superscalar_max_size();

    let mut schedule = ProgramSchedule::new(latency);
    let mut registers = [RegisterInfo::default(); 8];
    let mut program = Vec::with_capacity(max_size);

    let mut current: Option<SelectedInstruction> = None;
    let mut macro_op_idx = 0;
    let mut cycle = 0;
    let mut dep_cycle = 0;
    let mut ports_saturated = false;
    let mut mul_count = 0;
    let mut throw_away_count = 0;

    let mut decode_cycle = 0;
    while decode_cycle < latency && !ports_saturated && program.len() < max_size {
        let buffer = fetch_next_buffer(
            current.as_ref().map(|instr| instr.id),
            decode_cycle,
            mul_count,
            blake_gen,
        );
        let slots = buffer.slots();
        let mut buffer_idx = 0;

        while buffer_idx < slots.len() {
            let top_cycle = cycle;

            if current
                .as_ref()
                .map_or(true, |instr| macro_op_idx >= instr.macro_op_count())
            {
                if ports_saturated || program.len() >= max_size {
                    break;
                }
                current = Some(SelectedInstruction::for_slot(
                    blake_gen,
                    slots[buffer_idx],
                    buffer,
                    buffer_idx + 1 == slots.len(),
                ));
                macro_op_idx = 0;
            }
            let Some(instr) = current.as_mut() else {
                unreachable!("an instruction was selected above")
            };

            let op = instr.id.macro_ops()[macro_op_idx];

            let Some(mut schedule_cycle) = schedule.earliest_cycle_for_macro_op(op, cycle, dep_cycle)
            else {
                ports_saturated = true;
                break;
            };

            if instr.id.macro_op_to_select_src() == Some(macro_op_idx) {
                let mut forward = 0;
                while forward < LOOK_FORWARD_CYCLES
                    && !instr.select_source(schedule_cycle, &registers, blake_gen)
                {
                    schedule_cycle += 1;
                    cycle += 1;
                    forward += 1;
                }

                if forward == LOOK_FORWARD_CYCLES {
                    if throw_away_count < MAX_THROWAWAY_COUNT {
                        throw_away_count += 1;
                        macro_op_idx = instr.macro_op_count();
                        continue;
                    }
                    current = None;
                    break;
                }
            }

            if instr.id.macro_op_to_select_dst() == macro_op_idx {
                let mut forward = 0;
                while forward < LOOK_FORWARD_CYCLES
                    && !instr.select_destination(
                        schedule_cycle,
                        throw_away_count > 0,
                        &registers,
                        blake_gen,
                    )
                {
                    schedule_cycle += 1;
                    cycle += 1;
                    forward += 1;
                }

                if forward == LOOK_FORWARD_CYCLES {
                    if throw_away_count < MAX_THROWAWAY_COUNT {
                        throw_away_count += 1;
                        macro_op_idx = instr.macro_op_count();
                        continue;
                    }
                    current = None;
                    break;
                }
            }
            throw_away_count = 0;

            // operands are known now, schedule for real
            let Some(schedule_cycle) =
                schedule.schedule_macro_op_at_earliest(op, schedule_cycle, schedule_cycle)
            else {
                ports_saturated = true;
                break;
            };

            dep_cycle = schedule_cycle + op.cycles_to_complete();

            if instr.id.macro_op_to_store_res() == macro_op_idx {
                let info = &mut registers[instr.dst.index()];
                info.latency = dep_cycle;
                info.last_op_group = Some(instr.group);
                info.last_op_par = instr.group_par;
            }

            buffer_idx += 1;
            macro_op_idx += 1;

            if schedule_cycle >= latency {
                ports_saturated = true;
            }
            cycle = top_cycle;

            if macro_op_idx >= instr.macro_op_count() {
                program.push(instr.to_instruction());
                mul_count += usize::from(instr.id.is_multiplication());
            }
        }

        cycle += 1;
        decode_cycle += 1;
    }

    // The address register is the one with the longest dependency chain on an ASIC, which
    // executes every instruction in 1 cycle.
    let mut asic_latencies = [0_usize; 8];
    for instr in &program {
        let dst = instr.dst();
        let lat_dst = asic_latencies[dst.index()] + 1;
        let lat_src = match instr.src() {
            Some(src) if src != dst => asic_latencies[src.index()] + 1,
            _ => 0,
        };
        asic_latencies[dst.index()] = lat_dst.max(lat_src);
    }

    let mut reg_with_max_latency = RGroupRegisterID::R0;
    let mut max_latency = 0;
    for (reg, latency) in RGroupRegisterID::iter().zip(asic_latencies) {
        if latency > max_latency {
            max_latency = latency;
            reg_with_max_latency = reg;
        }
    }

    SSProgram {
        program,
        reg_with_max_latency,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn program(seed: &[u8], config: &RandomXConfig) -> SSProgram {
        generate(&mut Blake2Generator::new(seed, 0), config)
    }

    #[test]
    fn deterministic() {
        let config = RandomXConfig::MONERO;
        let a = program(b"test key 000", &config);
        let b = program(b"test key 000", &config);

        assert_eq!(a.program, b.program);
        assert_eq!(a.reg_with_max_latency, b.reg_with_max_latency);
        assert_ne!(a.program, program(b"test key 001", &config).program);
    }

    #[test]
    fn respects_size_and_register_rules() {
        let config = RandomXConfig::MONERO;

        for nonce in 0..16 {
            let prog = generate(&mut Blake2Generator::new(b"test key 000", nonce), &config);

            assert!(!prog.program.is_empty());
            assert!(prog.program.len() <= config.superscalar_max_size());

            for instr in &prog.program {
                match instr {
                    ScalarInstruction::ISUB_R { dst, src }
                    | ScalarInstruction::IXOR_R { dst, src }
                    | ScalarInstruction::IMUL_R { dst, src } => assert_ne!(dst, src),
                    ScalarInstruction::IADD_RS { dst, src, shift } => {
                        assert_ne!(dst, src);
                        assert_ne!(*dst, REGISTER_NEEDS_DISPLACEMENT);
                        assert!(*shift < 4);
                    }
                    ScalarInstruction::IROR_C { imm, .. } => assert!((1..64).contains(imm)),
                    _ => (),
                }
            }
        }
    }

    #[test]
    fn monero_programs_fill_the_latency() {
        // A Monero program saturates the ports, which takes well over a hundred instructions.
        let prog = program(b"test key 000", &RandomXConfig::MONERO);
        let muls = prog
            .program
            .iter()
            .filter(|instr| instr.id().is_multiplication())
            .count();

        assert!(prog.program.len() > 100);
        assert!(muls > 50);
    }
}
