//! A model of the reference CPU the superscalar programs are scheduled on.
//!
//! The CPU decodes 16 bytes of x86 code per cycle and has 3 execution ports, P0, P1 and P5.
//! Multiplications can only run on P1.

/// The amount of cycles past the latency target the schedule has to track, the highest amount
/// of cycles a macro op can take.
pub(crate) const CYCLE_MAP_EXTRA: usize = 4;

/// The size of an x86 instruction slot in a decode window.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum SlotLen {
    L3,
    L4,
    L7,
    L8,
    L9,
    L10,
}

/// The 6 ways a 16 byte decode window can be split into instruction slots.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum DecoderBuffer {
    /// 4-8-4
    B484,
    /// 7-3-3-3
    B7333,
    /// 3-7-3-3
    B3733,
    /// 4-9-3
    B493,
    /// 4-4-4-4
    B4444,
    /// 3-3-10
    B3310,
}

impl DecoderBuffer {
    /// The buffers picked at random when nothing forces a specific one.
    pub(crate) const RANDOM: [Self; 4] = [Self::B484, Self::B7333, Self::B3733, Self::B493];

    pub(crate) const fn slots(self) -> &'static [SlotLen] {
        match self {
            Self::B484 => &[SlotLen::L4, SlotLen::L8, SlotLen::L4],
            Self::B7333 => &[SlotLen::L7, SlotLen::L3, SlotLen::L3, SlotLen::L3],
            Self::B3733 => &[SlotLen::L3, SlotLen::L7, SlotLen::L3, SlotLen::L3],
            Self::B493 => &[SlotLen::L4, SlotLen::L9, SlotLen::L3],
            Self::B4444 => &[SlotLen::L4, SlotLen::L4, SlotLen::L4, SlotLen::L4],
            Self::B3310 => &[SlotLen::L3, SlotLen::L3, SlotLen::L10],
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum ExecutionPort {
    P0,
    P1,
    P5,
}

#[derive(Debug, Copy, Clone)]
enum AllowedPorts {
    One(ExecutionPort),
    Two(ExecutionPort, ExecutionPort),
    All,
}

impl AllowedPorts {
    fn port_allowed(self, port: ExecutionPort) -> bool {
        match self {
            Self::One(allowed_port) => allowed_port == port,
            Self::Two(allowed_port_1, allowed_port_2) => {
                allowed_port_1 == port || allowed_port_2 == port
            }
            Self::All => true,
        }
    }
}

/// An x86 macro op, superscalar instructions are made of 1 to 3 of these.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[expect(non_camel_case_types)]
pub(crate) enum MacroOp {
    SUB_RR,
    XOR_RR,
    LEA_SIB,
    IMUL_RR { dependant: bool },
    ROR_RI,
    ADD_RI,
    XOR_RI,
    MOV_RR,
    MUL_R,
    IMUL_R,
    MOV_RI,
}

impl MacroOp {
    pub(crate) const fn cycles_to_complete(self) -> usize {
        match self {
            Self::SUB_RR
            | Self::XOR_RR
            | Self::LEA_SIB
            | Self::ROR_RI
            | Self::ADD_RI
            | Self::XOR_RI
            | Self::MOV_RI => 1,
            Self::IMUL_RR { .. } => 3,
            Self::MOV_RR => 0,
            Self::MUL_R | Self::IMUL_R => 4,
        }
    }

    /// Register to register moves are eliminated by the renamer and never reach a port.
    const fn can_be_eliminated(self) -> bool {
        self.micro_ops_needed() == 0
    }

    const fn is_dependant_on_last_op(self) -> bool {
        matches!(self, Self::IMUL_RR { dependant: true })
    }

    const fn micro_ops_needed(self) -> usize {
        match self {
            Self::MOV_RR => 0,
            Self::MUL_R | Self::IMUL_R => 2,
            _ => 1,
        }
    }

    fn allowed_execution_ports(self, micro_op_index: usize) -> AllowedPorts {
        match self {
            Self::SUB_RR | Self::XOR_RR | Self::ADD_RI | Self::XOR_RI | Self::MOV_RI => {
                AllowedPorts::All
            }
            Self::LEA_SIB => AllowedPorts::Two(ExecutionPort::P0, ExecutionPort::P1),
            Self::IMUL_RR { .. } => AllowedPorts::One(ExecutionPort::P1),
            Self::ROR_RI => AllowedPorts::Two(ExecutionPort::P0, ExecutionPort::P5),
            Self::MUL_R | Self::IMUL_R => match micro_op_index {
                0 => AllowedPorts::One(ExecutionPort::P1),
                _ => AllowedPorts::One(ExecutionPort::P5),
            },
            Self::MOV_RR => unreachable!("MOV_RR needs no execution port"),
        }
    }
}

/// Represents the ports availability during a single cycle.
#[derive(Debug, Default, Copy, Clone)]
struct CycleSchedule {
    p0: bool,
    p1: bool,
    p5: bool,
}

impl CycleSchedule {
    /// Ports are tried in the order P5, P0, P1 so instructions that can go anywhere don't take
    /// the multiplication port.
    fn space_for_micro_op(&self, allowed_ports: AllowedPorts) -> Option<ExecutionPort> {
        if !self.p5 && allowed_ports.port_allowed(ExecutionPort::P5) {
            Some(ExecutionPort::P5)
        } else if !self.p0 && allowed_ports.port_allowed(ExecutionPort::P0) {
            Some(ExecutionPort::P0)
        } else if !self.p1 && allowed_ports.port_allowed(ExecutionPort::P1) {
            Some(ExecutionPort::P1)
        } else {
            None
        }
    }

    fn set_port_busy(&mut self, port: ExecutionPort) {
        match port {
            ExecutionPort::P0 => self.p0 = true,
            ExecutionPort::P1 => self.p1 = true,
            ExecutionPort::P5 => self.p5 = true,
        }
    }
}

struct MacroOpOpportunity {
    cycle: usize,
    micro_port_0: Option<ExecutionPort>,
    micro_port_1: Option<ExecutionPort>,
}

/// The port usage of every cycle of a program being generated.
#[derive(Debug)]
pub(crate) struct ProgramSchedule {
    ports_schedule: Vec<CycleSchedule>,
}

impl ProgramSchedule {
    /// Creates an empty schedule for a program targeting `latency` cycles.
    pub(crate) fn new(latency: usize) -> Self {
        Self {
            ports_schedule: vec![CycleSchedule::default(); latency + CYCLE_MAP_EXTRA],
        }
    }

    /// Schedules `op` at the earliest cycle at or after `cycle` with free ports.
    ///
    /// Returns [`None`] if the schedule has no room left for this op.
    pub(crate) fn schedule_macro_op_at_earliest(
        &mut self,
        op: MacroOp,
        cycle: usize,
        last_op_completes_at: usize,
    ) -> Option<usize> {
        let opportunity = self.earliest_cycle_for_macro_op_inner(op, cycle, last_op_completes_at)?;
        let cycle = opportunity.cycle;
        if let Some(port0) = opportunity.micro_port_0 {
            self.schedule_micro_op(cycle, port0);
            if let Some(port1) = opportunity.micro_port_1 {
                self.schedule_micro_op(cycle, port1);
            };
        };

        Some(cycle)
    }

    /// Returns the cycle [`Self::schedule_macro_op_at_earliest`] would pick, without scheduling.
    pub(crate) fn earliest_cycle_for_macro_op(
        &self,
        op: MacroOp,
        cycle: usize,
        last_op_completes_at: usize,
    ) -> Option<usize> {
        self.earliest_cycle_for_macro_op_inner(op, cycle, last_op_completes_at)
            .map(|opportunity| opportunity.cycle)
    }

    fn earliest_cycle_for_macro_op_inner(
        &self,
        op: MacroOp,
        cycle: usize,
        last_op_completes_at: usize,
    ) -> Option<MacroOpOpportunity> {
        let mut cycle = if op.is_dependant_on_last_op() {
            cycle.max(last_op_completes_at)
        } else {
            cycle
        };

        if op.can_be_eliminated() {
            return Some(MacroOpOpportunity {
                cycle,
                micro_port_0: None,
                micro_port_1: None,
            });
        }

        if op.micro_ops_needed() == 1 {
            return self
                .earliest_cycle_for_micro_op(op.allowed_execution_ports(0), cycle)
                .map(|(cycle, micro_port_0)| MacroOpOpportunity {
                    cycle,
                    micro_port_0: Some(micro_port_0),
                    micro_port_1: None,
                });
        }

        // both micro ops must happen in the same cycle
        let allowed_0 = op.allowed_execution_ports(0);
        let allowed_1 = op.allowed_execution_ports(1);

        while cycle < self.ports_schedule.len() {
            let (min_0_cycle, port_0) = self.earliest_cycle_for_micro_op(allowed_0, cycle)?;
            let (min_1_cycle, port_1) = self.earliest_cycle_for_micro_op(allowed_1, cycle)?;

            if min_0_cycle == min_1_cycle {
                return Some(MacroOpOpportunity {
                    cycle: min_0_cycle,
                    micro_port_0: Some(port_0),
                    micro_port_1: Some(port_1),
                });
            }
            cycle += 1;
        }
        None
    }

    fn schedule_micro_op(&mut self, cycle: usize, port: ExecutionPort) {
        self.ports_schedule[cycle].set_port_busy(port);
    }

    fn earliest_cycle_for_micro_op(
        &self,
        allowed_ports: AllowedPorts,
        cycle: usize,
    ) -> Option<(usize, ExecutionPort)> {
        self.ports_schedule
            .iter()
            .enumerate()
            .skip(cycle)
            .find_map(|(cycle, schedule)| {
                schedule
                    .space_for_micro_op(allowed_ports)
                    .map(|port| (cycle, port))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ports_fill_in_order() {
        let mut schedule = ProgramSchedule::new(4);

        // 3 single port ops fit in cycle 0, the 4th spills to cycle 1.
        for _ in 0..3 {
            assert_eq!(
                schedule.schedule_macro_op_at_earliest(MacroOp::ADD_RI, 0, 0),
                Some(0)
            );
        }
        assert_eq!(
            schedule.schedule_macro_op_at_earliest(MacroOp::ADD_RI, 0, 0),
            Some(1)
        );
    }

    #[test]
    fn multiplications_share_p1() {
        let mut schedule = ProgramSchedule::new(4);

        assert_eq!(
            schedule.schedule_macro_op_at_earliest(MacroOp::IMUL_RR { dependant: false }, 0, 0),
            Some(0)
        );
        // MUL_R needs P1 and P5 in the same cycle, P1 is taken in cycle 0.
        assert_eq!(
            schedule.earliest_cycle_for_macro_op(MacroOp::MUL_R, 0, 0),
            Some(1)
        );
    }

    #[test]
    fn dependant_op_waits() {
        let schedule = ProgramSchedule::new(8);

        assert_eq!(
            schedule.earliest_cycle_for_macro_op(MacroOp::IMUL_RR { dependant: true }, 1, 5),
            Some(5)
        );
        assert_eq!(
            schedule.earliest_cycle_for_macro_op(MacroOp::MOV_RR, 3, 0),
            Some(3)
        );
    }

    #[test]
    fn full_schedule() {
        let mut schedule = ProgramSchedule::new(0);

        for _ in 0..CYCLE_MAP_EXTRA {
            assert!(schedule
                .schedule_macro_op_at_earliest(MacroOp::IMUL_RR { dependant: false }, 0, 0)
                .is_some());
        }
        assert_eq!(
            schedule.schedule_macro_op_at_earliest(MacroOp::IMUL_RR { dependant: false }, 0, 0),
            None
        );
    }
}
