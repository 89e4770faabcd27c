/// The 8 integer registers, `r0` to `r7`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub(crate) enum RGroupRegisterID {
    R0,
    R1,
    R2,
    R3,
    R4,
    R5,
    R6,
    R7,
}

impl RGroupRegisterID {
    const ALL: [Self; 8] = [
        Self::R0,
        Self::R1,
        Self::R2,
        Self::R3,
        Self::R4,
        Self::R5,
        Self::R6,
        Self::R7,
    ];

    pub(crate) fn iter() -> impl Iterator<Item = Self> {
        Self::ALL.into_iter()
    }

    /// Selects a register from the low 3 bits of `x`.
    pub(crate) const fn from_u8(x: u8) -> Self {
        Self::ALL[(x % 8) as usize]
    }

    pub(crate) const fn index(self) -> usize {
        self as usize
    }
}

/// The values of the 8 integer registers.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub(crate) struct RGroupRegisters([u64; 8]);

impl RGroupRegisters {
    pub(crate) const fn new(values: [u64; 8]) -> Self {
        Self(values)
    }

    pub(crate) const fn get(&self, id: RGroupRegisterID) -> u64 {
        self.0[id.index()]
    }

    pub(crate) fn set(&mut self, id: RGroupRegisterID, val: u64) {
        self.0[id.index()] = val;
    }

    pub(crate) fn apply_to_dst(&mut self, dst: RGroupRegisterID, f: impl FnOnce(u64) -> u64) {
        self.set(dst, f(self.get(dst)));
    }

    pub(crate) fn apply_to_dst_with_src(
        &mut self,
        dst: RGroupRegisterID,
        src: RGroupRegisterID,
        f: impl FnOnce(u64, u64) -> u64,
    ) {
        self.set(dst, f(self.get(dst), self.get(src)));
    }

    /// Swaps the values of 2 registers.
    pub(crate) fn swap(&mut self, a: RGroupRegisterID, b: RGroupRegisterID) {
        self.0.swap(a.index(), b.index());
    }

    /// XORs every register with the matching word of `words`.
    pub(crate) fn xor_all(&mut self, words: &[u64; 8]) {
        for (reg, word) in self.0.iter_mut().zip(words) {
            *reg ^= word;
        }
    }

    pub(crate) const fn inner(&self) -> [u64; 8] {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_u8_wraps() {
        assert_eq!(RGroupRegisterID::from_u8(13), RGroupRegisterID::R5);
        assert_eq!(RGroupRegisterID::from_u8(255), RGroupRegisterID::R7);
    }

    #[test]
    fn apply_to_dst_with_same_src() {
        let mut regs = RGroupRegisters::new([0, 1, 2, 3, 4, 5, 6, 7]);
        regs.apply_to_dst_with_src(RGroupRegisterID::R3, RGroupRegisterID::R3, |dst, src| {
            dst * src
        });
        regs.swap(RGroupRegisterID::R0, RGroupRegisterID::R7);

        assert_eq!(regs.inner(), [7, 1, 2, 9, 4, 5, 6, 0]);
    }
}
