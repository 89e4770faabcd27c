use crate::{try_alloc, RandomXError};

/// The VM's working memory.
///
/// Every address passed in must already be masked to the scratchpad size and aligned to the
/// access width.
#[derive(Debug)]
pub(crate) struct Scratchpad(Vec<u8>);

impl Scratchpad {
    pub(crate) fn alloc(size: usize) -> Result<Self, RandomXError> {
        try_alloc("scratchpad", size, 0).map(Self)
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub(crate) fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }

    pub(crate) fn load64(&self, addr: usize) -> u64 {
        let mut bytes = [0; 8];
        bytes.copy_from_slice(&self.0[addr..addr + 8]);
        u64::from_le_bytes(bytes)
    }

    /// Loads 2 signed 32 bit integers as the 2 lanes of a float register.
    pub(crate) fn load_f64x2(&self, addr: usize) -> [f64; 2] {
        let word = self.load64(addr);
        #[expect(
            clippy::cast_possible_truncation,
            clippy::cast_possible_wrap,
            reason = "the halves are reinterpreted as signed"
        )]
        let (lo, hi) = (word as u32 as i32, (word >> 32) as u32 as i32);
        [f64::from(lo), f64::from(hi)]
    }

    pub(crate) fn store64(&mut self, addr: usize, value: u64) {
        self.0[addr..addr + 8].copy_from_slice(&value.to_le_bytes());
    }

    pub(crate) fn store_f64x2(&mut self, addr: usize, value: [f64; 2]) {
        self.store64(addr, value[0].to_bits());
        self.store64(addr + 8, value[1].to_bits());
    }

    /// Overwrites the whole scratchpad with zeros.
    pub(crate) fn wipe(&mut self) {
        self.0.fill(0);
        std::hint::black_box(&mut self.0);
    }
}
