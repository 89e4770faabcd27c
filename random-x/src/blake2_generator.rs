use blake2::digest::FixedOutputReset;
use blake2::{Blake2b512, Digest};

/// Only the first 60 bytes of a seed are used, the last 4 bytes of the state hold the nonce.
const MAX_SEED_LEN: usize = 60;

/// A pseudo-random byte stream made by repeatedly hashing a 64 byte state with Blake2b.
///
/// https://github.com/tevador/RandomX/blob/master/doc/specs.md#33-blake2generator
pub(crate) struct Blake2Generator {
    data: [u8; 64],
    index: usize,
    hasher: Blake2b512,
}

impl Blake2Generator {
    /// Creates a new generator, seeds longer than 60 bytes are truncated.
    pub(crate) fn new(seed: &[u8], nonce: u32) -> Self {
        let seed = &seed[..seed.len().min(MAX_SEED_LEN)];

        let mut data = [0; 64];
        data[..seed.len()].copy_from_slice(seed);

        data[MAX_SEED_LEN..].copy_from_slice(&nonce.to_le_bytes());

        Self {
            data,
            index: 64,
            hasher: Blake2b512::default(),
        }
    }

    pub(crate) fn next_u8(&mut self) -> u8 {
        self.check_extend(1);
        self.index += 1;
        self.data[self.index - 1]
    }

    pub(crate) fn next_u32(&mut self) -> u32 {
        self.check_extend(4);
        self.index += 4;

        let mut bytes = [0; 4];
        bytes.copy_from_slice(&self.data[self.index - 4..self.index]);
        u32::from_le_bytes(bytes)
    }

    fn check_extend(&mut self, bytes_needed: usize) {
        if self.index + bytes_needed > self.data.len() {
            Digest::update(&mut self.hasher, self.data);
            let hash = self.hasher.finalize_fixed_reset();
            self.data.copy_from_slice(&hash);
            self.index = 0;
        }
    }
}
