use crate::registers::RGroupRegisters;

/// Size of a serialized [`RegisterFile`].
pub(crate) const REGISTER_FILE_SIZE: usize = 256;

/// The VM registers: 8 integer registers and 3 groups of 4 float registers, each holding 2
/// lanes.
#[derive(Debug, Default, Clone, PartialEq)]
pub(crate) struct RegisterFile {
    pub(crate) r: RGroupRegisters,
    pub(crate) f: [[f64; 2]; 4],
    pub(crate) e: [[f64; 2]; 4],
    pub(crate) a: [[f64; 2]; 4],
}

impl RegisterFile {
    /// Serializes the registers, little endian, in the order `r`, `f`, `e`, `a`.
    pub(crate) fn to_bytes(&self) -> [u8; REGISTER_FILE_SIZE] {
        let mut a = [0; 64];
        write_floats(&mut a, &self.a);
        self.to_bytes_with_a(&a)
    }

    /// Serializes the registers with `a` replaced by raw bytes.
    pub(crate) fn to_bytes_with_a(&self, a: &[u8; 64]) -> [u8; REGISTER_FILE_SIZE] {
        let mut bytes = [0; REGISTER_FILE_SIZE];

        for (chunk, reg) in bytes[..64].chunks_exact_mut(8).zip(self.r.inner()) {
            chunk.copy_from_slice(&reg.to_le_bytes());
        }
        write_floats(&mut bytes[64..128], &self.f);
        write_floats(&mut bytes[128..192], &self.e);
        bytes[192..].copy_from_slice(a);

        bytes
    }
}

fn write_floats(out: &mut [u8], regs: &[[f64; 2]; 4]) {
    for (chunk, lane) in out.chunks_exact_mut(8).zip(regs.iter().flatten()) {
        chunk.copy_from_slice(&lane.to_bits().to_le_bytes());
    }
}
