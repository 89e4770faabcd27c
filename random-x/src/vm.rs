//! The RandomX virtual machine.
//!
//! A VM owns a scratchpad and a register file and borrows either a [`Cache`] (light mode) or a
//! [`Dataset`] (fast mode). One VM computes one hash at a time, use one VM per thread.

use blake2::digest::consts::U32;
use blake2::{Blake2b, Blake2b512, Digest};
use tracing::{debug, instrument};

use crate::aes_hash::{aes_fill_1r, hash_aes_1r};
use crate::config::RandomXConfig;
#[cfg(feature = "jit")]
use crate::flags::Dispatch;
use crate::flags::{Mode, RandomXFlags, VmOptions};
use crate::float::RoundingMode;
use crate::program::{mask_e_register, OpcodeTable, Program, ProgramConfiguration};
use crate::{Cache, Dataset, RandomXError};

mod bytecode;
#[cfg(feature = "jit")]
mod compiler;
mod interpreter;
mod register_file;
mod scratchpad;

use bytecode::{ByteCode, Machine};
use register_file::RegisterFile;
use scratchpad::Scratchpad;

/// Where a [`RandomXVm`] is in computing a hash.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum VmState {
    /// No hash has been started since the VM was created or rebound.
    Uninitialized,
    /// The scratchpad is filled for the next hash.
    ScratchpadLoaded,
    /// Programs are running.
    Executing,
    /// The last hash is complete.
    Finalized,
}

/// Where dataset items come from.
#[derive(Debug)]
enum Memory {
    Light(Cache),
    Fast(Dataset),
}

/// A program ready to run.
#[derive(Debug)]
enum Executable {
    Interpreted(Vec<ByteCode>),
    #[cfg(feature = "jit")]
    Compiled(compiler::CompiledProgram),
}

impl Executable {
    fn execute(&self, m: &mut Machine<'_>) {
        match self {
            Self::Interpreted(code) => interpreter::execute(code, m),
            #[cfg(feature = "jit")]
            Self::Compiled(program) => program.execute(m),
        }
    }
}

/// A RandomX virtual machine.
#[derive(Debug)]
pub struct RandomXVm {
    options: VmOptions,
    config: RandomXConfig,
    opcodes: OpcodeTable,
    memory: Memory,

    scratchpad: Scratchpad,
    reg: RegisterFile,
    rounding: RoundingMode,
    /// The seed of the next program, or between hashes the scratchpad generator state.
    temp_hash: [u8; 64],

    state: VmState,
}

impl RandomXVm {
    /// Creates a VM.
    ///
    /// With [`RandomXFlags::FULL_MEM`] the VM runs in fast mode and needs `dataset`, otherwise
    /// it runs in light mode and needs a seeded `cache`. The unneeded argument is ignored.
    ///
    /// # Errors
    ///
    /// Returns [`RandomXError::NotInitialized`] if the needed memory is missing or unseeded,
    /// [`RandomXError::InvalidConfig`] if `cache` and `dataset` were built with different configs
    /// and [`RandomXError::Allocation`] if the scratchpad could not be allocated.
    #[instrument(skip(cache, dataset), level = "debug")]
    pub fn new(
        flags: RandomXFlags,
        cache: Option<Cache>,
        dataset: Option<Dataset>,
    ) -> Result<Self, RandomXError> {
        let options = VmOptions::from_flags(flags);

        if let (Some(cache), Some(dataset)) = (&cache, &dataset) {
            if cache.config() != dataset.config() {
                return Err(RandomXError::InvalidConfig(
                    "the cache and dataset have different configs",
                ));
            }
        }

        let memory = match options.mode {
            Mode::Light => {
                let cache = cache.ok_or(RandomXError::NotInitialized("cache"))?;
                if !cache.is_initialized() {
                    return Err(RandomXError::NotInitialized("cache"));
                }
                Memory::Light(cache)
            }
            Mode::Fast => Memory::Fast(dataset.ok_or(RandomXError::NotInitialized("dataset"))?),
        };

        let config = match &memory {
            Memory::Light(cache) => *cache.config(),
            Memory::Fast(dataset) => *dataset.config(),
        };

        debug!(?options, "Creating VM");

        Ok(Self {
            options,
            config,
            opcodes: OpcodeTable::new(&config),
            memory,
            scratchpad: Scratchpad::alloc(config.scratchpad_l3)?,
            reg: RegisterFile::default(),
            rounding: RoundingMode::Nearest,
            temp_hash: [0; 64],
            state: VmState::Uninitialized,
        })
    }

    /// How this VM was configured.
    pub const fn options(&self) -> VmOptions {
        self.options
    }

    /// The parameters of the cache or dataset this VM hashes with.
    pub const fn config(&self) -> &RandomXConfig {
        &self.config
    }

    /// Where this VM is in hashing its current input.
    pub const fn state(&self) -> VmState {
        self.state
    }

    /// Replaces the cache of a light mode VM, a fast mode VM ignores it.
    ///
    /// Any hash started with [`RandomXVm::calculate_hash_first`] is discarded unless `cache` is
    /// the cache already in use.
    ///
    /// # Errors
    ///
    /// Returns [`RandomXError::NotInitialized`] if `cache` is unseeded and
    /// [`RandomXError::InvalidConfig`] if it has a different config than this VM.
    pub fn set_cache(&mut self, cache: Cache) -> Result<(), RandomXError> {
        if !cache.is_initialized() {
            return Err(RandomXError::NotInitialized("cache"));
        }
        if *cache.config() != self.config {
            return Err(RandomXError::InvalidConfig(
                "the cache has a different config than the VM",
            ));
        }

        match &mut self.memory {
            Memory::Light(current) => {
                if !current.ptr_eq(&cache) {
                    *current = cache;
                    self.state = VmState::Uninitialized;
                }
            }
            Memory::Fast(_) => debug!("Ignoring a cache given to a fast mode VM."),
        }

        Ok(())
    }

    /// Replaces the dataset of a fast mode VM, a light mode VM ignores it.
    ///
    /// Any hash started with [`RandomXVm::calculate_hash_first`] is discarded unless `dataset`
    /// is the dataset already in use.
    ///
    /// # Errors
    ///
    /// Returns [`RandomXError::InvalidConfig`] if `dataset` has a different config than this VM.
    pub fn set_dataset(&mut self, dataset: Dataset) -> Result<(), RandomXError> {
        if *dataset.config() != self.config {
            return Err(RandomXError::InvalidConfig(
                "the dataset has a different config than the VM",
            ));
        }

        match &mut self.memory {
            Memory::Fast(current) => {
                if !current.ptr_eq(&dataset) {
                    *current = dataset;
                    self.state = VmState::Uninitialized;
                }
            }
            Memory::Light(_) => debug!("Ignoring a dataset given to a light mode VM."),
        }

        Ok(())
    }

    /// Calculates the RandomX hash of `input`.
    ///
    /// A hash in flight from [`RandomXVm::calculate_hash_first`] is discarded.
    pub fn calculate_hash(&mut self, input: &[u8]) -> [u8; 32] {
        self.load_scratchpad(input);
        self.run_chains();
        self.finalize()
    }

    /// Starts hashing `input`, the digest is returned by the next call to
    /// [`RandomXVm::calculate_hash_next`] or [`RandomXVm::calculate_hash_last`].
    ///
    /// A hash already in flight is discarded.
    pub fn calculate_hash_first(&mut self, input: &[u8]) {
        self.load_scratchpad(input);
    }

    /// Finishes the hash in flight and starts hashing `next_input`.
    ///
    /// The scratchpad is filled for `next_input` while the current hash is finalized, which
    /// saves a pass over it compared to [`RandomXVm::calculate_hash`].
    ///
    /// # Errors
    ///
    /// Returns [`RandomXError::NotInitialized`] if no hash is in flight.
    pub fn calculate_hash_next(&mut self, next_input: &[u8]) -> Result<[u8; 32], RandomXError> {
        self.check_in_flight()?;
        self.run_chains();

        let next_seed = blake2b_512(next_input);
        let digest = self.finalize();

        self.temp_hash = next_seed;
        aes_fill_1r(&mut self.temp_hash, self.scratchpad.as_bytes_mut());
        self.state = VmState::ScratchpadLoaded;

        Ok(digest)
    }

    /// Finishes the hash in flight.
    ///
    /// # Errors
    ///
    /// Returns [`RandomXError::NotInitialized`] if no hash is in flight.
    pub fn calculate_hash_last(&mut self) -> Result<[u8; 32], RandomXError> {
        self.check_in_flight()?;
        self.run_chains();
        Ok(self.finalize())
    }

    fn check_in_flight(&self) -> Result<(), RandomXError> {
        if self.state != VmState::ScratchpadLoaded {
            return Err(RandomXError::NotInitialized("no hash is in flight"));
        }
        Ok(())
    }

    fn load_scratchpad(&mut self, input: &[u8]) {
        self.temp_hash = blake2b_512(input);
        aes_fill_1r(&mut self.temp_hash, self.scratchpad.as_bytes_mut());
        self.state = VmState::ScratchpadLoaded;
    }

    /// Runs the program chain, each program seeded from the registers the last one left.
    fn run_chains(&mut self) {
        self.state = VmState::Executing;
        self.rounding = RoundingMode::Nearest;

        for chain in 0..self.config.program_count {
            self.run_program();

            if chain + 1 < self.config.program_count {
                self.temp_hash = blake2b_512(&self.reg.to_bytes());
            }
        }
    }

    fn finalize(&mut self) -> [u8; 32] {
        let fingerprint = hash_aes_1r(self.scratchpad.as_bytes());
        let digest = Blake2b::<U32>::digest(self.reg.to_bytes_with_a(&fingerprint));

        self.state = VmState::Finalized;

        let mut out = [0; 32];
        out.copy_from_slice(&digest);
        out
    }

    fn run_program(&mut self) {
        let program = Program::generate(&self.temp_hash, &self.config, &self.opcodes);
        let conf = ProgramConfiguration::new(&program.entropy, &self.config);
        let executable = self.prepare(bytecode::compile(&program, &self.config));

        self.reg = RegisterFile {
            a: conf.a,
            ..RegisterFile::default()
        };

        self.execute(&executable, &conf);
    }

    fn prepare(&self, code: Vec<ByteCode>) -> Executable {
        #[cfg(feature = "jit")]
        if self.options.dispatch == Dispatch::Compiled {
            return Executable::Compiled(compiler::compile(&code));
        }

        Executable::Interpreted(code)
    }

    fn execute(&mut self, executable: &Executable, conf: &ProgramConfiguration) {
        let l3_mask = self.config.scratchpad_l3_mask64();
        let align_mask = self.config.cache_line_align_mask();
        let [read_0, read_1, read_2, read_3] = conf.read_regs;

        let (mut mx, mut ma) = (conf.mx, conf.ma);
        let (mut sp_addr_0, mut sp_addr_1) = (mx, ma);

        for _ in 0..self.config.program_iterations {
            let sp_mix = self.reg.r.get(read_0) ^ self.reg.r.get(read_1);
            #[expect(clippy::cast_possible_truncation, reason = "splitting into 2 halves")]
            let (mix_lo, mix_hi) = (sp_mix as u32, (sp_mix >> 32) as u32);
            sp_addr_0 = (sp_addr_0 ^ mix_lo) & l3_mask;
            sp_addr_1 = (sp_addr_1 ^ mix_hi) & l3_mask;
            let (addr_0, addr_1) = (sp_addr_0 as usize, sp_addr_1 as usize);

            let mut words = [0; 8];
            for (i, word) in words.iter_mut().enumerate() {
                *word = self.scratchpad.load64(addr_0 + 8 * i);
            }
            self.reg.r.xor_all(&words);

            for i in 0..4 {
                self.reg.f[i] = self.scratchpad.load_f64x2(addr_1 + 8 * i);
                self.reg.e[i] = mask_e_register(
                    self.scratchpad.load_f64x2(addr_1 + 8 * (4 + i)),
                    conf.e_mask,
                );
            }

            executable.execute(&mut Machine {
                reg: &mut self.reg,
                scratchpad: &mut self.scratchpad,
                rounding: &mut self.rounding,
                e_mask: conf.e_mask,
            });

            #[expect(clippy::cast_possible_truncation, reason = "mx is 32 bits")]
            let mix = (self.reg.r.get(read_2) ^ self.reg.r.get(read_3)) as u32;
            mx = (mx ^ mix) & align_mask;

            let item = self.dataset_item((conf.dataset_offset + u64::from(ma)) / 64);
            self.reg.r.xor_all(&item);

            std::mem::swap(&mut mx, &mut ma);

            for (i, word) in self.reg.r.inner().into_iter().enumerate() {
                self.scratchpad.store64(addr_1 + 8 * i, word);
            }
            for i in 0..4 {
                let [f0, f1] = self.reg.f[i];
                let [e0, e1] = self.reg.e[i];
                self.reg.f[i] = [
                    f64::from_bits(f0.to_bits() ^ e0.to_bits()),
                    f64::from_bits(f1.to_bits() ^ e1.to_bits()),
                ];
                self.scratchpad.store_f64x2(addr_0 + 16 * i, self.reg.f[i]);
            }

            sp_addr_0 = 0;
            sp_addr_1 = 0;
        }
    }

    fn dataset_item(&self, item_number: u64) -> [u64; 8] {
        match &self.memory {
            Memory::Light(cache) => cache.internal().init_data_set_item(item_number),
            Memory::Fast(dataset) => *dataset.get(item_number),
        }
    }
}

impl Drop for RandomXVm {
    fn drop(&mut self) {
        if self.options.secure {
            self.scratchpad.wipe();
            self.reg = RegisterFile::default();
            self.temp_hash.fill(0);
            std::hint::black_box(&mut self.temp_hash);
        }
    }
}

fn blake2b_512(input: &[u8]) -> [u8; 64] {
    let mut out = [0; 64];
    out.copy_from_slice(&Blake2b512::digest(input));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{test_cache, test_config, test_dataset};

    fn light_vm(flags: RandomXFlags) -> RandomXVm {
        RandomXVm::new(flags, Some(test_cache()), None).unwrap()
    }

    #[test]
    fn hashes_are_deterministic() {
        let mut vm = light_vm(RandomXFlags::DEFAULT);

        let a = vm.calculate_hash(b"This is a test");
        let b = vm.calculate_hash(b"This is a test");
        let c = vm.calculate_hash(b"This is a tesu");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(vm.state(), VmState::Finalized);
    }

    #[test]
    fn dispatch_does_not_change_the_hash() {
        let mut interpreted = light_vm(RandomXFlags::DEFAULT);
        let mut compiled = light_vm(RandomXFlags::JIT);

        let inputs: [&[u8]; 4] = [b"", b"a", b"This is a test", &[0xFF; 200]];
        for input in inputs {
            assert_eq!(
                interpreted.calculate_hash(input),
                compiled.calculate_hash(input)
            );
        }
    }

    #[test]
    fn light_and_fast_modes_agree() {
        let mut light = light_vm(RandomXFlags::DEFAULT);
        let mut fast = RandomXVm::new(
            RandomXFlags::FULL_MEM | RandomXFlags::JIT,
            None,
            Some(test_dataset()),
        )
        .unwrap();

        assert_eq!(fast.options().mode, Mode::Fast);
        let inputs: [&[u8]; 2] = [b"Lorem ipsum dolor sit amet", b"This is a test"];
        for input in inputs {
            assert_eq!(light.calculate_hash(input), fast.calculate_hash(input));
        }
    }

    #[test]
    fn pipelined_hashes_match() {
        let inputs: [&[u8]; 3] = [b"first", b"second", b"third"];
        let mut vm = light_vm(RandomXFlags::DEFAULT);
        let expected = inputs.map(|input| vm.calculate_hash(input));

        vm.calculate_hash_first(inputs[0]);
        assert_eq!(vm.state(), VmState::ScratchpadLoaded);
        assert_eq!(vm.calculate_hash_next(inputs[1]).unwrap(), expected[0]);
        assert_eq!(vm.calculate_hash_next(inputs[2]).unwrap(), expected[1]);
        assert_eq!(vm.calculate_hash_last().unwrap(), expected[2]);
        assert_eq!(vm.state(), VmState::Finalized);
    }

    #[test]
    fn next_without_first_fails() {
        let mut vm = light_vm(RandomXFlags::DEFAULT);
        assert_eq!(vm.state(), VmState::Uninitialized);

        assert!(matches!(
            vm.calculate_hash_next(b"x"),
            Err(RandomXError::NotInitialized(_))
        ));
        assert!(matches!(
            vm.calculate_hash_last(),
            Err(RandomXError::NotInitialized(_))
        ));

        vm.calculate_hash_first(b"x");
        vm.calculate_hash_last().unwrap();
        assert!(vm.calculate_hash_last().is_err());
    }

    #[test]
    fn missing_memory() {
        assert!(matches!(
            RandomXVm::new(RandomXFlags::DEFAULT, None, None),
            Err(RandomXError::NotInitialized("cache"))
        ));
        assert!(matches!(
            RandomXVm::new(RandomXFlags::FULL_MEM, Some(test_cache()), None),
            Err(RandomXError::NotInitialized("dataset"))
        ));
        assert!(matches!(
            RandomXVm::new(
                RandomXFlags::DEFAULT,
                Some(Cache::alloc(test_config()).unwrap()),
                None
            ),
            Err(RandomXError::NotInitialized("cache"))
        ));
    }

    #[test]
    fn rebinding_the_cache() {
        let mut vm = light_vm(RandomXFlags::DEFAULT);
        let other_cache = Cache::new(test_config(), b"test key 001").unwrap();
        let mut other_vm = RandomXVm::new(RandomXFlags::DEFAULT, Some(other_cache.clone()), None)
            .unwrap();

        let before = vm.calculate_hash(b"input");

        // the same cache keeps a hash in flight
        vm.calculate_hash_first(b"input");
        vm.set_cache(test_cache()).unwrap();
        assert_eq!(vm.state(), VmState::ScratchpadLoaded);
        assert_eq!(vm.calculate_hash_last().unwrap(), before);

        vm.calculate_hash_first(b"input");
        vm.set_cache(other_cache).unwrap();
        assert_eq!(vm.state(), VmState::Uninitialized);

        let after = vm.calculate_hash(b"input");
        assert_ne!(before, after);
        assert_eq!(after, other_vm.calculate_hash(b"input"));
    }

    #[test]
    fn rebinding_the_dataset() {
        let other_cache = Cache::new(test_config(), b"test key 001").unwrap();
        let other_dataset = Dataset::new(&other_cache, 2).unwrap();
        assert_eq!(other_dataset.memory_size(), 1087 * 64);

        let mut vm = RandomXVm::new(RandomXFlags::FULL_MEM, None, Some(test_dataset())).unwrap();
        let mut light = RandomXVm::new(RandomXFlags::DEFAULT, Some(other_cache), None).unwrap();

        let before = vm.calculate_hash(b"input");
        vm.set_dataset(other_dataset).unwrap();
        let after = vm.calculate_hash(b"input");
        assert_ne!(before, after);
        assert_eq!(after, light.calculate_hash(b"input"));

        // light mode VMs have no use for a dataset
        light.set_dataset(test_dataset()).unwrap();
        assert_eq!(light.calculate_hash(b"input"), after);
    }

    #[test]
    fn mismatched_configs_are_rejected() {
        let mut config = test_config();
        config.program_iterations += 1;
        let cache = Cache::new(config, b"test key 000").unwrap();

        let mut vm = light_vm(RandomXFlags::DEFAULT);
        assert!(matches!(
            vm.set_cache(cache.clone()),
            Err(RandomXError::InvalidConfig(_))
        ));
        assert!(matches!(
            RandomXVm::new(RandomXFlags::FULL_MEM, Some(cache), Some(test_dataset())),
            Err(RandomXError::InvalidConfig(_))
        ));
    }

    #[test]
    fn secure_vms_hash_the_same() {
        let mut vm = light_vm(RandomXFlags::SECURE | RandomXFlags::HARD_AES);
        let mut plain = light_vm(RandomXFlags::DEFAULT);

        assert!(vm.options().secure);
        assert_eq!(vm.calculate_hash(b"secret"), plain.calculate_hash(b"secret"));
    }
}
