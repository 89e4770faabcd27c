use std::sync::Arc;

use argon2::{Algorithm, Argon2, Block, Params, Version};
use tracing::{debug, instrument};

use crate::blake2_generator::Blake2Generator;
use crate::{
    config::{RandomXConfig, ARGON_BLOCK_SIZE, CACHE_LINE_SIZE},
    registers::RGroupRegisters,
    superscalar::SSProgram,
    try_alloc, RandomXError,
};

/// The 64 bit words in one cache line.
const LINE_WORDS: usize = CACHE_LINE_SIZE / 8;

/// Cache lines in one Argon2 block.
const LINES_PER_BLOCK: usize = ARGON_BLOCK_SIZE / CACHE_LINE_SIZE;

/// The multiplier used to spread item numbers into `r0`.
const ITEM_MULTIPLIER: u64 = 6_364_136_223_846_793_005;

/// The constants `r1` to `r7` are derived from `r0` with.
const ITEM_XOR_CONSTANTS: [u64; 7] = [
    9_298_411_001_130_361_340,
    12_065_312_585_734_608_966,
    9_306_329_213_124_626_780,
    5_281_919_268_842_080_866,
    10_536_153_434_571_861_004,
    3_398_623_926_847_679_864,
    9_549_104_520_008_361_294,
];

/// Fills `blocks` with Argon2d memory derived from `key`.
fn argon2_blocks(
    config: &RandomXConfig,
    key: &[u8],
    blocks: &mut [Block],
) -> Result<(), RandomXError> {
    let params = Params::new(
        config.argon_memory,
        config.argon_iterations,
        config.argon_lanes,
        None,
    )?;

    Argon2::new(Algorithm::Argon2d, Version::V0x13, params).fill_memory(
        key,
        config.argon_salt,
        blocks,
    )?;

    Ok(())
}

/// The Cache.
///
/// The cache is used during light verification and to build the [`Dataset`](crate::Dataset).
/// Internally this struct is a wrapper around an [`Arc`] internal cache, this allows
/// cheap clones and allows the cache to be shared between VMs on different threads.
///
/// A cache can only be re-seeded while this is the only handle to it.
#[derive(Debug, Clone)]
pub struct Cache {
    internal_cache: Arc<InternalCache>,
}

impl Cache {
    /// Allocates an unseeded cache.
    ///
    /// # Errors
    ///
    /// Returns an error if the config is invalid or the memory could not be reserved.
    pub fn alloc(config: RandomXConfig) -> Result<Self, RandomXError> {
        config.validate()?;

        let blocks = config.argon_memory as usize;
        let memory_blocks = try_alloc("cache", blocks, Block::new())?;

        Ok(Self {
            internal_cache: Arc::new(InternalCache {
                config,
                memory_blocks,
                programs: Vec::new(),
            }),
        })
    }

    /// Allocates a cache and seeds it with `key`.
    ///
    /// # Errors
    ///
    /// See [`Cache::alloc`] and [`Cache::init`].
    pub fn new(config: RandomXConfig, key: &[u8]) -> Result<Self, RandomXError> {
        let mut cache = Self::alloc(config)?;
        cache.init(key)?;
        Ok(cache)
    }

    /// Seeds the cache with `key`, replacing any previous contents.
    ///
    /// This is slow, with the default config it runs Argon2d over 256 MiB.
    ///
    /// # Errors
    ///
    /// Returns [`RandomXError::StillReferenced`] if this cache is shared.
    #[instrument(skip_all, level = "debug", fields(key_len = key.len()))]
    pub fn init(&mut self, key: &[u8]) -> Result<(), RandomXError> {
        let internal_cache = Arc::get_mut(&mut self.internal_cache)
            .ok_or(RandomXError::StillReferenced("cache"))?;

        internal_cache.init(key)
    }

    /// Whether [`Cache::init`] has been called.
    pub fn is_initialized(&self) -> bool {
        self.internal_cache.is_initialized()
    }

    /// The config this cache was allocated with.
    pub fn config(&self) -> &RandomXConfig {
        &self.internal_cache.config
    }

    /// Generates the dataset item at `item_number` from this cache.
    ///
    /// # Errors
    ///
    /// Returns [`RandomXError::NotInitialized`] if the cache has not been seeded.
    pub fn dataset_item(&self, item_number: u64) -> Result<[u64; 8], RandomXError> {
        if !self.is_initialized() {
            return Err(RandomXError::NotInitialized("cache"));
        }
        Ok(self.internal_cache.init_data_set_item(item_number))
    }

    /// Releases this handle.
    ///
    /// The memory is freed once the last handle is gone, so releasing a cache that is still in
    /// use by a VM or another thread is a bug in the caller: in debug builds this panics.
    ///
    /// # Errors
    ///
    /// Returns [`RandomXError::StillReferenced`] if other handles exist.
    pub fn release(self) -> Result<(), RandomXError> {
        let shared = Arc::strong_count(&self.internal_cache) > 1;
        debug_assert!(!shared, "released a cache that is still referenced");

        if shared {
            return Err(RandomXError::StillReferenced("cache"));
        }
        Ok(())
    }

    pub(crate) fn internal(&self) -> &InternalCache {
        &self.internal_cache
    }

    pub(crate) fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.internal_cache, &other.internal_cache)
    }
}

/// The internal cache structure, used during light verification.
#[derive(Debug)]
pub(crate) struct InternalCache {
    config: RandomXConfig,
    memory_blocks: Vec<Block>,
    programs: Vec<SSProgram>,
}

impl InternalCache {
    fn init(&mut self, key: &[u8]) -> Result<(), RandomXError> {
        self.programs.clear();

        argon2_blocks(&self.config, key, &mut self.memory_blocks)?;

        let mut blake_gen = Blake2Generator::new(key, 0);
        self.programs = (0..self.config.cache_accesses)
            .map(|_| SSProgram::generate(&mut blake_gen, &self.config))
            .collect();

        debug!(
            programs = self.programs.len(),
            instructions = self.programs.iter().map(SSProgram::len).sum::<usize>(),
            "Cache initialized"
        );

        Ok(())
    }

    fn is_initialized(&self) -> bool {
        !self.programs.is_empty()
    }

    /// Gets the cache line at the specified index, wrapping around the cache size.
    fn get_item(&self, idx: u64) -> [u64; 8] {
        let lines = self.config.cache_lines() as u64;
        #[expect(clippy::cast_possible_truncation, reason = "masked to the cache size")]
        let idx = (idx & (lines - 1)) as usize;

        let block = &self.memory_blocks[idx / LINES_PER_BLOCK];
        let start = (idx % LINES_PER_BLOCK) * LINE_WORDS;

        let mut item = [0; LINE_WORDS];
        item.copy_from_slice(&block.as_ref()[start..start + LINE_WORDS]);
        item
    }

    /// Generates the dataset item at the specified index.
    pub(crate) fn init_data_set_item(&self, item_number: u64) -> [u64; 8] {
        let r0 = item_number.wrapping_add(1).wrapping_mul(ITEM_MULTIPLIER);

        let mut values = [r0; 8];
        for (value, constant) in values[1..].iter_mut().zip(ITEM_XOR_CONSTANTS) {
            *value ^= constant;
        }
        let mut registers = RGroupRegisters::new(values);

        let mut cache_index = item_number;

        for program in &self.programs {
            program.execute(&mut registers);

            registers.xor_all(&self.get_item(cache_index));

            cache_index = registers.get(program.reg_with_max_latency());
        }

        registers.inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::test_config;

    #[test]
    fn cache_is_deterministic() {
        let a = Cache::new(test_config(), b"test key 000").unwrap();
        let b = Cache::new(test_config(), b"test key 000").unwrap();
        let c = Cache::new(test_config(), b"test key 001").unwrap();

        for line in [0, 1, 100] {
            assert_eq!(a.internal().get_item(line), b.internal().get_item(line));
            assert_ne!(a.internal().get_item(line), c.internal().get_item(line));
        }
        assert_eq!(a.dataset_item(7).unwrap(), b.dataset_item(7).unwrap());
        assert_ne!(a.dataset_item(7).unwrap(), c.dataset_item(7).unwrap());
    }

    #[test]
    fn unseeded_cache() {
        let cache = Cache::alloc(test_config()).unwrap();

        assert!(!cache.is_initialized());
        assert!(matches!(
            cache.dataset_item(0),
            Err(RandomXError::NotInitialized(_))
        ));
    }

    #[test]
    fn reseeding_a_shared_cache_fails() {
        let mut cache = Cache::new(test_config(), b"test key 000").unwrap();
        let other = cache.clone();

        assert!(matches!(
            cache.init(b"test key 001"),
            Err(RandomXError::StillReferenced(_))
        ));

        drop(other);
        cache.init(b"test key 001").unwrap();
        cache.release().unwrap();
    }

    #[test]
    #[cfg(not(debug_assertions))]
    fn releasing_a_shared_cache_fails() {
        let cache = Cache::new(test_config(), b"test key 000").unwrap();
        let other = cache.clone();

        assert!(matches!(
            cache.release(),
            Err(RandomXError::StillReferenced(_))
        ));
        other.release().unwrap();
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "still referenced")]
    fn releasing_a_shared_cache_panics() {
        let cache = Cache::new(test_config(), b"test key 000").unwrap();
        let _other = cache.clone();

        drop(cache.release());
    }

    #[test]
    fn cache_lines_wrap() {
        let cache = Cache::new(test_config(), b"test key 000").unwrap();
        let lines = cache.config().cache_lines() as u64;

        assert_eq!(
            cache.internal().get_item(3),
            cache.internal().get_item(3 + lines)
        );
    }

    #[test]
    fn item_registers_start_from_item_number() {
        // With no programs the item is just the initial registers mixed with 0 cache lines.
        let mut cache = Cache::alloc(test_config()).unwrap();
        cache.init(b"test key 000").unwrap();
        let internal = Arc::get_mut(&mut cache.internal_cache).unwrap();
        internal.programs.clear();

        let item = internal.init_data_set_item(0);
        assert_eq!(item[0], ITEM_MULTIPLIER);
        assert_eq!(item[7], ITEM_MULTIPLIER ^ ITEM_XOR_CONSTANTS[6]);
    }
}
