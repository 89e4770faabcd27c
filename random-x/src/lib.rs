//! A pure Rust implementation of the RandomX proof-of-work hash.
//!
//! Hashing needs a [`Cache`] seeded with a key. Light mode VMs compute dataset items from the
//! cache on demand, fast mode VMs read them from a prebuilt [`Dataset`]. Both produce the same
//! digests.
//!
//! ```no_run
//! use cuprate_randomx::{Cache, RandomXConfig, RandomXFlags, RandomXVm};
//!
//! let cache = Cache::new(RandomXConfig::MONERO, b"test key 000")?;
//! let mut vm = RandomXVm::new(RandomXFlags::recommended(), Some(cache), None)?;
//! let digest = vm.calculate_hash(b"This is a test");
//! # Ok::<(), cuprate_randomx::RandomXError>(())
//! ```

mod aes_hash;
mod blake2_generator;
mod cache;
mod config;
mod dataset;
mod error;
mod flags;
mod float;
mod pipeline;
mod program;
mod registers;
mod superscalar;
mod vm;

pub use cache::Cache;
pub use config::{InstructionFrequencies, RandomXConfig};
pub use dataset::{Dataset, DatasetRangeMut};
pub use error::RandomXError;
pub use flags::{Dispatch, Mode, RandomXFlags, VmOptions};
pub use pipeline::{hash_batch, HashPipeline, MONERO_NONCE_OFFSET};
pub use vm::{RandomXVm, VmState};

/// Hashes `input` in light mode with the Monero parameters and `seed` as the cache key.
///
/// This seeds a new cache on every call, keep a [`Cache`] and a [`RandomXVm`] around to hash
/// more than once.
///
/// # Errors
///
/// Returns an error if the cache or VM could not be allocated.
pub fn light_hash(seed: &[u8], input: &[u8]) -> Result<[u8; 32], RandomXError> {
    let cache = Cache::new(RandomXConfig::MONERO, seed)?;
    let mut vm = RandomXVm::new(RandomXFlags::recommended(), Some(cache), None)?;
    Ok(vm.calculate_hash(input))
}

/// The amount of 64 byte items in a dataset built with `config`.
pub const fn dataset_item_count(config: &RandomXConfig) -> u64 {
    config.dataset_item_count()
}

const fn is_0_or_power_of_2(x: u64) -> bool {
    (x & x.wrapping_sub(1)) == 0
}

/// Allocates a `Vec` of `len` copies of `value`, failing instead of aborting if the memory is
/// not available.
fn try_alloc<T: Clone>(what: &'static str, len: usize, value: T) -> Result<Vec<T>, RandomXError> {
    let error = || RandomXError::Allocation {
        what,
        bytes: len.saturating_mul(std::mem::size_of::<T>()),
    };

    let mut vec = Vec::new();
    vec.try_reserve_exact(len).map_err(|_| error())?;
    vec.resize(len, value);
    Ok(vec)
}
