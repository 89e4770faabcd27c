//! Pipelined and batch hashing.
//!
//! A [`HashPipeline`] keeps one hash in flight on its VM, so the scratchpad of each input is
//! filled while the previous digest is finalized. Digests come out one push late, in push order.

use std::ops::Range;

use tracing::{debug, instrument};

use crate::vm::VmState;
use crate::{Cache, Dataset, RandomXError, RandomXFlags, RandomXVm};

/// Offset of the nonce in a Monero block hashing blob.
pub const MONERO_NONCE_OFFSET: usize = 39;

/// Two-slot pipelined hashing over one VM.
#[derive(Debug)]
pub struct HashPipeline {
    vm: RandomXVm,
}

impl HashPipeline {
    /// Creates a pipeline hashing on `vm`.
    pub const fn new(vm: RandomXVm) -> Self {
        Self { vm }
    }

    /// The VM hashes run on.
    pub const fn vm(&self) -> &RandomXVm {
        &self.vm
    }

    /// Returns the VM, dropping any hash in flight.
    pub fn into_inner(self) -> RandomXVm {
        self.vm
    }

    /// Starts hashing `input`, returns the digest of the input pushed before it.
    ///
    /// # Errors
    ///
    /// Only errors if the VM rejects the hash in flight, which a pipeline never causes.
    pub fn push(&mut self, input: &[u8]) -> Result<Option<[u8; 32]>, RandomXError> {
        if self.in_flight() {
            return self.vm.calculate_hash_next(input).map(Some);
        }

        self.vm.calculate_hash_first(input);
        Ok(None)
    }

    /// Returns the digest of the last pushed input, if it has not been returned yet.
    ///
    /// # Errors
    ///
    /// See [`HashPipeline::push`].
    pub fn flush(&mut self) -> Result<Option<[u8; 32]>, RandomXError> {
        if self.in_flight() {
            return self.vm.calculate_hash_last().map(Some);
        }
        Ok(None)
    }

    /// Pushes every input and flushes, returning the digests of everything pushed in order.
    ///
    /// # Errors
    ///
    /// See [`HashPipeline::push`].
    pub fn hash_all<I>(&mut self, inputs: I) -> Result<Vec<[u8; 32]>, RandomXError>
    where
        I: IntoIterator,
        I::Item: AsRef<[u8]>,
    {
        let inputs = inputs.into_iter();
        let mut digests = Vec::with_capacity(inputs.size_hint().0 + 1);

        for input in inputs {
            digests.extend(self.push(input.as_ref())?);
        }
        digests.extend(self.flush()?);

        Ok(digests)
    }

    /// Hashes `blob` with each nonce in `nonces` written little endian at `nonce_offset`, until
    /// `found` accepts a digest.
    ///
    /// Returns the accepted nonce and its digest, or `None` if every nonce was tried.
    ///
    /// # Errors
    ///
    /// Returns [`RandomXError::InvalidInput`] if the nonce does not fit in `blob`.
    #[instrument(skip(self, blob, found), level = "debug")]
    pub fn search_nonce<F>(
        &mut self,
        blob: &[u8],
        nonce_offset: usize,
        nonces: Range<u32>,
        mut found: F,
    ) -> Result<Option<(u32, [u8; 32])>, RandomXError>
    where
        F: FnMut(&[u8; 32]) -> bool,
    {
        if blob.len() < nonce_offset.saturating_add(4) {
            return Err(RandomXError::InvalidInput(
                "the blob is too short to hold a nonce at this offset",
            ));
        }

        // anything pushed before is not ours
        self.flush()?;

        let mut blob = blob.to_vec();
        let mut previous = None;

        for nonce in nonces {
            blob[nonce_offset..nonce_offset + 4].copy_from_slice(&nonce.to_le_bytes());

            if let (Some(digest), Some(previous)) = (self.push(&blob)?, previous) {
                if found(&digest) {
                    self.flush()?;
                    debug!(nonce = previous, "Found nonce");
                    return Ok(Some((previous, digest)));
                }
            }
            previous = Some(nonce);
        }

        if let (Some(digest), Some(previous)) = (self.flush()?, previous) {
            if found(&digest) {
                debug!(nonce = previous, "Found nonce");
                return Ok(Some((previous, digest)));
            }
        }

        Ok(None)
    }

    fn in_flight(&self) -> bool {
        self.vm.state() == VmState::ScratchpadLoaded
    }
}

/// Hashes `inputs` on `workers` threads, each with its own VM, returning the digests in input
/// order.
///
/// `flags`, `cache` and `dataset` are passed to [`RandomXVm::new`] for every worker.
///
/// # Errors
///
/// Returns the first error any worker hit creating its VM.
#[instrument(skip(cache, dataset, inputs), fields(inputs = inputs.len()), level = "debug")]
pub fn hash_batch<T>(
    flags: RandomXFlags,
    cache: Option<&Cache>,
    dataset: Option<&Dataset>,
    inputs: &[T],
    workers: usize,
) -> Result<Vec<[u8; 32]>, RandomXError>
where
    T: AsRef<[u8]> + Sync,
{
    if inputs.is_empty() {
        return Ok(Vec::new());
    }

    let chunk_size = inputs.len().div_ceil(workers.max(1));

    let batches = std::thread::scope(|s| {
        let handles = inputs
            .chunks(chunk_size)
            .map(|chunk| {
                s.spawn(move || {
                    let vm = RandomXVm::new(flags, cache.cloned(), dataset.cloned())?;
                    HashPipeline::new(vm).hash_all(chunk)
                })
            })
            .collect::<Vec<_>>();

        handles
            .into_iter()
            .map(|handle| match handle.join() {
                Ok(digests) => digests,
                Err(panic) => std::panic::resume_unwind(panic),
            })
            .collect::<Vec<_>>()
    });

    let mut digests = Vec::with_capacity(inputs.len());
    for batch in batches {
        digests.extend(batch?);
    }
    Ok(digests)
}
