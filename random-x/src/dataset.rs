use std::ops::Range;
use std::sync::Arc;

#[cfg(feature = "rayon")]
use rayon::prelude::*;
use tracing::{debug, instrument};

use crate::{
    cache::{Cache, InternalCache},
    config::{RandomXConfig, CACHE_LINE_SIZE},
    try_alloc, RandomXError,
};

/// The Dataset used during mining.
///
/// Internally this struct is a wrapper around an [`Arc`] internal dataset, this allows
/// cheap clones and allows the dataset to be shared between VMs on different threads.
///
/// The dataset can only be written while this is the only handle to it, so building it and
/// hashing with it never overlap.
#[derive(Debug, Clone)]
pub struct Dataset {
    internal_dataset: Arc<InternalDataset>,
}

/// The internal dataset used during mining.
#[derive(Debug)]
struct InternalDataset {
    config: RandomXConfig,
    items: Vec<[u64; 8]>,
}

#[expect(clippy::cast_possible_truncation, reason = "the dataset was allocated with this many items")]
const fn item_index(item: u64) -> usize {
    item as usize
}

impl Dataset {
    /// Allocates a zeroed dataset.
    ///
    /// # Errors
    ///
    /// Returns an error if the config is invalid or the memory could not be reserved.
    pub fn alloc(config: RandomXConfig) -> Result<Self, RandomXError> {
        config.validate()?;

        let item_count =
            usize::try_from(config.dataset_item_count()).map_err(|_| RandomXError::Allocation {
                what: "dataset",
                bytes: usize::MAX,
            })?;
        let items = try_alloc("dataset", item_count, [0; 8])?;

        Ok(Self {
            internal_dataset: Arc::new(InternalDataset { config, items }),
        })
    }

    /// Allocates a dataset for `cache`'s config and builds it on `workers` threads.
    ///
    /// This is very computationally intense so might take a long time to complete.
    ///
    /// # Errors
    ///
    /// See [`Dataset::alloc`] and [`Dataset::init_parallel`].
    pub fn new(cache: &Cache, workers: usize) -> Result<Self, RandomXError> {
        let mut dataset = Self::alloc(*cache.config())?;
        dataset.init_parallel(cache, workers)?;
        Ok(dataset)
    }

    /// The amount of items in the dataset.
    pub fn item_count(&self) -> u64 {
        self.internal_dataset.items.len() as u64
    }

    /// The size of the dataset in bytes.
    pub fn memory_size(&self) -> usize {
        self.internal_dataset.items.len() * CACHE_LINE_SIZE
    }

    /// The config this dataset was allocated with.
    pub fn config(&self) -> &RandomXConfig {
        &self.internal_dataset.config
    }

    /// Returns the item at `item_number`.
    ///
    /// # Errors
    ///
    /// Returns [`RandomXError::OutOfRange`] if the item does not exist.
    pub fn item(&self, item_number: u64) -> Result<[u64; 8], RandomXError> {
        self.internal_dataset
            .items
            .get(item_index(item_number))
            .copied()
            .ok_or(RandomXError::OutOfRange {
                start: item_number,
                count: 1,
                item_count: self.item_count(),
            })
    }

    /// Builds `count` items from `start` using `cache`.
    ///
    /// # Errors
    ///
    /// Returns [`RandomXError::OutOfRange`] if `start + count` is past the end of the dataset,
    /// [`RandomXError::StillReferenced`] if the dataset is shared and
    /// [`RandomXError::NotInitialized`] if the cache has not been seeded.
    #[instrument(skip(self, cache), level = "debug")]
    pub fn init(&mut self, cache: &Cache, start: u64, count: u64) -> Result<(), RandomXError> {
        let end = start.checked_add(count).ok_or(RandomXError::OutOfRange {
            start,
            count,
            item_count: self.item_count(),
        })?;

        let mut ranges = self.ranges_mut(&[start..end])?;
        for range in &mut ranges {
            range.init(cache)?;
        }

        Ok(())
    }

    /// Splits the dataset into disjoint mutable views, one per range.
    ///
    /// The ranges must be in ascending order and must not overlap. Each view can be initialized
    /// on its own thread.
    ///
    /// # Errors
    ///
    /// Returns [`RandomXError::OutOfRange`] if a range is past the end of the dataset,
    /// [`RandomXError::OverlappingRanges`] if ranges overlap or are out of order and
    /// [`RandomXError::StillReferenced`] if the dataset is shared.
    pub fn ranges_mut(
        &mut self,
        ranges: &[Range<u64>],
    ) -> Result<Vec<DatasetRangeMut<'_>>, RandomXError> {
        let item_count = self.item_count();

        let mut previous_end = 0;
        for range in ranges {
            if range.end > item_count {
                return Err(RandomXError::OutOfRange {
                    start: range.start,
                    count: range.end.saturating_sub(range.start),
                    item_count,
                });
            }
            if range.start < previous_end || range.end < range.start {
                return Err(RandomXError::OverlappingRanges);
            }
            previous_end = range.end;
        }

        let internal_dataset = Arc::get_mut(&mut self.internal_dataset)
            .ok_or(RandomXError::StillReferenced("dataset"))?;
        let config = internal_dataset.config;

        let mut rest = internal_dataset.items.as_mut_slice();
        let mut offset = 0;
        let mut views = Vec::with_capacity(ranges.len());

        for range in ranges {
            let (_, tail) = std::mem::take(&mut rest).split_at_mut(item_index(range.start - offset));
            let (items, tail) = tail.split_at_mut(item_index(range.end - range.start));

            views.push(DatasetRangeMut {
                start: range.start,
                config,
                items,
            });

            rest = tail;
            offset = range.end;
        }

        Ok(views)
    }

    /// Splits the whole dataset into `workers` contiguous views of (almost) equal size.
    ///
    /// Worker `i` gets the items `item_count * i / workers .. item_count * (i + 1) / workers`.
    ///
    /// # Errors
    ///
    /// Returns [`RandomXError::StillReferenced`] if the dataset is shared.
    pub fn partition_mut(
        &mut self,
        workers: usize,
    ) -> Result<Vec<DatasetRangeMut<'_>>, RandomXError> {
        let ranges = partition(self.item_count(), workers);
        self.ranges_mut(&ranges)
    }

    /// Builds the whole dataset from `cache` on `workers` threads.
    ///
    /// Returns once every worker has finished, a panic in a worker is resumed on this thread.
    ///
    /// # Errors
    ///
    /// Returns [`RandomXError::StillReferenced`] if the dataset is shared and
    /// [`RandomXError::NotInitialized`] if the cache has not been seeded.
    #[instrument(skip(self, cache), level = "debug")]
    pub fn init_parallel(&mut self, cache: &Cache, workers: usize) -> Result<(), RandomXError> {
        check_cache(self.config(), cache)?;
        let cache = cache.internal();

        let mut ranges = self.partition_mut(workers)?;

        #[cfg(feature = "rayon")]
        ranges.par_iter_mut().for_each(|range| range.fill(cache));

        #[cfg(not(feature = "rayon"))]
        std::thread::scope(|s| {
            let handles = ranges
                .iter_mut()
                .map(|range| s.spawn(move || range.fill(cache)))
                .collect::<Vec<_>>();

            for handle in handles {
                if let Err(panic) = handle.join() {
                    std::panic::resume_unwind(panic);
                }
            }
        });

        debug!(items = self.item_count(), "Dataset initialized");
        Ok(())
    }

    /// Releases this handle.
    ///
    /// Releasing a dataset that is still in use by a VM or another thread is a bug in the
    /// caller: in debug builds this panics.
    ///
    /// # Errors
    ///
    /// Returns [`RandomXError::StillReferenced`] if other handles exist.
    pub fn release(self) -> Result<(), RandomXError> {
        let shared = Arc::strong_count(&self.internal_dataset) > 1;
        debug_assert!(!shared, "released a dataset that is still referenced");

        if shared {
            return Err(RandomXError::StillReferenced("dataset"));
        }
        Ok(())
    }

    pub(crate) fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.internal_dataset, &other.internal_dataset)
    }

    /// Returns the item at `item_number`, which must be in range.
    pub(crate) fn get(&self, item_number: u64) -> &[u64; 8] {
        &self.internal_dataset.items[item_index(item_number)]
    }
}

/// A mutable view of a contiguous range of dataset items.
#[derive(Debug)]
pub struct DatasetRangeMut<'a> {
    start: u64,
    config: RandomXConfig,
    items: &'a mut [[u64; 8]],
}

impl DatasetRangeMut<'_> {
    /// The first item in this range.
    pub const fn start(&self) -> u64 {
        self.start
    }

    /// The amount of items in this range.
    pub const fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether this range holds no items.
    pub const fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Builds the items in this range from `cache`.
    ///
    /// # Errors
    ///
    /// Returns [`RandomXError::NotInitialized`] if the cache has not been seeded.
    pub fn init(&mut self, cache: &Cache) -> Result<(), RandomXError> {
        check_cache(&self.config, cache)?;
        self.fill(cache.internal());
        Ok(())
    }

    fn fill(&mut self, cache: &InternalCache) {
        for (item_number, item) in (self.start..).zip(self.items.iter_mut()) {
            *item = cache.init_data_set_item(item_number);
        }
    }
}

fn check_cache(config: &RandomXConfig, cache: &Cache) -> Result<(), RandomXError> {
    if !cache.is_initialized() {
        return Err(RandomXError::NotInitialized("cache"));
    }
    if cache.config() != config {
        return Err(RandomXError::InvalidConfig(
            "the cache and dataset have different configs",
        ));
    }
    Ok(())
}

/// Splits `item_count` items into `workers` contiguous ranges.
fn partition(item_count: u64, workers: usize) -> Vec<Range<u64>> {
    let workers = workers.max(1) as u128;
    let item_count = u128::from(item_count);

    #[expect(clippy::cast_possible_truncation, reason = "bounded by item_count")]
    let bound = |i: u128| (item_count * i / workers) as u64;

    (0..workers).map(|i| bound(i)..bound(i + 1)).collect()
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::tests::{test_cache, test_config};

    #[test]
    fn partition_covers_everything() {
        assert_eq!(partition(10, 3), vec![0..3, 3..6, 6..10]);
        assert_eq!(partition(2, 4), vec![0..0, 0..1, 1..1, 1..2]);
        assert_eq!(partition(5, 0), vec![0..5]);
    }

    #[test]
    fn out_of_range() {
        let cache = test_cache();
        let mut dataset = Dataset::alloc(test_config()).unwrap();
        let count = dataset.item_count();

        assert!(matches!(
            dataset.init(&cache, count - 1, 2),
            Err(RandomXError::OutOfRange { .. })
        ));
        assert!(matches!(
            dataset.init(&cache, u64::MAX, 2),
            Err(RandomXError::OutOfRange { .. })
        ));
        assert!(matches!(
            dataset.item(count),
            Err(RandomXError::OutOfRange { .. })
        ));
        dataset.init(&cache, count - 1, 1).unwrap();
    }

    #[test]
    fn overlapping_ranges() {
        let mut dataset = Dataset::alloc(test_config()).unwrap();

        assert!(matches!(
            dataset.ranges_mut(&[0..10, 9..12]),
            Err(RandomXError::OverlappingRanges)
        ));
        assert!(matches!(
            dataset.ranges_mut(&[5..10, 0..2]),
            Err(RandomXError::OverlappingRanges)
        ));
        assert_eq!(dataset.ranges_mut(&[0..10, 10..12]).unwrap().len(), 2);
    }

    #[test]
    fn unseeded_cache() {
        let cache = Cache::alloc(test_config()).unwrap();
        let mut dataset = Dataset::alloc(test_config()).unwrap();

        assert!(matches!(
            dataset.init_parallel(&cache, 2),
            Err(RandomXError::NotInitialized(_))
        ));
    }

    #[test]
    fn shared_dataset_is_read_only() {
        let cache = test_cache();
        let mut dataset = Dataset::alloc(test_config()).unwrap();
        let _shared = dataset.clone();

        assert!(matches!(
            dataset.init(&cache, 0, 1),
            Err(RandomXError::StillReferenced(_))
        ));
    }

    #[test]
    fn items_match_the_cache() {
        let cache = test_cache();
        let dataset = Dataset::new(&cache, 3).unwrap();

        for item in [0, 1, dataset.item_count() / 2, dataset.item_count() - 1] {
            assert_eq!(dataset.item(item).unwrap(), cache.dataset_item(item).unwrap());
        }
    }

    #[test]
    fn views_can_be_built_on_threads() {
        let cache = test_cache();
        let mut dataset = Dataset::alloc(test_config()).unwrap();
        let count = dataset.item_count();

        let mut views = dataset.ranges_mut(&[0..count / 3, count / 3..count]).unwrap();
        std::thread::scope(|s| {
            for view in &mut views {
                let cache = &cache;
                s.spawn(move || view.init(cache).unwrap());
            }
        });

        assert_eq!(dataset.item(count - 1).unwrap(), cache.dataset_item(count - 1).unwrap());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(8))]

        #[test]
        fn any_partition_builds_the_same_dataset(workers in 1_usize..9) {
            let cache = test_cache();
            let mut reference = Dataset::alloc(test_config()).unwrap();
            let count = reference.item_count();
            reference.init(&cache, 0, count).unwrap();

            let dataset = Dataset::new(&cache, workers).unwrap();
            prop_assert_eq!(
                &dataset.internal_dataset.items,
                &reference.internal_dataset.items
            );
        }
    }
}
