/// A RandomX error.
///
/// RandomX is a pure function of its inputs, none of these errors are transient and nothing in
/// this crate retries after one.
#[derive(Debug, thiserror::Error)]
pub enum RandomXError {
    /// Memory for a cache, dataset or scratchpad could not be reserved.
    #[error("Failed to allocate {bytes} bytes for the {what}.")]
    Allocation {
        /// What was being allocated.
        what: &'static str,
        /// The amount of bytes requested.
        bytes: usize,
    },
    /// A dataset item range was out of bounds.
    #[error("Dataset range {start}..{start}+{count} is out of range, the dataset has {item_count} items.")]
    OutOfRange {
        /// The first item of the range.
        start: u64,
        /// The amount of items in the range.
        count: u64,
        /// The amount of items in the dataset.
        item_count: u64,
    },
    /// Dataset ranges handed out for concurrent initialization overlapped.
    #[error("Dataset ranges overlap or are not in ascending order.")]
    OverlappingRanges,
    /// Something was used before it was initialized.
    #[error("Not initialized: {0}")]
    NotInitialized(&'static str),
    /// A cache or dataset was modified or released while still shared.
    #[error("The {0} is still referenced.")]
    StillReferenced(&'static str),
    /// An input could not be used.
    #[error("Invalid input: {0}")]
    InvalidInput(&'static str),
    /// The [`RandomXConfig`](crate::RandomXConfig) is invalid.
    #[error("Invalid config: {0}")]
    InvalidConfig(&'static str),
    /// Argon2 rejected its parameters.
    #[error("Argon2 error: {0}")]
    Argon2(#[from] argon2::Error),
}
