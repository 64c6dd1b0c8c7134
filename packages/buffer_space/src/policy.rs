use std::fmt::Debug;

/// A snapshot of a memory space, taken under its lock, for cache decisions.
///
/// When a buffer is being released, it has already been unlinked from its list and is not
/// counted in either `free_count` or `full_count`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub struct CacheStats {
    /// Buffers in the free list.
    pub free_count: usize,

    /// Buffers in the full list.
    pub full_count: usize,

    /// The number of buffers the memory space was configured to keep cached.
    pub cache_count: usize,

    /// Total size of every buffer the memory space currently owns, including the one being
    /// released.
    pub allocated_size: usize,

    /// The aggregate size limit the memory space was configured with. Zero means unlimited.
    pub limit_size: usize,
}

/// Decides whether a released non-transient buffer is kept in the free list or deallocated.
///
/// Transient buffers are always deallocated on release; the policy is not consulted for them.
pub trait CachePolicy: Debug + Send + Sync + 'static {
    /// Returns `true` to keep the buffer for reuse, `false` to return it to the heap.
    fn should_populate_cache(&self, stats: &CacheStats) -> bool;
}

/// Keeps released buffers while the free list holds fewer than `cache_count` buffers.
///
/// This is the default policy of a memory space.
#[derive(Clone, Copy, Debug, Default)]
#[non_exhaustive]
pub struct KeepCacheCount;

impl KeepCacheCount {
    /// Creates a new instance.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl CachePolicy for KeepCacheCount {
    fn should_populate_cache(&self, stats: &CacheStats) -> bool {
        stats.free_count < stats.cache_count
    }
}

/// Keeps every released buffer.
#[derive(Clone, Copy, Debug, Default)]
#[non_exhaustive]
pub struct AlwaysCache;

impl AlwaysCache {
    /// Creates a new instance.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl CachePolicy for AlwaysCache {
    #[cfg_attr(test, mutants::skip)] // Trivial.
    fn should_populate_cache(&self, _stats: &CacheStats) -> bool {
        true
    }
}

/// Deallocates every released buffer.
#[derive(Clone, Copy, Debug, Default)]
#[non_exhaustive]
pub struct NeverCache;

impl NeverCache {
    /// Creates a new instance.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl CachePolicy for NeverCache {
    #[cfg_attr(test, mutants::skip)] // Trivial.
    fn should_populate_cache(&self, _stats: &CacheStats) -> bool {
        false
    }
}
