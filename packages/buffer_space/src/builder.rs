use std::cell::Cell;
use std::fmt::{self, Debug};
use std::marker::PhantomData;
use std::num::NonZero;
use std::sync::Arc;

use crate::pal::{Platform, PlatformFacade};
use crate::{
    CachePolicy, Error, Heap, KeepCacheCount, MemorySpace, NoopCallback, PooledBuffer, Result,
    SpaceCallback, SystemHeap,
};

/// Builder for creating an instance of [`MemorySpace`].
///
/// Every setting is optional. By default the minimum element size is the host page size, there
/// is no aggregate limit, no buffers are pre-allocated, payloads come from [`SystemHeap`] and
/// released buffers are cached according to [`KeepCacheCount`].
///
/// # Examples
///
/// ```
/// use buffer_space::{Buffer, MemorySpace, page_size};
///
/// let space = MemorySpace::<Buffer>::builder()
///     .min_elem_size(page_size() * 2)
///     .limit_size(page_size() * 64)
///     .cache_count(4)
///     .build()
///     .unwrap();
///
/// assert_eq!(space.free_count(), 4);
/// ```
///
/// # Thread safety
///
/// The builder is thread-mobile ([`Send`]) and can be safely transferred between threads,
/// allowing configuration to happen on different threads than where the memory space is used.
/// However, it is not thread-safe ([`Sync`]) as it contains mutable configuration state.
#[must_use]
pub struct MemorySpaceBuilder<T> {
    min_elem_size: Option<usize>,
    limit_size: usize,
    cache_count: usize,

    heap: Arc<dyn Heap>,
    cache_policy: Box<dyn CachePolicy>,
    callback: Arc<dyn SpaceCallback>,

    platform: PlatformFacade,

    _buffer: PhantomData<fn() -> T>,

    // Prevents Sync while allowing Send - builders are thread-mobile but not thread-safe
    _not_sync: PhantomData<Cell<()>>,
}

impl<T: PooledBuffer> MemorySpaceBuilder<T> {
    pub(crate) fn new() -> Self {
        Self {
            min_elem_size: None,
            limit_size: 0,
            cache_count: 0,
            heap: Arc::new(SystemHeap::new()),
            cache_policy: Box::new(KeepCacheCount::new()),
            callback: Arc::new(NoopCallback::new()),
            platform: PlatformFacade::real(),
            _buffer: PhantomData,
            _not_sync: PhantomData,
        }
    }

    /// Sets the smallest payload capacity of any buffer. Every buffer capacity is this value
    /// multiplied by a power of two.
    ///
    /// Must be a non-zero multiple of the host page size.
    pub fn min_elem_size(mut self, bytes: usize) -> Self {
        self.min_elem_size = Some(bytes);
        self
    }

    /// Sets the aggregate size the memory space is meant to stay within. Zero means unlimited.
    ///
    /// Must be a multiple of the host page size. The limit is reported to the cache policy
    /// through [`CacheStats`](crate::CacheStats) but the memory space itself does not refuse
    /// allocations that exceed it.
    pub fn limit_size(mut self, bytes: usize) -> Self {
        self.limit_size = bytes;
        self
    }

    /// Sets how many buffers of the minimum element size are pre-allocated into the free list.
    pub fn cache_count(mut self, count: usize) -> Self {
        self.cache_count = count;
        self
    }

    /// Sets the heap that buffer payloads are allocated from.
    pub fn heap(mut self, heap: Arc<dyn Heap>) -> Self {
        self.heap = heap;
        self
    }

    /// Sets the policy that decides whether released buffers are kept for reuse.
    pub fn cache_policy(mut self, policy: impl CachePolicy) -> Self {
        self.cache_policy = Box::new(policy);
        self
    }

    /// Sets the receiver of allocation and publication notifications.
    pub fn callback(mut self, callback: Arc<dyn SpaceCallback>) -> Self {
        self.callback = callback;
        self
    }

    #[cfg(test)]
    pub(crate) fn platform(mut self, platform: PlatformFacade) -> Self {
        self.platform = platform;
        self
    }

    /// Validates the configuration and creates the memory space, pre-allocating its cache.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ZeroMinElemSize`] or [`Error::NotPageAligned`] if a size parameter is
    /// invalid, and [`Error::PreallocationFailed`] if the heap could not supply the cache
    /// buffers. No memory remains allocated when an error is returned.
    pub fn build(self) -> Result<MemorySpace<T>> {
        let page_size = self.platform.page_size();

        let min_elem_size = self.min_elem_size.unwrap_or(page_size);
        let min_elem_size = NonZero::new(min_elem_size).ok_or(Error::ZeroMinElemSize)?;

        require_page_aligned("min_elem_size", min_elem_size.get(), page_size)?;
        require_page_aligned("limit_size", self.limit_size, page_size)?;

        MemorySpace::new_inner(
            min_elem_size,
            self.limit_size,
            self.cache_count,
            self.heap,
            self.cache_policy,
            self.callback,
        )
    }
}

fn require_page_aligned(parameter: &'static str, value: usize, page_size: usize) -> Result<()> {
    if value.checked_rem(page_size) == Some(0) {
        Ok(())
    } else {
        Err(Error::NotPageAligned {
            parameter,
            value,
            page_size,
        })
    }
}

impl<T> Debug for MemorySpaceBuilder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemorySpaceBuilder")
            .field("min_elem_size", &self.min_elem_size)
            .field("limit_size", &self.limit_size)
            .field("cache_count", &self.cache_count)
            .field("heap", &self.heap)
            .field("cache_policy", &self.cache_policy)
            .field("callback", &self.callback)
            .field("platform", &self.platform)
            .finish()
    }
}
