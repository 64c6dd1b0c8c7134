use std::fmt::{self, Debug};
use std::mem;
use std::num::NonZero;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, trace, warn};

use crate::list::BufferLists;
use crate::{
    CachePolicy, CacheStats, Heap, IterDirection, ListKind, MemorySpaceBuilder, Payload, Pooled,
    PooledBuffer, Processor, Result, SpaceCallback, ThreadToken, align_allocation_size,
};

/// Global counter for generating unique memory space IDs.
static SPACE_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Generates a unique memory space ID.
fn generate_space_id() -> u64 {
    SPACE_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// A pool of variable-capacity buffers organized into a free list and a full list.
///
/// Producer threads obtain buffers from the memory space, fill them while holding an exclusive
/// acquisition and publish them to the full list. A drain consumer walks the full list,
/// consumes the content and hands each buffer back, at which point the memory space either
/// caches it in the free list or returns it to the heap.
///
/// Buffer capacities are size classes: the minimum element size multiplied by a power of two.
/// See [`align_allocation_size()`].
///
/// Every buffer the memory space owns is in exactly one of three places: the free list, the full
/// list, or held privately by whoever holds its [`Pooled`] handle (detached). A detached buffer
/// whose handles have all been dropped is returned to the heap on the next allocation.
///
/// List structure is protected by a single lock, taken through [`lock()`](Self::lock).
/// Operations that require the lock are methods of the returned [`SpaceGuard`]. Buffer contents
/// are protected by each buffer's own acquisition instead, so filling and draining proceed
/// without the lock.
///
/// Most callers use the higher-level functions in [`protocol`](crate::protocol) instead of
/// calling these methods directly.
///
/// # Examples
///
/// ```
/// use buffer_space::{Buffer, MemorySpace, PooledBuffer, ThreadToken, page_size, protocol};
///
/// let space = MemorySpace::<Buffer>::builder()
///     .min_elem_size(page_size())
///     .cache_count(2)
///     .build()
///     .unwrap();
///
/// let thread = ThreadToken::current();
///
/// // Reuse a cached buffer and publish it for draining.
/// let buffer = protocol::get_to_full(64, &space, thread).unwrap();
/// buffer.write(b"event").unwrap();
/// buffer.release();
///
/// assert_eq!(space.full_count(), 1);
/// assert_eq!(space.free_count(), 1);
/// ```
pub struct MemorySpace<T: PooledBuffer> {
    space_id: u64,

    min_elem_size: NonZero<usize>,
    limit_size: usize,
    cache_count: usize,

    heap: Arc<dyn Heap>,
    cache_policy: Box<dyn CachePolicy>,
    callback: Arc<dyn SpaceCallback>,

    /// Sum of `total_size()` of every buffer registered in `lists`.
    allocated_size: AtomicUsize,

    lists: Mutex<BufferLists<T>>,
}

impl<T: PooledBuffer> MemorySpace<T> {
    /// Creates a builder for configuring a new memory space.
    pub fn builder() -> MemorySpaceBuilder<T> {
        MemorySpaceBuilder::new()
    }

    pub(crate) fn new_inner(
        min_elem_size: NonZero<usize>,
        limit_size: usize,
        cache_count: usize,
        heap: Arc<dyn Heap>,
        cache_policy: Box<dyn CachePolicy>,
        callback: Arc<dyn SpaceCallback>,
    ) -> Result<Self> {
        let space = Self {
            space_id: generate_space_id(),
            min_elem_size,
            limit_size,
            cache_count,
            heap,
            cache_policy,
            callback,
            allocated_size: AtomicUsize::new(0),
            lists: Mutex::new(BufferLists::new()),
        };

        // On failure, dropping the memory space releases whatever was pre-allocated.
        space.initialize()?;

        debug!(
            space_id = space.space_id,
            min_elem_size = min_elem_size.get(),
            limit_size,
            cache_count,
            "memory space initialized"
        );

        Ok(space)
    }

    fn initialize(&self) -> Result<()> {
        let mut guard = self.lock();

        for allocated in 0..self.cache_count {
            let Some(buffer) = guard.allocate(self.min_elem_size.get()) else {
                warn!(
                    space_id = self.space_id,
                    allocated,
                    cache_count = self.cache_count,
                    "memory space pre-allocation failed"
                );

                return Err(crate::Error::PreallocationFailed {
                    allocated,
                    cache_count: self.cache_count,
                });
            };

            guard.insert_free_head(&buffer);
        }

        Ok(())
    }

    /// Allocates a new detached buffer whose capacity is the size class of `requested_size`.
    ///
    /// The buffer is not acquired and is not a member of either list. Hand it to
    /// [`SpaceGuard::insert_free_head()`], [`SpaceGuard::insert_full_head()`] or
    /// [`deallocate()`](Self::deallocate) when done.
    ///
    /// Returns `None` if the heap cannot supply the memory or if the size class would exceed
    /// [`MAX_ALLOCATION_SIZE`](crate::MAX_ALLOCATION_SIZE).
    ///
    /// Detached buffers whose handles have all been dropped are returned to the heap first.
    ///
    /// # Panics
    ///
    /// In debug builds, panics if the size class would exceed the maximum allocation size.
    /// Callers are expected to validate sizes up front.
    #[must_use]
    pub fn allocate(&self, requested_size: usize) -> Option<Pooled<T>> {
        self.reclaim_abandoned(&mut self.lists.lock());

        let buffer = self.allocate_buffer(requested_size)?;
        let key = self.lists.lock().register(Arc::clone(&buffer));

        Some(Pooled::new(self.space_id, key, buffer))
    }

    /// Returns a detached buffer to the heap.
    ///
    /// # Panics
    ///
    /// Panics if the buffer is still a member of the free list or the full list, if the handle
    /// is stale or if it belongs to a different memory space.
    pub fn deallocate(&self, buffer: Pooled<T>) {
        self.lock().deallocate(buffer);
    }

    /// Enters the critical section guarding the structure of both lists.
    ///
    /// The lock is released when the guard is dropped.
    pub fn lock(&self) -> SpaceGuard<'_, T> {
        SpaceGuard {
            space: self,
            lists: self.lists.lock(),
        }
    }

    /// Calls `processor` for each buffer in the selected list, in the given direction.
    ///
    /// The list is captured under the lock and the processor then runs without the lock held,
    /// so it may release or move the buffer it is visiting. Buffers inserted during the
    /// traversal are not visited. A buffer that another thread removed from the list after the
    /// capture is still visited.
    ///
    /// Returns `false` if the processor stopped the traversal early.
    pub fn iterate<P>(&self, processor: &mut P, list: ListKind, direction: IterDirection) -> bool
    where
        P: Processor<T> + ?Sized,
    {
        let snapshot: Vec<Pooled<T>> = self.lock().iter(list, direction).collect();

        trace!(
            space_id = self.space_id,
            ?list,
            ?direction,
            len = snapshot.len(),
            "iterating list"
        );

        snapshot.iter().all(|buffer| processor.process(buffer))
    }

    /// The capacity of the smallest size class.
    #[must_use]
    pub fn min_elem_size(&self) -> usize {
        self.min_elem_size.get()
    }

    pub(crate) fn min_elem(&self) -> NonZero<usize> {
        self.min_elem_size
    }

    /// The aggregate size limit the memory space was configured with. Zero means unlimited.
    #[must_use]
    pub fn limit_size(&self) -> usize {
        self.limit_size
    }

    /// The number of buffers pre-allocated at construction.
    #[must_use]
    pub fn cache_count(&self) -> usize {
        self.cache_count
    }

    /// Total size, including bookkeeping, of every buffer the memory space currently owns.
    #[must_use]
    pub fn allocated_size(&self) -> usize {
        self.allocated_size.load(Ordering::Relaxed)
    }

    /// Number of buffers in the free list.
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.lock().free_count()
    }

    /// Number of buffers in the full list.
    #[must_use]
    pub fn full_count(&self) -> usize {
        self.lock().full_count()
    }

    /// Whether no buffers are waiting to be drained.
    #[must_use]
    pub fn is_full_empty(&self) -> bool {
        self.full_count() == 0
    }

    /// Whether the free list holds at least one buffer.
    #[must_use]
    pub fn has_free(&self) -> bool {
        self.free_count() != 0
    }

    /// Whether the buffer is currently a member of the free list.
    ///
    /// # Panics
    ///
    /// Panics if the handle belongs to a different memory space.
    #[must_use]
    pub fn in_free_list(&self, buffer: &Pooled<T>) -> bool {
        self.lock().in_free_list(buffer)
    }

    /// Whether the buffer is currently a member of the full list.
    ///
    /// # Panics
    ///
    /// Panics if the handle belongs to a different memory space.
    #[must_use]
    pub fn in_full_list(&self, buffer: &Pooled<T>) -> bool {
        self.lock().in_full_list(buffer)
    }

    fn allocate_buffer(&self, requested_size: usize) -> Option<Arc<T>> {
        let capacity = align_allocation_size(requested_size, self.min_elem_size);

        debug_assert!(
            capacity.is_some(),
            "requested size {requested_size} exceeds the maximum allocation size"
        );

        let Some(capacity) = capacity else {
            warn!(
                space_id = self.space_id,
                requested_size, "rejected allocation exceeding the maximum allocation size"
            );
            return None;
        };

        let Some(payload) = Payload::allocate(&self.heap, capacity) else {
            warn!(
                space_id = self.space_id,
                requested_size, capacity, "heap allocation failed"
            );
            return None;
        };

        let buffer = T::initialize(mem::size_of::<T>(), payload)?;
        let total_size = buffer.total_size();

        self.allocated_size.fetch_add(total_size, Ordering::Relaxed);
        self.callback.allocated(total_size);

        debug!(
            space_id = self.space_id,
            requested_size, capacity, total_size, "allocated buffer"
        );

        Some(Arc::new(buffer))
    }

    fn reclaim_abandoned(&self, lists: &mut BufferLists<T>) {
        let abandoned = lists.reclaim_abandoned();

        if abandoned.is_empty() {
            return;
        }

        debug!(
            space_id = self.space_id,
            count = abandoned.len(),
            "reclaiming detached buffers without handles"
        );

        for buffer in abandoned {
            self.release_storage(&buffer);
        }
    }

    /// Accounts for a buffer that has left the memory space. The memory itself returns to the
    /// heap once the last handle to the buffer is dropped.
    fn release_storage(&self, buffer: &T) {
        let total_size = buffer.total_size();

        self.allocated_size.fetch_sub(total_size, Ordering::Relaxed);
        self.callback.deallocated(total_size);

        debug!(space_id = self.space_id, total_size, "deallocated buffer");
    }

    fn check_owner(&self, buffer: &Pooled<T>) {
        assert!(
            buffer.space_id() == self.space_id,
            "attempted to use a buffer handle from a different memory space (handle space ID: {}, current space ID: {})",
            buffer.space_id(),
            self.space_id
        );
    }
}

impl<T: PooledBuffer> Drop for MemorySpace<T> {
    fn drop(&mut self) {
        let lists = self.lists.get_mut();
        let detached = lists.detached();
        let buffers = lists.drain();

        debug!(
            space_id = self.space_id,
            buffers = buffers.len(),
            detached,
            "releasing memory space"
        );

        for buffer in buffers {
            self.release_storage(&buffer);
        }
    }
}

impl<T: PooledBuffer> Debug for MemorySpace<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemorySpace")
            .field("space_id", &self.space_id)
            .field("min_elem_size", &self.min_elem_size)
            .field("limit_size", &self.limit_size)
            .field("cache_count", &self.cache_count)
            .field("allocated_size", &self.allocated_size)
            .field("heap", &self.heap)
            .field("cache_policy", &self.cache_policy)
            .field("callback", &self.callback)
            .finish_non_exhaustive()
    }
}

/// Exclusive access to the list structure of a [`MemorySpace`].
///
/// Obtained from [`MemorySpace::lock()`]. Holding a guard proves that the caller is inside the
/// critical section, so every operation that moves buffers between lists lives here.
pub struct SpaceGuard<'a, T: PooledBuffer> {
    space: &'a MemorySpace<T>,
    lists: MutexGuard<'a, BufferLists<T>>,
}

impl<T: PooledBuffer> SpaceGuard<'_, T> {
    pub(crate) fn min_elem(&self) -> NonZero<usize> {
        self.space.min_elem_size
    }

    /// Like [`MemorySpace::allocate()`] but without taking the lock again.
    #[must_use]
    pub fn allocate(&mut self, requested_size: usize) -> Option<Pooled<T>> {
        self.space.reclaim_abandoned(&mut self.lists);

        let buffer = self.space.allocate_buffer(requested_size)?;
        let key = self.lists.register(Arc::clone(&buffer));

        Some(Pooled::new(self.space.space_id, key, buffer))
    }

    /// Returns a detached buffer to the heap.
    ///
    /// # Panics
    ///
    /// Panics if the buffer is still a member of a list, if the handle is stale or if it
    /// belongs to a different memory space.
    pub fn deallocate(&mut self, buffer: Pooled<T>) {
        self.space.check_owner(&buffer);

        let owned = self.lists.unregister(buffer.key());
        drop(buffer);

        self.space.release_storage(&owned);
    }

    /// Inserts a detached buffer at the head of the free list.
    ///
    /// # Panics
    ///
    /// Panics if the buffer is already a member of a list.
    pub fn insert_free_head(&mut self, buffer: &Pooled<T>) {
        self.space.check_owner(buffer);
        self.lists.prepend(ListKind::Free, buffer.key());

        trace!(space_id = self.space.space_id, "inserted buffer into free list");
    }

    /// Inserts a detached buffer at the head of the full list, publishing it for draining.
    ///
    /// # Panics
    ///
    /// Panics if the buffer is already a member of a list.
    pub fn insert_full_head(&mut self, buffer: &Pooled<T>) {
        self.space.check_owner(buffer);
        self.lists.prepend(ListKind::Full, buffer.key());
        self.space.callback.published_full(buffer.total_size());

        trace!(space_id = self.space.space_id, "inserted buffer into full list");
    }

    /// Removes a buffer from the free list, leaving it detached.
    ///
    /// # Panics
    ///
    /// Panics if the buffer is not a member of the free list.
    pub fn remove_free(&mut self, buffer: &Pooled<T>) {
        self.space.check_owner(buffer);
        self.lists.remove(ListKind::Free, buffer.key());
    }

    /// Removes a buffer from the full list, leaving it detached.
    ///
    /// # Panics
    ///
    /// Panics if the buffer is not a member of the full list.
    pub fn remove_full(&mut self, buffer: &Pooled<T>) {
        self.space.check_owner(buffer);
        self.lists.remove(ListKind::Full, buffer.key());
    }

    /// Moves a buffer from the free list to the head of the full list.
    ///
    /// # Panics
    ///
    /// Panics if the buffer is not a member of the free list.
    pub fn move_free_to_full(&mut self, buffer: &Pooled<T>) {
        self.remove_free(buffer);
        self.insert_full_head(buffer);
    }

    /// Moves a buffer from the full list to the head of the free list.
    ///
    /// # Panics
    ///
    /// Panics if the buffer is not a member of the full list.
    pub fn move_full_to_free(&mut self, buffer: &Pooled<T>) {
        self.remove_full(buffer);
        self.insert_free_head(buffer);
    }

    /// Whether the buffer is currently a member of the free list.
    #[must_use]
    pub fn in_free_list(&self, buffer: &Pooled<T>) -> bool {
        self.space.check_owner(buffer);
        self.lists.in_list(ListKind::Free, buffer.key())
    }

    /// Whether the buffer is currently a member of the full list.
    #[must_use]
    pub fn in_full_list(&self, buffer: &Pooled<T>) -> bool {
        self.space.check_owner(buffer);
        self.lists.in_list(ListKind::Full, buffer.key())
    }

    /// Number of buffers in the free list.
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.lists.count(ListKind::Free)
    }

    /// Number of buffers in the full list.
    #[must_use]
    pub fn full_count(&self) -> usize {
        self.lists.count(ListKind::Full)
    }

    /// Finds a buffer in the free list with at least `size` bytes of free space and acquires
    /// it for `thread`.
    ///
    /// The free list is scanned from the head. Retired buffers and buffers acquired by another
    /// thread are skipped. The returned buffer stays in the free list.
    #[must_use]
    pub fn get(&mut self, size: usize, thread: ThreadToken) -> Option<Pooled<T>> {
        let space_id = self.space.space_id;

        for (key, buffer) in self.lists.iter(ListKind::Free, IterDirection::Forward) {
            if buffer.retired() || !buffer.try_acquire(thread) {
                continue;
            }

            // The free size is only stable once we own the buffer.
            if buffer.free_size() >= size {
                trace!(space_id, size, "acquired buffer from free list");
                return Some(Pooled::new(space_id, key, Arc::clone(buffer)));
            }

            buffer.release();
        }

        None
    }

    /// Takes a drained buffer out of the full list and either caches it in the free list or
    /// deallocates it.
    ///
    /// Transient buffers are always deallocated. Other buffers are offered to the cache policy,
    /// which sees the memory space as it is with this buffer already unlinked.
    ///
    /// # Panics
    ///
    /// Panics if the buffer is not a member of the full list. In debug builds, also panics if a
    /// non-transient buffer is not empty, is retired or is still acquired.
    pub fn release_full(&mut self, buffer: Pooled<T>) {
        self.remove_full(&buffer);
        self.dispose(buffer);
    }

    /// Takes a buffer out of the free list and either keeps it at the head of the free list or
    /// deallocates it.
    ///
    /// The decision follows the same rules as [`release_full()`](Self::release_full). The cache
    /// policy is consulted after the buffer has been unlinked, so the
    /// [`free_count`](CacheStats::free_count) it sees does not include this buffer. With the
    /// default [`KeepCacheCount`](crate::KeepCacheCount) policy, a buffer is therefore kept
    /// even when the free list holds exactly `cache_count` buffers including it.
    ///
    /// # Panics
    ///
    /// Panics if the buffer is not a member of the free list. In debug builds, also panics if a
    /// non-transient buffer is not empty, is retired or is still acquired.
    pub fn release_free(&mut self, buffer: Pooled<T>) {
        self.remove_free(&buffer);
        self.dispose(buffer);
    }

    /// The buffers of one list in the given direction.
    pub fn iter(
        &self,
        list: ListKind,
        direction: IterDirection,
    ) -> impl Iterator<Item = Pooled<T>> + '_ {
        let space_id = self.space.space_id;

        self.lists
            .iter(list, direction)
            .map(move |(key, buffer)| Pooled::new(space_id, key, Arc::clone(buffer)))
    }

    fn dispose(&mut self, buffer: Pooled<T>) {
        if buffer.transient() {
            trace!(space_id = self.space.space_id, "releasing transient buffer");
            self.deallocate(buffer);
            return;
        }

        debug_assert!(buffer.empty(), "a buffer must be empty to be cached");
        debug_assert!(!buffer.retired(), "a retired buffer cannot be cached");
        debug_assert!(
            buffer.identity().is_none(),
            "a buffer must be released by its owner before it is cached"
        );

        if self.space.cache_policy.should_populate_cache(&self.cache_stats()) {
            self.lists.prepend(ListKind::Free, buffer.key());
            trace!(space_id = self.space.space_id, "cached released buffer");
        } else {
            self.deallocate(buffer);
        }
    }

    fn cache_stats(&self) -> CacheStats {
        CacheStats {
            free_count: self.free_count(),
            full_count: self.full_count(),
            cache_count: self.space.cache_count,
            allocated_size: self.space.allocated_size(),
            limit_size: self.space.limit_size,
        }
    }
}

impl<T: PooledBuffer> Debug for SpaceGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpaceGuard")
            .field("space_id", &self.space.space_id)
            .field("free_count", &self.free_count())
            .field("full_count", &self.full_count())
            .finish()
    }
}
