//! The producer-facing functions for obtaining, publishing and releasing buffers.
//!
//! These compose a [`MemorySpace`], its lock and the buffer acquisition state. Functions that
//! need the lock either take it themselves (they accept `&MemorySpace`) or require the caller to
//! already hold it (they accept `&mut SpaceGuard`).
//!
//! Running out of memory is reported as `None`. A caller that fails to get a buffer from the free
//! list can always fall back to allocating a transient one.
//!
//! # Examples
//!
//! ```
//! use buffer_space::{Buffer, MemorySpace, PooledBuffer, ThreadToken, page_size, protocol};
//!
//! let space = MemorySpace::<Buffer>::builder()
//!     .min_elem_size(page_size())
//!     .build()
//!     .unwrap();
//!
//! let thread = ThreadToken::current();
//!
//! // Nothing is cached, so the producer falls back to a transient buffer.
//! let buffer = protocol::get_free_with_retry(128, &space, 3, thread)
//!     .or_else(|| protocol::allocate_transient_to_full(128, &space, thread))
//!     .unwrap();
//!
//! assert!(buffer.transient());
//! assert!(space.in_full_list(&buffer));
//! ```

use tracing::trace;

use crate::{MemorySpace, Pooled, PooledBuffer, SpaceGuard, ThreadToken, size_adjustment};

/// Allocates a detached buffer of at least `size` bytes, never smaller than the minimum element
/// size.
#[must_use]
pub fn allocate<T: PooledBuffer>(size: usize, space: &MemorySpace<T>) -> Option<Pooled<T>> {
    space.allocate(size_adjustment(size, space.min_elem()))
}

/// Allocates a detached buffer and acquires it for `thread`.
#[must_use]
pub fn allocate_acquired<T: PooledBuffer>(
    size: usize,
    space: &MemorySpace<T>,
    thread: ThreadToken,
) -> Option<Pooled<T>> {
    let buffer = allocate(size, space)?;
    buffer.acquire(thread);

    Some(buffer)
}

/// Allocates a detached one-shot buffer acquired for `thread`.
///
/// A transient buffer is deallocated when released instead of being cached.
#[must_use]
pub fn allocate_transient<T: PooledBuffer>(
    size: usize,
    space: &MemorySpace<T>,
    thread: ThreadToken,
) -> Option<Pooled<T>> {
    let buffer = allocate_acquired(size, space, thread)?;
    debug_assert_eq!(buffer.identity(), Some(thread));

    buffer.set_transient();

    Some(buffer)
}

/// Allocates a detached transient lease buffer acquired for `thread`.
#[must_use]
pub fn allocate_transient_lease<T: PooledBuffer>(
    size: usize,
    space: &MemorySpace<T>,
    thread: ThreadToken,
) -> Option<Pooled<T>> {
    let buffer = allocate_transient(size, space, thread)?;
    buffer.set_lease();

    Some(buffer)
}

/// Allocates a buffer acquired for `thread` and publishes it at the head of the full list, under
/// a lock the caller already holds.
#[must_use]
pub fn allocate_to_full<T: PooledBuffer>(
    size: usize,
    guard: &mut SpaceGuard<'_, T>,
    thread: ThreadToken,
) -> Option<Pooled<T>> {
    let buffer = guard.allocate(size_adjustment(size, guard.min_elem()))?;
    buffer.acquire(thread);

    guard.insert_full_head(&buffer);

    Some(buffer)
}

/// Allocates a transient buffer acquired for `thread` and publishes it to the full list.
#[must_use]
pub fn allocate_transient_to_full<T: PooledBuffer>(
    size: usize,
    space: &MemorySpace<T>,
    thread: ThreadToken,
) -> Option<Pooled<T>> {
    let buffer = allocate_transient(size, space, thread)?;
    space.lock().insert_full_head(&buffer);

    Some(buffer)
}

/// Allocates a transient lease buffer acquired for `thread` and publishes it to the full list.
#[must_use]
pub fn allocate_transient_lease_to_full<T: PooledBuffer>(
    size: usize,
    space: &MemorySpace<T>,
    thread: ThreadToken,
) -> Option<Pooled<T>> {
    let buffer = allocate_transient_lease(size, space, thread)?;
    space.lock().insert_full_head(&buffer);

    debug_assert!(buffer.lease());
    Some(buffer)
}

/// Allocates a transient lease buffer acquired for `thread` and inserts it at the head of the
/// free list.
#[must_use]
pub fn allocate_transient_lease_to_free<T: PooledBuffer>(
    size: usize,
    space: &MemorySpace<T>,
    thread: ThreadToken,
) -> Option<Pooled<T>> {
    let buffer = allocate_transient_lease(size, space, thread)?;
    space.lock().insert_free_head(&buffer);

    debug_assert!(buffer.lease());
    Some(buffer)
}

/// Acquires a buffer from the free list with at least `size` bytes of free space.
///
/// The buffer stays in the free list. Returns `None` if no idle buffer is large enough. Never
/// allocates.
#[must_use]
pub fn get_free<T: PooledBuffer>(
    size: usize,
    space: &MemorySpace<T>,
    thread: ThreadToken,
) -> Option<Pooled<T>> {
    space.lock().get(size, thread)
}

/// Calls [`get_free()`] up to `retry_count` times, returning the first buffer obtained.
///
/// Each attempt takes the lock separately; there is no waiting between attempts. Returns `None`
/// once every attempt has failed, without allocating anything.
///
/// # Panics
///
/// In debug builds, panics if `size` exceeds the minimum element size. Larger requests can never
/// be satisfied by a cached buffer and should be allocated directly.
#[must_use]
pub fn get_free_with_retry<T: PooledBuffer>(
    size: usize,
    space: &MemorySpace<T>,
    retry_count: usize,
    thread: ThreadToken,
) -> Option<Pooled<T>> {
    debug_assert!(
        size <= space.min_elem_size(),
        "free list lookups are limited to the minimum element size"
    );

    for attempt in 0..retry_count {
        if let Some(buffer) = get_free(size, space, thread) {
            return Some(buffer);
        }

        trace!(attempt, retry_count, size, "no free buffer available");
    }

    None
}

/// Acquires a buffer from the free list and detaches it, leaving it held privately by the
/// caller.
#[must_use]
pub fn get_free_with_detach<T: PooledBuffer>(
    size: usize,
    space: &MemorySpace<T>,
    thread: ThreadToken,
) -> Option<Pooled<T>> {
    let mut guard = space.lock();

    let buffer = guard.get(size, thread)?;
    guard.remove_free(&buffer);

    Some(buffer)
}

/// Acquires a buffer from the free list and moves it to the head of the full list, under a lock
/// the caller already holds.
///
/// # Panics
///
/// In debug builds, panics if `size` exceeds the minimum element size.
#[must_use]
pub fn get_free_to_full<T: PooledBuffer>(
    size: usize,
    guard: &mut SpaceGuard<'_, T>,
    thread: ThreadToken,
) -> Option<Pooled<T>> {
    debug_assert!(
        size <= guard.min_elem().get(),
        "free list lookups are limited to the minimum element size"
    );

    let buffer = guard.get(size, thread)?;
    guard.move_free_to_full(&buffer);

    Some(buffer)
}

/// Obtains a buffer acquired for `thread` that is resident in the full list.
///
/// Requests that fit the minimum element size are first served from the free list. Otherwise, or
/// if no idle buffer is available, a new buffer is allocated directly into the full list.
/// Returns `None` only if that allocation fails.
#[must_use]
pub fn get_to_full<T: PooledBuffer>(
    size: usize,
    space: &MemorySpace<T>,
    thread: ThreadToken,
) -> Option<Pooled<T>> {
    let size = size_adjustment(size, space.min_elem());
    let mut guard = space.lock();

    if size <= space.min_elem_size() {
        if let Some(buffer) = get_free_to_full(size, &mut guard, thread) {
            return Some(buffer);
        }
    }

    allocate_to_full(size, &mut guard, thread)
}

/// Like [`get_free_with_retry()`] but marks the obtained buffer as a transient lease.
///
/// The buffer stays in the free list. Because it is now transient, releasing it deallocates it
/// instead of caching it again.
#[must_use]
pub fn get_free_lease_with_retry<T: PooledBuffer>(
    size: usize,
    space: &MemorySpace<T>,
    retry_count: usize,
    thread: ThreadToken,
) -> Option<Pooled<T>> {
    let buffer = get_free_with_retry(size, space, retry_count, thread)?;
    make_lease(&buffer);

    Some(buffer)
}

/// Obtains a lease buffer acquired for `thread`.
///
/// An idle buffer from the free list is preferred and stays where it is. Otherwise a new
/// transient lease buffer is allocated and published to the full list.
#[must_use]
pub fn get_lease<T: PooledBuffer>(
    size: usize,
    space: &MemorySpace<T>,
    thread: ThreadToken,
) -> Option<Pooled<T>> {
    if let Some(buffer) = get_free(size, space, thread) {
        make_lease(&buffer);

        debug_assert_eq!(buffer.identity(), Some(thread));
        return Some(buffer);
    }

    allocate_transient_lease_to_full(size, space, thread)
}

fn make_lease<T: PooledBuffer>(buffer: &Pooled<T>) {
    buffer.set_transient();
    buffer.set_lease();
}

/// Hands a drained buffer in the full list back to the memory space, under a lock the caller
/// already holds. See [`SpaceGuard::release_full()`].
///
/// # Panics
///
/// Panics if the buffer is not in the full list. In debug builds, also panics if the buffer has
/// unflushed bytes.
pub fn release_full<T: PooledBuffer>(buffer: Pooled<T>, guard: &mut SpaceGuard<'_, T>) {
    debug_assert_eq!(
        buffer.unflushed_size(),
        0,
        "a buffer must be fully flushed before it is released"
    );

    guard.release_full(buffer);
}

/// Hands a buffer in the free list back to the memory space, under a lock the caller already
/// holds. See [`SpaceGuard::release_free()`].
///
/// # Panics
///
/// Panics if the buffer is not in the free list. In debug builds, also panics if the buffer has
/// unflushed bytes.
pub fn release_free<T: PooledBuffer>(buffer: Pooled<T>, guard: &mut SpaceGuard<'_, T>) {
    debug_assert_eq!(
        buffer.unflushed_size(),
        0,
        "a buffer must be fully flushed before it is released"
    );

    guard.release_free(buffer);
}

/// Like [`release_full()`] but takes the lock itself.
pub fn release_full_critical<T: PooledBuffer>(buffer: Pooled<T>, space: &MemorySpace<T>) {
    release_full(buffer, &mut space.lock());
}

/// Like [`release_free()`] but takes the lock itself.
pub fn release_free_critical<T: PooledBuffer>(buffer: Pooled<T>, space: &MemorySpace<T>) {
    release_free(buffer, &mut space.lock());
}
