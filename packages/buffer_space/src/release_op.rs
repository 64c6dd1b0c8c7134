use crate::protocol::{release_free_critical, release_full_critical};
use crate::{
    IterDirection, ListKind, MemorySpace, Pooled, PooledBuffer, Processor, ThreadToken,
};

/// Disposes of buffers whose content the drain consumer has finished with.
///
/// Transient buffers leave their list and are deallocated. Every other buffer is reset and made
/// available again in place, without touching the list structure, so the common case needs no
/// lock. Resetting a buffer requires its acquisition: a buffer the calling thread has not
/// acquired is acquired first, and skipped if another thread holds it.
///
/// The caller must have flushed each buffer it hands to the processor.
///
/// # Examples
///
/// ```
/// use buffer_space::{
///     Buffer, IterDirection, ListKind, MemorySpace, ReleaseOp, ThreadToken, page_size,
///     process_full_list, protocol,
/// };
///
/// let space = MemorySpace::<Buffer>::builder()
///     .min_elem_size(page_size())
///     .build()
///     .unwrap();
///
/// let buffer = protocol::allocate_transient_to_full(0, &space, ThreadToken::current()).unwrap();
/// buffer.write(b"event").unwrap();
/// buffer.flush();
///
/// let mut release = ReleaseOp::new(&space, ListKind::Full);
/// process_full_list(&mut release, &space, IterDirection::Forward);
///
/// assert_eq!(release.processed(), 1);
/// assert!(space.is_full_empty());
/// ```
#[derive(Debug)]
pub struct ReleaseOp<'a, T: PooledBuffer> {
    space: &'a MemorySpace<T>,
    thread: ThreadToken,

    /// The list the processed buffers are in.
    list: ListKind,

    processed: usize,
}

impl<'a, T: PooledBuffer> ReleaseOp<'a, T> {
    /// Creates a processor for buffers in the given list of `space`, acting on behalf of the
    /// current thread.
    #[must_use]
    pub fn new(space: &'a MemorySpace<T>, list: ListKind) -> Self {
        Self {
            space,
            thread: ThreadToken::current(),
            list,
            processed: 0,
        }
    }

    /// Number of buffers processed so far. Skipped buffers are not counted.
    #[must_use]
    pub fn processed(&self) -> usize {
        self.processed
    }
}

impl<T: PooledBuffer> ReleaseOp<'_, T> {
    fn count_processed(&mut self) {
        // Cannot overflow because that would imply more buffers than virtual memory.
        self.processed = self.processed.wrapping_add(1);
    }
}

impl<T: PooledBuffer> Processor<T> for ReleaseOp<'_, T> {
    fn process(&mut self, buffer: &Pooled<T>) -> bool {
        if buffer.transient() {
            match self.list {
                ListKind::Full => release_full_critical(buffer.clone(), self.space),
                ListKind::Free => release_free_critical(buffer.clone(), self.space),
            }

            self.count_processed();
            return true;
        }

        if !buffer.acquired_by_self() && !buffer.try_acquire(self.thread) {
            // Still being written to. A later pass picks it up.
            return true;
        }

        self.count_processed();

        buffer.reinitialize();
        debug_assert!(buffer.empty());
        debug_assert!(!buffer.retired());

        // Publish.
        buffer.release();

        true
    }
}

/// Runs `processor` over the full list. Does nothing if the full list is empty.
pub fn process_full_list<T, P>(processor: &mut P, space: &MemorySpace<T>, direction: IterDirection)
where
    T: PooledBuffer,
    P: Processor<T> + ?Sized,
{
    if space.is_full_empty() {
        return;
    }

    space.iterate(processor, ListKind::Full, direction);
}

/// Runs `processor` over the free list.
///
/// # Panics
///
/// In debug builds, panics if the free list is empty.
pub fn process_free_list<T, P>(processor: &mut P, space: &MemorySpace<T>, direction: IterDirection)
where
    T: PooledBuffer,
    P: Processor<T> + ?Sized,
{
    debug_assert!(space.has_free(), "free list processing requires free buffers");

    space.iterate(processor, ListKind::Free, direction);
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::thread;

    use super::*;
    use crate::test_support::{TEST_PAGE_SIZE, test_space};
    use crate::{Buffer, ThreadToken, protocol};

    #[test]
    fn transient_buffers_are_deallocated() {
        let (space, heap) = test_space(0);
        let thread = ThreadToken::current();

        for _ in 0..3 {
            let buffer = protocol::allocate_transient_to_full(0, &space, thread).unwrap();
            buffer.write(b"drained").unwrap();
            buffer.flush();
        }

        let mut release = ReleaseOp::new(&space, ListKind::Full);
        process_full_list(&mut release, &space, IterDirection::Forward);

        assert_eq!(release.processed(), 3);
        assert!(space.is_full_empty());
        assert_eq!(space.free_count(), 0);
        assert_eq!(heap.outstanding_bytes(), 0);
    }

    #[test]
    fn permanent_buffers_are_recycled_in_place() {
        let (space, _heap) = test_space(1);
        let thread = ThreadToken::current();

        let buffer = protocol::get_to_full(0, &space, thread).unwrap();
        buffer.write(b"drained").unwrap();
        buffer.flush();
        buffer.set_retired();

        let mut release = ReleaseOp::new(&space, ListKind::Full);
        process_full_list(&mut release, &space, IterDirection::Backward);

        assert_eq!(release.processed(), 1);
        assert!(space.in_full_list(&buffer));
        assert!(buffer.empty());
        assert!(!buffer.retired());
        assert!(buffer.identity().is_none());
        assert_eq!(buffer.free_size(), TEST_PAGE_SIZE);
    }

    #[test]
    fn buffers_held_by_another_thread_are_skipped() {
        let (space, _heap) = test_space(1);
        let producer = thread::spawn(ThreadToken::current).join().unwrap();

        let buffer = protocol::get_to_full(0, &space, producer).unwrap();

        let mut release = ReleaseOp::new(&space, ListKind::Full);
        process_full_list(&mut release, &space, IterDirection::Forward);

        assert_eq!(release.processed(), 0);
        assert_eq!(buffer.identity(), Some(producer));

        buffer.release();
        process_full_list(&mut release, &space, IterDirection::Forward);

        assert_eq!(release.processed(), 1);
        assert!(buffer.identity().is_none());
        assert!(space.in_full_list(&buffer));
    }

    #[test]
    fn mixed_full_list_is_sorted_out() {
        let (space, _heap) = test_space(1);
        let thread = ThreadToken::current();

        let permanent = protocol::get_to_full(0, &space, thread).unwrap();
        let transient = protocol::allocate_transient_to_full(0, &space, thread).unwrap();

        let mut release = ReleaseOp::new(&space, ListKind::Full);
        process_full_list(&mut release, &space, IterDirection::Forward);

        assert_eq!(release.processed(), 2);
        assert!(space.in_full_list(&permanent));
        assert!(!space.in_full_list(&transient));
        assert_eq!(space.full_count(), 1);
    }

    #[test]
    fn free_list_leases_are_released() {
        let (space, heap) = test_space(0);
        let thread = ThreadToken::current();

        let lease = protocol::allocate_transient_lease_to_free(0, &space, thread).unwrap();
        lease.release();
        drop(lease);

        let mut release = ReleaseOp::new(&space, ListKind::Free);
        process_free_list(&mut release, &space, IterDirection::Forward);

        assert_eq!(release.processed(), 1);
        assert!(!space.has_free());
        assert_eq!(heap.outstanding_bytes(), 0);
    }

    #[test]
    fn empty_full_list_is_not_visited() {
        let (space, _heap) = test_space(2);

        let mut visited = 0;
        process_full_list(
            &mut |_: &Pooled<Buffer>| {
                visited += 1;
                true
            },
            &space,
            IterDirection::Forward,
        );

        assert_eq!(visited, 0);
    }
}
