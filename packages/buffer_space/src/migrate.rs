use std::ptr;

use crate::PooledBuffer;

/// Copies `used` outstanding bytes from the write position of `old` to the write position of
/// `new_buffer`.
///
/// A producer calls this when the write it is in the middle of no longer fits into its current
/// buffer and it has obtained a larger one. The bytes it already staged after `old.pos()` are
/// carried over so that the write can continue in `new_buffer`. The copied bytes are staged in
/// `new_buffer`, not committed, and `old` is left unchanged.
///
/// # Panics
///
/// Panics if any of the following does not hold, because the copy goes through raw pointers:
///
/// * `old` and `new_buffer` are different buffers.
/// * The write position of `old` lies within its payload and `used` bytes follow it.
/// * `new_buffer` has at least `used + requested` bytes of free space.
/// * `new_buffer` is acquired by the calling thread.
///
/// # Examples
///
/// ```
/// use buffer_space::{
///     Buffer, MemorySpace, PooledBuffer, ThreadToken, migrate_outstanding_writes, page_size,
///     protocol,
/// };
///
/// let space = MemorySpace::<Buffer>::builder()
///     .min_elem_size(page_size())
///     .build()
///     .unwrap();
/// let thread = ThreadToken::current();
///
/// let old = protocol::allocate_acquired(0, &space, thread).unwrap();
/// old.stage(b"half-written").unwrap();
///
/// let new_buffer = protocol::allocate_acquired(page_size() * 2, &space, thread).unwrap();
/// migrate_outstanding_writes(&*old, &*new_buffer, 12, page_size());
///
/// new_buffer.commit(12).unwrap();
/// new_buffer.with_unflushed(|bytes| assert_eq!(bytes, b"half-written"));
/// ```
pub fn migrate_outstanding_writes<T: PooledBuffer>(
    old: &T,
    new_buffer: &T,
    used: usize,
    requested: usize,
) {
    assert!(
        !ptr::eq(old, new_buffer),
        "outstanding writes cannot be migrated into the same buffer"
    );

    let start = old.start();
    let pos = old.pos();
    let end = old.end();

    assert!(
        start <= pos && pos <= end,
        "write position of the old buffer lies outside its payload"
    );

    // Cannot wrap because pos <= end.
    let outstanding_capacity = end.as_ptr().addr().wrapping_sub(pos.as_ptr().addr());

    assert!(
        used <= outstanding_capacity,
        "{used} outstanding bytes extend past the end of the old buffer"
    );

    let required = used.checked_add(requested);
    let available = new_buffer.free_size();

    assert!(
        required.is_some_and(|required| available >= required),
        "new buffer has {available} bytes of free space but {used} + {requested} are required"
    );

    assert!(
        new_buffer.acquired_by_self(),
        "the new buffer must be acquired by the migrating thread"
    );

    // SAFETY: The source range pos..pos+used lies within the old payload and the destination
    // range lies within the free space of the new payload, as asserted above. The two buffers
    // are distinct so their payloads do not overlap, and the calling thread holds the
    // acquisition of the destination, which gives it exclusive write access to that free space.
    unsafe {
        ptr::copy_nonoverlapping(pos.as_ptr(), new_buffer.pos().as_ptr(), used);
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::thread;

    use super::*;
    use crate::test_support::{TEST_PAGE_SIZE, test_space};
    use crate::{ThreadToken, protocol};

    #[test]
    fn copies_staged_bytes_only() {
        let (space, _heap) = test_space(0);
        let thread = ThreadToken::current();

        let old = protocol::allocate_acquired(0, &space, thread).unwrap();
        old.write(b"committed").unwrap();
        old.stage(b"staged").unwrap();

        let new_buffer = protocol::allocate_acquired(TEST_PAGE_SIZE * 2, &space, thread).unwrap();

        migrate_outstanding_writes(&*old, &*new_buffer, 6, 100);

        // Nothing is committed in the new buffer until the producer says so.
        assert!(new_buffer.empty());

        new_buffer.commit(6).unwrap();
        new_buffer.with_unflushed(|bytes| assert_eq!(bytes, b"staged"));

        // The old buffer is untouched.
        old.with_unflushed(|bytes| assert_eq!(bytes, b"committed"));
    }

    #[test]
    fn migrating_nothing_is_allowed() {
        let (space, _heap) = test_space(0);
        let thread = ThreadToken::current();

        let old = protocol::allocate_acquired(0, &space, thread).unwrap();
        let new_buffer = protocol::allocate_acquired(0, &space, thread).unwrap();

        migrate_outstanding_writes(&*old, &*new_buffer, 0, TEST_PAGE_SIZE);

        assert!(new_buffer.empty());
    }

    #[test]
    fn exact_fit_is_allowed() {
        let (space, _heap) = test_space(0);
        let thread = ThreadToken::current();

        let old = protocol::allocate_acquired(0, &space, thread).unwrap();
        old.stage(&[1; 16]).unwrap();
        let new_buffer = protocol::allocate_acquired(0, &space, thread).unwrap();

        migrate_outstanding_writes(&*old, &*new_buffer, 16, TEST_PAGE_SIZE - 16);

        new_buffer.commit(16).unwrap();
        new_buffer.with_unflushed(|bytes| assert_eq!(bytes, [1; 16]));
    }

    #[test]
    #[should_panic]
    fn insufficient_destination_space_panics() {
        let (space, _heap) = test_space(0);
        let thread = ThreadToken::current();

        let old = protocol::allocate_acquired(0, &space, thread).unwrap();
        let new_buffer = protocol::allocate_acquired(0, &space, thread).unwrap();

        migrate_outstanding_writes(&*old, &*new_buffer, 16, TEST_PAGE_SIZE);
    }

    #[test]
    #[should_panic]
    fn overflowing_requirement_panics() {
        let (space, _heap) = test_space(0);
        let thread = ThreadToken::current();

        let old = protocol::allocate_acquired(0, &space, thread).unwrap();
        let new_buffer = protocol::allocate_acquired(0, &space, thread).unwrap();

        migrate_outstanding_writes(&*old, &*new_buffer, 1, usize::MAX);
    }

    #[test]
    #[should_panic]
    fn used_beyond_old_payload_panics() {
        let (space, _heap) = test_space(0);
        let thread = ThreadToken::current();

        let old = protocol::allocate_acquired(0, &space, thread).unwrap();
        old.write(&[0; TEST_PAGE_SIZE - 8]).unwrap();
        let new_buffer = protocol::allocate_acquired(TEST_PAGE_SIZE * 4, &space, thread).unwrap();

        migrate_outstanding_writes(&*old, &*new_buffer, 16, 0);
    }

    #[test]
    #[should_panic]
    fn destination_held_by_other_thread_panics() {
        let (space, _heap) = test_space(0);
        let thread = ThreadToken::current();
        let other = thread::spawn(ThreadToken::current).join().unwrap();

        let old = protocol::allocate_acquired(0, &space, thread).unwrap();
        let new_buffer = protocol::allocate_acquired(0, &space, other).unwrap();

        migrate_outstanding_writes(&*old, &*new_buffer, 0, 0);
    }

    #[test]
    #[should_panic]
    fn same_buffer_panics() {
        let (space, _heap) = test_space(0);

        let buffer = protocol::allocate_acquired(0, &space, ThreadToken::current()).unwrap();

        migrate_outstanding_writes(&*buffer, &*buffer, 0, 0);
    }
}
