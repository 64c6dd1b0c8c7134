use std::hint::spin_loop;
use std::ptr::{self, NonNull};
use std::slice;
use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};

use crate::{Error, Payload, Result, ThreadToken};

/// The capabilities a memory space requires from the buffers it manages.
///
/// A memory space is generic over any type implementing this trait. The crate provides
/// [`Buffer`] as the standard implementation.
///
/// A buffer has a payload delimited by [`start()`](Self::start) and [`end()`](Self::end),
/// and a write position [`pos()`](Self::pos) between them: bytes before `pos` have been
/// written and committed, bytes after it are free space. A buffer may be *acquired* by one
/// thread at a time, which gives that thread exclusive write access to the free space.
///
/// # Safety
///
/// The memory space copies bytes through the pointers reported by this trait (see
/// [`migrate_outstanding_writes()`](crate::migrate_outstanding_writes)), so implementations
/// must guarantee that:
///
/// * `start()..end()` is a single allocation that stays valid for as long as the buffer exists
///   and is not shared with any other buffer.
/// * `start() <= pos() <= end()` at all times.
/// * `free_size()` is exactly the distance from `pos()` to `end()`.
/// * While a thread holds the acquisition, no other thread writes to `pos()..end()` or moves
///   `pos()`.
/// * `try_acquire()` succeeds for at most one thread until `release()` is called.
pub unsafe trait PooledBuffer: Send + Sync + Sized + 'static {
    /// Constructs a buffer around a freshly allocated payload.
    ///
    /// `header_size` is the size of the buffer's own bookkeeping, reported back as part of
    /// [`total_size()`](Self::total_size). Returning `None` aborts the allocation and the
    /// payload is returned to the heap.
    fn initialize(header_size: usize, payload: Payload) -> Option<Self>;

    /// Bookkeeping size plus payload capacity.
    fn total_size(&self) -> usize;

    /// Whether no bytes have been committed since the last (re)initialization.
    fn empty(&self) -> bool;

    /// Whether the buffer has been marked as drained and must not be handed out.
    fn retired(&self) -> bool;

    /// Whether the buffer is one-shot and must not be cached for reuse.
    fn transient(&self) -> bool;

    /// Marks the buffer as one-shot.
    fn set_transient(&self);

    /// Whether the buffer is a temporary extra buffer granted beyond normal allocation.
    fn lease(&self) -> bool;

    /// Marks the buffer as leased. Only valid on transient buffers.
    fn set_lease(&self);

    /// Acquires exclusive write access for `thread`, spinning until it becomes available.
    fn acquire(&self, thread: ThreadToken);

    /// Attempts once to acquire exclusive write access for `thread`.
    fn try_acquire(&self, thread: ThreadToken) -> bool;

    /// Whether the calling thread currently holds the acquisition.
    fn acquired_by_self(&self) -> bool;

    /// Releases the acquisition, making the buffer available to other threads.
    fn release(&self);

    /// Resets the write position and flush position to the start and clears retirement.
    ///
    /// Only the thread holding the acquisition may reinitialize a buffer.
    fn reinitialize(&self);

    /// The thread currently holding the acquisition, if any.
    fn identity(&self) -> Option<ThreadToken>;

    /// First byte of the payload.
    fn start(&self) -> NonNull<u8>;

    /// Current write position.
    fn pos(&self) -> NonNull<u8>;

    /// One past the last byte of the payload.
    fn end(&self) -> NonNull<u8>;

    /// Bytes between the write position and the end of the payload.
    fn free_size(&self) -> usize;

    /// Committed bytes that the drain consumer has not flushed yet.
    fn unflushed_size(&self) -> usize;
}

const FLAG_TRANSIENT: u8 = 1 << 0;
const FLAG_LEASE: u8 = 1 << 1;
const FLAG_RETIRED: u8 = 1 << 2;

/// Raw identity value meaning "not acquired by anyone".
const NO_IDENTITY: u64 = 0;

/// A variable-capacity write buffer for recording events.
///
/// The payload is split into three regions by two offsets:
///
/// ```text
/// start          top               pos                    end
///   |  flushed    |   unflushed     |      free space      |
/// ```
///
/// The producer holding the acquisition writes into the free space, either with
/// [`write()`](Self::write) or by [staging](Self::stage) bytes and [committing](Self::commit)
/// them later. Once the producer has released the buffer, the drain consumer acquires it,
/// reads the unflushed region with [`with_unflushed()`](Self::with_unflushed) and marks it
/// consumed with [`flush()`](Self::flush).
///
/// # Examples
///
/// ```
/// use buffer_space::{Buffer, MemorySpace, PooledBuffer, ThreadToken, page_size, protocol};
///
/// let space = MemorySpace::<Buffer>::builder()
///     .min_elem_size(page_size())
///     .build()
///     .unwrap();
///
/// let buffer = protocol::allocate_acquired(0, &space, ThreadToken::current()).unwrap();
/// buffer.write(b"event").unwrap();
///
/// buffer.with_unflushed(|bytes| assert_eq!(bytes, b"event"));
/// assert_eq!(buffer.flush(), 5);
/// assert_eq!(buffer.unflushed_size(), 0);
///
/// buffer.release();
/// space.deallocate(buffer);
/// ```
#[derive(Debug)]
pub struct Buffer {
    payload: Payload,

    /// Size of the bookkeeping part, reported via `total_size()`.
    header_size: usize,

    /// Offset of the first byte not yet flushed by the drain consumer.
    top: AtomicUsize,

    /// Offset of the first byte of free space. Only written by the acquiring thread
    /// (or by whoever has exclusive access during reinitialization).
    pos: AtomicUsize,

    /// Raw `ThreadToken` of the acquiring thread, or `NO_IDENTITY`.
    identity: AtomicU64,

    flags: AtomicU8,
}

impl Buffer {
    /// Total number of payload bytes.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.payload.capacity()
    }

    /// Number of committed bytes, flushed or not.
    #[must_use]
    pub fn committed_size(&self) -> usize {
        self.pos.load(Ordering::Acquire)
    }

    /// Copies `bytes` to the write position without committing them.
    ///
    /// Staged bytes are outstanding writes: they are not visible to the drain consumer until
    /// [committed](Self::commit), and they are what
    /// [`migrate_outstanding_writes()`](crate::migrate_outstanding_writes) carries over when a
    /// producer moves to a larger buffer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotAcquired`] if the calling thread has not acquired the buffer and
    /// [`Error::InsufficientSpace`] if `bytes` does not fit into the free space.
    pub fn stage(&self, bytes: &[u8]) -> Result<()> {
        self.check_acquired()?;

        let available = self.free_size();

        if bytes.len() > available {
            return Err(Error::InsufficientSpace {
                requested: bytes.len(),
                available,
            });
        }

        // SAFETY: The destination range pos..pos+len lies within the payload as checked
        // above, the source is a distinct Rust slice, and the acquisition protocol gives the
        // calling thread exclusive write access to the free space.
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), self.pos().as_ptr(), bytes.len());
        }

        Ok(())
    }

    /// Advances the write position by `len` bytes, publishing previously staged bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotAcquired`] if the calling thread has not acquired the buffer and
    /// [`Error::InsufficientSpace`] if `len` exceeds the free space.
    pub fn commit(&self, len: usize) -> Result<()> {
        self.check_acquired()?;

        // Only the acquiring thread writes `pos`, so a relaxed load sees our own last store.
        let pos = self.pos.load(Ordering::Relaxed);

        // Cannot wrap because pos never exceeds capacity.
        let available = self.capacity().wrapping_sub(pos);

        if len > available {
            return Err(Error::InsufficientSpace {
                requested: len,
                available,
            });
        }

        // Cannot wrap because len <= capacity - pos.
        self.pos.store(pos.wrapping_add(len), Ordering::Release);

        Ok(())
    }

    /// Stages and commits `bytes` in one step.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotAcquired`] if the calling thread has not acquired the buffer and
    /// [`Error::InsufficientSpace`] if `bytes` does not fit into the free space. Nothing is
    /// written in either case.
    pub fn write(&self, bytes: &[u8]) -> Result<()> {
        self.stage(bytes)?;
        self.commit(bytes.len())
    }

    /// Calls `f` with the committed bytes that have not been flushed yet.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread has not acquired the buffer.
    pub fn with_unflushed<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        assert!(
            self.acquired_by_self(),
            "only the thread holding the acquisition may read the unflushed bytes of a buffer"
        );

        let top = self.top.load(Ordering::Acquire);
        let pos = self.pos.load(Ordering::Acquire);

        // Cannot wrap because top only ever advances up to pos.
        let len = pos.wrapping_sub(top);

        // SAFETY: top..pos lies within the payload. The bytes were written before pos was
        // advanced with Release ordering, which we synchronized with via the Acquire load.
        // Committed bytes are only written again after reinitialization, which requires the
        // acquisition we hold for the duration of `f`.
        let unflushed = unsafe { slice::from_raw_parts(self.offset_ptr(top).as_ptr(), len) };

        f(unflushed)
    }

    /// Marks all committed bytes as flushed and returns how many were newly flushed.
    pub fn flush(&self) -> usize {
        let pos = self.pos.load(Ordering::Acquire);
        let previous_top = self.top.swap(pos, Ordering::AcqRel);

        // Cannot wrap because top never exceeds pos.
        pos.wrapping_sub(previous_top)
    }

    /// Marks the buffer as drained, excluding it from acquisition via the free list.
    pub fn set_retired(&self) {
        self.flags.fetch_or(FLAG_RETIRED, Ordering::AcqRel);
    }

    /// Reverses [`set_retired()`](Self::set_retired).
    pub fn clear_retired(&self) {
        self.flags.fetch_and(!FLAG_RETIRED, Ordering::AcqRel);
    }

    fn check_acquired(&self) -> Result<()> {
        if self.acquired_by_self() {
            Ok(())
        } else {
            Err(Error::NotAcquired)
        }
    }

    fn has_flag(&self, flag: u8) -> bool {
        self.flags.load(Ordering::Acquire) & flag != 0
    }

    fn offset_ptr(&self, offset: usize) -> NonNull<u8> {
        debug_assert!(offset <= self.capacity());

        // SAFETY: Offsets never exceed the capacity, so the result is within the payload
        // allocation or one past its end.
        unsafe { self.payload.as_ptr().add(offset) }
    }
}

// SAFETY: start..end is the payload allocation, which lives as long as the buffer. pos is
// clamped to the capacity by commit() and reset by reinitialize(), free_size() is computed from
// the same offsets, and acquisition is an atomic compare-exchange on the identity.
unsafe impl PooledBuffer for Buffer {
    fn initialize(header_size: usize, payload: Payload) -> Option<Self> {
        Some(Self {
            payload,
            header_size,
            top: AtomicUsize::new(0),
            pos: AtomicUsize::new(0),
            identity: AtomicU64::new(NO_IDENTITY),
            flags: AtomicU8::new(0),
        })
    }

    fn total_size(&self) -> usize {
        // Cannot overflow because both parts exist in memory at the same time.
        self.header_size.wrapping_add(self.capacity())
    }

    fn empty(&self) -> bool {
        self.pos.load(Ordering::Acquire) == 0
    }

    fn retired(&self) -> bool {
        self.has_flag(FLAG_RETIRED)
    }

    fn transient(&self) -> bool {
        self.has_flag(FLAG_TRANSIENT)
    }

    fn set_transient(&self) {
        self.flags.fetch_or(FLAG_TRANSIENT, Ordering::AcqRel);
    }

    fn lease(&self) -> bool {
        self.has_flag(FLAG_LEASE)
    }

    fn set_lease(&self) {
        debug_assert!(self.transient(), "a lease buffer must already be transient");

        self.flags.fetch_or(FLAG_LEASE, Ordering::AcqRel);
    }

    fn acquire(&self, thread: ThreadToken) {
        while !self.try_acquire(thread) {
            spin_loop();
        }
    }

    fn try_acquire(&self, thread: ThreadToken) -> bool {
        self.identity
            .compare_exchange(
                NO_IDENTITY,
                thread.to_raw(),
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    fn acquired_by_self(&self) -> bool {
        self.identity() == Some(ThreadToken::current())
    }

    fn release(&self) {
        self.identity.store(NO_IDENTITY, Ordering::Release);
    }

    fn reinitialize(&self) {
        assert!(
            self.acquired_by_self(),
            "only the thread holding the acquisition may reinitialize a buffer"
        );

        self.pos.store(0, Ordering::Release);
        self.top.store(0, Ordering::Release);
        self.clear_retired();
    }

    fn identity(&self) -> Option<ThreadToken> {
        ThreadToken::from_raw(self.identity.load(Ordering::Acquire))
    }

    fn start(&self) -> NonNull<u8> {
        self.payload.as_ptr()
    }

    fn pos(&self) -> NonNull<u8> {
        self.offset_ptr(self.pos.load(Ordering::Acquire))
    }

    fn end(&self) -> NonNull<u8> {
        self.offset_ptr(self.capacity())
    }

    fn free_size(&self) -> usize {
        // Cannot wrap because pos never exceeds capacity.
        self.capacity().wrapping_sub(self.pos.load(Ordering::Acquire))
    }

    fn unflushed_size(&self) -> usize {
        let top = self.top.load(Ordering::Acquire);
        let pos = self.pos.load(Ordering::Acquire);

        pos.saturating_sub(top)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::mem;
    use std::sync::Arc;
    use std::thread;

    use static_assertions::assert_impl_all;

    use super::*;
    use crate::{Heap, SystemHeap};

    assert_impl_all!(Buffer: Send, Sync, std::fmt::Debug);

    fn new_buffer(capacity: usize) -> Buffer {
        let heap: Arc<dyn Heap> = Arc::new(SystemHeap::new());
        let payload = Payload::allocate(&heap, capacity).unwrap();

        Buffer::initialize(mem::size_of::<Buffer>(), payload).unwrap()
    }

    #[test]
    fn new_buffer_is_empty_and_unowned() {
        let buffer = new_buffer(4096);

        assert!(buffer.empty());
        assert!(!buffer.retired());
        assert!(!buffer.transient());
        assert!(!buffer.lease());
        assert_eq!(buffer.identity(), None);
        assert_eq!(buffer.free_size(), 4096);
        assert_eq!(buffer.unflushed_size(), 0);
        assert_eq!(buffer.start(), buffer.pos());
        assert_eq!(buffer.total_size(), mem::size_of::<Buffer>() + 4096);
    }

    #[test]
    fn write_advances_position() {
        let buffer = new_buffer(4096);
        buffer.acquire(ThreadToken::current());

        buffer.write(b"hello").unwrap();

        assert!(!buffer.empty());
        assert_eq!(buffer.committed_size(), 5);
        assert_eq!(buffer.free_size(), 4091);
        assert_eq!(buffer.unflushed_size(), 5);
        buffer.with_unflushed(|bytes| assert_eq!(bytes, b"hello"));
    }

    #[test]
    fn write_that_does_not_fit_is_rejected() {
        let buffer = new_buffer(4096);
        buffer.acquire(ThreadToken::current());

        buffer.write(&[7; 4000]).unwrap();
        let result = buffer.write(&[7; 100]);

        assert!(matches!(
            result,
            Err(Error::InsufficientSpace {
                requested: 100,
                available: 96
            })
        ));
        assert_eq!(buffer.committed_size(), 4000);
    }

    #[test]
    fn staged_bytes_are_invisible_until_committed() {
        let buffer = new_buffer(4096);
        buffer.acquire(ThreadToken::current());

        buffer.stage(b"abc").unwrap();
        assert!(buffer.empty());
        buffer.with_unflushed(|bytes| assert!(bytes.is_empty()));

        buffer.commit(3).unwrap();
        buffer.with_unflushed(|bytes| assert_eq!(bytes, b"abc"));
    }

    #[test]
    fn commit_beyond_capacity_is_rejected() {
        let buffer = new_buffer(4096);
        buffer.acquire(ThreadToken::current());

        assert!(buffer.commit(4097).is_err());
        assert!(buffer.commit(4096).is_ok());
        assert_eq!(buffer.free_size(), 0);
        assert_eq!(buffer.pos(), buffer.end());
    }

    #[test]
    fn flush_consumes_unflushed_bytes() {
        let buffer = new_buffer(4096);
        buffer.acquire(ThreadToken::current());

        buffer.write(b"first").unwrap();
        assert_eq!(buffer.flush(), 5);
        assert_eq!(buffer.unflushed_size(), 0);

        buffer.write(b"second").unwrap();
        buffer.with_unflushed(|bytes| assert_eq!(bytes, b"second"));
        assert_eq!(buffer.flush(), 6);
        assert_eq!(buffer.flush(), 0);
        assert!(!buffer.empty());
    }

    #[test]
    fn reinitialize_resets_cursors_and_retirement() {
        let buffer = new_buffer(4096);
        buffer.acquire(ThreadToken::current());
        buffer.write(b"payload").unwrap();
        buffer.set_retired();

        buffer.reinitialize();

        assert!(buffer.empty());
        assert!(!buffer.retired());
        assert_eq!(buffer.unflushed_size(), 0);
        assert_eq!(buffer.free_size(), 4096);
    }

    #[test]
    fn write_by_non_owner_is_rejected() {
        let buffer = new_buffer(4096);
        let other = thread::spawn(ThreadToken::current).join().unwrap();

        assert!(matches!(buffer.write(b"unowned"), Err(Error::NotAcquired)));

        buffer.acquire(other);

        assert!(matches!(buffer.write(b"intruder"), Err(Error::NotAcquired)));
        assert!(matches!(buffer.stage(b"intruder"), Err(Error::NotAcquired)));
        assert!(matches!(buffer.commit(8), Err(Error::NotAcquired)));
        assert!(buffer.empty());
        assert_eq!(buffer.free_size(), 4096);
    }

    #[test]
    fn writers_without_acquisition_cannot_share_a_buffer() {
        let buffer = Arc::new(new_buffer(4096));
        buffer.acquire(thread::spawn(ThreadToken::current).join().unwrap());

        let writers: Vec<_> = (0..4)
            .map(|_| {
                let buffer = Arc::clone(&buffer);

                thread::spawn(move || {
                    (0..100)
                        .filter(|_| buffer.write(b"12345678").is_ok())
                        .count()
                })
            })
            .collect();

        for writer in writers {
            assert_eq!(writer.join().unwrap(), 0);
        }

        assert_eq!(buffer.committed_size(), 0);
    }

    #[test]
    #[should_panic]
    fn reinitialize_by_non_owner_panics() {
        let buffer = new_buffer(4096);
        buffer.acquire(thread::spawn(ThreadToken::current).join().unwrap());

        buffer.reinitialize();
    }

    #[test]
    #[should_panic]
    fn reading_unflushed_without_acquisition_panics() {
        let buffer = new_buffer(4096);

        buffer.with_unflushed(|bytes| bytes.len());
    }

    #[test]
    fn acquisition_is_exclusive() {
        let buffer = Arc::new(new_buffer(4096));
        let here = ThreadToken::current();

        assert!(buffer.try_acquire(here));
        assert!(buffer.acquired_by_self());
        assert!(!buffer.try_acquire(here));

        let other = Arc::clone(&buffer);
        let acquired_elsewhere =
            thread::spawn(move || other.try_acquire(ThreadToken::current())).join().unwrap();
        assert!(!acquired_elsewhere);

        buffer.release();
        assert_eq!(buffer.identity(), None);
        assert!(!buffer.acquired_by_self());
    }

    #[test]
    fn acquired_by_other_thread_is_not_self() {
        let buffer = new_buffer(4096);
        let other = thread::spawn(ThreadToken::current).join().unwrap();

        buffer.acquire(other);

        assert_eq!(buffer.identity(), Some(other));
        assert!(!buffer.acquired_by_self());
    }

    #[test]
    fn lease_requires_transient() {
        let buffer = new_buffer(4096);

        buffer.set_transient();
        buffer.set_lease();

        assert!(buffer.transient());
        assert!(buffer.lease());
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic]
    fn lease_without_transient_panics() {
        let buffer = new_buffer(4096);
        buffer.set_lease();
    }

    #[test]
    fn retirement_can_be_toggled() {
        let buffer = new_buffer(4096);

        buffer.set_retired();
        assert!(buffer.retired());

        buffer.clear_retired();
        assert!(!buffer.retired());
    }
}
