use std::alloc::{Layout, alloc, dealloc};
use std::fmt::{self, Debug};
use std::ptr::NonNull;
use std::sync::Arc;

/// Alignment of every payload handed out by [`SystemHeap`].
pub(crate) const PAYLOAD_ALIGNMENT: usize = 16;

/// The heap primitive a memory space allocates buffer payloads from.
///
/// Implementations report allocation failure by returning `None`; the memory space turns that
/// into an empty result for the caller rather than treating it as fatal.
pub trait Heap: Debug + Send + Sync + 'static {
    /// Allocates `size` bytes, returning `None` if the memory is not available.
    fn allocate(&self, size: usize) -> Option<NonNull<u8>>;

    /// Returns memory previously obtained from [`allocate()`](Self::allocate).
    ///
    /// # Safety
    ///
    /// The caller must ensure that `ptr` was returned by `allocate(size)` on this same heap
    /// with the same `size`, and that it has not already been freed.
    unsafe fn free(&self, ptr: NonNull<u8>, size: usize);
}

/// A [`Heap`] backed by the Rust global allocator.
#[derive(Clone, Copy, Debug, Default)]
#[non_exhaustive]
pub struct SystemHeap;

impl SystemHeap {
    /// Creates a new instance.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Heap for SystemHeap {
    fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        let layout = Layout::from_size_align(size, PAYLOAD_ALIGNMENT).ok()?;

        if layout.size() == 0 {
            return None;
        }

        // SAFETY: The layout is valid and has a non-zero size, as checked above.
        NonNull::new(unsafe { alloc(layout) })
    }

    unsafe fn free(&self, ptr: NonNull<u8>, size: usize) {
        let layout = Layout::from_size_align(size, PAYLOAD_ALIGNMENT)
            .expect("size was accepted by allocate() so it forms a valid layout");

        // SAFETY: The caller guarantees that ptr came from allocate(size) on this heap,
        // which used exactly this layout, and that it has not been freed yet.
        unsafe {
            dealloc(ptr.as_ptr(), layout);
        }
    }
}

/// The byte storage of one buffer, returned to its heap when dropped.
///
/// The payload does not create any references to its bytes. The buffer that owns it decides
/// which thread may read or write which region through the raw pointer.
pub struct Payload {
    ptr: NonNull<u8>,
    capacity: usize,
    heap: Arc<dyn Heap>,
}

impl Payload {
    /// Allocates `capacity` bytes from `heap`, returning `None` if the heap is exhausted.
    #[must_use]
    pub(crate) fn allocate(heap: &Arc<dyn Heap>, capacity: usize) -> Option<Self> {
        let ptr = heap.allocate(capacity)?;

        Some(Self {
            ptr,
            capacity,
            heap: Arc::clone(heap),
        })
    }

    /// Pointer to the first byte of the payload.
    #[must_use]
    pub fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    /// Number of bytes in the payload.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Drop for Payload {
    fn drop(&mut self) {
        // SAFETY: We obtained ptr from allocate(capacity) on this heap and are the only
        // owner of the allocation, which we free exactly once here.
        unsafe {
            self.heap.free(self.ptr, self.capacity);
        }
    }
}

impl Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Payload")
            .field("ptr", &self.ptr)
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

// SAFETY: The payload exclusively owns its allocation and the heap is Send + Sync. The bytes
// themselves are only touched through raw pointers whose use is coordinated by the owning
// buffer's acquisition protocol.
unsafe impl Send for Payload {}

// SAFETY: Shared references to the payload only expose the pointer value and the capacity;
// see the Send justification above for the bytes behind the pointer.
unsafe impl Sync for Payload {}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;
    use crate::test_support::CountingHeap;

    assert_impl_all!(SystemHeap: Send, Sync, Debug);
    assert_impl_all!(Payload: Send, Sync, Debug);

    #[test]
    fn system_heap_allocates_and_frees() {
        let heap = SystemHeap::new();

        let ptr = heap.allocate(4096).unwrap();
        assert_eq!(ptr.as_ptr().align_offset(PAYLOAD_ALIGNMENT), 0);

        // SAFETY: ptr came from allocate(4096) on this heap and is freed once.
        unsafe {
            heap.free(ptr, 4096);
        }
    }

    #[test]
    fn system_heap_rejects_zero_size() {
        assert!(SystemHeap::new().allocate(0).is_none());
    }

    #[test]
    fn system_heap_rejects_unrepresentable_size() {
        assert!(SystemHeap::new().allocate(usize::MAX).is_none());
    }

    #[test]
    fn payload_returns_memory_on_drop() {
        let counting = Arc::new(CountingHeap::new());
        let heap: Arc<dyn Heap> = Arc::clone(&counting) as Arc<dyn Heap>;

        let payload = Payload::allocate(&heap, 8192).unwrap();
        assert_eq!(payload.capacity(), 8192);
        assert_eq!(counting.outstanding_bytes(), 8192);

        drop(payload);
        assert_eq!(counting.outstanding_bytes(), 0);
    }

    #[test]
    fn payload_allocation_failure_is_none() {
        let heap: Arc<dyn Heap> = Arc::new(CountingHeap::failing_after(0));

        assert!(Payload::allocate(&heap, 4096).is_none());
    }
}
