use std::fmt::{self, Debug};
use std::ops::Deref;
use std::sync::Arc;

use crate::list::NodeKey;

/// A handle to a buffer owned by a [`MemorySpace`](crate::MemorySpace).
///
/// The handle dereferences to the buffer. Cloning it is cheap and yields another handle to
/// the same buffer. The memory space decides which list the buffer belongs to; handing the
/// handle back to a memory space operation is how a thread publishes, releases or frees it.
///
/// A handle stays valid for reads after the memory space has deallocated the buffer: the
/// buffer memory is returned to the heap only once the last handle is dropped. Such a handle is
/// stale and passing it to a memory space operation panics.
pub struct Pooled<T> {
    space_id: u64,
    key: NodeKey,
    buffer: Arc<T>,
}

impl<T> Pooled<T> {
    pub(crate) fn new(space_id: u64, key: NodeKey, buffer: Arc<T>) -> Self {
        Self {
            space_id,
            key,
            buffer,
        }
    }

    pub(crate) fn space_id(&self) -> u64 {
        self.space_id
    }

    pub(crate) fn key(&self) -> NodeKey {
        self.key
    }

    /// Whether two handles refer to the same buffer.
    #[must_use]
    pub fn same_buffer(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.buffer, &other.buffer)
    }
}

impl<T> Clone for Pooled<T> {
    fn clone(&self) -> Self {
        Self {
            space_id: self.space_id,
            key: self.key,
            buffer: Arc::clone(&self.buffer),
        }
    }
}

impl<T> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.buffer
    }
}

impl<T: Debug> Debug for Pooled<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pooled")
            .field("space_id", &self.space_id)
            .field("key", &self.key)
            .field("buffer", &self.buffer)
            .finish()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;
    use crate::Buffer;
    use crate::test_support::test_space;

    assert_impl_all!(Pooled<Buffer>: Send, Sync, Clone, Debug);

    #[test]
    fn clones_refer_to_same_buffer() {
        let (space, _heap) = test_space(0);

        let first = space.allocate(0).unwrap();
        let second = space.allocate(0).unwrap();
        let first_again = first.clone();

        assert!(first.same_buffer(&first_again));
        assert!(!first.same_buffer(&second));

        space.deallocate(first);
        space.deallocate(second);
    }

    #[test]
    fn stale_handle_keeps_buffer_readable() {
        let (space, heap) = test_space(0);

        let buffer = space.allocate(0).unwrap();
        let stale = buffer.clone();
        space.deallocate(buffer);

        // The memory space no longer tracks the buffer but the payload is still alive.
        assert_eq!(stale.capacity(), 4096);
        assert_eq!(heap.outstanding_bytes(), 4096);

        drop(stale);
        assert_eq!(heap.outstanding_bytes(), 0);
    }
}
