use std::fmt::Debug;

/// Receives notifications about buffers entering and leaving a memory space.
///
/// Every method has an empty default implementation. Notifications are delivered synchronously
/// on the thread performing the operation, sometimes while the memory space lock is held, so
/// implementations must not call back into the memory space.
pub trait SpaceCallback: Debug + Send + Sync + 'static {
    /// A buffer of `total_size` bytes was allocated from the heap.
    fn allocated(&self, total_size: usize) {
        _ = total_size;
    }

    /// A buffer of `total_size` bytes was deallocated.
    fn deallocated(&self, total_size: usize) {
        _ = total_size;
    }

    /// A buffer of `total_size` bytes was inserted into the full list for draining.
    fn published_full(&self, total_size: usize) {
        _ = total_size;
    }
}

/// A [`SpaceCallback`] that ignores every notification.
#[derive(Clone, Copy, Debug, Default)]
#[non_exhaustive]
pub struct NoopCallback;

impl NoopCallback {
    /// Creates a new instance.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl SpaceCallback for NoopCallback {}
