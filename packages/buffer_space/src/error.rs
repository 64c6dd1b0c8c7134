use thiserror::Error;

/// Errors that can occur when configuring a memory space or writing into one of its buffers.
///
/// Running out of memory is not an error in this crate. Allocation and lookup operations
/// signal a temporarily exhausted pool by returning `None` instead.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The minimum element size of a memory space was set to zero.
    #[error("minimum element size of a memory space must be non-zero")]
    ZeroMinElemSize,

    /// A size parameter of a memory space was not a multiple of the host page size.
    #[error("{parameter} = {value} is not a multiple of the page size {page_size}")]
    NotPageAligned {
        /// Name of the builder parameter that was rejected.
        parameter: &'static str,

        /// The rejected value.
        value: usize,

        /// The page size the value was validated against.
        page_size: usize,
    },

    /// The memory space could not pre-allocate its cache of free buffers.
    ///
    /// Any buffers allocated before the failure have already been returned to the heap.
    #[error("pre-allocation failed after {allocated} of {cache_count} cache buffers")]
    PreallocationFailed {
        /// How many buffers were successfully allocated before the failure.
        allocated: usize,

        /// How many buffers the memory space was configured to pre-allocate.
        cache_count: usize,
    },

    /// A thread attempted to write into a buffer without holding its acquisition.
    #[error("the calling thread has not acquired the buffer it attempted to write into")]
    NotAcquired,

    /// A write did not fit into the free region of a buffer.
    #[error("write of {requested} bytes does not fit into {available} bytes of free space")]
    InsufficientSpace {
        /// Number of bytes the caller attempted to write or commit.
        requested: usize,

        /// Number of bytes of free space remaining in the buffer.
        available: usize,
    },
}

/// A specialized `Result` type for memory space operations, returning the crate's
/// [`Error`] type as the error value.
pub(crate) type Result<T> = std::result::Result<T, Error>;
