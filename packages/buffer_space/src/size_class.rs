use std::num::NonZero;

/// The largest buffer capacity a memory space will ever hand out.
///
/// Anything larger cannot be described by a [`std::alloc::Layout`] and is rejected.
pub const MAX_ALLOCATION_SIZE: usize = isize::MAX.unsigned_abs();

/// Rounds a requested buffer size up to its size class.
///
/// Size classes are power-of-two multiples of `min_elem_size`: the result is the smallest
/// `min_elem_size * 2^k` that is at least `requested_size`. Requests at or below the minimum
/// map to the minimum itself.
///
/// Returns `None` if the size class would exceed [`MAX_ALLOCATION_SIZE`].
///
/// # Examples
///
/// ```
/// use std::num::NonZero;
///
/// use buffer_space::align_allocation_size;
///
/// let min = NonZero::new(4096).unwrap();
///
/// assert_eq!(align_allocation_size(0, min), Some(4096));
/// assert_eq!(align_allocation_size(4096 * 3, min), Some(4096 * 4));
/// assert_eq!(align_allocation_size(usize::MAX, min), None);
/// ```
#[must_use]
#[cfg_attr(test, mutants::skip)] // Mutating the comparison can cause an infinite loop.
pub fn align_allocation_size(requested_size: usize, min_elem_size: NonZero<usize>) -> Option<usize> {
    if requested_size > MAX_ALLOCATION_SIZE {
        return None;
    }

    let mut size_class = min_elem_size.get();

    while requested_size > size_class {
        size_class = size_class.checked_mul(2)?;
    }

    (size_class <= MAX_ALLOCATION_SIZE).then_some(size_class)
}

/// Clamps a requested size up to at least the minimum element size of a memory space.
///
/// The minimum is passed explicitly because every memory space has its own.
#[must_use]
pub fn size_adjustment(size: usize, min_elem_size: NonZero<usize>) -> usize {
    size.max(min_elem_size.get())
}
