use crate::Pooled;

/// Visits the buffers of a list during [`MemorySpace::iterate()`](crate::MemorySpace::iterate).
///
/// Any `FnMut(&Pooled<T>) -> bool` closure is a processor.
pub trait Processor<T> {
    /// Handles one buffer. Returning `false` stops the traversal.
    fn process(&mut self, buffer: &Pooled<T>) -> bool;
}

impl<T, F> Processor<T> for F
where
    F: FnMut(&Pooled<T>) -> bool,
{
    fn process(&mut self, buffer: &Pooled<T>) -> bool {
        self(buffer)
    }
}
