use std::fmt::Debug;

#[cfg_attr(test, mockall::automock)]
pub(crate) trait Platform: Debug + Send + Sync + 'static {
    /// The size of a virtual memory page on the host, in bytes.
    fn page_size(&self) -> usize;
}
