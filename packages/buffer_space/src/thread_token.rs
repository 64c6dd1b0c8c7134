use std::num::NonZero;
use std::sync::atomic::{AtomicU64, Ordering};

/// Source of unique thread tokens. Zero is reserved to mean "no owner" inside buffers.
static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT: ThreadToken = ThreadToken::allocate();
}

/// Identifies a thread that can hold exclusive write access to a buffer.
///
/// Every thread receives a unique token the first time it asks for one. Tokens are never
/// reused within a process, so comparing tokens is equivalent to comparing thread identity.
///
/// # Examples
///
/// ```
/// use buffer_space::ThreadToken;
///
/// let here = ThreadToken::current();
/// assert_eq!(here, ThreadToken::current());
///
/// let elsewhere = std::thread::spawn(ThreadToken::current).join().unwrap();
/// assert_ne!(here, elsewhere);
/// ```
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ThreadToken(NonZero<u64>);

impl ThreadToken {
    /// The token of the calling thread.
    #[must_use]
    pub fn current() -> Self {
        CURRENT.with(|token| *token)
    }

    fn allocate() -> Self {
        let raw = NEXT_TOKEN.fetch_add(1, Ordering::Relaxed);

        Self(NonZero::new(raw).expect(
            "thread token counter wrapped around - a process cannot start 2^64 threads",
        ))
    }

    /// The raw non-zero representation, for storing in an atomic.
    #[must_use]
    pub(crate) fn to_raw(self) -> u64 {
        self.0.get()
    }

    /// Reverses [`to_raw()`](Self::to_raw). Zero means "no token".
    #[must_use]
    pub(crate) fn from_raw(raw: u64) -> Option<Self> {
        NonZero::new(raw).map(Self)
    }
}
