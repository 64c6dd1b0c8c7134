#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! A size-classed pool of reusable write buffers for high-throughput event recording.
//!
//! Producer threads record events into buffers obtained from a [`MemorySpace`]. Buffers they
//! have filled go to the full list, where a background drain consumer picks them up. Once drained,
//! a buffer is either recycled into the free list or returned to the heap. The goal is to keep
//! heap allocation off the hot path of recording.
//!
//! # Key Features
//!
//! - **Size classes**: every buffer capacity is the minimum element size multiplied by a power
//!   of two, see [`align_allocation_size()`]
//! - **Two lists**: a free list of buffers available for reuse and a full list of buffers
//!   waiting to be drained, with a buffer never in both
//! - **Writes stay off the space lock**: list structure is guarded by one lock ([`SpaceGuard`])
//!   while buffer contents are guarded by per-buffer acquisition, so filling a buffer does not
//!   take the memory space lock
//! - **Transient and lease buffers**: one-shot buffers that are always deallocated on release,
//!   so a producer can always make progress even when the cache is exhausted
//! - **Bounded retries**: [`protocol::get_free_with_retry()`] makes exactly the requested number
//!   of attempts and never allocates
//! - **Migration**: [`migrate_outstanding_writes()`] carries a half-finished write over to a
//!   larger buffer
//! - **Pluggable policy**: the [`CachePolicy`] decides which released buffers stay cached, the
//!   [`Heap`] supplies memory and a [`SpaceCallback`] observes the buffer lifecycle
//!
//! # Buffer lifecycle
//!
//! ```text
//!              allocate / get_free                    insert_full_head / get_to_full
//!   heap ───────────────────────────► producer ─────────────────────────────────► full list
//!    ▲                                    │                                          │
//!    │ deallocate                         │ release                      ReleaseOp /  │
//!    │                                    ▼                              release_full │
//!    └──────────────────────────────── free list ◄───────────────────────────────────┘
//! ```
//!
//! # Examples
//!
//! ```
//! use buffer_space::{
//!     Buffer, IterDirection, ListKind, MemorySpace, PooledBuffer, ReleaseOp, ThreadToken,
//!     page_size, process_full_list, protocol,
//! };
//!
//! let space = MemorySpace::<Buffer>::builder()
//!     .min_elem_size(page_size())
//!     .cache_count(4)
//!     .build()
//!     .unwrap();
//!
//! // Producer: take a cached buffer, record an event and publish it.
//! let buffer = protocol::get_to_full(64, &space, ThreadToken::current()).unwrap();
//! buffer.write(b"thread started").unwrap();
//! buffer.release();
//!
//! // Drain consumer: consume the content, then recycle every full buffer in place.
//! process_full_list(
//!     &mut |buffer: &buffer_space::Pooled<Buffer>| {
//!         assert!(buffer.try_acquire(ThreadToken::current()));
//!         buffer.with_unflushed(|bytes| assert_eq!(bytes, b"thread started"));
//!         buffer.flush();
//!         true
//!     },
//!     &space,
//!     IterDirection::Forward,
//! );
//!
//! let mut release = ReleaseOp::new(&space, ListKind::Full);
//! process_full_list(&mut release, &space, IterDirection::Forward);
//!
//! assert!(buffer.empty());
//! ```

mod buffer;
mod builder;
mod callback;
mod error;
mod heap;
mod list;
mod migrate;
mod pal;
mod policy;
mod pooled;
mod processor;
pub mod protocol;
mod release_op;
mod size_class;
mod space;
mod thread_token;

#[cfg(test)]
mod test_support;

pub use buffer::*;
pub use builder::*;
pub use callback::*;
pub use error::Error;
pub(crate) use error::Result;
pub use heap::{Heap, Payload, SystemHeap};
pub use list::{IterDirection, ListKind};
pub use migrate::*;
pub use policy::*;
pub use pooled::Pooled;
pub use processor::*;
pub use release_op::*;
pub use size_class::*;
pub use space::{MemorySpace, SpaceGuard};
pub use thread_token::ThreadToken;

use crate::pal::{Platform, PlatformFacade};

/// The size of a virtual memory page on the host, in bytes.
///
/// The minimum element size and the aggregate limit of a [`MemorySpace`] must be multiples of
/// this value.
#[must_use]
pub fn page_size() -> usize {
    PlatformFacade::real().page_size()
}
