//! Helpers shared by the unit tests of this crate.

#![cfg_attr(coverage_nightly, coverage(off))]

use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::pal::{MockPlatform, PlatformFacade};
use crate::{Buffer, Heap, MemorySpace, MemorySpaceBuilder, SystemHeap};

/// Page size reported by the mock platform in unit tests.
pub(crate) const TEST_PAGE_SIZE: usize = 4096;

/// A heap that counts what it hands out and can be told to start failing.
#[derive(Debug)]
pub(crate) struct CountingHeap {
    inner: SystemHeap,

    /// Number of successful allocations after which every allocation fails.
    fail_after: Option<usize>,

    attempts: AtomicUsize,
    successes: AtomicUsize,
    outstanding_bytes: AtomicUsize,
}

impl CountingHeap {
    pub(crate) fn new() -> Self {
        Self {
            inner: SystemHeap::new(),
            fail_after: None,
            attempts: AtomicUsize::new(0),
            successes: AtomicUsize::new(0),
            outstanding_bytes: AtomicUsize::new(0),
        }
    }

    pub(crate) fn failing_after(successful_allocations: usize) -> Self {
        Self {
            fail_after: Some(successful_allocations),
            ..Self::new()
        }
    }

    /// Number of allocation requests, successful or not.
    pub(crate) fn attempts(&self) -> usize {
        self.attempts.load(Ordering::Relaxed)
    }

    /// Number of allocation requests that returned memory.
    pub(crate) fn successes(&self) -> usize {
        self.successes.load(Ordering::Relaxed)
    }

    /// Bytes handed out and not yet freed.
    pub(crate) fn outstanding_bytes(&self) -> usize {
        self.outstanding_bytes.load(Ordering::Relaxed)
    }
}

impl Heap for CountingHeap {
    fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        self.attempts.fetch_add(1, Ordering::Relaxed);

        if self
            .fail_after
            .is_some_and(|limit| self.successes.load(Ordering::Relaxed) >= limit)
        {
            return None;
        }

        let ptr = self.inner.allocate(size)?;

        self.successes.fetch_add(1, Ordering::Relaxed);
        self.outstanding_bytes.fetch_add(size, Ordering::Relaxed);

        Some(ptr)
    }

    unsafe fn free(&self, ptr: NonNull<u8>, size: usize) {
        self.outstanding_bytes.fetch_sub(size, Ordering::Relaxed);

        // SAFETY: Forwarding the caller's guarantee; we allocated through the inner heap.
        unsafe {
            self.inner.free(ptr, size);
        }
    }
}

/// A platform facade whose page size is [`TEST_PAGE_SIZE`].
pub(crate) fn test_platform() -> PlatformFacade {
    let mut platform = MockPlatform::new();
    platform.expect_page_size().return_const(TEST_PAGE_SIZE);

    PlatformFacade::from_mock(platform)
}

/// A builder wired to the mock platform and the given heap.
pub(crate) fn test_builder(heap: &Arc<CountingHeap>) -> MemorySpaceBuilder<Buffer> {
    MemorySpace::builder()
        .platform(test_platform())
        .min_elem_size(TEST_PAGE_SIZE)
        .limit_size(TEST_PAGE_SIZE * 64)
        .heap(Arc::clone(heap) as Arc<dyn Heap>)
}

/// A memory space of `Buffer` with `TEST_PAGE_SIZE` elements and `cache_count` pre-warmed.
pub(crate) fn test_space(cache_count: usize) -> (MemorySpace<Buffer>, Arc<CountingHeap>) {
    let heap = Arc::new(CountingHeap::new());

    let space = test_builder(&heap)
        .cache_count(cache_count)
        .build()
        .expect("test configuration is valid and the heap does not fail");

    (space, heap)
}
