//! Producer/consumer integration tests for `buffer_space`.
//!
//! Several producer threads record events into buffers while a drain consumer concurrently
//! walks the full list, consumes what was written and hands the buffers back to the pool.

use std::mem;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use buffer_space::{
    Buffer, IterDirection, MemorySpace, Pooled, PooledBuffer, ThreadToken, page_size,
    process_full_list, protocol,
};

const PRODUCERS: usize = 4;
const EVENTS_PER_PRODUCER: usize = 500;
const EVENT: &[u8] = b"0123456789abcdef";
const CACHE_COUNT: usize = 4;

fn new_space() -> MemorySpace<Buffer> {
    MemorySpace::builder()
        .min_elem_size(page_size())
        .limit_size(page_size() * 64)
        .cache_count(CACHE_COUNT)
        .build()
        .unwrap()
}

/// Consumes every full buffer that no producer is currently writing to and returns it to the
/// memory space. Returns the number of bytes consumed.
fn drain_once(space: &MemorySpace<Buffer>, consumer: ThreadToken) -> usize {
    let mut consumed = 0;

    process_full_list(
        &mut |buffer: &Pooled<Buffer>| {
            if !buffer.try_acquire(consumer) {
                // A producer is still writing. We will get it on the next pass.
                return true;
            }

            consumed += buffer.flush();
            buffer.reinitialize();
            buffer.release();

            protocol::release_full_critical(buffer.clone(), space);
            true
        },
        space,
        IterDirection::Backward,
    );

    consumed
}

/// Runs a drain consumer until `producers_done` is set and the full list is empty.
fn run_consumer(space: &MemorySpace<Buffer>, producers_done: &AtomicBool) -> usize {
    let consumer = ThreadToken::current();
    let mut consumed = 0;

    loop {
        // Read the flag before draining so that the final pass sees every published buffer.
        let done = producers_done.load(Ordering::Acquire);

        consumed += drain_once(space, consumer);

        if done && space.is_full_empty() {
            return consumed;
        }

        thread::yield_now();
    }
}

#[test]
fn every_recorded_byte_is_drained_exactly_once() {
    let space = new_space();
    let producers_done = AtomicBool::new(false);

    let consumed = thread::scope(|s| {
        let consumer = s.spawn(|| run_consumer(&space, &producers_done));

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|_| {
                s.spawn(|| {
                    let thread = ThreadToken::current();

                    for _ in 0..EVENTS_PER_PRODUCER {
                        let buffer = protocol::get_to_full(EVENT.len(), &space, thread).unwrap();
                        buffer.write(EVENT).unwrap();
                        buffer.release();
                    }
                })
            })
            .collect();

        for producer in producers {
            producer.join().unwrap();
        }

        producers_done.store(true, Ordering::Release);

        consumer.join().unwrap()
    });

    assert_eq!(consumed, PRODUCERS * EVENTS_PER_PRODUCER * EVENT.len());
    assert!(space.is_full_empty());
    assert!(space.free_count() <= CACHE_COUNT);
}

#[test]
fn exhausted_cache_falls_back_to_transient_buffers() {
    let space = new_space();
    let producers_done = AtomicBool::new(false);

    let consumed = thread::scope(|s| {
        let consumer = s.spawn(|| run_consumer(&space, &producers_done));

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|_| {
                s.spawn(|| {
                    let thread = ThreadToken::current();

                    for _ in 0..EVENTS_PER_PRODUCER {
                        let buffer = match protocol::get_free_with_retry(
                            EVENT.len(),
                            &space,
                            2,
                            thread,
                        ) {
                            Some(buffer) => {
                                space.lock().move_free_to_full(&buffer);
                                buffer
                            }
                            None => {
                                protocol::allocate_transient_to_full(EVENT.len(), &space, thread)
                                    .unwrap()
                            }
                        };

                        buffer.write(EVENT).unwrap();
                        buffer.release();
                    }
                })
            })
            .collect();

        for producer in producers {
            producer.join().unwrap();
        }

        producers_done.store(true, Ordering::Release);

        consumer.join().unwrap()
    });

    assert_eq!(consumed, PRODUCERS * EVENTS_PER_PRODUCER * EVENT.len());
    assert!(space.is_full_empty());

    // Transient buffers were all deallocated; only cached buffers remain.
    let per_buffer = mem::size_of::<Buffer>() + page_size();
    assert_eq!(space.allocated_size(), space.free_count() * per_buffer);
    assert!(space.free_count() <= CACHE_COUNT);
}

#[test]
fn memory_space_can_be_shared_through_arc() {
    let space = Arc::new(new_space());

    let handles: Vec<_> = (0..PRODUCERS)
        .map(|_| {
            let space = Arc::clone(&space);

            thread::spawn(move || {
                let buffer = protocol::get_lease(0, &space, ThreadToken::current()).unwrap();
                assert!(buffer.lease());
                assert!(buffer.transient());
                buffer.acquired_by_self()
            })
        })
        .collect();

    for handle in handles {
        assert!(handle.join().unwrap());
    }
}
