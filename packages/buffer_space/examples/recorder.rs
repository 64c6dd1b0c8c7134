//! A small event recorder built on a memory space.
//!
//! Producer threads record events into buffers published to the full list, while a drain
//! consumer prints what they wrote and recycles the buffers. Run with `RUST_LOG=buffer_space=debug`
//! to see the memory space at work.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use buffer_space::{
    Buffer, IterDirection, MemorySpace, Pooled, PooledBuffer, ThreadToken, page_size,
    process_full_list, protocol,
};
use tracing_subscriber::EnvFilter;

const PRODUCERS: usize = 3;
const EVENTS_PER_PRODUCER: usize = 5;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let space = MemorySpace::<Buffer>::builder()
        .min_elem_size(page_size())
        .limit_size(page_size() * 16)
        .cache_count(2)
        .build()
        .expect("memory space configuration is valid");

    let producers_done = AtomicBool::new(false);

    thread::scope(|s| {
        s.spawn(|| drain(&space, &producers_done));

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|producer| {
                let space = &space;

                s.spawn(move || record(space, producer))
            })
            .collect();

        for producer in producers {
            producer.join().expect("producer thread panicked");
        }

        producers_done.store(true, Ordering::Release);
    });

    println!(
        "done: {} buffers cached, {} bytes allocated",
        space.free_count(),
        space.allocated_size()
    );
}

fn record(space: &MemorySpace<Buffer>, producer: usize) {
    let thread = ThreadToken::current();

    for event in 0..EVENTS_PER_PRODUCER {
        let message = format!("producer {producer} event {event}");

        // Prefer a cached buffer; fall back to a one-shot buffer when the cache is busy.
        let buffer = match protocol::get_free_with_retry(message.len(), space, 3, thread) {
            Some(buffer) => {
                space.lock().move_free_to_full(&buffer);
                buffer
            }
            None => protocol::allocate_transient_to_full(message.len(), space, thread)
                .expect("out of memory"),
        };

        buffer
            .write(message.as_bytes())
            .expect("message fits into a page");
        buffer.release();
    }
}

fn drain(space: &MemorySpace<Buffer>, producers_done: &AtomicBool) {
    let consumer = ThreadToken::current();

    loop {
        let done = producers_done.load(Ordering::Acquire);

        process_full_list(
            &mut |buffer: &Pooled<Buffer>| {
                // Skip buffers a producer is still writing to.
                if !buffer.try_acquire(consumer) {
                    return true;
                }

                buffer.with_unflushed(|bytes| {
                    println!("drained: {}", String::from_utf8_lossy(bytes));
                });
                buffer.flush();
                buffer.reinitialize();
                buffer.release();

                // Transient buffers go back to the heap, the rest are cached if there is room.
                protocol::release_full_critical(buffer.clone(), space);
                true
            },
            space,
            IterDirection::Forward,
        );

        if done && space.is_full_empty() {
            break;
        }

        thread::yield_now();
    }
}
