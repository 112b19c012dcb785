//! Stress the bridge under multi-threaded contention: concurrent
//! allocation, release, and cross-thread frees must not corrupt data or
//! lose blocks.

mod common;

use common::TestHeap;
use hookmalloc::{Bridge, HeapCell};
use std::ptr;
use std::sync::{Arc, Barrier, Mutex};
use std::thread;

static CELL: HeapCell<TestHeap> = HeapCell::new();

fn stress_alloc_release(num_threads: usize) {
    const ITERATIONS: usize = 5_000;
    const SIZE: usize = 128;

    // Construct on the main thread first so workers race on a ready heap.
    CELL.get().unwrap();

    let barrier = Arc::new(Barrier::new(num_threads));
    let handles: Vec<_> = (0..num_threads)
        .map(|_| {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                unsafe {
                    for _ in 0..ITERATIONS {
                        let p = CELL.alloc(SIZE);
                        assert!(!p.is_null(), "alloc returned null under contention");
                        ptr::write_bytes(p, 0xCC, SIZE);
                        CELL.release(p);
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("worker panicked during stress");
    }
}

#[test]
fn stress_4_threads() {
    stress_alloc_release(4);
}

#[test]
fn stress_8_threads() {
    stress_alloc_release(8);
}

/// Wrapper to send raw pointers between threads. The blocks are owned by
/// the shared heap; only ownership moves across the channel.
#[derive(Clone, Copy)]
struct SendPtr(*mut u8);
unsafe impl Send for SendPtr {}
unsafe impl Sync for SendPtr {}

#[test]
fn cross_thread_release() {
    const COUNT: usize = 1_000;
    const SIZE: usize = 64;

    CELL.get().unwrap();

    let shared: Arc<Mutex<Vec<SendPtr>>> = Arc::new(Mutex::new(Vec::with_capacity(COUNT)));
    let barrier = Arc::new(Barrier::new(2));

    let producer = {
        let shared = Arc::clone(&shared);
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
            barrier.wait();
            for i in 0..COUNT {
                let p = unsafe { CELL.alloc(SIZE) };
                assert!(!p.is_null());
                unsafe { ptr::write_bytes(p, (i & 0xFF) as u8, SIZE) };
                shared.lock().unwrap().push(SendPtr(p));
            }
        })
    };

    let consumer = {
        let shared = Arc::clone(&shared);
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
            barrier.wait();
            let mut released = 0usize;
            while released < COUNT {
                let next = shared.lock().unwrap().pop();
                if let Some(SendPtr(p)) = next {
                    unsafe { CELL.release(p) };
                    released += 1;
                } else {
                    thread::yield_now();
                }
            }
        })
    };

    producer.join().expect("producer panicked");
    consumer.join().expect("consumer panicked");
}
