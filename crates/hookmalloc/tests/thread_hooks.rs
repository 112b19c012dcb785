//! Thread controller round-trips with the hooks live.

mod common;

use common::TestHeap;
use hookmalloc::threads::{self, StartRoutine};
use hookmalloc::{Bridge, HeapCell};
use std::ffi::c_void;
use std::ptr;
use std::sync::atomic::Ordering;

static CELL: HeapCell<TestHeap> = HeapCell::new();

const THREADS: usize = 8;
const BLOCKS_PER_THREAD: usize = 200;

unsafe extern "C-unwind" fn worker(arg: *mut c_void) -> *mut c_void {
    for i in 0..BLOCKS_PER_THREAD {
        let p = CELL.alloc(32 + (i % 7) * 48);
        assert!(!p.is_null());
        ptr::write_bytes(p, 0xCC, 32);
        CELL.release(p);
    }
    arg
}

/// Drive `create_thread` with std::thread standing in for the platform
/// creation primitive.
fn spawn_wrapped(start: StartRoutine, arg: *mut c_void) -> std::thread::JoinHandle<()> {
    let mut handle = None;
    let rc = unsafe {
        threads::create_thread(&CELL, start, arg, |routine, raw| {
            let raw = raw as usize;
            handle = Some(std::thread::spawn(move || {
                unsafe { routine(raw as *mut c_void) };
            }));
            0
        })
    };
    assert_eq!(rc, 0);
    handle.expect("creation closure was not invoked")
}

#[test]
fn hooks_fire_once_per_thread_and_nothing_leaks() {
    hookmalloc::init::mark_hooks_ready();

    let heap = CELL.get().unwrap();
    let starts_before = heap.thread_starts.load(Ordering::SeqCst);
    let exits_before = heap.thread_exits.load(Ordering::SeqCst);

    let handles: Vec<_> = (0..THREADS)
        .map(|_| spawn_wrapped(worker, ptr::null_mut()))
        .collect();
    for handle in handles {
        handle.join().expect("worker panicked");
    }

    assert_eq!(
        heap.thread_starts.load(Ordering::SeqCst),
        starts_before + THREADS
    );
    assert_eq!(
        heap.thread_exits.load(Ordering::SeqCst),
        exits_before + THREADS
    );
    assert!(threads::any_thread_created());
}

#[test]
fn failed_creation_releases_the_record() {
    hookmalloc::init::mark_hooks_ready();

    static LOCAL: HeapCell<TestHeap> = HeapCell::new();
    let heap = LOCAL.get().unwrap();

    let rc = unsafe { threads::create_thread(&LOCAL, worker, ptr::null_mut(), |_, _| 11) };
    assert_eq!(rc, 11, "the primitive's error code must propagate");
    assert_eq!(heap.live(), 0, "the wrapper record leaked");
    assert_eq!(heap.thread_starts.load(Ordering::SeqCst), 0);
}

#[test]
fn exit_hook_runs_at_most_once_per_thread() {
    hookmalloc::init::mark_hooks_ready();

    static LOCAL: HeapCell<TestHeap> = HeapCell::new();
    let heap = LOCAL.get().unwrap();

    std::thread::spawn(|| {
        let heap = LOCAL.get().unwrap();
        threads::run_exit_hook(&LOCAL);
        threads::run_exit_hook(&LOCAL);
        assert_eq!(heap.thread_exits.load(Ordering::SeqCst), 1);
    })
    .join()
    .unwrap();

    assert_eq!(heap.thread_exits.load(Ordering::SeqCst), 1);
}
