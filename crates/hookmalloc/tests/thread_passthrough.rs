//! Before the readiness handshake completes, thread creation must pass the
//! user routine through untouched and fire no hooks. This lives in its own
//! test binary so nothing here flips the process-wide readiness flags.

mod common;

use common::TestHeap;
use hookmalloc::threads;
use hookmalloc::HeapCell;
use std::ffi::c_void;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

static CELL: HeapCell<TestHeap> = HeapCell::new();
static RAN: AtomicUsize = AtomicUsize::new(0);

unsafe extern "C-unwind" fn start(arg: *mut c_void) -> *mut c_void {
    RAN.fetch_add(1, Ordering::SeqCst);
    arg
}

#[test]
fn creation_passes_through_while_hooks_are_not_ready() {
    assert!(!hookmalloc::init::hooks_ready());

    let heap = CELL.get().unwrap();

    let rc = unsafe {
        threads::create_thread(&CELL, start, ptr::null_mut(), |routine, raw| {
            // Pass-through hands over the user routine itself, not a
            // trampoline.
            assert_eq!(routine as usize, start as usize);
            let raw = raw as usize;
            std::thread::spawn(move || {
                unsafe { routine(raw as *mut c_void) };
            })
            .join()
            .unwrap();
            0
        })
    };

    assert_eq!(rc, 0);
    assert_eq!(RAN.load(Ordering::SeqCst), 1);
    assert_eq!(heap.thread_starts.load(Ordering::SeqCst), 0);
    assert_eq!(heap.thread_exits.load(Ordering::SeqCst), 0);
    assert!(!threads::any_thread_created());
}
