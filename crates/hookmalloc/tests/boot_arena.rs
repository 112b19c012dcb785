//! Init-buffer behavior: bump allocation, the address-range predicate, and
//! the drop-on-release policy as seen through the bridge.

mod common;

use common::TestHeap;
use hookmalloc::{boot, Bridge, HeapCell};

#[test]
fn bump_allocations_are_aligned_and_recognized() {
    let p = boot::alloc(16, 100);
    assert!(!p.is_null());
    assert_eq!(p as usize % 16, 0);
    assert!(boot::contains(p));
    assert!(boot::usable_size(p) >= 100);

    let q = boot::alloc(64, 10);
    assert!(!q.is_null());
    assert_eq!(q as usize % 64, 0);
    assert_ne!(p, q);
}

#[test]
fn exhaustion_returns_null() {
    assert!(boot::alloc(16, 1 << 20).is_null());
}

#[test]
fn pointers_outside_the_arena_are_not_claimed() {
    let local = 0u8;
    assert!(!boot::contains(&local as *const u8));
    assert!(!boot::contains(core::ptr::null()));
}

#[test]
fn bridge_drops_arena_pointers_on_release() {
    static CELL: HeapCell<TestHeap> = HeapCell::new();

    let p = boot::alloc(16, 32);
    assert!(!p.is_null());

    unsafe {
        // Released through the bridge: recognized by the range predicate and
        // dropped, never handed to the heap.
        CELL.release(p);
    }
    assert_eq!(CELL.get().unwrap().frees.load(std::sync::atomic::Ordering::SeqCst), 0);

    unsafe {
        // A reallocation of an arena pointer moves it into the heap.
        let q = CELL.realloc(p, 64);
        assert!(!q.is_null());
        assert!(!boot::contains(q));
        CELL.release(q);
    }
}
