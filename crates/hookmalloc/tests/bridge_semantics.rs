//! Bridge-layer semantics: singleton behavior, the eight canonical
//! operations, and the synthesized realloc rules.

mod common;

use common::{TestHeap, REFUSE_AT};
use hookmalloc::{Bridge, HeapCell};
use std::ptr;

static CELL: HeapCell<TestHeap> = HeapCell::new();

#[test]
fn heap_is_observed_at_one_address_forever() {
    let first = CELL.get().unwrap() as *const TestHeap;
    let second = CELL.get().unwrap() as *const TestHeap;
    assert_eq!(first, second);
}

#[test]
fn basic_round_trip() {
    unsafe {
        let p = CELL.alloc(100);
        assert!(!p.is_null());
        assert_eq!(p as usize % 16, 0, "below minimum alignment");
        ptr::write_bytes(p, 0xAB, 100);
        assert!(CELL.usable_size(p) >= 100);
        CELL.release(p);
    }
}

#[test]
fn release_null_is_noop() {
    unsafe {
        CELL.release(ptr::null_mut());
    }
}

#[test]
fn usable_size_of_null_is_zero() {
    unsafe {
        assert_eq!(CELL.usable_size(ptr::null_mut()), 0);
    }
}

#[test]
fn alloc_zero_is_releasable() {
    unsafe {
        let p = CELL.alloc(0);
        assert!(!p.is_null());
        CELL.release(p);
    }
}

#[test]
fn exhaustion_reports_null() {
    unsafe {
        assert!(CELL.alloc(REFUSE_AT).is_null());
    }
}

#[test]
fn calloc_zeroes_and_checks_overflow() {
    unsafe {
        let p = CELL.calloc(10, 4);
        assert!(!p.is_null());
        let bytes = std::slice::from_raw_parts(p, 40);
        assert!(bytes.iter().all(|&b| b == 0));
        CELL.release(p);

        assert!(CELL.calloc(usize::MAX, usize::MAX).is_null());
        assert!(CELL.calloc(usize::MAX / 2 + 1, 2).is_null());
    }
}

#[test]
fn realloc_null_acts_as_alloc() {
    unsafe {
        let p = CELL.realloc(ptr::null_mut(), 128);
        assert!(!p.is_null());
        ptr::write_bytes(p, 0x5A, 128);
        CELL.release(p);
    }
}

#[test]
fn realloc_zero_releases_and_returns_null() {
    // A private cell so the leak accounting cannot race with other tests.
    static LOCAL: HeapCell<TestHeap> = HeapCell::new();
    unsafe {
        let p = LOCAL.alloc(64);
        let q = LOCAL.realloc(p, 0);
        assert!(q.is_null());
        assert_eq!(LOCAL.get().unwrap().live(), 0);
    }
}

#[test]
fn realloc_growth_preserves_contents() {
    unsafe {
        let p = CELL.alloc(100);
        ptr::write_bytes(p, b'A', 100);
        let q = CELL.realloc(p, 1000);
        assert!(!q.is_null());
        let bytes = std::slice::from_raw_parts(q, 100);
        assert!(bytes.iter().all(|&b| b == b'A'));
        CELL.release(q);
    }
}

#[test]
fn realloc_small_shrink_keeps_the_pointer() {
    unsafe {
        let p = CELL.alloc(1000);
        // 600 still occupies more than half of the 1000 usable bytes.
        let q = CELL.realloc(p, 600);
        assert_eq!(q, p);
        CELL.release(q);
    }
}

#[test]
fn realloc_large_shrink_preserves_prefix() {
    unsafe {
        let p = CELL.alloc(1000);
        for i in 0..1000 {
            p.add(i).write((i & 0xFF) as u8);
        }
        let q = CELL.realloc(p, 100);
        assert!(!q.is_null());
        for i in 0..100 {
            assert_eq!(q.add(i).read(), (i & 0xFF) as u8, "byte {} corrupted", i);
        }
        CELL.release(q);
    }
}

#[test]
fn failed_realloc_preserves_the_original() {
    unsafe {
        let p = CELL.alloc(100);
        ptr::write_bytes(p, 0xEE, 100);
        let q = CELL.realloc(p, REFUSE_AT);
        assert!(q.is_null());
        // p must still be live with its contents intact.
        let bytes = std::slice::from_raw_parts(p, 100);
        assert!(bytes.iter().all(|&b| b == 0xEE));
        CELL.release(p);
    }
}

#[test]
fn aligned_alloc_honors_alignment() {
    unsafe {
        for &align in &[16usize, 32, 64, 256, 4096] {
            let p = CELL.alloc_aligned(align, 100);
            assert!(!p.is_null());
            assert_eq!(p as usize % align, 0, "alignment {} violated", align);
            CELL.release(p);
        }
    }
}

#[test]
fn lock_unlock_reach_the_heap_in_fork_order() {
    use std::sync::atomic::Ordering;

    static LOCAL: HeapCell<TestHeap> = HeapCell::new();
    let heap = LOCAL.get().unwrap();

    // prepare / parent, then prepare / child: both sides unlock exactly once
    // per lock.
    LOCAL.lock();
    LOCAL.unlock();
    LOCAL.lock();
    LOCAL.unlock();

    assert_eq!(heap.locks.load(Ordering::SeqCst), 2);
    assert_eq!(heap.unlocks.load(Ordering::SeqCst), 2);
}

#[test]
fn no_blocks_leak_across_a_burst() {
    static LOCAL: HeapCell<TestHeap> = HeapCell::new();
    unsafe {
        let mut ptrs = Vec::new();
        for i in 0..256usize {
            ptrs.push(LOCAL.alloc(1 + (i * 37) % 4096));
        }
        for p in ptrs {
            LOCAL.release(p);
        }
        assert_eq!(LOCAL.get().unwrap().live(), 0);
    }
}
