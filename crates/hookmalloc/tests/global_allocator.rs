//! The `GlobalAlloc` adapter over the bridge.

mod common;

use common::TestHeap;
use hookmalloc::{BridgeAlloc, HeapCell};
use std::alloc::{GlobalAlloc, Layout};

static CELL: HeapCell<TestHeap> = HeapCell::new();
static ADAPTER: BridgeAlloc<HeapCell<TestHeap>> = BridgeAlloc(&CELL);

#[test]
fn alloc_and_dealloc_round_trip() {
    unsafe {
        let layout = Layout::from_size_align(64, 8).unwrap();
        let p = ADAPTER.alloc(layout);
        assert!(!p.is_null());
        std::ptr::write_bytes(p, 0x42, 64);
        ADAPTER.dealloc(p, layout);
    }
}

#[test]
fn zero_sized_layouts_use_a_dangling_pointer() {
    unsafe {
        let layout = Layout::from_size_align(0, 32).unwrap();
        let p = ADAPTER.alloc(layout);
        assert_eq!(p as usize, 32);
        // Must be accepted and ignored.
        ADAPTER.dealloc(p, layout);
    }
}

#[test]
fn alloc_zeroed_is_zeroed() {
    unsafe {
        let layout = Layout::from_size_align(256, 16).unwrap();
        let p = ADAPTER.alloc_zeroed(layout);
        assert!(!p.is_null());
        assert!(std::slice::from_raw_parts(p, 256).iter().all(|&b| b == 0));
        ADAPTER.dealloc(p, layout);
    }
}

#[test]
fn over_aligned_allocations_hold_their_alignment_through_realloc() {
    unsafe {
        let layout = Layout::from_size_align(128, 256).unwrap();
        let p = ADAPTER.alloc(layout);
        assert!(!p.is_null());
        assert_eq!(p as usize % 256, 0);
        std::ptr::write_bytes(p, 0x7E, 128);

        let q = ADAPTER.realloc(p, layout, 512);
        assert!(!q.is_null());
        assert_eq!(q as usize % 256, 0);
        assert!(std::slice::from_raw_parts(q, 128).iter().all(|&b| b == 0x7E));

        ADAPTER.dealloc(q, Layout::from_size_align(512, 256).unwrap());
    }
}

#[test]
fn realloc_preserves_contents() {
    unsafe {
        let layout = Layout::from_size_align(100, 8).unwrap();
        let p = ADAPTER.alloc(layout);
        for i in 0..100 {
            p.add(i).write(i as u8);
        }
        let q = ADAPTER.realloc(p, layout, 1000);
        assert!(!q.is_null());
        for i in 0..100 {
            assert_eq!(q.add(i).read(), i as u8);
        }
        ADAPTER.dealloc(q, Layout::from_size_align(1000, 8).unwrap());
    }
}
