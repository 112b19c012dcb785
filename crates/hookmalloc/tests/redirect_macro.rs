//! The `redirect_heap!` seam: the generated bridge symbols must route into
//! the bound heap with the bridge semantics intact.

mod common;

use common::TestHeap;
use std::ptr;
use std::sync::atomic::Ordering;

hookmalloc::redirect_heap!(TestHeap);

#[test]
fn bridge_symbols_route_into_the_heap() {
    unsafe {
        hm_warm();

        let p = hm_malloc(100);
        assert!(!p.is_null());
        ptr::write_bytes(p as *mut u8, 0xAB, 100);
        assert!(hm_usable_size(p) >= 100);
        hm_free(p);

        let z = hm_calloc(8, 16);
        assert!(!z.is_null());
        assert!(std::slice::from_raw_parts(z as *const u8, 128)
            .iter()
            .all(|&b| b == 0));
        hm_free(z);

        let a = hm_memalign(256, 64);
        assert!(!a.is_null());
        assert_eq!(a as usize % 256, 0);
        hm_free(a);

        hm_free(ptr::null_mut());
    }
}

#[test]
fn generated_realloc_keeps_small_shrinks_in_place() {
    unsafe {
        let p = hm_realloc(ptr::null_mut(), 1000);
        assert!(!p.is_null());
        let q = hm_realloc(p, 700);
        assert_eq!(q, p);
        assert!(hm_realloc(q, 0).is_null());
    }
}

#[test]
fn capability_and_hook_symbols_reflect_the_heap() {
    assert!(hm_thread_hooks_present());

    let heap = __HOOKMALLOC_CELL.get().unwrap();
    let starts = heap.thread_starts.load(Ordering::SeqCst);
    let exits = heap.thread_exits.load(Ordering::SeqCst);
    unsafe {
        hm_thread_start();
        hm_thread_exit();
        hm_lock();
        hm_unlock();
    }
    assert_eq!(heap.thread_starts.load(Ordering::SeqCst), starts + 1);
    assert_eq!(heap.thread_exits.load(Ordering::SeqCst), exits + 1);
    assert_eq!(
        heap.locks.load(Ordering::SeqCst),
        heap.unlocks.load(Ordering::SeqCst)
    );
}
