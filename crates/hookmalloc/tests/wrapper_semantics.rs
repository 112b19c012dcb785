//! Uniform-wrapper semantics: the ANSI long tail behaves identically on
//! every platform because it is implemented once against the bridge.

mod common;

use common::TestHeap;
use hookmalloc::{wrap, Bridge, HeapCell};
use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::ptr;

static CELL: HeapCell<TestHeap> = HeapCell::new();

const EINVAL: i32 = 22;

#[test]
fn posix_memalign_success_is_aligned() {
    unsafe {
        let mut p: *mut u8 = ptr::null_mut();
        let rc = wrap::posix_memalign(&CELL, &mut p, 4096, 4096);
        assert_eq!(rc, 0);
        assert!(!p.is_null());
        assert_eq!(p as usize % 4096, 0);
        CELL.release(p);
    }
}

#[test]
fn posix_memalign_rejects_bad_alignment() {
    unsafe {
        let mut p: *mut u8 = ptr::null_mut();
        // Not a power of two.
        assert_eq!(wrap::posix_memalign(&CELL, &mut p, 3, 64), EINVAL);
        assert!(p.is_null());
        // Power of two, but smaller than a pointer.
        assert_eq!(wrap::posix_memalign(&CELL, &mut p, 2, 64), EINVAL);
        assert!(p.is_null());
        // Zero.
        assert_eq!(wrap::posix_memalign(&CELL, &mut p, 0, 64), EINVAL);
        assert!(p.is_null());
        // Null out-pointer.
        assert_eq!(wrap::posix_memalign(&CELL, ptr::null_mut(), 16, 64), EINVAL);
    }
}

#[test]
fn aligned_alloc_requires_size_multiple_of_alignment() {
    unsafe {
        assert!(wrap::aligned_alloc(&CELL, 64, 65).is_null());
        assert!(wrap::aligned_alloc(&CELL, 0, 64).is_null());
        assert!(wrap::aligned_alloc(&CELL, 48, 48).is_null()); // not a power of two

        let p = wrap::aligned_alloc(&CELL, 64, 128);
        assert!(!p.is_null());
        assert_eq!(p as usize % 64, 0);
        CELL.release(p);
    }
}

#[test]
fn valloc_is_page_aligned() {
    unsafe {
        let page = hookmalloc::util::page_size();
        let p = wrap::valloc(&CELL, 100);
        assert!(!p.is_null());
        assert_eq!(p as usize % page, 0);
        CELL.release(p);
    }
}

#[test]
fn pvalloc_rounds_the_size_to_whole_pages() {
    unsafe {
        let page = hookmalloc::util::page_size();
        let p = wrap::pvalloc(&CELL, 1);
        assert!(!p.is_null());
        assert_eq!(p as usize % page, 0);
        // The block was requested page-rounded, so a whole page is usable.
        assert!(CELL.usable_size(p) >= page);
        CELL.release(p);
    }
}

#[test]
fn realloc_wrapper_null_pointer_allocates() {
    unsafe {
        let p = wrap::realloc(&CELL, ptr::null_mut(), 64);
        assert!(!p.is_null());
        CELL.release(p);
    }
}

#[cfg(target_os = "linux")]
#[test]
fn realloc_wrapper_zero_size_returns_null() {
    unsafe {
        let p = CELL.alloc(64);
        assert!(wrap::realloc(&CELL, p, 0).is_null());
    }
}

#[cfg(any(target_os = "macos", windows))]
#[test]
fn realloc_wrapper_zero_size_returns_minimum_allocation() {
    unsafe {
        let p = CELL.alloc(64);
        let q = wrap::realloc(&CELL, p, 0);
        assert!(!q.is_null(), "zero-hostile platforms must not return null");
        CELL.release(q);
    }
}

#[test]
fn realloc_wrapper_applies_the_shrink_threshold() {
    unsafe {
        let p = CELL.alloc(1024);
        let q = wrap::realloc(&CELL, p, 600);
        assert_eq!(q, p);
        let r = wrap::realloc(&CELL, q, 64);
        assert!(!r.is_null());
        CELL.release(r);
    }
}

#[test]
fn strdup_round_trips() {
    unsafe {
        let original = CString::new("the quick brown fox").unwrap();
        let copy = wrap::strdup(&CELL, original.as_ptr());
        assert!(!copy.is_null());
        assert_eq!(CStr::from_ptr(copy), original.as_c_str());
        CELL.release(copy as *mut u8);

        assert!(wrap::strdup(&CELL, ptr::null()).is_null());
    }
}

#[test]
fn strndup_truncates_and_terminates() {
    unsafe {
        let original = CString::new("hello world").unwrap();

        // n shorter than the string.
        let copy = wrap::strndup(&CELL, original.as_ptr(), 5);
        assert!(!copy.is_null());
        assert_eq!(CStr::from_ptr(copy).to_bytes(), b"hello");
        CELL.release(copy as *mut u8);

        // n longer than the string.
        let copy = wrap::strndup(&CELL, original.as_ptr(), 64);
        assert!(!copy.is_null());
        assert_eq!(CStr::from_ptr(copy).to_bytes(), b"hello world");
        CELL.release(copy as *mut u8);

        // n of zero yields an empty string.
        let copy = wrap::strndup(&CELL, original.as_ptr(), 0);
        assert!(!copy.is_null());
        assert_eq!(CStr::from_ptr(copy).to_bytes(), b"");
        CELL.release(copy as *mut u8);
    }
}

#[test]
fn strndup_does_not_read_past_n() {
    unsafe {
        // Not null-terminated within the first 4 bytes on purpose; n caps
        // the scan.
        let raw: [c_char; 4] = [b'a' as c_char, b'b' as c_char, b'c' as c_char, b'd' as c_char];
        let copy = wrap::strndup(&CELL, raw.as_ptr(), 4);
        assert!(!copy.is_null());
        assert_eq!(CStr::from_ptr(copy).to_bytes(), b"abcd");
        CELL.release(copy as *mut u8);
    }
}

#[test]
fn reallocarray_checks_overflow() {
    unsafe {
        let p = CELL.alloc(16);
        assert!(wrap::reallocarray(&CELL, p, usize::MAX, 2).is_null());
        // The original survives a refused reallocarray.
        CELL.release(p);

        let q = wrap::reallocarray(&CELL, ptr::null_mut(), 8, 32);
        assert!(!q.is_null());
        assert!(CELL.usable_size(q) >= 256);
        CELL.release(q);
    }
}

#[test]
fn calloc_wrapper_forwards_overflow_checks() {
    unsafe {
        assert!(wrap::calloc(&CELL, usize::MAX, 2).is_null());
        let p = wrap::calloc(&CELL, 3, 3);
        assert!(!p.is_null());
        assert!(std::slice::from_raw_parts(p, 9).iter().all(|&b| b == 0));
        CELL.release(p);
    }
}
