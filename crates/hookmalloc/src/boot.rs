//! Init buffer: a fixed bump arena for allocations that arrive while the
//! user heap is still constructing.
//!
//! The heap is built lazily on first use, and its constructor may itself
//! allocate (directly, or through dlsym and friends). Those reentrant calls
//! land here. The arena is append-only, written by the single constructing
//! thread; once the heap is ready it is only consulted for the address-range
//! check. Arena pointers are never handed back: release is a silent drop.

use crate::util::align_up;
use core::ptr;
use core::sync::atomic::{AtomicUsize, Ordering};

const ARENA_SIZE: usize = 64 * 1024;

static ARENA_USED: AtomicUsize = AtomicUsize::new(0);
static mut ARENA: [u8; ARENA_SIZE] = [0u8; ARENA_SIZE];

#[inline]
fn arena_base() -> usize {
    unsafe { ptr::addr_of!(ARENA) as usize }
}

/// Bump-allocate `size` bytes at `align`. Returns null when the arena is
/// exhausted. The CAS loop keeps the cursor consistent even if a second
/// thread ever raced in here.
pub fn alloc(align: usize, size: usize) -> *mut u8 {
    debug_assert!(align.is_power_of_two());
    let reserve = match size.checked_add(align - 1) {
        Some(total) => align_up(total, 16),
        None => return ptr::null_mut(),
    };
    loop {
        let offset = ARENA_USED.load(Ordering::Relaxed);
        if offset + reserve > ARENA_SIZE {
            return ptr::null_mut();
        }
        if ARENA_USED
            .compare_exchange_weak(
                offset,
                offset + reserve,
                Ordering::Relaxed,
                Ordering::Relaxed,
            )
            .is_ok()
        {
            let raw = arena_base() + offset;
            return align_up(raw, align) as *mut u8;
        }
    }
}

/// Whether `ptr` was served from the arena.
#[inline]
pub fn contains(ptr: *const u8) -> bool {
    let base = arena_base();
    (base..base + ARENA_SIZE).contains(&(ptr as usize))
}

/// Conservative usable size for an arena pointer: the distance to the end of
/// the arena. Always at least the size that was requested, and never reads
/// outside the arena when used as a copy bound.
#[inline]
pub fn usable_size(ptr: *const u8) -> usize {
    debug_assert!(contains(ptr));
    arena_base() + ARENA_SIZE - ptr as usize
}
