//! Readiness handshake between the heap and the thread controller.
//!
//! Two monotonic flags with release/acquire ordering:
//!
//! ```text
//! initial: { allocator_ready = false, hooks_ready = false }  - pass through
//! heap constructed:          { true, false }                 - pass through
//! deferred initializer runs: { true, true }                  - hooks active
//! ```
//!
//! There is no transition back. The deferred initializer forces heap
//! construction first (`hm_warm`), so a thread that observes
//! `hooks_ready() == true` also observes every effect of the heap
//! constructor.

use core::sync::atomic::{AtomicBool, Ordering};

static ALLOCATOR_READY: AtomicBool = AtomicBool::new(false);
static HOOKS_READY: AtomicBool = AtomicBool::new(false);

/// Whether the singleton heap has finished constructing.
#[inline]
pub fn allocator_ready() -> bool {
    ALLOCATOR_READY.load(Ordering::Acquire)
}

/// Whether thread lifecycle hooks may fire.
#[inline]
pub fn hooks_ready() -> bool {
    HOOKS_READY.load(Ordering::Acquire)
}

/// Set by [`HeapCell`](crate::bridge::HeapCell) once construction completes.
#[inline]
pub fn mark_allocator_ready() {
    ALLOCATOR_READY.store(true, Ordering::Release);
}

/// Flip the hook gate. The caller must have forced heap construction first.
#[inline]
pub fn mark_hooks_ready() {
    HOOKS_READY.store(true, Ordering::Release);
}

/// Initializer for the ELF build. Forcing heap construction before the
/// release-store makes the ordering self-contained: whatever constructor
/// order the loader picks, hooks-ready implies allocator-ready.
#[cfg(all(feature = "interpose", target_os = "linux"))]
#[used]
#[link_section = ".init_array.00200"]
static HOOKS_CTOR: unsafe extern "C" fn() = {
    unsafe extern "C" fn hooks_init() {
        crate::bridge::ffi::hm_warm();
        crate::fork::install();
        mark_hooks_ready();
    }
    hooks_init
};

/// Module initializer for the Mach-O build. The synthesized zone is a const
/// static and therefore exists before any initializer runs; this only has to
/// force heap construction and open the hook gate.
#[cfg(all(feature = "interpose", target_os = "macos"))]
#[used]
#[link_section = "__DATA,__mod_init_func"]
static HOOKS_CTOR: unsafe extern "C" fn() = {
    unsafe extern "C" fn hooks_init() {
        crate::bridge::ffi::hm_warm();
        mark_hooks_ready();
    }
    hooks_init
};
