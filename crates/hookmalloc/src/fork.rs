//! Fork safety: one transaction binding the three `pthread_atfork` phases to
//! the bridge lock.
//!
//! The pre-fork handler takes the heap's outermost lock so no heap-internal
//! lock is held across the `fork`. Parent and child both unlock; the child
//! inherits the heap locked and releases it immediately, preserving the
//! heap's internal invariants across the fork boundary.
//!
//! The Mach-O build does not use this module: there the platform's own fork
//! phases (`_malloc_fork_prepare` / `_parent` / `_child`) are interposed
//! directly by the zone layer.

#[cfg(all(feature = "interpose", target_os = "linux"))]
pub unsafe fn install() {
    unsafe extern "C" fn prepare() {
        crate::bridge::ffi::hm_lock();
    }
    unsafe extern "C" fn release() {
        crate::bridge::ffi::hm_unlock();
    }
    libc::pthread_atfork(Some(prepare), Some(release), Some(release));
}
