//! Windows thread lifecycle hooks.
//!
//! Windows delivers per-module thread notifications through `DllMain`
//! (`DLL_THREAD_ATTACH` / `DLL_THREAD_DETACH`), so no creation primitive
//! needs patching. Hosts that own their `DllMain` route the callbacks
//! through the exported entry points below.

use crate::bridge::{ffi as hm, ThreadHooks, EXTERN_BRIDGE};
use crate::threads;

#[inline]
fn hooks_live() -> bool {
    crate::init::hooks_ready() && EXTERN_BRIDGE.hooks_present()
}

/// Handle `DLL_THREAD_ATTACH`: runs the heap's start hook in the new
/// thread's context, once the readiness handshake has completed.
pub fn on_thread_attach() {
    if !hooks_live() {
        return;
    }
    threads::note_thread_created();
    unsafe { hm::hm_thread_start() };
}

/// Handle `DLL_THREAD_DETACH`: runs the heap's exit hook, at most once per
/// thread.
pub fn on_thread_detach() {
    if !hooks_live() {
        return;
    }
    threads::run_exit_hook(&EXTERN_BRIDGE);
}

/// Exported variants for modules that wish to route their own `DllMain`
/// callbacks through the controller.
#[no_mangle]
pub extern "C" fn hookmalloc_on_thread_attach() {
    on_thread_attach()
}

#[no_mangle]
pub extern "C" fn hookmalloc_on_thread_detach() {
    on_thread_detach()
}

/// Whether the readiness handshake has completed.
#[no_mangle]
pub extern "C" fn hookmalloc_thread_hooks_ready() -> bool {
    crate::init::hooks_ready()
}
