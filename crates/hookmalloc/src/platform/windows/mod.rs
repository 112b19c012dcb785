//! Windows interposition.
//!
//! Two cooperating mechanisms:
//!
//! - [`hooks`]: inline patching of the CRT allocation entry points in every
//!   loaded runtime module, installed by [`install`].
//! - the sibling `hookmalloc-redirect` library: an early-load import-table
//!   redirect that patches before any allocation happens, avoiding the
//!   foreign-pointer problem entirely. When that library is present in the
//!   process, [`install`] registers the bridge with it and enables it
//!   instead of writing inline patches.
//!
//! Interception is never uninstalled at process detach; an explicit
//! [`hookmalloc_uninstall`] exists for hosts that need a clean detach while
//! the process is still healthy.

pub mod hooks;
pub mod threads;

use crate::bridge::{ffi as hm, EXTERN_BRIDGE};
use crate::wrap;
use core::ffi::c_void;
use core::sync::atomic::{AtomicBool, Ordering};

use windows_sys::Win32::Foundation::HMODULE;
use windows_sys::Win32::System::LibraryLoader::{GetModuleHandleA, GetProcAddress};
use windows_sys::Win32::System::Memory::{GetProcessHeap, HeapAlloc};
use windows_sys::Win32::System::SystemServices::{
    DLL_PROCESS_ATTACH, DLL_PROCESS_DETACH, DLL_THREAD_ATTACH, DLL_THREAD_DETACH,
};

static INSTALL_DONE: AtomicBool = AtomicBool::new(false);

type RedirectRegisterFn = unsafe extern "C" fn(
    Option<unsafe extern "C" fn(usize) -> *mut c_void>,
    Option<unsafe extern "C" fn(*mut c_void)>,
    Option<unsafe extern "C" fn(usize, usize) -> *mut c_void>,
    Option<unsafe extern "C" fn(*mut c_void, usize) -> *mut c_void>,
    Option<unsafe extern "C" fn(*mut c_void) -> usize>,
);
type RedirectEnableFn = unsafe extern "C" fn();

/// The realloc handed to the redirect library. Goes through the uniform
/// wrapper, not the raw bridge realloc, so `realloc(p, 0)` returns the
/// minimum allocation this platform requires instead of null. The redirect
/// patches before any allocation happens, so no foreign-pointer handling is
/// needed here.
unsafe extern "C" fn redirect_realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    wrap::realloc(&EXTERN_BRIDGE, ptr as *mut u8, size) as *mut c_void
}

/// If the early-load redirect library is already mapped, hand it the bridge
/// functions and flip it on. Returns true when the handshake completed.
unsafe fn redirect_handshake() -> bool {
    let module: HMODULE = GetModuleHandleA(b"hookmalloc_redirect.dll\0".as_ptr());
    if module.is_null() {
        return false;
    }
    let register = GetProcAddress(module, b"hookmalloc_redirect_register\0".as_ptr());
    let enable = GetProcAddress(module, b"hookmalloc_redirect_enable\0".as_ptr());
    let (Some(register), Some(enable)) = (register, enable) else {
        return false;
    };

    let register: RedirectRegisterFn = core::mem::transmute(register);
    let enable: RedirectEnableFn = core::mem::transmute(enable);

    register(
        Some(hm::hm_malloc),
        Some(hm::hm_free),
        Some(hm::hm_calloc),
        Some(redirect_realloc),
        Some(hm::hm_usable_size),
    );
    enable();
    true
}

/// Module entry point: force the platform heap into existence, warm the
/// bridge, install interception, open the thread-hook gate. Idempotent.
/// Returns false when no interception mechanism could be installed.
pub unsafe fn install() -> bool {
    if INSTALL_DONE.swap(true, Ordering::AcqRel) {
        return true;
    }

    // The OS heap must exist before any patched entry point can fall back
    // to it for foreign pointers allocated by other runtimes.
    HeapAlloc(GetProcessHeap(), 0, 1);

    hm::hm_warm();

    if !redirect_handshake() && !hooks::install() {
        return false;
    }

    crate::init::mark_hooks_ready();
    true
}

/// Exported install entry for injection tools that call an initializer by
/// name instead of relying on `DllMain`.
#[no_mangle]
pub unsafe extern "C" fn hookmalloc_install() -> bool {
    install()
}

/// Explicit detach: restores the patched prologues. Deliberately not wired
/// to `DLL_PROCESS_DETACH`.
#[no_mangle]
pub unsafe extern "C" fn hookmalloc_uninstall() {
    hooks::uninstall()
}

#[no_mangle]
pub unsafe extern "system" fn DllMain(
    _module: HMODULE,
    reason: u32,
    _reserved: *mut c_void,
) -> i32 {
    match reason {
        DLL_PROCESS_ATTACH => {
            // A failed install fails the module load cleanly, leaving the
            // target process on its original allocator.
            if !install() {
                return 0;
            }
        }
        DLL_THREAD_ATTACH => threads::on_thread_attach(),
        DLL_THREAD_DETACH => threads::on_thread_detach(),
        DLL_PROCESS_DETACH => {
            // Teardown races with late allocations are worse than leaked
            // patches; leave interception in place.
        }
        _ => {}
    }
    1
}
