//! Early-load import-table redirect for hookmalloc on Windows.
//!
//! Loaded as a dependency of the main interposition DLL, this library runs
//! its patching in `DLL_PROCESS_ATTACH` before the main DLL's initializers
//! and therefore before any allocation happens, which avoids the
//! foreign-pointer problem entirely. It walks every loaded module's import
//! address table and, for each import resolved from a known CRT DLL,
//! replaces the allocation entries with hooks.
//!
//! The hooks consult a global enabled flag on every call and fall back to
//! the captured originals while it is false, so the main DLL gets atomic
//! enable/disable semantics: it registers the bridge functions with
//! [`hookmalloc_redirect_register`] and flips the flag with
//! [`hookmalloc_redirect_enable`].
//!
//! Only import tables are patched; calls internal to an already-loaded
//! module do not go through the IAT and are not redirected. The inline
//! patcher in the main library catches those when it is used instead.

#![cfg(windows)]

use core::ffi::c_void;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use windows_sys::Win32::Foundation::{HMODULE, BOOL};
use windows_sys::Win32::System::Diagnostics::Debug::{
    IMAGE_DIRECTORY_ENTRY_IMPORT, IMAGE_NT_HEADERS64,
};
use windows_sys::Win32::System::Memory::{VirtualProtect, PAGE_READWRITE};
use windows_sys::Win32::System::ProcessStatus::K32EnumProcessModules;
use windows_sys::Win32::System::SystemServices::{
    DLL_PROCESS_ATTACH, DLL_PROCESS_DETACH, IMAGE_DOS_HEADER, IMAGE_DOS_SIGNATURE,
    IMAGE_IMPORT_BY_NAME, IMAGE_IMPORT_DESCRIPTOR, IMAGE_NT_SIGNATURE, IMAGE_ORDINAL_FLAG64,
};
use windows_sys::Win32::System::Threading::GetCurrentProcess;

// ---------------------------------------------------------------------------
// Registered bridge functions and captured originals
// ---------------------------------------------------------------------------

type MallocFn = unsafe extern "C" fn(usize) -> *mut c_void;
type FreeFn = unsafe extern "C" fn(*mut c_void);
type CallocFn = unsafe extern "C" fn(usize, usize) -> *mut c_void;
type ReallocFn = unsafe extern "C" fn(*mut c_void, usize) -> *mut c_void;
type MsizeFn = unsafe extern "C" fn(*mut c_void) -> usize;

static BRIDGE_MALLOC: AtomicUsize = AtomicUsize::new(0);
static BRIDGE_FREE: AtomicUsize = AtomicUsize::new(0);
static BRIDGE_CALLOC: AtomicUsize = AtomicUsize::new(0);
static BRIDGE_REALLOC: AtomicUsize = AtomicUsize::new(0);
static BRIDGE_MSIZE: AtomicUsize = AtomicUsize::new(0);

static ORIG_MALLOC: AtomicUsize = AtomicUsize::new(0);
static ORIG_FREE: AtomicUsize = AtomicUsize::new(0);
static ORIG_CALLOC: AtomicUsize = AtomicUsize::new(0);
static ORIG_REALLOC: AtomicUsize = AtomicUsize::new(0);
static ORIG_MSIZE: AtomicUsize = AtomicUsize::new(0);

static ENABLED: AtomicBool = AtomicBool::new(false);
static INITIALIZED: AtomicBool = AtomicBool::new(false);

#[inline]
fn enabled() -> bool {
    ENABLED.load(Ordering::Acquire)
}

// ---------------------------------------------------------------------------
// Hooks
// ---------------------------------------------------------------------------
// Each hook is what lands in the patched IAT slots. While the redirect is
// disabled they behave exactly like the originals they replaced.

unsafe extern "C" fn hooked_malloc(size: usize) -> *mut c_void {
    if enabled() {
        let bridge = BRIDGE_MALLOC.load(Ordering::Acquire);
        if bridge != 0 {
            let bridge: MallocFn = core::mem::transmute(bridge);
            return bridge(size);
        }
    }
    let orig = ORIG_MALLOC.load(Ordering::Acquire);
    if orig != 0 {
        let orig: MallocFn = core::mem::transmute(orig);
        orig(size)
    } else {
        ptr::null_mut()
    }
}

unsafe extern "C" fn hooked_free(ptr: *mut c_void) {
    if enabled() {
        let bridge = BRIDGE_FREE.load(Ordering::Acquire);
        if bridge != 0 {
            let bridge: FreeFn = core::mem::transmute(bridge);
            return bridge(ptr);
        }
    }
    let orig = ORIG_FREE.load(Ordering::Acquire);
    if orig != 0 {
        let orig: FreeFn = core::mem::transmute(orig);
        orig(ptr)
    }
}

unsafe extern "C" fn hooked_calloc(count: usize, size: usize) -> *mut c_void {
    if enabled() {
        let bridge = BRIDGE_CALLOC.load(Ordering::Acquire);
        if bridge != 0 {
            let bridge: CallocFn = core::mem::transmute(bridge);
            return bridge(count, size);
        }
    }
    let orig = ORIG_CALLOC.load(Ordering::Acquire);
    if orig != 0 {
        let orig: CallocFn = core::mem::transmute(orig);
        orig(count, size)
    } else {
        ptr::null_mut()
    }
}

unsafe extern "C" fn hooked_realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    if enabled() {
        let bridge = BRIDGE_REALLOC.load(Ordering::Acquire);
        if bridge != 0 {
            let bridge: ReallocFn = core::mem::transmute(bridge);
            return bridge(ptr, size);
        }
    }
    let orig = ORIG_REALLOC.load(Ordering::Acquire);
    if orig != 0 {
        let orig: ReallocFn = core::mem::transmute(orig);
        orig(ptr, size)
    } else {
        ptr::null_mut()
    }
}

unsafe extern "C" fn hooked_msize(ptr: *mut c_void) -> usize {
    if enabled() {
        let bridge = BRIDGE_MSIZE.load(Ordering::Acquire);
        if bridge != 0 {
            let bridge: MsizeFn = core::mem::transmute(bridge);
            return bridge(ptr);
        }
    }
    let orig = ORIG_MSIZE.load(Ordering::Acquire);
    if orig != 0 {
        let orig: MsizeFn = core::mem::transmute(orig);
        orig(ptr)
    } else {
        0
    }
}

// ---------------------------------------------------------------------------
// IAT patching
// ---------------------------------------------------------------------------

/// CRT DLLs whose imports get redirected.
const CRT_DLLS: [&[u8]; 4] = [
    b"ucrtbase.dll",
    b"ucrtbased.dll",
    b"api-ms-win-crt-heap-l1-1-0.dll",
    b"msvcrt.dll",
];

struct Patch {
    name: &'static [u8],
    hook: *const c_void,
    orig: &'static AtomicUsize,
}

unsafe impl Sync for Patch {}

static IAT_PATCHES: [Patch; 5] = [
    Patch {
        name: b"malloc",
        hook: hooked_malloc as *const c_void,
        orig: &ORIG_MALLOC,
    },
    Patch {
        name: b"free",
        hook: hooked_free as *const c_void,
        orig: &ORIG_FREE,
    },
    Patch {
        name: b"calloc",
        hook: hooked_calloc as *const c_void,
        orig: &ORIG_CALLOC,
    },
    Patch {
        name: b"realloc",
        hook: hooked_realloc as *const c_void,
        orig: &ORIG_REALLOC,
    },
    Patch {
        name: b"_msize",
        hook: hooked_msize as *const c_void,
        orig: &ORIG_MSIZE,
    },
];

fn ascii_eq_ignore_case(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len()
        && a.iter()
            .zip(b)
            .all(|(x, y)| x.to_ascii_lowercase() == y.to_ascii_lowercase())
}

unsafe fn cstr_bytes<'a>(ptr: *const u8) -> &'a [u8] {
    let mut len = 0usize;
    while *ptr.add(len) != 0 {
        len += 1;
    }
    core::slice::from_raw_parts(ptr, len)
}

/// Swap one IAT slot, remembering the original the first time.
unsafe fn patch_slot(slot: *mut usize, hook: *const c_void, orig: &AtomicUsize) -> bool {
    let mut old_protect = 0u32;
    if VirtualProtect(
        slot as *mut c_void,
        core::mem::size_of::<usize>(),
        PAGE_READWRITE,
        &mut old_protect,
    ) == 0
    {
        return false;
    }

    let _ = orig.compare_exchange(0, *slot, Ordering::Release, Ordering::Acquire);
    *slot = hook as usize;

    VirtualProtect(
        slot as *mut c_void,
        core::mem::size_of::<usize>(),
        old_protect,
        &mut old_protect,
    );
    true
}

/// Walk one module's import descriptors and patch matching entries.
#[cfg(target_pointer_width = "64")]
unsafe fn patch_module(module: HMODULE) -> usize {
    let base = module as *const u8;
    if base.is_null() {
        return 0;
    }

    let dos = base as *const IMAGE_DOS_HEADER;
    if (*dos).e_magic != IMAGE_DOS_SIGNATURE {
        return 0;
    }
    let nt = base.add((*dos).e_lfanew as usize) as *const IMAGE_NT_HEADERS64;
    if (*nt).Signature != IMAGE_NT_SIGNATURE {
        return 0;
    }

    let import_dir =
        (*nt).OptionalHeader.DataDirectory[IMAGE_DIRECTORY_ENTRY_IMPORT as usize];
    if import_dir.VirtualAddress == 0 {
        return 0;
    }

    let mut patched = 0usize;
    let mut descriptor =
        base.add(import_dir.VirtualAddress as usize) as *const IMAGE_IMPORT_DESCRIPTOR;

    while (*descriptor).Name != 0 {
        let dll_name = cstr_bytes(base.add((*descriptor).Name as usize));
        if CRT_DLLS
            .iter()
            .any(|crt| ascii_eq_ignore_case(dll_name, crt))
        {
            let original_first_thunk = (*descriptor).Anonymous.OriginalFirstThunk;
            if original_first_thunk != 0 {
                let mut name_thunk =
                    base.add(original_first_thunk as usize) as *const u64;
                let mut iat_thunk =
                    base.add((*descriptor).FirstThunk as usize) as *mut usize;

                while *name_thunk != 0 {
                    if *name_thunk & IMAGE_ORDINAL_FLAG64 == 0 {
                        let by_name =
                            base.add(*name_thunk as usize) as *const IMAGE_IMPORT_BY_NAME;
                        let func_name = cstr_bytes((*by_name).Name.as_ptr() as *const u8);
                        for patch in &IAT_PATCHES {
                            if func_name == patch.name
                                && patch_slot(iat_thunk, patch.hook, patch.orig)
                            {
                                patched += 1;
                            }
                        }
                    }
                    name_thunk = name_thunk.add(1);
                    iat_thunk = iat_thunk.add(1);
                }
            }
        }
        descriptor = descriptor.add(1);
    }

    patched
}

#[cfg(not(target_pointer_width = "64"))]
unsafe fn patch_module(_module: HMODULE) -> usize {
    0
}

/// Patch every loaded module. Runs in `DLL_PROCESS_ATTACH`, before the main
/// interposition DLL's own initializers.
unsafe fn install_patches() {
    let mut modules = [ptr::null_mut::<c_void>() as HMODULE; 1024];
    let mut needed = 0u32;
    if K32EnumProcessModules(
        GetCurrentProcess(),
        modules.as_mut_ptr(),
        core::mem::size_of_val(&modules) as u32,
        &mut needed,
    ) == 0
    {
        return;
    }
    let count = (needed as usize / core::mem::size_of::<HMODULE>()).min(modules.len());
    for &module in &modules[..count] {
        patch_module(module);
    }
}

// ---------------------------------------------------------------------------
// Exported control surface
// ---------------------------------------------------------------------------

/// Receive the bridge function pointers from the main interposition DLL.
#[no_mangle]
pub unsafe extern "C" fn hookmalloc_redirect_register(
    malloc_fn: Option<MallocFn>,
    free_fn: Option<FreeFn>,
    calloc_fn: Option<CallocFn>,
    realloc_fn: Option<ReallocFn>,
    msize_fn: Option<MsizeFn>,
) {
    if let Some(f) = malloc_fn {
        BRIDGE_MALLOC.store(f as usize, Ordering::Release);
    }
    if let Some(f) = free_fn {
        BRIDGE_FREE.store(f as usize, Ordering::Release);
    }
    if let Some(f) = calloc_fn {
        BRIDGE_CALLOC.store(f as usize, Ordering::Release);
    }
    if let Some(f) = realloc_fn {
        BRIDGE_REALLOC.store(f as usize, Ordering::Release);
    }
    if let Some(f) = msize_fn {
        BRIDGE_MSIZE.store(f as usize, Ordering::Release);
    }
}

/// Route patched entries into the registered bridge.
#[no_mangle]
pub extern "C" fn hookmalloc_redirect_enable() {
    ENABLED.store(true, Ordering::Release);
}

/// Fall back to the captured originals.
#[no_mangle]
pub extern "C" fn hookmalloc_redirect_disable() {
    ENABLED.store(false, Ordering::Release);
}

#[no_mangle]
pub extern "C" fn hookmalloc_redirect_is_enabled() -> bool {
    enabled()
}

#[no_mangle]
pub extern "C" fn hookmalloc_redirect_is_initialized() -> bool {
    INITIALIZED.load(Ordering::Acquire)
}

#[no_mangle]
pub unsafe extern "system" fn DllMain(
    _module: HMODULE,
    reason: u32,
    _reserved: *mut c_void,
) -> BOOL {
    match reason {
        DLL_PROCESS_ATTACH => {
            install_patches();
            INITIALIZED.store(true, Ordering::Release);
        }
        DLL_PROCESS_DETACH => {
            ENABLED.store(false, Ordering::Release);
        }
        _ => {}
    }
    1
}
