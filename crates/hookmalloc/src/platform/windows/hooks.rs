//! CRT entry-point patching.
//!
//! At install time every loaded module whose file name matches the C or C++
//! runtime naming patterns is searched for the allocation entry points, and
//! each resolved entry gets an inline jump to the matching detour. The edit
//! runs as a transaction with every other thread suspended. Detach restores
//! the saved prologue bytes, but is never invoked at process teardown:
//! teardown races with late allocations are worse than leaked patches.
//!
//! Pointers allocated before the patches landed ("foreign" pointers) are
//! classified per call by the size probe: a zero usable size means the heap
//! does not own the pointer. Foreign frees are dropped, foreign reallocs
//! copy without freeing, foreign size queries report zero.

use crate::bridge::{ffi as hm, EXTERN_BRIDGE};
use crate::wrap;
use core::cell::UnsafeCell;
use core::ffi::{c_char, c_int, c_void};
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use windows_sys::Win32::Foundation::{CloseHandle, HANDLE, HMODULE, INVALID_HANDLE_VALUE};
use windows_sys::Win32::System::Diagnostics::Debug::FlushInstructionCache;
use windows_sys::Win32::System::Diagnostics::ToolHelp::{
    CreateToolhelp32Snapshot, Thread32First, Thread32Next, TH32CS_SNAPTHREAD, THREADENTRY32,
};
use windows_sys::Win32::System::LibraryLoader::{GetModuleFileNameA, GetProcAddress};
use windows_sys::Win32::System::Memory::{
    VirtualProtect, VirtualQuery, MEMORY_BASIC_INFORMATION, PAGE_EXECUTE_READWRITE,
};
use windows_sys::Win32::System::ProcessStatus::K32EnumProcessModules;
use windows_sys::Win32::System::Threading::{
    GetCurrentProcess, GetCurrentProcessId, GetCurrentThreadId, OpenThread, ResumeThread,
    SuspendThread, THREAD_SUSPEND_RESUME,
};

// ---------------------------------------------------------------------------
// Jump encodings
// ---------------------------------------------------------------------------

/// 64-bit absolute jump: FF 25 00000000 (JMP [RIP+0]) followed by the
/// target address.
#[cfg(target_pointer_width = "64")]
#[repr(C, packed)]
struct Jump {
    opcode: u16,
    disp: u32,
    addr: u64,
}

#[cfg(target_pointer_width = "64")]
impl Jump {
    fn to(target: usize, _from: usize) -> Jump {
        Jump {
            opcode: 0x25FF,
            disp: 0,
            addr: target as u64,
        }
    }
}

/// 32-bit relative jump: E9 rel32.
#[cfg(target_pointer_width = "32")]
#[repr(C, packed)]
struct Jump {
    opcode: u8,
    rel: u32,
}

#[cfg(target_pointer_width = "32")]
impl Jump {
    fn to(target: usize, from: usize) -> Jump {
        Jump {
            opcode: 0xE9,
            rel: target
                .wrapping_sub(from.wrapping_add(core::mem::size_of::<Jump>()))
                as u32,
        }
    }
}

const JUMP_SIZE: usize = core::mem::size_of::<Jump>();

// ---------------------------------------------------------------------------
// Patch bookkeeping
// ---------------------------------------------------------------------------

const MAX_PATCHES: usize = 512;

struct Applied {
    target: usize,
    saved: [u8; JUMP_SIZE],
}

struct PatchLog {
    entries: UnsafeCell<[Applied; MAX_PATCHES]>,
    count: AtomicUsize,
}

// Written only inside the install/detach transactions, which run with every
// other thread suspended.
unsafe impl Sync for PatchLog {}

static PATCH_LOG: PatchLog = PatchLog {
    entries: UnsafeCell::new(
        [const {
            Applied {
                target: 0,
                saved: [0; JUMP_SIZE],
            }
        }; MAX_PATCHES],
    ),
    count: AtomicUsize::new(0),
};

static INSTALLED: AtomicBool = AtomicBool::new(false);

/// One intercepted entry point: export name, detour, and the first resolved
/// original (kept for diagnostics and the redirect handshake fallback).
struct PatchEntry {
    name: &'static [u8],
    detour: *const c_void,
    original: AtomicUsize,
}

unsafe impl Sync for PatchEntry {}

macro_rules! patch_entry {
    ($name:literal, $detour:path) => {
        PatchEntry {
            name: $name,
            detour: $detour as *const c_void,
            original: AtomicUsize::new(0),
        }
    };
}

// ---------------------------------------------------------------------------
// Detours
// ---------------------------------------------------------------------------

#[inline]
unsafe fn probe_size(ptr: *mut c_void) -> usize {
    if ptr.is_null() {
        return 0;
    }
    hm::hm_usable_size(ptr)
}

#[inline]
unsafe fn is_ours(ptr: *mut c_void) -> bool {
    probe_size(ptr) > 0
}

unsafe extern "C" fn detour_malloc(size: usize) -> *mut c_void {
    hm::hm_malloc(size)
}

unsafe extern "C" fn detour_free(ptr: *mut c_void) {
    if ptr.is_null() {
        return;
    }
    // Foreign pointers are dropped silently.
    if is_ours(ptr) {
        hm::hm_free(ptr);
    }
}

unsafe extern "C" fn detour_calloc(count: usize, size: usize) -> *mut c_void {
    hm::hm_calloc(count, size)
}

unsafe extern "C" fn detour_realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    if ptr.is_null() {
        return hm::hm_malloc(size);
    }
    if size == 0 {
        if is_ours(ptr) {
            hm::hm_free(ptr);
        }
        return hm::hm_malloc(1);
    }

    let original_size = probe_size(ptr);
    if original_size == 0 {
        // Foreign pointer: allocate and copy best-effort, never free it.
        let new = hm::hm_malloc(size);
        if !new.is_null() {
            ptr::copy_nonoverlapping(ptr as *const u8, new as *mut u8, size);
        }
        return new;
    }

    wrap::realloc(&EXTERN_BRIDGE, ptr as *mut u8, size) as *mut c_void
}

unsafe extern "C" fn detour_msize(ptr: *mut c_void) -> usize {
    probe_size(ptr)
}

// In-place expansion is not supported; returning null tells the CRT to fall
// back to realloc.
unsafe extern "C" fn detour_expand(_ptr: *mut c_void, _size: usize) -> *mut c_void {
    ptr::null_mut()
}

unsafe extern "C" fn detour_recalloc(ptr: *mut c_void, num: usize, size: usize) -> *mut c_void {
    let requested = match num.checked_mul(size) {
        Some(total) => total,
        None => return ptr::null_mut(),
    };
    // The growth region starts at the old allocation size; capture it before
    // the realloc replaces the block. A null input grows from zero. For a
    // foreign pointer the old size is unknowable, so the copied bytes are
    // left as-is.
    let old_size = probe_size(ptr);
    let foreign = !ptr.is_null() && old_size == 0;
    let new = detour_realloc(ptr, requested);
    if !new.is_null() && !foreign && old_size < requested {
        ptr::write_bytes((new as *mut u8).add(old_size), 0, requested - old_size);
    }
    new
}

unsafe extern "C" fn detour_strdup(s: *const c_char) -> *mut c_char {
    wrap::strdup(&EXTERN_BRIDGE, s)
}

unsafe extern "C" fn detour_aligned_malloc(size: usize, align: usize) -> *mut c_void {
    // _aligned_malloc takes (size, alignment), reversed from memalign.
    hm::hm_memalign(align, size)
}

unsafe extern "C" fn detour_aligned_free(ptr: *mut c_void) {
    detour_free(ptr)
}

// Debug-CRT variants: the extra bookkeeping arguments are ignored.

unsafe extern "C" fn detour_malloc_dbg(
    size: usize,
    _block_use: c_int,
    _file: *const c_char,
    _line: c_int,
) -> *mut c_void {
    hm::hm_malloc(size)
}

unsafe extern "C" fn detour_free_dbg(ptr: *mut c_void, _block_use: c_int) {
    detour_free(ptr)
}

unsafe extern "C" fn detour_realloc_dbg(
    ptr: *mut c_void,
    size: usize,
    _block_use: c_int,
    _file: *const c_char,
    _line: c_int,
) -> *mut c_void {
    detour_realloc(ptr, size)
}

unsafe extern "C" fn detour_calloc_dbg(
    count: usize,
    size: usize,
    _block_use: c_int,
    _file: *const c_char,
    _line: c_int,
) -> *mut c_void {
    hm::hm_calloc(count, size)
}

unsafe extern "C" fn detour_msize_dbg(ptr: *mut c_void, _block_use: c_int) -> usize {
    probe_size(ptr)
}

// ---------------------------------------------------------------------------
// Patch table
// ---------------------------------------------------------------------------

static PATCHES: [PatchEntry; 32] = [
    // Standard C allocation.
    patch_entry!(b"malloc\0", detour_malloc),
    patch_entry!(b"free\0", detour_free),
    patch_entry!(b"calloc\0", detour_calloc),
    patch_entry!(b"realloc\0", detour_realloc),
    patch_entry!(b"_msize\0", detour_msize),
    patch_entry!(b"_expand\0", detour_expand),
    patch_entry!(b"_recalloc\0", detour_recalloc),
    patch_entry!(b"strdup\0", detour_strdup),
    patch_entry!(b"_strdup\0", detour_strdup),
    patch_entry!(b"_aligned_malloc\0", detour_aligned_malloc),
    patch_entry!(b"_aligned_free\0", detour_aligned_free),
    // CRT internal variants.
    patch_entry!(b"_malloc_base\0", detour_malloc),
    patch_entry!(b"_malloc_crt\0", detour_malloc),
    patch_entry!(b"_free_base\0", detour_free),
    patch_entry!(b"_free_crt\0", detour_free),
    patch_entry!(b"_realloc_base\0", detour_realloc),
    patch_entry!(b"_realloc_crt\0", detour_realloc),
    patch_entry!(b"_calloc_base\0", detour_calloc),
    patch_entry!(b"_calloc_crt\0", detour_calloc),
    // Debug CRT.
    patch_entry!(b"_malloc_dbg\0", detour_malloc_dbg),
    patch_entry!(b"_free_dbg\0", detour_free_dbg),
    patch_entry!(b"_realloc_dbg\0", detour_realloc_dbg),
    patch_entry!(b"_calloc_dbg\0", detour_calloc_dbg),
    patch_entry!(b"_msize_dbg\0", detour_msize_dbg),
    // C++ operators, 64-bit manglings.
    patch_entry!(b"??2@YAPEAX_K@Z\0", detour_malloc),
    patch_entry!(b"??_U@YAPEAX_K@Z\0", detour_malloc),
    patch_entry!(b"??3@YAXPEAX@Z\0", detour_free),
    patch_entry!(b"??_V@YAXPEAX@Z\0", detour_free),
    // C++ operators, 32-bit manglings.
    patch_entry!(b"??2@YAPAXI@Z\0", detour_malloc),
    patch_entry!(b"??_U@YAPAXI@Z\0", detour_malloc),
    patch_entry!(b"??3@YAXPAX@Z\0", detour_free),
    patch_entry!(b"??_V@YAXPAX@Z\0", detour_free),
];

// ---------------------------------------------------------------------------
// Module matching
// ---------------------------------------------------------------------------

fn name_matches_crt(name: &[u8]) -> bool {
    const PATTERNS: [&[u8]; 5] = [b"crt", b"ucrt", b"msvcr", b"msvcp", b"vcruntime"];
    let lower = LowerPath::of(name);
    PATTERNS.iter().any(|pat| lower.contains(pat))
}

/// Fixed-size ASCII lowercase copy of a module path, enough for matching.
struct LowerPath {
    buf: [u8; 260],
    len: usize,
}

impl LowerPath {
    fn of(name: &[u8]) -> Self {
        let mut buf = [0u8; 260];
        let len = name.len().min(260);
        for (i, byte) in name[..len].iter().enumerate() {
            buf[i] = byte.to_ascii_lowercase();
        }
        LowerPath { buf, len }
    }

    fn contains(&self, needle: &[u8]) -> bool {
        self.buf[..self.len]
            .windows(needle.len())
            .any(|window| window == needle)
    }
}

// ---------------------------------------------------------------------------
// Transactions
// ---------------------------------------------------------------------------

const MAX_SUSPENDED: usize = 256;

/// Suspend every other thread in the process for the duration of the patch
/// edit. Returns the handles so the caller can resume them.
unsafe fn suspend_other_threads(handles: &mut [HANDLE; MAX_SUSPENDED]) -> usize {
    let snapshot = CreateToolhelp32Snapshot(TH32CS_SNAPTHREAD, 0);
    if snapshot == INVALID_HANDLE_VALUE {
        return 0;
    }

    let process_id = GetCurrentProcessId();
    let thread_id = GetCurrentThreadId();
    let mut count = 0usize;

    let mut entry: THREADENTRY32 = core::mem::zeroed();
    entry.dwSize = core::mem::size_of::<THREADENTRY32>() as u32;

    if Thread32First(snapshot, &mut entry) != 0 {
        loop {
            if entry.th32OwnerProcessID == process_id
                && entry.th32ThreadID != thread_id
                && count < MAX_SUSPENDED
            {
                let handle = OpenThread(THREAD_SUSPEND_RESUME, 0, entry.th32ThreadID);
                if !handle.is_null() {
                    SuspendThread(handle);
                    handles[count] = handle;
                    count += 1;
                }
            }
            if Thread32Next(snapshot, &mut entry) == 0 {
                break;
            }
        }
    }

    CloseHandle(snapshot);
    count
}

unsafe fn resume_threads(handles: &[HANDLE]) {
    for &handle in handles {
        ResumeThread(handle);
        CloseHandle(handle);
    }
}

unsafe fn write_jump(target: usize, detour: usize) -> bool {
    let mut info: MEMORY_BASIC_INFORMATION = core::mem::zeroed();
    if VirtualQuery(
        target as *const c_void,
        &mut info,
        core::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
    ) == 0
    {
        return false;
    }

    let mut old_protect = 0u32;
    if VirtualProtect(
        info.BaseAddress,
        info.RegionSize,
        PAGE_EXECUTE_READWRITE,
        &mut old_protect,
    ) == 0
    {
        return false;
    }

    // Log the original bytes so an explicit detach can restore them.
    let index = PATCH_LOG.count.load(Ordering::Relaxed);
    let logged = index < MAX_PATCHES;
    if logged {
        let entry = &mut (*PATCH_LOG.entries.get())[index];
        entry.target = target;
        ptr::copy_nonoverlapping(target as *const u8, entry.saved.as_mut_ptr(), JUMP_SIZE);
        PATCH_LOG.count.store(index + 1, Ordering::Relaxed);
    }

    let jump = Jump::to(detour, target);
    ptr::copy_nonoverlapping(
        &jump as *const Jump as *const u8,
        target as *mut u8,
        JUMP_SIZE,
    );

    VirtualProtect(info.BaseAddress, info.RegionSize, old_protect, &mut old_protect);
    FlushInstructionCache(GetCurrentProcess(), target as *const c_void, JUMP_SIZE);
    logged
}

unsafe fn attach_module(module: HMODULE, entries: &[PatchEntry]) -> bool {
    let mut any = false;
    for entry in entries {
        let proc = GetProcAddress(module, entry.name.as_ptr());
        let Some(proc) = proc else { continue };
        let target = proc as usize;
        // Remember the first original for diagnostics and fallbacks.
        let _ = entry
            .original
            .compare_exchange(0, target, Ordering::Release, Ordering::Acquire);
        if write_jump(target, entry.detour as usize) {
            any = true;
        }
    }
    any
}

/// Install the patches across every loaded CRT module. Idempotent.
pub unsafe fn install() -> bool {
    if INSTALLED.swap(true, Ordering::AcqRel) {
        return true;
    }

    let mut modules = [ptr::null_mut::<c_void>() as HMODULE; 1024];
    let mut needed = 0u32;
    if K32EnumProcessModules(
        GetCurrentProcess(),
        modules.as_mut_ptr(),
        core::mem::size_of_val(&modules) as u32,
        &mut needed,
    ) == 0
    {
        return false;
    }
    let module_count =
        (needed as usize / core::mem::size_of::<HMODULE>()).min(modules.len());

    let mut handles = [ptr::null_mut::<c_void>(); MAX_SUSPENDED];
    let suspended = suspend_other_threads(&mut handles);

    let mut any = false;
    for &module in &modules[..module_count] {
        let mut path = [0u8; 260];
        let len = GetModuleFileNameA(module, path.as_mut_ptr(), path.len() as u32) as usize;
        if len == 0 || !name_matches_crt(&path[..len]) {
            continue;
        }
        any |= attach_module(module, &PATCHES);
    }

    resume_threads(&handles[..suspended]);
    any
}

/// Restore every patched prologue. Only for explicit detach; never called at
/// process teardown.
pub unsafe fn uninstall() {
    if !INSTALLED.load(Ordering::Acquire) {
        return;
    }

    let mut handles = [ptr::null_mut::<c_void>(); MAX_SUSPENDED];
    let suspended = suspend_other_threads(&mut handles);

    let count = PATCH_LOG.count.load(Ordering::Relaxed);
    for index in (0..count).rev() {
        let entry = &(*PATCH_LOG.entries.get())[index];
        let mut info: MEMORY_BASIC_INFORMATION = core::mem::zeroed();
        if VirtualQuery(
            entry.target as *const c_void,
            &mut info,
            core::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
        ) == 0
        {
            continue;
        }
        let mut old_protect = 0u32;
        if VirtualProtect(
            info.BaseAddress,
            info.RegionSize,
            PAGE_EXECUTE_READWRITE,
            &mut old_protect,
        ) == 0
        {
            continue;
        }
        ptr::copy_nonoverlapping(
            entry.saved.as_ptr(),
            entry.target as *mut u8,
            JUMP_SIZE,
        );
        VirtualProtect(info.BaseAddress, info.RegionSize, old_protect, &mut old_protect);
        FlushInstructionCache(
            GetCurrentProcess(),
            entry.target as *const c_void,
            JUMP_SIZE,
        );
    }
    PATCH_LOG.count.store(0, Ordering::Relaxed);
    INSTALLED.store(false, Ordering::Release);

    resume_threads(&handles[..suspended]);
}
