//! Linux interposition via strong symbol definitions.
//!
//! The cdylib defines every standard allocation entry point as a strong
//! symbol. Preloaded ahead of libc, those definitions win the dynamic
//! search order for the whole process; the version script exports exactly
//! this surface and `-Bsymbolic` keeps the library's own references bound to
//! itself, so nothing here can lazily rebind into the still-present system
//! allocator.

use crate::bridge::{ffi as hm, EXTERN_BRIDGE};
use crate::threads::{self, StartRoutine};
use crate::util;
use crate::wrap;
use core::cell::Cell;
use core::ffi::{c_char, c_int, c_void, CStr};
use core::ptr;
use core::sync::atomic::{AtomicUsize, Ordering};

// ---------------------------------------------------------------------------
// dlsym recursion guard
// ---------------------------------------------------------------------------

// glibc's dlsym allocates through calloc. Track the nesting so the exported
// calloc can refuse those calls instead of recursing; dlsym copes with a
// null return.
thread_local! {
    static IN_DLSYM: Cell<u32> = const { Cell::new(0) };
}

fn in_dlsym() -> bool {
    IN_DLSYM.try_with(|depth| depth.get() > 0).unwrap_or(false)
}

unsafe fn safe_dlsym(name: &CStr) -> *mut c_void {
    let _ = IN_DLSYM.try_with(|depth| depth.set(depth.get() + 1));
    let sym = libc::dlsym(libc::RTLD_NEXT, name.as_ptr());
    let _ = IN_DLSYM.try_with(|depth| depth.set(depth.get() - 1));
    sym
}

/// Resolve a libc symbol once, racing threads converging on one value.
unsafe fn resolve(slot: &AtomicUsize, name: &CStr) -> usize {
    let cached = slot.load(Ordering::Acquire);
    if cached != 0 {
        return cached;
    }
    let sym = safe_dlsym(name);
    if sym.is_null() {
        return 0;
    }
    let _ = slot.compare_exchange(0, sym as usize, Ordering::Release, Ordering::Acquire);
    slot.load(Ordering::Acquire)
}

// ---------------------------------------------------------------------------
// Canonical allocation surface
// ---------------------------------------------------------------------------

#[no_mangle]
pub unsafe extern "C" fn malloc(size: usize) -> *mut c_void {
    hm::hm_malloc(size)
}

#[no_mangle]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    hm::hm_free(ptr)
}

#[no_mangle]
pub unsafe extern "C" fn cfree(ptr: *mut c_void) {
    hm::hm_free(ptr)
}

#[no_mangle]
pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut c_void {
    if in_dlsym() {
        return ptr::null_mut();
    }
    hm::hm_calloc(nmemb, size)
}

#[no_mangle]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    wrap::realloc(&EXTERN_BRIDGE, ptr as *mut u8, size) as *mut c_void
}

#[no_mangle]
pub unsafe extern "C" fn reallocarray(
    ptr: *mut c_void,
    nmemb: usize,
    size: usize,
) -> *mut c_void {
    wrap::reallocarray(&EXTERN_BRIDGE, ptr as *mut u8, nmemb, size) as *mut c_void
}

#[no_mangle]
pub unsafe extern "C" fn memalign(align: usize, size: usize) -> *mut c_void {
    hm::hm_memalign(align, size)
}

#[no_mangle]
pub unsafe extern "C" fn posix_memalign(
    memptr: *mut *mut c_void,
    align: usize,
    size: usize,
) -> c_int {
    wrap::posix_memalign(&EXTERN_BRIDGE, memptr as *mut *mut u8, align, size)
}

#[no_mangle]
pub unsafe extern "C" fn aligned_alloc(align: usize, size: usize) -> *mut c_void {
    wrap::aligned_alloc(&EXTERN_BRIDGE, align, size) as *mut c_void
}

#[no_mangle]
pub unsafe extern "C" fn valloc(size: usize) -> *mut c_void {
    wrap::valloc(&EXTERN_BRIDGE, size) as *mut c_void
}

#[no_mangle]
pub unsafe extern "C" fn pvalloc(size: usize) -> *mut c_void {
    wrap::pvalloc(&EXTERN_BRIDGE, size) as *mut c_void
}

#[no_mangle]
pub unsafe extern "C" fn malloc_usable_size(ptr: *mut c_void) -> usize {
    hm::hm_usable_size(ptr)
}

#[no_mangle]
pub unsafe extern "C" fn strdup(s: *const c_char) -> *mut c_char {
    wrap::strdup(&EXTERN_BRIDGE, s)
}

#[no_mangle]
pub unsafe extern "C" fn strndup(s: *const c_char, n: usize) -> *mut c_char {
    wrap::strndup(&EXTERN_BRIDGE, s, n)
}

// ---------------------------------------------------------------------------
// glibc internal entry points
// ---------------------------------------------------------------------------
// Some programs (and parts of glibc itself) call these directly.

#[no_mangle]
pub unsafe extern "C" fn __libc_malloc(size: usize) -> *mut c_void {
    hm::hm_malloc(size)
}

#[no_mangle]
pub unsafe extern "C" fn __libc_free(ptr: *mut c_void) {
    hm::hm_free(ptr)
}

#[no_mangle]
pub unsafe extern "C" fn __libc_calloc(nmemb: usize, size: usize) -> *mut c_void {
    calloc(nmemb, size)
}

#[no_mangle]
pub unsafe extern "C" fn __libc_realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    realloc(ptr, size)
}

#[no_mangle]
pub unsafe extern "C" fn __libc_memalign(align: usize, size: usize) -> *mut c_void {
    hm::hm_memalign(align, size)
}

// ---------------------------------------------------------------------------
// glibc compatibility stubs
// ---------------------------------------------------------------------------

/// mallopt: accept but ignore options.
#[no_mangle]
pub unsafe extern "C" fn mallopt(_param: c_int, _value: c_int) -> c_int {
    1
}

#[no_mangle]
pub unsafe extern "C" fn malloc_trim(_pad: usize) -> c_int {
    0
}

#[no_mangle]
pub unsafe extern "C" fn malloc_stats() {}

#[no_mangle]
pub unsafe extern "C" fn mallinfo() -> libc::mallinfo {
    core::mem::zeroed()
}

// glibc's getcwd(NULL, n) hands ownership of a malloc'd buffer to the
// caller, who will free it through us; allocate it from the bridge.
#[no_mangle]
pub unsafe extern "C" fn getcwd(buf: *mut c_char, size: usize) -> *mut c_char {
    static REAL_GETCWD: AtomicUsize = AtomicUsize::new(0);
    type GetcwdFn = unsafe extern "C" fn(*mut c_char, usize) -> *mut c_char;

    let real = resolve(&REAL_GETCWD, c"getcwd");
    if real == 0 {
        return ptr::null_mut();
    }
    let real: GetcwdFn = core::mem::transmute(real);

    let mut buf = buf;
    let mut size = size;
    if buf.is_null() {
        if size == 0 {
            size = libc::PATH_MAX as usize;
        }
        buf = hm::hm_malloc(size) as *mut c_char;
        if buf.is_null() {
            return ptr::null_mut();
        }
    }
    real(buf, size)
}

// ---------------------------------------------------------------------------
// C++ operator new / delete
// ---------------------------------------------------------------------------
// Itanium manglings, so C++ code in the target process lands here without a
// C++ runtime of our own. Throwing variants cannot raise bad_alloc from
// Rust; exhaustion is fatal.

unsafe fn cxx_alloc(size: usize) -> *mut c_void {
    let size = if size == 0 { 1 } else { size };
    let ptr = hm::hm_malloc(size);
    if ptr.is_null() {
        util::fail("hookmalloc: operator new: out of memory\n");
    }
    ptr
}

unsafe fn cxx_alloc_aligned(size: usize, align: usize) -> *mut c_void {
    let size = if size == 0 { 1 } else { size };
    let ptr = hm::hm_memalign(align, size);
    if ptr.is_null() {
        util::fail("hookmalloc: aligned operator new: out of memory\n");
    }
    ptr
}

/// operator new(size_t)
#[export_name = "_Znwm"]
pub unsafe extern "C" fn cxx_new(size: usize) -> *mut c_void {
    cxx_alloc(size)
}

/// operator new[](size_t)
#[export_name = "_Znam"]
pub unsafe extern "C" fn cxx_new_array(size: usize) -> *mut c_void {
    cxx_alloc(size)
}

/// operator new(size_t, nothrow)
#[export_name = "_ZnwmRKSt9nothrow_t"]
pub unsafe extern "C" fn cxx_new_nothrow(size: usize, _tag: *const c_void) -> *mut c_void {
    hm::hm_malloc(if size == 0 { 1 } else { size })
}

/// operator new[](size_t, nothrow)
#[export_name = "_ZnamRKSt9nothrow_t"]
pub unsafe extern "C" fn cxx_new_array_nothrow(
    size: usize,
    _tag: *const c_void,
) -> *mut c_void {
    hm::hm_malloc(if size == 0 { 1 } else { size })
}

/// operator delete(void*)
#[export_name = "_ZdlPv"]
pub unsafe extern "C" fn cxx_delete(ptr: *mut c_void) {
    hm::hm_free(ptr)
}

/// operator delete[](void*)
#[export_name = "_ZdaPv"]
pub unsafe extern "C" fn cxx_delete_array(ptr: *mut c_void) {
    hm::hm_free(ptr)
}

/// operator delete(void*, nothrow)
#[export_name = "_ZdlPvRKSt9nothrow_t"]
pub unsafe extern "C" fn cxx_delete_nothrow(ptr: *mut c_void, _tag: *const c_void) {
    hm::hm_free(ptr)
}

/// operator delete[](void*, nothrow)
#[export_name = "_ZdaPvRKSt9nothrow_t"]
pub unsafe extern "C" fn cxx_delete_array_nothrow(ptr: *mut c_void, _tag: *const c_void) {
    hm::hm_free(ptr)
}

/// operator delete(void*, size_t)
#[export_name = "_ZdlPvm"]
pub unsafe extern "C" fn cxx_delete_sized(ptr: *mut c_void, _size: usize) {
    hm::hm_free(ptr)
}

/// operator delete[](void*, size_t)
#[export_name = "_ZdaPvm"]
pub unsafe extern "C" fn cxx_delete_array_sized(ptr: *mut c_void, _size: usize) {
    hm::hm_free(ptr)
}

/// operator new(size_t, align_val_t)
#[export_name = "_ZnwmSt11align_val_t"]
pub unsafe extern "C" fn cxx_new_aligned(size: usize, align: usize) -> *mut c_void {
    cxx_alloc_aligned(size, align)
}

/// operator new[](size_t, align_val_t)
#[export_name = "_ZnamSt11align_val_t"]
pub unsafe extern "C" fn cxx_new_array_aligned(size: usize, align: usize) -> *mut c_void {
    cxx_alloc_aligned(size, align)
}

/// operator new(size_t, align_val_t, nothrow)
#[export_name = "_ZnwmSt11align_val_tRKSt9nothrow_t"]
pub unsafe extern "C" fn cxx_new_aligned_nothrow(
    size: usize,
    align: usize,
    _tag: *const c_void,
) -> *mut c_void {
    hm::hm_memalign(align, if size == 0 { 1 } else { size })
}

/// operator new[](size_t, align_val_t, nothrow)
#[export_name = "_ZnamSt11align_val_tRKSt9nothrow_t"]
pub unsafe extern "C" fn cxx_new_array_aligned_nothrow(
    size: usize,
    align: usize,
    _tag: *const c_void,
) -> *mut c_void {
    hm::hm_memalign(align, if size == 0 { 1 } else { size })
}

/// operator delete(void*, align_val_t)
#[export_name = "_ZdlPvSt11align_val_t"]
pub unsafe extern "C" fn cxx_delete_aligned(ptr: *mut c_void, _align: usize) {
    hm::hm_free(ptr)
}

/// operator delete[](void*, align_val_t)
#[export_name = "_ZdaPvSt11align_val_t"]
pub unsafe extern "C" fn cxx_delete_array_aligned(ptr: *mut c_void, _align: usize) {
    hm::hm_free(ptr)
}

/// operator delete(void*, align_val_t, nothrow)
#[export_name = "_ZdlPvSt11align_val_tRKSt9nothrow_t"]
pub unsafe extern "C" fn cxx_delete_aligned_nothrow(
    ptr: *mut c_void,
    _align: usize,
    _tag: *const c_void,
) {
    hm::hm_free(ptr)
}

/// operator delete[](void*, align_val_t, nothrow)
#[export_name = "_ZdaPvSt11align_val_tRKSt9nothrow_t"]
pub unsafe extern "C" fn cxx_delete_array_aligned_nothrow(
    ptr: *mut c_void,
    _align: usize,
    _tag: *const c_void,
) {
    hm::hm_free(ptr)
}

/// operator delete(void*, size_t, align_val_t)
#[export_name = "_ZdlPvmSt11align_val_t"]
pub unsafe extern "C" fn cxx_delete_sized_aligned(
    ptr: *mut c_void,
    _size: usize,
    _align: usize,
) {
    hm::hm_free(ptr)
}

/// operator delete[](void*, size_t, align_val_t)
#[export_name = "_ZdaPvmSt11align_val_t"]
pub unsafe extern "C" fn cxx_delete_array_sized_aligned(
    ptr: *mut c_void,
    _size: usize,
    _align: usize,
) {
    hm::hm_free(ptr)
}

// ---------------------------------------------------------------------------
// Thread interposition
// ---------------------------------------------------------------------------
// The real primitives are reached through dlsym(RTLD_NEXT); our own strong
// definitions shadow them for the rest of the process.

static REAL_PTHREAD_CREATE: AtomicUsize = AtomicUsize::new(0);
static REAL_PTHREAD_EXIT: AtomicUsize = AtomicUsize::new(0);

type PthreadCreateFn = unsafe extern "C" fn(
    *mut libc::pthread_t,
    *const libc::pthread_attr_t,
    StartRoutine,
    *mut c_void,
) -> c_int;
type PthreadExitFn = unsafe extern "C-unwind" fn(*mut c_void);

#[no_mangle]
pub unsafe extern "C" fn pthread_create(
    thread: *mut libc::pthread_t,
    attr: *const libc::pthread_attr_t,
    start: StartRoutine,
    arg: *mut c_void,
) -> c_int {
    let real = resolve(&REAL_PTHREAD_CREATE, c"pthread_create");
    if real == 0 {
        return libc::EAGAIN;
    }
    let real: PthreadCreateFn = core::mem::transmute(real);

    threads::create_thread(&EXTERN_BRIDGE, start, arg, |routine, routine_arg| {
        real(thread, attr, routine, routine_arg)
    })
}

#[no_mangle]
pub unsafe extern "C-unwind" fn pthread_exit(value: *mut c_void) -> ! {
    use crate::bridge::ThreadHooks;

    if crate::init::hooks_ready() && EXTERN_BRIDGE.hooks_present() {
        threads::run_exit_hook(&EXTERN_BRIDGE);
    }

    let real = resolve(&REAL_PTHREAD_EXIT, c"pthread_exit");
    if real != 0 {
        let real: PthreadExitFn = core::mem::transmute(real);
        real(value);
    }
    // The real pthread_exit does not return.
    libc::abort();
}
