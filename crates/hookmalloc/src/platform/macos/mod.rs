//! macOS interposition via `__DATA,__interpose` tuples.
//!
//! dyld applies the tuples at image map time, so interception is in place
//! before the target's own initializers run. The replacements below call the
//! real primitives directly where needed; dyld does not rewrite references
//! made by the interposing image itself.

pub mod interpose;
pub mod zones;

use crate::bridge::{ffi as hm, ThreadHooks, EXTERN_BRIDGE};
use crate::threads::{self, StartRoutine};
use crate::wrap;
use self::interpose::interpose;
use core::ffi::{c_char, c_int, c_void};

// ---------------------------------------------------------------------------
// System originals not declared by the libc crate
// ---------------------------------------------------------------------------

extern "C" {
    fn vfree(ptr: *mut c_void);
    fn aligned_alloc(align: usize, size: usize) -> *mut c_void;
    fn malloc_good_size(size: usize) -> usize;
    fn malloc_printf(format: *const c_char);
    fn _malloc_fork_prepare();
    fn _malloc_fork_parent();
    fn _malloc_fork_child();

    fn malloc_create_zone(start_size: usize, flags: u32) -> *mut zones::MallocZone;
    fn malloc_default_zone() -> *mut zones::MallocZone;
    fn malloc_default_purgeable_zone() -> *mut zones::MallocZone;
    fn malloc_destroy_zone(zone: *mut zones::MallocZone);
    fn malloc_get_all_zones(
        task: u32,
        reader: *mut c_void,
        addresses: *mut *mut usize,
        count: *mut u32,
    ) -> i32;
    fn malloc_get_zone_name(zone: *mut zones::MallocZone) -> *const c_char;
    fn malloc_set_zone_name(zone: *mut zones::MallocZone, name: *const c_char);
    fn malloc_zone_malloc(zone: *mut zones::MallocZone, size: usize) -> *mut c_void;
    fn malloc_zone_calloc(
        zone: *mut zones::MallocZone,
        count: usize,
        size: usize,
    ) -> *mut c_void;
    fn malloc_zone_realloc(
        zone: *mut zones::MallocZone,
        ptr: *mut c_void,
        size: usize,
    ) -> *mut c_void;
    fn malloc_zone_valloc(zone: *mut zones::MallocZone, size: usize) -> *mut c_void;
    fn malloc_zone_memalign(
        zone: *mut zones::MallocZone,
        align: usize,
        size: usize,
    ) -> *mut c_void;
    fn malloc_zone_free(zone: *mut zones::MallocZone, ptr: *mut c_void);
    fn malloc_zone_batch_malloc(
        zone: *mut zones::MallocZone,
        size: usize,
        results: *mut *mut c_void,
        num_requested: u32,
    ) -> u32;
    fn malloc_zone_batch_free(
        zone: *mut zones::MallocZone,
        to_be_freed: *mut *mut c_void,
        num: u32,
    );
    fn malloc_zone_check(zone: *mut zones::MallocZone) -> i32;
    fn malloc_zone_from_ptr(ptr: *const c_void) -> *mut zones::MallocZone;
    fn malloc_zone_log(zone: *mut zones::MallocZone, address: *mut c_void);
    fn malloc_zone_print(zone: *mut zones::MallocZone, verbose: i32);
    fn malloc_zone_print_ptr_info(ptr: *mut c_void);
    fn malloc_zone_register(zone: *mut zones::MallocZone);
    fn malloc_zone_unregister(zone: *mut zones::MallocZone);

    #[link_name = "_Znwm"]
    fn cxx_new(size: usize) -> *mut c_void;
    #[link_name = "_Znam"]
    fn cxx_new_array(size: usize) -> *mut c_void;
    #[link_name = "_ZdlPv"]
    fn cxx_delete(ptr: *mut c_void);
    #[link_name = "_ZdaPv"]
    fn cxx_delete_array(ptr: *mut c_void);
    #[link_name = "_ZnwmRKSt9nothrow_t"]
    fn cxx_new_nothrow(size: usize, tag: *const c_void) -> *mut c_void;
    #[link_name = "_ZnamRKSt9nothrow_t"]
    fn cxx_new_array_nothrow(size: usize, tag: *const c_void) -> *mut c_void;
    #[link_name = "_ZdlPvRKSt9nothrow_t"]
    fn cxx_delete_nothrow(ptr: *mut c_void, tag: *const c_void);
    #[link_name = "_ZdaPvRKSt9nothrow_t"]
    fn cxx_delete_array_nothrow(ptr: *mut c_void, tag: *const c_void);
    #[link_name = "_ZdlPvm"]
    fn cxx_delete_sized(ptr: *mut c_void, size: usize);
    #[link_name = "_ZdaPvm"]
    fn cxx_delete_array_sized(ptr: *mut c_void, size: usize);
    #[link_name = "_ZnwmSt11align_val_t"]
    fn cxx_new_aligned(size: usize, align: usize) -> *mut c_void;
    #[link_name = "_ZnamSt11align_val_t"]
    fn cxx_new_array_aligned(size: usize, align: usize) -> *mut c_void;
    #[link_name = "_ZdlPvSt11align_val_t"]
    fn cxx_delete_aligned(ptr: *mut c_void, align: usize);
    #[link_name = "_ZdaPvSt11align_val_t"]
    fn cxx_delete_array_aligned(ptr: *mut c_void, align: usize);
}

// ---------------------------------------------------------------------------
// Replacements for the canonical surface
// ---------------------------------------------------------------------------

unsafe extern "C" fn replace_malloc(size: usize) -> *mut c_void {
    hm::hm_malloc(size)
}

unsafe extern "C" fn replace_free(ptr: *mut c_void) {
    hm::hm_free(ptr)
}

unsafe extern "C" fn replace_calloc(count: usize, size: usize) -> *mut c_void {
    hm::hm_calloc(count, size)
}

unsafe extern "C" fn replace_realloc(ptr: *mut c_void, size: usize) -> *mut c_void {
    wrap::realloc(&EXTERN_BRIDGE, ptr as *mut u8, size) as *mut c_void
}

// reallocf releases the original allocation even when the resize fails.
unsafe extern "C" fn replace_reallocf(ptr: *mut c_void, size: usize) -> *mut c_void {
    let new = wrap::realloc(&EXTERN_BRIDGE, ptr as *mut u8, size) as *mut c_void;
    if new.is_null() && !ptr.is_null() && size != 0 {
        hm::hm_free(ptr);
    }
    new
}

unsafe extern "C" fn replace_posix_memalign(
    memptr: *mut *mut c_void,
    align: usize,
    size: usize,
) -> c_int {
    wrap::posix_memalign(&EXTERN_BRIDGE, memptr as *mut *mut u8, align, size)
}

unsafe extern "C" fn replace_aligned_alloc(align: usize, size: usize) -> *mut c_void {
    wrap::aligned_alloc(&EXTERN_BRIDGE, align, size) as *mut c_void
}

unsafe extern "C" fn replace_valloc(size: usize) -> *mut c_void {
    wrap::valloc(&EXTERN_BRIDGE, size) as *mut c_void
}

unsafe extern "C" fn replace_vfree(ptr: *mut c_void) {
    hm::hm_free(ptr)
}

unsafe extern "C" fn replace_strdup(s: *const c_char) -> *mut c_char {
    wrap::strdup(&EXTERN_BRIDGE, s)
}

unsafe extern "C" fn replace_strndup(s: *const c_char, n: usize) -> *mut c_char {
    wrap::strndup(&EXTERN_BRIDGE, s, n)
}

unsafe extern "C" fn replace_malloc_size(ptr: *const c_void) -> usize {
    hm::hm_usable_size(ptr as *mut c_void)
}

unsafe extern "C" fn replace_malloc_good_size(size: usize) -> usize {
    if size == 0 {
        1
    } else {
        size
    }
}

unsafe extern "C" fn replace_malloc_printf(_format: *const c_char) {}

// ---------------------------------------------------------------------------
// Fork phases
// ---------------------------------------------------------------------------
// The platform calls these around fork instead of pthread_atfork handlers.

unsafe extern "C" fn replace_malloc_fork_prepare() {
    hm::hm_lock()
}

unsafe extern "C" fn replace_malloc_fork_parent() {
    hm::hm_unlock()
}

unsafe extern "C" fn replace_malloc_fork_child() {
    hm::hm_unlock()
}

// ---------------------------------------------------------------------------
// Thread interposition
// ---------------------------------------------------------------------------

unsafe extern "C" fn replace_pthread_create(
    thread: *mut libc::pthread_t,
    attr: *const libc::pthread_attr_t,
    start: StartRoutine,
    arg: *mut c_void,
) -> c_int {
    threads::create_thread(&EXTERN_BRIDGE, start, arg, |routine, routine_arg| {
        let routine: extern "C" fn(*mut c_void) -> *mut c_void =
            core::mem::transmute(routine);
        libc::pthread_create(thread, attr, routine, routine_arg)
    })
}

unsafe extern "C-unwind" fn replace_pthread_exit(value: *mut c_void) -> ! {
    if crate::init::hooks_ready() && EXTERN_BRIDGE.hooks_present() {
        threads::run_exit_hook(&EXTERN_BRIDGE);
    }
    libc::pthread_exit(value)
}

// ---------------------------------------------------------------------------
// C++ operator replacements
// ---------------------------------------------------------------------------

unsafe extern "C" fn replace_cxx_new(size: usize) -> *mut c_void {
    hm::hm_malloc(if size == 0 { 1 } else { size })
}

unsafe extern "C" fn replace_cxx_new_nothrow(size: usize, _tag: *const c_void) -> *mut c_void {
    hm::hm_malloc(if size == 0 { 1 } else { size })
}

unsafe extern "C" fn replace_cxx_delete(ptr: *mut c_void) {
    hm::hm_free(ptr)
}

unsafe extern "C" fn replace_cxx_delete_nothrow(ptr: *mut c_void, _tag: *const c_void) {
    hm::hm_free(ptr)
}

unsafe extern "C" fn replace_cxx_delete_sized(ptr: *mut c_void, _size: usize) {
    hm::hm_free(ptr)
}

unsafe extern "C" fn replace_cxx_new_aligned(size: usize, align: usize) -> *mut c_void {
    hm::hm_memalign(align, if size == 0 { 1 } else { size })
}

unsafe extern "C" fn replace_cxx_delete_aligned(ptr: *mut c_void, _align: usize) {
    hm::hm_free(ptr)
}

// ---------------------------------------------------------------------------
// Interposition tables
// ---------------------------------------------------------------------------

// Canonical allocation surface.
interpose!(I_MALLOC, replace_malloc, libc::malloc);
interpose!(I_FREE, replace_free, libc::free);
interpose!(I_CALLOC, replace_calloc, libc::calloc);
interpose!(I_REALLOC, replace_realloc, libc::realloc);
interpose!(I_REALLOCF, replace_reallocf, libc::reallocf);
interpose!(I_POSIX_MEMALIGN, replace_posix_memalign, libc::posix_memalign);
interpose!(I_ALIGNED_ALLOC, replace_aligned_alloc, aligned_alloc);
interpose!(I_VALLOC, replace_valloc, libc::valloc);
interpose!(I_VFREE, replace_vfree, vfree);
interpose!(I_STRDUP, replace_strdup, libc::strdup);
interpose!(I_STRNDUP, replace_strndup, libc::strndup);
interpose!(I_MALLOC_SIZE, replace_malloc_size, libc::malloc_size);
interpose!(I_MALLOC_GOOD_SIZE, replace_malloc_good_size, malloc_good_size);
interpose!(I_MALLOC_PRINTF, replace_malloc_printf, malloc_printf);

// Fork phases.
interpose!(I_FORK_PREPARE, replace_malloc_fork_prepare, _malloc_fork_prepare);
interpose!(I_FORK_PARENT, replace_malloc_fork_parent, _malloc_fork_parent);
interpose!(I_FORK_CHILD, replace_malloc_fork_child, _malloc_fork_child);

// Thread lifecycle.
interpose!(I_PTHREAD_CREATE, replace_pthread_create, libc::pthread_create);
interpose!(I_PTHREAD_EXIT, replace_pthread_exit, libc::pthread_exit);

// Zone management.
interpose!(I_ZONE_CREATE, zones::replace_malloc_create_zone, malloc_create_zone);
interpose!(I_ZONE_DEFAULT, zones::replace_malloc_default_zone, malloc_default_zone);
interpose!(
    I_ZONE_PURGEABLE,
    zones::replace_malloc_default_purgeable_zone,
    malloc_default_purgeable_zone
);
interpose!(I_ZONE_DESTROY, zones::replace_malloc_destroy_zone, malloc_destroy_zone);
interpose!(I_ZONE_GET_ALL, zones::replace_malloc_get_all_zones, malloc_get_all_zones);
interpose!(I_ZONE_GET_NAME, zones::replace_malloc_get_zone_name, malloc_get_zone_name);
interpose!(I_ZONE_SET_NAME, zones::replace_malloc_set_zone_name, malloc_set_zone_name);
interpose!(I_ZONE_MALLOC, zones::replace_malloc_zone_malloc, malloc_zone_malloc);
interpose!(I_ZONE_CALLOC, zones::replace_malloc_zone_calloc, malloc_zone_calloc);
interpose!(I_ZONE_REALLOC, zones::replace_malloc_zone_realloc, malloc_zone_realloc);
interpose!(I_ZONE_VALLOC, zones::replace_malloc_zone_valloc, malloc_zone_valloc);
interpose!(I_ZONE_MEMALIGN, zones::replace_malloc_zone_memalign, malloc_zone_memalign);
interpose!(I_ZONE_FREE, zones::replace_malloc_zone_free, malloc_zone_free);
interpose!(
    I_ZONE_BATCH_MALLOC,
    zones::replace_malloc_zone_batch_malloc,
    malloc_zone_batch_malloc
);
interpose!(
    I_ZONE_BATCH_FREE,
    zones::replace_malloc_zone_batch_free,
    malloc_zone_batch_free
);
interpose!(I_ZONE_CHECK, zones::replace_malloc_zone_check, malloc_zone_check);
interpose!(I_ZONE_FROM_PTR, zones::replace_malloc_zone_from_ptr, malloc_zone_from_ptr);
interpose!(I_ZONE_LOG, zones::replace_malloc_zone_log, malloc_zone_log);
interpose!(I_ZONE_PRINT, zones::replace_malloc_zone_print, malloc_zone_print);
interpose!(
    I_ZONE_PRINT_PTR_INFO,
    zones::replace_malloc_zone_print_ptr_info,
    malloc_zone_print_ptr_info
);
interpose!(I_ZONE_REGISTER, zones::replace_malloc_zone_register, malloc_zone_register);
interpose!(
    I_ZONE_UNREGISTER,
    zones::replace_malloc_zone_unregister,
    malloc_zone_unregister
);

// C++ operators: plain, array, nothrow, sized, and C++17 aligned variants.
interpose!(I_CXX_NEW, replace_cxx_new, cxx_new);
interpose!(I_CXX_NEW_ARRAY, replace_cxx_new, cxx_new_array);
interpose!(I_CXX_NEW_NOTHROW, replace_cxx_new_nothrow, cxx_new_nothrow);
interpose!(I_CXX_NEW_ARRAY_NOTHROW, replace_cxx_new_nothrow, cxx_new_array_nothrow);
interpose!(I_CXX_DELETE, replace_cxx_delete, cxx_delete);
interpose!(I_CXX_DELETE_ARRAY, replace_cxx_delete, cxx_delete_array);
interpose!(I_CXX_DELETE_NOTHROW, replace_cxx_delete_nothrow, cxx_delete_nothrow);
interpose!(
    I_CXX_DELETE_ARRAY_NOTHROW,
    replace_cxx_delete_nothrow,
    cxx_delete_array_nothrow
);
interpose!(I_CXX_DELETE_SIZED, replace_cxx_delete_sized, cxx_delete_sized);
interpose!(I_CXX_DELETE_ARRAY_SIZED, replace_cxx_delete_sized, cxx_delete_array_sized);
interpose!(I_CXX_NEW_ALIGNED, replace_cxx_new_aligned, cxx_new_aligned);
interpose!(I_CXX_NEW_ARRAY_ALIGNED, replace_cxx_new_aligned, cxx_new_array_aligned);
interpose!(I_CXX_DELETE_ALIGNED, replace_cxx_delete_aligned, cxx_delete_aligned);
interpose!(
    I_CXX_DELETE_ARRAY_ALIGNED,
    replace_cxx_delete_aligned,
    cxx_delete_array_aligned
);
