//! The synthesized malloc zone.
//!
//! macOS routes allocation through named zones, each a table of function
//! pointers. We present exactly one zone whose every slot funnels into the
//! bridge, and interpose the whole zone-management API so lookups, creation,
//! and destruction all resolve to it. The zone is a const static, so it is
//! in place before any initializer or interposed call can run.

use crate::bridge::{ffi as hm, EXTERN_BRIDGE};
use crate::wrap;
use core::ffi::{c_char, c_void};

/// Layout-compatible with `malloc_zone_t` at introspection version 8.
#[repr(C)]
pub struct MallocZone {
    reserved1: *mut c_void,
    reserved2: *mut c_void,
    size: unsafe extern "C" fn(*mut MallocZone, *const c_void) -> usize,
    malloc: unsafe extern "C" fn(*mut MallocZone, usize) -> *mut c_void,
    calloc: unsafe extern "C" fn(*mut MallocZone, usize, usize) -> *mut c_void,
    valloc: unsafe extern "C" fn(*mut MallocZone, usize) -> *mut c_void,
    free: unsafe extern "C" fn(*mut MallocZone, *mut c_void),
    realloc: unsafe extern "C" fn(*mut MallocZone, *mut c_void, usize) -> *mut c_void,
    destroy: unsafe extern "C" fn(*mut MallocZone),
    zone_name: *const c_char,
    batch_malloc: unsafe extern "C" fn(*mut MallocZone, usize, *mut *mut c_void, u32) -> u32,
    batch_free: unsafe extern "C" fn(*mut MallocZone, *mut *mut c_void, u32),
    introspect: *mut c_void,
    version: u32,
    memalign: unsafe extern "C" fn(*mut MallocZone, usize, usize) -> *mut c_void,
    free_definite_size: unsafe extern "C" fn(*mut MallocZone, *mut c_void, usize),
    pressure_relief: Option<unsafe extern "C" fn(*mut MallocZone, usize) -> usize>,
}

struct ZoneHolder(MallocZone);

// The zone is never written after construction; the runtime only reads the
// function pointers out of it.
unsafe impl Sync for ZoneHolder {}

static ZONE_NAME: &[u8] = b"hookmalloc_zone\0";

static DEFAULT_ZONE: ZoneHolder = ZoneHolder(MallocZone {
    reserved1: core::ptr::null_mut(),
    reserved2: core::ptr::null_mut(),
    size: zone_size,
    malloc: zone_malloc,
    calloc: zone_calloc,
    valloc: zone_valloc,
    free: zone_free,
    realloc: zone_realloc,
    destroy: zone_destroy,
    zone_name: ZONE_NAME.as_ptr() as *const c_char,
    batch_malloc: zone_batch_malloc,
    batch_free: zone_batch_free,
    introspect: core::ptr::null_mut(),
    version: 8,
    memalign: zone_memalign,
    free_definite_size: zone_free_definite_size,
    pressure_relief: None,
});

/// The one true zone.
pub fn default_zone() -> *mut MallocZone {
    &DEFAULT_ZONE.0 as *const MallocZone as *mut MallocZone
}

// ---------------------------------------------------------------------------
// Zone function table
// ---------------------------------------------------------------------------

// The zone runtime treats size 0 for a live pointer as fatal; the Heap
// contract requires usable_size to be nonzero for live allocations.
unsafe extern "C" fn zone_size(_zone: *mut MallocZone, ptr: *const c_void) -> usize {
    hm::hm_usable_size(ptr as *mut c_void)
}

unsafe extern "C" fn zone_malloc(_zone: *mut MallocZone, size: usize) -> *mut c_void {
    hm::hm_malloc(size)
}

unsafe extern "C" fn zone_calloc(
    _zone: *mut MallocZone,
    count: usize,
    size: usize,
) -> *mut c_void {
    hm::hm_calloc(count, size)
}

unsafe extern "C" fn zone_valloc(_zone: *mut MallocZone, size: usize) -> *mut c_void {
    wrap::valloc(&EXTERN_BRIDGE, size) as *mut c_void
}

unsafe extern "C" fn zone_free(_zone: *mut MallocZone, ptr: *mut c_void) {
    hm::hm_free(ptr)
}

unsafe extern "C" fn zone_realloc(
    _zone: *mut MallocZone,
    ptr: *mut c_void,
    size: usize,
) -> *mut c_void {
    wrap::realloc(&EXTERN_BRIDGE, ptr as *mut u8, size) as *mut c_void
}

unsafe extern "C" fn zone_destroy(_zone: *mut MallocZone) {}

unsafe extern "C" fn zone_memalign(
    _zone: *mut MallocZone,
    align: usize,
    size: usize,
) -> *mut c_void {
    hm::hm_memalign(align, size)
}

unsafe extern "C" fn zone_free_definite_size(
    _zone: *mut MallocZone,
    ptr: *mut c_void,
    _size: usize,
) {
    hm::hm_free(ptr)
}

unsafe extern "C" fn zone_batch_malloc(
    _zone: *mut MallocZone,
    size: usize,
    results: *mut *mut c_void,
    num_requested: u32,
) -> u32 {
    for i in 0..num_requested {
        let ptr = hm::hm_malloc(size);
        if ptr.is_null() {
            return i;
        }
        *results.add(i as usize) = ptr;
    }
    num_requested
}

unsafe extern "C" fn zone_batch_free(
    _zone: *mut MallocZone,
    to_be_freed: *mut *mut c_void,
    num: u32,
) {
    for i in 0..num {
        hm::hm_free(*to_be_freed.add(i as usize));
    }
}

// ---------------------------------------------------------------------------
// Zone management API replacements
// ---------------------------------------------------------------------------
// Every creation / lookup / destruction path yields the one zone.

pub unsafe extern "C" fn replace_malloc_create_zone(
    _start_size: usize,
    _flags: u32,
) -> *mut MallocZone {
    default_zone()
}

pub unsafe extern "C" fn replace_malloc_default_zone() -> *mut MallocZone {
    default_zone()
}

pub unsafe extern "C" fn replace_malloc_default_purgeable_zone() -> *mut MallocZone {
    default_zone()
}

pub unsafe extern "C" fn replace_malloc_destroy_zone(_zone: *mut MallocZone) {}

pub unsafe extern "C" fn replace_malloc_get_all_zones(
    _task: u32,
    _reader: *mut c_void,
    addresses: *mut *mut usize,
    count: *mut u32,
) -> i32 {
    if !addresses.is_null() {
        *addresses = core::ptr::null_mut();
    }
    if !count.is_null() {
        *count = 0;
    }
    0 // KERN_SUCCESS
}

pub unsafe extern "C" fn replace_malloc_get_zone_name(zone: *mut MallocZone) -> *const c_char {
    if zone.is_null() {
        return core::ptr::null();
    }
    (*zone).zone_name
}

pub unsafe extern "C" fn replace_malloc_set_zone_name(
    _zone: *mut MallocZone,
    _name: *const c_char,
) {
}

pub unsafe extern "C" fn replace_malloc_zone_malloc(
    _zone: *mut MallocZone,
    size: usize,
) -> *mut c_void {
    hm::hm_malloc(size)
}

pub unsafe extern "C" fn replace_malloc_zone_calloc(
    _zone: *mut MallocZone,
    count: usize,
    size: usize,
) -> *mut c_void {
    hm::hm_calloc(count, size)
}

pub unsafe extern "C" fn replace_malloc_zone_realloc(
    _zone: *mut MallocZone,
    ptr: *mut c_void,
    size: usize,
) -> *mut c_void {
    wrap::realloc(&EXTERN_BRIDGE, ptr as *mut u8, size) as *mut c_void
}

pub unsafe extern "C" fn replace_malloc_zone_valloc(
    _zone: *mut MallocZone,
    size: usize,
) -> *mut c_void {
    wrap::valloc(&EXTERN_BRIDGE, size) as *mut c_void
}

pub unsafe extern "C" fn replace_malloc_zone_memalign(
    _zone: *mut MallocZone,
    align: usize,
    size: usize,
) -> *mut c_void {
    hm::hm_memalign(align, size)
}

pub unsafe extern "C" fn replace_malloc_zone_free(_zone: *mut MallocZone, ptr: *mut c_void) {
    hm::hm_free(ptr)
}

pub unsafe extern "C" fn replace_malloc_zone_batch_malloc(
    zone: *mut MallocZone,
    size: usize,
    results: *mut *mut c_void,
    num_requested: u32,
) -> u32 {
    zone_batch_malloc(zone, size, results, num_requested)
}

pub unsafe extern "C" fn replace_malloc_zone_batch_free(
    zone: *mut MallocZone,
    to_be_freed: *mut *mut c_void,
    num: u32,
) {
    zone_batch_free(zone, to_be_freed, num)
}

pub unsafe extern "C" fn replace_malloc_zone_check(_zone: *mut MallocZone) -> i32 {
    1
}

pub unsafe extern "C" fn replace_malloc_zone_from_ptr(_ptr: *const c_void) -> *mut MallocZone {
    default_zone()
}

pub unsafe extern "C" fn replace_malloc_zone_log(_zone: *mut MallocZone, _address: *mut c_void) {}

pub unsafe extern "C" fn replace_malloc_zone_print(_zone: *mut MallocZone, _verbose: i32) {}

pub unsafe extern "C" fn replace_malloc_zone_print_ptr_info(_ptr: *mut c_void) {}

pub unsafe extern "C" fn replace_malloc_zone_register(_zone: *mut MallocZone) {}

pub unsafe extern "C" fn replace_malloc_zone_unregister(_zone: *mut MallocZone) {}
