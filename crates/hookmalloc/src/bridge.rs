//! The bridge layer: the single indirection between the intercepted
//! allocation surface and the user heap.
//!
//! [`HeapCell`] owns the singleton heap and implements the eight canonical
//! operations over it, filling in the ones the heap omits. [`ExternBridge`]
//! implements the same operations over the C symbols produced by
//! [`redirect_heap!`](crate::redirect_heap), which is how the platform
//! interceptors (compiled into this crate) reach a heap defined in a
//! downstream crate.

use crate::boot;
use crate::heap::Heap;
use crate::util;
use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::ptr;
use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

/// The eight canonical operations every platform interceptor funnels into.
///
/// # Safety
/// Methods taking pointers have the usual allocator requirements: `ptr` is
/// null, a live allocation from the same bridge, or (where the platform
/// tolerates them) a foreign pointer.
pub trait Bridge {
    unsafe fn alloc(&self, size: usize) -> *mut u8;
    unsafe fn release(&self, ptr: *mut u8);
    unsafe fn alloc_aligned(&self, align: usize, size: usize) -> *mut u8;
    unsafe fn usable_size(&self, ptr: *mut u8) -> usize;
    fn lock(&self);
    fn unlock(&self);
    unsafe fn realloc(&self, ptr: *mut u8, size: usize) -> *mut u8;
    unsafe fn calloc(&self, count: usize, size: usize) -> *mut u8;
}

const EMPTY: u8 = 0;
const BUILDING: u8 = 1;
const READY: u8 = 2;

/// Static storage for the singleton heap.
///
/// The heap is constructed in place on first use and never dropped, so that
/// `free` calls arriving from process-exit finalizers still find a live
/// allocator. Once observed, the heap is observed forever at the same
/// address.
pub struct HeapCell<H> {
    state: AtomicU8,
    builder: AtomicUsize,
    slot: UnsafeCell<MaybeUninit<H>>,
}

// The slot is written once, before the release-store of READY; afterwards it
// is only read through shared references.
unsafe impl<H: Sync> Sync for HeapCell<H> {}

impl<H: Heap> HeapCell<H> {
    pub const fn new() -> Self {
        HeapCell {
            state: AtomicU8::new(EMPTY),
            builder: AtomicUsize::new(0),
            slot: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    /// The heap, constructing it if this is the first use. Returns `None`
    /// only for a reentrant call from inside the heap's own constructor;
    /// the caller then falls back to the init buffer.
    #[inline]
    pub fn get(&self) -> Option<&H> {
        if self.state.load(Ordering::Acquire) == READY {
            return Some(unsafe { (*self.slot.get()).assume_init_ref() });
        }
        self.get_slow()
    }

    #[cold]
    #[inline(never)]
    fn get_slow(&self) -> Option<&H> {
        loop {
            match self.state.compare_exchange(
                EMPTY,
                BUILDING,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.builder
                        .store(util::current_thread_id(), Ordering::Relaxed);
                    // May reenter the bridge; those calls observe BUILDING
                    // with our thread id and get served from the init buffer.
                    let heap = H::default();
                    unsafe { (*self.slot.get()).write(heap) };
                    crate::init::mark_allocator_ready();
                    self.state.store(READY, Ordering::Release);
                    return Some(unsafe { (*self.slot.get()).assume_init_ref() });
                }
                Err(BUILDING) => {
                    if self.builder.load(Ordering::Relaxed) == util::current_thread_id() {
                        return None;
                    }
                    while self.state.load(Ordering::Acquire) == BUILDING {
                        core::hint::spin_loop();
                    }
                }
                Err(_) => {
                    return Some(unsafe { (*self.slot.get()).assume_init_ref() });
                }
            }
        }
    }

    /// Force construction. Ignores a reentrant call.
    pub fn warm(&self) {
        let _ = self.get();
    }
}

impl<H: Heap> Default for HeapCell<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: Heap> Bridge for HeapCell<H> {
    #[inline]
    unsafe fn alloc(&self, size: usize) -> *mut u8 {
        match self.get() {
            Some(heap) => heap.alloc(size),
            None => boot::alloc(util::MIN_ALIGN, size),
        }
    }

    #[inline]
    unsafe fn release(&self, ptr: *mut u8) {
        if ptr.is_null() || boot::contains(ptr) {
            return;
        }
        if let Some(heap) = self.get() {
            heap.release(ptr);
        }
    }

    #[inline]
    unsafe fn alloc_aligned(&self, align: usize, size: usize) -> *mut u8 {
        match self.get() {
            Some(heap) => heap.alloc_aligned(align, size),
            None => boot::alloc(align, size),
        }
    }

    #[inline]
    unsafe fn usable_size(&self, ptr: *mut u8) -> usize {
        if ptr.is_null() {
            return 0;
        }
        if boot::contains(ptr) {
            return boot::usable_size(ptr);
        }
        match self.get() {
            Some(heap) => heap.usable_size(ptr),
            None => 0,
        }
    }

    #[inline]
    fn lock(&self) {
        if let Some(heap) = self.get() {
            heap.lock();
        }
    }

    #[inline]
    fn unlock(&self) {
        if let Some(heap) = self.get() {
            heap.unlock();
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, size: usize) -> *mut u8 {
        if H::HAS_REALLOC && !ptr.is_null() && size != 0 && !boot::contains(ptr) {
            if let Some(heap) = self.get() {
                return heap.realloc(ptr, size);
            }
        }

        // Synthesized reallocation.
        if ptr.is_null() {
            return self.alloc(size);
        }
        if size == 0 {
            self.release(ptr);
            return ptr::null_mut();
        }
        let old = self.usable_size(ptr);
        // Small shrink: keep the pointer when the new size still occupies
        // more than half of the current block.
        if old / 2 < size && size <= old {
            return ptr;
        }
        let new = self.alloc(size);
        if !new.is_null() {
            ptr::copy_nonoverlapping(ptr, new, old.min(size));
            self.release(ptr);
        }
        new
    }

    unsafe fn calloc(&self, count: usize, size: usize) -> *mut u8 {
        let total = match count.checked_mul(size) {
            Some(total) => total,
            None => return ptr::null_mut(),
        };
        let ptr = self.alloc(total);
        if !ptr.is_null() {
            ptr::write_bytes(ptr, 0, total);
        }
        ptr
    }
}

/// Thread lifecycle capability of a bridge, consumed by the thread
/// controller. Presence is an explicit signal rather than a weak-symbol
/// address comparison, so it survives linkers with unhelpful weak-symbol
/// semantics.
pub trait ThreadHooks {
    fn hooks_present(&self) -> bool;
    fn thread_start(&self);
    fn thread_exit(&self);
}

impl<H: Heap> ThreadHooks for HeapCell<H> {
    #[inline]
    fn hooks_present(&self) -> bool {
        H::HAS_THREAD_HOOKS
    }

    #[inline]
    fn thread_start(&self) {
        if let Some(heap) = self.get() {
            heap.thread_start();
        }
    }

    #[inline]
    fn thread_exit(&self) {
        if let Some(heap) = self.get() {
            heap.thread_exit();
        }
    }
}

/// C declarations of the bridge seam produced by [`redirect_heap!`].
#[cfg(feature = "interpose")]
pub(crate) mod ffi {
    use core::ffi::c_void;

    extern "C" {
        pub fn hm_malloc(size: usize) -> *mut c_void;
        pub fn hm_free(ptr: *mut c_void);
        pub fn hm_memalign(align: usize, size: usize) -> *mut c_void;
        pub fn hm_usable_size(ptr: *mut c_void) -> usize;
        pub fn hm_lock();
        pub fn hm_unlock();
        pub fn hm_realloc(ptr: *mut c_void, size: usize) -> *mut c_void;
        pub fn hm_calloc(count: usize, size: usize) -> *mut c_void;
        pub fn hm_thread_start();
        pub fn hm_thread_exit();
        pub fn hm_thread_hooks_present() -> bool;
        pub fn hm_warm();
    }
}

/// The bridge as seen from the platform interceptors: thin forwards to the
/// `hm_*` symbols. A zero-sized type so monomorphized call paths compile to
/// direct calls.
#[cfg(feature = "interpose")]
pub struct ExternBridge;

#[cfg(feature = "interpose")]
pub static EXTERN_BRIDGE: ExternBridge = ExternBridge;

#[cfg(feature = "interpose")]
impl Bridge for ExternBridge {
    #[inline]
    unsafe fn alloc(&self, size: usize) -> *mut u8 {
        ffi::hm_malloc(size) as *mut u8
    }

    #[inline]
    unsafe fn release(&self, ptr: *mut u8) {
        ffi::hm_free(ptr as *mut _)
    }

    #[inline]
    unsafe fn alloc_aligned(&self, align: usize, size: usize) -> *mut u8 {
        ffi::hm_memalign(align, size) as *mut u8
    }

    #[inline]
    unsafe fn usable_size(&self, ptr: *mut u8) -> usize {
        ffi::hm_usable_size(ptr as *mut _)
    }

    #[inline]
    fn lock(&self) {
        unsafe { ffi::hm_lock() }
    }

    #[inline]
    fn unlock(&self) {
        unsafe { ffi::hm_unlock() }
    }

    #[inline]
    unsafe fn realloc(&self, ptr: *mut u8, size: usize) -> *mut u8 {
        ffi::hm_realloc(ptr as *mut _, size) as *mut u8
    }

    #[inline]
    unsafe fn calloc(&self, count: usize, size: usize) -> *mut u8 {
        ffi::hm_calloc(count, size) as *mut u8
    }
}

#[cfg(feature = "interpose")]
impl ThreadHooks for ExternBridge {
    #[inline]
    fn hooks_present(&self) -> bool {
        unsafe { ffi::hm_thread_hooks_present() }
    }

    #[inline]
    fn thread_start(&self) {
        unsafe { ffi::hm_thread_start() }
    }

    #[inline]
    fn thread_exit(&self) {
        unsafe { ffi::hm_thread_exit() }
    }
}

/// Bind a [`Heap`] implementation to the interposition machinery.
///
/// Expand this in exactly one crate of the final cdylib link. It creates the
/// singleton [`HeapCell`] and exports the `hm_*` bridge symbols the platform
/// interceptors forward into:
///
/// ```ignore
/// use hookmalloc::redirect_heap;
///
/// #[derive(Default)]
/// struct MyHeap { /* ... */ }
///
/// unsafe impl hookmalloc::Heap for MyHeap { /* ... */ }
///
/// redirect_heap!(MyHeap);
/// ```
#[macro_export]
macro_rules! redirect_heap {
    ($heap:ty) => {
        #[doc(hidden)]
        pub static __HOOKMALLOC_CELL: $crate::HeapCell<$heap> = $crate::HeapCell::new();

        #[no_mangle]
        pub unsafe extern "C" fn hm_malloc(size: usize) -> *mut ::core::ffi::c_void {
            $crate::Bridge::alloc(&__HOOKMALLOC_CELL, size) as *mut ::core::ffi::c_void
        }

        #[no_mangle]
        pub unsafe extern "C" fn hm_free(ptr: *mut ::core::ffi::c_void) {
            $crate::Bridge::release(&__HOOKMALLOC_CELL, ptr as *mut u8)
        }

        #[no_mangle]
        pub unsafe extern "C" fn hm_memalign(
            align: usize,
            size: usize,
        ) -> *mut ::core::ffi::c_void {
            $crate::Bridge::alloc_aligned(&__HOOKMALLOC_CELL, align, size)
                as *mut ::core::ffi::c_void
        }

        #[no_mangle]
        pub unsafe extern "C" fn hm_usable_size(ptr: *mut ::core::ffi::c_void) -> usize {
            $crate::Bridge::usable_size(&__HOOKMALLOC_CELL, ptr as *mut u8)
        }

        #[no_mangle]
        pub unsafe extern "C" fn hm_lock() {
            $crate::Bridge::lock(&__HOOKMALLOC_CELL)
        }

        #[no_mangle]
        pub unsafe extern "C" fn hm_unlock() {
            $crate::Bridge::unlock(&__HOOKMALLOC_CELL)
        }

        #[no_mangle]
        pub unsafe extern "C" fn hm_realloc(
            ptr: *mut ::core::ffi::c_void,
            size: usize,
        ) -> *mut ::core::ffi::c_void {
            $crate::Bridge::realloc(&__HOOKMALLOC_CELL, ptr as *mut u8, size)
                as *mut ::core::ffi::c_void
        }

        #[no_mangle]
        pub unsafe extern "C" fn hm_calloc(
            count: usize,
            size: usize,
        ) -> *mut ::core::ffi::c_void {
            $crate::Bridge::calloc(&__HOOKMALLOC_CELL, count, size)
                as *mut ::core::ffi::c_void
        }

        #[no_mangle]
        pub unsafe extern "C" fn hm_thread_start() {
            $crate::ThreadHooks::thread_start(&__HOOKMALLOC_CELL)
        }

        #[no_mangle]
        pub unsafe extern "C" fn hm_thread_exit() {
            $crate::ThreadHooks::thread_exit(&__HOOKMALLOC_CELL)
        }

        #[no_mangle]
        pub extern "C" fn hm_thread_hooks_present() -> bool {
            <$heap as $crate::Heap>::HAS_THREAD_HOOKS
        }

        #[no_mangle]
        pub extern "C" fn hm_warm() {
            __HOOKMALLOC_CELL.warm()
        }
    };
}
