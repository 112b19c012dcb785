//! The allocator contract: the fixed surface a user heap must implement.
//!
//! No component other than [`HeapCell`](crate::bridge::HeapCell) is allowed
//! to call these methods directly; everything else goes through the bridge.

/// The operations a user-supplied heap must provide to be interposed.
///
/// Optional capabilities (`realloc`, thread hooks) are opted into with the
/// associated consts. The flags are compile-time configuration: the bridge
/// branches on them and monomorphization folds the unused paths away.
///
/// Construction happens through [`Default`] on first use, from whichever
/// thread touches the bridge first. The constructor may itself allocate;
/// such calls are served from a fixed init buffer until the heap is ready.
///
/// # Safety
///
/// Implementations must uphold the usual allocator guarantees:
///
/// - `alloc(size)` returns null or a pointer to at least `size` writable
///   bytes, aligned to [`MIN_ALIGN`](crate::util::MIN_ALIGN), that does not
///   overlap any other live allocation.
/// - `alloc_aligned(align, size)` is the same with alignment `align`; the
///   caller guarantees `align` is a power of two.
/// - `usable_size(ptr)` for a live pointer returns at least the size
///   requested when it was allocated, and never 0. (The macOS zone runtime
///   treats a zero size for a live pointer as fatal. On Windows, a zero
///   result is how foreign pointers are recognized, so it must also be the
///   answer for pointers this heap does not own.)
/// - After `lock()` returns, no other thread holds heap-internal locks;
///   `unlock()` releases them. This is the outermost barrier used across
///   `fork`. Heaps with purely fine-grained locking may make these no-ops.
pub unsafe trait Heap: Default + Sync + 'static {
    /// Allocate `size` bytes. Null on exhaustion. `size == 0` may return a
    /// distinguishable pointer, but it must be releasable.
    fn alloc(&self, size: usize) -> *mut u8;

    /// Release an allocation. Never called with null.
    ///
    /// # Safety
    /// `ptr` was previously returned by this heap and is not released twice.
    unsafe fn release(&self, ptr: *mut u8);

    /// Allocate `size` bytes aligned to `align` (a power of two).
    fn alloc_aligned(&self, align: usize, size: usize) -> *mut u8;

    /// Usable bytes at `ptr`. Never called with null.
    ///
    /// # Safety
    /// `ptr` was previously returned by this heap, or (on platforms where
    /// foreign pointers can reach the heap) points outside it, in which
    /// case the result must be 0.
    unsafe fn usable_size(&self, ptr: *mut u8) -> usize;

    /// Acquire every heap-internal lock. See the trait-level fork contract.
    fn lock(&self);

    /// Release the locks taken by [`lock`](Heap::lock).
    fn unlock(&self);

    /// Whether [`realloc`](Heap::realloc) is natively implemented. When
    /// false the bridge synthesizes reallocation from
    /// alloc / copy / release.
    const HAS_REALLOC: bool = false;

    /// Native reallocation. Only called when [`HAS_REALLOC`](Heap::HAS_REALLOC)
    /// is true; `ptr` is non-null and `size` nonzero.
    ///
    /// # Safety
    /// Same requirements as `release` for `ptr`.
    unsafe fn realloc(&self, ptr: *mut u8, size: usize) -> *mut u8 {
        let _ = (ptr, size);
        core::ptr::null_mut()
    }

    /// Whether the heap wants thread lifecycle notifications. When false the
    /// thread controller stays a pass-through and never wraps thread
    /// creation.
    const HAS_THREAD_HOOKS: bool = false;

    /// Called in a newly created thread before its start routine runs.
    /// Allocation is fully operational at this point.
    fn thread_start(&self) {}

    /// Called just before a thread exits, by return or by the platform exit
    /// primitive.
    fn thread_exit(&self) {}
}
