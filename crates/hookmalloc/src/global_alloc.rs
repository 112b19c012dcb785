//! `#[global_allocator]` support: route a Rust host's own allocations
//! through the same bridge the C surface uses.
//!
//! ```rust,ignore
//! use hookmalloc::{BridgeAlloc, HeapCell};
//!
//! static CELL: HeapCell<MyHeap> = HeapCell::new();
//!
//! #[global_allocator]
//! static GLOBAL: BridgeAlloc<HeapCell<MyHeap>> = BridgeAlloc(&CELL);
//! ```

use crate::bridge::Bridge;
use crate::util::MIN_ALIGN;
use core::alloc::{GlobalAlloc, Layout};

/// A [`GlobalAlloc`] that delegates every operation to a bridge.
pub struct BridgeAlloc<B: Bridge + Sync + 'static>(pub &'static B);

unsafe impl<B: Bridge + Sync> GlobalAlloc for BridgeAlloc<B> {
    #[inline]
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let size = layout.size();
        let align = layout.align();

        // Zero-size types: a well-aligned dangling pointer, the standard
        // library's own pattern.
        if size == 0 {
            return align as *mut u8;
        }

        if align <= MIN_ALIGN {
            self.0.alloc(size)
        } else {
            self.0.alloc_aligned(align, size)
        }
    }

    #[inline]
    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let size = layout.size();
        let align = layout.align();

        if size == 0 {
            return align as *mut u8;
        }

        if align <= MIN_ALIGN {
            self.0.calloc(1, size)
        } else {
            let ptr = self.0.alloc_aligned(align, size);
            if !ptr.is_null() {
                core::ptr::write_bytes(ptr, 0, size);
            }
            ptr
        }
    }

    #[inline]
    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if layout.size() == 0 {
            return;
        }
        self.0.release(ptr);
    }

    #[inline]
    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let old_size = layout.size();
        let align = layout.align();

        if old_size == 0 {
            return self.alloc(Layout::from_size_align_unchecked(new_size, align));
        }

        if align <= MIN_ALIGN {
            self.0.realloc(ptr, new_size)
        } else {
            // The bridge realloc only guarantees MIN_ALIGN, so over-aligned
            // resizes go through alloc + copy + release.
            let new_ptr = self.0.alloc_aligned(align, new_size);
            if !new_ptr.is_null() {
                let copy = old_size.min(new_size);
                core::ptr::copy_nonoverlapping(ptr, new_ptr, copy);
                self.0.release(ptr);
            }
            new_ptr
        }
    }
}
