//! hookmalloc: scaffolding that diverts a process's standard allocation
//! surface into a user-supplied heap.
//!
//! The user implements the [`Heap`] contract and binds it with
//! [`redirect_heap!`]; this crate supplies everything else: the bridge the
//! platform entry points funnel into, the uniform ANSI semantics wrappers,
//! the per-platform interception machinery (strong symbols on Linux, dyld
//! interpose tables and a synthesized malloc zone on macOS, CRT entry-point
//! patching on Windows), fork safety, and thread lifecycle hooks with a
//! two-phase readiness handshake.
//!
//! The interception layer is behind the `interpose` feature and only makes
//! sense in a `cdylib` loaded into the target process (`LD_PRELOAD`,
//! `DYLD_INSERT_LIBRARIES`, or DLL injection). Without the feature the crate
//! is an ordinary library: the bridge, wrappers, and controller are all
//! usable and testable directly.

#[cfg(unix)]
extern crate libc;

pub mod boot;
pub mod bridge;
pub mod fork;
pub mod global_alloc;
pub mod heap;
pub mod init;
pub mod platform;
pub mod threads;
pub mod util;
pub mod wrap;

pub use bridge::{Bridge, HeapCell, ThreadHooks};
pub use global_alloc::BridgeAlloc;
pub use heap::Heap;

#[cfg(feature = "interpose")]
pub use bridge::{ExternBridge, EXTERN_BRIDGE};
