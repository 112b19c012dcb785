//! Platform interceptors: three mechanisms, one observable behavior.
//!
//! - Linux: strong-symbol definitions that win the dynamic search order
//!   (`LD_PRELOAD`).
//! - macOS: `__DATA,__interpose` tuples applied by dyld at image map time,
//!   plus a synthesized malloc zone (`DYLD_INSERT_LIBRARIES`).
//! - Windows: CRT entry-point patching at load time (DLL injection), with an
//!   optional early-load import-table redirect in a sibling crate.
//!
//! Each interceptor is a thin adapter: every captured entry point funnels
//! into the bridge seam, with the shared bodies in [`crate::wrap`].

#[cfg(all(feature = "interpose", target_os = "linux"))]
pub mod linux;

#[cfg(all(feature = "interpose", target_os = "macos"))]
pub mod macos;

#[cfg(all(feature = "interpose", target_os = "windows"))]
pub mod windows;
