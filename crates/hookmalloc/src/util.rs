use core::sync::atomic::{AtomicUsize, Ordering};

/// Align `value` up to the next multiple of `align`.
/// `align` must be a power of two.
#[inline(always)]
pub const fn align_up(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

/// Check if `value` is aligned to `align`.
#[inline(always)]
pub const fn is_aligned(value: usize, align: usize) -> bool {
    value & (align - 1) == 0
}

/// Minimum alignment for all allocations (matches max_align_t on 64-bit).
pub const MIN_ALIGN: usize = 16;

static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

/// Query the platform page size, cached after the first call.
pub fn page_size() -> usize {
    let cached = PAGE_SIZE.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }
    let size = query_page_size();
    PAGE_SIZE.store(size, Ordering::Relaxed);
    size
}

#[cfg(unix)]
fn query_page_size() -> usize {
    let n = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if n < 1 {
        4096
    } else {
        n as usize
    }
}

#[cfg(windows)]
fn query_page_size() -> usize {
    use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};
    unsafe {
        let mut info: SYSTEM_INFO = core::mem::zeroed();
        GetSystemInfo(&mut info);
        if info.dwPageSize == 0 {
            4096
        } else {
            info.dwPageSize as usize
        }
    }
}

/// A cheap identifier for the calling thread, nonzero on every platform.
/// Used to detect reentrant calls during heap construction without touching
/// thread-local storage (which may not exist that early).
#[inline]
pub fn current_thread_id() -> usize {
    #[cfg(unix)]
    unsafe {
        libc::pthread_self() as usize
    }
    #[cfg(windows)]
    unsafe {
        windows_sys::Win32::System::Threading::GetCurrentThreadId() as usize
    }
}

/// Set errno (and on Windows also the last-error code) to ENOMEM.
pub fn set_enomem() {
    #[cfg(target_os = "linux")]
    unsafe {
        *libc::__errno_location() = libc::ENOMEM;
    }
    #[cfg(target_os = "macos")]
    unsafe {
        *libc::__error() = libc::ENOMEM;
    }
    #[cfg(windows)]
    unsafe {
        const ENOMEM: i32 = 12;
        const ERROR_NOT_ENOUGH_MEMORY: u32 = 8;
        extern "C" {
            fn _set_errno(value: i32) -> i32;
        }
        _set_errno(ENOMEM);
        windows_sys::Win32::Foundation::SetLastError(ERROR_NOT_ENOUGH_MEMORY);
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
    {}
}

/// Write a message to stderr without allocating, then abort.
/// Used where the C ABI leaves no way to report failure by value.
#[cold]
pub fn fail(msg: &str) -> ! {
    #[cfg(unix)]
    unsafe {
        libc::write(2, msg.as_ptr() as *const libc::c_void, msg.len());
        libc::abort();
    }
    #[cfg(windows)]
    {
        let _ = msg;
        std::process::abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_next_multiple() {
        assert_eq!(align_up(0, 16), 0);
        assert_eq!(align_up(1, 16), 16);
        assert_eq!(align_up(16, 16), 16);
        assert_eq!(align_up(17, 16), 32);
        assert_eq!(align_up(4095, 4096), 4096);
    }

    #[test]
    fn is_aligned_checks_mask() {
        assert!(is_aligned(0, 8));
        assert!(is_aligned(64, 64));
        assert!(!is_aligned(65, 64));
    }

    #[test]
    fn page_size_is_a_power_of_two() {
        let p = page_size();
        assert!(p >= 4096);
        assert!(p.is_power_of_two());
    }

    #[test]
    fn thread_id_is_nonzero_and_stable() {
        let a = current_thread_id();
        let b = current_thread_id();
        assert_ne!(a, 0);
        assert_eq!(a, b);
    }
}
