//! Thread lifecycle controller: wraps thread creation and exit so a
//! thread-aware heap sees `thread_start` / `thread_exit` at the right
//! moments.
//!
//! While [`hooks_ready`](crate::init::hooks_ready) is false, or when the
//! heap declares no hooks, every intercepted call passes through to the real
//! platform routine unchanged. The platform layers supply the actual
//! creation primitive; the ownership dance around the wrapper record lives
//! here.

use crate::bridge::{Bridge, ThreadHooks};
use core::cell::Cell;
use core::ffi::c_void;
use core::mem;
use core::sync::atomic::{AtomicBool, Ordering};

/// The shape of a thread start routine as the platform hands it to us.
/// `C-unwind` so a forced unwind out of the user routine (glibc
/// `pthread_exit`, cancellation) can cross the trampoline frame and still
/// run its cleanup guard.
pub type StartRoutine = unsafe extern "C-unwind" fn(*mut c_void) -> *mut c_void;

static ANY_THREAD_CREATED: AtomicBool = AtomicBool::new(false);

/// Whether any thread has been created through the controller. Heaps may
/// consult this to elide locks while the process is still single-threaded.
#[inline]
pub fn any_thread_created() -> bool {
    ANY_THREAD_CREATED.load(Ordering::Relaxed)
}

pub(crate) fn note_thread_created() {
    ANY_THREAD_CREATED.store(true, Ordering::Relaxed);
}

/// Bundle of the user's start routine and argument, carried through the
/// creation primitive. Uniquely owned by the requesting thread until the
/// primitive returns, by the new thread afterwards, and by exactly one of
/// them on failure.
struct ThreadRecord<B: 'static> {
    bridge: &'static B,
    start: StartRoutine,
    arg: *mut c_void,
}

thread_local! {
    static EXIT_HOOK_RAN: Cell<bool> = const { Cell::new(false) };
}

/// Run the exit hook at most once per thread. Both the trampoline's guard
/// and an interposed exit primitive funnel through here, so a thread that
/// calls the exit primitive from inside its start routine does not fire the
/// hook twice.
pub fn run_exit_hook<B: ThreadHooks>(bridge: &B) {
    let first = EXIT_HOOK_RAN
        .try_with(|ran| !ran.replace(true))
        .unwrap_or(true);
    if first {
        bridge.thread_exit();
    }
}

struct ExitGuard<B: ThreadHooks + 'static> {
    bridge: &'static B,
}

impl<B: ThreadHooks + 'static> Drop for ExitGuard<B> {
    fn drop(&mut self) {
        run_exit_hook(self.bridge);
    }
}

/// Runs in the new thread: start hook, user routine, exit hook.
unsafe extern "C-unwind" fn trampoline<B: Bridge + ThreadHooks + Sync + 'static>(
    raw: *mut c_void,
) -> *mut c_void {
    let record = raw.cast::<ThreadRecord<B>>().read();
    record.bridge.thread_start();
    record.bridge.release(raw as *mut u8);
    let _guard = ExitGuard {
        bridge: record.bridge,
    };
    (record.start)(record.arg)
}

/// Create a thread, wrapping its start routine when the hooks are live.
///
/// `create` is the real platform primitive, abstracted so each platform (and
/// the tests) can supply its own. It receives the routine and argument to
/// hand to the kernel and returns the primitive's error code. When the
/// controller is not ready, when the heap declares no hooks, or when the
/// record allocation fails, the user routine is passed through untouched.
pub unsafe fn create_thread<B, F>(
    bridge: &'static B,
    start: StartRoutine,
    arg: *mut c_void,
    create: F,
) -> i32
where
    B: Bridge + ThreadHooks + Sync,
    F: FnOnce(StartRoutine, *mut c_void) -> i32,
{
    if !crate::init::hooks_ready() || !bridge.hooks_present() {
        return create(start, arg);
    }

    note_thread_created();

    let raw = bridge.alloc(mem::size_of::<ThreadRecord<B>>()) as *mut ThreadRecord<B>;
    if raw.is_null() {
        return create(start, arg);
    }
    raw.write(ThreadRecord { bridge, start, arg });

    let rc = create(trampoline::<B>, raw as *mut c_void);
    if rc != 0 {
        // The new thread never existed; ownership stays here.
        bridge.release(raw as *mut u8);
    }
    rc
}
