//! Edge-triggered, one-shot notification on queue non-emptiness.
//!
//! The kernel's own `mq_notify(2)` with `SIGEV_THREAD` hands a C function
//! pointer to glibc, which spawns the callback on a fresh pthread. Rust code
//! cannot hand the kernel a closure, so instead we register an `extern "C"`
//! trampoline and look the real callback up in a process-wide table keyed by
//! the `sigval` token glibc hands back — the same indirection libraries use
//! to bridge POSIX timer callbacks into managed languages.

use std::collections::HashMap;
use std::os::raw::c_void;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};

type Callback = Box<dyn Fn() + Send + 'static>;

fn registry() -> &'static Mutex<HashMap<usize, Callback>> {
    static REGISTRY: OnceLock<Mutex<HashMap<usize, Callback>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

fn next_token() -> usize {
    static NEXT: AtomicUsize = AtomicUsize::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// Registers `callback` under a fresh token and returns it. The token is
/// embedded in the `sigevent`'s `sigev_value` so the trampoline can find the
/// right closure when the kernel fires it.
pub(crate) fn register(callback: Callback) -> usize {
    let token = next_token();
    registry().lock().unwrap().insert(token, callback);
    token
}

/// Removes a token's callback without invoking it, used by `disarm`.
pub(crate) fn unregister(token: usize) {
    registry().lock().unwrap().remove(&token);
}

/// The `extern "C"` function handed to the kernel as `sigev_notify_function`.
/// Runs on whatever thread glibc spawned for `SIGEV_THREAD`; it looks up and
/// removes the callback (the notification is one-shot) and then invokes it.
pub(crate) extern "C" fn trampoline(value: libc::sigval) {
    let token = value.sival_ptr as usize;
    let callback = registry().lock().unwrap().remove(&token);
    if let Some(callback) = callback {
        callback();
    }
}

/// Builds a `sigevent` requesting `SIGEV_THREAD` delivery for `token`.
pub(crate) fn sigevent_for(token: usize) -> libc::sigevent {
    // SAFETY: `sigevent` is a plain data struct; zeroing it is a valid initial
    // state for every field we do not explicitly set below.
    let mut sev: libc::sigevent = unsafe { std::mem::zeroed() };
    sev.sigev_notify = libc::SIGEV_THREAD;
    sev.sigev_value = libc::sigval {
        sival_ptr: token as *mut c_void,
    };
    sev.sigev_notify_function = Some(trampoline);
    sev.sigev_notify_attributes = std::ptr::null_mut();
    sev
}
