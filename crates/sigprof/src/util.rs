#![deny(unsafe_op_in_unsafe_fn)]

//! Operating system helpers shared by the scheduler and the signal watcher.

use std::ffi::{c_int, c_void};
use std::mem;
use std::ptr::{null, null_mut};

use crate::error::{Error, Result};

extern "C" {
    /// Defined in `src/ucontext.c`. Returns 0 when unavailable on the target.
    pub fn sigprof_ucontext_pc(context: *const c_void) -> usize;
}

/// Signature of every `SA_SIGINFO` handler installed by this crate.
pub type SignalHandler = extern "C" fn(c_int, *mut libc::siginfo_t, *mut c_void);

/// Kernel thread id on Linux, `pthread_t` elsewhere. Must be async-signal-safe.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn current_thread_id() -> usize {
    unsafe { libc::syscall(libc::SYS_gettid) as usize }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub fn current_thread_id() -> usize {
    unsafe { libc::pthread_self() as usize }
}

/// Send `sig` to a thread of this process. Async-signal-safe.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn signal_thread(thread_id: usize, sig: c_int) -> bool {
    unsafe { libc::syscall(libc::SYS_tgkill, libc::getpid(), thread_id as libc::pid_t, sig) == 0 }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub fn signal_thread(thread_id: usize, sig: c_int) -> bool {
    unsafe { libc::pthread_kill(thread_id as libc::pthread_t, sig) == 0 }
}

/// Blocks a set of signals on the current thread until dropped.
pub struct SignalMask {
    previous: libc::sigset_t,
}

impl SignalMask {
    pub fn block(signals: &[c_int]) -> Self {
        unsafe {
            let mut set: libc::sigset_t = mem::zeroed();
            libc::sigemptyset(&mut set);
            for &sig in signals {
                libc::sigaddset(&mut set, sig);
            }
            let mut previous: libc::sigset_t = mem::zeroed();
            libc::pthread_sigmask(libc::SIG_BLOCK, &set, &mut previous);
            Self { previous }
        }
    }
}

impl Drop for SignalMask {
    fn drop(&mut self) {
        unsafe {
            libc::pthread_sigmask(libc::SIG_SETMASK, &self.previous, null_mut());
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn errno_location() -> *mut c_int {
    unsafe { libc::__errno_location() }
}

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "dragonfly"
))]
fn errno_location() -> *mut c_int {
    unsafe { libc::__error() }
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "dragonfly"
)))]
fn errno_location() -> *mut c_int {
    null_mut()
}

/// Saves `errno` on creation and restores it on drop.
///
/// Signal handlers run between arbitrary instructions of the interrupted code,
/// which may be about to read `errno` from a failed call.
pub struct ErrnoGuard {
    saved: c_int,
}

impl ErrnoGuard {
    pub fn save() -> Self {
        let location = errno_location();
        let saved = if location.is_null() {
            0
        } else {
            unsafe { *location }
        };
        Self { saved }
    }
}

impl Drop for ErrnoGuard {
    fn drop(&mut self) {
        let location = errno_location();
        if !location.is_null() {
            unsafe { *location = self.saved };
        }
    }
}

/// Install `handler` for `sig`. The signal itself and `also_mask` are blocked
/// while the handler runs.
pub fn install_signal_handler(
    sig: c_int,
    handler: SignalHandler,
    also_mask: &[c_int],
    restart_syscalls: bool,
) -> Result<()> {
    unsafe {
        let mut sa: libc::sigaction = mem::zeroed();
        sa.sa_sigaction = handler as *const () as usize;
        sa.sa_flags = libc::SA_SIGINFO;
        if restart_syscalls {
            sa.sa_flags |= libc::SA_RESTART;
        }
        libc::sigemptyset(&mut sa.sa_mask);
        libc::sigaddset(&mut sa.sa_mask, sig);
        for &other in also_mask {
            libc::sigaddset(&mut sa.sa_mask, other);
        }
        if libc::sigaction(sig, &sa, null_mut()) != 0 {
            return Err(Error::last_os_error("sigaction"));
        }
    }
    log::debug!("Signal handler installed for signal {}", sig);
    Ok(())
}

/// Whether `handler` is the currently registered disposition for `sig`.
pub fn is_handler_installed(sig: c_int, handler: SignalHandler) -> bool {
    unsafe {
        let mut current: libc::sigaction = mem::zeroed();
        if libc::sigaction(sig, null(), &mut current) != 0 {
            return false;
        }
        current.sa_sigaction == handler as *const () as usize
    }
}

/// Restore the default disposition for `sig`.
///
/// Passes through `SIG_IGN` first: POSIX discards pending instances of a
/// signal whose action is set to ignore, so a tick already queued cannot hit
/// the default action (which terminates the process for the timer signals).
pub fn restore_default_handler(sig: c_int) {
    unsafe {
        let mut sa: libc::sigaction = mem::zeroed();
        libc::sigemptyset(&mut sa.sa_mask);
        sa.sa_sigaction = libc::SIG_IGN;
        libc::sigaction(sig, &sa, null_mut());
        sa.sa_sigaction = libc::SIG_DFL;
        libc::sigaction(sig, &sa, null_mut());
    }
    log::debug!("Default disposition restored for signal {}", sig);
}

/// Deliver `sig` to the calling thread with its default disposition,
/// typically terminating the process.
pub fn reraise_with_default(sig: c_int) {
    unsafe {
        let mut sa: libc::sigaction = mem::zeroed();
        libc::sigemptyset(&mut sa.sa_mask);
        sa.sa_sigaction = libc::SIG_DFL;
        libc::sigaction(sig, &sa, null_mut());

        let mut set: libc::sigset_t = mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, sig);
        libc::pthread_sigmask(libc::SIG_UNBLOCK, &set, null_mut());

        libc::raise(sig);
    }
}

/// Create a pipe whose write end is non-blocking, so a signal handler writing
/// into it can never stall. Both ends are close-on-exec.
///
/// Returns `[read_fd, write_fd]`.
pub fn setup_pipe() -> Result<[c_int; 2]> {
    let mut fds: [c_int; 2] = [-1; 2];
    unsafe {
        if libc::pipe(fds.as_mut_ptr()) != 0 {
            return Err(Error::last_os_error("pipe"));
        }
        for &fd in &fds {
            libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
        }
        let flags = libc::fcntl(fds[1], libc::F_GETFL);
        if flags < 0 || libc::fcntl(fds[1], libc::F_SETFL, flags | libc::O_NONBLOCK) != 0 {
            let err = Error::last_os_error("fcntl(F_SETFL, O_NONBLOCK)");
            libc::close(fds[0]);
            libc::close(fds[1]);
            return Err(err);
        }
    }
    Ok(fds)
}
