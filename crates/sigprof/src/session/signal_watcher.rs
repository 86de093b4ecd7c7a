#![deny(unsafe_op_in_unsafe_fn)]

use std::ffi::{c_int, c_void};
use std::fs::File;
use std::io::{self, Read};
use std::os::fd::FromRawFd;
use std::sync::atomic::{AtomicI32, Ordering};
use std::thread::{self, JoinHandle};

use crate::error::{Error, Result};
use crate::session::configuration::{DumpSignal, TimerTarget};
use crate::util::{self, ErrnoGuard, SignalMask};

/// Signals that end the process by default and still deserve a final report.
pub const TERMINATION_SIGNALS: [c_int; 3] = [libc::SIGINT, libc::SIGTERM, libc::SIGHUP];

/// Write end of the watcher's pipe. -1 when no watcher is running.
static WATCHER_WRITE_FD: AtomicI32 = AtomicI32::new(-1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignalEvent {
    Dump(DumpSignal),
    Terminate(c_int),
}

/// Moves work requested by asynchronous signals (report dumps, termination)
/// out of signal context.
///
/// The handler only writes the signal number into a non-blocking pipe; a
/// dedicated thread reads it and runs the callback, where allocation, file
/// I/O and locks are fine.
pub struct SignalWatcher {
    signals: Vec<c_int>,
    write_fd: c_int,
    thread: Option<JoinHandle<()>>,
}

impl SignalWatcher {
    pub fn watch<F>(dump_signals: &[DumpSignal], terminate: bool, callback: F) -> Result<Self>
    where
        F: Fn(SignalEvent) + Send + 'static,
    {
        let [read_fd, write_fd] = util::setup_pipe()?;
        if WATCHER_WRITE_FD
            .compare_exchange(-1, write_fd, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            unsafe {
                libc::close(read_fd);
                libc::close(write_fd);
            }
            return Err(Error::AlreadyInstalled("a signal watcher"));
        }

        let dumps = dump_signals.to_vec();
        let reader = unsafe { File::from_raw_fd(read_fd) };
        let thread = thread::Builder::new()
            .name("sigprof-signal-watcher".to_owned())
            .spawn(move || Self::thread_main_loop(reader, &dumps, callback));
        let thread = match thread {
            Ok(thread) => thread,
            Err(source) => {
                WATCHER_WRITE_FD.store(-1, Ordering::SeqCst);
                unsafe { libc::close(write_fd) };
                return Err(Error::Os {
                    operation: "spawning the signal watcher thread",
                    source,
                });
            }
        };

        let mut watcher = Self {
            signals: vec![],
            write_fd,
            thread: Some(thread),
        };
        let wanted = dump_signals
            .iter()
            .map(|signal| signal.signal())
            .chain(terminate.then_some(TERMINATION_SIGNALS).into_iter().flatten());
        for sig in wanted {
            if watcher.signals.contains(&sig) {
                continue;
            }
            // On error, dropping `watcher` restores what was installed so far.
            util::install_signal_handler(sig, forward_to_watcher, &[], true)?;
            watcher.signals.push(sig);
        }
        log::debug!("Signal watcher started for signals {:?}", watcher.signals);
        Ok(watcher)
    }

    fn thread_main_loop<F>(mut reader: File, dump_signals: &[DumpSignal], callback: F)
    where
        F: Fn(SignalEvent),
    {
        // Timer ticks landing here would only be forwarded again.
        let _mask = SignalMask::block(&TimerTarget::all_signals());
        let mut buffer = [0u8; 64];
        loop {
            let n = match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    log::warn!("Signal watcher stopped: {}", err);
                    break;
                }
            };
            for &byte in &buffer[..n] {
                let sig = c_int::from(byte);
                let event = match dump_signals.iter().find(|d| d.signal() == sig) {
                    Some(dump) => SignalEvent::Dump(*dump),
                    None => SignalEvent::Terminate(sig),
                };
                log::trace!("Signal watcher received {:?}", event);
                callback(event);
            }
        }
        log::trace!("Signal watcher exiting");
    }
}

impl Drop for SignalWatcher {
    fn drop(&mut self) {
        WATCHER_WRITE_FD.store(-1, Ordering::SeqCst);
        for &sig in &self.signals {
            util::restore_default_handler(sig);
        }
        // EOF on the pipe stops the thread.
        unsafe { libc::close(self.write_fd) };
        if let Some(thread) = self.thread.take() {
            // A callback that re-raised a fatal signal never returns, and a
            // callback dropping its own watcher must not join itself.
            if thread.thread().id() != thread::current().id() {
                let _ = thread.join();
            }
        }
    }
}

extern "C" fn forward_to_watcher(sig: c_int, _info: *mut libc::siginfo_t, _ucontext: *mut c_void) {
    let _errno = ErrnoGuard::save();
    let fd = WATCHER_WRITE_FD.load(Ordering::SeqCst);
    if fd < 0 {
        return;
    }
    let byte = sig as u8;
    // A full pipe already holds pending requests; losing this one is fine.
    unsafe {
        libc::write(fd, &byte as *const u8 as *const c_void, 1);
    }
}
