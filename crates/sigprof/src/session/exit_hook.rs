//! A single process-exit callback, run at most once: from `atexit` on normal
//! exit, or earlier through [`fire`] when a termination signal arrives.

use std::sync::{Mutex, Once, PoisonError};

use crate::error::{Error, Result};

type Hook = Box<dyn FnOnce() + Send>;

static HOOK: Mutex<Option<Hook>> = Mutex::new(None);
static ATEXIT: Once = Once::new();

/// Register `hook`, replacing any hook that has not run yet.
pub fn register<F>(hook: F) -> Result<()>
where
    F: FnOnce() + Send + 'static,
{
    *HOOK.lock().unwrap_or_else(PoisonError::into_inner) = Some(Box::new(hook));

    let mut result = Ok(());
    ATEXIT.call_once(|| {
        if unsafe { libc::atexit(run_at_exit) } != 0 {
            result = Err(Error::Os {
                operation: "atexit",
                source: std::io::Error::other("atexit registration failed"),
            });
        }
    });
    result
}

/// Drop the registered hook without running it.
pub fn cancel() {
    HOOK.lock().unwrap_or_else(PoisonError::into_inner).take();
}

/// Run the hook now if it has not run yet. Returns whether it ran.
pub fn fire() -> bool {
    let hook = HOOK.lock().unwrap_or_else(PoisonError::into_inner).take();
    match hook {
        Some(hook) => {
            hook();
            true
        }
        None => false,
    }
}

extern "C" fn run_at_exit() {
    fire();
}
