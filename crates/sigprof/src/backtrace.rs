#![deny(unsafe_op_in_unsafe_fn)]

use std::collections::HashMap;
use std::ffi::c_void;
use std::path::Path;

use crate::report::Location;
use crate::sample::CallSite;
use crate::util::sigprof_ucontext_pc;

/// Frames the fallback walker passes over after the handler's own frame
/// (the kernel's signal trampoline).
const TRAMPOLINE_FRAMES: usize = 1;

pub struct Backtrace {}

impl Backtrace {
    /// Walk the stack interrupted by a signal, innermost frame first, calling
    /// `on_frame` until it returns `false` or the stack is exhausted.
    ///
    /// Frames belonging to the signal handler are skipped: the walk starts at
    /// the frame whose instruction pointer equals the program counter saved in
    /// `ucontext`. Where that cannot be read, it starts two frames past the
    /// frame whose function is `handler_address`.
    ///
    /// Returns whether the interrupted frame was found.
    ///
    /// # Safety
    ///
    /// Must only be called from a signal handler on the interrupted thread,
    /// with `ucontext` being the handler's third argument (or null).
    pub unsafe fn trace_interrupted<F>(
        ucontext: *const c_void,
        handler_address: usize,
        mut on_frame: F,
    ) -> bool
    where
        F: FnMut(CallSite) -> bool,
    {
        let interrupted_pc = unsafe { sigprof_ucontext_pc(ucontext) };
        let mut found = false;
        let mut seen_handler = false;
        let mut trampoline_remaining = TRAMPOLINE_FRAMES;

        unsafe {
            backtrace::trace_unsynchronized(|frame| {
                let ip = frame.ip() as usize;
                if ip == 0 {
                    return true;
                }

                let innermost = !found;
                if !found {
                    if interrupted_pc != 0 {
                        if ip != interrupted_pc {
                            return true;
                        }
                    } else if !seen_handler {
                        seen_handler = frame.symbol_address() as usize == handler_address;
                        return true;
                    } else if trampoline_remaining > 0 {
                        trampoline_remaining -= 1;
                        return true;
                    }
                    found = true;
                }

                let address = if innermost { ip } else { ip - 1 };
                let code_unit = match frame.symbol_address() as usize {
                    0 => address,
                    start => start,
                };
                on_frame(CallSite::new(code_unit, address))
            });
        }

        found
    }
}

/// Turns captured call sites into human-readable locations.
pub trait Symbolizer {
    fn locate(&mut self, call_site: &CallSite) -> Location;
}

/// Resolves addresses of the current process through its debug info.
#[derive(Debug, Default)]
pub struct NativeSymbolizer {
    cache: HashMap<usize, Location>,
}

impl NativeSymbolizer {
    pub fn new() -> Self {
        Self::default()
    }

    fn resolve(address: usize) -> Location {
        let mut location = Location {
            file: "??".to_owned(),
            line: 0,
            function: format!("{:#x}", address),
        };
        // `backtrace::resolve` treats its argument as a return address and
        // looks up the byte before it. Call site addresses are already the
        // instruction to attribute.
        let lookup = address.wrapping_add(1) as *mut c_void;
        // Inlined frames are reported innermost first; the last one is the
        // function that owns the code unit.
        backtrace::resolve(lookup, |symbol| {
            if let Some(name) = symbol.name() {
                location.function = format!("{:#}", name);
            }
            if let Some(file) = symbol.filename().and_then(Path::file_name) {
                location.file = file.to_string_lossy().into_owned();
            }
            if let Some(line) = symbol.lineno() {
                location.line = line;
            }
        });
        location
    }
}

impl Symbolizer for NativeSymbolizer {
    fn locate(&mut self, call_site: &CallSite) -> Location {
        self.cache
            .entry(call_site.address)
            .or_insert_with(|| Self::resolve(call_site.address))
            .clone()
    }
}
