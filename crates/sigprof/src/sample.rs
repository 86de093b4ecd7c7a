use std::ffi::c_void;

use crate::backtrace::Backtrace;

/// Deepest stack a single sample records. Frames beyond this are ignored.
pub const MAX_STACK_DEPTH: usize = 256;

/// Identity of the function enclosing a call site (its entry address for
/// native frames). Recursion is detected by comparing code units.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CodeUnit(pub usize);

/// One location in the profiled program: the enclosing code unit and the
/// instruction address executing within it.
///
/// For caller frames the address points into the call instruction (return
/// address minus one), so it symbolizes to the line of the call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallSite {
    pub code_unit: CodeUnit,
    pub address: usize,
}

impl CallSite {
    pub fn new(code_unit: usize, address: usize) -> Self {
        Self {
            code_unit: CodeUnit(code_unit),
            address,
        }
    }
}

/// A call stack captured at one tick, innermost frame first. The caller of
/// `call_sites()[i]` is `call_sites()[i + 1]`; the last entry is the root.
///
/// Fixed-size so that capturing never allocates.
#[derive(Clone, Debug)]
pub struct Sample {
    depth: usize,
    call_sites: [CallSite; MAX_STACK_DEPTH],
}

impl Sample {
    fn empty() -> Self {
        Self {
            depth: 0,
            call_sites: [CallSite::default(); MAX_STACK_DEPTH],
        }
    }

    /// Build a sample from call sites ordered innermost first. Anything past
    /// `MAX_STACK_DEPTH` is dropped.
    pub fn from_call_sites<I>(call_sites: I) -> Self
    where
        I: IntoIterator<Item = CallSite>,
    {
        let mut sample = Self::empty();
        for call_site in call_sites {
            if !sample.push(call_site) {
                break;
            }
        }
        sample
    }

    /// Capture the stack that was executing when the signal carrying
    /// `ucontext` arrived.
    ///
    /// Returns `None` when the interrupted frame cannot be located or the
    /// stack is empty; the caller drops the tick.
    ///
    /// Nearly async-signal-safe: no allocation and no locks of our own, but
    /// the platform unwinder may consult the dynamic loader's tables.
    pub fn capture(ucontext: *const c_void, handler_address: usize) -> Option<Self> {
        let mut sample = Self::empty();
        let found = unsafe {
            Backtrace::trace_interrupted(ucontext, handler_address, |call_site| {
                sample.push(call_site)
            })
        };
        if !found || sample.depth == 0 {
            return None;
        }
        Some(sample)
    }

    fn push(&mut self, call_site: CallSite) -> bool {
        if self.depth == MAX_STACK_DEPTH {
            return false;
        }
        self.call_sites[self.depth] = call_site;
        self.depth += 1;
        true
    }

    pub fn call_sites(&self) -> &[CallSite] {
        &self.call_sites[..self.depth]
    }

    pub fn innermost(&self) -> Option<&CallSite> {
        self.call_sites().first()
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn is_empty(&self) -> bool {
        self.depth == 0
    }
}
