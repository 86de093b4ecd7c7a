extern crate serde;
#[macro_use]
extern crate serde_derive;

pub mod backtrace;
pub mod error;
pub mod profile;
pub mod report;
pub mod sample;
pub mod session;
pub mod signal_scheduler;
mod util;

pub use crate::backtrace::{NativeSymbolizer, Symbolizer};
pub use crate::error::{Error, Result};
pub use crate::profile::{Profile, SampleCounters, Snapshot};
pub use crate::report::{Location, Report, ReportEntry, Reporter};
pub use crate::sample::{CallSite, CodeUnit, Sample};
pub use crate::session::configuration::{
    Configuration, DumpSignal, Output, ReportFormat, TimerTarget,
};
pub use crate::session::Session;
pub use crate::signal_scheduler::SignalScheduler;

/// Route `log` output to stderr. Safe to call more than once.
#[cfg(feature = "debug")]
pub fn init_logging() {
    let _ = env_logger::builder()
        .format_timestamp(None)
        .format_module_path(false)
        .try_init();
}
