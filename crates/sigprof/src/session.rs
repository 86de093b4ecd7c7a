pub mod configuration;
pub mod exit_hook;
pub mod signal_watcher;

use std::io::Write;
use std::sync::Arc;

use self::configuration::Configuration;
use self::signal_watcher::{SignalEvent, SignalWatcher};
use crate::error::Result;
use crate::profile::Profile;
use crate::report::Reporter;
use crate::signal_scheduler::SignalScheduler;
use crate::util;

/// Everything one profiling run needs: the shared `Profile`, the timer
/// controller that feeds it, the reporter that reads it, and the exit and
/// dump-signal wiring around them.
pub struct Session {
    configuration: Configuration,
    scheduler: SignalScheduler,
    reporter: Reporter,
    watcher: Option<SignalWatcher>,
}

impl Session {
    pub fn new(configuration: Configuration) -> Result<Self> {
        configuration.validate()?;

        let profile = Arc::new(Profile::new(configuration.max_call_sites));
        let scheduler = SignalScheduler::new(Arc::clone(&profile))
            .restart_syscalls(configuration.restart_syscalls);
        let reporter = Reporter::new(
            profile,
            configuration.output.clone(),
            configuration.format,
        );
        Ok(Session {
            configuration,
            scheduler,
            reporter,
            watcher: None,
        })
    }

    pub fn configuration(&self) -> &Configuration {
        &self.configuration
    }

    pub fn profile(&self) -> &Arc<Profile> {
        self.scheduler.profile()
    }

    pub fn scheduler(&self) -> &SignalScheduler {
        &self.scheduler
    }

    pub fn reporter(&self) -> &Reporter {
        &self.reporter
    }

    /// Start sampling the calling thread.
    ///
    /// Counters are cleared. Dump signals start triggering reports, and with
    /// `report_at_exit` a report is written once when the process exits or is
    /// terminated by SIGINT, SIGTERM or SIGHUP.
    pub fn start(&mut self) -> Result<()> {
        #[cfg(feature = "debug")]
        crate::init_logging();

        self.scheduler
            .install(self.configuration.timer, self.configuration.interval)?;

        if self.watcher.is_none() {
            match self.watch_signals() {
                Ok(watcher) => self.watcher = watcher,
                Err(err) => {
                    self.scheduler.uninstall();
                    return Err(err);
                }
            }
        }

        if self.configuration.report_at_exit {
            let reporter = self.reporter.clone();
            exit_hook::register(move || report_or_log(&reporter, "exit"))?;
        }

        log::debug!(
            "Session started (output: {}, dump signals: {:?})",
            self.configuration.output,
            self.configuration.dump_signals
        );
        Ok(())
    }

    /// Stop sampling. Counters are kept, and dump signals and the exit
    /// report stay active so the final numbers can still be written.
    pub fn stop(&mut self) {
        self.scheduler.uninstall();
    }

    pub fn reset(&self) {
        self.scheduler.reset();
    }

    pub fn generate_report<W: Write + ?Sized>(&self, sink: &mut W) -> std::io::Result<()> {
        self.reporter.generate_report(sink)
    }

    pub fn trigger_report(&self) -> Result<()> {
        self.reporter.trigger_report()
    }

    fn watch_signals(&self) -> Result<Option<SignalWatcher>> {
        let dump_signals = &self.configuration.dump_signals;
        let terminate = self.configuration.report_at_exit;
        if dump_signals.is_empty() && !terminate {
            return Ok(None);
        }

        let reporter = self.reporter.clone();
        let watcher = SignalWatcher::watch(dump_signals, terminate, move |event| match event {
            SignalEvent::Dump(signal) => {
                log::debug!("Report requested by {:?}", signal);
                report_or_log(&reporter, "dump signal");
            }
            SignalEvent::Terminate(sig) => {
                log::debug!("Terminating on signal {}", sig);
                exit_hook::fire();
                util::reraise_with_default(sig);
            }
        })?;
        Ok(Some(watcher))
    }
}

fn report_or_log(reporter: &Reporter, trigger: &str) {
    if let Err(err) = reporter.trigger_report() {
        log::error!("Failed to write report on {}: {}", trigger, err);
    }
}
