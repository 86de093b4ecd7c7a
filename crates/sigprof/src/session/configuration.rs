use std::ffi::c_int;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::profile::DEFAULT_MAX_CALL_SITES;

pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(10);
pub const DEFAULT_TIMER: TimerTarget = TimerTarget::Real;

/// itimerval resolution.
pub const MIN_INTERVAL: Duration = Duration::from_micros(1);

#[derive(Clone, Debug)]
pub struct Configuration {
    pub timer: TimerTarget,
    pub interval: Duration,
    pub output: Output,
    pub format: ReportFormat,
    pub dump_signals: Vec<DumpSignal>,
    /// Write a report when the process exits or is terminated by
    /// SIGINT/SIGTERM/SIGHUP.
    pub report_at_exit: bool,
    pub restart_syscalls: bool,
    pub max_call_sites: usize,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            timer: DEFAULT_TIMER,
            interval: DEFAULT_INTERVAL,
            output: Output::Stderr,
            format: ReportFormat::Text,
            dump_signals: vec![],
            report_at_exit: true,
            restart_syscalls: false,
            max_call_sites: DEFAULT_MAX_CALL_SITES,
        }
    }
}

impl Configuration {
    pub fn validate(&self) -> Result<()> {
        validate_interval(self.interval)?;
        if self.max_call_sites == 0 {
            return Err(Error::Configuration(
                "max_call_sites must be greater than zero".to_owned(),
            ));
        }
        Ok(())
    }
}

pub fn validate_interval(interval: Duration) -> Result<()> {
    if interval < MIN_INTERVAL {
        return Err(Error::Configuration(format!(
            "interval must be at least {:?} (got {:?})",
            MIN_INTERVAL, interval
        )));
    }
    Ok(())
}

/// Convert a sampling interval given in (fractional) seconds.
pub fn parse_interval_secs(secs: f64) -> Result<Duration> {
    if !secs.is_finite() || secs <= 0.0 {
        return Err(Error::Configuration(format!(
            "interval must be a positive number of seconds (got {})",
            secs
        )));
    }
    let interval = Duration::try_from_secs_f64(secs)
        .map_err(|err| Error::Configuration(format!("interval {}: {}", secs, err)))?;
    validate_interval(interval)?;
    Ok(interval)
}

/// Which clock drives sampling.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TimerTarget {
    /// Process CPU time, user and system (`ITIMER_PROF` / `SIGPROF`).
    Cpu,
    /// Process user-mode CPU time (`ITIMER_VIRTUAL` / `SIGVTALRM`).
    User,
    /// Wall-clock time (`ITIMER_REAL` / `SIGALRM`).
    Real,
}

impl TimerTarget {
    pub const ALL: [TimerTarget; 3] = [TimerTarget::Cpu, TimerTarget::User, TimerTarget::Real];

    pub fn signal(self) -> c_int {
        match self {
            TimerTarget::Cpu => libc::SIGPROF,
            TimerTarget::User => libc::SIGVTALRM,
            TimerTarget::Real => libc::SIGALRM,
        }
    }

    pub fn all_signals() -> [c_int; 3] {
        Self::ALL.map(Self::signal)
    }
}

impl FromStr for TimerTarget {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cpu" => Ok(Self::Cpu),
            "user" => Ok(Self::User),
            "real" => Ok(Self::Real),
            _ => Err(Error::Configuration(format!(
                "invalid timer target '{}'. Valid values are 'cpu', 'user' and 'real'.",
                s
            ))),
        }
    }
}

impl fmt::Display for TimerTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TimerTarget::Cpu => "cpu",
            TimerTarget::User => "user",
            TimerTarget::Real => "real",
        })
    }
}

/// Where `trigger_report` writes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Output {
    #[default]
    Stderr,
    /// Created (or truncated) on every report.
    File(PathBuf),
}

impl fmt::Display for Output {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Output::Stderr => f.write_str("stderr"),
            Output::File(path) => write!(f, "{}", path.display()),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReportFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for ReportFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(Error::Configuration(format!(
                "invalid report format '{}'. Valid values are 'text' and 'json'.",
                s
            ))),
        }
    }
}

/// User signals that request a report while sampling continues.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DumpSignal {
    Usr1,
    Usr2,
}

impl DumpSignal {
    pub fn signal(self) -> c_int {
        match self {
            DumpSignal::Usr1 => libc::SIGUSR1,
            DumpSignal::Usr2 => libc::SIGUSR2,
        }
    }
}

impl FromStr for DumpSignal {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.to_ascii_uppercase();
        match upper.strip_prefix("SIG").unwrap_or(&upper) {
            "USR1" => Ok(Self::Usr1),
            "USR2" => Ok(Self::Usr2),
            _ => Err(Error::Configuration(format!(
                "invalid dump signal '{}'. Valid values are 'usr1' and 'usr2'.",
                s
            ))),
        }
    }
}
