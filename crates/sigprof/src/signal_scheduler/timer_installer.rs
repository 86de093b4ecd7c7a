use std::mem;
use std::ptr::null_mut;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::session::configuration::TimerTarget;

/// Arms and disarms the process interval timers behind each `TimerTarget`.
pub struct TimerInstaller {}

impl TimerInstaller {
    /// Fire first after `interval`, then every `interval`.
    pub fn arm(target: TimerTarget, interval: Duration) -> Result<()> {
        let value = Self::duration_to_itimerval(&interval);
        Self::set(target, &value)?;
        log::debug!("{} timer armed every {:?}", target, interval);
        Ok(())
    }

    pub fn disarm(target: TimerTarget) -> Result<()> {
        let value: libc::itimerval = unsafe { mem::zeroed() };
        Self::set(target, &value)?;
        log::debug!("{} timer disarmed", target);
        Ok(())
    }

    fn set(target: TimerTarget, value: &libc::itimerval) -> Result<()> {
        let err = unsafe {
            match target {
                TimerTarget::Cpu => libc::setitimer(libc::ITIMER_PROF, value, null_mut()),
                TimerTarget::User => libc::setitimer(libc::ITIMER_VIRTUAL, value, null_mut()),
                TimerTarget::Real => libc::setitimer(libc::ITIMER_REAL, value, null_mut()),
            }
        };
        if err != 0 {
            return Err(Error::last_os_error("setitimer"));
        }
        Ok(())
    }

    fn duration_to_itimerval(duration: &Duration) -> libc::itimerval {
        let mut its: libc::itimerval = unsafe { mem::zeroed() };
        its.it_interval.tv_sec = duration.as_secs() as _;
        its.it_interval.tv_usec = duration.subsec_micros() as _;
        // An all-zero value would disarm the timer.
        if its.it_interval.tv_sec == 0 && its.it_interval.tv_usec == 0 {
            its.it_interval.tv_usec = 1;
        }
        its.it_value = its.it_interval;
        its
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_to_itimerval() {
        let its = TimerInstaller::duration_to_itimerval(&Duration::from_millis(2500));
        assert_eq!(its.it_interval.tv_sec, 2);
        assert_eq!(its.it_interval.tv_usec, 500_000);
        assert_eq!(its.it_value.tv_sec, 2);
        assert_eq!(its.it_value.tv_usec, 500_000);
    }

    #[test]
    fn test_sub_microsecond_interval_still_fires() {
        let its = TimerInstaller::duration_to_itimerval(&Duration::from_nanos(10));
        assert_eq!(its.it_interval.tv_sec, 0);
        assert_eq!(its.it_interval.tv_usec, 1);
    }
}
