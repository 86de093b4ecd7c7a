#![deny(unsafe_op_in_unsafe_fn)]

pub mod timer_installer;

use std::ffi::{c_int, c_void};
use std::ptr::null_mut;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use self::timer_installer::TimerInstaller;
use crate::error::{Error, Result};
use crate::profile::Profile;
use crate::sample::Sample;
use crate::session::configuration::{validate_interval, TimerTarget};
use crate::util::{self, ErrnoGuard, SignalMask};

/// The installed `Profile`, for the signal handler. Holds one strong count
/// (from `Arc::into_raw`) while non-null.
static SIGNAL_PAYLOAD: AtomicPtr<Profile> = AtomicPtr::new(null_mut());

/// Handler invocations that may be dereferencing `SIGNAL_PAYLOAD`.
static IN_FLIGHT: AtomicUsize = AtomicUsize::new(0);

/// The thread being profiled (see `util::current_thread_id`). 0 if none.
static TARGET_THREAD: AtomicUsize = AtomicUsize::new(0);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct ArmedTimer {
    target: TimerTarget,
    interval: Duration,
}

/// Timer controller: owns the handler registration and the interval timer
/// for one `Profile`.
///
/// Signal dispositions and interval timers are process-wide, so at most one
/// scheduler can be installed at a time.
#[derive(Debug)]
pub struct SignalScheduler {
    profile: Arc<Profile>,
    restart_syscalls: bool,
    armed: Mutex<Option<ArmedTimer>>,
}

impl SignalScheduler {
    pub fn new(profile: Arc<Profile>) -> Self {
        Self {
            profile,
            restart_syscalls: false,
            armed: Mutex::new(None),
        }
    }

    /// Let slow system calls interrupted by a tick restart instead of failing
    /// with `EINTR`.
    pub fn restart_syscalls(mut self, restart: bool) -> Self {
        self.restart_syscalls = restart;
        self
    }

    pub fn profile(&self) -> &Arc<Profile> {
        &self.profile
    }

    /// The currently armed timer and its interval.
    pub fn armed(&self) -> Option<(TimerTarget, Duration)> {
        self.lock_armed().map(|armed| (armed.target, armed.interval))
    }

    /// Start sampling the calling thread every `interval` of `target` time.
    ///
    /// Clears the counters. Re-installing re-arms with the new settings.
    /// Fails without touching the current state if `interval` is unusable or
    /// another profile is installed.
    pub fn install(&self, target: TimerTarget, interval: Duration) -> Result<()> {
        validate_interval(interval)?;

        let mut armed = self.lock_armed();
        let own = Arc::as_ptr(&self.profile) as *mut Profile;
        let current = SIGNAL_PAYLOAD.load(Ordering::SeqCst);
        if !current.is_null() && current != own {
            return Err(Error::AlreadyInstalled("a profiler"));
        }

        let _mask = SignalMask::block(&TimerTarget::all_signals());

        if let Some(previous) = armed.take() {
            Self::teardown(previous.target);
        }

        self.profile.reset();
        TARGET_THREAD.store(util::current_thread_id(), Ordering::SeqCst);
        if current.is_null() {
            let payload = Arc::into_raw(Arc::clone(&self.profile)) as *mut Profile;
            SIGNAL_PAYLOAD.store(payload, Ordering::SeqCst);
        }

        let armed_result = util::install_signal_handler(
            target.signal(),
            signal_handler,
            &TimerTarget::all_signals(),
            self.restart_syscalls,
        )
        .and_then(|()| TimerInstaller::arm(target, interval));
        if let Err(err) = armed_result {
            Self::teardown(target);
            Self::release_payload(own);
            return Err(err);
        }

        *armed = Some(ArmedTimer { target, interval });
        log::debug!("Profiler installed ({} timer, {:?} interval)", target, interval);
        Ok(())
    }

    /// Stop sampling and restore default dispositions. Counters are kept.
    /// Safe to call when nothing is installed.
    pub fn uninstall(&self) {
        let mut armed = self.lock_armed();
        let own = Arc::as_ptr(&self.profile) as *mut Profile;
        if armed.is_none() && SIGNAL_PAYLOAD.load(Ordering::SeqCst) != own {
            return;
        }

        let _mask = SignalMask::block(&TimerTarget::all_signals());
        for target in TimerTarget::ALL {
            if util::is_handler_installed(target.signal(), signal_handler) {
                Self::teardown(target);
            }
        }
        Self::release_payload(own);
        *armed = None;
        log::debug!(
            "Profiler uninstalled ({} samples, {} dropped)",
            self.profile.total(),
            self.profile.dropped_samples()
        );
    }

    /// Clear the counters. Does not change whether a timer is armed.
    pub fn reset(&self) {
        let _mask = SignalMask::block(&TimerTarget::all_signals());
        self.profile.reset();
    }

    fn lock_armed(&self) -> std::sync::MutexGuard<'_, Option<ArmedTimer>> {
        self.armed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn teardown(target: TimerTarget) {
        if let Err(err) = TimerInstaller::disarm(target) {
            log::debug!("Failed to disarm {} timer: {}", target, err);
        }
        util::restore_default_handler(target.signal());
    }

    /// Retract the handler's reference to `own` and wait for handler
    /// invocations still using it.
    fn release_payload(own: *mut Profile) {
        if SIGNAL_PAYLOAD
            .compare_exchange(own, null_mut(), Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        while IN_FLIGHT.load(Ordering::SeqCst) != 0 {
            thread::yield_now();
        }
        TARGET_THREAD.store(0, Ordering::SeqCst);
        drop(unsafe { Arc::from_raw(own as *const Profile) });
    }
}

impl Drop for SignalScheduler {
    fn drop(&mut self) {
        self.uninstall();
    }
}

/// Respond to a timer tick and collect a sample.
///
/// Ticks delivered to another thread are forwarded to the profiled thread; a
/// tick that cannot be forwarded counts as dropped. Uses no locks that can
/// block and never allocates.
extern "C" fn signal_handler(sig: c_int, _info: *mut libc::siginfo_t, ucontext: *mut c_void) {
    let _errno = ErrnoGuard::save();

    let target_thread = TARGET_THREAD.load(Ordering::SeqCst);
    if target_thread != 0 && target_thread != util::current_thread_id() {
        if !util::signal_thread(target_thread, sig) {
            with_payload(Profile::record_dropped);
        }
        return;
    }

    with_payload(|profile| {
        let handler_address = signal_handler as *const () as usize;
        let sample = Sample::capture(ucontext, handler_address);
        profile.record_from_signal(sample.as_ref());
    });
}

/// Run `f` on the installed profile, if any, while `uninstall` is held off.
fn with_payload<F: FnOnce(&Profile)>(f: F) {
    IN_FLIGHT.fetch_add(1, Ordering::SeqCst);
    let payload = SIGNAL_PAYLOAD.load(Ordering::SeqCst);
    if !payload.is_null() {
        f(unsafe { &*payload });
    }
    IN_FLIGHT.fetch_sub(1, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use serial_test::serial;

    use super::*;

    fn busy_until(deadline: Instant) -> u64 {
        let mut acc = 0u64;
        while Instant::now() < deadline {
            for i in 0..10_000u64 {
                acc = std::hint::black_box(acc.wrapping_mul(31).wrapping_add(i));
            }
        }
        acc
    }

    #[test]
    #[serial]
    fn test_install_rejects_zero_interval() {
        let scheduler = SignalScheduler::new(Arc::new(Profile::default()));
        let err = scheduler.install(TimerTarget::Real, Duration::ZERO).unwrap_err();
        assert!(err.is_configuration());
        assert_eq!(scheduler.armed(), None);
        assert!(!util::is_handler_installed(libc::SIGALRM, signal_handler));
    }

    #[test]
    #[serial]
    fn test_invalid_install_keeps_armed_timer() {
        let scheduler = SignalScheduler::new(Arc::new(Profile::default()));
        scheduler
            .install(TimerTarget::Real, Duration::from_millis(5))
            .unwrap();

        assert!("bogus".parse::<TimerTarget>().is_err());
        assert!(scheduler
            .install(TimerTarget::Cpu, Duration::ZERO)
            .unwrap_err()
            .is_configuration());

        assert_eq!(
            scheduler.armed(),
            Some((TimerTarget::Real, Duration::from_millis(5)))
        );
        assert!(util::is_handler_installed(libc::SIGALRM, signal_handler));
        scheduler.uninstall();
    }

    #[test]
    #[serial]
    fn test_uninstall_without_install() {
        let profile = Arc::new(Profile::new(16));
        profile.record(&Sample::from_call_sites([crate::sample::CallSite::new(1, 1)]));

        let scheduler = SignalScheduler::new(Arc::clone(&profile));
        scheduler.uninstall();
        scheduler.uninstall();

        assert_eq!(profile.total(), 1);
        assert_eq!(scheduler.armed(), None);
    }

    #[test]
    #[serial]
    fn test_real_timer_collects_samples() {
        let profile = Arc::new(Profile::default());
        let scheduler = SignalScheduler::new(Arc::clone(&profile));
        scheduler
            .install(TimerTarget::Real, Duration::from_millis(2))
            .unwrap();
        assert!(util::is_handler_installed(libc::SIGALRM, signal_handler));

        busy_until(Instant::now() + Duration::from_millis(200));
        scheduler.uninstall();

        assert!(!util::is_handler_installed(libc::SIGALRM, signal_handler));
        let snapshot = profile.snapshot();
        assert!(snapshot.total() > 0, "no samples collected");
        for (call_site, self_count) in &snapshot.self_counts {
            let cumulative = snapshot
                .cumulative_counts
                .iter()
                .find(|(k, _)| k == call_site)
                .map(|(_, v)| *v)
                .unwrap_or(0);
            assert!(cumulative >= *self_count);
        }

        // Counters stay frozen once uninstalled.
        let total = profile.total();
        busy_until(Instant::now() + Duration::from_millis(20));
        assert_eq!(profile.total(), total);
    }

    #[test]
    #[serial]
    fn test_cpu_timer_collects_samples() {
        let profile = Arc::new(Profile::default());
        let scheduler = SignalScheduler::new(Arc::clone(&profile)).restart_syscalls(true);
        scheduler
            .install(TimerTarget::Cpu, Duration::from_millis(2))
            .unwrap();
        busy_until(Instant::now() + Duration::from_millis(200));
        scheduler.uninstall();
        assert!(profile.total() > 0);
    }

    #[test]
    #[serial]
    fn test_reinstall_switches_timer() {
        let scheduler = SignalScheduler::new(Arc::new(Profile::default()));
        scheduler
            .install(TimerTarget::Real, Duration::from_millis(5))
            .unwrap();
        scheduler
            .install(TimerTarget::User, Duration::from_millis(5))
            .unwrap();

        assert!(!util::is_handler_installed(libc::SIGALRM, signal_handler));
        assert!(util::is_handler_installed(libc::SIGVTALRM, signal_handler));
        assert_eq!(scheduler.armed().map(|(t, _)| t), Some(TimerTarget::User));

        scheduler.uninstall();
        assert!(!util::is_handler_installed(libc::SIGVTALRM, signal_handler));
    }

    #[test]
    #[serial]
    fn test_second_profile_cannot_install() {
        let first = SignalScheduler::new(Arc::new(Profile::default()));
        let second = SignalScheduler::new(Arc::new(Profile::default()));
        first
            .install(TimerTarget::Real, Duration::from_millis(5))
            .unwrap();

        assert!(matches!(
            second.install(TimerTarget::Real, Duration::from_millis(5)),
            Err(Error::AlreadyInstalled(_))
        ));

        // Uninstalling the idle scheduler leaves the active one alone.
        second.uninstall();
        assert!(util::is_handler_installed(libc::SIGALRM, signal_handler));
        first.uninstall();
    }

    #[test]
    #[serial]
    fn test_ticks_for_exited_thread_count_as_dropped() {
        let profile = Arc::new(Profile::default());
        let scheduler = SignalScheduler::new(Arc::clone(&profile));
        let scheduler = thread::spawn(move || {
            scheduler
                .install(TimerTarget::Real, Duration::from_millis(2))
                .unwrap();
            scheduler
        })
        .join()
        .unwrap();

        busy_until(Instant::now() + Duration::from_millis(100));
        scheduler.uninstall();

        assert_eq!(profile.total(), 0);
        assert!(profile.dropped_samples() > 0);
    }

    #[test]
    #[serial]
    fn test_install_clears_counters() {
        let profile = Arc::new(Profile::new(16));
        profile.record(&Sample::from_call_sites([crate::sample::CallSite::new(1, 1)]));
        let scheduler = SignalScheduler::new(Arc::clone(&profile));
        scheduler
            .install(TimerTarget::User, Duration::from_secs(60))
            .unwrap();
        assert_eq!(profile.total(), 0);
        scheduler.uninstall();
    }
}
