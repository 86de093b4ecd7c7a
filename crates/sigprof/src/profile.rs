use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use crate::sample::{CallSite, CodeUnit, Sample, MAX_STACK_DEPTH};

pub const DEFAULT_MAX_CALL_SITES: usize = 65536;

/// The two counting maps. Pre-sized at construction; `record` never grows
/// them, so it is usable from a signal handler.
#[derive(Debug)]
pub struct SampleCounters {
    self_counts: HashMap<CallSite, u64>,
    cumulative_counts: HashMap<CallSite, u64>,
}

impl SampleCounters {
    pub fn with_capacity(max_call_sites: usize) -> Self {
        Self {
            self_counts: HashMap::with_capacity(max_call_sites),
            cumulative_counts: HashMap::with_capacity(max_call_sites),
        }
    }

    /// Attribute one sample. The innermost call site gets a self and a
    /// cumulative count. Walking outward, each other code unit gets one
    /// cumulative count at its innermost appearance, so a recursive function
    /// counts once per sample regardless of depth.
    ///
    /// Returns `false`, leaving the counters untouched, when the sample is
    /// empty or its new call sites would not fit in the reserved capacity.
    pub fn record(&mut self, sample: &Sample) -> bool {
        let Some((innermost, callers)) = sample.call_sites().split_first() else {
            return false;
        };
        if !self.has_room_for(innermost, callers) {
            return false;
        }

        *self.self_counts.entry(*innermost).or_insert(0) += 1;
        *self.cumulative_counts.entry(*innermost).or_insert(0) += 1;

        let mut seen = SeenCodeUnits::new();
        seen.insert(innermost.code_unit);
        for caller in callers {
            if seen.insert(caller.code_unit) {
                *self.cumulative_counts.entry(*caller).or_insert(0) += 1;
            }
        }
        true
    }

    fn has_room_for(&self, innermost: &CallSite, callers: &[CallSite]) -> bool {
        let new_self = usize::from(!self.self_counts.contains_key(innermost));
        if self.self_counts.len() + new_self > self.self_counts.capacity() {
            return false;
        }

        let mut new_cumulative = usize::from(!self.cumulative_counts.contains_key(innermost));
        let mut seen = SeenCodeUnits::new();
        seen.insert(innermost.code_unit);
        for caller in callers {
            if seen.insert(caller.code_unit) && !self.cumulative_counts.contains_key(caller) {
                new_cumulative += 1;
            }
        }
        self.cumulative_counts.len() + new_cumulative <= self.cumulative_counts.capacity()
    }

    /// Empties both maps, keeping their reserved capacity.
    pub fn clear(&mut self) {
        self.self_counts.clear();
        self.cumulative_counts.clear();
    }

    pub fn self_counts(&self) -> &HashMap<CallSite, u64> {
        &self.self_counts
    }

    pub fn cumulative_counts(&self) -> &HashMap<CallSite, u64> {
        &self.cumulative_counts
    }

    /// Number of recorded samples; every sample contributes one self count.
    pub fn total(&self) -> u64 {
        self.self_counts.values().sum()
    }
}

/// Code units already attributed within one sample.
struct SeenCodeUnits {
    len: usize,
    units: [CodeUnit; MAX_STACK_DEPTH],
}

impl SeenCodeUnits {
    fn new() -> Self {
        Self {
            len: 0,
            units: [CodeUnit::default(); MAX_STACK_DEPTH],
        }
    }

    /// Returns `true` if `unit` was not present.
    fn insert(&mut self, unit: CodeUnit) -> bool {
        if self.units[..self.len].contains(&unit) {
            return false;
        }
        // A sample holds at most MAX_STACK_DEPTH call sites.
        if self.len < MAX_STACK_DEPTH {
            self.units[self.len] = unit;
            self.len += 1;
        }
        true
    }
}

/// Point-in-time copy of the counters, taken for reporting.
#[derive(Clone, Debug, Default)]
pub struct Snapshot {
    pub self_counts: Vec<(CallSite, u64)>,
    pub cumulative_counts: Vec<(CallSite, u64)>,
    pub dropped_samples: u64,
}

impl Snapshot {
    pub fn total(&self) -> u64 {
        self.self_counts.iter().map(|(_, count)| count).sum()
    }
}

/// The aggregate store shared between the signal handler and the control
/// paths (scheduler, reporter).
#[derive(Debug)]
pub struct Profile {
    counters: RwLock<SampleCounters>,
    dropped_samples: AtomicU64,
}

impl Default for Profile {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CALL_SITES)
    }
}

impl Profile {
    pub fn new(max_call_sites: usize) -> Self {
        Self {
            counters: RwLock::new(SampleCounters::with_capacity(max_call_sites)),
            dropped_samples: AtomicU64::new(0),
        }
    }

    /// Record a sample from signal context. Never blocks: if the counters are
    /// locked (a reset or snapshot is running, possibly on the interrupted
    /// thread itself) the sample is dropped.
    pub fn record_from_signal(&self, sample: Option<&Sample>) {
        let recorded = match (sample, self.counters.try_write()) {
            (Some(sample), Ok(mut counters)) => counters.record(sample),
            _ => false,
        };
        if !recorded {
            self.record_dropped();
        }
    }

    /// Count a tick that produced no sample. Async-signal-safe.
    pub(crate) fn record_dropped(&self) {
        self.dropped_samples.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a sample from ordinary code, waiting for the lock.
    pub fn record(&self, sample: &Sample) -> bool {
        let recorded = self
            .counters
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .record(sample);
        if !recorded {
            self.record_dropped();
        }
        recorded
    }

    pub fn reset(&self) {
        self.counters
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.dropped_samples.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Snapshot {
        let counters = self.counters.read().unwrap_or_else(PoisonError::into_inner);
        Snapshot {
            self_counts: counters.self_counts().iter().map(|(k, v)| (*k, *v)).collect(),
            cumulative_counts: counters
                .cumulative_counts()
                .iter()
                .map(|(k, v)| (*k, *v))
                .collect(),
            dropped_samples: self.dropped_samples(),
        }
    }

    pub fn total(&self) -> u64 {
        self.counters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .total()
    }

    /// Ticks discarded since the last reset.
    pub fn dropped_samples(&self) -> u64 {
        self.dropped_samples.load(Ordering::Relaxed)
    }
}
