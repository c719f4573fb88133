//! Stopping rules for annealing runs.
//!
//! [`Completion`] is the serializable set of criteria a configuration
//! carries. Anything implementing [`CompletionCriteria`] can stop a run,
//! which is how external cancellation and progress tracking plug in.

use crate::types::{Energy, InversionError, InversionState, IterationCounts};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub trait CompletionCriteria: fmt::Debug + Send + Sync {
    fn is_satisfied(&self, state: &InversionState<'_>) -> bool;
}

impl<C: CompletionCriteria + ?Sized> CompletionCriteria for Box<C> {
    fn is_satisfied(&self, state: &InversionState<'_>) -> bool {
        (**self).is_satisfied(state)
    }
}

impl<C: CompletionCriteria + ?Sized> CompletionCriteria for Arc<C> {
    fn is_satisfied(&self, state: &InversionState<'_>) -> bool {
        (**self).is_satisfied(state)
    }
}

// ─────────────────────────────────────────────────────────────
//  Configured criteria
// ─────────────────────────────────────────────────────────────

/// Textual form: `<number><unit>`, units `h`, `m`, `s`, `ms` (wall clock),
/// `i` or none (iterations), `ip` (iterations per variable), `e` (energy).
/// A comma-separated list stops at the first satisfied member.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Completion {
    Iterations(u64),
    Time(Duration),
    /// Best total energy at or below the threshold.
    Energy(f64),
    IterationsPerVariable(f64),
    Any(Vec<Completion>),
}

impl Completion {
    pub fn iterations(n: u64) -> Self {
        Self::Iterations(n)
    }

    pub fn time(d: Duration) -> Self {
        Self::Time(d)
    }

    /// True if the criterion holds before a single iteration has run,
    /// whatever the state. Energy thresholds depend on the state and never
    /// count.
    pub fn is_immediate(&self) -> bool {
        match self {
            Self::Iterations(n) => *n == 0,
            Self::Time(d) => d.is_zero(),
            Self::IterationsPerVariable(per) => *per <= 0.0,
            Self::Energy(_) => false,
            Self::Any(members) => members.iter().any(Completion::is_immediate),
        }
    }

    /// True if any member counts iterations, so the run is bounded without
    /// relying on the clock.
    pub fn is_iteration_based(&self) -> bool {
        match self {
            Self::Iterations(_) | Self::IterationsPerVariable(_) => true,
            Self::Any(members) => members.iter().any(Completion::is_iteration_based),
            _ => false,
        }
    }
}

impl CompletionCriteria for Completion {
    fn is_satisfied(&self, state: &InversionState<'_>) -> bool {
        match self {
            Self::Iterations(n) => state.counts.iterations >= *n,
            Self::Time(d) => state.elapsed >= *d,
            Self::Energy(e) => state.energy.total <= *e,
            Self::IterationsPerVariable(per) => {
                let target = (per * state.num_variables as f64).ceil() as u64;
                state.counts.iterations >= target
            }
            Self::Any(members) => members.iter().any(|c| c.is_satisfied(state)),
        }
    }
}

impl FromStr for Completion {
    type Err = InversionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.contains(',') {
            let members = s
                .split(',')
                .map(str::parse)
                .collect::<Result<Vec<Completion>, _>>()?;
            return Ok(Self::Any(members));
        }
        let bad = || InversionError::Configuration(format!("invalid completion criteria '{s}'"));
        let split = s
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(s.len());
        let (num, unit) = s.split_at(split);
        if num.is_empty() {
            return Err(bad());
        }
        let value: f64 = num.parse().map_err(|_| bad())?;
        if !value.is_finite() || value < 0.0 {
            return Err(bad());
        }
        let out = match unit {
            "" | "i" => {
                let n: u64 = num.parse().map_err(|_| bad())?;
                Self::Iterations(n)
            }
            "ip" => Self::IterationsPerVariable(value),
            "e" => Self::Energy(value),
            "h" | "m" | "s" | "ms" => {
                let (millis_per_unit, secs_per_unit) = match unit {
                    "h" => (3_600_000, 3600.0),
                    "m" => (60_000, 60.0),
                    "s" => (1000, 1.0),
                    _ => (1, 0.001),
                };
                let duration = match num.parse::<u64>() {
                    Ok(n) => n.checked_mul(millis_per_unit).map(Duration::from_millis),
                    Err(_) => Duration::try_from_secs_f64(value * secs_per_unit).ok(),
                };
                Self::Time(duration.ok_or_else(bad)?)
            }
            _ => return Err(bad()),
        };
        Ok(out)
    }
}

impl TryFrom<String> for Completion {
    type Error = InversionError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Completion> for String {
    fn from(c: Completion) -> Self {
        c.to_string()
    }
}

impl fmt::Display for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Iterations(n) => write!(f, "{n}i"),
            Self::Time(d) => {
                let secs = d.as_secs();
                if d.subsec_nanos() % 1_000_000 != 0 {
                    write!(f, "{}s", d.as_secs_f64())
                } else if d.subsec_nanos() != 0 || secs == 0 {
                    write!(f, "{}ms", d.as_millis())
                } else if secs % 3600 == 0 {
                    write!(f, "{}h", secs / 3600)
                } else if secs % 60 == 0 {
                    write!(f, "{}m", secs / 60)
                } else {
                    write!(f, "{secs}s")
                }
            }
            Self::Energy(e) => write!(f, "{e}e"),
            Self::IterationsPerVariable(per) => write!(f, "{per}ip"),
            Self::Any(members) => {
                for (i, m) in members.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{m}")?;
                }
                Ok(())
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────
//  Runtime criteria
// ─────────────────────────────────────────────────────────────

/// Satisfied as soon as any member is.
#[derive(Debug)]
pub struct CompoundCriteria(pub Vec<Box<dyn CompletionCriteria>>);

impl CompletionCriteria for CompoundCriteria {
    fn is_satisfied(&self, state: &InversionState<'_>) -> bool {
        self.0.iter().any(|c| c.is_satisfied(state))
    }
}

/// Satisfied once the shared flag is raised from another thread.
#[derive(Debug, Clone, Default)]
pub struct CancellationCriteria {
    flag: Arc<AtomicBool>,
}

impl CancellationCriteria {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_flag(flag: Arc<AtomicBool>) -> Self {
        Self { flag }
    }

    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.flag)
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }
}

impl CompletionCriteria for CancellationCriteria {
    fn is_satisfied(&self, _state: &InversionState<'_>) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Measures an inner criterion relative to the start of a sub-run, so
/// `1000i` means a thousand more iterations regardless of where the
/// iteration counter stands.
#[derive(Debug)]
pub(crate) struct RoundCriteria<'a> {
    pub inner: &'a dyn CompletionCriteria,
    pub start: IterationCounts,
}

impl CompletionCriteria for RoundCriteria<'_> {
    fn is_satisfied(&self, state: &InversionState<'_>) -> bool {
        let local = InversionState {
            counts: state.counts.since(self.start),
            ..*state
        };
        self.inner.is_satisfied(&local)
    }
}

// ─────────────────────────────────────────────────────────────
//  Progress tracking
// ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEntry {
    pub elapsed: Duration,
    pub counts: IterationCounts,
    pub num_non_zero: usize,
    pub energy: Energy,
}

/// Trace of an annealing run, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnnealingProgress {
    pub entries: Vec<ProgressEntry>,
}

impl AnnealingProgress {
    pub fn last(&self) -> Option<&ProgressEntry> {
        self.entries.last()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Wraps a criterion and records a progress entry at most every
/// `min_interval`, plus the state that satisfied the criterion.
///
/// The last recorded iteration and time are mirrored in atomics so the
/// common case of nothing to record never takes the lock.
#[derive(Debug)]
pub struct ProgressTracker {
    inner: Box<dyn CompletionCriteria>,
    min_interval: Duration,
    progress: Mutex<AnnealingProgress>,
    /// `u64::MAX` until the first entry is recorded.
    last_iterations: AtomicU64,
    last_elapsed_nanos: AtomicU64,
}

impl ProgressTracker {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(100);

    pub fn new(inner: Box<dyn CompletionCriteria>) -> Self {
        Self::with_interval(inner, Self::DEFAULT_INTERVAL)
    }

    pub fn with_interval(inner: Box<dyn CompletionCriteria>, min_interval: Duration) -> Self {
        Self {
            inner,
            min_interval,
            progress: Mutex::new(AnnealingProgress::default()),
            last_iterations: AtomicU64::new(u64::MAX),
            last_elapsed_nanos: AtomicU64::new(0),
        }
    }

    pub fn progress(&self) -> AnnealingProgress {
        self.progress.lock().clone()
    }
}

impl CompletionCriteria for ProgressTracker {
    fn is_satisfied(&self, state: &InversionState<'_>) -> bool {
        let satisfied = self.inner.is_satisfied(state);
        let last_iterations = self.last_iterations.load(Ordering::Acquire);
        if last_iterations != u64::MAX {
            if last_iterations == state.counts.iterations {
                return satisfied;
            }
            let last_elapsed = Duration::from_nanos(self.last_elapsed_nanos.load(Ordering::Acquire));
            if !satisfied && state.elapsed.saturating_sub(last_elapsed) < self.min_interval {
                return satisfied;
            }
        }
        let mut progress = self.progress.lock();
        let record = match progress.entries.last() {
            None => true,
            Some(last) => {
                last.counts.iterations != state.counts.iterations
                    && (satisfied || state.elapsed.saturating_sub(last.elapsed) >= self.min_interval)
            }
        };
        if record {
            let nanos = u64::try_from(state.elapsed.as_nanos()).unwrap_or(u64::MAX);
            self.last_elapsed_nanos.store(nanos, Ordering::Release);
            self.last_iterations.store(state.counts.iterations, Ordering::Release);
            progress.entries.push(ProgressEntry {
                elapsed: state.elapsed,
                counts: state.counts,
                num_non_zero: state.num_non_zero,
                energy: state.energy.clone(),
            });
        }
        satisfied
    }
}
