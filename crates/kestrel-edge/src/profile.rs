//! Per-kernel timing and energy estimates.
//!
//! When instrumentation is on, the session times every kernel call and
//! accumulates it into its [`KernelCategory`]. After each iteration the
//! driver takes the accumulated profile (which resets the counters) and hands
//! it to a [`ProfileSink`]. Energy is estimated from fixed nominal supply
//! figures, not measured.

use std::fmt;
use std::time::Duration;

use crate::ops::KernelCategory;

/// Nominal supply voltage in volts.
pub const NOMINAL_VOLTAGE: f32 = 3.3;

/// Nominal current draw in amps.
pub const NOMINAL_CURRENT: f32 = 0.24;

/// Estimated energy in millijoules for `elapsed` at nominal power.
pub fn energy_mj(elapsed: Duration) -> f32 {
    let power_w = NOMINAL_VOLTAGE * NOMINAL_CURRENT;
    power_w * elapsed.as_secs_f32() * 1000.0
}

/// Accumulates kernel time per category for the current iteration.
#[derive(Debug, Clone, Default)]
pub struct KernelProfiler {
    enabled: bool,
    total: Duration,
    per_category: [Duration; 6],
}

impl KernelProfiler {
    pub fn new(enabled: bool) -> Self {
        Self { enabled, ..Default::default() }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Add one kernel call's elapsed time.
    pub fn record(&mut self, category: KernelCategory, elapsed: Duration) {
        if self.enabled {
            self.per_category[category.index()] += elapsed;
        }
    }

    /// Add wall time of a whole forward pass.
    pub fn record_total(&mut self, elapsed: Duration) {
        if self.enabled {
            self.total += elapsed;
        }
    }

    /// Current counters, without resetting.
    pub fn snapshot(&self) -> IterationProfile {
        IterationProfile { total: self.total, per_category: self.per_category }
    }

    /// Take the counters and reset them to zero.
    pub fn take(&mut self) -> IterationProfile {
        let profile = self.snapshot();
        self.total = Duration::ZERO;
        self.per_category = [Duration::ZERO; 6];
        profile
    }
}

/// Timing of one iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IterationProfile {
    pub total: Duration,
    pub per_category: [Duration; 6],
}

impl IterationProfile {
    pub fn category(&self, category: KernelCategory) -> Duration {
        self.per_category[category.index()]
    }

    pub fn is_zero(&self) -> bool {
        self.total.is_zero() && self.per_category.iter().all(Duration::is_zero)
    }

    /// The `Total` line.
    pub fn total_line(&self) -> ProfileLine {
        ProfileLine { label: "Total", elapsed: self.total }
    }

    /// One line per tracked category, in report order.
    pub fn category_lines(&self) -> impl Iterator<Item = ProfileLine> + '_ {
        KernelCategory::ALL
            .iter()
            .map(move |c| ProfileLine { label: c.label(), elapsed: self.category(*c) })
    }

    /// `Total` followed by every category line.
    pub fn lines(&self) -> impl Iterator<Item = ProfileLine> + '_ {
        std::iter::once(self.total_line()).chain(self.category_lines())
    }
}

/// One row of a profile report.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProfileLine {
    pub label: &'static str,
    pub elapsed: Duration,
}

impl ProfileLine {
    pub fn energy_mj(&self) -> f32 {
        energy_mj(self.elapsed)
    }
}

impl fmt::Display for ProfileLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} time = {} ms, energy = {:.6} mJ",
            self.label,
            self.elapsed.as_millis(),
            self.energy_mj()
        )
    }
}

/// Destination for per-iteration profiles.
pub trait ProfileSink {
    fn report(&mut self, profile: &IterationProfile);
}

/// Writes every profile line through `tracing` at info level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl ProfileSink for LogSink {
    fn report(&mut self, profile: &IterationProfile) {
        for line in profile.lines() {
            tracing::info!(target: "kestrel::profile", "{}", line);
        }
    }
}
