//! # Memory Leak Detector
//!
//! A long-running relay that slowly grows is the failure mode this module is
//! meant to surface. It keeps an owned baseline of the process's resident
//! memory and compares every periodic reading against it.
//!
//! ## Heuristics:
//!
//! - **Absolute growth**: more than [`LEAK_THRESHOLD_BYTES`] above the
//!   baseline is reported as a suspected leak on every check that sees it.
//! - **Sustained growth**: [`GROWTH_PATTERN_CHECKS`] consecutive checks, each
//!   higher than the one before, are reported once; the counter then starts
//!   over so a slow climb is reported again only after another full run.
//!
//! The detector never acts on a suspicion. It logs, returns `true`, and leaves
//! the decision to the operator. [`LeakDetector::reset_baseline`] re-anchors the
//! measurement, e.g. after an expected one-off allocation.

use crate::utils::misc::sys_info::{format_bytes, format_delta, MemoryProbe};

/// Growth over the baseline that counts as a suspected leak (5 MiB).
pub const LEAK_THRESHOLD_BYTES: u64 = 5 * 1024 * 1024;
/// Consecutive growing checks that count as a suspected leak.
pub const GROWTH_PATTERN_CHECKS: u32 = 5;

/// # Leak Baseline
///
/// The detector's bookkeeping. Mutated only by
/// [`LeakDetector::check_and_log`] and [`LeakDetector::reset_baseline`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LeakBaseline {
    /// Resident bytes the growth is measured against.
    pub baseline_bytes: u64,
    /// Resident bytes seen by the most recent successful check.
    pub last_check_bytes: u64,
    /// Checks performed, failed readings included.
    pub check_count: u64,
    /// Back-to-back checks that each read higher than the previous one.
    pub consecutive_growth_count: u32,
}

/// # Leak Detector
///
/// Owns a [`MemoryProbe`] and the [`LeakBaseline`] it feeds.
pub struct LeakDetector {
    probe: Box<dyn MemoryProbe>,
    state: LeakBaseline,
    /// `false` until a reading succeeded; the first one then becomes the baseline.
    anchored: bool,
}

impl LeakDetector {
    /// Creates a detector and captures the baseline from `probe`.
    pub fn new(mut probe: Box<dyn MemoryProbe>) -> Self {
        let mut state = LeakBaseline::default();
        let anchored = match probe.resident_bytes() {
            Some(bytes) => {
                state.baseline_bytes = bytes;
                state.last_check_bytes = bytes;
                log::info!("Memory baseline established: {}", format_bytes(bytes));
                true
            }
            None => {
                log::warn!("Memory baseline unavailable, the first successful check will set it");
                false
            }
        };
        Self {
            probe,
            state,
            anchored,
        }
    }

    /// A snapshot of the current bookkeeping.
    pub fn baseline(&self) -> LeakBaseline {
        self.state
    }

    /// Current growth over the baseline in bytes, or `None` when memory cannot
    /// be read or no baseline exists yet.
    pub fn current_growth(&mut self) -> Option<i64> {
        if !self.anchored {
            return None;
        }
        let current = self.probe.resident_bytes()?;
        Some(current as i64 - self.state.baseline_bytes as i64)
    }

    /// # Check and Log
    ///
    /// Takes a reading, logs current usage and the deltas against the baseline
    /// and the previous check, and returns `true` when either heuristic fires.
    /// `context` names the caller in the log lines (e.g. `"cycle 20"`).
    pub fn check_and_log(&mut self, context: &str) -> bool {
        self.state.check_count += 1;

        let current = match self.probe.resident_bytes() {
            Some(bytes) => bytes,
            None => {
                log::warn!("[{}] Memory check #{} failed: usage unavailable", context, self.state.check_count);
                return false;
            }
        };

        if !self.anchored {
            self.anchored = true;
            self.state.baseline_bytes = current;
            self.state.last_check_bytes = current;
            log::info!(
                "[{}] Memory check #{}: {} (baseline established)",
                context,
                self.state.check_count,
                format_bytes(current)
            );
            return false;
        }

        let since_baseline = current as i64 - self.state.baseline_bytes as i64;
        let since_last = current as i64 - self.state.last_check_bytes as i64;
        if since_last > 0 {
            self.state.consecutive_growth_count += 1;
        } else {
            self.state.consecutive_growth_count = 0;
        }
        self.state.last_check_bytes = current;

        log::info!(
            "[{}] Memory check #{}: {} (since baseline {}, since last check {}, consecutive growth {})",
            context,
            self.state.check_count,
            format_bytes(current),
            format_delta(since_baseline),
            format_delta(since_last),
            self.state.consecutive_growth_count
        );

        let mut suspected = false;
        if since_baseline > LEAK_THRESHOLD_BYTES as i64 {
            log::warn!(
                "[{}] Possible memory leak: usage grew {} over the baseline of {} (threshold {})",
                context,
                format_delta(since_baseline),
                format_bytes(self.state.baseline_bytes),
                format_bytes(LEAK_THRESHOLD_BYTES)
            );
            suspected = true;
        }
        if self.state.consecutive_growth_count >= GROWTH_PATTERN_CHECKS {
            log::warn!(
                "[{}] Possible memory leak: usage grew on {} consecutive checks",
                context,
                self.state.consecutive_growth_count
            );
            self.state.consecutive_growth_count = 0;
            suspected = true;
        }
        suspected
    }

    /// Re-anchors the baseline to the current reading and zeroes the counters.
    pub fn reset_baseline(&mut self) {
        self.state.check_count = 0;
        self.state.consecutive_growth_count = 0;
        match self.probe.resident_bytes() {
            Some(bytes) => {
                self.state.baseline_bytes = bytes;
                self.state.last_check_bytes = bytes;
                self.anchored = true;
                log::info!("Memory baseline reset to {}", format_bytes(bytes));
            }
            None => log::warn!("Memory baseline reset skipped: usage unavailable"),
        }
    }
}
