//! A feedback controller that searches for the working-thread ceiling with
//! the best measured throughput.
//!
//! The controller consists of three elements:
//! * Throughput sampling
//! * Trend comparison
//! * Step decision
//!
//! ## Throughput sampling
//! Workers count completed work units; the last worker to finish a unit
//! after the sample deadline closes the window and reports
//! `completions / elapsed` here. Samples shorter than half the configured
//! interval are discarded as too noisy to correlate.
//!
//! ## Trend comparison
//! Per ceiling level the controller keeps an Exponentially Weighted Moving
//! Average of the sampled throughput. When the level changes, the EMA of the
//! level being left is remembered, so the next decision can compare "how we
//! do here" against "how we did there". The smoothing factor is estimated
//! with `2 / (N + 1)` where `N` is the history window size.
//!
//! ## Step decision
//! Three cases fall out of the comparison (threshold eluded by a small
//! relative epsilon for measurement jitter):
//! * The last move improved throughput: keep moving in that direction.
//! * The last move hurt throughput: turn around.
//! * Throughput is flat: hold the level and sample less often, stretching
//!   the interval toward its ceiling; a productive move shrinks it back
//!   toward the configured floor.
//!
//! Starvation injections from the supervisor and idle-timeout shrinks from
//! exiting workers arrive as [`HillClimbing::force_change`]. A forced level
//! is not a measurement, so the comparison history is reset rather than
//! letting the controller "learn" from a level it did not choose.

use std::collections::VecDeque;
use tracing::debug;

/// How many closed samples are retained for inspection.
const SAMPLE_HISTORY: usize = 8;

/// EMA smoothing coefficient for the per-level throughput average.
const EMA_COEFFICIENT: f64 = 2.0 / (SAMPLE_HISTORY as f64 + 1.0);

/// Relative throughput change below which two levels are considered equal.
const FLAT_EPSILON: f64 = 0.01;

/// Longest interval the controller will stretch to between samples.
const MAX_SAMPLE_INTERVAL_MS: u32 = 4_000;

/// Why the working-thread ceiling changed.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum ChangeReason {
    /// No history yet; probing upward.
    Warmup,
    /// The previous move improved throughput; continuing.
    Climb,
    /// The previous move hurt throughput; turning around.
    Reverse,
    /// Throughput is flat; holding.
    Stabilize,
    /// The gate thread saw the queue starving.
    Starvation,
    /// An idle worker timed out and the ceiling was clamped down.
    ThreadTimedOut,
    /// A configured limit moved and dragged the ceiling with it.
    Limit,
}

#[derive(Debug, Copy, Clone)]
struct Sample {
    threads: u16,
    throughput: f64,
}

/// Controller state. One instance per pool, mutated only under the thread
/// adjustment lock.
#[derive(Debug)]
pub(crate) struct HillClimbing {
    history: VecDeque<Sample>,
    /// EMA at the ceiling currently in force, if any sample closed there.
    current: Option<Sample>,
    /// EMA at the ceiling we most recently left.
    previous: Option<Sample>,
    initial_interval_ms: u32,
    interval_ms: u32,
}

impl HillClimbing {
    pub(crate) fn new(sample_interval_ms: u32) -> Self {
        HillClimbing {
            history: VecDeque::with_capacity(SAMPLE_HISTORY),
            current: None,
            previous: None,
            initial_interval_ms: sample_interval_ms,
            interval_ms: sample_interval_ms,
        }
    }

    /// Current sample interval in milliseconds.
    pub(crate) fn interval_ms(&self) -> u32 {
        self.interval_ms
    }

    /// Close a sample window and propose a new ceiling.
    ///
    /// `elapsed_ms` is wall-clock time since the window opened and
    /// `completions` the number of work units finished in it. The result is
    /// clamped to `[min_limit, max_limit]`; committing it to the counter is
    /// the caller's business.
    pub(crate) fn update(
        &mut self,
        current_max: u16,
        elapsed_ms: u64,
        completions: u64,
        min_limit: u16,
        max_limit: u16,
    ) -> u16 {
        if elapsed_ms * 2 < self.interval_ms as u64 {
            // Too short to mean anything; keep the window open.
            return current_max;
        }

        let throughput = completions as f64 / (elapsed_ms as f64 / 1000.0);
        self.record(current_max, throughput);

        let (target, reason) = self.decide(current_max);
        let target = target.clamp(min_limit, max_limit);

        if target != current_max {
            debug!(
                from = current_max,
                to = target,
                ?reason,
                throughput,
                "adjusting working-thread ceiling"
            );
            self.previous = self.current.take();
        }
        target
    }

    /// An external agent (gate starvation, worker timeout, configuration)
    /// set the ceiling directly. Bypasses the interval gate; the caller has
    /// already bounded the value.
    pub(crate) fn force_change(&mut self, new_max: u16, reason: ChangeReason) {
        debug!(new_max, ?reason, "working-thread ceiling forced");
        // The new level was not chosen by measurement; correlating against
        // the old one would mislead the next decision.
        self.current = None;
        self.previous = None;
    }

    fn record(&mut self, threads: u16, throughput: f64) {
        if self.history.len() == SAMPLE_HISTORY {
            self.history.pop_front();
        }
        self.history.push_back(Sample {
            threads,
            throughput,
        });

        self.current = Some(match self.current {
            Some(sample) if sample.threads == threads => Sample {
                threads,
                throughput: sample.throughput + EMA_COEFFICIENT * (throughput - sample.throughput),
            },
            _ => Sample {
                threads,
                throughput,
            },
        });
    }

    fn decide(&mut self, current_max: u16) -> (u16, ChangeReason) {
        let current = match self.current {
            Some(sample) => sample,
            None => return (current_max, ChangeReason::Stabilize),
        };

        let previous = match self.previous {
            Some(sample) if sample.threads != current.threads => sample,
            _ => {
                // Nothing to compare against yet; probe upward once.
                return (current_max.saturating_add(1), ChangeReason::Warmup);
            }
        };

        let baseline = previous.throughput.max(f64::EPSILON);
        let delta = (current.throughput - previous.throughput) / baseline;

        if delta.abs() <= FLAT_EPSILON {
            self.stretch_interval();
            return (current_max, ChangeReason::Stabilize);
        }

        let moved_up = current.threads > previous.threads;
        let improved = delta > 0.0;
        if improved == moved_up {
            // More threads helped, or fewer threads hurt: climb.
            self.shrink_interval();
            (current_max.saturating_add(1), ChangeReason::Climb)
        } else {
            // More threads hurt, or fewer threads helped: descend.
            self.stretch_interval();
            (current_max.saturating_sub(1), ChangeReason::Reverse)
        }
    }

    fn stretch_interval(&mut self) {
        self.interval_ms = (self.interval_ms.saturating_mul(2)).min(MAX_SAMPLE_INTERVAL_MS);
    }

    fn shrink_interval(&mut self) {
        self.interval_ms = (self.interval_ms / 2).max(self.initial_interval_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stays_within_limits() {
        let mut hill = HillClimbing::new(100);
        let mut max = 4u16;
        // Monotonically "improving" measurements push the ceiling up; it
        // must still never leave the [2, 6] band.
        for i in 0..50u64 {
            max = hill.update(max, 200, 100 + i * 50, 2, 6);
            assert!((2..=6).contains(&max), "escaped bounds: {}", max);
        }
    }

    #[test]
    fn descends_when_more_threads_hurt() {
        let mut hill = HillClimbing::new(100);
        // Warmup probes 4 -> 5.
        let up = hill.update(4, 200, 1000, 1, 16);
        assert_eq!(up, 5);
        // Throughput collapses at 5; the controller must not keep climbing.
        let mut max = up;
        for _ in 0..4 {
            max = hill.update(max, 200, 100, 1, 16);
        }
        assert!(max <= 5);
    }

    #[test]
    fn short_sample_is_discarded() {
        let mut hill = HillClimbing::new(100);
        // 10ms elapsed with a 100ms interval: no decision, no state change.
        assert_eq!(hill.update(4, 10, 100_000, 1, 16), 4);
        assert!(hill.history.is_empty());
    }

    #[test]
    fn forced_change_resets_comparison() {
        let mut hill = HillClimbing::new(100);
        hill.update(4, 200, 1000, 1, 16);
        hill.force_change(9, ChangeReason::Starvation);
        assert!(hill.current.is_none());
        // First decision after a force is a warmup probe again.
        let next = hill.update(9, 200, 1000, 1, 16);
        assert_eq!(next, 10);
    }

    #[test]
    fn interval_stretches_when_flat() {
        let mut hill = HillClimbing::new(100);
        let mut max = 4u16;
        for _ in 0..10 {
            max = hill.update(max, 400, 1000, 1, 16);
        }
        assert!(hill.interval_ms() >= 100);
        assert!(hill.interval_ms() <= MAX_SAMPLE_INTERVAL_MS);
    }
}
