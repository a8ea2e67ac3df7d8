//! Structured configuration for a simulation rank.
//!
//! Command-line ingestion is deliberately left to the embedding program;
//! these are the knobs the kernel itself recognizes.

use crate::event::Time;
use crate::KernelError;

/// Which priority structure backs the scheduler.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum QueueKind {
    /// Heap of agents over per-agent time buckets. The single-thread default.
    #[default]
    ThreeTier,
    /// Bucketed multi-rung ladder, strong on short bursts.
    Ladder,
    /// Ladder with sender-hashed sub-buckets for fast cancellation scans.
    TwoTierLadder,
    /// Lock-free skip list; required by the multi-threaded rank.
    LockFreeSkip,
}

/// All options the kernel recognizes, with the defaults the original tooling
/// shipped.
#[derive(Clone, Debug)]
pub struct SimConfig {
    pub queue: QueueKind,
    /// Virtual-time window beyond GVT the optimistic scheduler may run ahead;
    /// `0.0` disables throttling.
    pub time_window: Time,
    /// Virtual-time units between GVT initiations on rank 0.
    pub gvt_period: Time,
    /// `> 0.0` selects conservative mode with this lookahead.
    pub lookahead: Time,
    /// Maximum rung depth in the ladder queues.
    pub lq_max_rungs: usize,
    /// Sub-buckets per bucket in the two-tier ladder.
    pub lq_t2k: usize,
    /// Logical-deletion batching threshold for the lock-free queue.
    pub lfpq_max_offset: usize,
    /// Completed epochs required before a speed report is emitted.
    pub min_epoch_count: usize,
    /// Minimum virtual-time advance for a new telemetry epoch.
    pub epoch_vtime_thresh: Time,
    /// Minimum wall-clock advance (ms) for a new telemetry epoch.
    pub epoch_clock_thresh_ms: u64,
    /// Virtual time at which the simulation terminates.
    pub end_time: Time,
    /// Worker-thread bound for the multi-threaded rank; also the thread cap
    /// the lock-free queue's reclamation bitmap enforces.
    pub max_threads: usize,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            queue: QueueKind::ThreeTier,
            time_window: 0.0,
            gvt_period: 10.0,
            lookahead: 0.0,
            lq_max_rungs: 8,
            lq_t2k: 32,
            lfpq_max_offset: 8,
            min_epoch_count: 3,
            epoch_vtime_thresh: 10.0,
            epoch_clock_thresh_ms: 30,
            end_time: 100.0,
            max_threads: 4,
        }
    }
}

impl SimConfig {
    pub fn validate(&self) -> Result<(), KernelError> {
        if !self.end_time.is_finite() || self.end_time <= 0.0 {
            return Err(KernelError::Config(format!(
                "end_time must be finite and positive, got {}",
                self.end_time
            )));
        }
        if self.time_window < 0.0 || self.lookahead < 0.0 || self.gvt_period <= 0.0 {
            return Err(KernelError::Config(
                "time_window and lookahead must be nonnegative, gvt_period positive".into(),
            ));
        }
        if self.lq_max_rungs == 0 || self.lq_t2k == 0 {
            return Err(KernelError::Config(
                "ladder queues need at least one rung and one sub-bucket".into(),
            ));
        }
        if self.max_threads == 0 || self.max_threads > 64 {
            return Err(KernelError::TooManyThreads(64));
        }
        if self.conservative() && self.queue == QueueKind::LockFreeSkip {
            return Err(KernelError::Config(
                "conservative mode runs a single dispatch thread; pick a single-threaded queue"
                    .into(),
            ));
        }
        Ok(())
    }

    pub fn conservative(&self) -> bool {
        self.lookahead > 0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        SimConfig::default().validate().unwrap();
    }

    #[test]
    fn bad_end_time_rejected() {
        let cfg = SimConfig {
            end_time: f64::INFINITY,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn thread_cap_enforced() {
        let cfg = SimConfig {
            max_threads: 65,
            ..Default::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(KernelError::TooManyThreads(64))
        ));
    }
}
