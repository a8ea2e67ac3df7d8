//! Execution-speed telemetry: virtual-time epochs.
//!
//! An epoch closes when the kernel has advanced far enough in both virtual
//! time and wall-clock time since the previous one. Rollbacks retract epochs
//! past the rollback point; commitment below GVT makes them reportable. The
//! speed summary feeds an external resource controller in the full system;
//! here it is surfaced through the log and the accessors.

use std::time::Instant;

use tracing::info;

use crate::event::Time;

/// One completed stretch of execution.
#[derive(Clone, Debug, PartialEq)]
pub struct Epoch {
    pub begin_vtime: Time,
    pub end_vtime: Time,
    pub vtime_advance: Time,
    pub wall_ms: u64,
}

/// Rolling epoch record for one rank.
pub struct EpochLog {
    epochs: Vec<Epoch>,
    committed: usize,
    vtime_thresh: Time,
    clock_thresh_ms: u64,
    min_epoch_count: usize,
    prev_vtime: Option<Time>,
    clock: Instant,
    reported: bool,
}

impl EpochLog {
    pub fn new(vtime_thresh: Time, clock_thresh_ms: u64, min_epoch_count: usize) -> Self {
        Self {
            epochs: Vec::new(),
            committed: 0,
            vtime_thresh,
            clock_thresh_ms,
            min_epoch_count,
            prev_vtime: None,
            clock: Instant::now(),
            reported: false,
        }
    }

    /// Observe the virtual time of a dispatched batch; closes an epoch when
    /// both thresholds are exceeded.
    pub fn advance(&mut self, vtime: Time) {
        let begin = match self.prev_vtime {
            Some(t) => t,
            None => {
                self.prev_vtime = Some(vtime);
                self.clock = Instant::now();
                return;
            }
        };
        let wall_ms = self.clock.elapsed().as_millis() as u64;
        if vtime - begin > self.vtime_thresh && wall_ms > self.clock_thresh_ms {
            self.epochs.push(Epoch {
                begin_vtime: begin,
                end_vtime: vtime,
                vtime_advance: vtime - begin,
                wall_ms,
            });
            self.prev_vtime = Some(vtime);
            self.clock = Instant::now();
        }
    }

    /// A rollback retracts every epoch that ends past the rollback time and
    /// resets the trackers so fresh epochs form.
    pub fn rollback(&mut self, to: Time) {
        let keep = self
            .epochs
            .partition_point(|e| e.end_vtime <= to)
            .max(self.committed);
        self.epochs.truncate(keep);
        self.prev_vtime = None;
    }

    /// Commit epochs wholly below the new GVT and report speed once enough
    /// have accumulated.
    pub fn commit(&mut self, gvt: Time) {
        self.committed = self.epochs.partition_point(|e| e.end_vtime <= gvt);
        if !self.reported && self.committed >= self.min_epoch_count {
            self.reported = true;
            let advance: Time = self.epochs[..self.committed]
                .iter()
                .map(|e| e.vtime_advance)
                .sum();
            let wall: u64 = self.epochs[..self.committed].iter().map(|e| e.wall_ms).sum();
            info!(
                epochs = self.committed,
                vtime_advance = advance,
                wall_ms = wall,
                "execution speed report"
            );
        }
    }

    pub fn epochs(&self) -> &[Epoch] {
        &self.epochs
    }

    pub fn committed(&self) -> usize {
        self.committed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log() -> EpochLog {
        // Zero wall threshold so tests do not sleep.
        EpochLog::new(5.0, 0, 2)
    }

    #[test]
    fn epochs_need_vtime_advance() {
        let mut l = log();
        l.advance(1.0);
        l.advance(2.0);
        assert!(l.epochs().is_empty());
        std::thread::sleep(std::time::Duration::from_millis(2));
        l.advance(10.0);
        assert_eq!(l.epochs().len(), 1);
        assert_eq!(l.epochs()[0].begin_vtime, 1.0);
        assert_eq!(l.epochs()[0].end_vtime, 10.0);
    }

    #[test]
    fn rollback_retracts_uncommitted_epochs() {
        let mut l = log();
        l.advance(0.0);
        std::thread::sleep(std::time::Duration::from_millis(2));
        l.advance(10.0);
        std::thread::sleep(std::time::Duration::from_millis(2));
        l.advance(20.0);
        assert_eq!(l.epochs().len(), 2);
        l.rollback(12.0);
        assert_eq!(l.epochs().len(), 1);
        assert_eq!(l.epochs()[0].end_vtime, 10.0);
    }

    #[test]
    fn commit_counts_epochs_below_gvt() {
        let mut l = log();
        l.advance(0.0);
        std::thread::sleep(std::time::Duration::from_millis(2));
        l.advance(10.0);
        std::thread::sleep(std::time::Duration::from_millis(2));
        l.advance(20.0);
        l.commit(15.0);
        assert_eq!(l.committed(), 1);
        l.commit(30.0);
        assert_eq!(l.committed(), 2);
    }
}
