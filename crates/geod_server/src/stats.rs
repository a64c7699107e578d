//! Rolling per-listener statistics.
//!
//! Every housekeeper cycle closes one sample; the window keeps the newest
//! samples and reports min/avg/max over them.

use crate::connection::ReapSummary;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;

/// One housekeeper cycle worth of activity.
#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize)]
pub struct TickSample {
    pub alive: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub finished: u64,
    pub failed: u64,
    pub exec_avg_ms: f64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize)]
pub struct WindowSummary {
    pub samples: usize,
    pub min: TickSample,
    pub avg: TickSample,
    pub max: TickSample,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Totals {
    pub accepted: u64,
    pub rejected: u64,
    pub finished: u64,
    pub failed: u64,
}

#[derive(Debug)]
pub struct RollingStats {
    window: usize,
    samples: VecDeque<TickSample>,
    pending: TickSample,
    pending_exec: Duration,
    totals: Totals,
}

impl RollingStats {
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            window,
            samples: VecDeque::with_capacity(window),
            pending: TickSample::default(),
            pending_exec: Duration::ZERO,
            totals: Totals::default(),
        }
    }

    pub fn record_accept(&mut self) {
        self.pending.accepted += 1;
        self.totals.accepted += 1;
    }

    pub fn record_reject(&mut self) {
        self.pending.rejected += 1;
        self.totals.rejected += 1;
    }

    pub fn record_reap(&mut self, summary: &ReapSummary) {
        self.pending.finished += summary.finished_ok;
        self.pending.failed += summary.failed;
        self.pending_exec += summary.exec_total;
        self.totals.finished += summary.finished_ok;
        self.totals.failed += summary.failed;
    }

    /// Closes the current sample and pushes it into the window.
    pub fn tick(&mut self, alive: usize) -> TickSample {
        let mut sample = std::mem::take(&mut self.pending);
        sample.alive = alive as u64;
        let done = sample.finished + sample.failed;
        if done > 0 {
            sample.exec_avg_ms = self.pending_exec.as_secs_f64() * 1000.0 / done as f64;
        }
        self.pending_exec = Duration::ZERO;

        if self.samples.len() == self.window {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
        sample
    }

    pub fn last(&self) -> Option<TickSample> {
        self.samples.back().copied()
    }

    pub fn totals(&self) -> Totals {
        self.totals
    }

    pub fn summary(&self) -> WindowSummary {
        let Some(first) = self.samples.front().copied() else {
            return WindowSummary::default();
        };
        let mut min = first;
        let mut max = first;
        let mut sum = TickSample::default();
        for s in &self.samples {
            min.alive = min.alive.min(s.alive);
            min.accepted = min.accepted.min(s.accepted);
            min.rejected = min.rejected.min(s.rejected);
            min.finished = min.finished.min(s.finished);
            min.failed = min.failed.min(s.failed);
            min.exec_avg_ms = min.exec_avg_ms.min(s.exec_avg_ms);
            max.alive = max.alive.max(s.alive);
            max.accepted = max.accepted.max(s.accepted);
            max.rejected = max.rejected.max(s.rejected);
            max.finished = max.finished.max(s.finished);
            max.failed = max.failed.max(s.failed);
            max.exec_avg_ms = max.exec_avg_ms.max(s.exec_avg_ms);
            sum.alive += s.alive;
            sum.accepted += s.accepted;
            sum.rejected += s.rejected;
            sum.finished += s.finished;
            sum.failed += s.failed;
            sum.exec_avg_ms += s.exec_avg_ms;
        }
        let n = self.samples.len() as u64;
        let avg = TickSample {
            alive: sum.alive / n,
            accepted: sum.accepted / n,
            rejected: sum.rejected / n,
            finished: sum.finished / n,
            failed: sum.failed / n,
            exec_avg_ms: sum.exec_avg_ms / n as f64,
        };
        WindowSummary {
            samples: self.samples.len(),
            min,
            avg,
            max,
        }
    }

    /// Drops the window and the running totals.
    pub fn clear(&mut self) {
        self.samples.clear();
        self.pending = TickSample::default();
        self.pending_exec = Duration::ZERO;
        self.totals = Totals::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_keeps_newest_samples() {
        let mut stats = RollingStats::new(3);
        for alive in [5, 1, 7, 3] {
            stats.tick(alive);
        }
        let summary = stats.summary();
        assert_eq!(summary.samples, 3);
        assert_eq!(summary.min.alive, 1);
        assert_eq!(summary.max.alive, 7);
        assert_eq!(summary.avg.alive, 3);
        assert_eq!(stats.last().unwrap().alive, 3);
    }

    #[test]
    fn reaped_connections_land_in_the_next_sample() {
        let mut stats = RollingStats::new(12);
        stats.record_accept();
        stats.record_accept();
        stats.record_reject();
        stats.record_reap(&ReapSummary {
            finished_ok: 3,
            failed: 1,
            exec_total: Duration::from_millis(40),
        });

        let sample = stats.tick(2);
        assert_eq!(sample.accepted, 2);
        assert_eq!(sample.rejected, 1);
        assert_eq!(sample.finished, 3);
        assert_eq!(sample.failed, 1);
        assert!((sample.exec_avg_ms - 10.0).abs() < 1e-9);

        let empty = stats.tick(0);
        assert_eq!(empty.finished, 0);
        assert_eq!(empty.exec_avg_ms, 0.0);
        assert_eq!(stats.totals().finished, 3);
    }

    #[test]
    fn clear_resets_everything() {
        let mut stats = RollingStats::new(2);
        stats.record_accept();
        stats.tick(1);
        stats.clear();
        assert_eq!(stats.summary(), WindowSummary::default());
        assert_eq!(stats.totals(), Totals::default());
    }
}
