//! Transfer discipline shared by both directions
//!
//! The downloader and the uploader move bytes differently but account for them
//! the same way: a [`TransferState`] tracks done/total bytes and samples speed
//! at chunk boundaries, emitting a [`ProgressSample`] at most once per
//! interval, and a [`RetryBudget`] bounds how many transient faults in a row
//! are tolerated.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::core::progress::{Stage, Throttle};

/// One throttled observation of a running transfer
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSample {
    pub stage: Stage,
    pub done: u64,
    /// 0 when the size is unknown
    pub total: u64,
    /// Bytes per second over the last sampling window
    pub speed: f64,
    pub elapsed: Duration,
    /// `None` while speed or total are unknown
    pub eta: Option<Duration>,
}

/// Narrow interface through which the engine reports progress.
///
/// Called synchronously from the transfer loop; implementations must not block.
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, sample: &ProgressSample);
}

impl<F> ProgressSink for F
where
    F: Fn(&ProgressSample) + Send + Sync,
{
    fn on_progress(&self, sample: &ProgressSample) {
        self(sample)
    }
}

/// Shared handle to a progress sink
pub type SharedProgress = Arc<dyn ProgressSink>;

/// Sink that drops every sample
pub fn no_progress() -> SharedProgress {
    Arc::new(|_: &ProgressSample| {})
}

/// Byte accounting for one active transfer
#[derive(Debug)]
pub struct TransferState {
    stage: Stage,
    bytes_done: u64,
    bytes_total: u64,
    start_time: Instant,
    last_sample_time: Instant,
    last_sample_bytes: u64,
    throttle: Throttle,
}

impl TransferState {
    /// Start accounting at `offset` bytes (a resumed artifact) out of `total`
    pub fn new(stage: Stage, offset: u64, total: u64, interval: Duration) -> Self {
        let now = Instant::now();
        Self {
            stage,
            bytes_done: offset,
            bytes_total: total,
            start_time: now,
            last_sample_time: now,
            last_sample_bytes: offset,
            throttle: Throttle::started(interval),
        }
    }

    pub fn done(&self) -> u64 {
        self.bytes_done
    }

    pub fn total(&self) -> u64 {
        self.bytes_total
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn set_total(&mut self, total: u64) {
        self.bytes_total = total;
    }

    /// Whether the known total has been reached (never true while unknown)
    pub fn is_complete(&self) -> bool {
        self.bytes_total > 0 && self.bytes_done >= self.bytes_total
    }

    /// Record `n` newly written bytes
    pub fn advance(&mut self, n: u64) {
        self.bytes_done += n;
    }

    /// Jump to an absolute position reported by the remote side.
    ///
    /// Positions only move forward here; going back is [`restart`](Self::restart)
    /// or [`rewind`](Self::rewind).
    pub fn advance_to(&mut self, position: u64) {
        self.bytes_done = self.bytes_done.max(position);
    }

    /// Move back to an earlier position the server chose to resume from
    pub fn rewind(&mut self, position: u64) {
        self.bytes_done = position.min(self.bytes_done);
        self.last_sample_bytes = self.bytes_done;
        self.last_sample_time = Instant::now();
    }

    /// Forget everything: the remote refused to resume and sends it all again
    pub fn restart(&mut self) {
        let now = Instant::now();
        self.bytes_done = 0;
        self.last_sample_bytes = 0;
        self.start_time = now;
        self.last_sample_time = now;
    }

    /// Produce a sample if the throttle allows one
    pub fn sample(&mut self) -> Option<ProgressSample> {
        if !self.throttle.ready() {
            return None;
        }
        Some(self.take_sample())
    }

    /// Produce a sample regardless of the throttle
    pub fn take_sample(&mut self) -> ProgressSample {
        let now = Instant::now();
        let dt = now.duration_since(self.last_sample_time).as_secs_f64().max(0.001);
        let speed = self.bytes_done.saturating_sub(self.last_sample_bytes) as f64 / dt;
        let eta = if speed > 0.0 && self.bytes_total > 0 {
            let remaining = self.bytes_total.saturating_sub(self.bytes_done) as f64;
            Some(Duration::from_secs_f64(remaining / speed))
        } else {
            None
        };

        self.last_sample_time = now;
        self.last_sample_bytes = self.bytes_done;

        ProgressSample {
            stage: self.stage,
            done: self.bytes_done,
            total: self.bytes_total,
            speed,
            elapsed: now.duration_since(self.start_time),
            eta,
        }
    }

    /// Sample and forward to `sink` when the throttle allows it
    pub fn report(&mut self, sink: &dyn ProgressSink) {
        if let Some(sample) = self.sample() {
            sink.on_progress(&sample);
        }
    }
}

/// Bounded number of consecutive transient faults
#[derive(Debug, Clone)]
pub struct RetryBudget {
    max: u32,
    remaining: u32,
    delay: Duration,
}

impl RetryBudget {
    pub fn new(max: u32, delay: Duration) -> Self {
        Self {
            max,
            remaining: max,
            delay,
        }
    }

    /// Take one retry; false once the budget is exhausted
    pub fn try_consume(&mut self) -> bool {
        if self.remaining == 0 {
            return false;
        }
        self.remaining -= 1;
        true
    }

    /// Refill after real progress (a strictly positive chunk was persisted)
    pub fn replenish(&mut self) {
        self.remaining = self.max;
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    pub fn attempts_used(&self) -> u32 {
        self.max - self.remaining
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_retry_budget_consumption_and_refill() {
        let mut budget = RetryBudget::new(2, Duration::from_millis(5));
        assert!(budget.try_consume());
        assert!(budget.try_consume());
        assert!(!budget.try_consume());
        assert_eq!(budget.attempts_used(), 2);

        budget.replenish();
        assert_eq!(budget.remaining(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_samples_are_throttled_and_measure_speed() {
        let mut state = TransferState::new(Stage::Download, 0, 4000, Duration::from_secs(1));
        let samples = Mutex::new(Vec::new());
        let sink = |s: &ProgressSample| samples.lock().unwrap().push(s.clone());

        state.advance(500);
        state.report(&sink);
        assert!(samples.lock().unwrap().is_empty(), "first sample must wait a full interval");

        tokio::time::advance(Duration::from_secs(1)).await;
        state.advance(500);
        state.report(&sink);

        let samples = samples.into_inner().unwrap();
        assert_eq!(samples.len(), 1);
        let sample = &samples[0];
        assert_eq!(sample.done, 1000);
        assert!((sample.speed - 1000.0).abs() < 1.0);
        assert_eq!(sample.eta, Some(Duration::from_secs(3)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_total_has_no_eta() {
        let mut state = TransferState::new(Stage::Upload, 0, 0, Duration::from_secs(1));
        tokio::time::advance(Duration::from_secs(2)).await;
        state.advance(10);
        let sample = state.take_sample();
        assert_eq!(sample.eta, None);
        assert!(!state.is_complete());
    }

    #[test]
    fn test_restart_resets_counters() {
        let mut state = TransferState::new(Stage::Download, 700, 1000, Duration::from_secs(1));
        assert_eq!(state.done(), 700);
        state.restart();
        assert_eq!(state.done(), 0);
        state.advance(1000);
        assert!(state.is_complete());
    }

    #[test]
    fn test_positions_only_move_forward() {
        let mut state = TransferState::new(Stage::Upload, 0, 100, Duration::from_secs(1));
        state.advance_to(60);
        state.advance_to(40);
        assert_eq!(state.done(), 60);
        state.rewind(20);
        assert_eq!(state.done(), 20);
    }
}
