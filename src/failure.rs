use std::collections::VecDeque;
use std::time::{Duration, Instant};

const SAMPLE_WINDOW: usize = 64;

/// Adaptive accrual failure detector. Learns the inter-arrival distribution
/// of heartbeats and reports the probability that a peer which has gone
/// silent is actually down, rather than using a fixed timeout.
///
/// The probability is the exponential CDF evaluated at the time since the
/// last heartbeat, scaled against the observed mean interval. Until enough
/// samples exist, the expected interval serves as the prior.
pub struct FailureDetector {
    intervals: VecDeque<f64>,
    last_heartbeat: Option<Instant>,
    expected_interval: Duration,
    threshold: f64,
    scaling_factor: f64,
}

impl FailureDetector {
    pub fn new(expected_interval: Duration, threshold: f64) -> Self {
        FailureDetector {
            intervals: VecDeque::with_capacity(SAMPLE_WINDOW),
            last_heartbeat: None,
            expected_interval,
            threshold,
            scaling_factor: 0.9,
        }
    }

    /// Record a heartbeat arrival.
    pub fn heartbeat(&mut self) {
        self.heartbeat_at(Instant::now())
    }

    pub fn heartbeat_at(&mut self, now: Instant) {
        if let Some(last) = self.last_heartbeat {
            if self.intervals.len() == SAMPLE_WINDOW {
                self.intervals.pop_front();
            }
            self.intervals
                .push_back(now.saturating_duration_since(last).as_secs_f64());
        }
        self.last_heartbeat = Some(now);
    }

    /// Probability that the peer has failed, given the silence so far.
    /// Zero until the first heartbeat window opens.
    pub fn failure_probability(&self, now: Instant) -> f64 {
        let Some(last) = self.last_heartbeat else {
            return 0.0;
        };
        let elapsed = now.saturating_duration_since(last).as_secs_f64();
        let mean = if self.intervals.is_empty() {
            self.expected_interval.as_secs_f64()
        } else {
            self.intervals.iter().sum::<f64>() / self.intervals.len() as f64
        };
        // guard against a degenerate mean when heartbeats arrive in a burst
        let mean = mean.max(self.expected_interval.as_secs_f64() * self.scaling_factor);
        1.0 - (-elapsed / mean).exp()
    }

    /// True when the silence has lasted long enough that the failure
    /// probability crosses the configured threshold.
    pub fn check_failure(&self) -> bool {
        self.check_failure_at(Instant::now())
    }

    pub fn check_failure_at(&self, now: Instant) -> bool {
        self.failure_probability(now) >= self.threshold
    }
}
