//! Connection health metrics.
//!
//! Latency comes from diffing heartbeat send times against the local clock;
//! throughput is a rolling count of frames over a fixed window.

use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Number of consecutive failed attempts after which a connection is
/// reported as degraded.
pub const DEFAULT_DEGRADED_AFTER: u32 = 3;

/// Default rolling window for the message rate.
pub const DEFAULT_RATE_WINDOW: Duration = Duration::from_secs(10);

/// Point-in-time view of connection health.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionMetrics {
    /// Round-trip estimate from the last heartbeat.
    pub latency_ms: Option<u64>,
    /// Frames per second over the rolling window.
    pub messages_per_second: f64,
    /// Local time the last heartbeat arrived.
    pub last_heartbeat_ms: Option<u64>,
    /// Local time the last frame of any kind arrived.
    pub last_message_ms: Option<u64>,
    /// Reconnects scheduled since the client started.
    pub reconnect_count: u64,
    /// Failed attempts since the last successful open.
    pub consecutive_failures: u32,
    /// Text of the most recent transport error.
    pub last_error: Option<String>,
    /// Set after repeated consecutive failures.
    pub is_degraded: bool,
}

/// Accumulates metrics as frames and transport events arrive.
#[derive(Debug, Clone)]
pub struct MetricsTracker {
    window: Duration,
    degraded_after: u32,
    arrivals: VecDeque<u64>,
    current: ConnectionMetrics,
}

impl Default for MetricsTracker {
    fn default() -> Self {
        Self::new(DEFAULT_RATE_WINDOW, DEFAULT_DEGRADED_AFTER)
    }
}

impl MetricsTracker {
    /// Create a tracker with the given rate window and degraded threshold.
    #[must_use]
    pub fn new(window: Duration, degraded_after: u32) -> Self {
        Self {
            window,
            degraded_after,
            arrivals: VecDeque::new(),
            current: ConnectionMetrics::default(),
        }
    }

    /// Record a frame of any kind.
    pub fn record_message(&mut self, now_ms: u64) {
        self.arrivals.push_back(now_ms);
        self.current.last_message_ms = Some(now_ms);
        self.evict(now_ms);
    }

    /// Record a heartbeat sent by the server at `sent_ms`.
    pub fn record_heartbeat(&mut self, sent_ms: u64, now_ms: u64) {
        self.current.latency_ms = Some(now_ms.saturating_sub(sent_ms));
        self.current.last_heartbeat_ms = Some(now_ms);
        self.current.messages_per_second = self.rate(now_ms);
    }

    /// Record a failed or dropped connection.
    pub fn record_failure(&mut self, error: impl Into<String>, consecutive_failures: u32) {
        self.current.reconnect_count += 1;
        self.current.consecutive_failures = consecutive_failures;
        self.current.last_error = Some(error.into());
        self.current.is_degraded = consecutive_failures >= self.degraded_after;
    }

    /// Record a successful open.
    pub fn record_open(&mut self) {
        self.current.consecutive_failures = 0;
        self.current.last_error = None;
        self.current.is_degraded = false;
    }

    /// Forget the failure streak of a subscription that was torn down.
    /// `reconnect_count` is kept.
    pub fn reset_connection(&mut self) {
        self.current.consecutive_failures = 0;
        self.current.last_error = None;
        self.current.is_degraded = false;
    }

    /// Forget per-connection measurements, keeping cumulative counters.
    pub fn reset_stream(&mut self) {
        self.arrivals.clear();
        self.current.latency_ms = None;
        self.current.messages_per_second = 0.0;
        self.current.last_heartbeat_ms = None;
        self.current.last_message_ms = None;
    }

    /// Snapshot the metrics, refreshing the rolling rate.
    #[must_use]
    pub fn snapshot(&mut self, now_ms: u64) -> ConnectionMetrics {
        self.current.messages_per_second = self.rate(now_ms);
        self.current.clone()
    }

    fn window_ms(&self) -> u64 {
        u64::try_from(self.window.as_millis()).unwrap_or(u64::MAX)
    }

    fn evict(&mut self, now_ms: u64) {
        let cutoff = now_ms.saturating_sub(self.window_ms());
        while self.arrivals.front().is_some_and(|&t| t < cutoff) {
            self.arrivals.pop_front();
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn rate(&mut self, now_ms: u64) -> f64 {
        self.evict(now_ms);
        let secs = self.window.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.arrivals.len() as f64 / secs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_latency() {
        let mut tracker = MetricsTracker::default();
        tracker.record_heartbeat(1_000, 1_120);
        let m = tracker.snapshot(1_120);
        assert_eq!(m.latency_ms, Some(120));
        assert_eq!(m.last_heartbeat_ms, Some(1_120));
    }

    #[test]
    fn test_heartbeat_from_the_future_has_zero_latency() {
        let mut tracker = MetricsTracker::default();
        tracker.record_heartbeat(5_000, 4_000);
        assert_eq!(tracker.snapshot(4_000).latency_ms, Some(0));
    }

    #[test]
    fn test_rolling_rate_over_window() {
        let mut tracker = MetricsTracker::default();
        for i in 0..20 {
            tracker.record_message(i * 100);
        }
        let m = tracker.snapshot(2_000);
        assert!((m.messages_per_second - 2.0).abs() < 1e-9);

        // Everything ages out of the 10 s window.
        let m = tracker.snapshot(20_000);
        assert!(m.messages_per_second.abs() < 1e-9);
    }

    #[test]
    fn test_degraded_after_three_failures() {
        let mut tracker = MetricsTracker::default();
        tracker.record_failure("refused", 1);
        tracker.record_failure("refused", 2);
        assert!(!tracker.snapshot(0).is_degraded);

        tracker.record_failure("refused", 3);
        let m = tracker.snapshot(0);
        assert!(m.is_degraded);
        assert_eq!(m.reconnect_count, 3);
        assert_eq!(m.last_error.as_deref(), Some("refused"));
    }

    #[test]
    fn test_open_clears_error_but_keeps_cumulative_count() {
        let mut tracker = MetricsTracker::default();
        for attempt in 1..=3 {
            tracker.record_failure("timeout", attempt);
        }
        tracker.record_open();
        let m = tracker.snapshot(0);
        assert_eq!(m.reconnect_count, 3);
        assert_eq!(m.consecutive_failures, 0);
        assert!(m.last_error.is_none());
        assert!(!m.is_degraded);
    }

    #[test]
    fn test_reset_connection_clears_failure_streak() {
        let mut tracker = MetricsTracker::default();
        for attempt in 1..=3 {
            tracker.record_failure("refused", attempt);
        }
        tracker.reset_connection();
        let m = tracker.snapshot(0);
        assert_eq!(m.consecutive_failures, 0);
        assert!(m.last_error.is_none());
        assert!(!m.is_degraded);
        assert_eq!(m.reconnect_count, 3);
    }

    #[test]
    fn test_reset_stream_keeps_reconnect_count() {
        let mut tracker = MetricsTracker::default();
        tracker.record_message(10);
        tracker.record_heartbeat(5, 10);
        tracker.record_failure("eof", 1);
        tracker.reset_stream();
        let m = tracker.snapshot(10);
        assert!(m.latency_ms.is_none());
        assert!(m.last_message_ms.is_none());
        assert_eq!(m.reconnect_count, 1);
    }
}
