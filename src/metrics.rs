//! Rolling per-connection metrics.

/// Smoothing factor for the latency exponential moving average.
const LATENCY_SMOOTHING: f64 = 0.2;

/// Metrics snapshot for one connection.
///
/// `messages_per_second` is a per-interval counter: it accumulates between
/// health-check sweeps and is reset to zero at the start of each one, so the
/// least-load balancing strategy always sees activity from the current
/// interval only.
#[derive(Debug, Clone, Default)]
pub struct ConnectionMetrics {
    /// Exponential moving average of observed round-trip latency (ms).
    pub latency_ms: f64,
    /// Frames handled since the last health-check sweep.
    pub messages_per_second: u64,
    /// Cumulative transport error count since the connection was opened.
    pub error_count: u64,
    /// Milliseconds since the last successful open; refreshed each sweep.
    pub uptime_ms: u64,
    /// Total bytes sent and received.
    pub bytes_transferred: u64,
}

impl ConnectionMetrics {
    pub(crate) fn record_latency(&mut self, sample_ms: f64) {
        self.latency_ms =
            self.latency_ms * (1.0 - LATENCY_SMOOTHING) + sample_ms * LATENCY_SMOOTHING;
    }

    pub(crate) fn record_frame(&mut self, bytes: usize) {
        self.messages_per_second += 1;
        self.bytes_transferred += bytes as u64;
    }

    pub(crate) fn record_error(&mut self) {
        self.error_count += 1;
    }

    pub(crate) fn start_interval(&mut self) {
        self.messages_per_second = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latency_follows_ema() {
        let mut metrics = ConnectionMetrics::default();
        metrics.record_latency(100.0);
        assert!((metrics.latency_ms - 20.0).abs() < f64::EPSILON);
        metrics.record_latency(100.0);
        assert!((metrics.latency_ms - 36.0).abs() < f64::EPSILON);
    }

    #[test]
    fn interval_reset_clears_rate_but_not_totals() {
        let mut metrics = ConnectionMetrics::default();
        metrics.record_frame(10);
        metrics.record_frame(20);
        assert_eq!(metrics.messages_per_second, 2);
        assert_eq!(metrics.bytes_transferred, 30);

        metrics.start_interval();
        assert_eq!(metrics.messages_per_second, 0);
        assert_eq!(metrics.bytes_transferred, 30);
    }
}
