use parking_lot::Mutex;
use std::time::Duration;

/// Safepoint performance statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SafepointStats {
    /// Physical safepoints that reached `Active`.
    pub safepoints: u64,
    /// Requests served by a safepoint another request had already started.
    pub coalesced_requests: u64,
    pub cancelled_requests: u64,
    /// Synchronizations given up because every requester withdrew.
    pub abandoned: u64,
    pub timeouts: u64,
    pub total_time_to_safepoint: Duration,
    pub max_time_to_safepoint: Duration,
    /// Total number of polls across all threads
    pub total_polls: u64,
    /// Total number of slow path executions
    pub total_hits: u64,
}

impl SafepointStats {
    /// Hit rate (hits / polls)
    pub fn hit_rate(&self) -> f64 {
        if self.total_polls == 0 {
            0.0
        } else {
            self.total_hits as f64 / self.total_polls as f64
        }
    }

    pub fn avg_time_to_safepoint(&self) -> Duration {
        if self.safepoints == 0 {
            Duration::ZERO
        } else {
            self.total_time_to_safepoint / self.safepoints as u32
        }
    }
}

#[derive(Debug, Default)]
pub(super) struct StatsRecorder {
    inner: Mutex<SafepointStats>,
}

impl StatsRecorder {
    pub(super) fn record_safepoint(&self, batch_size: usize, time_to_safepoint: Duration) {
        let mut stats = self.inner.lock();
        stats.safepoints += 1;
        stats.coalesced_requests += batch_size.saturating_sub(1) as u64;
        stats.total_time_to_safepoint += time_to_safepoint;
        stats.max_time_to_safepoint = stats.max_time_to_safepoint.max(time_to_safepoint);
    }

    pub(super) fn record_cancellation(&self) {
        self.inner.lock().cancelled_requests += 1;
    }

    pub(super) fn record_abandoned(&self) {
        self.inner.lock().abandoned += 1;
    }

    pub(super) fn record_timeout(&self) {
        self.inner.lock().timeouts += 1;
    }

    pub(super) fn snapshot(&self, polls: u64, hits: u64) -> SafepointStats {
        let mut stats = self.inner.lock().clone();
        stats.total_polls = polls;
        stats.total_hits = hits;
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_values_handle_empty_stats() {
        let stats = SafepointStats::default();
        assert_eq!(stats.hit_rate(), 0.0);
        assert_eq!(stats.avg_time_to_safepoint(), Duration::ZERO);
    }

    #[test]
    fn recorder_accumulates_batches() {
        let recorder = StatsRecorder::default();
        recorder.record_safepoint(3, Duration::from_millis(4));
        recorder.record_safepoint(1, Duration::from_millis(2));
        recorder.record_cancellation();

        let stats = recorder.snapshot(100, 5);
        assert_eq!(stats.safepoints, 2);
        assert_eq!(stats.coalesced_requests, 2);
        assert_eq!(stats.cancelled_requests, 1);
        assert_eq!(stats.max_time_to_safepoint, Duration::from_millis(4));
        assert_eq!(stats.avg_time_to_safepoint(), Duration::from_millis(3));
        assert!((stats.hit_rate() - 0.05).abs() < f64::EPSILON);
    }
}
