//! Periodic throughput sampling.
//!
//! The aggregator only reads the shared counters. Each tick it turns the
//! change in `received` into packets per second and a coarse round-trip
//! estimate: with `active` clients each doing one round trip at a time,
//! `interval / delta * active` approximates the time one round trip takes.

use crate::metrics::Metrics;
use crate::shutdown::Shutdown;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tracing::info;

/// One aggregator sample
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Snapshot {
    pub packets_per_second: f64,
    pub total_drops: u64,
    /// `None` when nothing came back during the tick
    pub avg_rtt_estimate_ms: Option<f64>,
    pub active_clients: usize,
    pub elapsed: Duration,
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pps: {:.0} total drops: {} avg rtt: ",
            self.packets_per_second, self.total_drops
        )?;
        match self.avg_rtt_estimate_ms {
            Some(ms) => write!(f, "{ms:.3}ms")?,
            None => write!(f, "n/a")?,
        }
        write!(
            f,
            " clients: {} elapsed: {:.1}s",
            self.active_clients,
            self.elapsed.as_secs_f64()
        )
    }
}

/// Read-only observer of the run counters
pub struct StatsAggregator {
    metrics: Arc<Metrics>,
    interval: Duration,
    started: Instant,
    last_received: u64,
}

impl StatsAggregator {
    pub fn new(metrics: Arc<Metrics>, interval: Duration) -> Self {
        let last_received = metrics.received();
        StatsAggregator {
            metrics,
            interval,
            started: Instant::now(),
            last_received,
        }
    }

    /// Take a sample covering `elapsed_since_last` and advance the baseline.
    pub fn sample(&mut self, elapsed_since_last: Duration) -> Snapshot {
        let received = self.metrics.received();
        let delta = received.saturating_sub(self.last_received);
        self.last_received = received;

        let active_clients = self.metrics.active_clients();
        let secs = elapsed_since_last.as_secs_f64();

        Snapshot {
            packets_per_second: if secs > 0.0 { delta as f64 / secs } else { 0.0 },
            total_drops: self.metrics.drops(),
            avg_rtt_estimate_ms: rtt_estimate_ms(elapsed_since_last, delta, active_clients),
            active_clients,
            elapsed: self.started.elapsed(),
        }
    }

    /// Log a snapshot every interval until shutdown.
    pub async fn run(mut self, shutdown: Shutdown) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        let mut last_tick = Instant::now();

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let now = Instant::now();
            let snapshot = self.sample(now - last_tick);
            last_tick = now;

            info!(
                pps = snapshot.packets_per_second,
                drops = snapshot.total_drops,
                active_clients = snapshot.active_clients,
                "{snapshot}"
            );
        }
    }
}

/// Aggregate round-trip estimate, undefined when no packets came back
pub fn rtt_estimate_ms(interval: Duration, delta: u64, active_clients: usize) -> Option<f64> {
    if delta == 0 {
        return None;
    }
    Some(interval.as_secs_f64() * 1000.0 / delta as f64 * active_clients as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rtt_estimate() {
        let second = Duration::from_secs(1);
        assert_eq!(rtt_estimate_ms(second, 1000, 1), Some(1.0));
        assert_eq!(rtt_estimate_ms(second, 500, 5), Some(10.0));
        assert_eq!(rtt_estimate_ms(Duration::from_millis(500), 250, 2), Some(4.0));
    }

    #[test]
    fn test_rtt_estimate_without_traffic() {
        assert_eq!(rtt_estimate_ms(Duration::from_secs(1), 0, 3), None);
    }

    #[test]
    fn test_sample_uses_delta() {
        let metrics = Metrics::new();
        let _client = metrics.client_started();
        let mut aggregator = StatsAggregator::new(Arc::clone(&metrics), Duration::from_secs(1));

        for _ in 0..200 {
            metrics.record_sent();
            metrics.record_received();
        }
        metrics.record_drop();

        let first = aggregator.sample(Duration::from_secs(1));
        assert_eq!(first.packets_per_second, 200.0);
        assert_eq!(first.total_drops, 1);
        assert_eq!(first.active_clients, 1);
        assert_eq!(first.avg_rtt_estimate_ms, Some(5.0));

        for _ in 0..50 {
            metrics.record_received();
        }
        let second = aggregator.sample(Duration::from_millis(500));
        assert_eq!(second.packets_per_second, 100.0);
        assert_eq!(second.avg_rtt_estimate_ms, Some(10.0));

        let idle = aggregator.sample(Duration::from_secs(1));
        assert_eq!(idle.packets_per_second, 0.0);
        assert_eq!(idle.avg_rtt_estimate_ms, None);
    }

    #[test]
    fn test_sample_never_mutates_counters() {
        let metrics = Metrics::new();
        metrics.record_sent();
        metrics.record_received();
        let before = metrics.totals();

        let mut aggregator = StatsAggregator::new(Arc::clone(&metrics), Duration::from_secs(1));
        aggregator.sample(Duration::from_secs(1));
        assert_eq!(metrics.totals(), before);
    }

    #[test]
    fn test_snapshot_display() {
        let snapshot = Snapshot {
            packets_per_second: 1200.0,
            total_drops: 3,
            avg_rtt_estimate_ms: None,
            active_clients: 4,
            elapsed: Duration::from_secs(2),
        };
        assert_eq!(
            snapshot.to_string(),
            "pps: 1200 total drops: 3 avg rtt: n/a clients: 4 elapsed: 2.0s"
        );
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let shutdown = Shutdown::new();
        let aggregator = StatsAggregator::new(Metrics::new(), Duration::from_millis(20));
        let handle = tokio::spawn(aggregator.run(shutdown.clone()));

        tokio::time::sleep(Duration::from_millis(70)).await;
        shutdown.cancel();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("aggregator ignored shutdown")
            .unwrap();
    }
}
