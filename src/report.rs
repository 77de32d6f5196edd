//! Final run summary.

use crate::metrics::Metrics;
use crate::shutdown::{ExitReason, Shutdown};
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Terminal summary of a run
#[derive(Debug, Clone, PartialEq)]
pub struct Summary {
    pub reason: ExitReason,
    pub started_at: DateTime<Utc>,
    pub runtime: Duration,
    pub sent: u64,
    pub received: u64,
    pub drops: u64,
    /// Clients running when the run was stopped, or at the end of the run
    pub active_clients: usize,
}

impl Summary {
    pub fn exit_code(&self) -> u8 {
        self.reason.exit_code()
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Runtime: {:.3}s Packets sent: {} Packets received: {} Packets dropped: {} ({}",
            self.runtime.as_secs_f64(),
            self.sent,
            self.received,
            self.drops,
            self.reason
        )?;
        if self.reason == ExitReason::LossDetected {
            write!(f, " with {} active clients", self.active_clients)?;
        }
        write!(f, ")")
    }
}

/// Builds the summary exactly once per run
pub struct ExitReporter {
    metrics: Arc<Metrics>,
    shutdown: Shutdown,
    started: Instant,
    started_at: DateTime<Utc>,
    fired: AtomicBool,
}

impl ExitReporter {
    pub fn new(metrics: Arc<Metrics>, shutdown: Shutdown) -> Self {
        ExitReporter {
            metrics,
            shutdown,
            started: Instant::now(),
            started_at: Utc::now(),
            fired: AtomicBool::new(false),
        }
    }

    /// Produce the summary. Only the first call returns one.
    ///
    /// The reason comes from the first shutdown trigger; a run nobody
    /// stopped is reported as completed.
    pub fn finish(&self) -> Option<Summary> {
        if self.fired.swap(true, Ordering::AcqRel) {
            return None;
        }

        let totals = self.metrics.totals();
        let (reason, active_clients) = match self.shutdown.triggered() {
            Some(trigger) => (trigger.reason.clone(), trigger.active_clients),
            None => (ExitReason::Completed, totals.active_clients),
        };

        Some(Summary {
            reason,
            started_at: self.started_at,
            runtime: self.started.elapsed(),
            sent: totals.sent,
            received: totals.received,
            drops: totals.drops,
            active_clients,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reports_once() {
        let metrics = Metrics::new();
        let reporter = ExitReporter::new(Arc::clone(&metrics), Shutdown::new());

        metrics.record_sent();
        metrics.record_received();

        let summary = reporter.finish().unwrap();
        assert_eq!(summary.reason, ExitReason::Completed);
        assert_eq!(summary.sent, 1);
        assert_eq!(summary.received, 1);
        assert_eq!(summary.drops, 0);
        assert_eq!(summary.exit_code(), 0);

        assert!(reporter.finish().is_none());
    }

    #[test]
    fn test_uses_first_trigger() {
        let metrics = Metrics::new();
        let shutdown = Shutdown::new();
        let reporter = ExitReporter::new(Arc::clone(&metrics), shutdown.clone());

        let clients: Vec<_> = (0..3).map(|_| metrics.client_started()).collect();
        shutdown.trigger(ExitReason::LossDetected, metrics.active_clients());
        shutdown.trigger(ExitReason::Interrupted, 0);
        drop(clients);

        let summary = reporter.finish().unwrap();
        assert_eq!(summary.reason, ExitReason::LossDetected);
        assert_eq!(summary.active_clients, 3);
        assert!(summary.to_string().ends_with("(loss detected with 3 active clients)"));
    }

    #[test]
    fn test_interrupt_summary() {
        let shutdown = Shutdown::new();
        let reporter = ExitReporter::new(Metrics::new(), shutdown.clone());
        shutdown.trigger(ExitReason::Interrupted, 0);

        let summary = reporter.finish().unwrap();
        assert_eq!(summary.exit_code(), 130);
        assert!(summary.to_string().starts_with("Runtime: "));
        assert!(summary.to_string().ends_with("(interrupted)"));
    }

    #[test]
    fn test_concurrent_finish_yields_one_summary() {
        let reporter = Arc::new(ExitReporter::new(Metrics::new(), Shutdown::new()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let reporter = Arc::clone(&reporter);
                std::thread::spawn(move || reporter.finish().is_some())
            })
            .collect();

        let produced = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&produced| produced)
            .count();
        assert_eq!(produced, 1);
    }
}
