//! Shared run counters.
//!
//! One `Metrics` instance is created per run and handed to every worker,
//! the server loop, the aggregator and the reporter. Each update is a
//! single atomic operation; readers may see counters from slightly
//! different instants.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Process-wide datagram counters
#[derive(Debug, Default)]
pub struct Metrics {
    /// Datagrams written successfully
    sent: AtomicU64,
    /// Datagrams read back (client) or read in (server)
    received: AtomicU64,
    /// Timeouts, receive errors, rejected keys and failed echoes
    drops: AtomicU64,
    /// Workers currently running
    active_clients: AtomicUsize,
}

impl Metrics {
    /// Create a zeroed counter set
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_drop(&self) {
        self.drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn drops(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }

    pub fn active_clients(&self) -> usize {
        self.active_clients.load(Ordering::Relaxed)
    }

    /// Register a running worker. The count drops again when the returned
    /// guard is dropped, however the worker exits.
    pub fn client_started(self: &Arc<Self>) -> ActiveClient {
        self.active_clients.fetch_add(1, Ordering::Relaxed);
        ActiveClient {
            metrics: Arc::clone(self),
        }
    }

    /// Point-in-time copy of all counters
    pub fn totals(&self) -> Totals {
        Totals {
            sent: self.sent(),
            received: self.received(),
            drops: self.drops(),
            active_clients: self.active_clients(),
        }
    }
}

/// Keeps `active_clients` incremented for as long as it lives
#[derive(Debug)]
pub struct ActiveClient {
    metrics: Arc<Metrics>,
}

impl Drop for ActiveClient {
    fn drop(&mut self) {
        self.metrics.active_clients.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Counter values read one at a time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Totals {
    pub sent: u64,
    pub received: u64,
    pub drops: u64,
    pub active_clients: usize,
}
