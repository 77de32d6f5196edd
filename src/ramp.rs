//! Client population control.
//!
//! Fixed mode starts a set number of clients with a packet budget each and
//! waits for them. Ramp-up mode keeps adding unbounded clients at a fixed
//! interval while a watcher polls the drop counter; the first observed loss
//! stops the run, and the number of active clients at that moment is the
//! capacity estimate.

use crate::client::{ClientSpec, ClientWorker};
use crate::config::{LoadSettings, Timing, RAMP_MAX_CLIENTS};
use crate::metrics::Metrics;
use crate::shutdown::{ExitReason, Shutdown};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Ramp-up bookkeeping
#[derive(Debug)]
pub struct RampState {
    pub enabled: bool,
    /// Pause between spawns
    pub interval: Duration,
    loss_detected: AtomicBool,
}

impl RampState {
    fn new(enabled: bool, interval: Duration) -> Self {
        RampState {
            enabled,
            interval,
            loss_detected: AtomicBool::new(false),
        }
    }

    /// Set the loss flag. True only for the first caller.
    pub fn mark_loss(&self) -> bool {
        !self.loss_detected.swap(true, Ordering::AcqRel)
    }

    pub fn loss_detected(&self) -> bool {
        self.loss_detected.load(Ordering::Acquire)
    }
}

/// Spawns and supervises client workers
pub struct RampController {
    settings: LoadSettings,
    timing: Timing,
    metrics: Arc<Metrics>,
    shutdown: Shutdown,
    state: Arc<RampState>,
}

impl RampController {
    pub fn new(
        settings: LoadSettings,
        timing: Timing,
        metrics: Arc<Metrics>,
        shutdown: Shutdown,
    ) -> Self {
        let state = match settings.ramp_interval {
            Some(interval) => RampState::new(true, interval),
            None => RampState::new(false, timing.spawn_pause),
        };

        RampController {
            settings,
            timing,
            metrics,
            shutdown,
            state: Arc::new(state),
        }
    }

    /// Get a handle on the ramp state for testing
    #[cfg(test)]
    pub fn state(&self) -> Arc<RampState> {
        Arc::clone(&self.state)
    }

    /// Run clients until they finish or the run is stopped.
    ///
    /// Returns once every worker and the loss watcher have exited.
    pub async fn run(self) {
        let (clients, packets) = if self.state.enabled {
            (RAMP_MAX_CLIENTS, None)
        } else {
            (self.settings.clients, self.settings.packets)
        };

        info!(
            clients,
            packets_per_client = ?packets,
            packet_size = self.settings.packet_size,
            server = %self.settings.target,
            ramp = self.state.enabled,
            spawn_interval_ms = self.state.interval.as_millis() as u64,
            "Starting clients"
        );

        let watcher = self.state.enabled.then(|| {
            tokio::spawn(watch_for_loss(
                Arc::clone(&self.metrics),
                self.shutdown.clone(),
                Arc::clone(&self.state),
                self.timing.loss_poll,
                self.settings.loss_threshold,
            ))
        });

        let spec = ClientSpec {
            target: self.settings.target,
            packets,
            packet_size: self.settings.packet_size,
            key: self.settings.key,
        };

        let mut workers = JoinSet::new();
        for id in 0..clients {
            if self.shutdown.is_cancelled() {
                break;
            }

            let worker = ClientWorker::new(
                id,
                spec.clone(),
                &self.timing,
                Arc::clone(&self.metrics),
                self.shutdown.clone(),
            );
            workers.spawn(worker.run(self.metrics.client_started()));

            if id + 1 < clients {
                tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.state.interval) => {}
                }
            }
        }

        while let Some(result) = workers.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Client task failed");
            }
        }

        // Everyone is done; release the watcher and the aggregator.
        self.shutdown.cancel();
        if let Some(watcher) = watcher {
            if let Err(e) = watcher.await {
                error!(error = %e, "Loss watcher failed");
            }
        }

        if self.state.loss_detected() {
            info!(drops = self.metrics.drops(), "Ramp clients drained after loss");
        }
    }
}

/// Poll the drop counter and stop the run at the first loss
async fn watch_for_loss(
    metrics: Arc<Metrics>,
    shutdown: Shutdown,
    state: Arc<RampState>,
    poll: Duration,
    threshold: u64,
) {
    let mut ticker = tokio::time::interval(poll);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let drops = metrics.drops();
        if drops >= threshold {
            if state.mark_loss() {
                let active_clients = metrics.active_clients();
                warn!(drops, active_clients, "Packet loss detected, stopping ramp");
                shutdown.trigger(ExitReason::LossDetected, active_clients);
            }
            return;
        }
    }
}
