//! Run-wide stop signal.
//!
//! Whichever component first sees a stop condition calls
//! [`Shutdown::trigger`]. The first reason sticks, every later trigger is
//! ignored, and the shared cancellation token wakes all workers and
//! background loops.

use crate::error::{PhantomError, EXIT_INTERRUPTED, EXIT_OK};
use std::sync::{Arc, OnceLock};
use tokio_util::sync::CancellationToken;

/// Why a run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// Every worker used up its packet budget
    Completed,
    /// Ramp mode saw its first loss
    LossDetected,
    /// Operator stop (ctrl-c / SIGTERM)
    Interrupted,
    /// A fatal socket error
    Failed { code: u8, message: String },
}

impl ExitReason {
    pub fn failed(err: &PhantomError) -> Self {
        ExitReason::Failed {
            code: err.exit_code(),
            message: err.to_string(),
        }
    }

    pub fn exit_code(&self) -> u8 {
        match self {
            ExitReason::Completed | ExitReason::LossDetected => EXIT_OK,
            ExitReason::Interrupted => EXIT_INTERRUPTED,
            ExitReason::Failed { code, .. } => *code,
        }
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitReason::Completed => write!(f, "completed"),
            ExitReason::LossDetected => write!(f, "loss detected"),
            ExitReason::Interrupted => write!(f, "interrupted"),
            ExitReason::Failed { message, .. } => write!(f, "failed: {message}"),
        }
    }
}

/// The first stop request of a run
#[derive(Debug)]
pub struct Trigger {
    pub reason: ExitReason,
    /// `active_clients` when the trigger fired
    pub active_clients: usize,
}

/// Cloneable stop handle shared by every task of a run
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    token: CancellationToken,
    trigger: Arc<OnceLock<Trigger>>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `reason` if nothing has stopped the run yet, then cancel.
    ///
    /// Returns true only for the call whose reason was recorded.
    pub fn trigger(&self, reason: ExitReason, active_clients: usize) -> bool {
        let mut won = false;
        self.trigger.get_or_init(|| {
            won = true;
            Trigger {
                reason,
                active_clients,
            }
        });
        self.token.cancel();
        won
    }

    /// Cancel without recording a reason.
    ///
    /// Used once the run has finished on its own to stop background loops.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn triggered(&self) -> Option<&Trigger> {
        self.trigger.get()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the run has been asked to stop
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}
