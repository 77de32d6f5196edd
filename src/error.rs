//! Fatal errors and their process exit codes.

use crate::config::ConfigError;
use std::net::SocketAddr;

/// Exit code for a clean finish, including a ramp that found its loss point.
pub const EXIT_OK: u8 = 0;

/// Exit code when the operator interrupted the run.
pub const EXIT_INTERRUPTED: u8 = 130;

/// Errors that end a component for good
#[derive(Debug)]
pub enum PhantomError {
    Config(ConfigError),
    Bind(SocketAddr, std::io::Error),
    Connect(SocketAddr, std::io::Error),
    Receive(std::io::Error),
    Io(std::io::Error),
}

impl PhantomError {
    /// Process exit status for this failure
    pub fn exit_code(&self) -> u8 {
        match self {
            PhantomError::Config(_) => 64,
            PhantomError::Bind(..) => 1,
            PhantomError::Receive(_) => 2,
            PhantomError::Connect(..) | PhantomError::Io(_) => 3,
        }
    }
}

impl std::fmt::Display for PhantomError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PhantomError::Config(e) => write!(f, "{e}"),
            PhantomError::Bind(addr, e) => write!(f, "Failed to bind {addr}: {e}"),
            PhantomError::Connect(addr, e) => write!(f, "Failed to open socket to {addr}: {e}"),
            PhantomError::Receive(e) => write!(f, "Receive failed: {e}"),
            PhantomError::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for PhantomError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PhantomError::Config(e) => Some(e),
            PhantomError::Bind(_, e)
            | PhantomError::Connect(_, e)
            | PhantomError::Receive(e)
            | PhantomError::Io(e) => Some(e),
        }
    }
}

impl From<ConfigError> for PhantomError {
    fn from(e: ConfigError) -> Self {
        PhantomError::Config(e)
    }
}

impl From<std::io::Error> for PhantomError {
    fn from(e: std::io::Error) -> Self {
        PhantomError::Io(e)
    }
}
