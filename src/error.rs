//! Process-level failures and their exit codes.
//!
//! Per-connection socket faults never show up here: they are contained in
//! the owning connection. Only failures that stop the whole process do.

use crate::config::ConfigError;
use std::io;
use std::net::SocketAddr;

#[derive(Debug)]
pub enum RelayError {
    /// Configuration could not be loaded or validated.
    Config(ConfigError),
    /// The listening socket could not be created.
    Bind(SocketAddr, io::Error),
    /// Other startup I/O (poller creation, registration).
    Io(io::Error),
    /// The readiness wait itself failed.
    Poll(io::Error),
    /// The listening socket entered an error state; no more clients can be
    /// accepted.
    ListenerFailed(io::Error),
}

impl RelayError {
    /// Process exit code for this failure.
    pub fn exit_code(&self) -> u8 {
        match self {
            RelayError::Config(_) | RelayError::Bind(..) | RelayError::Io(_) => 1,
            RelayError::ListenerFailed(_) => 2,
            RelayError::Poll(_) => 3,
        }
    }
}

impl std::fmt::Display for RelayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelayError::Config(e) => write!(f, "{e}"),
            RelayError::Bind(addr, e) => write!(f, "Failed to listen on {addr}: {e}"),
            RelayError::Io(e) => write!(f, "I/O error: {e}"),
            RelayError::Poll(e) => write!(f, "Readiness wait failed: {e}"),
            RelayError::ListenerFailed(e) => write!(f, "Listener socket failed: {e}"),
        }
    }
}

impl std::error::Error for RelayError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RelayError::Config(e) => Some(e),
            RelayError::Bind(_, e)
            | RelayError::Io(e)
            | RelayError::Poll(e)
            | RelayError::ListenerFailed(e) => Some(e),
        }
    }
}

impl From<ConfigError> for RelayError {
    fn from(e: ConfigError) -> Self {
        RelayError::Config(e)
    }
}

impl From<io::Error> for RelayError {
    fn from(e: io::Error) -> Self {
        RelayError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listener_failure_has_distinct_exit_code() {
        let listener = RelayError::ListenerFailed(io::ErrorKind::Other.into());
        let config = RelayError::Config(ConfigError::Invalid("bad".into()));
        assert_eq!(listener.exit_code(), 2);
        assert_eq!(config.exit_code(), 1);
        assert_ne!(listener.exit_code(), config.exit_code());
    }
}
