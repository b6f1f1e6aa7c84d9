// error.rs - Error types for the EtherNet/IP CIP stack

use std::time::Duration;
use thiserror::Error;

/// Errors produced by the EtherNet/IP stack.
///
/// Frame/protocol errors are fatal to the session that produced them; service
/// and routing errors are carried per-operation and never tear down a session.
#[derive(Debug, Error)]
pub enum EnipError {
    /// Underlying socket failure; fatal to the current session
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed or unexpected protocol data
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Truncated or unparseable encapsulation/CPF/EPATH framing
    #[error("Frame error: {0}")]
    Frame(String),

    /// A valid request the device rejected; carries the CIP general status
    /// byte and any extended status words
    #[error("Service error: status 0x{status:02X} {extended:04X?}")]
    Service { status: u8, extended: Vec<u16> },

    /// No matching route for a required route path, or a routed request
    /// failed downstream
    #[error("Routing error: {0}")]
    Routing(String),

    /// A blocking operation did not complete in time
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Configuration document could not be parsed; fatal at startup
    #[error("Configuration error: {0}")]
    Config(String),
}

impl EnipError {
    /// True for errors that end the session (socket loss, framing loss),
    /// false for per-operation failures.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EnipError::Io(_) | EnipError::Frame(_) | EnipError::Protocol(_) | EnipError::Timeout(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, EnipError>;
