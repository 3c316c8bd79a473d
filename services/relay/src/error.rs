//! Error types for the relay.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

use crate::proxy::Side;

/// Relay errors with standardized reason codes.
///
/// Config, bind and accept errors are process-level and end the run.
/// Dial and transport errors belong to a single connection pair.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Could not read the configuration file.
    #[error("config_read_failed: {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Configuration is malformed or fails validation.
    #[error("config_invalid: {0}")]
    Config(String),

    /// Listen port outside the TCP port range.
    #[error("bind_failed: port {port} is out of range (0-65535)")]
    PortOutOfRange { port: u32 },

    /// Socket creation, bind or listen failed.
    #[error("bind_failed: {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Listener-level accept failure after startup.
    #[error("accept_failed: port {port}: {source}")]
    Accept {
        port: u16,
        #[source]
        source: io::Error,
    },

    /// Outbound connect to the selected backend failed.
    #[error("dial_failed: {backend}: {source}")]
    Dial {
        backend: String,
        #[source]
        source: io::Error,
    },

    /// Read or write failure on one leg of an established pair.
    #[error("transport_failed: {side} leg: {source}")]
    Transport {
        side: Side,
        #[source]
        source: io::Error,
    },

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl RelayError {
    /// Get the standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            RelayError::ConfigRead { .. } => "config_read_failed",
            RelayError::Config(_) => "config_invalid",
            RelayError::PortOutOfRange { .. } => "port_out_of_range",
            RelayError::Bind { .. } => "bind_failed",
            RelayError::Accept { .. } => "accept_failed",
            RelayError::Dial { .. } => "dial_failed",
            RelayError::Transport { .. } => "transport_failed",
            RelayError::Io(_) => "io_error",
        }
    }

    /// Whether this error must end the process rather than a single connection.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            RelayError::Dial { .. } | RelayError::Transport { .. }
        )
    }
}
