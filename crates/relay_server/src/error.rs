//! Error types for the relay.
//!
//! Upstream failures are contained inside the pool and turned into state
//! transitions. These errors surface to callers of the pool and session APIs
//! and to the launcher.

use std::time::Duration;

use agar_protocol::CodecError;
use thiserror::Error;

use crate::transport::TransportError;

/// Errors that can occur while relaying.
#[derive(Error, Debug)]
pub enum RelayError {
    /// An inbound frame was truncated; the connection carrying it is torn down.
    #[error("Framing error: {0}")]
    Framing(CodecError),

    /// The transport did not open within the handshake timeout.
    #[error("Handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    /// The transport errored or closed before the handshake completed.
    #[error("Handshake failed: {0}")]
    HandshakeFailure(String),

    /// No warm, idle upstream connection was available for a session.
    #[error("No upstream connection available: {0}")]
    PoolExhausted(String),

    /// The discovery lookup failed or returned an unusable answer.
    #[error("Discovery error: {0}")]
    Discovery(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Outbound encoding failed (for example a non-ASCII join code).
    #[error("Codec error: {0}")]
    Codec(CodecError),

    /// Listener setup or accept failures.
    #[error("Network error: {0}")]
    Network(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<CodecError> for RelayError {
    fn from(error: CodecError) -> Self {
        if error.is_framing() {
            RelayError::Framing(error)
        } else {
            RelayError::Codec(error)
        }
    }
}

impl RelayError {
    /// True for failures that the pool answers with a delayed retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RelayError::HandshakeTimeout(_)
                | RelayError::HandshakeFailure(_)
                | RelayError::Discovery(_)
                | RelayError::Transport(_)
        )
    }
}
