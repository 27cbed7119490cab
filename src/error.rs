//! Error types for the presence bridge

use std::io;

/// Frame encoding/decoding errors
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Payload does not fit the signed 32-bit length field
    #[error("Payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    /// Header advertised a negative payload length
    #[error("Negative payload length in frame header: {0}")]
    NegativeLength(i32),
}

impl From<CodecError> for io::Error {
    fn from(err: CodecError) -> Self {
        io::Error::new(io::ErrorKind::InvalidData, err)
    }
}

/// Failures of `TransportClient::connect`
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    /// No candidate endpoint accepted a read-write open
    #[error("No IPC endpoint accepted a connection")]
    NoPeerAvailable,

    /// The endpoint opened but the handshake frame could not be written
    #[error("Handshake failed: {0}")]
    HandshakeFailed(#[source] io::Error),
}

/// Failures of `TransportClient::send_message`
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// No channel is open
    #[error("Not connected")]
    NotConnected,

    /// The write hit a disconnect-class error; the channel was closed
    #[error("Peer disconnected: {0}")]
    Disconnected(#[source] io::Error),

    /// The write failed but the channel is still considered usable
    #[error("Transient send error: {0}")]
    Transient(#[source] io::Error),

    /// The command envelope could not be serialized
    #[error("Failed to encode command: {0}")]
    Encode(#[from] serde_json::Error),
}

impl SendError {
    /// True when the caller must reconnect before sending again
    pub fn requires_reconnect(&self) -> bool {
        matches!(self, SendError::NotConnected | SendError::Disconnected(_))
    }
}

/// Media session source errors. These are logged, never propagated past the monitor.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The session key is not (or no longer) known to the source
    #[error("Unknown media session: {0}")]
    UnknownSession(String),

    /// The session exists but has not reported media properties yet
    #[error("Media session {0} has no media properties")]
    NoMediaProperties(String),

    /// The source itself is not running
    #[error("Media session source unavailable: {0}")]
    SourceUnavailable(String),
}
