//! Error types for the device client, the script upload and configuration.
//!
//! [`ClientError`] is the central error type of the connection manager.
//! Only the variants a caller can act on are ever returned from public
//! operations; transport failures inside the reconnect and receive loops
//! are logged and retried instead.

use std::time::Duration;

use tokio_tungstenite::tungstenite;

/// Errors surfaced by [`crate::client::DeviceClient`].
///
/// | Variant          | Returned by                         |
/// |------------------|-------------------------------------|
/// | `NotConnected`   | `send` with no live transport       |
/// | `SendTimeout`    | `send` when the gate stays busy     |
/// | `ShutDown`       | `connect` interrupted by shutdown   |
/// | `InvalidAddress` | construction                        |
/// | `InvalidConfig`  | construction                        |
/// | `Transport`      | `send` write failures, connectors   |
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// There is no live transport, or the client has been shut down.
    #[error("not connected")]
    NotConnected,

    /// The send gate could not be acquired within the configured bound.
    #[error("timed out after {0:?} waiting for the send gate")]
    SendTimeout(Duration),

    /// Shutdown was requested while a connection was being established.
    #[error("client has been shut down")]
    ShutDown,

    /// The configured device address has no usable host.
    #[error("invalid device address: {0}")]
    InvalidAddress(String),

    /// A client setting that must be non-zero is zero.
    #[error("{0} must be greater than zero")]
    InvalidConfig(&'static str),

    /// WebSocket protocol or I/O failure.
    #[error("websocket error: {0}")]
    Transport(Box<tungstenite::Error>),
}

impl ClientError {
    /// Returns `true` for failures that a later retry may clear.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::SendTimeout(_) | Self::Transport(_))
    }
}

impl From<tungstenite::Error> for ClientError {
    fn from(err: tungstenite::Error) -> Self {
        Self::Transport(Box::new(err))
    }
}

/// Errors from the one-shot HTTP script upload.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    /// The device address could not be turned into an upload URL.
    #[error("invalid device address: {0}")]
    InvalidAddress(String),

    /// The request could not be sent or the response not read.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// The device answered with a non-success status.
    #[error("upload rejected with status {0}")]
    Status(reqwest::StatusCode),
}

/// Errors raised while loading [`crate::config::RunnerConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required variable is not set.
    #[error("missing required setting {0}")]
    Missing(&'static str),

    /// A variable is set but cannot be used.
    #[error("invalid value for {key}: {reason}")]
    Invalid {
        /// Variable name.
        key: &'static str,
        /// Why the value was rejected.
        reason: String,
    },
}
