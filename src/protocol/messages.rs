//! Outbound messages and the fixed payloads of the device protocol.
//!
//! The device speaks JSON over plain text frames. Commands use a
//! `{"method": ..., "params": {...}}` envelope; the heartbeat has its own
//! shape. Payloads are built with `serde_json::json!`, whose maps are
//! key-sorted, so the text of every fixed message is stable.

use chrono::{DateTime, Utc};
use serde_json::json;

/// Timestamp layout of the heartbeat `msg` field.
pub const HEARTBEAT_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

/// What an outbound message is for. Used for logging only; the wire format
/// is always a single text frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Generic JSON command.
    Command,
    /// Keep-alive.
    Heartbeat,
}

/// An opaque text payload tagged with its [`MessageKind`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    kind: MessageKind,
    payload: String,
}

impl OutboundMessage {
    /// Wraps arbitrary text as a command.
    #[must_use]
    pub fn command(payload: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Command,
            payload: payload.into(),
        }
    }

    /// Handshake sent once after every successful connect: asks the device
    /// for its probed bed matrix, which also starts its status stream.
    #[must_use]
    pub fn handshake() -> Self {
        Self::command(json!({ "method": "get", "params": { "reqProbedMatrix": 1 } }).to_string())
    }

    /// Heartbeat stamped with `now`.
    #[must_use]
    pub fn heartbeat_at(now: DateTime<Utc>) -> Self {
        let stamp = now.format(HEARTBEAT_TIMESTAMP_FORMAT).to_string();
        Self {
            kind: MessageKind::Heartbeat,
            payload: json!({ "ModeCode": "heart_beat", "msg": stamp }).to_string(),
        }
    }

    /// Heartbeat stamped with the current UTC time.
    #[must_use]
    pub fn heartbeat() -> Self {
        Self::heartbeat_at(Utc::now())
    }

    /// Clears the device's pending error.
    #[must_use]
    pub fn clean_error() -> Self {
        Self::command(json!({ "method": "set", "params": { "cleanErr": 1 } }).to_string())
    }

    /// Starts printing the G-code file at `remote_path` on the device.
    #[must_use]
    pub fn print_file(remote_path: &str) -> Self {
        let target = format!("printprt:{remote_path}");
        Self::command(json!({ "method": "set", "params": { "opGcodeFile": target } }).to_string())
    }

    /// Message kind.
    #[must_use]
    pub const fn kind(&self) -> MessageKind {
        self.kind
    }

    /// Text written to the wire.
    #[must_use]
    pub fn payload(&self) -> &str {
        &self.payload
    }

    /// Consumes the message, returning its text.
    #[must_use]
    pub fn into_payload(self) -> String {
        self.payload
    }
}
