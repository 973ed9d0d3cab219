//! Connection state as seen by observers.

use std::fmt;

/// Lifecycle state of the device connection.
///
/// The client starts `Disconnected`, stays `Connecting` for the whole retry
/// loop and flips to `Connected` once the transport is installed. After
/// shutdown it is `Disconnected` for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// No transport, no attempt in flight.
    #[default]
    Disconnected,
    /// Establishing a transport (including the delay between attempts).
    Connecting,
    /// A transport is installed and visible to senders.
    Connected,
}

impl ConnectionState {
    /// Returns `true` only for [`ConnectionState::Connected`].
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_disconnected() {
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
    }

    #[test]
    fn only_connected_counts_as_connected() {
        assert!(ConnectionState::Connected.is_connected());
        assert!(!ConnectionState::Connecting.is_connected());
        assert!(!ConnectionState::Disconnected.is_connected());
    }

    #[test]
    fn display_is_lowercase() {
        assert_eq!(ConnectionState::Connecting.to_string(), "connecting");
    }
}
