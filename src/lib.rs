//! # gcode-runner
//!
//! Resilient control link to a networked 3D printer's device controller,
//! plus the small amount of glue needed to upload and start a G-code
//! script.
//!
//! The heart of the crate is [`client::DeviceClient`]: a WebSocket client
//! that keeps one connection to `ws://<host>:9999` alive for as long as it
//! runs. It reconnects forever at a fixed interval, sends a heartbeat every
//! few seconds, serializes outbound writes behind a timed gate and hands
//! every inbound message to registered subscribers.
//!
//! ## Architecture
//!
//! ```text
//! Runner binary (main.rs)
//!     │
//!     ├── Uploader (upload.rs)        one-shot HTTP multipart POST
//!     ├── acknowledge_faults (protocol/)
//!     │
//!     └── DeviceClient (client/)
//!             ├── connect loop     ── Connector (tokio-tungstenite)
//!             ├── receive loop     ── Subscribers
//!             ├── heartbeat timer
//!             └── SendGate ── current transport
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod upload;
