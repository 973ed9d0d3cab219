//! Resilient WebSocket client for the device controller.
//!
//! [`DeviceClient`] is the connection manager; the other modules are its
//! building blocks and are public so they can be reused and tested on their
//! own.

pub mod connector;
pub mod gate;
pub mod manager;
pub mod state;
pub mod subscribers;

pub use connector::{Connector, WsConnector, WsStream};
pub use gate::{GateError, SendGate};
pub use manager::{ClientSender, DeviceClient};
pub use state::ConnectionState;
pub use subscribers::{Subscribers, SubscriptionId};
