//! Device protocol: outbound payloads and inbound report interpretation.

pub mod ack;
pub mod messages;
pub mod report;

pub use ack::acknowledge_faults;
pub use messages::{MessageKind, OutboundMessage};
pub use report::{DeviceFault, DeviceReport, log_report};
