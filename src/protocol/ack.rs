//! Automatic acknowledgement of device errors.

use super::messages::OutboundMessage;
use super::report::DeviceReport;
use crate::client::{DeviceClient, SubscriptionId};

/// Registers a subscriber that answers every report with an active fault
/// by sending the `cleanErr` command back to the device.
///
/// The reply is sent from a spawned task so the receive loop is never
/// blocked on the send gate. Send failures are logged.
pub fn acknowledge_faults(client: &DeviceClient) -> SubscriptionId {
    let sender = client.sender();
    client.on_message(move |text| {
        let Some(fault) = DeviceReport::parse(text).and_then(|report| report.active_fault())
        else {
            return;
        };
        tracing::warn!(
            errcode = ?fault.errcode,
            key = ?fault.key,
            "device reported an error; acknowledging"
        );
        let sender = sender.clone();
        tokio::spawn(async move {
            if let Err(err) = sender.send(OutboundMessage::clean_error()).await {
                tracing::warn!(error = %err, "failed to acknowledge device error");
            }
        });
    })
}
