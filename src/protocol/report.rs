//! Interpretation of inbound device messages.
//!
//! The device pushes JSON objects carrying whichever status fields
//! changed. Only the fields the runner reacts to are modelled; everything
//! else is ignored. Field types vary between firmware versions, so the
//! error block is read leniently: numbers may arrive as strings, and a
//! malformed block never hides the rest of the report.

use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// Error block of a device report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceFault {
    /// Device error code; `0` or absent means no error.
    pub errcode: Option<i64>,
    /// Error key; `0` or absent means no error.
    pub key: Option<i64>,
}

impl DeviceFault {
    /// Returns `true` if either the code or the key is non-zero.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.errcode.unwrap_or(0) != 0 || self.key.unwrap_or(0) != 0
    }
}

/// Fields of a device status message the runner cares about.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DeviceReport {
    /// Print progress in percent, as sent by the device.
    #[serde(rename = "printProgress", default)]
    pub print_progress: Option<serde_json::Value>,
    /// Error block, when present and shaped like one.
    #[serde(default, deserialize_with = "lenient_fault")]
    pub err: Option<DeviceFault>,
}

impl DeviceReport {
    /// Parses an inbound message.
    ///
    /// Returns `None` for text that is not a JSON object (the device also
    /// sends plain-text notices) or that does not match the expected shape.
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        if !text.trim_start().starts_with('{') {
            return None;
        }
        match serde_json::from_str(text) {
            Ok(report) => Some(report),
            Err(err) => {
                tracing::debug!(error = %err, "ignoring unparseable device report");
                None
            }
        }
    }

    /// Returns the fault if the report carries an active one.
    #[must_use]
    pub fn active_fault(&self) -> Option<DeviceFault> {
        self.err.filter(DeviceFault::is_active)
    }
}

/// Logs progress and active faults carried by an inbound message.
///
/// Returns the parsed report, or `None` when `text` is not a report.
pub fn log_report(text: &str) -> Option<DeviceReport> {
    let report = DeviceReport::parse(text)?;
    if let Some(progress) = &report.print_progress {
        tracing::info!(%progress, "print progress (%)");
    }
    if let Some(fault) = report.active_fault() {
        tracing::error!(
            errcode = fault.errcode.unwrap_or(0),
            key = fault.key.unwrap_or(0),
            "device error"
        );
    }
    Some(report)
}

fn lenient_fault<'de, D>(deserializer: D) -> Result<Option<DeviceFault>, D::Error>
where
    D: Deserializer<'de>,
{
    let Value::Object(block) = Value::deserialize(deserializer)? else {
        return Ok(None);
    };
    Ok(Some(DeviceFault {
        errcode: block.get("errcode").and_then(lenient_int),
        key: block.get("key").and_then(lenient_int),
    }))
}

fn lenient_int(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number
            .as_i64()
            .or_else(|| number.as_f64().map(|float| float as i64)),
        Value::String(text) => text.trim().parse().ok(),
        Value::Bool(flag) => Some(i64::from(*flag)),
        _ => None,
    }
}
