//! Client and runner configuration loaded from environment variables.
//!
//! Follows 12-factor style: all settings come from environment variables
//! (or a `.env` file via `dotenvy`). Only `DEVICE_URL` and the script path
//! are required; everything else falls back to the device defaults.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{ClientError, ConfigError};

/// Port the device controller serves its WebSocket API on.
pub const DEFAULT_WS_PORT: u16 = 9999;

/// Delay between two failed connection attempts.
pub const DEFAULT_CONNECT_RETRY_INTERVAL: Duration = Duration::from_secs(15);

/// Interval between two heartbeat messages.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Bound on waiting for the send gate.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// File name the uploaded script is stored under on the device.
pub const DEFAULT_SCRIPT_NAME: &str = "Ad-Hoc Script.gcode";

/// Directory on the device where uploaded scripts land.
pub const DEFAULT_REMOTE_GCODE_DIR: &str = "/usr/data/printer_data/gcodes";

/// Settings of a single [`crate::client::DeviceClient`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base address of the device (e.g. `http://192.168.1.50`).
    /// Only the host is used for the WebSocket endpoint.
    pub device_url: String,

    /// WebSocket port on the device.
    pub ws_port: u16,

    /// Fixed delay after a failed connection attempt.
    pub connect_retry_interval: Duration,

    /// Heartbeat period.
    pub heartbeat_interval: Duration,

    /// Maximum wait for the send gate.
    pub send_timeout: Duration,
}

impl ClientConfig {
    /// Creates a configuration for `device_url` with the device defaults.
    #[must_use]
    pub fn new(device_url: impl Into<String>) -> Self {
        Self {
            device_url: device_url.into(),
            ws_port: DEFAULT_WS_PORT,
            connect_retry_interval: DEFAULT_CONNECT_RETRY_INTERVAL,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }

    /// Overrides the WebSocket port.
    #[must_use]
    pub const fn with_ws_port(mut self, port: u16) -> Self {
        self.ws_port = port;
        self
    }

    /// Overrides the delay between connection attempts.
    #[must_use]
    pub const fn with_connect_retry_interval(mut self, interval: Duration) -> Self {
        self.connect_retry_interval = interval;
        self
    }

    /// Overrides the heartbeat period.
    #[must_use]
    pub const fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Overrides the send gate timeout.
    #[must_use]
    pub const fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    /// Returns the WebSocket endpoint `ws://<host>:<ws_port>`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::InvalidAddress`] if `device_url` has no host.
    pub fn ws_url(&self) -> Result<String, ClientError> {
        let host = device_host(&self.device_url).ok_or_else(|| {
            ClientError::InvalidAddress(self.device_url.clone())
        })?;
        Ok(format!("ws://{host}:{}", self.ws_port))
    }

    /// Checks that every interval is usable by the client's timers.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::InvalidConfig`] naming the first zero
    /// interval.
    pub fn validate(&self) -> Result<(), ClientError> {
        let intervals = [
            ("connect_retry_interval", self.connect_retry_interval),
            ("heartbeat_interval", self.heartbeat_interval),
            ("send_timeout", self.send_timeout),
        ];
        match intervals.into_iter().find(|(_, value)| value.is_zero()) {
            Some((name, _)) => Err(ClientError::InvalidConfig(name)),
            None => Ok(()),
        }
    }
}

/// Settings of the runner binary.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Device client settings.
    pub client: ClientConfig,

    /// Local script to upload and run.
    pub script_path: PathBuf,

    /// Name the script is stored under on the device.
    pub script_name: String,

    /// Device directory the upload endpoint writes into.
    pub remote_gcode_dir: String,

    /// Overall timeout of the upload request.
    pub upload_timeout: Duration,
}

impl RunnerConfig {
    /// Loads configuration from environment variables.
    ///
    /// Calls `dotenvy::dotenv().ok()` to optionally load a `.env` file.
    /// `script_arg` (the first command-line argument) takes precedence over
    /// `SCRIPT_PATH`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `DEVICE_URL` or the script path is missing,
    /// or if `DEVICE_URL` has no host.
    pub fn from_env(script_arg: Option<String>) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok(), script_arg)
    }

    /// Builds the configuration from an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// See [`RunnerConfig::from_env`].
    pub fn from_lookup<F>(lookup: F, script_arg: Option<String>) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let device_url = lookup("DEVICE_URL")
            .filter(|v| !v.trim().is_empty())
            .ok_or(ConfigError::Missing("DEVICE_URL"))?;
        if device_host(&device_url).is_none() {
            return Err(ConfigError::Invalid {
                key: "DEVICE_URL",
                reason: format!("no host in {device_url:?}"),
            });
        }

        let script_path = script_arg
            .or_else(|| lookup("SCRIPT_PATH"))
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .ok_or(ConfigError::Missing("SCRIPT_PATH"))?;

        let client = ClientConfig {
            device_url,
            ws_port: parse_var(&lookup, "DEVICE_WS_PORT", DEFAULT_WS_PORT),
            connect_retry_interval: parse_secs(
                &lookup,
                "CONNECT_RETRY_INTERVAL_SECS",
                DEFAULT_CONNECT_RETRY_INTERVAL,
            ),
            heartbeat_interval: parse_secs(
                &lookup,
                "HEARTBEAT_INTERVAL_SECS",
                DEFAULT_HEARTBEAT_INTERVAL,
            ),
            send_timeout: parse_secs(&lookup, "SEND_TIMEOUT_SECS", DEFAULT_SEND_TIMEOUT),
        };

        Ok(Self {
            client,
            script_path,
            script_name: lookup("SCRIPT_NAME").unwrap_or_else(|| DEFAULT_SCRIPT_NAME.to_string()),
            remote_gcode_dir: lookup("REMOTE_GCODE_DIR")
                .unwrap_or_else(|| DEFAULT_REMOTE_GCODE_DIR.to_string()),
            upload_timeout: parse_secs(&lookup, "UPLOAD_TIMEOUT_SECS", Duration::from_secs(60)),
        })
    }

    /// Absolute path of the uploaded script on the device.
    #[must_use]
    pub fn remote_script_path(&self) -> String {
        format!(
            "{}/{}",
            self.remote_gcode_dir.trim_end_matches('/'),
            self.script_name
        )
    }
}

/// Extracts the host of a device address. A bare host such as
/// `192.168.1.50` is accepted as if it were `http://192.168.1.50`.
pub(crate) fn device_host(device_url: &str) -> Option<String> {
    let candidate = if device_url.contains("://") {
        device_url.trim().to_string()
    } else {
        format!("http://{}", device_url.trim())
    };
    let url = reqwest::Url::parse(&candidate).ok()?;
    url.host_str()
        .filter(|host| !host.is_empty())
        .map(str::to_string)
}

/// Parses a variable as `T`, returning `default` on missing or invalid
/// values.
fn parse_var<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Parses a whole number of seconds. Zero is rejected in favour of the
/// default, since every interval here must be positive.
fn parse_secs<F>(lookup: &F, key: &str, default: Duration) -> Duration
where
    F: Fn(&str) -> Option<String>,
{
    match parse_var::<F, u64>(lookup, key, 0) {
        0 => default,
        secs => Duration::from_secs(secs),
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn ws_url_uses_host_and_fixed_port() {
        let config = ClientConfig::new("http://192.168.1.50/some/page");
        let Ok(url) = config.ws_url() else {
            panic!("expected a ws url");
        };
        assert_eq!(url, "ws://192.168.1.50:9999");
    }

    #[test]
    fn ws_url_ignores_http_port() {
        let config = ClientConfig::new("http://printer.local:8080");
        let Ok(url) = config.ws_url() else {
            panic!("expected a ws url");
        };
        assert_eq!(url, "ws://printer.local:9999");
    }

    #[test]
    fn ws_url_accepts_bare_host() {
        let config = ClientConfig::new("10.0.0.7").with_ws_port(1234);
        let Ok(url) = config.ws_url() else {
            panic!("expected a ws url");
        };
        assert_eq!(url, "ws://10.0.0.7:1234");
    }

    #[test]
    fn defaults_pass_validation() {
        assert!(ClientConfig::new("http://printer.local").validate().is_ok());
    }

    #[test]
    fn zero_intervals_are_rejected() {
        let base = ClientConfig::new("http://printer.local");
        let cases = [
            (
                base.clone().with_heartbeat_interval(Duration::ZERO),
                "heartbeat_interval",
            ),
            (
                base.clone().with_connect_retry_interval(Duration::ZERO),
                "connect_retry_interval",
            ),
            (base.with_send_timeout(Duration::ZERO), "send_timeout"),
        ];
        for (config, expected) in cases {
            assert!(matches!(
                config.validate(),
                Err(ClientError::InvalidConfig(name)) if name == expected
            ));
        }
    }

    #[test]
    fn ws_url_keeps_ipv6_brackets() {
        let config = ClientConfig::new("http://[::1]");
        let Ok(url) = config.ws_url() else {
            panic!("expected a ws url");
        };
        assert_eq!(url, "ws://[::1]:9999");
    }

    #[test]
    fn ws_url_rejects_hostless_address() {
        let config = ClientConfig::new("file:///tmp/printer");
        assert!(matches!(
            config.ws_url(),
            Err(ClientError::InvalidAddress(_))
        ));
    }

    #[test]
    fn defaults_match_device_protocol() {
        let config = ClientConfig::new("http://printer");
        assert_eq!(config.ws_port, 9999);
        assert_eq!(config.connect_retry_interval, Duration::from_secs(15));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(15));
        assert_eq!(config.send_timeout, Duration::from_secs(5));
    }

    #[test]
    fn runner_config_requires_device_url() {
        let result = RunnerConfig::from_lookup(lookup_from(&[]), Some("a.gcode".into()));
        assert!(matches!(result, Err(ConfigError::Missing("DEVICE_URL"))));
    }

    #[test]
    fn runner_config_requires_script() {
        let result =
            RunnerConfig::from_lookup(lookup_from(&[("DEVICE_URL", "http://printer")]), None);
        assert!(matches!(result, Err(ConfigError::Missing("SCRIPT_PATH"))));
    }

    #[test]
    fn runner_config_applies_defaults() {
        let result = RunnerConfig::from_lookup(
            lookup_from(&[("DEVICE_URL", "http://printer"), ("SCRIPT_PATH", "x.gcode")]),
            None,
        );
        let Ok(config) = result else {
            panic!("expected config");
        };
        assert_eq!(config.script_path, PathBuf::from("x.gcode"));
        assert_eq!(config.script_name, DEFAULT_SCRIPT_NAME);
        assert_eq!(
            config.remote_script_path(),
            "/usr/data/printer_data/gcodes/Ad-Hoc Script.gcode"
        );
        assert_eq!(config.client.ws_port, DEFAULT_WS_PORT);
    }

    #[test]
    fn runner_config_reads_overrides() {
        let result = RunnerConfig::from_lookup(
            lookup_from(&[
                ("DEVICE_URL", "http://printer"),
                ("SCRIPT_PATH", "env.gcode"),
                ("DEVICE_WS_PORT", "7000"),
                ("CONNECT_RETRY_INTERVAL_SECS", "3"),
                ("SEND_TIMEOUT_SECS", "not-a-number"),
                ("HEARTBEAT_INTERVAL_SECS", "0"),
                ("REMOTE_GCODE_DIR", "/data/"),
                ("SCRIPT_NAME", "probe.gcode"),
            ]),
            Some("cli.gcode".into()),
        );
        let Ok(config) = result else {
            panic!("expected config");
        };
        assert_eq!(config.script_path, PathBuf::from("cli.gcode"));
        assert_eq!(config.client.ws_port, 7000);
        assert_eq!(config.client.connect_retry_interval, Duration::from_secs(3));
        assert_eq!(config.client.send_timeout, DEFAULT_SEND_TIMEOUT);
        assert_eq!(config.client.heartbeat_interval, DEFAULT_HEARTBEAT_INTERVAL);
        assert_eq!(config.remote_script_path(), "/data/probe.gcode");
    }

    #[test]
    fn runner_config_rejects_hostless_url() {
        let result = RunnerConfig::from_lookup(
            lookup_from(&[("DEVICE_URL", "file:///x")]),
            Some("a.gcode".into()),
        );
        assert!(matches!(
            result,
            Err(ConfigError::Invalid {
                key: "DEVICE_URL",
                ..
            })
        ));
    }
}
