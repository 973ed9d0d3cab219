//! gcode-runner entry point.
//!
//! Uploads a G-code script to the device, opens the control link, starts
//! the script and reports progress until interrupted with Ctrl-C.

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use gcode_runner::client::{ConnectionState, DeviceClient};
use gcode_runner::config::RunnerConfig;
use gcode_runner::error::ClientError;
use gcode_runner::protocol::{OutboundMessage, acknowledge_faults, log_report};
use gcode_runner::upload::Uploader;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    // Load configuration
    let config = RunnerConfig::from_env(std::env::args().nth(1))?;
    tracing::info!(
        device = %config.client.device_url,
        script = %config.script_path.display(),
        "starting gcode-runner"
    );

    // Upload the script
    let script = tokio::fs::read_to_string(&config.script_path)
        .await
        .with_context(|| format!("reading {}", config.script_path.display()))?;
    let uploader = Uploader::new(&config.client.device_url, config.upload_timeout)?;
    uploader
        .upload(&config.script_name, script)
        .await
        .context("uploading script")?;

    // Open the control link
    let client = DeviceClient::new(config.client.clone())?;
    acknowledge_faults(&client);
    client.on_message(|text| {
        log_report(text);
    });
    client.on_state_change(|state| match state {
        ConnectionState::Connected => tracing::info!("device link up"),
        ConnectionState::Connecting => tracing::info!("connecting to device"),
        ConnectionState::Disconnected => tracing::warn!("device link down"),
    });
    client.connect().await?;

    // Start the script
    let remote_path = config.remote_script_path();
    start_script(&client, &remote_path)
        .await
        .context("starting script")?;
    tracing::info!(path = %remote_path, "script running");

    tokio::signal::ctrl_c().await?;
    client.shutdown().await;
    Ok(())
}

/// Sends the print command, retrying once on the next connection if the
/// first attempt hit a transient failure.
async fn start_script(client: &DeviceClient, remote_path: &str) -> Result<(), ClientError> {
    let err = match client.send(OutboundMessage::print_file(remote_path)).await {
        Ok(()) => return Ok(()),
        Err(err) if err.is_transient() => err,
        Err(err) => return Err(err),
    };
    tracing::warn!(error = %err, "print command failed; retrying once reconnected");
    let mut state = client.watch_state();
    if state.wait_for(|state| state.is_connected()).await.is_err() {
        return Err(ClientError::NotConnected);
    }
    client.send(OutboundMessage::print_file(remote_path)).await
}

/// `LOG_FORMAT=json` switches to JSON lines; the filter comes from
/// `RUST_LOG` and defaults to `info`.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|format| format.eq_ignore_ascii_case("json"));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
