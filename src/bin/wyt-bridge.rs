//! `wyt-bridge`: local HTTP API over one Pioneer WYT mini-split.
//!
//! Configured through the environment:
//!   WYT_DEVICE_ID, WYT_LOCAL_KEY, WYT_DEVICE_IP   (required)
//!   WYT_PROTOCOL_VERSION   "3.1" | "3.3" | "3.4"  (default 3.3)
//!   WYT_POLL_INTERVAL      0 | 30 | 60 | 120      (default 30)
//!   BRIDGE_HOST            (default 0.0.0.0)
//!   BRIDGE_PORT            (default 8000)
//!   BRIDGE_TOKEN           bearer token            (default changeme)

use log::{error, info};
use pioneer_wyt::bridge::{self, BridgeState};
use pioneer_wyt::{DeviceBuilder, Thermostat, Version};
use std::process::ExitCode;
use std::str::FromStr;

fn required(name: &str) -> Option<String> {
    match std::env::var(name) {
        Ok(v) if !v.is_empty() => Some(v),
        _ => {
            error!("Missing required environment variable {name}");
            None
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    let (Some(device_id), Some(local_key), Some(device_ip)) = (
        required("WYT_DEVICE_ID"),
        required("WYT_LOCAL_KEY"),
        required("WYT_DEVICE_IP"),
    ) else {
        error!("Set WYT_DEVICE_ID, WYT_LOCAL_KEY and WYT_DEVICE_IP (see README)");
        return ExitCode::FAILURE;
    };

    let version_raw =
        std::env::var("WYT_PROTOCOL_VERSION").unwrap_or_else(|_| "3.3".to_string());
    let Ok(version) = Version::from_str(&version_raw) else {
        error!("Unsupported WYT_PROTOCOL_VERSION {version_raw:?} (use 3.1, 3.3 or 3.4)");
        return ExitCode::FAILURE;
    };
    let poll_interval: u16 = std::env::var("WYT_POLL_INTERVAL")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(30);

    let host = std::env::var("BRIDGE_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port: u16 = std::env::var("BRIDGE_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let token = std::env::var("BRIDGE_TOKEN").unwrap_or_else(|_| "changeme".to_string());

    let device = match DeviceBuilder::new(&device_id, &local_key)
        .ip(&device_ip)
        .protocol(version.code())
        .poll_interval(poll_interval)
        .build()
    {
        Ok(d) => d,
        Err(e) => {
            error!("Device configuration rejected: {e}");
            return ExitCode::FAILURE;
        }
    };
    let thermostat = Thermostat::new(device);

    let state = BridgeState {
        thermostat,
        device_id: device_id.clone(),
        device_ip: device_ip.clone(),
        token,
    };
    let app = bridge::router(state);

    let listener = match tokio::net::TcpListener::bind((host.as_str(), port)).await {
        Ok(l) => l,
        Err(e) => {
            error!("Cannot bind {host}:{port}: {e}");
            return ExitCode::FAILURE;
        }
    };
    info!("wyt-bridge listening on {host}:{port}, device {device_id} at {device_ip} ({version})");

    if let Err(e) = axum::serve(listener, app).await {
        error!("Server error: {e}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
