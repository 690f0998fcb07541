//! Configuration loading from `.env` files.

use std::env;

use anyhow::{Context, Result};

use crate::{
    relay::{RelayConfig, DEFAULT_OUTBOX_CAPACITY},
    service::AGENT_COMMAND_KIND,
};

/// Runtime settings derived from environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    /// HTTP bind address for health and relay info, e.g. `127.0.0.1:7777`.
    pub bind_http: String,
    /// WebSocket bind address, e.g. `127.0.0.1:7778`.
    pub bind_ws: String,
    /// Path of the WebSocket endpoint.
    pub ws_path: String,
    /// Enable id and Schnorr signature verification of published events.
    pub verify_sig: bool,
    /// Events buffered per subscription before new ones are dropped.
    pub outbox_capacity: usize,
    /// Default tracing filter when `RUST_LOG` is unset.
    pub log_level: String,
    /// Job-request kinds answered by built-in handlers.
    pub service_kinds: Vec<u32>,
}

impl Settings {
    /// Load settings from the specified `.env` file.
    pub fn from_env(path: &str) -> Result<Self> {
        dotenvy::from_filename(path).context("reading env file")?;
        let bind_http = env::var("BIND_HTTP").context("BIND_HTTP")?;
        let bind_ws = env::var("BIND_WS").context("BIND_WS")?;
        let ws_path = env::var("WS_PATH")
            .ok()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .map(|p| if p.starts_with('/') { p } else { format!("/{p}") })
            .unwrap_or_else(|| "/".into());
        let verify_sig = env::var("VERIFY_SIG").unwrap_or_else(|_| "0".into()) == "1";
        let outbox_capacity = env::var("OUTBOX_CAPACITY")
            .ok()
            .and_then(|s| s.trim().parse::<usize>().ok())
            .filter(|&n| n > 0)
            .unwrap_or(DEFAULT_OUTBOX_CAPACITY);
        let log_level = env::var("LOG_LEVEL")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| "info".into());
        let service_kinds = match env::var("SERVICE_KINDS") {
            Ok(s) => csv_u32(s),
            Err(_) => vec![AGENT_COMMAND_KIND],
        };
        Ok(Self {
            bind_http,
            bind_ws,
            ws_path,
            verify_sig,
            outbox_capacity,
            log_level,
            service_kinds,
        })
    }

    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            outbox_capacity: self.outbox_capacity,
            verify_sig: self.verify_sig,
        }
    }
}

/// Split a comma-separated string into `u32` values, skipping invalid entries.
pub fn csv_u32(input: impl AsRef<str>) -> Vec<u32> {
    let s = input.as_ref();
    s.split(',').filter_map(|s| s.trim().parse().ok()).collect()
}
