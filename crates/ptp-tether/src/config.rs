//! Connection configuration.
//!
//! Priority: environment variables > settings file > defaults.

use log::{debug, warn};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::ptp::container::MAX_CONTAINER_LEN;
use crate::ptp::dataset::StringEncoding;

/// Timeouts, retry policy and compatibility switches for one connection.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PtpConfig {
    pub command_timeout_ms: u64,
    pub response_timeout_ms: u64,
    /// PTP/IP init handshakes and USB open.
    pub handshake_timeout_ms: u64,
    /// Waiting for the per-device transaction lock.
    pub lock_timeout_ms: u64,
    pub data_base_timeout_ms: u64,
    pub data_per_kib_timeout_ms: u64,
    pub data_timeout_cap_ms: u64,
    pub usb_event_poll_ms: u64,
    pub network_event_poll_ms: u64,
    /// Total attempts per transaction, first one included.
    pub max_attempts: u32,
    /// Linear backoff: attempt n waits `n * backoff_step_ms` before re-sending.
    pub backoff_step_ms: u64,
    /// Answer a lost response with a synthesized OK once the session has a
    /// successful transaction behind it.
    pub synthesize_missing_ok: bool,
    /// Fraction of a declared PTP/IP data phase that counts as "arrived".
    pub min_data_ratio: f64,
    pub string_encoding: StringEncoding,
    pub max_container_bytes: u32,
    pub max_object_bytes: u32,
    /// PTP/IP friendly name. Defaults to the host name.
    pub client_name: Option<String>,
    /// PTP/IP client GUID as a UUID string. Random per connection when unset.
    pub client_guid: Option<String>,
}

impl Default for PtpConfig {
    fn default() -> Self {
        Self {
            command_timeout_ms: 1_000,
            response_timeout_ms: 2_000,
            handshake_timeout_ms: 10_000,
            lock_timeout_ms: 30_000,
            data_base_timeout_ms: 5_000,
            data_per_kib_timeout_ms: 100,
            data_timeout_cap_ms: 15_000,
            usb_event_poll_ms: 5_000,
            network_event_poll_ms: 500,
            max_attempts: 3,
            backoff_step_ms: 100,
            synthesize_missing_ok: true,
            min_data_ratio: 0.9,
            string_encoding: StringEncoding::Utf16,
            max_container_bytes: MAX_CONTAINER_LEN,
            max_object_bytes: u32::MAX,
            client_name: None,
            client_guid: None,
        }
    }
}

impl PtpConfig {
    /// Defaults with environment overrides applied.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Loads a JSON settings file, then applies environment overrides.
    /// Falls back to defaults if the file doesn't exist or can't be parsed.
    pub fn load(path: &Path) -> Self {
        let from_file = match fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str::<PtpConfig>(&contents) {
                Ok(config) => {
                    debug!("Loaded PTP config from {}", path.display());
                    Some(config)
                }
                Err(e) => {
                    warn!("Ignoring unparsable PTP config {}: {}", path.display(), e);
                    None
                }
            },
            Err(e) => {
                debug!("No PTP config at {} ({}), using defaults", path.display(), e);
                None
            }
        };
        from_file.unwrap_or_default().with_env_overrides()
    }

    fn with_env_overrides(mut self) -> Self {
        if let Some(ms) = env_parse::<u64>("PTP_TETHER_RESPONSE_TIMEOUT_MS") {
            self.response_timeout_ms = ms;
        }
        if let Some(attempts) = env_parse::<u32>("PTP_TETHER_MAX_ATTEMPTS") {
            self.max_attempts = attempts;
        }
        if let Ok(v) = env::var("PTP_TETHER_SYNTHESIZE_OK") {
            self.synthesize_missing_ok = v == "true" || v == "1";
        }
        if let Ok(v) = env::var("PTP_TETHER_STRING_ENCODING") {
            match v.to_ascii_lowercase().as_str() {
                "utf16" => self.string_encoding = StringEncoding::Utf16,
                "utf8" => self.string_encoding = StringEncoding::Utf8,
                other => warn!("Unknown PTP_TETHER_STRING_ENCODING '{}', keeping {:?}", other, self.string_encoding),
            }
        }
        self
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Per-read timeout for a data phase: base + per-KiB, capped.
    pub fn data_timeout(&self, expected_bytes: Option<u64>) -> Duration {
        let kib = expected_bytes.unwrap_or(0).div_ceil(1024);
        let ms = self
            .data_base_timeout_ms
            .saturating_add(kib.saturating_mul(self.data_per_kib_timeout_ms))
            .min(self.data_timeout_cap_ms.max(self.data_base_timeout_ms));
        Duration::from_millis(ms)
    }

    /// Backoff before attempt `attempt` (1-based count of failures so far).
    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_step_ms.saturating_mul(u64::from(attempt)))
    }

    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}
