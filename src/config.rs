//! Configuration for the recorder, the upload monitor and the remote API.
//!
//! Every section has sensible defaults. The mobile shell passes an optional
//! JSON document; missing fields fall back to the defaults. The API endpoint
//! and token can also come from the environment for desktop tooling and tests.

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Result, RideError};

/// Environment variable overriding [`ApiConfig::base_url`].
pub const ENV_API_BASE_URL: &str = "RIDE_API_BASE_URL";
/// Environment variable overriding [`ApiConfig::token`].
pub const ENV_API_TOKEN: &str = "RIDE_API_TOKEN";

/// Settings for GPS fix filtering and live ride bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    /// Fixes with a worse horizontal accuracy are dropped.
    /// Default: 50.0 meters
    pub max_accuracy_m: f64,

    /// Implied speed above which a fix is treated as a GPS jump.
    /// Default: 45.0 m/s (~160 km/h)
    pub max_speed_mps: f64,

    /// How often new miles are reconciled while tracking.
    /// Default: 3000 ms
    pub new_miles_interval_ms: u64,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            max_accuracy_m: 50.0,
            max_speed_mps: 45.0,
            new_miles_interval_ms: 3_000,
        }
    }
}

/// Retry and chunking policy for ride uploads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Retries after the first failed attempt before a ride is marked failed.
    /// Default: 5
    pub max_retries: u32,

    /// Delay before the first retry; doubles on every further retry.
    /// Default: 5000 ms
    pub base_delay_ms: u64,

    /// Upper bound on the retry delay.
    /// Default: 60000 ms
    pub max_delay_ms: u64,

    /// Maximum points per uploaded chunk.
    /// Default: 500
    pub chunk_size: usize,

    /// How often the background monitor looks for due uploads.
    /// Default: 15000 ms
    pub poll_interval_ms: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 5_000,
            max_delay_ms: 60_000,
            chunk_size: 500,
            poll_interval_ms: 15_000,
        }
    }
}

impl UploadConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Remote service location and credentials.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    /// Bearer token issued by the auth flow. None disables auth headers.
    pub token: Option<String>,
    /// Request timeout. Default: 30000 ms
    pub timeout_ms: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.ridekeeper.app/v1".to_string(),
            token: None,
            timeout_ms: 30_000,
        }
    }
}

/// Complete library configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub recorder: RecorderConfig,
    pub upload: UploadConfig,
    pub api: ApiConfig,
}

impl Config {
    /// Parse a (possibly partial) JSON document. An empty string yields the defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Config = if json.trim().is_empty() {
            Config::default()
        } else {
            serde_json::from_str(json).map_err(|e| RideError::ConfigError {
                message: format!("Invalid config JSON: {}", e),
            })?
        };
        config.validate()?;
        Ok(config)
    }

    /// Apply `RIDE_API_BASE_URL` / `RIDE_API_TOKEN` when set.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(url) = env::var(ENV_API_BASE_URL) {
            if !url.trim().is_empty() {
                self.api.base_url = url;
            }
        }
        if let Ok(token) = env::var(ENV_API_TOKEN) {
            if !token.trim().is_empty() {
                self.api.token = Some(token);
            }
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |message: &str| {
            Err(RideError::ConfigError {
                message: message.to_string(),
            })
        };

        if !(self.recorder.max_accuracy_m > 0.0) {
            return fail("recorder.max_accuracy_m must be positive");
        }
        if !(self.recorder.max_speed_mps > 0.0) {
            return fail("recorder.max_speed_mps must be positive");
        }
        if self.recorder.new_miles_interval_ms == 0 {
            return fail("recorder.new_miles_interval_ms must be non-zero");
        }
        if self.upload.chunk_size == 0 {
            return fail("upload.chunk_size must be non-zero");
        }
        if self.upload.poll_interval_ms == 0 {
            return fail("upload.poll_interval_ms must be non-zero");
        }
        if self.upload.max_delay_ms < self.upload.base_delay_ms {
            return fail("upload.max_delay_ms must not be below upload.base_delay_ms");
        }
        if self.api.base_url.trim().is_empty() {
            return fail("api.base_url must not be empty");
        }
        Ok(())
    }
}
