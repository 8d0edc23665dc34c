//! Unified error handling for the ride-recorder library.
//!
//! Every fallible operation returns [`Result`]. Storage, encoding and HTTP
//! errors from the underlying crates convert into [`RideError`] so callers can
//! use `?` throughout.

use thiserror::Error;

use crate::RideState;

/// Unified error type for ride-recorder operations.
#[derive(Debug, Error)]
pub enum RideError {
    /// The requested action is not allowed from the current recorder state
    #[error("Cannot {action} while {from}")]
    InvalidTransition { from: RideState, action: &'static str },

    /// Location permission has not been granted
    #[error("Location permission denied")]
    PermissionDenied,

    /// No ride with this id exists in the store
    #[error("Ride '{ride_id}' not found")]
    RideNotFound { ride_id: String },

    /// Configuration error
    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    /// SQLite error
    #[error("Persistence error: {0}")]
    Persistence(#[from] rusqlite::Error),

    /// Schema migration error
    #[error("Migration error: {0}")]
    Migration(#[from] rusqlite_migration::Error),

    /// Point blob, polyline or JSON encoding error
    #[error("Encoding error: {message}")]
    Encoding { message: String },

    /// HTTP/API error. `status_code` is `None` for transport failures.
    #[error("HTTP error{}: {message}", .status_code.map(|c| format!(" ({})", c)).unwrap_or_default())]
    HttpError {
        message: String,
        status_code: Option<u16>,
    },

    /// Generic internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl RideError {
    /// Whether a failed remote call may succeed if tried again later.
    ///
    /// Transport failures, 408, 429 and 5xx responses are transient. Every
    /// other error is permanent and should not be retried automatically.
    pub fn is_retryable(&self) -> bool {
        match self {
            RideError::HttpError { status_code, .. } => match status_code {
                None => true,
                Some(408) | Some(429) => true,
                Some(code) => (500..600).contains(code),
            },
            _ => false,
        }
    }

    pub(crate) fn encoding(message: impl Into<String>) -> Self {
        RideError::Encoding {
            message: message.into(),
        }
    }
}

impl From<rmp_serde::encode::Error> for RideError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        RideError::encoding(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for RideError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        RideError::encoding(e.to_string())
    }
}

impl From<serde_json::Error> for RideError {
    fn from(e: serde_json::Error) -> Self {
        RideError::encoding(e.to_string())
    }
}

impl From<reqwest::Error> for RideError {
    fn from(e: reqwest::Error) -> Self {
        RideError::HttpError {
            message: e.to_string(),
            status_code: e.status().map(|s| s.as_u16()),
        }
    }
}

/// Result type alias for ride-recorder operations.
pub type Result<T> = std::result::Result<T, RideError>;

/// Extension trait for converting Option to RideError.
pub trait OptionExt<T> {
    /// Convert Option to Result with a ride-not-found error.
    fn ok_or_not_found(self, ride_id: &str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn ok_or_not_found(self, ride_id: &str) -> Result<T> {
        self.ok_or_else(|| RideError::RideNotFound {
            ride_id: ride_id.to_string(),
        })
    }
}
