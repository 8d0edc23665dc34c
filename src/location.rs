//! Location permission state and raw GPS fix filtering.
//!
//! The platform location service delivers fixes at its own cadence and with
//! varying quality. Everything passes through [`LocationStore::accept`] before
//! it can reach the ride state, so the recorder only ever sees plausible,
//! time-ordered fixes.

use log::debug;
use serde::{Deserialize, Serialize};

use crate::config::RecorderConfig;
use crate::geo_utils::speed_between;
use crate::{GpsFix, Result, RideError};

/// Platform location permission as last reported by the shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "ffi", derive(uniffi::Enum))]
pub enum LocationPermission {
    Unknown,
    Granted,
    Denied,
}

/// Outcome of filtering a single fix.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FixVerdict {
    Accepted,
    InvalidCoordinates,
    /// Accuracy radius in meters was worse than allowed
    PoorAccuracy(f64),
    /// Timestamp not after the previously accepted fix
    OutOfOrder,
    /// Implied speed in m/s from the previous fix was implausible
    Jump(f64),
}

impl FixVerdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, FixVerdict::Accepted)
    }
}

/// Permission state and the last accepted fix.
#[derive(Debug, Clone)]
pub struct LocationStore {
    permission: LocationPermission,
    last_fix: Option<GpsFix>,
    max_accuracy_m: f64,
    max_speed_mps: f64,
}

impl LocationStore {
    pub fn new(config: &RecorderConfig) -> Self {
        Self {
            permission: LocationPermission::Unknown,
            last_fix: None,
            max_accuracy_m: config.max_accuracy_m,
            max_speed_mps: config.max_speed_mps,
        }
    }

    pub fn permission(&self) -> LocationPermission {
        self.permission
    }

    pub fn set_permission(&mut self, permission: LocationPermission) {
        if permission != self.permission {
            debug!(
                "[LocationStore] Permission {:?} -> {:?}",
                self.permission, permission
            );
        }
        self.permission = permission;
    }

    /// Fail unless the user granted location access.
    pub fn require_permission(&self) -> Result<()> {
        match self.permission {
            LocationPermission::Granted => Ok(()),
            _ => Err(RideError::PermissionDenied),
        }
    }

    pub fn last_fix(&self) -> Option<&GpsFix> {
        self.last_fix.as_ref()
    }

    /// Forget the last fix so the next one is not compared across a gap.
    pub fn reset(&mut self) {
        self.last_fix = None;
    }

    /// Filter a raw fix. Accepted fixes become the new reference fix.
    pub fn accept(&mut self, fix: &GpsFix) -> FixVerdict {
        let verdict = self.judge(fix);
        if verdict.is_accepted() {
            self.last_fix = Some(*fix);
        } else {
            debug!("[LocationStore] Rejected fix at {}: {:?}", fix.timestamp, verdict);
        }
        verdict
    }

    fn judge(&self, fix: &GpsFix) -> FixVerdict {
        if !fix.is_valid() {
            return FixVerdict::InvalidCoordinates;
        }
        if let Some(accuracy) = fix.accuracy {
            if !accuracy.is_finite() || accuracy > self.max_accuracy_m {
                return FixVerdict::PoorAccuracy(accuracy);
            }
        }
        if let Some(prev) = &self.last_fix {
            if fix.timestamp <= prev.timestamp {
                return FixVerdict::OutOfOrder;
            }
            if let Some(speed) = speed_between(prev, fix) {
                if speed > self.max_speed_mps {
                    return FixVerdict::Jump(speed);
                }
            }
        }
        FixVerdict::Accepted
    }
}
