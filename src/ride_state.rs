//! # Ride State Store
//!
//! The recorder state machine and the data of the ride being recorded.
//!
//! ```text
//!   NotTracking --start--> Tracking --pause--> Paused
//!        ^                   |  ^                |
//!        |                   |  +----resume------+
//!        |                   |                   |
//!        |                 stop                 stop
//!        |                   v                   |
//!        +--complete_finish-- Finishing <--------+
//!
//!   cancel: Tracking | Paused | Finishing --> NotTracking
//! ```
//!
//! Points are grouped into segments. Every `start`/`resume` opens a segment
//! and every `pause`/`stop` closes it, so distance is never measured across
//! a pause gap. Moving duration only grows while tracking.
//!
//! All operations take the current time as unix milliseconds so the caller
//! owns the clock.

use log::{debug, info};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::geo_utils::{bounds_of, haversine_distance, speed_between};
use crate::{Bounds, GpsFix, GpsPoint, Result, RideError, RideState};

/// A contiguous run of fixes between a start/resume and a pause/stop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    /// Unix ms when the segment was opened
    pub started_at: i64,
    /// Unix ms when the segment was closed, None while open
    pub ended_at: Option<i64>,
    pub fixes: Vec<GpsFix>,
    /// Haversine length of this segment in meters
    pub distance_meters: f64,
}

impl Segment {
    fn open(now: i64) -> Self {
        Self {
            started_at: now,
            ended_at: None,
            fixes: Vec::new(),
            distance_meters: 0.0,
        }
    }

    pub fn points(&self) -> Vec<GpsPoint> {
        self.fixes.iter().map(GpsFix::point).collect()
    }
}

/// A fix tagged with the index of the segment it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SegmentFix {
    pub segment: u32,
    pub fix: GpsFix,
}

/// A stopped ride, ready to be persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinishedRide {
    pub ride_id: String,
    pub started_at: i64,
    pub ended_at: i64,
    /// Time spent tracking (pauses excluded), in ms
    pub moving_duration_ms: i64,
    pub distance_meters: f64,
    pub max_speed_mps: f64,
    pub new_miles_meters: f64,
    /// Closed, non-empty segments in recording order
    pub segments: Vec<Segment>,
}

impl FinishedRide {
    pub fn point_count(&self) -> usize {
        self.segments.iter().map(|s| s.fixes.len()).sum()
    }

    pub fn bounds(&self) -> Option<Bounds> {
        let fixes: Vec<GpsFix> = self
            .segments
            .iter()
            .flat_map(|s| s.fixes.iter().copied())
            .collect();
        bounds_of(&fixes)
    }

    /// Average moving speed in m/s.
    pub fn average_speed_mps(&self) -> f64 {
        average_speed(self.distance_meters, self.moving_duration_ms)
    }
}

/// Live view of the recorder for the UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct RideSnapshot {
    pub state: RideState,
    pub ride_id: Option<String>,
    pub distance_meters: f64,
    pub moving_duration_ms: i64,
    pub current_speed_mps: f64,
    pub average_speed_mps: f64,
    pub max_speed_mps: f64,
    pub new_miles_meters: f64,
    pub segment_count: u32,
    pub point_count: u32,
    pub last_point: Option<GpsPoint>,
}

fn average_speed(distance_meters: f64, moving_duration_ms: i64) -> f64 {
    if moving_duration_ms <= 0 {
        0.0
    } else {
        distance_meters / (moving_duration_ms as f64 / 1000.0)
    }
}

#[derive(Debug, Clone)]
struct ActiveRide {
    ride_id: String,
    started_at: i64,
    segments: Vec<Segment>,
    distance_meters: f64,
    moving_duration_ms: i64,
    /// Last time moving duration was brought up to date (only meaningful while tracking)
    last_tick: i64,
    current_speed_mps: f64,
    max_speed_mps: f64,
    new_miles_meters: f64,
    ended_at: Option<i64>,
}

impl ActiveRide {
    fn new(ride_id: String, now: i64) -> Self {
        Self {
            ride_id,
            started_at: now,
            segments: vec![Segment::open(now)],
            distance_meters: 0.0,
            moving_duration_ms: 0,
            last_tick: now,
            current_speed_mps: 0.0,
            max_speed_mps: 0.0,
            new_miles_meters: 0.0,
            ended_at: None,
        }
    }

    /// Add elapsed tracking time. A clock that went backwards adds nothing.
    fn tick(&mut self, now: i64) {
        if now > self.last_tick {
            self.moving_duration_ms += now - self.last_tick;
        }
        self.last_tick = now;
    }

    fn close_segment(&mut self, now: i64) {
        if let Some(segment) = self.segments.last_mut() {
            if segment.ended_at.is_none() {
                segment.ended_at = Some(now.max(segment.started_at));
            }
        }
    }

    fn point_count(&self) -> usize {
        self.segments.iter().map(|s| s.fixes.len()).sum()
    }

    fn finished(&self) -> FinishedRide {
        let ended_at = self.ended_at.unwrap_or(self.last_tick);
        FinishedRide {
            ride_id: self.ride_id.clone(),
            started_at: self.started_at,
            ended_at: ended_at.max(self.started_at),
            moving_duration_ms: self.moving_duration_ms,
            distance_meters: self.distance_meters,
            max_speed_mps: self.max_speed_mps,
            new_miles_meters: self.new_miles_meters,
            segments: self
                .segments
                .iter()
                .filter(|s| !s.fixes.is_empty())
                .cloned()
                .collect(),
        }
    }
}

/// The recorder state machine.
#[derive(Debug, Clone)]
pub struct RideStateStore {
    state: RideState,
    ride: Option<ActiveRide>,
}

impl Default for RideStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RideStateStore {
    pub fn new() -> Self {
        Self {
            state: RideState::NotTracking,
            ride: None,
        }
    }

    pub fn state(&self) -> RideState {
        self.state
    }

    pub fn ride_id(&self) -> Option<&str> {
        self.ride.as_ref().map(|r| r.ride_id.as_str())
    }

    fn invalid(&self, action: &'static str) -> RideError {
        RideError::InvalidTransition {
            from: self.state,
            action,
        }
    }

    fn active_mut(&mut self, action: &'static str) -> Result<&mut ActiveRide> {
        let from = self.state;
        self.ride
            .as_mut()
            .ok_or(RideError::InvalidTransition { from, action })
    }

    /// `NotTracking -> Tracking`. Opens the first segment of a new ride.
    pub fn start(&mut self, now: i64) -> Result<&str> {
        if self.state != RideState::NotTracking {
            return Err(self.invalid("start"));
        }
        let ride_id = Uuid::new_v4().to_string();
        info!("[RideState] Started ride {}", ride_id);
        self.ride = Some(ActiveRide::new(ride_id, now));
        self.state = RideState::Tracking;
        Ok(self.ride_id().unwrap_or_default())
    }

    /// `Tracking -> Paused`. Closes the open segment.
    pub fn pause(&mut self, now: i64) -> Result<()> {
        if self.state != RideState::Tracking {
            return Err(self.invalid("pause"));
        }
        let ride = self.active_mut("pause")?;
        ride.tick(now);
        ride.close_segment(now);
        ride.current_speed_mps = 0.0;
        debug!(
            "[RideState] Paused ride {} after {} ms moving",
            ride.ride_id, ride.moving_duration_ms
        );
        self.state = RideState::Paused;
        Ok(())
    }

    /// `Paused -> Tracking`. Opens a new segment.
    pub fn resume(&mut self, now: i64) -> Result<()> {
        if self.state != RideState::Paused {
            return Err(self.invalid("resume"));
        }
        let ride = self.active_mut("resume")?;
        ride.last_tick = now;
        ride.segments.push(Segment::open(now));
        debug!(
            "[RideState] Resumed ride {} (segment {})",
            ride.ride_id,
            ride.segments.len() - 1
        );
        self.state = RideState::Tracking;
        Ok(())
    }

    /// `Tracking | Paused -> Finishing`. Returns the ride to persist.
    pub fn stop(&mut self, now: i64) -> Result<FinishedRide> {
        let was_tracking = match self.state {
            RideState::Tracking => true,
            RideState::Paused => false,
            _ => return Err(self.invalid("stop")),
        };
        let ride = self.active_mut("stop")?;
        if was_tracking {
            ride.tick(now);
        }
        ride.close_segment(now);
        ride.current_speed_mps = 0.0;
        ride.ended_at = Some(now);
        let finished = ride.finished();
        info!(
            "[RideState] Stopped ride {}: {:.0}m in {} ms, {} segments",
            finished.ride_id,
            finished.distance_meters,
            finished.moving_duration_ms,
            finished.segments.len()
        );
        self.state = RideState::Finishing;
        Ok(finished)
    }

    /// The stopped ride while in `Finishing`.
    pub fn finished_ride(&self) -> Option<FinishedRide> {
        match self.state {
            RideState::Finishing => self.ride.as_ref().map(ActiveRide::finished),
            _ => None,
        }
    }

    /// `Finishing -> NotTracking`, once the ride has been persisted.
    pub fn complete_finish(&mut self) -> Result<()> {
        if self.state != RideState::Finishing {
            return Err(self.invalid("complete finish"));
        }
        self.ride = None;
        self.state = RideState::NotTracking;
        Ok(())
    }

    /// Discard the ride. Allowed from any state except `NotTracking`.
    pub fn cancel(&mut self) -> Result<()> {
        if self.state == RideState::NotTracking {
            return Err(self.invalid("cancel"));
        }
        if let Some(ride) = self.ride.take() {
            info!("[RideState] Cancelled ride {}", ride.ride_id);
        }
        self.state = RideState::NotTracking;
        Ok(())
    }

    /// Append a filtered fix to the open segment.
    ///
    /// Returns `false` (and ignores the fix) unless tracking.
    pub fn add_fix(&mut self, fix: &GpsFix) -> bool {
        if self.state != RideState::Tracking {
            return false;
        }
        let Some(ride) = self.ride.as_mut() else {
            return false;
        };
        let Some(segment) = ride.segments.last_mut() else {
            return false;
        };

        let computed_speed = match segment.fixes.last() {
            Some(prev) => {
                let step = haversine_distance(&prev.point(), &fix.point());
                segment.distance_meters += step;
                ride.distance_meters += step;
                speed_between(prev, fix)
            }
            None => None,
        };

        let speed = match fix.speed {
            Some(s) if s.is_finite() && s >= 0.0 => s,
            _ => computed_speed.unwrap_or(0.0),
        };
        ride.current_speed_mps = speed;
        ride.max_speed_mps = ride.max_speed_mps.max(speed);
        segment.fixes.push(*fix);
        true
    }

    /// Add reconciled new-miles distance to the live ride.
    pub fn add_new_miles(&mut self, meters: f64) {
        if let Some(ride) = self.ride.as_mut() {
            if meters.is_finite() && meters > 0.0 {
                ride.new_miles_meters += meters;
            }
        }
    }

    /// Replace the new-miles total with the service's authoritative value.
    pub fn set_new_miles_total(&mut self, meters: f64) {
        if let Some(ride) = self.ride.as_mut() {
            if meters.is_finite() && meters >= 0.0 {
                ride.new_miles_meters = meters;
            }
        }
    }

    pub fn point_count(&self) -> usize {
        self.ride.as_ref().map_or(0, ActiveRide::point_count)
    }

    /// All fixes past `offset` (in recording order), tagged with their segment.
    pub fn fixes_from(&self, offset: usize) -> Vec<SegmentFix> {
        let Some(ride) = self.ride.as_ref() else {
            return Vec::new();
        };
        ride.segments
            .iter()
            .enumerate()
            .flat_map(|(i, s)| {
                s.fixes.iter().map(move |f| SegmentFix {
                    segment: i as u32,
                    fix: *f,
                })
            })
            .skip(offset)
            .collect()
    }

    /// The fix at a flat index, with its segment.
    pub fn fix_at(&self, index: usize) -> Option<SegmentFix> {
        let ride = self.ride.as_ref()?;
        let mut remaining = index;
        for (i, s) in ride.segments.iter().enumerate() {
            if remaining < s.fixes.len() {
                return Some(SegmentFix {
                    segment: i as u32,
                    fix: s.fixes[remaining],
                });
            }
            remaining -= s.fixes.len();
        }
        None
    }

    /// Live statistics. Does not mutate the recorder.
    pub fn snapshot(&self, now: i64) -> RideSnapshot {
        let Some(ride) = self.ride.as_ref() else {
            return RideSnapshot {
                state: self.state,
                ride_id: None,
                distance_meters: 0.0,
                moving_duration_ms: 0,
                current_speed_mps: 0.0,
                average_speed_mps: 0.0,
                max_speed_mps: 0.0,
                new_miles_meters: 0.0,
                segment_count: 0,
                point_count: 0,
                last_point: None,
            };
        };

        let mut moving = ride.moving_duration_ms;
        if self.state == RideState::Tracking && now > ride.last_tick {
            moving += now - ride.last_tick;
        }

        RideSnapshot {
            state: self.state,
            ride_id: Some(ride.ride_id.clone()),
            distance_meters: ride.distance_meters,
            moving_duration_ms: moving,
            current_speed_mps: ride.current_speed_mps,
            average_speed_mps: average_speed(ride.distance_meters, moving),
            max_speed_mps: ride.max_speed_mps,
            new_miles_meters: ride.new_miles_meters,
            segment_count: ride.segments.len() as u32,
            point_count: ride.point_count() as u32,
            last_point: ride
                .segments
                .iter()
                .rev()
                .find_map(|s| s.fixes.last())
                .map(GpsFix::point),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
