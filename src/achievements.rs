//! Achievement detection for finished rides.
//!
//! A newly saved ride is compared against the rider's history to find
//! records and milestones worth celebrating:
//! - First ride
//! - Longest ride / longest moving time of the year
//! - Most new miles in a single ride
//! - Top speed
//! - Ride count, total distance and total new miles milestones
//!
//! ## Example
//! ```rust
//! use ride_recorder::achievements::{detect_achievements, AchievementType, RideRecord};
//!
//! let ride = RideRecord {
//!     ride_id: "r1".to_string(),
//!     timestamp: 1_700_000_000_000,
//!     distance_meters: 25_000.0,
//!     moving_duration_ms: 3_600_000,
//!     new_miles_meters: 1_200.0,
//!     max_speed_mps: 12.0,
//! };
//!
//! let achievements = detect_achievements(&ride, &[]);
//! assert_eq!(achievements[0].achievement_type, AchievementType::FirstRide);
//! ```

use chrono::{Datelike, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Type of achievement detected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ffi", derive(uniffi::Enum))]
pub enum AchievementType {
    /// Very first recorded ride
    FirstRide,
    /// Longest ride of the year (by distance)
    LongestRide,
    /// Longest ride of the year (by moving time)
    LongestDuration,
    /// Most untraveled distance covered in a single ride
    MostNewMiles,
    /// Highest speed ever recorded
    TopSpeed,
    /// Reached a milestone (10 rides, 1000km, etc.)
    Milestone,
}

/// An achievement earned by a ride
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct Achievement {
    pub achievement_type: AchievementType,
    /// Human-readable title
    pub title: String,
    pub description: String,
    /// The value that triggered the achievement (e.g. "42.1km")
    pub value: String,
    /// Previous best value (if applicable)
    pub previous_best: Option<String>,
    /// Improvement percentage (if applicable)
    pub improvement_percent: Option<f64>,
    pub ride_id: String,
    /// Unix ms
    pub timestamp: i64,
    /// Importance score (higher = more significant)
    pub importance: u8,
}

/// Summary of a stored ride, as used for comparison
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct RideRecord {
    pub ride_id: String,
    /// Ride start, unix ms
    pub timestamp: i64,
    pub distance_meters: f64,
    pub moving_duration_ms: i64,
    pub new_miles_meters: f64,
    pub max_speed_mps: f64,
}

/// Rides shorter than this never set a yearly distance record
const LONGEST_RIDE_MIN_METERS: f64 = 10_000.0;
/// Rides shorter than this never set a yearly duration record
const LONGEST_DURATION_MIN_MS: i64 = 3_600_000;
const MOST_NEW_MILES_MIN_METERS: f64 = 1_000.0;

const COUNT_MILESTONES: &[usize] = &[10, 25, 50, 100, 250, 500, 1000];
const DISTANCE_MILESTONES_KM: &[f64] = &[100.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0];
const NEW_MILES_MILESTONES_KM: &[f64] = &[10.0, 50.0, 100.0, 500.0, 1000.0];

/// Detect achievements by comparing a new ride against history.
///
/// `history` may contain the new ride itself; it is ignored. Results are
/// sorted by importance, highest first.
pub fn detect_achievements(new_ride: &RideRecord, history: &[RideRecord]) -> Vec<Achievement> {
    let history: Vec<&RideRecord> = history
        .iter()
        .filter(|r| r.ride_id != new_ride.ride_id)
        .collect();

    let mut achievements = Vec::new();

    if history.is_empty() {
        achievements.push(Achievement {
            achievement_type: AchievementType::FirstRide,
            title: "First Ride!".to_string(),
            description: "Congratulations on recording your first ride!".to_string(),
            value: format_distance(new_ride.distance_meters),
            previous_best: None,
            improvement_percent: None,
            ride_id: new_ride.ride_id.clone(),
            timestamp: new_ride.timestamp,
            importance: 80,
        });
    }

    achievements.extend(detect_distance_record(new_ride, &history));
    achievements.extend(detect_duration_record(new_ride, &history));
    achievements.extend(detect_new_miles_record(new_ride, &history));
    achievements.extend(detect_top_speed(new_ride, &history));
    achievements.extend(detect_milestones(new_ride, &history));

    achievements.sort_by(|a, b| b.importance.cmp(&a.importance));
    achievements
}

fn improvement(new: f64, previous: f64) -> Option<f64> {
    if previous > 0.0 {
        Some((new - previous) / previous * 100.0)
    } else {
        None
    }
}

fn detect_distance_record(new_ride: &RideRecord, history: &[&RideRecord]) -> Option<Achievement> {
    let year = year_of(new_ride.timestamp);
    let year_max = history
        .iter()
        .filter(|r| year_of(r.timestamp) == year)
        .map(|r| r.distance_meters)
        .fold(0.0f64, f64::max);

    if new_ride.distance_meters <= year_max || new_ride.distance_meters <= LONGEST_RIDE_MIN_METERS {
        return None;
    }

    Some(Achievement {
        achievement_type: AchievementType::LongestRide,
        title: format!("Longest Ride of {}!", year),
        description: format!(
            "Your longest ride this year: {}",
            format_distance(new_ride.distance_meters)
        ),
        value: format_distance(new_ride.distance_meters),
        previous_best: (year_max > 0.0).then(|| format_distance(year_max)),
        improvement_percent: improvement(new_ride.distance_meters, year_max),
        ride_id: new_ride.ride_id.clone(),
        timestamp: new_ride.timestamp,
        importance: 70,
    })
}

fn detect_duration_record(new_ride: &RideRecord, history: &[&RideRecord]) -> Option<Achievement> {
    let year = year_of(new_ride.timestamp);
    let year_max = history
        .iter()
        .filter(|r| year_of(r.timestamp) == year)
        .map(|r| r.moving_duration_ms)
        .max()
        .unwrap_or(0);

    if new_ride.moving_duration_ms <= year_max
        || new_ride.moving_duration_ms <= LONGEST_DURATION_MIN_MS
    {
        return None;
    }

    Some(Achievement {
        achievement_type: AchievementType::LongestDuration,
        title: format!("Longest Time in the Saddle of {}!", year),
        description: format!(
            "Your longest moving time this year: {}",
            format_duration(new_ride.moving_duration_ms)
        ),
        value: format_duration(new_ride.moving_duration_ms),
        previous_best: (year_max > 0).then(|| format_duration(year_max)),
        improvement_percent: None,
        ride_id: new_ride.ride_id.clone(),
        timestamp: new_ride.timestamp,
        importance: 60,
    })
}

fn detect_new_miles_record(new_ride: &RideRecord, history: &[&RideRecord]) -> Option<Achievement> {
    let best = history
        .iter()
        .map(|r| r.new_miles_meters)
        .fold(0.0f64, f64::max);

    if new_ride.new_miles_meters <= best || new_ride.new_miles_meters <= MOST_NEW_MILES_MIN_METERS
    {
        return None;
    }

    Some(Achievement {
        achievement_type: AchievementType::MostNewMiles,
        title: "Explorer!".to_string(),
        description: format!(
            "Most new roads in a single ride: {}",
            format_distance(new_ride.new_miles_meters)
        ),
        value: format_distance(new_ride.new_miles_meters),
        previous_best: (best > 0.0).then(|| format_distance(best)),
        improvement_percent: improvement(new_ride.new_miles_meters, best),
        ride_id: new_ride.ride_id.clone(),
        timestamp: new_ride.timestamp,
        importance: 75,
    })
}

fn detect_top_speed(new_ride: &RideRecord, history: &[&RideRecord]) -> Option<Achievement> {
    // Needs something to beat
    if history.is_empty() {
        return None;
    }
    let best = history
        .iter()
        .map(|r| r.max_speed_mps)
        .fold(0.0f64, f64::max);

    if new_ride.max_speed_mps <= best {
        return None;
    }

    let pct = improvement(new_ride.max_speed_mps, best);
    let bonus = match pct {
        Some(p) if p > 10.0 => 10,
        Some(p) if p > 5.0 => 5,
        _ => 0,
    };

    Some(Achievement {
        achievement_type: AchievementType::TopSpeed,
        title: "New Top Speed!".to_string(),
        description: format!("Fastest you've ever gone: {}", format_speed(new_ride.max_speed_mps)),
        value: format_speed(new_ride.max_speed_mps),
        previous_best: (best > 0.0).then(|| format_speed(best)),
        improvement_percent: pct,
        ride_id: new_ride.ride_id.clone(),
        timestamp: new_ride.timestamp,
        importance: 55 + bonus,
    })
}

fn detect_milestones(new_ride: &RideRecord, history: &[&RideRecord]) -> Vec<Achievement> {
    let mut achievements = Vec::new();

    let ride_count = history.len() + 1;
    if COUNT_MILESTONES.contains(&ride_count) {
        achievements.push(Achievement {
            achievement_type: AchievementType::Milestone,
            title: format!("{} Rides!", ride_count),
            description: format!("You've recorded {} rides. Keep it up!", ride_count),
            value: ride_count.to_string(),
            previous_best: None,
            improvement_percent: None,
            ride_id: new_ride.ride_id.clone(),
            timestamp: new_ride.timestamp,
            importance: count_milestone_importance(ride_count),
        });
    }

    let previous_km = history.iter().map(|r| r.distance_meters).sum::<f64>() / 1000.0;
    let total_km = previous_km + new_ride.distance_meters / 1000.0;
    for &milestone in DISTANCE_MILESTONES_KM {
        if previous_km < milestone && total_km >= milestone {
            achievements.push(Achievement {
                achievement_type: AchievementType::Milestone,
                title: format!("{}km Total!", milestone as i32),
                description: format!("You've ridden {} kilometers in total!", milestone as i32),
                value: format!("{}km", milestone as i32),
                previous_best: None,
                improvement_percent: None,
                ride_id: new_ride.ride_id.clone(),
                timestamp: new_ride.timestamp,
                importance: distance_milestone_importance(milestone),
            });
        }
    }

    let previous_new_km = history.iter().map(|r| r.new_miles_meters).sum::<f64>() / 1000.0;
    let total_new_km = previous_new_km + new_ride.new_miles_meters / 1000.0;
    for &milestone in NEW_MILES_MILESTONES_KM {
        if previous_new_km < milestone && total_new_km >= milestone {
            achievements.push(Achievement {
                achievement_type: AchievementType::Milestone,
                title: format!("{}km of New Roads!", milestone as i32),
                description: format!(
                    "You've explored {} kilometers of roads you had never ridden!",
                    milestone as i32
                ),
                value: format!("{}km", milestone as i32),
                previous_best: None,
                improvement_percent: None,
                ride_id: new_ride.ride_id.clone(),
                timestamp: new_ride.timestamp,
                importance: distance_milestone_importance(milestone * 10.0),
            });
        }
    }

    achievements
}

// ============================================================================
// Helper Functions
// ============================================================================

pub fn format_duration(ms: i64) -> String {
    let seconds = ms.max(0) / 1000;
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}min", seconds / 60)
    } else {
        let hours = seconds / 3600;
        let mins = (seconds % 3600) / 60;
        if mins > 0 {
            format!("{}h {}min", hours, mins)
        } else {
            format!("{}h", hours)
        }
    }
}

pub fn format_distance(meters: f64) -> String {
    if meters < 1000.0 {
        format!("{}m", meters as i64)
    } else {
        format!("{:.1}km", meters / 1000.0)
    }
}

pub fn format_speed(meters_per_second: f64) -> String {
    format!("{:.1}km/h", meters_per_second * 3.6)
}

fn year_of(timestamp_ms: i64) -> i32 {
    Utc.timestamp_millis_opt(timestamp_ms)
        .single()
        .map(|dt| dt.year())
        .unwrap_or(1970)
}

fn count_milestone_importance(count: usize) -> u8 {
    match count {
        10 => 40,
        25 => 50,
        50 => 60,
        100 => 75,
        250 => 80,
        500 => 85,
        1000 => 95,
        _ => 50,
    }
}

fn distance_milestone_importance(km: f64) -> u8 {
    match km as i32 {
        100 => 50,
        500 => 60,
        1000 => 75,
        2500 => 80,
        5000 => 90,
        10000 => 95,
        _ => 50,
    }
}
