//! Geographic helpers shared by the recorder and the store.

use geo::{Distance, Haversine, Point};

use crate::{Bounds, GpsFix, GpsPoint};

/// Calculate haversine distance between two GPS points in meters
pub fn haversine_distance(p1: &GpsPoint, p2: &GpsPoint) -> f64 {
    let point1 = Point::new(p1.longitude, p1.latitude);
    let point2 = Point::new(p2.longitude, p2.latitude);
    Haversine::distance(point1, point2)
}

/// Speed in m/s implied by moving from `a` to `b`.
///
/// Returns `None` when the fixes are not strictly ordered in time.
pub fn speed_between(a: &GpsFix, b: &GpsFix) -> Option<f64> {
    let dt_ms = b.timestamp - a.timestamp;
    if dt_ms <= 0 {
        return None;
    }
    Some(haversine_distance(&a.point(), &b.point()) / (dt_ms as f64 / 1000.0))
}

/// Bounding box of a set of fixes.
pub fn bounds_of(fixes: &[GpsFix]) -> Option<Bounds> {
    let points: Vec<GpsPoint> = fixes.iter().map(GpsFix::point).collect();
    Bounds::from_points(&points)
}
