//! New miles reconciliation.
//!
//! While a ride is being recorded, the points collected since the last
//! successful call are sent to the matching service, which answers with the
//! distance that was covered on roads the rider had never traveled before.
//!
//! The tracker keeps a cursor into the ride's flat point list. The cursor only
//! moves when the service confirms a batch, so a failed call re-sends the same
//! points on the next attempt and no distance is lost or counted twice.
//!
//! When the ride stops while a periodic call is still out, the final flush
//! only sends the points after that call's batch. The late answer is credited
//! by whoever still owns the ride (the live ride, or the stored one).

use log::debug;
use serde::{Deserialize, Serialize};

use crate::ride_state::{RideStateStore, SegmentFix};

/// A point sent to the matching service.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NewMilesPoint {
    pub latitude: f64,
    pub longitude: f64,
    /// Unix ms
    pub timestamp: i64,
    /// Segment index, points of different segments are never joined
    pub segment: u32,
}

impl From<SegmentFix> for NewMilesPoint {
    fn from(sf: SegmentFix) -> Self {
        Self {
            latitude: sf.fix.latitude,
            longitude: sf.fix.longitude,
            timestamp: sf.fix.timestamp,
            segment: sf.segment,
        }
    }
}

/// Request body for the new miles endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMilesRequest {
    pub ride_id: String,
    /// Position of the first point in the ride's flat point list
    #[serde(skip)]
    pub offset: usize,
    /// Last already-reconciled point of the same segment, so the step from it
    /// to the first new point is matched too
    pub anchor: Option<NewMilesPoint>,
    pub points: Vec<NewMilesPoint>,
}

/// Response of the new miles endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMilesResponse {
    /// Untraveled distance covered by this batch, in meters
    pub new_meters: f64,
    /// Running total for the whole ride, when the service tracks it
    #[serde(default)]
    pub total_new_meters: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Batch {
    offset: usize,
    len: usize,
}

/// Schedules reconciliation calls and owns the cursor.
#[derive(Debug, Clone)]
pub struct NewMilesTracker {
    interval_ms: i64,
    cursor: usize,
    last_attempt: Option<i64>,
    in_flight: Option<Batch>,
    /// Set by the final flush; no further requests until reset
    closed: bool,
}

impl NewMilesTracker {
    pub fn new(interval_ms: u64) -> Self {
        Self {
            interval_ms: interval_ms as i64,
            cursor: 0,
            last_attempt: None,
            in_flight: None,
            closed: false,
        }
    }

    /// Forget all progress. Call when a new ride starts.
    pub fn reset(&mut self) {
        self.cursor = 0;
        self.last_attempt = None;
        self.in_flight = None;
        self.closed = false;
    }

    /// Number of points confirmed by the service.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Whether the interval has elapsed since the last attempt.
    pub fn is_due(&self, now: i64) -> bool {
        match self.last_attempt {
            None => true,
            // A clock that went backwards must not stall reconciliation
            Some(last) => now < last || now - last >= self.interval_ms,
        }
    }

    /// Build the next request if due, there are unsent points and no call is in flight.
    pub fn poll(&mut self, ride: &RideStateStore, now: i64) -> Option<NewMilesRequest> {
        if !self.is_due(now) {
            return None;
        }
        self.take_request(ride, now)
    }

    /// Build a request regardless of the interval.
    pub fn take_request(&mut self, ride: &RideStateStore, now: i64) -> Option<NewMilesRequest> {
        if self.in_flight.is_some() || self.closed {
            return None;
        }
        self.last_attempt = Some(now);
        let request = build_request(ride, self.cursor)?;
        self.in_flight = Some(Batch {
            offset: request.offset,
            len: request.points.len(),
        });
        Some(request)
    }

    /// The last request of a ride that is about to stop.
    ///
    /// With a call still in flight, only the points after its batch are sent
    /// and the in-flight call stays pending. Either way the tracker is closed
    /// afterwards.
    pub fn take_final_request(
        &mut self,
        ride: &RideStateStore,
        now: i64,
    ) -> Option<NewMilesRequest> {
        if self.closed {
            return None;
        }
        let request = match self.in_flight {
            None => self.take_request(ride, now),
            Some(batch) => {
                self.last_attempt = Some(now);
                build_request(ride, batch.offset + batch.len)
            }
        };
        self.closed = true;
        request
    }

    /// Apply a successful response for `request`.
    ///
    /// The cursor only moves past the batch that was in flight; a final flush
    /// sent beside it just adds its distance.
    pub fn complete(
        &mut self,
        ride: &mut RideStateStore,
        request: &NewMilesRequest,
        response: &NewMilesResponse,
    ) {
        match self.in_flight {
            Some(batch) if batch.offset == request.offset => {
                self.in_flight = None;
                self.cursor = batch.offset + batch.len;
            }
            _ if request.offset == self.cursor => {
                self.cursor += request.points.len();
            }
            _ => {}
        }
        match response.total_new_meters {
            Some(total) => ride.set_new_miles_total(total),
            None => ride.add_new_miles(response.new_meters),
        }
    }

    /// The call for `request` failed; its points will be sent again.
    pub fn abort(&mut self, request: &NewMilesRequest) {
        if self.in_flight.is_some_and(|batch| batch.offset == request.offset) {
            self.in_flight = None;
        }
    }
}

/// Points from `offset` on, anchored to the previous point of the same segment.
fn build_request(ride: &RideStateStore, offset: usize) -> Option<NewMilesRequest> {
    let ride_id = ride.ride_id()?.to_string();
    let fixes = ride.fixes_from(offset);
    let first = fixes.first()?;
    let anchor = offset
        .checked_sub(1)
        .and_then(|i| ride.fix_at(i))
        .filter(|prev| prev.segment == first.segment)
        .map(NewMilesPoint::from);

    let points: Vec<NewMilesPoint> = fixes.into_iter().map(NewMilesPoint::from).collect();
    debug!(
        "[NewMiles] Reconciling {} points for ride {} from offset {}",
        points.len(),
        ride_id,
        offset
    );
    Some(NewMilesRequest {
        ride_id,
        offset,
        anchor,
        points,
    })
}
