//! # Ride Service
//!
//! Orchestrates one recording session end to end: permission checks, fix
//! filtering, the ride state machine, new-miles reconciliation, persistence,
//! achievements and waking the upload monitor.
//!
//! Network calls are split into a synchronous "take request" step and an
//! "apply result" step so a caller holding the service behind a lock can
//! release it while the request is in flight. [`RideService::tick`] and
//! [`RideService::stop_ride`] combine both steps for async callers.

use std::sync::Arc;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::achievements::{detect_achievements, Achievement, RideRecord};
use crate::api::RideApi;
use crate::config::Config;
use crate::location::{FixVerdict, LocationPermission, LocationStore};
use crate::new_miles::{NewMilesRequest, NewMilesResponse, NewMilesTracker};
use crate::ride_state::{FinishedRide, RideSnapshot, RideStateStore};
use crate::store::{lock_store, RideStoreStats, SharedStore, StoredRide};
use crate::{Bounds, GpsFix, Result, RideError, RideState};

/// Result of a successfully finished ride.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct StopOutcome {
    pub ride_id: String,
    pub distance_meters: f64,
    pub moving_duration_ms: i64,
    pub new_miles_meters: f64,
    pub point_count: u32,
    /// Sorted by importance, highest first
    pub achievements: Vec<Achievement>,
}

pub struct RideService {
    location: LocationStore,
    ride: RideStateStore,
    new_miles: NewMilesTracker,
    store: SharedStore,
    api: Arc<dyn RideApi>,
    upload_wake: Option<Arc<Notify>>,
    /// Saved ride whose last periodic new-miles call had not answered yet
    awaiting_late_miles: Option<String>,
}

impl RideService {
    pub fn new(config: &Config, store: SharedStore, api: Arc<dyn RideApi>) -> Self {
        Self {
            location: LocationStore::new(&config.recorder),
            ride: RideStateStore::new(),
            new_miles: NewMilesTracker::new(config.recorder.new_miles_interval_ms),
            store,
            api,
            upload_wake: None,
            awaiting_late_miles: None,
        }
    }

    /// Wake this notifier whenever a ride becomes uploadable.
    pub fn set_upload_notifier(&mut self, notifier: Arc<Notify>) {
        self.upload_wake = Some(notifier);
    }

    pub fn clear_upload_notifier(&mut self) {
        self.upload_wake = None;
    }

    pub fn api(&self) -> Arc<dyn RideApi> {
        Arc::clone(&self.api)
    }

    pub fn store(&self) -> SharedStore {
        Arc::clone(&self.store)
    }

    pub fn state(&self) -> RideState {
        self.ride.state()
    }

    fn notify_uploads(&self) {
        if let Some(wake) = &self.upload_wake {
            wake.notify_one();
        }
    }

    // ========================================================================
    // Permission and location
    // ========================================================================

    pub fn permission(&self) -> LocationPermission {
        self.location.permission()
    }

    /// Record the platform permission. Losing it while tracking pauses the ride.
    pub fn set_permission(&mut self, permission: LocationPermission, now: i64) {
        self.location.set_permission(permission);
        if permission == LocationPermission::Denied && self.ride.state() == RideState::Tracking {
            warn!("[RideService] Location permission revoked, pausing ride");
            if let Err(e) = self.pause_ride(now) {
                warn!("[RideService] Could not pause: {}", e);
            }
        }
    }

    /// Feed a raw fix. Returns `None` when not tracking.
    pub fn on_location(&mut self, fix: &GpsFix) -> Option<FixVerdict> {
        if self.ride.state() != RideState::Tracking {
            return None;
        }
        let verdict = self.location.accept(fix);
        if verdict.is_accepted() {
            self.ride.add_fix(fix);
        }
        Some(verdict)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Start a new ride. Requires location permission.
    pub fn start_ride(&mut self, now: i64) -> Result<String> {
        self.location.require_permission()?;
        let ride_id = self.ride.start(now)?.to_string();
        self.location.reset();
        self.new_miles.reset();
        Ok(ride_id)
    }

    pub fn pause_ride(&mut self, now: i64) -> Result<()> {
        self.ride.pause(now)?;
        self.location.reset();
        Ok(())
    }

    pub fn resume_ride(&mut self, now: i64) -> Result<()> {
        self.location.require_permission()?;
        self.ride.resume(now)?;
        self.location.reset();
        Ok(())
    }

    /// Discard the current ride without saving it.
    pub fn cancel_ride(&mut self) -> Result<()> {
        self.ride.cancel()?;
        self.location.reset();
        self.new_miles.reset();
        Ok(())
    }

    pub fn snapshot(&self, now: i64) -> RideSnapshot {
        self.ride.snapshot(now)
    }

    // ========================================================================
    // New miles
    // ========================================================================

    /// The next reconciliation request, if one should be sent now.
    ///
    /// Periodic requests are only made while tracking. `force` is the final
    /// flush before stopping: it ignores the interval, also allows a paused
    /// ride, and closes reconciliation for this ride.
    pub fn new_miles_request(&mut self, now: i64, force: bool) -> Option<NewMilesRequest> {
        match (self.ride.state(), force) {
            (RideState::Tracking, false) => self.new_miles.poll(&self.ride, now),
            (RideState::Tracking | RideState::Paused, true) => {
                self.new_miles.take_final_request(&self.ride, now)
            }
            _ => None,
        }
    }

    /// Apply the outcome of a request made by [`Self::new_miles_request`].
    ///
    /// A success for a ride that was saved while the call was out is added to
    /// the stored ride.
    pub fn apply_new_miles(&mut self, request: &NewMilesRequest, result: Result<NewMilesResponse>) {
        let ride_id = request.ride_id.as_str();
        if self.ride.ride_id() != Some(ride_id) {
            if self.awaiting_late_miles.as_deref() == Some(ride_id) {
                self.awaiting_late_miles = None;
                self.credit_saved_ride(ride_id, result);
            } else {
                // Cancelled or replaced while the call was in flight
                debug!("[RideService] Dropping new miles result for stale ride {}", ride_id);
            }
            return;
        }
        match result {
            Ok(response) => {
                self.new_miles.complete(&mut self.ride, request, &response);
                debug!(
                    "[RideService] +{:.0}m new miles, cursor {}",
                    response.new_meters,
                    self.new_miles.cursor()
                );
            }
            Err(e) => {
                self.new_miles.abort(request);
                warn!("[RideService] New miles reconciliation failed: {}", e);
            }
        }
    }

    fn credit_saved_ride(&self, ride_id: &str, result: Result<NewMilesResponse>) {
        let response = match result {
            Ok(response) => response,
            Err(e) => {
                warn!(
                    "[RideService] Late new miles call for saved ride {} failed: {}",
                    ride_id, e
                );
                return;
            }
        };
        match lock_store(&self.store).and_then(|s| s.credit_new_miles(ride_id, &response)) {
            Ok(true) => info!(
                "[RideService] Credited {:.0}m late new miles to saved ride {}",
                response.new_meters, ride_id
            ),
            Ok(false) => debug!("[RideService] Saved ride {} is gone", ride_id),
            Err(e) => warn!(
                "[RideService] Could not credit late new miles to {}: {}",
                ride_id, e
            ),
        }
    }

    async fn reconcile(&mut self, now: i64, force: bool) {
        let Some(request) = self.new_miles_request(now, force) else {
            return;
        };
        let result = self.api.fetch_new_miles(&request).await;
        self.apply_new_miles(&request, result);
    }

    /// Periodic work while recording. Call about once a second.
    pub async fn tick(&mut self, now: i64) {
        self.reconcile(now, false).await;
    }

    // ========================================================================
    // Finishing
    // ========================================================================

    /// Flush new miles, stop, persist and detect achievements.
    ///
    /// If persisting fails the ride stays in `Finishing`; call
    /// [`Self::retry_finish`] or [`Self::cancel_ride`].
    pub async fn stop_ride(&mut self, now: i64) -> Result<StopOutcome> {
        if matches!(self.ride.state(), RideState::Tracking | RideState::Paused) {
            self.reconcile(now, true).await;
        }
        self.complete_stop(now)
    }

    /// Stop and persist without the final new-miles flush.
    pub fn complete_stop(&mut self, now: i64) -> Result<StopOutcome> {
        let finished = self.ride.stop(now)?;
        self.finish(finished, now)
    }

    /// Persist the stopped ride again after a failed [`Self::stop_ride`].
    pub fn retry_finish(&mut self, now: i64) -> Result<StopOutcome> {
        let finished = self
            .ride
            .finished_ride()
            .ok_or(RideError::InvalidTransition {
                from: self.ride.state(),
                action: "retry finish",
            })?;
        self.finish(finished, now)
    }

    fn finish(&mut self, finished: FinishedRide, now: i64) -> Result<StopOutcome> {
        {
            let mut store = lock_store(&self.store)?;
            store.save_ride(&finished, now)?;
        }

        let achievements = self.achievements_for(&finished);
        self.notify_uploads();
        self.ride.complete_finish()?;
        self.awaiting_late_miles = self
            .new_miles
            .is_in_flight()
            .then(|| finished.ride_id.clone());
        self.location.reset();
        self.new_miles.reset();

        info!(
            "[RideService] Finished ride {}: {:.0}m, {:.0}m new, {} achievements",
            finished.ride_id,
            finished.distance_meters,
            finished.new_miles_meters,
            achievements.len()
        );
        Ok(StopOutcome {
            ride_id: finished.ride_id.clone(),
            distance_meters: finished.distance_meters,
            moving_duration_ms: finished.moving_duration_ms,
            new_miles_meters: finished.new_miles_meters,
            point_count: finished.point_count() as u32,
            achievements,
        })
    }

    /// Achievements never block finishing a ride.
    fn achievements_for(&self, finished: &FinishedRide) -> Vec<Achievement> {
        let history = match lock_store(&self.store).and_then(|s| s.ride_records()) {
            Ok(history) => history,
            Err(e) => {
                warn!("[RideService] Could not load ride history: {}", e);
                return Vec::new();
            }
        };
        let record = RideRecord {
            ride_id: finished.ride_id.clone(),
            timestamp: finished.started_at,
            distance_meters: finished.distance_meters,
            moving_duration_ms: finished.moving_duration_ms,
            new_miles_meters: finished.new_miles_meters,
            max_speed_mps: finished.max_speed_mps,
        };
        detect_achievements(&record, &history)
    }

    // ========================================================================
    // Stored rides
    // ========================================================================

    pub fn list_rides(&self) -> Result<Vec<StoredRide>> {
        lock_store(&self.store)?.list_rides()
    }

    pub fn get_ride(&self, ride_id: &str) -> Result<Option<StoredRide>> {
        lock_store(&self.store)?.get_ride(ride_id)
    }

    pub fn delete_ride(&self, ride_id: &str) -> Result<bool> {
        lock_store(&self.store)?.delete_ride(ride_id)
    }

    pub fn stats(&self) -> Result<RideStoreStats> {
        lock_store(&self.store)?.stats()
    }

    pub fn rides_in_viewport(&self, viewport: &Bounds) -> Result<Vec<String>> {
        Ok(lock_store(&self.store)?.query_viewport(viewport))
    }

    /// Put a failed upload back in the queue.
    pub fn retry_failed_upload(&self, ride_id: &str, now: i64) -> Result<bool> {
        let reset = lock_store(&self.store)?.reset_failed(ride_id, now)?;
        if reset {
            info!("[RideService] Manual retry of ride {}", ride_id);
            self.notify_uploads();
        }
        Ok(reset)
    }
}
