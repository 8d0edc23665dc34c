//! FFI bindings for mobile platforms (iOS/Android).
//!
//! UniFFI exports over a global [`RideService`] singleton. Call
//! [`ride_recorder_init`] once at app startup; every other function is a
//! no-op (returning `false`, `None` or an empty value) until then.
//!
//! Network calls never run while the service lock is held, so location
//! updates keep flowing while a new-miles request is in flight.

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use log::{info, warn};
use once_cell::sync::Lazy;
use tokio::runtime::Runtime;
use tokio::sync::watch;

use crate::api::HttpRideApi;
use crate::config::Config;
use crate::location::LocationPermission;
use crate::ride_service::{RideService, StopOutcome};
use crate::ride_state::RideSnapshot;
use crate::store::{RideStore, RideStoreStats, StoredRide};
use crate::upload::UploadMonitor;
use crate::{init_logging, now_ms, Bounds, GpsFix, RideError, RideState};

/// Global recorder instance.
static RIDE_SERVICE: Lazy<Mutex<Option<RideService>>> = Lazy::new(|| Mutex::new(None));

/// Config captured at init, used when the upload monitor is started.
static CONFIG: Lazy<Mutex<Option<Config>>> = Lazy::new(|| Mutex::new(None));

/// Runtime for the foreground HTTP calls (new miles).
static RUNTIME: Lazy<Option<Runtime>> = Lazy::new(|| {
    match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
    {
        Ok(rt) => Some(rt),
        Err(e) => {
            warn!("[RideFFI] Failed to create runtime: {}", e);
            None
        }
    }
});

struct MonitorHandle {
    shutdown: watch::Sender<bool>,
    thread: JoinHandle<()>,
}

static UPLOAD_MONITOR: Lazy<Mutex<Option<MonitorHandle>>> = Lazy::new(|| Mutex::new(None));

/// Run `f` against the global service, if initialized.
fn with_service<F, R>(f: F) -> Option<R>
where
    F: FnOnce(&mut RideService) -> R,
{
    let mut guard = RIDE_SERVICE.lock().ok()?;
    guard.as_mut().map(f)
}

/// Send the next new-miles request (forced or periodic) and apply the result.
fn reconcile_new_miles(force: bool) {
    let Some(Some((request, api))) = with_service(|s| {
        s.new_miles_request(now_ms(), force)
            .map(|request| (request, s.api()))
    }) else {
        return;
    };
    let Some(rt) = RUNTIME.as_ref() else {
        with_service(|s| {
            s.apply_new_miles(
                &request,
                Err(RideError::Internal {
                    message: "No runtime".to_string(),
                }),
            )
        });
        return;
    };

    let result = rt.block_on(api.fetch_new_miles(&request));
    with_service(|s| s.apply_new_miles(&request, result));
}

// ============================================================================
// Lifecycle
// ============================================================================

/// Open the ride database and create the recorder.
///
/// `config_json` may be empty for defaults. `RIDE_API_BASE_URL` and
/// `RIDE_API_TOKEN` override the API section.
#[uniffi::export]
pub fn ride_recorder_init(db_path: String, config_json: String) -> bool {
    init_logging();
    info!("[RideFFI] Initializing with db: {}", db_path);

    let config = match Config::from_json(&config_json) {
        Ok(config) => config.with_env_overrides(),
        Err(e) => {
            warn!("[RideFFI] Invalid config: {}", e);
            return false;
        }
    };
    let store = match RideStore::new(&db_path) {
        Ok(store) => store,
        Err(e) => {
            warn!("[RideFFI] Failed to open ride store: {}", e);
            return false;
        }
    };
    let api = match HttpRideApi::new(&config.api) {
        Ok(api) => api,
        Err(e) => {
            warn!("[RideFFI] Failed to create API client: {}", e);
            return false;
        }
    };

    let service = RideService::new(&config, store.into_shared(), Arc::new(api));
    match (RIDE_SERVICE.lock(), CONFIG.lock()) {
        (Ok(mut service_guard), Ok(mut config_guard)) => {
            *service_guard = Some(service);
            *config_guard = Some(config);
            info!("[RideFFI] Initialized successfully");
            true
        }
        _ => false,
    }
}

#[uniffi::export]
pub fn ride_recorder_is_initialized() -> bool {
    RIDE_SERVICE
        .lock()
        .map(|guard| guard.is_some())
        .unwrap_or(false)
}

// ============================================================================
// Recording
// ============================================================================

#[uniffi::export]
pub fn ride_set_location_permission(permission: LocationPermission) {
    with_service(|s| s.set_permission(permission, now_ms()));
}

/// Start recording. Returns the new ride id.
#[uniffi::export]
pub fn ride_start() -> Option<String> {
    with_service(|s| match s.start_ride(now_ms()) {
        Ok(ride_id) => Some(ride_id),
        Err(e) => {
            warn!("[RideFFI] Start failed: {}", e);
            None
        }
    })
    .flatten()
}

#[uniffi::export]
pub fn ride_pause() -> bool {
    with_service(|s| s.pause_ride(now_ms()))
        .map(|r| r.map_err(|e| warn!("[RideFFI] Pause failed: {}", e)).is_ok())
        .unwrap_or(false)
}

#[uniffi::export]
pub fn ride_resume() -> bool {
    with_service(|s| s.resume_ride(now_ms()))
        .map(|r| r.map_err(|e| warn!("[RideFFI] Resume failed: {}", e)).is_ok())
        .unwrap_or(false)
}

#[uniffi::export]
pub fn ride_cancel() -> bool {
    with_service(|s| s.cancel_ride())
        .map(|r| r.map_err(|e| warn!("[RideFFI] Cancel failed: {}", e)).is_ok())
        .unwrap_or(false)
}

/// Feed a fix from the platform. Returns whether it was recorded.
#[uniffi::export]
pub fn ride_push_location(fix: GpsFix) -> bool {
    with_service(|s| s.on_location(&fix))
        .flatten()
        .is_some_and(|verdict| verdict.is_accepted())
}

/// Periodic work; call about once a second while recording.
#[uniffi::export]
pub fn ride_tick() {
    reconcile_new_miles(false);
}

/// Stop and save the ride. `None` if stopping or saving failed; after a save
/// failure the recorder stays in `Finishing` and [`ride_retry_finish`] applies.
#[uniffi::export]
pub fn ride_stop() -> Option<StopOutcome> {
    let stoppable = with_service(|s| matches!(s.state(), RideState::Tracking | RideState::Paused))
        .unwrap_or(false);
    if !stoppable {
        return None;
    }
    reconcile_new_miles(true);

    with_service(|s| match s.complete_stop(now_ms()) {
        Ok(outcome) => Some(outcome),
        Err(e) => {
            warn!("[RideFFI] Stop failed: {}", e);
            None
        }
    })
    .flatten()
}

#[uniffi::export]
pub fn ride_retry_finish() -> Option<StopOutcome> {
    with_service(|s| match s.retry_finish(now_ms()) {
        Ok(outcome) => Some(outcome),
        Err(e) => {
            warn!("[RideFFI] Retry finish failed: {}", e);
            None
        }
    })
    .flatten()
}

#[uniffi::export]
pub fn ride_get_snapshot() -> Option<RideSnapshot> {
    with_service(|s| s.snapshot(now_ms()))
}

// ============================================================================
// Stored rides
// ============================================================================

/// All saved rides, newest first.
#[uniffi::export]
pub fn ride_list_saved() -> Vec<StoredRide> {
    with_service(|s| s.list_rides().unwrap_or_default()).unwrap_or_default()
}

#[uniffi::export]
pub fn ride_get_stats() -> Option<RideStoreStats> {
    with_service(|s| s.stats().ok()).flatten()
}

#[uniffi::export]
pub fn ride_delete(ride_id: String) -> bool {
    with_service(|s| s.delete_ride(&ride_id).unwrap_or(false)).unwrap_or(false)
}

/// Ids of saved rides visible in the map viewport.
#[uniffi::export]
pub fn ride_query_viewport(min_lat: f64, max_lat: f64, min_lng: f64, max_lng: f64) -> Vec<String> {
    let viewport = Bounds {
        min_lat,
        max_lat,
        min_lng,
        max_lng,
    };
    with_service(|s| s.rides_in_viewport(&viewport).unwrap_or_default()).unwrap_or_default()
}

/// Manually retry an upload that was marked failed.
#[uniffi::export]
pub fn ride_retry_failed_upload(ride_id: String) -> bool {
    with_service(|s| match s.retry_failed_upload(&ride_id, now_ms()) {
        Ok(reset) => reset,
        Err(e) => {
            warn!("[RideFFI] Retry of {} failed: {}", ride_id, e);
            false
        }
    })
    .unwrap_or(false)
}

// ============================================================================
// Background upload monitor
// ============================================================================

/// Start the upload monitor on its own thread and runtime.
///
/// Returns `false` if not initialized or already running.
#[uniffi::export]
pub fn ride_start_upload_monitor() -> bool {
    let Ok(mut handle_guard) = UPLOAD_MONITOR.lock() else {
        return false;
    };
    if handle_guard.is_some() {
        return false;
    }
    let upload_config = match CONFIG.lock() {
        Ok(guard) => match guard.as_ref() {
            Some(config) => config.upload.clone(),
            None => return false,
        },
        Err(_) => return false,
    };

    let Some(monitor) = with_service(|s| {
        let monitor = UploadMonitor::new(s.store(), s.api(), upload_config);
        s.set_upload_notifier(monitor.notifier());
        monitor
    }) else {
        return false;
    };

    let (shutdown, shutdown_rx) = watch::channel(false);
    let thread = std::thread::spawn(move || {
        let rt = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(rt) => rt,
            Err(e) => {
                warn!("[RideFFI] Failed to create upload runtime: {}", e);
                return;
            }
        };
        rt.block_on(monitor.run(shutdown_rx));
    });

    *handle_guard = Some(MonitorHandle { shutdown, thread });
    info!("[RideFFI] Upload monitor started");
    true
}

/// Stop the upload monitor and wait for its thread to exit.
#[uniffi::export]
pub fn ride_stop_upload_monitor() {
    let handle = match UPLOAD_MONITOR.lock() {
        Ok(mut guard) => guard.take(),
        Err(_) => None,
    };
    let Some(handle) = handle else {
        return;
    };

    with_service(|s| s.clear_upload_notifier());

    let _ = handle.shutdown.send(true);
    if handle.thread.join().is_err() {
        warn!("[RideFFI] Upload monitor thread panicked");
    }
    info!("[RideFFI] Upload monitor stopped");
}
