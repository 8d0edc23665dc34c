//! Ride service integration tests: record -> pause -> resume -> stop with
//! new-miles reconciliation and persistence.

mod common;

use std::sync::Arc;

use common::{fix_at, init_test_logging, FakeApi, Op, T0};
use ride_recorder::{
    AchievementType, Config, LocationPermission, NewMilesResponse, RideError, RideService,
    RideState, RideStore, SharedStore, UploadStatus,
};

fn service_with(api: Arc<FakeApi>) -> (RideService, SharedStore) {
    init_test_logging();
    let store = RideStore::in_memory().unwrap().into_shared();
    let mut service = RideService::new(&Config::default(), store.clone(), api);
    service.set_permission(LocationPermission::Granted, T0);
    (service, store)
}

#[tokio::test]
async fn test_recorded_ride_is_saved_pending() {
    let api = Arc::new(FakeApi::with_new_meters_per_point(2.0));
    let (mut service, store) = service_with(api.clone());

    let ride_id = service.start_ride(T0).unwrap();
    for i in 0..10 {
        let now = T0 + i * 1_000;
        assert!(service.on_location(&fix_at(i, now)).unwrap().is_accepted());
        service.tick(now).await;
    }

    service.pause_ride(T0 + 10_000).unwrap();
    assert!(service.on_location(&fix_at(10, T0 + 11_000)).is_none());

    service.resume_ride(T0 + 60_000).unwrap();
    for i in 0..5 {
        let now = T0 + 60_000 + i * 1_000;
        // Far from the pre-pause position; must not count as a jump
        assert!(service.on_location(&fix_at(100 + i, now)).unwrap().is_accepted());
        service.tick(now).await;
    }

    let outcome = service.stop_ride(T0 + 65_000).await.unwrap();
    assert_eq!(service.state(), RideState::NotTracking);
    assert_eq!(outcome.ride_id, ride_id);
    assert_eq!(outcome.point_count, 15);
    assert_eq!(outcome.moving_duration_ms, 15_000);
    // 13 steps of ~11.1 m, nothing across the pause
    assert!(outcome.distance_meters > 140.0 && outcome.distance_meters < 150.0);

    // Every point reconciled exactly once, including the final flush
    assert_eq!(api.new_miles_points(), 15);
    assert!((outcome.new_miles_meters - 30.0).abs() < 1e-9);
    {
        let requests = api.new_miles_requests.lock().unwrap();
        assert!(requests[1].anchor.is_some());
        // First request after resume starts a new segment
        assert_eq!(requests[4].points[0].segment, 1);
        assert!(requests[4].anchor.is_none());
    }

    assert!(outcome
        .achievements
        .iter()
        .any(|a| a.achievement_type == AchievementType::FirstRide));

    let store = store.lock().unwrap();
    let stored = store.get_ride(&ride_id).unwrap().unwrap();
    assert_eq!(stored.upload_status, UploadStatus::Pending);
    assert_eq!(stored.point_count, 15);
    assert_eq!(store.load_segments(&ride_id).unwrap().len(), 2);
}

#[tokio::test]
async fn test_start_requires_permission() {
    init_test_logging();
    let store = RideStore::in_memory().unwrap().into_shared();
    let mut service = RideService::new(&Config::default(), store, Arc::new(FakeApi::new()));

    assert!(matches!(
        service.start_ride(T0),
        Err(RideError::PermissionDenied)
    ));
    service.set_permission(LocationPermission::Denied, T0);
    assert!(service.start_ride(T0).is_err());
    assert_eq!(service.state(), RideState::NotTracking);

    service.set_permission(LocationPermission::Granted, T0);
    assert!(service.start_ride(T0).is_ok());
}

#[tokio::test]
async fn test_permission_revoked_pauses_ride() {
    let (mut service, _store) = service_with(Arc::new(FakeApi::new()));
    service.start_ride(T0).unwrap();

    service.set_permission(LocationPermission::Denied, T0 + 5_000);
    assert_eq!(service.state(), RideState::Paused);
    assert!(matches!(
        service.resume_ride(T0 + 6_000),
        Err(RideError::PermissionDenied)
    ));

    service.set_permission(LocationPermission::Granted, T0 + 7_000);
    service.resume_ride(T0 + 8_000).unwrap();
    assert_eq!(service.snapshot(T0 + 8_000).segment_count, 2);
}

#[tokio::test]
async fn test_new_miles_failure_resends_same_points() {
    let api = Arc::new(FakeApi::with_new_meters_per_point(1.0));
    api.fail(Op::NewMiles, None, 1);
    let (mut service, _store) = service_with(api.clone());
    service.start_ride(T0).unwrap();

    service.on_location(&fix_at(0, T0));
    service.tick(T0).await;
    assert!(api.new_miles_requests.lock().unwrap().is_empty());

    service.on_location(&fix_at(1, T0 + 1_000));
    service.tick(T0 + 1_000).await;
    service.on_location(&fix_at(2, T0 + 2_000));
    service.tick(T0 + 3_000).await;

    let requests = api.new_miles_requests.lock().unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].points.len(), 3);
    assert_eq!(requests[0].points[0].timestamp, T0);
    assert_eq!(service.snapshot(T0 + 3_000).new_miles_meters, 3.0);
}

#[tokio::test]
async fn test_no_reconciliation_while_paused() {
    let api = Arc::new(FakeApi::new());
    let (mut service, _store) = service_with(api.clone());
    service.start_ride(T0).unwrap();
    service.on_location(&fix_at(0, T0));
    service.pause_ride(T0 + 1_000).unwrap();

    service.tick(T0 + 10_000).await;
    assert_eq!(api.new_miles_points(), 0);

    service.stop_ride(T0 + 20_000).await.unwrap();
    assert_eq!(api.new_miles_points(), 1);
}

#[tokio::test]
async fn test_save_failure_keeps_ride_finishing() {
    let api = Arc::new(FakeApi::new());
    let (mut service, store) = service_with(api);
    service.start_ride(T0).unwrap();
    service.on_location(&fix_at(0, T0));
    service.on_location(&fix_at(1, T0 + 1_000));

    // Poison the store lock so persisting fails
    let poisoner = store.clone();
    let _ = std::thread::spawn(move || {
        let _guard = poisoner.lock().unwrap();
        panic!("poison the store");
    })
    .join();

    assert!(service.stop_ride(T0 + 2_000).await.is_err());
    assert_eq!(service.state(), RideState::Finishing);
    assert!(service.start_ride(T0 + 3_000).is_err());

    store.clear_poison();
    let outcome = service.retry_finish(T0 + 4_000).unwrap();
    assert_eq!(outcome.point_count, 2);
    assert_eq!(service.state(), RideState::NotTracking);
    assert_eq!(store.lock().unwrap().ride_count().unwrap(), 1);

    // Nothing left to finish
    assert!(service.retry_finish(T0 + 5_000).is_err());
}

#[tokio::test]
async fn test_cancel_discards_ride() {
    let (mut service, store) = service_with(Arc::new(FakeApi::new()));
    service.start_ride(T0).unwrap();
    service.on_location(&fix_at(0, T0));
    service.cancel_ride().unwrap();

    assert_eq!(service.state(), RideState::NotTracking);
    assert!(store.lock().unwrap().list_rides().unwrap().is_empty());
    assert!(service.cancel_ride().is_err());
}

#[tokio::test]
async fn test_stale_new_miles_result_is_dropped() {
    let (mut service, _store) = service_with(Arc::new(FakeApi::new()));
    service.start_ride(T0).unwrap();
    service.on_location(&fix_at(0, T0));
    let request = service.new_miles_request(T0, false).unwrap();

    service.cancel_ride().unwrap();
    service.start_ride(T0 + 10_000).unwrap();
    service.apply_new_miles(
        &request,
        Ok(NewMilesResponse {
            new_meters: 500.0,
            total_new_meters: None,
        }),
    );
    assert_eq!(service.snapshot(T0 + 10_000).new_miles_meters, 0.0);
}

#[tokio::test]
async fn test_new_miles_answered_after_stop_reach_saved_ride() {
    let api = Arc::new(FakeApi::with_new_meters_per_point(1.0));
    let (mut service, store) = service_with(api.clone());
    let ride_id = service.start_ride(T0).unwrap();
    for i in 0..3 {
        service.on_location(&fix_at(i, T0 + i * 1_000));
    }
    // A periodic call goes out and is still unanswered when the rider stops
    let pending = service.new_miles_request(T0 + 3_000, false).unwrap();
    assert_eq!(pending.points.len(), 3);
    service.on_location(&fix_at(3, T0 + 3_200));

    let outcome = service.stop_ride(T0 + 3_500).await.unwrap();
    assert_eq!(service.state(), RideState::NotTracking);
    // The final flush only carried the point after the pending batch
    {
        let requests = api.new_miles_requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].points.len(), 1);
        assert_eq!(requests[0].points[0].timestamp, T0 + 3_200);
    }
    assert_eq!(outcome.new_miles_meters, 1.0);

    service.apply_new_miles(
        &pending,
        Ok(NewMilesResponse {
            new_meters: 30.0,
            total_new_meters: None,
        }),
    );
    let stored = store.lock().unwrap().get_ride(&ride_id).unwrap().unwrap();
    assert_eq!(stored.new_miles_meters, 31.0);

    // Only credited once
    service.apply_new_miles(
        &pending,
        Ok(NewMilesResponse {
            new_meters: 30.0,
            total_new_meters: None,
        }),
    );
    let stored = store.lock().unwrap().get_ride(&ride_id).unwrap().unwrap();
    assert_eq!(stored.new_miles_meters, 31.0);
}

#[tokio::test]
async fn test_saved_ride_survives_reopen() {
    init_test_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rides.db");
    let path = path.to_str().unwrap();

    let ride_id = {
        let store = RideStore::new(path).unwrap().into_shared();
        let mut service = RideService::new(&Config::default(), store, Arc::new(FakeApi::new()));
        service.set_permission(LocationPermission::Granted, T0);
        let ride_id = service.start_ride(T0).unwrap();
        for i in 0..4 {
            service.on_location(&fix_at(i, T0 + i * 1_000));
        }
        service.stop_ride(T0 + 4_000).await.unwrap();
        ride_id
    };

    let store = RideStore::new(path).unwrap();
    let rides = store.list_rides().unwrap();
    assert_eq!(rides.len(), 1);
    assert_eq!(rides[0].ride_id, ride_id);
    assert_eq!(rides[0].upload_status, UploadStatus::Pending);
    assert_eq!(store.load_ride(&ride_id).unwrap().point_count(), 4);
}
