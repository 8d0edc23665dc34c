//! # Ride Store
//!
//! Durable SQLite storage for finished rides.
//!
//! ## Layout
//!
//! 1. **`rides`**: one row per ride with summary stats, bounds and the
//!    upload bookkeeping (status, retry count, next attempt, remote id and
//!    how many point chunks the server already has).
//! 2. **`ride_segments`**: one row per segment, fixes stored as a MessagePack
//!    blob. Only loaded when a ride is uploaded or opened in detail.
//! 3. **In-memory R-tree** of ride bounds for map viewport queries
//!    (the "traveled" overlay).
//!
//! The schema is versioned with `rusqlite_migration`.

use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, info, warn};
use rstar::{RTree, RTreeObject, AABB};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row};
use rusqlite_migration::{Migrations, M};
use serde::{Deserialize, Serialize};

use crate::achievements::RideRecord;
use crate::new_miles::NewMilesResponse;
use crate::ride_state::{FinishedRide, Segment};
use crate::{Bounds, GpsFix, OptionExt, Result, RideError, UploadStatus};

/// Store shared between the ride service and the upload monitor.
pub type SharedStore = Arc<Mutex<RideStore>>;

/// Lock a shared store, turning a poisoned lock into an error.
pub fn lock_store(store: &SharedStore) -> Result<MutexGuard<'_, RideStore>> {
    store.lock().map_err(|_| RideError::Internal {
        message: "Ride store lock poisoned".to_string(),
    })
}

// ============================================================================
// Types
// ============================================================================

/// A persisted ride without its points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct StoredRide {
    pub ride_id: String,
    pub started_at: i64,
    pub ended_at: i64,
    pub moving_duration_ms: i64,
    pub distance_meters: f64,
    pub max_speed_mps: f64,
    pub new_miles_meters: f64,
    pub point_count: u32,
    pub bounds: Option<Bounds>,
    pub upload_status: UploadStatus,
    /// Failed attempts since the last success or manual reset
    pub retry_count: u32,
    /// Unix ms before which the upload monitor leaves the ride alone
    pub next_attempt_at: i64,
    pub last_error: Option<String>,
    /// Server id, set once the ride was created remotely
    pub remote_id: Option<String>,
    /// Point chunks the server has acknowledged
    pub chunks_uploaded: u32,
    pub uploaded_at: Option<i64>,
}

/// Aggregate numbers for the profile screen.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct RideStoreStats {
    pub ride_count: u32,
    pub total_distance_meters: f64,
    pub total_new_miles_meters: f64,
    pub total_moving_duration_ms: i64,
    pub pending_count: u32,
    pub uploading_count: u32,
    pub uploaded_count: u32,
    pub failed_count: u32,
}

/// Bounds wrapper for R-tree spatial indexing.
#[derive(Debug, Clone)]
struct RideBoundsEntry {
    ride_id: String,
    bounds: Bounds,
}

impl RTreeObject for RideBoundsEntry {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_corners(
            [self.bounds.min_lng, self.bounds.min_lat],
            [self.bounds.max_lng, self.bounds.max_lat],
        )
    }
}

impl ToSql for UploadStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for UploadStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: RideError| FromSqlError::Other(e.to_string().into()))
    }
}

// ============================================================================
// Schema
// ============================================================================

fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        M::up(
            r#"
            CREATE TABLE rides (
                id TEXT PRIMARY KEY,
                started_at INTEGER NOT NULL,
                ended_at INTEGER NOT NULL,
                moving_duration_ms INTEGER NOT NULL,
                distance_meters REAL NOT NULL,
                max_speed_mps REAL NOT NULL,
                new_miles_meters REAL NOT NULL,
                point_count INTEGER NOT NULL,
                min_lat REAL,
                max_lat REAL,
                min_lng REAL,
                max_lng REAL,
                upload_status TEXT NOT NULL DEFAULT 'pending',
                retry_count INTEGER NOT NULL DEFAULT 0,
                next_attempt_at INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                remote_id TEXT,
                chunks_uploaded INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER DEFAULT (strftime('%s', 'now'))
            );

            CREATE TABLE ride_segments (
                ride_id TEXT NOT NULL,
                segment_index INTEGER NOT NULL,
                started_at INTEGER NOT NULL,
                ended_at INTEGER,
                distance_meters REAL NOT NULL,
                fixes BLOB NOT NULL,
                PRIMARY KEY (ride_id, segment_index),
                FOREIGN KEY (ride_id) REFERENCES rides(id) ON DELETE CASCADE
            );

            CREATE INDEX idx_rides_upload ON rides(upload_status, next_attempt_at);
            CREATE INDEX idx_rides_started ON rides(started_at);
            "#,
        ),
        M::up("ALTER TABLE rides ADD COLUMN uploaded_at INTEGER;"),
    ])
}

const RIDE_COLUMNS: &str = "id, started_at, ended_at, moving_duration_ms, distance_meters,
     max_speed_mps, new_miles_meters, point_count, min_lat, max_lat, min_lng, max_lng,
     upload_status, retry_count, next_attempt_at, last_error, remote_id, chunks_uploaded,
     uploaded_at";

fn row_to_ride(row: &Row<'_>) -> rusqlite::Result<StoredRide> {
    let min_lat: Option<f64> = row.get(8)?;
    let max_lat: Option<f64> = row.get(9)?;
    let min_lng: Option<f64> = row.get(10)?;
    let max_lng: Option<f64> = row.get(11)?;
    let bounds = match (min_lat, max_lat, min_lng, max_lng) {
        (Some(min_lat), Some(max_lat), Some(min_lng), Some(max_lng)) => Some(Bounds {
            min_lat,
            max_lat,
            min_lng,
            max_lng,
        }),
        _ => None,
    };

    Ok(StoredRide {
        ride_id: row.get(0)?,
        started_at: row.get(1)?,
        ended_at: row.get(2)?,
        moving_duration_ms: row.get(3)?,
        distance_meters: row.get(4)?,
        max_speed_mps: row.get(5)?,
        new_miles_meters: row.get(6)?,
        point_count: row.get(7)?,
        bounds,
        upload_status: row.get(12)?,
        retry_count: row.get(13)?,
        next_attempt_at: row.get(14)?,
        last_error: row.get(15)?,
        remote_id: row.get(16)?,
        chunks_uploaded: row.get(17)?,
        uploaded_at: row.get(18)?,
    })
}

// ============================================================================
// Ride Store
// ============================================================================

/// SQLite-backed ride storage with an in-memory spatial index.
pub struct RideStore {
    db: Connection,
    db_path: String,
    spatial_index: RTree<RideBoundsEntry>,
}

impl RideStore {
    /// Open (or create) the store at `db_path` and bring the schema up to date.
    pub fn new(db_path: &str) -> Result<Self> {
        let mut db = Connection::open(db_path)?;
        db.pragma_update(None, "foreign_keys", "ON")?;
        migrations().to_latest(&mut db)?;

        let mut store = Self {
            db,
            db_path: db_path.to_string(),
            spatial_index: RTree::new(),
        };
        store.rebuild_spatial_index()?;
        info!(
            "[RideStore] Opened {} ({} rides indexed)",
            store.db_path,
            store.spatial_index.size()
        );
        Ok(store)
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        Self::new(":memory:")
    }

    pub fn into_shared(self) -> SharedStore {
        Arc::new(Mutex::new(self))
    }

    pub fn db_path(&self) -> &str {
        &self.db_path
    }

    fn rebuild_spatial_index(&mut self) -> Result<()> {
        let mut stmt = self.db.prepare(
            "SELECT id, min_lat, max_lat, min_lng, max_lng FROM rides
             WHERE min_lat IS NOT NULL",
        )?;
        let entries: Vec<RideBoundsEntry> = stmt
            .query_map([], |row| {
                Ok(RideBoundsEntry {
                    ride_id: row.get(0)?,
                    bounds: Bounds {
                        min_lat: row.get(1)?,
                        max_lat: row.get(2)?,
                        min_lng: row.get(3)?,
                        max_lng: row.get(4)?,
                    },
                })
            })?
            .collect::<rusqlite::Result<_>>()?;
        drop(stmt);

        self.spatial_index = RTree::bulk_load(entries);
        Ok(())
    }

    // ========================================================================
    // Rides
    // ========================================================================

    /// Persist a finished ride with status `pending`.
    ///
    /// Returns `false` without touching anything if the ride is already stored.
    pub fn save_ride(&mut self, ride: &FinishedRide, now: i64) -> Result<bool> {
        let bounds = ride.bounds();
        let tx = self.db.transaction()?;

        let exists: bool = tx
            .query_row("SELECT 1 FROM rides WHERE id = ?", [&ride.ride_id], |_| Ok(true))
            .optional()?
            .unwrap_or(false);
        if exists {
            debug!("[RideStore] Ride {} already stored", ride.ride_id);
            return Ok(false);
        }

        tx.execute(
            "INSERT INTO rides (id, started_at, ended_at, moving_duration_ms, distance_meters,
                 max_speed_mps, new_miles_meters, point_count, min_lat, max_lat, min_lng, max_lng,
                 upload_status, next_attempt_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                ride.ride_id,
                ride.started_at,
                ride.ended_at,
                ride.moving_duration_ms,
                ride.distance_meters,
                ride.max_speed_mps,
                ride.new_miles_meters,
                ride.point_count() as u32,
                bounds.map(|b| b.min_lat),
                bounds.map(|b| b.max_lat),
                bounds.map(|b| b.min_lng),
                bounds.map(|b| b.max_lng),
                UploadStatus::Pending,
                now,
            ],
        )?;

        {
            let mut stmt = tx.prepare(
                "INSERT INTO ride_segments
                    (ride_id, segment_index, started_at, ended_at, distance_meters, fixes)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for (index, segment) in ride.segments.iter().enumerate() {
                let blob = rmp_serde::to_vec(&segment.fixes)?;
                stmt.execute(params![
                    ride.ride_id,
                    index as u32,
                    segment.started_at,
                    segment.ended_at,
                    segment.distance_meters,
                    blob,
                ])?;
            }
        }

        tx.commit()?;

        if let Some(bounds) = bounds {
            self.spatial_index.insert(RideBoundsEntry {
                ride_id: ride.ride_id.clone(),
                bounds,
            });
        }

        info!(
            "[RideStore] Saved ride {} ({} segments, {} points, {:.0}m)",
            ride.ride_id,
            ride.segments.len(),
            ride.point_count(),
            ride.distance_meters
        );
        Ok(true)
    }

    pub fn get_ride(&self, ride_id: &str) -> Result<Option<StoredRide>> {
        let sql = format!("SELECT {} FROM rides WHERE id = ?", RIDE_COLUMNS);
        Ok(self
            .db
            .query_row(&sql, [ride_id], row_to_ride)
            .optional()?)
    }

    /// All rides, newest first.
    pub fn list_rides(&self) -> Result<Vec<StoredRide>> {
        let sql = format!("SELECT {} FROM rides ORDER BY started_at DESC", RIDE_COLUMNS);
        let mut stmt = self.db.prepare(&sql)?;
        let rides = stmt
            .query_map([], row_to_ride)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rides)
    }

    pub fn ride_count(&self) -> Result<u32> {
        Ok(self
            .db
            .query_row("SELECT COUNT(*) FROM rides", [], |row| row.get(0))?)
    }

    /// Segments of a ride in recording order.
    pub fn load_segments(&self, ride_id: &str) -> Result<Vec<Segment>> {
        let mut stmt = self.db.prepare(
            "SELECT started_at, ended_at, distance_meters, fixes FROM ride_segments
             WHERE ride_id = ? ORDER BY segment_index",
        )?;
        let rows = stmt
            .query_map([ride_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Option<i64>>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, Vec<u8>>(3)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(started_at, ended_at, distance_meters, blob)| {
                let fixes: Vec<GpsFix> = rmp_serde::from_slice(&blob)?;
                Ok(Segment {
                    started_at,
                    ended_at,
                    fixes,
                    distance_meters,
                })
            })
            .collect()
    }

    /// Rebuild the full ride (stats plus points) for upload.
    pub fn load_ride(&self, ride_id: &str) -> Result<FinishedRide> {
        let stored = self.get_ride(ride_id)?.ok_or_not_found(ride_id)?;
        let segments = self.load_segments(ride_id)?;
        Ok(FinishedRide {
            ride_id: stored.ride_id,
            started_at: stored.started_at,
            ended_at: stored.ended_at,
            moving_duration_ms: stored.moving_duration_ms,
            distance_meters: stored.distance_meters,
            max_speed_mps: stored.max_speed_mps,
            new_miles_meters: stored.new_miles_meters,
            segments,
        })
    }

    /// Add new-miles distance confirmed after the ride was saved.
    ///
    /// A service total never lowers the stored value. Returns whether the
    /// ride exists.
    pub fn credit_new_miles(&self, ride_id: &str, response: &NewMilesResponse) -> Result<bool> {
        let changed = match response.total_new_meters {
            Some(total) if total.is_finite() && total >= 0.0 => self.db.execute(
                "UPDATE rides SET new_miles_meters = MAX(new_miles_meters, ?1) WHERE id = ?2",
                params![total, ride_id],
            )?,
            _ => {
                let added = if response.new_meters.is_finite() {
                    response.new_meters.max(0.0)
                } else {
                    0.0
                };
                self.db.execute(
                    "UPDATE rides SET new_miles_meters = new_miles_meters + ?1 WHERE id = ?2",
                    params![added, ride_id],
                )?
            }
        };
        Ok(changed > 0)
    }

    /// Delete a ride and its segments. Returns whether it existed.
    pub fn delete_ride(&mut self, ride_id: &str) -> Result<bool> {
        let deleted = self.db.execute("DELETE FROM rides WHERE id = ?", [ride_id])?;
        if deleted > 0 {
            self.rebuild_spatial_index()?;
            info!("[RideStore] Deleted ride {}", ride_id);
        }
        Ok(deleted > 0)
    }

    // ========================================================================
    // Upload bookkeeping
    // ========================================================================

    /// Pending rides whose next attempt time has come, oldest first.
    pub fn pending_uploads(&self, now: i64) -> Result<Vec<StoredRide>> {
        let sql = format!(
            "SELECT {} FROM rides WHERE upload_status = ?1 AND next_attempt_at <= ?2
             ORDER BY started_at",
            RIDE_COLUMNS
        );
        let mut stmt = self.db.prepare(&sql)?;
        let rides = stmt
            .query_map(params![UploadStatus::Pending, now], row_to_ride)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rides)
    }

    /// Earliest next attempt among pending rides.
    pub fn next_attempt_at(&self) -> Result<Option<i64>> {
        Ok(self.db.query_row(
            "SELECT MIN(next_attempt_at) FROM rides WHERE upload_status = ?",
            [UploadStatus::Pending],
            |row| row.get(0),
        )?)
    }

    /// Claim a pending ride for upload. Returns `false` if it was not pending.
    pub fn mark_uploading(&self, ride_id: &str) -> Result<bool> {
        let changed = self.db.execute(
            "UPDATE rides SET upload_status = ?1 WHERE id = ?2 AND upload_status = ?3",
            params![UploadStatus::Uploading, ride_id, UploadStatus::Pending],
        )?;
        Ok(changed > 0)
    }

    pub fn record_remote_id(&self, ride_id: &str, remote_id: &str) -> Result<()> {
        self.db.execute(
            "UPDATE rides SET remote_id = ?1 WHERE id = ?2",
            params![remote_id, ride_id],
        )?;
        Ok(())
    }

    pub fn record_chunk_progress(&self, ride_id: &str, chunks_uploaded: u32) -> Result<()> {
        self.db.execute(
            "UPDATE rides SET chunks_uploaded = ?1 WHERE id = ?2",
            params![chunks_uploaded, ride_id],
        )?;
        Ok(())
    }

    pub fn mark_uploaded(&self, ride_id: &str, now: i64) -> Result<()> {
        self.db.execute(
            "UPDATE rides SET upload_status = ?1, last_error = NULL, uploaded_at = ?2
             WHERE id = ?3",
            params![UploadStatus::Uploaded, now, ride_id],
        )?;
        Ok(())
    }

    /// Put the ride back to `pending` with a later attempt time.
    pub fn schedule_retry(
        &self,
        ride_id: &str,
        retry_count: u32,
        next_attempt_at: i64,
        error: &str,
    ) -> Result<()> {
        self.db.execute(
            "UPDATE rides SET upload_status = ?1, retry_count = ?2, next_attempt_at = ?3,
                 last_error = ?4
             WHERE id = ?5",
            params![UploadStatus::Pending, retry_count, next_attempt_at, error, ride_id],
        )?;
        Ok(())
    }

    /// Give up on automatic uploads for this ride.
    pub fn mark_failed(&self, ride_id: &str, retry_count: u32, error: &str) -> Result<()> {
        self.db.execute(
            "UPDATE rides SET upload_status = ?1, retry_count = ?2, last_error = ?3 WHERE id = ?4",
            params![UploadStatus::Failed, retry_count, error, ride_id],
        )?;
        warn!("[RideStore] Ride {} upload failed: {}", ride_id, error);
        Ok(())
    }

    /// Manual retry of a failed ride. Keeps remote progress so the upload resumes.
    pub fn reset_failed(&self, ride_id: &str, now: i64) -> Result<bool> {
        let changed = self.db.execute(
            "UPDATE rides SET upload_status = ?1, retry_count = 0, next_attempt_at = ?2
             WHERE id = ?3 AND upload_status = ?4",
            params![UploadStatus::Pending, now, ride_id, UploadStatus::Failed],
        )?;
        Ok(changed > 0)
    }

    /// Hand one claimed ride back to the queue without touching its retry state.
    pub fn release_claim(&self, ride_id: &str) -> Result<bool> {
        let changed = self.db.execute(
            "UPDATE rides SET upload_status = ?1 WHERE id = ?2 AND upload_status = ?3",
            params![UploadStatus::Pending, ride_id, UploadStatus::Uploading],
        )?;
        Ok(changed > 0)
    }

    /// Rides left in `uploading` by a crash or kill go back to `pending`.
    pub fn recover_interrupted(&self) -> Result<usize> {
        let changed = self.db.execute(
            "UPDATE rides SET upload_status = ?1 WHERE upload_status = ?2",
            params![UploadStatus::Pending, UploadStatus::Uploading],
        )?;
        if changed > 0 {
            info!("[RideStore] Recovered {} interrupted uploads", changed);
        }
        Ok(changed)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Ride history in the shape used by achievement detection.
    pub fn ride_records(&self) -> Result<Vec<RideRecord>> {
        let mut stmt = self.db.prepare(
            "SELECT id, started_at, distance_meters, moving_duration_ms, new_miles_meters,
                    max_speed_mps
             FROM rides ORDER BY started_at",
        )?;
        let records = stmt
            .query_map([], |row| {
                Ok(RideRecord {
                    ride_id: row.get(0)?,
                    timestamp: row.get(1)?,
                    distance_meters: row.get(2)?,
                    moving_duration_ms: row.get(3)?,
                    new_miles_meters: row.get(4)?,
                    max_speed_mps: row.get(5)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    pub fn stats(&self) -> Result<RideStoreStats> {
        let mut stats = self.db.query_row(
            "SELECT COUNT(*), COALESCE(SUM(distance_meters), 0), COALESCE(SUM(new_miles_meters), 0),
                    COALESCE(SUM(moving_duration_ms), 0)
             FROM rides",
            [],
            |row| {
                Ok(RideStoreStats {
                    ride_count: row.get(0)?,
                    total_distance_meters: row.get(1)?,
                    total_new_miles_meters: row.get(2)?,
                    total_moving_duration_ms: row.get(3)?,
                    ..RideStoreStats::default()
                })
            },
        )?;

        let mut stmt = self
            .db
            .prepare("SELECT upload_status, COUNT(*) FROM rides GROUP BY upload_status")?;
        let counts = stmt
            .query_map([], |row| {
                Ok((row.get::<_, UploadStatus>(0)?, row.get::<_, u32>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        for (status, count) in counts {
            match status {
                UploadStatus::Pending => stats.pending_count = count,
                UploadStatus::Uploading => stats.uploading_count = count,
                UploadStatus::Uploaded => stats.uploaded_count = count,
                UploadStatus::Failed => stats.failed_count = count,
            }
        }
        Ok(stats)
    }

    /// Ids of rides whose bounds intersect the viewport.
    pub fn query_viewport(&self, viewport: &Bounds) -> Vec<String> {
        let envelope = AABB::from_corners(
            [viewport.min_lng, viewport.min_lat],
            [viewport.max_lng, viewport.max_lat],
        );
        self.spatial_index
            .locate_in_envelope_intersecting(&envelope)
            .map(|e| e.ride_id.clone())
            .collect()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RideStateStore;

    const T0: i64 = 1_700_000_000_000;

    fn recorded_ride(lat0: f64) -> FinishedRide {
        let mut ride = RideStateStore::new();
        ride.start(T0).unwrap();
        for i in 0..10 {
            ride.add_fix(&GpsFix::new(lat0 + i as f64 * 0.0005, -0.12, T0 + i * 5_000));
        }
        ride.pause(T0 + 50_000).unwrap();
        ride.resume(T0 + 60_000).unwrap();
        for i in 12..15 {
            ride.add_fix(&GpsFix::new(lat0 + i as f64 * 0.0005, -0.12, T0 + i * 5_000));
        }
        ride.stop(T0 + 75_000).unwrap()
    }

    #[test]
    fn test_save_and_load() {
        let mut store = RideStore::in_memory().unwrap();
        let ride = recorded_ride(51.5);
        assert!(store.save_ride(&ride, T0).unwrap());

        let stored = store.get_ride(&ride.ride_id).unwrap().unwrap();
        assert_eq!(stored.upload_status, UploadStatus::Pending);
        assert_eq!(stored.point_count, 13);
        assert_eq!(stored.retry_count, 0);
        assert!(stored.bounds.is_some());

        let loaded = store.load_ride(&ride.ride_id).unwrap();
        assert_eq!(loaded, ride);
    }

    #[test]
    fn test_save_is_idempotent() {
        let mut store = RideStore::in_memory().unwrap();
        let ride = recorded_ride(51.5);
        assert!(store.save_ride(&ride, T0).unwrap());
        assert!(!store.save_ride(&ride, T0).unwrap());
        assert_eq!(store.ride_count().unwrap(), 1);
        assert_eq!(store.load_segments(&ride.ride_id).unwrap().len(), 2);
    }

    #[test]
    fn test_upload_bookkeeping() {
        let mut store = RideStore::in_memory().unwrap();
        let ride = recorded_ride(51.5);
        store.save_ride(&ride, T0).unwrap();
        let id = ride.ride_id.as_str();

        assert_eq!(store.pending_uploads(T0).unwrap().len(), 1);
        assert!(store.mark_uploading(id).unwrap());
        assert!(!store.mark_uploading(id).unwrap());
        assert!(store.pending_uploads(T0).unwrap().is_empty());

        store.schedule_retry(id, 1, T0 + 5_000, "HTTP error (503)").unwrap();
        assert_eq!(store.next_attempt_at().unwrap(), Some(T0 + 5_000));
        assert!(store.pending_uploads(T0 + 1_000).unwrap().is_empty());
        let due = store.pending_uploads(T0 + 5_000).unwrap();
        assert_eq!(due[0].retry_count, 1);
        assert_eq!(due[0].last_error.as_deref(), Some("HTTP error (503)"));

        store.mark_failed(id, 6, "gave up").unwrap();
        assert!(store.pending_uploads(T0 + 1_000_000).unwrap().is_empty());
        assert!(store.reset_failed(id, T0 + 2_000_000).unwrap());
        let stored = store.get_ride(id).unwrap().unwrap();
        assert_eq!(stored.upload_status, UploadStatus::Pending);
        assert_eq!(stored.retry_count, 0);

        store.record_remote_id(id, "remote-1").unwrap();
        store.record_chunk_progress(id, 2).unwrap();
        store.mark_uploaded(id, T0 + 3_000_000).unwrap();
        let stored = store.get_ride(id).unwrap().unwrap();
        assert_eq!(stored.upload_status, UploadStatus::Uploaded);
        assert_eq!(stored.remote_id.as_deref(), Some("remote-1"));
        assert_eq!(stored.chunks_uploaded, 2);
        assert!(stored.last_error.is_none());
        assert_eq!(stored.uploaded_at, Some(T0 + 3_000_000));
    }

    #[test]
    fn test_recover_interrupted() {
        let mut store = RideStore::in_memory().unwrap();
        let ride = recorded_ride(51.5);
        store.save_ride(&ride, T0).unwrap();
        store.mark_uploading(&ride.ride_id).unwrap();
        assert_eq!(store.recover_interrupted().unwrap(), 1);
        assert_eq!(store.pending_uploads(T0).unwrap().len(), 1);

        assert!(!store.release_claim(&ride.ride_id).unwrap());
        store.mark_uploading(&ride.ride_id).unwrap();
        assert!(store.release_claim(&ride.ride_id).unwrap());
        assert_eq!(store.pending_uploads(T0).unwrap().len(), 1);
    }

    #[test]
    fn test_credit_new_miles() {
        let mut store = RideStore::in_memory().unwrap();
        let ride = recorded_ride(51.5);
        store.save_ride(&ride, T0).unwrap();
        let id = ride.ride_id.as_str();
        let new_miles = |id: &str| store.get_ride(id).unwrap().unwrap().new_miles_meters;

        let added = NewMilesResponse {
            new_meters: 30.0,
            total_new_meters: None,
        };
        assert!(store.credit_new_miles(id, &added).unwrap());
        assert_eq!(new_miles(id), 30.0);

        // A lower service total does not undo what was credited
        let total = |meters| NewMilesResponse {
            new_meters: 0.0,
            total_new_meters: Some(meters),
        };
        store.credit_new_miles(id, &total(20.0)).unwrap();
        assert_eq!(new_miles(id), 30.0);
        store.credit_new_miles(id, &total(45.0)).unwrap();
        assert_eq!(new_miles(id), 45.0);

        assert!(!store.credit_new_miles("missing", &added).unwrap());
    }

    #[test]
    fn test_viewport_query_and_delete() {
        let mut store = RideStore::in_memory().unwrap();
        let london = recorded_ride(51.5);
        let far = recorded_ride(40.7);
        store.save_ride(&london, T0).unwrap();
        store.save_ride(&far, T0).unwrap();

        let viewport = Bounds {
            min_lat: 51.4,
            max_lat: 51.6,
            min_lng: -0.2,
            max_lng: -0.1,
        };
        assert_eq!(store.query_viewport(&viewport), vec![london.ride_id.clone()]);

        assert!(store.delete_ride(&london.ride_id).unwrap());
        assert!(!store.delete_ride(&london.ride_id).unwrap());
        assert!(store.query_viewport(&viewport).is_empty());
        assert!(store.load_segments(&london.ride_id).unwrap().is_empty());
    }

    #[test]
    fn test_stats() {
        let mut store = RideStore::in_memory().unwrap();
        let a = recorded_ride(51.5);
        let b = recorded_ride(51.6);
        store.save_ride(&a, T0).unwrap();
        store.save_ride(&b, T0).unwrap();
        store.mark_uploading(&b.ride_id).unwrap();
        store.mark_uploaded(&b.ride_id, T0).unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.ride_count, 2);
        assert_eq!(stats.pending_count, 1);
        assert_eq!(stats.uploaded_count, 1);
        assert!((stats.total_distance_meters - a.distance_meters - b.distance_meters).abs() < 1e-6);
        assert_eq!(store.ride_records().unwrap().len(), 2);
    }

    #[test]
    fn test_persistence_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rides.db");
        let path = path.to_str().unwrap();
        let ride = recorded_ride(51.5);

        {
            let mut store = RideStore::new(path).unwrap();
            store.save_ride(&ride, T0).unwrap();
        }

        let store = RideStore::new(path).unwrap();
        assert_eq!(store.ride_count().unwrap(), 1);
        assert_eq!(store.load_ride(&ride.ride_id).unwrap(), ride);
        let viewport = ride.bounds().unwrap();
        assert_eq!(store.query_viewport(&viewport).len(), 1);
    }
}
