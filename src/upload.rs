//! # Upload Monitor
//!
//! Delivers stored rides to the backend.
//!
//! A ride is picked up when its status is `pending` and its next attempt time
//! has passed. It is claimed (`uploading`), created remotely if it has no
//! remote id yet, its remaining point chunks are sent, and it is completed.
//! Progress (remote id, acknowledged chunks) is written after every step so an
//! interrupted upload resumes where it stopped.
//!
//! Transient failures are retried with exponential backoff:
//! `min(base * 2^(attempt - 1), max)`. After `max_retries` retries, or on the
//! first permanent error, the ride is marked `failed` and only a manual retry
//! puts it back in the queue.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::{watch, Notify};

use crate::api::{build_chunks, RideApi, RideUpload};
use crate::config::UploadConfig;
use crate::store::{lock_store, RideStore, SharedStore, StoredRide};
use crate::{now_ms, Result, RideError};

/// Delay before retry number `attempt` (1-based).
pub fn retry_delay(attempt: u32, config: &UploadConfig) -> Duration {
    let factor = 1u64
        .checked_shl(attempt.saturating_sub(1))
        .unwrap_or(u64::MAX);
    let delay_ms = config
        .base_delay_ms
        .saturating_mul(factor)
        .min(config.max_delay_ms);
    Duration::from_millis(delay_ms)
}

/// What happened to one ride during a pass.
#[derive(Debug, Clone, PartialEq)]
pub enum UploadOutcome {
    Uploaded,
    /// Transient failure, will be tried again
    RetryScheduled { attempt: u32, next_attempt_at: i64 },
    /// Gave up until a manual retry
    Failed { error: String },
    /// Another pass claimed the ride first
    Skipped,
}

/// Result of one [`UploadMonitor::process_due`] pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UploadReport {
    pub outcomes: Vec<(String, UploadOutcome)>,
}

impl UploadReport {
    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn uploaded(&self) -> usize {
        self.count(|o| matches!(o, UploadOutcome::Uploaded))
    }

    pub fn retried(&self) -> usize {
        self.count(|o| matches!(o, UploadOutcome::RetryScheduled { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, UploadOutcome::Failed { .. }))
    }

    fn count(&self, pred: impl Fn(&UploadOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|(_, o)| pred(o)).count()
    }
}

/// Background uploader for pending rides.
pub struct UploadMonitor {
    store: SharedStore,
    api: Arc<dyn RideApi>,
    config: UploadConfig,
    wake: Arc<Notify>,
    /// Rides this monitor claimed but could not hand back after a failure
    stranded: Mutex<Vec<String>>,
}

impl UploadMonitor {
    pub fn new(store: SharedStore, api: Arc<dyn RideApi>, config: UploadConfig) -> Self {
        Self {
            store,
            api,
            config,
            wake: Arc::new(Notify::new()),
            stranded: Mutex::new(Vec::new()),
        }
    }

    /// Handle that wakes the monitor loop, e.g. after a ride was saved.
    pub fn notifier(&self) -> Arc<Notify> {
        Arc::clone(&self.wake)
    }

    pub fn notify(&self) {
        self.wake.notify_one();
    }

    /// Never hold the store lock across an await.
    fn with_store<T>(&self, f: impl FnOnce(&mut RideStore) -> Result<T>) -> Result<T> {
        let mut guard = lock_store(&self.store)?;
        f(&mut *guard)
    }

    fn strand(&self, ride_id: &str) {
        if let Ok(mut stranded) = self.stranded.lock() {
            stranded.push(ride_id.to_string());
        }
    }

    /// Put rides stranded in `uploading` by an earlier pass back in the queue.
    fn release_stranded(&self) {
        let ride_ids = match self.stranded.lock() {
            Ok(mut stranded) => std::mem::take(&mut *stranded),
            Err(_) => return,
        };
        for ride_id in ride_ids {
            match self.with_store(|s| s.release_claim(&ride_id)) {
                Ok(_) => info!("[UploadMonitor] Released stranded ride {}", ride_id),
                Err(e) => {
                    warn!("[UploadMonitor] Could not release {}: {}", ride_id, e);
                    self.strand(&ride_id);
                }
            }
        }
    }

    /// Upload every ride that is due at `now`, one after another.
    pub async fn process_due(&self, now: i64) -> UploadReport {
        self.release_stranded();
        let mut report = UploadReport::default();
        let due = match self.with_store(|s| s.pending_uploads(now)) {
            Ok(due) => due,
            Err(e) => {
                warn!("[UploadMonitor] Could not read pending uploads: {}", e);
                return report;
            }
        };
        if due.is_empty() {
            return report;
        }
        debug!("[UploadMonitor] {} rides due", due.len());

        for ride in due {
            let outcome = match self.with_store(|s| s.mark_uploading(&ride.ride_id)) {
                Ok(true) => self.upload_claimed(&ride, now).await,
                Ok(false) => UploadOutcome::Skipped,
                Err(e) => {
                    warn!("[UploadMonitor] Could not claim {}: {}", ride.ride_id, e);
                    UploadOutcome::Skipped
                }
            };
            report.outcomes.push((ride.ride_id.clone(), outcome));
        }

        info!(
            "[UploadMonitor] Pass done: {} uploaded, {} retrying, {} failed",
            report.uploaded(),
            report.retried(),
            report.failed()
        );
        report
    }

    async fn upload_claimed(&self, ride: &StoredRide, now: i64) -> UploadOutcome {
        let result = match self.upload_ride(ride).await {
            Ok(()) => self.with_store(|s| s.mark_uploaded(&ride.ride_id, now)),
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {
                info!("[UploadMonitor] Uploaded ride {}", ride.ride_id);
                UploadOutcome::Uploaded
            }
            Err(e) => self.record_failure(ride, &e, now),
        }
    }

    async fn upload_ride(&self, ride: &StoredRide) -> Result<()> {
        let id = ride.ride_id.as_str();
        let full = self.with_store(|s| s.load_ride(id))?;
        let chunks = build_chunks(&full, self.config.chunk_size)?;

        let remote_id = match &ride.remote_id {
            Some(remote_id) => remote_id.clone(),
            None => {
                let upload = RideUpload::from_ride(&full, chunks.len());
                let remote_id = self.api.create_ride(&upload).await?;
                self.with_store(|s| s.record_remote_id(id, &remote_id))?;
                remote_id
            }
        };

        let start = ride.chunks_uploaded as usize;
        if start > 0 {
            debug!(
                "[UploadMonitor] Resuming {} at chunk {}/{}",
                id,
                start,
                chunks.len()
            );
        }
        for chunk in chunks.iter().skip(start) {
            self.api.upload_chunk(&remote_id, chunk).await?;
            self.with_store(|s| s.record_chunk_progress(id, chunk.index + 1))?;
        }

        self.api.complete_ride(&remote_id).await
    }

    fn record_failure(&self, ride: &StoredRide, error: &RideError, now: i64) -> UploadOutcome {
        let attempt = ride.retry_count + 1;
        let message = error.to_string();

        if !error.is_retryable() || attempt > self.config.max_retries {
            if let Err(e) = self.with_store(|s| s.mark_failed(&ride.ride_id, attempt, &message)) {
                error!("[UploadMonitor] Could not mark {} failed: {}", ride.ride_id, e);
                self.strand(&ride.ride_id);
            }
            return UploadOutcome::Failed { error: message };
        }

        let delay = retry_delay(attempt, &self.config);
        let next_attempt_at = now + delay.as_millis() as i64;
        warn!(
            "[UploadMonitor] Upload of {} failed (attempt {}), retrying in {:?}: {}",
            ride.ride_id, attempt, delay, message
        );
        if let Err(e) =
            self.with_store(|s| s.schedule_retry(&ride.ride_id, attempt, next_attempt_at, &message))
        {
            error!("[UploadMonitor] Could not schedule retry for {}: {}", ride.ride_id, e);
            self.strand(&ride.ride_id);
        }
        UploadOutcome::RetryScheduled {
            attempt,
            next_attempt_at,
        }
    }

    /// How long to sleep before the next pass.
    fn next_wait(&self, now: i64) -> Duration {
        let poll = self.config.poll_interval();
        match self.with_store(|s| s.next_attempt_at()) {
            Ok(Some(at)) if at > now => poll.min(Duration::from_millis((at - now) as u64)),
            Ok(Some(_)) => Duration::ZERO,
            _ => poll,
        }
    }

    /// Run until `shutdown` turns true or its sender is dropped.
    ///
    /// Rides left in `uploading` by a previous run are re-queued first.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("[UploadMonitor] Started");
        if let Err(e) = self.with_store(|s| s.recover_interrupted()) {
            warn!("[UploadMonitor] Could not recover interrupted uploads: {}", e);
        }

        loop {
            if *shutdown.borrow() {
                break;
            }
            self.process_due(now_ms()).await;

            // Rides still due after a pass are waiting on a failing backend; don't spin
            let wait = self.next_wait(now_ms()).max(Duration::from_millis(500));
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = self.wake.notified() => {
                    debug!("[UploadMonitor] Woken");
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("[UploadMonitor] Stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delays() {
        let config = UploadConfig::default();
        let delays: Vec<u64> = (1..=6)
            .map(|attempt| retry_delay(attempt, &config).as_secs())
            .collect();
        assert_eq!(delays, vec![5, 10, 20, 40, 60, 60]);
    }

    #[test]
    fn test_retry_delay_saturates() {
        let config = UploadConfig {
            base_delay_ms: u64::MAX / 2,
            max_delay_ms: u64::MAX,
            ..UploadConfig::default()
        };
        assert_eq!(retry_delay(200, &config), Duration::from_millis(u64::MAX));
        assert_eq!(
            retry_delay(0, &UploadConfig::default()),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn test_report_counts() {
        let report = UploadReport {
            outcomes: vec![
                ("a".into(), UploadOutcome::Uploaded),
                (
                    "b".into(),
                    UploadOutcome::RetryScheduled {
                        attempt: 1,
                        next_attempt_at: 0,
                    },
                ),
                ("c".into(), UploadOutcome::Uploaded),
                ("d".into(), UploadOutcome::Skipped),
            ],
        };
        assert_eq!(report.uploaded(), 2);
        assert_eq!(report.retried(), 1);
        assert_eq!(report.failed(), 0);
    }
}
