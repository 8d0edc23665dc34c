//! Shared helpers for integration tests: a scriptable in-memory `RideApi`
//! and ride builders.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use ride_recorder::{
    FinishedRide, GpsFix, NewMilesRequest, NewMilesResponse, PointChunk, Result, RideApi,
    RideError, RideStateStore, RideUpload,
};

pub const T0: i64 = 1_700_000_000_000;

/// Install env_logger once so `RUST_LOG=debug` shows the component logs.
pub fn init_test_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Fix `step` points north of the origin (~11 m per step), one second apart.
pub fn fix_at(step: i64, timestamp: i64) -> GpsFix {
    let mut fix = GpsFix::new(51.5 + step as f64 * 0.0001, -0.12, timestamp);
    fix.accuracy = Some(5.0);
    fix
}

/// A stopped ride with the given number of points per segment.
pub fn recorded_ride(segments: &[usize]) -> FinishedRide {
    let mut ride = RideStateStore::new();
    ride.start(T0).unwrap();
    let mut now = T0;
    let mut step = 0;
    for (i, &points) in segments.iter().enumerate() {
        if i > 0 {
            ride.pause(now).unwrap();
            now += 60_000;
            ride.resume(now).unwrap();
        }
        for _ in 0..points {
            ride.add_fix(&fix_at(step, now));
            step += 1;
            now += 1_000;
        }
    }
    ride.stop(now).unwrap()
}

/// Operations the fake can be told to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    NewMiles,
    Create,
    Chunk,
    Complete,
}

#[derive(Debug, Clone, Copy)]
enum Scripted {
    Succeed,
    /// `None` is a network error
    Fail(Option<u16>),
}

/// In-memory backend. Outcomes are scripted per operation; once a script
/// runs out every call succeeds.
#[derive(Default)]
pub struct FakeApi {
    script: Mutex<HashMap<Op, VecDeque<Scripted>>>,
    new_meters_per_point: Mutex<f64>,
    pub new_miles_requests: Mutex<Vec<NewMilesRequest>>,
    pub created: Mutex<HashSet<String>>,
    pub create_calls: Mutex<u32>,
    /// (remote id, chunk index) in arrival order
    pub chunks: Mutex<Vec<(String, u32)>>,
    pub completed: Mutex<Vec<String>>,
    create_hook: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

impl FakeApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_new_meters_per_point(meters: f64) -> Self {
        let api = Self::default();
        *api.new_meters_per_point.lock().unwrap() = meters;
        api
    }

    /// Run `hook` at the start of every create call.
    pub fn before_create(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.create_hook.lock().unwrap() = Some(Box::new(hook));
    }

    fn push(&self, op: Op, outcome: Scripted, times: usize) {
        let mut script = self.script.lock().unwrap();
        let queue = script.entry(op).or_default();
        for _ in 0..times {
            queue.push_back(outcome);
        }
    }

    /// Let the next `times` scripted calls of `op` succeed.
    pub fn pass(&self, op: Op, times: usize) {
        self.push(op, Scripted::Succeed, times);
    }

    /// Fail the next `times` scripted calls of `op`. `None` is a network error.
    pub fn fail(&self, op: Op, status: Option<u16>, times: usize) {
        self.push(op, Scripted::Fail(status), times);
    }

    fn check(&self, op: Op) -> Result<()> {
        let next = self
            .script
            .lock()
            .unwrap()
            .get_mut(&op)
            .and_then(|q| q.pop_front());
        match next {
            Some(Scripted::Fail(status_code)) => Err(RideError::HttpError {
                message: format!("scripted {:?} failure", op),
                status_code,
            }),
            Some(Scripted::Succeed) | None => Ok(()),
        }
    }

    /// Points confirmed by successful new-miles calls.
    pub fn new_miles_points(&self) -> usize {
        self.new_miles_requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.points.len())
            .sum()
    }

    pub fn chunk_indices(&self) -> Vec<u32> {
        self.chunks.lock().unwrap().iter().map(|(_, i)| *i).collect()
    }
}

#[async_trait]
impl RideApi for FakeApi {
    async fn fetch_new_miles(&self, request: &NewMilesRequest) -> Result<NewMilesResponse> {
        self.check(Op::NewMiles)?;
        self.new_miles_requests.lock().unwrap().push(request.clone());
        let per_point = *self.new_meters_per_point.lock().unwrap();
        Ok(NewMilesResponse {
            new_meters: per_point * request.points.len() as f64,
            total_new_meters: None,
        })
    }

    async fn create_ride(&self, ride: &RideUpload) -> Result<String> {
        *self.create_calls.lock().unwrap() += 1;
        if let Some(hook) = self.create_hook.lock().unwrap().as_ref() {
            hook();
        }
        self.check(Op::Create)?;
        self.created.lock().unwrap().insert(ride.client_id.clone());
        Ok(format!("remote-{}", ride.client_id))
    }

    async fn upload_chunk(&self, remote_id: &str, chunk: &PointChunk) -> Result<()> {
        self.check(Op::Chunk)?;
        self.chunks
            .lock()
            .unwrap()
            .push((remote_id.to_string(), chunk.index));
        Ok(())
    }

    async fn complete_ride(&self, remote_id: &str) -> Result<()> {
        self.check(Op::Complete)?;
        self.completed.lock().unwrap().push(remote_id.to_string());
        Ok(())
    }
}
