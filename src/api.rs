//! Remote ride API.
//!
//! [`RideApi`] is the seam between the recorder and the backend: the upload
//! monitor and the new-miles reconciliation only talk to the trait, and
//! [`HttpRideApi`] implements it over HTTPS with reqwest.
//!
//! Uploads are resumable. A ride is created once (idempotent on the local ride
//! id), its points are sent as numbered chunks, then it is marked complete.
//! Chunks are addressed by index, so re-sending one after a lost response is
//! harmless.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use chrono::{TimeZone, Utc};
use geo::Coord;
use log::{debug, info};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};

use crate::config::ApiConfig;
use crate::new_miles::{NewMilesRequest, NewMilesResponse};
use crate::ride_state::FinishedRide;
use crate::{Bounds, Result, RideError};

/// Polyline precision used for chunk geometry (1e-5 degrees, ~1 m).
pub const POLYLINE_PRECISION: u32 = 5;

// ============================================================================
// Wire types
// ============================================================================

/// Ride metadata sent when the ride is created remotely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RideUpload {
    /// Local ride id, also the idempotency key
    pub client_id: String,
    /// RFC 3339
    pub started_at: String,
    /// RFC 3339
    pub ended_at: String,
    pub moving_duration_ms: i64,
    pub distance_meters: f64,
    pub max_speed_mps: f64,
    pub new_miles_meters: f64,
    pub segment_count: u32,
    pub point_count: u32,
    pub chunk_count: u32,
    pub bounds: Option<Bounds>,
}

/// A slice of one segment's points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointChunk {
    /// Position of the chunk in the whole ride, starting at 0
    pub index: u32,
    /// Segment the points belong to
    pub segment: u32,
    /// Encoded polyline of the points
    pub polyline: String,
    /// Unix ms, one per point
    pub timestamps: Vec<i64>,
}

#[derive(Debug, Deserialize)]
struct CreatedRide {
    id: String,
}

fn rfc3339(ms: i64) -> String {
    Utc.timestamp_millis_opt(ms)
        .single()
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_default()
}

/// Split a ride into chunks of at most `chunk_size` points.
///
/// Chunks never span two segments.
pub fn build_chunks(ride: &FinishedRide, chunk_size: usize) -> Result<Vec<PointChunk>> {
    let chunk_size = chunk_size.max(1);
    let mut chunks = Vec::new();

    for (segment_index, segment) in ride.segments.iter().enumerate() {
        for fixes in segment.fixes.chunks(chunk_size) {
            let coords = fixes.iter().map(|f| Coord {
                x: f.longitude,
                y: f.latitude,
            });
            let polyline = polyline::encode_coordinates(coords, POLYLINE_PRECISION)
                .map_err(|e| RideError::encoding(e.to_string()))?;
            chunks.push(PointChunk {
                index: chunks.len() as u32,
                segment: segment_index as u32,
                polyline,
                timestamps: fixes.iter().map(|f| f.timestamp).collect(),
            });
        }
    }
    Ok(chunks)
}

impl RideUpload {
    pub fn from_ride(ride: &FinishedRide, chunk_count: usize) -> Self {
        Self {
            client_id: ride.ride_id.clone(),
            started_at: rfc3339(ride.started_at),
            ended_at: rfc3339(ride.ended_at),
            moving_duration_ms: ride.moving_duration_ms,
            distance_meters: ride.distance_meters,
            max_speed_mps: ride.max_speed_mps,
            new_miles_meters: ride.new_miles_meters,
            segment_count: ride.segments.len() as u32,
            point_count: ride.point_count() as u32,
            chunk_count: chunk_count as u32,
            bounds: ride.bounds(),
        }
    }
}

// ============================================================================
// Trait
// ============================================================================

#[async_trait]
pub trait RideApi: Send + Sync {
    /// Untraveled distance covered by a batch of live points.
    async fn fetch_new_miles(&self, request: &NewMilesRequest) -> Result<NewMilesResponse>;

    /// Create the ride remotely and return the server id.
    ///
    /// Creating a ride that already exists must return the existing id.
    async fn create_ride(&self, ride: &RideUpload) -> Result<String>;

    async fn upload_chunk(&self, remote_id: &str, chunk: &PointChunk) -> Result<()>;

    /// Mark all chunks as delivered.
    async fn complete_ride(&self, remote_id: &str) -> Result<()>;
}

// ============================================================================
// HTTP implementation
// ============================================================================

/// reqwest-backed client for the ride backend.
pub struct HttpRideApi {
    client: Client,
    base_url: String,
    auth_header: Option<String>,
}

impl HttpRideApi {
    /// Client using the bearer token from the config, if any.
    pub fn new(config: &ApiConfig) -> Result<Self> {
        let auth_header = config.token.as_ref().map(|t| format!("Bearer {}", t));
        Self::with_auth_header(config, auth_header)
    }

    /// Client using Basic auth with an API key.
    pub fn with_api_key(config: &ApiConfig, api_key: &str) -> Result<Self> {
        let auth = base64::engine::general_purpose::STANDARD.encode(format!("API_KEY:{}", api_key));
        Self::with_auth_header(config, Some(format!("Basic {}", auth)))
    }

    /// Client with a pre-formatted `Authorization` header value.
    pub fn with_auth_header(config: &ApiConfig, auth_header: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .tcp_keepalive(Duration::from_secs(30))
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| RideError::HttpError {
                message: format!("Failed to create HTTP client: {}", e),
                status_code: None,
            })?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            auth_header,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let builder = self.client.request(method, url);
        match &self.auth_header {
            Some(auth) => builder.header("Authorization", auth),
            None => builder,
        }
    }
}

/// Turn a non-success response into an error carrying its status and body.
async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(status_error(status, &body))
}

fn status_error(status: StatusCode, body: &str) -> RideError {
    let message = if body.trim().is_empty() {
        status
            .canonical_reason()
            .unwrap_or("Unexpected status")
            .to_string()
    } else {
        body.trim().chars().take(200).collect()
    };
    RideError::HttpError {
        message,
        status_code: Some(status.as_u16()),
    }
}

#[async_trait]
impl RideApi for HttpRideApi {
    async fn fetch_new_miles(&self, request: &NewMilesRequest) -> Result<NewMilesResponse> {
        let response = self
            .request(Method::POST, "/new-miles")
            .json(request)
            .send()
            .await?;
        let response = check_status(response).await?;
        Ok(response.json().await?)
    }

    async fn create_ride(&self, ride: &RideUpload) -> Result<String> {
        let response = self
            .request(Method::POST, "/rides")
            .header("Idempotency-Key", &ride.client_id)
            .json(ride)
            .send()
            .await?;

        // The server answers 409 with the existing ride when the key was seen before
        if response.status() == StatusCode::CONFLICT {
            let created: CreatedRide = response.json().await?;
            debug!(
                "[RideApi] Ride {} already exists as {}",
                ride.client_id, created.id
            );
            return Ok(created.id);
        }

        let response = check_status(response).await?;
        let created: CreatedRide = response.json().await?;
        info!("[RideApi] Created ride {} as {}", ride.client_id, created.id);
        Ok(created.id)
    }

    async fn upload_chunk(&self, remote_id: &str, chunk: &PointChunk) -> Result<()> {
        let path = format!("/rides/{}/chunks/{}", remote_id, chunk.index);
        let response = self.request(Method::PUT, &path).json(chunk).send().await?;
        check_status(response).await?;
        Ok(())
    }

    async fn complete_ride(&self, remote_id: &str) -> Result<()> {
        let path = format!("/rides/{}/complete", remote_id);
        let response = self.request(Method::POST, &path).send().await?;
        check_status(response).await?;
        Ok(())
    }
}
