//! `HttpRideApi` against a local scripted HTTP server: auth and idempotency
//! headers on the wire, create/409/5xx handling and the new-miles body.

mod common;

use std::sync::{Arc, Mutex};

use common::{init_test_logging, recorded_ride};
use ride_recorder::{
    ApiConfig, HttpRideApi, NewMilesRequest, RideApi, RideError, RideUpload,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Requests as received: lowercased head plus raw body.
type Received = Arc<Mutex<Vec<(String, String)>>>;

/// Serve one scripted `(status, body)` per connection, then stop.
async fn serve(responses: Vec<(u16, &'static str)>) -> (ApiConfig, Received) {
    init_test_logging();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let received: Received = Arc::new(Mutex::new(Vec::new()));

    let log = Arc::clone(&received);
    tokio::spawn(async move {
        for (status, body) in responses {
            let (mut socket, _) = listener.accept().await.unwrap();
            let request = read_request(&mut socket).await;
            log.lock().unwrap().push(request);

            let response = format!(
                "HTTP/1.1 {} Scripted\r\nContent-Type: application/json\r\n\
                 Content-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
        }
    });

    let config = ApiConfig {
        base_url: format!("http://{}/v1", addr),
        token: Some("secret-token".to_string()),
        timeout_ms: 5_000,
    };
    (config, received)
}

async fn read_request(socket: &mut TcpStream) -> (String, String) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = socket.read(&mut chunk).await.unwrap();
        assert!(n > 0, "client closed before sending a full request");
        buf.extend_from_slice(&chunk[..n]);

        let Some(head_end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
            continue;
        };
        let head = String::from_utf8_lossy(&buf[..head_end]).to_lowercase();
        let content_length = head
            .lines()
            .find_map(|line| line.strip_prefix("content-length:"))
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(0);
        let body_start = head_end + 4;
        if buf.len() >= body_start + content_length {
            let body = String::from_utf8_lossy(&buf[body_start..body_start + content_length]);
            return (head, body.into_owned());
        }
    }
}

fn upload() -> RideUpload {
    let ride = recorded_ride(&[3]);
    RideUpload::from_ride(&ride, 1)
}

#[tokio::test]
async fn test_create_sends_auth_and_idempotency_key() {
    let (config, received) = serve(vec![(201, r#"{"id": "srv-1"}"#)]).await;
    let api = HttpRideApi::new(&config).unwrap();
    let ride = upload();

    assert_eq!(api.create_ride(&ride).await.unwrap(), "srv-1");

    let received = received.lock().unwrap();
    let (head, body) = &received[0];
    assert!(head.starts_with("post /v1/rides http/1.1"));
    assert!(head.contains("authorization: bearer secret-token"));
    assert!(head.contains(&format!("idempotency-key: {}", ride.client_id.to_lowercase())));
    let sent: RideUpload = serde_json::from_str(body).unwrap();
    assert_eq!(sent.client_id, ride.client_id);
    assert_eq!(sent.point_count, 3);
    assert_eq!(sent.started_at, ride.started_at);
}

#[tokio::test]
async fn test_create_conflict_returns_existing_ride() {
    let (config, received) = serve(vec![(409, r#"{"id": "srv-existing"}"#)]).await;
    let api = HttpRideApi::new(&config).unwrap();

    assert_eq!(api.create_ride(&upload()).await.unwrap(), "srv-existing");
    assert_eq!(received.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_server_error_is_retryable() {
    let (config, _received) = serve(vec![(503, ""), (400, r#"{"error": "bad ride"}"#)]).await;
    let api = HttpRideApi::new(&config).unwrap();

    let err = api.create_ride(&upload()).await.unwrap_err();
    assert!(matches!(
        err,
        RideError::HttpError {
            status_code: Some(503),
            ..
        }
    ));
    assert!(err.is_retryable());

    let err = api.create_ride(&upload()).await.unwrap_err();
    assert!(!err.is_retryable());
    assert!(err.to_string().contains("bad ride"));
}

#[tokio::test]
async fn test_api_key_uses_basic_auth() {
    let (config, received) = serve(vec![(200, "")]).await;
    let api = HttpRideApi::with_api_key(&config, "k3y").unwrap();

    api.complete_ride("srv-1").await.unwrap();

    let received = received.lock().unwrap();
    let (head, _) = &received[0];
    assert!(head.starts_with("post /v1/rides/srv-1/complete http/1.1"));
    // base64("API_KEY:k3y"), lowercased with the rest of the head
    assert!(head.contains("authorization: basic qvbjx0tfwtprm3k="));
}

#[tokio::test]
async fn test_new_miles_round_trip() {
    let (config, received) = serve(vec![(200, r#"{"new_meters": 12.5}"#)]).await;
    let api = HttpRideApi::new(&config).unwrap();
    let request = NewMilesRequest {
        ride_id: "ride-1".to_string(),
        offset: 7,
        anchor: None,
        points: Vec::new(),
    };

    let response = api.fetch_new_miles(&request).await.unwrap();
    assert_eq!(response.new_meters, 12.5);
    assert_eq!(response.total_new_meters, None);

    let received = received.lock().unwrap();
    let (head, body) = &received[0];
    assert!(head.starts_with("post /v1/new-miles http/1.1"));
    // The local offset stays local
    assert!(!body.contains("offset"));
    assert!(body.contains("\"ride_id\":\"ride-1\""));
}
