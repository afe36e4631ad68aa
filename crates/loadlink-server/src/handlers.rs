//! HTTP control plane and WebSocket endpoint.
//!
//! Every WebSocket connection is served by one task that reads frames and
//! applies them to the broker. Frames going back to the peer, whether
//! replies, relayed batches or commands, pass through the connection's
//! outbound queue and are written by a separate pump task.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use chrono::{SecondsFormat, Utc};
use futures_util::StreamExt;
use loadlink_core::{sample::now_millis, Batch, Broker, BrokerError, ReadingView};
use loadlink_protocol::{codec, ClientMessage, Role, ServerMessage};
use loadlink_transport::{pump_outbound, Connection, WebSocketConnection};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{debug, error, info, trace, warn};

const PRODUCER_HINT: &str = "Waiting for test start command";

/// Shared server state.
pub struct AppState {
    /// The relay broker.
    pub broker: Broker,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            broker: Broker::with_config(config.broker()),
            config,
        }
    }
}

/// Errors returned by the HTTP API as `{"error": ...}`.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("{0}")]
    BadRequest(&'static str),

    #[error("{0}")]
    NotFound(&'static str),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Broker(BrokerError::NoProducer) | ApiError::BadRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::Broker(BrokerError::Persistence(e)) => {
                error!(error = %e, "Session log unavailable");
                metrics::record_error("persistence");
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
        };

        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Build the application router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .route("/api/status", get(status_handler))
        .route("/api/start_test", post(start_handler))
        .route("/api/stop_test", post(stop_handler))
        .route("/api/latest_reading", get(latest_reading_handler))
        .route("/api/current_reading", get(current_reading_handler))
        .route("/api/session_data", get(session_data_handler))
        .route("/api/raw_data", get(raw_data_handler))
        .route("/api/raw_data_csv", get(raw_data_csv_handler))
        .route("/api/esp32/status", get(esp32_status_handler))
        .route("/api/esp32/command", post(esp32_command_handler))
        .route("/api/esp32/data", post(esp32_data_handler))
        .with_state(state)
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(state: Arc<AppState>) -> Result<()> {
    let config = &state.config;

    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("loadlink server listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    serve(listener, Arc::clone(&state)).await
}

/// Serve the application on an already bound listener.
///
/// # Errors
///
/// Returns an error if the server stops abnormally.
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> Result<()> {
    let app = router(state).into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, app).await?;
    Ok(())
}

/// Health check handler.
async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn status_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.broker.status())
}

async fn start_handler(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let started = state.broker.start()?;
    Ok(Json(json!({
        "message": "Test started successfully",
        "status": "started",
        "csv_file": started.file_name,
    })))
}

async fn stop_handler(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let stopped = state.broker.stop()?;
    Ok(Json(json!({
        "message": "Test stopped successfully",
        "status": "stopped",
        "sample_count": stopped.sample_count,
        "csv_file": stopped.file_name,
    })))
}

async fn latest_reading_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(ReadingView::from(state.broker.latest_reading()))
}

async fn current_reading_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Value>, ApiError> {
    let reading = state
        .broker
        .latest_reading()
        .ok_or(ApiError::NotFound("No sensor data available"))?;

    Ok(Json(json!({
        "timestamp": reading.device_time,
        "left": reading.left,
        "right": reading.right,
        "updated_at": Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
    })))
}

async fn session_data_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.broker.session_data())
}

async fn raw_data_handler(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let reading = state
        .broker
        .latest_reading()
        .ok_or(ApiError::NotFound("No sensor data available"))?;

    Ok(Json(json!({
        "timestamp": reading.device_time,
        "left": reading.left,
        "right": reading.right,
        "esp32_time": reading.device_time,
    })))
}

/// Latest reading as one `timestamp,left,right` line.
async fn raw_data_csv_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.broker.latest_reading() {
        Some(reading) => format!(
            "{},{},{}",
            reading.device_time, reading.left, reading.right
        )
        .into_response(),
        None => (StatusCode::NOT_FOUND, "No data available").into_response(),
    }
}

async fn esp32_status_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let producers = state.broker.registry().count(Role::Producer);
    Json(json!({
        "esp32_connected": producers > 0,
        "num_connections": producers,
        "latest_readings": ReadingView::from(state.broker.latest_reading()),
        "is_testing": state.broker.is_active(),
        "server_time": now_millis(),
    }))
}

async fn esp32_command_handler(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let command = serde_json::from_slice::<Value>(&body)
        .ok()
        .and_then(|mut value| value.get_mut("command").map(Value::take))
        .map(|value| match value {
            Value::String(s) => s,
            other => other.to_string(),
        })
        .ok_or(ApiError::BadRequest("Command is required"))?;

    let report = state.broker.send_command(&command);
    metrics::record_pruned(report.pruned);

    Ok(Json(json!({
        "success": true,
        "command": command,
        "esp32_connected": state.broker.registry().count(Role::Producer) > 0,
    })))
}

async fn esp32_data_handler(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    // Only `samples` matters here, whatever other keys the body carries
    let samples = codec::decode_samples(&body).map_err(|e| {
        debug!(error = %e, "Rejected HTTP batch");
        ApiError::BadRequest("No samples in data")
    })?;

    let started = Instant::now();
    let batch = Batch::new(&samples, body);
    let outcome = state.broker.on_batch(&batch, None);
    metrics::record_ingest(&outcome, started.elapsed().as_secs_f64());

    Ok(Json(json!({
        "success": true,
        "samples_received": batch.len(),
    })))
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    remote: Option<ConnectInfo<SocketAddr>>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let remote = remote.map(|ConnectInfo(addr)| addr);
    ws.max_message_size(state.config.limits.max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, remote, state))
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, remote: Option<SocketAddr>, state: Arc<AppState>) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let (ws_conn, queue) = WebSocketConnection::new(remote, &state.config.websocket());
    let conn: Arc<dyn Connection> = ws_conn;
    let id = conn.id().clone();
    state.broker.connect(Arc::clone(&conn));

    debug!(connection = %id, remote = ?remote, "WebSocket connected");

    let (sender, mut receiver) = socket.split();
    let pump = tokio::spawn(pump_outbound(sender, queue));

    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                metrics::record_frame(text.len(), "inbound");
                handle_frame(Bytes::from(text.into_bytes()), &conn, &state);
            }
            Ok(Message::Binary(data)) => {
                metrics::record_frame(data.len(), "inbound");
                handle_frame(Bytes::from(data), &conn, &state);
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(Message::Close(_)) => {
                debug!(connection = %id, "Received close frame");
                break;
            }
            Err(e) => {
                warn!(connection = %id, error = %e, "WebSocket error");
                metrics::record_error("websocket");
                break;
            }
        }
    }

    // Losing a producer while recording is logged by the session event logger
    state.broker.deregister(&id);
    conn.close();
    let _ = pump.await;

    debug!(connection = %id, "WebSocket disconnected");
}

/// Apply one inbound frame.
///
/// Malformed frames are logged and dropped; the connection stays open.
fn handle_frame(data: Bytes, conn: &Arc<dyn Connection>, state: &AppState) {
    let message = match codec::decode(&data) {
        Ok(message) => message,
        Err(e) => {
            warn!(connection = %conn.id(), error = %e, "Dropped malformed frame");
            metrics::record_error("protocol");
            return;
        }
    };

    trace!(connection = %conn.id(), kind = message.kind(), "Frame");

    match message {
        ClientMessage::Register { role, declared } => {
            state.broker.register(Arc::clone(conn), role);
            let hint = (role == Role::Producer).then(|| PRODUCER_HINT.to_string());
            reply(conn, &ServerMessage::registered(declared, hint));
        }

        ClientMessage::Samples { samples } => {
            let started = Instant::now();
            let batch = Batch::new(&samples, data);
            let outcome = state.broker.on_batch(&batch, Some(conn.id()));
            metrics::record_ingest(&outcome, started.elapsed().as_secs_f64());
        }

        ClientMessage::Ping => reply(conn, &ServerMessage::pong()),

        ClientMessage::Command { cmd } => {
            info!(connection = %conn.id(), command = %cmd, "Command");
            let report = state.broker.send_command(&cmd);
            metrics::record_pruned(report.pruned);
            reply(conn, &ServerMessage::command_ack(cmd));
        }

        ClientMessage::Done => {
            debug!(connection = %conn.id(), "Batch complete");
        }

        ClientMessage::Unknown => {
            debug!(connection = %conn.id(), "Ignored frame with no known key");
        }
    }
}

fn reply(conn: &Arc<dyn Connection>, message: &ServerMessage) {
    let frame = match codec::encode(message) {
        Ok(frame) => frame,
        Err(e) => {
            error!(connection = %conn.id(), error = %e, "Failed to encode reply");
            return;
        }
    };

    let len = frame.len();
    match conn.send(frame) {
        Ok(()) => metrics::record_frame(len, "outbound"),
        Err(e) => debug!(connection = %conn.id(), error = %e, "Reply not sent"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Method, Request};
    use futures_util::SinkExt;
    use loadlink_core::SessionEvent;
    use loadlink_transport::SyntheticConnection;
    use std::time::Duration;
    use tokio_tungstenite::tungstenite::Message as WsMessage;
    use tower::ServiceExt;

    fn state(dir: &tempfile::TempDir) -> Arc<AppState> {
        let mut config = Config::default();
        config.storage.data_dir = dir.path().join("test_data");
        config.metrics.enabled = false;
        Arc::new(AppState::new(config))
    }

    async fn call_raw(
        state: &Arc<AppState>,
        method: Method,
        uri: &str,
        body: Option<&str>,
    ) -> (StatusCode, Option<String>, Bytes) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.unwrap_or_default().to_string()))
            .unwrap();

        let response = router(Arc::clone(state)).oneshot(request).await.unwrap();
        let status = response.status();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .map(|value| value.to_str().unwrap().to_string());
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, content_type, bytes)
    }

    async fn call(
        state: &Arc<AppState>,
        method: Method,
        uri: &str,
        body: Option<&str>,
    ) -> (StatusCode, Value) {
        let (status, _, bytes) = call_raw(state, method, uri, body).await;
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn producer(state: &AppState) -> Arc<SyntheticConnection> {
        let conn = Arc::new(SyntheticConnection::new());
        state
            .broker
            .register(Arc::clone(&conn) as Arc<dyn Connection>, Role::Producer);
        conn
    }

    #[tokio::test]
    async fn test_health() {
        let dir = tempfile::tempdir().unwrap();
        let (status, body) = call(&state(&dir), Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_start_without_producer() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir);

        let (status, body) = call(&state, Method::POST, "/api/start_test", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({"error": "No ESP32 device connected"}));

        let (status, _) = call(&state, Method::POST, "/api/stop_test", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(!dir.path().join("test_data").exists());
    }

    #[tokio::test]
    async fn test_start_ingest_stop() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir);
        let esp = producer(&state);

        let (status, body) = call(&state, Method::POST, "/api/start_test", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "started");
        let csv_file = body["csv_file"].as_str().unwrap().to_string();
        assert!(csv_file.starts_with("imtp_test_"));
        assert_eq!(esp.sent_json()[0], json!({"command": "start"}));

        let (status, body) = call(
            &state,
            Method::POST,
            "/api/esp32/data",
            Some(r#"{"samples":[{"l":5,"r":7,"t":100},{"l":6,"r":8,"t":110}]}"#),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"success": true, "samples_received": 2}));

        let (_, body) = call(&state, Method::GET, "/api/status", None).await;
        assert_eq!(body["is_testing"], true);
        assert_eq!(body["esp_connected"], true);
        assert_eq!(body["session_sample_count"], 2);
        assert_eq!(body["latest_readings"]["left"], 6);

        let (status, body) = call(&state, Method::POST, "/api/stop_test", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "stopped");
        assert_eq!(body["sample_count"], 2);
        assert_eq!(body["csv_file"], csv_file.as_str());

        let contents =
            std::fs::read_to_string(dir.path().join("test_data").join(&csv_file)).unwrap();
        assert_eq!(contents.lines().count(), 3);
    }

    #[tokio::test]
    async fn test_unwritable_storage_is_500() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir);
        std::fs::write(dir.path().join("test_data"), "").unwrap();
        producer(&state);

        let (status, body) = call(&state, Method::POST, "/api/start_test", None).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["error"].as_str().unwrap().contains("session log"));
        assert!(!state.broker.is_active());
    }

    #[tokio::test]
    async fn test_readings() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir);

        let (status, body) = call(&state, Method::GET, "/api/current_reading", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, json!({"error": "No sensor data available"}));

        let (_, body) = call(&state, Method::GET, "/api/latest_reading", None).await;
        assert_eq!(body["timestamp"], Value::Null);

        call(
            &state,
            Method::POST,
            "/api/esp32/data",
            Some(r#"{"samples":[{"l":5,"r":7,"t":100}]}"#),
        )
        .await;

        let (status, body) = call(&state, Method::GET, "/api/current_reading", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["left"], 5);
        assert_eq!(body["right"], 7);
        assert_eq!(body["timestamp"], 100);
        assert!(body["updated_at"].as_str().unwrap().ends_with('Z'));

        // Idle: cached but not recorded
        let (_, body) = call(&state, Method::GET, "/api/status", None).await;
        assert_eq!(body["session_sample_count"], 0);
    }

    #[tokio::test]
    async fn test_esp32_command() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir);

        let (status, body) = call(&state, Method::POST, "/api/esp32/command", Some("{}")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({"error": "Command is required"}));

        let esp = producer(&state);
        let (status, body) = call(
            &state,
            Method::POST,
            "/api/esp32/command",
            Some(r#"{"command":"tare"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            json!({"success": true, "command": "tare", "esp32_connected": true})
        );
        assert_eq!(esp.sent_json()[0], json!({"command": "tare"}));

        let (_, body) = call(&state, Method::GET, "/api/esp32/status", None).await;
        assert_eq!(body["esp32_connected"], true);
        assert_eq!(body["num_connections"], 1);
        assert!(body["server_time"].as_i64().unwrap() > 0);
    }

    #[tokio::test]
    async fn test_esp32_data_requires_samples() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir);

        for bad in [r#"{"ping":true}"#, "not json", r#"{"samples":5}"#] {
            let (status, body) = call(&state, Method::POST, "/api/esp32/data", Some(bad)).await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert_eq!(body, json!({"error": "No samples in data"}));
        }
    }

    #[tokio::test]
    async fn test_esp32_data_ignores_type_key() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir);

        let (status, body) = call(
            &state,
            Method::POST,
            "/api/esp32/data",
            Some(r#"{"type":"esp32","samples":[{"l":5,"r":7,"t":100}]}"#),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"success": true, "samples_received": 1}));
        assert_eq!(state.broker.latest_reading().unwrap().left, 5);
    }

    #[tokio::test]
    async fn test_session_data() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir);
        producer(&state);

        let (status, body) = call(&state, Method::GET, "/api/session_data", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            json!({"is_testing": false, "sample_count": 0, "data": []})
        );

        call(&state, Method::POST, "/api/start_test", None).await;
        let samples: Vec<String> = (0..105)
            .map(|i| format!(r#"{{"l":{i},"r":{},"t":{}}}"#, i + 1, 1000 + i))
            .collect();
        let batch = format!(r#"{{"samples":[{}]}}"#, samples.join(","));
        call(&state, Method::POST, "/api/esp32/data", Some(&batch)).await;

        let (_, body) = call(&state, Method::GET, "/api/session_data", None).await;
        assert_eq!(body["is_testing"], true);
        assert_eq!(body["sample_count"], 105);
        let data = body["data"].as_array().unwrap();
        assert_eq!(data.len(), 100);
        assert_eq!(data[0], json!({"left": 5, "right": 6, "timestamp": 1005}));
        assert_eq!(data[99]["left"], 104);

        // A new session starts empty
        call(&state, Method::POST, "/api/start_test", None).await;
        let (_, body) = call(&state, Method::GET, "/api/session_data", None).await;
        assert_eq!(body["sample_count"], 0);
        assert_eq!(body["data"], json!([]));
    }

    #[tokio::test]
    async fn test_raw_data() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir);

        let (status, body) = call(&state, Method::GET, "/api/raw_data", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, json!({"error": "No sensor data available"}));

        call(
            &state,
            Method::POST,
            "/api/esp32/data",
            Some(r#"{"samples":[{"l":5,"r":7,"t":100}]}"#),
        )
        .await;

        let (status, body) = call(&state, Method::GET, "/api/raw_data", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            json!({"timestamp": 100, "left": 5, "right": 7, "esp32_time": 100})
        );
    }

    #[tokio::test]
    async fn test_raw_data_csv() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir);

        let (status, _, body) = call_raw(&state, Method::GET, "/api/raw_data_csv", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(&body[..], b"No data available");

        call(
            &state,
            Method::POST,
            "/api/esp32/data",
            Some(r#"{"samples":[{"l":5,"r":7,"t":100},{"l":-3,"r":9,"t":110}]}"#),
        )
        .await;

        let (status, content_type, body) =
            call_raw(&state, Method::GET, "/api/raw_data_csv", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(content_type.unwrap().starts_with("text/plain"));
        assert_eq!(&body[..], b"110,-3,9");
    }

    async fn next_json<S>(ws: &mut S) -> Value
    where
        S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
            + Unpin,
    {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("timed out waiting for frame")
                .expect("stream ended")
                .expect("websocket error");
            if let WsMessage::Text(text) = msg {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_websocket_relay_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, Arc::clone(&state)));

        let url = format!("ws://{}/ws", addr);
        let (mut esp, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        let (mut app, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

        esp.send(WsMessage::Text(r#"{"type":"esp32"}"#.into()))
            .await
            .unwrap();
        assert_eq!(
            next_json(&mut esp).await,
            json!({"status": "registered", "type": "esp32", "message": PRODUCER_HINT})
        );

        app.send(WsMessage::Text(r#"{"type":"flutter"}"#.into()))
            .await
            .unwrap();
        assert_eq!(
            next_json(&mut app).await,
            json!({"status": "registered", "type": "flutter"})
        );

        app.send(WsMessage::Text(r#"{"ping":true}"#.into()))
            .await
            .unwrap();
        assert_eq!(next_json(&mut app).await, json!({"pong": true}));

        // Malformed frames are dropped without closing the connection
        app.send(WsMessage::Text("{oops".into())).await.unwrap();

        state.broker.start().unwrap();
        assert_eq!(next_json(&mut esp).await, json!({"command": "start"}));

        let batch = r#"{"samples":[{"l":5,"r":7,"t":100}]}"#;
        esp.send(WsMessage::Text(batch.into())).await.unwrap();
        let relayed = next_json(&mut app).await;
        assert_eq!(relayed, serde_json::from_str::<Value>(batch).unwrap());
        assert_eq!(state.broker.latest_reading().unwrap().left, 5);

        app.send(WsMessage::Text(r#"{"cmd":"tare"}"#.into()))
            .await
            .unwrap();
        assert_eq!(
            next_json(&mut app).await,
            json!({"command_ack": "tare", "success": true})
        );
        assert_eq!(next_json(&mut esp).await, json!({"command": "tare"}));

        let stopped = state.broker.stop().unwrap();
        assert_eq!(stopped.sample_count, 1);

        esp.close(None).await.unwrap();
        for _ in 0..50 {
            if state.broker.status().connected_devices.producer == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(state.broker.status().connected_devices.producer, 0);
        assert_eq!(state.broker.status().connected_devices.consumer, 1);
    }

    #[tokio::test]
    async fn test_producer_loss_reported_once() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, Arc::clone(&state)));

        let (mut esp, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", addr))
            .await
            .unwrap();
        esp.send(WsMessage::Text(r#"{"type":"esp32"}"#.into()))
            .await
            .unwrap();
        next_json(&mut esp).await;

        state.broker.start().unwrap();
        let mut events = state.broker.subscribe_events();
        esp.close(None).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            event,
            SessionEvent::ProducerLost {
                remaining_producers: 0,
                sample_count: 0,
            }
        ));
        assert!(events.try_recv().is_err());
        assert!(state.broker.is_active());
    }
}
