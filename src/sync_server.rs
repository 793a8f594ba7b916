//! Sync server implementation using Axum.
//!
//! This module provides the HTTP surface of the sync service:
//! - /sync/push - Apply a device's changes under version checking
//! - /sync/pull - Changes from other devices since a cursor
//! - /sync/batch - All-or-nothing note and drawing writes
//! - /sync/resolve - Apply a conflict decision
//! - /sync/fetch - One row by id, to refill evicted cache entries
//! - /locks/acquire, /locks/release, /locks/status - Note edit locks
//! - /sync/status - Health check
//!
//! A background task clears stale note locks while the server runs.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::error::{ScheduleError, ScheduleResult};
use crate::models::{
    BatchSaveRequest, FetchRequest, LockAcquireResponse, LockRequest, LockStatusResponse, PullRequest,
    PushRequest, ResolveConflictRequest,
};
use crate::sync_client::ErrorResponse;
use crate::sync_service::SyncService;
use crate::ID_SHORT_LEN;

/// Shared server state
#[derive(Clone)]
struct AppState {
    service: Arc<SyncService>,
}

fn short(id: &str) -> &str {
    id.get(..ID_SHORT_LEN).unwrap_or(id)
}

fn error_status(error: &ScheduleError) -> StatusCode {
    match error {
        ScheduleError::Validation { .. } | ScheduleError::Json(_) | ScheduleError::Uuid(_) => {
            StatusCode::BAD_REQUEST
        }
        ScheduleError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        ScheduleError::NotFound(_) => StatusCode::NOT_FOUND,
        ScheduleError::VersionConflict(_) | ScheduleError::Transaction(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(error: ScheduleError) -> Response {
    let status = error_status(&error);
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!("Request failed: {}", error);
    }
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
        .into_response()
}

async fn push(State(state): State<AppState>, Json(request): Json<PushRequest>) -> Response {
    tracing::debug!(
        "POST /sync/push from device_id={}... ({} changes)",
        short(&request.device_id),
        request.changes.len()
    );
    for change in &request.changes {
        tracing::trace!(
            "  Incoming: {} {} {} v{}",
            change.table,
            short(&change.record_id),
            change.operation.as_str(),
            change.version
        );
    }

    match state.service.push(&request) {
        Ok(response) => {
            for err in &response.errors {
                tracing::warn!("  Error: {}", err);
            }
            Json(response).into_response()
        }
        Err(e) => error_response(e),
    }
}

async fn pull(State(state): State<AppState>, Json(request): Json<PullRequest>) -> Response {
    tracing::debug!(
        "POST /sync/pull from device_id={}... since={:?}",
        short(&request.device_id),
        request.last_sync_at
    );
    match state.service.pull(&request) {
        Ok(response) => Json(response).into_response(),
        Err(e) => error_response(e),
    }
}

async fn batch(State(state): State<AppState>, Json(request): Json<BatchSaveRequest>) -> Response {
    tracing::debug!(
        "POST /sync/batch from device_id={}... ({} notes, {} drawings)",
        short(&request.device_id),
        request.notes.len(),
        request.drawings.len()
    );
    match state.service.batch_save(&request) {
        Ok(response) if response.success => Json(response).into_response(),
        Ok(response) => (StatusCode::CONFLICT, Json(response)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn fetch(State(state): State<AppState>, Json(request): Json<FetchRequest>) -> Response {
    tracing::debug!(
        "POST /sync/fetch from device_id={}... {} {}",
        short(&request.device_id),
        request.table,
        short(&request.record_id)
    );
    match state.service.fetch(&request) {
        Ok(response) => Json(response).into_response(),
        Err(e) => error_response(e),
    }
}

async fn resolve(State(state): State<AppState>, Json(request): Json<ResolveConflictRequest>) -> Response {
    tracing::debug!(
        "POST /sync/resolve from device_id={}... {} {} {}",
        short(&request.device_id),
        request.table,
        short(&request.record_id),
        request.resolution.as_str()
    );
    match state.service.resolve_conflict(&request) {
        Ok(record) => Json(record).into_response(),
        Err(e) => error_response(e),
    }
}

async fn acquire_lock(State(state): State<AppState>, Json(request): Json<LockRequest>) -> Response {
    match state.service.acquire_lock(&request) {
        Ok(acquired) => Json(LockAcquireResponse { acquired }).into_response(),
        Err(e) => error_response(e),
    }
}

async fn release_lock(State(state): State<AppState>, Json(request): Json<LockRequest>) -> Response {
    match state.service.release_lock(&request) {
        Ok(_) => Json(serde_json::json!({})).into_response(),
        Err(e) => error_response(e),
    }
}

async fn lock_status(State(state): State<AppState>, Json(request): Json<LockRequest>) -> Response {
    match state.service.lock_status(&request) {
        Ok(locked_by_other) => Json(LockStatusResponse { locked_by_other }).into_response(),
        Err(e) => error_response(e),
    }
}

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.service.status())
}

/// Create the sync server router
pub fn create_router(service: Arc<SyncService>) -> Router {
    Router::new()
        .route("/sync/push", post(push))
        .route("/sync/pull", post(pull))
        .route("/sync/batch", post(batch))
        .route("/sync/resolve", post(resolve))
        .route("/sync/fetch", post(fetch))
        .route("/sync/status", get(status))
        .route("/locks/acquire", post(acquire_lock))
        .route("/locks/release", post(release_lock))
        .route("/locks/status", post(lock_status))
        .with_state(AppState { service })
}

/// Periodically clear stale note locks
pub fn spawn_lock_sweeper(service: Arc<SyncService>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match service.sweep_stale_locks() {
                Ok(0) => {}
                Ok(cleared) => tracing::info!("Cleared {} stale note locks", cleared),
                Err(e) => tracing::error!("Stale lock sweep failed: {}", e),
            }
        }
    })
}

/// Serve on an already bound listener until `shutdown` resolves
pub async fn serve<F>(listener: TcpListener, service: Arc<SyncService>, shutdown: F) -> ScheduleResult<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, create_router(service))
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| ScheduleError::Network(e.to_string()))
}

/// Start the sync server with its lock sweeper. Returns after `shutdown`
/// fires (or its sender is dropped).
pub async fn start_server(
    service: Arc<SyncService>,
    port: u16,
    sweep_interval: Duration,
    shutdown: oneshot::Receiver<()>,
) -> ScheduleResult<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Starting sync server on {}", addr);

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| ScheduleError::Network(e.to_string()))?;

    let sweeper = spawn_lock_sweeper(Arc::clone(&service), sweep_interval);
    let served = serve(listener, service, async move {
        shutdown.await.ok();
    })
    .await;
    sweeper.abort();

    tracing::info!("Sync server stopped");
    served
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{new_id, DeviceSession, PullResponse, PushResponse};
    use crate::sync_client::{HttpTransport, SyncClient};
    use crate::Database;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::{json, Value};
    use std::sync::Mutex;
    use tower::ServiceExt;

    const TOKEN: &str = "token";

    fn create_test_service() -> (Arc<SyncService>, String) {
        let db = Arc::new(Mutex::new(Database::new_in_memory().unwrap()));
        let service = SyncService::new(db).unwrap();
        let device_id = new_id();
        service.register_device(&device_id, Some("front desk"), TOKEN).unwrap();
        (Arc::new(service), device_id)
    }

    async fn post_json(router: Router, path: &str, body: Value) -> (StatusCode, Value) {
        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(path)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    fn book_push(device_id: &str, token: &str, book_id: &str, version: i64) -> Value {
        json!({
            "deviceId": device_id,
            "deviceToken": token,
            "changes": [{
                "table": "books",
                "recordId": book_id,
                "operation": "update",
                "data": {"name": "Clinic"},
                "version": version,
                "timestamp": "2025-01-01 09:00:00"
            }]
        })
    }

    #[tokio::test]
    async fn test_push_then_conflict() {
        let (service, device_id) = create_test_service();
        let router = create_router(service);
        let book = new_id();

        let (status, body) = post_json(router.clone(), "/sync/push", book_push(&device_id, TOKEN, &book, 0)).await;
        assert_eq!(status, StatusCode::OK);
        let response: PushResponse = serde_json::from_value(body).unwrap();
        assert_eq!(response.applied_count, 1);

        let mut stale = book_push(&device_id, TOKEN, &book, 0);
        stale["changes"][0]["data"]["name"] = json!("Renamed");
        let (status, body) = post_json(router, "/sync/push", stale).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["appliedCount"], json!(0));
        assert_eq!(body["conflicts"][0]["serverVersion"], json!(1));
        assert_eq!(body["conflicts"][0]["serverData"]["name"], json!("Clinic"));
    }

    #[tokio::test]
    async fn test_error_statuses() {
        let (service, device_id) = create_test_service();
        let router = create_router(service);
        let book = new_id();

        let (status, body) = post_json(router.clone(), "/sync/push", book_push(&device_id, "wrong", &book, 0)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body["error"].as_str().unwrap().contains("Unauthorized"));

        let mut bad_column = book_push(&device_id, TOKEN, &book, 0);
        bad_column["changes"][0]["data"]["cache_hit_count"] = json!(3);
        let (status, _) = post_json(router.clone(), "/sync/push", bad_column).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = post_json(
            router,
            "/sync/resolve",
            json!({
                "deviceId": device_id,
                "deviceToken": TOKEN,
                "table": "books",
                "recordId": book,
                "resolution": "use_server"
            }),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_batch_failure_is_conflict() {
        let (service, device_id) = create_test_service();
        let router = create_router(service);

        let (status, body) = post_json(
            router,
            "/sync/batch",
            json!({
                "deviceId": device_id,
                "deviceToken": TOKEN,
                "notes": [{"recordRef": new_id(), "data": [["a"]], "version": 0}],
                "drawings": []
            }),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["success"], json!(false));
        assert!(body["errorMessage"].is_string());
    }

    #[tokio::test]
    async fn test_lock_routes() {
        let (service, device_id) = create_test_service();
        let other = new_id();
        service.register_device(&other, None, TOKEN).unwrap();
        let router = create_router(service);
        let record = new_id();
        let lock = |device: &str| json!({"deviceId": device, "deviceToken": TOKEN, "recordId": record});

        let (_, body) = post_json(router.clone(), "/locks/acquire", lock(&device_id)).await;
        assert_eq!(body, json!({"acquired": true}));
        let (_, body) = post_json(router.clone(), "/locks/status", lock(&other)).await;
        assert_eq!(body, json!({"lockedByOther": true}));
        let (status, body) = post_json(router.clone(), "/locks/release", lock(&device_id)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({}));
        let (_, body) = post_json(router, "/locks/acquire", lock(&other)).await;
        assert_eq!(body, json!({"acquired": true}));
    }

    #[tokio::test]
    async fn test_fetch_route() {
        let (service, device_id) = create_test_service();
        let router = create_router(service);
        let book = new_id();
        post_json(router.clone(), "/sync/push", book_push(&device_id, TOKEN, &book, 0)).await;

        let fetch = |id: &str, token: &str| {
            json!({"deviceId": device_id, "deviceToken": token, "table": "books", "recordId": id})
        };
        let (status, body) = post_json(router.clone(), "/sync/fetch", fetch(&book, TOKEN)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["change"]["version"], json!(1));
        assert_eq!(body["change"]["data"]["name"], json!("Clinic"));

        let (status, body) = post_json(router.clone(), "/sync/fetch", fetch(&new_id(), TOKEN)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["change"], Value::Null);

        let (status, _) = post_json(router, "/sync/fetch", fetch(&book, "wrong")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_status() {
        let (service, _) = create_test_service();
        let response = create_router(service)
            .oneshot(Request::builder().uri("/sync/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["status"], json!("ok"));
        assert_eq!(body["protocolVersion"], json!("1.0"));
        assert!(body["serverTime"].as_i64().unwrap() > 0);
    }

    #[tokio::test]
    async fn test_pull_route_uses_cursor() {
        let (service, device_id) = create_test_service();
        let other = new_id();
        service.register_device(&other, None, TOKEN).unwrap();
        let router = create_router(service);
        post_json(router.clone(), "/sync/push", book_push(&device_id, TOKEN, &new_id(), 0)).await;

        let (status, body) = post_json(
            router.clone(),
            "/sync/pull",
            json!({"deviceId": other, "deviceToken": TOKEN, "lastSyncAt": null}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let first: PullResponse = serde_json::from_value(body).unwrap();
        assert_eq!(first.changes.len(), 1);
        // Timestamp string normalized to milliseconds
        assert_eq!(first.changes[0].timestamp, json!(1_735_722_000_000i64));

        let (_, body) = post_json(
            router,
            "/sync/pull",
            json!({"deviceId": other, "deviceToken": TOKEN, "lastSyncAt": first.server_time}),
        )
        .await;
        assert_eq!(body["changes"], json!([]));
    }

    #[tokio::test]
    async fn test_http_client_round_trip() {
        let (service, device_id) = create_test_service();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel::<()>();
        let server = tokio::spawn(serve(listener, Arc::clone(&service), async move {
            rx.await.ok();
        }));

        let local = Arc::new(Mutex::new(Database::new_in_memory().unwrap()));
        let book = local.lock().unwrap().create_book("Clinic").unwrap();
        let transport = HttpTransport::new(&format!("http://{}", addr), Duration::from_secs(5)).unwrap();
        let client = SyncClient::new(Arc::clone(&local), DeviceSession::new(device_id, TOKEN), transport);

        let result = client.sync_all().await;
        assert!(result.success, "{:?}", result.errors);
        assert_eq!(result.pushed, 1);
        let synced = local.lock().unwrap().get_book(&book.id).unwrap().unwrap();
        assert_eq!(synced.version, 1);
        assert!(!synced.is_dirty);

        tx.send(()).unwrap();
        server.await.unwrap().unwrap();
    }
}
