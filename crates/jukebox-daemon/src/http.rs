use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use jukebox_core::dispatcher::PlayerHandle;
use jukebox_core::protocol::Status;
use jukebox_core::{Track, TrackId};
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

#[derive(Clone)]
struct HttpState {
    handle: PlayerHandle,
}

#[derive(Serialize)]
struct PositionStatus {
    position_ms: u32,
    duration_ms: u32,
}

pub fn router(handle: PlayerHandle) -> Router {
    Router::new()
        .route("/api/status", get(get_status))
        .route("/api/song/:delta", get(get_song))
        .route("/api/position", get(get_position))
        .route("/api/toggle", get(toggle).post(toggle))
        .route("/api/skip/:delta", get(skip).post(skip))
        .route("/api/seek/:permille", get(seek).post(seek))
        .route("/api/queue/:id", post(enqueue))
        .route("/api/queue", axum::routing::delete(reset_queue))
        .route("/api/catalog/refresh", post(refresh_catalog))
        .route("/api/headset/:plugged", post(headset))
        .route("/api/call/:in_call", post(call))
        .route("/api/preference/:key", post(preference))
        .with_state(HttpState { handle })
        .layer(CorsLayer::permissive())
}

pub fn start_server(bind_address: String, port: u16, handle: PlayerHandle) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let app = router(handle);

        let addr = format!("{}:{}", bind_address, port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind HTTP server to {}: {}", addr, e);
                return;
            }
        };

        info!("HTTP API server listening on http://{}", addr);

        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error: {}", e);
        }
    })
}

fn accepted(result: jukebox_core::Result<()>, what: &str) -> StatusCode {
    match result {
        Ok(()) => StatusCode::OK,
        Err(e) => {
            error!("HTTP API: {} failed: {}", what, e);
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

async fn get_status(State(state): State<HttpState>) -> Result<Json<Status>, StatusCode> {
    state
        .handle
        .status()
        .await
        .map(Json)
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)
}

async fn get_song(
    State(state): State<HttpState>,
    Path(delta): Path<i32>,
) -> Result<Json<Track>, StatusCode> {
    match state.handle.song(delta).await {
        Ok(Some(track)) => Ok(Json(track)),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(_) => Err(StatusCode::SERVICE_UNAVAILABLE),
    }
}

async fn get_position(State(state): State<HttpState>) -> Json<PositionStatus> {
    Json(PositionStatus {
        position_ms: state.handle.position_ms(),
        duration_ms: state.handle.duration_ms(),
    })
}

async fn toggle(State(state): State<HttpState>) -> StatusCode {
    info!("HTTP API: Toggle playback");
    accepted(state.handle.toggle_playback(), "toggle")
}

async fn skip(State(state): State<HttpState>, Path(delta): Path<i32>) -> StatusCode {
    info!("HTTP API: Skip {:+}", delta);
    accepted(state.handle.skip(delta), "skip")
}

async fn seek(State(state): State<HttpState>, Path(permille): Path<u32>) -> StatusCode {
    if permille > 1000 {
        return StatusCode::BAD_REQUEST;
    }
    info!("HTTP API: Seek to {}‰", permille);
    accepted(state.handle.seek_to_progress(permille), "seek")
}

async fn enqueue(State(state): State<HttpState>, Path(id): Path<i32>) -> StatusCode {
    info!("HTTP API: Enqueue {}", id);
    accepted(state.handle.enqueue(TrackId(id)), "enqueue")
}

async fn reset_queue(State(state): State<HttpState>) -> StatusCode {
    info!("HTTP API: Reset queue");
    accepted(state.handle.reset_queue(), "reset queue")
}

async fn refresh_catalog(State(state): State<HttpState>) -> StatusCode {
    info!("HTTP API: Catalog refresh");
    accepted(state.handle.catalog_changed(), "catalog refresh")
}

async fn headset(State(state): State<HttpState>, Path(plugged): Path<bool>) -> StatusCode {
    accepted(state.handle.headset_changed(plugged), "headset")
}

async fn call(State(state): State<HttpState>, Path(in_call): Path<bool>) -> StatusCode {
    accepted(state.handle.call_state_changed(in_call), "call state")
}

async fn preference(State(state): State<HttpState>, Path(key): Path<String>) -> StatusCode {
    accepted(state.handle.preference_changed(key), "preference")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::start_service;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use jukebox_core::PlaybackState;
    use tower::ServiceExt;

    async fn call_api(app: &Router, method: Method, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .clone()
            .oneshot(Request::builder().method(method).uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20).await.unwrap();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    #[tokio::test]
    async fn test_status_and_song() {
        let (service, _player) = start_service(3);
        let app = router(service.handle());

        let (code, status) = call_api(&app, Method::GET, "/api/status").await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(status["state"], "Paused");
        assert_eq!(status["cursor"], 0);

        let (code, song) = call_api(&app, Method::GET, "/api/song/0").await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(song["id"], status["current"]["id"]);

        let (code, _) = call_api(&app, Method::GET, "/api/song/-1").await;
        assert_eq!(code, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_queue_and_skip() {
        let (service, _player) = start_service(3);
        let handle = service.handle();
        let app = router(handle.clone());

        let (code, _) = call_api(&app, Method::POST, "/api/queue/77").await;
        assert_eq!(code, StatusCode::OK);
        let (code, _) = call_api(&app, Method::POST, "/api/skip/1").await;
        assert_eq!(code, StatusCode::OK);

        let status = handle.status().await.unwrap();
        assert_eq!(status.cursor, 1);
        assert_eq!(status.current.map(|t| t.id), Some(TrackId(77)));

        let (code, _) = call_api(&app, Method::DELETE, "/api/queue").await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(handle.status().await.unwrap().queue_slot, 0);
    }

    #[tokio::test]
    async fn test_seek_bounds_and_position() {
        let (service, player) = start_service(3);
        let app = router(service.handle());

        let (code, _) = call_api(&app, Method::POST, "/api/seek/1001").await;
        assert_eq!(code, StatusCode::BAD_REQUEST);

        player.lock().unwrap().position_ms = 1234;
        let (code, position) = call_api(&app, Method::GET, "/api/position").await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(position["position_ms"], 1234);
        assert_eq!(position["duration_ms"], 180_000);
    }

    #[tokio::test]
    async fn test_stopped_dispatcher_is_unavailable() {
        let (service, _player) = start_service(3);
        let app = router(service.handle());
        assert_eq!(
            service.handle().status().await.unwrap().state,
            PlaybackState::Paused
        );
        service.shutdown().await;

        let (code, _) = call_api(&app, Method::POST, "/api/toggle").await;
        assert_eq!(code, StatusCode::SERVICE_UNAVAILABLE);
        let (code, _) = call_api(&app, Method::GET, "/api/status").await;
        assert_eq!(code, StatusCode::SERVICE_UNAVAILABLE);
    }
}
