//! HTTP API handlers

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use std::sync::Arc;

use crate::error::{Error, SessionError};
use crate::session::{Session, SessionStats, SessionStatus};
use crate::ui::server::AppState;

/// API response wrapper
#[derive(serde::Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

/// Client status
#[derive(serde::Serialize)]
pub struct ClientStatus {
    pub version: &'static str,
    pub uptime_seconds: u64,
    pub session: SessionStatus,
}

/// Get client and session status
pub async fn get_status(State(state): State<Arc<AppState>>) -> Json<ApiResponse<ClientStatus>> {
    Json(ApiResponse::ok(ClientStatus {
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.started.elapsed().as_secs(),
        session: state.controller.status(),
    }))
}

/// Get counters of the current or most recent session
pub async fn get_stats(State(state): State<Arc<AppState>>) -> Json<ApiResponse<SessionStats>> {
    Json(ApiResponse::ok(state.controller.stats()))
}

/// Start a session
pub async fn start_session(State(state): State<Arc<AppState>>) -> (StatusCode, Json<ApiResponse<Session>>) {
    match state.controller.start().await {
        Ok(session) => (StatusCode::CREATED, Json(ApiResponse::ok(session))),
        Err(e @ Error::Session(SessionError::AlreadyActive | SessionError::StartCancelled)) => {
            (StatusCode::CONFLICT, Json(ApiResponse::error(e.to_string())))
        }
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, Json(ApiResponse::error(e.to_string()))),
    }
}

/// Stop the session, if any
pub async fn stop_session(State(state): State<Arc<AppState>>) -> Json<ApiResponse<SessionStatus>> {
    state.controller.stop().await;
    Json(ApiResponse::ok(state.controller.status()))
}

/// Latest local preview with detections drawn in
pub async fn get_overlay_frame(State(state): State<Arc<AppState>>) -> Response {
    let composite = state.controller.overlay_frames().borrow().clone();
    match composite {
        Some(composite) => jpeg_response(&composite.image),
        None => (StatusCode::NOT_FOUND, Json(ApiResponse::<()>::error("no preview yet"))).into_response(),
    }
}

/// Latest frame decoded from the remote stream
pub async fn get_remote_frame(State(state): State<Arc<AppState>>) -> Response {
    let frame = state.controller.remote_frames().borrow().clone();
    match frame {
        Some(frame) => jpeg_response(&frame),
        None => (StatusCode::NOT_FOUND, Json(ApiResponse::<()>::error("no remote frame yet"))).into_response(),
    }
}

fn jpeg_response(image: &RgbImage) -> Response {
    let mut body = Vec::new();
    if let Err(e) = JpegEncoder::new_with_quality(&mut body, 80).encode_image(image) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiResponse::<()>::error(e.to_string())),
        )
            .into_response();
    }
    ([(header::CONTENT_TYPE, "image/jpeg")], body).into_response()
}
