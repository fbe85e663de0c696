//! HTTP API handlers

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;

use crate::audio::device::{list_output_devices, OutputDeviceInfo};
use crate::capture::sampler::SnapshotReceiver;
use crate::capture::source::list_monitors;
use crate::error::SessionError;
use crate::session::{SessionHandle, SessionSlot, SessionStatus, StopHandle};

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

/// The session the server currently reports on
struct AttachedSession {
    status: watch::Receiver<SessionStatus>,
    preview: SnapshotReceiver,
    stop: StopHandle,
}

/// State shared by all handlers
pub struct UiState {
    slot: SessionSlot,
    current: RwLock<Option<AttachedSession>>,
    started: Instant,
}

impl UiState {
    pub fn new(slot: SessionSlot) -> Self {
        Self {
            slot,
            current: RwLock::new(None),
            started: Instant::now(),
        }
    }

    /// Report on `handle` until another session is attached
    pub fn attach(&self, handle: &SessionHandle) {
        self.attach_parts(handle.status(), handle.preview(), handle.stop_handle());
    }

    pub(crate) fn attach_parts(
        &self,
        status: watch::Receiver<SessionStatus>,
        preview: SnapshotReceiver,
        stop: StopHandle,
    ) {
        *self.current.write() = Some(AttachedSession {
            status,
            preview,
            stop,
        });
    }

    fn session_status(&self) -> Option<SessionStatus> {
        self.current.read().as_ref().map(|s| s.status.borrow().clone())
    }
}

/// Service status
#[derive(serde::Serialize)]
pub struct ServiceStatus {
    pub active_session: Option<u64>,
    pub uptime_seconds: u64,
    /// Live (or final) status of the attached session
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionStatus>,
}

/// Get service and session status
pub async fn get_status(State(state): State<Arc<UiState>>) -> Json<ApiResponse<ServiceStatus>> {
    let status = ServiceStatus {
        active_session: state.slot.active_session(),
        uptime_seconds: state.started.elapsed().as_secs(),
        session: state.session_status(),
    };

    Json(ApiResponse::ok(status))
}

/// Latest rendered snapshot as JPEG, 204 when there is none
pub async fn get_preview(State(state): State<Arc<UiState>>) -> Response {
    let snapshot = state
        .current
        .read()
        .as_ref()
        .and_then(|s| s.preview.borrow().clone());

    match snapshot {
        Some(snapshot) => (
            [
                (header::CONTENT_TYPE, "image/jpeg"),
                (header::CACHE_CONTROL, "no-store"),
            ],
            snapshot.jpeg.clone(),
        )
            .into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

/// Stop the running session
pub async fn stop_session(
    State(state): State<Arc<UiState>>,
) -> (StatusCode, Json<ApiResponse<u64>>) {
    let Some(session_id) = state.slot.active_session() else {
        return (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error(SessionError::NotActive.to_string())),
        );
    };

    match state.current.read().as_ref() {
        Some(attached) => {
            attached.stop.stop();
            tracing::info!("Stop requested for session {} via API", session_id);
            (StatusCode::OK, Json(ApiResponse::ok(session_id)))
        }
        None => (
            StatusCode::CONFLICT,
            Json(ApiResponse::error("Session is not controllable from here")),
        ),
    }
}

/// Available capture and playback devices
#[derive(serde::Serialize)]
pub struct DeviceList {
    pub monitors: Vec<String>,
    pub outputs: Vec<OutputDeviceInfo>,
}

/// Get available monitors and output devices
pub async fn get_devices() -> (StatusCode, Json<ApiResponse<DeviceList>>) {
    let listed = tokio::task::spawn_blocking(|| DeviceList {
        monitors: list_monitors().unwrap_or_default(),
        outputs: list_output_devices(),
    })
    .await;

    match listed {
        Ok(devices) => (StatusCode::OK, Json(ApiResponse::ok(devices))),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiResponse::error(e.to_string())),
        ),
    }
}

/// Push session status to the client on every change
pub async fn status_socket(ws: WebSocketUpgrade, State(state): State<Arc<UiState>>) -> Response {
    let status = state.current.read().as_ref().map(|s| s.status.clone());
    ws.on_upgrade(move |socket| forward_status(socket, status))
}

async fn forward_status(mut socket: WebSocket, status: Option<watch::Receiver<SessionStatus>>) {
    let Some(mut status) = status else {
        let _ = socket.close().await;
        return;
    };

    loop {
        let text = match serde_json::to_string(&*status.borrow_and_update()) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!("Failed to serialize status: {}", e);
                break;
            }
        };
        if socket.send(Message::Text(text)).await.is_err() {
            break;
        }
        if status.changed().await.is_err() {
            break;
        }
    }
}
