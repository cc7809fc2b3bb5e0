use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::http::response::error_response;
use crate::http::server::AppState;
use crate::queue::{QueueStatus, RequestId};

#[derive(Debug, Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub status: &'static str,
    pub queue: QueueStatus,
}

#[derive(Debug, Serialize)]
pub struct RotateResult {
    pub superseded: Option<String>,
}

pub async fn get_status(State(state): State<AppState>) -> Json<SystemStatus> {
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        status: "operational",
        queue: state.manager.status(),
    })
}

pub async fn get_request(State(state): State<AppState>, Path(raw): Path<String>) -> Response {
    let id: RequestId = match raw.parse() {
        Ok(id) => id,
        Err(_) => {
            return error_response(StatusCode::BAD_REQUEST, "invalid_request", "malformed request id")
        }
    };
    match state.manager.lifecycle(id) {
        Some(status) => Json(status).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "not_found", format!("unknown request {id}")),
    }
}

pub async fn rotate(State(state): State<AppState>) -> Json<RotateResult> {
    let superseded = state.manager.supersede_current().await;
    Json(RotateResult {
        superseded: superseded.map(|id| id.to_string()),
    })
}
