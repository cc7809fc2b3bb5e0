//! Response mapping.
//!
//! # Responsibilities
//! - Map a request's completion to an HTTP status and JSON body
//! - Shape SSE events for streaming callers
//!
//! # Status Mapping
//! - `completed` → 200
//! - timeouts and `superseded` → 503 with `Retry-After`
//! - backend failure → 502
//! - configuration failure → 500

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{sse::Event, IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::error::GatewayError;
use crate::stream::{Completion, Outcome};

/// Seconds a caller should wait before resubmitting a retryable failure.
pub const RETRY_AFTER_SECS: u64 = 1;

#[derive(Debug, Serialize)]
pub struct GenerateResponse {
    pub id: String,
    pub content: String,
    pub reason: &'static str,
    pub received: u64,
    pub elapsed_ms: u64,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub reason: &'static str,
    pub message: String,
    pub retryable: bool,
}

/// Final SSE event payload.
#[derive(Debug, Serialize)]
pub struct DoneEvent {
    pub id: String,
    pub reason: &'static str,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub received: u64,
}

pub fn status_for(outcome: &Outcome) -> StatusCode {
    match outcome {
        Outcome::Completed => StatusCode::OK,
        Outcome::Failed(err) if err.is_retryable() => StatusCode::SERVICE_UNAVAILABLE,
        Outcome::Failed(GatewayError::Backend(_)) => StatusCode::BAD_GATEWAY,
        Outcome::Failed(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Build the non-streaming response for `completion`.
pub fn completion_response(completion: Completion) -> Response {
    let status = status_for(&completion.outcome);
    match completion.outcome {
        Outcome::Completed => (
            status,
            Json(GenerateResponse {
                id: completion.id.to_string(),
                reason: Outcome::Completed.reason(),
                content: completion.content,
                received: completion.received,
                elapsed_ms: completion.elapsed.as_millis() as u64,
            }),
        )
            .into_response(),
        Outcome::Failed(ref err) => {
            let body = ErrorBody {
                error: ErrorDetail {
                    id: Some(completion.id.to_string()),
                    reason: completion.outcome.reason(),
                    message: err.to_string(),
                    retryable: err.is_retryable(),
                },
            };
            let mut response = (status, Json(body)).into_response();
            if err.is_retryable() {
                response
                    .headers_mut()
                    .insert(header::RETRY_AFTER, HeaderValue::from(RETRY_AFTER_SECS));
            }
            response
        }
    }
}

/// Plain error response for requests that never reached the queue.
pub fn error_response(status: StatusCode, reason: &'static str, message: impl Into<String>) -> Response {
    let body = ErrorBody {
        error: ErrorDetail {
            id: None,
            reason,
            message: message.into(),
            retryable: false,
        },
    };
    (status, Json(body)).into_response()
}

pub fn queued_event(id: &str, position: usize) -> Event {
    Event::default()
        .event("queued")
        .data(serde_json::json!({ "id": id, "position": position }).to_string())
}

pub fn delta_event(text: &str) -> Event {
    Event::default()
        .event("delta")
        .data(serde_json::json!({ "text": text }).to_string())
}

pub fn done_event(completion: &Completion) -> Event {
    let (retryable, message) = match &completion.outcome {
        Outcome::Completed => (false, None),
        Outcome::Failed(err) => (err.is_retryable(), Some(err.to_string())),
    };
    let payload = DoneEvent {
        id: completion.id.to_string(),
        reason: completion.outcome.reason(),
        retryable,
        message,
        received: completion.received,
    };
    let data = serde_json::to_string(&payload).unwrap_or_else(|_| "{}".to_string());
    Event::default().event("done").data(data)
}
