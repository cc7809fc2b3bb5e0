//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create Axum Router with all handlers
//! - Wire up middleware (tracing, body limits)
//! - Admit generation requests into the queue
//! - Tie each caller's connection to a `ConnectionGuard`
//! - Serve until the shutdown broadcast fires

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::stream::{self, Stream, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};

use crate::admin;
use crate::config::GatewayConfig;
use crate::http::response::{
    completion_response, delta_event, done_event, error_response, queued_event,
};
use crate::net::{connection_pair, ConnectionGuard};
use crate::queue::{GenerationRequest, QueueManager, Ticket};
use crate::stream::ResponseEvent;

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<QueueManager>,
}

/// HTTP front end of the gateway.
pub struct HttpServer {
    router: Router,
}

impl HttpServer {
    pub fn new(config: &GatewayConfig, manager: Arc<QueueManager>) -> Self {
        let state = AppState { manager };
        let router = Self::build_router(config, state);
        Self { router }
    }

    /// Build the Axum router with all middleware layers.
    fn build_router(config: &GatewayConfig, state: AppState) -> Router {
        Router::new()
            .route("/v1/generate", post(generate_handler))
            .route("/health", get(health_handler))
            .merge(admin::setup_admin_router())
            .with_state(state)
            .layer(RequestBodyLimitLayer::new(config.listener.max_body_bytes))
            .layer(TraceLayer::new_for_http())
    }

    /// The configured router, for in-process serving.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Run the server, accepting connections on the given listener.
    pub async fn run(
        self,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        axum::serve(listener, self.router)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
            })
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

async fn health_handler() -> &'static str {
    "ok"
}

async fn generate_handler(
    State(state): State<AppState>,
    Json(request): Json<GenerationRequest>,
) -> Response {
    if request.size_chars() == 0 {
        return error_response(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "request needs a prompt or at least one message",
        );
    }

    let (connection, guard) = connection_pair();
    let streaming = request.stream;
    let ticket = state.manager.enqueue(request, Arc::new(connection));

    if streaming {
        sse_response(ticket, guard).into_response()
    } else {
        batched_response(ticket, guard).await
    }
}

/// Hold the guard until the final event; hyper drops this future if the caller leaves.
async fn batched_response(ticket: Ticket, guard: ConnectionGuard) -> Response {
    let _guard = guard;
    let id = ticket.id;
    match ticket.completion().await {
        Some(completion) => completion_response(completion),
        None => {
            tracing::error!(request_id = %id, "Response channel closed without a final event");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "request was dropped before completion",
            )
        }
    }
}

/// Stream events as SSE; the guard lives in the body stream.
fn sse_response(
    ticket: Ticket,
    guard: ConnectionGuard,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let Ticket {
        id,
        position,
        events,
    } = ticket;

    let queued = stream::once(async move { queued_event(&id.to_string(), position) });
    let rest = stream::unfold((events, Some(guard)), |(mut events, guard)| async move {
        let guard = guard?;
        match events.recv().await {
            Some(ResponseEvent::Delta(text)) => Some((delta_event(&text), (events, Some(guard)))),
            Some(ResponseEvent::Finished(completion)) => {
                Some((done_event(&completion), (events, None)))
            }
            None => None,
        }
    });

    Sse::new(queued.chain(rest).map(Ok)).keep_alive(KeepAlive::default())
}
