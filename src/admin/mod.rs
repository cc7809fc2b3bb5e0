pub mod handlers;

use axum::{
    routing::{get, post},
    Router,
};
use crate::http::server::AppState;
use self::handlers::*;

pub fn setup_admin_router() -> Router<AppState> {
    Router::new()
        .route("/status", get(get_status))
        .route("/status/requests/{id}", get(get_request))
        .route("/admin/rotate", post(rotate))
}
