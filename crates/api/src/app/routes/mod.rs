use axum::{
    routing::{get, post},
    Router,
};

pub mod financial;
pub mod system;

/// Router for every bridge endpoint.
pub fn router() -> Router {
    Router::new()
        .route("/financial/analyze", post(financial::analyze))
        .route("/health", get(system::health))
        .route("/health/latest", get(system::latest_health))
}
