use std::sync::Arc;

use axum::{extract::Extension, response::IntoResponse, Json};
use chrono::Utc;

use finadvisor_ai::HealthSnapshot;

use crate::app::services::AppServices;

/// Probe now. Always 200: an unhealthy engine is reported in the body.
pub async fn health(Extension(services): Extension<Arc<AppServices>>) -> impl IntoResponse {
    Json(services.health.check().await)
}

/// Last background snapshot; probes on demand if none was taken yet.
pub async fn latest_health(Extension(services): Extension<Arc<AppServices>>) -> impl IntoResponse {
    let snapshot = match services.health.latest() {
        Some(snapshot) => snapshot,
        None => HealthSnapshot {
            status: services.health.check().await,
            checked_at: Utc::now(),
        },
    };
    Json(snapshot)
}
