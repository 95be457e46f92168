use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Extension},
    http::StatusCode,
    response::IntoResponse,
    Json,
};

use finadvisor_ai::ErrorKind;
use finadvisor_core::AnalysisRequestInput;

use crate::app::errors::{analysis_failure_to_response, json_error};
use crate::app::services::AppServices;
use crate::context::RequestContext;

pub async fn analyze(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(ctx): Extension<RequestContext>,
    body: Result<Json<AnalysisRequestInput>, JsonRejection>,
) -> axum::response::Response {
    let Json(input) = match body {
        Ok(body) => body,
        Err(rejection) => {
            tracing::info!(request_id = %ctx.request_id(), error = %rejection.body_text(), "malformed analysis request");
            return json_error(
                StatusCode::BAD_REQUEST,
                ErrorKind::Validation.as_str(),
                rejection.body_text(),
            );
        }
    };

    match services.orchestrator.analyze(input).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(failure) => analysis_failure_to_response(failure),
    }
}
