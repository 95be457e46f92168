use axum::http::StatusCode;
use axum::response::IntoResponse;
use chrono::{SecondsFormat, Utc};
use serde_json::json;

use finadvisor_ai::{AnalysisFailure, ErrorKind};

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::TransportFailure => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::EngineError | ErrorKind::DecodeError => StatusCode::BAD_GATEWAY,
    }
}

pub fn analysis_failure_to_response(failure: AnalysisFailure) -> axum::response::Response {
    json_error(status_for(failure.kind), failure.kind.as_str(), failure.message)
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "statusCode": status.as_u16(),
            "error": code,
            "message": message.into(),
            "timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        })),
    )
        .into_response()
}
