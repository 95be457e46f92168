//! Engine-side shapes and line framing.
//!
//! The engine speaks snake_case JSON regardless of what callers send. Nothing
//! here derives numbers; fields are renamed and regrouped only.

use serde::{Deserialize, Serialize};
use tracing::warn;
use serde_json::Value as JsonValue;

use finadvisor_core::{CallId, HealthState, HealthStatus, Transaction, UserProfile};

use crate::result::BridgeError;

/// Body of an engine `analyze` call (`{transactions, user_profile}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineAnalyzeRequest {
    pub transactions: Vec<Transaction>,
    pub user_profile: UserProfile,
}

/// Aggregate figures some engine versions attach to a result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineMetrics {
    pub total_income: f64,
    pub total_expenses: f64,
    pub savings_rate: f64,
}

/// Engine-shaped analysis result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub tax_optimization: Vec<String>,
    pub retirement_planning: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_assessment: Option<String>,
    pub confidence_score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<EngineMetrics>,
}

/// Either `{"status": "...", "data": {...}}` or a bare result.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum AnalysisEnvelope {
    Wrapped {
        status: String,
        #[serde(default)]
        data: Option<AnalysisResult>,
        #[serde(default)]
        detail: Option<JsonValue>,
        #[serde(default)]
        message: Option<JsonValue>,
    },
    Bare(AnalysisResult),
}

/// Why an engine payload could not be turned into a typed value.
#[derive(Debug, Clone, PartialEq)]
pub enum EnvelopeError {
    /// The payload does not have the expected shape.
    Malformed(String),
    /// The payload is well-formed but reports a failure.
    Rejected(String),
}

impl From<EnvelopeError> for BridgeError {
    fn from(value: EnvelopeError) -> Self {
        match value {
            EnvelopeError::Malformed(msg) => BridgeError::DecodeError(msg),
            EnvelopeError::Rejected(detail) => BridgeError::engine(None, detail),
        }
    }
}

/// Longest excerpt of a raw engine payload written to the log.
pub(crate) const LOGGED_PAYLOAD_BYTES: usize = 512;

/// Cut `raw` to at most `max` bytes without splitting a character.
pub(crate) fn truncate_for_log(raw: &str, max: usize) -> &str {
    if raw.len() <= max {
        return raw;
    }
    let mut end = max;
    while !raw.is_char_boundary(end) {
        end -= 1;
    }
    &raw[..end]
}

/// Bounded rendering of a payload for log lines.
pub(crate) fn payload_excerpt(payload: &JsonValue) -> String {
    let raw = payload.to_string();
    truncate_for_log(&raw, LOGGED_PAYLOAD_BYTES).to_string()
}

/// Log a reply that decoded as JSON but could not be used.
pub(crate) fn log_rejected(transport: &'static str, op: EngineOp, payload: &JsonValue, err: &EnvelopeError) {
    warn!(
        transport,
        kind = op.as_str(),
        error = ?err,
        raw = %payload_excerpt(payload),
        "engine reply rejected"
    );
}

/// Decode an `analyze` reply, accepting the wrapped and the bare form.
pub fn decode_analysis(payload: &JsonValue) -> Result<AnalysisResult, EnvelopeError> {
    let envelope = AnalysisEnvelope::deserialize(payload)
        .map_err(|e| EnvelopeError::Malformed(format!("analysis result: {e}")))?;

    match envelope {
        AnalysisEnvelope::Bare(result) => Ok(result),
        AnalysisEnvelope::Wrapped {
            status,
            data,
            detail,
            message,
        } => {
            if status != "success" {
                let why = detail
                    .or(message)
                    .map(|v| match v {
                        JsonValue::String(s) => s,
                        other => other.to_string(),
                    })
                    .unwrap_or_else(|| format!("engine reported status {status:?}"));
                return Err(EnvelopeError::Rejected(why));
            }
            data.ok_or_else(|| {
                EnvelopeError::Malformed("successful analysis reply without data".to_string())
            })
        }
    }
}

/// Health object reported by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineHealth {
    pub status: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub model_ready: Option<bool>,
    #[serde(default)]
    pub error: Option<String>,
}

impl EngineHealth {
    pub fn state(&self) -> HealthState {
        match self.status.to_ascii_lowercase().as_str() {
            "healthy" | "ok" => HealthState::Healthy,
            _ => HealthState::Unhealthy,
        }
    }

    pub fn into_status(self) -> HealthStatus {
        let mut status = HealthStatus::healthy();
        status.status = self.state();
        status.version = self.version;
        status.model_ready = self.model_ready;
        status.error = self.error;
        status
    }
}

pub fn decode_health(payload: &JsonValue) -> Result<EngineHealth, EnvelopeError> {
    EngineHealth::deserialize(payload).map_err(|e| EnvelopeError::Malformed(format!("health reply: {e}")))
}

/// Operation names understood by the engine.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineOp {
    Analyze,
    Health,
}

impl EngineOp {
    pub fn as_str(self) -> &'static str {
        match self {
            EngineOp::Analyze => "analyze",
            EngineOp::Health => "health",
        }
    }
}

/// One request to the engine, borrowed for the duration of the call.
#[derive(Debug, Copy, Clone)]
pub enum EngineCall<'a> {
    Analyze(&'a EngineAnalyzeRequest),
    Health,
}

impl EngineCall<'_> {
    pub fn op(&self) -> EngineOp {
        match self {
            EngineCall::Analyze(_) => EngineOp::Analyze,
            EngineCall::Health => EngineOp::Health,
        }
    }
}

#[derive(Serialize)]
struct TaggedRequest<'a> {
    id: CallId,
    kind: EngineOp,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<&'a EngineAnalyzeRequest>,
}

/// Encode a request line carrying a correlation id (no trailing newline).
pub fn encode_tagged(id: CallId, call: EngineCall<'_>) -> Result<String, BridgeError> {
    let payload = match call {
        EngineCall::Analyze(req) => Some(req),
        EngineCall::Health => None,
    };
    serde_json::to_string(&TaggedRequest {
        id,
        kind: call.op(),
        payload,
    })
    .map_err(|e| BridgeError::decode(format!("encode request: {e}")))
}

/// Encode a request line for engines that cannot echo ids.
pub fn encode_legacy(call: EngineCall<'_>) -> Result<String, BridgeError> {
    match call {
        EngineCall::Analyze(req) => serde_json::to_string(req)
            .map_err(|e| BridgeError::decode(format!("encode request: {e}"))),
        EngineCall::Health => Ok("health".to_string()),
    }
}

#[derive(Deserialize)]
struct TaggedReply {
    id: CallId,
    #[serde(default)]
    result: Option<JsonValue>,
    #[serde(default)]
    error: Option<JsonValue>,
}

/// One decoded reply line.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyLine {
    /// Reply naming the call it answers.
    Tagged {
        id: CallId,
        outcome: Result<JsonValue, BridgeError>,
    },
    /// Reply without a correlation id; the whole line is the payload.
    Untagged(JsonValue),
}

/// Parse one complete line emitted by the engine.
pub fn parse_reply(line: &str) -> Result<ReplyLine, BridgeError> {
    let value: JsonValue =
        serde_json::from_str(line).map_err(|e| BridgeError::decode(format!("reply is not JSON: {e}")))?;

    let tagged = value.as_object().is_some_and(|o| o.contains_key("id"));
    if !tagged {
        return Ok(ReplyLine::Untagged(value));
    }

    let reply: TaggedReply = serde_json::from_value(value)
        .map_err(|e| BridgeError::decode(format!("tagged reply: {e}")))?;

    let outcome = match (reply.error, reply.result) {
        (Some(err), _) if !err.is_null() => {
            let detail = match err {
                JsonValue::String(s) => s,
                JsonValue::Object(ref o) => o
                    .get("message")
                    .and_then(|m| m.as_str())
                    .map(str::to_string)
                    .unwrap_or_else(|| err.to_string()),
                other => other.to_string(),
            };
            Err(BridgeError::engine(None, detail))
        }
        (_, Some(result)) => Ok(result),
        (_, None) => Err(BridgeError::decode(format!(
            "reply {} carries neither result nor error",
            reply.id
        ))),
    };

    Ok(ReplyLine::Tagged {
        id: reply.id,
        outcome,
    })
}
