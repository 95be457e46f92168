//! Analysis orchestration: the one place that knows both the caller-facing
//! shapes and the engine's shapes.

use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{info, warn};

use finadvisor_core::{AnalysisRequest, AnalysisRequestInput, AnalysisResponse};

use crate::result::{BridgeError, ErrorKind};
use crate::transport::EngineTransport;
use crate::wire::{AnalysisResult, EngineAnalyzeRequest};

pub const DEFAULT_ANALYSIS_TIMEOUT: Duration = Duration::from_millis(30_000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorConfig {
    pub analysis_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            analysis_timeout: DEFAULT_ANALYSIS_TIMEOUT,
        }
    }
}

/// What an external caller learns about a failed analysis.
///
/// Only validation messages are specific; every other kind carries a fixed
/// message and the underlying detail goes to the log.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct AnalysisFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl AnalysisFailure {
    fn from_bridge(err: &BridgeError) -> Self {
        let kind = err.kind();
        let message = match err {
            BridgeError::Validation(msg) => msg.clone(),
            _ => public_message(kind).to_string(),
        };
        Self { kind, message }
    }
}

fn public_message(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::Validation => "invalid analysis request",
        ErrorKind::Timeout => "AI service did not respond in time",
        ErrorKind::TransportFailure => "AI service is unavailable",
        ErrorKind::EngineError => "AI service failed to analyze the request",
        ErrorKind::DecodeError => "AI service returned an unexpected response",
    }
}

/// Field renaming and regrouping only.
pub fn to_engine_request(request: AnalysisRequest) -> EngineAnalyzeRequest {
    EngineAnalyzeRequest {
        transactions: request.transactions,
        user_profile: request.user_profile,
    }
}

/// Engine result to caller response: tax lines joined with `\n`,
/// retirement lines passed through, confidence becomes the risk score.
pub fn into_response(result: AnalysisResult) -> AnalysisResponse {
    AnalysisResponse {
        analysis: result.tax_optimization.join("\n"),
        recommendations: result.retirement_planning,
        risk_score: result.confidence_score,
    }
}

/// Validates, forwards to the engine and maps the result back.
///
/// Holds no per-call state.
#[derive(Clone)]
pub struct AnalysisOrchestrator {
    transport: Arc<dyn EngineTransport>,
    config: OrchestratorConfig,
}

impl core::fmt::Debug for AnalysisOrchestrator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AnalysisOrchestrator")
            .field("transport", &self.transport.name())
            .field("config", &self.config)
            .finish()
    }
}

impl AnalysisOrchestrator {
    pub fn new(transport: Arc<dyn EngineTransport>, config: OrchestratorConfig) -> Self {
        Self { transport, config }
    }

    pub async fn analyze(
        &self,
        input: AnalysisRequestInput,
    ) -> Result<AnalysisResponse, AnalysisFailure> {
        let request = input.validate().map_err(|e| {
            let err = BridgeError::from(e);
            info!(error = %err, "analysis request rejected");
            AnalysisFailure::from_bridge(&err)
        })?;

        let transactions = request.transactions.len();
        let engine_request = to_engine_request(request);
        let started = Instant::now();

        match self
            .transport
            .analyze(&engine_request, self.config.analysis_timeout)
            .await
        {
            Ok(result) => {
                info!(
                    transport = self.transport.name(),
                    transactions,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "analysis completed"
                );
                Ok(into_response(result))
            }
            Err(err) => {
                warn!(
                    transport = self.transport.name(),
                    kind = err.kind().as_str(),
                    error = %err,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "analysis failed"
                );
                Err(AnalysisFailure::from_bridge(&err))
            }
        }
    }
}
