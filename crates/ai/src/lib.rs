//! `finadvisor-ai`
//!
//! **Responsibility:** the bridge between callers and the financial analysis
//! engine.
//!
//! - Reaches the engine either as a long-lived subprocess speaking
//!   newline-delimited JSON, or over HTTP. Both sit behind [`EngineTransport`].
//! - Pairs each engine reply with the call that caused it ([`Correlator`]).
//! - Owns the one conversion between caller shapes and engine shapes
//!   ([`AnalysisOrchestrator`]).
//! - Folds engine health into a composite status ([`HealthAggregator`]).
//!
//! This crate never computes financial figures itself.

pub mod channel;
pub mod correlator;
pub mod health;
pub mod http;
pub mod orchestrator;
pub mod result;
pub mod subprocess;
pub mod transport;
pub mod wire;

pub use channel::{EngineChannel, EngineCommand, LineBuffer, MAX_LINE_BYTES};
pub use correlator::{CallIdSequence, CorrelationMode, Correlator, PendingCall};
pub use health::{HealthAggregator, HealthMonitorHandle, HealthSnapshot};
pub use http::{AddressFamily, HttpEngineClient, HttpEngineConfig, HttpEngineError};
pub use orchestrator::{AnalysisFailure, AnalysisOrchestrator, OrchestratorConfig};
pub use result::{BridgeError, BridgeResult, ErrorKind};
pub use subprocess::SubprocessTransport;
pub use transport::EngineTransport;
pub use wire::{AnalysisResult, EngineAnalyzeRequest, EngineHealth};
