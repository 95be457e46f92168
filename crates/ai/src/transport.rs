use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::result::BridgeResult;
use crate::wire::{AnalysisResult, EngineAnalyzeRequest, EngineHealth};

/// A way of reaching the analysis engine.
///
/// Implementations own delivery and decoding only: validation happens before
/// a request gets here and response mapping happens after. Both operations
/// must return within `timeout` and must not leave any per-call state behind
/// once they return.
#[async_trait]
pub trait EngineTransport: Send + Sync + 'static {
    /// Short label for logs (`http`, `subprocess`).
    fn name(&self) -> &'static str;

    /// Run one analysis on the engine.
    async fn analyze(
        &self,
        request: &EngineAnalyzeRequest,
        timeout: Duration,
    ) -> BridgeResult<AnalysisResult>;

    /// Ask the engine for its own health report.
    async fn health(&self, timeout: Duration) -> BridgeResult<EngineHealth>;

    /// Whether the transport can currently carry calls at all.
    ///
    /// A `false` here lets health checks skip a probe that is bound to fail.
    fn is_alive(&self) -> bool {
        true
    }
}

#[async_trait]
impl<T: EngineTransport + ?Sized> EngineTransport for Arc<T> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    async fn analyze(
        &self,
        request: &EngineAnalyzeRequest,
        timeout: Duration,
    ) -> BridgeResult<AnalysisResult> {
        (**self).analyze(request, timeout).await
    }

    async fn health(&self, timeout: Duration) -> BridgeResult<EngineHealth> {
        (**self).health(timeout).await
    }

    fn is_alive(&self) -> bool {
        (**self).is_alive()
    }
}
