use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::channel::{EngineChannel, EngineCommand};
use crate::correlator::{CallIdSequence, CorrelationMode, Correlator};
use crate::result::BridgeResult;
use crate::transport::EngineTransport;
use crate::wire::{self, AnalysisResult, EngineAnalyzeRequest, EngineCall, EngineHealth, EngineOp};

/// Default time the engine gets to exit after its stdin is closed.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Engine reached through a child process speaking newline-delimited JSON.
///
/// The process is started once and reused for every call. When it dies the
/// transport reports itself dead until [`SubprocessTransport::restart`] is
/// called; call ids keep increasing across restarts.
#[derive(Debug)]
pub struct SubprocessTransport {
    command: Option<EngineCommand>,
    mode: CorrelationMode,
    ids: Arc<CallIdSequence>,
    channel: RwLock<Arc<EngineChannel>>,
    shutdown_grace: Duration,
}

impl SubprocessTransport {
    /// Start the engine process. Must be called from within a tokio runtime.
    pub fn spawn(command: EngineCommand, mode: CorrelationMode) -> BridgeResult<Self> {
        let ids = Arc::new(CallIdSequence::new());
        let channel = EngineChannel::spawn(&command, Arc::new(Correlator::with_sequence(ids.clone())), mode)?;
        Ok(Self {
            command: Some(command),
            mode,
            ids,
            channel: RwLock::new(Arc::new(channel)),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        })
    }

    /// Wrap an already attached channel. Such a transport cannot restart.
    pub fn from_channel(channel: EngineChannel) -> Self {
        Self {
            command: None,
            mode: channel.mode(),
            ids: Arc::new(CallIdSequence::new()),
            channel: RwLock::new(Arc::new(channel)),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn mode(&self) -> CorrelationMode {
        self.mode
    }

    fn current(&self) -> Arc<EngineChannel> {
        self.channel
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn pending_calls(&self) -> usize {
        self.current().pending_calls()
    }

    /// Replace the engine process with a fresh one.
    ///
    /// Calls still waiting on the old process fail with a transport failure.
    pub async fn restart(&self) -> BridgeResult<()> {
        let Some(command) = &self.command else {
            return Err(crate::result::BridgeError::transport(
                "engine was attached externally and cannot be restarted",
            ));
        };

        let fresh = EngineChannel::spawn(
            command,
            Arc::new(Correlator::with_sequence(self.ids.clone())),
            self.mode,
        )?;
        let old = std::mem::replace(
            &mut *self.channel.write().unwrap_or_else(PoisonError::into_inner),
            Arc::new(fresh),
        );

        info!(engine = %command, "engine process restarted");
        old.shutdown(self.shutdown_grace).await;
        Ok(())
    }

    /// Close the engine's stdin, wait for it to exit, kill it if it does not.
    pub async fn shutdown(&self) {
        self.current().shutdown(self.shutdown_grace).await;
    }
}

#[async_trait]
impl EngineTransport for SubprocessTransport {
    fn name(&self) -> &'static str {
        "subprocess"
    }

    async fn analyze(
        &self,
        request: &EngineAnalyzeRequest,
        timeout: Duration,
    ) -> BridgeResult<AnalysisResult> {
        let reply = self.current().call(EngineCall::Analyze(request), timeout).await?;
        wire::decode_analysis(&reply).map_err(|e| {
            wire::log_rejected(self.name(), EngineOp::Analyze, &reply, &e);
            e.into()
        })
    }

    async fn health(&self, timeout: Duration) -> BridgeResult<EngineHealth> {
        let reply = self.current().call(EngineCall::Health, timeout).await?;
        wire::decode_health(&reply).map_err(|e| {
            wire::log_rejected(self.name(), EngineOp::Health, &reply, &e);
            e.into()
        })
    }

    fn is_alive(&self) -> bool {
        self.current().is_alive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::BridgeError;
    use finadvisor_core::{Transaction, UserProfile};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, duplex};

    fn request() -> EngineAnalyzeRequest {
        EngineAnalyzeRequest {
            transactions: vec![Transaction {
                date: "2024-03-01".to_string(),
                amount: 5000.0,
                category: "Salary".to_string(),
                description: "Monthly salary".to_string(),
            }],
            user_profile: UserProfile {
                age: 35,
                annual_income: 85_000.0,
                super_balance: 150_000.0,
                emergency_fund: 20_000.0,
                investment_assets: 50_000.0,
                super_contributions: 10_000.0,
                work_expenses: 5_000.0,
                investment_diversity: 2,
            },
        }
    }

    /// Engine that answers analyze with the wrapped envelope and health with a
    /// fixed report, echoing each request id.
    fn attached_transport() -> SubprocessTransport {
        engine_answering(|req| {
            if req["kind"] == "analyze" {
                serde_json::json!({
                    "status": "success",
                    "data": {
                        "tax_optimization": ["Claim work expenses"],
                        "retirement_planning": ["Top up super"],
                        "confidence_score": 0.85
                    }
                })
            } else {
                serde_json::json!({"status": "healthy", "version": "1.0.0", "model_ready": true})
            }
        })
    }

    /// In-memory engine whose `result` for each request comes from `answer`.
    fn engine_answering(answer: fn(&serde_json::Value) -> serde_json::Value) -> SubprocessTransport {
        let (bridge_side, engine_side) = duplex(64 * 1024);
        let (bridge_read, bridge_write) = tokio::io::split(bridge_side);
        let (engine_read, mut engine_write) = tokio::io::split(engine_side);

        tokio::spawn(async move {
            let mut lines = BufReader::new(engine_read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let req: serde_json::Value = serde_json::from_str(&line).unwrap();
                let result = answer(&req);
                let reply = serde_json::json!({"id": req["id"], "result": result});
                engine_write
                    .write_all(format!("{reply}\n").as_bytes())
                    .await
                    .unwrap();
            }
        });

        SubprocessTransport::from_channel(EngineChannel::from_io(
            bridge_read,
            bridge_write,
            Arc::new(Correlator::new()),
            CorrelationMode::Tagged,
        ))
    }

    #[tokio::test]
    async fn analyze_unwraps_the_success_envelope() {
        let transport = attached_transport();
        let result = transport
            .analyze(&request(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(result.tax_optimization, vec!["Claim work expenses"]);
        assert_eq!(result.confidence_score, 0.85);
        assert_eq!(transport.pending_calls(), 0);
    }

    #[tokio::test]
    async fn health_reports_engine_fields() {
        let transport = attached_transport();
        let health = transport.health(Duration::from_secs(5)).await.unwrap();
        assert_eq!(health.version.as_deref(), Some("1.0.0"));
        assert_eq!(health.model_ready, Some(true));
        assert!(transport.is_alive());
    }

    #[tokio::test]
    async fn wrong_shaped_replies_are_decode_errors() {
        let transport = engine_answering(|req| {
            if req["kind"] == "analyze" {
                serde_json::json!({"tax_optimization": "not a list", "padding": "x".repeat(2048)})
            } else {
                serde_json::json!({"version": 3})
            }
        });

        let err = transport
            .analyze(&request(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::DecodeError(_)), "got {err:?}");

        let err = transport.health(Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, BridgeError::DecodeError(_)), "got {err:?}");

        // A bad reply is a per-call failure; the channel stays usable.
        assert!(transport.is_alive());
        assert_eq!(transport.pending_calls(), 0);
    }

    #[tokio::test]
    async fn attached_transport_cannot_restart() {
        let transport = attached_transport();
        let err = transport.restart().await.unwrap_err();
        assert!(matches!(err, BridgeError::TransportFailure(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn restart_replaces_a_dead_process() {
        // Exits after the first request without replying.
        let command = EngineCommand::new("sh").arg("-c").arg("read line; exit 0");
        let transport = SubprocessTransport::spawn(command, CorrelationMode::Fifo)
            .unwrap()
            .with_shutdown_grace(Duration::from_millis(200));

        let err = transport.health(Duration::from_secs(10)).await.unwrap_err();
        assert!(matches!(err, BridgeError::TransportFailure(_)), "got {err:?}");

        tokio::time::timeout(Duration::from_secs(5), async {
            while transport.is_alive() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        transport.restart().await.unwrap();
        assert!(transport.is_alive());
        transport.shutdown().await;
        assert!(!transport.is_alive());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn missing_program_is_a_transport_failure() {
        let command = EngineCommand::new("definitely-not-an-engine-binary-4c1f");
        let err = SubprocessTransport::spawn(command, CorrelationMode::Tagged).unwrap_err();
        assert!(matches!(err, BridgeError::TransportFailure(_)));
    }
}
