//! Engine and bridge wiring.

use std::sync::Arc;

use anyhow::Context;

use finadvisor_ai::{
    AnalysisOrchestrator, EngineTransport, HealthAggregator, HealthMonitorHandle,
    HttpEngineClient, OrchestratorConfig, SubprocessTransport,
};

use crate::config::{BridgeConfig, TransportKind};

/// Long-lived services shared by every handler.
#[derive(Debug)]
pub struct AppServices {
    pub orchestrator: AnalysisOrchestrator,
    pub health: Arc<HealthAggregator>,
    subprocess: Option<Arc<SubprocessTransport>>,
}

impl AppServices {
    /// Wire the bridge around an already constructed transport.
    pub fn from_transport(transport: Arc<dyn EngineTransport>, config: &BridgeConfig) -> Self {
        Self {
            orchestrator: AnalysisOrchestrator::new(
                transport.clone(),
                OrchestratorConfig {
                    analysis_timeout: config.analysis_timeout,
                },
            ),
            health: Arc::new(HealthAggregator::new(transport, config.health_timeout)),
            subprocess: None,
        }
    }

    pub fn spawn_health_monitor(&self, config: &BridgeConfig) -> HealthMonitorHandle {
        self.health.clone().spawn_monitor(config.health_interval)
    }

    /// Stop the engine process, if this bridge owns one.
    pub async fn shutdown(&self) {
        if let Some(engine) = &self.subprocess {
            engine.shutdown().await;
        }
    }
}

/// Build the configured transport and the services around it.
pub async fn build_services(config: &BridgeConfig) -> anyhow::Result<AppServices> {
    match config.transport {
        TransportKind::Http => {
            let client = HttpEngineClient::connect(config.http.clone())
                .await
                .with_context(|| format!("failed to set up engine client for {}", config.http.base_url))?;
            tracing::info!(
                transport = "http",
                base_url = %client.base_url(),
                resolved = %client.resolved_addr(),
                "engine transport ready"
            );
            Ok(AppServices::from_transport(Arc::new(client), config))
        }
        TransportKind::Subprocess => {
            let engine = Arc::new(
                SubprocessTransport::spawn(config.engine_command.clone(), config.correlation)
                    .with_context(|| format!("failed to start engine `{}`", config.engine_command))?,
            );
            tracing::info!(
                transport = "subprocess",
                command = %config.engine_command,
                correlation = config.correlation.as_str(),
                "engine transport ready"
            );
            let mut services = AppServices::from_transport(engine.clone(), config);
            services.subprocess = Some(engine);
            Ok(services)
        }
    }
}
