//! Health aggregation: one composite status from the bridge and the engine.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use finadvisor_core::{AI_SERVICE_CHECK, HealthState, HealthStatus};

use crate::result::BridgeError;
use crate::transport::EngineTransport;

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(5_000);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(30_000);

/// Version reported for an engine that could not be asked.
pub const UNKNOWN_VERSION: &str = "unknown";

/// A composite status and when it was taken.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub checked_at: DateTime<Utc>,
    #[serde(flatten)]
    pub status: HealthStatus,
}

/// Probes the engine and folds the outcome into a [`HealthStatus`].
///
/// Probe failures are data: [`HealthAggregator::check`] never errors.
pub struct HealthAggregator {
    transport: Arc<dyn EngineTransport>,
    probe_timeout: Duration,
    latest: RwLock<Option<HealthSnapshot>>,
}

impl core::fmt::Debug for HealthAggregator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HealthAggregator")
            .field("transport", &self.transport.name())
            .field("probe_timeout", &self.probe_timeout)
            .finish_non_exhaustive()
    }
}

/// Engine sub-check for a failed probe.
fn engine_down(err: &BridgeError) -> HealthStatus {
    let cause = match err {
        BridgeError::Timeout => "timeout".to_string(),
        other => other.to_string(),
    };
    HealthStatus::unhealthy(cause)
        .with_version(UNKNOWN_VERSION)
        .with_model_ready(false)
}

impl HealthAggregator {
    pub fn new(transport: Arc<dyn EngineTransport>, probe_timeout: Duration) -> Self {
        Self {
            transport,
            probe_timeout,
            latest: RwLock::new(None),
        }
    }

    /// Probe the engine once and compose the bridge status.
    ///
    /// Returns within roughly `probe_timeout` even if the transport ignores
    /// its own deadline.
    pub async fn check(&self) -> HealthStatus {
        let engine = self.probe_engine().await;
        let status = HealthStatus::bridge(HealthStatus::healthy(), engine);
        self.record(status.clone());
        status
    }

    async fn probe_engine(&self) -> HealthStatus {
        if !self.transport.is_alive() {
            return engine_down(&BridgeError::transport("engine channel is down"));
        }

        let probe = self.transport.health(self.probe_timeout);
        // Slack on top of the transport's own deadline.
        let outer = self.probe_timeout + Duration::from_millis(250);

        match tokio::time::timeout(outer, probe).await {
            Ok(Ok(report)) => {
                let state = report.state();
                let mut status = report.into_status();
                if state == HealthState::Unhealthy && status.error.is_none() {
                    status.error = Some("engine reports unhealthy".to_string());
                }
                status
            }
            Ok(Err(err)) => {
                debug!(transport = self.transport.name(), error = %err, "engine health probe failed");
                engine_down(&err)
            }
            Err(_) => engine_down(&BridgeError::Timeout),
        }
    }

    fn record(&self, status: HealthStatus) {
        let mut latest = self.latest.write().unwrap_or_else(PoisonError::into_inner);
        let previous = latest.as_ref().map(|s| s.status.status);

        if previous != Some(status.status) {
            let cause = status
                .sub_check(AI_SERVICE_CHECK)
                .and_then(|c| c.error.clone())
                .unwrap_or_default();
            match status.status {
                HealthState::Healthy => info!(previous = ?previous, "bridge health is healthy"),
                HealthState::Unhealthy => warn!(previous = ?previous, cause = %cause, "bridge health is unhealthy"),
            }
        }

        *latest = Some(HealthSnapshot {
            checked_at: Utc::now(),
            status,
        });
    }

    /// The last status produced by [`HealthAggregator::check`], if any.
    pub fn latest(&self) -> Option<HealthSnapshot> {
        self.latest
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Start polling on a fixed interval; the first probe runs immediately.
    ///
    /// The interval is the only retry mechanism: a failed probe is recorded
    /// and the next attempt waits for the next tick.
    pub fn spawn_monitor(self: Arc<Self>, interval: Duration) -> HealthMonitorHandle {
        let shutdown = Arc::new(Notify::new());
        let trigger = Arc::new(Notify::new());
        let task = {
            let shutdown = shutdown.clone();
            let trigger = trigger.clone();
            tokio::spawn(async move {
                info!(interval_ms = interval.as_millis() as u64, "health monitor started");
                let mut ticks = tokio::time::interval(interval);
                ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

                loop {
                    tokio::select! {
                        _ = shutdown.notified() => {
                            info!("health monitor received shutdown signal");
                            break;
                        }
                        _ = ticks.tick() => {}
                        _ = trigger.notified() => {}
                    }
                    self.check().await;
                }
            })
        };

        HealthMonitorHandle {
            shutdown,
            trigger,
            task: Some(task),
        }
    }
}

/// Handle for the running health monitor (shutdown + trigger hook).
#[derive(Debug)]
pub struct HealthMonitorHandle {
    shutdown: Arc<Notify>,
    trigger: Arc<Notify>,
    task: Option<JoinHandle<()>>,
}

impl HealthMonitorHandle {
    /// Run a probe now instead of waiting for the next tick.
    ///
    /// Triggers coalesce: several before the monitor wakes up cause one probe.
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    /// Stop the monitor and wait for an in-progress probe to finish.
    pub async fn shutdown(mut self) {
        self.shutdown.notify_one();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "health monitor task failed");
            }
        }
    }
}

impl Drop for HealthMonitorHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
