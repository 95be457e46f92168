//! Environment configuration.

use std::str::FromStr;
use std::time::Duration;

use finadvisor_ai::{AddressFamily, CorrelationMode, EngineCommand, HttpEngineConfig};

pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_ENGINE_COMMAND: &str = "python main.py";

const DEFAULT_ANALYSIS_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_HEALTH_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_HEALTH_INTERVAL_MS: u64 = 30_000;

/// How the bridge reaches the engine.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum TransportKind {
    #[default]
    Http,
    Subprocess,
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(TransportKind::Http),
            "subprocess" | "process" | "stdio" => Ok(TransportKind::Subprocess),
            other => Err(format!("unknown transport {other:?} (expected http or subprocess)")),
        }
    }
}

/// Everything the bridge needs to start, passed explicitly to constructors.
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeConfig {
    pub port: u16,
    pub transport: TransportKind,
    pub http: HttpEngineConfig,
    pub engine_command: EngineCommand,
    pub correlation: CorrelationMode,
    pub analysis_timeout: Duration,
    pub health_timeout: Duration,
    pub health_interval: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl BridgeConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; bad values log a warning and use the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let analysis_timeout = millis(&lookup, "AI_SERVICE_TIMEOUT", DEFAULT_ANALYSIS_TIMEOUT_MS);

        let engine_command = lookup("AI_ENGINE_COMMAND")
            .and_then(|raw| {
                let parsed = EngineCommand::parse(&raw);
                if parsed.is_none() {
                    tracing::warn!("AI_ENGINE_COMMAND is empty; using {DEFAULT_ENGINE_COMMAND:?}");
                }
                parsed
            })
            .or_else(|| EngineCommand::parse(DEFAULT_ENGINE_COMMAND))
            .unwrap_or_else(|| EngineCommand::new("python").arg("main.py"));
        let engine_command = match lookup("AI_ENGINE_DIR").filter(|dir| !dir.trim().is_empty()) {
            Some(dir) => engine_command.with_current_dir(dir.trim()),
            None => engine_command,
        };

        Self {
            port: parsed(&lookup, "PORT", DEFAULT_PORT),
            transport: parsed(&lookup, "AI_TRANSPORT", TransportKind::default()),
            http: HttpEngineConfig {
                base_url: lookup("AI_SERVICE_URL")
                    .filter(|v| !v.trim().is_empty())
                    .unwrap_or_else(|| finadvisor_ai::http::DEFAULT_BASE_URL.to_string()),
                timeout: analysis_timeout,
                family: parsed(&lookup, "AI_ADDRESS_FAMILY", AddressFamily::default()),
            },
            engine_command,
            correlation: parsed(&lookup, "AI_CORRELATION", CorrelationMode::default()),
            analysis_timeout,
            health_timeout: millis(&lookup, "AI_HEALTH_TIMEOUT", DEFAULT_HEALTH_TIMEOUT_MS),
            health_interval: millis(&lookup, "AI_HEALTH_INTERVAL", DEFAULT_HEALTH_INTERVAL_MS),
        }
    }
}

fn parsed<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: FromStr,
    T::Err: core::fmt::Display,
{
    match lookup(key) {
        None => default,
        Some(raw) => match raw.trim().parse() {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(key, value = %raw, error = %e, "invalid configuration value; using default");
                default
            }
        },
    }
}

fn millis(lookup: &impl Fn(&str) -> Option<String>, key: &str, default_ms: u64) -> Duration {
    let ms: u64 = parsed(lookup, key, default_ms);
    if ms == 0 {
        tracing::warn!(key, "zero duration is not allowed; using default");
        return Duration::from_millis(default_ms);
    }
    Duration::from_millis(ms)
}
