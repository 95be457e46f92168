//! HTTP client for engines served over a network port.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};

use crate::result::{BridgeError, BridgeResult};
use crate::transport::EngineTransport;
use crate::wire::{self, AnalysisResult, EngineAnalyzeRequest, EngineHealth, EngineOp};

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8080";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(30_000);

const MAX_LOGGED_BODY: usize = 512;

/// Address family the engine host must resolve to.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum AddressFamily {
    #[default]
    Ipv4,
    Ipv6,
}

impl AddressFamily {
    pub fn as_str(self) -> &'static str {
        match self {
            AddressFamily::Ipv4 => "ipv4",
            AddressFamily::Ipv6 => "ipv6",
        }
    }

    fn matches(self, ip: IpAddr) -> bool {
        matches!(
            (self, ip),
            (AddressFamily::Ipv4, IpAddr::V4(_)) | (AddressFamily::Ipv6, IpAddr::V6(_))
        )
    }

    fn unspecified(self) -> IpAddr {
        match self {
            AddressFamily::Ipv4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            AddressFamily::Ipv6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }
}

impl FromStr for AddressFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ipv4" | "4" | "v4" => Ok(AddressFamily::Ipv4),
            "ipv6" | "6" | "v6" => Ok(AddressFamily::Ipv6),
            other => Err(format!("unknown address family {other:?} (expected ipv4 or ipv6)")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpEngineConfig {
    pub base_url: String,
    /// Upper bound for any single request made by the client.
    pub timeout: Duration,
    pub family: AddressFamily,
}

impl Default for HttpEngineConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: DEFAULT_TIMEOUT,
            family: AddressFamily::default(),
        }
    }
}

/// Failures of one HTTP exchange with the engine.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum HttpEngineError {
    #[error("request timed out")]
    Timeout,

    /// Connection refused, reset, or name resolution failed.
    #[error("network error: {0}")]
    Network(String),

    /// The engine answered with a non-2xx status.
    #[error("engine returned status {status}: {body}")]
    Engine { status: u16, body: String },

    #[error("unexpected response body: {0}")]
    Decode(String),

    #[error("invalid engine client configuration: {0}")]
    InvalidConfig(String),
}

impl From<HttpEngineError> for BridgeError {
    fn from(value: HttpEngineError) -> Self {
        match value {
            HttpEngineError::Timeout => BridgeError::Timeout,
            HttpEngineError::Network(msg) | HttpEngineError::InvalidConfig(msg) => {
                BridgeError::TransportFailure(msg)
            }
            HttpEngineError::Engine { status, body } => BridgeError::engine(Some(status), body),
            HttpEngineError::Decode(msg) => BridgeError::DecodeError(msg),
        }
    }
}

fn classify(err: reqwest::Error) -> HttpEngineError {
    if err.is_timeout() {
        HttpEngineError::Timeout
    } else if err.is_decode() {
        HttpEngineError::Decode(err.to_string())
    } else {
        HttpEngineError::Network(err.to_string())
    }
}

/// Engine client with a fixed base address.
///
/// The engine host is resolved once, at connect time, to an address of the
/// configured family; the connection never falls back to the other family.
#[derive(Debug, Clone)]
pub struct HttpEngineClient {
    client: Client,
    base: Url,
    resolved: SocketAddr,
}

impl HttpEngineClient {
    pub async fn connect(config: HttpEngineConfig) -> Result<Self, HttpEngineError> {
        let mut base = Url::parse(&config.base_url)
            .map_err(|e| HttpEngineError::InvalidConfig(format!("{}: {e}", config.base_url)))?;
        // Endpoints are joined onto the base, which replaces the last path
        // segment unless the path ends in `/`.
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let host = base
            .host_str()
            .ok_or_else(|| HttpEngineError::InvalidConfig(format!("{}: missing host", config.base_url)))?
            .to_string();
        let port = base
            .port_or_known_default()
            .ok_or_else(|| HttpEngineError::InvalidConfig(format!("{}: missing port", config.base_url)))?;

        let mut builder = Client::builder()
            .timeout(config.timeout)
            .local_address(config.family.unspecified());

        let bare_host = host.trim_start_matches('[').trim_end_matches(']');
        let resolved = match bare_host.parse::<IpAddr>() {
            Ok(ip) if config.family.matches(ip) => SocketAddr::new(ip, port),
            Ok(ip) => {
                return Err(HttpEngineError::InvalidConfig(format!(
                    "{ip} is not an {} address",
                    config.family.as_str()
                )));
            }
            Err(_) => {
                let addr = tokio::net::lookup_host((bare_host, port))
                    .await
                    .map_err(|e| HttpEngineError::Network(format!("resolve {host}: {e}")))?
                    .find(|addr| config.family.matches(addr.ip()))
                    .ok_or_else(|| {
                        HttpEngineError::Network(format!(
                            "{host} has no {} address",
                            config.family.as_str()
                        ))
                    })?;
                builder = builder.resolve(bare_host, addr);
                addr
            }
        };

        let client = builder
            .build()
            .map_err(|e| HttpEngineError::InvalidConfig(e.to_string()))?;

        debug!(base_url = %base, %resolved, family = config.family.as_str(), "engine HTTP client ready");
        Ok(Self {
            client,
            base,
            resolved,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    pub fn resolved_addr(&self) -> SocketAddr {
        self.resolved
    }

    fn endpoint(&self, path: &str) -> Result<Url, HttpEngineError> {
        self.base
            .join(path)
            .map_err(|e| HttpEngineError::InvalidConfig(format!("{path}: {e}")))
    }

    /// `POST /analyze`; returns the raw 2xx body.
    pub async fn post_analyze(
        &self,
        request: &EngineAnalyzeRequest,
        timeout: Duration,
    ) -> Result<JsonValue, HttpEngineError> {
        let response = self
            .client
            .post(self.endpoint("analyze")?)
            .timeout(timeout)
            .json(request)
            .send()
            .await
            .map_err(classify)?;
        read_json(response).await
    }

    /// `GET /health`; returns the raw 2xx body.
    pub async fn get_health(&self, timeout: Duration) -> Result<JsonValue, HttpEngineError> {
        let response = self
            .client
            .get(self.endpoint("health")?)
            .timeout(timeout)
            .send()
            .await
            .map_err(classify)?;
        read_json(response).await
    }
}

async fn read_json(response: reqwest::Response) -> Result<JsonValue, HttpEngineError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        warn!(status = status.as_u16(), body = %wire::truncate_for_log(&body, MAX_LOGGED_BODY), "engine returned an error status");
        return Err(HttpEngineError::Engine {
            status: status.as_u16(),
            body,
        });
    }
    if status == StatusCode::NO_CONTENT {
        return Err(HttpEngineError::Decode("empty response body".to_string()));
    }
    response.json::<JsonValue>().await.map_err(|e| {
        if e.is_timeout() {
            HttpEngineError::Timeout
        } else {
            HttpEngineError::Decode(e.to_string())
        }
    })
}

#[async_trait]
impl EngineTransport for HttpEngineClient {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn analyze(
        &self,
        request: &EngineAnalyzeRequest,
        timeout: Duration,
    ) -> BridgeResult<AnalysisResult> {
        let body = self.post_analyze(request, timeout).await?;
        wire::decode_analysis(&body).map_err(|e| {
            wire::log_rejected(self.name(), EngineOp::Analyze, &body, &e);
            e.into()
        })
    }

    async fn health(&self, timeout: Duration) -> BridgeResult<EngineHealth> {
        let body = self.get_health(timeout).await?;
        wire::decode_health(&body).map_err(|e| {
            wire::log_rejected(self.name(), EngineOp::Health, &body, &e);
            e.into()
        })
    }
}
