use std::time::Duration;

use axum::http::{HeaderValue, Method};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use crate::session::ConnectionConfig;

pub const DEFAULT_PORT: u16 = 3000;

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    /// `0` binds an ephemeral port.
    pub port: u16,
    /// Browser origins allowed to connect. Empty means any origin.
    pub allowed_origins: Vec<String>,
    pub max_send_queue: usize,
    pub engine_queue: usize,
    pub heartbeat_interval: Duration,
    pub client_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: DEFAULT_PORT,
            allowed_origins: Vec::new(),
            max_send_queue: 256,
            engine_queue: 1024,
            heartbeat_interval: Duration::from_secs(30),
            client_timeout: Duration::from_secs(90),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("max_send_queue must be at least 1")]
    ZeroSendQueue,
    #[error("engine_queue must be at least 1")]
    ZeroEngineQueue,
    #[error("heartbeat interval must be non-zero")]
    ZeroHeartbeat,
    #[error("client timeout ({timeout:?}) must exceed the heartbeat interval ({heartbeat:?})")]
    TimeoutTooShort {
        timeout: Duration,
        heartbeat: Duration,
    },
    #[error("invalid allowed origin: {0:?}")]
    InvalidOrigin(String),
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_send_queue == 0 {
            return Err(ConfigError::ZeroSendQueue);
        }
        if self.engine_queue == 0 {
            return Err(ConfigError::ZeroEngineQueue);
        }
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::ZeroHeartbeat);
        }
        if self.client_timeout <= self.heartbeat_interval {
            return Err(ConfigError::TimeoutTooShort {
                timeout: self.client_timeout,
                heartbeat: self.heartbeat_interval,
            });
        }
        self.origin_policy()?;
        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn connection(&self) -> ConnectionConfig {
        ConnectionConfig {
            max_send_queue: self.max_send_queue,
            heartbeat_interval: self.heartbeat_interval,
            client_timeout: self.client_timeout,
        }
    }

    pub fn origin_policy(&self) -> Result<OriginPolicy, ConfigError> {
        if self.allowed_origins.is_empty() {
            return Ok(OriginPolicy::Any);
        }
        self.allowed_origins
            .iter()
            .map(|o| HeaderValue::from_str(o).map_err(|_| ConfigError::InvalidOrigin(o.clone())))
            .collect::<Result<Vec<_>, _>>()
            .map(OriginPolicy::List)
    }
}

/// Split a comma-separated origin list, e.g. from `ALLOWED_ORIGINS`.
pub fn parse_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Cross-origin policy for both plain HTTP (CORS) and WebSocket upgrades.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OriginPolicy {
    Any,
    List(Vec<HeaderValue>),
}

impl OriginPolicy {
    /// Requests without an `Origin` header (non-browser clients) are allowed.
    pub fn permits(&self, origin: Option<&HeaderValue>) -> bool {
        match (self, origin) {
            (Self::Any, _) | (Self::List(_), None) => true,
            (Self::List(allowed), Some(origin)) => allowed.contains(origin),
        }
    }

    pub fn cors_layer(&self) -> CorsLayer {
        let layer = CorsLayer::new().allow_methods([Method::GET, Method::POST]);
        match self {
            Self::Any => layer.allow_origin(Any),
            Self::List(allowed) => layer.allow_origin(AllowOrigin::list(allowed.iter().cloned())),
        }
    }
}
