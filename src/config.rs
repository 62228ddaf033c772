use std::{env, net::SocketAddr, time::Duration};

use thiserror::Error;
use url::Url;

pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1";
pub const DEFAULT_BIND_PORT: u16 = 3000;
pub const DEFAULT_SSE_KEEPALIVE_SECS: u64 = 15;
pub const DEFAULT_SERVER_URL: &str = "http://localhost:3000/mcp";

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub bind_port: u16,
    pub sse_keep_alive: Duration,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_url: Url,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("BIND_PORT must be a valid u16")]
    InvalidPort,
    #[error("MCP_SSE_KEEPALIVE_SECS must be a positive integer")]
    InvalidKeepAlive,
    #[error("invalid bind address or port")]
    InvalidSocket,
    #[error("MCP_SERVER_URL must be an absolute http(s) url")]
    InvalidServerUrl,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|key| env::var(key).ok())
    }

    pub fn from_vars<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let bind_addr =
            non_empty(lookup("BIND_ADDR")).unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());
        let bind_port = non_empty(lookup("BIND_PORT"))
            .map(|value| value.parse::<u16>().map_err(|_| ConfigError::InvalidPort))
            .transpose()?
            .unwrap_or(DEFAULT_BIND_PORT);
        let keep_alive_secs = non_empty(lookup("MCP_SSE_KEEPALIVE_SECS"))
            .map(|value| {
                value
                    .parse::<u64>()
                    .ok()
                    .filter(|secs| *secs > 0)
                    .ok_or(ConfigError::InvalidKeepAlive)
            })
            .transpose()?
            .unwrap_or(DEFAULT_SSE_KEEPALIVE_SECS);

        let config = Self {
            bind_addr,
            bind_port,
            sse_keep_alive: Duration::from_secs(keep_alive_secs),
        };

        let _ = config.bind_socket()?;
        Ok(config)
    }

    pub fn bind_socket(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.bind_addr, self.bind_port)
            .parse::<SocketAddr>()
            .map_err(|_| ConfigError::InvalidSocket)
    }
}

impl ClientConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|key| env::var(key).ok())
    }

    pub fn from_vars<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let raw =
            non_empty(lookup("MCP_SERVER_URL")).unwrap_or_else(|| DEFAULT_SERVER_URL.to_string());
        let server_url = Url::parse(&raw).map_err(|_| ConfigError::InvalidServerUrl)?;
        if !matches!(server_url.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidServerUrl);
        }

        Ok(Self { server_url })
    }
}
