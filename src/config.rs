use std::{env, net::SocketAddr, time::Duration};

use thiserror::Error;

use crate::mcp::connection::DEFAULT_REQUEST_TIMEOUT;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub bind_port: u16,
    pub ws_path: String,
    /// `None` when `MCP_REQUEST_TIMEOUT_SECS=0`.
    pub request_timeout: Option<Duration>,
    pub connection_tracking: bool,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("BIND_PORT must be a valid u16")]
    InvalidPort,
    #[error("invalid bind address or port")]
    InvalidSocket,
    #[error("MCP_WS_PATH must start with '/'")]
    InvalidWsPath,
    #[error("MCP_WS_PATH must be a literal path without route parameters or wildcards")]
    UnsupportedWsPath,
    #[error("MCP_WS_PATH collides with a built-in route")]
    ReservedWsPath,
    #[error("MCP_REQUEST_TIMEOUT_SECS must be a non-negative integer")]
    InvalidRequestTimeout,
    #[error("MCP_CONNECTION_TRACKING must be true or false")]
    InvalidConnectionTracking,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Parses configuration from any key lookup, e.g. a map in tests.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let value = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let bind_addr = value("BIND_ADDR").unwrap_or_else(|| "127.0.0.1".to_string());
        let bind_port = value("BIND_PORT")
            .map(|value| value.parse::<u16>().map_err(|_| ConfigError::InvalidPort))
            .transpose()?
            .unwrap_or(8080);
        let ws_path = value("MCP_WS_PATH").unwrap_or_else(|| "/ws".to_string());
        validate_ws_path(&ws_path)?;
        let request_timeout = match value("MCP_REQUEST_TIMEOUT_SECS") {
            None => Some(DEFAULT_REQUEST_TIMEOUT),
            Some(raw) => match raw
                .parse::<u64>()
                .map_err(|_| ConfigError::InvalidRequestTimeout)?
            {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
        };
        let connection_tracking = value("MCP_CONNECTION_TRACKING")
            .map(|value| parse_bool(&value).ok_or(ConfigError::InvalidConnectionTracking))
            .transpose()?
            .unwrap_or(true);

        let config = Self {
            bind_addr,
            bind_port,
            ws_path,
            request_timeout,
            connection_tracking,
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

/// Paths served next to the WebSocket route.
const RESERVED_PATHS: [&str; 2] = ["/health", "/.well-known/mcp"];

/// The router treats `:name`, `*rest` and `{name}` segments as captures.
fn validate_ws_path(path: &str) -> Result<(), ConfigError> {
    if !path.starts_with('/') {
        return Err(ConfigError::InvalidWsPath);
    }
    let captures = path
        .split('/')
        .any(|segment| segment.starts_with(':') || segment.starts_with('*'));
    if captures || path.contains(['{', '}']) {
        return Err(ConfigError::UnsupportedWsPath);
    }
    if RESERVED_PATHS.contains(&path) {
        return Err(ConfigError::ReservedWsPath);
    }
    Ok(())
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn parse(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn parse_defaults() {
        let config = parse(&[]).expect("config should parse");
        assert_eq!(config.bind_addr, "127.0.0.1");
        assert_eq!(config.bind_port, 8080);
        assert_eq!(config.ws_path, "/ws");
        assert_eq!(config.request_timeout, Some(Duration::from_secs(30)));
        assert!(config.connection_tracking);
    }

    #[test]
    fn overrides_are_applied() {
        let config = parse(&[
            ("BIND_ADDR", "0.0.0.0"),
            ("BIND_PORT", "9000"),
            ("MCP_WS_PATH", "/mcp/ws"),
            ("MCP_REQUEST_TIMEOUT_SECS", "5"),
            ("MCP_CONNECTION_TRACKING", "off"),
        ])
        .expect("config should parse");

        assert_eq!(config.bind_socket().expect("socket").port(), 9000);
        assert_eq!(config.ws_path, "/mcp/ws");
        assert_eq!(config.request_timeout, Some(Duration::from_secs(5)));
        assert!(!config.connection_tracking);
    }

    #[test]
    fn zero_timeout_disables_the_bound() {
        let config = parse(&[("MCP_REQUEST_TIMEOUT_SECS", "0")]).expect("config should parse");
        assert_eq!(config.request_timeout, None);
    }

    #[test]
    fn invalid_values_fail() {
        assert!(matches!(
            parse(&[("BIND_PORT", "70000")]),
            Err(ConfigError::InvalidPort)
        ));
        assert!(matches!(
            parse(&[("BIND_ADDR", "not an address")]),
            Err(ConfigError::InvalidSocket)
        ));
        assert!(matches!(
            parse(&[("MCP_WS_PATH", "ws")]),
            Err(ConfigError::InvalidWsPath)
        ));
        assert!(matches!(
            parse(&[("MCP_REQUEST_TIMEOUT_SECS", "-1")]),
            Err(ConfigError::InvalidRequestTimeout)
        ));
        assert!(matches!(
            parse(&[("MCP_CONNECTION_TRACKING", "maybe")]),
            Err(ConfigError::InvalidConnectionTracking)
        ));
    }

    #[test]
    fn ws_path_must_be_a_literal_route() {
        for path in ["/ws/:id", "/ws/*rest", "/ws/{id}", "/*", "/ws/{{x}}"] {
            assert!(
                matches!(
                    parse(&[("MCP_WS_PATH", path)]),
                    Err(ConfigError::UnsupportedWsPath)
                ),
                "{path} should be rejected"
            );
        }
        assert!(matches!(
            parse(&[("MCP_WS_PATH", "/health")]),
            Err(ConfigError::ReservedWsPath)
        ));

        let config = parse(&[("MCP_WS_PATH", "/v1/socket.ws")]).expect("literal path");
        assert_eq!(config.ws_path, "/v1/socket.ws");
    }
}
