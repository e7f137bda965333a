use std::{env, net::SocketAddr, str::FromStr, time::Duration};

use thiserror::Error;

use crate::upstream::pagination::{DEFAULT_MAX_PAGES, DEFAULT_PAGE_SIZE};

pub const DEFAULT_UPSTREAM_BASE_URL: &str = "https://api.instantly.ai/api/v2";

#[derive(Debug, Clone)]
pub struct Config {
    pub upstream_api_key: String,
    pub upstream_base_url: String,
    pub upstream_timeout: Duration,
    pub api_token: Option<String>,
    pub bind_addr: String,
    pub bind_port: u16,
    pub session_idle_timeout: Duration,
    pub session_sweep_interval: Duration,
    pub sse_keepalive: Duration,
    pub pagination_max_pages: usize,
    pub pagination_page_size: u32,
    pub rate_reserve_threshold: u32,
    pub rate_max_wait: Duration,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("UPSTREAM_API_KEY is required and must not be empty")]
    MissingUpstreamApiKey,
    #[error("UPSTREAM_BASE_URL must be an http(s) URL")]
    InvalidUpstreamBaseUrl,
    #[error("{name} must be a positive integer")]
    InvalidNumber { name: &'static str },
    #[error("BIND_PORT must be a valid u16")]
    InvalidPort,
    #[error("invalid bind address or port")]
    InvalidSocket,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds the configuration from any variable source; unset and blank
    /// variables fall back to their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let upstream_api_key = read("UPSTREAM_API_KEY").ok_or(ConfigError::MissingUpstreamApiKey)?;
        let upstream_base_url = read("UPSTREAM_BASE_URL")
            .unwrap_or_else(|| DEFAULT_UPSTREAM_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        if !(upstream_base_url.starts_with("https://") || upstream_base_url.starts_with("http://"))
        {
            return Err(ConfigError::InvalidUpstreamBaseUrl);
        }

        let bind_port = read("BIND_PORT")
            .map(|value| value.parse::<u16>().map_err(|_| ConfigError::InvalidPort))
            .transpose()?
            .unwrap_or(8080);

        let config = Self {
            upstream_api_key,
            upstream_base_url,
            upstream_timeout: seconds(&read, "UPSTREAM_TIMEOUT_SECS", 30)?,
            api_token: read("MCP_API_TOKEN"),
            bind_addr: read("BIND_ADDR").unwrap_or_else(|| "127.0.0.1".to_string()),
            bind_port,
            session_idle_timeout: seconds(&read, "SESSION_IDLE_TIMEOUT_SECS", 1800)?,
            session_sweep_interval: seconds(&read, "SESSION_SWEEP_INTERVAL_SECS", 60)?,
            sse_keepalive: seconds(&read, "SSE_KEEPALIVE_SECS", 15)?,
            pagination_max_pages: positive(&read, "PAGINATION_MAX_PAGES", DEFAULT_MAX_PAGES)?,
            pagination_page_size: positive(&read, "PAGINATION_PAGE_SIZE", DEFAULT_PAGE_SIZE)?,
            rate_reserve_threshold: number(&read, "RATE_RESERVE_THRESHOLD", 1)?,
            rate_max_wait: seconds(&read, "RATE_MAX_WAIT_SECS", 120)?,
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

fn number<T, R>(read: &R, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    R: Fn(&str) -> Option<String>,
{
    read(name)
        .map(|value| {
            value
                .parse::<T>()
                .map_err(|_| ConfigError::InvalidNumber { name })
        })
        .transpose()
        .map(|value| value.unwrap_or(default))
}

fn positive<T, R>(read: &R, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + Default,
    R: Fn(&str) -> Option<String>,
{
    let value = number(read, name, default)?;
    if value > T::default() {
        Ok(value)
    } else {
        Err(ConfigError::InvalidNumber { name })
    }
}

fn seconds<R>(read: &R, name: &'static str, default: u64) -> Result<Duration, ConfigError>
where
    R: Fn(&str) -> Option<String>,
{
    positive(read, name, default).map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn parse_defaults() {
        let config = config_from(&[("UPSTREAM_API_KEY", "key")]).expect("config should parse");

        assert_eq!(config.upstream_base_url, DEFAULT_UPSTREAM_BASE_URL);
        assert_eq!(config.upstream_timeout, Duration::from_secs(30));
        assert_eq!(config.api_token, None);
        assert_eq!(config.bind_addr, "127.0.0.1");
        assert_eq!(config.bind_port, 8080);
        assert_eq!(config.session_idle_timeout, Duration::from_secs(1800));
        assert_eq!(config.session_sweep_interval, Duration::from_secs(60));
        assert_eq!(config.sse_keepalive, Duration::from_secs(15));
        assert_eq!(config.pagination_max_pages, 50);
        assert_eq!(config.pagination_page_size, 100);
        assert_eq!(config.rate_reserve_threshold, 1);
        assert_eq!(config.rate_max_wait, Duration::from_secs(120));
    }

    #[test]
    fn missing_upstream_key_fails() {
        let err = config_from(&[("UPSTREAM_API_KEY", "  ")]).expect_err("blank key");
        assert!(matches!(err, ConfigError::MissingUpstreamApiKey));
    }

    #[test]
    fn overrides_are_applied() {
        let config = config_from(&[
            ("UPSTREAM_API_KEY", "key"),
            ("UPSTREAM_BASE_URL", "http://localhost:9000/api/v2/"),
            ("MCP_API_TOKEN", "token-1234567890ab"),
            ("PAGINATION_MAX_PAGES", "5"),
            ("RATE_RESERVE_THRESHOLD", "0"),
        ])
        .expect("config should parse");

        assert_eq!(config.upstream_base_url, "http://localhost:9000/api/v2");
        assert_eq!(config.api_token.as_deref(), Some("token-1234567890ab"));
        assert_eq!(config.pagination_max_pages, 5);
        assert_eq!(config.rate_reserve_threshold, 0);
    }

    #[test]
    fn invalid_numbers_name_the_variable() {
        let err = config_from(&[("UPSTREAM_API_KEY", "key"), ("PAGINATION_PAGE_SIZE", "0")])
            .expect_err("zero page size");
        assert_eq!(err.to_string(), "PAGINATION_PAGE_SIZE must be a positive integer");

        let err = config_from(&[("UPSTREAM_API_KEY", "key"), ("SSE_KEEPALIVE_SECS", "soon")])
            .expect_err("not a number");
        assert!(matches!(
            err,
            ConfigError::InvalidNumber {
                name: "SSE_KEEPALIVE_SECS"
            }
        ));
    }

    #[test]
    fn invalid_port_and_url_fail() {
        assert!(matches!(
            config_from(&[("UPSTREAM_API_KEY", "key"), ("BIND_PORT", "99999")]),
            Err(ConfigError::InvalidPort)
        ));
        assert!(matches!(
            config_from(&[("UPSTREAM_API_KEY", "key"), ("UPSTREAM_BASE_URL", "ftp://x")]),
            Err(ConfigError::InvalidUpstreamBaseUrl)
        ));
    }
}
