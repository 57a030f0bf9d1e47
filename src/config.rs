/// Environment-sourced configuration, read once at startup.
///
/// Every variable has a documented default so a bare `jac-irc-proxy`
/// starts a loopback-only proxy against the production gateway:
///
///   WS_URL            WebSocket gateway URL
///   HOST              bind address (default 127.0.0.1, 0.0.0.0 for public)
///   PORT              plaintext IRC port (default 6667)
///   SSL_ENABLED       enable the TLS listener (default false)
///   SSL_PORT          TLS IRC port (default 6697)
///   SSL_CERT          path to PEM certificate (required when SSL enabled)
///   SSL_KEY           path to PEM private key (required when SSL enabled)
///   ADMIN_PORT        admin API port, bound on loopback (default 6680)
///   ADMIN_TOKEN       bearer token; unset means the admin API rejects everything
///   LOG_LEVEL         debug | info | warn | error (default info)
///   RATE_CONN_PER_MIN per-IP connection admission quota (default 10)
///   RATE_MSG_PER_SEC  per-connection message token refill rate (default 4)
///   RATE_MSG_BURST    message token bucket capacity (default 8)
///   RATE_AUTO_BAN     violations before auto-ban, 0 disables (default 5)
///   RATE_BAN_DURATION ban duration in minutes (default 15)
use serde::{Deserialize, Serialize};

use crate::error::ProxyError;

/// Rate-limiting thresholds. Mutable at runtime through the admin API.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateConfig {
    /// Connections admitted per IP per sliding 60-second window.
    pub conn_per_min: u32,
    /// Message token refill rate, tokens per second.
    pub msg_per_sec: u32,
    /// Message token bucket capacity (burst allowance).
    pub msg_burst: u32,
    /// Message-rate violations before an automatic ban. 0 disables auto-ban.
    pub auto_ban: u32,
    /// Ban duration in minutes, for both automatic and admin bans.
    pub ban_duration_min: u64,
}

/// Full proxy configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub ws_url: String,
    pub host: String,
    pub port: u16,
    pub ssl_enabled: bool,
    pub ssl_port: u16,
    pub ssl_cert: String,
    pub ssl_key: String,
    pub admin_port: u16,
    pub admin_token: Option<String>,
    pub log_level: String,
    pub rate: RateConfig,
}

const DEFAULT_WS_URL: &str = "wss://gateway.justachat.net/irc";

impl Config {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ProxyError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through a lookup function (injectable for tests).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ProxyError> {
        let config = Self {
            ws_url: lookup("WS_URL").unwrap_or_else(|| DEFAULT_WS_URL.into()),
            host: lookup("HOST").unwrap_or_else(|| "127.0.0.1".into()),
            port: parse(&lookup, "PORT", 6667)?,
            ssl_enabled: lookup("SSL_ENABLED").is_some_and(|v| v == "true"),
            ssl_port: parse(&lookup, "SSL_PORT", 6697)?,
            ssl_cert: lookup("SSL_CERT").unwrap_or_default(),
            ssl_key: lookup("SSL_KEY").unwrap_or_default(),
            admin_port: parse(&lookup, "ADMIN_PORT", 6680)?,
            admin_token: lookup("ADMIN_TOKEN").filter(|t| !t.is_empty()),
            log_level: lookup("LOG_LEVEL").unwrap_or_else(|| "info".into()),
            rate: RateConfig {
                conn_per_min: parse(&lookup, "RATE_CONN_PER_MIN", 10)?,
                msg_per_sec: parse(&lookup, "RATE_MSG_PER_SEC", 4)?,
                msg_burst: parse(&lookup, "RATE_MSG_BURST", 8)?,
                auto_ban: parse(&lookup, "RATE_AUTO_BAN", 5)?,
                ban_duration_min: parse(&lookup, "RATE_BAN_DURATION", 15)?,
            },
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ProxyError> {
        if self.ssl_enabled && (self.ssl_cert.is_empty() || self.ssl_key.is_empty()) {
            return Err(ProxyError::Config(
                "SSL_ENABLED=true but SSL_CERT and SSL_KEY not provided".into(),
            ));
        }
        if self.rate.conn_per_min == 0 {
            return Err(ProxyError::Config("RATE_CONN_PER_MIN must be greater than 0".into()));
        }
        if self.rate.msg_per_sec == 0 {
            return Err(ProxyError::Config("RATE_MSG_PER_SEC must be greater than 0".into()));
        }
        if self.rate.msg_burst == 0 {
            return Err(ProxyError::Config("RATE_MSG_BURST must be greater than 0".into()));
        }
        if self.rate.ban_duration_min == 0 {
            return Err(ProxyError::Config("RATE_BAN_DURATION must be greater than 0".into()));
        }
        Ok(())
    }
}

fn parse<T: std::str::FromStr>(
    lookup: impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ProxyError> {
    match lookup(key) {
        Some(raw) => raw
            .parse()
            .map_err(|_| ProxyError::Config(format!("{key}={raw} is not a valid value"))),
        None => Ok(default),
    }
}
