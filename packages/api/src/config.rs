// ABOUTME: Server configuration read from the environment and validated at startup
// ABOUTME: Bind address, static user tokens and the registered-agent heartbeat interval

use std::collections::HashMap;
use std::env;
use std::net::SocketAddr;
use thiserror::Error;

pub const DEFAULT_BIND: &str = "127.0.0.1:4100";
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: i64 = 15;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("Invalid {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub bind: SocketAddr,
    /// Bearer token to user id
    pub user_tokens: HashMap<String, String>,
    /// Interval remote workers are told to heartbeat at
    pub heartbeat_interval_secs: i64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 4100)),
            user_tokens: HashMap::new(),
            heartbeat_interval_secs: DEFAULT_HEARTBEAT_INTERVAL_SECS,
        }
    }
}

impl ApiConfig {
    /// Read HATCHERY_BIND, HATCHERY_USER_TOKENS and HATCHERY_HEARTBEAT_INTERVAL_SECS
    pub fn from_env() -> Result<Self, ConfigError> {
        let bind = env::var("HATCHERY_BIND").unwrap_or_else(|_| DEFAULT_BIND.to_string());
        let bind = bind.parse().map_err(|e| ConfigError::Invalid {
            name: "HATCHERY_BIND",
            reason: format!("{} ({})", bind, e),
        })?;

        let user_tokens = match env::var("HATCHERY_USER_TOKENS") {
            Ok(raw) => parse_user_tokens(&raw)?,
            Err(_) => HashMap::new(),
        };

        let heartbeat_interval_secs = match env::var("HATCHERY_HEARTBEAT_INTERVAL_SECS") {
            Ok(raw) => raw
                .trim()
                .parse::<i64>()
                .ok()
                .filter(|secs| *secs > 0)
                .ok_or_else(|| ConfigError::Invalid {
                    name: "HATCHERY_HEARTBEAT_INTERVAL_SECS",
                    reason: raw.clone(),
                })?,
            Err(_) => DEFAULT_HEARTBEAT_INTERVAL_SECS,
        };

        Ok(Self {
            bind,
            user_tokens,
            heartbeat_interval_secs,
        })
    }
}

/// Parse `token:user` pairs separated by commas
pub fn parse_user_tokens(raw: &str) -> Result<HashMap<String, String>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once(':') {
            Some((token, user)) if !token.trim().is_empty() && !user.trim().is_empty() => {
                Ok((token.trim().to_string(), user.trim().to_string()))
            }
            _ => Err(ConfigError::Invalid {
                name: "HATCHERY_USER_TOKENS",
                reason: "expected comma-separated token:user pairs".to_string(),
            }),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_user_tokens() {
        let tokens = parse_user_tokens("tok-a:alice, tok-b:bob,").unwrap();
        assert_eq!(tokens.len(), 2);
        assert_eq!(tokens.get("tok-b").map(String::as_str), Some("bob"));
    }

    #[test]
    fn test_parse_user_tokens_rejects_bare_token() {
        assert!(parse_user_tokens("tok-a").is_err());
        assert!(parse_user_tokens(":alice").is_err());
    }

    #[test]
    fn test_default_bind() {
        assert_eq!(ApiConfig::default().bind.to_string(), DEFAULT_BIND);
    }
}
