// ABOUTME: Worker configuration read from HATCHERY_* environment variables
// ABOUTME: Agent API keys present in the worker's environment are forwarded to agent runs

use crate::error::{ClientError, Result};
use std::collections::HashMap;
use std::env;
use std::time::Duration;

pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 15;
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 30;
pub const DEFAULT_TASK_RETENTION_SECS: u64 = 3600;

/// Environment variables handed to agent processes when set on the worker host
pub const FORWARDED_SECRETS: &[&str] = &[
    "ANTHROPIC_API_KEY",
    "ANTHROPIC_MODEL",
    "OPENAI_API_KEY",
    "GEMINI_API_KEY",
];

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Base URL of the Hatchery server
    pub server_url: String,
    pub target_id: String,
    /// Bearer secret issued when the target was registered
    pub agent_token: String,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    /// How long in-flight runs may finish on shutdown before they are stopped
    pub shutdown_grace: Duration,
    /// How long finished tasks stay in the local mirror for inspection
    pub task_retention: Duration,
    pub secrets: HashMap<String, String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:4100".to_string(),
            target_id: String::new(),
            agent_token: String::new(),
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_INTERVAL_SECS),
            shutdown_grace: Duration::from_secs(DEFAULT_SHUTDOWN_GRACE_SECS),
            task_retention: Duration::from_secs(DEFAULT_TASK_RETENTION_SECS),
            secrets: HashMap::new(),
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let required = |name: &str| {
            lookup(name)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| ClientError::config(format!("{} must be set", name)))
        };

        config.server_url = required("HATCHERY_SERVER_URL")?
            .trim_end_matches('/')
            .to_string();
        config.target_id = required("HATCHERY_TARGET_ID")?;
        config.agent_token = required("HATCHERY_AGENT_TOKEN")?;

        if let Some(secs) = seconds(&lookup, "HATCHERY_POLL_INTERVAL_SECS")? {
            config.poll_interval = secs;
        }
        if let Some(secs) = seconds(&lookup, "HATCHERY_HEARTBEAT_INTERVAL_SECS")? {
            config.heartbeat_interval = secs;
        }
        if let Some(secs) = seconds(&lookup, "HATCHERY_SHUTDOWN_GRACE_SECS")? {
            config.shutdown_grace = secs;
        }
        if let Some(secs) = seconds(&lookup, "HATCHERY_TASK_RETENTION_SECS")? {
            config.task_retention = secs;
        }

        config.secrets = FORWARDED_SECRETS
            .iter()
            .filter_map(|name| lookup(name).map(|value| (name.to_string(), value)))
            .collect();
        Ok(config)
    }
}

fn seconds<F>(lookup: &F, name: &str) -> Result<Option<Duration>>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(name) else {
        return Ok(None);
    };
    match raw.trim().parse::<u64>() {
        Ok(0) | Err(_) => Err(ClientError::config(format!(
            "{} must be a positive number of seconds, got {:?}",
            name, raw
        ))),
        Ok(secs) => Ok(Some(Duration::from_secs(secs))),
    }
}
