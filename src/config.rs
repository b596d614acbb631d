//! Configuration management for the relay agent.
//!
//! The file lives at the platform config dir (`relay-agent/config.toml`).
//! CLI flags override it; [`Config::agent_config`] resolves the result into
//! the [`AgentConfig`] a session runs with.

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::error::SessionError;
use crate::protocol::Subdomain;

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub tunnel: TunnelConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    pub token: Option<String>,
    pub bus_url: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct TunnelConfig {
    pub subdomain: Option<String>,
    pub local_port: Option<u16>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub request_timeout_secs: u64,
    pub connect_timeout_ms: u64,
    pub max_concurrent_requests: usize,
    /// Defaults to twice `max_concurrent_requests`
    pub queue_depth: Option<usize>,
    pub max_chunk_bytes: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 30,
            connect_timeout_ms: 2000,
            max_concurrent_requests: 10,
            queue_depth: None,
            max_chunk_bytes: 64 * 1024,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub heartbeat_interval_secs: u64,
    pub max_missed_heartbeats: u32,
    pub shutdown_grace_secs: u64,
    pub start_max_attempts: u32,
    pub backoff_initial_ms: u64,
    pub backoff_max_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 20,
            max_missed_heartbeats: 3,
            shutdown_grace_secs: 10,
            start_max_attempts: 5,
            backoff_initial_ms: 500,
            backoff_max_secs: 30,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))
    }

    pub fn config_path() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("", "", "relay-agent")
            .context("Could not determine config directory")?;

        Ok(proj_dirs.config_dir().join("config.toml"))
    }

    /// Resolve the file settings plus already-merged credential, subdomain
    /// and port into what a session runs with
    pub fn agent_config(
        &self,
        credential: impl Into<String>,
        subdomain: impl Into<Subdomain>,
        local_port: u16,
    ) -> AgentConfig {
        let limits = &self.limits;
        let session = &self.session;
        AgentConfig {
            credential: credential.into(),
            subdomain: subdomain.into(),
            local_port,
            request_timeout: Duration::from_secs(limits.request_timeout_secs),
            connect_timeout: Duration::from_millis(limits.connect_timeout_ms),
            max_concurrent_requests: limits.max_concurrent_requests,
            queue_depth: limits
                .queue_depth
                .unwrap_or(limits.max_concurrent_requests.saturating_mul(2)),
            max_chunk_bytes: limits.max_chunk_bytes,
            heartbeat_interval: Duration::from_secs(session.heartbeat_interval_secs),
            max_missed_heartbeats: session.max_missed_heartbeats,
            shutdown_grace: Duration::from_secs(session.shutdown_grace_secs),
            start_max_attempts: session.start_max_attempts,
            backoff_initial: Duration::from_millis(session.backoff_initial_ms),
            backoff_max: Duration::from_secs(session.backoff_max_secs),
        }
    }
}

/// Validate a bus endpoint: must parse and use `ws` or `wss`
pub fn parse_bus_url(raw: &str) -> Result<Url, SessionError> {
    let url = Url::parse(raw).map_err(|e| SessionError::Config(format!("bus URL '{}': {}", raw, e)))?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(SessionError::Config(format!(
            "bus URL must use ws:// or wss://, got {}://",
            other
        ))),
    }
}

/// Everything one session needs to run
#[derive(Clone)]
pub struct AgentConfig {
    pub credential: String,
    pub subdomain: Subdomain,
    pub local_port: u16,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub max_concurrent_requests: usize,
    pub queue_depth: usize,
    pub max_chunk_bytes: usize,
    pub heartbeat_interval: Duration,
    pub max_missed_heartbeats: u32,
    pub shutdown_grace: Duration,
    pub start_max_attempts: u32,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

impl AgentConfig {
    /// Defaults for everything except identity and target
    pub fn new(credential: impl Into<String>, subdomain: impl Into<Subdomain>, local_port: u16) -> Self {
        Config::default().agent_config(credential, subdomain, local_port)
    }

    pub fn validate(&self) -> Result<(), SessionError> {
        let invalid = |msg: &str| Err(SessionError::Config(msg.to_string()));

        if self.credential.trim().is_empty() {
            return invalid("credential is empty");
        }
        let sub = self.subdomain.as_str();
        if sub.is_empty()
            || !sub
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return invalid("subdomain must be non-empty and contain only [A-Za-z0-9_-]");
        }
        if self.local_port == 0 {
            return invalid("local port must be in 1..=65535");
        }
        if self.request_timeout.is_zero() {
            return invalid("request timeout must be positive");
        }
        if self.max_concurrent_requests == 0 {
            return invalid("max concurrent requests must be at least 1");
        }
        if self.max_chunk_bytes == 0 {
            return invalid("max chunk size must be at least 1 byte");
        }
        if self.heartbeat_interval.is_zero() {
            return invalid("heartbeat interval must be positive");
        }
        if self.max_missed_heartbeats == 0 {
            return invalid("max missed heartbeats must be at least 1");
        }
        if self.start_max_attempts == 0 {
            return invalid("start attempts must be at least 1");
        }
        Ok(())
    }
}

impl fmt::Debug for AgentConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentConfig")
            .field("credential", &"<redacted>")
            .field("subdomain", &self.subdomain)
            .field("local_port", &self.local_port)
            .field("request_timeout", &self.request_timeout)
            .field("connect_timeout", &self.connect_timeout)
            .field("max_concurrent_requests", &self.max_concurrent_requests)
            .field("queue_depth", &self.queue_depth)
            .field("max_chunk_bytes", &self.max_chunk_bytes)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("max_missed_heartbeats", &self.max_missed_heartbeats)
            .field("shutdown_grace", &self.shutdown_grace)
            .finish_non_exhaustive()
    }
}
