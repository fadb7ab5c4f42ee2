//! Configuration for the host agent.

use std::time::Duration;

use anyhow::{Context, Result};
use corral_id::HostId;
use corral_reconcile::RespawnBackoff;

use crate::agent::AgentConfig;
use crate::reconciler::ReconcilerConfig;

/// Host agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Identity of the host this agent manages.
    pub host_id: HostId,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    pub pull_timeout_secs: u64,

    /// Attempts for a conflicting ServiceState write.
    pub update_retries: u32,

    pub soft_fail_missing_images: bool,

    pub resync_interval_secs: u64,

    pub respawn_max_retries: u32,

    pub respawn_window_secs: u64,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`, which maps a variable name to
    /// its value.
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        // Host ID can be provided or auto-generated
        let host_id = match lookup("CORRAL_HOST_ID") {
            Some(raw) => raw
                .parse::<HostId>()
                .with_context(|| format!("invalid CORRAL_HOST_ID {raw:?}"))?,
            None => HostId::new(),
        };

        let log_level = lookup("CORRAL_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            host_id,
            log_level,
            pull_timeout_secs: parse_or(&lookup, "CORRAL_PULL_TIMEOUT_SECS", 600)?,
            update_retries: parse_or(&lookup, "CORRAL_UPDATE_RETRIES", 3)?,
            soft_fail_missing_images: parse_or(&lookup, "CORRAL_SOFT_FAIL_MISSING_IMAGES", false)?,
            resync_interval_secs: parse_or(&lookup, "CORRAL_RESYNC_INTERVAL_SECS", 30)?,
            respawn_max_retries: parse_or(&lookup, "CORRAL_RESPAWN_MAX_RETRIES", 3)?,
            respawn_window_secs: parse_or(&lookup, "CORRAL_RESPAWN_WINDOW_SECS", 600)?,
        })
    }

    pub fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            pull_timeout: Duration::from_secs(self.pull_timeout_secs),
            update_retries: self.update_retries,
            soft_fail_missing_images: self.soft_fail_missing_images,
        }
    }

    pub fn agent_config(&self) -> AgentConfig {
        AgentConfig {
            resync_interval: Duration::from_secs(self.resync_interval_secs.max(1)),
            respawn_max_retries: self.respawn_max_retries,
            respawn_window: Duration::from_secs(self.respawn_window_secs),
            backoff: RespawnBackoff::default(),
        }
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("invalid {key} {raw:?}")),
        None => Ok(default),
    }
}
