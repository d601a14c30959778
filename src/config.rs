//! Configuration loading.
//!
//! Layered the way the teacher loads its own instance config: built-in
//! defaults, an optional `config.toml` resolved via [`dirs::config_dir`],
//! then environment variables (`CC_` prefixed, `__` nesting), then CLI
//! overrides. Recognized options mirror spec §6.4.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{BrokerError, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Static salt mixed into stored/compared `ccagent_secret_key` hashes.
    pub ccagent_secret_signing_key_pepper: String,
    pub slack_signing_secret: Option<String>,
    pub discord_client_id: Option<String>,
    pub discord_client_secret: Option<String>,
    pub clerk_secret_key: Option<String>,
    pub datastore_dsn: String,

    #[serde(default = "default_idle_job_threshold_minutes")]
    pub idle_job_threshold_minutes: i64,
    #[serde(default = "default_agent_inactive_threshold_minutes")]
    pub agent_inactive_threshold_minutes: i64,
    #[serde(default = "default_queue_redispatch_interval_seconds")]
    pub queue_redispatch_interval_seconds: u64,
    #[serde(default = "default_stale_agent_sweep_interval_seconds")]
    pub stale_agent_sweep_interval_seconds: u64,

    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_ws_heartbeat_interval_seconds")]
    pub ws_heartbeat_interval_seconds: u64,
    #[serde(default = "default_ws_pong_timeout_seconds")]
    pub ws_pong_timeout_seconds: u64,
    #[serde(default = "default_command_prefix")]
    pub command_prefix: String,
}

fn default_idle_job_threshold_minutes() -> i64 {
    60
}
fn default_agent_inactive_threshold_minutes() -> i64 {
    2
}
fn default_queue_redispatch_interval_seconds() -> u64 {
    15
}
fn default_stale_agent_sweep_interval_seconds() -> u64 {
    30
}
fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_ws_heartbeat_interval_seconds() -> u64 {
    30
}
fn default_ws_pong_timeout_seconds() -> u64 {
    60
}
fn default_command_prefix() -> String {
    "/cc".to_string()
}

impl AppConfig {
    /// Loads configuration from (in increasing precedence order) built-in
    /// defaults, `config.toml` in the user config dir, and `CC_`-prefixed
    /// environment variables.
    pub fn load() -> Result<Self> {
        let config_path = dirs::config_dir().map(|dir| dir.join("ccbroker").join("config.toml"));
        Self::load_from(config_path)
    }

    pub fn load_from(config_path: Option<PathBuf>) -> Result<Self> {
        let mut builder = config::Config::builder().add_source(config::Environment::with_prefix("CC").separator("__"));
        if let Some(path) = config_path {
            if path.exists() {
                builder = builder.add_source(config::File::from(path));
            }
        }
        let raw = builder
            .build()
            .map_err(|e| BrokerError::Validation(format!("config load failed: {e}")))?;
        let cfg: AppConfig = raw
            .try_deserialize()
            .map_err(|e| BrokerError::Validation(format!("config deserialize failed: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.datastore_dsn.trim().is_empty() {
            return Err(BrokerError::Validation("datastore_dsn must not be empty".into()));
        }
        if self.slack_signing_secret.is_none() && self.discord_client_id.is_none() {
            return Err(BrokerError::Validation(
                "at least one of slack_signing_secret or discord_client_id must be configured".into(),
            ));
        }
        Ok(())
    }

    pub fn idle_job_threshold(&self) -> Duration {
        Duration::from_secs((self.idle_job_threshold_minutes.max(0) as u64) * 60)
    }

    pub fn agent_inactive_threshold(&self) -> Duration {
        Duration::from_secs((self.agent_inactive_threshold_minutes.max(0) as u64) * 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_dsn() {
        let cfg = AppConfig {
            ccagent_secret_signing_key_pepper: "pepper".into(),
            slack_signing_secret: Some("s".into()),
            discord_client_id: None,
            discord_client_secret: None,
            clerk_secret_key: None,
            datastore_dsn: "".into(),
            idle_job_threshold_minutes: 60,
            agent_inactive_threshold_minutes: 2,
            queue_redispatch_interval_seconds: 15,
            stale_agent_sweep_interval_seconds: 30,
            bind_addr: default_bind_addr(),
            ws_heartbeat_interval_seconds: 30,
            ws_pong_timeout_seconds: 60,
            command_prefix: "/cc".into(),
        };
        assert!(cfg.validate().is_err());
    }
}
