// Copyright 2020 Joyent, Inc.

//! Gate and plugin configuration.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_derive::Deserialize;

use crate::error::{HapiError, Result};
use crate::messages::MonitoringServerInfo;

/// Environment variable through which the gate tells a spawned plugin
/// where its queues live.
pub const ENV_NAME_QUEUE_ADDR: &str = "HAPI_QUEUE_ADDR";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub initial_interval_ms: u64,
    pub max_interval_ms: u64,
    pub multiplier: u32,
    /// `None` retries forever.
    pub max_retries: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            initial_interval_ms: 10_000,
            max_interval_ms: 60_000,
            multiplier: 2,
            max_retries: None,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let mut interval = self.initial_interval_ms;
        for _ in 1..attempt {
            interval = interval.saturating_mul(u64::from(self.multiplier.max(1)));
            if interval >= self.max_interval_ms {
                break;
            }
        }
        Duration::from_millis(interval.min(self.max_interval_ms.max(self.initial_interval_ms)))
    }

    pub fn exhausted(&self, attempts: u32) -> bool {
        match self.max_retries {
            Some(max) => attempts > max,
            None => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    pub queue_address: String,
    /// Plugin executable. When absent the gate only waits for a plugin
    /// started by someone else.
    pub plugin_path: Option<PathBuf>,
    pub plugin_args: Vec<String>,
    pub retry: RetryPolicy,
    /// How often the supervisor checks whether the plugin process exited.
    pub child_poll_interval_ms: u64,
    pub monitoring_server: MonitoringServerInfo,
}

impl Default for GateConfig {
    fn default() -> Self {
        GateConfig {
            queue_address: String::new(),
            plugin_path: None,
            plugin_args: Vec::new(),
            retry: RetryPolicy::default(),
            child_poll_interval_ms: 500,
            monitoring_server: MonitoringServerInfo::default(),
        }
    }
}

impl GateConfig {
    pub fn from_json(s: &str) -> Result<GateConfig> {
        let config: GateConfig = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<GateConfig> {
        let contents = fs::read_to_string(path.as_ref()).map_err(|e| {
            HapiError::Config(format!("{}: {}", path.as_ref().display(), e))
        })?;
        GateConfig::from_json(&contents)
    }

    /// Queue address derived from the server id when none is configured.
    pub fn effective_queue_address(&self) -> String {
        if self.queue_address.is_empty() {
            format!("hapi-gate.{}", self.monitoring_server.server_id)
        } else {
            self.queue_address.clone()
        }
    }

    pub fn child_poll_interval(&self) -> Duration {
        Duration::from_millis(self.child_poll_interval_ms.max(1))
    }

    fn validate(&self) -> Result<()> {
        if self.retry.initial_interval_ms == 0 {
            return Err(HapiError::Config(
                "retry.initial_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PluginConfig {
    pub queue_address: String,
}

impl PluginConfig {
    pub fn new<S: Into<String>>(queue_address: S) -> PluginConfig {
        PluginConfig {
            queue_address: queue_address.into(),
        }
    }

    pub fn from_env() -> Result<PluginConfig> {
        match env::var(ENV_NAME_QUEUE_ADDR) {
            Ok(addr) if !addr.is_empty() => Ok(PluginConfig::new(addr)),
            _ => Err(HapiError::Config(format!(
                "environment variable {} is not set",
                ENV_NAME_QUEUE_ADDR
            ))),
        }
    }
}
