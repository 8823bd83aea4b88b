use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::time::Duration;

use crate::collector::registry;
use crate::types::CloudLocation;

/// Lower bound on the shared collection tick
pub const MIN_COLLECT_INTERVAL_SECS: u64 = 5;
/// Upper bound on metrics per batch
pub const MAX_BATCH_SIZE: usize = 1000;

const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Top-level configuration
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub agent: AgentConfig,
    #[serde(default = "default_location")]
    pub location: CloudLocation,
    #[serde(default)]
    pub targets: TargetsConfig,
    #[serde(default)]
    pub transmitter: TransmitterConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AgentConfig {
    #[serde(default = "default_agent_id")]
    pub agent_id: String,
    #[serde(default = "default_backend_url")]
    pub backend_url: String,
    #[serde(default = "default_collect_interval")]
    pub collect_interval_secs: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_collectors")]
    pub collectors: Vec<String>,
    #[serde(default = "default_proc_root")]
    pub proc_root: String,
}

impl AgentConfig {
    pub fn collect_interval(&self) -> Duration {
        Duration::from_secs(self.collect_interval_secs)
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct TargetsConfig {
    #[serde(default)]
    pub ping_targets: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TransmitterConfig {
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_secs: u64,
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
    #[serde(default = "default_write_timeout")]
    pub write_timeout_secs: u64,
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
}

impl Default for TransmitterConfig {
    fn default() -> Self {
        Self {
            reconnect_interval_secs: default_reconnect_interval(),
            handshake_timeout_secs: default_handshake_timeout(),
            write_timeout_secs: default_write_timeout(),
            read_timeout_secs: default_read_timeout(),
            ping_interval_secs: default_ping_interval(),
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;
        Self::from_toml(&content)
    }

    /// Parse a configuration document, expanding `${VAR}` references first
    pub fn from_toml(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content)?;

        let mut config: Config = toml::from_str(&expanded)
            .with_context(|| "Failed to parse configuration")?;

        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Fill in values that serde defaults cannot express
    fn normalize(&mut self) {
        if self.agent.agent_id.trim().is_empty() {
            self.agent.agent_id = default_agent_id();
        }
        if !VALID_LOG_LEVELS.contains(&self.agent.log_level.to_lowercase().as_str()) {
            self.agent.log_level = default_log_level();
        }
        if self.agent.batch_size == 0 {
            self.agent.batch_size = default_batch_size();
        }
        if self.agent.collectors.is_empty() {
            self.agent.collectors = default_collectors();
        }

        // Metadata probing is not performed; unresolved providers are reported as on-premise.
        let loc = &mut self.location;
        if loc.provider.is_empty() || loc.provider == "auto-detect" {
            loc.provider = "on-premise".into();
        }
        fill_if_empty(&mut loc.region, "unknown");
        fill_if_empty(&mut loc.zone, "unknown");
        fill_if_empty(&mut loc.network, "default");
        fill_if_empty(&mut loc.subnet, "default");
        if loc.instance_id.is_empty() {
            loc.instance_id = default_hostname();
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.agent.agent_id.trim().is_empty() {
            bail!("agent.agent_id cannot be empty");
        }
        if self.agent.backend_url.trim().is_empty() {
            bail!("agent.backend_url is required");
        }
        if self.agent.collect_interval_secs < MIN_COLLECT_INTERVAL_SECS {
            bail!(
                "agent.collect_interval_secs must be at least {} seconds",
                MIN_COLLECT_INTERVAL_SECS
            );
        }
        if self.agent.batch_size > MAX_BATCH_SIZE {
            bail!("agent.batch_size cannot exceed {}", MAX_BATCH_SIZE);
        }
        for name in &self.agent.collectors {
            if !registry::is_known(name) {
                bail!(
                    "unknown collector '{}' (available: {})",
                    name,
                    registry::KNOWN_COLLECTORS.join(", ")
                );
            }
        }

        let t = &self.transmitter;
        for (field, secs) in [
            ("reconnect_interval_secs", t.reconnect_interval_secs),
            ("handshake_timeout_secs", t.handshake_timeout_secs),
            ("write_timeout_secs", t.write_timeout_secs),
            ("read_timeout_secs", t.read_timeout_secs),
            ("ping_interval_secs", t.ping_interval_secs),
        ] {
            if secs == 0 {
                bail!("transmitter.{} must be greater than zero", field);
            }
        }
        Ok(())
    }

    /// Queue capacity: room for ten full batches
    pub fn queue_capacity(&self) -> usize {
        self.agent.batch_size * 10
    }
}

fn fill_if_empty(field: &mut String, value: &str) {
    if field.is_empty() {
        *field = value.to_string();
    }
}

/// Expand ${ENV_VAR} references in config string
fn expand_env_vars(input: &str) -> Result<String> {
    let re = regex::Regex::new(r"\$\{([^}]+)\}")?;
    Ok(re
        .replace_all(input, |caps: &regex::Captures| {
            let var_name = &caps[1];
            std::env::var(var_name).unwrap_or_default()
        })
        .to_string())
}

// Default value functions
fn default_agent_id() -> String { uuid::Uuid::new_v4().to_string() }
fn default_backend_url() -> String { "ws://localhost:8080".to_string() }
fn default_collect_interval() -> u64 { 30 }
fn default_batch_size() -> usize { 100 }
fn default_log_level() -> String { "info".to_string() }
fn default_collectors() -> Vec<String> { vec!["network_interface".into(), "ping".into()] }
fn default_proc_root() -> String { "/proc".to_string() }
fn default_reconnect_interval() -> u64 { 10 }
fn default_handshake_timeout() -> u64 { 30 }
fn default_write_timeout() -> u64 { 10 }
fn default_read_timeout() -> u64 { 60 }
fn default_ping_interval() -> u64 { 30 }
fn default_location() -> CloudLocation {
    CloudLocation {
        provider: "auto-detect".into(),
        ..Default::default()
    }
}
fn default_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}
