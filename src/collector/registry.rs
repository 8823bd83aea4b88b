use anyhow::{bail, Result};

use crate::config::Config;
use super::network::InterfaceRateCollector;
use super::ping::ConnectivityProbeCollector;
use super::Collector;

pub const NETWORK_INTERFACE: &str = "network_interface";
pub const PING: &str = "ping";

/// Every collector name the factory can build
pub const KNOWN_COLLECTORS: &[&str] = &[NETWORK_INTERFACE, PING];

pub fn is_known(name: &str) -> bool {
    KNOWN_COLLECTORS.contains(&name)
}

/// Build a single collector by name
pub fn build(name: &str, config: &Config) -> Result<Box<dyn Collector>> {
    let interval = config.agent.collect_interval();
    let collector: Box<dyn Collector> = match name {
        NETWORK_INTERFACE => Box::new(InterfaceRateCollector::from_proc(
            interval,
            &config.agent.proc_root,
        )),
        PING => Box::new(ConnectivityProbeCollector::new(
            interval,
            config.targets.ping_targets.clone(),
        )?),
        other => bail!(
            "unknown collector '{}' (available: {})",
            other,
            KNOWN_COLLECTORS.join(", ")
        ),
    };
    Ok(collector)
}

/// Create all configured collectors, in configured order
pub fn create_collectors(config: &Config) -> Result<Vec<Box<dyn Collector>>> {
    let mut collectors = Vec::with_capacity(config.agent.collectors.len());
    for name in &config.agent.collectors {
        collectors.push(build(name, config)?);
        tracing::info!(collector = %name, "Initialized collector");
    }

    if collectors.is_empty() {
        bail!("no collectors configured");
    }

    tracing::info!(count = collectors.len(), "Initialized collectors");
    Ok(collectors)
}
