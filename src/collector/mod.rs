pub mod network;
pub mod ping;
pub mod ping_output;
pub mod registry;

use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

use crate::types::Metric;

pub use registry::create_collectors;

/// Trait for all metric collectors.
///
/// A collector is started once per agent run, sampled on every tick of the
/// agent's collection loop, and stopped on shutdown.
#[async_trait]
pub trait Collector: Send + Sync {
    /// Stable identifier used in logs and in the `collectors` config list
    fn name(&self) -> &str;

    /// Declared collection interval. Advisory only: the agent drives every
    /// collector from one shared tick.
    fn interval(&self) -> Duration;

    /// Prepare the collector (baseline samples, dependency checks).
    /// An error excludes the collector from the run.
    async fn start(&mut self) -> Result<()>;

    /// Release resources. Errors are logged by the caller, never propagated.
    async fn stop(&mut self) -> Result<()>;

    /// One sampling pass. An error means "no metrics this cycle".
    async fn collect(&mut self) -> Result<Vec<Metric>>;
}
