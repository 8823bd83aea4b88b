use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::net::IpAddr;
use std::time::Duration;

use crate::types::{Metric, Tags};
use super::ping_output::{PingFlavor, PingOutputParser, ProbeSummary};
use super::Collector;

/// Probed when no targets are configured
pub const DEFAULT_TARGETS: &[&str] = &["8.8.8.8", "1.1.1.1", "google.com", "cloudflare.com"];
/// Upper bound on one ping invocation
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
/// Echo requests per invocation
pub const PROBE_COUNT: u32 = 3;

const PING_PROGRAM: &str = "ping";

/// Resolves targets and runs the probe against them
#[async_trait]
pub trait ProbeRunner: Send + Sync {
    /// Fail when the probe cannot run on this host at all
    fn ensure_available(&self) -> Result<()>;

    /// Run one probe and return its textual output
    async fn run(&self, address: &str) -> Result<String>;

    async fn resolve(&self, target: &str) -> Result<IpAddr> {
        resolve_target(target).await
    }
}

/// Literal addresses pass through; names resolve to the first IPv4 result, or
/// the first result of any family
pub async fn resolve_target(target: &str) -> Result<IpAddr> {
    if let Ok(ip) = target.parse::<IpAddr>() {
        return Ok(ip);
    }

    let addrs = tokio::net::lookup_host((target, 0))
        .await
        .with_context(|| format!("failed to resolve {}", target))?;
    pick_address(addrs.map(|a| a.ip()))
        .ok_or_else(|| anyhow!("no IP addresses found for {}", target))
}

fn pick_address(addrs: impl IntoIterator<Item = IpAddr>) -> Option<IpAddr> {
    let addrs: Vec<IpAddr> = addrs.into_iter().collect();
    addrs
        .iter()
        .copied()
        .find(IpAddr::is_ipv4)
        .or_else(|| addrs.first().copied())
}

/// Runs the operating system's `ping` executable
pub struct SystemPing {
    flavor: PingFlavor,
    count: u32,
    timeout: Duration,
}

impl SystemPing {
    pub fn new(flavor: PingFlavor) -> Self {
        Self { flavor, count: PROBE_COUNT, timeout: PROBE_TIMEOUT }
    }
}

#[async_trait]
impl ProbeRunner for SystemPing {
    fn ensure_available(&self) -> Result<()> {
        which::which(PING_PROGRAM).context("ping command not found")?;
        Ok(())
    }

    async fn run(&self, address: &str) -> Result<String> {
        let output = tokio::time::timeout(
            self.timeout,
            tokio::process::Command::new(PING_PROGRAM)
                .arg(self.flavor.count_flag())
                .arg(self.count.to_string())
                .arg(address)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| anyhow!("ping timed out after {:?}", self.timeout))?
        .context("failed to run ping")?;

        if !output.status.success() {
            bail!("ping command failed: {}", output.status);
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Probes reachability of a target set and reports latency and loss
pub struct ConnectivityProbeCollector {
    interval: Duration,
    targets: Vec<String>,
    runner: Box<dyn ProbeRunner>,
    parser: PingOutputParser,
}

impl ConnectivityProbeCollector {
    pub fn new(interval: Duration, targets: Vec<String>) -> Result<Self> {
        let flavor = PingFlavor::host();
        Self::with_runner(interval, targets, Box::new(SystemPing::new(flavor)), flavor)
    }

    pub fn with_runner(
        interval: Duration,
        targets: Vec<String>,
        runner: Box<dyn ProbeRunner>,
        flavor: PingFlavor,
    ) -> Result<Self> {
        let targets = if targets.is_empty() {
            DEFAULT_TARGETS.iter().map(|t| t.to_string()).collect()
        } else {
            targets
        };

        Ok(Self {
            interval,
            targets,
            runner,
            parser: PingOutputParser::new(flavor)?,
        })
    }

    pub fn targets(&self) -> &[String] {
        &self.targets
    }

    fn summary_metrics(
        summary: &ProbeSummary,
        tags: &Tags,
        timestamp: chrono::DateTime<Utc>,
    ) -> Vec<Metric> {
        let mut metrics = vec![Metric::gauge("ping_success", 1.0, "boolean", timestamp, tags)];

        if let Some(rtt) = summary.rtt {
            metrics.push(Metric::gauge("ping_rtt_avg_ms", rtt.avg, "ms", timestamp, tags));
            metrics.push(Metric::gauge("ping_rtt_min_ms", rtt.min, "ms", timestamp, tags));
            metrics.push(Metric::gauge("ping_rtt_max_ms", rtt.max, "ms", timestamp, tags));
        }

        metrics.push(Metric::gauge(
            "ping_packet_loss_percent",
            summary.packet_loss_percent,
            "percent",
            timestamp,
            tags,
        ));
        metrics
    }
}

#[async_trait]
impl Collector for ConnectivityProbeCollector {
    fn name(&self) -> &str { super::registry::PING }

    fn interval(&self) -> Duration { self.interval }

    async fn start(&mut self) -> Result<()> {
        tracing::info!(targets = ?self.targets, "Starting ping collector");
        self.runner.ensure_available()
    }

    async fn stop(&mut self) -> Result<()> {
        tracing::info!("Stopping ping collector");
        Ok(())
    }

    async fn collect(&mut self) -> Result<Vec<Metric>> {
        let timestamp = Utc::now();
        let mut metrics = Vec::new();

        for target in &self.targets {
            let ip = match self.runner.resolve(target).await {
                Ok(ip) => ip.to_string(),
                Err(e) => {
                    tracing::warn!(ping_target = %target, error = %e, "Failed to resolve ping target");
                    continue;
                }
            };

            let output = match self.runner.run(&ip).await {
                Ok(output) => output,
                Err(e) => {
                    tracing::warn!(ping_target = %target, target_ip = %ip, error = %e, "Failed to ping target");
                    let mut tags = Tags::new();
                    tags.insert("target".into(), target.clone());
                    metrics.push(Metric::gauge("ping_success", 0.0, "boolean", timestamp, &tags));
                    continue;
                }
            };

            let summary = self.parser.parse(&output);
            let mut tags = Tags::new();
            tags.insert("target".into(), target.clone());
            tags.insert("target_ip".into(), ip);
            metrics.extend(Self::summary_metrics(&summary, &tags, timestamp));
        }

        tracing::debug!(metrics_count = metrics.len(), "Collected ping metrics");
        Ok(metrics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::net::{Ipv4Addr, Ipv6Addr};

    const LINUX_OK: &str = "\
3 packets transmitted, 3 received, 0% packet loss, time 2003ms
rtt min/avg/max/mdev = 10.1/12.3/15.0/1.2 ms
";

    /// Canned resolution and probe results keyed by target / address
    struct FakeRunner {
        available: bool,
        names: HashMap<String, IpAddr>,
        outputs: HashMap<String, Result<String, String>>,
    }

    impl FakeRunner {
        fn new() -> Self {
            Self { available: true, names: HashMap::new(), outputs: HashMap::new() }
        }

        fn name(mut self, name: &str, ip: IpAddr) -> Self {
            self.names.insert(name.into(), ip);
            self
        }

        fn reply(mut self, addr: &str, out: Result<&str, &str>) -> Self {
            self.outputs.insert(addr.into(), out.map(String::from).map_err(String::from));
            self
        }
    }

    #[async_trait]
    impl ProbeRunner for FakeRunner {
        fn ensure_available(&self) -> Result<()> {
            if self.available { Ok(()) } else { bail!("ping command not found") }
        }

        async fn run(&self, address: &str) -> Result<String> {
            match self.outputs.get(address) {
                Some(Ok(out)) => Ok(out.clone()),
                Some(Err(e)) => Err(anyhow!(e.clone())),
                None => bail!("no route"),
            }
        }

        async fn resolve(&self, target: &str) -> Result<IpAddr> {
            if let Ok(ip) = target.parse() {
                return Ok(ip);
            }
            self.names.get(target).copied().ok_or_else(|| anyhow!("NXDOMAIN"))
        }
    }

    fn collector(targets: &[&str], runner: FakeRunner) -> ConnectivityProbeCollector {
        ConnectivityProbeCollector::with_runner(
            Duration::from_secs(30),
            targets.iter().map(|t| t.to_string()).collect(),
            Box::new(runner),
            PingFlavor::Unix,
        )
        .unwrap()
    }

    #[test]
    fn empty_targets_use_defaults() {
        let c = collector(&[], FakeRunner::new());
        assert_eq!(c.targets(), DEFAULT_TARGETS);
    }

    #[test]
    fn prefers_ipv4_address() {
        let v6 = IpAddr::V6(Ipv6Addr::LOCALHOST);
        let v4 = IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34));
        assert_eq!(pick_address([v6, v4]), Some(v4));
        assert_eq!(pick_address([v6]), Some(v6));
        assert_eq!(pick_address(Vec::new()), None);
    }

    #[tokio::test]
    async fn literal_addresses_skip_resolution() {
        let ip = resolve_target("127.0.0.1").await.unwrap();
        assert_eq!(ip, IpAddr::V4(Ipv4Addr::LOCALHOST));
        let ip = resolve_target("::1").await.unwrap();
        assert_eq!(ip, IpAddr::V6(Ipv6Addr::LOCALHOST));
    }

    #[tokio::test]
    async fn start_requires_probe_executable() {
        let mut runner = FakeRunner::new();
        runner.available = false;
        let mut c = collector(&["8.8.8.8"], runner);
        assert!(c.start().await.is_err());
    }

    #[tokio::test]
    async fn successful_probe_emits_full_set() {
        let runner = FakeRunner::new()
            .name("dns.google", "8.8.8.8".parse().unwrap())
            .reply("8.8.8.8", Ok(LINUX_OK));
        let mut c = collector(&["dns.google"], runner);

        let metrics = c.collect().await.unwrap();
        let names: Vec<&str> = metrics.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "ping_success",
                "ping_rtt_avg_ms",
                "ping_rtt_min_ms",
                "ping_rtt_max_ms",
                "ping_packet_loss_percent",
            ]
        );
        assert_eq!(metrics[0].value, 1.0);
        assert_eq!(metrics[1].value, 12.3);
        for m in &metrics {
            assert_eq!(m.tags["target"], "dns.google");
            assert_eq!(m.tags["target_ip"], "8.8.8.8");
            assert_eq!(m.timestamp, metrics[0].timestamp);
        }
    }

    #[tokio::test]
    async fn probe_without_rtt_still_reports_loss() {
        let runner = FakeRunner::new()
            .reply("10.0.0.1", Ok("3 packets transmitted, 2 received, 33% packet loss\n"));
        let mut c = collector(&["10.0.0.1"], runner);

        let metrics = c.collect().await.unwrap();
        assert_eq!(metrics.len(), 2);
        assert_eq!(metrics[1].name, "ping_packet_loss_percent");
        assert_eq!(metrics[1].value, 33.0);
    }

    #[tokio::test]
    async fn failures_are_isolated_per_target() {
        let runner = FakeRunner::new()
            .reply("10.0.0.1", Err("exit status: 1"))
            .reply("10.0.0.2", Ok(LINUX_OK));
        let mut c = collector(&["unresolvable.invalid", "10.0.0.1", "10.0.0.2"], runner);

        let metrics = c.collect().await.unwrap();

        // resolution failure: nothing for that target
        assert!(metrics.iter().all(|m| m.tags["target"] != "unresolvable.invalid"));

        // invocation failure: exactly one ping_success=0 without target_ip
        let failed: Vec<&Metric> = metrics.iter().filter(|m| m.tags["target"] == "10.0.0.1").collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].name, "ping_success");
        assert_eq!(failed[0].value, 0.0);
        assert!(!failed[0].tags.contains_key("target_ip"));

        // remaining target still probed
        assert_eq!(metrics.iter().filter(|m| m.tags["target"] == "10.0.0.2").count(), 5);
    }
}
