use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use crate::types::{Metric, Tags};
use super::Collector;

/// Cumulative counters of one network interface
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterfaceCounters {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub rx_errors: u64,
    pub tx_errors: u64,
    pub rx_drops: u64,
    pub tx_drops: u64,
}

impl InterfaceCounters {
    fn is_inactive(&self) -> bool {
        self.rx_bytes == 0 && self.tx_bytes == 0
    }
}

/// Interface name -> counters
pub type CounterSnapshot = BTreeMap<String, InterfaceCounters>;

/// Where interface counters come from
#[async_trait]
pub trait CounterSource: Send + Sync {
    async fn sample(&self) -> Result<CounterSnapshot>;
}

/// Reads counters from `<proc_root>/net/dev`
pub struct ProcNetDev {
    path: PathBuf,
}

impl ProcNetDev {
    pub fn new(proc_root: &str) -> Self {
        Self { path: PathBuf::from(proc_root).join("net/dev") }
    }
}

#[async_trait]
impl CounterSource for ProcNetDev {
    async fn sample(&self) -> Result<CounterSnapshot> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        Ok(parse_proc_net_dev(&content))
    }
}

/// Parse the /proc/net/dev table. Malformed rows are skipped.
pub fn parse_proc_net_dev(content: &str) -> CounterSnapshot {
    let mut snapshot = CounterSnapshot::new();

    for line in content.lines().skip(2) {
        // "eth0:1234 ..." has no space after the colon for large counters
        let Some((iface, rest)) = line.split_once(':') else { continue };
        let fields: Vec<u64> = rest
            .split_whitespace()
            .map(|f| f.parse().unwrap_or(0))
            .collect();
        if fields.len() < 16 { continue; }

        snapshot.insert(
            iface.trim().to_string(),
            InterfaceCounters {
                rx_bytes: fields[0],
                rx_packets: fields[1],
                rx_errors: fields[2],
                rx_drops: fields[3],
                tx_bytes: fields[8],
                tx_packets: fields[9],
                tx_errors: fields[10],
                tx_drops: fields[11],
            },
        );
    }

    snapshot
}

fn is_loopback(name: &str) -> bool {
    name == "lo" || name == "lo0" || name.starts_with("Loopback")
}

/// Counter deltas are not clamped: a reset interface yields a negative rate.
fn per_sec(current: u64, previous: u64, dt: f64) -> f64 {
    (current as f64 - previous as f64) / dt
}

/// Derives per-second interface rates from consecutive counter samples
pub struct InterfaceRateCollector {
    interval: Duration,
    source: Box<dyn CounterSource>,
    last: CounterSnapshot,
    last_at: Instant,
}

impl InterfaceRateCollector {
    pub fn new(interval: Duration, source: Box<dyn CounterSource>) -> Self {
        Self {
            interval,
            source,
            last: CounterSnapshot::new(),
            last_at: Instant::now(),
        }
    }

    pub fn from_proc(interval: Duration, proc_root: &str) -> Self {
        Self::new(interval, Box::new(ProcNetDev::new(proc_root)))
    }

    /// Turn a fresh snapshot taken at `at` into metrics and make it the new baseline
    pub fn ingest(
        &mut self,
        current: CounterSnapshot,
        at: Instant,
        timestamp: DateTime<Utc>,
    ) -> Vec<Metric> {
        let dt = at.saturating_duration_since(self.last_at).as_secs_f64();
        let mut metrics = Vec::new();

        for (iface, cur) in &current {
            if is_loopback(iface) || cur.is_inactive() {
                continue;
            }

            let mut tags = Tags::new();
            tags.insert("interface".into(), iface.clone());

            if let Some(prev) = self.last.get(iface).filter(|_| dt > 0.0) {
                let rates = [
                    ("network_interface_rx_bytes_per_sec", per_sec(cur.rx_bytes, prev.rx_bytes, dt), "bytes/sec"),
                    ("network_interface_tx_bytes_per_sec", per_sec(cur.tx_bytes, prev.tx_bytes, dt), "bytes/sec"),
                    ("network_interface_rx_packets_per_sec", per_sec(cur.rx_packets, prev.rx_packets, dt), "packets/sec"),
                    ("network_interface_tx_packets_per_sec", per_sec(cur.tx_packets, prev.tx_packets, dt), "packets/sec"),
                    ("network_interface_rx_errors_per_sec", per_sec(cur.rx_errors, prev.rx_errors, dt), "errors/sec"),
                    ("network_interface_tx_errors_per_sec", per_sec(cur.tx_errors, prev.tx_errors, dt), "errors/sec"),
                    ("network_interface_rx_drops_per_sec", per_sec(cur.rx_drops, prev.rx_drops, dt), "drops/sec"),
                    ("network_interface_tx_drops_per_sec", per_sec(cur.tx_drops, prev.tx_drops, dt), "drops/sec"),
                ];
                metrics.extend(
                    rates
                        .into_iter()
                        .map(|(name, value, unit)| Metric::gauge(name, value, unit, timestamp, &tags)),
                );
            }

            let totals = [
                ("network_interface_rx_bytes_total", cur.rx_bytes, "bytes"),
                ("network_interface_tx_bytes_total", cur.tx_bytes, "bytes"),
                ("network_interface_rx_packets_total", cur.rx_packets, "packets"),
                ("network_interface_tx_packets_total", cur.tx_packets, "packets"),
            ];
            metrics.extend(
                totals
                    .into_iter()
                    .map(|(name, value, unit)| Metric::counter(name, value as f64, unit, timestamp, &tags)),
            );
        }

        self.last = current;
        self.last_at = at;
        metrics
    }
}

#[async_trait]
impl Collector for InterfaceRateCollector {
    fn name(&self) -> &str { super::registry::NETWORK_INTERFACE }

    fn interval(&self) -> Duration { self.interval }

    async fn start(&mut self) -> Result<()> {
        tracing::info!("Starting network interface collector");
        let at = Instant::now();
        self.last = self
            .source
            .sample()
            .await
            .context("failed to get initial network stats")?;
        self.last_at = at;
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        tracing::info!("Stopping network interface collector");
        Ok(())
    }

    async fn collect(&mut self) -> Result<Vec<Metric>> {
        let timestamp = Utc::now();
        let at = Instant::now();
        let snapshot = self.source.sample().await.context("failed to get network stats")?;
        let metrics = self.ingest(snapshot, at, timestamp);
        tracing::debug!(metrics_count = metrics.len(), "Collected network interface metrics");
        Ok(metrics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    const PROC_NET_DEV: &str = "\
Inter-|   Receive                                                |  Transmit
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed
    lo:  104858     900    0    0    0     0          0         0   104858     900    0    0    0     0       0          0
  eth0:1500000   12000    3    1    0     0          0        10   900000    8000    2    4    0     0       0          0
 wlan0:       0       0    0    0    0     0          0         0        0       0    0    0    0     0       0          0
";

    struct ScriptedSource {
        samples: Mutex<VecDeque<Result<CounterSnapshot>>>,
    }

    impl ScriptedSource {
        fn new(samples: Vec<Result<CounterSnapshot>>) -> Self {
            Self { samples: Mutex::new(samples.into()) }
        }
    }

    #[async_trait]
    impl CounterSource for ScriptedSource {
        async fn sample(&self) -> Result<CounterSnapshot> {
            self.samples
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(CounterSnapshot::new()))
        }
    }

    fn counters(rx_bytes: u64, tx_bytes: u64) -> InterfaceCounters {
        InterfaceCounters {
            rx_bytes,
            tx_bytes,
            rx_packets: rx_bytes / 100,
            tx_packets: tx_bytes / 100,
            ..Default::default()
        }
    }

    fn snapshot(entries: &[(&str, InterfaceCounters)]) -> CounterSnapshot {
        entries.iter().map(|(n, c)| (n.to_string(), *c)).collect()
    }

    fn value(metrics: &[Metric], name: &str, iface: &str) -> Option<f64> {
        metrics
            .iter()
            .find(|m| m.name == name && m.tags.get("interface").map(String::as_str) == Some(iface))
            .map(|m| m.value)
    }

    #[test]
    fn parses_proc_net_dev() {
        let snap = parse_proc_net_dev(PROC_NET_DEV);
        assert_eq!(snap.len(), 3);
        let eth0 = snap["eth0"];
        assert_eq!(eth0.rx_bytes, 1_500_000);
        assert_eq!(eth0.rx_packets, 12_000);
        assert_eq!(eth0.rx_errors, 3);
        assert_eq!(eth0.rx_drops, 1);
        assert_eq!(eth0.tx_bytes, 900_000);
        assert_eq!(eth0.tx_packets, 8_000);
        assert_eq!(eth0.tx_errors, 2);
        assert_eq!(eth0.tx_drops, 4);
    }

    #[test]
    fn first_sample_emits_only_totals() {
        let mut collector = InterfaceRateCollector::new(
            Duration::from_secs(30),
            Box::new(ScriptedSource::new(vec![])),
        );
        let now = Instant::now();
        let metrics = collector.ingest(parse_proc_net_dev(PROC_NET_DEV), now, Utc::now());

        // only eth0 is active and not loopback
        assert_eq!(metrics.len(), 4);
        assert!(metrics.iter().all(|m| m.tags["interface"] == "eth0"));
        assert!(metrics.iter().all(|m| m.kind == crate::types::MetricType::Counter));
        assert_eq!(value(&metrics, "network_interface_rx_bytes_total", "eth0"), Some(1_500_000.0));
    }

    #[test]
    fn rates_are_delta_over_elapsed_seconds() {
        let mut collector = InterfaceRateCollector::new(
            Duration::from_secs(30),
            Box::new(ScriptedSource::new(vec![])),
        );
        let t0 = Instant::now();
        collector.last_at = t0;
        collector.ingest(snapshot(&[("eth0", counters(10_000, 4_000))]), t0, Utc::now());

        let t1 = t0 + Duration::from_millis(2_500);
        let ts = Utc::now();
        let metrics = collector.ingest(snapshot(&[("eth0", counters(17_500, 9_000))]), t1, ts);

        let dt = t1.duration_since(t0).as_secs_f64();
        assert_eq!(metrics.len(), 12);
        assert_eq!(
            value(&metrics, "network_interface_rx_bytes_per_sec", "eth0"),
            Some((17_500f64 - 10_000f64) / dt)
        );
        assert_eq!(
            value(&metrics, "network_interface_tx_bytes_per_sec", "eth0"),
            Some((9_000f64 - 4_000f64) / dt)
        );
        assert_eq!(value(&metrics, "network_interface_rx_packets_per_sec", "eth0"), Some(75.0 / dt));
        assert_eq!(value(&metrics, "network_interface_rx_drops_per_sec", "eth0"), Some(0.0));
        assert!(metrics.iter().all(|m| m.timestamp == ts));
    }

    #[test]
    fn loopback_and_idle_interfaces_are_skipped() {
        let mut collector = InterfaceRateCollector::new(
            Duration::from_secs(30),
            Box::new(ScriptedSource::new(vec![])),
        );
        let t0 = Instant::now();
        let snap = snapshot(&[
            ("lo", counters(5_000, 5_000)),
            ("docker0", counters(0, 0)),
            ("eth1", counters(100, 0)),
        ]);
        collector.ingest(snap.clone(), t0, Utc::now());
        let metrics = collector.ingest(snap, t0 + Duration::from_secs(5), Utc::now());

        assert!(metrics.iter().all(|m| m.tags["interface"] == "eth1"));
        assert_eq!(metrics.len(), 12);
    }

    #[test]
    fn zero_elapsed_time_emits_no_rates() {
        let mut collector = InterfaceRateCollector::new(
            Duration::from_secs(30),
            Box::new(ScriptedSource::new(vec![])),
        );
        let t0 = Instant::now();
        collector.last_at = t0;
        collector.ingest(snapshot(&[("eth0", counters(10, 10))]), t0, Utc::now());
        let metrics = collector.ingest(snapshot(&[("eth0", counters(20, 20))]), t0, Utc::now());
        assert_eq!(metrics.len(), 4);
    }

    #[test]
    fn counter_reset_passes_negative_rate_through() {
        let mut collector = InterfaceRateCollector::new(
            Duration::from_secs(30),
            Box::new(ScriptedSource::new(vec![])),
        );
        let t0 = Instant::now();
        collector.last_at = t0;
        collector.ingest(snapshot(&[("eth0", counters(50_000, 50_000))]), t0, Utc::now());
        let metrics = collector.ingest(
            snapshot(&[("eth0", counters(1_000, 1_000))]),
            t0 + Duration::from_secs(10),
            Utc::now(),
        );
        assert_eq!(value(&metrics, "network_interface_rx_bytes_per_sec", "eth0"), Some(-4_900.0));
    }

    #[tokio::test]
    async fn start_failure_is_reported() {
        let mut collector = InterfaceRateCollector::new(
            Duration::from_secs(30),
            Box::new(ScriptedSource::new(vec![Err(anyhow::anyhow!("no procfs"))])),
        );
        let err = collector.start().await.unwrap_err();
        assert!(err.to_string().contains("initial network stats"));
    }

    #[tokio::test]
    async fn collect_after_start_emits_rates() {
        let mut collector = InterfaceRateCollector::new(
            Duration::from_secs(30),
            Box::new(ScriptedSource::new(vec![
                Ok(snapshot(&[("eth0", counters(1_000, 1_000))])),
                Ok(snapshot(&[("eth0", counters(2_000, 1_500))])),
            ])),
        );
        collector.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let metrics = collector.collect().await.unwrap();

        assert_eq!(metrics.len(), 12);
        let rx = value(&metrics, "network_interface_rx_bytes_per_sec", "eth0").unwrap();
        assert!(rx > 0.0);
    }

    #[tokio::test]
    async fn reads_from_proc_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("net")).unwrap();
        std::fs::write(dir.path().join("net/dev"), PROC_NET_DEV).unwrap();

        let source = ProcNetDev::new(dir.path().to_str().unwrap());
        let snap = source.sample().await.unwrap();
        assert!(snap.contains_key("eth0"));
    }
}
