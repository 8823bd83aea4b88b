//! Parsing of the system `ping` executable's textual output.

use anyhow::Result;
use regex::Regex;

/// Round-trip statistics in milliseconds
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RttStats {
    pub min: f64,
    pub avg: f64,
    pub max: f64,
}

/// What one probe run reported
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeSummary {
    pub packet_loss_percent: f64,
    pub rtt: Option<RttStats>,
}

/// Output dialect of the platform's ping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingFlavor {
    Unix,
    Windows,
}

impl PingFlavor {
    pub fn host() -> Self {
        if cfg!(windows) { PingFlavor::Windows } else { PingFlavor::Unix }
    }

    /// Flag selecting the packet count
    pub fn count_flag(&self) -> &'static str {
        match self {
            PingFlavor::Unix => "-c",
            PingFlavor::Windows => "-n",
        }
    }
}

/// Sub-millisecond Windows replies ("time<1ms") are counted as this many ms
const SUB_MS_RTT: f64 = 0.5;

pub struct PingOutputParser {
    flavor: PingFlavor,
    unix_loss: Regex,
    unix_rtt: Regex,
    win_time: Regex,
    win_sent: Regex,
}

impl PingOutputParser {
    pub fn new(flavor: PingFlavor) -> Result<Self> {
        Ok(Self {
            flavor,
            // "3 packets transmitted, 3 received, 0% packet loss"
            unix_loss: Regex::new(r"(\d+(?:\.\d+)?)% packet loss")?,
            // "rtt min/avg/max/mdev = 10.1/12.3/15.0/1.2 ms"; BSD spells it round-trip/stddev,
            // BusyBox prints only "round-trip min/avg/max = a/b/c ms"
            unix_rtt: Regex::new(
                r"(?:rtt|round-trip) min/avg/max(?:/(?:mdev|stddev))? = ([\d.]+)/([\d.]+)/([\d.]+)(?:/[\d.]+)?",
            )?,
            // "Reply from 8.8.8.8: bytes=32 time=12ms TTL=117"
            win_time: Regex::new(r"time=(\d+(?:\.\d+)?)\s*ms")?,
            // "Packets: Sent = 4, Received = 4, Lost = 0 (0% loss)"
            win_sent: Regex::new(r"Sent = (\d+)")?,
        })
    }

    pub fn parse(&self, output: &str) -> ProbeSummary {
        match self.flavor {
            PingFlavor::Unix => self.parse_unix(output),
            PingFlavor::Windows => self.parse_windows(output),
        }
    }

    pub fn parse_unix(&self, output: &str) -> ProbeSummary {
        let packet_loss_percent = self
            .unix_loss
            .captures(output)
            .and_then(|c| c[1].parse::<f64>().ok())
            .unwrap_or(0.0);

        let rtt = self.unix_rtt.captures(output).and_then(|c| {
            Some(RttStats {
                min: c[1].parse().ok()?,
                avg: c[2].parse().ok()?,
                max: c[3].parse().ok()?,
            })
        });

        ProbeSummary { packet_loss_percent, rtt }
    }

    pub fn parse_windows(&self, output: &str) -> ProbeSummary {
        let mut rtts = Vec::new();
        let mut attempts = 0u32;
        let mut replies = 0u32;
        let mut summary_sent = None;

        for line in output.lines().map(str::trim) {
            if let Some(c) = self.win_sent.captures(line) {
                summary_sent = c[1].parse::<u32>().ok();
                continue;
            }

            if line.contains("time<1ms") {
                attempts += 1;
                replies += 1;
                rtts.push(SUB_MS_RTT);
            } else if let Some(c) = self.win_time.captures(line) {
                attempts += 1;
                replies += 1;
                if let Ok(rtt) = c[1].parse::<f64>() {
                    rtts.push(rtt);
                }
            } else if is_failed_attempt(line) {
                attempts += 1;
            }
        }

        let sent = summary_sent.unwrap_or(attempts);
        let packet_loss_percent = if sent > 0 {
            f64::from(sent.saturating_sub(replies)) / f64::from(sent) * 100.0
        } else {
            0.0
        };

        let rtt = if rtts.is_empty() {
            None
        } else {
            let sum: f64 = rtts.iter().sum();
            Some(RttStats {
                min: rtts.iter().copied().fold(f64::INFINITY, f64::min),
                avg: sum / rtts.len() as f64,
                max: rtts.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            })
        };

        ProbeSummary { packet_loss_percent, rtt }
    }
}

fn is_failed_attempt(line: &str) -> bool {
    line.starts_with("Request timed out")
        || line.contains("Destination host unreachable")
        || line.contains("Destination net unreachable")
        || line.starts_with("General failure")
        || line.contains("transmit failed")
}
