pub mod agent;
pub mod collector;
pub mod config;
pub mod queue;
pub mod transmitter;

/// Common types used across modules
pub mod types {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Serialize};
    use std::collections::BTreeMap;

    /// Tag set attached to a metric. Keys are unique by construction.
    pub type Tags = BTreeMap<String, String>;

    /// A single metric measurement
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct Metric {
        pub name: String,
        pub value: f64,
        pub unit: String,
        pub timestamp: DateTime<Utc>,
        pub tags: Tags,
        #[serde(rename = "type")]
        pub kind: MetricType,
    }

    impl Metric {
        pub fn gauge(
            name: impl Into<String>,
            value: f64,
            unit: impl Into<String>,
            timestamp: DateTime<Utc>,
            tags: &Tags,
        ) -> Self {
            Self {
                name: name.into(),
                value,
                unit: unit.into(),
                timestamp,
                tags: tags.clone(),
                kind: MetricType::Gauge,
            }
        }

        pub fn counter(
            name: impl Into<String>,
            value: f64,
            unit: impl Into<String>,
            timestamp: DateTime<Utc>,
            tags: &Tags,
        ) -> Self {
            Self {
                kind: MetricType::Counter,
                ..Self::gauge(name, value, unit, timestamp, tags)
            }
        }
    }

    /// Kind of measurement carried by a [`Metric`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum MetricType {
        Gauge,
        Counter,
        Histogram,
        Timing,
    }

    impl std::fmt::Display for MetricType {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                MetricType::Gauge => write!(f, "gauge"),
                MetricType::Counter => write!(f, "counter"),
                MetricType::Histogram => write!(f, "histogram"),
                MetricType::Timing => write!(f, "timing"),
            }
        }
    }

    /// Where the agent runs. Attached to registration and to every batch.
    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct CloudLocation {
        #[serde(default)]
        pub provider: String,
        #[serde(default)]
        pub region: String,
        #[serde(default)]
        pub zone: String,
        #[serde(default)]
        pub network: String,
        #[serde(default)]
        pub subnet: String,
        #[serde(default)]
        pub instance_id: String,
        #[serde(default)]
        pub private_ip: String,
        #[serde(default)]
        pub public_ip: String,
    }

    /// A group of metrics flushed to the backend together
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct MetricBatch {
        pub agent_id: String,
        pub timestamp: DateTime<Utc>,
        pub metrics: Vec<Metric>,
        pub location: CloudLocation,
    }

}
