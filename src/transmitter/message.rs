//! JSON envelopes exchanged with the backend over the WebSocket.
//!
//! Every text frame is `{"type": <string>, "data": <payload>}`.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use super::TransmitError;
use crate::types::{CloudLocation, MetricBatch};

/// Protocol version announced at registration
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// Backend endpoint for agent connections
pub const CONNECT_PATH: &str = "/api/v1/agents/connect";

/// Messages the agent sends
#[derive(Debug, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Outbound<'a> {
    Registration(Registration<'a>),
    Metrics(&'a MetricBatch),
    Pong(Pong),
}

#[derive(Debug, Serialize)]
pub struct Registration<'a> {
    pub agent_id: &'a str,
    pub location: &'a CloudLocation,
    pub timestamp: DateTime<Utc>,
    pub version: &'static str,
}

#[derive(Debug, Serialize)]
pub struct Pong {
    pub timestamp: DateTime<Utc>,
}

impl<'a> Outbound<'a> {
    pub fn registration(agent_id: &'a str, location: &'a CloudLocation, now: DateTime<Utc>) -> Self {
        Outbound::Registration(Registration {
            agent_id,
            location,
            timestamp: now,
            version: PROTOCOL_VERSION,
        })
    }

    pub fn pong(now: DateTime<Utc>) -> Self {
        Outbound::Pong(Pong { timestamp: now })
    }

    pub fn to_json(&self) -> Result<String, TransmitError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Messages the backend may send
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Ping,
    ConfigUpdate(serde_json::Value),
    Command(serde_json::Value),
    Unknown(String),
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
}

/// Decode one inbound text frame. A frame without a `type` is an error.
pub fn parse_inbound(text: &str) -> Result<Inbound> {
    let envelope: Envelope = serde_json::from_str(text)?;
    Ok(match envelope.kind.as_str() {
        "ping" => Inbound::Ping,
        "config_update" => Inbound::ConfigUpdate(envelope.data),
        "command" => Inbound::Command(envelope.data),
        _ => Inbound::Unknown(envelope.kind),
    })
}

/// Derive the WebSocket endpoint from the configured backend URL.
///
/// `http` becomes `ws` and `https` becomes `wss`; the path is replaced with
/// [`CONNECT_PATH`] and the agent's identity is added to the query.
pub fn connect_url(backend_url: &str, agent_id: &str, location: &CloudLocation) -> Result<Url, TransmitError> {
    let mut url = Url::parse(backend_url).map_err(|e| TransmitError::InvalidUrl(format!("{}: {}", backend_url, e)))?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(TransmitError::InvalidUrl(format!("unsupported scheme '{}'", other)));
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| TransmitError::InvalidUrl(format!("cannot use scheme '{}' for {}", scheme, backend_url)))?;
    url.set_path(CONNECT_PATH);

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !matches!(k.as_ref(), "agent_id" | "provider" | "region"))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    url.query_pairs_mut()
        .clear()
        .extend_pairs(kept)
        .append_pair("agent_id", agent_id)
        .append_pair("provider", &location.provider)
        .append_pair("region", &location.region);

    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Metric, Tags};
    use chrono::TimeZone;

    fn location() -> CloudLocation {
        CloudLocation {
            provider: "aws".into(),
            region: "us-east-1".into(),
            zone: "us-east-1a".into(),
            ..Default::default()
        }
    }

    #[test]
    fn http_maps_to_ws() {
        let url = connect_url("http://backend:8080", "agent-1", &location()).unwrap();
        assert_eq!(
            url.as_str(),
            "ws://backend:8080/api/v1/agents/connect?agent_id=agent-1&provider=aws&region=us-east-1"
        );
    }

    #[test]
    fn https_maps_to_wss_and_replaces_path() {
        let url = connect_url("https://collector.example.com/some/path?token=abc", "a b", &location()).unwrap();
        assert_eq!(url.scheme(), "wss");
        assert_eq!(url.path(), CONNECT_PATH);
        let pairs: Vec<(String, String)> = url.query_pairs().map(|(k, v)| (k.into_owned(), v.into_owned())).collect();
        assert_eq!(pairs[0], ("token".to_string(), "abc".to_string()));
        assert!(pairs.contains(&("agent_id".to_string(), "a b".to_string())));
    }

    #[test]
    fn rejects_unsupported_scheme() {
        assert!(matches!(
            connect_url("ftp://backend", "a", &location()),
            Err(TransmitError::InvalidUrl(_))
        ));
        assert!(matches!(connect_url("not a url", "a", &location()), Err(TransmitError::InvalidUrl(_))));
    }

    #[test]
    fn registration_envelope() {
        let loc = location();
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let json: serde_json::Value =
            serde_json::from_str(&Outbound::registration("agent-1", &loc, now).to_json().unwrap()).unwrap();

        assert_eq!(json["type"], "registration");
        assert_eq!(json["data"]["agent_id"], "agent-1");
        assert_eq!(json["data"]["version"], PROTOCOL_VERSION);
        assert_eq!(json["data"]["location"]["region"], "us-east-1");
        assert_eq!(json["data"]["timestamp"], "2024-05-01T12:00:00Z");
    }

    #[test]
    fn metrics_envelope_wraps_batch() {
        let now = Utc::now();
        let batch = MetricBatch {
            agent_id: "agent-1".into(),
            timestamp: now,
            metrics: vec![Metric::gauge("ping_success", 1.0, "bool", now, &Tags::new())],
            location: location(),
        };
        let json: serde_json::Value = serde_json::from_str(&Outbound::Metrics(&batch).to_json().unwrap()).unwrap();

        assert_eq!(json["type"], "metrics");
        assert_eq!(json["data"]["agent_id"], "agent-1");
        assert_eq!(json["data"]["metrics"][0]["name"], "ping_success");
        assert_eq!(json["data"]["metrics"][0]["type"], "gauge");
    }

    #[test]
    fn pong_envelope() {
        let json: serde_json::Value = serde_json::from_str(&Outbound::pong(Utc::now()).to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "pong");
        assert!(json["data"]["timestamp"].is_string());
    }

    #[test]
    fn inbound_dispatch() {
        assert_eq!(parse_inbound(r#"{"type":"ping"}"#).unwrap(), Inbound::Ping);
        assert!(matches!(
            parse_inbound(r#"{"type":"config_update","data":{"interval":30}}"#).unwrap(),
            Inbound::ConfigUpdate(v) if v["interval"] == 30
        ));
        assert!(matches!(parse_inbound(r#"{"type":"command","data":"restart"}"#).unwrap(), Inbound::Command(_)));
        assert_eq!(
            parse_inbound(r#"{"type":"telemetry_ack"}"#).unwrap(),
            Inbound::Unknown("telemetry_ack".into())
        );
    }

    #[test]
    fn inbound_without_type_is_error() {
        assert!(parse_inbound(r#"{"data":{}}"#).is_err());
        assert!(parse_inbound("not json").is_err());
    }
}
