//! Protocol message types for the SignalK WebSocket stream.
//!
//! The websocket provider connects to another SignalK server as a client:
//! - Server → Client: Hello, then Delta messages
//! - Client → Server: Subscribe, Unsubscribe
//!
//! Messages are serialized as JSON over WebSocket text frames.

use serde::{Deserialize, Serialize};
use signalk_core::Delta;

/// Subscription request message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscribeRequest {
    pub context: String,
    pub subscribe: Vec<Subscription>,
}

impl SubscribeRequest {
    /// Subscribe to a single path pattern in `context`.
    pub fn single(context: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            context: context.into(),
            subscribe: vec![Subscription::path(path)],
        }
    }
}

/// A single subscription specification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub period: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy: Option<SubscriptionPolicy>,
    #[serde(rename = "minPeriod", skip_serializing_if = "Option::is_none")]
    pub min_period: Option<u64>,
}

impl Subscription {
    pub fn path(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            period: None,
            policy: None,
            min_period: None,
        }
    }
}

/// Subscription policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionPolicy {
    Instant,
    Ideal,
    Fixed,
}

/// Unsubscribe request message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnsubscribeRequest {
    pub context: String,
    pub unsubscribe: Vec<UnsubscribeSpec>,
}

/// Unsubscribe specification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnsubscribeSpec {
    pub path: String,
}

/// Hello message a server sends immediately after the connection opens.
///
/// # Example
/// ```json
/// {
///   "name": "signalk-server",
///   "version": "1.7.0",
///   "self": "vessels.urn:mrn:signalk:uuid:c0d79334-4e25-4245-8892-54e8ccc8021d",
///   "roles": ["main"],
///   "timestamp": "2024-01-17T10:30:00.000Z"
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelloMessage {
    #[serde(default)]
    pub name: Option<String>,

    pub version: String,

    /// The server's self context.
    #[serde(rename = "self")]
    pub self_urn: String,

    #[serde(default)]
    pub roles: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl HelloMessage {
    pub fn new(name: impl Into<String>, version: impl Into<String>, self_urn: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            version: version.into(),
            self_urn: self_urn.into(),
            roles: vec!["main".to_string()],
            timestamp: Some(chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)),
        }
    }
}

/// Messages received from a server.
///
/// Untagged: Hello is recognized by `version` + `self`, Delta by `updates`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Hello(HelloMessage),
    Delta(Delta),
}

/// Messages sent to a server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClientMessage {
    Subscribe(SubscribeRequest),
    Unsubscribe(UnsubscribeRequest),
}

/// Discovery response for the `/signalk` endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryResponse {
    pub endpoints: DiscoveryEndpoints,
    pub server: ServerInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryEndpoints {
    pub v1: DiscoveryV1,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryV1 {
    pub version: String,
    #[serde(rename = "signalk-http")]
    pub signalk_http: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub id: String,
    pub version: String,
}

impl DiscoveryResponse {
    /// Discovery for the HTTP read-out served at `host:port`.
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            endpoints: DiscoveryEndpoints {
                v1: DiscoveryV1 {
                    version: signalk_core::store::SIGNALK_VERSION.to_string(),
                    signalk_http: format!("http://{}:{}/signalk/v1/api", host, port),
                },
            },
            server: ServerInfo {
                id: "signalk-ingest".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        }
    }
}
