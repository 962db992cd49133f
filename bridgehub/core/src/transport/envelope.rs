//! RPC Envelopes
//!
//! The one record type exchanged between the hub and its bridges.
//!
//! A request carries a fresh [`SessionToken`]; the peer answers with a
//! second envelope whose `path` *is* that token. Sessions are single-shot
//! and never reused, so a reply can only ever match the request that
//! produced it. Void events reuse the same record but are never answered.

use std::fmt;
use std::str::FromStr;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::traits::Params;

/// Reserved heartbeat request path
pub const PING_PATH: &str = "ping";

/// Body of the reply to [`PING_PATH`]
pub const PONG: &str = "pong";

/// One-shot correlation id pairing a request with its reply
///
/// Rendered as `<unix-millis>:<16 hex chars>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionToken(String);

impl SessionToken {
    /// Generate a new token from the wall clock and 64 random bits
    #[must_use]
    pub fn generate() -> Self {
        let mut random = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut random);
        Self(format!(
            "{}:{}",
            chrono::Utc::now().timestamp_millis(),
            hex::encode(random)
        ))
    }

    /// Token as sent on the wire
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Fire-and-forget events that never produce a reply
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoidEvent {
    /// A log line forwarded from a bridge
    Log,
    /// A user-facing notification
    Notification,
    /// One or more accessories changed value
    AccessoryChange,
    /// Bridge configuration was edited
    ConfigChange,
    /// Accessory room/ordering layout changed
    RoomChange,
    /// Periodic monitoring sample
    Monitor,
    /// Ask the receiving process to restart
    Restart,
}

impl VoidEvent {
    /// Every void event, in wire-name order
    pub const ALL: [VoidEvent; 7] = [
        VoidEvent::Log,
        VoidEvent::Notification,
        VoidEvent::AccessoryChange,
        VoidEvent::ConfigChange,
        VoidEvent::RoomChange,
        VoidEvent::Monitor,
        VoidEvent::Restart,
    ];

    /// Wire name of the event
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Log => "log",
            Self::Notification => "notification",
            Self::AccessoryChange => "accessory_change",
            Self::ConfigChange => "config_change",
            Self::RoomChange => "room_change",
            Self::Monitor => "monitor",
            Self::Restart => "restart",
        }
    }
}

impl fmt::Display for VoidEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VoidEvent {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|event| event.as_str() == s)
            .ok_or(())
    }
}

/// Wire record for requests, replies and void events
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RpcEnvelope {
    /// Command name, or the session token when this is a reply
    pub path: String,
    /// Correlation token of the request this envelope belongs to
    pub session: SessionToken,
    /// String parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Params>,
    /// Arbitrary payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

impl RpcEnvelope {
    /// Build a request for `path` with a freshly generated session
    #[must_use]
    pub fn request(path: impl Into<String>, params: Option<Params>, body: Option<Value>) -> Self {
        Self {
            path: path.into(),
            session: SessionToken::generate(),
            params,
            body,
        }
    }

    /// Build a void event envelope
    #[must_use]
    pub fn event(event: VoidEvent, data: Value) -> Self {
        Self::request(event.as_str(), None, Some(data))
    }

    /// Build the reply addressed to this request's session
    #[must_use]
    pub fn reply(&self, body: Value) -> Self {
        Self {
            path: self.session.as_str().to_string(),
            session: self.session.clone(),
            params: None,
            body: Some(body),
        }
    }

    /// The void event this envelope carries, if any
    #[must_use]
    pub fn void_event(&self) -> Option<VoidEvent> {
        self.path.parse().ok()
    }

    /// Whether this envelope answers a request (its path is its session)
    #[must_use]
    pub fn is_reply(&self) -> bool {
        self.path == self.session.as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_tokens_are_unique() {
        let a = SessionToken::generate();
        let b = SessionToken::generate();
        assert_ne!(a, b);

        let (millis, random) = a.as_str().split_once(':').unwrap();
        assert!(millis.parse::<i64>().is_ok());
        assert_eq!(random.len(), 16);
    }

    #[test]
    fn test_reply_is_addressed_by_session() {
        let request = RpcEnvelope::request("status:get", None, None);
        let reply = request.reply(serde_json::json!({ "ok": true }));

        assert_eq!(reply.path, request.session.as_str());
        assert!(reply.is_reply());
        assert!(!request.is_reply());
    }

    #[test]
    fn test_void_event_names() {
        for event in VoidEvent::ALL {
            assert_eq!(event.as_str().parse::<VoidEvent>(), Ok(event));
        }
        assert!("accessories:list".parse::<VoidEvent>().is_err());

        let env = RpcEnvelope::event(VoidEvent::AccessoryChange, Value::Null);
        assert_eq!(env.void_event(), Some(VoidEvent::AccessoryChange));
    }

    #[test]
    fn test_optional_fields_omitted_on_wire() {
        let env = RpcEnvelope::request(PING_PATH, None, None);
        let json = serde_json::to_value(&env).unwrap();
        assert!(json.get("params").is_none());
        assert!(json.get("body").is_none());
        assert_eq!(json["path"], "ping");
    }
}
