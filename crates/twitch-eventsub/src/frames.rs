use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use twitch_core::{Condition, Result, TwitchError};

/// Close reasons after which reconnecting cannot help.
const FATAL_CLOSE_REASONS: &[&str] = &[
    "authorization_revoked",
    "user_removed",
    "rate_limited",
    "client_sent_inbound_traffic",
];

/// 4001: client sent inbound traffic. 1008: policy violation.
const FATAL_CLOSE_CODES: &[u16] = &[4001, 1008];

#[derive(Debug, Clone, Deserialize)]
pub struct Metadata {
    pub message_id: String,
    pub message_type: String,
    #[serde(default)]
    pub message_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub subscription_type: Option<String>,
    #[serde(default)]
    pub subscription_version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    metadata: Metadata,
    #[serde(default)]
    payload: Value,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SessionInfo {
    pub id: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub keepalive_timeout_seconds: Option<u64>,
    #[serde(default)]
    pub reconnect_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SessionPayload {
    session: SessionInfo,
}

/// Subscription block attached to notifications and revocations.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SubscriptionMeta {
    pub id: String,
    #[serde(rename = "type")]
    pub subscription_type: String,
    pub version: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub cost: u32,
    #[serde(default)]
    pub condition: Condition,
}

#[derive(Debug, Deserialize)]
struct SubscriptionPayload {
    subscription: SubscriptionMeta,
    #[serde(default)]
    event: Value,
}

/// An event delivered on the stream. The payload is passed through as JSON.
#[derive(Debug, Clone)]
pub struct Notification {
    pub message_id: String,
    pub subscription: SubscriptionMeta,
    pub event: Value,
    pub timestamp: DateTime<Utc>,
}

impl Notification {
    pub fn subscription_type(&self) -> &str {
        &self.subscription.subscription_type
    }

    /// Value of a condition key on the originating subscription.
    pub fn condition_value(&self, key: &str) -> Option<&str> {
        self.subscription.condition.get(key).map(String::as_str)
    }

    /// String field of the event payload.
    pub fn event_str(&self, field: &str) -> Option<&str> {
        self.event.get(field).and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CloseNotice {
    #[serde(default)]
    pub code: Option<u16>,
    #[serde(default)]
    pub reason: String,
}

impl CloseNotice {
    pub fn is_fatal(&self) -> bool {
        is_fatal_close(self.code, &self.reason)
    }
}

#[derive(Debug, Clone)]
pub enum Frame {
    Welcome {
        message_id: String,
        session: SessionInfo,
    },
    Keepalive {
        message_id: String,
    },
    Notification(Notification),
    Reconnect {
        message_id: String,
        session: SessionInfo,
    },
    Revocation {
        message_id: String,
        subscription: SubscriptionMeta,
    },
    Close(CloseNotice),
}

impl Frame {
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Welcome { .. } => "session_welcome",
            Frame::Keepalive { .. } => "session_keepalive",
            Frame::Notification(_) => "notification",
            Frame::Reconnect { .. } => "session_reconnect",
            Frame::Revocation { .. } => "revocation",
            Frame::Close(_) => "session_close",
        }
    }
}

fn payload<T: DeserializeOwned>(value: Value, kind: &str) -> Result<T> {
    serde_json::from_value(value)
        .map_err(|e| TwitchError::Protocol(format!("malformed {} payload: {}", kind, e)))
}

pub fn parse_frame(text: &str) -> Result<Frame> {
    let envelope: Envelope = serde_json::from_str(text)
        .map_err(|e| TwitchError::Protocol(format!("malformed frame: {}", e)))?;
    let Envelope { metadata, payload: body } = envelope;
    let kind = metadata.message_type.as_str();

    let frame = match kind {
        "session_welcome" => {
            let p: SessionPayload = payload(body, kind)?;
            Frame::Welcome {
                message_id: metadata.message_id,
                session: p.session,
            }
        }
        "session_keepalive" => Frame::Keepalive {
            message_id: metadata.message_id,
        },
        "notification" => {
            let p: SubscriptionPayload = payload(body, kind)?;
            Frame::Notification(Notification {
                message_id: metadata.message_id,
                subscription: p.subscription,
                event: p.event,
                timestamp: metadata.message_timestamp.unwrap_or_else(Utc::now),
            })
        }
        "session_reconnect" => {
            let p: SessionPayload = payload(body, kind)?;
            if p.session.reconnect_url.is_none() {
                return Err(TwitchError::Protocol(
                    "reconnect frame without reconnect_url".into(),
                ));
            }
            Frame::Reconnect {
                message_id: metadata.message_id,
                session: p.session,
            }
        }
        "revocation" => {
            let p: SubscriptionPayload = payload(body, kind)?;
            Frame::Revocation {
                message_id: metadata.message_id,
                subscription: p.subscription,
            }
        }
        "session_close" => Frame::Close(payload(body, kind)?),
        other => {
            return Err(TwitchError::Protocol(format!(
                "unknown message type '{}'",
                other
            )))
        }
    };
    Ok(frame)
}

pub fn is_fatal_close(code: Option<u16>, reason: &str) -> bool {
    if code.is_some_and(|c| FATAL_CLOSE_CODES.contains(&c)) {
        return true;
    }
    let reason = reason.to_ascii_lowercase();
    FATAL_CLOSE_REASONS.iter().any(|r| reason.contains(r))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn welcome_carries_session_and_keepalive() {
        let text = json!({
            "metadata": {
                "message_id": "96a3f3b5",
                "message_type": "session_welcome",
                "message_timestamp": "2023-07-19T14:56:51.634234626Z"
            },
            "payload": {
                "session": {
                    "id": "AQoQILE98gtqShGmLD7AM6yJThAB",
                    "status": "connected",
                    "connected_at": "2023-07-19T14:56:51.616329898Z",
                    "keepalive_timeout_seconds": 10,
                    "reconnect_url": null
                }
            }
        })
        .to_string();

        match parse_frame(&text).unwrap() {
            Frame::Welcome { session, .. } => {
                assert_eq!(session.id, "AQoQILE98gtqShGmLD7AM6yJThAB");
                assert_eq!(session.keepalive_timeout_seconds, Some(10));
                assert!(session.reconnect_url.is_none());
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn notification_passes_event_through() {
        let text = json!({
            "metadata": {
                "message_id": "befa7b53",
                "message_type": "notification",
                "message_timestamp": "2022-11-16T10:11:12.464757833Z",
                "subscription_type": "channel.follow",
                "subscription_version": "2"
            },
            "payload": {
                "subscription": {
                    "id": "f1c2a387",
                    "status": "enabled",
                    "type": "channel.follow",
                    "version": "2",
                    "cost": 0,
                    "condition": {"broadcaster_user_id": "1337", "moderator_user_id": "1337"},
                    "transport": {"method": "websocket", "session_id": "AQoQexAW"},
                    "created_at": "2022-11-16T10:11:12.464757833Z"
                },
                "event": {
                    "user_id": "1234",
                    "user_login": "cool_user",
                    "broadcaster_user_id": "1337"
                }
            }
        })
        .to_string();

        match parse_frame(&text).unwrap() {
            Frame::Notification(n) => {
                assert_eq!(n.subscription_type(), "channel.follow");
                assert_eq!(n.condition_value("broadcaster_user_id"), Some("1337"));
                assert_eq!(n.event_str("user_login"), Some("cool_user"));
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn reconnect_requires_url() {
        let text = json!({
            "metadata": {"message_id": "84c1e79a", "message_type": "session_reconnect"},
            "payload": {"session": {"id": "AQoQ", "status": "reconnecting"}}
        })
        .to_string();

        assert!(matches!(parse_frame(&text), Err(TwitchError::Protocol(_))));
    }

    #[test]
    fn garbage_and_unknown_types_are_protocol_errors() {
        assert!(matches!(parse_frame("not json"), Err(TwitchError::Protocol(_))));

        let text = json!({
            "metadata": {"message_id": "1", "message_type": "session_dance"},
            "payload": {}
        })
        .to_string();
        assert!(matches!(parse_frame(&text), Err(TwitchError::Protocol(_))));
    }

    #[test]
    fn close_policy() {
        assert!(is_fatal_close(Some(4001), ""));
        assert!(is_fatal_close(Some(1008), ""));
        assert!(is_fatal_close(None, "authorization_revoked"));
        assert!(is_fatal_close(Some(4000), "rate_limited"));
        assert!(!is_fatal_close(Some(4002), "failed ping-pong"));
        assert!(!is_fatal_close(Some(1006), ""));
        assert!(!is_fatal_close(None, "network drop"));

        let notice = CloseNotice {
            code: None,
            reason: "user_removed".into(),
        };
        assert!(notice.is_fatal());
    }
}
