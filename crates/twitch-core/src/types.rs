use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

/// Subscription condition, e.g. `{"broadcaster_user_id": "1234"}`.
///
/// Ordered so that two conditions with the same pairs compare equal and hash
/// the same regardless of insertion order.
pub type Condition = BTreeMap<String, String>;

/// Build a condition from key/value pairs.
pub fn condition<K, V, I>(pairs: I) -> Condition
where
    K: Into<String>,
    V: Into<String>,
    I: IntoIterator<Item = (K, V)>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

/// Credentials held by the token authority. Consumers only ever see clones.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthGrant {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub scopes: BTreeSet<String>,
    pub expires_at: DateTime<Utc>,
    /// Learned from token validation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub login: Option<String>,
}

impl AuthGrant {
    pub fn new(access_token: impl Into<String>, expires_in: Duration) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: None,
            scopes: BTreeSet::new(),
            expires_at: Utc::now() + chrono_duration(expires_in),
            user_id: None,
            login: None,
        }
    }

    pub fn with_refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(refresh_token.into());
        self
    }

    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }

    /// True when the grant expires within `margin` from now.
    pub fn expires_within(&self, margin: Duration) -> bool {
        self.expires_at <= Utc::now() + chrono_duration(margin)
    }

    pub fn apply_validation(&mut self, info: &TokenInfo) {
        self.user_id = info.user_id.clone().or_else(|| self.user_id.take());
        self.login = info.login.clone().or_else(|| self.login.take());
        if !info.scopes.is_empty() {
            self.scopes = info.scopes.iter().cloned().collect();
        }
        self.expires_at = Utc::now() + chrono::Duration::seconds(info.expires_in as i64);
    }
}

/// Result of `GET /oauth2/validate`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TokenInfo {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub login: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub expires_in: u64,
}

/// One in-progress device authorization attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingDeviceAuth {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    pub interval: Duration,
    pub expires_at: DateTime<Utc>,
}

impl PendingDeviceAuth {
    /// Time left before the code expires, zero once it has.
    pub fn time_remaining(&self) -> Duration {
        (self.expires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Pending,
    Enabled,
    Failed,
    Revoked,
}

impl SubscriptionStatus {
    /// Pending and enabled subscriptions hold budget and count toward the
    /// duplicate limit.
    pub fn is_live(&self) -> bool {
        matches!(self, SubscriptionStatus::Pending | SubscriptionStatus::Enabled)
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubscriptionStatus::Pending => write!(f, "pending"),
            SubscriptionStatus::Enabled => write!(f, "enabled"),
            SubscriptionStatus::Failed => write!(f, "failed"),
            SubscriptionStatus::Revoked => write!(f, "revoked"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransportSpec {
    pub method: String,
    pub session_id: String,
}

impl TransportSpec {
    pub fn websocket(session_id: impl Into<String>) -> Self {
        Self {
            method: "websocket".to_string(),
            session_id: session_id.into(),
        }
    }
}

/// Body of `POST /eventsub/subscriptions`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreateSubscriptionRequest {
    #[serde(rename = "type")]
    pub subscription_type: String,
    pub version: String,
    pub condition: Condition,
    pub transport: TransportSpec,
}

/// Server confirmation of a created subscription, with the account-wide
/// cost totals reported alongside it.
#[derive(Debug, Clone, PartialEq)]
pub struct CreatedSubscription {
    pub id: String,
    pub status: String,
    pub cost: u32,
    pub total_cost: u32,
    pub max_total_cost: u32,
}

/// Channel metadata from `GET /channels`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelInfo {
    pub broadcaster_id: String,
    #[serde(default)]
    pub broadcaster_login: String,
    #[serde(default)]
    pub broadcaster_name: String,
    #[serde(default)]
    pub broadcaster_language: String,
    #[serde(default)]
    pub game_id: String,
    #[serde(default)]
    pub game_name: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub delay: u32,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Live stream status from `GET /streams`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamInfo {
    pub id: String,
    pub user_id: String,
    #[serde(default)]
    pub user_login: String,
    #[serde(default)]
    pub game_name: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub viewer_count: u64,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub language: String,
    #[serde(default)]
    pub is_mature: bool,
}

pub(crate) fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}
