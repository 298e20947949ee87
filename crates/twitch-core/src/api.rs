//! Contracts for the outbound collaborators.
//!
//! The session engine only talks to the platform through these traits, so
//! tests substitute in-process fakes and the binaries plug in the HTTP
//! clients.

use async_trait::async_trait;

use crate::error::{Result, TwitchError};
use crate::types::{
    AuthGrant, ChannelInfo, CreateSubscriptionRequest, CreatedSubscription, PendingDeviceAuth,
    StreamInfo, TokenInfo,
};

/// Resource client for the Helix API.
#[async_trait]
pub trait HelixApi: Send + Sync {
    /// Create an EventSub subscription bound to a websocket session.
    ///
    /// Rejections map to `TwitchError::Admission`: cost limit, an identical
    /// subscription already present on the server, or missing scopes.
    async fn create_subscription(
        &self,
        request: &CreateSubscriptionRequest,
    ) -> Result<CreatedSubscription>;

    /// Delete a subscription. Deleting an unknown id is not an error.
    async fn delete_subscription(&self, id: &str) -> Result<()>;

    async fn get_channel(&self, broadcaster_id: &str) -> Result<ChannelInfo>;

    /// `None` when the user is not live.
    async fn get_stream(&self, user_id: &str) -> Result<Option<StreamInfo>>;
}

/// Outcome of one device-token poll.
#[derive(Debug, Clone, PartialEq)]
pub enum DevicePoll {
    Granted(AuthGrant),
    Pending,
    SlowDown,
    Denied,
    Expired,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RefreshOutcome {
    Granted(AuthGrant),
    /// The refresh token is no longer accepted.
    Invalid(String),
}

/// OAuth endpoints used by the device flow and the token authority.
#[async_trait]
pub trait OAuthApi: Send + Sync {
    async fn request_device_code(&self, scopes: &[String]) -> Result<PendingDeviceAuth>;

    async fn poll_device_token(&self, device_code: &str, scopes: &[String]) -> Result<DevicePoll>;

    async fn refresh_token(&self, refresh_token: &str) -> Result<RefreshOutcome>;

    /// `None` when the token is rejected.
    async fn validate_token(&self, access_token: &str) -> Result<Option<TokenInfo>>;

    async fn revoke_token(&self, token: &str) -> Result<()>;
}

/// Source of bearer tokens for outbound calls.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Current access token. Waits at most a bounded window when a refresh is
    /// in progress.
    async fn access_token(&self) -> Result<String>;

    /// Called after the server rejected a token. Refreshes once and returns
    /// the new token; repeated failure is fatal for the client.
    async fn on_unauthorized(&self) -> Result<String>;

    /// Id of the user the token belongs to, once known.
    async fn user_id(&self) -> Option<String>;
}

/// A fixed token that cannot be refreshed. Rejection is final.
#[derive(Debug, Clone)]
pub struct StaticToken {
    token: String,
    user_id: Option<String>,
}

impl StaticToken {
    pub fn new(token: impl Into<String>, user_id: Option<String>) -> Self {
        Self {
            token: token.into(),
            user_id,
        }
    }
}

#[async_trait]
impl TokenSource for StaticToken {
    async fn access_token(&self) -> Result<String> {
        Ok(self.token.clone())
    }

    async fn on_unauthorized(&self) -> Result<String> {
        Err(TwitchError::Authorization(
            "static token was rejected and cannot be refreshed".into(),
        ))
    }

    async fn user_id(&self) -> Option<String> {
        self.user_id.clone()
    }
}
