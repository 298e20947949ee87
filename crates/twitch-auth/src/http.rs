use async_trait::async_trait;
use chrono::Utc;
use reqwest::StatusCode;
use reqwest_middleware::ClientWithMiddleware;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use twitch_core::http::{build_retry_client, error_message};
use twitch_core::{
    AuthGrant, ClientConfig, DevicePoll, OAuthApi, PendingDeviceAuth, RefreshOutcome, Result,
    TokenInfo, TwitchError,
};

const DEVICE_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:device_code";

#[derive(Debug, Deserialize)]
struct DeviceCodeResponse {
    device_code: String,
    user_code: String,
    verification_uri: String,
    expires_in: u64,
    interval: u64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: u64,
    #[serde(default)]
    scope: Vec<String>,
}

impl TokenResponse {
    fn into_grant(self) -> AuthGrant {
        let mut grant = AuthGrant::new(self.access_token, Duration::from_secs(self.expires_in))
            .with_scopes(self.scope);
        grant.refresh_token = self.refresh_token;
        grant
    }
}

/// Client for the `id.twitch.tv/oauth2` endpoints.
pub struct OAuthClient {
    http: ClientWithMiddleware,
    base_url: String,
    client_id: String,
    client_secret: Option<String>,
}

impl OAuthClient {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        Ok(Self::with_http(
            build_retry_client(3)?,
            config.oauth_base_url.clone(),
            config.client_id.clone(),
            config.client_secret.clone(),
        ))
    }

    pub fn with_http(
        http: ClientWithMiddleware,
        base_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: Option<String>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client_id: client_id.into(),
            client_secret,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }
}

#[async_trait]
impl OAuthApi for OAuthClient {
    async fn request_device_code(&self, scopes: &[String]) -> Result<PendingDeviceAuth> {
        let scopes = scopes.join(" ");
        let params = [("client_id", self.client_id.as_str()), ("scopes", scopes.as_str())];

        let response = self.http.post(self.url("device")).form(&params).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TwitchError::Http {
                status: status.as_u16(),
                message: format!("device code request failed: {}", error_message(&body)),
            });
        }

        let body: DeviceCodeResponse = response.json().await?;
        debug!("Device code issued, expires in {}s", body.expires_in);
        Ok(PendingDeviceAuth {
            device_code: body.device_code,
            user_code: body.user_code,
            verification_uri: body.verification_uri,
            interval: Duration::from_secs(body.interval),
            expires_at: Utc::now() + chrono::Duration::seconds(body.expires_in as i64),
        })
    }

    async fn poll_device_token(&self, device_code: &str, scopes: &[String]) -> Result<DevicePoll> {
        let scopes = scopes.join(" ");
        let params = [
            ("client_id", self.client_id.as_str()),
            ("scopes", scopes.as_str()),
            ("device_code", device_code),
            ("grant_type", DEVICE_GRANT_TYPE),
        ];

        let response = self.http.post(self.url("token")).form(&params).send().await?;
        let status = response.status();
        if status.is_success() {
            let body: TokenResponse = response.json().await?;
            return Ok(DevicePoll::Granted(body.into_grant()));
        }

        let body = response.text().await.unwrap_or_default();
        let message = error_message(&body);
        let lowered = message.to_ascii_lowercase();
        if lowered.contains("authorization_pending") {
            Ok(DevicePoll::Pending)
        } else if lowered.contains("slow_down") {
            Ok(DevicePoll::SlowDown)
        } else if lowered.contains("denied") {
            Ok(DevicePoll::Denied)
        } else if lowered.contains("invalid device code") || lowered.contains("expired") {
            Ok(DevicePoll::Expired)
        } else {
            Err(TwitchError::Http {
                status: status.as_u16(),
                message,
            })
        }
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<RefreshOutcome> {
        let mut params = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.client_id.as_str()),
        ];
        if let Some(secret) = &self.client_secret {
            params.push(("client_secret", secret.as_str()));
        }

        let response = self.http.post(self.url("token")).form(&params).send().await?;
        let status = response.status();
        if status.is_success() {
            let body: TokenResponse = response.json().await?;
            return Ok(RefreshOutcome::Granted(body.into_grant()));
        }

        let body = response.text().await.unwrap_or_default();
        let message = error_message(&body);
        match status {
            StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED => {
                warn!("Refresh token rejected: {}", message);
                Ok(RefreshOutcome::Invalid(message))
            }
            _ => Err(TwitchError::Http {
                status: status.as_u16(),
                message,
            }),
        }
    }

    async fn validate_token(&self, access_token: &str) -> Result<Option<TokenInfo>> {
        let response = self
            .http
            .get(self.url("validate"))
            .header("Authorization", format!("OAuth {}", access_token))
            .send()
            .await?;

        match response.status() {
            StatusCode::UNAUTHORIZED => Ok(None),
            status if status.is_success() => Ok(Some(response.json().await?)),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(TwitchError::Http {
                    status: status.as_u16(),
                    message: error_message(&body),
                })
            }
        }
    }

    async fn revoke_token(&self, token: &str) -> Result<()> {
        let params = [("client_id", self.client_id.as_str()), ("token", token)];
        let response = self.http.post(self.url("revoke")).form(&params).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(TwitchError::Http {
            status: status.as_u16(),
            message: error_message(&body),
        })
    }
}
