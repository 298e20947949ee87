use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware, RequestBuilder};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::api::{HelixApi, TokenSource};
use crate::config::ClientConfig;
use crate::error::{AdmissionError, Result, TwitchError};
use crate::types::{ChannelInfo, CreateSubscriptionRequest, CreatedSubscription, StreamInfo};

pub const USER_AGENT: &str = concat!("twitchify/", env!("CARGO_PKG_VERSION"));

/// HTTP client with transient-failure retries (5xx, connection errors).
pub fn build_retry_client(max_retries: u32) -> Result<ClientWithMiddleware> {
    let client = Client::builder()
        .user_agent(USER_AGENT)
        .timeout(Duration::from_secs(30))
        .build()?;

    let retry_policy = ExponentialBackoff::builder()
        .retry_bounds(Duration::from_millis(100), Duration::from_secs(5))
        .build_with_max_retries(max_retries);

    Ok(ClientBuilder::new(client)
        .with(RetryTransientMiddleware::new_with_policy(retry_policy))
        .build())
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: String,
    #[serde(default)]
    message: String,
}

/// Human-readable message from a platform error body, falling back to the raw text.
pub fn error_message(body: &str) -> String {
    match serde_json::from_str::<ErrorBody>(body) {
        Ok(parsed) if !parsed.message.is_empty() => parsed.message,
        Ok(parsed) if !parsed.error.is_empty() => parsed.error,
        _ => body.trim().to_string(),
    }
}

#[derive(Debug, Deserialize)]
struct DataEnvelope<T> {
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct SubscriptionData {
    id: String,
    status: String,
    #[serde(default)]
    cost: u32,
}

#[derive(Debug, Deserialize)]
struct CreateSubscriptionResponse {
    data: Vec<SubscriptionData>,
    #[serde(default)]
    total_cost: u32,
    #[serde(default)]
    max_total_cost: u32,
}

/// Helix resource client. Every request carries the client id and a bearer
/// token; a 401 asks the token source to refresh and is retried once.
pub struct HelixClient {
    http: ClientWithMiddleware,
    base_url: String,
    client_id: String,
    tokens: Arc<dyn TokenSource>,
}

impl HelixClient {
    pub fn new(config: &ClientConfig, tokens: Arc<dyn TokenSource>) -> Result<Self> {
        Ok(Self::with_http(
            build_retry_client(3)?,
            config.api_base_url.clone(),
            config.client_id.clone(),
            tokens,
        ))
    }

    pub fn with_http(
        http: ClientWithMiddleware,
        base_url: impl Into<String>,
        client_id: impl Into<String>,
        tokens: Arc<dyn TokenSource>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client_id: client_id.into(),
            tokens,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn send_authorized<F>(&self, build: F) -> Result<reqwest::Response>
    where
        F: Fn(&ClientWithMiddleware) -> RequestBuilder,
    {
        let token = self.tokens.access_token().await?;
        let response = build(&self.http)
            .bearer_auth(&token)
            .header("Client-Id", &self.client_id)
            .send()
            .await?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        warn!("Helix rejected the access token, refreshing once");
        let token = self.tokens.on_unauthorized().await?;
        let response = build(&self.http)
            .bearer_auth(&token)
            .header("Client-Id", &self.client_id)
            .send()
            .await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            let body = response.text().await.unwrap_or_default();
            return Err(TwitchError::Authorization(error_message(&body)));
        }
        Ok(response)
    }

    async fn failure(response: reqwest::Response) -> TwitchError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        TwitchError::Http {
            status: status.as_u16(),
            message: error_message(&body),
        }
    }
}

#[async_trait]
impl HelixApi for HelixClient {
    async fn create_subscription(
        &self,
        request: &CreateSubscriptionRequest,
    ) -> Result<CreatedSubscription> {
        let url = self.url("eventsub/subscriptions");
        let response = self
            .send_authorized(|http| http.post(&url).json(request))
            .await?;

        let status = response.status();
        if status.is_success() {
            let body: CreateSubscriptionResponse = response.json().await?;
            let data = body.data.into_iter().next().ok_or_else(|| {
                TwitchError::Protocol("subscription response carried no data".into())
            })?;
            debug!(
                "Created subscription {} ({}) cost={} total={}/{}",
                data.id, request.subscription_type, data.cost, body.total_cost, body.max_total_cost
            );
            return Ok(CreatedSubscription {
                id: data.id,
                status: data.status,
                cost: data.cost,
                total_cost: body.total_cost,
                max_total_cost: body.max_total_cost,
            });
        }

        let body = response.text().await.unwrap_or_default();
        let message = error_message(&body);
        Err(match status {
            StatusCode::CONFLICT => AdmissionError::AlreadyExists(message).into(),
            StatusCode::FORBIDDEN => AdmissionError::Forbidden(message).into(),
            StatusCode::TOO_MANY_REQUESTS if message.to_ascii_lowercase().contains("cost") => {
                AdmissionError::CostExceeded(message).into()
            }
            _ => TwitchError::Http {
                status: status.as_u16(),
                message,
            },
        })
    }

    async fn delete_subscription(&self, id: &str) -> Result<()> {
        let url = self.url("eventsub/subscriptions");
        let response = self
            .send_authorized(|http| http.delete(&url).query(&[("id", id)]))
            .await?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => {
                debug!("Subscription {} already gone", id);
                Ok(())
            }
            _ => Err(Self::failure(response).await),
        }
    }

    async fn get_channel(&self, broadcaster_id: &str) -> Result<ChannelInfo> {
        let url = self.url("channels");
        let response = self
            .send_authorized(|http| http.get(&url).query(&[("broadcaster_id", broadcaster_id)]))
            .await?;
        if !response.status().is_success() {
            return Err(Self::failure(response).await);
        }

        let body: DataEnvelope<ChannelInfo> = response.json().await?;
        body.data
            .into_iter()
            .next()
            .ok_or_else(|| TwitchError::NotFound(format!("channel {}", broadcaster_id)))
    }

    async fn get_stream(&self, user_id: &str) -> Result<Option<StreamInfo>> {
        let url = self.url("streams");
        let response = self
            .send_authorized(|http| http.get(&url).query(&[("user_id", user_id)]))
            .await?;
        if !response.status().is_success() {
            return Err(Self::failure(response).await);
        }

        let body: DataEnvelope<StreamInfo> = response.json().await?;
        Ok(body.data.into_iter().next())
    }
}
