use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use url::Url;

use crate::error::{Result, TwitchError};

pub const DEFAULT_GATEWAY_URL: &str = "wss://eventsub.wss.twitch.tv/ws";
pub const DEFAULT_API_BASE_URL: &str = "https://api.twitch.tv/helix";
pub const DEFAULT_OAUTH_BASE_URL: &str = "https://id.twitch.tv/oauth2";

const CONFIG_FILE_PATH: &str = "twitchify.toml";

/// Range accepted by the gateway for `keepalive_timeout_seconds`.
const KEEPALIVE_RANGE: std::ops::RangeInclusive<u64> = 10..=600;

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Application client id registered with the platform
    #[serde(default)]
    pub client_id: String,
    /// Client secret, only needed for confidential refresh
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    /// Scopes requested by the device flow
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default = "default_gateway_url")]
    pub gateway_url: String,
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_oauth_base_url")]
    pub oauth_base_url: String,
    /// Keepalive override sent to the gateway (seconds)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keepalive_timeout_secs: Option<u64>,
    /// Slack added on top of the server keepalive before a connection is declared dead
    #[serde(default = "default_keepalive_grace")]
    pub keepalive_grace_ms: u64,
    /// How long to wait for the welcome frame after connecting
    #[serde(default = "default_welcome_timeout")]
    pub welcome_timeout_secs: u64,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    /// Subscription cost ceiling enforced locally
    #[serde(default = "default_subscription_budget")]
    pub subscription_budget: u32,
    /// Fraction of the server-reported max cost that triggers a warning
    #[serde(default = "default_cost_warning_ratio")]
    pub cost_warning_ratio: f64,
    #[serde(default = "default_token_refresh_interval")]
    pub token_refresh_interval_secs: u64,
    /// Refresh when the grant expires within this window
    #[serde(default = "default_token_refresh_margin")]
    pub token_refresh_margin_secs: u64,
    /// Upper bound for callers waiting on an in-progress refresh
    #[serde(default = "default_token_wait_timeout")]
    pub token_wait_timeout_ms: u64,
    /// Surface raw inbound frames to observers
    #[serde(default)]
    pub socket_debug: bool,
}

fn default_gateway_url() -> String {
    DEFAULT_GATEWAY_URL.to_string()
}

fn default_api_base_url() -> String {
    DEFAULT_API_BASE_URL.to_string()
}

fn default_oauth_base_url() -> String {
    DEFAULT_OAUTH_BASE_URL.to_string()
}

fn default_keepalive_grace() -> u64 {
    500
}

fn default_welcome_timeout() -> u64 {
    35
}

fn default_subscription_budget() -> u32 {
    10
}

fn default_cost_warning_ratio() -> f64 {
    0.85
}

fn default_token_refresh_interval() -> u64 {
    3300 // 55 minutes
}

fn default_token_refresh_margin() -> u64 {
    300
}

fn default_token_wait_timeout() -> u64 {
    10000
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: None,
            scopes: Vec::new(),
            gateway_url: default_gateway_url(),
            api_base_url: default_api_base_url(),
            oauth_base_url: default_oauth_base_url(),
            keepalive_timeout_secs: None,
            keepalive_grace_ms: default_keepalive_grace(),
            welcome_timeout_secs: default_welcome_timeout(),
            reconnect: ReconnectConfig::default(),
            subscription_budget: default_subscription_budget(),
            cost_warning_ratio: default_cost_warning_ratio(),
            token_refresh_interval_secs: default_token_refresh_interval(),
            token_refresh_margin_secs: default_token_refresh_margin(),
            token_wait_timeout_ms: default_token_wait_timeout(),
            socket_debug: false,
        }
    }
}

/// Reconnection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
    /// 0 = unlimited
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Attempt counter resets after this long without a failure
    #[serde(default = "default_reset_after")]
    pub reset_after_secs: u64,
}

fn default_initial_backoff() -> u64 {
    1000
}

fn default_max_backoff() -> u64 {
    180_000
}

fn default_max_attempts() -> u32 {
    10
}

fn default_reset_after() -> u64 {
    300
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            max_attempts: default_max_attempts(),
            reset_after_secs: default_reset_after(),
        }
    }
}

fn parse_bool_env(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "y" | "on"
    )
}

impl ClientConfig {
    /// Load from `path` (or `twitchify.toml` in the working directory when it
    /// exists), then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.unwrap_or_else(|| Path::new(CONFIG_FILE_PATH));
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str::<ClientConfig>(&content)?
        } else {
            ClientConfig::default()
        };

        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a variable lookup. Unparseable numbers are ignored.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(client_id) = lookup("TWITCH_CLIENT_ID") {
            self.client_id = client_id;
        }
        if let Some(secret) = lookup("TWITCH_CLIENT_SECRET") {
            self.client_secret = Some(secret);
        }
        if let Some(url) = lookup("TWITCH_GATEWAY_URL") {
            self.gateway_url = url;
        }
        if let Some(url) = lookup("TWITCH_API_BASE") {
            self.api_base_url = url;
        }
        if let Some(url) = lookup("TWITCH_OAUTH_BASE") {
            self.oauth_base_url = url;
        }
        if let Some(secs) = lookup("TWITCH_KEEPALIVE_TIMEOUT").and_then(|v| v.trim().parse().ok()) {
            self.keepalive_timeout_secs = Some(secs);
        }
        if let Some(budget) = lookup("TWITCH_SUBSCRIPTION_BUDGET").and_then(|v| v.trim().parse().ok()) {
            self.subscription_budget = budget;
        }
        if let Some(debug) = lookup("TWITCH_SOCKET_DEBUG") {
            self.socket_debug = parse_bool_env(&debug);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.client_id.trim().is_empty() {
            return Err(TwitchError::InvalidConfig("client_id is required".into()));
        }
        if let Some(secs) = self.keepalive_timeout_secs {
            if !KEEPALIVE_RANGE.contains(&secs) {
                return Err(TwitchError::InvalidConfig(format!(
                    "keepalive_timeout_secs must be between {} and {}, got {}",
                    KEEPALIVE_RANGE.start(),
                    KEEPALIVE_RANGE.end(),
                    secs
                )));
            }
        }
        if self.subscription_budget == 0 {
            return Err(TwitchError::InvalidConfig(
                "subscription_budget must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Gateway URL with the keepalive override applied as a query parameter.
    pub fn gateway_endpoint(&self) -> Result<String> {
        let mut url = Url::parse(&self.gateway_url)
            .map_err(|e| TwitchError::InvalidConfig(format!("gateway_url: {}", e)))?;
        if let Some(secs) = self.keepalive_timeout_secs {
            let retained: Vec<(String, String)> = url
                .query_pairs()
                .filter(|(k, _)| k != "keepalive_timeout_seconds")
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect();
            url.query_pairs_mut()
                .clear()
                .extend_pairs(retained)
                .append_pair("keepalive_timeout_seconds", &secs.to_string());
        }
        Ok(url.to_string())
    }

    pub fn keepalive_grace(&self) -> Duration {
        Duration::from_millis(self.keepalive_grace_ms)
    }

    pub fn welcome_timeout(&self) -> Duration {
        Duration::from_secs(self.welcome_timeout_secs)
    }

    pub fn token_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.token_refresh_interval_secs)
    }

    pub fn token_refresh_margin(&self) -> Duration {
        Duration::from_secs(self.token_refresh_margin_secs)
    }

    pub fn token_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.token_wait_timeout_ms)
    }
}
