use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, timeout_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use twitch_core::{
    AuthGrant, ClientConfig, ClientEvent, ExponentialBackoff, OAuthApi, ObserverBus,
    RefreshOutcome, Result, TokenSource, TwitchError,
};

use crate::store::TokenStore;

const REFRESH_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenStatus {
    /// No grant installed yet.
    Unauthenticated,
    Valid,
    Refreshing,
    /// Credentials are permanently invalid. Terminal.
    Failed(String),
}

/// Owner of the current grant.
///
/// Readers get a copy of the access token; a refresh runs under a single
/// lock so concurrent callers share one refresh round-trip.
pub struct TokenAuthority {
    oauth: Arc<dyn OAuthApi>,
    grant: RwLock<Option<AuthGrant>>,
    status: watch::Sender<TokenStatus>,
    refresh_lock: Mutex<()>,
    refresh_interval: Duration,
    refresh_margin: Duration,
    wait_timeout: Duration,
    retry_base: Duration,
    store: Option<TokenStore>,
    events: ObserverBus,
}

impl TokenAuthority {
    pub fn new(oauth: Arc<dyn OAuthApi>, config: &ClientConfig) -> Self {
        let (status, _) = watch::channel(TokenStatus::Unauthenticated);
        Self {
            oauth,
            grant: RwLock::new(None),
            status,
            refresh_lock: Mutex::new(()),
            refresh_interval: config.token_refresh_interval(),
            refresh_margin: config.token_refresh_margin(),
            wait_timeout: config.token_wait_timeout(),
            retry_base: Duration::from_secs(1),
            store: None,
            events: ObserverBus::detached(),
        }
    }

    pub fn with_store(mut self, store: TokenStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_event_channel(mut self, events: ObserverBus) -> Self {
        self.events = events;
        self
    }

    pub fn status(&self) -> TokenStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<TokenStatus> {
        self.status.subscribe()
    }

    /// Copy of the current grant.
    pub fn grant(&self) -> Option<AuthGrant> {
        self.grant.read().clone()
    }

    /// Install a grant obtained elsewhere (device flow, token file).
    pub fn install(&self, grant: AuthGrant) {
        info!(
            "Installed grant for user {}",
            grant.user_id.as_deref().unwrap_or("<unknown>")
        );
        self.persist(&grant);
        let user_id = grant.user_id.clone();
        *self.grant.write() = Some(grant);
        self.status.send_replace(TokenStatus::Valid);
        self.events.emit(ClientEvent::AuthGranted { user_id });
    }

    /// Validate `grant` to learn its owner and lifetime, refreshing it first
    /// when the server no longer accepts it.
    pub async fn authenticate(&self, mut grant: AuthGrant) -> Result<()> {
        if let Some(info) = self.oauth.validate_token(&grant.access_token).await? {
            grant.apply_validation(&info);
            self.install(grant);
            return Ok(());
        }

        if grant.refresh_token.is_none() {
            return Err(self.fail("token rejected and no refresh token is available"));
        }

        debug!("Stored token rejected, refreshing");
        *self.grant.write() = Some(grant);
        self.status.send_replace(TokenStatus::Valid);
        let token = self.refresh().await?;

        match self.oauth.validate_token(&token).await? {
            Some(info) => {
                self.update_grant(&token, |g| g.apply_validation(&info));
                let user_id = self.grant().and_then(|g| g.user_id);
                self.events.emit(ClientEvent::AuthGranted { user_id });
                Ok(())
            }
            None => Err(self.fail("refreshed token was rejected")),
        }
    }

    /// The current access token.
    ///
    /// Waits while a refresh is in progress or no grant is installed yet, but
    /// never longer than the configured wait window.
    pub async fn current_token(&self) -> Result<String> {
        let deadline = Instant::now() + self.wait_timeout;
        let mut rx = self.status.subscribe();

        loop {
            let status = rx.borrow_and_update().clone();
            match status {
                TokenStatus::Failed(reason) => return Err(TwitchError::Authorization(reason)),
                TokenStatus::Valid => match self.grant() {
                    Some(grant) if !grant.is_expired() => return Ok(grant.access_token),
                    Some(_) => {
                        return match timeout_at(deadline, self.refresh()).await {
                            Ok(result) => result,
                            Err(_) => Err(self.wait_elapsed()),
                        };
                    }
                    None => {}
                },
                TokenStatus::Refreshing | TokenStatus::Unauthenticated => {}
            }

            match timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return Err(TwitchError::Fatal("token authority dropped".into())),
                Err(_) => return Err(self.wait_elapsed()),
            }
        }
    }

    /// Exchange the refresh token for a new grant.
    ///
    /// Transient failures are retried with backoff. A rejected refresh token
    /// moves the authority to the terminal `Failed` state.
    pub async fn refresh(&self) -> Result<String> {
        let observed = self.grant().map(|g| g.access_token);
        let _guard = self.refresh_lock.lock().await;

        if let TokenStatus::Failed(reason) = self.status() {
            return Err(TwitchError::Authorization(reason));
        }
        if let Some(grant) = self.grant() {
            if Some(&grant.access_token) != observed.as_ref() && !grant.is_expired() {
                debug!("Token was refreshed while waiting, reusing it");
                return Ok(grant.access_token);
            }
        }

        let Some(refresh_token) = self.grant().and_then(|g| g.refresh_token) else {
            return Err(self.fail("no refresh token available"));
        };

        self.status.send_replace(TokenStatus::Refreshing);
        let mut backoff = ExponentialBackoff::new(self.retry_base, self.retry_base * 30)
            .with_max_attempts(REFRESH_ATTEMPTS);

        loop {
            match self.oauth.refresh_token(&refresh_token).await {
                Ok(RefreshOutcome::Granted(mut fresh)) => {
                    if let Some(previous) = self.grant() {
                        fresh.user_id = fresh.user_id.or(previous.user_id);
                        fresh.login = fresh.login.or(previous.login);
                        if fresh.refresh_token.is_none() {
                            fresh.refresh_token = previous.refresh_token;
                        }
                    }
                    let token = fresh.access_token.clone();
                    let expires_at = fresh.expires_at;
                    self.persist(&fresh);
                    *self.grant.write() = Some(fresh);
                    self.status.send_replace(TokenStatus::Valid);
                    info!("Access token refreshed, expires at {}", expires_at);
                    self.events.emit(ClientEvent::TokenRefreshed { expires_at });
                    return Ok(token);
                }
                Ok(RefreshOutcome::Invalid(reason)) => {
                    return Err(self.fail(&format!("refresh token rejected: {}", reason)));
                }
                Err(e) if e.is_transient() => match backoff.next_delay() {
                    Some(delay) => {
                        warn!("Token refresh failed ({}), retrying in {:?}", e, delay);
                        sleep(delay).await;
                    }
                    None => {
                        self.status.send_replace(TokenStatus::Valid);
                        return Err(e);
                    }
                },
                Err(e) => {
                    self.status.send_replace(TokenStatus::Valid);
                    return Err(e);
                }
            }
        }
    }

    /// Re-validate the current token and refresh it when it is rejected or
    /// about to expire.
    pub async fn revalidate(&self) -> Result<()> {
        if let TokenStatus::Failed(reason) = self.status() {
            return Err(TwitchError::Authorization(reason));
        }
        let Some(grant) = self.grant() else {
            return Ok(());
        };

        match self.oauth.validate_token(&grant.access_token).await? {
            Some(info) => {
                self.update_grant(&grant.access_token, |g| g.apply_validation(&info));
                debug!("Token validated, expires in {}s", info.expires_in);
                let due = self
                    .grant()
                    .map(|g| g.expires_within(self.refresh_margin) && g.refresh_token.is_some())
                    .unwrap_or(false);
                if due {
                    self.refresh().await?;
                }
            }
            None => {
                warn!("Token no longer valid, refreshing");
                self.refresh().await?;
            }
        }
        Ok(())
    }

    /// Periodic validate-and-refresh loop. Ends on cancellation or once the
    /// credentials become permanently invalid.
    pub fn spawn_refresh_cycle(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let authority = Arc::clone(self);
        tokio::spawn(async move {
            let period = authority.refresh_interval;
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                match authority.revalidate().await {
                    Ok(()) => {}
                    Err(e) if e.is_authorization() => {
                        error!("Token refresh cycle stopped: {}", e);
                        break;
                    }
                    Err(e) => warn!("Token refresh cycle error: {}", e),
                }
            }
            debug!("Token refresh cycle finished");
        })
    }

    fn update_grant<F>(&self, access_token: &str, apply: F)
    where
        F: FnOnce(&mut AuthGrant),
    {
        let updated = {
            let mut guard = self.grant.write();
            match guard.as_mut() {
                Some(grant) if grant.access_token == access_token => {
                    apply(grant);
                    Some(grant.clone())
                }
                _ => None,
            }
        };
        if let Some(grant) = updated {
            self.persist(&grant);
        }
    }

    fn fail(&self, reason: &str) -> TwitchError {
        error!("Credentials unusable: {}", reason);
        if let Some(grant) = self.grant.write().as_mut() {
            grant.refresh_token = None;
        }
        self.status.send_replace(TokenStatus::Failed(reason.to_string()));
        let error = TwitchError::Authorization(reason.to_string());
        self.events.emit(ClientEvent::error("token", error.clone(), None));
        error
    }

    fn wait_elapsed(&self) -> TwitchError {
        TwitchError::Timeout(format!("no usable token within {:?}", self.wait_timeout))
    }

    fn persist(&self, grant: &AuthGrant) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save(grant) {
                warn!("Failed to persist token: {}", e);
            }
        }
    }
}

#[async_trait]
impl TokenSource for TokenAuthority {
    async fn access_token(&self) -> Result<String> {
        self.current_token().await
    }

    async fn on_unauthorized(&self) -> Result<String> {
        self.refresh().await
    }

    async fn user_id(&self) -> Option<String> {
        self.grant.read().as_ref().and_then(|g| g.user_id.clone())
    }
}
