use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use twitch_auth::{TokenAuthority, TokenStatus, TokenStore};
use twitch_core::{
    AuthGrant, ClientConfig, ClientEvent, DevicePoll, OAuthApi, ObserverBus, PendingDeviceAuth,
    RefreshOutcome, Result, TokenInfo, TokenSource, TwitchError,
};

#[derive(Default)]
struct FakeOAuth {
    refresh_calls: AtomicUsize,
    validate_calls: AtomicUsize,
    refresh_script: Mutex<VecDeque<Result<RefreshOutcome>>>,
    refresh_delay: Duration,
    validation: Mutex<Option<TokenInfo>>,
}

impl FakeOAuth {
    fn slow(delay: Duration) -> Self {
        Self {
            refresh_delay: delay,
            ..Default::default()
        }
    }

    fn script(self, outcomes: Vec<Result<RefreshOutcome>>) -> Self {
        *self.refresh_script.lock() = outcomes.into();
        self
    }

    fn validating(self, info: TokenInfo) -> Self {
        *self.validation.lock() = Some(info);
        self
    }
}

#[async_trait]
impl OAuthApi for FakeOAuth {
    async fn request_device_code(&self, _scopes: &[String]) -> Result<PendingDeviceAuth> {
        Err(TwitchError::Protocol("not scripted".into()))
    }

    async fn poll_device_token(&self, _code: &str, _scopes: &[String]) -> Result<DevicePoll> {
        Err(TwitchError::Protocol("not scripted".into()))
    }

    async fn refresh_token(&self, _refresh_token: &str) -> Result<RefreshOutcome> {
        let n = self.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.refresh_delay.is_zero() {
            sleep(self.refresh_delay).await;
        }
        match self.refresh_script.lock().pop_front() {
            Some(outcome) => outcome,
            None => Ok(RefreshOutcome::Granted(
                AuthGrant::new(format!("fresh-{}", n), Duration::from_secs(14_400))
                    .with_refresh_token(format!("refresh-{}", n)),
            )),
        }
    }

    async fn validate_token(&self, _access_token: &str) -> Result<Option<TokenInfo>> {
        self.validate_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.validation.lock().clone())
    }

    async fn revoke_token(&self, _token: &str) -> Result<()> {
        Ok(())
    }
}

fn stale_grant() -> AuthGrant {
    AuthGrant::new("stale", Duration::from_secs(3600)).with_refresh_token("refresh-0")
}

fn token_info(expires_in: u64) -> TokenInfo {
    TokenInfo {
        client_id: "client".into(),
        login: Some("streamer".into()),
        scopes: vec!["user:read:chat".into()],
        user_id: Some("42".into()),
        expires_in,
    }
}

fn authority(oauth: Arc<FakeOAuth>) -> Arc<TokenAuthority> {
    Arc::new(TokenAuthority::new(oauth, &ClientConfig::default()))
}

#[tokio::test(start_paused = true)]
async fn concurrent_refreshes_share_one_round_trip() {
    let oauth = Arc::new(FakeOAuth::slow(Duration::from_millis(100)));
    let tokens = authority(oauth.clone());
    tokens.install(stale_grant());

    let (a, b) = tokio::join!(tokens.on_unauthorized(), tokens.on_unauthorized());

    assert_eq!(a.unwrap(), "fresh-1");
    assert_eq!(b.unwrap(), "fresh-1");
    assert_eq!(oauth.refresh_calls.load(Ordering::SeqCst), 1);
    assert_eq!(tokens.status(), TokenStatus::Valid);
}

#[tokio::test(start_paused = true)]
async fn readers_wait_for_refresh_in_progress() {
    let oauth = Arc::new(FakeOAuth::slow(Duration::from_secs(2)));
    let tokens = authority(oauth.clone());
    tokens.install(stale_grant());

    let refreshing = {
        let tokens = tokens.clone();
        tokio::spawn(async move { tokens.refresh().await })
    };
    tokio::task::yield_now().await;
    assert_eq!(tokens.status(), TokenStatus::Refreshing);

    let token = tokens.access_token().await.unwrap();
    assert_eq!(token, "fresh-1");
    assert_eq!(refreshing.await.unwrap().unwrap(), "fresh-1");
}

#[tokio::test(start_paused = true)]
async fn refreshed_grant_keeps_identity() {
    let oauth = Arc::new(FakeOAuth::default());
    let tokens = authority(oauth);
    let mut grant = stale_grant();
    grant.user_id = Some("42".into());
    grant.login = Some("streamer".into());
    tokens.install(grant);

    tokens.refresh().await.unwrap();

    let grant = tokens.grant().unwrap();
    assert_eq!(grant.access_token, "fresh-1");
    assert_eq!(grant.user_id.as_deref(), Some("42"));
    assert_eq!(grant.login.as_deref(), Some("streamer"));
    assert_eq!(tokens.user_id().await.as_deref(), Some("42"));
}

#[tokio::test(start_paused = true)]
async fn rejected_refresh_token_is_terminal() {
    let oauth = Arc::new(
        FakeOAuth::default().script(vec![Ok(RefreshOutcome::Invalid("Invalid refresh token".into()))]),
    );
    let (bus, mut events) = ObserverBus::new(16);
    let tokens = Arc::new(
        TokenAuthority::new(oauth.clone(), &ClientConfig::default()).with_event_channel(bus),
    );
    tokens.install(stale_grant());

    let err = tokens.refresh().await.unwrap_err();
    assert!(err.is_authorization());
    assert!(matches!(tokens.status(), TokenStatus::Failed(_)));

    // Terminal: no further refresh attempts, readers fail fast.
    let err = tokens.access_token().await.unwrap_err();
    assert!(err.is_authorization());
    assert!(tokens.on_unauthorized().await.is_err());
    assert_eq!(oauth.refresh_calls.load(Ordering::SeqCst), 1);

    let mut saw_error = false;
    while let Ok(event) = events.try_recv() {
        if let ClientEvent::Error { event_name, .. } = event {
            assert_eq!(event_name, "token");
            saw_error = true;
        }
    }
    assert!(saw_error);
}

#[tokio::test(start_paused = true)]
async fn waiting_for_a_token_is_bounded() {
    let tokens = authority(Arc::new(FakeOAuth::default()));
    let started = tokio::time::Instant::now();

    let err = tokens.access_token().await.unwrap_err();

    assert!(matches!(err, TwitchError::Timeout(_)));
    assert_eq!(started.elapsed(), Duration::from_millis(10_000));
}

#[tokio::test(start_paused = true)]
async fn installed_grant_releases_waiting_reader() {
    let tokens = authority(Arc::new(FakeOAuth::default()));

    let reader = {
        let tokens = tokens.clone();
        tokio::spawn(async move { tokens.access_token().await })
    };
    sleep(Duration::from_secs(1)).await;
    tokens.install(stale_grant());

    assert_eq!(reader.await.unwrap().unwrap(), "stale");
}

#[tokio::test(start_paused = true)]
async fn transient_refresh_failures_are_retried() {
    let oauth = Arc::new(FakeOAuth::default().script(vec![
        Err(TwitchError::Transport("connection reset".into())),
        Err(TwitchError::Http {
            status: 503,
            message: "unavailable".into(),
        }),
    ]));
    let tokens = authority(oauth.clone());
    tokens.install(stale_grant());

    let token = tokens.refresh().await.unwrap();

    assert_eq!(token, "fresh-3");
    assert_eq!(oauth.refresh_calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn exhausted_transient_retries_keep_current_grant() {
    let failures = (0..10)
        .map(|_| Err(TwitchError::Transport("unreachable".into())))
        .collect();
    let oauth = Arc::new(FakeOAuth::default().script(failures));
    let tokens = authority(oauth);
    tokens.install(stale_grant());

    let err = tokens.refresh().await.unwrap_err();

    assert!(err.is_transient());
    assert_eq!(tokens.status(), TokenStatus::Valid);
    assert_eq!(tokens.access_token().await.unwrap(), "stale");
}

#[tokio::test(start_paused = true)]
async fn revalidate_refreshes_grant_near_expiry() {
    let oauth = Arc::new(FakeOAuth::default().validating(token_info(120)));
    let tokens = authority(oauth.clone());
    tokens.install(stale_grant());

    tokens.revalidate().await.unwrap();

    let grant = tokens.grant().unwrap();
    assert_eq!(grant.access_token, "fresh-1");
    assert_eq!(grant.user_id.as_deref(), Some("42"));
    assert_eq!(oauth.refresh_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn revalidate_leaves_healthy_grant_alone() {
    let oauth = Arc::new(FakeOAuth::default().validating(token_info(14_000)));
    let tokens = authority(oauth.clone());
    tokens.install(stale_grant());

    tokens.revalidate().await.unwrap();

    assert_eq!(tokens.grant().unwrap().access_token, "stale");
    assert_eq!(oauth.refresh_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn authenticate_learns_identity_and_persists() {
    let dir = tempdir().unwrap();
    let store = TokenStore::new(dir.path().join("token.json"));
    let oauth = Arc::new(FakeOAuth::default().validating(token_info(14_000)));
    let tokens = TokenAuthority::new(oauth, &ClientConfig::default()).with_store(store.clone());

    tokens.authenticate(stale_grant()).await.unwrap();

    assert_eq!(tokens.status(), TokenStatus::Valid);
    let saved = store.load().unwrap().unwrap();
    assert_eq!(saved.user_id.as_deref(), Some("42"));
    assert_eq!(saved.login.as_deref(), Some("streamer"));
}

#[tokio::test(start_paused = true)]
async fn authenticate_without_refresh_token_fails_when_rejected() {
    let tokens = authority(Arc::new(FakeOAuth::default()));
    let grant = AuthGrant::new("revoked", Duration::from_secs(3600));

    let err = tokens.authenticate(grant).await.unwrap_err();

    assert!(err.is_authorization());
    assert!(matches!(tokens.status(), TokenStatus::Failed(_)));
}

#[tokio::test(start_paused = true)]
async fn refresh_cycle_validates_on_interval() {
    let oauth = Arc::new(FakeOAuth::default().validating(token_info(14_000)));
    let tokens = authority(oauth.clone());
    tokens.install(stale_grant());

    let cancel = CancellationToken::new();
    let cycle = tokens.spawn_refresh_cycle(cancel.clone());

    sleep(Duration::from_secs(3299)).await;
    assert_eq!(oauth.validate_calls.load(Ordering::SeqCst), 0);

    sleep(Duration::from_secs(2)).await;
    assert_eq!(oauth.validate_calls.load(Ordering::SeqCst), 1);

    cancel.cancel();
    cycle.await.unwrap();
}
