use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use twitch_core::{
    ClientConfig, ClientEvent, ExponentialBackoff, ObserverBus, Result, TokenSource, TwitchError,
};

use crate::frames::{is_fatal_close, parse_frame, Frame, Notification, SessionInfo};
use crate::registry::SubscriptionRegistry;
use crate::transport::{Connector, FrameStream, WireMessage};

/// Notification ids remembered for duplicate suppression.
const DEDUPE_WINDOW: usize = 512;
const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Connecting,
    Welcomed,
    Active,
    /// A second connection is being opened after a reconnect directive.
    Reconnecting,
    Closed,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Connecting => write!(f, "connecting"),
            SessionStatus::Welcomed => write!(f, "welcomed"),
            SessionStatus::Active => write!(f, "active"),
            SessionStatus::Reconnecting => write!(f, "reconnecting"),
            SessionStatus::Closed => write!(f, "closed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub id: String,
    pub status: SessionStatus,
    pub keepalive_timeout: Duration,
    pub last_message_at: DateTime<Utc>,
}

/// Work that has to happen once per run, after the first session is attached.
#[async_trait]
pub trait SessionHooks: Send + Sync {
    async fn on_first_session(&self, session_id: &str) -> Result<()>;
}

pub struct NoHooks;

#[async_trait]
impl SessionHooks for NoHooks {
    async fn on_first_session(&self, _session_id: &str) -> Result<()> {
        Ok(())
    }
}

enum Exit {
    Cancelled,
    Dropped(String),
}

type HandOff = BoxFuture<'static, Result<(Box<dyn FrameStream>, SessionInfo)>>;

enum Step {
    Cancel,
    HandOff(Result<(Box<dyn FrameStream>, SessionInfo)>),
    Silent,
    Message(Option<Result<WireMessage>>),
}

struct RecentIds {
    order: VecDeque<String>,
    seen: HashSet<String>,
    capacity: usize,
}

impl RecentIds {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    /// False when the id was already seen.
    fn insert(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.order.push_back(id.to_string());
        self.seen.insert(id.to_string());
        true
    }
}

/// Drives the gateway connection: welcome handshake, keepalive watchdog,
/// reconnect hand-off and retry with backoff.
pub struct SessionStateMachine {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    registry: Arc<SubscriptionRegistry>,
    tokens: Arc<dyn TokenSource>,
    hooks: Arc<dyn SessionHooks>,
    notifications: mpsc::UnboundedSender<Arc<Notification>>,
    status: watch::Sender<SessionStatus>,
    ready: watch::Sender<bool>,
    current: Mutex<Option<Session>>,
    events: ObserverBus,
}

impl SessionStateMachine {
    pub fn new(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        registry: Arc<SubscriptionRegistry>,
        tokens: Arc<dyn TokenSource>,
        notifications: mpsc::UnboundedSender<Arc<Notification>>,
    ) -> Self {
        let (status, _) = watch::channel(SessionStatus::Closed);
        let (ready, _) = watch::channel(false);
        Self {
            config,
            connector,
            registry,
            tokens,
            hooks: Arc::new(NoHooks),
            notifications,
            status,
            ready,
            current: Mutex::new(None),
            events: ObserverBus::detached(),
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn SessionHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_event_channel(mut self, events: ObserverBus) -> Self {
        self.events = events;
        self
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    pub fn session(&self) -> Option<Session> {
        self.current.lock().clone()
    }

    /// Wait until the first session of the current run is active.
    pub async fn wait_until_ready(&self, limit: Duration) -> Result<()> {
        let mut rx = self.ready.subscribe();
        let waited = timeout(limit, rx.wait_for(|ready| *ready))
            .await
            .map(|ready| ready.map(|_| ()));
        match waited {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(TwitchError::Fatal("session dropped".into())),
            Err(_) => Err(TwitchError::Timeout(format!(
                "session not ready within {:?}",
                limit
            ))),
        }
    }

    /// Run until cancelled or a fatal error. Dropped connections are retried
    /// with backoff; a fatal close, unusable credentials or exhausted retries
    /// end the run with an error.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let mut backoff = ExponentialBackoff::from_config(&self.config.reconnect);
        let mut ready = false;
        self.ready.send_replace(false);
        self.set_status(SessionStatus::Connecting);

        let outcome = loop {
            let url = match self.config.gateway_endpoint() {
                Ok(url) => url,
                Err(e) => break Err(e),
            };

            let served = self
                .connect_and_serve(&url, &cancel, &mut backoff, &mut ready)
                .await;
            let reason = match served {
                Ok(Exit::Cancelled) => break Ok(()),
                Ok(Exit::Dropped(reason)) => reason,
                Err(e) if is_terminal(&e) => break Err(e),
                Err(e) => e.to_string(),
            };

            *self.current.lock() = None;
            self.set_status(SessionStatus::Connecting);

            let Some(delay) = backoff.next_delay() else {
                self.events.emit(ClientEvent::Disconnected {
                    reason: reason.clone(),
                    will_retry: false,
                });
                break Err(TwitchError::Fatal(format!(
                    "giving up after {} reconnect attempts: {}",
                    backoff.attempts(),
                    reason
                )));
            };
            warn!("Connection lost ({}), reconnecting in {:?}", reason, delay);
            self.events.emit(ClientEvent::Disconnected {
                reason,
                will_retry: true,
            });

            tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                _ = sleep(delay) => {}
            }
        };

        *self.current.lock() = None;
        self.set_status(SessionStatus::Closed);
        self.ready.send_replace(false);
        let dropped = self.registry.retire_session();
        match &outcome {
            Ok(()) => info!("Session closed, {} subscriptions dropped", dropped),
            Err(e) => {
                error!("Session terminated: {}", e);
                self.events
                    .emit(ClientEvent::error("session", e.clone(), None));
            }
        }
        outcome
    }

    async fn connect_and_serve(
        &self,
        url: &str,
        cancel: &CancellationToken,
        backoff: &mut ExponentialBackoff,
        ready: &mut bool,
    ) -> Result<Exit> {
        // No point opening a session the subscriptions cannot be created for.
        tokio::select! {
            _ = cancel.cancelled() => return Ok(Exit::Cancelled),
            token = self.tokens.access_token() => { token?; }
        }

        let mut stream = tokio::select! {
            _ = cancel.cancelled() => return Ok(Exit::Cancelled),
            connected = self.connector.connect(url) => connected?,
        };

        let limit = self.config.welcome_timeout();
        let raw = self.raw_observer();
        let welcomed = tokio::select! {
            _ = cancel.cancelled() => Err(TwitchError::Cancelled),
            welcomed = await_welcome(stream.as_mut(), limit, raw) => welcomed,
        };
        let session = match welcomed {
            Ok(session) => session,
            Err(TwitchError::Cancelled) => {
                stream.close().await;
                return Ok(Exit::Cancelled);
            }
            Err(e) => {
                stream.close().await;
                return Err(e);
            }
        };
        backoff.reset();

        if let Err(e) = self.activate(&session, ready).await {
            stream.close().await;
            return Err(e);
        }
        self.drive(stream, session, cancel).await
    }

    /// Welcomed → Active for a freshly connected session.
    async fn activate(&self, session: &SessionInfo, ready: &mut bool) -> Result<()> {
        self.welcome(session).await;

        if !*ready {
            self.hooks.on_first_session(&session.id).await?;
            *ready = true;
            self.ready.send_replace(true);
            self.events.emit(ClientEvent::Ready {
                session_id: session.id.clone(),
            });
        }
        self.set_status(SessionStatus::Active);
        Ok(())
    }

    /// Record the new session and move every subscription onto it.
    async fn welcome(&self, session: &SessionInfo) {
        let keepalive = self.keepalive_of(session);
        info!(
            "Session {} welcomed (keepalive {:?})",
            session.id, keepalive
        );
        *self.current.lock() = Some(Session {
            id: session.id.clone(),
            status: SessionStatus::Welcomed,
            keepalive_timeout: keepalive,
            last_message_at: Utc::now(),
        });
        self.status.send_replace(SessionStatus::Welcomed);
        self.events.emit(ClientEvent::Connected {
            session_id: session.id.clone(),
        });

        let report = self.registry.migrate_all(&session.id).await;
        if !report.is_clean() {
            warn!(
                "{} subscriptions could not be moved to session {}",
                report.failed.len(),
                session.id
            );
        }
    }

    async fn drive(
        &self,
        mut stream: Box<dyn FrameStream>,
        session: SessionInfo,
        cancel: &CancellationToken,
    ) -> Result<Exit> {
        let grace = self.config.keepalive_grace();
        let mut keepalive = self.keepalive_of(&session);
        let mut deadline = Instant::now() + keepalive + grace;
        let mut handoff: Option<HandOff> = None;
        let mut recent = RecentIds::new(DEDUPE_WINDOW);

        loop {
            let step = tokio::select! {
                biased;
                _ = cancel.cancelled() => Step::Cancel,
                handed = async {
                    match handoff.as_mut() {
                        Some(pending) => pending.await,
                        None => std::future::pending().await,
                    }
                }, if handoff.is_some() => Step::HandOff(handed),
                _ = sleep_until(deadline) => Step::Silent,
                message = stream.next_message() => Step::Message(message),
            };

            let ended = match step {
                Step::Cancel => {
                    stream.close().await;
                    return Ok(Exit::Cancelled);
                }
                Step::HandOff(handed) => {
                    handoff = None;
                    match handed {
                        Ok((next, info)) => {
                            self.welcome(&info).await;
                            stream.close().await;
                            stream = next;
                            keepalive = self.keepalive_of(&info);
                            deadline = Instant::now() + keepalive + grace;
                            self.set_status(SessionStatus::Active);
                            info!("Reconnect hand-off to session {} complete", info.id);
                            continue;
                        }
                        Err(e) => {
                            stream.close().await;
                            return Ok(Exit::Dropped(format!("reconnect hand-off failed: {}", e)));
                        }
                    }
                }
                Step::Silent => {
                    warn!(
                        "No message within {:?}, treating connection as dead",
                        keepalive + grace
                    );
                    stream.close().await;
                    if handoff.is_none() {
                        return Ok(Exit::Dropped("keepalive timeout".into()));
                    }
                    "keepalive timeout".to_string()
                }
                Step::Message(None) => "connection closed by peer".to_string(),
                Step::Message(Some(Err(e))) => e.to_string(),
                Step::Message(Some(Ok(WireMessage::Closed { code, reason }))) => {
                    if is_fatal_close(code, &reason) {
                        return Err(close_error(code, &reason));
                    }
                    format!("closed by server ({:?}): {}", code, reason)
                }
                Step::Message(Some(Ok(WireMessage::Text(text)))) => {
                    self.touch();
                    if let Some(observer) = self.raw_observer() {
                        observer.emit(ClientEvent::RawFrame { text: text.clone() });
                    }
                    let frame = match parse_frame(&text) {
                        Ok(frame) => frame,
                        Err(e) => {
                            warn!("Dropping connection after bad frame: {}", e);
                            stream.close().await;
                            return Ok(Exit::Dropped(e.to_string()));
                        }
                    };

                    match frame {
                        Frame::Welcome { .. } => {
                            warn!("Ignoring welcome on an established session")
                        }
                        Frame::Keepalive { .. } => debug!("Keepalive"),
                        Frame::Notification(notification) => {
                            if recent.insert(&notification.message_id) {
                                if self.notifications.send(Arc::new(notification)).is_err() {
                                    debug!("Dispatcher gone, dropping notification");
                                }
                            } else {
                                debug!("Duplicate message {}", notification.message_id);
                            }
                        }
                        Frame::Reconnect { session, .. } => {
                            if let (None, Some(url)) = (&handoff, session.reconnect_url) {
                                info!("Server requested reconnect to {}", url);
                                self.set_status(SessionStatus::Reconnecting);
                                handoff = Some(self.open_handoff(url));
                            }
                        }
                        Frame::Revocation { subscription, .. } => {
                            self.registry.mark_revoked(&subscription.id, &subscription.status);
                        }
                        Frame::Close(notice) => {
                            if notice.is_fatal() {
                                return Err(close_error(notice.code, &notice.reason));
                            }
                            stream.close().await;
                            return Ok(Exit::Dropped(format!("session closed: {}", notice.reason)));
                        }
                    }
                    deadline = Instant::now() + keepalive + grace;
                    continue;
                }
            };

            // The old connection ended. A pending hand-off can still take over.
            let Some(pending) = handoff.take() else {
                return Ok(Exit::Dropped(ended));
            };
            debug!("Connection ended during hand-off ({}), waiting for new session", ended);
            let handed = tokio::select! {
                _ = cancel.cancelled() => return Ok(Exit::Cancelled),
                handed = pending => handed,
            };
            match handed {
                Ok((next, info)) => {
                    self.welcome(&info).await;
                    stream = next;
                    keepalive = self.keepalive_of(&info);
                    deadline = Instant::now() + keepalive + grace;
                    self.set_status(SessionStatus::Active);
                }
                Err(e) => {
                    return Ok(Exit::Dropped(format!("reconnect hand-off failed: {}", e)));
                }
            }
        }
    }

    fn open_handoff(&self, url: String) -> HandOff {
        let connector = self.connector.clone();
        let welcome_timeout = self.config.welcome_timeout();
        let observer = self.raw_observer();
        Box::pin(async move {
            let mut stream = connector.connect(&url).await?;
            match await_welcome(stream.as_mut(), welcome_timeout, observer).await {
                Ok(info) => Ok((stream, info)),
                Err(e) => {
                    stream.close().await;
                    Err(e)
                }
            }
        })
    }

    fn keepalive_of(&self, session: &SessionInfo) -> Duration {
        session
            .keepalive_timeout_seconds
            .or(self.config.keepalive_timeout_secs)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_KEEPALIVE)
    }

    fn raw_observer(&self) -> Option<ObserverBus> {
        self.config.socket_debug.then(|| self.events.clone())
    }

    fn touch(&self) {
        if let Some(session) = self.current.lock().as_mut() {
            session.last_message_at = Utc::now();
        }
    }

    fn set_status(&self, status: SessionStatus) {
        if let Some(session) = self.current.lock().as_mut() {
            session.status = status;
        }
        self.status.send_replace(status);
    }
}

/// The first frame on a connection must be a welcome.
async fn await_welcome(
    stream: &mut dyn FrameStream,
    limit: Duration,
    raw: Option<ObserverBus>,
) -> Result<SessionInfo> {
    let message = match timeout(limit, stream.next_message()).await {
        Ok(message) => message,
        Err(_) => {
            return Err(TwitchError::Protocol(format!(
                "no welcome within {:?}",
                limit
            )))
        }
    };

    match message {
        None => Err(TwitchError::Transport("connection closed before welcome".into())),
        Some(Err(e)) => Err(e),
        Some(Ok(WireMessage::Closed { code, reason })) => Err(close_error(code, &reason)),
        Some(Ok(WireMessage::Text(text))) => {
            if let Some(observer) = raw {
                observer.emit(ClientEvent::RawFrame { text: text.clone() });
            }
            match parse_frame(&text)? {
                Frame::Welcome { session, .. } => Ok(session),
                other => Err(TwitchError::Protocol(format!(
                    "expected session_welcome, got {}",
                    other.kind()
                ))),
            }
        }
    }
}

fn close_error(code: Option<u16>, reason: &str) -> TwitchError {
    if is_fatal_close(code, reason) {
        TwitchError::Fatal(format!("server closed the session ({:?}): {}", code, reason))
    } else {
        TwitchError::Transport(format!("server closed the connection ({:?}): {}", code, reason))
    }
}

fn is_terminal(error: &TwitchError) -> bool {
    error.is_fatal()
        || error.is_authorization()
        || matches!(error, TwitchError::InvalidConfig(_))
}
