use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use twitch_core::{
    ClientConfig, ClientEvent, Condition, HelixApi, HelixClient, Lookups, ObserverBus, Result,
    TokenSource, TwitchError,
};

use crate::catalog::{self, DEFAULT_EVENTS};
use crate::dispatcher::{EventDispatcher, EventHandler};
use crate::frames::Notification;
use crate::registry::{Subscription, SubscriptionId, SubscriptionRegistry};
use crate::session::{Session, SessionHooks, SessionStateMachine, SessionStatus};
use crate::transport::{Connector, WsConnector};

type NotificationRx = mpsc::UnboundedReceiver<Arc<Notification>>;

#[derive(Debug, Clone)]
struct CustomEvent {
    alias: &'static str,
    target_user_id: String,
    options: Condition,
}

/// State shared between the client facade and the session bootstrap.
struct ClientInner {
    tokens: Arc<dyn TokenSource>,
    registry: Arc<SubscriptionRegistry>,
    dispatcher: Arc<EventDispatcher>,
    builtin: Mutex<BTreeSet<&'static str>>,
    custom: Mutex<Vec<CustomEvent>>,
    events: ObserverBus,
}

impl ClientInner {
    async fn subscribe_alias(
        &self,
        alias: &str,
        target_user_id: &str,
        options: &Condition,
    ) -> Result<Subscription> {
        let spec = catalog::lookup(alias)?;
        let client_user = self.tokens.user_id().await;
        let condition = spec.condition(target_user_id, client_user.as_deref(), options)?;
        self.registry
            .subscribe(spec.subscription_type, spec.version, condition, spec.cost())
            .await
    }

    fn bootstrap_events(&self) -> Vec<CustomEvent> {
        let mut aliases: BTreeSet<&'static str> = DEFAULT_EVENTS.iter().copied().collect();
        aliases.extend(self.builtin.lock().iter().copied());
        aliases
            .into_iter()
            .map(|alias| CustomEvent {
                alias,
                target_user_id: String::new(),
                options: Condition::new(),
            })
            .collect()
    }
}

#[async_trait]
impl SessionHooks for ClientInner {
    /// Subscribe the client's own events and every stored custom event.
    async fn on_first_session(&self, session_id: &str) -> Result<()> {
        let user = self.tokens.user_id().await.ok_or_else(|| {
            TwitchError::Authorization("token carries no user id, validate it first".into())
        })?;
        self.dispatcher.set_client_user(user.clone());

        let mut wanted = self.bootstrap_events();
        for own in wanted.iter_mut() {
            own.target_user_id = user.clone();
        }
        wanted.extend(self.custom.lock().iter().cloned());

        let results = join_all(wanted.iter().map(|event| {
            self.subscribe_alias(event.alias, &event.target_user_id, &event.options)
        }))
        .await;

        let mut confirmed = 0;
        for (event, result) in wanted.iter().zip(results) {
            match result {
                Ok(_) => confirmed += 1,
                Err(e) if e.is_authorization() => return Err(e),
                Err(e) => {
                    warn!(
                        "Could not subscribe {} for {}: {}",
                        event.alias, event.target_user_id, e
                    );
                    self.events.emit(ClientEvent::error(
                        event.alias,
                        e,
                        Some(event.target_user_id.clone()),
                    ));
                }
            }
        }
        info!(
            "Session {} ready with {}/{} subscriptions",
            session_id,
            confirmed,
            wanted.len()
        );
        Ok(())
    }
}

pub struct EventSubClientBuilder {
    config: ClientConfig,
    tokens: Arc<dyn TokenSource>,
    helix: Option<Arc<dyn HelixApi>>,
    connector: Option<Arc<dyn Connector>>,
    events: ObserverBus,
}

impl EventSubClientBuilder {
    pub fn new(config: ClientConfig, tokens: Arc<dyn TokenSource>) -> Self {
        Self {
            config,
            tokens,
            helix: None,
            connector: None,
            events: ObserverBus::detached(),
        }
    }

    pub fn helix(mut self, helix: Arc<dyn HelixApi>) -> Self {
        self.helix = Some(helix);
        self
    }

    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn event_channel(mut self, events: ObserverBus) -> Self {
        self.events = events;
        self
    }

    pub fn build(self) -> Result<EventSubClient> {
        self.config.validate()?;

        let helix = match self.helix {
            Some(helix) => helix,
            None => Arc::new(HelixClient::new(&self.config, self.tokens.clone())?),
        };
        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(WsConnector::default()));

        let registry = Arc::new(
            SubscriptionRegistry::from_config(helix.clone(), &self.config)
                .with_event_channel(self.events.clone()),
        );
        let dispatcher =
            Arc::new(EventDispatcher::new().with_event_channel(self.events.clone()));
        let inner = Arc::new(ClientInner {
            tokens: self.tokens.clone(),
            registry: registry.clone(),
            dispatcher,
            builtin: Mutex::new(BTreeSet::new()),
            custom: Mutex::new(Vec::new()),
            events: self.events.clone(),
        });

        let (tx, rx) = mpsc::unbounded_channel();
        let session = SessionStateMachine::new(self.config, connector, registry, self.tokens, tx)
            .with_hooks(inner.clone())
            .with_event_channel(self.events);

        Ok(EventSubClient {
            inner,
            session: Arc::new(session),
            notifications: Mutex::new(Some(rx)),
            cancel: Mutex::new(CancellationToken::new()),
            lookups: Lookups::new(helix),
        })
    }
}

/// EventSub client: one websocket session, its subscriptions and the handlers
/// notifications are routed to.
///
/// ```ignore
/// let client = EventSubClientBuilder::new(config, tokens).build()?;
/// client.on("stream_online", |n: Arc<Notification>| async move {
///     println!("{} went live", n.event_str("broadcaster_user_login").unwrap_or("?"));
///     anyhow::Ok(())
/// })?;
/// client.run().await?;
/// ```
pub struct EventSubClient {
    inner: Arc<ClientInner>,
    session: Arc<SessionStateMachine>,
    notifications: Mutex<Option<NotificationRx>>,
    cancel: Mutex<CancellationToken>,
    lookups: Lookups,
}

impl EventSubClient {
    pub fn builder(config: ClientConfig, tokens: Arc<dyn TokenSource>) -> EventSubClientBuilder {
        EventSubClientBuilder::new(config, tokens)
    }

    /// Register a handler for one of the client's own events. The event is
    /// subscribed when the next run bootstraps its first session.
    pub fn on<H>(&self, alias: &str, handler: H) -> Result<()>
    where
        H: EventHandler + 'static,
    {
        let spec = catalog::lookup(alias)?;
        self.inner
            .dispatcher
            .on(spec.subscription_type, Arc::new(handler));
        self.inner.builtin.lock().insert(spec.alias);
        Ok(())
    }

    /// Subscribe to `alias` for `target_user_id` on the current session.
    pub async fn subscribe_event(
        &self,
        alias: &str,
        target_user_id: &str,
        options: Condition,
    ) -> Result<Subscription> {
        self.inner
            .subscribe_alias(alias, target_user_id, &options)
            .await
    }

    /// Watch another user's events with a dedicated handler.
    ///
    /// Subscribes right away when a session is up, otherwise the event is
    /// subscribed once the first session is bootstrapped and `None` is
    /// returned.
    pub async fn add_custom_event<H>(
        &self,
        alias: &str,
        target_user_id: &str,
        handler: H,
        options: Condition,
    ) -> Result<Option<Subscription>>
    where
        H: EventHandler + 'static,
    {
        let spec = catalog::lookup(alias)?;
        self.inner
            .dispatcher
            .add_custom(spec.subscription_type, target_user_id, Arc::new(handler));
        self.inner.custom.lock().push(CustomEvent {
            alias: spec.alias,
            target_user_id: target_user_id.to_string(),
            options: options.clone(),
        });

        if self.inner.registry.session_id().is_none() {
            return Ok(None);
        }
        match self
            .inner
            .subscribe_alias(spec.alias, target_user_id, &options)
            .await
        {
            Ok(subscription) => Ok(Some(subscription)),
            Err(e) => {
                self.forget_custom(spec.alias, target_user_id);
                Err(e)
            }
        }
    }

    /// Drop the handlers for `(alias, target_user_id)` and unsubscribe its
    /// live subscriptions. Returns how many handlers were removed.
    pub async fn remove_custom_event(&self, alias: &str, target_user_id: &str) -> Result<usize> {
        let spec = catalog::lookup(alias)?;
        self.forget_custom(spec.alias, target_user_id);
        let removed = self
            .inner
            .dispatcher
            .remove_custom(spec.subscription_type, target_user_id);

        let targeted: Vec<SubscriptionId> = self
            .inner
            .registry
            .snapshot()
            .into_iter()
            .filter(|sub| {
                sub.subscription_type == spec.subscription_type
                    && spec
                        .target_key
                        .and_then(|key| sub.condition.get(key))
                        .is_some_and(|user| user == target_user_id)
            })
            .map(|sub| sub.id)
            .collect();
        for id in targeted {
            self.inner.registry.unsubscribe(id).await?;
        }
        Ok(removed)
    }

    fn forget_custom(&self, alias: &str, target_user_id: &str) {
        self.inner
            .custom
            .lock()
            .retain(|event| !(event.alias == alias && event.target_user_id == target_user_id));
    }

    pub async fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
        self.inner.registry.unsubscribe(id).await
    }

    /// Connect and serve until [`shutdown`](Self::shutdown) or a fatal error.
    /// A client can be run again after a previous run ended.
    pub async fn run(&self) -> Result<()> {
        let rx = self
            .notifications
            .lock()
            .take()
            .ok_or_else(|| TwitchError::Fatal("client is already running".into()))?;
        let cancel = {
            let mut current = self.cancel.lock();
            if current.is_cancelled() {
                *current = CancellationToken::new();
            }
            current.clone()
        };

        let stop_dispatch = CancellationToken::new();
        let dispatch = self.inner.dispatcher.spawn(rx, stop_dispatch.clone());
        let outcome = self.session.run(cancel).await;

        stop_dispatch.cancel();
        match dispatch.await {
            Ok(mut rx) => {
                // Anything still queued belongs to the session that just ended.
                let mut stale = 0;
                while rx.try_recv().is_ok() {
                    stale += 1;
                }
                if stale > 0 {
                    info!("Discarded {} undelivered notifications", stale);
                }
                *self.notifications.lock() = Some(rx);
            }
            Err(e) => warn!("Dispatcher task failed: {}", e),
        }
        outcome
    }

    pub fn shutdown(&self) {
        self.cancel.lock().cancel();
    }

    pub async fn wait_until_ready(&self, limit: Duration) -> Result<()> {
        self.session.wait_until_ready(limit).await
    }

    pub fn status(&self) -> SessionStatus {
        self.session.status()
    }

    pub fn session(&self) -> Option<Session> {
        self.session.session()
    }

    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.inner.registry.snapshot()
    }

    pub fn total_cost(&self) -> u32 {
        self.inner.registry.total_cost()
    }

    pub fn remaining_budget(&self) -> u32 {
        self.inner.registry.remaining_budget()
    }

    /// Account-wide ceiling last reported by the server, 0 before the first
    /// confirmed subscription.
    pub fn max_total_cost(&self) -> u32 {
        self.inner.registry.server_max_total_cost()
    }

    pub fn lookups(&self) -> &Lookups {
        &self.lookups
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.inner.registry
    }
}
