use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::RwLock;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use twitch_core::{ClientEvent, ObserverBus, TwitchError};

use crate::catalog;
use crate::frames::Notification;

/// Receives notifications for the event types it was registered for.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, notification: Arc<Notification>) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> EventHandler for F
where
    F: Fn(Arc<Notification>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, notification: Arc<Notification>) -> anyhow::Result<()> {
        (self)(notification).await
    }
}

type Handlers = Vec<Arc<dyn EventHandler>>;

/// Routes notifications to built-in handlers (keyed by subscription type) and
/// custom handlers (keyed by subscription type and target user).
///
/// Built-in handlers only see events about the client's own user. Handlers
/// for one notification run concurrently; the next notification is not
/// dispatched until they all finished.
pub struct EventDispatcher {
    builtin: DashMap<String, Handlers>,
    custom: DashMap<(String, String), Handlers>,
    client_user: RwLock<Option<String>>,
    events: ObserverBus,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self {
            builtin: DashMap::new(),
            custom: DashMap::new(),
            client_user: RwLock::new(None),
            events: ObserverBus::detached(),
        }
    }

    pub fn with_event_channel(mut self, events: ObserverBus) -> Self {
        self.events = events;
        self
    }

    pub fn set_client_user(&self, user_id: impl Into<String>) {
        *self.client_user.write() = Some(user_id.into());
    }

    pub fn on(&self, subscription_type: &str, handler: Arc<dyn EventHandler>) {
        self.builtin
            .entry(subscription_type.to_string())
            .or_default()
            .push(handler);
    }

    pub fn add_custom(
        &self,
        subscription_type: &str,
        user_id: &str,
        handler: Arc<dyn EventHandler>,
    ) {
        self.custom
            .entry((subscription_type.to_string(), user_id.to_string()))
            .or_default()
            .push(handler);
    }

    /// Drop every custom handler for the pair. Returns how many were removed.
    pub fn remove_custom(&self, subscription_type: &str, user_id: &str) -> usize {
        self.custom
            .remove(&(subscription_type.to_string(), user_id.to_string()))
            .map(|(_, handlers)| handlers.len())
            .unwrap_or(0)
    }

    pub fn has_builtin(&self, subscription_type: &str) -> bool {
        self.builtin
            .get(subscription_type)
            .map(|handlers| !handlers.is_empty())
            .unwrap_or(false)
    }

    fn handlers_for(&self, notification: &Notification) -> Handlers {
        let subscription_type = notification.subscription_type();
        let target = target_user(notification);
        let mut handlers = Handlers::new();

        let own_event = match (&target, self.client_user.read().as_deref()) {
            (None, _) => true,
            (Some(target), Some(client)) => target == client,
            (Some(_), None) => false,
        };
        if own_event {
            if let Some(builtin) = self.builtin.get(subscription_type) {
                handlers.extend(builtin.iter().cloned());
            }
        }
        if let Some(target) = target {
            if let Some(custom) = self.custom.get(&(subscription_type.to_string(), target)) {
                handlers.extend(custom.iter().cloned());
            }
        }
        handlers
    }

    /// Run every matching handler and wait for all of them. Handler errors and
    /// panics are logged and reported to observers, never propagated.
    pub async fn dispatch(&self, notification: Arc<Notification>) {
        let handlers = self.handlers_for(&notification);
        let subscription_type = notification.subscription_type().to_string();
        if handlers.is_empty() {
            debug!("No handler for {}", subscription_type);
            return;
        }

        let tasks = handlers.into_iter().map(|handler| {
            let notification = notification.clone();
            tokio::spawn(async move { handler.handle(notification).await })
        });

        for outcome in join_all(tasks).await {
            let failure = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => format!("{:#}", e),
                Err(join) => format!("handler panicked: {}", join),
            };
            error!("Handler for {} failed: {}", subscription_type, failure);
            self.events.emit(ClientEvent::error(
                subscription_type.clone(),
                TwitchError::Handler(failure),
                Some(notification.message_id.clone()),
            ));
        }
    }

    /// Consume notifications in arrival order until the channel closes or
    /// `cancel` fires. The task hands the receiver back when it stops.
    pub fn spawn(
        self: &Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<Arc<Notification>>,
        cancel: CancellationToken,
    ) -> JoinHandle<mpsc::UnboundedReceiver<Arc<Notification>>> {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let notification = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    next = rx.recv() => match next {
                        Some(notification) => notification,
                        None => break,
                    },
                };
                dispatcher.dispatch(notification).await;
            }
            debug!("Dispatcher stopped");
            rx
        })
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

/// The user an event is about, from the subscription condition.
fn target_user(notification: &Notification) -> Option<String> {
    catalog::by_type(notification.subscription_type())
        .and_then(|spec| spec.target_key)
        .and_then(|key| notification.condition_value(key))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::SubscriptionMeta;
    use chrono::Utc;
    use parking_lot::Mutex;
    use std::time::Duration;
    use twitch_core::condition;

    fn notification(
        message_id: &str,
        subscription_type: &str,
        broadcaster: &str,
    ) -> Arc<Notification> {
        Arc::new(Notification {
            message_id: message_id.to_string(),
            subscription: SubscriptionMeta {
                id: "sub".into(),
                subscription_type: subscription_type.to_string(),
                version: "1".into(),
                status: "enabled".into(),
                cost: 0,
                condition: condition([("broadcaster_user_id", broadcaster)]),
            },
            event: serde_json::json!({}),
            timestamp: Utc::now(),
        })
    }

    fn recorder(log: Arc<Mutex<Vec<String>>>, tag: &'static str) -> Arc<dyn EventHandler> {
        Arc::new(move |n: Arc<Notification>| {
            let log = log.clone();
            async move {
                log.lock().push(format!("{}:{}", tag, n.message_id));
                anyhow::Ok(())
            }
        })
    }

    #[tokio::test]
    async fn builtin_handlers_only_see_own_user() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = EventDispatcher::new();
        dispatcher.set_client_user("42");
        dispatcher.on("stream.online", recorder(log.clone(), "builtin"));
        dispatcher.add_custom("stream.online", "7", recorder(log.clone(), "custom"));

        dispatcher.dispatch(notification("m1", "stream.online", "42")).await;
        dispatcher.dispatch(notification("m2", "stream.online", "7")).await;
        dispatcher.dispatch(notification("m3", "stream.online", "99")).await;

        assert_eq!(*log.lock(), vec!["builtin:m1".to_string(), "custom:m2".to_string()]);
    }

    #[tokio::test]
    async fn failing_handler_does_not_block_others() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (bus, mut events) = ObserverBus::new(8);
        let dispatcher = EventDispatcher::new().with_event_channel(bus);
        dispatcher.set_client_user("42");

        dispatcher.on(
            "stream.online",
            Arc::new(|_n: Arc<Notification>| async { Err::<(), _>(anyhow::anyhow!("boom")) }),
        );
        dispatcher.on(
            "stream.online",
            Arc::new(|n: Arc<Notification>| async move {
                if !n.message_id.is_empty() {
                    panic!("handler bug");
                }
                anyhow::Ok(())
            }),
        );
        dispatcher.on("stream.online", recorder(log.clone(), "ok"));

        dispatcher.dispatch(notification("m1", "stream.online", "42")).await;

        assert_eq!(*log.lock(), vec!["ok:m1".to_string()]);
        let mut errors = 0;
        while let Ok(event) = events.try_recv() {
            if let ClientEvent::Error { event_name, error, context } = event {
                assert_eq!(event_name, "stream.online");
                assert!(matches!(error, TwitchError::Handler(_)));
                assert_eq!(context.as_deref(), Some("m1"));
                errors += 1;
            }
        }
        assert_eq!(errors, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn messages_are_dispatched_in_arrival_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = Arc::new(EventDispatcher::new());
        dispatcher.set_client_user("42");

        let slow_log = log.clone();
        dispatcher.on(
            "stream.online",
            Arc::new(move |n: Arc<Notification>| {
                let log = slow_log.clone();
                async move {
                    // First message takes longest; order must still hold.
                    let delay = if n.message_id == "m1" { 50 } else { 1 };
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    log.lock().push(n.message_id.clone());
                    anyhow::Ok(())
                }
            }),
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let handle = dispatcher.spawn(rx, cancel.clone());
        for id in ["m1", "m2", "m3"] {
            tx.send(notification(id, "stream.online", "42")).unwrap();
        }
        drop(tx);
        handle.await.unwrap();

        assert_eq!(*log.lock(), vec!["m1", "m2", "m3"]);
    }

    #[test]
    fn removing_custom_handlers() {
        let dispatcher = EventDispatcher::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        dispatcher.add_custom("channel.raid", "7", recorder(log.clone(), "a"));
        dispatcher.add_custom("channel.raid", "7", recorder(log, "b"));

        assert_eq!(dispatcher.remove_custom("channel.raid", "7"), 2);
        assert_eq!(dispatcher.remove_custom("channel.raid", "7"), 0);
        assert!(!dispatcher.has_builtin("channel.raid"));
    }
}
