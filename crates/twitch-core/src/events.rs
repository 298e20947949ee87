use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::TwitchError;
use crate::types::Condition;

/// Notifications surfaced to the surrounding application.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// A session reached `Welcomed`.
    Connected { session_id: String },
    /// First session is active and built-in subscriptions are confirmed.
    Ready { session_id: String },
    Disconnected { reason: String, will_retry: bool },
    /// Raw inbound frame, only when socket debugging is enabled.
    RawFrame { text: String },
    AuthCodeIssued {
        user_code: String,
        verification_uri: String,
        expires_at: DateTime<Utc>,
    },
    AuthGranted { user_id: Option<String> },
    TokenRefreshed { expires_at: DateTime<Utc> },
    SubscriptionFailed {
        subscription_type: String,
        condition: Condition,
        error: TwitchError,
    },
    SubscriptionRevoked {
        subscription_type: String,
        remote_id: String,
        reason: String,
    },
    Error {
        event_name: String,
        error: TwitchError,
        context: Option<String>,
    },
}

impl ClientEvent {
    pub fn error(event_name: impl Into<String>, error: TwitchError, context: Option<String>) -> Self {
        ClientEvent::Error {
            event_name: event_name.into(),
            error,
            context,
        }
    }
}

/// Bounded observer channel.
///
/// Emission never blocks: when the channel is full or the receiver is gone
/// the event is dropped and counted.
pub struct ObserverBus {
    tx: mpsc::Sender<ClientEvent>,
    dropped: Arc<AtomicU64>,
}

impl ObserverBus {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ClientEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// A bus nobody listens to. Every emit counts as dropped.
    pub fn detached() -> Self {
        let (bus, _rx) = Self::new(1);
        bus
    }

    pub fn emit(&self, event: ClientEvent) {
        if self.tx.try_send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl Clone for ObserverBus {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            dropped: Arc::clone(&self.dropped),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn bus_delivers_events() {
        let (bus, mut rx) = ObserverBus::new(10);

        bus.emit(ClientEvent::Connected {
            session_id: "abc".to_string(),
        });

        let received = timeout(Duration::from_millis(100), rx.recv())
            .await
            .expect("Should receive event")
            .expect("Event should exist");

        match received {
            ClientEvent::Connected { session_id } => assert_eq!(session_id, "abc"),
            other => panic!("Wrong event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn bus_drops_when_full() {
        let (bus, _rx) = ObserverBus::new(1);

        bus.emit(ClientEvent::Ready {
            session_id: "1".to_string(),
        });
        bus.emit(ClientEvent::Ready {
            session_id: "2".to_string(),
        });

        assert_eq!(bus.dropped_count(), 1);
    }

    #[test]
    fn detached_bus_counts_everything_as_dropped() {
        let bus = ObserverBus::detached();
        let clone = bus.clone();

        bus.emit(ClientEvent::RawFrame {
            text: "{}".to_string(),
        });

        assert!(clone.is_closed());
        assert_eq!(clone.dropped_count(), 1);
    }
}
