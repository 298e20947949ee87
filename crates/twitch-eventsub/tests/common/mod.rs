#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use twitch_core::{
    AdmissionError, ChannelInfo, CreateSubscriptionRequest, CreatedSubscription, HelixApi,
    Result, StreamInfo, TwitchError,
};
use twitch_eventsub::{Connector, FrameStream, WireMessage};

/// In-memory Helix subscription endpoint.
#[derive(Default)]
pub struct FakeHelix {
    pub requests: Mutex<Vec<CreateSubscriptionRequest>>,
    pub deleted: Mutex<Vec<String>>,
    /// Subscription types the server refuses with 403.
    pub forbidden: Mutex<Vec<String>>,
    next_id: AtomicUsize,
}

impl FakeHelix {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn forbid(&self, subscription_type: &str) {
        self.forbidden.lock().push(subscription_type.to_string());
    }

    pub fn sessions_used(&self) -> Vec<String> {
        self.requests
            .lock()
            .iter()
            .map(|request| request.transport.session_id.clone())
            .collect()
    }

    pub fn types_requested(&self) -> Vec<String> {
        self.requests
            .lock()
            .iter()
            .map(|request| request.subscription_type.clone())
            .collect()
    }
}

#[async_trait]
impl HelixApi for FakeHelix {
    async fn create_subscription(
        &self,
        request: &CreateSubscriptionRequest,
    ) -> Result<CreatedSubscription> {
        self.requests.lock().push(request.clone());
        if self.forbidden.lock().contains(&request.subscription_type) {
            return Err(AdmissionError::Forbidden(request.subscription_type.clone()).into());
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(CreatedSubscription {
            id: format!("remote-{}", id),
            status: "enabled".into(),
            cost: 1,
            total_cost: id as u32 + 1,
            max_total_cost: 10,
        })
    }

    async fn delete_subscription(&self, id: &str) -> Result<()> {
        self.deleted.lock().push(id.to_string());
        Ok(())
    }

    async fn get_channel(&self, broadcaster_id: &str) -> Result<ChannelInfo> {
        Err(TwitchError::NotFound(broadcaster_id.to_string()))
    }

    async fn get_stream(&self, _user_id: &str) -> Result<Option<StreamInfo>> {
        Ok(None)
    }
}

/// Test side of one scripted connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    tx: mpsc::UnboundedSender<WireMessage>,
    closed: Arc<AtomicBool>,
}

impl ConnectionHandle {
    pub fn send_text(&self, text: String) {
        let _ = self.tx.send(WireMessage::Text(text));
    }

    pub fn send_close(&self, code: u16, reason: &str) {
        let _ = self.tx.send(WireMessage::Closed {
            code: Some(code),
            reason: reason.to_string(),
        });
    }

    /// True once the client closed its end.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct ScriptedStream {
    rx: mpsc::UnboundedReceiver<WireMessage>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl FrameStream for ScriptedStream {
    async fn next_message(&mut self) -> Option<Result<WireMessage>> {
        self.rx.recv().await.map(Ok)
    }

    async fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Hands out prepared connections in order and refuses once they run out.
#[derive(Default)]
pub struct ScriptedConnector {
    prepared: Mutex<VecDeque<ScriptedStream>>,
    urls: Mutex<Vec<String>>,
}

impl ScriptedConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn prepare(&self) -> ConnectionHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        self.prepared.lock().push_back(ScriptedStream {
            rx,
            closed: closed.clone(),
        });
        ConnectionHandle { tx, closed }
    }

    /// Every URL a connection was attempted to, refused ones included.
    pub fn urls(&self) -> Vec<String> {
        self.urls.lock().clone()
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn FrameStream>> {
        self.urls.lock().push(url.to_string());
        let next = self.prepared.lock().pop_front();
        match next {
            Some(stream) => Ok(Box::new(stream)),
            None => Err(TwitchError::Transport(format!("connection to {} refused", url))),
        }
    }
}

fn metadata(message_id: &str, message_type: &str) -> serde_json::Value {
    json!({
        "message_id": message_id,
        "message_type": message_type,
        "message_timestamp": "2024-05-01T12:00:00.000Z"
    })
}

pub fn welcome(session_id: &str, keepalive_secs: u64) -> String {
    json!({
        "metadata": metadata(&format!("welcome-{}", session_id), "session_welcome"),
        "payload": {
            "session": {
                "id": session_id,
                "status": "connected",
                "keepalive_timeout_seconds": keepalive_secs,
                "reconnect_url": null,
                "connected_at": "2024-05-01T12:00:00.000Z"
            }
        }
    })
    .to_string()
}

pub fn keepalive(message_id: &str) -> String {
    json!({
        "metadata": metadata(message_id, "session_keepalive"),
        "payload": {}
    })
    .to_string()
}

pub fn notification(message_id: &str, subscription_type: &str, broadcaster: &str) -> String {
    json!({
        "metadata": metadata(message_id, "notification"),
        "payload": {
            "subscription": {
                "id": "remote-0",
                "type": subscription_type,
                "version": "1",
                "status": "enabled",
                "cost": 1,
                "condition": { "broadcaster_user_id": broadcaster },
                "transport": { "method": "websocket", "session_id": "abc" },
                "created_at": "2024-05-01T12:00:00.000Z"
            },
            "event": {
                "broadcaster_user_id": broadcaster,
                "broadcaster_user_login": "streamer",
                "type": "live"
            }
        }
    })
    .to_string()
}

pub fn reconnect(session_id: &str, url: &str) -> String {
    json!({
        "metadata": metadata(&format!("reconnect-{}", session_id), "session_reconnect"),
        "payload": {
            "session": {
                "id": session_id,
                "status": "reconnecting",
                "keepalive_timeout_seconds": null,
                "reconnect_url": url,
                "connected_at": "2024-05-01T12:00:00.000Z"
            }
        }
    })
    .to_string()
}

pub fn revocation(remote_id: &str, subscription_type: &str, reason: &str) -> String {
    json!({
        "metadata": metadata("revocation-1", "revocation"),
        "payload": {
            "subscription": {
                "id": remote_id,
                "type": subscription_type,
                "version": "1",
                "status": reason,
                "cost": 1,
                "condition": { "broadcaster_user_id": "42" },
                "transport": { "method": "websocket", "session_id": "abc" },
                "created_at": "2024-05-01T12:00:00.000Z"
            }
        }
    })
    .to_string()
}

/// Let spawned tasks run without moving the paused clock far.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}
