use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use twitch_core::{Result, TwitchError};

/// What the session loop sees from a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Text(String),
    /// The peer sent a close frame.
    Closed { code: Option<u16>, reason: String },
}

/// One open connection to the gateway.
#[async_trait]
pub trait FrameStream: Send {
    /// Next message, or `None` once the stream ended without a close frame.
    async fn next_message(&mut self) -> Option<Result<WireMessage>>;

    async fn close(&mut self);
}

/// Opens connections. Tests swap in a scripted implementation.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn FrameStream>>;
}

/// `tokio-tungstenite` connector.
pub struct WsConnector {
    connect_timeout: Duration,
}

impl WsConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn FrameStream>> {
        debug!("Opening websocket to {}", url);
        let connected = tokio::time::timeout(self.connect_timeout, connect_async(url)).await;

        match connected {
            Ok(Ok((stream, _))) => Ok(Box::new(WsStream { inner: stream })),
            Ok(Err(e)) => Err(TwitchError::Transport(format!(
                "websocket connect to {} failed: {}",
                url, e
            ))),
            Err(_) => Err(TwitchError::Timeout(format!(
                "websocket connect to {} timed out after {:?}",
                url, self.connect_timeout
            ))),
        }
    }
}

struct WsStream {
    inner: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl FrameStream for WsStream {
    async fn next_message(&mut self) -> Option<Result<WireMessage>> {
        loop {
            match self.inner.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(WireMessage::Text(text.to_string()))),
                Ok(Message::Close(frame)) => {
                    let (code, reason) = match frame {
                        Some(f) => (Some(u16::from(f.code)), f.reason.to_string()),
                        None => (None, String::new()),
                    };
                    return Some(Ok(WireMessage::Closed { code, reason }));
                }
                Ok(Message::Binary(bytes)) => {
                    warn!("Ignoring {} byte binary frame", bytes.len());
                }
                // Pings are answered by tungstenite on the next read.
                Ok(_) => {}
                Err(e) => return Some(Err(TwitchError::Transport(e.to_string()))),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.inner.send(Message::Close(None)).await {
            debug!("Websocket close failed: {}", e);
        }
    }
}
