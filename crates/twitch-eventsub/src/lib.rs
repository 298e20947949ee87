//! EventSub over websockets: wire frames, the session state machine,
//! subscription bookkeeping and notification dispatch, wired together by
//! [`EventSubClient`].

pub mod catalog;
pub mod client;
pub mod dispatcher;
pub mod frames;
pub mod registry;
pub mod session;
pub mod transport;

pub use catalog::{EventSpec, DEFAULT_EVENTS};
pub use client::{EventSubClient, EventSubClientBuilder};
pub use dispatcher::{EventDispatcher, EventHandler};
pub use frames::{parse_frame, Frame, Notification, SessionInfo};
pub use registry::{MigrationReport, Subscription, SubscriptionId, SubscriptionRegistry};
pub use session::{Session, SessionHooks, SessionStateMachine, SessionStatus};
pub use transport::{Connector, FrameStream, WireMessage, WsConnector};
