//! Shared building blocks for the EventSub client: error taxonomy,
//! configuration, data model, collaborator contracts, the resource cache and
//! the Helix HTTP client.

pub mod api;
pub mod backoff;
pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod http;
pub mod types;

pub use api::{DevicePoll, HelixApi, OAuthApi, RefreshOutcome, StaticToken, TokenSource};
pub use backoff::ExponentialBackoff;
pub use cache::{CacheKind, Lookups, ResourceCache};
pub use config::{ClientConfig, ReconnectConfig};
pub use error::{AdmissionError, Result, TwitchError};
pub use events::{ClientEvent, ObserverBus};
pub use http::HelixClient;
pub use types::*;
