//! Credential acquisition and upkeep: the OAuth HTTP client, the device
//! authorization flow, the token authority and the on-disk token store.

pub mod device_flow;
pub mod error;
pub mod http;
pub mod store;
pub mod token;

pub use device_flow::{DeviceAuthFlow, DeviceFlowOutcome, DeviceFlowState};
pub use error::{AuthError, AuthResult};
pub use http::OAuthClient;
pub use store::TokenStore;
pub use token::{TokenAuthority, TokenStatus};
