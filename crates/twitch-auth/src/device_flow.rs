use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use twitch_core::{AuthGrant, ClientEvent, DevicePoll, OAuthApi, ObserverBus, PendingDeviceAuth};

use crate::error::{AuthError, AuthResult};

/// Polling stops this long before the code's stated expiry.
const EXPIRY_GRACE: Duration = Duration::from_secs(15);
/// Added to the interval each time the server asks us to slow down.
const SLOW_DOWN_STEP: Duration = Duration::from_secs(5);
const MIN_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceFlowState {
    Idle,
    CodeIssued,
    Polling,
    Authorized,
    Denied,
    Expired,
    Cancelled,
}

impl fmt::Display for DeviceFlowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceFlowState::Idle => write!(f, "idle"),
            DeviceFlowState::CodeIssued => write!(f, "code_issued"),
            DeviceFlowState::Polling => write!(f, "polling"),
            DeviceFlowState::Authorized => write!(f, "authorized"),
            DeviceFlowState::Denied => write!(f, "denied"),
            DeviceFlowState::Expired => write!(f, "expired"),
            DeviceFlowState::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeviceFlowOutcome {
    Authorized(AuthGrant),
    /// The caller stopped the flow. Not an error.
    Cancelled,
}

/// One device authorization attempt at a time.
pub struct DeviceAuthFlow {
    oauth: Arc<dyn OAuthApi>,
    scopes: Vec<String>,
    state: Mutex<DeviceFlowState>,
    pending: Mutex<Option<PendingDeviceAuth>>,
    events: ObserverBus,
}

impl DeviceAuthFlow {
    pub fn new(oauth: Arc<dyn OAuthApi>, scopes: Vec<String>) -> Self {
        Self {
            oauth,
            scopes,
            state: Mutex::new(DeviceFlowState::Idle),
            pending: Mutex::new(None),
            events: ObserverBus::detached(),
        }
    }

    pub fn with_event_channel(mut self, events: ObserverBus) -> Self {
        self.events = events;
        self
    }

    pub fn state(&self) -> DeviceFlowState {
        *self.state.lock()
    }

    pub fn pending(&self) -> Option<PendingDeviceAuth> {
        self.pending.lock().clone()
    }

    fn set_state(&self, state: DeviceFlowState) {
        let mut current = self.state.lock();
        if *current != state {
            debug!("Device flow {} -> {}", *current, state);
            *current = state;
        }
    }

    /// Obtain a device code. The user code is surfaced through the
    /// `AuthCodeIssued` event and the returned value.
    pub async fn request_code(&self) -> AuthResult<PendingDeviceAuth> {
        let pending = self.oauth.request_device_code(&self.scopes).await?;
        info!(
            "Device code issued; enter {} at {}",
            pending.user_code, pending.verification_uri
        );
        *self.pending.lock() = Some(pending.clone());
        self.set_state(DeviceFlowState::CodeIssued);
        self.events.emit(ClientEvent::AuthCodeIssued {
            user_code: pending.user_code.clone(),
            verification_uri: pending.verification_uri.clone(),
            expires_at: pending.expires_at,
        });
        Ok(pending)
    }

    /// Poll until the user authorizes, denies, the code expires, or `cancel`
    /// fires. Pending and slow-down responses keep the loop going.
    pub async fn poll_until_authorized(
        &self,
        cancel: &CancellationToken,
    ) -> AuthResult<DeviceFlowOutcome> {
        let pending = self.pending().ok_or(AuthError::NoPendingCode)?;
        let deadline = Instant::now() + pending.time_remaining().saturating_sub(EXPIRY_GRACE);
        let mut interval = pending.interval.max(MIN_INTERVAL);
        self.set_state(DeviceFlowState::Polling);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(self.cancelled()),
                _ = sleep(interval) => {}
            }

            if Instant::now() >= deadline {
                return Err(self.finish_with(DeviceFlowState::Expired, AuthError::Expired));
            }

            let poll = tokio::select! {
                _ = cancel.cancelled() => return Ok(self.cancelled()),
                poll = self.oauth.poll_device_token(&pending.device_code, &self.scopes) => poll,
            };

            match poll {
                Ok(DevicePoll::Granted(grant)) => {
                    info!("Device authorization granted");
                    self.set_state(DeviceFlowState::Authorized);
                    *self.pending.lock() = None;
                    return Ok(DeviceFlowOutcome::Authorized(grant));
                }
                Ok(DevicePoll::Pending) => {
                    debug!("Authorization pending");
                }
                Ok(DevicePoll::SlowDown) => {
                    interval += SLOW_DOWN_STEP;
                    debug!("Server asked to slow down, polling every {:?}", interval);
                }
                Ok(DevicePoll::Denied) => {
                    return Err(self.finish_with(DeviceFlowState::Denied, AuthError::Denied));
                }
                Ok(DevicePoll::Expired) => {
                    return Err(self.finish_with(DeviceFlowState::Expired, AuthError::Expired));
                }
                Err(e) if e.is_transient() => {
                    warn!("Device poll failed, retrying: {}", e);
                }
                Err(e) => {
                    *self.pending.lock() = None;
                    self.set_state(DeviceFlowState::Idle);
                    return Err(e.into());
                }
            }
        }
    }

    /// Request a code and poll it to completion.
    pub async fn authorize(&self, cancel: &CancellationToken) -> AuthResult<DeviceFlowOutcome> {
        self.request_code().await?;
        self.poll_until_authorized(cancel).await
    }

    fn cancelled(&self) -> DeviceFlowOutcome {
        info!("Device authorization cancelled");
        *self.pending.lock() = None;
        self.set_state(DeviceFlowState::Cancelled);
        DeviceFlowOutcome::Cancelled
    }

    fn finish_with(&self, state: DeviceFlowState, error: AuthError) -> AuthError {
        warn!("Device authorization ended: {}", error);
        *self.pending.lock() = None;
        self.set_state(state);
        error
    }
}
