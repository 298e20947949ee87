use thiserror::Error;
use twitch_core::TwitchError;

#[derive(Error, Debug, Clone)]
pub enum AuthError {
    #[error("Authorization denied by the user")]
    Denied,

    #[error("Device code expired before authorization completed")]
    Expired,

    #[error("No device code has been requested")]
    NoPendingCode,

    #[error(transparent)]
    Client(#[from] TwitchError),
}

impl From<AuthError> for TwitchError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::Client(inner) => inner,
            other => TwitchError::Authorization(other.to_string()),
        }
    }
}

pub type AuthResult<T> = std::result::Result<T, AuthError>;
