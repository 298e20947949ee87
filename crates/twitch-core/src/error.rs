use thiserror::Error;

/// Rejections returned synchronously to the caller that attempted an action.
/// These are expected outcomes and are never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("Over budget: requested {requested}, remaining {remaining}")]
    OverBudget { requested: u32, remaining: u32 },

    #[error("Duplicate limit exceeded: {limit} live subscriptions for {subscription_type}")]
    DuplicateLimitExceeded {
        subscription_type: String,
        limit: usize,
    },

    #[error("Server cost limit exceeded: {0}")]
    CostExceeded(String),

    #[error("Subscription already exists: {0}")]
    AlreadyExists(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Unknown event: {0}")]
    UnknownEvent(String),
}

#[derive(Error, Debug, Clone)]
pub enum TwitchError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Admission(#[from] AdmissionError),

    #[error("Authorization error: {0}")]
    Authorization(String),

    #[error("Fatal error: {0}")]
    Fatal(String),

    /// An event handler returned an error or panicked.
    #[error("Handler failed: {0}")]
    Handler(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("No active session")]
    NotConnected,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl TwitchError {
    /// Network drops, timeouts and server-side hiccups. Callers retry these
    /// with backoff and never surface them as fatal.
    pub fn is_transient(&self) -> bool {
        match self {
            TwitchError::Transport(_) | TwitchError::Timeout(_) => true,
            TwitchError::Http { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    pub fn is_admission(&self) -> bool {
        matches!(self, TwitchError::Admission(_))
    }

    pub fn is_authorization(&self) -> bool {
        matches!(self, TwitchError::Authorization(_))
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, TwitchError::Fatal(_))
    }
}

impl From<serde_json::Error> for TwitchError {
    fn from(e: serde_json::Error) -> Self {
        TwitchError::Serialization(e.to_string())
    }
}

impl From<std::io::Error> for TwitchError {
    fn from(e: std::io::Error) -> Self {
        TwitchError::Storage(e.to_string())
    }
}

impl From<reqwest::Error> for TwitchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            TwitchError::Timeout(e.to_string())
        } else {
            TwitchError::Transport(e.to_string())
        }
    }
}

impl From<reqwest_middleware::Error> for TwitchError {
    fn from(e: reqwest_middleware::Error) -> Self {
        match e {
            reqwest_middleware::Error::Reqwest(inner) => inner.into(),
            reqwest_middleware::Error::Middleware(inner) => TwitchError::Transport(inner.to_string()),
        }
    }
}

impl From<toml::de::Error> for TwitchError {
    fn from(e: toml::de::Error) -> Self {
        TwitchError::InvalidConfig(e.to_string())
    }
}

impl From<tokio::task::JoinError> for TwitchError {
    fn from(e: tokio::task::JoinError) -> Self {
        TwitchError::Fatal(format!("Task failed: {}", e))
    }
}

pub type Result<T> = std::result::Result<T, TwitchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(TwitchError::Transport("reset".into()).is_transient());
        assert!(TwitchError::Timeout("read".into()).is_transient());
        assert!(TwitchError::Http {
            status: 503,
            message: "unavailable".into()
        }
        .is_transient());
        assert!(!TwitchError::Http {
            status: 400,
            message: "bad request".into()
        }
        .is_transient());
        assert!(!TwitchError::Fatal("revoked".into()).is_transient());
    }

    #[test]
    fn admission_errors_are_distinguishable() {
        let err: TwitchError = AdmissionError::OverBudget {
            requested: 3,
            remaining: 2,
        }
        .into();

        assert!(err.is_admission());
        assert!(!err.is_transient());
        assert!(!err.is_fatal());
        assert_eq!(err.to_string(), "Over budget: requested 3, remaining 2");
    }
}
