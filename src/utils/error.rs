//! Error types for the popmq consumer runtime.
//!
//! Business-level failures (timeouts, broker rejections, exhausted retry
//! ceilings) are returned to the caller. Heartbeat and transport faults are
//! absorbed by the broker link's reconnect cycle and only show up in logs.

use thiserror::Error;

/// Result type alias for popmq operations
pub type Result<T> = std::result::Result<T, MqError>;

#[derive(Error, Debug)]
pub enum MqError {
    /// No broker endpoint accepted registration while verification was on.
    #[error("registration failed: no broker accepted the consumer")]
    RegistrationFailed,

    /// A call received no response before its deadline.
    #[error("request {trace_id} timed out")]
    RequestTimeout { trace_id: String },

    #[error("subscribe to {topic} failed after {attempts} attempts")]
    SubscribeFailed { topic: String, attempts: u32 },

    #[error("unsubscribe from {topic} failed after {attempts} attempts")]
    UnsubscribeFailed { topic: String, attempts: u32 },

    #[error("consumer status acknowledgement failed after {attempts} attempts")]
    AcknowledgeFailed { attempts: u32 },

    /// Link initialization already failed; no connection will ever be ready.
    #[error("broker link is not initialized")]
    NotInitialized,

    /// The link did not become ready within the wait window, or was stopped.
    #[error("broker link unavailable: {0}")]
    LinkUnavailable(String),

    #[error("unsupported inbound method: {0}")]
    UnsupportedMethod(String),

    /// Reachability verification was on and no endpoint could be opened.
    #[error("no reachable broker among {0}")]
    NoReachableBroker(String),

    #[error("duplicate trace id: {0}")]
    DuplicateTraceId(String),

    /// The broker answered with a non-success response code.
    #[error("broker rejected request: {code} {message}")]
    Rejected { code: String, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("frame error: {0}")]
    Frame(String),

    #[error("invalid broker endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl MqError {
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::RequestTimeout { .. })
    }

    /// Errors no retry can fix: the link never initialized, or the request
    /// cannot be framed.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::NotInitialized | Self::Frame(_))
    }
}

impl From<config::ConfigError> for MqError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}
