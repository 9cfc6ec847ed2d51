use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// The push stream did not signal open within the configured timeout.
    #[error("timed out waiting for the stream to open")]
    ConnectTimeout,

    /// The one-shot credential refresh failed; the attempt is over.
    #[error("credential refresh failed: {0}")]
    CredentialRefresh(String),

    /// Every post-refresh reconnect attempt failed.
    #[error("failed to open stream after refresh and {attempts} retries: {last}")]
    RetriesExhausted { attempts: u32, last: String },

    /// Wire-level failure, either at open or mid-stream. No server payload
    /// is available, so callers surface a generic message.
    #[error("stream transport error: {0}")]
    Transport(String),

    /// The server pushed an explicit `error` event; the message is shown to
    /// the user verbatim.
    #[error("{0}")]
    Stream(String),

    /// A turn is already streaming for this conversation.
    #[error("a turn is already in progress for session {0}")]
    TurnInProgress(String),

    #[error("unknown session {0}")]
    UnknownSession(String),

    /// The synchronous clarification-response API rejected the choice.
    #[error("clarification response rejected: {0}")]
    ClarificationRejected(String),

    #[error("invalid engine config: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
