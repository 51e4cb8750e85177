use thiserror::Error;

/// Failures surfaced to callers of the send API.
#[derive(Debug, Error)]
pub enum SendError {
    /// The session is not open (never paired, reconnecting, or logged out).
    #[error("WhatsApp is not connected")]
    NotConnected,

    /// The registration lookup found no account for the recipient.
    #[error("{0} is not registered on WhatsApp")]
    NotRegistered(String),

    /// Transport-level failure while dispatching, including timeouts.
    #[error("{0}")]
    SendFailure(String),
}

impl SendError {
    pub(crate) fn failure(err: anyhow::Error) -> Self {
        Self::SendFailure(format!("{err:#}"))
    }
}

/// Session persistence errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("session database error: {0}")]
    Db(#[from] sled::Error),

    #[error("credential encoding error: {0}")]
    Codec(#[from] postcard::Error),
}

/// Errors talking to the bridge process.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("failed to spawn bridge `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("bridge I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bridge request `{0}` timed out")]
    Timeout(String),

    #[error("bridge exited before answering `{0}`")]
    Closed(String),

    #[error("bridge error {code}: {message}")]
    Remote { code: i64, message: String },

    #[error("malformed bridge payload: {0}")]
    Json(#[from] serde_json::Error),
}
