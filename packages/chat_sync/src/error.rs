use thiserror::Error;

/// Errors surfaced across the library boundary.
///
/// Transport-level failures (connect errors, unexpected disconnects) never
/// appear here — they resolve to connection state transitions. Only
/// per-request failures and programmer-facing contract violations are
/// returned as errors.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A REST request was rejected by the server or failed in flight.
    #[error("request failed: {0}")]
    Api(String),

    /// Operation referenced a conversation the store does not contain.
    #[error("unknown conversation: {0}")]
    UnknownConversation(String),

    /// Operation referenced a message the store does not contain.
    #[error("unknown message: {0}")]
    UnknownMessage(String),

    /// Settings file could not be read or written.
    #[error("settings io: {0}")]
    Io(#[from] std::io::Error),

    /// Settings file is not valid TOML.
    #[error("settings parse: {0}")]
    TomlDecode(#[from] toml::de::Error),

    /// Settings could not be encoded as TOML.
    #[error("settings encode: {0}")]
    TomlEncode(#[from] toml::ser::Error),
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        SyncError::Api(err.to_string())
    }
}
