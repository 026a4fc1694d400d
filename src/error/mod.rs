use thiserror::Error;

#[derive(Error, Debug)]
pub enum RealtimeError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// A command could not be delivered or was rejected on a live connection
    #[error("Transport error: {0}")]
    Transport(String),

    /// The initial connection or hub handshake failed
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// The server sent something the hub protocol does not allow
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl RealtimeError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    pub fn handshake(message: impl Into<String>) -> Self {
        Self::Handshake(message.into())
    }

    /// Stable code used for metrics labels and log fields
    pub fn code(&self) -> &'static str {
        match self {
            RealtimeError::Config(_) => "CONFIG_ERROR",
            RealtimeError::Transport(_) => "TRANSPORT_ERROR",
            RealtimeError::Handshake(_) => "HANDSHAKE_FAILURE",
            RealtimeError::Protocol(_) => "PROTOCOL_ERROR",
            RealtimeError::Serialization(_) => "SERIALIZATION_ERROR",
            RealtimeError::Http(_) => "HTTP_ERROR",
        }
    }

    /// Whether retrying the same operation later can succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RealtimeError::Transport(_) | RealtimeError::Handshake(_) | RealtimeError::Http(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, RealtimeError>;
