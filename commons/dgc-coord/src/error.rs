use thiserror::Error;

/// Errors surfaced by coordination service drivers
#[derive(Debug, Error)]
pub enum CoordError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Coordination backend error: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Subscription channel closed")]
    ChannelClosed,
}

impl CoordError {
    pub fn connection<T: ToString>(msg: T) -> Self {
        Self::Connection(msg.to_string())
    }

    pub fn backend<T: ToString>(msg: T) -> Self {
        Self::Backend(msg.to_string())
    }

    pub fn serialization<T: ToString>(msg: T) -> Self {
        Self::Serialization(msg.to_string())
    }
}

/// Result type for coordination operations
pub type CoordResult<T> = Result<T, CoordError>;
