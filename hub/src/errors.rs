use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("MQTT error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Channel send error")]
    ChannelSend,

    #[error("Device not found")]
    NotFound,

    #[error("Invalid device credential")]
    InvalidCredential,

    #[error("Device is inactive")]
    Inactive,

    #[error("Invalid or expired token")]
    InvalidToken,

    #[error("Device is not authorized")]
    Forbidden,

    #[error("Invalid time range: {0}")]
    InvalidRange(String),

    #[error("Hashing error: {0}")]
    Hash(#[from] bcrypt::BcryptError),

    #[error("Blocking task error: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Transient failures the caller may retry; everything else is final
    /// for the message that triggered it.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::ChannelSend | Error::Database(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(Error::ChannelSend.is_retryable());
        assert!(!Error::InvalidToken.is_retryable());
        assert!(!Error::Validation("bad".to_string()).is_retryable());
        assert!(!Error::Forbidden.is_retryable());
    }
}
