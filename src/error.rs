use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Terminal: the reconnect attempt budget was exhausted. The client must
    /// be treated as dead; buffered commands will never be delivered.
    #[error("Reconnection failed: retry attempts exhausted")]
    ReconnectionFailed,

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("Publish error: {0}")]
    PublishError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Connection closed")]
    ClosedError,
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<lapin::Error> for Error {
    fn from(value: lapin::Error) -> Self {
        Error::ConnectionError(value.to_string())
    }
}
