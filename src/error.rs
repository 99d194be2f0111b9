//! wolfdoc Error Types

use thiserror::Error;

/// Result type alias for wolfdoc operations
pub type Result<T> = std::result::Result<T, Error>;

/// wolfdoc error types
#[derive(Error, Debug, Clone)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(String),

    #[error("Invalid connection URL: {0}")]
    InvalidUrl(String),

    // Network errors
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    #[error("Socket timeout talking to {0}")]
    SocketTimeout(String),

    #[error("Socket to {0} was closed")]
    SocketClosed(String),

    // Pool and topology errors
    #[error("Per-server connection limit reached for {0}")]
    PoolLimit(String),

    #[error("no reachable servers")]
    NoReachableServers,

    #[error("Server {address} belongs to replica set {actual:?}, expected {expected}")]
    SetNameMismatch {
        address: String,
        expected: String,
        actual: Option<String>,
    },

    // Protocol errors
    #[error("Command failed ({code}): {message}")]
    Command { code: i32, message: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Codec error: {0}")]
    Codec(String),

    // Authentication errors
    #[error("Authentication failed for {user}@{database}: {reason}")]
    Auth {
        user: String,
        database: String,
        reason: String,
    },

    // Internal errors
    #[error("Invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Session already closed")]
    SessionClosed,

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Codec(e.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::ConfigParse(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Codec(e.to_string())
    }
}

impl Error {
    /// Check if this error is transient and worth retrying later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Network(_)
                | Error::ConnectionFailed { .. }
                | Error::ConnectionTimeout(_)
                | Error::SocketTimeout(_)
                | Error::PoolLimit(_)
                | Error::NoReachableServers
        )
    }

    /// Check if this error means the socket that produced it is unusable
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::Network(_)
                | Error::SocketTimeout(_)
                | Error::SocketClosed(_)
                | Error::Protocol(_)
                | Error::Codec(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(Error::NoReachableServers.is_retryable());
        assert!(Error::PoolLimit("a:1".into()).is_retryable());
        assert!(!Error::Command { code: 13, message: "unauthorized".into() }.is_retryable());

        assert!(Error::Protocol("short frame".into()).is_connection_fatal());
        assert!(!Error::Command { code: 2, message: "bad".into() }.is_connection_fatal());
        assert!(!Error::PoolLimit("a:1".into()).is_connection_fatal());
    }

    #[test]
    fn test_auth_error_names_user_and_database() {
        let err = Error::Auth {
            user: "app".into(),
            database: "admin".into(),
            reason: "bad password".into(),
        };
        assert_eq!(err.to_string(), "Authentication failed for app@admin: bad password");
        assert!(std::error::Error::source(&err).is_none());
    }

    #[test]
    fn test_io_conversion_keeps_message() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        let err: Error = io.into();
        assert!(err.to_string().contains("reset by peer"));
    }
}
