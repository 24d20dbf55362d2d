use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Relay error: {0}")]
    RelayError(#[from] RelayError),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Internal server error: {0}")]
    InternalError(String),
}

// Implement conversion from config::ConfigError
impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

// Add conversion from std::io::Error
impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::InternalError(err.to_string())
    }
}

/// Errors raised while relaying messages between connections.
///
/// Everything except `Server` is contained at the connection boundary: it is
/// logged and, for `ParseFailure`, reported to the sender as an `error`
/// notification.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("Duplicate connection identifier: {0}")]
    DuplicateIdentifier(Uuid),

    #[error("Invalid payload: {0}")]
    ParseFailure(String),

    #[error("Send to connection {id} failed: {reason}")]
    SendFailure { id: Uuid, reason: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Connection closed by peer")]
    RemoteClose,

    #[error("Server error: {0}")]
    Server(String),
}

impl RelayError {
    pub fn send_failure(id: Uuid, reason: impl ToString) -> Self {
        RelayError::SendFailure {
            id,
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::AddrInUse, "address in use");
        let app_err: AppError = io_err.into();
        assert!(matches!(app_err, AppError::InternalError(_)));

        let config_err = config::ConfigError::NotFound(String::from("key not found"));
        let app_err: AppError = config_err.into();
        assert!(matches!(app_err, AppError::ConfigError(_)));

        let app_err: AppError = RelayError::RemoteClose.into();
        assert!(matches!(app_err, AppError::RelayError(RelayError::RemoteClose)));
    }

    #[test]
    fn test_error_display() {
        let id = Uuid::nil();
        let err = RelayError::DuplicateIdentifier(id);
        assert_eq!(
            err.to_string(),
            "Duplicate connection identifier: 00000000-0000-0000-0000-000000000000"
        );

        let err = RelayError::send_failure(id, "transport closed");
        assert_eq!(
            err.to_string(),
            "Send to connection 00000000-0000-0000-0000-000000000000 failed: transport closed"
        );

        let err = AppError::RelayError(RelayError::Server("bind failed".to_string()));
        assert_eq!(err.to_string(), "Relay error: Server error: bind failed");
    }
}
