//! Server error types.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Result type for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Invalid configuration: {field} - {reason}")]
    InvalidConfig { field: &'static str, reason: String },

    #[error("Invalid protocol '{0}', expected tcp, udp or both")]
    InvalidProtocol(String),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("Server is already listening")]
    AlreadyListening,

    #[error("Failed to start server runtime: {0}")]
    Runtime(#[source] io::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ServerError {
    pub fn config_invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_message() {
        let err = ServerError::config_invalid("max_clients", "must be at least 1");
        assert_eq!(
            err.to_string(),
            "Invalid configuration: max_clients - must be at least 1"
        );
    }

    #[test]
    fn test_bind_error_keeps_source() {
        let addr: SocketAddr = "127.0.0.1:80".parse().unwrap();
        let err = ServerError::Bind {
            addr,
            source: io::Error::new(io::ErrorKind::AddrInUse, "in use"),
        };
        assert!(err.to_string().starts_with("Failed to bind 127.0.0.1:80"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
